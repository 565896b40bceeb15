//! Merging registered payloads into one replacement table
//!
//! Payloads are registered while the interceptor is stopped. Starting the
//! interceptor fixes the container: modules are pinned, per-operation
//! handler lists are built and the set of operations to replace is decided.
//! The fixed result is immutable and shared with replacement functions
//! until the interceptor stops and the container is released.

use crate::addr::Addr;
use crate::error::{InterceptError, Result};
use crate::instrumentor::Replacement;
use crate::payload::Payload;
use crate::schema::OpsSchema;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Handler lists of one replaced operation
#[derive(Debug, Clone)]
pub(crate) struct HandlerLists {
    /// Fire when the object has an original operation
    pub(crate) pre: Arc<[Addr]>,
    pub(crate) post: Arc<[Addr]>,
    /// Fire when it has none; external handlers only
    pub(crate) default_pre: Arc<[Addr]>,
    pub(crate) default_post: Arc<[Addr]>,
}

impl HandlerLists {
    /// `(pre, post)` for an object with or without an original operation
    pub(crate) fn select(&self, has_original: bool) -> (Arc<[Addr]>, Arc<[Addr]>) {
        if has_original {
            (self.pre.clone(), self.post.clone())
        } else {
            (self.default_pre.clone(), self.default_post.clone())
        }
    }
}

#[derive(Default)]
struct ListBuilder {
    pre: Vec<Addr>,
    post: Vec<Addr>,
    default_pre: Vec<Addr>,
    default_post: Vec<Addr>,
}

impl ListBuilder {
    fn finish(self) -> HandlerLists {
        HandlerLists {
            pre: Arc::from(self.pre),
            post: Arc::from(self.post),
            default_pre: Arc::from(self.default_pre),
            default_post: Arc::from(self.default_post),
        }
    }
}

/// Outcome of fixing a container
#[derive(Debug)]
pub(crate) struct FixedPayloads {
    operations: BTreeMap<usize, HandlerLists>,
    replacements: Vec<Replacement>,
}

impl FixedPayloads {
    pub(crate) fn lists(&self, offset: usize) -> Option<&HandlerLists> {
        self.operations.get(&offset)
    }

    /// Replacement list for the instrumentor, in schema order
    pub(crate) fn replacements(&self) -> &[Replacement] {
        &self.replacements
    }
}

#[derive(Default)]
struct ContainerState {
    payloads: Vec<Arc<Payload>>,
    /// Payloads pinned by the last fix; `Some` while in use
    pinned: Option<Vec<Arc<Payload>>>,
}

pub(crate) struct PayloadContainer {
    schema: Arc<OpsSchema>,
    state: Mutex<ContainerState>,
}

impl PayloadContainer {
    pub(crate) fn new(schema: Arc<OpsSchema>) -> Self {
        Self {
            schema,
            state: Mutex::new(ContainerState::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, ContainerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn register(&self, payload: Arc<Payload>) -> Result<()> {
        let mut state = self.lock();
        if state.pinned.is_some() {
            return Err(InterceptError::Busy);
        }
        if state.payloads.iter().any(|p| Arc::ptr_eq(p, &payload)) {
            return Err(InterceptError::AlreadyExists);
        }
        for handler in payload.handlers() {
            let op = self
                .schema
                .find(handler.offset)
                .ok_or(InterceptError::UnknownOperation {
                    offset: handler.offset,
                })?;
            if handler.external && op.internal_only {
                tracing::warn!(
                    payload = payload.name(),
                    operation = op.name(),
                    "external handler refused on internal-only operation"
                );
                return Err(InterceptError::InternalOnly {
                    offset: handler.offset,
                });
            }
        }

        state
            .payloads
            .try_reserve(1)
            .map_err(|_| InterceptError::NoMemory)?;
        tracing::debug!(payload = payload.name(), schema = self.schema.name(), "payload registered");
        state.payloads.push(payload);
        Ok(())
    }

    pub(crate) fn unregister(&self, payload: &Arc<Payload>) -> Result<()> {
        let mut state = self.lock();
        if state.pinned.is_some() {
            return Err(InterceptError::Busy);
        }
        let index = state
            .payloads
            .iter()
            .position(|p| Arc::ptr_eq(p, payload))
            .ok_or(InterceptError::NotRegistered)?;
        state.payloads.remove(index);
        tracing::debug!(payload = payload.name(), "payload unregistered");
        Ok(())
    }

    /// Pin modules and build the handler lists and replacement table
    pub(crate) fn fix(&self) -> Result<Arc<FixedPayloads>> {
        let mut state = self.lock();
        if state.pinned.is_some() {
            return Err(InterceptError::Busy);
        }

        let mut pinned = Vec::with_capacity(state.payloads.len());
        for payload in &state.payloads {
            if payload.pin() {
                pinned.push(payload.clone());
            } else {
                tracing::warn!(payload = payload.name(), "owning module is unloading, payload skipped");
            }
        }

        let mut builders: BTreeMap<usize, ListBuilder> = BTreeMap::new();
        for payload in &pinned {
            for handler in payload.pre_handlers() {
                let lists = builders.entry(handler.offset).or_default();
                lists.pre.push(handler.function);
                if handler.external {
                    lists.default_pre.push(handler.function);
                }
            }
            for handler in payload.post_handlers() {
                let lists = builders.entry(handler.offset).or_default();
                lists.post.push(handler.function);
                if handler.external {
                    lists.default_post.push(handler.function);
                }
            }
        }

        let handled_groups: BTreeSet<u32> = self
            .schema
            .intermediates()
            .iter()
            .filter(|op| op.group != 0 && builders.contains_key(&op.offset()))
            .map(|op| op.group)
            .collect();
        for op in self.schema.intermediates() {
            if handled_groups.contains(&op.group) {
                builders.entry(op.offset()).or_default();
            }
        }

        let replacements: Vec<Replacement> = self
            .schema
            .intermediates()
            .iter()
            .filter(|op| builders.contains_key(&op.offset()))
            .map(|op| Replacement {
                offset: op.offset(),
                function: op.replacement,
            })
            .collect();
        let operations = builders
            .into_iter()
            .map(|(offset, lists)| (offset, lists.finish()))
            .collect();

        tracing::debug!(
            schema = self.schema.name(),
            payloads = pinned.len(),
            replaced = replacements.len(),
            "payloads fixed"
        );
        state.pinned = Some(pinned);
        Ok(Arc::new(FixedPayloads {
            operations,
            replacements,
        }))
    }

    /// Unpin modules and leave the in-use state; no-op when not fixed
    pub(crate) fn release(&self) {
        let pinned = self.lock().pinned.take();
        for payload in pinned.into_iter().flatten() {
            payload.unpin();
        }
    }

    pub(crate) fn is_in_use(&self) -> bool {
        self.lock().pinned.is_some()
    }

    pub(crate) fn len(&self) -> usize {
        self.lock().payloads.len()
    }
}

impl Drop for PayloadContainer {
    fn drop(&mut self) {
        let state = self.state.get_mut().unwrap_or_else(PoisonError::into_inner);
        for payload in state.pinned.take().into_iter().flatten() {
            payload.unpin();
        }
        for payload in &state.payloads {
            tracing::error!(
                payload = payload.name(),
                schema = self.schema.name(),
                "payload still registered when its interceptor went away"
            );
        }
    }
}
