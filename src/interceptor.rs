//! Interceptor: payloads plus an instrumentor, with a start/stop lifecycle
//!
//! ```text
//! new() ──► Initialized ──start()──► Started
//!               ▲                      │
//!               └────────stop()────────┘
//! ```
//!
//! Payloads are registered and factories attached while initialized.
//! Objects are watched and forgotten while started; replacement functions
//! call [`Interceptor::get_intermediate_info`] to find the original
//! operation and the handlers to run around it.

use crate::addr::Addr;
use crate::engine::Engine;
use crate::error::{InterceptError, Result};
use crate::factory::{FactoryInterceptor, FactoryStats};
use crate::instrumentor::{ForgetOutcome, Instrumentor, InstrumentorStats, WatchOutcome};
use crate::payload::Payload;
use crate::payload_container::{FixedPayloads, PayloadContainer};
use crate::policy::{policy_for, PatchPolicy};
use crate::schema::{OpsLocation, OpsSchema};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::sync::Arc;

/// What a replacement function needs to do its job
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IntermediateInfo {
    /// Operation the object would have called without us; `None` if it has
    /// none
    pub op_orig: Option<Addr>,
    pub pre: Arc<[Addr]>,
    pub post: Arc<[Addr]>,
}

enum State {
    Initialized,
    Started {
        instrumentor: Instrumentor,
        fixed: Arc<FixedPayloads>,
    },
}

/// Counters of one interceptor, for diagnostics
#[derive(Debug, Clone, Serialize)]
pub struct InterceptorStats {
    pub name: String,
    pub started: bool,
    pub payloads: usize,
    pub replaced_operations: usize,
    pub watched: usize,
    pub records: usize,
    pub factories: Vec<FactoryStats>,
}

pub struct Interceptor {
    engine: Engine,
    schema: Arc<OpsSchema>,
    payloads: PayloadContainer,
    policy: Mutex<Arc<dyn PatchPolicy>>,
    state: RwLock<State>,
    factories: Mutex<Vec<Arc<FactoryInterceptor>>>,
}

impl std::fmt::Debug for Interceptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Interceptor")
            .field("schema", &self.schema.name())
            .field("started", &self.is_started())
            .finish()
    }
}

impl Interceptor {
    /// Initialized interceptor for objects laid out as `schema` describes
    pub fn new(engine: &Engine, schema: OpsSchema) -> Result<Self> {
        let policy = policy_for(engine.config().patch_mode);
        let schema = Arc::new(schema);
        tracing::debug!(schema = schema.name(), ?policy, "interceptor created");
        Ok(Self {
            engine: engine.clone(),
            payloads: PayloadContainer::new(schema.clone()),
            schema,
            policy: Mutex::new(policy),
            state: RwLock::new(State::Initialized),
            factories: Mutex::new(Vec::new()),
        })
    }

    pub fn schema(&self) -> &OpsSchema {
        &self.schema
    }

    pub fn engine(&self) -> &Engine {
        &self.engine
    }

    pub fn is_started(&self) -> bool {
        matches!(*self.state.read(), State::Started { .. })
    }

    pub fn register_payload(&self, payload: Arc<Payload>) -> Result<()> {
        self.payloads.register(payload)
    }

    pub fn unregister_payload(&self, payload: &Arc<Payload>) -> Result<()> {
        self.payloads.unregister(payload)
    }

    /// Replace the in-place-vs-copy decision; only while initialized
    pub fn set_patch_policy(&self, policy: Arc<dyn PatchPolicy>) -> Result<()> {
        let state = self.state.read();
        if matches!(*state, State::Started { .. }) {
            return Err(InterceptError::Busy);
        }
        *self.policy.lock() = policy;
        Ok(())
    }

    /// Attach a factory watching prototypes of this interceptor's objects.
    ///
    /// Only indirect interceptors accept factories, and the factory's table
    /// must have the same size.
    pub fn add_factory(&self, schema: OpsSchema) -> Result<Arc<FactoryInterceptor>> {
        let state = self.state.read();
        if matches!(*state, State::Started { .. }) {
            return Err(InterceptError::Busy);
        }
        let OpsLocation::Indirect { table_size, .. } = self.schema.location() else {
            return Err(InterceptError::InvalidSchema(format!(
                "{}: factories need an indirect interceptor",
                self.schema.name()
            )));
        };
        match schema.location() {
            OpsLocation::Indirect {
                table_size: size, ..
            } if size == table_size => {}
            _ => {
                return Err(InterceptError::InvalidSchema(format!(
                    "{}: factory table must be an indirect table of {} bytes",
                    schema.name(),
                    table_size
                )))
            }
        }

        let factory = Arc::new(FactoryInterceptor::new(self.engine.clone(), schema));
        let mut factories = self.factories.lock();
        factories
            .try_reserve(1)
            .map_err(|_| InterceptError::NoMemory)?;
        factories.push(factory.clone());
        tracing::debug!(
            interceptor = self.schema.name(),
            factory = factory.schema().name(),
            "factory attached"
        );
        Ok(factory)
    }

    pub fn start(&self) -> Result<()> {
        let mut state = self.state.write();
        if matches!(*state, State::Started { .. }) {
            return Err(InterceptError::Busy);
        }

        let fixed = self.payloads.fix()?;
        let policy = self.policy.lock().clone();
        let instrumentor = Instrumentor::new(
            &self.engine,
            &self.schema,
            fixed.replacements().to_vec(),
            policy,
        );

        let factories = self.factories.lock().clone();
        let parent = instrumentor.indirect().cloned();
        if let Some(parent) = parent {
            for (started, factory) in factories.iter().enumerate() {
                if let Err(e) = factory.start(parent.clone()) {
                    tracing::warn!(
                        interceptor = self.schema.name(),
                        factory = factory.schema().name(),
                        error = %e,
                        "factory failed to start, rolling back"
                    );
                    for factory in factories[..started].iter().rev() {
                        factory.stop_with(&mut |_| {});
                    }
                    instrumentor.destroy(&mut |_| {});
                    self.payloads.release();
                    return Err(e);
                }
            }
        }

        tracing::debug!(
            interceptor = self.schema.name(),
            replaced = fixed.replacements().len(),
            "interceptor started"
        );
        *state = State::Started {
            instrumentor,
            fixed,
        };
        Ok(())
    }

    /// Stop, logging every object that was still watched
    pub fn stop(&self) -> bool {
        self.stop_with(&mut |_| {})
    }

    /// Stop, forgetting still-watched objects without restoring them and
    /// reporting each one through `trace`. False if not started.
    pub fn stop_with(&self, trace: &mut dyn FnMut(Addr)) -> bool {
        let mut state = self.state.write();
        let State::Started { instrumentor, .. } = std::mem::replace(&mut *state, State::Initialized)
        else {
            return false;
        };

        let factories = self.factories.lock().clone();
        for factory in factories.iter().rev() {
            factory.stop_with(trace);
        }
        instrumentor.destroy(trace);
        self.payloads.release();
        tracing::debug!(interceptor = self.schema.name(), "interceptor stopped");
        true
    }

    /// Start intercepting `object`'s operations.
    ///
    /// # Safety
    ///
    /// `object` is a live object with the schema's layout, and stays live
    /// until forgotten. Callers serialize watch/forget per object.
    pub unsafe fn watch(&self, object: Addr) -> Result<WatchOutcome> {
        match &*self.state.read() {
            State::Started { instrumentor, .. } => unsafe { instrumentor.watch(object) },
            State::Initialized => Err(InterceptError::PermissionDenied),
        }
    }

    /// Stop intercepting `object`, restoring its operations when nobody
    /// replaced them in the meantime.
    ///
    /// # Safety
    ///
    /// Same as [`Interceptor::watch`].
    pub unsafe fn forget(&self, object: Addr) -> Result<ForgetOutcome> {
        unsafe { self.forget_inner(object, false) }
    }

    /// Stop intercepting an object that is being destroyed; its memory is
    /// left as is.
    ///
    /// # Safety
    ///
    /// Same as [`Interceptor::watch`].
    pub unsafe fn forget_norestore(&self, object: Addr) -> Result<ForgetOutcome> {
        unsafe { self.forget_inner(object, true) }
    }

    unsafe fn forget_inner(&self, object: Addr, norestore: bool) -> Result<ForgetOutcome> {
        match &*self.state.read() {
            State::Started { instrumentor, .. } => Ok(unsafe { instrumentor.forget(object, norestore) }),
            State::Initialized => Err(InterceptError::PermissionDenied),
        }
    }

    /// Original operation and handlers for the intercepted operation at
    /// `offset` of `object`.
    ///
    /// The handler lists are the external-only ones when the object has no
    /// original operation.
    ///
    /// # Safety
    ///
    /// `object` is a live object with the schema's layout.
    ///
    /// # Panics
    ///
    /// Panics if the interceptor is not started: only replacement functions
    /// of a started interceptor may ask.
    pub unsafe fn get_intermediate_info(&self, object: Addr, offset: usize) -> Result<IntermediateInfo> {
        let state = self.state.read();
        let State::Started { instrumentor, fixed } = &*state else {
            panic!(
                "intermediate info requested from stopped interceptor '{}'",
                self.schema.name()
            );
        };
        let lists = fixed
            .lists(offset)
            .ok_or(InterceptError::UnknownOperation { offset })?;
        let op_orig = unsafe { instrumentor.original_operation(object, offset) }?;
        let (pre, post) = lists.select(op_orig.is_some());
        tracing::trace!(%object, offset, ?op_orig, "intermediate info");
        Ok(IntermediateInfo { op_orig, pre, post })
    }

    /// False when not started
    pub fn is_watched(&self, object: Addr) -> bool {
        match &*self.state.read() {
            State::Started { instrumentor, .. } => instrumentor.is_watched(object),
            State::Initialized => false,
        }
    }

    /// Number of watched objects sharing the instrumentation record of
    /// `table` (an original or patched table address)
    pub fn record_refs(&self, table: Addr) -> usize {
        match &*self.state.read() {
            State::Started { instrumentor, .. } => instrumentor.record_refs(table),
            State::Initialized => 0,
        }
    }

    pub fn stats(&self) -> InterceptorStats {
        let (started, replaced_operations, counters) = match &*self.state.read() {
            State::Started {
                instrumentor,
                fixed,
            } => (true, fixed.replacements().len(), instrumentor.stats()),
            State::Initialized => (false, 0, InstrumentorStats::default()),
        };
        let factories = self.factories.lock().iter().map(|f| f.stats()).collect();
        InterceptorStats {
            name: self.schema.name().to_string(),
            started,
            payloads: self.payloads.len(),
            replaced_operations,
            watched: counters.watched,
            records: counters.records,
            factories,
        }
    }

    #[cfg(test)]
    pub(crate) fn payloads_in_use(&self) -> bool {
        self.payloads.is_in_use()
    }
}

impl Drop for Interceptor {
    fn drop(&mut self) {
        if self.stop() {
            tracing::warn!(interceptor = self.schema.name(), "interceptor dropped while started");
        }
    }
}
