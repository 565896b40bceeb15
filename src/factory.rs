//! Factory interceptors: watch objects created from a watched prototype
//!
//! A factory is attached to an indirect [`crate::Interceptor`] and patches
//! the operations table of prototype ("tie") objects with its own foreign
//! intermediates. Objects that copy the prototype's table pointer call one
//! of those intermediates first; it calls [`FactoryInterceptor::bind`] to
//! learn what to call instead, which also hands the new object over to the
//! parent interceptor when its prototype is still watched.
//!
//! A factory starts and stops together with its parent.

use crate::addr::Addr;
use crate::engine::Engine;
use crate::error::{InterceptError, Result};
use crate::instrumentor::{
    ForeignInstrumentor, ForgetOutcome, IndirectInstrumentor, InstrumentorStats, Replacement,
    WatchOutcome,
};
use crate::schema::OpsSchema;
use parking_lot::RwLock;
use serde::Serialize;
use std::sync::Arc;

enum FactoryState {
    Initialized,
    Started { foreign: ForeignInstrumentor },
}

/// Counters of one factory
#[derive(Debug, Clone, Serialize)]
pub struct FactoryStats {
    pub name: String,
    pub started: bool,
    pub prototypes: usize,
    pub records: usize,
}

pub struct FactoryInterceptor {
    engine: Engine,
    schema: Arc<OpsSchema>,
    state: RwLock<FactoryState>,
    #[cfg(test)]
    pub(crate) fail_next_start: std::sync::atomic::AtomicBool,
}

impl std::fmt::Debug for FactoryInterceptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FactoryInterceptor")
            .field("schema", &self.schema.name())
            .field("started", &self.is_started())
            .finish()
    }
}

impl FactoryInterceptor {
    pub(crate) fn new(engine: Engine, schema: OpsSchema) -> Self {
        Self {
            engine,
            schema: Arc::new(schema),
            state: RwLock::new(FactoryState::Initialized),
            #[cfg(test)]
            fail_next_start: std::sync::atomic::AtomicBool::new(false),
        }
    }

    pub fn schema(&self) -> &OpsSchema {
        &self.schema
    }

    pub fn is_started(&self) -> bool {
        matches!(*self.state.read(), FactoryState::Started { .. })
    }

    /// Address of the table pointer field of `prototype`
    pub fn field_of(&self, prototype: Addr) -> Addr {
        prototype.add(self.schema.field_offset().unwrap_or(0))
    }

    pub(crate) fn start(&self, parent: Arc<IndirectInstrumentor>) -> Result<()> {
        let mut state = self.state.write();
        if matches!(*state, FactoryState::Started { .. }) {
            return Err(InterceptError::Busy);
        }
        #[cfg(test)]
        {
            use std::sync::atomic::Ordering;
            if self.fail_next_start.swap(false, Ordering::SeqCst) {
                return Err(InterceptError::NoMemory);
            }
        }

        let replacements: Arc<[Replacement]> = self
            .schema
            .intermediates()
            .iter()
            .map(|op| Replacement {
                offset: op.offset(),
                function: op.replacement,
            })
            .collect();
        let foreign = ForeignInstrumentor::new(
            self.engine.clone(),
            parent,
            self.schema.region_size(),
            replacements,
        );
        *state = FactoryState::Started { foreign };
        tracing::debug!(factory = self.schema.name(), "factory started");
        Ok(())
    }

    pub(crate) fn stop_with(&self, trace: &mut dyn FnMut(Addr)) -> bool {
        let mut state = self.state.write();
        let FactoryState::Started { foreign } =
            std::mem::replace(&mut *state, FactoryState::Initialized)
        else {
            return false;
        };
        foreign.destroy(trace);
        tracing::debug!(factory = self.schema.name(), "factory stopped");
        true
    }

    /// Patch the table referenced by `field` for prototype `id`, tied to
    /// `tie`.
    ///
    /// # Safety
    ///
    /// `field` is a live, writable table pointer field whose table (if
    /// non-null) is live and of the schema's table size.
    pub unsafe fn watch(&self, id: Addr, tie: Addr, field: Addr) -> Result<WatchOutcome> {
        match &*self.state.read() {
            FactoryState::Started { foreign } => unsafe { foreign.watch(id, tie, field) },
            FactoryState::Initialized => Err(InterceptError::PermissionDenied),
        }
    }

    /// # Safety
    ///
    /// Same as [`FactoryInterceptor::watch`].
    pub unsafe fn forget(&self, id: Addr, field: Addr) -> Result<ForgetOutcome> {
        unsafe { self.forget_inner(id, field, false) }
    }

    /// Forget without restoring the field, for prototypes being destroyed.
    ///
    /// # Safety
    ///
    /// Same as [`FactoryInterceptor::watch`].
    pub unsafe fn forget_norestore(&self, id: Addr, field: Addr) -> Result<ForgetOutcome> {
        unsafe { self.forget_inner(id, field, true) }
    }

    unsafe fn forget_inner(&self, id: Addr, field: Addr, norestore: bool) -> Result<ForgetOutcome> {
        match &*self.state.read() {
            FactoryState::Started { foreign } => Ok(unsafe { foreign.forget(id, field, norestore) }),
            FactoryState::Initialized => Err(InterceptError::PermissionDenied),
        }
    }

    /// Operation a foreign intermediate should chain to for `object`.
    ///
    /// Only meaningful from inside a foreign intermediate function.
    ///
    /// # Safety
    ///
    /// `object` is a live object of the parent's layout and `field` is its
    /// table pointer field.
    ///
    /// # Panics
    ///
    /// Panics if the factory is not started.
    pub unsafe fn bind(
        &self,
        object: Addr,
        tie: Addr,
        field: Addr,
        offset: usize,
    ) -> Result<Option<Addr>> {
        let state = self.state.read();
        let FactoryState::Started { foreign } = &*state else {
            panic!(
                "bind called on stopped factory interceptor '{}'",
                self.schema.name()
            );
        };
        tracing::trace!(%object, %tie, offset, "binding object to prototype");
        unsafe { foreign.bind(object, tie, field, offset) }
    }

    pub fn is_bound(&self, id: Addr) -> bool {
        match &*self.state.read() {
            FactoryState::Started { foreign } => foreign.is_bound(id),
            FactoryState::Initialized => false,
        }
    }

    pub fn stats(&self) -> FactoryStats {
        let state = self.state.read();
        let (started, counters) = match &*state {
            FactoryState::Started { foreign } => (true, foreign.stats()),
            FactoryState::Initialized => (false, InstrumentorStats::default()),
        };
        FactoryStats {
            name: self.schema.name().to_string(),
            started,
            prototypes: counters.watched,
            records: counters.records,
        }
    }
}
