//! Instrumentors: apply and revert operation patches on objects
//!
//! Three strategies share one contract (watch, forget, original operation):
//! - [`IndirectInstrumentor`]: the object holds a pointer to a shared table;
//!   watched objects are repointed at a shared patched record.
//! - [`DirectInstrumentor`]: the operations are fields of the object; each
//!   watched object keeps a private snapshot of its patched fields.
//! - [`ForeignInstrumentor`]: patches a prototype's table so objects created
//!   by copying it can be handed over to an indirect instrumentor.
//!
//! The first two are dispatched through the closed [`Instrumentor`] enum.

mod direct;
mod foreign;
mod indirect;
pub(crate) mod record;

pub(crate) use direct::DirectInstrumentor;
pub(crate) use foreign::ForeignInstrumentor;
pub(crate) use indirect::IndirectInstrumentor;

use crate::addr::Addr;
use crate::engine::Engine;
use crate::error::Result;
use crate::policy::PatchPolicy;
use crate::schema::{OpsLocation, OpsSchema};
use serde::Serialize;
use std::sync::Arc;

/// One slot to overwrite and the intermediate function to put there
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Replacement {
    pub offset: usize,
    pub function: Addr,
}

/// Result of a successful watch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum WatchOutcome {
    /// The object was not watched before
    New,
    /// The object was already watched; its patch was refreshed
    Updated,
}

/// Result of a forget
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ForgetOutcome {
    Forgotten,
    /// The object was not watched; nothing changed
    NotWatched,
}

/// Counters exposed for diagnostics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct InstrumentorStats {
    pub watched: usize,
    pub records: usize,
}

/// Instrumentor of a normal interceptor
pub(crate) enum Instrumentor {
    Indirect(Arc<IndirectInstrumentor>),
    Direct(DirectInstrumentor),
}

impl Instrumentor {
    pub(crate) fn new(
        engine: &Engine,
        schema: &OpsSchema,
        replacements: Vec<Replacement>,
        policy: Arc<dyn PatchPolicy>,
    ) -> Self {
        let replacements: Arc<[Replacement]> = Arc::from(replacements);
        match schema.location() {
            OpsLocation::Indirect {
                field_offset,
                table_size,
            } => Instrumentor::Indirect(Arc::new(IndirectInstrumentor::new(
                engine.clone(),
                field_offset,
                table_size,
                replacements,
                policy,
            ))),
            OpsLocation::Direct { .. } => {
                Instrumentor::Direct(DirectInstrumentor::new(engine.clone(), replacements))
            }
        }
    }

    /// # Safety
    ///
    /// `object` must be a live object of the layout the schema describes.
    pub(crate) unsafe fn watch(&self, object: Addr) -> Result<WatchOutcome> {
        match self {
            Instrumentor::Indirect(i) => unsafe { i.watch(object) },
            Instrumentor::Direct(d) => unsafe { d.watch(object) },
        }
    }

    /// # Safety
    ///
    /// Same as [`Instrumentor::watch`].
    pub(crate) unsafe fn forget(&self, object: Addr, norestore: bool) -> ForgetOutcome {
        match self {
            Instrumentor::Indirect(i) => unsafe { i.forget(object, norestore) },
            Instrumentor::Direct(d) => unsafe { d.forget(object, norestore) },
        }
    }

    /// Original operation at `offset` for `object`; `None` for a null
    /// operation.
    ///
    /// # Safety
    ///
    /// Same as [`Instrumentor::watch`].
    pub(crate) unsafe fn original_operation(&self, object: Addr, offset: usize) -> Result<Option<Addr>> {
        match self {
            Instrumentor::Indirect(i) => unsafe { i.original_operation(object, offset) },
            Instrumentor::Direct(d) => unsafe { d.original_operation(object, offset) },
        }
    }

    pub(crate) fn indirect(&self) -> Option<&Arc<IndirectInstrumentor>> {
        match self {
            Instrumentor::Indirect(i) => Some(i),
            Instrumentor::Direct(_) => None,
        }
    }

    pub(crate) fn is_watched(&self, object: Addr) -> bool {
        match self {
            Instrumentor::Indirect(i) => i.is_watched(object),
            Instrumentor::Direct(d) => d.is_watched(object),
        }
    }

    /// Bindings sharing the record known under `table`; always 0 for
    /// direct instrumentation
    pub(crate) fn record_refs(&self, table: Addr) -> usize {
        match self {
            Instrumentor::Indirect(i) => i.record_refs(table),
            Instrumentor::Direct(_) => 0,
        }
    }

    pub(crate) fn stats(&self) -> InstrumentorStats {
        match self {
            Instrumentor::Indirect(i) => i.stats(),
            Instrumentor::Direct(d) => d.stats(),
        }
    }

    /// Forget every still-watched object without restoring it, reporting
    /// each one through `trace`.
    pub(crate) fn destroy(self, trace: &mut dyn FnMut(Addr)) {
        match self {
            Instrumentor::Indirect(i) => i.destroy(trace),
            Instrumentor::Direct(d) => d.destroy(trace),
        }
    }
}
