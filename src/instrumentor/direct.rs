//! Direct instrumentation: operations are fields of the object itself
//!
//! Nothing is shared between objects. Each watched object keeps a private
//! snapshot of the fields we overwrote, and the collision claim is taken on
//! the object address.

use super::{ForgetOutcome, InstrumentorStats, Replacement, WatchOutcome};
use crate::addr::{load_slot, replace_slot_if, store_slot, Addr};
use crate::collision::OwnerId;
use crate::engine::Engine;
use crate::error::{InterceptError, Result};
use crate::keyed_store::KeyedStore;
use parking_lot::Mutex;
use std::sync::Arc;

/// Original field values, in replacement order
struct DirectRecord {
    saved: Vec<Addr>,
}

pub(crate) struct DirectInstrumentor {
    engine: Engine,
    owner: OwnerId,
    replacements: Arc<[Replacement]>,
    watches: Mutex<KeyedStore<DirectRecord>>,
}

impl DirectInstrumentor {
    pub(crate) fn new(engine: Engine, replacements: Arc<[Replacement]>) -> Self {
        let watches = Mutex::new(KeyedStore::with_bits(engine.config().store_bits));
        let owner = engine.next_owner_id();
        Self {
            engine,
            owner,
            replacements,
            watches,
        }
    }

    fn is_own_replacement(&self, addr: Addr) -> bool {
        self.replacements.iter().any(|r| r.function == addr)
    }

    /// # Safety
    ///
    /// `object` is live and every replaced offset is a writable operation
    /// field inside it.
    pub(crate) unsafe fn watch(&self, object: Addr) -> Result<WatchOutcome> {
        {
            let mut watches = self.watches.lock();
            if let Some(record) = watches.find_mut(object) {
                for (saved, r) in record.saved.iter_mut().zip(self.replacements.iter()) {
                    let live = unsafe { load_slot(object, r.offset) };
                    if live != r.function {
                        tracing::debug!(%object, offset = r.offset, "operation replaced externally");
                        *saved = live;
                        unsafe { store_slot(object, r.offset, r.function) };
                    }
                }
                return Ok(WatchOutcome::Updated);
            }
        }

        self.engine.collisions().claim_object(object, self.owner)?;
        let result = unsafe { self.patch_new(object) };
        match result {
            Ok(()) => {
                tracing::debug!(%object, owner = %self.owner, "object watched directly");
                Ok(WatchOutcome::New)
            }
            Err(e) => {
                self.engine.collisions().release_object(object);
                Err(e)
            }
        }
    }

    unsafe fn patch_new(&self, object: Addr) -> Result<()> {
        let mut saved = Vec::new();
        saved
            .try_reserve_exact(self.replacements.len())
            .map_err(|_| InterceptError::NoMemory)?;
        for r in self.replacements.iter() {
            let live = unsafe { load_slot(object, r.offset) };
            if live == r.function {
                // Fields copied from another watched object: the original
                // is not ours to know
                return Err(InterceptError::Unrecoverable { offset: r.offset });
            }
            saved.push(live);
        }

        self.watches.lock().add_unique(object, DirectRecord { saved })?;
        for r in self.replacements.iter() {
            unsafe { store_slot(object, r.offset, r.function) };
        }
        Ok(())
    }

    /// # Safety
    ///
    /// Same as [`DirectInstrumentor::watch`].
    pub(crate) unsafe fn forget(&self, object: Addr, norestore: bool) -> ForgetOutcome {
        let Some(record) = self.watches.lock().remove(object) else {
            return ForgetOutcome::NotWatched;
        };

        if !norestore {
            for (original, r) in record.saved.iter().zip(self.replacements.iter()) {
                if !unsafe { replace_slot_if(object, r.offset, r.function, *original) } {
                    tracing::debug!(%object, offset = r.offset, "operation changed externally, not restoring");
                }
            }
        }
        self.engine.collisions().release_object(object);
        tracing::debug!(%object, norestore, "object forgotten");
        ForgetOutcome::Forgotten
    }

    /// # Safety
    ///
    /// Same as [`DirectInstrumentor::watch`].
    pub(crate) unsafe fn original_operation(&self, object: Addr, offset: usize) -> Result<Option<Addr>> {
        let index = self.replacements.iter().position(|r| r.offset == offset);
        if let Some(index) = index {
            if let Some(record) = self.watches.lock().find(object) {
                return Ok(record.saved[index].non_null());
            }
        }

        let live = unsafe { load_slot(object, offset) };
        if self.is_own_replacement(live) {
            tracing::warn!(%object, offset, "original operation lost");
            return Err(InterceptError::Unrecoverable { offset });
        }
        Ok(live.non_null())
    }

    pub(crate) fn is_watched(&self, object: Addr) -> bool {
        self.watches.lock().contains(object)
    }

    pub(crate) fn stats(&self) -> InstrumentorStats {
        let watched = self.watches.lock().len();
        InstrumentorStats {
            watched,
            records: watched,
        }
    }

    pub(crate) fn destroy(self, trace: &mut dyn FnMut(Addr)) {
        let leftovers = self.watches.lock().drain();
        for (object, _) in leftovers {
            tracing::warn!(%object, owner = %self.owner, "object still watched at interceptor stop");
            trace(object);
            self.engine.collisions().release_object(object);
        }
    }
}
