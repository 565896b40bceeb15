//! Indirect instrumentation: objects point to shared operations tables
//!
//! Watching an object claims its table pointer field, finds or creates the
//! record for the table it currently references and repoints the field at
//! the record's patched table. Objects referencing bit-identical tables
//! share one record.

use super::record::{OpsRecord, RecordIndex};
use super::{ForgetOutcome, InstrumentorStats, Replacement, WatchOutcome};
use crate::addr::{load_slot, replace_slot_if, store_slot, Addr};
use crate::collision::OwnerId;
use crate::engine::Engine;
use crate::error::{InterceptError, Result};
use crate::keyed_store::KeyedStore;
use crate::policy::PatchPolicy;
use parking_lot::Mutex;
use std::sync::Arc;

struct WatchBinding {
    record: Arc<OpsRecord>,
}

struct IndirectState {
    records: RecordIndex,
    watches: KeyedStore<WatchBinding>,
}

/// What a watched object currently has installed for one operation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct BindingView {
    /// Table the object's record was derived from
    pub(crate) original_table: Addr,
    /// Operation the object's patched table holds at the offset
    pub(crate) installed: Addr,
}

pub(crate) struct IndirectInstrumentor {
    engine: Engine,
    owner: OwnerId,
    field_offset: usize,
    replacements: Arc<[Replacement]>,
    state: Mutex<IndirectState>,
}

impl IndirectInstrumentor {
    pub(crate) fn new(
        engine: Engine,
        field_offset: usize,
        table_size: usize,
        replacements: Arc<[Replacement]>,
        policy: Arc<dyn PatchPolicy>,
    ) -> Self {
        let config = engine.config();
        let state = IndirectState {
            records: RecordIndex::new(
                config.store_bits,
                table_size,
                replacements.clone(),
                policy,
                config.report_leaks,
            ),
            watches: KeyedStore::with_bits(config.store_bits),
        };
        let owner = engine.next_owner_id();
        Self {
            engine,
            owner,
            field_offset,
            replacements,
            state: Mutex::new(state),
        }
    }

    pub(crate) fn field_offset(&self) -> usize {
        self.field_offset
    }

    fn field_of(&self, object: Addr) -> Addr {
        object.add(self.field_offset)
    }

    pub(crate) fn is_own_replacement(&self, addr: Addr) -> bool {
        self.replacements.iter().any(|r| r.function == addr)
    }

    /// # Safety
    ///
    /// `object` is live and holds a table pointer at the field offset; the
    /// table (if non-null) is live and of the schema's size.
    pub(crate) unsafe fn watch(&self, object: Addr) -> Result<WatchOutcome> {
        let field = self.field_of(object);

        if unsafe { self.refresh(object, field) }? {
            return Ok(WatchOutcome::Updated);
        }

        // Collision claim strictly before our own lock
        self.engine.collisions().claim_field(field, self.owner)?;
        let result = unsafe { self.bind_new(object, field) };
        match result {
            Ok(()) => {
                tracing::debug!(%object, owner = %self.owner, "object watched");
                Ok(WatchOutcome::New)
            }
            Err(e) => {
                self.engine.collisions().release_field(field);
                Err(e)
            }
        }
    }

    /// Re-sync an already watched object; false if it is not watched
    unsafe fn refresh(&self, object: Addr, field: Addr) -> Result<bool> {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        let Some(bound) = state.watches.find(object).map(|b| b.record.patched()) else {
            return Ok(false);
        };

        let current = unsafe { load_slot(field, 0) };
        let patched = if current == bound {
            bound
        } else {
            tracing::debug!(%object, old = %bound, new = %current, "operations replaced externally, rebinding");
            let fresh = unsafe { state.records.get_or_create(current) }?;
            let patched = fresh.patched();
            let binding = state
                .watches
                .find_mut(object)
                .expect("watch binding vanished under lock");
            let stale = std::mem::replace(&mut binding.record, fresh);
            state.records.release(stale);
            patched
        };

        unsafe { store_slot(field, 0, patched) };
        Ok(true)
    }

    unsafe fn bind_new(&self, object: Addr, field: Addr) -> Result<()> {
        let mut guard = self.state.lock();
        let state = &mut *guard;

        let current = unsafe { load_slot(field, 0) };
        let record = unsafe { state.records.get_or_create(current) }?;
        let original = record.original();
        let patched = record.patched();

        if let Err(e) = state.watches.add_unique(object, WatchBinding { record }) {
            state.records.purge_if_dead(original, patched);
            return Err(e);
        }
        unsafe { store_slot(field, 0, patched) };
        Ok(())
    }

    /// # Safety
    ///
    /// Same as [`IndirectInstrumentor::watch`].
    pub(crate) unsafe fn forget(&self, object: Addr, norestore: bool) -> ForgetOutcome {
        let field = self.field_of(object);
        {
            let mut state = self.state.lock();
            let Some(binding) = state.watches.remove(object) else {
                return ForgetOutcome::NotWatched;
            };

            if !norestore {
                let record = &binding.record;
                let restored =
                    unsafe { replace_slot_if(field, 0, record.patched(), record.original()) };
                if !restored {
                    tracing::debug!(%object, "operations changed externally, not restoring");
                }
            }
            state.records.release(binding.record);
        }

        self.engine.collisions().release_field(field);
        tracing::debug!(%object, norestore, "object forgotten");
        ForgetOutcome::Forgotten
    }

    /// # Safety
    ///
    /// Same as [`IndirectInstrumentor::watch`].
    pub(crate) unsafe fn original_operation(&self, object: Addr, offset: usize) -> Result<Option<Addr>> {
        let field = self.field_of(object);
        let table = {
            let state = self.state.lock();
            if let Some(binding) = state.watches.find(object) {
                return Self::snapshot_slot(&binding.record, offset);
            }

            let table = unsafe { load_slot(field, 0) };
            if let Some(record) = state.records.find(table) {
                // Table copied from a watched object
                return Self::snapshot_slot(&record, offset);
            }
            table
        };

        if table.is_null() {
            return Ok(None);
        }
        let live = unsafe { load_slot(table, offset) };
        if self.is_own_replacement(live) {
            tracing::warn!(%object, offset, "original operation lost");
            return Err(InterceptError::Unrecoverable { offset });
        }
        tracing::trace!(%object, offset, "operation was never instrumented");
        Ok(live.non_null())
    }

    fn snapshot_slot(record: &OpsRecord, offset: usize) -> Result<Option<Addr>> {
        record
            .original_slot(offset)
            .map(Addr::non_null)
            .ok_or(InterceptError::UnknownOperation { offset })
    }

    /// Installed operation of a watched object, if it is watched
    pub(crate) fn binding_view(&self, object: Addr, offset: usize) -> Option<BindingView> {
        let state = self.state.lock();
        state.watches.find(object).map(|binding| BindingView {
            original_table: binding.record.original(),
            installed: binding.record.patched_slot(offset),
        })
    }

    pub(crate) fn is_watched(&self, object: Addr) -> bool {
        self.state.lock().watches.contains(object)
    }

    /// Strong handles on the record known under `table`
    pub(crate) fn record_refs(&self, table: Addr) -> usize {
        self.state.lock().records.ref_count(table)
    }

    pub(crate) fn stats(&self) -> InstrumentorStats {
        let state = self.state.lock();
        InstrumentorStats {
            watched: state.watches.len(),
            records: state.records.len(),
        }
    }

    /// Forget everything without restoring, reporting each object
    pub(crate) fn destroy(&self, trace: &mut dyn FnMut(Addr)) {
        let leftovers = {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            let mut leftovers = Vec::new();
            for (object, binding) in state.watches.drain() {
                state.records.release(binding.record);
                leftovers.push(object);
            }
            state.records.clear();
            leftovers
        };

        for object in leftovers {
            tracing::warn!(%object, owner = %self.owner, "object still watched at interceptor stop");
            trace(object);
            self.engine.collisions().release_field(self.field_of(object));
        }
    }
}
