//! Foreign instrumentation of prototype tables
//!
//! A factory patches the table a prototype (the "tie") hands out, so every
//! object created by copying the prototype's table pointer starts calling
//! our foreign replacements. The first such call on a new object goes
//! through [`ForeignInstrumentor::bind`], which decides what the object
//! should really call and hands the object over to the parent indirect
//! instrumentor when the prototype is still bound.
//!
//! Foreign records always use private copies: patching a shared table in
//! place would route every unrelated holder of it through `bind`.

use super::indirect::{BindingView, IndirectInstrumentor};
use super::record::{OpsRecord, RecordIndex};
use super::{ForgetOutcome, InstrumentorStats, Replacement, WatchOutcome};
use crate::addr::{load_slot, replace_slot_if, store_slot, Addr};
use crate::collision::OwnerId;
use crate::engine::Engine;
use crate::error::{InterceptError, Result};
use crate::keyed_store::KeyedStore;
use crate::policy::AlwaysCopy;
use parking_lot::Mutex;
use std::sync::Arc;

struct ForeignBinding {
    record: Arc<OpsRecord>,
    tie: Addr,
    field: Addr,
}

struct ForeignState {
    records: RecordIndex,
    by_id: KeyedStore<ForeignBinding>,
    /// tie -> id
    by_tie: KeyedStore<Addr>,
}

pub(crate) struct ForeignInstrumentor {
    engine: Engine,
    owner: OwnerId,
    parent: Arc<IndirectInstrumentor>,
    replacements: Arc<[Replacement]>,
    state: Mutex<ForeignState>,
}

impl ForeignInstrumentor {
    pub(crate) fn new(
        engine: Engine,
        parent: Arc<IndirectInstrumentor>,
        table_size: usize,
        replacements: Arc<[Replacement]>,
    ) -> Self {
        let config = engine.config();
        let state = ForeignState {
            records: RecordIndex::new(
                config.store_bits,
                table_size,
                replacements.clone(),
                Arc::new(AlwaysCopy),
                config.report_leaks,
            ),
            by_id: KeyedStore::with_bits(config.store_bits),
            by_tie: KeyedStore::with_bits(config.store_bits),
        };
        let owner = engine.next_owner_id();
        Self {
            engine,
            owner,
            parent,
            replacements,
            state: Mutex::new(state),
        }
    }

    fn is_own_replacement(&self, addr: Addr) -> bool {
        self.replacements.iter().any(|r| r.function == addr)
    }

    fn replaces(&self, offset: usize) -> bool {
        self.replacements.iter().any(|r| r.offset == offset)
    }

    /// # Safety
    ///
    /// `field` is a live, writable table pointer field whose table (if
    /// non-null) is live and of the schema's size.
    pub(crate) unsafe fn watch(&self, id: Addr, tie: Addr, field: Addr) -> Result<WatchOutcome> {
        if unsafe { self.refresh(id, tie, field) }? {
            return Ok(WatchOutcome::Updated);
        }

        self.engine.collisions().claim_field(field, self.owner)?;
        let result = unsafe { self.bind_new(id, tie, field) };
        match result {
            Ok(()) => {
                tracing::debug!(%id, %tie, %field, owner = %self.owner, "prototype watched");
                Ok(WatchOutcome::New)
            }
            Err(e) => {
                self.engine.collisions().release_field(field);
                Err(e)
            }
        }
    }

    unsafe fn refresh(&self, id: Addr, tie: Addr, field: Addr) -> Result<bool> {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        let Some(binding) = state.by_id.find(id) else {
            return Ok(false);
        };
        assert_eq!(
            binding.field, field,
            "foreign id {} rebound to a different field",
            id
        );
        let old_tie = binding.tie;
        let bound = binding.record.patched();

        if old_tie != tie && state.by_tie.contains(tie) {
            return Err(InterceptError::AlreadyExists);
        }

        let current = unsafe { load_slot(field, 0) };
        let fresh = if current == bound {
            None
        } else {
            tracing::debug!(%id, old = %bound, new = %current, "prototype operations replaced externally, rebinding");
            Some(unsafe { state.records.get_or_create(current) }?)
        };

        if old_tie != tie {
            if let Err(e) = state.by_tie.add(tie, id) {
                if let Some(fresh) = fresh {
                    state.records.release(fresh);
                }
                return Err(e);
            }
            state.by_tie.remove(old_tie);
        }

        let binding = state
            .by_id
            .find_mut(id)
            .expect("foreign binding vanished under lock");
        binding.tie = tie;
        let patched = match fresh {
            Some(fresh) => {
                let patched = fresh.patched();
                let stale = std::mem::replace(&mut binding.record, fresh);
                state.records.release(stale);
                patched
            }
            None => bound,
        };

        unsafe { store_slot(field, 0, patched) };
        Ok(true)
    }

    unsafe fn bind_new(&self, id: Addr, tie: Addr, field: Addr) -> Result<()> {
        let mut guard = self.state.lock();
        let state = &mut *guard;

        if state.by_tie.contains(tie) {
            tracing::debug!(%id, %tie, "tie already bound to another prototype");
            return Err(InterceptError::AlreadyExists);
        }

        let current = unsafe { load_slot(field, 0) };
        let record = unsafe { state.records.get_or_create(current) }?;
        let original = record.original();
        let patched = record.patched();

        if let Err(e) = state.by_tie.add(tie, id) {
            state.records.release(record);
            return Err(e);
        }
        let binding = ForeignBinding { record, tie, field };
        if let Err(e) = state.by_id.add_unique(id, binding) {
            state.by_tie.remove(tie);
            state.records.purge_if_dead(original, patched);
            return Err(e);
        }
        unsafe { store_slot(field, 0, patched) };
        Ok(())
    }

    /// # Safety
    ///
    /// Same as [`ForeignInstrumentor::watch`].
    pub(crate) unsafe fn forget(&self, id: Addr, field: Addr, norestore: bool) -> ForgetOutcome {
        {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            let Some(binding) = state.by_id.remove(id) else {
                return ForgetOutcome::NotWatched;
            };
            assert_eq!(
                binding.field, field,
                "foreign id {} forgotten through a different field",
                id
            );
            state.by_tie.remove(binding.tie);

            if !norestore {
                let record = &binding.record;
                let restored =
                    unsafe { replace_slot_if(field, 0, record.patched(), record.original()) };
                if !restored {
                    tracing::debug!(%id, "prototype operations changed externally, not restoring");
                }
            }
            state.records.release(binding.record);
        }

        self.engine.collisions().release_field(field);
        tracing::debug!(%id, norestore, "prototype forgotten");
        ForgetOutcome::Forgotten
    }

    /// Operation `object` should call at `offset` on its first foreign call.
    ///
    /// # Safety
    ///
    /// `object` is live and `field` is its table pointer field, at the
    /// parent's field offset.
    pub(crate) unsafe fn bind(
        &self,
        object: Addr,
        tie: Addr,
        field: Addr,
        offset: usize,
    ) -> Result<Option<Addr>> {
        debug_assert_eq!(field, object.add(self.parent.field_offset()));
        if !self.replaces(offset) {
            return Err(InterceptError::UnknownOperation { offset });
        }

        let tied = {
            let state = self.state.lock();
            state
                .by_tie
                .find(tie)
                .and_then(|id| state.by_id.find(*id))
                .map(|b| {
                    (
                        b.record.original(),
                        b.record.patched(),
                        b.record.original_slot(offset).and_then(Addr::non_null),
                    )
                })
        };

        if let Some((original, patched, fallback)) = tied {
            if !unsafe { replace_slot_if(field, 0, patched, original) } {
                tracing::trace!(%object, "object no longer holds the prototype copy");
            }
            if let Err(e) = unsafe { self.parent.watch(object) } {
                tracing::warn!(%object, %tie, error = %e, "cannot hand object over to its interceptor");
                return Ok(fallback);
            }
            tracing::debug!(%object, %tie, "object created from watched prototype");
            return match self.parent.binding_view(object, offset) {
                Some(view) => self.resolve_chain(view, offset),
                None => Ok(fallback),
            };
        }

        if let Some(view) = self.parent.binding_view(object, offset) {
            return self.resolve_chain(view, offset);
        }

        let current = unsafe { load_slot(field, 0) };
        {
            let state = self.state.lock();
            if let Some(record) = state.records.find(current) {
                if current == record.patched() {
                    unsafe { replace_slot_if(field, 0, current, record.original()) };
                }
                return Ok(record.original_slot(offset).and_then(Addr::non_null));
            }
        }

        if current.is_null() {
            return Ok(None);
        }
        let live = unsafe { load_slot(current, offset) };
        if self.is_own_replacement(live) {
            tracing::warn!(%object, offset, "original operation lost");
            return Err(InterceptError::Unrecoverable { offset });
        }
        Ok(live.non_null())
    }

    /// Follow a parent binding to something that will not call us again
    fn resolve_chain(&self, view: BindingView, offset: usize) -> Result<Option<Addr>> {
        {
            // The parent snapshotted one of our copies, so its "original"
            // operations are our intermediates
            let state = self.state.lock();
            if let Some(record) = state.records.find(view.original_table) {
                if record.patched() == view.original_table {
                    return Ok(record.original_slot(offset).and_then(Addr::non_null));
                }
            }
        }
        if self.is_own_replacement(view.installed) {
            return Err(InterceptError::Unrecoverable { offset });
        }
        Ok(view.installed.non_null())
    }

    pub(crate) fn is_bound(&self, id: Addr) -> bool {
        self.state.lock().by_id.contains(id)
    }

    pub(crate) fn stats(&self) -> InstrumentorStats {
        let state = self.state.lock();
        InstrumentorStats {
            watched: state.by_id.len(),
            records: state.records.len(),
        }
    }

    /// Forget every bound prototype without restoring, reporting each id
    pub(crate) fn destroy(self, trace: &mut dyn FnMut(Addr)) {
        let leftovers = {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            let mut leftovers = Vec::new();
            for (id, binding) in state.by_id.drain() {
                state.records.release(binding.record);
                leftovers.push((id, binding.field));
            }
            state.by_tie.drain();
            state.records.clear();
            leftovers
        };

        for (id, field) in leftovers {
            tracing::warn!(%id, owner = %self.owner, "prototype still watched at factory stop");
            trace(id);
            self.engine.collisions().release_field(field);
        }
    }
}
