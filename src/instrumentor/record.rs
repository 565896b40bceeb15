//! Shared per-table instrumentation records
//!
//! One record exists per distinct original table value. It snapshots the
//! original slots and owns the patched table (a private copy, or the shared
//! table patched in place). Bindings hold strong handles; the index holds
//! weak ones under both the original and the patched address, so a lookup
//! succeeds whichever of the two values currently sits in an object.
//!
//! Every strong handle is dropped through [`RecordIndex::release`] while the
//! owning instrumentor's lock is held, which purges the index entries of a
//! record the moment its last handle goes away.

use super::Replacement;
use crate::addr::{load_slot, replace_slot_if, store_slot, Addr, SLOT_SIZE};
use crate::error::{InterceptError, Result};
use crate::keyed_store::KeyedStore;
use crate::policy::PatchPolicy;
use std::ptr::NonNull;
use std::sync::{Arc, Weak};

/// Heap copy of an operations table with a stable address
struct TableCopy {
    ptr: NonNull<usize>,
    len: usize,
}

// SAFETY: the copy is plain pointer-sized words, only accessed atomically
// through `addr::{load_slot, store_slot}` once published.
unsafe impl Send for TableCopy {}
unsafe impl Sync for TableCopy {}

impl TableCopy {
    fn new(words: Vec<usize>) -> Self {
        let boxed = words.into_boxed_slice();
        let len = boxed.len();
        let raw = Box::into_raw(boxed) as *mut usize;
        Self {
            // SAFETY: Box::into_raw never yields null; a zero-length slice
            // still carries a dangling non-null pointer.
            ptr: unsafe { NonNull::new_unchecked(raw) },
            len,
        }
    }

    fn addr(&self) -> Addr {
        Addr::from_mut(self.ptr.as_ptr())
    }
}

impl Drop for TableCopy {
    fn drop(&mut self) {
        let slice = std::ptr::slice_from_raw_parts_mut(self.ptr.as_ptr(), self.len);
        // SAFETY: produced by Box::into_raw in `new`, freed exactly once.
        drop(unsafe { Box::from_raw(slice) });
    }
}

enum PatchedTable {
    Copy(TableCopy),
    /// The original table itself was patched; `(offset, original, replacement)`
    InPlace {
        table: Addr,
        saved: Vec<(usize, Addr, Addr)>,
    },
}

/// Instrumentation of one original operations table
pub(crate) struct OpsRecord {
    original: Addr,
    snapshot: Box<[usize]>,
    patched: PatchedTable,
}

impl std::fmt::Debug for OpsRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpsRecord")
            .field("original", &self.original)
            .field("patched", &self.patched())
            .field("in_place", &self.is_in_place())
            .finish()
    }
}

impl OpsRecord {
    /// Snapshot `table` and build its patched form.
    ///
    /// A null table is treated as a table of null operations and always
    /// copied.
    ///
    /// # Safety
    ///
    /// `table` is null or points to `words` readable (and, when patching in
    /// place, writable) pointer-sized slots.
    unsafe fn create(
        table: Addr,
        words: usize,
        replacements: &[Replacement],
        in_place: bool,
    ) -> Result<Self> {
        let mut snapshot = Vec::new();
        snapshot
            .try_reserve_exact(words)
            .map_err(|_| InterceptError::NoMemory)?;
        if table.is_null() {
            snapshot.resize(words, 0);
        } else {
            for i in 0..words {
                snapshot.push(unsafe { load_slot(table, i * SLOT_SIZE) }.get());
            }
        }

        let patched = if in_place && !table.is_null() {
            let mut saved = Vec::new();
            saved
                .try_reserve_exact(replacements.len())
                .map_err(|_| InterceptError::NoMemory)?;
            for r in replacements {
                saved.push((r.offset, Addr::new(snapshot[r.offset / SLOT_SIZE]), r.function));
                unsafe { store_slot(table, r.offset, r.function) };
            }
            PatchedTable::InPlace { table, saved }
        } else {
            let mut copy = Vec::new();
            copy.try_reserve_exact(words)
                .map_err(|_| InterceptError::NoMemory)?;
            copy.extend_from_slice(&snapshot);
            for r in replacements {
                copy[r.offset / SLOT_SIZE] = r.function.get();
            }
            PatchedTable::Copy(TableCopy::new(copy))
        };

        Ok(Self {
            original: table,
            snapshot: snapshot.into_boxed_slice(),
            patched,
        })
    }

    /// Table value the record was derived from
    pub(crate) fn original(&self) -> Addr {
        self.original
    }

    /// Table value installed into watched objects
    pub(crate) fn patched(&self) -> Addr {
        match &self.patched {
            PatchedTable::Copy(copy) => copy.addr(),
            PatchedTable::InPlace { table, .. } => *table,
        }
    }

    pub(crate) fn is_in_place(&self) -> bool {
        matches!(self.patched, PatchedTable::InPlace { .. })
    }

    /// Operation the original table held at `offset` when the record was
    /// built; `None` past the end of the table
    pub(crate) fn original_slot(&self, offset: usize) -> Option<Addr> {
        if offset % SLOT_SIZE != 0 {
            return None;
        }
        self.snapshot.get(offset / SLOT_SIZE).copied().map(Addr::new)
    }

    /// Operation currently installed at `offset` in the patched table
    pub(crate) fn patched_slot(&self, offset: usize) -> Addr {
        // SAFETY: the patched table is either our own copy or the original
        // table, which callers keep alive while objects reference it.
        unsafe { load_slot(self.patched(), offset) }
    }
}

impl Drop for OpsRecord {
    fn drop(&mut self) {
        if let PatchedTable::InPlace { table, saved } = &self.patched {
            for (offset, original, replacement) in saved {
                // SAFETY: the table was writable when patched and outlives
                // every object that referenced it.
                let restored = unsafe { replace_slot_if(*table, *offset, *replacement, *original) };
                if !restored {
                    tracing::warn!(
                        table = %table,
                        offset,
                        "slot changed externally, leaving in-place patch as is"
                    );
                }
            }
        }
    }
}

/// Index of live records keyed by original and patched table address
pub(crate) struct RecordIndex {
    store: KeyedStore<Weak<OpsRecord>>,
    words: usize,
    replacements: Arc<[Replacement]>,
    policy: Arc<dyn PatchPolicy>,
    report_leaks: bool,
}

impl RecordIndex {
    pub(crate) fn new(
        store_bits: u8,
        table_size: usize,
        replacements: Arc<[Replacement]>,
        policy: Arc<dyn PatchPolicy>,
        report_leaks: bool,
    ) -> Self {
        Self {
            store: KeyedStore::with_bits(store_bits),
            words: table_size / SLOT_SIZE,
            replacements,
            policy,
            report_leaks,
        }
    }

    /// Live record known under `table` (original or patched address)
    pub(crate) fn find(&self, table: Addr) -> Option<Arc<OpsRecord>> {
        let weak = self.store.find(table)?;
        let record = weak.upgrade();
        assert!(
            record.is_some(),
            "dead instrumentation record still indexed under {}",
            table
        );
        record
    }

    /// Existing record for `table`, or a freshly created one
    ///
    /// # Safety
    ///
    /// `table` is null or a live operations table of the indexed size.
    pub(crate) unsafe fn get_or_create(&mut self, table: Addr) -> Result<Arc<OpsRecord>> {
        if let Some(record) = self.find(table) {
            return Ok(record);
        }

        let in_place = self.policy.replace_in_place(table);
        let record =
            Arc::new(unsafe { OpsRecord::create(table, self.words, &self.replacements, in_place) }?);
        let original = record.original();
        let patched = record.patched();

        self.store.add(original, Arc::downgrade(&record))?;
        if patched != original {
            if let Err(e) = self.store.add(patched, Arc::downgrade(&record)) {
                self.store.remove(original);
                return Err(e);
            }
        }
        tracing::debug!(%original, %patched, in_place, "instrumentation record created");
        Ok(record)
    }

    /// Drop one strong handle; purge the record if it was the last one
    pub(crate) fn release(&mut self, record: Arc<OpsRecord>) {
        let original = record.original();
        let patched = record.patched();
        drop(record);
        self.purge_if_dead(original, patched);
    }

    pub(crate) fn purge_if_dead(&mut self, original: Addr, patched: Addr) {
        let dead = self
            .store
            .find(original)
            .is_some_and(|weak| weak.strong_count() == 0);
        if dead {
            self.store.remove(original);
            if patched != original {
                self.store.remove(patched);
            }
            tracing::debug!(%original, "instrumentation record destroyed");
        }
    }

    /// Number of live records
    pub(crate) fn len(&self) -> usize {
        self.store
            .iter()
            .filter(|(key, weak)| weak.upgrade().is_some_and(|r| r.original() == *key))
            .count()
    }

    /// Number of strong handles on the record known under `table`
    pub(crate) fn ref_count(&self, table: Addr) -> usize {
        self.store
            .find(table)
            .map(|weak| weak.strong_count())
            .unwrap_or(0)
    }

    /// Drop every index entry, reporting records some handle still keeps
    /// alive
    pub(crate) fn clear(&mut self) {
        for (key, weak) in self.store.drain() {
            if self.report_leaks && weak.strong_count() > 0 {
                tracing::error!(table = %key, "instrumentation record leaked at teardown");
            }
        }
    }
}
