//! Pointer-keyed store with chained buckets
//!
//! The store is the building block for every index in the engine: record
//! indices, watch bindings, foreign bindings and the collision sets. It is
//! not synchronized; owners wrap it in their own lock.
//!
//! # Capacity
//!
//! The bucket count is fixed at creation. The resize machinery
//! ([`KeyedStore::grow`], [`KeyedStore::shrink`]) is complete, but the
//! automatic triggers never fire: expected occupancy is a handful of live
//! tables per interceptor, and a table that silently changes size would
//! change allocation behaviour under the instrumentor's non-sleeping lock.

use crate::addr::Addr;
use crate::error::{InterceptError, Result};
use std::collections::TryReserveError;

/// Default bucket bits (16 buckets)
pub const DEFAULT_BITS: u8 = 4;
/// Smallest table: 2 buckets
pub const MIN_BITS: u8 = 1;
/// Largest table: 65536 buckets
pub const MAX_BITS: u8 = 16;

const GOLDEN_RATIO_64: u64 = 0x61C8_8646_80B5_83EB;

/// Multiplicative pointer hash reduced to `bits` bits
pub fn hash_ptr(key: Addr, bits: u8) -> usize {
    debug_assert!((MIN_BITS..=MAX_BITS).contains(&bits));
    ((key.get() as u64).wrapping_mul(GOLDEN_RATIO_64) >> (64 - u32::from(bits))) as usize
}

type Bucket<V> = Vec<(Addr, V)>;

fn alloc_buckets<V>(bits: u8) -> std::result::Result<Vec<Bucket<V>>, TryReserveError> {
    let count = 1usize << bits;
    let mut buckets = Vec::new();
    buckets.try_reserve_exact(count)?;
    buckets.resize_with(count, Vec::new);
    Ok(buckets)
}

/// Pointer-keyed associative container
#[derive(Debug)]
pub struct KeyedStore<V> {
    buckets: Vec<Bucket<V>>,
    bits: u8,
    len: usize,
}

impl<V> KeyedStore<V> {
    /// Create an empty store with the default 16 buckets
    pub fn new() -> Self {
        Self::with_bits(DEFAULT_BITS)
    }

    /// Create an empty store with `2^bits` buckets (clamped to the valid range)
    pub fn with_bits(bits: u8) -> Self {
        let bits = bits.clamp(MIN_BITS, MAX_BITS);
        let mut buckets = Vec::with_capacity(1 << bits);
        buckets.resize_with(1 << bits, Vec::new);
        Self {
            buckets,
            bits,
            len: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn bits(&self) -> u8 {
        self.bits
    }

    pub fn bucket_count(&self) -> usize {
        self.buckets.len()
    }

    /// Insert without a uniqueness check.
    ///
    /// Used where a higher-level check already guarantees the key is new,
    /// or where several entries per key are intended.
    pub fn add(&mut self, key: Addr, entry: V) -> Result<()> {
        let bucket = &mut self.buckets[hash_ptr(key, self.bits)];
        bucket
            .try_reserve(1)
            .map_err(|_| InterceptError::NoMemory)?;
        bucket.push((key, entry));
        self.len += 1;
        self.rebalance();
        Ok(())
    }

    /// Insert only if `key` is absent; `Busy` otherwise
    pub fn add_unique(&mut self, key: Addr, entry: V) -> Result<()> {
        if self.contains(key) {
            return Err(InterceptError::Busy);
        }
        self.add(key, entry)
    }

    pub fn find(&self, key: Addr) -> Option<&V> {
        self.buckets[hash_ptr(key, self.bits)]
            .iter()
            .rev()
            .find(|(k, _)| *k == key)
            .map(|(_, v)| v)
    }

    pub fn find_mut(&mut self, key: Addr) -> Option<&mut V> {
        self.buckets[hash_ptr(key, self.bits)]
            .iter_mut()
            .rev()
            .find(|(k, _)| *k == key)
            .map(|(_, v)| v)
    }

    pub fn contains(&self, key: Addr) -> bool {
        self.find(key).is_some()
    }

    /// Remove the most recently added entry for `key`
    pub fn remove(&mut self, key: Addr) -> Option<V> {
        let bucket = &mut self.buckets[hash_ptr(key, self.bits)];
        let pos = bucket.iter().rposition(|(k, _)| *k == key)?;
        let (_, entry) = bucket.remove(pos);
        self.len -= 1;
        self.rebalance();
        Some(entry)
    }

    /// Keep only the entries for which `keep` answers true
    pub fn retain(&mut self, mut keep: impl FnMut(Addr, &mut V) -> bool) {
        let mut removed = 0;
        for bucket in &mut self.buckets {
            let before = bucket.len();
            bucket.retain_mut(|(k, v)| keep(*k, v));
            removed += before - bucket.len();
        }
        self.len -= removed;
    }

    pub fn iter(&self) -> impl Iterator<Item = (Addr, &V)> {
        self.buckets
            .iter()
            .flat_map(|bucket| bucket.iter().map(|(k, v)| (*k, v)))
    }

    pub fn keys(&self) -> impl Iterator<Item = Addr> + '_ {
        self.iter().map(|(k, _)| k)
    }

    /// Remove and return every entry
    pub fn drain(&mut self) -> Vec<(Addr, V)> {
        let mut out = Vec::with_capacity(self.len);
        for bucket in &mut self.buckets {
            out.append(bucket);
        }
        self.len = 0;
        out
    }

    /// Consume the store, handing every remaining entry to `cleanup`.
    ///
    /// Owners use the callback to report entries that were never removed.
    pub fn destroy(mut self, mut cleanup: impl FnMut(Addr, V)) {
        for (key, entry) in self.drain() {
            cleanup(key, entry);
        }
    }

    /// Double the bucket count
    pub fn grow(&mut self) -> Result<()> {
        if self.bits >= MAX_BITS {
            return Ok(());
        }
        self.resize_with(self.bits + 1, &alloc_buckets::<V>)
    }

    /// Halve the bucket count.
    ///
    /// If the target array cannot be allocated, the store first falls back
    /// to the minimum size and then retries the target from there.
    pub fn shrink(&mut self) -> Result<()> {
        if self.bits <= MIN_BITS {
            return Ok(());
        }
        self.shrink_with(self.bits - 1, &alloc_buckets::<V>)
    }

    fn shrink_with(
        &mut self,
        target: u8,
        alloc: &dyn Fn(u8) -> std::result::Result<Vec<Bucket<V>>, TryReserveError>,
    ) -> Result<()> {
        if self.resize_with(target, alloc).is_ok() {
            return Ok(());
        }
        if target == MIN_BITS {
            return Err(InterceptError::NoMemory);
        }
        self.resize_with(MIN_BITS, alloc)?;
        if self.resize_with(target, alloc).is_err() {
            tracing::debug!(
                target_bits = target,
                "keyed store shrink settled at minimum size"
            );
        }
        Ok(())
    }

    /// Rehash every entry into a freshly allocated array of `2^bits`
    /// buckets. On failure the store is left untouched.
    fn resize_with(
        &mut self,
        bits: u8,
        alloc: &dyn Fn(u8) -> std::result::Result<Vec<Bucket<V>>, TryReserveError>,
    ) -> Result<()> {
        if bits == self.bits {
            return Ok(());
        }
        let mut buckets = alloc(bits).map_err(|_| InterceptError::NoMemory)?;

        let mut counts = vec![0usize; buckets.len()];
        for (key, _) in self.iter() {
            counts[hash_ptr(key, bits)] += 1;
        }
        for (bucket, count) in buckets.iter_mut().zip(&counts) {
            bucket
                .try_reserve_exact(*count)
                .map_err(|_| InterceptError::NoMemory)?;
        }

        for old in &mut self.buckets {
            for (key, entry) in old.drain(..) {
                buckets[hash_ptr(key, bits)].push((key, entry));
            }
        }
        self.buckets = buckets;
        self.bits = bits;
        Ok(())
    }

    // Automatic resizing is switched off; see the module documentation.
    fn needs_expand(&self) -> bool {
        false
    }

    fn needs_narrow(&self) -> bool {
        false
    }

    fn rebalance(&mut self) {
        let outcome = if self.needs_expand() {
            self.grow()
        } else if self.needs_narrow() {
            self.shrink()
        } else {
            Ok(())
        };
        if let Err(e) = outcome {
            tracing::debug!("keyed store resize skipped: {}", e);
        }
    }
}

impl<V> Default for KeyedStore<V> {
    fn default() -> Self {
        Self::new()
    }
}
