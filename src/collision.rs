//! Cross-interceptor collision sets
//!
//! Two sets of claimed addresses, each behind its own lock:
//! - operation-pointer fields patched by indirect or foreign instrumentors;
//! - objects patched directly by direct instrumentors.
//!
//! A claim exists iff some instrumentor currently patches that exact
//! address. Claims are always taken and released outside of any
//! instrumentor lock.

use crate::addr::Addr;
use crate::error::{InterceptError, Result};
use crate::keyed_store::{KeyedStore, DEFAULT_BITS};
use parking_lot::Mutex;
use std::fmt;

/// Identifier of an instrumentor inside one engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct OwnerId(pub u64);

impl fmt::Display for OwnerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Which collision set a claim lives in
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClaimKind {
    Field,
    Object,
}

impl fmt::Display for ClaimKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClaimKind::Field => write!(f, "field"),
            ClaimKind::Object => write!(f, "object"),
        }
    }
}

/// Claimed addresses shared by every instrumentor of one engine
#[derive(Debug)]
pub struct CollisionRegistry {
    fields: Mutex<KeyedStore<OwnerId>>,
    objects: Mutex<KeyedStore<OwnerId>>,
    report_leaks: bool,
}

impl CollisionRegistry {
    pub fn new() -> Self {
        Self::with_bits(DEFAULT_BITS)
    }

    pub fn with_bits(bits: u8) -> Self {
        Self {
            fields: Mutex::new(KeyedStore::with_bits(bits)),
            objects: Mutex::new(KeyedStore::with_bits(bits)),
            report_leaks: true,
        }
    }

    /// Whether claims still outstanding on drop are logged as errors
    pub fn with_leak_reports(mut self, report_leaks: bool) -> Self {
        self.report_leaks = report_leaks;
        self
    }

    fn set(&self, kind: ClaimKind) -> &Mutex<KeyedStore<OwnerId>> {
        match kind {
            ClaimKind::Field => &self.fields,
            ClaimKind::Object => &self.objects,
        }
    }

    /// Take exclusive ownership of `addr`; `Busy` if anybody holds it
    pub fn claim(&self, kind: ClaimKind, addr: Addr, owner: OwnerId) -> Result<()> {
        let result = self.set(kind).lock().add_unique(addr, owner);
        if let Err(InterceptError::Busy) = result {
            tracing::debug!(%kind, %addr, %owner, "collision: address already claimed");
        }
        result
    }

    /// Drop the claim on `addr`.
    ///
    /// # Panics
    ///
    /// Panics if `addr` is not claimed: every release must pair with a claim.
    pub fn release(&self, kind: ClaimKind, addr: Addr) {
        let removed = self.set(kind).lock().remove(addr);
        assert!(
            removed.is_some(),
            "release of unclaimed {} address {}",
            kind,
            addr
        );
    }

    pub fn owner(&self, kind: ClaimKind, addr: Addr) -> Option<OwnerId> {
        self.set(kind).lock().find(addr).copied()
    }

    pub fn claim_field(&self, field: Addr, owner: OwnerId) -> Result<()> {
        self.claim(ClaimKind::Field, field, owner)
    }

    pub fn release_field(&self, field: Addr) {
        self.release(ClaimKind::Field, field)
    }

    pub fn field_owner(&self, field: Addr) -> Option<OwnerId> {
        self.owner(ClaimKind::Field, field)
    }

    pub fn claim_object(&self, object: Addr, owner: OwnerId) -> Result<()> {
        self.claim(ClaimKind::Object, object, owner)
    }

    pub fn release_object(&self, object: Addr) {
        self.release(ClaimKind::Object, object)
    }

    pub fn object_owner(&self, object: Addr) -> Option<OwnerId> {
        self.owner(ClaimKind::Object, object)
    }

    /// Number of live claims of one kind
    pub fn claim_count(&self, kind: ClaimKind) -> usize {
        self.set(kind).lock().len()
    }

    fn take_set(set: &Mutex<KeyedStore<OwnerId>>) -> KeyedStore<OwnerId> {
        let mut guard = set.lock();
        let bits = guard.bits();
        std::mem::replace(&mut *guard, KeyedStore::with_bits(bits))
    }

    /// Remove every claim still outstanding, reporting each one.
    ///
    /// Outstanding claims mean some instrumentor was never destroyed.
    pub fn drain_outstanding(&self, mut report: impl FnMut(ClaimKind, Addr, OwnerId)) -> usize {
        let fields = Self::take_set(&self.fields);
        let objects = Self::take_set(&self.objects);
        let leaked = fields.len() + objects.len();
        fields.destroy(|addr, owner| report(ClaimKind::Field, addr, owner));
        objects.destroy(|addr, owner| report(ClaimKind::Object, addr, owner));
        leaked
    }
}

impl Default for CollisionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for CollisionRegistry {
    fn drop(&mut self) {
        let report_leaks = self.report_leaks;
        self.drain_outstanding(|kind, addr, owner| {
            if report_leaks {
                tracing::error!(%kind, %addr, %owner, "collision claim leaked at teardown");
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_second_claim_is_busy() {
        let registry = CollisionRegistry::new();
        let field = Addr::new(0x4000);

        registry.claim_field(field, OwnerId(1)).unwrap();
        assert_eq!(
            registry.claim_field(field, OwnerId(2)),
            Err(InterceptError::Busy)
        );
        assert_eq!(registry.field_owner(field), Some(OwnerId(1)));
        assert_eq!(registry.claim_count(ClaimKind::Field), 1);
    }

    #[test]
    fn test_field_and_object_sets_are_independent() {
        let registry = CollisionRegistry::new();
        let addr = Addr::new(0x8000);

        registry.claim_field(addr, OwnerId(1)).unwrap();
        registry.claim_object(addr, OwnerId(2)).unwrap();
        registry.release_field(addr);
        assert_eq!(registry.object_owner(addr), Some(OwnerId(2)));
        registry.release_object(addr);
    }

    #[test]
    fn test_release_allows_new_claim() {
        let registry = CollisionRegistry::new();
        let field = Addr::new(0x4000);

        registry.claim_field(field, OwnerId(1)).unwrap();
        registry.release_field(field);
        registry.claim_field(field, OwnerId(2)).unwrap();
        assert_eq!(registry.field_owner(field), Some(OwnerId(2)));
        registry.release_field(field);
    }

    #[test]
    #[should_panic(expected = "release of unclaimed")]
    fn test_release_without_claim_panics() {
        let registry = CollisionRegistry::new();
        registry.release_object(Addr::new(0x10));
    }

    #[test]
    fn test_drain_reports_outstanding_claims() {
        let registry = CollisionRegistry::new();
        registry.claim_field(Addr::new(0x100), OwnerId(3)).unwrap();
        registry.claim_object(Addr::new(0x200), OwnerId(4)).unwrap();
        registry.claim_object(Addr::new(0x300), OwnerId(4)).unwrap();
        registry.release_object(Addr::new(0x300));

        let mut leaks = Vec::new();
        let leaked = registry.drain_outstanding(|kind, addr, owner| leaks.push((kind, addr, owner)));
        assert_eq!(leaked, 2);
        assert_eq!(leaks.len(), 2);
        assert!(leaks.contains(&(ClaimKind::Field, Addr::new(0x100), OwnerId(3))));
        assert!(leaks.contains(&(ClaimKind::Object, Addr::new(0x200), OwnerId(4))));
    }

    #[test]
    fn test_drain_leaves_registry_reusable() {
        let registry = CollisionRegistry::new().with_leak_reports(false);
        registry.claim_field(Addr::new(0x100), OwnerId(3)).unwrap();

        assert_eq!(registry.drain_outstanding(|_, _, _| {}), 1);
        assert_eq!(registry.claim_count(ClaimKind::Field), 0);
        assert_eq!(registry.drain_outstanding(|_, _, _| {}), 0);

        // Dropping with a live claim and reports disabled is silent
        registry.claim_field(Addr::new(0x100), OwnerId(5)).unwrap();
        drop(registry);
    }
}
