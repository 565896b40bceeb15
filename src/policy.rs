//! Patch placement policies
//!
//! An indirect instrumentor either patches a shared table in place (every
//! holder of that table pointer sees the intermediates) or gives watched
//! objects a private patched copy. The choice is made per table address.

use crate::addr::Addr;
use crate::config::PatchMode;
use std::fmt;
use std::sync::Arc;

/// Decides, per table address, whether to patch in place
pub trait PatchPolicy: Send + Sync + fmt::Debug {
    fn replace_in_place(&self, table: Addr) -> bool;
}

/// Patch in place unless the table lives inside a loaded executable image
/// (static tables are usually read-only and shared by unrelated code)
#[derive(Debug, Default, Clone, Copy)]
pub struct NativeImagePolicy;

impl PatchPolicy for NativeImagePolicy {
    fn replace_in_place(&self, table: Addr) -> bool {
        !table.is_null() && !in_loaded_image(table)
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct AlwaysCopy;

impl PatchPolicy for AlwaysCopy {
    fn replace_in_place(&self, _table: Addr) -> bool {
        false
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct AlwaysInPlace;

impl PatchPolicy for AlwaysInPlace {
    fn replace_in_place(&self, table: Addr) -> bool {
        !table.is_null()
    }
}

/// Policy matching a configured [`PatchMode`]
pub fn policy_for(mode: PatchMode) -> Arc<dyn PatchPolicy> {
    match mode {
        PatchMode::Auto => Arc::new(NativeImagePolicy),
        PatchMode::AlwaysCopy => Arc::new(AlwaysCopy),
        PatchMode::InPlace => Arc::new(AlwaysInPlace),
    }
}

/// True if `addr` belongs to the executable or one of its loaded shared
/// objects
#[cfg(unix)]
pub fn in_loaded_image(addr: Addr) -> bool {
    // SAFETY: dladdr only inspects the loader's link maps and fills `info`.
    unsafe {
        let mut info: libc::Dl_info = std::mem::zeroed();
        libc::dladdr(addr.as_ptr::<libc::c_void>(), &mut info) != 0
    }
}

#[cfg(not(unix))]
pub fn in_loaded_image(_addr: Addr) -> bool {
    // Unknown: treat as shared static data and copy
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    static STATIC_TABLE: [usize; 2] = [1, 2];

    #[test]
    fn test_fixed_policies() {
        let heap = Box::new([0usize; 2]);
        let addr = Addr::from_ptr(heap.as_ptr());

        assert!(!AlwaysCopy.replace_in_place(addr));
        assert!(AlwaysInPlace.replace_in_place(addr));
        assert!(!AlwaysInPlace.replace_in_place(Addr::NULL));
        assert!(!NativeImagePolicy.replace_in_place(Addr::NULL));
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_native_policy_distinguishes_static_and_heap_tables() {
        let heap = Box::new([0usize; 2]);
        assert!(NativeImagePolicy.replace_in_place(Addr::from_ptr(heap.as_ptr())));
        assert!(!NativeImagePolicy.replace_in_place(Addr::from_ptr(STATIC_TABLE.as_ptr())));
    }

    #[test]
    fn test_policy_for_mode() {
        let heap = Box::new([0usize; 1]);
        let addr = Addr::from_ptr(heap.as_ptr());
        assert!(!policy_for(PatchMode::AlwaysCopy).replace_in_place(addr));
        assert!(policy_for(PatchMode::InPlace).replace_in_place(addr));
    }
}
