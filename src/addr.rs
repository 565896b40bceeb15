//! Raw addresses and pointer-sized slot access
//!
//! Operation tables are treated as arrays of pointer-sized slots addressed
//! by byte offset. All slot reads and writes go through atomic views so that
//! a replacement function running on another thread never observes a torn
//! pointer.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::mem;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Size of one operation slot in bytes
pub const SLOT_SIZE: usize = mem::size_of::<usize>();

/// Opaque machine address: an object, an ops-pointer field, a table or a
/// function
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[repr(transparent)]
pub struct Addr(usize);

impl Addr {
    pub const NULL: Addr = Addr(0);

    pub const fn new(value: usize) -> Self {
        Addr(value)
    }

    pub fn from_ptr<T>(ptr: *const T) -> Self {
        Addr(ptr as usize)
    }

    pub fn from_mut<T>(ptr: *mut T) -> Self {
        Addr(ptr as usize)
    }

    pub const fn get(self) -> usize {
        self.0
    }

    pub const fn is_null(self) -> bool {
        self.0 == 0
    }

    /// `None` for the null address
    pub fn non_null(self) -> Option<Addr> {
        if self.is_null() {
            None
        } else {
            Some(self)
        }
    }

    /// Address `offset` bytes past this one
    pub const fn add(self, offset: usize) -> Addr {
        Addr(self.0.wrapping_add(offset))
    }

    pub fn as_ptr<T>(self) -> *const T {
        self.0 as *const T
    }

    pub fn as_mut_ptr<T>(self) -> *mut T {
        self.0 as *mut T
    }

    /// Reinterpret this address as a function pointer of type `F`.
    ///
    /// Intermediate functions use this to call the original operation and
    /// the handlers returned by [`crate::Interceptor::get_intermediate_info`].
    ///
    /// # Safety
    ///
    /// The address must be a non-null function of exactly the signature `F`.
    ///
    /// # Panics
    ///
    /// Panics if `F` is not pointer-sized.
    pub unsafe fn cast_fn<F: Copy>(self) -> F {
        assert_eq!(
            mem::size_of::<F>(),
            SLOT_SIZE,
            "cast_fn target must be a plain function pointer"
        );
        debug_assert!(!self.is_null(), "cast_fn on a null address");
        // SAFETY: sizes match; the caller vouches for the signature.
        unsafe { mem::transmute_copy(&self.0) }
    }

    /// Address of a function pointer, for building schemas and handlers.
    ///
    /// # Panics
    ///
    /// Panics if `F` is not pointer-sized.
    pub fn from_fn<F: Copy>(function: F) -> Self {
        assert_eq!(
            mem::size_of::<F>(),
            SLOT_SIZE,
            "from_fn source must be a plain function pointer"
        );
        // SAFETY: sizes match and any bit pattern is a valid usize.
        Addr(unsafe { mem::transmute_copy(&function) })
    }
}

impl fmt::Debug for Addr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

impl fmt::Display for Addr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

impl<T> From<*const T> for Addr {
    fn from(ptr: *const T) -> Self {
        Addr::from_ptr(ptr)
    }
}

impl<T> From<*mut T> for Addr {
    fn from(ptr: *mut T) -> Self {
        Addr::from_mut(ptr)
    }
}

/// # Safety
///
/// `base + offset` must be a live, aligned, pointer-sized location for `'a`.
unsafe fn slot_cell<'a>(base: Addr, offset: usize) -> &'a AtomicUsize {
    let ptr = base.add(offset).as_ptr::<AtomicUsize>();
    debug_assert!(
        ptr as usize % mem::align_of::<AtomicUsize>() == 0,
        "misaligned slot at {:?}",
        base.add(offset)
    );
    // SAFETY: guaranteed by the caller.
    unsafe { &*ptr }
}

/// Read the pointer-sized slot at `base + offset`.
///
/// # Safety
///
/// `base + offset` must point to live, aligned, pointer-sized memory.
pub(crate) unsafe fn load_slot(base: Addr, offset: usize) -> Addr {
    Addr(unsafe { slot_cell(base, offset) }.load(Ordering::Acquire))
}

/// Write the pointer-sized slot at `base + offset`.
///
/// # Safety
///
/// `base + offset` must point to live, aligned, writable pointer-sized memory.
pub(crate) unsafe fn store_slot(base: Addr, offset: usize, value: Addr) {
    unsafe { slot_cell(base, offset) }.store(value.0, Ordering::Release);
}

/// Replace the slot value only if it still equals `current`.
///
/// # Safety
///
/// Same as [`store_slot`].
pub(crate) unsafe fn replace_slot_if(base: Addr, offset: usize, current: Addr, new: Addr) -> bool {
    unsafe { slot_cell(base, offset) }
        .compare_exchange(current.0, new.0, Ordering::AcqRel, Ordering::Acquire)
        .is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    extern "C" fn double(x: i32) -> i32 {
        x * 2
    }

    #[test]
    fn test_null_and_offsets() {
        assert!(Addr::NULL.is_null());
        assert_eq!(Addr::NULL.non_null(), None);
        assert_eq!(Addr::new(0x1000).add(8), Addr::new(0x1008));
        assert_eq!(format!("{:?}", Addr::new(255)), "0xff");
    }

    #[test]
    fn test_cast_fn_roundtrip_calls_function() {
        let addr = Addr::from_fn(double as extern "C" fn(i32) -> i32);
        assert_eq!(addr, Addr::new(double as *const () as usize));
        let f: extern "C" fn(i32) -> i32 = unsafe { addr.cast_fn() };
        assert_eq!(f(21), 42);
    }

    #[test]
    #[should_panic(expected = "plain function pointer")]
    fn test_cast_fn_rejects_wide_types() {
        let _: (usize, usize) = unsafe { Addr::new(1).cast_fn() };
    }

    #[test]
    fn test_slot_access() {
        let mut table = [1usize, 2, 3];
        let base = Addr::from_mut(table.as_mut_ptr());
        unsafe {
            assert_eq!(load_slot(base, SLOT_SIZE), Addr::new(2));
            store_slot(base, 2 * SLOT_SIZE, Addr::new(30));
            assert!(!replace_slot_if(base, 0, Addr::new(5), Addr::new(10)));
            assert!(replace_slot_if(base, 0, Addr::new(1), Addr::new(10)));
        }
        assert_eq!(table, [10, 2, 30]);
    }
}
