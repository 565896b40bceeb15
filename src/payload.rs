//! Payloads: independently authored sets of pre/post handlers
//!
//! A payload belongs to an (optional) owning module. While an interceptor is
//! started every payload it uses keeps its module pinned, so handler code
//! cannot go away underneath a running replacement.

use crate::addr::Addr;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

/// Something that owns handler code and can be kept loaded
pub trait ModuleRef: Send + Sync + fmt::Debug {
    fn name(&self) -> &str;

    /// Keep the module loaded; false if it is already going away
    fn try_pin(&self) -> bool;

    fn unpin(&self);
}

/// Reference-counted module handle
#[derive(Debug)]
pub struct ModuleHandle {
    name: String,
    pins: AtomicUsize,
    unloading: AtomicBool,
}

impl ModuleHandle {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            pins: AtomicUsize::new(0),
            unloading: AtomicBool::new(false),
        }
    }

    /// Refuse new pins from now on
    pub fn begin_unload(&self) {
        self.unloading.store(true, Ordering::Release);
    }

    pub fn is_unloading(&self) -> bool {
        self.unloading.load(Ordering::Acquire)
    }

    pub fn pin_count(&self) -> usize {
        self.pins.load(Ordering::Acquire)
    }
}

impl ModuleRef for ModuleHandle {
    fn name(&self) -> &str {
        &self.name
    }

    fn try_pin(&self) -> bool {
        if self.is_unloading() {
            return false;
        }
        self.pins.fetch_add(1, Ordering::AcqRel);
        true
    }

    fn unpin(&self) {
        let previous = self.pins.fetch_sub(1, Ordering::AcqRel);
        assert!(previous > 0, "module {} unpinned more often than pinned", self.name);
    }
}

/// One handler function attached to the operation at `offset`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Handler {
    pub offset: usize,
    pub function: Addr,
    /// Also fires when the object has no original operation
    pub external: bool,
}

impl Handler {
    pub fn new(offset: usize, function: Addr) -> Self {
        Self {
            offset,
            function,
            external: false,
        }
    }

    pub fn external(mut self) -> Self {
        self.external = true;
        self
    }
}

/// A named set of pre and post handlers
///
/// Payloads are registered as `Arc<Payload>`; identity is the allocation,
/// so two payloads with equal contents are still distinct.
///
/// ```
/// use optrap::{Addr, Handler, Payload};
///
/// let payload = Payload::new("counter")
///     .pre(Handler::new(0, Addr::new(0x1000)))
///     .post(Handler::new(8, Addr::new(0x2000)).external());
/// assert_eq!(payload.pre_handlers().len(), 1);
/// assert!(payload.post_handlers()[0].external);
/// ```
#[derive(Debug, Default)]
pub struct Payload {
    name: String,
    module: Option<std::sync::Arc<dyn ModuleRef>>,
    pre: Vec<Handler>,
    post: Vec<Handler>,
}

impl Payload {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn module(mut self, module: std::sync::Arc<dyn ModuleRef>) -> Self {
        self.module = Some(module);
        self
    }

    pub fn pre(mut self, handler: Handler) -> Self {
        self.pre.push(handler);
        self
    }

    pub fn post(mut self, handler: Handler) -> Self {
        self.post.push(handler);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn owner(&self) -> Option<&std::sync::Arc<dyn ModuleRef>> {
        self.module.as_ref()
    }

    pub fn pre_handlers(&self) -> &[Handler] {
        &self.pre
    }

    pub fn post_handlers(&self) -> &[Handler] {
        &self.post
    }

    /// Every handler, pre first
    pub fn handlers(&self) -> impl Iterator<Item = &Handler> {
        self.pre.iter().chain(self.post.iter())
    }

    /// Pin the owning module; payloads without one always succeed
    pub(crate) fn pin(&self) -> bool {
        self.module.as_ref().map_or(true, |m| m.try_pin())
    }

    pub(crate) fn unpin(&self) {
        if let Some(module) = &self.module {
            module.unpin();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_module_pin_counting() {
        let module = ModuleHandle::new("net");
        assert!(module.try_pin());
        assert!(module.try_pin());
        assert_eq!(module.pin_count(), 2);
        module.unpin();
        assert_eq!(module.pin_count(), 1);

        module.begin_unload();
        assert!(!module.try_pin(), "unloading modules refuse new pins");
        assert_eq!(module.pin_count(), 1);
    }

    #[test]
    #[should_panic(expected = "unpinned more often")]
    fn test_unbalanced_unpin_panics() {
        ModuleHandle::new("fs").unpin();
    }

    #[test]
    fn test_payload_without_module_always_pins() {
        let payload = Payload::new("p").pre(Handler::new(0, Addr::new(1)));
        assert!(payload.pin());
        payload.unpin();
    }

    #[test]
    fn test_payload_pins_through_module() {
        let module = Arc::new(ModuleHandle::new("owner"));
        let payload = Payload::new("p").module(module.clone());
        assert!(payload.pin());
        assert_eq!(module.pin_count(), 1);
        payload.unpin();
        assert_eq!(module.pin_count(), 0);
        assert_eq!(payload.owner().map(|m| m.name()), Some("owner"));
    }
}
