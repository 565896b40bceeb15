//! Shared fixtures for integration tests
//!
//! A sample object type `TestObj` whose operations live in a two-slot
//! `TestOps` table, intermediates that route through whichever interceptor
//! (and factory) is currently installed, and a call log recording what ran.
#![allow(dead_code)]

use optrap::{
    Addr, Engine, FactoryInterceptor, Handler, Interceptor, IntermediateOp, OpsSchema, Payload,
};
use parking_lot::{const_mutex, const_rwlock, Mutex, RwLock};
use std::mem::{offset_of, size_of};
use std::sync::Arc;

pub type OpFn = extern "C" fn(*mut TestObj, i32) -> i32;
pub type HookFn = extern "C" fn(*mut TestObj, i32);

#[repr(C)]
pub struct TestOps {
    pub op_a: Option<OpFn>,
    pub op_b: Option<OpFn>,
}

#[repr(C)]
pub struct TestObj {
    pub ops: *const TestOps,
    /// Prototype this object was created from, if any
    pub proto: *mut TestObj,
}

pub const OP_A: usize = offset_of!(TestOps, op_a);
pub const OP_B: usize = offset_of!(TestOps, op_b);
pub const OPS_FIELD: usize = offset_of!(TestObj, ops);
pub const FAILED: i32 = -1;

static INTERCEPTOR: RwLock<Option<Arc<Interceptor>>> = const_rwlock(None);
static FACTORY: RwLock<Option<Arc<FactoryInterceptor>>> = const_rwlock(None);
static CALLS: Mutex<Vec<&'static str>> = const_mutex(Vec::new());

fn log(event: &'static str) {
    CALLS.lock().push(event);
}

pub extern "C" fn f1(_object: *mut TestObj, x: i32) -> i32 {
    log("f1");
    x + 1
}

pub extern "C" fn f2(_object: *mut TestObj, x: i32) -> i32 {
    log("f2");
    x * 2
}

pub extern "C" fn pre_hook(_object: *mut TestObj, _x: i32) {
    log("pre");
}

pub extern "C" fn post_hook(_object: *mut TestObj, _x: i32) {
    log("post");
}

pub extern "C" fn default_hook(_object: *mut TestObj, _x: i32) {
    log("default");
}

pub extern "C" fn intermediate_a(object: *mut TestObj, x: i32) -> i32 {
    dispatch(object, OP_A, x)
}

pub extern "C" fn intermediate_b(object: *mut TestObj, x: i32) -> i32 {
    dispatch(object, OP_B, x)
}

pub extern "C" fn foreign_a(object: *mut TestObj, x: i32) -> i32 {
    chain(object, OP_A, x)
}

pub extern "C" fn foreign_b(object: *mut TestObj, x: i32) -> i32 {
    chain(object, OP_B, x)
}

fn dispatch(object: *mut TestObj, offset: usize, x: i32) -> i32 {
    let interceptor = INTERCEPTOR
        .read()
        .clone()
        .expect("no interceptor installed");
    let info = match unsafe { interceptor.get_intermediate_info(Addr::from_mut(object), offset) } {
        Ok(info) => info,
        Err(_) => {
            log("error");
            return FAILED;
        }
    };
    for pre in info.pre.iter() {
        let hook: HookFn = unsafe { pre.cast_fn() };
        hook(object, x);
    }
    let result = match info.op_orig {
        Some(op) => (unsafe { op.cast_fn::<OpFn>() })(object, x),
        None => 0,
    };
    for post in info.post.iter() {
        let hook: HookFn = unsafe { post.cast_fn() };
        hook(object, x);
    }
    result
}

fn chain(object: *mut TestObj, offset: usize, x: i32) -> i32 {
    let factory = FACTORY.read().clone().expect("no factory installed");
    let addr = Addr::from_mut(object);
    let tie = Addr::from_mut(unsafe { (*object).proto });
    match unsafe { factory.bind(addr, tie, addr.add(OPS_FIELD), offset) } {
        Ok(Some(op)) => (unsafe { op.cast_fn::<OpFn>() })(object, x),
        Ok(None) => 0,
        Err(_) => {
            log("error");
            FAILED
        }
    }
}

pub fn intermediate(offset: usize) -> Addr {
    match offset {
        OP_A => Addr::from_fn(intermediate_a as OpFn),
        OP_B => Addr::from_fn(intermediate_b as OpFn),
        _ => unreachable!("no such operation"),
    }
}

pub fn hook(function: HookFn) -> Addr {
    Addr::from_fn(function)
}

/// Schema over both operations; `groups` gives the group of op_a and op_b
pub fn grouped_schema(groups: (u32, u32)) -> OpsSchema {
    OpsSchema::indirect("test_ops", OPS_FIELD, size_of::<TestOps>())
        .operation(IntermediateOp::new("op_a", OP_A, intermediate(OP_A)).group(groups.0))
        .operation(IntermediateOp::new("op_b", OP_B, intermediate(OP_B)).group(groups.1))
        .build()
        .unwrap()
}

pub fn schema() -> OpsSchema {
    grouped_schema((0, 0))
}

pub fn factory_schema() -> OpsSchema {
    OpsSchema::indirect("test_factory", OPS_FIELD, size_of::<TestOps>())
        .operation(IntermediateOp::new(
            "op_a",
            OP_A,
            Addr::from_fn(foreign_a as OpFn),
        ))
        .operation(IntermediateOp::new(
            "op_b",
            OP_B,
            Addr::from_fn(foreign_b as OpFn),
        ))
        .build()
        .unwrap()
}

/// Payload with one pre-handler on op_a
pub fn pre_payload() -> Arc<Payload> {
    Arc::new(Payload::new("pre_on_a").pre(Handler::new(OP_A, hook(pre_hook))))
}

/// Make `interceptor` the one intermediates dispatch to and clear the log
pub fn install(interceptor: &Arc<Interceptor>) {
    *INTERCEPTOR.write() = Some(interceptor.clone());
    CALLS.lock().clear();
}

pub fn install_factory(factory: &Arc<FactoryInterceptor>) {
    *FACTORY.write() = Some(factory.clone());
}

/// Drop the installed interceptor and factory
pub fn uninstall() {
    FACTORY.write().take();
    INTERCEPTOR.write().take();
}

pub fn take_calls() -> Vec<&'static str> {
    std::mem::take(&mut *CALLS.lock())
}

/// Started interceptor carrying `payload`, installed for dispatch
pub fn started(engine: &Engine, schema: OpsSchema, payload: &Arc<Payload>) -> Arc<Interceptor> {
    let interceptor = Arc::new(Interceptor::new(engine, schema).unwrap());
    interceptor.register_payload(payload.clone()).unwrap();
    interceptor.start().unwrap();
    install(&interceptor);
    interceptor
}

/// Stop, unregister and uninstall
pub fn teardown(interceptor: Arc<Interceptor>, payload: &Arc<Payload>) {
    assert!(interceptor.stop());
    interceptor.unregister_payload(payload).unwrap();
    uninstall();
}

pub fn table(op_a: Option<OpFn>, op_b: Option<OpFn>) -> Box<TestOps> {
    Box::new(TestOps { op_a, op_b })
}

pub fn base_table() -> Box<TestOps> {
    table(Some(f1), Some(f2))
}

pub fn object(ops: *const TestOps) -> Box<TestObj> {
    Box::new(TestObj {
        ops,
        proto: std::ptr::null_mut(),
    })
}

pub fn addr_of(object: &mut TestObj) -> Addr {
    Addr::from_mut(object as *mut TestObj)
}

pub fn table_addr(ops: *const TestOps) -> Addr {
    Addr::from_ptr(ops)
}

pub fn call_a(object: &mut TestObj, x: i32) -> Option<i32> {
    let op = unsafe { (*object.ops).op_a }?;
    Some(op(object, x))
}

pub fn call_b(object: &mut TestObj, x: i32) -> Option<i32> {
    let op = unsafe { (*object.ops).op_b }?;
    Some(op(object, x))
}

/// Address stored in op_b of the table `object` currently references
pub fn slot_b(object: &TestObj) -> Option<usize> {
    unsafe { (*object.ops).op_b }.map(|f| f as usize)
}

pub fn slot_a(object: &TestObj) -> Option<usize> {
    unsafe { (*object.ops).op_a }.map(|f| f as usize)
}
