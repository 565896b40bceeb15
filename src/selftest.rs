//! Built-in end-to-end check over a synthetic operations table
//!
//! Sets up a sample object type with a two-operation table, an interceptor
//! with one pre-handler on the first operation and a factory over the same
//! table, then walks the documented scenarios and records whether each one
//! behaved. Used by `optrap selftest`.
//!
//! The replacement functions find their interceptor through process-wide
//! slots, so only one self-test may run at a time.

use crate::addr::Addr;
use crate::config::EngineConfig;
use crate::engine::Engine;
use crate::error::InterceptError;
use crate::factory::FactoryInterceptor;
use crate::instrumentor::{ForgetOutcome, WatchOutcome};
use crate::interceptor::{Interceptor, InterceptorStats};
use crate::payload::{Handler, Payload};
use crate::schema::{IntermediateOp, OpsSchema};
use anyhow::{Context, Result};
use parking_lot::{const_mutex, const_rwlock, Mutex, RwLock};
use serde::Serialize;
use std::mem::{offset_of, size_of};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

type SampleFn = extern "C" fn(*mut SampleObject, i32) -> i32;
type HandlerFn = extern "C" fn(*mut SampleObject, i32);

#[repr(C)]
struct SampleOps {
    op_a: Option<SampleFn>,
    op_b: Option<SampleFn>,
}

#[repr(C)]
struct SampleObject {
    ops: *const SampleOps,
    proto: *mut SampleObject,
}

const OP_A: usize = offset_of!(SampleOps, op_a);
const OP_B: usize = offset_of!(SampleOps, op_b);
const FAILED: i32 = i32::MIN;

static ACTIVE: RwLock<Option<Arc<Interceptor>>> = const_rwlock(None);
static FACTORY: RwLock<Option<Arc<FactoryInterceptor>>> = const_rwlock(None);
static RUNNING: Mutex<()> = const_mutex(());
static PRE_HITS: AtomicUsize = AtomicUsize::new(0);

extern "C" fn base_a(_object: *mut SampleObject, x: i32) -> i32 {
    x + 1
}

extern "C" fn base_b(_object: *mut SampleObject, x: i32) -> i32 {
    x * 2
}

extern "C" fn count_pre(_object: *mut SampleObject, _x: i32) {
    PRE_HITS.fetch_add(1, Ordering::SeqCst);
}

extern "C" fn intermediate_a(object: *mut SampleObject, x: i32) -> i32 {
    dispatch(object, OP_A, x)
}

extern "C" fn intermediate_b(object: *mut SampleObject, x: i32) -> i32 {
    dispatch(object, OP_B, x)
}

extern "C" fn foreign_a(object: *mut SampleObject, x: i32) -> i32 {
    chain(object, OP_A, x)
}

fn dispatch(object: *mut SampleObject, offset: usize, x: i32) -> i32 {
    let Some(interceptor) = ACTIVE.read().clone() else {
        return FAILED;
    };
    // SAFETY: intermediates are only installed into live sample objects.
    let info = match unsafe { interceptor.get_intermediate_info(Addr::from_mut(object), offset) } {
        Ok(info) => info,
        Err(e) => {
            tracing::error!(error = %e, offset, "intermediate without original operation");
            return FAILED;
        }
    };

    for pre in info.pre.iter() {
        // SAFETY: handlers are registered with the HandlerFn signature.
        let handler: HandlerFn = unsafe { pre.cast_fn() };
        handler(object, x);
    }
    let result = match info.op_orig {
        // SAFETY: original slots of a SampleOps table are SampleFn.
        Some(op) => (unsafe { op.cast_fn::<SampleFn>() })(object, x),
        None => 0,
    };
    for post in info.post.iter() {
        let handler: HandlerFn = unsafe { post.cast_fn() };
        handler(object, x);
    }
    result
}

fn chain(object: *mut SampleObject, offset: usize, x: i32) -> i32 {
    let Some(factory) = FACTORY.read().clone() else {
        return FAILED;
    };
    let addr = Addr::from_mut(object);
    // SAFETY: as for `dispatch`; `ops` is the first field.
    let tie = Addr::from_mut(unsafe { (*object).proto });
    match unsafe { factory.bind(addr, tie, addr, offset) } {
        Ok(Some(op)) => (unsafe { op.cast_fn::<SampleFn>() })(object, x),
        Ok(None) => 0,
        Err(e) => {
            tracing::error!(error = %e, offset, "cannot chain foreign call");
            FAILED
        }
    }
}

fn sample_schema() -> crate::error::Result<OpsSchema> {
    OpsSchema::indirect(
        "sample_ops",
        offset_of!(SampleObject, ops),
        size_of::<SampleOps>(),
    )
    .operation(IntermediateOp::new(
        "op_a",
        OP_A,
        Addr::from_fn(intermediate_a as SampleFn),
    ))
    .operation(IntermediateOp::new(
        "op_b",
        OP_B,
        Addr::from_fn(intermediate_b as SampleFn),
    ))
    .build()
}

fn factory_schema() -> crate::error::Result<OpsSchema> {
    OpsSchema::indirect(
        "sample_factory",
        offset_of!(SampleObject, ops),
        size_of::<SampleOps>(),
    )
    .operation(IntermediateOp::new(
        "op_a",
        OP_A,
        Addr::from_fn(foreign_a as SampleFn),
    ))
    .build()
}

fn sample_table() -> Box<SampleOps> {
    Box::new(SampleOps {
        op_a: Some(base_a),
        op_b: Some(base_b),
    })
}

fn sample_object(ops: *const SampleOps, proto: *mut SampleObject) -> Box<SampleObject> {
    Box::new(SampleObject { ops, proto })
}

/// Call `op_a` the way the owning subsystem would
fn call_a(object: &mut SampleObject, x: i32) -> Option<i32> {
    // SAFETY: `ops` points at a live table (original, copy or patched).
    let op = unsafe { (*object.ops).op_a }?;
    Some(op(object, x))
}

fn addr(object: &mut SampleObject) -> Addr {
    Addr::from_mut(object as *mut SampleObject)
}

fn hits() -> usize {
    PRE_HITS.load(Ordering::SeqCst)
}

/// One scenario and whether it behaved
#[derive(Debug, Clone, Serialize)]
pub struct Check {
    pub name: &'static str,
    pub passed: bool,
    pub detail: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct SelftestReport {
    pub checks: Vec<Check>,
    /// Interceptor counters taken before it was stopped
    pub stats: InterceptorStats,
}

impl SelftestReport {
    pub fn passed(&self) -> bool {
        self.checks.iter().all(|c| c.passed)
    }

    pub fn failures(&self) -> usize {
        self.checks.iter().filter(|c| !c.passed).count()
    }
}

#[derive(Default)]
struct Checks(Vec<Check>);

impl Checks {
    fn record(&mut self, name: &'static str, passed: bool, detail: String) {
        if passed {
            tracing::debug!(check = name, "passed");
        } else {
            tracing::warn!(check = name, %detail, "failed");
        }
        self.0.push(Check {
            name,
            passed,
            detail,
        });
    }
}

/// Clears the process-wide slots however the run ends
struct SlotGuard;

impl Drop for SlotGuard {
    fn drop(&mut self) {
        FACTORY.write().take();
        ACTIVE.write().take();
    }
}

/// Run every scenario with an engine built from `config`
pub fn run_selftest(config: &EngineConfig) -> Result<SelftestReport> {
    let _running = RUNNING.lock();
    let engine = Engine::with_config(config.clone()).context("Invalid engine configuration")?;

    let interceptor = Arc::new(
        Interceptor::new(&engine, sample_schema().context("Sample schema rejected")?)
            .context("Failed to create interceptor")?,
    );
    let factory = interceptor
        .add_factory(factory_schema().context("Factory schema rejected")?)
        .context("Failed to attach factory")?;
    let payload = Arc::new(
        Payload::new("selftest").pre(Handler::new(OP_A, Addr::from_fn(count_pre as HandlerFn))),
    );
    interceptor
        .register_payload(payload.clone())
        .context("Failed to register payload")?;
    interceptor.start().context("Failed to start interceptor")?;

    let _slots = SlotGuard;
    *ACTIVE.write() = Some(interceptor.clone());
    *FACTORY.write() = Some(factory.clone());

    let mut checks = Checks::default();
    let scenarios = run_indirect(&interceptor, &engine, &mut checks)
        .and_then(|()| run_foreign(&interceptor, &factory, &mut checks));

    let stats = interceptor.stats();
    interceptor.stop_with(&mut |object| {
        tracing::warn!(%object, "self-test left an object watched");
    });
    interceptor
        .unregister_payload(&payload)
        .context("Failed to unregister payload")?;
    scenarios?;

    Ok(SelftestReport {
        checks: checks.0,
        stats,
    })
}

fn run_indirect(interceptor: &Interceptor, engine: &Engine, checks: &mut Checks) -> Result<()> {
    // Everything fallible happens before the first watch
    let rival = Interceptor::new(engine, sample_schema()?).context("Failed to create rival")?;
    rival.start().context("Failed to start rival")?;

    let table = sample_table();
    let table_ptr: *const SampleOps = &*table;
    let mut first = sample_object(table_ptr, std::ptr::null_mut());
    let mut second = sample_object(table_ptr, std::ptr::null_mut());

    // SAFETY: both objects and their table outlive the watch.
    let watched = unsafe { (interceptor.watch(addr(&mut first)), interceptor.watch(addr(&mut second))) };
    let records = interceptor.stats().records;
    checks.record(
        "sharing",
        watched == (Ok(WatchOutcome::New), Ok(WatchOutcome::New)) && records == 1,
        format!("watch results {:?}, {} record(s)", watched, records),
    );

    let before = hits();
    let result = call_a(&mut first, 1);
    checks.record(
        "pre-handler wraps op_a",
        result == Some(2) && hits() == before + 1,
        format!("op_a returned {:?}, handler ran {} time(s)", result, hits() - before),
    );

    // SAFETY: `first.ops` points at the patched table or the original one.
    let op_b = unsafe { (*first.ops).op_b }.map(|f| f as usize);
    checks.record(
        "op_b left untouched",
        op_b == Some(base_b as *const () as usize),
        format!("op_b slot holds {:?}", op_b.map(Addr::new)),
    );

    first.ops = table_ptr;
    let rewatch = unsafe { interceptor.watch(addr(&mut first)) };
    let before = hits();
    let result = call_a(&mut first, 1);
    checks.record(
        "re-watch after reset",
        rewatch == Ok(WatchOutcome::Updated) && result == Some(2) && hits() == before + 1,
        format!("watch returned {:?}, op_a returned {:?}", rewatch, result),
    );

    let contested = unsafe { rival.watch(addr(&mut first)) };
    rival.stop();
    checks.record(
        "mutual exclusion",
        contested == Err(InterceptError::Busy),
        format!("second interceptor got {:?}", contested),
    );

    let forgotten = unsafe { interceptor.forget(addr(&mut first)) };
    checks.record(
        "restore on forget",
        forgotten == Ok(ForgetOutcome::Forgotten) && std::ptr::eq(first.ops, table_ptr),
        format!("forget returned {:?}", forgotten),
    );
    let installed = second.ops;
    let kept = unsafe { interceptor.forget_norestore(addr(&mut second)) };
    checks.record(
        "norestore keeps the table pointer",
        kept == Ok(ForgetOutcome::Forgotten) && std::ptr::eq(second.ops, installed),
        format!("forget_norestore returned {:?}", kept),
    );
    Ok(())
}

fn run_foreign(
    interceptor: &Interceptor,
    factory: &FactoryInterceptor,
    checks: &mut Checks,
) -> Result<()> {
    let table = sample_table();
    let table_ptr: *const SampleOps = &*table;
    let mut proto = sample_object(table_ptr, std::ptr::null_mut());
    let p = addr(&mut proto);

    // SAFETY: the prototype and its table outlive the factory watch.
    let outcome = unsafe { factory.watch(p, p, factory.field_of(p)) }
        .context("Factory failed to watch the prototype")?;
    checks.record(
        "factory patches prototype",
        outcome == WatchOutcome::New && !std::ptr::eq(proto.ops, table_ptr),
        format!("factory watch returned {:?}", outcome),
    );

    let mut copy = sample_object(proto.ops, std::ptr::null_mut());
    let before = hits();
    let result = call_a(&mut copy, 10);
    checks.record(
        "copy without bind",
        result == Some(11) && hits() == before && std::ptr::eq(copy.ops, table_ptr),
        format!("op_a returned {:?}, handler ran {} time(s)", result, hits() - before),
    );

    let proto_ptr: *mut SampleObject = &mut *proto;
    let mut child = sample_object(proto.ops, proto_ptr);
    let c = addr(&mut child);
    let before = hits();
    let result = call_a(&mut child, 10);
    let handed_over = interceptor.stats().watched == 1;
    checks.record(
        "bind hands child over",
        result == Some(11) && hits() == before + 1 && handed_over,
        format!(
            "op_a returned {:?}, handler ran {} time(s), child watched: {}",
            result,
            hits() - before,
            handed_over
        ),
    );

    // SAFETY: as above.
    unsafe {
        interceptor.forget(c).context("Failed to forget child")?;
        factory
            .forget(p, factory.field_of(p))
            .context("Failed to forget prototype")?;
    }
    checks.record(
        "prototype restored",
        std::ptr::eq(proto.ops, table_ptr),
        format!("prototype table pointer {:?}", Addr::from_ptr(proto.ops)),
    );
    Ok(())
}
