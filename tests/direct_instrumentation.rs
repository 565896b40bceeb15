//! Objects carrying their operations as their own fields

use optrap::collision::ClaimKind;
use optrap::{
    Addr, Engine, ForgetOutcome, Handler, InterceptError, Interceptor, IntermediateOp, OpsSchema,
    Payload, WatchOutcome,
};
use parking_lot::{const_mutex, const_rwlock, Mutex, RwLock};
use serial_test::serial;
use std::mem::{offset_of, size_of};
use std::sync::Arc;

type EventFn = extern "C" fn(*mut Widget, i32) -> i32;
type HookFn = extern "C" fn(*mut Widget, i32);

#[repr(C)]
struct Widget {
    on_event: Option<EventFn>,
    on_close: Option<EventFn>,
    tag: usize,
}

const ON_EVENT: usize = offset_of!(Widget, on_event);
const ON_CLOSE: usize = offset_of!(Widget, on_close);

static ACTIVE: RwLock<Option<Arc<Interceptor>>> = const_rwlock(None);
static CALLS: Mutex<Vec<&'static str>> = const_mutex(Vec::new());

extern "C" fn handle_event(_widget: *mut Widget, x: i32) -> i32 {
    CALLS.lock().push("handle_event");
    x + 100
}

extern "C" fn other_event(_widget: *mut Widget, x: i32) -> i32 {
    CALLS.lock().push("other_event");
    x - 100
}

extern "C" fn handle_close(_widget: *mut Widget, _x: i32) -> i32 {
    CALLS.lock().push("handle_close");
    0
}

extern "C" fn log_event(_widget: *mut Widget, _x: i32) {
    CALLS.lock().push("log_event");
}

extern "C" fn event_intermediate(widget: *mut Widget, x: i32) -> i32 {
    let interceptor = ACTIVE.read().clone().expect("no interceptor installed");
    let Ok(info) = (unsafe { interceptor.get_intermediate_info(Addr::from_mut(widget), ON_EVENT) })
    else {
        return -1;
    };
    let result = match info.op_orig {
        Some(op) => (unsafe { op.cast_fn::<EventFn>() })(widget, x),
        None => 0,
    };
    for post in info.post.iter() {
        let hook: HookFn = unsafe { post.cast_fn() };
        hook(widget, x);
    }
    result
}

fn widget_schema() -> OpsSchema {
    OpsSchema::direct("widget", size_of::<Widget>())
        .operation(IntermediateOp::new(
            "on_event",
            ON_EVENT,
            Addr::from_fn(event_intermediate as EventFn),
        ))
        .build()
        .unwrap()
}

fn widget() -> Box<Widget> {
    Box::new(Widget {
        on_event: Some(handle_event),
        on_close: Some(handle_close),
        tag: 7,
    })
}

fn addr(widget: &mut Widget) -> Addr {
    Addr::from_mut(widget as *mut Widget)
}

fn start(engine: &Engine) -> (Arc<Interceptor>, Arc<Payload>) {
    let payload = Arc::new(
        Payload::new("event_log").post(Handler::new(ON_EVENT, Addr::from_fn(log_event as HookFn))),
    );
    let interceptor = Arc::new(Interceptor::new(engine, widget_schema()).unwrap());
    interceptor.register_payload(payload.clone()).unwrap();
    interceptor.start().unwrap();
    *ACTIVE.write() = Some(interceptor.clone());
    CALLS.lock().clear();
    (interceptor, payload)
}

fn finish(interceptor: Arc<Interceptor>) {
    ACTIVE.write().take();
    assert!(interceptor.stop());
}

fn fire(widget: &mut Widget, x: i32) -> i32 {
    let op = widget.on_event.expect("on_event is set");
    op(widget, x)
}

#[test]
#[serial]
fn test_direct_watch_patches_only_intercepted_fields() {
    let engine = Engine::new();
    let (interceptor, _payload) = start(&engine);

    let mut w = widget();
    assert_eq!(unsafe { interceptor.watch(addr(&mut w)) }, Ok(WatchOutcome::New));

    // on_event is intercepted, on_close and tag are untouched
    assert_eq!(w.on_event.map(|f| f as usize), Some(event_intermediate as usize));
    assert_eq!(w.on_close.map(|f| f as usize), Some(handle_close as usize));
    assert_eq!(w.tag, 7);

    assert_eq!(fire(&mut w, 1), 101);
    assert_eq!(*CALLS.lock(), vec!["handle_event", "log_event"]);
    assert_eq!(
        unsafe { interceptor.get_intermediate_info(addr(&mut w), ON_CLOSE) },
        Err(InterceptError::UnknownOperation { offset: ON_CLOSE })
    );

    // The claim is on the object, not a field
    assert_eq!(engine.collisions().claim_count(ClaimKind::Object), 1);
    assert_eq!(engine.collisions().claim_count(ClaimKind::Field), 0);

    assert_eq!(unsafe { interceptor.forget(addr(&mut w)) }, Ok(ForgetOutcome::Forgotten));
    assert_eq!(w.on_event.map(|f| f as usize), Some(handle_event as usize));
    assert_eq!(engine.collisions().claim_count(ClaimKind::Object), 0);
    finish(interceptor);
}

#[test]
#[serial]
fn test_direct_rewatch_picks_up_external_change() {
    let engine = Engine::new();
    let (interceptor, _payload) = start(&engine);

    let mut w = widget();
    let id = addr(&mut w);
    unsafe { interceptor.watch(id) }.unwrap();

    // The owner installs a different handler
    w.on_event = Some(other_event);
    assert_eq!(unsafe { interceptor.watch(id) }, Ok(WatchOutcome::Updated));
    assert_eq!(w.on_event.map(|f| f as usize), Some(event_intermediate as usize));
    assert_eq!(fire(&mut w, 1), -99);

    unsafe { interceptor.forget(id) }.unwrap();
    assert_eq!(w.on_event.map(|f| f as usize), Some(other_event as usize));
    finish(interceptor);
}

#[test]
#[serial]
fn test_direct_norestore_leaves_intermediate() {
    let engine = Engine::new();
    let (interceptor, _payload) = start(&engine);

    let mut w = widget();
    unsafe { interceptor.watch(addr(&mut w)) }.unwrap();
    unsafe { interceptor.forget_norestore(addr(&mut w)) }.unwrap();
    assert_eq!(w.on_event.map(|f| f as usize), Some(event_intermediate as usize));
    assert!(!interceptor.is_watched(addr(&mut w)));
    finish(interceptor);
}

#[test]
#[serial]
fn test_direct_copy_of_watched_object() {
    let engine = Engine::new();
    let (interceptor, _payload) = start(&engine);

    let mut w = widget();
    unsafe { interceptor.watch(addr(&mut w)) }.unwrap();

    // A byte copy carries our intermediate, but not the original
    let mut copy = Box::new(Widget {
        on_event: w.on_event,
        on_close: w.on_close,
        tag: w.tag,
    });
    assert_eq!(
        unsafe { interceptor.watch(addr(&mut copy)) },
        Err(InterceptError::Unrecoverable { offset: ON_EVENT })
    );
    assert_eq!(fire(&mut copy, 1), -1);
    assert_eq!(engine.collisions().claim_count(ClaimKind::Object), 1);

    unsafe { interceptor.forget(addr(&mut w)) }.unwrap();
    finish(interceptor);
}

#[test]
#[serial]
fn test_direct_missing_operation_runs_without_original() {
    let engine = Engine::new();
    let (interceptor, _payload) = start(&engine);

    let mut w = widget();
    w.on_event = None;
    unsafe { interceptor.watch(addr(&mut w)) }.unwrap();

    // The field is populated with the intermediate; no internal handlers run
    assert_eq!(fire(&mut w, 5), 0);
    assert!(CALLS.lock().is_empty());

    unsafe { interceptor.forget(addr(&mut w)) }.unwrap();
    assert!(w.on_event.is_none());
    finish(interceptor);
}

#[test]
#[serial]
fn test_direct_stop_traces_leftovers_and_refuses_factories() {
    let engine = Engine::new();
    let interceptor = Interceptor::new(&engine, widget_schema()).unwrap();

    let factory_schema = OpsSchema::indirect("widget_factory", 0, size_of::<usize>())
        .operation(IntermediateOp::new(
            "on_event",
            0,
            Addr::from_fn(event_intermediate as EventFn),
        ))
        .build()
        .unwrap();
    assert!(matches!(
        interceptor.add_factory(factory_schema),
        Err(InterceptError::InvalidSchema(_))
    ));

    interceptor.start().unwrap();
    let mut w = widget();
    unsafe { interceptor.watch(addr(&mut w)) }.unwrap();

    let mut traced = Vec::new();
    assert!(interceptor.stop_with(&mut |object| traced.push(object)));
    assert_eq!(traced, vec![addr(&mut w)]);
    assert_eq!(engine.collisions().claim_count(ClaimKind::Object), 0);
}
