//! Integration tests for the statedump subsystem.
//!
//! Statedump requests broadcast to every registered handle, so these
//! tests serialize on a local mutex to keep their recorded sequences
//! disjoint.

use core::ffi::c_void;
use core::panic::Location;
use core::ptr;
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracewire::{
    Arg, ArgVec, Error, EventDescription, STATEDUMP_BEGIN, STATEDUMP_END, StatedumpMode,
    statedump_poll_pending_requests, statedump_request_notification_register,
    statedump_request_notification_unregister, statedump_run_pending_requests,
    tracer_callback_register, tracer_callback_unregister, tracer_request_key,
    tracer_statedump_request, tracer_statedump_request_cancel,
};

static TEST_LOCK: Mutex<()> = Mutex::new(());

#[derive(Debug, Clone, PartialEq)]
enum Step {
    Begin(String),
    Dump(u64),
    End(String),
}

static STEPS: Mutex<Vec<Step>> = Mutex::new(Vec::new());

fn payload_name(payload: &ArgVec<'_>) -> String {
    match payload.args {
        [Arg::Str(name)] => name.to_string(),
        other => panic!("unexpected statedump payload: {other:?}"),
    }
}

fn begin_cb(
    _desc: &EventDescription,
    payload: &ArgVec<'_>,
    _priv_data: *mut c_void,
    _caller: &'static Location<'static>,
) {
    STEPS.lock().push(Step::Begin(payload_name(payload)));
}

fn end_cb(
    _desc: &EventDescription,
    payload: &ArgVec<'_>,
    _priv_data: *mut c_void,
    _caller: &'static Location<'static>,
) {
    STEPS.lock().push(Step::End(payload_name(payload)));
}

fn dump_cb(request_key: &u64) {
    STEPS.lock().push(Step::Dump(*request_key));
}

fn wait_until(what: &str, cond: impl Fn() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !cond() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        thread::sleep(Duration::from_millis(1));
    }
}

// =============================================================================
// Polling Mode
// =============================================================================

#[test]
fn polling_statedump_round_trip() {
    let _serial = TEST_LOCK.lock();
    STEPS.lock().clear();

    tracer_callback_register(&STATEDUMP_BEGIN, begin_cb, ptr::null_mut(), 0).unwrap();
    tracer_callback_register(&STATEDUMP_END, end_cb, ptr::null_mut(), 0).unwrap();

    let handle =
        statedump_request_notification_register("app", dump_cb, StatedumpMode::Polling).unwrap();
    // The initial match-all request is waiting for the application.
    assert!(statedump_poll_pending_requests(&handle));

    statedump_run_pending_requests(&handle).unwrap();
    assert!(!statedump_poll_pending_requests(&handle));
    assert_eq!(
        *STEPS.lock(),
        [
            Step::Begin("app".to_string()),
            Step::Dump(0),
            Step::End("app".to_string()),
        ]
    );

    statedump_request_notification_unregister(handle);
    tracer_callback_unregister(&STATEDUMP_BEGIN, begin_cb, ptr::null_mut(), 0).unwrap();
    tracer_callback_unregister(&STATEDUMP_END, end_cb, ptr::null_mut(), 0).unwrap();
}

#[test]
fn request_then_cancel_suppresses_dump() {
    let _serial = TEST_LOCK.lock();
    STEPS.lock().clear();

    let handle =
        statedump_request_notification_register("cancel", dump_cb, StatedumpMode::Polling).unwrap();
    statedump_run_pending_requests(&handle).unwrap();
    STEPS.lock().clear();

    // Match-all is not a valid request key.
    assert_eq!(tracer_statedump_request(0), Err(Error::Invalid));
    assert_eq!(tracer_statedump_request_cancel(0), Err(Error::Invalid));

    let key = tracer_request_key().unwrap();
    tracer_statedump_request(key).unwrap();
    tracer_statedump_request_cancel(key).unwrap();
    assert!(!statedump_poll_pending_requests(&handle));
    statedump_run_pending_requests(&handle).unwrap();
    assert!(STEPS.lock().is_empty(), "cancelled request still ran");

    tracer_statedump_request(key).unwrap();
    assert!(statedump_poll_pending_requests(&handle));
    statedump_run_pending_requests(&handle).unwrap();
    assert_eq!(*STEPS.lock(), [Step::Dump(key)]);

    statedump_request_notification_unregister(handle);
}

// =============================================================================
// Agent Mode
// =============================================================================

#[test]
fn agent_statedump_services_requests() {
    let _serial = TEST_LOCK.lock();
    STEPS.lock().clear();

    let handle =
        statedump_request_notification_register("agent", dump_cb, StatedumpMode::AgentThread)
            .unwrap();
    // Registration returns once the initial match-all request has been
    // spliced for draining; the callback itself lands within a beat.
    wait_until("initial dump", || !STEPS.lock().is_empty());
    assert_eq!(*STEPS.lock(), [Step::Dump(0)]);

    // The polling driver rejects agent-mode handles.
    assert!(!statedump_poll_pending_requests(&handle));
    assert_eq!(
        statedump_run_pending_requests(&handle),
        Err(Error::Invalid)
    );

    let key = tracer_request_key().unwrap();
    tracer_statedump_request(key).unwrap();
    wait_until("agent drain", || STEPS.lock().len() == 2);
    assert_eq!(STEPS.lock()[1], Step::Dump(key));

    statedump_request_notification_unregister(handle);
}

#[test]
fn agent_and_polling_handles_coexist() {
    let _serial = TEST_LOCK.lock();
    STEPS.lock().clear();

    let agent =
        statedump_request_notification_register("both:agent", dump_cb, StatedumpMode::AgentThread)
            .unwrap();
    let polling =
        statedump_request_notification_register("both:poll", dump_cb, StatedumpMode::Polling)
            .unwrap();

    let key = tracer_request_key().unwrap();
    tracer_statedump_request(key).unwrap();
    // Both handles received the request. The woken worker services every
    // handle on the list, the polling one included, so both dumps land
    // without the application draining anything itself.
    wait_until("both dumps", || {
        STEPS.lock().iter().filter(|step| **step == Step::Dump(key)).count() == 2
    });

    statedump_request_notification_unregister(polling);
    statedump_request_notification_unregister(agent);
}
