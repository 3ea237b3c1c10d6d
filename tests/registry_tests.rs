//! Integration tests for registry notifications.
//!
//! Tracer notification callbacks observe every batch in the process, so
//! these tests serialize on a local mutex instead of relying on libtest's
//! default thread-per-test scheduling.

use core::ffi::c_void;
use core::panic::Location;
use core::ptr;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use tracewire::{
    Arg, ArgVec, EventDescription, TracerNotification, emit, event_enabled, events_register,
    events_unregister, registered_callback_count, static_event, tracer_callback_register,
    tracer_callback_unregister, tracer_event_notification_register,
    tracer_event_notification_unregister,
};

static TEST_LOCK: Mutex<()> = Mutex::new(());

fn noop_cb(
    _desc: &EventDescription,
    _payload: &ArgVec<'_>,
    _priv_data: *mut c_void,
    _caller: &'static Location<'static>,
) {
}

// =============================================================================
// Notification Sequencing
// =============================================================================

static NOTIFICATIONS: Mutex<Vec<(TracerNotification, usize, usize)>> = Mutex::new(Vec::new());

fn notif_cb(
    notif: TracerNotification,
    events: &[&'static EventDescription],
    priv_data: *mut c_void,
) {
    NOTIFICATIONS.lock().push((notif, events.len(), priv_data as usize));
}

#[test]
fn subscribe_replays_existing_batches() {
    let _serial = TEST_LOCK.lock();
    NOTIFICATIONS.lock().clear();

    static_event!(E0, "registry:replay_a");
    static_event!(E1, "registry:replay_b");
    static_event!(E2, "registry:replay_c");
    static BATCH_A: [&EventDescription; 2] = [&E0, &E1];
    static BATCH_B: [&EventDescription; 1] = [&E2];

    let batch_a = events_register(&BATCH_A).unwrap();
    let tracer = tracer_event_notification_register(notif_cb, 7 as *mut c_void).unwrap();
    // The pre-existing batch was replayed during subscription.
    assert_eq!(
        *NOTIFICATIONS.lock(),
        [(TracerNotification::InsertEvents, 2, 7)]
    );

    let batch_b = events_register(&BATCH_B).unwrap();
    events_unregister(batch_b);
    tracer_event_notification_unregister(tracer);
    events_unregister(batch_a);

    assert_eq!(
        *NOTIFICATIONS.lock(),
        [
            (TracerNotification::InsertEvents, 2, 7),
            (TracerNotification::InsertEvents, 1, 7),
            (TracerNotification::RemoveEvents, 1, 7),
            // Unsubscribe replays a removal for the surviving batch.
            (TracerNotification::RemoveEvents, 2, 7),
        ]
    );
}

// =============================================================================
// Forced Callback Drain
// =============================================================================

#[test]
fn batch_unregister_drains_callbacks() {
    let _serial = TEST_LOCK.lock();

    static_event!(EVT, "registry:drain");
    static BATCH: [&EventDescription; 1] = [&EVT];

    let handle = events_register(&BATCH).unwrap();
    tracer_callback_register(&EVT, noop_cb, ptr::null_mut(), 0).unwrap();
    assert_eq!(registered_callback_count(&EVT), 1);
    assert!(event_enabled(&EVT));

    events_unregister(handle);
    assert_eq!(registered_callback_count(&EVT), 0);
    assert!(!event_enabled(&EVT));

    // The event is reusable after a drain.
    let handle = events_register(&BATCH).unwrap();
    tracer_callback_register(&EVT, noop_cb, ptr::null_mut(), 0).unwrap();
    tracer_callback_unregister(&EVT, noop_cb, ptr::null_mut(), 0).unwrap();
    events_unregister(handle);
}

// =============================================================================
// Reentrancy
// =============================================================================

static REENTRANT_HITS: AtomicU64 = AtomicU64::new(0);

fn reentrant_hit_cb(
    _desc: &EventDescription,
    _payload: &ArgVec<'_>,
    _priv_data: *mut c_void,
    _caller: &'static Location<'static>,
) {
    REENTRANT_HITS.fetch_add(1, Ordering::Relaxed);
}

/// Registers a callback on every inserted event, from inside the
/// notification itself. The registry mutex is recursive, so this must not
/// self-deadlock.
fn reentrant_notif_cb(
    notif: TracerNotification,
    events: &[&'static EventDescription],
    _priv_data: *mut c_void,
) {
    if notif != TracerNotification::InsertEvents {
        return;
    }
    for &desc in events {
        tracer_callback_register(desc, reentrant_hit_cb, ptr::null_mut(), 0).unwrap();
    }
}

#[test]
fn notification_callback_may_reenter_registry() {
    let _serial = TEST_LOCK.lock();

    static_event!(EVT, "registry:reentrant");
    static BATCH: [&EventDescription; 1] = [&EVT];

    let tracer = tracer_event_notification_register(reentrant_notif_cb, ptr::null_mut()).unwrap();
    let batch = events_register(&BATCH).unwrap();
    assert_eq!(registered_callback_count(&EVT), 1);

    emit(EVT.state, &ArgVec { args: &[Arg::Null] });
    assert_eq!(REENTRANT_HITS.load(Ordering::Relaxed), 1);

    tracer_callback_unregister(&EVT, reentrant_hit_cb, ptr::null_mut(), 0).unwrap();
    tracer_event_notification_unregister(tracer);
    events_unregister(batch);
}
