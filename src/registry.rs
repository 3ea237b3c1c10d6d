//! Event batch and tracer registration.
//!
//! Two global lists live behind one recursive mutex: the registered event
//! batches and the tracer notification handles. Notifications are
//! delivered synchronously with the mutex held, which is part of the
//! contract: a tracer may snapshot registry state atomically from its
//! callback, and may re-enter callback register/unregister for other
//! events, but must not block and must not unregister its own handle.
//!
//! Callback vectors are copy-on-write: every mutation publishes a freshly
//! allocated vector with a release store, waits one grace period of the
//! event RCU domain, and only then frees the retired vector, so concurrent
//! emitters never observe freed entries.

use core::cell::RefCell;
use core::ffi::c_void;
use core::ptr::NonNull;
use core::slice;
use core::sync::atomic::Ordering;

use parking_lot::{ReentrantMutex, ReentrantMutexGuard};

use crate::event::{
    CallbackEntry, CallbackKind, EMPTY_CALLBACK, EventDescription, EventStateV0, TracerCallback,
    TracerCallbackVariadic,
};
use crate::list::{HandleList, Node};
use crate::rcu;
use crate::{Error, Result};

/// Registry change notifications delivered to tracers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TracerNotification {
    /// A batch of events became visible.
    InsertEvents,
    /// A batch of events is going away.
    RemoveEvents,
}

/// Tracer notification callback. Runs with the registry mutex held.
pub type TracerNotificationCb = fn(
    notif: TracerNotification,
    events: &[&'static EventDescription],
    priv_data: *mut c_void,
);

struct EventsBatch {
    events: &'static [&'static EventDescription],
}

struct TracerEntry {
    cb: TracerNotificationCb,
    priv_data: *mut c_void,
}

// The private-data pointer is opaque registry payload, handed back to the
// tracer that supplied it.
unsafe impl Send for TracerEntry {}

struct Registry {
    events: HandleList<EventsBatch>,
    tracers: HandleList<TracerEntry>,
}

type RegistryGuard<'a> = ReentrantMutexGuard<'a, RefCell<Registry>>;

/// Recursive so tracer callbacks can call back into the registration API
/// while a notification or dispatch-side mutation is in flight.
static REGISTRY: ReentrantMutex<RefCell<Registry>> = ReentrantMutex::new(RefCell::new(Registry {
    events: HandleList::new(),
    tracers: HandleList::new(),
}));

/// Owning handle for a registered events batch.
pub struct EventsRegisterHandle {
    node: NonNull<Node<EventsBatch>>,
}

unsafe impl Send for EventsRegisterHandle {}

/// Owning handle for a tracer notification subscription.
pub struct TracerHandle {
    node: NonNull<Node<TracerEntry>>,
}

unsafe impl Send for TracerHandle {}

/// Deliver one notification to every subscribed tracer. The `RefCell`
/// borrow is released first so callbacks can re-enter the registry.
fn notify_tracers(
    guard: &RegistryGuard<'_>,
    notif: TracerNotification,
    events: &[&'static EventDescription],
) {
    let tracers: Vec<(TracerNotificationCb, *mut c_void)> = guard
        .borrow()
        .tracers
        .iter()
        .map(|tracer| (tracer.cb, tracer.priv_data))
        .collect();
    for (cb, priv_data) in tracers {
        cb(notif, events, priv_data);
    }
}

// =============================================================================
// Events Batches
// =============================================================================

/// Register a batch of events, making them visible to tracers.
///
/// The batch is linked before tracers are notified, so a notification
/// callback re-entering the registry observes it as already present.
pub fn events_register(
    events: &'static [&'static EventDescription],
) -> Result<EventsRegisterHandle> {
    if crate::is_finalized() {
        return Err(Error::Exiting);
    }
    crate::ensure_init();

    let guard = REGISTRY.lock();
    let node = guard.borrow_mut().events.push_back(EventsBatch { events });
    notify_tracers(&guard, TracerNotification::InsertEvents, events);
    log::debug!("registered events batch ({} events)", events.len());
    Ok(EventsRegisterHandle { node })
}

/// Unregister a batch of events.
///
/// The caller guarantees the events are no longer reachable by emitters
/// before this call. The batch is unlinked before tracers are notified,
/// so a notification callback no longer observes the departing batch; any
/// callbacks still attached to its events are drained afterwards.
pub fn events_unregister(handle: EventsRegisterHandle) {
    if crate::is_finalized() {
        // The node was (or will be) reclaimed by `exit`.
        return;
    }
    crate::ensure_init();

    let guard = REGISTRY.lock();
    let batch = unsafe { guard.borrow_mut().events.remove(handle.node) };
    unregister_batch(&guard, &batch);
}

fn unregister_batch(guard: &RegistryGuard<'_>, batch: &EventsBatch) {
    notify_tracers(guard, TracerNotification::RemoveEvents, batch.events);
    for desc in batch.events {
        remove_event_callbacks(desc);
    }
    log::debug!("unregistered events batch ({} events)", batch.events.len());
}

/// Reset an unreachable event to the empty state.
///
/// No grace period: the caller guarantees no emitter can still reach the
/// event, so any prior reader has already finished.
fn remove_event_callbacks(desc: &EventDescription) {
    let es0 = desc.state_v0();
    let nr_callbacks = es0.nr_callbacks.load(Ordering::Relaxed);
    if nr_callbacks == 0 {
        return;
    }
    let old = es0.callbacks.load(Ordering::Relaxed);
    es0.enabled.fetch_sub(1, Ordering::Relaxed);
    es0.nr_callbacks.store(0, Ordering::Relaxed);
    es0.callbacks.store(EMPTY_CALLBACK.as_ptr(), Ordering::Release);
    unsafe { free_vector(old, nr_callbacks) };
}

/// Drain every remaining events batch at finalization.
pub(crate) fn unregister_all_events() {
    let guard = REGISTRY.lock();
    loop {
        let batch = guard.borrow_mut().events.pop_front();
        match batch {
            Some(batch) => unregister_batch(&guard, &batch),
            None => break,
        }
    }
}

// =============================================================================
// Tracer Notification Handles
// =============================================================================

/// Subscribe to registry notifications.
///
/// Every already-registered batch is replayed as `InsertEvents` before
/// this returns, under the registry mutex, so the tracer starts from a
/// consistent view of the world.
pub fn tracer_event_notification_register(
    cb: TracerNotificationCb,
    priv_data: *mut c_void,
) -> Result<TracerHandle> {
    if crate::is_finalized() {
        return Err(Error::Exiting);
    }
    crate::ensure_init();

    let guard = REGISTRY.lock();
    let node = guard
        .borrow_mut()
        .tracers
        .push_back(TracerEntry { cb, priv_data });
    let batches: Vec<&'static [&'static EventDescription]> =
        guard.borrow().events.iter().map(|batch| batch.events).collect();
    for events in batches {
        cb(TracerNotification::InsertEvents, events, priv_data);
    }
    log::debug!("registered tracer notification handle");
    Ok(TracerHandle { node })
}

/// Unsubscribe from registry notifications. Every still-registered batch
/// is replayed as `RemoveEvents` before the handle goes away.
pub fn tracer_event_notification_unregister(handle: TracerHandle) {
    if crate::is_finalized() {
        return;
    }
    crate::ensure_init();

    let guard = REGISTRY.lock();
    let (cb, priv_data) = {
        let entry = unsafe { handle.node.as_ref() };
        (entry.data.cb, entry.data.priv_data)
    };
    let batches: Vec<&'static [&'static EventDescription]> =
        guard.borrow().events.iter().map(|batch| batch.events).collect();
    for events in batches {
        cb(TracerNotification::RemoveEvents, events, priv_data);
    }
    unsafe { guard.borrow_mut().tracers.remove(handle.node) };
    log::debug!("unregistered tracer notification handle");
}

// =============================================================================
// Callback Registration
// =============================================================================

/// Attach `call` to a non-variadic event.
///
/// `priv_data` is forwarded opaquely on every invocation; `key` selects
/// which emits reach the callback (see [`crate::keys`]).
pub fn tracer_callback_register(
    desc: &'static EventDescription,
    call: TracerCallback,
    priv_data: *mut c_void,
    key: u64,
) -> Result<()> {
    if desc.is_variadic() {
        return Err(Error::Invalid);
    }
    callback_register(desc, CallbackKind::Normal(call), priv_data, key)
}

/// Attach `call` to a variadic event.
pub fn tracer_callback_variadic_register(
    desc: &'static EventDescription,
    call: TracerCallbackVariadic,
    priv_data: *mut c_void,
    key: u64,
) -> Result<()> {
    if !desc.is_variadic() {
        return Err(Error::Invalid);
    }
    callback_register(desc, CallbackKind::Variadic(call), priv_data, key)
}

/// Detach a callback from a non-variadic event. The `(call, priv_data,
/// key)` triple must match the registration.
pub fn tracer_callback_unregister(
    desc: &'static EventDescription,
    call: TracerCallback,
    priv_data: *mut c_void,
    key: u64,
) -> Result<()> {
    if desc.is_variadic() {
        return Err(Error::Invalid);
    }
    callback_unregister(desc, CallbackKind::Normal(call), priv_data, key)
}

/// Detach a callback from a variadic event.
pub fn tracer_callback_variadic_unregister(
    desc: &'static EventDescription,
    call: TracerCallbackVariadic,
    priv_data: *mut c_void,
    key: u64,
) -> Result<()> {
    if !desc.is_variadic() {
        return Err(Error::Invalid);
    }
    callback_unregister(desc, CallbackKind::Variadic(call), priv_data, key)
}

/// Position of a matching entry in the live vector. Registry mutex held.
fn callback_lookup(
    es0: &EventStateV0,
    fn_addr: usize,
    priv_data: *mut c_void,
    key: u64,
) -> Option<usize> {
    let mut cursor = es0.callbacks.load(Ordering::Relaxed);
    let mut index = 0;
    unsafe {
        while let Some(kind) = (*cursor).kind {
            let entry = &*cursor;
            if kind.fn_addr() == fn_addr && entry.priv_data == priv_data && entry.key == key {
                return Some(index);
            }
            cursor = cursor.add(1);
            index += 1;
        }
    }
    None
}

fn callback_register(
    desc: &'static EventDescription,
    kind: CallbackKind,
    priv_data: *mut c_void,
    key: u64,
) -> Result<()> {
    if crate::is_finalized() {
        return Err(Error::Exiting);
    }
    crate::ensure_init();

    let _guard = REGISTRY.lock();
    let es0 = desc.state_v0();
    let old_nr = es0.nr_callbacks.load(Ordering::Relaxed);
    if old_nr == u32::MAX {
        return Err(Error::Invalid);
    }
    if callback_lookup(es0, kind.fn_addr(), priv_data, key).is_some() {
        return Err(Error::Exists);
    }

    let old = es0.callbacks.load(Ordering::Relaxed);
    let old_len = old_nr as usize;
    // old_len live entries + the new one + the sentinel.
    let mut vector: Vec<CallbackEntry> = Vec::new();
    vector
        .try_reserve_exact(old_len + 2)
        .map_err(|_| Error::NoMemory)?;
    vector.extend_from_slice(unsafe { slice::from_raw_parts(old, old_len) });
    vector.push(CallbackEntry {
        kind: Some(kind),
        priv_data,
        key,
    });
    vector.push(CallbackEntry::sentinel());
    let new = Box::into_raw(vector.into_boxed_slice()) as *mut CallbackEntry;

    es0.callbacks.store(new, Ordering::Release);
    rcu::event_gp().wait_grace_period();
    if old_nr > 0 {
        unsafe { free_vector(old, old_nr) };
    }
    es0.nr_callbacks.store(old_nr + 1, Ordering::Relaxed);
    if old_nr == 0 {
        // Concurrent with out-of-process tracers flipping the shared bits.
        es0.enabled.fetch_add(1, Ordering::Relaxed);
    }
    log::trace!("registered callback on {} (key {})", desc.name, key);
    Ok(())
}

fn callback_unregister(
    desc: &'static EventDescription,
    kind: CallbackKind,
    priv_data: *mut c_void,
    key: u64,
) -> Result<()> {
    if crate::is_finalized() {
        return Err(Error::Exiting);
    }
    crate::ensure_init();

    let _guard = REGISTRY.lock();
    let es0 = desc.state_v0();
    let Some(position) = callback_lookup(es0, kind.fn_addr(), priv_data, key) else {
        return Err(Error::NoEntry);
    };

    let old_nr = es0.nr_callbacks.load(Ordering::Relaxed);
    let old = es0.callbacks.load(Ordering::Relaxed);
    let new = if old_nr == 1 {
        // Last entry out: fall back to the shared sentinel, no allocation.
        EMPTY_CALLBACK.as_ptr()
    } else {
        let old_len = old_nr as usize;
        // old_len - 1 surviving entries + the sentinel.
        let mut vector: Vec<CallbackEntry> = Vec::new();
        vector
            .try_reserve_exact(old_len)
            .map_err(|_| Error::NoMemory)?;
        let entries = unsafe { slice::from_raw_parts(old, old_len) };
        vector.extend_from_slice(&entries[..position]);
        vector.extend_from_slice(&entries[position + 1..]);
        vector.push(CallbackEntry::sentinel());
        Box::into_raw(vector.into_boxed_slice()) as *mut CallbackEntry
    };

    es0.callbacks.store(new, Ordering::Release);
    rcu::event_gp().wait_grace_period();
    unsafe { free_vector(old, old_nr) };
    es0.nr_callbacks.store(old_nr - 1, Ordering::Relaxed);
    if old_nr == 1 {
        es0.enabled.fetch_sub(1, Ordering::Relaxed);
    }
    log::trace!("unregistered callback on {} (key {})", desc.name, key);
    Ok(())
}

/// Reclaim a retired vector of `nr_callbacks` entries plus sentinel.
///
/// # Safety
///
/// `vector` must be a heap vector published by this module (never the
/// shared sentinel), retired after a grace period, holding exactly
/// `nr_callbacks + 1` entries.
unsafe fn free_vector(vector: *mut CallbackEntry, nr_callbacks: u32) {
    debug_assert!(!core::ptr::eq(vector, EMPTY_CALLBACK.as_ptr()));
    let len = nr_callbacks as usize + 1;
    unsafe {
        drop(Box::from_raw(core::ptr::slice_from_raw_parts_mut(vector, len)));
    }
}
