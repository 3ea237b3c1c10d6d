//! State-dump request handling.
//!
//! A statedump request handle represents an application's or library's
//! capability to dump its state to tracers as a burst of events. Each
//! handle carries a FIFO of pending requests keyed by tracer key. Two
//! drivers exist: in polling mode the application drains the queue itself
//! with [`statedump_run_pending_requests`]; in agent-thread mode a
//! library-owned worker drains every handle whenever a tracer asks.
//!
//! Statedump callbacks may register and unregister event callbacks, but
//! must not register or unregister statedump handles: that would cross the
//! two RCU domains and can hang on a grace period.
//!
//! Lock ordering: the agent lifecycle mutex is taken outside the statedump
//! mutex. The lifecycle mutex is never taken by the worker itself, so
//! joining the worker under it cannot deadlock.

use core::ptr::NonNull;
use core::sync::atomic::{AtomicU32, Ordering};
use std::collections::VecDeque;
use std::mem;
use std::thread;

use parking_lot::{Condvar, Mutex};

use crate::event::{Arg, ArgVec};
use crate::keys::KEY_MATCH_ALL;
use crate::list::{RcuList, RcuNode};
use crate::rcu::{self, RETRY_BUSY_LOOP_ATTEMPTS, RETRY_DELAY};
use crate::{Error, Result};

crate::static_event!(pub STATEDUMP_BEGIN, "tracewire:statedump_begin");
crate::static_event!(pub STATEDUMP_END, "tracewire:statedump_end");

/// How statedump requests reach the application.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatedumpMode {
    /// The application polls and drains its own queue.
    Polling,
    /// A library-owned agent thread drains the queue.
    AgentThread,
}

/// Application statedump callback.
///
/// The request key reference is only valid for the duration of the call;
/// forward it to [`crate::statedump_emit`] for every event dumped.
pub type StatedumpCallback = fn(request_key: &u64);

struct StatedumpHandleData {
    name: String,
    cb: StatedumpCallback,
    mode: StatedumpMode,
    /// Pending request keys, FIFO. Nested inside the statedump mutex.
    queue: Mutex<VecDeque<u64>>,
}

/// Owning handle for a statedump registration.
pub struct StatedumpRequestHandle {
    node: NonNull<RcuNode<StatedumpHandleData>>,
}

// The handle only ever grants access to Send + Sync data.
unsafe impl Send for StatedumpRequestHandle {}

impl StatedumpRequestHandle {
    fn data(&self) -> &StatedumpHandleData {
        &unsafe { self.node.as_ref() }.data
    }
}

// =============================================================================
// Globals
// =============================================================================

const AGENT_BLOCKED: u32 = 0;
const AGENT_HANDLE_REQUEST: u32 = 1 << 0;
const AGENT_EXIT: u32 = 1 << 1;
const AGENT_PAUSE: u32 = 1 << 2;
const AGENT_PAUSE_ACK: u32 = 1 << 3;

struct AgentThread {
    /// Bitset over the `AGENT_*` states, checked under the statedump
    /// mutex by the worker and written from request/lifecycle paths.
    state: AtomicU32,
    /// Wakes the worker; paired with `STATEDUMP_LOCK`.
    worker_cv: Condvar,
    /// Wakes registration waiters once a queue drains; paired with
    /// `STATEDUMP_LOCK`.
    waiter_cv: Condvar,
}

struct AgentLifecycle {
    refs: u64,
    worker: Option<thread::JoinHandle<()>>,
}

static STATEDUMP_LOCK: Mutex<()> = Mutex::new(());

/// Handles under RCU so the agent thread can iterate without holding the
/// statedump mutex across application callbacks.
static STATEDUMP_LIST: RcuList<StatedumpHandleData> = RcuList::new();

static AGENT: AgentThread = AgentThread {
    state: AtomicU32::new(AGENT_BLOCKED),
    worker_cv: Condvar::new(),
    waiter_cv: Condvar::new(),
};

/// Protects the agent thread's lifetime: refcount, spawn, join. Not taken
/// by the worker itself. The statedump mutex nests inside it.
static AGENT_LIFECYCLE: Mutex<AgentLifecycle> = Mutex::new(AgentLifecycle {
    refs: 0,
    worker: None,
});

// =============================================================================
// Pending Queues
// =============================================================================

/// Called with the statedump mutex held.
fn queue_pending(handle: &StatedumpHandleData, key: u64) {
    handle.queue.lock().push_back(key);
    if handle.mode == StatedumpMode::AgentThread {
        AGENT.state.fetch_or(AGENT_HANDLE_REQUEST, Ordering::SeqCst);
        AGENT.worker_cv.notify_all();
    }
}

/// Called with the statedump mutex held. `KEY_MATCH_ALL` drops everything.
fn unqueue_pending(handle: &StatedumpHandleData, key: u64) {
    handle
        .queue
        .lock()
        .retain(|&pending| key != KEY_MATCH_ALL && pending != key);
}

fn statedump_run(handle: &StatedumpHandleData, key: u64) {
    let name = [Arg::Str(handle.name.as_str())];
    let payload = ArgVec { args: &name };
    crate::event::statedump_emit(STATEDUMP_BEGIN.state, &payload, &key);
    (handle.cb)(&key);
    crate::event::statedump_emit(STATEDUMP_END.state, &payload, &key);
}

/// Splice the pending queue out under the statedump mutex, then run the
/// requests without it so callbacks can use the event API freely.
fn run_pending_requests(handle: &StatedumpHandleData) {
    let pending = {
        let _statedump = STATEDUMP_LOCK.lock();
        mem::take(&mut *handle.queue.lock())
    };
    for key in pending {
        statedump_run(handle, key);
    }
    if handle.mode == StatedumpMode::AgentThread {
        let _statedump = STATEDUMP_LOCK.lock();
        AGENT.waiter_cv.notify_all();
    }
}

// =============================================================================
// Agent Thread
// =============================================================================

fn agent_worker() {
    loop {
        let state;
        {
            let mut statedump = STATEDUMP_LOCK.lock();
            loop {
                let current = AGENT.state.load(Ordering::SeqCst);
                if current == AGENT_BLOCKED {
                    AGENT.worker_cv.wait(&mut statedump);
                } else {
                    state = current;
                    break;
                }
            }
        }
        if state & AGENT_EXIT != 0 {
            break;
        }
        if state & AGENT_PAUSE != 0 {
            // Park at a known safe point, holding no locks, until the
            // fork completes.
            AGENT.state.fetch_or(AGENT_PAUSE_ACK, Ordering::SeqCst);
            let mut attempt = 0u32;
            while AGENT.state.load(Ordering::SeqCst) & AGENT_PAUSE != 0 {
                if attempt > RETRY_BUSY_LOOP_ATTEMPTS {
                    thread::sleep(RETRY_DELAY);
                    continue;
                }
                attempt += 1;
                core::hint::spin_loop();
            }
            continue;
        }

        AGENT.state.fetch_and(!AGENT_HANDLE_REQUEST, Ordering::SeqCst);
        let read = rcu::statedump_gp().read_lock();
        for handle in STATEDUMP_LIST.iter() {
            run_pending_requests(handle);
        }
        drop(read);
    }
    log::debug!("statedump agent thread exiting");
}

/// Called with the lifecycle and statedump mutexes held.
fn agent_thread_get(lifecycle: &mut AgentLifecycle) {
    lifecycle.refs += 1;
    if lifecycle.refs > 1 {
        return;
    }
    AGENT.state.store(AGENT_BLOCKED, Ordering::SeqCst);
    lifecycle.worker = Some(thread::spawn(agent_worker));
    log::debug!("statedump agent thread started");
}

/// Called with the lifecycle and statedump mutexes held. Returns the
/// worker's join handle once the last reference is gone.
fn agent_thread_put(lifecycle: &mut AgentLifecycle) -> Option<thread::JoinHandle<()>> {
    lifecycle.refs -= 1;
    if lifecycle.refs != 0 {
        return None;
    }
    AGENT.state.fetch_or(AGENT_EXIT, Ordering::SeqCst);
    AGENT.worker_cv.notify_all();
    lifecycle.worker.take()
}

// =============================================================================
// Registration
// =============================================================================

/// Register a statedump capability named `name`.
///
/// One `KEY_MATCH_ALL` request is queued immediately so every existing
/// tracer receives an initial dump. In agent mode this call returns only
/// after that initial request has drained.
pub fn statedump_request_notification_register(
    name: &str,
    cb: StatedumpCallback,
    mode: StatedumpMode,
) -> Result<StatedumpRequestHandle> {
    if crate::is_finalized() {
        return Err(Error::Exiting);
    }
    crate::ensure_init();

    let data = StatedumpHandleData {
        name: name.to_owned(),
        cb,
        mode,
        queue: Mutex::new(VecDeque::new()),
    };

    let mut lifecycle = (mode == StatedumpMode::AgentThread).then(|| AGENT_LIFECYCLE.lock());
    let node = {
        let _statedump = STATEDUMP_LOCK.lock();
        if let Some(lifecycle) = lifecycle.as_mut() {
            agent_thread_get(lifecycle);
        }
        let node = STATEDUMP_LIST.push_back(data);
        queue_pending(&unsafe { node.as_ref() }.data, KEY_MATCH_ALL);
        node
    };
    drop(lifecycle);

    if mode == StatedumpMode::AgentThread {
        let data = &unsafe { node.as_ref() }.data;
        let mut statedump = STATEDUMP_LOCK.lock();
        while !data.queue.lock().is_empty() {
            AGENT.waiter_cv.wait(&mut statedump);
        }
    }
    log::debug!("registered statedump handle \"{}\" ({:?})", name, mode);
    Ok(StatedumpRequestHandle { node })
}

/// Unregister a statedump handle.
///
/// In agent mode the worker is asked to exit and joined when the last
/// agent-mode handle goes away. The handle memory is reclaimed only after
/// a statedump grace period, so a worker still walking the list never
/// touches freed memory.
pub fn statedump_request_notification_unregister(handle: StatedumpRequestHandle) {
    if crate::is_finalized() {
        return;
    }
    crate::ensure_init();
    let mode = handle.data().mode;

    let mut lifecycle = (mode == StatedumpMode::AgentThread).then(|| AGENT_LIFECYCLE.lock());
    let worker = {
        let _statedump = STATEDUMP_LOCK.lock();
        unqueue_pending(handle.data(), KEY_MATCH_ALL);
        unsafe { STATEDUMP_LIST.remove(handle.node) };
        match lifecycle.as_mut() {
            Some(lifecycle) => agent_thread_put(lifecycle),
            None => None,
        }
    };
    if let Some(worker) = worker {
        // Join outside the statedump mutex; the worker needs it to
        // observe the exit request.
        if worker.join().is_err() {
            log::error!("statedump agent thread panicked");
        }
        log::debug!("statedump agent thread joined");
    }
    drop(lifecycle);

    rcu::statedump_gp().wait_grace_period();
    drop(unsafe { RcuList::into_box(handle.node) });
}

// =============================================================================
// Polling Driver
// =============================================================================

/// Whether a polling-mode handle has pending requests. Always `false` for
/// agent-mode handles: their queue belongs to the worker.
pub fn statedump_poll_pending_requests(handle: &StatedumpRequestHandle) -> bool {
    let data = handle.data();
    if data.mode != StatedumpMode::Polling {
        return false;
    }
    let _statedump = STATEDUMP_LOCK.lock();
    !data.queue.lock().is_empty()
}

/// Drain a polling-mode handle: for each pending request, emit the
/// `statedump_begin` event, invoke the handle's callback, emit the
/// `statedump_end` event, all keyed by the request's tracer key.
pub fn statedump_run_pending_requests(handle: &StatedumpRequestHandle) -> Result<()> {
    let data = handle.data();
    if data.mode != StatedumpMode::Polling {
        return Err(Error::Invalid);
    }
    run_pending_requests(data);
    Ok(())
}

// =============================================================================
// Tracer Requests
// =============================================================================

/// Request a state dump towards tracer callbacks tagged `key`.
pub fn tracer_statedump_request(key: u64) -> Result<()> {
    if key == KEY_MATCH_ALL {
        return Err(Error::Invalid);
    }
    let _statedump = STATEDUMP_LOCK.lock();
    for handle in STATEDUMP_LIST.iter() {
        queue_pending(handle, key);
    }
    Ok(())
}

/// Cancel pending statedump requests for `key` on every handle.
pub fn tracer_statedump_request_cancel(key: u64) -> Result<()> {
    if key == KEY_MATCH_ALL {
        return Err(Error::Invalid);
    }
    let _statedump = STATEDUMP_LOCK.lock();
    for handle in STATEDUMP_LIST.iter() {
        unqueue_pending(handle, key);
    }
    Ok(())
}

// =============================================================================
// Fork Integration
// =============================================================================

/// Install the fork handlers. Invoked exactly once from [`crate::init`].
pub(crate) fn install_fork_handlers() {
    let ret = unsafe {
        libc::pthread_atfork(
            Some(before_fork as unsafe extern "C" fn()),
            Some(after_fork_parent as unsafe extern "C" fn()),
            Some(after_fork_child as unsafe extern "C" fn()),
        )
    };
    if ret != 0 {
        // Forking with an unprotected agent thread deadlocks the child;
        // refuse to continue without the handlers.
        std::process::abort();
    }
}

/// Park the agent thread at a safe point and hold the lifecycle mutex
/// across the fork so no thread can spawn or join the worker mid-fork.
extern "C" fn before_fork() {
    let lifecycle = AGENT_LIFECYCLE.lock();
    let live = lifecycle.refs != 0;
    // The matching after-fork handler releases the lock.
    mem::forget(lifecycle);
    if !live {
        return;
    }
    {
        let _statedump = STATEDUMP_LOCK.lock();
        AGENT.state.fetch_or(AGENT_PAUSE, Ordering::SeqCst);
        AGENT.worker_cv.notify_all();
    }
    let mut attempt = 0u32;
    while AGENT.state.load(Ordering::SeqCst) & AGENT_PAUSE_ACK == 0 {
        if attempt > RETRY_BUSY_LOOP_ATTEMPTS {
            thread::sleep(RETRY_DELAY);
            continue;
        }
        attempt += 1;
        core::hint::spin_loop();
    }
}

extern "C" fn after_fork_parent() {
    // Still logically holding the lifecycle mutex from `before_fork`.
    let lifecycle = unsafe { &*AGENT_LIFECYCLE.data_ptr() };
    if lifecycle.refs != 0 {
        AGENT
            .state
            .fetch_and(!(AGENT_PAUSE | AGENT_PAUSE_ACK), Ordering::SeqCst);
    }
    unsafe { AGENT_LIFECYCLE.force_unlock() };
}

/// The agent thread does not exist in the child process; reset its state
/// word and spawn a fresh worker.
extern "C" fn after_fork_child() {
    let lifecycle = unsafe { &mut *AGENT_LIFECYCLE.data_ptr() };
    if lifecycle.refs != 0 {
        AGENT.state.store(AGENT_BLOCKED, Ordering::SeqCst);
        lifecycle.worker = Some(thread::spawn(agent_worker));
    }
    unsafe { AGENT_LIFECYCLE.force_unlock() };
}
