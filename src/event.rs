//! Event state ABI and the dispatch fast path.
//!
//! Every event owns a versioned state block holding its enable word and the
//! current callback vector. Emitting an event reads the enable word, enters
//! an RCU read section and walks the vector until the sentinel entry; it
//! performs no allocation and acquires no lock, so instrumentation stays
//! cheap on the hot path. All vector mutations live in [`crate::registry`].

use core::ffi::c_void;
use core::panic::Location;
use core::ptr;
use core::sync::atomic::{AtomicPtr, AtomicU32, AtomicUsize, Ordering};
use std::process;

use crate::keys::{KEY_MATCH_ALL, KEY_PTRACE, KEY_USER_EVENT};
use crate::rcu;

/// Event state ABI version understood by this runtime.
///
/// Tracers must reject event state blocks carrying a version they do not
/// know how to interpret; this runtime aborts on them.
pub const EVENT_STATE_ABI_VERSION: u32 = 0;

/// Description flag: the event uses the variadic call shape.
pub const EVENT_FLAG_VARIADIC: u32 = 1 << 0;

/// Top 8 bits of the enable word, reserved for out-of-process tracers.
/// They are written through shared memory and only ever read here.
pub const EVENT_ENABLED_SHARED_MASK: usize = 0xff << (usize::BITS - 8);
/// Shared bit: a kernel user-event tracer is attached.
pub const EVENT_ENABLED_SHARED_USER_EVENT_MASK: usize = 1 << (usize::BITS - 1);
/// Shared bit: a ptrace-based tracer is attached.
pub const EVENT_ENABLED_SHARED_PTRACE_MASK: usize = 1 << (usize::BITS - 2);
/// Low bits of the enable word: in-process tracer reference count.
pub const EVENT_ENABLED_PRIVATE_MASK: usize = !EVENT_ENABLED_SHARED_MASK;

// =============================================================================
// Argument Payload
// =============================================================================

/// One argument value forwarded to tracer callbacks.
///
/// The runtime never interprets payload contents; the type only exists so
/// payloads can be forwarded by reference without copies.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Arg<'a> {
    Null,
    Bool(bool),
    U64(u64),
    I64(i64),
    F64(f64),
    Str(&'a str),
}

/// Positional argument payload for one emit.
#[derive(Debug, Clone, Copy)]
pub struct ArgVec<'a> {
    pub args: &'a [Arg<'a>],
}

/// Named dynamic fields for the variadic call shape.
#[derive(Debug, Clone, Copy)]
pub struct DynamicStruct<'a> {
    pub fields: &'a [(&'a str, Arg<'a>)],
}

// =============================================================================
// Callback Vector
// =============================================================================

/// Tracer callback for non-variadic events.
pub type TracerCallback = fn(
    desc: &EventDescription,
    payload: &ArgVec<'_>,
    priv_data: *mut c_void,
    caller: &'static Location<'static>,
);

/// Tracer callback for variadic events.
pub type TracerCallbackVariadic = fn(
    desc: &EventDescription,
    payload: &ArgVec<'_>,
    var_struct: &DynamicStruct<'_>,
    priv_data: *mut c_void,
    caller: &'static Location<'static>,
);

/// The two call shapes, tagged by the event's variadic flag.
#[derive(Clone, Copy)]
pub(crate) enum CallbackKind {
    Normal(TracerCallback),
    Variadic(TracerCallbackVariadic),
}

impl CallbackKind {
    /// Address used for duplicate detection; comparing through `usize`
    /// keeps the intent explicit where function pointers are involved.
    pub(crate) fn fn_addr(self) -> usize {
        match self {
            CallbackKind::Normal(call) => call as usize,
            CallbackKind::Variadic(call) => call as usize,
        }
    }
}

/// One entry of an event's callback vector.
///
/// `kind == None` is the sentinel terminating iteration: the dispatch loop
/// always dereferences the current entry and stops on the sentinel, so the
/// `callbacks` pointer itself never needs a null check.
#[derive(Clone, Copy)]
pub struct CallbackEntry {
    pub(crate) kind: Option<CallbackKind>,
    pub(crate) priv_data: *mut c_void,
    pub(crate) key: u64,
}

impl CallbackEntry {
    pub(crate) const fn sentinel() -> Self {
        Self {
            kind: None,
            priv_data: ptr::null_mut(),
            key: 0,
        }
    }
}

// Entries move between the registration paths and dispatch on arbitrary
// threads; the private-data pointer is only ever handed back to the tracer
// that supplied it.
unsafe impl Send for CallbackEntry {}
unsafe impl Sync for CallbackEntry {}

/// Wrapper giving the process-wide empty callback vector a stable address.
pub struct EmptyCallback(CallbackEntry);

impl EmptyCallback {
    /// Pointer to the shared sentinel entry, for seeding fresh event state.
    pub const fn as_ptr(&self) -> *mut CallbackEntry {
        (&raw const self.0).cast_mut()
    }
}

/// The empty callback vector: a single sentinel entry shared by every
/// event with no registered callbacks. It is never freed.
pub static EMPTY_CALLBACK: EmptyCallback = EmptyCallback(CallbackEntry::sentinel());

// =============================================================================
// Event State
// =============================================================================

/// Versioned event state header.
///
/// The header is the only part of the state block with a layout that is
/// stable across ABI versions; everything else hangs off the
/// version-specific body. Layout changes bump [`EVENT_STATE_ABI_VERSION`].
#[repr(C)]
pub struct EventState {
    /// Event state ABI version.
    pub version: u32,
}

/// Version 0 event state body.
///
/// `parent` must stay the first field so a `&EventState` whose version is
/// 0 converts to the body by pointer cast.
#[repr(C)]
pub struct EventStateV0 {
    /// Required first field.
    pub parent: EventState,
    /// Number of active tracer callbacks. Always equals the number of
    /// non-sentinel entries reachable from `callbacks`.
    pub nr_callbacks: AtomicU32,
    /// Enable word: top 8 bits shared with out-of-process tracers, low
    /// bits counting in-process registrations. Non-zero means at least
    /// one consumer may be listening.
    pub enabled: AtomicUsize,
    /// Current callback vector, terminated by a sentinel entry.
    pub callbacks: AtomicPtr<CallbackEntry>,
    /// Back pointer to the owning description.
    pub desc: &'static EventDescription,
}

impl EventStateV0 {
    /// Convert the versioned header into the version 0 body.
    ///
    /// Aborts on version mismatch: dispatching through an unknown ABI
    /// would invoke callbacks with the wrong layout.
    pub(crate) fn from_parent(state: &EventState) -> &EventStateV0 {
        if state.version != EVENT_STATE_ABI_VERSION {
            process::abort();
        }
        unsafe { &*(state as *const EventState as *const EventStateV0) }
    }
}

/// External description of one instrumentation point.
///
/// Use [`crate::static_event!`] to define the paired description/state
/// statics rather than building these by hand.
pub struct EventDescription {
    /// `EVENT_FLAG_*` bit set.
    pub flags: u32,
    /// Display name, in `"subsystem:event"` form.
    pub name: &'static str,
    /// The event's mutable state block.
    pub state: &'static EventState,
}

impl EventDescription {
    /// Whether the event uses the variadic call shape.
    pub fn is_variadic(&self) -> bool {
        self.flags & EVENT_FLAG_VARIADIC != 0
    }

    pub(crate) fn state_v0(&self) -> &EventStateV0 {
        EventStateV0::from_parent(self.state)
    }
}

/// Whether any consumer, in-process or shared, is attached to the event.
/// The answer is a hint: it may already be stale when it returns.
pub fn event_enabled(desc: &EventDescription) -> bool {
    desc.state_v0().enabled.load(Ordering::Relaxed) != 0
}

/// Number of in-process tracer callbacks currently registered.
pub fn registered_callback_count(desc: &EventDescription) -> u32 {
    desc.state_v0().nr_callbacks.load(Ordering::Relaxed)
}

// =============================================================================
// Dispatch
// =============================================================================

/// Placeholder for a debugger breakpoint.
///
/// `var_struct` is `None` for the non-variadic call shape. Deliberately
/// never inlined so external debuggers can break on a stable address.
#[inline(never)]
pub fn ptrace_hook(
    _event_state: &EventState,
    _payload: &ArgVec<'_>,
    _var_struct: Option<&DynamicStruct<'_>>,
    _caller: &'static Location<'static>,
) {
}

#[inline]
#[track_caller]
fn dispatch(
    event_state: &EventState,
    payload: &ArgVec<'_>,
    var_struct: Option<&DynamicStruct<'_>>,
    key: u64,
) {
    let caller = Location::caller();

    if crate::is_finalized() {
        return;
    }
    crate::ensure_init();
    let es0 = EventStateV0::from_parent(event_state);
    match var_struct {
        Some(_) => assert!(
            es0.desc.is_variadic(),
            "variadic emit on non-variadic event {}",
            es0.desc.name
        ),
        None => assert!(
            !es0.desc.is_variadic(),
            "non-variadic emit on variadic event {}",
            es0.desc.name
        ),
    }

    let enabled = es0.enabled.load(Ordering::Relaxed);
    if enabled & EVENT_ENABLED_SHARED_MASK != 0 {
        if enabled & EVENT_ENABLED_SHARED_USER_EVENT_MASK != 0
            && (key == KEY_MATCH_ALL || key == KEY_USER_EVENT)
        {
            // TODO: user_events integration: write the payload to the
            // kernel user_events file descriptor once that path is wired.
        }
        if enabled & EVENT_ENABLED_SHARED_PTRACE_MASK != 0
            && (key == KEY_MATCH_ALL || key == KEY_PTRACE)
        {
            ptrace_hook(event_state, payload, var_struct, caller);
        }
    }

    let _read = rcu::event_gp().read_lock();
    let mut cursor = es0.callbacks.load(Ordering::Acquire);
    // Vector mutations publish a fresh allocation and defer the free by a
    // grace period, so every entry stays valid for this whole walk.
    unsafe {
        while let Some(kind) = (*cursor).kind {
            let entry = &*cursor;
            cursor = cursor.add(1);
            if key != KEY_MATCH_ALL && entry.key != KEY_MATCH_ALL && entry.key != key {
                continue;
            }
            match (kind, var_struct) {
                (CallbackKind::Normal(call), None) => {
                    call(es0.desc, payload, entry.priv_data, caller)
                }
                (CallbackKind::Variadic(call), Some(var_struct)) => {
                    call(es0.desc, payload, var_struct, entry.priv_data, caller)
                }
                _ => {}
            }
        }
    }
}

/// Emit one occurrence of a non-variadic event.
///
/// Never blocks and never allocates. Callbacks run in vector order and
/// all of them fire, since the emit key is [`KEY_MATCH_ALL`].
#[track_caller]
pub fn emit(event_state: &EventState, payload: &ArgVec<'_>) {
    dispatch(event_state, payload, None, KEY_MATCH_ALL);
}

/// Emit one occurrence of a variadic event.
#[track_caller]
pub fn emit_variadic(
    event_state: &EventState,
    payload: &ArgVec<'_>,
    var_struct: &DynamicStruct<'_>,
) {
    dispatch(event_state, payload, Some(var_struct), KEY_MATCH_ALL);
}

/// Emit from inside a statedump callback, scoped to the requesting tracer
/// key. A callback fires when the request key or its own key is
/// [`KEY_MATCH_ALL`], or the two are equal. Pass the key reference the
/// statedump callback received.
#[track_caller]
pub fn statedump_emit(event_state: &EventState, payload: &ArgVec<'_>, request_key: &u64) {
    dispatch(event_state, payload, None, *request_key);
}

/// Variadic variant of [`statedump_emit`].
#[track_caller]
pub fn statedump_emit_variadic(
    event_state: &EventState,
    payload: &ArgVec<'_>,
    var_struct: &DynamicStruct<'_>,
    request_key: &u64,
) {
    dispatch(event_state, payload, Some(var_struct), *request_key);
}
