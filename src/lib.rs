//! Userspace instrumentation runtime.
//!
//! Applications and libraries declare *events* with [`static_event!`] and
//! emit occurrences with [`emit`]; *tracers* attach callbacks to events,
//! subscribe to registry notifications, and request *statedumps* of
//! application state. The emit fast path performs no allocation and takes
//! no lock: it reads the event's enable word, enters an RCU read section
//! and walks the current callback vector.
//!
//! # Quick Start
//!
//! ```ignore
//! tracewire::static_event!(REQUEST_START, "app:request_start");
//!
//! static EVENTS: [&tracewire::EventDescription; 1] = [&REQUEST_START];
//!
//! fn main() {
//!     tracewire::init();
//!     let handle = tracewire::events_register(&EVENTS).unwrap();
//!
//!     tracewire::emit(
//!         REQUEST_START.state,
//!         &tracewire::ArgVec { args: &[tracewire::Arg::U64(42)] },
//!     );
//!
//!     tracewire::events_unregister(handle);
//!     tracewire::exit();
//! }
//! ```
//!
//! # Reentrancy
//!
//! Tracer callbacks may register and unregister event callbacks (the
//! registry mutex is recursive), but must not register or unregister
//! statedump handles; the same contract applies to application statedump
//! callbacks. Tracer notification callbacks run with the registry mutex
//! held and must not block.

#[macro_use]
extern crate log;

use core::fmt;
use core::sync::atomic::{AtomicBool, Ordering};

mod list;
mod rcu;

pub mod event;
pub mod keys;
pub mod macros;
pub mod registry;
pub mod statedump;

pub use event::{
    Arg, ArgVec, DynamicStruct, EVENT_FLAG_VARIADIC, EventDescription, EventState, EventStateV0,
    TracerCallback, TracerCallbackVariadic, emit, emit_variadic, event_enabled, ptrace_hook,
    registered_callback_count, statedump_emit, statedump_emit_variadic,
};
pub use keys::{KEY_MATCH_ALL, KEY_PTRACE, KEY_USER_EVENT, tracer_request_key};
pub use registry::{
    EventsRegisterHandle, TracerHandle, TracerNotification, TracerNotificationCb, events_register,
    events_unregister, tracer_callback_register, tracer_callback_unregister,
    tracer_callback_variadic_register, tracer_callback_variadic_unregister,
    tracer_event_notification_register, tracer_event_notification_unregister,
};
pub use statedump::{
    STATEDUMP_BEGIN, STATEDUMP_END, StatedumpCallback, StatedumpMode, StatedumpRequestHandle,
    statedump_poll_pending_requests, statedump_request_notification_register,
    statedump_request_notification_unregister, statedump_run_pending_requests,
    tracer_statedump_request, tracer_statedump_request_cancel,
};

// =============================================================================
// Errors
// =============================================================================

/// Stable error codes shared with out-of-process consumers. `0` is
/// reserved for success and represented by `Result::Ok`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum Error {
    /// Invalid argument: wrong call shape, reserved key, or an exhausted
    /// callback table.
    Invalid = 1,
    /// The (callback, private data, key) triple is already registered.
    Exists = 2,
    /// Allocation failure, or key-space exhaustion.
    NoMemory = 3,
    /// No matching entry.
    NoEntry = 4,
    /// The library is finalized.
    Exiting = 5,
}

impl Error {
    /// The stable integer code.
    pub const fn code(self) -> i32 {
        self as i32
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Invalid => write!(f, "invalid argument"),
            Self::Exists => write!(f, "entry already registered"),
            Self::NoMemory => write!(f, "out of memory"),
            Self::NoEntry => write!(f, "no such entry"),
            Self::Exiting => write!(f, "library is finalized"),
        }
    }
}

impl std::error::Error for Error {}

pub type Result<T> = core::result::Result<T, Error>;

// =============================================================================
// Lifecycle
// =============================================================================

/// Lazy initialization for early use within library constructors.
static INITIALIZED: AtomicBool = AtomicBool::new(false);
/// No more registrations after finalization.
static FINALIZED: AtomicBool = AtomicBool::new(false);

/// Initialize the runtime.
///
/// Idempotent, and performed lazily by every public entry point; calling
/// it explicitly only pins down when the fork handlers are installed.
/// The two RCU domains are statically allocated and const-initialized,
/// so they are already live by the time this can run.
pub fn init() {
    if INITIALIZED.swap(true, Ordering::SeqCst) {
        return;
    }
    statedump::install_fork_handlers();
    debug!("tracewire initialized");
}

/// Finalize the runtime.
///
/// Unregisters every remaining events batch and releases the RCU
/// domains, then makes all subsequent registrations fail with
/// [`Error::Exiting`] and all emits silent no-ops. Idempotent.
/// Concurrent API use during finalization is not supported.
pub fn exit() {
    if FINALIZED.load(Ordering::SeqCst) {
        return;
    }
    registry::unregister_all_events();
    rcu::exit_domains();
    FINALIZED.store(true, Ordering::SeqCst);
    debug!("tracewire finalized");
}

#[inline]
pub(crate) fn ensure_init() {
    if !INITIALIZED.load(Ordering::Relaxed) {
        init();
    }
}

#[inline]
pub(crate) fn is_finalized() -> bool {
    FINALIZED.load(Ordering::Relaxed)
}
