//! Tracer keys.
//!
//! A key is a 64-bit tag letting a tracer partition its callbacks; the
//! emit-side key selects which subset fires. Keys below
//! [`KEY_RESERVED_RANGE_END`] carry built-in semantics; everything above is
//! handed out by [`tracer_request_key`].

use spin::Mutex;

use crate::{Error, Result};

/// Matches every callback on dispatch and every pending request on cancel.
pub const KEY_MATCH_ALL: u64 = 0;
/// Reserved for the kernel user-event tracer.
pub const KEY_USER_EVENT: u64 = 1;
/// Reserved for ptrace-based tracers.
pub const KEY_PTRACE: u64 = 2;
/// Keys below this value are reserved; dynamic allocation starts here.
pub const KEY_RESERVED_RANGE_END: u64 = 8;

static KEY_NEXT: Mutex<u64> = Mutex::new(KEY_RESERVED_RANGE_END);

/// Allocate the next dynamic tracer key.
///
/// Returns [`Error::NoMemory`] once the 64-bit counter wraps, which should
/// never happen in practice.
pub fn tracer_request_key() -> Result<u64> {
    let mut next = KEY_NEXT.lock();
    if *next == 0 {
        return Err(Error::NoMemory);
    }
    let key = *next;
    *next = next.wrapping_add(1);
    Ok(key)
}
