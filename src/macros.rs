//! Event definition macros.
//!
//! Events are plain statics: a description paired with its version-0 state
//! block, mutually referencing each other. [`crate::static_event!`] emits
//! both so callers never hand-assemble the ABI structs.

/// Define the paired description/state statics for one event.
///
/// The expansion produces a `static` of type
/// [`EventDescription`](crate::event::EventDescription) under the given
/// name, with its state block seeded to the shared empty callback vector.
/// Append `variadic` to flag the variadic call shape.
///
/// ```ignore
/// tracewire::static_event!(pub REQUEST_START, "app:request_start");
/// tracewire::static_event!(LOG_MESSAGE, "app:log_message", variadic);
///
/// tracewire::emit(REQUEST_START.state, &tracewire::ArgVec { args: &[] });
/// ```
#[macro_export]
macro_rules! static_event {
    ($vis:vis $name:ident, $event_name:expr) => {
        $crate::static_event!(@define $vis $name, $event_name, 0);
    };
    ($vis:vis $name:ident, $event_name:expr, variadic) => {
        $crate::static_event!(@define $vis $name, $event_name,
            $crate::event::EVENT_FLAG_VARIADIC);
    };
    (@define $vis:vis $name:ident, $event_name:expr, $flags:expr) => {
        $vis static $name: $crate::event::EventDescription = {
            static STATE: $crate::event::EventStateV0 = $crate::event::EventStateV0 {
                parent: $crate::event::EventState {
                    version: $crate::event::EVENT_STATE_ABI_VERSION,
                },
                nr_callbacks: ::core::sync::atomic::AtomicU32::new(0),
                enabled: ::core::sync::atomic::AtomicUsize::new(0),
                callbacks: ::core::sync::atomic::AtomicPtr::new(
                    $crate::event::EMPTY_CALLBACK.as_ptr(),
                ),
                desc: &$name,
            };
            $crate::event::EventDescription {
                flags: $flags,
                name: $event_name,
                state: &STATE.parent,
            }
        };
    };
}
