// Shared helpers for host integration tests

#![allow(dead_code)]

use std::panic::{AssertUnwindSafe, catch_unwind, resume_unwind};

use pgext_host::elog::{self, HostJump};
use pgext_host::memory;

/// Runs `f` under a fresh catch point. Returns the message of the ERROR it
/// raised, if any, and leaves no pending error behind.
pub fn catch_error(f: impl FnOnce()) -> Option<String> {
    let target = elog::new_jump_target();
    let saved_target = elog::set_exception_stack(Some(target));
    let saved_context = memory::current_memory_context();

    let outcome = catch_unwind(AssertUnwindSafe(f));
    elog::set_exception_stack(saved_target);

    match outcome {
        Ok(()) => None,
        Err(payload) => match payload.downcast::<HostJump>() {
            Ok(jump) if jump.target == target => {
                memory::memory_context_switch_to(saved_context);
                let message = elog::pending_error_message();
                elog::flush_error_state();
                message
            }
            Ok(jump) => resume_unwind(jump),
            Err(other) => resume_unwind(other),
        },
    }
}
