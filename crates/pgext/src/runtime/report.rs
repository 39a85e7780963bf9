//! Reporting to the host.
//!
//! [`raise`] hands an [`Error`] to the host as an ERROR. The exception
//! funnel used by the function adapter builds on it: every failure of an
//! extension function, whether an `Err` or a panic, leaves the function as
//! exactly one host ERROR.

use std::any::Any;
use std::ffi::c_void;
use std::panic::{self, AssertUnwindSafe, Location};

use pgext_host::elog::{self, ErrorContextCallback, HostJump};
use pgext_host::{ErrorLevel, SqlState};

use crate::Error;

/// Sends `message` to the host at `level`.
///
/// Below [`ErrorLevel::Error`] this returns; at or above it, it raises and
/// does not return.
#[track_caller]
pub fn report(level: ErrorLevel, message: impl Into<String>) {
    let code = if level >= ErrorLevel::Error {
        SqlState::INTERNAL_ERROR
    } else if level == ErrorLevel::Warning {
        SqlState::WARNING
    } else {
        SqlState::SUCCESSFUL_COMPLETION
    };
    elog::report(level, code, message);
}

/// Raises `error` as a host ERROR.
///
/// Host errors are raised again unchanged; anything else is reported with
/// its own message and SQLSTATE.
#[track_caller]
pub fn raise(error: Error) -> ! {
    match error {
        Error::Host(capture) => capture.rethrow(),
        error => raise_message(error.sqlstate(), error.to_string()),
    }
}

#[track_caller]
fn raise_message(code: SqlState, message: String) -> ! {
    let location = Location::caller();
    elog::errstart(ErrorLevel::Error);
    elog::errcode(code);
    elog::errmsg(message);
    elog::throw_building(location.file(), location.line())
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> Option<String> {
    payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
}

/// Runs `f`, converting every failure into a host ERROR.
///
/// - `Err(Error::Host(_))` is raised again verbatim.
/// - Any other `Err` becomes `exception: <message>`.
/// - A panic with a message becomes `exception: <message>`, any other panic
///   `some exception occurred`.
///
/// Host jumps already in flight keep unwinding to their catch point.
pub(crate) fn exception_guard<R>(f: impl FnOnce() -> crate::Result<R>) -> R {
    let payload = match panic::catch_unwind(AssertUnwindSafe(f)) {
        Ok(Ok(value)) => return value,
        Ok(Err(Error::Host(capture))) => capture.rethrow(),
        Ok(Err(error)) => {
            raise_message(error.sqlstate(), format!("exception: {error}"))
        }
        Err(payload) => payload,
    };

    if payload.is::<HostJump>() {
        panic::resume_unwind(payload);
    }

    let message = panic_message(payload.as_ref());
    drop(payload);
    match message {
        Some(message) => raise_message(SqlState::INTERNAL_ERROR, format!("exception: {message}")),
        None => raise_message(SqlState::INTERNAL_ERROR, "some exception occurred".to_string()),
    }
}

#[repr(C)]
struct ContextNode<F> {
    callback: ErrorContextCallback,
    describe: F,
}

unsafe extern "C" fn add_context_line<F: Fn() -> String>(arg: *mut c_void) {
    // SAFETY: `arg` is the node installed by ErrorContextGuard::new, which
    // stays installed only while the guard lives.
    let node = unsafe { &*arg.cast_const().cast::<ContextNode<F>>() };
    if let Ok(line) = panic::catch_unwind(AssertUnwindSafe(|| (node.describe)())) {
        elog::errcontext_msg(line);
    }
}

/// Adds a context line to every report made while the guard is alive.
///
/// ```
/// use pgext::runtime::guard::ffi_guard;
/// use pgext::runtime::report::ErrorContextGuard;
/// use pgext::host::{elog, SqlState};
///
/// let _ctx = ErrorContextGuard::new(|| "while loading config".to_string());
/// let err = ffi_guard(|| elog::error(SqlState::INTERNAL_ERROR, "bad")).unwrap_err();
/// assert_eq!(err.context(), Some("while loading config"));
/// ```
#[must_use = "the context line is removed when the guard is dropped"]
pub struct ErrorContextGuard<F: Fn() -> String> {
    node: Box<ContextNode<F>>,
}

impl<F: Fn() -> String> ErrorContextGuard<F> {
    pub fn new(describe: F) -> Self {
        let mut node = Box::new(ContextNode {
            callback: ErrorContextCallback {
                previous: elog::error_context_stack(),
                callback: add_context_line::<F>,
                arg: std::ptr::null_mut(),
            },
            describe,
        });
        node.callback.arg = (&raw mut *node).cast::<c_void>();
        // SAFETY: the boxed node does not move and is unlinked on drop.
        unsafe { elog::set_error_context_stack(&raw mut node.callback) };
        ErrorContextGuard { node }
    }
}

impl<F: Fn() -> String> Drop for ErrorContextGuard<F> {
    fn drop(&mut self) {
        // SAFETY: restores the chain as it was before this node.
        unsafe { elog::set_error_context_stack(self.node.callback.previous) };
    }
}
