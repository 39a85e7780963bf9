//! The error bridge between host errors and Rust results.
//!
//! The host reports ERRORs by unwinding to the innermost installed catch
//! point. [`ffi_guard`] installs a catch point of its own around a closure,
//! so a host raise inside it becomes an `Err(ErrorCapture)` instead of a
//! jump over Rust frames that never expected one.
//!
//! # Protocol
//!
//! 1. Save the caller's exception stack and error-context chain, install a
//!    fresh catch point.
//! 2. Run the closure.
//! 3. Restore both saved values, on every exit path, exactly once.
//! 4. If the host jumped to *our* catch point: switch back to the memory
//!    context current at entry and copy the pending error into a private
//!    child of the error context.
//!
//! Jumps aimed at an outer catch point, and ordinary panics, keep
//! unwinding.

use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::ptr::NonNull;

use pgext_host::elog::{self, ErrorContextCallback, ErrorData, HostJump, JumpTarget};
use pgext_host::memory;
use pgext_host::{ErrorLevel, SqlState};
use pgext_log::debug;

use super::memory::{Arena, BorrowedArena, OwnedArena};

/// A host error copied out of the host's error state.
///
/// Owns the memory context holding the copy; the strings it hands out live
/// as long as the capture.
pub struct ErrorCapture {
    arena: OwnedArena,
    data: NonNull<ErrorData>,
    #[cfg(feature = "error-backtrace")]
    backtrace: backtrace::Backtrace,
}

impl ErrorCapture {
    fn data(&self) -> &ErrorData {
        // SAFETY: `data` was written by copy_error_data into `arena`, which
        // this capture owns.
        unsafe { self.data.as_ref() }
    }

    /// Primary message.
    pub fn message(&self) -> &str {
        // SAFETY: the strings live in `self.arena`.
        unsafe { self.data().message() }
    }

    pub fn detail(&self) -> Option<&str> {
        // SAFETY: as above.
        unsafe { self.data().detail() }
    }

    pub fn hint(&self) -> Option<&str> {
        // SAFETY: as above.
        unsafe { self.data().hint() }
    }

    /// Context lines added by error-context callbacks.
    pub fn context(&self) -> Option<&str> {
        // SAFETY: as above.
        unsafe { self.data().context() }
    }

    /// Source file that raised the error.
    pub fn filename(&self) -> Option<&str> {
        // SAFETY: as above.
        unsafe { self.data().filename() }
    }

    pub fn lineno(&self) -> u32 {
        self.data().lineno
    }

    pub fn sqlstate(&self) -> SqlState {
        self.data().sqlerrcode
    }

    pub fn level(&self) -> ErrorLevel {
        self.data().elevel
    }

    /// The memory context holding the copy.
    pub fn arena(&self) -> BorrowedArena {
        self.arena.borrowed()
    }

    #[cfg(feature = "error-backtrace")]
    pub fn backtrace(&self) -> &backtrace::Backtrace {
        &self.backtrace
    }

    /// Raises this error again through the host, unchanged.
    pub fn rethrow(self) -> ! {
        let level = self.level().max(ErrorLevel::Error);
        let code = self.sqlstate();
        let message = self.message().to_owned();
        let detail = self.detail().map(str::to_owned);
        let hint = self.hint().map(str::to_owned);
        let context = self.context().map(str::to_owned);
        let filename = self.filename().unwrap_or(file!()).to_owned();
        let lineno = self.lineno();
        // Free the copy before unwinding.
        drop(self);

        elog::errstart(level);
        elog::errcode(code);
        elog::errmsg(message);
        if let Some(detail) = detail {
            elog::errdetail(detail);
        }
        if let Some(hint) = hint {
            elog::errhint(hint);
        }
        if let Some(context) = context {
            elog::errcontext_msg(context);
        }
        elog::throw_building(filename, lineno)
    }

    /// Copies the pending host error and clears the host's error state.
    ///
    /// Runs behind its own bridge: a failure while copying replaces the
    /// original error.
    fn materialize() -> ErrorCapture {
        match ffi_guard(Self::copy_pending) {
            Ok(capture) | Err(capture) => capture,
        }
    }

    fn copy_pending() -> ErrorCapture {
        let ctx = memory::alloc_set_context_create(
            memory::error_memory_context(),
            "ErrorCapture",
        );
        // SAFETY: the context was just created and nothing else owns it.
        let arena = unsafe { OwnedArena::from_context(ctx) };

        let previous = memory::memory_context_switch_to(ctx);
        let data = elog::copy_error_data();
        memory::memory_context_switch_to(previous);
        elog::flush_error_state();

        let Some(data) = data else {
            elog::error(SqlState::INTERNAL_ERROR, "no pending error to capture");
        };

        ErrorCapture {
            arena,
            data,
            #[cfg(feature = "error-backtrace")]
            backtrace: backtrace::Backtrace::new(),
        }
    }
}

impl fmt::Debug for ErrorCapture {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ErrorCapture")
            .field("level", &self.level())
            .field("sqlstate", &self.sqlstate())
            .field("message", &self.message())
            .field("detail", &self.detail())
            .field("hint", &self.hint())
            .finish()
    }
}

impl fmt::Display for ErrorCapture {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.message())
    }
}

impl std::error::Error for ErrorCapture {}

/// Catch point installed for the duration of one bridge call.
struct CatchPoint {
    target: JumpTarget,
    saved_exception_stack: Option<JumpTarget>,
    saved_context_stack: *mut ErrorContextCallback,
}

impl CatchPoint {
    fn install() -> Self {
        let target = elog::new_jump_target();
        let saved_context_stack = elog::error_context_stack();
        let saved_exception_stack = elog::set_exception_stack(Some(target));
        CatchPoint {
            target,
            saved_exception_stack,
            saved_context_stack,
        }
    }
}

impl Drop for CatchPoint {
    fn drop(&mut self) {
        elog::set_exception_stack(self.saved_exception_stack);
        // SAFETY: the chain was installed when the catch point was and its
        // nodes outlive this call.
        unsafe { elog::set_error_context_stack(self.saved_context_stack) };
    }
}

/// Runs `f`, turning a host ERROR raised inside it into an [`ErrorCapture`].
///
/// Bridges nest: each call gets its own catch point and an error is
/// delivered to the innermost one. The caller's catch-point state is
/// restored on return whether or not `f` raised, and a Rust panic from `f`
/// passes through untouched.
///
/// ```
/// use pgext::runtime::guard::ffi_guard;
/// use pgext::host::catalog;
///
/// let err = ffi_guard(|| catalog::get_role_oid("nobody_here", false)).unwrap_err();
/// assert_eq!(err.message(), "role \"nobody_here\" does not exist");
/// ```
pub fn ffi_guard<R>(f: impl FnOnce() -> R) -> Result<R, ErrorCapture> {
    let entry_context = memory::current_memory_context();
    let catch_point = CatchPoint::install();
    let target = catch_point.target;

    let outcome = panic::catch_unwind(AssertUnwindSafe(f));
    drop(catch_point);

    match outcome {
        Ok(value) => Ok(value),
        Err(payload) => match payload.downcast::<HostJump>() {
            Ok(jump) if jump.target == target => {
                memory::memory_context_switch_to(entry_context);
                let capture = ErrorCapture::materialize();
                debug!("captured host error: {}", capture.message());
                Err(capture)
            }
            Ok(jump) => panic::resume_unwind(jump),
            Err(payload) => panic::resume_unwind(payload),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pgext_host::catalog;

    #[test]
    fn test_guard_passes_value_through() {
        let before = elog::jump_state();
        assert_eq!(ffi_guard(|| 42).unwrap(), 42);
        assert_eq!(elog::jump_state(), before);
    }

    #[test]
    fn test_guard_captures_host_error() {
        let before = elog::jump_state();
        let capture = ffi_guard(|| {
            elog::error(SqlState::UNDEFINED_OBJECT, "nothing here");
        })
        .unwrap_err();

        assert_eq!(capture.message(), "nothing here");
        assert_eq!(capture.sqlstate(), SqlState::UNDEFINED_OBJECT);
        assert_eq!(capture.level(), ErrorLevel::Error);
        assert_eq!(elog::jump_state(), before);
        assert!(!elog::has_pending_error());
    }

    #[test]
    fn test_guard_restores_memory_context() {
        let before = memory::current_memory_context();
        let _ = ffi_guard(|| {
            elog::error(SqlState::INTERNAL_ERROR, "boom");
        });
        assert_eq!(memory::current_memory_context(), before);
    }

    #[test]
    fn test_capture_lives_under_error_context() {
        let capture = ffi_guard(|| catalog::get_role_oid("ghost", false)).unwrap_err();
        let ctx = capture.arena().context();
        assert_eq!(
            memory::memory_context_parent(ctx),
            Some(memory::error_memory_context())
        );

        drop(capture);
        assert!(!memory::memory_context_is_valid(ctx));
    }

    #[test]
    fn test_nested_guards_deliver_to_innermost() {
        let outer = ffi_guard(|| {
            let inner = ffi_guard(|| {
                elog::error(SqlState::INTERNAL_ERROR, "inner");
            });
            inner.unwrap_err().message().to_owned()
        });
        assert_eq!(outer.unwrap(), "inner");
    }

    #[test]
    fn test_guard_lets_panics_through() {
        let before = elog::jump_state();
        let result = panic::catch_unwind(|| ffi_guard(|| panic!("not a host error")));
        assert!(result.is_err());
        assert_eq!(elog::jump_state(), before);
    }
}
