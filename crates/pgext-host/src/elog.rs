//! Error reporting and the jump-based error signal.
//!
//! A report is built with [`errstart`], decorated with [`errcode`],
//! [`errmsg`], [`errdetail`] and [`errhint`], and completed by [`errfinish`].
//! Reports below [`ErrorLevel::Error`] are emitted and control returns to the
//! caller. Reports at ERROR or above never return: the error-context
//! callbacks annotate the report, it becomes the pending error, the error
//! memory context becomes current and the stack unwinds to the innermost
//! installed [`JumpTarget`] with a [`HostJump`] payload.
//!
//! Catching an error means installing a target with [`set_exception_stack`],
//! catching the unwind, recognising the payload as a jump to that target,
//! restoring the previous target and then reading the pending error with
//! [`copy_error_data`] before discarding it with [`flush_error_state`].
//!
//! With no target installed an ERROR is unrecoverable and the thread panics.

use std::borrow::Cow;
use std::cell::RefCell;
use std::ffi::{CStr, c_char, c_void};
use std::fmt;
use std::num::NonZeroU64;
use std::panic::Location;
use std::ptr::{self, NonNull};

use crate::memory;

/// Report severity, numbered as the host numbers them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(i32)]
pub enum ErrorLevel {
    Debug5 = 10,
    Debug4 = 11,
    Debug3 = 12,
    Debug2 = 13,
    Debug1 = 14,
    Log = 15,
    Info = 17,
    Notice = 18,
    Warning = 19,
    Error = 21,
    Fatal = 22,
    Panic = 23,
}

impl ErrorLevel {
    pub const fn as_str(self) -> &'static str {
        match self {
            ErrorLevel::Debug5
            | ErrorLevel::Debug4
            | ErrorLevel::Debug3
            | ErrorLevel::Debug2
            | ErrorLevel::Debug1 => "DEBUG",
            ErrorLevel::Log => "LOG",
            ErrorLevel::Info => "INFO",
            ErrorLevel::Notice => "NOTICE",
            ErrorLevel::Warning => "WARNING",
            ErrorLevel::Error => "ERROR",
            ErrorLevel::Fatal => "FATAL",
            ErrorLevel::Panic => "PANIC",
        }
    }

    fn log_level(self) -> pgext_log::Level {
        match self {
            ErrorLevel::Debug5
            | ErrorLevel::Debug4
            | ErrorLevel::Debug3
            | ErrorLevel::Debug2
            | ErrorLevel::Debug1 => pgext_log::Level::Debug,
            ErrorLevel::Log | ErrorLevel::Info | ErrorLevel::Notice => {
                pgext_log::Level::Info
            }
            ErrorLevel::Warning => pgext_log::Level::Warn,
            ErrorLevel::Error | ErrorLevel::Fatal | ErrorLevel::Panic => {
                pgext_log::Level::Error
            }
        }
    }
}

impl fmt::Display for ErrorLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Five-character SQLSTATE error code.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct SqlState([u8; 5]);

impl SqlState {
    pub const SUCCESSFUL_COMPLETION: SqlState = SqlState(*b"00000");
    pub const WARNING: SqlState = SqlState(*b"01000");
    pub const FEATURE_NOT_SUPPORTED: SqlState = SqlState(*b"0A000");
    pub const NULL_VALUE_NOT_ALLOWED: SqlState = SqlState(*b"22004");
    pub const NUMERIC_VALUE_OUT_OF_RANGE: SqlState = SqlState(*b"22003");
    pub const INVALID_PARAMETER_VALUE: SqlState = SqlState(*b"22023");
    pub const INVALID_TRANSACTION_STATE: SqlState = SqlState(*b"25000");
    pub const NO_ACTIVE_SQL_TRANSACTION: SqlState = SqlState(*b"25P01");
    pub const UNDEFINED_COLUMN: SqlState = SqlState(*b"42703");
    pub const WRONG_OBJECT_TYPE: SqlState = SqlState(*b"42809");
    pub const DATATYPE_MISMATCH: SqlState = SqlState(*b"42804");
    pub const UNDEFINED_FUNCTION: SqlState = SqlState(*b"42883");
    pub const AMBIGUOUS_FUNCTION: SqlState = SqlState(*b"42725");
    pub const UNDEFINED_OBJECT: SqlState = SqlState(*b"42704");
    pub const OUT_OF_MEMORY: SqlState = SqlState(*b"53200");
    pub const PROGRAM_LIMIT_EXCEEDED: SqlState = SqlState(*b"54000");
    pub const QUERY_CANCELED: SqlState = SqlState(*b"57014");
    pub const INTERNAL_ERROR: SqlState = SqlState(*b"XX000");

    /// Builds a code from its five characters. Returns `None` unless every
    /// character is an ASCII digit or upper-case letter.
    pub const fn new(code: [u8; 5]) -> Option<SqlState> {
        let mut i = 0;
        while i < 5 {
            if !(code[i].is_ascii_digit() || code[i].is_ascii_uppercase()) {
                return None;
            }
            i += 1;
        }
        Some(SqlState(code))
    }

    pub fn as_str(&self) -> &str {
        // Constructors only admit ASCII.
        std::str::from_utf8(&self.0).unwrap_or("XX000")
    }
}

impl fmt::Debug for SqlState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SqlState({})", self.as_str())
    }
}

impl fmt::Display for SqlState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A report as copied out by [`copy_error_data`]. Every string lives in the
/// memory context that was current during the copy.
#[repr(C)]
pub struct ErrorData {
    pub elevel: ErrorLevel,
    pub sqlerrcode: SqlState,
    pub message: *const c_char,
    pub detail: *const c_char,
    pub hint: *const c_char,
    pub context: *const c_char,
    pub filename: *const c_char,
    pub lineno: u32,
}

impl ErrorData {
    unsafe fn field<'a>(ptr: *const c_char) -> Option<&'a str> {
        if ptr.is_null() {
            return None;
        }
        // SAFETY: non-null fields are NUL-terminated copies made by
        // copy_error_data; the caller keeps their context alive.
        unsafe { CStr::from_ptr(ptr) }.to_str().ok()
    }

    /// Primary message.
    ///
    /// # Safety
    ///
    /// The context the data was copied into must still be alive.
    pub unsafe fn message(&self) -> &str {
        unsafe { Self::field(self.message) }.unwrap_or_default()
    }

    /// # Safety
    ///
    /// See [`ErrorData::message`].
    pub unsafe fn detail(&self) -> Option<&str> {
        unsafe { Self::field(self.detail) }
    }

    /// # Safety
    ///
    /// See [`ErrorData::message`].
    pub unsafe fn hint(&self) -> Option<&str> {
        unsafe { Self::field(self.hint) }
    }

    /// Lines contributed by error-context callbacks, newline separated.
    ///
    /// # Safety
    ///
    /// See [`ErrorData::message`].
    pub unsafe fn context(&self) -> Option<&str> {
        unsafe { Self::field(self.context) }
    }

    /// # Safety
    ///
    /// See [`ErrorData::message`].
    pub unsafe fn filename(&self) -> Option<&str> {
        unsafe { Self::field(self.filename) }
    }
}

/// Identifies one installed catch point.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct JumpTarget(NonZeroU64);

/// Unwind payload carrying an ERROR to its catch point.
#[derive(Debug)]
pub struct HostJump {
    pub target: JumpTarget,
}

/// Node of the error-context callback chain.
#[repr(C)]
pub struct ErrorContextCallback {
    pub previous: *mut ErrorContextCallback,
    pub callback: unsafe extern "C" fn(arg: *mut c_void),
    pub arg: *mut c_void,
}

/// Snapshot of the catch-point state, used to check that it is restored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JumpState {
    pub exception_stack: Option<JumpTarget>,
    pub error_context_stack: usize,
}

/// A report being assembled or pending.
#[derive(Debug, Clone)]
struct Report {
    elevel: ErrorLevel,
    sqlerrcode: SqlState,
    message: String,
    detail: Option<String>,
    hint: Option<String>,
    context: Option<String>,
    filename: Cow<'static, str>,
    lineno: u32,
}

impl Report {
    fn new(elevel: ErrorLevel) -> Self {
        let sqlerrcode = if elevel >= ErrorLevel::Error {
            SqlState::INTERNAL_ERROR
        } else if elevel == ErrorLevel::Warning {
            SqlState::WARNING
        } else {
            SqlState::SUCCESSFUL_COMPLETION
        };

        Report {
            elevel,
            sqlerrcode,
            message: String::new(),
            detail: None,
            hint: None,
            context: None,
            filename: Cow::Borrowed(""),
            lineno: 0,
        }
    }
}

#[derive(Default)]
struct ElogState {
    building: Vec<Report>,
    pending: Vec<Report>,
    client: Vec<(ErrorLevel, String)>,
    exception_stack: Option<JumpTarget>,
    error_context_stack: usize,
    next_target: u64,
}

thread_local! {
    static ELOG: RefCell<ElogState> = RefCell::new(ElogState::default());
}

fn with_state<R>(f: impl FnOnce(&mut ElogState) -> R) -> R {
    ELOG.with(|state| f(&mut state.borrow_mut()))
}

fn with_building(f: impl FnOnce(&mut Report)) {
    with_state(|s| {
        if let Some(report) = s.building.last_mut() {
            f(report);
        }
    });
}

/// Begins a report. Returns `false` if a report at `elevel` would be
/// discarded, in which case nothing is started.
pub fn errstart(elevel: ErrorLevel) -> bool {
    if elevel < ErrorLevel::Notice
        && !pgext_log::get_logger().enabled(elevel.log_level())
    {
        return false;
    }

    with_state(|s| s.building.push(Report::new(elevel)));
    true
}

pub fn errcode(code: SqlState) {
    with_building(|r| r.sqlerrcode = code);
}

pub fn errmsg(message: impl Into<String>) {
    let message = message.into();
    with_building(|r| r.message = message);
}

pub fn errdetail(detail: impl Into<String>) {
    let detail = detail.into();
    with_building(|r| r.detail = Some(detail));
}

pub fn errhint(hint: impl Into<String>) {
    let hint = hint.into();
    with_building(|r| r.hint = Some(hint));
}

/// Appends a context line. Meant to be called from error-context callbacks.
pub fn errcontext_msg(line: impl Into<String>) {
    let line = line.into();
    with_building(|r| match &mut r.context {
        Some(context) => {
            context.push('\n');
            context.push_str(&line);
        }
        None => r.context = Some(line),
    });
}

/// Completes the report begun by the last [`errstart`].
///
/// Returns only for reports below [`ErrorLevel::Error`].
pub fn errfinish(filename: &'static str, lineno: u32) {
    with_building(|r| {
        r.filename = Cow::Borrowed(filename);
        r.lineno = lineno;
    });

    let level = with_state(|s| s.building.last().map(|r| r.elevel));
    match level {
        Some(level) if level >= ErrorLevel::Error => {
            throw_building(filename, lineno)
        }
        Some(_) => {
            run_context_callbacks();
            if let Some(report) = with_state(|s| s.building.pop()) {
                emit(report);
            }
        }
        None => {}
    }
}

/// Completes the report begun by the last [`errstart`] as an ERROR,
/// whatever level it was started with.
///
/// `filename` may be owned, so an error raised again keeps the location it
/// was first raised at.
pub fn throw_building(filename: impl Into<Cow<'static, str>>, lineno: u32) -> ! {
    let filename = filename.into();
    with_building(|r| {
        r.filename = filename;
        r.lineno = lineno;
        r.elevel = r.elevel.max(ErrorLevel::Error);
    });

    run_context_callbacks();

    let report = with_state(|s| s.building.pop())
        .unwrap_or_else(|| Report::new(ErrorLevel::Error));
    throw(report)
}

/// Raises an ERROR with `code` and `message`.
#[track_caller]
pub fn error(code: SqlState, message: impl Into<String>) -> ! {
    let location = Location::caller();
    with_state(|s| s.building.push(Report::new(ErrorLevel::Error)));
    errcode(code);
    errmsg(message);
    throw_building(location.file(), location.line())
}

/// Reports `message` at `elevel`, returning only below ERROR.
#[track_caller]
pub fn report(elevel: ErrorLevel, code: SqlState, message: impl Into<String>) {
    let location = Location::caller();
    if errstart(elevel) {
        errcode(code);
        errmsg(message);
        errfinish(location.file(), location.line());
    }
}

fn throw(report: Report) -> ! {
    let target = with_state(|s| {
        let target = s.exception_stack;
        if target.is_some() {
            s.pending.push(report.clone());
        }
        target
    });

    let Some(target) = target else {
        panic!("{}:  {} (no exception handler installed)", report.elevel, report.message);
    };

    memory::memory_context_switch_to(memory::error_memory_context());
    std::panic::resume_unwind(Box::new(HostJump { target }))
}

fn run_context_callbacks() {
    let mut node = error_context_stack();

    while !node.is_null() {
        // SAFETY: set_error_context_stack requires installed nodes to
        // outlive their installation.
        let (callback, arg, previous) =
            unsafe { ((*node).callback, (*node).arg, (*node).previous) };
        unsafe { callback(arg) };
        node = previous;
    }
}

fn emit(report: Report) {
    pgext_log::log!(
        level: report.elevel.log_level(),
        "{}:  {}",
        report.elevel,
        report.message
    );

    if report.elevel >= ErrorLevel::Notice {
        with_state(|s| s.client.push((report.elevel, report.message)));
    }
}

/// Drains the messages sent to the client since the last call.
pub fn take_client_messages() -> Vec<(ErrorLevel, String)> {
    with_state(|s| std::mem::take(&mut s.client))
}

/// Allocates a fresh catch point, distinct from every other on this thread.
pub fn new_jump_target() -> JumpTarget {
    with_state(|s| {
        s.next_target += 1;
        JumpTarget(NonZeroU64::MIN.saturating_add(s.next_target))
    })
}

/// The innermost installed catch point.
pub fn exception_stack() -> Option<JumpTarget> {
    with_state(|s| s.exception_stack)
}

/// Installs `target` as the innermost catch point, returning the previous
/// one.
pub fn set_exception_stack(target: Option<JumpTarget>) -> Option<JumpTarget> {
    with_state(|s| std::mem::replace(&mut s.exception_stack, target))
}

/// Head of the error-context callback chain.
pub fn error_context_stack() -> *mut ErrorContextCallback {
    with_state(|s| ptr::with_exposed_provenance_mut(s.error_context_stack))
}

/// Installs `head` as the error-context chain, returning the previous head.
///
/// # Safety
///
/// Every node reachable from `head` must stay valid and unmodified until it
/// is no longer reachable from the installed head.
pub unsafe fn set_error_context_stack(
    head: *mut ErrorContextCallback,
) -> *mut ErrorContextCallback {
    let previous = with_state(|s| {
        std::mem::replace(&mut s.error_context_stack, head.expose_provenance())
    });
    ptr::with_exposed_provenance_mut(previous)
}

/// Current catch-point state.
pub fn jump_state() -> JumpState {
    with_state(|s| JumpState {
        exception_stack: s.exception_stack,
        error_context_stack: s.error_context_stack,
    })
}

/// Whether an ERROR has been raised and not yet flushed.
pub fn has_pending_error() -> bool {
    with_state(|s| !s.pending.is_empty())
}

/// Message of the innermost pending error.
pub fn pending_error_message() -> Option<String> {
    with_state(|s| s.pending.last().map(|r| r.message.clone()))
}

/// Copies the innermost pending error into the current memory context.
///
/// Returns `None` when no error is pending.
pub fn copy_error_data() -> Option<NonNull<ErrorData>> {
    let report = with_state(|s| s.pending.last().cloned())?;
    let ctx = memory::current_memory_context();

    let copy = |s: &str| memory::memory_context_strdup(ctx, s).as_ptr().cast_const();
    let copy_opt = |s: &Option<String>| s.as_deref().map_or(ptr::null(), copy);

    let data = ErrorData {
        elevel: report.elevel,
        sqlerrcode: report.sqlerrcode,
        message: copy(&report.message),
        detail: copy_opt(&report.detail),
        hint: copy_opt(&report.hint),
        context: copy_opt(&report.context),
        filename: copy(&report.filename),
        lineno: report.lineno,
    };

    let slot = memory::memory_context_alloc_aligned(
        ctx,
        size_of::<ErrorData>(),
        align_of::<ErrorData>(),
    )
    .cast::<ErrorData>();

    // SAFETY: the chunk is sized and aligned for one ErrorData.
    unsafe { slot.as_ptr().write(data) };
    Some(slot)
}

/// Discards all pending and half-built reports.
pub fn flush_error_state() {
    with_state(|s| {
        s.pending.clear();
        s.building.clear();
    });
}

/// Reports through the host channel with the caller's location.
///
/// ```should_panic
/// use pgext_host::{ereport, ErrorLevel, SqlState};
///
/// ereport!(ErrorLevel::Error, SqlState::INTERNAL_ERROR, "bad {}", "thing");
/// ```
#[macro_export]
macro_rules! ereport {
    ($level:expr, $code:expr, $($arg:tt)+) => {
        $crate::elog::report($level, $code, ::std::format!($($arg)+))
    };
}

/// Reports an internal message at `level`.
#[macro_export]
macro_rules! elog {
    ($level:expr, $($arg:tt)+) => {
        $crate::elog::report(
            $level,
            if $level >= $crate::elog::ErrorLevel::Error {
                $crate::elog::SqlState::INTERNAL_ERROR
            } else {
                $crate::elog::SqlState::SUCCESSFUL_COMPLETION
            },
            ::std::format!($($arg)+),
        )
    };
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::panic::{AssertUnwindSafe, catch_unwind};

    /// Runs `f` under a fresh catch point; true if it raised.
    fn catching(f: impl FnOnce()) -> bool {
        let target = new_jump_target();
        let saved = set_exception_stack(Some(target));
        let outcome = catch_unwind(AssertUnwindSafe(f));
        set_exception_stack(saved);

        match outcome {
            Ok(()) => false,
            Err(payload) => {
                let jump = payload.downcast::<HostJump>().ok().unwrap();
                assert_eq!(jump.target, target);
                true
            }
        }
    }

    #[test]
    fn test_error_jumps_to_installed_target() {
        assert!(catching(|| error(SqlState::UNDEFINED_OBJECT, "gone")));
        assert!(has_pending_error());
        assert_eq!(pending_error_message().as_deref(), Some("gone"));
        flush_error_state();
        assert!(!has_pending_error());
    }

    #[test]
    fn test_error_switches_to_error_context() {
        let before = memory::current_memory_context();
        assert!(catching(|| error(SqlState::INTERNAL_ERROR, "boom")));
        assert_eq!(
            memory::current_memory_context(),
            memory::error_memory_context()
        );
        memory::memory_context_switch_to(before);
        flush_error_state();
    }

    #[test]
    fn test_notice_returns_and_reaches_client() {
        report(ErrorLevel::Notice, SqlState::SUCCESSFUL_COMPLETION, "hello");
        let messages = take_client_messages();
        assert_eq!(messages, vec![(ErrorLevel::Notice, "hello".to_string())]);
    }

    #[test]
    #[should_panic(expected = "no exception handler installed")]
    fn test_error_without_target_is_fatal() {
        error(SqlState::INTERNAL_ERROR, "nowhere to go");
    }

    #[test]
    fn test_copy_error_data() {
        let raised = catching(|| {
            errstart(ErrorLevel::Error);
            errcode(SqlState::DATATYPE_MISMATCH);
            errmsg("wrong type");
            errdetail("expected int4");
            errfinish(file!(), line!());
        });
        assert!(raised);

        let ctx = memory::alloc_set_context_create(
            memory::top_memory_context(),
            "copy",
        );
        let old = memory::memory_context_switch_to(ctx);
        let data = copy_error_data().unwrap();
        memory::memory_context_switch_to(old);
        flush_error_state();

        let data = unsafe { data.as_ref() };
        assert_eq!(data.elevel, ErrorLevel::Error);
        assert_eq!(data.sqlerrcode, SqlState::DATATYPE_MISMATCH);
        assert_eq!(unsafe { data.message() }, "wrong type");
        assert_eq!(unsafe { data.detail() }, Some("expected int4"));
        assert_eq!(unsafe { data.hint() }, None);
        memory::memory_context_delete(ctx);
    }

    unsafe extern "C" fn add_context(arg: *mut c_void) {
        let label = unsafe { &*(arg as *const &str) };
        errcontext_msg(format!("while {label}"));
    }

    #[test]
    fn test_context_callbacks_annotate_errors() {
        let label = "testing";
        let mut node = ErrorContextCallback {
            previous: error_context_stack(),
            callback: add_context,
            arg: &label as *const &str as *mut c_void,
        };
        let saved = unsafe { set_error_context_stack(&mut node) };

        assert!(catching(|| error(SqlState::INTERNAL_ERROR, "annotated")));
        unsafe { set_error_context_stack(saved) };

        let copied = copy_error_data().unwrap();
        let context = unsafe { copied.as_ref().context() }.map(str::to_owned);
        flush_error_state();
        assert_eq!(context.as_deref(), Some("while testing"));
    }

    #[test]
    fn test_sqlstate_validation() {
        assert_eq!(SqlState::new(*b"42704"), Some(SqlState::UNDEFINED_OBJECT));
        assert_eq!(SqlState::new(*b"4270x"), None);
        assert_eq!(SqlState::QUERY_CANCELED.to_string(), "57014");
    }
}
