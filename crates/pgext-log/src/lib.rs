//! A small, dependency-free logging facade for the `pgext` workspace.
//!
//! Records carry a [`Level`], the `module_path!()` of the call site and the
//! formatted message. They are handed to the installed [`Sink`]; the default
//! sink writes colored lines to stderr so that log output never interleaves
//! with whatever the host writes on stdout.
//!
//! The minimum level is read once from the `PGEXT_LOG` environment variable
//! (`error`, `warn`, `info`, `debug` or `trace`) and defaults to `warn`.
//!
//! # Example
//!
//! ```
//! use pgext_log::{debug, info, warn, Level};
//!
//! pgext_log::set_level(Level::Debug);
//!
//! let context = "ExprContext";
//! info!("switched into {}", context);
//! debug!("chunk sizes: {:?}", [8192, 16384]);
//! warn!("deleting the current memory context");
//! ```

use std::fmt::{self, Arguments};
use std::str::FromStr;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{OnceLock, RwLock};

/// Environment variable holding the initial minimum level.
pub const LEVEL_ENV: &str = "PGEXT_LOG";

/// Level used when `PGEXT_LOG` is unset or unparsable.
pub const DEFAULT_LEVEL: Level = Level::Warn;

/// Severity of a log record, most severe first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Level {
    /// Failures that abort an operation
    Error = 0,
    /// Suspicious but recoverable situations
    Warn = 1,
    /// Coarse progress information
    Info = 2,
    /// Diagnostic detail
    Debug = 3,
    /// Per-call tracing
    Trace = 4,
}

impl Level {
    const fn color_code(self) -> &'static str {
        match self {
            Level::Error => "\x1b[31m",
            Level::Warn => "\x1b[33m",
            Level::Info => "\x1b[32m",
            Level::Debug => "\x1b[36m",
            Level::Trace => "\x1b[35m",
        }
    }

    /// Returns the upper-case name of this level.
    pub const fn as_str(self) -> &'static str {
        match self {
            Level::Error => "ERROR",
            Level::Warn => "WARN",
            Level::Info => "INFO",
            Level::Debug => "DEBUG",
            Level::Trace => "TRACE",
        }
    }

    const fn from_u8(raw: u8) -> Self {
        match raw {
            0 => Level::Error,
            1 => Level::Warn,
            2 => Level::Info,
            3 => Level::Debug,
            _ => Level::Trace,
        }
    }
}

impl fmt::Display for Level {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned when a string does not name a [`Level`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseLevelError(String);

impl fmt::Display for ParseLevelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid log level: {}", self.0)
    }
}

impl std::error::Error for ParseLevelError {}

impl FromStr for Level {
    type Err = ParseLevelError;

    /// Parses a level name, ignoring case.
    ///
    /// # Example
    ///
    /// ```
    /// use pgext_log::Level;
    ///
    /// assert_eq!("error".parse::<Level>(), Ok(Level::Error));
    /// assert_eq!("INFO".parse::<Level>(), Ok(Level::Info));
    /// assert!("verbose".parse::<Level>().is_err());
    /// ```
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "ERROR" => Ok(Level::Error),
            "WARN" | "WARNING" => Ok(Level::Warn),
            "INFO" => Ok(Level::Info),
            "DEBUG" => Ok(Level::Debug),
            "TRACE" => Ok(Level::Trace),
            _ => Err(ParseLevelError(s.to_string())),
        }
    }
}

/// A single log event as seen by a [`Sink`].
#[derive(Debug, Clone, Copy)]
pub struct Record<'a> {
    pub level: Level,
    pub target: &'a str,
    pub args: Arguments<'a>,
}

/// Destination for log records.
pub type Sink = Box<dyn Fn(&Record<'_>) + Send + Sync>;

/// The global logger: an atomic minimum level plus the installed sink.
pub struct Logger {
    level: AtomicU8,
    sink: RwLock<Option<Sink>>,
}

impl Logger {
    fn new(level: Level) -> Self {
        Logger {
            level: AtomicU8::new(level as u8),
            sink: RwLock::new(None),
        }
    }

    /// Sets the minimum level; records below it are dropped before
    /// formatting.
    pub fn set_level(&self, level: Level) {
        self.level.store(level as u8, Ordering::SeqCst);
    }

    /// Returns the current minimum level.
    pub fn level(&self) -> Level {
        Level::from_u8(self.level.load(Ordering::Relaxed))
    }

    /// Checks if a record at `level` would be emitted.
    pub fn enabled(&self, level: Level) -> bool {
        level as u8 <= self.level.load(Ordering::Relaxed)
    }

    fn emit(&self, record: &Record<'_>) {
        // A poisoned lock only means a sink panicked; keep logging.
        let guard = match self.sink.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };

        match guard.as_ref() {
            Some(sink) => sink(record),
            None => write_stderr(record),
        }
    }
}

fn write_stderr(record: &Record<'_>) {
    const RESET: &str = "\x1b[0m";

    let color = record.level.color_code();
    eprintln!(
        "{color}[{}]{RESET} {}: {}",
        record.level, record.target, record.args
    );
}

static LOGGER: OnceLock<Logger> = OnceLock::new();

/// Returns the global logger, initialising its level from `PGEXT_LOG` on
/// first use.
pub fn get_logger() -> &'static Logger {
    LOGGER.get_or_init(|| Logger::new(level_from_env()))
}

fn level_from_env() -> Level {
    std::env::var(LEVEL_ENV)
        .ok()
        .and_then(|value| value.parse().ok())
        .unwrap_or(DEFAULT_LEVEL)
}

/// Sets the minimum level of the global logger.
pub fn set_level(level: Level) {
    get_logger().set_level(level);
}

/// Sets the minimum level of the global logger from its name.
///
/// ```
/// pgext_log::set_level_from_str("debug").unwrap();
/// assert_eq!(pgext_log::get_logger().level(), pgext_log::Level::Debug);
/// ```
pub fn set_level_from_str(s: &str) -> Result<(), ParseLevelError> {
    set_level(s.parse()?);
    Ok(())
}

/// Replaces the sink of the global logger.
pub fn set_sink(sink: Sink) {
    let logger = get_logger();
    let mut guard = match logger.sink.write() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    };
    *guard = Some(sink);
}

/// Restores the default stderr sink.
pub fn reset_sink() {
    let logger = get_logger();
    let mut guard = match logger.sink.write() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    };
    *guard = None;
}

#[doc(hidden)]
pub fn __log_with_target(level: Level, target: &str, args: Arguments<'_>) {
    let logger = get_logger();
    if !logger.enabled(level) {
        return;
    }

    logger.emit(&Record {
        level,
        target,
        args,
    });
}

/// Logs at an explicit level.
///
/// ```
/// use pgext_log::{log, Level};
///
/// log!(level: Level::Info, "relation {} has {} blocks", "pg_class", 14);
/// ```
#[macro_export]
macro_rules! log {
    (level: $level:expr, $($arg:tt)*) => {
        {
            if $crate::get_logger().enabled($level) {
                $crate::__log_with_target(
                    $level,
                    module_path!(),
                    format_args!($($arg)*)
                );
            }
        }
    };
}

/// Logs at [`Level::Error`].
#[macro_export]
macro_rules! error {
    ($($arg:tt)*) => {
        $crate::log!(level: $crate::Level::Error, $($arg)*)
    };
}

/// Logs at [`Level::Warn`].
#[macro_export]
macro_rules! warn {
    ($($arg:tt)*) => {
        $crate::log!(level: $crate::Level::Warn, $($arg)*)
    };
}

/// Logs at [`Level::Info`].
#[macro_export]
macro_rules! info {
    ($($arg:tt)*) => {
        $crate::log!(level: $crate::Level::Info, $($arg)*)
    };
}

/// Logs at [`Level::Debug`].
#[macro_export]
macro_rules! debug {
    ($($arg:tt)*) => {
        $crate::log!(level: $crate::Level::Debug, $($arg)*)
    };
}

/// Logs at [`Level::Trace`].
#[macro_export]
macro_rules! trace {
    ($($arg:tt)*) => {
        $crate::log!(level: $crate::Level::Trace, $($arg)*)
    };
}
