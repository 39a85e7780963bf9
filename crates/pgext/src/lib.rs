//! `pgext`: a typed interop runtime for native database extensions
//!
//! The host database calls extension functions through a C calling
//! convention, hands them untyped machine words and reports errors by
//! unwinding to the innermost catch point. `pgext` lets those functions be
//! written as ordinary Rust closures:
//!
//! - **Typed arguments**: runtime types are checked and converted before the
//!   function body runs
//! - **Error bridging**: host errors become `Result`s, Rust errors and
//!   panics become host errors
//! - **Memory contexts**: host memory is exposed as arenas, with reset
//!   detection for pointers that must not outlive them
//! - **Set-returning functions**: iterators are materialized into the
//!   caller's result set
//! - **Records and transactions**: anonymous rows with named attributes,
//!   and subtransactions that roll back when the host raises
//! - **Workers**: other threads post closures to the host thread
//!
//! # Architecture
//!
//! - **Host Layer** ([`host`]): the host's raw interface, one per thread
//! - **Runtime Layer** ([`runtime`]): safe wrappers and the function adapter
//! - **Logging** (`pgext_log`): diagnostics, filtered by `PGEXT_LOG`
//!
//! # Example
//!
//! ```rust
//! use pgext::{pg_function, SetOf};
//!
//! pg_function!(text_length, |s: String| s.chars().count() as i32);
//!
//! pg_function!(evens, |n: i64| SetOf::new((0..n).map(|i| (i * 2,))));
//! ```

pub mod error;
pub mod runtime;

pub use pgext_host as host;

// Re-export commonly used types
pub use error::{Error, Result};
pub use runtime::{
    Arena, BorrowedArena, CurrentArena, OwnedArena, TrackingArena,
    Datum, NullableDatum, Type, TypeBinding, FromDatum, IntoDatum,
    ErrorCapture, ffi_guard,
    FunctionAdapter, HostFunction, SetOf,
    Role, Text, Bytea, Value, Record,
    Transaction, Subtransaction, Worker, WorkerHandle,
};

#[doc(hidden)]
pub mod __private {
    pub use paste;
}
