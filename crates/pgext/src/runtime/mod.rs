//! `pgext` runtime module.
//!
//! Everything an extension function touches between the host calling it
//! and it returning: values, memory, errors and the call itself.
//!
//! # Architecture
//!
//! - [`datum`]: machine-word values and null flags
//! - [`types`]: runtime type tags and the Rust types bound to them
//! - [`text`]: `text`, `bytea` and C string values
//! - [`role`]: database roles
//! - [`value`]: values typed at runtime
//! - [`memory`]: memory contexts as arenas
//! - [`tracking`]: reset detection for pointers into arenas
//! - [`guard`]: the error bridge from host errors to `Result`
//! - [`report`]: the error channel from Rust back to the host
//! - [`function`]: the function adapter and [`pg_function!`](crate::pg_function)
//! - [`set`]: set-returning functions
//! - [`host_function`]: calling catalog functions from Rust
//! - [`record`]: anonymous rows with named attributes
//! - [`xact`]: transactions and subtransactions as scopes
//! - [`worker`]: running closures on the host thread
//!
//! # Threading
//!
//! All host state is per-thread. None of these types are `Send`; a value
//! must be used on the thread whose host created it. Other threads reach
//! the host through a [`WorkerHandle`], whose closures run on the thread
//! that owns the [`Worker`].

macro_rules! count {
    () => { 0usize };
    ($head:ident $($tail:ident)*) => { 1usize + count!($($tail)*) };
}

/// Invokes `$m` once for every tuple arity from 0 to 8, passing each
/// element as `Type binding index`.
macro_rules! for_each_tuple {
    ($m:ident) => {
        $m!();
        $m!(A a 0);
        $m!(A a 0, B b 1);
        $m!(A a 0, B b 1, C c 2);
        $m!(A a 0, B b 1, C c 2, D d 3);
        $m!(A a 0, B b 1, C c 2, D d 3, E e 4);
        $m!(A a 0, B b 1, C c 2, D d 3, E e 4, F f 5);
        $m!(A a 0, B b 1, C c 2, D d 3, E e 4, F f 5, G g 6);
        $m!(A a 0, B b 1, C c 2, D d 3, E e 4, F f 5, G g 6, H h 7);
    };
}

pub mod datum;
pub mod function;
pub mod guard;
pub mod host_function;
pub mod memory;
pub mod record;
pub mod report;
pub mod role;
pub mod set;
pub mod text;
pub mod tracking;
pub mod types;
pub mod value;
pub mod worker;
pub mod xact;

pub use datum::{Datum, NullableDatum};
pub use function::{CallInfo, Callable, FunctionAdapter, FunctionReturn, call_depth, current_function};
pub use guard::{ErrorCapture, ffi_guard};
pub use host_function::{FunctionArgs, HostFunction};
pub use memory::{Arena, ArenaScope, BorrowedArena, CurrentArena, OwnedArena};
pub use record::Record;
pub use report::{ErrorContextGuard, raise, report};
pub use role::Role;
pub use set::{SetOf, SetRow};
pub use text::{Bytea, Text};
pub use tracking::{Guarded, TrackingArena};
pub use types::{FromDatum, Internal, IntoDatum, TupleBinding, Type, TypeBinding};
pub use value::Value;
pub use worker::{Task, Worker, WorkerHandle};
pub use xact::{Subtransaction, Transaction};
