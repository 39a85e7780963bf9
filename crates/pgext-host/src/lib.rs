//! Host side of the pgext ABI.
//!
//! This crate is the raw, C-shaped contract an extension is compiled against:
//! machine-word [`Datum`]s, [`Oid`] type tags, memory contexts, the elog
//! diagnostic channel with its jump-based error signaling, fmgr call records,
//! the system catalog and interrupt flags.
//!
//! It also carries an in-process implementation of that contract. Every piece
//! of host state is confined to the calling thread, which stands in for the
//! single backend call stack an extension runs on. Tests and benchmarks use it
//! as the host; the safe layer in the `pgext` crate never assumes anything
//! beyond the functions exported here.
//!
//! - [`memory`]: hierarchical memory contexts with bump-allocated blocks
//! - [`elog`]: error reports, jump targets, error-context callbacks
//! - [`fmgr`]: call records, set-returning result info, tuplestores
//! - [`heaptuple`]: composite rows and anonymous record types
//! - [`catalog`]: procs, types and roles
//! - [`xact`]: transactions and internal subtransactions
//! - [`interrupt`]: asynchronous cancellation flag
//! - [`varlena`]: variable-length value layout

pub mod builtins;
pub mod catalog;
pub mod elog;
pub mod fmgr;
pub mod heaptuple;
pub mod interrupt;
pub mod memory;
pub mod pg_type;
pub mod varlena;
pub mod xact;

pub use elog::{ErrorData, ErrorLevel, HostJump, JumpTarget, SqlState};
pub use fmgr::{
    CallContext, FmgrInfo, FunctionCallInfo, NullableDatum, PgFunction,
    ReturnSetInfo, TupleDesc, Tuplestore,
};
pub use heaptuple::HeapTupleHeader;
pub use memory::MemoryContext;

/// A machine word exchanged across the ABI.
///
/// Holds either a by-value bit pattern or a pointer into a memory context;
/// which one is only known together with the value's type oid.
pub type Datum = usize;

/// Object identifier. Type tags, function ids and role ids are all oids.
pub type Oid = u32;

/// The oid no catalog object ever has.
pub const INVALID_OID: Oid = 0;

/// First oid handed out to objects created at runtime.
pub const FIRST_NORMAL_OBJECT_ID: Oid = 16384;
