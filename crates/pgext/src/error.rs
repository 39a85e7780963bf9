//! Error types for the `pgext` runtime.
//!
//! Everything below the function adapter reports failure through [`Error`].
//! The adapter is the single place where an `Error` becomes a host-level
//! report; see [`crate::runtime::report`].

use pgext_host::elog::SqlState;
use pgext_host::Oid;
use thiserror::Error;

use crate::runtime::guard::ErrorCapture;

fn plural(n: &usize) -> &'static str {
    if *n == 1 { "" } else { "s" }
}

/// Errors raised by the `pgext` runtime.
#[derive(Debug, Error)]
pub enum Error {
    /// A null value was read into a type that cannot hold null.
    #[error("value is null and can't be coerced into {target}")]
    NullValue {
        /// Name of the requested type.
        target: &'static str,
    },

    /// A pointer was used after its memory context was reset or deleted.
    #[error("pointer belongs to a memory context that has been reset or deleted")]
    StaleReference,

    /// The call record carries the wrong number of arguments.
    #[error("expected {expected} arguments, got {got} instead")]
    Arity {
        /// Parameters of the bound callable.
        expected: usize,
        /// Arguments in the call record.
        got: usize,
    },

    /// An argument's runtime type is not accepted by its parameter.
    #[error("unexpected type in position {index}, can't convert `{actual}` into `{expected}`")]
    TypeMismatch {
        /// Zero-based argument position.
        index: usize,
        /// Runtime type name.
        actual: String,
        /// Parameter type name.
        expected: &'static str,
    },

    /// The declared return type cannot receive the callable's result.
    #[error("unexpected return type, can't convert `{actual}` into `{expected}`")]
    ReturnTypeMismatch {
        /// Declared return type name.
        actual: String,
        /// Result type name.
        expected: &'static str,
    },

    /// The function is declared to return a set but the callable does not.
    #[error("unexpected return type, set is expected, but `{found}` does not conform to `SetOf`")]
    SetExpected {
        /// Result type name.
        found: &'static str,
    },

    /// A set-returning function was called without set result info.
    #[error("caller is not expecting a set")]
    NotExpectingSet,

    /// The caller does not accept a materialized set.
    #[error("materialize mode required, but it is not allowed in this context")]
    MaterializeNotAllowed,

    /// Rows have a different width than the caller expects.
    #[error("expected set with {expected} value{}, got {got} instead", plural(.expected))]
    SetArity {
        /// Columns the caller expects.
        expected: usize,
        /// Columns each row has.
        got: usize,
    },

    /// A row field cannot be stored in the caller's column.
    #[error("invalid type in record's position {index} ({expected}), got OID {got}")]
    SetFieldType {
        /// Zero-based column position.
        index: usize,
        /// Field type name.
        expected: String,
        /// Column type.
        got: Oid,
    },

    /// A record attribute was addressed past the record's width.
    #[error("attribute index {index} is out of bounds for record with the size of {natts}")]
    AttributeIndex {
        /// Zero-based attribute position.
        index: usize,
        /// Attributes in the record.
        natts: usize,
    },

    /// A record has no attribute with the given name.
    #[error("no attribute by the name of {0}")]
    NoAttribute(String),

    /// Subtransactions were ended out of the order they began in.
    #[error("subtransaction at level {expected} must end first, current level is {current}")]
    SubtransactionOrder {
        /// Nest level the subtransaction began at.
        expected: usize,
        /// Nest level at the time it was ended.
        current: usize,
    },

    /// A task posted to a worker failed.
    #[error("task failed: {0}")]
    TaskFailed(String),

    /// A worker stopped before running a posted task.
    #[error("worker stopped before the task ran")]
    WorkerStopped,

    /// A dynamic value cannot be read as the requested type.
    #[error("can't convert `{from}` into `{to}`")]
    Conversion {
        /// Runtime type name.
        from: String,
        /// Requested type name.
        to: &'static str,
    },

    /// A value does not fit the requested type.
    #[error("value out of range for {target}")]
    OutOfRange {
        /// Name of the requested type.
        target: &'static str,
    },

    /// Bytes are not valid UTF-8.
    #[error("invalid byte sequence for {target}")]
    InvalidEncoding {
        /// Name of the requested type.
        target: &'static str,
    },

    /// A pointer does not belong to any live memory context.
    #[error("pointer {0:#x} was not allocated by a memory context")]
    InvalidPointer(usize),

    /// An error raised by the host and captured by an error bridge.
    #[error(transparent)]
    Host(#[from] ErrorCapture),

    /// An error raised by extension code.
    #[error("{0}")]
    Message(String),
}

impl Error {
    /// Creates an error carrying `message`.
    pub fn msg(message: impl Into<String>) -> Self {
        Error::Message(message.into())
    }

    /// SQLSTATE used when the error is reported to the host.
    pub fn sqlstate(&self) -> SqlState {
        match self {
            Error::NullValue { .. } => SqlState::NULL_VALUE_NOT_ALLOWED,
            Error::Arity { .. } => SqlState::INVALID_PARAMETER_VALUE,
            Error::TypeMismatch { .. }
            | Error::ReturnTypeMismatch { .. }
            | Error::SetExpected { .. }
            | Error::SetFieldType { .. }
            | Error::SetArity { .. }
            | Error::Conversion { .. } => SqlState::DATATYPE_MISMATCH,
            Error::NotExpectingSet | Error::MaterializeNotAllowed => {
                SqlState::FEATURE_NOT_SUPPORTED
            }
            Error::OutOfRange { .. } => SqlState::NUMERIC_VALUE_OUT_OF_RANGE,
            Error::InvalidEncoding { .. } | Error::AttributeIndex { .. } => {
                SqlState::INVALID_PARAMETER_VALUE
            }
            Error::NoAttribute(_) => SqlState::UNDEFINED_COLUMN,
            Error::SubtransactionOrder { .. } => SqlState::INVALID_TRANSACTION_STATE,
            Error::Host(capture) => capture.sqlstate(),
            Error::StaleReference
            | Error::InvalidPointer(_)
            | Error::TaskFailed(_)
            | Error::WorkerStopped
            | Error::Message(_) => SqlState::INTERNAL_ERROR,
        }
    }
}

/// Result alias for `pgext` operations.
pub type Result<T> = std::result::Result<T, Error>;
