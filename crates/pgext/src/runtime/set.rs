//! Set-returning functions.
//!
//! A callable returning [`SetOf`] produces its rows as an iterator; the
//! adapter materializes them into the caller's tuplestore. The rows and
//! everything they point to are allocated in the caller's per-query memory
//! context so they outlive the call.
//!
//! Rows are tuples or [`Record`]s. A tuple's shape is known up front and
//! checked before the callable runs; a record's shape is checked row by
//! row against the caller's expected descriptor.

use pgext_host::fmgr::{FunctionCallInfo, SFRM_MATERIALIZE, TupleDesc, Tuplestore};
use pgext_host::interrupt;

use super::datum::Datum;
use super::function::FunctionReturn;
use super::guard::ffi_guard;
use super::memory::ArenaScope;
use super::record::Record;
use super::report;
use super::types::{TupleBinding, Type, TypeBinding};
use crate::{Error, Result};

/// A row a set-returning function can produce.
pub trait SetRow: Sized {
    /// Whether a set of these rows may be returned as `ty`.
    fn returns_as(ty: Type) -> bool;

    fn row_name() -> &'static str;

    /// Checks what can be known of the row shape before any row exists.
    fn check_desc(desc: &TupleDesc) -> Result<()>;

    /// Descriptor carried by the row itself, if any.
    fn desc(&self) -> Option<&TupleDesc> {
        None
    }

    /// Field values and null flags, checked against `expected`.
    fn into_row(self, expected: Option<&TupleDesc>) -> Result<(Vec<Datum>, Vec<bool>)>;
}

impl<T: TupleBinding> SetRow for T {
    fn returns_as(ty: Type) -> bool {
        <T as TupleBinding>::returns_as(ty)
    }

    fn row_name() -> &'static str {
        <T as TypeBinding>::type_name()
    }

    fn check_desc(desc: &TupleDesc) -> Result<()> {
        <T as TupleBinding>::check_desc(desc)
    }

    fn into_row(self, _: Option<&TupleDesc>) -> Result<(Vec<Datum>, Vec<bool>)> {
        <T as TupleBinding>::into_row(self)
    }
}

impl SetRow for Record {
    fn returns_as(ty: Type) -> bool {
        ty == Type::RECORD
    }

    fn row_name() -> &'static str {
        <Record as TypeBinding>::type_name()
    }

    fn check_desc(_: &TupleDesc) -> Result<()> {
        Ok(())
    }

    fn desc(&self) -> Option<&TupleDesc> {
        Some(Record::desc(self))
    }

    fn into_row(self, expected: Option<&TupleDesc>) -> Result<(Vec<Datum>, Vec<bool>)> {
        if let Some(expected) = expected {
            if expected.natts() != self.attributes() {
                return Err(Error::SetArity {
                    expected: expected.natts(),
                    got: self.attributes(),
                });
            }
            for (index, &oid) in expected.attr_types().iter().enumerate() {
                let own = self.attribute_type(index)?;
                if own.oid() != oid {
                    return Err(Error::SetFieldType {
                        index,
                        expected: own.display_name(),
                        got: oid,
                    });
                }
            }
        }
        self.row()
    }
}

/// The rows of a set-returning function.
///
/// Each row is a tuple or a [`Record`]; a set of single values uses
/// 1-tuples.
///
/// ```
/// use pgext::SetOf;
///
/// fn countdown(n: i64) -> SetOf<impl Iterator<Item = (i64,)>> {
///     SetOf::new((1..=n).rev().map(|i| (i,)))
/// }
/// ```
#[derive(Debug, Clone)]
pub struct SetOf<I>(I);

impl<I> SetOf<I> {
    pub fn new(rows: I) -> Self {
        SetOf(rows)
    }

    pub fn into_inner(self) -> I {
        self.0
    }
}

impl<I> FunctionReturn for SetOf<I>
where
    I: IntoIterator,
    I::Item: SetRow,
{
    const RETURNS_SET: bool = true;

    fn declared_as(ty: Type) -> bool {
        <I::Item as SetRow>::returns_as(ty)
    }

    fn result_name() -> &'static str {
        <I::Item as SetRow>::row_name()
    }

    fn deliver(fcinfo: &mut FunctionCallInfo, call: impl FnOnce() -> Result<Self>) -> Result<Datum> {
        let Some(rsinfo) = fcinfo.resultinfo.as_mut() else {
            report::raise(Error::NotExpectingSet);
        };
        if rsinfo.allowed_modes & SFRM_MATERIALIZE == 0 {
            report::raise(Error::MaterializeNotAllowed);
        }
        if let Some(desc) = &rsinfo.expected_desc {
            <I::Item as SetRow>::check_desc(desc)?;
        }

        let _scope = ArenaScope::enter(rsinfo.per_query_memory);
        rsinfo.return_mode = SFRM_MATERIALIZE;
        rsinfo.set_desc = rsinfo.expected_desc.clone();
        let store = rsinfo.set_result.insert(Tuplestore::begin_heap());

        for row in call()?.0 {
            ffi_guard(interrupt::check_for_interrupts)?;
            if rsinfo.set_desc.is_none() {
                rsinfo.set_desc = row.desc().cloned();
            }
            let (values, nulls) = row.into_row(rsinfo.expected_desc.as_ref())?;
            let words: Vec<usize> = values.iter().map(|d| d.word()).collect();
            ffi_guard(|| store.put_values(&words, &nulls))?;
        }

        fcinfo.isnull = true;
        Ok(Datum::default())
    }
}
