//! Anonymous rows of type `record`.
//!
//! A [`Record`] is a heap tuple left in host memory together with the
//! descriptor that gives its attributes names and types. Records built
//! here are blessed, so a record passed back in as an argument finds its
//! descriptor again from the tuple alone.
//!
//! Like [`Text`](super::text::Text), a record checks on every access that
//! its memory context has not been reset.

use std::ptr::NonNull;

use pgext_host::fmgr::TupleDesc;
use pgext_host::heaptuple::{self, HeapTupleHeader};

use super::datum::{Datum, NullableDatum};
use super::guard::ffi_guard;
use super::memory::{Arena, BorrowedArena};
use super::tracking::{Guarded, TrackingArena};
use super::types::{FromDatum, IntoDatum, TupleBinding, Type, TypeBinding};
use super::value::Value;
use crate::{Error, Result};

/// A row in host memory and its descriptor.
///
/// ```no_run
/// use pgext::{CurrentArena, Record};
/// use pgext::host::fmgr::TupleDesc;
/// use pgext::host::pg_type::{INT4OID, TEXTOID};
///
/// # fn main() -> pgext::Result<()> {
/// let desc = TupleDesc::with_names([("id", INT4OID), ("name", TEXTOID)]);
/// let row = Record::from_row(desc, (7_i32, "seven".to_string()), &CurrentArena)?;
/// assert_eq!(row.get_by_name::<String>("name")?, "seven");
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct Record {
    desc: TupleDesc,
    tuple: Guarded<HeapTupleHeader>,
}

impl Record {
    /// Forms a record of shape `desc` in `arena`, one value per attribute.
    ///
    /// By-reference values are stored as pointers and must outlive the
    /// record.
    pub fn new(desc: TupleDesc, values: &[NullableDatum], arena: &impl Arena) -> Result<Self> {
        let words: Vec<usize> = values
            .iter()
            .map(|value| value.get().map_or(0, Datum::word))
            .collect();
        let nulls: Vec<bool> = values.iter().map(|value| value.is_null()).collect();
        Self::form(desc, &words, &nulls, arena)
    }

    /// Forms a record from a tuple after checking it fits `desc`.
    pub fn from_row<T: TupleBinding>(desc: TupleDesc, row: T, arena: &impl Arena) -> Result<Self> {
        T::check_desc(&desc)?;
        let (values, nulls) = row.into_row()?;
        let words: Vec<usize> = values.iter().map(|datum| datum.word()).collect();
        Self::form(desc, &words, &nulls, arena)
    }

    fn form(mut desc: TupleDesc, words: &[usize], nulls: &[bool], arena: &impl Arena) -> Result<Self> {
        heaptuple::bless_tuple_desc(&mut desc);
        let ptr = arena.run(|| ffi_guard(|| heaptuple::heap_form_tuple(&desc, words, nulls)))?;
        let tracker = TrackingArena::new(arena.borrowed())?;
        Ok(Record {
            desc,
            tuple: tracker.guard(ptr),
        })
    }

    fn track(ptr: NonNull<HeapTupleHeader>, arena: BorrowedArena) -> Result<Self> {
        let tuple = TrackingArena::new(arena)?.guard(ptr);
        // SAFETY: the header was written by heap_form_tuple and its context
        // is live, as checked by the guard just made.
        let header = unsafe { tuple.get()?.as_ref() };
        let (typeid, typmod) = (header.typeid, header.typmod);
        let desc = ffi_guard(|| heaptuple::lookup_rowtype_tupdesc(typeid, typmod))?;
        Ok(Record { desc, tuple })
    }

    pub fn desc(&self) -> &TupleDesc {
        &self.desc
    }

    /// Number of attributes.
    pub fn attributes(&self) -> usize {
        self.desc.natts()
    }

    fn check_index(&self, index: usize) -> Result<()> {
        if index < self.attributes() {
            Ok(())
        } else {
            Err(Error::AttributeIndex {
                index,
                natts: self.attributes(),
            })
        }
    }

    pub fn attribute_type(&self, index: usize) -> Result<Type> {
        self.check_index(index)?;
        let oid = self.desc.attr_type(index).ok_or(Error::AttributeIndex {
            index,
            natts: self.attributes(),
        })?;
        Ok(Type::from_oid(oid))
    }

    pub fn attribute_name(&self, index: usize) -> Result<&str> {
        self.check_index(index)?;
        self.desc.attr_name(index).ok_or(Error::AttributeIndex {
            index,
            natts: self.attributes(),
        })
    }

    /// Position of the attribute called `name`.
    pub fn attribute_index(&self, name: &str) -> Result<usize> {
        self.desc
            .attr_index(name)
            .ok_or_else(|| Error::NoAttribute(name.to_string()))
    }

    /// Attribute `index` with its runtime type.
    pub fn value(&self, index: usize) -> Result<Value> {
        let ty = self.attribute_type(index)?;
        let tuple = self.tuple.get()?;
        // SAFETY: the guard confirmed the tuple's context is live.
        let raw = ffi_guard(|| unsafe { heaptuple::heap_getattr(tuple, index) })?;
        Ok(Value::new(NullableDatum::from_raw(raw), ty))
    }

    /// Attribute `index` read as `T`.
    ///
    /// By-reference results that stay in host memory belong to the
    /// record's context.
    pub fn get<T: FromDatum>(&self, index: usize) -> Result<T> {
        self.value(index)?.get(self.tuple.tracker().borrowed())
    }

    pub fn get_by_name<T: FromDatum>(&self, name: &str) -> Result<T> {
        self.get(self.attribute_index(name)?)
    }

    /// Whether the memory is still live.
    pub fn is_valid(&self) -> bool {
        self.tuple.is_valid()
    }

    /// Attribute words and null flags, for storing the record as a row.
    pub(crate) fn row(&self) -> Result<(Vec<Datum>, Vec<bool>)> {
        let values = (0..self.attributes())
            .map(|index| self.value(index).map(|value| value.datum()))
            .collect::<Result<Vec<_>>>()?;
        Ok((
            values.iter().map(|value| value.get().unwrap_or_default()).collect(),
            values.iter().map(|value| value.is_null()).collect(),
        ))
    }
}

impl TypeBinding for Record {
    fn type_for() -> Type {
        Type::RECORD
    }

    fn type_name() -> &'static str {
        "Record"
    }
}

impl FromDatum for Record {
    fn from_datum(datum: Datum, _: Type, arena: BorrowedArena) -> Result<Self> {
        let ptr = NonNull::new(datum.cast_ptr::<HeapTupleHeader>()).ok_or(Error::InvalidPointer(0))?;
        Self::track(ptr, arena)
    }
}

impl IntoDatum for Record {
    fn into_datum(self) -> Result<Datum> {
        Ok(Datum::from_ptr(self.tuple.get()?.as_ptr().cast_const()))
    }
}
