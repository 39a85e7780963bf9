//! Heap tuples: rows stored in a memory context.
//!
//! A tuple is a single allocation: a [`HeapTupleHeader`] followed by one
//! word per attribute and then one null flag per attribute. The header names
//! the row type by oid and typmod. Anonymous `record` rows get their typmod
//! from [`bless_tuple_desc`], which registers the descriptor so that
//! [`lookup_rowtype_tupdesc`] can find it again from a bare tuple.
//!
//! Attribute words are stored as given. A by-reference attribute must live
//! at least as long as the tuple that points at it.

use std::cell::RefCell;
use std::ptr::NonNull;

use crate::elog::{self, SqlState};
use crate::fmgr::{NullableDatum, TupleDesc};
use crate::pg_type::RECORDOID;
use crate::{Datum, Oid, catalog, memory};

/// Fixed part of a heap tuple.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeapTupleHeader {
    pub typeid: Oid,
    pub typmod: i32,
    pub natts: u32,
}

impl HeapTupleHeader {
    const VALUES_OFFSET: usize =
        size_of::<HeapTupleHeader>().next_multiple_of(align_of::<Datum>());

    fn nulls_offset(natts: usize) -> usize {
        Self::VALUES_OFFSET + natts * size_of::<Datum>()
    }

    /// Bytes needed for a tuple of `natts` attributes.
    pub fn size_for(natts: usize) -> usize {
        Self::nulls_offset(natts) + natts
    }
}

thread_local! {
    // Indexed by typmod.
    static RECORD_TYPES: RefCell<Vec<TupleDesc>> = const { RefCell::new(Vec::new()) };
}

/// Registers `desc` as an anonymous record type and stores its typmod in
/// it. A descriptor already blessed keeps its typmod; one with the same
/// names and types as a registered one shares that entry.
pub fn bless_tuple_desc(desc: &mut TupleDesc) -> i32 {
    if desc.is_blessed() {
        return desc.typmod();
    }

    let typmod = RECORD_TYPES.with(|types| {
        let mut types = types.borrow_mut();
        let existing = types.iter().position(|known| known.same_row_type(desc));
        let index = existing.unwrap_or_else(|| {
            types.push(desc.clone());
            types.len() - 1
        });
        let typmod = i32::try_from(index).unwrap_or(i32::MAX);
        types[index].set_typmod(typmod);
        typmod
    });

    desc.set_typmod(typmod);
    typmod
}

/// The descriptor of row type `typeid`/`typmod`.
///
/// Raises unless `typeid` is `record` and `typmod` was handed out by
/// [`bless_tuple_desc`].
#[track_caller]
pub fn lookup_rowtype_tupdesc(typeid: Oid, typmod: i32) -> TupleDesc {
    if typeid != RECORDOID {
        elog::error(
            SqlState::WRONG_OBJECT_TYPE,
            format!("type {} is not composite", catalog::format_type_be(typeid)),
        );
    }

    let found = usize::try_from(typmod)
        .ok()
        .and_then(|index| RECORD_TYPES.with(|types| types.borrow().get(index).cloned()));
    match found {
        Some(desc) => desc,
        None => elog::error(
            SqlState::WRONG_OBJECT_TYPE,
            "record type has not been registered",
        ),
    }
}

/// Builds a tuple of shape `desc` in the current memory context.
///
/// `values` and `isnull` must both have one entry per attribute. The
/// tuple is stamped with `desc`'s typmod, which stays -1 for a descriptor
/// that was never blessed.
#[track_caller]
pub fn heap_form_tuple(
    desc: &TupleDesc,
    values: &[Datum],
    isnull: &[bool],
) -> NonNull<HeapTupleHeader> {
    let natts = desc.natts();
    if values.len() != natts || isnull.len() != natts {
        elog::error(
            SqlState::INVALID_PARAMETER_VALUE,
            format!(
                "number of columns ({}) does not match tuple descriptor ({natts})",
                values.len().max(isnull.len())
            ),
        );
    }

    let header = HeapTupleHeader {
        typeid: RECORDOID,
        typmod: desc.typmod(),
        natts: u32::try_from(natts).unwrap_or(u32::MAX),
    };

    let base = memory::memory_context_alloc_aligned(
        memory::current_memory_context(),
        HeapTupleHeader::size_for(natts),
        align_of::<HeapTupleHeader>().max(align_of::<Datum>()),
    );

    // SAFETY: the chunk is sized by size_for and aligned for both the header
    // and the words that follow it.
    unsafe {
        base.cast::<HeapTupleHeader>().as_ptr().write(header);
        let words = base.as_ptr().add(HeapTupleHeader::VALUES_OFFSET).cast::<Datum>();
        words.copy_from_nonoverlapping(values.as_ptr(), natts);
        let flags = base.as_ptr().add(HeapTupleHeader::nulls_offset(natts)).cast::<bool>();
        flags.copy_from_nonoverlapping(isnull.as_ptr(), natts);
    }

    base.cast()
}

/// Attribute `index` (zero-based) of `tuple`.
///
/// Raises for an index past the tuple's attributes.
///
/// # Safety
///
/// `tuple` must come from [`heap_form_tuple`] and its memory context must
/// still be alive.
#[track_caller]
pub unsafe fn heap_getattr(tuple: NonNull<HeapTupleHeader>, index: usize) -> NullableDatum {
    // SAFETY: guaranteed by the caller.
    let natts = unsafe { tuple.as_ref() }.natts as usize;
    if index >= natts {
        elog::error(
            SqlState::INVALID_PARAMETER_VALUE,
            format!("invalid attribute number {}", index + 1),
        );
    }

    let base = tuple.cast::<u8>().as_ptr();
    // SAFETY: `index` is within the tuple, laid out as heap_form_tuple
    // wrote it.
    unsafe {
        let value = base
            .add(HeapTupleHeader::VALUES_OFFSET)
            .cast::<Datum>()
            .add(index)
            .read();
        let isnull = base
            .add(HeapTupleHeader::nulls_offset(natts))
            .cast::<bool>()
            .add(index)
            .read();
        if isnull { NullableDatum::NULL } else { NullableDatum::new(value) }
    }
}
