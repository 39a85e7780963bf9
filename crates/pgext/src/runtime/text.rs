//! Variable-length values: text, bytea and C strings.
//!
//! Owned Rust types (`String`, `Vec<u8>`, `CString`) copy out of host
//! memory when read. [`Text`] and [`Bytea`] stay in host memory and check,
//! on every access, that their memory context has not been reset since.

use std::ffi::{CStr, CString};
use std::ptr::NonNull;

use pgext_host::varlena;

use super::datum::Datum;
use super::guard::ffi_guard;
use super::memory::{Arena, BorrowedArena, CurrentArena};
use super::tracking::{Guarded, TrackingArena};
use super::types::{FromDatum, IntoDatum, Type, TypeBinding};
use crate::{Error, Result};

/// A varlena left in host memory.
#[derive(Debug, Clone)]
struct Varlena(Guarded<u8>);

impl Varlena {
    fn copy_in(bytes: &[u8], arena: &impl Arena) -> Result<Self> {
        let ctx = arena.context();
        let ptr = ffi_guard(|| varlena::bytes_to_varlena_in(ctx, bytes))?;
        Self::track(ptr, arena.borrowed())
    }

    fn track(ptr: NonNull<u8>, arena: BorrowedArena) -> Result<Self> {
        Ok(Varlena(TrackingArena::new(arena)?.guard(ptr)))
    }

    fn from_datum(datum: Datum, arena: BorrowedArena) -> Result<Self> {
        let ptr = NonNull::new(datum.cast_ptr::<u8>()).ok_or(Error::InvalidPointer(0))?;
        Self::track(ptr, arena)
    }

    fn payload(&self) -> Result<&[u8]> {
        let ptr = self.0.get()?;
        // SAFETY: the pointer is a varlena header and its context has not
        // been reset since it was guarded; the slice borrows `self`.
        Ok(unsafe { varlena::vardata_any(ptr.as_ptr()) })
    }

    fn datum(&self) -> Result<Datum> {
        Ok(Datum::from_ptr(self.0.get()?.as_ptr().cast_const()))
    }
}

/// A `text` value in host memory.
#[derive(Debug, Clone)]
pub struct Text(Varlena);

impl Text {
    /// Copies `s` into `arena`.
    pub fn new(s: &str, arena: &impl Arena) -> Result<Self> {
        Varlena::copy_in(s.as_bytes(), arena).map(Text)
    }

    /// The raw bytes.
    pub fn as_bytes(&self) -> Result<&[u8]> {
        self.0.payload()
    }

    pub fn as_str(&self) -> Result<&str> {
        std::str::from_utf8(self.as_bytes()?).map_err(|_| Error::InvalidEncoding { target: "text" })
    }

    /// Whether the memory is still live.
    pub fn is_valid(&self) -> bool {
        self.0.0.is_valid()
    }

    /// The tracker watching this value's context.
    pub fn tracker(&self) -> &TrackingArena {
        self.0.0.tracker()
    }
}

impl TypeBinding for Text {
    fn type_for() -> Type {
        Type::TEXT
    }

    fn is(ty: Type) -> bool {
        ty == Type::TEXT || ty == Type::VARCHAR
    }

    fn type_name() -> &'static str {
        "Text"
    }
}

impl FromDatum for Text {
    fn from_datum(datum: Datum, _: Type, arena: BorrowedArena) -> Result<Self> {
        Varlena::from_datum(datum, arena).map(Text)
    }
}

impl IntoDatum for Text {
    fn into_datum(self) -> Result<Datum> {
        self.0.datum()
    }
}

/// A `bytea` value in host memory.
#[derive(Debug, Clone)]
pub struct Bytea(Varlena);

impl Bytea {
    pub fn new(bytes: &[u8], arena: &impl Arena) -> Result<Self> {
        Varlena::copy_in(bytes, arena).map(Bytea)
    }

    pub fn as_bytes(&self) -> Result<&[u8]> {
        self.0.payload()
    }

    pub fn is_valid(&self) -> bool {
        self.0.0.is_valid()
    }
}

impl TypeBinding for Bytea {
    fn type_for() -> Type {
        Type::BYTEA
    }

    fn type_name() -> &'static str {
        "Bytea"
    }
}

impl FromDatum for Bytea {
    fn from_datum(datum: Datum, _: Type, arena: BorrowedArena) -> Result<Self> {
        Varlena::from_datum(datum, arena).map(Bytea)
    }
}

impl IntoDatum for Bytea {
    fn into_datum(self) -> Result<Datum> {
        self.0.datum()
    }
}

fn read_varlena<'a>(datum: Datum) -> Result<&'a [u8]> {
    let ptr = datum.cast_ptr::<u8>();
    if ptr.is_null() {
        return Err(Error::InvalidPointer(0));
    }
    // SAFETY: a non-null datum of a varlena type points at a varlena that
    // stays live for the duration of the call.
    Ok(unsafe { varlena::vardata_any(ptr) })
}

fn copy_out(bytes: &[u8]) -> Result<Datum> {
    let ctx = CurrentArena.context();
    let ptr = ffi_guard(|| varlena::bytes_to_varlena_in(ctx, bytes))?;
    Ok(Datum::from_ptr(ptr.as_ptr().cast_const()))
}

impl TypeBinding for String {
    fn type_for() -> Type {
        Type::TEXT
    }

    fn is(ty: Type) -> bool {
        Text::is(ty)
    }

    fn type_name() -> &'static str {
        "String"
    }
}

impl FromDatum for String {
    fn from_datum(datum: Datum, _: Type, _: BorrowedArena) -> Result<Self> {
        let bytes = read_varlena(datum)?;
        String::from_utf8(bytes.to_vec()).map_err(|_| Error::InvalidEncoding { target: "String" })
    }
}

impl IntoDatum for String {
    fn into_datum(self) -> Result<Datum> {
        copy_out(self.as_bytes())
    }
}

impl TypeBinding for &str {
    fn type_for() -> Type {
        Type::TEXT
    }

    fn type_name() -> &'static str {
        "&str"
    }
}

impl IntoDatum for &str {
    fn into_datum(self) -> Result<Datum> {
        copy_out(self.as_bytes())
    }
}

impl TypeBinding for Vec<u8> {
    fn type_for() -> Type {
        Type::BYTEA
    }

    fn type_name() -> &'static str {
        "Vec<u8>"
    }
}

impl FromDatum for Vec<u8> {
    fn from_datum(datum: Datum, _: Type, _: BorrowedArena) -> Result<Self> {
        read_varlena(datum).map(<[u8]>::to_vec)
    }
}

impl IntoDatum for Vec<u8> {
    fn into_datum(self) -> Result<Datum> {
        copy_out(&self)
    }
}

impl TypeBinding for &[u8] {
    fn type_for() -> Type {
        Type::BYTEA
    }

    fn type_name() -> &'static str {
        "&[u8]"
    }
}

impl IntoDatum for &[u8] {
    fn into_datum(self) -> Result<Datum> {
        copy_out(self)
    }
}

impl TypeBinding for CString {
    fn type_for() -> Type {
        Type::CSTRING
    }

    fn type_name() -> &'static str {
        "CString"
    }
}

impl FromDatum for CString {
    fn from_datum(datum: Datum, _: Type, _: BorrowedArena) -> Result<Self> {
        let ptr = datum.cast_ptr::<std::ffi::c_char>();
        if ptr.is_null() {
            return Err(Error::InvalidPointer(0));
        }
        // SAFETY: cstring datums point at NUL-terminated strings.
        Ok(unsafe { CStr::from_ptr(ptr) }.to_owned())
    }
}

impl IntoDatum for CString {
    fn into_datum(self) -> Result<Datum> {
        let bytes = self.as_bytes_with_nul();
        let ptr = CurrentArena.alloc::<u8>(bytes.len())?;
        // SAFETY: the chunk holds exactly `bytes.len()` bytes.
        unsafe { std::ptr::copy_nonoverlapping(bytes.as_ptr(), ptr.as_ptr(), bytes.len()) };
        Ok(Datum::from_ptr(ptr.as_ptr().cast_const()))
    }
}
