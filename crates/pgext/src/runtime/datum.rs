//! Machine-word values and their null flag.

use std::fmt;

use pgext_host::fmgr;

use crate::{Error, Result};

/// One machine word: either a value stored inline or a pointer to memory
/// owned by a host memory context.
#[repr(transparent)]
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct Datum(pgext_host::Datum);

impl Datum {
    pub const fn from_word(word: usize) -> Self {
        Datum(word)
    }

    pub const fn word(self) -> usize {
        self.0
    }

    pub fn from_ptr<T>(ptr: *const T) -> Self {
        Datum(ptr.expose_provenance())
    }

    /// Reinterprets the word as a pointer.
    pub fn cast_ptr<T>(self) -> *mut T {
        std::ptr::with_exposed_provenance_mut(self.0)
    }

    pub const fn from_bool(value: bool) -> Self {
        Datum(value as usize)
    }

    /// Narrow integers are sign-extended to the full word.
    pub const fn from_i64(value: i64) -> Self {
        Datum(value as usize)
    }

    pub const fn from_f64(value: f64) -> Self {
        Datum(value.to_bits() as usize)
    }

    /// The bits sit in the low half of the word.
    pub const fn from_f32(value: f32) -> Self {
        Datum(value.to_bits() as usize)
    }

    pub const fn to_i64(self) -> i64 {
        self.0 as i64
    }

    pub const fn to_f64(self) -> f64 {
        f64::from_bits(self.0 as u64)
    }

    pub const fn to_f32(self) -> f32 {
        f32::from_bits(self.0 as u32)
    }
}

impl fmt::Debug for Datum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Datum({:#x})", self.0)
    }
}

/// A [`Datum`] that may be null.
#[repr(transparent)]
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct NullableDatum(fmgr::NullableDatum);

impl NullableDatum {
    /// A non-null value.
    pub const fn nullable(value: Datum) -> Self {
        NullableDatum(fmgr::NullableDatum::new(value.0))
    }

    pub const fn null() -> Self {
        NullableDatum(fmgr::NullableDatum::NULL)
    }

    pub const fn from_raw(raw: fmgr::NullableDatum) -> Self {
        NullableDatum(raw)
    }

    pub const fn into_raw(self) -> fmgr::NullableDatum {
        self.0
    }

    pub const fn is_null(self) -> bool {
        self.0.isnull
    }

    /// The value, or `None` when null.
    pub const fn get(self) -> Option<Datum> {
        if self.0.isnull {
            None
        } else {
            Some(Datum(self.0.value))
        }
    }

    /// The value; fails with [`Error::NullValue`] naming `target` when null.
    pub fn value(self, target: &'static str) -> Result<Datum> {
        self.get().ok_or(Error::NullValue { target })
    }
}

impl From<Datum> for NullableDatum {
    fn from(value: Datum) -> Self {
        NullableDatum::nullable(value)
    }
}

impl From<Option<Datum>> for NullableDatum {
    fn from(value: Option<Datum>) -> Self {
        value.map_or(NullableDatum::null(), NullableDatum::nullable)
    }
}

impl fmt::Debug for NullableDatum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.get() {
            Some(datum) => write!(f, "NullableDatum({:#x})", datum.word()),
            None => f.write_str("NullableDatum(NULL)"),
        }
    }
}
