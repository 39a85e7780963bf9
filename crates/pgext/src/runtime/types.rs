//! Runtime type tags and the bindings between them and Rust types.
//!
//! A [`TypeBinding`] names the runtime type a Rust type corresponds to and
//! decides which runtime types it accepts. Acceptance only ever widens: an
//! `i64` parameter takes `smallint`, `integer` and `bigint`, but an `i32`
//! parameter never takes `bigint`.
//!
//! | Rust                       | Canonical          | Also accepts             |
//! |----------------------------|--------------------|--------------------------|
//! | `i64`, `usize`             | `bigint`           | `integer`, `smallint`    |
//! | `i32`                      | `integer`          | `smallint`               |
//! | `i16`                      | `smallint`         |                          |
//! | `i8`                       | `"char"`           |                          |
//! | `f64`                      | `double precision` | `real`                   |
//! | `f32`                      | `real`             |                          |
//! | `bool`                     | `boolean`          |                          |
//! | `u32`                      | `oid`              |                          |
//! | `String`, [`Text`]         | `text`             | `character varying`      |
//! | `Vec<u8>`, [`Bytea`]       | `bytea`            |                          |
//! | `CString`                  | `cstring`          |                          |
//! | [`Role`]                   | `regrole`          | `oid`                    |
//! | [`Internal`]               | `internal`         |                          |
//! | [`Datum`], [`Value`]       | `any`              | everything               |
//! | `Option<T>`                | as `T`             | as `T`                   |
//! | tuples of 1 to 8 fields    | `record`           | 1-tuples: as the field   |
//! | [`Record`]                 | `record`           |                          |
//!
//! [`Text`]: super::text::Text
//! [`Bytea`]: super::text::Bytea
//! [`Role`]: super::role::Role
//! [`Value`]: super::value::Value
//! [`Record`]: super::record::Record

use std::ffi::c_void;
use std::fmt;

use pgext_host::fmgr::TupleDesc;
use pgext_host::{INVALID_OID, Oid, catalog, pg_type};

use super::datum::{Datum, NullableDatum};
use super::guard::ffi_guard;
use super::memory::BorrowedArena;
use crate::{Error, Result};

/// A runtime type, identified by its oid.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Type(Oid);

impl Type {
    pub const INVALID: Type = Type(INVALID_OID);
    pub const BOOL: Type = Type(pg_type::BOOLOID);
    pub const BYTEA: Type = Type(pg_type::BYTEAOID);
    pub const CHAR: Type = Type(pg_type::CHAROID);
    pub const INT8: Type = Type(pg_type::INT8OID);
    pub const INT2: Type = Type(pg_type::INT2OID);
    pub const INT4: Type = Type(pg_type::INT4OID);
    pub const TEXT: Type = Type(pg_type::TEXTOID);
    pub const OID: Type = Type(pg_type::OIDOID);
    pub const FLOAT4: Type = Type(pg_type::FLOAT4OID);
    pub const FLOAT8: Type = Type(pg_type::FLOAT8OID);
    pub const VARCHAR: Type = Type(pg_type::VARCHAROID);
    pub const RECORD: Type = Type(pg_type::RECORDOID);
    pub const CSTRING: Type = Type(pg_type::CSTRINGOID);
    pub const ANY: Type = Type(pg_type::ANYOID);
    pub const VOID: Type = Type(pg_type::VOIDOID);
    pub const INTERNAL: Type = Type(pg_type::INTERNALOID);
    pub const REGROLE: Type = Type(pg_type::REGROLEOID);

    pub const fn from_oid(oid: Oid) -> Self {
        Type(oid)
    }

    pub const fn oid(self) -> Oid {
        self.0
    }

    pub const fn is_valid(self) -> bool {
        self.0 != INVALID_OID
    }

    /// The runtime type bound to `T`.
    pub fn of<T: TypeBinding + ?Sized>() -> Self {
        T::type_for()
    }

    /// Looks a type up by name, including aliases such as `int4`.
    pub fn by_name(name: &str) -> Option<Self> {
        let ty = Type(catalog::typename_get_typid(name));
        ty.is_valid().then_some(ty)
    }

    /// The catalog name. Fails for an unknown oid.
    pub fn name(self) -> Result<String> {
        Ok(ffi_guard(|| catalog::format_type_be(self.0))?)
    }

    /// The catalog name, or a placeholder for invalid and unknown oids.
    pub fn display_name(self) -> String {
        catalog::format_type_extended(self.0, true)
    }
}

impl fmt::Debug for Type {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Type({}: {})", self.0, self.display_name())
    }
}

impl fmt::Display for Type {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.display_name())
    }
}

/// Associates a Rust type with a runtime type.
pub trait TypeBinding {
    /// The canonical runtime type.
    fn type_for() -> Type;

    /// Whether a value tagged `ty` may be read as this type.
    fn is(ty: Type) -> bool {
        ty == Self::type_for()
    }

    /// Name used in diagnostics.
    fn type_name() -> &'static str {
        std::any::type_name::<Self>()
    }
}

/// Reads a Rust value out of a datum.
pub trait FromDatum: TypeBinding + Sized {
    /// Converts a non-null datum tagged `ty`.
    ///
    /// By-reference results that stay in host memory are tied to `arena`.
    fn from_datum(datum: Datum, ty: Type, arena: BorrowedArena) -> Result<Self>;

    /// Converts a datum that may be null. Null fails with
    /// [`Error::NullValue`] unless the type can represent it.
    fn from_nullable_datum(datum: NullableDatum, ty: Type, arena: BorrowedArena) -> Result<Self> {
        let datum = datum.value(Self::type_name())?;
        Self::from_datum(datum, ty, arena)
    }
}

/// Turns a Rust value into a datum.
///
/// By-reference values are allocated in the current memory context.
pub trait IntoDatum: TypeBinding + Sized {
    fn into_datum(self) -> Result<Datum>;

    fn into_nullable_datum(self) -> Result<NullableDatum> {
        self.into_datum().map(NullableDatum::nullable)
    }

    /// Whether a result of this type may be returned as `ty`. Results never
    /// widen, so by default only the canonical type matches.
    fn returns_as(ty: Type) -> bool {
        ty == Self::type_for()
    }
}

macro_rules! bind_type {
    ($t:ty, $canonical:expr $(, $also:expr)*) => {
        impl TypeBinding for $t {
            fn type_for() -> Type {
                $canonical
            }

            fn is(ty: Type) -> bool {
                ty == $canonical $(|| ty == $also)*
            }

            fn type_name() -> &'static str {
                stringify!($t)
            }
        }
    };
}

bind_type!(i64, Type::INT8, Type::INT4, Type::INT2);
bind_type!(usize, Type::INT8, Type::INT4, Type::INT2);
bind_type!(i32, Type::INT4, Type::INT2);
bind_type!(i16, Type::INT2);
bind_type!(i8, Type::CHAR);
bind_type!(f64, Type::FLOAT8, Type::FLOAT4);
bind_type!(f32, Type::FLOAT4);
bind_type!(bool, Type::BOOL);
bind_type!(u32, Type::OID);

/// Reads an integer of any accepted width, truncating the word to the
/// width `ty` promises.
fn integer(datum: Datum, ty: Type) -> i64 {
    let word = datum.word();
    match ty {
        Type::INT2 => i64::from(word as i16),
        Type::INT4 => i64::from(word as i32),
        _ => word as i64,
    }
}

impl FromDatum for i64 {
    fn from_datum(datum: Datum, ty: Type, _: BorrowedArena) -> Result<Self> {
        Ok(integer(datum, ty))
    }
}

impl IntoDatum for i64 {
    fn into_datum(self) -> Result<Datum> {
        Ok(Datum::from_i64(self))
    }
}

impl FromDatum for usize {
    fn from_datum(datum: Datum, ty: Type, _: BorrowedArena) -> Result<Self> {
        usize::try_from(integer(datum, ty)).map_err(|_| Error::OutOfRange { target: "usize" })
    }
}

impl IntoDatum for usize {
    fn into_datum(self) -> Result<Datum> {
        let value = i64::try_from(self).map_err(|_| Error::OutOfRange { target: "bigint" })?;
        Ok(Datum::from_i64(value))
    }
}

impl FromDatum for i32 {
    fn from_datum(datum: Datum, ty: Type, _: BorrowedArena) -> Result<Self> {
        Ok(match ty {
            Type::INT2 => i32::from(datum.word() as i16),
            _ => datum.word() as i32,
        })
    }
}

impl IntoDatum for i32 {
    fn into_datum(self) -> Result<Datum> {
        Ok(Datum::from_i64(self.into()))
    }
}

impl FromDatum for i16 {
    fn from_datum(datum: Datum, _: Type, _: BorrowedArena) -> Result<Self> {
        Ok(datum.word() as i16)
    }
}

impl IntoDatum for i16 {
    fn into_datum(self) -> Result<Datum> {
        Ok(Datum::from_i64(self.into()))
    }
}

impl FromDatum for i8 {
    fn from_datum(datum: Datum, _: Type, _: BorrowedArena) -> Result<Self> {
        Ok(datum.word() as i8)
    }
}

impl IntoDatum for i8 {
    fn into_datum(self) -> Result<Datum> {
        Ok(Datum::from_i64(self.into()))
    }
}

impl FromDatum for f64 {
    fn from_datum(datum: Datum, ty: Type, _: BorrowedArena) -> Result<Self> {
        Ok(match ty {
            Type::FLOAT4 => f64::from(datum.to_f32()),
            _ => datum.to_f64(),
        })
    }
}

impl IntoDatum for f64 {
    fn into_datum(self) -> Result<Datum> {
        Ok(Datum::from_f64(self))
    }
}

impl FromDatum for f32 {
    fn from_datum(datum: Datum, _: Type, _: BorrowedArena) -> Result<Self> {
        Ok(datum.to_f32())
    }
}

impl IntoDatum for f32 {
    fn into_datum(self) -> Result<Datum> {
        Ok(Datum::from_f32(self))
    }
}

impl FromDatum for bool {
    fn from_datum(datum: Datum, _: Type, _: BorrowedArena) -> Result<Self> {
        Ok(datum.word() as u8 != 0)
    }
}

impl IntoDatum for bool {
    fn into_datum(self) -> Result<Datum> {
        Ok(Datum::from_bool(self))
    }
}

impl FromDatum for u32 {
    fn from_datum(datum: Datum, _: Type, _: BorrowedArena) -> Result<Self> {
        Ok(datum.word() as u32)
    }
}

impl IntoDatum for u32 {
    fn into_datum(self) -> Result<Datum> {
        Ok(Datum::from_word(self as usize))
    }
}

impl TypeBinding for Datum {
    fn type_for() -> Type {
        Type::ANY
    }

    fn is(_: Type) -> bool {
        true
    }

    fn type_name() -> &'static str {
        "Datum"
    }
}

impl FromDatum for Datum {
    fn from_datum(datum: Datum, _: Type, _: BorrowedArena) -> Result<Self> {
        Ok(datum)
    }
}

impl IntoDatum for Datum {
    fn into_datum(self) -> Result<Datum> {
        Ok(self)
    }

    fn returns_as(_: Type) -> bool {
        true
    }
}

impl TypeBinding for NullableDatum {
    fn type_for() -> Type {
        Type::ANY
    }

    fn is(_: Type) -> bool {
        true
    }

    fn type_name() -> &'static str {
        "NullableDatum"
    }
}

impl FromDatum for NullableDatum {
    fn from_datum(datum: Datum, _: Type, _: BorrowedArena) -> Result<Self> {
        Ok(NullableDatum::nullable(datum))
    }

    fn from_nullable_datum(datum: NullableDatum, _: Type, _: BorrowedArena) -> Result<Self> {
        Ok(datum)
    }
}

impl IntoDatum for NullableDatum {
    fn into_datum(self) -> Result<Datum> {
        self.value(Self::type_name())
    }

    fn into_nullable_datum(self) -> Result<NullableDatum> {
        Ok(self)
    }

    fn returns_as(_: Type) -> bool {
        true
    }
}

/// An opaque pointer passed through as `internal`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Internal(pub *mut c_void);

bind_type!(Internal, Type::INTERNAL);

impl FromDatum for Internal {
    fn from_datum(datum: Datum, _: Type, _: BorrowedArena) -> Result<Self> {
        Ok(Internal(datum.cast_ptr()))
    }
}

impl IntoDatum for Internal {
    fn into_datum(self) -> Result<Datum> {
        Ok(Datum::from_ptr(self.0.cast_const()))
    }
}

impl<T: TypeBinding> TypeBinding for Option<T> {
    fn type_for() -> Type {
        T::type_for()
    }

    fn is(ty: Type) -> bool {
        T::is(ty)
    }

    fn type_name() -> &'static str {
        T::type_name()
    }
}

impl<T: FromDatum> FromDatum for Option<T> {
    fn from_datum(datum: Datum, ty: Type, arena: BorrowedArena) -> Result<Self> {
        T::from_datum(datum, ty, arena).map(Some)
    }

    fn from_nullable_datum(datum: NullableDatum, ty: Type, arena: BorrowedArena) -> Result<Self> {
        match datum.get() {
            Some(datum) => T::from_datum(datum, ty, arena).map(Some),
            None => Ok(None),
        }
    }
}

impl<T: IntoDatum> IntoDatum for Option<T> {
    fn into_datum(self) -> Result<Datum> {
        match self {
            Some(value) => value.into_datum(),
            None => Err(Error::NullValue {
                target: <T as TypeBinding>::type_name(),
            }),
        }
    }

    fn into_nullable_datum(self) -> Result<NullableDatum> {
        match self {
            Some(value) => value.into_nullable_datum(),
            None => Ok(NullableDatum::null()),
        }
    }

    fn returns_as(ty: Type) -> bool {
        <T as IntoDatum>::returns_as(ty)
    }
}

/// A fixed-width row of values.
pub trait TupleBinding: TypeBinding + Sized {
    /// Number of fields.
    const ARITY: usize;

    /// Whether field `index` may be stored in a column of type `ty`.
    fn field_returns_as(index: usize, ty: Type) -> bool;

    fn field_type_name(index: usize) -> &'static str;

    /// Field values and their null flags.
    fn into_row(self) -> Result<(Vec<Datum>, Vec<bool>)>;

    /// Whether a set of these rows may be returned as `ty`.
    fn returns_as(ty: Type) -> bool {
        ty == Type::RECORD || (Self::ARITY == 1 && Self::field_returns_as(0, ty))
    }

    /// Checks the row shape against the caller's expected descriptor.
    fn check_desc(desc: &TupleDesc) -> Result<()> {
        if desc.natts() != Self::ARITY {
            return Err(Error::SetArity {
                expected: desc.natts(),
                got: Self::ARITY,
            });
        }

        for (index, &oid) in desc.attr_types().iter().enumerate() {
            if !Self::field_returns_as(index, Type::from_oid(oid)) {
                return Err(Error::SetFieldType {
                    index,
                    expected: Self::field_type_name(index).to_string(),
                    got: oid,
                });
            }
        }
        Ok(())
    }
}

macro_rules! impl_tuple {
    () => {};
    ($($T:ident $v:ident $idx:tt),+) => {
        impl<$($T: TypeBinding),+> TypeBinding for ($($T,)+) {
            fn type_for() -> Type {
                Type::RECORD
            }

            fn is(ty: Type) -> bool {
                ty == Type::RECORD || (count!($($T)+) == 1 && impl_tuple!(@first ty, $($T)+))
            }
        }

        impl<$($T: IntoDatum),+> TupleBinding for ($($T,)+) {
            const ARITY: usize = count!($($T)+);

            fn field_returns_as(index: usize, ty: Type) -> bool {
                match index {
                    $($idx => <$T as IntoDatum>::returns_as(ty),)+
                    _ => false,
                }
            }

            fn field_type_name(index: usize) -> &'static str {
                match index {
                    $($idx => <$T as TypeBinding>::type_name(),)+
                    _ => "?",
                }
            }

            fn into_row(self) -> Result<(Vec<Datum>, Vec<bool>)> {
                let ($($v,)+) = self;
                let fields = [$($v.into_nullable_datum()?),+];
                Ok((
                    fields.iter().map(|f| f.get().unwrap_or_default()).collect(),
                    fields.iter().map(|f| f.is_null()).collect(),
                ))
            }
        }
    };
    (@first $ty:ident, $First:ident $($Rest:ident)*) => {
        $First::is($ty)
    };
}

for_each_tuple!(impl_tuple);
