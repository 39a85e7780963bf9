//! Values whose type is only known at runtime.

use super::datum::{Datum, NullableDatum};
use super::memory::BorrowedArena;
use super::types::{FromDatum, IntoDatum, Type, TypeBinding};
use crate::{Error, Result};

/// A datum paired with its runtime type.
///
/// Binds to any argument type, null included; the concrete type is chosen
/// when the value is read with [`Value::get`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Value {
    datum: NullableDatum,
    ty: Type,
}

impl Value {
    pub const fn new(datum: NullableDatum, ty: Type) -> Self {
        Value { datum, ty }
    }

    pub const fn null(ty: Type) -> Self {
        Value {
            datum: NullableDatum::null(),
            ty,
        }
    }

    /// Converts `value` and records its canonical type.
    pub fn of<T: IntoDatum>(value: T) -> Result<Self> {
        Ok(Value {
            datum: value.into_nullable_datum()?,
            ty: T::type_for(),
        })
    }

    pub const fn datum(&self) -> NullableDatum {
        self.datum
    }

    pub const fn ty(&self) -> Type {
        self.ty
    }

    pub const fn is_null(&self) -> bool {
        self.datum.is_null()
    }

    /// Reads the value as `T`, if `T` accepts its runtime type.
    pub fn get<T: FromDatum>(&self, arena: BorrowedArena) -> Result<T> {
        if !T::is(self.ty) {
            return Err(Error::Conversion {
                from: self.ty.display_name(),
                to: T::type_name(),
            });
        }
        T::from_nullable_datum(self.datum, self.ty, arena)
    }
}

impl TypeBinding for Value {
    fn type_for() -> Type {
        Type::ANY
    }

    fn is(_: Type) -> bool {
        true
    }

    fn type_name() -> &'static str {
        "Value"
    }
}

impl FromDatum for Value {
    fn from_datum(datum: Datum, ty: Type, _: BorrowedArena) -> Result<Self> {
        Ok(Value::new(NullableDatum::nullable(datum), ty))
    }

    fn from_nullable_datum(datum: NullableDatum, ty: Type, _: BorrowedArena) -> Result<Self> {
        Ok(Value::new(datum, ty))
    }
}

impl IntoDatum for Value {
    fn into_datum(self) -> Result<Datum> {
        self.datum.value(Self::type_name())
    }

    fn into_nullable_datum(self) -> Result<NullableDatum> {
        Ok(self.datum)
    }

    fn returns_as(_: Type) -> bool {
        true
    }
}
