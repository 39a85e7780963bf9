//! Calling host functions from Rust.

use std::fmt;
use std::marker::PhantomData;

use pgext_host::fmgr::{self, FmgrInfo, FunctionCallInfo};
use pgext_host::{Oid, catalog};

use super::datum::{Datum, NullableDatum};
use super::guard::ffi_guard;
use super::memory::BorrowedArena;
use super::types::{FromDatum, IntoDatum, Type, TypeBinding};
use crate::{Error, Result};

/// Argument lists for [`HostFunction`]: tuples of up to eight values.
pub trait FunctionArgs {
    const ARITY: usize;

    /// Canonical type of every argument.
    fn types() -> Vec<Type>;

    /// Whether argument `index` may be passed to a parameter of type `ty`.
    fn passes_as(index: usize, ty: Type) -> bool;

    fn type_name(index: usize) -> &'static str;

    fn into_args(self) -> Result<Vec<NullableDatum>>;
}

macro_rules! impl_function_args {
    ($($T:ident $v:ident $idx:tt),*) => {
        impl<$($T: IntoDatum),*> FunctionArgs for ($($T,)*) {
            const ARITY: usize = count!($($T)*);

            fn types() -> Vec<Type> {
                vec![$(<$T as TypeBinding>::type_for()),*]
            }

            #[allow(unused_variables)]
            fn passes_as(index: usize, ty: Type) -> bool {
                match index {
                    $($idx => <$T as IntoDatum>::returns_as(ty),)*
                    _ => false,
                }
            }

            fn type_name(index: usize) -> &'static str {
                match index {
                    $($idx => <$T as TypeBinding>::type_name(),)*
                    _ => "?",
                }
            }

            fn into_args(self) -> Result<Vec<NullableDatum>> {
                let ($($v,)*) = self;
                Ok(vec![$($v.into_nullable_datum()?),*])
            }
        }
    };
}

for_each_tuple!(impl_function_args);

/// A catalog function, resolved once and callable many times.
///
/// ```
/// use pgext::HostFunction;
/// use pgext::host::builtins::F_INT4PL;
///
/// let add = HostFunction::<(i32, i32), i32>::from_oid(F_INT4PL).unwrap();
/// assert_eq!(add.call((2, 3)).unwrap(), 5);
/// ```
pub struct HostFunction<Args, R> {
    flinfo: FmgrInfo,
    return_type: Type,
    _signature: PhantomData<fn(Args) -> R>,
}

impl<Args: FunctionArgs, R: FromDatum> HostFunction<Args, R> {
    /// Resolves the function with `oid` and checks its signature.
    pub fn from_oid(oid: Oid) -> Result<Self> {
        let flinfo = ffi_guard(|| fmgr::fmgr_info(oid))?;
        let proc = catalog::search_proc(oid)
            .ok_or_else(|| Error::msg(format!("function {oid} disappeared from the catalog")))?;

        if proc.arg_types.len() != Args::ARITY {
            return Err(Error::Arity {
                expected: proc.arg_types.len(),
                got: Args::ARITY,
            });
        }
        for (index, &oid) in proc.arg_types.iter().enumerate() {
            let ty = Type::from_oid(oid);
            if !Args::passes_as(index, ty) {
                return Err(Error::TypeMismatch {
                    index,
                    actual: ty.display_name(),
                    expected: Args::type_name(index),
                });
            }
        }

        let return_type = Type::from_oid(proc.ret_type);
        if !R::is(return_type) {
            return Err(Error::ReturnTypeMismatch {
                actual: return_type.display_name(),
                expected: R::type_name(),
            });
        }

        Ok(HostFunction {
            flinfo,
            return_type,
            _signature: PhantomData,
        })
    }

    /// Resolves the function named `name` taking `Args`' types.
    pub fn lookup(name: &str) -> Result<Self> {
        let types: Vec<Oid> = Args::types().into_iter().map(Type::oid).collect();
        let oid = ffi_guard(|| catalog::lookup_func_name(name, Some(&types)))?;
        Self::from_oid(oid)
    }

    pub fn oid(&self) -> Oid {
        self.flinfo.fn_oid
    }

    /// Whether a null argument makes the result null without a call.
    pub fn is_strict(&self) -> bool {
        self.flinfo.fn_strict
    }

    /// Calls the function. Host errors come back as [`Error::Host`].
    ///
    /// A strict function given a null argument is not called; its result
    /// is null.
    pub fn call(&self, args: Args) -> Result<R> {
        let args = args.into_args()?;
        let arena = BorrowedArena::current();

        if self.flinfo.fn_strict && args.iter().any(|a| a.is_null()) {
            return R::from_nullable_datum(NullableDatum::null(), self.return_type, arena);
        }

        let mut fcinfo = FunctionCallInfo::new(
            self.flinfo.clone(),
            args.into_iter().map(NullableDatum::into_raw).collect(),
        );
        let word = ffi_guard(|| fmgr::function_call_invoke(&mut fcinfo))?;

        let result = if fcinfo.isnull {
            NullableDatum::null()
        } else {
            NullableDatum::nullable(Datum::from_word(word))
        };
        R::from_nullable_datum(result, self.return_type, arena)
    }
}

impl<Args, R> fmt::Debug for HostFunction<Args, R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostFunction")
            .field("oid", &self.flinfo.fn_oid)
            .field("return_type", &self.return_type)
            .finish()
    }
}
