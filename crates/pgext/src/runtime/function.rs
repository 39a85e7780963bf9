//! Exposing Rust callables as host functions.
//!
//! A [`FunctionAdapter`] binds a Rust callable to the host calling
//! convention. Each call goes through the same pipeline:
//!
//! 1. **Arity**: the call record must carry exactly as many arguments as
//!    the callable takes.
//! 2. **Types**: every argument's runtime type, resolved from the call
//!    site or else from the catalog, must be accepted by its parameter.
//!    The declared return type must be able to receive the result, and a
//!    function declared to return a set must return a
//!    [`SetOf`](super::set::SetOf).
//! 3. **Convert**: arguments become Rust values, by-reference ones tied to
//!    the current memory context.
//! 4. **Dispatch**: the callable runs inside the exception funnel and its
//!    result is written back into the call record.
//!
//! Steps 1 and 2 report their mismatch directly; from step 3 on, failures
//! are prefixed with `exception:` by the funnel. While the callable runs,
//! [`current_function`] describes the call.
//!
//! Use [`pg_function!`](crate::pg_function) to export a callable.

use std::cell::RefCell;
use std::marker::PhantomData;

use pgext_host::fmgr::{self, FunctionCallInfo};
use pgext_host::{Oid, catalog};
use pgext_log::trace;

use super::datum::{Datum, NullableDatum};
use super::memory::BorrowedArena;
use super::report::{self, exception_guard};
use super::types::{FromDatum, IntoDatum, Type, TypeBinding};
use crate::{Error, Result};

/// Describes the function call in progress.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallInfo {
    pub fn_oid: Oid,
    pub nargs: usize,
    pub arg_types: Vec<Type>,
    pub return_type: Type,
    pub collation: Oid,
    /// `Some` when called as a procedure: whether it runs atomically.
    pub atomic: Option<bool>,
}

impl CallInfo {
    /// Whether the call may not commit or roll back. Plain function calls
    /// are always atomic.
    pub fn is_atomic(&self) -> bool {
        self.atomic.unwrap_or(true)
    }
}

thread_local! {
    static CALL_STACK: RefCell<Vec<CallInfo>> = const { RefCell::new(Vec::new()) };
}

/// The innermost adapter call on this thread, if any.
pub fn current_function() -> Option<CallInfo> {
    CALL_STACK.with(|stack| stack.borrow().last().cloned())
}

/// Number of adapter calls in progress on this thread.
pub fn call_depth() -> usize {
    CALL_STACK.with(|stack| stack.borrow().len())
}

/// Marks an adapter call; popped on drop.
struct CallFrame;

impl CallFrame {
    fn push(info: CallInfo) -> Self {
        CALL_STACK.with(|stack| stack.borrow_mut().push(info));
        CallFrame
    }
}

impl Drop for CallFrame {
    fn drop(&mut self) {
        CALL_STACK.with(|stack| stack.borrow_mut().pop());
    }
}

/// A Rust callable with parameters `Args`, callable with host values.
///
/// Implemented for every `Fn` taking up to eight [`FromDatum`] arguments
/// and returning a [`FunctionReturn`].
pub trait Callable<Args> {
    type Output: FunctionReturn;

    const ARITY: usize;

    fn accepts_arg(index: usize, ty: Type) -> bool;

    fn arg_type_name(index: usize) -> &'static str;

    /// Converts exactly [`Self::ARITY`] arguments.
    fn convert(args: &[NullableDatum], types: &[Type], arena: BorrowedArena) -> Result<Args>;

    fn invoke(&self, args: Args) -> Self::Output;
}

macro_rules! impl_callable {
    ($($T:ident $v:ident $idx:tt),*) => {
        impl<Func, Ret, $($T,)*> Callable<($($T,)*)> for Func
        where
            Func: Fn($($T),*) -> Ret,
            Ret: FunctionReturn,
            $($T: FromDatum,)*
        {
            type Output = Ret;

            const ARITY: usize = count!($($T)*);

            #[allow(unused_variables)]
            fn accepts_arg(index: usize, ty: Type) -> bool {
                match index {
                    $($idx => <$T as TypeBinding>::is(ty),)*
                    _ => false,
                }
            }

            fn arg_type_name(index: usize) -> &'static str {
                match index {
                    $($idx => <$T as TypeBinding>::type_name(),)*
                    _ => "?",
                }
            }

            #[allow(unused_variables)]
            fn convert(
                args: &[NullableDatum],
                types: &[Type],
                arena: BorrowedArena,
            ) -> Result<($($T,)*)> {
                Ok(($($T::from_nullable_datum(args[$idx], types[$idx], arena)?,)*))
            }

            fn invoke(&self, ($($v,)*): ($($T,)*)) -> Ret {
                self($($v),*)
            }
        }
    };
}

for_each_tuple!(impl_callable);

/// A result that can be written back into a call record.
pub trait FunctionReturn: Sized {
    /// Whether the result is a set of rows.
    const RETURNS_SET: bool = false;

    /// Whether the function may be declared as returning `ty`.
    fn declared_as(ty: Type) -> bool;

    fn result_name() -> &'static str;

    /// Runs `call` and stores its result in `fcinfo`.
    fn deliver(fcinfo: &mut FunctionCallInfo, call: impl FnOnce() -> Result<Self>) -> Result<Datum>;
}

impl<T: IntoDatum> FunctionReturn for T {
    fn declared_as(ty: Type) -> bool {
        <T as IntoDatum>::returns_as(ty)
    }

    fn result_name() -> &'static str {
        <T as TypeBinding>::type_name()
    }

    fn deliver(fcinfo: &mut FunctionCallInfo, call: impl FnOnce() -> Result<Self>) -> Result<Datum> {
        let result = call()?.into_nullable_datum()?;
        fcinfo.isnull = result.is_null();
        Ok(result.get().unwrap_or_default())
    }
}

impl FunctionReturn for () {
    fn declared_as(ty: Type) -> bool {
        ty == Type::VOID
    }

    fn result_name() -> &'static str {
        "()"
    }

    fn deliver(fcinfo: &mut FunctionCallInfo, call: impl FnOnce() -> Result<Self>) -> Result<Datum> {
        call()?;
        fcinfo.isnull = false;
        Ok(Datum::default())
    }
}

impl<T, E> FunctionReturn for std::result::Result<T, E>
where
    T: FunctionReturn,
    E: Into<Error>,
{
    const RETURNS_SET: bool = T::RETURNS_SET;

    fn declared_as(ty: Type) -> bool {
        T::declared_as(ty)
    }

    fn result_name() -> &'static str {
        T::result_name()
    }

    fn deliver(fcinfo: &mut FunctionCallInfo, call: impl FnOnce() -> Result<Self>) -> Result<Datum> {
        T::deliver(fcinfo, || call()?.map_err(Into::into))
    }
}

/// Argument and result types of one call.
struct Signature {
    arg_types: Vec<Type>,
    return_type: Type,
}

impl Signature {
    /// Prefers the call site's types; falls back to the catalog entry.
    /// Types neither knows stay [`Type::INVALID`].
    fn resolve(fcinfo: &FunctionCallInfo) -> Self {
        let flinfo = &fcinfo.flinfo;
        let mut proc = None;
        let mut declared = || {
            proc.get_or_insert_with(|| catalog::search_proc(flinfo.fn_oid))
                .clone()
        };

        let arg_types = (0..fcinfo.nargs())
            .map(|i| match Type::from_oid(fmgr::get_fn_expr_argtype(flinfo, i)) {
                ty if ty.is_valid() => ty,
                _ => declared()
                    .and_then(|p| p.arg_types.get(i).copied())
                    .map_or(Type::INVALID, Type::from_oid),
            })
            .collect();

        let return_type = match Type::from_oid(fmgr::get_fn_expr_rettype(flinfo)) {
            ty if ty.is_valid() => ty,
            _ => declared().map_or(Type::INVALID, |p| Type::from_oid(p.ret_type)),
        };

        Signature {
            arg_types,
            return_type,
        }
    }
}

/// Binds a callable to the host calling convention.
pub struct FunctionAdapter<F, Args> {
    func: F,
    _args: PhantomData<fn(Args)>,
}

impl<F, Args> FunctionAdapter<F, Args>
where
    F: Callable<Args>,
{
    pub fn new(func: F) -> Self {
        FunctionAdapter {
            func,
            _args: PhantomData,
        }
    }

    /// Handles one host call and returns the raw result word.
    ///
    /// Every failure leaves through the host's error channel.
    pub fn call(&self, fcinfo: &mut FunctionCallInfo) -> pgext_host::Datum {
        trace!("calling function {}", fcinfo.flinfo.fn_oid);

        let nargs = fcinfo.nargs();
        if nargs != F::ARITY {
            report::raise(Error::Arity {
                expected: F::ARITY,
                got: nargs,
            });
        }

        let signature = Signature::resolve(fcinfo);
        for (index, &ty) in signature.arg_types.iter().enumerate() {
            if ty.is_valid() && !F::accepts_arg(index, ty) {
                report::raise(Error::TypeMismatch {
                    index,
                    actual: ty.display_name(),
                    expected: F::arg_type_name(index),
                });
            }
        }

        if fcinfo.flinfo.fn_retset && !F::Output::RETURNS_SET {
            report::raise(Error::SetExpected {
                found: F::Output::result_name(),
            });
        }

        let return_type = signature.return_type;
        if return_type.is_valid() && !F::Output::declared_as(return_type) {
            report::raise(Error::ReturnTypeMismatch {
                actual: return_type.display_name(),
                expected: F::Output::result_name(),
            });
        }

        let _frame = CallFrame::push(CallInfo {
            fn_oid: fcinfo.flinfo.fn_oid,
            nargs,
            arg_types: signature.arg_types.clone(),
            return_type,
            collation: fcinfo.fncollation,
            atomic: fcinfo.context.map(|c| c.atomic),
        });

        let args: Vec<NullableDatum> = fcinfo.args.iter().copied().map(NullableDatum::from_raw).collect();
        let datum = exception_guard(|| {
            let args = F::convert(&args, &signature.arg_types, BorrowedArena::current())?;
            F::Output::deliver(fcinfo, || Ok(self.func.invoke(args)))
        });
        datum.word()
    }
}

/// Version record returned by a function's info symbol.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FinfoRecord {
    pub api_version: i32,
}

/// Info record for the version-1 calling convention.
pub static FINFO_V1: FinfoRecord = FinfoRecord { api_version: 1 };

/// Exports a callable as a host function named `$name`.
///
/// Expands to the `extern "C-unwind"` entry point and its `pg_finfo_`
/// info symbol.
///
/// ```
/// use pgext::pg_function;
///
/// pg_function!(add_one, |x: i32| x + 1);
/// ```
#[macro_export]
macro_rules! pg_function {
    ($name:ident, $func:expr) => {
        $crate::__private::paste::paste! {
            #[unsafe(no_mangle)]
            pub extern "C" fn [<pg_finfo_ $name>]() -> &'static $crate::runtime::function::FinfoRecord {
                &$crate::runtime::function::FINFO_V1
            }
        }

        #[unsafe(no_mangle)]
        pub unsafe extern "C-unwind" fn $name(
            fcinfo: *mut $crate::host::FunctionCallInfo,
        ) -> $crate::host::Datum {
            // SAFETY: the host passes a call record it owns exclusively for
            // the duration of the call.
            let fcinfo = unsafe { &mut *fcinfo };
            $crate::runtime::function::FunctionAdapter::new($func).call(fcinfo)
        }
    };
}
