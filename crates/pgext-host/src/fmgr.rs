//! Function manager call records.
//!
//! A native function receives a [`FunctionCallInfo`]: its arguments as
//! [`NullableDatum`]s, a pointer to the [`FmgrInfo`] describing the function,
//! an optional [`CallContext`] node and, for set-returning calls, a
//! [`ReturnSetInfo`] through which the result set is handed back.

use crate::catalog;
use crate::elog::{self, SqlState};
use crate::memory::MemoryContext;
use crate::{Datum, INVALID_OID, Oid};

/// Native entry point of a function.
pub type PgFunction =
    unsafe extern "C-unwind" fn(fcinfo: *mut FunctionCallInfo) -> Datum;

/// A datum with its null flag.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct NullableDatum {
    pub value: Datum,
    pub isnull: bool,
}

impl NullableDatum {
    pub const NULL: NullableDatum = NullableDatum {
        value: 0,
        isnull: true,
    };

    pub const fn new(value: Datum) -> Self {
        NullableDatum {
            value,
            isnull: false,
        }
    }
}

/// Concrete types of one call site.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct FnExpr {
    pub arg_types: Vec<Oid>,
    pub return_type: Oid,
}

/// Lookup information for a function.
#[derive(Debug, Clone, Default)]
pub struct FmgrInfo {
    pub fn_addr: Option<PgFunction>,
    pub fn_oid: Oid,
    pub fn_nargs: i16,
    pub fn_strict: bool,
    pub fn_retset: bool,
    /// Expression of the call site, when the caller has one.
    pub fn_expr: Option<FnExpr>,
}

/// Builds the lookup information of a catalog function.
#[track_caller]
pub fn fmgr_info(oid: Oid) -> FmgrInfo {
    let Some(proc) = catalog::search_proc(oid) else {
        elog::error(
            SqlState::UNDEFINED_FUNCTION,
            format!("cache lookup failed for function {oid}"),
        );
    };

    FmgrInfo {
        fn_addr: proc.func,
        fn_oid: oid,
        fn_nargs: i16::try_from(proc.arg_types.len()).unwrap_or(i16::MAX),
        fn_strict: proc.strict,
        fn_retset: proc.retset,
        fn_expr: None,
    }
}

/// Concrete type of argument `argnum` at the call site, or
/// [`INVALID_OID`] when the caller supplied no expression.
pub fn get_fn_expr_argtype(flinfo: &FmgrInfo, argnum: usize) -> Oid {
    flinfo
        .fn_expr
        .as_ref()
        .and_then(|expr| expr.arg_types.get(argnum).copied())
        .unwrap_or(INVALID_OID)
}

/// Concrete result type at the call site, or [`INVALID_OID`].
pub fn get_fn_expr_rettype(flinfo: &FmgrInfo) -> Oid {
    flinfo
        .fn_expr
        .as_ref()
        .map_or(INVALID_OID, |expr| expr.return_type)
}

/// Context node passed to procedures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CallContext {
    /// The procedure runs in an atomic context and may not commit.
    pub atomic: bool,
}

/// Row shape: the name and type of every attribute.
///
/// A descriptor is anonymous until [`bless_tuple_desc`] registers it and
/// assigns the typmod that heap tuples of this shape carry.
///
/// [`bless_tuple_desc`]: crate::heaptuple::bless_tuple_desc
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TupleDesc {
    attrs: Vec<Oid>,
    names: Vec<String>,
    typmod: i32,
}

impl TupleDesc {
    /// Attributes named `f1`, `f2` and so on, as for a row constructor.
    pub fn new(attrs: Vec<Oid>) -> Self {
        let names = (1..=attrs.len()).map(|i| format!("f{i}")).collect();
        TupleDesc {
            attrs,
            names,
            typmod: -1,
        }
    }

    pub fn with_names<S: Into<String>>(attrs: impl IntoIterator<Item = (S, Oid)>) -> Self {
        let (names, attrs) = attrs
            .into_iter()
            .map(|(name, oid)| (name.into(), oid))
            .unzip();
        TupleDesc {
            attrs,
            names,
            typmod: -1,
        }
    }

    pub fn natts(&self) -> usize {
        self.attrs.len()
    }

    pub fn attr_type(&self, index: usize) -> Option<Oid> {
        self.attrs.get(index).copied()
    }

    pub fn attr_types(&self) -> &[Oid] {
        &self.attrs
    }

    pub fn attr_name(&self, index: usize) -> Option<&str> {
        self.names.get(index).map(String::as_str)
    }

    /// Zero-based position of the attribute called `name`.
    pub fn attr_index(&self, name: &str) -> Option<usize> {
        self.names.iter().position(|n| n == name)
    }

    /// Registered record typmod, or -1 while the descriptor is anonymous.
    pub fn typmod(&self) -> i32 {
        self.typmod
    }

    pub fn is_blessed(&self) -> bool {
        self.typmod >= 0
    }

    pub(crate) fn set_typmod(&mut self, typmod: i32) {
        self.typmod = typmod;
    }

    /// Same attribute names and types, whatever the typmod.
    pub fn same_row_type(&self, other: &TupleDesc) -> bool {
        self.attrs == other.attrs && self.names == other.names
    }
}

impl Default for TupleDesc {
    fn default() -> Self {
        TupleDesc::new(Vec::new())
    }
}

/// Materialized result set.
#[derive(Debug, Clone, Default)]
pub struct Tuplestore {
    rows: Vec<Vec<NullableDatum>>,
}

impl Tuplestore {
    pub fn begin_heap() -> Self {
        Tuplestore::default()
    }

    /// Appends one row. `values` and `isnull` must have the same length.
    #[track_caller]
    pub fn put_values(&mut self, values: &[Datum], isnull: &[bool]) {
        if values.len() != isnull.len() {
            elog::error(
                SqlState::INTERNAL_ERROR,
                format!(
                    "tuple has {} values but {} null flags",
                    values.len(),
                    isnull.len()
                ),
            );
        }

        self.rows.push(
            values
                .iter()
                .zip(isnull)
                .map(|(&value, &isnull)| NullableDatum { value, isnull })
                .collect(),
        );
    }

    pub fn rows(&self) -> &[Vec<NullableDatum>] {
        &self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

/// Values returned one per call.
pub const SFRM_VALUE_PER_CALL: u32 = 0x01;
/// Result set handed back as a tuplestore.
pub const SFRM_MATERIALIZE: u32 = 0x02;
pub const SFRM_MATERIALIZE_RANDOM: u32 = 0x04;
pub const SFRM_MATERIALIZE_PREFERRED: u32 = 0x08;

/// Set-returning call information supplied by the caller.
#[derive(Debug, Clone)]
pub struct ReturnSetInfo {
    /// Row shape the caller expects, if it knows one.
    pub expected_desc: Option<TupleDesc>,
    /// Bitmask of `SFRM_*` modes the caller accepts.
    pub allowed_modes: u32,
    /// Mode the function chose.
    pub return_mode: u32,
    /// Materialized result.
    pub set_result: Option<Tuplestore>,
    /// Shape of the materialized result.
    pub set_desc: Option<TupleDesc>,
    /// Context that outlives the call; result values go here.
    pub per_query_memory: MemoryContext,
}

impl ReturnSetInfo {
    pub fn new(
        per_query_memory: MemoryContext,
        expected_desc: Option<TupleDesc>,
    ) -> Self {
        ReturnSetInfo {
            expected_desc,
            allowed_modes: SFRM_VALUE_PER_CALL | SFRM_MATERIALIZE,
            return_mode: SFRM_VALUE_PER_CALL,
            set_result: None,
            set_desc: None,
            per_query_memory,
        }
    }
}

/// Arguments and result slots of one call.
#[derive(Debug)]
pub struct FunctionCallInfo {
    pub flinfo: FmgrInfo,
    pub context: Option<CallContext>,
    pub resultinfo: Option<ReturnSetInfo>,
    pub fncollation: Oid,
    /// Set by the callee when its result is null.
    pub isnull: bool,
    pub args: Vec<NullableDatum>,
}

impl FunctionCallInfo {
    pub fn new(flinfo: FmgrInfo, args: Vec<NullableDatum>) -> Self {
        FunctionCallInfo {
            flinfo,
            context: None,
            resultinfo: None,
            fncollation: INVALID_OID,
            isnull: false,
            args,
        }
    }

    pub fn with_context(mut self, context: CallContext) -> Self {
        self.context = Some(context);
        self
    }

    pub fn with_result_info(mut self, resultinfo: ReturnSetInfo) -> Self {
        self.resultinfo = Some(resultinfo);
        self
    }

    pub fn nargs(&self) -> usize {
        self.args.len()
    }
}

/// Calls the native entry point named by `fcinfo.flinfo`.
#[track_caller]
pub fn function_call_invoke(fcinfo: &mut FunctionCallInfo) -> Datum {
    let Some(func) = fcinfo.flinfo.fn_addr else {
        elog::error(
            SqlState::UNDEFINED_FUNCTION,
            format!(
                "function {} has no native entry point",
                fcinfo.flinfo.fn_oid
            ),
        );
    };

    fcinfo.isnull = false;
    // SAFETY: entry points only dereference the record they are given,
    // which is exclusively borrowed for the duration of the call.
    unsafe { func(fcinfo) }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pg_type::{INT4OID, TEXTOID};

    #[test]
    fn test_expr_argtype_falls_back_to_invalid() {
        let mut flinfo = FmgrInfo::default();
        assert_eq!(get_fn_expr_argtype(&flinfo, 0), INVALID_OID);

        flinfo.fn_expr = Some(FnExpr {
            arg_types: vec![TEXTOID],
            return_type: INT4OID,
        });
        assert_eq!(get_fn_expr_argtype(&flinfo, 0), TEXTOID);
        assert_eq!(get_fn_expr_argtype(&flinfo, 1), INVALID_OID);
        assert_eq!(get_fn_expr_rettype(&flinfo), INT4OID);
    }

    #[test]
    fn test_tuple_desc_names() {
        let anonymous = TupleDesc::new(vec![INT4OID, TEXTOID]);
        assert_eq!(anonymous.attr_name(1), Some("f2"));
        assert!(!anonymous.is_blessed());

        let named = TupleDesc::with_names([("id", INT4OID), ("label", TEXTOID)]);
        assert_eq!(named.attr_index("label"), Some(1));
        assert_eq!(named.attr_index("missing"), None);
        assert!(!named.same_row_type(&anonymous));
    }

    #[test]
    fn test_tuplestore_rows() {
        let mut store = Tuplestore::begin_heap();
        store.put_values(&[1, 2], &[false, true]);
        assert_eq!(store.len(), 1);
        assert_eq!(store.rows()[0][0], NullableDatum::new(1));
        assert!(store.rows()[0][1].isnull);
    }
}
