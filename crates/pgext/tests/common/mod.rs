// Shared helpers for runtime integration tests

#![allow(dead_code)]

use pgext::host::catalog::{self, Proc};
use pgext::host::fmgr::{self, FnExpr, FunctionCallInfo, ReturnSetInfo, TupleDesc, Tuplestore};
use pgext::host::{Oid, PgFunction};
use pgext::{Arena, Datum, NullableDatum, ffi_guard};

/// Adds a scalar function to the catalog.
pub fn register(name: &str, func: PgFunction, arg_types: &[Oid], ret_type: Oid) -> Oid {
    catalog::create_function(Proc {
        name: name.to_string(),
        arg_types: arg_types.to_vec(),
        ret_type,
        func: Some(func),
        ..Proc::default()
    })
}

/// Adds a set-returning function to the catalog.
pub fn register_set(name: &str, func: PgFunction, arg_types: &[Oid], ret_type: Oid) -> Oid {
    catalog::create_function(Proc {
        name: name.to_string(),
        arg_types: arg_types.to_vec(),
        ret_type,
        retset: true,
        func: Some(func),
        ..Proc::default()
    })
}

fn invoke(mut fcinfo: FunctionCallInfo) -> Result<(NullableDatum, FunctionCallInfo), String> {
    let word = ffi_guard(|| fmgr::function_call_invoke(&mut fcinfo))
        .map_err(|e| e.message().to_owned())?;
    let result = if fcinfo.isnull {
        NullableDatum::null()
    } else {
        NullableDatum::nullable(Datum::from_word(word))
    };
    Ok((result, fcinfo))
}

fn raw(args: &[NullableDatum]) -> Vec<fmgr::NullableDatum> {
    args.iter().map(|a| a.into_raw()).collect()
}

/// Calls `oid` the way a caller without a call-site expression would.
/// Returns the result or the message of the ERROR it raised.
pub fn call(oid: Oid, args: &[NullableDatum]) -> Result<NullableDatum, String> {
    let fcinfo = FunctionCallInfo::new(fmgr::fmgr_info(oid), raw(args));
    invoke(fcinfo).map(|(result, _)| result)
}

/// Calls `oid` with concrete call-site types.
pub fn call_typed(
    oid: Oid,
    arg_types: &[Oid],
    return_type: Oid,
    args: &[NullableDatum],
) -> Result<NullableDatum, String> {
    let mut flinfo = fmgr::fmgr_info(oid);
    flinfo.fn_expr = Some(FnExpr {
        arg_types: arg_types.to_vec(),
        return_type,
    });
    invoke(FunctionCallInfo::new(flinfo, raw(args))).map(|(result, _)| result)
}

/// Calls a set-returning function, materializing into `per_query`.
pub fn call_set(
    oid: Oid,
    args: &[NullableDatum],
    expected: Option<TupleDesc>,
    per_query: &impl Arena,
) -> Result<Tuplestore, String> {
    let fcinfo = FunctionCallInfo::new(fmgr::fmgr_info(oid), raw(args))
        .with_result_info(ReturnSetInfo::new(per_query.context(), expected));
    let (_, fcinfo) = invoke(fcinfo)?;
    Ok(fcinfo
        .resultinfo
        .and_then(|rsinfo| rsinfo.set_result)
        .unwrap_or_default())
}

/// First column of every row, as integers.
pub fn first_column(store: &Tuplestore) -> Vec<i64> {
    store.rows().iter().map(|row| row[0].value as i64).collect()
}

pub fn int(value: i64) -> NullableDatum {
    NullableDatum::nullable(Datum::from_i64(value))
}
