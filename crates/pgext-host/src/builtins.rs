//! Builtin functions callable through fmgr.

use crate::catalog::Proc;
use crate::elog::{self, SqlState};
use crate::fmgr::FunctionCallInfo;
use crate::pg_type::{INT4OID, TEXTOID};
use crate::{Datum, varlena};

pub const F_INT4PL: u32 = 177;
pub const F_UPPER: u32 = 871;
pub const F_TEXTLEN: u32 = 1257;

pub(crate) fn procs() -> Vec<Proc> {
    vec![
        Proc {
            oid: F_INT4PL,
            name: "int4pl".to_string(),
            arg_types: vec![INT4OID, INT4OID],
            ret_type: INT4OID,
            retset: false,
            strict: true,
            func: Some(int4pl),
        },
        Proc {
            oid: F_UPPER,
            name: "upper".to_string(),
            arg_types: vec![TEXTOID],
            ret_type: TEXTOID,
            retset: false,
            strict: true,
            func: Some(upper),
        },
        Proc {
            oid: F_TEXTLEN,
            name: "textlen".to_string(),
            arg_types: vec![TEXTOID],
            ret_type: INT4OID,
            retset: false,
            strict: true,
            func: Some(textlen),
        },
    ]
}

fn arg(fcinfo: *mut FunctionCallInfo, index: usize) -> Datum {
    // SAFETY: fmgr hands entry points a valid, exclusive call record.
    let fcinfo = unsafe { &*fcinfo };
    match fcinfo.args.get(index) {
        Some(arg) => arg.value,
        None => elog::error(
            SqlState::INTERNAL_ERROR,
            format!("argument {index} missing"),
        ),
    }
}

fn int32_get_datum(value: i32) -> Datum {
    value as isize as Datum
}

unsafe extern "C-unwind" fn int4pl(fcinfo: *mut FunctionCallInfo) -> Datum {
    let a = arg(fcinfo, 0) as i32;
    let b = arg(fcinfo, 1) as i32;

    match a.checked_add(b) {
        Some(sum) => int32_get_datum(sum),
        None => elog::error(
            SqlState::NUMERIC_VALUE_OUT_OF_RANGE,
            "integer out of range",
        ),
    }
}

unsafe extern "C-unwind" fn textlen(fcinfo: *mut FunctionCallInfo) -> Datum {
    // SAFETY: the argument is declared text.
    let bytes = unsafe { varlena::text_to_bytes(arg(fcinfo, 0)) };
    let chars = String::from_utf8_lossy(bytes).chars().count();
    int32_get_datum(i32::try_from(chars).unwrap_or(i32::MAX))
}

unsafe extern "C-unwind" fn upper(fcinfo: *mut FunctionCallInfo) -> Datum {
    // SAFETY: the argument is declared text.
    let bytes = unsafe { varlena::text_to_bytes(arg(fcinfo, 0)) };
    varlena::cstring_to_text(&String::from_utf8_lossy(bytes).to_uppercase())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fmgr::{self, NullableDatum};

    fn call(oid: u32, args: Vec<NullableDatum>) -> Datum {
        let mut fcinfo = FunctionCallInfo::new(fmgr::fmgr_info(oid), args);
        fmgr::function_call_invoke(&mut fcinfo)
    }

    #[test]
    fn test_int4pl() {
        let result = call(
            F_INT4PL,
            vec![NullableDatum::new(int32_get_datum(-3)), NullableDatum::new(5)],
        );
        assert_eq!(result as i32, 2);
    }

    #[test]
    fn test_text_functions() {
        let text = NullableDatum::new(varlena::cstring_to_text("héllo"));
        assert_eq!(call(F_TEXTLEN, vec![text]) as i32, 5);

        let upper = call(F_UPPER, vec![text]);
        assert_eq!(unsafe { varlena::text_to_bytes(upper) }, "HÉLLO".as_bytes());
    }
}
