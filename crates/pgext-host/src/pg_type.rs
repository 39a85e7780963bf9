//! Builtin type oids.

use crate::Oid;

pub const BOOLOID: Oid = 16;
pub const BYTEAOID: Oid = 17;
pub const CHAROID: Oid = 18;
pub const NAMEOID: Oid = 19;
pub const INT8OID: Oid = 20;
pub const INT2OID: Oid = 21;
pub const INT4OID: Oid = 23;
pub const TEXTOID: Oid = 25;
pub const OIDOID: Oid = 26;
pub const FLOAT4OID: Oid = 700;
pub const FLOAT8OID: Oid = 701;
pub const UNKNOWNOID: Oid = 705;
pub const VARCHAROID: Oid = 1043;
pub const RECORDOID: Oid = 2249;
pub const CSTRINGOID: Oid = 2275;
pub const ANYOID: Oid = 2276;
pub const VOIDOID: Oid = 2278;
pub const INTERNALOID: Oid = 2281;
pub const REGROLEOID: Oid = 4096;
