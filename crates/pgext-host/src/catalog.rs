//! System catalog: functions, types and roles.
//!
//! Each thread owns one catalog, seeded with the builtin types, the bootstrap
//! superuser and the builtin functions from [`crate::builtins`]. Objects
//! created at runtime get oids from [`FIRST_NORMAL_OBJECT_ID`] upward.

use std::cell::RefCell;

use fxhash::{FxHashMap, FxHashSet};

use crate::elog::{self, SqlState};
use crate::fmgr::PgFunction;
use crate::pg_type::*;
use crate::{FIRST_NORMAL_OBJECT_ID, INVALID_OID, Oid, builtins};

/// Oid of the bootstrap superuser.
pub const BOOTSTRAP_SUPERUSERID: Oid = 10;

/// A function as recorded in the catalog.
#[derive(Debug, Clone, Default)]
pub struct Proc {
    pub oid: Oid,
    pub name: String,
    pub arg_types: Vec<Oid>,
    pub ret_type: Oid,
    pub retset: bool,
    pub strict: bool,
    pub func: Option<PgFunction>,
}

/// Storage properties of a type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TypeEntry {
    pub oid: Oid,
    pub name: String,
    /// Fixed length, -1 for varlena, -2 for C strings.
    pub len: i16,
    pub byval: bool,
}

#[derive(Debug, Clone)]
struct RoleEntry {
    name: String,
    superuser: bool,
    member_of: FxHashSet<Oid>,
}

#[derive(Clone)]
struct Catalog {
    procs: FxHashMap<Oid, Proc>,
    types: FxHashMap<Oid, TypeEntry>,
    type_names: FxHashMap<String, Oid>,
    roles: FxHashMap<Oid, RoleEntry>,
    role_names: FxHashMap<String, Oid>,
    current_user: Oid,
    next_oid: Oid,
}

impl Catalog {
    fn bootstrap() -> Self {
        let mut catalog = Catalog {
            procs: FxHashMap::default(),
            types: FxHashMap::default(),
            type_names: FxHashMap::default(),
            roles: FxHashMap::default(),
            role_names: FxHashMap::default(),
            current_user: BOOTSTRAP_SUPERUSERID,
            next_oid: FIRST_NORMAL_OBJECT_ID,
        };

        for (oid, name, len, byval) in [
            (BOOLOID, "boolean", 1, true),
            (BYTEAOID, "bytea", -1, false),
            (CHAROID, "\"char\"", 1, true),
            (NAMEOID, "name", 64, false),
            (INT8OID, "bigint", 8, true),
            (INT2OID, "smallint", 2, true),
            (INT4OID, "integer", 4, true),
            (TEXTOID, "text", -1, false),
            (OIDOID, "oid", 4, true),
            (FLOAT4OID, "real", 4, true),
            (FLOAT8OID, "double precision", 8, true),
            (UNKNOWNOID, "unknown", -2, false),
            (VARCHAROID, "character varying", -1, false),
            (RECORDOID, "record", -1, false),
            (CSTRINGOID, "cstring", -2, false),
            (ANYOID, "\"any\"", 4, true),
            (VOIDOID, "void", 4, true),
            (INTERNALOID, "internal", 8, true),
            (REGROLEOID, "regrole", 4, true),
        ] {
            catalog.add_type(oid, name, len, byval);
        }

        // Short names accepted on input.
        for (alias, oid) in [
            ("bool", BOOLOID),
            ("int2", INT2OID),
            ("int4", INT4OID),
            ("int", INT4OID),
            ("int8", INT8OID),
            ("float4", FLOAT4OID),
            ("float8", FLOAT8OID),
            ("varchar", VARCHAROID),
        ] {
            catalog.type_names.insert(alias.to_string(), oid);
        }

        catalog.roles.insert(
            BOOTSTRAP_SUPERUSERID,
            RoleEntry {
                name: "postgres".to_string(),
                superuser: true,
                member_of: FxHashSet::default(),
            },
        );
        catalog
            .role_names
            .insert("postgres".to_string(), BOOTSTRAP_SUPERUSERID);

        for proc in builtins::procs() {
            catalog.procs.insert(proc.oid, proc);
        }

        catalog
    }

    fn add_type(&mut self, oid: Oid, name: &str, len: i16, byval: bool) {
        self.types.insert(
            oid,
            TypeEntry {
                oid,
                name: name.to_string(),
                len,
                byval,
            },
        );
        self.type_names.insert(name.to_string(), oid);
    }

    fn new_oid(&mut self) -> Oid {
        let oid = self.next_oid;
        self.next_oid += 1;
        oid
    }

    fn is_member(&self, member: Oid, role: Oid, seen: &mut FxHashSet<Oid>) -> bool {
        if member == role {
            return true;
        }
        if !seen.insert(member) {
            return false;
        }

        self.roles.get(&member).is_some_and(|entry| {
            entry
                .member_of
                .iter()
                .any(|&parent| self.is_member(parent, role, seen))
        })
    }
}

thread_local! {
    static CATALOG: RefCell<Catalog> = RefCell::new(Catalog::bootstrap());
}

fn with_catalog<R>(f: impl FnOnce(&mut Catalog) -> R) -> R {
    CATALOG.with(|catalog| f(&mut catalog.borrow_mut()))
}

/// Catalog contents saved when a transaction level starts.
pub struct CatalogSnapshot(Catalog);

impl std::fmt::Debug for CatalogSnapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CatalogSnapshot")
            .field("procs", &self.0.procs.len())
            .field("roles", &self.0.roles.len())
            .finish()
    }
}

/// Saves the catalog contents.
pub fn snapshot() -> CatalogSnapshot {
    with_catalog(|c| CatalogSnapshot(c.clone()))
}

/// Puts back the contents saved by [`snapshot`]. Oids handed out since are
/// not reused.
pub fn restore(snapshot: CatalogSnapshot) {
    with_catalog(|c| {
        let next_oid = c.next_oid;
        *c = snapshot.0;
        c.next_oid = next_oid;
    });
}

/// Adds a function. `proc.oid` is ignored; the assigned oid is returned.
pub fn create_function(mut proc: Proc) -> Oid {
    with_catalog(|c| {
        let oid = c.new_oid();
        proc.oid = oid;
        c.procs.insert(oid, proc);
        oid
    })
}

/// Looks a function up by oid.
pub fn search_proc(oid: Oid) -> Option<Proc> {
    with_catalog(|c| c.procs.get(&oid).cloned())
}

/// Resolves a function by name, and by argument types when given.
///
/// Raises if no function matches, or if several match and no argument types
/// were given to disambiguate.
#[track_caller]
pub fn lookup_func_name(name: &str, arg_types: Option<&[Oid]>) -> Oid {
    let matches: Vec<Oid> = with_catalog(|c| {
        let mut found: Vec<Oid> = c
            .procs
            .values()
            .filter(|p| p.name == name)
            .filter(|p| arg_types.is_none_or(|types| p.arg_types == types))
            .map(|p| p.oid)
            .collect();
        found.sort_unstable();
        found
    });

    match matches.as_slice() {
        [oid] => *oid,
        [] => {
            let signature = arg_types.map_or_else(String::new, |types| {
                types
                    .iter()
                    .map(|&t| format_type_extended(t, true))
                    .collect::<Vec<_>>()
                    .join(", ")
            });
            elog::error(
                SqlState::UNDEFINED_FUNCTION,
                format!("function {name}({signature}) does not exist"),
            )
        }
        _ => elog::error(
            SqlState::AMBIGUOUS_FUNCTION,
            format!("function name \"{name}\" is not unique"),
        ),
    }
}

/// Registers a type. Returns its oid.
pub fn create_type(name: &str, len: i16, byval: bool) -> Oid {
    with_catalog(|c| {
        let oid = c.new_oid();
        c.add_type(oid, name, len, byval);
        oid
    })
}

/// Storage properties of a type.
pub fn search_type(oid: Oid) -> Option<TypeEntry> {
    with_catalog(|c| c.types.get(&oid).cloned())
}

/// Oid of the type named `name`, or [`INVALID_OID`].
pub fn typename_get_typid(name: &str) -> Oid {
    with_catalog(|c| c.type_names.get(name).copied().unwrap_or(INVALID_OID))
}

/// Display name of a type. Raises for an unknown oid.
#[track_caller]
pub fn format_type_be(oid: Oid) -> String {
    match with_catalog(|c| c.types.get(&oid).map(|t| t.name.clone())) {
        Some(name) => name,
        None => elog::error(
            SqlState::INTERNAL_ERROR,
            format!("cache lookup failed for type {oid}"),
        ),
    }
}

/// Display name of a type. With `allow_invalid`, the invalid oid prints as
/// `-` and unknown oids as `???` instead of raising.
#[track_caller]
pub fn format_type_extended(oid: Oid, allow_invalid: bool) -> String {
    if !allow_invalid {
        return format_type_be(oid);
    }
    if oid == INVALID_OID {
        return "-".to_string();
    }
    with_catalog(|c| c.types.get(&oid).map(|t| t.name.clone()))
        .unwrap_or_else(|| "???".to_string())
}

/// Adds a role. Raises if the name is taken.
#[track_caller]
pub fn create_role(name: &str) -> Oid {
    let created = with_catalog(|c| {
        if c.role_names.contains_key(name) {
            return None;
        }
        let oid = c.new_oid();
        c.roles.insert(
            oid,
            RoleEntry {
                name: name.to_string(),
                superuser: false,
                member_of: FxHashSet::default(),
            },
        );
        c.role_names.insert(name.to_string(), oid);
        Some(oid)
    });

    created.unwrap_or_else(|| {
        elog::error(
            SqlState::INVALID_PARAMETER_VALUE,
            format!("role \"{name}\" already exists"),
        )
    })
}

/// Oid of the role named `name`. Raises when it does not exist, unless
/// `missing_ok`, in which case [`INVALID_OID`] is returned.
#[track_caller]
pub fn get_role_oid(name: &str, missing_ok: bool) -> Oid {
    let oid = with_catalog(|c| c.role_names.get(name).copied());
    match oid {
        Some(oid) => oid,
        None if missing_ok => INVALID_OID,
        None => elog::error(
            SqlState::UNDEFINED_OBJECT,
            format!("role \"{name}\" does not exist"),
        ),
    }
}

/// Name of the role with `oid`, if any.
pub fn get_role_name(oid: Oid) -> Option<String> {
    with_catalog(|c| c.roles.get(&oid).map(|r| r.name.clone()))
}

/// Name of the role with `oid`. Raises for an unknown oid.
#[track_caller]
pub fn get_user_name_from_id(oid: Oid) -> String {
    get_role_name(oid).unwrap_or_else(|| {
        elog::error(
            SqlState::UNDEFINED_OBJECT,
            format!("invalid role OID: {oid}"),
        )
    })
}

/// Whether the role with `oid` is a superuser.
pub fn superuser_arg(oid: Oid) -> bool {
    with_catalog(|c| c.roles.get(&oid).is_some_and(|r| r.superuser))
}

/// Makes `member` a direct member of `role`. Raises for unknown roles.
#[track_caller]
pub fn grant_role(role: Oid, member: Oid) {
    let granted = with_catalog(|c| {
        if !c.roles.contains_key(&role) {
            return Err(role);
        }
        match c.roles.get_mut(&member) {
            Some(entry) => {
                entry.member_of.insert(role);
                Ok(())
            }
            None => Err(member),
        }
    });

    if let Err(oid) = granted {
        elog::error(
            SqlState::UNDEFINED_OBJECT,
            format!("invalid role OID: {oid}"),
        );
    }
}

/// Whether `member` is `role` or belongs to it, directly or transitively.
/// Superusers belong to every role.
pub fn is_member_of_role(member: Oid, role: Oid) -> bool {
    if superuser_arg(member) {
        return true;
    }
    with_catalog(|c| c.is_member(member, role, &mut FxHashSet::default()))
}

/// Role the session runs as.
pub fn get_user_id() -> Oid {
    with_catalog(|c| c.current_user)
}

/// Switches the session role.
pub fn set_user_id(oid: Oid) {
    with_catalog(|c| c.current_user = oid);
}
