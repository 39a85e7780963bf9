//! Database roles.

use std::fmt;

use pgext_host::{INVALID_OID, Oid, catalog};

use super::datum::Datum;
use super::guard::ffi_guard;
use super::memory::BorrowedArena;
use super::types::{FromDatum, IntoDatum, Type, TypeBinding};
use crate::Result;

/// A role, identified by its oid.
///
/// Reading a `Role` from a datum does not check that it exists; lookups by
/// name or oid do.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Role(Oid);

impl Role {
    /// The role named `name`. Fails if there is none.
    pub fn from_name(name: &str) -> Result<Self> {
        Ok(Role(ffi_guard(|| catalog::get_role_oid(name, false))?))
    }

    /// Like [`Role::from_name`], but a missing role is `None`.
    pub fn find(name: &str) -> Result<Option<Self>> {
        let oid = ffi_guard(|| catalog::get_role_oid(name, true))?;
        Ok((oid != INVALID_OID).then_some(Role(oid)))
    }

    /// The role with `oid`. Fails if there is none.
    pub fn from_oid(oid: Oid) -> Result<Self> {
        ffi_guard(|| catalog::get_user_name_from_id(oid))?;
        Ok(Role(oid))
    }

    /// The role the session runs as.
    pub fn current() -> Self {
        Role(catalog::get_user_id())
    }

    pub const fn oid(self) -> Oid {
        self.0
    }

    pub fn name(self) -> Result<String> {
        Ok(ffi_guard(|| catalog::get_user_name_from_id(self.0))?)
    }

    /// Whether this role is `other` or belongs to it. Superusers belong to
    /// every role.
    pub fn is_member_of(self, other: Role) -> bool {
        catalog::is_member_of_role(self.0, other.0)
    }

    pub fn is_superuser(self) -> bool {
        catalog::superuser_arg(self.0)
    }
}

impl fmt::Debug for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match catalog::get_role_name(self.0) {
            Some(name) => write!(f, "Role({}: {name})", self.0),
            None => write!(f, "Role({})", self.0),
        }
    }
}

impl TypeBinding for Role {
    fn type_for() -> Type {
        Type::REGROLE
    }

    fn is(ty: Type) -> bool {
        ty == Type::REGROLE || ty == Type::OID
    }

    fn type_name() -> &'static str {
        "Role"
    }
}

impl FromDatum for Role {
    fn from_datum(datum: Datum, _: Type, _: BorrowedArena) -> Result<Self> {
        Ok(Role(datum.word() as Oid))
    }
}

impl IntoDatum for Role {
    fn into_datum(self) -> Result<Datum> {
        Ok(Datum::from_word(self.0 as usize))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Error;

    #[test]
    fn test_missing_role_message() {
        let err = Role::from_name("this_role_does_not_exist").unwrap_err();
        assert!(matches!(err, Error::Host(_)));
        assert_eq!(
            err.to_string(),
            "role \"this_role_does_not_exist\" does not exist"
        );
        assert_eq!(Role::find("this_role_does_not_exist").unwrap(), None);
    }

    #[test]
    fn test_bootstrap_superuser() {
        let su = Role::from_oid(catalog::BOOTSTRAP_SUPERUSERID).unwrap();
        assert_eq!(su.name().unwrap(), "postgres");
        assert!(su.is_superuser());
        assert_eq!(Role::from_name("postgres").unwrap(), su);
    }

    #[test]
    fn test_membership() {
        let staff = Role(catalog::create_role("role_test_staff"));
        let alice = Role(catalog::create_role("role_test_alice"));
        assert!(!alice.is_member_of(staff));

        catalog::grant_role(staff.oid(), alice.oid());
        assert!(alice.is_member_of(staff));
        assert!(alice.is_member_of(alice));
        assert!(!staff.is_member_of(alice));
    }

    #[test]
    fn test_unknown_oid() {
        assert!(Role::from_oid(999_999).is_err());
    }
}
