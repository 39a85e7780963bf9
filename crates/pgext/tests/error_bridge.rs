// Integration tests for the error bridge
//
// Host errors raised below a bridge come back as captures; the host's
// exception stack and error-context chain look untouched afterwards.

use pgext::host::memory::{self, set_memory_limit};
use pgext::host::{ErrorLevel, SqlState, catalog, elog};
use pgext::runtime::raise;
use pgext::{Arena, Error, OwnedArena, Role, ffi_guard};

fn missing_role() -> u32 {
    catalog::get_role_oid("this_role_does_not_exist", false)
}

// ============================================================================
// Capturing
// ============================================================================

mod capture_tests {
    use super::*;

    #[test]
    fn test_missing_role() {
        let capture = ffi_guard(missing_role).unwrap_err();
        assert_eq!(capture.message(), "role \"this_role_does_not_exist\" does not exist");
        assert_eq!(capture.sqlstate(), SqlState::UNDEFINED_OBJECT);
        assert_eq!(capture.level(), ErrorLevel::Error);

        let err = Role::from_name("this_role_does_not_exist").unwrap_err();
        assert_eq!(err.to_string(), capture.message());
    }

    #[test]
    fn test_success_returns_value() {
        let oid = ffi_guard(|| catalog::get_role_oid("postgres", false)).unwrap();
        assert_eq!(oid, catalog::BOOTSTRAP_SUPERUSERID);
    }

    #[test]
    fn test_state_restored_either_way() {
        let before = elog::jump_state();
        let context = memory::current_memory_context();

        assert!(ffi_guard(|| 1).is_ok());
        assert_eq!(elog::jump_state(), before);

        let scratch = OwnedArena::new("scratch").unwrap();
        let result = ffi_guard(|| {
            memory::memory_context_switch_to(scratch.context());
            missing_role()
        });
        assert!(result.is_err());
        assert_eq!(elog::jump_state(), before);
        assert_eq!(memory::current_memory_context(), context);
        assert!(!elog::has_pending_error());
    }

    #[test]
    fn test_detail_and_hint_survive() {
        let capture = ffi_guard(|| {
            elog::errstart(ErrorLevel::Error);
            elog::errcode(SqlState::INVALID_PARAMETER_VALUE);
            elog::errmsg("bad setting");
            elog::errdetail("value was 7");
            elog::errhint("use a power of two");
            elog::throw_building(file!(), line!())
        })
        .unwrap_err();

        assert_eq!(capture.detail(), Some("value was 7"));
        assert_eq!(capture.hint(), Some("use a power of two"));
        assert_eq!(capture.filename(), Some(file!()));
        let lineno = capture.lineno();

        let again = ffi_guard(|| capture.rethrow()).unwrap_err();
        assert_eq!(again.filename(), Some(file!()));
        assert_eq!(again.lineno(), lineno);
        assert_eq!(again.message(), "bad setting");
        assert_eq!(again.detail(), Some("value was 7"));
        assert_eq!(again.hint(), Some("use a power of two"));
        assert_eq!(again.sqlstate(), SqlState::INVALID_PARAMETER_VALUE);
    }

    #[test]
    fn test_warning_does_not_unwind() {
        elog::take_client_messages();
        let result = ffi_guard(|| {
            elog::report(ErrorLevel::Warning, SqlState::WARNING, "careful");
            3
        });
        assert_eq!(result.unwrap(), 3);
        assert_eq!(
            elog::take_client_messages(),
            vec![(ErrorLevel::Warning, "careful".to_string())]
        );
    }

    #[test]
    fn test_capture_owns_its_memory() {
        let capture = ffi_guard(missing_role).unwrap_err();
        let arena = capture.arena().borrowed();
        assert!(arena.is_valid());
        assert_eq!(
            arena.parent().map(|p| p.context()),
            Some(memory::error_memory_context())
        );

        drop(capture);
        assert!(!arena.is_valid());
    }
}

// ============================================================================
// Nesting
// ============================================================================

mod nesting_tests {
    use super::*;

    #[test]
    fn test_inner_bridge_catches_first() {
        let outer = ffi_guard(|| {
            let inner = ffi_guard(missing_role);
            assert!(inner.is_err());
            "recovered"
        });
        assert_eq!(outer.unwrap(), "recovered");
    }

    #[test]
    fn test_targets_unwind_in_order() {
        let outermost = elog::exception_stack();
        let captured = ffi_guard(|| {
            let outer = elog::exception_stack();
            assert_ne!(outer, outermost);

            let inner = ffi_guard(|| {
                assert_ne!(elog::exception_stack(), outer);
                elog::error(SqlState::INTERNAL_ERROR, "inner failure");
            })
            .unwrap_err();
            assert_eq!(elog::exception_stack(), outer);

            raise(Error::Host(inner));
        })
        .unwrap_err();

        assert_eq!(captured.message(), "inner failure");
        assert_eq!(elog::exception_stack(), outermost);
    }
}

// ============================================================================
// Memory errors
// ============================================================================

mod memory_error_tests {
    use super::*;

    #[test]
    fn test_out_of_memory_is_captured() {
        let arena = OwnedArena::new("limited").unwrap();
        set_memory_limit(Some(1024));
        let result = arena.alloc::<u8>(4096);
        set_memory_limit(None);

        let Err(Error::Host(capture)) = result else {
            panic!("expected a host error, got {result:?}");
        };
        assert_eq!(capture.message(), "out of memory");
        assert_eq!(capture.sqlstate(), SqlState::OUT_OF_MEMORY);
    }

    #[test]
    fn test_oversized_request_is_captured() {
        let arena = OwnedArena::new("big").unwrap();
        let err = arena.alloc::<u64>(usize::MAX).unwrap_err();
        assert!(err.to_string().starts_with("invalid memory alloc request size"));
    }
}
