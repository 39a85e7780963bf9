// Integration tests for the in-process host
//
// These exercise the host pieces together: errors raised by the memory
// layer, catch points nesting, and calls going through fmgr.

mod common;

use common::catch_error;
use pgext_host::catalog;
use pgext_host::elog;
use pgext_host::fmgr::{self, FunctionCallInfo, NullableDatum};
use pgext_host::interrupt;
use pgext_host::memory::*;
use pgext_host::varlena;

// ============================================================================
// Memory errors
// ============================================================================

mod memory_error_tests {
    use super::*;

    #[test]
    fn test_oversized_request_raises() {
        let message = catch_error(|| {
            memory_context_alloc(top_memory_context(), MAX_ALLOC_SIZE + 1);
        });
        assert_eq!(
            message.as_deref(),
            Some("invalid memory alloc request size 1073741824")
        );
    }

    #[test]
    fn test_limit_raises_out_of_memory() {
        let ctx = alloc_set_context_create(top_memory_context(), "limited");
        set_memory_limit(Some(1024));

        let message = catch_error(|| {
            memory_context_alloc(ctx, 4096);
        });
        set_memory_limit(None);

        assert_eq!(message.as_deref(), Some("out of memory"));
        memory_context_delete(ctx);
    }

    #[test]
    fn test_error_context_ignores_limit() {
        set_memory_limit(Some(16));
        let ctx = alloc_set_context_create(error_memory_context(), "copy");
        let message = catch_error(|| {
            memory_context_alloc(ctx, 4096);
        });
        set_memory_limit(None);

        assert_eq!(message, None);
        memory_context_delete(ctx);
    }

    #[test]
    fn test_stale_handle_raises() {
        let ctx = alloc_set_context_create(top_memory_context(), "gone");
        memory_context_delete(ctx);

        assert!(catch_error(|| memory_context_reset(ctx)).is_some());
    }

    #[test]
    fn test_top_context_is_protected() {
        let message = catch_error(|| memory_context_delete(top_memory_context()));
        assert_eq!(message.as_deref(), Some("cannot delete TopMemoryContext"));
    }

    #[test]
    fn test_double_pfree_raises() {
        let ptr = palloc(8);
        pfree(ptr.as_ptr());
        assert!(catch_error(|| pfree(ptr.as_ptr())).is_some());
    }
}

// ============================================================================
// Catch points
// ============================================================================

mod jump_tests {
    use super::*;

    #[test]
    fn test_nested_catch_points() {
        let before = elog::jump_state();

        let outer = catch_error(|| {
            let inner = catch_error(|| {
                catalog::get_role_oid("missing", false);
            });
            assert_eq!(inner.as_deref(), Some("role \"missing\" does not exist"));
        });

        assert_eq!(outer, None);
        assert_eq!(elog::jump_state(), before);
    }

    #[test]
    fn test_cancel_is_an_error() {
        interrupt::interrupt_handle().cancel();
        let message = catch_error(interrupt::check_for_interrupts);
        assert_eq!(
            message.as_deref(),
            Some("canceling statement due to user request")
        );
        assert!(!interrupt::interrupt_pending());
    }
}

// ============================================================================
// fmgr
// ============================================================================

mod fmgr_tests {
    use super::*;

    #[test]
    fn test_call_builtin_by_name() {
        let oid = catalog::lookup_func_name("upper", None);
        let arg = NullableDatum::new(varlena::cstring_to_text("abc"));
        let mut fcinfo = FunctionCallInfo::new(fmgr::fmgr_info(oid), vec![arg]);

        let result = fmgr::function_call_invoke(&mut fcinfo);
        assert!(!fcinfo.isnull);
        assert_eq!(unsafe { varlena::text_to_bytes(result) }, b"ABC");
    }

    #[test]
    fn test_overflow_is_reported() {
        let oid = catalog::lookup_func_name("int4pl", None);
        let args = vec![
            NullableDatum::new(i32::MAX as usize),
            NullableDatum::new(1),
        ];
        let mut fcinfo = FunctionCallInfo::new(fmgr::fmgr_info(oid), args);

        let message = catch_error(|| {
            fmgr::function_call_invoke(&mut fcinfo);
        });
        assert_eq!(message.as_deref(), Some("integer out of range"));
    }

    #[test]
    fn test_unknown_function() {
        let message = catch_error(|| {
            catalog::lookup_func_name("no_such_fn", Some(&[23]));
        });
        assert_eq!(
            message.as_deref(),
            Some("function no_such_fn(integer) does not exist")
        );
    }
}
