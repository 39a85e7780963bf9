// Integration tests for memory arenas and reset tracking

use std::cell::RefCell;
use std::ffi::c_void;

use pgext::host::memory;
use pgext::{Arena, BorrowedArena, CurrentArena, Error, OwnedArena, Text, TrackingArena};

thread_local! {
    static FIRED: RefCell<Vec<&'static str>> = const { RefCell::new(Vec::new()) };
}

unsafe extern "C" fn first(_: *mut c_void) {
    FIRED.with(|fired| fired.borrow_mut().push("first"));
}

unsafe extern "C" fn second(_: *mut c_void) {
    FIRED.with(|fired| fired.borrow_mut().push("second"));
}

fn fired() -> Vec<&'static str> {
    FIRED.with(|fired| fired.borrow_mut().drain(..).collect())
}

// ============================================================================
// Allocation
// ============================================================================

mod alloc_tests {
    use super::*;

    #[test]
    fn test_allocations_are_aligned_and_disjoint() {
        let arena = OwnedArena::new("layout").unwrap();
        let a = arena.alloc::<u64>(4).unwrap().as_ptr() as usize;
        let b = arena.alloc::<u8>(3).unwrap().as_ptr() as usize;
        let c = arena.alloc::<u128>(2).unwrap().as_ptr() as usize;

        assert_eq!(a % align_of::<u64>(), 0);
        assert_eq!(c % align_of::<u128>(), 0);

        let mut spans = [(a, a + 32), (b, b + 3), (c, c + 32)];
        spans.sort();
        assert!(spans.windows(2).all(|w| w[0].1 <= w[1].0));
    }

    #[test]
    fn test_pointer_lookup() {
        let arena = OwnedArena::new("owner").unwrap();
        let ptr = arena.alloc_value(7_i32).unwrap();

        let owner = BorrowedArena::for_pointer(ptr.as_ptr()).unwrap();
        assert_eq!(owner.context(), arena.context());
        assert!(matches!(
            BorrowedArena::for_pointer(std::ptr::null::<u8>()),
            Err(Error::InvalidPointer(0))
        ));
    }

    #[test]
    fn test_owned_arena_deletes_on_drop() {
        let arena = OwnedArena::new("short lived").unwrap();
        let handle = arena.borrowed();
        assert_eq!(handle.name().as_deref(), Some("short lived"));

        drop(arena);
        assert!(!handle.is_valid());
        assert!(handle.alloc::<u8>(1).is_err());
    }

    #[test]
    fn test_child_goes_with_parent() {
        let parent = OwnedArena::new("parent").unwrap();
        let child = OwnedArena::with_parent(&parent, "child").unwrap().into_borrowed();
        assert_eq!(child.parent().map(|p| p.context()), Some(parent.context()));

        parent.reset().unwrap();
        assert!(!child.is_valid());
    }
}

// ============================================================================
// Reset callbacks and tracking
// ============================================================================

mod tracking_tests {
    use super::*;

    #[test]
    fn test_callbacks_fire_in_registration_order() {
        let arena = OwnedArena::new("callbacks").unwrap();
        fired();
        // SAFETY: the callbacks ignore their argument.
        unsafe {
            arena.register_reset_callback(first, std::ptr::null_mut()).unwrap();
            arena.register_reset_callback(second, std::ptr::null_mut()).unwrap();
        }

        arena.reset().unwrap();
        assert_eq!(fired(), vec!["first", "second"]);

        drop(arena);
        assert_eq!(fired(), vec!["first", "second"]);
    }

    #[test]
    fn test_unregistered_callback_is_silent() {
        let arena = OwnedArena::new("quiet").unwrap();
        fired();
        // SAFETY: the callback ignores its argument.
        let id = unsafe { arena.register_reset_callback(first, std::ptr::null_mut()).unwrap() };

        assert!(arena.unregister_reset_callback(id));
        assert!(!arena.unregister_reset_callback(id));
        arena.reset().unwrap();
        assert!(fired().is_empty());
    }

    #[test]
    fn test_reset_makes_guard_stale() {
        let arena = OwnedArena::new("tracked").unwrap();
        let tracker = TrackingArena::new(arena.borrowed()).unwrap();
        let guarded = tracker.guard(tracker.alloc_value(42_i64).unwrap());

        // SAFETY: the guard just confirmed the allocation is live.
        assert_eq!(unsafe { *guarded.get().unwrap().as_ptr() }, 42);

        arena.reset().unwrap();
        assert_eq!(tracker.resets(), 1);
        assert!(!guarded.is_valid());
        assert!(matches!(guarded.get(), Err(Error::StaleReference)));

        let fresh = tracker.guard(tracker.alloc_value(1_i64).unwrap());
        assert!(fresh.is_valid());

        drop(arena);
        assert_eq!(tracker.resets(), 2);
        assert!(!fresh.is_valid());
    }

    #[test]
    fn test_text_follows_its_context() {
        let arena = OwnedArena::new("strings").unwrap();
        let text = Text::new("hello", &arena).unwrap();
        assert_eq!(text.as_str().unwrap(), "hello");

        arena.reset().unwrap();
        assert!(!text.is_valid());
        assert!(matches!(text.as_str(), Err(Error::StaleReference)));
    }
}

// ============================================================================
// Current context
// ============================================================================

mod current_tests {
    use super::*;

    #[test]
    fn test_current_arena_follows_switches() {
        let arena = OwnedArena::new("switched").unwrap();
        let before = memory::current_memory_context();
        assert_eq!(CurrentArena.context(), before);

        let inside = arena.run(|| CurrentArena.context());
        assert_eq!(inside, arena.context());
        assert_eq!(CurrentArena.context(), before);
    }

    #[test]
    fn test_scopes_nest() {
        let outer = OwnedArena::new("outer").unwrap();
        let inner = OwnedArena::new("inner").unwrap();
        let before = memory::current_memory_context();
        {
            let _outer = outer.scope();
            let scope = inner.scope();
            assert_eq!(scope.previous().context(), outer.context());
            assert_eq!(BorrowedArena::current().context(), inner.context());
        }
        assert_eq!(memory::current_memory_context(), before);
    }

    #[test]
    fn test_current_allocations_land_in_scope() {
        let arena = OwnedArena::new("target").unwrap();
        let ptr = arena.run(|| CurrentArena.alloc_value(5_u32)).unwrap();
        let owner = BorrowedArena::for_pointer(ptr.as_ptr()).unwrap();
        assert_eq!(owner.context(), arena.context());
    }
}
