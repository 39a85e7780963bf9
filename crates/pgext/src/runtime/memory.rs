//! Typed handles to host memory contexts.
//!
//! An [`Arena`] is a memory context seen from Rust. The handles differ only
//! in what dropping them does:
//!
//! - [`OwnedArena`] deletes its context on drop.
//! - [`BorrowedArena`] refers to a context someone else owns.
//! - [`CurrentArena`] always means whichever context is current.
//!
//! Every host call made through an arena runs behind
//! [`ffi_guard`](super::guard::ffi_guard), so allocation failures come back
//! as [`Error::Host`](crate::Error::Host).

use std::ffi::{c_char, c_void};
use std::marker::PhantomData;
use std::mem::ManuallyDrop;
use std::ptr::NonNull;

use pgext_host::memory::{
    self, CallbackId, MAXIMUM_ALIGNOF, MemoryContext, MemoryContextCallbackFunction,
    MemoryContextCounters,
};
use pgext_log::warn;

use super::guard::ffi_guard;
use crate::{Error, Result};

/// A host memory context.
pub trait Arena {
    /// The context this arena allocates from.
    fn context(&self) -> MemoryContext;

    /// Allocates uninitialized room for `count` values of `T`.
    ///
    /// Sizes beyond the host's limit raise inside the host and come back as
    /// an error.
    fn alloc<T>(&self, count: usize) -> Result<NonNull<T>> {
        let ctx = self.context();
        let size = size_of::<T>().saturating_mul(count);
        let ptr = ffi_guard(|| memory::memory_context_alloc_aligned(ctx, size, align_of::<T>()))?;
        Ok(ptr.cast())
    }

    /// Moves `value` into the arena.
    ///
    /// The arena never runs `T`'s destructor.
    fn alloc_value<T>(&self, value: T) -> Result<NonNull<T>> {
        let ptr = self.alloc::<T>(1)?;
        // SAFETY: freshly allocated, sized and aligned for one T.
        unsafe { ptr.as_ptr().write(value) };
        Ok(ptr)
    }

    /// Copies `s` into the arena as a NUL-terminated string.
    fn alloc_str(&self, s: &str) -> Result<NonNull<c_char>> {
        let ctx = self.context();
        Ok(ffi_guard(|| memory::memory_context_strdup(ctx, s))?)
    }

    /// Returns one allocation to the arena.
    fn free<T>(&self, ptr: NonNull<T>) -> Result<()> {
        Ok(ffi_guard(|| memory::pfree(ptr.as_ptr().cast()))?)
    }

    /// Frees everything allocated in the arena and deletes its children.
    /// Reset callbacks run first.
    fn reset(&self) -> Result<()> {
        let ctx = self.context();
        Ok(ffi_guard(|| memory::memory_context_reset(ctx))?)
    }

    /// Destroys the arena and every descendant.
    fn delete(&self) -> Result<()> {
        let ctx = self.context();
        Ok(ffi_guard(|| memory::memory_context_delete(ctx))?)
    }

    /// Whether the context still exists.
    fn is_valid(&self) -> bool {
        memory::memory_context_is_valid(self.context())
    }

    fn name(&self) -> Option<String> {
        memory::memory_context_name(self.context())
    }

    fn parent(&self) -> Option<BorrowedArena> {
        memory::memory_context_parent(self.context()).map(BorrowedArena::from_context)
    }

    fn stats(&self) -> Result<MemoryContextCounters> {
        let ctx = self.context();
        Ok(ffi_guard(|| memory::memory_context_stats(ctx))?)
    }

    /// Registers `func(arg)` to run on every reset and on deletion.
    ///
    /// # Safety
    ///
    /// `arg` must stay valid for `func` until the callback is unregistered
    /// or the context is deleted.
    unsafe fn register_reset_callback(
        &self,
        func: MemoryContextCallbackFunction,
        arg: *mut c_void,
    ) -> Result<CallbackId> {
        let ctx = self.context();
        // SAFETY: forwarded from the caller.
        Ok(ffi_guard(|| unsafe {
            memory::memory_context_register_reset_callback(ctx, func, arg)
        })?)
    }

    /// Removes a callback. Returns `false` if it is already gone.
    fn unregister_reset_callback(&self, id: CallbackId) -> bool {
        memory::memory_context_unregister_reset_callback(id)
    }

    /// Makes this arena current until the returned scope is dropped.
    fn scope(&self) -> ArenaScope {
        ArenaScope::enter(self.context())
    }

    /// Runs `f` with this arena current.
    fn run<R>(&self, f: impl FnOnce() -> R) -> R {
        let _scope = self.scope();
        f()
    }

    /// A non-owning handle to the same context.
    fn borrowed(&self) -> BorrowedArena {
        BorrowedArena::from_context(self.context())
    }
}

/// An arena that owns its context and deletes it on drop.
#[derive(Debug)]
pub struct OwnedArena {
    context: MemoryContext,
}

impl OwnedArena {
    /// Creates a context under the current one.
    pub fn new(name: &str) -> Result<Self> {
        Self::with_parent(&CurrentArena, name)
    }

    /// Creates a context under `parent`.
    pub fn with_parent(parent: &impl Arena, name: &str) -> Result<Self> {
        let parent = parent.context();
        let context = ffi_guard(|| memory::alloc_set_context_create(parent, name))?;
        Ok(OwnedArena { context })
    }

    /// Takes ownership of an existing context.
    ///
    /// # Safety
    ///
    /// Nothing else may delete `context`.
    pub unsafe fn from_context(context: MemoryContext) -> Self {
        OwnedArena { context }
    }

    /// Gives up ownership; the context outlives the returned handle.
    pub fn into_borrowed(self) -> BorrowedArena {
        let this = ManuallyDrop::new(self);
        BorrowedArena::from_context(this.context)
    }
}

impl Arena for OwnedArena {
    fn context(&self) -> MemoryContext {
        self.context
    }
}

impl Drop for OwnedArena {
    fn drop(&mut self) {
        if !memory::memory_context_is_valid(self.context) {
            return;
        }
        let ctx = self.context;
        if let Err(e) = ffi_guard(|| memory::memory_context_delete(ctx)) {
            warn!("failed to delete memory context: {}", e);
        }
    }
}

/// A handle to a context owned elsewhere.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BorrowedArena {
    context: MemoryContext,
}

impl BorrowedArena {
    pub const fn from_context(context: MemoryContext) -> Self {
        BorrowedArena { context }
    }

    /// The context current right now.
    pub fn current() -> Self {
        Self::from_context(memory::current_memory_context())
    }

    /// The root context.
    pub fn top() -> Self {
        Self::from_context(memory::top_memory_context())
    }

    /// The context that allocated `ptr`.
    pub fn for_pointer<T>(ptr: *const T) -> Result<Self> {
        let addr = ptr.addr();
        if ptr.is_null() || addr % MAXIMUM_ALIGNOF != 0 {
            return Err(Error::InvalidPointer(addr));
        }
        let context = ffi_guard(|| memory::get_memory_chunk_context(ptr.cast()))?;
        Ok(Self::from_context(context))
    }
}

impl Arena for BorrowedArena {
    fn context(&self) -> MemoryContext {
        self.context
    }
}

/// Whichever context is current when it is used.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CurrentArena;

impl Arena for CurrentArena {
    fn context(&self) -> MemoryContext {
        memory::current_memory_context()
    }
}

/// Keeps a context current; switches back on drop.
#[derive(Debug)]
#[must_use = "the previous context is restored when the scope is dropped"]
pub struct ArenaScope {
    previous: MemoryContext,
    _not_send: PhantomData<*const ()>,
}

impl ArenaScope {
    pub fn enter(context: MemoryContext) -> Self {
        ArenaScope {
            previous: memory::memory_context_switch_to(context),
            _not_send: PhantomData,
        }
    }

    /// The context that will become current again.
    pub fn previous(&self) -> BorrowedArena {
        BorrowedArena::from_context(self.previous)
    }
}

impl Drop for ArenaScope {
    fn drop(&mut self) {
        memory::memory_context_switch_to(self.previous);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_owned_arena_deletes_on_drop() {
        let arena = OwnedArena::new("test").unwrap();
        let ctx = arena.context();
        assert!(arena.is_valid());
        assert_eq!(arena.name().as_deref(), Some("test"));

        drop(arena);
        assert!(!memory::memory_context_is_valid(ctx));
    }

    #[test]
    fn test_drop_after_explicit_delete() {
        let arena = OwnedArena::new("doomed").unwrap();
        arena.delete().unwrap();
        assert!(!arena.is_valid());
        drop(arena);
    }

    #[test]
    fn test_into_borrowed_keeps_context() {
        let borrowed = OwnedArena::new("kept").unwrap().into_borrowed();
        assert!(borrowed.is_valid());
        borrowed.delete().unwrap();
    }

    #[test]
    fn test_alloc_value_and_lookup() {
        let arena = OwnedArena::new("values").unwrap();
        let ptr = arena.alloc_value(0x1234_u64).unwrap();
        assert_eq!(unsafe { *ptr.as_ptr() }, 0x1234);
        assert_eq!(BorrowedArena::for_pointer(ptr.as_ptr()).unwrap(), arena.borrowed());
        arena.free(ptr).unwrap();
    }

    #[test]
    fn test_for_pointer_rejects_foreign_memory() {
        assert!(matches!(
            BorrowedArena::for_pointer(std::ptr::null::<u8>()),
            Err(Error::InvalidPointer(0))
        ));

        let local = 7_u64;
        assert!(matches!(
            BorrowedArena::for_pointer(&local),
            Err(Error::Host(_))
        ));
    }

    #[test]
    fn test_oversized_alloc_is_an_error() {
        let arena = OwnedArena::new("huge").unwrap();
        let err = arena.alloc::<u8>(usize::MAX).unwrap_err();
        assert!(matches!(err, Error::Host(_)));
        assert!(err.to_string().starts_with("invalid memory alloc request size"));
    }

    #[test]
    fn test_scope_restores_current() {
        let before = memory::current_memory_context();
        let arena = OwnedArena::new("scoped").unwrap();
        arena.run(|| {
            assert_eq!(CurrentArena.context(), arena.context());
        });
        assert_eq!(memory::current_memory_context(), before);
    }

    #[test]
    fn test_reset_frees_children() {
        let parent = OwnedArena::new("parent").unwrap();
        let child = OwnedArena::with_parent(&parent, "child").unwrap();
        assert_eq!(child.parent(), Some(parent.borrowed()));

        parent.reset().unwrap();
        assert!(!child.is_valid());
        assert!(parent.is_valid());
    }
}
