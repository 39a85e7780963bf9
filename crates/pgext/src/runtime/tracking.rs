//! Reset tracking for memory contexts.
//!
//! A [`TrackingArena`] counts how many times its context has been reset.
//! Deletion counts as one last reset. A [`Guarded`] pointer remembers the
//! count at the time it was made and refuses access once the count moves
//! on, so a pointer into reset memory is reported instead of read.
//!
//! The context is resolved once, when the tracker is made. A tracker over
//! [`CurrentArena`](super::memory::CurrentArena) keeps allocating in the
//! context that was current then, even after a switch.

use std::cell::Cell;
use std::ffi::c_void;
use std::fmt;
use std::ptr::NonNull;
use std::rc::Rc;

use pgext_host::memory::{self, CallbackId, MemoryContext};
use pgext_log::trace;

use super::memory::{Arena, BorrowedArena};
use crate::{Error, Result};

/// Reset count shared by all copies of one tracker.
struct Epoch {
    resets: Cell<u64>,
    callback: Cell<Option<CallbackId>>,
}

impl Drop for Epoch {
    fn drop(&mut self) {
        // Already gone if the context was deleted.
        if let Some(id) = self.callback.take() {
            memory::memory_context_unregister_reset_callback(id);
        }
    }
}

unsafe extern "C" fn count_reset(arg: *mut c_void) {
    // SAFETY: `arg` points at an Epoch kept alive by at least one tracker;
    // the last one unregisters this callback when it goes away.
    let epoch = unsafe { &*arg.cast_const().cast::<Epoch>() };
    epoch.resets.set(epoch.resets.get() + 1);
}

/// An arena that counts resets of its context.
///
/// Clones share one count and one registered callback.
pub struct TrackingArena<A: Arena = BorrowedArena> {
    // Dropped before `epoch`: deleting an owned context fires the callback.
    arena: A,
    // The tracked context, pinned at construction.
    pinned: BorrowedArena,
    epoch: Rc<Epoch>,
}

impl<A: Arena> TrackingArena<A> {
    pub fn new(arena: A) -> Result<Self> {
        let pinned = arena.borrowed();
        let epoch = Rc::new(Epoch {
            resets: Cell::new(0),
            callback: Cell::new(None),
        });

        let arg = Rc::as_ptr(&epoch).cast_mut().cast::<c_void>();
        // SAFETY: the Epoch unregisters the callback before it is freed.
        let id = unsafe { pinned.register_reset_callback(count_reset, arg)? };
        epoch.callback.set(Some(id));
        trace!("tracking resets of {:?}", pinned.context());

        Ok(TrackingArena {
            arena,
            pinned,
            epoch,
        })
    }

    /// Resets observed so far, counting deletion as one.
    pub fn resets(&self) -> u64 {
        self.epoch.resets.get()
    }

    pub fn arena(&self) -> &A {
        &self.arena
    }

    /// Ties `ptr` to the current reset count.
    pub fn guard<T>(&self, ptr: NonNull<T>) -> Guarded<T, A>
    where
        A: Clone,
    {
        Guarded {
            ptr,
            epoch: self.resets(),
            tracker: self.clone(),
        }
    }
}

impl<A: Arena + Clone> Clone for TrackingArena<A> {
    fn clone(&self) -> Self {
        TrackingArena {
            arena: self.arena.clone(),
            pinned: self.pinned,
            epoch: Rc::clone(&self.epoch),
        }
    }
}

impl<A: Arena> Arena for TrackingArena<A> {
    fn context(&self) -> MemoryContext {
        self.pinned.context()
    }
}

impl<A: Arena + fmt::Debug> fmt::Debug for TrackingArena<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TrackingArena")
            .field("arena", &self.arena)
            .field("resets", &self.resets())
            .finish()
    }
}

/// A pointer into a tracked arena, valid only until the next reset.
pub struct Guarded<T, A: Arena = BorrowedArena> {
    ptr: NonNull<T>,
    epoch: u64,
    tracker: TrackingArena<A>,
}

impl<T, A: Arena> Guarded<T, A> {
    /// Whether the arena has not been reset since the pointer was guarded.
    pub fn is_valid(&self) -> bool {
        self.tracker.resets() == self.epoch
    }

    /// The pointer, or [`Error::StaleReference`] after a reset.
    pub fn get(&self) -> Result<NonNull<T>> {
        if self.is_valid() {
            Ok(self.ptr)
        } else {
            Err(Error::StaleReference)
        }
    }

    /// The pointer without the liveness check.
    pub fn as_ptr(&self) -> *mut T {
        self.ptr.as_ptr()
    }

    pub fn tracker(&self) -> &TrackingArena<A> {
        &self.tracker
    }
}

impl<T, A: Arena + Clone> Clone for Guarded<T, A> {
    fn clone(&self) -> Self {
        Guarded {
            ptr: self.ptr,
            epoch: self.epoch,
            tracker: self.tracker.clone(),
        }
    }
}

impl<T, A: Arena> fmt::Debug for Guarded<T, A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Guarded")
            .field("ptr", &self.ptr)
            .field("valid", &self.is_valid())
            .finish()
    }
}
