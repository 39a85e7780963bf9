//! Memory contexts.
//!
//! A memory context is a node in a tree of allocation scopes. Allocations are
//! bump-allocated out of blocks owned by the context and are released in bulk
//! when the context is reset or deleted; individual [`pfree`] is supported for
//! accounting but never returns space to a block.
//!
//! # Architecture
//!
//! - [`MemoryContext`]: a generational handle. Once a context is deleted its
//!   slot may be reused, but old handles stop validating.
//! - `Block`: one system allocation with a non-atomic bump pointer. The first
//!   block of a context survives resets and is rewound instead of freed.
//! - Reset callbacks run on every reset and on delete, in registration order,
//!   and stay registered until the context is deleted or they are
//!   unregistered.
//!
//! Exactly one context is current at any time. [`memory_context_switch_to`]
//! installs a new one and returns the previous one so callers can restore it.
//!
//! Failures (bad handles, oversized requests, exhaustion of the configured
//! limit) are raised as ERRORs through [`crate::elog`], never returned as null
//! pointers.
//!
//! # Example
//!
//! ```
//! use pgext_host::memory::*;
//!
//! let ctx = alloc_set_context_create(top_memory_context(), "scratch");
//! let ptr = memory_context_alloc(ctx, 64);
//! assert_eq!(get_memory_chunk_context(ptr.as_ptr()), ctx);
//!
//! memory_context_reset(ctx);
//! assert_eq!(memory_context_stats(ctx).allocated, 0);
//!
//! memory_context_delete(ctx);
//! assert!(!memory_context_is_valid(ctx));
//! ```

use std::alloc::{self, Layout};
use std::cell::RefCell;
use std::ffi::{c_char, c_void};
use std::fmt;
use std::ptr::NonNull;

use hashbrown::HashMap;

use crate::elog::{self, SqlState};

/// Alignment of every plain allocation.
pub const MAXIMUM_ALIGNOF: usize = 8;

/// Largest request a context accepts (1 GiB - 1).
pub const MAX_ALLOC_SIZE: usize = 0x3fff_ffff;

/// Size of the first block of a context.
const INITIAL_BLOCK_SIZE: usize = 8 * 1024;

/// Blocks double up to this size.
const MAX_BLOCK_SIZE: usize = 8 * 1024 * 1024;

/// Largest alignment accepted by [`memory_context_alloc_aligned`].
const MAX_ALIGNMENT: usize = 4096;

#[cfg(feature = "clobber-freed-memory")]
const CLOBBER_BYTE: u8 = 0x7F;

/// Handle to a memory context.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct MemoryContext {
    index: u32,
    generation: u32,
}

impl fmt::Debug for MemoryContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MemoryContext({}#{})", self.index, self.generation)
    }
}

/// Reset callback signature.
pub type MemoryContextCallbackFunction = unsafe extern "C" fn(arg: *mut c_void);

/// Identifies one registered reset callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CallbackId {
    context: MemoryContext,
    serial: u64,
}

impl CallbackId {
    /// The context the callback is registered with.
    pub fn context(&self) -> MemoryContext {
        self.context
    }
}

/// Usage counters of one context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MemoryContextCounters {
    /// Bytes handed out and not yet freed.
    pub allocated: usize,
    /// Live chunks.
    pub chunks: usize,
    /// Blocks owned by the context.
    pub blocks: usize,
    /// Total capacity of all blocks.
    pub total_space: usize,
    /// Direct children.
    pub children: usize,
}

/// One system allocation with a bump pointer.
struct Block {
    start: NonNull<u8>,
    ptr: *mut u8,
    end: usize,
    capacity: usize,
}

impl Block {
    fn new(size: usize) -> Option<Self> {
        let layout = Layout::from_size_align(size, MAXIMUM_ALIGNOF).ok()?;

        // SAFETY: size is non-zero; every caller passes at least
        // INITIAL_BLOCK_SIZE.
        let start = NonNull::new(unsafe { alloc::alloc(layout) })?;

        Some(Block {
            start,
            ptr: start.as_ptr(),
            end: start.as_ptr().addr() + size,
            capacity: size,
        })
    }

    #[inline]
    fn alloc(&mut self, size: usize, align: usize) -> Option<NonNull<u8>> {
        let current = self.ptr.addr();
        let aligned_start = current.checked_add(align - 1)? & !(align - 1);
        let new_addr = aligned_start.checked_add(size)?;

        if new_addr > self.end {
            return None;
        }

        self.ptr = self.ptr.with_addr(new_addr);
        NonNull::new(self.ptr.with_addr(aligned_start))
    }

    fn used(&self) -> usize {
        self.ptr.addr() - self.start.as_ptr().addr()
    }

    /// Rewinds the bump pointer, making the whole block available again.
    fn rewind(&mut self) {
        #[cfg(feature = "clobber-freed-memory")]
        // SAFETY: [start, ptr) lies inside this block.
        unsafe {
            std::ptr::write_bytes(self.start.as_ptr(), CLOBBER_BYTE, self.used());
        }

        self.ptr = self.start.as_ptr();
    }
}

impl Drop for Block {
    fn drop(&mut self) {
        // SAFETY: same size and alignment the block was allocated with.
        unsafe {
            let layout =
                Layout::from_size_align_unchecked(self.capacity, MAXIMUM_ALIGNOF);
            alloc::dealloc(self.start.as_ptr(), layout);
        }
    }
}

struct Callback {
    serial: u64,
    func: MemoryContextCallbackFunction,
    arg: *mut c_void,
}

struct ContextData {
    generation: u32,
    live: bool,
    name: String,
    parent: Option<MemoryContext>,
    children: Vec<MemoryContext>,
    blocks: Vec<Block>,
    /// Live chunks: start address to size.
    chunks: HashMap<usize, usize>,
    callbacks: Vec<Callback>,
    allocated: usize,
    /// Exempt from the allocation limit.
    reserved: bool,
}

impl ContextData {
    fn new(
        generation: u32,
        name: &str,
        parent: Option<MemoryContext>,
        reserved: bool,
    ) -> Self {
        ContextData {
            generation,
            live: true,
            name: name.to_string(),
            parent,
            children: Vec::new(),
            blocks: Vec::new(),
            chunks: HashMap::new(),
            callbacks: Vec::new(),
            allocated: 0,
            reserved,
        }
    }

    /// Drops every block but the first and rewinds that one.
    fn release(&mut self) -> usize {
        self.blocks.truncate(1);
        if let Some(keeper) = self.blocks.first_mut() {
            keeper.rewind();
        }
        self.chunks.clear();
        std::mem::take(&mut self.allocated)
    }
}

/// Why a memory operation failed; raised once the state borrow is released.
enum Failure {
    InvalidContext(MemoryContext),
    InvalidRequest(usize),
    InvalidAlignment(usize),
    OutOfMemory { size: usize, context: String },
    InvalidPointer(usize),
    Protected(&'static str),
}

impl Failure {
    #[track_caller]
    fn raise(self) -> ! {
        match self {
            Failure::InvalidContext(ctx) => elog::error(
                SqlState::INTERNAL_ERROR,
                format!("invalid memory context {ctx:?}"),
            ),
            Failure::InvalidRequest(size) => elog::error(
                SqlState::PROGRAM_LIMIT_EXCEEDED,
                format!("invalid memory alloc request size {size}"),
            ),
            Failure::InvalidAlignment(align) => elog::error(
                SqlState::INTERNAL_ERROR,
                format!("invalid memory alignment {align}"),
            ),
            Failure::OutOfMemory { size, context } => {
                elog::errstart(elog::ErrorLevel::Error);
                elog::errcode(SqlState::OUT_OF_MEMORY);
                elog::errmsg("out of memory");
                elog::errdetail(format!(
                    "Failed on request of size {size} in memory context \"{context}\"."
                ));
                let location = std::panic::Location::caller();
                elog::throw_building(location.file(), location.line())
            }
            Failure::InvalidPointer(addr) => elog::error(
                SqlState::INTERNAL_ERROR,
                format!("pointer {addr:#x} was not allocated by any memory context"),
            ),
            Failure::Protected(name) => elog::error(
                SqlState::INTERNAL_ERROR,
                format!("cannot delete {name}"),
            ),
        }
    }
}

struct MemoryState {
    contexts: Vec<ContextData>,
    free: Vec<u32>,
    top: MemoryContext,
    error: MemoryContext,
    current: MemoryContext,
    limit: Option<usize>,
    total: usize,
    next_serial: u64,
}

impl MemoryState {
    fn new() -> Self {
        let top = MemoryContext {
            index: 0,
            generation: 0,
        };
        let error = MemoryContext {
            index: 1,
            generation: 0,
        };

        let mut top_data = ContextData::new(0, "TopMemoryContext", None, false);
        top_data.children.push(error);

        MemoryState {
            contexts: vec![
                top_data,
                ContextData::new(0, "ErrorContext", Some(top), true),
            ],
            free: Vec::new(),
            top,
            error,
            current: top,
            limit: None,
            total: 0,
            next_serial: 0,
        }
    }

    fn get(&self, ctx: MemoryContext) -> Result<&ContextData, Failure> {
        self.contexts
            .get(ctx.index as usize)
            .filter(|data| data.live && data.generation == ctx.generation)
            .ok_or(Failure::InvalidContext(ctx))
    }

    fn get_mut(
        &mut self,
        ctx: MemoryContext,
    ) -> Result<&mut ContextData, Failure> {
        self.contexts
            .get_mut(ctx.index as usize)
            .filter(|data| data.live && data.generation == ctx.generation)
            .ok_or(Failure::InvalidContext(ctx))
    }

    fn create(
        &mut self,
        parent: MemoryContext,
        name: &str,
    ) -> Result<MemoryContext, Failure> {
        let reserved = self.get(parent)?.reserved || parent == self.error;

        let ctx = match self.free.pop() {
            Some(index) => {
                let slot = &mut self.contexts[index as usize];
                let generation = slot.generation.wrapping_add(1);
                *slot =
                    ContextData::new(generation, name, Some(parent), reserved);
                MemoryContext { index, generation }
            }
            None => {
                let index = u32::try_from(self.contexts.len())
                    .map_err(|_| Failure::InvalidRequest(self.contexts.len()))?;
                self.contexts.push(ContextData::new(
                    0,
                    name,
                    Some(parent),
                    reserved,
                ));
                MemoryContext {
                    index,
                    generation: 0,
                }
            }
        };

        self.get_mut(parent)?.children.push(ctx);
        Ok(ctx)
    }

    fn alloc(
        &mut self,
        ctx: MemoryContext,
        size: usize,
        align: usize,
    ) -> Result<NonNull<u8>, Failure> {
        if size > MAX_ALLOC_SIZE {
            return Err(Failure::InvalidRequest(size));
        }
        if !align.is_power_of_two() || align > MAX_ALIGNMENT {
            return Err(Failure::InvalidAlignment(align));
        }

        let align = align.max(MAXIMUM_ALIGNOF);
        // Zero-sized requests still get a distinct chunk.
        let size = size.max(1);
        let limit = self.limit;
        let total = self.total;
        let data = self.get_mut(ctx)?;

        if !data.reserved
            && let Some(limit) = limit
            && total + size > limit
        {
            return Err(Failure::OutOfMemory {
                size,
                context: data.name.clone(),
            });
        }

        let ptr = loop {
            if let Some(block) = data.blocks.last_mut()
                && let Some(ptr) = block.alloc(size, align)
            {
                break ptr;
            }

            let last = data.blocks.last().map_or(0, |b| b.capacity);
            let block_size = (last * 2)
                .clamp(INITIAL_BLOCK_SIZE, MAX_BLOCK_SIZE)
                .max(size + align);

            let block = Block::new(block_size).ok_or_else(|| {
                Failure::OutOfMemory {
                    size,
                    context: data.name.clone(),
                }
            })?;
            data.blocks.push(block);
        };

        data.chunks.insert(ptr.as_ptr().addr(), size);
        data.allocated += size;
        self.total += size;
        Ok(ptr)
    }

    fn owner_of(&self, addr: usize) -> Option<MemoryContext> {
        self.contexts.iter().enumerate().find_map(|(index, data)| {
            (data.live && data.chunks.contains_key(&addr)).then_some(
                MemoryContext {
                    index: index as u32,
                    generation: data.generation,
                },
            )
        })
    }

    fn free(&mut self, addr: usize) -> Result<(), Failure> {
        let owner = self.owner_of(addr).ok_or(Failure::InvalidPointer(addr))?;
        let data = self.get_mut(owner)?;
        let size = data
            .chunks
            .remove(&addr)
            .ok_or(Failure::InvalidPointer(addr))?;
        data.allocated -= size;
        self.total -= size;

        #[cfg(feature = "clobber-freed-memory")]
        // SAFETY: the chunk was handed out by this context and is still
        // backed by one of its blocks.
        unsafe {
            std::ptr::write_bytes(
                std::ptr::with_exposed_provenance_mut::<u8>(addr),
                CLOBBER_BYTE,
                size,
            );
        }

        Ok(())
    }

    fn protect(&self, ctx: MemoryContext) -> Result<(), Failure> {
        if ctx == self.top {
            return Err(Failure::Protected("TopMemoryContext"));
        }
        if ctx == self.error {
            return Err(Failure::Protected("ErrorContext"));
        }
        self.get(ctx).map(|_| ())
    }

    fn callbacks(
        &self,
        ctx: MemoryContext,
    ) -> Result<Vec<(MemoryContextCallbackFunction, *mut c_void)>, Failure>
    {
        Ok(self
            .get(ctx)?
            .callbacks
            .iter()
            .map(|cb| (cb.func, cb.arg))
            .collect())
    }

    fn release(&mut self, ctx: MemoryContext) -> Result<(), Failure> {
        let released = self.get_mut(ctx)?.release();
        self.total -= released;
        Ok(())
    }

    fn destroy(&mut self, ctx: MemoryContext) -> Result<(), Failure> {
        let data = self.get_mut(ctx)?;
        let released = data.allocated;
        let parent = data.parent;

        data.live = false;
        data.blocks.clear();
        data.chunks.clear();
        data.callbacks.clear();
        data.children.clear();
        data.allocated = 0;
        self.total -= released;
        self.free.push(ctx.index);

        if let Some(parent) = parent {
            if let Ok(parent_data) = self.get_mut(parent) {
                parent_data.children.retain(|child| *child != ctx);
            }
            if self.current == ctx {
                pgext_log::warn!(
                    "deleting the current memory context, switching to its parent"
                );
                self.current = parent;
            }
        }

        Ok(())
    }
}

thread_local! {
    static MEMORY: RefCell<MemoryState> = RefCell::new(MemoryState::new());
}

fn with_state<R>(f: impl FnOnce(&mut MemoryState) -> R) -> R {
    MEMORY.with(|state| f(&mut state.borrow_mut()))
}

/// Root of the context tree; lives as long as the thread.
pub fn top_memory_context() -> MemoryContext {
    with_state(|s| s.top)
}

/// Parent of error copies. Allocations below it ignore the memory limit so
/// that an out-of-memory error can still be reported.
pub fn error_memory_context() -> MemoryContext {
    with_state(|s| s.error)
}

/// The context plain [`palloc`] allocates in.
pub fn current_memory_context() -> MemoryContext {
    with_state(|s| s.current)
}

/// Makes `ctx` current and returns the previously current context.
///
/// The handle is not validated, matching a plain pointer assignment; using a
/// stale current context fails at the next allocation.
pub fn memory_context_switch_to(ctx: MemoryContext) -> MemoryContext {
    with_state(|s| std::mem::replace(&mut s.current, ctx))
}

/// Creates a child context of `parent`.
#[track_caller]
pub fn alloc_set_context_create(
    parent: MemoryContext,
    name: &str,
) -> MemoryContext {
    with_state(|s| s.create(parent, name)).unwrap_or_else(|f| f.raise())
}

/// Allocates `size` bytes aligned to [`MAXIMUM_ALIGNOF`].
#[track_caller]
pub fn memory_context_alloc(ctx: MemoryContext, size: usize) -> NonNull<u8> {
    memory_context_alloc_aligned(ctx, size, MAXIMUM_ALIGNOF)
}

/// Allocates `size` bytes aligned to `align`, which must be a power of two.
#[track_caller]
pub fn memory_context_alloc_aligned(
    ctx: MemoryContext,
    size: usize,
    align: usize,
) -> NonNull<u8> {
    with_state(|s| s.alloc(ctx, size, align)).unwrap_or_else(|f| f.raise())
}

/// Allocates zeroed memory.
#[track_caller]
pub fn memory_context_alloc_zero(ctx: MemoryContext, size: usize) -> NonNull<u8> {
    let ptr = memory_context_alloc(ctx, size);
    // SAFETY: freshly allocated chunk of at least `size` bytes.
    unsafe { std::ptr::write_bytes(ptr.as_ptr(), 0, size) };
    ptr
}

/// Allocates in the current context.
#[track_caller]
pub fn palloc(size: usize) -> NonNull<u8> {
    memory_context_alloc(current_memory_context(), size)
}

/// Allocates zeroed memory in the current context.
#[track_caller]
pub fn palloc0(size: usize) -> NonNull<u8> {
    memory_context_alloc_zero(current_memory_context(), size)
}

/// Copies `s` into `ctx` as a NUL-terminated C string.
#[track_caller]
pub fn memory_context_strdup(ctx: MemoryContext, s: &str) -> NonNull<c_char> {
    let len = s.len();
    let ptr = memory_context_alloc(ctx, len + 1);

    // SAFETY: the chunk holds len + 1 bytes and does not overlap `s`.
    unsafe {
        std::ptr::copy_nonoverlapping(s.as_ptr(), ptr.as_ptr(), len);
        *ptr.as_ptr().add(len) = 0;
    }

    ptr.cast()
}

/// Copies `s` into the current context.
#[track_caller]
pub fn pstrdup(s: &str) -> NonNull<c_char> {
    memory_context_strdup(current_memory_context(), s)
}

/// Releases one chunk. Raises if `ptr` is not the start of a live chunk.
#[track_caller]
pub fn pfree(ptr: *mut u8) {
    with_state(|s| s.free(ptr.expose_provenance())).unwrap_or_else(|f| f.raise())
}

/// Returns the context owning the chunk that starts at `ptr`.
#[track_caller]
pub fn get_memory_chunk_context(ptr: *const u8) -> MemoryContext {
    let addr = ptr.addr();
    with_state(|s| s.owner_of(addr))
        .unwrap_or_else(|| Failure::InvalidPointer(addr).raise())
}

/// Non-raising variant of [`get_memory_chunk_context`].
pub fn try_get_memory_chunk_context(ptr: *const u8) -> Option<MemoryContext> {
    let addr = ptr.addr();
    with_state(|s| s.owner_of(addr))
}

/// Checks whether `ctx` still denotes a live context.
pub fn memory_context_is_valid(ctx: MemoryContext) -> bool {
    with_state(|s| s.get(ctx).is_ok())
}

/// Name given at creation.
pub fn memory_context_name(ctx: MemoryContext) -> Option<String> {
    with_state(|s| s.get(ctx).ok().map(|data| data.name.clone()))
}

/// Parent of `ctx`, `None` for the top context or an invalid handle.
pub fn memory_context_parent(ctx: MemoryContext) -> Option<MemoryContext> {
    with_state(|s| s.get(ctx).ok().and_then(|data| data.parent))
}

/// Usage counters of `ctx`.
#[track_caller]
pub fn memory_context_stats(ctx: MemoryContext) -> MemoryContextCounters {
    with_state(|s| {
        s.get(ctx).map(|data| MemoryContextCounters {
            allocated: data.allocated,
            chunks: data.chunks.len(),
            blocks: data.blocks.len(),
            total_space: data.blocks.iter().map(|b| b.capacity).sum(),
            children: data.children.len(),
        })
    })
    .unwrap_or_else(|f| f.raise())
}

/// Caps the bytes live across all non-reserved contexts of this thread.
/// `None` removes the cap.
pub fn set_memory_limit(limit: Option<usize>) {
    with_state(|s| s.limit = limit);
}

fn run_callbacks(ctx: MemoryContext) {
    let callbacks =
        with_state(|s| s.callbacks(ctx)).unwrap_or_else(|f| f.raise());

    for (func, arg) in callbacks {
        // SAFETY: the registrant guaranteed `arg` stays valid while the
        // callback is registered.
        unsafe { func(arg) };
    }
}

fn delete_children(ctx: MemoryContext) {
    let children = with_state(|s| s.get(ctx).map(|data| data.children.clone()))
        .unwrap_or_else(|f| f.raise());

    for child in children {
        memory_context_delete(child);
    }
}

/// Deletes all children of `ctx`, fires its reset callbacks and releases
/// every chunk. The context stays usable.
#[track_caller]
pub fn memory_context_reset(ctx: MemoryContext) {
    delete_children(ctx);
    run_callbacks(ctx);
    with_state(|s| s.release(ctx)).unwrap_or_else(|f| f.raise());
}

/// Destroys `ctx` and all of its descendants, children first.
///
/// Reset callbacks fire once more before the memory goes away. Deleting the
/// current context makes its parent current.
#[track_caller]
pub fn memory_context_delete(ctx: MemoryContext) {
    with_state(|s| s.protect(ctx)).unwrap_or_else(|f| f.raise());
    delete_children(ctx);
    run_callbacks(ctx);
    with_state(|s| s.destroy(ctx)).unwrap_or_else(|f| f.raise());
}

/// Registers `func(arg)` to run on every reset of `ctx` and on its deletion.
///
/// # Safety
///
/// `arg` must remain valid for `func` until the callback is unregistered or
/// the context is deleted.
#[track_caller]
pub unsafe fn memory_context_register_reset_callback(
    ctx: MemoryContext,
    func: MemoryContextCallbackFunction,
    arg: *mut c_void,
) -> CallbackId {
    with_state(|s| {
        let serial = s.next_serial;
        s.next_serial += 1;
        s.get_mut(ctx).map(|data| {
            data.callbacks.push(Callback { serial, func, arg });
            CallbackId {
                context: ctx,
                serial,
            }
        })
    })
    .unwrap_or_else(|f| f.raise())
}

/// Removes a registered callback. Returns `false` when it is already gone,
/// including when its context has been deleted.
pub fn memory_context_unregister_reset_callback(id: CallbackId) -> bool {
    with_state(|s| match s.get_mut(id.context) {
        Ok(data) => {
            let before = data.callbacks.len();
            data.callbacks.retain(|cb| cb.serial != id.serial);
            data.callbacks.len() != before
        }
        Err(_) => false,
    })
}
