//! Variable-length value layout.
//!
//! A varlena starts with a header that encodes its total size. Values built
//! here always carry the 4-byte header: the low two bits of the first byte are
//! zero and the little-endian word shifted right by two is the total size.
//! Values read here may also carry the 1-byte short header (low bit set, size
//! in the upper seven bits).

use std::ptr::NonNull;
use std::slice;

use crate::Datum;
use crate::memory::{self, MemoryContext};

/// Size of the 4-byte header.
pub const VARHDRSZ: usize = 4;

/// Size of the short header.
pub const VARHDRSZ_SHORT: usize = 1;

/// Total size of the varlena at `ptr`, header included.
///
/// # Safety
///
/// `ptr` must point at a valid varlena header.
pub unsafe fn varsize_any(ptr: *const u8) -> usize {
    let first = unsafe { *ptr };
    if first & 0x01 == 0x01 {
        usize::from(first >> 1)
    } else {
        let mut header = [0u8; 4];
        unsafe { std::ptr::copy_nonoverlapping(ptr, header.as_mut_ptr(), 4) };
        (u32::from_le_bytes(header) >> 2) as usize
    }
}

/// Header size of the varlena at `ptr`.
///
/// # Safety
///
/// See [`varsize_any`].
pub unsafe fn varhdrsz_any(ptr: *const u8) -> usize {
    if unsafe { *ptr } & 0x01 == 0x01 {
        VARHDRSZ_SHORT
    } else {
        VARHDRSZ
    }
}

/// Payload of the varlena at `ptr`.
///
/// # Safety
///
/// `ptr` must point at a complete varlena that stays alive and unmodified
/// for `'a`.
pub unsafe fn vardata_any<'a>(ptr: *const u8) -> &'a [u8] {
    unsafe {
        let header = varhdrsz_any(ptr);
        let len = varsize_any(ptr).saturating_sub(header);
        slice::from_raw_parts(ptr.add(header), len)
    }
}

/// Copies `payload` into a new varlena allocated in `ctx`.
#[track_caller]
pub fn bytes_to_varlena_in(ctx: MemoryContext, payload: &[u8]) -> NonNull<u8> {
    let total = payload.len().saturating_add(VARHDRSZ);
    let ptr = memory::memory_context_alloc(ctx, total);

    // The allocator caps requests well below 2^30, so the size fits the
    // 30 bits the header has for it.
    let header = ((total as u32) << 2).to_le_bytes();

    // SAFETY: the chunk holds `total` bytes and does not overlap `payload`.
    unsafe {
        std::ptr::copy_nonoverlapping(header.as_ptr(), ptr.as_ptr(), VARHDRSZ);
        std::ptr::copy_nonoverlapping(
            payload.as_ptr(),
            ptr.as_ptr().add(VARHDRSZ),
            payload.len(),
        );
    }

    ptr
}

/// Builds a `text` datum in the current memory context.
#[track_caller]
pub fn cstring_to_text(s: &str) -> Datum {
    bytes_to_varlena_in(memory::current_memory_context(), s.as_bytes())
        .as_ptr()
        .expose_provenance()
}

/// Reads a `text` datum.
///
/// # Safety
///
/// `datum` must be a live varlena pointer valid for `'a`.
pub unsafe fn text_to_bytes<'a>(datum: Datum) -> &'a [u8] {
    unsafe { vardata_any(std::ptr::with_exposed_provenance(datum)) }
}
