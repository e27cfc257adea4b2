//! This file contains all the helper functions for the allocator.
//! This are functions that don't particularly belong to any concrete module of the program.

use std::ptr::NonNull;

/// Byte pattern written over fresh payloads when scribbling is enabled.
pub const SCRIBBLE_BYTE: u8 = 0xAA;

/// It aligns `to_be_aligned` using `aligment`, returning the smallest multiple
/// of `aligment` that is `>= to_be_aligned`.
///
/// This method is used to align region sizes to be a multiple of the page size
/// and block sizes to be a multiple of [`crate::block::ALIGNMENT`].
/// `aligment` must be a power of two.
pub const fn align(to_be_aligned: usize, aligment: usize) -> usize {
    (to_be_aligned + aligment - 1) & !(aligment - 1)
}

/// Same as [`align`] but returns `None` instead of wrapping around.
pub fn checked_align(to_be_aligned: usize, aligment: usize) -> Option<usize> {
    to_be_aligned
        .checked_add(aligment - 1)
        .map(|size| size & !(aligment - 1))
}

/// Overwrites `len` bytes starting at `addr` with `byte`.
///
/// **SAFETY**: `addr..addr + len` must be writable.
#[inline]
pub unsafe fn fill(addr: NonNull<u8>, byte: u8, len: usize) {
    unsafe { addr.as_ptr().write_bytes(byte, len) }
}
