use std::ptr::NonNull;

use crate::{
    block::{Block, BlockState, MIN_BLOCK_SIZE},
    error::AllocError,
    kernel::Kernel,
    list::Link,
    mmap::PageSource,
    utils::checked_align,
};

/// A region is one mapping obtained from the [`PageSource`]. It has no header
/// of its own: it is identified by its first block, and every block carved
/// out of it keeps a pointer back to that first block.
///
/// ```text
/// +------------------------------------------------------+
/// | +--------------+    +-------------+    +-----------+ |
/// | | Block (head) | -> | Block       | -> | Block     | |
/// | | region: self |    | region: head|    | region:   | |
/// | +--------------+    +-------------+    +-----------+ |
/// +------------------------------------------------------+
/// ^ start of the mapping
/// ```
///
/// Blocks of one region tile it without gaps, so once they have all been
/// coalesced back into the head the head spans the whole mapping and its
/// size is the length to hand back to the kernel.
impl<S: PageSource> Kernel<S> {
    /// Maps a new region of at least `min_bytes` (rounded up to the page
    /// size) and registers it as a single free block at the tail of the
    /// block list.
    pub(crate) fn create_region(&mut self, min_bytes: usize) -> Result<NonNull<Block>, AllocError> {
        let len = checked_align(min_bytes, self.source.page_size())
            .ok_or(AllocError::OutOfMemory { requested: min_bytes })?;

        let addr = unsafe { self.source.map(len) }.ok_or(AllocError::OutOfMemory { requested: len })?;

        unsafe {
            let block = Block::write(addr, len, BlockState::Free, None);
            self.blocks.push_back(block);
            self.free_list.insert(block);

            Ok(block)
        }
    }

    /// Unlinks the single free block spanning `region` from both lists and
    /// unmaps it. Returns the number of bytes given back.
    ///
    /// **SAFETY**: `region` must satisfy [`Kernel::spans_region`].
    pub(crate) unsafe fn destroy_region(&mut self, mut region: NonNull<Block>) -> usize {
        unsafe {
            debug_assert!(self.spans_region(region));

            let len = region.as_ref().real_size();

            self.free_list.remove(region);
            self.blocks.remove(region);
            region.as_mut().invalidate();

            self.source.unmap(region.cast(), len);

            len
        }
    }

    /// Is `block` a free block covering its whole region?
    pub(crate) fn spans_region(&self, block: NonNull<Block>) -> bool {
        let header = unsafe { block.as_ref() };

        if header.region != block || !header.is_free() {
            return false;
        }

        match header.next {
            Some(next) => unsafe { !next.as_ref().same_region(header) },
            None => true,
        }
    }

    /// Given a free block, this function will split it into two blocks (if
    /// possible). The new block takes the last `size` bytes:
    ///
    /// ```text
    ///     +----------------------+-----+
    ///     | (old block)          | new |
    ///     +----------------------+-----+
    ///     ^                      ^
    ///     |                      |
    ///     |                      +-- returned, marked used
    ///     |
    ///     +-- original block pointer (unchanged), stays free
    ///         size: old_block_size - size
    /// ```
    ///
    /// The leading block keeps its place on the free list. Nothing happens
    /// if the block is used or if either half would be smaller than
    /// [`MIN_BLOCK_SIZE`].
    ///
    /// **SAFETY**: `block` must be a valid header on the block list and
    /// `size` a multiple of [`crate::block::ALIGNMENT`].
    pub(crate) unsafe fn split(&mut self, mut block: NonNull<Block>, size: usize) -> Link<Block> {
        unsafe {
            let header = block.as_mut();

            if !header.is_free() || size < MIN_BLOCK_SIZE {
                return None;
            }

            let leading = header.real_size().checked_sub(size)?;
            if leading < MIN_BLOCK_SIZE {
                return None;
            }

            header.set_real_size(leading);
            let region = header.region;

            let addr = block.cast::<u8>().add(leading);
            let trailing = Block::write(addr, size, BlockState::Used, Some(region));
            self.blocks.insert_after(block, trailing);

            Some(trailing)
        }
    }

    /// Given a free block, this function attempts to merge it with its
    /// previous and next neighbors and updates both lists accordingly.
    ///
    /// ```text
    ///     +-------------+--------------+-----------+
    ///     | b1 (free)   | b2 (free)    | b3 (used) |
    ///     +-------------+--------------+-----------+
    ///
    ///                   |  merge(b2)
    ///                   V
    ///
    ///     +----------------------------+-----------+
    ///     | b1 (free)                  | b3 (used) |
    ///     +----------------------------+-----------+
    /// ```
    ///
    /// Neighbors from other regions are never touched. Returns the surviving
    /// block, which is the leftmost one of the merged set, or `block` itself
    /// if there was nothing to merge.
    ///
    /// **SAFETY**: `block` must be a valid header on the block list.
    pub(crate) unsafe fn merge(&mut self, block: NonNull<Block>) -> NonNull<Block> {
        unsafe {
            if let Some(next) = block.as_ref().next {
                if Self::mergeable(block, next) {
                    self.absorb(block, next);
                }
            }

            if let Some(prev) = block.as_ref().prev {
                if Self::mergeable(prev, block) {
                    self.absorb(prev, block);
                    return prev;
                }
            }

            block
        }
    }

    /// Both free and from the same region. Blocks of one region are
    /// contiguous on the block list, so list neighbors are also address
    /// neighbors in that case.
    unsafe fn mergeable(left: NonNull<Block>, right: NonNull<Block>) -> bool {
        unsafe {
            let (l, r) = (left.as_ref(), right.as_ref());
            l.is_free() && r.is_free() && l.same_region(r)
        }
    }

    /// Extends `left` over `right`. `right` leaves both lists and its header
    /// is invalidated.
    unsafe fn absorb(&mut self, mut left: NonNull<Block>, mut right: NonNull<Block>) {
        unsafe {
            debug_assert_eq!(Block::end(left), right.as_ptr() as *const u8);

            self.free_list.remove(right);
            self.blocks.remove(right);

            let size = left.as_ref().real_size() + right.as_ref().real_size();
            left.as_mut().set_real_size(size);
            right.as_mut().invalidate();
        }
    }
}
