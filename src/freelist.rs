use std::ptr::NonNull;

use crate::{
    block::{Block, FreeBlock},
    config::FitStrategy,
    list::Link,
};

/// Linked list to keep track of free [`Block`]s.
///
/// The links of this list are stored in the payload of every free block,
/// right after its header. As the block is free, nobody is using that
/// memory, so the list costs nothing on top of the header:
///
/// ```text
/// +------------------------+ <--------+
/// |         Block          |          |-------> Block Header
/// +------------------------+ <--------+
/// |  next_free / prev_free |          |-------> FreeBlock links
/// +------------------------+ <--------+
/// |      Free Payload      |
/// |        (unused)        |
/// +------------------------+
/// ```
///
/// The block order links (`next`/`prev`) and the free order links
/// (`next_free`/`prev_free`) are unrelated: the free list is ordered by the
/// time blocks were freed, most recent first.
///
/// A block is on this list if and only if its free bit is set.
pub(crate) struct FreeList {
    head: Link<FreeBlock>,
    len: usize,
}

pub(crate) struct Iter {
    current: Link<FreeBlock>,
}

impl FreeList {
    /// Creates a new empty List
    pub const fn new() -> Self {
        Self {
            head: None,
            len: 0,
        }
    }

    /// It tells whether the FreeList is empty or not.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn first(&self) -> Link<FreeBlock> {
        self.head
    }

    /// Marks `block` as free and pushes it at the head of the list.
    ///
    /// **SAFETY**: `block` must be a valid header of at least
    /// [`crate::block::MIN_BLOCK_SIZE`] bytes that is not on the list.
    pub unsafe fn insert(&mut self, mut block: NonNull<Block>) {
        let mut free = FreeBlock::from_block(block);

        unsafe {
            block.as_mut().mark_free();

            free.as_mut().prev_free = None;
            free.as_mut().next_free = self.head;

            if let Some(mut head) = self.head {
                head.as_mut().prev_free = Some(free);
            }
        }

        self.head = Some(free);
        self.len += 1;
    }

    /// Unlinks `block` from the list. The free bit is left alone, the caller
    /// either marks the block used or drops the header altogether.
    ///
    /// **SAFETY**: `block` must be on this list.
    pub unsafe fn remove(&mut self, block: NonNull<Block>) {
        let mut free = FreeBlock::from_block(block);

        unsafe {
            let prev = free.as_ref().prev_free;
            let next = free.as_ref().next_free;

            match prev {
                Some(mut prev) => prev.as_mut().next_free = next,
                None => self.head = next,
            }

            if let Some(mut next) = next {
                next.as_mut().prev_free = prev;
            }

            free.as_mut().prev_free = None;
            free.as_mut().next_free = None;
        }

        self.len -= 1;
    }

    /// Returns a free block that can hold `size` bytes (header included)
    /// with the payload aligned to `align`, chosen with `strategy`, or `None`
    /// if no block is big enough.
    ///
    /// Ties go to the block found first, i.e. the one closer to the head.
    pub fn find(&self, strategy: FitStrategy, size: usize, align: usize) -> Link<Block> {
        let candidates = self
            .iter()
            .filter(|&free| Block::carve(free, size, align).is_some())
            .map(|free| (free, unsafe { free.as_ref().real_size() }));

        match strategy {
            FitStrategy::First => candidates.map(|(free, _)| free).next(),
            FitStrategy::Best => Self::pick(candidates, |current, best| current < best),
            FitStrategy::Worst => Self::pick(candidates, |current, worst| current > worst),
        }
    }

    /// Keeps the first candidate unless `better` says a later one wins.
    fn pick(
        candidates: impl Iterator<Item = (NonNull<Block>, usize)>,
        better: impl Fn(usize, usize) -> bool,
    ) -> Link<Block> {
        let mut chosen: Option<(NonNull<Block>, usize)> = None;

        for (block, size) in candidates {
            match chosen {
                Some((_, chosen_size)) if !better(size, chosen_size) => {}
                _ => chosen = Some((block, size)),
            }
        }

        chosen.map(|(block, _)| block)
    }

    /// Free blocks, most recently freed first.
    pub fn iter(&self) -> Iter {
        Iter { current: self.head }
    }
}

impl Iterator for Iter {
    type Item = NonNull<Block>;

    fn next(&mut self) -> Option<Self::Item> {
        let free = self.current?;
        self.current = unsafe { free.as_ref().next_free };

        Some(FreeBlock::as_block(free))
    }
}
