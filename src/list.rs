use std::{marker::PhantomData, ptr::NonNull};

use crate::block::Block;

/// Non-null pointer to `T`.
pub(crate) type Link<T> = Option<NonNull<T>>;

/// Heap-wide list of every [`Block`], free or used.
///
/// Regions are appended at the tail when they are mapped and blocks produced
/// by a split are inserted right after the block they were carved from, so
/// the blocks of one region are always contiguous on the list and sorted by
/// address.
///
/// ```text
///   region A                               region B
/// +--------------------------------------+ +--------------------------+
/// | +-------+    +-------+    +-------+  | | +-------+    +-------+   |
/// | | Block | <> | Block | <> | Block | <---> | Block | <> | Block |   |
/// | +-------+    +-------+    +-------+  | | +-------+    +-------+   |
/// +--------------------------------------+ +--------------------------+
/// ```
///
/// The list never allocates: nodes are the block headers themselves, which
/// live inside the mapped regions.
pub(crate) struct BlockList {
    head: Link<Block>,
    tail: Link<Block>,
    len: usize,
}

pub(crate) struct Iter<'a> {
    current: Link<Block>,
    remaining: usize,
    marker: PhantomData<&'a Block>,
}

impl BlockList {
    pub const fn new() -> Self {
        Self {
            head: None,
            tail: None,
            len: 0,
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn first(&self) -> Link<Block> {
        self.head
    }

    #[inline]
    pub fn last(&self) -> Link<Block> {
        self.tail
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Appends `block` at the end of the list.
    ///
    /// **SAFETY**: `block` must be a valid header that is not linked yet.
    pub unsafe fn push_back(&mut self, mut block: NonNull<Block>) {
        unsafe {
            block.as_mut().prev = self.tail;
            block.as_mut().next = None;

            match self.tail {
                Some(mut tail) => tail.as_mut().next = Some(block),
                None => self.head = Some(block),
            }
        }

        self.tail = Some(block);
        self.len += 1;
    }

    /// Links `block` right after `anchor`.
    ///
    /// **SAFETY**: `anchor` must be on this list and `block` must be a valid
    /// header that is not linked yet.
    pub unsafe fn insert_after(&mut self, mut anchor: NonNull<Block>, mut block: NonNull<Block>) {
        unsafe {
            let next = anchor.as_ref().next;

            block.as_mut().prev = Some(anchor);
            block.as_mut().next = next;
            anchor.as_mut().next = Some(block);

            match next {
                Some(mut next) => next.as_mut().prev = Some(block),
                None => self.tail = Some(block),
            }
        }

        self.len += 1;
    }

    /// Unlinks `block` from the list. Its own links are cleared.
    ///
    /// **SAFETY**: `block` must be on this list.
    pub unsafe fn remove(&mut self, mut block: NonNull<Block>) {
        unsafe {
            let prev = block.as_ref().prev;
            let next = block.as_ref().next;

            match prev {
                Some(mut prev) => prev.as_mut().next = next,
                None => self.head = next,
            }

            match next {
                Some(mut next) => next.as_mut().prev = prev,
                None => self.tail = prev,
            }

            block.as_mut().prev = None;
            block.as_mut().next = None;
        }

        self.len -= 1;
    }

    pub fn iter(&self) -> Iter<'_> {
        Iter {
            current: self.head,
            remaining: self.len,
            marker: PhantomData,
        }
    }
}

impl<'a> Iterator for Iter<'a> {
    type Item = NonNull<Block>;

    fn next(&mut self) -> Option<Self::Item> {
        let block = self.current?;

        unsafe {
            self.current = block.as_ref().next;
        }
        self.remaining -= 1;

        Some(block)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (self.remaining, Some(self.remaining))
    }
}

impl<'a> IntoIterator for &'a BlockList {
    type Item = NonNull<Block>;
    type IntoIter = Iter<'a>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::{tests::Scratch, BlockState};

    fn blocks(scratch: &Scratch, count: usize) -> Vec<NonNull<Block>> {
        (0..count)
            .map(|i| unsafe { Block::write(scratch.at(i * 128), 128, BlockState::Used, None) })
            .collect()
    }

    fn collect(list: &BlockList) -> Vec<NonNull<Block>> {
        list.iter().collect()
    }

    #[test]
    fn new_list_is_empty() {
        let list = BlockList::new();

        assert_eq!(list.len(), 0);
        assert!(list.is_empty());
        assert!(list.iter().next().is_none());
    }

    #[test]
    fn push_and_insert() {
        let scratch = Scratch::new(4096);
        let b = blocks(&scratch, 4);
        let mut list = BlockList::new();

        unsafe {
            list.push_back(b[0]);
            list.push_back(b[2]);
            list.insert_after(b[0], b[1]);
            list.insert_after(b[2], b[3]);
        }

        assert_eq!(b, collect(&list));
        assert_eq!(Some(b[3]), list.last());
        unsafe {
            assert_eq!(Some(b[2]), b[3].as_ref().prev);
            assert_eq!(Some(b[1]), b[0].as_ref().next);
        }
    }

    #[test]
    fn remove_head_middle_and_tail() {
        let scratch = Scratch::new(4096);
        let b = blocks(&scratch, 4);
        let mut list = BlockList::new();

        unsafe {
            for block in &b {
                list.push_back(*block);
            }

            list.remove(b[1]);
            assert_eq!(vec![b[0], b[2], b[3]], collect(&list));
            assert_eq!(Some(b[0]), b[2].as_ref().prev);

            list.remove(b[0]);
            assert_eq!(Some(b[2]), list.first());
            assert_eq!(None, b[2].as_ref().prev);

            list.remove(b[3]);
            assert_eq!(Some(b[2]), list.last());
            assert_eq!(None, b[2].as_ref().next);

            list.remove(b[2]);
        }

        assert!(list.is_empty());
        assert_eq!(None, list.first());
        assert_eq!(None, list.last());
    }
}
