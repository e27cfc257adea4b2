use std::{mem, ptr::NonNull};

use crate::{error::AllocError, list::Link, utils::align};

/// Every block size (header + payload) is a multiple of this.
pub const ALIGNMENT: usize = 16;

/// Maximum length in bytes of a block label.
pub const LABEL_MAX: usize = 27;

/// Marker written into every live header. Used to reject pointers that
/// were not handed out by us before we start trusting the header.
pub(crate) const BLOCK_MAGIC: u32 = 0x6d61_6c63;

/// Bit of [`Block::size`] that tells whether the block is free. Sizes are
/// always multiples of [`ALIGNMENT`], so this bit never carries magnitude.
const FREE_BIT: usize = 0x01;

/// Header size of a block. The payload starts right after it.
pub const BLOCK_HEADER_SIZE: usize = mem::size_of::<Block>();

/// Smallest block we ever create. A free block must be able to hold its
/// [`FreeBlock`] links, so this is the size of that structure.
pub const MIN_BLOCK_SIZE: usize = align(mem::size_of::<FreeBlock>(), ALIGNMENT);

const _: () = assert!(BLOCK_HEADER_SIZE % ALIGNMENT == 0);
#[cfg(target_pointer_width = "64")]
const _: () = assert!(BLOCK_HEADER_SIZE == 64 && MIN_BLOCK_SIZE == 80);

/// Whether a block is available for reuse or owned by a caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockState {
    Free,
    Used,
}

impl BlockState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Free => "FREE",
            Self::Used => "USED",
        }
    }
}

/// Debug label stored inline in the header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(C)]
pub(crate) struct Label {
    len: u8,
    bytes: [u8; LABEL_MAX],
}

impl Label {
    pub const EMPTY: Self = Self {
        len: 0,
        bytes: [0; LABEL_MAX],
    };

    pub fn new(text: &str) -> Result<Self, AllocError> {
        if text.len() > LABEL_MAX {
            return Err(AllocError::InvalidArgument("label too long"));
        }

        let mut label = Self::EMPTY;
        label.bytes[..text.len()].copy_from_slice(text.as_bytes());
        label.len = text.len() as u8;

        Ok(label)
    }

    pub fn as_str(&self) -> &str {
        std::str::from_utf8(&self.bytes[..self.len as usize]).unwrap_or("")
    }
}

/// This is the structure of a block header. Content is placed right after it.
///
/// ```text
/// +---------------------+ <------+
/// |       region        |        |
/// +---------------------+        |
/// |  size | free (1b)   |        |
/// +---------------------+        |
/// |     next / prev     |        | -> Header
/// +---------------------+        |
/// |        magic        |        |
/// +---------------------+        |
/// |        label        |        |
/// +---------------------+ <------+
/// |       Content       |        |
/// |         ...         |        | -> Addressable content
/// |                     |        |
/// +---------------------+ <------+
/// ```
///
/// `next` and `prev` link every block of the heap in address order, see
/// [`crate::list::BlockList`]. The size covers header and content.
#[repr(C)]
pub(crate) struct Block {
    /// First block of the region this block lives in. The first block of a
    /// region points to itself.
    pub region: NonNull<Block>,
    size: usize,
    pub next: Link<Block>,
    pub prev: Link<Block>,
    magic: u32,
    pub label: Label,
}

/// A [`Block`] while it is free. The free list links are written over the
/// first bytes of the payload, which nobody else is using at that point.
#[repr(C)]
pub(crate) struct FreeBlock {
    pub block: Block,
    pub next_free: Link<FreeBlock>,
    pub prev_free: Link<FreeBlock>,
}

impl Block {
    /// Writes a fresh, unlinked header of `size` bytes at `addr`. When
    /// `region` is `None` the block starts its own region.
    ///
    /// **SAFETY**: `addr` must be aligned and valid for `size` bytes, and
    /// `size` must be a multiple of [`ALIGNMENT`] no smaller than [`MIN_BLOCK_SIZE`].
    pub unsafe fn write(
        addr: NonNull<u8>,
        size: usize,
        state: BlockState,
        region: Option<NonNull<Block>>,
    ) -> NonNull<Block> {
        debug_assert!(size % ALIGNMENT == 0 && size >= MIN_BLOCK_SIZE);

        let block = addr.cast::<Block>();
        let flag = match state {
            BlockState::Free => FREE_BIT,
            BlockState::Used => 0,
        };

        unsafe {
            block.as_ptr().write(Block {
                region: region.unwrap_or(block),
                size: size | flag,
                next: None,
                prev: None,
                magic: BLOCK_MAGIC,
                label: Label::EMPTY,
            });
        }

        block
    }

    /// Size of the block (header + content) without the free bit.
    #[inline]
    pub fn real_size(&self) -> usize {
        self.size & !FREE_BIT
    }

    /// Changes the magnitude of the block, leaving its state untouched.
    #[inline]
    pub fn set_real_size(&mut self, size: usize) {
        debug_assert!(size % ALIGNMENT == 0);
        self.size = size | (self.size & FREE_BIT);
    }

    #[inline]
    pub fn state(&self) -> BlockState {
        if self.is_free() {
            BlockState::Free
        } else {
            BlockState::Used
        }
    }

    #[inline]
    pub fn is_free(&self) -> bool {
        self.size & FREE_BIT == FREE_BIT
    }

    #[inline]
    pub fn mark_free(&mut self) {
        self.size |= FREE_BIT;
    }

    #[inline]
    pub fn mark_used(&mut self) {
        self.size &= !FREE_BIT;
    }

    #[inline]
    pub fn has_magic(&self) -> bool {
        self.magic == BLOCK_MAGIC
    }

    /// Wipes the marker so stale pointers to this header are rejected.
    #[inline]
    pub fn invalidate(&mut self) {
        self.magic = 0;
    }

    /// Is `other` part of the same region as this block?
    #[inline]
    pub fn same_region(&self, other: &Block) -> bool {
        self.region == other.region
    }

    /// Number of bytes a caller may use.
    #[inline]
    pub fn payload_size(&self) -> usize {
        self.real_size() - BLOCK_HEADER_SIZE
    }

    /// Address of the content that follows the header `block`.
    #[inline]
    pub fn payload(block: NonNull<Block>) -> NonNull<u8> {
        unsafe { block.cast::<u8>().add(BLOCK_HEADER_SIZE) }
    }

    /// One past the last byte of `block`.
    #[inline]
    pub fn end(block: NonNull<Block>) -> *const u8 {
        let size = unsafe { block.as_ref().real_size() };
        block.as_ptr().cast::<u8>().wrapping_add(size)
    }

    /// Recovers the header that precedes `payload`. Nothing is read, the
    /// result must be validated before it is dereferenced.
    #[inline]
    pub fn from_payload(payload: NonNull<u8>) -> *mut Block {
        payload
            .as_ptr()
            .wrapping_sub(BLOCK_HEADER_SIZE)
            .cast::<Block>()
    }
}

/// How a request fits into a free block, see [`Block::carve`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Carve {
    /// Split off a tail of this many bytes.
    Tail(usize),
    /// Hand out the block as it is.
    Whole,
}

impl Block {
    /// Works out where a block of `size` bytes whose payload is aligned to
    /// `align` goes inside the free block `block`. The tail is preferred, as
    /// high as the alignment allows, as long as the leading part left behind
    /// can still be a block. Otherwise the whole block is used if its own
    /// payload is suitably aligned. `None` means it does not fit.
    ///
    /// `size` must be a multiple of [`ALIGNMENT`] and `align` a power of two
    /// no smaller than it.
    pub fn carve(block: NonNull<Block>, size: usize, align: usize) -> Option<Carve> {
        let start = block.as_ptr() as usize;
        let real = unsafe { block.as_ref().real_size() };
        if real < size {
            return None;
        }

        let end = start + real;
        let payload = (end - size + BLOCK_HEADER_SIZE) & !(align - 1);
        let tail = payload - BLOCK_HEADER_SIZE;

        if tail >= start + MIN_BLOCK_SIZE {
            Some(Carve::Tail(end - tail))
        } else if (start + BLOCK_HEADER_SIZE) % align == 0 {
            Some(Carve::Whole)
        } else {
            None
        }
    }
}

impl FreeBlock {
    #[inline]
    pub fn from_block(block: NonNull<Block>) -> NonNull<FreeBlock> {
        block.cast()
    }

    #[inline]
    pub fn as_block(this: NonNull<FreeBlock>) -> NonNull<Block> {
        this.cast()
    }
}
