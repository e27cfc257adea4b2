use std::{
    cell::Cell,
    ptr::{self, NonNull},
};

use crate::{
    block::{ALIGNMENT, BLOCK_HEADER_SIZE, Block, Carve, Label, MIN_BLOCK_SIZE},
    config::Config,
    error::AllocError,
    freelist::FreeList,
    list::BlockList,
    mmap::PageSource,
    utils::{SCRIBBLE_BYTE, checked_align, fill},
};

/// The internal data structure of the allocator: both block lists, the
/// settings, and the source regions are mapped from.
///
/// Nothing in here locks. [`crate::MemAlloc`] owns one kernel behind a
/// mutex; a kernel can also be driven directly through `&mut self`.
pub struct Kernel<S: PageSource> {
    /// Every block of the heap, in address order within each region.
    pub(crate) blocks: BlockList,
    /// Free blocks, most recently freed first.
    pub(crate) free_list: FreeList,
    pub(crate) config: Config,
    pub(crate) source: S,
}

// Headers are only reachable through the kernel that owns their regions.
unsafe impl<S: PageSource + Send> Send for Kernel<S> {}

/// What a pointer handed to the kernel refers to.
enum Slot {
    Used(NonNull<Block>),
    /// Memory that was handed out and has been released since.
    Released,
}

/// What [`Kernel::allocate`] did to satisfy a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Allocation {
    pub payload: NonNull<u8>,
    /// Size of the block handed out, header included.
    pub block_size: usize,
    /// The block was carved off a larger free block.
    pub split: bool,
    /// A new region of this many bytes had to be mapped.
    pub mapped: Option<usize>,
}

/// What [`Kernel::release`] did with a block.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Release {
    /// Size of the released block, 0 for a null pointer.
    pub block_size: usize,
    /// Size of the free block it ended up in after coalescing.
    pub coalesced: usize,
    /// Its region became empty and this many bytes were unmapped.
    pub unmapped: Option<usize>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HeapStats {
    pub regions: usize,
    pub blocks: usize,
    pub used_blocks: usize,
    pub free_blocks: usize,
    pub used_bytes: usize,
    pub free_bytes: usize,
    pub mapped_bytes: usize,
}

impl<S: PageSource> Kernel<S> {
    pub fn new(source: S, config: Config) -> Self {
        Self {
            blocks: BlockList::new(),
            free_list: FreeList::new(),
            config,
            source,
        }
    }

    pub fn config(&self) -> Config {
        self.config
    }

    /// Block size (header + payload) needed to hold `size` bytes.
    pub fn block_size(size: usize) -> Result<usize, AllocError> {
        size.checked_add(BLOCK_HEADER_SIZE)
            .and_then(|actual| checked_align(actual, ALIGNMENT))
            .map(|aligned| aligned.max(MIN_BLOCK_SIZE))
            .ok_or(AllocError::InvalidArgument("allocation size overflows"))
    }

    /// Returns a payload of at least `size` bytes, aligned to [`ALIGNMENT`].
    pub fn allocate(&mut self, size: usize, label: &str) -> Result<Allocation, AllocError> {
        self.allocate_aligned(size, ALIGNMENT, label)
    }

    /// Returns a payload of at least `size` bytes whose address is a multiple
    /// of `align`. Alignments below [`ALIGNMENT`] are raised to it, and
    /// anything above the page size is refused.
    ///
    /// A free block is reused when the free list has one that fits. If not,
    /// a whole region is mapped. Either way, when the chosen block has room
    /// for another block the request is carved off its tail and the rest
    /// stays on the free list.
    pub fn allocate_aligned(&mut self, size: usize, align: usize, label: &str) -> Result<Allocation, AllocError> {
        if !align.is_power_of_two() {
            return Err(AllocError::InvalidArgument("alignment is not a power of two"));
        }
        if align > self.source.page_size() {
            return Err(AllocError::InvalidArgument("alignment above the page size"));
        }
        let align = align.max(ALIGNMENT);

        let label = Label::new(label)?;
        let needed = Self::block_size(size)?;

        let (found, mapped) = match self.free_list.find(self.config.strategy, needed, align) {
            Some(block) => (block, None),
            None => {
                let region = self.create_region(Self::region_size(needed, align)?)?;
                (region, Some(unsafe { region.as_ref().real_size() }))
            }
        };

        let carved = match Block::carve(found, needed, align) {
            Some(Carve::Tail(len)) => unsafe { self.split(found, len) },
            Some(Carve::Whole) => None,
            None => return Err(AllocError::OutOfMemory { requested: needed }),
        };

        let (mut block, split) = match carved {
            Some(tail) => (tail, true),
            None => unsafe {
                let mut whole = found;
                self.free_list.remove(whole);
                whole.as_mut().mark_used();
                (whole, false)
            },
        };

        let header = unsafe { block.as_mut() };
        header.label = label;
        let block_size = header.real_size();

        let payload = Block::payload(block);
        if self.config.scribble {
            unsafe { fill(payload, SCRIBBLE_BYTE, size) };
        }

        Ok(Allocation {
            payload,
            block_size,
            split,
            mapped,
        })
    }

    /// Bytes to map for a block of `needed` bytes aligned to `align`. Regions
    /// start on a page boundary, so an over aligned payload can only be
    /// placed past a leading block and some padding.
    fn region_size(needed: usize, align: usize) -> Result<usize, AllocError> {
        if align == ALIGNMENT {
            return Ok(needed);
        }

        needed
            .checked_add(align + MIN_BLOCK_SIZE)
            .ok_or(AllocError::InvalidArgument("allocation size overflows"))
    }

    /// Gives the block behind `ptr` back. A null pointer is a no-op.
    ///
    /// The block is pushed on the free list, merged with any free neighbors
    /// of its region, and the region is unmapped if nothing in it is used
    /// anymore.
    ///
    /// Pointers that were never handed out are rejected with
    /// [`AllocError::UnknownPointer`], released ones with
    /// [`AllocError::DoubleFree`]. Neither is dereferenced.
    ///
    /// **SAFETY**: nothing may use the payload behind `ptr` afterwards.
    pub unsafe fn release(&mut self, ptr: *mut u8) -> Result<Release, AllocError> {
        let Some(ptr) = NonNull::new(ptr) else {
            return Ok(Release::default());
        };

        let Slot::Used(block) = self.locate(ptr)? else {
            return Err(AllocError::DoubleFree {
                addr: ptr.as_ptr() as usize,
            });
        };
        let block_size = unsafe { block.as_ref().real_size() };

        unsafe {
            self.free_list.insert(block);
            let survivor = self.merge(block);
            let coalesced = survivor.as_ref().real_size();

            let unmapped = if self.spans_region(survivor) {
                Some(self.destroy_region(survivor))
            } else {
                None
            };

            Ok(Release {
                block_size,
                coalesced,
                unmapped,
            })
        }
    }

    /// [`Kernel::allocate`] for `count * size` bytes, zeroed.
    pub fn zero_allocate(&mut self, count: usize, size: usize, label: &str) -> Result<Allocation, AllocError> {
        let total = count
            .checked_mul(size)
            .ok_or(AllocError::InvalidArgument("allocation size overflows"))?;

        let allocation = self.allocate(total, label)?;
        unsafe { fill(allocation.payload, 0, total) };

        Ok(allocation)
    }

    /// Moves the payload behind `ptr` into a new block of `new_size` bytes.
    ///
    /// A null `ptr` allocates, a zero `new_size` releases and returns `None`.
    /// The old block is only released once the new one exists, so on error
    /// `ptr` is still valid.
    ///
    /// **SAFETY**: same as [`Kernel::release`].
    pub unsafe fn resize(
        &mut self,
        ptr: *mut u8,
        new_size: usize,
        label: &str,
    ) -> Result<Option<NonNull<u8>>, AllocError> {
        let Some(old) = NonNull::new(ptr) else {
            return self.allocate(new_size, label).map(|a| Some(a.payload));
        };

        if new_size == 0 {
            unsafe { self.release(ptr)? };
            return Ok(None);
        }

        let old_size = self.usable_size(old)?;
        let new = self.allocate(new_size, label)?.payload;

        unsafe {
            ptr::copy_nonoverlapping(old.as_ptr(), new.as_ptr(), old_size.min(new_size));
            self.release(ptr)?;
        }

        Ok(Some(new))
    }

    /// Payload capacity of the used block behind `ptr`.
    pub fn usable_size(&self, ptr: NonNull<u8>) -> Result<usize, AllocError> {
        match self.locate(ptr)? {
            Slot::Used(block) => Ok(unsafe { block.as_ref().payload_size() }),
            Slot::Released => Err(AllocError::UseAfterFree {
                addr: ptr.as_ptr() as usize,
            }),
        }
    }

    /// Finds what `ptr` refers to by walking the block list, so nothing
    /// outside the live regions is ever read. A payload of a used block is
    /// ours. Anything inside a free block was ours once: either the block
    /// itself or one it has since been merged into. Everything else is
    /// unknown, including pointers into regions that have been unmapped.
    fn locate(&self, ptr: NonNull<u8>) -> Result<Slot, AllocError> {
        let addr = ptr.as_ptr() as usize;
        let unknown = AllocError::UnknownPointer { addr };

        if addr % ALIGNMENT != 0 {
            return Err(unknown);
        }

        for block in &self.blocks {
            let start = block.as_ptr() as usize;
            if addr < start || addr >= Block::end(block) as usize {
                continue;
            }

            let header = unsafe { block.as_ref() };
            debug_assert!(header.has_magic());

            return if header.is_free() {
                Ok(Slot::Released)
            } else if addr == start + BLOCK_HEADER_SIZE {
                Ok(Slot::Used(block))
            } else {
                Err(unknown)
            };
        }

        Err(unknown)
    }

    /// Walks the block list and adds everything up.
    pub fn stats(&self) -> HeapStats {
        let mut stats = HeapStats::default();

        for block in &self.blocks {
            let header = unsafe { block.as_ref() };
            let size = header.real_size();

            stats.blocks += 1;
            stats.mapped_bytes += size;
            if header.region == block {
                stats.regions += 1;
            }
            if header.is_free() {
                stats.free_blocks += 1;
                stats.free_bytes += size;
            } else {
                stats.used_blocks += 1;
                stats.used_bytes += size;
            }
        }

        stats
    }
}

impl<S: PageSource> Drop for Kernel<S> {
    /// Unmaps every region, used blocks included.
    fn drop(&mut self) {
        let mut current = self.blocks.first();

        while let Some(head) = current {
            let mut len = 0;
            let mut cursor = Some(head);

            while let Some(block) = cursor {
                let header = unsafe { block.as_ref() };
                if header.region != head {
                    break;
                }
                len += header.real_size();
                cursor = header.next;
            }

            current = cursor;
            unsafe { self.source.unmap(head.cast(), len) };
        }
    }
}

thread_local! {
    /// Set while this thread is logging an event. A logger that allocates
    /// comes back into the allocator, and anything that happens then is not
    /// logged.
    static LOGGING: Cell<bool> = const { Cell::new(false) };
}

fn with_logging(emit: impl FnOnce()) {
    let entered = LOGGING.try_with(|logging| !logging.replace(true)).unwrap_or(false);
    if !entered {
        return;
    }
    emit();
    let _ = LOGGING.try_with(|logging| logging.set(false));
}

impl Allocation {
    /// Must not be called with the heap locked.
    pub(crate) fn log(&self, size: usize) {
        with_logging(|| {
            if let Some(len) = self.mapped {
                log::debug!("mapped region of {len} bytes for a {size} byte request");
            }
            log::trace!(
                "allocated {} bytes at {:p} (block {}, split: {})",
                size,
                self.payload,
                self.block_size,
                self.split
            );
        });
    }
}

impl Release {
    /// Must not be called with the heap locked.
    pub(crate) fn log(&self, ptr: *mut u8) {
        with_logging(|| {
            log::trace!(
                "released {:p} (block {}, coalesced into {})",
                ptr,
                self.block_size,
                self.coalesced
            );
            if let Some(len) = self.unmapped {
                log::debug!("unmapped region of {len} bytes");
            }
        });
    }
}

/// Must not be called with the heap locked.
pub(crate) fn log_error(operation: &str, err: &AllocError) {
    with_logging(|| log::warn!("{operation} failed: {err}"));
}
