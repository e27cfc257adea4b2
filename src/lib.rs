//! General purpose memory allocator built directly on top of the
//! operating system's virtual memory mappings.
//!
//! Memory is requested from the kernel in page sized regions and
//! handed out as blocks carved from them. Every block carries a header:
//!
//! ```text
//! +--------------------------------+
//! | Header   | Actual memory block |
//! +--------------------------------+
//! ```
//!
//! The returned pointer is at the start of the memory block. Released
//! blocks go on a free list, are merged with free neighbors, and a region
//! is unmapped as soon as nothing in it is used.
//!
//! [`MemAlloc`] is the process-wide entry point: one heap behind one lock.
//! It can be installed with `#[global_allocator]` or called directly with
//! debug labels, which show up in [`MemAlloc::print_memory`] and
//! [`MemAlloc::check_leaks`].

use std::{
    alloc::{GlobalAlloc, Layout},
    fmt::{self, Write},
    ptr::{self, NonNull},
    slice,
};

use spin::{Mutex, Once};

pub mod block;
pub mod config;
pub mod diagnostics;
pub mod error;
mod freelist;
pub mod kernel;
mod list;
pub mod mmap;
mod region;
pub mod utils;

pub use block::{ALIGNMENT, BLOCK_HEADER_SIZE, LABEL_MAX, MIN_BLOCK_SIZE};
pub use config::{Config, FitStrategy};
pub use diagnostics::LeakSummary;
pub use error::AllocError;
pub use kernel::{HeapStats, Kernel};
pub use mmap::{Os, PageSource};

use diagnostics::{Buffer, Fd};
use utils::checked_align;

/// Thread safe allocator over a single shared heap.
///
/// Every operation takes the heap lock for the duration of its list
/// manipulation only. Logging happens after the lock is released.
pub struct MemAlloc {
    kernel: Once<Mutex<Kernel<Os>>>,
    /// Settings to use instead of the environment.
    config: Option<Config>,
}

impl MemAlloc {
    /// Allocator configured from the environment, see [`Config::from_env`].
    /// Nothing is read or mapped until the first call.
    pub const fn new() -> Self {
        Self {
            kernel: Once::new(),
            config: None,
        }
    }

    pub const fn with_config(config: Config) -> Self {
        Self {
            kernel: Once::new(),
            config: Some(config),
        }
    }

    fn kernel(&self) -> &Mutex<Kernel<Os>> {
        self.kernel.call_once(|| {
            let config = self.config.unwrap_or_else(Config::from_env);
            Mutex::new(Kernel::new(Os::new(), config))
        })
    }

    pub fn config(&self) -> Config {
        self.kernel().lock().config()
    }

    /// Returns a payload of at least `size` bytes, aligned to [`ALIGNMENT`].
    pub fn allocate(&self, size: usize, label: &str) -> Result<NonNull<u8>, AllocError> {
        self.allocate_aligned(size, ALIGNMENT, label)
    }

    /// Like [`MemAlloc::allocate`] with the payload aligned to `align`, which
    /// must be a power of two no larger than the page size.
    pub fn allocate_aligned(&self, size: usize, align: usize, label: &str) -> Result<NonNull<u8>, AllocError> {
        let result = self.kernel().lock().allocate_aligned(size, align, label);

        match result {
            Ok(allocation) => {
                allocation.log(size);
                Ok(allocation.payload)
            }
            Err(err) => {
                kernel::log_error("allocate", &err);
                Err(err)
            }
        }
    }

    /// Like [`MemAlloc::allocate`] for `count * size` bytes, all zeroed.
    pub fn zero_allocate(&self, count: usize, size: usize, label: &str) -> Result<NonNull<u8>, AllocError> {
        let result = self.kernel().lock().zero_allocate(count, size, label);

        match result {
            Ok(allocation) => {
                allocation.log(count.saturating_mul(size));
                Ok(allocation.payload)
            }
            Err(err) => {
                kernel::log_error("zero_allocate", &err);
                Err(err)
            }
        }
    }

    /// Gives back a payload. Releasing null does nothing.
    ///
    /// # Safety
    ///
    /// `ptr` must be null or a payload returned by this allocator that has
    /// not been released yet. Releasing twice, or releasing a pointer from
    /// elsewhere, is reported as an error unless the memory has been handed
    /// out again in the meantime.
    pub unsafe fn release(&self, ptr: *mut u8) -> Result<(), AllocError> {
        let result = unsafe { self.kernel().lock().release(ptr) };

        match result {
            Ok(release) => {
                if !ptr.is_null() {
                    release.log(ptr);
                }
                Ok(())
            }
            Err(err) => {
                kernel::log_error("release", &err);
                Err(err)
            }
        }
    }

    /// Moves the payload behind `ptr` to a block of `new_size` bytes.
    ///
    /// A null `ptr` allocates. A `new_size` of zero releases `ptr` and
    /// returns `None`. Otherwise a new block is allocated, the contents are
    /// copied, and the old block is released, each step taking the lock on
    /// its own. On error `ptr` is left untouched.
    ///
    /// # Safety
    ///
    /// Same as [`MemAlloc::release`].
    pub unsafe fn resize(&self, ptr: *mut u8, new_size: usize, label: &str) -> Result<Option<NonNull<u8>>, AllocError> {
        unsafe { self.resize_aligned(ptr, new_size, ALIGNMENT, label) }
    }

    /// [`MemAlloc::resize`] into a payload aligned to `align`.
    ///
    /// # Safety
    ///
    /// Same as [`MemAlloc::release`].
    pub unsafe fn resize_aligned(
        &self,
        ptr: *mut u8,
        new_size: usize,
        align: usize,
        label: &str,
    ) -> Result<Option<NonNull<u8>>, AllocError> {
        let Some(old) = NonNull::new(ptr) else {
            return self.allocate_aligned(new_size, align, label).map(Some);
        };

        if new_size == 0 {
            unsafe { self.release(ptr)? };
            return Ok(None);
        }

        let old_size = self.kernel().lock().usable_size(old);
        let old_size = old_size.inspect_err(|err| kernel::log_error("resize", err))?;

        let new = self.allocate_aligned(new_size, align, label)?;
        unsafe {
            ptr::copy_nonoverlapping(old.as_ptr(), new.as_ptr(), old_size.min(new_size));
            self.release(ptr)?;
        }

        Ok(Some(new))
    }

    pub fn stats(&self) -> HeapStats {
        self.kernel().lock().stats()
    }

    pub fn leaks(&self) -> LeakSummary {
        self.kernel().lock().leaks()
    }

    /// Renders the memory state into `out`. The heap stays locked while
    /// `out` is written to, so `out` must not allocate through this
    /// allocator.
    pub fn write_memory_state<W: Write>(&self, out: &mut W) -> fmt::Result {
        self.kernel().lock().write_state(out)
    }

    /// Renders the leak report into `out`, see [`MemAlloc::write_memory_state`].
    pub fn write_leak_check<W: Write>(&self, out: &mut W) -> Result<bool, fmt::Error> {
        self.kernel().lock().write_leaks(out)
    }

    /// Prints the memory state to stdout.
    pub fn print_memory(&self) {
        self.print(|kernel, out| kernel.write_state(out));
    }

    /// Prints the leak report to stdout and returns whether anything leaked.
    /// Usually called once, right before the process exits.
    pub fn check_leaks(&self) -> bool {
        self.print(|kernel, out| kernel.write_leaks(out))
            .unwrap_or_else(|| !self.leaks().is_empty())
    }

    /// Renders with the heap locked into pages mapped for the occasion, then
    /// writes them to stdout once the lock is released. The pages are sized
    /// from the current block count and doubled if the heap grew meanwhile.
    fn print<R>(&self, render: impl Fn(&Kernel<Os>, &mut Buffer<'_>) -> Result<R, fmt::Error>) -> Option<R> {
        const ATTEMPTS: usize = 4;

        let os = Os::new();
        let mut len = diagnostics::render_size(self.stats().blocks);

        for _ in 0..ATTEMPTS {
            len = checked_align(len, os.page_size())?;
            let pages = unsafe { os.map(len) }?;
            let mut buffer = Buffer::new(unsafe { slice::from_raw_parts_mut(pages.as_ptr(), len) });

            let rendered = render(&self.kernel().lock(), &mut buffer);
            if rendered.is_ok() {
                let _ = Fd::stdout().write_all(buffer.as_bytes());
            }

            unsafe { os.unmap(pages, len) };
            match rendered {
                Ok(result) => return Some(result),
                Err(_) => len = len.checked_mul(2)?,
            }
        }

        None
    }
}

impl Default for MemAlloc {
    fn default() -> Self {
        Self::new()
    }
}

/// The heap has been handed something it never owned. Carrying on would
/// corrupt it, so report without allocating and stop.
fn abort_on(err: AllocError) -> ! {
    let _ = writeln!(Fd::stderr(), "memalloc: {err}");
    std::process::abort()
}

/// `Layout`s aligned above the page size are refused. Double frees, use
/// after free and foreign pointers abort the process.
unsafe impl GlobalAlloc for MemAlloc {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        self.allocate_aligned(layout.size(), layout.align(), "")
            .map_or(ptr::null_mut(), NonNull::as_ptr)
    }

    unsafe fn alloc_zeroed(&self, layout: Layout) -> *mut u8 {
        if layout.align() <= ALIGNMENT {
            return self.zero_allocate(1, layout.size(), "").map_or(ptr::null_mut(), NonNull::as_ptr);
        }

        match self.allocate_aligned(layout.size(), layout.align(), "") {
            Ok(payload) => {
                unsafe { utils::fill(payload, 0, layout.size()) };
                payload.as_ptr()
            }
            Err(_) => ptr::null_mut(),
        }
    }

    unsafe fn dealloc(&self, ptr: *mut u8, _layout: Layout) {
        if let Err(err) = unsafe { self.release(ptr) } {
            abort_on(err);
        }
    }

    unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
        match unsafe { self.resize_aligned(ptr, new_size, layout.align(), "") } {
            Ok(Some(new)) => new.as_ptr(),
            Ok(None) => ptr::null_mut(),
            Err(err) if err.is_fatal() => abort_on(err),
            Err(_) => ptr::null_mut(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{sync::Arc, thread};

    use test_env_log::test;

    fn allocator() -> MemAlloc {
        MemAlloc::with_config(Config::default())
    }

    #[test]
    fn basic_alloc() {
        let allocator = allocator();
        unsafe {
            // Allocated space for unsigned 32 bit integer.
            let block = allocator.allocate(4, "u32").unwrap().cast::<u32>();
            *block.as_ptr() = 23;
            assert_eq!(23, *block.as_ptr());

            allocator.release(block.as_ptr().cast()).unwrap();
        }
        assert!(!allocator.check_leaks());
    }

    #[test]
    fn space_for_free_block_is_used() {
        let allocator = allocator();
        unsafe {
            let _keep = allocator.allocate(4, "keep").unwrap();
            let first_block = allocator.allocate(4, "first").unwrap();
            let _ = allocator.allocate(8, "fence").unwrap();

            allocator.release(first_block.as_ptr()).unwrap();

            let second_block = allocator.allocate(4, "second").unwrap();

            assert_eq!(first_block, second_block);
        }
    }

    #[test]
    fn config_is_pinned() {
        let allocator = MemAlloc::with_config(Config::new(FitStrategy::Worst, true));
        assert_eq!(FitStrategy::Worst, allocator.config().strategy);

        let ptr = allocator.allocate(32, "").unwrap();
        let bytes = unsafe { std::slice::from_raw_parts(ptr.as_ptr(), 32) };
        assert!(bytes.iter().all(|&b| b == utils::SCRIBBLE_BYTE));
    }

    #[test]
    fn errors_reach_the_caller() {
        let allocator = allocator();
        let ptr = allocator.allocate(64, "x").unwrap();
        let _fence = allocator.allocate(64, "fence").unwrap();

        unsafe {
            allocator.release(ptr.as_ptr()).unwrap();
            assert_eq!(
                Err(AllocError::DoubleFree { addr: ptr.as_ptr() as usize }),
                allocator.release(ptr.as_ptr())
            );
            let err = allocator.resize(ptr.as_ptr(), 128, "").unwrap_err();
            assert_eq!(AllocError::UseAfterFree { addr: ptr.as_ptr() as usize }, err);
            assert!(err.is_fatal());
        }

        assert_eq!(
            Err(AllocError::InvalidArgument("label too long")),
            allocator.allocate(8, &"l".repeat(LABEL_MAX + 1))
        );
    }

    #[test]
    fn resize_keeps_contents() {
        let allocator = allocator();
        unsafe {
            let ptr = allocator.allocate(5, "short").unwrap();
            ptr.as_ptr().copy_from_nonoverlapping(b"hello".as_ptr(), 5);

            let grown = allocator.resize(ptr.as_ptr(), 5000, "long").unwrap().unwrap();
            assert_eq!(b"hello", &*grown.as_ptr().cast::<[u8; 5]>());

            assert_eq!(None, allocator.resize(grown.as_ptr(), 0, "").unwrap());
        }
        assert_eq!(0, allocator.stats().regions);
    }

    #[test]
    fn global_alloc_interface() {
        let allocator = allocator();
        unsafe {
            let layout = Layout::array::<u64>(16).unwrap();
            let ptr = allocator.alloc_zeroed(layout);
            assert!(!ptr.is_null());
            assert!(std::slice::from_raw_parts(ptr, layout.size()).iter().all(|&b| b == 0));

            let ptr = allocator.realloc(ptr, layout, 4096);
            assert!(!ptr.is_null());
            allocator.dealloc(ptr, Layout::from_size_align(4096, 8).unwrap());

            assert!(allocator.alloc(Layout::from_size_align(64, 1 << 30).unwrap()).is_null());
        }
        assert_eq!(LeakSummary::default(), allocator.leaks());
    }

    #[test]
    fn over_aligned_layouts() {
        let allocator = allocator();
        unsafe {
            let layout = Layout::from_size_align(512, 128).unwrap();
            let ptr = allocator.alloc(layout);
            assert!(!ptr.is_null());
            assert_eq!(0, ptr as usize % 128);
            ptr.write_bytes(1, 512);

            let zeroed = allocator.alloc_zeroed(Layout::from_size_align(256, 64).unwrap());
            assert!(!zeroed.is_null());
            assert_eq!(0, zeroed as usize % 64);
            assert!(std::slice::from_raw_parts(zeroed, 256).iter().all(|&b| b == 0));

            let grown = allocator.realloc(ptr, layout, 2048);
            assert!(!grown.is_null());
            assert_eq!(0, grown as usize % 128);
            assert!(std::slice::from_raw_parts(grown, 512).iter().all(|&b| b == 1));

            let page = Layout::from_size_align(100, 4096).unwrap();
            let paged = allocator.alloc(page);
            assert_eq!(0, paged as usize % 4096);

            allocator.dealloc(grown, Layout::from_size_align(2048, 128).unwrap());
            allocator.dealloc(zeroed, Layout::from_size_align(256, 64).unwrap());
            allocator.dealloc(paged, page);
        }
        assert_eq!(HeapStats::default(), allocator.stats());
    }

    #[test]
    fn channels_work_on_top_of_the_heap() {
        // mpsc allocates cache padded, 128 byte aligned blocks.
        let allocator = allocator();
        let layout = Layout::from_size_align(512, 128).unwrap();
        let ptrs: Vec<_> = (0..8).map(|_| unsafe { allocator.alloc(layout) }).collect();

        assert!(ptrs.iter().all(|ptr| !ptr.is_null() && *ptr as usize % 128 == 0));
        for ptr in ptrs {
            unsafe { allocator.dealloc(ptr, layout) };
        }
        assert_eq!(0, allocator.stats().regions);
    }

    #[test]
    fn releasing_the_latest_allocation_twice() {
        let allocator = allocator();
        let _keep = allocator.allocate(64, "keep").unwrap();
        let ptr = allocator.allocate(64, "x").unwrap();

        unsafe {
            allocator.release(ptr.as_ptr()).unwrap();
            assert_eq!(
                Err(AllocError::DoubleFree { addr: ptr.as_ptr() as usize }),
                allocator.release(ptr.as_ptr())
            );
        }
        assert_eq!(1, allocator.leaks().blocks);
    }

    #[test]
    fn releasing_the_only_allocation_twice() {
        let allocator = allocator();
        let ptr = allocator.allocate(64, "only").unwrap();

        unsafe {
            allocator.release(ptr.as_ptr()).unwrap();
            assert_eq!(0, allocator.stats().regions);

            let err = allocator.release(ptr.as_ptr()).unwrap_err();
            assert_eq!(AllocError::UnknownPointer { addr: ptr.as_ptr() as usize }, err);
            assert!(err.is_fatal());
        }
    }

    #[test]
    fn print_memory_renders_large_heaps() {
        let allocator = allocator();
        let label = "y".repeat(LABEL_MAX);
        for i in 0..100 {
            allocator.allocate(i * 10, &label).unwrap();
        }

        allocator.print_memory();
        assert!(allocator.check_leaks());
        assert!(allocator.kernel().try_lock().is_some());
    }

    #[test]
    fn concurrent_callers_share_one_heap() {
        let allocator = Arc::new(allocator());

        let handles: Vec<_> = (0..4)
            .map(|t| {
                let allocator = Arc::clone(&allocator);
                thread::spawn(move || {
                    for i in 0..200 {
                        let size = 16 + (i * 37 + t * 11) % 700;
                        let ptr = allocator.allocate(size, "worker").unwrap();
                        unsafe {
                            ptr.as_ptr().write_bytes(t as u8, size);
                            assert_eq!(t as u8, *ptr.as_ptr().add(size - 1));
                            allocator.release(ptr.as_ptr()).unwrap();
                        }
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(HeapStats::default(), allocator.stats());
    }
}
