//! Where regions come from.
//!
//! The allocator's top level view of memory has nothing to do with the
//! concrete APIs offered by each kernel, it only needs to be able to ask
//! for zeroed pages and give them back. [`PageSource`] is that capability;
//! [`Os`] implements it with `mmap`/`munmap` on unix and
//! `VirtualAlloc`/`VirtualFree` on windows.

use std::ptr::NonNull;

/// Low level memory operations needed by [`crate::kernel::Kernel`].
pub trait PageSource {
    /// Virtual memory page size in bytes. Must be a power of two.
    fn page_size(&self) -> usize;

    /// Requests a zero initialised, read-write memory region of `len` bytes,
    /// `len` being a multiple of [`PageSource::page_size`]. It returns a
    /// pointer to the region or `None` if the underlying syscall fails.
    ///
    /// **SAFETY**: the returned memory is owned by the caller until it is
    /// handed back through [`PageSource::unmap`].
    unsafe fn map(&self, len: usize) -> Option<NonNull<u8>>;

    /// Returns the memory of size `len` starting from `addr` back to the kernel.
    ///
    /// **SAFETY**: `addr` and `len` must describe exactly one region obtained
    /// from [`PageSource::map`] on this source, and nothing may use it afterwards.
    unsafe fn unmap(&self, addr: NonNull<u8>, len: usize);
}

impl<P: PageSource + ?Sized> PageSource for &P {
    fn page_size(&self) -> usize {
        (**self).page_size()
    }

    unsafe fn map(&self, len: usize) -> Option<NonNull<u8>> {
        unsafe { (**self).map(len) }
    }

    unsafe fn unmap(&self, addr: NonNull<u8>, len: usize) {
        unsafe { (**self).unmap(addr, len) }
    }
}

/// Pages straight from the operating system.
#[derive(Debug, Clone, Copy)]
pub struct Os {
    page_size: usize,
}

impl Os {
    pub fn new() -> Self {
        Self {
            page_size: unsafe { Self::query_page_size() },
        }
    }
}

impl Default for Os {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(unix)]
mod unix {
    use super::{Os, PageSource};

    use libc::{mmap, munmap, off_t, size_t};

    use std::{
        os::raw::{c_int, c_void},
        ptr::NonNull,
    };

    impl Os {
        pub(super) unsafe fn query_page_size() -> usize {
            unsafe { libc::sysconf(libc::_SC_PAGE_SIZE) as usize }
        }
    }

    impl PageSource for Os {
        fn page_size(&self) -> usize {
            self.page_size
        }

        unsafe fn map(&self, len: usize) -> Option<NonNull<u8>> {
            // mmap parameters.
            const ADDR: *mut c_void = std::ptr::null_mut::<c_void>();
            // Read-Write only memory.
            const PROT: c_int = libc::PROT_READ | libc::PROT_WRITE;
            const FLAGS: c_int = libc::MAP_PRIVATE | libc::MAP_ANONYMOUS;
            const FD: c_int = -1;
            const OFFSET: off_t = 0;

            unsafe {
                match mmap(ADDR, len as size_t, PROT, FLAGS, FD, OFFSET) {
                    libc::MAP_FAILED => None,
                    addr => NonNull::new(addr.cast::<u8>()),
                }
            }
        }

        unsafe fn unmap(&self, addr: NonNull<u8>, len: usize) {
            unsafe {
                munmap(addr.as_ptr().cast::<c_void>(), len as size_t);
            }
        }
    }
}

#[cfg(windows)]
mod windows {
    use std::{ffi::c_void, mem::MaybeUninit, ptr::NonNull};

    use super::{Os, PageSource};

    use windows::Win32::System::{Memory, SystemInformation};

    impl Os {
        pub(super) unsafe fn query_page_size() -> usize {
            unsafe {
                let mut system_info = MaybeUninit::uninit();
                SystemInformation::GetSystemInfo(system_info.as_mut_ptr());

                system_info.assume_init().dwPageSize as usize
            }
        }
    }

    impl PageSource for Os {
        fn page_size(&self) -> usize {
            self.page_size
        }

        unsafe fn map(&self, len: usize) -> Option<NonNull<u8>> {
            // Read-Write only.
            let protection = Memory::PAGE_READWRITE;

            let flags = Memory::MEM_RESERVE | Memory::MEM_COMMIT;

            unsafe {
                let addr = Memory::VirtualAlloc(None, len, flags, protection);

                NonNull::new(addr.cast())
            }
        }

        unsafe fn unmap(&self, addr: NonNull<u8>, _len: usize) {
            unsafe {
                let _ = Memory::VirtualFree(addr.as_ptr().cast::<c_void>(), 0, Memory::MEM_RELEASE);
            }
        }
    }
}
