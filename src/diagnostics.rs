//! Memory state dump and leak check.
//!
//! Both walk the lists read-only. They render through [`fmt::Write`] so the
//! same code serves tests (a `String`) and [`crate::MemAlloc`] (a [`Fd`]
//! writer, which goes straight to `write(2)` and never allocates, as the
//! heap is locked while we render).

use std::{
    fmt::{self, Write},
    io,
};

use crate::{block::Block, kernel::Kernel, mmap::PageSource};

/// Blocks still in use and the bytes they hold, headers included.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LeakSummary {
    pub blocks: usize,
    pub bytes: usize,
}

impl LeakSummary {
    pub fn is_empty(&self) -> bool {
        self.blocks == 0
    }
}

impl<S: PageSource> Kernel<S> {
    /// Prints out the current memory state, including both the regions and
    /// blocks, followed by the list of free blocks (in the order they were
    /// freed):
    ///
    /// ```text
    /// -- Current Memory State --
    /// [REGION 0x7f0d774e7000]
    ///   [BLOCK 0x7f0d774e7000-0x7f0d774e7e90] 3728    [FREE]  ''
    ///   [BLOCK 0x7f0d774e7e90-0x7f0d774e8000] 368     [USED]  'First Allocation'
    ///
    /// -- Free List --
    /// [0x7f0d774e7000] -> NULL
    /// ```
    pub fn write_state<W: Write>(&self, out: &mut W) -> fmt::Result {
        writeln!(out, "-- Current Memory State --")?;

        for block in &self.blocks {
            let header = unsafe { block.as_ref() };

            if header.region == block {
                writeln!(out, "[REGION {:p}]", block)?;
            }

            writeln!(
                out,
                "  [BLOCK {:p}-{:p}] {}\t[{}]\t'{}'",
                block,
                Block::end(block),
                header.real_size(),
                header.state().as_str(),
                header.label.as_str()
            )?;
        }

        writeln!(out)?;
        writeln!(out, "-- Free List --")?;
        for block in self.free_list.iter() {
            write!(out, "[{:p}] -> ", block)?;
        }
        writeln!(out, "NULL")
    }

    /// Every block still marked used.
    pub fn leaks(&self) -> LeakSummary {
        self.blocks
            .iter()
            .map(|block| unsafe { block.as_ref() })
            .filter(|header| !header.is_free())
            .fold(LeakSummary::default(), |summary, header| LeakSummary {
                blocks: summary.blocks + 1,
                bytes: summary.bytes + header.real_size(),
            })
    }

    /// Scans through the current memory state and reports leaks (blocks
    /// that are not free). Meant to run at the end of a program:
    ///
    /// ```text
    /// -- Leak Check --
    /// [BLOCK 0x7f0d774e7e90] 368     'First Allocation'
    ///
    /// -- Summary --
    /// 1 blocks lost (368 bytes)
    /// ```
    ///
    /// Returns whether anything leaked.
    pub fn write_leaks<W: Write>(&self, out: &mut W) -> Result<bool, fmt::Error> {
        writeln!(out, "-- Leak Check --")?;

        for block in &self.blocks {
            let header = unsafe { block.as_ref() };
            if header.is_free() {
                continue;
            }
            writeln!(
                out,
                "[BLOCK {:p}] {}\t'{}'",
                block,
                header.real_size(),
                header.label.as_str()
            )?;
        }

        let summary = self.leaks();
        writeln!(out)?;
        writeln!(out, "-- Summary --")?;
        writeln!(out, "{} blocks lost ({} bytes)", summary.blocks, summary.bytes)?;

        Ok(!summary.is_empty())
    }
}

/// Upper bound of the bytes [`Kernel::write_state`] or
/// [`Kernel::write_leaks`] produce for a heap of `blocks` blocks.
pub(crate) fn render_size(blocks: usize) -> usize {
    // A block line with a full label, its region line and its free list
    // entry stay well below this.
    const PER_BLOCK: usize = 192;
    const HEADINGS: usize = 128;

    blocks.saturating_mul(PER_BLOCK).saturating_add(HEADINGS)
}

/// [`fmt::Write`] into a fixed byte buffer. A write that does not fit fails
/// as a whole, so the contents are always complete lines of text.
pub(crate) struct Buffer<'a> {
    bytes: &'a mut [u8],
    len: usize,
}

impl<'a> Buffer<'a> {
    pub fn new(bytes: &'a mut [u8]) -> Self {
        Self { bytes, len: 0 }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes[..self.len]
    }
}

impl Write for Buffer<'_> {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        let end = self.len + s.len();
        let dest = self.bytes.get_mut(self.len..end).ok_or(fmt::Error)?;

        dest.copy_from_slice(s.as_bytes());
        self.len = end;

        Ok(())
    }
}

/// [`fmt::Write`] over a raw file descriptor.
pub struct Fd(pub libc::c_int);

impl Fd {
    pub fn stdout() -> Self {
        Self(1)
    }

    pub fn stderr() -> Self {
        Self(2)
    }

    pub fn write_all(&mut self, bytes: &[u8]) -> fmt::Result {
        write_all(bytes, |rest| {
            let written = unsafe { libc::write(self.0, rest.as_ptr().cast(), rest.len() as _) };
            if written < 0 {
                Err(io::Error::last_os_error())
            } else {
                Ok(written as usize)
            }
        })
    }
}

impl Write for Fd {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        self.write_all(s.as_bytes())
    }
}

/// Feeds `bytes` to `write` until all of them are taken, retrying when a
/// signal interrupts the call.
fn write_all(mut bytes: &[u8], mut write: impl FnMut(&[u8]) -> io::Result<usize>) -> fmt::Result {
    while !bytes.is_empty() {
        match write(bytes) {
            Ok(0) => return Err(fmt::Error),
            Ok(written) => bytes = &bytes[written..],
            Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
            Err(_) => return Err(fmt::Error),
        }
    }

    Ok(())
}
