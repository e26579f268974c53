//! The memory mapping of a loaded image
use crate::{
    Result,
    mmap::{Mmap, ProtFlags},
};
use alloc::vec::Vec;
use core::{ffi::c_void, fmt::Debug, ptr::NonNull};
use elf::abi::{PF_R, PF_W, PF_X};

/// A `PT_LOAD` segment as placed in memory.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Segment {
    /// Offset of the segment from the image base.
    pub vaddr: usize,
    /// Bytes copied from the file.
    pub file_size: usize,
    /// Bytes occupied in memory; the tail past `file_size` is zero-filled.
    pub mem_size: usize,
    /// Protection the segment asks for.
    pub prot: ProtFlags,
}

impl Segment {
    #[inline]
    pub fn end(&self) -> usize {
        self.vaddr + self.mem_size
    }

    #[inline]
    pub(crate) fn contains(&self, vaddr: usize, len: usize) -> bool {
        vaddr >= self.vaddr && vaddr.saturating_add(len) <= self.end()
    }
}

/// A page-aligned range of the image and the protection it ends up with.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct ProtRange {
    pub start: usize,
    pub end: usize,
    pub prot: ProtFlags,
}

#[inline]
pub(crate) const fn page_down(value: usize, page: usize) -> usize {
    value & !(page - 1)
}

#[inline]
pub(crate) const fn page_up(value: usize, page: usize) -> usize {
    (value + page - 1) & !(page - 1)
}

/// Computes the final protection of every page in `[start, end)`.
///
/// A page shared by two segments gets the union of their protections, pages no
/// segment touches get none, and the pages wholly inside `relro` are read-only.
pub(crate) fn plan_protections(
    start: usize,
    end: usize,
    page: usize,
    segments: &[Segment],
    relro: Option<(usize, usize)>,
) -> Vec<ProtRange> {
    let relro = relro.map(|(vaddr, size)| (page_down(vaddr, page), page_down(vaddr + size, page)));
    let mut ranges: Vec<ProtRange> = Vec::new();
    let mut cur = start;
    while cur < end {
        let next = cur + page;
        let mut prot = segments
            .iter()
            .filter(|seg| seg.mem_size != 0)
            .filter(|seg| page_down(seg.vaddr, page) < next && page_up(seg.end(), page) > cur)
            .fold(ProtFlags::PROT_NONE, |acc, seg| acc | seg.prot);
        if let Some((relro_start, relro_end)) = relro {
            if cur >= relro_start && next <= relro_end {
                prot = ProtFlags::PROT_READ;
            }
        }
        match ranges.last_mut() {
            Some(last) if last.prot == prot && last.end == cur => last.end = next,
            _ => ranges.push(ProtRange {
                start: cur,
                end: next,
                prot,
            }),
        }
        cur = next;
    }
    ranges
}

/// The memory mapping of an image.
///
/// Offsets taken by the accessors are image virtual addresses: the image base
/// plus the offset is the address in memory. Every accessor checks that the
/// requested bytes lie inside the mapped span.
pub struct ImageSegments {
    /// Start of the region returned by the system, including alignment slack.
    memory: NonNull<c_void>,
    map_len: usize,
    base: usize,
    /// First mapped virtual address (page aligned).
    start: usize,
    /// Mapped span length starting at `start`.
    len: usize,
    page_size: usize,
    munmap: unsafe fn(NonNull<c_void>, usize) -> Result<()>,
    mprotect: unsafe fn(NonNull<c_void>, usize, ProtFlags) -> Result<()>,
    flush: unsafe fn(usize, usize),
}

impl Debug for ImageSegments {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ImageSegments")
            .field("memory", &self.memory)
            .field("base", &format_args!("0x{:x}", self.base))
            .field("start", &self.start)
            .field("len", &self.len)
            .finish()
    }
}

impl Drop for ImageSegments {
    fn drop(&mut self) {
        if let Err(_err) = unsafe { (self.munmap)(self.memory, self.map_len) } {
            #[cfg(feature = "log")]
            log::warn!("failed to release image mapping: {}", _err);
        }
    }
}

impl ImageSegments {
    /// Takes ownership of a mapping of `map_len` bytes at `memory`, whose image
    /// span `[start, start + len)` lives at `base + start`.
    pub(crate) fn new<M: Mmap>(
        memory: NonNull<c_void>,
        map_len: usize,
        base: usize,
        start: usize,
        len: usize,
    ) -> Self {
        ImageSegments {
            memory,
            map_len,
            base,
            start,
            len,
            page_size: M::page_size(),
            munmap: M::munmap,
            mprotect: M::mprotect,
            flush: M::flush_icache,
        }
    }

    #[inline]
    pub(crate) fn map_prot(prot: u32) -> ProtFlags {
        ProtFlags::from_bits_retain(((prot & PF_X) << 2 | prot & PF_W | (prot & PF_R) >> 2) as _)
    }

    /// The image base: the address virtual address 0 maps to.
    #[inline]
    pub fn base(&self) -> usize {
        self.base
    }

    /// Bytes of the mapped span.
    #[inline]
    pub fn mapped_len(&self) -> usize {
        self.len
    }

    /// Address of the first mapped byte.
    #[inline]
    pub fn mapped_start(&self) -> usize {
        self.base.wrapping_add(self.start)
    }

    #[inline]
    pub(crate) fn page_size(&self) -> usize {
        self.page_size
    }

    /// First virtual address of the span.
    #[inline]
    pub(crate) fn start(&self) -> usize {
        self.start
    }

    /// Returns true if `addr` lies inside the mapped span.
    #[inline]
    pub fn contains(&self, addr: usize) -> bool {
        addr >= self.mapped_start() && addr - self.mapped_start() < self.len
    }

    /// Returns true if `[vaddr, vaddr + size)` lies inside the mapped span.
    #[inline]
    pub(crate) fn check(&self, vaddr: usize, size: usize) -> bool {
        match vaddr.checked_add(size) {
            Some(end) => vaddr >= self.start && end <= self.start + self.len,
            None => false,
        }
    }

    #[inline]
    pub(crate) fn get_ptr<T>(&self, vaddr: usize) -> *const T {
        debug_assert!(self.check(vaddr, 0));
        self.base.wrapping_add(vaddr) as *const T
    }

    #[inline]
    pub(crate) fn get_mut_ptr<T>(&self, vaddr: usize) -> *mut T {
        self.get_ptr::<T>(vaddr) as *mut T
    }

    /// Borrows `len` bytes at `vaddr`.
    #[inline]
    pub(crate) fn bytes(&self, vaddr: usize, len: usize) -> Option<&[u8]> {
        if !self.check(vaddr, len) {
            return None;
        }
        Some(unsafe { core::slice::from_raw_parts(self.get_ptr(vaddr), len) })
    }

    /// Mutably borrows `len` bytes at `vaddr`.
    #[inline]
    pub(crate) fn bytes_mut(&mut self, vaddr: usize, len: usize) -> Option<&mut [u8]> {
        if !self.check(vaddr, len) {
            return None;
        }
        Some(unsafe { core::slice::from_raw_parts_mut(self.get_mut_ptr(vaddr), len) })
    }

    #[inline]
    pub(crate) fn read_usize(&self, vaddr: usize) -> Option<usize> {
        self.check(vaddr, size_of::<usize>())
            .then(|| unsafe { self.get_ptr::<usize>(vaddr).read_unaligned() })
    }

    #[inline]
    pub(crate) fn read_u32(&self, vaddr: usize) -> Option<u32> {
        self.check(vaddr, size_of::<u32>())
            .then(|| unsafe { self.get_ptr::<u32>(vaddr).read_unaligned() })
    }

    /// Writes a pointer-sized value. The range must have been checked.
    #[inline]
    pub(crate) unsafe fn write_usize(&mut self, vaddr: usize, value: usize) {
        debug_assert!(self.check(vaddr, size_of::<usize>()));
        unsafe { self.get_mut_ptr::<usize>(vaddr).write_unaligned(value) };
    }

    /// Writes a 32-bit value. The range must have been checked.
    #[inline]
    pub(crate) unsafe fn write_u32(&mut self, vaddr: usize, value: u32) {
        debug_assert!(self.check(vaddr, size_of::<u32>()));
        unsafe { self.get_mut_ptr::<u32>(vaddr).write_unaligned(value) };
    }

    /// Changes the protection of the page-aligned virtual range `[start, end)`.
    pub(crate) fn protect(&self, start: usize, end: usize, prot: ProtFlags) -> Result<()> {
        debug_assert!(self.check(start, end - start));
        let addr = NonNull::new(self.base.wrapping_add(start) as *mut c_void)
            .ok_or_else(|| crate::mmap_error("protect range starts at null"))?;
        unsafe { (self.mprotect)(addr, end - start, prot) }
    }

    /// Flushes the instruction cache over the whole span.
    pub(crate) fn flush_icache(&self) {
        unsafe { (self.flush)(self.mapped_start(), self.len) };
    }
}
