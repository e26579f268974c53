//! Memory mapping operations for the loader
//!
//! Images live in one anonymous read/write/execute mapping. This module
//! abstracts how that mapping is obtained, re-protected, released and made
//! coherent for instruction fetch, so hosts without a `libc` can plug in their
//! own memory primitives.
//!
//! # Safety
//! Memory mapping involves direct manipulation of the process's address space.
//! Incorrect usage can cause crashes, data corruption, or security issues.

pub use crate::os::DefaultMmap;

use crate::Result;
use bitflags::bitflags;
use core::{
    ffi::{c_int, c_void},
    ptr::NonNull,
};

bitflags! {
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    /// Memory protection flags for controlling access permissions.
    pub struct ProtFlags: c_int {
        /// No access allowed.
        const PROT_NONE = 0;

        /// Allow reading from the memory region.
        const PROT_READ = 1;

        /// Allow writing to the memory region.
        const PROT_WRITE = 2;

        /// Allow executing code in the memory region.
        const PROT_EXEC = 4;
    }
}

bitflags! {
    #[derive(Clone, Copy, Debug)]
    /// Memory mapping configuration flags.
    pub struct MapFlags: c_int {
        /// Create a private copy-on-write mapping.
        const MAP_PRIVATE = 2;

        /// Create an anonymous mapping not backed by any file.
        const MAP_ANONYMOUS = 32;
    }
}

impl ProtFlags {
    /// Read, write and execute: the protection images are mapped with.
    pub const RWX: ProtFlags = ProtFlags::PROT_READ
        .union(ProtFlags::PROT_WRITE)
        .union(ProtFlags::PROT_EXEC);
}

/// A trait for low-level memory mapping operations.
///
/// All methods are associated functions: an implementation carries no state and
/// is selected through the type parameter of [`Loader`](crate::Loader).
///
/// # Example
/// ```rust,ignore
/// struct MyMmap;
///
/// impl Mmap for MyMmap {
///     unsafe fn mmap_anonymous(
///         addr: usize,
///         len: usize,
///         prot: ProtFlags,
///         flags: MapFlags,
///     ) -> Result<NonNull<c_void>> {
///         // Platform-specific implementation
///         todo!()
///     }
///
///     // Implement other required methods...
/// }
/// ```
pub trait Mmap {
    /// Creates an anonymous memory mapping.
    ///
    /// # Arguments
    /// * `addr` - Preferred starting address, or 0 to let the system choose. This
    ///   is only a hint: the mapping may land elsewhere and callers must check
    ///   the returned address.
    /// * `len` - Size of the mapping in bytes.
    /// * `prot` - Initial memory protection flags.
    /// * `flags` - Mapping configuration flags.
    ///
    /// # Safety
    /// Manipulates the process address space.
    unsafe fn mmap_anonymous(
        addr: usize,
        len: usize,
        prot: ProtFlags,
        flags: MapFlags,
    ) -> Result<NonNull<c_void>>;

    /// Unmaps a memory region previously returned by [`Mmap::mmap_anonymous`].
    ///
    /// # Safety
    /// `addr` and `len` must match the original mapping. The region must not be
    /// accessed afterwards.
    unsafe fn munmap(addr: NonNull<c_void>, len: usize) -> Result<()>;

    /// Changes the protection of a page-aligned part of a mapping.
    ///
    /// # Safety
    /// Removing execute permission from code that is running faults.
    unsafe fn mprotect(addr: NonNull<c_void>, len: usize, prot: ProtFlags) -> Result<()>;

    /// Gives back the unused `[addr, addr + len)` head or tail of a mapping.
    ///
    /// Returns `true` when the range was unmapped, after which the rest of
    /// the mapping is released piecewise through [`Mmap::munmap`]. Backends
    /// that can only release whole mappings make the range inaccessible and
    /// return `false`.
    ///
    /// # Safety
    /// The range must be a page-aligned part of a live mapping that nothing
    /// refers to.
    unsafe fn trim(addr: NonNull<c_void>, len: usize) -> Result<bool> {
        unsafe { Self::munmap(addr, len)? };
        Ok(true)
    }

    /// Granularity of [`Mmap::mprotect`].
    fn page_size() -> usize {
        4096
    }

    /// Makes instruction fetch observe the bytes written to `[addr, addr + len)`.
    ///
    /// # Safety
    /// The range must be mapped.
    unsafe fn flush_icache(addr: usize, len: usize) {
        unsafe { crate::arch::flush_icache(addr, len) }
    }
}
