//! ELF format definitions and utilities.
//!
//! The structures come from the `elf` crate for the host's pointer width. Images
//! are handed to the loader as plain byte slices with no alignment guarantee,
//! so every structure is copied out with an unaligned read after a bounds check.

use core::mem::size_of;
use elf::abi::{
    SHN_UNDEF, STB_GLOBAL, STB_GNU_UNIQUE, STB_WEAK, STT_COMMON, STT_FUNC,
    STT_GNU_IFUNC, STT_NOTYPE, STT_OBJECT, STT_TLS,
};

/// Valid symbol binding types bitmask.
const OK_BINDS: usize = 1 << STB_GLOBAL | 1 << STB_WEAK | 1 << STB_GNU_UNIQUE;

/// Valid symbol type bitmask.
const OK_TYPES: usize = 1 << STT_NOTYPE
    | 1 << STT_OBJECT
    | 1 << STT_FUNC
    | 1 << STT_COMMON
    | 1 << STT_TLS
    | 1 << STT_GNU_IFUNC;

cfg_if::cfg_if! {
    if #[cfg(target_pointer_width = "64")]{
        pub(crate) const E_CLASS: u8 = elf::abi::ELFCLASS64;
        pub(crate) type Phdr = elf::segment::Elf64_Phdr;
        pub(crate) type Dyn = elf::dynamic::Elf64_Dyn;
        pub(crate) type Ehdr = elf::file::Elf64_Ehdr;
        pub(crate) type Rela = elf::relocation::Elf64_Rela;
        pub(crate) type Rel = elf::relocation::Elf64_Rel;
        pub(crate) type Sym = elf::symbol::Elf64_Sym;
        pub(crate) const REL_MASK: usize = 0xFFFFFFFF;
        pub(crate) const REL_BIT: usize = 32;
    }else{
        pub(crate) const E_CLASS: u8 = elf::abi::ELFCLASS32;
        pub(crate) type Phdr = elf::segment::Elf32_Phdr;
        pub(crate) type Dyn = elf::dynamic::Elf32_Dyn;
        pub(crate) type Ehdr = elf::file::Elf32_Ehdr;
        pub(crate) type Rela = elf::relocation::Elf32_Rela;
        pub(crate) type Rel = elf::relocation::Elf32_Rel;
        pub(crate) type Sym = Elf32Sym;
        pub(crate) const REL_MASK: usize = 0xFF;
        pub(crate) const REL_BIT: usize = 8;
    }
}

pub(crate) const EHDR_SIZE: usize = size_of::<Ehdr>();
pub(crate) const PHDR_SIZE: usize = size_of::<Phdr>();
pub(crate) const DYN_SIZE: usize = size_of::<Dyn>();
pub(crate) const SYM_SIZE: usize = size_of::<Sym>();
pub(crate) const RELA_SIZE: usize = size_of::<Rela>();
pub(crate) const REL_SIZE: usize = size_of::<Rel>();

#[allow(unused)]
#[repr(C)]
/// 32-bit ELF symbol table entry.
/// For 64-bit targets, the `Sym` type alias points to `elf::symbol::Elf64_Sym` instead.
pub(crate) struct Elf32Sym {
    pub st_name: u32,
    pub st_value: u32,
    pub st_size: u32,
    pub st_info: u8,
    pub st_other: u8,
    pub st_shndx: u16,
}

/// Plain-old-data ELF structures that may be copied out of raw bytes.
///
/// # Safety
/// Implementors must be `repr(C)` with no padding-dependent invariants, so that
/// any bit pattern is a valid value.
pub(crate) unsafe trait Pod: Sized {}

unsafe impl Pod for Ehdr {}
unsafe impl Pod for Phdr {}
unsafe impl Pod for Dyn {}
unsafe impl Pod for Sym {}
unsafe impl Pod for Rela {}
unsafe impl Pod for Rel {}

/// Copies a `T` out of `bytes` at `offset`, or `None` if it does not fit.
#[inline]
pub(crate) fn read_struct<T: Pod>(bytes: &[u8], offset: usize) -> Option<T> {
    let end = offset.checked_add(size_of::<T>())?;
    let src = bytes.get(offset..end)?;
    Some(unsafe { core::ptr::read_unaligned(src.as_ptr().cast::<T>()) })
}

/// ELF program header.
///
/// Program headers describe segments of the ELF file that need to be loaded
/// into memory or contain other information necessary for execution.
#[repr(transparent)]
pub struct ElfPhdr {
    phdr: Phdr,
}

impl ElfPhdr {
    #[inline]
    pub(crate) fn new(phdr: Phdr) -> Self {
        Self { phdr }
    }

    /// Segment type (`PT_*`).
    #[inline]
    pub fn p_type(&self) -> u32 {
        self.phdr.p_type
    }

    /// Segment permissions (`PF_*`).
    #[inline]
    pub fn p_flags(&self) -> u32 {
        self.phdr.p_flags
    }

    /// Offset of the segment in the file.
    #[inline]
    pub fn p_offset(&self) -> usize {
        self.phdr.p_offset as usize
    }

    /// Virtual address of the segment, relative to the load bias.
    #[inline]
    pub fn p_vaddr(&self) -> usize {
        self.phdr.p_vaddr as usize
    }

    /// Bytes of the segment present in the file.
    #[inline]
    pub fn p_filesz(&self) -> usize {
        self.phdr.p_filesz as usize
    }

    /// Bytes of the segment in memory.
    #[inline]
    pub fn p_memsz(&self) -> usize {
        self.phdr.p_memsz as usize
    }

    /// Required alignment of the segment.
    #[inline]
    pub fn p_align(&self) -> usize {
        self.phdr.p_align as usize
    }
}

impl core::fmt::Debug for ElfPhdr {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ElfPhdr")
            .field("p_type", &self.p_type())
            .field("p_flags", &self.p_flags())
            .field("p_offset", &self.p_offset())
            .field("p_vaddr", &self.p_vaddr())
            .field("p_filesz", &self.p_filesz())
            .field("p_memsz", &self.p_memsz())
            .field("p_align", &self.p_align())
            .finish()
    }
}

#[repr(transparent)]
/// ELF symbol table entry.
///
/// This struct provides a unified interface for accessing ELF symbol information
/// regardless of whether the ELF file is 32-bit or 64-bit.
pub(crate) struct ElfSymbol {
    sym: Sym,
}

impl ElfSymbol {
    #[inline]
    pub(crate) fn new(sym: Sym) -> Self {
        Self { sym }
    }

    /// Returns the symbol value.
    #[inline]
    pub(crate) fn st_value(&self) -> usize {
        self.sym.st_value as usize
    }

    /// Returns the symbol binding.
    #[inline]
    pub(crate) fn st_bind(&self) -> u8 {
        self.sym.st_info >> 4
    }

    /// Returns the symbol type.
    #[inline]
    pub(crate) fn st_type(&self) -> u8 {
        self.sym.st_info & 0xf
    }

    /// Returns the section index.
    #[inline]
    pub(crate) fn st_shndx(&self) -> usize {
        self.sym.st_shndx as usize
    }

    /// Returns the symbol name index.
    #[inline]
    pub(crate) fn st_name(&self) -> usize {
        self.sym.st_name as usize
    }

    /// Returns the symbol size.
    #[inline]
    pub(crate) fn st_size(&self) -> usize {
        self.sym.st_size as usize
    }

    /// Returns true if the symbol is undefined (not defined in this object file).
    #[inline]
    pub(crate) fn is_undef(&self) -> bool {
        self.st_shndx() == SHN_UNDEF as usize
    }

    /// Returns true if the symbol has a valid binding type for linking.
    /// Valid bindings include global, weak, and GNU unique symbols.
    #[inline]
    pub(crate) fn is_ok_bind(&self) -> bool {
        (1 << self.st_bind()) & OK_BINDS != 0
    }

    /// Returns true if the symbol has a valid type for linking.
    #[inline]
    pub(crate) fn is_ok_type(&self) -> bool {
        (1 << self.st_type()) & OK_TYPES != 0
    }

    /// Returns true if the symbol has weak binding.
    #[inline]
    pub(crate) fn is_weak(&self) -> bool {
        self.st_bind() == STB_WEAK
    }

    /// Returns true if other images may link against this symbol.
    #[inline]
    pub(crate) fn is_export(&self) -> bool {
        !self.is_undef() && self.is_ok_bind() && self.is_ok_type()
    }
}
