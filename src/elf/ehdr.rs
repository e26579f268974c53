//! ELF header parsing and validation

use crate::{
    Result,
    arch::EM_ARCH,
    elf::{E_CLASS, EHDR_SIZE, Ehdr, ElfPhdr, PHDR_SIZE, read_struct},
    format_error,
};
use alloc::{format, vec::Vec};
use core::ops::Deref;
use elf::abi::{EI_CLASS, EI_DATA, EI_VERSION, ELFDATA2LSB, ELFMAGIC, ET_DYN, EV_CURRENT};

/// A validated copy of an ELF header.
///
/// Only headers describing a position-independent shared object for the
/// host's class, byte order and machine are accepted.
#[repr(transparent)]
pub struct ElfHeader {
    ehdr: Ehdr,
}

impl Deref for ElfHeader {
    type Target = Ehdr;

    fn deref(&self) -> &Self::Target {
        &self.ehdr
    }
}

impl ElfHeader {
    /// Parses and validates the header at the start of `data`.
    pub(crate) fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < EHDR_SIZE {
            return Err(format_error("file is smaller than an ELF header"));
        }
        let ehdr = read_struct::<Ehdr>(data, 0)
            .ok_or_else(|| format_error("file is smaller than an ELF header"))?;
        let header = ElfHeader { ehdr };
        header.validate()?;
        Ok(header)
    }

    fn validate(&self) -> Result<()> {
        if self.e_ident[0..4] != ELFMAGIC {
            return Err(format_error("invalid ELF magic"));
        }
        if self.e_ident[EI_CLASS] != E_CLASS {
            return Err(format_error("file class mismatch"));
        }
        if self.e_ident[EI_DATA] != ELFDATA2LSB {
            return Err(format_error("file is not little-endian"));
        }
        if self.e_ident[EI_VERSION] != EV_CURRENT {
            return Err(format_error("invalid ELF version"));
        }
        if self.e_type != ET_DYN {
            return Err(format_error(format!(
                "file type {} is not a shared object",
                self.e_type
            )));
        }
        if self.e_machine != EM_ARCH {
            return Err(format_error(format!(
                "file arch mismatch: expected {}, found {}",
                EM_ARCH, self.e_machine
            )));
        }
        if self.e_phnum() != 0 && self.e_phentsize() != PHDR_SIZE {
            return Err(format_error("unexpected program header entry size"));
        }
        Ok(())
    }

    #[inline]
    pub(crate) fn e_phnum(&self) -> usize {
        self.ehdr.e_phnum as usize
    }

    #[inline]
    pub(crate) fn e_phentsize(&self) -> usize {
        self.ehdr.e_phentsize as usize
    }

    #[inline]
    pub(crate) fn e_phoff(&self) -> usize {
        self.ehdr.e_phoff as usize
    }

    #[inline]
    pub(crate) fn e_entry(&self) -> usize {
        self.ehdr.e_entry as usize
    }

    /// Reads the program header table, which must lie inside `data`.
    pub(crate) fn phdrs(&self, data: &[u8]) -> Result<Vec<ElfPhdr>> {
        let start = self.e_phoff();
        let size = self
            .e_phnum()
            .checked_mul(PHDR_SIZE)
            .ok_or_else(|| format_error("program header table overflows"))?;
        match start.checked_add(size) {
            Some(end) if end <= data.len() => {}
            _ => return Err(format_error("program header table out of bounds")),
        }
        (0..self.e_phnum())
            .map(|idx| {
                read_struct(data, start + idx * PHDR_SIZE)
                    .map(ElfPhdr::new)
                    .ok_or_else(|| format_error("program header table out of bounds"))
            })
            .collect()
    }
}
