//! ELF (Executable and Linkable Format) data structures and utilities.

mod defs;
mod ehdr;

pub(crate) use defs::*;
pub(crate) use ehdr::ElfHeader;

/// Program header view.
pub use defs::ElfPhdr;
/// ELF ABI constants and definitions from the elf crate.
pub use elf::abi::*;
