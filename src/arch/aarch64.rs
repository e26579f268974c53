//! AArch64 relocation types, jump encoding and prologue analysis.

use super::Patch;
use core::arch::asm;
use elf::abi::*;

const R_AARCH64_PREL32: u32 = 261;

/// The ELF machine type for AArch64 architecture.
pub const EM_ARCH: u16 = EM_AARCH64;

/// Relative relocation type - add base address to relative offset.
pub const REL_RELATIVE: u32 = R_AARCH64_RELATIVE;
/// GOT entry relocation type - set GOT entry to symbol address.
pub const REL_GOT: u32 = R_AARCH64_GLOB_DAT;
/// Symbolic relocation type - set to absolute symbol address.
pub const REL_SYMBOLIC: u32 = R_AARCH64_ABS64;
/// PLT jump slot relocation type - set PLT entry to symbol address.
pub const REL_JUMP_SLOT: u32 = R_AARCH64_JUMP_SLOT;
/// 32-bit PC-relative relocation type - `S + A - P`.
pub const REL_PC32: u32 = R_AARCH64_PREL32;

/// Bytes written over a hooked entry point.
pub const JUMP_SIZE: usize = 16;

pub(crate) const PROLOGUE_WINDOW: usize = 32;

pub(crate) fn rel_type_to_str(r_type: u32) -> &'static str {
    match r_type {
        R_AARCH64_NONE => "R_AARCH64_NONE",
        R_AARCH64_ABS64 => "R_AARCH64_ABS64",
        R_AARCH64_PREL32 => "R_AARCH64_PREL32",
        R_AARCH64_COPY => "R_AARCH64_COPY",
        R_AARCH64_GLOB_DAT => "R_AARCH64_GLOB_DAT",
        R_AARCH64_JUMP_SLOT => "R_AARCH64_JUMP_SLOT",
        R_AARCH64_RELATIVE => "R_AARCH64_RELATIVE",
        R_AARCH64_TLS_DTPMOD => "R_AARCH64_TLS_DTPMOD",
        R_AARCH64_TLS_DTPREL => "R_AARCH64_TLS_DTPREL",
        R_AARCH64_TLS_TPREL => "R_AARCH64_TLS_TPREL",
        R_AARCH64_TLSDESC => "R_AARCH64_TLSDESC",
        R_AARCH64_IRELATIVE => "R_AARCH64_IRELATIVE",
        _ => "UNKNOWN",
    }
}

#[inline]
pub(crate) fn check_target(target: usize) -> Result<(), &'static str> {
    if target & 3 != 0 {
        return Err("AArch64 hook target must be 4-byte aligned");
    }
    Ok(())
}

#[inline]
pub(crate) fn code_address(target: usize) -> usize {
    target
}

/// `ldr x16, #8; br x16; .quad to`
pub(crate) fn jump_patch(_from: usize, to: usize) -> Patch {
    let mut patch = Patch::new();
    patch.push(&0x5800_0050u32.to_le_bytes());
    patch.push(&0xd61f_0200u32.to_le_bytes());
    patch.push(&(to as u64).to_le_bytes());
    patch
}

/// Returns `true` if the instruction computes or branches relative to its own
/// address, or leaves the function.
fn is_pc_relative(insn: u32) -> bool {
    // adr, adrp
    insn & 0x1f00_0000 == 0x1000_0000
        // b, bl
        || insn & 0x7c00_0000 == 0x1400_0000
        // b.cond
        || insn & 0xff00_0010 == 0x5400_0000
        // cbz, cbnz
        || insn & 0x7e00_0000 == 0x3400_0000
        // tbz, tbnz
        || insn & 0x7e00_0000 == 0x3600_0000
        // ldr (literal), ldrsw (literal), prfm (literal)
        || insn & 0x3b00_0000 == 0x1800_0000
        // br, blr, ret, eret
        || insn & 0xfe00_0000 == 0xd600_0000
}

/// Returns how many leading bytes of `code` can be moved into a trampoline.
///
/// Every instruction is four bytes, so the window is `min` rounded up to a whole
/// instruction as long as none of them is PC-relative.
pub(crate) fn patch_window(code: &[u8], min: usize) -> Option<usize> {
    let len = (min + 3) & !3;
    let window = code.get(..len)?;
    for chunk in window.chunks_exact(4) {
        let insn = u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
        if is_pc_relative(insn) {
            return None;
        }
    }
    Some(len)
}

/// Cleans the data cache and invalidates the instruction cache over the range.
pub(crate) unsafe fn flush_icache(start: usize, len: usize) {
    let ctr: u64;
    unsafe {
        asm!("mrs {}, ctr_el0", out(reg) ctr, options(nomem, nostack, preserves_flags));
    }
    let dline = 4usize << ((ctr >> 16) & 0xf);
    let iline = 4usize << (ctr & 0xf);
    let end = start + len;

    let mut addr = start & !(dline - 1);
    while addr < end {
        unsafe { asm!("dc cvau, {}", in(reg) addr, options(nostack, preserves_flags)) };
        addr += dline;
    }
    unsafe { asm!("dsb ish", options(nostack, preserves_flags)) };

    let mut addr = start & !(iline - 1);
    while addr < end {
        unsafe { asm!("ic ivau, {}", in(reg) addr, options(nostack, preserves_flags)) };
        addr += iline;
    }
    unsafe { asm!("dsb ish", "isb", options(nostack, preserves_flags)) };
}
