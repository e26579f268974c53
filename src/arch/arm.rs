//! ARM relocation types and jump encodings for ARM and Thumb entry points.
//!
//! Odd hook targets are Thumb code. Prologues are never relocated on this
//! architecture, call-through always swaps the original bytes back in.

use super::Patch;
use elf::abi::*;

const R_ARM_REL32: u32 = 3;

/// The ELF machine type for ARM architecture.
pub const EM_ARCH: u16 = EM_ARM;

/// Relative relocation type - add base address to relative offset.
pub const REL_RELATIVE: u32 = R_ARM_RELATIVE;
/// GOT entry relocation type - set GOT entry to symbol address.
pub const REL_GOT: u32 = R_ARM_GLOB_DAT;
/// Symbolic relocation type - set to absolute symbol address.
pub const REL_SYMBOLIC: u32 = R_ARM_ABS32;
/// PLT jump slot relocation type - set PLT entry to symbol address.
pub const REL_JUMP_SLOT: u32 = R_ARM_JUMP_SLOT;
/// 32-bit PC-relative relocation type - `S + A - P`.
pub const REL_PC32: u32 = R_ARM_REL32;

/// Longest sequence written over a hooked entry point (Thumb with alignment nop).
pub const JUMP_SIZE: usize = 10;

pub(crate) const PROLOGUE_WINDOW: usize = 16;

pub(crate) fn rel_type_to_str(r_type: u32) -> &'static str {
    match r_type {
        R_ARM_NONE => "R_ARM_NONE",
        R_ARM_ABS32 => "R_ARM_ABS32",
        R_ARM_REL32 => "R_ARM_REL32",
        R_ARM_COPY => "R_ARM_COPY",
        R_ARM_GLOB_DAT => "R_ARM_GLOB_DAT",
        R_ARM_JUMP_SLOT => "R_ARM_JUMP_SLOT",
        R_ARM_RELATIVE => "R_ARM_RELATIVE",
        R_ARM_TLS_DTPMOD32 => "R_ARM_TLS_DTPMOD32",
        R_ARM_TLS_DTPOFF32 => "R_ARM_TLS_DTPOFF32",
        R_ARM_TLS_TPOFF32 => "R_ARM_TLS_TPOFF32",
        R_ARM_IRELATIVE => "R_ARM_IRELATIVE",
        _ => "UNKNOWN",
    }
}

#[inline]
fn is_thumb(target: usize) -> bool {
    target & 1 != 0
}

#[inline]
pub(crate) fn check_target(target: usize) -> Result<(), &'static str> {
    if !is_thumb(target) && target & 3 != 0 {
        return Err("ARM hook target must be 4-byte aligned");
    }
    Ok(())
}

/// Strips the Thumb bit.
#[inline]
pub(crate) fn code_address(target: usize) -> usize {
    target & !1
}

/// ARM: `ldr pc, [pc, #-4]; .word to`.
/// Thumb: `[nop]; ldr.w pc, [pc]; .word to`, the nop keeps the literal word aligned.
pub(crate) fn jump_patch(from: usize, to: usize) -> Patch {
    let mut patch = Patch::new();
    if is_thumb(from) {
        if code_address(from) & 2 != 0 {
            patch.push(&0xbf00u16.to_le_bytes());
        }
        patch.push(&[0xdf, 0xf8, 0x00, 0xf0]);
    } else {
        patch.push(&0xe51f_f004u32.to_le_bytes());
    }
    patch.push(&(to as u32).to_le_bytes());
    patch
}

pub(crate) fn patch_window(_code: &[u8], _min: usize) -> Option<usize> {
    None
}

#[cfg(target_os = "linux")]
pub(crate) unsafe fn flush_icache(start: usize, len: usize) {
    // __ARM_NR_cacheflush
    unsafe { libc::syscall(0xf0002, start, start + len, 0) };
}

#[cfg(not(target_os = "linux"))]
pub(crate) unsafe fn flush_icache(_start: usize, _len: usize) {
    core::sync::atomic::compiler_fence(core::sync::atomic::Ordering::SeqCst);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn arm_patch() {
        let patch = jump_patch(0x8000, 0x1234_5678);
        assert_eq!(
            patch.as_bytes(),
            &[0x04, 0xf0, 0x1f, 0xe5, 0x78, 0x56, 0x34, 0x12]
        );
    }

    #[test]
    fn thumb_patch_alignment() {
        let aligned = jump_patch(0x8001, 0x1000);
        assert_eq!(aligned.len(), 8);
        assert_eq!(&aligned.as_bytes()[..4], &[0xdf, 0xf8, 0x00, 0xf0]);
        let unaligned = jump_patch(0x8003, 0x1000);
        assert_eq!(unaligned.len(), JUMP_SIZE);
        assert_eq!(&unaligned.as_bytes()[..2], &[0x00, 0xbf]);
        assert_eq!(code_address(0x8003), 0x8002);
    }

    #[test]
    fn target_alignment() {
        assert!(check_target(0x8001).is_ok());
        assert!(check_target(0x8004).is_ok());
        assert!(check_target(0x8002).is_err());
    }
}
