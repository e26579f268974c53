//! x86-64 relocation types, jump encoding and prologue analysis.
//!
//! Entry patches are `jmp qword ptr [rip + 0]` followed by the absolute
//! destination, so they reach anywhere in the address space without
//! clobbering a register.

use super::Patch;
use elf::abi::*;

/// The ELF machine type for x86-64 architecture.
pub const EM_ARCH: u16 = EM_X86_64;

/// Relative relocation type - add base address to relative offset.
pub const REL_RELATIVE: u32 = R_X86_64_RELATIVE;
/// GOT entry relocation type - set GOT entry to symbol address.
pub const REL_GOT: u32 = R_X86_64_GLOB_DAT;
/// Symbolic relocation type - set to absolute symbol address.
pub const REL_SYMBOLIC: u32 = R_X86_64_64;
/// PLT jump slot relocation type - set PLT entry to symbol address.
pub const REL_JUMP_SLOT: u32 = R_X86_64_JUMP_SLOT;
/// 32-bit PC-relative relocation type - `S + A - P`.
pub const REL_PC32: u32 = R_X86_64_PC32;

/// Bytes written over a hooked entry point.
pub const JUMP_SIZE: usize = 14;

/// Bytes read from a hook target when looking for whole instructions.
pub(crate) const PROLOGUE_WINDOW: usize = 32;

/// Map x86_64 relocation type value to human readable name.
pub(crate) fn rel_type_to_str(r_type: u32) -> &'static str {
    match r_type {
        R_X86_64_NONE => "R_X86_64_NONE",
        R_X86_64_64 => "R_X86_64_64",
        R_X86_64_PC32 => "R_X86_64_PC32",
        R_X86_64_GOT32 => "R_X86_64_GOT32",
        R_X86_64_PLT32 => "R_X86_64_PLT32",
        R_X86_64_COPY => "R_X86_64_COPY",
        R_X86_64_GLOB_DAT => "R_X86_64_GLOB_DAT",
        R_X86_64_JUMP_SLOT => "R_X86_64_JUMP_SLOT",
        R_X86_64_RELATIVE => "R_X86_64_RELATIVE",
        R_X86_64_GOTPCREL => "R_X86_64_GOTPCREL",
        R_X86_64_32 => "R_X86_64_32",
        R_X86_64_32S => "R_X86_64_32S",
        R_X86_64_DTPMOD64 => "R_X86_64_DTPMOD64",
        R_X86_64_DTPOFF64 => "R_X86_64_DTPOFF64",
        R_X86_64_TPOFF64 => "R_X86_64_TPOFF64",
        R_X86_64_IRELATIVE => "R_X86_64_IRELATIVE",
        _ => "UNKNOWN",
    }
}

/// Hook targets have no alignment requirement on x86-64.
#[inline]
pub(crate) fn check_target(_target: usize) -> Result<(), &'static str> {
    Ok(())
}

/// The address whose bytes are rewritten when hooking `target`.
#[inline]
pub(crate) fn code_address(target: usize) -> usize {
    target
}

/// `jmp [rip+0]; .quad to`
pub(crate) fn jump_patch(_from: usize, to: usize) -> Patch {
    let mut patch = Patch::new();
    patch.push(&[0xff, 0x25, 0x00, 0x00, 0x00, 0x00]);
    patch.push(&(to as u64).to_le_bytes());
    patch
}

/// Returns how many leading bytes of `code` can be moved into a trampoline.
///
/// The result covers at least `min` bytes, ends on an instruction boundary and
/// only contains instructions whose meaning does not depend on where they
/// execute. `None` means the prologue cannot be relocated and the caller has
/// to fall back to swapping the original bytes back in.
pub(crate) fn patch_window(code: &[u8], min: usize) -> Option<usize> {
    let mut len = 0;
    while len < min {
        len += instruction_len(code.get(len..)?)?;
    }
    (len <= code.len()).then_some(len)
}

/// Decodes the length of one position-independent instruction.
///
/// Only the handful of encodings compilers emit in function prologues are
/// recognised. Relative branches, RIP-relative operands and anything that
/// leaves the function yield `None`.
fn instruction_len(code: &[u8]) -> Option<usize> {
    let mut idx = 0;
    let mut opsize = false;
    let mut rex_w = false;
    if *code.first()? == 0x66 {
        opsize = true;
        idx += 1;
    }
    let mut op = *code.get(idx)?;
    if (0x40..=0x4f).contains(&op) {
        rex_w = op & 0x08 != 0;
        idx += 1;
        op = *code.get(idx)?;
    }
    idx += 1;
    let imm32 = if opsize { 2 } else { 4 };
    let len = match op {
        // endbr64 / endbr32
        0xf3 if idx == 1 => {
            let tail = code.get(1..4)?;
            if tail[0] == 0x0f && tail[1] == 0x1e && (tail[2] == 0xfa || tail[2] == 0xfb) {
                4
            } else {
                return None;
            }
        }
        // push/pop r64, nop
        0x50..=0x5f | 0x90 => idx,
        // push imm8 / imm32
        0x6a => idx + 1,
        0x68 => idx + 4,
        // mov r, imm
        0xb8..=0xbf => idx + if rex_w { 8 } else { imm32 },
        // two-operand ALU forms, test, mov, lea
        0x01 | 0x03 | 0x09 | 0x0b | 0x21 | 0x23 | 0x29 | 0x2b | 0x31 | 0x33 | 0x39 | 0x3b
        | 0x85 | 0x88 | 0x89 | 0x8a | 0x8b | 0x8d => idx + modrm_len(code.get(idx..)?)?,
        // group 1 with imm8 / imm32
        0x83 => idx + modrm_len(code.get(idx..)?)? + 1,
        0x81 => idx + modrm_len(code.get(idx..)?)? + imm32,
        // mov r/m, imm32
        0xc7 => idx + modrm_len(code.get(idx..)?)? + imm32,
        0x0f => match *code.get(idx)? {
            // multi-byte nop
            0x1f => idx + 1 + modrm_len(code.get(idx + 1..)?)?,
            _ => return None,
        },
        _ => return None,
    };
    (len <= code.len()).then_some(len)
}

/// Length of a ModRM byte plus SIB and displacement.
fn modrm_len(code: &[u8]) -> Option<usize> {
    let modrm = *code.first()?;
    let md = modrm >> 6;
    let rm = modrm & 0x7;
    if md == 3 {
        return Some(1);
    }
    let mut len = 1;
    if rm == 4 {
        let sib = *code.get(1)?;
        len += 1;
        if md == 0 && sib & 0x7 == 5 {
            len += 4;
        }
    } else if md == 0 && rm == 5 {
        // RIP-relative
        return None;
    }
    len += match md {
        1 => 1,
        2 => 4,
        _ => 0,
    };
    Some(len)
}

/// x86 keeps instruction fetch coherent with data writes.
#[inline]
pub(crate) unsafe fn flush_icache(_start: usize, _len: usize) {
    core::sync::atomic::compiler_fence(core::sync::atomic::Ordering::SeqCst);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_setup_prologue_is_relocatable() {
        let code = [
            0xf3, 0x0f, 0x1e, 0xfa, // endbr64
            0x55, // push rbp
            0x48, 0x89, 0xe5, // mov rbp, rsp
            0x48, 0x83, 0xec, 0x20, // sub rsp, 0x20
            0x89, 0x7d, 0xfc, // mov [rbp-4], edi
            0xc9, 0xc3, // leave; ret
        ];
        assert_eq!(patch_window(&code, JUMP_SIZE), Some(15));
    }

    #[test]
    fn sib_and_immediates() {
        // lea eax, [rdi+rsi]; add eax, 7; mov ecx, 0x11223344; nop x3 ends on the jump
        let code = [
            0x8d, 0x04, 0x37, 0x83, 0xc0, 0x07, 0xb9, 0x44, 0x33, 0x22, 0x11, 0x90, 0x90, 0x90,
            0x90,
        ];
        assert_eq!(patch_window(&code, JUMP_SIZE), Some(14));
        // lea; add; nop; mov ecx, imm32; add eax, 7 straddles byte 14
        let code = [
            0x8d, 0x04, 0x37, 0x83, 0xc0, 0x07, 0x90, 0xb9, 0x44, 0x33, 0x22, 0x11, 0x83, 0xc0,
            0x07, 0xc3,
        ];
        assert_eq!(patch_window(&code, JUMP_SIZE), Some(15));
        // movabs rax, imm64 is ten bytes long
        let code = [0x48, 0xb8, 1, 2, 3, 4, 5, 6, 7, 8, 0x0f, 0x1f, 0x40, 0x00, 0xc3];
        assert_eq!(patch_window(&code, JUMP_SIZE), Some(14));
    }

    #[test]
    fn rip_relative_operand_is_rejected() {
        // lea rax, [rip+0x10]
        let code = [
            0x48, 0x8d, 0x05, 0x10, 0x00, 0x00, 0x00, 0x90, 0x90, 0x90, 0x90, 0x90, 0x90, 0x90,
            0x90,
        ];
        assert_eq!(patch_window(&code, JUMP_SIZE), None);
    }

    #[test]
    fn branches_and_short_functions_are_rejected() {
        // call rel32
        let code = [0xe8, 0, 0, 0, 0, 0x90, 0x90, 0x90, 0x90, 0x90, 0x90, 0x90, 0x90, 0x90];
        assert_eq!(patch_window(&code, JUMP_SIZE), None);
        // mov eax, 1; ret
        let code = [0xb8, 1, 0, 0, 0, 0xc3, 0xcc, 0xcc, 0xcc, 0xcc, 0xcc, 0xcc, 0xcc, 0xcc];
        assert_eq!(patch_window(&code, JUMP_SIZE), None);
        // truncated window
        assert_eq!(patch_window(&[0x55, 0x48, 0x89], JUMP_SIZE), None);
    }

    #[test]
    fn jump_patch_layout() {
        let patch = jump_patch(0x1000, 0x1122_3344_5566_7788);
        assert_eq!(patch.len(), JUMP_SIZE);
        assert_eq!(&patch.as_bytes()[..6], &[0xff, 0x25, 0, 0, 0, 0]);
        assert_eq!(
            u64::from_le_bytes(patch.as_bytes()[6..].try_into().unwrap()),
            0x1122_3344_5566_7788
        );
    }
}
