#![allow(dead_code)]

use gen_image::{Arch, CodeRef, Generated, ImageBuilder, Reloc};
use so_loader::{Image, Loader, SymbolMap, symbol_map};

pub fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

pub fn arch() -> Arch {
    Arch::host().expect("test fixtures need an x86_64 or aarch64 host")
}

#[cfg(target_arch = "x86_64")]
mod code {
    use gen_image::CodeRef;

    /// mov eax, 42; ret
    pub const ANSWER: &[u8] = &[0xb8, 0x2a, 0x00, 0x00, 0x00, 0xc3];

    /// 2 * x + 3, with a 14-byte prologue of movable instructions.
    pub const COMPUTE: &[u8] = &[
        0x55, // push rbp
        0x48, 0x89, 0xe5, // mov rbp, rsp
        0x8d, 0x04, 0x3f, // lea eax, [rdi + rdi]
        0x83, 0xc0, 0x03, // add eax, 3
        0x90, 0x90, 0x90, 0x90, // nop
        0x5d, // pop rbp
        0xc3, // ret
    ];

    /// 2 * x + 3, opening with a RIP-relative instruction.
    pub const COMPUTE_RIP: &[u8] = &[
        0x48, 0x8d, 0x05, 0x00, 0x00, 0x00, 0x00, // lea rax, [rip]
        0x8d, 0x04, 0x3f, // lea eax, [rdi + rdi]
        0x83, 0xc0, 0x03, // add eax, 3
        0x90, 0x90, 0x90, 0x90, // nop
        0xc3, // ret
    ];

    /// jmp qword ptr [rip + GOT(target)]
    pub fn tail_call(target: &str) -> (Vec<u8>, Vec<CodeRef>) {
        (vec![0xff, 0x25, 0, 0, 0, 0], vec![CodeRef::new(2, 6, target)])
    }

    /// mov dword ptr [rip + counter], 1; ret
    pub fn set_counter() -> (Vec<u8>, Vec<CodeRef>) {
        (
            vec![0xc7, 0x05, 0, 0, 0, 0, 0x01, 0x00, 0x00, 0x00, 0xc3],
            vec![CodeRef::new(2, 10, "counter")],
        )
    }

    /// add dword ptr [rip + counter], 10; ret
    pub fn add_counter() -> (Vec<u8>, Vec<CodeRef>) {
        (
            vec![0x83, 0x05, 0, 0, 0, 0, 0x0a, 0xc3],
            vec![CodeRef::new(2, 7, "counter")],
        )
    }

    /// R_X86_64_COPY
    pub const UNSUPPORTED_RELOC: u32 = 5;
}

#[cfg(target_arch = "aarch64")]
mod code {
    use gen_image::CodeRef;

    fn words(words: &[u32]) -> Vec<u8> {
        words.iter().flat_map(|w| w.to_le_bytes()).collect()
    }

    const NOP: u32 = 0xd503201f;
    const RET: u32 = 0xd65f03c0;

    /// mov w0, #42; ret
    pub const ANSWER: &[u8] = &[0x40, 0x05, 0x80, 0x52, 0xc0, 0x03, 0x5f, 0xd6];

    /// add w0, w0, w0; add w0, w0, #3; nop; nop; ret
    pub const COMPUTE: &[u8] = &[
        0x00, 0x00, 0x00, 0x0b, 0x00, 0x0c, 0x00, 0x11, 0x1f, 0x20, 0x03, 0xd5, 0x1f, 0x20, 0x03,
        0xd5, 0xc0, 0x03, 0x5f, 0xd6,
    ];

    /// adr x1, #0; add w0, w0, w0; add w0, w0, #3; nop; ret
    pub const COMPUTE_RIP: &[u8] = &[
        0x01, 0x00, 0x00, 0x10, 0x00, 0x00, 0x00, 0x0b, 0x00, 0x0c, 0x00, 0x11, 0x1f, 0x20, 0x03,
        0xd5, 0xc0, 0x03, 0x5f, 0xd6,
    ];

    /// ldr x16, GOT(target); br x16
    pub fn tail_call(target: &str) -> (Vec<u8>, Vec<CodeRef>) {
        (words(&[0x58000010, 0xd61f0200]), vec![CodeRef::new(0, 4, target)])
    }

    pub fn set_counter() -> (Vec<u8>, Vec<CodeRef>) {
        (words(&[NOP, RET]), Vec::new())
    }

    pub fn add_counter() -> (Vec<u8>, Vec<CodeRef>) {
        (words(&[NOP, RET]), Vec::new())
    }

    /// R_AARCH64_COPY
    pub const UNSUPPORTED_RELOC: u32 = 1024;
}

pub use code::*;

pub const SONAME: &str = "libfixture.so";

/// Exports, imports and data covering every relocation kind the loader binds.
pub fn fixture() -> ImageBuilder {
    let (call_host, call_host_refs) = tail_call("host_add");
    ImageBuilder::new(arch())
        .soname(SONAME)
        .needed("libc.so")
        .needed("libm.so")
        .import("host_add")
        .import_data("host_value")
        .weak_import("optional_hook")
        .absolute("abs_marker", 0x1234)
        .function("answer", ANSWER)
        .function("compute", COMPUTE)
        .function("compute_rip", COMPUTE_RIP)
        .function_with_refs("call_host", &call_host, &call_host_refs)
        .local_function("hidden", ANSWER)
        .object("counter", &7i32.to_le_bytes())
        .pointer("answer_ptr", Reloc::Relative("answer".into()))
        .pointer("answer_abs", Reloc::Absolute("answer".into(), 0))
        .pointer("counter_plus", Reloc::Absolute("counter".into(), 4))
        .pointer("value_ptr", Reloc::Absolute("host_value".into(), 0))
        .pointer("counter_rel32", Reloc::Pc32("counter".into(), 0))
        .bss(0x100)
        .entry("answer")
}

/// The fixture plus `DT_INIT`, `DT_INIT_ARRAY` and `DT_FINI_ARRAY`.
pub fn fixture_with_initializers() -> ImageBuilder {
    let (set, set_refs) = set_counter();
    let (add, add_refs) = add_counter();
    let (fini, fini_refs) = tail_call("host_fini");
    fixture()
        .import("host_fini")
        .function_with_refs("set_counter", &set, &set_refs)
        .function_with_refs("add_counter", &add, &add_refs)
        .function_with_refs("run_fini", &fini, &fini_refs)
        .init("set_counter")
        .init_array("add_counter")
        .fini_array("run_fini")
}

pub fn build(builder: ImageBuilder) -> Generated {
    builder.build().expect("fixture must build")
}

pub extern "C" fn host_add(a: i32, b: i32) -> i32 {
    a + b
}

pub static HOST_VALUE: u64 = 0xfeed_f00d;

/// Binds the fixture's non-weak imports.
pub fn host_table() -> SymbolMap {
    symbol_map! {
        "host_add" => host_add,
        "host_value" => &HOST_VALUE as *const u64,
    }
}

pub fn load(generated: &Generated) -> Image {
    Loader::new()
        .load(SONAME, &generated.bytes, None)
        .expect("fixture must load")
}

/// Loads, relocates, resolves against [`host_table`] and finalizes.
pub fn ready(generated: &Generated) -> Image {
    let mut image = load(generated);
    image.relocate().unwrap();
    image.resolve(&host_table(), false).unwrap();
    image.finalize().unwrap();
    image
}

pub fn read_usize(addr: usize) -> usize {
    unsafe { (addr as *const usize).read_unaligned() }
}

pub fn read_i32(addr: usize) -> i32 {
    unsafe { (addr as *const i32).read_unaligned() }
}

/// Address of a fixture symbol inside a loaded image.
pub fn addr(image: &Image, generated: &Generated, name: &str) -> usize {
    image.base() + generated.layout.symbol(name) as usize
}

pub fn got(image: &Image, generated: &Generated, name: &str) -> usize {
    image.base() + generated.layout.got[name] as usize
}
