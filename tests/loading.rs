mod common;

use common::*;
use so_loader::{
    Error, ImageState, LoadHookContext, Loader, custom_error, load_image, mmap::ProtFlags,
};
use std::cell::Cell;

#[test]
fn load_reports_layout() {
    init_logger();
    let generated = build(fixture());
    let image = load(&generated);

    assert_eq!(image.name(), SONAME);
    assert_eq!(image.soname(), Some(SONAME));
    assert_eq!(image.needed_libs(), ["libc.so", "libm.so"]);
    assert_eq!(image.state(), ImageState::Loaded);
    assert_eq!(image.base() % 0x1000, 0);

    let segments = image.segments();
    assert_eq!(segments.len(), 2);
    assert!(segments[0].prot.contains(ProtFlags::PROT_EXEC));
    assert!(!segments[0].prot.contains(ProtFlags::PROT_WRITE));
    assert!(segments[1].prot.contains(ProtFlags::PROT_WRITE));
    assert!(segments[1].mem_size > segments[1].file_size);

    assert!(image.contains(image.base()));
    assert!(image.contains(image.base() + image.mapped_len() - 1));
    assert!(!image.contains(image.base() + image.mapped_len()));
    assert_eq!(
        image.entry(),
        Some(image.base() + generated.layout.symbol("answer") as usize)
    );
}

#[test]
fn segments_are_copied_and_bss_zeroed() {
    init_logger();
    let generated = build(fixture());
    let image = load(&generated);

    assert_eq!(read_i32(addr(&image, &generated, "counter")), 7);
    let (start, end) = generated.layout.bss;
    let bss = unsafe {
        std::slice::from_raw_parts(
            (image.base() + start as usize) as *const u8,
            (end - start) as usize,
        )
    };
    assert!(bss.iter().all(|&b| b == 0));

    let answer = addr(&image, &generated, "answer");
    let code = unsafe { std::slice::from_raw_parts(answer as *const u8, ANSWER.len()) };
    assert_eq!(code, ANSWER);
}

#[test]
fn exported_symbols_only() {
    init_logger();
    let generated = build(fixture());
    let image = load(&generated);

    for name in ["answer", "compute", "counter", "answer_ptr"] {
        let found = image.find_symbol(name).unwrap();
        assert_eq!(found, addr(&image, &generated, name));
        assert!(image.contains(found));
    }
    assert_eq!(image.find_symbol("abs_marker"), Some(0x1234));
    // local and undefined symbols are not exports
    assert_eq!(image.find_symbol("hidden"), None);
    assert_eq!(image.find_symbol("host_add"), None);
    assert_eq!(image.find_symbol("no_such_symbol"), None);
}

#[test]
fn gnu_hash_images_expose_the_same_symbols() {
    init_logger();
    let sysv = build(fixture());
    let gnu = build(fixture().use_gnu_hash(true));
    let sysv_image = load(&sysv);
    let gnu_image = load(&gnu);

    assert_eq!(gnu_image.symbol_count(), sysv_image.symbol_count());
    for name in ["answer", "compute", "counter", "answer_ptr", "counter_rel32"] {
        assert_eq!(
            gnu_image.find_symbol(name).map(|addr| addr - gnu_image.base()),
            sysv_image.find_symbol(name).map(|addr| addr - sysv_image.base()),
            "{name}"
        );
    }
    assert_eq!(gnu_image.find_symbol("abs_marker"), Some(0x1234));
    assert_eq!(gnu_image.find_symbol("host_add"), None);
}

#[test]
fn gnu_hash_without_definitions() {
    init_logger();
    let generated = build(
        gen_image::ImageBuilder::new(arch())
            .import("host_add")
            .import_data("host_value")
            .use_gnu_hash(true),
    );
    let image = load(&generated);
    // null symbol plus the two imports
    assert_eq!(image.symbol_count(), 3);
    assert_eq!(image.find_symbol("host_add"), None);
}

#[test]
fn malformed_headers_are_rejected() {
    init_logger();
    let generated = build(fixture());
    // bad magic, wrong class, big endian, executable, wrong machine
    for (offset, value) in [(0, 0x7e), (4, 1), (5, 2), (16, 2), (18, 0x08)] {
        let mut bytes = generated.bytes.clone();
        bytes[offset] = value;
        let err = Loader::new().load(SONAME, &bytes, None).unwrap_err();
        assert!(matches!(err, Error::Format { .. }), "offset {offset}: {err}");
    }
}

#[test]
fn truncated_images_are_rejected() {
    init_logger();
    let generated = build(fixture());
    // header only, then headers without any segment contents
    for len in [40, 300] {
        let err = Loader::new()
            .load(SONAME, &generated.bytes[..len], None)
            .unwrap_err();
        assert!(matches!(err, Error::Format { .. }), "length {len}: {err}");
    }
}

#[test]
fn occupied_base_is_a_placement_error() {
    init_logger();
    let generated = build(fixture());
    let first = load(&generated);
    let err = Loader::new()
        .load(SONAME, &generated.bytes, Some(first.base()))
        .unwrap_err();
    match err {
        Error::Placement { requested, actual } => {
            assert_eq!(requested, first.base());
            assert_ne!(actual, requested);
        }
        err => panic!("unexpected error: {err}"),
    }
}

#[cfg(target_arch = "x86_64")]
#[test]
fn free_base_is_honoured() {
    init_logger();
    let generated = build(fixture());
    let base = 0x5a5a_0000_0000;
    let image = load_image!(SONAME, &generated.bytes, base).unwrap();
    assert_eq!(image.base(), base);
    assert_eq!(
        image.find_symbol("answer"),
        Some(base + generated.layout.symbol("answer") as usize)
    );
}

#[test]
fn load_hook_sees_every_segment() {
    init_logger();
    let generated = build(fixture());
    let seen = Cell::new(0);
    let image = Loader::new()
        .with_hook(|ctx: &LoadHookContext<'_>| {
            assert_eq!(ctx.name(), SONAME);
            assert_eq!(ctx.phdr().p_vaddr(), ctx.segment().vaddr);
            assert!(ctx.segments().contains(ctx.segments().base() + ctx.segment().vaddr));
            seen.set(seen.get() + 1);
            Ok(())
        })
        .load(SONAME, &generated.bytes, None)
        .unwrap();
    assert_eq!(seen.get(), image.segments().len());
}

#[test]
fn failing_load_hook_aborts() {
    init_logger();
    let generated = build(fixture());
    let err = Loader::new()
        .with_hook(|_: &LoadHookContext<'_>| Err(custom_error("rejected by host")))
        .load(SONAME, &generated.bytes, None)
        .unwrap_err();
    assert!(matches!(err, Error::Custom { .. }));
}

#[cfg(unix)]
mod slack {
    use super::*;
    use so_loader::mmap::{DefaultMmap, MapFlags, Mmap};
    use std::{ffi::c_void, ptr::NonNull, sync::Mutex};

    static TRIMMED: Mutex<Vec<(usize, usize)>> = Mutex::new(Vec::new());

    /// The default backend, recording every trimmed range.
    struct RecordingMmap;

    impl Mmap for RecordingMmap {
        unsafe fn mmap_anonymous(
            addr: usize,
            len: usize,
            prot: ProtFlags,
            flags: MapFlags,
        ) -> so_loader::Result<NonNull<c_void>> {
            unsafe { DefaultMmap::mmap_anonymous(addr, len, prot, flags) }
        }

        unsafe fn munmap(addr: NonNull<c_void>, len: usize) -> so_loader::Result<()> {
            unsafe { DefaultMmap::munmap(addr, len) }
        }

        unsafe fn mprotect(
            addr: NonNull<c_void>,
            len: usize,
            prot: ProtFlags,
        ) -> so_loader::Result<()> {
            unsafe { DefaultMmap::mprotect(addr, len, prot) }
        }

        unsafe fn trim(addr: NonNull<c_void>, len: usize) -> so_loader::Result<bool> {
            TRIMMED.lock().unwrap().push((addr.as_ptr() as usize, len));
            unsafe { DefaultMmap::trim(addr, len) }
        }

        fn page_size() -> usize {
            DefaultMmap::page_size()
        }
    }

    #[test]
    fn alignment_slack_is_released() {
        init_logger();
        let align = 0x10_0000;
        let generated = build(fixture().segment_align(align as u64));
        let image = Loader::<RecordingMmap>::with_mmap()
            .load(SONAME, &generated.bytes, None)
            .unwrap();
        assert_eq!(image.base() % align, 0);

        let trimmed = TRIMMED.lock().unwrap().clone();
        let released: usize = trimmed.iter().map(|&(_, len)| len).sum();
        assert_eq!(released, align - RecordingMmap::page_size());
        let (start, end) = (image.base(), image.base() + image.mapped_len());
        for &(addr, len) in &trimmed {
            assert!(addr + len <= start || addr >= end, "0x{addr:x}+0x{len:x}");
        }

        let counter = image.find_symbol("counter").unwrap();
        assert_eq!(read_i32(counter), 7);
    }
}
