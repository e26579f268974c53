mod common;

use common::*;
use so_loader::{Error, ImageState};

#[test]
fn hooks_need_a_resolved_image() {
    init_logger();
    let generated = build(fixture());
    let mut image = load(&generated);
    let target = addr(&image, &generated, "compute");
    let err = unsafe { image.install_hook(target, host_add as usize) }.unwrap_err();
    assert!(matches!(err, Error::State { .. }), "{err}");
    assert!(image.hooks().is_empty());
}

#[test]
fn hooks_must_target_code() {
    init_logger();
    let generated = build(fixture());
    let mut image = load(&generated);
    image.relocate().unwrap();
    image.resolve(&host_table(), false).unwrap();

    let counter = addr(&image, &generated, "counter");
    let err = unsafe { image.install_hook(counter, host_add as usize) }.unwrap_err();
    assert!(matches!(err, Error::Hook { .. }), "{err}");
    let err = unsafe { image.install_hook(image.base() + image.mapped_len(), host_add as usize) }
        .unwrap_err();
    assert!(matches!(err, Error::Hook { .. }), "{err}");
    let err = unsafe { image.hook_symbol("no_such_function", host_add as usize) }.unwrap_err();
    assert!(matches!(err, Error::Hook { .. }), "{err}");
    assert_eq!(image.state(), ImageState::Resolved);
}

#[test]
fn functions_shorter_than_the_jump_are_rejected() {
    init_logger();
    let generated = build(fixture());
    let mut image = load(&generated);
    image.relocate().unwrap();
    image.resolve(&host_table(), false).unwrap();

    let answer = addr(&image, &generated, "answer");
    let before = unsafe { std::slice::from_raw_parts(answer as *const u8, 32) }.to_vec();
    let err = unsafe { image.hook_symbol("answer", host_add as usize) }.unwrap_err();
    assert!(matches!(err, Error::Hook { .. }), "{err}");
    let err = unsafe { image.install_hook(answer, host_add as usize) }.unwrap_err();
    assert!(matches!(err, Error::Hook { .. }), "{err}");

    let after = unsafe { std::slice::from_raw_parts(answer as *const u8, 32) };
    assert_eq!(after, before.as_slice());
    assert!(image.hooks().is_empty());
    assert_eq!(image.state(), ImageState::Resolved);
}

#[cfg(target_arch = "x86_64")]
mod x86_64 {
    use super::*;
    use so_loader::{CallStrategy, HookHandle, HookInstaller, Loader};
    use std::sync::OnceLock;

    type Compute = extern "C" fn(i32) -> i32;

    fn entry_bytes(addr: usize, len: usize) -> Vec<u8> {
        unsafe { std::slice::from_raw_parts(addr as *const u8, len) }.to_vec()
    }

    static COMPUTE_HOOK: OnceLock<HookHandle> = OnceLock::new();

    extern "C" fn compute_plus_one(x: i32) -> i32 {
        let hook = COMPUTE_HOOK.get().unwrap();
        unsafe { hook.call_through(|original: Compute| original(x)) + 1 }
    }

    #[test]
    fn trampoline_call_through() {
        init_logger();
        let generated = build(fixture());
        let mut image = load(&generated);
        image.relocate().unwrap();
        image.resolve(&host_table(), false).unwrap();

        let handle = unsafe { image.hook_symbol("compute", compute_plus_one as usize) }.unwrap();
        assert_eq!(handle.strategy(), CallStrategy::Trampoline);
        assert_eq!(handle.original_bytes(), &COMPUTE[..14]);
        assert_eq!(image.state(), ImageState::Hooked);
        COMPUTE_HOOK.set(handle).unwrap();

        image.finalize().unwrap();
        let target = addr(&image, &generated, "compute");
        assert_eq!(entry_bytes(target, 14), handle.patch_bytes());

        let compute = unsafe { image.get::<Compute>("compute").unwrap() };
        assert_eq!(compute(5), 14);
        assert_eq!(compute(-2), 0);
        // the original stays reachable without the hook
        assert_eq!(unsafe { handle.call_through(|original: Compute| original(5)) }, 13);
    }

    static SWAP_HOOK: OnceLock<HookHandle> = OnceLock::new();

    extern "C" fn compute_rip_plus_one(x: i32) -> i32 {
        let hook = SWAP_HOOK.get().unwrap();
        unsafe { hook.call_through(|original: Compute| original(x)) + 1 }
    }

    #[test]
    fn swap_call_through() {
        init_logger();
        let generated = build(fixture());
        let mut image = load(&generated);
        image.relocate().unwrap();
        image.resolve(&host_table(), false).unwrap();

        let handle =
            unsafe { image.hook_symbol("compute_rip", compute_rip_plus_one as usize) }.unwrap();
        assert_eq!(handle.strategy(), CallStrategy::Swap);
        SWAP_HOOK.set(handle).unwrap();
        image.finalize().unwrap();

        let target = addr(&image, &generated, "compute_rip");
        let compute = unsafe { image.get::<Compute>("compute_rip").unwrap() };
        assert_eq!(compute(5), 14);
        // the patch is back in place after every call
        assert_eq!(entry_bytes(target, 14), handle.patch_bytes());
        assert_eq!(compute(10), 24);
        assert_eq!(entry_bytes(target, 14), handle.patch_bytes());
    }

    static LATE_HOOK: OnceLock<HookHandle> = OnceLock::new();

    extern "C" fn late_compute(x: i32) -> i32 {
        let hook = LATE_HOOK.get().unwrap();
        unsafe { hook.call_through(|original: Compute| original(x)) * 10 }
    }

    #[test]
    fn hooking_a_finalized_image() {
        init_logger();
        let generated = build(fixture());
        let mut image = ready(&generated);
        assert_eq!(image.state(), ImageState::Finalized);

        let handle = unsafe { image.hook_symbol("compute", late_compute as usize) }.unwrap();
        LATE_HOOK.set(handle).unwrap();
        assert_eq!(image.state(), ImageState::Hooked);
        image.finalize().unwrap();
        assert_eq!(image.state(), ImageState::Finalized);
        // finalize is idempotent
        image.finalize().unwrap();

        let compute = unsafe { image.get::<Compute>("compute").unwrap() };
        assert_eq!(compute(1), 50);
        assert_eq!(image.hooks().len(), 1);
        assert_eq!(image.hooks()[0].target(), image.find_symbol("compute").unwrap());
    }

    static ANSWER_HOOK: OnceLock<HookHandle> = OnceLock::new();

    extern "C" fn other_answer() -> i32 {
        let hook = ANSWER_HOOK.get().unwrap();
        unsafe { hook.call_through(|original: extern "C" fn() -> i32| original()) - 35 }
    }

    #[test]
    fn standalone_installer() {
        init_logger();
        let generated = build(fixture());
        let mut image = Loader::new()
            .protect(false)
            .load(SONAME, &generated.bytes, None)
            .unwrap();
        image.relocate().unwrap();
        image.resolve(&host_table(), false).unwrap();
        image.finalize().unwrap();

        let mut installer = HookInstaller::new();
        let target = image.find_symbol("answer").unwrap();
        let handle = unsafe { installer.install(target, other_answer as usize) }.unwrap();
        // `mov eax, 42; ret` is too short to move into a trampoline
        assert_eq!(handle.strategy(), CallStrategy::Swap);
        assert_eq!(handle.substitute(), other_answer as usize);
        ANSWER_HOOK.set(handle).unwrap();

        let answer = unsafe { image.get::<extern "C" fn() -> i32>("answer").unwrap() };
        assert_eq!(answer(), 7);
    }
}
