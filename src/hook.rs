//! Entry-point hooks with call-through.
//!
//! Installing a hook overwrites the first bytes of a function with an absolute
//! jump to a substitute. The original behaviour stays reachable in one of two
//! ways, chosen per hook:
//!
//! * [`CallStrategy::Trampoline`]: the overwritten instructions are whole and
//!   position independent, so they are copied into an executable trampoline
//!   that jumps back to the first untouched instruction.
//! * [`CallStrategy::Swap`]: otherwise the saved bytes are put back for the
//!   duration of each [`HookHandle::call_through`] and the jump is re-applied
//!   afterwards. This is neither reentrant nor thread-safe: another thread
//!   entering the function meanwhile runs the original, and a recursive call
//!   through the hook bypasses the substitute.
//!
//! Hooking the same address twice is not detected. The second hook saves the
//! first hook's jump as "original" bytes.
use crate::{
    Result,
    arch::{self, MAX_PATCH_SIZE, PROLOGUE_WINDOW, Patch},
    hook_error,
    mmap::{DefaultMmap, MapFlags, Mmap, ProtFlags},
    segment::{page_down, page_up},
};
use alloc::{format, vec::Vec};
use core::{ffi::c_void, fmt::Debug, marker::PhantomData, mem::size_of, ptr::NonNull};

/// Bytes reserved for every trampoline.
const SLOT_SIZE: usize = 64;

/// How [`HookHandle::call_through`] reaches the original code.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CallStrategy {
    /// Relocated prologue followed by a jump back into the original function.
    Trampoline,
    /// Original bytes swapped back in around every call.
    Swap,
}

/// Executable pages carved into trampoline slots.
struct TrampolinePool {
    pages: Vec<NonNull<c_void>>,
    /// Offset of the next free slot in the last page.
    next: usize,
    page_size: usize,
    munmap: unsafe fn(NonNull<c_void>, usize) -> Result<()>,
}

impl TrampolinePool {
    fn alloc<M: Mmap>(&mut self) -> Result<usize> {
        if self.pages.is_empty() || self.next + SLOT_SIZE > self.page_size {
            let page = unsafe {
                M::mmap_anonymous(0, self.page_size, ProtFlags::RWX, MapFlags::MAP_PRIVATE)
            }
            .map_err(|err| {
                crate::allocation_error(format!("cannot map trampoline page: {}", err))
            })?;
            self.pages.push(page);
            self.next = 0;
        }
        let page = self.pages[self.pages.len() - 1].as_ptr() as usize;
        let slot = page + self.next;
        self.next += SLOT_SIZE;
        Ok(slot)
    }
}

impl Drop for TrampolinePool {
    fn drop(&mut self) {
        for page in self.pages.drain(..) {
            if let Err(_err) = unsafe { (self.munmap)(page, self.page_size) } {
                #[cfg(feature = "log")]
                log::warn!("failed to release trampoline page: {}", _err);
            }
        }
    }
}

/// Installs hooks and owns the trampolines they call through.
///
/// Trampoline pages are released when the installer is dropped; every
/// [`HookHandle`] it produced must not be called through afterwards.
pub struct HookInstaller<M: Mmap = DefaultMmap> {
    pool: TrampolinePool,
    _marker: PhantomData<M>,
}

impl<M: Mmap> Debug for HookInstaller<M> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("HookInstaller")
            .field("pages", &self.pool.pages.len())
            .finish()
    }
}

impl HookInstaller<DefaultMmap> {
    /// Creates an installer backed by the default memory primitives.
    pub fn new() -> Self {
        Self::with_mmap()
    }
}

impl Default for HookInstaller<DefaultMmap> {
    fn default() -> Self {
        Self::new()
    }
}

impl<M: Mmap> HookInstaller<M> {
    /// Creates an installer that maps trampolines through `M`.
    pub fn with_mmap() -> Self {
        HookInstaller {
            pool: TrampolinePool {
                pages: Vec::new(),
                next: 0,
                page_size: M::page_size(),
                munmap: M::munmap,
            },
            _marker: PhantomData,
        }
    }

    /// Redirects the function at `target` to `substitute`.
    ///
    /// On ARM an odd `target` denotes a Thumb function. The pages holding the
    /// patch are left readable, writable and executable.
    ///
    /// # Safety
    /// `target` must be the entry of a function at least as long as the jump
    /// patch, followed by `PROLOGUE_WINDOW` readable bytes. A shorter function
    /// gets its neighbour overwritten. No thread may be executing its first
    /// instructions, and `substitute` must have a compatible signature.
    pub unsafe fn install(&mut self, target: usize, substitute: usize) -> Result<HookHandle> {
        unsafe { self.install_within(target, substitute, PROLOGUE_WINDOW, ProtFlags::RWX) }
    }

    /// Like [`HookInstaller::install`], reading at most `available` bytes at
    /// the target. `prot` is the protection call-through restores after
    /// swapping the original bytes in.
    pub(crate) unsafe fn install_within(
        &mut self,
        target: usize,
        substitute: usize,
        available: usize,
        prot: ProtFlags,
    ) -> Result<HookHandle> {
        arch::check_target(target).map_err(hook_error)?;
        let code = arch::code_address(target);
        let patch = arch::jump_patch(target, substitute);
        if available < patch.len() {
            return Err(hook_error(format!(
                "target 0x{:x} has {} bytes, the jump needs {}",
                target,
                available,
                patch.len()
            )));
        }

        let window = available.min(PROLOGUE_WINDOW);
        let prologue = unsafe { core::slice::from_raw_parts(code as *const u8, window) };
        let mut original = [0u8; MAX_PATCH_SIZE];
        original[..patch.len()].copy_from_slice(&prologue[..patch.len()]);

        let relocatable = arch::patch_window(prologue, patch.len())
            .filter(|&len| len + arch::JUMP_SIZE <= SLOT_SIZE);
        let (strategy, trampoline) = match relocatable {
            Some(len) => {
                let slot = self.pool.alloc::<M>()?;
                let back = arch::jump_patch(slot + len, code + len);
                unsafe {
                    core::ptr::copy_nonoverlapping(prologue.as_ptr(), slot as *mut u8, len);
                    core::ptr::copy_nonoverlapping(
                        back.as_bytes().as_ptr(),
                        (slot + len) as *mut u8,
                        back.len(),
                    );
                    M::flush_icache(slot, len + back.len());
                }
                (CallStrategy::Trampoline, slot)
            }
            None => (CallStrategy::Swap, 0),
        };

        #[cfg(feature = "log")]
        log::debug!(
            "hook 0x{:x} -> 0x{:x}: {:?}, {} byte patch",
            target,
            substitute,
            strategy,
            patch.len()
        );

        let handle = HookHandle {
            target,
            substitute,
            code,
            original,
            patch,
            strategy,
            trampoline,
            prot,
            page_size: M::page_size(),
            mprotect: M::mprotect,
            flush: M::flush_icache,
        };
        unsafe {
            handle.unprotect()?;
            handle.write(handle.patch.as_bytes());
        }
        Ok(handle)
    }
}

/// An installed hook.
///
/// Handles are plain values: copying one does not install anything twice. A
/// handle stays valid as long as the installer (or image) that produced it.
#[derive(Clone, Copy)]
pub struct HookHandle {
    target: usize,
    substitute: usize,
    code: usize,
    original: [u8; MAX_PATCH_SIZE],
    patch: Patch,
    strategy: CallStrategy,
    trampoline: usize,
    prot: ProtFlags,
    page_size: usize,
    mprotect: unsafe fn(NonNull<c_void>, usize, ProtFlags) -> Result<()>,
    flush: unsafe fn(usize, usize),
}

impl Debug for HookHandle {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("HookHandle")
            .field("target", &format_args!("0x{:x}", self.target))
            .field("substitute", &format_args!("0x{:x}", self.substitute))
            .field("strategy", &self.strategy)
            .field("patch", &self.patch)
            .finish()
    }
}

impl HookHandle {
    /// The hooked address, as passed to the installer.
    #[inline]
    pub fn target(&self) -> usize {
        self.target
    }

    /// The address calls are redirected to.
    #[inline]
    pub fn substitute(&self) -> usize {
        self.substitute
    }

    #[inline]
    pub fn strategy(&self) -> CallStrategy {
        self.strategy
    }

    /// The bytes the jump replaced.
    #[inline]
    pub fn original_bytes(&self) -> &[u8] {
        &self.original[..self.patch.len()]
    }

    /// The jump written over the entry point.
    #[inline]
    pub fn patch_bytes(&self) -> &[u8] {
        self.patch.as_bytes()
    }

    /// Runs `f` with a callable pointer to the original function.
    ///
    /// `F` is the function pointer type of the target, e.g.
    /// `extern "C" fn(i32) -> i32`.
    ///
    /// # Safety
    /// The installer or image that produced the handle must still be alive and
    /// `F` must match the target's signature. With [`CallStrategy::Swap`] no
    /// other thread may call the target while `f` runs.
    pub unsafe fn call_through<F: Copy, R>(&self, f: impl FnOnce(F) -> R) -> R {
        const { assert!(size_of::<F>() == size_of::<usize>()) };
        match self.strategy {
            CallStrategy::Trampoline => {
                let entry = self.trampoline | (self.target & 1);
                f(unsafe { core::mem::transmute_copy::<usize, F>(&entry) })
            }
            CallStrategy::Swap => {
                let _guard = unsafe { SwapGuard::new(self) };
                f(unsafe { core::mem::transmute_copy::<usize, F>(&self.target) })
            }
        }
    }

    /// Makes the patched pages writable.
    unsafe fn unprotect(&self) -> Result<()> {
        unsafe { self.set_prot(ProtFlags::RWX) }
    }

    unsafe fn set_prot(&self, prot: ProtFlags) -> Result<()> {
        let start = page_down(self.code, self.page_size);
        let end = page_up(self.code + self.patch.len(), self.page_size);
        let addr = NonNull::new(start as *mut c_void)
            .ok_or_else(|| hook_error("hook target lies in the null page"))?;
        unsafe { (self.mprotect)(addr, end - start, prot) }
    }

    /// Writes `bytes` at the entry and flushes them. Pages must be writable.
    unsafe fn write(&self, bytes: &[u8]) {
        unsafe {
            core::ptr::copy_nonoverlapping(bytes.as_ptr(), self.code as *mut u8, bytes.len());
            (self.flush)(self.code, bytes.len());
        }
    }
}

/// Puts the original bytes back for its lifetime.
struct SwapGuard<'a> {
    handle: &'a HookHandle,
}

impl<'a> SwapGuard<'a> {
    unsafe fn new(handle: &'a HookHandle) -> Self {
        unsafe {
            if let Err(_err) = handle.unprotect() {
                #[cfg(feature = "log")]
                log::warn!("cannot unprotect hook 0x{:x}: {}", handle.target, _err);
            }
            handle.write(handle.original_bytes());
        }
        SwapGuard { handle }
    }
}

impl Drop for SwapGuard<'_> {
    fn drop(&mut self) {
        let handle = self.handle;
        unsafe {
            handle.write(handle.patch.as_bytes());
            if let Err(_err) = handle.set_prot(handle.prot) {
                #[cfg(feature = "log")]
                log::warn!("cannot restore protection of hook 0x{:x}: {}", handle.target, _err);
            }
        }
    }
}
