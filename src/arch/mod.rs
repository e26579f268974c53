//! Architectures supported by the loader.
//!
//! Each backend provides the relocation type numbers the relocator understands,
//! the absolute-jump encoding used for hooks, a prologue decoder deciding whether
//! hooked instructions can be moved into a trampoline, and an instruction cache
//! flush.
cfg_if::cfg_if! {
    if #[cfg(target_arch = "x86_64")]{
        mod x86_64;
        pub use x86_64::*;
    }else if #[cfg(target_arch="aarch64")]{
        mod aarch64;
        pub use aarch64::*;
    }else if #[cfg(target_arch = "arm")]{
        mod arm;
        pub use arm::*;
    }
}

pub const REL_NONE: u32 = 0;

/// Largest jump sequence any backend emits.
pub(crate) const MAX_PATCH_SIZE: usize = 16;

/// Instruction bytes written over a hooked entry point.
#[derive(Clone, Copy)]
pub(crate) struct Patch {
    bytes: [u8; MAX_PATCH_SIZE],
    len: usize,
}

impl Patch {
    #[inline]
    pub(crate) const fn new() -> Self {
        Self {
            bytes: [0; MAX_PATCH_SIZE],
            len: 0,
        }
    }

    #[inline]
    pub(crate) fn push(&mut self, bytes: &[u8]) {
        self.bytes[self.len..self.len + bytes.len()].copy_from_slice(bytes);
        self.len += bytes.len();
    }

    #[inline]
    pub(crate) fn as_bytes(&self) -> &[u8] {
        &self.bytes[..self.len]
    }

    #[inline]
    pub(crate) fn len(&self) -> usize {
        self.len
    }
}

impl core::fmt::Debug for Patch {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_list().entries(self.as_bytes()).finish()
    }
}
