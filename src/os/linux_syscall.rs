use crate::{
    Error, Result,
    mmap::{MapFlags, Mmap, ProtFlags},
};
use core::{ffi::c_void, ptr::NonNull};
use syscalls::Sysno;

/// An implementation of Mmap trait
pub struct DefaultMmap;

#[inline]
fn mmap_anonymous(
    addr: *mut c_void,
    len: usize,
    prot: ProtFlags,
    flags: MapFlags,
) -> Result<*mut c_void> {
    let ptr = unsafe {
        #[cfg(target_pointer_width = "32")]
        let syscall = Sysno::mmap2;
        #[cfg(not(target_pointer_width = "32"))]
        let syscall = Sysno::mmap;
        from_ret(
            syscalls::raw_syscall!(
                syscall,
                addr,
                len,
                prot.bits(),
                flags.union(MapFlags::MAP_ANONYMOUS).bits(),
                usize::MAX,
                0
            ),
            "mmap anonymous failed",
        )?
    };
    Ok(ptr as *mut c_void)
}

impl Mmap for DefaultMmap {
    unsafe fn mmap_anonymous(
        addr: usize,
        len: usize,
        prot: ProtFlags,
        flags: MapFlags,
    ) -> Result<NonNull<c_void>> {
        let ptr = mmap_anonymous(addr as _, len, prot, flags)?;
        NonNull::new(ptr).ok_or_else(|| map_error("mmap returned null"))
    }

    unsafe fn munmap(addr: NonNull<c_void>, len: usize) -> Result<()> {
        unsafe {
            from_ret(
                syscalls::raw_syscall!(Sysno::munmap, addr.as_ptr(), len),
                "munmap failed",
            )?;
        }
        Ok(())
    }

    unsafe fn mprotect(addr: NonNull<c_void>, len: usize, prot: ProtFlags) -> Result<()> {
        unsafe {
            from_ret(
                syscalls::raw_syscall!(Sysno::mprotect, addr.as_ptr(), len, prot.bits()),
                "mprotect failed",
            )?;
        }
        Ok(())
    }
}

/// Converts a raw syscall return value to a result.
#[inline(always)]
fn from_ret(value: usize, msg: &'static str) -> Result<usize> {
    // Same check musl uses for error returns.
    if value > -4096isize as usize {
        return Err(map_error(msg));
    }
    Ok(value)
}

#[cold]
#[inline(never)]
fn map_error(msg: &'static str) -> Error {
    Error::Mmap { msg: msg.into() }
}
