use crate::{
    Error, Result,
    mmap::{MapFlags, Mmap, ProtFlags},
};
use alloc::format;
use core::{
    ffi::c_void,
    mem::MaybeUninit,
    ptr::NonNull,
};
use windows_sys::Win32::{
    Foundation::GetLastError,
    System::{
        Diagnostics::Debug::FlushInstructionCache,
        Memory::{
            self as Memory, MEM_COMMIT, MEM_RELEASE, MEM_RESERVE, PAGE_EXECUTE,
            PAGE_EXECUTE_READ, PAGE_EXECUTE_READWRITE, PAGE_NOACCESS, PAGE_PROTECTION_FLAGS,
            PAGE_READONLY, PAGE_READWRITE,
        },
        SystemInformation::{GetSystemInfo, SYSTEM_INFO},
        Threading::GetCurrentProcess,
    },
};

/// An implementation of Mmap trait
pub struct DefaultMmap;

fn prot_win(prot: ProtFlags) -> PAGE_PROTECTION_FLAGS {
    match prot.bits() {
        0 => PAGE_NOACCESS,
        1 => PAGE_READONLY,
        0b10 | 0b11 => PAGE_READWRITE,
        0b100 => PAGE_EXECUTE,
        0b101 => PAGE_EXECUTE_READ,
        _ => PAGE_EXECUTE_READWRITE,
    }
}

impl Mmap for DefaultMmap {
    unsafe fn mmap_anonymous(
        addr: usize,
        len: usize,
        prot: ProtFlags,
        _flags: MapFlags,
    ) -> Result<NonNull<c_void>> {
        let alloc = |addr: usize| unsafe {
            Memory::VirtualAlloc(addr as _, len, MEM_RESERVE | MEM_COMMIT, prot_win(prot))
        };
        let mut ptr = alloc(addr);
        // An occupied hint fails outright; fall back to any address so the
        // caller can see where the system would place the region.
        if ptr.is_null() && addr != 0 {
            ptr = alloc(0);
        }
        NonNull::new(ptr).ok_or_else(|| {
            let err_code = unsafe { GetLastError() };
            Error::Mmap {
                msg: format!("VirtualAlloc failed with error: {}", err_code).into(),
            }
        })
    }

    unsafe fn munmap(addr: NonNull<c_void>, _len: usize) -> Result<()> {
        if unsafe { Memory::VirtualFree(addr.as_ptr(), 0, MEM_RELEASE) } == 0 {
            let err_code = unsafe { GetLastError() };
            return Err(Error::Mmap {
                msg: format!("munmap error! error code: {}", err_code).into(),
            });
        }
        Ok(())
    }

    unsafe fn mprotect(addr: NonNull<c_void>, len: usize, prot: ProtFlags) -> Result<()> {
        let mut old = MaybeUninit::uninit();
        if unsafe { Memory::VirtualProtect(addr.as_ptr(), len, prot_win(prot), old.as_mut_ptr()) }
            == 0
        {
            let err_code = unsafe { GetLastError() };
            return Err(Error::Mmap {
                msg: format!("mprotect error! error code: {}", err_code).into(),
            });
        }
        Ok(())
    }

    // VirtualFree releases whole reservations only.
    unsafe fn trim(addr: NonNull<c_void>, len: usize) -> Result<bool> {
        unsafe { Self::mprotect(addr, len, ProtFlags::PROT_NONE)? };
        Ok(false)
    }

    fn page_size() -> usize {
        let mut info = MaybeUninit::<SYSTEM_INFO>::zeroed();
        unsafe {
            GetSystemInfo(info.as_mut_ptr());
            info.assume_init().dwPageSize as usize
        }
    }

    unsafe fn flush_icache(addr: usize, len: usize) {
        unsafe { FlushInstructionCache(GetCurrentProcess(), addr as *const c_void, len) };
    }
}
