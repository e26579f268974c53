//! Fixed-offset tables of host function pointers.
//!
//! Foreign code often reaches host services through structures it indexes at
//! fixed byte offsets, such as a Java VM or JNI environment. A [`SlotBlock`] is
//! such a structure: a block filled with a recognisable pattern whose first
//! word points at the block itself, with host functions stored at the offsets
//! the foreign code calls through.
use crate::{Result, custom_error};
use alloc::{boxed::Box, format, vec};
use core::{ffi::c_void, fmt::Debug};

/// Stores `value` as a pointer-sized word at byte `offset` of `block`.
///
/// The offset needs no alignment, foreign layouts often pack pointers at
/// 4-byte offsets.
pub fn write_slot(block: &mut [u8], offset: usize, value: usize) -> Result<()> {
    let len = block.len();
    let slot = offset
        .checked_add(size_of::<usize>())
        .and_then(|end| block.get_mut(offset..end))
        .ok_or_else(|| {
            custom_error(format!(
                "slot 0x{:x} does not fit in a {}-byte block",
                offset, len
            ))
        })?;
    slot.copy_from_slice(&value.to_ne_bytes());
    Ok(())
}

/// Reads the pointer-sized word at byte `offset` of `block`.
pub fn read_slot(block: &[u8], offset: usize) -> Option<usize> {
    let slot = block.get(offset..offset.checked_add(size_of::<usize>())?)?;
    Some(usize::from_ne_bytes(slot.try_into().ok()?))
}

/// A heap block laid out like a foreign function table.
///
/// The storage never moves, so the address handed to foreign code stays valid
/// for the life of the block.
pub struct SlotBlock {
    words: Box<[usize]>,
    len: usize,
}

impl SlotBlock {
    /// Allocates `len` bytes filled with `fill`, with the block's own address
    /// in the first word.
    pub fn new(len: usize, fill: u8) -> Self {
        let len = len.max(size_of::<usize>());
        let words = len.div_ceil(size_of::<usize>());
        let mut block = SlotBlock {
            words: vec![usize::from_ne_bytes([fill; size_of::<usize>()]); words].into_boxed_slice(),
            len,
        };
        let addr = block.as_ptr() as usize;
        block.words[0] = addr;
        block
    }

    /// Address of the block, what foreign code receives.
    #[inline]
    pub fn as_ptr(&self) -> *const c_void {
        self.words.as_ptr().cast()
    }

    /// Mutable address of the block.
    #[inline]
    pub fn as_mut_ptr(&mut self) -> *mut c_void {
        self.words.as_mut_ptr().cast()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[inline]
    pub fn as_bytes(&self) -> &[u8] {
        unsafe { core::slice::from_raw_parts(self.words.as_ptr().cast(), self.len) }
    }

    #[inline]
    pub fn as_bytes_mut(&mut self) -> &mut [u8] {
        unsafe { core::slice::from_raw_parts_mut(self.words.as_mut_ptr().cast(), self.len) }
    }

    /// Stores a host function or object address at `offset`.
    pub fn set(&mut self, offset: usize, value: *const ()) -> Result<&mut Self> {
        write_slot(self.as_bytes_mut(), offset, value as usize)?;
        Ok(self)
    }

    /// Reads the word at `offset`.
    pub fn get(&self, offset: usize) -> Option<usize> {
        read_slot(self.as_bytes(), offset)
    }
}

impl Debug for SlotBlock {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("SlotBlock")
            .field("addr", &self.as_ptr())
            .field("len", &self.len)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn block_points_at_itself() {
        let block = SlotBlock::new(0x100, b'A');
        assert_eq!(block.len(), 0x100);
        assert_eq!(block.get(0), Some(block.as_ptr() as usize));
        assert_eq!(block.as_bytes()[size_of::<usize>()], b'A');
        assert_eq!(block.as_bytes()[0xff], b'A');
    }

    #[test]
    fn slots_at_unaligned_offsets() {
        let mut block = SlotBlock::new(0x200, b'A');
        block
            .set(0x4c, 0x1234 as *const ())
            .and_then(|block| block.set(0x18, 0x5678 as *const ()))
            .unwrap();
        assert_eq!(block.get(0x4c), Some(0x1234));
        assert_eq!(block.get(0x18), Some(0x5678));
        // neighbours keep the fill pattern
        assert_eq!(block.as_bytes()[0x4c + size_of::<usize>()], b'A');
    }

    #[test]
    fn out_of_range_slots_are_rejected() {
        let mut block = SlotBlock::new(0x20, 0);
        assert!(block.set(0x20 - size_of::<usize>(), 1 as *const ()).is_ok());
        assert!(block.set(0x1d, 1 as *const ()).is_err());
        assert!(block.set(usize::MAX, 1 as *const ()).is_err());
        assert!(block.get(0x20).is_none());
        let mut raw = [0u8; 4];
        assert!(write_slot(&mut raw, 1, 1).is_err());
    }
}
