//! Copies between kernel buffers and user-region virtual memory.
//!
//! Every page is translated individually through the target space, so a
//! transfer spanning pages that are virtually contiguous but physically
//! scattered still lands in the right frames.  An unmapped page anywhere
//! in the range fails the whole transfer.

use super::address_space::AddressSpace;
use super::frame::FrameArena;
use super::{is_user_addr, PAGE_SIZE};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UaccessError {
    /// The range leaves the user region or crosses an unmapped page.
    BadAddress,
}

/// Copy `bytes` into `space` starting at user virtual address `virt`.
pub fn copy_to_user(
    arena: &mut FrameArena,
    space: &AddressSpace,
    virt: u64,
    bytes: &[u8],
) -> Result<(), UaccessError> {
    check_range(virt, bytes.len())?;
    let mut offset = 0usize;
    while offset < bytes.len() {
        let addr = virt + offset as u64;
        let phys = space
            .translate(arena, addr)
            .ok_or(UaccessError::BadAddress)?;
        let in_page = (PAGE_SIZE - addr % PAGE_SIZE) as usize;
        let chunk = in_page.min(bytes.len() - offset);
        let page_off = (phys % PAGE_SIZE) as usize;
        let frame = arena.frame_mut(phys - phys % PAGE_SIZE);
        frame[page_off..page_off + chunk].copy_from_slice(&bytes[offset..offset + chunk]);
        offset += chunk;
    }
    Ok(())
}

/// Copy `buf.len()` bytes out of `space` starting at user virtual
/// address `virt`.
pub fn copy_from_user(
    arena: &FrameArena,
    space: &AddressSpace,
    virt: u64,
    buf: &mut [u8],
) -> Result<(), UaccessError> {
    check_range(virt, buf.len())?;
    let mut offset = 0usize;
    while offset < buf.len() {
        let addr = virt + offset as u64;
        let phys = space
            .translate(arena, addr)
            .ok_or(UaccessError::BadAddress)?;
        let in_page = (PAGE_SIZE - addr % PAGE_SIZE) as usize;
        let chunk = in_page.min(buf.len() - offset);
        let page_off = (phys % PAGE_SIZE) as usize;
        let frame = arena.frame(phys - phys % PAGE_SIZE);
        buf[offset..offset + chunk].copy_from_slice(&frame[page_off..page_off + chunk]);
        offset += chunk;
    }
    Ok(())
}

fn check_range(virt: u64, len: usize) -> Result<(), UaccessError> {
    let end = virt.checked_add(len as u64).ok_or(UaccessError::BadAddress)?;
    if is_user_addr(virt) && (len == 0 || is_user_addr(end - 1)) {
        Ok(())
    } else {
        Err(UaccessError::BadAddress)
    }
}
