//! Physical and virtual memory management.

pub mod address_space;
pub mod frame;
pub mod paging;
pub mod pcid;
pub mod tlb;
pub mod uaccess;

/// Size of one page / physical frame.
pub const PAGE_SIZE: u64 = 4096;

/// First virtual address of the kernel region (upper half).
///
/// Everything at or above this address is mapped identically in every
/// address space; everything below is private per process.
pub const KERNEL_BASE: u64 = 0xFFFF_8000_0000_0000;

/// One-past-the-end of the user region (lower half).
pub const USER_TOP: u64 = 0x0000_8000_0000_0000;

/// First root-table index of the kernel region (entries 256..512).
pub const KERNEL_ROOT_SPLIT: usize = 256;

/// Whether `virt` lies in the private user region.
#[inline]
pub fn is_user_addr(virt: u64) -> bool {
    virt < USER_TOP
}

/// Round `addr` up to the next page boundary.
#[inline]
pub fn align_up(addr: u64) -> u64 {
    (addr + PAGE_SIZE - 1) & !(PAGE_SIZE - 1)
}
