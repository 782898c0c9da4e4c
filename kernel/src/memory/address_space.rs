//! Address spaces: one 4-level page-table tree per process.
//!
//! The upper half of the virtual range (root entries 256..512) is the
//! kernel region and is shared by reference between every address space:
//! the kernel space pre-allocates all 256 upper next-level tables at boot,
//! and user spaces copy those root entries once at creation.  A kernel
//! mapping made at any later time is therefore visible everywhere without
//! touching the per-process trees.  The lower half is private.
//!
//! **Invariants:**
//! - Every non-leaf entry is absent or points to a frame owned by this
//!   tree's level (user half) or by the kernel space (upper half).
//! - The kernel region is only ever mutated through the kernel space.
//! - Misaligned addresses are a programming error and panic; running out
//!   of frames mid-walk is recoverable (`MapError::OutOfMemory`).

use alloc::vec::Vec;

use super::frame::{FrameArena, ENTRIES_PER_TABLE};
use super::paging::{encode_leaf, table_indices, CacheKind, EntryFlags, MapFlags, PHYS_ADDR_MASK};
use super::{KERNEL_ROOT_SPLIT, PAGE_SIZE, USER_TOP};

/// Index of an address space in the kernel context's space table.
pub type SpaceId = usize;

/// Failures a mapping operation can report to its caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MapError {
    /// The frame arena ran dry during a table walk.
    OutOfMemory,
}

/// A hierarchical page-table tree rooted at one table frame.
pub struct AddressSpace {
    root: u64,
    kernel: bool,
    /// User-region frames this space owns and frees on destruction:
    /// intermediate tables plus data frames copied in by `clone_into`.
    owned: Vec<u64>,
}

impl AddressSpace {
    /// Build the kernel's address space, pre-allocating every upper-half
    /// next-level table so later spaces can share the kernel region.
    pub fn new_kernel(arena: &mut FrameArena) -> Result<Self, MapError> {
        let root = arena.alloc_frame().ok_or(MapError::OutOfMemory)?;
        for index in KERNEL_ROOT_SPLIT..ENTRIES_PER_TABLE {
            let table = arena.alloc_frame().ok_or(MapError::OutOfMemory)?;
            let link = EntryFlags::PRESENT | EntryFlags::WRITABLE;
            arena.set_entry(root, index, table | link.bits());
        }
        Ok(Self { root, kernel: true, owned: Vec::new() })
    }

    /// Build an empty user space sharing `kernel_space`'s upper half.
    pub fn new_user(arena: &mut FrameArena, kernel_space: &AddressSpace) -> Result<Self, MapError> {
        let root = arena.alloc_frame().ok_or(MapError::OutOfMemory)?;
        for index in KERNEL_ROOT_SPLIT..ENTRIES_PER_TABLE {
            arena.set_entry(root, index, arena.entry(kernel_space.root, index));
        }
        Ok(Self { root, kernel: false, owned: Vec::new() })
    }

    /// Physical address of the root table (the translation base).
    #[inline]
    pub fn root(&self) -> u64 {
        self.root
    }

    /// Map the frame at `phys` at virtual address `virt`.
    ///
    /// Missing intermediate tables are allocated zeroed and linked
    /// present+writable (+user when the leaf is user-accessible, so the
    /// hardware walk can reach it from Ring 3).  An existing leaf is
    /// overwritten.  The caller is responsible for invalidating the
    /// translation if this space is active.
    pub fn map(
        &mut self,
        arena: &mut FrameArena,
        phys: u64,
        virt: u64,
        flags: MapFlags,
        cache: CacheKind,
    ) -> Result<(), MapError> {
        assert!(virt % PAGE_SIZE == 0, "map: virt {:#x} not page-aligned", virt);
        assert!(phys % PAGE_SIZE == 0, "map: phys {:#x} not frame-aligned", phys);
        if !self.kernel {
            assert!(
                virt < USER_TOP,
                "map: kernel region mutated through a user space (virt {:#x})",
                virt
            );
        }
        let user = flags.contains(MapFlags::USER);
        self.install_leaf(arena, virt, encode_leaf(phys, flags, cache), user)
    }

    /// Clear the leaf entry for `virt`.
    ///
    /// Intermediate tables that become empty are not reclaimed.  Unmapping
    /// an address that was never mapped is a no-op.
    pub fn unmap(&mut self, arena: &mut FrameArena, virt: u64) {
        assert!(virt % PAGE_SIZE == 0, "unmap: virt {:#x} not page-aligned", virt);
        if !self.kernel {
            assert!(
                virt < USER_TOP,
                "unmap: kernel region mutated through a user space (virt {:#x})",
                virt
            );
        }
        let [i4, i3, i2, i1] = table_indices(virt);
        let mut table = self.root;
        for index in [i4, i3, i2] {
            let entry = arena.entry(table, index);
            if entry & EntryFlags::PRESENT.bits() == 0 {
                return;
            }
            table = entry & PHYS_ADDR_MASK;
        }
        arena.set_entry(table, i1, 0);
    }

    /// Walk the tables read-only and return the physical address backing
    /// `virt`, or `None` if any level is absent.
    pub fn translate(&self, arena: &FrameArena, virt: u64) -> Option<u64> {
        let [i4, i3, i2, i1] = table_indices(virt);
        let mut table = self.root;
        for index in [i4, i3, i2] {
            let entry = arena.entry(table, index);
            if entry & EntryFlags::PRESENT.bits() == 0 {
                return None;
            }
            table = entry & PHYS_ADDR_MASK;
        }
        let leaf = arena.entry(table, i1);
        if leaf & EntryFlags::PRESENT.bits() == 0 {
            return None;
        }
        Some((leaf & PHYS_ADDR_MASK) | (virt & (PAGE_SIZE - 1)))
    }

    /// Duplicate this space's user region into `dest`: every present leaf
    /// gets a freshly allocated frame with its content copied
    /// byte-for-byte and the same flag bits.  The kernel region is shared
    /// by reference.  Eager copy, no copy-on-write.
    pub fn clone_into(&self, dest: &mut AddressSpace, arena: &mut FrameArena) -> Result<(), MapError> {
        for index in KERNEL_ROOT_SPLIT..ENTRIES_PER_TABLE {
            arena.set_entry(dest.root, index, arena.entry(self.root, index));
        }
        for i4 in 0..KERNEL_ROOT_SPLIT {
            let e4 = arena.entry(self.root, i4);
            if e4 & EntryFlags::PRESENT.bits() == 0 {
                continue;
            }
            let t3 = e4 & PHYS_ADDR_MASK;
            for i3 in 0..ENTRIES_PER_TABLE {
                let e3 = arena.entry(t3, i3);
                if e3 & EntryFlags::PRESENT.bits() == 0 {
                    continue;
                }
                let t2 = e3 & PHYS_ADDR_MASK;
                for i2 in 0..ENTRIES_PER_TABLE {
                    let e2 = arena.entry(t2, i2);
                    if e2 & EntryFlags::PRESENT.bits() == 0 {
                        continue;
                    }
                    let t1 = e2 & PHYS_ADDR_MASK;
                    for i1 in 0..ENTRIES_PER_TABLE {
                        let leaf = arena.entry(t1, i1);
                        if leaf & EntryFlags::PRESENT.bits() == 0 {
                            continue;
                        }
                        let copy = arena.alloc_frame().ok_or(MapError::OutOfMemory)?;
                        // Recorded before the install so a failed walk
                        // still frees it when the clone is rolled back.
                        dest.owned.push(copy);
                        arena.copy_frame(leaf & PHYS_ADDR_MASK, copy);
                        let virt = virt_of(i4, i3, i2, i1);
                        let entry = (leaf & !PHYS_ADDR_MASK) | copy;
                        let user = leaf & EntryFlags::USER.bits() != 0;
                        dest.install_leaf(arena, virt, entry, user)?;
                    }
                }
            }
        }
        Ok(())
    }

    /// Scan the user region between `base` and `end` for `n_pages`
    /// contiguous unmapped pages; returns the lowest such base address.
    pub fn find_free_range(
        &self,
        arena: &FrameArena,
        base: u64,
        end: u64,
        n_pages: usize,
    ) -> Option<u64> {
        if n_pages == 0 {
            return None;
        }
        let mut run = 0usize;
        let mut virt = super::align_up(base);
        while virt + PAGE_SIZE <= end && virt < USER_TOP {
            if self.translate(arena, virt).is_none() {
                run += 1;
                if run == n_pages {
                    return Some(virt - (n_pages as u64 - 1) * PAGE_SIZE);
                }
            } else {
                run = 0;
            }
            virt += PAGE_SIZE;
        }
        None
    }

    /// Tear the space down, returning every owned user-region frame and
    /// the root to the arena.  Kernel-region tables belong to the kernel
    /// space and are never freed here.
    pub fn destroy(mut self, arena: &mut FrameArena) {
        assert!(!self.kernel, "destroy: the kernel address space lives forever");
        for frame in self.owned.drain(..) {
            arena.free_frame(frame);
        }
        arena.free_frame(self.root);
    }

    /// Write a pre-encoded leaf entry, growing intermediate tables as
    /// needed.
    fn install_leaf(
        &mut self,
        arena: &mut FrameArena,
        virt: u64,
        entry: u64,
        user: bool,
    ) -> Result<(), MapError> {
        let [i4, i3, i2, i1] = table_indices(virt);
        let t3 = self.ensure_table(arena, self.root, i4, user)?;
        let t2 = self.ensure_table(arena, t3, i3, user)?;
        let t1 = self.ensure_table(arena, t2, i2, user)?;
        arena.set_entry(t1, i1, entry);
        Ok(())
    }

    /// Make sure `table[index]` points at a next-level table, allocating
    /// one if absent, and widen it with the USER bit when the leaf below
    /// needs it.
    fn ensure_table(
        &mut self,
        arena: &mut FrameArena,
        table: u64,
        index: usize,
        user: bool,
    ) -> Result<u64, MapError> {
        let entry = arena.entry(table, index);
        if entry & EntryFlags::PRESENT.bits() != 0 {
            if user && entry & EntryFlags::USER.bits() == 0 {
                arena.set_entry(table, index, entry | EntryFlags::USER.bits());
            }
            return Ok(entry & PHYS_ADDR_MASK);
        }
        let frame = arena.alloc_frame().ok_or(MapError::OutOfMemory)?;
        let mut link = EntryFlags::PRESENT | EntryFlags::WRITABLE;
        if user {
            link |= EntryFlags::USER;
        }
        arena.set_entry(table, index, frame | link.bits());
        self.owned.push(frame);
        Ok(frame)
    }
}

/// Reassemble a canonical virtual address from its four table indices.
fn virt_of(i4: usize, i3: usize, i2: usize, i1: usize) -> u64 {
    let mut virt =
        ((i4 as u64) << 39) | ((i3 as u64) << 30) | ((i2 as u64) << 21) | ((i1 as u64) << 12);
    if i4 >= KERNEL_ROOT_SPLIT {
        virt |= 0xFFFF_0000_0000_0000;
    }
    virt
}
