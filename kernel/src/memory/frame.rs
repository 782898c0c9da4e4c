//! Physical frame arena.
//!
//! Frames are modeled as an arena indexed by frame number: physical
//! addresses are `index * PAGE_SIZE`, and page-table frames are read and
//! written through typed 512-entry accessors instead of raw address casts.
//! This is the narrow interface the rest of the core uses for physical
//! memory; a real machine would back it with the bootloader's memory map.

use alloc::boxed::Box;
use alloc::vec::Vec;

use super::PAGE_SIZE;

/// Entries per page-table frame (4096 / 8).
pub const ENTRIES_PER_TABLE: usize = 512;

const FRAME_BYTES: usize = PAGE_SIZE as usize;

/// Fixed-capacity allocator handing out zeroed 4 KiB frames.
///
/// Freed frames go on a free list and are reused before the watermark
/// grows.  Double frees and accesses to unallocated frames are kernel
/// invariant violations and panic.
pub struct FrameArena {
    frames: Vec<Box<[u8; FRAME_BYTES]>>,
    live: Vec<bool>,
    free: Vec<usize>,
    max_frames: usize,
}

impl FrameArena {
    /// Create an arena with room for at most `max_frames` frames.
    pub fn new(max_frames: usize) -> Self {
        Self {
            frames: Vec::new(),
            live: Vec::new(),
            free: Vec::new(),
            max_frames,
        }
    }

    /// Allocate a zeroed frame.  Returns its physical address, or `None`
    /// when the arena is exhausted.
    pub fn alloc_frame(&mut self) -> Option<u64> {
        if let Some(index) = self.free.pop() {
            self.live[index] = true;
            self.frames[index].fill(0);
            return Some(index as u64 * PAGE_SIZE);
        }
        if self.frames.len() >= self.max_frames {
            return None;
        }
        self.frames.push(Box::new([0u8; FRAME_BYTES]));
        self.live.push(true);
        Some((self.frames.len() - 1) as u64 * PAGE_SIZE)
    }

    /// Return a frame to the arena.
    pub fn free_frame(&mut self, phys: u64) {
        let index = self.index_of(phys);
        self.live[index] = false;
        self.free.push(index);
    }

    /// Number of frames currently allocated.
    pub fn live_frames(&self) -> usize {
        self.live.iter().filter(|l| **l).count()
    }

    /// Read one page-table entry of the table frame at `table_phys`.
    pub fn entry(&self, table_phys: u64, index: usize) -> u64 {
        assert!(index < ENTRIES_PER_TABLE, "frame: table index {} out of bounds", index);
        let bytes = &self.frame(table_phys)[index * 8..index * 8 + 8];
        u64::from_le_bytes(bytes.try_into().unwrap())
    }

    /// Write one page-table entry of the table frame at `table_phys`.
    pub fn set_entry(&mut self, table_phys: u64, index: usize, value: u64) {
        assert!(index < ENTRIES_PER_TABLE, "frame: table index {} out of bounds", index);
        let frame = self.frame_mut(table_phys);
        frame[index * 8..index * 8 + 8].copy_from_slice(&value.to_le_bytes());
    }

    /// Byte view of the frame at `phys`.
    pub fn frame(&self, phys: u64) -> &[u8; FRAME_BYTES] {
        let index = self.index_of(phys);
        &self.frames[index]
    }

    /// Mutable byte view of the frame at `phys`.
    pub fn frame_mut(&mut self, phys: u64) -> &mut [u8; FRAME_BYTES] {
        let index = self.index_of(phys);
        &mut self.frames[index]
    }

    /// Copy the contents of the frame at `src` into the frame at `dst`.
    pub fn copy_frame(&mut self, src: u64, dst: u64) {
        let si = self.index_of(src);
        let di = self.index_of(dst);
        assert_ne!(si, di, "frame: copy onto itself");
        if si < di {
            let (lo, hi) = self.frames.split_at_mut(di);
            hi[0].copy_from_slice(&lo[si][..]);
        } else {
            let (lo, hi) = self.frames.split_at_mut(si);
            lo[di].copy_from_slice(&hi[0][..]);
        }
    }

    fn index_of(&self, phys: u64) -> usize {
        assert!(phys % PAGE_SIZE == 0, "frame: {:#x} is not frame-aligned", phys);
        let index = (phys / PAGE_SIZE) as usize;
        assert!(
            index < self.frames.len() && self.live[index],
            "frame: {:#x} is not an allocated frame",
            phys
        );
        index
    }
}
