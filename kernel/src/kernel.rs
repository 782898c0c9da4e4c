//! The kernel context: every piece of system-wide state in one place.
//!
//! There are no ambient singletons; address spaces, threads, cores,
//! devices and the interrupt table all live in [`Kernel`], built once at
//! boot and handed around by reference.  The operation implementations
//! are spread over the subsystem modules as further `impl Kernel` blocks.

use alloc::boxed::Box;
use alloc::vec;
use alloc::vec::Vec;

use spin::{Mutex, Once};

use crate::device::{Device, IrqBinding};
use crate::memory::address_space::{AddressSpace, MapError, SpaceId};
use crate::memory::frame::FrameArena;
use crate::memory::paging::{CacheKind, MapFlags};
use crate::memory::tlb::TlbOps;
use crate::memory::KERNEL_BASE;
use crate::task::scheduler::{CpuId, ManagedCpu};
use crate::task::thread::{Thread, Tid};

/// Where kernel-thread stacks are carved out of the kernel region.
const KERNEL_STACK_AREA: u64 = KERNEL_BASE + 0x0100_0000;

/// Number of hardware interrupt vectors.
const N_VECTORS: usize = 256;

pub struct Kernel {
    pub(crate) arena: FrameArena,
    pub(crate) spaces: Vec<Option<AddressSpace>>,
    pub(crate) kernel_space: SpaceId,
    pub(crate) threads: Vec<Thread>,
    pub(crate) next_tid: Tid,
    pub(crate) cpus: Vec<ManagedCpu>,
    pub(crate) devices: Vec<Device>,
    pub(crate) irq_bindings: Vec<Option<IrqBinding>>,
    pub(crate) next_kernel_stack: u64,
    pub(crate) tlb: Box<dyn TlbOps + Send>,
}

impl Kernel {
    /// Boot-time construction.  Running out of frames while building the
    /// kernel address space means the machine is unusable.
    pub fn new(max_frames: usize, tlb: Box<dyn TlbOps + Send>) -> Self {
        let mut arena = FrameArena::new(max_frames);
        let kernel_space = match AddressSpace::new_kernel(&mut arena) {
            Ok(space) => space,
            Err(MapError::OutOfMemory) => {
                panic!("boot: {} frames cannot hold the kernel address space", max_frames)
            }
        };
        klog::info!("kernel: context up, {} frames managed", max_frames);
        Self {
            arena,
            spaces: vec![Some(kernel_space)],
            kernel_space: 0,
            threads: Vec::new(),
            next_tid: 1,
            cpus: Vec::new(),
            devices: Vec::new(),
            irq_bindings: vec![None; N_VECTORS],
            next_kernel_stack: KERNEL_STACK_AREA,
            tlb,
        }
    }

    // ── Address-space management ──

    /// Create an empty user address space sharing the kernel region.
    pub fn create_address_space(&mut self) -> Result<SpaceId, MapError> {
        let Kernel { arena, spaces, kernel_space, .. } = self;
        let Some(kernel_ref) = spaces[*kernel_space].as_ref() else {
            panic!("memory: the kernel address space is gone");
        };
        let space = AddressSpace::new_user(arena, kernel_ref)?;
        if let Some(slot) = spaces.iter().position(|s| s.is_none()) {
            spaces[slot] = Some(space);
            Ok(slot)
        } else {
            spaces.push(Some(space));
            Ok(spaces.len() - 1)
        }
    }

    /// Duplicate `src` into a fresh space: user pages eagerly copied,
    /// kernel region shared.
    pub fn clone_address_space(&mut self, src: SpaceId) -> Result<SpaceId, MapError> {
        let new = self.create_address_space()?;
        let result = {
            let Kernel { arena, spaces, .. } = self;
            let (src_ref, new_ref) = if src < new {
                let (lo, hi) = spaces.split_at_mut(new);
                (lo[src].as_ref(), hi[0].as_mut())
            } else {
                let (lo, hi) = spaces.split_at_mut(src);
                (hi[0].as_ref(), lo[new].as_mut())
            };
            match (src_ref, new_ref) {
                (Some(s), Some(n)) => s.clone_into(n, arena),
                _ => panic!("memory: clone of a dead space {}", src),
            }
        };
        if let Err(error) = result {
            self.destroy_space(new);
            return Err(error);
        }
        Ok(new)
    }

    /// Tear a user space down, flushing any context tags bound to it.
    pub fn destroy_space(&mut self, space: SpaceId) {
        assert!(space != self.kernel_space, "memory: the kernel address space lives forever");
        let Some(dead) = self.spaces[space].take() else {
            panic!("memory: double destroy of space {}", space);
        };
        let Kernel { cpus, tlb, arena, .. } = self;
        for cpu in cpus.iter_mut() {
            cpu.pcid.drop_space(space, tlb.as_mut());
            if cpu.active_space == Some(space) {
                cpu.active_space = None;
            }
        }
        dead.destroy(arena);
    }

    /// Map one page in `space`.  When the mapping is visible on the
    /// executing core (the space is active there, or it is the shared
    /// kernel region) the stale translation is invalidated.
    pub fn map_page(
        &mut self,
        cpu: CpuId,
        space: SpaceId,
        phys: u64,
        virt: u64,
        flags: MapFlags,
        cache: CacheKind,
    ) -> Result<(), MapError> {
        let kernel_space = self.kernel_space;
        let Kernel { arena, spaces, cpus, tlb, .. } = self;
        let Some(space_ref) = spaces[space].as_mut() else {
            panic!("memory: map into dead space {}", space);
        };
        space_ref.map(arena, phys, virt, flags, cache)?;
        if space == kernel_space || cpus[cpu].active_space == Some(space) {
            tlb.invalidate_page(virt);
        }
        Ok(())
    }

    /// Remove one mapping from `space`, invalidating as `map_page` does.
    pub fn unmap_page(&mut self, cpu: CpuId, space: SpaceId, virt: u64) {
        let kernel_space = self.kernel_space;
        let Kernel { arena, spaces, cpus, tlb, .. } = self;
        let Some(space_ref) = spaces[space].as_mut() else {
            panic!("memory: unmap from dead space {}", space);
        };
        space_ref.unmap(arena, virt);
        if space == kernel_space || cpus[cpu].active_space == Some(space) {
            tlb.invalidate_page(virt);
        }
    }

    pub fn translate(&self, space: SpaceId, virt: u64) -> Option<u64> {
        self.space(space).translate(&self.arena, virt)
    }

    pub fn find_free_range(&self, space: SpaceId, base: u64, end: u64, n_pages: usize) -> Option<u64> {
        self.space(space).find_free_range(&self.arena, base, end, n_pages)
    }

    /// Make `space` the active translation context on `cpu`, going
    /// through the core's PCID cache so a hot space switches in without
    /// a flush.
    pub fn activate_space(&mut self, cpu: CpuId, space: SpaceId) {
        let Kernel { spaces, cpus, tlb, .. } = self;
        let Some(space_ref) = spaces[space].as_ref() else {
            panic!("memory: activate of dead space {}", space);
        };
        let root = space_ref.root();
        let core = &mut cpus[cpu];
        let pcid = core.pcid.acquire(space, tlb.as_mut());
        if core.active_space != Some(space) {
            tlb.load_root(root, pcid);
            core.active_space = Some(space);
        }
    }

    /// Physical address of `space`'s root table.
    pub fn space_root(&self, space: SpaceId) -> u64 {
        self.space(space).root()
    }

    pub fn space_is_live(&self, space: SpaceId) -> bool {
        matches!(self.spaces.get(space), Some(Some(_)))
    }

    fn space(&self, space: SpaceId) -> &AddressSpace {
        match self.spaces.get(space) {
            Some(Some(space_ref)) => space_ref,
            _ => panic!("memory: stale space id {}", space),
        }
    }

    // ── Frame allocator passthrough ──

    pub fn alloc_frame(&mut self) -> Option<u64> {
        self.arena.alloc_frame()
    }

    pub fn free_frame(&mut self, phys: u64) {
        self.arena.free_frame(phys);
    }
}

// ── Global context ──

static KERNEL: Once<Mutex<Kernel>> = Once::new();

/// Build the global kernel context.  Later calls are ignored.
pub fn init(max_frames: usize, tlb: Box<dyn TlbOps + Send>) {
    KERNEL.call_once(|| Mutex::new(Kernel::new(max_frames, tlb)));
}

/// The global kernel context; panics before [`init`].
pub fn kernel() -> &'static Mutex<Kernel> {
    match KERNEL.get() {
        Some(kernel) => kernel,
        None => panic!("kernel: context used before init"),
    }
}

#[cfg(test)]
pub(crate) fn test_kernel() -> (Kernel, CpuId) {
    use crate::memory::tlb::NullTlb;
    let mut kernel = Kernel::new(4096, Box::new(NullTlb));
    let cpu = kernel.add_cpu(0);
    (kernel, cpu)
}

#[cfg(test)]
pub(crate) fn test_kernel_with_tlb() -> (Kernel, CpuId, crate::memory::tlb::recording::TlbLog) {
    use crate::memory::tlb::recording::RecordingTlb;
    let (tlb, log) = RecordingTlb::new();
    let mut kernel = Kernel::new(4096, Box::new(tlb));
    let cpu = kernel.add_cpu(0);
    (kernel, cpu, log)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::tlb::recording::TlbEvent;
    use crate::memory::USER_TOP;

    const RW: MapFlags = MapFlags::PRESENT.union(MapFlags::WRITABLE);

    #[test]
    fn spaces_reuse_freed_slots() {
        let (mut kernel, _cpu) = test_kernel();
        let a = kernel.create_address_space().unwrap();
        let b = kernel.create_address_space().unwrap();
        assert_ne!(a, b);
        kernel.destroy_space(a);
        assert!(!kernel.space_is_live(a));
        let c = kernel.create_address_space().unwrap();
        assert_eq!(c, a);
    }

    #[test]
    fn mapping_an_active_space_invalidates_the_page() {
        let (mut kernel, cpu, log) = test_kernel_with_tlb();
        let space = kernel.create_address_space().unwrap();
        let phys = kernel.alloc_frame().unwrap();

        // Not active anywhere yet: no invalidation.
        kernel
            .map_page(cpu, space, phys, 0x40_0000, RW | MapFlags::USER, CacheKind::Normal)
            .unwrap();
        assert!(!log.events().contains(&TlbEvent::InvalidatePage(0x40_0000)));

        kernel.activate_space(cpu, space);
        log.clear();
        kernel.unmap_page(cpu, space, 0x40_0000);
        assert_eq!(log.events(), vec![TlbEvent::InvalidatePage(0x40_0000)]);
    }

    #[test]
    fn kernel_region_mappings_always_invalidate() {
        let (mut kernel, cpu, log) = test_kernel_with_tlb();
        let phys = kernel.alloc_frame().unwrap();
        let space = kernel.kernel_space;
        kernel
            .map_page(cpu, space, phys, KERNEL_BASE, RW | MapFlags::GLOBAL, CacheKind::Normal)
            .unwrap();
        assert!(log.events().contains(&TlbEvent::InvalidatePage(KERNEL_BASE)));
    }

    #[test]
    fn clone_failure_rolls_the_new_space_back() {
        use crate::memory::tlb::NullTlb;
        // Enough for the kernel space, two user roots, one mapped page
        // with its tables, and nothing more.
        let mut kernel = Kernel::new(257 + 1 + 4 + 1, Box::new(NullTlb));
        let cpu = kernel.add_cpu(0);
        let src = kernel.create_address_space().unwrap();
        let phys = kernel.alloc_frame().unwrap();
        kernel
            .map_page(cpu, src, phys, 0x40_0000, RW | MapFlags::USER, CacheKind::Normal)
            .unwrap();

        let live_before = kernel.arena.live_frames();
        assert_eq!(kernel.clone_address_space(src), Err(MapError::OutOfMemory));
        assert_eq!(kernel.arena.live_frames(), live_before);
    }

    #[test]
    fn destroyed_space_is_dropped_from_every_pcid_cache() {
        let (mut kernel, cpu, log) = test_kernel_with_tlb();
        let space = kernel.create_address_space().unwrap();
        kernel.activate_space(cpu, space);
        log.clear();

        kernel.destroy_space(space);
        assert!(matches!(log.events()[..], [TlbEvent::FlushContext(_)]));
        assert_eq!(kernel.cpus[cpu].active_space, None);
    }

    #[test]
    fn free_range_skips_occupied_pages() {
        let (mut kernel, cpu) = test_kernel();
        let space = kernel.create_address_space().unwrap();
        for virt in [0x2000u64, 0x3000] {
            let phys = kernel.alloc_frame().unwrap();
            kernel
                .map_page(cpu, space, phys, virt, RW | MapFlags::USER, CacheKind::Normal)
                .unwrap();
        }
        assert_eq!(kernel.find_free_range(space, 0x1000, 0x10000, 3), Some(0x4000));
        assert_eq!(kernel.find_free_range(space, 0x1000, USER_TOP, 1), Some(0x1000));
    }
}
