//! Translation-cache control.
//!
//! The paging and PCID code never touches hardware directly; it goes
//! through [`TlbOps`], so the same logic drives real invalidation
//! instructions on a live system and a recording double in tests.

/// Hardware touchpoints of the address-space layer.
pub trait TlbOps: Send {
    /// Invalidate the single translation for `virt` on this core.
    fn invalidate_page(&mut self, virt: u64);

    /// Invalidate every translation tagged with `pcid` on this core.
    /// Mandatory before a context tag is rebound to another address space.
    fn flush_context(&mut self, pcid: u16);

    /// Install `root_phys` as the active translation base, tagged `pcid`,
    /// without flushing that tag's cached translations.
    fn load_root(&mut self, root_phys: u64, pcid: u16);
}

/// No-op implementation for contexts with no translation hardware
/// (model runs, early boot on a single identity-mapped table).
pub struct NullTlb;

impl TlbOps for NullTlb {
    fn invalidate_page(&mut self, _virt: u64) {}
    fn flush_context(&mut self, _pcid: u16) {}
    fn load_root(&mut self, _root_phys: u64, _pcid: u16) {}
}

/// Real x86-64 implementation.
#[cfg(target_arch = "x86_64")]
pub struct HardwareTlb;

#[cfg(target_arch = "x86_64")]
impl TlbOps for HardwareTlb {
    fn invalidate_page(&mut self, virt: u64) {
        unsafe {
            core::arch::asm!(
                "invlpg [{}]",
                in(reg) virt,
                options(nostack, preserves_flags),
            );
        }
    }

    fn flush_context(&mut self, pcid: u16) {
        // INVPCID type 1: single-context invalidation.
        let descriptor: [u64; 2] = [pcid as u64, 0];
        unsafe {
            core::arch::asm!(
                "invpcid {}, [{}]",
                in(reg) 1u64,
                in(reg) descriptor.as_ptr(),
                options(nostack, preserves_flags),
            );
        }
    }

    fn load_root(&mut self, root_phys: u64, pcid: u16) {
        // Bit 63 tells the CPU to keep the incoming PCID's cached
        // translations across the CR3 load.
        let value = root_phys | (pcid as u64 & 0xFFF) | (1 << 63);
        unsafe {
            core::arch::asm!(
                "mov cr3, {}",
                in(reg) value,
                options(nostack, preserves_flags),
            );
        }
    }
}

#[cfg(test)]
pub mod recording {
    //! Recording test double shared between the paging and scheduler tests.

    use alloc::sync::Arc;
    use alloc::vec::Vec;
    use spin::Mutex;

    use super::TlbOps;

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub enum TlbEvent {
        InvalidatePage(u64),
        FlushContext(u16),
        LoadRoot { root: u64, pcid: u16 },
    }

    /// Shared handle onto a [`RecordingTlb`]'s event log.
    #[derive(Clone)]
    pub struct TlbLog(Arc<Mutex<Vec<TlbEvent>>>);

    impl TlbLog {
        pub fn events(&self) -> Vec<TlbEvent> {
            self.0.lock().clone()
        }

        pub fn clear(&self) {
            self.0.lock().clear();
        }
    }

    pub struct RecordingTlb(Arc<Mutex<Vec<TlbEvent>>>);

    impl RecordingTlb {
        pub fn new() -> (Self, TlbLog) {
            let log = Arc::new(Mutex::new(Vec::new()));
            (Self(log.clone()), TlbLog(log))
        }
    }

    impl TlbOps for RecordingTlb {
        fn invalidate_page(&mut self, virt: u64) {
            self.0.lock().push(TlbEvent::InvalidatePage(virt));
        }

        fn flush_context(&mut self, pcid: u16) {
            self.0.lock().push(TlbEvent::FlushContext(pcid));
        }

        fn load_root(&mut self, root_phys: u64, pcid: u16) {
            self.0.lock().push(TlbEvent::LoadRoot { root: root_phys, pcid });
        }
    }
}
