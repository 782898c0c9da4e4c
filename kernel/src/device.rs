//! Device registry and the driver-facing control interface.
//!
//! Drivers run as ordinary threads and talk to the kernel through a
//! single numeric command word with four generic arguments.  Lookup
//! failures and bad arguments come back as sentinel values; a buggy
//! driver must never be able to fault the kernel through this surface.

use crate::kernel::Kernel;
use crate::memory::uaccess;
use crate::task::event::Event;
use crate::task::scheduler::{CpuId, WaitTarget};
use crate::task::thread::{ThreadContext, Tid};

/// Sentinel for "no device / no handle / unknown command".
pub const DEVICE_NONE: u64 = u64::MAX;

pub const DEVCTL_NOP: u64 = 0;
pub const DEVCTL_CLAIM: u64 = 1;
pub const DEVCTL_FIND_PCI: u64 = 2;
pub const DEVCTL_FIND_PCI_CLASS: u64 = 3;
pub const DEVCTL_GET_RESOURCE_REGION: u64 = 4;
pub const DEVCTL_ENABLE_IRQ: u64 = 5;
pub const DEVCTL_WAIT_ON_IRQ: u64 = 6;

/// First vector available for device interrupts; 0..32 are exceptions.
const FIRST_DEVICE_VECTOR: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PciAddress {
    pub segment: u16,
    pub bus: u8,
    pub slot: u8,
    pub function: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BarKind {
    Mmio,
    Pio,
}

#[derive(Debug, Clone, Copy)]
pub struct PciBar {
    pub kind: BarKind,
    pub base: u64,
    pub len: u64,
}

#[derive(Debug, Clone)]
pub struct PciDevice {
    pub addr: PciAddress,
    pub class: u8,
    pub subclass: u8,
    pub prog_if: u8,
    pub bars: [Option<PciBar>; 6],
    pub msi_vector: Option<u8>,
}

/// How a device is reached on the machine.  Matched exhaustively so a
/// future binding kind forces every consumer to handle it.
#[derive(Debug, Clone)]
pub enum DeviceContact {
    Pci(PciDevice),
}

pub struct Device {
    pub name: &'static str,
    /// Owning driver thread; 0 while unclaimed.
    pub driver: Tid,
    pub contact: DeviceContact,
}

/// Resource kinds reported through `get_resource_region`.
pub const REGION_KIND_MMIO: u8 = 0;
pub const REGION_KIND_PIO: u8 = 1;
/// Region origins: where the base/len pair came from.
pub const REGION_ORIGIN_PCI_BAR: u8 = 0;

/// Out-of-band description of one addressable device resource, written
/// into the calling driver's memory.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResourceRegion {
    pub kind: u8,
    pub origin: u8,
    pub base: u64,
    pub len: u64,
}

impl ResourceRegion {
    /// Wire layout: kind, origin, six bytes of padding, then base and
    /// length little-endian.
    pub fn to_bytes(&self) -> [u8; 24] {
        let mut bytes = [0u8; 24];
        bytes[0] = self.kind;
        bytes[1] = self.origin;
        bytes[8..16].copy_from_slice(&self.base.to_le_bytes());
        bytes[16..24].copy_from_slice(&self.len.to_le_bytes());
        bytes
    }
}

/// One wired-up device interrupt, owned by the thread that enabled it.
#[derive(Debug)]
pub struct IrqHandle {
    pub vector: u8,
    pub event: Event,
}

/// Reverse map from an interrupt vector to the thread/handle to notify.
#[derive(Debug, Clone, Copy)]
pub(crate) struct IrqBinding {
    pub tid: Tid,
    pub handle: usize,
}

impl Kernel {
    /// Register a discovered PCI device.  Returns its descriptor.
    pub fn add_pci_device(&mut self, name: &'static str, pci: PciDevice) -> u64 {
        self.devices.push(Device {
            name,
            driver: 0,
            contact: DeviceContact::Pci(pci),
        });
        let descriptor = self.devices.len() as u64 - 1;
        klog::info!("device: registered {} as descriptor {}", name, descriptor);
        descriptor
    }

    fn find_pci_node(&self, addr: PciAddress) -> Option<u64> {
        self.devices.iter().position(|d| {
            let DeviceContact::Pci(pci) = &d.contact;
            pci.addr == addr
        }).map(|i| i as u64)
    }

    /// Locate the `index`-th device matching a class triple.
    fn find_pci_class_node(&self, class: u8, subclass: u8, prog_if: u8, index: usize) -> Option<u64> {
        self.devices
            .iter()
            .enumerate()
            .filter(|(_, d)| {
                let DeviceContact::Pci(pci) = &d.contact;
                pci.class == class && pci.subclass == subclass && pci.prog_if == prog_if
            })
            .nth(index)
            .map(|(i, _)| i as u64)
    }

    fn resource_region(&self, descriptor: u64, origin: u8, index: usize) -> Option<ResourceRegion> {
        let device = self.devices.get(descriptor as usize)?;
        if origin != REGION_ORIGIN_PCI_BAR {
            return None;
        }
        let DeviceContact::Pci(pci) = &device.contact;
        let bar = (*pci.bars.get(index)?)?;
        Some(ResourceRegion {
            kind: match bar.kind {
                BarKind::Mmio => REGION_KIND_MMIO,
                BarKind::Pio => REGION_KIND_PIO,
            },
            origin: REGION_ORIGIN_PCI_BAR,
            base: bar.base,
            len: bar.len,
        })
    }

    /// Device-control dispatch for the thread running on `cpu`.
    ///
    /// Unknown commands and failed lookups return [`DEVICE_NONE`]; the
    /// claim and region commands use 0 for success and 1 for a
    /// well-formed refusal.
    pub fn devctl(
        &mut self,
        cpu: CpuId,
        command: u64,
        arg1: u64,
        arg2: u64,
        arg3: u64,
        arg4: u64,
        frame: &mut ThreadContext,
    ) -> u64 {
        match command {
            DEVCTL_NOP => 0,
            DEVCTL_CLAIM => self.devctl_claim(cpu, arg1),
            DEVCTL_FIND_PCI => {
                let addr = PciAddress {
                    segment: arg1 as u16,
                    bus: arg2 as u8,
                    slot: arg3 as u8,
                    function: arg4 as u8,
                };
                self.find_pci_node(addr).unwrap_or(DEVICE_NONE)
            }
            DEVCTL_FIND_PCI_CLASS => self
                .find_pci_class_node(arg1 as u8, arg2 as u8, arg3 as u8, arg4 as usize)
                .unwrap_or(DEVICE_NONE),
            DEVCTL_GET_RESOURCE_REGION => self.devctl_get_region(cpu, arg1, arg2, arg3, arg4),
            DEVCTL_ENABLE_IRQ => self.devctl_enable_irq(cpu, arg1),
            DEVCTL_WAIT_ON_IRQ => self.devctl_wait_on_irq(cpu, arg1, frame),
            _ => {
                klog::warn!("devctl: unknown command {}", command);
                DEVICE_NONE
            }
        }
    }

    fn devctl_claim(&mut self, cpu: CpuId, descriptor: u64) -> u64 {
        let Some(tid) = self.cpus[cpu].current else {
            panic!("devctl: claim from core {} with no running thread", cpu);
        };
        let Some(device) = self.devices.get_mut(descriptor as usize) else {
            return DEVICE_NONE;
        };
        if device.driver != 0 {
            return 1;
        }
        device.driver = tid;
        klog::info!("device: {} claimed by thread {}", device.name, tid);
        0
    }

    /// Write the requested region descriptor into the caller's memory at
    /// `out_addr`.  0 on success, 1 on any failure.
    fn devctl_get_region(
        &mut self,
        cpu: CpuId,
        descriptor: u64,
        origin: u64,
        index: u64,
        out_addr: u64,
    ) -> u64 {
        let Some(region) = self.resource_region(descriptor, origin as u8, index as usize) else {
            return 1;
        };
        let Some(tid) = self.cpus[cpu].current else {
            panic!("devctl: region query from core {} with no running thread", cpu);
        };
        let space = self.threads[self.thread_index(tid)].space;
        let Kernel { arena, spaces, .. } = self;
        let Some(space_ref) = spaces[space].as_ref() else {
            panic!("devctl: thread {} runs in a dead space {}", tid, space);
        };
        match uaccess::copy_to_user(arena, space_ref, out_addr, &region.to_bytes()) {
            Ok(()) => 0,
            Err(_) => 1,
        }
    }

    /// Pick a free interrupt vector, wire it to a fresh event owned by
    /// the calling thread, and hand back the handle id.
    fn devctl_enable_irq(&mut self, cpu: CpuId, descriptor: u64) -> u64 {
        let Some(tid) = self.cpus[cpu].current else {
            panic!("devctl: enable_irq from core {} with no running thread", cpu);
        };
        if self.devices.get(descriptor as usize).is_none() {
            return DEVICE_NONE;
        }
        let Some(vector) = (FIRST_DEVICE_VECTOR..self.irq_bindings.len())
            .find(|v| self.irq_bindings[*v].is_none())
        else {
            klog::warn!("devctl: out of interrupt vectors");
            return DEVICE_NONE;
        };

        let index = self.thread_index(tid);
        let handle = self.threads[index].handles.len();
        self.threads[index].handles.push(IrqHandle {
            vector: vector as u8,
            event: Event::new(),
        });
        self.irq_bindings[vector] = Some(IrqBinding { tid, handle });

        if let Some(device) = self.devices.get_mut(descriptor as usize) {
            let DeviceContact::Pci(pci) = &mut device.contact;
            pci.msi_vector = Some(vector as u8);
        }
        klog::debug!("devctl: vector {} wired to thread {} handle {}", vector, tid, handle);
        handle as u64
    }

    fn devctl_wait_on_irq(&mut self, cpu: CpuId, handle: u64, frame: &mut ThreadContext) -> u64 {
        let Some(tid) = self.cpus[cpu].current else {
            panic!("devctl: wait_on_irq from core {} with no running thread", cpu);
        };
        let index = self.thread_index(tid);
        if handle as usize >= self.threads[index].handles.len() {
            return DEVICE_NONE;
        }
        self.block_current(cpu, WaitTarget::Irq(handle as usize), frame);
        0
    }

    /// Interrupt entry: trigger the event bound to `vector` and make its
    /// waiter runnable.  Runs to completion, never blocks.
    pub fn raise_irq(&mut self, vector: u8) {
        let Some(binding) = self.irq_bindings[vector as usize] else {
            klog::warn!("irq: spurious vector {}", vector);
            return;
        };
        let index = self.thread_index(binding.tid);
        if let Some(waiter) = self.threads[index].handles[binding.handle].event.trigger() {
            self.wake(waiter);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::test_kernel;
    use crate::memory::paging::{CacheKind, MapFlags};
    use crate::task::thread::{PrivilegeLevel, ThreadState};

    fn sample_pci(bus: u8, class: u8, subclass: u8) -> PciDevice {
        PciDevice {
            addr: PciAddress { segment: 0, bus, slot: 0, function: 0 },
            class,
            subclass,
            prog_if: 0,
            bars: [
                Some(PciBar { kind: BarKind::Mmio, base: 0xFEB0_0000, len: 0x4000 }),
                None,
                None,
                None,
                None,
                None,
            ],
            msi_vector: None,
        }
    }

    fn driver_setup() -> (Kernel, CpuId, Tid, u64) {
        let (mut kernel, cpu) = test_kernel();
        let descriptor = kernel.add_pci_device("virtio-net", sample_pci(1, 0x02, 0x00));
        let space = kernel.kernel_space;
        let tid = kernel.create_thread(cpu, 0x1000, 0x9000, space, PrivilegeLevel::Driver);
        let mut frame = ThreadContext::empty();
        kernel.reschedule(cpu, &mut frame);
        assert_eq!(kernel.cpus[cpu].current, Some(tid));
        (kernel, cpu, tid, descriptor)
    }

    #[test]
    fn claim_is_first_come_first_served() {
        let (mut kernel, cpu, tid, descriptor) = driver_setup();
        let mut frame = ThreadContext::empty();
        assert_eq!(kernel.devctl(cpu, DEVCTL_CLAIM, descriptor, 0, 0, 0, &mut frame), 0);
        assert_eq!(kernel.devices[descriptor as usize].driver, tid);
        // Second claim is refused, not fatal.
        assert_eq!(kernel.devctl(cpu, DEVCTL_CLAIM, descriptor, 0, 0, 0, &mut frame), 1);
        // An out-of-range descriptor is reported, not a fault.
        assert_eq!(kernel.devctl(cpu, DEVCTL_CLAIM, 999, 0, 0, 0, &mut frame), DEVICE_NONE);
    }

    #[test]
    fn pci_lookup_by_address_and_class() {
        let (mut kernel, cpu, _tid, first) = driver_setup();
        let second = kernel.add_pci_device("virtio-net-2", sample_pci(2, 0x02, 0x00));
        let other = kernel.add_pci_device("ahci", sample_pci(3, 0x01, 0x06));
        let mut frame = ThreadContext::empty();

        assert_eq!(kernel.devctl(cpu, DEVCTL_FIND_PCI, 0, 2, 0, 0, &mut frame), second);
        assert_eq!(
            kernel.devctl(cpu, DEVCTL_FIND_PCI, 0, 9, 0, 0, &mut frame),
            DEVICE_NONE
        );

        // Nth-match semantics over the class triple.
        assert_eq!(kernel.devctl(cpu, DEVCTL_FIND_PCI_CLASS, 0x02, 0, 0, 0, &mut frame), first);
        assert_eq!(kernel.devctl(cpu, DEVCTL_FIND_PCI_CLASS, 0x02, 0, 0, 1, &mut frame), second);
        assert_eq!(
            kernel.devctl(cpu, DEVCTL_FIND_PCI_CLASS, 0x02, 0, 0, 2, &mut frame),
            DEVICE_NONE
        );
        assert_eq!(kernel.devctl(cpu, DEVCTL_FIND_PCI_CLASS, 0x01, 0x06, 0, 0, &mut frame), other);
    }

    #[test]
    fn resource_region_is_written_to_caller_memory() {
        let (mut kernel, cpu, tid, descriptor) = driver_setup();
        let mut frame = ThreadContext::empty();

        // Give the driver a page to receive the region struct into.
        let space = kernel.thread_for_tid(tid).unwrap().space;
        let phys = kernel.alloc_frame().unwrap();
        kernel
            .map_page(
                cpu,
                space,
                phys,
                0x7000,
                MapFlags::PRESENT | MapFlags::WRITABLE,
                CacheKind::Normal,
            )
            .unwrap();

        let result = kernel.devctl(
            cpu,
            DEVCTL_GET_RESOURCE_REGION,
            descriptor,
            REGION_ORIGIN_PCI_BAR as u64,
            0,
            0x7010,
            &mut frame,
        );
        assert_eq!(result, 0);
        let bytes = &kernel.arena.frame(phys)[0x10..0x10 + 24];
        assert_eq!(bytes[0], REGION_KIND_MMIO);
        assert_eq!(u64::from_le_bytes(bytes[8..16].try_into().unwrap()), 0xFEB0_0000);
        assert_eq!(u64::from_le_bytes(bytes[16..24].try_into().unwrap()), 0x4000);

        // A BAR slot with nothing behind it fails cleanly.
        let miss = kernel.devctl(
            cpu,
            DEVCTL_GET_RESOURCE_REGION,
            descriptor,
            REGION_ORIGIN_PCI_BAR as u64,
            1,
            0x7010,
            &mut frame,
        );
        assert_eq!(miss, 1);
    }

    #[test]
    fn irq_wait_blocks_until_the_vector_fires() {
        let (mut kernel, cpu, tid, descriptor) = driver_setup();
        let mut frame = ThreadContext::empty();

        let handle = kernel.devctl(cpu, DEVCTL_ENABLE_IRQ, descriptor, 0, 0, 0, &mut frame);
        assert_ne!(handle, DEVICE_NONE);
        let vector = kernel.thread_for_tid(tid).unwrap().handles[handle as usize].vector;
        assert!(vector >= 32);

        // The wait parks the driver thread.
        assert_eq!(kernel.devctl(cpu, DEVCTL_WAIT_ON_IRQ, handle, 0, 0, 0, &mut frame), 0);
        assert_eq!(kernel.thread_for_tid(tid).unwrap().state, ThreadState::Blocked);
        assert_eq!(kernel.cpus[cpu].current, None);

        // Hardware interrupt arrives; the driver becomes runnable and is
        // switched back in on the next pass.
        kernel.raise_irq(vector);
        assert_eq!(kernel.thread_for_tid(tid).unwrap().state, ThreadState::Idle);
        kernel.reschedule(cpu, &mut frame);
        assert_eq!(kernel.cpus[cpu].current, Some(tid));
    }

    #[test]
    fn irq_raised_before_the_wait_is_not_lost() {
        let (mut kernel, cpu, tid, descriptor) = driver_setup();
        let mut frame = ThreadContext::empty();
        let handle = kernel.devctl(cpu, DEVCTL_ENABLE_IRQ, descriptor, 0, 0, 0, &mut frame);
        let vector = kernel.thread_for_tid(tid).unwrap().handles[handle as usize].vector;

        kernel.raise_irq(vector);
        // The latched trigger satisfies the wait immediately.
        assert_eq!(kernel.devctl(cpu, DEVCTL_WAIT_ON_IRQ, handle, 0, 0, 0, &mut frame), 0);
        assert_eq!(kernel.cpus[cpu].current, Some(tid));
        assert_eq!(kernel.thread_for_tid(tid).unwrap().state, ThreadState::Running);
    }

    #[test]
    fn bad_irq_handle_is_reported() {
        let (mut kernel, cpu, _tid, descriptor) = driver_setup();
        let mut frame = ThreadContext::empty();
        assert_eq!(
            kernel.devctl(cpu, DEVCTL_WAIT_ON_IRQ, 7, 0, 0, 0, &mut frame),
            DEVICE_NONE
        );
        assert_eq!(
            kernel.devctl(cpu, DEVCTL_ENABLE_IRQ, 999, 0, 0, 0, &mut frame),
            DEVICE_NONE
        );
        let _ = descriptor;
    }

    #[test]
    fn unknown_command_returns_the_sentinel() {
        let (mut kernel, cpu, _tid, _descriptor) = driver_setup();
        let mut frame = ThreadContext::empty();
        assert_eq!(kernel.devctl(cpu, 0xDEAD, 0, 0, 0, 0, &mut frame), DEVICE_NONE);
    }
}
