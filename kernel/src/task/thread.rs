//! Thread objects and their lifecycle.
//!
//! A thread is the schedulable unit: saved register state, the address
//! space it runs in, the frames it must give back on exit, its mailbox,
//! and a state machine the scheduler drives.  Threads are owned by the
//! kernel context; per-CPU records only hold their ids.

use alloc::vec::Vec;

use crate::ipc::Mailbox;
use crate::kernel::Kernel;
use crate::memory::address_space::{MapError, SpaceId};
use crate::memory::paging::{CacheKind, MapFlags};
use crate::memory::PAGE_SIZE;
use crate::task::event::Event;
use crate::task::scheduler::CpuId;

/// Unique thread identifier.  Tid 0 is reserved as "no thread".
pub type Tid = u64;

pub const KERNEL_CS: u16 = 0x08;
pub const KERNEL_SS: u16 = 0x10;
pub const USER_CS: u16 = 0x23;
pub const USER_SS: u16 = 0x1B;

/// Initial RFLAGS for a fresh thread: interrupts enabled, reserved bit 1.
pub const RFLAGS_IF: u64 = 0x202;

/// Kernel-thread stack size in frames.
pub const KERNEL_STACK_FRAMES: usize = 8;

/// Saved register file, written by the trap entry path and read back by
/// the context-switch path.  Field order is the trap frame layout.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ThreadContext {
    pub rax: u64,
    pub rbx: u64,
    pub rcx: u64,
    pub rdx: u64,
    pub rsi: u64,
    pub rdi: u64,
    pub rbp: u64,
    pub rsp: u64,
    pub r8: u64,
    pub r9: u64,
    pub r10: u64,
    pub r11: u64,
    pub r12: u64,
    pub r13: u64,
    pub r14: u64,
    pub r15: u64,
    pub rip: u64,
    pub cr3: u64,
    pub rflags: u64,
    pub ss: u16,
    pub ds: u16,
    pub cs: u16,
}

impl ThreadContext {
    pub const fn empty() -> Self {
        Self {
            rax: 0,
            rbx: 0,
            rcx: 0,
            rdx: 0,
            rsi: 0,
            rdi: 0,
            rbp: 0,
            rsp: 0,
            r8: 0,
            r9: 0,
            r10: 0,
            r11: 0,
            r12: 0,
            r13: 0,
            r14: 0,
            r15: 0,
            rip: 0,
            cr3: 0,
            rflags: 0,
            ss: 0,
            ds: 0,
            cs: 0,
        }
    }
}

/// Frames a thread owns outright and frees when it exits.
#[derive(Debug, Default)]
pub struct ThreadResources {
    pub frames: Vec<u64>,
}

/// Virtual layout of the thread's stack and heap, if it has them.
#[derive(Debug, Default, Clone, Copy)]
pub struct ThreadImage {
    pub stack_bottom: u64,
    pub stack_top: u64,
    pub heap_bottom: u64,
    pub heap_top: u64,
}

/// Scheduling state.
///
/// `Disabled` is both the pre-schedulable initial state and the terminal
/// state after exit.  Only the scheduler moves a thread to `Running`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadState {
    Disabled,
    Idle,
    Running,
    Blocked,
}

impl ThreadState {
    /// The full transition table.  Anything not listed is illegal.
    pub fn can_transition(self, to: ThreadState) -> bool {
        use ThreadState::*;
        matches!(
            (self, to),
            (Disabled, Idle)
                | (Disabled, Blocked)
                | (Idle, Running)
                | (Idle, Disabled)
                | (Running, Idle)
                | (Running, Blocked)
                | (Running, Disabled)
                | (Blocked, Idle)
                | (Blocked, Disabled)
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrivilegeLevel {
    Kernel,
    Driver,
    Application,
}

pub struct Thread {
    pub tid: Tid,
    pub context: ThreadContext,
    pub resources: ThreadResources,
    pub image: ThreadImage,
    pub state: ThreadState,
    pub privilege: PrivilegeLevel,
    pub space: SpaceId,
    /// Core whose run queue this thread belongs to.
    pub cpu: CpuId,
    pub mailbox: Mailbox,
    pub mailbox_event: Event,
    /// IRQ handles this thread opened through device control; the handle
    /// id handed back to the driver is an index into this list.
    pub handles: Vec<crate::device::IrqHandle>,
}

impl Kernel {
    /// Spawn a kernel-privilege thread on `cpu`, allocating and mapping a
    /// fresh kernel stack for it.
    pub fn create_kernel_thread(&mut self, cpu: CpuId, entry: u64) -> Result<Tid, MapError> {
        let stack_bottom = self.next_kernel_stack;
        // Leave one unmapped guard page between consecutive stacks.
        self.next_kernel_stack += (KERNEL_STACK_FRAMES as u64 + 1) * PAGE_SIZE;

        let mut frames = Vec::with_capacity(KERNEL_STACK_FRAMES);
        for i in 0..KERNEL_STACK_FRAMES {
            let phys = self.arena.alloc_frame().ok_or(MapError::OutOfMemory)?;
            self.map_page(
                cpu,
                self.kernel_space,
                phys,
                stack_bottom + i as u64 * PAGE_SIZE,
                MapFlags::PRESENT | MapFlags::WRITABLE | MapFlags::GLOBAL | MapFlags::NO_EXECUTE,
                CacheKind::Normal,
            )?;
            frames.push(phys);
        }
        let stack_top = stack_bottom + KERNEL_STACK_FRAMES as u64 * PAGE_SIZE;

        let mut context = ThreadContext::empty();
        context.rip = entry;
        context.rsp = stack_top;
        context.cr3 = self.space_root(self.kernel_space);
        context.rflags = RFLAGS_IF;
        context.cs = KERNEL_CS;
        context.ss = KERNEL_SS;
        context.ds = KERNEL_SS;

        let image = ThreadImage {
            stack_bottom,
            stack_top,
            ..ThreadImage::default()
        };
        Ok(self.spawn(
            cpu,
            context,
            self.kernel_space,
            PrivilegeLevel::Kernel,
            ThreadResources { frames },
            image,
            ThreadState::Idle,
        ))
    }

    /// Spawn a runnable thread on `cpu` with a caller-provided stack in
    /// `space`.
    pub fn create_thread(
        &mut self,
        cpu: CpuId,
        entry: u64,
        stack: u64,
        space: SpaceId,
        privilege: PrivilegeLevel,
    ) -> Tid {
        let context = self.initial_context(entry, stack, space, privilege);
        let image = ThreadImage { stack_top: stack, ..ThreadImage::default() };
        self.spawn(
            cpu,
            context,
            space,
            privilege,
            ThreadResources::default(),
            image,
            ThreadState::Idle,
        )
    }

    /// Like [`create_thread`](Self::create_thread), but the thread starts
    /// `Blocked` so its creator can wire up an event wait before it ever
    /// runs.
    pub fn create_blocked_thread(
        &mut self,
        cpu: CpuId,
        entry: u64,
        stack: u64,
        space: SpaceId,
        privilege: PrivilegeLevel,
    ) -> Tid {
        let context = self.initial_context(entry, stack, space, privilege);
        let image = ThreadImage { stack_top: stack, ..ThreadImage::default() };
        self.spawn(
            cpu,
            context,
            space,
            privilege,
            ThreadResources::default(),
            image,
            ThreadState::Blocked,
        )
    }

    fn initial_context(
        &self,
        entry: u64,
        stack: u64,
        space: SpaceId,
        privilege: PrivilegeLevel,
    ) -> ThreadContext {
        let mut context = ThreadContext::empty();
        context.rip = entry;
        context.rsp = stack;
        context.cr3 = self.space_root(space);
        context.rflags = RFLAGS_IF;
        match privilege {
            PrivilegeLevel::Kernel => {
                context.cs = KERNEL_CS;
                context.ss = KERNEL_SS;
                context.ds = KERNEL_SS;
            }
            PrivilegeLevel::Driver | PrivilegeLevel::Application => {
                context.cs = USER_CS;
                context.ss = USER_SS;
                context.ds = USER_SS;
            }
        }
        context
    }

    #[allow(clippy::too_many_arguments)]
    fn spawn(
        &mut self,
        cpu: CpuId,
        context: ThreadContext,
        space: SpaceId,
        privilege: PrivilegeLevel,
        resources: ThreadResources,
        image: ThreadImage,
        initial: ThreadState,
    ) -> Tid {
        let tid = self.next_tid;
        self.next_tid += 1;
        self.threads.push(Thread {
            tid,
            context,
            resources,
            image,
            state: ThreadState::Disabled,
            privilege,
            space,
            cpu,
            mailbox: Mailbox::new(),
            mailbox_event: Event::new(),
            handles: Vec::new(),
        });
        self.set_thread_state(tid, initial);
        if initial == ThreadState::Idle {
            self.cpus[cpu].queue.push_back(tid);
        }
        tid
    }

    /// Apply a state transition, enforcing the transition table.
    pub fn set_thread_state(&mut self, tid: Tid, to: ThreadState) {
        let index = self.thread_index(tid);
        let from = self.threads[index].state;
        if !from.can_transition(to) {
            panic!("thread {}: illegal transition {:?} -> {:?}", tid, from, to);
        }
        self.threads[index].state = to;
    }

    /// Look a live thread up by id.
    pub fn thread_for_tid(&self, tid: Tid) -> Option<&Thread> {
        self.threads.iter().find(|t| t.tid == tid)
    }

    pub(crate) fn thread_index(&self, tid: Tid) -> usize {
        match self.threads.iter().position(|t| t.tid == tid) {
            Some(index) => index,
            None => panic!("thread {}: unknown tid", tid),
        }
    }

    /// The thread currently executing on `cpu`, if any.
    pub fn current_thread(&self, cpu: CpuId) -> Option<&Thread> {
        let tid = self.cpus[cpu].current?;
        self.thread_for_tid(tid)
    }

    /// Terminate the thread running on `cpu`: release its IRQ bindings,
    /// return its frames, tear down its address space if it was the last
    /// live user, and schedule something else into `frame`.
    pub fn kill_current(&mut self, cpu: CpuId, frame: &mut ThreadContext) {
        let Some(tid) = self.cpus[cpu].current else {
            panic!("kill_current: core {} has no running thread", cpu);
        };
        let index = self.thread_index(tid);

        for binding in self.irq_bindings.iter_mut() {
            if binding.map(|b| b.tid) == Some(tid) {
                *binding = None;
            }
        }

        // A kernel thread's stack lives in the shared kernel region and
        // must be unmapped there before its frames are reused.
        let image = self.threads[index].image;
        if self.threads[index].space == self.kernel_space && image.stack_bottom != 0 {
            let mut virt = image.stack_bottom;
            while virt < image.stack_top {
                self.unmap_page(cpu, self.kernel_space, virt);
                virt += PAGE_SIZE;
            }
        }
        let frames = core::mem::take(&mut self.threads[index].resources.frames);
        for phys in frames {
            self.arena.free_frame(phys);
        }

        let space = self.threads[index].space;
        self.set_thread_state(tid, ThreadState::Disabled);
        self.cpus[cpu].current = None;

        let space_in_use = self
            .threads
            .iter()
            .any(|t| t.space == space && t.state != ThreadState::Disabled);
        if space != self.kernel_space && !space_in_use {
            self.destroy_space(space);
        }

        self.reschedule(cpu, frame);
    }
}
