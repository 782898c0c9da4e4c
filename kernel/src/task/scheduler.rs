//! Per-CPU round-robin scheduling.
//!
//! Each core owns a ready queue of thread ids, the id of the thread it is
//! executing, and a private PCID cache.  Preemption happens on the timer
//! quantum; blocking happens when a thread waits on an event with nothing
//! pending.  Threads never migrate between cores here.

use alloc::collections::VecDeque;

use crate::kernel::Kernel;
use crate::memory::address_space::SpaceId;
use crate::memory::pcid::PcidCache;
use crate::task::event::WaitOutcome;
use crate::task::thread::{ThreadContext, ThreadState, Tid};

/// Index of a core in the kernel context's CPU table.
pub type CpuId = usize;

/// Timer ticks a thread may run before preemption.
pub const CPU_QUANTUM: u64 = 100;

/// Per-core scheduling state.
pub struct ManagedCpu {
    pub id: u32,
    pub enabled: bool,
    pub current: Option<Tid>,
    pub queue: VecDeque<Tid>,
    pub pcid: PcidCache,
    pub active_space: Option<SpaceId>,
    pub ticks: u64,
}

/// What a blocking thread is waiting for; resolves to one of its events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitTarget {
    /// The thread's own mailbox event (IPC receive).
    Mailbox,
    /// An IRQ handle the thread opened, by handle index.
    Irq(usize),
}

impl Kernel {
    /// Register a core and return its scheduling id.
    pub fn add_cpu(&mut self, id: u32) -> CpuId {
        self.cpus.push(ManagedCpu {
            id,
            enabled: true,
            current: None,
            queue: VecDeque::new(),
            pcid: PcidCache::new(),
            active_space: None,
            ticks: 0,
        });
        klog::debug!("scheduler: core {} online", id);
        self.cpus.len() - 1
    }

    /// Timer interrupt entry: account one tick and reschedule when the
    /// quantum is used up.
    pub fn timer_tick(&mut self, cpu: CpuId, frame: &mut ThreadContext) {
        self.cpus[cpu].ticks += 1;
        if self.cpus[cpu].ticks >= CPU_QUANTUM {
            self.cpus[cpu].ticks = 0;
            self.reschedule(cpu, frame);
        }
    }

    /// Voluntary yield: give the rest of the quantum away.
    pub fn yield_now(&mut self, cpu: CpuId, frame: &mut ThreadContext) {
        self.cpus[cpu].ticks = 0;
        self.reschedule(cpu, frame);
    }

    /// Park the outgoing thread (if still running) at the queue tail and
    /// switch to the first runnable thread.  With nothing runnable the
    /// core idles with no current thread.
    pub fn reschedule(&mut self, cpu: CpuId, frame: &mut ThreadContext) {
        if let Some(tid) = self.cpus[cpu].current {
            let index = self.thread_index(tid);
            self.threads[index].context = *frame;
            if self.threads[index].state == ThreadState::Running {
                self.set_thread_state(tid, ThreadState::Idle);
                self.cpus[cpu].queue.push_back(tid);
            }
            self.cpus[cpu].current = None;
        }
        // Entries for threads that blocked or exited while queued are
        // stale; skip them.
        while let Some(tid) = self.cpus[cpu].queue.pop_front() {
            let index = self.thread_index(tid);
            if self.threads[index].state != ThreadState::Idle {
                continue;
            }
            self.switch_to(cpu, tid, frame);
            return;
        }
    }

    fn switch_to(&mut self, cpu: CpuId, tid: Tid, frame: &mut ThreadContext) {
        self.set_thread_state(tid, ThreadState::Running);
        let index = self.thread_index(tid);
        *frame = self.threads[index].context;
        let space = self.threads[index].space;
        self.cpus[cpu].current = Some(tid);
        self.activate_space(cpu, space);
    }

    /// Suspend the current thread on one of its events.
    ///
    /// The trap frame is saved first so the thread resumes at the return
    /// point of the call that blocked.  If the event already had a
    /// pending trigger the thread keeps running and `Ready` is returned.
    pub fn block_current(
        &mut self,
        cpu: CpuId,
        target: WaitTarget,
        frame: &mut ThreadContext,
    ) -> WaitOutcome {
        let Some(tid) = self.cpus[cpu].current else {
            panic!("block: core {} has no running thread", cpu);
        };
        let index = self.thread_index(tid);
        self.threads[index].context = *frame;

        let thread = &mut self.threads[index];
        let event = match target {
            WaitTarget::Mailbox => &mut thread.mailbox_event,
            WaitTarget::Irq(handle) => &mut thread.handles[handle].event,
        };
        match event.wait(tid) {
            WaitOutcome::Ready => WaitOutcome::Ready,
            WaitOutcome::Blocked => {
                self.set_thread_state(tid, ThreadState::Blocked);
                self.cpus[cpu].current = None;
                self.reschedule(cpu, frame);
                WaitOutcome::Blocked
            }
        }
    }

    /// Make a blocked thread runnable again on its home core's queue.
    pub fn wake(&mut self, tid: Tid) {
        self.set_thread_state(tid, ThreadState::Idle);
        let index = self.thread_index(tid);
        let cpu = self.threads[index].cpu;
        self.cpus[cpu].queue.push_back(tid);
    }
}
