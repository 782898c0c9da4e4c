//! Synchronous inter-thread messaging.
//!
//! Messages carry a command word, a one-byte checksum over the command
//! and payload, and a variable-length payload.  Delivery is FIFO into the
//! destination thread's mailbox; a receiver with an empty mailbox may
//! block on its mailbox event until a sender triggers it.  A corrupted
//! message is dropped and reported, never a kernel fault.

use alloc::collections::VecDeque;
use alloc::vec::Vec;

use crate::kernel::Kernel;
use crate::task::event::WaitOutcome;
use crate::task::scheduler::{CpuId, WaitTarget};
use crate::task::thread::{ThreadContext, ThreadState, Tid};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub command: u64,
    pub checksum: u8,
    pub data: Vec<u8>,
}

impl Message {
    pub fn new(command: u64, data: Vec<u8>) -> Self {
        let checksum = Self::checksum_of(command, &data);
        Self { command, checksum, data }
    }

    /// Low 8 bits of the byte sum over the command word and payload.
    fn checksum_of(command: u64, data: &[u8]) -> u8 {
        let mut sum = 0u8;
        for byte in command.to_le_bytes() {
            sum = sum.wrapping_add(byte);
        }
        for byte in data {
            sum = sum.wrapping_add(*byte);
        }
        sum
    }

    pub fn validate(&self) -> bool {
        Self::checksum_of(self.command, &self.data) == self.checksum
    }
}

/// A queued message together with its sender.
#[derive(Debug)]
pub struct Envelope {
    pub origin: Tid,
    pub message: Message,
}

/// Per-thread FIFO of pending messages.
#[derive(Debug, Default)]
pub struct Mailbox {
    queue: VecDeque<Envelope>,
}

impl Mailbox {
    pub const fn new() -> Self {
        Self { queue: VecDeque::new() }
    }

    pub fn push(&mut self, envelope: Envelope) {
        self.queue.push_back(envelope);
    }

    pub fn pop(&mut self) -> Option<Envelope> {
        self.queue.pop_front()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}

/// Result of a receive call.
#[derive(Debug, PartialEq, Eq)]
pub enum Receive {
    Message { origin: Tid, command: u64, data: Vec<u8> },
    /// The oldest message failed checksum validation and was dropped.
    Corrupt,
    /// Non-blocking receive found the mailbox empty.
    Empty,
    /// Blocking receive parked the thread; it retries when resumed.
    Blocked,
}

impl Kernel {
    /// Deliver a message from the thread running on `cpu` to `dest`.
    ///
    /// Returns `false` if the destination does not exist or has exited.
    /// A destination blocked in receive is made runnable.
    pub fn send_message(&mut self, cpu: CpuId, dest: Tid, command: u64, data: Vec<u8>) -> bool {
        let Some(origin) = self.cpus[cpu].current else {
            panic!("ipc: send from core {} with no running thread", cpu);
        };
        let Some(index) = self.threads.iter().position(|t| t.tid == dest) else {
            return false;
        };
        if self.threads[index].state == ThreadState::Disabled {
            return false;
        }
        let message = Message::new(command, data);
        self.threads[index].mailbox.push(Envelope { origin, message });
        if let Some(waiter) = self.threads[index].mailbox_event.trigger() {
            self.wake(waiter);
        }
        true
    }

    /// Pop the oldest message for the thread running on `cpu`.
    ///
    /// With an empty mailbox a non-blocking call returns [`Receive::Empty`];
    /// a blocking call saves `frame` and parks the thread on its mailbox
    /// event, returning [`Receive::Blocked`].  The caller re-enters this
    /// function when the thread is switched back in.
    pub fn receive_message(
        &mut self,
        cpu: CpuId,
        blocking: bool,
        frame: &mut ThreadContext,
    ) -> Receive {
        loop {
            let Some(tid) = self.cpus[cpu].current else {
                panic!("ipc: receive on core {} with no running thread", cpu);
            };
            let index = self.thread_index(tid);
            if let Some(envelope) = self.threads[index].mailbox.pop() {
                if !envelope.message.validate() {
                    klog::warn!(
                        "ipc: dropping corrupt message for thread {} (from {})",
                        tid,
                        envelope.origin
                    );
                    return Receive::Corrupt;
                }
                return Receive::Message {
                    origin: envelope.origin,
                    command: envelope.message.command,
                    data: envelope.message.data,
                };
            }
            if !blocking {
                return Receive::Empty;
            }
            match self.block_current(cpu, WaitTarget::Mailbox, frame) {
                WaitOutcome::Ready => continue,
                WaitOutcome::Blocked => return Receive::Blocked,
            }
        }
    }
}
