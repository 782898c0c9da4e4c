//! Single-waiter event primitive.
//!
//! The same type backs IPC arrival and interrupt delivery: a thread waits
//! on an event and the producer side (message send, IRQ handler) triggers
//! it.  An event remembers at most one pending trigger and at most one
//! waiter.  Two threads waiting on the same event instance at once is a
//! kernel invariant violation.

use super::thread::Tid;

/// What a wait call observed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    /// A trigger was already pending; the caller keeps running.
    Ready,
    /// No trigger pending; the caller is now registered as the waiter
    /// and must suspend.
    Blocked,
}

#[derive(Debug, Default)]
pub struct Event {
    pending: bool,
    waiter: Option<Tid>,
}

impl Event {
    pub const fn new() -> Self {
        Self { pending: false, waiter: None }
    }

    /// Consume a pending trigger or register `tid` as the waiter.
    ///
    /// Re-waiting by the same thread (a retry after a spurious wake) is
    /// allowed; a second distinct waiter panics.
    pub fn wait(&mut self, tid: Tid) -> WaitOutcome {
        if self.pending {
            self.pending = false;
            self.waiter = None;
            return WaitOutcome::Ready;
        }
        match self.waiter {
            None => {
                self.waiter = Some(tid);
                WaitOutcome::Blocked
            }
            Some(current) if current == tid => WaitOutcome::Blocked,
            Some(current) => {
                panic!("event: thread {} waiting while thread {} already is", tid, current)
            }
        }
    }

    /// Fire the event.  Returns the waiter to wake, if any; with no
    /// waiter the trigger is latched for the next `wait`.
    pub fn trigger(&mut self) -> Option<Tid> {
        match self.waiter.take() {
            Some(tid) => Some(tid),
            None => {
                self.pending = true;
                None
            }
        }
    }

}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trigger_before_wait_is_latched() {
        let mut event = Event::new();
        assert_eq!(event.trigger(), None);
        assert_eq!(event.wait(1), WaitOutcome::Ready);
        // The latch is consumed by the wait.
        assert_eq!(event.wait(1), WaitOutcome::Blocked);
    }

    #[test]
    fn trigger_hands_back_the_waiter() {
        let mut event = Event::new();
        assert_eq!(event.wait(7), WaitOutcome::Blocked);
        assert_eq!(event.trigger(), Some(7));
        // The waiter slot is cleared by the trigger.
        assert_eq!(event.trigger(), None);
    }

    #[test]
    fn rewait_by_the_same_thread_is_allowed() {
        let mut event = Event::new();
        assert_eq!(event.wait(7), WaitOutcome::Blocked);
        assert_eq!(event.wait(7), WaitOutcome::Blocked);
    }

    #[test]
    #[should_panic(expected = "already is")]
    fn second_waiter_is_fatal() {
        let mut event = Event::new();
        let _ = event.wait(7);
        let _ = event.wait(8);
    }
}
