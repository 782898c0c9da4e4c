//! Threads, events and the per-CPU scheduler.

pub mod event;
pub mod scheduler;
pub mod thread;
