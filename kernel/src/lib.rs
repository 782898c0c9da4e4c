//! Address-space, scheduling and IPC core of the Vireo microkernel.
//!
//! The crate is freestanding on a real machine and hosted under test:
//! physical memory is modeled by a frame arena and all translation
//! hardware sits behind the [`memory::tlb::TlbOps`] trait, so every
//! subsystem runs unmodified on the host.

#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod device;
pub mod ipc;
pub mod kernel;
pub mod memory;
pub mod task;

pub use kernel::{init, kernel, Kernel};
