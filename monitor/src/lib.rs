//! Core of a virtual-8086 monitor: guest code runs unprivileged under a
//! protected-mode host, and everything privileged it attempts traps here to
//! be emulated — I/O dispatch, interrupt flag shadowing, a virtual 8259A
//! interrupt controller pair and a virtual 8253/8254 timer.
//!
//! The host scheduler, device backends and BIOS services stay outside; they
//! plug in through [`host::Host`], the handler chains of
//! [`machine::Machine`], and the per-VM extension slots.

#![cfg_attr(not(test), no_std)]
#![deny(unsafe_op_in_unsafe_fn)]

extern crate alloc;

/// Decodes trapped guest instructions into a small instruction set.
pub mod decode;
/// The scheduler/timer seam the embedding kernel implements.
pub mod host;
/// VM lifecycle, handler chains and extension slots.
pub mod machine;
/// Paged guest memory with gate-A20 wraparound emulation.
pub mod memory;
/// The virtual 8259A interrupt controller pair.
pub mod pic;
/// The virtual 8253/8254 interval timer.
pub mod pit;
/// Exception entry points and the instruction emulator.
pub mod trap;

pub use machine::{Machine, Vm};
pub use trap::TrapOutcome;
