//! Streaming I/O core of a floppy drive emulator.
//!
//! Image handlers stream a looped region of an image file (typically one
//! track) through a [`fs::ring_io::RingIo`] ring buffer while the blocking
//! filesystem calls it issues are deferred to the [`fs::async_queue`] and run
//! by whichever task drains it.

#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod config;
pub mod drivers;
pub mod fs;
pub mod sched;
pub mod util;
