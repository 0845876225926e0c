//! Block driver, block cache and indexed filesystem for a teaching kernel.
//!
//! The boot path, scheduler, interrupt controller, page tables and shell
//! that would normally surround this stack are out of scope here; this
//! crate is hosted on top of `std` and treats them as collaborators
//! reachable only through the traits in [`device`] and [`handle`].

pub mod cache;
pub mod device;
pub mod error;
pub mod fs;
pub mod handle;
pub mod param;
pub mod virtio;
