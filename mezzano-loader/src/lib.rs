//! Mezzano image loader
//!
//! Brings a Mezzano OS image from a block device into a running kernel
//! state. The kernel boots already in 64-bit paged mode with its physical
//! map, per-frame metadata, populated buddy allocators and a bit-exact
//! boot information page, so the loader's whole job is to construct that
//! initial memory state correctly:
//!
//! 1. Validate the image header ([`driver`])
//! 2. Map all RAM into the physical-map window and build the kernel
//!    memory map ([`physmap`])
//! 3. Allocate and map the page-info array ([`info`])
//! 4. Materialise the image's block map and load every wired page
//!    ([`block_map`], [`wired`])
//! 5. Release the bootloader's free memory into the buddy allocators
//!    ([`buddy`])
//! 6. Compose the boot information page ([`boot_info`]) and the
//!    transition paging tree ([`transition`]), then hand off
//!
//! The surrounding bootloader provides block I/O, the frame arena, the
//! video selector and the architecture trampoline through the traits in
//! [`platform`].

#![cfg_attr(not(test), no_std)]
#![deny(unsafe_op_in_unsafe_fn)]

extern crate alloc;

pub mod block_map;
pub mod boot_info;
pub mod buddy;
pub mod command;
pub mod driver;
pub mod error;
pub mod info;
pub mod physmap;
pub mod platform;
pub mod transition;
pub mod wired;

pub use command::{parse_arguments, ImageSpec, LoaderOptions};
pub use driver::{mezzano_command, MezzanoLoader};
pub use error::{BootError, CommandError, ConfigError, IoError};
pub use platform::{Handoff, ImageRead, ImageRegistry, Platform};

/// Wired pages are loaded through chunks of this size rather than one
/// allocation per page, which overwhelms some EFI firmwares.
pub const PAGE_CHUNK_SIZE: u64 = 8 * 1024 * 1024;

/// Refuse to boot with less total RAM than this unless the user promises
/// they know better.
pub const MINIMUM_MEMORY: u64 = 500 * 1024 * 1024;

/// Frames at or below this are never released to the buddy allocator.
/// Low memory is full of firmware surprises.
pub const BUDDY_FLOOR: u64 = 1024 * 1024;
