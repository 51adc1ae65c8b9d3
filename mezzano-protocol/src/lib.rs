//! # mezzano-protocol
//!
//! Boot protocol types shared between the Mezzano image loader and the
//! kernel it starts. This crate defines the ABI both sides must agree on:
//!
//! - [`fixnum`]: the tagged-integer encoding used for every kernel-visible
//!   integer field
//! - [`header::ImageHeader`]: the on-disk image header
//! - [`block_map`]: the image's 4-level radix trie from kernel virtual
//!   addresses to disk blocks
//! - [`page_info`]: the per-frame metadata entries and their flag packing
//! - [`boot_info::BootInformation`]: the bit-exact boot information page
//!
//! All wire-visible types use `#[repr(C)]` with their offsets pinned by
//! compile-time assertions. Changing any of them changes the boot protocol
//! and requires a protocol version bump.

#![cfg_attr(not(test), no_std)]
#![deny(unsafe_op_in_unsafe_fn)]

pub mod addr;
pub mod block_map;
pub mod boot_info;
pub mod fixnum;
pub mod header;
pub mod page_info;
pub mod uuid;

// Re-export commonly used items
pub use addr::{PhysAddr, VirtAddr};
pub use fixnum::{fixnum, unfixnum};

/// 4 KiB page size used throughout the boot protocol.
pub const PAGE_SIZE: u64 = 4096;

/// log2 of the page size.
pub const PAGE_SHIFT: u32 = 12;

const _: () = assert!(PAGE_SIZE.is_power_of_two(), "PAGE_SIZE must be a power of two");
const _: () = assert!(1 << PAGE_SHIFT == PAGE_SIZE, "PAGE_SHIFT must match PAGE_SIZE");
