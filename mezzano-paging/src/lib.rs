//! Paging - page table construction for the kernel hand-off
//!
//! The loader builds the kernel's initial 4-level page tables before the
//! kernel exists, in an environment where physical memory is reached
//! through the loader's identity mapping. This crate keeps that
//! construction architecture-neutral:
//!
//! - `arena`: the [`FrameArena`](arena::FrameArena) trait, a page-granular
//!   physical allocator doubling as the loader's window onto physical
//!   memory
//! - `space`: the [`AddressSpace`](space::AddressSpace) trait with mapping,
//!   translation and virtual-range memory operations
//! - `x86_64`: a single-CR3 PML4 implementation
//! - `arm64`: a TTBR0/TTBR1 pair implementation
//!
//! Tables are read and written exclusively through the arena, never by
//! dereferencing, so the whole writer runs unchanged on a host under test.

#![cfg_attr(not(test), no_std)]
#![deny(unsafe_op_in_unsafe_fn)]

extern crate alloc;

pub mod arena;
pub mod arm64;
pub mod space;
#[cfg(test)]
mod testing;
pub mod x86_64;

// Re-export commonly used types
pub use arena::{ArenaError, FrameArena, FrameKind, MemoryRange, RangeKind};
pub use arm64::Arm64TtbrPair;
pub use space::{
    is_canonical, is_canonical_range, is_mapped, memcpy_from, memcpy_to, memset, read_virt_u64,
    sign_extend_48, write_virt_u64, AddressSpace, CacheAttribute, MapAttributes, MapError,
    PagingRoots,
};
pub use x86_64::X8664Pml4;

pub use mezzano_protocol::{PAGE_SHIFT, PAGE_SIZE};

/// 2 MiB large page size, supported by both architectures.
pub const LARGE_PAGE_SIZE: u64 = 2 * 1024 * 1024;

/// Entries per 4 KiB page table.
pub const ENTRIES_PER_TABLE: usize = 512;

const _: () = assert!(PAGE_SIZE * ENTRIES_PER_TABLE as u64 == LARGE_PAGE_SIZE);
