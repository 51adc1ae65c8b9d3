//! Boot information page
//!
//! A single 4 KiB page handed to the kernel at entry. The kernel reads it
//! field by field at fixed offsets, so the layout here is wire format:
//! every offset is pinned by a compile-time assertion, and changing any of
//! them requires a protocol version bump.

use core::mem::offset_of;

use bitflags::bitflags;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

/// Base of the kernel's physical-map window. Physical address `p` is
/// visible to the kernel at `PHYSICAL_MAP_BASE + p`.
pub const PHYSICAL_MAP_BASE: u64 = 0xFFFF_8000_0000_0000;

/// Base of the page-info array. The entry for frame `p` lives at
/// `PAGE_INFO_BASE + (p / 4096) * 32`.
pub const PAGE_INFO_BASE: u64 = 0xFFFF_8080_0000_0000;

/// Size of the physical-map window: 512 GiB. RAM beyond this is not
/// visible to the kernel and is discarded by the loader.
pub const PHYSICAL_MAP_SIZE: u64 = 0x80_0000_0000;

/// Buddy bins for memory below 4 GiB: orders 12..32.
pub const BUDDY_BINS_32: usize = 32 - 12;

/// Buddy bins for the rest of the physical map: orders 12..39.
pub const BUDDY_BINS_64: usize = 39 - 12;

/// Maximum entries in the kernel-visible memory map.
pub const MAX_MEMORY_MAP_ENTRIES: usize = 32;

bitflags! {
    /// Boot options passed through to the kernel, fixnum-encoded in the
    /// boot information page.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct BootOptions: u64 {
        const FORCE_READ_ONLY = 0x01;
        const FREESTANDING = 0x02;
        const VIDEO_CONSOLE = 0x04;
        const NO_DETECT = 0x08;
        const NO_SMP = 0x10;
    }
}

/// Framebuffer pixel layouts the boot protocol can describe. Layouts
/// beyond these will come with later protocol versions.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u64)]
pub enum FramebufferLayout {
    /// 32-bit XRGB.
    X8R8G8B8 = 1,
    /// 24-bit RGB.
    X0R8G8B8 = 5,
}

/// One buddy-allocator free list head. Both fields are fixnums; an empty
/// bin's `first_page` holds the kernel's nil value.
#[derive(Clone, Copy, Debug, FromBytes, IntoBytes, Immutable, KnownLayout)]
#[repr(C)]
pub struct BuddyBin {
    pub first_page: u64,
    pub count: u64,
}

/// Video mode description, all fields fixnums. The framebuffer covers
/// `pitch * height` bytes, aligned up to a page.
#[derive(Clone, Copy, Debug, FromBytes, IntoBytes, Immutable, KnownLayout)]
#[repr(C)]
pub struct VideoInformation {
    pub framebuffer_physical_address: u64,
    pub framebuffer_width: u64,
    pub framebuffer_pitch: u64,
    pub framebuffer_height: u64,
    pub framebuffer_layout: u64,
}

/// One kernel memory map entry. Raw physical addresses, not fixnums:
/// `start` inclusive, `end` exclusive, both page-aligned.
#[derive(Clone, Copy, Debug, PartialEq, Eq, FromBytes, IntoBytes, Immutable, KnownLayout)]
#[repr(C)]
pub struct MemoryMapEntry {
    pub start: u64,
    pub end: u64,
}

/// The boot information page.
///
/// The memory map specifies where RAM exists, not what it may be used for:
/// if a frame is inside the map, it has a page-info entry mapped. Entries
/// are sorted by address and do not overlap.
#[derive(Clone, Copy, Debug, FromBytes, IntoBytes, Immutable, KnownLayout)]
#[repr(C)]
pub struct BootInformation {
    pub uuid: [u8; 16],
    /// Buddy allocator for memory below 4 GiB.
    pub buddy_bin_32: [BuddyBin; BUDDY_BINS_32],
    /// Buddy allocator for the remaining memory.
    pub buddy_bin_64: [BuddyBin; BUDDY_BINS_64],
    pub video: VideoInformation,
    pub acpi_rsdp: u64,
    pub boot_options: u64,
    pub n_memory_map_entries: u64,
    pub memory_map: [MemoryMapEntry; MAX_MEMORY_MAP_ENTRIES],
    pub efi_system_table: u64,
    pub fdt_address: u64,
    pub block_map_address: u64,
}

// Offsets fixed by the boot protocol.
const _: () = {
    assert!(offset_of!(BootInformation, uuid) == 0);
    assert!(offset_of!(BootInformation, buddy_bin_32) == 16);
    assert!(offset_of!(BootInformation, buddy_bin_64) == 336);
    assert!(offset_of!(BootInformation, video) == 768);
    assert!(offset_of!(BootInformation, acpi_rsdp) == 808);
    assert!(offset_of!(BootInformation, boot_options) == 816);
    assert!(offset_of!(BootInformation, n_memory_map_entries) == 824);
    assert!(offset_of!(BootInformation, memory_map) == 832);
    assert!(offset_of!(BootInformation, efi_system_table) == 1344);
    assert!(offset_of!(BootInformation, fdt_address) == 1352);
    assert!(offset_of!(BootInformation, block_map_address) == 1360);
    assert!(core::mem::size_of::<BootInformation>() == 1368);

    assert!(offset_of!(VideoInformation, framebuffer_physical_address) == 0);
    assert!(offset_of!(VideoInformation, framebuffer_width) == 8);
    assert!(offset_of!(VideoInformation, framebuffer_pitch) == 16);
    assert!(offset_of!(VideoInformation, framebuffer_height) == 24);
    assert!(offset_of!(VideoInformation, framebuffer_layout) == 32);

    assert!(offset_of!(BuddyBin, first_page) == 0);
    assert!(offset_of!(BuddyBin, count) == 8);
    assert!(offset_of!(MemoryMapEntry, start) == 0);
    assert!(offset_of!(MemoryMapEntry, end) == 8);

    assert!(core::mem::size_of::<BootInformation>() as u64 <= crate::PAGE_SIZE);
};
