//! Page-info array
//!
//! The kernel expects 32 bytes of metadata for every physical frame,
//! indexed by frame number from `PAGE_INFO_BASE`. The array is logically
//! sparse: only frames inside the memory map get backing. The info window
//! exists solely in the kernel's page tables, so every accessor goes
//! through the address-space memory operations - the loader has no direct
//! pointer to it.

use log::debug;

use mezzano_paging::{
    read_virt_u64, write_virt_u64, AddressSpace, FrameArena, FrameKind, MapAttributes, MapError,
};
use mezzano_protocol::boot_info::PAGE_INFO_BASE;
use mezzano_protocol::page_info::{
    PageInfoFields, PageType, INFO_EXTRA, INFO_FLAGS, INFO_NEXT, INFO_PREV, PAGE_INFO_SIZE,
};
use mezzano_protocol::{PhysAddr, PAGE_SIZE};

use crate::error::BootError;
use crate::physmap::MemoryMap;

/// Allocate, map and zero the page-info backing for every memory map
/// range.
///
/// Ranges arrive sorted, so a window whose first page was already backed
/// by the previous range's allocation is trimmed rather than re-allocated;
/// both ranges address the same virtual pages either way.
pub fn allocate_page_infos<S: AddressSpace, A: FrameArena>(
    space: &mut S,
    arena: &mut A,
    map: &MemoryMap,
) -> Result<(), BootError> {
    let mut covered_until = 0u64;

    for entry in map.entries() {
        let mut info_start =
            (PAGE_INFO_BASE + (entry.start / PAGE_SIZE) * PAGE_INFO_SIZE) & !(PAGE_SIZE - 1);
        let info_end = (PAGE_INFO_BASE + (entry.end / PAGE_SIZE) * PAGE_INFO_SIZE + PAGE_SIZE - 1)
            & !(PAGE_SIZE - 1);

        if info_start < covered_until {
            info_start = covered_until;
        }
        if info_start >= info_end {
            continue;
        }

        let size = info_end - info_start;
        debug!("info range {info_start:#018x}-{info_end:#018x}");

        // The backing could be discontiguous page by page; one contiguous
        // allocation per range is simply the easy shape.
        let phys = arena.allocate(size, PAGE_SIZE, 0x10_0000, FrameKind::Allocated)?;
        space.map(arena, info_start, phys.as_u64(), size, MapAttributes::normal())?;
        arena.fill(phys, 0, size);

        covered_until = info_end;
    }

    Ok(())
}

fn field_address(page: PhysAddr, field: u64) -> u64 {
    PAGE_INFO_BASE + page.page_number() * PAGE_INFO_SIZE + field
}

/// Read the raw (fixnum) flags word of a frame's info entry.
pub fn page_info_flags<S: AddressSpace, A: FrameArena>(
    space: &S,
    arena: &A,
    page: PhysAddr,
) -> Result<u64, MapError> {
    read_virt_u64(space, arena, field_address(page, INFO_FLAGS))
}

/// Write the raw (fixnum) flags word of a frame's info entry.
pub fn set_page_info_flags<S: AddressSpace, A: FrameArena>(
    space: &S,
    arena: &mut A,
    page: PhysAddr,
    value: u64,
) -> Result<(), MapError> {
    write_virt_u64(space, arena, field_address(page, INFO_FLAGS), value)
}

/// The decoded flags word of a frame's info entry.
pub fn page_info_fields<S: AddressSpace, A: FrameArena>(
    space: &S,
    arena: &A,
    page: PhysAddr,
) -> Result<PageInfoFields, MapError> {
    Ok(PageInfoFields::from_raw(page_info_flags(space, arena, page)?))
}

/// The page type of a frame.
pub fn page_type<S: AddressSpace, A: FrameArena>(
    space: &S,
    arena: &A,
    page: PhysAddr,
) -> Result<PageType, MapError> {
    Ok(page_info_fields(space, arena, page)?.page_type())
}

/// Replace the page type of a frame, keeping the other packed fields.
pub fn set_page_type<S: AddressSpace, A: FrameArena>(
    space: &S,
    arena: &mut A,
    page: PhysAddr,
    value: PageType,
) -> Result<(), MapError> {
    let fields = page_info_fields(space, arena, page)?.with_page_type(value);
    set_page_info_flags(space, arena, page, fields.to_raw())
}

/// The buddy bin of a frame.
pub fn page_bin<S: AddressSpace, A: FrameArena>(
    space: &S,
    arena: &A,
    page: PhysAddr,
) -> Result<u8, MapError> {
    Ok(page_info_fields(space, arena, page)?.bin())
}

/// Replace the buddy bin of a frame, keeping the other packed fields.
pub fn set_page_bin<S: AddressSpace, A: FrameArena>(
    space: &S,
    arena: &mut A,
    page: PhysAddr,
    value: u8,
) -> Result<(), MapError> {
    let fields = page_info_fields(space, arena, page)?.with_bin(value);
    set_page_info_flags(space, arena, page, fields.to_raw())
}

/// Write the `extra` field of a frame's info entry.
pub fn set_page_info_extra<S: AddressSpace, A: FrameArena>(
    space: &S,
    arena: &mut A,
    page: PhysAddr,
    value: u64,
) -> Result<(), MapError> {
    write_virt_u64(space, arena, field_address(page, INFO_EXTRA), value)
}

/// Read the `extra` field of a frame's info entry.
pub fn page_info_extra<S: AddressSpace, A: FrameArena>(
    space: &S,
    arena: &A,
    page: PhysAddr,
) -> Result<u64, MapError> {
    read_virt_u64(space, arena, field_address(page, INFO_EXTRA))
}

/// Read the free-list `next` link of a frame's info entry.
pub fn page_info_next<S: AddressSpace, A: FrameArena>(
    space: &S,
    arena: &A,
    page: PhysAddr,
) -> Result<u64, MapError> {
    read_virt_u64(space, arena, field_address(page, INFO_NEXT))
}

/// Write the free-list `next` link of a frame's info entry.
pub fn set_page_info_next<S: AddressSpace, A: FrameArena>(
    space: &S,
    arena: &mut A,
    page: PhysAddr,
    value: u64,
) -> Result<(), MapError> {
    write_virt_u64(space, arena, field_address(page, INFO_NEXT), value)
}

/// Read the free-list `prev` link of a frame's info entry.
pub fn page_info_prev<S: AddressSpace, A: FrameArena>(
    space: &S,
    arena: &A,
    page: PhysAddr,
) -> Result<u64, MapError> {
    read_virt_u64(space, arena, field_address(page, INFO_PREV))
}

/// Write the free-list `prev` link of a frame's info entry.
pub fn set_page_info_prev<S: AddressSpace, A: FrameArena>(
    space: &S,
    arena: &mut A,
    page: PhysAddr,
    value: u64,
) -> Result<(), MapError> {
    write_virt_u64(space, arena, field_address(page, INFO_PREV), value)
}
