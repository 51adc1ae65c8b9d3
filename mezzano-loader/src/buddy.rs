//! Buddy allocator construction
//!
//! The kernel's physical allocator is a pair of two-level buddy systems:
//! one for memory below 4 GiB, one for the rest of the physical map. The
//! loader hands it over already populated: every page the bootloader no
//! longer needs is released with iterative buddy coalescing, threading the
//! free lists through the page-info `next`/`prev` fields.
//!
//! The coalesce loop must match the kernel's expectations exactly - a
//! differently ordered or differently bounded merge leaves list structure
//! the kernel's invariants reject.

use log::trace;

use mezzano_paging::{AddressSpace, FrameArena, MemoryRange, RangeKind};
use mezzano_protocol::boot_info::{BootInformation, BuddyBin, BUDDY_BINS_32, BUDDY_BINS_64};
use mezzano_protocol::fixnum::{fixnum, unfixnum};
use mezzano_protocol::page_info::PageType;
use mezzano_protocol::{PhysAddr, PAGE_SHIFT, PAGE_SIZE};

use crate::error::BootError;
use crate::info::{
    page_bin, page_info_next, page_info_prev, page_type, set_page_bin, set_page_info_next,
    set_page_info_prev, set_page_type,
};
use crate::physmap::MemoryMap;
use crate::BUDDY_FLOOR;

/// Reset every bin to empty: `first_page` holds the kernel's nil,
/// `count` a fixnum zero.
pub fn initialise_bins(boot_info: &mut BootInformation, nil: u64) {
    for bin in boot_info
        .buddy_bin_32
        .iter_mut()
        .chain(boot_info.buddy_bin_64.iter_mut())
    {
        bin.first_page = nil;
        bin.count = fixnum(0);
    }
}

/// The buddy of `page` at order `k`.
const fn buddy(k: usize, page: u64) -> u64 {
    page ^ (1u64 << (k as u32 + PAGE_SHIFT))
}

/// Classify the bootloader's finalised memory and feed the buddy
/// allocators.
///
/// Free pages above the low-memory floor are released; frames of the
/// kernel's paging tree are typed `page-table` so the kernel keeps them.
/// Pages outside the memory map have no page-info backing and stay out of
/// the allocator entirely.
pub fn release_firmware_memory<S: AddressSpace, A: FrameArena>(
    space: &S,
    arena: &mut A,
    boot_info: &mut BootInformation,
    map: &MemoryMap,
    nil: u64,
    ranges: &[MemoryRange],
) -> Result<(), BootError> {
    for range in ranges {
        match range.kind {
            RangeKind::Free => {
                let mut addr = range.start;
                while addr < range.end() {
                    if addr > BUDDY_FLOOR && map.contains_page(PhysAddr::new(addr)) {
                        buddy_free_page(space, arena, boot_info, map, nil, addr)?;
                    }
                    addr += PAGE_SIZE;
                }
            }
            RangeKind::PageTables => {
                let mut addr = range.start;
                while addr < range.end() {
                    set_page_type(space, arena, PhysAddr::new(addr), PageType::PageTable)?;
                    addr += PAGE_SIZE;
                }
            }
            RangeKind::Allocated | RangeKind::Internal => {}
        }
    }
    Ok(())
}

/// Release one page, coalescing it with its buddy as far as possible.
pub fn buddy_free_page<S: AddressSpace, A: FrameArena>(
    space: &S,
    arena: &mut A,
    boot_info: &mut BootInformation,
    map: &MemoryMap,
    nil: u64,
    page: u64,
) -> Result<(), BootError> {
    let (bins, max_bin): (&mut [BuddyBin], usize) = if page < 0x1_0000_0000 {
        (&mut boot_info.buddy_bin_32, BUDDY_BINS_32 - 1)
    } else {
        (&mut boot_info.buddy_bin_64, BUDDY_BINS_64 - 1)
    };

    let mut low = page;
    let mut k = 0usize;
    loop {
        let partner = buddy(k, low);
        // Stop combining at the last bin, when the buddy does not exist,
        // when it is not free, or when it sits in a different bin.
        if k == max_bin || !map.contains_page(PhysAddr::new(partner)) {
            break;
        }
        let partner_addr = PhysAddr::new(partner);
        if page_type(space, arena, partner_addr)? != PageType::Free
            || page_bin(space, arena, partner_addr)? != k as u8
        {
            break;
        }

        // Unlink the buddy from its free list.
        let next = page_info_next(space, arena, partner_addr)?;
        let prev = page_info_prev(space, arena, partner_addr)?;
        if bins[k].first_page == fixnum((partner / PAGE_SIZE) as i64) {
            bins[k].first_page = next;
        }
        if next != nil {
            set_page_info_prev(space, arena, page_from_fixnum(next), prev)?;
        }
        if prev != nil {
            set_page_info_next(space, arena, page_from_fixnum(prev), next)?;
        }
        bins[k].count = bins[k].count.wrapping_sub(fixnum(1));

        k += 1;
        if partner < low {
            low = partner;
        }
    }

    // Push the merged page at the head of its bin.
    let low_addr = PhysAddr::new(low);
    set_page_type(space, arena, low_addr, PageType::Free)?;
    set_page_bin(space, arena, low_addr, k as u8)?;
    set_page_info_next(space, arena, low_addr, bins[k].first_page)?;
    set_page_info_prev(space, arena, low_addr, nil)?;
    if bins[k].first_page != nil {
        let old_head = page_from_fixnum(bins[k].first_page);
        set_page_info_prev(space, arena, old_head, fixnum((low / PAGE_SIZE) as i64))?;
    }
    bins[k].first_page = fixnum((low / PAGE_SIZE) as i64);
    bins[k].count = bins[k].count.wrapping_add(fixnum(1));

    Ok(())
}

fn page_from_fixnum(value: u64) -> PhysAddr {
    PhysAddr::new((unfixnum(value) as u64) * PAGE_SIZE)
}

/// Walk and log every free list, at trace level.
pub fn dump_buddy_allocators<S: AddressSpace, A: FrameArena>(
    space: &S,
    arena: &A,
    boot_info: &BootInformation,
    nil: u64,
) {
    if !log::log_enabled!(log::Level::Trace) {
        return;
    }
    trace!("32-bit buddy allocator:");
    dump_bins(space, arena, &boot_info.buddy_bin_32, nil);
    trace!("64-bit buddy allocator:");
    dump_bins(space, arena, &boot_info.buddy_bin_64, nil);
}

fn dump_bins<S: AddressSpace, A: FrameArena>(space: &S, arena: &A, bins: &[BuddyBin], nil: u64) {
    for (k, bin) in bins.iter().enumerate() {
        trace!(
            "  order {} count {} head {:#018x}",
            k as u32 + PAGE_SHIFT,
            unfixnum(bin.count),
            bin.first_page
        );
        let mut current = bin.first_page;
        while current != nil {
            let page = page_from_fixnum(current);
            let next = page_info_next(space, arena, page).unwrap_or(nil);
            let prev = page_info_prev(space, arena, page).unwrap_or(nil);
            trace!(
                "    {:#018x}-{:#018x} next {:#018x} prev {:#018x}",
                page.as_u64(),
                page.as_u64() + (1u64 << (k as u32 + PAGE_SHIFT)),
                next,
                prev
            );
            current = next;
        }
    }
}
