//! Wired-page loading
//!
//! The kernel image is loaded in two passes over the block map.
//!
//! Pass 1 sizes the job and materialises the block map: every reachable
//! block is copied into a kernel-retained frame, and intermediate entries
//! are rewritten in place from disk block ids to the kernel virtual
//! address of the materialised child (through the physical-map window).
//! The kernel walks this in-memory tree after boot; the root's address
//! goes into the boot information page.
//!
//! Pass 2 walks the materialised tree and loads every page that must be
//! resident: wired pages normally, every present page in freestanding
//! mode. Frames come from 8 MiB chunks rather than one allocation per
//! page, which overwhelms some EFI firmwares.

use alloc::vec;

use log::{debug, info, trace};

use mezzano_paging::{sign_extend_48, AddressSpace, CacheAttribute, FrameArena, FrameKind, MapAttributes};
use mezzano_protocol::block_map::{BlockEntry, BlockFlags, ENTRIES_PER_BLOCK};
use mezzano_protocol::boot_info::PHYSICAL_MAP_BASE;
use mezzano_protocol::fixnum::fixnum;
use mezzano_protocol::header::ImageHeader;
use mezzano_protocol::page_info::PageType;
use mezzano_protocol::{PhysAddr, VirtAddr, PAGE_SIZE};

use crate::block_map::BlockCache;
use crate::error::BootError;
use crate::info::{set_page_info_extra, set_page_type};
use crate::platform::ImageRead;
use crate::LoaderOptions;
use crate::PAGE_CHUNK_SIZE;

/// The in-memory block map produced by pass 1.
#[derive(Clone, Copy, Debug)]
pub struct LoadedBlockMap {
    /// Kernel virtual address of the materialised root block.
    pub root: VirtAddr,
    /// Pages pass 2 will have to load.
    pub page_count: u64,
}

/// Pass 1: copy the block map into kernel-visible memory and count the
/// pages to load.
pub fn materialise_block_map<A: FrameArena, I: ImageRead>(
    arena: &mut A,
    image: &mut I,
    cache: &mut BlockCache,
    header: &ImageHeader,
    freestanding: bool,
) -> Result<LoadedBlockMap, BootError> {
    let (root, page_count) =
        materialise_level(arena, image, cache, header.bml4, 4, freestanding)?;
    debug!("block map root at {root:#018x}, {page_count} pages to load");
    Ok(LoadedBlockMap { root: VirtAddr::new(root), page_count })
}

fn materialise_level<A: FrameArena, I: ImageRead>(
    arena: &mut A,
    image: &mut I,
    cache: &mut BlockCache,
    block_id: u64,
    level: u32,
    freestanding: bool,
) -> Result<(u64, u64), BootError> {
    let source = cache.read_block(arena, image, block_id)?;
    let frame = arena.allocate(PAGE_SIZE, PAGE_SIZE, 0, FrameKind::Allocated)?;

    let mut block = vec![0u8; PAGE_SIZE as usize];
    arena.read(source, &mut block);
    arena.write(frame, &block);

    let mut page_count = 0u64;
    for index in 0..ENTRIES_PER_BLOCK {
        let slot = frame.offset(index as u64 * 8);
        let entry = BlockEntry(arena.read_u64(slot));
        if !entry.is_present() {
            continue;
        }
        if level > 1 {
            let (child, pages) =
                materialise_level(arena, image, cache, entry.block_id(), level - 1, freestanding)?;
            arena.write_u64(slot, entry.with_address(child).raw());
            page_count += pages;
        } else if entry.flags().contains(BlockFlags::WIRED) || freestanding {
            page_count += 1;
        }
    }

    Ok((PHYSICAL_MAP_BASE + frame.as_u64(), page_count))
}

/// Frames for loaded pages are carved out of multi-megabyte chunks.
struct PageChunk {
    next: u64,
    remaining: u64,
}

impl PageChunk {
    const fn empty() -> Self {
        Self { next: 0, remaining: 0 }
    }

    fn take_slot<A: FrameArena>(
        &mut self,
        arena: &mut A,
        pages_left: u64,
    ) -> Result<PhysAddr, BootError> {
        if self.remaining == 0 {
            let want = (pages_left * PAGE_SIZE).clamp(PAGE_SIZE, PAGE_CHUNK_SIZE);
            let base = arena.allocate(want, PAGE_SIZE, 0x10_0000, FrameKind::Allocated)?;
            trace!("new page chunk {base} ({want:#x} bytes)");
            self.next = base.as_u64();
            self.remaining = want;
        }
        let slot = PhysAddr::new(self.next);
        self.next += PAGE_SIZE;
        self.remaining -= PAGE_SIZE;
        Ok(slot)
    }
}

struct LoadState<'a> {
    options: &'a LoaderOptions,
    chunk: PageChunk,
    total: u64,
    loaded: u64,
}

/// Pass 2: load every resident page of the materialised block map into the
/// kernel address space. Returns the number of pages loaded.
pub fn load_wired_pages<S: AddressSpace, A: FrameArena, I: ImageRead>(
    space: &mut S,
    arena: &mut A,
    image: &mut I,
    map: &LoadedBlockMap,
    options: &LoaderOptions,
) -> Result<u64, BootError> {
    let mut state = LoadState {
        options,
        chunk: PageChunk::empty(),
        total: map.page_count,
        loaded: 0,
    };
    walk_level(space, arena, image, map.root.as_u64(), 4, 0, &mut state)?;
    info!("loaded {} of {} pages", state.loaded, state.total);
    Ok(state.loaded)
}

fn walk_level<S: AddressSpace, A: FrameArena, I: ImageRead>(
    space: &mut S,
    arena: &mut A,
    image: &mut I,
    block_virt: u64,
    level: u32,
    virt_prefix: u64,
    state: &mut LoadState<'_>,
) -> Result<(), BootError> {
    let block_phys = PhysAddr::new(block_virt - PHYSICAL_MAP_BASE);
    for index in 0..ENTRIES_PER_BLOCK {
        let entry = BlockEntry(arena.read_u64(block_phys.offset(index as u64 * 8)));
        if !entry.is_present() {
            continue;
        }
        let virt = virt_prefix | ((index as u64) << (12 + 9 * (level - 1)));
        if level > 1 {
            walk_level(space, arena, image, entry.address(), level - 1, virt, state)?;
        } else {
            load_page(space, arena, image, sign_extend_48(virt), entry, state)?;
        }
    }
    Ok(())
}

fn load_page<S: AddressSpace, A: FrameArena, I: ImageRead>(
    space: &mut S,
    arena: &mut A,
    image: &mut I,
    virt: u64,
    entry: BlockEntry,
    state: &mut LoadState<'_>,
) -> Result<(), BootError> {
    let flags = entry.flags();
    if flags.contains(BlockFlags::TRANSIENT) {
        return Ok(());
    }
    if !flags.contains(BlockFlags::WIRED) && !state.options.freestanding {
        return Ok(());
    }

    let phys = state
        .chunk
        .take_slot(arena, state.total.saturating_sub(state.loaded))?;

    // Dirty-tracked pages start read-only so the kernel's fault handler
    // observes the first write.
    let writable =
        flags.contains(BlockFlags::WRITABLE) && !flags.contains(BlockFlags::TRACK_DIRTY);
    space.map(
        arena,
        virt,
        phys.as_u64(),
        PAGE_SIZE,
        MapAttributes { writable, cache: CacheAttribute::Normal },
    )?;

    set_page_info_extra(space, arena, phys, fixnum(entry.block_id() as i64))?;
    let page_type = if state.options.freestanding {
        PageType::Active
    } else {
        PageType::Wired
    };
    set_page_type(space, arena, phys, page_type)?;

    if flags.contains(BlockFlags::ZERO_FILL) {
        arena.fill(phys, 0, PAGE_SIZE);
    } else {
        let block = entry.block_id();
        let mut buf = vec![0u8; PAGE_SIZE as usize];
        image
            .read_at(&mut buf, block * PAGE_SIZE)
            .map_err(|error| BootError::Io { block, error })?;
        arena.write(phys, &buf);
    }

    if state.options.verbose {
        debug!("loaded page {virt:#018x} -> {phys} ({flags:?})");
    }
    state.loaded += 1;
    Ok(())
}
