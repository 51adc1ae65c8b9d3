//! arm64 page table writer
//!
//! The hardware splits the address space between two roots: TTBR0 covers
//! the low half, TTBR1 the high half, selected by bit 63. Table geometry
//! is otherwise identical to x86-64 with a 4 KiB granule; 2 MiB mappings
//! are level-2 block descriptors.

use mezzano_protocol::header::Architecture;
use mezzano_protocol::{PhysAddr, PAGE_SIZE};

use crate::arena::{ArenaError, FrameArena, FrameKind};
use crate::space::{AddressSpace, CacheAttribute, MapAttributes, MapError, PagingRoots};
use crate::LARGE_PAGE_SIZE;

const TTE_PRESENT: u64 = 1 << 0;
/// Distinguishes table descriptors (levels 0-2) and page descriptors
/// (level 3) from block descriptors.
const TTE_TABLE: u64 = 1 << 1;
const TTE_PAGE: u64 = 1 << 1;
/// AP[2]: clear for read-write, set for read-only. EL0 never has access.
const TTE_AP_READ_ONLY: u64 = 1 << 7;
const TTE_SH_INNER_SHAREABLE: u64 = 0b11 << 8;
const TTE_AF: u64 = 1 << 10;

/// MAIR attribute indices, fixed by the trampoline's MAIR_EL1 value:
/// index 0 is normal write-back memory, index 1 is Device-nGnRE.
const TTE_ATTR_NORMAL: u64 = 0 << 2;
const TTE_ATTR_DEVICE: u64 = 1 << 2;

/// Mask to get the physical address from a translation table entry.
const TTE_ADDR_MASK: u64 = 0x0000_7FFF_FFFF_F000;

/// An arm64 address space under construction: a TTBR0/TTBR1 root pair.
pub struct Arm64TtbrPair {
    ttbr0: PhysAddr,
    ttbr1: PhysAddr,
    table_kind: FrameKind,
}

fn allocate_table<A: FrameArena>(arena: &mut A, kind: FrameKind) -> Result<PhysAddr, ArenaError> {
    let table = arena.allocate(PAGE_SIZE, PAGE_SIZE, 0, kind)?;
    arena.fill(table, 0, PAGE_SIZE);
    Ok(table)
}

fn entry_slot(table: PhysAddr, index: usize) -> PhysAddr {
    table.offset(index as u64 * 8)
}

fn leaf_bits(attrs: MapAttributes) -> u64 {
    let mut bits = TTE_PRESENT | TTE_AF | TTE_SH_INNER_SHAREABLE;
    bits |= match attrs.cache {
        CacheAttribute::Normal => TTE_ATTR_NORMAL,
        CacheAttribute::Uncached => TTE_ATTR_DEVICE,
    };
    if !attrs.writable {
        bits |= TTE_AP_READ_ONLY;
    }
    bits
}

impl Arm64TtbrPair {
    /// Adopt an existing pair of trees by their roots.
    #[must_use]
    pub const fn from_roots(ttbr0: PhysAddr, ttbr1: PhysAddr) -> Self {
        Self { ttbr0, ttbr1, table_kind: FrameKind::PageTables }
    }

    /// Root table for a virtual address: TTBR1 serves the high half.
    fn root_for(&self, virt: u64) -> PhysAddr {
        if virt >> 63 != 0 {
            self.ttbr1
        } else {
            self.ttbr0
        }
    }

    /// Table index for `virt` at the given level (1 = level 3 table,
    /// 4 = level 0 table).
    fn index(virt: u64, level: u32) -> usize {
        ((virt >> (12 + 9 * (level - 1))) & 0x1FF) as usize
    }

    fn get_or_create<A: FrameArena>(
        &self,
        arena: &mut A,
        table: PhysAddr,
        index: usize,
    ) -> Result<PhysAddr, MapError> {
        let slot = entry_slot(table, index);
        let entry = arena.read_u64(slot);
        if entry & TTE_PRESENT != 0 {
            return Ok(PhysAddr::new(entry & TTE_ADDR_MASK));
        }
        let child = allocate_table(arena, self.table_kind)?;
        arena.write_u64(slot, child.as_u64() | TTE_PRESENT | TTE_TABLE);
        Ok(child)
    }
}

impl AddressSpace for Arm64TtbrPair {
    const ARCH: Architecture = Architecture::Arm64;

    fn create<A: FrameArena>(arena: &mut A, table_kind: FrameKind) -> Result<Self, ArenaError> {
        let ttbr0 = allocate_table(arena, table_kind)?;
        let ttbr1 = allocate_table(arena, table_kind)?;
        Ok(Self { ttbr0, ttbr1, table_kind })
    }

    fn map_page<A: FrameArena>(
        &mut self,
        arena: &mut A,
        virt: u64,
        phys: u64,
        attrs: MapAttributes,
        large: bool,
    ) -> Result<(), MapError> {
        let l0 = self.root_for(virt);
        let l1 = self.get_or_create(arena, l0, Self::index(virt, 4))?;
        let l2 = self.get_or_create(arena, l1, Self::index(virt, 3))?;

        if large {
            // Level-2 block descriptor: bit 1 clear.
            let slot = entry_slot(l2, Self::index(virt, 2));
            arena.write_u64(slot, phys | leaf_bits(attrs));
            return Ok(());
        }

        // A block may already cover this address, e.g. the loader alias
        // inside the physical-map window. Blocks cannot be split; accept
        // one that resolves to the same frame.
        let l2e = arena.read_u64(entry_slot(l2, Self::index(virt, 2)));
        if l2e & TTE_PRESENT != 0 && l2e & TTE_TABLE == 0 {
            return if (l2e & TTE_ADDR_MASK) + virt % LARGE_PAGE_SIZE == phys {
                Ok(())
            } else {
                Err(MapError::AlreadyMapped { virt })
            };
        }

        let l3 = self.get_or_create(arena, l2, Self::index(virt, 2))?;
        let slot = entry_slot(l3, Self::index(virt, 1));
        arena.write_u64(slot, phys | TTE_PAGE | leaf_bits(attrs));
        Ok(())
    }

    fn translate<A: FrameArena>(&self, arena: &A, virt: u64) -> Option<PhysAddr> {
        let l0e = arena.read_u64(entry_slot(self.root_for(virt), Self::index(virt, 4)));
        if l0e & TTE_PRESENT == 0 {
            return None;
        }
        let l1e = arena.read_u64(entry_slot(
            PhysAddr::new(l0e & TTE_ADDR_MASK),
            Self::index(virt, 3),
        ));
        if l1e & TTE_PRESENT == 0 {
            return None;
        }
        let l2e = arena.read_u64(entry_slot(
            PhysAddr::new(l1e & TTE_ADDR_MASK),
            Self::index(virt, 2),
        ));
        if l2e & TTE_PRESENT == 0 {
            return None;
        }
        if l2e & TTE_TABLE == 0 {
            return Some(PhysAddr::new((l2e & TTE_ADDR_MASK) + virt % LARGE_PAGE_SIZE));
        }
        let l3e = arena.read_u64(entry_slot(
            PhysAddr::new(l2e & TTE_ADDR_MASK),
            Self::index(virt, 1),
        ));
        if l3e & TTE_PRESENT == 0 {
            return None;
        }
        Some(PhysAddr::new((l3e & TTE_ADDR_MASK) + virt % PAGE_SIZE))
    }

    fn roots(&self) -> PagingRoots {
        PagingRoots::Arm64 { ttbr0: self.ttbr0, ttbr1: self.ttbr1 }
    }
}
