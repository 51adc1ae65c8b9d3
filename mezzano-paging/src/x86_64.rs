//! x86-64 page table writer
//!
//! A single PML4 root covers both halves of the 48-bit address space.
//! 2 MiB mappings are installed as PS entries at the page-directory level.

use mezzano_protocol::header::Architecture;
use mezzano_protocol::{PhysAddr, PAGE_SIZE};

use crate::arena::{ArenaError, FrameArena, FrameKind};
use crate::space::{AddressSpace, CacheAttribute, MapAttributes, MapError, PagingRoots};
use crate::LARGE_PAGE_SIZE;

const PTE_PRESENT: u64 = 1 << 0;
const PTE_WRITE: u64 = 1 << 1;
const PTE_PWT: u64 = 1 << 3;
const PTE_PCD: u64 = 1 << 4;
const PTE_LARGE: u64 = 1 << 7;

/// Mask to get the physical address from a page table entry.
const PTE_ADDR_MASK: u64 = 0x000F_FFFF_FFFF_F000;

/// An x86-64 address space under construction.
pub struct X8664Pml4 {
    pml4: PhysAddr,
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
    let mut bits = PTE_PRESENT;
    if attrs.writable {
        bits |= PTE_WRITE;
    }
    if attrs.cache == CacheAttribute::Uncached {
        bits |= PTE_PCD | PTE_PWT;
    }
    bits
}

impl X8664Pml4 {
    /// Adopt an existing tree by its root, e.g. to inspect or extend a
    /// space whose owner only kept the roots.
    #[must_use]
    pub const fn from_root(pml4: PhysAddr) -> Self {
        Self { pml4, table_kind: FrameKind::PageTables }
    }

    /// Table index for `virt` at the given level (1 = PT, 4 = PML4).
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
        if entry & PTE_PRESENT != 0 {
            return Ok(PhysAddr::new(entry & PTE_ADDR_MASK));
        }
        let child = allocate_table(arena, self.table_kind)?;
        // Intermediate entries stay writable; access control lives in the
        // leaf entries.
        arena.write_u64(slot, child.as_u64() | PTE_PRESENT | PTE_WRITE);
        Ok(child)
    }
}

impl AddressSpace for X8664Pml4 {
    const ARCH: Architecture = Architecture::X8664;

    fn create<A: FrameArena>(arena: &mut A, table_kind: FrameKind) -> Result<Self, ArenaError> {
        let pml4 = allocate_table(arena, table_kind)?;
        Ok(Self { pml4, table_kind })
    }

    fn map_page<A: FrameArena>(
        &mut self,
        arena: &mut A,
        virt: u64,
        phys: u64,
        attrs: MapAttributes,
        large: bool,
    ) -> Result<(), MapError> {
        let pdpt = self.get_or_create(arena, self.pml4, Self::index(virt, 4))?;
        let pd = self.get_or_create(arena, pdpt, Self::index(virt, 3))?;

        if large {
            let slot = entry_slot(pd, Self::index(virt, 2));
            arena.write_u64(slot, phys | PTE_LARGE | leaf_bits(attrs));
            return Ok(());
        }

        // A large mapping may already cover this address, e.g. the loader
        // alias inside the physical-map window. It cannot be split; accept
        // it when it resolves to the same frame.
        let pde = arena.read_u64(entry_slot(pd, Self::index(virt, 2)));
        if pde & PTE_PRESENT != 0 && pde & PTE_LARGE != 0 {
            return if (pde & PTE_ADDR_MASK) + virt % LARGE_PAGE_SIZE == phys {
                Ok(())
            } else {
                Err(MapError::AlreadyMapped { virt })
            };
        }

        let pt = self.get_or_create(arena, pd, Self::index(virt, 2))?;
        let slot = entry_slot(pt, Self::index(virt, 1));
        arena.write_u64(slot, phys | leaf_bits(attrs));
        Ok(())
    }

    fn translate<A: FrameArena>(&self, arena: &A, virt: u64) -> Option<PhysAddr> {
        let pml4e = arena.read_u64(entry_slot(self.pml4, Self::index(virt, 4)));
        if pml4e & PTE_PRESENT == 0 {
            return None;
        }
        let pdpte = arena.read_u64(entry_slot(
            PhysAddr::new(pml4e & PTE_ADDR_MASK),
            Self::index(virt, 3),
        ));
        if pdpte & PTE_PRESENT == 0 {
            return None;
        }
        let pde = arena.read_u64(entry_slot(
            PhysAddr::new(pdpte & PTE_ADDR_MASK),
            Self::index(virt, 2),
        ));
        if pde & PTE_PRESENT == 0 {
            return None;
        }
        if pde & PTE_LARGE != 0 {
            return Some(PhysAddr::new((pde & PTE_ADDR_MASK) + virt % LARGE_PAGE_SIZE));
        }
        let pte = arena.read_u64(entry_slot(
            PhysAddr::new(pde & PTE_ADDR_MASK),
            Self::index(virt, 1),
        ));
        if pte & PTE_PRESENT == 0 {
            return None;
        }
        Some(PhysAddr::new((pte & PTE_ADDR_MASK) + virt % PAGE_SIZE))
    }

    fn roots(&self) -> PagingRoots {
        PagingRoots::X8664 { pml4: self.pml4 }
    }
}
