//! Address spaces
//!
//! The loader owns two paging trees per boot: the kernel's final tree and
//! the transition tree used to hop from identity addressing into the
//! physical-map window. Both are built through [`AddressSpace`], which
//! hides the architecture split (single CR3 root on x86-64, a TTBR pair on
//! arm64) behind one contract:
//!
//! - `map` installs page-aligned ranges, preferring 2 MiB pages when the
//!   physical and virtual offsets agree
//! - `translate` resolves a virtual address through the tree under
//!   construction, honouring large pages
//! - [`memset`]/[`memcpy_to`]/[`memcpy_from`] edit kernel-virtual memory
//!   page by page, which is the only way the loader can touch structures
//!   that exist solely in the kernel's address space

use mezzano_protocol::header::Architecture;
use mezzano_protocol::{PhysAddr, PAGE_SIZE};

use crate::arena::{ArenaError, FrameArena, FrameKind};
use crate::LARGE_PAGE_SIZE;

/// Cache behaviour of a mapping.
///
/// Real RAM is mapped normal-cacheable; embedded platforms map their
/// low-address MMIO windows uncached.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CacheAttribute {
    Normal,
    Uncached,
}

/// Attributes of a mapping operation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MapAttributes {
    pub writable: bool,
    pub cache: CacheAttribute,
}

impl MapAttributes {
    /// Writable, normal-cacheable. The common case.
    #[inline]
    #[must_use]
    pub const fn normal() -> Self {
        Self { writable: true, cache: CacheAttribute::Normal }
    }

    /// Read-only, normal-cacheable. Used for dirty-tracked pages, which
    /// must start read-only so the kernel observes the first write.
    #[inline]
    #[must_use]
    pub const fn read_only() -> Self {
        Self { writable: false, cache: CacheAttribute::Normal }
    }

    /// Writable, uncached.
    #[inline]
    #[must_use]
    pub const fn uncached() -> Self {
        Self { writable: true, cache: CacheAttribute::Uncached }
    }
}

/// Errors from mapping and virtual memory operations.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[must_use = "mapping errors must be handled"]
pub enum MapError {
    /// The virtual address lies outside the canonical ranges.
    NonCanonical { virt: u64 },
    /// An address or size is not page-aligned.
    Misaligned,
    /// A virtual address in the range has no mapping.
    NotMapped { virt: u64 },
    /// The virtual address is already covered by a large mapping that
    /// resolves somewhere else; large pages are never split.
    AlreadyMapped { virt: u64 },
    /// A page table frame could not be allocated.
    Arena(ArenaError),
}

impl From<ArenaError> for MapError {
    fn from(error: ArenaError) -> Self {
        Self::Arena(error)
    }
}

impl core::fmt::Display for MapError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::NonCanonical { virt } => write!(f, "non-canonical virtual address {virt:#x}"),
            Self::Misaligned => write!(f, "address or size is not page-aligned"),
            Self::NotMapped { virt } => write!(f, "virtual address {virt:#x} is not mapped"),
            Self::AlreadyMapped { virt } => {
                write!(f, "virtual address {virt:#x} conflicts with an existing mapping")
            }
            Self::Arena(error) => write!(f, "{error}"),
        }
    }
}

/// The top-level table roots of a finished address space, in the form the
/// architecture trampoline loads into the hardware.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PagingRoots {
    X8664 { pml4: PhysAddr },
    Arm64 { ttbr0: PhysAddr, ttbr1: PhysAddr },
}

/// Whether an address is canonical for a 48-bit virtual address space:
/// bits 63..47 all equal bit 47.
#[inline]
#[must_use]
pub const fn is_canonical(addr: u64) -> bool {
    let upper = (addr as i64) >> 47;
    upper == 0 || upper == -1
}

/// Whether `[start, start + size)` is canonical and stays in one half.
#[inline]
#[must_use]
pub const fn is_canonical_range(start: u64, size: u64) -> bool {
    if size == 0 {
        return is_canonical(start);
    }
    let end = start + size - 1;
    is_canonical(start) && is_canonical(end) && (start >> 63) == (end >> 63)
}

/// Sign-extend a 48-bit virtual address to its canonical 64-bit form.
#[inline]
#[must_use]
pub const fn sign_extend_48(addr: u64) -> u64 {
    (((addr << 16) as i64) >> 16) as u64
}

/// An under-construction paging tree.
///
/// Implementations walk and edit their tables exclusively through the
/// frame arena, so none of this code depends on running on the target.
pub trait AddressSpace: Sized {
    /// The architecture whose table format this type writes.
    const ARCH: Architecture;

    /// Create an empty address space, allocating its root table frame(s)
    /// with the given kind. The kind also tags every intermediate table
    /// allocated later.
    fn create<A: FrameArena>(arena: &mut A, table_kind: FrameKind) -> Result<Self, ArenaError>;

    /// Architecture hook: install one 4 KiB (or, when `large`, one 2 MiB)
    /// mapping. Addresses arrive aligned and canonical; intermediate
    /// tables are allocated on demand.
    fn map_page<A: FrameArena>(
        &mut self,
        arena: &mut A,
        virt: u64,
        phys: u64,
        attrs: MapAttributes,
        large: bool,
    ) -> Result<(), MapError>;

    /// Resolve a virtual address to a physical address through this tree,
    /// honouring large-page mappings. `None` if unmapped.
    fn translate<A: FrameArena>(&self, arena: &A, virt: u64) -> Option<PhysAddr>;

    /// The finished roots, for the trampoline.
    fn roots(&self) -> PagingRoots;

    /// Map `[virt, virt + size)` to `[phys, phys + size)`.
    ///
    /// All three values must be page-aligned and the virtual range
    /// canonical. When the virtual and physical addresses share their
    /// offset within a 2 MiB page, the range is aligned up with small
    /// pages, covered with large pages, and finished with small pages;
    /// otherwise it is mapped 4 KiB at a time.
    fn map<A: FrameArena>(
        &mut self,
        arena: &mut A,
        virt: u64,
        phys: u64,
        size: u64,
        attrs: MapAttributes,
    ) -> Result<(), MapError> {
        if virt % PAGE_SIZE != 0 || phys % PAGE_SIZE != 0 || size % PAGE_SIZE != 0 {
            return Err(MapError::Misaligned);
        }
        if !is_canonical_range(virt, size) {
            return Err(MapError::NonCanonical { virt });
        }

        let mut virt = virt;
        let mut phys = phys;
        let mut size = size;

        if virt % LARGE_PAGE_SIZE == phys % LARGE_PAGE_SIZE {
            while virt % LARGE_PAGE_SIZE != 0 && size != 0 {
                self.map_page(arena, virt, phys, attrs, false)?;
                virt += PAGE_SIZE;
                phys += PAGE_SIZE;
                size -= PAGE_SIZE;
            }
            while size >= LARGE_PAGE_SIZE {
                self.map_page(arena, virt, phys, attrs, true)?;
                virt += LARGE_PAGE_SIZE;
                phys += LARGE_PAGE_SIZE;
                size -= LARGE_PAGE_SIZE;
            }
        }

        while size != 0 {
            self.map_page(arena, virt, phys, attrs, false)?;
            virt += PAGE_SIZE;
            phys += PAGE_SIZE;
            size -= PAGE_SIZE;
        }

        Ok(())
    }
}

/// Whether a single virtual address has a mapping.
#[must_use]
pub fn is_mapped<S: AddressSpace, A: FrameArena>(space: &S, arena: &A, virt: u64) -> bool {
    space.translate(arena, virt).is_some()
}

/// Fill `[virt, virt + size)` in the kernel's address space.
pub fn memset<S: AddressSpace, A: FrameArena>(
    space: &S,
    arena: &mut A,
    virt: u64,
    value: u8,
    size: u64,
) -> Result<(), MapError> {
    if !is_canonical_range(virt, size) {
        return Err(MapError::NonCanonical { virt });
    }
    let mut virt = virt;
    let mut remaining = size;
    while remaining != 0 {
        let phys = space
            .translate(arena, virt)
            .ok_or(MapError::NotMapped { virt })?;
        let step = (PAGE_SIZE - virt % PAGE_SIZE).min(remaining);
        arena.fill(phys, value, step);
        virt += step;
        remaining -= step;
    }
    Ok(())
}

/// Copy bytes into the kernel's address space.
pub fn memcpy_to<S: AddressSpace, A: FrameArena>(
    space: &S,
    arena: &mut A,
    virt: u64,
    src: &[u8],
) -> Result<(), MapError> {
    if !is_canonical_range(virt, src.len() as u64) {
        return Err(MapError::NonCanonical { virt });
    }
    let mut virt = virt;
    let mut offset = 0usize;
    while offset < src.len() {
        let phys = space
            .translate(arena, virt)
            .ok_or(MapError::NotMapped { virt })?;
        let step = (PAGE_SIZE - virt % PAGE_SIZE).min((src.len() - offset) as u64) as usize;
        arena.write(phys, &src[offset..offset + step]);
        virt += step as u64;
        offset += step;
    }
    Ok(())
}

/// Copy bytes out of the kernel's address space.
pub fn memcpy_from<S: AddressSpace, A: FrameArena>(
    space: &S,
    arena: &A,
    dst: &mut [u8],
    virt: u64,
) -> Result<(), MapError> {
    if !is_canonical_range(virt, dst.len() as u64) {
        return Err(MapError::NonCanonical { virt });
    }
    let mut virt = virt;
    let mut offset = 0usize;
    while offset < dst.len() {
        let phys = space
            .translate(arena, virt)
            .ok_or(MapError::NotMapped { virt })?;
        let step = (PAGE_SIZE - virt % PAGE_SIZE).min((dst.len() - offset) as u64) as usize;
        arena.read(phys, &mut dst[offset..offset + step]);
        virt += step as u64;
        offset += step;
    }
    Ok(())
}

/// Read one little-endian u64 from the kernel's address space.
pub fn read_virt_u64<S: AddressSpace, A: FrameArena>(
    space: &S,
    arena: &A,
    virt: u64,
) -> Result<u64, MapError> {
    let mut bytes = [0u8; 8];
    memcpy_from(space, arena, &mut bytes, virt)?;
    Ok(u64::from_le_bytes(bytes))
}

/// Write one little-endian u64 into the kernel's address space.
pub fn write_virt_u64<S: AddressSpace, A: FrameArena>(
    space: &S,
    arena: &mut A,
    virt: u64,
    value: u64,
) -> Result<(), MapError> {
    memcpy_to(space, arena, virt, &value.to_le_bytes())
}
