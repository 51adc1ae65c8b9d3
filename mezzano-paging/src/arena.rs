//! Frame arena
//!
//! The pre-kernel environment has no heap beyond pages: every frame the
//! loader uses comes from one linear, append-only pool owned by the
//! surrounding bootloader. [`FrameArena`] models that pool together with
//! the loader's identity-mapped view of physical memory, and is threaded
//! as an explicit `&mut` parameter through everything that allocates -
//! there is no ambient allocator state.
//!
//! Frames are never returned individually. At [`FrameArena::finalize`] the
//! pool is surrendered as a whole and the arena reports its final memory
//! layout so the loader can hand the free remainder to the kernel.

use alloc::vec::Vec;

use mezzano_protocol::{PhysAddr, PAGE_SIZE};

/// What an allocation is for, which decides its fate at hand-off.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FrameKind {
    /// Part of the kernel's initial state; the kernel keeps it.
    Allocated,
    /// A frame of the kernel's paging tree; the kernel keeps it and marks
    /// it as such.
    PageTables,
    /// Loader scratch, reclaimed as free memory at finalisation.
    Internal,
}

/// Classification of a range in the finalised memory layout.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RangeKind {
    /// Unused RAM, to be released to the kernel's allocator.
    Free,
    /// Retained for the kernel (loaded pages, info arrays, boot info).
    Allocated,
    /// Frames of the kernel's paging tree.
    PageTables,
    /// Loader-internal memory. Dead once the kernel is entered, but still
    /// holding live loader state until then.
    Internal,
}

/// One range of the finalised memory layout.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MemoryRange {
    pub start: u64,
    pub size: u64,
    pub kind: RangeKind,
}

impl MemoryRange {
    /// Exclusive end address of the range.
    #[inline]
    #[must_use]
    pub const fn end(&self) -> u64 {
        self.start + self.size
    }
}

/// Errors from the frame arena.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[must_use = "allocation failures must be handled"]
pub enum ArenaError {
    /// No region satisfies the request.
    Exhausted { size: u64 },
}

impl core::fmt::Display for ArenaError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::Exhausted { size } => {
                write!(f, "out of physical memory allocating {size:#x} bytes")
            }
        }
    }
}

/// A page-granular physical allocator plus access to the loader's view of
/// physical memory.
///
/// `read`, `write` and `fill` act through the loader's identity mapping;
/// they must only be used on RAM the firmware reported. Page-table walks,
/// block-cache fills and page-info initialisation all go through these
/// instead of raw pointers, which is what makes the construction testable
/// off-target.
pub trait FrameArena {
    /// Allocate `size` bytes of physically contiguous frames.
    ///
    /// `align` and `size` are multiples of the page size; the result is at
    /// or above `min_addr`. The memory is not zeroed.
    fn allocate(
        &mut self,
        size: u64,
        align: u64,
        min_addr: u64,
        kind: FrameKind,
    ) -> Result<PhysAddr, ArenaError>;

    /// Read bytes from physical memory.
    fn read(&self, phys: PhysAddr, buf: &mut [u8]);

    /// Write bytes to physical memory.
    fn write(&mut self, phys: PhysAddr, data: &[u8]);

    /// Fill a physical range with a byte value.
    fn fill(&mut self, phys: PhysAddr, value: u8, size: u64);

    /// Surrender the pool and report the final memory layout.
    ///
    /// Internal allocations are reported as free: once the kernel is
    /// entered the loader's scratch memory belongs to it. Allocating after
    /// finalisation is a contract violation.
    fn finalize(&mut self) -> Vec<MemoryRange>;

    /// Allocate a single page anywhere.
    fn allocate_page(&mut self, kind: FrameKind) -> Result<PhysAddr, ArenaError> {
        self.allocate(PAGE_SIZE, PAGE_SIZE, 0, kind)
    }

    /// Read one little-endian u64.
    fn read_u64(&self, phys: PhysAddr) -> u64 {
        let mut bytes = [0u8; 8];
        self.read(phys, &mut bytes);
        u64::from_le_bytes(bytes)
    }

    /// Write one little-endian u64.
    fn write_u64(&mut self, phys: PhysAddr, value: u64) {
        self.write(phys, &value.to_le_bytes());
    }
}
