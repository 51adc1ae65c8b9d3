//! Block-map entries
//!
//! The image stores kernel pages in a sparse 4-level radix trie over 48-bit
//! virtual addresses. Each level is one 4 KiB block of 512 little-endian
//! 64-bit entries: a flag byte in the low 8 bits and a disk block id in the
//! upper 56. Non-PRESENT entries terminate the walk.

use bitflags::bitflags;

use crate::PAGE_SIZE;

bitflags! {
    /// Flag byte of a block-map entry.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct BlockFlags: u64 {
        /// The entry refers to a valid child table or data block.
        const PRESENT = 0x01;
        /// The page is writable once loaded.
        const WRITABLE = 0x02;
        /// The page has no backing block and is zero on first touch.
        const ZERO_FILL = 0x04;
        /// The page must be resident before the kernel runs.
        const WIRED = 0x10;
        /// First writes must fault so the kernel can track dirtiness.
        const TRACK_DIRTY = 0x20;
        /// The page is never loaded by the bootloader.
        const TRANSIENT = 0x40;
    }
}

/// Mask covering the flag byte of an entry.
pub const FLAG_MASK: u64 = 0xFF;

/// Shift from an entry to its block id.
pub const ID_SHIFT: u32 = 8;

/// Entries per 4 KiB block-map block.
pub const ENTRIES_PER_BLOCK: usize = 512;

/// Number of levels in the block map.
pub const BLOCK_MAP_LEVELS: u32 = 4;

const _: () = assert!(ENTRIES_PER_BLOCK as u64 * 8 == PAGE_SIZE);

/// One 64-bit block-map entry.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
#[repr(transparent)]
pub struct BlockEntry(pub u64);

impl BlockEntry {
    /// The all-zero, non-present entry.
    pub const EMPTY: Self = Self(0);

    /// Raw entry value.
    #[inline]
    #[must_use]
    pub const fn raw(self) -> u64 {
        self.0
    }

    /// The entry's flag byte.
    #[inline]
    #[must_use]
    pub fn flags(self) -> BlockFlags {
        BlockFlags::from_bits_truncate(self.0 & FLAG_MASK)
    }

    /// The disk block id (or, after materialisation, the address payload).
    #[inline]
    #[must_use]
    pub const fn block_id(self) -> u64 {
        self.0 >> ID_SHIFT
    }

    /// Whether the entry refers to anything at all.
    #[inline]
    #[must_use]
    pub const fn is_present(self) -> bool {
        self.0 & BlockFlags::PRESENT.bits() != 0
    }

    /// Build an entry from a block id and flags.
    #[inline]
    #[must_use]
    pub const fn from_parts(block_id: u64, flags: BlockFlags) -> Self {
        Self((block_id << ID_SHIFT) | flags.bits())
    }

    /// Replace the payload with a page-aligned address, keeping the flag
    /// byte. Used when rewriting a materialised block map in place.
    #[inline]
    #[must_use]
    pub const fn with_address(self, address: u64) -> Self {
        Self((address & !FLAG_MASK) | (self.0 & FLAG_MASK))
    }

    /// The page-aligned address payload of a rewritten entry.
    #[inline]
    #[must_use]
    pub const fn address(self) -> u64 {
        self.0 & !FLAG_MASK
    }
}

/// Index into the given block-map level (1 = leaf, 4 = root) for a virtual
/// address. The levels consume bits [47:39], [38:30], [29:21] and [20:12].
#[inline]
#[must_use]
pub const fn level_index(virt: u64, level: u32) -> usize {
    ((virt >> (12 + 9 * (level - 1))) & 0x1FF) as usize
}
