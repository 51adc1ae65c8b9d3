//! Block-map walking and the block cache
//!
//! The image's block map is a sparse 4-level radix trie of 4 KiB blocks on
//! disk. Walking it touches the same indirect blocks over and over, so a
//! small most-recently-used cache sits in front of the device. Cached
//! blocks live in pages from the arena, not the heap - the bootloader heap
//! is fixed-size and small - and are never evicted: the total number of
//! indirect blocks in an image is bounded.

use alloc::vec;
use alloc::vec::Vec;

use mezzano_paging::{FrameArena, FrameKind};
use mezzano_protocol::block_map::{level_index, BlockEntry};
use mezzano_protocol::{PhysAddr, PAGE_SIZE};

use crate::error::BootError;
use crate::platform::ImageRead;

struct CacheEntry {
    block: u64,
    data: PhysAddr,
}

/// Most-recently-used cache of image blocks.
pub struct BlockCache {
    entries: Vec<CacheEntry>,
}

impl BlockCache {
    #[must_use]
    pub const fn new() -> Self {
        Self { entries: Vec::new() }
    }

    /// The physical page holding `block_id`, reading it if necessary.
    pub fn read_block<A: FrameArena, I: ImageRead>(
        &mut self,
        arena: &mut A,
        image: &mut I,
        block_id: u64,
    ) -> Result<PhysAddr, BootError> {
        if let Some(position) = self.entries.iter().position(|e| e.block == block_id) {
            // Splice recently used blocks to the front of the list.
            let entry = self.entries.remove(position);
            self.entries.insert(0, entry);
            return Ok(self.entries[0].data);
        }

        let data = arena.allocate(PAGE_SIZE, PAGE_SIZE, 0, FrameKind::Internal)?;
        let mut buf = vec![0u8; PAGE_SIZE as usize];
        image
            .read_at(&mut buf, block_id * PAGE_SIZE)
            .map_err(|error| BootError::Io { block: block_id, error })?;
        arena.write(data, &buf);

        self.entries.insert(0, CacheEntry { block: block_id, data });
        Ok(data)
    }

    /// One entry of a cached block.
    pub fn read_entry<A: FrameArena, I: ImageRead>(
        &mut self,
        arena: &mut A,
        image: &mut I,
        block_id: u64,
        index: usize,
    ) -> Result<BlockEntry, BootError> {
        let block = self.read_block(arena, image, block_id)?;
        Ok(BlockEntry(arena.read_u64(block.offset(index as u64 * 8))))
    }
}

impl Default for BlockCache {
    fn default() -> Self {
        Self::new()
    }
}

/// Resolve a kernel virtual address through the on-disk block map.
///
/// Returns the level-1 entry (flags plus data block id), or the zero
/// entry if any level on the way down is non-present.
pub fn read_info_for_page<A: FrameArena, I: ImageRead>(
    cache: &mut BlockCache,
    arena: &mut A,
    image: &mut I,
    bml4: u64,
    virt: u64,
) -> Result<BlockEntry, BootError> {
    let mut block = bml4;
    for level in [4u32, 3, 2] {
        let entry = cache.read_entry(arena, image, block, level_index(virt, level))?;
        if !entry.is_present() {
            return Ok(BlockEntry::EMPTY);
        }
        block = entry.block_id();
    }
    cache.read_entry(arena, image, block, level_index(virt, 1))
}
