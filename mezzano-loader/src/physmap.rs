//! Physical map and kernel memory map
//!
//! Everything the firmware reports as RAM is mirrored into the kernel's
//! physical-map window at `PHYSICAL_MAP_BASE + phys`, clipped to the
//! window's 512 GiB. Alongside the mappings the loader builds the
//! kernel-visible memory map: a sorted, non-overlapping list of ranges
//! that tells the kernel where page-info entries exist.
//!
//! Mapping is liberal - overlap between firmware descriptors is harmless,
//! what matters is that every reported byte is covered. The memory map is
//! the careful half: insertion keeps it sorted and a merge pass coalesces
//! touching neighbours after every change.

use log::{debug, warn};

use mezzano_paging::{AddressSpace, FrameArena, MapAttributes};
use mezzano_protocol::boot_info::{
    MemoryMapEntry, MAX_MEMORY_MAP_ENTRIES, PHYSICAL_MAP_BASE, PHYSICAL_MAP_SIZE,
};
use mezzano_protocol::{PhysAddr, PAGE_SIZE};

use crate::error::BootError;
use crate::platform::FirmwareRange;

/// The kernel memory map under construction.
#[derive(Clone, Debug)]
pub struct MemoryMap {
    entries: [MemoryMapEntry; MAX_MEMORY_MAP_ENTRIES],
    count: usize,
}

const fn in_range(start: u64, end: u64, value: u64) -> bool {
    start <= value && value <= end
}

impl MemoryMap {
    /// An empty map.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            entries: [MemoryMapEntry { start: 0, end: 0 }; MAX_MEMORY_MAP_ENTRIES],
            count: 0,
        }
    }

    /// The valid entries, sorted by address.
    #[must_use]
    pub fn entries(&self) -> &[MemoryMapEntry] {
        &self.entries[..self.count]
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.count
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Whether a frame lies inside any entry.
    #[must_use]
    pub fn contains_page(&self, page: PhysAddr) -> bool {
        let addr = page.as_u64();
        self.entries()
            .iter()
            .any(|entry| entry.start <= addr && addr < entry.end)
    }

    /// Insert `[start, end)`, maintaining sortedness.
    ///
    /// A range overlapping or touching an existing entry expands that
    /// entry in place; otherwise the new range is placed at its sorted
    /// position. A full map drops the range with a warning - the kernel
    /// simply never learns about that RAM.
    pub fn insert(&mut self, start: u64, end: u64) {
        let mut index = 0;
        while index < self.count {
            let entry = self.entries[index];
            if entry.start > end {
                // Insert before this entry.
                break;
            }
            if in_range(entry.start, entry.end, start) || in_range(entry.start, entry.end, end) {
                let merged = &mut self.entries[index];
                if merged.start > start {
                    merged.start = start;
                }
                if merged.end < end {
                    merged.end = end;
                }
                self.crunch();
                return;
            }
            index += 1;
        }

        if self.count == MAX_MEMORY_MAP_ENTRIES {
            warn!("too many memory map entries, ignoring {start:#018x}-{end:#018x}");
            return;
        }

        // Shuffle the suffix up and place the new range.
        self.entries.copy_within(index..self.count, index + 1);
        self.entries[index] = MemoryMapEntry { start, end };
        self.count += 1;

        self.crunch();
    }

    /// Merge touching or overlapping neighbours until a fixpoint.
    ///
    /// Expansion during insert can create mergeable adjacencies, and a
    /// range swallowing existing entries whole lands past them; repeated
    /// min/max merging restores sortedness in both cases.
    fn crunch(&mut self) {
        loop {
            let mut changed = false;
            let mut index = 0;
            while index + 1 < self.count {
                let current = self.entries[index];
                let next = self.entries[index + 1];
                if next.start <= current.end {
                    self.entries[index] = MemoryMapEntry {
                        start: current.start.min(next.start),
                        end: current.end.max(next.end),
                    };
                    self.entries.copy_within(index + 2..self.count, index + 1);
                    self.count -= 1;
                    changed = true;
                } else {
                    index += 1;
                }
            }
            if !changed {
                break;
            }
        }
    }
}

impl Default for MemoryMap {
    fn default() -> Self {
        Self::new()
    }
}

/// Map every firmware range into the physical-map window and build the
/// kernel memory map.
///
/// Ranges are rounded out to page boundaries and clipped to the window;
/// anything beyond 512 GiB is not visible to the kernel and is dropped
/// with a warning.
pub fn build_physical_map<S: AddressSpace, A: FrameArena>(
    space: &mut S,
    arena: &mut A,
    ranges: &[FirmwareRange],
) -> Result<MemoryMap, BootError> {
    let mut map = MemoryMap::new();

    for range in ranges {
        let start = range.start & !(PAGE_SIZE - 1);
        let mut end = (range.end + PAGE_SIZE - 1) & !(PAGE_SIZE - 1);

        if start >= PHYSICAL_MAP_SIZE {
            warn!(
                "memory at {:#018x}-{:#018x} lies beyond the physical map, dropping",
                range.start, range.end
            );
            continue;
        }
        if end > PHYSICAL_MAP_SIZE {
            warn!(
                "memory at {:#018x}-{:#018x} extends beyond the physical map, clipping",
                range.start, range.end
            );
            end = PHYSICAL_MAP_SIZE;
        }
        if end <= start {
            continue;
        }

        debug!(
            "map firmware region {:#018x}-{:#018x} as {:#018x}-{:#018x}",
            range.start, range.end, start, end
        );

        space.map(
            arena,
            PHYSICAL_MAP_BASE + start,
            start,
            end - start,
            MapAttributes { writable: true, cache: range.cache },
        )?;

        map.insert(start, end);
    }

    debug!("final memory map:");
    for entry in map.entries() {
        debug!("  {:#018x}-{:#018x}", entry.start, entry.end);
    }

    Ok(map)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entries(map: &MemoryMap) -> Vec<(u64, u64)> {
        map.entries().iter().map(|e| (e.start, e.end)).collect()
    }

    fn assert_well_formed(map: &MemoryMap) {
        let entries = map.entries();
        for entry in entries {
            assert!(entry.start < entry.end);
        }
        for pair in entries.windows(2) {
            // Strictly sorted with a gap: touching entries must have merged.
            assert!(pair[0].end < pair[1].start);
        }
    }

    #[test]
    fn touching_ranges_merge() {
        let mut map = MemoryMap::new();
        map.insert(10, 20);
        map.insert(20, 30);
        assert_eq!(entries(&map), vec![(10, 30)]);
    }

    #[test]
    fn overlapping_ranges_merge() {
        let mut map = MemoryMap::new();
        map.insert(10, 20);
        map.insert(15, 25);
        assert_eq!(entries(&map), vec![(10, 25)]);
    }

    #[test]
    fn disjoint_ranges_sort() {
        let mut map = MemoryMap::new();
        map.insert(0x300000, 0x400000);
        map.insert(0x100000, 0x180000);
        map.insert(0x500000, 0x600000);
        assert_eq!(
            entries(&map),
            vec![(0x100000, 0x180000), (0x300000, 0x400000), (0x500000, 0x600000)]
        );
        assert_well_formed(&map);
    }

    #[test]
    fn bridging_range_collapses_neighbours() {
        let mut map = MemoryMap::new();
        map.insert(10, 20);
        map.insert(30, 40);
        map.insert(50, 60);
        // Overlaps the first entry and reaches past the second.
        map.insert(15, 45);
        assert_eq!(entries(&map), vec![(10, 45), (50, 60)]);
        assert_well_formed(&map);
    }

    #[test]
    fn swallowing_range_absorbs_existing_entries() {
        let mut map = MemoryMap::new();
        map.insert(20, 30);
        map.insert(40, 45);
        map.insert(10, 50);
        assert_eq!(entries(&map), vec![(10, 50)]);
        assert_well_formed(&map);
    }

    #[test]
    fn contained_range_changes_nothing() {
        let mut map = MemoryMap::new();
        map.insert(10, 40);
        map.insert(20, 30);
        assert_eq!(entries(&map), vec![(10, 40)]);
    }

    #[test]
    fn stays_well_formed_under_generated_inserts() {
        // A deterministic pseudo-random insertion storm.
        let mut state = 0x12345678u64;
        let mut map = MemoryMap::new();
        for _ in 0..500 {
            state = state.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
            let start = (state >> 33) % 4096;
            state = state.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
            let len = 1 + (state >> 33) % 256;
            map.insert(start, start + len);
            assert_well_formed(&map);
        }
    }

    #[test]
    fn overflowing_the_map_drops_the_range() {
        let mut map = MemoryMap::new();
        for i in 0..MAX_MEMORY_MAP_ENTRIES as u64 {
            map.insert(i * 0x10000, i * 0x10000 + 0x1000);
        }
        assert_eq!(map.len(), MAX_MEMORY_MAP_ENTRIES);
        map.insert(0x7000_0000, 0x7000_1000);
        assert_eq!(map.len(), MAX_MEMORY_MAP_ENTRIES);
        assert!(!map.contains_page(PhysAddr::new(0x7000_0000)));
        // Merging into an existing entry still works on a full map.
        map.insert(0x1000, 0x2000);
        assert_eq!(map.len(), MAX_MEMORY_MAP_ENTRIES);
        assert!(map.contains_page(PhysAddr::new(0x1800)));
    }
}
