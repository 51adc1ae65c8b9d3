//! Shared mocks for the loader integration tests: a sparse RAM-backed
//! frame arena, a synthetic block device, an in-memory image builder and
//! a fake firmware platform.

// Not every test binary uses every mock.
#![allow(dead_code)]

use std::collections::BTreeMap;

use mezzano_loader::error::IoError;
use mezzano_loader::info::{page_bin, page_info_next, page_info_prev, page_type};
use mezzano_loader::platform::{FirmwareRange, Handoff, ImageRead, ImageRegistry, Platform, VideoMode};
use mezzano_paging::{
    AddressSpace, ArenaError, CacheAttribute, FrameArena, FrameKind, MemoryRange, RangeKind,
};
use mezzano_protocol::block_map::{level_index, BlockEntry, BlockFlags};
use mezzano_protocol::boot_info::{
    BootInformation, BuddyBin, FramebufferLayout, PHYSICAL_MAP_BASE,
};
use mezzano_protocol::fixnum::unfixnum;
use mezzano_protocol::page_info::PageType;
use mezzano_protocol::header::{
    Architecture, ImageHeader, IMAGE_MAGIC, PROTOCOL_MAJOR, PROTOCOL_MINOR,
};
use mezzano_protocol::{PhysAddr, PAGE_SIZE};
use zerocopy::{FromBytes, FromZeros, IntoBytes};

/// A nil value with the low bit set, so it can never collide with a
/// fixnum-encoded page number.
pub const NIL: u64 = 0x2000_0000_0000_000F;

// -- Frame arena over synthetic RAM

/// Sparse page-backed RAM with an allocate-high linear pool, mirroring
/// the bootloader's physical allocator.
pub struct MockMemory {
    ram: Vec<(u64, u64)>,
    pages: BTreeMap<u64, Vec<u8>>,
    allocations: Vec<MemoryRange>,
    pub finalized: bool,
    /// The layout handed out by `finalize`, kept for assertions.
    pub last_finalize: Option<Vec<MemoryRange>>,
}

impl MockMemory {
    pub fn new(ram: &[(u64, u64)]) -> Self {
        Self {
            ram: ram.to_vec(),
            pages: BTreeMap::new(),
            allocations: Vec::new(),
            finalized: false,
            last_finalize: None,
        }
    }

    pub fn allocation_count(&self) -> usize {
        self.allocations.len()
    }

    fn assert_in_ram(&self, start: u64, len: u64) {
        let end = start + len;
        assert!(
            self.ram.iter().any(|&(s, e)| s <= start && end <= e),
            "access outside RAM: {start:#x}+{len:#x}"
        );
    }

    /// Free spans of one RAM range after subtracting allocations.
    fn free_spans(&self, ram_start: u64, ram_end: u64) -> Vec<(u64, u64)> {
        let mut overlapping: Vec<_> = self
            .allocations
            .iter()
            .filter(|a| a.start < ram_end && a.end() > ram_start)
            .collect();
        overlapping.sort_by_key(|a| a.start);

        let mut spans = Vec::new();
        let mut cursor = ram_start;
        for alloc in overlapping {
            if alloc.start > cursor {
                spans.push((cursor, alloc.start));
            }
            cursor = cursor.max(alloc.end());
        }
        if cursor < ram_end {
            spans.push((cursor, ram_end));
        }
        spans
    }

    fn page_mut(&mut self, page: u64) -> &mut Vec<u8> {
        self.pages
            .entry(page)
            .or_insert_with(|| vec![0u8; PAGE_SIZE as usize])
    }
}

impl FrameArena for MockMemory {
    fn allocate(
        &mut self,
        size: u64,
        align: u64,
        min_addr: u64,
        kind: FrameKind,
    ) -> Result<PhysAddr, ArenaError> {
        assert!(!self.finalized, "allocation after finalize");
        assert!(size % PAGE_SIZE == 0 && align % PAGE_SIZE == 0);

        // Allocate as high as possible, like the firmware pool does.
        let mut best: Option<u64> = None;
        for &(ram_start, ram_end) in &self.ram {
            for (span_start, span_end) in self.free_spans(ram_start, ram_end) {
                if span_end - span_start < size {
                    continue;
                }
                let base = (span_end - size) & !(align - 1);
                if base >= span_start && base >= min_addr {
                    best = Some(best.map_or(base, |b: u64| b.max(base)));
                }
            }
        }

        let base = best.ok_or(ArenaError::Exhausted { size })?;
        let range_kind = match kind {
            FrameKind::Allocated => RangeKind::Allocated,
            FrameKind::PageTables => RangeKind::PageTables,
            FrameKind::Internal => RangeKind::Internal,
        };
        self.allocations.push(MemoryRange { start: base, size, kind: range_kind });
        Ok(PhysAddr::new(base))
    }

    fn read(&self, phys: PhysAddr, buf: &mut [u8]) {
        let mut addr = phys.as_u64();
        for byte in buf.iter_mut() {
            let offset = (addr % PAGE_SIZE) as usize;
            *byte = self
                .pages
                .get(&(addr / PAGE_SIZE))
                .map_or(0, |page| page[offset]);
            addr += 1;
        }
    }

    fn write(&mut self, phys: PhysAddr, data: &[u8]) {
        self.assert_in_ram(phys.as_u64(), data.len() as u64);
        let mut addr = phys.as_u64();
        for &byte in data {
            let offset = (addr % PAGE_SIZE) as usize;
            self.page_mut(addr / PAGE_SIZE)[offset] = byte;
            addr += 1;
        }
    }

    fn fill(&mut self, phys: PhysAddr, value: u8, size: u64) {
        self.assert_in_ram(phys.as_u64(), size);
        let mut addr = phys.as_u64();
        let mut remaining = size;
        while remaining != 0 {
            let offset = (addr % PAGE_SIZE) as usize;
            let step = ((PAGE_SIZE as usize) - offset).min(remaining as usize);
            if value != 0 || self.pages.contains_key(&(addr / PAGE_SIZE)) {
                self.page_mut(addr / PAGE_SIZE)[offset..offset + step].fill(value);
            }
            addr += step as u64;
            remaining -= step as u64;
        }
    }

    fn finalize(&mut self) -> Vec<MemoryRange> {
        assert!(!self.finalized, "finalize called twice");
        self.finalized = true;

        let mut result = Vec::new();
        for &(ram_start, ram_end) in &self.ram {
            let mut overlapping: Vec<_> = self
                .allocations
                .iter()
                .filter(|a| a.start < ram_end && a.end() > ram_start)
                .cloned()
                .collect();
            overlapping.sort_by_key(|a| a.start);

            let mut cursor = ram_start;
            for alloc in overlapping {
                if alloc.start > cursor {
                    result.push(MemoryRange {
                        start: cursor,
                        size: alloc.start - cursor,
                        kind: RangeKind::Free,
                    });
                }
                // Loader scratch goes back to the free pool at hand-off.
                let kind = match alloc.kind {
                    RangeKind::Internal => RangeKind::Free,
                    other => other,
                };
                result.push(MemoryRange { start: alloc.start, size: alloc.size, kind });
                cursor = alloc.end();
            }
            if cursor < ram_end {
                result.push(MemoryRange {
                    start: cursor,
                    size: ram_end - cursor,
                    kind: RangeKind::Free,
                });
            }
        }

        self.last_finalize = Some(result.clone());
        result
    }
}

// -- Block device and registry

#[derive(Clone)]
pub struct MockDisk {
    pub data: Vec<u8>,
}

impl ImageRead for MockDisk {
    fn read_at(&mut self, buf: &mut [u8], offset: u64) -> Result<(), IoError> {
        let start = offset as usize;
        let end = start + buf.len();
        if end > self.data.len() {
            return Err(IoError::OutOfRange);
        }
        buf.copy_from_slice(&self.data[start..end]);
        Ok(())
    }
}

pub struct MockRegistry {
    pub devices: Vec<(String, Vec<u8>)>,
}

impl ImageRegistry for MockRegistry {
    type Image = MockDisk;

    fn open(&mut self, path: &str) -> Option<MockDisk> {
        self.devices
            .iter()
            .find(|(name, _)| name == path)
            .map(|(_, data)| MockDisk { data: data.clone() })
    }

    fn names(&self) -> Vec<String> {
        self.devices.iter().map(|(name, _)| name.clone()).collect()
    }
}

// -- Firmware platform

pub struct MockFirmware {
    pub ranges: Vec<FirmwareRange>,
    pub video: Option<VideoMode>,
    pub rsdp: u64,
    pub efi: u64,
    pub fdt: u64,
    pub loader: (u64, u64),
    pub finalized: bool,
}

impl MockFirmware {
    pub fn new(ram: &[(u64, u64)]) -> Self {
        Self {
            ranges: ram
                .iter()
                .map(|&(start, end)| FirmwareRange {
                    start,
                    end,
                    cache: CacheAttribute::Normal,
                })
                .collect(),
            video: Some(VideoMode {
                framebuffer: PhysAddr::new(0xC000_0000),
                width: 1024,
                pitch: 4096,
                height: 768,
                layout: FramebufferLayout::X8R8G8B8,
            }),
            rsdp: 0xE_0000,
            efi: 0,
            fdt: 0,
            loader: (0x20_0000, 0x1_0000),
            finalized: false,
        }
    }
}

impl Platform for MockFirmware {
    fn firmware_ranges(&self) -> Vec<FirmwareRange> {
        self.ranges.clone()
    }

    fn loader_region(&self) -> (PhysAddr, u64) {
        (PhysAddr::new(self.loader.0), self.loader.1)
    }

    fn acpi_rsdp(&self) -> PhysAddr {
        PhysAddr::new(self.rsdp)
    }

    fn efi_system_table(&self) -> PhysAddr {
        PhysAddr::new(self.efi)
    }

    fn fdt_address(&self) -> PhysAddr {
        PhysAddr::new(self.fdt)
    }

    fn video_mode(&mut self) -> Option<VideoMode> {
        self.video
    }

    fn finalize(&mut self) {
        self.finalized = true;
    }
}

// -- Image builder

/// Builds a well-formed image: header in block 0, block map root in
/// block 1, tables and data blocks allocated upwards from there.
pub struct ImageBuilder {
    uuid: [u8; 16],
    architecture: Architecture,
    protocol: (u16, u16),
    entry_fref: u64,
    initial_process: u64,
    initial_stack_pointer: u64,
    pages: Vec<(u64, BlockFlags, u8)>,
}

pub struct BuiltImage {
    pub bytes: Vec<u8>,
    /// Data block id per virtual page (zero-fill pages map to 0).
    pub data_blocks: BTreeMap<u64, u64>,
}

impl ImageBuilder {
    pub fn new() -> Self {
        Self {
            uuid: *b"0123456789abcdef",
            architecture: Architecture::X8664,
            protocol: (PROTOCOL_MAJOR, PROTOCOL_MINOR),
            entry_fref: 0xFFFF_8100_0000_2000,
            initial_process: 0xFFFF_8100_0000_4000,
            initial_stack_pointer: 0xFFFF_8100_0010_0000,
            pages: Vec::new(),
        }
    }

    pub fn uuid(mut self, uuid: [u8; 16]) -> Self {
        self.uuid = uuid;
        self
    }

    pub fn architecture(mut self, architecture: Architecture) -> Self {
        self.architecture = architecture;
        self
    }

    pub fn protocol(mut self, major: u16, minor: u16) -> Self {
        self.protocol = (major, minor);
        self
    }

    /// Add a page at `virt` whose data block is filled with `fill`.
    /// PRESENT is implied.
    pub fn page(mut self, virt: u64, flags: BlockFlags, fill: u8) -> Self {
        self.pages.push((virt, flags, fill));
        self
    }

    pub fn build(self) -> BuiltImage {
        const ROOT: u64 = 1;
        let mut tables: BTreeMap<u64, Vec<u64>> = BTreeMap::new();
        tables.insert(ROOT, vec![0u64; 512]);
        let mut data: BTreeMap<u64, u8> = BTreeMap::new();
        let mut data_blocks = BTreeMap::new();
        let mut next_block = ROOT + 1;

        for &(virt, flags, fill) in &self.pages {
            let mut table = ROOT;
            for level in [4u32, 3, 2] {
                let index = level_index(virt, level);
                let entry = BlockEntry(tables[&table][index]);
                table = if entry.is_present() {
                    entry.block_id()
                } else {
                    let child = next_block;
                    next_block += 1;
                    tables.insert(child, vec![0u64; 512]);
                    tables.get_mut(&table).unwrap()[index] =
                        BlockEntry::from_parts(child, BlockFlags::PRESENT).raw();
                    child
                };
            }

            let block_id = if flags.contains(BlockFlags::ZERO_FILL) {
                0
            } else {
                let id = next_block;
                next_block += 1;
                data.insert(id, fill);
                id
            };
            data_blocks.insert(virt, block_id);
            tables.get_mut(&table).unwrap()[level_index(virt, 1)] =
                BlockEntry::from_parts(block_id, flags | BlockFlags::PRESENT).raw();
        }

        let mut header = ImageHeader::new_zeroed();
        header.magic = IMAGE_MAGIC;
        header.uuid = self.uuid;
        header.protocol_major = self.protocol.0;
        header.protocol_minor = self.protocol.1;
        header.entry_fref = self.entry_fref;
        header.initial_process = self.initial_process;
        header.nil = NIL;
        header.architecture = self.architecture as u8;
        header.initial_stack_pointer = self.initial_stack_pointer;
        header.bml4 = ROOT;

        let mut bytes = vec![0u8; (next_block as usize) * PAGE_SIZE as usize];
        bytes[..header.as_bytes().len()].copy_from_slice(header.as_bytes());
        for (id, entries) in &tables {
            let offset = (*id as usize) * PAGE_SIZE as usize;
            for (i, entry) in entries.iter().enumerate() {
                bytes[offset + i * 8..offset + i * 8 + 8].copy_from_slice(&entry.to_le_bytes());
            }
        }
        for (id, fill) in &data {
            let offset = (*id as usize) * PAGE_SIZE as usize;
            bytes[offset..offset + PAGE_SIZE as usize].fill(*fill);
        }

        BuiltImage { bytes, data_blocks }
    }
}

// -- Assertions over finished kernel state

/// Locate and deserialise the boot information page from a hand-off.
pub fn read_boot_information<A: FrameArena>(
    arena: &A,
    handoff: &Handoff,
) -> (u64, BootInformation) {
    let virt = unfixnum(handoff.boot_info) as u64;
    let phys = virt - PHYSICAL_MAP_BASE;
    let mut bytes = vec![0u8; std::mem::size_of::<BootInformation>()];
    arena.read(PhysAddr::new(phys), &mut bytes);
    let info = BootInformation::read_from_bytes(bytes.as_slice()).unwrap();
    (phys, info)
}

/// Walk one buddy array, checking the free-list invariants, and return
/// the bytes it accounts for.
fn walk_bins<S: AddressSpace, A: FrameArena>(
    space: &S,
    arena: &A,
    bins: &[BuddyBin],
    nil: u64,
    check_page: impl Fn(u64, usize),
) -> u64 {
    let mut total = 0u64;
    for (k, bin) in bins.iter().enumerate() {
        let mut listed = 0i64;
        let mut current = bin.first_page;
        let mut prev_expected = nil;
        while current != nil {
            assert_eq!(current & 1, 0, "free list link is not a fixnum");
            let page = (unfixnum(current) as u64) * PAGE_SIZE;
            let addr = PhysAddr::new(page);
            assert_eq!(page_type(space, arena, addr).unwrap(), PageType::Free);
            assert_eq!(page_bin(space, arena, addr).unwrap() as usize, k);
            assert_eq!(page_info_prev(space, arena, addr).unwrap(), prev_expected);
            check_page(page, k);
            listed += 1;
            prev_expected = current;
            current = page_info_next(space, arena, addr).unwrap();
        }
        assert_eq!(unfixnum(bin.count), listed, "bin {k} count disagrees with its list");
        total += (listed as u64) << (k as u32 + 12);
    }
    total
}

/// Check both buddy allocators and return the total bytes they hold.
pub fn check_buddy_invariants<S: AddressSpace, A: FrameArena>(
    space: &S,
    arena: &A,
    boot_info: &BootInformation,
    nil: u64,
) -> u64 {
    let low = walk_bins(space, arena, &boot_info.buddy_bin_32, nil, |page, _| {
        assert!(page < 0x1_0000_0000, "32-bit bin holds a high page");
    });
    let high = walk_bins(space, arena, &boot_info.buddy_bin_64, nil, |page, _| {
        assert!(page >= 0x1_0000_0000, "64-bit bin holds a low page");
    });
    low + high
}

/// Bytes the finalised layout says should have been released to the
/// buddy allocators: free pages above the floor that the memory map
/// covers.
pub fn expected_free_bytes(
    ranges: &[MemoryRange],
    map_covers: impl Fn(u64) -> bool,
) -> u64 {
    let mut total = 0u64;
    for range in ranges.iter().filter(|r| r.kind == RangeKind::Free) {
        let mut addr = range.start;
        while addr < range.end() {
            if addr > 1024 * 1024 && map_covers(addr) {
                total += PAGE_SIZE;
            }
            addr += PAGE_SIZE;
        }
    }
    total
}
