//! Loader driver
//!
//! Two stages. [`MezzanoLoader::prepare`] is the recoverable half: it
//! opens and validates the image and can fail back to the shell with no
//! paging state in existence. [`MezzanoLoader::load`] is committed: it
//! consumes the arena pool building the kernel's initial memory state, so
//! every failure past that point is fatal to the boot.

use log::info;

use mezzano_paging::{AddressSpace, FrameArena, FrameKind};
use mezzano_protocol::fixnum::fixnum;
use mezzano_protocol::header::{Architecture, ImageHeader};
use mezzano_protocol::{boot_info::BootInformation, PAGE_SIZE};
use zerocopy::FromZeros;

use crate::block_map::BlockCache;
use crate::boot_info::{set_memory_map, set_platform_tables, set_video_mode, write_boot_info};
use crate::buddy::{dump_buddy_allocators, initialise_bins, release_firmware_memory};
use crate::command::{
    check_total_memory, locate_image, parse_arguments, read_header, LoaderOptions,
};
use crate::error::{BootError, CommandError, ConfigError};
use crate::info::allocate_page_infos;
use crate::physmap::build_physical_map;
use crate::platform::{Handoff, ImageRead, ImageRegistry, Platform};
use crate::transition::build_transition;
use crate::wired::{load_wired_pages, materialise_block_map};

/// A validated image, ready to load.
pub struct MezzanoLoader<I: ImageRead> {
    image: I,
    header: ImageHeader,
    options: LoaderOptions,
}

impl<I: ImageRead> MezzanoLoader<I> {
    /// Stage 1: read and validate the header, check the architecture and
    /// the memory floor. Failure leaves no loader state behind.
    pub fn prepare<P: Platform>(
        mut image: I,
        options: LoaderOptions,
        loader_arch: Architecture,
        platform: &P,
    ) -> Result<Self, ConfigError> {
        let header = read_header(&mut image)?;
        header.validate()?;

        let image_arch = header.target_architecture()?;
        if image_arch != loader_arch {
            return Err(ConfigError::WrongArchitecture { image: image_arch, loader: loader_arch });
        }

        let total: u64 = platform
            .firmware_ranges()
            .iter()
            .map(|range| range.end - range.start)
            .sum();
        check_total_memory(total, &options)?;

        info!(
            "loading image {} with protocol version {}.{}",
            header.image_uuid(),
            header.protocol_major,
            header.protocol_minor
        );
        info!(
            "entry fref at {:#x}, initial process at {:#x}",
            header.entry_fref, header.initial_process
        );

        Ok(Self { image, header, options })
    }

    /// The validated header.
    #[must_use]
    pub fn header(&self) -> &ImageHeader {
        &self.header
    }

    /// Stage 2: build the kernel's complete initial memory state and
    /// return everything the trampoline needs.
    pub fn load<S, A, P>(mut self, arena: &mut A, platform: &mut P) -> Result<Handoff, BootError>
    where
        S: AddressSpace,
        A: FrameArena,
        P: Platform,
    {
        let nil = self.header.nil;
        let mut kernel = S::create(arena, FrameKind::PageTables)?;
        let mut boot_info = BootInformation::new_zeroed();

        // The boot-info frame is retained for the kernel; allocate it up
        // front, above the low megabyte.
        let boot_info_frame = arena.allocate(PAGE_SIZE, PAGE_SIZE, 0x10_0000, FrameKind::Allocated)?;
        arena.fill(boot_info_frame, 0, PAGE_SIZE);

        // Physical map, kernel memory map, page-info backing.
        let map = build_physical_map(&mut kernel, arena, &platform.firmware_ranges())?;
        allocate_page_infos(&mut kernel, arena, &map)?;

        // Pass 1: materialise the block map and size the load.
        let mut cache = BlockCache::new();
        let loaded_map = materialise_block_map(
            arena,
            &mut self.image,
            &mut cache,
            &self.header,
            self.options.freestanding,
        )?;
        boot_info.block_map_address = loaded_map.root.as_u64();

        // Pass 2: load every resident page.
        load_wired_pages(&mut kernel, arena, &mut self.image, &loaded_map, &self.options)?;

        // Remaining boot-info fields.
        boot_info.uuid = self.header.uuid;
        set_platform_tables(&mut boot_info, platform);
        let mode = platform.video_mode().ok_or(BootError::UnsupportedVideoMode)?;
        set_video_mode(&mut boot_info, &mode);
        boot_info.boot_options = fixnum(self.options.boot_options().bits() as i64);
        set_memory_map(&mut boot_info, &map);
        initialise_bins(&mut boot_info, nil);

        // The transition tree must exist before the arena is surrendered.
        let (loader_start, loader_size) = platform.loader_region();
        let transition = build_transition(arena, &mut kernel, loader_start, loader_size)?;

        // Point of no return: the firmware is finalised, the arena pool is
        // surrendered and everything free goes to the kernel's allocator.
        platform.finalize();
        let ranges = arena.finalize();
        release_firmware_memory(&kernel, arena, &mut boot_info, &map, nil, &ranges)?;
        dump_buddy_allocators(&kernel, arena, &boot_info, nil);

        let boot_info_fixnum = write_boot_info(arena, boot_info_frame, &boot_info);

        info!("starting system");
        Ok(Handoff {
            transition: transition.roots(),
            kernel: kernel.roots(),
            entry_fref: self.header.entry_fref,
            initial_process: self.header.initial_process,
            boot_info: boot_info_fixnum,
            nil,
            initial_stack_pointer: self.header.initial_stack_pointer,
        })
    }
}

/// The whole `mezzano` command: parse, locate, validate, load.
///
/// A [`CommandError::Config`] is reported by the shell and the bootloader
/// keeps running; a [`CommandError::Fatal`] reaches the boot error handler
/// and halts. On success the returned hand-off goes straight to the
/// architecture trampoline.
pub fn mezzano_command<S, A, R, P>(
    args: &[&str],
    registry: &mut R,
    arena: &mut A,
    platform: &mut P,
) -> Result<Handoff, CommandError>
where
    S: AddressSpace,
    A: FrameArena,
    R: ImageRegistry,
    P: Platform,
{
    let (spec, options) = parse_arguments(args)?;
    let image = locate_image(registry, &spec)?;
    let loader = MezzanoLoader::prepare(image, options, S::ARCH, platform)?;
    Ok(loader.load::<S, A, P>(arena, platform)?)
}
