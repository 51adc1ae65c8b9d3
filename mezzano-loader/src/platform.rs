//! Platform services
//!
//! The loader core never talks to firmware directly. The surrounding
//! bootloader - BIOS, EFI or an embedded platform - implements these
//! traits, and the architecture trampoline consumes the final [`Handoff`].

use alloc::string::String;
use alloc::vec::Vec;

use mezzano_paging::{CacheAttribute, PagingRoots};
use mezzano_protocol::boot_info::FramebufferLayout;
use mezzano_protocol::PhysAddr;

use crate::error::IoError;

/// One firmware-reported memory descriptor, page-rounded by the loader.
///
/// `cache` is the attribute the physical-map mapping should use: normal
/// cacheable for real RAM, uncached for the low MMIO windows embedded
/// platforms report as part of their map.
#[derive(Clone, Copy, Debug)]
pub struct FirmwareRange {
    pub start: u64,
    pub end: u64,
    pub cache: CacheAttribute,
}

/// The video mode the platform selected for the kernel.
#[derive(Clone, Copy, Debug)]
pub struct VideoMode {
    pub framebuffer: PhysAddr,
    pub width: u64,
    pub pitch: u64,
    pub height: u64,
    pub layout: FramebufferLayout,
}

/// Random access reads from an image: a whole block device, or an image
/// file on some filesystem.
pub trait ImageRead {
    fn read_at(&mut self, buf: &mut [u8], offset: u64) -> Result<(), IoError>;
}

/// Device enumeration for path and `uuid:` lookups.
pub trait ImageRegistry {
    type Image: ImageRead;

    /// Open an image by path or device name.
    fn open(&mut self, path: &str) -> Option<Self::Image>;

    /// Names of every enumerable device that could hold an image.
    fn names(&self) -> Vec<String>;
}

/// The firmware-facing half of the bootloader.
pub trait Platform {
    /// RAM as the firmware reports it (E820, the EFI memory map, or a
    /// platform-defined layout on embedded targets).
    fn firmware_ranges(&self) -> Vec<FirmwareRange>;

    /// Physical location and size of the loader's own text+data, for the
    /// transition mapping.
    fn loader_region(&self) -> (PhysAddr, u64);

    /// Physical address of the ACPI RSDP; null if the platform has none.
    fn acpi_rsdp(&self) -> PhysAddr {
        PhysAddr::new(0)
    }

    /// Physical address of the EFI system table; null off EFI.
    fn efi_system_table(&self) -> PhysAddr {
        PhysAddr::new(0)
    }

    /// Physical address of the flattened device tree; null without one.
    fn fdt_address(&self) -> PhysAddr {
        PhysAddr::new(0)
    }

    /// Select and return the video mode for the kernel, if any supported
    /// mode exists.
    fn video_mode(&mut self) -> Option<VideoMode>;

    /// Last firmware call before the jump (ExitBootServices and friends).
    fn finalize(&mut self);
}

/// Everything the architecture trampoline needs.
///
/// The trampoline loads the transition roots, jumps to an instruction
/// pointer aliased into the physical-map window, switches to the kernel
/// roots, moves nil into the architectural nil register, installs the
/// stack pointer and enters the function named by `entry_fref`. It never
/// returns; both paging trees now belong to the kernel.
#[derive(Clone, Copy, Debug)]
pub struct Handoff {
    pub transition: PagingRoots,
    pub kernel: PagingRoots,
    pub entry_fref: u64,
    pub initial_process: u64,
    /// Kernel-virtual address of the boot information page, fixnum-encoded.
    pub boot_info: u64,
    pub nil: u64,
    pub initial_stack_pointer: u64,
}
