//! Boot information composition
//!
//! The loader builds the [`BootInformation`] value field by field as the
//! stages complete, then serialises it into a retained frame just before
//! hand-off. The kernel receives the page as a fixnum-encoded pointer
//! inside the physical-map window.

use log::debug;

use zerocopy::IntoBytes;

use mezzano_paging::FrameArena;
use mezzano_protocol::boot_info::{BootInformation, PHYSICAL_MAP_BASE};
use mezzano_protocol::fixnum::fixnum;
use mezzano_protocol::PhysAddr;

use crate::physmap::MemoryMap;
use crate::platform::{Platform, VideoMode};

/// Fill the video descriptor. All five fields are fixnums.
pub fn set_video_mode(boot_info: &mut BootInformation, mode: &VideoMode) {
    debug!(
        "using {}x{} video mode, layout {:?}, pitch {}, fb at {}",
        mode.width, mode.height, mode.layout, mode.pitch, mode.framebuffer
    );
    boot_info.video.framebuffer_physical_address = fixnum(mode.framebuffer.as_u64() as i64);
    boot_info.video.framebuffer_width = fixnum(mode.width as i64);
    boot_info.video.framebuffer_pitch = fixnum(mode.pitch as i64);
    boot_info.video.framebuffer_height = fixnum(mode.height as i64);
    boot_info.video.framebuffer_layout = fixnum(mode.layout as i64);
}

/// Copy the firmware pointers out of the platform. Absent tables stay
/// zero, which is how the kernel recognises their absence.
pub fn set_platform_tables<P: Platform>(boot_info: &mut BootInformation, platform: &P) {
    boot_info.acpi_rsdp = platform.acpi_rsdp().as_u64();
    boot_info.efi_system_table = platform.efi_system_table().as_u64();
    boot_info.fdt_address = platform.fdt_address().as_u64();
}

/// Copy the finished memory map into the page. The entries are raw
/// physical addresses; only the count is a fixnum.
pub fn set_memory_map(boot_info: &mut BootInformation, map: &MemoryMap) {
    for (slot, entry) in boot_info.memory_map.iter_mut().zip(map.entries()) {
        *slot = *entry;
    }
    boot_info.n_memory_map_entries = fixnum(map.len() as i64);
}

/// Serialise the page into its retained frame and return the value the
/// trampoline passes to the kernel: the page's physical-map address as a
/// fixnum.
pub fn write_boot_info<A: FrameArena>(
    arena: &mut A,
    frame: PhysAddr,
    boot_info: &BootInformation,
) -> u64 {
    arena.write(frame, boot_info.as_bytes());
    fixnum((PHYSICAL_MAP_BASE + frame.as_u64()) as i64)
}
