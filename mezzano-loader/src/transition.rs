//! Transition paging tree
//!
//! The kernel's final tables do not identity-map the loader, so the
//! instruction after the first context switch would fault. The trampoline
//! instead loads an auxiliary tree that maps the loader both at its
//! identity address and inside the physical-map window, jumps to the
//! aliased instruction pointer, and only then switches to the kernel
//! tree - which also carries the physical-map alias of the loader so the
//! second switch lands on a mapped instruction.

use log::debug;

use mezzano_paging::{AddressSpace, FrameArena, FrameKind, MapAttributes};
use mezzano_protocol::boot_info::PHYSICAL_MAP_BASE;
use mezzano_protocol::{PhysAddr, PAGE_SIZE};

use crate::error::BootError;

/// Build the transition tree and add the loader's physical-map alias to
/// the kernel tree.
pub fn build_transition<S: AddressSpace, A: FrameArena>(
    arena: &mut A,
    kernel: &mut S,
    loader_start: PhysAddr,
    loader_size: u64,
) -> Result<S, BootError> {
    let start = loader_start.page_align_down().as_u64();
    let end = (loader_start.as_u64() + loader_size + PAGE_SIZE - 1) & !(PAGE_SIZE - 1);
    let size = end - start;

    debug!("transition maps for loader at {start:#018x}+{size:#x}");

    let mut transition = S::create(arena, FrameKind::Internal)?;
    transition.map(arena, start, start, size, MapAttributes::normal())?;
    transition.map(arena, PHYSICAL_MAP_BASE + start, start, size, MapAttributes::normal())?;
    kernel.map(arena, PHYSICAL_MAP_BASE + start, start, size, MapAttributes::normal())?;

    Ok(transition)
}
