//! On-disk image header
//!
//! The first sector of a Mezzano image carries the header: magic, image
//! UUID, protocol version, the kernel entry points, and the disk block id
//! of the block map root. Offsets are part of the boot protocol.

use core::fmt;
use core::mem::offset_of;

use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use crate::uuid::ImageUuid;

/// The 16-byte magic at the start of every Mezzano image.
pub const IMAGE_MAGIC: [u8; 16] = *b"\x00MezzanineImage\x00";

/// Protocol major version this loader speaks.
pub const PROTOCOL_MAJOR: u16 = 0;

/// Protocol minor version this loader speaks.
pub const PROTOCOL_MINOR: u16 = 26;

/// How many bytes of the image to read when looking for a header.
pub const HEADER_READ_SIZE: usize = 512;

/// Architectures an image can target.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum Architecture {
    X8664 = 1,
    Arm64 = 2,
}

impl Architecture {
    /// Decode the header's architecture byte.
    #[must_use]
    pub const fn from_raw(raw: u8) -> Option<Self> {
        match raw {
            1 => Some(Self::X8664),
            2 => Some(Self::Arm64),
            _ => None,
        }
    }
}

impl fmt::Display for Architecture {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::X8664 => write!(f, "x86-64"),
            Self::Arm64 => write!(f, "arm64"),
        }
    }
}

/// Errors produced while validating an image header.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[must_use = "header validation failures must be handled"]
pub enum HeaderError {
    /// The magic bytes do not identify a Mezzano image.
    BadMagic,
    /// The image speaks a protocol version this loader does not.
    UnsupportedProtocol { major: u16, minor: u16 },
    /// The architecture byte names no known architecture.
    UnknownArchitecture(u8),
    /// Fewer bytes than a header were supplied.
    Truncated,
}

impl fmt::Display for HeaderError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::BadMagic => write!(f, "not a Mezzano image, bad header magic"),
            Self::UnsupportedProtocol { major, minor } => {
                write!(f, "unsupported protocol version {major}.{minor}")
            }
            Self::UnknownArchitecture(raw) => write!(f, "unknown architecture {raw}"),
            Self::Truncated => write!(f, "short read while reading image header"),
        }
    }
}

/// On-disk image header, 112 bytes at offset 0 of the image.
#[derive(Clone, Copy, Debug, PartialEq, Eq, FromBytes, IntoBytes, Immutable, KnownLayout)]
#[repr(C)]
pub struct ImageHeader {
    pub magic: [u8; 16],
    pub uuid: [u8; 16],
    pub protocol_major: u16,
    pub protocol_minor: u16,
    pub _pad1: [u8; 4],
    pub entry_fref: u64,
    pub initial_process: u64,
    pub nil: u64,
    pub architecture: u8,
    pub _pad2: [u8; 7],
    pub initial_stack_pointer: u64,
    pub _pad3: [u8; 16],
    pub bml4: u64,
    pub freelist_head: u64,
}

// The header layout is wire format. These offsets must never move.
const _: () = {
    assert!(offset_of!(ImageHeader, magic) == 0);
    assert!(offset_of!(ImageHeader, uuid) == 16);
    assert!(offset_of!(ImageHeader, protocol_major) == 32);
    assert!(offset_of!(ImageHeader, protocol_minor) == 34);
    assert!(offset_of!(ImageHeader, entry_fref) == 40);
    assert!(offset_of!(ImageHeader, initial_process) == 48);
    assert!(offset_of!(ImageHeader, nil) == 56);
    assert!(offset_of!(ImageHeader, architecture) == 64);
    assert!(offset_of!(ImageHeader, initial_stack_pointer) == 72);
    assert!(offset_of!(ImageHeader, bml4) == 96);
    assert!(offset_of!(ImageHeader, freelist_head) == 104);
    assert!(core::mem::size_of::<ImageHeader>() == 112);
};

impl ImageHeader {
    /// Parse a header from the start of a buffer.
    ///
    /// Only the layout is checked here; call [`ImageHeader::validate`] to
    /// check magic and protocol version.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, HeaderError> {
        match Self::read_from_prefix(bytes) {
            Ok((header, _rest)) => Ok(header),
            Err(_) => Err(HeaderError::Truncated),
        }
    }

    /// Check the magic and the protocol version.
    ///
    /// Major version 0 is the development line: the minor must match this
    /// loader exactly. Released major versions are backwards compatible at
    /// the minor level, so any minor up to ours is accepted.
    pub fn validate(&self) -> Result<(), HeaderError> {
        if self.magic != IMAGE_MAGIC {
            return Err(HeaderError::BadMagic);
        }
        let unsupported = if self.protocol_major == 0 {
            self.protocol_minor != PROTOCOL_MINOR
        } else {
            self.protocol_minor > PROTOCOL_MINOR
        };
        if unsupported {
            return Err(HeaderError::UnsupportedProtocol {
                major: self.protocol_major,
                minor: self.protocol_minor,
            });
        }
        Ok(())
    }

    /// The architecture this image targets.
    pub fn target_architecture(&self) -> Result<Architecture, HeaderError> {
        Architecture::from_raw(self.architecture)
            .ok_or(HeaderError::UnknownArchitecture(self.architecture))
    }

    /// The image UUID.
    #[must_use]
    pub const fn image_uuid(&self) -> ImageUuid {
        ImageUuid(self.uuid)
    }
}
