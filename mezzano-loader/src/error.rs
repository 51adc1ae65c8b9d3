//! Loader errors
//!
//! Failures come in two stages. While the command is still being
//! configured ([`ConfigError`]) nothing irreversible has happened: no
//! paging state exists and the shell just reports the error. Once loading
//! has begun the arena pool is being consumed and partial kernel state
//! exists, so any failure ([`BootError`]) is fatal to the boot.

use core::fmt;

use alloc::string::String;

use mezzano_paging::{ArenaError, MapError};
use mezzano_protocol::header::{Architecture, HeaderError};
use mezzano_protocol::uuid::ImageUuid;

/// Block / file I/O errors reported by the surrounding bootloader.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[must_use = "I/O failures must be handled"]
pub enum IoError {
    /// The device failed the read.
    Device,
    /// The read extends past the end of the device or file.
    OutOfRange,
}

impl fmt::Display for IoError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Device => write!(f, "device error"),
            Self::OutOfRange => write!(f, "read beyond end of device"),
        }
    }
}

/// Recoverable errors while configuring the `mezzano` command.
#[derive(Clone, Debug, PartialEq, Eq)]
#[must_use = "configuration failures must be reported to the shell"]
pub enum ConfigError {
    /// The command line does not name an image.
    MissingImage,
    /// An unrecognised flag token.
    UnknownOption(String),
    /// The `uuid:` prefix was not followed by a well-formed UUID.
    BadUuid(String),
    /// No device of that name, or the device cannot hold an image.
    ImageNotFound(String),
    /// No enumerated device carries an image with this UUID.
    NoMatchingUuid(ImageUuid),
    /// The header failed validation.
    Header(HeaderError),
    /// The image targets a different architecture than this loader.
    WrongArchitecture { image: Architecture, loader: Architecture },
    /// Less RAM than the loader is willing to boot with.
    InsufficientMemory { total: u64 },
    /// I/O error reading the header.
    Io(IoError),
}

impl From<HeaderError> for ConfigError {
    fn from(error: HeaderError) -> Self {
        Self::Header(error)
    }
}

impl From<IoError> for ConfigError {
    fn from(error: IoError) -> Self {
        Self::Io(error)
    }
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MissingImage => write!(f, "no image path or UUID given"),
            Self::UnknownOption(token) => write!(f, "unknown option '{token}'"),
            Self::BadUuid(text) => write!(f, "malformed UUID '{text}'"),
            Self::ImageNotFound(path) => write!(f, "no usable image at '{path}'"),
            Self::NoMatchingUuid(uuid) => {
                write!(f, "no device carries an image with UUID {uuid}")
            }
            Self::Header(error) => write!(f, "{error}"),
            Self::WrongArchitecture { image, loader } => {
                write!(f, "image targets {image} but this loader boots {loader}")
            }
            Self::InsufficientMemory { total } => {
                write!(f, "not enough memory to boot: {} MiB", total / (1024 * 1024))
            }
            Self::Io(error) => write!(f, "{error} while reading image header"),
        }
    }
}

/// Fatal errors once loading is committed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[must_use = "boot failures are fatal and must reach the boot error handler"]
pub enum BootError {
    /// A block read failed mid-load.
    Io { block: u64, error: IoError },
    /// A mapping or kernel-virtual memory operation failed.
    Map(MapError),
    /// The frame arena ran dry.
    Arena(ArenaError),
    /// The platform produced no video mode the boot protocol can describe.
    UnsupportedVideoMode,
}

impl From<MapError> for BootError {
    fn from(error: MapError) -> Self {
        Self::Map(error)
    }
}

impl From<ArenaError> for BootError {
    fn from(error: ArenaError) -> Self {
        Self::Arena(error)
    }
}

impl fmt::Display for BootError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io { block, error } => write!(f, "could not read block {block}: {error}"),
            Self::Map(error) => write!(f, "{error}"),
            Self::Arena(error) => write!(f, "{error}"),
            Self::UnsupportedVideoMode => write!(f, "no supported video mode"),
        }
    }
}

/// Either failure stage of the `mezzano` command.
#[derive(Clone, Debug, PartialEq, Eq)]
#[must_use]
pub enum CommandError {
    /// Configuration failed; the shell reports it and continues.
    Config(ConfigError),
    /// Loading failed after the point of no return; the bootloader halts.
    Fatal(BootError),
}

impl From<ConfigError> for CommandError {
    fn from(error: ConfigError) -> Self {
        Self::Config(error)
    }
}

impl From<BootError> for CommandError {
    fn from(error: BootError) -> Self {
        Self::Fatal(error)
    }
}

impl fmt::Display for CommandError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Config(error) => write!(f, "{error}"),
            Self::Fatal(error) => write!(f, "{error}"),
        }
    }
}
