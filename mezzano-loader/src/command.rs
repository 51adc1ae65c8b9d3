//! The `mezzano` command line
//!
//! ```text
//! mezzano <path-or-uuid:UUID> [read-only] [freestanding] [video-console]
//!         [no-detect] [no-smp] [i-promise-i-have-enough-memory] [verbose]
//! ```
//!
//! The image argument is either a device/file path or `uuid:<uuid>`,
//! which scans every enumerated device for an image whose header carries
//! that UUID.

use alloc::string::{String, ToString};

use log::debug;

use mezzano_protocol::boot_info::BootOptions;
use mezzano_protocol::header::{ImageHeader, HEADER_READ_SIZE};
use mezzano_protocol::uuid::ImageUuid;

use crate::error::ConfigError;
use crate::platform::{ImageRead, ImageRegistry};

/// Parsed command flags.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct LoaderOptions {
    pub force_read_only: bool,
    pub freestanding: bool,
    pub video_console: bool,
    pub no_detect: bool,
    pub no_smp: bool,
    /// Skip the total-memory sanity check.
    pub assume_enough_memory: bool,
    pub verbose: bool,
}

impl LoaderOptions {
    /// The option bits passed through to the kernel.
    #[must_use]
    pub fn boot_options(&self) -> BootOptions {
        let mut options = BootOptions::empty();
        options.set(BootOptions::FORCE_READ_ONLY, self.force_read_only);
        options.set(BootOptions::FREESTANDING, self.freestanding);
        options.set(BootOptions::VIDEO_CONSOLE, self.video_console);
        options.set(BootOptions::NO_DETECT, self.no_detect);
        options.set(BootOptions::NO_SMP, self.no_smp);
        options
    }
}

/// Where to find the image.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ImageSpec {
    Path(String),
    Uuid(ImageUuid),
}

/// Parse the command arguments into an image spec and options.
pub fn parse_arguments(args: &[&str]) -> Result<(ImageSpec, LoaderOptions), ConfigError> {
    let mut iter = args.iter();
    let target = *iter.next().ok_or(ConfigError::MissingImage)?;

    let spec = if let Some(text) = target.strip_prefix("uuid:") {
        let uuid = text
            .parse::<ImageUuid>()
            .map_err(|_| ConfigError::BadUuid(text.to_string()))?;
        ImageSpec::Uuid(uuid)
    } else {
        ImageSpec::Path(target.to_string())
    };

    let mut options = LoaderOptions::default();
    for &token in iter {
        match token {
            "read-only" => options.force_read_only = true,
            "freestanding" => options.freestanding = true,
            "video-console" => options.video_console = true,
            "no-detect" => options.no_detect = true,
            "no-smp" => options.no_smp = true,
            "i-promise-i-have-enough-memory" => options.assume_enough_memory = true,
            "verbose" => options.verbose = true,
            _ => return Err(ConfigError::UnknownOption(token.to_string())),
        }
    }

    Ok((spec, options))
}

/// Read and layout-parse a header from the start of an image.
pub fn read_header<I: ImageRead>(image: &mut I) -> Result<ImageHeader, ConfigError> {
    let mut sector = [0u8; HEADER_READ_SIZE];
    image.read_at(&mut sector, 0).map_err(ConfigError::Io)?;
    Ok(ImageHeader::from_bytes(&sector)?)
}

/// Resolve an image spec against the registry.
///
/// A `uuid:` spec opens every enumerated device in turn, discarding those
/// whose first sector does not parse as a Mezzano header or whose UUID
/// differs.
pub fn locate_image<R: ImageRegistry>(
    registry: &mut R,
    spec: &ImageSpec,
) -> Result<R::Image, ConfigError> {
    match spec {
        ImageSpec::Path(path) => registry
            .open(path)
            .ok_or_else(|| ConfigError::ImageNotFound(path.clone())),
        ImageSpec::Uuid(uuid) => {
            for name in registry.names() {
                let Some(mut image) = registry.open(&name) else {
                    continue;
                };
                let Ok(header) = read_header(&mut image) else {
                    debug!("skipping {name}: unreadable header");
                    continue;
                };
                if header.magic == mezzano_protocol::header::IMAGE_MAGIC
                    && header.image_uuid() == *uuid
                {
                    debug!("found image {uuid} on {name}");
                    return Ok(image);
                }
            }
            Err(ConfigError::NoMatchingUuid(*uuid))
        }
    }
}

/// Check that the firmware reports enough memory to boot, unless the user
/// promised otherwise. Low-memory systems fail here before any state is
/// built.
pub fn check_total_memory(total: u64, options: &LoaderOptions) -> Result<(), ConfigError> {
    if options.assume_enough_memory || total >= crate::MINIMUM_MEMORY {
        Ok(())
    } else {
        Err(ConfigError::InsufficientMemory { total })
    }
}
