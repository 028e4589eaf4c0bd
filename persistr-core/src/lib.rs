//! The core, UI-agnostic library for the `persistr` live-media persistence
//! utility.
//!
//! `persistr-core` is designed to be used as a library by any front-end,
//! whether it's a command-line interface (like `persistr`) or a graphical
//! user interface. It handles disk-topology discovery, auto-detection of the
//! flashed live medium, free-space computation, and the idempotent
//! provisioning sequence that creates and activates a persistence partition.
//!
//! The library is structured into several key modules:
//! - [`device`]: The `Disk`/`Partition`/`FreeRegion` snapshot types and the
//!   partition device-path naming convention.
//! - [`system`]: The collaborator traits the provisioning flow runs against
//!   (inventory, partition table, formatter, mounts, root-device lookup).
//! - [`platform`]: Real Linux implementations of those traits, backed by
//!   the standard `lsblk`/`parted`/`mkfs.ext4`/`mount` tooling.
//! - [`select`]: The heuristic that picks the flashed medium when the
//!   caller does not name one.
//! - [`orchestrate`]: The end-to-end provisioning state machine.
//!
//! The primary entry point is [`orchestrate::provision`]. It reports each
//! stage it passes through via a callback, allowing the calling application
//! to display progress in any way it chooses.
//!
//! ## Example: provisioning with progress reporting
//!
//! ```rust,no_run
//! use persistr_core::orchestrate::{provision, Options};
//! use persistr_core::platform::LiveSystem;
//!
//! fn main() -> persistr_core::Result<()> {
//!     let live = LiveSystem::new();
//!
//!     // A simple closure to handle stage updates. A real app might use
//!     // this to drive a status display.
//!     let report = provision(&live.system(), &Options::default(), |event| {
//!         println!("{event:?}");
//!     })?;
//!
//!     println!("activation file written to {}", report.conf.target.display());
//!     Ok(())
//! }
//! ```

pub mod conf;
pub mod device;
pub mod orchestrate;
pub mod platform;
pub mod provision;
pub mod regions;
pub mod safety;
pub mod select;
pub mod system;

use std::path::PathBuf;
use thiserror::Error;

/// Filesystem label the boot-time overlay mechanism looks for.
pub const PERSISTENCE_LABEL: &str = "persistence";
/// Filesystem type of the persistence volume.
pub const PERSISTENCE_FS: &str = "ext4";
/// Name of the activation file at the root of the persistence volume.
pub const ACTIVATION_FILE: &str = "persistence.conf";
/// Exact activation content. The trailing newline is part of the contract
/// with the boot overlay; preserve it byte for byte.
pub const ACTIVATION_LINE: &str = "/ union\n";
/// Default directory used for the transient config-write mount.
pub const DEFAULT_MOUNT_DIR: &str = "/mnt/persistr";
/// Minimum span, in MiB, for a free region to be worth partitioning.
pub const MIN_REGION_MIB: f64 = 32.0;
/// Margin, in MiB, added to a region's start before creating a partition.
pub const ALIGN_MARGIN_MIB: f64 = 1.0;

/// Summary of one auto-selection candidate, carried by
/// [`Error::AmbiguousCandidate`] so the operator can disambiguate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate {
    pub path: PathBuf,
    pub size_bytes: u64,
    pub removable: bool,
}

/// Everything that can go wrong while provisioning.
///
/// Apart from the best-effort unmount sweep, no stage retries: each of
/// these aborts the run where it stands and is surfaced to the operator.
#[derive(Debug, Error)]
pub enum Error {
    #[error("could not query block devices: {0}")]
    InventoryUnavailable(String),

    #[error("no flashed live medium found; run `lsblk` and pass --device /dev/sdX")]
    NoCandidate,

    #[error("multiple disks look like flashed live media; pass --device to pick one: {}", describe_candidates(.0))]
    AmbiguousCandidate(Vec<Candidate>),

    #[error("refusing to touch {disk}: it appears to back the running root filesystem ({root_dev})")]
    SafetyAbort { disk: PathBuf, root_dev: PathBuf },

    #[error("no usable unallocated space on {0}; shrink a partition first")]
    InsufficientSpace(PathBuf),

    #[error("expected {0} to appear but it never did; unplug and replug the medium, then rerun")]
    PartitionNotReady(PathBuf),

    #[error("formatting {path} failed: {message}")]
    Format { path: PathBuf, message: String },

    #[error("mount operation failed: {0}")]
    Mount(String),

    #[error("`{command}` failed: {stderr}")]
    ExternalTool { command: String, stderr: String },

    #[error("could not parse {what} output: {message}")]
    Parse { what: &'static str, message: String },
}

pub type Result<T> = std::result::Result<T, Error>;

fn describe_candidates(candidates: &[Candidate]) -> String {
    candidates
        .iter()
        .map(|c| {
            format!(
                "{} ({}, removable={})",
                c.path.display(),
                human_size(c.size_bytes),
                c.removable
            )
        })
        .collect::<Vec<_>>()
        .join(", ")
}

/// Formats a byte count the way operators expect from disk tools.
pub fn human_size(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KiB", "MiB", "GiB", "TiB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{bytes}B")
    } else {
        format!("{value:.1}{}", UNITS[unit])
    }
}
