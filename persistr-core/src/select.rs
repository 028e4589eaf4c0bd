//! Auto-detection of the flashed live medium.
//!
//! A disk flashed with a hybrid live ISO has a recognizable shape: a main
//! partition holding the image (iso9660 or FAT, a few GiB) and a tiny
//! second partition from the hybrid boot layout. The heuristic here trades
//! recall for safety; when more than one disk matches it refuses to guess.

use crate::device::{Disk, Partition};
use crate::{Candidate, Error, Result};
use std::path::PathBuf;

const GIB: u64 = 1024 * 1024 * 1024;
const MIB: u64 = 1024 * 1024;

/// Disks smaller than this cannot hold both the image and useful persistence.
const MIN_DISK_BYTES: u64 = 8 * GIB;
/// Filesystem types the image partition of a hybrid live ISO shows up as.
const ISO_FS_TYPES: [&str; 4] = ["iso9660", "vfat", "fat", "fat32"];
/// Case-insensitive marker looked for in partition labels.
const LABEL_MARKER: &str = "kali";

fn looks_iso_like(partition: &Partition) -> bool {
    if !(4 * GIB..=8 * GIB).contains(&partition.size_bytes) {
        return false;
    }
    let fs_matches = partition
        .fs_type
        .as_deref()
        .is_some_and(|fs| ISO_FS_TYPES.contains(&fs.to_ascii_lowercase().as_str()));
    let label_matches = partition
        .label
        .as_deref()
        .is_some_and(|label| label.to_ascii_lowercase().contains(LABEL_MARKER));
    fs_matches || label_matches
}

/// Hybrid boot images leave a small (1–8 MiB) second partition behind.
fn has_tiny_partition(partition: &Partition) -> bool {
    (MIB..=8 * MIB).contains(&partition.size_bytes)
}

/// Scores `disk` as a flashed-live-medium candidate, `None` when it does
/// not qualify. Removability helps the score but is not required; the flag
/// is unreliable on some USB bridges.
fn score(disk: &Disk) -> Option<u32> {
    if disk.size_bytes < MIN_DISK_BYTES || disk.partitions.len() < 2 {
        return None;
    }
    let iso_like = disk.partitions.iter().any(looks_iso_like);
    let tiny = disk.partitions.iter().any(has_tiny_partition);
    if !(iso_like && tiny) {
        return None;
    }
    Some(2 + u32::from(disk.removable))
}

/// Picks the one disk that looks like the flashed live medium.
///
/// Ambiguity is never resolved by guessing: a tie at the top score fails
/// with [`Error::AmbiguousCandidate`] carrying every tied disk so the
/// operator can pass an explicit device instead.
pub fn select_candidate(disks: &[Disk]) -> Result<PathBuf> {
    let scored: Vec<(u32, &Disk)> = disks
        .iter()
        .filter_map(|disk| score(disk).map(|s| (s, disk)))
        .collect();
    if scored.is_empty() {
        return Err(Error::NoCandidate);
    }

    let top = scored.iter().map(|(s, _)| *s).max().unwrap_or(0);
    let tied: Vec<&Disk> = scored
        .iter()
        .filter(|(s, _)| *s == top)
        .map(|(_, disk)| *disk)
        .collect();
    if tied.len() > 1 {
        return Err(Error::AmbiguousCandidate(
            tied.iter()
                .map(|disk| Candidate {
                    path: disk.path.clone(),
                    size_bytes: disk.size_bytes,
                    removable: disk.removable,
                })
                .collect(),
        ));
    }

    Ok(tied[0].path.clone())
}
