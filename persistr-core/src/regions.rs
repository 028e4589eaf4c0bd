//! Free-region selection over a disk's partition table.

use crate::device::FreeRegion;

/// Picks, among the usable free extents, the one ending nearest the end of
/// the disk.
///
/// New partitions are always appended after the existing ones, so the
/// trailing region is the right home for one: carving up a gap between
/// earlier partitions would fragment the table for no benefit. Returns
/// `None` when no region meets the usability threshold.
pub fn largest_trailing_region(regions: &[FreeRegion]) -> Option<FreeRegion> {
    regions
        .iter()
        .copied()
        .filter(|region| region.is_usable())
        .max_by(|a, b| a.end_mib.total_cmp(&b.end_mib))
}
