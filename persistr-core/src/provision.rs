//! Partition creation and idempotent formatting.

use crate::device::{FreeRegion, Partition};
use crate::regions::largest_trailing_region;
use crate::system::{DeviceSettler, Formatter, InventoryProvider, TableEditor};
use crate::{ALIGN_MARGIN_MIB, Error, MIN_REGION_MIB, Result};
use std::path::Path;

/// Creates a new partition filling the largest trailing free region on
/// `disk`, returning the MiB range actually allocated.
///
/// Not idempotent: once the trailing space is consumed a second call fails
/// with [`Error::InsufficientSpace`]. Callers gate on partition count
/// before invoking this.
pub fn create_trailing_partition(
    disk: &Path,
    table: &dyn TableEditor,
    settler: &dyn DeviceSettler,
) -> Result<FreeRegion> {
    let regions = table.free_regions(disk)?;
    let region = largest_trailing_region(&regions)
        .ok_or_else(|| Error::InsufficientSpace(disk.to_path_buf()))?;

    // Nudge the start forward so the new partition never butts up against
    // the previous one.
    let start_mib = region.start_mib + ALIGN_MARGIN_MIB;
    if region.end_mib - start_mib < MIN_REGION_MIB {
        return Err(Error::InsufficientSpace(disk.to_path_buf()));
    }

    table.create_partition(disk, start_mib, region.end_mib)?;
    // The new node may not appear until the kernel re-reads the table.
    settler.settle();

    Ok(FreeRegion {
        start_mib,
        end_mib: region.end_mib,
    })
}

/// Finds `path`'s partition record in a fresh inventory snapshot.
fn probe_partition(inventory: &dyn InventoryProvider, path: &Path) -> Result<Option<Partition>> {
    Ok(inventory
        .inventory()?
        .into_iter()
        .flat_map(|disk| disk.partitions)
        .find(|partition| partition.path == path))
}

/// Formats `partition` as the persistence volume unless it already is one.
///
/// The skip is what makes repeat runs safe: a partition already carrying
/// the persistence filesystem and label keeps its data. Anything else is
/// destroyed without further ceremony, so callers pick the partition with
/// care. Returns whether a format actually happened.
pub fn ensure_formatted(
    partition: &Path,
    inventory: &dyn InventoryProvider,
    formatter: &dyn Formatter,
    settler: &dyn DeviceSettler,
) -> Result<bool> {
    if let Some(existing) = probe_partition(inventory, partition)? {
        if existing.is_persistence_volume() {
            return Ok(false);
        }
    }

    formatter.format_persistence(partition)?;
    settler.settle();
    Ok(true)
}
