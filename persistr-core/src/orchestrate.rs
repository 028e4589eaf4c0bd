//! The end-to-end provisioning state machine.
//!
//! One pass over a single disk: resolve the target, check it is safe to
//! touch, then do only the work that is still missing. Repeat runs are
//! cheap because an existing persistence volume routes straight to the
//! config write. Nothing is rolled back on failure; a run aborts where it
//! stands and the operator intervenes.

use crate::conf::{WrittenConf, write_activation};
use crate::device::{Disk, partition_path};
use crate::provision::{create_trailing_partition, ensure_formatted};
use crate::safety::{assert_not_system_disk, quiesce};
use crate::select::select_candidate;
use crate::system::System;
use crate::{DEFAULT_MOUNT_DIR, Error, Result};
use std::path::{Path, PathBuf};

/// The persistence volume lives on partition 3 in the standard
/// two-partition hybrid ISO layout.
const PERSISTENCE_PART_NUMBER: u32 = 3;

/// Progress notifications emitted as the state machine advances.
///
/// Events describe work already decided or done; they carry enough for a
/// front-end to narrate the run without re-querying anything.
#[derive(Clone, Debug)]
pub enum StageEvent {
    /// Target disk resolved, explicitly or by auto-selection.
    Resolved { disk: PathBuf, auto: bool },
    /// Stray mounts were swept before destructive work.
    Quiesced { cleared: usize, failed: Vec<PathBuf> },
    /// A persistence volume already exists; partitioning and formatting
    /// are skipped entirely.
    ExistingVolume { device: PathBuf },
    /// A new partition was created over the given MiB range.
    PartitionCreated {
        disk: PathBuf,
        start_mib: f64,
        end_mib: f64,
    },
    /// The disk already had enough partitions; creation skipped.
    PartitionExists { device: PathBuf },
    /// The target partition was formatted as the persistence volume.
    Formatted { device: PathBuf },
    /// The target partition already was the persistence volume; its data
    /// survives.
    FormatSkipped { device: PathBuf },
    /// The activation file was written.
    ConfWritten {
        device: PathBuf,
        target: PathBuf,
        reused_mount: bool,
    },
}

/// Caller-tunable knobs for one provisioning run.
#[derive(Clone, Debug)]
pub struct Options {
    /// Explicit target disk; auto-selection runs when absent.
    pub device: Option<PathBuf>,
    /// Directory used for the transient config-write mount.
    pub mount_dir: PathBuf,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            device: None,
            mount_dir: PathBuf::from(DEFAULT_MOUNT_DIR),
        }
    }
}

/// Outcome summary of a completed run.
#[derive(Clone, Debug)]
pub struct Report {
    /// The disk that was (or would have been) provisioned.
    pub disk: PathBuf,
    /// The partition carrying the persistence volume.
    pub device: PathBuf,
    /// Where the activation file was written.
    pub conf: WrittenConf,
}

/// Runs the whole provisioning sequence against `sys`.
///
/// Stage order is fixed: resolve, validate, short-circuit on an existing
/// volume, create the partition if the disk has fewer than three, wait for
/// the node, format if needed, write the activation file. Each decision
/// point works from a fresh inventory snapshot because table edits and
/// formats invalidate earlier ones.
pub fn provision(
    sys: &System<'_>,
    opts: &Options,
    mut on_stage: impl FnMut(StageEvent),
) -> Result<Report> {
    // Resolve.
    let disks = sys.inventory.inventory()?;
    let (disk, auto) = match &opts.device {
        Some(path) => (path.clone(), false),
        None => (select_candidate(&disks)?, true),
    };
    on_stage(StageEvent::Resolved {
        disk: disk.clone(),
        auto,
    });

    // Validate.
    assert_not_system_disk(&disk, sys.rootfs)?;
    if let Some(snapshot) = find_disk(&disks, &disk) {
        let mounted: usize = snapshot
            .partitions
            .iter()
            .map(|p| p.mount_targets.len())
            .sum();
        if mounted > 0 {
            let failures = quiesce(snapshot, sys.mounts);
            on_stage(StageEvent::Quiesced {
                cleared: mounted - failures.len(),
                failed: failures.into_iter().map(|(target, _)| target).collect(),
            });
        }
    }

    // CheckExisting: any persistence volume system-wide short-circuits to
    // the config write, so repeat runs never repartition or reformat.
    let fresh = sys.inventory.inventory()?;
    if let Some(volume) = fresh
        .iter()
        .flat_map(|d| &d.partitions)
        .find(|p| p.is_persistence_volume())
    {
        on_stage(StageEvent::ExistingVolume {
            device: volume.path.clone(),
        });
        let conf = write_activation(&volume.path, &opts.mount_dir, sys.mounts)?;
        on_stage(StageEvent::ConfWritten {
            device: volume.path.clone(),
            target: conf.target.clone(),
            reused_mount: conf.reused_mount,
        });
        return Ok(Report {
            disk,
            device: volume.path.clone(),
            conf,
        });
    }

    // EnsurePartitionCount.
    let partition_count = find_disk(&fresh, &disk)
        .map(|d| d.partitions.len())
        .unwrap_or(0);
    let target = partition_path(&disk, PERSISTENCE_PART_NUMBER);
    if partition_count < PERSISTENCE_PART_NUMBER as usize {
        let span = create_trailing_partition(&disk, sys.table, sys.settler)?;
        on_stage(StageEvent::PartitionCreated {
            disk: disk.clone(),
            start_mib: span.start_mib,
            end_mib: span.end_mib,
        });
    } else {
        on_stage(StageEvent::PartitionExists {
            device: target.clone(),
        });
    }

    // ResolveTargetPartition: give the node one extra settle to show up.
    if !sys.settler.device_present(&target) {
        sys.settler.settle();
    }
    if !sys.settler.device_present(&target) {
        return Err(Error::PartitionNotReady(target));
    }

    // Format.
    let formatted = ensure_formatted(&target, sys.inventory, sys.formatter, sys.settler)?;
    on_stage(if formatted {
        StageEvent::Formatted {
            device: target.clone(),
        }
    } else {
        StageEvent::FormatSkipped {
            device: target.clone(),
        }
    });

    // WriteConfig.
    let conf = write_activation(&target, &opts.mount_dir, sys.mounts)?;
    on_stage(StageEvent::ConfWritten {
        device: target.clone(),
        target: conf.target.clone(),
        reused_mount: conf.reused_mount,
    });

    Ok(Report {
        disk,
        device: target,
        conf,
    })
}

fn find_disk<'d>(disks: &'d [Disk], path: &Path) -> Option<&'d Disk> {
    disks.iter().find(|d| d.path.as_path() == path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{FreeRegion, Partition};
    use crate::system::{
        DeviceSettler, Formatter, InventoryProvider, MountManager, RootFsResolver, TableEditor,
    };
    use crate::{ACTIVATION_FILE, PERSISTENCE_FS, PERSISTENCE_LABEL};
    use std::cell::RefCell;
    use std::fs;

    const GIB: u64 = 1024 * 1024 * 1024;
    const MIB: u64 = 1024 * 1024;

    /// An in-memory machine: one trait object for every collaborator,
    /// mutating a shared disk tree the way the real tools would.
    struct FakeMachine {
        state: RefCell<MachineState>,
    }

    struct MachineState {
        disks: Vec<Disk>,
        root_device: PathBuf,
        free: Vec<FreeRegion>,
        created: Vec<(f64, f64)>,
        formatted: Vec<PathBuf>,
        mount_log: Vec<String>,
        settles: usize,
        /// When set, created partitions never surface as device nodes.
        swallow_new_nodes: bool,
    }

    impl FakeMachine {
        fn new(disks: Vec<Disk>, root_device: &str, free: Vec<FreeRegion>) -> Self {
            Self {
                state: RefCell::new(MachineState {
                    disks,
                    root_device: PathBuf::from(root_device),
                    free,
                    created: Vec::new(),
                    formatted: Vec::new(),
                    mount_log: Vec::new(),
                    settles: 0,
                    swallow_new_nodes: false,
                }),
            }
        }

        fn system(&self) -> System<'_> {
            System {
                inventory: self,
                table: self,
                formatter: self,
                mounts: self,
                rootfs: self,
                settler: self,
            }
        }
    }

    impl InventoryProvider for FakeMachine {
        fn inventory(&self) -> Result<Vec<Disk>> {
            Ok(self.state.borrow().disks.clone())
        }
    }

    impl TableEditor for FakeMachine {
        fn free_regions(&self, _disk: &Path) -> Result<Vec<FreeRegion>> {
            Ok(self.state.borrow().free.clone())
        }

        fn create_partition(&self, disk: &Path, start_mib: f64, end_mib: f64) -> Result<()> {
            let mut state = self.state.borrow_mut();
            state.created.push((start_mib, end_mib));
            if state.swallow_new_nodes {
                return Ok(());
            }
            let disk = state
                .disks
                .iter_mut()
                .find(|d| d.path.as_path() == disk)
                .expect("partitioning a disk the fake does not know");
            let number = disk.partitions.len() as u32 + 1;
            let path = partition_path(&disk.path, number);
            disk.partitions.push(Partition {
                path,
                number,
                size_bytes: ((end_mib - start_mib) as u64) * MIB,
                fs_type: None,
                label: None,
                mount_targets: Vec::new(),
            });
            Ok(())
        }
    }

    impl Formatter for FakeMachine {
        fn format_persistence(&self, partition: &Path) -> Result<()> {
            let mut state = self.state.borrow_mut();
            state.formatted.push(partition.to_path_buf());
            for disk in &mut state.disks {
                if let Some(p) = disk.partitions.iter_mut().find(|p| p.path.as_path() == partition) {
                    p.fs_type = Some(PERSISTENCE_FS.to_string());
                    p.label = Some(PERSISTENCE_LABEL.to_string());
                }
            }
            Ok(())
        }
    }

    impl MountManager for FakeMachine {
        fn mount(&self, device: &Path, target: &Path) -> Result<()> {
            self.state
                .borrow_mut()
                .mount_log
                .push(format!("mount {} {}", device.display(), target.display()));
            Ok(())
        }

        fn unmount(&self, target: &Path) -> Result<()> {
            self.state
                .borrow_mut()
                .mount_log
                .push(format!("umount {}", target.display()));
            Ok(())
        }

        fn mount_targets(&self, device: &Path) -> Result<Vec<PathBuf>> {
            // Mirrors what findmnt would say from the inventoried state.
            Ok(self
                .state
                .borrow()
                .disks
                .iter()
                .flat_map(|d| &d.partitions)
                .filter(|p| p.path.as_path() == device)
                .flat_map(|p| p.mount_targets.clone())
                .collect())
        }
    }

    impl RootFsResolver for FakeMachine {
        fn root_device(&self) -> Result<PathBuf> {
            Ok(self.state.borrow().root_device.clone())
        }
    }

    impl DeviceSettler for FakeMachine {
        fn settle(&self) {
            self.state.borrow_mut().settles += 1;
        }

        fn device_present(&self, path: &Path) -> bool {
            self.state
                .borrow()
                .disks
                .iter()
                .flat_map(|d| &d.partitions)
                .any(|p| p.path.as_path() == path)
        }
    }

    fn partition(path: &str, size_bytes: u64, fs_type: Option<&str>, label: Option<&str>) -> Partition {
        Partition {
            path: PathBuf::from(path),
            number: crate::device::partition_number(Path::new(path)).unwrap_or(0),
            size_bytes,
            fs_type: fs_type.map(str::to_string),
            label: label.map(str::to_string),
            mount_targets: Vec::new(),
        }
    }

    /// A 16 GiB stick freshly flashed with a hybrid live ISO.
    fn flashed_stick(path: &str) -> Disk {
        Disk {
            path: PathBuf::from(path),
            name: path.trim_start_matches("/dev/").to_string(),
            size_bytes: 16 * GIB,
            removable: true,
            partitions: vec![
                partition(&format!("{path}1"), 5 * GIB, Some("iso9660"), Some("Kali Live")),
                partition(&format!("{path}2"), 4 * MIB, Some("vfat"), None),
            ],
        }
    }

    fn trailing_free() -> Vec<FreeRegion> {
        vec![FreeRegion {
            start_mib: 4704.0,
            end_mib: 15192.0,
        }]
    }

    fn options_in(dir: &tempfile::TempDir) -> Options {
        Options {
            device: None,
            mount_dir: dir.path().join("persistence"),
        }
    }

    #[test]
    fn fresh_flashed_stick_end_to_end() {
        let machine = FakeMachine::new(
            vec![flashed_stick("/dev/sdb")],
            "/dev/nvme0n1p2",
            trailing_free(),
        );
        let dir = tempfile::tempdir().unwrap();
        let opts = options_in(&dir);

        let mut events = Vec::new();
        let report =
            provision(&machine.system(), &opts, |event| events.push(event)).unwrap();

        assert_eq!(report.disk, PathBuf::from("/dev/sdb"));
        assert_eq!(report.device, PathBuf::from("/dev/sdb3"));
        assert!(!report.conf.reused_mount);

        let state = machine.state.borrow();
        assert_eq!(state.created, vec![(4705.0, 15192.0)]);
        assert_eq!(state.formatted, vec![PathBuf::from("/dev/sdb3")]);

        let written = fs::read(opts.mount_dir.join(ACTIVATION_FILE)).unwrap();
        assert_eq!(written, b"/ union\n");

        assert!(matches!(
            events[0],
            StageEvent::Resolved { auto: true, .. }
        ));
        assert!(events
            .iter()
            .any(|e| matches!(e, StageEvent::PartitionCreated { .. })));
        assert!(events.iter().any(|e| matches!(e, StageEvent::Formatted { .. })));
        assert!(events
            .iter()
            .any(|e| matches!(e, StageEvent::ConfWritten { .. })));
    }

    #[test]
    fn rerun_with_existing_volume_only_writes_conf() {
        let mut stick = flashed_stick("/dev/sdb");
        stick.partitions.push(partition(
            "/dev/sdb3",
            10 * GIB,
            Some(PERSISTENCE_FS),
            Some(PERSISTENCE_LABEL),
        ));
        let machine =
            FakeMachine::new(vec![stick], "/dev/nvme0n1p2", Vec::new());
        let dir = tempfile::tempdir().unwrap();
        let opts = options_in(&dir);

        let mut events = Vec::new();
        let report =
            provision(&machine.system(), &opts, |event| events.push(event)).unwrap();

        assert_eq!(report.device, PathBuf::from("/dev/sdb3"));
        let state = machine.state.borrow();
        assert!(state.created.is_empty());
        assert!(state.formatted.is_empty());
        assert!(events
            .iter()
            .any(|e| matches!(e, StageEvent::ExistingVolume { .. })));

        let written = fs::read(opts.mount_dir.join(ACTIVATION_FILE)).unwrap();
        assert_eq!(written, b"/ union\n");
    }

    #[test]
    fn existing_third_partition_skips_creation_but_formats() {
        let mut stick = flashed_stick("/dev/sdb");
        stick
            .partitions
            .push(partition("/dev/sdb3", 10 * GIB, Some("ext4"), Some("backup")));
        let machine =
            FakeMachine::new(vec![stick], "/dev/nvme0n1p2", Vec::new());
        let dir = tempfile::tempdir().unwrap();

        let mut events = Vec::new();
        let report = provision(&machine.system(), &options_in(&dir), |event| {
            events.push(event)
        })
        .unwrap();

        assert_eq!(report.device, PathBuf::from("/dev/sdb3"));
        let state = machine.state.borrow();
        assert!(state.created.is_empty());
        // Wrong label, so the partition was reformatted.
        assert_eq!(state.formatted, vec![PathBuf::from("/dev/sdb3")]);
        assert!(events
            .iter()
            .any(|e| matches!(e, StageEvent::PartitionExists { .. })));
    }

    #[test]
    fn system_disk_is_refused_before_any_change() {
        let machine = FakeMachine::new(
            vec![flashed_stick("/dev/sdb")],
            "/dev/sdb2",
            trailing_free(),
        );
        let dir = tempfile::tempdir().unwrap();
        let opts = Options {
            device: Some(PathBuf::from("/dev/sdb")),
            mount_dir: dir.path().join("persistence"),
        };

        let result = provision(&machine.system(), &opts, |_| {});
        assert!(matches!(result, Err(Error::SafetyAbort { .. })));
        let state = machine.state.borrow();
        assert!(state.created.is_empty());
        assert!(state.formatted.is_empty());
        assert!(state.mount_log.is_empty());
    }

    #[test]
    fn explicit_device_bypasses_ambiguous_selection() {
        // Two identical sticks: auto-selection must refuse, an explicit
        // device must still work.
        let disks = vec![flashed_stick("/dev/sdb"), flashed_stick("/dev/sdc")];
        let machine = FakeMachine::new(disks.clone(), "/dev/nvme0n1p2", trailing_free());
        let dir = tempfile::tempdir().unwrap();

        let auto = provision(&machine.system(), &options_in(&dir), |_| {});
        assert!(matches!(auto, Err(Error::AmbiguousCandidate(_))));

        let machine = FakeMachine::new(disks, "/dev/nvme0n1p2", trailing_free());
        let opts = Options {
            device: Some(PathBuf::from("/dev/sdc")),
            mount_dir: dir.path().join("persistence"),
        };
        let mut events = Vec::new();
        let report =
            provision(&machine.system(), &opts, |event| events.push(event)).unwrap();
        assert_eq!(report.device, PathBuf::from("/dev/sdc3"));
        assert!(matches!(
            events[0],
            StageEvent::Resolved { auto: false, .. }
        ));
    }

    #[test]
    fn mounted_partitions_are_swept_first() {
        let mut stick = flashed_stick("/dev/sdb");
        stick.partitions[0].mount_targets = vec![PathBuf::from("/media/user/live")];
        let machine =
            FakeMachine::new(vec![stick], "/dev/nvme0n1p2", trailing_free());
        let dir = tempfile::tempdir().unwrap();

        let mut events = Vec::new();
        provision(&machine.system(), &options_in(&dir), |event| {
            events.push(event)
        })
        .unwrap();

        assert!(events.iter().any(|e| matches!(
            e,
            StageEvent::Quiesced { cleared: 1, failed } if failed.is_empty()
        )));
        let state = machine.state.borrow();
        assert_eq!(state.mount_log[0], "umount /media/user/live");
    }

    #[test]
    fn missing_device_node_is_partition_not_ready() {
        let machine = FakeMachine::new(
            vec![flashed_stick("/dev/sdb")],
            "/dev/nvme0n1p2",
            trailing_free(),
        );
        machine.state.borrow_mut().swallow_new_nodes = true;
        let dir = tempfile::tempdir().unwrap();

        let result = provision(&machine.system(), &options_in(&dir), |_| {});
        match result {
            Err(Error::PartitionNotReady(path)) => {
                assert_eq!(path, PathBuf::from("/dev/sdb3"));
            }
            other => panic!("expected PartitionNotReady, got {other:?}"),
        }
        // One settle after mkpart, one extra waiting for the node.
        assert_eq!(machine.state.borrow().settles, 2);
    }

    #[test]
    fn no_trailing_space_aborts_with_insufficient_space() {
        let machine = FakeMachine::new(
            vec![flashed_stick("/dev/sdb")],
            "/dev/nvme0n1p2",
            Vec::new(),
        );
        let dir = tempfile::tempdir().unwrap();

        let result = provision(&machine.system(), &options_in(&dir), |_| {});
        assert!(matches!(result, Err(Error::InsufficientSpace(_))));
    }

    #[test]
    fn nvme_disk_resolves_p_infixed_partition() {
        let mut stick = flashed_stick("/dev/mmcblk0");
        // Fix child paths to the p-infixed convention.
        stick.partitions[0].path = PathBuf::from("/dev/mmcblk0p1");
        stick.partitions[1].path = PathBuf::from("/dev/mmcblk0p2");
        let machine =
            FakeMachine::new(vec![stick], "/dev/nvme0n1p2", trailing_free());
        let dir = tempfile::tempdir().unwrap();

        let report =
            provision(&machine.system(), &options_in(&dir), |_| {}).unwrap();
        assert_eq!(report.device, PathBuf::from("/dev/mmcblk0p3"));
    }
}
