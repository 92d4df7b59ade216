//! The persisted backup record and its partitions.
//!
//! A [`BackupSet`] describes one whole-disk backup: where it lives, which
//! partitions it contains and where it is in its lifecycle. The record is
//! stored as a JSON document keyed by backup id; the field names below are
//! the on-record names.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::error::{Error, Result};
use super::layout::Layout;

pub const BOOT_RECORD_FILE: &str = "boot.img";
pub const PARTITION_TABLE_FILE: &str = "ptable.bak";
pub const PARTITION_FILE_PREFIX: &str = "part";
pub const PARTITION_FILE_SUFFIX: &str = ".img";
pub const CONTAINER_FILE_SUFFIX: &str = ".sqfs";
pub const CONTAINER_MOUNT_DIR: &str = "sqfs_mnt";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    #[default]
    Pending,
    Running,
    Finished,
    Error,
}

impl Status {
    pub fn is_terminal(self) -> bool {
        matches!(self, Status::Finished | Status::Error)
    }

    /// Valid transitions: pending -> running -> {finished, error}. The state
    /// never moves backward.
    pub fn may_transition_to(self, next: Status) -> bool {
        matches!(
            (self, next),
            (Status::Pending, Status::Running)
                | (Status::Running, Status::Finished)
                | (Status::Running, Status::Error)
                | (Status::Pending, Status::Error)
        )
    }
}

/// One imaged partition inside a backup set. Immutable once recorded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Partition {
    /// Partition index/suffix on the disk, e.g. "1" for sda1.
    #[serde(rename = "partition")]
    pub id: String,
    /// Filesystem key used to select the imaging sub-tool.
    #[serde(rename = "fs")]
    pub file_system: String,
    /// Partition size in bytes.
    pub size: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupSet {
    pub id: String,
    pub node: String,
    pub backup_path: PathBuf,
    pub disk_layout: Layout,
    pub status: Status,
    pub deleted: bool,
    pub purged: bool,
    pub compressed: bool,
    pub backup_size: u64,
    pub disk_size: u64,
    pub creation_date: DateTime<Utc>,
    pub deletion_date: Option<DateTime<Utc>>,
    pub purge_date: Option<DateTime<Utc>>,
    pub partitions: Vec<Partition>,
}

impl BackupSet {
    pub fn new(id: impl Into<String>, node: impl Into<String>, backup_root: &Path) -> Self {
        let id = id.into();
        Self {
            backup_path: backup_root.join(&id),
            id,
            node: node.into(),
            disk_layout: Layout::Unknown,
            status: Status::Pending,
            deleted: false,
            purged: false,
            compressed: false,
            backup_size: 0,
            disk_size: 0,
            creation_date: Utc::now(),
            deletion_date: None,
            purge_date: None,
            partitions: Vec::new(),
        }
    }

    /// Record partitions from enumerated device names ("sda1") by stripping
    /// the disk prefix down to the numeric suffix.
    pub fn add_partition(&mut self, device_name: &str, file_system: &str, size: u64) {
        let stem = device_name.trim_end_matches(|c: char| c.is_ascii_digit());
        let id = device_name[stem.len()..].to_string();
        self.partitions.push(Partition {
            id,
            file_system: file_system.to_string(),
            size,
        });
    }

    pub fn boot_record_path(&self) -> PathBuf {
        self.backup_path.join(BOOT_RECORD_FILE)
    }

    pub fn partition_table_path(&self) -> PathBuf {
        self.backup_path.join(PARTITION_TABLE_FILE)
    }

    /// Raw image file for one partition, e.g. `<backupPath>/part1.img`.
    pub fn image_path(&self, partition: &Partition) -> PathBuf {
        self.backup_path.join(format!(
            "{PARTITION_FILE_PREFIX}{}{PARTITION_FILE_SUFFIX}",
            partition.id
        ))
    }

    /// Compressed container for one partition, e.g. `<backupPath>/part1.sqfs`.
    pub fn container_path(&self, partition: &Partition) -> PathBuf {
        self.backup_path.join(format!(
            "{PARTITION_FILE_PREFIX}{}{CONTAINER_FILE_SUFFIX}",
            partition.id
        ))
    }

    pub fn mark_deleted(&mut self) {
        self.deleted = true;
        self.deletion_date = Some(Utc::now());
    }

    /// Marks the backup as physically removed. Only legal once the backup has
    /// been soft-deleted; `purged` implies `deleted`.
    pub fn mark_purged(&mut self) -> Result<()> {
        if !self.deleted {
            return Err(Error::IllegalOperation(
                "the backup to be purged was not marked for deletion yet".into(),
            ));
        }
        self.purged = true;
        self.purge_date = Some(Utc::now());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_set() -> BackupSet {
        BackupSet::new("job1", "node0", Path::new("/backup"))
    }

    #[test]
    fn partition_record_round_trip() {
        let partition = Partition {
            id: "3".into(),
            file_system: "ext4".into(),
            size: 7_000_000,
        };
        let json = serde_json::to_string(&partition).unwrap();
        let back: Partition = serde_json::from_str(&json).unwrap();
        assert_eq!(back, partition);
    }

    #[test]
    fn partition_record_uses_short_field_names() {
        let partition = Partition {
            id: "1".into(),
            file_system: "ntfs".into(),
            size: 42,
        };
        let value = serde_json::to_value(&partition).unwrap();
        assert_eq!(value["partition"], "1");
        assert_eq!(value["fs"], "ntfs");
        assert_eq!(value["size"], 42);
    }

    #[test]
    fn add_partition_strips_disk_prefix() {
        let mut set = sample_set();
        set.add_partition("sda1", "ext4", 100);
        set.add_partition("nvme0n1p12", "ntfs", 200);
        assert_eq!(set.partitions[0].id, "1");
        assert_eq!(set.partitions[1].id, "12");
    }

    #[test]
    fn image_paths_follow_naming_convention() {
        let mut set = sample_set();
        set.add_partition("sda2", "ext4", 100);
        let partition = set.partitions[0].clone();
        assert_eq!(
            set.image_path(&partition),
            PathBuf::from("/backup/job1/part2.img")
        );
        assert_eq!(
            set.container_path(&partition),
            PathBuf::from("/backup/job1/part2.sqfs")
        );
    }

    #[test]
    fn purge_requires_deletion() {
        let mut set = sample_set();
        assert!(matches!(
            set.mark_purged(),
            Err(Error::IllegalOperation(_))
        ));
        set.mark_deleted();
        set.mark_purged().unwrap();
        assert!(set.purged);
        assert!(set.purge_date.is_some());
    }

    #[test]
    fn status_never_moves_backward() {
        assert!(Status::Pending.may_transition_to(Status::Running));
        assert!(Status::Running.may_transition_to(Status::Finished));
        assert!(Status::Running.may_transition_to(Status::Error));
        assert!(!Status::Finished.may_transition_to(Status::Running));
        assert!(!Status::Running.may_transition_to(Status::Pending));
        assert!(!Status::Error.may_transition_to(Status::Finished));
    }

    #[test]
    fn backupset_record_round_trip() {
        let mut set = sample_set();
        set.disk_layout = Layout::Gpt;
        set.compressed = true;
        set.add_partition("sda1", "ext4", 1024);
        let json = serde_json::to_string(&set).unwrap();
        let back: BackupSet = serde_json::from_str(&json).unwrap();
        assert_eq!(back.id, set.id);
        assert_eq!(back.disk_layout, Layout::Gpt);
        assert_eq!(back.partitions, set.partitions);
        assert_eq!(back.status, Status::Pending);
    }
}
