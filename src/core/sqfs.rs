//! Compressed-container handling for squashfs backups.
//!
//! A compressed backup stores one `partN.sqfs` container per partition. For
//! restore and mount flows the containers are mounted under
//! `<backupDir>/sqfs_mnt/partN/` and the inner image is symlinked to
//! `<backupDir>/partN.img`, so the imaging and mounting code paths are
//! identical for compressed and raw backups.

use std::io;
use std::path::PathBuf;

use tracing::warn;

use super::backupset::{BackupSet, CONTAINER_MOUNT_DIR, PARTITION_FILE_PREFIX, Partition};
use super::error::{Error, Result};
use super::runner::{Capture, Runner};

pub struct SquashfsWrapper {
    set: BackupSet,
    mount_dir: PathBuf,
    mounted: bool,
}

impl SquashfsWrapper {
    pub fn new(set: &BackupSet) -> Self {
        Self {
            mount_dir: set.backup_path.join(CONTAINER_MOUNT_DIR),
            set: set.clone(),
            mounted: false,
        }
    }

    pub fn mounted(&self) -> bool {
        self.mounted
    }

    /// Mount every partition container and link the inner images into the
    /// backup directory.
    pub async fn mount(&mut self) -> Result<()> {
        if !self.set.backup_path.exists() {
            return Err(Error::Io(io::Error::new(
                io::ErrorKind::NotFound,
                format!("cannot open backup directory {}", self.set.backup_path.display()),
            )));
        }
        tokio::fs::create_dir_all(&self.mount_dir).await?;
        for partition in self.set.partitions.clone() {
            let target = self.partition_mount_dir(&partition);
            tokio::fs::create_dir_all(&target).await?;
            self.mount_container(&partition).await;
            self.link_image(&partition).await?;
        }
        self.mounted = true;
        Ok(())
    }

    /// Reverse of `mount`: drop the symlinks, unmount the containers and
    /// remove the mount tree.
    pub async fn unmount(&mut self) -> Result<()> {
        for partition in self.set.partitions.clone() {
            self.unlink_image(&partition).await;
            let target = self.partition_mount_dir(&partition);
            let umount = Runner::new(
                vec!["umount".to_string(), target.display().to_string()],
                Box::new(Capture::default()),
            );
            if !matches!(umount.run().await, Ok(0)) {
                warn!(mountpoint = %target.display(), "container unmount reported failure");
            }
        }
        if self.mount_dir.exists() {
            tokio::fs::remove_dir_all(&self.mount_dir).await?;
        }
        self.mounted = false;
        Ok(())
    }

    fn partition_mount_dir(&self, partition: &Partition) -> PathBuf {
        self.mount_dir
            .join(format!("{PARTITION_FILE_PREFIX}{}", partition.id))
    }

    async fn mount_container(&self, partition: &Partition) {
        let container = self.set.container_path(partition);
        let target = self.partition_mount_dir(partition);
        let mount = Runner::new(
            vec![
                "mount".to_string(),
                container.display().to_string(),
                target.display().to_string(),
            ],
            Box::new(Capture::default()),
        );
        if !matches!(mount.run().await, Ok(0)) {
            warn!(container = %container.display(), "container mount reported failure");
        }
    }

    async fn link_image(&self, partition: &Partition) -> Result<()> {
        let image_name = format!("{PARTITION_FILE_PREFIX}{}.img", partition.id);
        let inner = self.partition_mount_dir(partition).join(&image_name);
        let link = self.set.backup_path.join(&image_name);
        match tokio::fs::symlink(&inner, &link).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn unlink_image(&self, partition: &Partition) {
        let link = self
            .set
            .backup_path
            .join(format!("{PARTITION_FILE_PREFIX}{}.img", partition.id));
        if link.is_symlink() {
            let _ = tokio::fs::remove_file(&link).await;
        }
    }
}
