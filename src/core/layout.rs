//! Partition-table and boot-sector backup/restore.
//!
//! The boot record and partition table are treated as opaque byte ranges:
//! dd copies the boot region, sfdisk/sgdisk dump and reload the table. The
//! manager only needs to know the layout kind to size the boot region and to
//! pick the table tool.

use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{error, warn};

use super::backupset::{BOOT_RECORD_FILE, PARTITION_TABLE_FILE};
use super::error::{Error, Result};
use super::runner::{Capture, FileSink, Runner};

/// Size of an MBR boot sector.
pub const MBR_SIZE: u64 = 512;
/// Largest region a GPT backup needs: (128 entries * 128 bytes) + 1024 bytes
/// of protective MBR and header.
pub const GPT_BACKUP_SIZE: u64 = 17_408;
/// Sector count zero-filled at the end of the disk to wipe the GPT backup
/// table before a restore.
const BACKUP_TABLE_SECTORS: u64 = 1024;

const DEVICE_ROOT: &str = "/dev";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Layout {
    Mbr,
    Gpt,
    Unknown,
}

impl fmt::Display for Layout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Layout::Mbr => "MBR",
            Layout::Gpt => "GPT",
            Layout::Unknown => "UNKNOWN",
        };
        f.write_str(name)
    }
}

/// Classify a partition-table query result by its well-known substrings.
pub(crate) fn classify_layout(parted_output: &str) -> Layout {
    if parted_output.contains("msdos") {
        Layout::Mbr
    } else if parted_output.contains("gpt") {
        Layout::Gpt
    } else {
        Layout::Unknown
    }
}

/// Manages the layout backup of one disk into one target directory.
pub struct DiskLayout {
    disk: String,
    target_dir: PathBuf,
    layout: Layout,
    overwrite: bool,
}

impl DiskLayout {
    /// Query the disk's partition table and bind a manager to it.
    pub async fn detect(disk: &str, target_dir: &Path, overwrite: bool) -> Result<Self> {
        let layout = Self::detect_layout(disk).await?;
        Ok(Self::with_layout(disk, target_dir, layout, overwrite))
    }

    /// Bind to an already-known layout (restore path: the layout comes from
    /// the backup record, not from the disk being restored onto).
    pub fn with_layout(disk: &str, target_dir: &Path, layout: Layout, overwrite: bool) -> Self {
        Self {
            disk: disk.to_string(),
            target_dir: target_dir.to_path_buf(),
            layout,
            overwrite,
        }
    }

    pub fn layout(&self) -> Layout {
        self.layout
    }

    async fn detect_layout(disk: &str) -> Result<Layout> {
        let command = format!("parted /dev/{disk} p | grep \"Partition Table\\|Error\"");
        let parted = Runner::shell(command, Box::new(Capture::default()));
        parted
            .run()
            .await
            .map_err(|_| Error::Detection(disk.to_string()))?;
        let output = parted.output().unwrap_or_default();
        if output.is_empty() || output.contains("Error") {
            warn!(disk, output, "could not detect partition layout");
            return Err(Error::Detection(disk.to_string()));
        }
        Ok(classify_layout(&output))
    }

    /// Copy the boot region and serialize the partition table into the
    /// target directory.
    pub async fn backup_layout(&self) -> Result<()> {
        self.ensure_disk_exists()?;
        match self.layout {
            Layout::Mbr => {
                self.backup_boot_record(MBR_SIZE).await?;
                self.backup_mbr_table().await
            }
            Layout::Gpt => {
                self.backup_boot_record(GPT_BACKUP_SIZE).await?;
                self.backup_gpt_table().await
            }
            Layout::Unknown => Err(Error::Detection(self.disk.clone())),
        }
    }

    /// Wipe stale partition tables on the disk, write the saved boot record
    /// and table back and force the OS to re-read it.
    pub async fn restore_layout(&self) -> Result<()> {
        self.ensure_disk_exists()?;
        if self.layout == Layout::Unknown {
            return Err(Error::Detection(self.disk.clone()));
        }
        self.wipe_partition_tables().await;
        self.restore_boot_record().await?;
        match self.layout {
            Layout::Mbr => self.restore_mbr_table().await?,
            Layout::Gpt => self.restore_gpt_table().await?,
            Layout::Unknown => unreachable!(),
        }
        self.refresh_partition_table().await;
        Ok(())
    }

    fn device(&self) -> String {
        format!("{DEVICE_ROOT}/{}", self.disk)
    }

    fn ensure_disk_exists(&self) -> Result<()> {
        if !Path::new(&self.device()).exists() {
            return Err(Error::DeviceUnavailable(self.device()));
        }
        Ok(())
    }

    fn refuse_existing(&self, target: &Path) -> Result<()> {
        if target.exists() && !self.overwrite {
            let msg = format!(
                "existing layout backup detected at {}; not overwriting",
                target.display()
            );
            error!("{msg}");
            return Err(Error::Layout(msg));
        }
        Ok(())
    }

    async fn backup_boot_record(&self, size: u64) -> Result<()> {
        let target = self.target_dir.join(BOOT_RECORD_FILE);
        self.refuse_existing(&target)?;
        let dd = Runner::new(
            dd_args(&self.device(), &target.display().to_string(), size, 1, None),
            Box::new(Capture::default()),
        );
        if dd.run().await? != 0 {
            error!(disk = %self.disk, "boot record backup failed");
            return Err(Error::Layout(
                "boot record backup did not finish successfully".into(),
            ));
        }
        if !target.exists() {
            return Err(Error::Layout("boot record backup file was not created".into()));
        }
        Ok(())
    }

    async fn backup_mbr_table(&self) -> Result<()> {
        let target = self.target_dir.join(PARTITION_TABLE_FILE);
        self.refuse_existing(&target)?;
        let sfdisk = Runner::new(
            vec!["sfdisk".into(), "-d".into(), self.device()],
            Box::new(FileSink::create(&target)?),
        );
        if sfdisk.run().await? != 0 {
            error!(disk = %self.disk, "partition table backup failed");
            return Err(Error::Layout(
                "partition table backup did not finish successfully".into(),
            ));
        }
        if !target.exists() {
            return Err(Error::Layout("partition table backup was not created".into()));
        }
        Ok(())
    }

    async fn backup_gpt_table(&self) -> Result<()> {
        let target = self.target_dir.join(PARTITION_TABLE_FILE);
        self.refuse_existing(&target)?;
        let sgdisk = Runner::new(
            vec![
                "sgdisk".into(),
                "-b".into(),
                target.display().to_string(),
                self.device(),
            ],
            Box::new(Capture::default()),
        );
        if sgdisk.run().await? != 0 {
            error!(disk = %self.disk, "partition table backup failed");
            return Err(Error::Layout(
                "partition table backup did not finish successfully".into(),
            ));
        }
        if !target.exists() {
            return Err(Error::Layout("partition table backup was not created".into()));
        }
        Ok(())
    }

    async fn restore_boot_record(&self) -> Result<()> {
        let source = self.target_dir.join(BOOT_RECORD_FILE);
        if !source.exists() {
            return Err(Error::Layout("the boot record backup is missing".into()));
        }
        let dd = Runner::new(
            vec![
                "dd".into(),
                format!("if={}", source.display()),
                format!("of={}", self.device()),
            ],
            Box::new(Capture::default()),
        );
        if dd.run().await? != 0 {
            error!(disk = %self.disk, "boot record restoration failed");
        }
        Ok(())
    }

    async fn restore_mbr_table(&self) -> Result<()> {
        let source = self.target_dir.join(PARTITION_TABLE_FILE);
        if !source.exists() {
            return Err(Error::Layout("the partition table backup is missing".into()));
        }
        let command = format!("sfdisk -f {} < {}", self.device(), source.display());
        let sfdisk = Runner::shell(command, Box::new(Capture::default()));
        if sfdisk.run().await? != 0 {
            error!(disk = %self.disk, "partition table restoration failed");
        }
        Ok(())
    }

    async fn restore_gpt_table(&self) -> Result<()> {
        let source = self.target_dir.join(PARTITION_TABLE_FILE);
        if !source.exists() {
            return Err(Error::Layout("the partition table backup is missing".into()));
        }
        let sgdisk = Runner::new(
            vec![
                "sgdisk".into(),
                "-l".into(),
                source.display().to_string(),
                self.device(),
            ],
            Box::new(Capture::default()),
        );
        if sgdisk.run().await? != 0 {
            error!(disk = %self.disk, "partition table restoration failed");
        }
        Ok(())
    }

    /// Zero-fill the primary table at the start of the disk and the backup
    /// table at its end. Failures are logged, not fatal: the subsequent
    /// restore overwrites the same regions.
    async fn wipe_partition_tables(&self) {
        let primary = Runner::new(
            dd_args("/dev/zero", &self.device(), GPT_BACKUP_SIZE, 1, None),
            Box::new(Capture::default()),
        );
        if !matches!(primary.run().await, Ok(0)) {
            warn!(disk = %self.disk, "cannot wipe the primary partition table");
        }

        let blockdev = Runner::new(
            vec!["blockdev".into(), "--getsz".into(), self.device()],
            Box::new(Capture::default()),
        );
        let sectors = match blockdev.run().await {
            Ok(0) => blockdev
                .output()
                .and_then(|out| out.trim().parse::<u64>().ok()),
            _ => None,
        };
        let Some(sectors) = sectors else {
            warn!(disk = %self.disk, "could not retrieve the disk size in sectors");
            return;
        };
        let seek = sectors.saturating_sub(BACKUP_TABLE_SECTORS);
        let backup = Runner::new(
            dd_args("/dev/zero", &self.device(), 512, BACKUP_TABLE_SECTORS, Some(seek)),
            Box::new(Capture::default()),
        );
        if !matches!(backup.run().await, Ok(0)) {
            warn!(disk = %self.disk, "cannot wipe the backup partition table");
        }
    }

    async fn refresh_partition_table(&self) {
        let partprobe = Runner::new(
            vec!["partprobe".into(), self.device()],
            Box::new(Capture::default()),
        );
        if !matches!(partprobe.run().await, Ok(0)) {
            error!(disk = %self.disk, "cannot refresh the partition table");
        }
    }
}

fn dd_args(source: &str, target: &str, bs: u64, count: u64, seek: Option<u64>) -> Vec<String> {
    let mut args = vec![
        "dd".to_string(),
        format!("if={source}"),
        format!("of={target}"),
        format!("bs={bs}"),
        format!("count={count}"),
    ];
    if let Some(seek) = seek {
        args.push(format!("seek={seek}"));
    }
    args
}
