//! Partition imaging via partclone.
//!
//! For every partition in a backup set the engine picks the partclone
//! sub-tool matching the filesystem, builds the invocation, runs it behind a
//! pseudo-terminal and feeds the live progress lines into a shared progress
//! board. Tool complaints are classified into typed faults; the one fault the
//! engine recovers from locally is a destination-space shortfall, which
//! triggers a single purge-and-retry pass.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use serde::Serialize;
use tracing::{debug, error, warn};

use super::backupset::{
    BackupSet, CONTAINER_FILE_SUFFIX, PARTITION_FILE_PREFIX, PARTITION_FILE_SUFFIX, Partition,
    Status,
};
use super::error::{Error, ImagingFault, Result};
use super::reclaim::SpaceReclaimer;
use super::runner::{OutputParser, Runner};

const DEVICE_ROOT: &str = "/dev";

/// Recognised imaging options. A typed struct instead of the loose option
/// dictionary the tools are usually driven with; every field has an explicit
/// default.
#[derive(Debug, Clone)]
pub struct ImagingOptions {
    /// Replace existing image files instead of refusing to run.
    pub overwrite: bool,
    /// Tolerate read errors and keep imaging.
    pub rescue: bool,
    /// Destination free-space validation; disabling emits the skip switch.
    pub space_check: bool,
    /// Source filesystem validation; disabling emits the skip switch.
    pub fs_check: bool,
    /// Image checksum validation; disabling emits the skip switch.
    pub crc_check: bool,
    pub force: bool,
    /// Progress-report interval in seconds; 0 omits the flag entirely.
    pub refresh_delay: u32,
    /// Wrap backup output in a compressed read-only container instead of a
    /// raw image file.
    pub compress: bool,
}

impl Default for ImagingOptions {
    fn default() -> Self {
        Self {
            overwrite: false,
            rescue: false,
            space_check: true,
            fs_check: true,
            crc_check: true,
            force: false,
            refresh_delay: 5,
            compress: false,
        }
    }
}

/// partclone variant per filesystem; anything unrecognised is imaged as a
/// raw block copy.
fn tool_for_fs(fs: &str) -> &'static str {
    match fs {
        "ntfs" => "partclone.ntfs",
        "fat32" => "partclone.fat32",
        "fat16" => "partclone.fat16",
        "fat12" => "partclone.fat12",
        "vfat" => "partclone.vfat",
        "exfat" => "partclone.exfat",
        "ext2" => "partclone.ext2",
        "ext3" => "partclone.ext3",
        "ext4" => "partclone.ext4",
        "hfsplus" | "hfs+" => "partclone.hfsp",
        // No partclone support for legacy HFS; fall through to the raw tool.
        _ => "partclone.dd",
    }
}

/// Kernel device naming: disks whose name ends in a digit separate the
/// partition number with "p" (nvme0n1p2, mmcblk0p1); the rest append it
/// directly (sda1).
pub(crate) fn partition_device_name(disk: &str, id: &str) -> String {
    if disk.ends_with(|c: char| c.is_ascii_digit()) {
        format!("{disk}p{id}")
    } else {
        format!("{disk}{id}")
    }
}

/// Live per-partition progress, filled in from the tool's progress lines.
#[derive(Debug, Clone, Serialize)]
pub struct PartitionProgress {
    /// Device name, e.g. "sda1".
    pub name: String,
    pub status: Status,
    /// Completed percentage as last reported.
    pub completed: f64,
    pub elapsed: String,
    pub remaining: String,
}

impl PartitionProgress {
    fn pending(name: String) -> Self {
        Self {
            name,
            status: Status::Pending,
            completed: 0.0,
            elapsed: "00:00:00".into(),
            remaining: "00:00:00".into(),
        }
    }
}

type ProgressBoard = Arc<Mutex<Vec<PartitionProgress>>>;

#[derive(Clone, Copy, PartialEq, Eq)]
enum Mode {
    Backup,
    Restore,
}

/// Images all partitions of one backup set, one at a time, in order.
pub struct PartitionImage {
    disk: String,
    backup_dir: PathBuf,
    partitions: Vec<Partition>,
    opts: ImagingOptions,
    board: ProgressBoard,
    current: Mutex<Option<Runner>>,
    reclaimer: Option<Arc<SpaceReclaimer>>,
    device_root: PathBuf,
}

impl PartitionImage {
    /// `reclaimer` enables the space-exhaustion recovery pass; it is only
    /// wired in for backups, never for restores.
    pub fn new(
        disk: &str,
        backup_dir: &Path,
        set: &BackupSet,
        opts: ImagingOptions,
        reclaimer: Option<Arc<SpaceReclaimer>>,
    ) -> Self {
        let board = set
            .partitions
            .iter()
            .map(|p| PartitionProgress::pending(partition_device_name(disk, &p.id)))
            .collect();
        Self {
            disk: disk.to_string(),
            backup_dir: backup_dir.to_path_buf(),
            partitions: set.partitions.clone(),
            opts,
            board: Arc::new(Mutex::new(board)),
            current: Mutex::new(None),
            reclaimer,
            device_root: PathBuf::from(DEVICE_ROOT),
        }
    }

    #[cfg(test)]
    pub(crate) fn with_device_root(mut self, root: &Path) -> Self {
        self.device_root = root.to_path_buf();
        self
    }

    /// Image every partition into the backup directory.
    pub async fn backup(&self) -> Result<()> {
        self.run_all(Mode::Backup).await
    }

    /// Write every partition image back onto the disk.
    pub async fn restore(&self) -> Result<()> {
        self.run_all(Mode::Restore).await
    }

    /// The live progress board, one entry per partition.
    pub fn status(&self) -> Vec<PartitionProgress> {
        self.board.lock().unwrap().clone()
    }

    /// Kill the in-flight imaging process, if any.
    pub async fn kill(&self) {
        let runner = self.current.lock().unwrap().clone();
        if let Some(runner) = runner {
            runner.kill().await;
        }
    }

    async fn run_all(&self, mode: Mode) -> Result<()> {
        for index in 0..self.partitions.len() {
            self.run_partition(index, mode).await?;
        }
        Ok(())
    }

    async fn run_partition(&self, index: usize, mode: Mode) -> Result<()> {
        let partition = &self.partitions[index];
        let name = partition_device_name(&self.disk, &partition.id);
        let device = self.device_root.join(&name);
        let image = self.image_file(partition);

        self.set_status(index, Status::Running);
        let mut reclaimed = false;
        loop {
            if !device.exists() {
                self.set_status(index, Status::Error);
                return Err(Error::DeviceUnavailable(device.display().to_string()));
            }

            let runner = self.runner_for(index, mode, partition, &device, &image);
            *self.current.lock().unwrap() = Some(runner.clone());
            let result = runner.run().await;
            match result {
                Ok(0) => {
                    self.set_status(index, Status::Finished);
                    return Ok(());
                }
                Ok(code) => {
                    self.set_status(index, Status::Error);
                    error!(partition = %name, code, "imaging did not finish successfully");
                    return Err(Error::ImagingExit(code));
                }
                Err(e) if e.is_space_exhausted() && mode == Mode::Backup && !reclaimed => {
                    reclaimed = true;
                    self.recover_space(index, &e).await?;
                    // retry the same partition exactly once
                }
                Err(e) => {
                    self.set_status(index, Status::Error);
                    error!(partition = %name, error = %e, "imaging failed");
                    return Err(e);
                }
            }
        }
    }

    /// Space-exhaustion recovery: purge old backups to cover the shortfall
    /// and drop the partial image so the retry starts clean.
    async fn recover_space(&self, index: usize, cause: &Error) -> Result<()> {
        let Error::Fault(ImagingFault::SpaceExhausted(message)) = cause else {
            unreachable!("recover_space called for a non-space fault");
        };
        let Some(reclaimer) = &self.reclaimer else {
            self.set_status(index, Status::Error);
            return Err(Error::Fault(ImagingFault::SpaceExhausted(message.clone())));
        };
        warn!(partition = index, "destination out of space; purging old backups");
        if let Err(e) = reclaimer.handle_space_error(message).await {
            self.set_status(index, Status::Error);
            return Err(e);
        }
        let target = self.written_target(&self.partitions[index]);
        if target.exists() {
            tokio::fs::remove_file(&target).await?;
        }
        Ok(())
    }

    fn runner_for(
        &self,
        index: usize,
        mode: Mode,
        partition: &Partition,
        device: &Path,
        image: &Path,
    ) -> Runner {
        let device = device.display().to_string();
        let image = image.display().to_string();
        let parser: Box<dyn OutputParser> = Box::new(PartcloneParser::new(
            self.board.clone(),
            index,
        ));
        let argv = match mode {
            Mode::Backup if self.opts.compress => self.compressed_backup_command(
                &device,
                &self.container_file(partition).display().to_string(),
                &image_file_name(partition),
                &partition.file_system,
            ),
            Mode::Backup => self.backup_command(&device, &image, &partition.file_system),
            Mode::Restore => self.restore_command(&image, &device, &partition.file_system),
        };
        debug!(command = ?argv, "starting imaging tool");
        Runner::new(argv, parser).with_pty()
    }

    fn set_status(&self, index: usize, status: Status) {
        self.board.lock().unwrap()[index].status = status;
    }

    fn image_file(&self, partition: &Partition) -> PathBuf {
        self.backup_dir.join(image_file_name(partition))
    }

    fn container_file(&self, partition: &Partition) -> PathBuf {
        self.backup_dir.join(format!(
            "{PARTITION_FILE_PREFIX}{}{CONTAINER_FILE_SUFFIX}",
            partition.id
        ))
    }

    /// The file a backup run actually writes: the container when compressing,
    /// the raw image otherwise.
    fn written_target(&self, partition: &Partition) -> PathBuf {
        if self.opts.compress {
            self.container_file(partition)
        } else {
            self.image_file(partition)
        }
    }

    /// Generic part of the partclone invocation, shared by backup and
    /// restore: tool, validation switches, source and destination.
    fn base_command(&self, source: &str, target: &str, fs: &str) -> Vec<String> {
        let mut argv = vec![tool_for_fs(fs).to_string()];
        argv.extend(self.option_flags());
        argv.push("-s".into());
        argv.push(source.into());
        argv.push(if self.opts.overwrite { "-O" } else { "-o" }.into());
        argv.push(target.into());
        argv
    }

    pub(crate) fn backup_command(&self, source: &str, target: &str, fs: &str) -> Vec<String> {
        let mut argv = self.base_command(source, target, fs);
        argv.push("-c".into());
        argv
    }

    pub(crate) fn restore_command(&self, source: &str, target: &str, fs: &str) -> Vec<String> {
        let mut argv = self.base_command(source, target, fs);
        argv.push("-r".into());
        argv
    }

    /// Compressed backup: mksquashfs builds the container from a pseudo-file
    /// whose content is produced by partclone writing the image to stdout.
    pub(crate) fn compressed_backup_command(
        &self,
        source: &str,
        container: &str,
        image_name: &str,
        fs: &str,
    ) -> Vec<String> {
        let inner = self.backup_command(source, "-", fs).join(" ");
        vec![
            "mksquashfs".into(),
            "/dev/null".into(),
            container.into(),
            "-noappend".into(),
            "-no-progress".into(),
            "-p".into(),
            format!("{image_name} f 444 root root {inner}"),
        ]
    }

    fn option_flags(&self) -> Vec<String> {
        let mut flags = Vec::new();
        if self.opts.rescue {
            flags.push("-R".into());
        }
        if !self.opts.space_check {
            flags.push("-C".into());
        }
        if !self.opts.fs_check {
            flags.push("-I".into());
        }
        if !self.opts.crc_check {
            flags.push("-i".into());
        }
        if self.opts.force {
            flags.push("-F".into());
        }
        if self.opts.refresh_delay > 0 {
            flags.push("-f".into());
            flags.push(self.opts.refresh_delay.to_string());
        }
        flags
    }
}

fn image_file_name(partition: &Partition) -> String {
    format!(
        "{PARTITION_FILE_PREFIX}{}{PARTITION_FILE_SUFFIX}",
        partition.id
    )
}

/// Classify one chunk of tool output. Specific patterns first; the generic
/// "error" catch-all stays last because it is low-confidence.
pub(crate) fn classify_output(chunk: &str) -> Result<()> {
    if chunk.contains("destination doesn't have enough free space") {
        return Err(ImagingFault::SpaceExhausted(chunk.to_string()).into());
    }
    if chunk.contains("file exists (17)") {
        return Err(ImagingFault::AlreadyExists.into());
    }
    if chunk.contains("buffer overflow detected") {
        return Err(ImagingFault::ToolFault.into());
    }
    if chunk.contains("failed to read file") || chunk.contains("use the --rescue option") {
        return Err(ImagingFault::UnreadableSource.into());
    }
    if chunk.contains("or fix it by fsck") {
        return Err(ImagingFault::NeedsRepair.into());
    }
    if chunk.contains("use option -c to disable size checking") {
        return Err(ImagingFault::SizeMismatch.into());
    }
    if chunk.contains("error") {
        warn!(chunk, "unclassified tool error line");
        return Err(ImagingFault::ToolError.into());
    }
    Ok(())
}

/// Parses partclone's terminal output: progress lines are of the form
/// "Elapsed: 00:01:02, Remaining: 00:00:30, ..., Completed: 45.20%", and only
/// start after the "File system: ..." banner.
struct PartcloneParser {
    board: ProgressBoard,
    index: usize,
    in_progress_block: bool,
}

impl PartcloneParser {
    fn new(board: ProgressBoard, index: usize) -> Self {
        Self {
            board,
            index,
            in_progress_block: false,
        }
    }
}

impl OutputParser for PartcloneParser {
    fn parse(&mut self, data: &str) -> Result<()> {
        let cleaned = data.replace("\x1b[A", "").to_lowercase();
        let trimmed = cleaned.trim();
        if !trimmed.contains("remaining:") && !trimmed.contains("complete") {
            debug!("{trimmed}");
        }
        classify_output(&cleaned)?;

        if !self.in_progress_block {
            if cleaned.contains("file system:") {
                self.in_progress_block = true;
            }
            return Ok(());
        }

        let mut board = self.board.lock().unwrap();
        let entry = &mut board[self.index];
        for item in cleaned.split(',') {
            let Some((key, value)) = item.split_once(':') else {
                continue;
            };
            let value = value.trim();
            match key.trim() {
                "elapsed" => entry.elapsed = value.to_string(),
                "remaining" => entry.remaining = value.to_string(),
                "completed" => {
                    if let Ok(percent) = value.trim_end_matches('%').parse::<f64>() {
                        entry.completed = percent;
                    }
                }
                _ => {}
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::layout::Layout;

    fn set_with(partitions: &[(&str, &str, u64)]) -> BackupSet {
        let mut set = BackupSet::new("job1", "node0", Path::new("/backup"));
        set.disk_layout = Layout::Mbr;
        for (name, fs, size) in partitions {
            set.add_partition(name, fs, *size);
        }
        set
    }

    fn imager(opts: ImagingOptions) -> PartitionImage {
        let set = set_with(&[("sda1", "ext4", 1024), ("sda2", "oddfs", 2048)]);
        PartitionImage::new("sda", Path::new("/backup/job1"), &set, opts, None)
    }

    #[test]
    fn unknown_filesystems_fall_back_to_raw_copy() {
        assert_eq!(tool_for_fs("ext4"), "partclone.ext4");
        assert_eq!(tool_for_fs("hfs"), "partclone.dd");
        assert_eq!(tool_for_fs("zfs"), "partclone.dd");
        assert_eq!(tool_for_fs(""), "partclone.dd");
    }

    #[test]
    fn partition_device_names_follow_kernel_convention() {
        assert_eq!(partition_device_name("sda", "1"), "sda1");
        assert_eq!(partition_device_name("nvme0n1", "12"), "nvme0n1p12");
        assert_eq!(partition_device_name("mmcblk0", "3"), "mmcblk0p3");
    }

    #[test]
    fn backup_command_shape() {
        let imager = imager(ImagingOptions::default());
        let argv = imager.backup_command("/dev/sda1", "/backup/job1/part1.img", "ext4");
        assert_eq!(
            argv,
            vec![
                "partclone.ext4",
                "-f",
                "5",
                "-s",
                "/dev/sda1",
                "-o",
                "/backup/job1/part1.img",
                "-c"
            ]
        );
    }

    #[test]
    fn restore_command_uses_restore_flag() {
        let imager = imager(ImagingOptions::default());
        let argv = imager.restore_command("/backup/job1/part1.img", "/dev/sda1", "ext4");
        assert_eq!(argv.last().unwrap(), "-r");
        assert_eq!(argv[0], "partclone.ext4");
    }

    #[test]
    fn zero_refresh_delay_omits_interval_flag() {
        let imager = imager(ImagingOptions {
            refresh_delay: 0,
            ..Default::default()
        });
        let argv = imager.backup_command("/dev/sda1", "/backup/job1/part1.img", "ext4");
        assert!(!argv.contains(&"-f".to_string()));
    }

    #[test]
    fn positive_refresh_delay_appears_exactly_once() {
        let imager = imager(ImagingOptions {
            refresh_delay: 7,
            ..Default::default()
        });
        let argv = imager.backup_command("/dev/sda1", "/backup/job1/part1.img", "ext4");
        assert_eq!(argv.iter().filter(|a| *a == "-f").count(), 1);
        let pos = argv.iter().position(|a| a == "-f").unwrap();
        assert_eq!(argv[pos + 1], "7");
    }

    #[test]
    fn disabled_checks_emit_skip_switches() {
        let imager = imager(ImagingOptions {
            rescue: true,
            space_check: false,
            fs_check: false,
            crc_check: false,
            force: true,
            refresh_delay: 0,
            ..Default::default()
        });
        let argv = imager.backup_command("/dev/sda1", "/backup/job1/part1.img", "ext4");
        for flag in ["-R", "-C", "-I", "-i", "-F"] {
            assert!(argv.contains(&flag.to_string()), "missing {flag}");
        }
    }

    #[test]
    fn overwrite_switches_output_flag() {
        let imager = imager(ImagingOptions {
            overwrite: true,
            ..Default::default()
        });
        let argv = imager.backup_command("/dev/sda1", "/backup/job1/part1.img", "ext4");
        assert!(argv.contains(&"-O".to_string()));
        assert!(!argv.contains(&"-o".to_string()));
    }

    #[test]
    fn compressed_backup_wraps_partclone_in_mksquashfs() {
        let imager = imager(ImagingOptions {
            compress: true,
            ..Default::default()
        });
        let argv = imager.compressed_backup_command(
            "/dev/sda1",
            "/backup/job1/part1.sqfs",
            "part1.img",
            "ext4",
        );
        assert_eq!(argv[0], "mksquashfs");
        assert_eq!(argv[2], "/backup/job1/part1.sqfs");
        let pseudo = argv.last().unwrap();
        assert!(pseudo.starts_with("part1.img f 444 root root partclone.ext4"));
        assert!(pseudo.contains("-o -"));
    }

    #[test]
    fn classification_is_specific_before_generic() {
        // lines that contain "error" but match a specific pattern first
        let err = classify_output(
            "error exit - destination doesn't have enough free space: 10mb < 20mb",
        )
        .unwrap_err();
        assert!(matches!(
            err,
            Error::Fault(ImagingFault::SpaceExhausted(_))
        ));

        let err = classify_output("open target error: file exists (17)").unwrap_err();
        assert!(matches!(err, Error::Fault(ImagingFault::AlreadyExists)));

        let err = classify_output("some other error happened").unwrap_err();
        assert!(matches!(err, Error::Fault(ImagingFault::ToolError)));
    }

    #[test]
    fn classification_covers_the_full_taxonomy() {
        let cases: &[(&str, ImagingFault)] = &[
            ("*** buffer overflow detected ***:", ImagingFault::ToolFault),
            ("failed to read file", ImagingFault::UnreadableSource),
            ("use the --rescue option", ImagingFault::UnreadableSource),
            ("or fix it by fsck", ImagingFault::NeedsRepair),
            (
                "use option -c to disable size checking(dangerous)",
                ImagingFault::SizeMismatch,
            ),
        ];
        for (line, expected) in cases {
            match classify_output(line).unwrap_err() {
                Error::Fault(fault) => assert_eq!(&fault, expected, "line: {line}"),
                other => panic!("unexpected error {other:?} for line: {line}"),
            }
        }
        assert!(classify_output("Elapsed: 00:00:01, Remaining: 00:00:01").is_ok());
    }

    #[test]
    fn progress_lines_update_the_board() {
        let imager = imager(ImagingOptions::default());
        let mut parser = PartcloneParser::new(imager.board.clone(), 0);
        // progress is ignored until the filesystem banner
        parser
            .parse("Partclone v0.3.32\nFile system:  EXTFS\n")
            .unwrap();
        parser
            .parse("Elapsed: 00:00:10, Remaining: 00:00:30, Completed:  25.00%,  12.34MB/min,\n")
            .unwrap();
        let board = imager.status();
        assert_eq!(board[0].elapsed, "00:00:10");
        assert_eq!(board[0].remaining, "00:00:30");
        assert!((board[0].completed - 25.0).abs() < f64::EPSILON);
        // second partition untouched
        assert_eq!(board[1].completed, 0.0);
    }

    #[test]
    fn progress_before_banner_is_ignored() {
        let imager = imager(ImagingOptions::default());
        let mut parser = PartcloneParser::new(imager.board.clone(), 0);
        parser
            .parse("Elapsed: 00:00:10, Remaining: 00:00:30, Completed: 25.00%\n")
            .unwrap();
        assert_eq!(imager.status()[0].completed, 0.0);
    }

    #[test]
    fn board_starts_pending_per_partition() {
        let imager = imager(ImagingOptions::default());
        let board = imager.status();
        assert_eq!(board.len(), 2);
        assert_eq!(board[0].name, "sda1");
        assert_eq!(board[1].name, "sda2");
        assert!(board.iter().all(|p| p.status == Status::Pending));
    }
}
