//! Job controllers: the backup, restoration and mount state machines.
//!
//! A controller is constructed per job. Construction validates synchronously
//! and fails fast; `run()` then launches the multi-step sequence on a
//! background task. Callers poll `status()` until the job reaches a terminal
//! state, or `kill()` it. The status lives under a mutex owned by the
//! controller, so polling never races an in-place mutation.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::context::AppContext;

use super::backupset::{BackupSet, PARTITION_FILE_PREFIX, Status};
use super::diskdetect;
use super::error::{Error, Result};
use super::imaging::{ImagingOptions, PartitionImage, PartitionProgress};
use super::layout::{DiskLayout, Layout};
use super::pool::NbdNode;
use super::reclaim::delete_backup;
use super::sqfs::SquashfsWrapper;

const CANCELLED_MESSAGE: &str = "job cancelled by the user";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    Backup,
    Restoration,
    Mount,
}

/// Transient per-job status; created at controller construction, discarded
/// with the controller.
#[derive(Debug, Clone, Serialize)]
pub struct JobStatus {
    pub id: String,
    pub operation: Operation,
    pub status: Status,
    pub path: String,
    pub layout: String,
    pub partitions: Vec<PartitionProgress>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub error_msg: Option<String>,
}

/// Mutex-owned job status. The first error recorded wins: a cancellation
/// message is not overwritten by the failure it provokes.
pub(crate) struct StatusCell {
    inner: Mutex<JobStatus>,
}

impl StatusCell {
    fn new(id: &str, operation: Operation) -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(JobStatus {
                id: id.to_string(),
                operation,
                status: Status::Pending,
                path: String::new(),
                layout: String::new(),
                partitions: Vec::new(),
                start_time: None,
                end_time: None,
                error_msg: None,
            }),
        })
    }

    fn snapshot(&self) -> JobStatus {
        self.inner.lock().unwrap().clone()
    }

    fn begin(&self, path: &Path, layout: Layout) {
        let mut status = self.inner.lock().unwrap();
        if status.status.may_transition_to(Status::Running) {
            status.status = Status::Running;
        }
        status.path = path.display().to_string();
        status.layout = layout.to_string();
        status.start_time = Some(Utc::now());
    }

    fn finish(&self) {
        let mut status = self.inner.lock().unwrap();
        if status.status.may_transition_to(Status::Finished) {
            status.status = Status::Finished;
        }
    }

    fn set_error(&self, message: &str) {
        let mut status = self.inner.lock().unwrap();
        if status.status != Status::Error {
            status.status = Status::Error;
            status.error_msg = Some(message.to_string());
        }
    }

    fn end(&self) {
        self.inner.lock().unwrap().end_time = Some(Utc::now());
    }

    fn current(&self) -> Status {
        self.inner.lock().unwrap().status
    }
}

/// The common face of all job controllers.
#[async_trait]
pub trait JobController: Send + Sync {
    /// Launch the job's sequence on a background task.
    fn run(&self);

    /// Current status with live partition progress folded in.
    fn status(&self) -> JobStatus;

    /// Cancel the job: stop the in-flight imaging process and mark the job
    /// errored. Advisory; partitions already completed are not rolled back.
    async fn kill(&self);
}

/// Validation shared by backup construction: a prior record may only be
/// replaced when soft-deleted, and only by the node that owns it.
pub(crate) fn ensure_replaceable(previous: &BackupSet, node: &str) -> Result<()> {
    if !previous.deleted {
        return Err(Error::BackupExists(previous.id.clone()));
    }
    if previous.node != node {
        return Err(Error::WrongNode {
            id: previous.id.clone(),
            node: previous.node.clone(),
        });
    }
    Ok(())
}

async fn dir_size(dir: &Path) -> Result<u64> {
    let mut total = 0;
    let mut entries = tokio::fs::read_dir(dir).await?;
    while let Some(entry) = entries.next_entry().await? {
        total += entry.metadata().await?.len();
    }
    Ok(total)
}

/// Runs a complete backup: layout capture, then partition imaging, with the
/// record persisted before and after.
pub struct BackupController {
    ctx: AppContext,
    backup_dir: PathBuf,
    layout: Arc<DiskLayout>,
    imager: Arc<PartitionImage>,
    set: Arc<Mutex<BackupSet>>,
    status: Arc<StatusCell>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for BackupController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackupController")
            .field("backup_dir", &self.backup_dir)
            .finish_non_exhaustive()
    }
}

impl BackupController {
    pub async fn new(
        ctx: &AppContext,
        disk: &str,
        backup_id: &str,
        opts: ImagingOptions,
    ) -> Result<Self> {
        let node = ctx.config.node_name.clone();
        let backup_dir = ctx.config.backup_path.join(backup_id);

        if let Some(mut previous) = ctx.store.get(backup_id).await? {
            ensure_replaceable(&previous, &node)?;
            if opts.overwrite && !previous.purged {
                delete_backup(&ctx.store, &node, &mut previous).await?;
            }
        } else if backup_dir.exists() && !opts.overwrite {
            return Err(Error::BackupExists(backup_id.to_string()));
        }

        let layout = DiskLayout::detect(disk, &backup_dir, opts.overwrite).await?;
        let details = diskdetect::disk_details(disk).await?;

        let mut set = BackupSet::new(backup_id, &node, &ctx.config.backup_path);
        set.disk_layout = layout.layout();
        set.disk_size = details.size;
        set.compressed = opts.compress;
        for partition in &details.partitions {
            set.add_partition(&partition.name, &partition.fs_type, partition.size);
        }
        // the PENDING record exists before any imaging starts
        ctx.store.upsert(&set).await?;

        let imager = PartitionImage::new(
            disk,
            &backup_dir,
            &set,
            opts,
            Some(ctx.reclaimer.clone()),
        );

        Ok(Self {
            ctx: ctx.clone(),
            backup_dir,
            layout: Arc::new(layout),
            imager: Arc::new(imager),
            set: Arc::new(Mutex::new(set)),
            status: StatusCell::new(backup_id, Operation::Backup),
            task: Mutex::new(None),
        })
    }

    async fn sequence(
        ctx: AppContext,
        backup_dir: PathBuf,
        layout: Arc<DiskLayout>,
        imager: Arc<PartitionImage>,
        set: Arc<Mutex<BackupSet>>,
        status: Arc<StatusCell>,
    ) {
        // the persisted record mirrors the job state; a record left in
        // running is how a crashed job is recognised at the next startup
        let running = {
            let mut set = set.lock().unwrap();
            set.status = Status::Running;
            set.clone()
        };
        if let Err(e) = ctx.store.upsert(&running).await {
            error!(backup = %running.id, error = %e, "failed to persist the running backup record");
        }

        let result =
            Self::execute(&backup_dir, &layout, &imager, &set, &status).await;
        if let Err(e) = result {
            error!(error = %e, "backup failed");
            status.set_error(&e.to_string());
        }
        status.end();

        // guaranteed completion step: the record always reflects the outcome
        let final_status = status.current();
        let size = dir_size(&backup_dir).await.unwrap_or(0);
        let snapshot = {
            let mut set = set.lock().unwrap();
            set.status = final_status;
            set.backup_size = size;
            set.clone()
        };
        if let Err(e) = ctx.store.upsert(&snapshot).await {
            error!(backup = %snapshot.id, error = %e, "failed to persist final backup record");
        }
    }

    async fn execute(
        backup_dir: &Path,
        layout: &DiskLayout,
        imager: &PartitionImage,
        set: &Mutex<BackupSet>,
        status: &StatusCell,
    ) -> Result<()> {
        let layout_kind = set.lock().unwrap().disk_layout;
        status.begin(backup_dir, layout_kind);
        tokio::fs::create_dir_all(backup_dir).await?;
        layout.backup_layout().await?;
        imager.backup().await?;
        status.finish();
        info!(path = %backup_dir.display(), "backup finished");
        Ok(())
    }
}

#[async_trait]
impl JobController for BackupController {
    fn run(&self) {
        let handle = tokio::spawn(Self::sequence(
            self.ctx.clone(),
            self.backup_dir.clone(),
            self.layout.clone(),
            self.imager.clone(),
            self.set.clone(),
            self.status.clone(),
        ));
        *self.task.lock().unwrap() = Some(handle);
    }

    fn status(&self) -> JobStatus {
        let mut snapshot = self.status.snapshot();
        snapshot.partitions = self.imager.status();
        snapshot
    }

    async fn kill(&self) {
        self.status.set_error(CANCELLED_MESSAGE);
        self.imager.kill().await;
    }
}

/// Runs a complete restoration: layout restore, then partition imaging in
/// restore mode, with the compressed container mounted around it when needed.
pub struct RestorationController {
    set: BackupSet,
    layout: Arc<DiskLayout>,
    imager: Arc<PartitionImage>,
    status: Arc<StatusCell>,
    sqfs: Arc<tokio::sync::Mutex<Option<SquashfsWrapper>>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for RestorationController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RestorationController")
            .field("set", &self.set.id)
            .finish_non_exhaustive()
    }
}

impl RestorationController {
    pub async fn new(
        ctx: &AppContext,
        disk: &str,
        backup_id: &str,
        opts: ImagingOptions,
    ) -> Result<Self> {
        let set = ctx
            .store
            .get(backup_id)
            .await?
            .ok_or_else(|| Error::NotFound(backup_id.to_string()))?;
        if set.node != ctx.config.node_name {
            return Err(Error::WrongNode {
                id: set.id.clone(),
                node: set.node.clone(),
            });
        }

        let layout =
            DiskLayout::with_layout(disk, &set.backup_path, set.disk_layout, opts.overwrite);
        let imager = PartitionImage::new(disk, &set.backup_path, &set, opts, None);

        Ok(Self {
            status: StatusCell::new(backup_id, Operation::Restoration),
            layout: Arc::new(layout),
            imager: Arc::new(imager),
            set,
            sqfs: Arc::new(tokio::sync::Mutex::new(None)),
            task: Mutex::new(None),
        })
    }

    async fn sequence(
        set: BackupSet,
        layout: Arc<DiskLayout>,
        imager: Arc<PartitionImage>,
        status: Arc<StatusCell>,
        sqfs: Arc<tokio::sync::Mutex<Option<SquashfsWrapper>>>,
    ) {
        let result = Self::execute(&set, &layout, &imager, &status, &sqfs).await;
        if let Err(e) = result {
            error!(error = %e, "restoration failed");
            status.set_error(&e.to_string());
            // stop the in-flight imaging process before cleanup
            imager.kill().await;
        }
        status.end();
        let mut sqfs = sqfs.lock().await;
        if let Some(wrapper) = sqfs.as_mut() {
            if wrapper.mounted() {
                if let Err(e) = wrapper.unmount().await {
                    error!(error = %e, "failed to unmount the compressed container");
                }
            }
        }
    }

    async fn execute(
        set: &BackupSet,
        layout: &DiskLayout,
        imager: &PartitionImage,
        status: &StatusCell,
        sqfs: &tokio::sync::Mutex<Option<SquashfsWrapper>>,
    ) -> Result<()> {
        status.begin(&set.backup_path, set.disk_layout);
        if set.compressed {
            let mut wrapper = SquashfsWrapper::new(set);
            wrapper.mount().await?;
            *sqfs.lock().await = Some(wrapper);
        }
        layout.restore_layout().await?;
        imager.restore().await?;
        status.finish();
        info!(backup = %set.id, "restoration finished");
        Ok(())
    }
}

#[async_trait]
impl JobController for RestorationController {
    fn run(&self) {
        let handle = tokio::spawn(Self::sequence(
            self.set.clone(),
            self.layout.clone(),
            self.imager.clone(),
            self.status.clone(),
            self.sqfs.clone(),
        ));
        *self.task.lock().unwrap() = Some(handle);
    }

    fn status(&self) -> JobStatus {
        let mut snapshot = self.status.snapshot();
        snapshot.partitions = self.imager.status();
        snapshot
    }

    async fn kill(&self) {
        self.status.set_error(CANCELLED_MESSAGE);
        self.imager.kill().await;
    }
}

/// Mounts every partition image of a backup on a pool node. Rolls back the
/// acquired nodes, the mount directory and the compressed container when any
/// part of the sequence fails.
pub struct MountController {
    ctx: AppContext,
    set: BackupSet,
    mount_path: PathBuf,
    nodes: Arc<tokio::sync::Mutex<Vec<NbdNode>>>,
    sqfs: Arc<tokio::sync::Mutex<Option<SquashfsWrapper>>>,
    status: Arc<StatusCell>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl MountController {
    pub async fn new(ctx: &AppContext, backup_id: &str) -> Result<Self> {
        let set = ctx
            .store
            .get(backup_id)
            .await?
            .ok_or_else(|| Error::NotFound(backup_id.to_string()))?;
        let mount_path = ctx.config.mount_path.join(&set.id);
        Ok(Self {
            ctx: ctx.clone(),
            mount_path,
            status: StatusCell::new(backup_id, Operation::Mount),
            set,
            nodes: Arc::new(tokio::sync::Mutex::new(Vec::new())),
            sqfs: Arc::new(tokio::sync::Mutex::new(None)),
            task: Mutex::new(None),
        })
    }

    /// Mount the whole backup; on any failure the partial state is rolled
    /// back before the error is returned.
    pub async fn mount(&self) -> Result<()> {
        match self.mount_inner().await {
            Ok(()) => Ok(()),
            Err(e) => {
                self.status.set_error(&e.to_string());
                self.rollback().await;
                Err(e)
            }
        }
    }

    async fn mount_inner(&self) -> Result<()> {
        self.status.begin(&self.mount_path, self.set.disk_layout);
        if self.set.compressed {
            let mut wrapper = SquashfsWrapper::new(&self.set);
            wrapper.mount().await?;
            *self.sqfs.lock().await = Some(wrapper);
        }
        tokio::fs::create_dir_all(&self.mount_path).await?;

        for partition in &self.set.partitions {
            let mut node = self.ctx.pool.acquire()?;
            let image = self.set.image_path(partition);
            let image_mount = self
                .mount_path
                .join(format!("{PARTITION_FILE_PREFIX}{}", partition.id));
            tokio::fs::create_dir_all(&image_mount).await?;
            node.mount(&image, &partition.file_system, &image_mount).await;
            self.nodes.lock().await.push(node);
        }

        if self.nodes.lock().await.iter().any(|n| n.error()) {
            return Err(Error::MountFailed(self.set.id.clone()));
        }
        info!(backup = %self.set.id, "backup mounted");
        Ok(())
    }

    /// Reverse the mount sequence unconditionally.
    pub async fn unmount(&self) -> Result<()> {
        self.release_nodes().await;
        if self.mount_path.exists() {
            tokio::fs::remove_dir_all(&self.mount_path).await?;
        }
        self.unmount_container().await;
        Ok(())
    }

    async fn rollback(&self) {
        self.release_nodes().await;
        if self.mount_path.exists() {
            let _ = tokio::fs::remove_dir_all(&self.mount_path).await;
        }
        self.unmount_container().await;
    }

    async fn release_nodes(&self) {
        let mut nodes = self.nodes.lock().await;
        for node in nodes.drain(..) {
            self.ctx.pool.release(node).await;
        }
    }

    async fn unmount_container(&self) {
        let mut sqfs = self.sqfs.lock().await;
        if let Some(wrapper) = sqfs.as_mut() {
            if wrapper.mounted() {
                if let Err(e) = wrapper.unmount().await {
                    error!(error = %e, "failed to unmount the compressed container");
                }
            }
        }
    }
}

#[async_trait]
impl JobController for MountController {
    fn run(&self) {
        let controller = MountController {
            ctx: self.ctx.clone(),
            set: self.set.clone(),
            mount_path: self.mount_path.clone(),
            nodes: self.nodes.clone(),
            sqfs: self.sqfs.clone(),
            status: self.status.clone(),
            task: Mutex::new(None),
        };
        let handle = tokio::spawn(async move {
            let _ = controller.mount().await;
        });
        *self.task.lock().unwrap() = Some(handle);
    }

    fn status(&self) -> JobStatus {
        self.status.snapshot()
    }

    // No imaging process to stop; marking the job errored is all a mount
    // cancellation can do.
    async fn kill(&self) {
        self.status.set_error(CANCELLED_MESSAGE);
    }
}
