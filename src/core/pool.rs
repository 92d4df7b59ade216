//! Bounded pool of NBD devices used to mount partition images.
//!
//! Nodes are discovered once at startup. A node is lent to exactly one mount
//! operation at a time; `acquire` fails fast when the pool is empty instead
//! of blocking, so a mount request can never deadlock waiting for devices.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::error::{Error, Result};
use super::runner::{BUSY_WAIT_INTERVAL, Capture, RunState, Runner};

const DEVICE_ROOT: &str = "/dev";
const NBD_DEVICE_PREFIX: &str = "nbd";

/// One virtual block-device handle.
///
/// The mount helper keeps running for as long as the image is attached, so it
/// is supervised on its own task; the node only samples its state.
pub struct NbdNode {
    device: PathBuf,
    mountpoint: Option<PathBuf>,
    error: Arc<AtomicBool>,
    unmounting: Arc<AtomicBool>,
    runner: Option<Runner>,
    task: Option<JoinHandle<()>>,
}

impl NbdNode {
    fn new(device: PathBuf) -> Self {
        Self {
            device,
            mountpoint: None,
            error: Arc::new(AtomicBool::new(false)),
            unmounting: Arc::new(AtomicBool::new(false)),
            runner: None,
            task: None,
        }
    }

    pub fn device(&self) -> &Path {
        &self.device
    }

    /// True when the mount helper failed to start or exited unexpectedly.
    pub fn error(&self) -> bool {
        self.error.load(Ordering::Relaxed)
    }

    /// Attach an image file read-only on this device and mount it.
    ///
    /// The helper is started asynchronously; its start naturally races our
    /// status check, so we busy-wait the short startup window and then sample
    /// whether the helper kept running. A helper that exited already is a
    /// failed mount.
    pub async fn mount(&mut self, image: &Path, fs: &str, mountpoint: &Path) {
        self.mountpoint = Some(mountpoint.to_path_buf());
        let argv = vec![
            "imagemount".to_string(),
            "-f".into(),
            image.display().to_string(),
            "-d".into(),
            self.device.display().to_string(),
            "-m".into(),
            mountpoint.display().to_string(),
            "-t".into(),
            fs.to_string(),
            "-r".into(),
            "-D".into(),
        ];
        let runner = Runner::new(argv, Box::new(Capture::default()));
        self.runner = Some(runner.clone());

        let error = self.error.clone();
        let unmounting = self.unmounting.clone();
        let supervised = runner.clone();
        self.task = Some(tokio::spawn(async move {
            let ok = matches!(supervised.run().await, Ok(0));
            if !ok && !unmounting.load(Ordering::Relaxed) {
                error.store(true, Ordering::Relaxed);
            }
        }));

        // a helper that cannot even spawn never leaves NotStarted; the
        // supervisor flags that as an error, which also ends this wait
        while runner.poll() == RunState::NotStarted && !self.error() {
            tokio::time::sleep(BUSY_WAIT_INTERVAL).await;
        }
        if runner.poll() != RunState::Running {
            self.error.store(true, Ordering::Relaxed);
        }
        debug!(device = %self.device.display(), error = self.error(), "mount helper started");
    }

    /// Detach the image: stop the mount helper if it is still up, then issue
    /// the unmount command. Idempotent.
    pub async fn unmount(&mut self) {
        if let Some(task) = self.task.take() {
            self.unmounting.store(true, Ordering::Relaxed);
            if let Some(runner) = &self.runner {
                runner.kill().await;
            }
            let _ = task.await;
            self.unmounting.store(false, Ordering::Relaxed);
        }
        if let Some(mountpoint) = &self.mountpoint {
            let umount = Runner::new(
                vec!["umount".to_string(), mountpoint.display().to_string()],
                Box::new(Capture::default()),
            );
            if !matches!(umount.run().await, Ok(0)) {
                warn!(mountpoint = %mountpoint.display(), "unmount reported failure");
            }
        }
    }

    /// Unmount and clear all state so the node can be lent out again.
    async fn reset(&mut self) {
        self.unmount().await;
        self.runner = None;
        self.mountpoint = None;
        self.error.store(false, Ordering::Relaxed);
    }
}

struct PoolInner {
    free: Vec<NbdNode>,
    lent: usize,
}

/// Process-wide pool of NBD nodes. All list mutations go through one mutex;
/// a lent node is owned exclusively by its mount operation until released.
pub struct NbdPool {
    inner: Mutex<PoolInner>,
}

impl NbdPool {
    pub fn new(devices: Vec<PathBuf>) -> Self {
        let free = devices.into_iter().map(NbdNode::new).collect();
        Self {
            inner: Mutex::new(PoolInner { free, lent: 0 }),
        }
    }

    /// Scan /dev for NBD devices and build the pool from them.
    pub fn discover() -> std::io::Result<Self> {
        let mut devices = Vec::new();
        for entry in std::fs::read_dir(DEVICE_ROOT)? {
            let entry = entry?;
            if entry
                .file_name()
                .to_string_lossy()
                .starts_with(NBD_DEVICE_PREFIX)
            {
                devices.push(entry.path());
            }
        }
        devices.sort();
        info!(nodes = devices.len(), "block-device pool initialised");
        Ok(Self::new(devices))
    }

    pub fn free_count(&self) -> usize {
        self.inner.lock().unwrap().free.len()
    }

    /// Take one node out of the pool. Fails fast with `PoolExhausted` when
    /// none are free; callers are expected to release other mounts and retry.
    pub fn acquire(&self) -> Result<NbdNode> {
        let mut inner = self.inner.lock().unwrap();
        match inner.free.pop() {
            Some(node) => {
                inner.lent += 1;
                Ok(node)
            }
            None => Err(Error::PoolExhausted),
        }
    }

    /// Reset a node (unmount, clear flags) and return it to the free list.
    pub async fn release(&self, mut node: NbdNode) {
        node.reset().await;
        let mut inner = self.inner.lock().unwrap();
        inner.lent = inner.lent.saturating_sub(1);
        inner.free.push(node);
    }
}
