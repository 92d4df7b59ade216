pub mod backupset;
pub mod controller;
pub mod diskdetect;
pub mod error;
pub mod imaging;
pub mod layout;
pub mod pool;
pub mod reclaim;
pub mod runner;
pub mod sqfs;

pub use backupset::{BackupSet, Partition, Status};
pub use controller::{
    BackupController, JobController, JobStatus, MountController, Operation, RestorationController,
};
pub use diskdetect::{DiskInfo, PartitionInfo};
pub use error::{Error, ImagingFault, Result};
pub use imaging::{ImagingOptions, PartitionImage, PartitionProgress};
pub use layout::{DiskLayout, Layout};
pub use pool::{NbdNode, NbdPool};
pub use reclaim::SpaceReclaimer;
pub use runner::{BUSY_WAIT_INTERVAL, Runner};
