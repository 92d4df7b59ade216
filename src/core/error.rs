//! Error taxonomy for the imaging node.
//!
//! Faults classified from imaging-tool output keep their kind all the way to
//! the caller so the API layer can tell a retryable space problem from a
//! terminal one. Only the rendering boundary is allowed to flatten these to
//! strings.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Faults recognised in the live output of the imaging tool.
///
/// The messages are operator-facing and mirror what the tool is actually
/// complaining about.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ImagingFault {
    /// Carries the raw tool line so the space reclaimer can parse the
    /// "have < need" byte figures out of it.
    #[error("not enough free space on the destination disk: {0}")]
    SpaceExhausted(String),

    #[error("the image file already exists; select the overwrite option to replace the backup")]
    AlreadyExists,

    #[error("the imaging software failed internally; check that the source disk is still present in the system")]
    ToolFault,

    #[error("the source cannot be read; if the medium has I/O errors, restart with the rescue option")]
    UnreadableSource,

    #[error("a file system on the source disk is marked as dirty; repair it or disable the filesystem check")]
    NeedsRepair,

    #[error("the target disk is smaller than the original; use a larger disk or disable size checking")]
    SizeMismatch,

    #[error("the imaging software reported an unrecognised error")]
    ToolError,
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("cannot detect the partition layout of '{0}'")]
    Detection(String),

    #[error("backup '{0}' already exists and is not marked for deletion")]
    BackupExists(String),

    #[error("backup '{id}' resides on node '{node}'; use that node for this operation")]
    WrongNode { id: String, node: String },

    #[error("no backup record found for id '{0}'")]
    NotFound(String),

    #[error(transparent)]
    Fault(#[from] ImagingFault),

    #[error("the imaging tool did not finish successfully (exit code {0})")]
    ImagingExit(i32),

    #[error("the device {0} is unavailable")]
    DeviceUnavailable(String),

    #[error("no free block devices left to mount this backup; unmount other backups and try again")]
    PoolExhausted,

    #[error("error detected during the mount operation on backup '{0}'")]
    MountFailed(String),

    #[error("{0}")]
    IllegalOperation(String),

    #[error("unable to free up the disk space required for this backup; {missing} bytes would still be missing")]
    SpaceUnrecoverable { missing: u64 },

    #[error("invalid size string or unknown unit: '{0}'")]
    BadSizeString(String),

    #[error("{0}")]
    Layout(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("record store failure: {0}")]
    Store(String),
}

impl From<tokio_rusqlite::Error> for Error {
    fn from(e: tokio_rusqlite::Error) -> Self {
        Error::Store(e.to_string())
    }
}

// Connection::open and friends report the underlying driver error directly.
impl From<tokio_rusqlite::rusqlite::Error> for Error {
    fn from(e: tokio_rusqlite::rusqlite::Error) -> Self {
        Error::Store(e.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Store(e.to_string())
    }
}

impl Error {
    /// True for the one fault the imaging engine is allowed to recover from.
    pub fn is_space_exhausted(&self) -> bool {
        matches!(self, Error::Fault(ImagingFault::SpaceExhausted(_)))
    }
}
