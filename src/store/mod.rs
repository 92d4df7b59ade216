//! Persisted backup records.
//!
//! The store is a document store keyed by backup id: callers hand over a
//! whole [`BackupSet`] and get whole records back. Upserts are last-writer-
//! wins per id; callers treat the store as externally synchronised.

use async_trait::async_trait;

use crate::core::backupset::BackupSet;
use crate::core::error::Result;

pub mod memory;
pub mod sqlite;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Create or replace the record for `set.id`.
    async fn upsert(&self, set: &BackupSet) -> Result<()>;

    async fn get(&self, id: &str) -> Result<Option<BackupSet>>;

    async fn remove(&self, id: &str) -> Result<()>;

    /// Deleted-but-not-purged backups on `node`, oldest creation date first.
    async fn eligible_for_purge(&self, node: &str) -> Result<Vec<BackupSet>>;

    /// Crash recovery: any record on `node` still marked running belongs to a
    /// job that died with the process; flip it to error.
    async fn sweep_zombies(&self, node: &str) -> Result<()>;
}
