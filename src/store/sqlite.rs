//! SQLite-backed record store.
//!
//! Records are stored as JSON documents; a few columns are mirrored out of
//! the document so the purge and zombie queries can be indexed.

use async_trait::async_trait;
use tokio_rusqlite::{Connection, params, rusqlite};
use tracing::info;

use crate::core::backupset::{BackupSet, Status};
use crate::core::error::Result;

use super::RecordStore;

#[derive(Debug)]
pub struct SqliteStore {
    conn: Connection,
}

impl SqliteStore {
    pub async fn open(path: &std::path::Path) -> Result<Self> {
        let conn = Connection::open(path).await?;
        Self::init(conn).await
    }

    /// Private in-memory database; used by tests and simulation runs.
    pub async fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().await?;
        Self::init(conn).await
    }

    async fn init(conn: Connection) -> Result<Self> {
        conn.call(|conn| {
            let schema = include_str!("schema.sql");
            conn.execute_batch(schema)?;
            Ok(())
        })
        .await?;
        Ok(Self { conn })
    }
}

fn status_text(status: Status) -> &'static str {
    match status {
        Status::Pending => "pending",
        Status::Running => "running",
        Status::Finished => "finished",
        Status::Error => "error",
    }
}

#[async_trait]
impl RecordStore for SqliteStore {
    async fn upsert(&self, set: &BackupSet) -> Result<()> {
        let record = serde_json::to_string(set)?;
        let id = set.id.clone();
        let node = set.node.clone();
        let status = status_text(set.status);
        let deleted = set.deleted;
        let purged = set.purged;
        let creation_date = set.creation_date.to_rfc3339();
        self.conn
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO backups (id, node, status, deleted, purged, creation_date, record)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                     ON CONFLICT(id) DO UPDATE SET
                        node = excluded.node,
                        status = excluded.status,
                        deleted = excluded.deleted,
                        purged = excluded.purged,
                        creation_date = excluded.creation_date,
                        record = excluded.record",
                    params![id, node, status, deleted, purged, creation_date, record],
                )?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<Option<BackupSet>> {
        let id = id.to_string();
        let record: Option<String> = self
            .conn
            .call(move |conn| {
                use rusqlite::OptionalExtension;
                let record = conn
                    .query_row(
                        "SELECT record FROM backups WHERE id = ?1",
                        params![id],
                        |row| row.get(0),
                    )
                    .optional()?;
                Ok(record)
            })
            .await?;
        match record {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }

    async fn remove(&self, id: &str) -> Result<()> {
        let id = id.to_string();
        self.conn
            .call(move |conn| {
                conn.execute("DELETE FROM backups WHERE id = ?1", params![id])?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    async fn eligible_for_purge(&self, node: &str) -> Result<Vec<BackupSet>> {
        let node = node.to_string();
        let records: Vec<String> = self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT record FROM backups
                     WHERE node = ?1 AND deleted = 1 AND purged = 0
                     ORDER BY creation_date ASC",
                )?;
                let rows = stmt.query_map(params![node], |row| row.get(0))?;
                let mut records = Vec::new();
                for row in rows {
                    records.push(row?);
                }
                Ok(records)
            })
            .await?;
        records
            .iter()
            .map(|json| serde_json::from_str(json).map_err(Into::into))
            .collect()
    }

    async fn sweep_zombies(&self, node: &str) -> Result<()> {
        let node = node.to_string();
        let records: Vec<String> = self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT record FROM backups WHERE node = ?1 AND status = 'running'",
                )?;
                let rows = stmt.query_map(params![node], |row| row.get(0))?;
                let mut records = Vec::new();
                for row in rows {
                    records.push(row?);
                }
                Ok(records)
            })
            .await?;
        for json in records {
            let mut set: BackupSet = serde_json::from_str(&json)?;
            info!(backup = %set.id, "marking interrupted backup as errored");
            set.status = Status::Error;
            self.upsert(&set).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    fn sample(id: &str, node: &str) -> BackupSet {
        BackupSet::new(id, node, Path::new("/backup"))
    }

    #[tokio::test]
    async fn upsert_is_last_writer_wins() {
        let store = SqliteStore::open_in_memory().await.unwrap();
        let mut set = sample("a", "node0");
        store.upsert(&set).await.unwrap();
        set.backup_size = 4096;
        set.status = Status::Finished;
        store.upsert(&set).await.unwrap();

        let loaded = store.get("a").await.unwrap().unwrap();
        assert_eq!(loaded.backup_size, 4096);
        assert_eq!(loaded.status, Status::Finished);
    }

    #[tokio::test]
    async fn open_failure_surfaces_as_store_error() {
        let err = SqliteStore::open(Path::new("/nonexistent/imgd/imgd.db"))
            .await
            .unwrap_err();
        assert!(matches!(err, crate::core::error::Error::Store(_)));
    }

    #[tokio::test]
    async fn get_missing_record_is_none() {
        let store = SqliteStore::open_in_memory().await.unwrap();
        assert!(store.get("nope").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn purge_query_filters_and_orders() {
        let store = SqliteStore::open_in_memory().await.unwrap();
        for (id, deleted, purged, offset) in
            [("new", true, false, 3), ("old", true, false, 1), ("kept", false, false, 2)]
        {
            let mut set = sample(id, "node0");
            set.deleted = deleted;
            set.purged = purged;
            set.creation_date =
                chrono::Utc::now() - chrono::Duration::days(10 - offset);
            store.upsert(&set).await.unwrap();
        }
        let mut other = sample("other-node", "node1");
        other.deleted = true;
        store.upsert(&other).await.unwrap();

        let eligible = store.eligible_for_purge("node0").await.unwrap();
        let ids: Vec<_> = eligible.iter().map(|s| s.id.as_str()).collect();
        assert_eq!(ids, vec!["old", "new"]);
    }

    #[tokio::test]
    async fn zombie_sweep_flips_running_to_error() {
        let store = SqliteStore::open_in_memory().await.unwrap();
        let mut set = sample("stuck", "node0");
        set.status = Status::Running;
        store.upsert(&set).await.unwrap();

        store.sweep_zombies("node0").await.unwrap();
        let loaded = store.get("stuck").await.unwrap().unwrap();
        assert_eq!(loaded.status, Status::Error);
    }
}
