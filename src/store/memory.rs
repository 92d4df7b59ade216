//! In-memory record store for tests and simulation runs.

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::core::backupset::{BackupSet, Status};
use crate::core::error::Result;

use super::RecordStore;

#[derive(Default)]
pub struct MemoryStore {
    inner: RwLock<HashMap<String, BackupSet>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RecordStore for MemoryStore {
    async fn upsert(&self, set: &BackupSet) -> Result<()> {
        self.inner.write().await.insert(set.id.clone(), set.clone());
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<Option<BackupSet>> {
        Ok(self.inner.read().await.get(id).cloned())
    }

    async fn remove(&self, id: &str) -> Result<()> {
        self.inner.write().await.remove(id);
        Ok(())
    }

    async fn eligible_for_purge(&self, node: &str) -> Result<Vec<BackupSet>> {
        let mut eligible: Vec<BackupSet> = self
            .inner
            .read()
            .await
            .values()
            .filter(|s| s.node == node && s.deleted && !s.purged)
            .cloned()
            .collect();
        eligible.sort_by_key(|s| s.creation_date);
        Ok(eligible)
    }

    async fn sweep_zombies(&self, node: &str) -> Result<()> {
        for set in self.inner.write().await.values_mut() {
            if set.node == node && set.status == Status::Running {
                set.status = Status::Error;
            }
        }
        Ok(())
    }
}
