//! Space reclamation: purging old backups when a capture runs out of room.
//!
//! The policy is deliberately simple and auditable: parse the shortfall out
//! of the tool's space error, select the oldest deleted-but-not-purged
//! backups until their sizes cover it, and purge exactly that set. If the
//! eligible backups cannot cover the shortfall, nothing is purged at all.

use std::sync::Arc;

use tracing::{debug, info};

use super::backupset::BackupSet;
use super::error::{Error, Result};
use crate::store::RecordStore;

const MULTIPLIERS: &[(&str, u64)] = &[("kb", 1 << 10), ("mb", 1 << 20), ("gb", 1 << 30)];

/// "12.5gb" -> bytes. Unit suffix is required.
pub(crate) fn string_to_bytes(input: &str) -> Result<u64> {
    let value = input.trim().to_lowercase();
    for (unit, multiplier) in MULTIPLIERS {
        if let Some(number) = value.strip_suffix(unit) {
            let number: f64 = number
                .trim()
                .parse()
                .map_err(|_| Error::BadSizeString(input.to_string()))?;
            return Ok((number * *multiplier as f64) as u64);
        }
    }
    Err(Error::BadSizeString(input.to_string()))
}

/// Extracts the additional bytes needed from the tool's space error, which
/// ends in "...: <available> < <required>".
pub(crate) fn parse_space_error(message: &str) -> Result<u64> {
    let (_, tail) = message
        .rsplit_once(':')
        .ok_or_else(|| Error::BadSizeString(message.to_string()))?;
    let (available, required) = tail
        .split_once('<')
        .ok_or_else(|| Error::BadSizeString(message.to_string()))?;
    let available = string_to_bytes(available)?;
    let required = string_to_bytes(required)?;
    Ok(required.saturating_sub(available))
}

/// Physically remove a backup's files and mark its record purged.
///
/// Refuses to touch backups that are not soft-deleted or that belong to a
/// different node; only the owning node may remove backup files.
pub async fn delete_backup(
    store: &Arc<dyn RecordStore>,
    node: &str,
    set: &mut BackupSet,
) -> Result<()> {
    if !set.deleted {
        return Err(Error::IllegalOperation(
            "a backup must be marked for deletion before it is removed".into(),
        ));
    }
    if set.node != node {
        return Err(Error::WrongNode {
            id: set.id.clone(),
            node: set.node.clone(),
        });
    }
    if set.backup_path.exists() {
        tokio::fs::remove_dir_all(&set.backup_path).await?;
    }
    set.mark_purged()?;
    store.upsert(set).await?;
    info!(backup = %set.id, "backup purged");
    Ok(())
}

/// Frees disk space by purging the oldest eligible backups on this node.
pub struct SpaceReclaimer {
    store: Arc<dyn RecordStore>,
    node: String,
    // one reclamation pass at a time
    lock: tokio::sync::Mutex<()>,
}

impl SpaceReclaimer {
    pub fn new(store: Arc<dyn RecordStore>, node: impl Into<String>) -> Self {
        Self {
            store,
            node: node.into(),
            lock: tokio::sync::Mutex::new(()),
        }
    }

    /// Parse the byte figures out of the space error and free that much.
    pub async fn handle_space_error(&self, message: &str) -> Result<()> {
        let required = parse_space_error(message)?;
        self.make_space(required).await
    }

    /// Purge the minimal oldest-first prefix of eligible backups whose sizes
    /// sum to at least `required` bytes. All-or-nothing: an insufficient
    /// eligible set purges nothing and fails.
    pub async fn make_space(&self, required: u64) -> Result<()> {
        let _guard = self.lock.lock().await;
        let eligible = self.store.eligible_for_purge(&self.node).await?;

        let mut purge_list = Vec::new();
        let mut remaining = required as i64;
        for set in eligible {
            if remaining <= 0 {
                break;
            }
            remaining -= set.backup_size as i64;
            purge_list.push(set);
        }
        if remaining > 0 {
            return Err(Error::SpaceUnrecoverable {
                missing: remaining as u64,
            });
        }

        for mut set in purge_list {
            debug!(backup = %set.id, size = set.backup_size, "purging");
            delete_backup(&self.store, &self.node, &mut set).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_unit_suffixes() {
        assert_eq!(string_to_bytes("4kb").unwrap(), 4 * 1024);
        assert_eq!(string_to_bytes(" 2mb ").unwrap(), 2 * 1024 * 1024);
        assert_eq!(string_to_bytes("1.5gb").unwrap(), (1.5 * (1u64 << 30) as f64) as u64);
        assert!(matches!(
            string_to_bytes("12 parsecs"),
            Err(Error::BadSizeString(_))
        ));
        assert!(matches!(string_to_bytes("gb"), Err(Error::BadSizeString(_))));
    }

    #[test]
    fn parses_shortfall_from_tool_message() {
        let message =
            "error exit - destination doesn't have enough free space: 100mb < 300mb";
        assert_eq!(parse_space_error(message).unwrap(), 200 * 1024 * 1024);
    }

    #[test]
    fn shortfall_never_goes_negative() {
        let message = "destination doesn't have enough free space: 2gb < 1gb";
        assert_eq!(parse_space_error(message).unwrap(), 0);
    }

    #[test]
    fn rejects_malformed_messages() {
        assert!(parse_space_error("no sizes here").is_err());
        assert!(parse_space_error("free space: 100mb").is_err());
    }
}
