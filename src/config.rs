//! Node configuration.
//!
//! Settings are layered: built-in defaults, then the TOML config file, then
//! `IMGD_`-prefixed environment variables. Later layers win.

use std::path::{Path, PathBuf};

use figment::Figment;
use figment::providers::{Env, Format, Serialized, Toml};
use serde::{Deserialize, Serialize};

pub const DEFAULT_CONFIG_PATH: &str = "/etc/imgd/config.toml";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// Name this node writes onto the backup records it owns.
    pub node_name: String,
    /// Root directory holding one subdirectory per backup.
    pub backup_path: PathBuf,
    /// Root directory under which backups are mounted for browsing.
    pub mount_path: PathBuf,
    pub database_path: PathBuf,
    pub verbose: bool,
    pub log_json: bool,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            node_name: "imgd".into(),
            backup_path: PathBuf::from("/backup"),
            mount_path: PathBuf::from("/mnt/imgd"),
            database_path: PathBuf::from("/var/lib/imgd/imgd.db"),
            verbose: false,
            log_json: false,
        }
    }
}

impl AppConfig {
    pub fn load(path: Option<&Path>) -> Result<Self, figment::Error> {
        let path = path.unwrap_or(Path::new(DEFAULT_CONFIG_PATH));
        Figment::from(Serialized::defaults(AppConfig::default()))
            .merge(Toml::file(path))
            .merge(Env::prefixed("IMGD_"))
            .extract()
    }
}
