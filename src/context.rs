use std::sync::Arc;

use crate::config::AppConfig;
use crate::core::pool::NbdPool;
use crate::core::reclaim::SpaceReclaimer;
use crate::store::RecordStore;

/// Shared handles every controller needs; built once at startup and cloned
/// per job.
#[derive(Clone)]
pub struct AppContext {
    pub config: Arc<AppConfig>,
    pub store: Arc<dyn RecordStore>,
    pub pool: Arc<NbdPool>,
    pub reclaimer: Arc<SpaceReclaimer>,
}

impl AppContext {
    pub fn new(config: AppConfig, store: Arc<dyn RecordStore>, pool: NbdPool) -> Self {
        let reclaimer = Arc::new(SpaceReclaimer::new(store.clone(), &config.node_name));
        Self {
            config: Arc::new(config),
            store,
            pool: Arc::new(pool),
            reclaimer,
        }
    }
}
