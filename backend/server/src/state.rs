use std::sync::Arc;

use crate::{
    checkpoint::{Checkpoint, Clock, SystemClock},
    config::Config,
    store::{StatusStore, StoreError, log_latest_statuses, open_store},
};

pub struct State {
    pub config: Config,
    pub checkpoint: Checkpoint,
}

impl State {
    pub async fn new(config: Config) -> Result<Arc<Self>, StoreError> {
        let store = open_store(&config).await?;
        log_latest_statuses(store.as_ref()).await;

        Ok(Self::with_store(config, store, Arc::new(SystemClock)))
    }

    pub fn with_store(
        config: Config,
        store: Arc<dyn StatusStore>,
        clock: Arc<dyn Clock>,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            checkpoint: Checkpoint::new(store, clock),
        })
    }
}
