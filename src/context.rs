use std::sync::Arc;

use crate::config::AppConfig;
use crate::core::JobQueue;

/// Per-process state handed to the API and the agent. Each process builds
/// its own; the queue handle is this process's connection to the shared store.
#[derive(Clone)]
pub struct AppContext {
    pub config: Arc<AppConfig>,
    pub queue: JobQueue,
}

impl AppContext {
    pub fn new(config: AppConfig, queue: JobQueue) -> Self {
        Self {
            config: Arc::new(config),
            queue,
        }
    }

    /// Connect to the configured queue as this node.
    pub async fn connect(config: AppConfig) -> anyhow::Result<Self> {
        let queue = JobQueue::connect(&config.queue, config.node_name().to_string()).await?;
        Ok(Self::new(config, queue))
    }
}
