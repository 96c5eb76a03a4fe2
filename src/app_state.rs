use std::sync::Arc;
use std::time::Duration;

use crate::config::AppConfig;
use crate::services::coordinator::PipelineCoordinator;
use crate::services::dispatch::ChannelDispatcher;
use crate::services::worker::{StageExecutor, WorkerPool, WorkerSettings};
use crate::store::JobStore;

/// Fully wired pipeline: store, coordinator, and worker pool.
///
/// All dependencies are injected by handle; nothing in the crate reaches
/// for a global. The embedding service passes its own store implementation
/// and stage executors.
pub struct PipelineState {
    pub store: Arc<dyn JobStore>,
    pub coordinator: Arc<PipelineCoordinator>,
    workers: WorkerPool,
}

impl PipelineState {
    pub fn new(
        config: &AppConfig,
        store: Arc<dyn JobStore>,
        executor: Arc<dyn StageExecutor>,
    ) -> Self {
        let (dispatcher, receiver) = ChannelDispatcher::channel(config.dispatch_queue_capacity);
        let coordinator = Arc::new(PipelineCoordinator::new(
            Arc::clone(&store),
            Arc::new(dispatcher),
            Duration::from_secs(config.stage_deadline_secs),
        ));
        let workers = WorkerPool::spawn(
            WorkerSettings {
                worker_count: config.worker_count,
                max_stage_retries: config.max_stage_retries,
                retry_delay: Duration::from_millis(config.retry_delay_ms),
            },
            receiver,
            executor,
            &coordinator,
        );

        Self {
            store,
            coordinator,
            workers,
        }
    }

    /// Drop this state's coordinator handle and wait for the workers to
    /// drain. Any coordinator handles cloned out of `self.coordinator`
    /// must be dropped first or the dispatch channel stays open.
    pub async fn shutdown(self) {
        let Self {
            store: _,
            coordinator,
            workers,
        } = self;
        drop(coordinator);
        workers.join().await;
    }
}
