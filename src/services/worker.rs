use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};

use crate::models::payload::{StageInput, StageOutput};
use crate::models::stage::Stage;
use crate::services::coordinator::{AdvanceOutcome, PipelineCoordinator};
use crate::services::dispatch::StageTask;

/// External stage collaborator: runs one stage's algorithm on its typed
/// input. The DSP/ML/rendering implementations live behind this seam.
#[async_trait]
pub trait StageExecutor: Send + Sync {
    async fn execute(&self, stage: Stage, input: StageInput)
        -> Result<StageOutput, ExecutionError>;
}

/// Failure reported by a stage executor.
#[derive(Debug, thiserror::Error)]
#[error("{0}")]
pub struct ExecutionError(pub String);

/// Worker pool settings, normally taken from [`crate::config::AppConfig`].
#[derive(Debug, Clone)]
pub struct WorkerSettings {
    pub worker_count: usize,

    /// Execution attempts per dispatched stage before the job is failed.
    pub max_stage_retries: u32,

    /// Delay between attempts.
    pub retry_delay: Duration,
}

/// Pool of tokio workers draining the dispatch channel.
///
/// From the pipeline's point of view this is the retrying dispatch layer:
/// it exhausts the retry budget (deadline expiry included) before a job is
/// failed, and reports completions back through the coordinator. Workers
/// hold the coordinator weakly so dropping the last external handle closes
/// the dispatch channel and drains the pool.
pub struct WorkerPool {
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    pub fn spawn(
        settings: WorkerSettings,
        receiver: mpsc::Receiver<StageTask>,
        executor: Arc<dyn StageExecutor>,
        coordinator: &Arc<PipelineCoordinator>,
    ) -> Self {
        let receiver = Arc::new(Mutex::new(receiver));
        let coordinator = Arc::downgrade(coordinator);

        let handles = (0..settings.worker_count.max(1))
            .map(|worker| {
                let receiver = Arc::clone(&receiver);
                let executor = Arc::clone(&executor);
                let coordinator = Weak::clone(&coordinator);
                let settings = settings.clone();
                tokio::spawn(async move {
                    loop {
                        let task = { receiver.lock().await.recv().await };
                        let Some(task) = task else { break };
                        let Some(coordinator) = coordinator.upgrade() else { break };
                        run_task(&settings, executor.as_ref(), &coordinator, task, worker).await;
                    }
                    tracing::debug!(worker, "dispatch channel closed, worker exiting");
                })
            })
            .collect();

        Self { handles }
    }

    /// Wait for every worker to exit. The channel must be closed first by
    /// dropping all coordinator handles.
    pub async fn join(self) {
        for handle in self.handles {
            let _ = handle.await;
        }
    }
}

async fn run_task(
    settings: &WorkerSettings,
    executor: &dyn StageExecutor,
    coordinator: &PipelineCoordinator,
    task: StageTask,
    worker: usize,
) {
    tracing::info!(worker, job_id = %task.job_id, stage = %task.stage, "executing stage");

    let mut last_error = String::new();
    let attempts = settings.max_stage_retries.max(1);
    for attempt in 1..=attempts {
        match timeout(task.deadline, executor.execute(task.stage, task.input.clone())).await {
            Ok(Ok(output)) => {
                match coordinator.advance(&task.job_id, task.stage, output).await {
                    Ok(AdvanceOutcome::Stale) => {
                        tracing::debug!(job_id = %task.job_id, stage = %task.stage, "duplicate completion dropped");
                    }
                    Ok(_) => {}
                    Err(e) => {
                        tracing::error!(
                            job_id = %task.job_id,
                            stage = %task.stage,
                            error = %e,
                            "failed to record stage completion"
                        );
                    }
                }
                return;
            }
            Ok(Err(e)) => {
                last_error = e.to_string();
                tracing::warn!(
                    job_id = %task.job_id,
                    stage = %task.stage,
                    attempt,
                    error = %last_error,
                    "stage execution failed"
                );
            }
            Err(_) => {
                last_error = format!("deadline exceeded after {}s", task.deadline.as_secs());
                tracing::warn!(
                    job_id = %task.job_id,
                    stage = %task.stage,
                    attempt,
                    "stage deadline expired"
                );
            }
        }
        if attempt < attempts {
            sleep(settings.retry_delay).await;
        }
    }

    if let Err(e) = coordinator.fail(&task.job_id, task.stage, &last_error).await {
        tracing::error!(
            job_id = %task.job_id,
            stage = %task.stage,
            error = %e,
            "failed to record job failure"
        );
    }
}
