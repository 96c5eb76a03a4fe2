use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::models::payload::StageInput;
use crate::models::stage::Stage;

/// One independently schedulable unit of pipeline work.
#[derive(Debug, Clone)]
pub struct StageTask {
    pub job_id: String,
    pub stage: Stage,
    pub input: StageInput,

    /// Wall-clock budget per execution attempt; expiry counts as a failed
    /// attempt and, once retries are exhausted, fails the job.
    pub deadline: Duration,
}

#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("stage dispatch queue is closed")]
    Closed,
}

/// Broker-agnostic stage dispatch interface. The coordinator only ever
/// hands tasks to this seam; what carries them to workers is an
/// implementation detail.
#[async_trait]
pub trait StageDispatcher: Send + Sync {
    async fn dispatch(&self, task: StageTask) -> Result<(), DispatchError>;
}

/// Channel-backed dispatcher feeding the in-process worker pool. The
/// bounded capacity is the pipeline's backpressure limit.
pub struct ChannelDispatcher {
    sender: mpsc::Sender<StageTask>,
}

impl ChannelDispatcher {
    /// Create a dispatcher and the receiving end for a worker pool.
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<StageTask>) {
        let (sender, receiver) = mpsc::channel(capacity);
        (Self { sender }, receiver)
    }
}

#[async_trait]
impl StageDispatcher for ChannelDispatcher {
    async fn dispatch(&self, task: StageTask) -> Result<(), DispatchError> {
        self.sender.send(task).await.map_err(|_| DispatchError::Closed)
    }
}
