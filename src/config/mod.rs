use serde::Deserialize;

/// Pipeline runtime configuration, loaded from the environment.
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    /// Number of stage workers draining the dispatch channel.
    #[serde(default = "default_worker_count")]
    pub worker_count: usize,

    /// Bounded capacity of the stage dispatch channel (backpressure limit).
    #[serde(default = "default_queue_capacity")]
    pub dispatch_queue_capacity: usize,

    /// Wall-clock budget per stage execution attempt, in seconds.
    #[serde(default = "default_stage_deadline_secs")]
    pub stage_deadline_secs: u64,

    /// Execution attempts per dispatched stage before the job is failed.
    #[serde(default = "default_max_stage_retries")]
    pub max_stage_retries: u32,

    /// Delay between execution attempts, in milliseconds.
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
}

fn default_worker_count() -> usize {
    4
}

fn default_queue_capacity() -> usize {
    64
}

fn default_stage_deadline_secs() -> u64 {
    300
}

fn default_max_stage_retries() -> u32 {
    3
}

fn default_retry_delay_ms() -> u64 {
    1000
}

impl AppConfig {
    pub fn from_env() -> Result<Self, envy::Error> {
        dotenvy::dotenv().ok();
        envy::from_env()
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            worker_count: default_worker_count(),
            dispatch_queue_capacity: default_queue_capacity(),
            stage_deadline_secs: default_stage_deadline_secs(),
            max_stage_retries: default_max_stage_retries(),
            retry_delay_ms: default_retry_delay_ms(),
        }
    }
}
