use std::time::Duration;

/// Tunable pipeline policy. Retry counts and timeouts are deployment policy;
/// these are the shipped defaults.
#[derive(Debug, Clone)]
pub struct PipelinePolicy {
    /// Budget for one stage execution, sub-agent time included.
    pub stage_timeout: Duration,
    /// Internal retries for transient sub-agent failures within one stage.
    pub transient_retries: u32,
    /// Extra attempts after a stage timeout (one, if the budget allows).
    pub timeout_retries: u32,
    /// Sleep between stage retry attempts.
    pub retry_backoff: Duration,
}

impl Default for PipelinePolicy {
    fn default() -> Self {
        Self {
            stage_timeout: Duration::from_secs(30 * 60),
            transient_retries: 2,
            timeout_retries: 1,
            retry_backoff: Duration::from_millis(500),
        }
    }
}

impl PipelinePolicy {
    /// A fast policy for tests.
    pub fn fast() -> Self {
        Self {
            stage_timeout: Duration::from_millis(500),
            transient_retries: 2,
            timeout_retries: 1,
            retry_backoff: Duration::from_millis(5),
        }
    }
}
