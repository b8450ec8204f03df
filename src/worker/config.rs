use std::collections::HashSet;
use std::time::Duration;

/// Per-stage tunables. Queue/exchange names are derived from `process_name`
/// the same way the source derives `{process_name}-in` / `{process_name}-out`.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub process_name: String,
    pub prefetch: u16,
    pub max_retries: u32,
    pub retry_delay_minutes: u32,
    pub fast_ttl_ms: u64,
    /// Exception/error kinds that are dropped silently (never quarantined)
    /// once retries are exhausted.
    pub no_quarantine: HashSet<String>,
    pub from_quarantine: bool,
    pub barrier_exchange: String,
    pub barrier_poll_interval: Duration,
    pub barrier_max_attempts: u32,
}

pub const DEFAULT_PREFETCH: u16 = 2;
pub const DEFAULT_MAX_RETRIES: u32 = 10;
pub const DEFAULT_RETRY_DELAY_MINUTES: u32 = 60;
pub const DEFAULT_FAST_TTL_MS: u64 = 5_000;

impl WorkerConfig {
    pub fn new(process_name: impl Into<String>, deployment_id: impl Into<String>) -> Self {
        let deployment_id = deployment_id.into();
        WorkerConfig {
            process_name: process_name.into(),
            prefetch: DEFAULT_PREFETCH,
            max_retries: DEFAULT_MAX_RETRIES,
            retry_delay_minutes: DEFAULT_RETRY_DELAY_MINUTES,
            fast_ttl_ms: DEFAULT_FAST_TTL_MS,
            no_quarantine: HashSet::new(),
            from_quarantine: false,
            barrier_exchange: format!("config-barrier-{deployment_id}"),
            barrier_poll_interval: Duration::from_secs(5),
            barrier_max_attempts: 60,
        }
    }

    pub fn input_queue(&self) -> String {
        format!("{}-in", self.process_name)
    }

    pub fn output_exchange(&self) -> String {
        format!("{}-out", self.process_name)
    }

    pub fn delay_queue(&self) -> String {
        format!("{}-delay", self.process_name)
    }

    pub fn fast_queue(&self) -> String {
        format!("{}-fast", self.process_name)
    }

    pub fn quarantine_queue(&self) -> String {
        format!("{}-quar", self.process_name)
    }

    pub fn retry_delay_ms(&self) -> u64 {
        self.retry_delay_minutes as u64 * 60_000
    }

    pub fn with_no_quarantine(mut self, kinds: impl IntoIterator<Item = &'static str>) -> Self {
        self.no_quarantine = kinds.into_iter().map(str::to_string).collect();
        self
    }
}
