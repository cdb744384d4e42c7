//! Scheduler configuration and environment overrides

use serde::{Deserialize, Serialize};
use std::env;
use std::time::Duration;

/// Sync scheduler configuration
///
/// Every interval and bound of the control loop lives here so tests can run
/// the loop with short timers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Heights requested per window fetch
    pub window_size: u64,
    /// Maximum records per decode batch
    pub max_batch_records: usize,
    /// Batches dispatched before the decode worker is recycled
    pub recycle_after_batches: u32,
    /// Pending records above which fetching pauses
    pub max_pending_records: usize,
    /// Decode dispatch tick (wallet read speed)
    #[serde(with = "duration_ms")]
    pub decode_interval: Duration,
    /// Re-poll delay while the worker is busy or not ready
    #[serde(with = "duration_ms")]
    pub worker_poll: Duration,
    /// Re-poll delay while the pending queue is over its cap
    #[serde(with = "duration_ms")]
    pub backlog_poll: Duration,
    /// Fixed delay after a transport failure
    #[serde(with = "duration_ms")]
    pub retry_delay: Duration,
    /// Poll delay once caught up with the chain tip
    #[serde(with = "duration_ms")]
    pub idle_poll: Duration,
    /// Mempool check period
    #[serde(with = "duration_ms")]
    pub mempool_interval: Duration,
    /// Largest tip distance at which the mempool is still checked
    pub mempool_max_gap: u64,
    /// In-flight batch age that forces a worker recycle (None = never)
    #[serde(with = "option_duration_ms")]
    pub worker_timeout: Option<Duration>,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            window_size: ledger_params::DEFAULT_WINDOW_SIZE,
            max_batch_records: 50,
            recycle_after_batches: 75,
            max_pending_records: 100,
            decode_interval: Duration::from_millis(10),
            worker_poll: Duration::from_millis(250),
            backlog_poll: Duration::from_secs(1),
            retry_delay: Duration::from_secs(30),
            idle_poll: Duration::from_secs(30),
            mempool_interval: Duration::from_secs(30),
            mempool_max_gap: 1,
            worker_timeout: Some(Duration::from_secs(60)),
        }
    }
}

impl SyncConfig {
    /// Defaults with `LEDGER_SYNC_*` environment overrides applied
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_overrides(|key| env::var(key).ok());
        config
    }

    /// Apply overrides from an arbitrary key lookup
    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = parse_env_u64(lookup("LEDGER_SYNC_WINDOW_SIZE")) {
            self.window_size = v.max(1);
        }
        if let Some(v) = parse_env_u64(lookup("LEDGER_SYNC_MAX_BATCH_RECORDS")) {
            self.max_batch_records = (v as usize).max(1);
        }
        if let Some(v) = parse_env_u64(lookup("LEDGER_SYNC_RECYCLE_AFTER_BATCHES")) {
            self.recycle_after_batches = (v.min(u32::MAX as u64) as u32).max(1);
        }
        if let Some(v) = parse_env_u64(lookup("LEDGER_SYNC_MAX_PENDING_RECORDS")) {
            self.max_pending_records = v as usize;
        }
        if let Some(v) = parse_env_ms(lookup("LEDGER_SYNC_DECODE_INTERVAL_MS")) {
            self.decode_interval = v.max(Duration::from_millis(1));
        }
        if let Some(v) = parse_env_ms(lookup("LEDGER_SYNC_WORKER_POLL_MS")) {
            self.worker_poll = v;
        }
        if let Some(v) = parse_env_ms(lookup("LEDGER_SYNC_BACKLOG_POLL_MS")) {
            self.backlog_poll = v;
        }
        if let Some(v) = parse_env_ms(lookup("LEDGER_SYNC_RETRY_DELAY_MS")) {
            self.retry_delay = v;
        }
        if let Some(v) = parse_env_ms(lookup("LEDGER_SYNC_IDLE_POLL_MS")) {
            self.idle_poll = v;
        }
        if let Some(v) = parse_env_ms(lookup("LEDGER_SYNC_MEMPOOL_INTERVAL_MS")) {
            self.mempool_interval = v.max(Duration::from_millis(1));
        }
        if let Some(v) = parse_env_u64(lookup("LEDGER_SYNC_MEMPOOL_MAX_GAP")) {
            self.mempool_max_gap = v;
        }
        // 0 disables the dead-worker timeout
        if let Some(v) = parse_env_ms(lookup("LEDGER_SYNC_WORKER_TIMEOUT_MS")) {
            self.worker_timeout = if v.is_zero() { None } else { Some(v) };
        }
    }
}

pub(crate) fn parse_env_u64(value: Option<String>) -> Option<u64> {
    value.and_then(|v| v.trim().parse::<u64>().ok())
}

pub(crate) fn parse_env_ms(value: Option<String>) -> Option<Duration> {
    parse_env_u64(value).map(Duration::from_millis)
}

pub(crate) fn parse_env_string(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

pub(crate) fn split_list_env(value: &str) -> Vec<String> {
    value
        .split([',', ';', '\n', '\r'])
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

pub(crate) mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis().min(u64::MAX as u128) as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

pub(crate) mod option_duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(
        value: &Option<Duration>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match value {
            Some(d) => serializer.serialize_some(&(d.as_millis().min(u64::MAX as u128) as u64)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Duration>, D::Error> {
        Option::<u64>::deserialize(deserializer).map(|v| v.map(Duration::from_millis))
    }
}
