//! Sync progress tracking with ETA calculation and decode counters
//!
//! The presentation layer polls this; the scheduler is the only writer.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Scheduler stage
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncStage {
    /// Waiting for the next iteration
    Idle,
    /// Asking the node for the chain height
    FetchingHeight,
    /// Fetching a height window
    FetchingWindow,
    /// Handing a batch to the decode worker
    DispatchingBatch,
    /// Worker busy or not yet ready
    AwaitingWorker,
    /// Fixed delay after a transport failure
    Backoff,
    /// Pending queue over its cap
    Throttled,
    /// Stopped for good
    Stopped,
}

impl SyncStage {
    /// Get display name
    pub fn name(&self) -> &'static str {
        match self {
            Self::Idle => "Idle",
            Self::FetchingHeight => "Fetching Height",
            Self::FetchingWindow => "Fetching Blocks",
            Self::DispatchingBatch => "Decoding",
            Self::AwaitingWorker => "Waiting For Worker",
            Self::Backoff => "Retrying",
            Self::Throttled => "Throttled",
            Self::Stopped => "Stopped",
        }
    }
}

/// Decode counters snapshot
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DecodeCountersSnapshot {
    /// Batches the worker completed
    pub batches_decoded: u64,
    /// Wallet transactions found
    pub transactions_found: u64,
    /// Records that failed to decode
    pub decode_failures: u64,
    /// Last batch round-trip in milliseconds
    pub last_batch_ms: u64,
    /// Average batch round-trip in milliseconds
    pub avg_batch_ms: u64,
}

/// Sync progress
#[derive(Debug, Clone)]
pub struct SyncProgress {
    inner: Arc<RwLock<ProgressInner>>,
}

#[derive(Debug, Clone)]
struct ProgressInner {
    scanned_height: u64,
    max_observed_height: u64,
    start_height: u64,
    stage: SyncStage,
    start_time: Option<Instant>,
    started_at: Option<DateTime<Utc>>,
    last_update: Option<DateTime<Utc>>,
    eta_seconds: Option<u64>,
    blocks_per_second: f64,
    pending_records: usize,
    worker_generation: u64,
    last_error: Option<String>,
    // Decode counters
    batches_decoded: u64,
    transactions_found: u64,
    decode_failures: u64,
    last_batch_ms: u64,
    total_batch_ms: u64,
}

impl SyncProgress {
    /// Create new progress tracker
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RwLock::new(ProgressInner {
                scanned_height: 0,
                max_observed_height: 0,
                start_height: 0,
                stage: SyncStage::Idle,
                start_time: None,
                started_at: None,
                last_update: None,
                eta_seconds: None,
                blocks_per_second: 0.0,
                pending_records: 0,
                worker_generation: 0,
                last_error: None,
                batches_decoded: 0,
                transactions_found: 0,
                decode_failures: 0,
                last_batch_ms: 0,
                total_batch_ms: 0,
            })),
        }
    }

    /// Start tracking from `height`
    pub fn start(&self, height: u64) {
        let mut inner = self.inner.write();
        inner.start_time = Some(Instant::now());
        inner.started_at = Some(Utc::now());
        inner.last_update = inner.started_at;
        inner.scanned_height = height;
        inner.start_height = height;
        inner.batches_decoded = 0;
        inner.transactions_found = 0;
        inner.decode_failures = 0;
        inner.last_batch_ms = 0;
        inner.total_batch_ms = 0;
    }

    /// Update scanned height and refresh the ETA
    pub fn set_scanned(&self, height: u64) {
        let mut inner = self.inner.write();
        if height < inner.start_height {
            // Re-validation pass; measure rate from here
            inner.start_height = height;
            inner.start_time = Some(Instant::now());
        }
        inner.scanned_height = height;
        inner.last_update = Some(Utc::now());
        Self::update_eta(&mut inner);
    }

    /// Record the highest chain height observed
    pub fn set_max_observed(&self, height: u64) {
        let mut inner = self.inner.write();
        if height > inner.max_observed_height {
            inner.max_observed_height = height;
        }
    }

    /// Set stage
    pub fn set_stage(&self, stage: SyncStage) {
        self.inner.write().stage = stage;
    }

    /// Set pending queue length
    pub fn set_pending(&self, records: usize) {
        self.inner.write().pending_records = records;
    }

    /// Set decode worker generation
    pub fn set_worker_generation(&self, generation: u64) {
        self.inner.write().worker_generation = generation;
    }

    /// Remember the last transient error (cleared on the next success)
    pub fn set_error(&self, error: Option<String>) {
        self.inner.write().last_error = error;
    }

    fn update_eta(inner: &mut ProgressInner) {
        let Some(start_time) = inner.start_time else {
            return;
        };
        let elapsed = start_time.elapsed().as_secs_f64();
        let blocks_synced = inner.scanned_height.saturating_sub(inner.start_height);
        let blocks_remaining = inner.max_observed_height.saturating_sub(inner.scanned_height);

        if blocks_synced > 0 && elapsed > 0.0 {
            inner.blocks_per_second = blocks_synced as f64 / elapsed;
            if inner.blocks_per_second > 0.0 {
                inner.eta_seconds = Some((blocks_remaining as f64 / inner.blocks_per_second) as u64);
            }
        }
    }

    /// Get progress percentage
    pub fn percentage(&self) -> f64 {
        let inner = self.inner.read();
        if inner.max_observed_height == 0 {
            return 0.0;
        }
        if inner.scanned_height >= inner.max_observed_height {
            return 100.0;
        }
        if inner.max_observed_height <= inner.start_height {
            return 0.0;
        }

        let total = inner.max_observed_height - inner.start_height;
        let done = inner.scanned_height.saturating_sub(inner.start_height);

        (done as f64 / total as f64) * 100.0
    }

    /// Get scanned height
    pub fn scanned_height(&self) -> u64 {
        self.inner.read().scanned_height
    }

    /// Get highest observed chain height
    pub fn max_observed_height(&self) -> u64 {
        self.inner.read().max_observed_height
    }

    /// Get current stage
    pub fn stage(&self) -> SyncStage {
        self.inner.read().stage
    }

    /// Get pending queue length
    pub fn pending_records(&self) -> usize {
        self.inner.read().pending_records
    }

    /// Get decode worker generation
    pub fn worker_generation(&self) -> u64 {
        self.inner.read().worker_generation
    }

    /// Get last transient error
    pub fn last_error(&self) -> Option<String> {
        self.inner.read().last_error.clone()
    }

    /// Get ETA in seconds
    pub fn eta_seconds(&self) -> Option<u64> {
        self.inner.read().eta_seconds
    }

    /// Get elapsed time
    pub fn elapsed(&self) -> Option<Duration> {
        self.inner.read().start_time.map(|start| start.elapsed())
    }

    /// Wall-clock time tracking started
    pub fn started_at(&self) -> Option<DateTime<Utc>> {
        self.inner.read().started_at
    }

    /// Wall-clock time of the last cursor move
    pub fn last_update(&self) -> Option<DateTime<Utc>> {
        self.inner.read().last_update
    }

    // ========================================================================
    // Decode Counters
    // ========================================================================

    /// Record batch completion
    pub fn record_batch(&self, transactions: u64, failures: u64, duration_ms: u64) {
        let mut inner = self.inner.write();
        inner.batches_decoded += 1;
        inner.transactions_found += transactions;
        inner.decode_failures += failures;
        inner.last_batch_ms = duration_ms;
        inner.total_batch_ms += duration_ms;
    }

    /// Get batches decoded
    pub fn batches_decoded(&self) -> u64 {
        self.inner.read().batches_decoded
    }

    /// Get wallet transactions found
    pub fn transactions_found(&self) -> u64 {
        self.inner.read().transactions_found
    }

    /// Get decode counters snapshot
    pub fn decode_snapshot(&self) -> DecodeCountersSnapshot {
        let inner = self.inner.read();
        DecodeCountersSnapshot {
            batches_decoded: inner.batches_decoded,
            transactions_found: inner.transactions_found,
            decode_failures: inner.decode_failures,
            last_batch_ms: inner.last_batch_ms,
            avg_batch_ms: if inner.batches_decoded > 0 {
                inner.total_batch_ms / inner.batches_decoded
            } else {
                0
            },
        }
    }

    /// Check if caught up with the highest observed height
    pub fn is_synced(&self) -> bool {
        let inner = self.inner.read();
        inner.max_observed_height > 0 && inner.scanned_height >= inner.max_observed_height
    }

    /// Get summary string
    pub fn summary(&self) -> String {
        let pct = self.percentage();
        let inner = self.inner.read();

        let eta_str = match inner.eta_seconds {
            Some(secs) if secs > 0 => format!("ETA: {}m {}s", secs / 60, secs % 60),
            _ => "ETA: calculating...".to_string(),
        };

        format!(
            "{} | {}/{} ({:.1}%) | {:.1} blocks/s | {} pending | {} tx found | {}",
            inner.stage.name(),
            inner.scanned_height,
            inner.max_observed_height,
            pct,
            inner.blocks_per_second,
            inner.pending_records,
            inner.transactions_found,
            eta_str
        )
    }
}

impl Default for SyncProgress {
    fn default() -> Self {
        Self::new()
    }
}
