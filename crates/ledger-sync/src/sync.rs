//! Sync scheduler
//!
//! A single driving loop owns the cursor, the pending queue and the decode
//! pool. Timers (next fetch, decode tick, mempool tick), worker events,
//! handle commands and cancellation are all multiplexed through one
//! `tokio::select!`, so ordering rules such as "never dispatch while a batch is
//! in flight" are enforced in one place.
//!
//! Every failure path waits `retry_delay` and tries again; nothing here gives
//! up on a transient error.

use crate::cancel::CancelToken;
use crate::client::LedgerApi;
use crate::config::SyncConfig;
use crate::error::{Error, Result};
use crate::mempool::MempoolWatcher;
use crate::progress::{SyncProgress, SyncStage};
use crate::types::{RawTransactionRecord, SyncCursor};
use crate::wallet::{TransactionDecoder, WalletStore};
use crate::worker::{BatchOutcome, DecodeWorkerPool, PoolUpdate};
use parking_lot::Mutex;
use std::collections::{HashSet, VecDeque};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

const MIN_TICK: Duration = Duration::from_millis(1);

/// Requests from a [`SyncHandle`] to the running loop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SyncCommand {
    CheckMempool,
    WalletUpdated,
}

/// Records of a height that spans more than one batch
#[derive(Debug, Clone, PartialEq, Eq)]
struct SplitHeight {
    height: u64,
    decoded: HashSet<String>,
}

impl SplitHeight {
    /// Records of the batch's last height; `None` for an empty or mempool batch
    fn tail_of(batch: &[RawTransactionRecord]) -> Option<Self> {
        let height = batch.last()?.height?;
        let decoded = batch
            .iter()
            .filter(|r| r.height == Some(height))
            .map(|r| r.hash.clone())
            .collect();
        Some(Self { height, decoded })
    }

    fn covers(&self, record: &RawTransactionRecord) -> bool {
        record.height == Some(self.height) && self.decoded.contains(&record.hash)
    }
}

/// Wallet sync scheduler
pub struct SyncScheduler<L, W, D> {
    ledger: Arc<L>,
    wallet: Arc<W>,
    config: SyncConfig,
    pool: DecodeWorkerPool<D>,
    mempool: MempoolWatcher<L, W, D>,
    cursor: SyncCursor,
    queue: VecDeque<RawTransactionRecord>,
    cancel: CancelToken,
    progress: SyncProgress,
    commands_tx: mpsc::UnboundedSender<SyncCommand>,
    commands_rx: mpsc::UnboundedReceiver<SyncCommand>,
    decode_active: bool,
    refresh_pending: bool,
    rewind_pending: bool,
    split: Option<SplitHeight>,
    in_flight_tail: Option<SplitHeight>,
    task: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl<L, W, D> SyncScheduler<L, W, D>
where
    L: LedgerApi,
    W: WalletStore,
    D: TransactionDecoder,
{
    /// Create a scheduler; nothing runs until [`SyncScheduler::spawn`] or [`SyncScheduler::run`]
    pub fn new(ledger: Arc<L>, wallet: Arc<W>, decoder: Arc<D>, config: SyncConfig) -> Self {
        let cancel = CancelToken::new();
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let start = wallet.last_height();

        Self {
            pool: DecodeWorkerPool::new(
                Arc::clone(&decoder),
                config.recycle_after_batches,
                config.worker_timeout,
            ),
            mempool: MempoolWatcher::new(
                Arc::clone(&ledger),
                Arc::clone(&wallet),
                decoder,
                cancel.clone(),
                config.mempool_max_gap,
            ),
            ledger,
            wallet,
            config,
            cursor: SyncCursor::new(start),
            queue: VecDeque::new(),
            cancel,
            progress: SyncProgress::new(),
            commands_tx,
            commands_rx,
            decode_active: false,
            refresh_pending: false,
            rewind_pending: false,
            split: None,
            in_flight_tail: None,
            task: Arc::new(Mutex::new(None)),
        }
    }

    /// Handle for controlling the loop.
    ///
    /// Handles taken before [`SyncScheduler::spawn`] share the task slot, so
    /// `join` on any of them waits for the spawned loop. Without `spawn`,
    /// `join` returns immediately.
    pub fn handle(&self) -> SyncHandle {
        SyncHandle {
            commands: self.commands_tx.clone(),
            cancel: self.cancel.clone(),
            progress: self.progress.clone(),
            task: Arc::clone(&self.task),
        }
    }

    /// Run the loop on a new task
    pub fn spawn(self) -> SyncHandle {
        let handle = self.handle();
        let slot = Arc::clone(&self.task);
        *slot.lock() = Some(tokio::spawn(self.run()));
        handle
    }

    /// Current cursor
    pub fn cursor(&self) -> SyncCursor {
        self.cursor
    }

    /// Records waiting for decode
    pub fn pending_records(&self) -> usize {
        self.queue.len()
    }

    /// Drive the loop until stopped
    pub async fn run(mut self) {
        let start = self.wallet.last_height();
        self.cursor = SyncCursor::new(start);
        self.progress.start(start);
        info!(event = "sync_start", height = start, "Sync scheduler started");

        self.pool.start();
        self.progress.set_worker_generation(self.pool.generation());

        let mut next_fetch = Instant::now();
        let mut decode_tick = tokio::time::interval(self.config.decode_interval.max(MIN_TICK));
        decode_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut mempool_tick = tokio::time::interval(self.config.mempool_interval.max(MIN_TICK));
        mempool_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        while !self.cancel.is_cancelled() {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                Some(event) = self.pool.next_event() => {
                    let update = self.pool.handle_event(event);
                    self.on_pool_update(update);
                }
                Some(command) = self.commands_rx.recv() => self.on_command(command),
                _ = decode_tick.tick(), if self.decode_active => self.check_transactions(),
                _ = mempool_tick.tick() => self.check_mempool(),
                _ = tokio::time::sleep_until(next_fetch) => {
                    let delay = self.load_history().await;
                    next_fetch = Instant::now() + delay;
                }
            }
        }

        self.shutdown();
    }

    /// One fetch iteration; returns the delay before the next one
    pub async fn load_history(&mut self) -> Duration {
        if self.cancel.is_cancelled() {
            return Duration::ZERO;
        }

        if self.pool.in_flight_expired() {
            warn!(
                generation = self.pool.generation(),
                "Decode worker unresponsive; recycling"
            );
            self.recycle_worker();
        }
        if self.refresh_pending && !self.pool.is_busy() {
            self.send_wallet(false);
        }

        // Never fetch while a batch is out or the worker is still loading
        if self.pool.is_busy() || !self.pool.is_ready() {
            self.progress.set_stage(SyncStage::AwaitingWorker);
            return self.config.worker_poll;
        }

        if self.queue.len() > self.config.max_pending_records {
            debug!(pending = self.queue.len(), "Backlog over cap; throttling");
            self.progress.set_stage(SyncStage::Throttled);
            return self.config.backlog_poll;
        }

        self.progress.set_stage(SyncStage::FetchingHeight);
        let ledger = Arc::clone(&self.ledger);
        let cancel = self.cancel.clone();
        let height = match guarded(&cancel, ledger.get_height()).await {
            Ok(height) => height,
            Err(e) => return self.backoff("height", e),
        };

        self.cursor.observe(height);
        self.progress.set_max_observed(height);

        if self.cursor.is_caught_up(height) {
            self.settle_wallet_height();
            self.progress.set_error(None);
            self.progress.set_stage(SyncStage::Idle);
            return self.config.idle_poll;
        }

        self.progress.set_stage(SyncStage::FetchingWindow);
        let start = self.cursor.scanned_height;
        let window = self.config.window_size;
        let records =
            match guarded(&cancel, ledger.get_transactions_for_blocks(start, window)).await {
                Ok(records) => records,
                Err(e) => return self.backoff("window", e),
            };

        self.cursor.advance(&records, window, height);
        if self.cursor.scanned_height == start {
            warn!(
                start,
                records = records.len(),
                "Window held no records at or above its start; retrying later"
            );
            self.progress.set_stage(SyncStage::Backoff);
            return self.config.retry_delay;
        }
        self.progress.set_scanned(self.cursor.scanned_height);
        debug!(
            start,
            records = records.len(),
            scanned = self.cursor.scanned_height,
            height,
            "Window loaded"
        );

        self.enqueue(records);
        self.progress.set_error(None);
        self.progress.set_stage(SyncStage::Idle);
        Duration::ZERO
    }

    /// Decode tick: recycle when due, otherwise dispatch the next batch
    pub fn check_transactions(&mut self) {
        if self.pool.in_flight_expired() {
            warn!(
                generation = self.pool.generation(),
                "Decode worker unresponsive; recycling"
            );
            self.recycle_worker();
            return;
        }
        if self.pool.is_busy() || !self.pool.is_ready() {
            return;
        }
        if self.pool.recycle_due() {
            self.recycle_worker();
            return;
        }

        let take = self.queue.len().min(self.config.max_batch_records);
        if take == 0 {
            self.decode_active = false;
            self.settle_wallet_height();
            return;
        }

        let batch: Vec<RawTransactionRecord> = self.queue.drain(..take).collect();
        let tail = SplitHeight::tail_of(&batch);
        match self.pool.dispatch(batch) {
            Ok(()) => {
                self.in_flight_tail = tail;
                self.progress.set_stage(SyncStage::DispatchingBatch);
            }
            Err(refused) => {
                debug!(error = %refused.error, "Dispatch refused; requeueing batch");
                for record in refused.batch.into_iter().rev() {
                    self.queue.push_front(record);
                }
            }
        }
        self.progress.set_pending(self.queue.len());
    }

    fn on_pool_update(&mut self, update: PoolUpdate) {
        match update {
            PoolUpdate::NeedsWallet => self.send_wallet(true),
            PoolUpdate::WalletLoaded => {
                debug!(generation = self.pool.generation(), "Decode worker ready");
            }
            PoolUpdate::BatchDone(outcome) => self.apply_batch(outcome),
            PoolUpdate::Stale => {}
        }
    }

    fn on_command(&mut self, command: SyncCommand) {
        match command {
            SyncCommand::CheckMempool => self.check_mempool(),
            SyncCommand::WalletUpdated => {
                info!(event = "wallet_updated", "Re-validating from wallet height");
                self.split = None;
                self.recycle_worker();
            }
        }
    }

    fn apply_batch(&mut self, outcome: BatchOutcome) {
        let found = outcome.transactions.len();
        for tx in outcome.transactions {
            debug!(hash = %tx.hash, height = ?tx.height, "Adding transaction to wallet");
            self.wallet.add_new_transaction(tx);
        }

        let tail = self.in_flight_tail.take();
        if let Some(last) = outcome.last_height_seen {
            // A height split across batches is not complete yet
            let split = self.queue.front().and_then(|r| r.height) == Some(last);
            let applied = if split { last.saturating_sub(1) } else { last };
            if split {
                if let Some(tail) = tail {
                    self.remember_split(tail);
                }
            }
            if applied > self.wallet.last_height() {
                self.wallet.set_last_height(applied);
            }
        }
        self.settle_wallet_height();
        let applied = self.wallet.last_height();
        if self.split.as_ref().is_some_and(|s| s.height <= applied) {
            self.split = None;
        }

        if !outcome.failures.is_empty() {
            debug!(failures = outcome.failures.len(), "Records skipped in batch");
        }
        self.progress.record_batch(
            found as u64,
            outcome.failures.len() as u64,
            outcome.elapsed.as_millis() as u64,
        );

        // New outputs change what the worker must look for; the queue stays
        if found > 0 || self.refresh_pending {
            self.send_wallet(false);
        }
    }

    fn remember_split(&mut self, tail: SplitHeight) {
        match &mut self.split {
            Some(split) if split.height == tail.height => split.decoded.extend(tail.decoded),
            _ => self.split = Some(tail),
        }
    }

    /// Hand the wallet to the worker.
    ///
    /// With `rewind` (a fresh generation), the cursor goes back to the wallet
    /// height and the queue is dropped so the window is fetched again.
    fn send_wallet(&mut self, rewind: bool) {
        let rewind = rewind || self.rewind_pending;
        let snapshot = self.wallet.export_view_state();
        match self.pool.init_wallet(snapshot) {
            Ok(()) => {
                self.refresh_pending = false;
                self.rewind_pending = false;
                let height = self.wallet.last_height();
                if rewind {
                    self.cursor.reset_to(height);
                    self.queue.clear();
                    self.progress.set_scanned(height);
                    self.progress.set_pending(0);
                }
                debug!(
                    generation = self.pool.generation(),
                    height, rewind, "Wallet sent to decode worker"
                );
            }
            Err(e) => {
                debug!(error = %e, "Wallet refresh deferred");
                self.refresh_pending = true;
                self.rewind_pending = rewind;
            }
        }
    }

    fn recycle_worker(&mut self) {
        self.in_flight_tail = None;
        self.pool.recycle();
        self.progress.set_worker_generation(self.pool.generation());
        self.progress.set_stage(SyncStage::AwaitingWorker);
    }

    fn enqueue(&mut self, records: Vec<RawTransactionRecord>) {
        let last = self.wallet.last_height();
        let before = self.queue.len();
        let split = self.split.as_ref();
        self.queue.extend(
            records
                .into_iter()
                .filter(|r| r.is_above(last) && !split.is_some_and(|s| s.covers(r))),
        );

        if self.queue.len() > before {
            self.decode_active = true;
        } else {
            self.settle_wallet_height();
        }
        self.progress.set_pending(self.queue.len());
    }

    /// With nothing queued or in flight, everything below the cursor is applied
    fn settle_wallet_height(&mut self) {
        if !self.queue.is_empty() || self.pool.is_busy() || !self.pool.is_ready() {
            return;
        }
        let applied = self.cursor.scanned_height.saturating_sub(1);
        if applied > self.wallet.last_height() {
            self.wallet.set_last_height(applied);
        }
    }

    fn check_mempool(&mut self) {
        if self.mempool.check(&self.cursor) {
            debug!(scanned = self.cursor.scanned_height, "Mempool check started");
        }
    }

    fn backoff(&mut self, request: &str, error: Error) -> Duration {
        if matches!(error, Error::Cancelled) {
            return Duration::ZERO;
        }
        let retry_in_ms = self.config.retry_delay.as_millis() as u64;
        if error.is_transient() {
            warn!(
                event = "sync_backoff",
                request,
                error = %error,
                retry_in_ms,
                "Fetch failed; retrying later"
            );
        } else {
            error!(
                event = "sync_backoff",
                request,
                error = %error,
                retry_in_ms,
                "Node request failed unexpectedly; retrying later"
            );
        }
        self.progress.set_error(Some(error.to_string()));
        self.progress.set_stage(SyncStage::Backoff);
        self.config.retry_delay
    }

    fn shutdown(&mut self) {
        self.queue.clear();
        self.decode_active = false;
        self.pool.retire();
        self.mempool.abort();
        self.progress.set_pending(0);
        self.progress.set_stage(SyncStage::Stopped);
        info!(
            event = "sync_stop",
            scanned = self.cursor.scanned_height,
            "Sync scheduler stopped"
        );
    }
}

/// Race a request against cancellation; a late result is discarded
async fn guarded<T, F>(cancel: &CancelToken, request: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    tokio::select! {
        result = request => result,
        _ = cancel.cancelled() => Err(Error::Cancelled),
    }
}

/// Control handle for a spawned scheduler
#[derive(Clone)]
pub struct SyncHandle {
    commands: mpsc::UnboundedSender<SyncCommand>,
    cancel: CancelToken,
    progress: SyncProgress,
    task: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl SyncHandle {
    /// Stop the loop for good; the pending queue is dropped
    pub fn stop(&self) {
        self.cancel.cancel();
    }

    /// Whether stop was requested
    pub fn is_stopped(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Run a (gated) mempool check now
    pub fn check_mempool_now(&self) {
        let _ = self.commands.send(SyncCommand::CheckMempool);
    }

    /// Wallet changed outside the engine; reload it into a fresh worker
    pub fn wallet_updated(&self) {
        let _ = self.commands.send(SyncCommand::WalletUpdated);
    }

    /// Shared progress
    pub fn progress(&self) -> SyncProgress {
        self.progress.clone()
    }

    /// Broadcast a signed transaction, then refresh the mempool
    pub async fn broadcast<L: LedgerApi + ?Sized>(&self, ledger: &L, tx_hex: &str) -> Result<()> {
        ledger.send_raw_transaction(tx_hex).await?;
        info!(event = "tx_broadcast", "Transaction accepted by node");
        self.check_mempool_now();
        Ok(())
    }

    /// Wait for the loop task to finish
    pub async fn join(&self) {
        let task = self.task.lock().take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                if !e.is_cancelled() {
                    warn!(error = %e, "Sync task ended abnormally");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::DecodeError;
    use crate::types::{DecodedTransaction, PeerInfo, RawOutput};
    use crate::wallet::ViewStateSnapshot;
    use async_trait::async_trait;
    use ledger_name_resolution::AliasRecord;
    use std::sync::atomic::{AtomicU64, Ordering};

    #[derive(Default)]
    struct ScriptedLedger {
        heights: Mutex<VecDeque<Result<u64>>>,
        windows: Mutex<VecDeque<Result<Vec<RawTransactionRecord>>>>,
        window_starts: Mutex<Vec<u64>>,
    }

    impl ScriptedLedger {
        fn push_height(&self, h: Result<u64>) {
            self.heights.lock().push_back(h);
        }
        fn push_window(&self, w: Result<Vec<RawTransactionRecord>>) {
            self.windows.lock().push_back(w);
        }
    }

    #[async_trait]
    impl LedgerApi for ScriptedLedger {
        async fn get_height(&self) -> Result<u64> {
            self.heights.lock().pop_front().unwrap_or(Ok(0))
        }
        async fn get_transactions_for_blocks(
            &self,
            start: u64,
            _window: u64,
        ) -> Result<Vec<RawTransactionRecord>> {
            self.window_starts.lock().push(start);
            self.windows.lock().pop_front().unwrap_or(Ok(Vec::new()))
        }
        async fn get_mempool(&self) -> Result<Vec<RawTransactionRecord>> {
            Ok(Vec::new())
        }
        async fn send_raw_transaction(&self, _tx_hex: &str) -> Result<()> {
            Ok(())
        }
        async fn get_peer_info(&self) -> Result<PeerInfo> {
            Ok(PeerInfo::default())
        }
        async fn resolve_alias(&self, name: &str) -> Result<AliasRecord> {
            Err(ledger_name_resolution::Error::InvalidName(name.to_string()).into())
        }
    }

    #[derive(Default)]
    struct TestWallet {
        height: AtomicU64,
        txs: Mutex<Vec<DecodedTransaction>>,
    }

    impl WalletStore for TestWallet {
        fn last_height(&self) -> u64 {
            self.height.load(Ordering::SeqCst)
        }
        fn set_last_height(&self, height: u64) {
            self.height.store(height, Ordering::SeqCst);
        }
        fn add_new_transaction(&self, transaction: DecodedTransaction) {
            self.txs.lock().push(transaction);
        }
        fn export_view_state(&self) -> ViewStateSnapshot {
            ViewStateSnapshot {
                address: "QWC1".into(),
                view_secret_key: "11".repeat(32),
                spend_public_key: "22".repeat(32),
                key_images: Vec::new(),
                last_height: self.last_height(),
            }
        }
        fn replace_mempool_transactions(&self, _transactions: Vec<DecodedTransaction>) {}
    }

    struct NoopDecoder;

    impl TransactionDecoder for NoopDecoder {
        fn decode(
            &self,
            _view: &ViewStateSnapshot,
            _record: &RawTransactionRecord,
        ) -> std::result::Result<Option<DecodedTransaction>, DecodeError> {
            Ok(None)
        }
    }

    fn record(height: u64) -> RawTransactionRecord {
        RawTransactionRecord {
            hash: format!("{:064x}", height),
            outputs: vec![RawOutput {
                global_index: height,
                public_key: Some(format!("{:064x}", height + 1)),
            }],
            height: Some(height),
            timestamp: None,
            global_index_start: height,
            body: serde_json::Value::Null,
            parse_error: None,
        }
    }

    fn record_at(hash: &str, height: u64) -> RawTransactionRecord {
        RawTransactionRecord {
            hash: hash.to_string(),
            ..record(height)
        }
    }

    async fn settle(scheduler: &mut TestScheduler) {
        let event = scheduler.pool.next_event().await.unwrap();
        let update = scheduler.pool.handle_event(event);
        scheduler.on_pool_update(update);
    }

    fn config() -> SyncConfig {
        SyncConfig {
            worker_timeout: None,
            ..SyncConfig::default()
        }
    }

    type TestScheduler = SyncScheduler<ScriptedLedger, TestWallet, NoopDecoder>;

    async fn ready_scheduler(wallet_height: u64) -> (TestScheduler, Arc<ScriptedLedger>) {
        ready_scheduler_with(wallet_height, config()).await
    }

    async fn ready_scheduler_with(
        wallet_height: u64,
        config: SyncConfig,
    ) -> (TestScheduler, Arc<ScriptedLedger>) {
        let ledger = Arc::new(ScriptedLedger::default());
        let wallet = Arc::new(TestWallet::default());
        wallet.set_last_height(wallet_height);
        let mut scheduler =
            SyncScheduler::new(Arc::clone(&ledger), wallet, Arc::new(NoopDecoder), config);
        scheduler.pool.start();
        while !scheduler.pool.is_ready() {
            let event = scheduler.pool.next_event().await.unwrap();
            let update = scheduler.pool.handle_event(event);
            scheduler.on_pool_update(update);
        }
        (scheduler, ledger)
    }

    #[tokio::test]
    async fn test_waits_for_worker_before_fetching() {
        let ledger = Arc::new(ScriptedLedger::default());
        let mut scheduler = SyncScheduler::new(
            Arc::clone(&ledger),
            Arc::new(TestWallet::default()),
            Arc::new(NoopDecoder),
            config(),
        );
        scheduler.pool.start();

        let delay = scheduler.load_history().await;
        assert_eq!(delay, Duration::from_millis(250));
        assert!(ledger.window_starts.lock().is_empty());
    }

    #[tokio::test]
    async fn test_enqueue_filters_below_wallet_height() {
        let (mut scheduler, ledger) = ready_scheduler(200).await;
        ledger.push_height(Ok(1_000));
        ledger.push_window(Ok(vec![record(150), record(205), record(207)]));

        let delay = scheduler.load_history().await;
        assert_eq!(delay, Duration::ZERO);
        assert_eq!(*ledger.window_starts.lock(), vec![200]);

        let queued: Vec<Option<u64>> = scheduler.queue.iter().map(|r| r.height).collect();
        assert_eq!(queued, vec![Some(205), Some(207)]);
        assert_eq!(scheduler.cursor().scanned_height, 208);
        assert!(scheduler.decode_active);
    }

    #[tokio::test]
    async fn test_empty_window_clamps_to_height() {
        let (mut scheduler, ledger) = ready_scheduler(200).await;
        ledger.push_height(Ok(250));
        ledger.push_window(Ok(Vec::new()));

        scheduler.load_history().await;
        assert_eq!(scheduler.cursor().scanned_height, 250);
        assert_eq!(scheduler.wallet.last_height(), 249);
    }

    #[tokio::test]
    async fn test_caught_up_slow_polls() {
        let (mut scheduler, ledger) = ready_scheduler(300).await;
        ledger.push_height(Ok(300));

        let delay = scheduler.load_history().await;
        assert_eq!(delay, Duration::from_secs(30));
        assert!(ledger.window_starts.lock().is_empty());
        assert_eq!(scheduler.progress.stage(), SyncStage::Idle);
    }

    #[tokio::test]
    async fn test_node_behind_cursor_keeps_cursor() {
        let (mut scheduler, ledger) = ready_scheduler(300).await;
        ledger.push_height(Ok(120));

        let delay = scheduler.load_history().await;
        assert_eq!(delay, Duration::from_secs(30));
        assert_eq!(scheduler.cursor().scanned_height, 300);
    }

    #[tokio::test]
    async fn test_transport_failures_back_off() {
        let (mut scheduler, ledger) = ready_scheduler(0).await;
        ledger.push_height(Err(Error::transport("http://node/getheight", "HTTP 500", None)));
        assert_eq!(scheduler.load_history().await, Duration::from_secs(30));
        assert_eq!(scheduler.progress.stage(), SyncStage::Backoff);
        assert!(scheduler.progress.last_error().is_some());

        ledger.push_height(Ok(500));
        ledger.push_window(Err(Error::transport("http://node/w", "timeout", None)));
        assert_eq!(scheduler.load_history().await, Duration::from_secs(30));
        assert_eq!(scheduler.cursor().scanned_height, 0);
        assert_eq!(scheduler.cursor().max_observed_height, 500);
    }

    #[tokio::test]
    async fn test_backlog_throttles() {
        let (mut scheduler, ledger) = ready_scheduler(0).await;
        scheduler.queue.extend((1..=101).map(record));

        assert_eq!(scheduler.load_history().await, Duration::from_secs(1));
        assert_eq!(scheduler.progress.stage(), SyncStage::Throttled);
        assert!(ledger.window_starts.lock().is_empty());
    }

    #[tokio::test]
    async fn test_decode_tick_waits_for_worker() {
        let (mut scheduler, _ledger) = ready_scheduler(0).await;
        scheduler.queue.extend((1..=60).map(record));
        scheduler.pool.retire();
        scheduler.pool.start();

        scheduler.check_transactions();
        assert_eq!(scheduler.queue.len(), 60);

        // Worker not ready: nothing left the queue, order intact
        let heights: Vec<u64> = scheduler.queue.iter().filter_map(|r| r.height).collect();
        assert_eq!(heights, (1..=60).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn test_recycle_takes_precedence_over_dispatch() {
        let config = SyncConfig {
            recycle_after_batches: 1,
            max_batch_records: 2,
            ..config()
        };
        let (mut scheduler, _ledger) = ready_scheduler_with(0, config).await;
        scheduler.queue.extend((1..=4).map(record));

        scheduler.check_transactions();
        assert!(scheduler.pool.is_busy());
        assert_eq!(scheduler.queue.len(), 2);

        // A second tick while busy dispatches nothing
        scheduler.check_transactions();
        assert_eq!(scheduler.queue.len(), 2);

        let event = scheduler.pool.next_event().await.unwrap();
        let update = scheduler.pool.handle_event(event);
        scheduler.on_pool_update(update);
        assert_eq!(scheduler.wallet.last_height(), 2);

        let generation = scheduler.pool.generation();
        scheduler.check_transactions();
        assert_eq!(scheduler.pool.generation(), generation + 1);
        assert_eq!(scheduler.queue.len(), 2);
        assert!(!scheduler.pool.is_ready());
    }

    #[tokio::test]
    async fn test_batch_split_height_not_applied() {
        let (mut scheduler, _ledger) = ready_scheduler(0).await;
        scheduler.queue.push_back(record(205));
        scheduler.apply_batch(BatchOutcome {
            transactions: Vec::new(),
            last_height_seen: Some(205),
            failures: Vec::new(),
            records: 50,
            elapsed: Duration::from_millis(5),
        });
        assert_eq!(scheduler.wallet.last_height(), 204);
    }

    #[tokio::test]
    async fn test_stale_window_retries_later() {
        let (mut scheduler, ledger) = ready_scheduler(300).await;
        ledger.push_height(Ok(1_000));
        ledger.push_window(Ok(vec![record(120), record(250)]));

        let delay = scheduler.load_history().await;
        assert_eq!(delay, Duration::from_secs(30));
        assert_eq!(scheduler.cursor().scanned_height, 300);
        assert!(scheduler.queue.is_empty());
        assert_eq!(scheduler.progress.stage(), SyncStage::Backoff);
    }

    #[tokio::test]
    async fn test_refresh_after_found_keeps_queue() {
        let (mut scheduler, _ledger) = ready_scheduler(9).await;
        scheduler.cursor = SyncCursor::new(11);
        scheduler
            .queue
            .extend((2..5).map(|i| record_at(&format!("h10-{}", i), 10)));
        scheduler.in_flight_tail =
            SplitHeight::tail_of(&[record_at("h10-0", 10), record_at("h10-1", 10)]);

        scheduler.apply_batch(BatchOutcome {
            transactions: vec![DecodedTransaction {
                hash: "h10-0".into(),
                height: Some(10),
                timestamp: None,
                outputs: Vec::new(),
                inputs: Vec::new(),
                fee: 0,
                payment_id: None,
            }],
            last_height_seen: Some(10),
            failures: Vec::new(),
            records: 2,
            elapsed: Duration::from_millis(1),
        });

        assert_eq!(scheduler.wallet.txs.lock().len(), 1);
        assert_eq!(scheduler.wallet.last_height(), 9);
        assert_eq!(scheduler.cursor().scanned_height, 11);
        assert_eq!(scheduler.queue.len(), 3);
        assert!(!scheduler.pool.is_ready());
        assert_eq!(scheduler.split.as_ref().map(|s| s.decoded.len()), Some(2));

        // Same generation reloads the wallet and carries on with the queue
        settle(&mut scheduler).await;
        assert!(scheduler.pool.is_ready());
        let queued: Vec<&str> = scheduler.queue.iter().map(|r| r.hash.as_str()).collect();
        assert_eq!(queued, vec!["h10-2", "h10-3", "h10-4"]);
    }

    #[tokio::test]
    async fn test_rewind_skips_decoded_part_of_split_height() {
        let config = SyncConfig {
            max_batch_records: 2,
            ..config()
        };
        let (mut scheduler, ledger) = ready_scheduler_with(9, config).await;
        scheduler
            .queue
            .extend((0..5).map(|i| record_at(&format!("h10-{}", i), 10)));
        scheduler.cursor = SyncCursor::new(11);

        scheduler.check_transactions();
        settle(&mut scheduler).await;
        assert_eq!(scheduler.wallet.last_height(), 9);

        // Fresh generation: cursor rewinds and the window comes back whole
        scheduler.recycle_worker();
        settle(&mut scheduler).await;
        assert_eq!(scheduler.cursor().scanned_height, 9);
        assert!(scheduler.queue.is_empty());
        settle(&mut scheduler).await;
        assert!(scheduler.pool.is_ready());

        ledger.push_height(Ok(50));
        ledger.push_window(Ok((0..5).map(|i| record_at(&format!("h10-{}", i), 10)).collect()));
        scheduler.load_history().await;

        let queued: Vec<&str> = scheduler.queue.iter().map(|r| r.hash.as_str()).collect();
        assert_eq!(queued, vec!["h10-2", "h10-3", "h10-4"]);
    }

    #[tokio::test]
    async fn test_wallet_updated_forgets_split_progress() {
        let (mut scheduler, _ledger) = ready_scheduler(9).await;
        scheduler.split = SplitHeight::tail_of(&[record_at("h10-0", 10)]);
        scheduler.on_command(SyncCommand::WalletUpdated);
        assert!(scheduler.split.is_none());
    }

    #[tokio::test]
    async fn test_handle_before_spawn_joins_loop() {
        let scheduler = SyncScheduler::new(
            Arc::new(ScriptedLedger::default()),
            Arc::new(TestWallet::default()),
            Arc::new(NoopDecoder),
            config(),
        );
        let early = scheduler.handle();
        let spawned = scheduler.spawn();

        early.stop();
        tokio::time::timeout(Duration::from_secs(5), early.join())
            .await
            .unwrap();
        assert!(spawned.is_stopped());
        assert!(spawned.task.lock().is_none());
    }
}
