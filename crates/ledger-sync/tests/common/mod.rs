//! In-memory collaborators shared by the integration tests

#![allow(dead_code)]

use async_trait::async_trait;
use ledger_sync::{
    AliasRecord, DecodeError, DecodedTransaction, Error, LedgerApi, OwnedOutput, PeerInfo,
    RawOutput, RawTransactionRecord, Result, TransactionDecoder, ViewStateSnapshot, WalletStore,
};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;
use tokio::time::Instant;

/// Output key the test decoder treats as belonging to the wallet
pub const MINE: &str = "mine";

// ============================================================================
// Ledger
// ============================================================================

/// Scriptable in-memory chain
#[derive(Default)]
pub struct MemoryLedger {
    height: AtomicU64,
    records: Mutex<BTreeMap<u64, Vec<RawTransactionRecord>>>,
    mempool: Mutex<Vec<RawTransactionRecord>>,
    fail_heights: AtomicUsize,
    fail_windows: AtomicUsize,
    windows_always_fail: AtomicBool,
    height_calls: Mutex<Vec<Instant>>,
    window_starts: Mutex<Vec<u64>>,
    mempool_calls: AtomicUsize,
    broadcasts: Mutex<Vec<String>>,
}

impl MemoryLedger {
    pub fn with_height(height: u64) -> Self {
        let ledger = Self::default();
        ledger.set_height(height);
        ledger
    }

    pub fn set_height(&self, height: u64) {
        self.height.store(height, Ordering::SeqCst);
    }

    pub fn add(&self, record: RawTransactionRecord) {
        let height = record.height.unwrap_or_default();
        self.records.lock().entry(height).or_default().push(record);
    }

    pub fn set_mempool(&self, records: Vec<RawTransactionRecord>) {
        *self.mempool.lock() = records;
    }

    pub fn fail_next_heights(&self, count: usize) {
        self.fail_heights.store(count, Ordering::SeqCst);
    }

    pub fn fail_next_windows(&self, count: usize) {
        self.fail_windows.store(count, Ordering::SeqCst);
    }

    pub fn fail_all_windows(&self) {
        self.windows_always_fail.store(true, Ordering::SeqCst);
    }

    pub fn height_calls(&self) -> Vec<Instant> {
        self.height_calls.lock().clone()
    }

    pub fn window_starts(&self) -> Vec<u64> {
        self.window_starts.lock().clone()
    }

    pub fn mempool_calls(&self) -> usize {
        self.mempool_calls.load(Ordering::SeqCst)
    }

    pub fn broadcasts(&self) -> Vec<String> {
        self.broadcasts.lock().clone()
    }

    fn take_failure(counter: &AtomicUsize) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl LedgerApi for MemoryLedger {
    async fn get_height(&self) -> Result<u64> {
        self.height_calls.lock().push(Instant::now());
        if Self::take_failure(&self.fail_heights) {
            return Err(Error::transport("memory://getheight", "HTTP 502", None));
        }
        Ok(self.height.load(Ordering::SeqCst))
    }

    async fn get_transactions_for_blocks(
        &self,
        start: u64,
        window: u64,
    ) -> Result<Vec<RawTransactionRecord>> {
        self.window_starts.lock().push(start);
        if self.windows_always_fail.load(Ordering::SeqCst) || Self::take_failure(&self.fail_windows)
        {
            return Err(Error::transport("memory://window", "connection reset", None));
        }
        let end = start.saturating_add(window);
        Ok(self
            .records
            .lock()
            .range(start..end)
            .flat_map(|(_, records)| records.iter().cloned())
            .collect())
    }

    async fn get_mempool(&self) -> Result<Vec<RawTransactionRecord>> {
        self.mempool_calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.mempool.lock().clone())
    }

    async fn send_raw_transaction(&self, tx_hex: &str) -> Result<()> {
        self.broadcasts.lock().push(tx_hex.to_string());
        Ok(())
    }

    async fn get_peer_info(&self) -> Result<PeerInfo> {
        Ok(PeerInfo {
            fee_address: None,
            status: "OK".into(),
        })
    }

    async fn resolve_alias(&self, name: &str) -> Result<AliasRecord> {
        Ok(AliasRecord {
            address: format!("QWC-{}", name),
            name: Some(name.to_string()),
        })
    }
}

/// Record at `height` with one output per key
pub fn record(hash: &str, height: Option<u64>, keys: &[&str]) -> RawTransactionRecord {
    let base = height.unwrap_or_default() * 10;
    RawTransactionRecord {
        hash: hash.to_string(),
        outputs: keys
            .iter()
            .enumerate()
            .map(|(i, key)| RawOutput {
                global_index: base + i as u64,
                public_key: Some(key.to_string()),
            })
            .collect(),
        height,
        timestamp: height.map(|h| 1_600_000_000 + h * 120),
        global_index_start: base,
        body: serde_json::Value::Null,
        parse_error: None,
    }
}

// ============================================================================
// Wallet
// ============================================================================

/// Wallet keeping everything in memory
#[derive(Default)]
pub struct MemoryWallet {
    height: AtomicU64,
    transactions: Mutex<BTreeMap<String, DecodedTransaction>>,
    mempool: Mutex<Vec<DecodedTransaction>>,
    exports: AtomicUsize,
}

impl MemoryWallet {
    pub fn at_height(height: u64) -> Self {
        let wallet = Self::default();
        wallet.set_last_height(height);
        wallet
    }

    pub fn transaction_hashes(&self) -> Vec<String> {
        self.transactions.lock().keys().cloned().collect()
    }

    pub fn mempool(&self) -> Vec<DecodedTransaction> {
        self.mempool.lock().clone()
    }

    pub fn exports(&self) -> usize {
        self.exports.load(Ordering::SeqCst)
    }
}

impl WalletStore for MemoryWallet {
    fn last_height(&self) -> u64 {
        self.height.load(Ordering::SeqCst)
    }

    fn set_last_height(&self, height: u64) {
        self.height.store(height, Ordering::SeqCst);
    }

    fn add_new_transaction(&self, transaction: DecodedTransaction) {
        self.transactions
            .lock()
            .insert(transaction.hash.clone(), transaction);
    }

    fn export_view_state(&self) -> ViewStateSnapshot {
        self.exports.fetch_add(1, Ordering::SeqCst);
        ViewStateSnapshot {
            address: "QWC1test".into(),
            view_secret_key: "11".repeat(32),
            spend_public_key: "22".repeat(32),
            key_images: Vec::new(),
            last_height: self.last_height(),
        }
    }

    fn replace_mempool_transactions(&self, transactions: Vec<DecodedTransaction>) {
        *self.mempool.lock() = transactions;
    }
}

// ============================================================================
// Decoder
// ============================================================================

/// Claims outputs whose key is in the watch set; rejects hashes marked bad
pub struct WatchDecoder {
    keys: HashSet<String>,
}

impl Default for WatchDecoder {
    fn default() -> Self {
        Self {
            keys: [MINE.to_string()].into_iter().collect(),
        }
    }
}

impl TransactionDecoder for WatchDecoder {
    fn decode(
        &self,
        _view: &ViewStateSnapshot,
        record: &RawTransactionRecord,
    ) -> std::result::Result<Option<DecodedTransaction>, DecodeError> {
        if record.hash.starts_with("bad") {
            return Err(DecodeError::Malformed {
                hash: record.hash.clone(),
                reason: "unparseable extra".into(),
            });
        }
        let outputs: Vec<OwnedOutput> = record
            .outputs
            .iter()
            .enumerate()
            .filter_map(|(i, o)| {
                let key = o.public_key.as_ref().filter(|k| self.keys.contains(*k))?;
                Some(OwnedOutput {
                    output_index: i as u32,
                    global_index: o.global_index,
                    amount: 1_000,
                    public_key: key.clone(),
                })
            })
            .collect();
        if outputs.is_empty() {
            return Ok(None);
        }
        Ok(Some(DecodedTransaction {
            hash: record.hash.clone(),
            height: record.height,
            timestamp: record.timestamp,
            outputs,
            inputs: Vec::new(),
            fee: 10,
            payment_id: None,
        }))
    }
}

// ============================================================================
// Helpers
// ============================================================================

/// Poll `condition` on simulated time; false if it never held
pub async fn wait_until<F: Fn() -> bool>(condition: F) -> bool {
    for _ in 0..20_000 {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    condition()
}
