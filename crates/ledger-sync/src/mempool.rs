//! Mempool watcher
//!
//! Runs on its own timer inside the control loop. A check only happens when
//! the cursor is within `mempool_max_gap` of the highest observed height, so
//! mempool spends and receipts are never evaluated against a wallet that is
//! still catching up. The wallet's mempool list is replaced wholesale; fetch
//! errors are swallowed and the next tick retries.

use crate::cancel::CancelToken;
use crate::client::LedgerApi;
use crate::types::{DecodedTransaction, SyncCursor};
use crate::wallet::{TransactionDecoder, WalletStore};
use crate::worker::decode_batch;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::debug;

/// Whether the mempool may be checked at this cursor position
pub fn mempool_check_allowed(cursor: &SyncCursor, max_gap: u64) -> bool {
    cursor.gap() <= max_gap
}

/// Periodic, height-gated mempool check
pub struct MempoolWatcher<L, W, D> {
    ledger: Arc<L>,
    wallet: Arc<W>,
    decoder: Arc<D>,
    cancel: CancelToken,
    max_gap: u64,
    in_flight: Option<JoinHandle<()>>,
}

impl<L, W, D> MempoolWatcher<L, W, D>
where
    L: LedgerApi,
    W: WalletStore,
    D: TransactionDecoder,
{
    /// Create a watcher
    pub fn new(
        ledger: Arc<L>,
        wallet: Arc<W>,
        decoder: Arc<D>,
        cancel: CancelToken,
        max_gap: u64,
    ) -> Self {
        Self {
            ledger,
            wallet,
            decoder,
            cancel,
            max_gap,
            in_flight: None,
        }
    }

    /// Start a check unless gated or one is already running.
    ///
    /// Returns `true` when a fetch was started.
    pub fn check(&mut self, cursor: &SyncCursor) -> bool {
        if !mempool_check_allowed(cursor, self.max_gap) {
            debug!(
                scanned = cursor.scanned_height,
                max_observed = cursor.max_observed_height,
                "Mempool check skipped while catching up"
            );
            return false;
        }
        if self.is_running() {
            return false;
        }

        self.wallet.replace_mempool_transactions(Vec::new());

        let ledger = Arc::clone(&self.ledger);
        let wallet = Arc::clone(&self.wallet);
        let decoder = Arc::clone(&self.decoder);
        let cancel = self.cancel.clone();

        self.in_flight = Some(tokio::spawn(async move {
            let fetched = tokio::select! {
                result = ledger.get_mempool() => result,
                _ = cancel.cancelled() => return,
            };
            let records = match fetched {
                Ok(records) => records,
                Err(e) => {
                    debug!(error = %e, "Mempool fetch failed");
                    return;
                }
            };

            let view = wallet.export_view_state();
            let decoded = tokio::task::spawn_blocking(move || {
                decode_batch(decoder.as_ref(), &view, &records).0
            })
            .await;

            if cancel.is_cancelled() {
                return;
            }
            match decoded {
                Ok(transactions) => {
                    let transactions: Vec<DecodedTransaction> = transactions
                        .into_iter()
                        .map(|mut tx| {
                            tx.height = None;
                            tx
                        })
                        .collect();
                    debug!(count = transactions.len(), "Mempool transactions updated");
                    wallet.replace_mempool_transactions(transactions);
                }
                Err(e) => debug!(error = %e, "Mempool decode task failed"),
            }
        }));
        true
    }

    /// Whether a check is still running
    pub fn is_running(&self) -> bool {
        self.in_flight
            .as_ref()
            .map(|task| !task.is_finished())
            .unwrap_or(false)
    }

    /// Abort a running check
    pub fn abort(&mut self) {
        if let Some(task) = self.in_flight.take() {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gate() {
        let cursor = SyncCursor {
            scanned_height: 498,
            max_observed_height: 500,
        };
        assert!(!mempool_check_allowed(&cursor, 1));

        let cursor = SyncCursor {
            scanned_height: 499,
            max_observed_height: 500,
        };
        assert!(mempool_check_allowed(&cursor, 1));

        let cursor = SyncCursor {
            scanned_height: 500,
            max_observed_height: 500,
        };
        assert!(mempool_check_allowed(&cursor, 1));
    }
}
