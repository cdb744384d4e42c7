//! Wallet collaborator interfaces
//!
//! Key management, balance accounting and transaction parsing live outside
//! this crate. The engine only needs the handles below, which are passed to
//! the scheduler at construction.

use crate::error::DecodeError;
use crate::types::{DecodedTransaction, RawTransactionRecord};
use serde::{Deserialize, Serialize};

/// Serializable view of the wallet handed to each decode worker generation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ViewStateSnapshot {
    /// Public address
    pub address: String,
    /// Private view key (hex, 32 bytes)
    pub view_secret_key: String,
    /// Public spend key (hex, 32 bytes)
    pub spend_public_key: String,
    /// Key images of outputs the wallet owns (hex)
    #[serde(default)]
    pub key_images: Vec<String>,
    /// Last height the wallet has applied
    pub last_height: u64,
}

/// Wallet state mutated by the engine
///
/// Implementations use interior mutability; the scheduler holds an `Arc`.
/// `add_new_transaction` may see the same hash again after a re-validation
/// pass and must merge rather than duplicate.
pub trait WalletStore: Send + Sync + 'static {
    /// Last height whose transactions have been applied
    fn last_height(&self) -> u64;

    /// Record the last applied height
    fn set_last_height(&self, height: u64);

    /// Apply a decoded confirmed transaction
    fn add_new_transaction(&self, transaction: DecodedTransaction);

    /// Export the view state for a decode worker
    fn export_view_state(&self) -> ViewStateSnapshot;

    /// Replace the transient mempool list wholesale
    fn replace_mempool_transactions(&self, transactions: Vec<DecodedTransaction>);
}

/// Turns raw records into wallet-relevant transactions
///
/// Called on the blocking pool. `Ok(None)` means the record does not concern
/// the wallet.
pub trait TransactionDecoder: Send + Sync + 'static {
    /// Decode one record against the wallet view state
    fn decode(
        &self,
        view: &ViewStateSnapshot,
        record: &RawTransactionRecord,
    ) -> std::result::Result<Option<DecodedTransaction>, DecodeError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot() -> ViewStateSnapshot {
        ViewStateSnapshot {
            address: "QWC1".into(),
            view_secret_key: "11".repeat(32),
            spend_public_key: "22".repeat(32),
            key_images: vec!["abcd".into()],
            last_height: 0,
        }
    }

    #[test]
    fn test_snapshot_serde() {
        let json = serde_json::to_string(&snapshot()).unwrap();
        let back: ViewStateSnapshot = serde_json::from_str(&json).unwrap();
        assert_eq!(back, snapshot());
    }
}
