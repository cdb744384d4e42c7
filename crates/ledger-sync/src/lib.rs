//! Remote-node wallet sync engine
//!
//! Keeps a local wallet in step with a remote ledger node: fetches height
//! windows over JSON-RPC, decodes them on a recyclable worker, watches the
//! mempool once caught up, and samples decoy outputs for ring construction.

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![allow(clippy::result_large_err)]

pub mod cancel;
pub mod client;
pub mod config;
pub mod error;
pub mod mempool;
pub mod progress;
pub mod sampler;
pub mod sync;
pub mod types;
pub mod wallet;
pub mod worker;

pub use cancel::CancelToken;
pub use client::{LedgerApi, LedgerClientConfig, RemoteLedgerClient};
pub use config::SyncConfig;
pub use error::{DecodeError, Error, Result};
pub use ledger_name_resolution::AliasRecord;
pub use mempool::{mempool_check_allowed, MempoolWatcher};
pub use progress::{DecodeCountersSnapshot, SyncProgress, SyncStage};
pub use sampler::{draw_triangular, OutputSampler, SamplerConfig};
pub use sync::{SyncHandle, SyncScheduler};
pub use types::{
    DecodedTransaction, DecoyOutput, OwnedOutput, PeerInfo, RawOutput, RawTransactionRecord,
    SpentInput, SyncCursor,
};
pub use wallet::{TransactionDecoder, ViewStateSnapshot, WalletStore};
pub use worker::{BatchOutcome, DecodeWorkerPool, PoolUpdate, WorkerState};
