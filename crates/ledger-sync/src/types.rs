//! Data model shared by the fetch, decode and sampling paths

use serde::{Deserialize, Serialize};

/// One output of a node-supplied transaction
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawOutput {
    /// Chain-wide output index
    pub global_index: u64,
    /// One-time output public key (hex); `None` for targets without a single key
    pub public_key: Option<String>,
}

/// Transaction as returned by the remote node, annotated on fetch
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawTransactionRecord {
    /// Transaction hash (hex)
    pub hash: String,
    /// Outputs in transaction order
    pub outputs: Vec<RawOutput>,
    /// Block height; `None` for mempool transactions
    pub height: Option<u64>,
    /// Block timestamp (unix seconds), when known
    pub timestamp: Option<u64>,
    /// Global index of the first output in this transaction
    pub global_index_start: u64,
    /// Node JSON with signature payloads stripped, handed to the decoder
    pub body: serde_json::Value,
    /// Why the body could not be read; the decoder never sees such a record
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parse_error: Option<String>,
}

impl RawTransactionRecord {
    /// Whether this record came from the mempool
    pub fn is_mempool(&self) -> bool {
        self.height.is_none()
    }

    /// Whether this record is newer than `last_height`
    pub fn is_above(&self, last_height: u64) -> bool {
        self.height.map(|h| h > last_height).unwrap_or(false)
    }
}

/// Wallet output found in a transaction
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OwnedOutput {
    /// Position within the transaction
    pub output_index: u32,
    /// Chain-wide output index
    pub global_index: u64,
    /// Amount in atomic units
    pub amount: u64,
    /// One-time output public key (hex)
    pub public_key: String,
}

/// Wallet output spent by a transaction
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpentInput {
    /// Key image of the spent output (hex)
    pub key_image: String,
    /// Amount in atomic units
    pub amount: u64,
}

/// Wallet-relevant transaction produced by the decoder
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DecodedTransaction {
    /// Transaction hash (hex)
    pub hash: String,
    /// Block height; `None` while in the mempool
    pub height: Option<u64>,
    /// Block timestamp (unix seconds), when known
    pub timestamp: Option<u64>,
    /// Outputs paying the wallet
    pub outputs: Vec<OwnedOutput>,
    /// Wallet outputs spent
    pub inputs: Vec<SpentInput>,
    /// Fee in atomic units
    pub fee: u64,
    /// Payment id, if present
    pub payment_id: Option<String>,
}

impl DecodedTransaction {
    /// Total received in atomic units
    pub fn received(&self) -> u64 {
        self.outputs.iter().map(|o| o.amount).sum()
    }

    /// Total spent in atomic units
    pub fn spent(&self) -> u64 {
        self.inputs.iter().map(|i| i.amount).sum()
    }

    /// Signed balance change for the wallet
    pub fn net_amount(&self) -> i128 {
        self.received() as i128 - self.spent() as i128
    }
}

/// Scheduler cursor
///
/// `scanned_height` is the next height boundary to fetch from. It only moves
/// forward except through [`SyncCursor::reset_to`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncCursor {
    /// Fetch boundary; everything below it has been fetched
    pub scanned_height: u64,
    /// Highest chain height ever reported by the node
    pub max_observed_height: u64,
}

impl SyncCursor {
    /// Cursor starting at `height`
    pub fn new(height: u64) -> Self {
        Self {
            scanned_height: height,
            max_observed_height: height,
        }
    }

    /// Record a node-reported chain height
    pub fn observe(&mut self, height: u64) {
        if height > self.max_observed_height {
            self.max_observed_height = height;
        }
    }

    /// Whether the cursor has reached `height`
    pub fn is_caught_up(&self, height: u64) -> bool {
        self.scanned_height >= height
    }

    /// Advance past a fetched window.
    ///
    /// An empty window moves the boundary by `window_size`, clamped to
    /// `height`; otherwise it moves to one past the highest record height.
    pub fn advance(&mut self, records: &[RawTransactionRecord], window_size: u64, height: u64) {
        let next = match records.iter().filter_map(|r| r.height).max() {
            Some(last) => last.saturating_add(1),
            None if self.scanned_height < height => {
                self.scanned_height.saturating_add(window_size).min(height)
            }
            None => height,
        };
        if next > self.scanned_height {
            self.scanned_height = next;
        }
    }

    /// Explicit reset used when a fresh worker generation re-validates
    pub fn reset_to(&mut self, height: u64) {
        self.scanned_height = height;
        self.observe(height);
    }

    /// Blocks between the scanned boundary and the highest observed height
    pub fn gap(&self) -> u64 {
        self.max_observed_height.saturating_sub(self.scanned_height)
    }
}

/// Output reference chosen as a ring decoy
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DecoyOutput {
    /// One-time output public key (hex)
    pub public_key: String,
    /// Chain-wide output index
    pub global_index: u64,
}

/// Remote node information
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerInfo {
    /// Address the node operator collects fees at, if any
    pub fee_address: Option<String>,
    /// Node status string
    pub status: String,
}
