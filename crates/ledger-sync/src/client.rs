//! Remote node client
//!
//! JSON over HTTP POST against one node chosen at random from the configured
//! list. There is no retry at this layer; the scheduler and mempool watcher
//! own the retry policy.

use crate::config::{parse_env_ms, parse_env_string, split_list_env};
use crate::error::{Error, Result};
use crate::types::{PeerInfo, RawOutput, RawTransactionRecord};
use async_trait::async_trait;
use ledger_name_resolution::{AliasRecord, OpenAliasResolver};
use ledger_params::{ConsensusParams, Network};
use parking_lot::Mutex;
use rand::seq::SliceRandom;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::env;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Fields removed from node transaction bodies before they enter the pipeline
const STRIPPED_FIELDS: [&str; 3] = ["signatures", "signatureSize", "unlockTime"];

/// Remote ledger operations used by the engine
#[async_trait]
pub trait LedgerApi: Send + Sync + 'static {
    /// Current chain height
    async fn get_height(&self) -> Result<u64>;

    /// Transactions in `window` heights starting at `start`, in chain order
    async fn get_transactions_for_blocks(
        &self,
        start: u64,
        window: u64,
    ) -> Result<Vec<RawTransactionRecord>>;

    /// Transactions currently in the mempool
    async fn get_mempool(&self) -> Result<Vec<RawTransactionRecord>>;

    /// Broadcast a signed transaction
    async fn send_raw_transaction(&self, tx_hex: &str) -> Result<()>;

    /// Node fee address and status
    async fn get_peer_info(&self) -> Result<PeerInfo>;

    /// Resolve an OpenAlias name
    async fn resolve_alias(&self, name: &str) -> Result<AliasRecord>;
}

/// Remote node client configuration
#[derive(Debug, Clone)]
pub struct LedgerClientConfig {
    /// Candidate node base URLs (one is picked per client)
    pub node_urls: Vec<String>,
    /// Alias service base URL
    pub alias_api_url: String,
    /// How long a fetched height is reused
    pub height_cache_ttl: Duration,
    /// Per-request timeout
    pub request_timeout: Duration,
    /// User-Agent header
    pub user_agent: String,
    /// Optional SOCKS5 proxy (e.g. `socks5h://127.0.0.1:9050`)
    pub socks_proxy: Option<String>,
    /// Chain constants used to reject impossible node answers
    pub consensus: ConsensusParams,
}

impl Default for LedgerClientConfig {
    fn default() -> Self {
        Self::for_network(&Network::testnet())
    }
}

impl LedgerClientConfig {
    /// Defaults for a network
    pub fn for_network(network: &Network) -> Self {
        Self {
            node_urls: network.node_url_list(),
            alias_api_url: network.alias_api_url.to_string(),
            height_cache_ttl: Duration::from_secs(20),
            request_timeout: Duration::from_secs(30),
            user_agent: format!("ledger-sync/{}", env!("CARGO_PKG_VERSION")),
            socks_proxy: None,
            consensus: ConsensusParams::from_network(network.network_type),
        }
    }

    /// Network defaults with `LEDGER_SYNC_*` environment overrides applied
    pub fn from_env(network: &Network) -> Self {
        let mut config = Self::for_network(network);
        config.apply_overrides(|key| env::var(key).ok());
        config
    }

    /// Apply overrides from an arbitrary key lookup
    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(value) = lookup("LEDGER_SYNC_NODE_URLS") {
            let urls = split_list_env(&value);
            if !urls.is_empty() {
                self.node_urls = urls;
            }
        }
        if let Some(value) = parse_env_string(lookup("LEDGER_SYNC_ALIAS_API_URL")) {
            self.alias_api_url = value;
        }
        if let Some(value) = parse_env_ms(lookup("LEDGER_SYNC_HEIGHT_CACHE_TTL_MS")) {
            self.height_cache_ttl = value;
        }
        if let Some(value) = parse_env_ms(lookup("LEDGER_SYNC_REQUEST_TIMEOUT_MS")) {
            self.request_timeout = value.max(Duration::from_millis(1));
        }
        if let Some(value) = parse_env_string(lookup("LEDGER_SYNC_SOCKS_PROXY")) {
            self.socks_proxy = Some(value);
        }
    }
}

/// HTTP implementation of [`LedgerApi`]
pub struct RemoteLedgerClient {
    node_url: String,
    client: reqwest::Client,
    alias: OpenAliasResolver,
    height_cache_ttl: Duration,
    height_cache: Mutex<Option<(u64, Instant)>>,
    consensus: ConsensusParams,
}

impl RemoteLedgerClient {
    /// Create a client against a randomly chosen node
    pub fn new(config: LedgerClientConfig) -> Result<Self> {
        let node_url = config
            .node_urls
            .choose(&mut rand::thread_rng())
            .cloned()
            .ok_or_else(|| Error::Config("node list is empty".to_string()))?;
        Self::with_node(config, node_url)
    }

    /// Create a client against a specific node
    pub fn with_node(config: LedgerClientConfig, node_url: impl Into<String>) -> Result<Self> {
        let mut node_url = node_url.into();
        if node_url.trim().is_empty() {
            return Err(Error::Config("node URL is empty".to_string()));
        }
        if !node_url.ends_with('/') {
            node_url.push('/');
        }

        let mut builder = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .user_agent(config.user_agent.clone());
        if let Some(proxy) = &config.socks_proxy {
            let proxy = reqwest::Proxy::all(proxy)
                .map_err(|e| Error::Config(format!("invalid proxy {}: {}", proxy, e)))?;
            builder = builder.proxy(proxy);
        }
        let client = builder
            .build()
            .map_err(|e| Error::Config(format!("HTTP client: {}", e)))?;

        debug!(node = %node_url, "Remote node selected");

        Ok(Self {
            node_url,
            alias: OpenAliasResolver::with_client(config.alias_api_url, client.clone()),
            client,
            height_cache_ttl: config.height_cache_ttl,
            height_cache: Mutex::new(None),
            consensus: config.consensus,
        })
    }

    /// Node base URL in use
    pub fn node_url(&self) -> &str {
        &self.node_url
    }

    fn cached_height(&self) -> Option<u64> {
        let cache = self.height_cache.lock();
        match *cache {
            Some((height, fetched_at)) if fetched_at.elapsed() < self.height_cache_ttl => {
                Some(height)
            }
            _ => None,
        }
    }

    fn malformed(&self, method: &str, message: String) -> Error {
        Error::transport(format!("{}{}", self.node_url, method), message, None)
    }

    /// POST `body` to `method` and decode the JSON response
    async fn post<T, R>(&self, method: &str, body: &T) -> Result<R>
    where
        T: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        let endpoint = format!("{}{}", self.node_url, method);

        let response = self
            .client
            .post(&endpoint)
            .json(body)
            .send()
            .await
            .map_err(|e| Error::transport(&endpoint, format!("HTTP error: {}", e), None))?;

        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| Error::transport(&endpoint, format!("read error: {}", e), None))?;

        if !status.is_success() {
            warn!(endpoint = %endpoint, status = %status, "Node request failed");
            return Err(Error::transport(
                &endpoint,
                format!("HTTP error: {}", status),
                Some(text),
            ));
        }

        serde_json::from_str(&text).map_err(|e| {
            Error::transport(&endpoint, format!("JSON decode error: {}", e), Some(text))
        })
    }
}

#[async_trait]
impl LedgerApi for RemoteLedgerClient {
    async fn get_height(&self) -> Result<u64> {
        if let Some(height) = self.cached_height() {
            return Ok(height);
        }

        #[derive(Deserialize)]
        struct HeightResponse {
            height: LenientU64,
        }

        let response: HeightResponse = self.post("getheight", &serde_json::json!({})).await?;
        let height = self
            .consensus
            .validate_height(response.height.0)
            .map_err(|e| self.malformed("getheight", e.to_string()))?;
        *self.height_cache.lock() = Some((height, Instant::now()));
        Ok(height)
    }

    async fn get_transactions_for_blocks(
        &self,
        start: u64,
        window: u64,
    ) -> Result<Vec<RawTransactionRecord>> {
        #[derive(Serialize)]
        #[serde(rename_all = "camelCase")]
        struct WindowRequest {
            start_block: u64,
            additor: u64,
            sig_cut: bool,
        }

        let response: TransactionsResponse = self
            .post(
                "get_transaction_details_by_heights",
                &WindowRequest {
                    start_block: start,
                    additor: window,
                    sig_cut: true,
                },
            )
            .await?;

        let records = annotate_window(start, response.transactions.unwrap_or_default());
        debug!(start, window, records = records.len(), "Window fetched");
        Ok(records)
    }

    async fn get_mempool(&self) -> Result<Vec<RawTransactionRecord>> {
        #[derive(Deserialize)]
        struct PoolResponse {
            result: PoolResult,
        }

        #[derive(Deserialize)]
        struct PoolResult {
            #[serde(default)]
            transactions: Vec<PoolEntry>,
        }

        #[derive(Deserialize)]
        struct PoolEntry {
            hash: String,
        }

        let pool: PoolResponse = self
            .post(
                "json_rpc",
                &serde_json::json!({
                    "jsonrpc": "2.0",
                    "id": 0,
                    "method": "f_on_transactions_pool_json",
                    "params": "",
                }),
            )
            .await?;

        let hashes: Vec<String> = pool.result.transactions.into_iter().map(|t| t.hash).collect();
        if hashes.is_empty() {
            return Ok(Vec::new());
        }

        let response: TransactionsResponse = self
            .post(
                "get_transaction_details_by_hashes",
                &serde_json::json!({ "transactionHashes": hashes }),
            )
            .await?;

        Ok(annotate_mempool(response.transactions.unwrap_or_default()))
    }

    async fn send_raw_transaction(&self, tx_hex: &str) -> Result<()> {
        let response: Value = self
            .post(
                "sendrawtransaction",
                &serde_json::json!({ "tx_as_hex": tx_hex, "do_not_relay": false }),
            )
            .await?;

        match response.get("status").and_then(Value::as_str) {
            Some("OK") => Ok(()),
            status => Err(Error::Rejected {
                status: status.unwrap_or("missing").to_string(),
                response: response.to_string(),
            }),
        }
    }

    async fn get_peer_info(&self) -> Result<PeerInfo> {
        #[derive(Deserialize)]
        struct InfoResponse {
            #[serde(default)]
            fee_address: Option<String>,
            #[serde(default)]
            status: String,
        }

        let info: InfoResponse = self.post("getinfo", &serde_json::json!({})).await?;
        Ok(PeerInfo {
            fee_address: info.fee_address.filter(|a| !a.is_empty()),
            status: info.status,
        })
    }

    async fn resolve_alias(&self, name: &str) -> Result<AliasRecord> {
        Ok(self.alias.resolve(name).await?)
    }
}

#[derive(Deserialize)]
struct TransactionsResponse {
    #[serde(default)]
    transactions: Option<Vec<Value>>,
}

/// Heights arrive as numbers or numeric strings depending on the node build
struct LenientU64(u64);

impl<'de> Deserialize<'de> for LenientU64 {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        match Value::deserialize(deserializer)? {
            Value::Number(n) => n
                .as_u64()
                .map(LenientU64)
                .ok_or_else(|| serde::de::Error::custom("height is not a u64")),
            Value::String(s) => s
                .trim()
                .parse()
                .map(LenientU64)
                .map_err(serde::de::Error::custom),
            other => Err(serde::de::Error::custom(format!("unexpected height {}", other))),
        }
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireTransaction {
    hash: String,
    #[serde(default)]
    block_index: Option<u64>,
    #[serde(default)]
    timestamp: Option<u64>,
    #[serde(default)]
    outputs: Vec<WireOutput>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireOutput {
    #[serde(default)]
    global_index: Option<u64>,
    #[serde(default)]
    output: Option<WireOutputBody>,
}

#[derive(Deserialize)]
struct WireOutputBody {
    #[serde(default)]
    target: Option<WireTarget>,
}

#[derive(Deserialize)]
struct WireTarget {
    #[serde(default)]
    data: Option<WireTargetData>,
}

/// Single-key targets carry `key`; multisignature targets carry `keys` instead
#[derive(Deserialize)]
struct WireTargetData {
    #[serde(default)]
    key: Option<String>,
}

impl WireOutput {
    fn key(&self) -> Option<String> {
        self.output
            .as_ref()
            .and_then(|o| o.target.as_ref())
            .and_then(|t| t.data.as_ref())
            .and_then(|d| d.key.clone())
    }
}

/// Strip signature payloads and read the fields the engine needs.
///
/// Never fails: a body that does not parse is kept with `parse_error` set and
/// no outputs, so it surfaces as a decode failure for that record alone.
fn parse_record(
    mut body: Value,
    running_offset: &mut u64,
) -> (Option<u64>, RawTransactionRecord) {
    if let Value::Object(map) = &mut body {
        for field in STRIPPED_FIELDS {
            map.remove(field);
        }
    }

    let wire = match WireTransaction::deserialize(&body) {
        Ok(wire) => wire,
        Err(e) => {
            let hash = body
                .get("hash")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            let block_index = body.get("blockIndex").and_then(Value::as_u64);
            warn!(hash = %hash, error = %e, "Unreadable transaction record");
            let record = RawTransactionRecord {
                hash,
                outputs: Vec::new(),
                height: None,
                timestamp: None,
                global_index_start: *running_offset,
                body,
                parse_error: Some(format!("malformed transaction record: {}", e)),
            };
            return (block_index, record);
        }
    };

    let global_index_start = wire
        .outputs
        .first()
        .and_then(|o| o.global_index)
        .unwrap_or(*running_offset);

    let outputs: Vec<RawOutput> = wire
        .outputs
        .iter()
        .enumerate()
        .map(|(i, o)| RawOutput {
            global_index: o.global_index.unwrap_or(global_index_start + i as u64),
            public_key: o.key(),
        })
        .collect();
    *running_offset = global_index_start + outputs.len() as u64;

    let record = RawTransactionRecord {
        hash: wire.hash,
        outputs,
        height: None,
        timestamp: wire.timestamp,
        global_index_start,
        body,
        parse_error: None,
    };
    (wire.block_index, record)
}

/// Annotate a height-window response with absolute heights and output offsets
pub(crate) fn annotate_window(start: u64, transactions: Vec<Value>) -> Vec<RawTransactionRecord> {
    let mut running_offset = 0u64;
    transactions
        .into_iter()
        .map(|tx| {
            let (block_index, mut record) = parse_record(tx, &mut running_offset);
            record.height = Some(block_index.unwrap_or(start));
            record
        })
        .collect()
}

/// Annotate mempool bodies; they never carry a height
pub(crate) fn annotate_mempool(transactions: Vec<Value>) -> Vec<RawTransactionRecord> {
    let mut running_offset = 0u64;
    transactions
        .into_iter()
        .map(|tx| parse_record(tx, &mut running_offset).1)
        .collect()
}
