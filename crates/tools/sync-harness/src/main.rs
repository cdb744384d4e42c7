//! CLI harness for driving the sync engine against a live node
//!
//! This tool allows:
//! - Watching a set of output keys while the engine syncs
//! - Querying height and node info
//! - Sampling decoys
//! - Resolving aliases and broadcasting signed transactions

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use ledger_params::{ConsensusParams, Network, NetworkType};
use ledger_sync::{
    DecodeError, DecodedTransaction, LedgerApi, LedgerClientConfig, OutputSampler, OwnedOutput,
    RawTransactionRecord, RemoteLedgerClient, SamplerConfig, SyncConfig, SyncScheduler,
    TransactionDecoder, ViewStateSnapshot, WalletStore,
};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "sync-harness")]
#[command(about = "Remote-node wallet sync harness", long_about = None)]
struct Cli {
    /// Network (testnet, regtest)
    #[arg(short, long, global = true, default_value = "testnet")]
    network: String,

    /// Node URL (defaults to a random node from the network list)
    #[arg(long, global = true)]
    node: Option<String>,

    /// Emit JSON logs and JSON results
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the engine and report transactions paying the watched keys
    Watch {
        /// Wallet height to start from
        #[arg(short, long, default_value = "0")]
        from: u64,

        /// Output public key to watch (hex, repeatable)
        #[arg(short, long = "key")]
        keys: Vec<String>,

        /// Stop after N seconds (runs until Ctrl-C otherwise)
        #[arg(short, long)]
        duration: Option<u64>,
    },

    /// Print the node's chain height
    Height,

    /// Sample decoy outputs
    Decoys {
        /// Number of decoys
        #[arg(short, long, default_value = "10")]
        count: usize,
    },

    /// Resolve an OpenAlias name
    Resolve {
        /// Alias, e.g. donate.example.com
        name: String,
    },

    /// Print node info
    PeerInfo,

    /// Broadcast a signed transaction
    Broadcast {
        /// Transaction blob (hex)
        tx_hex: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    if cli.json {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }

    let network_type: NetworkType = cli.network.parse()?;
    let network = Network::from_type(network_type);
    let client = Arc::new(build_client(&network, cli.node.as_deref())?);
    info!(node = %client.node_url(), network = network.name, "Using node");

    match cli.command {
        Commands::Watch {
            from,
            keys,
            duration,
        } => {
            let params = ConsensusParams::from_network(network_type);
            run_watch(client, &params, from, keys, duration).await?
        }
        Commands::Height => {
            let height = client.get_height().await?;
            print_result(cli.json, &serde_json::json!({ "height": height }), || {
                format!("Chain height: {}", height)
            });
        }
        Commands::Decoys { count } => {
            let params = ConsensusParams::from_network(network_type);
            let sampler = OutputSampler::new(Arc::clone(&client), SamplerConfig::from_env(&params));
            let decoys = sampler.sample(count).await?;
            print_result(cli.json, &serde_json::to_value(&decoys)?, || {
                decoys
                    .iter()
                    .map(|d| format!("{:>12}  {}", d.global_index, d.public_key))
                    .collect::<Vec<_>>()
                    .join("\n")
            });
        }
        Commands::Resolve { name } => {
            let record = client.resolve_alias(&name).await?;
            print_result(cli.json, &serde_json::to_value(&record)?, || {
                format!("{} -> {}", name, record.address)
            });
        }
        Commands::PeerInfo => {
            let info = client.get_peer_info().await?;
            print_result(cli.json, &serde_json::to_value(&info)?, || {
                format!(
                    "Status: {}\nFee address: {}",
                    info.status,
                    info.fee_address.as_deref().unwrap_or("(none)")
                )
            });
        }
        Commands::Broadcast { tx_hex } => {
            let tx_hex = tx_hex.trim();
            hex::decode(tx_hex).context("transaction is not valid hex")?;
            client.send_raw_transaction(tx_hex).await?;
            print_result(cli.json, &serde_json::json!({ "status": "OK" }), || {
                "Transaction accepted".to_string()
            });
        }
    }

    Ok(())
}

fn build_client(network: &Network, node: Option<&str>) -> anyhow::Result<RemoteLedgerClient> {
    let config = LedgerClientConfig::from_env(network);
    let client = match node {
        Some(url) => RemoteLedgerClient::with_node(config, url)?,
        None => RemoteLedgerClient::new(config)?,
    };
    Ok(client)
}

fn print_result(json: bool, value: &serde_json::Value, text: impl FnOnce() -> String) {
    if json {
        println!("{}", value);
    } else {
        println!("{}", text());
    }
}

async fn run_watch(
    client: Arc<RemoteLedgerClient>,
    params: &ConsensusParams,
    from: u64,
    keys: Vec<String>,
    duration: Option<u64>,
) -> anyhow::Result<()> {
    let decoder = Arc::new(WatchListDecoder::new(&keys)?);
    let wallet = Arc::new(WatchWallet::new(from));
    info!(from, keys = keys.len(), "Starting watch");

    let handle = SyncScheduler::new(
        Arc::clone(&client),
        Arc::clone(&wallet),
        decoder,
        SyncConfig::from_env(),
    )
    .spawn();

    let progress = handle.progress();
    let pb = ProgressBar::new(100);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("[{elapsed_precise}] {bar:40.cyan/blue} {percent}% {msg}")?
            .progress_chars("=>-"),
    );

    let pb_clone = pb.clone();
    let progress_task = tokio::spawn(async move {
        loop {
            tokio::time::sleep(Duration::from_millis(500)).await;
            pb_clone.set_position(progress.percentage() as u64);
            pb_clone.set_message(progress.summary());
        }
    });

    let limit = async {
        match duration {
            Some(secs) => tokio::time::sleep(Duration::from_secs(secs)).await,
            None => std::future::pending::<()>().await,
        }
    };
    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("Interrupted"),
        _ = limit => info!("Watch duration elapsed"),
    }

    handle.stop();
    handle.join().await;
    progress_task.abort();
    pb.finish_with_message(handle.progress().summary());

    let found = wallet.transactions();
    if found.is_empty() {
        warn!("No transactions matched the watched keys");
    }
    let tip = handle.progress().max_observed_height();
    for tx in &found {
        let status = match tx.height {
            Some(h) if params.is_unlocked(h, tip) => "unlocked",
            Some(_) => "locked",
            None => "pool",
        };
        println!(
            "{}  height {:>10}  {:>8}  {}",
            tx.hash,
            tx.height.map(|h| h.to_string()).unwrap_or_else(|| "pool".into()),
            status,
            format_amount(tx.net_amount(), params)
        );
    }
    for tx in wallet.mempool() {
        println!("{}  (mempool)  {}", tx.hash, format_amount(tx.net_amount(), params));
    }
    println!("Wallet height: {}", wallet.last_height());
    Ok(())
}

/// Signed atomic amount as whole coins
fn format_amount(atomic: i128, params: &ConsensusParams) -> String {
    let unit = params.atomic_units_per_coin() as i128;
    let places = params.coin_unit_places as usize;
    let sign = if atomic < 0 { "-" } else { "+" };
    let abs = atomic.abs();
    format!(
        "{}{}.{:0places$} {}",
        sign,
        abs / unit,
        abs % unit,
        params.network.coin_symbol,
        places = places
    )
}

/// Matches outputs by one-time public key; amounts are unknown without the view key
struct WatchListDecoder {
    keys: HashSet<String>,
}

impl WatchListDecoder {
    fn new(keys: &[String]) -> anyhow::Result<Self> {
        let mut set = HashSet::new();
        for key in keys {
            let bytes = hex::decode(key).with_context(|| format!("key {} is not hex", key))?;
            if bytes.len() != 32 {
                bail!("key {} must be 32 bytes", key);
            }
            set.insert(key.to_lowercase());
        }
        Ok(Self { keys: set })
    }
}

impl TransactionDecoder for WatchListDecoder {
    fn decode(
        &self,
        _view: &ViewStateSnapshot,
        record: &RawTransactionRecord,
    ) -> Result<Option<DecodedTransaction>, DecodeError> {
        let outputs: Vec<OwnedOutput> = record
            .outputs
            .iter()
            .enumerate()
            .filter_map(|(i, o)| {
                let key = o.public_key.as_ref()?;
                self.keys.contains(&key.to_lowercase()).then(|| OwnedOutput {
                    output_index: i as u32,
                    global_index: o.global_index,
                    amount: 0,
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
            fee: 0,
            payment_id: None,
        }))
    }
}

/// In-memory wallet for the watch command
struct WatchWallet {
    height: AtomicU64,
    transactions: Mutex<BTreeMap<String, DecodedTransaction>>,
    mempool: Mutex<Vec<DecodedTransaction>>,
}

impl WatchWallet {
    fn new(height: u64) -> Self {
        Self {
            height: AtomicU64::new(height),
            transactions: Mutex::new(BTreeMap::new()),
            mempool: Mutex::new(Vec::new()),
        }
    }

    fn transactions(&self) -> Vec<DecodedTransaction> {
        let mut txs: Vec<DecodedTransaction> = self.transactions.lock().values().cloned().collect();
        txs.sort_by_key(|tx| tx.height);
        txs
    }

    fn mempool(&self) -> Vec<DecodedTransaction> {
        self.mempool.lock().clone()
    }
}

impl WalletStore for WatchWallet {
    fn last_height(&self) -> u64 {
        self.height.load(Ordering::SeqCst)
    }

    fn set_last_height(&self, height: u64) {
        self.height.store(height, Ordering::SeqCst);
    }

    fn add_new_transaction(&self, transaction: DecodedTransaction) {
        info!(hash = %transaction.hash, height = ?transaction.height, "Watched output found");
        self.transactions
            .lock()
            .insert(transaction.hash.clone(), transaction);
    }

    fn export_view_state(&self) -> ViewStateSnapshot {
        ViewStateSnapshot {
            address: "watch-only".into(),
            view_secret_key: "00".repeat(32),
            spend_public_key: "00".repeat(32),
            key_images: Vec::new(),
            last_height: self.last_height(),
        }
    }

    fn replace_mempool_transactions(&self, transactions: Vec<DecodedTransaction>) {
        *self.mempool.lock() = transactions;
    }
}
