//! Decoy output selection for ring construction
//!
//! Heights are drawn from a triangular distribution that leans towards the
//! tip, excluding the maturity window below the chain height. Each accepted
//! height contributes exactly one output, picked uniformly among every output
//! created at that height, so no two decoys share a block.

use crate::client::LedgerApi;
use crate::config::parse_env_u64;
use crate::error::{Error, Result};
use crate::types::{DecoyOutput, RawTransactionRecord};
use futures::future::try_join_all;
use ledger_params::ConsensusParams;
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::env;
use std::sync::Arc;
use tracing::debug;

/// Sampler configuration
#[derive(Debug, Clone)]
pub struct SamplerConfig {
    /// Chain constants; the maturity window below the tip is never sampled
    pub consensus: ConsensusParams,
    /// Heights per window fetch; windows are aligned to multiples of this
    pub window_size: u64,
    /// Draw budget per requested decoy before giving up
    pub max_draws_per_output: usize,
}

impl Default for SamplerConfig {
    fn default() -> Self {
        Self::for_params(&ConsensusParams::testnet())
    }
}

impl SamplerConfig {
    /// Defaults for a set of consensus parameters
    pub fn for_params(params: &ConsensusParams) -> Self {
        Self {
            consensus: params.clone(),
            window_size: ledger_params::DEFAULT_WINDOW_SIZE,
            max_draws_per_output: 64,
        }
    }

    /// Defaults with `LEDGER_SYNC_*` environment overrides applied
    pub fn from_env(params: &ConsensusParams) -> Self {
        let mut config = Self::for_params(params);
        if let Some(v) = parse_env_u64(env::var("LEDGER_SYNC_COINBASE_MIN_CONFIRMS").ok()) {
            config.consensus.coinbase_min_confirms = v;
        }
        if let Some(v) = parse_env_u64(env::var("LEDGER_SYNC_WINDOW_SIZE").ok()) {
            config.window_size = v.max(1);
        }
        if let Some(v) = parse_env_u64(env::var("LEDGER_SYNC_MAX_DRAWS_PER_OUTPUT").ok()) {
            config.max_draws_per_output = (v as usize).max(1);
        }
        config
    }

    /// Exclusive upper bound on sampled heights for `chain_height`
    pub fn height_limit(&self, chain_height: u64) -> u64 {
        self.consensus
            .highest_mature_height(chain_height)
            .map_or(0, |h| h + 1)
    }

    /// Start of the window holding `height`
    pub fn window_start(&self, height: u64) -> u64 {
        (height / self.window_size) * self.window_size
    }
}

/// Draw a height in `[0, chain_height)` with density rising towards the tip
pub fn draw_triangular<R: Rng + ?Sized>(rng: &mut R, chain_height: u64) -> u64 {
    if chain_height == 0 {
        return 0;
    }
    let u: f64 = rng.gen();
    let h = (u.sqrt() * chain_height as f64).floor() as u64;
    h.min(chain_height - 1)
}

/// Selects decoy outputs from the remote ledger
pub struct OutputSampler<L> {
    ledger: Arc<L>,
    config: SamplerConfig,
    rng: Mutex<StdRng>,
}

impl<L: LedgerApi> OutputSampler<L> {
    /// Create a sampler seeded from the OS
    pub fn new(ledger: Arc<L>, config: SamplerConfig) -> Self {
        Self::with_rng(ledger, config, StdRng::from_entropy())
    }

    /// Create a sampler with a fixed RNG (tests)
    pub fn with_rng(ledger: Arc<L>, config: SamplerConfig, rng: StdRng) -> Self {
        Self {
            ledger,
            config,
            rng: Mutex::new(rng),
        }
    }

    /// Sampler configuration
    pub fn config(&self) -> &SamplerConfig {
        &self.config
    }

    /// Select `count` decoys against the current chain height
    pub async fn sample(&self, count: usize) -> Result<Vec<DecoyOutput>> {
        let chain_height = self.ledger.get_height().await?;
        self.sample_at(count, chain_height).await
    }

    /// Select `count` decoys against a given chain height
    ///
    /// Returns exactly `count` outputs from distinct mature heights. A failed
    /// window fetch fails the whole call.
    pub async fn sample_at(&self, count: usize, chain_height: u64) -> Result<Vec<DecoyOutput>> {
        if count == 0 {
            return Ok(Vec::new());
        }

        let limit = self.config.height_limit(chain_height);
        let max_draws = count.saturating_mul(self.config.max_draws_per_output);
        let mut draws = 0usize;

        let mut accepted: BTreeMap<u64, Vec<DecoyOutput>> = BTreeMap::new();
        let mut exhausted: HashSet<u64> = HashSet::new();
        let mut windows: HashMap<u64, Vec<RawTransactionRecord>> = HashMap::new();

        while accepted.len() < count {
            let needed = count - accepted.len();
            let round = self.draw_round(needed, chain_height, &mut draws, max_draws, |h| {
                h >= limit || accepted.contains_key(&h) || exhausted.contains(&h)
            });
            if round.is_empty() {
                return Err(Error::InsufficientDecoys {
                    requested: count,
                    found: accepted.len(),
                });
            }

            let missing: BTreeSet<u64> = round
                .iter()
                .map(|h| self.config.window_start(*h))
                .filter(|start| !windows.contains_key(start))
                .collect();

            let fetches = missing.iter().map(|start| {
                let ledger = Arc::clone(&self.ledger);
                let window = self.config.window_size;
                let start = *start;
                async move {
                    ledger
                        .get_transactions_for_blocks(start, window)
                        .await
                        .map(|records| (start, records))
                }
            });
            for (start, records) in try_join_all(fetches).await? {
                windows.insert(start, records);
            }

            for height in round {
                let candidates = windows
                    .get(&self.config.window_start(height))
                    .map(|records| collect_candidates(records, height))
                    .unwrap_or_default();
                if candidates.is_empty() {
                    exhausted.insert(height);
                } else {
                    accepted.insert(height, candidates);
                }
            }

            if accepted.len() < count && draws >= max_draws {
                return Err(Error::InsufficientDecoys {
                    requested: count,
                    found: accepted.len(),
                });
            }
        }

        let mut rng = self.rng.lock();
        let selected: Vec<DecoyOutput> = accepted
            .into_values()
            .map(|mut candidates| {
                let pick = rng.gen_range(0..candidates.len());
                candidates.swap_remove(pick)
            })
            .collect();

        debug!(requested = count, chain_height, draws, "Decoys selected");
        Ok(selected)
    }

    /// Draw up to `needed` fresh heights that `rejected` does not exclude
    fn draw_round<F>(
        &self,
        needed: usize,
        chain_height: u64,
        draws: &mut usize,
        max_draws: usize,
        rejected: F,
    ) -> Vec<u64>
    where
        F: Fn(u64) -> bool,
    {
        let mut rng = self.rng.lock();
        let mut round: Vec<u64> = Vec::with_capacity(needed);
        while round.len() < needed && *draws < max_draws {
            *draws += 1;
            let height = draw_triangular(&mut *rng, chain_height);
            if rejected(height) || round.contains(&height) {
                continue;
            }
            round.push(height);
        }
        round
    }
}

/// Every keyed output created at `height` within a fetched window
fn collect_candidates(records: &[RawTransactionRecord], height: u64) -> Vec<DecoyOutput> {
    records
        .iter()
        .filter(|r| r.height == Some(height))
        .flat_map(|r| {
            r.outputs.iter().filter_map(|o| {
                o.public_key.as_ref().map(|key| DecoyOutput {
                    public_key: key.clone(),
                    global_index: o.global_index,
                })
            })
        })
        .collect()
}
