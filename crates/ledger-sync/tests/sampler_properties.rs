//! Property-based tests for decoy selection
//!
//! Uses proptest to check distinct heights and the maturity window across
//! random chain heights, counts and seeds.

mod common;

use common::{record, MemoryLedger};
use ledger_sync::{Error, OutputSampler, SamplerConfig};
use proptest::prelude::*;
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::collections::HashSet;
use std::sync::Arc;

// ============================================================================
// Helpers
// ============================================================================

/// Chain with one two-output transaction at every height matching `filter`
fn chain(height: u64, filter: impl Fn(u64) -> bool) -> Arc<MemoryLedger> {
    let ledger = MemoryLedger::with_height(height);
    for h in (0..height).filter(|h| filter(*h)) {
        ledger.add(record(&format!("tx{}", h), Some(h), &["k0", "k1"]));
    }
    Arc::new(ledger)
}

fn sampler(ledger: Arc<MemoryLedger>, seed: u64) -> OutputSampler<MemoryLedger> {
    OutputSampler::with_rng(ledger, SamplerConfig::default(), StdRng::seed_from_u64(seed))
}

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap()
}

/// `record` gives outputs at height h global indices h*10, h*10+1, ...
fn height_of(global_index: u64) -> u64 {
    global_index / 10
}

// ============================================================================
// Properties
// ============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(48))]

    #[test]
    fn prop_decoys_distinct_and_mature(
        chain_height in 200u64..2_000,
        count in 1usize..=10,
        seed in any::<u64>(),
    ) {
        let ledger = chain(chain_height, |_| true);
        let sampler = sampler(ledger, seed);
        let limit = sampler.config().height_limit(chain_height);

        let decoys = runtime().block_on(sampler.sample_at(count, chain_height)).unwrap();

        prop_assert_eq!(decoys.len(), count);
        let heights: HashSet<u64> = decoys.iter().map(|d| height_of(d.global_index)).collect();
        prop_assert_eq!(heights.len(), count);
        prop_assert!(heights.iter().all(|h| *h < limit));
    }

    #[test]
    fn prop_empty_heights_never_selected(
        chain_height in 300u64..1_000,
        seed in any::<u64>(),
    ) {
        let ledger = chain(chain_height, |h| h % 2 == 0);
        let sampler = sampler(ledger, seed);

        let decoys = runtime().block_on(sampler.sample_at(6, chain_height)).unwrap();

        prop_assert_eq!(decoys.len(), 6);
        prop_assert!(decoys.iter().all(|d| height_of(d.global_index) % 2 == 0));
    }
}

// ============================================================================
// Failure cases
// ============================================================================

#[tokio::test]
async fn test_uses_node_height() {
    let ledger = chain(400, |_| true);
    let sampler = sampler(Arc::clone(&ledger), 3);

    let decoys = sampler.sample(4).await.unwrap();
    assert_eq!(decoys.len(), 4);
    assert!(decoys.iter().all(|d| height_of(d.global_index) < 390));
    assert_eq!(ledger.height_calls().len(), 1);
}

#[tokio::test]
async fn test_windows_fetched_aligned() {
    let ledger = chain(1_000, |_| true);
    let sampler = sampler(Arc::clone(&ledger), 9);

    sampler.sample_at(8, 1_000).await.unwrap();
    let starts = ledger.window_starts();
    assert!(!starts.is_empty());
    assert!(starts.iter().all(|s| s % 100 == 0));
    let unique: HashSet<u64> = starts.iter().copied().collect();
    assert_eq!(unique.len(), starts.len());
}

#[tokio::test]
async fn test_too_few_mature_heights() {
    // Only heights 0..5 are below the maturity window
    let ledger = chain(15, |_| true);
    let sampler = sampler(ledger, 5);

    match sampler.sample_at(8, 15).await {
        Err(Error::InsufficientDecoys { requested, found }) => {
            assert_eq!(requested, 8);
            assert!(found <= 5);
        }
        other => panic!("expected InsufficientDecoys, got {:?}", other),
    }
}

#[tokio::test]
async fn test_window_failure_fails_call() {
    let ledger = chain(1_000, |_| true);
    ledger.fail_all_windows();
    let sampler = sampler(ledger, 1);

    let result = sampler.sample_at(3, 1_000).await;
    assert!(matches!(result, Err(Error::Transport { .. })));
}

#[tokio::test]
async fn test_zero_count_is_empty() {
    let ledger = chain(100, |_| true);
    let sampler = sampler(Arc::clone(&ledger), 1);

    assert!(sampler.sample_at(0, 100).await.unwrap().is_empty());
    assert!(ledger.window_starts().is_empty());
}
