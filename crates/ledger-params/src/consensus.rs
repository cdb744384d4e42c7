//! Consensus constants used by wallet-side scanning and decoy selection

use crate::network::{Network, NetworkType};
use crate::{Error, Result};

/// Heights per node window request
pub const DEFAULT_WINDOW_SIZE: u64 = 100;

/// Consensus parameters
#[derive(Debug, Clone)]
pub struct ConsensusParams {
    /// Network configuration
    pub network: Network,
    /// Confirmations before a block-reward output may be referenced
    pub coinbase_min_confirms: u64,
    /// Confirmations before a received output counts as unlocked
    pub tx_min_confirms: u64,
    /// Decimal places of one coin in atomic units
    pub coin_unit_places: u32,
    /// Highest representable block height
    pub max_block_number: u64,
}

impl ConsensusParams {
    /// Create consensus params for testnet
    pub fn testnet() -> Self {
        Self {
            network: Network::testnet(),
            coinbase_min_confirms: 10,
            tx_min_confirms: 10,
            coin_unit_places: 8,
            max_block_number: 500_000_000,
        }
    }

    /// Create consensus params for regtest
    pub fn regtest() -> Self {
        Self {
            network: Network::regtest(),
            coinbase_min_confirms: 2,
            tx_min_confirms: 1,
            coin_unit_places: 8,
            max_block_number: 500_000_000,
        }
    }

    /// Get consensus params by network type
    pub fn from_network(network_type: NetworkType) -> Self {
        match network_type {
            NetworkType::Testnet => Self::testnet(),
            NetworkType::Regtest => Self::regtest(),
        }
    }

    /// Atomic units in one coin
    pub fn atomic_units_per_coin(&self) -> u64 {
        10u64.pow(self.coin_unit_places)
    }

    /// Highest height whose outputs may be referenced at `chain_height`,
    /// or `None` while the chain is shorter than the maturity window.
    pub fn highest_mature_height(&self, chain_height: u64) -> Option<u64> {
        chain_height
            .checked_sub(self.coinbase_min_confirms)
            .and_then(|h| h.checked_sub(1))
    }

    /// Whether an output created at `output_height` is spendable at `chain_height`
    pub fn is_unlocked(&self, output_height: u64, chain_height: u64) -> bool {
        chain_height >= output_height.saturating_add(self.tx_min_confirms)
    }

    /// Reject heights a node could never report
    pub fn validate_height(&self, height: u64) -> Result<u64> {
        if height >= self.max_block_number {
            return Err(Error::InvalidHeight(height));
        }
        Ok(height)
    }
}
