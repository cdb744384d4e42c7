//! Network parameters and consensus constants
//!
//! This crate provides the node endpoints, alias-service location and the
//! chain constants (maturity depth, atomic unit scale, scan window) that the
//! sync engine and the decoy sampler are configured from.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod consensus;
pub mod network;

pub use consensus::{ConsensusParams, DEFAULT_WINDOW_SIZE};
pub use network::{Network, NetworkType};

/// Error types for parameter operations
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Invalid network specified
    #[error("Invalid network: {0}")]
    InvalidNetwork(String),

    /// Invalid block height
    #[error("Invalid block height: {0}")]
    InvalidHeight(u64),
}

/// Result type for parameter operations
pub type Result<T> = std::result::Result<T, Error>;
