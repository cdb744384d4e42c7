//! Name resolution for crypto addresses
//!
//! Resolves human-readable OpenAlias names (`donate.example.org`) to wallet
//! addresses through the alias lookup service hosted next to the remote node.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod openalias;

pub use openalias::{AliasRecord, OpenAliasResolver};

/// Error types
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Resolution error
    #[error("Resolution error: {0}")]
    Resolution(String),

    /// Invalid name
    #[error("Invalid name: {0}")]
    InvalidName(String),

    /// HTTP transport failure talking to the alias service
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

/// Result type
pub type Result<T> = std::result::Result<T, Error>;
