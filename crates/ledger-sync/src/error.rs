//! Error types for sync operations

/// Result type
pub type Result<T> = std::result::Result<T, Error>;

/// Error types
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// HTTP failure, non-2xx status or malformed response from the remote node
    #[error("Transport error ({endpoint}): {message}")]
    Transport {
        /// URL that was called
        endpoint: String,
        /// What went wrong
        message: String,
        /// Raw response body, when one was read
        response: Option<String>,
    },

    /// Node answered a broadcast with a non-OK status
    #[error("Transaction rejected by node: {status}")]
    Rejected {
        /// Status string reported by the node
        status: String,
        /// Raw response body
        response: String,
    },

    /// Single record failed to decode
    #[error("Decode error: {0}")]
    Decode(#[from] DecodeError),

    /// Dispatch attempted while the decode worker is not ready
    #[error("Decode worker unavailable")]
    WorkerUnavailable,

    /// Not enough distinct mature heights with outputs
    #[error("Insufficient decoys: requested {requested}, found {found}")]
    InsufficientDecoys {
        /// Decoys asked for
        requested: usize,
        /// Decoys that could be selected
        found: usize,
    },

    /// Alias resolution error
    #[error("Alias error: {0}")]
    Alias(#[from] ledger_name_resolution::Error),

    /// Invalid configuration
    #[error("Configuration error: {0}")]
    Config(String),

    /// Operation cancelled
    #[error("Cancelled")]
    Cancelled,
}

impl Error {
    /// Build a transport error for `endpoint`
    pub fn transport(
        endpoint: impl Into<String>,
        message: impl Into<String>,
        response: Option<String>,
    ) -> Self {
        Error::Transport {
            endpoint: endpoint.into(),
            message: message.into(),
            response,
        }
    }

    /// Whether the scheduler should simply retry after its fixed backoff
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::Transport { .. } | Error::WorkerUnavailable)
    }
}

impl From<ledger_params::Error> for Error {
    fn from(e: ledger_params::Error) -> Self {
        Error::Config(format!("{}", e))
    }
}

/// Failure decoding one raw transaction record
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    /// Record body could not be parsed
    #[error("Malformed transaction {hash}: {reason}")]
    Malformed {
        /// Transaction hash
        hash: String,
        /// Parser message
        reason: String,
    },

    /// Record parsed but failed a consistency check
    #[error("Transaction {hash} rejected: {reason}")]
    Rejected {
        /// Transaction hash
        hash: String,
        /// Why it was rejected
        reason: String,
    },

    /// Decoder panicked on this record
    #[error("Decoder panicked on {hash}: {message}")]
    Panicked {
        /// Transaction hash
        hash: String,
        /// Panic payload, when it was a string
        message: String,
    },
}

impl DecodeError {
    /// Hash of the record that failed
    pub fn hash(&self) -> &str {
        match self {
            DecodeError::Malformed { hash, .. }
            | DecodeError::Rejected { hash, .. }
            | DecodeError::Panicked { hash, .. } => hash,
        }
    }
}
