//! Core error types shared by every SkyTrust crate.

use thiserror::Error;

/// Result alias used across the workspace.
pub type Result<T> = std::result::Result<T, Error>;

/// Error kinds surfaced by the chain-of-trust and onboarding components.
#[derive(Debug, Error)]
pub enum Error {
    /// Required setting missing or invalid at construction time
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Key type is neither RSA nor ECDSA
    #[error("Unsupported key algorithm: {0}")]
    UnsupportedKeyAlgorithm(String),

    /// Crypto engine misuse (malformed request, non-CA issuer, disposed signer)
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Parent walk exceeded the configured depth
    #[error("Chain cycle detected: walk exceeded {max} links (reached {depth})")]
    ChainCycleDetected { depth: usize, max: usize },

    #[error("Certificate chain is empty")]
    EmptyChain,

    /// Sequencing precondition unmet; retry after the prerequisite completes
    #[error("Not ready: {0}")]
    NotReady(String),

    /// Benign absence reported by an external collaborator
    #[error("Not found: {0}")]
    CollaboratorNotFound(String),

    /// Failure reported verbatim by an external collaborator
    #[error("Collaborator failure: {0}")]
    CollaboratorFailure(String),

    #[error("Chain validation failed: {0}")]
    ChainValidation(String),

    /// Certificate could not be parsed or encoded
    #[error("Certificate error: {0}")]
    Certificate(String),

    #[error("Crypto error: {0}")]
    Crypto(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl Error {
    /// Whether the caller may reasonably retry the failed operation.
    ///
    /// Crypto misuse and structural violations are programming errors and
    /// are never retried.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::NotReady(_) | Error::CollaboratorFailure(_))
    }

    /// Whether the error represents a benign "absent" answer.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::CollaboratorNotFound(_))
    }
}
