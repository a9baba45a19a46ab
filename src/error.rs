//! Error types for the dapp relayer

use thiserror::Error;
use uuid::Uuid;

/// Main error type for the relayer
#[derive(Error, Debug)]
pub enum RelayerError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Chain client error for chain {chain_id}: {message}")]
    Chain { chain_id: u64, message: String },

    /// Submission rejected or timed out, counted towards `max_fails`
    #[error("Submission failed: {0}")]
    Submission(String),

    /// Submission can never succeed, skips the retry counter
    #[error("Permanent submission failure: {0}")]
    PermanentSubmission(String),

    /// A required ancestor was aborted. `ascendency` is ordered root to leaf
    /// and always starts with `dependency`.
    #[error("Dependency {dependency} is aborted, aborting {} dependent transactions", .ascendency.len())]
    AbortedDependency {
        dependency: Uuid,
        ascendency: Vec<Uuid>,
    },

    #[error("Dependency {dependency} is in excluded state {state}")]
    ExcludedDependency { dependency: Uuid, state: String },

    #[error("Dependency resolution of {tx_id} exceeded the maximum depth")]
    DependencyDepth { tx_id: Uuid },

    #[error("Dependency edge would create a cycle through {tx_id}")]
    DependencyCycle { tx_id: Uuid },

    #[error("Chain {chain_id} not found")]
    ChainNotFound { chain_id: u64 },

    #[error("No chain client registered for chain {chain_id}")]
    NoClient { chain_id: u64 },

    #[error("Account {account} not found")]
    AccountNotFound { account: String },

    #[error("Transaction {tx_id} not found")]
    TransactionNotFound { tx_id: String },

    #[error("Invalid state transition from {from} to {to}")]
    InvalidStateTransition { from: String, to: String },

    #[error("Timeout waiting for {operation}")]
    Timeout { operation: String },

    #[error("Internal error: {0}")]
    Internal(String),
}

impl RelayerError {
    /// Check if error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            RelayerError::Chain { .. }
                | RelayerError::Submission(_)
                | RelayerError::Timeout { .. }
        )
    }

    /// Errors that must not be counted towards the retry ceiling
    pub fn is_permanent(&self) -> bool {
        matches!(self, RelayerError::PermanentSubmission(_))
    }

    /// Check if error should trigger an alert
    pub fn should_alert(&self) -> bool {
        matches!(
            self,
            RelayerError::AbortedDependency { .. }
                | RelayerError::DependencyDepth { .. }
                | RelayerError::DependencyCycle { .. }
                | RelayerError::NoClient { .. }
        )
    }
}

/// Result type for relayer operations
pub type RelayerResult<T> = Result<T, RelayerError>;
