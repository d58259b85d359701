use alloy_primitives::B256;

use crate::repository::EventState;

/// Failures talking to the chain. All of them are transient from the
/// scanner's point of view.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ChainError {
    #[error("RPC transport error: {0}")]
    Transport(String),

    #[error("Request timeout after {0} seconds")]
    Timeout(u64),

    #[error("Insufficient funds: {0}")]
    InsufficientFunds(String),

    #[error("Block {0} not found")]
    MissingBlock(u64),
}

#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("Unsupported token standard: {0}")]
    UnsupportedStandard(String),

    #[error("Unknown event topic {0}")]
    UnknownTopic(B256),

    #[error("TransferBatch length mismatch: {ids} ids, {values} values")]
    LengthMismatch { ids: usize, values: usize },

    #[error("Log is missing {0}")]
    MissingField(&'static str),

    #[error("ABI decode error: {0}")]
    Abi(#[from] alloy::sol_types::Error),
}

#[derive(Debug, thiserror::Error)]
pub enum ScanError {
    #[error("recoverable: {0}")]
    Recoverable(#[from] ChainError),

    #[error("fatal: {0:#}")]
    Fatal(anyhow::Error),
}

impl From<DecodeError> for ScanError {
    fn from(e: DecodeError) -> Self {
        ScanError::Fatal(e.into())
    }
}

impl From<anyhow::Error> for ScanError {
    fn from(e: anyhow::Error) -> Self {
        ScanError::Fatal(e)
    }
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum BundlerError {
    #[error("User operation {0} not found")]
    NotFound(B256),

    #[error("Bundler transport error: {0}")]
    Transport(String),
}

#[derive(Debug, thiserror::Error)]
#[error("invalid event state transition {from} -> {to}")]
pub struct InvalidTransition {
    pub from: EventState,
    pub to: EventState,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum QueueError {
    #[error("Queue {0} is closed")]
    Closed(String),
}

/// Per-message outcome reported by a queue processor.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProcessError {
    #[error("Invalid payload: {0}")]
    InvalidPayload(String),

    #[error("Sponsor error: {0}")]
    Sponsor(String),

    #[error("Signing error: {0}")]
    Signing(String),

    #[error("Insufficient funds for sponsor {0}")]
    InsufficientFunds(String),

    #[error("Submission failed: {0}")]
    Submission(String),

    #[error("Store error: {0}")]
    Store(String),
}

impl ProcessError {
    /// Invalid payloads can never succeed on a later attempt.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, ProcessError::InvalidPayload(_))
    }
}
