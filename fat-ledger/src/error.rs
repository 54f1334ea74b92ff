//! Error types for the ledger
//!
//! Two classes of failure exist:
//!
//! - [`Error`] is fatal for the operation in progress. Storage faults, broken
//!   hash-chain links and corrupted metadata all stop block application.
//! - [`ValidationError`] rejects a single entry. The entry is recorded as invalid
//!   and processing continues with the next one.

use crate::nftokens::NfTokenId;
use crate::types::Address;
use thiserror::Error;

/// Result type for ledger operations
pub type Result<T> = std::result::Result<T, Error>;

/// Result type for per-entry validation
pub type ValidationResult<T> = std::result::Result<T, ValidationError>;

/// Ledger errors
#[derive(Error, Debug)]
pub enum Error {
    /// Storage error (RocksDB)
    #[error("Storage error: {0}")]
    Storage(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Entry bytes could not be decoded
    #[error("Malformed entry: {0}")]
    MalformedEntry(String),

    /// Entry block bytes could not be decoded
    #[error("Malformed entry block: {0}")]
    MalformedBlock(String),

    /// Entry block does not link to the last stored block
    #[error("Chain discontinuity: {0}")]
    ChainDiscontinuity(String),

    /// Persisted or upstream data failed an integrity check
    #[error("Integrity error: {0}")]
    Integrity(String),

    /// Invariant violation (negative balance, etc.)
    #[error("Invariant violation: {0}")]
    InvariantViolation(String),

    /// Chain stopped applying blocks after a fatal error
    #[error("Chain halted: {0}")]
    Halted(String),

    /// Name IDs do not describe a token chain
    #[error("Invalid chain: {0}")]
    InvalidChain(String),

    /// No store exists for the chain
    #[error("Chain not found: {0}")]
    ChainNotFound(String),

    /// A store already exists for the chain
    #[error("Chain already exists: {0}")]
    ChainExists(String),

    /// Query parameters were rejected
    #[error("Invalid query: {0}")]
    InvalidQuery(String),

    /// Concurrency error (actor mailbox closed, etc.)
    #[error("Concurrency error: {0}")]
    Concurrency(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<rocksdb::Error> for Error {
    fn from(err: rocksdb::Error) -> Self {
        Error::Storage(err.to_string())
    }
}

/// Reasons an entry is rejected without being applied
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    /// Content is not the expected JSON structure
    #[error("structural error: {0}")]
    Structural(String),

    /// Compacted content length differs from its canonical length
    #[error("unexpected JSON length")]
    UnexpectedLength,

    /// Token set would exceed its maximum capacity
    #[error("NFTokens capacity exceeded")]
    CapacityExceeded,

    /// External IDs do not form a valid signature set
    #[error("invalid external IDs: {0}")]
    InvalidExtIds(String),

    /// Entry timestamp is too far from the signing salt
    #[error("timestamp salt expired")]
    ExpiredTimestamp,

    /// Signature does not verify
    #[error("invalid signature at index {index}")]
    InvalidSignature {
        /// Zero-based signer index
        index: usize,
    },

    /// Signer set does not match the required signer
    #[error("unauthorized signer: {0}")]
    UnauthorizedSigner(String),

    /// Sums, sets or addresses break a conservation rule
    #[error("conservation rule violated: {0}")]
    Conservation(String),

    /// Input balance is smaller than the amount spent
    #[error("insufficient balance: {address}")]
    InsufficientBalance {
        /// Spending address
        address: Address,
    },

    /// Input address does not own the token it spends
    #[error("NFTokenID({id}) not owned by {address}")]
    NotOwner {
        /// Token being spent
        id: NfTokenId,
        /// Claimed owner
        address: Address,
    },

    /// Token has never been minted
    #[error("no such NFTokenID({0})")]
    NoSuchToken(NfTokenId),

    /// Token has already been minted
    #[error("NFTokenID({0}) already exists")]
    TokenExists(NfTokenId),

    /// Coinbase would exceed the issued supply
    #[error("coinbase exceeds max supply")]
    SupplyExceeded,

    /// Same entry hash was already applied on this chain
    #[error("replay: entry hash already applied")]
    ReplayDetected,

    /// Issuer identity is not known or was registered after the entry
    #[error("issuer identity unknown or not yet established")]
    IdentityUnknown,

    /// Token has already been issued
    #[error("token already issued")]
    AlreadyIssued,

    /// Token has not been issued yet
    #[error("token not issued")]
    NotIssued,
}

impl ValidationError {
    /// Whether the content failed to decode, rather than failing a rule.
    pub fn is_structural(&self) -> bool {
        matches!(
            self,
            ValidationError::Structural(_)
                | ValidationError::UnexpectedLength
                | ValidationError::CapacityExceeded
        )
    }
}

impl From<serde_json::Error> for ValidationError {
    fn from(err: serde_json::Error) -> Self {
        ValidationError::Structural(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_structural_classification() {
        assert!(ValidationError::UnexpectedLength.is_structural());
        assert!(ValidationError::Structural("eof".into()).is_structural());
        assert!(!ValidationError::ReplayDetected.is_structural());
        assert!(!ValidationError::InvalidSignature { index: 0 }.is_structural());
    }

    #[test]
    fn test_display() {
        let err = ValidationError::NoSuchToken(7);
        assert_eq!(err.to_string(), "no such NFTokenID(7)");

        let err = Error::ChainDiscontinuity("seq 3".into());
        assert_eq!(err.to_string(), "Chain discontinuity: seq 3");
    }
}
