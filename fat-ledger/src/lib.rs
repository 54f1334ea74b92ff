//! FAT token ledger
//!
//! Applies FAT-0 (fungible) and FAT-1 (non-fungible) token chains from
//! Factom entry blocks into per-chain RocksDB stores.
//!
//! # Architecture
//!
//! - **Canonical codec**: entries and entry blocks hash over exact bytes
//! - **Single writer per chain**: one actor owns each chain's write side
//! - **Snapshot reads**: queries never block block application
//! - **Savepoints**: a rejected entry leaves no trace in its block's batch
//!
//! # Invariants
//!
//! - Balances never go negative
//! - FAT-0 amounts and FAT-1 token sets are conserved by every transfer
//! - Coinbase issuance never exceeds a finite supply
//! - A valid entry hash is applied at most once per chain

#![forbid(unsafe_code)]
#![warn(
    missing_docs,
    rust_2018_idioms,
    missing_debug_implementations,
    clippy::all
)]

pub mod actor;
pub mod audit;
pub mod chain;
pub mod config;
pub mod crypto;
pub mod eblock;
pub mod entry;
pub mod error;
pub mod fat0;
pub mod fat1;
pub mod issuance;
pub mod jsonlen;
pub mod ledger;
pub mod metrics;
pub mod nftokens;
pub mod query;
pub mod signature;
pub mod storage;
pub mod types;
pub mod validation;

// Re-exports
pub use chain::{BlockSummary, Chain, ChainStatus};
pub use config::Config;
pub use eblock::EntryBlock;
pub use entry::Entry;
pub use error::{Error, Result, ValidationError, ValidationResult};
pub use issuance::{Issuance, TokenType};
pub use ledger::Ledger;
pub use nftokens::{NfTokenId, NfTokens};
pub use query::{ChainView, Order, Page, TxDirection, TxFilter};
pub use types::{Address, Bytes32, ChainId, Identity, NetworkId};
pub use validation::Transaction;
