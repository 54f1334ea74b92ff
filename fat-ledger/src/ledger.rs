//! Main ledger orchestration layer
//!
//! This module ties together the per-chain stores, their writer actors and
//! the read views into one registry keyed by chain ID.
//!
//! # Example
//!
//! ```no_run
//! use fat_ledger::{Config, Ledger};
//!
//! #[tokio::main]
//! async fn main() -> fat_ledger::Result<()> {
//!     let config = Config::default();
//!     let ledger = Ledger::open(config).await?;
//!
//!     for chain in ledger.issued_chains()? {
//!         println!("{} {}", chain.chain_id, chain.token_id);
//!     }
//!
//!     ledger.shutdown().await
//! }
//! ```

use crate::{
    actor::{spawn_chain_actor, ChainHandle},
    audit::{audit, AuditReport},
    chain::{BlockSummary, Chain},
    eblock::EntryBlock,
    entry::Entry,
    error::ValidationResult,
    issuance::Issuance,
    metrics::Metrics,
    nftokens::{NfTokenId, NfTokens},
    query::{NfTokenInfo, Page, Stats, TxFilter, TxRecord},
    storage::ChainStore,
    types::{Address, Bytes32, ChainId, Identity},
    validation::Transaction,
    Config, Error, Result,
};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{BTreeMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::thread::JoinHandle;

/// Issued token summary
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IssuedChain {
    /// Token chain
    pub chain_id: ChainId,
    /// Token ID
    pub token_id: String,
    /// Issuer identity chain
    pub issuer: ChainId,
}

/// Registry of tracked chains
pub struct Ledger {
    /// Writer handles by chain
    chains: Arc<DashMap<ChainId, ChainHandle>>,

    /// Chains whose store is being created
    creating: Mutex<HashSet<ChainId>>,

    /// Actor threads, joined on shutdown
    threads: Mutex<Vec<JoinHandle<()>>>,

    /// Metrics
    metrics: Metrics,

    /// Configuration
    config: Config,
}

impl std::fmt::Debug for Ledger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Ledger")
            .field("data_dir", &self.config.data_dir)
            .field("chains", &self.chains.len())
            .finish()
    }
}

impl Ledger {
    /// Open every chain store under the configured data directory
    pub async fn open(config: Config) -> Result<Self> {
        let metrics = Metrics::new()
            .map_err(|e| Error::Config(format!("Failed to create metrics: {}", e)))?;
        let ledger = Self {
            chains: Arc::new(DashMap::new()),
            creating: Mutex::new(HashSet::new()),
            threads: Mutex::new(Vec::new()),
            metrics,
            config,
        };

        std::fs::create_dir_all(&ledger.config.data_dir)?;
        for dir in std::fs::read_dir(&ledger.config.data_dir)? {
            let path = dir?.path();
            let Some(chain_id) = chain_dir_id(&path) else {
                tracing::debug!(path = ?path, "Skipping non-chain path");
                continue;
            };
            if !ChainStore::exists(&path) {
                tracing::warn!(path = ?path, "Skipping directory without a store");
                continue;
            }

            let chain = Chain::open(&path, &ledger.config.rocksdb)?;
            let meta = chain.metadata();
            if meta.chain_id != chain_id {
                return Err(Error::Integrity(format!(
                    "store {} holds chain {}",
                    chain_id, meta.chain_id
                )));
            }
            if meta.network_id != ledger.config.network_id {
                return Err(Error::Config(format!(
                    "chain {} belongs to network {}, not {}",
                    chain_id, meta.network_id, ledger.config.network_id
                )));
            }
            ledger.spawn(chain)?;
        }

        tracing::info!(
            data_dir = ?ledger.config.data_dir,
            chains = ledger.chains.len(),
            "Ledger opened"
        );
        Ok(ledger)
    }

    fn spawn(&self, chain: Chain) -> Result<ChainHandle> {
        let (handle, thread) = spawn_chain_actor(
            chain,
            self.config.actor.mailbox_capacity,
            self.metrics.clone(),
        )?;
        self.chains.insert(handle.chain_id(), handle.clone());
        self.threads.lock().push(thread);
        self.metrics.set_chains_tracked(self.chains.len());
        Ok(handle)
    }

    /// Claim a chain ID for creation. Fails if it is tracked or already claimed.
    fn reserve(&self, chain_id: ChainId) -> Result<Reservation<'_>> {
        let mut creating = self.creating.lock();
        if self.chains.contains_key(&chain_id) || !creating.insert(chain_id) {
            return Err(Error::ChainExists(chain_id.to_string()));
        }
        Ok(Reservation {
            creating: &self.creating,
            chain_id,
        })
    }

    /// Configuration
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Metrics
    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    /// Start tracking a chain from its first entry block.
    ///
    /// The store is created on the blocking pool while only the chain ID is
    /// claimed, so other chains stay readable throughout.
    pub async fn track_chain(
        &self,
        first_block: EntryBlock,
        db_key_mr: Bytes32,
        identity: Option<Identity>,
    ) -> Result<ChainHandle> {
        let chain_id = first_block.chain_id;
        let _reservation = self.reserve(chain_id)?;

        let path = self.chain_path(&chain_id);
        let rocksdb = self.config.rocksdb.clone();
        let network_id = self.config.network_id;
        let chain = tokio::task::spawn_blocking(move || {
            Chain::create(&path, &rocksdb, network_id, &first_block, db_key_mr, identity)
        })
        .await
        .map_err(|e| Error::Concurrency(format!("Chain creation panicked: {}", e)))??;

        // Tracked before the reservation is released
        self.spawn(chain)
    }

    fn chain_path(&self, chain_id: &ChainId) -> PathBuf {
        self.config.data_dir.join(chain_id.to_string())
    }

    /// Handle of a tracked chain
    pub fn chain(&self, chain_id: &ChainId) -> Result<ChainHandle> {
        self.chains
            .get(chain_id)
            .map(|h| h.value().clone())
            .ok_or_else(|| Error::ChainNotFound(chain_id.to_string()))
    }

    /// IDs of all tracked chains
    pub fn chain_ids(&self) -> Vec<ChainId> {
        let mut ids: Vec<ChainId> = self.chains.iter().map(|h| *h.key()).collect();
        ids.sort();
        ids
    }

    /// Apply the next entry block of a tracked chain
    pub async fn apply_block(&self, block: EntryBlock) -> Result<BlockSummary> {
        self.chain(&block.chain_id)?.apply_block(block).await
    }

    /// Record a chain's issuer identity
    pub async fn set_identity(&self, chain_id: &ChainId, identity: Identity) -> Result<()> {
        self.chain(chain_id)?.set_identity(identity).await
    }

    /// Record the directory block a chain is synced to
    pub async fn set_sync(&self, chain_id: &ChainId, height: u32, db_key_mr: Bytes32) -> Result<bool> {
        self.chain(chain_id)?.set_sync(height, db_key_mr).await
    }

    /// Dry-run a transaction entry
    pub async fn check_transaction(
        &self,
        chain_id: &ChainId,
        entry: Entry,
    ) -> Result<ValidationResult<Transaction>> {
        self.chain(chain_id)?.check_transaction(entry).await
    }

    /// Dry-run an issuance entry
    pub async fn check_issuance(
        &self,
        chain_id: &ChainId,
        entry: Entry,
    ) -> Result<ValidationResult<Issuance>> {
        self.chain(chain_id)?.check_issuance(entry).await
    }

    /// Balance of an address on a chain
    pub fn balance(&self, chain_id: &ChainId, address: &Address) -> Result<u64> {
        self.chain(chain_id)?.view()?.balance(address)
    }

    /// NFTokens owned by an address on a FAT-1 chain
    pub fn nf_balance(&self, chain_id: &ChainId, address: &Address, page: &Page) -> Result<NfTokens> {
        self.chain(chain_id)?.view()?.nf_balance(address, page)
    }

    /// Token statistics
    pub fn stats(&self, chain_id: &ChainId) -> Result<Stats> {
        self.chain(chain_id)?.view()?.stats()
    }

    /// Transaction history
    pub fn transactions(&self, chain_id: &ChainId, filter: &TxFilter) -> Result<Vec<TxRecord>> {
        self.chain(chain_id)?.view()?.transactions(filter)
    }

    /// Valid transaction by entry hash
    pub fn transaction(&self, chain_id: &ChainId, hash: &Bytes32) -> Result<Option<TxRecord>> {
        self.chain(chain_id)?.view()?.transaction(hash)
    }

    /// Raw entry by hash, with its validity
    pub fn entry(&self, chain_id: &ChainId, hash: &Bytes32) -> Result<Option<(Entry, bool)>> {
        self.chain(chain_id)?.view()?.entry(hash)
    }

    /// NFToken by ID
    pub fn nf_token(&self, chain_id: &ChainId, id: NfTokenId) -> Result<Option<NfTokenInfo>> {
        self.chain(chain_id)?.view()?.nf_token(id)
    }

    /// Minted NFTokens
    pub fn nf_tokens(&self, chain_id: &ChainId, page: &Page) -> Result<Vec<NfTokenInfo>> {
        self.chain(chain_id)?.view()?.nf_tokens(page)
    }

    /// Non-zero balances of an address across issued chains
    pub fn balances(&self, address: &Address) -> Result<BTreeMap<ChainId, u64>> {
        let mut balances = BTreeMap::new();
        for handle in self.handles() {
            let view = handle.view()?;
            if view.issuance().is_none() {
                continue;
            }
            let balance = view.balance(address)?;
            if balance > 0 {
                balances.insert(handle.chain_id(), balance);
            }
        }
        Ok(balances)
    }

    /// Chains with a valid issuance
    pub fn issued_chains(&self) -> Result<Vec<IssuedChain>> {
        let mut issued = Vec::new();
        for handle in self.handles() {
            let view = handle.view()?;
            if view.issuance().is_some() {
                let meta = view.metadata();
                issued.push(IssuedChain {
                    chain_id: meta.chain_id,
                    token_id: meta.token_id.clone(),
                    issuer: meta.issuer,
                });
            }
        }
        Ok(issued)
    }

    /// Audit one chain store
    pub fn audit(&self, chain_id: &ChainId) -> Result<AuditReport> {
        audit(self.chain(chain_id)?.store())
    }

    /// Audit every chain store
    pub fn audit_all(&self) -> Result<Vec<AuditReport>> {
        self.handles().iter().map(|h| audit(h.store())).collect()
    }

    /// Handles in chain ID order, cloned out of the map
    fn handles(&self) -> Vec<ChainHandle> {
        let mut handles: Vec<ChainHandle> = self.chains.iter().map(|h| h.value().clone()).collect();
        handles.sort_by_key(|h| h.chain_id());
        handles
    }

    /// Stop every chain actor and wait for them to finish
    pub async fn shutdown(self) -> Result<()> {
        for handle in self.handles() {
            if let Err(err) = handle.shutdown().await {
                tracing::warn!(chain_id = %handle.chain_id(), error = %err, "Actor already stopped");
            }
        }
        self.chains.clear();

        let threads = std::mem::take(&mut *self.threads.lock());
        tokio::task::spawn_blocking(move || {
            threads.into_iter().try_for_each(|thread| {
                thread
                    .join()
                    .map_err(|_| Error::Concurrency("Chain actor panicked".to_string()))
            })
        })
        .await
        .map_err(|e| Error::Concurrency(format!("Failed to join chain actors: {}", e)))??;
        tracing::info!("Ledger shut down");
        Ok(())
    }
}

/// Chain ID claimed by an in-flight `track_chain`, released on drop
struct Reservation<'a> {
    creating: &'a Mutex<HashSet<ChainId>>,
    chain_id: ChainId,
}

impl Drop for Reservation<'_> {
    fn drop(&mut self) {
        self.creating.lock().remove(&self.chain_id);
    }
}

/// Chain ID named by a store directory, if the name is a chain ID's hex
fn chain_dir_id(path: &std::path::Path) -> Option<ChainId> {
    if !path.is_dir() {
        return None;
    }
    let name = path.file_name()?.to_str()?;
    if name.len() != 64 {
        return None;
    }
    name.parse().ok()
}
