//! Single-writer actors, one per chain
//!
//! Each tracked chain is owned by one [`ChainActor`] running on its own OS
//! thread, outside the runtime's blocking pool. It is the only holder of the
//! chain's write side, so blocks for one chain are applied strictly in order
//! while different chains proceed independently.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────┐
//! │          Block source / queries (async tasks)         │
//! └──────────────┬──────────────────────────┬────────────┘
//!                │ writes                   │ reads
//!                ▼                          ▼
//! ┌──────────────────────────┐   ┌─────────────────────────┐
//! │   ChainHandle (Clone)    │   │  ChainView (snapshot)   │
//! │  mpsc::channel (bounded) │   │  never blocks writers   │
//! └──────────────┬───────────┘   └─────────────────────────┘
//!                ▼
//! ┌──────────────────────────────────────────────────────┐
//! │              ChainActor (dedicated thread)            │
//! │        Chain::apply_block → one RocksDB batch         │
//! └──────────────────────────────────────────────────────┘
//! ```

use crate::{
    chain::{BlockSummary, Chain, ChainStatus},
    eblock::EntryBlock,
    entry::Entry,
    error::ValidationResult,
    issuance::Issuance,
    metrics::Metrics,
    query::ChainView,
    storage::ChainStore,
    types::{Bytes32, ChainId, Identity},
    validation::Transaction,
    Error, Result,
};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Instant;
use tokio::sync::{mpsc, oneshot};

/// Message sent to a chain actor
pub enum ChainMessage {
    /// Apply the next entry block
    ApplyBlock {
        block: Box<EntryBlock>,
        response: oneshot::Sender<Result<BlockSummary>>,
    },

    /// Record the issuer identity
    SetIdentity {
        identity: Identity,
        response: oneshot::Sender<Result<()>>,
    },

    /// Record the synced directory block
    SetSync {
        height: u32,
        db_key_mr: Bytes32,
        response: oneshot::Sender<Result<bool>>,
    },

    /// Dry-run a transaction
    CheckTransaction {
        entry: Box<Entry>,
        response: oneshot::Sender<Result<ValidationResult<Transaction>>>,
    },

    /// Dry-run an issuance
    CheckIssuance {
        entry: Box<Entry>,
        response: oneshot::Sender<Result<ValidationResult<Issuance>>>,
    },

    /// Shutdown actor
    Shutdown,
}

/// Actor owning the write side of one chain
pub struct ChainActor {
    chain: Chain,
    mailbox: mpsc::Receiver<ChainMessage>,
    metrics: Metrics,
    /// Set once a block fails fatally
    halted: Option<String>,
}

impl ChainActor {
    /// Create new actor
    pub fn new(chain: Chain, mailbox: mpsc::Receiver<ChainMessage>, metrics: Metrics) -> Self {
        Self {
            chain,
            mailbox,
            metrics,
            halted: None,
        }
    }

    /// Run the actor loop until shutdown or until every handle is dropped
    pub fn run(mut self) {
        while let Some(msg) = self.mailbox.blocking_recv() {
            match msg {
                ChainMessage::Shutdown => break,
                msg => self.handle_message(msg),
            }
        }
        tracing::info!(chain_id = %self.chain.chain_id(), "Chain actor stopped");
    }

    fn handle_message(&mut self, msg: ChainMessage) {
        match msg {
            ChainMessage::ApplyBlock { block, response } => {
                let result = self.apply_block(&block);
                let _ = response.send(result);
            }

            ChainMessage::SetIdentity { identity, response } => {
                let _ = response.send(self.chain.set_identity(identity));
            }

            ChainMessage::SetSync {
                height,
                db_key_mr,
                response,
            } => {
                let _ = response.send(self.chain.set_sync(height, db_key_mr));
            }

            ChainMessage::CheckTransaction { entry, response } => {
                let _ = response.send(self.chain.check_transaction(&entry));
            }

            ChainMessage::CheckIssuance { entry, response } => {
                let _ = response.send(self.chain.check_issuance(&entry));
            }

            ChainMessage::Shutdown => {
                // Handled in run loop
            }
        }
    }

    fn apply_block(&mut self, block: &EntryBlock) -> Result<BlockSummary> {
        if let Some(reason) = &self.halted {
            return Err(Error::Halted(reason.clone()));
        }

        let start = Instant::now();
        match self.chain.apply_block(block) {
            Ok(summary) => {
                self.metrics
                    .record_block(&summary, start.elapsed().as_secs_f64());
                Ok(summary)
            }
            Err(err) => {
                tracing::error!(
                    chain_id = %self.chain.chain_id(),
                    sequence = block.sequence,
                    error = %err,
                    "Failed to apply entry block, halting chain"
                );
                self.halted = Some(err.to_string());
                Err(err)
            }
        }
    }
}

/// Handle for sending messages to a chain actor and reading its store
#[derive(Clone)]
pub struct ChainHandle {
    chain_id: ChainId,
    sender: mpsc::Sender<ChainMessage>,
    /// Direct storage access (for reads)
    store: Arc<ChainStore>,
}

impl std::fmt::Debug for ChainHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChainHandle")
            .field("chain_id", &self.chain_id)
            .finish()
    }
}

impl ChainHandle {
    /// Chain ID
    pub fn chain_id(&self) -> ChainId {
        self.chain_id
    }

    /// Shared store
    pub fn store(&self) -> &Arc<ChainStore> {
        &self.store
    }

    /// Snapshot-isolated read view
    pub fn view(&self) -> Result<ChainView<'_>> {
        ChainView::new(&self.store)
    }

    /// Lifecycle state at the latest applied block
    pub fn status(&self) -> Result<ChainStatus> {
        Ok(self.view()?.status())
    }

    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<Result<T>>) -> ChainMessage,
    ) -> Result<T> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(build(tx))
            .await
            .map_err(|_| Error::Concurrency("Actor mailbox closed".to_string()))?;

        rx.await
            .map_err(|_| Error::Concurrency("Response channel closed".to_string()))?
    }

    /// Apply the next entry block
    pub async fn apply_block(&self, block: EntryBlock) -> Result<BlockSummary> {
        let block = Box::new(block);
        self.request(|response| ChainMessage::ApplyBlock { block, response })
            .await
    }

    /// Record the issuer identity
    pub async fn set_identity(&self, identity: Identity) -> Result<()> {
        self.request(|response| ChainMessage::SetIdentity { identity, response })
            .await
    }

    /// Record the synced directory block
    pub async fn set_sync(&self, height: u32, db_key_mr: Bytes32) -> Result<bool> {
        self.request(|response| ChainMessage::SetSync {
            height,
            db_key_mr,
            response,
        })
        .await
    }

    /// Check a transaction against the current state without applying it
    pub async fn check_transaction(&self, entry: Entry) -> Result<ValidationResult<Transaction>> {
        let entry = Box::new(entry);
        self.request(|response| ChainMessage::CheckTransaction { entry, response })
            .await
    }

    /// Check an issuance against the current state without applying it
    pub async fn check_issuance(&self, entry: Entry) -> Result<ValidationResult<Issuance>> {
        let entry = Box::new(entry);
        self.request(|response| ChainMessage::CheckIssuance { entry, response })
            .await
    }

    /// Shutdown actor
    pub async fn shutdown(&self) -> Result<()> {
        self.sender
            .send(ChainMessage::Shutdown)
            .await
            .map_err(|_| Error::Concurrency("Actor mailbox closed".to_string()))?;
        Ok(())
    }
}

/// Spawn the actor for a chain on a dedicated thread.
///
/// The thread lives as long as the chain and never occupies a slot in the
/// runtime's blocking pool.
pub fn spawn_chain_actor(
    chain: Chain,
    mailbox_capacity: usize,
    metrics: Metrics,
) -> Result<(ChainHandle, JoinHandle<()>)> {
    // Bounded channel for backpressure
    let (tx, rx) = mpsc::channel(mailbox_capacity.max(1));
    let handle = ChainHandle {
        chain_id: chain.chain_id(),
        sender: tx,
        store: chain.store(),
    };
    let actor = ChainActor::new(chain, rx, metrics);
    let thread = thread::Builder::new()
        .name(format!("chain-{}", &handle.chain_id.to_string()[..8]))
        .spawn(move || actor.run())?;
    Ok((handle, thread))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::tests::Fixture;
    use crate::config::RocksDBConfig;
    use crate::crypto::KeyPair;
    use crate::error::ValidationError;
    use crate::issuance::TokenType;
    use crate::storage::KvRead;
    use crate::types::NetworkId;
    use tempfile::TempDir;

    fn spawn(fx: &mut Fixture, temp: &TempDir) -> (ChainHandle, JoinHandle<()>, Metrics) {
        let issuance = fx.issuance(TokenType::Fat0, -1);
        let first = fx.first_block(vec![issuance]);
        let chain = Chain::create(
            &temp.path().join(fx.chain_id.to_string()),
            &RocksDBConfig::default(),
            NetworkId::LOCALNET,
            &first,
            Bytes32::ZERO,
            Some(fx.identity.clone()),
        )
        .unwrap();
        let metrics = Metrics::new().unwrap();
        let (handle, thread) = spawn_chain_actor(chain, 8, metrics.clone()).unwrap();
        (handle, thread, metrics)
    }

    #[tokio::test]
    async fn test_actor_apply_and_read() {
        let temp = TempDir::new().unwrap();
        let mut fx = Fixture::new("actor");
        let alice = KeyPair::from_seed(&[1; 32]);
        let bob = KeyPair::from_seed(&[2; 32]);
        let (handle, task, metrics) = spawn(&mut fx, &temp);

        let block = fx.block(vec![
            fx.fat0_coinbase(&alice, 30),
            fx.fat0_transfer(&alice, &bob, 40),
        ]);
        let summary = handle.apply_block(block).await.unwrap();
        assert_eq!((summary.valid, summary.invalid), (1, 1));
        assert_eq!(metrics.blocks_applied.get(), 1);
        assert_eq!(metrics.entries_invalid.get(), 1);

        let view = handle.view().unwrap();
        assert_eq!(view.balance(&alice.address()).unwrap(), 30);
        assert_eq!(handle.status().unwrap(), ChainStatus::Issued);

        let check = handle
            .check_transaction(fx.fat0_transfer(&alice, &bob, 40))
            .await
            .unwrap();
        assert!(matches!(
            check,
            Err(ValidationError::InsufficientBalance { .. })
        ));
        assert!(handle
            .check_transaction(fx.fat0_transfer(&alice, &bob, 30))
            .await
            .unwrap()
            .is_ok());
        // Dry runs leave no trace
        assert_eq!(handle.store().balance(&bob.address()).unwrap(), 0);

        assert_eq!(
            handle
                .check_issuance(fx.issuance(TokenType::Fat0, 5))
                .await
                .unwrap(),
            Err(ValidationError::AlreadyIssued)
        );

        handle.shutdown().await.unwrap();
        task.join().unwrap();
    }

    #[tokio::test]
    async fn test_actor_halts_after_fatal_error() {
        let temp = TempDir::new().unwrap();
        let mut fx = Fixture::new("halt");
        let alice = KeyPair::from_seed(&[1; 32]);
        let (handle, task, _) = spawn(&mut fx, &temp);

        let good = fx.block(vec![fx.fat0_coinbase(&alice, 1)]);
        let mut bad = good.clone();
        bad.sequence = 5;
        assert!(matches!(
            handle.apply_block(bad).await,
            Err(Error::ChainDiscontinuity(_))
        ));
        assert!(matches!(
            handle.apply_block(good).await,
            Err(Error::Halted(_))
        ));

        // Reads and sync bookkeeping still work
        assert!(handle.set_sync(500, Bytes32([9; 32])).await.unwrap());
        assert_eq!(handle.view().unwrap().metadata().sync_height, 500);

        handle.shutdown().await.unwrap();
        task.join().unwrap();
    }

    #[test]
    fn test_actors_outlive_blocking_pool() {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .max_blocking_threads(1)
            .enable_all()
            .build()
            .unwrap();
        let temp = TempDir::new().unwrap();

        runtime.block_on(async {
            let mut running = Vec::new();
            for i in 0..4 {
                let mut fx = Fixture::new(&format!("pool{}", i));
                let (handle, task, _) = spawn(&mut fx, &temp);
                running.push((handle, task));
            }

            // Park the pool's only thread
            let (release, hold) = std::sync::mpsc::channel::<()>();
            let parked = tokio::task::spawn_blocking(move || {
                let _ = hold.recv();
            });

            for (handle, _) in &running {
                let answer = tokio::time::timeout(
                    std::time::Duration::from_secs(10),
                    handle.set_sync(1_000, Bytes32([1; 32])),
                )
                .await;
                assert!(matches!(answer, Ok(Ok(true))), "{:?} did not answer", handle);
            }

            release.send(()).unwrap();
            parked.await.unwrap();
            for (handle, task) in running {
                handle.shutdown().await.unwrap();
                task.join().unwrap();
            }
        });
    }

    #[tokio::test]
    async fn test_handle_after_shutdown() {
        let temp = TempDir::new().unwrap();
        let mut fx = Fixture::new("closed");
        let (handle, task, _) = spawn(&mut fx, &temp);

        handle.shutdown().await.unwrap();
        task.join().unwrap();

        let block = fx.block(Vec::new());
        assert!(matches!(
            handle.apply_block(block).await,
            Err(Error::Concurrency(_))
        ));
    }
}
