//! Per-chain state and the entry block applier
//!
//! A [`Chain`] owns the write side of one chain store. Blocks are applied
//! strictly in sequence:
//!
//! 1. The block must link to the stored head, otherwise application fails
//!    with [`Error::ChainDiscontinuity`] and nothing is written.
//! 2. Each entry is stored, validated and, if valid, applied inside its own
//!    savepoint. A rejected entry is kept with `valid = false`.
//! 3. The whole block lands in one atomic write.
//!
//! Until a valid issuance is applied, entries are treated as issuance
//! candidates. After that they are FAT-0 or FAT-1 transactions depending on
//! the issued token type.

use crate::{
    config::RocksDBConfig,
    crypto::{coinbase, sha256},
    eblock::EntryBlock,
    entry::{compute_chain_id, compute_hash, token_issuer, Entry},
    error::{Error, Result, ValidationError, ValidationResult},
    fat0, fat1,
    issuance::Issuance,
    storage::{
        BlockHead, BlockRecord, BlockTxn, ChainMetadata, ChainStore, EntryRecord, KvRead,
        NfTokenRecord,
    },
    types::{Bytes32, ChainId, Identity, NetworkId},
    validation::{validate_issuance, validate_transaction, TokenTransaction, Transaction},
};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::sync::Arc;

/// Lifecycle state of a tracked chain
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChainStatus {
    /// Tracked, waiting for a valid issuance
    Tracked,
    /// Issuance applied, transactions are processed
    Issued,
}

impl fmt::Display for ChainStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChainStatus::Tracked => write!(f, "tracked"),
            ChainStatus::Issued => write!(f, "issued"),
        }
    }
}

/// Result of applying one entry block
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BlockSummary {
    /// Block sequence
    pub sequence: u32,
    /// Entries stored
    pub entries: usize,
    /// Entries applied
    pub valid: usize,
    /// Entries rejected
    pub invalid: usize,
}

/// What a valid entry did
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Applied {
    /// The token was issued
    Issuance(Issuance),
    /// A transaction moved or minted tokens
    Transaction(Transaction),
}

/// Write side of one chain
#[derive(Debug)]
pub struct Chain {
    store: Arc<ChainStore>,
    meta: ChainMetadata,
    issuance: Option<Issuance>,
}

impl Chain {
    /// Create a store for a new chain and apply its first block.
    ///
    /// The first entry's external IDs must be valid token chain name IDs
    /// that hash to the block's chain ID.
    pub fn create(
        path: &Path,
        config: &RocksDBConfig,
        network_id: NetworkId,
        first_block: &EntryBlock,
        db_key_mr: Bytes32,
        identity: Option<Identity>,
    ) -> Result<Self> {
        let (token_id, issuer) = first_block_name(first_block)?;
        if let Some(identity) = &identity {
            check_identity(identity, &issuer)?;
        }
        if ChainStore::exists(path) {
            return Err(Error::ChainExists(first_block.chain_id.to_string()));
        }

        let store = Arc::new(ChainStore::open(path, config)?);
        let mut meta = ChainMetadata::new(first_block.chain_id, token_id, issuer, network_id);
        meta.identity = identity;
        meta.sync_height = first_block.height;
        meta.sync_db_key_mr = db_key_mr;

        // Metadata is first written by the first block's batch
        let mut chain = Self {
            store,
            meta,
            issuance: None,
        };
        if let Err(err) = chain.apply_block(first_block) {
            let path = chain.store.path().to_path_buf();
            drop(chain);
            if let Err(rm) = std::fs::remove_dir_all(&path) {
                tracing::error!(path = ?path, error = %rm, "Failed to remove chain store");
            }
            return Err(err);
        }

        tracing::info!(
            chain_id = %chain.meta.chain_id,
            token_id = %chain.meta.token_id,
            issuer = %chain.meta.issuer,
            "Tracking new chain"
        );
        Ok(chain)
    }

    /// Open an existing store
    pub fn open(path: &Path, config: &RocksDBConfig) -> Result<Self> {
        let store = Arc::new(ChainStore::open(path, config)?);
        let meta = store.metadata()?;
        let issuance = load_issuance(&*store, &meta)?;

        tracing::info!(
            chain_id = %meta.chain_id,
            token_id = %meta.token_id,
            status = %status_of(&issuance),
            sync_height = meta.sync_height,
            "Opened chain"
        );
        Ok(Self {
            store,
            meta,
            issuance,
        })
    }

    /// Chain ID
    pub fn chain_id(&self) -> ChainId {
        self.meta.chain_id
    }

    /// Current metadata
    pub fn metadata(&self) -> &ChainMetadata {
        &self.meta
    }

    /// Issuance, once applied
    pub fn issuance(&self) -> Option<&Issuance> {
        self.issuance.as_ref()
    }

    /// Lifecycle state
    pub fn status(&self) -> ChainStatus {
        status_of(&self.issuance)
    }

    /// Shared store, for readers
    pub fn store(&self) -> Arc<ChainStore> {
        self.store.clone()
    }

    /// Apply the next entry block of the chain
    pub fn apply_block(&mut self, block: &EntryBlock) -> Result<BlockSummary> {
        if block.chain_id != self.meta.chain_id {
            return Err(Error::Integrity(format!(
                "block for chain {} applied to {}",
                block.chain_id, self.meta.chain_id
            )));
        }
        self.check_continuity(block)?;
        block.verify_hashes()?;

        let data = block.marshal_binary()?;
        let full_hash = sha256(&data);

        let mut meta = self.meta.clone();
        let mut issuance = self.issuance.clone();
        let mut txn = self.store.begin();
        txn.insert_block(&BlockRecord {
            sequence: block.sequence,
            height: block.height,
            key_mr: block.key_mr,
            prev_key_mr: block.prev_key_mr,
            full_hash,
            prev_full_hash: block.prev_full_hash,
            timestamp: block.timestamp,
            data,
        })?;

        let mut summary = BlockSummary {
            sequence: block.sequence,
            ..Default::default()
        };
        for (index, entry) in block.entries.iter().enumerate() {
            let (id, hash) = stage_entry(&mut txn, &mut meta, block.sequence, entry)?;
            summary.entries += 1;

            // The chain name entry is stored but never validated
            if index == 0 && block.is_first() {
                tracing::debug!(
                    chain_id = %meta.chain_id,
                    entry_hash = %hash,
                    "Stored chain name entry"
                );
                continue;
            }

            match apply_entry(&mut txn, &mut meta, &mut issuance, id, hash, entry)? {
                Ok(applied) => {
                    summary.valid += 1;
                    tracing::debug!(
                        chain_id = %meta.chain_id,
                        entry_hash = %hash,
                        sequence = block.sequence,
                        kind = applied.kind(),
                        "Applied entry"
                    );
                }
                Err(err) => {
                    summary.invalid += 1;
                    tracing::debug!(
                        chain_id = %meta.chain_id,
                        entry_hash = %hash,
                        sequence = block.sequence,
                        error = %err,
                        "Invalid entry"
                    );
                }
            }
        }

        meta.head = Some(BlockHead {
            sequence: block.sequence,
            key_mr: block.key_mr,
            full_hash,
        });
        txn.put_metadata(&meta)?;
        txn.commit()?;

        self.meta = meta;
        self.issuance = issuance;

        tracing::info!(
            chain_id = %self.meta.chain_id,
            sequence = summary.sequence,
            entries = summary.entries,
            valid = summary.valid,
            invalid = summary.invalid,
            "Applied entry block"
        );
        Ok(summary)
    }

    fn check_continuity(&self, block: &EntryBlock) -> Result<()> {
        match self.meta.head {
            None if block.is_first() => Ok(()),
            None => Err(Error::ChainDiscontinuity(format!(
                "expected first block, got sequence {}",
                block.sequence
            ))),
            Some(head) => {
                if head.sequence.checked_add(1) != Some(block.sequence) {
                    return Err(Error::ChainDiscontinuity(format!(
                        "expected sequence {}, got {}",
                        u64::from(head.sequence) + 1,
                        block.sequence
                    )));
                }
                if block.prev_key_mr != head.key_mr {
                    return Err(Error::ChainDiscontinuity(format!(
                        "PrevKeyMR {} does not match stored KeyMR {}",
                        block.prev_key_mr, head.key_mr
                    )));
                }
                if block.prev_full_hash != head.full_hash {
                    return Err(Error::ChainDiscontinuity(format!(
                        "PrevFullHash {} does not match stored full hash {}",
                        block.prev_full_hash, head.full_hash
                    )));
                }
                Ok(())
            }
        }
    }

    /// Record the issuer identity
    pub fn set_identity(&mut self, identity: Identity) -> Result<()> {
        check_identity(&identity, &self.meta.issuer)?;
        let mut meta = self.meta.clone();
        meta.identity = Some(identity);

        let mut txn = self.store.begin();
        txn.put_metadata(&meta)?;
        txn.commit()?;
        self.meta = meta;

        tracing::info!(chain_id = %self.meta.chain_id, "Issuer identity set");
        Ok(())
    }

    /// Record the directory block the chain is synced to.
    ///
    /// Heights at or below the current sync height are ignored.
    pub fn set_sync(&mut self, height: u32, db_key_mr: Bytes32) -> Result<bool> {
        if height <= self.meta.sync_height {
            return Ok(false);
        }
        let mut meta = self.meta.clone();
        meta.sync_height = height;
        meta.sync_db_key_mr = db_key_mr;

        let mut txn = self.store.begin();
        txn.put_metadata(&meta)?;
        txn.commit()?;
        self.meta = meta;
        Ok(true)
    }

    /// Check an entry against the current state without applying it
    pub fn check_issuance(&self, entry: &Entry) -> Result<ValidationResult<Issuance>> {
        if self.issuance.is_some() {
            return Ok(Err(ValidationError::AlreadyIssued));
        }
        match self.dry_run(entry)? {
            Ok(Applied::Issuance(issuance)) => Ok(Ok(issuance)),
            Ok(Applied::Transaction(_)) => Err(Error::Integrity(
                "unissued chain applied a transaction".to_string(),
            )),
            Err(err) => Ok(Err(err)),
        }
    }

    /// Check a transaction against the current state without applying it
    pub fn check_transaction(&self, entry: &Entry) -> Result<ValidationResult<Transaction>> {
        if self.issuance.is_none() {
            return Ok(Err(ValidationError::NotIssued));
        }
        match self.dry_run(entry)? {
            Ok(Applied::Transaction(tx)) => Ok(Ok(tx)),
            Ok(Applied::Issuance(_)) => Err(Error::Integrity(
                "issued chain applied an issuance".to_string(),
            )),
            Err(err) => Ok(Err(err)),
        }
    }

    fn dry_run(&self, entry: &Entry) -> Result<ValidationResult<Applied>> {
        let mut entry = entry.clone();
        entry.chain_id = self.meta.chain_id;
        entry.hash = None;

        let mut meta = self.meta.clone();
        let mut issuance = self.issuance.clone();
        let mut txn = self.store.begin();
        let sequence = self.meta.head.map_or(0, |h| h.sequence);
        let (id, hash) = stage_entry(&mut txn, &mut meta, sequence, &entry)?;
        // The staged writes are dropped with `txn`
        apply_entry(&mut txn, &mut meta, &mut issuance, id, hash, &entry)
    }
}

impl Applied {
    fn kind(&self) -> &'static str {
        match self {
            Applied::Issuance(_) => "issuance",
            Applied::Transaction(tx) if tx.is_coinbase() => "coinbase",
            Applied::Transaction(_) => "transaction",
        }
    }
}

fn status_of(issuance: &Option<Issuance>) -> ChainStatus {
    match issuance {
        Some(_) => ChainStatus::Issued,
        None => ChainStatus::Tracked,
    }
}

fn first_block_name(block: &EntryBlock) -> Result<(String, ChainId)> {
    if !block.is_first() {
        return Err(Error::InvalidChain(format!(
            "not the first block of {}: sequence {}",
            block.chain_id, block.sequence
        )));
    }
    let first = block
        .entries
        .first()
        .ok_or_else(|| Error::InvalidChain("first block has no entries".to_string()))?;
    let (token_id, issuer) = token_issuer(&first.ext_ids)
        .ok_or_else(|| Error::InvalidChain("invalid token chain name IDs".to_string()))?;
    if compute_chain_id(&first.ext_ids) != block.chain_id {
        return Err(Error::InvalidChain(format!(
            "name IDs do not hash to chain ID {}",
            block.chain_id
        )));
    }
    Ok((token_id, issuer))
}

fn check_identity(identity: &Identity, issuer: &ChainId) -> Result<()> {
    if identity.chain_id != *issuer {
        return Err(Error::InvalidChain(format!(
            "identity {} is not the issuer {}",
            identity.chain_id, issuer
        )));
    }
    Ok(())
}

/// Re-read the issuance from its stored entry
pub(crate) fn load_issuance(reader: &impl KvRead, meta: &ChainMetadata) -> Result<Option<Issuance>> {
    let Some(id) = meta.issuance_entry_id else {
        return Ok(None);
    };
    let record = reader
        .entry(id)?
        .ok_or_else(|| Error::Integrity(format!("missing issuance entry {}", id)))?;
    let entry = Entry::unmarshal_binary(&record.data)?;
    let issuance = Issuance::from_content(&entry.content)
        .map_err(|e| Error::Integrity(format!("stored issuance entry is invalid: {}", e)))?;
    Ok(Some(issuance))
}

/// Insert an entry as not yet valid
fn stage_entry(
    txn: &mut BlockTxn<'_>,
    meta: &mut ChainMetadata,
    sequence: u32,
    entry: &Entry,
) -> Result<(u64, Bytes32)> {
    if entry.chain_id != meta.chain_id {
        return Err(Error::Integrity(format!(
            "entry for chain {} in block of {}",
            entry.chain_id, meta.chain_id
        )));
    }
    let data = entry.marshal_binary()?;
    let hash = compute_hash(&data);
    if let Some(announced) = entry.hash {
        if announced != hash {
            return Err(Error::Integrity(format!(
                "entry hash mismatch: announced {}, computed {}",
                announced, hash
            )));
        }
    }

    let id = meta.next_entry_id;
    meta.next_entry_id += 1;
    txn.insert_entry(&EntryRecord {
        id,
        sequence,
        hash,
        timestamp: entry.timestamp,
        valid: false,
        data,
    })?;
    Ok((id, hash))
}

fn apply_entry(
    txn: &mut BlockTxn<'_>,
    meta: &mut ChainMetadata,
    issuance: &mut Option<Issuance>,
    id: u64,
    hash: Bytes32,
    entry: &Entry,
) -> Result<ValidationResult<Applied>> {
    match issuance {
        None => {
            let applied = apply_issuance(txn, meta, id, entry)?;
            if let Ok(issued) = &applied {
                *issuance = Some(issued.clone());
            }
            Ok(applied.map(Applied::Issuance))
        }
        Some(issuance) => {
            Ok(apply_transaction(txn, meta, issuance, id, hash, entry)?.map(Applied::Transaction))
        }
    }
}

fn apply_issuance(
    txn: &mut BlockTxn<'_>,
    meta: &mut ChainMetadata,
    id: u64,
    entry: &Entry,
) -> Result<ValidationResult<Issuance>> {
    // The identity must be established strictly before the issuance
    let id_key = match &meta.identity {
        Some(identity) if identity.is_populated() && identity.timestamp < entry.timestamp => {
            identity.id1_key
        }
        _ => return Ok(Err(ValidationError::IdentityUnknown)),
    };
    let issuance = match validate_issuance(entry, &id_key) {
        Ok(issuance) => issuance,
        Err(err) => return Ok(Err(err)),
    };

    let mut sp = txn.savepoint();
    sp.set_valid(id)?;
    sp.commit();
    meta.issuance_entry_id = Some(id);
    Ok(Ok(issuance))
}

fn apply_transaction(
    txn: &mut BlockTxn<'_>,
    meta: &mut ChainMetadata,
    issuance: &Issuance,
    id: u64,
    hash: Bytes32,
    entry: &Entry,
) -> Result<ValidationResult<Transaction>> {
    if txn.valid_entry_id(&hash)?.is_some() {
        return Ok(Err(ValidationError::ReplayDetected));
    }
    let id_key = meta
        .identity
        .as_ref()
        .map(|identity| identity.id1_key)
        .ok_or_else(|| Error::Integrity("issued chain has no identity".to_string()))?;
    let tx = match validate_transaction(entry, issuance.token_type, &id_key) {
        Ok(tx) => tx,
        Err(err) => return Ok(Err(err)),
    };

    let mut sp = txn.savepoint();
    let mut next = meta.clone();
    sp.set_valid(id)?;
    let applied = match &tx {
        Transaction::Fat0(tx) => apply_fat0(&mut sp, &mut next, issuance, id, tx)?,
        Transaction::Fat1(tx) => apply_fat1(&mut sp, &mut next, issuance, id, hash, tx)?,
    };
    if let Err(err) = applied {
        // Dropping the savepoint discards this entry's writes
        return Ok(Err(err));
    }

    next.tx_count += 1;
    next.last_tx_entry_id = Some(id);
    sp.commit();
    *meta = next;
    Ok(Ok(tx))
}

/// Add a coinbase amount to the issued total, respecting a finite supply
fn issue(meta: &mut ChainMetadata, issuance: &Issuance, amount: u64) -> ValidationResult<()> {
    let total = meta
        .num_issued
        .checked_add(amount)
        .ok_or(ValidationError::SupplyExceeded)?;
    if issuance.supply > 0 && total > issuance.supply as u64 {
        return Err(ValidationError::SupplyExceeded);
    }
    meta.num_issued = total;
    Ok(())
}

fn apply_fat0(
    txn: &mut BlockTxn<'_>,
    meta: &mut ChainMetadata,
    issuance: &Issuance,
    id: u64,
    tx: &fat0::Transaction,
) -> Result<ValidationResult<()>> {
    if tx.is_coinbase() {
        let amount = tx.inputs.get(&coinbase()).unwrap_or(0);
        if let Err(err) = issue(meta, issuance, amount) {
            return Ok(Err(err));
        }
        txn.insert_address_tx(&coinbase(), id, false);
    } else {
        for (address, amount) in tx.inputs.iter() {
            if txn.balance(address)? < *amount {
                return Ok(Err(ValidationError::InsufficientBalance { address: *address }));
            }
            txn.sub_balance(address, *amount)?;
            txn.insert_address_tx(address, id, false);
        }
    }

    for (address, amount) in tx.outputs.iter() {
        txn.add_balance(address, *amount)?;
        txn.insert_address_tx(address, id, true);
    }
    Ok(Ok(()))
}

fn apply_fat1(
    txn: &mut BlockTxn<'_>,
    meta: &mut ChainMetadata,
    issuance: &Issuance,
    id: u64,
    hash: Bytes32,
    tx: &fat1::Transaction,
) -> Result<ValidationResult<()>> {
    let coinbase = coinbase();
    if let Some(minted) = tx.inputs.get(&coinbase).filter(|_| tx.is_coinbase()) {
        if let Err(err) = issue(meta, issuance, minted.len() as u64) {
            return Ok(Err(err));
        }
        txn.insert_address_tx(&coinbase, id, false);
        for nf_id in minted.iter() {
            if txn.nf_token(nf_id)?.is_some() {
                return Ok(Err(ValidationError::TokenExists(nf_id)));
            }
            // Owned by the coinbase until the outputs are applied
            txn.insert_nftoken(&NfTokenRecord {
                id: nf_id,
                owner: coinbase,
                creation_entry: id,
                creation_hash: hash,
                metadata: tx.token_metadata.get(nf_id).map(str::to_string),
            })?;
            txn.insert_nftoken_tx(nf_id, id, &coinbase, false);
        }
    } else {
        for (address, tokens) in tx.inputs.iter() {
            for nf_id in tokens.iter() {
                match txn.nf_token(nf_id)? {
                    None => return Ok(Err(ValidationError::NoSuchToken(nf_id))),
                    Some(token) if token.owner != *address => {
                        return Ok(Err(ValidationError::NotOwner {
                            id: nf_id,
                            address: *address,
                        }))
                    }
                    Some(_) => {}
                }
                txn.insert_nftoken_tx(nf_id, id, address, false);
            }
            let count = tokens.len() as u64;
            if txn.balance(address)? < count {
                return Ok(Err(ValidationError::InsufficientBalance { address: *address }));
            }
            txn.sub_balance(address, count)?;
            txn.insert_address_tx(address, id, false);
        }
    }

    for (address, tokens) in tx.outputs.iter() {
        txn.add_balance(address, tokens.len() as u64)?;
        txn.insert_address_tx(address, id, true);
        for nf_id in tokens.iter() {
            txn.set_owner(nf_id, address)?;
            txn.insert_nftoken_tx(nf_id, id, address, true);
        }
    }
    Ok(Ok(()))
}
