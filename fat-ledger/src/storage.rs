//! Per-chain storage using RocksDB
//!
//! Every tracked chain owns one RocksDB directory.
//!
//! # Column Families
//!
//! - `eblocks` - Entry blocks (key: sequence)
//! - `entries` - Entries with their valid flag (key: entry_id)
//! - `entry_hashes` - All entries by hash (key: hash || entry_id)
//! - `valid_hashes` - Valid entries by hash (key: hash, value: entry_id)
//! - `addresses` - Balances (key: address)
//! - `address_txs` - Address/entry relations (key: address || entry_id || to)
//! - `nf_tokens` - NFToken rows (key: id)
//! - `owner_tokens` - NFTokens by owner (key: owner || id)
//! - `nftoken_txs` - NFToken/entry relations (key: id || entry_id || address || to)
//! - `metadata` - Chain metadata (single key)
//!
//! # Writes
//!
//! All writes for one entry block are staged in a [`BlockTxn`] and land in a
//! single `WriteBatch`. Per-entry [`Savepoint`]s undo staged writes on drop
//! unless committed, so a rejected entry leaves no trace in the batch.

use crate::{
    config::RocksDBConfig,
    error::{Error, Result},
    nftokens::NfTokenId,
    types::{Address, Bytes32, ChainId, Identity, NetworkId},
};
use chrono::{DateTime, Utc};
use rocksdb::{
    ColumnFamily, ColumnFamilyDescriptor, Direction, IteratorMode, Options, Snapshot, WriteBatch,
    DB,
};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::collections::BTreeMap;
use std::ops::{Deref, DerefMut};
use std::path::{Path, PathBuf};

const METADATA_KEY: &[u8] = b"chain";

/// Column families of a chain store
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Cf {
    /// Entry blocks by sequence
    EBlocks,
    /// Entries by ID
    Entries,
    /// Entry IDs by hash
    EntryHashes,
    /// Valid entry IDs by hash
    ValidHashes,
    /// Balances by address
    Addresses,
    /// Address/entry relations
    AddressTxs,
    /// NFTokens by ID
    NfTokens,
    /// NFToken IDs by owner
    OwnerTokens,
    /// NFToken/entry relations
    NfTokenTxs,
    /// Chain metadata
    Metadata,
}

impl Cf {
    /// Every column family
    pub const ALL: [Cf; 10] = [
        Cf::EBlocks,
        Cf::Entries,
        Cf::EntryHashes,
        Cf::ValidHashes,
        Cf::Addresses,
        Cf::AddressTxs,
        Cf::NfTokens,
        Cf::OwnerTokens,
        Cf::NfTokenTxs,
        Cf::Metadata,
    ];

    /// Column family name
    pub fn name(&self) -> &'static str {
        match self {
            Cf::EBlocks => "eblocks",
            Cf::Entries => "entries",
            Cf::EntryHashes => "entry_hashes",
            Cf::ValidHashes => "valid_hashes",
            Cf::Addresses => "addresses",
            Cf::AddressTxs => "address_txs",
            Cf::NfTokens => "nf_tokens",
            Cf::OwnerTokens => "owner_tokens",
            Cf::NfTokenTxs => "nftoken_txs",
            Cf::Metadata => "metadata",
        }
    }

    fn options(&self) -> Options {
        let mut opts = Options::default();
        match self {
            // Raw block and entry bytes compress well and are rarely read
            Cf::EBlocks | Cf::Entries => {
                opts.set_compression_type(rocksdb::DBCompressionType::Zstd);
            }
            // Point lookups on every applied entry
            Cf::ValidHashes | Cf::Addresses | Cf::NfTokens => {
                opts.set_compression_type(rocksdb::DBCompressionType::Lz4);
                let mut block_opts = rocksdb::BlockBasedOptions::default();
                block_opts.set_bloom_filter(10.0, false);
                opts.set_block_based_table_factory(&block_opts);
            }
            _ => {
                opts.set_compression_type(rocksdb::DBCompressionType::Lz4);
            }
        }
        opts
    }
}

/// Last applied entry block
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockHead {
    /// Sequence number
    pub sequence: u32,
    /// KeyMR
    pub key_mr: Bytes32,
    /// Full hash
    pub full_hash: Bytes32,
}

/// Stored entry block
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockRecord {
    /// Sequence number
    pub sequence: u32,
    /// Directory block height
    pub height: u32,
    /// KeyMR
    pub key_mr: Bytes32,
    /// KeyMR of the previous block
    pub prev_key_mr: Bytes32,
    /// Full hash
    pub full_hash: Bytes32,
    /// Full hash of the previous block
    pub prev_full_hash: Bytes32,
    /// Directory block timestamp
    pub timestamp: DateTime<Utc>,
    /// Encoded block
    #[serde(with = "serde_bytes")]
    pub data: Vec<u8>,
}

/// Stored entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryRecord {
    /// Insertion order, starting at 1
    pub id: u64,
    /// Sequence of the containing block
    pub sequence: u32,
    /// Entry hash
    pub hash: Bytes32,
    /// Commit timestamp
    pub timestamp: DateTime<Utc>,
    /// Whether the entry was applied
    pub valid: bool,
    /// Encoded entry
    #[serde(with = "serde_bytes")]
    pub data: Vec<u8>,
}

/// Stored NFToken
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NfTokenRecord {
    /// Token ID
    pub id: NfTokenId,
    /// Current owner
    pub owner: Address,
    /// Entry that minted the token
    pub creation_entry: u64,
    /// Hash of the minting entry
    pub creation_hash: Bytes32,
    /// Raw JSON metadata declared at mint
    pub metadata: Option<String>,
}

/// Chain-wide state persisted alongside the data
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainMetadata {
    /// Token chain ID
    pub chain_id: ChainId,
    /// Token ID from the chain name
    pub token_id: String,
    /// Issuer identity chain ID
    pub issuer: ChainId,
    /// Factom network
    pub network_id: NetworkId,
    /// Issuer identity, once known
    pub identity: Option<Identity>,
    /// Directory block height synced to
    pub sync_height: u32,
    /// Directory block KeyMR synced to
    pub sync_db_key_mr: Bytes32,
    /// Last applied block
    pub head: Option<BlockHead>,
    /// ID assigned to the next inserted entry
    pub next_entry_id: u64,
    /// ID of the valid issuance entry
    pub issuance_entry_id: Option<u64>,
    /// Total minted through coinbase transactions
    pub num_issued: u64,
    /// Number of valid transactions
    pub tx_count: u64,
    /// ID of the latest valid transaction
    pub last_tx_entry_id: Option<u64>,
}

impl ChainMetadata {
    /// Metadata for a newly tracked chain
    pub fn new(chain_id: ChainId, token_id: String, issuer: ChainId, network_id: NetworkId) -> Self {
        Self {
            chain_id,
            token_id,
            issuer,
            network_id,
            identity: None,
            sync_height: 0,
            sync_db_key_mr: Bytes32::ZERO,
            head: None,
            next_entry_id: 1,
            issuance_entry_id: None,
            num_issued: 0,
            tx_count: 0,
            last_tx_entry_id: None,
        }
    }
}

/// Relation key `address || entry_id || to`
pub fn address_tx_key(address: &Address, entry_id: u64, to: bool) -> Vec<u8> {
    let mut key = Vec::with_capacity(32 + 8 + 1);
    key.extend_from_slice(address.as_bytes());
    key.extend_from_slice(&entry_id.to_be_bytes());
    key.push(to as u8);
    key
}

/// Relation key `id || entry_id || address || to`
pub fn nftoken_tx_key(id: NfTokenId, entry_id: u64, address: &Address, to: bool) -> Vec<u8> {
    let mut key = Vec::with_capacity(8 + 8 + 32 + 1);
    key.extend_from_slice(&id.to_be_bytes());
    key.extend_from_slice(&entry_id.to_be_bytes());
    key.extend_from_slice(address.as_bytes());
    key.push(to as u8);
    key
}

fn owner_token_key(owner: &Address, id: NfTokenId) -> Vec<u8> {
    let mut key = Vec::with_capacity(32 + 8);
    key.extend_from_slice(owner.as_bytes());
    key.extend_from_slice(&id.to_be_bytes());
    key
}

fn entry_hash_key(hash: &Bytes32, id: u64) -> Vec<u8> {
    let mut key = Vec::with_capacity(32 + 8);
    key.extend_from_slice(hash.as_bytes());
    key.extend_from_slice(&id.to_be_bytes());
    key
}

/// Decode a big-endian u64 from the given offset of a key
pub fn read_u64(key: &[u8], offset: usize) -> Result<u64> {
    key.get(offset..offset + 8)
        .and_then(|b| b.try_into().ok())
        .map(u64::from_be_bytes)
        .ok_or_else(|| Error::Integrity(format!("key too short: {} bytes", key.len())))
}

fn decode<T: DeserializeOwned>(value: Option<Vec<u8>>) -> Result<Option<T>> {
    value.map(|v| bincode::deserialize(&v)).transpose().map_err(Error::from)
}

/// Read access shared by the store, its snapshots and staged transactions
pub trait KvRead {
    /// Raw value lookup
    fn get_raw(&self, cf: Cf, key: &[u8]) -> Result<Option<Vec<u8>>>;

    /// Chain metadata
    fn metadata(&self) -> Result<ChainMetadata> {
        decode(self.get_raw(Cf::Metadata, METADATA_KEY)?)?
            .ok_or_else(|| Error::Integrity("missing chain metadata".to_string()))
    }

    /// Entry block by sequence
    fn block(&self, sequence: u32) -> Result<Option<BlockRecord>> {
        decode(self.get_raw(Cf::EBlocks, &sequence.to_be_bytes())?)
    }

    /// Entry by ID
    fn entry(&self, id: u64) -> Result<Option<EntryRecord>> {
        decode(self.get_raw(Cf::Entries, &id.to_be_bytes())?)
    }

    /// ID of the valid entry with `hash`
    fn valid_entry_id(&self, hash: &Bytes32) -> Result<Option<u64>> {
        self.get_raw(Cf::ValidHashes, hash.as_bytes())?
            .map(|v| read_u64(&v, 0))
            .transpose()
    }

    /// Balance of an address, zero if never seen
    fn balance(&self, address: &Address) -> Result<u64> {
        Ok(decode(self.get_raw(Cf::Addresses, address.as_bytes())?)?.unwrap_or(0))
    }

    /// NFToken by ID
    fn nf_token(&self, id: NfTokenId) -> Result<Option<NfTokenRecord>> {
        decode(self.get_raw(Cf::NfTokens, &id.to_be_bytes())?)
    }
}

/// RocksDB store for one chain
pub struct ChainStore {
    db: DB,
    path: PathBuf,
}

impl std::fmt::Debug for ChainStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChainStore").field("path", &self.path).finish()
    }
}

impl ChainStore {
    /// Whether a store exists at `path`
    pub fn exists(path: &Path) -> bool {
        path.join("CURRENT").is_file()
    }

    /// Open or create a store
    pub fn open(path: &Path, config: &RocksDBConfig) -> Result<Self> {
        std::fs::create_dir_all(path)?;

        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_write_buffer_size(config.write_buffer_size_mb * 1024 * 1024);
        db_opts.set_max_write_buffer_number(config.max_write_buffer_number);
        db_opts.set_max_background_jobs(config.max_background_jobs);
        if config.enable_statistics {
            db_opts.enable_statistics();
        }

        let cf_descriptors = Cf::ALL
            .iter()
            .map(|cf| ColumnFamilyDescriptor::new(cf.name(), cf.options()));
        let db = DB::open_cf_descriptors(&db_opts, path, cf_descriptors)?;

        tracing::debug!(path = ?path, "Opened chain store");

        Ok(Self {
            db,
            path: path.to_path_buf(),
        })
    }

    /// Directory of the store
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn cf_handle(&self, cf: Cf) -> Result<&ColumnFamily> {
        self.db
            .cf_handle(cf.name())
            .ok_or_else(|| Error::Storage(format!("Column family {} not found", cf.name())))
    }

    /// Point-in-time view for readers
    pub fn snapshot(&self) -> StoreSnapshot<'_> {
        StoreSnapshot {
            store: self,
            snapshot: self.db.snapshot(),
        }
    }

    /// Start staging writes for one entry block
    pub fn begin(&self) -> BlockTxn<'_> {
        BlockTxn {
            store: self,
            pending: BTreeMap::new(),
            journal: Vec::new(),
        }
    }

    /// Approximate number of keys in a column family
    pub fn approximate_count(&self, cf: Cf) -> Result<u64> {
        Ok(self
            .db
            .property_int_value_cf(self.cf_handle(cf)?, "rocksdb.estimate-num-keys")?
            .unwrap_or(0))
    }
}

impl KvRead for ChainStore {
    fn get_raw(&self, cf: Cf, key: &[u8]) -> Result<Option<Vec<u8>>> {
        Ok(self.db.get_cf(self.cf_handle(cf)?, key)?)
    }
}

/// Snapshot-isolated reads
pub struct StoreSnapshot<'a> {
    store: &'a ChainStore,
    snapshot: Snapshot<'a>,
}

impl<'a> StoreSnapshot<'a> {
    /// Visit keys starting with `prefix` in key order, or reverse key order.
    ///
    /// Iteration stops early when `f` returns `false`.
    pub fn scan_prefix<F>(&self, cf: Cf, prefix: &[u8], reverse: bool, mut f: F) -> Result<()>
    where
        F: FnMut(&[u8], &[u8]) -> Result<bool>,
    {
        let handle = self.store.cf_handle(cf)?;
        let upper: Vec<u8>;
        let mode = match (prefix.is_empty(), reverse) {
            (true, false) => IteratorMode::Start,
            (true, true) => IteratorMode::End,
            (false, false) => IteratorMode::From(prefix, Direction::Forward),
            (false, true) => {
                // Seek to the last key carrying the prefix
                upper = [prefix, &[0xff; 64][..]].concat();
                IteratorMode::From(&upper, Direction::Reverse)
            }
        };

        for item in self.snapshot.iterator_cf(handle, mode) {
            let (key, value) = item?;
            if !key.starts_with(prefix) {
                break;
            }
            if !f(&key, &value)? {
                break;
            }
        }
        Ok(())
    }

    /// ID of the first entry with `hash`, valid or not
    pub fn first_entry_id(&self, hash: &Bytes32) -> Result<Option<u64>> {
        let mut found = None;
        self.scan_prefix(Cf::EntryHashes, hash.as_bytes(), false, |key, _| {
            found = Some(read_u64(key, 32)?);
            Ok(false)
        })?;
        Ok(found)
    }
}

impl KvRead for StoreSnapshot<'_> {
    fn get_raw(&self, cf: Cf, key: &[u8]) -> Result<Option<Vec<u8>>> {
        Ok(self.snapshot.get_cf(self.store.cf_handle(cf)?, key)?)
    }
}

type PendingKey = (Cf, Vec<u8>);

/// Writes staged for one entry block
pub struct BlockTxn<'a> {
    store: &'a ChainStore,
    /// `None` marks a deletion
    pending: BTreeMap<PendingKey, Option<Vec<u8>>>,
    /// Previous pending state of each write, for savepoint rollback
    journal: Vec<(PendingKey, Option<Option<Vec<u8>>>)>,
}

impl<'a> BlockTxn<'a> {
    fn stage(&mut self, cf: Cf, key: Vec<u8>, value: Option<Vec<u8>>) {
        let pending_key = (cf, key);
        let previous = self.pending.insert(pending_key.clone(), value);
        self.journal.push((pending_key, previous));
    }

    /// Stage a raw write
    pub fn put_raw(&mut self, cf: Cf, key: Vec<u8>, value: Vec<u8>) {
        self.stage(cf, key, Some(value));
    }

    /// Stage a deletion
    pub fn delete_raw(&mut self, cf: Cf, key: Vec<u8>) {
        self.stage(cf, key, None);
    }

    /// Stage a bincode-encoded write
    pub fn put<T: Serialize>(&mut self, cf: Cf, key: Vec<u8>, value: &T) -> Result<()> {
        let value = bincode::serialize(value)?;
        self.put_raw(cf, key, value);
        Ok(())
    }

    /// Number of staged keys
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    /// Whether nothing is staged
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Open a savepoint that undoes everything staged after it on drop
    pub fn savepoint(&mut self) -> Savepoint<'_, 'a> {
        let mark = self.journal.len();
        Savepoint {
            txn: self,
            mark,
            committed: false,
        }
    }

    fn rollback_to(&mut self, mark: usize) {
        while self.journal.len() > mark {
            let Some((key, previous)) = self.journal.pop() else {
                break;
            };
            match previous {
                Some(value) => {
                    self.pending.insert(key, value);
                }
                None => {
                    self.pending.remove(&key);
                }
            }
        }
    }

    /// Write everything staged in one atomic batch
    pub fn commit(self) -> Result<()> {
        let mut batch = WriteBatch::default();
        for ((cf, key), value) in &self.pending {
            let handle = self.store.cf_handle(*cf)?;
            match value {
                Some(value) => batch.put_cf(handle, key, value),
                None => batch.delete_cf(handle, key),
            }
        }
        self.store.db.write(batch)?;
        Ok(())
    }

    // Typed writes

    /// Store chain metadata
    pub fn put_metadata(&mut self, metadata: &ChainMetadata) -> Result<()> {
        self.put(Cf::Metadata, METADATA_KEY.to_vec(), metadata)
    }

    /// Store an entry block
    pub fn insert_block(&mut self, block: &BlockRecord) -> Result<()> {
        self.put(Cf::EBlocks, block.sequence.to_be_bytes().to_vec(), block)
    }

    /// Store an entry and index it by hash
    pub fn insert_entry(&mut self, entry: &EntryRecord) -> Result<()> {
        self.put(Cf::Entries, entry.id.to_be_bytes().to_vec(), entry)?;
        self.put_raw(Cf::EntryHashes, entry_hash_key(&entry.hash, entry.id), Vec::new());
        if entry.valid {
            self.put_raw(
                Cf::ValidHashes,
                entry.hash.as_bytes().to_vec(),
                entry.id.to_be_bytes().to_vec(),
            );
        }
        Ok(())
    }

    /// Mark a stored entry valid
    pub fn set_valid(&mut self, id: u64) -> Result<()> {
        let mut entry = self
            .entry(id)?
            .ok_or_else(|| Error::Integrity(format!("no entry with id {}", id)))?;
        entry.valid = true;
        self.insert_entry(&entry)
    }

    /// Credit an address
    pub fn add_balance(&mut self, address: &Address, amount: u64) -> Result<u64> {
        let balance = self.balance(address)?.checked_add(amount).ok_or_else(|| {
            Error::InvariantViolation(format!("balance overflow: {}", address))
        })?;
        self.put(Cf::Addresses, address.as_bytes().to_vec(), &balance)?;
        Ok(balance)
    }

    /// Debit an address. Balances never go negative.
    pub fn sub_balance(&mut self, address: &Address, amount: u64) -> Result<u64> {
        let balance = self.balance(address)?.checked_sub(amount).ok_or_else(|| {
            Error::InvariantViolation(format!("negative balance: {}", address))
        })?;
        self.put(Cf::Addresses, address.as_bytes().to_vec(), &balance)?;
        Ok(balance)
    }

    /// Relate an address to a transaction entry
    pub fn insert_address_tx(&mut self, address: &Address, entry_id: u64, to: bool) {
        self.put_raw(Cf::AddressTxs, address_tx_key(address, entry_id, to), Vec::new());
    }

    /// Relate an NFToken to a transaction entry through an address
    pub fn insert_nftoken_tx(&mut self, id: NfTokenId, entry_id: u64, address: &Address, to: bool) {
        self.put_raw(
            Cf::NfTokenTxs,
            nftoken_tx_key(id, entry_id, address, to),
            Vec::new(),
        );
    }

    /// Store a newly minted NFToken
    pub fn insert_nftoken(&mut self, token: &NfTokenRecord) -> Result<()> {
        if self.nf_token(token.id)?.is_some() {
            return Err(Error::InvariantViolation(format!(
                "NFTokenID({}) already exists",
                token.id
            )));
        }
        self.put(Cf::NfTokens, token.id.to_be_bytes().to_vec(), token)?;
        self.put_raw(Cf::OwnerTokens, owner_token_key(&token.owner, token.id), Vec::new());
        Ok(())
    }

    /// Move an NFToken to a new owner
    pub fn set_owner(&mut self, id: NfTokenId, owner: &Address) -> Result<()> {
        let mut token = self
            .nf_token(id)?
            .ok_or_else(|| Error::InvariantViolation(format!("no such NFTokenID({})", id)))?;
        self.delete_raw(Cf::OwnerTokens, owner_token_key(&token.owner, id));
        token.owner = *owner;
        self.put(Cf::NfTokens, id.to_be_bytes().to_vec(), &token)?;
        self.put_raw(Cf::OwnerTokens, owner_token_key(owner, id), Vec::new());
        Ok(())
    }
}

impl KvRead for BlockTxn<'_> {
    fn get_raw(&self, cf: Cf, key: &[u8]) -> Result<Option<Vec<u8>>> {
        match self.pending.get(&(cf, key.to_vec())) {
            Some(value) => Ok(value.clone()),
            None => self.store.get_raw(cf, key),
        }
    }
}

/// Scoped undo point inside a [`BlockTxn`]
///
/// Dropping a savepoint without calling [`Savepoint::commit`] discards every
/// write staged through it.
pub struct Savepoint<'t, 'a> {
    txn: &'t mut BlockTxn<'a>,
    mark: usize,
    committed: bool,
}

impl Savepoint<'_, '_> {
    /// Keep the staged writes
    pub fn commit(mut self) {
        self.committed = true;
    }
}

impl<'a> Deref for Savepoint<'_, 'a> {
    type Target = BlockTxn<'a>;

    fn deref(&self) -> &Self::Target {
        self.txn
    }
}

impl DerefMut for Savepoint<'_, '_> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.txn
    }
}

impl Drop for Savepoint<'_, '_> {
    fn drop(&mut self) {
        if !self.committed {
            let discarded = self.txn.journal.len() - self.mark;
            self.txn.rollback_to(self.mark);
            tracing::trace!(discarded, "Savepoint rolled back");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn test_store() -> (ChainStore, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let store = ChainStore::open(temp_dir.path(), &RocksDBConfig::default()).unwrap();
        (store, temp_dir)
    }

    fn address(b: u8) -> Address {
        Address(Bytes32([b; 32]))
    }

    fn metadata() -> ChainMetadata {
        ChainMetadata::new(
            Bytes32([1; 32]),
            "test".to_string(),
            Bytes32([2; 32]),
            NetworkId::LOCALNET,
        )
    }

    #[test]
    fn test_storage_open() {
        let (store, temp) = test_store();
        for cf in Cf::ALL {
            assert!(store.db.cf_handle(cf.name()).is_some());
        }
        assert!(ChainStore::exists(temp.path()));
        assert!(matches!(store.metadata(), Err(Error::Integrity(_))));
    }

    #[test]
    fn test_commit_is_atomic_and_visible() {
        let (store, _temp) = test_store();

        let mut txn = store.begin();
        txn.put_metadata(&metadata()).unwrap();
        txn.add_balance(&address(1), 10).unwrap();
        assert_eq!(txn.balance(&address(1)).unwrap(), 10);
        // Nothing is written before commit
        assert_eq!(store.balance(&address(1)).unwrap(), 0);

        txn.commit().unwrap();
        assert_eq!(store.balance(&address(1)).unwrap(), 10);
        assert_eq!(store.metadata().unwrap(), metadata());
    }

    #[test]
    fn test_savepoint_rolls_back_on_drop() {
        let (store, _temp) = test_store();
        let mut txn = store.begin();
        txn.add_balance(&address(1), 10).unwrap();

        {
            let mut sp = txn.savepoint();
            sp.sub_balance(&address(1), 4).unwrap();
            sp.add_balance(&address(2), 4).unwrap();
            assert_eq!(sp.balance(&address(1)).unwrap(), 6);
        }
        assert_eq!(txn.balance(&address(1)).unwrap(), 10);
        assert_eq!(txn.balance(&address(2)).unwrap(), 0);

        {
            let mut sp = txn.savepoint();
            sp.sub_balance(&address(1), 4).unwrap();
            sp.commit();
        }
        assert_eq!(txn.balance(&address(1)).unwrap(), 6);

        txn.commit().unwrap();
        assert_eq!(store.balance(&address(1)).unwrap(), 6);
        assert_eq!(store.balance(&address(2)).unwrap(), 0);
    }

    #[test]
    fn test_negative_balance_is_invariant_violation() {
        let (store, _temp) = test_store();
        let mut txn = store.begin();
        txn.add_balance(&address(1), 3).unwrap();
        assert!(matches!(
            txn.sub_balance(&address(1), 4),
            Err(Error::InvariantViolation(_))
        ));
        assert!(matches!(
            txn.add_balance(&address(1), u64::MAX),
            Err(Error::InvariantViolation(_))
        ));
    }

    #[test]
    fn test_entries_and_hash_indices() {
        let (store, _temp) = test_store();
        let hash = Bytes32([9; 32]);
        let record = |id| EntryRecord {
            id,
            sequence: 0,
            hash,
            timestamp: DateTime::from_timestamp(1_600_000_000, 0).unwrap(),
            valid: false,
            data: vec![0; 35],
        };

        let mut txn = store.begin();
        txn.insert_entry(&record(1)).unwrap();
        txn.insert_entry(&record(2)).unwrap();
        txn.set_valid(2).unwrap();
        txn.commit().unwrap();

        let snap = store.snapshot();
        assert_eq!(snap.first_entry_id(&hash).unwrap(), Some(1));
        assert_eq!(snap.valid_entry_id(&hash).unwrap(), Some(2));
        assert!(!snap.entry(1).unwrap().unwrap().valid);
        assert!(snap.entry(2).unwrap().unwrap().valid);
        assert_eq!(snap.first_entry_id(&Bytes32([8; 32])).unwrap(), None);
    }

    #[test]
    fn test_nftoken_ownership_index() {
        let (store, _temp) = test_store();
        let mut txn = store.begin();
        for id in [3, 1, 2] {
            txn.insert_nftoken(&NfTokenRecord {
                id,
                owner: address(1),
                creation_entry: 1,
                creation_hash: Bytes32::ZERO,
                metadata: None,
            })
            .unwrap();
        }
        assert!(txn
            .insert_nftoken(&NfTokenRecord {
                id: 1,
                owner: address(2),
                creation_entry: 2,
                creation_hash: Bytes32::ZERO,
                metadata: None,
            })
            .is_err());
        txn.set_owner(2, &address(2)).unwrap();
        txn.commit().unwrap();

        let snap = store.snapshot();
        let owned = |owner: Address, reverse: bool| {
            let mut ids = Vec::new();
            snap.scan_prefix(Cf::OwnerTokens, owner.as_bytes(), reverse, |key, _| {
                ids.push(read_u64(key, 32)?);
                Ok(true)
            })
            .unwrap();
            ids
        };
        assert_eq!(owned(address(1), false), vec![1, 3]);
        assert_eq!(owned(address(1), true), vec![3, 1]);
        assert_eq!(owned(address(2), false), vec![2]);
        assert_eq!(snap.nf_token(2).unwrap().unwrap().owner, address(2));
    }

    #[test]
    fn test_snapshot_isolation() {
        let (store, _temp) = test_store();
        let mut txn = store.begin();
        txn.add_balance(&address(1), 1).unwrap();
        txn.commit().unwrap();

        let snap = store.snapshot();
        let mut txn = store.begin();
        txn.add_balance(&address(1), 1).unwrap();
        txn.commit().unwrap();

        assert_eq!(snap.balance(&address(1)).unwrap(), 1);
        assert_eq!(store.balance(&address(1)).unwrap(), 2);
    }
}
