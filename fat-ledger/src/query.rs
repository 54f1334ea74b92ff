//! Read-only queries over a chain snapshot
//!
//! A [`ChainView`] pins one RocksDB snapshot, so every answer it gives is
//! consistent with a single applied block even while the writer moves on.

use crate::{
    chain::{load_issuance, ChainStatus},
    crypto::coinbase,
    entry::Entry,
    error::{Error, Result},
    issuance::{Issuance, TokenType},
    nftokens::{NfTokenId, NfTokens},
    storage::{read_u64, ChainMetadata, ChainStore, Cf, EntryRecord, KvRead, StoreSnapshot},
    types::{Address, Bytes32, ChainId},
    validation::Transaction,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

/// Default page size
pub const DEFAULT_LIMIT: u64 = 25;

/// Result ordering by entry or token ID
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Order {
    /// Oldest first
    #[default]
    Asc,
    /// Newest first
    Desc,
}

impl FromStr for Order {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "" | "asc" => Ok(Order::Asc),
            "desc" => Ok(Order::Desc),
            other => Err(Error::InvalidQuery(format!("invalid order: {:?}", other))),
        }
    }
}

impl fmt::Display for Order {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Order::Asc => write!(f, "asc"),
            Order::Desc => write!(f, "desc"),
        }
    }
}

/// Which side of a transaction an address is on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TxDirection {
    /// Address received tokens
    To,
    /// Address sent tokens
    From,
}

impl TxDirection {
    fn matches(self, to: bool) -> bool {
        match self {
            TxDirection::To => to,
            TxDirection::From => !to,
        }
    }
}

/// One-based page selection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Page {
    /// Page number, starting at 1
    pub page: u64,
    /// Page size
    pub limit: u64,
    /// Ordering
    pub order: Order,
}

impl Default for Page {
    fn default() -> Self {
        Self {
            page: 1,
            limit: DEFAULT_LIMIT,
            order: Order::Asc,
        }
    }
}

impl Page {
    /// Page `page` of `limit` items
    pub fn new(page: u64, limit: u64, order: Order) -> Self {
        Self { page, limit, order }
    }

    fn offset(&self) -> Result<u64> {
        if self.page == 0 {
            return Err(Error::InvalidQuery("page starts at 1".to_string()));
        }
        if self.limit == 0 {
            return Err(Error::InvalidQuery("limit must be positive".to_string()));
        }
        (self.page - 1)
            .checked_mul(self.limit)
            .ok_or_else(|| Error::InvalidQuery("page out of range".to_string()))
    }

    fn reverse(&self) -> bool {
        self.order == Order::Desc
    }
}

/// Filters for transaction history
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TxFilter {
    /// Only entries at or after the first entry with this hash
    pub start_hash: Option<Bytes32>,
    /// Only transactions involving one of these addresses
    pub addresses: Vec<Address>,
    /// Only transactions moving this NFToken
    pub nf_token: Option<NfTokenId>,
    /// Only the given side of the listed addresses
    pub direction: Option<TxDirection>,
    /// Pagination
    pub page: Page,
}

/// Applied transaction with its entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxRecord {
    /// Insertion order within the chain
    pub entry_id: u64,
    /// Entry carrying the transaction
    pub entry: Entry,
    /// Decoded transaction
    pub transaction: Transaction,
}

/// Token statistics
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Stats {
    /// Token chain
    pub chain_id: ChainId,
    /// Token ID
    pub token_id: String,
    /// Issuer identity chain
    pub issuer: ChainId,
    /// Issuance, once applied
    pub issuance: Option<Issuance>,
    /// Hash of the issuance entry
    pub issuance_hash: Option<Bytes32>,
    /// Issued minus burned
    pub circulating: u64,
    /// Held by the coinbase address
    pub burned: u64,
    /// Valid transactions, issuance excluded
    pub tx_count: u64,
    /// Time of the issuance entry
    pub issuance_timestamp: Option<DateTime<Utc>>,
    /// Time of the latest valid transaction
    pub last_tx_timestamp: Option<DateTime<Utc>>,
    /// Directory block height synced to
    pub sync_height: u32,
}

/// NFToken with its mint details
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NfTokenInfo {
    /// Token ID
    pub id: NfTokenId,
    /// Current owner
    pub owner: Address,
    /// Hash of the minting entry
    pub creation_hash: Bytes32,
    /// Raw JSON metadata
    pub metadata: Option<String>,
}

/// Snapshot-isolated view of one chain
pub struct ChainView<'a> {
    snapshot: StoreSnapshot<'a>,
    meta: ChainMetadata,
    issuance: Option<Issuance>,
}

impl<'a> ChainView<'a> {
    /// Pin the current state of `store`
    pub fn new(store: &'a ChainStore) -> Result<Self> {
        let snapshot = store.snapshot();
        let meta = snapshot.metadata()?;
        let issuance = load_issuance(&snapshot, &meta)?;
        Ok(Self {
            snapshot,
            meta,
            issuance,
        })
    }

    /// Chain metadata at the snapshot
    pub fn metadata(&self) -> &ChainMetadata {
        &self.meta
    }

    /// Issuance at the snapshot
    pub fn issuance(&self) -> Option<&Issuance> {
        self.issuance.as_ref()
    }

    /// Lifecycle state at the snapshot
    pub fn status(&self) -> ChainStatus {
        match self.issuance {
            Some(_) => ChainStatus::Issued,
            None => ChainStatus::Tracked,
        }
    }

    fn issued(&self) -> Result<&Issuance> {
        self.issuance
            .as_ref()
            .ok_or_else(|| Error::InvalidQuery(format!("token not issued: {}", self.meta.chain_id)))
    }

    /// Balance of an address
    pub fn balance(&self, address: &Address) -> Result<u64> {
        self.snapshot.balance(address)
    }

    /// NFTokens owned by an address
    pub fn nf_balance(&self, address: &Address, page: &Page) -> Result<NfTokens> {
        if self.issued()?.token_type != TokenType::Fat1 {
            return Err(Error::InvalidQuery("not a FAT-1 chain".to_string()));
        }
        let ids = self.scan_page(Cf::OwnerTokens, address.as_bytes(), page, |key, _| {
            Ok(Some(read_u64(key, 32)?))
        })?;
        Ok(ids.into_iter().collect())
    }

    /// Supply and activity summary
    pub fn stats(&self) -> Result<Stats> {
        let burned = self.snapshot.balance(&coinbase())?;
        let circulating = self.meta.num_issued.checked_sub(burned).ok_or_else(|| {
            Error::Integrity(format!(
                "burned {} exceeds issued {}",
                burned, self.meta.num_issued
            ))
        })?;

        let issuance_entry = self.entry_record(self.meta.issuance_entry_id)?;
        let last_tx = self.entry_record(self.meta.last_tx_entry_id)?;

        Ok(Stats {
            chain_id: self.meta.chain_id,
            token_id: self.meta.token_id.clone(),
            issuer: self.meta.issuer,
            issuance: self.issuance.clone(),
            issuance_hash: issuance_entry.as_ref().map(|e| e.hash),
            circulating,
            burned,
            tx_count: self.meta.tx_count,
            issuance_timestamp: issuance_entry.map(|e| e.timestamp),
            last_tx_timestamp: last_tx.map(|e| e.timestamp),
            sync_height: self.meta.sync_height,
        })
    }

    fn entry_record(&self, id: Option<u64>) -> Result<Option<EntryRecord>> {
        match id {
            Some(id) => self
                .snapshot
                .entry(id)?
                .map(Some)
                .ok_or_else(|| Error::Integrity(format!("missing entry {}", id))),
            None => Ok(None),
        }
    }

    /// Transaction history matching `filter`
    pub fn transactions(&self, filter: &TxFilter) -> Result<Vec<TxRecord>> {
        let issuance = self.issued()?;
        if filter.direction.is_some() && filter.addresses.is_empty() {
            return Err(Error::InvalidQuery(
                "to/from requires at least one address".to_string(),
            ));
        }
        if filter.nf_token.is_some() && issuance.token_type != TokenType::Fat1 {
            return Err(Error::InvalidQuery("not a FAT-1 chain".to_string()));
        }
        let offset = filter.page.offset()?;

        let start = match &filter.start_hash {
            Some(hash) => self
                .snapshot
                .first_entry_id(hash)?
                .ok_or_else(|| Error::InvalidQuery(format!("no such entry: {}", hash)))?,
            None => 0,
        };

        let ids = if filter.addresses.is_empty() && filter.nf_token.is_none() {
            self.all_transaction_ids(start, offset, &filter.page)?
        } else {
            let mut ids = self.related_ids(filter)?;
            ids.retain(|id| *id >= start && Some(*id) != self.meta.issuance_entry_id);
            let ids: Box<dyn Iterator<Item = u64>> = match filter.page.order {
                Order::Asc => Box::new(ids.into_iter()),
                Order::Desc => Box::new(ids.into_iter().rev()),
            };
            ids.skip(offset as usize)
                .take(filter.page.limit as usize)
                .collect()
        };

        let mut records = Vec::with_capacity(ids.len());
        for id in ids {
            let record = self
                .snapshot
                .entry(id)?
                .ok_or_else(|| Error::Integrity(format!("missing entry {}", id)))?;
            if record.valid {
                records.push(self.tx_record(record, issuance.token_type)?);
            }
        }
        Ok(records)
    }

    fn all_transaction_ids(&self, start: u64, offset: u64, page: &Page) -> Result<Vec<u64>> {
        let issuance_id = self.meta.issuance_entry_id;
        let mut skipped = 0;
        let mut ids = Vec::new();
        self.snapshot
            .scan_prefix(Cf::Entries, &[], page.reverse(), |key, value| {
                let id = read_u64(key, 0)?;
                if id < start {
                    // Ascending scans continue toward the start, descending ones are past it
                    return Ok(page.order == Order::Asc);
                }
                let record: EntryRecord = bincode::deserialize(value)?;
                if !record.valid || Some(id) == issuance_id {
                    return Ok(true);
                }
                if skipped < offset {
                    skipped += 1;
                    return Ok(true);
                }
                ids.push(id);
                Ok((ids.len() as u64) < page.limit)
            })?;
        Ok(ids)
    }

    /// Entry IDs related to the filter's addresses and token
    fn related_ids(&self, filter: &TxFilter) -> Result<BTreeSet<u64>> {
        let direction_ok = |to: bool| filter.direction.map_or(true, |d| d.matches(to));

        let by_address = if filter.addresses.is_empty() {
            None
        } else {
            let mut ids = BTreeSet::new();
            for address in &filter.addresses {
                self.snapshot
                    .scan_prefix(Cf::AddressTxs, address.as_bytes(), false, |key, _| {
                        if direction_ok(to_flag(key, 40)?) {
                            ids.insert(read_u64(key, 32)?);
                        }
                        Ok(true)
                    })?;
            }
            Some(ids)
        };

        let by_token = match filter.nf_token {
            Some(nf_id) => {
                let addresses: BTreeSet<Address> = filter.addresses.iter().copied().collect();
                let mut ids = BTreeSet::new();
                self.snapshot
                    .scan_prefix(Cf::NfTokenTxs, &nf_id.to_be_bytes(), false, |key, _| {
                        let entry_id = read_u64(key, 8)?;
                        let address = Bytes32::from_slice(&key[16..48]).map(Address);
                        let to = to_flag(key, 48)?;
                        let address_ok = addresses.is_empty()
                            || address.is_some_and(|a| addresses.contains(&a));
                        if address_ok && direction_ok(to) {
                            ids.insert(entry_id);
                        }
                        Ok(true)
                    })?;
                Some(ids)
            }
            None => None,
        };

        Ok(match (by_address, by_token) {
            (Some(a), Some(t)) => a.intersection(&t).copied().collect(),
            (Some(ids), None) | (None, Some(ids)) => ids,
            (None, None) => BTreeSet::new(),
        })
    }

    fn tx_record(&self, record: EntryRecord, token_type: TokenType) -> Result<TxRecord> {
        let entry = decode_entry(&record)?;
        let transaction = Transaction::from_content(token_type, &entry.content).map_err(|e| {
            Error::Integrity(format!("stored valid entry {} is invalid: {}", record.hash, e))
        })?;
        Ok(TxRecord {
            entry_id: record.id,
            entry,
            transaction,
        })
    }

    /// Valid transaction by entry hash
    pub fn transaction(&self, hash: &Bytes32) -> Result<Option<TxRecord>> {
        let issuance = self.issued()?;
        let Some(id) = self.snapshot.valid_entry_id(hash)? else {
            return Ok(None);
        };
        if Some(id) == self.meta.issuance_entry_id {
            return Ok(None);
        }
        let record = self
            .snapshot
            .entry(id)?
            .ok_or_else(|| Error::Integrity(format!("missing entry {}", id)))?;
        self.tx_record(record, issuance.token_type).map(Some)
    }

    /// Raw entry by hash, valid or not
    pub fn entry(&self, hash: &Bytes32) -> Result<Option<(Entry, bool)>> {
        let Some(id) = self.snapshot.first_entry_id(hash)? else {
            return Ok(None);
        };
        match self.snapshot.entry(id)? {
            Some(record) => Ok(Some((decode_entry(&record)?, record.valid))),
            None => Err(Error::Integrity(format!("missing entry {}", id))),
        }
    }

    /// NFToken by ID
    pub fn nf_token(&self, id: NfTokenId) -> Result<Option<NfTokenInfo>> {
        Ok(self.snapshot.nf_token(id)?.map(|t| NfTokenInfo {
            id: t.id,
            owner: t.owner,
            creation_hash: t.creation_hash,
            metadata: t.metadata,
        }))
    }

    /// All minted NFTokens
    pub fn nf_tokens(&self, page: &Page) -> Result<Vec<NfTokenInfo>> {
        if self.issued()?.token_type != TokenType::Fat1 {
            return Err(Error::InvalidQuery("not a FAT-1 chain".to_string()));
        }
        self.scan_page(Cf::NfTokens, &[], page, |_, value| {
            let token: crate::storage::NfTokenRecord = bincode::deserialize(value)?;
            Ok(Some(NfTokenInfo {
                id: token.id,
                owner: token.owner,
                creation_hash: token.creation_hash,
                metadata: token.metadata,
            }))
        })
    }

    /// Decode one page of a prefix scan. Items mapped to `None` are skipped
    /// without counting toward the page.
    fn scan_page<T, F>(&self, cf: Cf, prefix: &[u8], page: &Page, mut decode: F) -> Result<Vec<T>>
    where
        F: FnMut(&[u8], &[u8]) -> Result<Option<T>>,
    {
        let offset = page.offset()?;
        let mut skipped = 0;
        let mut items = Vec::new();
        self.snapshot
            .scan_prefix(cf, prefix, page.reverse(), |key, value| {
                let Some(item) = decode(key, value)? else {
                    return Ok(true);
                };
                if skipped < offset {
                    skipped += 1;
                    return Ok(true);
                }
                items.push(item);
                Ok((items.len() as u64) < page.limit)
            })?;
        Ok(items)
    }
}

fn to_flag(key: &[u8], offset: usize) -> Result<bool> {
    key.get(offset)
        .map(|flag| *flag != 0)
        .ok_or_else(|| Error::Integrity(format!("key too short: {} bytes", key.len())))
}

fn decode_entry(record: &EntryRecord) -> Result<Entry> {
    let mut entry = Entry::unmarshal_binary(&record.data)?;
    entry.hash = Some(record.hash);
    entry.timestamp = record.timestamp;
    Ok(entry)
}
