//! Factom entry blocks
//!
//! # Binary layout
//!
//! Header (140 bytes):
//!
//! ```text
//! [chain ID (32)] [body MR (32)] [prev KeyMR (32)] [prev full hash (32)]
//! [sequence (u32 BE)] [DB height (u32 BE)] [object count (u32 BE)]
//! ```
//!
//! Body: `object count` 32-byte objects. Each object is either an entry hash
//! or a minute marker. A marker closes the group of entry hashes committed
//! in that minute and is encoded as a 32-byte big-endian integer no larger
//! than 10.

use crate::crypto::{merkle_root, sha256};
use crate::entry::Entry;
use crate::error::{Error, Result};
use crate::types::{Bytes32, ChainId};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// Length of the entry block header
pub const EBLOCK_HEADER_LEN: usize = 32 * 4 + 4 * 3;

/// Length of one body object
pub const EBLOCK_OBJECT_LEN: usize = 32;

/// Largest minute marker value
pub const MAX_MINUTE: u8 = 10;

/// Ordered, hash-linked batch of entries for one chain
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryBlock {
    /// Chain the block belongs to
    pub chain_id: ChainId,

    /// Key Merkle root identifying this block
    pub key_mr: Bytes32,

    /// KeyMR of the previous block, zero for the first block
    pub prev_key_mr: Bytes32,

    /// Full hash of the previous block, zero for the first block
    pub prev_full_hash: Bytes32,

    /// Merkle root of the body objects
    pub body_mr: Bytes32,

    /// Position in the chain, starting at 0
    pub sequence: u32,

    /// Directory block height
    pub height: u32,

    /// Directory block timestamp
    pub timestamp: DateTime<Utc>,

    /// Entries in commit order
    pub entries: Vec<Entry>,
}

impl EntryBlock {
    /// Seal a block from its entries.
    ///
    /// Entry hashes are computed where absent and every entry takes the
    /// block's chain ID. Entry timestamps must fall within ten minutes
    /// after `timestamp` and be non-decreasing.
    pub fn build(
        chain_id: ChainId,
        sequence: u32,
        height: u32,
        timestamp: DateTime<Utc>,
        prev: Option<&EntryBlock>,
        mut entries: Vec<Entry>,
    ) -> Result<Self> {
        for entry in &mut entries {
            entry.chain_id = chain_id;
            entry.seal()?;
        }

        let (prev_key_mr, prev_full_hash) = match prev {
            Some(prev) => (prev.key_mr, prev.full_hash()?),
            None => (Bytes32::ZERO, Bytes32::ZERO),
        };

        let mut block = Self {
            chain_id,
            key_mr: Bytes32::ZERO,
            prev_key_mr,
            prev_full_hash,
            body_mr: Bytes32::ZERO,
            sequence,
            height,
            timestamp,
            entries,
        };
        block.body_mr = block.compute_body_mr()?;
        block.key_mr = block.compute_key_mr()?;

        Ok(block)
    }

    /// Whether this is the first block of its chain
    pub fn is_first(&self) -> bool {
        self.sequence == 0 && self.prev_key_mr.is_zero()
    }

    /// Body objects: entry hashes followed by minute markers
    pub fn objects(&self) -> Result<Vec<Bytes32>> {
        if self.entries.is_empty() {
            return Err(Error::MalformedBlock("no entries".to_string()));
        }

        let mut objects = Vec::with_capacity(self.entries.len() + 1);
        let mut last_minute = self.minute_of(&self.entries[0])?;
        for entry in &self.entries {
            let minute = self.minute_of(entry)?;
            if minute < last_minute {
                return Err(Error::MalformedBlock(
                    "entry timestamps out of order".to_string(),
                ));
            }
            if minute > last_minute {
                objects.push(minute_marker(last_minute));
                last_minute = minute;
            }
            objects.push(entry.hash()?);
        }
        objects.push(minute_marker(last_minute));

        Ok(objects)
    }

    fn minute_of(&self, entry: &Entry) -> Result<u8> {
        let minutes = (entry.timestamp - self.timestamp).num_minutes();
        if !(0..=MAX_MINUTE as i64).contains(&minutes) {
            return Err(Error::MalformedBlock(format!(
                "entry timestamp {} outside block minutes",
                entry.timestamp
            )));
        }
        Ok(minutes as u8)
    }

    /// Header bytes for the given object count
    fn marshal_header(&self, object_count: u32) -> Vec<u8> {
        let mut data = Vec::with_capacity(EBLOCK_HEADER_LEN);
        data.extend_from_slice(self.chain_id.as_bytes());
        data.extend_from_slice(self.body_mr.as_bytes());
        data.extend_from_slice(self.prev_key_mr.as_bytes());
        data.extend_from_slice(self.prev_full_hash.as_bytes());
        data.extend_from_slice(&self.sequence.to_be_bytes());
        data.extend_from_slice(&self.height.to_be_bytes());
        data.extend_from_slice(&object_count.to_be_bytes());
        data
    }

    /// Encode the header and body
    pub fn marshal_binary(&self) -> Result<Vec<u8>> {
        let objects = self.objects()?;
        let mut data = self.marshal_header(object_count(&objects)?);
        data.reserve(objects.len() * EBLOCK_OBJECT_LEN);
        for object in &objects {
            data.extend_from_slice(object.as_bytes());
        }
        Ok(data)
    }

    /// Decode a block.
    ///
    /// The directory block timestamp is not part of the encoding and must be
    /// supplied. Entries carry only their hash and timestamp; the KeyMR is
    /// recomputed from the data.
    pub fn unmarshal_binary(data: &[u8], timestamp: DateTime<Utc>) -> Result<Self> {
        if data.len() < EBLOCK_HEADER_LEN + 2 * EBLOCK_OBJECT_LEN {
            return Err(Error::MalformedBlock(format!(
                "insufficient length: {} bytes",
                data.len()
            )));
        }

        let read32 = |i: usize| Bytes32::from_slice(&data[i..i + 32]).unwrap_or_default();
        let read_u32 = |i: usize| u32::from_be_bytes([data[i], data[i + 1], data[i + 2], data[i + 3]]);

        let chain_id = read32(0);
        let body_mr = read32(32);
        let prev_key_mr = read32(64);
        let prev_full_hash = read32(96);
        let sequence = read_u32(128);
        let height = read_u32(132);
        let object_count = read_u32(136) as usize;

        let body = &data[EBLOCK_HEADER_LEN..];
        if body.len() != object_count * EBLOCK_OBJECT_LEN {
            return Err(Error::MalformedBlock(format!(
                "body length {} does not match {} objects",
                body.len(),
                object_count
            )));
        }

        let objects: Vec<Bytes32> = body
            .chunks_exact(EBLOCK_OBJECT_LEN)
            .filter_map(Bytes32::from_slice)
            .collect();
        if !objects.last().is_some_and(is_minute_marker) {
            return Err(Error::MalformedBlock("missing final minute marker".to_string()));
        }

        let mut entries = Vec::with_capacity(objects.len());
        let mut pending: Vec<Bytes32> = Vec::new();
        for object in &objects {
            if is_minute_marker(object) {
                let ts = timestamp + Duration::minutes(object.0[31] as i64);
                for hash in pending.drain(..) {
                    entries.push(Entry {
                        hash: Some(hash),
                        timestamp: ts,
                        chain_id,
                        ext_ids: Vec::new(),
                        content: Vec::new(),
                    });
                }
            } else {
                pending.push(*object);
            }
        }

        let block = Self {
            chain_id,
            key_mr: Bytes32::ZERO,
            prev_key_mr,
            prev_full_hash,
            body_mr,
            sequence,
            height,
            timestamp,
            entries,
        };
        let key_mr = block.compute_key_mr_with(&objects)?;

        Ok(Self { key_mr, ..block })
    }

    /// Merkle root of the body objects
    pub fn compute_body_mr(&self) -> Result<Bytes32> {
        Ok(merkle_root(&self.objects()?))
    }

    /// KeyMR: `SHA-256(SHA-256(header) || body MR)`
    pub fn compute_key_mr(&self) -> Result<Bytes32> {
        let objects = self.objects()?;
        self.compute_key_mr_with(&objects)
    }

    fn compute_key_mr_with(&self, objects: &[Bytes32]) -> Result<Bytes32> {
        let header_hash = sha256(&self.marshal_header(object_count(objects)?));
        let body_mr = merkle_root(objects);

        let mut data = Vec::with_capacity(64);
        data.extend_from_slice(header_hash.as_bytes());
        data.extend_from_slice(body_mr.as_bytes());
        Ok(sha256(&data))
    }

    /// SHA-256 of the full encoded block
    pub fn full_hash(&self) -> Result<Bytes32> {
        Ok(sha256(&self.marshal_binary()?))
    }

    /// Check that the stored hashes match the block contents
    pub fn verify_hashes(&self) -> Result<()> {
        let objects = self.objects()?;
        let body_mr = merkle_root(&objects);
        if body_mr != self.body_mr {
            return Err(Error::Integrity(format!(
                "body MR mismatch: expected {}, computed {}",
                self.body_mr, body_mr
            )));
        }
        let key_mr = self.compute_key_mr_with(&objects)?;
        if key_mr != self.key_mr {
            return Err(Error::Integrity(format!(
                "KeyMR mismatch: expected {}, computed {}",
                self.key_mr, key_mr
            )));
        }
        Ok(())
    }
}

fn object_count(objects: &[Bytes32]) -> Result<u32> {
    u32::try_from(objects.len())
        .map_err(|_| Error::MalformedBlock(format!("too many objects: {}", objects.len())))
}

/// Minute marker object for a minute offset
pub fn minute_marker(minute: u8) -> Bytes32 {
    let mut marker = [0u8; 32];
    marker[31] = minute;
    Bytes32(marker)
}

/// Whether an object is a minute marker rather than an entry hash
pub fn is_minute_marker(object: &Bytes32) -> bool {
    *object <= minute_marker(MAX_MINUTE)
}
