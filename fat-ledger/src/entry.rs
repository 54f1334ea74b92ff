//! Canonical Factom entry codec
//!
//! # Binary layout
//!
//! ```text
//! [version 0x00 (1)] [chain ID (32)] [ExtIDs total len (u16 BE)]
//! [ExtID len (u16 BE)] [ExtID bytes] ...
//! [content ...]
//! ```
//!
//! The entry hash is `SHA-256(SHA-512(data) || data)` over the layout above.

use crate::crypto::{sha256, sha512};
use crate::error::{Error, Result};
use crate::types::{Bytes32, ChainId, Identity};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Entry version byte
pub const ENTRY_VERSION: u8 = 0x00;

/// Version, chain ID and ExtIDs length prefix
pub const ENTRY_HEADER_LEN: usize = 1 + 32 + 2;

/// Immutable unit of chain data
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entry {
    /// Announced or computed entry hash
    pub hash: Option<Bytes32>,

    /// Commit time, minute resolution from the containing block
    pub timestamp: DateTime<Utc>,

    /// Chain the entry belongs to
    pub chain_id: ChainId,

    /// External IDs
    pub ext_ids: Vec<Vec<u8>>,

    /// Content
    #[serde(with = "serde_bytes")]
    pub content: Vec<u8>,
}

impl Entry {
    /// Create an entry without a hash
    pub fn new(
        chain_id: ChainId,
        ext_ids: Vec<Vec<u8>>,
        content: Vec<u8>,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            hash: None,
            timestamp,
            chain_id,
            ext_ids,
            content,
        }
    }

    /// Encode to the canonical binary layout
    pub fn marshal_binary(&self) -> Result<Vec<u8>> {
        let mut ext_ids_len: usize = 0;
        for ext_id in &self.ext_ids {
            if ext_id.len() > u16::MAX as usize {
                return Err(Error::MalformedEntry(format!(
                    "ExtID too long: {} bytes",
                    ext_id.len()
                )));
            }
            ext_ids_len += 2 + ext_id.len();
        }
        let ext_ids_len = u16::try_from(ext_ids_len).map_err(|_| {
            Error::MalformedEntry(format!("ExtIDs too long: {} bytes", ext_ids_len))
        })?;

        let mut data =
            Vec::with_capacity(ENTRY_HEADER_LEN + ext_ids_len as usize + self.content.len());
        data.push(ENTRY_VERSION);
        data.extend_from_slice(self.chain_id.as_bytes());
        data.extend_from_slice(&ext_ids_len.to_be_bytes());
        for ext_id in &self.ext_ids {
            data.extend_from_slice(&(ext_id.len() as u16).to_be_bytes());
            data.extend_from_slice(ext_id);
        }
        data.extend_from_slice(&self.content);

        Ok(data)
    }

    /// Decode from the canonical binary layout
    ///
    /// The hash is computed from `data`. The timestamp is left at the Unix
    /// epoch and should be set from the containing block.
    pub fn unmarshal_binary(data: &[u8]) -> Result<Self> {
        if data.len() < ENTRY_HEADER_LEN {
            return Err(Error::MalformedEntry(format!(
                "insufficient length: {} bytes",
                data.len()
            )));
        }
        if data[0] != ENTRY_VERSION {
            return Err(Error::MalformedEntry(format!(
                "invalid version byte: {:#04x}",
                data[0]
            )));
        }

        let chain_id = Bytes32::from_slice(&data[1..33])
            .ok_or_else(|| Error::MalformedEntry("invalid chain ID".to_string()))?;
        let ext_ids_len = u16::from_be_bytes([data[33], data[34]]) as usize;
        let ext_ids_end = ENTRY_HEADER_LEN + ext_ids_len;
        if ext_ids_end > data.len() {
            return Err(Error::MalformedEntry(format!(
                "ExtIDs length {} exceeds entry",
                ext_ids_len
            )));
        }

        let mut ext_ids = Vec::new();
        let mut i = ENTRY_HEADER_LEN;
        while i < ext_ids_end {
            if i + 2 > ext_ids_end {
                return Err(Error::MalformedEntry("truncated ExtID length".to_string()));
            }
            let len = u16::from_be_bytes([data[i], data[i + 1]]) as usize;
            i += 2;
            if i + len > ext_ids_end {
                return Err(Error::MalformedEntry(format!(
                    "ExtID length {} overruns ExtIDs",
                    len
                )));
            }
            ext_ids.push(data[i..i + len].to_vec());
            i += len;
        }

        Ok(Self {
            hash: Some(compute_hash(data)),
            timestamp: DateTime::UNIX_EPOCH,
            chain_id,
            ext_ids,
            content: data[ext_ids_end..].to_vec(),
        })
    }

    /// Compute the entry hash from the encoded entry
    pub fn compute_hash(&self) -> Result<Bytes32> {
        Ok(compute_hash(&self.marshal_binary()?))
    }

    /// Set the hash to the computed value and return it
    pub fn seal(&mut self) -> Result<Bytes32> {
        let hash = self.compute_hash()?;
        self.hash = Some(hash);
        Ok(hash)
    }

    /// Announced hash, or the computed one when absent
    pub fn hash(&self) -> Result<Bytes32> {
        match self.hash {
            Some(hash) => Ok(hash),
            None => self.compute_hash(),
        }
    }
}

/// Hash encoded entry bytes
pub fn compute_hash(data: &[u8]) -> Bytes32 {
    let mut preimage = Vec::with_capacity(64 + data.len());
    preimage.extend_from_slice(&sha512(data));
    preimage.extend_from_slice(data);
    sha256(&preimage)
}

/// Chain ID derived from the name IDs of a chain's first entry
pub fn compute_chain_id<T: AsRef<[u8]>>(name_ids: &[T]) -> ChainId {
    let mut hasher = Sha256::new();
    for name_id in name_ids {
        hasher.update(sha256(name_id.as_ref()).as_bytes());
    }
    Bytes32(hasher.finalize().into())
}

/// Name IDs of a token chain
pub fn token_name_ids(token_id: &str, issuer_chain_id: &ChainId) -> Vec<Vec<u8>> {
    vec![
        b"token".to_vec(),
        token_id.as_bytes().to_vec(),
        b"issuer".to_vec(),
        issuer_chain_id.as_bytes().to_vec(),
    ]
}

/// Chain ID of a token issued by an identity
pub fn token_chain_id(token_id: &str, issuer_chain_id: &ChainId) -> ChainId {
    compute_chain_id(&token_name_ids(token_id, issuer_chain_id))
}

/// Whether bytes have the shape of an identity chain ID
pub fn valid_identity_chain_id(chain_id: &[u8]) -> bool {
    chain_id.len() == 32 && chain_id[..3] == [0x88, 0x88, 0x88]
}

/// Whether name IDs describe a token chain
pub fn valid_token_name_ids<T: AsRef<[u8]>>(name_ids: &[T]) -> bool {
    name_ids.len() == 4
        && name_ids[0].as_ref() == b"token"
        && !name_ids[1].as_ref().is_empty()
        && std::str::from_utf8(name_ids[1].as_ref()).is_ok()
        && name_ids[2].as_ref() == b"issuer"
        && valid_identity_chain_id(name_ids[3].as_ref())
}

/// Extract the token ID and issuer chain ID from token chain name IDs
pub fn token_issuer<T: AsRef<[u8]>>(name_ids: &[T]) -> Option<(String, ChainId)> {
    if !valid_token_name_ids(name_ids) {
        return None;
    }
    let token_id = std::str::from_utf8(name_ids[1].as_ref()).ok()?.to_string();
    let issuer = Bytes32::from_slice(name_ids[3].as_ref())?;
    Some((token_id, issuer))
}

/// Whether name IDs describe an identity chain
pub fn valid_identity_name_ids<T: AsRef<[u8]>>(name_ids: &[T]) -> bool {
    name_ids.len() == 7
        && name_ids[0].as_ref() == [0x00]
        && name_ids[1].as_ref() == b"Identity Chain"
        && name_ids[2..6].iter().all(|key| key.as_ref().len() == 32)
}

/// Parse an identity from the first entry of its chain
///
/// Returns `None` when the entry is not an identity chain creation entry.
pub fn parse_identity(first: &Entry, height: u32) -> Option<Identity> {
    if !valid_identity_chain_id(first.chain_id.as_bytes())
        || !valid_identity_name_ids(&first.ext_ids)
    {
        return None;
    }
    Some(Identity {
        chain_id: first.chain_id,
        id1_key: Bytes32::from_slice(&first.ext_ids[2])?,
        timestamp: first.timestamp,
        height,
    })
}
