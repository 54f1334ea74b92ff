//! Core types for the ledger
//!
//! All types are designed for:
//! - Deterministic serialization (bincode for storage, hex/base58 for JSON)
//! - Total ordering, so they can key ordered maps and RocksDB prefixes

use crate::crypto;
use chrono::{DateTime, Utc};
use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

/// 32-byte hash or identifier
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Bytes32(pub [u8; 32]);

/// Chain identifier
pub type ChainId = Bytes32;

impl Bytes32 {
    /// All-zero value
    pub const ZERO: Bytes32 = Bytes32([0u8; 32]);

    /// Copy from a slice of exactly 32 bytes
    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        let array: [u8; 32] = bytes.try_into().ok()?;
        Some(Self(array))
    }

    /// Get bytes
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Whether every byte is zero
    pub fn is_zero(&self) -> bool {
        self.0 == [0u8; 32]
    }
}

impl From<[u8; 32]> for Bytes32 {
    fn from(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }
}

impl AsRef<[u8]> for Bytes32 {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Display for Bytes32 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl FromStr for Bytes32 {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = hex::decode(s).map_err(|e| format!("invalid hex: {}", e))?;
        Self::from_slice(&bytes).ok_or_else(|| format!("expected 32 bytes, got {}", bytes.len()))
    }
}

impl Serialize for Bytes32 {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        if serializer.is_human_readable() {
            serializer.collect_str(self)
        } else {
            self.0.serialize(serializer)
        }
    }
}

impl<'de> Deserialize<'de> for Bytes32 {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        if deserializer.is_human_readable() {
            let s = String::deserialize(deserializer)?;
            s.parse().map_err(de::Error::custom)
        } else {
            <[u8; 32]>::deserialize(deserializer).map(Self)
        }
    }
}

/// Factoid address: the double SHA-256 of a redeem condition datum (RCD)
///
/// Displayed as a 52 character base58check string starting with "FA".
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Address(pub Bytes32);

/// Human-readable prefix of a Factoid address
pub const ADDRESS_PREFIX: [u8; 2] = [0x5f, 0xb1];

/// Length of the human-readable form of an address
pub const ADDRESS_STR_LEN: usize = 52;

impl Address {
    /// Address of an RCD
    pub fn from_rcd(rcd: &[u8]) -> Self {
        Self(crypto::sha256d(rcd))
    }

    /// Get the RCD hash bytes
    pub fn as_bytes(&self) -> &[u8; 32] {
        self.0.as_bytes()
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut payload = Vec::with_capacity(34);
        payload.extend_from_slice(&ADDRESS_PREFIX);
        payload.extend_from_slice(self.as_bytes());
        write!(f, "{}", bs58::encode(payload).with_check().into_string())
    }
}

impl FromStr for Address {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.len() != ADDRESS_STR_LEN {
            return Err(format!("invalid address length: {}", s.len()));
        }
        let payload = bs58::decode(s)
            .with_check(None)
            .into_vec()
            .map_err(|e| format!("invalid address: {}", e))?;
        if payload.len() != 34 || payload[..2] != ADDRESS_PREFIX {
            return Err("invalid address prefix".to_string());
        }
        Bytes32::from_slice(&payload[2..])
            .map(Self)
            .ok_or_else(|| "invalid address payload".to_string())
    }
}

impl Serialize for Address {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        if serializer.is_human_readable() {
            serializer.collect_str(self)
        } else {
            self.0.serialize(serializer)
        }
    }
}

impl<'de> Deserialize<'de> for Address {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        if deserializer.is_human_readable() {
            let s = String::deserialize(deserializer)?;
            s.parse().map_err(de::Error::custom)
        } else {
            Bytes32::deserialize(deserializer).map(Self)
        }
    }
}

/// Factom network identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NetworkId(pub [u8; 4]);

impl NetworkId {
    /// Factom mainnet
    pub const MAINNET: NetworkId = NetworkId([0xfa, 0x92, 0xe5, 0xa2]);
    /// Factom testnet
    pub const TESTNET: NetworkId = NetworkId([0x88, 0x3e, 0x09, 0x3b]);
    /// Local simulated network
    pub const LOCALNET: NetworkId = NetworkId([0xfa, 0x92, 0xe5, 0xa4]);
}

impl Default for NetworkId {
    fn default() -> Self {
        Self::MAINNET
    }
}

impl fmt::Display for NetworkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Self::MAINNET => write!(f, "mainnet"),
            Self::TESTNET => write!(f, "testnet"),
            Self::LOCALNET => write!(f, "localnet"),
            _ => write!(f, "custom:0x{}", hex::encode(self.0)),
        }
    }
}

impl FromStr for NetworkId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "mainnet" | "main" => Ok(Self::MAINNET),
            "testnet" | "test" => Ok(Self::TESTNET),
            "localnet" | "local" => Ok(Self::LOCALNET),
            _ => {
                let raw = s.strip_prefix("custom:").unwrap_or(s);
                let raw = raw.strip_prefix("0x").unwrap_or(raw);
                let bytes = hex::decode(raw).map_err(|e| format!("invalid network id: {}", e))?;
                let id: [u8; 4] = bytes
                    .try_into()
                    .map_err(|_| "network id must be 4 bytes".to_string())?;
                Ok(Self(id))
            }
        }
    }
}

impl Serialize for NetworkId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        if serializer.is_human_readable() {
            serializer.collect_str(self)
        } else {
            self.0.serialize(serializer)
        }
    }
}

impl<'de> Deserialize<'de> for NetworkId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        if deserializer.is_human_readable() {
            let s = String::deserialize(deserializer)?;
            s.parse().map_err(de::Error::custom)
        } else {
            <[u8; 4]>::deserialize(deserializer).map(Self)
        }
    }
}

/// Issuer identity as registered on its identity chain
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    /// Identity chain ID
    pub chain_id: ChainId,

    /// RCD hash of the identity's level 1 key
    pub id1_key: Bytes32,

    /// Time the key was established
    pub timestamp: DateTime<Utc>,

    /// Directory block height the key was established at
    pub height: u32,
}

impl Identity {
    /// Whether the key has been set
    pub fn is_populated(&self) -> bool {
        !self.id1_key.is_zero()
    }
}
