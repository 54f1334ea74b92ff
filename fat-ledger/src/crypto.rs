//! Keys, redeem conditions and Factom hashing
//!
//! - Ed25519 key pairs and their type 1 redeem condition datum (RCD)
//! - SHA-256, double SHA-256 and SHA-512 digests used by Factom
//! - The Factom Merkle root used for entry block bodies

use crate::types::{Address, Bytes32};
use ed25519_dalek::{Signature as DalekSignature, Signer, SigningKey, Verifier, VerifyingKey};
use sha2::{Digest, Sha256, Sha512};
use std::sync::OnceLock;

/// RCD type tag for a single ed25519 public key
pub const RCD_TYPE_1: u8 = 0x01;

/// Size of a type 1 RCD: tag plus public key
pub const RCD_SIZE: usize = 1 + 32;

/// Size of an ed25519 signature
pub const SIGNATURE_SIZE: usize = 64;

/// Ed25519 key pair for signing
#[derive(Debug, Clone)]
pub struct KeyPair {
    signing_key: SigningKey,
    verifying_key: VerifyingKey,
}

impl KeyPair {
    /// Generate a new random key pair
    pub fn generate() -> Self {
        Self::from_seed(&rand::random::<[u8; 32]>())
    }

    /// Create from seed (32 bytes) - deterministic generation
    pub fn from_seed(seed: &[u8; 32]) -> Self {
        let signing_key = SigningKey::from_bytes(seed);
        let verifying_key = signing_key.verifying_key();

        Self {
            signing_key,
            verifying_key,
        }
    }

    /// Get public key bytes
    pub fn public_key(&self) -> [u8; 32] {
        self.verifying_key.to_bytes()
    }

    /// Type 1 RCD wrapping the public key
    pub fn rcd(&self) -> [u8; RCD_SIZE] {
        let mut rcd = [0u8; RCD_SIZE];
        rcd[0] = RCD_TYPE_1;
        rcd[1..].copy_from_slice(&self.public_key());
        rcd
    }

    /// Address controlled by this key
    pub fn address(&self) -> Address {
        Address::from_rcd(&self.rcd())
    }

    /// RCD hash, used as an identity key
    pub fn rcd_hash(&self) -> Bytes32 {
        sha256d(&self.rcd())
    }

    /// Sign a message
    pub fn sign(&self, message: &[u8]) -> [u8; SIGNATURE_SIZE] {
        self.signing_key.sign(message).to_bytes()
    }
}

/// Extract the public key from a type 1 RCD
pub fn parse_rcd(rcd: &[u8]) -> Option<[u8; 32]> {
    if rcd.len() != RCD_SIZE || rcd[0] != RCD_TYPE_1 {
        return None;
    }
    rcd[1..].try_into().ok()
}

/// Verify a signature with a public key
pub fn verify_signature(message: &[u8], signature: &[u8], public_key: &[u8; 32]) -> bool {
    let signature: [u8; SIGNATURE_SIZE] = match signature.try_into() {
        Ok(bytes) => bytes,
        Err(_) => return false,
    };
    let dalek_sig = DalekSignature::from_bytes(&signature);

    let verifying_key = match VerifyingKey::from_bytes(public_key) {
        Ok(key) => key,
        Err(_) => return false,
    };

    verifying_key.verify(message, &dalek_sig).is_ok()
}

/// Address of the all-zero private key.
///
/// Inputs from this address mint new tokens. Outputs to it burn them.
pub fn coinbase() -> Address {
    static COINBASE: OnceLock<Address> = OnceLock::new();
    *COINBASE.get_or_init(|| KeyPair::from_seed(&[0u8; 32]).address())
}

/// SHA-256 digest
pub fn sha256(data: &[u8]) -> Bytes32 {
    let mut hasher = Sha256::new();
    hasher.update(data);
    Bytes32(hasher.finalize().into())
}

/// Double SHA-256 digest
pub fn sha256d(data: &[u8]) -> Bytes32 {
    sha256(sha256(data).as_bytes())
}

/// SHA-512 digest
pub fn sha512(data: &[u8]) -> [u8; 64] {
    let mut hasher = Sha512::new();
    hasher.update(data);
    hasher.finalize().into()
}

/// Create a Merkle root from leaf hashes
///
/// Leaves are used as-is. If a level has odd length, the last hash is
/// paired with itself.
pub fn merkle_root(leaves: &[Bytes32]) -> Bytes32 {
    if leaves.is_empty() {
        return Bytes32::ZERO;
    }

    let mut current_level: Vec<Bytes32> = leaves.to_vec();

    while current_level.len() > 1 {
        current_level = current_level
            .chunks(2)
            .map(|pair| {
                let left = &pair[0];
                let right = pair.get(1).unwrap_or(left);
                let mut hasher = Sha256::new();
                hasher.update(left.as_bytes());
                hasher.update(right.as_bytes());
                Bytes32(hasher.finalize().into())
            })
            .collect();
    }

    current_level[0]
}
