//! Multi-signer entry signatures
//!
//! A signed entry carries its signatures in its external IDs:
//!
//! ```text
//! [timestamp salt, RCD 0, sig 0, RCD 1, sig 1, ..., RCD n-1, sig n-1]
//! ```
//!
//! Signer `i` signs `SHA-512(decimal(i) || salt || chain ID || content)`.
//! The salt is a decimal Unix timestamp and the entry's own timestamp must
//! fall within twelve hours of it.

use crate::crypto::{parse_rcd, sha512, verify_signature, KeyPair, RCD_SIZE, SIGNATURE_SIZE};
use crate::entry::Entry;
use crate::error::{ValidationError, ValidationResult};
use crate::types::{Address, Bytes32};
use chrono::{DateTime, Duration, Utc};
use rand::Rng;
use std::collections::BTreeSet;

/// Maximum distance between the entry timestamp and its salt
pub const MAX_SALT_AGE_HOURS: i64 = 12;

/// Message signed by signer `index`
pub fn signing_message(index: usize, salt: &[u8], entry: &Entry) -> [u8; 64] {
    let index = index.to_string();
    let mut msg =
        Vec::with_capacity(index.len() + salt.len() + 32 + entry.content.len());
    msg.extend_from_slice(index.as_bytes());
    msg.extend_from_slice(salt);
    msg.extend_from_slice(entry.chain_id.as_bytes());
    msg.extend_from_slice(&entry.content);
    sha512(&msg)
}

/// Validate the signature set of an entry against the expected signers.
///
/// `expected` holds RCD hashes. Every expected signer must sign exactly
/// once and no other signer may appear.
pub fn validate(entry: &Entry, expected: &BTreeSet<Bytes32>) -> ValidationResult<()> {
    if expected.is_empty() || entry.ext_ids.len() != 2 * expected.len() + 1 {
        return Err(ValidationError::InvalidExtIds(format!(
            "expected {} ExtIDs, got {}",
            2 * expected.len() + 1,
            entry.ext_ids.len()
        )));
    }

    let salt = &entry.ext_ids[0];
    let salt_secs: i64 = std::str::from_utf8(salt)
        .ok()
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| ValidationError::InvalidExtIds("ExtIDs[0]: invalid timestamp salt".into()))?;
    let salt_time = DateTime::from_timestamp(salt_secs, 0)
        .ok_or_else(|| ValidationError::InvalidExtIds("ExtIDs[0]: timestamp out of range".into()))?;
    let diff = entry.timestamp - salt_time;
    let max_age = Duration::hours(MAX_SALT_AGE_HOURS);
    if diff < -max_age || diff > max_age {
        return Err(ValidationError::ExpiredTimestamp);
    }

    let mut remaining = expected.clone();
    for (index, pair) in entry.ext_ids[1..].chunks_exact(2).enumerate() {
        let (rcd, sig) = (&pair[0], &pair[1]);
        let ext_id_index = 1 + 2 * index;

        let public_key = parse_rcd(rcd).ok_or_else(|| {
            ValidationError::InvalidExtIds(format!(
                "ExtIDs[{}]: invalid RCD, expected {} bytes of type 1",
                ext_id_index, RCD_SIZE
            ))
        })?;
        if !remaining.remove(&Address::from_rcd(rcd).0) {
            return Err(ValidationError::UnauthorizedSigner(format!(
                "ExtIDs[{}]: unexpected or duplicate RCD hash",
                ext_id_index
            )));
        }
        if sig.len() != SIGNATURE_SIZE {
            return Err(ValidationError::InvalidExtIds(format!(
                "ExtIDs[{}]: invalid signature size",
                ext_id_index + 1
            )));
        }

        let msg = signing_message(index, salt, entry);
        if !verify_signature(&msg, sig, &public_key) {
            return Err(ValidationError::InvalidSignature { index });
        }
    }

    Ok(())
}

/// Address of signer `index`, if present
pub fn signer_address(entry: &Entry, index: usize) -> Option<Address> {
    entry.ext_ids.get(2 * index + 1).map(|rcd| Address::from_rcd(rcd))
}

/// Number of RCD/signature pairs
pub fn signer_count(entry: &Entry) -> usize {
    entry.ext_ids.len().saturating_sub(1) / 2
}

/// Sign an entry with a salt chosen from the hour before `now`.
///
/// The entry's timestamp is set to `now` and its external IDs are replaced.
pub fn sign_entry(entry: Entry, signers: &[&KeyPair], now: DateTime<Utc>) -> Entry {
    let offset = rand::thread_rng().gen_range(0..3600);
    sign_entry_with_salt(entry, signers, now, now.timestamp() - offset)
}

/// Sign an entry with an explicit timestamp salt
pub fn sign_entry_with_salt(
    mut entry: Entry,
    signers: &[&KeyPair],
    now: DateTime<Utc>,
    salt_secs: i64,
) -> Entry {
    let salt = salt_secs.to_string().into_bytes();

    entry.timestamp = now;
    entry.hash = None;
    entry.ext_ids = Vec::with_capacity(2 * signers.len() + 1);
    entry.ext_ids.push(salt.clone());
    for (index, signer) in signers.iter().enumerate() {
        let msg = signing_message(index, &salt, &entry);
        entry.ext_ids.push(signer.rcd().to_vec());
        entry.ext_ids.push(signer.sign(&msg).to_vec());
    }
    entry
}
