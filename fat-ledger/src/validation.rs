//! Stateless entry validation
//!
//! Validation decodes an entry's content and checks its signature set. It
//! never touches storage: balances, ownership, supply and replay are
//! checked when the entry is applied.

use crate::entry::Entry;
use crate::error::ValidationResult;
use crate::issuance::{Issuance, TokenType};
use crate::signature;
use crate::types::{Address, Bytes32};
use crate::{fat0, fat1};
use std::collections::BTreeSet;

/// Behaviour shared by FAT-0 and FAT-1 transactions
pub trait TokenTransaction {
    /// Whether the transaction mints tokens from the coinbase address
    fn is_coinbase(&self) -> bool;

    /// Addresses spending tokens
    fn input_addresses(&self) -> Vec<Address>;

    /// Addresses receiving tokens
    fn output_addresses(&self) -> Vec<Address>;

    /// Raw JSON metadata
    fn metadata(&self) -> Option<&str>;

    /// Check internal consistency without any ledger state
    fn valid_data(&self) -> ValidationResult<()>;

    /// RCD hashes that must sign the entry
    fn expected_signers(&self, id_key: &Bytes32) -> BTreeSet<Bytes32> {
        if self.is_coinbase() {
            BTreeSet::from([*id_key])
        } else {
            self.input_addresses().into_iter().map(|a| a.0).collect()
        }
    }
}

impl TokenTransaction for fat0::Transaction {
    fn is_coinbase(&self) -> bool {
        fat0::Transaction::is_coinbase(self)
    }

    fn input_addresses(&self) -> Vec<Address> {
        self.inputs.iter().map(|(a, _)| *a).collect()
    }

    fn output_addresses(&self) -> Vec<Address> {
        self.outputs.iter().map(|(a, _)| *a).collect()
    }

    fn metadata(&self) -> Option<&str> {
        self.metadata.as_deref()
    }

    fn valid_data(&self) -> ValidationResult<()> {
        fat0::Transaction::valid_data(self)
    }
}

impl TokenTransaction for fat1::Transaction {
    fn is_coinbase(&self) -> bool {
        fat1::Transaction::is_coinbase(self)
    }

    fn input_addresses(&self) -> Vec<Address> {
        self.inputs.iter().map(|(a, _)| *a).collect()
    }

    fn output_addresses(&self) -> Vec<Address> {
        self.outputs.iter().map(|(a, _)| *a).collect()
    }

    fn metadata(&self) -> Option<&str> {
        self.metadata.as_deref()
    }

    fn valid_data(&self) -> ValidationResult<()> {
        fat1::Transaction::valid_data(self)
    }
}

/// Transaction of either token standard
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transaction {
    /// Fungible transfer or mint
    Fat0(fat0::Transaction),
    /// Non-fungible transfer or mint
    Fat1(fat1::Transaction),
}

impl Transaction {
    /// Decode content according to the chain's token type
    pub fn from_content(token_type: TokenType, content: &[u8]) -> ValidationResult<Self> {
        match token_type {
            TokenType::Fat0 => fat0::Transaction::from_content(content).map(Transaction::Fat0),
            TokenType::Fat1 => fat1::Transaction::from_content(content).map(Transaction::Fat1),
        }
    }

    /// Encode as entry content
    pub fn to_content(&self) -> ValidationResult<Vec<u8>> {
        match self {
            Transaction::Fat0(tx) => tx.to_content(),
            Transaction::Fat1(tx) => tx.to_content(),
        }
    }

    /// Token standard of the transaction
    pub fn token_type(&self) -> TokenType {
        match self {
            Transaction::Fat0(_) => TokenType::Fat0,
            Transaction::Fat1(_) => TokenType::Fat1,
        }
    }

    fn inner(&self) -> &dyn TokenTransaction {
        match self {
            Transaction::Fat0(tx) => tx,
            Transaction::Fat1(tx) => tx,
        }
    }
}

impl TokenTransaction for Transaction {
    fn is_coinbase(&self) -> bool {
        self.inner().is_coinbase()
    }

    fn input_addresses(&self) -> Vec<Address> {
        self.inner().input_addresses()
    }

    fn output_addresses(&self) -> Vec<Address> {
        self.inner().output_addresses()
    }

    fn metadata(&self) -> Option<&str> {
        self.inner().metadata()
    }

    fn valid_data(&self) -> ValidationResult<()> {
        self.inner().valid_data()
    }
}

/// Validate an issuance entry signed by the issuer's level 1 key
pub fn validate_issuance(entry: &Entry, id_key: &Bytes32) -> ValidationResult<Issuance> {
    let issuance = Issuance::from_content(&entry.content)?;
    signature::validate(entry, &BTreeSet::from([*id_key]))?;
    Ok(issuance)
}

/// Validate a transaction entry.
///
/// Coinbase transactions must be signed by the issuer's level 1 key. All
/// others must be signed by every input address and nobody else.
pub fn validate_transaction(
    entry: &Entry,
    token_type: TokenType,
    id_key: &Bytes32,
) -> ValidationResult<Transaction> {
    let tx = Transaction::from_content(token_type, &entry.content)?;
    signature::validate(entry, &tx.expected_signers(id_key))?;
    Ok(tx)
}
