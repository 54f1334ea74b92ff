//! FAT-0 fungible token transactions
//!
//! Content is a JSON object of the form
//! `{"inputs":{<address>:<amount>,...},"outputs":{...},"metadata":<any>}`.
//! Amounts are non-zero unsigned integers and the two sides must sum to the
//! same total.

use crate::crypto::coinbase;
use crate::error::{ValidationError, ValidationResult};
use crate::jsonlen::{compact, metadata_len, raw_some, uint64_len};
use crate::types::{Address, ADDRESS_STR_LEN};
use serde::{Deserialize, Serialize};
use serde_json::value::RawValue;
use std::collections::BTreeMap;

/// Mapping of address to a non-zero amount
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct AddressAmountMap(pub BTreeMap<Address, u64>);

impl AddressAmountMap {
    /// Decode a JSON object, rejecting non-canonical input
    pub fn from_json(data: &[u8]) -> ValidationResult<Self> {
        let raw: BTreeMap<String, u64> = serde_json::from_slice(data)?;
        if raw.is_empty() {
            return Err(ValidationError::Structural("AddressAmountMap: empty".to_string()));
        }

        let entry_len = r#""":,"#.len() + ADDRESS_STR_LEN;
        let mut expected_len = "{}".len() - ",".len() + raw.len() * entry_len;
        let mut map = BTreeMap::new();
        for (address, amount) in raw {
            let address: Address = address
                .parse()
                .map_err(|e| ValidationError::Structural(format!("AddressAmountMap: {}", e)))?;
            if amount == 0 {
                return Err(ValidationError::Structural(format!(
                    "AddressAmountMap: invalid amount (0): {}",
                    address
                )));
            }
            expected_len += uint64_len(amount);
            map.insert(address, amount);
        }

        if expected_len != compact(data).len() {
            return Err(ValidationError::UnexpectedLength);
        }
        Ok(Self(map))
    }

    /// Sum of all amounts, or `None` on overflow
    pub fn sum(&self) -> Option<u64> {
        self.0.values().try_fold(0u64, |acc, &amount| acc.checked_add(amount))
    }

    /// Amount held by `address`
    pub fn get(&self, address: &Address) -> Option<u64> {
        self.0.get(address).copied()
    }

    /// Number of addresses
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether the map is empty
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Address and amount pairs in address order
    pub fn iter(&self) -> impl Iterator<Item = (&Address, &u64)> {
        self.0.iter()
    }
}

impl FromIterator<(Address, u64)> for AddressAmountMap {
    fn from_iter<I: IntoIterator<Item = (Address, u64)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// FAT-0 transaction
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transaction {
    /// Spending addresses
    pub inputs: AddressAmountMap,

    /// Receiving addresses
    pub outputs: AddressAmountMap,

    /// Raw JSON metadata
    pub metadata: Option<String>,
}

#[derive(Deserialize)]
struct RawTransaction<'a> {
    #[serde(borrow)]
    inputs: &'a RawValue,
    #[serde(borrow)]
    outputs: &'a RawValue,
    #[serde(default, deserialize_with = "raw_some")]
    metadata: Option<String>,
}

#[derive(Serialize)]
struct TransactionJson<'a> {
    inputs: &'a AddressAmountMap,
    outputs: &'a AddressAmountMap,
    #[serde(skip_serializing_if = "Option::is_none")]
    metadata: Option<&'a RawValue>,
}

impl Transaction {
    /// Create a transaction without metadata
    pub fn new(inputs: AddressAmountMap, outputs: AddressAmountMap) -> Self {
        Self {
            inputs,
            outputs,
            metadata: None,
        }
    }

    /// Decode entry content, rejecting non-canonical JSON
    pub fn from_content(content: &[u8]) -> ValidationResult<Self> {
        let data = compact(content);
        let raw: RawTransaction<'_> = serde_json::from_slice(&data)?;

        let tx = Self {
            inputs: AddressAmountMap::from_json(raw.inputs.get().as_bytes())
                .map_err(|e| nested("inputs", e))?,
            outputs: AddressAmountMap::from_json(raw.outputs.get().as_bytes())
                .map_err(|e| nested("outputs", e))?,
            metadata: raw.metadata,
        };
        tx.valid_data()?;

        let expected_len = r#"{"inputs":,"outputs":}"#.len()
            + raw.inputs.get().len()
            + raw.outputs.get().len()
            + metadata_len(tx.metadata.as_deref());
        if expected_len != data.len() {
            return Err(ValidationError::UnexpectedLength);
        }
        Ok(tx)
    }

    /// Encode as entry content
    pub fn to_content(&self) -> ValidationResult<Vec<u8>> {
        self.valid_data()?;
        let metadata = match &self.metadata {
            Some(raw) => Some(serde_json::from_str::<&RawValue>(raw)?),
            None => None,
        };
        Ok(serde_json::to_vec(&TransactionJson {
            inputs: &self.inputs,
            outputs: &self.outputs,
            metadata,
        })?)
    }

    /// Whether the transaction mints new tokens
    pub fn is_coinbase(&self) -> bool {
        self.inputs.get(&coinbase()).is_some_and(|amount| amount != 0)
    }

    /// Check amounts and coinbase shape
    pub fn valid_data(&self) -> ValidationResult<()> {
        let sum_inputs = self.inputs.sum();
        if sum_inputs.is_none() || sum_inputs != self.outputs.sum() {
            return Err(ValidationError::Conservation(
                "sum(inputs) != sum(outputs)".to_string(),
            ));
        }
        if self.is_coinbase() && self.inputs.len() != 1 {
            return Err(ValidationError::Conservation(
                "invalid coinbase transaction".to_string(),
            ));
        }
        Ok(())
    }

    /// Total amount moved
    pub fn amount(&self) -> u64 {
        self.inputs.sum().unwrap_or(0)
    }
}

pub(crate) fn nested(field: &str, err: ValidationError) -> ValidationError {
    match err {
        ValidationError::Structural(msg) => ValidationError::Structural(format!("{}: {}", field, msg)),
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::KeyPair;

    fn address(seed: u8) -> Address {
        KeyPair::from_seed(&[seed; 32]).address()
    }

    fn content(inputs: &[(Address, u64)], outputs: &[(Address, u64)]) -> Vec<u8> {
        let tx = Transaction::new(
            inputs.iter().copied().collect(),
            outputs.iter().copied().collect(),
        );
        serde_json::to_vec(&TransactionJson {
            inputs: &tx.inputs,
            outputs: &tx.outputs,
            metadata: None,
        })
        .unwrap()
    }

    #[test]
    fn test_parse_valid() {
        let data = content(&[(address(1), 100)], &[(address(2), 60), (address(3), 40)]);
        let tx = Transaction::from_content(&data).unwrap();

        assert_eq!(tx.inputs.get(&address(1)), Some(100));
        assert_eq!(tx.outputs.len(), 2);
        assert_eq!(tx.amount(), 100);
        assert!(!tx.is_coinbase());
    }

    #[test]
    fn test_content_round_trip_with_metadata() {
        let mut tx = Transaction::new(
            [(address(1), 5)].into_iter().collect(),
            [(address(2), 5)].into_iter().collect(),
        );
        tx.metadata = Some(r#"{"memo":"rent"}"#.to_string());

        let data = tx.to_content().unwrap();
        assert_eq!(Transaction::from_content(&data).unwrap(), tx);
    }

    #[test]
    fn test_whitespace_is_ignored() {
        let a = address(1).to_string();
        let b = address(2).to_string();
        let data = format!(
            "{{ \"inputs\": {{ \"{}\": 7 }},\n \"outputs\": {{ \"{}\": 7 }} }}",
            a, b
        );
        assert!(Transaction::from_content(data.as_bytes()).is_ok());
    }

    #[test]
    fn test_sum_mismatch() {
        let data = content(&[(address(1), 100)], &[(address(2), 99)]);
        assert!(matches!(
            Transaction::from_content(&data),
            Err(ValidationError::Conservation(_))
        ));
    }

    #[test]
    fn test_sum_overflow() {
        let data = content(
            &[(address(1), u64::MAX), (address(2), 2)],
            &[(address(3), 1)],
        );
        assert!(matches!(
            Transaction::from_content(&data),
            Err(ValidationError::Conservation(_))
        ));
    }

    #[test]
    fn test_zero_amount() {
        let a = address(1).to_string();
        let b = address(2).to_string();
        let data = format!(r#"{{"inputs":{{"{}":0}},"outputs":{{"{}":0}}}}"#, a, b);
        assert!(matches!(
            Transaction::from_content(data.as_bytes()),
            Err(ValidationError::Structural(_))
        ));
    }

    #[test]
    fn test_duplicate_address_key() {
        let a = address(1).to_string();
        let b = address(2).to_string();
        let data = format!(
            r#"{{"inputs":{{"{a}":5,"{a}":5}},"outputs":{{"{b}":5}}}}"#,
            a = a,
            b = b
        );
        assert_eq!(
            Transaction::from_content(data.as_bytes()),
            Err(ValidationError::UnexpectedLength)
        );
    }

    #[test]
    fn test_unknown_field_and_trailing_data() {
        let a = address(1).to_string();
        let b = address(2).to_string();
        let extra = format!(
            r#"{{"inputs":{{"{}":5}},"outputs":{{"{}":5}},"x":1}}"#,
            a, b
        );
        assert_eq!(
            Transaction::from_content(extra.as_bytes()),
            Err(ValidationError::UnexpectedLength)
        );

        let mut trailing = content(&[(address(1), 5)], &[(address(2), 5)]);
        trailing.extend_from_slice(b"{}");
        assert!(Transaction::from_content(&trailing).is_err());
    }

    #[test]
    fn test_empty_and_invalid_maps() {
        let b = address(2).to_string();
        let empty = format!(r#"{{"inputs":{{}},"outputs":{{"{}":5}}}}"#, b);
        assert!(Transaction::from_content(empty.as_bytes()).is_err());

        let bad_address = format!(r#"{{"inputs":{{"FA123":5}},"outputs":{{"{}":5}}}}"#, b);
        assert!(Transaction::from_content(bad_address.as_bytes()).is_err());
    }

    #[test]
    fn test_coinbase() {
        let data = content(&[(coinbase(), 50)], &[(address(2), 50)]);
        let tx = Transaction::from_content(&data).unwrap();
        assert!(tx.is_coinbase());

        let data = content(&[(coinbase(), 50), (address(1), 1)], &[(address(2), 51)]);
        assert!(matches!(
            Transaction::from_content(&data),
            Err(ValidationError::Conservation(_))
        ));
    }

    #[test]
    fn test_null_metadata_is_counted() {
        let a = address(1).to_string();
        let b = address(2).to_string();
        let data = format!(
            r#"{{"inputs":{{"{}":5}},"outputs":{{"{}":5}},"metadata":null}}"#,
            a, b
        );
        let tx = Transaction::from_content(data.as_bytes()).unwrap();
        assert_eq!(tx.metadata.as_deref(), Some("null"));
    }
}
