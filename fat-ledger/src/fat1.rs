//! FAT-1 non-fungible token transactions
//!
//! Content is a JSON object of the form
//! `{"inputs":{<address>:<NFTokens>,...},"outputs":{...},"tokenmetadata":[...],"metadata":<any>}`.
//! Every token ID spent on the input side must be received on the output
//! side. `tokenmetadata` is only allowed on coinbase transactions and
//! attaches metadata to newly minted IDs.

use crate::crypto::coinbase;
use crate::error::{ValidationError, ValidationResult};
use crate::fat0::nested;
use crate::jsonlen::{compact, metadata_len, raw_some};
use crate::nftokens::{NfTokenId, NfTokens, MAX_CAPACITY};
use crate::types::{Address, ADDRESS_STR_LEN};
use serde::ser::Error as _;
use serde::{Deserialize, Serialize, Serializer};
use serde_json::value::RawValue;
use std::collections::BTreeMap;

/// Mapping of address to the token IDs it spends or receives
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct AddressNfTokensMap(pub BTreeMap<Address, NfTokens>);

impl AddressNfTokensMap {
    /// Decode a JSON object, rejecting non-canonical input
    pub fn from_json(data: &[u8]) -> ValidationResult<Self> {
        let raw: BTreeMap<String, Box<RawValue>> = serde_json::from_slice(data)?;
        if raw.is_empty() {
            return Err(ValidationError::Structural("AddressNFTokensMap: empty".to_string()));
        }

        let entry_len = r#""":,"#.len() + ADDRESS_STR_LEN;
        let mut expected_len = "{}".len() - ",".len() + raw.len() * entry_len;
        let mut map = Self::default();
        let mut num_ids = 0usize;
        for (address, tokens) in raw {
            let address: Address = address
                .parse()
                .map_err(|e| ValidationError::Structural(format!("AddressNFTokensMap: {}", e)))?;
            let tokens_json = compact(tokens.get().as_bytes());
            let tokens = NfTokens::from_json(&tokens_json)?;

            num_ids += tokens.len();
            if num_ids > MAX_CAPACITY {
                return Err(ValidationError::CapacityExceeded);
            }
            for existing in map.0.values() {
                existing.no_intersection(&tokens)?;
            }

            expected_len += tokens_json.len();
            map.0.insert(address, tokens);
        }

        if expected_len != compact(data).len() {
            return Err(ValidationError::UnexpectedLength);
        }
        Ok(map)
    }

    /// Token IDs held under `address`
    pub fn get(&self, address: &Address) -> Option<&NfTokens> {
        self.0.get(address)
    }

    /// Number of addresses
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether the map is empty
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Address and token set pairs in address order
    pub fn iter(&self) -> impl Iterator<Item = (&Address, &NfTokens)> {
        self.0.iter()
    }

    /// Total number of token IDs across all addresses
    pub fn num_ids(&self) -> usize {
        self.0.values().map(NfTokens::len).sum()
    }

    /// Union of all token sets
    pub fn all_tokens(&self) -> NfTokens {
        self.0.values().flat_map(NfTokens::iter).collect()
    }

    /// Fail if any address with tokens appears in both maps
    pub fn no_address_intersection(&self, other: &AddressNfTokensMap) -> ValidationResult<()> {
        for (address, tokens) in &self.0 {
            if tokens.is_empty() {
                continue;
            }
            if other.get(address).is_some_and(|t| !t.is_empty()) {
                return Err(ValidationError::Conservation(format!(
                    "inputs and outputs intersect: duplicate address: {}",
                    address
                )));
            }
        }
        Ok(())
    }

    /// Fail unless both maps hold exactly the same token IDs
    pub fn ids_conserved(&self, other: &AddressNfTokensMap) -> ValidationResult<()> {
        if self.num_ids() != other.num_ids() {
            return Err(ValidationError::Conservation(
                "number of NFTokenIDs differ".to_string(),
            ));
        }
        self.all_tokens()
            .contains_all(&other.all_tokens())
            .map_err(|e| match e {
                ValidationError::Conservation(msg) => {
                    ValidationError::Conservation(format!("inputs and outputs mismatch: {}", msg))
                }
                other => other,
            })
    }
}

impl FromIterator<(Address, NfTokens)> for AddressNfTokensMap {
    fn from_iter<I: IntoIterator<Item = (Address, NfTokens)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// Per-token metadata declared when the tokens are minted
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NfTokenMetadataMap(pub BTreeMap<NfTokenId, String>);

#[derive(Deserialize)]
struct RawTokenMetadata {
    #[serde(default, deserialize_with = "raw_some")]
    ids: Option<String>,
    #[serde(default, deserialize_with = "raw_some")]
    metadata: Option<String>,
}

#[derive(Serialize)]
struct TokenMetadataJson<'a> {
    ids: &'a NfTokens,
    metadata: &'a RawValue,
}

impl NfTokenMetadataMap {
    /// Decode `[{"ids":<NFTokens>,"metadata":<any>},...]`
    pub fn from_json(data: &[u8]) -> ValidationResult<Self> {
        let raw: Vec<RawTokenMetadata> = serde_json::from_slice(data)?;

        let mut map = BTreeMap::new();
        let mut expected_len = "[]".len() - ",".len()
            + raw.len() * r#"{"ids":,"metadata":},"#.len();
        for item in raw {
            let ids = item.ids.ok_or_else(|| {
                ValidationError::Structural(r#"missing required field "ids""#.to_string())
            })?;
            let metadata = item.metadata.ok_or_else(|| {
                ValidationError::Structural(r#"missing required field "metadata""#.to_string())
            })?;

            let ids_json = compact(ids.as_bytes());
            let tokens = NfTokens::from_json(&ids_json)?;
            let metadata = String::from_utf8_lossy(&compact(metadata.as_bytes())).into_owned();
            expected_len += ids_json.len() + metadata.len();

            for id in tokens.iter() {
                if map.insert(id, metadata.clone()).is_some() {
                    return Err(ValidationError::Structural(format!(
                        "tokenmetadata: duplicate NFTokenID: {}",
                        id
                    )));
                }
            }
        }

        if expected_len != compact(data).len() {
            return Err(ValidationError::UnexpectedLength);
        }
        Ok(Self(map))
    }

    /// Fail unless every ID with metadata is in `tokens`
    pub fn is_subset_of(&self, tokens: &NfTokens) -> ValidationResult<()> {
        if self.0.len() > tokens.len() {
            return Err(ValidationError::Conservation(
                "tokenmetadata: too many NFTokenIDs".to_string(),
            ));
        }
        match self.0.keys().find(|id| !tokens.contains(**id)) {
            Some(id) => Err(ValidationError::Conservation(format!(
                "tokenmetadata: NFTokenID({}) is missing",
                id
            ))),
            None => Ok(()),
        }
    }

    /// Metadata for `id`
    pub fn get(&self, id: NfTokenId) -> Option<&str> {
        self.0.get(&id).map(String::as_str)
    }

    /// Whether no metadata is declared
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Attach the same metadata to every ID in `tokens`
    pub fn set(&mut self, tokens: &NfTokens, metadata: &str) {
        for id in tokens.iter() {
            self.0.insert(id, metadata.to_string());
        }
    }
}

impl Serialize for NfTokenMetadataMap {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut grouped: BTreeMap<&str, NfTokens> = BTreeMap::new();
        for (id, metadata) in &self.0 {
            grouped
                .entry(metadata.as_str())
                .or_default()
                .insert(*id)
                .map_err(S::Error::custom)?;
        }

        let mut items = Vec::with_capacity(grouped.len());
        for (metadata, ids) in &grouped {
            let metadata: &RawValue = serde_json::from_str(metadata).map_err(S::Error::custom)?;
            items.push(TokenMetadataJson { ids, metadata });
        }
        items.serialize(serializer)
    }
}

/// FAT-1 transaction
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transaction {
    /// Spending addresses
    pub inputs: AddressNfTokensMap,

    /// Receiving addresses
    pub outputs: AddressNfTokensMap,

    /// Metadata for minted tokens, coinbase only
    pub token_metadata: NfTokenMetadataMap,

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
    tokenmetadata: Option<String>,
    #[serde(default, deserialize_with = "raw_some")]
    metadata: Option<String>,
}

#[derive(Serialize)]
struct TransactionJson<'a> {
    inputs: &'a AddressNfTokensMap,
    outputs: &'a AddressNfTokensMap,
    #[serde(skip_serializing_if = "Option::is_none")]
    tokenmetadata: Option<&'a NfTokenMetadataMap>,
    #[serde(skip_serializing_if = "Option::is_none")]
    metadata: Option<&'a RawValue>,
}

impl Transaction {
    /// Create a transaction without metadata
    pub fn new(inputs: AddressNfTokensMap, outputs: AddressNfTokensMap) -> Self {
        Self {
            inputs,
            outputs,
            token_metadata: NfTokenMetadataMap::default(),
            metadata: None,
        }
    }

    /// Decode entry content, rejecting non-canonical JSON
    pub fn from_content(content: &[u8]) -> ValidationResult<Self> {
        let data = compact(content);
        let raw: RawTransaction<'_> = serde_json::from_slice(&data)?;

        let inputs = AddressNfTokensMap::from_json(raw.inputs.get().as_bytes())
            .map_err(|e| nested("inputs", e))?;
        let is_coinbase = inputs.get(&coinbase()).is_some_and(|t| !t.is_empty());

        let mut expected_len = 0;
        let token_metadata = match &raw.tokenmetadata {
            Some(tm) => {
                if !is_coinbase {
                    return Err(ValidationError::Structural(
                        r#"invalid field for non-coinbase transaction: "tokenmetadata""#
                            .to_string(),
                    ));
                }
                let tm_json = compact(tm.as_bytes());
                let token_metadata = NfTokenMetadataMap::from_json(&tm_json)
                    .map_err(|e| nested("tokenmetadata", e))?;
                if let Some(minted) = inputs.get(&coinbase()) {
                    token_metadata.is_subset_of(minted)?;
                }
                expected_len += r#","tokenmetadata":"#.len() + tm_json.len();
                token_metadata
            }
            None => NfTokenMetadataMap::default(),
        };

        let outputs = AddressNfTokensMap::from_json(raw.outputs.get().as_bytes())
            .map_err(|e| nested("outputs", e))?;

        let tx = Self {
            inputs,
            outputs,
            token_metadata,
            metadata: raw.metadata,
        };
        tx.valid_data()?;

        expected_len += r#"{"inputs":,"outputs":}"#.len()
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
        let tokenmetadata = (!self.token_metadata.is_empty()).then_some(&self.token_metadata);
        Ok(serde_json::to_vec(&TransactionJson {
            inputs: &self.inputs,
            outputs: &self.outputs,
            tokenmetadata,
            metadata,
        })?)
    }

    /// Whether the transaction mints new tokens
    pub fn is_coinbase(&self) -> bool {
        self.inputs.get(&coinbase()).is_some_and(|t| !t.is_empty())
    }

    /// Check address overlap, ID conservation and coinbase shape
    pub fn valid_data(&self) -> ValidationResult<()> {
        self.inputs.no_address_intersection(&self.outputs)?;
        self.inputs.ids_conserved(&self.outputs)?;
        if self.is_coinbase() && self.inputs.len() != 1 {
            return Err(ValidationError::Conservation(
                "invalid coinbase transaction".to_string(),
            ));
        }
        if !self.token_metadata.is_empty() {
            if !self.is_coinbase() {
                return Err(ValidationError::Structural(
                    r#"invalid field for non-coinbase transaction: "tokenmetadata""#
                        .to_string(),
                ));
            }
            if let Some(minted) = self.inputs.get(&coinbase()) {
                self.token_metadata.is_subset_of(minted)?;
            }
        }
        Ok(())
    }
}
