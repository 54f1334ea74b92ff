//! Token issuance declarations

use crate::error::{ValidationError, ValidationResult};
use crate::jsonlen::{self, compact, int64_len, raw_some};
use serde::{Deserialize, Serialize};
use serde_json::value::RawValue;
use std::fmt;

/// Largest precision a FAT-0 token may declare
pub const MAX_PRECISION: u32 = 18;

/// Token standard of a chain
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TokenType {
    /// Fungible amounts
    #[serde(rename = "FAT-0")]
    Fat0,
    /// Non-fungible token IDs
    #[serde(rename = "FAT-1")]
    Fat1,
}

impl TokenType {
    /// Protocol name
    pub fn as_str(&self) -> &'static str {
        match self {
            TokenType::Fat0 => "FAT-0",
            TokenType::Fat1 => "FAT-1",
        }
    }
}

impl fmt::Display for TokenType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One-time declaration of a token's standard and supply
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Issuance {
    /// Token standard
    #[serde(rename = "type")]
    pub token_type: TokenType,

    /// Maximum supply, or -1 for unlimited
    pub supply: i64,

    /// Display precision, FAT-0 only
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub precision: Option<u32>,

    /// Ticker symbol
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub symbol: Option<String>,

    /// Raw JSON metadata
    #[serde(
        default,
        deserialize_with = "raw_some",
        serialize_with = "serialize_raw",
        skip_serializing_if = "Option::is_none"
    )]
    pub metadata: Option<String>,
}

fn serialize_raw<S: serde::Serializer>(
    raw: &Option<String>,
    serializer: S,
) -> Result<S::Ok, S::Error> {
    use serde::ser::Error;
    match raw {
        Some(raw) => RawValue::from_string(raw.clone())
            .map_err(S::Error::custom)?
            .serialize(serializer),
        None => serializer.serialize_none(),
    }
}

impl Issuance {
    /// Create an issuance with no optional fields
    pub fn new(token_type: TokenType, supply: i64) -> Self {
        Self {
            token_type,
            supply,
            precision: None,
            symbol: None,
            metadata: None,
        }
    }

    /// Whether the supply is unlimited
    pub fn is_unlimited(&self) -> bool {
        self.supply == -1
    }

    /// Decode entry content, rejecting non-canonical JSON
    pub fn from_content(content: &[u8]) -> ValidationResult<Self> {
        let data = compact(content);
        let issuance: Issuance = serde_json::from_slice(&data)?;
        issuance.valid_data()?;
        if issuance.expected_json_len() != data.len() {
            return Err(ValidationError::UnexpectedLength);
        }
        Ok(issuance)
    }

    /// Encode as entry content
    pub fn to_content(&self) -> ValidationResult<Vec<u8>> {
        self.valid_data()?;
        Ok(serde_json::to_vec(self)?)
    }

    /// Check field values
    pub fn valid_data(&self) -> ValidationResult<()> {
        if self.supply == 0 || self.supply < -1 {
            return Err(ValidationError::Structural(
                r#"invalid "supply": must be positive or -1"#.to_string(),
            ));
        }
        if let Some(precision) = self.precision {
            if self.token_type != TokenType::Fat0 {
                return Err(ValidationError::Structural(
                    r#""precision" is only allowed for FAT-0"#.to_string(),
                ));
            }
            if precision > MAX_PRECISION {
                return Err(ValidationError::Structural(format!(
                    r#"invalid "precision": must be at most {}"#,
                    MAX_PRECISION
                )));
            }
        }
        Ok(())
    }

    fn expected_json_len(&self) -> usize {
        let mut len = "{}".len();
        len += r#""type":"""#.len() + self.token_type.as_str().len();
        len += r#","supply":"#.len() + int64_len(self.supply);
        if let Some(precision) = self.precision {
            len += r#","precision":"#.len() + jsonlen::uint64_len(precision as u64);
        }
        len += jsonlen::str_field_len("symbol", self.symbol.as_deref());
        len += jsonlen::metadata_len(self.metadata.as_deref());
        len
    }
}
