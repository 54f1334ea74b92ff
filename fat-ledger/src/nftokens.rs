//! Non-fungible token ID sets
//!
//! A set serializes as a JSON array of IDs and `{"min":a,"max":b}` range
//! objects. Encoding is canonical: IDs are sorted, contiguous runs are
//! merged, and a run is written as a range object only when that is no
//! longer than writing its IDs out one by one.

use crate::error::{ValidationError, ValidationResult};
use crate::jsonlen::{compact, uint64_len};
use serde::ser::SerializeSeq;
use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use serde_json::value::RawValue;
use std::collections::BTreeSet;
use std::fmt;

/// Non-fungible token identifier
pub type NfTokenId = u64;

/// Maximum number of IDs in one set or transaction side
pub const MAX_CAPACITY: usize = 400_000;

/// Closed interval of token IDs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NfTokenIdRange {
    /// First ID
    pub min: NfTokenId,
    /// Last ID
    pub max: NfTokenId,
}

impl NfTokenIdRange {
    /// Range covering a single ID
    pub fn single(id: NfTokenId) -> Self {
        Self { min: id, max: id }
    }

    /// Number of IDs, or `None` if it does not fit in a `usize`
    pub fn len(&self) -> Option<usize> {
        self.max
            .checked_sub(self.min)?
            .checked_add(1)
            .and_then(|n| usize::try_from(n).ok())
    }

    /// Length of the `{"min":a,"max":b}` form
    pub fn json_len(&self) -> usize {
        r#"{"min":"#.len() + uint64_len(self.min) + r#","max":"#.len() + uint64_len(self.max) + 1
    }

    /// Length of the IDs written individually, each with a separator
    fn expanded_len(&self) -> usize {
        (self.min..=self.max).map(|id| uint64_len(id) + 1).sum()
    }

    /// Whether the range object is no longer than the expanded IDs
    pub fn is_efficient(&self) -> bool {
        self.json_len() <= self.expanded_len()
    }
}

/// Element of the canonical JSON array
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NfTokensElement {
    /// Single ID
    Id(NfTokenId),
    /// Range object
    Range(NfTokenIdRange),
}

/// Set of unique token IDs
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NfTokens(BTreeSet<NfTokenId>);

impl NfTokens {
    /// Empty set
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a set, rejecting duplicates
    pub fn from_ids<I: IntoIterator<Item = NfTokenId>>(ids: I) -> ValidationResult<Self> {
        let mut tokens = Self::new();
        for id in ids {
            tokens.insert(id)?;
        }
        Ok(tokens)
    }

    /// Build a set covering a range
    pub fn from_range(range: NfTokenIdRange) -> ValidationResult<Self> {
        let mut tokens = Self::new();
        tokens.insert_range(range)?;
        Ok(tokens)
    }

    /// Insert one ID
    pub fn insert(&mut self, id: NfTokenId) -> ValidationResult<()> {
        if self.0.len() + 1 > MAX_CAPACITY {
            return Err(ValidationError::CapacityExceeded);
        }
        if !self.0.insert(id) {
            return Err(ValidationError::Structural(format!(
                "duplicate NFTokenID: {}",
                id
            )));
        }
        Ok(())
    }

    /// Insert every ID in a range
    pub fn insert_range(&mut self, range: NfTokenIdRange) -> ValidationResult<()> {
        if range.min > range.max {
            return Err(ValidationError::Structural(
                "NFTokenIDRange: min is greater than max".to_string(),
            ));
        }
        match range.len() {
            Some(n) if self.0.len() + n <= MAX_CAPACITY => {}
            _ => return Err(ValidationError::CapacityExceeded),
        }
        for id in range.min..=range.max {
            self.insert(id)?;
        }
        Ok(())
    }

    /// Add all IDs of another set, rejecting any overlap
    pub fn append(&mut self, other: &NfTokens) -> ValidationResult<()> {
        if self.0.len() + other.0.len() > MAX_CAPACITY {
            return Err(ValidationError::CapacityExceeded);
        }
        self.no_intersection(other)?;
        self.0.extend(other.0.iter().copied());
        Ok(())
    }

    /// Fail on the first ID present in both sets
    pub fn no_intersection(&self, other: &NfTokens) -> ValidationResult<()> {
        match self.0.intersection(&other.0).next() {
            Some(id) => Err(ValidationError::Conservation(format!(
                "duplicate NFTokenID: {}",
                id
            ))),
            None => Ok(()),
        }
    }

    /// Fail on the first ID of `subset` missing from this set
    pub fn contains_all(&self, subset: &NfTokens) -> ValidationResult<()> {
        match subset.0.difference(&self.0).next() {
            Some(id) => Err(ValidationError::Conservation(format!(
                "missing NFTokenID: {}",
                id
            ))),
            None => Ok(()),
        }
    }

    /// Whether the set contains `id`
    pub fn contains(&self, id: NfTokenId) -> bool {
        self.0.contains(&id)
    }

    /// Number of IDs
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether the set is empty
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// IDs in ascending order
    pub fn iter(&self) -> impl Iterator<Item = NfTokenId> + '_ {
        self.0.iter().copied()
    }

    /// Canonical JSON array elements
    pub fn elements(&self) -> Vec<NfTokensElement> {
        let mut elements = Vec::new();
        let mut ids = self.0.iter().copied();
        let Some(first) = ids.next() else {
            return elements;
        };

        let mut run = NfTokenIdRange::single(first);
        let flush = |run: NfTokenIdRange, elements: &mut Vec<NfTokensElement>| {
            if run.is_efficient() {
                elements.push(NfTokensElement::Range(run));
            } else {
                elements.extend((run.min..=run.max).map(NfTokensElement::Id));
            }
        };
        for id in ids {
            if run.max.checked_add(1) == Some(id) {
                run.max = id;
                continue;
            }
            flush(run, &mut elements);
            run = NfTokenIdRange::single(id);
        }
        flush(run, &mut elements);

        elements
    }

    /// Canonical JSON encoding. Empty sets are not encodable.
    pub fn to_json(&self) -> ValidationResult<String> {
        if self.is_empty() {
            return Err(ValidationError::Structural("NFTokens: empty".to_string()));
        }
        Ok(serde_json::to_string(self)?)
    }

    /// Decode a JSON array of IDs and range objects
    pub fn from_json(data: &[u8]) -> ValidationResult<Self> {
        let elements: Vec<Box<RawValue>> = serde_json::from_slice(data)?;
        if elements.is_empty() {
            return Err(ValidationError::Structural("NFTokens: empty".to_string()));
        }

        let mut tokens = Self::new();
        for raw in elements {
            let raw = raw.get();
            if raw.starts_with('{') {
                let range: NfTokenIdRange = serde_json::from_str(raw)?;
                if compact(raw.as_bytes()).len() != range.json_len() {
                    return Err(ValidationError::UnexpectedLength);
                }
                tokens.insert_range(range)?;
            } else {
                let id: NfTokenId = serde_json::from_str(raw)?;
                tokens.insert(id)?;
            }
        }

        Ok(tokens)
    }
}

impl FromIterator<NfTokenId> for NfTokens {
    /// Collect without capacity or duplicate checks
    fn from_iter<I: IntoIterator<Item = NfTokenId>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl fmt::Display for NfTokens {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[")?;
        for (i, element) in self.elements().iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            match element {
                NfTokensElement::Id(id) => write!(f, "{}", id)?,
                NfTokensElement::Range(range) => write!(f, "{}-{}", range.min, range.max)?,
            }
        }
        write!(f, "]")
    }
}

impl Serialize for NfTokens {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let elements = self.elements();
        let mut seq = serializer.serialize_seq(Some(elements.len()))?;
        for element in &elements {
            match element {
                NfTokensElement::Id(id) => seq.serialize_element(id)?,
                NfTokensElement::Range(range) => seq.serialize_element(range)?,
            }
        }
        seq.end()
    }
}

impl<'de> Deserialize<'de> for NfTokens {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = Box::<RawValue>::deserialize(deserializer)?;
        Self::from_json(raw.get().as_bytes()).map_err(de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tokens(ids: impl IntoIterator<Item = NfTokenId>) -> NfTokens {
        NfTokens::from_ids(ids).unwrap()
    }

    #[test]
    fn test_short_run_expands() {
        assert_eq!(tokens([0, 1, 2]).to_json().unwrap(), "[0,1,2]");
        assert_eq!(tokens([5]).to_json().unwrap(), "[5]");
    }

    #[test]
    fn test_range_threshold() {
        // {0..7}: range is 17 bytes, expanded IDs are 16
        assert_eq!(
            tokens(0..=7).to_json().unwrap(),
            "[0,1,2,3,4,5,6,7]"
        );
        // {0..8}: range is 17 bytes, expanded IDs are 18
        assert_eq!(
            tokens(0..=8).to_json().unwrap(),
            r#"[{"min":0,"max":8}]"#
        );
    }

    #[test]
    fn test_tie_favors_range() {
        // {"min":7,"max":13} and "7,8,9,10,11,12,13," are both 18 bytes
        let range = NfTokenIdRange { min: 7, max: 13 };
        assert_eq!(range.json_len(), 18);
        assert!(range.is_efficient());
        assert_eq!(
            tokens(7..=13).to_json().unwrap(),
            r#"[{"min":7,"max":13}]"#
        );

        // One ID shorter and the expanded form wins
        assert!(!NfTokenIdRange { min: 8, max: 13 }.is_efficient());
    }

    #[test]
    fn test_mixed_encoding() {
        let set: NfTokens = tokens((0..=20).chain([25, 27, 28]).chain(100..=199));
        assert_eq!(
            set.to_json().unwrap(),
            r#"[{"min":0,"max":20},25,27,28,{"min":100,"max":199}]"#
        );
        assert_eq!(set.to_string(), "[0-20, 25, 27, 28, 100-199]");
    }

    #[test]
    fn test_decode_round_trip() {
        let set: NfTokens = tokens((0..=20).chain([25, 27, 28]).chain(1000..=1010));
        let json = set.to_json().unwrap();
        assert_eq!(NfTokens::from_json(json.as_bytes()).unwrap(), set);
    }

    #[test]
    fn test_decode_non_canonical_input() {
        let set = NfTokens::from_json(br#"[3, {"min":0,"max":2}, 10]"#).unwrap();
        assert_eq!(set, tokens([0, 1, 2, 3, 10]));
    }

    #[test]
    fn test_decode_rejects() {
        // Empty
        assert!(NfTokens::from_json(b"[]").is_err());
        // Duplicates, directly or through a range
        assert!(NfTokens::from_json(b"[1,1]").is_err());
        assert!(NfTokens::from_json(br#"[2,{"min":0,"max":5}]"#).is_err());
        // Inverted range
        assert!(NfTokens::from_json(br#"[{"min":5,"max":0}]"#).is_err());
        // Extra field in range object
        assert!(NfTokens::from_json(br#"[{"min":0,"max":5,"x":1}]"#).is_err());
        // Negative and fractional IDs
        assert!(NfTokens::from_json(b"[-1]").is_err());
        assert!(NfTokens::from_json(b"[1.5]").is_err());
        // Not an array
        assert!(NfTokens::from_json(b"{}").is_err());
    }

    #[test]
    fn test_capacity() {
        let huge = format!(r#"[{{"min":0,"max":{}}}]"#, MAX_CAPACITY);
        assert_eq!(
            NfTokens::from_json(huge.as_bytes()),
            Err(ValidationError::CapacityExceeded)
        );

        let full = format!(r#"[{{"min":0,"max":{}}}]"#, MAX_CAPACITY - 1);
        let set = NfTokens::from_json(full.as_bytes()).unwrap();
        assert_eq!(set.len(), MAX_CAPACITY);

        let unbounded = format!(r#"[{{"min":0,"max":{}}}]"#, u64::MAX);
        assert_eq!(
            NfTokens::from_json(unbounded.as_bytes()),
            Err(ValidationError::CapacityExceeded)
        );
    }

    #[test]
    fn test_set_operations() {
        let mut a = tokens([1, 2, 3]);
        let b = tokens([3, 4]);
        let c = tokens([5]);

        assert!(a.no_intersection(&b).is_err());
        assert!(a.no_intersection(&c).is_ok());
        assert!(a.contains_all(&tokens([1, 3])).is_ok());
        assert!(a.contains_all(&b).is_err());

        a.append(&c).unwrap();
        assert!(a.contains(5));
        assert!(a.append(&c).is_err());
    }

    #[test]
    fn test_serde_json() {
        let set = tokens(0..=8);
        let json = serde_json::to_string(&set).unwrap();
        let back: NfTokens = serde_json::from_str(&json).unwrap();
        assert_eq!(back, set);
    }
}
