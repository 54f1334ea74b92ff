//! Offline integrity audit of a chain store
//!
//! The audit re-derives every hash from the stored bytes and checks the
//! links between blocks, the entries they list and the valid-entry index.
//! It stops at the first violation.

use crate::{
    crypto::sha256,
    eblock::EntryBlock,
    entry::{compute_hash, Entry},
    error::{Error, Result},
    storage::{read_u64, BlockRecord, ChainMetadata, ChainStore, Cf, EntryRecord, KvRead},
    types::{Bytes32, ChainId},
};
use serde::Serialize;
use std::collections::HashSet;

/// Outcome of an audit
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AuditReport {
    /// Audited chain
    pub chain_id: ChainId,
    /// Blocks checked
    pub blocks: u64,
    /// Entries checked
    pub entries: u64,
    /// First violation found
    pub violation: Option<String>,
}

impl AuditReport {
    /// Whether no violation was found
    pub fn passed(&self) -> bool {
        self.violation.is_none()
    }
}

/// Audit a chain store
pub fn audit(store: &ChainStore) -> Result<AuditReport> {
    let snapshot = store.snapshot();
    let meta = snapshot.metadata()?;
    let mut auditor = Auditor {
        meta: &meta,
        report: AuditReport {
            chain_id: meta.chain_id,
            blocks: 0,
            entries: 0,
            violation: None,
        },
        listed: Vec::new(),
    };

    let mut prev: Option<BlockRecord> = None;
    let blocks = snapshot.scan_prefix(Cf::EBlocks, &[], false, |_, value| {
        let record: BlockRecord = bincode::deserialize(value)?;
        auditor.check_block(&record, prev.as_ref())?;
        prev = Some(record);
        Ok(true)
    });
    let blocks = blocks.and_then(|()| auditor.check_head(prev.as_ref()));
    if let Some(report) = auditor.finish(blocks)? {
        return Ok(report);
    }

    let mut seen = HashSet::new();
    let entries = snapshot.scan_prefix(Cf::Entries, &[], false, |key, value| {
        let record: EntryRecord = bincode::deserialize(value)?;
        if read_u64(key, 0)? != record.id {
            return Err(Error::Integrity(format!("entry {} stored under wrong key", record.id)));
        }
        auditor.check_entry(&record, &snapshot, &mut seen)?;
        Ok(true)
    });
    let entries = entries.and_then(|()| auditor.check_entry_count());
    if let Some(report) = auditor.finish(entries)? {
        return Ok(report);
    }

    tracing::info!(
        chain_id = %auditor.report.chain_id,
        blocks = auditor.report.blocks,
        entries = auditor.report.entries,
        "Audit passed"
    );
    Ok(auditor.report)
}

struct Auditor<'m> {
    meta: &'m ChainMetadata,
    report: AuditReport,
    /// Entry hashes in block order, with their block sequence
    listed: Vec<(u32, Bytes32)>,
}

impl Auditor<'_> {
    /// Turn a data violation into a failed report. Other errors propagate.
    fn finish(&mut self, result: Result<()>) -> Result<Option<AuditReport>> {
        let violation = match result {
            Ok(()) => return Ok(None),
            Err(Error::Integrity(msg))
            | Err(Error::MalformedBlock(msg))
            | Err(Error::MalformedEntry(msg)) => msg,
            Err(Error::Serialization(err)) => format!("undecodable record: {}", err),
            Err(err) => return Err(err),
        };
        tracing::error!(
            chain_id = %self.report.chain_id,
            violation = %violation,
            "Audit failed"
        );
        self.report.violation = Some(violation);
        Ok(Some(self.report.clone()))
    }

    fn check_block(&mut self, record: &BlockRecord, prev: Option<&BlockRecord>) -> Result<()> {
        let seq = record.sequence;
        let expected_seq = prev.map_or(0, |p| p.sequence + 1);
        if seq != expected_seq {
            return Err(Error::Integrity(format!(
                "block sequence {} follows {}",
                seq,
                expected_seq.wrapping_sub(1)
            )));
        }

        let block = EntryBlock::unmarshal_binary(&record.data, record.timestamp)?;
        if block.chain_id != self.meta.chain_id {
            return Err(Error::Integrity(format!(
                "block {} belongs to chain {}",
                seq, block.chain_id
            )));
        }
        if block.sequence != seq {
            return Err(Error::Integrity(format!(
                "block {} encodes sequence {}",
                seq, block.sequence
            )));
        }
        block
            .verify_hashes()
            .map_err(|e| Error::Integrity(format!("block {}: {}", seq, e)))?;
        if block.key_mr != record.key_mr {
            return Err(Error::Integrity(format!(
                "block {} KeyMR {} does not match stored {}",
                seq, block.key_mr, record.key_mr
            )));
        }
        let full_hash = sha256(&record.data);
        if full_hash != record.full_hash {
            return Err(Error::Integrity(format!(
                "block {} full hash {} does not match stored {}",
                seq, full_hash, record.full_hash
            )));
        }

        let (prev_key_mr, prev_full_hash) = match prev {
            Some(prev) => (prev.key_mr, prev.full_hash),
            None => (Bytes32::ZERO, Bytes32::ZERO),
        };
        if block.prev_key_mr != prev_key_mr || record.prev_key_mr != prev_key_mr {
            return Err(Error::Integrity(format!(
                "block {} PrevKeyMR {} breaks the chain at {}",
                seq, block.prev_key_mr, prev_key_mr
            )));
        }
        if block.prev_full_hash != prev_full_hash || record.prev_full_hash != prev_full_hash {
            return Err(Error::Integrity(format!(
                "block {} PrevFullHash {} breaks the chain at {}",
                seq, block.prev_full_hash, prev_full_hash
            )));
        }

        for entry in &block.entries {
            self.listed.push((seq, entry.hash()?));
        }
        self.report.blocks += 1;
        Ok(())
    }

    fn check_head(&self, last: Option<&BlockRecord>) -> Result<()> {
        let stored = last.map(|b| (b.sequence, b.key_mr, b.full_hash));
        let head = self.meta.head.map(|h| (h.sequence, h.key_mr, h.full_hash));
        if stored != head {
            return Err(Error::Integrity(format!(
                "chain head {:?} does not match last stored block {:?}",
                self.meta.head.map(|h| h.sequence),
                last.map(|b| b.sequence)
            )));
        }
        Ok(())
    }

    fn check_entry(
        &mut self,
        record: &EntryRecord,
        reader: &impl KvRead,
        seen: &mut HashSet<Bytes32>,
    ) -> Result<()> {
        let id = record.id;
        let hash = compute_hash(&record.data);
        if hash != record.hash {
            return Err(Error::Integrity(format!(
                "entry {} hash {} does not match stored {}",
                id, hash, record.hash
            )));
        }
        let entry = Entry::unmarshal_binary(&record.data)?;
        if entry.chain_id != self.meta.chain_id {
            return Err(Error::Integrity(format!(
                "entry {} belongs to chain {}",
                id, entry.chain_id
            )));
        }

        let position = usize::try_from(id - 1).ok();
        match position.and_then(|i| self.listed.get(i)) {
            Some((seq, listed)) if *listed == hash && *seq == record.sequence => {}
            _ => {
                return Err(Error::Integrity(format!(
                    "entry {} ({}) is not listed by block {}",
                    id, hash, record.sequence
                )))
            }
        }

        if record.valid {
            if !seen.insert(hash) {
                return Err(Error::Integrity(format!(
                    "entry {} duplicates valid entry hash {}",
                    id, hash
                )));
            }
            if reader.valid_entry_id(&hash)? != Some(id) {
                return Err(Error::Integrity(format!(
                    "valid entry {} missing from the hash index",
                    id
                )));
            }
        }
        self.report.entries += 1;
        Ok(())
    }

    fn check_entry_count(&self) -> Result<()> {
        let listed = self.listed.len() as u64;
        if self.report.entries != listed || self.meta.next_entry_id != listed + 1 {
            return Err(Error::Integrity(format!(
                "{} entries stored, {} listed by blocks, next ID {}",
                self.report.entries, listed, self.meta.next_entry_id
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::tests::Fixture;
    use crate::chain::Chain;
    use crate::config::RocksDBConfig;
    use crate::crypto::KeyPair;
    use crate::issuance::TokenType;
    use crate::types::NetworkId;
    use tempfile::TempDir;

    fn chain(temp: &TempDir) -> Chain {
        let mut fx = Fixture::new("audit");
        let alice = KeyPair::from_seed(&[1; 32]);
        let bob = KeyPair::from_seed(&[2; 32]);

        let issuance = fx.issuance(TokenType::Fat0, -1);
        let first = fx.first_block(vec![issuance]);
        let mut chain = Chain::create(
            &temp.path().join(fx.chain_id.to_string()),
            &RocksDBConfig::default(),
            NetworkId::LOCALNET,
            &first,
            Bytes32::ZERO,
            Some(fx.identity.clone()),
        )
        .unwrap();

        let transfer = fx.fat0_transfer(&alice, &bob, 5);
        let block = fx.block(vec![fx.fat0_coinbase(&alice, 10), transfer.clone()]);
        chain.apply_block(&block).unwrap();
        // Replayed, so stored invalid
        let block = fx.block(vec![transfer]);
        chain.apply_block(&block).unwrap();
        chain
    }

    #[test]
    fn test_clean_chain_passes() {
        let temp = TempDir::new().unwrap();
        let chain = chain(&temp);
        let report = audit(&chain.store()).unwrap();
        assert!(report.passed(), "{:?}", report.violation);
        assert_eq!(report.blocks, 3);
        assert_eq!(report.entries, 5);
    }

    #[test]
    fn test_tampered_entry_fails() {
        let temp = TempDir::new().unwrap();
        let chain = chain(&temp);
        let store = chain.store();

        let mut record = store.entry(3).unwrap().unwrap();
        record.data.push(b' ');
        let mut txn = store.begin();
        txn.put(Cf::Entries, 3u64.to_be_bytes().to_vec(), &record)
            .unwrap();
        txn.commit().unwrap();

        let report = audit(&store).unwrap();
        assert!(!report.passed());
        assert!(report.violation.unwrap().contains("entry 3 hash"));
    }

    #[test]
    fn test_broken_link_fails() {
        let temp = TempDir::new().unwrap();
        let chain = chain(&temp);
        let store = chain.store();

        let mut record = store.block(1).unwrap().unwrap();
        record.key_mr = Bytes32([1; 32]);
        let mut txn = store.begin();
        txn.insert_block(&record).unwrap();
        txn.commit().unwrap();

        let report = audit(&store).unwrap();
        assert!(report.violation.unwrap().contains("block 1 KeyMR"));
    }

    #[test]
    fn test_duplicate_valid_hash_fails() {
        let temp = TempDir::new().unwrap();
        let chain = chain(&temp);
        let store = chain.store();

        // Mark the replayed entry valid as well, keeping the index on the original
        let hash = store.entry(5).unwrap().unwrap().hash;
        let mut txn = store.begin();
        txn.set_valid(5).unwrap();
        txn.put_raw(Cf::ValidHashes, hash.as_bytes().to_vec(), 3u64.to_be_bytes().to_vec());
        txn.commit().unwrap();

        let report = audit(&store).unwrap();
        assert!(report.violation.unwrap().contains("duplicates valid entry hash"));
    }

    #[test]
    fn test_missing_block_fails() {
        let temp = TempDir::new().unwrap();
        let chain = chain(&temp);
        let store = chain.store();

        let mut txn = store.begin();
        txn.delete_raw(Cf::EBlocks, 1u32.to_be_bytes().to_vec());
        txn.commit().unwrap();

        let report = audit(&store).unwrap();
        assert!(report.violation.unwrap().contains("block sequence 2"));
    }
}
