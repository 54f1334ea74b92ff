//! Property-based tests for ledger invariants
//!
//! These tests use proptest to check the rules every applied chain obeys:
//! - Conservation: FAT-0 balances always sum to the issued amount
//! - Ownership: every FAT-1 token has exactly one owner
//! - Supply: coinbase issuance never exceeds a finite supply
//! - Replay: a valid entry hash is applied at most once
//! - Continuity: a block that skips a sequence changes nothing

use chrono::{DateTime, Duration, Utc};
use fat_ledger::{
    config::RocksDBConfig,
    crypto::{coinbase, KeyPair},
    entry::{compute_hash, token_chain_id, token_name_ids},
    fat0::{self, AddressAmountMap},
    fat1::{self, AddressNfTokensMap},
    signature::sign_entry_with_salt,
    storage::KvRead,
    Bytes32, Chain, ChainId, Entry, EntryBlock, Error, Identity, Issuance, NetworkId, NfTokenId,
    NfTokens, TokenType,
};
use proptest::prelude::*;
use std::collections::{BTreeMap, BTreeSet, HashSet};
use tempfile::TempDir;

const HOLDERS: usize = 4;

/// Builds and applies consecutive blocks for one token chain
struct Harness {
    _temp: TempDir,
    chain: Chain,
    chain_id: ChainId,
    issuer: KeyPair,
    holders: Vec<KeyPair>,
    prev: EntryBlock,
    start: DateTime<Utc>,
}

impl Harness {
    fn new(token_type: TokenType, supply: i64) -> Self {
        let temp = TempDir::new().unwrap();
        let issuer = KeyPair::from_seed(&[7; 32]);
        let mut issuer_chain = [0u8; 32];
        issuer_chain[..4].copy_from_slice(&[0x88, 0x88, 0x88, 0x01]);
        let issuer_chain = Bytes32(issuer_chain);
        let start = DateTime::from_timestamp(1_600_000_000, 0).unwrap();

        let chain_id = token_chain_id("prop", &issuer_chain);
        let identity = Identity {
            chain_id: issuer_chain,
            id1_key: issuer.rcd_hash(),
            timestamp: start - Duration::days(1),
            height: 1,
        };

        let name = Entry::new(chain_id, token_name_ids("prop", &issuer_chain), Vec::new(), start);
        let content = Issuance::new(token_type, supply).to_content().unwrap();
        let issuance = sign(chain_id, content, &[&issuer], start);
        let first = EntryBlock::build(chain_id, 0, 100, start, None, vec![name, issuance]).unwrap();

        let chain = Chain::create(
            &temp.path().join(chain_id.to_string()),
            &RocksDBConfig::default(),
            NetworkId::LOCALNET,
            &first,
            Bytes32::ZERO,
            Some(identity),
        )
        .unwrap();

        let holders = (1..=HOLDERS as u8)
            .map(|seed| KeyPair::from_seed(&[seed; 32]))
            .collect();
        Self {
            _temp: temp,
            chain,
            chain_id,
            issuer,
            holders,
            prev: first,
            start,
        }
    }

    fn next_time(&self) -> DateTime<Utc> {
        self.start + Duration::minutes(10 * i64::from(self.prev.sequence + 1))
    }

    fn signed(&self, content: Vec<u8>, signers: &[&KeyPair]) -> Entry {
        sign(self.chain_id, content, signers, self.next_time())
    }

    fn fat0_coinbase(&self, to: usize, amount: u64) -> Entry {
        let tx = fat0::Transaction::new(
            AddressAmountMap::from_iter([(coinbase(), amount)]),
            AddressAmountMap::from_iter([(self.holders[to].address(), amount)]),
        );
        self.signed(tx.to_content().unwrap(), &[&self.issuer])
    }

    fn fat0_transfer(&self, from: usize, to: usize, amount: u64) -> Entry {
        let tx = fat0::Transaction::new(
            AddressAmountMap::from_iter([(self.holders[from].address(), amount)]),
            AddressAmountMap::from_iter([(self.holders[to].address(), amount)]),
        );
        self.signed(tx.to_content().unwrap(), &[&self.holders[from]])
    }

    fn fat1_mint(&self, to: usize, ids: &BTreeSet<NfTokenId>) -> Entry {
        let tokens = NfTokens::from_ids(ids.iter().copied()).unwrap();
        let tx = fat1::Transaction::new(
            AddressNfTokensMap::from_iter([(coinbase(), tokens.clone())]),
            AddressNfTokensMap::from_iter([(self.holders[to].address(), tokens)]),
        );
        self.signed(tx.to_content().unwrap(), &[&self.issuer])
    }

    fn fat1_transfer(&self, from: usize, to: usize, ids: &BTreeSet<NfTokenId>) -> Entry {
        let tokens = NfTokens::from_ids(ids.iter().copied()).unwrap();
        let tx = fat1::Transaction::new(
            AddressNfTokensMap::from_iter([(self.holders[from].address(), tokens.clone())]),
            AddressNfTokensMap::from_iter([(self.holders[to].address(), tokens)]),
        );
        self.signed(tx.to_content().unwrap(), &[&self.holders[from]])
    }

    fn build(&self, sequence: u32, entries: Vec<Entry>) -> EntryBlock {
        EntryBlock::build(
            self.chain_id,
            sequence,
            100 + sequence,
            self.next_time(),
            Some(&self.prev),
            entries,
        )
        .unwrap()
    }

    fn apply(&mut self, entries: Vec<Entry>) -> (usize, usize) {
        let block = self.build(self.prev.sequence + 1, entries);
        let summary = self.chain.apply_block(&block).unwrap();
        self.prev = block;
        (summary.valid, summary.invalid)
    }

    fn balances(&self) -> Vec<u64> {
        let store = self.chain.store();
        self.holders
            .iter()
            .map(|k| store.balance(&k.address()).unwrap())
            .collect()
    }

    fn owner(&self, id: NfTokenId) -> Option<usize> {
        let record = self.chain.store().nf_token(id).unwrap()?;
        self.holders.iter().position(|k| k.address() == record.owner)
    }
}

fn sign(chain_id: ChainId, content: Vec<u8>, signers: &[&KeyPair], now: DateTime<Utc>) -> Entry {
    let entry = Entry::new(chain_id, Vec::new(), content, now);
    sign_entry_with_salt(entry, signers, now, now.timestamp() - 30)
}

fn entry_hash(entry: &Entry) -> Bytes32 {
    compute_hash(&entry.marshal_binary().unwrap())
}

#[derive(Debug, Clone)]
enum Fat0Op {
    Coinbase { to: usize, amount: u64 },
    Transfer { from: usize, to: usize, amount: u64 },
}

fn fat0_op_strategy() -> impl Strategy<Value = Fat0Op> {
    prop_oneof![
        (0..HOLDERS, 1u64..100).prop_map(|(to, amount)| Fat0Op::Coinbase { to, amount }),
        (0..HOLDERS, 0..HOLDERS, 1u64..150)
            .prop_map(|(from, to, amount)| Fat0Op::Transfer { from, to, amount }),
    ]
}

#[derive(Debug, Clone)]
enum Fat1Op {
    Mint { to: usize, ids: BTreeSet<NfTokenId> },
    Transfer { from: usize, to: usize, ids: BTreeSet<NfTokenId> },
}

fn ids_strategy() -> impl Strategy<Value = BTreeSet<NfTokenId>> {
    prop::collection::btree_set(0u64..24, 1..4)
}

fn fat1_op_strategy() -> impl Strategy<Value = Fat1Op> {
    prop_oneof![
        (0..HOLDERS, ids_strategy()).prop_map(|(to, ids)| Fat1Op::Mint { to, ids }),
        (0..HOLDERS, 0..HOLDERS, ids_strategy())
            .prop_map(|(from, to, ids)| Fat1Op::Transfer { from, to, ids }),
    ]
}

/// FAT-0 reference model: balances, issued total and applied hashes
struct Fat0Model {
    supply: Option<u64>,
    balances: Vec<u64>,
    issued: u64,
    applied: HashSet<Bytes32>,
}

impl Fat0Model {
    fn apply(&mut self, op: &Fat0Op, hash: Bytes32) -> bool {
        if self.applied.contains(&hash) {
            return false;
        }
        match *op {
            Fat0Op::Coinbase { to, amount } => {
                if self.supply.is_some_and(|s| self.issued + amount > s) {
                    return false;
                }
                self.issued += amount;
                self.balances[to] += amount;
            }
            Fat0Op::Transfer { from, to, amount } => {
                if self.balances[from] < amount {
                    return false;
                }
                self.balances[from] -= amount;
                self.balances[to] += amount;
            }
        }
        self.applied.insert(hash);
        true
    }
}

fn run_fat0(supply: i64, blocks: &[Vec<Fat0Op>]) -> Result<(), TestCaseError> {
    let mut harness = Harness::new(TokenType::Fat0, supply);
    let mut model = Fat0Model {
        supply: u64::try_from(supply).ok(),
        balances: vec![0; HOLDERS],
        issued: 0,
        applied: HashSet::new(),
    };

    for ops in blocks {
        let mut expected_valid = 0;
        let entries: Vec<Entry> = ops
            .iter()
            .map(|op| {
                let entry = match *op {
                    Fat0Op::Coinbase { to, amount } => harness.fat0_coinbase(to, amount),
                    Fat0Op::Transfer { from, to, amount } => {
                        harness.fat0_transfer(from, to, amount)
                    }
                };
                if model.apply(op, entry_hash(&entry)) {
                    expected_valid += 1;
                }
                entry
            })
            .collect();

        let (valid, invalid) = harness.apply(entries);
        prop_assert_eq!(valid, expected_valid);
        prop_assert_eq!(valid + invalid, ops.len());

        let balances = harness.balances();
        prop_assert_eq!(&balances, &model.balances);
        prop_assert_eq!(balances.iter().sum::<u64>(), harness.chain.metadata().num_issued);
        prop_assert_eq!(harness.chain.metadata().num_issued, model.issued);
        if let Some(supply) = model.supply {
            prop_assert!(model.issued <= supply);
        }
    }
    Ok(())
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    /// Balances always sum to the amount issued and match the reference model
    #[test]
    fn test_fat0_conservation(
        blocks in prop::collection::vec(prop::collection::vec(fat0_op_strategy(), 1..8), 1..5)
    ) {
        run_fat0(-1, &blocks)?;
    }

    /// Coinbase transactions beyond a finite supply are rejected
    #[test]
    fn test_fat0_supply_cap(
        supply in 1i64..200,
        blocks in prop::collection::vec(prop::collection::vec(fat0_op_strategy(), 1..8), 1..5)
    ) {
        run_fat0(supply, &blocks)?;
    }

    /// Every minted token has exactly one owner and transfers only move
    /// tokens their sender holds
    #[test]
    fn test_fat1_ownership(
        blocks in prop::collection::vec(prop::collection::vec(fat1_op_strategy(), 1..6), 1..5)
    ) {
        let mut harness = Harness::new(TokenType::Fat1, -1);
        let mut owners: BTreeMap<NfTokenId, usize> = BTreeMap::new();
        let mut applied = HashSet::new();

        for ops in blocks {
            let mut expected_valid = 0;
            let entries: Vec<Entry> = ops
                .iter()
                .map(|op| {
                    let entry = match op {
                        Fat1Op::Mint { to, ids } => harness.fat1_mint(*to, ids),
                        Fat1Op::Transfer { from, to, ids } => harness.fat1_transfer(*from, *to, ids),
                    };
                    let hash = entry_hash(&entry);
                    let ok = !applied.contains(&hash)
                        && match op {
                            Fat1Op::Mint { ids, .. } => ids.iter().all(|id| !owners.contains_key(id)),
                            Fat1Op::Transfer { from, to, ids } => {
                                from != to && ids.iter().all(|id| owners.get(id) == Some(from))
                            }
                        };
                    if ok {
                        let to = match op {
                            Fat1Op::Mint { to, .. } | Fat1Op::Transfer { to, .. } => *to,
                        };
                        let ids = match op {
                            Fat1Op::Mint { ids, .. } | Fat1Op::Transfer { ids, .. } => ids,
                        };
                        for id in ids {
                            owners.insert(*id, to);
                        }
                        applied.insert(hash);
                        expected_valid += 1;
                    }
                    entry
                })
                .collect();

            let (valid, _) = harness.apply(entries);
            prop_assert_eq!(valid, expected_valid);

            for id in 0u64..24 {
                prop_assert_eq!(harness.owner(id), owners.get(&id).copied());
            }
            let balances = harness.balances();
            for (holder, balance) in balances.iter().enumerate() {
                let held = owners.values().filter(|&&o| o == holder).count() as u64;
                prop_assert_eq!(*balance, held);
            }
            prop_assert_eq!(harness.chain.metadata().num_issued, owners.len() as u64);
        }
    }

    /// Re-submitting an applied entry in a later block is rejected
    #[test]
    fn test_replay_rejected(amount in 1u64..1000, repeats in 1usize..4) {
        let mut harness = Harness::new(TokenType::Fat0, -1);
        harness.apply(vec![harness.fat0_coinbase(0, amount * 2)]);

        let transfer = harness.fat0_transfer(0, 1, amount);
        prop_assert_eq!(harness.apply(vec![transfer.clone()]), (1, 0));
        for _ in 0..repeats {
            prop_assert_eq!(harness.apply(vec![transfer.clone()]), (0, 1));
        }
        prop_assert_eq!(harness.balances()[..2].to_vec(), vec![amount, amount]);
    }

    /// A block that skips ahead is refused without touching the chain
    #[test]
    fn test_discontinuity_rejected(gap in 2u32..50) {
        let mut harness = Harness::new(TokenType::Fat0, -1);
        harness.apply(vec![harness.fat0_coinbase(0, 10)]);
        let before = harness.chain.metadata().clone();

        let block = harness.build(harness.prev.sequence + gap, vec![harness.fat0_coinbase(1, 5)]);
        let result = harness.chain.apply_block(&block);
        prop_assert!(matches!(result, Err(Error::ChainDiscontinuity(_))));
        prop_assert_eq!(harness.chain.metadata(), &before);
        prop_assert_eq!(harness.balances(), vec![10, 0, 0, 0]);
    }

    /// Entries survive the binary codec and keep their hash
    #[test]
    fn test_entry_roundtrip(
        chain_id in prop::array::uniform32(any::<u8>()),
        ext_ids in prop::collection::vec(prop::collection::vec(any::<u8>(), 0..40), 0..5),
        content in prop::collection::vec(any::<u8>(), 0..512),
    ) {
        let ts = DateTime::from_timestamp(1_600_000_000, 0).unwrap();
        let entry = Entry::new(Bytes32(chain_id), ext_ids.clone(), content.clone(), ts);
        let data = entry.marshal_binary().unwrap();

        let decoded = Entry::unmarshal_binary(&data).unwrap();
        prop_assert_eq!(decoded.chain_id, Bytes32(chain_id));
        prop_assert_eq!(decoded.ext_ids, ext_ids);
        prop_assert_eq!(decoded.content, content);
        prop_assert_eq!(decoded.hash, Some(compute_hash(&data)));
    }

    /// NFTokens JSON is canonical: it parses back to the same set and
    /// never spends more characters than listing every ID
    #[test]
    fn test_nftokens_canonical(ids in prop::collection::btree_set(0u64..10_000, 1..200)) {
        let tokens = NfTokens::from_ids(ids.iter().copied()).unwrap();
        let json = tokens.to_json().unwrap();

        let parsed = NfTokens::from_json(json.as_bytes()).unwrap();
        prop_assert_eq!(&parsed, &tokens);
        prop_assert_eq!(parsed.to_json().unwrap(), json.clone());

        let listed = serde_json::to_string(&ids.iter().collect::<Vec<_>>()).unwrap();
        prop_assert!(json.len() <= listed.len());
    }
}
