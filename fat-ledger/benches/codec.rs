//! Codec benchmarks
//!
//! Hot paths of block application: entry hashing, transaction parsing,
//! NFTokens encoding and signature checks.

use chrono::DateTime;
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use fat_ledger::{
    crypto::{coinbase, KeyPair},
    entry::compute_hash,
    fat0::{self, AddressAmountMap},
    signature::{self, sign_entry_with_salt},
    Bytes32, Entry, NfTokens,
};
use std::collections::BTreeSet;

fn sample_entry(content_len: usize) -> Entry {
    let ts = DateTime::from_timestamp(1_600_000_000, 0).unwrap();
    Entry::new(
        Bytes32([0xab; 32]),
        vec![b"1600000000".to_vec(), vec![1; 33], vec![2; 64]],
        vec![b'x'; content_len],
        ts,
    )
}

fn bench_entry(c: &mut Criterion) {
    let mut group = c.benchmark_group("entry");
    for len in [128usize, 1024, 10_000] {
        let entry = sample_entry(len);
        let data = entry.marshal_binary().unwrap();
        group.bench_with_input(BenchmarkId::new("marshal", len), &entry, |b, e| {
            b.iter(|| black_box(e.marshal_binary().unwrap()))
        });
        group.bench_with_input(BenchmarkId::new("unmarshal", len), &data, |b, d| {
            b.iter(|| black_box(Entry::unmarshal_binary(d).unwrap()))
        });
        group.bench_with_input(BenchmarkId::new("hash", len), &data, |b, d| {
            b.iter(|| black_box(compute_hash(d)))
        });
    }
    group.finish();
}

fn bench_fat0(c: &mut Criterion) {
    let outputs: AddressAmountMap = (1..=16u8)
        .map(|seed| (KeyPair::from_seed(&[seed; 32]).address(), u64::from(seed) * 10))
        .collect();
    let total = outputs.sum().unwrap();
    let tx = fat0::Transaction::new(AddressAmountMap::from_iter([(coinbase(), total)]), outputs);
    let content = tx.to_content().unwrap();

    c.bench_function("fat0_parse_16_outputs", |b| {
        b.iter(|| black_box(fat0::Transaction::from_content(&content).unwrap()))
    });
}

fn bench_nftokens(c: &mut Criterion) {
    let mut group = c.benchmark_group("nftokens");
    let dense = NfTokens::from_ids(0..10_000).unwrap();
    let sparse = NfTokens::from_ids((0..2_000).map(|i| i * 3)).unwrap();
    for (name, tokens) in [("dense", &dense), ("sparse", &sparse)] {
        let json = tokens.to_json().unwrap();
        group.bench_function(BenchmarkId::new("to_json", name), |b| {
            b.iter(|| black_box(tokens.to_json().unwrap()))
        });
        group.bench_function(BenchmarkId::new("from_json", name), |b| {
            b.iter(|| black_box(NfTokens::from_json(json.as_bytes()).unwrap()))
        });
    }
    group.finish();
}

fn bench_signatures(c: &mut Criterion) {
    let now = DateTime::from_timestamp(1_600_000_000, 0).unwrap();
    let keys: Vec<KeyPair> = (1..=4u8).map(|s| KeyPair::from_seed(&[s; 32])).collect();
    let signers: Vec<&KeyPair> = keys.iter().collect();
    let expected: BTreeSet<Bytes32> = keys.iter().map(KeyPair::rcd_hash).collect();
    let entry = sign_entry_with_salt(sample_entry(256), &signers, now, now.timestamp());

    c.bench_function("validate_4_signatures", |b| {
        b.iter(|| black_box(signature::validate(&entry, &expected).unwrap()))
    });
}

criterion_group!(benches, bench_entry, bench_fat0, bench_nftokens, bench_signatures);
criterion_main!(benches);
