//! Metrics collection for observability
//!
//! This module provides Prometheus metrics for monitoring block application.
//!
//! # Metrics
//!
//! - `fat_blocks_applied_total` - Entry blocks applied
//! - `fat_entries_applied_total` - Entries applied as valid
//! - `fat_entries_invalid_total` - Entries rejected
//! - `fat_block_apply_duration_seconds` - Histogram of block apply latencies
//! - `fat_chains_tracked` - Chains with an open store

use crate::chain::BlockSummary;
use prometheus::{Encoder, Histogram, HistogramOpts, IntCounter, IntGauge, Registry, TextEncoder};
use std::sync::Arc;

/// Metrics collector
#[derive(Clone)]
pub struct Metrics {
    /// Entry blocks applied
    pub blocks_applied: IntCounter,

    /// Entries applied as valid
    pub entries_applied: IntCounter,

    /// Entries rejected
    pub entries_invalid: IntCounter,

    /// Block apply duration histogram
    pub block_apply_duration: Histogram,

    /// Chains with an open store
    pub chains_tracked: IntGauge,

    /// Prometheus registry
    pub registry: Arc<Registry>,
}

impl std::fmt::Debug for Metrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Metrics")
            .field("blocks_applied", &self.blocks_applied.get())
            .field("chains_tracked", &self.chains_tracked.get())
            .finish()
    }
}

impl Metrics {
    /// Create new metrics collector with its own registry
    pub fn new() -> prometheus::Result<Self> {
        let registry = Arc::new(Registry::new());

        let blocks_applied =
            IntCounter::new("fat_blocks_applied_total", "Total number of entry blocks applied")?;
        registry.register(Box::new(blocks_applied.clone()))?;

        let entries_applied =
            IntCounter::new("fat_entries_applied_total", "Total number of valid entries")?;
        registry.register(Box::new(entries_applied.clone()))?;

        let entries_invalid =
            IntCounter::new("fat_entries_invalid_total", "Total number of rejected entries")?;
        registry.register(Box::new(entries_invalid.clone()))?;

        let block_apply_duration = Histogram::with_opts(
            HistogramOpts::new(
                "fat_block_apply_duration_seconds",
                "Histogram of entry block apply latencies",
            )
            .buckets(vec![0.001, 0.005, 0.010, 0.025, 0.050, 0.100, 0.250, 0.500, 1.0]),
        )?;
        registry.register(Box::new(block_apply_duration.clone()))?;

        let chains_tracked = IntGauge::new("fat_chains_tracked", "Number of tracked chains")?;
        registry.register(Box::new(chains_tracked.clone()))?;

        Ok(Self {
            blocks_applied,
            entries_applied,
            entries_invalid,
            block_apply_duration,
            chains_tracked,
            registry,
        })
    }

    /// Record an applied block
    pub fn record_block(&self, summary: &BlockSummary, duration_seconds: f64) {
        self.blocks_applied.inc();
        self.entries_applied.inc_by(summary.valid as u64);
        self.entries_invalid.inc_by(summary.invalid as u64);
        self.block_apply_duration.observe(duration_seconds);
    }

    /// Update the tracked chain count
    pub fn set_chains_tracked(&self, count: usize) {
        self.chains_tracked.set(count as i64);
    }

    /// Get metrics registry
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Encode all metrics in the Prometheus text format
    pub fn encode_text(&self) -> crate::Result<String> {
        let mut buffer = Vec::new();
        TextEncoder::new()
            .encode(&self.registry.gather(), &mut buffer)
            .map_err(|e| crate::Error::Config(format!("Failed to encode metrics: {}", e)))?;
        String::from_utf8(buffer)
            .map_err(|e| crate::Error::Config(format!("Failed to encode metrics: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_creation() {
        let metrics = Metrics::new().unwrap();
        assert_eq!(metrics.blocks_applied.get(), 0);
        assert_eq!(metrics.chains_tracked.get(), 0);

        // Each collector owns its registry
        assert!(Metrics::new().is_ok());
    }

    #[test]
    fn test_record_block() {
        let metrics = Metrics::new().unwrap();
        let summary = BlockSummary {
            sequence: 3,
            entries: 5,
            valid: 3,
            invalid: 2,
        };
        metrics.record_block(&summary, 0.002);
        metrics.record_block(&summary, 0.004);

        assert_eq!(metrics.blocks_applied.get(), 2);
        assert_eq!(metrics.entries_applied.get(), 6);
        assert_eq!(metrics.entries_invalid.get(), 4);
        assert_eq!(metrics.block_apply_duration.get_sample_count(), 2);
    }

    #[test]
    fn test_encode_text() {
        let metrics = Metrics::new().unwrap();
        metrics.set_chains_tracked(4);
        let text = metrics.encode_text().unwrap();
        assert!(text.contains("fat_chains_tracked 4"));
        assert!(text.contains("fat_blocks_applied_total 0"));
    }
}
