//! The benchmark phases, run in a fixed order against one store.
//!
//! Keys are random fixed-width blobs. The batch insert phase keeps its keys so
//! that lookups, updates and deletes hit records that exist.
use std::time::Instant;

use rand::rngs::StdRng;
use rand::{Rng, RngCore, SeedableRng};
use serde::Serialize;
use strata::{Result, Store, StoreError};
use tracing::{debug, info, warn};

use crate::stats::{BenchmarkStats, BlobSizeStats, ScanStats};

/// Value sizes exercised by the last phase.
pub const BLOB_SIZES: [usize; 7] = [16, 64, 256, 1024, 4096, 16384, 65536];

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WorkloadConfig {
    /// Size of the main key set and of the lookup phases.
    pub ops: usize,
    pub batch_size: usize,
    pub key_size: usize,
    pub value_size: usize,
    pub seed: u64,
}

impl Default for WorkloadConfig {
    fn default() -> Self {
        Self {
            ops: 10_000,
            batch_size: 1_000,
            key_size: 32,
            value_size: 128,
            seed: 0,
        }
    }
}

impl WorkloadConfig {
    /// Auto-commit inserts, one fsync each.
    pub fn single_ops(&self) -> usize {
        (self.ops / 10).max(1)
    }

    /// Updates, upserts, deletes and the two transaction phases.
    pub fn half_ops(&self) -> usize {
        (self.ops / 2).max(1)
    }

    /// Inserts per value size in the blob size phase.
    pub fn blob_ops(&self) -> usize {
        (self.ops / 10).max(1)
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct WorkloadReport {
    pub phases: Vec<BenchmarkStats>,
    pub scan: Option<ScanStats>,
    pub blob_sizes: Vec<BlobSizeStats>,
}

impl WorkloadReport {
    pub fn phase(&self, name: &str) -> Option<&BenchmarkStats> {
        self.phases.iter().find(|stats| stats.name == name)
    }
}

pub struct Workload<'s> {
    store: &'s Store,
    config: WorkloadConfig,
    rng: StdRng,
    keys: Vec<Vec<u8>>,
}

impl<'s> Workload<'s> {
    pub fn new(store: &'s Store, config: WorkloadConfig) -> Self {
        let rng = StdRng::seed_from_u64(config.seed);
        Self {
            store,
            config,
            rng,
            keys: Vec::new(),
        }
    }

    /// Runs every phase and returns their summaries.
    pub fn run(mut self) -> Result<WorkloadReport> {
        let mut report = WorkloadReport::default();
        let half = self.config.half_ops();

        report.phases.push(self.single_insert(self.config.single_ops())?);
        report.phases.push(self.batch_insert(self.config.ops)?);
        report.phases.push(self.get(self.config.ops)?);
        report.phases.push(self.update(half)?);
        report.phases.push(self.upsert(half)?);
        report.phases.push(self.delete(half)?);
        report.phases.push(self.mixed_transaction(half)?);
        report.phases.push(self.read_transaction(half)?);
        report.scan = Some(self.scan()?);

        clear(self.store)?;
        for size in BLOB_SIZES {
            report.blob_sizes.push(self.blob_size(size)?);
        }
        Ok(report)
    }

    fn blob(&mut self, len: usize) -> Vec<u8> {
        let mut buf = vec![0u8; len];
        self.rng.fill_bytes(&mut buf);
        buf
    }

    fn random_key(&mut self) -> Vec<u8> {
        self.blob(self.config.key_size)
    }

    fn value(&mut self) -> Vec<u8> {
        self.blob(self.config.value_size)
    }

    /// Phases that need stored keys report nothing when there are none.
    fn skip_without_keys(&self, name: &str) -> Option<BenchmarkStats> {
        if !self.keys.is_empty() {
            return None;
        }
        warn!(phase = name, "no stored keys, skipping");
        Some(BenchmarkStats::from_samples(name, &[]))
    }

    fn stored_key(&mut self) -> Vec<u8> {
        let idx = self.rng.gen_range(0..self.keys.len());
        self.keys[idx].clone()
    }

    pub fn single_insert(&mut self, count: usize) -> Result<BenchmarkStats> {
        info!(count, "phase: single auto-commit insert");
        let mut samples = Vec::with_capacity(count);
        for _ in 0..count {
            let key = self.random_key();
            let value = self.value();
            let start = Instant::now();
            self.store.put(&key, &value)?;
            samples.push(elapsed_us(start));
        }
        Ok(BenchmarkStats::from_samples("Single INSERT", &samples))
    }

    /// Inserts `count` records, committing every `batch_size`, and keeps the keys.
    pub fn batch_insert(&mut self, count: usize) -> Result<BenchmarkStats> {
        info!(count, batch = self.config.batch_size, "phase: batch insert");
        let batch_size = self.config.batch_size.max(1);
        let store = self.store;
        self.keys.reserve(count);

        let start = Instant::now();
        let mut tx = store.begin()?;
        for i in 0..count {
            let key = self.random_key();
            let value = self.value();
            tx.put(&key, &value)?;
            self.keys.push(key);
            if (i + 1) % batch_size == 0 {
                let info = tx.commit()?;
                debug!(txid = info.txid, frames = info.frames, "batch committed");
                tx = store.begin()?;
            }
        }
        tx.commit()?;
        Ok(BenchmarkStats::from_total(
            "Batch INSERT",
            count,
            elapsed_us(start),
        ))
    }

    pub fn get(&mut self, count: usize) -> Result<BenchmarkStats> {
        info!(count, "phase: point get");
        if let Some(skipped) = self.skip_without_keys("GET") {
            return Ok(skipped);
        }
        let mut samples = Vec::with_capacity(count);
        for _ in 0..count {
            let key = self.stored_key();
            let start = Instant::now();
            self.store.get(&key)?;
            samples.push(elapsed_us(start));
        }
        Ok(BenchmarkStats::from_samples("GET", &samples))
    }

    pub fn update(&mut self, count: usize) -> Result<BenchmarkStats> {
        info!(count, "phase: update");
        if let Some(skipped) = self.skip_without_keys("UPDATE") {
            return Ok(skipped);
        }
        let mut samples = Vec::with_capacity(count);
        for _ in 0..count {
            let key = self.stored_key();
            let value = self.value();
            let start = Instant::now();
            ignore_missing(self.store.update(&key, &value))?;
            samples.push(elapsed_us(start));
        }
        Ok(BenchmarkStats::from_samples("UPDATE", &samples))
    }

    /// Insert-or-replace inside a single transaction.
    pub fn upsert(&mut self, count: usize) -> Result<BenchmarkStats> {
        info!(count, "phase: upsert");
        if let Some(skipped) = self.skip_without_keys("UPSERT") {
            return Ok(skipped);
        }
        let store = self.store;
        let mut samples = Vec::with_capacity(count);
        let mut tx = store.begin()?;
        for _ in 0..count {
            let key = self.stored_key();
            let value = self.value();
            let start = Instant::now();
            tx.put(&key, &value)?;
            samples.push(elapsed_us(start));
        }
        tx.commit()?;
        Ok(BenchmarkStats::from_samples("UPSERT", &samples))
    }

    /// Deletes the oldest stored keys, each in its own transaction.
    pub fn delete(&mut self, count: usize) -> Result<BenchmarkStats> {
        let count = count.min(self.keys.len());
        info!(count, "phase: delete");
        let mut samples = Vec::with_capacity(count);
        for i in 0..count {
            let start = Instant::now();
            self.store.delete(&self.keys[i])?;
            samples.push(elapsed_us(start));
        }
        Ok(BenchmarkStats::from_samples("DELETE", &samples))
    }

    /// Random inserts, updates and lookups in one transaction.
    pub fn mixed_transaction(&mut self, count: usize) -> Result<BenchmarkStats> {
        info!(count, "phase: mixed transaction");
        if let Some(skipped) = self.skip_without_keys("Mixed Transaction") {
            return Ok(skipped);
        }
        let store = self.store;
        let start = Instant::now();
        let mut tx = store.begin()?;
        for _ in 0..count {
            let op = self.rng.gen_range(0..3);
            let existing = self.stored_key();
            let value = self.value();
            match op {
                0 => {
                    let key = self.random_key();
                    tx.put(&key, &value)?;
                }
                1 => ignore_missing(tx.update(&existing, &value))?,
                _ => {
                    tx.get(&existing)?;
                }
            }
        }
        tx.commit()?;
        Ok(BenchmarkStats::from_total(
            "Mixed Transaction",
            count,
            elapsed_us(start),
        ))
    }

    /// Point lookups against one pinned snapshot.
    pub fn read_transaction(&mut self, count: usize) -> Result<BenchmarkStats> {
        info!(count, "phase: read transaction");
        if let Some(skipped) = self.skip_without_keys("Read Transaction") {
            return Ok(skipped);
        }
        let start = Instant::now();
        let snapshot = self.store.snapshot();
        for _ in 0..count {
            let key = self.stored_key();
            self.store.get_at(&snapshot, &key)?;
        }
        drop(snapshot);
        Ok(BenchmarkStats::from_total(
            "Read Transaction",
            count,
            elapsed_us(start),
        ))
    }

    pub fn scan(&mut self) -> Result<ScanStats> {
        info!("phase: full scan");
        let start = Instant::now();
        let mut stats = ScanStats {
            rows: 0,
            key_bytes: 0,
            value_bytes: 0,
            total_ms: 0.0,
        };
        for item in self.store.scan() {
            let (key, value) = item?;
            stats.rows += 1;
            stats.key_bytes += key.len();
            stats.value_bytes += value.len();
        }
        stats.total_ms = elapsed_us(start) / 1000.0;
        Ok(stats)
    }

    /// Inserts values of one size in a single transaction, then empties the store.
    pub fn blob_size(&mut self, size: usize) -> Result<BlobSizeStats> {
        let ops = self.config.blob_ops();
        info!(size, ops, "phase: blob size");
        let store = self.store;
        let start = Instant::now();
        let mut tx = store.begin()?;
        for _ in 0..ops {
            let key = self.random_key();
            let value = self.blob(size);
            tx.put(&key, &value)?;
        }
        tx.commit()?;
        let stats = BlobSizeStats::new(size, ops, elapsed_us(start));
        clear(self.store)?;
        Ok(stats)
    }
}

/// Deletes every record in one transaction. Returns how many were removed.
pub fn clear(store: &Store) -> Result<usize> {
    let keys = store
        .scan()
        .map(|item| item.map(|(key, _)| key))
        .collect::<Result<Vec<_>>>()?;
    let mut tx = store.begin()?;
    for key in &keys {
        tx.delete(key)?;
    }
    tx.commit()?;
    Ok(keys.len())
}

/// A write-if-exists that finds nothing is not a failure here.
fn ignore_missing(result: Result<()>) -> Result<()> {
    match result {
        Err(StoreError::NotFound) => Ok(()),
        other => other,
    }
}

fn elapsed_us(start: Instant) -> f64 {
    start.elapsed().as_secs_f64() * 1_000_000.0
}
