//! Timing summaries for benchmark phases.
use std::fmt;

use serde::Serialize;

const RULE: &str = "----------------------------------------";

/// Latency summary of one phase. Times are in microseconds unless the field
/// name says otherwise.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BenchmarkStats {
    pub name: String,
    pub count: usize,
    pub total_ms: f64,
    pub avg_us: f64,
    pub min_us: f64,
    pub max_us: f64,
    pub p50_us: f64,
    pub p95_us: f64,
    pub ops_per_sec: f64,
}

impl BenchmarkStats {
    /// Summarizes per-operation samples.
    pub fn from_samples(name: &str, samples_us: &[f64]) -> Self {
        let mut sorted = samples_us.to_vec();
        sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
        let total: f64 = sorted.iter().sum();
        let avg = if sorted.is_empty() {
            0.0
        } else {
            total / sorted.len() as f64
        };
        Self {
            name: name.to_string(),
            count: sorted.len(),
            total_ms: total / 1000.0,
            avg_us: avg,
            min_us: sorted.first().copied().unwrap_or(0.0),
            max_us: sorted.last().copied().unwrap_or(0.0),
            p50_us: percentile(&sorted, 0.50),
            p95_us: percentile(&sorted, 0.95),
            ops_per_sec: throughput(avg),
        }
    }

    /// Summarizes a phase timed as a whole, e.g. one batch transaction.
    /// Every operation is charged the average.
    pub fn from_total(name: &str, count: usize, elapsed_us: f64) -> Self {
        let avg = if count == 0 {
            0.0
        } else {
            elapsed_us / count as f64
        };
        Self {
            name: name.to_string(),
            count,
            total_ms: elapsed_us / 1000.0,
            avg_us: avg,
            min_us: avg,
            max_us: avg,
            p50_us: avg,
            p95_us: avg,
            ops_per_sec: throughput(avg),
        }
    }
}

impl fmt::Display for BenchmarkStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "\n{} Results:", self.name)?;
        writeln!(f, "  Total operations: {}", self.count)?;
        writeln!(f, "  Total time: {:.2} ms", self.total_ms)?;
        writeln!(f, "  Average time: {:.2} µs", self.avg_us)?;
        writeln!(f, "  Min time: {:.2} µs", self.min_us)?;
        writeln!(f, "  Max time: {:.2} µs", self.max_us)?;
        writeln!(f, "  p50 / p95: {:.2} / {:.2} µs", self.p50_us, self.p95_us)?;
        writeln!(f, "  Throughput: {:.2} ops/sec", self.ops_per_sec)?;
        write!(f, "{RULE}")
    }
}

/// Result of the full scan phase.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScanStats {
    pub rows: usize,
    pub key_bytes: usize,
    pub value_bytes: usize,
    pub total_ms: f64,
}

impl ScanStats {
    pub fn avg_key_bytes(&self) -> f64 {
        per_row(self.key_bytes as f64, self.rows)
    }

    pub fn avg_value_bytes(&self) -> f64 {
        per_row(self.value_bytes as f64, self.rows)
    }

    pub fn us_per_row(&self) -> f64 {
        per_row(self.total_ms * 1000.0, self.rows)
    }

    pub fn rows_per_sec(&self) -> f64 {
        if self.total_ms <= 0.0 {
            return 0.0;
        }
        self.rows as f64 * 1000.0 / self.total_ms
    }
}

impl fmt::Display for ScanStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "  Scanned {} rows", self.rows)?;
        writeln!(
            f,
            "  Total key bytes: {} (avg: {:.1} bytes)",
            self.key_bytes,
            self.avg_key_bytes()
        )?;
        writeln!(
            f,
            "  Total value bytes: {} (avg: {:.1} bytes)",
            self.value_bytes,
            self.avg_value_bytes()
        )?;
        writeln!(f, "  Total time: {:.2} ms", self.total_ms)?;
        writeln!(f, "  Average time per row: {:.2} µs", self.us_per_row())?;
        writeln!(f, "  Throughput: {:.2} rows/sec", self.rows_per_sec())?;
        write!(f, "{RULE}")
    }
}

/// Insert throughput for one value size.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BlobSizeStats {
    pub value_size: usize,
    pub ops: usize,
    pub us_per_op: f64,
    /// Value bytes per microsecond, which is also MB/s.
    pub mb_per_sec: f64,
}

impl BlobSizeStats {
    pub fn new(value_size: usize, ops: usize, elapsed_us: f64) -> Self {
        let mb_per_sec = if elapsed_us > 0.0 {
            (value_size * ops) as f64 / elapsed_us
        } else {
            0.0
        };
        Self {
            value_size,
            ops,
            us_per_op: per_row(elapsed_us, ops),
            mb_per_sec,
        }
    }

    pub fn total_ms(&self) -> f64 {
        self.us_per_op * self.ops as f64 / 1000.0
    }

    pub fn ops_per_sec(&self) -> f64 {
        if self.us_per_op > 0.0 {
            1_000_000.0 / self.us_per_op
        } else {
            0.0
        }
    }
}

impl fmt::Display for BlobSizeStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "  Size {} bytes: INSERT {:.2} µs/op ({:.2} MB/s)",
            self.value_size, self.us_per_op, self.mb_per_sec
        )
    }
}

/// Nearest-rank percentile over an ascending slice.
pub fn percentile(sorted: &[f64], p: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    let max_index = sorted.len() - 1;
    let idx = ((max_index as f64) * p).round() as usize;
    sorted[idx.min(max_index)]
}

fn throughput(avg_us: f64) -> f64 {
    if avg_us > 0.0 {
        1_000_000.0 / avg_us
    } else {
        0.0
    }
}

fn per_row(total: f64, rows: usize) -> f64 {
    if rows == 0 {
        0.0
    } else {
        total / rows as f64
    }
}
