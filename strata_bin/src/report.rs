//! JSON and CSV output of a benchmark run.
use std::error::Error;
use std::fs;
use std::path::{Path, PathBuf};

use chrono::Utc;
use serde::Serialize;
use strata::{StoreOptions, StoreStats};

use crate::workload::{WorkloadConfig, WorkloadReport};

#[derive(Debug, Serialize)]
pub struct RunReport {
    pub generated_at_utc: String,
    pub database: String,
    pub workload: WorkloadConfig,
    pub options: StoreOptions,
    pub results: WorkloadReport,
    pub final_stats: StoreStats,
}

impl RunReport {
    pub fn new(
        database: &Path,
        workload: WorkloadConfig,
        options: StoreOptions,
        results: WorkloadReport,
        stats: StoreStats,
    ) -> Self {
        Self {
            generated_at_utc: Utc::now().to_rfc3339(),
            database: database.display().to_string(),
            workload,
            options,
            results,
            final_stats: stats,
        }
    }
}

pub fn default_out_json_path() -> PathBuf {
    let timestamp = Utc::now().format("%Y%m%d-%H%M%S");
    PathBuf::from("target")
        .join("benchmarks")
        .join(format!("strata-{timestamp}.json"))
}

/// Writes `out_json` and a CSV of the phase table beside it. Returns the CSV path.
pub fn write_report_files(report: &RunReport, out_json: &Path) -> Result<PathBuf, Box<dyn Error>> {
    if let Some(parent) = out_json.parent() {
        fs::create_dir_all(parent)?;
    }

    let json = serde_json::to_string_pretty(report)?;
    fs::write(out_json, json)?;

    let out_csv = out_json.with_extension("csv");
    fs::write(&out_csv, to_csv(&report.results))?;
    Ok(out_csv)
}

pub fn to_csv(results: &WorkloadReport) -> String {
    let mut csv =
        String::from("phase,count,total_ms,avg_us,min_us,p50_us,p95_us,max_us,ops_per_sec\n");
    for phase in &results.phases {
        csv.push_str(&format!(
            "{},{},{:.3},{:.3},{:.3},{:.3},{:.3},{:.3},{:.2}\n",
            phase.name,
            phase.count,
            phase.total_ms,
            phase.avg_us,
            phase.min_us,
            phase.p50_us,
            phase.p95_us,
            phase.max_us,
            phase.ops_per_sec
        ));
    }
    if let Some(scan) = &results.scan {
        csv.push_str(&format!(
            "Full SCAN,{},{:.3},{:.3},,,,,{:.2}\n",
            scan.rows,
            scan.total_ms,
            scan.us_per_row(),
            scan.rows_per_sec()
        ));
    }
    for blob in &results.blob_sizes {
        csv.push_str(&format!(
            "INSERT {}B,{},{:.3},{:.3},,,,,{:.2}\n",
            blob.value_size,
            blob.ops,
            blob.total_ms(),
            blob.us_per_op,
            blob.ops_per_sec()
        ));
    }
    csv
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stats::{BenchmarkStats, BlobSizeStats, ScanStats};

    fn sample() -> WorkloadReport {
        WorkloadReport {
            phases: vec![
                BenchmarkStats::from_samples("GET", &[1.0, 2.0, 3.0]),
                BenchmarkStats::from_total("Batch INSERT", 10, 100.0),
            ],
            scan: Some(ScanStats {
                rows: 10,
                key_bytes: 320,
                value_bytes: 1280,
                total_ms: 1.0,
            }),
            blob_sizes: vec![BlobSizeStats::new(16, 10, 20.0)],
        }
    }

    #[test]
    fn csv_has_one_row_per_result() {
        let csv = to_csv(&sample());
        let lines: Vec<&str> = csv.lines().collect();
        assert_eq!(lines.len(), 5);
        assert!(lines[0].starts_with("phase,count"));
        assert!(lines[1].starts_with("GET,3,"));
        assert!(lines[3].starts_with("Full SCAN,10,"));
        assert_eq!(lines[4], "INSERT 16B,10,0.020,2.000,,,,,500000.00");
    }

    #[test]
    fn report_files_are_written() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("nested").join("run.json");
        let report = RunReport {
            generated_at_utc: Utc::now().to_rfc3339(),
            database: "bench.db".to_string(),
            workload: WorkloadConfig::default(),
            options: StoreOptions::default(),
            results: sample(),
            final_stats: StoreStats {
                page_count: 2,
                last_txid: 1,
                ..StoreStats::default()
            },
        };
        let csv_path = write_report_files(&report, &out).unwrap();
        assert_eq!(csv_path, dir.path().join("nested").join("run.csv"));

        let json: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(&out).unwrap()).unwrap();
        assert_eq!(json["results"]["phases"][0]["name"], "GET");
        assert_eq!(json["workload"]["ops"], 10_000);
        assert_eq!(json["final_stats"]["last_txid"], 1);
        assert!(fs::read_to_string(csv_path).unwrap().contains("Batch INSERT,10,"));
    }
}
