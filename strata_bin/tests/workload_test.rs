use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;

use clap::Parser;
use strata::{Store, StoreOptions};
use strata_bin::cli::Cli;
use strata_bin::workload::{Workload, WorkloadConfig, BLOB_SIZES};
use tempfile::{tempdir, TempDir};

fn cli_for(db: &Path, extra: &[&str]) -> Cli {
    let mut args = vec![
        "strata-bench".to_string(),
        "--db".to_string(),
        db.display().to_string(),
        "--ops".to_string(),
        "200".to_string(),
        "--batch-size".to_string(),
        "50".to_string(),
    ];
    args.extend(extra.iter().map(|arg| arg.to_string()));
    Cli::parse_from(args)
}

fn scratch() -> (TempDir, PathBuf) {
    let dir = tempdir().unwrap();
    let db = dir.path().join("bench.db");
    (dir, db)
}

fn small_config(seed: u64) -> WorkloadConfig {
    WorkloadConfig {
        ops: 40,
        batch_size: 16,
        seed,
        ..WorkloadConfig::default()
    }
}

#[test]
fn test_full_run_reports_every_phase() {
    let (_dir, db) = scratch();
    let cli = cli_for(&db, &["--seed", "1"]);
    let mut out = Vec::new();
    let report = strata_bin::run(&cli, &mut out).unwrap();

    let expected = vec![
        ("Single INSERT", 20),
        ("Batch INSERT", 200),
        ("GET", 200),
        ("UPDATE", 100),
        ("UPSERT", 100),
        ("DELETE", 100),
        ("Mixed Transaction", 100),
        ("Read Transaction", 100),
    ];
    let phases: Vec<(&str, usize)> = report
        .results
        .phases
        .iter()
        .map(|phase| (phase.name.as_str(), phase.count))
        .collect();
    assert_eq!(phases, expected);

    // 220 inserted, 100 deleted, plus whatever the mixed phase added.
    let scan = report.results.scan.as_ref().unwrap();
    assert!(scan.rows >= 120 && scan.rows <= 220, "{}", scan.rows);
    assert_eq!(scan.key_bytes, scan.rows * 32);
    assert_eq!(scan.value_bytes, scan.rows * 128);

    let sizes: Vec<usize> = report
        .results
        .blob_sizes
        .iter()
        .map(|blob| blob.value_size)
        .collect();
    assert_eq!(sizes, BLOB_SIZES.to_vec());
    assert!(report.final_stats.last_txid > 0);

    let text = String::from_utf8(out).unwrap();
    assert!(text.contains("Single INSERT Results:"));
    assert!(text.contains("Scanned "));
    assert!(text.contains("Size 65536 bytes: INSERT"));
    assert!(text.contains("Benchmark completed!"));

    // Without --keep the files this run created are gone.
    assert!(!db.exists());
    assert!(!strata::wal::path_for(&db).exists());
}

#[test]
fn test_keep_leaves_an_empty_database() {
    let (_dir, db) = scratch();
    let cli = cli_for(&db, &["--seed", "2", "--keep"]);
    strata_bin::run(&cli, &mut Vec::new()).unwrap();

    assert!(db.exists());
    let store = Store::open(&db, StoreOptions::default()).unwrap();
    assert!(store.is_empty());
    store.verify().unwrap();
}

#[test]
fn test_same_seed_same_data() {
    let rows = |seed: &str| {
        let (_dir, db) = scratch();
        let cli = cli_for(&db, &["--seed", seed]);
        let report = strata_bin::run(&cli, &mut Vec::new()).unwrap();
        report.results.scan.unwrap().rows
    };
    assert_eq!(rows("9"), rows("9"));
}

#[test]
fn test_config_file_is_applied() {
    let (dir, db) = scratch();
    let config = dir.path().join("store.json");
    fs::write(
        &config,
        r#"{ "page_size": 8192, "checkpoint_threshold": 64 }"#,
    )
    .unwrap();
    let cli = cli_for(
        &db,
        &["--seed", "3", "--keep", "--config", config.to_str().unwrap()],
    );
    let report = strata_bin::run(&cli, &mut Vec::new()).unwrap();
    assert_eq!(report.options.page_size, 8192);

    let store = Store::open(&db, StoreOptions::default()).unwrap();
    assert_eq!(store.page_size(), 8192);
}

#[test]
fn test_invalid_arguments_fail() {
    let (_dir, db) = scratch();
    let mut cli = cli_for(&db, &[]);
    cli.ops = 0;
    assert!(strata_bin::run(&cli, &mut Vec::new()).is_err());
    assert!(!db.exists());
}

#[test]
fn test_key_size_over_page_limit_fails_before_any_phase() {
    let (_dir, db) = scratch();
    let cli = cli_for(&db, &["--key-size", "2000"]);
    let mut out = Vec::new();
    let err = strata_bin::run(&cli, &mut out).unwrap_err();
    assert!(err.to_string().contains("--key-size 2000"), "{err}");
    assert!(out.is_empty());
    assert!(!db.exists());
}

#[test]
fn test_phases_need_stored_keys() {
    let (_dir, db) = scratch();
    let store = Store::open(&db, StoreOptions::default()).unwrap();
    let mut workload = Workload::new(&store, small_config(4));

    assert_eq!(workload.get(10).unwrap().count, 0);
    assert_eq!(workload.update(10).unwrap().count, 0);
    assert_eq!(workload.delete(10).unwrap().count, 0);

    workload.batch_insert(40).unwrap();
    assert_eq!(store.len(), 40);
    assert_eq!(workload.get(10).unwrap().count, 10);

    // Deletes stop at the number of stored keys.
    assert_eq!(workload.delete(100).unwrap().count, 40);
    assert!(store.is_empty());
}

#[test]
fn test_blob_size_phase_clears_the_store() {
    let (_dir, db) = scratch();
    let store = Store::open(&db, StoreOptions::default()).unwrap();
    let mut workload = Workload::new(&store, small_config(5));
    workload.batch_insert(40).unwrap();

    let blob = workload.blob_size(20_000).unwrap();
    assert_eq!(blob.ops, 4);
    assert_eq!(blob.value_size, 20_000);
    assert!(store.is_empty());
    assert_eq!(store.verify().unwrap().overflow_pages, 0);
}

#[test]
fn test_binary_writes_reports() {
    let dir = tempdir().unwrap();
    let db = dir.path().join("cli.db");
    let out_json = dir.path().join("reports").join("run.json");
    let output = Command::new(env!("CARGO_BIN_EXE_strata-bench"))
        .args(["--ops", "30", "--batch-size", "10", "--seed", "6"])
        .arg("--db")
        .arg(&db)
        .arg("--out-json")
        .arg(&out_json)
        .env_remove("STRATA_FAILPOINTS")
        .output()
        .unwrap();
    assert!(output.status.success(), "{output:?}");

    let json: serde_json::Value =
        serde_json::from_str(&fs::read_to_string(&out_json).unwrap()).unwrap();
    assert_eq!(json["workload"]["ops"], 30);
    assert_eq!(json["results"]["phases"].as_array().unwrap().len(), 8);
    let csv = fs::read_to_string(out_json.with_extension("csv")).unwrap();
    assert!(csv.starts_with("phase,count"));
    assert!(String::from_utf8_lossy(&output.stdout).contains("JSON report:"));
}
