//! Benchmark driver for the strata key-value store.
//!
//! Runs the classic key-value workload (single and batched inserts, point
//! lookups, updates, upserts, deletes, mixed and read-only transactions, a full
//! scan and a sweep over value sizes) and prints one summary per phase.

pub mod cli;

pub mod report;

pub mod stats;

pub mod workload;

use std::error::Error;
use std::fs;
use std::io::{self, Write};
use std::path::Path;

use rand::Rng;
use strata::Store;
use tracing::info;

use cli::Cli;
use report::RunReport;
use workload::Workload;

const BANNER: &str = "========================================";

/// Opens the database named by `cli`, runs every phase and prints the results
/// to `out`. Files the run created are removed afterwards unless `--keep`.
pub fn run(cli: &Cli, out: &mut impl Write) -> Result<RunReport, Box<dyn Error>> {
    cli.validate()?;
    let options = cli.store_options()?;
    cli.validate_key_size(options.page_size)?;
    let seed = cli.seed.unwrap_or_else(|| rand::thread_rng().gen());
    let config = cli.workload(seed);
    let existed = cli.db.exists();

    writeln!(out, "{BANNER}")?;
    writeln!(out, "strata Key-Value Store Benchmark")?;
    writeln!(
        out,
        "Key: {} bytes, Value: {} bytes, seed {seed}",
        config.key_size, config.value_size
    )?;
    writeln!(out, "{BANNER}")?;

    let store = Store::open(&cli.db, options.clone())?;
    // An existing database keeps its own page size.
    cli.validate_key_size(store.page_size())?;
    info!(db = %cli.db.display(), page_size = store.page_size(), "database opened");

    let results = Workload::new(&store, config.clone()).run()?;
    for phase in &results.phases {
        writeln!(out, "{phase}")?;
    }
    if let Some(scan) = &results.scan {
        writeln!(out, "\nFull SCAN Results:")?;
        writeln!(out, "{scan}")?;
    }
    writeln!(out, "\nVariable Value Sizes:")?;
    for blob in &results.blob_sizes {
        writeln!(out, "{blob}")?;
    }
    writeln!(out, "----------------------------------------")?;

    let stats = store.stats();
    store.close()?;
    let report = RunReport::new(&cli.db, config, options, results, stats);

    writeln!(out, "\nBenchmark completed!")?;
    if cli.keep || existed {
        writeln!(out, "Database file: {}", cli.db.display())?;
    } else {
        remove_database(&cli.db)?;
    }
    Ok(report)
}

fn remove_database(db: &Path) -> io::Result<()> {
    for path in [db.to_path_buf(), strata::wal::path_for(db)] {
        match fs::remove_file(&path) {
            Err(err) if err.kind() != io::ErrorKind::NotFound => return Err(err),
            _ => {}
        }
    }
    Ok(())
}
