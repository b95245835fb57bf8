//! Command line arguments of the benchmark driver.
use std::error::Error;
use std::fs;
use std::path::{Path, PathBuf};

use clap::Parser;
use strata::node::NodeLayout;
use strata::StoreOptions;

use crate::workload::WorkloadConfig;

#[derive(Debug, Clone, Parser)]
#[command(
    name = "strata-bench",
    version,
    about = "Runs the key-value benchmark phases against a strata database"
)]
pub struct Cli {
    /// Database file. The WAL lives next to it.
    #[arg(long, default_value = "benchmark.strata")]
    pub db: PathBuf,

    /// Records inserted by the batch phase and lookups issued by the GET phase.
    #[arg(long, default_value_t = 10_000)]
    pub ops: usize,

    /// Records per commit in the batch insert phase.
    #[arg(long, default_value_t = 1_000)]
    pub batch_size: usize,

    #[arg(long, default_value_t = 32)]
    pub key_size: usize,

    #[arg(long, default_value_t = 128)]
    pub value_size: usize,

    /// RNG seed. A random one is drawn when omitted.
    #[arg(long)]
    pub seed: Option<u64>,

    /// JSON file with store options. `STRATA_*` variables override it.
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Where to write the JSON report. A CSV with the same stem is written next to it.
    #[arg(long)]
    pub out_json: Option<PathBuf>,

    /// Keep the database and its WAL after the run.
    #[arg(long)]
    pub keep: bool,
}

impl Cli {
    pub fn validate(&self) -> Result<(), String> {
        if self.ops == 0 {
            return Err("--ops must be at least 1".to_string());
        }
        if self.batch_size == 0 {
            return Err("--batch-size must be at least 1".to_string());
        }
        if self.key_size == 0 {
            return Err("--key-size must be at least 1".to_string());
        }
        Ok(())
    }

    /// Keys must fit the index pages of a database with `page_size`-byte pages.
    pub fn validate_key_size(&self, page_size: usize) -> Result<(), String> {
        let max_key = NodeLayout::new(page_size).max_key;
        if self.key_size > max_key {
            return Err(format!(
                "--key-size {} exceeds the {max_key}-byte key limit of {page_size}-byte pages",
                self.key_size
            ));
        }
        Ok(())
    }

    pub fn workload(&self, seed: u64) -> WorkloadConfig {
        WorkloadConfig {
            ops: self.ops,
            batch_size: self.batch_size,
            key_size: self.key_size,
            value_size: self.value_size,
            seed,
        }
    }

    /// Options from `--config` if given, then the environment on top.
    pub fn store_options(&self) -> Result<StoreOptions, Box<dyn Error>> {
        let base = match &self.config {
            Some(path) => load_options(path)?,
            None => StoreOptions::default(),
        };
        Ok(base.overlay_env()?)
    }
}

/// Reads store options from a JSON file. Missing fields keep their defaults.
pub fn load_options(path: &Path) -> Result<StoreOptions, Box<dyn Error>> {
    let raw = fs::read_to_string(path)
        .map_err(|err| format!("cannot read config {}: {err}", path.display()))?;
    let options: StoreOptions = serde_json::from_str(&raw)
        .map_err(|err| format!("invalid config {}: {err}", path.display()))?;
    options.validate()?;
    Ok(options)
}
