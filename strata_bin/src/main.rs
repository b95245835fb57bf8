//! Command line entry point of the strata benchmark.

use clap::Parser;
use strata_bin::cli::Cli;
use strata_bin::report::{default_out_json_path, write_report_files};
use tracing_subscriber::{fmt, EnvFilter};

fn run() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    let report = strata_bin::run(&cli, &mut std::io::stdout().lock())?;

    let out_json = cli.out_json.clone().unwrap_or_else(default_out_json_path);
    let out_csv = write_report_files(&report, &out_json)?;
    println!("JSON report: {}", out_json.display());
    println!("CSV report:  {}", out_csv.display());
    Ok(())
}

fn main() {
    let _ = fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .try_init();

    if let Err(err) = run() {
        eprintln!("[strata-bench] error: {err}");
        std::process::exit(1);
    }
}
