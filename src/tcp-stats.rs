use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use tcpextract::stats::{summarize_file, write_summary};

/// Summarizes the connections of a table written by tcp-extract as JSON.
#[derive(Parser)]
struct Opts {
    /// CSV table written by tcp-extract
    #[clap(default_value = "data.csv")]
    input: PathBuf,
    /// JSON file to create, overwritten if it exists
    #[clap(long, short = 'o', default_value = "stats_metricas.json")]
    output: PathBuf,
    #[clap(long, short = 'v', parse(from_occurrences))]
    verbose: u8,
}

fn main() -> anyhow::Result<()> {
    let opts = Opts::parse();

    let filter = match opts.verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| filter.into()))
        .init();

    let summary = summarize_file(&opts.input)
        .with_context(|| format!("cannot summarize {}", opts.input.display()))?;
    write_summary(&opts.output, &summary)?;

    println!(
        "Summary of {} connections ({} rows) written to {}",
        summary.connections.len(),
        summary.rows,
        opts.output.display()
    );
    if summary.skipped_rows > 0 {
        eprintln!("{} rows were skipped", summary.skipped_rows);
    }

    Ok(())
}
