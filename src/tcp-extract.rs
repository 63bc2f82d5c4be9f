use std::{num::NonZeroUsize, path::PathBuf};

use anyhow::Context;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use tcpextract::{extract, ExtractOptions};

/// Writes one CSV row per TCP frame of every input capture.
#[derive(Parser)]
struct Opts {
    /// Capture files, processed concurrently
    #[clap(required = true)]
    inputs: Vec<PathBuf>,
    /// CSV table to create, overwritten if it exists
    #[clap(long, short = 'o', default_value = "data.csv")]
    output: PathBuf,
    /// Maximum number of worker threads, one per input by default
    #[clap(long, short = 'j')]
    jobs: Option<NonZeroUsize>,
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

    let mut options = ExtractOptions::new(&opts.output);
    if let Some(jobs) = opts.jobs {
        options = options.workers(jobs);
    }

    let summary = extract(&opts.inputs, &options)
        .with_context(|| format!("extraction into {} failed", opts.output.display()))?;

    for file in &summary.files {
        match &file.outcome {
            Ok(stats) => println!(
                "finished {}: {} frames, {} records",
                file.path.display(),
                stats.frames,
                stats.records
            ),
            Err(err) => eprintln!("error: {err}"),
        }
    }
    println!(
        "Processing finished: {} records written to {}",
        summary.records(),
        opts.output.display()
    );

    Ok(())
}
