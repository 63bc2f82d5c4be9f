use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use tracing_subscriber::EnvFilter;

/// Copies the IPv4/TCP frames of a capture into a new capture.
#[derive(Parser)]
struct Opts {
    input: PathBuf,
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

    let stats = tcpextract::filter_capture(&opts.input, &opts.output).with_context(|| {
        format!(
            "filtering {} into {} failed",
            opts.input.display(),
            opts.output.display()
        )
    })?;

    println!(
        "TCP frames saved to {}: kept {} of {}",
        opts.output.display(),
        stats.kept,
        stats.frames
    );

    Ok(())
}
