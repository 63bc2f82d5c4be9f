use std::{io, path::PathBuf};

use pcap_file::PcapError;
use thiserror::Error;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("no input files given")]
    NoInputs,

    #[error("cannot open {}: {source}", path.display())]
    OpenInput { path: PathBuf, source: io::Error },

    #[error("cannot read capture {}: {source}", path.display())]
    ReadCapture { path: PathBuf, source: PcapError },

    #[error("cannot create {}: {source}", path.display())]
    CreateOutput { path: PathBuf, source: io::Error },

    #[error("cannot write capture {}: {source}", path.display())]
    WriteCapture { path: PathBuf, source: PcapError },

    #[error("cannot write {}: {source}", path.display())]
    WriteOutput { path: PathBuf, source: io::Error },

    #[error("cannot read table {}: {source}", path.display())]
    ReadTable { path: PathBuf, source: csv::Error },

    #[error("cannot write summary {}: {source}", path.display())]
    WriteSummary {
        path: PathBuf,
        source: serde_json::Error,
    },

    #[error("cannot encode csv row: {0}")]
    Encode(#[from] csv::Error),

    /// Every input of an extraction run failed, so nothing was extracted.
    #[error("none of the {0} input files could be processed")]
    AllInputsFailed(usize),
}
