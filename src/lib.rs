//! Extraction of TCP header fields from offline pcap and pcapng captures into
//! CSV, reduction of captures to their IPv4/TCP frames, and connection
//! statistics over the extracted table.

pub mod error;
pub mod extract;
pub mod filter;
pub mod header;
pub mod link;
pub mod record;
pub mod source;
pub mod stats;

pub use error::{Error, Result};
pub use extract::{extract, ExtractOptions, FileReport, FileStats, OutputTable, RunSummary};
pub use filter::{filter_capture, filter_ng_stream, filter_stream, FilterStats};
pub use header::{is_ipv4_tcp, parse_frame, scan_mss, TcpFlags, TcpRecord};
pub use link::LinkType;
pub use source::{open_capture, CaptureFormat, CaptureReader, Frame};
pub use stats::{summarize, summarize_file, write_summary, Summary};
