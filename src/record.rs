//! CSV encoding of extracted TCP records.

use std::net::Ipv4Addr;

use serde::Serialize;

use crate::{error::Result, header::TcpRecord};

pub const COLUMNS: [&str; 13] = [
    "timestamp",
    "src_ip",
    "src_port",
    "dst_ip",
    "dst_port",
    "protocol",
    "length",
    "flags",
    "seq",
    "ack",
    "window",
    "segmento_tcp_len",
    "mss",
];

/// Written in the `mss` column when no valid option was found.
pub const MSS_ABSENT: i32 = -1;

const PROTOCOL: &str = "TCP";

/// Row layout, fields in `COLUMNS` order.
#[derive(Debug, Serialize)]
struct CsvRow {
    timestamp: String,
    #[serde(serialize_with = "serialize_display")]
    src_ip: Ipv4Addr,
    src_port: u16,
    #[serde(serialize_with = "serialize_display")]
    dst_ip: Ipv4Addr,
    dst_port: u16,
    protocol: &'static str,
    length: u32,
    flags: String,
    seq: u32,
    ack: u32,
    window: u16,
    segmento_tcp_len: usize,
    mss: i32,
}

fn serialize_display<T, S>(value: &T, serializer: S) -> Result<S::Ok, S::Error>
where
    T: std::fmt::Display,
    S: serde::Serializer,
{
    serializer.collect_str(value)
}

impl From<&TcpRecord> for CsvRow {
    fn from(record: &TcpRecord) -> Self {
        Self {
            timestamp: format!(
                "{}.{:06}",
                record.timestamp.as_secs(),
                record.timestamp.subsec_micros()
            ),
            src_ip: *record.source.ip(),
            src_port: record.source.port(),
            dst_ip: *record.destination.ip(),
            dst_port: record.destination.port(),
            protocol: PROTOCOL,
            length: record.length,
            flags: record.flags.to_string(),
            seq: record.seq,
            ack: record.ack,
            window: record.window,
            segmento_tcp_len: record.payload_len,
            mss: record.mss.map_or(MSS_ABSENT, i32::from),
        }
    }
}

fn row_writer() -> csv::Writer<Vec<u8>> {
    csv::WriterBuilder::new()
        .has_headers(false)
        .terminator(csv::Terminator::Any(b'\n'))
        .buffer_capacity(256)
        .from_writer(Vec::with_capacity(128))
}

fn finish(writer: csv::Writer<Vec<u8>>) -> Result<Vec<u8>> {
    writer
        .into_inner()
        .map_err(|err| csv::Error::from(err.into_error()).into())
}

/// The header line, newline terminated.
pub fn header_row() -> Result<Vec<u8>> {
    let mut writer = row_writer();
    writer.write_record(COLUMNS)?;
    finish(writer)
}

/// Encodes one record as a newline terminated CSV line.
pub fn format_row(record: &TcpRecord) -> Result<Vec<u8>> {
    let mut writer = row_writer();
    writer.serialize(CsvRow::from(record))?;
    finish(writer)
}
