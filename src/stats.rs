//! Connection-level statistics over an extracted CSV table.
//!
//! Rows are grouped into bidirectional connections keyed by their two
//! endpoints, lowest endpoint first. Rows that do not deserialize, or whose
//! protocol is not TCP, are counted and left out.

use std::{
    collections::{BTreeMap, HashMap},
    fs::File,
    io::{self, BufReader, BufWriter, Write},
    net::{Ipv4Addr, SocketAddrV4},
    path::Path,
};

use serde::{Deserialize, Serialize};
use tracing::{debug, trace, warn};

use crate::{
    error::{Error, Result},
    record::MSS_ABSENT,
};

/// Length of every ranking in a [`Summary`].
pub const TOP_N: usize = 10;

/// The columns of an extractor row that the summary reads.
#[derive(Debug, Clone, Deserialize)]
struct Row {
    timestamp: f64,
    src_ip: Ipv4Addr,
    src_port: u16,
    dst_ip: Ipv4Addr,
    dst_port: u16,
    protocol: String,
    length: u32,
    flags: String,
    seq: u32,
    mss: i32,
}

impl Row {
    fn connection(&self) -> String {
        let a = SocketAddrV4::new(self.src_ip, self.src_port);
        let b = SocketAddrV4::new(self.dst_ip, self.dst_port);
        let (low, high) = if a <= b { (a, b) } else { (b, a) };
        format!("{low} <-> {high}")
    }

    fn has_flag(&self, letter: char) -> bool {
        self.flags.contains(letter)
    }

    fn is_syn_only(&self) -> bool {
        self.has_flag('S') && !self.has_flag('A')
    }

    fn is_syn_ack(&self) -> bool {
        self.has_flag('S') && self.has_flag('A')
    }

    fn is_ack_only(&self) -> bool {
        !self.has_flag('S') && self.has_flag('A')
    }
}

/// Figures for one bidirectional connection. Times are in seconds.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ConnectionStats {
    pub packets: u64,
    pub bytes: u64,
    pub duration: f64,
    /// Bytes per second over `duration`, 0 for a single instant.
    pub throughput: f64,
    /// First SYN to first SYN-ACK.
    pub rtt: Option<f64>,
    /// First SYN to first bare ACK.
    pub handshake: Option<f64>,
    /// Smallest MSS announced on the connection.
    pub mss: Option<u16>,
}

/// Descriptive statistics of segment lengths. Percentiles interpolate
/// linearly between the two nearest ranks.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Distribution {
    pub min: f64,
    pub max: f64,
    pub mean: f64,
    pub median: f64,
    pub std_dev: f64,
    pub p25: f64,
    pub p75: f64,
    pub p90: f64,
    pub p95: f64,
    pub p99: f64,
    pub count: usize,
}

impl Distribution {
    pub fn new(values: &[f64]) -> Option<Self> {
        if values.is_empty() {
            return None;
        }
        let mut sorted = values.to_vec();
        sorted.sort_by(f64::total_cmp);

        let count = sorted.len();
        let mean = sorted.iter().sum::<f64>() / count as f64;
        let variance = sorted.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / count as f64;
        let at = |p: f64| percentile(&sorted, p);

        Some(Self {
            min: sorted[0],
            max: sorted[count - 1],
            mean,
            median: at(50.0),
            std_dev: variance.sqrt(),
            p25: at(25.0),
            p75: at(75.0),
            p90: at(90.0),
            p95: at(95.0),
            p99: at(99.0),
            count,
        })
    }
}

/// `sorted` must be non-empty and ascending.
fn percentile(sorted: &[f64], p: f64) -> f64 {
    let rank = p / 100.0 * (sorted.len() - 1) as f64;
    let low = rank.floor() as usize;
    let high = rank.ceil() as usize;
    sorted[low] + (sorted[high] - sorted[low]) * (rank - low as f64)
}

/// One entry of a ranking.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Ranked<K> {
    pub key: K,
    pub count: u64,
}

/// Largest counts first, ties by ascending key.
fn top<K: Ord + Clone>(counts: &BTreeMap<K, u64>) -> Vec<Ranked<K>> {
    let mut ranked: Vec<_> = counts
        .iter()
        .map(|(key, &count)| Ranked {
            key: key.clone(),
            count,
        })
        .collect();
    ranked.sort_by(|a, b| b.count.cmp(&a.count).then_with(|| a.key.cmp(&b.key)));
    ranked.truncate(TOP_N);
    ranked
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Summary {
    /// TCP rows that went into the figures.
    pub rows: u64,
    /// Rows that did not deserialize or were not TCP.
    pub skipped_rows: u64,
    pub connections: BTreeMap<String, ConnectionStats>,
    /// Share of each source's rows whose `(src_ip, dst_ip, seq)` appears
    /// more than once.
    pub retransmission_rate: BTreeMap<Ipv4Addr, f64>,
    pub segment_lengths: Option<Distribution>,
    /// Connections carrying the most bytes.
    pub elephant_flows: Vec<Ranked<String>>,
    /// Busiest whole seconds by packet count.
    pub microbursts: Vec<Ranked<u64>>,
    pub top_ports: Vec<Ranked<u16>>,
    pub top_destinations: Vec<Ranked<Ipv4Addr>>,
}

#[derive(Debug, Default)]
struct Connection {
    packets: u64,
    bytes: u64,
    first: Option<f64>,
    last: Option<f64>,
    syn: Option<f64>,
    syn_ack: Option<f64>,
    ack: Option<f64>,
    mss: Option<u16>,
}

fn earliest(current: Option<f64>, t: f64) -> Option<f64> {
    Some(current.map_or(t, |current| current.min(t)))
}

impl Connection {
    fn add(&mut self, row: &Row) {
        let t = row.timestamp;
        self.packets += 1;
        self.bytes += u64::from(row.length);
        self.first = earliest(self.first, t);
        self.last = Some(self.last.map_or(t, |last| last.max(t)));
        if row.is_syn_only() {
            self.syn = earliest(self.syn, t);
        }
        if row.is_syn_ack() {
            self.syn_ack = earliest(self.syn_ack, t);
        }
        if row.is_ack_only() {
            self.ack = earliest(self.ack, t);
        }
        if row.mss != MSS_ABSENT {
            if let Ok(mss) = u16::try_from(row.mss) {
                self.mss = Some(self.mss.map_or(mss, |current| current.min(mss)));
            }
        }
    }

    fn finish(&self) -> ConnectionStats {
        let duration = match (self.first, self.last) {
            (Some(first), Some(last)) => last - first,
            _ => 0.0,
        };
        let since_syn = |to: Option<f64>| match (self.syn, to) {
            (Some(syn), Some(to)) if to >= syn => Some(to - syn),
            _ => None,
        };
        ConnectionStats {
            packets: self.packets,
            bytes: self.bytes,
            duration,
            throughput: if duration > 0.0 {
                self.bytes as f64 / duration
            } else {
                0.0
            },
            rtt: since_syn(self.syn_ack),
            handshake: since_syn(self.ack),
            mss: self.mss,
        }
    }
}

#[derive(Debug, Default)]
struct Accumulator {
    rows: u64,
    skipped: u64,
    connections: BTreeMap<String, Connection>,
    sent: BTreeMap<Ipv4Addr, u64>,
    segments: HashMap<(Ipv4Addr, Ipv4Addr, u32), u64>,
    lengths: Vec<f64>,
    seconds: BTreeMap<u64, u64>,
    ports: BTreeMap<u16, u64>,
    destinations: BTreeMap<Ipv4Addr, u64>,
}

impl Accumulator {
    fn add(&mut self, row: Row) {
        self.rows += 1;
        self.connections.entry(row.connection()).or_default().add(&row);
        *self.sent.entry(row.src_ip).or_default() += 1;
        *self.segments.entry((row.src_ip, row.dst_ip, row.seq)).or_default() += 1;
        self.lengths.push(f64::from(row.length));
        *self.seconds.entry(row.timestamp.floor() as u64).or_default() += 1;
        *self.ports.entry(row.dst_port).or_default() += 1;
        *self.destinations.entry(row.dst_ip).or_default() += 1;
    }

    fn finish(self) -> Summary {
        let mut retransmitted: BTreeMap<Ipv4Addr, u64> = BTreeMap::new();
        for (&(src, _, _), &count) in &self.segments {
            if count > 1 {
                *retransmitted.entry(src).or_default() += count;
            }
        }
        let retransmission_rate = self
            .sent
            .iter()
            .map(|(ip, &sent)| {
                let retransmitted = retransmitted.get(ip).copied().unwrap_or(0);
                (*ip, retransmitted as f64 / sent as f64)
            })
            .collect();

        let connections: BTreeMap<_, _> = self
            .connections
            .iter()
            .map(|(key, connection)| (key.clone(), connection.finish()))
            .collect();
        let volumes = connections
            .iter()
            .map(|(key, stats)| (key.clone(), stats.bytes))
            .collect();

        Summary {
            rows: self.rows,
            skipped_rows: self.skipped,
            connections,
            retransmission_rate,
            segment_lengths: Distribution::new(&self.lengths),
            elephant_flows: top(&volumes),
            microbursts: top(&self.seconds),
            top_ports: top(&self.ports),
            top_destinations: top(&self.destinations),
        }
    }
}

/// Reads a table written by the extractor and computes its summary.
///
/// Only I/O errors fail; malformed rows are skipped.
pub fn summarize<R: io::Read>(reader: R) -> Result<Summary, csv::Error> {
    let mut table = csv::Reader::from_reader(reader);
    let mut acc = Accumulator::default();

    for (line, row) in table.deserialize::<Row>().enumerate() {
        match row {
            Ok(row) if row.protocol == "TCP" => acc.add(row),
            Ok(_) => acc.skipped += 1,
            Err(err) if err.is_io_error() => return Err(err),
            Err(err) => {
                trace!(line = line + 2, %err, "skipped row");
                acc.skipped += 1;
            }
        }
    }

    if acc.skipped > 0 {
        warn!(skipped = acc.skipped, "rows left out of the summary");
    }
    Ok(acc.finish())
}

pub fn summarize_file(path: &Path) -> Result<Summary> {
    let file = File::open(path).map_err(|source| Error::OpenInput {
        path: path.to_owned(),
        source,
    })?;
    let summary = summarize(BufReader::new(file)).map_err(|source| Error::ReadTable {
        path: path.to_owned(),
        source,
    })?;
    debug!(
        path = %path.display(),
        rows = summary.rows,
        connections = summary.connections.len(),
        "summarized table"
    );
    Ok(summary)
}

/// Writes `summary` to `path` as indented JSON.
pub fn write_summary(path: &Path, summary: &Summary) -> Result<()> {
    let file = File::create(path).map_err(|source| Error::CreateOutput {
        path: path.to_owned(),
        source,
    })?;
    let mut writer = BufWriter::new(file);
    serde_json::to_writer_pretty(&mut writer, summary).map_err(|source| Error::WriteSummary {
        path: path.to_owned(),
        source,
    })?;
    writer
        .write_all(b"\n")
        .and_then(|()| writer.flush())
        .map_err(|source| Error::WriteOutput {
            path: path.to_owned(),
            source,
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    const HEADER: &str =
        "timestamp,src_ip,src_port,dst_ip,dst_port,protocol,length,flags,seq,ack,window,segmento_tcp_len,mss\n";

    fn table(rows: &[&str]) -> String {
        let mut text = HEADER.to_owned();
        for row in rows {
            text.push_str(row);
            text.push('\n');
        }
        text
    }

    fn handshake_table() -> String {
        table(&[
            "1.000000,10.0.0.1,5000,10.0.0.2,80,TCP,74,S,100,0,64240,0,1460",
            "1.250000,10.0.0.2,80,10.0.0.1,5000,TCP,74,SA,500,101,65160,0,1400",
            "1.500000,10.0.0.1,5000,10.0.0.2,80,TCP,66,A,101,501,502,0,-1",
            "2.000000,10.0.0.1,5000,10.0.0.2,80,TCP,166,PA,101,501,502,100,-1",
            "3.000000,10.0.0.3,6000,10.0.0.2,443,TCP,60,S,7,0,1024,0,-1",
            "3.100000,not-an-ip,6000,10.0.0.2,443,TCP,60,S,7,0,1024,0,-1",
            "3.200000,10.0.0.3,53,10.0.0.2,53,UDP,60,,0,0,0,0,-1",
        ])
    }

    fn summary() -> Summary {
        summarize(handshake_table().as_bytes()).unwrap()
    }

    #[test]
    fn malformed_and_non_tcp_rows_are_skipped() {
        let summary = summary();
        assert_eq!(summary.rows, 5);
        assert_eq!(summary.skipped_rows, 2);
    }

    #[test]
    fn connections_are_bidirectional() {
        let summary = summary();
        let keys: Vec<_> = summary.connections.keys().map(String::as_str).collect();
        assert_eq!(
            keys,
            ["10.0.0.1:5000 <-> 10.0.0.2:80", "10.0.0.2:443 <-> 10.0.0.3:6000"]
        );
    }

    #[test]
    fn handshake_timings_and_mss() {
        let summary = summary();
        let web = &summary.connections["10.0.0.1:5000 <-> 10.0.0.2:80"];
        assert_eq!(
            *web,
            ConnectionStats {
                packets: 4,
                bytes: 380,
                duration: 1.0,
                throughput: 380.0,
                rtt: Some(0.25),
                handshake: Some(0.5),
                mss: Some(1400),
            }
        );

        let lone = &summary.connections["10.0.0.2:443 <-> 10.0.0.3:6000"];
        assert_eq!(lone.throughput, 0.0);
        assert_eq!(lone.rtt, None);
        assert_eq!(lone.handshake, None);
        assert_eq!(lone.mss, None);
    }

    #[test]
    fn syn_ack_before_syn_has_no_rtt() {
        let text = table(&[
            "5.000000,10.0.0.2,80,10.0.0.1,5000,TCP,74,SA,500,101,65160,0,1400",
            "6.000000,10.0.0.1,5000,10.0.0.2,80,TCP,74,S,100,0,64240,0,1460",
        ]);
        let summary = summarize(text.as_bytes()).unwrap();
        assert_eq!(summary.connections["10.0.0.1:5000 <-> 10.0.0.2:80"].rtt, None);
    }

    #[test]
    fn repeated_sequence_numbers_count_as_retransmissions() {
        let summary = summary();
        let rate = &summary.retransmission_rate;
        assert!((rate[&Ipv4Addr::new(10, 0, 0, 1)] - 2.0 / 3.0).abs() < 1e-12);
        assert_eq!(rate[&Ipv4Addr::new(10, 0, 0, 2)], 0.0);
        assert_eq!(rate[&Ipv4Addr::new(10, 0, 0, 3)], 0.0);
    }

    #[test]
    fn segment_length_distribution() {
        let dist = summary().segment_lengths.unwrap();
        assert_eq!((dist.min, dist.max, dist.count), (60.0, 166.0, 5));
        assert_eq!(dist.mean, 88.0);
        assert_eq!(dist.median, 74.0);
        assert_eq!(dist.p25, 66.0);
        assert_eq!(dist.p75, 74.0);
        assert!((dist.p90 - 129.2).abs() < 1e-9);
        assert!((dist.std_dev - 1548.8f64.sqrt()).abs() < 1e-9);
    }

    #[test]
    fn empty_table_has_no_distribution() {
        let summary = summarize(HEADER.as_bytes()).unwrap();
        assert_eq!(summary.rows, 0);
        assert!(summary.segment_lengths.is_none());
        assert!(summary.connections.is_empty());
    }

    fn ranked<K>(key: K, count: u64) -> Ranked<K> {
        Ranked { key, count }
    }

    #[test]
    fn rankings() {
        let summary = summary();

        assert_eq!(
            summary.elephant_flows,
            vec![
                ranked("10.0.0.1:5000 <-> 10.0.0.2:80".to_owned(), 380),
                ranked("10.0.0.2:443 <-> 10.0.0.3:6000".to_owned(), 60),
            ]
        );
        assert_eq!(summary.microbursts, vec![ranked(1, 3), ranked(2, 1), ranked(3, 1)]);
        assert_eq!(summary.top_ports, vec![ranked(80, 3), ranked(443, 1), ranked(5000, 1)]);
        assert_eq!(
            summary.top_destinations,
            vec![ranked(Ipv4Addr::new(10, 0, 0, 2), 4), ranked(Ipv4Addr::new(10, 0, 0, 1), 1)]
        );
    }

    #[test]
    fn rankings_keep_the_top_ten() {
        let rows: Vec<String> = (0..15u16)
            .map(|i| format!("{i}.000000,10.0.0.1,5000,10.0.0.2,{},TCP,60,A,{i},0,0,0,-1", 1000 + i))
            .collect();
        let rows: Vec<&str> = rows.iter().map(String::as_str).collect();
        let summary = summarize(table(&rows).as_bytes()).unwrap();

        assert_eq!(summary.top_ports.len(), TOP_N);
        assert_eq!(summary.top_ports[0], Ranked { key: 1000, count: 1 });
        assert_eq!(summary.microbursts.len(), TOP_N);
    }

    #[test]
    fn summary_is_written_as_json() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stats.json");
        write_summary(&path, &summary()).unwrap();

        let json: serde_json::Value = serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
        assert_eq!(json["rows"], 5);
        assert_eq!(json["connections"]["10.0.0.1:5000 <-> 10.0.0.2:80"]["rtt"], 0.25);
        assert_eq!(json["retransmission_rate"]["10.0.0.2"], 0.0);
        assert_eq!(json["top_ports"][0]["key"], 80);
    }
}
