//! Rewrites a capture keeping only its IPv4/TCP frames.
//!
//! The output has the input's file format: pcap stays pcap and pcapng stays
//! pcapng, with every non-packet block copied through.

use std::{
    io::{Read, Write},
    path::Path,
};

use pcap_file::{
    pcap::{PcapReader, PcapWriter},
    pcapng::{PcapNgReader, PcapNgWriter},
    PcapError,
};
use tracing::{debug, info_span, warn};

use crate::{
    error::{Error, Result},
    header::is_ipv4_tcp,
    link::LinkType,
    source::{create_capture, create_ng_capture, open_capture, CaptureReader, Interfaces},
};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FilterStats {
    pub frames: u64,
    pub kept: u64,
}

/// Which side of a [`filter_stream`] failed.
#[derive(Debug)]
pub enum StreamError {
    Read(PcapError),
    Write(PcapError),
}

/// Copies every IPv4/TCP frame from `reader` to `writer`, in order and
/// unchanged. Frames of an unsupported link type are all dropped.
pub fn filter_stream<R: Read, W: Write>(
    reader: &mut PcapReader<R>,
    writer: &mut PcapWriter<W>,
) -> Result<FilterStats, StreamError> {
    let datalink = reader.header().datalink;
    let link = LinkType::from_datalink(datalink);
    if link.is_none() {
        warn!(?datalink, "unsupported link type, dropping every frame");
    }

    let mut stats = FilterStats::default();
    while let Some(packet) = reader.next_packet() {
        let packet = packet.map_err(StreamError::Read)?;
        stats.frames += 1;

        if link.map_or(false, |link| is_ipv4_tcp(&packet.data, link)) {
            writer.write_packet(&packet).map_err(StreamError::Write)?;
            stats.kept += 1;
        }
    }
    Ok(stats)
}

/// Copies every block of a pcapng stream except the packets that are not
/// IPv4/TCP on a supported interface.
pub fn filter_ng_stream<R: Read, W: Write>(
    reader: &mut PcapNgReader<R>,
    writer: &mut PcapNgWriter<W>,
) -> Result<FilterStats, StreamError> {
    let mut interfaces = Interfaces::default();
    let mut stats = FilterStats::default();
    while let Some(block) = reader.next_block() {
        let block = block.map_err(StreamError::Read)?;

        let keep = match interfaces.track(&block) {
            Some((link, frame)) => {
                stats.frames += 1;
                let keep = link.map_or(false, |link| is_ipv4_tcp(frame.data, link));
                stats.kept += u64::from(keep);
                keep
            }
            None => true,
        };
        if keep {
            writer.write_block(&block).map_err(StreamError::Write)?;
        }
    }
    Ok(stats)
}

/// Writes the IPv4/TCP frames of the capture at `input` to a new capture at
/// `output` with the same global header, or section header for pcapng. The
/// output is flushed before this returns.
pub fn filter_capture(input: &Path, output: &Path) -> Result<FilterStats> {
    let _span = info_span!("filter", input = %input.display()).entered();
    let (stats, mut sink) = match open_capture(input)? {
        CaptureReader::Pcap(mut reader) => {
            let mut writer = create_capture(output, reader.header())?;
            let stats = filter_stream(&mut reader, &mut writer);
            (stats, writer.into_writer())
        }
        CaptureReader::PcapNg(mut reader) => {
            let mut writer = create_ng_capture(output, reader.section().clone())?;
            let stats = filter_ng_stream(&mut reader, &mut writer);
            (stats, writer.into_inner())
        }
    };

    let stats = stats.map_err(|err| match err {
        StreamError::Read(source) => Error::ReadCapture {
            path: input.to_owned(),
            source,
        },
        StreamError::Write(source) => Error::WriteCapture {
            path: output.to_owned(),
            source,
        },
    })?;

    sink.flush().map_err(|source| Error::WriteOutput {
        path: output.to_owned(),
        source,
    })?;

    debug!(
        input = %input.display(),
        output = %output.display(),
        frames = stats.frames,
        kept = stats.kept,
        "filtered capture"
    );
    Ok(stats)
}
