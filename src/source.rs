//! Reading and writing pcap and pcapng captures.

use std::{
    fs::File,
    io::{BufRead, BufReader, BufWriter, Read},
    path::Path,
    time::Duration,
};

use pcap_file::{
    pcap::{PcapHeader, PcapPacket, PcapReader, PcapWriter},
    pcapng::{
        blocks::{
            interface_description::{InterfaceDescriptionBlock, InterfaceDescriptionOption},
            section_header::SectionHeaderBlock,
        },
        Block, PcapNgReader, PcapNgWriter,
    },
    PcapError,
};
use tracing::warn;

use crate::{
    error::{Error, Result},
    link::LinkType,
};

/// First four bytes of a pcapng section header block.
pub const PCAPNG_MAGIC: [u8; 4] = [0x0a, 0x0d, 0x0d, 0x0a];

/// Timestamp resolution of a pcapng interface without `if_tsresol`.
const DEFAULT_TICKS_PER_SEC: u64 = 1_000_000;

pub type CaptureWriter = PcapWriter<BufWriter<File>>;
pub type NgCaptureWriter = PcapNgWriter<BufWriter<File>>;

/// One captured frame, borrowed from the packet it was read from.
#[derive(Debug, Clone, Copy)]
pub struct Frame<'a> {
    pub timestamp: Duration,
    /// Length of the frame on the wire, `data` may be shorter.
    pub orig_len: u32,
    pub data: &'a [u8],
}

impl<'a> From<&'a PcapPacket<'_>> for Frame<'a> {
    fn from(packet: &'a PcapPacket<'_>) -> Self {
        Self {
            timestamp: packet.timestamp,
            orig_len: packet.orig_len,
            data: &packet.data,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureFormat {
    Pcap,
    PcapNg,
}

impl CaptureFormat {
    /// Anything that is not a pcapng section header goes to the pcap reader,
    /// which rejects unknown magic numbers itself.
    pub fn detect(magic: &[u8]) -> Self {
        if magic.starts_with(&PCAPNG_MAGIC) {
            Self::PcapNg
        } else {
            Self::Pcap
        }
    }
}

/// Which side of a frame walk failed.
#[derive(Debug)]
pub enum VisitError<E> {
    Read(PcapError),
    Visit(E),
}

/// A capture in either file format, positioned after its first header.
pub enum CaptureReader<R: Read> {
    Pcap(PcapReader<R>),
    PcapNg(PcapNgReader<R>),
}

impl<R: BufRead> CaptureReader<R> {
    /// Picks the format from the first bytes of `reader` and reads the
    /// global header or first section header.
    pub fn new(mut reader: R) -> Result<Self, PcapError> {
        let format = CaptureFormat::detect(reader.fill_buf().map_err(PcapError::IoError)?);
        match format {
            CaptureFormat::Pcap => PcapReader::new(reader).map(Self::Pcap),
            CaptureFormat::PcapNg => PcapNgReader::new(reader).map(Self::PcapNg),
        }
    }
}

impl<R: Read> CaptureReader<R> {
    pub fn format(&self) -> CaptureFormat {
        match self {
            Self::Pcap(_) => CaptureFormat::Pcap,
            Self::PcapNg(_) => CaptureFormat::PcapNg,
        }
    }

    /// Calls `visit` with every frame of the capture in file order, along
    /// with the link type of the interface it was captured on. The link type
    /// is `None` when frames of that interface cannot be parsed.
    ///
    /// Stops at the first read error or the first error returned by `visit`.
    pub fn for_each_frame<E, F>(&mut self, mut visit: F) -> Result<(), VisitError<E>>
    where
        F: FnMut(Option<LinkType>, Frame<'_>) -> Result<(), E>,
    {
        match self {
            Self::Pcap(reader) => {
                let link = supported_link(reader.header().datalink);
                while let Some(packet) = reader.next_packet() {
                    let packet = packet.map_err(VisitError::Read)?;
                    visit(link, Frame::from(&packet)).map_err(VisitError::Visit)?;
                }
            }
            Self::PcapNg(reader) => {
                let mut interfaces = Interfaces::default();
                while let Some(block) = reader.next_block() {
                    let block = block.map_err(VisitError::Read)?;
                    if let Some((link, frame)) = interfaces.track(&block) {
                        visit(link, frame).map_err(VisitError::Visit)?;
                    }
                }
            }
        }
        Ok(())
    }
}

fn supported_link(datalink: pcap_file::DataLink) -> Option<LinkType> {
    let link = LinkType::from_datalink(datalink);
    if link.is_none() {
        warn!(?datalink, "unsupported link type, its frames are skipped");
    }
    link
}

#[derive(Debug, Clone, Copy)]
struct Interface {
    link: Option<LinkType>,
    ticks_per_sec: u64,
}

impl Default for Interface {
    fn default() -> Self {
        Self {
            link: None,
            ticks_per_sec: DEFAULT_TICKS_PER_SEC,
        }
    }
}

impl Interface {
    fn new(block: &InterfaceDescriptionBlock<'_>) -> Self {
        let ticks_per_sec = block
            .options
            .iter()
            .find_map(|option| match option {
                InterfaceDescriptionOption::IfTsResol(resolution) => Some(*resolution),
                _ => None,
            })
            .and_then(ticks_per_sec)
            .unwrap_or(DEFAULT_TICKS_PER_SEC);

        Self {
            link: supported_link(block.linktype),
            ticks_per_sec,
        }
    }

    fn timestamp(&self, ticks: u128) -> Duration {
        let per_sec = u128::from(self.ticks_per_sec);
        let secs = u64::try_from(ticks / per_sec).unwrap_or(u64::MAX);
        let nanos = (ticks % per_sec * 1_000_000_000 / per_sec) as u32;
        Duration::new(secs, nanos)
    }
}

/// Decodes `if_tsresol`: a negative power of ten, or of two when the high
/// bit is set.
fn ticks_per_sec(resolution: u8) -> Option<u64> {
    let exponent = u32::from(resolution & 0x7f);
    let ticks = if resolution & 0x80 == 0 {
        10u64.checked_pow(exponent)
    } else {
        2u64.checked_pow(exponent)
    };
    ticks.filter(|&ticks| ticks > 0)
}

/// Interfaces declared by the current pcapng section.
#[derive(Debug, Default)]
pub struct Interfaces {
    declared: Vec<Interface>,
}

impl Interfaces {
    /// Updates the table from `block` and, for a packet block, returns its
    /// frame with the link type of the interface it names. Packets naming an
    /// undeclared interface get no link type.
    ///
    /// pcap-file hands packet timestamps back as raw ticks, they are scaled
    /// here by the interface's `if_tsresol`.
    pub fn track<'b>(&mut self, block: &'b Block<'_>) -> Option<(Option<LinkType>, Frame<'b>)> {
        match block {
            Block::SectionHeader(_) => {
                self.declared.clear();
                None
            }
            Block::InterfaceDescription(interface) => {
                self.declared.push(Interface::new(interface));
                None
            }
            Block::EnhancedPacket(packet) => {
                let interface = self.get(packet.interface_id as usize);
                let frame = Frame {
                    timestamp: interface.timestamp(packet.timestamp.as_nanos()),
                    orig_len: packet.original_len,
                    data: &packet.data,
                };
                Some((interface.link, frame))
            }
            Block::SimplePacket(packet) => {
                let frame = Frame {
                    timestamp: Duration::ZERO,
                    orig_len: packet.original_len,
                    data: &packet.data,
                };
                Some((self.get(0).link, frame))
            }
            Block::Packet(packet) => {
                let interface = self.get(usize::from(packet.interface_id));
                let frame = Frame {
                    timestamp: interface.timestamp(u128::from(packet.timestamp)),
                    orig_len: packet.original_len,
                    data: &packet.data,
                };
                Some((interface.link, frame))
            }
            _ => None,
        }
    }

    fn get(&self, id: usize) -> Interface {
        self.declared.get(id).copied().unwrap_or_default()
    }
}

/// Opens `path` and reads its global pcap header or first pcapng section
/// header.
pub fn open_capture(path: &Path) -> Result<CaptureReader<BufReader<File>>> {
    let file = File::open(path).map_err(|source| Error::OpenInput {
        path: path.to_owned(),
        source,
    })?;
    CaptureReader::new(BufReader::new(file)).map_err(|source| Error::ReadCapture {
        path: path.to_owned(),
        source,
    })
}

fn create_file(path: &Path) -> Result<BufWriter<File>> {
    File::create(path)
        .map(BufWriter::new)
        .map_err(|source| Error::CreateOutput {
            path: path.to_owned(),
            source,
        })
}

/// Creates `path` as a capture with the same global header as `template`,
/// so frames read under `template` can be written back unchanged.
pub fn create_capture(path: &Path, template: PcapHeader) -> Result<CaptureWriter> {
    PcapWriter::with_header(create_file(path)?, template).map_err(|source| {
        Error::WriteCapture {
            path: path.to_owned(),
            source,
        }
    })
}

/// Creates `path` as a pcapng capture opening with `section`.
pub fn create_ng_capture(path: &Path, section: SectionHeaderBlock<'static>) -> Result<NgCaptureWriter> {
    PcapNgWriter::with_section_header(create_file(path)?, section).map_err(|source| {
        Error::WriteCapture {
            path: path.to_owned(),
            source,
        }
    })
}

#[cfg(test)]
mod tests {
    use std::{borrow::Cow, io::Cursor};

    use pcap_file::{
        pcapng::{blocks::enhanced_packet::EnhancedPacketBlock, PcapNgBlock},
        DataLink,
    };

    use super::*;

    fn interface(linktype: DataLink, options: Vec<InterfaceDescriptionOption<'static>>) -> Block<'static> {
        InterfaceDescriptionBlock {
            linktype,
            snaplen: 0xffff,
            options,
        }
        .into_block()
    }

    fn packet(interface_id: u32, ticks: u64, data: &[u8]) -> Block<'_> {
        EnhancedPacketBlock {
            interface_id,
            timestamp: Duration::from_nanos(ticks),
            original_len: data.len() as u32,
            data: Cow::Borrowed(data),
            options: vec![],
        }
        .into_block()
    }

    fn ng_capture(blocks: &[Block<'_>]) -> Vec<u8> {
        let mut writer = PcapNgWriter::new(Vec::new()).unwrap();
        for block in blocks {
            writer.write_block(block).unwrap();
        }
        writer.into_inner()
    }

    fn collect(capture: Vec<u8>) -> Vec<(Option<LinkType>, Duration, Vec<u8>)> {
        let mut reader = CaptureReader::new(Cursor::new(capture)).unwrap();
        let mut frames = Vec::new();
        reader
            .for_each_frame(|link, frame| {
                frames.push((link, frame.timestamp, frame.data.to_vec()));
                Ok::<_, ()>(())
            })
            .unwrap();
        frames
    }

    #[test]
    fn detects_format_from_magic() {
        assert_eq!(CaptureFormat::detect(&PCAPNG_MAGIC), CaptureFormat::PcapNg);
        assert_eq!(CaptureFormat::detect(&[0xd4, 0xc3, 0xb2, 0xa1]), CaptureFormat::Pcap);
        assert_eq!(CaptureFormat::detect(&[]), CaptureFormat::Pcap);
    }

    #[test]
    fn reads_pcap_frames() {
        let mut writer = PcapWriter::new(Vec::new()).unwrap();
        writer
            .write_packet(&PcapPacket::new(Duration::new(5, 1_000), 3, &[1, 2, 3]))
            .unwrap();
        let capture = writer.into_writer();

        let reader = CaptureReader::new(Cursor::new(capture.clone())).unwrap();
        assert_eq!(reader.format(), CaptureFormat::Pcap);
        assert_eq!(
            collect(capture),
            vec![(Some(LinkType::Ethernet), Duration::new(5, 1_000), vec![1, 2, 3])]
        );
    }

    #[test]
    fn pcapng_frames_follow_their_interface() {
        let capture = ng_capture(&[
            interface(DataLink::ETHERNET, vec![]),
            interface(DataLink::LINUX_SLL, vec![]),
            interface(DataLink::RAW, vec![InterfaceDescriptionOption::IfTsResol(9)]),
            packet(0, 1_500_000, &[0xe0]),
            packet(1, 0, &[0xe1]),
            packet(2, 2_000_000_250, &[0xe2]),
        ]);

        let reader = CaptureReader::new(Cursor::new(capture.clone())).unwrap();
        assert_eq!(reader.format(), CaptureFormat::PcapNg);

        assert_eq!(
            collect(capture),
            vec![
                (Some(LinkType::Ethernet), Duration::new(1, 500_000_000), vec![0xe0]),
                (None, Duration::ZERO, vec![0xe1]),
                (Some(LinkType::RawIp), Duration::new(2, 250), vec![0xe2]),
            ]
        );
    }

    #[test]
    fn undeclared_interface_has_no_link() {
        let mut interfaces = Interfaces::default();
        assert!(interfaces.track(&interface(DataLink::ETHERNET, vec![])).is_none());

        let data = [1, 2];
        let block = packet(3, 0, &data);
        let (link, frame) = interfaces.track(&block).unwrap();
        assert_eq!(link, None);
        assert_eq!(frame.data, &data);
    }

    #[test]
    fn new_section_forgets_interfaces() {
        let data = [1];
        let mut interfaces = Interfaces::default();
        interfaces.track(&interface(DataLink::ETHERNET, vec![]));
        assert_eq!(interfaces.track(&packet(0, 0, &data)).map(|(link, _)| link), Some(Some(LinkType::Ethernet)));

        interfaces.track(&SectionHeaderBlock::default().into_block());
        assert_eq!(interfaces.track(&packet(0, 0, &data)).map(|(link, _)| link), Some(None));
    }

    #[test]
    fn binary_timestamp_resolution() {
        assert_eq!(ticks_per_sec(6), Some(1_000_000));
        assert_eq!(ticks_per_sec(0x80 | 10), Some(1024));
        assert_eq!(ticks_per_sec(20), None);
    }

    #[test]
    fn visit_error_stops_the_walk() {
        let capture = ng_capture(&[
            interface(DataLink::ETHERNET, vec![]),
            packet(0, 0, &[1]),
            packet(0, 0, &[2]),
        ]);
        let mut reader = CaptureReader::new(Cursor::new(capture)).unwrap();
        let mut seen = 0;
        let outcome = reader.for_each_frame(|_, _| {
            seen += 1;
            Err("stop")
        });
        assert!(matches!(outcome, Err(VisitError::Visit("stop"))));
        assert_eq!(seen, 1);
    }
}
