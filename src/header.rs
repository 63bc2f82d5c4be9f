//! Header parsing for captured IPv4/TCP frames.
//!
//! Capture data is untrusted: every header is checked against the captured
//! bytes before it is read, and any frame that does not fit is reported as
//! `None` rather than as an error.

use std::{
    fmt::{self, Write as _},
    net::{Ipv4Addr, SocketAddrV4},
    time::Duration,
};

use etherparse::TcpHeaderSlice;

use crate::{link::LinkType, source::Frame};

pub const IPV4_MIN_HEADER_LEN: usize = 20;
pub const TCP_MIN_HEADER_LEN: usize = 20;

/// IP protocol number for TCP.
pub const IPPROTO_TCP: u8 = 6;

/// TCP option kinds.
pub mod options {
    pub const END_OF_LIST: u8 = 0;
    pub const NOP: u8 = 1;
    pub const MSS: u8 = 2;

    pub const MSS_LEN: usize = 4;
}

/// IPv4 header whose declared length fits inside the captured bytes.
///
/// Only the header length is validated. The total-length field is ignored
/// because captures taken with segmentation offload often carry 0 there, and
/// those frames still hold a usable TCP header.
#[derive(Debug, Clone, Copy)]
pub struct Ipv4Header<'a> {
    bytes: &'a [u8],
}

impl<'a> Ipv4Header<'a> {
    /// `bytes` starts at the first byte of the IP header. Returns `None` if
    /// the IHL field is below 5 words or overruns the slice.
    pub fn from_slice(bytes: &'a [u8]) -> Option<Self> {
        if bytes.len() < IPV4_MIN_HEADER_LEN {
            return None;
        }
        let header = Self { bytes };
        let len = header.header_len();
        if len < IPV4_MIN_HEADER_LEN || len > bytes.len() {
            return None;
        }
        Some(header)
    }

    #[inline]
    pub fn version(&self) -> u8 {
        self.bytes[0] >> 4
    }

    /// Header length in 32-bit words.
    #[inline]
    pub fn ihl(&self) -> u8 {
        self.bytes[0] & 0x0f
    }

    #[inline]
    pub fn header_len(&self) -> usize {
        self.ihl() as usize * 4
    }

    #[inline]
    pub fn protocol(&self) -> u8 {
        self.bytes[9]
    }

    #[inline]
    pub fn source(&self) -> Ipv4Addr {
        Ipv4Addr::new(self.bytes[12], self.bytes[13], self.bytes[14], self.bytes[15])
    }

    #[inline]
    pub fn destination(&self) -> Ipv4Addr {
        Ipv4Addr::new(self.bytes[16], self.bytes[17], self.bytes[18], self.bytes[19])
    }
}

/// TCP control bits as found in byte 13 of the header.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TcpFlags(u8);

impl TcpFlags {
    pub const FIN: TcpFlags = TcpFlags(0x01);
    pub const SYN: TcpFlags = TcpFlags(0x02);
    pub const RST: TcpFlags = TcpFlags(0x04);
    pub const PSH: TcpFlags = TcpFlags(0x08);
    pub const ACK: TcpFlags = TcpFlags(0x10);
    pub const URG: TcpFlags = TcpFlags(0x20);

    const LETTERS: [(TcpFlags, char); 6] = [
        (Self::FIN, 'F'),
        (Self::SYN, 'S'),
        (Self::RST, 'R'),
        (Self::PSH, 'P'),
        (Self::ACK, 'A'),
        (Self::URG, 'U'),
    ];

    #[inline]
    pub const fn from_bits(bits: u8) -> Self {
        Self(bits)
    }

    #[inline]
    pub const fn bits(self) -> u8 {
        self.0
    }

    #[inline]
    pub const fn contains(self, other: TcpFlags) -> bool {
        self.0 & other.0 == other.0
    }
}

impl From<&TcpHeaderSlice<'_>> for TcpFlags {
    fn from(tcp: &TcpHeaderSlice<'_>) -> Self {
        [
            (tcp.fin(), Self::FIN),
            (tcp.syn(), Self::SYN),
            (tcp.rst(), Self::RST),
            (tcp.psh(), Self::PSH),
            (tcp.ack(), Self::ACK),
            (tcp.urg(), Self::URG),
        ]
        .into_iter()
        .filter(|(set, _)| *set)
        .fold(Self::default(), |flags, (_, flag)| flags | flag)
    }
}

impl std::ops::BitOr for TcpFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

/// Letters of the set flags in `FSRPAU` order, nothing when none is set.
impl fmt::Display for TcpFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (flag, letter) in Self::LETTERS {
            if self.contains(flag) {
                f.write_char(letter)?;
            }
        }
        Ok(())
    }
}

/// Finds a maximum-segment-size option in a TCP options region.
///
/// The scan stops at the end-of-list marker or at the first option whose
/// length byte is missing, below 2, or runs past the region.
pub fn scan_mss(opts: &[u8]) -> Option<u16> {
    let mut i = 0;
    while i < opts.len() {
        match opts[i] {
            options::END_OF_LIST => return None,
            options::NOP => i += 1,
            kind => {
                let len = *opts.get(i + 1)? as usize;
                if len < 2 || i + len > opts.len() {
                    return None;
                }
                if kind == options::MSS && len == options::MSS_LEN {
                    return Some(u16::from_be_bytes([opts[i + 2], opts[i + 3]]));
                }
                i += len;
            }
        }
    }
    None
}

/// One TCP segment extracted from a captured frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TcpRecord {
    /// Capture time, truncated to microseconds.
    pub timestamp: Duration,
    pub source: SocketAddrV4,
    pub destination: SocketAddrV4,
    /// Length of the frame on the wire.
    pub length: u32,
    pub flags: TcpFlags,
    pub seq: u32,
    pub ack: u32,
    pub window: u16,
    pub payload_len: usize,
    /// Only looked for on SYN segments.
    pub mss: Option<u16>,
}

/// Parses the IPv4 and TCP headers of `frame`.
///
/// `None` means the frame is skipped: too short, not IPv4, not TCP, or a
/// header length that overruns the captured bytes.
pub fn parse_frame(frame: &Frame<'_>, link: LinkType) -> Option<TcpRecord> {
    let data = frame.data;
    let link_len = link.header_len();
    if data.len() < link_len + IPV4_MIN_HEADER_LEN + TCP_MIN_HEADER_LEN {
        return None;
    }

    let ip = Ipv4Header::from_slice(&data[link_len..])?;
    if ip.version() != 4 || ip.protocol() != IPPROTO_TCP {
        return None;
    }

    let tcp_start = link_len + ip.header_len();
    let tcp = TcpHeaderSlice::from_slice(data.get(tcp_start..)?).ok()?;
    let flags = TcpFlags::from(&tcp);

    let mss = if flags.contains(TcpFlags::SYN) {
        scan_mss(tcp.options())
    } else {
        None
    };

    Some(TcpRecord {
        timestamp: Duration::new(frame.timestamp.as_secs(), frame.timestamp.subsec_micros() * 1_000),
        source: SocketAddrV4::new(ip.source(), tcp.source_port()),
        destination: SocketAddrV4::new(ip.destination(), tcp.destination_port()),
        length: frame.orig_len,
        flags,
        seq: tcp.sequence_number(),
        ack: tcp.acknowledgment_number(),
        window: tcp.window_size(),
        payload_len: data.len().saturating_sub(tcp_start + tcp.slice().len()),
        mss,
    })
}

/// Keeps frames with enough bytes for a minimal IPv4 header whose version is
/// 4 and whose protocol is TCP. Nothing else about the header is checked.
pub fn is_ipv4_tcp(data: &[u8], link: LinkType) -> bool {
    let ip = match data.get(link.header_len()..) {
        Some(ip) if ip.len() >= IPV4_MIN_HEADER_LEN => ip,
        _ => return false,
    };
    ip[0] >> 4 == 4 && ip[9] == IPPROTO_TCP
}
