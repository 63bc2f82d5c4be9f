use pcap_file::DataLink;

/// Length of an Ethernet II header without VLAN tags.
pub const ETHERNET_HEADER_LEN: usize = 14;

/// Link layers whose frames carry an IPv4 header at a fixed offset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkType {
    Ethernet,
    /// Frames start directly with the IP header.
    RawIp,
}

impl LinkType {
    /// Maps a capture's declared link type, `None` when frames of that type
    /// cannot be parsed.
    pub fn from_datalink(datalink: DataLink) -> Option<Self> {
        match datalink {
            DataLink::ETHERNET => Some(Self::Ethernet),
            DataLink::RAW => Some(Self::RawIp),
            _ => None,
        }
    }

    #[inline]
    pub fn header_len(self) -> usize {
        match self {
            Self::Ethernet => ETHERNET_HEADER_LEN,
            Self::RawIp => 0,
        }
    }
}
