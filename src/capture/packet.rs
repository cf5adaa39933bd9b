use etherparse::{SlicedPacket, TransportSlice};
use tracing::{debug, warn};

use crate::protocols::PacketLayers;

/// LLC service access point used by IEEE 802.1D bridge PDUs
const STP_SAP: u8 = 0x42;

/// Largest value of the 802.3 length field; anything above is an EtherType
const MAX_8023_LENGTH: u16 = 1500;

/// Linux cooked capture protocol type for 802.2 LLC frames
const SLL_PROTO_LLC: u16 = 0x0004;

/// BSD loopback address family word, in either byte order
const LOOPBACK_HEADER_LEN: usize = 4;

/// Linux cooked capture v2 header
const SLL2_HEADER_LEN: usize = 20;

const ETHERTYPE_IPV4: u16 = 0x0800;
const ETHERTYPE_IPV6: u16 = 0x86dd;

/// Link layer a capture file was recorded with
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkKind {
    Ethernet,
    RawIp,
    /// LINKTYPE_NULL and LINKTYPE_LOOP
    Loopback,
    LinuxSll,
    LinuxSll2,
}

impl LinkKind {
    /// Map a pcap LINKTYPE_* value. Unknown types are decoded as Ethernet
    /// with a warning.
    pub fn from_linktype(linktype: i32) -> Self {
        match linktype {
            1 => LinkKind::Ethernet,
            0 | 108 => LinkKind::Loopback,
            12 | 101 | 228 | 229 => LinkKind::RawIp,
            113 => LinkKind::LinuxSll,
            276 => LinkKind::LinuxSll2,
            other => {
                warn!("Unsupported link type {}, decoding frames as Ethernet", other);
                LinkKind::Ethernet
            }
        }
    }
}

/// A frame reduced to the layers the classifier looks at.
///
/// Decoding never fails. A frame that cannot be sliced still carries its
/// length and simply reports no transport layer.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DecodedPacket {
    pub length: usize,
    pub tcp: Option<(u16, u16)>,
    pub udp: Option<(u16, u16)>,
    pub icmp: bool,
    pub stp: bool,
}

impl DecodedPacket {
    pub fn decode(link: LinkKind, data: &[u8]) -> Self {
        match link {
            LinkKind::Ethernet => Self::from_ethernet(data),
            LinkKind::RawIp => Self::from_ip(data),
            LinkKind::Loopback => Self::from_loopback(data),
            LinkKind::LinuxSll => Self::from_linux_sll(data),
            LinkKind::LinuxSll2 => Self::from_linux_sll2(data),
        }
    }

    pub fn from_ethernet(data: &[u8]) -> Self {
        let mut packet = Self::with_length(data.len());
        packet.stp = is_ethernet_stp(data);
        packet.apply(SlicedPacket::from_ethernet(data));
        packet
    }

    pub fn from_ip(data: &[u8]) -> Self {
        let mut packet = Self::with_length(data.len());
        packet.apply(SlicedPacket::from_ip(data));
        packet
    }

    pub fn from_linux_sll(data: &[u8]) -> Self {
        let mut packet = Self::with_length(data.len());
        packet.stp = is_sll_stp(data);
        packet.apply(SlicedPacket::from_linux_sll(data));
        packet
    }

    /// Skips the 4-byte address family header. The IP version nibble tells
    /// v4 from v6, so the family value itself is not needed.
    pub fn from_loopback(data: &[u8]) -> Self {
        let mut packet = Self::with_length(data.len());
        if let Some(ip) = data.get(LOOPBACK_HEADER_LEN..) {
            packet.apply(SlicedPacket::from_ip(ip));
        }
        packet
    }

    pub fn from_linux_sll2(data: &[u8]) -> Self {
        let mut packet = Self::with_length(data.len());
        let Some(payload) = data.get(SLL2_HEADER_LEN..) else {
            return packet;
        };
        match u16::from_be_bytes([data[0], data[1]]) {
            ETHERTYPE_IPV4 | ETHERTYPE_IPV6 => packet.apply(SlicedPacket::from_ip(payload)),
            SLL_PROTO_LLC => packet.stp = is_llc_stp(payload),
            proto => debug!("SLL2 frame with protocol {:#06x} not decoded", proto),
        }
        packet
    }

    fn with_length(length: usize) -> Self {
        Self {
            length,
            ..Default::default()
        }
    }

    fn apply<E: std::fmt::Debug>(&mut self, sliced: Result<SlicedPacket<'_>, E>) {
        let sliced = match sliced {
            Ok(sliced) => sliced,
            Err(e) => {
                debug!(
                    "Frame of {} bytes not decodable past link layer: {:?}",
                    self.length, e
                );
                return;
            }
        };

        match sliced.transport {
            Some(TransportSlice::Tcp(tcp)) => {
                self.tcp = Some((tcp.source_port(), tcp.destination_port()));
            }
            Some(TransportSlice::Udp(udp)) => {
                self.udp = Some((udp.source_port(), udp.destination_port()));
            }
            Some(TransportSlice::Icmpv4(_)) => {
                self.icmp = true;
            }
            // ICMPv6 is not counted as ICMP
            _ => {}
        }
    }
}

impl PacketLayers for DecodedPacket {
    fn length(&self) -> usize {
        self.length
    }

    fn tcp_ports(&self) -> Option<(u16, u16)> {
        self.tcp
    }

    fn udp_ports(&self) -> Option<(u16, u16)> {
        self.udp
    }

    fn has_icmp(&self) -> bool {
        self.icmp
    }

    fn has_stp(&self) -> bool {
        self.stp
    }
}

/// 802.3 frame (length field instead of EtherType) carrying an LLC header
/// addressed to the bridge SAP.
fn is_ethernet_stp(frame: &[u8]) -> bool {
    if frame.len() < 17 {
        return false;
    }
    let length_or_type = u16::from_be_bytes([frame[12], frame[13]]);
    length_or_type <= MAX_8023_LENGTH && frame[14] == STP_SAP && frame[15] == STP_SAP
}

fn is_sll_stp(frame: &[u8]) -> bool {
    if frame.len() < 19 {
        return false;
    }
    let protocol = u16::from_be_bytes([frame[14], frame[15]]);
    protocol == SLL_PROTO_LLC && is_llc_stp(&frame[16..])
}

fn is_llc_stp(llc: &[u8]) -> bool {
    llc.len() >= 3 && llc[0] == STP_SAP && llc[1] == STP_SAP
}
