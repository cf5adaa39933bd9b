//! Port and layer based protocol identification.
//!
//! Every packet maps to exactly one [`ProtocolLabel`]. Rules are evaluated in a
//! fixed order and the first match wins, because the same port number can show
//! up in more than one rule group.
use serde::Serialize;

/// Read-only view of a decoded frame, as much as the classifier needs.
pub trait PacketLayers {
    /// Total frame length in bytes
    fn length(&self) -> usize;

    /// (source, destination) ports if a TCP header was decoded
    fn tcp_ports(&self) -> Option<(u16, u16)>;

    /// (source, destination) ports if a UDP header was decoded
    fn udp_ports(&self) -> Option<(u16, u16)>;

    fn has_icmp(&self) -> bool;

    /// Spanning tree (bridge control) frame
    fn has_stp(&self) -> bool;
}

/// Coarse application category, numbered 0 through 4.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub enum Category {
    Web = 0,
    Streaming = 1,
    FileTransfer = 2,
    Messaging = 3,
    System = 4,
}

impl Category {
    pub const ALL: [Category; 5] = [
        Category::Web,
        Category::Streaming,
        Category::FileTransfer,
        Category::Messaging,
        Category::System,
    ];

    pub const COUNT: usize = Self::ALL.len();

    pub fn id(self) -> u8 {
        self as u8
    }

    pub fn from_id(id: u8) -> Option<Self> {
        Self::ALL.get(id as usize).copied()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProtocolLabel {
    pub name: &'static str,
    pub category: Category,
}

impl ProtocolLabel {
    const fn new(name: &'static str, category: Category) -> Self {
        Self { name, category }
    }
}

/// A protocol recognised by well-known port, on either end of the flow.
#[derive(Debug, Clone, Copy)]
pub struct PortRule {
    pub ports: &'static [u16],
    pub label: ProtocolLabel,
}

impl PortRule {
    const fn new(ports: &'static [u16], name: &'static str, category: Category) -> Self {
        Self {
            ports,
            label: ProtocolLabel::new(name, category),
        }
    }

    fn matches(&self, sport: u16, dport: u16) -> bool {
        self.ports.iter().any(|&p| p == sport || p == dport)
    }
}

pub const ICMP: ProtocolLabel = ProtocolLabel::new("ICMP", Category::System);
pub const STP: ProtocolLabel = ProtocolLabel::new("STP", Category::Messaging);
pub const OTHER: ProtocolLabel = ProtocolLabel::new("Other", Category::System);

/// Rules checked before the spanning tree test.
pub const APPLICATION_RULES: &[PortRule] = &[
    PortRule::new(&[80], "HTTP", Category::Web),
    PortRule::new(&[443], "HTTPS", Category::Web),
    PortRule::new(&[8443], "HTTPS-Alt", Category::Web),
    // HLS and DASH ride on 80/443 and land in Web; only RTMP is told apart.
    PortRule::new(&[1935], "RTMP", Category::Streaming),
    PortRule::new(&[20, 21], "FTP", Category::FileTransfer),
    PortRule::new(&[990], "FTPS", Category::FileTransfer),
    PortRule::new(&[22], "SFTP", Category::FileTransfer),
    PortRule::new(&[69], "TFTP", Category::FileTransfer),
    PortRule::new(&[5222, 5223], "XMPP", Category::Messaging),
];

/// Rules checked after the spanning tree test.
pub const SYSTEM_RULES: &[PortRule] = &[
    PortRule::new(&[53], "DNS", Category::System),
    PortRule::new(&[123], "NTP", Category::System),
    PortRule::new(&[67, 68], "DHCP", Category::System),
];

/// Identify the protocol and category of a single packet.
pub fn classify<P: PacketLayers + ?Sized>(packet: &P) -> ProtocolLabel {
    if packet.has_icmp() {
        return ICMP;
    }

    let (sport, dport) = packet
        .tcp_ports()
        .or_else(|| packet.udp_ports())
        .unwrap_or((0, 0));

    if let Some(rule) = APPLICATION_RULES.iter().find(|r| r.matches(sport, dport)) {
        return rule.label;
    }

    // Spanning tree is filed under Messaging, not System.
    if packet.has_stp() {
        return STP;
    }

    SYSTEM_RULES
        .iter()
        .find(|r| r.matches(sport, dport))
        .map(|r| r.label)
        .unwrap_or(OTHER)
}


#[cfg(test)]
mod tests {
    use super::test_utils::FakePacket;
    use super::*;

    #[test]
    fn web_ports_match_either_direction() {
        assert_eq!(classify(&FakePacket::tcp(51000, 80)).name, "HTTP");
        assert_eq!(classify(&FakePacket::tcp(443, 51000)).name, "HTTPS");
        let alt = classify(&FakePacket::tcp(8443, 40000));
        assert_eq!(alt.name, "HTTPS-Alt");
        assert_eq!(alt.category, Category::Web);
    }

    #[test]
    fn maps_each_rule_group() {
        let cases = [
            (FakePacket::tcp(40000, 1935), "RTMP", Category::Streaming),
            (FakePacket::tcp(20, 40000), "FTP", Category::FileTransfer),
            (FakePacket::tcp(40000, 21), "FTP", Category::FileTransfer),
            (FakePacket::tcp(40000, 990), "FTPS", Category::FileTransfer),
            (FakePacket::tcp(40000, 22), "SFTP", Category::FileTransfer),
            (FakePacket::udp(40000, 69), "TFTP", Category::FileTransfer),
            (FakePacket::tcp(40000, 5222), "XMPP", Category::Messaging),
            (FakePacket::tcp(5223, 40000), "XMPP", Category::Messaging),
            (FakePacket::udp(40000, 53), "DNS", Category::System),
            (FakePacket::udp(123, 123), "NTP", Category::System),
            (FakePacket::udp(68, 67), "DHCP", Category::System),
            (FakePacket::tcp(40000, 40001), "Other", Category::System),
        ];

        for (packet, name, category) in cases {
            let label = classify(&packet);
            assert_eq!(label.name, name, "{:?}", packet);
            assert_eq!(label.category, category, "{:?}", packet);
        }
    }

    #[test]
    fn icmp_wins_over_ports() {
        let mut packet = FakePacket::tcp(40000, 443);
        packet.icmp = true;
        assert_eq!(classify(&packet), ICMP);
        assert_eq!(classify(&packet).category.id(), 4);
    }

    #[test]
    fn bare_stp_frame_is_messaging() {
        let packet = FakePacket {
            length: 60,
            stp: true,
            ..Default::default()
        };
        let label = classify(&packet);
        assert_eq!(label.name, "STP");
        assert_eq!(label.category.id(), 3);
    }

    #[test]
    fn stp_sits_between_port_groups() {
        // Application ports are checked first, system ports after.
        let mut web = FakePacket::tcp(40000, 80);
        web.stp = true;
        assert_eq!(classify(&web).name, "HTTP");

        let mut dns = FakePacket::udp(40000, 53);
        dns.stp = true;
        assert_eq!(classify(&dns).name, "STP");
    }

    #[test]
    fn tcp_ports_take_precedence_over_udp() {
        let packet = FakePacket {
            length: 60,
            tcp: Some((40000, 22)),
            udp: Some((40000, 53)),
            ..Default::default()
        };
        assert_eq!(classify(&packet).name, "SFTP");
    }

    #[test]
    fn no_transport_falls_through_to_default() {
        let packet = FakePacket {
            length: 42,
            ..Default::default()
        };
        assert_eq!(classify(&packet), OTHER);
    }

    #[test]
    fn classification_is_deterministic() {
        let packets = [
            FakePacket::tcp(1, 2),
            FakePacket::udp(53, 9999),
            FakePacket {
                icmp: true,
                ..Default::default()
            },
        ];
        for packet in &packets {
            let first = classify(packet);
            for _ in 0..10 {
                assert_eq!(classify(packet), first);
            }
            assert!(Category::from_id(first.category.id()).is_some());
        }
    }

    #[test]
    fn category_ids_round_trip() {
        for category in Category::ALL {
            assert_eq!(Category::from_id(category.id()), Some(category));
        }
        assert_eq!(Category::from_id(5), None);
    }
}
