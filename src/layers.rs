//! Frame construction and decode.
//!
//! [`create_layers`], [`flag_tcp`] and [`serialize`] build outgoing
//! Ethernet II / IP / TCP frames with computed checksums; [`parse_packet`]
//! decodes a captured frame into an [`Indicator`]. No TCP options are ever
//! emitted.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use etherparse::{
    EtherType, Ethernet2Header, IpNumber, Ipv4Header, Ipv6Header, TcpHeader, UdpHeader,
};
use thiserror::Error;

use crate::addr::{Addr, IpPort};
use crate::capture::{Device, MacAddr};

/// Window advertised on every synthetic segment.
const TCP_WINDOW: u16 = 65_535;

/// Layer construction and serialisation errors.
#[derive(Debug, Error)]
pub enum LayerError {
    #[error("device {0} has no ipv4 address")]
    NoIpv4(String),
    #[error("device {0} has no ipv6 address")]
    NoIpv6(String),
    #[error("payload too large for one segment")]
    Oversize,
    #[error("serialize: {0}")]
    Serialize(String),
}

/// Frame decode errors.
#[derive(Debug, Error)]
pub enum ParseError {
    #[error("malformed packet: {0}")]
    Malformed(String),
    #[error("transport layer not supported")]
    Unsupported,
}

/// Transport layer of a parsed frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    Tcp,
    Udp,
}

/// TCP flags of a parsed frame.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TcpFlags {
    pub syn: bool,
    pub ack: bool,
    pub rst: bool,
    pub psh: bool,
    pub fin: bool,
}

/// Network layer of an outgoing frame.
#[derive(Debug, Clone)]
pub enum NetLayer {
    V4 {
        src: Ipv4Addr,
        dst: Ipv4Addr,
        id: u16,
        ttl: u8,
    },
    V6 {
        src: Ipv6Addr,
        dst: Ipv6Addr,
        hop_limit: u8,
    },
}

impl NetLayer {
    /// Whether this frame carries an IPv4 identification field.
    pub fn is_ipv4(&self) -> bool {
        matches!(self, NetLayer::V4 { .. })
    }
}

/// The link/network/transport triplet of one outgoing frame.
#[derive(Debug, Clone)]
pub struct Layers {
    pub eth: Ethernet2Header,
    pub net: NetLayer,
    pub tcp: TcpHeader,
}

/// Builds the layer triplet for an outgoing segment.
///
/// The network family follows `dst_ip`; the source IP comes from the
/// device's address of the same family. The IPv4 identification is `id`
/// (ignored for IPv6). No TCP flags are set.
#[allow(clippy::too_many_arguments)]
pub fn create_layers(
    src_port: u16,
    dst_port: u16,
    seq: u32,
    ack: u32,
    dev: &Device,
    dst_ip: IpAddr,
    id: u16,
    ttl: u8,
    dst_hw: MacAddr,
) -> Result<Layers, LayerError> {
    let (net, ether_type) = match dst_ip {
        IpAddr::V4(dst) => {
            let src = dev
                .ipv4_addr()
                .ok_or_else(|| LayerError::NoIpv4(dev.alias().to_string()))?;
            (NetLayer::V4 { src, dst, id, ttl }, EtherType::IPV4)
        }
        IpAddr::V6(dst) => {
            let src = dev
                .ipv6_addr()
                .ok_or_else(|| LayerError::NoIpv6(dev.alias().to_string()))?;
            (
                NetLayer::V6 {
                    src,
                    dst,
                    hop_limit: ttl,
                },
                EtherType::IPV6,
            )
        }
    };

    let mut tcp = TcpHeader::new(src_port, dst_port, seq, TCP_WINDOW);
    tcp.acknowledgment_number = ack;

    let eth = Ethernet2Header {
        source: dev.hardware_addr().octets(),
        destination: dst_hw.octets(),
        ether_type,
    };

    Ok(Layers { eth, net, tcp })
}

/// Sets the SYN/PSH/ACK flags; unmentioned flags are cleared.
pub fn flag_tcp(tcp: &mut TcpHeader, syn: bool, psh: bool, ack: bool) {
    tcp.syn = syn;
    tcp.psh = psh;
    tcp.ack = ack;
    tcp.rst = false;
    tcp.fin = false;
    tcp.urg = false;
}

/// Serialises the triplet plus payload into an injectable wire buffer.
///
/// The IPv4 header checksum and the TCP checksum (v4 pseudo-header or v6)
/// are computed here; the payload is carried verbatim as the segment body.
pub fn serialize(layers: &Layers, payload: &[u8]) -> Result<Vec<u8>, LayerError> {
    let mut tcp = layers.tcp.clone();
    let tcp_len = tcp.header_len() as usize + payload.len();
    let tcp_len16 = u16::try_from(tcp_len).map_err(|_| LayerError::Oversize)?;

    let mut buf = Vec::with_capacity(14 + 40 + tcp_len);
    match &layers.net {
        NetLayer::V4 { src, dst, id, ttl } => {
            let mut ip =
                Ipv4Header::new(tcp_len16, *ttl, IpNumber::TCP, src.octets(), dst.octets())
                    .map_err(|e| LayerError::Serialize(e.to_string()))?;
            ip.identification = *id;
            tcp.checksum = tcp
                .calc_checksum_ipv4(&ip, payload)
                .map_err(|e| LayerError::Serialize(e.to_string()))?;
            layers
                .eth
                .write(&mut buf)
                .map_err(|e| LayerError::Serialize(e.to_string()))?;
            ip.write(&mut buf)
                .map_err(|e| LayerError::Serialize(e.to_string()))?;
        }
        NetLayer::V6 {
            src,
            dst,
            hop_limit,
        } => {
            let ip = Ipv6Header {
                payload_length: tcp_len16,
                next_header: IpNumber::TCP,
                hop_limit: *hop_limit,
                source: src.octets(),
                destination: dst.octets(),
                ..Default::default()
            };
            tcp.checksum = tcp
                .calc_checksum_ipv6(&ip, payload)
                .map_err(|e| LayerError::Serialize(e.to_string()))?;
            layers
                .eth
                .write(&mut buf)
                .map_err(|e| LayerError::Serialize(e.to_string()))?;
            ip.write(&mut buf)
                .map_err(|e| LayerError::Serialize(e.to_string()))?;
        }
    }
    tcp.write(&mut buf)
        .map_err(|e| LayerError::Serialize(e.to_string()))?;
    buf.extend_from_slice(payload);
    Ok(buf)
}

/// A parsed, normalised view of one captured frame.
#[derive(Debug, Clone)]
pub struct Indicator {
    pub src_ip: IpAddr,
    pub dst_ip: IpAddr,
    pub src_port: u16,
    pub dst_port: u16,
    pub src_hw: MacAddr,
    pub transport: TransportKind,
    pub flags: TcpFlags,
    pub seq: u32,
    pub ack: u32,
    pub payload: Vec<u8>,
}

impl Indicator {
    /// Source address in the flavour the frame wore.
    pub fn src(&self) -> Addr {
        let ipp = self.src_ip_port();
        match self.transport {
            TransportKind::Tcp => Addr::Tcp(ipp),
            TransportKind::Udp => Addr::Udp(ipp),
        }
    }

    /// Destination address in the flavour the frame wore.
    pub fn dst(&self) -> Addr {
        let ipp = IpPort::new(self.dst_ip, self.dst_port);
        match self.transport {
            TransportKind::Tcp => Addr::Tcp(ipp),
            TransportKind::Udp => Addr::Udp(ipp),
        }
    }

    pub fn src_ip_port(&self) -> IpPort {
        IpPort::new(self.src_ip, self.src_port)
    }
}

/// Decodes one captured frame.
///
/// The payload is bounded by the IP layer's length field, so link-layer
/// padding never leaks into the segment body. An empty TCP segment is legal
/// and yields a zero-length payload.
pub fn parse_packet(frame: &[u8]) -> Result<Indicator, ParseError> {
    let (eth, rest) =
        Ethernet2Header::from_slice(frame).map_err(|e| ParseError::Malformed(e.to_string()))?;

    let (src_ip, dst_ip, ip_payload, proto) = match eth.ether_type {
        EtherType::IPV4 => {
            if rest.len() < 20 {
                return Err(ParseError::Malformed("truncated ipv4 header".to_string()));
            }
            let total_len = u16::from_be_bytes([rest[2], rest[3]]) as usize;
            let (ip, ip_rest) =
                Ipv4Header::from_slice(rest).map_err(|e| ParseError::Malformed(e.to_string()))?;
            let header_len = rest.len() - ip_rest.len();
            if total_len < header_len || total_len > rest.len() {
                return Err(ParseError::Malformed("bad ipv4 total length".to_string()));
            }
            (
                IpAddr::V4(Ipv4Addr::from(ip.source)),
                IpAddr::V4(Ipv4Addr::from(ip.destination)),
                &rest[header_len..total_len],
                ip.protocol,
            )
        }
        EtherType::IPV6 => {
            let (ip, ip_rest) =
                Ipv6Header::from_slice(rest).map_err(|e| ParseError::Malformed(e.to_string()))?;
            let payload_len = ip.payload_length as usize;
            if payload_len > ip_rest.len() {
                return Err(ParseError::Malformed("bad ipv6 payload length".to_string()));
            }
            (
                IpAddr::V6(Ipv6Addr::from(ip.source)),
                IpAddr::V6(Ipv6Addr::from(ip.destination)),
                &ip_rest[..payload_len],
                ip.next_header,
            )
        }
        other => {
            return Err(ParseError::Malformed(format!(
                "ether type {:?} not ip",
                other
            )))
        }
    };

    match proto {
        IpNumber::TCP => {
            let (tcp, payload) = TcpHeader::from_slice(ip_payload)
                .map_err(|e| ParseError::Malformed(e.to_string()))?;
            Ok(Indicator {
                src_ip,
                dst_ip,
                src_port: tcp.source_port,
                dst_port: tcp.destination_port,
                src_hw: MacAddr::new(eth.source),
                transport: TransportKind::Tcp,
                flags: TcpFlags {
                    syn: tcp.syn,
                    ack: tcp.ack,
                    rst: tcp.rst,
                    psh: tcp.psh,
                    fin: tcp.fin,
                },
                seq: tcp.sequence_number,
                ack: tcp.acknowledgment_number,
                payload: payload.to_vec(),
            })
        }
        IpNumber::UDP => {
            let (udp, payload) = UdpHeader::from_slice(ip_payload)
                .map_err(|e| ParseError::Malformed(e.to_string()))?;
            Ok(Indicator {
                src_ip,
                dst_ip,
                src_port: udp.source_port,
                dst_port: udp.destination_port,
                src_hw: MacAddr::new(eth.source),
                transport: TransportKind::Udp,
                flags: TcpFlags::default(),
                seq: 0,
                ack: 0,
                payload: payload.to_vec(),
            })
        }
        _ => Err(ParseError::Unsupported),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dev_v4() -> Device {
        Device::new(
            "eth0",
            vec!["10.0.0.1".parse().unwrap()],
            MacAddr::new([0x02, 0, 0, 0, 0, 0x01]),
        )
    }

    fn dev_v6() -> Device {
        Device::new(
            "eth0",
            vec!["fd00::1".parse().unwrap()],
            MacAddr::new([0x02, 0, 0, 0, 0, 0x01]),
        )
    }

    const DST_HW: MacAddr = MacAddr::new([0x02, 0, 0, 0, 0, 0x02]);

    #[test]
    fn test_v4_build_and_parse() {
        let mut layers = create_layers(
            5000,
            443,
            100,
            200,
            &dev_v4(),
            "10.0.0.2".parse().unwrap(),
            7,
            128,
            DST_HW,
        )
        .unwrap();
        flag_tcp(&mut layers.tcp, false, true, true);
        let frame = serialize(&layers, b"payload").unwrap();

        let ind = parse_packet(&frame).unwrap();
        assert_eq!(ind.transport, TransportKind::Tcp);
        assert_eq!(ind.src_ip, "10.0.0.1".parse::<IpAddr>().unwrap());
        assert_eq!(ind.dst_ip, "10.0.0.2".parse::<IpAddr>().unwrap());
        assert_eq!(ind.src_port, 5000);
        assert_eq!(ind.dst_port, 443);
        assert_eq!(ind.src_hw, MacAddr::new([0x02, 0, 0, 0, 0, 0x01]));
        assert_eq!(ind.seq, 100);
        assert_eq!(ind.ack, 200);
        assert!(ind.flags.psh && ind.flags.ack);
        assert!(!ind.flags.syn && !ind.flags.rst && !ind.flags.fin);
        assert_eq!(ind.payload, b"payload");
        assert_eq!(ind.src(), Addr::Tcp("10.0.0.1:5000".parse().unwrap()));
    }

    #[test]
    fn test_v4_identification_and_ttl_on_wire() {
        let layers = create_layers(
            5000,
            443,
            0,
            0,
            &dev_v4(),
            "10.0.0.2".parse().unwrap(),
            42,
            128,
            DST_HW,
        )
        .unwrap();
        let frame = serialize(&layers, b"").unwrap();

        let (_, rest) = Ethernet2Header::from_slice(&frame).unwrap();
        let (ip, _) = Ipv4Header::from_slice(rest).unwrap();
        assert_eq!(ip.identification, 42);
        assert_eq!(ip.time_to_live, 128);
        assert_eq!(ip.protocol, IpNumber::TCP);
    }

    #[test]
    fn test_empty_segment_legal() {
        let mut layers = create_layers(
            5000,
            443,
            1,
            1,
            &dev_v4(),
            "10.0.0.2".parse().unwrap(),
            0,
            128,
            DST_HW,
        )
        .unwrap();
        flag_tcp(&mut layers.tcp, false, false, true);
        let frame = serialize(&layers, &[]).unwrap();
        let ind = parse_packet(&frame).unwrap();
        assert!(ind.payload.is_empty());
        assert!(ind.flags.ack);
    }

    #[test]
    fn test_link_padding_trimmed() {
        let layers = create_layers(
            5000,
            443,
            1,
            1,
            &dev_v4(),
            "10.0.0.2".parse().unwrap(),
            0,
            128,
            DST_HW,
        )
        .unwrap();
        let mut frame = serialize(&layers, &[]).unwrap();
        // Short frames get padded to the Ethernet minimum on real links.
        while frame.len() < 60 {
            frame.push(0xAA);
        }
        let ind = parse_packet(&frame).unwrap();
        assert!(ind.payload.is_empty());
    }

    #[test]
    fn test_v6_build_and_parse() {
        let layers = create_layers(
            5000,
            443,
            9,
            10,
            &dev_v6(),
            "fd00::2".parse().unwrap(),
            0,
            64,
            DST_HW,
        )
        .unwrap();
        assert!(!layers.net.is_ipv4());
        let frame = serialize(&layers, b"six").unwrap();

        let (_, rest) = Ethernet2Header::from_slice(&frame).unwrap();
        let (ip, _) = Ipv6Header::from_slice(rest).unwrap();
        assert_eq!(ip.hop_limit, 64);

        let ind = parse_packet(&frame).unwrap();
        assert_eq!(ind.src_ip, "fd00::1".parse::<IpAddr>().unwrap());
        assert_eq!(ind.dst_ip, "fd00::2".parse::<IpAddr>().unwrap());
        assert_eq!(ind.payload, b"six");
    }

    #[test]
    fn test_family_mismatch() {
        let err = create_layers(
            5000,
            443,
            0,
            0,
            &dev_v4(),
            "fd00::2".parse().unwrap(),
            0,
            128,
            DST_HW,
        )
        .unwrap_err();
        assert!(matches!(err, LayerError::NoIpv6(_)));

        let err = create_layers(
            5000,
            443,
            0,
            0,
            &dev_v6(),
            "10.0.0.2".parse().unwrap(),
            0,
            128,
            DST_HW,
        )
        .unwrap_err();
        assert!(matches!(err, LayerError::NoIpv4(_)));
    }

    #[test]
    fn test_flag_tcp_clears_others() {
        let mut layers = create_layers(
            5000,
            443,
            0,
            0,
            &dev_v4(),
            "10.0.0.2".parse().unwrap(),
            0,
            128,
            DST_HW,
        )
        .unwrap();
        layers.tcp.rst = true;
        layers.tcp.fin = true;
        flag_tcp(&mut layers.tcp, true, false, true);
        assert!(layers.tcp.syn && layers.tcp.ack);
        assert!(!layers.tcp.rst && !layers.tcp.fin && !layers.tcp.psh);
    }

    #[test]
    fn test_parse_garbage() {
        assert!(matches!(
            parse_packet(&[0u8; 4]),
            Err(ParseError::Malformed(_))
        ));
        assert!(matches!(
            parse_packet(&[0xFFu8; 64]),
            Err(ParseError::Malformed(_))
        ));
    }

    #[test]
    fn test_parse_udp_frame() {
        let udp = UdpHeader {
            source_port: 5353,
            destination_port: 5353,
            length: 8 + 4,
            checksum: 0,
        };
        let ip = Ipv4Header::new(
            8 + 4,
            64,
            IpNumber::UDP,
            [10, 0, 0, 1],
            [10, 0, 0, 2],
        )
        .unwrap();
        let eth = Ethernet2Header {
            source: [0x02, 0, 0, 0, 0, 0x01],
            destination: [0x02, 0, 0, 0, 0, 0x02],
            ether_type: EtherType::IPV4,
        };
        let mut frame = Vec::new();
        eth.write(&mut frame).unwrap();
        ip.write(&mut frame).unwrap();
        udp.write(&mut frame).unwrap();
        frame.extend_from_slice(b"mdns");

        let ind = parse_packet(&frame).unwrap();
        assert_eq!(ind.transport, TransportKind::Udp);
        assert_eq!(ind.src_port, 5353);
        assert_eq!(ind.payload, b"mdns");
        assert_eq!(ind.src(), Addr::Udp("10.0.0.1:5353".parse().unwrap()));
    }

    #[test]
    fn test_parse_unsupported_transport() {
        let ip = Ipv4Header::new(4, 64, IpNumber::ICMP, [10, 0, 0, 1], [10, 0, 0, 2]).unwrap();
        let eth = Ethernet2Header {
            source: [0x02, 0, 0, 0, 0, 0x01],
            destination: [0x02, 0, 0, 0, 0, 0x02],
            ether_type: EtherType::IPV4,
        };
        let mut frame = Vec::new();
        eth.write(&mut frame).unwrap();
        ip.write(&mut frame).unwrap();
        frame.extend_from_slice(&[8, 0, 0, 0]);

        assert!(matches!(
            parse_packet(&frame),
            Err(ParseError::Unsupported)
        ));
    }
}
