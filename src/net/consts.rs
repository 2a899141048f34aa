//! Protocol constants of the synthetic flow.

use std::time::Duration;

use crate::addr::IpPort;

/// How long the active side waits for the SYN/ACK reply.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(3);

/// TTL / hop limit on SYN, ACK and data segments.
pub const DEFAULT_TTL: u8 = 128;

/// TTL / hop limit on SYN/ACK responses.
pub const SYN_ACK_TTL: u8 = 64;

/// Active data plane: every TCP segment from the remote endpoint to the
/// local synthetic port.
pub(crate) fn data_filter(src_port: u16, dst: &IpPort) -> String {
    format!(
        "tcp && dst port {} && (src host {} && src port {})",
        src_port, dst.ip, dst.port
    )
}

/// Active handshake plane: ACK-carrying segments from the remote endpoint.
pub(crate) fn handshake_filter(src_port: u16, dst: &IpPort) -> String {
    format!(
        "tcp && tcp[tcpflags] & tcp-ack != 0 && dst port {} && (src host {} && src port {})",
        src_port, dst.ip, dst.port
    )
}

/// Passive SYN plane: opening segments from any peer.
pub(crate) fn syn_filter(src_port: u16) -> String {
    format!("tcp && tcp[tcpflags] & tcp-syn != 0 && dst port {}", src_port)
}

/// Passive shared data plane: everything but SYNs, any peer.
pub(crate) fn multicast_data_filter(src_port: u16) -> String {
    format!("tcp && tcp[tcpflags] & tcp-syn == 0 && dst port {}", src_port)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_constant_values() {
        assert_eq!(HANDSHAKE_TIMEOUT.as_secs(), 3);
        assert_eq!(DEFAULT_TTL, 128);
        assert_eq!(SYN_ACK_TTL, 64);
    }

    #[test]
    fn test_filter_expressions() {
        let dst: IpPort = "10.0.0.2:443".parse().unwrap();
        assert_eq!(
            data_filter(5000, &dst),
            "tcp && dst port 5000 && (src host 10.0.0.2 && src port 443)"
        );
        assert_eq!(
            handshake_filter(5000, &dst),
            "tcp && tcp[tcpflags] & tcp-ack != 0 && dst port 5000 && (src host 10.0.0.2 && src port 443)"
        );
        assert_eq!(
            syn_filter(443),
            "tcp && tcp[tcpflags] & tcp-syn != 0 && dst port 443"
        );
        assert_eq!(
            multicast_data_filter(443),
            "tcp && tcp[tcpflags] & tcp-syn == 0 && dst port 443"
        );
    }

    #[test]
    fn test_filter_ipv6_host_is_bare() {
        let dst: IpPort = "[fd00::2]:443".parse().unwrap();
        assert_eq!(
            data_filter(5000, &dst),
            "tcp && dst port 5000 && (src host fd00::2 && src port 443)"
        );
    }
}
