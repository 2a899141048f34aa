//! tcpveil - a point-to-point datagram transport disguised as a TCP flow.
//!
//! A client and a server, each holding raw packet-capture privileges,
//! exchange encrypted application payloads as synthetic TCP segments. On
//! the wire the flow looks like an ordinary TCP connection: a valid
//! three-way handshake, monotonic sequence and acknowledgement numbers,
//! plausible IPv4 identification. No kernel socket exists at either end;
//! every frame is crafted and captured in user space.
//!
//! This crate provides:
//! - `net`: the pseudo-connection engine (`dial`, `listen_multicast`,
//!   `Listener`, `Conn`)
//! - `layers`: frame construction and decode for Ethernet/IP/TCP
//! - `capture`: the seam to a BPF-filtered capture backend, plus an
//!   in-memory mock
//! - `addr`: endpoint address types
//! - `cipher`: the per-peer payload cipher seam
//!
//! The endpoint surface is packet-oriented: reads report UDP-shaped source
//! addresses even though the wire frames are TCP, so a reliable-datagram
//! protocol can sit on top and treat this as a packet socket. Full TCP
//! semantics (retransmission, windows, options, teardown) are deliberately
//! absent, and the far end must be a peer implementation.
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use tcpveil::{dial, listen_multicast, Capture, Crypt, DummyCrypt, Device};
//!
//! let capture: Arc<dyn Capture> = backend();        // pcap-backed Capture
//! let crypt: Arc<dyn Crypt> = Arc::new(DummyCrypt); // or AeadCrypt
//!
//! let conn = dial(&capture, &local_dev, &gateway_dev, 5000,
//!                 "203.0.113.7:443".parse()?, crypt)?;
//! conn.write(b"payload")?;
//!
//! let mut buf = [0u8; 2048];
//! let (n, from) = conn.read_from(&mut buf)?;
//! ```

pub mod addr;
pub mod capture;
pub mod cipher;
pub mod error;
pub mod layers;
pub mod net;

pub use addr::{format_ip, Addr, AddrError, IpId, IpPort};
pub use capture::{Capture, Device, MacAddr, MockCapture, RawConn};
pub use cipher::{AeadCrypt, Crypt, CryptError, DummyCrypt, KEY_SIZE};
pub use error::{ErrorKind, Op, OpError};
pub use layers::{
    create_layers, flag_tcp, parse_packet, serialize, Indicator, LayerError, Layers, NetLayer,
    ParseError, TcpFlags, TransportKind,
};
pub use net::{
    dial, listen, listen_multicast, Conn, Listener, Peer, PeerState, PeerTable, DEFAULT_TTL,
    HANDSHAKE_TIMEOUT, SYN_ACK_TTL,
};
