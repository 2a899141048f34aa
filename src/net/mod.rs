//! The synthetic-TCP connection engine.
//!
//! This module provides:
//! - `Conn`: the datagram endpoint carrying encrypted payloads in TCP
//!   segments
//! - `dial`: the active side of the fabricated three-way handshake
//! - `listen_multicast`: a shared passive endpoint serving many peers
//! - `Listener`: a passive factory producing one endpoint per peer
//! - `PeerTable`: per-peer cipher handles and seq/ack cursors
//!
//! Handshake deadline, TTLs and the capture filter expressions live in
//! `consts`.

mod conn;
mod consts;
mod dial;
mod listener;
mod peers;

pub use conn::Conn;
pub use consts::{DEFAULT_TTL, HANDSHAKE_TIMEOUT, SYN_ACK_TTL};
pub use dial::{dial, listen_multicast};
pub use listener::{listen, Listener};
pub use peers::{Peer, PeerState, PeerTable};
