//! Per-connection passive listener.
//!
//! Where the multicast endpoint serves every peer through one shared data
//! handle, a [`Listener`] demultiplexes incoming SYNs into distinct
//! endpoints, each owning a data-plane handle filtered to its remote.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::addr::Addr;
use crate::capture::{Capture, Device, RawConn};
use crate::cipher::Crypt;
use crate::error::{ErrorKind, Op, OpError};
use crate::layers::parse_packet;

use super::conn::Conn;
use super::consts::syn_filter;
use super::dial::{dial_passive, listen_addr};
use super::peers::Peer;

/// A passive factory producing one endpoint per accepted SYN.
pub struct Listener {
    capture: Arc<dyn Capture>,
    raw: Arc<dyn RawConn>,
    src_port: u16,
    crypt: Arc<dyn Crypt>,
    closed: AtomicBool,
}

/// Opens a SYN-plane capture on `src_port`.
pub fn listen(
    capture: &Arc<dyn Capture>,
    src_dev: &Device,
    dst_dev: &Device,
    src_port: u16,
    crypt: Arc<dyn Crypt>,
) -> Result<Listener, OpError> {
    let raw = capture
        .open(src_dev, dst_dev, &syn_filter(src_port))
        .map_err(|e| {
            OpError::new(
                Op::Listen,
                Some(listen_addr(src_dev, src_port)),
                None,
                ErrorKind::CaptureOpen(e),
            )
        })?;
    Ok(Listener {
        capture: Arc::clone(capture),
        raw,
        src_port,
        crypt,
        closed: AtomicBool::new(false),
    })
}

impl Listener {
    /// Blocks for one SYN, then completes the passive handshake on a fresh
    /// endpoint bound to that remote.
    pub fn accept(&self) -> Result<Arc<Conn>, OpError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(self.err(Op::Accept, None, ErrorKind::Closed));
        }

        let frame = self
            .raw
            .read_frame()
            .map_err(|e| self.err(Op::Accept, None, ErrorKind::CaptureRead(e)))?;
        let ind = parse_packet(&frame).map_err(|e| self.err(Op::Accept, None, e.into()))?;
        let remote = ind.src_ip_port();

        let conn = dial_passive(
            &self.capture,
            self.raw.local_dev(),
            self.raw.remote_dev(),
            self.src_port,
            remote,
            Arc::clone(&self.crypt),
        )
        .map_err(|kind| self.err(Op::Dial, Some(Addr::Tcp(remote)), kind))?;

        conn.install_peer(remote, Arc::new(Peer::new(Arc::clone(&self.crypt), 0, 0)));
        conn.handshake_synack(&ind)
            .map_err(|kind| self.err(Op::Handshake, Some(Addr::Tcp(remote)), kind))?;

        Ok(conn)
    }

    /// Closes the SYN-plane handle; a blocked `accept` returns an error.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.raw.close();
    }

    /// The synthetic local address.
    pub fn addr(&self) -> Addr {
        listen_addr(self.raw.local_dev(), self.src_port)
    }

    /// The local device.
    pub fn local_dev(&self) -> &Device {
        self.raw.local_dev()
    }

    fn err(&self, op: Op, remote: Option<Addr>, kind: ErrorKind) -> OpError {
        OpError::new(op, Some(self.addr()), remote, kind)
    }
}
