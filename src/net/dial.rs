//! Connection establishment.
//!
//! `dial` runs the active three-way handshake and returns an endpoint bound
//! to one remote. `listen_multicast` opens the shared passive endpoint: a
//! SYN-plane handle feeding a background SYN/ACK responder and one data
//! handle shared by every peer.

use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use std::thread;

use log::error;

use crate::addr::{Addr, IpPort};
use crate::capture::{Capture, Device, RawConn};
use crate::cipher::Crypt;
use crate::error::{ErrorKind, Op, OpError};
use crate::layers::parse_packet;

use super::conn::Conn;
use super::consts::{data_filter, multicast_data_filter, syn_filter};

/// Dials `dst_addr` from the local synthetic `src_port`.
///
/// The handshake runs on its own ACK-filtered handle, which is closed on
/// every exit path; the returned endpoint owns a data-plane handle bound to
/// the remote.
pub fn dial(
    capture: &Arc<dyn Capture>,
    src_dev: &Device,
    dst_dev: &Device,
    src_port: u16,
    dst_addr: IpPort,
    crypt: Arc<dyn Crypt>,
) -> Result<Arc<Conn>, OpError> {
    let conn = Arc::new(Conn::new(src_port, Some(dst_addr), crypt));

    conn.handshake(capture.as_ref(), src_dev, dst_dev, dst_addr)
        .map_err(|kind| dial_err(src_dev, src_port, dst_addr, kind))?;

    let raw = capture
        .open(src_dev, dst_dev, &data_filter(src_port, &dst_addr))
        .map_err(|e| dial_err(src_dev, src_port, dst_addr, ErrorKind::CaptureOpen(e)))?;
    conn.set_raw(raw);

    Ok(conn)
}

/// Opens an endpoint bound to one remote without handshaking. The accept
/// path installs the peer and answers the SYN itself.
pub(crate) fn dial_passive(
    capture: &Arc<dyn Capture>,
    src_dev: &Device,
    dst_dev: &Device,
    src_port: u16,
    dst_addr: IpPort,
    crypt: Arc<dyn Crypt>,
) -> Result<Arc<Conn>, ErrorKind> {
    let raw = capture
        .open(src_dev, dst_dev, &data_filter(src_port, &dst_addr))
        .map_err(ErrorKind::CaptureOpen)?;
    let conn = Arc::new(Conn::new(src_port, Some(dst_addr), crypt));
    conn.set_raw(raw);
    Ok(conn)
}

/// Opens a shared passive endpoint on `src_port` serving many peers.
///
/// A background task reads the SYN plane and answers each SYN with SYN/ACK
/// through the shared data handle. All peers' data arrives on that one
/// handle; readers demultiplex by the reported source address.
pub fn listen_multicast(
    capture: &Arc<dyn Capture>,
    src_dev: &Device,
    dst_dev: &Device,
    src_port: u16,
    crypt: Arc<dyn Crypt>,
) -> Result<Arc<Conn>, OpError> {
    let listen_err = |kind| OpError::new(Op::Listen, Some(listen_addr(src_dev, src_port)), None, kind);

    let hs = capture
        .open(src_dev, dst_dev, &syn_filter(src_port))
        .map_err(|e| listen_err(ErrorKind::CaptureOpen(e)))?;
    let raw = capture
        .open(src_dev, dst_dev, &multicast_data_filter(src_port))
        .map_err(|e| listen_err(ErrorKind::CaptureOpen(e)))?;

    let conn = Arc::new(Conn::new(src_port, None, crypt));
    conn.set_raw(raw);
    conn.set_syn_raw(Arc::clone(&hs));

    let loop_conn = Arc::clone(&conn);
    thread::spawn(move || syn_loop(loop_conn, hs));

    Ok(conn)
}

/// Background SYN/ACK responder of a multicast endpoint.
///
/// Per-frame failures are logged and skipped so one misbehaving peer never
/// disrupts the others. A read error ends the loop silently iff the
/// endpoint is closed.
fn syn_loop(conn: Arc<Conn>, hs: Arc<dyn RawConn>) {
    loop {
        let frame = match hs.read_frame() {
            Ok(frame) => frame,
            Err(e) => {
                if conn.is_closed() {
                    return;
                }
                error!("listen: read device {}: {}", hs.local_dev().alias(), e);
                continue;
            }
        };
        let ind = match parse_packet(&frame) {
            Ok(ind) => ind,
            Err(e) => {
                error!("handshake: parse packet: {}", e);
                continue;
            }
        };
        if ind.flags.syn {
            if let Err(e) = conn.handshake_synack(&ind) {
                error!("handshake with {}: {}", ind.src(), e);
            }
        }
    }
}

fn dial_err(src_dev: &Device, src_port: u16, dst: IpPort, kind: ErrorKind) -> OpError {
    let local_ip = if dst.ip.is_ipv6() {
        src_dev.ipv6_addr().map(IpAddr::V6)
    } else {
        src_dev.ipv4_addr().map(IpAddr::V4)
    };
    OpError::new(
        Op::Dial,
        local_ip.map(|ip| Addr::Tcp(IpPort::new(ip, src_port))),
        Some(Addr::Tcp(dst)),
        kind,
    )
}

pub(crate) fn listen_addr(dev: &Device, port: u16) -> Addr {
    let ip = dev.ip_addr().unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED));
    Addr::Tcp(IpPort::new(ip, port))
}
