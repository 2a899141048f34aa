//! The datagram endpoint.
//!
//! A [`Conn`] exchanges encrypted application payloads as synthetic TCP
//! segments through a capture handle: writes emit one PSH/ACK segment per
//! call, reads deliver one decrypted payload per call, and the three-way
//! handshake emitters drive the peer table before any data flows.

use std::net::{IpAddr, Ipv4Addr};
use std::sync::atomic::{AtomicBool, AtomicU16, Ordering};
use std::sync::mpsc::channel;
use std::sync::{Arc, RwLock};
use std::thread;
use std::time::Instant;

use log::info;

use crate::addr::{Addr, IpPort};
use crate::capture::{Capture, Device, RawConn};
use crate::cipher::Crypt;
use crate::error::{ErrorKind, Op, OpError};
use crate::layers::{create_layers, flag_tcp, parse_packet, serialize, Indicator, TransportKind};

use super::consts::{handshake_filter, DEFAULT_TTL, HANDSHAKE_TIMEOUT, SYN_ACK_TTL};
use super::peers::{Peer, PeerTable};

/// A synthetic-TCP datagram endpoint.
///
/// The wire carries TCP, but the surface is a packet socket: reads report
/// UDP-shaped source addresses on purpose, and the reliable-datagram layer
/// above must not attempt TCP semantics. Dialed endpoints carry a fixed
/// remote; multicast endpoints serve every peer of the shared data plane
/// and demultiplex by source address.
pub struct Conn {
    raw: RwLock<Option<Arc<dyn RawConn>>>,
    syn_raw: RwLock<Option<Arc<dyn RawConn>>>,
    src_port: u16,
    dst_addr: Option<IpPort>,
    crypt: Arc<dyn Crypt>,
    peers: PeerTable,
    id: Arc<AtomicU16>,
    closed: Arc<AtomicBool>,
    read_deadline: RwLock<Option<Instant>>,
    write_deadline: RwLock<Option<Instant>>,
}

impl std::fmt::Debug for Conn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Conn")
            .field("src_port", &self.src_port)
            .field("dst_addr", &self.dst_addr)
            .field("closed", &self.closed.load(Ordering::Relaxed))
            .finish()
    }
}

impl Conn {
    pub(crate) fn new(src_port: u16, dst_addr: Option<IpPort>, crypt: Arc<dyn Crypt>) -> Self {
        Self {
            raw: RwLock::new(None),
            syn_raw: RwLock::new(None),
            src_port,
            dst_addr,
            crypt,
            peers: PeerTable::new(),
            id: Arc::new(AtomicU16::new(0)),
            closed: Arc::new(AtomicBool::new(false)),
            read_deadline: RwLock::new(None),
            write_deadline: RwLock::new(None),
        }
    }

    pub(crate) fn set_raw(&self, raw: Arc<dyn RawConn>) {
        *self.raw.write().unwrap() = Some(raw);
    }

    pub(crate) fn set_syn_raw(&self, raw: Arc<dyn RawConn>) {
        *self.syn_raw.write().unwrap() = Some(raw);
    }

    pub(crate) fn install_peer(&self, key: IpPort, peer: Arc<Peer>) {
        self.peers.insert(key, peer);
    }

    #[cfg(test)]
    pub(crate) fn peer_snapshot(&self, key: &IpPort) -> Option<super::peers::PeerState> {
        self.peers.get(key).map(|peer| peer.snapshot())
    }

    #[cfg(test)]
    pub(crate) fn ipv4_id(&self) -> u16 {
        self.id.load(Ordering::SeqCst)
    }

    fn raw(&self) -> Result<Arc<dyn RawConn>, ErrorKind> {
        self.raw.read().unwrap().clone().ok_or(ErrorKind::Closed)
    }

    /// Local device of the data-plane handle.
    pub fn local_dev(&self) -> Option<Device> {
        self.raw
            .read()
            .unwrap()
            .as_ref()
            .map(|raw| raw.local_dev().clone())
    }

    /// Remote device of the data-plane handle.
    pub fn remote_dev(&self) -> Option<Device> {
        self.raw
            .read()
            .unwrap()
            .as_ref()
            .map(|raw| raw.remote_dev().clone())
    }

    /// Local endpoint, UDP-shaped for the layer above.
    pub fn local_addr(&self) -> Addr {
        let ip = self
            .local_dev()
            .and_then(|dev| dev.ip_addr())
            .unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED));
        Addr::Udp(IpPort::new(ip, self.src_port))
    }

    /// The dial target; `None` on a multicast endpoint.
    pub fn remote_addr(&self) -> Option<Addr> {
        self.dst_addr.map(Addr::Tcp)
    }

    /// Local address matching the family of `remote`, for error context.
    fn cor_local_addr(&self, remote: Option<IpPort>) -> Option<Addr> {
        let dev = self.local_dev()?;
        let ip = match remote {
            Some(ipp) if ipp.ip.is_ipv6() => dev.ipv6_addr().map(IpAddr::V6),
            Some(_) => dev.ipv4_addr().map(IpAddr::V4),
            None => dev.ip_addr(),
        }?;
        Some(Addr::Tcp(IpPort::new(ip, self.src_port)))
    }

    fn op_err(&self, op: Op, remote: Option<Addr>, kind: ErrorKind) -> OpError {
        OpError::new(
            op,
            self.cor_local_addr(remote.as_ref().and_then(Addr::ip_port)),
            remote,
            kind,
        )
    }

    /// Sets both deadlines. `None` disables timeouts on subsequent calls.
    pub fn set_deadline(&self, deadline: Option<Instant>) {
        self.set_read_deadline(deadline);
        self.set_write_deadline(deadline);
    }

    pub fn set_read_deadline(&self, deadline: Option<Instant>) {
        *self.read_deadline.write().unwrap() = deadline;
    }

    pub fn set_write_deadline(&self, deadline: Option<Instant>) {
        *self.write_deadline.write().unwrap() = deadline;
    }

    /// Reads one decrypted payload; see [`Conn::read_from`].
    pub fn read(&self, buf: &mut [u8]) -> Result<usize, OpError> {
        self.read_from(buf).map(|(n, _)| n)
    }

    /// Reads one frame and returns the decrypted payload length and the
    /// source address.
    ///
    /// A frame with no application payload returns `(0, addr)` without
    /// touching peer state; callers poll past it. If `buf` is shorter than
    /// the payload the copy truncates but the full decrypted length is
    /// returned.
    pub fn read_from(&self, buf: &mut [u8]) -> Result<(usize, Addr), OpError> {
        match self.read_from_inner(buf) {
            Ok(result) => Ok(result),
            Err((remote, kind)) => Err(self.op_err(Op::Read, remote, kind)),
        }
    }

    fn read_from_inner(&self, buf: &mut [u8]) -> Result<(usize, Addr), (Option<Addr>, ErrorKind)> {
        let raw = self.raw().map_err(|kind| (None, kind))?;
        let deadline = *self.read_deadline.read().unwrap();

        let reader = Arc::clone(&raw);
        let frame = race_deadline(deadline, move || {
            reader.read_frame().map_err(ErrorKind::CaptureRead)
        })
        .map_err(|kind| (None, kind))?;

        let ind = parse_packet(&frame).map_err(|e| (None, e.into()))?;

        // TCP frames report UDP-shaped sources: the layer above speaks
        // packet socket, not TCP.
        let addr = match ind.transport {
            TransportKind::Tcp => Addr::Udp(ind.src_ip_port()),
            TransportKind::Udp => ind.src(),
        };

        if ind.payload.is_empty() {
            return Ok((0, addr));
        }

        let key = ind.src_ip_port();
        let peer = self
            .peers
            .get(&key)
            .ok_or((Some(addr), ErrorKind::UnauthorizedPeer(key)))?;
        {
            let mut state = peer.state();
            state.ack = state.ack.wrapping_add(ind.payload.len() as u32);
        }

        let plaintext = peer
            .crypt()
            .decrypt(&ind.payload)
            .map_err(|e| (Some(addr), e.into()))?;
        let n = plaintext.len().min(buf.len());
        buf[..n].copy_from_slice(&plaintext[..n]);
        Ok((plaintext.len(), addr))
    }

    /// Writes to the dial target.
    pub fn write(&self, buf: &[u8]) -> Result<usize, OpError> {
        match self.remote_addr() {
            Some(remote) => self.write_to(buf, &remote),
            None => Err(self.op_err(
                Op::Write,
                None,
                ErrorKind::UnsupportedAddr("no remote address".to_string()),
            )),
        }
    }

    /// Encrypts `buf` and emits one PSH/ACK segment to `addr`.
    ///
    /// TCP- and UDP-shaped addresses are both accepted; other shapes are
    /// not. Returns the plaintext length.
    pub fn write_to(&self, buf: &[u8], addr: &Addr) -> Result<usize, OpError> {
        let dst = match addr {
            Addr::Tcp(ipp) | Addr::Udp(ipp) => *ipp,
            other => {
                return Err(self.op_err(
                    Op::Write,
                    Some(*other),
                    ErrorKind::UnsupportedAddr(other.to_string()),
                ))
            }
        };
        self.write_to_ip_port(buf, dst)
            .map_err(|kind| self.op_err(Op::Write, Some(*addr), kind))?;
        Ok(buf.len())
    }

    fn write_to_ip_port(&self, buf: &[u8], dst: IpPort) -> Result<(), ErrorKind> {
        let raw = self.raw()?;
        let peer = self.peers.get(&dst).ok_or(ErrorKind::UnknownPeer(dst))?;
        let deadline = *self.write_deadline.read().unwrap();

        let id = Arc::clone(&self.id);
        let src_port = self.src_port;
        let payload = buf.to_vec();
        race_deadline(deadline, move || {
            emit_segment(raw.as_ref(), peer.as_ref(), src_port, dst, &id, &payload)
        })
    }

    /// Active three-way handshake toward `dst`. The handshake handle is
    /// closed on every exit path.
    pub(crate) fn handshake(
        &self,
        capture: &dyn Capture,
        src_dev: &Device,
        dst_dev: &Device,
        dst: IpPort,
    ) -> Result<(), ErrorKind> {
        let hs = capture
            .open(src_dev, dst_dev, &handshake_filter(self.src_port, &dst))
            .map_err(ErrorKind::CaptureOpen)?;
        let result = self.handshake_exchange(&hs, dst);
        hs.close();
        result
    }

    fn handshake_exchange(&self, hs: &Arc<dyn RawConn>, dst: IpPort) -> Result<(), ErrorKind> {
        self.handshake_syn(hs, dst)?;
        info!("connect to {}", dst);

        let start = Instant::now();
        let reader = Arc::clone(hs);
        let frame = match race_deadline(Some(start + HANDSHAKE_TIMEOUT), move || {
            reader.read_frame().map_err(ErrorKind::CaptureRead)
        }) {
            Ok(frame) => frame,
            Err(ErrorKind::Timeout) => return Err(ErrorKind::HandshakeTimeout),
            Err(kind) => return Err(kind),
        };

        let ind = parse_packet(&frame)?;
        if ind.transport != TransportKind::Tcp {
            return Err(ErrorKind::UnsupportedTransport("udp"));
        }
        if ind.flags.rst {
            return Err(ErrorKind::HandshakeReset);
        }
        if !ind.flags.syn {
            return Err(ErrorKind::HandshakeProtocol);
        }
        let latency = start.elapsed();

        self.handshake_ack(&ind, hs)?;
        info!(
            "connected to {} in {:.3} ms (two-way)",
            dst,
            latency.as_secs_f64() * 1000.0
        );
        Ok(())
    }

    /// Emits the opening SYN toward `dst` and installs the peer at seq 1.
    pub(crate) fn handshake_syn(&self, hs: &Arc<dyn RawConn>, dst: IpPort) -> Result<(), ErrorKind> {
        let peer = Arc::new(Peer::new(Arc::clone(&self.crypt), 0, 0));
        let frame_id = self.reserve_id(dst.ip);
        let mut layers = create_layers(
            self.src_port,
            dst.port,
            0,
            0,
            hs.local_dev(),
            dst.ip,
            frame_id,
            DEFAULT_TTL,
            hs.remote_dev().hardware_addr(),
        )?;
        flag_tcp(&mut layers.tcp, true, false, false);
        let frame = serialize(&layers, &[])?;
        hs.write_frame(&frame).map_err(ErrorKind::CaptureWrite)?;

        // The SYN consumes one sequence number.
        peer.state().seq = 1;
        self.peers.insert(dst, peer);
        Ok(())
    }

    /// Replies SYN/ACK to a captured SYN through the data-plane handle and
    /// installs the peer. A retry overwrites any partial entry.
    pub(crate) fn handshake_synack(&self, ind: &Indicator) -> Result<(), ErrorKind> {
        if ind.transport != TransportKind::Tcp {
            return Err(ErrorKind::UnsupportedTransport("udp"));
        }
        let raw = self.raw()?;
        let src = ind.src_ip_port();
        let peer = Arc::new(Peer::new(
            Arc::clone(&self.crypt),
            0,
            ind.seq.wrapping_add(1),
        ));
        let ack = peer.snapshot().ack;
        let frame_id = self.reserve_id(src.ip);
        let mut layers = create_layers(
            ind.dst_port,
            ind.src_port,
            0,
            ack,
            raw.local_dev(),
            src.ip,
            frame_id,
            SYN_ACK_TTL,
            ind.src_hw,
        )?;
        flag_tcp(&mut layers.tcp, true, false, true);
        let frame = serialize(&layers, &[])?;
        raw.write_frame(&frame).map_err(ErrorKind::CaptureWrite)?;

        // The SYN/ACK consumes one sequence number.
        peer.state().seq = 1;
        self.peers.insert(src, peer);
        Ok(())
    }

    /// Completes the active handshake: records the ack cursor from the
    /// SYN/ACK and emits the final ACK.
    pub(crate) fn handshake_ack(
        &self,
        ind: &Indicator,
        hs: &Arc<dyn RawConn>,
    ) -> Result<(), ErrorKind> {
        let src = ind.src_ip_port();
        let peer = self.peers.get(&src).ok_or(ErrorKind::UnknownPeer(src))?;
        let (seq, ack) = {
            let mut state = peer.state();
            state.ack = ind.seq.wrapping_add(1);
            (state.seq, state.ack)
        };
        let frame_id = self.reserve_id(src.ip);
        let mut layers = create_layers(
            ind.dst_port,
            ind.src_port,
            seq,
            ack,
            hs.local_dev(),
            src.ip,
            frame_id,
            DEFAULT_TTL,
            ind.src_hw,
        )?;
        flag_tcp(&mut layers.tcp, false, false, true);
        let frame = serialize(&layers, &[])?;
        hs.write_frame(&frame).map_err(ErrorKind::CaptureWrite)?;
        Ok(())
    }

    /// Reserves the next IPv4 identification; IPv6 frames carry none.
    fn reserve_id(&self, dst_ip: IpAddr) -> u16 {
        if dst_ip.is_ipv4() {
            self.id.fetch_add(1, Ordering::SeqCst)
        } else {
            0
        }
    }

    /// Marks the endpoint closed and closes its capture handles. Blocked
    /// readers and the multicast background loop observe the error and
    /// stop.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        if let Some(raw) = self.raw.write().unwrap().take() {
            raw.close();
        }
        if let Some(raw) = self.syn_raw.write().unwrap().take() {
            raw.close();
        }
    }

    /// Whether [`Conn::close`] has been called.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

/// Runs `work`, racing it against `deadline` over a rendezvous channel when
/// one is set. A deadline already in the past fails without starting the
/// work. A racer that loses stays parked until its blocking call returns
/// and drops its result on the dead channel; `close` is what unblocks a
/// parked reader for good.
fn race_deadline<T, F>(deadline: Option<Instant>, work: F) -> Result<T, ErrorKind>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, ErrorKind> + Send + 'static,
{
    let deadline = match deadline {
        None => return work(),
        Some(deadline) => deadline,
    };
    let now = Instant::now();
    if deadline <= now {
        return Err(ErrorKind::Timeout);
    }

    let (tx, rx) = channel();
    let work_tx = tx.clone();
    thread::spawn(move || {
        let _ = work_tx.send(work());
    });
    thread::spawn(move || {
        thread::sleep(deadline - now);
        let _ = tx.send(Err(ErrorKind::Timeout));
    });
    rx.recv().unwrap_or(Err(ErrorKind::Closed))
}

/// Builds, serialises and injects one PSH/ACK data segment, advancing the
/// peer's send cursor by the ciphertext length. The peer state lock is held
/// across the whole emit so concurrent writes to one peer serialise.
fn emit_segment(
    raw: &dyn RawConn,
    peer: &Peer,
    src_port: u16,
    dst: IpPort,
    id: &AtomicU16,
    payload: &[u8],
) -> Result<(), ErrorKind> {
    let mut state = peer.state();
    let frame_id = if dst.ip.is_ipv4() {
        id.fetch_add(1, Ordering::SeqCst)
    } else {
        0
    };
    let mut layers = create_layers(
        src_port,
        dst.port,
        state.seq,
        state.ack,
        raw.local_dev(),
        dst.ip,
        frame_id,
        DEFAULT_TTL,
        raw.remote_dev().hardware_addr(),
    )?;
    flag_tcp(&mut layers.tcp, false, true, true);
    let ciphertext = peer.crypt().encrypt(payload)?;
    let frame = serialize(&layers, &ciphertext)?;
    raw.write_frame(&frame).map_err(ErrorKind::CaptureWrite)?;
    state.seq = state.seq.wrapping_add(ciphertext.len() as u32);
    Ok(())
}
