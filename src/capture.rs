//! Capture-device seam.
//!
//! The engine drives a BPF-filtered packet capture/injection backend
//! through the [`Capture`] and [`RawConn`] traits; real backends (libpcap,
//! AF_PACKET) live outside this crate. [`MockCapture`] wires devices
//! together in memory so flows can be exercised without capture
//! privileges.

use std::fmt;
use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{channel, Receiver, Sender};
use std::sync::{Arc, Mutex, Weak};

use crate::layers::{parse_packet, Indicator, TransportKind};

/// A 48-bit hardware address.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct MacAddr([u8; 6]);

impl MacAddr {
    pub const fn new(octets: [u8; 6]) -> Self {
        Self(octets)
    }

    pub const fn octets(&self) -> [u8; 6] {
        self.0
    }
}

impl fmt::Display for MacAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let o = self.0;
        write!(
            f,
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            o[0], o[1], o[2], o[3], o[4], o[5]
        )
    }
}

/// A network interface known to the capture backend.
#[derive(Debug, Clone)]
pub struct Device {
    alias: String,
    ip_addrs: Vec<IpAddr>,
    hardware_addr: MacAddr,
}

impl Device {
    pub fn new(alias: impl Into<String>, ip_addrs: Vec<IpAddr>, hardware_addr: MacAddr) -> Self {
        Self {
            alias: alias.into(),
            ip_addrs,
            hardware_addr,
        }
    }

    pub fn alias(&self) -> &str {
        &self.alias
    }

    /// First address of the device, any family.
    pub fn ip_addr(&self) -> Option<IpAddr> {
        self.ip_addrs.first().copied()
    }

    pub fn ipv4_addr(&self) -> Option<Ipv4Addr> {
        self.ip_addrs.iter().find_map(|ip| match ip {
            IpAddr::V4(v4) => Some(*v4),
            IpAddr::V6(_) => None,
        })
    }

    pub fn ipv6_addr(&self) -> Option<Ipv6Addr> {
        self.ip_addrs.iter().find_map(|ip| match ip {
            IpAddr::V6(v6) => Some(*v6),
            IpAddr::V4(_) => None,
        })
    }

    pub fn hardware_addr(&self) -> MacAddr {
        self.hardware_addr
    }
}

/// A BPF-filtered capture/injection endpoint bound to an interface pair.
pub trait RawConn: Send + Sync {
    /// Blocks until one captured frame is available.
    fn read_frame(&self) -> io::Result<Vec<u8>>;

    /// Injects one frame, returning the number of bytes written.
    fn write_frame(&self, frame: &[u8]) -> io::Result<usize>;

    /// Closes the handle. Blocked readers return an error.
    fn close(&self);

    /// The local (source) device.
    fn local_dev(&self) -> &Device;

    /// The remote (gateway or peer) device.
    fn remote_dev(&self) -> &Device;
}

/// Opens BPF-filtered handles between two devices.
pub trait Capture: Send + Sync {
    fn open(&self, src: &Device, dst: &Device, filter: &str) -> io::Result<Arc<dyn RawConn>>;
}

/// The subset of BPF the engine emits, parsed for in-memory matching.
///
/// Supported terms: `tcp`, `dst port N`, `src port N`, `src host H`,
/// `tcp[tcpflags] & tcp-syn != 0`, `tcp[tcpflags] & tcp-syn == 0`,
/// `tcp[tcpflags] & tcp-ack != 0`, joined with `&&`; parentheses are
/// ignored.
#[derive(Debug, Clone, Default)]
struct FrameFilter {
    tcp: bool,
    dst_port: Option<u16>,
    src_port: Option<u16>,
    src_host: Option<IpAddr>,
    syn: Option<bool>,
    ack_set: bool,
}

impl FrameFilter {
    fn parse(expr: &str) -> io::Result<Self> {
        let invalid =
            || io::Error::new(io::ErrorKind::InvalidInput, format!("bad filter: {}", expr));
        let mut filter = Self::default();
        for term in expr.split("&&") {
            let term = term.trim().trim_matches(|c| c == '(' || c == ')').trim();
            if term == "tcp" {
                filter.tcp = true;
            } else if term == "tcp[tcpflags] & tcp-syn != 0" {
                filter.syn = Some(true);
            } else if term == "tcp[tcpflags] & tcp-syn == 0" {
                filter.syn = Some(false);
            } else if term == "tcp[tcpflags] & tcp-ack != 0" {
                filter.ack_set = true;
            } else if let Some(port) = term.strip_prefix("dst port ") {
                filter.dst_port = Some(port.parse().map_err(|_| invalid())?);
            } else if let Some(port) = term.strip_prefix("src port ") {
                filter.src_port = Some(port.parse().map_err(|_| invalid())?);
            } else if let Some(host) = term.strip_prefix("src host ") {
                filter.src_host = Some(host.parse().map_err(|_| invalid())?);
            } else {
                return Err(invalid());
            }
        }
        Ok(filter)
    }

    fn matches(&self, ind: &Indicator) -> bool {
        if self.tcp && ind.transport != TransportKind::Tcp {
            return false;
        }
        if let Some(port) = self.dst_port {
            if ind.dst_port != port {
                return false;
            }
        }
        if let Some(port) = self.src_port {
            if ind.src_port != port {
                return false;
            }
        }
        if let Some(host) = self.src_host {
            if ind.src_ip != host {
                return false;
            }
        }
        if let Some(syn) = self.syn {
            if ind.flags.syn != syn {
                return false;
            }
        }
        if self.ack_set && !ind.flags.ack {
            return false;
        }
        true
    }
}

type Registry = Mutex<Vec<Weak<MockRawConn>>>;

/// In-memory capture backend for tests and capture-free development.
///
/// Handles opened through one `MockCapture` form a network: a frame
/// written on a handle is delivered to every open handle whose local
/// device is the writer's remote device and whose filter matches the
/// parsed frame, in write order.
pub struct MockCapture {
    registry: Arc<Registry>,
}

impl MockCapture {
    pub fn new() -> Self {
        Self {
            registry: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Delivers a frame to every open handle on the named device,
    /// bypassing filters. Lets tests feed frames no filter would pass.
    pub fn inject(&self, dev_alias: &str, frame: &[u8]) {
        let handles = self.registry.lock().unwrap();
        for weak in handles.iter() {
            if let Some(handle) = weak.upgrade() {
                if handle.local.alias() == dev_alias {
                    handle.deliver(frame);
                }
            }
        }
    }
}

impl Default for MockCapture {
    fn default() -> Self {
        Self::new()
    }
}

impl Capture for MockCapture {
    fn open(&self, src: &Device, dst: &Device, filter: &str) -> io::Result<Arc<dyn RawConn>> {
        let filter = FrameFilter::parse(filter)?;
        let (tx, rx) = channel();
        let handle = Arc::new(MockRawConn {
            local: src.clone(),
            remote: dst.clone(),
            filter,
            rx: Mutex::new(rx),
            tx: Mutex::new(Some(tx)),
            closed: AtomicBool::new(false),
            registry: Arc::clone(&self.registry),
        });
        let mut handles = self.registry.lock().unwrap();
        handles.retain(|weak| weak.strong_count() > 0);
        handles.push(Arc::downgrade(&handle));
        Ok(handle)
    }
}

struct MockRawConn {
    local: Device,
    remote: Device,
    filter: FrameFilter,
    rx: Mutex<Receiver<Vec<u8>>>,
    tx: Mutex<Option<Sender<Vec<u8>>>>,
    closed: AtomicBool,
    registry: Arc<Registry>,
}

impl MockRawConn {
    fn deliver(&self, frame: &[u8]) {
        if let Some(tx) = self.tx.lock().unwrap().as_ref() {
            let _ = tx.send(frame.to_vec());
        }
    }
}

fn closed_err() -> io::Error {
    io::Error::new(io::ErrorKind::BrokenPipe, "capture handle closed")
}

impl RawConn for MockRawConn {
    fn read_frame(&self) -> io::Result<Vec<u8>> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(closed_err());
        }
        let rx = self.rx.lock().unwrap();
        rx.recv().map_err(|_| closed_err())
    }

    fn write_frame(&self, frame: &[u8]) -> io::Result<usize> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(closed_err());
        }
        if let Ok(ind) = parse_packet(frame) {
            let handles = self.registry.lock().unwrap();
            for weak in handles.iter() {
                if let Some(handle) = weak.upgrade() {
                    if handle.local.alias() == self.remote.alias() && handle.filter.matches(&ind) {
                        handle.deliver(frame);
                    }
                }
            }
        }
        Ok(frame.len())
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        // Dropping the sender wakes a blocked read_frame with an error.
        self.tx.lock().unwrap().take();
    }

    fn local_dev(&self) -> &Device {
        &self.local
    }

    fn remote_dev(&self) -> &Device {
        &self.remote
    }
}
