//! Per-peer transfer state.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, RwLock};

use crate::addr::IpPort;
use crate::cipher::Crypt;

/// Sequence and acknowledgement cursors for one peer. All arithmetic wraps
/// modulo 2^32.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PeerState {
    /// Next sequence number to send.
    pub seq: u32,
    /// Next acknowledgement to send, one past the last payload byte seen.
    pub ack: u32,
}

/// A remote endpoint with an established synthetic flow: its cipher handle
/// and transfer cursors.
pub struct Peer {
    crypt: Arc<dyn Crypt>,
    state: Mutex<PeerState>,
}

impl Peer {
    pub fn new(crypt: Arc<dyn Crypt>, seq: u32, ack: u32) -> Self {
        Self {
            crypt,
            state: Mutex::new(PeerState { seq, ack }),
        }
    }

    pub fn crypt(&self) -> &dyn Crypt {
        self.crypt.as_ref()
    }

    /// Locks the cursors. Writers hold the guard across build and inject so
    /// one peer's segments carry strictly ordered sequence numbers.
    pub fn state(&self) -> MutexGuard<'_, PeerState> {
        self.state.lock().unwrap()
    }

    /// Snapshot of the cursors.
    pub fn snapshot(&self) -> PeerState {
        *self.state()
    }
}

/// Concurrent map from endpoint to peer state. Lookups on the data path
/// take the read lock; handshake insertions take the write lock.
#[derive(Default)]
pub struct PeerTable {
    peers: RwLock<HashMap<IpPort, Arc<Peer>>>,
}

impl PeerTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts or overwrites the entry for `key`.
    pub fn insert(&self, key: IpPort, peer: Arc<Peer>) {
        self.peers.write().unwrap().insert(key, peer);
    }

    pub fn get(&self, key: &IpPort) -> Option<Arc<Peer>> {
        self.peers.read().unwrap().get(key).cloned()
    }

    pub fn remove(&self, key: &IpPort) -> Option<Arc<Peer>> {
        self.peers.write().unwrap().remove(key)
    }

    pub fn len(&self) -> usize {
        self.peers.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
