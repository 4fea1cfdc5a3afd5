//! Connected-peer bookkeeping.

use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::fmt;

/// Opaque identifier assigned to a paired device by the transport.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerId(String);

impl PeerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PeerId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

/// A reachable paired device. Never persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerDescriptor {
    pub id: PeerId,
    pub display_name: String,
    /// Reachable over a direct short-range link
    pub nearby: bool,
}

impl PeerDescriptor {
    pub fn new(id: impl Into<String>, display_name: impl Into<String>) -> Self {
        Self {
            id: PeerId::new(id),
            display_name: display_name.into(),
            nearby: true,
        }
    }
}

/// Set of currently connected peers, keyed by id.
///
/// Updated from transport events and from explicit `connected_peers()`
/// queries. Readers always get a copy; the lock is never held across an
/// await.
#[derive(Debug, Default)]
pub struct PeerRegistry {
    peers: RwLock<BTreeMap<PeerId, PeerDescriptor>>,
}

impl PeerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a peer as connected. Returns true if it was not known before.
    pub fn connect(&self, peer: PeerDescriptor) -> bool {
        self.peers.write().insert(peer.id.clone(), peer).is_none()
    }

    pub fn disconnect(&self, id: &PeerId) -> Option<PeerDescriptor> {
        self.peers.write().remove(id)
    }

    /// Replace the whole set with a fresh snapshot from the transport.
    pub fn replace(&self, peers: impl IntoIterator<Item = PeerDescriptor>) {
        let fresh = peers
            .into_iter()
            .map(|p| (p.id.clone(), p))
            .collect::<BTreeMap<_, _>>();
        *self.peers.write() = fresh;
    }

    pub fn is_connected(&self) -> bool {
        !self.peers.read().is_empty()
    }

    pub fn contains(&self, id: &PeerId) -> bool {
        self.peers.read().contains_key(id)
    }

    pub fn list(&self) -> Vec<PeerDescriptor> {
        self.peers.read().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.peers.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.read().is_empty()
    }
}
