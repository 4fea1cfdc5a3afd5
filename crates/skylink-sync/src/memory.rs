//! In-process transport linking two endpoints.
//!
//! Behaves like the platform link as far as the orchestrators can tell:
//! messages are dropped while the link is down, data items are stored and
//! delivered to the other side when it reconnects (one item per path, last
//! write wins), and the writer sees its own data items echoed back.

use async_trait::async_trait;
use parking_lot::Mutex;
use skylink_core::TransportError;
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::peer::{PeerDescriptor, PeerId};
use crate::transport::{
    event_channel, DataEventKind, DataMap, EventReceiver, EventSender, Transport, TransportEvent,
};

/// A message accepted by the link, for inspection in tests and logs.
#[derive(Debug, Clone, PartialEq)]
pub struct SentMessage {
    pub to: PeerId,
    pub path: String,
    pub payload: Vec<u8>,
}

#[derive(Debug, Default)]
struct LinkState {
    connected: bool,
    /// Outgoing message failure injection, per side
    reject_messages: [bool; 2],
    /// Items waiting for each side to come back online
    pending: [BTreeMap<String, DataMap>; 2],
    /// Current value of every data item on the link
    items: BTreeMap<String, DataMap>,
    outbox: [Vec<SentMessage>; 2],
}

struct Link {
    peers: [PeerDescriptor; 2],
    events: [EventSender; 2],
    state: Mutex<LinkState>,
}

impl Link {
    fn emit(&self, side: usize, event: TransportEvent) {
        if self.events[side].send(event).is_err() {
            tracing::debug!("Endpoint {} is no longer listening", self.peers[side].id);
        }
    }
}

/// One end of an in-memory link.
#[derive(Clone)]
pub struct MemoryTransport {
    link: Arc<Link>,
    side: usize,
}

/// Transport handle plus the inbound event stream for one side.
pub struct MemoryEndpoint {
    pub transport: MemoryTransport,
    pub events: EventReceiver,
}

impl MemoryTransport {
    /// Create a linked pair. `a` and `b` describe each side as the other
    /// sees it. The link starts disconnected.
    pub fn pair(a: PeerDescriptor, b: PeerDescriptor) -> (MemoryEndpoint, MemoryEndpoint) {
        let (tx_a, rx_a) = event_channel();
        let (tx_b, rx_b) = event_channel();
        let link = Arc::new(Link {
            peers: [a, b],
            events: [tx_a, tx_b],
            state: Mutex::new(LinkState::default()),
        });

        let first = MemoryEndpoint {
            transport: MemoryTransport {
                link: Arc::clone(&link),
                side: 0,
            },
            events: rx_a,
        };
        let second = MemoryEndpoint {
            transport: MemoryTransport { link, side: 1 },
            events: rx_b,
        };
        (first, second)
    }

    fn other(&self) -> usize {
        1 - self.side
    }

    /// This side's descriptor.
    pub fn local(&self) -> &PeerDescriptor {
        &self.link.peers[self.side]
    }

    /// The other side's descriptor.
    pub fn remote(&self) -> &PeerDescriptor {
        &self.link.peers[self.other()]
    }

    pub fn is_connected(&self) -> bool {
        self.link.state.lock().connected
    }

    /// Bring the link up or down.
    ///
    /// Going up emits `PeerConnected` to both sides and then flushes any
    /// queued data items. Going down emits `PeerDisconnected`. Setting the
    /// current state again does nothing.
    pub fn set_connected(&self, connected: bool) {
        let flushed = {
            let mut state = self.link.state.lock();
            if state.connected == connected {
                return;
            }
            state.connected = connected;
            if connected {
                [
                    std::mem::take(&mut state.pending[0]),
                    std::mem::take(&mut state.pending[1]),
                ]
            } else {
                Default::default()
            }
        };

        let link = &self.link;
        if connected {
            tracing::info!("Link up: {} <-> {}", link.peers[0].id, link.peers[1].id);
            link.emit(0, TransportEvent::PeerConnected(link.peers[1].clone()));
            link.emit(1, TransportEvent::PeerConnected(link.peers[0].clone()));

            for (side, items) in flushed.into_iter().enumerate() {
                for (path, item) in items {
                    tracing::debug!("Flushing queued data item {} to {}", path, link.peers[side].id);
                    link.emit(
                        side,
                        TransportEvent::DataChanged {
                            path,
                            item,
                            kind: DataEventKind::Changed,
                        },
                    );
                }
            }
        } else {
            tracing::info!("Link down: {} <-> {}", link.peers[0].id, link.peers[1].id);
            link.emit(0, TransportEvent::PeerDisconnected(link.peers[1].clone()));
            link.emit(1, TransportEvent::PeerDisconnected(link.peers[0].clone()));
        }
    }

    /// Tell both sides the set of capable peers changed.
    pub fn announce_capability(&self) {
        let connected = self.is_connected();
        let link = &self.link;
        for side in 0..2 {
            let peers = if connected {
                vec![link.peers[1 - side].clone()]
            } else {
                Vec::new()
            };
            link.emit(side, TransportEvent::CapabilityChanged(peers));
        }
    }

    /// Make this side's outgoing messages fail with `Rejected`.
    pub fn reject_messages(&self, reject: bool) {
        self.link.state.lock().reject_messages[self.side] = reject;
    }

    /// Delete a data item, notifying both sides if the link is up.
    pub fn delete_data(&self, path: &str) {
        let connected = {
            let mut state = self.link.state.lock();
            state.items.remove(path);
            for pending in state.pending.iter_mut() {
                pending.remove(path);
            }
            state.connected
        };

        let deleted = TransportEvent::DataChanged {
            path: path.to_string(),
            item: DataMap::new(),
            kind: DataEventKind::Deleted,
        };
        self.link.emit(self.side, deleted.clone());
        if connected {
            self.link.emit(self.other(), deleted);
        }
    }

    /// Current value of a data item on the link.
    pub fn data_item(&self, path: &str) -> Option<DataMap> {
        self.link.state.lock().items.get(path).cloned()
    }

    /// Messages this side successfully sent, oldest first.
    pub fn sent_messages(&self) -> Vec<SentMessage> {
        self.link.state.lock().outbox[self.side].clone()
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn send_message(
        &self,
        peer: &PeerId,
        path: &str,
        payload: &[u8],
    ) -> Result<(), TransportError> {
        let other = self.other();
        {
            let mut state = self.link.state.lock();
            if !state.connected || *peer != self.link.peers[other].id {
                return Err(TransportError::PeerUnreachable(peer.to_string()));
            }
            if state.reject_messages[self.side] {
                return Err(TransportError::Rejected(format!("{} refused {}", peer, path)));
            }
            state.outbox[self.side].push(SentMessage {
                to: peer.clone(),
                path: path.to_string(),
                payload: payload.to_vec(),
            });
        }

        self.link.events[other]
            .send(TransportEvent::Message {
                from: self.local().id.clone(),
                path: path.to_string(),
                payload: payload.to_vec(),
            })
            .map_err(|_| TransportError::Disconnected)
    }

    async fn put_data(&self, path: &str, item: DataMap) -> Result<(), TransportError> {
        let other = self.other();
        let connected = {
            let mut state = self.link.state.lock();
            state.items.insert(path.to_string(), item.clone());
            if !state.connected {
                state.pending[other].insert(path.to_string(), item.clone());
            }
            state.connected
        };

        let changed = TransportEvent::DataChanged {
            path: path.to_string(),
            item,
            kind: DataEventKind::Changed,
        };
        if connected {
            self.link.emit(other, changed.clone());
        } else {
            tracing::debug!("Link down, queued data item {}", path);
        }
        self.link.emit(self.side, changed);
        Ok(())
    }

    async fn connected_peers(&self) -> Result<Vec<PeerDescriptor>, TransportError> {
        if self.is_connected() {
            Ok(vec![self.remote().clone()])
        } else {
            Ok(Vec::new())
        }
    }
}
