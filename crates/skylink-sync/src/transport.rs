//! Device-to-device transport abstraction.
//!
//! Two channels are modelled:
//! - fire-and-forget messages to a single peer (`send_message`)
//! - durable key/value data items that the link delivers to the peer on
//!   the next reconnect, superseded by later writes to the same path
//!   (`put_data`)
//!
//! Inbound traffic and connectivity changes arrive as `TransportEvent`s on an
//! unbounded channel and are pumped by the event dispatcher.

use async_trait::async_trait;
use skylink_core::{PayloadError, TransportError};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::peer::{PeerDescriptor, PeerId};

/// A single typed value inside a data item.
#[derive(Debug, Clone, PartialEq)]
pub enum DataValue {
    Int(i32),
    Long(i64),
    Float(f32),
    Text(String),
}

/// Key/value payload of a durable data item.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DataMap(BTreeMap<String, DataValue>);

impl DataMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put_int(&mut self, key: &str, value: i32) -> &mut Self {
        self.0.insert(key.to_string(), DataValue::Int(value));
        self
    }

    pub fn put_long(&mut self, key: &str, value: i64) -> &mut Self {
        self.0.insert(key.to_string(), DataValue::Long(value));
        self
    }

    pub fn put_float(&mut self, key: &str, value: f32) -> &mut Self {
        self.0.insert(key.to_string(), DataValue::Float(value));
        self
    }

    pub fn put_text(&mut self, key: &str, value: impl Into<String>) -> &mut Self {
        self.0.insert(key.to_string(), DataValue::Text(value.into()));
        self
    }

    pub fn get(&self, key: &str) -> Option<&DataValue> {
        self.0.get(key)
    }

    pub fn int(&self, key: &str) -> Result<i32, PayloadError> {
        match self.require(key)? {
            DataValue::Int(v) => Ok(*v),
            _ => Err(wrong_type(key, "int")),
        }
    }

    /// Accepts int values as well, they widen losslessly.
    pub fn long(&self, key: &str) -> Result<i64, PayloadError> {
        match self.require(key)? {
            DataValue::Long(v) => Ok(*v),
            DataValue::Int(v) => Ok(i64::from(*v)),
            _ => Err(wrong_type(key, "long")),
        }
    }

    pub fn float(&self, key: &str) -> Result<f32, PayloadError> {
        match self.require(key)? {
            DataValue::Float(v) => Ok(*v),
            _ => Err(wrong_type(key, "float")),
        }
    }

    pub fn text(&self, key: &str) -> Result<&str, PayloadError> {
        match self.require(key)? {
            DataValue::Text(v) => Ok(v.as_str()),
            _ => Err(wrong_type(key, "string")),
        }
    }

    fn require(&self, key: &str) -> Result<&DataValue, PayloadError> {
        self.0
            .get(key)
            .ok_or_else(|| PayloadError::MissingField(key.to_string()))
    }
}

fn wrong_type(field: &str, expected: &'static str) -> PayloadError {
    PayloadError::WrongType {
        field: field.to_string(),
        expected,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataEventKind {
    Changed,
    Deleted,
}

/// Inbound transport activity.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    Message {
        from: PeerId,
        path: String,
        payload: Vec<u8>,
    },
    DataChanged {
        path: String,
        item: DataMap,
        kind: DataEventKind,
    },
    PeerConnected(PeerDescriptor),
    PeerDisconnected(PeerDescriptor),
    /// Full set of peers advertising the weather capability
    CapabilityChanged(Vec<PeerDescriptor>),
}

pub type EventSender = mpsc::UnboundedSender<TransportEvent>;
pub type EventReceiver = mpsc::UnboundedReceiver<TransportEvent>;

pub fn event_channel() -> (EventSender, EventReceiver) {
    mpsc::unbounded_channel()
}

/// Platform link to paired devices.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Best-effort single message. No retry, no delivery guarantee.
    async fn send_message(
        &self,
        peer: &PeerId,
        path: &str,
        payload: &[u8],
    ) -> Result<(), TransportError>;

    /// Durable write, delivered to the peer on next reconnect.
    async fn put_data(&self, path: &str, item: DataMap) -> Result<(), TransportError>;

    /// Currently reachable peers. May be stale by the time it returns.
    async fn connected_peers(&self) -> Result<Vec<PeerDescriptor>, TransportError>;
}

/// Outcome of one broadcast, per peer.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DeliveryReport {
    pub delivered: Vec<PeerId>,
    pub failed: Vec<(PeerId, TransportError)>,
}

impl DeliveryReport {
    /// Every attempted peer received the message (and there was at least one).
    pub fn is_complete(&self) -> bool {
        !self.delivered.is_empty() && self.failed.is_empty()
    }

    pub fn any_delivered(&self) -> bool {
        !self.delivered.is_empty()
    }

    pub fn attempted(&self) -> usize {
        self.delivered.len() + self.failed.len()
    }
}

/// Send the same payload to every peer concurrently.
///
/// Each send runs in its own task; one peer failing never blocks or cancels
/// the others.
pub async fn send_to_all_peers(
    transport: &Arc<dyn Transport>,
    peers: &[PeerDescriptor],
    path: &str,
    payload: Vec<u8>,
) -> DeliveryReport {
    let payload: Arc<[u8]> = payload.into();
    let path: Arc<str> = path.into();

    let handles: Vec<(PeerId, JoinHandle<Result<(), TransportError>>)> = peers
        .iter()
        .map(|peer| {
            let transport = Arc::clone(transport);
            let payload = Arc::clone(&payload);
            let path = Arc::clone(&path);
            let id = peer.id.clone();
            let handle = tokio::spawn(async move {
                transport.send_message(&id, &path, &payload).await
            });
            (peer.id.clone(), handle)
        })
        .collect();

    let mut report = DeliveryReport::default();
    for (peer, handle) in handles {
        let result = match handle.await {
            Ok(result) => result,
            Err(e) => Err(TransportError::Rejected(format!("send task failed: {}", e))),
        };

        match result {
            Ok(()) => {
                tracing::debug!("Sent {} to {}", path, peer);
                report.delivered.push(peer);
            }
            Err(e) => {
                tracing::warn!("Failed to send {} to {}: {}", path, peer, e);
                report.failed.push((peer, e));
            }
        }
    }

    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    /// Rejects sends to peers whose id starts with "bad".
    #[derive(Default)]
    struct PickyTransport {
        sent: Mutex<Vec<(PeerId, String)>>,
    }

    #[async_trait]
    impl Transport for PickyTransport {
        async fn send_message(
            &self,
            peer: &PeerId,
            path: &str,
            _payload: &[u8],
        ) -> Result<(), TransportError> {
            if peer.as_str().starts_with("bad") {
                return Err(TransportError::PeerUnreachable(peer.to_string()));
            }
            self.sent.lock().push((peer.clone(), path.to_string()));
            Ok(())
        }

        async fn put_data(&self, _path: &str, _item: DataMap) -> Result<(), TransportError> {
            Ok(())
        }

        async fn connected_peers(&self) -> Result<Vec<PeerDescriptor>, TransportError> {
            Ok(Vec::new())
        }
    }

    #[tokio::test]
    async fn test_one_failing_peer_does_not_block_others() {
        let picky = Arc::new(PickyTransport::default());
        let transport: Arc<dyn Transport> = picky.clone();
        let peers = vec![
            PeerDescriptor::new("bad-1", "Broken"),
            PeerDescriptor::new("watch", "Watch"),
        ];

        let report = send_to_all_peers(&transport, &peers, "/weather_message", b"{}".to_vec()).await;

        assert_eq!(report.delivered, vec![PeerId::from("watch")]);
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].0, PeerId::from("bad-1"));
        assert!(!report.is_complete());
        assert!(report.any_delivered());
        assert_eq!(picky.sent.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_no_peers_is_incomplete() {
        let transport: Arc<dyn Transport> = Arc::new(PickyTransport::default());
        let report = send_to_all_peers(&transport, &[], "/sync_request", b"full_sync".to_vec()).await;
        assert_eq!(report.attempted(), 0);
        assert!(!report.is_complete());
        assert!(!report.any_delivered());
    }

    #[test]
    fn test_data_map_typed_access() {
        let mut item = DataMap::new();
        item.put_int("temperature", 15)
            .put_long("timestamp", 1_700_000_000_000)
            .put_text("location", "London");

        assert_eq!(item.int("temperature").unwrap(), 15);
        assert_eq!(item.long("temperature").unwrap(), 15);
        assert_eq!(item.text("location").unwrap(), "London");
        assert_eq!(
            item.float("humidity"),
            Err(PayloadError::MissingField("humidity".to_string()))
        );
        assert!(matches!(
            item.int("location"),
            Err(PayloadError::WrongType { expected: "int", .. })
        ));
    }
}
