//! Event pump: one task per inbound transport event.

use async_trait::async_trait;
use skylink_core::PayloadError;
use std::sync::Arc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::transport::{EventReceiver, TransportEvent};

/// Reacts to a single transport event.
#[async_trait]
pub trait EventHandler: Send + Sync + 'static {
    async fn handle_event(&self, event: TransportEvent);
}

/// Why an inbound event was dropped without a reaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DropReason {
    StaleRequest { age_ms: i64 },
    UnrecognizedKind(String),
    Malformed(PayloadError),
}

/// Pumps events from a transport channel into a handler.
///
/// Reactions run concurrently and may overlap; the handler must tolerate
/// that. The pump stops when the channel closes (in-flight reactions are
/// drained) or when the shutdown token fires (in-flight reactions are
/// aborted).
pub struct EventDispatcher<H> {
    handler: Arc<H>,
    shutdown: CancellationToken,
}

impl<H: EventHandler> EventDispatcher<H> {
    pub fn new(handler: Arc<H>, shutdown: CancellationToken) -> Self {
        Self { handler, shutdown }
    }

    pub async fn run(self, mut events: EventReceiver) {
        let mut inflight = JoinSet::new();

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => {
                    tracing::debug!("Dispatcher cancelled, aborting {} reactions", inflight.len());
                    inflight.abort_all();
                    break;
                }
                event = events.recv() => match event {
                    Some(event) => {
                        let handler = Arc::clone(&self.handler);
                        inflight.spawn(async move { handler.handle_event(event).await });
                    }
                    None => {
                        tracing::debug!("Event channel closed, draining {} reactions", inflight.len());
                        break;
                    }
                },
                Some(joined) = inflight.join_next(), if !inflight.is_empty() => {
                    log_join(joined);
                }
            }
        }

        while let Some(joined) = inflight.join_next().await {
            log_join(joined);
        }
    }
}

fn log_join(joined: Result<(), tokio::task::JoinError>) {
    if let Err(e) = joined {
        if e.is_panic() {
            tracing::error!("Event reaction panicked: {}", e);
        }
    }
}
