//! Phone-side sync orchestration.
//!
//! Every trigger (peer connect, capability change, sync request) runs the
//! same two-step pipeline: answer immediately from the local cache, then
//! fetch fresh data and push that too. The watch may therefore receive two
//! snapshots per request; the second always supersedes the first.

use async_trait::async_trait;
use chrono::Utc;
use skylink_core::{FetchError, SyncConfig};
use skylink_weather::{Preferences, SnapshotStore, WeatherFetcher, WeatherSnapshot};
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::instrument;

use crate::dispatch::{DropReason, EventHandler};
use crate::peer::{PeerDescriptor, PeerRegistry};
use crate::state::SyncStateTracker;
use crate::transport::{send_to_all_peers, DataEventKind, DeliveryReport, Transport, TransportEvent};
use crate::wire::{self, SyncKind, SyncTrigger};

#[derive(Debug, Clone)]
pub struct PrimaryConfig {
    /// Data-channel triggers older than this are dropped
    pub staleness_ms: i64,
    /// Wait after a peer appears before pushing to it
    pub peer_settle_delay: Duration,
}

impl Default for PrimaryConfig {
    fn default() -> Self {
        Self::from(&SyncConfig::default())
    }
}

impl From<&SyncConfig> for PrimaryConfig {
    fn from(config: &SyncConfig) -> Self {
        Self {
            staleness_ms: i64::try_from(config.request_staleness_ms).unwrap_or(i64::MAX),
            peer_settle_delay: config.peer_settle_delay(),
        }
    }
}

/// Progress of the most recent pipeline run. Stays at `Done` between runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PrimaryPhase {
    #[default]
    Idle,
    RepliedFromCache,
    FetchingFresh,
    Done,
}

/// What started a pipeline run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineTrigger {
    PeerConnected,
    CapabilityChanged,
    SyncMessage,
    SyncDataItem,
}

impl fmt::Display for PipelineTrigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PipelineTrigger::PeerConnected => "peer connected",
            PipelineTrigger::CapabilityChanged => "capability changed",
            PipelineTrigger::SyncMessage => "sync request message",
            PipelineTrigger::SyncDataItem => "sync request data item",
        };
        f.write_str(name)
    }
}

/// Outcome of one pipeline run.
#[derive(Debug, Clone, PartialEq)]
pub struct PipelineReport {
    pub trigger: PipelineTrigger,
    /// `None` when the cache was empty or unreadable
    pub cache_reply: Option<DeliveryReport>,
    pub fresh: Result<DeliveryReport, FetchError>,
}

/// How the orchestrator reacted to one event.
#[derive(Debug, Clone, PartialEq)]
pub enum PrimaryReaction {
    Pipeline(PipelineReport),
    Dropped(DropReason),
    PeersUpdated,
    Ignored,
}

/// Phone-side orchestrator. Shared behind an `Arc`; every method takes
/// `&self` and overlapping runs are allowed.
pub struct PrimaryOrchestrator {
    transport: Arc<dyn Transport>,
    store: Arc<dyn SnapshotStore>,
    fetcher: Arc<dyn WeatherFetcher>,
    prefs: Arc<dyn Preferences>,
    registry: Arc<PeerRegistry>,
    state: Arc<SyncStateTracker>,
    config: PrimaryConfig,
    running: AtomicUsize,
    phase: watch::Sender<PrimaryPhase>,
}

impl PrimaryOrchestrator {
    pub fn new(
        transport: Arc<dyn Transport>,
        store: Arc<dyn SnapshotStore>,
        fetcher: Arc<dyn WeatherFetcher>,
        prefs: Arc<dyn Preferences>,
        state: Arc<SyncStateTracker>,
        config: PrimaryConfig,
    ) -> Self {
        Self {
            transport,
            store,
            fetcher,
            prefs,
            registry: Arc::new(PeerRegistry::new()),
            state,
            config,
            running: AtomicUsize::new(0),
            phase: watch::Sender::new(PrimaryPhase::Idle),
        }
    }

    pub fn registry(&self) -> &PeerRegistry {
        &self.registry
    }

    /// Observe pipeline progress. Overlapping runs share one channel, so the
    /// value is whichever run advanced last.
    pub fn phase(&self) -> watch::Receiver<PrimaryPhase> {
        self.phase.subscribe()
    }

    /// React to one transport event.
    pub async fn react(&self, event: TransportEvent) -> PrimaryReaction {
        match event {
            TransportEvent::Message { from, path, payload } => {
                if path != wire::SYNC_REQUEST_PATH {
                    tracing::debug!("Ignoring message on {} from {}", path, from);
                    return PrimaryReaction::Ignored;
                }
                match wire::decode_sync_request(&payload) {
                    Ok(kind) => self.on_sync_request(kind, PipelineTrigger::SyncMessage).await,
                    Err(e) => {
                        tracing::warn!("Dropping sync request from {}: {}", from, e);
                        PrimaryReaction::Dropped(DropReason::Malformed(e))
                    }
                }
            }

            TransportEvent::DataChanged { path, item, kind } => {
                if kind == DataEventKind::Deleted
                    || !wire::path_matches(&path, wire::SYNC_TRIGGER_PATH)
                {
                    return PrimaryReaction::Ignored;
                }
                let trigger = match SyncTrigger::from_data_item(&item) {
                    Ok(trigger) => trigger,
                    Err(e) => {
                        tracing::warn!("Dropping sync trigger on {}: {}", path, e);
                        return PrimaryReaction::Dropped(DropReason::Malformed(e));
                    }
                };
                let now_ms = Utc::now().timestamp_millis();
                if trigger.is_stale(now_ms, self.config.staleness_ms) {
                    let age_ms = trigger.age_ms(now_ms);
                    tracing::debug!("Dropping stale sync trigger ({} ms old)", age_ms);
                    return PrimaryReaction::Dropped(DropReason::StaleRequest { age_ms });
                }
                self.on_sync_request(trigger.kind(), PipelineTrigger::SyncDataItem)
                    .await
            }

            TransportEvent::PeerConnected(peer) => {
                tracing::info!("Peer connected: {} ({})", peer.display_name, peer.id);
                self.registry.connect(peer);
                self.state.set_peer_connected(true);
                self.settle().await;
                PrimaryReaction::Pipeline(self.run_pipeline(PipelineTrigger::PeerConnected).await)
            }

            TransportEvent::PeerDisconnected(peer) => {
                tracing::info!("Peer disconnected: {} ({})", peer.display_name, peer.id);
                self.registry.disconnect(&peer.id);
                self.state.set_peer_connected(self.registry.is_connected());
                PrimaryReaction::PeersUpdated
            }

            TransportEvent::CapabilityChanged(peers) => {
                let any = !peers.is_empty();
                tracing::info!("Capable peers changed: {} available", peers.len());
                self.registry.replace(peers);
                self.state.set_peer_connected(any);
                if !any {
                    return PrimaryReaction::PeersUpdated;
                }
                self.settle().await;
                PrimaryReaction::Pipeline(
                    self.run_pipeline(PipelineTrigger::CapabilityChanged).await,
                )
            }
        }
    }

    async fn on_sync_request(&self, kind: SyncKind, trigger: PipelineTrigger) -> PrimaryReaction {
        match kind {
            SyncKind::Unrecognized(other) => {
                tracing::warn!("Unknown sync type: {}", other);
                PrimaryReaction::Dropped(DropReason::UnrecognizedKind(other))
            }
            kind => {
                tracing::info!("Sync requested ({:?}) via {}", kind, trigger);
                PrimaryReaction::Pipeline(self.run_pipeline(trigger).await)
            }
        }
    }

    async fn settle(&self) {
        if !self.config.peer_settle_delay.is_zero() {
            tokio::time::sleep(self.config.peer_settle_delay).await;
        }
    }

    /// Reply from cache, then fetch fresh and push again.
    ///
    /// A failed cache reply never prevents the fresh fetch, and nothing here
    /// surfaces an error to the user.
    #[instrument(skip(self), level = "info")]
    pub async fn run_pipeline(&self, trigger: PipelineTrigger) -> PipelineReport {
        let _running = RunningGuard::enter(&self.running, &self.state);

        let cache_reply = match self.store.load_any_age() {
            Ok(Some(cached)) => {
                tracing::info!("Replying from cache: {}, {}°", cached.city, cached.temperature);
                Some(self.broadcast(&cached).await)
            }
            Ok(None) => {
                tracing::debug!("Cache empty, nothing to reply with");
                None
            }
            Err(e) => {
                tracing::error!("Failed to read cached weather: {}", e);
                None
            }
        };
        self.advance(PrimaryPhase::RepliedFromCache);

        self.advance(PrimaryPhase::FetchingFresh);
        let city = self.sync_city();
        let fresh = match self.fetcher.fetch(&city).await {
            Ok(snapshot) => {
                let report = self.broadcast(&snapshot).await;
                if let Err(e) = self.store.save(&snapshot) {
                    tracing::error!("Failed to cache fresh weather: {}", e);
                }
                Ok(report)
            }
            Err(e) => {
                tracing::warn!("Fresh fetch for {} failed: {}", city, e);
                Err(e)
            }
        };
        self.advance(PrimaryPhase::Done);

        PipelineReport {
            trigger,
            cache_reply,
            fresh,
        }
    }

    fn advance(&self, next: PrimaryPhase) {
        let previous = self.phase.send_replace(next);
        tracing::debug!("Pipeline {:?} -> {:?}", previous, next);
    }

    /// Cache a snapshot the user just fetched and push it to the watch.
    pub async fn publish(&self, snapshot: &WeatherSnapshot) -> DeliveryReport {
        if let Err(e) = self.store.save(snapshot) {
            tracing::error!("Failed to cache weather for {}: {}", snapshot.city, e);
        }
        self.broadcast(snapshot).await
    }

    /// City the fresh fetch is for: the cached one, else the user's last search.
    fn sync_city(&self) -> String {
        match self.store.last_city() {
            Ok(Some(city)) if !city.trim().is_empty() => city,
            Ok(_) => self.prefs.last_city(),
            Err(e) => {
                tracing::warn!("Failed to read cached city: {}", e);
                self.prefs.last_city()
            }
        }
    }

    /// Message every connected peer; fall back to the durable data item when
    /// some peer (or every peer) missed it.
    async fn broadcast(&self, snapshot: &WeatherSnapshot) -> DeliveryReport {
        let peers = self.refresh_peers().await;

        let report = match wire::encode_weather_message(snapshot) {
            Ok(payload) => {
                send_to_all_peers(&self.transport, &peers, wire::WEATHER_MESSAGE_PATH, payload)
                    .await
            }
            Err(e) => {
                tracing::warn!("Failed to encode weather for {}: {}", snapshot.city, e);
                DeliveryReport::default()
            }
        };

        if !report.is_complete() {
            let item = wire::weather_data_item(snapshot);
            match self.transport.put_data(wire::WEATHER_DATA_PATH, item).await {
                Ok(()) => tracing::debug!(
                    "Wrote {} for {} unreached peer(s)",
                    wire::WEATHER_DATA_PATH,
                    report.failed.len()
                ),
                Err(e) => tracing::warn!("Failed to write {}: {}", wire::WEATHER_DATA_PATH, e),
            }
        }

        report
    }

    async fn refresh_peers(&self) -> Vec<PeerDescriptor> {
        match self.transport.connected_peers().await {
            Ok(peers) => {
                self.registry.replace(peers.clone());
                self.state.set_peer_connected(!peers.is_empty());
                peers
            }
            Err(e) => {
                tracing::warn!("Failed to list connected peers: {}", e);
                self.registry.list()
            }
        }
    }
}

/// Keeps `syncing` set while at least one pipeline is running.
struct RunningGuard<'a> {
    running: &'a AtomicUsize,
    state: &'a SyncStateTracker,
}

impl<'a> RunningGuard<'a> {
    fn enter(running: &'a AtomicUsize, state: &'a SyncStateTracker) -> Self {
        running.fetch_add(1, Ordering::SeqCst);
        state.set_syncing(true);
        Self { running, state }
    }
}

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        if self.running.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.state.set_syncing(false);
        }
    }
}

#[async_trait]
impl EventHandler for PrimaryOrchestrator {
    async fn handle_event(&self, event: TransportEvent) {
        let reaction = self.react(event).await;
        tracing::debug!("Primary reaction: {:?}", reaction);
    }
}
