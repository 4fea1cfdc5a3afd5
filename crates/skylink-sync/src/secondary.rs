//! Watch-side sync orchestration.
//!
//! On start the watch asks the phone for data and waits a bounded time for
//! the reply, falling back to fetching the weather itself. Whatever arrives
//! last is what the watch shows.

use async_trait::async_trait;
use parking_lot::Mutex;
use skylink_core::SyncConfig;
use skylink_weather::{Preferences, WeatherFetcher, WeatherSnapshot};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::dispatch::{DropReason, EventHandler};
use crate::peer::{PeerDescriptor, PeerRegistry};
use crate::state::{DataSource, SyncStateTracker};
use crate::transport::{send_to_all_peers, DataEventKind, Transport, TransportEvent};
use crate::wire;

/// Shown when a search is submitted with no city.
pub const CITY_REQUIRED: &str = "City name is required";

#[derive(Debug, Clone)]
pub struct SecondaryConfig {
    /// How long to wait for the phone before fetching directly
    pub sync_timeout: Duration,
    /// Minimum spacing between user refreshes
    pub refresh_min_interval: Duration,
}

impl Default for SecondaryConfig {
    fn default() -> Self {
        Self::from(&SyncConfig::default())
    }
}

impl From<&SyncConfig> for SecondaryConfig {
    fn from(config: &SyncConfig) -> Self {
        Self {
            sync_timeout: config.sync_timeout(),
            refresh_min_interval: config.refresh_min_interval(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SecondaryPhase {
    #[default]
    Init,
    CheckingPeer,
    AwaitingPeerReply,
    DirectFetching,
    Ready,
    Error,
}

/// Everything the watch face renders.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct WearableView {
    pub phase: SecondaryPhase,
    pub snapshot: Option<WeatherSnapshot>,
    pub error: Option<String>,
    pub loading: bool,
    /// Current search query
    pub city: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshOutcome {
    Started,
    /// Too soon after the previous refresh; nothing was done
    Throttled,
}

/// How the watch reacted to one inbound event.
#[derive(Debug, Clone, PartialEq)]
pub enum SecondaryReaction {
    Applied,
    Dropped(DropReason),
    PeersUpdated,
    Ignored,
}

struct Inner {
    transport: Arc<dyn Transport>,
    fetcher: Arc<dyn WeatherFetcher>,
    prefs: Arc<dyn Preferences>,
    registry: PeerRegistry,
    state: Arc<SyncStateTracker>,
    view: watch::Sender<WearableView>,
    config: SecondaryConfig,
    reply_timer: Mutex<Option<CancellationToken>>,
    last_refresh: Mutex<Option<Instant>>,
}

/// Watch-side orchestrator. Clones share the same state.
#[derive(Clone)]
pub struct SecondaryOrchestrator {
    inner: Arc<Inner>,
}

impl SecondaryOrchestrator {
    pub fn new(
        transport: Arc<dyn Transport>,
        fetcher: Arc<dyn WeatherFetcher>,
        prefs: Arc<dyn Preferences>,
        state: Arc<SyncStateTracker>,
        config: SecondaryConfig,
    ) -> Self {
        let initial = WearableView {
            city: prefs.last_city(),
            ..WearableView::default()
        };

        Self {
            inner: Arc::new(Inner {
                transport,
                fetcher,
                prefs,
                registry: PeerRegistry::new(),
                state,
                view: watch::Sender::new(initial),
                config,
                reply_timer: Mutex::new(None),
                last_refresh: Mutex::new(None),
            }),
        }
    }

    /// Observe the display state. The receiver starts at the latest value.
    pub fn view(&self) -> watch::Receiver<WearableView> {
        self.inner.view.subscribe()
    }

    pub fn current_view(&self) -> WearableView {
        self.inner.view.borrow().clone()
    }

    pub fn registry(&self) -> &PeerRegistry {
        &self.inner.registry
    }

    pub async fn start(&self) {
        tracing::info!("Watch sync starting");
        self.check_and_sync().await;
    }

    /// Ask the phone if one is reachable, otherwise fetch directly.
    pub async fn check_and_sync(&self) {
        self.update_view(|v| v.phase = SecondaryPhase::CheckingPeer);

        let peers = self.refresh_peers().await;
        if peers.is_empty() {
            tracing::info!("No phone connected, fetching directly");
            self.cancel_pending_reply();
            self.fetch_current_city().await;
        } else {
            self.request_peer_sync(&peers).await;
        }
    }

    /// Refresh `peerConnected` without syncing.
    pub async fn check_connection(&self) -> bool {
        !self.refresh_peers().await.is_empty()
    }

    /// User pull-to-refresh. At most one per `refresh_min_interval`.
    pub async fn refresh(&self) -> RefreshOutcome {
        let now = Instant::now();
        {
            let mut last = self.inner.last_refresh.lock();
            if let Some(previous) = *last {
                if now.duration_since(previous) < self.inner.config.refresh_min_interval {
                    tracing::debug!("Refresh throttled");
                    return RefreshOutcome::Throttled;
                }
            }
            *last = Some(now);
        }

        self.check_and_sync().await;
        RefreshOutcome::Started
    }

    /// Look up a city directly, bypassing the phone.
    pub async fn search_city(&self, city: &str) {
        let city = city.trim();
        if city.is_empty() {
            self.update_view(|v| v.error = Some(CITY_REQUIRED.to_string()));
            return;
        }

        self.update_view(|v| v.city = city.to_string());
        if let Err(e) = self.inner.prefs.save_last_city(city) {
            tracing::warn!("Failed to save last city: {}", e);
        }
        self.cancel_pending_reply();
        self.direct_fetch(city).await;
    }

    pub fn clear_error(&self) {
        self.update_view(|v| v.error = None);
    }

    async fn refresh_peers(&self) -> Vec<PeerDescriptor> {
        let peers = match self.inner.transport.connected_peers().await {
            Ok(peers) => peers,
            Err(e) => {
                tracing::warn!("Failed to list connected peers: {}", e);
                Vec::new()
            }
        };
        self.inner.registry.replace(peers.clone());
        self.inner.state.set_peer_connected(!peers.is_empty());
        peers
    }

    async fn request_peer_sync(&self, peers: &[PeerDescriptor]) {
        self.inner.state.set_syncing(true);
        self.update_view(|v| {
            v.phase = SecondaryPhase::AwaitingPeerReply;
            v.loading = true;
            v.error = None;
        });

        let report = send_to_all_peers(
            &self.inner.transport,
            peers,
            wire::SYNC_REQUEST_PATH,
            wire::encode_sync_request(),
        )
        .await;

        if !report.any_delivered() {
            tracing::warn!("Sync request reached no phone, fetching directly");
            self.cancel_pending_reply();
            self.fetch_current_city().await;
            return;
        }

        tracing::info!("Sync requested from {} phone(s)", report.delivered.len());
        self.arm_reply_timer();
    }

    fn arm_reply_timer(&self) {
        let token = CancellationToken::new();
        if let Some(previous) = self.inner.reply_timer.lock().replace(token.clone()) {
            previous.cancel();
        }

        let this = self.clone();
        let timeout = self.inner.config.sync_timeout;
        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {}
                _ = tokio::time::sleep(timeout) => this.on_reply_timeout().await,
            }
        });
    }

    async fn on_reply_timeout(&self) {
        // A reply may have landed while the timer was firing
        if self.inner.state.take_syncing() {
            tracing::info!(
                "No reply from phone after {:?}, fetching directly",
                self.inner.config.sync_timeout
            );
            self.fetch_current_city().await;
        }
    }

    /// Stop waiting for the phone: the reply timer can no longer fire.
    fn cancel_pending_reply(&self) {
        if let Some(timer) = self.inner.reply_timer.lock().take() {
            timer.cancel();
        }
        self.inner.state.set_syncing(false);
    }

    fn on_peer_snapshot(&self, snapshot: WeatherSnapshot) {
        self.cancel_pending_reply();

        tracing::info!(
            "Weather from phone: {}, {}°, {}",
            snapshot.city,
            snapshot.temperature,
            snapshot.condition
        );
        self.inner.state.set_data_source(DataSource::Peer);
        self.update_view(|v| {
            v.phase = SecondaryPhase::Ready;
            v.snapshot = Some(snapshot);
            v.error = None;
            v.loading = false;
        });
    }

    async fn fetch_current_city(&self) {
        let city = self.inner.view.borrow().city.clone();
        self.direct_fetch(&city).await;
    }

    async fn direct_fetch(&self, city: &str) {
        if city.trim().is_empty() {
            self.update_view(|v| {
                v.phase = SecondaryPhase::Error;
                v.error = Some(CITY_REQUIRED.to_string());
                v.loading = false;
            });
            return;
        }

        self.update_view(|v| {
            v.phase = SecondaryPhase::DirectFetching;
            v.loading = true;
            v.error = None;
        });

        match self.inner.fetcher.fetch(city).await {
            Ok(snapshot) => {
                if let Err(e) = self.inner.prefs.save_last_city(city) {
                    tracing::warn!("Failed to save last city: {}", e);
                }
                self.inner.state.set_data_source(DataSource::DirectFetch);
                self.update_view(|v| {
                    v.phase = SecondaryPhase::Ready;
                    v.snapshot = Some(snapshot);
                    v.loading = false;
                });
            }
            Err(e) => {
                tracing::warn!("Direct fetch for {} failed: {}", city, e);
                self.update_view(|v| {
                    v.phase = SecondaryPhase::Error;
                    v.error = Some(e.user_message());
                    v.loading = false;
                });
            }
        }
    }

    fn update_view(&self, apply: impl FnOnce(&mut WearableView)) {
        self.inner.view.send_modify(|view| {
            let before = view.phase;
            apply(view);
            if view.phase != before {
                tracing::debug!("Watch {:?} -> {:?}", before, view.phase);
            }
        });
    }

    /// React to one transport event.
    pub async fn react(&self, event: TransportEvent) -> SecondaryReaction {
        match event {
            TransportEvent::Message { from, path, payload } => {
                if path != wire::WEATHER_MESSAGE_PATH {
                    tracing::debug!("Ignoring message on {} from {}", path, from);
                    return SecondaryReaction::Ignored;
                }
                match wire::decode_weather_message(&payload) {
                    Ok(snapshot) => {
                        self.on_peer_snapshot(snapshot);
                        SecondaryReaction::Applied
                    }
                    Err(e) => {
                        tracing::warn!("Dropping weather message from {}: {}", from, e);
                        SecondaryReaction::Dropped(DropReason::Malformed(e))
                    }
                }
            }

            TransportEvent::DataChanged { path, item, kind } => {
                if !wire::path_matches(&path, wire::WEATHER_DATA_PATH) {
                    // Includes the echo of our own sync triggers
                    return SecondaryReaction::Ignored;
                }
                if kind == DataEventKind::Deleted {
                    tracing::info!("Weather data item deleted, keeping current snapshot");
                    return SecondaryReaction::Ignored;
                }
                match wire::decode_weather_data_item(&item) {
                    Ok(snapshot) => {
                        self.on_peer_snapshot(snapshot);
                        SecondaryReaction::Applied
                    }
                    Err(e) => {
                        tracing::warn!("Dropping weather data item {}: {}", path, e);
                        SecondaryReaction::Dropped(DropReason::Malformed(e))
                    }
                }
            }

            TransportEvent::PeerConnected(peer) => {
                tracing::info!("Phone connected: {}", peer.display_name);
                self.inner.registry.connect(peer);
                self.inner.state.set_peer_connected(true);
                SecondaryReaction::PeersUpdated
            }

            TransportEvent::PeerDisconnected(peer) => {
                tracing::info!("Phone disconnected: {}", peer.display_name);
                self.inner.registry.disconnect(&peer.id);
                self.inner
                    .state
                    .set_peer_connected(self.inner.registry.is_connected());
                SecondaryReaction::PeersUpdated
            }

            TransportEvent::CapabilityChanged(peers) => {
                let any = !peers.is_empty();
                self.inner.registry.replace(peers);
                self.inner.state.set_peer_connected(any);
                SecondaryReaction::PeersUpdated
            }
        }
    }
}

#[async_trait]
impl EventHandler for SecondaryOrchestrator {
    async fn handle_event(&self, event: TransportEvent) {
        let reaction = self.react(event).await;
        tracing::debug!("Watch reaction: {:?}", reaction);
    }
}
