//! End-to-end sync between a phone and a watch over the in-memory link.
//!
//! Time is paused in every test, so the 1 s settle delay and the 5 s reply
//! timeout run instantly and deterministically.

use async_trait::async_trait;
use parking_lot::Mutex;
use skylink_core::FetchError;
use skylink_sync::{
    wire, DataSource, EventDispatcher, MemoryEndpoint, MemoryTransport, PeerDescriptor,
    PrimaryConfig, PrimaryOrchestrator, SecondaryConfig, SecondaryOrchestrator, SecondaryPhase,
    SyncStateTracker, SyncStateView, Transport, WearableView,
};
use skylink_weather::{
    SnapshotStore, SqlitePreferences, SqliteSnapshotStore, WeatherFetcher, WeatherSnapshot,
};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

/// Answers per city; unknown cities are `CityNotFound`.
#[derive(Default)]
struct ScriptedFetcher {
    results: Mutex<HashMap<String, Result<WeatherSnapshot, FetchError>>>,
    calls: AtomicUsize,
}

impl ScriptedFetcher {
    fn with(city: &str, result: Result<WeatherSnapshot, FetchError>) -> Arc<Self> {
        let fetcher = Self::default();
        fetcher.results.lock().insert(city.to_string(), result);
        Arc::new(fetcher)
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl WeatherFetcher for ScriptedFetcher {
    async fn fetch(&self, city: &str) -> Result<WeatherSnapshot, FetchError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.results
            .lock()
            .get(city)
            .cloned()
            .unwrap_or_else(|| Err(FetchError::CityNotFound(city.to_string())))
    }
}

/// Never completes.
struct StalledFetcher;

#[async_trait]
impl WeatherFetcher for StalledFetcher {
    async fn fetch(&self, _city: &str) -> Result<WeatherSnapshot, FetchError> {
        std::future::pending().await
    }
}

/// Records the watch phase at the moment of each fetch, then fails with
/// `CityNotFound`.
#[derive(Default)]
struct PhaseRecordingFetcher {
    view: Mutex<Option<watch::Receiver<WearableView>>>,
    phases: Mutex<Vec<SecondaryPhase>>,
}

#[async_trait]
impl WeatherFetcher for PhaseRecordingFetcher {
    async fn fetch(&self, city: &str) -> Result<WeatherSnapshot, FetchError> {
        if let Some(view) = self.view.lock().as_ref() {
            self.phases.lock().push(view.borrow().phase);
        }
        Err(FetchError::CityNotFound(city.to_string()))
    }
}

fn weather(city: &str, temperature: i32) -> WeatherSnapshot {
    WeatherSnapshot::new(city, temperature, 65, 4.0, "Clouds", 1_700_000_000)
}

fn link() -> (MemoryEndpoint, MemoryEndpoint) {
    MemoryTransport::pair(
        PeerDescriptor::new("phone-1", "Pixel 8"),
        PeerDescriptor::new("watch-1", "Pixel Watch"),
    )
}

fn prefs() -> Arc<SqlitePreferences> {
    prefs_for("London")
}

fn prefs_for(city: &str) -> Arc<SqlitePreferences> {
    Arc::new(SqlitePreferences::in_memory("test-key", city).unwrap())
}

fn spawn_phone(
    endpoint: MemoryEndpoint,
    store: Arc<SqliteSnapshotStore>,
    fetcher: Arc<dyn WeatherFetcher>,
    shutdown: &CancellationToken,
) -> Arc<PrimaryOrchestrator> {
    let primary = Arc::new(PrimaryOrchestrator::new(
        Arc::new(endpoint.transport),
        store,
        fetcher,
        prefs(),
        Arc::new(SyncStateTracker::new()),
        PrimaryConfig::default(),
    ));
    tokio::spawn(
        EventDispatcher::new(Arc::clone(&primary), shutdown.clone()).run(endpoint.events),
    );
    primary
}

struct Watch {
    link: MemoryTransport,
    orchestrator: SecondaryOrchestrator,
    state: SyncStateView,
    view: watch::Receiver<WearableView>,
}

fn spawn_watch(
    endpoint: MemoryEndpoint,
    fetcher: Arc<dyn WeatherFetcher>,
    shutdown: &CancellationToken,
) -> Watch {
    spawn_watch_in(endpoint, fetcher, prefs(), shutdown)
}

fn spawn_watch_in(
    endpoint: MemoryEndpoint,
    fetcher: Arc<dyn WeatherFetcher>,
    prefs: Arc<SqlitePreferences>,
    shutdown: &CancellationToken,
) -> Watch {
    let tracker = Arc::new(SyncStateTracker::new());
    let state = tracker.view();
    let link = endpoint.transport.clone();
    let orchestrator = SecondaryOrchestrator::new(
        Arc::new(endpoint.transport),
        fetcher,
        prefs,
        tracker,
        SecondaryConfig::default(),
    );
    tokio::spawn(
        EventDispatcher::new(Arc::new(orchestrator.clone()), shutdown.clone()).run(endpoint.events),
    );
    let view = orchestrator.view();
    Watch {
        link,
        orchestrator,
        state,
        view,
    }
}

async fn wait_until(
    view: &mut watch::Receiver<WearableView>,
    condition: impl FnMut(&WearableView) -> bool,
) -> WearableView {
    tokio::time::timeout(Duration::from_secs(60), view.wait_for(condition))
        .await
        .expect("view never reached the expected state")
        .expect("view channel closed")
        .clone()
}

#[tokio::test(start_paused = true)]
async fn test_peer_connect_pushes_cache_then_fresh() {
    let shutdown = CancellationToken::new();
    let (phone_end, watch_end) = link();
    let phone_link = phone_end.transport.clone();

    let store = Arc::new(SqliteSnapshotStore::in_memory().unwrap());
    store.save(&weather("London", 15)).unwrap();
    let phone_fetcher = ScriptedFetcher::with("London", Ok(weather("London", 16)));
    spawn_phone(phone_end, Arc::clone(&store), phone_fetcher.clone(), &shutdown);

    let watch_fetcher = Arc::new(ScriptedFetcher::default());
    let mut watch = spawn_watch(watch_end, watch_fetcher.clone(), &shutdown);

    phone_link.set_connected(true);

    let view = wait_until(&mut watch.view, |v| {
        v.snapshot.as_ref().map(|s| s.temperature) == Some(16)
    })
    .await;

    assert_eq!(view.phase, SecondaryPhase::Ready);
    assert_eq!(watch.state.data_source(), DataSource::Peer);
    assert!(watch.state.peer_connected());
    assert_eq!(watch_fetcher.calls(), 0);

    let temps: Vec<i32> = phone_link
        .sent_messages()
        .iter()
        .map(|m| wire::decode_weather_message(&m.payload).unwrap().temperature)
        .collect();
    assert_eq!(temps, vec![15, 16]);
    assert_eq!(store.load_any_age().unwrap(), Some(weather("London", 16)));

    shutdown.cancel();
}

#[tokio::test(start_paused = true)]
async fn test_watch_request_answered_and_timer_cancelled() {
    let shutdown = CancellationToken::new();
    let (phone_end, watch_end) = link();
    phone_end.transport.set_connected(true);

    let store = Arc::new(SqliteSnapshotStore::in_memory().unwrap());
    let phone_fetcher = ScriptedFetcher::with("London", Ok(weather("London", 12)));
    spawn_phone(phone_end, store, phone_fetcher, &shutdown);

    let watch_fetcher = ScriptedFetcher::with("London", Ok(weather("London", 30)));
    let mut watch = spawn_watch(watch_end, watch_fetcher.clone(), &shutdown);

    watch.orchestrator.start().await;

    let view = wait_until(&mut watch.view, |v| v.phase == SecondaryPhase::Ready).await;
    assert_eq!(view.snapshot.map(|s| s.temperature), Some(12));
    assert!(!watch.state.syncing());

    // Well past the reply timeout: the cancelled timer must not fall back
    tokio::time::sleep(Duration::from_secs(10)).await;
    assert_eq!(watch.state.data_source(), DataSource::Peer);
    assert_eq!(watch_fetcher.calls(), 0);

    shutdown.cancel();
}

#[tokio::test(start_paused = true)]
async fn test_silent_phone_times_out_to_direct_fetch() {
    let shutdown = CancellationToken::new();
    let (phone_end, watch_end) = link();
    phone_end.transport.set_connected(true);
    // Nobody handles the phone's events
    let _phone_events = phone_end.events;

    let watch = spawn_watch(watch_end, Arc::new(StalledFetcher), &shutdown);
    watch.orchestrator.start().await;

    assert!(watch.state.syncing());
    assert_eq!(
        watch.orchestrator.current_view().phase,
        SecondaryPhase::AwaitingPeerReply
    );

    tokio::time::sleep(Duration::from_millis(4999)).await;
    assert!(watch.state.syncing());

    tokio::time::sleep(Duration::from_millis(2)).await;
    assert!(!watch.state.syncing());
    let view = watch.orchestrator.current_view();
    assert_eq!(view.phase, SecondaryPhase::DirectFetching);
    assert!(view.loading);

    shutdown.cancel();
}

#[tokio::test(start_paused = true)]
async fn test_late_peer_reply_overrides_direct_fetch() {
    let shutdown = CancellationToken::new();
    let (phone_end, watch_end) = link();
    let phone_link = phone_end.transport.clone();
    phone_link.set_connected(true);
    let _phone_events = phone_end.events;

    let watch_fetcher = ScriptedFetcher::with("London", Ok(weather("London", 20)));
    let mut watch = spawn_watch(watch_end, watch_fetcher, &shutdown);
    watch.orchestrator.start().await;

    let view = wait_until(&mut watch.view, |v| v.phase == SecondaryPhase::Ready).await;
    assert_eq!(view.snapshot.map(|s| s.temperature), Some(20));
    assert_eq!(watch.state.data_source(), DataSource::DirectFetch);

    let late = wire::encode_weather_message(&weather("London", 18)).unwrap();
    phone_link
        .send_message(&phone_link.remote().id, wire::WEATHER_MESSAGE_PATH, &late)
        .await
        .unwrap();

    let view = wait_until(&mut watch.view, |v| {
        v.snapshot.as_ref().map(|s| s.temperature) == Some(18)
    })
    .await;
    assert_eq!(view.phase, SecondaryPhase::Ready);
    assert_eq!(watch.state.data_source(), DataSource::Peer);

    shutdown.cancel();
}

#[tokio::test(start_paused = true)]
async fn test_no_phone_fetch_failure_keeps_previous_snapshot() {
    let shutdown = CancellationToken::new();
    let (_phone_end, watch_end) = link();

    let watch_fetcher = ScriptedFetcher::with("Oslo", Ok(weather("Oslo", -3)));
    let watch = spawn_watch(watch_end, watch_fetcher, &shutdown);

    watch.orchestrator.search_city("Oslo").await;
    assert_eq!(watch.orchestrator.current_view().phase, SecondaryPhase::Ready);

    watch.orchestrator.search_city("Foo").await;

    let view = watch.orchestrator.current_view();
    assert_eq!(view.phase, SecondaryPhase::Error);
    assert!(view.error.as_deref().unwrap_or_default().contains("Foo"));
    assert_eq!(view.snapshot, Some(weather("Oslo", -3)));
    assert!(!watch.state.peer_connected());

    shutdown.cancel();
}

#[tokio::test(start_paused = true)]
async fn test_offline_watch_receives_durable_item_on_reconnect() {
    let shutdown = CancellationToken::new();
    let (phone_end, watch_end) = link();
    let phone_link = phone_end.transport.clone();
    let _phone_events = phone_end.events;

    let primary = PrimaryOrchestrator::new(
        Arc::new(phone_link.clone()),
        Arc::new(SqliteSnapshotStore::in_memory().unwrap()),
        Arc::new(ScriptedFetcher::default()),
        prefs(),
        Arc::new(SyncStateTracker::new()),
        PrimaryConfig::default(),
    );
    let report = primary.publish(&weather("Rome", 24)).await;
    assert_eq!(report.attempted(), 0);
    assert!(phone_link.data_item(wire::WEATHER_DATA_PATH).is_some());

    let mut watch = spawn_watch(watch_end, Arc::new(ScriptedFetcher::default()), &shutdown);
    phone_link.set_connected(true);

    let view = wait_until(&mut watch.view, |v| v.snapshot.is_some()).await;
    assert_eq!(view.snapshot, Some(weather("Rome", 24)));
    assert_eq!(watch.state.data_source(), DataSource::Peer);

    shutdown.cancel();
}

#[tokio::test(start_paused = true)]
async fn test_refused_request_falls_back_immediately() {
    let shutdown = CancellationToken::new();
    let (phone_end, watch_end) = link();
    phone_end.transport.set_connected(true);
    let _phone_events = phone_end.events;

    let watch_fetcher = ScriptedFetcher::with("London", Ok(weather("London", 7)));
    let watch = spawn_watch(watch_end, watch_fetcher.clone(), &shutdown);
    watch.link.reject_messages(true);

    let started = tokio::time::Instant::now();
    watch.orchestrator.start().await;

    assert_eq!(started.elapsed(), Duration::ZERO);
    assert!(!watch.state.syncing());
    assert_eq!(watch.state.data_source(), DataSource::DirectFetch);
    assert_eq!(watch_fetcher.calls(), 1);
    assert_eq!(
        watch.orchestrator.current_view().snapshot,
        Some(weather("London", 7))
    );

    shutdown.cancel();
}

#[tokio::test(start_paused = true)]
async fn test_search_while_awaiting_reply_cancels_timer() {
    let shutdown = CancellationToken::new();
    let (phone_end, watch_end) = link();
    phone_end.transport.set_connected(true);
    let _phone_events = phone_end.events;

    let watch_fetcher = ScriptedFetcher::with("Oslo", Ok(weather("Oslo", -2)));
    let watch = spawn_watch(watch_end, watch_fetcher.clone(), &shutdown);
    watch.orchestrator.start().await;
    assert_eq!(
        watch.orchestrator.current_view().phase,
        SecondaryPhase::AwaitingPeerReply
    );

    tokio::time::sleep(Duration::from_secs(1)).await;
    watch.orchestrator.search_city("Oslo").await;

    assert!(!watch.state.syncing());
    assert_eq!(watch_fetcher.calls(), 1);
    assert_eq!(watch.orchestrator.current_view().phase, SecondaryPhase::Ready);

    // Past the original reply deadline
    tokio::time::sleep(Duration::from_millis(4500)).await;
    let view = watch.orchestrator.current_view();
    assert_eq!(watch_fetcher.calls(), 1);
    assert_eq!(view.phase, SecondaryPhase::Ready);
    assert_eq!(view.snapshot, Some(weather("Oslo", -2)));
    assert!(!watch.state.syncing());

    shutdown.cancel();
}

#[tokio::test(start_paused = true)]
async fn test_start_without_phone_reports_unknown_city() {
    let shutdown = CancellationToken::new();
    let (_phone_end, watch_end) = link();

    let fetcher = Arc::new(PhaseRecordingFetcher::default());
    let watch = spawn_watch_in(watch_end, fetcher.clone(), prefs_for("Foo"), &shutdown);
    *fetcher.view.lock() = Some(watch.orchestrator.view());
    assert_eq!(watch.orchestrator.current_view().phase, SecondaryPhase::Init);

    watch.orchestrator.start().await;

    assert_eq!(fetcher.phases.lock().as_slice(), [SecondaryPhase::DirectFetching]);
    let view = watch.orchestrator.current_view();
    assert_eq!(view.phase, SecondaryPhase::Error);
    assert_eq!(view.error.as_deref(), Some("City not found: Foo"));
    assert!(view.snapshot.is_none());
    assert!(!view.loading);
    assert!(!watch.state.peer_connected());
    assert!(!watch.state.syncing());

    shutdown.cancel();
}
