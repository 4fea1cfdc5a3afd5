use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;

use skylink_sync::{
    EventDispatcher, MemoryTransport, PeerDescriptor, PrimaryConfig, PrimaryOrchestrator,
    SecondaryConfig, SecondaryOrchestrator, SecondaryPhase, SyncStateTracker,
};
use skylink_weather::{OpenWeatherClient, RetryConfig, SqlitePreferences, SqliteSnapshotStore};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize core
    skylink_core::init()?;

    let mut app = skylink_core::App::new()?;
    let config = app.config_arc();
    tracing::info!("SkyLink started");

    let api_key = config.weather.api_key.clone().unwrap_or_default();
    let retry = RetryConfig::from(&config.retry);

    // Phone side: persistent cache and preferences
    let db_path = config.database_path();
    let phone_store = Arc::new(
        SqliteSnapshotStore::open(&db_path)
            .with_context(|| format!("opening {}", db_path.display()))?,
    );
    let phone_prefs = Arc::new(SqlitePreferences::open(
        &db_path,
        api_key.clone(),
        config.weather.default_city.clone(),
    )?);
    let phone_fetcher = Arc::new(OpenWeatherClient::new(
        &config.weather,
        retry.clone(),
        phone_prefs.clone(),
    )?);

    // Watch side: its own preferences, no cache
    let watch_prefs = Arc::new(SqlitePreferences::in_memory(
        api_key,
        config.weather.default_city.clone(),
    )?);
    let watch_fetcher = Arc::new(OpenWeatherClient::new(
        &config.weather,
        retry,
        watch_prefs.clone(),
    )?);

    let (phone_end, watch_end) = MemoryTransport::pair(
        PeerDescriptor::new("phone", "Phone"),
        PeerDescriptor::new("watch", "Watch"),
    );
    let link = phone_end.transport.clone();

    let phone_state = Arc::new(SyncStateTracker::new());
    let primary = Arc::new(PrimaryOrchestrator::new(
        Arc::new(phone_end.transport),
        phone_store,
        phone_fetcher,
        phone_prefs,
        phone_state,
        PrimaryConfig::from(&config.sync),
    ));

    let watch_state = Arc::new(SyncStateTracker::new());
    let sync_view = watch_state.view();
    let secondary = SecondaryOrchestrator::new(
        Arc::new(watch_end.transport),
        watch_fetcher,
        watch_prefs,
        watch_state,
        SecondaryConfig::from(&config.sync),
    );

    let pump = EventDispatcher::new(primary, app.shutdown_token());
    app.spawn_service("phone-events", pump.run(phone_end.events));
    let pump = EventDispatcher::new(Arc::new(secondary.clone()), app.shutdown_token());
    app.spawn_service("watch-events", pump.run(watch_end.events));

    link.set_connected(true);
    secondary.start().await;

    let deadline = config.sync.sync_timeout()
        + config.weather.request_timeout() * 2
        + Duration::from_secs(1);
    let mut view = secondary.view();
    let settled = tokio::time::timeout(
        deadline,
        view.wait_for(|v| matches!(v.phase, SecondaryPhase::Ready | SecondaryPhase::Error)),
    )
    .await
    .map(|seen| seen.map(|v| v.clone()));

    match settled {
        Ok(Ok(view)) => match (&view.snapshot, &view.error) {
            (_, Some(error)) => println!("Watch error: {}", error),
            (Some(snapshot), None) => println!(
                "{}: {}°, {}, humidity {}%, wind {} m/s (via {:?})",
                snapshot.city,
                snapshot.temperature,
                snapshot.condition,
                snapshot.humidity,
                snapshot.wind_speed,
                sync_view.data_source()
            ),
            (None, None) => println!("Watch has no weather yet"),
        },
        Ok(Err(_)) => tracing::warn!("Watch view closed before settling"),
        Err(_) => tracing::warn!("Watch did not settle within {:?}", deadline),
    }

    // Graceful shutdown
    app.shutdown().await?;

    Ok(())
}
