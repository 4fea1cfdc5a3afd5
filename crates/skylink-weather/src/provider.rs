//! Upstream current-weather client.

use async_trait::async_trait;
use chrono::Utc;
use reqwest::Client;
use skylink_core::{FetchError, ReqwestErrorExt, WeatherConfig};
use std::sync::Arc;
use tracing::instrument;

use crate::retry::{with_retry, RetryConfig};
use crate::settings::Preferences;
use crate::types::{CurrentWeatherResponse, WeatherSnapshot};

/// Fetches a fresh reading for a city.
///
/// Both orchestrators depend on this trait only; every failure is reported as
/// a `FetchError` and never panics.
#[async_trait]
pub trait WeatherFetcher: Send + Sync {
    async fn fetch(&self, city: &str) -> Result<WeatherSnapshot, FetchError>;
}

/// `WeatherFetcher` backed by the OpenWeatherMap-style REST API.
#[derive(Clone)]
pub struct OpenWeatherClient {
    client: Client,
    base_url: String,
    units: String,
    prefs: Arc<dyn Preferences>,
    retry: RetryConfig,
}

impl std::fmt::Debug for OpenWeatherClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenWeatherClient")
            .field("base_url", &self.base_url)
            .field("units", &self.units)
            .field("retry", &self.retry)
            .finish()
    }
}

impl OpenWeatherClient {
    pub fn new(
        config: &WeatherConfig,
        retry: RetryConfig,
        prefs: Arc<dyn Preferences>,
    ) -> Result<Self, FetchError> {
        let client = Client::builder()
            .timeout(config.request_timeout())
            .build()
            .map_err(|e| FetchError::Unknown(e.to_string()))?;

        Ok(Self {
            client,
            base_url: config.api_base_url.trim_end_matches('/').to_string(),
            units: config.units.clone(),
            prefs,
            retry,
        })
    }
}

#[async_trait]
impl WeatherFetcher for OpenWeatherClient {
    #[instrument(skip(self), level = "info")]
    async fn fetch(&self, city: &str) -> Result<WeatherSnapshot, FetchError> {
        let city = city.trim();
        if city.is_empty() {
            return Err(FetchError::CityNotFound(String::new()));
        }

        let api_key = self.prefs.api_key();
        if api_key.is_empty() {
            tracing::warn!("No API key configured, skipping request");
            return Err(FetchError::InvalidApiKey);
        }

        let url = format!("{}/weather", self.base_url);
        let query = [
            ("q", city),
            ("units", self.units.as_str()),
            ("appid", api_key.as_str()),
        ];

        let response = with_retry(&self.retry, || {
            self.client.get(&url).query(&query).send()
        })
        .await
        .map_err(|e| e.into_fetch_error(city))?;

        let response = response
            .error_for_status()
            .map_err(|e| e.into_fetch_error(city))?;

        let body: CurrentWeatherResponse = response
            .json()
            .await
            .map_err(|e| e.into_fetch_error(city))?;

        let snapshot = body.into_snapshot(Utc::now());
        tracing::info!(
            "Weather fetched: {}, {}°, {}",
            snapshot.city,
            snapshot.temperature,
            snapshot.condition
        );
        Ok(snapshot)
    }
}
