//! Wire format shared by the phone and watch apps.
//!
//! Both apps must agree on these paths and encodings byte for byte.
//! Snapshot timestamps are epoch seconds in memory and epoch milliseconds on
//! the wire.

use serde::{Deserialize, Serialize};
use skylink_core::PayloadError;
use skylink_weather::{WeatherSnapshot, UNKNOWN_CONDITION};

use crate::transport::{DataMap, DataValue};

pub const SYNC_REQUEST_PATH: &str = "/sync_request";
pub const WEATHER_MESSAGE_PATH: &str = "/weather_message";
pub const WEATHER_DATA_PATH: &str = "/weather_data";
pub const SYNC_TRIGGER_PATH: &str = "/sync_request_trigger";

/// Sync kind the watch sends.
pub const FULL_SYNC: &str = "full_sync";

/// Triggers older than this at receipt are dropped.
pub const DEFAULT_STALENESS_MS: i64 = 10_000;

const KEY_TEMPERATURE: &str = "temperature";
const KEY_CONDITION: &str = "condition";
const KEY_HUMIDITY: &str = "humidity";
const KEY_WIND_SPEED: &str = "wind_speed";
const KEY_LOCATION: &str = "location";
const KEY_TIMESTAMP: &str = "timestamp";
const KEY_EMBEDDED_JSON: &str = "weather_data";
const KEY_SYNC_TYPE: &str = "sync_type";
const KEY_REQUEST_TIME: &str = "request_time";

/// True for `base` itself and any path nested under it.
pub fn path_matches(path: &str, base: &str) -> bool {
    match path.strip_prefix(base) {
        Some(rest) => rest.is_empty() || rest.starts_with('/'),
        None => false,
    }
}

/// JSON body of a `/weather_message`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WeatherMessage {
    temperature: i32,
    condition: String,
    humidity: i32,
    wind_speed: f32,
    city_name: String,
    /// Epoch milliseconds
    timestamp: i64,
}

impl From<&WeatherSnapshot> for WeatherMessage {
    fn from(snapshot: &WeatherSnapshot) -> Self {
        Self {
            temperature: snapshot.temperature,
            condition: snapshot.condition.clone(),
            humidity: snapshot.humidity,
            wind_speed: snapshot.wind_speed,
            city_name: snapshot.city.clone(),
            timestamp: secs_to_millis(snapshot.captured_at),
        }
    }
}

impl From<WeatherMessage> for WeatherSnapshot {
    fn from(message: WeatherMessage) -> Self {
        WeatherSnapshot::new(
            message.city_name,
            message.temperature,
            message.humidity,
            message.wind_speed,
            message.condition,
            millis_to_secs(message.timestamp),
        )
    }
}

fn secs_to_millis(secs: i64) -> i64 {
    secs.saturating_mul(1000)
}

fn millis_to_secs(millis: i64) -> i64 {
    millis.div_euclid(1000)
}

pub fn encode_weather_message(snapshot: &WeatherSnapshot) -> Result<Vec<u8>, PayloadError> {
    serde_json::to_vec(&WeatherMessage::from(snapshot))
        .map_err(|e| PayloadError::MalformedJson(e.to_string()))
}

pub fn decode_weather_message(payload: &[u8]) -> Result<WeatherSnapshot, PayloadError> {
    let text = std::str::from_utf8(payload).map_err(|_| PayloadError::InvalidUtf8)?;
    decode_weather_json(text)
}

fn decode_weather_json(text: &str) -> Result<WeatherSnapshot, PayloadError> {
    let message: WeatherMessage =
        serde_json::from_str(text).map_err(|e| PayloadError::MalformedJson(e.to_string()))?;
    Ok(message.into())
}

/// Data-item form of a snapshot, written to `/weather_data`.
pub fn weather_data_item(snapshot: &WeatherSnapshot) -> DataMap {
    let mut item = DataMap::new();
    item.put_int(KEY_TEMPERATURE, snapshot.temperature)
        .put_text(KEY_CONDITION, snapshot.condition.clone())
        .put_int(KEY_HUMIDITY, snapshot.humidity)
        .put_float(KEY_WIND_SPEED, snapshot.wind_speed)
        .put_text(KEY_LOCATION, snapshot.city.clone())
        .put_long(KEY_TIMESTAMP, secs_to_millis(snapshot.captured_at));
    item
}

/// Decode a `/weather_data` item.
///
/// An embedded `weather_data` JSON string takes precedence over the
/// individual keys. Missing text fields fall back to "Unknown"; numeric
/// fields are required.
pub fn decode_weather_data_item(item: &DataMap) -> Result<WeatherSnapshot, PayloadError> {
    if let Some(DataValue::Text(json)) = item.get(KEY_EMBEDDED_JSON) {
        return decode_weather_json(json);
    }

    let text_or_unknown = |key: &str| -> Result<String, PayloadError> {
        match item.text(key) {
            Ok(value) => Ok(value.to_string()),
            Err(PayloadError::MissingField(_)) => Ok(UNKNOWN_CONDITION.to_string()),
            Err(e) => Err(e),
        }
    };

    Ok(WeatherSnapshot::new(
        text_or_unknown(KEY_LOCATION)?,
        item.int(KEY_TEMPERATURE)?,
        item.int(KEY_HUMIDITY)?,
        item.float(KEY_WIND_SPEED)?,
        text_or_unknown(KEY_CONDITION)?,
        millis_to_secs(item.long(KEY_TIMESTAMP)?),
    ))
}

/// What a sync request asks for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncKind {
    /// `all`, or the watch's `full_sync`
    All,
    Weather,
    Unrecognized(String),
}

impl SyncKind {
    pub fn parse(token: &str) -> Self {
        match token.trim() {
            FULL_SYNC | "all" => SyncKind::All,
            "weather" => SyncKind::Weather,
            other => SyncKind::Unrecognized(other.to_string()),
        }
    }
}

pub fn encode_sync_request() -> Vec<u8> {
    FULL_SYNC.as_bytes().to_vec()
}

pub fn decode_sync_request(payload: &[u8]) -> Result<SyncKind, PayloadError> {
    let text = std::str::from_utf8(payload).map_err(|_| PayloadError::InvalidUtf8)?;
    Ok(SyncKind::parse(text))
}

/// Data-channel sync request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncTrigger {
    pub sync_type: String,
    /// Epoch milliseconds when the watch asked
    pub request_time: i64,
}

impl SyncTrigger {
    pub fn full(request_time: i64) -> Self {
        Self {
            sync_type: FULL_SYNC.to_string(),
            request_time,
        }
    }

    pub fn kind(&self) -> SyncKind {
        SyncKind::parse(&self.sync_type)
    }

    /// Milliseconds between the request and `now_ms`.
    pub fn age_ms(&self, now_ms: i64) -> i64 {
        now_ms.saturating_sub(self.request_time)
    }

    /// Older than `max_age_ms`. A trigger exactly `max_age_ms` old is fresh.
    pub fn is_stale(&self, now_ms: i64, max_age_ms: i64) -> bool {
        self.age_ms(now_ms) > max_age_ms
    }

    pub fn to_data_item(&self) -> DataMap {
        let mut item = DataMap::new();
        item.put_text(KEY_SYNC_TYPE, self.sync_type.clone())
            .put_long(KEY_REQUEST_TIME, self.request_time);
        item
    }

    /// A missing sync type means a full sync; a missing time makes the
    /// trigger ancient, so it will be dropped as stale.
    pub fn from_data_item(item: &DataMap) -> Result<Self, PayloadError> {
        let sync_type = match item.text(KEY_SYNC_TYPE) {
            Ok(value) => value.to_string(),
            Err(PayloadError::MissingField(_)) => FULL_SYNC.to_string(),
            Err(e) => return Err(e),
        };
        let request_time = match item.long(KEY_REQUEST_TIME) {
            Ok(value) => value,
            Err(PayloadError::MissingField(_)) => 0,
            Err(e) => return Err(e),
        };
        Ok(Self {
            sync_type,
            request_time,
        })
    }
}
