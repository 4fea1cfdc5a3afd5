use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Condition text used when the upstream reports none.
pub const UNKNOWN_CONDITION: &str = "Unknown";

/// A single point-in-time weather reading.
///
/// This is the unit of exchange between phone and watch: the snapshot store
/// holds exactly one, and both sync channels carry one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WeatherSnapshot {
    pub city: String,
    /// Whole degrees in the configured unit system
    pub temperature: i32,
    /// Relative humidity, percent
    pub humidity: i32,
    pub wind_speed: f32,
    /// Short condition label, e.g. "Clouds"
    pub condition: String,
    /// Capture time, epoch seconds
    pub captured_at: i64,
}

impl WeatherSnapshot {
    pub fn new(
        city: impl Into<String>,
        temperature: i32,
        humidity: i32,
        wind_speed: f32,
        condition: impl Into<String>,
        captured_at: i64,
    ) -> Self {
        Self {
            city: city.into(),
            temperature,
            humidity,
            wind_speed,
            condition: condition.into(),
            captured_at,
        }
    }
}

/// Current-weather response from the upstream API.
///
/// Only the fields the sync protocol carries are decoded.
#[derive(Debug, Clone, Deserialize)]
pub struct CurrentWeatherResponse {
    pub name: String,
    pub main: MainReading,
    #[serde(default)]
    pub weather: Vec<ConditionEntry>,
    pub wind: WindReading,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MainReading {
    pub temp: f64,
    pub humidity: i32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ConditionEntry {
    pub main: String,
    #[serde(default)]
    pub description: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WindReading {
    pub speed: f64,
}

impl CurrentWeatherResponse {
    /// Flatten the API response into a snapshot captured at `captured_at`
    pub fn into_snapshot(self, captured_at: DateTime<Utc>) -> WeatherSnapshot {
        let condition = self
            .weather
            .into_iter()
            .next()
            .map(|w| w.main)
            .unwrap_or_else(|| UNKNOWN_CONDITION.to_string());

        WeatherSnapshot {
            city: self.name,
            // Truncation toward zero, as the watch face shows whole degrees
            temperature: self.main.temp as i32,
            humidity: self.main.humidity,
            wind_speed: self.wind.speed as f32,
            condition,
            captured_at: captured_at.timestamp(),
        }
    }
}
