//! Weather data for SkyLink.
//!
//! The snapshot value type, the upstream REST client, and local persistence
//! (single-slot snapshot cache and user preferences).

pub mod provider;
pub mod retry;
pub mod settings;
pub mod store;
pub mod types;

pub use provider::{OpenWeatherClient, WeatherFetcher};
pub use retry::RetryConfig;
pub use settings::{Preferences, SqlitePreferences};
pub use store::{SnapshotStore, SqliteSnapshotStore};
pub use types::{CurrentWeatherResponse, WeatherSnapshot, UNKNOWN_CONDITION};
