//! Centralized error types for SkyLink.
//!
//! Every failure in the sync subsystem is one of these kinds. None of them is
//! fatal: the orchestrators catch them at the call site and turn them into a
//! state update or a log line. `user_message()` gives the text a UI may show.

use thiserror::Error;

/// Top-level application error type.
///
/// Use `user_message()` to get a UI-appropriate message.
#[derive(Debug, Error)]
pub enum AppError {
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Weather fetch error: {0}")]
    Fetch(#[from] FetchError),

    #[error("Payload error: {0}")]
    Payload(#[from] PayloadError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

impl AppError {
    /// Returns a user-friendly message suitable for display in the UI.
    pub fn user_message(&self) -> String {
        match self {
            AppError::Transport(e) => e.user_message().to_string(),
            AppError::Fetch(e) => e.user_message(),
            AppError::Payload(e) => e.user_message().to_string(),
            AppError::Storage(e) => e.user_message().to_string(),
            AppError::Config(e) => e.user_message().to_string(),
            AppError::Io(_) => "A file operation failed. Please try again.".to_string(),
            AppError::Other(_) => "An unexpected error occurred. Please try again.".to_string(),
        }
    }
}

/// Device-to-device transport failures.
///
/// Always non-fatal: a failed send to one peer never blocks the next peer.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    #[error("Peer unreachable: {0}")]
    PeerUnreachable(String),

    #[error("Send rejected: {0}")]
    Rejected(String),

    #[error("Transport disconnected")]
    Disconnected,
}

impl TransportError {
    pub fn user_message(&self) -> &'static str {
        match self {
            TransportError::PeerUnreachable(_) => "Paired device is not reachable.",
            TransportError::Rejected(_) => "The paired device rejected the update.",
            TransportError::Disconnected => "Device link is not available.",
        }
    }
}

/// Upstream weather fetch failures.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum FetchError {
    #[error("Network error: {0}")]
    Network(String),

    #[error("Invalid API key")]
    InvalidApiKey,

    #[error("City not found: {0}")]
    CityNotFound(String),

    #[error("Unknown error: {0}")]
    Unknown(String),
}

impl FetchError {
    /// User-facing text, shown only on the side actively waiting for data.
    pub fn user_message(&self) -> String {
        match self {
            Self::Network(_) => {
                "Couldn't reach server. Check your internet connection.".to_string()
            }
            Self::InvalidApiKey => "Invalid API key. Please check your settings.".to_string(),
            Self::CityNotFound(city) => format!("City not found: {}", city),
            Self::Unknown(detail) => format!("An unexpected error occurred: {}", detail),
        }
    }
}

/// Inbound message or data item that could not be decoded.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PayloadError {
    #[error("Payload is not valid UTF-8")]
    InvalidUtf8,

    #[error("Malformed JSON: {0}")]
    MalformedJson(String),

    #[error("Missing field: {0}")]
    MissingField(String),

    #[error("Field {field} has wrong type, expected {expected}")]
    WrongType { field: String, expected: &'static str },
}

impl PayloadError {
    pub fn user_message(&self) -> &'static str {
        "Received an unreadable update from the paired device."
    }
}

/// Local storage errors (snapshot store, preferences).
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Storage open failed: {0}")]
    OpenFailed(String),

    #[error("Query failed: {0}")]
    QueryFailed(String),

    #[error("Data corruption detected: {0}")]
    Corruption(String),

    #[error("Serialization failed: {0}")]
    Serialization(String),
}

impl StorageError {
    pub fn user_message(&self) -> &'static str {
        match self {
            StorageError::OpenFailed(_) => "Unable to access local data. Try restarting the app.",
            StorageError::QueryFailed(_) => "A data operation failed. Please try again.",
            StorageError::Corruption(_) => {
                "Local data may be corrupted. Consider resetting app data."
            }
            StorageError::Serialization(_) => "Cached weather could not be read.",
        }
    }
}

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Configuration file not found: {0}")]
    NotFound(String),

    #[error("Invalid configuration: {0}")]
    Invalid(String),

    #[error("Configuration parse error: {0}")]
    ParseError(String),

    #[error("Missing required setting: {0}")]
    MissingSetting(String),
}

impl ConfigError {
    pub fn user_message(&self) -> &'static str {
        match self {
            ConfigError::NotFound(_) => "Configuration not found. Using defaults.",
            ConfigError::Invalid(_) => "Invalid configuration. Check your settings.",
            ConfigError::ParseError(_) => "Configuration file is malformed. Check your settings.",
            ConfigError::MissingSetting(_) => "A required setting is missing. Check your settings.",
        }
    }
}

/// Extension trait for classifying reqwest errors as fetch failures.
pub trait ReqwestErrorExt {
    fn into_fetch_error(self, city: &str) -> FetchError;
}

impl ReqwestErrorExt for reqwest::Error {
    fn into_fetch_error(self, city: &str) -> FetchError {
        if self.is_timeout() || self.is_connect() {
            return FetchError::Network(self.to_string());
        }
        match self.status().map(|s| s.as_u16()) {
            Some(401) => FetchError::InvalidApiKey,
            Some(404) => FetchError::CityNotFound(city.to_string()),
            Some(_) => FetchError::Unknown(self.to_string()),
            None if self.is_decode() => FetchError::Unknown(self.to_string()),
            None => FetchError::Network(self.to_string()),
        }
    }
}

/// Extension trait for converting rusqlite errors to our error types.
pub trait RusqliteErrorExt {
    fn into_storage_error(self) -> StorageError;
}

impl RusqliteErrorExt for rusqlite::Error {
    fn into_storage_error(self) -> StorageError {
        match &self {
            rusqlite::Error::SqliteFailure(_, Some(msg)) if msg.contains("corrupt") => {
                StorageError::Corruption(self.to_string())
            }
            _ => StorageError::QueryFailed(self.to_string()),
        }
    }
}
