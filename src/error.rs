//! Error types for LinkUp Core

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    // ===== Credential errors =====
    #[error("Not logged in")]
    NotLoggedIn,

    #[error("Invalid credentials")]
    InvalidCredentials,

    #[error("Session expired")]
    SessionExpired,

    // ===== Channel errors =====
    #[error("Channel not connected")]
    ChannelDown,

    #[error("Channel error: {0}")]
    Channel(String),

    // ===== Media errors =====
    #[error("Calls are not supported on this device")]
    MediaUnsupported,

    #[error("Media device error: {0}")]
    Media(String),

    // ===== Signaling errors =====
    #[error("Another call is already in progress")]
    Busy,

    #[error("Invalid call state: {0}")]
    InvalidCallState(String),

    #[error("Call signaling error: {0}")]
    Signaling(String),

    // ===== Ambient =====
    #[error("HTTP error: {0}")]
    Http(String),

    #[error("WebSocket error: {0}")]
    WebSocket(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        Error::Http(e.to_string())
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for Error {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        Error::WebSocket(e.to_string())
    }
}

impl From<webrtc::Error> for Error {
    fn from(e: webrtc::Error) -> Self {
        Error::Signaling(e.to_string())
    }
}
