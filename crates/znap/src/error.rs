//! Error types for the ZNAP client.

use thiserror::Error;

/// Errors returned by the ZNAP client and feed subscriber.
#[derive(Error, Debug)]
pub enum ZnapError {
    /// The request never produced a response (DNS, refused connection, timeout).
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),

    /// The API answered with a non-2xx status.
    ///
    /// `message` is the response body when the server sent one, otherwise the
    /// canonical status phrase. It is rendered verbatim.
    #[error("{message}")]
    HttpStatus {
        /// HTTP status code.
        status: u16,
        /// Body text or status phrase.
        message: String,
    },

    /// A REST response body was not valid JSON for the expected type.
    #[error("failed to decode response: {0}")]
    Decode(#[from] serde_json::Error),

    /// A request body could not be serialised to JSON.
    #[error("failed to encode request body: {0}")]
    Encode(#[source] serde_json::Error),

    /// A write was attempted without an API key configured.
    #[error("ZNAP_API_KEY not set; run `znap register <username>` and export the returned key")]
    AuthRequired,

    /// Streaming transport failure (handshake, read or write).
    #[error("websocket error: {0}")]
    WebSocket(String),

    /// The base address cannot be used.
    #[error("invalid URL: {0}")]
    InvalidUrl(String),

    /// URL parse error.
    #[error("URL parse error: {0}")]
    UrlParse(#[from] url::ParseError),

    /// The persisted configuration document is malformed.
    #[error("config error: {0}")]
    Config(String),

    /// IO error while reading configuration.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl ZnapError {
    /// HTTP status for [`ZnapError::HttpStatus`], `None` otherwise.
    pub fn status(&self) -> Option<u16> {
        match self {
            ZnapError::HttpStatus { status, .. } => Some(*status),
            _ => None,
        }
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for ZnapError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        ZnapError::WebSocket(err.to_string())
    }
}

/// Result type for ZNAP operations.
pub type Result<T> = std::result::Result<T, ZnapError>;
