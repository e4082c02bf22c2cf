use thiserror::Error;

/// Result type for gateway operations
pub type Result<T> = std::result::Result<T, GatewayError>;

/// Errors that can occur when talking to a TouchWand controller
#[derive(Error, Debug)]
pub enum GatewayError {
    /// WebSocket connection error
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    /// HTTP transport error from the REST client
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Connection was closed unexpectedly
    #[error("Connection closed")]
    ConnectionClosed,

    /// Request or connect attempt timed out
    #[error("Request timeout")]
    Timeout,

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Endpoint URL could not be built
    #[error("Invalid URL: {0}")]
    InvalidUrl(#[from] url::ParseError),

    /// Bridge configuration is unusable
    #[error("Configuration error: {0}")]
    Config(String),

    /// A REST call was made before a successful login
    #[error("Not connected to controller")]
    NotConnected,

    /// Invalid or unexpected response from the controller
    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    /// Unit type string is not one this crate handles
    #[error("Unsupported unit type: {0}")]
    UnsupportedUnitType(String),
}
