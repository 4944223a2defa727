use thiserror::Error;

/// Top-level error type for warelay.
#[derive(Debug, Error)]
pub enum RelayError {
    /// Missing or wrong API key.
    #[error("Invalid API key")]
    Unauthorized,

    /// Missing fields, unknown instance, or QR not yet available.
    #[error("{0}")]
    BadRequest(String),

    /// No session registered under the given instance id.
    #[error("instance '{0}' not found")]
    NotFound(String),

    /// The registry already holds the maximum number of sessions.
    #[error("capacity exceeded: at most {limit} concurrent session(s) allowed")]
    CapacityExceeded { limit: usize },

    /// The underlying client could not start.
    #[error("initialization failed: {0}")]
    InitializationFailed(String),

    /// The session is not ready or the underlying send raised.
    #[error("{0}")]
    SendFailed(String),

    /// The underlying logout raised.
    #[error("{0}")]
    LogoutFailed(String),

    /// QR payload could not be encoded as an image.
    #[error("qr error: {0}")]
    Qr(String),

    /// Error from the messaging client itself.
    #[error("backend error: {0}")]
    Backend(String),

    /// Configuration error.
    #[error("config error: {0}")]
    Config(String),

    /// I/O error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl RelayError {
    /// HTTP status code the router answers with for this error.
    pub fn status_code(&self) -> u16 {
        match self {
            Self::Unauthorized => 401,
            Self::BadRequest(_) | Self::NotFound(_) => 400,
            _ => 500,
        }
    }
}
