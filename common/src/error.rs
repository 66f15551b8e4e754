use thiserror::Error;

#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("auth endpoint {endpoint} returned HTTP {status}")]
    Auth { status: u16, endpoint: String },
    #[error("unexpected response from {endpoint}: {detail}")]
    Protocol { endpoint: String, detail: String },
    #[error("controller API {endpoint} returned HTTP {status}")]
    Api { status: u16, endpoint: String },
    #[error("request to {endpoint} failed: {detail}")]
    Network { endpoint: String, detail: String },
    #[error("controller list is empty")]
    NoController,
    #[error("MQTT error: {0}")]
    Transport(String),
    #[error("malformed command: {0}")]
    MalformedCommand(String),
    #[error("credential store {path}: {source}")]
    Store {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("configuration error: {0}")]
    Config(String),
}

pub type Result<T, E = BridgeError> = std::result::Result<T, E>;

impl BridgeError {
    /// Errors that no amount of waiting for the next tick will fix.
    ///
    /// The auth endpoint answers 400 (`invalid_grant`) or 401/403 when the
    /// username or API secret is wrong; retrying those every minute only gets
    /// the account throttled.
    pub fn is_fatal(&self) -> bool {
        match self {
            Self::Auth { status, .. } => matches!(status, 400 | 401 | 403),
            Self::Config(_) | Self::Store { .. } => true,
            _ => false,
        }
    }

    /// The controller API rejected the bearer token.
    pub fn is_unauthorized(&self) -> bool {
        matches!(self, Self::Api { status: 401, .. })
    }
}
