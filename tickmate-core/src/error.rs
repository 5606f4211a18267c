use thiserror::Error;

/// Errors surfaced by the broker client.
///
/// `Auth` tells the caller to drop its cached connection and re-login;
/// `Network` is transient and the connection should be kept; `Api` is a
/// definitive broker-side rejection and is shown to the user verbatim.
#[derive(Error, Debug)]
pub enum BrokerError {
    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("broker API error {code}: {message}")]
    Api { code: String, message: String },

    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("invalid response from broker: {0}")]
    InvalidResponse(String),

    #[error("unknown symbol {symbol} on {exchange}")]
    UnknownSymbol { symbol: String, exchange: String },
}

impl BrokerError {
    /// True for failures that do not prove the session is dead
    /// (timeouts, connection resets). The sweep keeps connections on these.
    pub fn is_transient(&self) -> bool {
        matches!(self, BrokerError::Network(_))
    }
}

/// Errors from the completion-service client.
#[derive(Error, Debug)]
pub enum CompletionError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("completion API error ({code}): {message}")]
    Api { code: u16, message: String },

    #[error("completion response carried no choices")]
    EmptyResponse,

    #[error("all {attempts} retry attempts failed")]
    RetryExhausted { attempts: usize },
}

/// Configuration loading errors.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("missing required environment variables: {}", .0.join(", "))]
    MissingVars(Vec<String>),

    #[error("invalid value for {name}: {reason}")]
    InvalidValue { name: String, reason: String },

    #[error(transparent)]
    Source(#[from] config::ConfigError),
}
