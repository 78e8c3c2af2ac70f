//! Error types for the exporter.

use thiserror::Error;

/// Errors that can occur while authenticating, fetching or serving metrics.
#[derive(Debug, Error)]
pub enum ExporterError {
    /// Missing or invalid configuration (credentials, numeric overrides, YAML syntax)
    #[error("Config error: {0}")]
    Config(String),

    /// The refresh token was rejected with `invalid_grant`
    #[error(
        "Refresh token expired! Generate a new one in the Netatmo developer console, \
         then write it as refresh_token into {token_file} or delete that file and \
         set NETATMO_REFRESH_TOKEN"
    )]
    TokenExpired { token_file: String },

    /// Token refresh or access token failure that may succeed on a later cycle
    #[error("Auth error: {0}")]
    Auth(String),

    /// The API answered 429
    #[error("API throttling: too many requests")]
    Throttling,

    /// Any other non-success answer or transport failure from the API
    #[error("API error: {0}")]
    Api(String),

    /// The API answered with a body that is not valid JSON
    #[error("JSON decode error: {0}")]
    JsonDecode(String),

    /// The token file could not be written
    #[error("Credential store error: {0}")]
    CredentialStore(String),

    /// Registry or encoder failure
    #[error("Metrics error: {0}")]
    Metrics(String),

    /// Metrics listener failure
    #[error("Server error: {0}")]
    Server(String),
}

impl ExporterError {
    /// Whether the process must stop instead of retrying after the poll interval.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            ExporterError::Config(_)
                | ExporterError::TokenExpired { .. }
                | ExporterError::CredentialStore(_)
        )
    }
}

impl From<prometheus::Error> for ExporterError {
    fn from(err: prometheus::Error) -> Self {
        ExporterError::Metrics(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, ExporterError>;
