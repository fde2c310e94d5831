use thiserror::Error;

/// Application-wide error types.
///
/// This enum represents all possible errors that can occur while talking to the
/// remote service or reconciling a dataset against it. It uses the `thiserror`
/// crate for ergonomic error handling and automatic conversion from underlying
/// library errors.
///
/// # Error Conversion
///
/// - `serde_json::Error` → `AppError::SerializationError`
/// - `csv::Error` → `AppError::CsvError`
///
/// # Examples
///
/// ```
/// use concord_core::error::AppError;
///
/// let err = AppError::Api { status: 404, message: "Company not found".to_string() };
/// assert!(err.is_not_found());
/// assert!(!err.is_retryable());
/// ```
#[derive(Error, Debug)]
pub enum AppError {
    /// The remote service rejected the request (4xx other than 429).
    ///
    /// `message` is the best-effort human message extracted from the
    /// service's error envelope.
    #[error("Remote API error (HTTP {status}): {message}")]
    Api { status: u16, message: String },

    /// The remote service failed (5xx).
    #[error("Remote server error (HTTP {status}): {message}")]
    ServerError { status: u16, message: String },

    /// HTTP client failure that is neither a timeout nor a connect error.
    #[error("API Client error: {0}")]
    ClientError(String),

    /// JSON serialization or deserialization failed.
    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    /// Dataset text could not be read or written as CSV.
    #[error("CSV error: {0}")]
    CsvError(#[from] csv::Error),

    /// URL parsing failed.
    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    /// API response contained no usable data.
    #[error("Empty response from API")]
    EmptyResponse,

    /// Network or connection error.
    ///
    /// DNS failures, refused connections and resets all land here.
    #[error("Network error: {0}")]
    NetworkError(String),

    /// Request timeout.
    #[error("Request timed out after {0} seconds")]
    Timeout(u64),

    /// Rate limit exceeded (HTTP 429).
    #[error("Rate limit exceeded. Please wait and try again.")]
    RateLimitExceeded,

    /// Configuration file or option is invalid.
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// Credentials were not supplied.
    #[error("Missing credentials: {0}")]
    MissingCredentials(String),

    /// A row failed local validation before any remote call.
    #[error("Validation failed: {0}")]
    ValidationError(String),

    /// Generic application error for cases not covered by specific variants.
    #[error("Error: {0}")]
    Generic(String),
}

impl AppError {
    /// Returns a user-friendly error message suitable for CLI output.
    pub fn user_message(&self) -> String {
        match self {
            AppError::Api { status: 401, .. } | AppError::Api { status: 403, .. } => {
                "The remote service refused the credentials.\n   Check your CONCORD_API_TOKEN environment variable.".to_string()
            }
            AppError::Api { status, message } => {
                format!("The remote service rejected the request (HTTP {}): {}", status, message)
            }
            AppError::ServerError { status, .. } => {
                format!("The remote service failed with HTTP {}.\n   Try again later.", status)
            }
            AppError::ClientError(msg) => {
                if msg.contains("connect") {
                    format!("Cannot connect to the remote service: {}\n   Check your internet connection and the configured base URL.", msg)
                } else {
                    format!("API error: {}", msg)
                }
            }
            AppError::NetworkError(msg) => {
                format!("Network error: {}\n   Check your internet connection.", msg)
            }
            AppError::Timeout(secs) => {
                format!("Request timed out after {} seconds.\n   The server may be overloaded. Try again later.", secs)
            }
            AppError::RateLimitExceeded => {
                "Too many requests. Please wait a moment and try again.".to_string()
            }
            AppError::MissingCredentials(what) => {
                format!("Missing credentials: {}\n   Set CONCORD_API_TOKEN or pass --token.", what)
            }
            AppError::EmptyResponse => {
                "The API returned no data. The service may be temporarily unavailable.".to_string()
            }
            _ => self.to_string(),
        }
    }

    /// Returns true if this error is transient and the request may be retried.
    ///
    /// # Examples
    ///
    /// ```
    /// use concord_core::error::AppError;
    ///
    /// assert!(AppError::NetworkError("connection reset".to_string()).is_retryable());
    /// assert!(AppError::RateLimitExceeded.is_retryable());
    /// assert!(AppError::ServerError { status: 502, message: "Bad Gateway".into() }.is_retryable());
    /// assert!(!AppError::Api { status: 400, message: "bad".into() }.is_retryable());
    /// ```
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            AppError::NetworkError(_)
                | AppError::Timeout(_)
                | AppError::RateLimitExceeded
                | AppError::ServerError { .. }
        )
    }

    /// HTTP status carried by the error, if any.
    pub fn status(&self) -> Option<u16> {
        match self {
            AppError::Api { status, .. } | AppError::ServerError { status, .. } => Some(*status),
            AppError::RateLimitExceeded => Some(429),
            _ => None,
        }
    }

    pub fn is_not_found(&self) -> bool {
        self.status() == Some(404)
    }

    pub fn is_conflict(&self) -> bool {
        self.status() == Some(409)
    }

    /// Returns true when the remote rejected the payload and its message names
    /// `field`.
    ///
    /// Matching is a case-insensitive substring search on the extracted
    /// message, with underscores also accepted as spaces ("owner_email" matches
    /// "Owner email is not a known user").
    pub fn rejects_field(&self, field: &str) -> bool {
        let AppError::Api { status, message } = self else {
            return false;
        };
        if *status != 400 && *status != 422 {
            return false;
        }
        let message = message.to_lowercase();
        let field = field.to_lowercase();
        message.contains(&field) || message.contains(&field.replace('_', " "))
    }
}
