use thiserror::Error;

/// Application-wide error types.
///
/// Each variant corresponds to one of the semantic error kinds the system
/// distinguishes: transport failures (retried inside the HTTP client),
/// per-record parse failures (accumulated as run warnings), invariant
/// violations, storage failures, and scheduling outcomes. No exception-style
/// control flow crosses a component boundary; components return `AppError`
/// and callers decide whether the error ends a record, a chunk, or a run.
///
/// # Error Conversion
///
/// Underlying library errors convert via `#[from]`:
/// - `sqlx::Error` → `AppError::Database`
/// - `serde_json::Error` → `AppError::Serialization`
#[derive(Error, Debug)]
pub enum AppError {
    // ---- Transport ----------------------------------------------------
    /// The per-host circuit breaker is open; no outbound call was made.
    #[error("Circuit open for host: {0}")]
    CircuitOpen(String),

    /// The remote host answered 429 and retries were exhausted.
    #[error("Rate limited by host: {0}")]
    RateLimited(String),

    /// Request exceeded its timeout.
    #[error("Request timed out after {0} seconds")]
    Timeout(u64),

    /// Connection-level failure (DNS, refused, reset).
    #[error("Connection error: {0}")]
    Connection(String),

    /// Non-success HTTP status that is not retryable.
    #[error("HTTP {status} from {url}")]
    Http { status: u16, url: String },

    /// Body could not be decoded as the expected content type.
    #[error("Failed to decode response: {0}")]
    Decoding(String),

    // ---- Parse --------------------------------------------------------
    /// A page was fetched but its structure defeated the adapter's parser.
    #[error("Malformed page: {0}")]
    MalformedPage(String),

    /// A JSON payload deserialized but did not carry the expected shape.
    #[error("Unexpected schema: {0}")]
    UnexpectedSchema(String),

    // ---- Invariant ----------------------------------------------------
    /// A date carried a year outside the accepted window; the record is
    /// skipped and counted as a warning.
    #[error("Year {0} outside accepted window")]
    YearOutOfRange(i32),

    /// A record was missing a field required for ingestion.
    #[error("Missing required field: {0}")]
    MissingField(&'static str),

    // ---- Storage ------------------------------------------------------
    /// Database operation failed.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// A bulk-write chunk failed after its retry.
    #[error("Write failure: {0}")]
    WriteFailure(String),

    // ---- Scheduling ---------------------------------------------------
    /// The run's cancellation handle fired.
    #[error("Run cancelled")]
    JobCancelled,

    /// The run exceeded the scheduler's hard cap (1.5x category timeout).
    #[error("Run exceeded its hard timeout")]
    JobTimeout,

    /// No scraper configuration exists under the given name.
    #[error("Scraper config not found: {0}")]
    ConfigNotFound(String),

    // ---- Other --------------------------------------------------------
    /// JSON serialization or deserialization failed.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// URL parsing failed.
    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    /// Configuration file missing or invalid.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Generic application error for cases not covered by specific variants.
    #[error("Error: {0}")]
    Generic(String),
}

impl AppError {
    /// Returns true if this error is worth retrying at the transport level.
    ///
    /// # Examples
    ///
    /// ```
    /// use licita_core::error::AppError;
    ///
    /// assert!(AppError::Connection("reset".into()).is_retryable());
    /// assert!(AppError::Timeout(600).is_retryable());
    /// assert!(!AppError::Http { status: 404, url: "https://x".into() }.is_retryable());
    /// assert!(!AppError::CircuitOpen("host".into()).is_retryable());
    /// ```
    pub fn is_retryable(&self) -> bool {
        match self {
            AppError::Connection(_) | AppError::Timeout(_) | AppError::RateLimited(_) => true,
            AppError::Http { status, .. } => (500..=599).contains(status),
            _ => false,
        }
    }

    /// Returns true if this error counts as a per-record warning rather than
    /// a run-level error: the run continues and ends `partial` at worst.
    pub fn is_record_level(&self) -> bool {
        matches!(
            self,
            AppError::MalformedPage(_)
                | AppError::UnexpectedSchema(_)
                | AppError::YearOutOfRange(_)
                | AppError::MissingField(_)
        )
    }

    /// Returns a user-friendly error message suitable for CLI output.
    pub fn user_message(&self) -> String {
        match self {
            AppError::Database(e) => {
                if e.to_string().contains("connection") {
                    "Cannot connect to database. Is PostgreSQL running?\n   Check DATABASE_URL."
                        .to_string()
                } else {
                    format!("Database error: {}", e)
                }
            }
            AppError::Timeout(secs) => {
                format!(
                    "Request timed out after {} seconds.\n   The portal may be overloaded. Try again later.",
                    secs
                )
            }
            AppError::CircuitOpen(host) => {
                format!(
                    "{} is failing repeatedly; requests are paused until the cooldown expires.",
                    host
                )
            }
            AppError::Connection(msg) => {
                format!("Network error: {}\n   Check your internet connection.", msg)
            }
            AppError::ConfigNotFound(name) => {
                format!(
                    "No scraper named '{}'.\n   Check sources.toml or `licita jobs`.",
                    name
                )
            }
            _ => self.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = AppError::ConfigNotFound("mendoza".to_string());
        assert_eq!(err.to_string(), "Scraper config not found: mendoza");
    }

    #[test]
    fn test_http_error_display() {
        let err = AppError::Http {
            status: 503,
            url: "https://comprar.gob.ar".to_string(),
        };
        assert_eq!(err.to_string(), "HTTP 503 from https://comprar.gob.ar");
    }

    #[test]
    fn test_is_retryable_server_errors_only() {
        assert!(AppError::Http {
            status: 500,
            url: "https://x".into()
        }
        .is_retryable());
        assert!(!AppError::Http {
            status: 404,
            url: "https://x".into()
        }
        .is_retryable());
        assert!(!AppError::Http {
            status: 429,
            url: "https://x".into()
        }
        .is_retryable());
    }

    #[test]
    fn test_rate_limited_is_retryable() {
        // 429 maps to RateLimited before reaching Http
        assert!(AppError::RateLimited("comprar.gob.ar".into()).is_retryable());
    }

    #[test]
    fn test_record_level_errors() {
        assert!(AppError::YearOutOfRange(2019).is_record_level());
        assert!(AppError::MalformedPage("row without title cell".into()).is_record_level());
        assert!(!AppError::JobCancelled.is_record_level());
        assert!(!AppError::WriteFailure("chunk 3".into()).is_record_level());
    }

    #[test]
    fn test_error_from_serde() {
        let result: Result<serde_json::Value, _> = serde_json::from_str("{ invalid }");
        let app_err: AppError = result.unwrap_err().into();
        assert!(matches!(app_err, AppError::Serialization(_)));
    }

    #[test]
    fn test_user_message_circuit_open() {
        let msg = AppError::CircuitOpen("boletin.mendoza.gov.ar".into()).user_message();
        assert!(msg.contains("boletin.mendoza.gov.ar"));
        assert!(msg.contains("cooldown"));
    }
}
