use std::sync::OnceLock;

use regex::Regex;
use thiserror::Error;

pub type TradingResult<T> = std::result::Result<T, TradingError>;

/// Structured key/value context attached to an error.
///
/// Values whose key looks secret-bearing (key, secret, password, token,
/// private, pem, credential) are redacted when the context is displayed,
/// so private key material can never leak through an error message.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ErrorContext(pub Vec<(String, String)>);

impl ErrorContext {
    pub fn new() -> Self {
        ErrorContext(Vec::new())
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.0.push((key.into(), value.into()));
        self
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl std::fmt::Display for ErrorContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.0.is_empty() {
            return Ok(());
        }
        write!(f, " | context={{")?;
        for (i, (key, value)) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            if is_secret_key(key) {
                write!(f, "{}=[REDACTED]", key)?;
            } else {
                write!(f, "{}={}", key, value)?;
            }
        }
        write!(f, "}}")
    }
}

/// Closed error taxonomy for the trading decision path.
///
/// Risk blocks are deliberately NOT part of this sum; the risk manager
/// reports them as a structured verdict, not a failure.
#[derive(Debug, Error)]
pub enum TradingError {
    /// Invalid parameters: probability out of range, sigma <= 0, bad price,
    /// empty ticker. Always the caller's fault; surfaced up.
    #[error("invalid input: {0}")]
    Input(String),

    /// Predictions too old or a required cached price is missing. The
    /// scanner swallows this locally (returns no signals) and logs it.
    #[error("stale data: {0}")]
    StaleData(String),

    /// The exchange refused the order.
    #[error("order rejected: {message}{context}")]
    OrderRejected {
        message: String,
        context: ErrorContext,
    },

    /// Credentials invalid or unusable.
    #[error("authentication failed: {message}{context}")]
    AuthFailure {
        message: String,
        context: ErrorContext,
    },

    /// The exchange returned 429.
    #[error("rate limited by exchange (retry after: {})", .retry_after.as_deref().unwrap_or("unknown"))]
    RateLimited { retry_after: Option<String> },

    /// Any other non-2xx exchange response.
    #[error("exchange API error ({status}): {message}")]
    Api { status: u16, message: String },

    /// Network failure or timeout.
    #[error("connection failure: {0}")]
    Connection(String),

    /// A backtest found no matching predictions.
    #[error("insufficient data: {0}")]
    InsufficientData(String),

    /// Database or cache failure underneath a decision-path operation.
    #[error("storage failure: {0}")]
    Storage(String),
}

impl TradingError {
    pub fn input(message: impl Into<String>) -> Self {
        TradingError::Input(message.into())
    }

    pub fn stale(message: impl Into<String>) -> Self {
        TradingError::StaleData(message.into())
    }

    pub fn connection(message: impl std::fmt::Display) -> Self {
        TradingError::Connection(message.to_string())
    }

    pub fn storage(message: impl std::fmt::Display) -> Self {
        TradingError::Storage(message.to_string())
    }

    /// Stable HTTP status for each kind, used by the (external) API layer.
    pub fn http_status(&self) -> u16 {
        match self {
            TradingError::Input(_) => 400,
            TradingError::StaleData(_) => 422,
            TradingError::OrderRejected { .. } => 400,
            TradingError::AuthFailure { .. } => 401,
            TradingError::RateLimited { .. } => 429,
            TradingError::Api { .. } => 502,
            TradingError::Connection(_) => 502,
            TradingError::InsufficientData(_) => 422,
            TradingError::Storage(_) => 502,
        }
    }
}

/// Whether a key name suggests its value is secret material.
pub fn is_secret_key(key: &str) -> bool {
    const SECRET_WORDS: [&str; 7] = [
        "key",
        "secret",
        "password",
        "token",
        "private",
        "pem",
        "credential",
    ];
    let lower = key.to_lowercase();
    SECRET_WORDS.iter().any(|word| lower.contains(word))
}

fn secret_value_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r#"(?i)"([^"]*(?:key|secret|password|token|private|pem|credential)[^"]*)":\s*"([^"]*)""#,
        )
        .unwrap()
    })
}

/// Redact values of secret-looking keys inside a JSON-ish string.
///
/// Applied before raw payloads (subscription frames, order bodies, error
/// bodies) are handed to the logger.
pub fn redact(text: &str) -> String {
    secret_value_re()
        .replace_all(text, r#""$1": "[REDACTED]""#)
        .into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_context_redacts_secret_keys() {
        let err = TradingError::AuthFailure {
            message: "bad signature".to_string(),
            context: ErrorContext::new()
                .with("path", "/portfolio/balance")
                .with("api_key_id", "abc123secret"),
        };
        let text = err.to_string();
        assert!(text.contains("path=/portfolio/balance"));
        assert!(text.contains("api_key_id=[REDACTED]"));
        assert!(!text.contains("abc123secret"));
    }

    #[test]
    fn test_error_context_redacts_all_secret_words() {
        for key in [
            "api_key",
            "client_secret",
            "db_password",
            "auth_token",
            "private_key",
            "pem_data",
            "user_credential",
        ] {
            let err = TradingError::OrderRejected {
                message: "nope".to_string(),
                context: ErrorContext::new().with(key, "sensitive-value"),
            };
            let text = err.to_string();
            assert!(!text.contains("sensitive-value"), "leaked via key '{}'", key);
        }
    }

    #[test]
    fn test_empty_context_renders_nothing() {
        let err = TradingError::OrderRejected {
            message: "market closed".to_string(),
            context: ErrorContext::new(),
        };
        assert_eq!(err.to_string(), "order rejected: market closed");
    }

    #[test]
    fn test_redact_json_string() {
        let raw = r#"{"ticker": "KXHIGHNY-26FEB18-B3", "access_key": "abc", "PrivateKeyPem": "-----BEGIN"}"#;
        let redacted = redact(raw);
        assert!(redacted.contains(r#""ticker": "KXHIGHNY-26FEB18-B3""#));
        assert!(redacted.contains(r#""access_key": "[REDACTED]""#));
        assert!(redacted.contains(r#""PrivateKeyPem": "[REDACTED]""#));
        assert!(!redacted.contains("abc"));
        assert!(!redacted.contains("BEGIN"));
    }

    #[test]
    fn test_redact_leaves_plain_text_alone() {
        let raw = r#"{"city": "NYC", "price": "22"}"#;
        assert_eq!(redact(raw), raw);
    }

    #[test]
    fn test_http_status_mapping() {
        assert_eq!(TradingError::input("x").http_status(), 400);
        assert_eq!(
            TradingError::AuthFailure {
                message: "x".into(),
                context: ErrorContext::new()
            }
            .http_status(),
            401
        );
        assert_eq!(
            TradingError::RateLimited { retry_after: None }.http_status(),
            429
        );
        assert_eq!(
            TradingError::InsufficientData("x".into()).http_status(),
            422
        );
        assert_eq!(
            TradingError::Api {
                status: 503,
                message: "x".into()
            }
            .http_status(),
            502
        );
    }

    #[test]
    fn test_rate_limited_display_includes_retry_after() {
        let err = TradingError::RateLimited {
            retry_after: Some("30".to_string()),
        };
        assert!(err.to_string().contains("30"));
    }
}
