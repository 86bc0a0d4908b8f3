//! Typed failures raised by the Poloniex client.
//!
//! Remote error text is turned into an [`ErrorCategory`] exactly once, in
//! [`ErrorCategory::from_message`]. Nothing downstream inspects raw strings.

use thiserror::Error;

/// Coarse classification of a failure reported by the exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    /// API key or secret rejected.
    InvalidCredentials,
    /// Nonce not greater than the last one the exchange saw for this key.
    InvalidNonce,
    /// Key lacks permission or is IP-restricted.
    PermissionDenied,
    /// Socket timeout reported in the message text.
    Timeout,
    /// Request quota exceeded, IP temporarily banned.
    RateLimited,
    /// Cloudflare / upstream gateway failure (502, 520-526).
    Gateway,
    /// Anything else the exchange reported.
    Other,
}

impl ErrorCategory {
    /// Map untyped exchange text to a category.
    ///
    /// Poloniex exposes no structured error codes, so substring matching is
    /// the only signal available. Rules are checked in priority order.
    pub fn from_message(message: &str) -> Self {
        let lower = message.to_ascii_lowercase();

        if lower.contains("invalid api key") {
            ErrorCategory::InvalidCredentials
        } else if lower.contains("nonce must be greater") {
            ErrorCategory::InvalidNonce
        } else if lower.contains("permission denied") {
            ErrorCategory::PermissionDenied
        } else if lower.contains("timed out") {
            ErrorCategory::Timeout
        } else if lower.contains("error 429") || lower.contains("too many requests") {
            ErrorCategory::RateLimited
        } else if lower.contains("bad gateway") || lower.contains("gateway timeout") {
            ErrorCategory::Gateway
        } else {
            ErrorCategory::Other
        }
    }

    /// Short label for logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCategory::InvalidCredentials => "invalid-credentials",
            ErrorCategory::InvalidNonce => "invalid-nonce",
            ErrorCategory::PermissionDenied => "permission-denied",
            ErrorCategory::Timeout => "timeout",
            ErrorCategory::RateLimited => "rate-limited",
            ErrorCategory::Gateway => "gateway",
            ErrorCategory::Other => "other",
        }
    }
}

/// Failure of a single exchange request.
///
/// Every variant carries the command name so a log line is actionable
/// without ever including credentials.
#[derive(Debug, Error)]
pub enum ExchangeError {
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("{message} - requesting {command} (HTTP {status:?})")]
    Api {
        command: &'static str,
        message: String,
        status: Option<u16>,
        category: ErrorCategory,
    },

    #[error("request timed out - requesting {command}")]
    Timeout {
        command: &'static str,
        #[source]
        source: reqwest::Error,
    },

    #[error("network error - requesting {command}: {source}")]
    Network {
        command: &'static str,
        #[source]
        source: reqwest::Error,
    },

    #[error("malformed response - requesting {command}: {detail}")]
    MalformedResponse {
        command: &'static str,
        detail: String,
    },
}

impl ExchangeError {
    /// Build an application-level error from exchange-reported text.
    pub fn api(command: &'static str, message: impl Into<String>, status: Option<u16>) -> Self {
        let message = message.into();
        let category = ErrorCategory::from_message(&message);
        ExchangeError::Api {
            command,
            message,
            status,
            category,
        }
    }

    /// Category of this failure, if the exchange reported one.
    pub fn category(&self) -> Option<ErrorCategory> {
        match self {
            ExchangeError::Api { category, .. } => Some(*category),
            ExchangeError::Timeout { .. } => Some(ErrorCategory::Timeout),
            _ => None,
        }
    }
}

/// Whether a transport failure means the response itself was unusable:
/// an undecodable body, or a status line or headers hyper could not parse.
pub(crate) fn is_malformed_transport(err: &reqwest::Error) -> bool {
    if err.is_body() || err.is_decode() {
        return true;
    }
    let mut source = std::error::Error::source(err);
    while let Some(cause) = source {
        if let Some(e) = cause.downcast_ref::<hyper::Error>() {
            return e.is_parse();
        }
        source = cause.source();
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_category_from_message() {
        assert_eq!(
            ErrorCategory::from_message("Invalid API key/secret pair."),
            ErrorCategory::InvalidCredentials
        );
        assert_eq!(
            ErrorCategory::from_message("Nonce must be greater than 1500000000000. You provided 1."),
            ErrorCategory::InvalidNonce
        );
        assert_eq!(
            ErrorCategory::from_message("Permission denied."),
            ErrorCategory::PermissionDenied
        );
        assert_eq!(
            ErrorCategory::from_message("The read operation timed out"),
            ErrorCategory::Timeout
        );
        assert_eq!(
            ErrorCategory::from_message("Not enough BTC available to offer."),
            ErrorCategory::Other
        );
    }

    #[test]
    fn test_api_error_display_names_command() {
        let err = ExchangeError::api("createLoanOffer", "Invalid API key.", Some(200));
        assert_eq!(err.category(), Some(ErrorCategory::InvalidCredentials));
        assert!(err.to_string().contains("requesting createLoanOffer"));
    }
}
