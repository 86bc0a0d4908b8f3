//! Failure classification and backoff policy.
//!
//! Every failure that escapes an iteration is classified exactly once:
//! - Misconfiguration the exchange will keep rejecting (bad key, nonce
//!   reuse, IP filter) aborts the process with remediation text
//! - A request-rate ban sleeps out the ~130s ban window
//! - Everything else is logged and the loop resumes after its usual sleep

use crate::exchange::{is_malformed_transport, ErrorCategory, ExchangeError};
use serde::Serialize;
use std::time::Duration;

/// Observed length of a Poloniex IP ban.
pub const BAN_DURATION: Duration = Duration::from_secs(130);

/// Additive step applied to the market analysis period on a ban.
pub const ANALYSIS_PERIOD_STEP_MS: u64 = 1000;

/// Process exit code for fatal classifications.
pub const FATAL_EXIT_CODE: i32 = 1;

/// What went wrong, independent of how it was reported.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum FailureKind {
    /// Private command attempted without credentials configured
    FatalConfiguration,
    /// API key or secret rejected
    FatalAuth,
    /// Nonce ordering violated, usually a key shared between programs
    FatalNonce,
    /// Key lacks permission or IP filter rejected us
    FatalPermission,
    /// Socket timeout
    TransientTimeout,
    /// Truncated or undecodable response
    MalformedResponse,
    /// Request quota exceeded, IP banned for a while
    Banned,
    /// Resolution or connection failure
    Network,
    /// Exchange-reported error with no special handling (incl. gateway 5xx)
    Api,
    /// Anything not recognized above
    Unhandled,
}

impl FailureKind {
    /// Classify a failure caught at the loop boundary.
    ///
    /// Typed errors anywhere in the chain win. Untyped failures (e.g. from
    /// a plugin hook) go through the same [`ErrorCategory::from_message`]
    /// boundary so no policy code matches strings itself.
    pub fn classify(err: &anyhow::Error) -> Self {
        for cause in err.chain() {
            if let Some(e) = cause.downcast_ref::<ExchangeError>() {
                return Self::from_exchange_error(e);
            }
            if let Some(e) = cause.downcast_ref::<reqwest::Error>() {
                return Self::from_reqwest_error(e);
            }
            if let Some(e) = cause.downcast_ref::<std::io::Error>() {
                return if e.kind() == std::io::ErrorKind::TimedOut {
                    FailureKind::TransientTimeout
                } else {
                    FailureKind::Network
                };
            }
        }

        match ErrorCategory::from_message(&format!("{:#}", err)) {
            ErrorCategory::InvalidCredentials => FailureKind::FatalAuth,
            ErrorCategory::InvalidNonce => FailureKind::FatalNonce,
            ErrorCategory::PermissionDenied => FailureKind::FatalPermission,
            ErrorCategory::Timeout => FailureKind::TransientTimeout,
            ErrorCategory::RateLimited => FailureKind::Banned,
            ErrorCategory::Gateway => FailureKind::Api,
            ErrorCategory::Other => FailureKind::Unhandled,
        }
    }

    fn from_exchange_error(err: &ExchangeError) -> Self {
        match err {
            ExchangeError::Configuration(_) => FailureKind::FatalConfiguration,
            ExchangeError::Api { category, .. } => match category {
                ErrorCategory::InvalidCredentials => FailureKind::FatalAuth,
                ErrorCategory::InvalidNonce => FailureKind::FatalNonce,
                ErrorCategory::PermissionDenied => FailureKind::FatalPermission,
                ErrorCategory::Timeout => FailureKind::TransientTimeout,
                ErrorCategory::RateLimited => FailureKind::Banned,
                ErrorCategory::Gateway | ErrorCategory::Other => FailureKind::Api,
            },
            ExchangeError::Timeout { .. } => FailureKind::TransientTimeout,
            ExchangeError::Network { .. } => FailureKind::Network,
            ExchangeError::MalformedResponse { .. } => FailureKind::MalformedResponse,
        }
    }

    fn from_reqwest_error(err: &reqwest::Error) -> Self {
        if err.is_timeout() {
            FailureKind::TransientTimeout
        } else if is_malformed_transport(err) {
            FailureKind::MalformedResponse
        } else {
            FailureKind::Network
        }
    }

    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            FailureKind::FatalConfiguration
                | FailureKind::FatalAuth
                | FailureKind::FatalNonce
                | FailureKind::FatalPermission
        )
    }

    /// Operator guidance printed before a fatal exit.
    pub fn remediation(&self) -> Option<&'static str> {
        match self {
            FailureKind::FatalConfiguration => {
                Some("Set [api] api_key and secret in your config before starting the bot.")
            }
            FailureKind::FatalAuth => {
                Some("Are your API keys correct? No quotation. Just plain keys.")
            }
            FailureKind::FatalNonce => Some(
                "Are you reusing the API key in multiple applications? Use a unique key for every application.",
            ),
            FailureKind::FatalPermission => {
                Some("Are you using IP filter on the key? Maybe your IP changed?")
            }
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            FailureKind::FatalConfiguration => "fatal-configuration",
            FailureKind::FatalAuth => "fatal-auth",
            FailureKind::FatalNonce => "fatal-nonce",
            FailureKind::FatalPermission => "fatal-permission",
            FailureKind::TransientTimeout => "transient-timeout",
            FailureKind::MalformedResponse => "ignored",
            FailureKind::Banned => "banned",
            FailureKind::Network => "ignored-network",
            FailureKind::Api => "ignored-api",
            FailureKind::Unhandled => "unhandled",
        }
    }
}

/// What the loop does next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackoffAction {
    /// Resume after the standard inter-iteration sleep.
    Ignore,
    /// Resume after this total delay.
    Sleep(Duration),
    /// Stop the process with this exit code.
    AbortProcess { exit_code: i32 },
}

/// Outcome of classifying one failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffDecision {
    pub kind: FailureKind,
    pub action: BackoffAction,
    /// Additive widening for the market analysis polling period.
    pub analysis_period_delta_ms: Option<u64>,
    /// Forward a diagnostic to the notification sink.
    pub notify: bool,
}

/// Maps a [`FailureKind`] to a [`BackoffDecision`].
#[derive(Debug, Clone)]
pub struct BackoffPolicy {
    pub ban_duration: Duration,
    /// Widen the market analysis period during a ban (when it is running)
    pub widen_analysis_on_ban: bool,
    /// Forward unhandled failures to the operator
    pub notify_unhandled: bool,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            ban_duration: BAN_DURATION,
            widen_analysis_on_ban: true,
            notify_unhandled: false,
        }
    }
}

impl BackoffPolicy {
    /// Decide the action for `kind`.
    ///
    /// `standard` is the loop's current inter-iteration sleep.
    pub fn decide(
        &self,
        kind: FailureKind,
        standard: Duration,
        analysis_active: bool,
    ) -> BackoffDecision {
        let mut decision = BackoffDecision {
            kind,
            action: BackoffAction::Ignore,
            analysis_period_delta_ms: None,
            notify: false,
        };

        if kind.is_fatal() {
            decision.action = BackoffAction::AbortProcess {
                exit_code: FATAL_EXIT_CODE,
            };
            return decision;
        }

        match kind {
            FailureKind::Banned => {
                decision.action = BackoffAction::Sleep(self.ban_sleep(standard));
                if analysis_active && self.widen_analysis_on_ban {
                    decision.analysis_period_delta_ms = Some(ANALYSIS_PERIOD_STEP_MS);
                }
            }
            FailureKind::Unhandled => {
                decision.notify = self.notify_unhandled;
            }
            _ => {}
        }

        decision
    }

    /// `max(ban - standard, 0) + standard`: never shorter than the ban.
    pub fn ban_sleep(&self, standard: Duration) -> Duration {
        self.ban_duration.saturating_sub(standard) + standard
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;

    fn api_error(message: &str, status: u16) -> anyhow::Error {
        anyhow::Error::new(ExchangeError::api("returnBalances", message, Some(status)))
    }

    #[test]
    fn test_invalid_api_key_is_fatal_auth() {
        let kind = FailureKind::classify(&api_error("Invalid API key.", 200));
        assert_eq!(kind, FailureKind::FatalAuth);

        let decision = BackoffPolicy::default().decide(kind, Duration::from_secs(60), false);
        assert_eq!(decision.action, BackoffAction::AbortProcess { exit_code: 1 });
        assert!(kind.remediation().unwrap().contains("API keys"));
    }

    #[test]
    fn test_nonce_violation_is_fatal_nonce() {
        let err = api_error("Nonce must be greater than 1700000000000. You provided 1.", 200);
        assert_eq!(FailureKind::classify(&err), FailureKind::FatalNonce);
    }

    #[test]
    fn test_permission_denied_is_fatal_permission() {
        let err = api_error("Permission denied.", 403);
        assert_eq!(FailureKind::classify(&err), FailureKind::FatalPermission);
    }

    #[test]
    fn test_missing_credentials_is_fatal() {
        let err = anyhow::Error::new(ExchangeError::Configuration("no key".to_string()));
        let kind = FailureKind::classify(&err);
        assert_eq!(kind, FailureKind::FatalConfiguration);
        assert!(kind.is_fatal());
    }

    #[test]
    fn test_typed_error_found_behind_context() {
        let err = api_error("Invalid API key.", 200).context("Failed to lend BTC");
        assert_eq!(FailureKind::classify(&err), FailureKind::FatalAuth);
    }

    #[test]
    fn test_gateway_error_is_ignored() {
        let err = anyhow::Error::new(ExchangeError::Api {
            command: "returnTicker",
            message: "API Error 502: bad gateway".to_string(),
            status: Some(502),
            category: ErrorCategory::Gateway,
        });
        let kind = FailureKind::classify(&err);
        assert_eq!(kind, FailureKind::Api);

        let decision = BackoffPolicy::default().decide(kind, Duration::from_secs(60), true);
        assert_eq!(decision.action, BackoffAction::Ignore);
        assert!(!kind.is_fatal());
    }

    #[test]
    fn test_malformed_response_is_ignored() {
        let err = anyhow::Error::new(ExchangeError::MalformedResponse {
            command: "returnTicker",
            detail: "EOF while parsing".to_string(),
        });
        let kind = FailureKind::classify(&err);
        assert_eq!(kind, FailureKind::MalformedResponse);
        assert_eq!(
            BackoffPolicy::default()
                .decide(kind, Duration::from_secs(60), false)
                .action,
            BackoffAction::Ignore
        );
    }

    #[test]
    fn test_io_timeout_is_transient() {
        let err = anyhow::Error::new(std::io::Error::new(
            std::io::ErrorKind::TimedOut,
            "connect timed out",
        ));
        assert_eq!(FailureKind::classify(&err), FailureKind::TransientTimeout);
    }

    #[test]
    fn test_untyped_message_goes_through_category_boundary() {
        assert_eq!(
            FailureKind::classify(&anyhow!("socket read timed out")),
            FailureKind::TransientTimeout
        );
        assert_eq!(
            FailureKind::classify(&anyhow!("plugin exploded")),
            FailureKind::Unhandled
        );
    }

    #[test]
    fn test_ban_sleep_covers_ban_window() {
        let policy = BackoffPolicy::default();
        assert_eq!(policy.ban_sleep(Duration::from_secs(60)), Duration::from_secs(130));
        assert_eq!(policy.ban_sleep(Duration::from_secs(200)), Duration::from_secs(200));
        assert_eq!(policy.ban_sleep(Duration::from_secs(130)), Duration::from_secs(130));
    }

    #[test]
    fn test_ban_widens_analysis_only_when_active_and_enabled() {
        let policy = BackoffPolicy::default();
        let standard = Duration::from_secs(60);

        let active = policy.decide(FailureKind::Banned, standard, true);
        assert_eq!(active.action, BackoffAction::Sleep(Duration::from_secs(130)));
        assert_eq!(active.analysis_period_delta_ms, Some(ANALYSIS_PERIOD_STEP_MS));

        let inactive = policy.decide(FailureKind::Banned, standard, false);
        assert_eq!(inactive.analysis_period_delta_ms, None);

        let disabled = BackoffPolicy {
            widen_analysis_on_ban: false,
            ..BackoffPolicy::default()
        };
        assert_eq!(
            disabled
                .decide(FailureKind::Banned, standard, true)
                .analysis_period_delta_ms,
            None
        );
    }

    #[test]
    fn test_unhandled_notifies_when_configured() {
        let policy = BackoffPolicy {
            notify_unhandled: true,
            ..BackoffPolicy::default()
        };
        let decision = policy.decide(FailureKind::Unhandled, Duration::from_secs(60), false);
        assert!(decision.notify);
        assert_eq!(decision.action, BackoffAction::Ignore);
    }
}
