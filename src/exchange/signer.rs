//! Request signing for private Poloniex commands.

use crate::exchange::error::ExchangeError;
use hmac::{Hmac, Mac};
use sha2::Sha512;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// API key and secret. Immutable for the process lifetime.
#[derive(Clone)]
pub struct Credentials {
    api_key: String,
    secret: String,
}

impl Credentials {
    pub fn new(api_key: impl Into<String>, secret: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            secret: secret.into(),
        }
    }

    pub fn api_key(&self) -> &str {
        &self.api_key
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("api_key", &"<redacted>")
            .field("secret", &"<redacted>")
            .finish()
    }
}

/// Strictly increasing nonce derived from wall-clock milliseconds.
///
/// Two calls in the same millisecond, or after the clock steps backwards,
/// still get distinct increasing values.
#[derive(Debug, Default)]
pub struct NonceGenerator {
    last: AtomicU64,
}

impl NonceGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate the next nonce.
    pub fn next(&self) -> u64 {
        let now = now_millis();
        let prev = self
            .last
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |prev| {
                Some(now.max(prev + 1))
            })
            .unwrap_or_else(|prev| prev);
        now.max(prev + 1)
    }
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Body and headers of a signed private request.
#[derive(Debug, Clone)]
pub struct SignedRequest {
    /// Url-encoded form body, including `command` and `nonce`.
    pub body: String,
    /// Value for the `Key` header.
    pub key: String,
    /// Value for the `Sign` header (hex HMAC-SHA512 of `body`).
    pub sign: String,
    pub nonce: u64,
}

/// Builds authenticated bodies for private commands.
#[derive(Debug)]
pub struct RequestSigner {
    credentials: Option<Credentials>,
    nonce: NonceGenerator,
}

impl RequestSigner {
    pub fn new(credentials: Option<Credentials>) -> Self {
        Self {
            credentials,
            nonce: NonceGenerator::new(),
        }
    }

    pub fn has_credentials(&self) -> bool {
        self.credentials.is_some()
    }

    /// Append `command` and a fresh nonce to `params`, encode and sign.
    pub fn sign(
        &self,
        command: &'static str,
        params: &[(&str, String)],
    ) -> Result<SignedRequest, ExchangeError> {
        let credentials = self.credentials.as_ref().ok_or_else(|| {
            ExchangeError::Configuration(format!(
                "{} requires an API key and secret but none are configured",
                command
            ))
        })?;

        let nonce = self.nonce.next();
        let nonce_str = nonce.to_string();
        let body = encode_form(
            params
                .iter()
                .map(|(k, v)| (*k, v.as_str()))
                .chain([("command", command), ("nonce", nonce_str.as_str())]),
        );
        let sign = Self::signature(&credentials.secret, &body);

        Ok(SignedRequest {
            body,
            key: credentials.api_key.clone(),
            sign,
            nonce,
        })
    }

    /// Hex HMAC-SHA512 of `body` keyed by `secret`.
    pub fn signature(secret: &str, body: &str) -> String {
        let mut mac = Hmac::<Sha512>::new_from_slice(secret.as_bytes())
            .expect("HMAC can take key of any size");
        mac.update(body.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }
}

/// Url-encode key/value pairs in order.
pub(crate) fn encode_form<'a>(pairs: impl IntoIterator<Item = (&'a str, &'a str)>) -> String {
    pairs
        .into_iter()
        .map(|(k, v)| format!("{}={}", urlencoding::encode(k), urlencoding::encode(v)))
        .collect::<Vec<_>>()
        .join("&")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Arc;

    #[test]
    fn test_signature_known_vector() {
        let sign = RequestSigner::signature(
            "secret",
            "currency=BTC&command=returnBalances&nonce=1700000000000",
        );
        assert_eq!(
            sign,
            "9b7313c5e9d1908d33405b50c30fc029d72406fed030c07e47365cec342de67f\
             a5bd7be0f475c160f4c9c632ec940fff0e2417b644789912ec6df4d56c95ace5"
        );
    }

    #[test]
    fn test_signature_is_deterministic() {
        let body = "currency=ETH&amount=1.5&command=createLoanOffer&nonce=42";
        assert_eq!(
            RequestSigner::signature("s3cr3t", body),
            RequestSigner::signature("s3cr3t", body)
        );
        assert_ne!(
            RequestSigner::signature("s3cr3t", body),
            RequestSigner::signature("other", body)
        );
    }

    #[test]
    fn test_sign_appends_command_and_nonce() {
        let signer = RequestSigner::new(Some(Credentials::new("my-key", "my-secret")));
        let signed = signer
            .sign("returnAvailableAccountBalances", &[("account", "lending".to_string())])
            .unwrap();

        let expected_prefix = "account=lending&command=returnAvailableAccountBalances&nonce=";
        assert!(signed.body.starts_with(expected_prefix));
        assert_eq!(signed.body, format!("{}{}", expected_prefix, signed.nonce));
        assert_eq!(signed.key, "my-key");
        assert_eq!(signed.sign, RequestSigner::signature("my-secret", &signed.body));
    }

    #[test]
    fn test_sign_without_credentials_is_configuration_error() {
        let signer = RequestSigner::new(None);
        let err = signer.sign("returnBalances", &[]).unwrap_err();
        assert!(matches!(err, ExchangeError::Configuration(_)));
    }

    #[test]
    fn test_nonce_strictly_increasing_within_same_millisecond() {
        let generator = NonceGenerator::new();
        let mut last = 0;
        for _ in 0..10_000 {
            let nonce = generator.next();
            assert!(nonce > last, "{} not greater than {}", nonce, last);
            last = nonce;
        }
    }

    #[test]
    fn test_nonce_survives_clock_behind_last_value() {
        let generator = NonceGenerator::new();
        // Simulate a previous nonce far in the future (clock rolled back since).
        let future = now_millis() + 60_000;
        generator.last.store(future, Ordering::SeqCst);
        assert_eq!(generator.next(), future + 1);
        assert_eq!(generator.next(), future + 2);
    }

    #[test]
    fn test_nonce_unique_across_threads() {
        let generator = Arc::new(NonceGenerator::new());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let generator = generator.clone();
                std::thread::spawn(move || (0..1000).map(|_| generator.next()).collect::<Vec<_>>())
            })
            .collect();

        let mut seen = HashSet::new();
        for handle in handles {
            for nonce in handle.join().unwrap() {
                assert!(seen.insert(nonce), "duplicate nonce {}", nonce);
            }
        }
        assert_eq!(seen.len(), 8000);
    }

    #[test]
    fn test_credentials_debug_is_redacted() {
        let creds = Credentials::new("visible-key", "visible-secret");
        let rendered = format!("{:?}", creds);
        assert!(!rendered.contains("visible-key"));
        assert!(!rendered.contains("visible-secret"));
    }
}
