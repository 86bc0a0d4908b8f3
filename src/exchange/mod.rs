//! Poloniex exchange integration.
//!
//! Every remote call goes through [`PoloniexClient::query`], which:
//! - Waits on the rolling-window [`RateLimiter`] (6 requests / second)
//! - Signs private commands with HMAC-SHA512 and a strictly increasing nonce
//! - Raises a typed [`ExchangeError`] for embedded errors, bad statuses
//!   and transport failures
//!
//! Host resolution is memoized per control-loop iteration by [`DnsCache`].

mod client;
mod dns;
mod error;
mod rate_limiter;
mod signer;
mod types;

pub use client::PoloniexClient;
pub use dns::DnsCache;
pub use error::{ErrorCategory, ExchangeError};
pub(crate) use error::is_malformed_transport;
pub use rate_limiter::{RateLimiter, DEFAULT_PERIOD_MS, DEFAULT_REQUESTS_PER_PERIOD};
pub use signer::{Credentials, NonceGenerator, RequestSigner, SignedRequest};
pub use types::*;
