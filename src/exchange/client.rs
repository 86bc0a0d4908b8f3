//! Poloniex REST API client.

use crate::config::ApiConfig;
use crate::exchange::dns::DnsCache;
use crate::exchange::error::{is_malformed_transport, ErrorCategory, ExchangeError};
use crate::exchange::rate_limiter::RateLimiter;
use crate::exchange::signer::{Credentials, RequestSigner};
use crate::exchange::types::*;
use anyhow::{Context, Result};
use reqwest::header::CONTENT_TYPE;
use reqwest::{Client, StatusCode};
use rust_decimal::Decimal;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, instrument, warn};

/// Additive period step applied when the exchange answers HTTP 429.
const BAN_PERIOD_STEP_MS: u64 = 250;

/// Poloniex API client shared by the lending engine, market analysis and
/// plugins.
///
/// Quota check, nonce allocation, signing and the HTTP round-trip all run
/// under one lock, so concurrent callers can never interleave nonces or
/// overrun the request window.
pub struct PoloniexClient {
    http: Client,
    public_url: String,
    trading_url: String,
    signer: RequestSigner,
    rate_limiter: RateLimiter,
    dispatch: Mutex<()>,
    api_debug_log: bool,
}

impl PoloniexClient {
    /// Create a new client from configuration.
    ///
    /// Missing credentials are allowed here; private commands then fail
    /// with [`ExchangeError::Configuration`].
    pub fn new(
        config: &ApiConfig,
        timeout: Duration,
        dns: DnsCache,
        api_debug_log: bool,
    ) -> Result<Self> {
        let http = Client::builder()
            .timeout(timeout)
            .dns_resolver(Arc::new(dns))
            .build()
            .context("Failed to create HTTP client")?;

        let credentials = if config.api_key.is_empty() || config.secret.is_empty() {
            None
        } else {
            Some(Credentials::new(&config.api_key, &config.secret))
        };

        Ok(Self {
            http,
            public_url: config.public_url.clone(),
            trading_url: config.trading_url.clone(),
            signer: RequestSigner::new(credentials),
            rate_limiter: RateLimiter::new(config.requests_per_period, config.request_period_ms),
            dispatch: Mutex::new(()),
            api_debug_log,
        })
    }

    pub fn rate_limiter(&self) -> &RateLimiter {
        &self.rate_limiter
    }

    pub fn has_credentials(&self) -> bool {
        self.signer.has_credentials()
    }

    /// Send one command and return the decoded JSON body.
    ///
    /// Public commands go out as GET with query parameters, private ones as
    /// a signed form POST. A body carrying an `error` key is a failure even
    /// with HTTP 200.
    #[instrument(skip(self, params))]
    pub async fn query(&self, command: Command, params: &[(&str, String)]) -> Result<Value, ExchangeError> {
        let _guard = self.dispatch.lock().await;
        self.rate_limiter.acquire().await;

        let request = if command.is_public() {
            let mut query: Vec<(&str, String)> = vec![("command", command.wire_name().to_string())];
            query.extend(params.iter().map(|(k, v)| (*k, v.clone())));
            self.http.get(&self.public_url).query(&query)
        } else {
            let signed = self.signer.sign(command.wire_name(), params)?;
            if self.api_debug_log {
                debug!(nonce = signed.nonce, "Dispatching private command");
            }
            self.http
                .post(&self.trading_url)
                .header("Key", signed.key)
                .header("Sign", signed.sign)
                .header(CONTENT_TYPE, "application/x-www-form-urlencoded")
                .body(signed.body)
        };

        if self.api_debug_log {
            debug!(public = command.is_public(), "Sending request");
        }

        let response = request
            .send()
            .await
            .map_err(|e| transport_error(command, e))?;
        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| transport_error(command, e))?;

        self.handle_response(command, status, &body)
    }

    /// Turn a raw HTTP status and body into a value or a typed failure.
    fn handle_response(
        &self,
        command: Command,
        status: StatusCode,
        body: &str,
    ) -> Result<Value, ExchangeError> {
        let name = command.as_str();

        if status.is_success() {
            let value: Value = serde_json::from_str(body).map_err(|e| {
                ExchangeError::MalformedResponse {
                    command: name,
                    detail: e.to_string(),
                }
            })?;

            if let Some(message) = embedded_error(&value) {
                return Err(ExchangeError::api(name, message, Some(status.as_u16())));
            }

            self.rate_limiter.record_clean_response();
            return Ok(value);
        }

        let code = status.as_u16();
        if code == 429 {
            let period = self.rate_limiter.increase_period(BAN_PERIOD_STEP_MS);
            warn!(command = name, period_ms = period, "Exchange reports too many requests");
        }

        let parsed = serde_json::from_str::<Value>(body)
            .ok()
            .as_ref()
            .and_then(embedded_error);

        Err(match (parsed, code) {
            (_, 429) => ExchangeError::Api {
                command: name,
                message: parsed_or(body, "Error 429: too many requests"),
                status: Some(code),
                category: ErrorCategory::RateLimited,
            },
            (Some(message), _) => ExchangeError::api(name, message, Some(code)),
            (None, 502 | 520..=526) => ExchangeError::Api {
                command: name,
                message: format!(
                    "API Error {}: The web server reported a bad gateway or gateway timeout error.",
                    code
                ),
                status: Some(code),
                category: ErrorCategory::Gateway,
            },
            (None, _) => ExchangeError::api(name, body.trim(), Some(code)),
        })
    }

    async fn query_as<T>(&self, command: Command, params: &[(&str, String)]) -> Result<T, ExchangeError>
    where
        T: Default + DeserializeOwned,
    {
        let value = self.query(command, params).await?;
        decode_lenient(value).map_err(|e| ExchangeError::MalformedResponse {
            command: command.as_str(),
            detail: e.to_string(),
        })
    }

    // ==================== Market Data (Public) ====================

    pub async fn return_ticker(&self) -> Result<HashMap<String, Ticker>, ExchangeError> {
        self.query_as(Command::ReturnTicker, &[]).await
    }

    pub async fn return_24h_volume(&self) -> Result<Value, ExchangeError> {
        self.query(Command::Return24hVolume, &[]).await
    }

    pub async fn return_order_book(&self, currency_pair: &str) -> Result<Value, ExchangeError> {
        self.query(
            Command::ReturnOrderBook,
            &[("currencyPair", currency_pair.to_string())],
        )
        .await
    }

    pub async fn return_market_trade_history(&self, currency_pair: &str) -> Result<Value, ExchangeError> {
        self.query(
            Command::ReturnMarketTradeHistory,
            &[("currencyPair", currency_pair.to_string())],
        )
        .await
    }

    /// Loan order book for `currency`. `limit` of 0 uses the exchange default.
    pub async fn return_loan_orders(&self, currency: &str, limit: u32) -> Result<LoanOrders, ExchangeError> {
        let mut params = vec![("currency", currency.to_string())];
        if limit > 0 {
            params.push(("limit", limit.to_string()));
        }
        self.query_as(Command::ReturnLoanOrders, &params).await
    }

    // ==================== Account (Authenticated) ====================

    pub async fn return_balances(&self) -> Result<Balances, ExchangeError> {
        self.query_as(Command::ReturnBalances, &[]).await
    }

    pub async fn return_available_account_balances(
        &self,
        account: Option<Account>,
    ) -> Result<AccountBalances, ExchangeError> {
        let params: Vec<(&str, String)> = account
            .map(|a| vec![("account", a.as_str().to_string())])
            .unwrap_or_default();
        self.query_as(Command::ReturnAvailableAccountBalances, &params)
            .await
    }

    pub async fn return_open_loan_offers(&self) -> Result<OpenLoanOffers, ExchangeError> {
        self.query_as(Command::ReturnOpenLoanOffers, &[]).await
    }

    pub async fn return_active_loans(&self) -> Result<ActiveLoans, ExchangeError> {
        self.query_as(Command::ReturnActiveLoans, &[]).await
    }

    pub async fn return_lending_history(
        &self,
        start: i64,
        end: i64,
        limit: u32,
    ) -> Result<Vec<LendingHistoryEntry>, ExchangeError> {
        self.query_as(
            Command::ReturnLendingHistory,
            &[
                ("start", start.to_string()),
                ("end", end.to_string()),
                ("limit", limit.to_string()),
            ],
        )
        .await
    }

    // ==================== Lending (Authenticated) ====================

    pub async fn transfer_balance(
        &self,
        currency: &str,
        amount: Decimal,
        from: Account,
        to: Account,
    ) -> Result<CommandAck, ExchangeError> {
        self.query_as(
            Command::TransferBalance,
            &[
                ("currency", currency.to_string()),
                ("amount", amount.normalize().to_string()),
                ("fromAccount", from.as_str().to_string()),
                ("toAccount", to.as_str().to_string()),
            ],
        )
        .await
    }

    pub async fn create_loan_offer(
        &self,
        currency: &str,
        amount: Decimal,
        duration_days: u32,
        auto_renew: bool,
        lending_rate: Decimal,
    ) -> Result<CommandAck, ExchangeError> {
        self.query_as(
            Command::CreateLoanOffer,
            &[
                ("currency", currency.to_string()),
                ("amount", amount.normalize().to_string()),
                ("duration", duration_days.to_string()),
                ("autoRenew", u8::from(auto_renew).to_string()),
                ("lendingRate", lending_rate.normalize().to_string()),
            ],
        )
        .await
    }

    pub async fn cancel_loan_offer(&self, currency: &str, order_number: u64) -> Result<CommandAck, ExchangeError> {
        self.query_as(
            Command::CancelLoanOffer,
            &[
                ("currency", currency.to_string()),
                ("orderNumber", order_number.to_string()),
            ],
        )
        .await
    }

    pub async fn toggle_auto_renew(&self, order_number: u64) -> Result<CommandAck, ExchangeError> {
        self.query_as(
            Command::ToggleAutoRenew,
            &[("orderNumber", order_number.to_string())],
        )
        .await
    }
}

fn embedded_error(value: &Value) -> Option<String> {
    match value.get("error")? {
        Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}

fn parsed_or(body: &str, fallback: &str) -> String {
    serde_json::from_str::<Value>(body)
        .ok()
        .as_ref()
        .and_then(embedded_error)
        .unwrap_or_else(|| fallback.to_string())
}

/// Wrap a transport failure with the command name. The URL is stripped so
/// query strings never reach a log line.
fn transport_error(command: Command, err: reqwest::Error) -> ExchangeError {
    let err = err.without_url();
    let name = command.as_str();
    if err.is_timeout() {
        ExchangeError::Timeout {
            command: name,
            source: err,
        }
    } else if is_malformed_transport(&err) {
        ExchangeError::MalformedResponse {
            command: name,
            detail: err.to_string(),
        }
    } else {
        ExchangeError::Network {
            command: name,
            source: err,
        }
    }
}
