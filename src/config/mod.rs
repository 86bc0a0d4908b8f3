//! Configuration management for the lending bot.
//!
//! Loads settings from a TOML file and `LENDINGBOT__*` environment variables.

use anyhow::{Context, Result};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt::Display;
use tracing::warn;

/// Main application configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Exchange endpoint and credentials
    #[serde(default)]
    pub api: ApiConfig,
    /// Control loop settings
    #[serde(default)]
    pub bot: BotConfig,
    /// Lending policy
    #[serde(default)]
    pub lending: LendingConfig,
    /// Optional market analysis sampler
    #[serde(default)]
    pub market_analysis: MarketAnalysisConfig,
    /// Rates plugin
    #[serde(default)]
    pub rates: RatesConfig,
    /// Operator notifications
    #[serde(default)]
    pub notifications: NotificationConfig,
}

#[derive(Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    /// API key for authentication
    #[serde(default)]
    pub api_key: String,
    /// Secret for signing requests
    #[serde(default)]
    pub secret: String,
    #[serde(default = "default_exchange")]
    pub exchange: String,
    #[serde(default = "default_public_url")]
    pub public_url: String,
    #[serde(default = "default_trading_url")]
    pub trading_url: String,
    /// Requests allowed per rolling window
    #[serde(default = "default_requests_per_period")]
    pub requests_per_period: usize,
    /// Rolling window length in milliseconds
    #[serde(default = "default_request_period_ms")]
    pub request_period_ms: u64,
}

impl std::fmt::Debug for ApiConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApiConfig")
            .field("api_key", &"<redacted>")
            .field("secret", &"<redacted>")
            .field("exchange", &self.exchange)
            .field("public_url", &self.public_url)
            .field("trading_url", &self.trading_url)
            .field("requests_per_period", &self.requests_per_period)
            .field("request_period_ms", &self.request_period_ms)
            .finish()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BotConfig {
    #[serde(default = "default_label")]
    pub label: String,
    /// Sleep between iterations while funds are lent or offered
    #[serde(default = "default_sleep_time_active")]
    pub sleep_time_active_secs: u64,
    /// Sleep between iterations while nothing is lent
    #[serde(default = "default_sleep_time_inactive")]
    pub sleep_time_inactive_secs: u64,
    /// Socket timeout for every request (1-180)
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,
    /// Log every dispatched command
    #[serde(default)]
    pub api_debug_log: bool,
    /// Currency totals are reported in
    #[serde(default = "default_output_currency")]
    pub output_currency: String,
    /// Names of plugins to enable
    #[serde(default)]
    pub plugins: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LendingConfig {
    /// Currencies to lend
    #[serde(default = "default_currencies")]
    pub currencies: Vec<String>,
    /// Currencies moved from the exchange account into lending
    #[serde(default)]
    pub transferable_currencies: Vec<String>,
    /// Lowest daily rate we accept (0.0001 = 0.01%)
    #[serde(default = "default_min_daily_rate")]
    pub min_daily_rate: Decimal,
    /// Highest daily rate we ask
    #[serde(default = "default_max_daily_rate")]
    pub max_daily_rate: Decimal,
    /// Smallest offer the exchange accepts
    #[serde(default = "default_min_loan_size")]
    pub min_loan_size: Decimal,
    /// Offer duration in days (2-60)
    #[serde(default = "default_duration_days")]
    pub duration_days: u32,
    #[serde(default)]
    pub auto_renew: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarketAnalysisConfig {
    /// Currencies to sample; empty disables the subsystem
    #[serde(default)]
    pub currencies: Vec<String>,
    /// Polling period between samples
    #[serde(default = "default_analysis_interval")]
    pub update_interval_secs: u64,
    /// Widen the sampling period when the IP gets banned
    #[serde(default = "default_true")]
    pub widen_on_ban: bool,
    /// Samples kept per currency
    #[serde(default = "default_sample_limit")]
    pub sample_limit: usize,
    #[serde(default)]
    pub debug_log: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RatesConfig {
    #[serde(default = "default_rates_currencies")]
    pub currencies: Vec<String>,
    #[serde(default = "default_keep_days")]
    pub keep_days: i64,
    #[serde(default = "default_rates_interval")]
    pub interval_secs: u64,
    /// Cumulative offer depth for the bottom sample
    #[serde(default = "default_gap_bottom")]
    pub gap_bottom: Decimal,
    /// Cumulative offer depth for the top sample
    #[serde(default = "default_gap_top")]
    pub gap_top: Decimal,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NotificationConfig {
    /// Forward unhandled errors to the notifier
    #[serde(default)]
    pub notify_caught_exception: bool,
    /// Prefix prepended to every notification
    #[serde(default)]
    pub prefix: Option<String>,
}

// Default value functions
fn default_exchange() -> String {
    "POLONIEX".to_string()
}

fn default_public_url() -> String {
    "https://poloniex.com/public".to_string()
}

fn default_trading_url() -> String {
    "https://poloniex.com/tradingApi".to_string()
}

fn default_requests_per_period() -> usize {
    6
}

fn default_request_period_ms() -> u64 {
    1000
}

fn default_label() -> String {
    "Lending Bot".to_string()
}

fn default_sleep_time_active() -> u64 {
    60
}

fn default_sleep_time_inactive() -> u64 {
    300
}

fn default_timeout() -> u64 {
    30
}

fn default_output_currency() -> String {
    "BTC".to_string()
}

fn default_currencies() -> Vec<String> {
    vec!["BTC".to_string()]
}

fn default_min_daily_rate() -> Decimal {
    Decimal::new(5, 5) // 0.00005 (0.005% daily)
}

fn default_max_daily_rate() -> Decimal {
    Decimal::new(5, 2) // 0.05 (5% daily, exchange cap)
}

fn default_min_loan_size() -> Decimal {
    Decimal::new(1, 2) // 0.01
}

fn default_duration_days() -> u32 {
    2
}

fn default_analysis_interval() -> u64 {
    10
}

fn default_true() -> bool {
    true
}

fn default_sample_limit() -> usize {
    100
}

fn default_rates_currencies() -> Vec<String> {
    vec!["BTC".to_string()]
}

fn default_keep_days() -> i64 {
    10
}

fn default_rates_interval() -> u64 {
    600
}

fn default_gap_bottom() -> Decimal {
    Decimal::new(40, 0)
}

fn default_gap_top() -> Decimal {
    Decimal::new(200, 0)
}

/// Clamp `value` into `[lower, upper]`, warning when it had to move.
pub fn bounded<T>(name: &str, value: T, lower: T, upper: T) -> T
where
    T: PartialOrd + Display + Copy,
{
    if value < lower {
        warn!(
            "{}'s value: '{}' is below the minimum limit: {}, which will be used instead.",
            name, value, lower
        );
        lower
    } else if value > upper {
        warn!(
            "{}'s value: '{}' is above the maximum limit: {}, which will be used instead.",
            name, value, upper
        );
        upper
    } else {
        value
    }
}

impl Config {
    /// Load configuration from a config file and environment variables.
    pub fn load(path: Option<&str>) -> Result<Self> {
        dotenvy::dotenv().ok();

        let file = match path {
            Some(path) => config::File::with_name(path).required(true),
            None => config::File::with_name("default").required(false),
        };

        let config = config::Config::builder()
            .add_source(file)
            .add_source(
                config::Environment::with_prefix("LENDINGBOT")
                    .separator("__")
                    .list_separator(",")
                    .with_list_parse_key("bot.plugins")
                    .with_list_parse_key("lending.currencies")
                    .with_list_parse_key("lending.transferable_currencies")
                    .with_list_parse_key("market_analysis.currencies")
                    .with_list_parse_key("rates.currencies")
                    .try_parsing(true),
            )
            .build()
            .context("Failed to build configuration")?;

        let mut config: Config = config
            .try_deserialize()
            .context("Failed to deserialize configuration")?;
        config.normalize();
        Ok(config)
    }

    /// Clamp bounded values into their allowed ranges.
    pub fn normalize(&mut self) {
        self.bot.timeout_secs = bounded("[bot]-timeout_secs", self.bot.timeout_secs, 1, 180);
        self.bot.sleep_time_active_secs = bounded(
            "[bot]-sleep_time_active_secs",
            self.bot.sleep_time_active_secs,
            1,
            3600,
        );
        self.bot.sleep_time_inactive_secs = bounded(
            "[bot]-sleep_time_inactive_secs",
            self.bot.sleep_time_inactive_secs,
            1,
            3600,
        );
        self.lending.duration_days =
            bounded("[lending]-duration_days", self.lending.duration_days, 2, 60);
        self.lending.min_loan_size = bounded(
            "[lending]-min_loan_size",
            self.lending.min_loan_size,
            Decimal::new(1, 2),
            Decimal::MAX,
        );
        self.lending.max_daily_rate = bounded(
            "[lending]-max_daily_rate",
            self.lending.max_daily_rate,
            Decimal::ZERO,
            Decimal::new(5, 2),
        );
        self.api.requests_per_period =
            bounded("[api]-requests_per_period", self.api.requests_per_period, 1, 6);
        self.market_analysis.update_interval_secs = bounded(
            "[market_analysis]-update_interval_secs",
            self.market_analysis.update_interval_secs,
            1,
            3600,
        );
        self.rates.keep_days = bounded("[rates]-keep_days", self.rates.keep_days, 1, 3650);
        self.currencies_to_upper();
    }

    fn currencies_to_upper(&mut self) {
        for list in [
            &mut self.lending.currencies,
            &mut self.lending.transferable_currencies,
            &mut self.market_analysis.currencies,
            &mut self.rates.currencies,
        ] {
            for cur in list.iter_mut() {
                *cur = cur.trim().to_uppercase();
            }
            list.retain(|c| !c.is_empty());
        }
        self.bot.output_currency = self.bot.output_currency.trim().to_uppercase();
    }

    /// Validate configuration values.
    pub fn validate(&self) -> Result<()> {
        anyhow::ensure!(
            !self.api.api_key.trim().is_empty(),
            "[api]-api_key is not allowed to be left unset. Please check your config."
        );

        anyhow::ensure!(
            !self.api.secret.trim().is_empty(),
            "[api]-secret is not allowed to be left unset. Please check your config."
        );

        anyhow::ensure!(
            self.api.exchange.eq_ignore_ascii_case("POLONIEX"),
            "Unsupported exchange '{}'; only POLONIEX is available",
            self.api.exchange
        );

        anyhow::ensure!(
            self.lending.min_daily_rate > Decimal::ZERO
                && self.lending.min_daily_rate <= self.lending.max_daily_rate,
            "min_daily_rate must be > 0 and <= max_daily_rate"
        );

        Ok(())
    }

    /// Whether the market analysis sampler should run.
    pub fn market_analysis_enabled(&self) -> bool {
        !self.market_analysis.currencies.is_empty()
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            secret: String::new(),
            exchange: default_exchange(),
            public_url: default_public_url(),
            trading_url: default_trading_url(),
            requests_per_period: default_requests_per_period(),
            request_period_ms: default_request_period_ms(),
        }
    }
}

impl Default for BotConfig {
    fn default() -> Self {
        Self {
            label: default_label(),
            sleep_time_active_secs: default_sleep_time_active(),
            sleep_time_inactive_secs: default_sleep_time_inactive(),
            timeout_secs: default_timeout(),
            api_debug_log: false,
            output_currency: default_output_currency(),
            plugins: Vec::new(),
        }
    }
}

impl Default for LendingConfig {
    fn default() -> Self {
        Self {
            currencies: default_currencies(),
            transferable_currencies: Vec::new(),
            min_daily_rate: default_min_daily_rate(),
            max_daily_rate: default_max_daily_rate(),
            min_loan_size: default_min_loan_size(),
            duration_days: default_duration_days(),
            auto_renew: false,
        }
    }
}

impl Default for MarketAnalysisConfig {
    fn default() -> Self {
        Self {
            currencies: Vec::new(),
            update_interval_secs: default_analysis_interval(),
            widen_on_ban: true,
            sample_limit: default_sample_limit(),
            debug_log: false,
        }
    }
}

impl Default for RatesConfig {
    fn default() -> Self {
        Self {
            currencies: default_rates_currencies(),
            keep_days: default_keep_days(),
            interval_secs: default_rates_interval(),
            gap_bottom: default_gap_bottom(),
            gap_top: default_gap_top(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn config_with_keys() -> Config {
        let mut config = Config::default();
        config.api.api_key = "k3y-value".to_string();
        config.api.secret = "s3cr3t-value".to_string();
        config
    }

    #[test]
    fn test_default_config_with_keys_is_valid() {
        assert!(config_with_keys().validate().is_ok());
    }

    #[test]
    fn test_missing_credentials_rejected() {
        let err = Config::default().validate().unwrap_err();
        assert!(err.to_string().contains("api_key"));
    }

    #[test]
    fn test_bounded_clamps_and_passes_through() {
        assert_eq!(bounded("t", 500u64, 1, 180), 180);
        assert_eq!(bounded("t", 0u64, 1, 180), 1);
        assert_eq!(bounded("t", 30u64, 1, 180), 30);
        assert_eq!(bounded("r", dec!(0.2), dec!(0), dec!(0.05)), dec!(0.05));
    }

    #[test]
    fn test_normalize_clamps_timeout_and_uppercases() {
        let mut config = config_with_keys();
        config.bot.timeout_secs = 900;
        config.lending.currencies = vec![" btc".to_string(), "".to_string(), "eth".to_string()];
        config.normalize();

        assert_eq!(config.bot.timeout_secs, 180);
        assert_eq!(config.lending.currencies, vec!["BTC", "ETH"]);
    }

    #[test]
    fn test_normalize_bounds_rates_keep_days() {
        let mut config = config_with_keys();
        config.rates.keep_days = -5;
        config.normalize();
        assert_eq!(config.rates.keep_days, 1);

        config.rates.keep_days = 1_000_000_000_000;
        config.normalize();
        assert_eq!(config.rates.keep_days, 3650);

        config.rates.keep_days = 10;
        config.normalize();
        assert_eq!(config.rates.keep_days, 10);
    }

    #[test]
    fn test_market_analysis_disabled_by_default() {
        let config = Config::default();
        assert!(!config.market_analysis_enabled());
    }

    #[test]
    fn test_api_config_debug_hides_secret() {
        let config = config_with_keys();
        let rendered = format!("{:?}", config.api);
        assert!(!rendered.contains("k3y-value"));
        assert!(!rendered.contains("s3cr3t-value"));
    }
}
