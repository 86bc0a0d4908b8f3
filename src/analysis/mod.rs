//! Background market analysis.
//!
//! Samples the lowest loan-ask rate of each configured currency at its own
//! adaptive period. The lending engine reads [`MarketAnalysis::suggested_rate`]
//! as a floor for new offers.

use crate::config::MarketAnalysisConfig;
use crate::exchange::PoloniexClient;
use anyhow::{Context, Result};
use rust_decimal::Decimal;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Lowest-ask sampler with a widenable polling period.
pub struct MarketAnalysis {
    client: Arc<PoloniexClient>,
    currencies: Vec<String>,
    default_period_ms: u64,
    period_ms: AtomicU64,
    sample_limit: usize,
    debug_log: bool,
    samples: Mutex<HashMap<String, VecDeque<Decimal>>>,
}

impl MarketAnalysis {
    pub fn new(config: &MarketAnalysisConfig, client: Arc<PoloniexClient>) -> Self {
        let period_ms = config.update_interval_secs.max(1) * 1000;
        Self {
            client,
            currencies: config.currencies.clone(),
            default_period_ms: period_ms,
            period_ms: AtomicU64::new(period_ms),
            sample_limit: config.sample_limit.max(1),
            debug_log: config.debug_log,
            samples: Mutex::new(HashMap::new()),
        }
    }

    pub fn currencies(&self) -> &[String] {
        &self.currencies
    }

    pub fn period(&self) -> Duration {
        Duration::from_millis(self.period_ms.load(Ordering::SeqCst))
    }

    pub fn default_period(&self) -> Duration {
        Duration::from_millis(self.default_period_ms)
    }

    /// Slow sampling down during a ban, capped at 1.5x the default.
    pub fn increase_period(&self, delta_ms: u64) -> Duration {
        let max = self.default_period_ms + self.default_period_ms / 2;
        let prev = self
            .period_ms
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |p| {
                Some(p.saturating_add(delta_ms).min(max))
            })
            .unwrap_or_else(|p| p);
        let current = prev.saturating_add(delta_ms).min(max);
        if current != prev {
            warn!(period_ms = current, "Market analysis period increased");
        }
        Duration::from_millis(current)
    }

    pub fn reset_period(&self) {
        self.period_ms.store(self.default_period_ms, Ordering::SeqCst);
    }

    /// Store one observation, dropping the oldest beyond `sample_limit`.
    pub fn record(&self, currency: &str, rate: Decimal) {
        let mut samples = match self.samples.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let history = samples.entry(currency.to_string()).or_default();
        history.push_back(rate);
        while history.len() > self.sample_limit {
            history.pop_front();
        }
    }

    pub fn sample_count(&self, currency: &str) -> usize {
        match self.samples.lock() {
            Ok(samples) => samples.get(currency).map_or(0, VecDeque::len),
            Err(poisoned) => poisoned.into_inner().get(currency).map_or(0, VecDeque::len),
        }
    }

    /// Mean of the recorded lowest-ask rates, if any were recorded.
    pub fn suggested_rate(&self, currency: &str) -> Option<Decimal> {
        let samples = match self.samples.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let history = samples.get(currency)?;
        if history.is_empty() {
            return None;
        }
        let sum: Decimal = history.iter().copied().sum();
        Some(sum / Decimal::from(history.len()))
    }

    /// Read the loan book of every currency once.
    pub async fn sample_once(&self) -> Result<()> {
        for currency in &self.currencies {
            let orders = self
                .client
                .return_loan_orders(currency, 0)
                .await
                .with_context(|| format!("Failed to sample loan orders for {}", currency))?;

            if let Some(rate) = orders.lowest_offer_rate() {
                self.record(currency, rate);
                if self.debug_log {
                    debug!(currency = %currency, rate = %rate, "Market sample recorded");
                }
            }
        }
        Ok(())
    }

    /// Run the sampler until `shutdown` flips to true.
    pub fn spawn(self: &Arc<Self>, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        let analysis = Arc::clone(self);
        tokio::spawn(async move {
            info!(
                currencies = ?analysis.currencies,
                period_secs = analysis.period().as_secs(),
                "📈 Market analysis started"
            );
            loop {
                if *shutdown.borrow() {
                    break;
                }
                if let Err(e) = analysis.sample_once().await {
                    warn!("Market analysis sample failed: {:#}", e);
                }
                tokio::select! {
                    _ = tokio::time::sleep(analysis.period()) => {}
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
            info!("Market analysis stopped");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ApiConfig;
    use crate::exchange::DnsCache;
    use rust_decimal_macros::dec;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn analysis_for(uri: &str, currencies: &[&str], sample_limit: usize) -> MarketAnalysis {
        let api = ApiConfig {
            public_url: format!("{}/public", uri),
            trading_url: format!("{}/tradingApi", uri),
            ..ApiConfig::default()
        };
        let client = PoloniexClient::new(&api, Duration::from_secs(5), DnsCache::new(), false).unwrap();
        let config = MarketAnalysisConfig {
            currencies: currencies.iter().map(|c| c.to_string()).collect(),
            update_interval_secs: 10,
            sample_limit,
            ..MarketAnalysisConfig::default()
        };
        MarketAnalysis::new(&config, Arc::new(client))
    }

    #[test]
    fn test_suggested_rate_is_mean_of_samples() {
        let analysis = analysis_for("http://127.0.0.1:9", &["BTC"], 10);
        assert_eq!(analysis.suggested_rate("BTC"), None);

        analysis.record("BTC", dec!(0.0002));
        analysis.record("BTC", dec!(0.0004));
        assert_eq!(analysis.suggested_rate("BTC"), Some(dec!(0.0003)));
    }

    #[test]
    fn test_samples_are_bounded() {
        let analysis = analysis_for("http://127.0.0.1:9", &["BTC"], 2);
        analysis.record("BTC", dec!(0.01));
        analysis.record("BTC", dec!(0.0002));
        analysis.record("BTC", dec!(0.0004));
        assert_eq!(analysis.sample_count("BTC"), 2);
        assert_eq!(analysis.suggested_rate("BTC"), Some(dec!(0.0003)));
    }

    #[test]
    fn test_period_widening_is_capped() {
        let analysis = analysis_for("http://127.0.0.1:9", &["BTC"], 10);
        assert_eq!(analysis.period(), Duration::from_secs(10));
        assert_eq!(analysis.increase_period(1000), Duration::from_secs(11));
        for _ in 0..10 {
            analysis.increase_period(1000);
        }
        assert_eq!(analysis.period(), Duration::from_secs(15));

        analysis.reset_period();
        assert_eq!(analysis.period(), analysis.default_period());
    }

    #[tokio::test]
    async fn test_sample_once_records_lowest_ask() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/public"))
            .and(query_param("command", "returnLoanOrders"))
            .and(query_param("currency", "ETH"))
            .respond_with(ResponseTemplate::new(200).set_body_string(
                r#"{"offers":[
                    {"rate":"0.00031000","amount":"1.0","rangeMin":2,"rangeMax":2},
                    {"rate":"0.00029000","amount":"3.0","rangeMin":2,"rangeMax":2}
                ],"demands":[]}"#,
            ))
            .mount(&server)
            .await;

        let analysis = analysis_for(&server.uri(), &["ETH"], 10);
        analysis.sample_once().await.unwrap();
        assert_eq!(analysis.suggested_rate("ETH"), Some(dec!(0.00029)));
    }

    #[tokio::test]
    async fn test_spawned_sampler_stops_on_shutdown() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/public"))
            .respond_with(ResponseTemplate::new(200).set_body_string(r#"{"offers":[],"demands":[]}"#))
            .mount(&server)
            .await;

        let analysis = Arc::new(analysis_for(&server.uri(), &["BTC"], 10));
        let (tx, rx) = watch::channel(false);
        let handle = analysis.spawn(rx);
        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
