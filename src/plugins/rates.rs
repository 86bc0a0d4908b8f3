//! Rate history plugin.
//!
//! Every `interval_secs` reads the loan book of each configured currency and
//! stores the best ask plus the rates found at two cumulative depths.

use super::Plugin;
use crate::config::RatesConfig;
use crate::exchange::{LoanOrder, PoloniexClient};
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Offers requested per sample. The default book is too shallow to reach
/// `gap_top`.
pub const BOOK_DEPTH: u32 = 10_000;

/// One observation of a currency's loan book.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RateSample {
    pub at: DateTime<Utc>,
    pub best_rate: Decimal,
    /// Rate reached once `gap_bottom` units of offers are stacked
    pub gap_bottom_rate: Decimal,
    /// Rate reached once `gap_top` units of offers are stacked
    pub gap_top_rate: Decimal,
}

/// Rates at which cumulative offer volume first reaches `gap_bottom` and
/// `gap_top`. Falls back to the deepest offer when the book is too thin.
///
/// Offers must be sorted by ascending rate, as the exchange returns them.
pub fn gap_rates(offers: &[LoanOrder], gap_bottom: Decimal, gap_top: Decimal) -> Option<(Decimal, Decimal)> {
    let last = offers.last()?.rate;
    let mut bottom = None;
    let mut top = None;
    let mut depth = Decimal::ZERO;

    for offer in offers {
        depth += offer.amount;
        if bottom.is_none() && depth >= gap_bottom {
            bottom = Some(offer.rate);
        }
        if depth >= gap_top {
            top = Some(offer.rate);
            break;
        }
    }

    Some((bottom.unwrap_or(last), top.unwrap_or(last)))
}

type History = HashMap<String, VecDeque<RateSample>>;

pub struct RatesPlugin {
    client: Arc<PoloniexClient>,
    config: RatesConfig,
    history: Arc<Mutex<History>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl RatesPlugin {
    pub fn new(config: &RatesConfig, client: Arc<PoloniexClient>) -> Self {
        Self {
            client,
            config: config.clone(),
            history: Arc::new(Mutex::new(HashMap::new())),
            task: Mutex::new(None),
        }
    }

    /// Recorded samples for `currency`, oldest first.
    pub fn samples(&self, currency: &str) -> Vec<RateSample> {
        lock(&self.history)
            .get(currency)
            .map(|h| h.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Take one sample of every configured currency.
    pub async fn sample_once(&self) -> Result<()> {
        sample_all(&self.client, &self.config, &self.history, Utc::now()).await
    }
}

fn lock(history: &Mutex<History>) -> std::sync::MutexGuard<'_, History> {
    match history.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Append `sample` and drop everything older than `keep_days` (at least one
/// day). The newest sample is always kept.
fn record(history: &Mutex<History>, currency: &str, sample: RateSample, keep_days: i64) {
    let cutoff = ChronoDuration::try_days(keep_days.max(1))
        .and_then(|keep| sample.at.checked_sub_signed(keep));
    let mut history = lock(history);
    let entries = history.entry(currency.to_string()).or_default();
    entries.push_back(sample);
    let Some(cutoff) = cutoff else {
        return;
    };
    while entries.len() > 1 && entries.front().is_some_and(|s| s.at < cutoff) {
        entries.pop_front();
    }
}

async fn sample_all(
    client: &PoloniexClient,
    config: &RatesConfig,
    history: &Mutex<History>,
    now: DateTime<Utc>,
) -> Result<()> {
    for currency in &config.currencies {
        let orders = client
            .return_loan_orders(currency, BOOK_DEPTH)
            .await
            .with_context(|| format!("Failed to read loan orders for {}", currency))?;

        let Some(best_rate) = orders.lowest_offer_rate() else {
            debug!(currency = %currency, "No loan offers to sample");
            continue;
        };
        let Some((gap_bottom_rate, gap_top_rate)) =
            gap_rates(&orders.offers, config.gap_bottom, config.gap_top)
        else {
            continue;
        };

        debug!(
            currency = %currency,
            best = %best_rate,
            bottom = %gap_bottom_rate,
            top = %gap_top_rate,
            "Rate sample"
        );
        record(
            history,
            currency,
            RateSample {
                at: now,
                best_rate,
                gap_bottom_rate,
                gap_top_rate,
            },
            config.keep_days,
        );
    }
    Ok(())
}

#[async_trait]
impl Plugin for RatesPlugin {
    fn name(&self) -> &'static str {
        "rates"
    }

    async fn on_bot_init(&self) -> Result<()> {
        let client = self.client.clone();
        let config = self.config.clone();
        let history = self.history.clone();
        let interval = Duration::from_secs(config.interval_secs.max(1));

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                if let Err(e) = sample_all(&client, &config, &history, Utc::now()).await {
                    warn!("Rates sample failed: {:#}", e);
                }
            }
        });

        let mut task = match self.task.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Some(previous) = task.replace(handle) {
            previous.abort();
        }
        info!(
            currencies = ?self.config.currencies,
            interval_secs = interval.as_secs(),
            "Rates sampler started"
        );
        Ok(())
    }

    async fn on_bot_exit(&self) {
        let handle = match self.task.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(handle) = handle {
            handle.abort();
            info!("Rates sampler stopped");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ApiConfig;
    use crate::exchange::DnsCache;
    use rust_decimal_macros::dec;
    use wiremock::matchers::{method, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn offer(rate: Decimal, amount: Decimal) -> LoanOrder {
        LoanOrder {
            rate,
            amount,
            range_min: 2,
            range_max: 2,
        }
    }

    fn sample(at: DateTime<Utc>) -> RateSample {
        RateSample {
            at,
            best_rate: dec!(0.0001),
            gap_bottom_rate: dec!(0.0002),
            gap_top_rate: dec!(0.0003),
        }
    }

    #[test]
    fn test_gap_rates_walk_cumulative_depth() {
        let offers = vec![
            offer(dec!(0.0001), dec!(30)),
            offer(dec!(0.0002), dec!(20)),
            offer(dec!(0.0003), dec!(100)),
            offer(dec!(0.0004), dec!(100)),
        ];
        assert_eq!(
            gap_rates(&offers, dec!(40), dec!(200)),
            Some((dec!(0.0002), dec!(0.0004)))
        );
    }

    #[test]
    fn test_gap_rates_thin_book_uses_deepest_offer() {
        let offers = vec![offer(dec!(0.0001), dec!(5)), offer(dec!(0.0005), dec!(5))];
        assert_eq!(
            gap_rates(&offers, dec!(40), dec!(200)),
            Some((dec!(0.0005), dec!(0.0005)))
        );
        assert_eq!(gap_rates(&[], dec!(40), dec!(200)), None);
    }

    #[test]
    fn test_old_samples_are_pruned() {
        let history = Mutex::new(History::new());
        let now = Utc::now();
        record(&history, "BTC", sample(now - ChronoDuration::days(11)), 10);
        record(&history, "BTC", sample(now - ChronoDuration::days(3)), 10);
        record(&history, "BTC", sample(now), 10);

        let kept = lock(&history).get("BTC").unwrap().len();
        assert_eq!(kept, 2);
    }

    #[test]
    fn test_out_of_range_keep_days_keeps_newest_sample() {
        let history = Mutex::new(History::new());
        let now = Utc::now();

        record(&history, "BTC", sample(now - ChronoDuration::days(2)), -1);
        record(&history, "BTC", sample(now), -1);
        assert_eq!(lock(&history).get("BTC").unwrap().len(), 1);
        assert_eq!(lock(&history).get("BTC").unwrap()[0].at, now);

        record(&history, "ETH", sample(now), 1_000_000_000_000);
        assert_eq!(lock(&history).get("ETH").unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_sample_once_records_gap_rates() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(query_param("command", "returnLoanOrders"))
            .and(query_param("currency", "BTC"))
            .and(query_param("limit", "10000"))
            .respond_with(ResponseTemplate::new(200).set_body_string(
                r#"{"offers":[
                    {"rate":"0.00010000","amount":"50","rangeMin":2,"rangeMax":2},
                    {"rate":"0.00020000","amount":"200","rangeMin":2,"rangeMax":2}
                ],"demands":[]}"#,
            ))
            .expect(1)
            .mount(&server)
            .await;

        let api = ApiConfig {
            public_url: format!("{}/public", server.uri()),
            trading_url: format!("{}/tradingApi", server.uri()),
            ..ApiConfig::default()
        };
        let client = PoloniexClient::new(&api, Duration::from_secs(5), DnsCache::new(), false).unwrap();
        let plugin = RatesPlugin::new(&RatesConfig::default(), Arc::new(client));

        plugin.sample_once().await.unwrap();
        let samples = plugin.samples("BTC");
        assert_eq!(samples.len(), 1);
        assert_eq!(samples[0].best_rate, dec!(0.0001));
        assert_eq!(samples[0].gap_bottom_rate, dec!(0.0001));
        assert_eq!(samples[0].gap_top_rate, dec!(0.0002));
    }
}
