//! Default lending engine.
//!
//! Deliberately simple policy:
//! - Move configured currencies from the exchange account into lending
//! - Cancel our open offers so capital can be redeployed at current rates
//! - Offer every available balance at the best of the lowest ask, the
//!   configured floor and the market analysis suggestion

use crate::analysis::MarketAnalysis;
use crate::bot::{LendingEngine, StatusSnapshot};
use crate::config::{Config, LendingConfig};
use crate::exchange::{Account, PoloniexClient, Ticker};
use crate::utils::{clamp_rate, round_down_to_lot, safe_div, to_percent, AMOUNT_STEP};
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tracing::{debug, info, warn};

#[derive(Debug)]
struct LenderState {
    conversion_rates: HashMap<String, Decimal>,
    total_lent: HashMap<String, Decimal>,
    offers_placed: u64,
    /// Funds lent or offered during the last pass
    active: bool,
}

pub struct Lender {
    client: Arc<PoloniexClient>,
    config: LendingConfig,
    output_currency: String,
    sleep_active: Duration,
    sleep_inactive: Duration,
    analysis: Option<Arc<MarketAnalysis>>,
    dry_run: bool,
    state: Mutex<LenderState>,
}

impl Lender {
    pub fn new(
        client: Arc<PoloniexClient>,
        config: &Config,
        analysis: Option<Arc<MarketAnalysis>>,
        dry_run: bool,
    ) -> Self {
        Self {
            client,
            config: config.lending.clone(),
            output_currency: config.bot.output_currency.clone(),
            sleep_active: Duration::from_secs(config.bot.sleep_time_active_secs),
            sleep_inactive: Duration::from_secs(config.bot.sleep_time_inactive_secs),
            analysis,
            dry_run,
            state: Mutex::new(LenderState {
                conversion_rates: HashMap::new(),
                total_lent: HashMap::new(),
                offers_placed: 0,
                active: true,
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, LenderState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn suggested_rate(&self, currency: &str) -> Option<Decimal> {
        self.analysis.as_ref()?.suggested_rate(currency)
    }
}

/// Value of one unit of each currency in `output`.
///
/// Poloniex pairs are quoted `BASE_QUOTE`, with `last` the price of QUOTE
/// in BASE. Currencies with no pair either way are left out.
pub fn conversion_rates(
    ticker: &HashMap<String, Ticker>,
    output: &str,
    currencies: &[String],
) -> HashMap<String, Decimal> {
    let mut rates = HashMap::new();
    for currency in currencies {
        if currency == output {
            rates.insert(currency.clone(), Decimal::ONE);
        } else if let Some(t) = ticker.get(&format!("{}_{}", output, currency)) {
            rates.insert(currency.clone(), t.last);
        } else if let Some(t) = ticker.get(&format!("{}_{}", currency, output)) {
            rates.insert(currency.clone(), safe_div(Decimal::ONE, t.last));
        } else {
            debug!(currency = %currency, output = %output, "No ticker pair for conversion");
        }
    }
    rates
}

/// Offer rate: the highest of the lowest ask, the configured floor and the
/// market suggestion, never above `max_daily_rate`.
pub fn target_rate(
    lowest_ask: Option<Decimal>,
    suggestion: Option<Decimal>,
    config: &LendingConfig,
) -> Decimal {
    let floor = config.min_daily_rate;
    let rate = lowest_ask
        .unwrap_or(floor)
        .max(suggestion.unwrap_or(floor));
    clamp_rate(rate, floor, config.max_daily_rate)
}

#[async_trait]
impl LendingEngine for Lender {
    async fn update_conversion_rates(&self) -> Result<()> {
        let ticker = self
            .client
            .return_ticker()
            .await
            .context("Failed to fetch ticker")?;
        let rates = conversion_rates(&ticker, &self.output_currency, &self.config.currencies);

        let loans = self
            .client
            .return_active_loans()
            .await
            .context("Failed to fetch active loans")?;
        let mut total_lent: HashMap<String, Decimal> = HashMap::new();
        for loan in loans.provided {
            *total_lent.entry(loan.currency).or_default() += loan.amount;
        }

        let mut state = self.state();
        state.conversion_rates = rates;
        state.total_lent = total_lent;
        Ok(())
    }

    async fn transfer_balances(&self) -> Result<()> {
        if self.config.transferable_currencies.is_empty() {
            return Ok(());
        }

        let balances = self
            .client
            .return_available_account_balances(Some(Account::Exchange))
            .await
            .context("Failed to fetch exchange balances")?;
        let exchange = balances.get(&Account::Exchange);

        for currency in &self.config.transferable_currencies {
            let amount = exchange
                .and_then(|b| b.get(currency))
                .copied()
                .unwrap_or(Decimal::ZERO);
            if amount <= Decimal::ZERO {
                continue;
            }

            if self.dry_run {
                info!("[DRY RUN] Would transfer {} {} to lending", amount, currency);
                continue;
            }

            let ack = self
                .client
                .transfer_balance(currency, amount, Account::Exchange, Account::Lending)
                .await
                .with_context(|| format!("Failed to transfer {} to lending", currency))?;
            if ack.is_success() {
                info!("💸 Transferred {} {} from exchange to lending", amount, currency);
            } else {
                warn!(currency = %currency, message = %ack.message, "Transfer not confirmed");
            }
        }
        Ok(())
    }

    async fn cancel_all(&self) -> Result<()> {
        let offers = self
            .client
            .return_open_loan_offers()
            .await
            .context("Failed to fetch open loan offers")?;

        for currency in &self.config.currencies {
            let Some(open) = offers.get(currency) else {
                continue;
            };
            for offer in open {
                if self.dry_run {
                    info!("[DRY RUN] Would cancel {} offer #{}", currency, offer.id);
                    continue;
                }
                let ack = self
                    .client
                    .cancel_loan_offer(currency, offer.id)
                    .await
                    .with_context(|| format!("Failed to cancel {} offer #{}", currency, offer.id))?;
                if ack.is_success() {
                    debug!(currency = %currency, id = offer.id, "Loan offer cancelled");
                } else {
                    warn!(currency = %currency, id = offer.id, message = %ack.message, "Cancel not confirmed");
                }
            }
        }
        Ok(())
    }

    async fn lend_all(&self) -> Result<()> {
        let balances = self
            .client
            .return_available_account_balances(Some(Account::Lending))
            .await
            .context("Failed to fetch lending balances")?;
        let lending = balances.get(&Account::Lending);

        let mut placed = 0u64;
        for currency in &self.config.currencies {
            let available = lending
                .and_then(|b| b.get(currency))
                .copied()
                .map(|a| round_down_to_lot(a, AMOUNT_STEP))
                .unwrap_or(Decimal::ZERO);
            if available < self.config.min_loan_size {
                debug!(currency = %currency, available = %available, "Below minimum loan size");
                continue;
            }

            let orders = self
                .client
                .return_loan_orders(currency, 0)
                .await
                .with_context(|| format!("Failed to fetch {} loan orders", currency))?;
            let rate = target_rate(
                orders.lowest_offer_rate(),
                self.suggested_rate(currency),
                &self.config,
            );

            if self.dry_run {
                info!(
                    "[DRY RUN] Would lend {} {} at {}% for {} days",
                    available,
                    currency,
                    to_percent(rate),
                    self.config.duration_days
                );
            } else {
                let ack = self
                    .client
                    .create_loan_offer(
                        currency,
                        available,
                        self.config.duration_days,
                        self.config.auto_renew,
                        rate,
                    )
                    .await
                    .with_context(|| format!("Failed to place {} loan offer", currency))?;
                info!(
                    order_id = ?ack.order_id,
                    "💰 Placed loan offer: {} {} at {}% for {} days",
                    available,
                    currency,
                    to_percent(rate),
                    self.config.duration_days
                );
            }
            placed += 1;
        }

        let mut state = self.state();
        state.offers_placed += placed;
        state.active = placed > 0 || !state.total_lent.is_empty();
        Ok(())
    }

    fn sleep_interval(&self) -> Duration {
        if self.state().active {
            self.sleep_active
        } else {
            self.sleep_inactive
        }
    }

    async fn status(&self) -> StatusSnapshot {
        let state = self.state();
        let estimated_value = state
            .total_lent
            .iter()
            .filter_map(|(cur, amount)| state.conversion_rates.get(cur).map(|r| amount * r))
            .sum();

        StatusSnapshot {
            updated_at: Some(Utc::now()),
            output_currency: self.output_currency.clone(),
            total_lent: state.total_lent.clone(),
            conversion_rates: state.conversion_rates.clone(),
            estimated_value,
            offers_placed: state.offers_placed,
            dry_run: self.dry_run,
        }
    }
}
