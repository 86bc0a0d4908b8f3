//! Collaborator seams driven by the control loop.
//!
//! The loop knows nothing about lending policy, status storage or how
//! operators are alerted. It only calls through these traits.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use std::collections::HashMap;
use std::time::Duration;
use tracing::{info, warn};

/// Lending policy executed once per iteration, in the order the loop calls it.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait LendingEngine: Send + Sync {
    /// Refresh currency conversion rates used for status reporting.
    async fn update_conversion_rates(&self) -> Result<()>;

    /// Move idle funds into the lending account.
    async fn transfer_balances(&self) -> Result<()>;

    /// Cancel offers that no longer meet policy.
    async fn cancel_all(&self) -> Result<()>;

    /// Place new loan offers from available lending balances.
    async fn lend_all(&self) -> Result<()>;

    /// Standard delay before the next iteration.
    fn sleep_interval(&self) -> Duration;

    /// Point-in-time view for the status sink.
    async fn status(&self) -> StatusSnapshot;
}

/// Bot state handed to the [`StatusSink`] after each successful iteration.
#[derive(Debug, Clone, Default, Serialize)]
pub struct StatusSnapshot {
    pub updated_at: Option<DateTime<Utc>>,
    pub output_currency: String,
    /// Amount currently lent out, per currency
    pub total_lent: HashMap<String, Decimal>,
    /// Value of one unit of each currency in `output_currency`
    pub conversion_rates: HashMap<String, Decimal>,
    /// Sum of `total_lent` converted to `output_currency`
    pub estimated_value: Decimal,
    pub offers_placed: u64,
    pub dry_run: bool,
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait StatusSink: Send + Sync {
    async fn persist(&self, snapshot: &StatusSnapshot) -> Result<()>;
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn notify(&self, message: &str);
}

/// Writes each snapshot to the log as one structured line.
#[derive(Debug, Default)]
pub struct LogStatusSink;

#[async_trait]
impl StatusSink for LogStatusSink {
    async fn persist(&self, snapshot: &StatusSnapshot) -> Result<()> {
        let lent = serde_json::to_string(&snapshot.total_lent)?;
        info!(
            output_currency = %snapshot.output_currency,
            estimated_value = %snapshot.estimated_value,
            offers_placed = snapshot.offers_placed,
            dry_run = snapshot.dry_run,
            total_lent = %lent,
            "📊 Status updated"
        );
        Ok(())
    }
}

/// Logs notifications at warn level, optionally prefixed with the bot label.
#[derive(Debug, Default)]
pub struct LogNotifier {
    prefix: Option<String>,
}

impl LogNotifier {
    pub fn new(prefix: Option<String>) -> Self {
        Self { prefix }
    }

    fn format(&self, message: &str) -> String {
        match &self.prefix {
            Some(prefix) => format!("{} {}", prefix, message),
            None => message.to_string(),
        }
    }
}

#[async_trait]
impl NotificationSink for LogNotifier {
    async fn notify(&self, message: &str) {
        warn!(target: "notify", "{}", self.format(message));
    }
}
