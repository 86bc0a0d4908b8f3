//! The lending control loop.

use super::classifier::{BackoffAction, BackoffDecision, BackoffPolicy, FailureKind};
use super::traits::{LendingEngine, NotificationSink, StatusSink};
use crate::analysis::MarketAnalysis;
use crate::exchange::DnsCache;
use crate::plugins::PluginManager;
use anyhow::{Context, Result};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Why [`ControlLoop::run`] returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum LoopExit {
    /// Operator interrupt
    Interrupted,
    /// Fatal classification
    Fatal { kind: FailureKind, exit_code: i32 },
}

impl LoopExit {
    pub fn exit_code(&self) -> i32 {
        match self {
            LoopExit::Interrupted => 0,
            LoopExit::Fatal { exit_code, .. } => *exit_code,
        }
    }
}

/// Runs lending iterations until interrupted or a fatal failure.
///
/// Every failure inside an iteration aborts the rest of it and is handled
/// here, exactly once. The next iteration always starts from the top.
pub struct ControlLoop {
    engine: Arc<dyn LendingEngine>,
    plugins: Arc<PluginManager>,
    status: Arc<dyn StatusSink>,
    notifier: Arc<dyn NotificationSink>,
    dns: DnsCache,
    analysis: Option<Arc<MarketAnalysis>>,
    policy: BackoffPolicy,
    iterations: u64,
}

impl ControlLoop {
    pub fn new(
        engine: Arc<dyn LendingEngine>,
        plugins: Arc<PluginManager>,
        status: Arc<dyn StatusSink>,
        notifier: Arc<dyn NotificationSink>,
        dns: DnsCache,
    ) -> Self {
        Self {
            engine,
            plugins,
            status,
            notifier,
            dns,
            analysis: None,
            policy: BackoffPolicy::default(),
            iterations: 0,
        }
    }

    pub fn with_market_analysis(mut self, analysis: Arc<MarketAnalysis>) -> Self {
        self.analysis = Some(analysis);
        self
    }

    pub fn with_policy(mut self, policy: BackoffPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn iterations(&self) -> u64 {
        self.iterations
    }

    /// One pass: refresh, hooks, transfer, cancel, lend, hooks, status.
    pub async fn run_iteration(&mut self) -> Result<()> {
        self.iterations += 1;
        self.dns.clear();
        debug!(iteration = self.iterations, "Starting iteration");

        self.engine.update_conversion_rates().await?;
        self.plugins.before_lending().await?;

        // Funds must land before they are lent, and stale offers must be
        // cleared before capital is redeployed.
        self.engine.transfer_balances().await?;
        self.engine.cancel_all().await?;
        self.engine.lend_all().await?;

        self.plugins.after_lending().await?;

        let snapshot = self.engine.status().await;
        self.status
            .persist(&snapshot)
            .await
            .context("Failed to persist status")?;
        Ok(())
    }

    /// Classify a failure, log it and apply its side effects.
    pub async fn handle_failure(&self, err: &anyhow::Error) -> BackoffDecision {
        let kind = FailureKind::classify(err);
        let decision = self.policy.decide(
            kind,
            self.engine.sleep_interval(),
            self.analysis.is_some(),
        );

        match decision.action {
            BackoffAction::AbortProcess { .. } => {
                error!(kind = kind.as_str(), "{:#}", err);
                if let Some(remediation) = kind.remediation() {
                    error!("{}", remediation);
                }
            }
            BackoffAction::Sleep(delay) => {
                warn!(
                    kind = kind.as_str(),
                    sleep_secs = delay.as_secs(),
                    "{:#}",
                    err
                );
            }
            BackoffAction::Ignore if kind == FailureKind::Unhandled => {
                error!(kind = kind.as_str(), "Unhandled error: {:?}", err);
            }
            BackoffAction::Ignore => {
                warn!(kind = kind.as_str(), "{:#}", err);
            }
        }

        if let (Some(delta), Some(analysis)) = (decision.analysis_period_delta_ms, &self.analysis) {
            analysis.increase_period(delta);
        }

        if decision.notify {
            self.notifier
                .notify(&format!("{:#}\n-------\n{:?}", err, err))
                .await;
        }

        decision
    }

    /// Loop until `shutdown` flips to true or a fatal failure occurs.
    ///
    /// The inter-iteration sleep is the only place an interrupt is observed.
    pub async fn run(&mut self, mut shutdown: watch::Receiver<bool>) -> LoopExit {
        loop {
            if *shutdown.borrow() {
                return LoopExit::Interrupted;
            }

            let delay = match self.run_iteration().await {
                Ok(()) => self.engine.sleep_interval(),
                Err(err) => {
                    let decision = self.handle_failure(&err).await;
                    match decision.action {
                        BackoffAction::AbortProcess { exit_code } => {
                            return LoopExit::Fatal {
                                kind: decision.kind,
                                exit_code,
                            };
                        }
                        BackoffAction::Sleep(delay) => delay,
                        BackoffAction::Ignore => self.engine.sleep_interval(),
                    }
                }
            };

            if !sleep_or_shutdown(delay, &mut shutdown).await {
                info!("Interrupted, leaving control loop");
                return LoopExit::Interrupted;
            }
        }
    }
}

/// Sleep for `delay`. Returns false if shutdown was requested meanwhile.
async fn sleep_or_shutdown(delay: Duration, shutdown: &mut watch::Receiver<bool>) -> bool {
    let sleep = tokio::time::sleep(delay);
    tokio::pin!(sleep);
    loop {
        tokio::select! {
            _ = &mut sleep => return true,
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    return false;
                }
            }
        }
    }
}
