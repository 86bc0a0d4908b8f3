//! Lending Bot - Main Entry Point

use anyhow::{Context, Result};
use clap::Parser;
use lending_bot::analysis::MarketAnalysis;
use lending_bot::bot::{BackoffPolicy, ControlLoop, LogNotifier, LogStatusSink, LoopExit};
use lending_bot::config::Config;
use lending_bot::exchange::{DnsCache, PoloniexClient};
use lending_bot::lending::Lender;
use lending_bot::plugins::PluginManager;
use lending_bot::utils::to_percent;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing_appender::non_blocking::{NonBlocking, WorkerGuard};
use tracing::{error, info, warn, Level};
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::EnvFilter;

/// Lending Bot CLI
#[derive(Parser)]
#[command(name = "lending-bot")]
#[command(version, about = "Automated lending on the Poloniex margin lending market")]
struct Cli {
    /// Configuration file (defaults to ./default.toml when present)
    #[arg(short, long)]
    config: Option<String>,

    /// Log intended transfers, cancellations and offers without placing them
    #[arg(short, long)]
    dryrun: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_guard = init_logging()?;

    let config = match Config::load(cli.config.as_deref()).and_then(|c| c.validate().map(|_| c)) {
        Ok(config) => config,
        Err(e) => {
            error!("❌ Configuration error: {:#}", e);
            drop(log_guard);
            std::process::exit(1);
        }
    };

    info!("╔════════════════════════════════════════════════════════════╗");
    info!(
        "║  {} v{} on {}",
        config.bot.label,
        env!("CARGO_PKG_VERSION"),
        config.api.exchange
    );
    info!("╚════════════════════════════════════════════════════════════╝");
    if cli.dryrun {
        warn!("📝 DRY RUN - no balances will be moved and no offers placed");
    }
    log_config(&config);

    let exit = run(config, cli.dryrun).await?;

    // Flush buffered file output before the process goes away
    drop(log_guard);
    std::process::exit(exit.exit_code());
}

async fn run(config: Config, dry_run: bool) -> Result<LoopExit> {
    let dns = DnsCache::new();
    let client = Arc::new(
        PoloniexClient::new(
            &config.api,
            Duration::from_secs(config.bot.timeout_secs),
            dns.clone(),
            config.bot.api_debug_log,
        )
        .context("Failed to create Poloniex client")?,
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let shutdown_tx = Arc::new(shutdown_tx);

    let analysis = config
        .market_analysis_enabled()
        .then(|| Arc::new(MarketAnalysis::new(&config.market_analysis, client.clone())));
    let analysis_task = analysis.as_ref().map(|a| a.spawn(shutdown_rx.clone()));

    let engine = Arc::new(Lender::new(client.clone(), &config, analysis.clone(), dry_run));

    let plugins = Arc::new(PluginManager::from_config(&config, client.clone()));
    plugins.on_bot_init().await?;

    let policy = BackoffPolicy {
        widen_analysis_on_ban: config.market_analysis.widen_on_ban,
        notify_unhandled: config.notifications.notify_caught_exception,
        ..BackoffPolicy::default()
    };

    let mut control = ControlLoop::new(
        engine,
        plugins.clone(),
        Arc::new(LogStatusSink),
        Arc::new(LogNotifier::new(config.notifications.prefix.clone())),
        dns,
    )
    .with_policy(policy);
    if let Some(analysis) = &analysis {
        control = control.with_market_analysis(analysis.clone());
    }

    // Setup shutdown signal
    let signal_tx = shutdown_tx.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("🛑 Shutdown signal received");
        signal_tx.send(true).ok();
    });

    info!("🚀 Starting lending loop...");
    info!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");

    let exit = control.run(shutdown_rx).await;

    // Stop background work and run exit hooks on every way out
    shutdown_tx.send(true).ok();
    if let Some(task) = analysis_task {
        task.await.ok();
    }
    plugins.on_bot_exit().await;

    match exit {
        LoopExit::Interrupted => info!("👋 Lending bot stopped after {} iterations", control.iterations()),
        LoopExit::Fatal { kind, exit_code } => error!(
            kind = kind.as_str(),
            exit_code, "💀 Lending bot stopped on fatal error"
        ),
    }

    Ok(exit)
}

/// Initialize logging with both console and file output.
///
/// The returned guard flushes the file writer when dropped.
fn init_logging() -> Result<WorkerGuard> {
    use tracing_subscriber::fmt::writer::MakeWriterExt;

    std::fs::create_dir_all("logs")?;
    let (file_writer, guard) = file_writer(Path::new("logs"));

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive("lending_bot=debug".parse()?)
                .add_directive(Level::INFO.into()),
        )
        .with_writer(std::io::stdout.and(file_writer))
        .with_target(true)
        .with_thread_ids(false)
        .with_file(true)
        .with_line_number(true)
        .with_span_events(FmtSpan::CLOSE)
        .with_ansi(true)
        .init();

    Ok(guard)
}

/// Hourly-rolling, non-blocking log file writer under `dir`.
fn file_writer(dir: &Path) -> (NonBlocking, WorkerGuard) {
    let file_appender = tracing_appender::rolling::hourly(dir, "lending-bot.log");
    tracing_appender::non_blocking(file_appender)
}

/// Log configuration on startup.
fn log_config(config: &Config) {
    info!("📋 Configuration:");
    info!("   API: {:?}", config.api);
    info!("   Currencies: {}", config.lending.currencies.join(", "));
    if !config.lending.transferable_currencies.is_empty() {
        info!(
            "   Auto-transfer: {}",
            config.lending.transferable_currencies.join(", ")
        );
    }
    info!(
        "   Daily rate: {}% - {}%",
        to_percent(config.lending.min_daily_rate),
        to_percent(config.lending.max_daily_rate)
    );
    info!(
        "   Min loan size: {} | Duration: {} days | Auto-renew: {}",
        config.lending.min_loan_size, config.lending.duration_days, config.lending.auto_renew
    );
    info!(
        "   Sleep: {}s active / {}s inactive | Timeout: {}s",
        config.bot.sleep_time_active_secs,
        config.bot.sleep_time_inactive_secs,
        config.bot.timeout_secs
    );
    if config.market_analysis_enabled() {
        info!(
            "   Market analysis: {} every {}s",
            config.market_analysis.currencies.join(", "),
            config.market_analysis.update_interval_secs
        );
    }
    if !config.bot.plugins.is_empty() {
        info!("   Plugins: {}", config.bot.plugins.join(", "));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_dropping_log_guard_flushes_file_output() {
        let dir = std::env::temp_dir().join(format!("lending-bot-logs-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();

        let (mut writer, guard) = file_writer(&dir);
        writeln!(writer, "Are your API keys correct?").unwrap();
        drop(guard);

        let contents: String = std::fs::read_dir(&dir)
            .unwrap()
            .filter_map(|entry| entry.ok())
            .filter_map(|entry| std::fs::read_to_string(entry.path()).ok())
            .collect();
        std::fs::remove_dir_all(&dir).ok();

        assert!(contents.contains("Are your API keys correct?"));
    }
}
