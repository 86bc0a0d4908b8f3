//! Lifecycle plugins.
//!
//! Plugins are named in `[bot] plugins` and hook into bot start-up, both
//! sides of each lending pass, and shutdown.

mod rates;

pub use rates::{gap_rates, RateSample, RatesPlugin};

use crate::config::Config;
use crate::exchange::PoloniexClient;
use anyhow::{Context, Result};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{info, warn};

#[async_trait]
pub trait Plugin: Send + Sync {
    fn name(&self) -> &'static str;

    /// Called once before the first iteration. Errors abort start-up.
    async fn on_bot_init(&self) -> Result<()> {
        Ok(())
    }

    async fn before_lending(&self) -> Result<()> {
        Ok(())
    }

    async fn after_lending(&self) -> Result<()> {
        Ok(())
    }

    /// Called once on the way out, after the loop has stopped.
    async fn on_bot_exit(&self) {}
}

/// Ordered set of active plugins.
#[derive(Default)]
pub struct PluginManager {
    plugins: Vec<Arc<dyn Plugin>>,
}

impl PluginManager {
    pub fn new(plugins: Vec<Arc<dyn Plugin>>) -> Self {
        Self { plugins }
    }

    /// Build the plugins named in config. Unknown names are skipped.
    pub fn from_config(config: &Config, client: Arc<PoloniexClient>) -> Self {
        let mut plugins: Vec<Arc<dyn Plugin>> = Vec::new();
        for name in &config.bot.plugins {
            match name.to_ascii_lowercase().as_str() {
                "rates" => plugins.push(Arc::new(RatesPlugin::new(&config.rates, client.clone()))),
                other => warn!(plugin = other, "Unknown plugin, skipping"),
            }
        }
        Self::new(plugins)
    }

    pub fn len(&self) -> usize {
        self.plugins.len()
    }

    pub fn is_empty(&self) -> bool {
        self.plugins.is_empty()
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.plugins.iter().map(|p| p.name()).collect()
    }

    pub async fn on_bot_init(&self) -> Result<()> {
        for plugin in &self.plugins {
            plugin
                .on_bot_init()
                .await
                .with_context(|| format!("Plugin {} failed to initialize", plugin.name()))?;
            info!(plugin = plugin.name(), "🔌 Plugin initialized");
        }
        Ok(())
    }

    pub async fn before_lending(&self) -> Result<()> {
        for plugin in &self.plugins {
            plugin
                .before_lending()
                .await
                .with_context(|| format!("Plugin {} before_lending failed", plugin.name()))?;
        }
        Ok(())
    }

    pub async fn after_lending(&self) -> Result<()> {
        for plugin in &self.plugins {
            plugin
                .after_lending()
                .await
                .with_context(|| format!("Plugin {} after_lending failed", plugin.name()))?;
        }
        Ok(())
    }

    pub async fn on_bot_exit(&self) {
        for plugin in &self.plugins {
            plugin.on_bot_exit().await;
        }
    }
}
