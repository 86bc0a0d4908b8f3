//! # Lending Bot
//!
//! Automated lending on the Poloniex margin lending market, built to keep
//! running through exchange outages, request-rate bans and flaky networks.
//!
//! ## Architecture
//!
//! - `config`: Configuration management and validation
//! - `exchange`: Poloniex REST client, request signing, rate limiting, DNS cache
//! - `bot`: Control loop, failure classification and backoff policy
//! - `lending`: Default lending engine
//! - `analysis`: Background loan-rate sampling
//! - `plugins`: Lifecycle plugins (rate history)
//! - `utils`: Shared utilities and decimal arithmetic

pub mod analysis;
pub mod bot;
pub mod config;
pub mod exchange;
pub mod lending;
pub mod plugins;
pub mod utils;

pub use config::Config;
