//! Application configuration.
//!
//! Loaded from a TOML file (path via `--config` or `BASISBOT_CONFIG`), with
//! `.env` loaded first so secrets stay out of the file. Every knob has a
//! default so a minimal config only names the venues to trade.

use anyhow::{Context, Result};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;

use crate::models::VenueSpec;

/// One enabled venue with its immutable session attributes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VenueConfig {
    pub name: String,
    /// Funding interval in seconds (3600 = 1h, 28800 = 8h).
    pub funding_interval_secs: u64,
    #[serde(default = "default_maker_fee")]
    pub maker_fee: Decimal,
    #[serde(default = "default_taker_fee")]
    pub taker_fee: Decimal,
    #[serde(default = "default_true")]
    pub supports_account_leverage: bool,
    #[serde(default)]
    pub has_full_depth: bool,
    /// Hard cap used in paper mode; live venues report their own.
    #[serde(default = "default_max_leverage")]
    pub max_leverage: u32,
}

impl VenueConfig {
    pub fn to_spec(&self) -> VenueSpec {
        VenueSpec {
            name: self.name.clone(),
            funding_interval_secs: self.funding_interval_secs,
            maker_fee: self.maker_fee,
            taker_fee: self.taker_fee,
            supports_account_leverage: self.supports_account_leverage,
            has_full_depth: self.has_full_depth,
        }
    }
}

fn default_maker_fee() -> Decimal {
    dec!(0.0002)
}

fn default_taker_fee() -> Decimal {
    dec!(0.0005)
}

fn default_max_leverage() -> u32 {
    20
}

fn default_true() -> bool {
    true
}

/// Exit-rule thresholds (spec: rebalance.*).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RebalanceConfig {
    /// Exit when current divergence falls below this fraction of entry.
    #[serde(default = "default_erosion_threshold")]
    pub erosion_threshold: Decimal,
    #[serde(default = "default_max_age_hours")]
    pub max_age_hours: i64,
    #[serde(default)]
    pub enable_better_opportunity: bool,
    /// Minimum APY improvement (fraction; 0.002 = 0.2%) for a swap exit.
    #[serde(default = "default_min_improvement")]
    pub min_improvement: Decimal,
    /// Consecutive evaluations the improvement must persist before firing.
    #[serde(default = "default_hysteresis_evals")]
    pub hysteresis_evals: u32,
}

fn default_erosion_threshold() -> Decimal {
    dec!(0.5)
}

fn default_max_age_hours() -> i64 {
    168
}

fn default_min_improvement() -> Decimal {
    dec!(0.002)
}

fn default_hysteresis_evals() -> u32 {
    2
}

impl Default for RebalanceConfig {
    fn default() -> Self {
        Self {
            erosion_threshold: default_erosion_threshold(),
            max_age_hours: default_max_age_hours(),
            enable_better_opportunity: false,
            min_improvement: default_min_improvement(),
            hysteresis_evals: default_hysteresis_evals(),
        }
    }
}

/// Pre-flight liquidity gates.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LiquidityConfig {
    /// Percent, not fraction: 0.5 = 0.5%.
    #[serde(default = "default_max_slippage_pct")]
    pub max_slippage_pct: Decimal,
    #[serde(default = "default_max_spread_bps")]
    pub max_spread_bps: Decimal,
    #[serde(default = "default_min_liquidity_score")]
    pub min_liquidity_score: f64,
}

fn default_max_slippage_pct() -> Decimal {
    dec!(0.5)
}

fn default_max_spread_bps() -> Decimal {
    dec!(50)
}

fn default_min_liquidity_score() -> f64 {
    0.6
}

impl Default for LiquidityConfig {
    fn default() -> Self {
        Self {
            max_slippage_pct: default_max_slippage_pct(),
            max_spread_bps: default_max_spread_bps(),
            min_liquidity_score: default_min_liquidity_score(),
        }
    }
}

/// Per-profile hedge retry table (spec: hedge.opening / hedge.closing).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HedgeProfileConfig {
    pub max_retries: u32,
    pub retry_backoff_ms: u64,
    pub total_timeout_ms: u64,
    pub inside_tick_retries: u32,
    /// Percent move since trigger beyond which break-even targeting aborts.
    #[serde(default = "default_max_deviation_pct")]
    pub max_deviation_pct: Decimal,
}

fn default_max_deviation_pct() -> Decimal {
    dec!(0.5)
}

impl HedgeProfileConfig {
    pub fn opening_default() -> Self {
        Self {
            max_retries: 8,
            retry_backoff_ms: 75,
            total_timeout_ms: 6_000,
            inside_tick_retries: 3,
            max_deviation_pct: default_max_deviation_pct(),
        }
    }

    pub fn closing_default() -> Self {
        Self {
            max_retries: 5,
            retry_backoff_ms: 50,
            total_timeout_ms: 3_000,
            inside_tick_retries: 2,
            max_deviation_pct: default_max_deviation_pct(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HedgeConfig {
    #[serde(default = "HedgeProfileConfig::opening_default")]
    pub opening: HedgeProfileConfig,
    #[serde(default = "HedgeProfileConfig::closing_default")]
    pub closing: HedgeProfileConfig,
}

impl Default for HedgeConfig {
    fn default() -> Self {
        Self {
            opening: HedgeProfileConfig::opening_default(),
            closing: HedgeProfileConfig::closing_default(),
        }
    }
}

/// Atomic two-leg entry knobs (spec: execution.atomic.*).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AtomicConfig {
    /// How long to wait for the first book tick after subscribing.
    #[serde(default = "default_warmup_ms")]
    pub warmup_ms: u64,
    /// Percent inter-venue mid spread beyond which price alignment aborts.
    #[serde(default = "default_max_alignment_spread_pct")]
    pub max_alignment_spread_pct: Decimal,
    /// Cap on the alignment offset, in ticks of the coarser venue.
    #[serde(default = "default_max_alignment_offset_ticks")]
    pub max_alignment_offset_ticks: u32,
    /// Fraction of the total entry timeout given to the first concurrent
    /// placement round.
    #[serde(default = "default_first_round_fraction")]
    pub first_round_fraction: f64,
    #[serde(default = "default_rollback_retries")]
    pub rollback_retries: u32,
}

fn default_warmup_ms() -> u64 {
    500
}

fn default_max_alignment_spread_pct() -> Decimal {
    dec!(0.5)
}

fn default_max_alignment_offset_ticks() -> u32 {
    5
}

fn default_first_round_fraction() -> f64 {
    0.3
}

fn default_rollback_retries() -> u32 {
    3
}

impl Default for AtomicConfig {
    fn default() -> Self {
        Self {
            warmup_ms: default_warmup_ms(),
            max_alignment_spread_pct: default_max_alignment_spread_pct(),
            max_alignment_offset_ticks: default_max_alignment_offset_ticks(),
            first_round_fraction: default_first_round_fraction(),
            rollback_retries: default_rollback_retries(),
        }
    }
}

/// Single-order executor knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderConfig {
    #[serde(default = "default_total_timeout_ms")]
    pub total_timeout_ms: u64,
    #[serde(default = "default_inside_tick_retries")]
    pub inside_tick_retries: u32,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Quotes older than this are refreshed before pricing.
    #[serde(default = "default_staleness_limit_ms")]
    pub staleness_limit_ms: u64,
}

fn default_total_timeout_ms() -> u64 {
    10_000
}

fn default_inside_tick_retries() -> u32 {
    3
}

fn default_max_attempts() -> u32 {
    5
}

fn default_poll_interval_ms() -> u64 {
    150
}

fn default_staleness_limit_ms() -> u64 {
    2_000
}

impl Default for OrderConfig {
    fn default() -> Self {
        Self {
            total_timeout_ms: default_total_timeout_ms(),
            inside_tick_retries: default_inside_tick_retries(),
            max_attempts: default_max_attempts(),
            poll_interval_ms: default_poll_interval_ms(),
            staleness_limit_ms: default_staleness_limit_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionConfig {
    /// Paper mode: both legs route to simulated venues, no keys needed.
    #[serde(default = "default_true")]
    pub dry_run: bool,
    #[serde(default)]
    pub atomic: AtomicConfig,
    #[serde(default)]
    pub order: OrderConfig,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            dry_run: true,
            atomic: AtomicConfig::default(),
            order: OrderConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Stop opening after the first successful entry until restart.
    #[serde(default)]
    pub single_position_per_session: bool,
}

/// Top-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// Enabled venues; at least two are required to form a pair.
    pub exchanges: Vec<VenueConfig>,
    /// Base URL of the funding-rate aggregation service. Optional in paper
    /// mode (a static source is used instead).
    #[serde(default)]
    pub funding_service_url: Option<String>,
    #[serde(default = "default_database_path")]
    pub database_path: String,
    /// Symbols to consider; empty = whatever the service returns.
    #[serde(default)]
    pub symbols: Vec<String>,
    #[serde(default = "default_max_positions")]
    pub max_positions: usize,
    #[serde(default = "default_max_position_size_usd")]
    pub max_position_size_usd: Decimal,
    /// Opportunity filter, fraction per year (0.05 = 5% APY).
    #[serde(default = "default_min_profit_apy")]
    pub min_profit_apy: Decimal,
    /// Filter out symbols whose open interest exceeds this (low-OI regimes).
    #[serde(default)]
    pub max_oi_usd: Option<Decimal>,
    #[serde(default = "default_tick_interval_seconds")]
    pub tick_interval_seconds: u64,
    /// Do not re-open a symbol within this window of its last close.
    #[serde(default = "default_cooldown_seconds")]
    pub cooldown_seconds: u64,
    #[serde(default = "default_max_new_per_cycle")]
    pub max_new_per_cycle: usize,
    #[serde(default = "default_shutdown_grace_seconds")]
    pub shutdown_grace_seconds: u64,
    /// When false, a rollback incident terminates the process (exit 4).
    #[serde(default = "default_true")]
    pub continue_on_rollback_incident: bool,
    #[serde(default)]
    pub rebalance: RebalanceConfig,
    #[serde(default)]
    pub liquidity: LiquidityConfig,
    #[serde(default)]
    pub execution: ExecutionConfig,
    #[serde(default)]
    pub hedge: HedgeConfig,
    #[serde(default)]
    pub session: SessionConfig,
    /// Paper-mode seed mid prices per symbol.
    #[serde(default)]
    pub paper_prices: HashMap<String, Decimal>,
}

fn default_database_path() -> String {
    "./basisbot.db".to_string()
}

fn default_max_positions() -> usize {
    3
}

fn default_max_position_size_usd() -> Decimal {
    dec!(1000)
}

fn default_min_profit_apy() -> Decimal {
    dec!(0.02)
}

fn default_tick_interval_seconds() -> u64 {
    60
}

fn default_cooldown_seconds() -> u64 {
    3_600
}

fn default_max_new_per_cycle() -> usize {
    1
}

fn default_shutdown_grace_seconds() -> u64 {
    15
}

impl AppConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("read config {}", path.display()))?;
        let config: AppConfig =
            toml::from_str(&raw).with_context(|| format!("parse config {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    /// Consistency checks; failures exit the process with code 2.
    pub fn validate(&self) -> Result<()> {
        if self.exchanges.len() < 2 {
            anyhow::bail!("at least two exchanges are required, got {}", self.exchanges.len());
        }
        let mut seen = std::collections::HashSet::new();
        for ex in &self.exchanges {
            if ex.name.trim().is_empty() {
                anyhow::bail!("exchange with empty name");
            }
            if !seen.insert(ex.name.clone()) {
                anyhow::bail!("duplicate exchange '{}'", ex.name);
            }
            if ex.funding_interval_secs == 0 {
                anyhow::bail!("exchange '{}' has zero funding interval", ex.name);
            }
            if ex.maker_fee < Decimal::ZERO || ex.taker_fee < Decimal::ZERO {
                anyhow::bail!("exchange '{}' has negative fees", ex.name);
            }
        }
        if self.max_positions == 0 {
            anyhow::bail!("max_positions must be positive");
        }
        if self.max_position_size_usd <= Decimal::ZERO {
            anyhow::bail!("max_position_size_usd must be positive");
        }
        if !self.execution.dry_run && self.funding_service_url.is_none() {
            anyhow::bail!("funding_service_url is required when dry_run is off");
        }
        if self.rebalance.erosion_threshold <= Decimal::ZERO
            || self.rebalance.erosion_threshold >= Decimal::ONE
        {
            anyhow::bail!("rebalance.erosion_threshold must be in (0, 1)");
        }
        let atomic = &self.execution.atomic;
        if !(0.05..=0.95).contains(&atomic.first_round_fraction) {
            anyhow::bail!("execution.atomic.first_round_fraction must be in [0.05, 0.95]");
        }
        for (label, profile) in [("opening", &self.hedge.opening), ("closing", &self.hedge.closing)]
        {
            if profile.max_retries == 0 || profile.total_timeout_ms == 0 {
                anyhow::bail!("hedge.{} retries and timeout must be positive", label);
            }
        }
        Ok(())
    }

    pub fn venue_specs(&self) -> Vec<VenueSpec> {
        self.exchanges.iter().map(|e| e.to_spec()).collect()
    }

    pub fn exchange(&self, name: &str) -> Option<&VenueConfig> {
        self.exchanges.iter().find(|e| e.name == name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_toml() -> &'static str {
        r#"
            [[exchanges]]
            name = "lighter"
            funding_interval_secs = 3600

            [[exchanges]]
            name = "aster"
            funding_interval_secs = 28800
            maker_fee = "0.0001"
            taker_fee = "0.0004"
            supports_account_leverage = false
        "#
    }

    #[test]
    fn test_minimal_config_gets_defaults() {
        let cfg: AppConfig = toml::from_str(minimal_toml()).unwrap();
        cfg.validate().unwrap();
        assert_eq!(cfg.max_positions, 3);
        assert_eq!(cfg.tick_interval_seconds, 60);
        assert_eq!(cfg.hedge.opening.max_retries, 8);
        assert_eq!(cfg.hedge.closing.total_timeout_ms, 3_000);
        assert!(cfg.execution.dry_run);
        assert_eq!(cfg.liquidity.max_spread_bps, dec!(50));
        let aster = cfg.exchange("aster").unwrap();
        assert!(!aster.supports_account_leverage);
        assert_eq!(aster.maker_fee, dec!(0.0001));
    }

    #[test]
    fn test_single_exchange_rejected() {
        let cfg: AppConfig = toml::from_str(
            r#"
                [[exchanges]]
                name = "lighter"
                funding_interval_secs = 3600
            "#,
        )
        .unwrap();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_duplicate_exchange_rejected() {
        let cfg: AppConfig = toml::from_str(
            r#"
                [[exchanges]]
                name = "lighter"
                funding_interval_secs = 3600

                [[exchanges]]
                name = "lighter"
                funding_interval_secs = 3600
            "#,
        )
        .unwrap();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_live_mode_requires_service_url() {
        let mut cfg: AppConfig = toml::from_str(minimal_toml()).unwrap();
        cfg.execution.dry_run = false;
        assert!(cfg.validate().is_err());
        cfg.funding_service_url = Some("http://localhost:8000".into());
        cfg.validate().unwrap();
    }
}
