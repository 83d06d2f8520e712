// =============================================================================
// Runtime Configuration — hot-reloadable engine settings with atomic save
// =============================================================================
//
// Central configuration hub for the leadlens engine.  Persistence uses an
// atomic tmp + rename pattern to prevent corruption on crash.  All fields
// carry `#[serde(default)]` so that adding new fields never breaks loading an
// older config file.
//
// Environment overrides (applied by `apply_env_overrides`):
//   LEADLENS_LEAD_IDS       comma-separated portfolio identifiers
//   LEADLENS_INTERVAL_MS    scrape cycle cadence
//   LEADLENS_SCRAPER        "on"/"off" master switch
// =============================================================================

use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::info;

// =============================================================================
// Default-value helpers (required by serde `default = "..."` attribute)
// =============================================================================

fn default_true() -> bool {
    true
}

fn default_platform() -> String {
    "binance".to_string()
}

fn default_interval_ms() -> u64 {
    60_000
}

fn default_concurrency() -> usize {
    4
}

fn default_order_page_size() -> u32 {
    50
}

fn default_timeout_ms() -> u64 {
    15_000
}

fn default_base_url() -> String {
    "https://www.binance.com/bapi/futures".to_string()
}

fn default_initial_balance() -> f64 {
    10_000.0
}

fn default_slippage_bps() -> f64 {
    10.0
}

fn default_commission_bps() -> f64 {
    4.0
}

fn default_max_open_simulations() -> u32 {
    10
}

// =============================================================================
// ScraperConfig
// =============================================================================

/// Settings that drive the scheduler and the per-trader scraper.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScraperConfig {
    /// Master switch for the scheduler.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Cycle cadence in milliseconds. Also dictates the uncertainty bound for
    /// visible lifecycle timing.
    #[serde(default = "default_interval_ms")]
    pub interval_ms: u64,

    /// Maximum number of traders processed in parallel per cycle.
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,

    /// Maximum orders fetched per trader per cycle.
    #[serde(default = "default_order_page_size")]
    pub order_page_size: u32,

    /// Per-endpoint request deadline in milliseconds.
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,

    /// Portfolio identifiers to poll.
    #[serde(default)]
    pub lead_ids: Vec<String>,

    /// Base URL of the venue's public copy-trade API.
    #[serde(default = "default_base_url")]
    pub base_url: String,
}

impl Default for ScraperConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_ms: default_interval_ms(),
            concurrency: default_concurrency(),
            order_page_size: default_order_page_size(),
            timeout_ms: default_timeout_ms(),
            lead_ids: Vec::new(),
            base_url: default_base_url(),
        }
    }
}

// =============================================================================
// PositioningConfig
// =============================================================================

/// Presentation options for lifecycle reads.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PositioningConfig {
    /// When false, reads surface `first_seen_at` instead of
    /// `estimated_open_time`. Affects presentation only, not the stored rows.
    #[serde(default = "default_true")]
    pub use_estimated_open_time: bool,
}

impl Default for PositioningConfig {
    fn default() -> Self {
        Self {
            use_estimated_open_time: true,
        }
    }
}

// =============================================================================
// SimulationConfig
// =============================================================================

/// Defaults for the simulated portfolio and manual trade costs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimulationConfig {
    /// Starting balance of the default portfolio.
    #[serde(default = "default_initial_balance")]
    pub initial_balance: f64,

    /// Default exit slippage in basis points (entry slippage is 1.5x this).
    #[serde(default = "default_slippage_bps")]
    pub slippage_bps: f64,

    /// Default per-side commission in basis points.
    #[serde(default = "default_commission_bps")]
    pub commission_bps: f64,

    /// Cap on concurrently open simulated positions.
    #[serde(default = "default_max_open_simulations")]
    pub max_open_simulations: u32,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            initial_balance: default_initial_balance(),
            slippage_bps: default_slippage_bps(),
            commission_bps: default_commission_bps(),
            max_open_simulations: default_max_open_simulations(),
        }
    }
}

// =============================================================================
// RuntimeConfig
// =============================================================================

/// Top-level runtime configuration for the leadlens engine.
///
/// Every field has a serde default so that older JSON files missing new fields
/// will still deserialise correctly.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// Venue identifier stamped on every stored row.
    #[serde(default = "default_platform")]
    pub platform: String,

    #[serde(default)]
    pub scraper: ScraperConfig,

    #[serde(default)]
    pub positioning: PositioningConfig,

    #[serde(default)]
    pub simulation: SimulationConfig,

    /// Path of the SQLite database file.
    #[serde(default = "default_db_path")]
    pub db_path: String,
}

fn default_db_path() -> String {
    "leadlens.db".to_string()
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            platform: default_platform(),
            scraper: ScraperConfig::default(),
            positioning: PositioningConfig::default(),
            simulation: SimulationConfig::default(),
            db_path: default_db_path(),
        }
    }
}

impl RuntimeConfig {
    /// Load configuration from a JSON file at `path`.
    ///
    /// If the file does not exist, returns an error so the caller can fall
    /// back to defaults with a warning.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read runtime config from {}", path.display()))?;

        let config: Self = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse runtime config from {}", path.display()))?;

        info!(
            path = %path.display(),
            leads = config.scraper.lead_ids.len(),
            interval_ms = config.scraper.interval_ms,
            "runtime config loaded"
        );

        Ok(config)
    }

    /// Persist the current configuration to `path` using an atomic write
    /// (write to `.tmp`, then rename).
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();

        let content = serde_json::to_string_pretty(self)
            .context("failed to serialise runtime config to JSON")?;

        let tmp_path = path.with_extension("json.tmp");

        std::fs::write(&tmp_path, &content)
            .with_context(|| format!("failed to write tmp config to {}", tmp_path.display()))?;

        std::fs::rename(&tmp_path, path)
            .with_context(|| format!("failed to rename tmp config to {}", path.display()))?;

        info!(path = %path.display(), "runtime config saved (atomic)");
        Ok(())
    }

    /// Apply environment-variable overrides on top of the loaded file.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(ids) = std::env::var("LEADLENS_LEAD_IDS") {
            let ids: Vec<String> = ids
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect();
            if !ids.is_empty() {
                self.scraper.lead_ids = ids;
            }
        }
        if let Ok(ms) = std::env::var("LEADLENS_INTERVAL_MS") {
            if let Ok(ms) = ms.parse::<u64>() {
                self.scraper.interval_ms = ms;
            }
        }
        if let Ok(v) = std::env::var("LEADLENS_SCRAPER") {
            self.scraper.enabled = !matches!(v.as_str(), "off" | "0" | "false");
        }
    }
}
