// =============================================================================
// Runtime Configuration — engine settings with atomic save
// =============================================================================
//
// Every tunable of the protection engine lives here and is handed to each
// component at construction time. All fields carry `#[serde(default)]` so that
// adding new fields never breaks loading an older config file.
//
// Persistence uses an atomic tmp + rename pattern to prevent corruption on
// crash.
// =============================================================================

use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::types::AccountMode;

// =============================================================================
// Default-value helpers (required by serde `default = "..."` attribute)
// =============================================================================

fn default_true() -> bool {
    true
}

fn default_symbols() -> Vec<String> {
    vec![
        "BTCUSDT".to_string(),
        "ETHUSDT".to_string(),
        "SOLUSDT".to_string(),
    ]
}

fn default_max_positions() -> u32 {
    1
}

fn default_trade_log_path() -> String {
    "trades.jsonl".to_string()
}

// --- sizing -----------------------------------------------------------------

fn default_account_equity() -> f64 {
    100.0
}

fn default_risk_per_trade() -> f64 {
    0.01
}

fn default_risk_floor() -> f64 {
    1.0
}

fn default_leverage() -> u32 {
    5
}

fn default_max_notional_fraction() -> f64 {
    0.30
}

fn default_margin_buffer_frac() -> f64 {
    0.90
}

fn default_min_notional() -> f64 {
    10.0
}

// --- protection -------------------------------------------------------------

fn default_trigger_buffer_pct() -> f64 {
    0.05
}

fn default_one() -> u32 {
    1
}

fn default_repair_cooldown_secs() -> u64 {
    30
}

fn default_fallback_stop_pct() -> f64 {
    2.0
}

fn default_position_visible_timeout_secs() -> u64 {
    6
}

// --- trailing ---------------------------------------------------------------

fn default_atr_mult_sl() -> f64 {
    2.5
}

fn default_breakeven_after_r() -> f64 {
    1.0
}

fn default_trail_after_r() -> f64 {
    1.5
}

fn default_trail_atr_mult() -> f64 {
    1.0
}

// --- orphans ----------------------------------------------------------------

fn default_orphan_min_age_secs() -> u64 {
    60
}

fn default_orphan_protect_secs() -> u64 {
    45
}

// --- intervals --------------------------------------------------------------

fn default_orchestrator_secs() -> u64 {
    30
}

fn default_stage_tracker_secs() -> u64 {
    10
}

fn default_trailing_secs() -> u64 {
    15
}

fn default_reconciler_secs() -> u64 {
    20
}

fn default_orphan_secs() -> u64 {
    5
}

// =============================================================================
// SizingConfig
// =============================================================================

/// Inputs to the risk sizer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SizingConfig {
    /// Equity used when the exchange balance cannot be fetched (USDT).
    #[serde(default = "default_account_equity")]
    pub account_equity: f64,

    /// Fraction of equity risked per trade (0.01 = 1 %).
    #[serde(default = "default_risk_per_trade")]
    pub risk_per_trade: f64,

    /// Fixed risk amount in USDT. When > 0 it replaces `risk_per_trade`.
    #[serde(default)]
    pub abs_risk: f64,

    /// Minimum risk amount in USDT.
    #[serde(default = "default_risk_floor")]
    pub risk_floor: f64,

    #[serde(default = "default_leverage")]
    pub leverage: u32,

    /// Cap on position notional as a fraction of `equity * leverage`.
    #[serde(default = "default_max_notional_fraction")]
    pub max_notional_fraction: f64,

    /// Extra haircut applied on top of the notional cap.
    #[serde(default = "default_margin_buffer_frac")]
    pub margin_buffer_frac: f64,

    /// Entries below this notional (USDT) are skipped.
    #[serde(default = "default_min_notional")]
    pub min_notional: f64,
}

impl Default for SizingConfig {
    fn default() -> Self {
        Self {
            account_equity: default_account_equity(),
            risk_per_trade: default_risk_per_trade(),
            abs_risk: 0.0,
            risk_floor: default_risk_floor(),
            leverage: default_leverage(),
            max_notional_fraction: default_max_notional_fraction(),
            margin_buffer_frac: default_margin_buffer_frac(),
            min_notional: default_min_notional(),
        }
    }
}

// =============================================================================
// ProtectionConfig
// =============================================================================

/// Placement buffers, retry widening and repair cadence.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProtectionConfig {
    /// Minimum trigger distance from entry / market, in percent of price.
    #[serde(default = "default_trigger_buffer_pct")]
    pub trigger_buffer_pct: f64,

    /// Minimum trigger distance in price increments (ticks).
    #[serde(default = "default_one")]
    pub min_trigger_ticks: u32,

    /// Extra ticks the stop is pushed away from entry on its single retry.
    #[serde(default = "default_one")]
    pub stop_retry_ticks: u32,

    /// A symbol's protection is repaired at most once per this window.
    #[serde(default = "default_repair_cooldown_secs")]
    pub repair_cooldown_secs: u64,

    /// Stop distance (percent of entry) for positions with no exit plan.
    #[serde(default = "default_fallback_stop_pct")]
    pub fallback_stop_pct: f64,

    /// Submit stop-losses with close-position semantics instead of a quantity.
    #[serde(default)]
    pub use_close_position_stop: bool,

    /// How long the orchestrator waits for a new position to become visible.
    #[serde(default = "default_position_visible_timeout_secs")]
    pub position_visible_timeout_secs: u64,
}

impl Default for ProtectionConfig {
    fn default() -> Self {
        Self {
            trigger_buffer_pct: default_trigger_buffer_pct(),
            min_trigger_ticks: 1,
            stop_retry_ticks: 1,
            repair_cooldown_secs: default_repair_cooldown_secs(),
            fallback_stop_pct: default_fallback_stop_pct(),
            use_close_position_stop: false,
            position_visible_timeout_secs: default_position_visible_timeout_secs(),
        }
    }
}

// =============================================================================
// TrailingConfig
// =============================================================================

/// Breakeven / trailing parameters, expressed in R and volatility units.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrailingConfig {
    /// R = `atr_mult_sl * volatility_unit`.
    #[serde(default = "default_atr_mult_sl")]
    pub atr_mult_sl: f64,

    /// Profit (in R) after which the stop moves to breakeven.
    #[serde(default = "default_breakeven_after_r")]
    pub breakeven_after_r: f64,

    /// Profit (in R) after which the stop starts trailing.
    #[serde(default = "default_trail_after_r")]
    pub trail_after_r: f64,

    /// Trail distance in volatility units.
    #[serde(default = "default_trail_atr_mult")]
    pub trail_atr_mult: f64,

    #[serde(default = "default_true")]
    pub enabled: bool,
}

impl Default for TrailingConfig {
    fn default() -> Self {
        Self {
            atr_mult_sl: default_atr_mult_sl(),
            breakeven_after_r: default_breakeven_after_r(),
            trail_after_r: default_trail_after_r(),
            trail_atr_mult: default_trail_atr_mult(),
            enabled: true,
        }
    }
}

// =============================================================================
// OrphanConfig
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrphanConfig {
    /// Orders younger than this are never treated as orphans.
    #[serde(default = "default_orphan_min_age_secs")]
    pub min_age_secs: u64,

    /// Symbols whose exits were placed within this window are skipped.
    #[serde(default = "default_orphan_protect_secs")]
    pub protect_secs: u64,
}

impl Default for OrphanConfig {
    fn default() -> Self {
        Self {
            min_age_secs: default_orphan_min_age_secs(),
            protect_secs: default_orphan_protect_secs(),
        }
    }
}

// =============================================================================
// WorkerIntervals
// =============================================================================

/// Polling interval of each background worker, in seconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerIntervals {
    #[serde(default = "default_orchestrator_secs")]
    pub orchestrator_secs: u64,
    #[serde(default = "default_stage_tracker_secs")]
    pub stage_tracker_secs: u64,
    #[serde(default = "default_trailing_secs")]
    pub trailing_secs: u64,
    #[serde(default = "default_reconciler_secs")]
    pub reconciler_secs: u64,
    #[serde(default = "default_orphan_secs")]
    pub orphan_secs: u64,
}

impl Default for WorkerIntervals {
    fn default() -> Self {
        Self {
            orchestrator_secs: default_orchestrator_secs(),
            stage_tracker_secs: default_stage_tracker_secs(),
            trailing_secs: default_trailing_secs(),
            reconciler_secs: default_reconciler_secs(),
            orphan_secs: default_orphan_secs(),
        }
    }
}

// =============================================================================
// RuntimeConfig
// =============================================================================

/// Top-level configuration for the warden.
///
/// Every field has a serde default so that older JSON files missing new fields
/// will still deserialise correctly.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// Demo routes orders to the local paper book; Live hits the exchange.
    #[serde(default)]
    pub account_mode: AccountMode,

    /// Use the Binance futures testnet endpoints.
    #[serde(default = "default_true")]
    pub testnet: bool,

    /// Account holds independent long and short legs per symbol.
    #[serde(default)]
    pub hedge_mode: bool,

    /// Symbols watched by the sweeper and accepted by the orchestrator.
    #[serde(default = "default_symbols")]
    pub symbols: Vec<String>,

    /// Maximum number of concurrently open symbols.
    #[serde(default = "default_max_positions")]
    pub max_positions: u32,

    /// Append-only trade-event log (JSON lines).
    #[serde(default = "default_trade_log_path")]
    pub trade_log_path: String,

    #[serde(default)]
    pub sizing: SizingConfig,

    #[serde(default)]
    pub protection: ProtectionConfig,

    #[serde(default)]
    pub trailing: TrailingConfig,

    #[serde(default)]
    pub orphan: OrphanConfig,

    #[serde(default)]
    pub intervals: WorkerIntervals,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            account_mode: AccountMode::Demo,
            testnet: true,
            hedge_mode: false,
            symbols: default_symbols(),
            max_positions: default_max_positions(),
            trade_log_path: default_trade_log_path(),
            sizing: SizingConfig::default(),
            protection: ProtectionConfig::default(),
            trailing: TrailingConfig::default(),
            orphan: OrphanConfig::default(),
            intervals: WorkerIntervals::default(),
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
            symbols = ?config.symbols,
            account_mode = %config.account_mode,
            hedge_mode = config.hedge_mode,
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

    /// Apply `WARDEN_*` environment overrides on top of the file values.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(syms) = std::env::var("WARDEN_SYMBOLS") {
            let parsed: Vec<String> = syms
                .split(',')
                .map(|s| s.trim().to_uppercase())
                .filter(|s| !s.is_empty())
                .collect();
            if !parsed.is_empty() {
                self.symbols = parsed;
            }
        }
        if let Ok(mode) = std::env::var("WARDEN_ACCOUNT_MODE") {
            match mode.trim().to_ascii_lowercase().as_str() {
                "live" => self.account_mode = AccountMode::Live,
                "demo" => self.account_mode = AccountMode::Demo,
                other => tracing::warn!(value = other, "ignoring unknown WARDEN_ACCOUNT_MODE"),
            }
        }
        if let Ok(v) = std::env::var("WARDEN_HEDGE_MODE") {
            self.hedge_mode = v.trim().eq_ignore_ascii_case("true");
        }
    }
}
