// =============================================================================
// Exchange collaborator — the capability set the engine consumes
// =============================================================================
//
// The engine never talks HTTP directly. Everything goes through `Exchange`,
// implemented by the Binance futures client (Live) and by `PaperExchange`
// (Demo and tests). Every call returns an explicit `ExchangeError` so callers
// decide between retry, skip and escalate.
// =============================================================================

pub mod paper;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::ExchangeError;
use crate::types::{ExchangePosition, OpenOrder, OrderHandle, OrderRequest};

pub use paper::PaperExchange;

// ---------------------------------------------------------------------------
// Precision rules
// ---------------------------------------------------------------------------

/// Per-symbol precision filters (`PRICE_FILTER`, `LOT_SIZE`).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SymbolRules {
    /// Minimum price increment (tick size).
    pub price_increment: f64,
    /// Quantity step size.
    pub quantity_step: f64,
    pub min_qty: f64,
}

impl Default for SymbolRules {
    fn default() -> Self {
        Self {
            price_increment: 0.01,
            quantity_step: 0.001,
            min_qty: 0.001,
        }
    }
}

/// Snap `value / step` to an integer count, absorbing float noise such as
/// `0.30000000000000004 / 0.1`.
fn steps(value: f64, step: f64) -> f64 {
    let raw = value / step;
    let nearest = raw.round();
    if (raw - nearest).abs() < 1e-9 {
        nearest
    } else {
        raw
    }
}

fn snap(count: f64, step: f64) -> f64 {
    // Re-round to the step's decimal places so 3 * 0.1 prints as 0.3.
    let decimals = decimals_of(step);
    let factor = 10f64.powi(decimals as i32);
    ((count * step) * factor).round() / factor
}

fn decimals_of(step: f64) -> u32 {
    let mut d = 0;
    let mut s = step;
    while d < 12 && (s - s.round()).abs() > 1e-9 {
        s *= 10.0;
        d += 1;
    }
    d
}

impl SymbolRules {
    /// Largest valid price `<= price`.
    pub fn round_price_down(&self, price: f64) -> f64 {
        if self.price_increment <= 0.0 {
            return price;
        }
        snap(steps(price, self.price_increment).floor(), self.price_increment)
    }

    /// Smallest valid price `>= price`.
    pub fn round_price_up(&self, price: f64) -> f64 {
        if self.price_increment <= 0.0 {
            return price;
        }
        snap(steps(price, self.price_increment).ceil(), self.price_increment)
    }

    /// Quantity floored to the step size; 0.0 when below `min_qty`.
    pub fn round_quantity(&self, qty: f64) -> f64 {
        if qty <= 0.0 {
            return 0.0;
        }
        let floored = if self.quantity_step > 0.0 {
            snap(steps(qty, self.quantity_step).floor(), self.quantity_step)
        } else {
            qty
        };
        if floored + 1e-12 < self.min_qty {
            0.0
        } else {
            floored
        }
    }

    /// Whole quantity steps contained in `qty` (floored).
    pub fn quantity_steps(&self, qty: f64) -> u64 {
        if self.quantity_step <= 0.0 || qty <= 0.0 {
            return 0;
        }
        steps(qty, self.quantity_step).floor() as u64
    }

    pub fn quantity_from_steps(&self, n: u64) -> f64 {
        snap(n as f64, self.quantity_step)
    }

    /// Decimal places to print prices with.
    pub fn price_decimals(&self) -> u32 {
        decimals_of(self.price_increment)
    }

    pub fn quantity_decimals(&self) -> u32 {
        decimals_of(self.quantity_step)
    }
}

// ---------------------------------------------------------------------------
// Trait
// ---------------------------------------------------------------------------

/// Order CRUD and account queries against one futures account.
#[async_trait]
pub trait Exchange: Send + Sync {
    async fn create_order(&self, req: &OrderRequest) -> Result<OrderHandle, ExchangeError>;

    async fn cancel_order(&self, symbol: &str, order_id: &str) -> Result<(), ExchangeError>;

    async fn fetch_open_orders(&self, symbol: &str) -> Result<Vec<OpenOrder>, ExchangeError>;

    /// All positions with non-zero size.
    async fn fetch_positions(&self) -> Result<Vec<ExchangePosition>, ExchangeError>;

    async fn last_price(&self, symbol: &str) -> Result<f64, ExchangeError>;

    async fn symbol_rules(&self, symbol: &str) -> Result<SymbolRules, ExchangeError>;

    /// Available (free) balance of `asset`.
    async fn available_balance(&self, asset: &str) -> Result<f64, ExchangeError>;

    /// Set leverage for a symbol before trading it.
    async fn configure_symbol(&self, symbol: &str, leverage: u32) -> Result<(), ExchangeError>;
}
