// =============================================================================
// Shared types used across the warden engine
// =============================================================================
//
// Orders and positions are modelled exactly as far as the engine needs to
// reason about protection: which side a position is on, which side an order
// closes, whether it is a stop-loss or a take-profit, and when it was created.
// =============================================================================

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Sides
// ---------------------------------------------------------------------------

/// Direction of a position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Long,
    Short,
}

impl Side {
    /// Order side that opens (or adds to) a position on this side.
    pub fn entry_order_side(self) -> OrderSide {
        match self {
            Self::Long => OrderSide::Buy,
            Self::Short => OrderSide::Sell,
        }
    }

    /// Order side that reduces or closes a position on this side.
    pub fn exit_order_side(self) -> OrderSide {
        match self {
            Self::Long => OrderSide::Sell,
            Self::Short => OrderSide::Buy,
        }
    }

    pub fn opposite(self) -> Self {
        match self {
            Self::Long => Self::Short,
            Self::Short => Self::Long,
        }
    }

    /// `+1.0` for longs, `-1.0` for shorts.
    pub fn sign(self) -> f64 {
        match self {
            Self::Long => 1.0,
            Self::Short => -1.0,
        }
    }

    /// True if `candidate` is a strictly tighter (more protective) stop than
    /// `current`. Longs ratchet up, shorts ratchet down.
    pub fn stop_improves(self, candidate: f64, current: f64) -> bool {
        match self {
            Self::Long => candidate > current,
            Self::Short => candidate < current,
        }
    }

    /// The more protective of two stop prices.
    pub fn tighter_stop(self, a: f64, b: f64) -> f64 {
        match self {
            Self::Long => a.max(b),
            Self::Short => a.min(b),
        }
    }

    /// Exchange tag used in hedge mode (`positionSide`).
    pub fn as_position_side(self) -> &'static str {
        match self {
            Self::Long => "LONG",
            Self::Short => "SHORT",
        }
    }
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Long => write!(f, "long"),
            Self::Short => write!(f, "short"),
        }
    }
}

/// Side of an individual order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OrderSide {
    Buy,
    Sell,
}

impl OrderSide {
    /// Position side a reduce-only order on this side would close.
    pub fn closes(self) -> Side {
        match self {
            Self::Sell => Side::Long,
            Self::Buy => Side::Short,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Buy => "BUY",
            Self::Sell => "SELL",
        }
    }
}

impl std::fmt::Display for OrderSide {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Orders
// ---------------------------------------------------------------------------

/// Order types the engine creates or recognises.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OrderKind {
    Market,
    StopMarket,
    TakeProfitMarket,
    /// Anything else found on the book (limit orders, trailing stops, ...).
    Other,
}

impl OrderKind {
    /// Binance order `type` string.
    pub fn as_exchange_str(self) -> &'static str {
        match self {
            Self::Market => "MARKET",
            Self::StopMarket => "STOP_MARKET",
            Self::TakeProfitMarket => "TAKE_PROFIT_MARKET",
            Self::Other => "LIMIT",
        }
    }

    /// Parse a Binance order `type` string. `STOP` and `TAKE_PROFIT` limit
    /// variants are folded into their market counterparts because they play
    /// the same protective role.
    pub fn from_exchange_str(s: &str) -> Self {
        let upper = s.to_ascii_uppercase();
        if upper == "MARKET" {
            Self::Market
        } else if upper.starts_with("TAKE_PROFIT") {
            Self::TakeProfitMarket
        } else if upper.starts_with("STOP") {
            Self::StopMarket
        } else {
            Self::Other
        }
    }
}

/// Everything needed to submit one order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderRequest {
    pub symbol: String,
    pub kind: OrderKind,
    pub side: OrderSide,
    /// `None` means "close the entire position" (close-position semantics).
    pub quantity: Option<f64>,
    pub trigger_price: Option<f64>,
    pub reduce_only: bool,
    /// Hedge-mode position tag; `None` in one-way mode.
    pub position_side: Option<Side>,
    pub client_id: String,
}

impl OrderRequest {
    /// Market order opening a position.
    pub fn market_entry(symbol: &str, side: Side, quantity: f64, hedge: bool) -> Self {
        Self {
            symbol: symbol.to_string(),
            kind: OrderKind::Market,
            side: side.entry_order_side(),
            quantity: Some(quantity),
            trigger_price: None,
            reduce_only: false,
            position_side: hedge.then_some(side),
            client_id: new_client_id("entry"),
        }
    }

    /// Reduce-only market order flattening `quantity` of a position.
    pub fn market_flatten(symbol: &str, side: Side, quantity: f64, hedge: bool) -> Self {
        Self {
            symbol: symbol.to_string(),
            kind: OrderKind::Market,
            side: side.exit_order_side(),
            quantity: Some(quantity),
            trigger_price: None,
            reduce_only: true,
            position_side: hedge.then_some(side),
            client_id: new_client_id("flat"),
        }
    }

    /// Stop-loss leg. `quantity == None` submits a close-position stop.
    pub fn stop_loss(
        symbol: &str,
        side: Side,
        quantity: Option<f64>,
        trigger: f64,
        hedge: bool,
    ) -> Self {
        Self {
            symbol: symbol.to_string(),
            kind: OrderKind::StopMarket,
            side: side.exit_order_side(),
            quantity,
            trigger_price: Some(trigger),
            reduce_only: quantity.is_some(),
            position_side: hedge.then_some(side),
            client_id: new_client_id("sl"),
        }
    }

    /// Take-profit leg number `leg` (1-based).
    pub fn take_profit(
        symbol: &str,
        side: Side,
        quantity: f64,
        trigger: f64,
        leg: usize,
        hedge: bool,
    ) -> Self {
        Self {
            symbol: symbol.to_string(),
            kind: OrderKind::TakeProfitMarket,
            side: side.exit_order_side(),
            quantity: Some(quantity),
            trigger_price: Some(trigger),
            reduce_only: true,
            position_side: hedge.then_some(side),
            client_id: new_client_id(&format!("tp{leg}")),
        }
    }
}

/// Acknowledgement of an accepted order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderHandle {
    pub order_id: String,
    pub client_id: String,
}

/// An order currently resting on the exchange.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OpenOrder {
    pub id: String,
    pub symbol: String,
    pub kind: OrderKind,
    pub side: OrderSide,
    pub position_side: Option<Side>,
    pub trigger_price: Option<f64>,
    /// `None` for close-position orders.
    pub quantity: Option<f64>,
    pub reduce_only: bool,
    pub close_position: bool,
    pub created_at: DateTime<Utc>,
    pub client_id: String,
}

impl OpenOrder {
    /// Reduce-only or close-position: can only shrink a position. In hedge
    /// mode the exchange reports closing orders through their position tag
    /// instead of the reduce-only flag.
    pub fn is_protective(&self) -> bool {
        self.reduce_only
            || self.close_position
            || self
                .position_side
                .is_some_and(|ps| ps.exit_order_side() == self.side)
    }

    pub fn is_stop_loss(&self) -> bool {
        self.is_protective() && self.kind == OrderKind::StopMarket
    }

    pub fn is_take_profit(&self) -> bool {
        self.is_protective() && self.kind == OrderKind::TakeProfitMarket
    }

    /// Position side this order acts against: the hedge-mode tag when present,
    /// otherwise inferred from the order side.
    pub fn target_side(&self) -> Side {
        self.position_side.unwrap_or_else(|| self.side.closes())
    }

    /// Age relative to `now`.
    pub fn age(&self, now: DateTime<Utc>) -> chrono::Duration {
        now.signed_duration_since(self.created_at)
    }
}

// ---------------------------------------------------------------------------
// Positions
// ---------------------------------------------------------------------------

/// A position as reported by the exchange. Always the ground truth.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExchangePosition {
    pub symbol: String,
    pub side: Side,
    /// Absolute size, always > 0 for reported positions.
    pub size: f64,
    pub entry_price: f64,
}

/// Find the open position for `symbol` (optionally restricted to `side`).
pub fn find_position<'a>(
    positions: &'a [ExchangePosition],
    symbol: &str,
    side: Option<Side>,
) -> Option<&'a ExchangePosition> {
    positions
        .iter()
        .filter(|p| p.symbol == symbol && p.size > 0.0)
        .find(|p| side.map_or(true, |s| p.side == s))
}

// ---------------------------------------------------------------------------
// Strategy output
// ---------------------------------------------------------------------------

/// Entry decision produced by the (external) strategy layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Decision {
    pub symbol: String,
    pub side: Side,
    pub entry_price: f64,
    pub initial_stop: f64,
    /// Per-unit volatility (e.g. ATR) used for R-multiples and trailing.
    pub volatility_unit: f64,
    /// Up to three take-profit prices, nearest first.
    pub targets: Vec<f64>,
    /// Fraction of the entry quantity closed at each target.
    pub splits: Vec<f64>,
}

// ---------------------------------------------------------------------------
// Modes
// ---------------------------------------------------------------------------

/// Whether orders reach the real exchange or a local paper book.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AccountMode {
    Demo,
    Live,
}

impl Default for AccountMode {
    fn default() -> Self {
        Self::Demo
    }
}

impl std::fmt::Display for AccountMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Demo => write!(f, "Demo"),
            Self::Live => write!(f, "Live"),
        }
    }
}

/// Client order id with a short purpose prefix, e.g. `wd-sl-3f2a...`.
/// Binance caps client ids at 36 characters.
pub fn new_client_id(purpose: &str) -> String {
    let raw = uuid::Uuid::new_v4().simple().to_string();
    let mut id = format!("wd-{purpose}-{raw}");
    id.truncate(36);
    id
}
