// =============================================================================
// Paper exchange — in-memory futures book for Demo mode and tests
// =============================================================================
//
// Market orders fill immediately at the last known price. Conditional orders
// (stop-market, take-profit-market) rest on the book and fill when
// `set_price` crosses their trigger. Positions are tracked per (symbol, side)
// so hedge-mode accounts can be simulated.
//
// When built with a market source (the Binance client's public endpoints),
// prices and precision rules are pulled from it on first use. Tests drive
// prices by hand and can script failures through the hooks at the bottom.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, info};

use super::{Exchange, SymbolRules};
use crate::error::ExchangeError;
use crate::types::{ExchangePosition, OpenOrder, OrderHandle, OrderKind, OrderRequest, OrderSide, Side};

const QTY_EPSILON: f64 = 1e-9;

/// One entry of the ordered journal of book mutations.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum PaperEvent {
    Created {
        order_id: String,
        kind: OrderKind,
        trigger: Option<f64>,
    },
    Canceled {
        order_id: String,
    },
    Filled {
        order_id: String,
        price: f64,
    },
}

struct Book {
    prices: HashMap<String, f64>,
    rules: HashMap<String, SymbolRules>,
    default_rules: SymbolRules,
    orders: Vec<OpenOrder>,
    positions: Vec<ExchangePosition>,
    leverage: HashMap<String, u32>,
    balance: f64,
    next_id: u64,
    scripted_failures: HashMap<OrderKind, u32>,
    fail_cancels: bool,
    journal: Vec<PaperEvent>,
}

/// Leverage assumed for symbols never passed to `configure_symbol`.
const DEFAULT_LEVERAGE: u32 = 20;

pub struct PaperExchange {
    book: Mutex<Book>,
    market: Option<Arc<dyn Exchange>>,
}

impl PaperExchange {
    /// Standalone paper book with `balance` USDT and default precision rules.
    pub fn new(balance: f64) -> Self {
        Self {
            book: Mutex::new(Book {
                prices: HashMap::new(),
                rules: HashMap::new(),
                default_rules: SymbolRules::default(),
                orders: Vec::new(),
                positions: Vec::new(),
                leverage: HashMap::new(),
                balance,
                next_id: 1,
                scripted_failures: HashMap::new(),
                fail_cancels: false,
                journal: Vec::new(),
            }),
            market: None,
        }
    }

    /// Paper book that takes prices and precision rules from `market`.
    pub fn with_market(balance: f64, market: Arc<dyn Exchange>) -> Self {
        let mut paper = Self::new(balance);
        paper.market = Some(market);
        paper
    }

    // -------------------------------------------------------------------------
    // Market simulation
    // -------------------------------------------------------------------------

    /// Set the last price for `symbol` and fill every resting conditional
    /// order the move crosses. Returns the ids of filled orders.
    pub fn set_price(&self, symbol: &str, price: f64) -> Vec<String> {
        let mut book = self.book.lock();
        book.prices.insert(symbol.to_string(), price);

        let triggered: Vec<OpenOrder> = book
            .orders
            .iter()
            .filter(|o| o.symbol == symbol && crosses(o, price))
            .cloned()
            .collect();

        let mut filled = Vec::with_capacity(triggered.len());
        for order in triggered {
            book.orders.retain(|o| o.id != order.id);
            let target = order.position_side.or_else(|| {
                book.positions
                    .iter()
                    .find(|p| p.symbol == symbol && p.side == order.side.closes())
                    .map(|p| p.side)
            });
            if let Some(side) = target {
                book.reduce(symbol, side, order.quantity, price);
            }
            book.journal.push(PaperEvent::Filled {
                order_id: order.id.clone(),
                price,
            });
            info!(symbol, order_id = %order.id, kind = ?order.kind, price, "paper order filled");
            filled.push(order.id);
        }
        filled
    }

    /// Seed a position directly (e.g. one opened outside the engine).
    #[cfg(test)]
    pub fn open_position(&self, symbol: &str, side: Side, size: f64, entry_price: f64) {
        let mut book = self.book.lock();
        book.add(symbol, side, size, entry_price);
        book.prices.entry(symbol.to_string()).or_insert(entry_price);
    }

    pub fn balance(&self) -> f64 {
        self.book.lock().balance
    }

    // -------------------------------------------------------------------------
    // Test hooks
    // -------------------------------------------------------------------------

    /// Reject the next `n` create requests of `kind`.
    #[cfg(test)]
    pub fn fail_next(&self, kind: OrderKind, n: u32) {
        self.book.lock().scripted_failures.insert(kind, n);
    }

    /// Make every cancel fail with a transient error until switched off.
    #[cfg(test)]
    pub fn fail_cancels(&self, on: bool) {
        self.book.lock().fail_cancels = on;
    }

    /// Shift an order's creation time `secs` into the past.
    #[cfg(test)]
    pub fn backdate_order(&self, order_id: &str, secs: i64) {
        let mut book = self.book.lock();
        if let Some(o) = book.orders.iter_mut().find(|o| o.id == order_id) {
            o.created_at -= chrono::Duration::seconds(secs);
        }
    }

    /// Remove an order as if it had been canceled by hand on the exchange UI.
    #[cfg(test)]
    pub fn remove_order(&self, order_id: &str) {
        self.book.lock().orders.retain(|o| o.id != order_id);
    }

    #[cfg(test)]
    pub fn journal(&self) -> Vec<PaperEvent> {
        self.book.lock().journal.clone()
    }

    pub fn orders(&self, symbol: &str) -> Vec<OpenOrder> {
        self.book
            .lock()
            .orders
            .iter()
            .filter(|o| o.symbol == symbol)
            .cloned()
            .collect()
    }

    pub fn positions(&self) -> Vec<ExchangePosition> {
        self.book.lock().positions.clone()
    }

    // -------------------------------------------------------------------------
    // Helpers
    // -------------------------------------------------------------------------

    async fn price_of(&self, symbol: &str) -> Result<f64, ExchangeError> {
        if let Some(p) = self.book.lock().prices.get(symbol).copied() {
            return Ok(p);
        }
        match &self.market {
            Some(market) => {
                let p = market.last_price(symbol).await?;
                self.book.lock().prices.insert(symbol.to_string(), p);
                Ok(p)
            }
            None => Err(ExchangeError::NotFound(format!("no price for {symbol}"))),
        }
    }

    async fn refresh_price(&self, symbol: &str) {
        if let Some(market) = &self.market {
            match market.last_price(symbol).await {
                Ok(p) => {
                    self.set_price(symbol, p);
                }
                Err(e) => debug!(symbol, error = %e, "paper price refresh failed"),
            }
        }
    }
}

/// Would `order` fill at `price`?
fn crosses(order: &OpenOrder, price: f64) -> bool {
    let Some(trigger) = order.trigger_price else {
        return false;
    };
    match (order.kind, order.side) {
        (OrderKind::StopMarket, OrderSide::Sell) => price <= trigger,
        (OrderKind::StopMarket, OrderSide::Buy) => price >= trigger,
        (OrderKind::TakeProfitMarket, OrderSide::Sell) => price >= trigger,
        (OrderKind::TakeProfitMarket, OrderSide::Buy) => price <= trigger,
        _ => false,
    }
}

impl Book {
    fn position_mut(&mut self, symbol: &str, side: Side) -> Option<&mut ExchangePosition> {
        self.positions
            .iter_mut()
            .find(|p| p.symbol == symbol && p.side == side)
    }

    fn add(&mut self, symbol: &str, side: Side, qty: f64, price: f64) {
        match self.position_mut(symbol, side) {
            Some(pos) => {
                let total = pos.size + qty;
                pos.entry_price = (pos.entry_price * pos.size + price * qty) / total;
                pos.size = total;
            }
            None => self.positions.push(ExchangePosition {
                symbol: symbol.to_string(),
                side,
                size: qty,
                entry_price: price,
            }),
        }
    }

    /// Reduce (or with `qty == None`, close) the position; realised PnL goes
    /// to the balance.
    fn reduce(&mut self, symbol: &str, side: Side, qty: Option<f64>, price: f64) {
        let Some(pos) = self.position_mut(symbol, side) else {
            return;
        };
        let closed = qty.map_or(pos.size, |q| q.min(pos.size));
        let pnl = (price - pos.entry_price) * closed * side.sign();
        pos.size -= closed;
        self.balance += pnl;
        self.positions.retain(|p| p.size > QTY_EPSILON);
    }

    fn next_order_id(&mut self) -> String {
        let id = format!("P{}", self.next_id);
        self.next_id += 1;
        id
    }

    fn take_scripted_failure(&mut self, kind: OrderKind) -> bool {
        match self.scripted_failures.get_mut(&kind) {
            Some(n) if *n > 0 => {
                *n -= 1;
                true
            }
            _ => false,
        }
    }
}

#[async_trait]
impl Exchange for PaperExchange {
    async fn create_order(&self, req: &OrderRequest) -> Result<OrderHandle, ExchangeError> {
        let last = self.price_of(&req.symbol).await?;

        let mut book = self.book.lock();
        if book.take_scripted_failure(req.kind) {
            return Err(ExchangeError::Rejected {
                code: -2021,
                msg: "scripted failure".to_string(),
            });
        }

        let order_id = book.next_order_id();

        match req.kind {
            OrderKind::Market => {
                let qty = req.quantity.unwrap_or(0.0);
                // Hedge tag decides the leg; one-way accounts net against the
                // opposite position first.
                let (side, reducing) = match req.position_side {
                    Some(ps) => (ps, req.side == ps.exit_order_side()),
                    None => {
                        let closes = req.side.closes();
                        let has_opposite = book
                            .positions
                            .iter()
                            .any(|p| p.symbol == req.symbol && p.side == closes);
                        if has_opposite || req.reduce_only {
                            (closes, true)
                        } else {
                            (closes.opposite(), false)
                        }
                    }
                };
                if reducing {
                    book.reduce(&req.symbol, side, req.quantity, last);
                } else {
                    let leverage = book.leverage.get(&req.symbol).copied().unwrap_or(DEFAULT_LEVERAGE);
                    let margin = qty * last / f64::from(leverage.max(1));
                    if margin > book.balance {
                        return Err(ExchangeError::Rejected {
                            code: -2019,
                            msg: "Margin is insufficient.".to_string(),
                        });
                    }
                    book.add(&req.symbol, side, qty, last);
                }
                book.journal.push(PaperEvent::Created {
                    order_id: order_id.clone(),
                    kind: req.kind,
                    trigger: None,
                });
                book.journal.push(PaperEvent::Filled {
                    order_id: order_id.clone(),
                    price: last,
                });
            }
            OrderKind::StopMarket | OrderKind::TakeProfitMarket => {
                let Some(trigger) = req.trigger_price else {
                    return Err(ExchangeError::Rejected {
                        code: -1102,
                        msg: "stopPrice is mandatory".to_string(),
                    });
                };
                let resting = OpenOrder {
                    id: order_id.clone(),
                    symbol: req.symbol.clone(),
                    kind: req.kind,
                    side: req.side,
                    position_side: req.position_side,
                    trigger_price: Some(trigger),
                    quantity: req.quantity,
                    reduce_only: req.reduce_only,
                    close_position: req.quantity.is_none(),
                    created_at: Utc::now(),
                    client_id: req.client_id.clone(),
                };
                if crosses(&resting, last) {
                    return Err(ExchangeError::Rejected {
                        code: -2021,
                        msg: "Order would immediately trigger.".to_string(),
                    });
                }
                book.orders.push(resting);
                book.journal.push(PaperEvent::Created {
                    order_id: order_id.clone(),
                    kind: req.kind,
                    trigger: Some(trigger),
                });
            }
            OrderKind::Other => {
                return Err(ExchangeError::Unsupported(
                    "paper book only handles market and conditional orders".to_string(),
                ));
            }
        }

        debug!(symbol = %req.symbol, order_id = %order_id, kind = ?req.kind, "paper order accepted");
        Ok(OrderHandle {
            order_id,
            client_id: req.client_id.clone(),
        })
    }

    async fn cancel_order(&self, symbol: &str, order_id: &str) -> Result<(), ExchangeError> {
        let mut book = self.book.lock();
        if book.fail_cancels {
            return Err(ExchangeError::Transient("scripted cancel failure".to_string()));
        }
        let before = book.orders.len();
        book.orders.retain(|o| !(o.id == order_id && o.symbol == symbol));
        if book.orders.len() == before {
            return Err(ExchangeError::NotFound(format!("order {order_id}")));
        }
        book.journal.push(PaperEvent::Canceled {
            order_id: order_id.to_string(),
        });
        Ok(())
    }

    async fn fetch_open_orders(&self, symbol: &str) -> Result<Vec<OpenOrder>, ExchangeError> {
        self.refresh_price(symbol).await;
        Ok(self.orders(symbol))
    }

    async fn fetch_positions(&self) -> Result<Vec<ExchangePosition>, ExchangeError> {
        Ok(self.positions())
    }

    async fn last_price(&self, symbol: &str) -> Result<f64, ExchangeError> {
        self.refresh_price(symbol).await;
        self.price_of(symbol).await
    }

    async fn symbol_rules(&self, symbol: &str) -> Result<SymbolRules, ExchangeError> {
        let (known, default) = {
            let book = self.book.lock();
            (book.rules.get(symbol).copied(), book.default_rules)
        };
        if let Some(rules) = known {
            return Ok(rules);
        }
        let rules = match &self.market {
            Some(market) => market.symbol_rules(symbol).await.unwrap_or(default),
            None => default,
        };
        self.book.lock().rules.insert(symbol.to_string(), rules);
        Ok(rules)
    }

    async fn available_balance(&self, _asset: &str) -> Result<f64, ExchangeError> {
        Ok(self.balance())
    }

    async fn configure_symbol(&self, symbol: &str, leverage: u32) -> Result<(), ExchangeError> {
        self.book.lock().leverage.insert(symbol.to_string(), leverage);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn market_entry_opens_and_flatten_closes() {
        let ex = PaperExchange::new(1_000.0);
        ex.set_price("BTCUSDT", 100.0);

        ex.create_order(&OrderRequest::market_entry("BTCUSDT", Side::Long, 2.0, false))
            .await
            .unwrap();
        let pos = ex.fetch_positions().await.unwrap();
        assert_eq!(pos.len(), 1);
        assert_eq!(pos[0].side, Side::Long);
        assert_eq!(pos[0].size, 2.0);

        ex.set_price("BTCUSDT", 105.0);
        ex.create_order(&OrderRequest::market_flatten("BTCUSDT", Side::Long, 2.0, false))
            .await
            .unwrap();
        assert!(ex.fetch_positions().await.unwrap().is_empty());
        assert!((ex.balance() - 1_010.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn conditional_orders_fill_when_crossed() {
        let ex = PaperExchange::new(1_000.0);
        ex.set_price("ETHUSDT", 100.0);
        ex.open_position("ETHUSDT", Side::Long, 10.0, 100.0);

        ex.create_order(&OrderRequest::take_profit("ETHUSDT", Side::Long, 3.0, 101.0, 1, false))
            .await
            .unwrap();
        ex.create_order(&OrderRequest::stop_loss("ETHUSDT", Side::Long, Some(10.0), 98.0, false))
            .await
            .unwrap();

        let filled = ex.set_price("ETHUSDT", 101.2);
        assert_eq!(filled.len(), 1);
        assert_eq!(ex.positions()[0].size, 7.0);

        ex.set_price("ETHUSDT", 97.5);
        assert!(ex.positions().is_empty());
        assert!(ex.orders("ETHUSDT").is_empty());
    }

    #[tokio::test]
    async fn immediate_trigger_is_rejected() {
        let ex = PaperExchange::new(1_000.0);
        ex.set_price("SOLUSDT", 100.0);
        let err = ex
            .create_order(&OrderRequest::stop_loss("SOLUSDT", Side::Long, Some(1.0), 100.5, false))
            .await
            .unwrap_err();
        assert!(matches!(err, ExchangeError::Rejected { code: -2021, .. }));
    }

    #[tokio::test]
    async fn scripted_failures_and_journal() {
        let ex = PaperExchange::new(1_000.0);
        ex.set_price("BTCUSDT", 100.0);
        ex.fail_next(OrderKind::StopMarket, 1);

        let req = OrderRequest::stop_loss("BTCUSDT", Side::Long, Some(1.0), 95.0, false);
        assert!(ex.create_order(&req).await.is_err());
        let handle = ex.create_order(&req).await.unwrap();

        ex.fail_cancels(true);
        assert!(ex.cancel_order("BTCUSDT", &handle.order_id).await.is_err());
        ex.fail_cancels(false);
        ex.cancel_order("BTCUSDT", &handle.order_id).await.unwrap();

        let journal = ex.journal();
        assert!(matches!(journal[0], PaperEvent::Created { .. }));
        assert!(matches!(journal[1], PaperEvent::Canceled { .. }));
    }

    #[tokio::test]
    async fn entry_beyond_margin_is_rejected() {
        let ex = PaperExchange::new(100.0);
        ex.set_price("BTCUSDT", 100.0);
        ex.configure_symbol("BTCUSDT", 2).await.unwrap();
        let err = ex
            .create_order(&OrderRequest::market_entry("BTCUSDT", Side::Long, 3.0, false))
            .await
            .unwrap_err();
        assert!(matches!(err, ExchangeError::Rejected { code: -2019, .. }));
        assert!(ex.positions().is_empty());

        ex.create_order(&OrderRequest::market_entry("BTCUSDT", Side::Long, 2.0, false))
            .await
            .unwrap();
        assert_eq!(ex.positions()[0].size, 2.0);
    }

    #[tokio::test]
    async fn hedge_legs_are_independent() {
        let ex = PaperExchange::new(1_000.0);
        ex.set_price("BTCUSDT", 100.0);
        ex.create_order(&OrderRequest::market_entry("BTCUSDT", Side::Long, 1.0, true))
            .await
            .unwrap();
        ex.create_order(&OrderRequest::market_entry("BTCUSDT", Side::Short, 2.0, true))
            .await
            .unwrap();
        assert_eq!(ex.positions().len(), 2);

        ex.create_order(&OrderRequest::market_flatten("BTCUSDT", Side::Short, 2.0, true))
            .await
            .unwrap();
        let pos = ex.positions();
        assert_eq!(pos.len(), 1);
        assert_eq!(pos[0].side, Side::Long);
    }
}
