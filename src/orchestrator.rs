// =============================================================================
// Entry Orchestrator — turn strategy decisions into protected positions
// =============================================================================
//
// Per decision:
//   validate -> capacity / duplicate checks -> equity -> size -> min notional
//   -> leverage -> [symbol lock] cancel stale exits -> place -> record state
//   -> wait until the position is visible -> trade log
//
// Decisions are processed concurrently across symbols; the symbol lock keeps
// the placement sequence from interleaving with the protection workers.
// =============================================================================

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures_util::future::join_all;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::error::PlacementError;
use crate::exchange::Exchange;
use crate::protection::plan::{validate_decision, ExitPlan};
use crate::protection::OrderPlacer;
use crate::risk::{position_size, SizingParams};
use crate::runtime_config::RuntimeConfig;
use crate::symbol_book::{LegState, SymbolBook};
use crate::trade_log::{TradeLog, TradeRecord};
use crate::types::{find_position, Decision, Side};

const VISIBILITY_POLL: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum EntryOutcome {
    Opened {
        symbol: String,
        side: Side,
        quantity: f64,
        stop: f64,
        missing_take_profits: usize,
    },
    Skipped {
        symbol: String,
        reason: String,
    },
    Failed {
        symbol: String,
        error: String,
    },
}

impl EntryOutcome {
    fn skipped(symbol: &str, reason: impl Into<String>) -> Self {
        let reason = reason.into();
        debug!(symbol, reason = %reason, "entry skipped");
        Self::Skipped {
            symbol: symbol.to_string(),
            reason,
        }
    }
}

pub struct Orchestrator {
    exchange: Arc<dyn Exchange>,
    config: RuntimeConfig,
    placer: OrderPlacer,
    trade_log: TradeLog,
}

impl Orchestrator {
    pub fn new(exchange: Arc<dyn Exchange>, config: RuntimeConfig) -> Self {
        let placer = OrderPlacer::new(exchange.clone(), config.protection.clone(), config.hedge_mode);
        let trade_log = TradeLog::new(&config.trade_log_path);
        Self {
            exchange,
            config,
            placer,
            trade_log,
        }
    }

    /// Process one batch of decisions. At most one decision per symbol is
    /// acted on; later duplicates in the batch are skipped.
    pub async fn run_cycle(&self, book: &SymbolBook, decisions: Vec<Decision>) -> Vec<EntryOutcome> {
        if decisions.is_empty() {
            return Vec::new();
        }

        let positions = match self.exchange.fetch_positions().await {
            Ok(p) => p,
            Err(e) => {
                warn!(error = %e, "positions unavailable; deferring entries");
                return decisions
                    .iter()
                    .map(|d| EntryOutcome::skipped(&d.symbol, format!("positions unavailable: {e}")))
                    .collect();
            }
        };

        let open_symbols: HashSet<&str> = positions.iter().map(|p| p.symbol.as_str()).collect();
        let mut slots = (self.config.max_positions as usize).saturating_sub(open_symbols.len());

        let mut seen = HashSet::new();
        let mut outcomes = Vec::new();
        let mut accepted = Vec::new();
        for d in decisions {
            if !seen.insert(d.symbol.clone()) {
                outcomes.push(EntryOutcome::skipped(&d.symbol, "duplicate decision in batch"));
                continue;
            }
            if !self.config.symbols.iter().any(|s| *s == d.symbol) {
                outcomes.push(EntryOutcome::skipped(&d.symbol, "symbol not configured"));
                continue;
            }
            if let Err(e) = validate_decision(&d) {
                outcomes.push(EntryOutcome::skipped(&d.symbol, format!("invalid decision: {e}")));
                continue;
            }
            let busy = if self.config.hedge_mode {
                find_position(&positions, &d.symbol, Some(d.side)).is_some()
            } else {
                open_symbols.contains(d.symbol.as_str())
            };
            if busy {
                outcomes.push(EntryOutcome::skipped(&d.symbol, "position already open"));
                continue;
            }
            if slots == 0 {
                outcomes.push(EntryOutcome::skipped(&d.symbol, "max positions reached"));
                continue;
            }
            slots -= 1;
            accepted.push(d);
        }

        let equity = self.equity().await;
        let results = join_all(accepted.iter().map(|d| self.enter(book, d, equity))).await;
        outcomes.extend(results);
        outcomes
    }

    async fn equity(&self) -> f64 {
        match self.exchange.available_balance("USDT").await {
            Ok(b) if b > 0.0 => b,
            Ok(_) => self.config.sizing.account_equity,
            Err(e) => {
                warn!(error = %e, fallback = self.config.sizing.account_equity, "balance unavailable; using configured equity");
                self.config.sizing.account_equity
            }
        }
    }

    async fn enter(&self, book: &SymbolBook, d: &Decision, equity: f64) -> EntryOutcome {
        let symbol = d.symbol.as_str();

        let rules = match self.exchange.symbol_rules(symbol).await {
            Ok(r) => r,
            Err(e) => return EntryOutcome::skipped(symbol, format!("symbol rules unavailable: {e}")),
        };

        let params = SizingParams::from_config(&self.config.sizing, equity);
        let qty = rules.round_quantity(position_size(d.entry_price, d.initial_stop, &params, rules.quantity_step));
        if qty <= 0.0 {
            return EntryOutcome::skipped(symbol, "size rounds to zero");
        }
        let notional = qty * d.entry_price;
        if notional < self.config.sizing.min_notional {
            return EntryOutcome::skipped(
                symbol,
                format!("notional {notional:.2} below minimum {:.2}", self.config.sizing.min_notional),
            );
        }

        let plan = match ExitPlan::new(d, qty, &rules) {
            Ok(p) => p,
            Err(e) => return EntryOutcome::skipped(symbol, format!("plan rejected: {e}")),
        };

        if let Err(e) = self.exchange.configure_symbol(symbol, self.config.sizing.leverage).await {
            warn!(symbol, leverage = self.config.sizing.leverage, error = %e, "leverage not applied; continuing");
        }

        let mut state = book.lock(symbol).await;
        self.cancel_stale_exits(symbol, d.side).await;

        let report = match self.placer.place(&plan, &rules).await {
            Ok(r) => r,
            Err(e) => {
                if matches!(e, PlacementError::Unprotected { .. }) {
                    warn!(symbol, "entry left unprotected; reconciler will attempt a fallback stop");
                }
                return EntryOutcome::Failed {
                    symbol: symbol.to_string(),
                    error: e.to_string(),
                };
            }
        };

        state
            .legs
            .insert(d.side, LegState::for_entry(plan.clone(), report.stop_trigger, Utc::now()));
        self.wait_until_visible(symbol, d.side).await;
        drop(state);

        info!(
            symbol,
            side = %d.side,
            qty,
            stop = report.stop_trigger,
            targets = ?d.targets,
            equity,
            "position opened and protected"
        );

        let record = TradeRecord {
            timestamp: Utc::now(),
            symbol: symbol.to_string(),
            side: d.side,
            quantity: plan.quantity,
            entry_price: d.entry_price,
            stop_price: report.stop_trigger,
            targets: plan.legs.iter().map(|l| l.price).collect(),
            splits: d.splits.clone(),
            equity,
            account_mode: self.config.account_mode,
            entry_order_id: report.entry.order_id.clone(),
        };
        if let Err(e) = self.trade_log.append(&record) {
            warn!(symbol, error = %e, "trade log append failed");
        }

        EntryOutcome::Opened {
            symbol: symbol.to_string(),
            side: d.side,
            quantity: plan.quantity,
            stop: report.stop_trigger,
            missing_take_profits: report.missing_take_profits.len(),
        }
    }

    /// Cancel protective orders left over from an earlier position on this
    /// side before opening a new one.
    async fn cancel_stale_exits(&self, symbol: &str, side: Side) {
        let orders = match self.exchange.fetch_open_orders(symbol).await {
            Ok(o) => o,
            Err(e) => {
                warn!(symbol, error = %e, "could not list stale exits");
                return;
            }
        };
        for order in orders.iter().filter(|o| o.is_protective()) {
            if self.config.hedge_mode && order.target_side() != side {
                continue;
            }
            match self.exchange.cancel_order(symbol, &order.id).await {
                Ok(()) => info!(symbol, order_id = %order.id, "stale exit canceled before entry"),
                Err(e) => warn!(symbol, order_id = %order.id, error = %e, "stale exit cancel failed"),
            }
        }
    }

    async fn wait_until_visible(&self, symbol: &str, side: Side) {
        let timeout = Duration::from_secs(self.config.protection.position_visible_timeout_secs);
        let waited = tokio::time::timeout(timeout, async {
            loop {
                if let Ok(positions) = self.exchange.fetch_positions().await {
                    if find_position(&positions, symbol, Some(side)).is_some() {
                        return;
                    }
                }
                tokio::time::sleep(VISIBILITY_POLL).await;
            }
        })
        .await;
        if waited.is_err() {
            warn!(symbol, %side, timeout_secs = timeout.as_secs(), "position not visible after entry");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::PaperExchange;
    use crate::types::OrderRequest;

    fn decision(symbol: &str) -> Decision {
        Decision {
            symbol: symbol.into(),
            side: Side::Long,
            entry_price: 100.0,
            initial_stop: 98.0,
            volatility_unit: 0.8,
            targets: vec![101.0, 102.0, 103.0],
            splits: vec![0.3, 0.3, 0.4],
        }
    }

    fn setup(max_positions: u32) -> (Arc<PaperExchange>, Orchestrator, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let ex = Arc::new(PaperExchange::new(1_000.0));
        for s in ["BTCUSDT", "ETHUSDT", "SOLUSDT"] {
            ex.set_price(s, 100.0);
        }
        let config = RuntimeConfig {
            max_positions,
            trade_log_path: dir.path().join("trades.jsonl").display().to_string(),
            ..RuntimeConfig::default()
        };
        let orch = Orchestrator::new(ex.clone(), config);
        (ex, orch, dir)
    }

    #[tokio::test]
    async fn opens_protects_and_logs() {
        let (ex, orch, dir) = setup(1);
        let book = SymbolBook::new();
        let out = orch.run_cycle(&book, vec![decision("BTCUSDT")]).await;
        assert_eq!(out.len(), 1);
        // equity 1000, lev 5, 0.3, 0.9 -> cap 1350 notional -> 13.5 units;
        // risk 10 / 2 = 5 units wins.
        match &out[0] {
            EntryOutcome::Opened { quantity, stop, .. } => {
                assert!((quantity - 5.0).abs() < 1e-9);
                assert_eq!(*stop, 98.0);
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(ex.positions().len(), 1);
        assert_eq!(ex.orders("BTCUSDT").len(), 4);

        let state = book.lock("BTCUSDT").await;
        let leg = state.leg(Side::Long).unwrap();
        assert_eq!(leg.stage.value(), 0);
        assert!(leg.last_tp_count.is_none());
        assert_eq!(leg.live_stop, Some(98.0));

        let log = TradeLog::new(dir.path().join("trades.jsonl"));
        assert_eq!(log.read_all().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn re_entry_after_terminal_starts_a_fresh_leg() {
        use crate::protection::StageTracker;

        let (ex, orch, _dir) = setup(1);
        let book = SymbolBook::new();
        orch.run_cycle(&book, vec![decision("BTCUSDT")]).await;
        book.lock("BTCUSDT").await.leg_mut(Side::Long).exits_placed_at =
            Some(Utc::now() - chrono::Duration::seconds(120));

        // Every target fills in one move; the tracker closes the leg out.
        let tracker = StageTracker::new(ex.clone(), orch.config.protection.clone(), false);
        tracker.run_symbol(&book, "BTCUSDT").await.unwrap();
        ex.set_price("BTCUSDT", 103.5);
        tracker.run_symbol(&book, "BTCUSDT").await.unwrap();
        assert!(ex.positions().is_empty());
        {
            let state = book.lock("BTCUSDT").await;
            let leg = state.leg(Side::Long).unwrap();
            assert!(leg.stage.is_terminal());
            assert_eq!(leg.live_stop, None);
        }

        ex.set_price("BTCUSDT", 100.0);
        let out = orch.run_cycle(&book, vec![decision("BTCUSDT")]).await;
        assert!(matches!(&out[0], EntryOutcome::Opened { .. }));

        let state = book.lock("BTCUSDT").await;
        let leg = state.leg(Side::Long).unwrap();
        assert_eq!(leg.stage.value(), 0);
        assert!(leg.last_tp_count.is_none());
        assert_eq!(leg.live_stop, Some(98.0));
        assert!(leg.plan.is_some());
    }

    #[tokio::test]
    async fn capacity_and_duplicates_are_enforced() {
        let (ex, orch, _dir) = setup(1);
        let book = SymbolBook::new();
        let out = orch
            .run_cycle(&book, vec![decision("BTCUSDT"), decision("ETHUSDT"), decision("BTCUSDT")])
            .await;
        let opened = out.iter().filter(|o| matches!(o, EntryOutcome::Opened { .. })).count();
        assert_eq!(opened, 1);
        assert_eq!(ex.positions().len(), 1);

        // Next cycle: symbol already has a position.
        let out = orch.run_cycle(&book, vec![decision("BTCUSDT")]).await;
        assert!(matches!(&out[0], EntryOutcome::Skipped { reason, .. } if reason.contains("already open")));
    }

    #[tokio::test]
    async fn unconfigured_and_invalid_decisions_are_skipped() {
        let (_ex, orch, _dir) = setup(3);
        let book = SymbolBook::new();
        let mut bad = decision("ETHUSDT");
        bad.initial_stop = 101.0;
        let out = orch.run_cycle(&book, vec![decision("DOGEUSDT"), bad]).await;
        assert!(out.iter().all(|o| matches!(o, EntryOutcome::Skipped { .. })));
    }

    #[tokio::test]
    async fn tiny_notional_is_skipped() {
        let (ex, mut orch, _dir) = setup(1);
        orch.config.sizing.min_notional = 10_000.0;
        let book = SymbolBook::new();
        let out = orch.run_cycle(&book, vec![decision("BTCUSDT")]).await;
        assert!(matches!(&out[0], EntryOutcome::Skipped { reason, .. } if reason.contains("notional")));
        assert!(ex.positions().is_empty());
    }

    #[tokio::test]
    async fn stale_exits_are_cleared_before_entry() {
        let (ex, orch, _dir) = setup(1);
        ex.create_order(&OrderRequest::take_profit("SOLUSDT", Side::Long, 1.0, 120.0, 1, false))
            .await
            .unwrap();
        let book = SymbolBook::new();
        orch.run_cycle(&book, vec![decision("SOLUSDT")]).await;
        let tps: Vec<_> = ex
            .orders("SOLUSDT")
            .into_iter()
            .filter(|o| o.is_take_profit())
            .collect();
        assert_eq!(tps.len(), 3);
        assert!(tps.iter().all(|o| o.trigger_price != Some(120.0)));
    }
}
