// =============================================================================
// Orphan Sweeper — cancel protective orders with no position behind them
// =============================================================================
//
// A reduce-only or close-position order is an orphan when the position side
// it targets is not open. In one-way mode that means the symbol is flat (or
// holds the other side); in hedge mode the long and short legs are judged
// separately. Two grace windows keep the sweeper off freshly placed orders:
//   - the whole symbol is skipped for `protect_secs` after exits were placed
//   - individual orders younger than `min_age_secs` are never canceled
// =============================================================================

use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, info, warn};

use crate::error::ExchangeError;
use crate::exchange::Exchange;
use crate::runtime_config::OrphanConfig;
use crate::symbol_book::SymbolBook;
use crate::types::{find_position, ExchangePosition};

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SweepReport {
    pub canceled: Vec<String>,
    /// Orphans left alone because they are inside the grace window.
    pub too_young: usize,
    pub failed: Vec<String>,
    pub symbol_protected: bool,
}

pub struct OrphanSweeper {
    exchange: Arc<dyn Exchange>,
    cfg: OrphanConfig,
}

impl OrphanSweeper {
    pub fn new(exchange: Arc<dyn Exchange>, cfg: OrphanConfig) -> Self {
        Self { exchange, cfg }
    }

    /// Symbols worth sweeping: configured, known to the book, or holding a
    /// position.
    pub fn candidate_symbols(
        configured: &[String],
        book: &SymbolBook,
        positions: &[ExchangePosition],
    ) -> Vec<String> {
        let mut all: BTreeSet<String> = configured.iter().cloned().collect();
        all.extend(book.symbols());
        all.extend(positions.iter().map(|p| p.symbol.clone()));
        all.into_iter().collect()
    }

    pub async fn run_symbol(&self, book: &SymbolBook, symbol: &str) -> Result<SweepReport, ExchangeError> {
        let state = book.lock(symbol).await;
        let now = Utc::now();
        let mut report = SweepReport::default();

        if state.recently_placed(now, self.cfg.protect_secs) {
            debug!(symbol, "exits placed recently; sweep skipped");
            report.symbol_protected = true;
            return Ok(report);
        }

        let positions = self.exchange.fetch_positions().await?;
        let orders = self.exchange.fetch_open_orders(symbol).await?;
        let min_age = chrono::Duration::seconds(self.cfg.min_age_secs as i64);

        for order in orders.iter().filter(|o| o.is_protective()) {
            let side = order.target_side();
            if find_position(&positions, symbol, Some(side)).is_some() {
                continue;
            }
            if order.age(now) < min_age {
                report.too_young += 1;
                continue;
            }
            match self.exchange.cancel_order(symbol, &order.id).await {
                Ok(()) | Err(ExchangeError::NotFound(_)) => {
                    info!(symbol, order_id = %order.id, kind = ?order.kind, %side, "orphan order canceled");
                    report.canceled.push(order.id.clone());
                }
                Err(e) => {
                    warn!(symbol, order_id = %order.id, error = %e, "orphan cancel failed");
                    report.failed.push(order.id.clone());
                }
            }
        }
        drop(state);
        Ok(report)
    }
}
