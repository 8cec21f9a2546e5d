// =============================================================================
// Trigger buffering — keep conditional triggers clear of entry and market
// =============================================================================
//
// A stop or take-profit whose trigger sits at (or through) the current price
// is rejected by the exchange as "would immediately trigger". Every trigger
// the engine submits is therefore pushed at least `gap` away from a set of
// anchor prices, where
//
//     gap = max(min_ticks * tick, anchor * buffer_pct / 100)
//
// Placement anchors on both entry and last price; relocating an existing stop
// anchors on the last price only, since the stop may legitimately sit above
// entry once in profit.
// =============================================================================

use crate::exchange::SymbolRules;
use crate::runtime_config::ProtectionConfig;
use crate::types::Side;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TriggerBuffer {
    pub buffer_pct: f64,
    pub min_ticks: u32,
}

impl TriggerBuffer {
    pub fn from_config(cfg: &ProtectionConfig) -> Self {
        Self {
            buffer_pct: cfg.trigger_buffer_pct,
            min_ticks: cfg.min_trigger_ticks,
        }
    }

    pub fn gap(&self, anchor: f64, tick: f64) -> f64 {
        (tick * self.min_ticks as f64).max(anchor.abs() * self.buffer_pct / 100.0)
    }

    /// Stop-loss trigger no closer than `gap` to any anchor, on the loss side.
    pub fn stop_trigger(&self, side: Side, desired: f64, anchors: &[f64], rules: &SymbolRules) -> f64 {
        let tick = rules.price_increment;
        match side {
            Side::Long => {
                let nearest = anchors.iter().copied().fold(f64::INFINITY, f64::min);
                let limit = if nearest.is_finite() { nearest - self.gap(nearest, tick) } else { desired };
                rules.round_price_down(desired.min(limit))
            }
            Side::Short => {
                let nearest = anchors.iter().copied().fold(f64::NEG_INFINITY, f64::max);
                let limit = if nearest.is_finite() { nearest + self.gap(nearest, tick) } else { desired };
                rules.round_price_up(desired.max(limit))
            }
        }
    }

    /// Take-profit trigger no closer than `gap` to any anchor, on the profit
    /// side.
    pub fn take_profit_trigger(
        &self,
        side: Side,
        desired: f64,
        anchors: &[f64],
        rules: &SymbolRules,
    ) -> f64 {
        let tick = rules.price_increment;
        match side {
            Side::Long => {
                let furthest = anchors.iter().copied().fold(f64::NEG_INFINITY, f64::max);
                let limit = if furthest.is_finite() { furthest + self.gap(furthest, tick) } else { desired };
                rules.round_price_up(desired.max(limit))
            }
            Side::Short => {
                let furthest = anchors.iter().copied().fold(f64::INFINITY, f64::min);
                let limit = if furthest.is_finite() { furthest - self.gap(furthest, tick) } else { desired };
                rules.round_price_down(desired.min(limit))
            }
        }
    }

    /// `trigger` pushed `ticks` further away from entry (loss side).
    pub fn widen_stop(side: Side, trigger: f64, ticks: u32, rules: &SymbolRules) -> f64 {
        let delta = rules.price_increment * ticks as f64;
        match side {
            Side::Long => rules.round_price_down(trigger - delta),
            Side::Short => rules.round_price_up(trigger + delta),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rules() -> SymbolRules {
        SymbolRules { price_increment: 0.01, quantity_step: 0.001, min_qty: 0.001 }
    }

    fn buffer() -> TriggerBuffer {
        TriggerBuffer { buffer_pct: 0.05, min_ticks: 1 }
    }

    #[test]
    fn far_triggers_are_untouched() {
        let b = buffer();
        assert_eq!(b.stop_trigger(Side::Long, 98.0, &[100.0, 100.0], &rules()), 98.0);
        assert_eq!(b.take_profit_trigger(Side::Long, 101.0, &[100.0, 100.0], &rules()), 101.0);
        assert_eq!(b.stop_trigger(Side::Short, 102.0, &[100.0], &rules()), 102.0);
        assert_eq!(b.take_profit_trigger(Side::Short, 99.0, &[100.0], &rules()), 99.0);
    }

    #[test]
    fn close_triggers_are_pushed_out_by_the_gap() {
        let b = buffer();
        // gap at 100 = max(0.01, 0.05) = 0.05
        assert_eq!(b.stop_trigger(Side::Long, 99.99, &[100.0], &rules()), 99.95);
        assert_eq!(b.stop_trigger(Side::Short, 100.01, &[100.0], &rules()), 100.05);
        assert_eq!(b.take_profit_trigger(Side::Long, 100.02, &[100.0], &rules()), 100.05);
        assert_eq!(b.take_profit_trigger(Side::Short, 99.98, &[100.0], &rules()), 99.95);
    }

    #[test]
    fn stop_through_the_market_is_clamped_below_it() {
        let b = buffer();
        // Breakeven at 100 while price already fell back to 99.9.
        let t = b.stop_trigger(Side::Long, 100.0, &[99.9], &rules());
        assert!(t < 99.9);
        assert!((t - 99.85).abs() < 1e-9);
    }

    #[test]
    fn tick_floor_dominates_on_cheap_symbols() {
        let b = TriggerBuffer { buffer_pct: 0.05, min_ticks: 2 };
        let r = SymbolRules { price_increment: 0.001, quantity_step: 1.0, min_qty: 1.0 };
        // 0.05 % of 1.0 = 0.0005 < 2 ticks = 0.002
        assert_eq!(b.stop_trigger(Side::Long, 0.9995, &[1.0], &r), 0.998);
    }

    #[test]
    fn widen_moves_away_from_entry() {
        assert_eq!(TriggerBuffer::widen_stop(Side::Long, 98.0, 1, &rules()), 97.99);
        assert_eq!(TriggerBuffer::widen_stop(Side::Short, 102.0, 2, &rules()), 102.02);
    }
}
