// End-to-end runs of the protection workers against the paper exchange.

use std::sync::Arc;

use chrono::Utc;

use super::orphan::OrphanSweeper;
use super::placement::OrderPlacer;
use super::plan::ExitPlan;
use super::reconciler::Reconciler;
use super::stage_tracker::{StageEvent, StageTracker};
use super::trailing::TrailingController;
use crate::exchange::{PaperExchange, SymbolRules};
use crate::runtime_config::{OrphanConfig, ProtectionConfig, TrailingConfig};
use crate::symbol_book::{ExitStage, LegState, SymbolBook};
use crate::types::{Decision, OpenOrder, Side};

const SYM: &str = "BTCUSDT";

fn decision() -> Decision {
    Decision {
        symbol: SYM.into(),
        side: Side::Long,
        entry_price: 100.0,
        initial_stop: 98.0,
        volatility_unit: 0.8,
        targets: vec![101.0, 102.0, 103.0],
        splits: vec![0.3, 0.3, 0.4],
    }
}

fn stops(ex: &PaperExchange) -> Vec<OpenOrder> {
    ex.orders(SYM).into_iter().filter(|o| o.is_stop_loss()).collect()
}

fn take_profits(ex: &PaperExchange) -> Vec<(f64, f64)> {
    let mut tps: Vec<(f64, f64)> = ex
        .orders(SYM)
        .into_iter()
        .filter(|o| o.is_take_profit())
        .filter_map(|o| Some((o.trigger_price?, o.quantity?)))
        .collect();
    tps.sort_by(|a, b| a.0.total_cmp(&b.0));
    tps
}

async fn open(ex: &Arc<PaperExchange>, book: &SymbolBook, cfg: &ProtectionConfig) {
    let plan = ExitPlan::new(&decision(), 10.0, &SymbolRules::default()).unwrap();
    let report = OrderPlacer::new(ex.clone(), cfg.clone(), false)
        .place(&plan, &SymbolRules::default())
        .await
        .unwrap();
    let mut leg = LegState::for_entry(plan, report.stop_trigger, Utc::now());
    // Past the visibility window so a closed position reads as closed.
    leg.exits_placed_at = Some(Utc::now() - chrono::Duration::seconds(120));
    book.lock(SYM).await.legs.insert(Side::Long, leg);
}

async fn stage(book: &SymbolBook) -> ExitStage {
    book.lock(SYM).await.leg(Side::Long).map(|l| l.stage).unwrap_or_default()
}

#[tokio::test]
async fn staged_exit_walks_stop_from_initial_to_first_target() {
    let ex = Arc::new(PaperExchange::new(10_000.0));
    ex.set_price(SYM, 100.0);
    let cfg = ProtectionConfig::default();
    let book = SymbolBook::new();
    open(&ex, &book, &cfg).await;

    // Entry: one full-size stop, three legs 3/3/4.
    let s = stops(&ex);
    assert_eq!(s.len(), 1);
    assert_eq!(s[0].quantity, Some(10.0));
    assert_eq!(s[0].trigger_price, Some(98.0));
    assert_eq!(take_profits(&ex), vec![(101.0, 3.0), (102.0, 3.0), (103.0, 4.0)]);

    let tracker = StageTracker::new(ex.clone(), cfg.clone(), false);
    let events = tracker.run_symbol(&book, SYM).await.unwrap();
    assert_eq!(events, vec![StageEvent::Baseline { side: Side::Long, take_profits: 3 }]);

    // TP1 fills: 3 -> 2 legs, stop to breakeven.
    ex.set_price(SYM, 101.2);
    tracker.run_symbol(&book, SYM).await.unwrap();
    assert_eq!(stage(&book).await.value(), 1);
    assert_eq!(stops(&ex)[0].trigger_price, Some(100.0));
    assert_eq!(stops(&ex).len(), 1);

    // TP2 fills: 2 -> 1, stop to the first target.
    ex.set_price(SYM, 102.3);
    tracker.run_symbol(&book, SYM).await.unwrap();
    assert_eq!(stage(&book).await.value(), 2);
    assert_eq!(stops(&ex)[0].trigger_price, Some(101.0));

    // TP3 fills: 1 -> 0, position gone, stage terminal, stop canceled.
    ex.set_price(SYM, 103.4);
    let events = tracker.run_symbol(&book, SYM).await.unwrap();
    assert!(stage(&book).await.is_terminal());
    assert!(events.iter().any(|e| matches!(e, StageEvent::StopsCanceled { .. })));
    assert!(stops(&ex).is_empty());
    assert!(ex.positions().is_empty());
    assert!(ex.orders(SYM).is_empty());
}

#[tokio::test]
async fn stop_never_missing_and_never_loosens_across_a_noisy_session() {
    let ex = Arc::new(PaperExchange::new(10_000.0));
    ex.set_price(SYM, 100.0);
    let cfg = ProtectionConfig {
        repair_cooldown_secs: 0,
        ..ProtectionConfig::default()
    };
    let trailing_cfg = TrailingConfig {
        atr_mult_sl: 1.0,
        ..TrailingConfig::default()
    };
    let book = SymbolBook::new();
    open(&ex, &book, &cfg).await;

    let tracker = StageTracker::new(ex.clone(), cfg.clone(), false);
    let trailing = TrailingController::new(ex.clone(), trailing_cfg, cfg.clone(), false);
    let reconciler = Reconciler::new(ex.clone(), cfg.clone(), false);

    // Price path with a manual stop cancel and a manual TP cancel mixed in.
    let path = [100.4, 100.9, 101.05, 100.7, 101.6, 101.3, 102.05, 101.8, 102.4, 102.2];
    let mut last_stop = 98.0;
    let mut last_stage = ExitStage::default();
    for (i, price) in path.into_iter().enumerate() {
        ex.set_price(SYM, price);
        if i == 3 {
            if let Some(s) = stops(&ex).first() {
                ex.remove_order(&s.id);
            }
        }
        tracker.run_symbol(&book, SYM).await.unwrap();
        trailing.run_symbol(&book, SYM).await.unwrap();
        reconciler.run_symbol(&book, SYM).await.unwrap();

        let st = stage(&book).await;
        assert!(st >= last_stage, "stage went backwards at step {i}");
        last_stage = st;

        if ex.positions().is_empty() {
            break;
        }
        let s = stops(&ex);
        assert_eq!(s.len(), 1, "exactly one stop at step {i}");
        let trigger = s[0].trigger_price.unwrap();
        assert!(trigger >= last_stop, "stop loosened at step {i}: {trigger} < {last_stop}");
        last_stop = trigger;
    }
    assert!(last_stop >= 100.0);
}

#[tokio::test]
async fn concurrent_workers_on_one_symbol_do_not_duplicate_stops() {
    let ex = Arc::new(PaperExchange::new(10_000.0));
    ex.set_price(SYM, 100.0);
    let cfg = ProtectionConfig::default();
    let book = Arc::new(SymbolBook::new());
    open(&ex, &book, &cfg).await;

    let tracker = StageTracker::new(ex.clone(), cfg.clone(), false);
    tracker.run_symbol(&book, SYM).await.unwrap();

    // TP1 fills and trailing is armed at the same time.
    ex.set_price(SYM, 101.2);
    let trailing = TrailingController::new(
        ex.clone(),
        TrailingConfig {
            atr_mult_sl: 1.0,
            trail_after_r: 100.0,
            ..TrailingConfig::default()
        },
        cfg.clone(),
        false,
    );
    let reconciler = Reconciler::new(ex.clone(), cfg.clone(), false);

    let (a, b, c) = tokio::join!(
        tracker.run_symbol(&book, SYM),
        trailing.run_symbol(&book, SYM),
        reconciler.run_symbol(&book, SYM),
    );
    a.unwrap();
    b.unwrap();
    c.unwrap();

    let s = stops(&ex);
    assert_eq!(s.len(), 1);
    assert_eq!(s[0].trigger_price, Some(100.0));
    assert_eq!(stage(&book).await.value(), 1);
}

#[tokio::test]
async fn leftovers_after_stop_out_are_swept_once_grace_expires() {
    let ex = Arc::new(PaperExchange::new(10_000.0));
    ex.set_price(SYM, 100.0);
    let cfg = ProtectionConfig::default();
    let book = SymbolBook::new();
    open(&ex, &book, &cfg).await;

    // Stop-out leaves three take-profits resting.
    ex.set_price(SYM, 97.9);
    assert!(ex.positions().is_empty());
    assert_eq!(take_profits(&ex).len(), 3);

    let sweeper = OrphanSweeper::new(ex.clone(), OrphanConfig::default());
    let report = sweeper.run_symbol(&book, SYM).await.unwrap();
    assert!(report.canceled.is_empty());
    assert_eq!(report.too_young, 3);

    for o in ex.orders(SYM) {
        ex.backdate_order(&o.id, 300);
    }
    let report = sweeper.run_symbol(&book, SYM).await.unwrap();
    assert_eq!(report.canceled.len(), 3);
    assert!(ex.orders(SYM).is_empty());
}
