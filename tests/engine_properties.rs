//! End-to-end properties of the order/ledger engine: fill accounting,
//! balance invariants, idempotency, concurrency linearization and TWAP
//! slicing, all driven through the public component APIs.

use chrono::{Duration as ChronoDuration, TimeZone, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use tally::clock::{Clock, ManualClock};
use tally::domain::{CopySubscription, OrderRequest, OrderSide, OrderStatus};
use tally::engine::{ExecutionEngine, FeeSchedule, OrderStateMachine};
use tally::error::EngineError;
use tally::ledger::{LedgerApply, LedgerStore};
use tally::notify::{LogNotifier, NotificationSink};
use tally::oracle::{FixedOracle, OracleGateway};
use tally::schedulers::CopyTradePropagator;
use tally::services::{EvaluatorConfig, Metrics, OrderEvaluator};
use tally::TwapSlicer;

struct Harness {
    clock: Arc<ManualClock>,
    ledger: Arc<LedgerStore>,
    oracle: Arc<FixedOracle>,
    orders: Arc<OrderStateMachine>,
    engine: Arc<ExecutionEngine>,
    metrics: Arc<Metrics>,
}

fn harness(fees: FeeSchedule) -> Harness {
    let clock = Arc::new(ManualClock::new(
        Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap(),
    ));
    let clock_dyn: Arc<dyn Clock> = clock.clone();
    let ledger = Arc::new(LedgerStore::new(clock_dyn.clone(), None));
    let oracle = Arc::new(FixedOracle::new());
    let gateway = Arc::new(OracleGateway::new(
        oracle.clone(),
        Duration::from_millis(100),
    ));
    let notifier: Arc<dyn NotificationSink> = Arc::new(LogNotifier);
    let metrics = Arc::new(Metrics::new());
    let orders = Arc::new(OrderStateMachine::new(
        ledger.clone(),
        gateway.clone(),
        clock_dyn.clone(),
        None,
        notifier.clone(),
        metrics.clone(),
    ));
    let engine = Arc::new(ExecutionEngine::new(
        orders.clone(),
        ledger.clone(),
        gateway,
        fees,
        clock_dyn,
        None,
        notifier,
        metrics.clone(),
    ));
    Harness {
        clock,
        ledger,
        oracle,
        orders,
        engine,
        metrics,
    }
}

async fn funded_account(h: &Harness, balance: Decimal) -> Uuid {
    let account = h.ledger.open_account("USD");
    h.ledger
        .apply(LedgerApply::for_account(account.id).cash(balance))
        .await
        .unwrap();
    account.id
}

#[tokio::test]
async fn fill_quantities_sum_to_filled_qty() {
    let h = harness(FeeSchedule::free());
    let account_id = funded_account(&h, dec!(10000)).await;
    h.oracle.set_price("AAPL", dec!(100));

    let order = h
        .orders
        .submit(OrderRequest::market(
            account_id,
            "AAPL",
            OrderSide::Buy,
            dec!(7),
            "key-1",
        ))
        .await
        .unwrap();
    h.engine.try_execute(order.id).await.unwrap();

    let order = h.orders.get_order(order.id).await.unwrap();
    assert!(order.filled_qty >= Decimal::ZERO);
    assert!(order.filled_qty <= order.requested_qty);

    let fills = h.engine.fills_for(order.id);
    let total: Decimal = fills.iter().map(|f| f.qty).sum();
    assert_eq!(total, order.filled_qty);

    h.ledger.check_invariants().await.unwrap();
}

#[tokio::test]
async fn example_buy_leaves_expected_balance_and_position() {
    let h = harness(FeeSchedule::new(dec!(0.99), Decimal::ZERO));
    let account_id = funded_account(&h, dec!(1000.00)).await;
    h.oracle.set_price("AAPL", dec!(175.43));

    let order = h
        .orders
        .submit(OrderRequest::market(
            account_id,
            "AAPL",
            OrderSide::Buy,
            dec!(2),
            "key-1",
        ))
        .await
        .unwrap();
    h.engine.try_execute(order.id).await.unwrap();

    let account = h.ledger.get_account(account_id).await.unwrap();
    assert_eq!(account.balance, dec!(647.15));

    let position = h
        .ledger
        .get_position(account_id, "AAPL")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(position.quantity, dec!(2));
    assert_eq!(position.avg_cost, dec!(175.43));
}

#[tokio::test]
async fn round_trip_realizes_minus_two_fees_and_removes_position() {
    let fee = dec!(0.99);
    let h = harness(FeeSchedule::new(fee, Decimal::ZERO));
    let account_id = funded_account(&h, dec!(1000)).await;
    h.oracle.set_price("AAPL", dec!(175.43));

    let buy = h
        .orders
        .submit(OrderRequest::market(
            account_id,
            "AAPL",
            OrderSide::Buy,
            dec!(2),
            "buy-1",
        ))
        .await
        .unwrap();
    h.engine.try_execute(buy.id).await.unwrap();

    let sell = h
        .orders
        .submit(OrderRequest::market(
            account_id,
            "AAPL",
            OrderSide::Sell,
            dec!(2),
            "sell-1",
        ))
        .await
        .unwrap();
    h.engine.try_execute(sell.id).await.unwrap();

    // Both legs at the same price: P&L is exactly the two commissions
    let realized = h.ledger.realized_pnl(account_id).await.unwrap();
    assert_eq!(realized, -fee * dec!(2));

    // Position removed at zero quantity
    assert!(h
        .ledger
        .get_position(account_id, "AAPL")
        .await
        .unwrap()
        .is_none());

    // Cash is back minus the fees
    let account = h.ledger.get_account(account_id).await.unwrap();
    assert_eq!(account.balance, dec!(1000) - fee * dec!(2));
}

#[tokio::test]
async fn idempotent_submission_creates_one_order_and_one_fill_set() {
    let h = harness(FeeSchedule::free());
    let account_id = funded_account(&h, dec!(1000)).await;
    h.oracle.set_price("AAPL", dec!(100));

    let request = OrderRequest::market(account_id, "AAPL", OrderSide::Buy, dec!(2), "same-key");
    let first = h.orders.submit(request.clone()).await.unwrap();
    h.engine.try_execute(first.id).await.unwrap();

    // Replay after execution: original order, no second execution
    let replay = h.orders.submit(request).await.unwrap();
    assert_eq!(replay.id, first.id);
    assert_eq!(replay.status, OrderStatus::Filled);
    assert_eq!(h.engine.fills_for(first.id).len(), 1);

    let position = h
        .ledger
        .get_position(account_id, "AAPL")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(position.quantity, dec!(2));
}

#[tokio::test]
async fn concurrent_buys_never_overdraw() {
    let h = Arc::new(harness(FeeSchedule::free()));
    // 300 in cash, each order costs 100: exactly three fit
    let account_id = funded_account(&h, dec!(300)).await;
    h.oracle.set_price("AAPL", dec!(10));

    let mut handles = Vec::new();
    for i in 0..5 {
        let h = h.clone();
        handles.push(tokio::spawn(async move {
            let request = OrderRequest::market(
                account_id,
                "AAPL",
                OrderSide::Buy,
                dec!(10),
                format!("key-{}", i),
            );
            match h.orders.submit(request).await {
                Ok(order) => {
                    h.engine.try_execute(order.id).await.unwrap();
                    true
                }
                Err(EngineError::InsufficientFunds { .. }) => false,
                Err(e) => panic!("unexpected error: {}", e),
            }
        }));
    }

    let mut accepted = 0;
    for handle in handles {
        if handle.await.unwrap() {
            accepted += 1;
        }
    }

    assert_eq!(accepted, 3);
    let account = h.ledger.get_account(account_id).await.unwrap();
    assert_eq!(account.balance, Decimal::ZERO);
    h.ledger.check_invariants().await.unwrap();

    let position = h
        .ledger
        .get_position(account_id, "AAPL")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(position.quantity, dec!(30));
}

#[tokio::test]
async fn evaluator_expires_gtd_orders_past_deadline() {
    let h = harness(FeeSchedule::free());
    let account_id = funded_account(&h, dec!(1000)).await;
    h.oracle.set_price("AAPL", dec!(100));

    let deadline = h.clock.now() + ChronoDuration::minutes(30);
    let request = OrderRequest::limit(
        account_id,
        "AAPL",
        OrderSide::Buy,
        dec!(2),
        dec!(90),
        "key-1",
    )
    .expiring_at(deadline);
    let order = h.orders.submit(request).await.unwrap();

    let evaluator = Arc::new(OrderEvaluator::new(
        h.orders.clone(),
        h.engine.clone(),
        h.clock.clone(),
        EvaluatorConfig::default(),
    ));

    // Before the deadline the limit is simply not triggered
    evaluator.run_sweep().await.unwrap();
    assert_eq!(
        h.orders.get_order(order.id).await.unwrap().status,
        OrderStatus::Working
    );

    h.clock.advance(ChronoDuration::hours(1));
    evaluator.run_sweep().await.unwrap();
    let order = h.orders.get_order(order.id).await.unwrap();
    assert_eq!(order.status, OrderStatus::Expired);

    // Reservation released with the expiry
    let account = h.ledger.get_account(account_id).await.unwrap();
    assert_eq!(account.pending, Decimal::ZERO);
}

#[tokio::test]
async fn twap_dispatches_48_slices_summing_exactly() {
    let h = harness(FeeSchedule::free());
    let account_id = funded_account(&h, dec!(20000)).await;
    h.oracle.set_price("VTI", dec!(10));

    let slicer = TwapSlicer::new(
        h.orders.clone(),
        h.engine.clone(),
        h.clock.clone(),
        None,
        h.metrics.clone(),
    );

    let algo = slicer
        .start(
            account_id,
            "VTI",
            OrderSide::Buy,
            dec!(1000),
            ChronoDuration::hours(4),
            ChronoDuration::minutes(5),
        )
        .await
        .unwrap();
    assert_eq!(slicer.remaining_slices(algo.id).await.unwrap(), 48);

    let mut dispatched = 0;
    while slicer.tick(algo.id).await.unwrap().is_some() {
        dispatched += 1;
    }
    assert_eq!(dispatched, 48);

    let algo = slicer.get(algo.id).await.unwrap();
    assert_eq!(algo.filled_qty, dec!(1000));
    assert_eq!(algo.status.as_str(), "completed");

    // Exactly the full quantity landed in the position: no rounding loss
    let position = h
        .ledger
        .get_position(account_id, "VTI")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(position.quantity, dec!(1000));

    let children = slicer.child_order_ids(algo.id).await.unwrap();
    assert_eq!(children.len(), 48);
}

#[tokio::test]
async fn twap_carries_shortfall_forward_and_recovers() {
    let h = harness(FeeSchedule::free());
    let account_id = funded_account(&h, dec!(10000)).await;
    h.oracle.set_price("VTI", dec!(10));

    let slicer = TwapSlicer::new(
        h.orders.clone(),
        h.engine.clone(),
        h.clock.clone(),
        None,
        h.metrics.clone(),
    );
    // 3 slices of 100
    let algo = slicer
        .start(
            account_id,
            "VTI",
            OrderSide::Buy,
            dec!(300),
            ChronoDuration::minutes(15),
            ChronoDuration::minutes(5),
        )
        .await
        .unwrap();

    slicer.tick(algo.id).await.unwrap();

    // Feed dies for the second slice; its quantity must not be lost
    h.oracle.clear_price("VTI");
    slicer.tick(algo.id).await.unwrap();

    // Feed recovers; the final slice carries 200
    h.oracle.set_price("VTI", dec!(10));
    slicer.tick(algo.id).await.unwrap();

    let algo = slicer.get(algo.id).await.unwrap();
    assert_eq!(algo.filled_qty, dec!(300));
    assert_eq!(algo.status.as_str(), "completed");
}

#[tokio::test]
async fn twap_marks_degraded_when_it_cannot_catch_up() {
    let h = harness(FeeSchedule::free());
    let account_id = funded_account(&h, dec!(10000)).await;
    h.oracle.set_price("VTI", dec!(10));

    let slicer = TwapSlicer::new(
        h.orders.clone(),
        h.engine.clone(),
        h.clock.clone(),
        None,
        h.metrics.clone(),
    );
    let algo = slicer
        .start(
            account_id,
            "VTI",
            OrderSide::Buy,
            dec!(300),
            ChronoDuration::minutes(15),
            ChronoDuration::minutes(5),
        )
        .await
        .unwrap();

    slicer.tick(algo.id).await.unwrap();

    // Feed never comes back for the rest of the schedule
    h.oracle.clear_price("VTI");
    slicer.tick(algo.id).await.unwrap();
    slicer.tick(algo.id).await.unwrap();

    let algo = slicer.get(algo.id).await.unwrap();
    assert_eq!(algo.status.as_str(), "degraded");
    assert!(algo.failure_reason.is_some());
    assert_eq!(algo.filled_qty, dec!(100));
}

#[tokio::test]
async fn copy_propagator_isolates_subscriber_failures() {
    let h = harness(FeeSchedule::free());
    let trader = funded_account(&h, dec!(10000)).await;
    let rich_follower = funded_account(&h, dec!(5000)).await;
    let broke_follower = funded_account(&h, dec!(1)).await;
    h.oracle.set_price("AAPL", dec!(100));

    let propagator = CopyTradePropagator::new(h.orders.clone(), h.engine.clone(), h.metrics.clone());
    propagator
        .register_subscription(CopySubscription {
            id: Uuid::new_v4(),
            subscriber_account: rich_follower,
            trader_account: trader,
            copy_amount: dec!(1000),
            active: true,
        })
        .unwrap();
    propagator
        .register_subscription(CopySubscription {
            id: Uuid::new_v4(),
            subscriber_account: broke_follower,
            trader_account: trader,
            copy_amount: dec!(1000),
            active: true,
        })
        .unwrap();

    let order = h
        .orders
        .submit(OrderRequest::market(
            trader,
            "AAPL",
            OrderSide::Buy,
            dec!(10),
            "trader-1",
        ))
        .await
        .unwrap();
    let fill = h.engine.try_execute(order.id).await.unwrap().unwrap();

    let report = propagator.on_fill(&fill).await;
    // copy_qty = 1000 / 100 = 10 for the funded follower
    assert_eq!(report.submitted.len(), 1);
    assert_eq!(report.failures.len(), 1);

    let position = h
        .ledger
        .get_position(rich_follower, "AAPL")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(position.quantity, dec!(10));

    // The broke follower bought nothing and lost nothing
    assert!(h
        .ledger
        .get_position(broke_follower, "AAPL")
        .await
        .unwrap()
        .is_none());
    assert_eq!(
        h.ledger.get_account(broke_follower).await.unwrap().balance,
        dec!(1)
    );
}
