//! Fund transfer flows: deposit settlement gating, withdrawal time-lock and
//! pessimistic hold, and interaction with concurrent order reservations.

use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, TimeZone, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use tally::clock::{Clock, ManualClock};
use tally::domain::{
    DestinationStatus, OrderRequest, OrderSide, TransferDirection, TransferStatus,
    WithdrawalDestination,
};
use tally::engine::{ExecutionEngine, FeeSchedule, OrderStateMachine};
use tally::error::{EngineError, Result};
use tally::ledger::{LedgerApply, LedgerStore};
use tally::notify::{LogNotifier, NotificationSink};
use tally::oracle::{FixedOracle, OracleGateway};
use tally::services::Metrics;
use tally::transfers::{FundTransferService, SettlementGateway, SettlementResult};

/// Settlement stub that accepts everything and hands out sequential refs
struct StubGateway {
    counter: AtomicU32,
}

impl StubGateway {
    fn new() -> Self {
        Self {
            counter: AtomicU32::new(0),
        }
    }
}

#[async_trait]
impl SettlementGateway for StubGateway {
    async fn initiate_transfer(
        &self,
        _account_id: Uuid,
        _direction: TransferDirection,
        _amount: Decimal,
        _destination_id: Option<Uuid>,
    ) -> Result<String> {
        let n = self.counter.fetch_add(1, Ordering::SeqCst);
        Ok(format!("settle-{}", n))
    }
}

struct Harness {
    clock: Arc<ManualClock>,
    ledger: Arc<LedgerStore>,
    oracle: Arc<FixedOracle>,
    orders: Arc<OrderStateMachine>,
    engine: Arc<ExecutionEngine>,
    transfers: FundTransferService,
}

fn harness() -> Harness {
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
        FeeSchedule::free(),
        clock_dyn.clone(),
        None,
        notifier.clone(),
        metrics.clone(),
    ));
    let transfers = FundTransferService::new(
        ledger.clone(),
        Arc::new(StubGateway::new()),
        clock_dyn,
        None,
        notifier,
        metrics,
        ChronoDuration::hours(24),
        Duration::from_millis(200),
    );
    Harness {
        clock,
        ledger,
        oracle,
        orders,
        engine,
        transfers,
    }
}

async fn funded_account(h: &Harness, balance: Decimal) -> Uuid {
    let account = h.ledger.open_account("USD");
    if balance > Decimal::ZERO {
        h.ledger
            .apply(LedgerApply::for_account(account.id).cash(balance))
            .await
            .unwrap();
    }
    account.id
}

fn destination(h: &Harness, account_id: Uuid, approved_hours_ago: i64) -> Uuid {
    let now = h.clock.now();
    let destination = WithdrawalDestination {
        id: Uuid::new_v4(),
        account_id,
        label: "checking".to_string(),
        status: DestinationStatus::Active,
        approved_at: Some(now - ChronoDuration::hours(approved_hours_ago)),
        created_at: now - ChronoDuration::days(7),
    };
    let id = destination.id;
    h.transfers.register_destination(destination);
    id
}

#[tokio::test]
async fn deposited_cash_is_unusable_until_settled() {
    let h = harness();
    let account_id = funded_account(&h, dec!(0)).await;
    h.oracle.set_price("AAPL", dec!(100));

    let transfer = h
        .transfers
        .deposit(account_id, dec!(1000), "bank-1", "dep-1")
        .await
        .unwrap();

    // Unsettled cash cannot back an order reservation
    let result = h
        .orders
        .submit(OrderRequest::market(
            account_id,
            "AAPL",
            OrderSide::Buy,
            dec!(1),
            "buy-1",
        ))
        .await;
    assert!(matches!(result, Err(EngineError::InsufficientFunds { .. })));

    h.transfers
        .on_settlement_result(
            &transfer.settlement_ref.clone().unwrap(),
            SettlementResult::Completed,
        )
        .await
        .unwrap();

    // Settled cash backs the same order
    let order = h
        .orders
        .submit(OrderRequest::market(
            account_id,
            "AAPL",
            OrderSide::Buy,
            dec!(1),
            "buy-2",
        ))
        .await
        .unwrap();
    assert!(h.engine.try_execute(order.id).await.unwrap().is_some());
}

#[tokio::test]
async fn withdrawal_time_lock_boundary() {
    let h = harness();
    let account_id = funded_account(&h, dec!(1000)).await;

    // approved_at + 23h: rejected
    let locked = destination(&h, account_id, 23);
    let result = h
        .transfers
        .withdraw(account_id, dec!(500), locked, "wd-locked")
        .await;
    assert!(matches!(
        result,
        Err(EngineError::DestinationNotEligible(_))
    ));
    assert_eq!(
        h.ledger.get_account(account_id).await.unwrap().balance,
        dec!(1000)
    );

    // approved_at + 25h with sufficient balance: succeeds
    let unlocked = destination(&h, account_id, 25);
    let transfer = h
        .transfers
        .withdraw(account_id, dec!(500), unlocked, "wd-ok")
        .await
        .unwrap();
    assert_eq!(transfer.status, TransferStatus::Pending);
    assert_eq!(
        h.ledger.get_account(account_id).await.unwrap().balance,
        dec!(500)
    );
}

#[tokio::test]
async fn time_lock_opens_as_the_clock_advances() {
    let h = harness();
    let account_id = funded_account(&h, dec!(1000)).await;
    let dest = destination(&h, account_id, 10);

    assert!(h
        .transfers
        .withdraw(account_id, dec!(100), dest, "wd-early")
        .await
        .is_err());

    h.clock.advance(ChronoDuration::hours(15));
    let transfer = h
        .transfers
        .withdraw(account_id, dec!(100), dest, "wd-later")
        .await
        .unwrap();
    assert_eq!(transfer.status, TransferStatus::Pending);
}

#[tokio::test]
async fn held_funds_cannot_back_orders() {
    let h = harness();
    let account_id = funded_account(&h, dec!(1000)).await;
    let dest = destination(&h, account_id, 48);
    h.oracle.set_price("AAPL", dec!(100));

    h.transfers
        .withdraw(account_id, dec!(800), dest, "wd-1")
        .await
        .unwrap();

    // Only 200 remains for trading
    let result = h
        .orders
        .submit(OrderRequest::market(
            account_id,
            "AAPL",
            OrderSide::Buy,
            dec!(3),
            "buy-1",
        ))
        .await;
    assert!(matches!(result, Err(EngineError::InsufficientFunds { .. })));

    let order = h
        .orders
        .submit(OrderRequest::market(
            account_id,
            "AAPL",
            OrderSide::Buy,
            dec!(2),
            "buy-2",
        ))
        .await
        .unwrap();
    assert!(h.engine.try_execute(order.id).await.unwrap().is_some());
    h.ledger.check_invariants().await.unwrap();
}

#[tokio::test]
async fn failed_settlement_restores_the_hold() {
    let h = harness();
    let account_id = funded_account(&h, dec!(1000)).await;
    let dest = destination(&h, account_id, 48);

    let transfer = h
        .transfers
        .withdraw(account_id, dec!(400), dest, "wd-1")
        .await
        .unwrap();
    assert_eq!(
        h.ledger.get_account(account_id).await.unwrap().balance,
        dec!(600)
    );

    let settled = h
        .transfers
        .on_settlement_result(
            &transfer.settlement_ref.clone().unwrap(),
            SettlementResult::Failed {
                reason: "account closed".to_string(),
            },
        )
        .await
        .unwrap();
    assert_eq!(settled.status, TransferStatus::Failed);
    assert_eq!(
        settled.failure_reason.as_deref(),
        Some("account closed")
    );
    assert_eq!(
        h.ledger.get_account(account_id).await.unwrap().balance,
        dec!(1000)
    );
}

#[tokio::test]
async fn completed_withdrawal_stays_debited() {
    let h = harness();
    let account_id = funded_account(&h, dec!(1000)).await;
    let dest = destination(&h, account_id, 48);

    let transfer = h
        .transfers
        .withdraw(account_id, dec!(400), dest, "wd-1")
        .await
        .unwrap();
    let settled = h
        .transfers
        .on_settlement_result(
            &transfer.settlement_ref.clone().unwrap(),
            SettlementResult::Completed,
        )
        .await
        .unwrap();
    assert_eq!(settled.status, TransferStatus::Completed);
    assert_eq!(
        h.ledger.get_account(account_id).await.unwrap().balance,
        dec!(600)
    );
}

#[tokio::test]
async fn transfer_idempotency_keys_dedupe() {
    let h = harness();
    let account_id = funded_account(&h, dec!(1000)).await;
    let dest = destination(&h, account_id, 48);

    let first = h
        .transfers
        .withdraw(account_id, dec!(100), dest, "wd-1")
        .await
        .unwrap();
    let replay = h
        .transfers
        .withdraw(account_id, dec!(100), dest, "wd-1")
        .await
        .unwrap();
    assert_eq!(first.id, replay.id);

    // Only one hold was taken
    assert_eq!(
        h.ledger.get_account(account_id).await.unwrap().balance,
        dec!(900)
    );
}
