//! Fund transfer service.
//!
//! Deposits create a pending transaction and credit the ledger only when the
//! settlement collaborator confirms — cash is never available on submission.
//! Withdrawals validate the destination whitelist and time-lock, then take a
//! pessimistic hold (immediate debit) that settlement failure reverses.

use chrono::Duration as ChronoDuration;
use dashmap::DashMap;
use rust_decimal::Decimal;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{info, warn};
use uuid::Uuid;

use crate::adapters::PostgresStore;
use crate::clock::Clock;
use crate::domain::{
    FundTransaction, TransferDirection, TransferStatus, WithdrawalDestination,
};
use crate::error::{EngineError, Result};
use crate::ledger::{LedgerApply, LedgerStore};
use crate::notify::{dispatch, EngineEvent, NotificationSink};
use crate::services::{inc, Metrics};

use async_trait::async_trait;

/// Settlement collaborator outcome delivered on the inbound webhook
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SettlementResult {
    Completed,
    Failed { reason: String },
}

/// Outbound settlement collaborator
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait SettlementGateway: Send + Sync {
    /// Initiate a transfer with the external provider; returns the
    /// provider's settlement reference.
    async fn initiate_transfer(
        &self,
        account_id: Uuid,
        direction: TransferDirection,
        amount: Decimal,
        destination_id: Option<Uuid>,
    ) -> Result<String>;
}

pub struct FundTransferService {
    ledger: Arc<LedgerStore>,
    gateway: Arc<dyn SettlementGateway>,
    clock: Arc<dyn Clock>,
    store: Option<Arc<PostgresStore>>,
    notifier: Arc<dyn NotificationSink>,
    metrics: Arc<Metrics>,
    transfers: DashMap<Uuid, Arc<RwLock<FundTransaction>>>,
    by_settlement_ref: DashMap<String, Uuid>,
    idempotency: DashMap<(Uuid, String), Uuid>,
    destinations: DashMap<Uuid, WithdrawalDestination>,
    time_lock: ChronoDuration,
    settlement_timeout: Duration,
}

impl FundTransferService {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        ledger: Arc<LedgerStore>,
        gateway: Arc<dyn SettlementGateway>,
        clock: Arc<dyn Clock>,
        store: Option<Arc<PostgresStore>>,
        notifier: Arc<dyn NotificationSink>,
        metrics: Arc<Metrics>,
        time_lock: ChronoDuration,
        settlement_timeout: Duration,
    ) -> Self {
        Self {
            ledger,
            gateway,
            clock,
            store,
            notifier,
            metrics,
            transfers: DashMap::new(),
            by_settlement_ref: DashMap::new(),
            idempotency: DashMap::new(),
            destinations: DashMap::new(),
            time_lock,
            settlement_timeout,
        }
    }

    /// Register a whitelisted destination (admin/KYC flow feeds this)
    pub fn register_destination(&self, destination: WithdrawalDestination) {
        self.destinations.insert(destination.id, destination);
    }

    pub fn get_destination(&self, destination_id: Uuid) -> Option<WithdrawalDestination> {
        self.destinations
            .get(&destination_id)
            .map(|entry| entry.value().clone())
    }

    pub async fn get_transfer(&self, transfer_id: Uuid) -> Result<FundTransaction> {
        let handle = self.handle(transfer_id)?;
        let guard = handle.read().await;
        Ok(guard.clone())
    }

    /// Initiate a deposit. The ledger is credited only when the settlement
    /// collaborator confirms completion.
    pub async fn deposit(
        &self,
        account_id: Uuid,
        amount: Decimal,
        source: &str,
        idempotency_key: &str,
    ) -> Result<FundTransaction> {
        self.validate(amount, idempotency_key)?;
        // Account must exist even though no cash moves yet
        self.ledger.get_account(account_id).await?;

        if let Some(existing) = self.replay(account_id, idempotency_key) {
            return self.get_transfer(existing).await;
        }

        let now = self.clock.now();
        let mut transfer = FundTransaction {
            id: Uuid::new_v4(),
            account_id,
            direction: TransferDirection::Deposit,
            amount,
            external_destination_id: None,
            source: Some(source.to_string()),
            settlement_ref: None,
            status: TransferStatus::Pending,
            failure_reason: None,
            idempotency_key: idempotency_key.to_string(),
            created_at: now,
            updated_at: now,
        };

        let settlement_ref = match self
            .initiate_with_retry(account_id, TransferDirection::Deposit, amount, None, transfer.id)
            .await
        {
            Ok(reference) => reference,
            Err(e) => {
                transfer.status = TransferStatus::Failed;
                transfer.failure_reason = Some(e.to_string());
                self.track(transfer).await;
                inc(&self.metrics.transfers_failed);
                return Err(e);
            }
        };

        transfer.settlement_ref = Some(settlement_ref.clone());
        let transfer = self.track(transfer).await;
        self.by_settlement_ref.insert(settlement_ref, transfer.id);
        self.idempotency
            .insert((account_id, idempotency_key.to_string()), transfer.id);
        inc(&self.metrics.transfers_initiated);
        info!(
            transfer_id = %transfer.id,
            account_id = %account_id,
            amount = %amount,
            "Deposit initiated, awaiting settlement"
        );
        Ok(transfer)
    }

    /// Initiate a withdrawal under whitelist and time-lock constraints.
    ///
    /// The debit is taken before the settlement call (pessimistic hold);
    /// settlement failure credits it back.
    pub async fn withdraw(
        &self,
        account_id: Uuid,
        amount: Decimal,
        destination_id: Uuid,
        idempotency_key: &str,
    ) -> Result<FundTransaction> {
        self.validate(amount, idempotency_key)?;

        if let Some(existing) = self.replay(account_id, idempotency_key) {
            return self.get_transfer(existing).await;
        }

        let now = self.clock.now();
        let destination = self.get_destination(destination_id).ok_or_else(|| {
            EngineError::DestinationNotEligible(format!("unknown destination {}", destination_id))
        })?;
        if destination.account_id != account_id {
            return Err(EngineError::DestinationNotEligible(format!(
                "destination {} belongs to another account",
                destination_id
            )));
        }
        destination
            .check_eligible(now, self.time_lock)
            .map_err(EngineError::DestinationNotEligible)?;

        // Pessimistic hold: atomic debit, InsufficientFunds before mutation
        self.ledger
            .apply(LedgerApply::for_account(account_id).cash(-amount))
            .await?;

        let mut transfer = FundTransaction {
            id: Uuid::new_v4(),
            account_id,
            direction: TransferDirection::Withdrawal,
            amount,
            external_destination_id: Some(destination_id),
            source: None,
            settlement_ref: None,
            status: TransferStatus::Pending,
            failure_reason: None,
            idempotency_key: idempotency_key.to_string(),
            created_at: now,
            updated_at: now,
        };

        let settlement_ref = match self
            .initiate_with_retry(
                account_id,
                TransferDirection::Withdrawal,
                amount,
                Some(destination_id),
                transfer.id,
            )
            .await
        {
            Ok(reference) => reference,
            Err(e) => {
                // Reverse the hold before surfacing the failure
                self.credit_back(account_id, amount).await;
                transfer.status = TransferStatus::Failed;
                transfer.failure_reason = Some(e.to_string());
                self.track(transfer).await;
                inc(&self.metrics.transfers_failed);
                return Err(e);
            }
        };

        transfer.settlement_ref = Some(settlement_ref.clone());
        let transfer = self.track(transfer).await;
        self.by_settlement_ref.insert(settlement_ref, transfer.id);
        self.idempotency
            .insert((account_id, idempotency_key.to_string()), transfer.id);
        inc(&self.metrics.transfers_initiated);
        info!(
            transfer_id = %transfer.id,
            account_id = %account_id,
            amount = %amount,
            destination_id = %destination_id,
            "Withdrawal initiated, hold taken"
        );
        Ok(transfer)
    }

    /// Inbound webhook: the settlement collaborator reports an outcome.
    ///
    /// Replays of an already-settled reference return the current record.
    pub async fn on_settlement_result(
        &self,
        settlement_ref: &str,
        result: SettlementResult,
    ) -> Result<FundTransaction> {
        let transfer_id = self
            .by_settlement_ref
            .get(settlement_ref)
            .map(|entry| *entry.value())
            .ok_or_else(|| EngineError::TransferNotFound(settlement_ref.to_string()))?;

        let handle = self.handle(transfer_id)?;
        let mut guard = handle.write().await;

        if guard.status.is_terminal() {
            return Ok(guard.clone());
        }

        match (&guard.direction, &result) {
            (TransferDirection::Deposit, SettlementResult::Completed) => {
                // Cash becomes available only now
                self.ledger
                    .apply(LedgerApply::for_account(guard.account_id).cash(guard.amount))
                    .await?;
                guard.status = TransferStatus::Completed;
            }
            (TransferDirection::Deposit, SettlementResult::Failed { reason }) => {
                guard.status = TransferStatus::Failed;
                guard.failure_reason = Some(reason.clone());
            }
            (TransferDirection::Withdrawal, SettlementResult::Completed) => {
                // Hold already debited; nothing more to move
                guard.status = TransferStatus::Completed;
            }
            (TransferDirection::Withdrawal, SettlementResult::Failed { reason }) => {
                self.credit_back(guard.account_id, guard.amount).await;
                guard.status = TransferStatus::Failed;
                guard.failure_reason = Some(reason.clone());
            }
        }

        guard.updated_at = self.clock.now();
        let snapshot = guard.clone();
        drop(guard);

        match snapshot.status {
            TransferStatus::Completed => {
                inc(&self.metrics.transfers_completed);
                dispatch(
                    &self.notifier,
                    EngineEvent::TransferCompleted {
                        account_id: snapshot.account_id,
                        transfer_id: snapshot.id,
                    },
                );
            }
            TransferStatus::Failed => {
                inc(&self.metrics.transfers_failed);
                dispatch(
                    &self.notifier,
                    EngineEvent::TransferFailed {
                        account_id: snapshot.account_id,
                        transfer_id: snapshot.id,
                        reason: snapshot
                            .failure_reason
                            .clone()
                            .unwrap_or_else(|| "settlement failed".to_string()),
                    },
                );
            }
            _ => {}
        }

        info!(
            transfer_id = %snapshot.id,
            status = %snapshot.status,
            "Settlement result applied"
        );
        self.persist(&snapshot).await;
        Ok(snapshot)
    }

    /// Cancel a still-pending transfer. A withdrawal cancel reverses the hold.
    pub async fn cancel(&self, transfer_id: Uuid) -> Result<FundTransaction> {
        let handle = self.handle(transfer_id)?;
        let mut guard = handle.write().await;

        if !guard.status.can_transition_to(TransferStatus::Cancelled) {
            return Err(EngineError::InvalidTransition {
                order_id: transfer_id.to_string(),
                status: guard.status.to_string(),
            });
        }

        if guard.direction == TransferDirection::Withdrawal {
            self.credit_back(guard.account_id, guard.amount).await;
        }
        guard.status = TransferStatus::Cancelled;
        guard.updated_at = self.clock.now();
        let snapshot = guard.clone();
        drop(guard);

        self.persist(&snapshot).await;
        Ok(snapshot)
    }

    async fn initiate_with_retry(
        &self,
        account_id: Uuid,
        direction: TransferDirection,
        amount: Decimal,
        destination_id: Option<Uuid>,
        transfer_id: Uuid,
    ) -> Result<String> {
        for attempt in 0..2 {
            match tokio::time::timeout(
                self.settlement_timeout,
                self.gateway
                    .initiate_transfer(account_id, direction, amount, destination_id),
            )
            .await
            {
                Ok(Ok(reference)) => return Ok(reference),
                Ok(Err(e)) if attempt == 0 => {
                    warn!(transfer_id = %transfer_id, "Settlement call failed, retrying once: {}", e);
                }
                Ok(Err(e)) => return Err(e),
                Err(_) if attempt == 0 => {
                    warn!(transfer_id = %transfer_id, "Settlement call timed out, retrying once");
                }
                Err(_) => {
                    return Err(EngineError::SettlementTimeout {
                        transfer_id: transfer_id.to_string(),
                    })
                }
            }
        }
        Err(EngineError::SettlementTimeout {
            transfer_id: transfer_id.to_string(),
        })
    }

    async fn credit_back(&self, account_id: Uuid, amount: Decimal) {
        if let Err(e) = self
            .ledger
            .apply(LedgerApply::for_account(account_id).cash(amount))
            .await
        {
            // Should be unreachable: a credit cannot violate invariants
            warn!(account_id = %account_id, "Failed to reverse hold: {}", e);
        }
    }

    async fn track(&self, transfer: FundTransaction) -> FundTransaction {
        self.persist(&transfer).await;
        let id = transfer.id;
        let snapshot = transfer.clone();
        self.transfers.insert(id, Arc::new(RwLock::new(transfer)));
        snapshot
    }

    async fn persist(&self, transfer: &FundTransaction) {
        if let Some(store) = &self.store {
            if let Err(e) = store.upsert_transfer(transfer).await {
                warn!(transfer_id = %transfer.id, "Failed to persist transfer: {}", e);
            }
        }
    }

    fn handle(&self, transfer_id: Uuid) -> Result<Arc<RwLock<FundTransaction>>> {
        self.transfers
            .get(&transfer_id)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| EngineError::TransferNotFound(transfer_id.to_string()))
    }

    fn replay(&self, account_id: Uuid, idempotency_key: &str) -> Option<Uuid> {
        self.idempotency
            .get(&(account_id, idempotency_key.to_string()))
            .map(|entry| *entry.value())
    }

    fn validate(&self, amount: Decimal, idempotency_key: &str) -> Result<()> {
        if amount <= Decimal::ZERO {
            return Err(EngineError::Validation("amount must be positive".to_string()));
        }
        if idempotency_key.trim().is_empty() {
            return Err(EngineError::Validation(
                "idempotency_key must not be empty".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::domain::DestinationStatus;
    use crate::notify::LogNotifier;
    use chrono::{TimeZone, Utc};
    use rust_decimal_macros::dec;

    struct Harness {
        ledger: Arc<LedgerStore>,
        clock: Arc<ManualClock>,
        service: FundTransferService,
    }

    fn harness(gateway: MockSettlementGateway) -> Harness {
        harness_with_gateway(Arc::new(gateway))
    }

    fn harness_with_gateway(gateway: Arc<dyn SettlementGateway>) -> Harness {
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap(),
        ));
        let clock_dyn: Arc<dyn Clock> = clock.clone();
        let ledger = Arc::new(LedgerStore::new(clock_dyn.clone(), None));
        let notifier: Arc<dyn NotificationSink> = Arc::new(LogNotifier);
        let service = FundTransferService::new(
            ledger.clone(),
            gateway,
            clock_dyn,
            None,
            notifier,
            Arc::new(Metrics::new()),
            ChronoDuration::hours(24),
            Duration::from_millis(200),
        );
        Harness {
            ledger,
            clock,
            service,
        }
    }

    fn confirming_gateway() -> MockSettlementGateway {
        let mut gateway = MockSettlementGateway::new();
        gateway
            .expect_initiate_transfer()
            .returning(|_, _, _, _| Ok(format!("settle-{}", Uuid::new_v4())));
        gateway
    }

    async fn funded_account(h: &Harness, balance: Decimal) -> Uuid {
        let account = h.ledger.open_account("USD");
        h.ledger
            .apply(LedgerApply::for_account(account.id).cash(balance))
            .await
            .unwrap();
        account.id
    }

    fn active_destination(h: &Harness, account_id: Uuid, approved_hours_ago: i64) -> Uuid {
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
        h.service.register_destination(destination);
        id
    }

    #[tokio::test]
    async fn test_deposit_credits_only_on_confirmation() {
        let h = harness(confirming_gateway());
        let account_id = funded_account(&h, dec!(0)).await;

        let transfer = h
            .service
            .deposit(account_id, dec!(500), "bank-1", "dep-1")
            .await
            .unwrap();
        assert_eq!(transfer.status, TransferStatus::Pending);

        // Not a cent before the webhook
        let account = h.ledger.get_account(account_id).await.unwrap();
        assert_eq!(account.balance, dec!(0));

        let reference = transfer.settlement_ref.unwrap();
        let settled = h
            .service
            .on_settlement_result(&reference, SettlementResult::Completed)
            .await
            .unwrap();
        assert_eq!(settled.status, TransferStatus::Completed);

        let account = h.ledger.get_account(account_id).await.unwrap();
        assert_eq!(account.balance, dec!(500));
    }

    #[tokio::test]
    async fn test_deposit_failure_credits_nothing() {
        let h = harness(confirming_gateway());
        let account_id = funded_account(&h, dec!(0)).await;

        let transfer = h
            .service
            .deposit(account_id, dec!(500), "bank-1", "dep-1")
            .await
            .unwrap();
        let reference = transfer.settlement_ref.unwrap();

        let settled = h
            .service
            .on_settlement_result(
                &reference,
                SettlementResult::Failed {
                    reason: "card declined".to_string(),
                },
            )
            .await
            .unwrap();
        assert_eq!(settled.status, TransferStatus::Failed);

        let account = h.ledger.get_account(account_id).await.unwrap();
        assert_eq!(account.balance, dec!(0));
    }

    #[tokio::test]
    async fn test_withdrawal_time_lock_boundaries() {
        let h = harness(confirming_gateway());
        let account_id = funded_account(&h, dec!(1000)).await;

        // Approved 23h ago: rejected, no ledger mutation
        let locked = active_destination(&h, account_id, 23);
        let result = h
            .service
            .withdraw(account_id, dec!(100), locked, "wd-1")
            .await;
        assert!(matches!(
            result,
            Err(EngineError::DestinationNotEligible(_))
        ));
        let account = h.ledger.get_account(account_id).await.unwrap();
        assert_eq!(account.balance, dec!(1000));

        // Approved 25h ago: succeeds, hold debited
        let unlocked = active_destination(&h, account_id, 25);
        let transfer = h
            .service
            .withdraw(account_id, dec!(100), unlocked, "wd-2")
            .await
            .unwrap();
        assert_eq!(transfer.status, TransferStatus::Pending);
        let account = h.ledger.get_account(account_id).await.unwrap();
        assert_eq!(account.balance, dec!(900));
    }

    #[tokio::test]
    async fn test_withdrawal_insufficient_funds_before_mutation() {
        let h = harness(confirming_gateway());
        let account_id = funded_account(&h, dec!(50)).await;
        let destination = active_destination(&h, account_id, 48);

        let result = h
            .service
            .withdraw(account_id, dec!(100), destination, "wd-1")
            .await;
        assert!(matches!(result, Err(EngineError::InsufficientFunds { .. })));

        let account = h.ledger.get_account(account_id).await.unwrap();
        assert_eq!(account.balance, dec!(50));
    }

    #[tokio::test]
    async fn test_withdrawal_settlement_failure_reverses_hold() {
        let h = harness(confirming_gateway());
        let account_id = funded_account(&h, dec!(1000)).await;
        let destination = active_destination(&h, account_id, 48);

        let transfer = h
            .service
            .withdraw(account_id, dec!(300), destination, "wd-1")
            .await
            .unwrap();
        assert_eq!(
            h.ledger.get_account(account_id).await.unwrap().balance,
            dec!(700)
        );

        let reference = transfer.settlement_ref.unwrap();
        let settled = h
            .service
            .on_settlement_result(
                &reference,
                SettlementResult::Failed {
                    reason: "bank bounced it".to_string(),
                },
            )
            .await
            .unwrap();
        assert_eq!(settled.status, TransferStatus::Failed);
        assert_eq!(
            h.ledger.get_account(account_id).await.unwrap().balance,
            dec!(1000)
        );
    }

    #[tokio::test]
    async fn test_deposit_idempotent_replay() {
        let h = harness(confirming_gateway());
        let account_id = funded_account(&h, dec!(0)).await;

        let first = h
            .service
            .deposit(account_id, dec!(500), "bank-1", "dep-1")
            .await
            .unwrap();
        let replay = h
            .service
            .deposit(account_id, dec!(500), "bank-1", "dep-1")
            .await
            .unwrap();
        assert_eq!(first.id, replay.id);
    }

    #[tokio::test]
    async fn test_settlement_webhook_replay_is_tolerant() {
        let h = harness(confirming_gateway());
        let account_id = funded_account(&h, dec!(0)).await;

        let transfer = h
            .service
            .deposit(account_id, dec!(500), "bank-1", "dep-1")
            .await
            .unwrap();
        let reference = transfer.settlement_ref.unwrap();

        h.service
            .on_settlement_result(&reference, SettlementResult::Completed)
            .await
            .unwrap();
        // A repeated webhook must not credit twice
        h.service
            .on_settlement_result(&reference, SettlementResult::Completed)
            .await
            .unwrap();

        let account = h.ledger.get_account(account_id).await.unwrap();
        assert_eq!(account.balance, dec!(500));
    }

    struct StalledGateway;

    #[async_trait]
    impl SettlementGateway for StalledGateway {
        async fn initiate_transfer(
            &self,
            _account_id: Uuid,
            _direction: TransferDirection,
            _amount: Decimal,
            _destination_id: Option<Uuid>,
        ) -> Result<String> {
            tokio::time::sleep(Duration::from_secs(10)).await;
            Ok("never".to_string())
        }
    }

    #[tokio::test]
    async fn test_gateway_timeout_surfaces_and_reverses() {
        let h = harness_with_gateway(Arc::new(StalledGateway));
        let account_id = funded_account(&h, dec!(1000)).await;
        let destination = active_destination(&h, account_id, 48);

        let result = h
            .service
            .withdraw(account_id, dec!(100), destination, "wd-1")
            .await;
        assert!(matches!(result, Err(EngineError::SettlementTimeout { .. })));

        // Hold reversed after the failed initiation
        let account = h.ledger.get_account(account_id).await.unwrap();
        assert_eq!(account.balance, dec!(1000));
    }

    #[tokio::test]
    async fn test_cancel_pending_withdrawal_reverses_hold() {
        let h = harness(confirming_gateway());
        let account_id = funded_account(&h, dec!(1000)).await;
        let destination = active_destination(&h, account_id, 48);

        let transfer = h
            .service
            .withdraw(account_id, dec!(250), destination, "wd-1")
            .await
            .unwrap();
        let cancelled = h.service.cancel(transfer.id).await.unwrap();
        assert_eq!(cancelled.status, TransferStatus::Cancelled);
        assert_eq!(
            h.ledger.get_account(account_id).await.unwrap().balance,
            dec!(1000)
        );

        // Terminal now: a second cancel is a state-machine misuse
        assert!(matches!(
            h.service.cancel(transfer.id).await,
            Err(EngineError::InvalidTransition { .. })
        ));
    }
}
