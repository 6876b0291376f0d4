//! Ledger store — the single writer of balances and positions.
//!
//! Every mutation to an account's cash or positions goes through [`LedgerStore::apply`],
//! which validates and commits under that account's mutex. All other components
//! (execution engine, transfer service, schedulers) are clients; none of them
//! touch balances directly. Multi-account applies take locks in ascending
//! account-UUID order so two overlapping applies can never deadlock.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::adapters::PostgresStore;
use crate::clock::Clock;
use crate::domain::{CashAccount, Position};
use crate::error::{EngineError, Result};

/// One position mutation inside an atomic apply
#[derive(Debug, Clone, Default)]
pub struct PositionDelta {
    pub symbol: String,
    /// Signed quantity change (buys positive, sells negative)
    pub qty_delta: Decimal,
    /// Fill price; drives avg-cost recomputation on buys and realized P&L
    /// on sells. Absent for pure reservation adjustments.
    pub fill_price: Option<Decimal>,
    /// Quantity to add to the sell reservation
    pub reserve_qty: Decimal,
    /// Quantity to release from the sell reservation
    pub release_qty: Decimal,
}

impl PositionDelta {
    pub fn reserve(symbol: impl Into<String>, qty: Decimal) -> Self {
        Self {
            symbol: symbol.into(),
            reserve_qty: qty,
            ..Default::default()
        }
    }

    pub fn release(symbol: impl Into<String>, qty: Decimal) -> Self {
        Self {
            symbol: symbol.into(),
            release_qty: qty,
            ..Default::default()
        }
    }

    pub fn fill(symbol: impl Into<String>, qty_delta: Decimal, price: Decimal) -> Self {
        Self {
            symbol: symbol.into(),
            qty_delta,
            fill_price: Some(price),
            ..Default::default()
        }
    }
}

/// Atomic mutation request: all deltas commit or none
#[derive(Debug, Clone, Default)]
pub struct LedgerApply {
    pub account_id: Uuid,
    /// Signed cash change
    pub cash_delta: Decimal,
    /// Cash to add to `pending` (validated against available balance)
    pub reserve_cash: Decimal,
    /// Cash to release from `pending`
    pub release_cash: Decimal,
    /// Fee charged by the fill this apply commits, if any
    pub fee: Decimal,
    pub position_deltas: Vec<PositionDelta>,
}

impl LedgerApply {
    pub fn for_account(account_id: Uuid) -> Self {
        Self {
            account_id,
            ..Default::default()
        }
    }

    pub fn cash(mut self, delta: Decimal) -> Self {
        self.cash_delta = delta;
        self
    }

    pub fn reserve(mut self, amount: Decimal) -> Self {
        self.reserve_cash = amount;
        self
    }

    pub fn release(mut self, amount: Decimal) -> Self {
        self.release_cash = amount;
        self
    }

    pub fn fee(mut self, fee: Decimal) -> Self {
        self.fee = fee;
        self
    }

    pub fn position(mut self, delta: PositionDelta) -> Self {
        self.position_deltas.push(delta);
        self
    }
}

/// Committed result of an apply
#[derive(Debug, Clone)]
pub struct LedgerReceipt {
    pub account_id: Uuid,
    pub balance: Decimal,
    pub pending: Decimal,
    pub version: u64,
    /// Realized P&L contributed by this apply (fills only)
    pub realized_pnl: Decimal,
    /// Post-commit state of every position this apply touched
    pub positions: Vec<Position>,
}

/// Full copy of an account's committed state
#[derive(Debug, Clone)]
pub struct AccountSnapshot {
    pub account: CashAccount,
    pub positions: Vec<Position>,
    pub realized_pnl: Decimal,
}

struct AccountShard {
    account: CashAccount,
    positions: HashMap<String, Position>,
    realized_pnl: Decimal,
}

/// Durable holder of cash balances and positions, serialized per account
pub struct LedgerStore {
    shards: DashMap<Uuid, Arc<Mutex<AccountShard>>>,
    clock: Arc<dyn Clock>,
    store: Option<Arc<PostgresStore>>,
}

impl LedgerStore {
    pub fn new(clock: Arc<dyn Clock>, store: Option<Arc<PostgresStore>>) -> Self {
        Self {
            shards: DashMap::new(),
            clock,
            store,
        }
    }

    /// Create an account with a zero balance
    pub fn open_account(&self, currency: &str) -> CashAccount {
        let account = CashAccount::new(Uuid::new_v4(), currency, self.clock.now());
        self.shards.insert(
            account.id,
            Arc::new(Mutex::new(AccountShard {
                account: account.clone(),
                positions: HashMap::new(),
                realized_pnl: Decimal::ZERO,
            })),
        );
        debug!(account_id = %account.id, "Opened account");
        account
    }

    /// Register an account restored from the record store
    pub fn register_account(&self, account: CashAccount, positions: Vec<Position>) {
        let positions = positions
            .into_iter()
            .map(|p| (p.symbol.clone(), p))
            .collect();
        self.shards.insert(
            account.id,
            Arc::new(Mutex::new(AccountShard {
                account,
                positions,
                realized_pnl: Decimal::ZERO,
            })),
        );
    }

    fn shard(&self, account_id: Uuid) -> Result<Arc<Mutex<AccountShard>>> {
        self.shards
            .get(&account_id)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| EngineError::AccountNotFound(account_id.to_string()))
    }

    pub async fn get_account(&self, account_id: Uuid) -> Result<CashAccount> {
        let shard = self.shard(account_id)?;
        let guard = shard.lock().await;
        Ok(guard.account.clone())
    }

    pub async fn get_position(&self, account_id: Uuid, symbol: &str) -> Result<Option<Position>> {
        let shard = self.shard(account_id)?;
        let guard = shard.lock().await;
        Ok(guard.positions.get(symbol).cloned())
    }

    pub async fn realized_pnl(&self, account_id: Uuid) -> Result<Decimal> {
        let shard = self.shard(account_id)?;
        let guard = shard.lock().await;
        Ok(guard.realized_pnl)
    }

    pub async fn snapshot(&self, account_id: Uuid) -> Result<AccountSnapshot> {
        let shard = self.shard(account_id)?;
        let guard = shard.lock().await;
        Ok(AccountSnapshot {
            account: guard.account.clone(),
            positions: guard.positions.values().cloned().collect(),
            realized_pnl: guard.realized_pnl,
        })
    }

    pub fn account_ids(&self) -> Vec<Uuid> {
        self.shards.iter().map(|entry| *entry.key()).collect()
    }

    /// Apply one atomic mutation. Either every delta commits or none does.
    ///
    /// The account lock is held only for validate-and-commit; callers must
    /// finish any external call (price fetch, settlement) before invoking.
    pub async fn apply(&self, apply: LedgerApply) -> Result<LedgerReceipt> {
        let shard = self.shard(apply.account_id)?;
        let mut guard = shard.lock().await;
        let receipt = Self::apply_locked(&mut guard, &apply, self.clock.now())?;
        drop(guard);

        self.write_through(apply.account_id).await;
        Ok(receipt)
    }

    /// Apply several mutations atomically across accounts.
    ///
    /// Locks are taken in ascending account-UUID order; validation runs for
    /// every apply before any commit, so a late failure leaves all accounts
    /// untouched.
    pub async fn apply_many(&self, applies: Vec<LedgerApply>) -> Result<Vec<LedgerReceipt>> {
        let mut account_ids: Vec<Uuid> = applies.iter().map(|a| a.account_id).collect();
        account_ids.sort();
        let before = account_ids.len();
        account_ids.dedup();
        if account_ids.len() != before {
            // One apply per account per batch keeps pre-validation exact
            return Err(EngineError::Validation(
                "duplicate account in batch apply".to_string(),
            ));
        }

        let mut guards: HashMap<Uuid, OwnedMutexGuard<AccountShard>> = HashMap::new();
        for account_id in &account_ids {
            let shard = self.shard(*account_id)?;
            guards.insert(*account_id, shard.lock_owned().await);
        }

        let now = self.clock.now();

        // Validate everything before committing anything
        for apply in &applies {
            let guard = guards
                .get(&apply.account_id)
                .ok_or_else(|| EngineError::AccountNotFound(apply.account_id.to_string()))?;
            Self::validate_locked(guard, apply)?;
        }

        let mut receipts = Vec::with_capacity(applies.len());
        for apply in &applies {
            let guard = guards
                .get_mut(&apply.account_id)
                .ok_or_else(|| EngineError::AccountNotFound(apply.account_id.to_string()))?;
            receipts.push(Self::apply_locked(guard, apply, now)?);
        }
        drop(guards);

        for account_id in account_ids {
            self.write_through(account_id).await;
        }
        Ok(receipts)
    }

    fn validate_locked(shard: &AccountShard, apply: &LedgerApply) -> Result<()> {
        let account = &shard.account;

        if apply.reserve_cash > Decimal::ZERO && account.available() < apply.reserve_cash {
            return Err(EngineError::InsufficientFunds {
                required: apply.reserve_cash,
                available: account.available(),
            });
        }

        let new_balance = account.balance + apply.cash_delta;
        if new_balance < Decimal::ZERO {
            return Err(EngineError::InsufficientFunds {
                required: -apply.cash_delta,
                available: account.balance,
            });
        }

        let new_pending = account.pending + apply.reserve_cash - apply.release_cash;
        if new_pending < Decimal::ZERO {
            return Err(EngineError::ConcurrencyConflict {
                account_id: account.id.to_string(),
                reason: format!("released more than the {} held pending", account.pending),
            });
        }
        // A debit may not eat into cash other reservations still claim
        if new_balance < new_pending {
            return Err(EngineError::InsufficientFunds {
                required: -apply.cash_delta,
                available: account.available(),
            });
        }

        for delta in &apply.position_deltas {
            let position = shard.positions.get(&delta.symbol);
            let (qty, reserved) = position
                .map(|p| (p.quantity, p.reserved))
                .unwrap_or((Decimal::ZERO, Decimal::ZERO));

            if delta.reserve_qty > Decimal::ZERO && qty - reserved < delta.reserve_qty {
                return Err(EngineError::InsufficientPosition {
                    symbol: delta.symbol.clone(),
                    required: delta.reserve_qty,
                    available: qty - reserved,
                });
            }

            let new_qty = qty + delta.qty_delta;
            if new_qty < Decimal::ZERO {
                return Err(EngineError::InsufficientPosition {
                    symbol: delta.symbol.clone(),
                    required: -delta.qty_delta,
                    available: qty,
                });
            }

            let new_reserved = reserved + delta.reserve_qty - delta.release_qty;
            if new_reserved < Decimal::ZERO {
                return Err(EngineError::ConcurrencyConflict {
                    account_id: account.id.to_string(),
                    reason: format!("released more {} than the {} reserved", delta.symbol, reserved),
                });
            }
            // Quantity other sell reservations still claim must survive
            if new_reserved > new_qty {
                return Err(EngineError::InsufficientPosition {
                    symbol: delta.symbol.clone(),
                    required: -delta.qty_delta,
                    available: qty - reserved,
                });
            }
        }

        Ok(())
    }

    fn apply_locked(
        shard: &mut AccountShard,
        apply: &LedgerApply,
        now: DateTime<Utc>,
    ) -> Result<LedgerReceipt> {
        Self::validate_locked(shard, apply)?;

        let account_id = shard.account.id;
        let mut realized = Decimal::ZERO;
        let mut touched = Vec::with_capacity(apply.position_deltas.len());

        for delta in &apply.position_deltas {
            let position = shard
                .positions
                .entry(delta.symbol.clone())
                .or_insert_with(|| Position::new(account_id, delta.symbol.clone(), now));

            if let Some(price) = delta.fill_price {
                if delta.qty_delta > Decimal::ZERO {
                    position.avg_cost = position.blended_avg_cost(delta.qty_delta, price);
                    realized -= apply.fee;
                } else if delta.qty_delta < Decimal::ZERO {
                    realized += (price - position.avg_cost) * -delta.qty_delta - apply.fee;
                }
            }

            position.quantity += delta.qty_delta;
            position.reserved += delta.reserve_qty - delta.release_qty;
            position.updated_at = now;
            touched.push(position.clone());

            if position.quantity.is_zero() && position.reserved.is_zero() {
                shard.positions.remove(&delta.symbol);
            }
        }

        shard.account.balance += apply.cash_delta;
        shard.account.pending += apply.reserve_cash - apply.release_cash;
        shard.account.version += 1;
        shard.account.updated_at = now;
        shard.realized_pnl += realized;

        Ok(LedgerReceipt {
            account_id,
            balance: shard.account.balance,
            pending: shard.account.pending,
            version: shard.account.version,
            realized_pnl: realized,
            positions: touched,
        })
    }

    /// Persist the committed snapshot. Best-effort: the in-memory commit is
    /// authoritative and a record-store failure must not unwind it.
    async fn write_through(&self, account_id: Uuid) {
        let store = match &self.store {
            Some(store) => store.clone(),
            None => return,
        };

        let snapshot = match self.snapshot(account_id).await {
            Ok(snapshot) => snapshot,
            Err(_) => return,
        };

        if let Err(e) = store.save_account_snapshot(&snapshot).await {
            warn!(account_id = %account_id, "Failed to persist account snapshot: {}", e);
        }
    }

    /// Assert the committed-state invariants across every account.
    ///
    /// Test support: walks all shards and returns the first violation.
    pub async fn check_invariants(&self) -> Result<()> {
        for entry in self.shards.iter() {
            let guard = entry.value().lock().await;
            let account = &guard.account;

            if account.balance < Decimal::ZERO {
                return Err(EngineError::Internal(format!(
                    "account {} balance {} is negative",
                    account.id, account.balance
                )));
            }
            if account.pending < Decimal::ZERO || account.pending > account.balance {
                return Err(EngineError::Internal(format!(
                    "account {} pending {} out of range",
                    account.id, account.pending
                )));
            }
            for position in guard.positions.values() {
                if position.quantity < Decimal::ZERO {
                    return Err(EngineError::Internal(format!(
                        "position {}/{} quantity {} is negative",
                        account.id, position.symbol, position.quantity
                    )));
                }
                if position.reserved < Decimal::ZERO || position.reserved > position.quantity {
                    return Err(EngineError::Internal(format!(
                        "position {}/{} reserved {} out of range",
                        account.id, position.symbol, position.reserved
                    )));
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;
    use rust_decimal_macros::dec;

    fn ledger() -> LedgerStore {
        LedgerStore::new(Arc::new(SystemClock), None)
    }

    async fn funded_account(ledger: &LedgerStore, balance: Decimal) -> Uuid {
        let account = ledger.open_account("USD");
        ledger
            .apply(LedgerApply::for_account(account.id).cash(balance))
            .await
            .unwrap();
        account.id
    }

    #[tokio::test]
    async fn test_apply_is_all_or_nothing() {
        let ledger = ledger();
        let account_id = funded_account(&ledger, dec!(100)).await;

        // Cash leg is fine, position leg is not: nothing commits
        let result = ledger
            .apply(
                LedgerApply::for_account(account_id)
                    .cash(dec!(-50))
                    .position(PositionDelta::fill("AAPL", dec!(-1), dec!(50))),
            )
            .await;
        assert!(matches!(
            result,
            Err(EngineError::InsufficientPosition { .. })
        ));

        let account = ledger.get_account(account_id).await.unwrap();
        assert_eq!(account.balance, dec!(100));
    }

    #[tokio::test]
    async fn test_balance_never_negative() {
        let ledger = ledger();
        let account_id = funded_account(&ledger, dec!(100)).await;

        let result = ledger
            .apply(LedgerApply::for_account(account_id).cash(dec!(-100.01)))
            .await;
        assert!(matches!(result, Err(EngineError::InsufficientFunds { .. })));

        ledger
            .apply(LedgerApply::for_account(account_id).cash(dec!(-100)))
            .await
            .unwrap();
        let account = ledger.get_account(account_id).await.unwrap();
        assert_eq!(account.balance, Decimal::ZERO);
    }

    #[tokio::test]
    async fn test_reservation_respects_available() {
        let ledger = ledger();
        let account_id = funded_account(&ledger, dec!(100)).await;

        ledger
            .apply(LedgerApply::for_account(account_id).reserve(dec!(70)))
            .await
            .unwrap();

        // Only 30 available now
        let result = ledger
            .apply(LedgerApply::for_account(account_id).reserve(dec!(31)))
            .await;
        assert!(matches!(result, Err(EngineError::InsufficientFunds { .. })));

        ledger
            .apply(LedgerApply::for_account(account_id).reserve(dec!(30)))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_buy_fill_avg_cost_and_fee_pnl() {
        let ledger = ledger();
        let account_id = funded_account(&ledger, dec!(1000)).await;

        let receipt = ledger
            .apply(
                LedgerApply::for_account(account_id)
                    .cash(dec!(-351.85))
                    .fee(dec!(0.99))
                    .position(PositionDelta::fill("AAPL", dec!(2), dec!(175.43))),
            )
            .await
            .unwrap();

        assert_eq!(receipt.balance, dec!(648.15));
        assert_eq!(receipt.realized_pnl, dec!(-0.99));
        let position = &receipt.positions[0];
        assert_eq!(position.quantity, dec!(2));
        assert_eq!(position.avg_cost, dec!(175.43));
    }

    #[tokio::test]
    async fn test_sell_fill_realizes_pnl_and_clears_position() {
        let ledger = ledger();
        let account_id = funded_account(&ledger, dec!(1000)).await;

        ledger
            .apply(
                LedgerApply::for_account(account_id)
                    .cash(dec!(-200))
                    .position(PositionDelta::fill("AAPL", dec!(2), dec!(100))),
            )
            .await
            .unwrap();

        let receipt = ledger
            .apply(
                LedgerApply::for_account(account_id)
                    .cash(dec!(240))
                    .fee(dec!(1))
                    .position(PositionDelta::fill("AAPL", dec!(-2), dec!(120))),
            )
            .await
            .unwrap();

        // (120 - 100) * 2 - 1 = 39
        assert_eq!(receipt.realized_pnl, dec!(39));
        assert!(ledger
            .get_position(account_id, "AAPL")
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_apply_many_all_or_nothing_across_accounts() {
        let ledger = ledger();
        let a = funded_account(&ledger, dec!(100)).await;
        let b = funded_account(&ledger, dec!(10)).await;

        let result = ledger
            .apply_many(vec![
                LedgerApply::for_account(a).cash(dec!(-50)),
                LedgerApply::for_account(b).cash(dec!(-20)),
            ])
            .await;
        assert!(result.is_err());

        assert_eq!(ledger.get_account(a).await.unwrap().balance, dec!(100));
        assert_eq!(ledger.get_account(b).await.unwrap().balance, dec!(10));
    }

    #[tokio::test]
    async fn test_concurrent_debits_linearize() {
        let ledger = Arc::new(ledger());
        let account_id = funded_account(&ledger, dec!(100)).await;

        let mut handles = Vec::new();
        for _ in 0..10 {
            let ledger = ledger.clone();
            handles.push(tokio::spawn(async move {
                ledger
                    .apply(LedgerApply::for_account(account_id).cash(dec!(-30)))
                    .await
                    .is_ok()
            }));
        }

        let mut succeeded = 0;
        for handle in handles {
            if handle.await.unwrap() {
                succeeded += 1;
            }
        }

        // 100 / 30 fits exactly three debits
        assert_eq!(succeeded, 3);
        let account = ledger.get_account(account_id).await.unwrap();
        assert_eq!(account.balance, dec!(10));
        ledger.check_invariants().await.unwrap();
    }

    #[tokio::test]
    async fn test_version_bumps_on_commit() {
        let ledger = ledger();
        let account_id = funded_account(&ledger, dec!(100)).await;

        let before = ledger.get_account(account_id).await.unwrap().version;
        ledger
            .apply(LedgerApply::for_account(account_id).cash(dec!(1)))
            .await
            .unwrap();
        let after = ledger.get_account(account_id).await.unwrap().version;
        assert_eq!(after, before + 1);
    }
}
