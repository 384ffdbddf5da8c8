//! Wallet balances and the append-only ledger
//!
//! [`Ledger`] is the only writer of `Wallet::balance`. Each accepted change
//! updates the wallet and appends exactly one [`LedgerEntry`] in the same
//! write transaction; a change that would drive the balance below zero is
//! rejected with [`NimbusError::InsufficientBalance`] and writes nothing.
//!
//! The store admits one write transaction at a time, so concurrent changes
//! against the same wallet always apply in some serial order.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use tracing::{debug, info};

use crate::error::{NimbusError, NimbusResult};
use crate::storage::{DatabaseTransaction, Store};
use crate::types::{LedgerEntry, LedgerKind, UserId, Wallet};

/// Amounts are kept to cents.
pub const MONEY_SCALE: u32 = 2;

/// A requested balance mutation
#[derive(Debug, Clone, PartialEq)]
pub struct BalanceChange {
    pub user_id: UserId,
    pub delta: Decimal,
    pub kind: LedgerKind,
    pub order_ref: Option<u64>,
    pub remark: String,
}

impl BalanceChange {
    pub fn recharge(user_id: UserId, amount: Decimal, remark: impl Into<String>) -> Self {
        Self {
            user_id,
            delta: amount,
            kind: LedgerKind::Recharge,
            order_ref: None,
            remark: remark.into(),
        }
    }

    /// A debit of `amount`, stored as a negative delta.
    pub fn consume(user_id: UserId, amount: Decimal, order_ref: Option<u64>, remark: impl Into<String>) -> Self {
        Self {
            user_id,
            delta: -amount,
            kind: LedgerKind::Consume,
            order_ref,
            remark: remark.into(),
        }
    }

    pub fn refund(user_id: UserId, amount: Decimal, order_ref: Option<u64>, remark: impl Into<String>) -> Self {
        Self {
            user_id,
            delta: amount,
            kind: LedgerKind::Refund,
            order_ref,
            remark: remark.into(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Ledger {
    store: Store,
}

impl Ledger {
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    /// Apply `change` in its own write transaction.
    pub async fn change_balance(&self, change: BalanceChange) -> NimbusResult<LedgerEntry> {
        let entry = self
            .store
            .write("change balance", |txn| Self::apply_in(txn, &change, Utc::now()))
            .await?;
        debug!(
            "Ledger entry {} for user {}: {} {} (balance {})",
            entry.id, entry.user_id, entry.kind, entry.delta, entry.balance_after
        );
        Ok(entry)
    }

    /// Apply `change` inside a caller's write transaction.
    ///
    /// The change only becomes visible if the caller commits, which lets
    /// other records be written atomically with the balance mutation.
    pub fn apply_in(txn: &DatabaseTransaction, change: &BalanceChange, now: DateTime<Utc>) -> NimbusResult<LedgerEntry> {
        let delta = change.delta.round_dp(MONEY_SCALE);
        validate_delta(change.kind, delta)?;

        let mut wallet = txn
            .get::<Wallet>(change.user_id)?
            .unwrap_or_else(|| Wallet::empty(change.user_id, now));

        let new_balance = wallet.balance + delta;
        if new_balance < Decimal::ZERO {
            return Err(NimbusError::InsufficientBalance {
                user_id: change.user_id,
                balance: wallet.balance,
                delta,
            });
        }

        wallet.balance = new_balance;
        wallet.updated_at = now;
        txn.put(&wallet)?;

        let mut entry = LedgerEntry {
            id: 0,
            user_id: change.user_id,
            delta,
            kind: change.kind,
            order_ref: change.order_ref,
            remark: change.remark.clone(),
            balance_after: new_balance,
            created_at: now,
        };
        txn.insert_new(&mut entry)?;
        Ok(entry)
    }

    pub async fn balance(&self, user_id: UserId) -> NimbusResult<Decimal> {
        let wallet = self.store.read("read balance", |txn| txn.get::<Wallet>(user_id)).await?;
        Ok(wallet.map(|w| w.balance).unwrap_or(Decimal::ZERO))
    }
}

fn validate_delta(kind: LedgerKind, delta: Decimal) -> NimbusResult<()> {
    let ok = match kind {
        LedgerKind::Recharge | LedgerKind::Refund => delta > Decimal::ZERO,
        LedgerKind::Consume => delta < Decimal::ZERO,
    };
    if ok {
        Ok(())
    } else {
        Err(NimbusError::validation(
            "delta",
            format!("{} has the wrong sign for a {} entry", delta, kind),
        ))
    }
}

/// User-facing wallet operations on top of the [`Ledger`]
#[derive(Debug, Clone)]
pub struct BillingService {
    store: Store,
    ledger: Ledger,
    min_recharge: Decimal,
}

impl BillingService {
    pub fn new(store: Store, ledger: Ledger, min_recharge: Decimal) -> Self {
        Self {
            store,
            ledger,
            min_recharge,
        }
    }

    pub fn ledger(&self) -> &Ledger {
        &self.ledger
    }

    pub async fn recharge(&self, user_id: UserId, amount: Decimal) -> NimbusResult<LedgerEntry> {
        if amount < self.min_recharge {
            return Err(NimbusError::validation(
                "amount",
                format!("recharge amount must be at least {}", self.min_recharge),
            ));
        }
        let entry = self
            .ledger
            .change_balance(BalanceChange::recharge(user_id, amount, "recharge"))
            .await?;
        info!("User {} recharged {} (balance {})", user_id, entry.delta, entry.balance_after);
        Ok(entry)
    }

    pub async fn consume(
        &self,
        user_id: UserId,
        amount: Decimal,
        order_ref: Option<u64>,
        remark: &str,
    ) -> NimbusResult<LedgerEntry> {
        require_positive(amount)?;
        self.ledger
            .change_balance(BalanceChange::consume(user_id, amount, order_ref, remark))
            .await
    }

    pub async fn refund(
        &self,
        user_id: UserId,
        amount: Decimal,
        order_ref: Option<u64>,
        remark: &str,
    ) -> NimbusResult<LedgerEntry> {
        require_positive(amount)?;
        self.ledger
            .change_balance(BalanceChange::refund(user_id, amount, order_ref, remark))
            .await
    }

    /// The user's wallet, or an empty one if nothing was ever recorded.
    pub async fn wallet(&self, user_id: UserId) -> NimbusResult<Wallet> {
        let wallet = self.store.read("read wallet", |txn| txn.get::<Wallet>(user_id)).await?;
        Ok(wallet.unwrap_or_else(|| Wallet::empty(user_id, Utc::now())))
    }

    /// Ledger entries of a user, newest first, optionally bounded in time.
    pub async fn entries(
        &self,
        user_id: UserId,
        from: Option<DateTime<Utc>>,
        to: Option<DateTime<Utc>>,
    ) -> NimbusResult<Vec<LedgerEntry>> {
        let mut entries = self
            .store
            .read("list ledger entries", |txn| {
                txn.scan(|e: &LedgerEntry| {
                    e.user_id == user_id
                        && from.map_or(true, |from| e.created_at >= from)
                        && to.map_or(true, |to| e.created_at <= to)
                })
            })
            .await?;
        entries.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        Ok(entries)
    }
}

fn require_positive(amount: Decimal) -> NimbusResult<()> {
    if amount <= Decimal::ZERO {
        return Err(NimbusError::validation("amount", "amount must be positive"));
    }
    Ok(())
}
