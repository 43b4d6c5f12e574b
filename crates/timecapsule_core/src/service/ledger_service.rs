//! Credit ledger use-case service.
//!
//! # Responsibility
//! - Debit, refund and grant credits with exactly-once semantics.
//! - Re-derive the balance cache from the append-only log.
//!
//! # Invariants
//! - A debit is one conditional decrement; concurrent debits can never drive
//!   a balance negative.
//! - Replaying an idempotency key returns the original entry and writes
//!   nothing; replaying it with different parameters is a conflict.
//! - A refund removes the delivery's debit links in the same transaction that
//!   credits them back, so a second refund finds nothing and is a no-op.
//! - Only a delivery that ended without sending (`Canceled`, `Deleted`,
//!   `FailedTerminal`) can be refunded.

use crate::model::delivery::{DeliveryId, DeliveryStatus};
use crate::model::ledger::{CreditBalances, CreditDebit, CreditType, LedgerEntry, LedgerReason};
use crate::repo::delivery_repo::{DeliveryRepository, SqliteDeliveryRepository};
use crate::repo::ledger_repo::{LedgerRepository, SqliteLedgerRepository};
use crate::repo::RepoError;
use crate::time::Clock;
use chrono::{DateTime, Utc};
use log::{info, warn};
use rusqlite::{Connection, Transaction, TransactionBehavior};
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("insufficient {} credits: requested {requested}, available {available}", .credit_type.as_str())]
    InsufficientCredits {
        credit_type: CreditType,
        requested: i64,
        available: i64,
    },
    #[error("idempotency key `{0}` was already used with different parameters")]
    IdempotencyConflict(String),
    #[error("credit amount must be positive, got {0}")]
    InvalidAmount(i64),
    #[error("user id must not be blank")]
    BlankUser,
    #[error("`{}` is not a refund reason", .0.as_str())]
    InvalidRefundReason(LedgerReason),
    #[error("delivery {delivery_id} is {} and cannot be refunded", .status.as_str())]
    RefundNotAllowed {
        delivery_id: DeliveryId,
        status: DeliveryStatus,
    },
    #[error(transparent)]
    Repo(#[from] RepoError),
}

impl From<rusqlite::Error> for LedgerError {
    fn from(value: rusqlite::Error) -> Self {
        Self::Repo(value.into())
    }
}

/// Parameters of one debit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DebitRequest {
    pub user_id: String,
    pub credit_type: CreditType,
    pub amount: i64,
    pub related_delivery: Option<DeliveryId>,
    pub idempotency_key: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RefundOutcome {
    Refunded(Vec<LedgerEntry>),
    /// Nothing left to refund.
    NoOp,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BalanceDrift {
    pub user_id: String,
    pub credit_type: CreditType,
    pub cached: Option<i64>,
    pub derived: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    pub checked: usize,
    pub drifted: Vec<BalanceDrift>,
    pub repaired: bool,
}

pub struct LedgerService<'conn, C: Clock> {
    conn: &'conn Connection,
    clock: C,
}

impl<'conn, C: Clock> LedgerService<'conn, C> {
    pub fn new(conn: &'conn Connection, clock: C) -> Self {
        Self { conn, clock }
    }

    /// Debits credits outside of any scheduling flow.
    pub fn debit(&self, request: &DebitRequest) -> Result<LedgerEntry, LedgerError> {
        let now = self.clock.now();
        let tx = Transaction::new_unchecked(self.conn, TransactionBehavior::Immediate)?;
        let entry = debit_in(&tx, request, now)?;
        tx.commit()?;
        Ok(entry)
    }

    /// Credits back whatever still funds a delivery that ended unsent.
    ///
    /// # Errors
    /// - `InvalidRefundReason` unless `reason` is cancel, delete or refund.
    /// - `RefundNotAllowed` while the delivery is still live or was sent.
    pub fn refund(
        &self,
        delivery_id: DeliveryId,
        reason: LedgerReason,
    ) -> Result<RefundOutcome, LedgerError> {
        if !reason.is_refund() {
            return Err(LedgerError::InvalidRefundReason(reason));
        }

        let now = self.clock.now();
        let tx = Transaction::new_unchecked(self.conn, TransactionBehavior::Immediate)?;
        let delivery = SqliteDeliveryRepository::try_new(&tx)?
            .get_delivery(delivery_id)?
            .ok_or(RepoError::NotFound {
                entity: "delivery",
                id: delivery_id,
            })?;
        if !matches!(
            delivery.status,
            DeliveryStatus::Canceled | DeliveryStatus::Deleted | DeliveryStatus::FailedTerminal
        ) {
            warn!(
                "event=ledger_refund module=ledger status=rejected delivery_id={} delivery_status={}",
                delivery_id,
                delivery.status.as_str()
            );
            return Err(LedgerError::RefundNotAllowed {
                delivery_id,
                status: delivery.status,
            });
        }
        let outcome = refund_in(&tx, delivery_id, &delivery.owner_id, reason, now)?;
        tx.commit()?;
        Ok(outcome)
    }

    /// Records credits purchased through the payment collaborator.
    pub fn grant(
        &self,
        user_id: &str,
        credit_type: CreditType,
        amount: i64,
        idempotency_key: &str,
    ) -> Result<LedgerEntry, LedgerError> {
        let user_id = user_id.trim();
        if user_id.is_empty() {
            return Err(LedgerError::BlankUser);
        }
        if amount <= 0 {
            return Err(LedgerError::InvalidAmount(amount));
        }

        let now = self.clock.now();
        let tx = Transaction::new_unchecked(self.conn, TransactionBehavior::Immediate)?;
        let repo = SqliteLedgerRepository::try_new(&tx)?;

        if let Some(existing) = repo.find_entry_by_key(idempotency_key)? {
            let same = existing.user_id == user_id
                && existing.credit_type == credit_type
                && existing.delta == amount
                && existing.reason == LedgerReason::Purchase;
            if !same {
                return Err(LedgerError::IdempotencyConflict(idempotency_key.to_string()));
            }
            return Ok(existing);
        }

        let entry = LedgerEntry {
            id: Uuid::new_v4(),
            user_id: user_id.to_string(),
            credit_type,
            delta: amount,
            reason: LedgerReason::Purchase,
            related_delivery_id: None,
            idempotency_key: Some(idempotency_key.to_string()),
            created_at: now,
        };
        repo.insert_entry(&entry)?;
        repo.increment_balance(user_id, credit_type, amount, now)?;
        tx.commit()?;

        info!(
            "event=ledger_grant module=ledger status=ok credit_type={} amount={}",
            credit_type.as_str(),
            amount
        );
        Ok(entry)
    }

    pub fn balance(&self, user_id: &str, credit_type: CreditType) -> Result<i64, LedgerError> {
        Ok(SqliteLedgerRepository::try_new(self.conn)?.balance(user_id, credit_type)?)
    }

    pub fn balances(&self, user_id: &str) -> Result<CreditBalances, LedgerError> {
        let repo = SqliteLedgerRepository::try_new(self.conn)?;
        let mut balances = CreditBalances::default();
        for credit_type in CreditType::ALL {
            balances.set(credit_type, repo.balance(user_id, credit_type)?);
        }
        Ok(balances)
    }

    pub fn entries_for_user(&self, user_id: &str) -> Result<Vec<LedgerEntry>, LedgerError> {
        Ok(SqliteLedgerRepository::try_new(self.conn)?.entries_for_user(user_id)?)
    }

    /// Compares the balance cache with the log and optionally rewrites it.
    pub fn reconcile_balances(&self, repair: bool) -> Result<ReconcileReport, LedgerError> {
        let now = self.clock.now();
        let tx = Transaction::new_unchecked(self.conn, TransactionBehavior::Immediate)?;
        let repo = SqliteLedgerRepository::try_new(&tx)?;

        let snapshots = repo.balance_snapshots()?;
        let mut report = ReconcileReport {
            checked: snapshots.len(),
            drifted: Vec::new(),
            repaired: false,
        };
        for snapshot in snapshots {
            if snapshot.cached == Some(snapshot.derived) {
                continue;
            }
            warn!(
                "event=ledger_reconcile module=ledger status=drift credit_type={} cached={:?} derived={}",
                snapshot.credit_type.as_str(),
                snapshot.cached,
                snapshot.derived
            );
            if repair {
                repo.overwrite_balance(
                    &snapshot.user_id,
                    snapshot.credit_type,
                    snapshot.derived.max(0),
                    now,
                )?;
            }
            report.drifted.push(BalanceDrift {
                user_id: snapshot.user_id,
                credit_type: snapshot.credit_type,
                cached: snapshot.cached,
                derived: snapshot.derived,
            });
        }

        report.repaired = repair && !report.drifted.is_empty();
        tx.commit()?;
        info!(
            "event=ledger_reconcile module=ledger status=ok checked={} drifted={} repaired={}",
            report.checked,
            report.drifted.len(),
            report.repaired
        );
        Ok(report)
    }
}

/// Debits inside the caller's transaction.
pub(crate) fn debit_in(
    conn: &Connection,
    request: &DebitRequest,
    now: DateTime<Utc>,
) -> Result<LedgerEntry, LedgerError> {
    if request.user_id.trim().is_empty() {
        return Err(LedgerError::BlankUser);
    }
    if request.amount <= 0 {
        return Err(LedgerError::InvalidAmount(request.amount));
    }

    let repo = SqliteLedgerRepository::try_new(conn)?;

    if let Some(key) = request.idempotency_key.as_deref() {
        if let Some(existing) = repo.find_entry_by_key(key)? {
            let same = existing.user_id == request.user_id
                && existing.credit_type == request.credit_type
                && existing.delta == -request.amount
                && existing.related_delivery_id == request.related_delivery;
            if !same {
                return Err(LedgerError::IdempotencyConflict(key.to_string()));
            }
            return Ok(existing);
        }
    }

    if !repo.try_decrement_balance(&request.user_id, request.credit_type, request.amount, now)? {
        let available = repo.balance(&request.user_id, request.credit_type)?;
        info!(
            "event=ledger_debit module=ledger status=rejected credit_type={} requested={} available={}",
            request.credit_type.as_str(),
            request.amount,
            available
        );
        return Err(LedgerError::InsufficientCredits {
            credit_type: request.credit_type,
            requested: request.amount,
            available,
        });
    }

    let entry = LedgerEntry {
        id: Uuid::new_v4(),
        user_id: request.user_id.clone(),
        credit_type: request.credit_type,
        delta: -request.amount,
        reason: LedgerReason::Schedule,
        related_delivery_id: request.related_delivery,
        idempotency_key: request.idempotency_key.clone(),
        created_at: now,
    };
    repo.insert_entry(&entry)?;

    if let Some(delivery_id) = request.related_delivery {
        repo.link_debit(
            delivery_id,
            &CreditDebit {
                credit_type: request.credit_type,
                amount: request.amount,
                ledger_entry_id: entry.id,
            },
        )?;
    }

    Ok(entry)
}

/// Refunds inside the caller's transaction.
pub(crate) fn refund_in(
    conn: &Connection,
    delivery_id: DeliveryId,
    owner_id: &str,
    reason: LedgerReason,
    now: DateTime<Utc>,
) -> Result<RefundOutcome, LedgerError> {
    let repo = SqliteLedgerRepository::try_new(conn)?;
    let debits = repo.debits_for_delivery(delivery_id)?;
    if debits.is_empty() {
        return Ok(RefundOutcome::NoOp);
    }
    repo.remove_debits(delivery_id)?;

    let mut entries = Vec::with_capacity(debits.len());
    for debit in debits {
        let entry = LedgerEntry {
            id: Uuid::new_v4(),
            user_id: owner_id.to_string(),
            credit_type: debit.credit_type,
            delta: debit.amount,
            reason,
            related_delivery_id: Some(delivery_id),
            idempotency_key: Some(format!(
                "refund-{delivery_id}-{}",
                debit.credit_type.as_str()
            )),
            created_at: now,
        };
        repo.insert_entry(&entry)?;
        repo.increment_balance(owner_id, debit.credit_type, debit.amount, now)?;
        entries.push(entry);
    }

    info!(
        "event=ledger_refund module=ledger status=ok delivery_id={} reason={} entries={}",
        delivery_id,
        reason.as_str(),
        entries.len()
    );
    Ok(RefundOutcome::Refunded(entries))
}
