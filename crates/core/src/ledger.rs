use std::sync::Arc;

use queuepay_types::{PaymentReport, Transaction, TransactionStatus};
use tracing::{debug, info, warn};

use crate::db::{
    DbManager, DbResult, GuardedWrite,
    models::{UpdateGuard, UpdateTransaction},
};

/// Result of the idempotency gate
#[derive(Debug, Clone, PartialEq)]
pub struct PendingRecord {
    pub transaction: Transaction,
    /// Another call created this transaction first
    pub already_exists: bool,
    /// The stored status is CONFIRMED or FAILED
    pub is_final: bool,
}

/// Durable record of payment attempts, keyed by transaction id.
///
/// The only writer of `transactions.status`. Every write goes through a
/// guarded UPDATE, so a terminal row is never overwritten and concurrent
/// writers observe either the old or the new row.
#[derive(Debug, Clone)]
pub struct TransactionLedger {
    db: Arc<DbManager>,
}

impl TransactionLedger {
    pub fn new(db: Arc<DbManager>) -> Self {
        Self { db }
    }

    pub fn db(&self) -> &Arc<DbManager> {
        &self.db
    }

    /// Insert a PENDING row for `transaction_id`, or return the existing one
    pub fn create_pending_if_needed(
        &self,
        transaction_id: &str,
        device_id: &str,
        establishment_id: Option<&str>,
        amount: f64,
    ) -> DbResult<PendingRecord> {
        let (transaction, inserted) =
            self.db
                .insert_pending_transaction(transaction_id, device_id, establishment_id, amount)?;

        if inserted {
            info!(
                "Created pending transaction {} for device {}",
                transaction_id, device_id
            );
        } else {
            debug!(
                "Transaction {} already exists with status {}",
                transaction_id, transaction.status
            );
        }

        Ok(PendingRecord {
            is_final: transaction.is_final(),
            already_exists: !inserted,
            transaction,
        })
    }

    /// Move a PENDING transaction to FAILED. `None` when it does not exist.
    pub fn mark_failed(&self, transaction_id: &str, reason: &str) -> DbResult<Option<GuardedWrite>> {
        let update =
            UpdateTransaction::new(TransactionStatus::Failed).with_error_reason(Some(reason));
        let write = self
            .db
            .update_transaction(transaction_id, &update, UpdateGuard::Pending)?;
        log_write("FAILED", transaction_id, write.as_ref());
        Ok(write)
    }

    /// Fail a transaction whose payment went through but whose ticket could
    /// not be created. Also applies to CONFIRMED rows with no ticket bound.
    pub fn mark_ticket_failed(
        &self,
        transaction_id: &str,
        reason: &str,
    ) -> DbResult<Option<GuardedWrite>> {
        let update =
            UpdateTransaction::new(TransactionStatus::Failed).with_error_reason(Some(reason));
        let write = self.db.update_transaction(
            transaction_id,
            &update,
            UpdateGuard::PendingOrUnticketed,
        )?;
        log_write("FAILED", transaction_id, write.as_ref());
        Ok(write)
    }

    /// Move a transaction to CONFIRMED, binding `ticket_id` when given
    pub fn mark_confirmed(
        &self,
        transaction_id: &str,
        ticket_id: Option<&str>,
    ) -> DbResult<Option<GuardedWrite>> {
        let update = UpdateTransaction::new(TransactionStatus::Confirmed).with_ticket_id(ticket_id);
        let write = self.db.update_transaction(
            transaction_id,
            &update,
            UpdateGuard::PendingOrUnticketed,
        )?;
        log_write("CONFIRMED", transaction_id, write.as_ref());
        Ok(write)
    }

    /// Apply a payment report pushed by a device.
    ///
    /// Only PENDING rows are updated; a report against a final row is
    /// returned with `applied = false`. A ticket id is bound only when the
    /// reported status is CONFIRMED.
    pub fn apply_device_report(&self, report: &PaymentReport) -> DbResult<Option<GuardedWrite>> {
        let status = TransactionStatus::from_report(&report.status);
        let ticket_id = match status {
            TransactionStatus::Confirmed => report.ticket_id.as_deref(),
            _ => None,
        };
        let update = UpdateTransaction::new(status)
            .with_amount(report.amount)
            .with_ticket_id(ticket_id);
        let write = self
            .db
            .update_transaction(&report.transaction_id, &update, UpdateGuard::Pending)?;
        log_write(status.as_str(), &report.transaction_id, write.as_ref());
        Ok(write)
    }

    pub fn find_by_transaction_id(&self, transaction_id: &str) -> DbResult<Option<Transaction>> {
        self.db.find_transaction(transaction_id)
    }

    pub fn find_by_ticket_id(&self, ticket_id: &str) -> DbResult<Option<Transaction>> {
        self.db.find_transaction_by_ticket(ticket_id)
    }
}

fn log_write(target: &str, transaction_id: &str, write: Option<&GuardedWrite>) {
    match write {
        None => warn!("Transaction {} not found, cannot mark {}", transaction_id, target),
        Some(write) if write.applied => {
            info!("Transaction {} marked {}", transaction_id, target)
        }
        Some(write) => debug!(
            "Transaction {} left at {} (requested {})",
            transaction_id, write.transaction.status, target
        ),
    }
}
