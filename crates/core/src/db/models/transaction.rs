use diesel::prelude::*;
use queuepay_types::{Transaction, TransactionStatus, transactions::UnknownTransactionStatus};
use tracing::debug;

use crate::db::{PooledConnection, schema::*};

const PENDING: &str = "PENDING";
const CONFIRMED: &str = "CONFIRMED";

pub fn find_by_transaction_id(
    conn: &mut PooledConnection,
    transaction_id: &str,
) -> QueryResult<Option<TransactionModel>> {
    transactions::table
        .filter(transactions::transaction_id.eq(transaction_id))
        .select(TransactionModel::as_select())
        .first(conn)
        .optional()
}

pub fn find_by_ticket_id(
    conn: &mut PooledConnection,
    ticket_id: &str,
) -> QueryResult<Option<TransactionModel>> {
    transactions::table
        .filter(transactions::ticket_id.eq(ticket_id))
        .order(transactions::created_at.desc())
        .select(TransactionModel::as_select())
        .first(conn)
        .optional()
}

#[derive(Debug, Clone, Queryable, Selectable, Identifiable)]
#[diesel(table_name = transactions)]
#[diesel(primary_key(transaction_id))]
pub struct TransactionModel {
    pub transaction_id: String,
    pub device_id: String,
    pub establishment_id: Option<String>,
    pub amount: f64,
    /// One of PENDING, CONFIRMED, FAILED
    pub status: String,
    pub ticket_id: Option<String>,
    pub error_reason: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
}

impl TryFrom<TransactionModel> for Transaction {
    type Error = UnknownTransactionStatus;

    fn try_from(model: TransactionModel) -> Result<Self, Self::Error> {
        Ok(Transaction {
            status: model.status.parse()?,
            transaction_id: model.transaction_id,
            device_id: model.device_id,
            establishment_id: model.establishment_id,
            amount: model.amount,
            ticket_id: model.ticket_id,
            error_reason: model.error_reason,
            created_at: model.created_at,
            updated_at: model.updated_at,
        })
    }
}

#[derive(Insertable)]
#[diesel(table_name = transactions)]
pub struct NewTransaction<'a> {
    pub transaction_id: &'a str,
    pub device_id: &'a str,
    pub establishment_id: Option<&'a str>,
    pub amount: f64,
    pub status: &'a str,
    pub created_at: i64,
    pub updated_at: i64,
}

impl<'a> NewTransaction<'a> {
    pub fn pending(
        transaction_id: &'a str,
        device_id: &'a str,
        establishment_id: Option<&'a str>,
        amount: f64,
    ) -> Self {
        let timestamp = chrono::Utc::now().timestamp_millis();
        Self {
            transaction_id,
            device_id,
            establishment_id,
            amount,
            status: PENDING,
            created_at: timestamp,
            updated_at: timestamp,
        }
    }

    /// Fails with a unique violation when the transaction id is already taken
    pub fn insert(&self, conn: &mut PooledConnection) -> QueryResult<usize> {
        debug!(
            "Inserting pending transaction {} for device {} (amount: {})",
            self.transaction_id, self.device_id, self.amount
        );
        diesel::insert_into(transactions::table)
            .values(self)
            .execute(conn)
    }
}

/// Which rows a status write may touch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateGuard {
    /// Only rows still PENDING
    Pending,
    /// PENDING rows, or CONFIRMED rows that have no ticket bound yet
    PendingOrUnticketed,
}

#[derive(AsChangeset)]
#[diesel(table_name = transactions)]
pub struct UpdateTransaction<'a> {
    pub status: &'a str,
    pub amount: Option<f64>,
    pub ticket_id: Option<&'a str>,
    pub error_reason: Option<&'a str>,
    pub updated_at: i64,
}

impl<'a> UpdateTransaction<'a> {
    pub fn new(status: TransactionStatus) -> Self {
        Self {
            status: status.as_str(),
            amount: None,
            ticket_id: None,
            error_reason: None,
            updated_at: chrono::Utc::now().timestamp_millis(),
        }
    }

    pub fn with_amount(mut self, amount: Option<f64>) -> Self {
        self.amount = amount;
        self
    }

    pub fn with_ticket_id(mut self, ticket_id: Option<&'a str>) -> Self {
        self.ticket_id = ticket_id;
        self
    }

    pub fn with_error_reason(mut self, reason: Option<&'a str>) -> Self {
        self.error_reason = reason;
        self
    }

    /// Conditional UPDATE; returns the number of rows that passed the guard
    pub fn apply(
        &self,
        conn: &mut PooledConnection,
        transaction_id: &str,
        guard: UpdateGuard,
    ) -> QueryResult<usize> {
        debug!(
            "Updating transaction {} to {} (guard: {:?}, ticket_id: {:?})",
            transaction_id, self.status, guard, self.ticket_id
        );
        let target = transactions::table.filter(transactions::transaction_id.eq(transaction_id));
        match guard {
            UpdateGuard::Pending => diesel::update(target.filter(transactions::status.eq(PENDING)))
                .set(self)
                .execute(conn),
            UpdateGuard::PendingOrUnticketed => diesel::update(
                target.filter(
                    transactions::status.eq(PENDING).or(transactions::status
                        .eq(CONFIRMED)
                        .and(transactions::ticket_id.is_null())),
                ),
            )
            .set(self)
            .execute(conn),
        }
    }
}
