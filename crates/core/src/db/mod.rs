use std::time::Duration;

use diesel::{
    Connection,
    r2d2::{ConnectionManager, Pool},
    result::{DatabaseErrorKind, Error as DieselError},
};
use diesel_migrations::{EmbeddedMigrations, MigrationHarness, embed_migrations};
use queuepay_types::{Device, DeviceStatus, HeartbeatReport, Ticket, TicketStatus, Transaction};
use tracing::debug;

pub mod models;
pub mod schema;

use models::{
    DeviceHeartbeat, NewDevice, NewTicket, NewTransaction, UpdateGuard, UpdateTransaction,
};

pub const MIGRATIONS: EmbeddedMigrations = embed_migrations!("./src/db/migrations");

#[cfg(feature = "sqlite")]
type DbConnection = diesel::sqlite::SqliteConnection;
#[cfg(all(feature = "postgres", not(feature = "sqlite")))]
type DbConnection = diesel::pg::PgConnection;

pub type PooledConnection = diesel::r2d2::PooledConnection<ConnectionManager<DbConnection>>;

pub type DbPool = Pool<ConnectionManager<DbConnection>>;

#[derive(Debug)]
pub struct DbManager {
    pool: DbPool,
}

pub type DbResult<T> = Result<T, DbError>;
#[derive(Debug, thiserror::Error)]
pub enum DbError {
    #[error("Database connection error: {0}")]
    ConnectionError(String),
    #[error("Database migration error: {0}")]
    MigrationError(#[from] Box<dyn std::error::Error + Send + Sync>),
    #[error("Failed to insert transaction: {0}")]
    InsertTxError(DieselError),
    #[error("Failed to find transaction: {0}")]
    FindTxError(DieselError),
    #[error("Failed to update transaction: {0}")]
    UpdateTxError(DieselError),
    #[error("Failed to insert device: {0}")]
    InsertDeviceError(DieselError),
    #[error("Failed to find device: {0}")]
    FindDeviceError(DieselError),
    #[error("Failed to update device: {0}")]
    UpdateDeviceError(DieselError),
    #[error("Failed to find ticket: {0}")]
    FindTicketError(DieselError),
    #[error("Failed to issue ticket: {0}")]
    InsertTicketError(DieselError),
    #[error("Failed to update ticket: {0}")]
    UpdateTicketError(DieselError),
    #[error("Ticket {0} not found")]
    TicketNotFound(String),
    #[error("Corrupt row: {0}")]
    CorruptRow(String),
}

/// Result of a conditional transaction write
#[derive(Debug, Clone, PartialEq)]
pub struct GuardedWrite {
    /// Row as stored after the write attempt
    pub transaction: Transaction,
    /// Whether the row passed the guard and was modified
    pub applied: bool,
}

fn run_migrations(conn: &mut PooledConnection) -> Result<(), DbError> {
    conn.run_pending_migrations(MIGRATIONS)?;
    Ok(())
}

fn is_unique_violation(error: &DieselError) -> bool {
    matches!(
        error,
        DieselError::DatabaseError(DatabaseErrorKind::UniqueViolation, _)
    )
}

fn to_transaction(model: models::TransactionModel) -> DbResult<Transaction> {
    Transaction::try_from(model).map_err(|e| DbError::CorruptRow(e.to_string()))
}

fn to_device(model: models::DeviceModel) -> DbResult<Device> {
    Device::try_from(model).map_err(|e| DbError::CorruptRow(e.to_string()))
}

impl DbManager {
    pub fn local(database_url: &str) -> DbResult<Self> {
        debug!("Establishing connection to database at {}", database_url);
        let manager = ConnectionManager::<DbConnection>::new(database_url);
        // Every in-memory SQLite connection is its own database
        let in_memory = database_url == ":memory:";
        let pool = Pool::builder()
            .max_size(if in_memory { 1 } else { 10 })
            .idle_timeout(if in_memory { None } else { Some(Duration::from_secs(600)) })
            .max_lifetime(if in_memory { None } else { Some(Duration::from_secs(1800)) })
            .build(manager)
            .map_err(|e| DbError::ConnectionError(e.to_string()))?;

        let mut pooled_connection = pool
            .get()
            .map_err(|e| DbError::ConnectionError(e.to_string()))?;

        debug!("Running database migrations...");
        run_migrations(&mut pooled_connection)?;
        Ok(Self { pool })
    }

    fn conn(&self) -> DbResult<PooledConnection> {
        self.pool
            .get()
            .map_err(|e| DbError::ConnectionError(e.to_string()))
    }

    /// Insert a PENDING row unless `transaction_id` is already taken.
    ///
    /// Returns the stored row and whether this call inserted it. Relies on the
    /// primary key, so concurrent callers cannot both insert.
    pub fn insert_pending_transaction(
        &self,
        transaction_id: &str,
        device_id: &str,
        establishment_id: Option<&str>,
        amount: f64,
    ) -> DbResult<(Transaction, bool)> {
        let mut conn = self.conn()?;

        let new_transaction =
            NewTransaction::pending(transaction_id, device_id, establishment_id, amount);
        let inserted = match new_transaction.insert(&mut conn) {
            Ok(_) => true,
            Err(e) if is_unique_violation(&e) => {
                debug!(
                    "Transaction {} already exists (idempotent insert)",
                    transaction_id
                );
                false
            }
            Err(e) => return Err(DbError::InsertTxError(e)),
        };

        let model = models::transaction::find_by_transaction_id(&mut conn, transaction_id)
            .map_err(DbError::FindTxError)?
            .ok_or_else(|| {
                DbError::CorruptRow(format!("transaction {} vanished", transaction_id))
            })?;
        Ok((to_transaction(model)?, inserted))
    }

    pub fn find_transaction(&self, transaction_id: &str) -> DbResult<Option<Transaction>> {
        let mut conn = self.conn()?;
        models::transaction::find_by_transaction_id(&mut conn, transaction_id)
            .map_err(DbError::FindTxError)?
            .map(to_transaction)
            .transpose()
    }

    pub fn find_transaction_by_ticket(&self, ticket_id: &str) -> DbResult<Option<Transaction>> {
        let mut conn = self.conn()?;
        models::transaction::find_by_ticket_id(&mut conn, ticket_id)
            .map_err(DbError::FindTxError)?
            .map(to_transaction)
            .transpose()
    }

    /// Apply `update` if the row passes `guard`, then read it back in the
    /// same database transaction. `None` when the transaction does not exist.
    pub fn update_transaction(
        &self,
        transaction_id: &str,
        update: &UpdateTransaction<'_>,
        guard: UpdateGuard,
    ) -> DbResult<Option<GuardedWrite>> {
        let mut conn = self.conn()?;
        let result = conn
            .transaction::<_, DieselError, _>(|conn| {
                let applied = update.apply(conn, transaction_id, guard)? > 0;
                let model = models::transaction::find_by_transaction_id(conn, transaction_id)?;
                Ok(model.map(|model| (model, applied)))
            })
            .map_err(DbError::UpdateTxError)?;

        result
            .map(|(model, applied)| {
                Ok(GuardedWrite {
                    transaction: to_transaction(model)?,
                    applied,
                })
            })
            .transpose()
    }

    /// Returns `false` when a device with this id is already registered
    pub fn insert_device(
        &self,
        device_id: &str,
        secret_key: &str,
        establishment_id: Option<&str>,
        firmware_version: Option<&str>,
    ) -> DbResult<bool> {
        let mut conn = self.conn()?;
        let new_device =
            NewDevice::disabled(device_id, secret_key, establishment_id, firmware_version);
        match new_device.insert(&mut conn) {
            Ok(_) => Ok(true),
            Err(e) if is_unique_violation(&e) => Ok(false),
            Err(e) => Err(DbError::InsertDeviceError(e)),
        }
    }

    pub fn find_device(&self, device_id: &str) -> DbResult<Option<Device>> {
        let mut conn = self.conn()?;
        models::device::find_device(&mut conn, device_id)
            .map_err(DbError::FindDeviceError)?
            .map(to_device)
            .transpose()
    }

    pub fn set_device_status(&self, device_id: &str, status: DeviceStatus) -> DbResult<bool> {
        let mut conn = self.conn()?;
        models::device::set_status(&mut conn, device_id, status)
            .map(|rows| rows > 0)
            .map_err(DbError::UpdateDeviceError)
    }

    pub fn touch_device(&self, device_id: &str, seen_at: i64) -> DbResult<()> {
        let mut conn = self.conn()?;
        models::device::touch(&mut conn, device_id, seen_at).map_err(DbError::UpdateDeviceError)?;
        Ok(())
    }

    pub fn record_heartbeat(&self, device_id: &str, report: &HeartbeatReport) -> DbResult<()> {
        let mut conn = self.conn()?;
        DeviceHeartbeat::from_report(report)
            .update(&mut conn, device_id)
            .map_err(DbError::UpdateDeviceError)?;
        Ok(())
    }

    /// Allocate the next number in the establishment's queue and store the ticket.
    ///
    /// A transaction holds at most one ticket: when one was already issued for
    /// `transaction_id`, that ticket is returned instead.
    pub fn insert_ticket(
        &self,
        establishment_id: Option<&str>,
        vip: bool,
        transaction_id: Option<&str>,
    ) -> DbResult<Ticket> {
        let mut conn = self.conn()?;
        let ticket_id = uuid::Uuid::new_v4().to_string();
        let inserted = conn.transaction::<_, DieselError, _>(|conn| {
            let number = models::ticket::next_number(conn, establishment_id)?;
            NewTicket::waiting(&ticket_id, establishment_id, number, vip, transaction_id)
                .insert(conn)?;
            models::ticket::find_ticket(conn, &ticket_id)?.ok_or(DieselError::NotFound)
        });
        let model = match (inserted, transaction_id) {
            (Ok(model), _) => model,
            (Err(e), Some(transaction_id)) if is_unique_violation(&e) => {
                debug!("Transaction {} already holds a ticket", transaction_id);
                models::ticket::find_by_transaction_id(&mut conn, transaction_id)
                    .map_err(DbError::FindTicketError)?
                    .ok_or(DbError::InsertTicketError(e))?
            }
            (Err(e), _) => return Err(DbError::InsertTicketError(e)),
        };
        Ticket::try_from(model).map_err(DbError::CorruptRow)
    }

    pub fn find_ticket(&self, ticket_id: &str) -> DbResult<Option<Ticket>> {
        let mut conn = self.conn()?;
        models::ticket::find_ticket(&mut conn, ticket_id)
            .map_err(DbError::FindTicketError)?
            .map(|model| Ticket::try_from(model).map_err(DbError::CorruptRow))
            .transpose()
    }

    pub fn find_ticket_by_transaction(&self, transaction_id: &str) -> DbResult<Option<Ticket>> {
        let mut conn = self.conn()?;
        models::ticket::find_by_transaction_id(&mut conn, transaction_id)
            .map_err(DbError::FindTicketError)?
            .map(|model| Ticket::try_from(model).map_err(DbError::CorruptRow))
            .transpose()
    }

    pub fn set_ticket_status(&self, ticket_id: &str, status: TicketStatus) -> DbResult<bool> {
        let mut conn = self.conn()?;
        models::ticket::set_status(&mut conn, ticket_id, status)
            .map(|rows| rows > 0)
            .map_err(DbError::UpdateTicketError)
    }
}
