use std::sync::Arc;

use queuepay_types::{Ticket, TicketStatus};
use tracing::info;

use crate::db::{DbError, DbManager, DbResult};

/// Issues queue tickets. Used as the ticket step of paid VIP flows.
#[derive(Debug, Clone)]
pub struct TicketIssuer {
    db: Arc<DbManager>,
}

impl TicketIssuer {
    pub fn new(db: Arc<DbManager>) -> Self {
        Self { db }
    }

    /// Take the next number in the establishment's queue. A transaction
    /// that already holds a ticket gets that ticket back.
    pub fn issue_vip_ticket(
        &self,
        establishment_id: Option<&str>,
        transaction_id: Option<&str>,
    ) -> DbResult<Ticket> {
        let ticket = self.db.insert_ticket(establishment_id, true, transaction_id)?;
        info!(
            "Issued VIP ticket {} #{} (establishment: {:?}, transaction: {:?})",
            ticket.id, ticket.number, establishment_id, transaction_id
        );
        Ok(ticket)
    }

    pub fn cancel_ticket(&self, ticket_id: &str) -> DbResult<()> {
        if !self.db.set_ticket_status(ticket_id, TicketStatus::Cancelled)? {
            return Err(DbError::TicketNotFound(ticket_id.to_string()));
        }
        info!("Cancelled ticket {}", ticket_id);
        Ok(())
    }

    pub fn find_ticket(&self, ticket_id: &str) -> DbResult<Option<Ticket>> {
        self.db.find_ticket(ticket_id)
    }

    /// Ticket issued on behalf of `transaction_id`
    pub fn find_ticket_for_transaction(&self, transaction_id: &str) -> DbResult<Option<Ticket>> {
        self.db.find_ticket_by_transaction(transaction_id)
    }
}
