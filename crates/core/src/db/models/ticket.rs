use diesel::prelude::*;
use queuepay_types::{Ticket, TicketStatus};
use tracing::debug;

use crate::db::{PooledConnection, schema::*};

/// Next free ticket number within an establishment (1-based)
pub fn next_number(conn: &mut PooledConnection, establishment_id: Option<&str>) -> QueryResult<i64> {
    let mut query = tickets::table
        .select(diesel::dsl::max(tickets::number))
        .into_boxed();
    query = match establishment_id {
        Some(establishment_id) => query.filter(tickets::establishment_id.eq(establishment_id)),
        None => query.filter(tickets::establishment_id.is_null()),
    };
    let current: Option<i64> = query.get_result(conn)?;
    Ok(current.unwrap_or(0) + 1)
}

pub fn find_ticket(conn: &mut PooledConnection, ticket_id: &str) -> QueryResult<Option<TicketModel>> {
    tickets::table
        .filter(tickets::id.eq(ticket_id))
        .select(TicketModel::as_select())
        .first(conn)
        .optional()
}

pub fn find_by_transaction_id(
    conn: &mut PooledConnection,
    transaction_id: &str,
) -> QueryResult<Option<TicketModel>> {
    tickets::table
        .filter(tickets::transaction_id.eq(transaction_id))
        .order(tickets::created_at.desc())
        .select(TicketModel::as_select())
        .first(conn)
        .optional()
}

pub fn set_status(
    conn: &mut PooledConnection,
    ticket_id: &str,
    status: TicketStatus,
) -> QueryResult<usize> {
    debug!("Setting ticket {} status to {}", ticket_id, status.as_str());
    diesel::update(tickets::table.filter(tickets::id.eq(ticket_id)))
        .set(tickets::status.eq(status.as_str()))
        .execute(conn)
}

#[derive(Debug, Clone, Queryable, Selectable, Identifiable)]
#[diesel(table_name = tickets)]
pub struct TicketModel {
    pub id: String,
    pub establishment_id: Option<String>,
    pub number: i64,
    pub vip: bool,
    pub status: String,
    pub transaction_id: Option<String>,
    pub created_at: i64,
}

impl TryFrom<TicketModel> for Ticket {
    type Error = String;

    fn try_from(model: TicketModel) -> Result<Self, Self::Error> {
        Ok(Ticket {
            status: model.status.parse()?,
            id: model.id,
            establishment_id: model.establishment_id,
            number: model.number,
            vip: model.vip,
            transaction_id: model.transaction_id,
            created_at: model.created_at,
        })
    }
}

#[derive(Insertable)]
#[diesel(table_name = tickets)]
pub struct NewTicket<'a> {
    pub id: &'a str,
    pub establishment_id: Option<&'a str>,
    pub number: i64,
    pub vip: bool,
    pub status: &'a str,
    pub transaction_id: Option<&'a str>,
    pub created_at: i64,
}

impl<'a> NewTicket<'a> {
    pub fn waiting(
        id: &'a str,
        establishment_id: Option<&'a str>,
        number: i64,
        vip: bool,
        transaction_id: Option<&'a str>,
    ) -> Self {
        Self {
            id,
            establishment_id,
            number,
            vip,
            status: TicketStatus::Waiting.as_str(),
            transaction_id,
            created_at: chrono::Utc::now().timestamp_millis(),
        }
    }

    pub fn insert(&self, conn: &mut PooledConnection) -> QueryResult<usize> {
        debug!(
            "Issuing ticket {} #{} (establishment: {:?}, vip: {})",
            self.id, self.number, self.establishment_id, self.vip
        );
        diesel::insert_into(tickets::table)
            .values(self)
            .execute(conn)
    }
}
