pub mod device;
pub mod ticket;
pub mod transaction;

pub use device::{DeviceHeartbeat, DeviceModel, NewDevice};
pub use ticket::{NewTicket, TicketModel};
pub use transaction::{NewTransaction, TransactionModel, UpdateGuard, UpdateTransaction};
