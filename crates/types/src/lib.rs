//! Wire and domain types shared by the QueuePay server and its CLI.

pub mod devices;
pub mod gateway;
pub mod tickets;
pub mod transactions;

pub use devices::{Device, DeviceStatus, HeartbeatReport, PaymentReport};
pub use gateway::{DeviceEvent, DeviceEventLog, PaymentCommand, SendOutcome};
pub use tickets::{Ticket, TicketStatus, VipTicketTiming};
pub use transactions::{
    Confirmation, ConfirmationSource, ConfirmationStatus, Transaction, TransactionStatus,
};

/// Default values shared between the library configuration and the CLI flags
pub mod defaults {
    pub const GATEWAY_BASE_URL: &str = "http://127.0.0.1:8081";
    pub const GATEWAY_PAYMENT_PATH: &str = "/payment";
    pub const GATEWAY_EVENTS_PATH: &str = "/events";
    pub const GATEWAY_TIMEOUT_MS: u64 = 5_000;
    pub const MAX_RETRIES: u32 = 3;
    pub const RETRY_DELAY_MS: u64 = 1_000;
    pub const CONFIRMATION_POLLS: u32 = 30;
    pub const CONFIRMATION_INTERVAL_MS: u64 = 1_000;
    pub const SERVER_RETRY_MAX: u32 = 3;
    pub const SERVER_RETRY_DELAY_MS: u64 = 500;
    pub const SIGNATURE_TOLERANCE_SECS: i64 = 300;
    pub const PORT: u16 = 8080;
    pub const DATABASE_URL: &str = "queuepay.sqlite";
}

/// Generate a fresh transaction identifier
pub fn new_transaction_id() -> String {
    uuid::Uuid::new_v4().to_string()
}
