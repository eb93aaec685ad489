pub mod api;
pub mod db;
pub mod gateway;
pub mod ledger;
pub mod orchestrator;
pub mod signature;
pub mod tickets;


pub use api::{ApiState, create_router, start_server};
pub use db::{DbError, DbManager};
pub use gateway::{GatewayClient, GatewayConfig, GatewayError};
pub use ledger::TransactionLedger;
pub use orchestrator::{
    OrchestratorConfig, OrchestratorError, PaymentOrchestrator, PaymentOutcome, PaymentRequest,
};
pub use signature::SignatureConfig;
pub use tickets::TicketIssuer;
