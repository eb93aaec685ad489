//! Payment-gated ticket issuance
//!
//! Every flow passes through the ledger's idempotency gate before the device
//! is contacted. A transaction that is already settled is answered from the
//! ledger; one that is still in flight is waited on, never re-sent.

use std::{fmt::Display, future::Future, time::Duration};

use queuepay_types::{
    Confirmation, ConfirmationSource, ConfirmationStatus, PaymentCommand, SendOutcome, Ticket,
    TicketStatus, Transaction, TransactionStatus, VipTicketTiming, defaults, new_transaction_id,
};
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use crate::{
    db::{DbError, GuardedWrite},
    gateway::GatewayClient,
    ledger::TransactionLedger,
    tickets::TicketIssuer,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrchestratorConfig {
    /// Attempts at creating a ticket once payment is confirmed
    pub server_retry_max: u32,
    pub server_retry_delay_ms: u64,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            server_retry_max: defaults::SERVER_RETRY_MAX,
            server_retry_delay_ms: defaults::SERVER_RETRY_DELAY_MS,
        }
    }
}

impl OrchestratorConfig {
    pub fn with_server_retries(mut self, max: u32, delay_ms: u64) -> Self {
        self.server_retry_max = max;
        self.server_retry_delay_ms = delay_ms;
        self
    }

    fn retry_delay(&self, attempt: u32) -> Duration {
        Duration::from_millis(self.server_retry_delay_ms.saturating_mul(attempt as u64))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaymentRequest {
    /// Generated when absent
    #[serde(default)]
    pub transaction_id: Option<String>,
    pub device_id: String,
    #[serde(default)]
    pub establishment_id: Option<String>,
    pub amount: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OutcomeCode {
    /// Duplicate submission answered from the ledger
    TransactionAlreadyFinal,
    Esp32SendFailed,
    PaymentNotConfirmed,
    /// Payment was taken but no ticket could be issued
    TicketCreateFailed,
}

impl OutcomeCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutcomeCode::TransactionAlreadyFinal => "TRANSACTION_ALREADY_FINAL",
            OutcomeCode::Esp32SendFailed => "ESP32_SEND_FAILED",
            OutcomeCode::PaymentNotConfirmed => "PAYMENT_NOT_CONFIRMED",
            OutcomeCode::TicketCreateFailed => "TICKET_CREATE_FAILED",
        }
    }

    /// Prefix `detail` with the code, as stored in `error_reason`
    fn reason(&self, detail: impl Display) -> String {
        format!("{}: {}", self.as_str(), detail)
    }
}

/// What the caller of a payment flow is told
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaymentOutcome {
    pub confirmed: bool,
    pub status: TransactionStatus,
    pub transaction_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<OutcomeCode>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ticket_id: Option<String>,
    /// The device collected the money, whether or not a ticket exists
    pub payment_taken: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub esp32: Option<SendOutcome>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub confirmation: Option<Confirmation>,
}

impl PaymentOutcome {
    fn from_transaction(transaction: &Transaction) -> Self {
        let ticket_failed = transaction
            .error_reason
            .as_deref()
            .is_some_and(|reason| reason.starts_with(OutcomeCode::TicketCreateFailed.as_str()));
        let confirmed = transaction.status == TransactionStatus::Confirmed;
        Self {
            confirmed,
            status: transaction.status,
            transaction_id: transaction.transaction_id.clone(),
            code: None,
            ticket_id: transaction.ticket_id.clone(),
            payment_taken: confirmed || ticket_failed,
            error: transaction.error_reason.clone(),
            esp32: None,
            confirmation: None,
        }
    }

    fn replayed(transaction: &Transaction) -> Self {
        let mut outcome = Self::from_transaction(transaction);
        outcome.code = Some(OutcomeCode::TransactionAlreadyFinal);
        outcome.confirmation = Some(Confirmation::new(
            transaction.status.into(),
            ConfirmationSource::TransactionDb,
        ));
        outcome
    }

    /// Outcome of a flow that ran without a ticket step
    fn settled(transaction: &Transaction, confirmation: Option<Confirmation>) -> Self {
        let mut outcome = Self::from_transaction(transaction);
        if transaction.status == TransactionStatus::Pending {
            outcome.error = confirmation.as_ref().and_then(|c| c.reason.clone());
        }
        if !outcome.confirmed {
            outcome.code = Some(OutcomeCode::PaymentNotConfirmed);
        }
        outcome.confirmation = confirmation;
        outcome
    }
}

/// Handed to the ticket-creation function of a paid flow
#[derive(Debug, Clone, PartialEq)]
pub struct TicketRequest {
    pub transaction_id: String,
    pub device_id: String,
    pub establishment_id: Option<String>,
}

impl From<&Transaction> for TicketRequest {
    fn from(transaction: &Transaction) -> Self {
        Self {
            transaction_id: transaction.transaction_id.clone(),
            device_id: transaction.device_id.clone(),
            establishment_id: transaction.establishment_id.clone(),
        }
    }
}

/// Anything a ticket-creation function may return
pub trait IssuedTicket {
    fn ticket_id(&self) -> Option<&str>;
}

impl IssuedTicket for Ticket {
    fn ticket_id(&self) -> Option<&str> {
        Some(&self.id)
    }
}

impl IssuedTicket for String {
    fn ticket_id(&self) -> Option<&str> {
        Some(self)
    }
}

impl<T: IssuedTicket> IssuedTicket for Option<T> {
    fn ticket_id(&self) -> Option<&str> {
        self.as_ref().and_then(IssuedTicket::ticket_id)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    #[error("Invalid payment request: {0}")]
    InvalidRequest(String),
    #[error("Failed to create transaction {0}: {1}")]
    TransactionCreateFailed(String, DbError),
    #[error("Failed to update transaction {0}: {1}")]
    LedgerWriteFailed(String, DbError),
    #[error("Transaction {0} is missing from the ledger")]
    TransactionMissing(String),
}

impl OrchestratorError {
    pub fn code(&self) -> &'static str {
        match self {
            OrchestratorError::InvalidRequest(_) => "INVALID_REQUEST",
            OrchestratorError::TransactionCreateFailed(..) => "TRANSACTION_CREATE_FAILED",
            OrchestratorError::LedgerWriteFailed(..) => "TRANSACTION_UPDATE_FAILED",
            OrchestratorError::TransactionMissing(_) => "TRANSACTION_NOT_FOUND",
        }
    }
}

enum Gate {
    /// Answered without contacting the device
    Settled(PaymentOutcome),
    /// Row that was already in flight, resolved by waiting on it
    Resumed {
        transaction: Transaction,
        confirmation: Confirmation,
    },
    /// Freshly created PENDING row owned by this call
    Open(Transaction),
}

/// Confirmed, but no ticket bound yet
fn awaits_ticket(transaction: &Transaction) -> bool {
    transaction.status == TransactionStatus::Confirmed && transaction.ticket_id.is_none()
}

struct Collected {
    esp32: SendOutcome,
    confirmation: Option<Confirmation>,
    transaction: Transaction,
}

impl Collected {
    fn into_outcome(self) -> PaymentOutcome {
        let send_failed = !self.esp32.sent;
        let mut outcome = PaymentOutcome::settled(&self.transaction, self.confirmation);
        if send_failed && self.transaction.status == TransactionStatus::Failed {
            outcome.code = Some(OutcomeCode::Esp32SendFailed);
        }
        outcome.esp32 = Some(self.esp32);
        outcome
    }
}

#[derive(Debug, Clone)]
pub struct PaymentOrchestrator {
    gateway: GatewayClient,
    ledger: TransactionLedger,
    config: OrchestratorConfig,
}

impl PaymentOrchestrator {
    pub fn new(gateway: GatewayClient, ledger: TransactionLedger, config: OrchestratorConfig) -> Self {
        Self {
            gateway,
            ledger,
            config,
        }
    }

    pub fn ledger(&self) -> &TransactionLedger {
        &self.ledger
    }

    pub fn gateway(&self) -> &GatewayClient {
        &self.gateway
    }

    /// Collect a VIP payment without binding a ticket
    pub async fn process_vip_payment(
        &self,
        request: PaymentRequest,
    ) -> Result<PaymentOutcome, OrchestratorError> {
        match self.open(request).await? {
            Gate::Settled(outcome) => Ok(outcome),
            Gate::Resumed {
                transaction,
                confirmation,
            } => Ok(PaymentOutcome::settled(&transaction, Some(confirmation))),
            Gate::Open(transaction) => Ok(self.collect_payment(&transaction).await?.into_outcome()),
        }
    }

    /// Collect a VIP payment, then create a ticket with `create_ticket` and
    /// bind it to the transaction.
    ///
    /// `create_ticket` runs only after the payment is confirmed and is
    /// retried on its own; an error or a ticket without an id counts as a
    /// failed attempt. It is skipped when a ticket is already bound, and also
    /// runs for an in-flight transaction this call found confirmed, so it
    /// must hand back the existing ticket when asked twice for one
    /// transaction.
    pub async fn process_vip_payment_with_ticket<F, Fut, T, E>(
        &self,
        request: PaymentRequest,
        mut create_ticket: F,
    ) -> Result<PaymentOutcome, OrchestratorError>
    where
        F: FnMut(TicketRequest) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        T: IssuedTicket,
        E: Display,
    {
        let (transaction, esp32, confirmation) = match self.open(request).await? {
            Gate::Settled(outcome) => return Ok(outcome),
            Gate::Resumed {
                transaction,
                confirmation,
            } => {
                if !awaits_ticket(&transaction) {
                    return Ok(PaymentOutcome::settled(&transaction, Some(confirmation)));
                }
                (transaction, None, Some(confirmation))
            }
            Gate::Open(transaction) => {
                let collected = self.collect_payment(&transaction).await?;
                if !awaits_ticket(&collected.transaction) {
                    return Ok(collected.into_outcome());
                }
                (collected.transaction, Some(collected.esp32), collected.confirmation)
            }
        };

        let transaction_id = transaction.transaction_id.as_str();
        let ticket_request = TicketRequest::from(&transaction);
        let mut outcome = match self
            .create_ticket_with_retry(&ticket_request, &mut create_ticket)
            .await
        {
            Ok(ticket_id) => {
                let transaction = self.write(transaction_id, |ledger| {
                    ledger.mark_confirmed(transaction_id, Some(ticket_id.as_str()))
                })?;
                if transaction.ticket_id.as_deref() != Some(ticket_id.as_str()) {
                    warn!(
                        "Ticket {} could not be bound to transaction {} (status: {})",
                        ticket_id, transaction_id, transaction.status
                    );
                }
                PaymentOutcome::from_transaction(&transaction)
            }
            Err(detail) => {
                let reason = OutcomeCode::TicketCreateFailed.reason(&detail);
                error!(
                    "Payment for transaction {} was taken but no ticket could be issued: {}",
                    transaction_id, detail
                );
                let transaction = self.write(transaction_id, |ledger| {
                    ledger.mark_ticket_failed(transaction_id, &reason)
                })?;
                let mut outcome = PaymentOutcome::from_transaction(&transaction);
                if transaction.status == TransactionStatus::Failed {
                    outcome.code = Some(OutcomeCode::TicketCreateFailed);
                }
                outcome
            }
        };
        outcome.esp32 = esp32;
        outcome.confirmation = confirmation;
        Ok(outcome)
    }

    /// Issue the ticket first, then collect the payment. The ticket is bound
    /// on confirmation and cancelled when the payment fails.
    pub async fn process_vip_payment_ticket_first(
        &self,
        request: PaymentRequest,
        issuer: &TicketIssuer,
    ) -> Result<PaymentOutcome, OrchestratorError> {
        let transaction = match self.open(request).await? {
            Gate::Settled(outcome) => return Ok(outcome),
            Gate::Resumed {
                transaction,
                confirmation,
            } => return self.settle_issued_ticket(transaction, confirmation, issuer),
            Gate::Open(transaction) => transaction,
        };
        let transaction_id = transaction.transaction_id.as_str();

        let ticket = match issuer
            .issue_vip_ticket(transaction.establishment_id.as_deref(), Some(transaction_id))
        {
            Ok(ticket) => ticket,
            Err(e) => {
                let reason = OutcomeCode::TicketCreateFailed.reason(&e);
                error!("Could not issue ticket for transaction {}: {}", transaction_id, e);
                let transaction =
                    self.write(transaction_id, |ledger| ledger.mark_failed(transaction_id, &reason))?;
                let mut outcome = PaymentOutcome::from_transaction(&transaction);
                outcome.code = Some(OutcomeCode::TicketCreateFailed);
                outcome.payment_taken = false;
                return Ok(outcome);
            }
        };

        let collected = self.collect_payment(&transaction).await?;
        match collected.transaction.status {
            TransactionStatus::Confirmed => {
                let bound = self.write(transaction_id, |ledger| {
                    ledger.mark_confirmed(transaction_id, Some(ticket.id.as_str()))
                })?;
                Ok(Collected {
                    transaction: bound,
                    ..collected
                }
                .into_outcome())
            }
            TransactionStatus::Failed => {
                if let Err(e) = issuer.cancel_ticket(&ticket.id) {
                    error!(
                        "Failed to cancel ticket {} of failed transaction {}: {}",
                        ticket.id, transaction_id, e
                    );
                }
                Ok(collected.into_outcome())
            }
            TransactionStatus::Pending => {
                warn!(
                    "Ticket {} stays unbound while transaction {} is unconfirmed",
                    ticket.id, transaction_id
                );
                Ok(collected.into_outcome())
            }
        }
    }

    /// Bind or cancel the ticket issued by an earlier call whose payment was
    /// still unconfirmed when it returned
    fn settle_issued_ticket(
        &self,
        transaction: Transaction,
        confirmation: Confirmation,
        issuer: &TicketIssuer,
    ) -> Result<PaymentOutcome, OrchestratorError> {
        let transaction_id = transaction.transaction_id.as_str();
        let pending_ticket = match transaction.status {
            TransactionStatus::Pending => None,
            _ if transaction.ticket_id.is_some() => None,
            _ => issuer
                .find_ticket_for_transaction(transaction_id)
                .map_err(|e| OrchestratorError::LedgerWriteFailed(transaction_id.to_string(), e))?
                .filter(|ticket| ticket.status == TicketStatus::Waiting),
        };
        let Some(ticket) = pending_ticket else {
            return Ok(PaymentOutcome::settled(&transaction, Some(confirmation)));
        };

        let transaction = match transaction.status {
            TransactionStatus::Confirmed => self.write(transaction_id, |ledger| {
                ledger.mark_confirmed(transaction_id, Some(ticket.id.as_str()))
            })?,
            _ => {
                if let Err(e) = issuer.cancel_ticket(&ticket.id) {
                    error!(
                        "Failed to cancel ticket {} of failed transaction {}: {}",
                        ticket.id, transaction_id, e
                    );
                }
                transaction
            }
        };
        Ok(PaymentOutcome::settled(&transaction, Some(confirmation)))
    }

    /// Run the VIP flow matching `timing`, using `issuer` as the ticket step
    pub async fn process_with_timing(
        &self,
        request: PaymentRequest,
        timing: VipTicketTiming,
        issuer: &TicketIssuer,
    ) -> Result<PaymentOutcome, OrchestratorError> {
        match timing {
            VipTicketTiming::AfterPayment => {
                self.process_vip_payment_with_ticket(request, |ticket: TicketRequest| {
                    let issuer = issuer.clone();
                    async move {
                        issuer.issue_vip_ticket(
                            ticket.establishment_id.as_deref(),
                            Some(ticket.transaction_id.as_str()),
                        )
                    }
                })
                .await
            }
            VipTicketTiming::BeforePayment => {
                self.process_vip_payment_ticket_first(request, issuer).await
            }
        }
    }

    /// The idempotency gate shared by every flow
    async fn open(&self, request: PaymentRequest) -> Result<Gate, OrchestratorError> {
        if request.device_id.trim().is_empty() {
            return Err(OrchestratorError::InvalidRequest(
                "device_id is required".to_string(),
            ));
        }
        if !request.amount.is_finite() || request.amount <= 0.0 {
            return Err(OrchestratorError::InvalidRequest(format!(
                "amount must be positive, got {}",
                request.amount
            )));
        }

        let transaction_id = request
            .transaction_id
            .filter(|id| !id.trim().is_empty())
            .unwrap_or_else(new_transaction_id);
        let record = self
            .ledger
            .create_pending_if_needed(
                &transaction_id,
                &request.device_id,
                request.establishment_id.as_deref(),
                request.amount,
            )
            .map_err(|e| OrchestratorError::TransactionCreateFailed(transaction_id.clone(), e))?;

        if record.is_final {
            info!(
                "Transaction {} already settled as {}, replaying outcome",
                transaction_id, record.transaction.status
            );
            return Ok(Gate::Settled(PaymentOutcome::replayed(&record.transaction)));
        }

        if record.already_exists {
            info!(
                "Transaction {} is already in flight, waiting for its resolution",
                transaction_id
            );
            let confirmation = self
                .gateway
                .wait_transaction_confirmation(&transaction_id)
                .await;
            let transaction = self.record_confirmation(&transaction_id, &confirmation)?;
            return Ok(Gate::Resumed {
                transaction,
                confirmation,
            });
        }

        Ok(Gate::Open(record.transaction))
    }

    /// Send the payment command and settle the ledger from its outcome
    async fn collect_payment(&self, transaction: &Transaction) -> Result<Collected, OrchestratorError> {
        let transaction_id = transaction.transaction_id.as_str();
        let command = PaymentCommand {
            transaction_id: transaction.transaction_id.clone(),
            device_id: transaction.device_id.clone(),
            establishment_id: transaction.establishment_id.clone(),
            amount: transaction.amount,
            vip: true,
        };

        let esp32 = self.gateway.send_payment(&command).await;
        if !esp32.sent {
            let reason = OutcomeCode::Esp32SendFailed
                .reason(esp32.error.as_deref().unwrap_or("no reply from device"));
            error!(
                "Could not deliver payment command for transaction {}: {}",
                transaction_id, reason
            );
            let transaction =
                self.write(transaction_id, |ledger| ledger.mark_failed(transaction_id, &reason))?;
            return Ok(Collected {
                esp32,
                confirmation: None,
                transaction,
            });
        }

        let confirmation = match self.gateway.confirmation_from_reply(&esp32) {
            Some(confirmation) if confirmation.is_terminal() => {
                info!(
                    "Device answered transaction {} synchronously with {:?}",
                    transaction_id, confirmation.status
                );
                confirmation
            }
            _ => {
                self.gateway
                    .wait_transaction_confirmation(transaction_id)
                    .await
            }
        };
        let transaction = self.record_confirmation(transaction_id, &confirmation)?;

        Ok(Collected {
            esp32,
            confirmation: Some(confirmation),
            transaction,
        })
    }

    /// Write a terminal confirmation to the ledger and return the stored row.
    /// Inconclusive confirmations leave the row untouched.
    fn record_confirmation(
        &self,
        transaction_id: &str,
        confirmation: &Confirmation,
    ) -> Result<Transaction, OrchestratorError> {
        match confirmation.status {
            ConfirmationStatus::Confirmed => {
                self.write(transaction_id, |ledger| ledger.mark_confirmed(transaction_id, None))
            }
            ConfirmationStatus::Failed => {
                let reason = OutcomeCode::PaymentNotConfirmed.reason("payment failed on device");
                self.write(transaction_id, |ledger| ledger.mark_failed(transaction_id, &reason))
            }
            ConfirmationStatus::Pending | ConfirmationStatus::Unknown => self
                .ledger
                .find_by_transaction_id(transaction_id)
                .map_err(|e| OrchestratorError::LedgerWriteFailed(transaction_id.to_string(), e))?
                .ok_or_else(|| OrchestratorError::TransactionMissing(transaction_id.to_string())),
        }
    }

    fn write<W>(&self, transaction_id: &str, write: W) -> Result<Transaction, OrchestratorError>
    where
        W: FnOnce(&TransactionLedger) -> Result<Option<GuardedWrite>, DbError>,
    {
        write(&self.ledger)
            .map_err(|e| OrchestratorError::LedgerWriteFailed(transaction_id.to_string(), e))?
            .map(|write| write.transaction)
            .ok_or_else(|| OrchestratorError::TransactionMissing(transaction_id.to_string()))
    }

    async fn create_ticket_with_retry<F, Fut, T, E>(
        &self,
        request: &TicketRequest,
        create_ticket: &mut F,
    ) -> Result<String, String>
    where
        F: FnMut(TicketRequest) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        T: IssuedTicket,
        E: Display,
    {
        let max_attempts = self.config.server_retry_max.max(1);
        let mut last_error = String::new();

        for attempt in 1..=max_attempts {
            match create_ticket(request.clone()).await {
                Ok(ticket) => match ticket.ticket_id() {
                    Some(ticket_id) if !ticket_id.trim().is_empty() => {
                        info!(
                            "Created ticket {} for transaction {} (attempt {})",
                            ticket_id, request.transaction_id, attempt
                        );
                        return Ok(ticket_id.to_string());
                    }
                    _ => last_error = "ticket was created without an id".to_string(),
                },
                Err(e) => last_error = e.to_string(),
            }

            warn!(
                "Ticket creation for transaction {} failed (attempt {}/{}): {}",
                request.transaction_id, attempt, max_attempts, last_error
            );
            if attempt < max_attempts {
                tokio::time::sleep(self.config.retry_delay(attempt)).await;
            }
        }

        Err(last_error)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        Arc,
        atomic::{AtomicU32, Ordering},
    };

    use queuepay_types::PaymentReport;
    use serde_json::json;

    use super::*;
    use crate::{
        db::DbManager,
        gateway::GatewayConfig,
        test::fake_device::FakeDevice,
    };

    struct Harness {
        device: FakeDevice,
        ledger: TransactionLedger,
        issuer: TicketIssuer,
        orchestrator: PaymentOrchestrator,
    }

    async fn harness() -> Harness {
        harness_with_confirmation(3, 10).await
    }

    async fn harness_with_confirmation(polls: u32, interval_ms: u64) -> Harness {
        let device = FakeDevice::start().await;
        let db = Arc::new(DbManager::local(":memory:").unwrap());
        let ledger = TransactionLedger::new(db.clone());
        let gateway_config = GatewayConfig::default()
            .with_base_url(device.base_url.clone())
            .with_timeout_ms(1_000)
            .with_retries(3, 10)
            .with_confirmation(polls, interval_ms);
        let gateway = GatewayClient::new(gateway_config, ledger.clone()).unwrap();
        let orchestrator = PaymentOrchestrator::new(
            gateway,
            ledger.clone(),
            OrchestratorConfig::default().with_server_retries(3, 10),
        );
        Harness {
            device,
            ledger,
            issuer: TicketIssuer::new(db),
            orchestrator,
        }
    }

    fn request(transaction_id: &str) -> PaymentRequest {
        PaymentRequest {
            transaction_id: Some(transaction_id.to_string()),
            device_id: "dev-1".to_string(),
            establishment_id: Some("est-1".to_string()),
            amount: 50.0,
        }
    }

    #[tokio::test]
    async fn test_duplicate_submission_replays_settled_outcome() {
        let h = harness().await;
        h.device.reply_with(json!({"payment_status": "PAID"}));

        let first = h.orchestrator.process_vip_payment(request("tx-1")).await.unwrap();
        assert!(first.confirmed);
        assert_eq!(first.code, None);

        let second = h.orchestrator.process_vip_payment(request("tx-1")).await.unwrap();
        assert_eq!(second.code, Some(OutcomeCode::TransactionAlreadyFinal));
        assert_eq!(second.confirmed, first.confirmed);
        assert_eq!(second.status, first.status);
        assert_eq!(second.transaction_id, "tx-1");
        assert_eq!(h.device.payment_calls(), 1);
    }

    #[tokio::test]
    async fn test_generated_transaction_id_is_sent_to_device() {
        let h = harness().await;
        h.device.reply_with(json!({"payment_status": "PAID"}));
        let request = PaymentRequest {
            transaction_id: None,
            ..request("ignored")
        };

        let outcome = h.orchestrator.process_vip_payment(request).await.unwrap();

        assert!(outcome.confirmed);
        let commands = h.device.commands();
        assert_eq!(commands.len(), 1);
        assert_eq!(commands[0]["transaction_id"], json!(outcome.transaction_id));
        assert_eq!(commands[0]["vip"], json!(true));
        assert_eq!(commands[0]["amount"], json!(50.0));
    }

    #[tokio::test]
    async fn test_transient_send_failures_settle_once() {
        let h = harness().await;
        h.device.fail_next_payments(2);
        h.device.reply_with(json!({"payment_status": "PAID"}));

        let outcome = h.orchestrator.process_vip_payment(request("tx-1")).await.unwrap();

        assert!(outcome.confirmed);
        assert_eq!(outcome.esp32.unwrap().attempts, 3);
        assert_eq!(h.device.payment_calls(), 3);
        let stored = h.ledger.find_by_transaction_id("tx-1").unwrap().unwrap();
        assert_eq!(stored.status, TransactionStatus::Confirmed);
    }

    #[tokio::test]
    async fn test_send_failure_marks_failed_without_polling() {
        let h = harness().await;
        h.device.fail_next_payments(10);

        let outcome = h.orchestrator.process_vip_payment(request("tx-1")).await.unwrap();

        assert_eq!(outcome.status, TransactionStatus::Failed);
        assert_eq!(outcome.code, Some(OutcomeCode::Esp32SendFailed));
        assert!(outcome.error.unwrap().starts_with("ESP32_SEND_FAILED"));
        assert!(!outcome.payment_taken);
        assert_eq!(h.device.events_calls(), 0);

        // The caller's retry is idempotent
        let retry = h.orchestrator.process_vip_payment(request("tx-1")).await.unwrap();
        assert_eq!(retry.code, Some(OutcomeCode::TransactionAlreadyFinal));
        assert_eq!(h.device.payment_calls(), 3);
    }

    #[tokio::test]
    async fn test_fast_path_skips_polling() {
        let h = harness().await;
        h.device.reply_with(json!({"payment_status": "PAID"}));

        let outcome = h.orchestrator.process_vip_payment(request("tx-1")).await.unwrap();

        assert!(outcome.confirmed);
        assert_eq!(
            outcome.confirmation.unwrap().source,
            Some(ConfirmationSource::Esp32Response)
        );
        assert_eq!(h.device.events_calls(), 0);
    }

    #[tokio::test]
    async fn test_declined_reply_marks_failed() {
        let h = harness().await;
        h.device.reply_with(json!({"status": "DECLINED"}));

        let outcome = h.orchestrator.process_vip_payment(request("tx-1")).await.unwrap();

        assert!(!outcome.confirmed);
        assert_eq!(outcome.status, TransactionStatus::Failed);
        assert_eq!(outcome.code, Some(OutcomeCode::PaymentNotConfirmed));
    }

    #[tokio::test]
    async fn test_confirmation_from_device_events() {
        let h = harness().await;
        h.device.reply_with(json!({"payment_status": "PENDING"}));
        h.device
            .push_event(json!({"transaction_id": "tx-1", "payment_status": "PAID"}));

        let outcome = h.orchestrator.process_vip_payment(request("tx-1")).await.unwrap();

        assert!(outcome.confirmed);
        assert_eq!(
            outcome.confirmation.unwrap().source,
            Some(ConfirmationSource::Esp32Events)
        );
        assert_eq!(h.device.events_calls(), 1);
    }

    #[tokio::test]
    async fn test_timeout_leaves_pending_and_retry_resolves_without_resend() {
        let h = harness().await;

        let outcome = h.orchestrator.process_vip_payment(request("tx-1")).await.unwrap();
        assert_eq!(outcome.status, TransactionStatus::Pending);
        assert_eq!(outcome.code, Some(OutcomeCode::PaymentNotConfirmed));
        assert_eq!(outcome.error.as_deref(), Some("confirmation_timeout"));
        assert_eq!(
            h.ledger.find_by_transaction_id("tx-1").unwrap().unwrap().status,
            TransactionStatus::Pending
        );

        h.device
            .push_event(json!({"transaction_id": "tx-1", "payment_status": "PAID"}));
        let retry = h.orchestrator.process_vip_payment(request("tx-1")).await.unwrap();
        assert!(retry.confirmed);
        assert_eq!(h.device.payment_calls(), 1);
        assert_eq!(
            h.ledger.find_by_transaction_id("tx-1").unwrap().unwrap().status,
            TransactionStatus::Confirmed
        );
    }

    #[tokio::test]
    async fn test_no_ticket_without_confirmation() {
        let h = harness().await;
        h.device.reply_with(json!({"payment_status": "FAILED"}));
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();

        let outcome = h
            .orchestrator
            .process_vip_payment_with_ticket(request("tx-1"), move |_ticket| {
                counter.fetch_add(1, Ordering::SeqCst);
                async { Ok::<_, String>("ticket-1".to_string()) }
            })
            .await
            .unwrap();

        assert_eq!(outcome.status, TransactionStatus::Failed);
        assert_eq!(outcome.ticket_id, None);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_ticket_creation_is_retried_after_confirmation() {
        let h = harness().await;
        h.device.reply_with(json!({"payment_status": "PAID"}));
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();

        let outcome = h
            .orchestrator
            .process_vip_payment_with_ticket(request("tx-1"), move |ticket| {
                let attempt = counter.fetch_add(1, Ordering::SeqCst) + 1;
                async move {
                    assert_eq!(ticket.transaction_id, "tx-1");
                    if attempt == 1 {
                        Err("ticket service unavailable".to_string())
                    } else {
                        Ok(format!("ticket-{}", attempt))
                    }
                }
            })
            .await
            .unwrap();

        assert!(outcome.confirmed);
        assert_eq!(outcome.ticket_id.as_deref(), Some("ticket-2"));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        let stored = h.ledger.find_by_ticket_id("ticket-2").unwrap().unwrap();
        assert_eq!(stored.transaction_id, "tx-1");
        assert_eq!(stored.status, TransactionStatus::Confirmed);
    }

    #[tokio::test]
    async fn test_ticket_without_id_is_retried() {
        let h = harness().await;
        h.device.reply_with(json!({"payment_status": "PAID"}));
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();

        let outcome = h
            .orchestrator
            .process_vip_payment_with_ticket(request("tx-1"), move |_ticket| {
                let attempt = counter.fetch_add(1, Ordering::SeqCst) + 1;
                async move {
                    let ticket = (attempt > 1).then(|| "ticket-ok".to_string());
                    Ok::<_, String>(ticket)
                }
            })
            .await
            .unwrap();

        assert_eq!(outcome.ticket_id.as_deref(), Some("ticket-ok"));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_ticket_exhaustion_reports_payment_taken() {
        let h = harness().await;
        h.device.reply_with(json!({"payment_status": "PAID"}));
        let calls = Arc::new(AtomicU32::new(0));

        let counter = calls.clone();
        let outcome = h
            .orchestrator
            .process_vip_payment_with_ticket(request("tx-1"), move |_ticket| {
                counter.fetch_add(1, Ordering::SeqCst);
                async { Err::<String, _>("queue closed") }
            })
            .await
            .unwrap();

        assert!(!outcome.confirmed);
        assert!(outcome.payment_taken);
        assert_eq!(outcome.status, TransactionStatus::Failed);
        assert_eq!(outcome.code, Some(OutcomeCode::TicketCreateFailed));
        assert_eq!(
            outcome.error.as_deref(),
            Some("TICKET_CREATE_FAILED: queue closed")
        );
        assert_eq!(calls.load(Ordering::SeqCst), 3);

        // A duplicate neither pays nor tickets again, and still flags the payment
        let counter = calls.clone();
        let replay = h
            .orchestrator
            .process_vip_payment_with_ticket(request("tx-1"), move |_ticket| {
                counter.fetch_add(1, Ordering::SeqCst);
                async { Ok::<_, String>("late".to_string()) }
            })
            .await
            .unwrap();
        assert_eq!(replay.code, Some(OutcomeCode::TransactionAlreadyFinal));
        assert!(replay.payment_taken);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(h.device.payment_calls(), 1);
    }

    #[tokio::test]
    async fn test_duplicate_returns_stored_ticket() {
        let h = harness().await;
        h.device.reply_with(json!({"payment_status": "PAID"}));

        let first = h
            .orchestrator
            .process_with_timing(request("tx-1"), VipTicketTiming::AfterPayment, &h.issuer)
            .await
            .unwrap();
        let ticket_id = first.ticket_id.clone().unwrap();
        let ticket = h.issuer.find_ticket(&ticket_id).unwrap().unwrap();
        assert_eq!(ticket.transaction_id.as_deref(), Some("tx-1"));
        assert_eq!(ticket.number, 1);

        let second = h
            .orchestrator
            .process_with_timing(request("tx-1"), VipTicketTiming::AfterPayment, &h.issuer)
            .await
            .unwrap();
        assert_eq!(second.ticket_id, Some(ticket_id));
        assert_eq!(h.device.payment_calls(), 1);
        // No second ticket was issued
        let next = h.issuer.issue_vip_ticket(Some("est-1"), None).unwrap();
        assert_eq!(next.number, 2);
    }

    #[tokio::test]
    async fn test_resumed_confirmation_issues_ticket() {
        let h = harness().await;

        let first = h
            .orchestrator
            .process_with_timing(request("tx-1"), VipTicketTiming::AfterPayment, &h.issuer)
            .await
            .unwrap();
        assert_eq!(first.status, TransactionStatus::Pending);
        assert_eq!(first.ticket_id, None);

        h.device
            .push_event(json!({"transaction_id": "tx-1", "payment_status": "PAID"}));
        let retry = h
            .orchestrator
            .process_with_timing(request("tx-1"), VipTicketTiming::AfterPayment, &h.issuer)
            .await
            .unwrap();
        assert!(retry.confirmed);
        let ticket_id = retry.ticket_id.clone().unwrap();
        let ticket = h.issuer.find_ticket_for_transaction("tx-1").unwrap().unwrap();
        assert_eq!(ticket.id, ticket_id);
        assert_eq!(
            h.ledger.find_by_transaction_id("tx-1").unwrap().unwrap().ticket_id,
            Some(ticket_id.clone())
        );
        assert_eq!(h.device.payment_calls(), 1);

        let replay = h
            .orchestrator
            .process_with_timing(request("tx-1"), VipTicketTiming::AfterPayment, &h.issuer)
            .await
            .unwrap();
        assert_eq!(replay.code, Some(OutcomeCode::TransactionAlreadyFinal));
        assert_eq!(replay.ticket_id, Some(ticket_id));
    }

    #[tokio::test]
    async fn test_ticket_bound_by_device_report_is_kept() {
        let h = harness_with_confirmation(50, 10).await;
        h.device.reply_with(json!({"payment_status": "PENDING"}));
        let ledger = h.ledger.clone();
        tokio::spawn(async move {
            let report = PaymentReport {
                transaction_id: "tx-1".to_string(),
                amount: None,
                status: "PAID".to_string(),
                ticket_id: Some("dev-ticket".to_string()),
            };
            while ledger.apply_device_report(&report).unwrap().is_none() {
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
        });
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();

        let outcome = h
            .orchestrator
            .process_vip_payment_with_ticket(request("tx-1"), move |_ticket| {
                counter.fetch_add(1, Ordering::SeqCst);
                async { Ok::<_, String>("server-ticket".to_string()) }
            })
            .await
            .unwrap();

        assert!(outcome.confirmed);
        assert_eq!(outcome.ticket_id.as_deref(), Some("dev-ticket"));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(
            h.ledger.find_by_transaction_id("tx-1").unwrap().unwrap().ticket_id.as_deref(),
            Some("dev-ticket")
        );
    }

    #[tokio::test]
    async fn test_concurrent_submissions_pay_and_ticket_once() {
        let h = harness_with_confirmation(50, 20).await;
        h.device.reply_with(json!({"payment_status": "PAID"}));

        let (first, second) = tokio::join!(
            h.orchestrator
                .process_with_timing(request("tx-1"), VipTicketTiming::AfterPayment, &h.issuer),
            h.orchestrator
                .process_with_timing(request("tx-1"), VipTicketTiming::AfterPayment, &h.issuer),
        );
        let (first, second) = (first.unwrap(), second.unwrap());

        assert_eq!(h.device.payment_calls(), 1);
        assert!(first.confirmed && second.confirmed);
        assert_eq!(first.status, second.status);
        assert_eq!(first.transaction_id, second.transaction_id);
        assert!(first.ticket_id.is_some());
        assert_eq!(first.ticket_id, second.ticket_id);
        // Only one ticket was issued for the pair
        let next = h.issuer.issue_vip_ticket(Some("est-1"), None).unwrap();
        assert_eq!(next.number, 2);
    }

    #[tokio::test]
    async fn test_concurrent_plain_payments_send_once() {
        let h = harness_with_confirmation(50, 20).await;
        h.device.reply_with(json!({"payment_status": "PAID"}));

        let (first, second) = tokio::join!(
            h.orchestrator.process_vip_payment(request("tx-1")),
            h.orchestrator.process_vip_payment(request("tx-1")),
        );
        let (first, second) = (first.unwrap(), second.unwrap());

        assert_eq!(h.device.payment_calls(), 1);
        assert_eq!(first.confirmed, second.confirmed);
        assert_eq!(first.status, second.status);
        assert_eq!(first.transaction_id, second.transaction_id);
        assert_eq!(first.status, TransactionStatus::Confirmed);
    }

    #[tokio::test]
    async fn test_ticket_first_resume_binds_waiting_ticket() {
        let h = harness().await;

        let first = h
            .orchestrator
            .process_with_timing(request("tx-1"), VipTicketTiming::BeforePayment, &h.issuer)
            .await
            .unwrap();
        assert_eq!(first.status, TransactionStatus::Pending);
        let waiting = h.issuer.find_ticket_for_transaction("tx-1").unwrap().unwrap();
        assert_eq!(waiting.status, TicketStatus::Waiting);

        h.device
            .push_event(json!({"transaction_id": "tx-1", "payment_status": "PAID"}));
        let retry = h
            .orchestrator
            .process_with_timing(request("tx-1"), VipTicketTiming::BeforePayment, &h.issuer)
            .await
            .unwrap();
        assert!(retry.confirmed);
        assert_eq!(retry.ticket_id, Some(waiting.id));
        assert_eq!(h.device.payment_calls(), 1);
    }

    #[tokio::test]
    async fn test_ticket_first_binds_on_confirmation() {
        let h = harness().await;
        h.device.reply_with(json!({"payment_status": "SUCCESS"}));

        let outcome = h
            .orchestrator
            .process_with_timing(request("tx-1"), VipTicketTiming::BeforePayment, &h.issuer)
            .await
            .unwrap();

        assert!(outcome.confirmed);
        let ticket_id = outcome.ticket_id.unwrap();
        let ticket = h.issuer.find_ticket_for_transaction("tx-1").unwrap().unwrap();
        assert_eq!(ticket.id, ticket_id);
        assert_eq!(ticket.status, TicketStatus::Waiting);
    }

    #[tokio::test]
    async fn test_ticket_first_cancels_on_failure() {
        let h = harness().await;
        h.device.reply_with(json!({"payment_status": "DECLINED"}));

        let outcome = h
            .orchestrator
            .process_with_timing(request("tx-1"), VipTicketTiming::BeforePayment, &h.issuer)
            .await
            .unwrap();

        assert_eq!(outcome.status, TransactionStatus::Failed);
        assert_eq!(outcome.ticket_id, None);
        let ticket = h.issuer.find_ticket_for_transaction("tx-1").unwrap().unwrap();
        assert_eq!(ticket.status, TicketStatus::Cancelled);
    }

    #[tokio::test]
    async fn test_invalid_request_is_rejected_before_the_ledger() {
        let h = harness().await;
        let error = h
            .orchestrator
            .process_vip_payment(PaymentRequest {
                amount: 0.0,
                ..request("tx-1")
            })
            .await
            .unwrap_err();

        assert_eq!(error.code(), "INVALID_REQUEST");
        assert!(h.ledger.find_by_transaction_id("tx-1").unwrap().is_none());
        assert_eq!(h.device.payment_calls(), 0);
    }
}
