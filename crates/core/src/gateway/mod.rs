pub mod config;

pub use config::GatewayConfig;
use queuepay_types::{
    Confirmation, ConfirmationSource, ConfirmationStatus, DeviceEventLog, PaymentCommand,
    SendOutcome,
};
use serde::Serialize;
use serde_json::Value as JsonValue;
use tracing::{debug, error, info, warn};

use crate::ledger::TransactionLedger;

/// Reply fields a device may use to report a payment status synchronously
const REPLY_STATUS_FIELDS: [&str; 3] = ["payment_status", "paymentStatus", "status"];

#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("Invalid gateway base URL {0}: {1}")]
    InvalidBaseUrl(String, url::ParseError),
    #[error("Invalid device endpoint {0}: {1}")]
    InvalidEndpoint(String, url::ParseError),
    #[error("Failed to build HTTP client: {0}")]
    ClientBuild(reqwest::Error),
    #[error("Failed to contact device: {0}")]
    Unreachable(reqwest::Error),
    #[error("Device events endpoint returned HTTP {0}")]
    UnexpectedStatus(u16),
    #[error("Failed to parse device event log: {0}")]
    InvalidEventLog(reqwest::Error),
}

/// HTTP client for the payment device controller.
///
/// Sends payment commands with bounded retry and resolves the outcome of a
/// transaction from the local ledger and the device event log.
#[derive(Debug, Clone)]
pub struct GatewayClient {
    http: reqwest::Client,
    config: GatewayConfig,
    ledger: TransactionLedger,
}

impl GatewayClient {
    pub fn new(config: GatewayConfig, ledger: TransactionLedger) -> Result<Self, GatewayError> {
        url::Url::parse(&config.base_url)
            .map_err(|e| GatewayError::InvalidBaseUrl(config.base_url.clone(), e))?;
        let http = reqwest::Client::builder()
            .timeout(config.timeout())
            .build()
            .map_err(GatewayError::ClientBuild)?;
        Ok(Self {
            http,
            config,
            ledger,
        })
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    /// Ask the device to collect a payment
    pub async fn send_payment(&self, command: &PaymentCommand) -> SendOutcome {
        info!(
            "Sending payment command for transaction {} to device {} (amount: {})",
            command.transaction_id, command.device_id, command.amount
        );
        self.post_with_retry(&self.config.payment_path, command).await
    }

    /// POST `payload` to `path`, retrying failed attempts with linear backoff.
    ///
    /// A network error, a timeout or a non-2xx reply counts as a failed
    /// attempt. The returned outcome describes the last attempt.
    pub async fn post_with_retry<T: Serialize + ?Sized>(
        &self,
        path: &str,
        payload: &T,
    ) -> SendOutcome {
        let max_attempts = self.config.max_retries.max(1);
        let mut outcome = SendOutcome {
            sent: false,
            attempts: 0,
            status_code: None,
            response: None,
            error: None,
        };
        let url = match self.config.endpoint(path) {
            Ok(url) => url,
            Err(e) => {
                error!("Cannot POST to device endpoint {}: {}", path, e);
                outcome.error = Some(GatewayError::InvalidEndpoint(path.to_string(), e).to_string());
                return outcome;
            }
        };

        for attempt in 1..=max_attempts {
            outcome.attempts = attempt;
            match self.http.post(url.clone()).json(payload).send().await {
                Ok(response) => {
                    let status = response.status();
                    outcome.status_code = Some(status.as_u16());
                    outcome.response = read_reply(response).await;
                    if status.is_success() {
                        debug!("POST {} succeeded on attempt {}", url, attempt);
                        outcome.sent = true;
                        outcome.error = None;
                        return outcome;
                    }
                    outcome.error = Some(format!("device replied with HTTP {}", status.as_u16()));
                }
                Err(e) => {
                    outcome.status_code = None;
                    outcome.response = None;
                    outcome.error = Some(if e.is_timeout() {
                        format!("timed out after {} ms", self.config.timeout_ms)
                    } else {
                        e.to_string()
                    });
                }
            }

            warn!(
                "POST {} failed (attempt {}/{}): {}",
                url,
                attempt,
                max_attempts,
                outcome.error.as_deref().unwrap_or_default()
            );
            if attempt < max_attempts {
                tokio::time::sleep(self.config.retry_delay(attempt)).await;
            }
        }

        error!("POST {} failed after {} attempts", url, outcome.attempts);
        outcome
    }

    /// Status of `transaction_id` as recorded in the local ledger
    pub fn get_transaction_status_from_db(&self, transaction_id: &str) -> Confirmation {
        match self.ledger.find_by_transaction_id(transaction_id) {
            Ok(Some(transaction)) => {
                Confirmation::new(transaction.status.into(), ConfirmationSource::TransactionDb)
            }
            Ok(None) => {
                Confirmation::unknown(ConfirmationSource::TransactionDb, "transaction_not_found")
            }
            Err(e) => {
                error!("Failed to read transaction {}: {}", transaction_id, e);
                Confirmation::unknown(ConfirmationSource::TransactionDb, e.to_string())
            }
        }
    }

    pub async fn fetch_events(&self) -> Result<DeviceEventLog, GatewayError> {
        let url = self
            .config
            .endpoint(&self.config.events_path)
            .map_err(|e| GatewayError::InvalidEndpoint(self.config.events_path.clone(), e))?;
        let response = self
            .http
            .get(url)
            .send()
            .await
            .map_err(GatewayError::Unreachable)?;
        if !response.status().is_success() {
            return Err(GatewayError::UnexpectedStatus(response.status().as_u16()));
        }
        response
            .json::<DeviceEventLog>()
            .await
            .map_err(GatewayError::InvalidEventLog)
    }

    /// Status of `transaction_id` according to the device event log.
    ///
    /// The most recent matching event decides. `UNKNOWN` when the log cannot
    /// be fetched.
    pub async fn get_transaction_status(&self, transaction_id: &str) -> Confirmation {
        let log = match self.fetch_events().await {
            Ok(log) => log,
            Err(e) => {
                warn!("Could not fetch device events for {}: {}", transaction_id, e);
                return Confirmation::unknown(ConfirmationSource::Esp32Events, e.to_string());
            }
        };

        match log.latest_for(transaction_id) {
            Some(event) => {
                let status =
                    ConfirmationStatus::from_event_status(event.status_text().unwrap_or_default());
                let confirmation = Confirmation::new(status, ConfirmationSource::Esp32Events);
                match serde_json::to_value(event) {
                    Ok(raw) => confirmation.with_event(raw),
                    Err(_) => confirmation,
                }
            }
            None => Confirmation::new(ConfirmationStatus::Pending, ConfirmationSource::Esp32Events)
                .with_reason("event_not_found"),
        }
    }

    /// Poll until the transaction is settled or the poll budget runs out.
    ///
    /// The ledger is checked first on every iteration; a terminal local
    /// status is returned without contacting the device.
    pub async fn wait_transaction_confirmation(&self, transaction_id: &str) -> Confirmation {
        let polls = self.config.confirmation_polls.max(1);
        for poll in 1..=polls {
            let local = self.get_transaction_status_from_db(transaction_id);
            if local.is_terminal() {
                debug!(
                    "Transaction {} settled locally as {:?} (poll {})",
                    transaction_id, local.status, poll
                );
                return local;
            }

            let remote = self.get_transaction_status(transaction_id).await;
            if remote.is_terminal() {
                debug!(
                    "Transaction {} settled by device events as {:?} (poll {})",
                    transaction_id, remote.status, poll
                );
                return remote;
            }

            if poll < polls {
                tokio::time::sleep(self.config.confirmation_interval()).await;
            }
        }

        warn!(
            "Transaction {} still unconfirmed after {} polls",
            transaction_id, polls
        );
        Confirmation::timeout()
    }

    /// Payment status carried by the synchronous reply of the device, if any
    pub fn confirmation_from_reply(&self, outcome: &SendOutcome) -> Option<Confirmation> {
        let reply = outcome.response.as_ref()?;
        let object = reply.as_object()?;
        let status = REPLY_STATUS_FIELDS
            .iter()
            .filter_map(|field| object.get(*field).and_then(JsonValue::as_str))
            .find_map(ConfirmationStatus::from_reply_status)?;
        Some(Confirmation::new(status, ConfirmationSource::Esp32Response).with_event(reply.clone()))
    }
}

/// Body of a device reply: JSON when it parses, raw text otherwise
async fn read_reply(response: reqwest::Response) -> Option<JsonValue> {
    let bytes = response.bytes().await.ok()?;
    if bytes.is_empty() {
        return None;
    }
    match serde_json::from_slice(&bytes) {
        Ok(value) => Some(value),
        Err(_) => Some(JsonValue::String(
            String::from_utf8_lossy(&bytes).into_owned(),
        )),
    }
}
