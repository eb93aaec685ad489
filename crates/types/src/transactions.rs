use std::{
    fmt::{self, Display},
    str::FromStr,
};

use serde::{Deserialize, Serialize};

/// Ledger status of a payment attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TransactionStatus {
    Pending,
    Confirmed,
    Failed,
}

impl TransactionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionStatus::Pending => "PENDING",
            TransactionStatus::Confirmed => "CONFIRMED",
            TransactionStatus::Failed => "FAILED",
        }
    }

    /// CONFIRMED and FAILED are terminal and never change again
    pub fn is_final(&self) -> bool {
        !matches!(self, TransactionStatus::Pending)
    }

    /// Normalize the free-text status a device sends in a payment report
    pub fn from_report(status: &str) -> Self {
        match status.trim().to_ascii_uppercase().as_str() {
            "PAID" | "CONFIRMED" => TransactionStatus::Confirmed,
            "FAILED" | "DECLINED" => TransactionStatus::Failed,
            _ => TransactionStatus::Pending,
        }
    }
}

impl Display for TransactionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, thiserror::Error)]
#[error("Unknown transaction status: {0}")]
pub struct UnknownTransactionStatus(pub String);

impl FromStr for TransactionStatus {
    type Err = UnknownTransactionStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(TransactionStatus::Pending),
            "CONFIRMED" => Ok(TransactionStatus::Confirmed),
            "FAILED" => Ok(TransactionStatus::Failed),
            other => Err(UnknownTransactionStatus(other.to_string())),
        }
    }
}

/// One payment attempt, keyed by `transaction_id`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transaction {
    pub transaction_id: String,
    pub device_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub establishment_id: Option<String>,
    pub amount: f64,
    pub status: TransactionStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ticket_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_reason: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
}

impl Transaction {
    pub fn is_final(&self) -> bool {
        self.status.is_final()
    }
}

/// Outcome of a confirmation lookup, local or remote
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ConfirmationStatus {
    Confirmed,
    Failed,
    Pending,
    Unknown,
}

impl ConfirmationStatus {
    /// Map a status read from the device event log
    pub fn from_event_status(status: &str) -> Self {
        match status.trim().to_ascii_uppercase().as_str() {
            "PAID" | "CONFIRMED" => ConfirmationStatus::Confirmed,
            "FAILED" | "DECLINED" => ConfirmationStatus::Failed,
            _ => ConfirmationStatus::Pending,
        }
    }

    /// Map a status embedded in the synchronous reply of the device.
    ///
    /// Returns `None` for values the device firmware is not known to emit.
    pub fn from_reply_status(status: &str) -> Option<Self> {
        match status.trim().to_ascii_uppercase().as_str() {
            "PAID" | "CONFIRMED" | "SUCCESS" => Some(ConfirmationStatus::Confirmed),
            "FAILED" | "DECLINED" | "ERROR" => Some(ConfirmationStatus::Failed),
            "PENDING" => Some(ConfirmationStatus::Pending),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ConfirmationStatus::Confirmed | ConfirmationStatus::Failed
        )
    }
}

impl From<TransactionStatus> for ConfirmationStatus {
    fn from(status: TransactionStatus) -> Self {
        match status {
            TransactionStatus::Pending => ConfirmationStatus::Pending,
            TransactionStatus::Confirmed => ConfirmationStatus::Confirmed,
            TransactionStatus::Failed => ConfirmationStatus::Failed,
        }
    }
}

/// Where a confirmation result came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConfirmationSource {
    /// The local ledger
    TransactionDb,
    /// The device event log
    Esp32Events,
    /// The synchronous reply to the payment command
    Esp32Response,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Confirmation {
    pub confirmed: bool,
    pub status: ConfirmationStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<ConfirmationSource>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    /// The raw device event or reply the status was read from
    #[serde(skip_serializing_if = "Option::is_none")]
    pub event: Option<serde_json::Value>,
}

impl Confirmation {
    pub fn new(status: ConfirmationStatus, source: ConfirmationSource) -> Self {
        Self {
            confirmed: status == ConfirmationStatus::Confirmed,
            status,
            source: Some(source),
            reason: None,
            event: None,
        }
    }

    pub fn unknown(source: ConfirmationSource, reason: impl Into<String>) -> Self {
        Self {
            confirmed: false,
            status: ConfirmationStatus::Unknown,
            source: Some(source),
            reason: Some(reason.into()),
            event: None,
        }
    }

    /// Poll budget exhausted without a terminal answer
    pub fn timeout() -> Self {
        Self {
            confirmed: false,
            status: ConfirmationStatus::Pending,
            source: None,
            reason: Some("confirmation_timeout".to_string()),
            event: None,
        }
    }

    pub fn with_event(mut self, event: serde_json::Value) -> Self {
        self.event = Some(event);
        self
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}
