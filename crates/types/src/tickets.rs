use std::{
    fmt::{self, Display},
    str::FromStr,
};

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TicketStatus {
    Waiting,
    Cancelled,
}

impl TicketStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TicketStatus::Waiting => "WAITING",
            TicketStatus::Cancelled => "CANCELLED",
        }
    }
}

impl FromStr for TicketStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "WAITING" => Ok(TicketStatus::Waiting),
            "CANCELLED" => Ok(TicketStatus::Cancelled),
            other => Err(format!("Unknown ticket status: {}", other)),
        }
    }
}

/// A queue ticket
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Ticket {
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub establishment_id: Option<String>,
    /// Position number within the establishment
    pub number: i64,
    pub vip: bool,
    pub status: TicketStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transaction_id: Option<String>,
    pub created_at: i64,
}

/// Whether a VIP ticket is issued before the device collects payment or only
/// once the payment is confirmed
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum VipTicketTiming {
    BeforePayment,
    #[default]
    AfterPayment,
}

impl Display for VipTicketTiming {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VipTicketTiming::BeforePayment => write!(f, "before-payment"),
            VipTicketTiming::AfterPayment => write!(f, "after-payment"),
        }
    }
}

impl FromStr for VipTicketTiming {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().replace('_', "-").as_str() {
            "before-payment" | "before" => Ok(VipTicketTiming::BeforePayment),
            "after-payment" | "after" => Ok(VipTicketTiming::AfterPayment),
            other => Err(format!(
                "Invalid VIP ticket timing '{}', expected before-payment or after-payment",
                other
            )),
        }
    }
}
