use std::{
    fmt::{self, Display},
    str::FromStr,
};

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum DeviceStatus {
    Active,
    Disabled,
}

impl DeviceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceStatus::Active => "ACTIVE",
            DeviceStatus::Disabled => "DISABLED",
        }
    }
}

impl Display for DeviceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, thiserror::Error)]
#[error("Unknown device status: {0}")]
pub struct UnknownDeviceStatus(pub String);

impl FromStr for DeviceStatus {
    type Err = UnknownDeviceStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ACTIVE" => Ok(DeviceStatus::Active),
            "DISABLED" => Ok(DeviceStatus::Disabled),
            other => Err(UnknownDeviceStatus(other.to_string())),
        }
    }
}

/// A point-of-sale controller
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Device {
    pub device_id: String,
    /// Shared HMAC secret, never echoed back except at registration
    #[serde(skip_serializing)]
    pub secret_key: String,
    pub status: DeviceStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub establishment_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_seen: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub uptime_seconds: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub firmware_version: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub free_memory: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub healthy: Option<bool>,
    pub created_at: i64,
    pub updated_at: i64,
}

impl Device {
    pub fn is_active(&self) -> bool {
        self.status == DeviceStatus::Active
    }
}

/// Telemetry pushed by a device on heartbeat
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HeartbeatReport {
    /// Seconds since boot
    #[serde(default)]
    pub uptime: Option<i64>,
    #[serde(default)]
    pub firmware_version: Option<String>,
    /// Free heap in bytes
    #[serde(default)]
    pub free_memory: Option<i64>,
    #[serde(default)]
    pub healthy: Option<bool>,
}

/// Asynchronous payment result pushed by a device
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaymentReport {
    pub transaction_id: String,
    #[serde(default)]
    pub amount: Option<f64>,
    pub status: String,
    #[serde(default)]
    pub ticket_id: Option<String>,
}
