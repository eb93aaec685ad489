use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value as JsonValue;

/// Body of the "collect payment" command sent to a device
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaymentCommand {
    pub transaction_id: String,
    pub device_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub establishment_id: Option<String>,
    pub amount: f64,
    pub vip: bool,
}

/// Result of a (possibly retried) outbound POST to a device
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SendOutcome {
    pub sent: bool,
    pub attempts: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status_code: Option<u16>,
    /// Parsed JSON reply of the last attempt, if any
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response: Option<JsonValue>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// One entry of the device's local payment log
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceEvent {
    /// String on current firmware, numeric on some older builds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transaction_id: Option<JsonValue>,
    /// Older firmware keys events by ticket id, sometimes numeric
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id_ticket: Option<JsonValue>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payment_status: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, JsonValue>,
}

fn event_key(value: Option<&JsonValue>) -> Option<String> {
    match value? {
        JsonValue::String(s) => Some(s.clone()),
        JsonValue::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

impl DeviceEvent {
    /// Whether this event refers to `transaction_id`, directly or through the
    /// legacy `id_ticket` key
    pub fn matches(&self, transaction_id: &str) -> bool {
        event_key(self.transaction_id.as_ref()).as_deref() == Some(transaction_id)
            || event_key(self.id_ticket.as_ref()).as_deref() == Some(transaction_id)
    }

    /// `payment_status` takes precedence over the generic `status`
    pub fn status_text(&self) -> Option<&str> {
        self.payment_status.as_deref().or(self.status.as_deref())
    }
}

/// Response of the device events endpoint
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeviceEventLog {
    #[serde(default, deserialize_with = "skip_malformed_events")]
    pub events: Vec<DeviceEvent>,
}

/// Entries that do not parse are dropped so one bad event cannot hide the rest
fn skip_malformed_events<'de, D>(deserializer: D) -> Result<Vec<DeviceEvent>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Vec::<JsonValue>::deserialize(deserializer)?;
    Ok(raw
        .into_iter()
        .filter_map(|event| serde_json::from_value(event).ok())
        .collect())
}

impl DeviceEventLog {
    /// Most recent event for `transaction_id`; the device appends in order
    pub fn latest_for(&self, transaction_id: &str) -> Option<&DeviceEvent> {
        self.events.iter().rev().find(|e| e.matches(transaction_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_latest_event_matches_legacy_ticket_key() {
        let log: DeviceEventLog = serde_json::from_value(serde_json::json!({
            "events": [
                {"transaction_id": "tx-1", "payment_status": "PENDING"},
                {"id_ticket": 42, "status": "PAID"},
                {"transaction_id": "tx-2", "payment_status": "FAILED"},
                {"id_ticket": "tx-1", "status": "PAID", "amount": 50}
            ]
        }))
        .unwrap();

        let latest = log.latest_for("tx-1").unwrap();
        assert_eq!(latest.status_text(), Some("PAID"));
        assert_eq!(latest.extra["amount"], 50);

        assert_eq!(log.latest_for("42").unwrap().status_text(), Some("PAID"));
        assert!(log.latest_for("tx-3").is_none());
    }

    #[test]
    fn test_payment_status_wins_over_status() {
        let event: DeviceEvent = serde_json::from_value(serde_json::json!({
            "transaction_id": "tx-1",
            "status": "DONE",
            "payment_status": "DECLINED"
        }))
        .unwrap();
        assert_eq!(event.status_text(), Some("DECLINED"));
    }

    #[test]
    fn test_malformed_entry_does_not_hide_the_log() {
        let log: DeviceEventLog = serde_json::from_value(serde_json::json!({
            "events": [
                {"transaction_id": 12345, "payment_status": "PAID"},
                {"transaction_id": "tx-9", "payment_status": {"code": 7}},
                "garbage",
                {"transaction_id": "tx-1", "payment_status": "PAID"}
            ]
        }))
        .unwrap();

        assert_eq!(log.events.len(), 2);
        assert_eq!(log.latest_for("tx-1").unwrap().status_text(), Some("PAID"));
        assert_eq!(log.latest_for("12345").unwrap().status_text(), Some("PAID"));
        assert!(log.latest_for("tx-9").is_none());
    }

    #[test]
    fn test_missing_events_key_is_empty_log() {
        let log: DeviceEventLog = serde_json::from_str("{}").unwrap();
        assert!(log.events.is_empty());
    }
}
