use std::time::Duration;

use queuepay_types::defaults;
use url::Url;

/// Outbound connection settings for the device controller
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GatewayConfig {
    pub base_url: String,
    pub payment_path: String,
    pub events_path: String,
    /// Deadline for a single HTTP call
    pub timeout_ms: u64,
    pub max_retries: u32,
    /// Linear backoff unit: attempt `n` waits `n * retry_delay_ms`
    pub retry_delay_ms: u64,
    pub confirmation_polls: u32,
    pub confirmation_interval_ms: u64,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            base_url: defaults::GATEWAY_BASE_URL.to_string(),
            payment_path: defaults::GATEWAY_PAYMENT_PATH.to_string(),
            events_path: defaults::GATEWAY_EVENTS_PATH.to_string(),
            timeout_ms: defaults::GATEWAY_TIMEOUT_MS,
            max_retries: defaults::MAX_RETRIES,
            retry_delay_ms: defaults::RETRY_DELAY_MS,
            confirmation_polls: defaults::CONFIRMATION_POLLS,
            confirmation_interval_ms: defaults::CONFIRMATION_INTERVAL_MS,
        }
    }
}

impl GatewayConfig {
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    pub fn with_payment_path(mut self, path: impl Into<String>) -> Self {
        self.payment_path = path.into();
        self
    }

    pub fn with_events_path(mut self, path: impl Into<String>) -> Self {
        self.events_path = path.into();
        self
    }

    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = timeout_ms;
        self
    }

    pub fn with_retries(mut self, max_retries: u32, retry_delay_ms: u64) -> Self {
        self.max_retries = max_retries;
        self.retry_delay_ms = retry_delay_ms;
        self
    }

    pub fn with_confirmation(mut self, polls: u32, interval_ms: u64) -> Self {
        self.confirmation_polls = polls;
        self.confirmation_interval_ms = interval_ms;
        self
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// Sleep before the attempt following `attempt`
    pub fn retry_delay(&self, attempt: u32) -> Duration {
        Duration::from_millis(self.retry_delay_ms.saturating_mul(attempt as u64))
    }

    pub fn confirmation_interval(&self) -> Duration {
        Duration::from_millis(self.confirmation_interval_ms)
    }

    /// Resolve `path` under the base URL, keeping any path prefix of the base
    pub fn endpoint(&self, path: &str) -> Result<Url, url::ParseError> {
        let mut base = Url::parse(&self.base_url)?;
        if !base.path().ends_with('/') {
            let prefixed = format!("{}/", base.path());
            base.set_path(&prefixed);
        }
        base.join(path.trim_start_matches('/'))
    }
}
