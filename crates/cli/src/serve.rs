use console::style;
use queuepay_core::{
    ApiState, DbManager, GatewayConfig, OrchestratorConfig, SignatureConfig, start_server,
};
use queuepay_types::{VipTicketTiming, defaults};

#[derive(Debug, Clone, PartialEq, clap::Args)]
pub struct ServeCommand {
    /// Port to run the server on
    #[arg(long, env = "QUEUEPAY_PORT", default_value_t = defaults::PORT)]
    pub port: u16,

    /// SQLite path (or Postgres URL with the postgres feature)
    #[arg(long, env = "DATABASE_URL", default_value = defaults::DATABASE_URL)]
    pub database_url: String,

    /// Shared token devices present when registering
    #[arg(long, env = "DEVICE_PROVISIONING_TOKEN", hide_env_values = true)]
    pub provisioning_token: String,

    /// Base URL of the payment controller
    #[arg(long, env = "ESP32_BASE_URL", default_value = defaults::GATEWAY_BASE_URL)]
    pub gateway_base_url: String,

    #[arg(long, env = "ESP32_PAYMENT_PATH", default_value = defaults::GATEWAY_PAYMENT_PATH)]
    pub gateway_payment_path: String,

    #[arg(long, env = "ESP32_EVENTS_PATH", default_value = defaults::GATEWAY_EVENTS_PATH)]
    pub gateway_events_path: String,

    /// Timeout of each controller request, in milliseconds
    #[arg(long, env = "ESP32_TIMEOUT_MS", default_value_t = defaults::GATEWAY_TIMEOUT_MS)]
    pub gateway_timeout_ms: u64,

    /// Attempts at delivering a payment command
    #[arg(long, env = "ESP32_MAX_RETRIES", default_value_t = defaults::MAX_RETRIES)]
    pub max_retries: u32,

    #[arg(long, env = "ESP32_RETRY_DELAY_MS", default_value_t = defaults::RETRY_DELAY_MS)]
    pub retry_delay_ms: u64,

    /// Polls before a payment is reported as not confirmed
    #[arg(long, env = "ESP32_CONFIRMATION_POLLS", default_value_t = defaults::CONFIRMATION_POLLS)]
    pub confirmation_polls: u32,

    #[arg(
        long,
        env = "ESP32_CONFIRMATION_INTERVAL_MS",
        default_value_t = defaults::CONFIRMATION_INTERVAL_MS
    )]
    pub confirmation_interval_ms: u64,

    /// Attempts at issuing the ticket of a confirmed payment
    #[arg(long, env = "TICKET_SERVER_RETRY_MAX", default_value_t = defaults::SERVER_RETRY_MAX)]
    pub server_retry_max: u32,

    #[arg(
        long,
        env = "TICKET_SERVER_RETRY_DELAY_MS",
        default_value_t = defaults::SERVER_RETRY_DELAY_MS
    )]
    pub server_retry_delay_ms: u64,

    /// Accepted clock skew of timestamped device signatures
    #[arg(
        long,
        env = "SIGNATURE_TOLERANCE_SECS",
        default_value_t = defaults::SIGNATURE_TOLERANCE_SECS
    )]
    pub signature_tolerance_secs: i64,

    /// When the VIP ticket is issued: before-payment or after-payment
    #[arg(long, env = "VIP_TICKET_TIMING", default_value_t = VipTicketTiming::AfterPayment)]
    pub vip_ticket_timing: VipTicketTiming,
}

impl ServeCommand {
    fn gateway_config(&self) -> GatewayConfig {
        GatewayConfig::default()
            .with_base_url(&self.gateway_base_url)
            .with_payment_path(&self.gateway_payment_path)
            .with_events_path(&self.gateway_events_path)
            .with_timeout_ms(self.gateway_timeout_ms)
            .with_retries(self.max_retries, self.retry_delay_ms)
            .with_confirmation(self.confirmation_polls, self.confirmation_interval_ms)
    }

    fn orchestrator_config(&self) -> OrchestratorConfig {
        OrchestratorConfig::default()
            .with_server_retries(self.server_retry_max, self.server_retry_delay_ms)
    }

    pub async fn execute(&self) -> Result<(), String> {
        if self.provisioning_token.trim().is_empty() {
            return Err("DEVICE_PROVISIONING_TOKEN must not be empty".to_string());
        }

        println!();
        println!("{}{}", style("Queue").white(), style("Pay").green());
        println!("{}", style("Starting API server").dim());
        println!();
        println!("{} {}", style("Database").dim(), self.database_url);
        println!("{} {}", style("Controller").dim(), self.gateway_base_url);
        println!("{} {}", style("VIP tickets").dim(), self.vip_ticket_timing);
        println!("{} {}", style("Port").dim(), self.port);
        println!();
        println!("{}", style("Endpoints").dim());
        println!("  POST http://localhost:{}/v1/devices/register", self.port);
        println!("  POST http://localhost:{}/v1/devices/activate", self.port);
        println!("  POST http://localhost:{}/v1/devices/heartbeat", self.port);
        println!("  POST http://localhost:{}/v1/devices/payment-report", self.port);
        println!("  POST http://localhost:{}/v1/vip/payments", self.port);
        println!("  GET  http://localhost:{}/v1/transactions/{{id}}", self.port);
        println!("  GET  http://localhost:{}/health", self.port);
        println!();
        println!("{}", style("Press Ctrl+C to stop").dim());
        println!();

        tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
            )
            .init();

        let db_manager = DbManager::local(&self.database_url)
            .map_err(|e| format!("Failed to open database: {}", e))?;

        let state = ApiState::new(
            db_manager,
            self.gateway_config(),
            self.orchestrator_config(),
            &self.provisioning_token,
        )
        .map_err(|e| format!("Invalid controller configuration: {}", e))?
        .with_signature_config(
            SignatureConfig::default().with_tolerance_secs(self.signature_tolerance_secs),
        )
        .with_vip_ticket_timing(self.vip_ticket_timing);

        tracing::info!(
            "Payment controller at {}, VIP tickets {}",
            self.gateway_base_url,
            self.vip_ticket_timing
        );

        start_server(state, self.port)
            .await
            .map_err(|e| format!("Server error: {}", e))
    }
}

#[cfg(test)]
mod tests {
    use clap::Parser;

    use super::*;

    #[derive(Parser, Debug)]
    struct Cli {
        #[command(flatten)]
        serve: ServeCommand,
    }

    #[test]
    fn test_flags_override_defaults() {
        let cli = Cli::parse_from([
            "queuepay",
            "--provisioning-token",
            "token",
            "--gateway-base-url",
            "http://10.0.0.7",
            "--max-retries",
            "5",
            "--vip-ticket-timing",
            "before-payment",
        ]);
        assert_eq!(cli.serve.max_retries, 5);
        assert_eq!(cli.serve.vip_ticket_timing, VipTicketTiming::BeforePayment);

        let gateway = cli.serve.gateway_config();
        assert_eq!(gateway.base_url, "http://10.0.0.7");
        assert_eq!(gateway.payment_path, defaults::GATEWAY_PAYMENT_PATH);
        assert_eq!(gateway.max_retries, 5);
        assert_eq!(
            cli.serve.orchestrator_config().server_retry_max,
            defaults::SERVER_RETRY_MAX
        );
    }
}
