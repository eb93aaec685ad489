pub mod device;
pub mod payments;

use std::sync::Arc;

use axum::{
    Extension, Json, Router,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use queuepay_types::VipTicketTiming;
use serde_json::json;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};

use crate::{
    db::{DbError, DbManager},
    gateway::{GatewayClient, GatewayConfig, GatewayError},
    ledger::TransactionLedger,
    orchestrator::{OrchestratorConfig, OrchestratorError, PaymentOrchestrator},
    signature::SignatureConfig,
    tickets::TicketIssuer,
};

/// Shared state of the HTTP API
#[derive(Clone)]
pub struct ApiState {
    pub db_manager: Arc<DbManager>,
    pub ledger: TransactionLedger,
    pub orchestrator: PaymentOrchestrator,
    pub issuer: TicketIssuer,
    pub signature: SignatureConfig,
    /// Shared secret presented by devices at registration
    pub provisioning_token: Arc<str>,
    pub vip_ticket_timing: VipTicketTiming,
}

impl ApiState {
    pub fn new(
        db_manager: DbManager,
        gateway_config: GatewayConfig,
        orchestrator_config: OrchestratorConfig,
        provisioning_token: &str,
    ) -> Result<Self, GatewayError> {
        let db_manager = Arc::new(db_manager);
        let ledger = TransactionLedger::new(db_manager.clone());
        let gateway = GatewayClient::new(gateway_config, ledger.clone())?;
        let orchestrator = PaymentOrchestrator::new(gateway, ledger.clone(), orchestrator_config);
        Ok(Self {
            issuer: TicketIssuer::new(db_manager.clone()),
            db_manager,
            ledger,
            orchestrator,
            signature: SignatureConfig::default(),
            provisioning_token: Arc::from(provisioning_token),
            vip_ticket_timing: VipTicketTiming::default(),
        })
    }

    pub fn with_signature_config(mut self, signature: SignatureConfig) -> Self {
        self.signature = signature;
        self
    }

    pub fn with_vip_ticket_timing(mut self, timing: VipTicketTiming) -> Self {
        self.vip_ticket_timing = timing;
        self
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("Invalid provisioning token")]
    InvalidProvisioningToken,
    #[error("Device {0} is already registered")]
    DeviceAlreadyRegistered(String),
    #[error("Transaction {0} not found")]
    TransactionNotFound(String),
    #[error("Device {device_id} cannot report on transaction {transaction_id}")]
    DeviceMismatch {
        device_id: String,
        transaction_id: String,
    },
    #[error("Payment flow failed: {0}")]
    Orchestrator(#[from] OrchestratorError),
    #[error("Database error: {0}")]
    Database(#[from] DbError),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code, err_type) = match &self {
            ApiError::InvalidProvisioningToken => (
                StatusCode::UNAUTHORIZED,
                "INVALID_PROVISIONING_TOKEN",
                "authentication_error",
            ),
            ApiError::DeviceAlreadyRegistered(_) => (
                StatusCode::CONFLICT,
                "DEVICE_ALREADY_REGISTERED",
                "invalid_request_error",
            ),
            ApiError::TransactionNotFound(_) => (
                StatusCode::NOT_FOUND,
                "TRANSACTION_NOT_FOUND",
                "invalid_request_error",
            ),
            ApiError::DeviceMismatch { .. } => (
                StatusCode::FORBIDDEN,
                "DEVICE_MISMATCH",
                "authentication_error",
            ),
            ApiError::Orchestrator(e @ OrchestratorError::InvalidRequest(_)) => {
                (StatusCode::BAD_REQUEST, e.code(), "invalid_request_error")
            }
            ApiError::Orchestrator(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.code(), "api_error"),
            ApiError::Database(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "DATABASE_ERROR",
                "api_error",
            ),
        };

        if status.is_server_error() {
            tracing::error!("{}", self);
        }

        let body = json!({
            "error": {
                "code": code,
                "message": self.to_string(),
                "type": err_type,
            }
        });
        (status, Json(body)).into_response()
    }
}

async fn health() -> impl IntoResponse {
    Json(json!({ "status": "ok" }))
}

/// Build the full API router
pub fn create_router(state: ApiState) -> Router<()> {
    let cors_layer = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health))
        .merge(device::create_router(state.clone()))
        .route("/v1/vip/payments", post(payments::create_vip_payment))
        .route(
            "/v1/transactions/{transaction_id}",
            get(payments::get_transaction),
        )
        .layer(Extension(state))
        .layer(TraceLayer::new_for_http())
        .layer(cors_layer)
}

/// Serve the API on `port` until the process is stopped
pub async fn start_server(state: ApiState, port: u16) -> Result<(), Box<dyn std::error::Error>> {
    let app = create_router(state);

    let addr = format!("0.0.0.0:{}", port);
    tracing::info!("Starting QueuePay API server on {}", addr);

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use axum::{body::Body, http::Request};
    use serde_json::json;
    use tower::ServiceExt;

    use super::*;
    use crate::test::{
        fake_device::FakeDevice,
        signed::{read_json, register_device, signed_request, test_state},
    };

    #[tokio::test]
    async fn test_health() {
        let app = create_router(test_state("http://127.0.0.1:9"));
        let response = app
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(read_json(response).await, json!({"status": "ok"}));
    }

    #[tokio::test]
    async fn test_vip_payment_binds_ticket_and_reconciles_device_report() {
        let device = FakeDevice::start().await;
        device.reply_with(json!({"payment_status": "PAID"}));
        let state = test_state(&device.base_url);
        register_device(&state, "dev-1", "secret-1", true);
        let app = create_router(state.clone());

        let request = Request::post("/v1/vip/payments")
            .header("content-type", "application/json")
            .body(Body::from(
                json!({
                    "transaction_id": "tx-1",
                    "device_id": "dev-1",
                    "establishment_id": "est-1",
                    "amount": 50
                })
                .to_string(),
            ))
            .unwrap();
        let response = app.clone().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let outcome = read_json(response).await;
        assert_eq!(outcome["confirmed"], json!(true));
        assert_eq!(outcome["status"], json!("CONFIRMED"));
        assert_eq!(outcome["esp32"]["attempts"], json!(1));
        let ticket_id = outcome["ticket_id"].as_str().unwrap().to_string();

        // A late device report cannot change a settled transaction
        let report = signed_request(
            "/v1/devices/payment-report",
            "dev-1",
            "secret-1",
            json!({"transaction_id": "tx-1", "status": "FAILED"}),
        );
        let response = app.clone().oneshot(report).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = read_json(response).await;
        assert_eq!(body["code"], json!("TRANSACTION_ALREADY_PROCESSED"));

        let response = app
            .oneshot(
                Request::get("/v1/transactions/tx-1")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let transaction = read_json(response).await;
        assert_eq!(transaction["status"], json!("CONFIRMED"));
        assert_eq!(transaction["ticket_id"], json!(ticket_id));
    }

    #[tokio::test]
    async fn test_vip_payment_rejects_invalid_amount() {
        let app = create_router(test_state("http://127.0.0.1:9"));
        let request = Request::post("/v1/vip/payments")
            .header("content-type", "application/json")
            .body(Body::from(
                json!({"device_id": "dev-1", "amount": -5}).to_string(),
            ))
            .unwrap();

        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body = read_json(response).await;
        assert_eq!(body["error"]["code"], json!("INVALID_REQUEST"));
    }

    #[tokio::test]
    async fn test_unknown_transaction_is_404() {
        let app = create_router(test_state("http://127.0.0.1:9"));
        let response = app
            .oneshot(
                Request::get("/v1/transactions/missing")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        let body = read_json(response).await;
        assert_eq!(body["error"]["code"], json!("TRANSACTION_NOT_FOUND"));
    }
}
