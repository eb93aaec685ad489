pub mod middleware;

use axum::{
    Extension, Json, Router,
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    routing::post,
};
use queuepay_types::{DeviceStatus, HeartbeatReport, PaymentReport, Transaction};
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::info;

use crate::{
    api::{ApiError, ApiState},
    signature::constant_time_eq,
};
use middleware::{AuthenticatedDevice, DeviceAuth, signed_post};

pub const PROVISIONING_TOKEN_HEADER: &str = "x-provisioning-token";

#[derive(Debug, Default, Deserialize)]
pub struct RegisterDeviceRequest {
    #[serde(default)]
    pub device_id: Option<String>,
    #[serde(default)]
    pub secret_key: Option<String>,
    #[serde(default)]
    pub establishment_id: Option<String>,
    #[serde(default)]
    pub firmware_version: Option<String>,
}

/// Credentials handed back once at registration
#[derive(Debug, Serialize)]
pub struct RegisteredDevice {
    pub device_id: String,
    pub secret_key: String,
    pub status: DeviceStatus,
}

fn generate_device_id() -> String {
    format!("dev_{}", uuid::Uuid::new_v4().simple())
}

fn generate_secret_key() -> String {
    let mut bytes = [0u8; 32];
    rand::rng().fill(&mut bytes);
    hex::encode(bytes)
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

/// POST /v1/devices/register
pub async fn register(
    Extension(state): Extension<ApiState>,
    headers: HeaderMap,
    Json(request): Json<RegisterDeviceRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let token = headers
        .get(PROVISIONING_TOKEN_HEADER)
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default();
    if !constant_time_eq(token.as_bytes(), state.provisioning_token.as_bytes()) {
        return Err(ApiError::InvalidProvisioningToken);
    }

    let device_id = non_empty(request.device_id).unwrap_or_else(generate_device_id);
    let secret_key = non_empty(request.secret_key).unwrap_or_else(generate_secret_key);
    let inserted = state.db_manager.insert_device(
        &device_id,
        &secret_key,
        request.establishment_id.as_deref(),
        request.firmware_version.as_deref(),
    )?;
    if !inserted {
        return Err(ApiError::DeviceAlreadyRegistered(device_id));
    }

    info!("Registered device {}", device_id);
    Ok((
        StatusCode::CREATED,
        Json(RegisteredDevice {
            device_id,
            secret_key,
            status: DeviceStatus::Disabled,
        }),
    ))
}

/// POST /v1/devices/activate
pub async fn activate(
    Extension(state): Extension<ApiState>,
    Extension(AuthenticatedDevice(device)): Extension<AuthenticatedDevice>,
) -> Result<impl IntoResponse, ApiError> {
    state
        .db_manager
        .set_device_status(&device.device_id, DeviceStatus::Active)?;
    info!("Activated device {}", device.device_id);
    Ok(Json(json!({
        "device_id": device.device_id,
        "status": DeviceStatus::Active,
    })))
}

/// POST /v1/devices/heartbeat
pub async fn heartbeat(
    Extension(state): Extension<ApiState>,
    Extension(AuthenticatedDevice(device)): Extension<AuthenticatedDevice>,
    Json(report): Json<HeartbeatReport>,
) -> Result<impl IntoResponse, ApiError> {
    state.db_manager.record_heartbeat(&device.device_id, &report)?;
    Ok(Json(json!({ "status": "ok" })))
}

#[derive(Debug, Serialize)]
pub struct PaymentReportAck {
    pub status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<&'static str>,
    pub transaction: Transaction,
}

/// POST /v1/devices/payment-report
pub async fn payment_report(
    Extension(state): Extension<ApiState>,
    Extension(AuthenticatedDevice(device)): Extension<AuthenticatedDevice>,
    Json(report): Json<PaymentReport>,
) -> Result<impl IntoResponse, ApiError> {
    info!(
        "Device {} reported {} for transaction {}",
        device.device_id, report.status, report.transaction_id
    );
    let transaction = state
        .ledger
        .find_by_transaction_id(&report.transaction_id)?
        .ok_or_else(|| ApiError::TransactionNotFound(report.transaction_id.clone()))?;
    if transaction.device_id != device.device_id {
        return Err(ApiError::DeviceMismatch {
            device_id: device.device_id,
            transaction_id: transaction.transaction_id,
        });
    }

    let write = state
        .ledger
        .apply_device_report(&report)?
        .ok_or_else(|| ApiError::TransactionNotFound(report.transaction_id.clone()))?;

    Ok(Json(PaymentReportAck {
        status: "ok",
        code: (!write.applied).then_some("TRANSACTION_ALREADY_PROCESSED"),
        transaction: write.transaction,
    }))
}

pub fn create_router(state: ApiState) -> Router<()> {
    Router::new()
        .route("/v1/devices/register", post(register))
        .route(
            "/v1/devices/activate",
            signed_post(activate, DeviceAuth::allow_disabled(state.clone())),
        )
        .route(
            "/v1/devices/heartbeat",
            signed_post(heartbeat, DeviceAuth::active_only(state.clone())),
        )
        .route(
            "/v1/devices/payment-report",
            signed_post(payment_report, DeviceAuth::active_only(state)),
        )
}
