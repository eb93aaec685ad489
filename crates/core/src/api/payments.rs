use axum::{Extension, Json, extract::Path, response::IntoResponse};
use tracing::debug;

use crate::{
    api::{ApiError, ApiState},
    orchestrator::PaymentRequest,
};

/// POST /v1/vip/payments
///
/// Collects the payment on the device and issues a VIP ticket, in the order
/// configured by `vip_ticket_timing`. The outcome is returned even when the
/// payment did not go through; only invalid requests and storage failures
/// turn into error responses.
pub async fn create_vip_payment(
    Extension(state): Extension<ApiState>,
    Json(request): Json<PaymentRequest>,
) -> Result<impl IntoResponse, ApiError> {
    debug!(
        "VIP payment request for device {} ({:?})",
        request.device_id, state.vip_ticket_timing
    );
    let outcome = state
        .orchestrator
        .process_with_timing(request, state.vip_ticket_timing, &state.issuer)
        .await?;
    Ok(Json(outcome))
}

/// GET /v1/transactions/{transaction_id}
pub async fn get_transaction(
    Extension(state): Extension<ApiState>,
    Path(transaction_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let transaction = state
        .ledger
        .find_by_transaction_id(&transaction_id)?
        .ok_or(ApiError::TransactionNotFound(transaction_id))?;
    Ok(Json(transaction))
}
