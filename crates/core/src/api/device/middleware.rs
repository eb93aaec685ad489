use axum::{
    Json,
    body::Body,
    extract::{OriginalUri, State},
    handler::Handler,
    http::{HeaderMap, Request, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{MethodRouter, post},
};
use queuepay_types::Device;
use serde_json::json;
use tracing::{debug, warn};

use crate::{
    api::ApiState,
    db::DbError,
    signature::{
        DEVICE_ID_HEADER, SIGNATURE_HEADER, SignatureError, SignatureMode, SignedRequest,
        TIMESTAMP_HEADER,
    },
};

/// Signed device requests are small; anything larger is rejected unread
const MAX_BODY_BYTES: usize = 64 * 1024;

#[derive(thiserror::Error, Debug)]
pub enum DeviceAuthError {
    #[error("Request is missing the X-Device-Id or X-Signature header")]
    UnsignedRequest,
    #[error("Unknown device {0}")]
    DeviceUnknown(String),
    #[error("Device {0} is disabled")]
    DeviceDisabled(String),
    #[error("Signature timestamp is outside the accepted window")]
    SignatureExpired,
    #[error("Invalid signature")]
    InvalidSignature,
    #[error("Failed to read request body: {0}")]
    UnreadableBody(String),
    #[error("Failed to look up device: {0}")]
    DeviceLookup(DbError),
}

impl DeviceAuthError {
    pub fn code(&self) -> &'static str {
        match self {
            DeviceAuthError::UnsignedRequest => "UNSIGNED_REQUEST",
            DeviceAuthError::DeviceUnknown(_) => "DEVICE_UNKNOWN",
            DeviceAuthError::DeviceDisabled(_) => "DEVICE_DISABLED",
            DeviceAuthError::SignatureExpired => "SIGNATURE_EXPIRED",
            DeviceAuthError::InvalidSignature => "INVALID_SIGNATURE",
            DeviceAuthError::UnreadableBody(_) => "UNREADABLE_BODY",
            DeviceAuthError::DeviceLookup(_) => "DEVICE_LOOKUP_FAILED",
        }
    }
}

impl From<SignatureError> for DeviceAuthError {
    fn from(error: SignatureError) -> Self {
        match error {
            SignatureError::Expired => DeviceAuthError::SignatureExpired,
            SignatureError::Invalid | SignatureError::InvalidKey => {
                DeviceAuthError::InvalidSignature
            }
        }
    }
}

impl IntoResponse for DeviceAuthError {
    fn into_response(self) -> Response {
        let (status, err_type) = match &self {
            DeviceAuthError::DeviceDisabled(_) => (StatusCode::FORBIDDEN, "authentication_error"),
            DeviceAuthError::UnreadableBody(_) => {
                (StatusCode::BAD_REQUEST, "invalid_request_error")
            }
            DeviceAuthError::DeviceLookup(_) => (StatusCode::INTERNAL_SERVER_ERROR, "api_error"),
            _ => (StatusCode::UNAUTHORIZED, "authentication_error"),
        };

        let body = json!({
            "error": {
                "code": self.code(),
                "message": self.to_string(),
                "type": err_type,
            }
        });
        (status, Json(body)).into_response()
    }
}

/// The device that signed the current request
#[derive(Debug, Clone)]
pub struct AuthenticatedDevice(pub Device);

/// State of the signature middleware for one route
#[derive(Clone)]
pub struct DeviceAuth {
    state: ApiState,
    /// Accept DISABLED devices (activation only)
    allow_disabled: bool,
}

impl DeviceAuth {
    pub fn active_only(state: ApiState) -> Self {
        Self {
            state,
            allow_disabled: false,
        }
    }

    pub fn allow_disabled(state: ApiState) -> Self {
        Self {
            state,
            allow_disabled: true,
        }
    }
}

fn header<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
}

/// Verify the HMAC signature of a device request and attach the device
pub async fn device_auth_middleware(
    State(auth): State<DeviceAuth>,
    req: Request<Body>,
    next: Next,
) -> Response {
    match authenticate(&auth, req).await {
        Ok(req) => next.run(req).await,
        Err(error) => {
            warn!("Rejected device request: {}", error);
            error.into_response()
        }
    }
}

async fn authenticate(
    auth: &DeviceAuth,
    req: Request<Body>,
) -> Result<Request<Body>, DeviceAuthError> {
    let (mut parts, body) = req.into_parts();

    let (Some(device_id), Some(signature)) = (
        header(&parts.headers, DEVICE_ID_HEADER),
        header(&parts.headers, SIGNATURE_HEADER),
    ) else {
        return Err(DeviceAuthError::UnsignedRequest);
    };
    let mode = SignatureMode::from_timestamp(header(&parts.headers, TIMESTAMP_HEADER));

    let device = auth
        .state
        .db_manager
        .find_device(device_id)
        .map_err(DeviceAuthError::DeviceLookup)?
        .ok_or_else(|| DeviceAuthError::DeviceUnknown(device_id.to_string()))?;
    if !device.is_active() && !auth.allow_disabled {
        return Err(DeviceAuthError::DeviceDisabled(device.device_id));
    }

    let body_bytes = axum::body::to_bytes(body, MAX_BODY_BYTES)
        .await
        .map_err(|e| DeviceAuthError::UnreadableBody(e.to_string()))?;

    let path = parts
        .extensions
        .get::<OriginalUri>()
        .map(|uri| uri.0.path())
        .unwrap_or_else(|| parts.uri.path());
    SignedRequest {
        device_id,
        signature,
        mode,
        method: parts.method.as_str(),
        path,
        body: &body_bytes,
    }
    .verify(
        &device.secret_key,
        &auth.state.signature,
        chrono::Utc::now().timestamp(),
    )?;

    debug!("Authenticated device {}", device.device_id);
    if let Err(e) = auth
        .state
        .db_manager
        .touch_device(&device.device_id, chrono::Utc::now().timestamp_millis())
    {
        warn!("Failed to update last_seen of {}: {}", device.device_id, e);
    }

    parts.extensions.insert(AuthenticatedDevice(device));
    Ok(Request::from_parts(parts, Body::from(body_bytes)))
}

/// A POST route that only accepts correctly signed device requests
pub fn signed_post<H, T>(handler: H, auth: DeviceAuth) -> MethodRouter
where
    H: Handler<T, ()>,
    T: 'static,
{
    post(handler).layer(middleware::from_fn_with_state(auth, device_auth_middleware))
}
