//! Telephony vendor status callbacks.

use axum::extract::{Extension, Query};
use axum::http::StatusCode;
use axum::Form;
use serde::Deserialize;
use tracing::debug;
use twilio::models::StatusCallbackPayload;

use crate::common::{CoreError, CoreResult};
use crate::kernel::ServerDeps;

#[derive(Debug, Deserialize)]
pub struct StatusCallbackQuery {
    /// Call-log id the dispatcher minted for this dial.
    pub call: String,
    /// Pre-dial lease token; authenticates the callback.
    pub token: String,
}

/// `POST /webhooks/twilio/status` - form-encoded status transitions.
///
/// Always answers 200 for handled-but-stale events so the vendor does not
/// retry them; genuine auth failures still surface as errors.
pub async fn twilio_status_handler(
    Extension(deps): Extension<ServerDeps>,
    Query(query): Query<StatusCallbackQuery>,
    Form(payload): Form<StatusCallbackPayload>,
) -> CoreResult<StatusCode> {
    let call_log_id = query
        .call
        .parse()
        .map_err(|_| CoreError::Validation("call must be a UUID".to_string()))?;

    debug!(
        call_log_id = %query.call,
        vendor_sid = %payload.call_sid,
        status = %payload.call_status,
        "vendor status callback"
    );

    deps.dispatch
        .handle_status_callback(call_log_id, &query.token, &payload)
        .await?;
    Ok(StatusCode::OK)
}
