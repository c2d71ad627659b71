//! Error taxonomy for the dispatch core.
//!
//! One pattern-matchable enum covers every failure the core can surface.
//! The propagation policy lives with the variant: validation/auth/notfound/
//! conflict go straight to the caller, KV and vendor-temporary failures are
//! retried locally, saturation is a 429, drift is repaired in the background,
//! and anything unrecognized is a 500 whose details stay out of the response
//! body.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use thiserror::Error;

use crate::kernel::kv::KvError;

pub type CoreResult<T> = Result<T, CoreError>;

#[derive(Debug, Error)]
pub enum CoreError {
    /// Malformed input. Never retried; message is safe to expose.
    #[error("{0}")]
    Validation(String),

    /// Missing or invalid credentials.
    #[error("authentication required")]
    Unauthorized,

    /// Authenticated caller does not own the resource.
    #[error("access denied")]
    Forbidden,

    /// Resource missing. Dispatchers treat this as drop-job.
    #[error("{0} not found")]
    NotFound(&'static str),

    /// State-machine violation (resume a non-paused campaign, cancel a
    /// terminal one).
    #[error("{0}")]
    Conflict(String),

    /// The coordination store could not be reached or failed a command.
    /// Retryable with bounded attempts.
    #[error("coordination store unavailable")]
    KvUnavailable(#[source] KvError),

    /// Transient telephony-vendor failure; counts against the circuit
    /// breaker.
    #[error("vendor temporary failure: {0}")]
    VendorTemporary(String),

    /// Permanent vendor rejection (e.g. invalid number). Not retried.
    #[error("vendor permanent failure: {0}")]
    VendorPermanent(String),

    /// Limit reduction refused because the campaign is near saturation.
    #[error("campaign is near saturation: {active_calls} active calls, requested limit {requested_limit}")]
    NearSaturation {
        active_calls: i64,
        requested_limit: i64,
    },

    #[error(transparent)]
    Database(#[from] sqlx::Error),

    #[error(transparent)]
    Queue(#[from] dialq::QueueError),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl From<KvError> for CoreError {
    fn from(err: KvError) -> Self {
        CoreError::KvUnavailable(err)
    }
}

impl From<twilio::TwilioError> for CoreError {
    fn from(err: twilio::TwilioError) -> Self {
        if err.is_temporary() {
            CoreError::VendorTemporary(err.to_string())
        } else {
            CoreError::VendorPermanent(err.to_string())
        }
    }
}

impl CoreError {
    fn status_code(&self) -> StatusCode {
        match self {
            CoreError::Validation(_) => StatusCode::BAD_REQUEST,
            CoreError::Unauthorized => StatusCode::UNAUTHORIZED,
            CoreError::Forbidden => StatusCode::FORBIDDEN,
            CoreError::NotFound(_) => StatusCode::NOT_FOUND,
            CoreError::Conflict(_) => StatusCode::CONFLICT,
            CoreError::KvUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            CoreError::VendorTemporary(_) => StatusCode::BAD_GATEWAY,
            CoreError::VendorPermanent(_) => StatusCode::BAD_REQUEST,
            CoreError::NearSaturation { .. } => StatusCode::TOO_MANY_REQUESTS,
            CoreError::Database(sqlx::Error::RowNotFound) => StatusCode::NOT_FOUND,
            CoreError::Database(_) | CoreError::Queue(_) | CoreError::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    /// Message safe to put in an HTTP response body. Internal failures get a
    /// generic line; details stay in the logs.
    fn safe_message(&self) -> String {
        match self {
            CoreError::Database(sqlx::Error::RowNotFound) => "not found".to_string(),
            CoreError::Database(_) | CoreError::Queue(_) | CoreError::Internal(_) => {
                "internal server error".to_string()
            }
            CoreError::KvUnavailable(_) => "coordination store unavailable".to_string(),
            other => other.to_string(),
        }
    }
}

impl IntoResponse for CoreError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            tracing::error!(error = ?self, "request failed");
        }

        let body = match &self {
            CoreError::NearSaturation {
                active_calls,
                requested_limit,
            } => serde_json::json!({
                "error": "NearSaturation",
                "activeCalls": active_calls,
                "requestedLimit": requested_limit,
            }),
            other => serde_json::json!({ "error": other.safe_message() }),
        };

        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert_eq!(
            CoreError::Validation("bad phone".into()).status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(CoreError::Unauthorized.status_code(), StatusCode::UNAUTHORIZED);
        assert_eq!(CoreError::Forbidden.status_code(), StatusCode::FORBIDDEN);
        assert_eq!(
            CoreError::NotFound("campaign").status_code(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            CoreError::Conflict("already active".into()).status_code(),
            StatusCode::CONFLICT
        );
        assert_eq!(
            CoreError::NearSaturation {
                active_calls: 9,
                requested_limit: 5
            }
            .status_code(),
            StatusCode::TOO_MANY_REQUESTS
        );
    }

    #[test]
    fn test_row_not_found_maps_to_404() {
        let err = CoreError::Database(sqlx::Error::RowNotFound);
        assert_eq!(err.status_code(), StatusCode::NOT_FOUND);
    }

    #[test]
    fn test_internal_errors_hide_details() {
        let err = CoreError::Internal(anyhow::anyhow!("secret column exploded"));
        assert!(!err.safe_message().contains("secret"));
    }

    #[test]
    fn test_vendor_errors_split_by_transience() {
        let temp = twilio::TwilioError::Api {
            status: 503,
            code: None,
            message: "unavailable".into(),
        };
        assert!(matches!(
            CoreError::from(temp),
            CoreError::VendorTemporary(_)
        ));

        let perm = twilio::TwilioError::Api {
            status: 400,
            code: Some(21217),
            message: "invalid number".into(),
        };
        assert!(matches!(
            CoreError::from(perm),
            CoreError::VendorPermanent(_)
        ));
    }
}
