//! Bearer-token authentication.
//!
//! Service-to-service auth: every API request carries the shared bearer
//! token plus an `x-user-id` header naming the acting user, which ownership
//! checks compare against campaign rows. Vendor webhooks bypass this layer
//! entirely - they authenticate with the per-call lease token instead.

use axum::extract::{Extension, Request};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use uuid::Uuid;

use crate::common::CoreError;
use crate::kernel::ServerDeps;

/// The authenticated principal, inserted into request extensions.
#[derive(Debug, Clone, Copy)]
pub struct AuthUser {
    pub user_id: Uuid,
}

pub async fn bearer_auth_middleware(
    Extension(deps): Extension<ServerDeps>,
    mut request: Request,
    next: Next,
) -> Response {
    let header = request
        .headers()
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok());

    let token = match header.and_then(|h| h.strip_prefix("Bearer ")) {
        Some(token) => token,
        None => return CoreError::Unauthorized.into_response(),
    };
    if token != deps.api_bearer_token {
        return CoreError::Unauthorized.into_response();
    }

    let user_id = request
        .headers()
        .get("x-user-id")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<Uuid>().ok());
    let Some(user_id) = user_id else {
        return CoreError::Validation("x-user-id header must be a UUID".to_string())
            .into_response();
    };

    request.extensions_mut().insert(AuthUser { user_id });
    next.run(request).await
}
