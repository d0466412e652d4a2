//! Admission service handlers.
//!
//! Exposes the gate over HTTP so that a fronting proxy (or a handler written
//! in another language) can ask for a decision before doing the work itself.
//! The proxy forwards the client chain in `X-Forwarded-For` and, when it has
//! authenticated the caller, the principal in `X-Principal-Id` /
//! `X-Principal-Admin`. Each is ignored unless the matching `server.trust_*`
//! option is set.

use axum::extract::{Path, Request, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use tracing::{debug, instrument, warn};

use super::gate::{apply_headers, Gate, Principal};

/// Header carrying the authenticated principal ID.
pub const HEADER_PRINCIPAL_ID: &str = "x-principal-id";
/// Header flagging a privileged principal (`true` / `1`).
pub const HEADER_PRINCIPAL_ADMIN: &str = "x-principal-admin";

/// Read the principal forwarded by the fronting proxy.
pub fn principal_from_headers(headers: &HeaderMap) -> Option<Principal> {
    let id = headers
        .get(HEADER_PRINCIPAL_ID)?
        .to_str()
        .ok()?
        .trim()
        .to_string();
    if id.is_empty() {
        return None;
    }

    let is_admin = headers
        .get(HEADER_PRINCIPAL_ADMIN)
        .and_then(|v| v.to_str().ok())
        .map(|v| matches!(v.trim().to_ascii_lowercase().as_str(), "true" | "1" | "yes"))
        .unwrap_or(false);

    Some(Principal { id, is_admin })
}

/// Decide whether the caller described by the request may perform an
/// operation in `category`.
#[instrument(skip_all, fields(category = %category))]
pub async fn admit(
    State(gate): State<Gate>,
    Path(category): Path<String>,
    request: Request,
) -> Response {
    if category.trim().is_empty() {
        warn!("Received admission request with empty category");
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({ "error_code": "invalid_category" })),
        )
            .into_response();
    }

    let mut caller = gate.caller_context(&request);
    if caller.principal.is_none() && gate.trusts_principal_headers() {
        caller.principal = principal_from_headers(request.headers());
    }

    match gate.check(&caller, &category).await {
        Ok(decision) => {
            let decision = decision.unwrap_or_default();
            let body = json!({
                "allowed": true,
                "limit": decision.limit,
                "remaining": decision.remaining,
                "reset": decision.reset_epoch,
                "bypassed": decision.bypassed,
            });

            debug!(limit = decision.limit, remaining = decision.remaining, "Admitted");

            let mut response = (StatusCode::OK, Json(body)).into_response();
            apply_headers(&decision, response.headers_mut());
            response
        }
        Err(rejection) => rejection.into_response(),
    }
}

/// Liveness probe; never rate limited.
pub async fn healthz() -> &'static str {
    "ok"
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn test_principal_from_headers() {
        let mut headers = HeaderMap::new();
        assert_eq!(principal_from_headers(&headers), None);

        headers.insert(HEADER_PRINCIPAL_ID, HeaderValue::from_static("user123"));
        assert_eq!(
            principal_from_headers(&headers),
            Some(Principal {
                id: "user123".to_string(),
                is_admin: false
            })
        );

        headers.insert(HEADER_PRINCIPAL_ADMIN, HeaderValue::from_static("TRUE"));
        assert!(principal_from_headers(&headers).unwrap().is_admin);
    }

    #[test]
    fn test_blank_principal_ignored() {
        let mut headers = HeaderMap::new();
        headers.insert(HEADER_PRINCIPAL_ID, HeaderValue::from_static("  "));
        headers.insert(HEADER_PRINCIPAL_ADMIN, HeaderValue::from_static("true"));
        assert_eq!(principal_from_headers(&headers), None);
    }
}
