//! Request gate: applies the rate limiter to inbound HTTP requests.
//!
//! Two entry points share the same logic:
//! - [`RateLimitLayer`], a tower middleware guarding every request to a route
//!   under one category;
//! - [`Gate::check`], for handlers that need to decide mid-request.
//!
//! Requests carrying no caller context (no peer address, e.g. in-process
//! calls) are not rate limited.

use std::net::SocketAddr;
use std::sync::Arc;
use std::task::{Context, Poll};

use axum::extract::{ConnectInfo, Request};
use axum::http::{header, HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use futures::future::BoxFuture;
use serde_json::json;
use thiserror::Error;
use tower::{Layer, Service};
use tracing::{debug, error};

use crate::ratelimit::{resolve_identifier, split_forwarded_for, Decision, RateLimiter};

/// Header carrying the configured limit.
pub const HEADER_LIMIT: &str = "x-ratelimit-limit";
/// Header carrying the remaining quota.
pub const HEADER_REMAINING: &str = "x-ratelimit-remaining";
/// Header carrying the Unix time at which the quota resets.
pub const HEADER_RESET: &str = "x-ratelimit-reset";
/// Forwarded-for header consulted when forwarded addresses are trusted.
pub const HEADER_FORWARDED_FOR: &str = "x-forwarded-for";

/// An authenticated caller, inserted as a request extension by the
/// authentication layer in front of the gate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Principal {
    /// Stable principal identifier
    pub id: String,
    /// Whether the caller is privileged
    pub is_admin: bool,
}

/// Caller-identifying metadata extracted from a request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CallerContext {
    /// Direct peer address
    pub peer_address: Option<String>,
    /// Forwarded-for chain, originating client first
    pub forwarded_for: Vec<String>,
    /// Authenticated principal, if any
    pub principal: Option<Principal>,
}

impl CallerContext {
    /// The quota identifier, or `None` when the caller cannot be identified.
    pub fn identifier(&self) -> Option<String> {
        let peer = self
            .peer_address
            .as_deref()
            .or_else(|| self.forwarded_for.first().map(String::as_str))?;
        let principal = self.principal.as_ref().map(|p| p.id.as_str());
        Some(resolve_identifier(peer, &self.forwarded_for, principal))
    }

    /// Whether the caller is privileged.
    pub fn is_admin(&self) -> bool {
        self.principal.as_ref().is_some_and(|p| p.is_admin)
    }
}

/// Rejection returned to a caller that was not admitted.
#[derive(Debug, Error)]
pub enum Rejection {
    /// The caller exhausted its quota
    #[error("Rate limit exceeded")]
    LimitExceeded(Decision),

    /// The counter store is unavailable and the limiter fails closed
    #[error("Rate limiter unavailable: {0}")]
    Unavailable(String),
}

impl IntoResponse for Rejection {
    fn into_response(self) -> Response {
        match self {
            Rejection::LimitExceeded(decision) => {
                let body = json!({
                    "error_code": "rate_limit_exceeded",
                    "limit": decision.limit,
                    "window": decision.window_seconds,
                    "retry_after": decision.retry_after_seconds,
                });

                let mut response = (StatusCode::TOO_MANY_REQUESTS, Json(body)).into_response();
                let headers = response.headers_mut();
                apply_headers(&decision, headers);
                headers.insert(
                    header::RETRY_AFTER,
                    HeaderValue::from(decision.retry_after_seconds),
                );
                response
            }
            Rejection::Unavailable(_) => {
                let body = json!({ "error_code": "rate_limiter_unavailable" });
                (StatusCode::SERVICE_UNAVAILABLE, Json(body)).into_response()
            }
        }
    }
}

/// Attach the quota headers for a decision that applied a limit.
pub fn apply_headers(decision: &Decision, headers: &mut HeaderMap) {
    if !decision.is_limited() {
        return;
    }
    headers.insert(HEADER_LIMIT, HeaderValue::from(decision.limit));
    headers.insert(HEADER_REMAINING, HeaderValue::from(decision.remaining));
    headers.insert(HEADER_RESET, HeaderValue::from(decision.reset_epoch));
}

/// Shared entry point for gating requests.
#[derive(Clone)]
pub struct Gate {
    limiter: Arc<RateLimiter>,
    trust_forwarded_for: bool,
    trust_principal_headers: bool,
}

impl Gate {
    /// Create a gate over a limiter.
    ///
    /// `trust_forwarded_for` must only be set when a trusted proxy controls the
    /// `X-Forwarded-For` header.
    pub fn new(limiter: Arc<RateLimiter>, trust_forwarded_for: bool) -> Self {
        Self {
            limiter,
            trust_forwarded_for,
            trust_principal_headers: false,
        }
    }

    /// Accept principal identity headers set by the fronting proxy.
    ///
    /// Must only be set when that proxy strips the headers from client
    /// requests.
    pub fn with_principal_headers(mut self, trust: bool) -> Self {
        self.trust_principal_headers = trust;
        self
    }

    /// Whether principal identity headers are honoured.
    pub fn trusts_principal_headers(&self) -> bool {
        self.trust_principal_headers
    }

    /// Extract caller context from a request.
    pub fn caller_context<B>(&self, request: &axum::http::Request<B>) -> CallerContext {
        let peer_address = request
            .extensions()
            .get::<ConnectInfo<SocketAddr>>()
            .map(|ConnectInfo(addr)| addr.ip().to_string());

        let forwarded_for = if self.trust_forwarded_for {
            request
                .headers()
                .get_all(HEADER_FORWARDED_FOR)
                .iter()
                .filter_map(|value| value.to_str().ok())
                .flat_map(split_forwarded_for)
                .collect()
        } else {
            Vec::new()
        };

        CallerContext {
            peer_address,
            forwarded_for,
            principal: request.extensions().get::<Principal>().cloned(),
        }
    }

    /// Check a caller against a category.
    ///
    /// Returns `Ok(None)` when the caller cannot be identified and rate limiting
    /// does not apply, `Ok(Some(decision))` when admitted.
    pub async fn check(
        &self,
        caller: &CallerContext,
        category: &str,
    ) -> Result<Option<Decision>, Rejection> {
        let Some(identifier) = caller.identifier() else {
            debug!(category = %category, "No caller context; skipping rate limit");
            return Ok(None);
        };

        let decision = self
            .limiter
            .check_rate_limit(&identifier, category, caller.is_admin())
            .await
            .map_err(|e| {
                error!(error = %e, category = %category, "Rate limit check failed");
                Rejection::Unavailable(e.to_string())
            })?;

        if decision.allowed {
            Ok(Some(decision))
        } else {
            Err(Rejection::LimitExceeded(decision))
        }
    }

    /// Build a middleware layer limiting every request under `category`.
    pub fn layer(&self, category: impl Into<String>) -> RateLimitLayer {
        RateLimitLayer {
            gate: self.clone(),
            category: category.into().into(),
        }
    }
}

/// Rate limiting layer for tower.
#[derive(Clone)]
pub struct RateLimitLayer {
    gate: Gate,
    category: Arc<str>,
}

impl<S> Layer<S> for RateLimitLayer {
    type Service = RateLimitService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        RateLimitService {
            inner,
            gate: self.gate.clone(),
            category: self.category.clone(),
        }
    }
}

/// Rate limiting service.
#[derive(Clone)]
pub struct RateLimitService<S> {
    inner: S,
    gate: Gate,
    category: Arc<str>,
}

impl<S> Service<Request> for RateLimitService<S>
where
    S: Service<Request, Response = Response> + Clone + Send + 'static,
    S::Future: Send,
{
    type Response = Response;
    type Error = S::Error;
    type Future = BoxFuture<'static, Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, request: Request) -> Self::Future {
        // Use the clone that was driven to readiness.
        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);
        let gate = self.gate.clone();
        let category = self.category.clone();

        Box::pin(async move {
            let caller = gate.caller_context(&request);

            match gate.check(&caller, &category).await {
                Ok(decision) => {
                    let mut response = inner.call(request).await?;
                    if let Some(decision) = decision {
                        apply_headers(&decision, response.headers_mut());
                    }
                    Ok(response)
                }
                Err(rejection) => Ok(rejection.into_response()),
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RateLimitSettings;
    use crate::ratelimit::{MockClock, Strategy};
    use crate::store::MemoryStore;
    use axum::body::Body;
    use axum::routing::get;
    use axum::Router;
    use tower::ServiceExt;

    async fn test_gate(limit: &str, fail_open: bool, trust_forwarded_for: bool) -> Gate {
        let settings = RateLimitSettings {
            store_address: "memory://".to_string(),
            strategy: Strategy::SlidingWindow,
            fail_open,
            limits: [("api".to_string(), limit.to_string())].into_iter().collect(),
            ..RateLimitSettings::default()
        };
        let limiter = RateLimiter::with_store(
            settings,
            Arc::new(MemoryStore::new()),
            Arc::new(MockClock::new(1_700_000_000_000)),
        )
        .await
        .unwrap();
        Gate::new(Arc::new(limiter), trust_forwarded_for)
    }

    fn app(gate: &Gate) -> Router {
        Router::new()
            .route("/protected", get(|| async { "ok" }))
            .layer(gate.layer("api"))
    }

    fn request_from(peer: &str) -> axum::http::Request<Body> {
        let addr: SocketAddr = peer.parse().unwrap();
        axum::http::Request::builder()
            .uri("/protected")
            .extension(ConnectInfo(addr))
            .body(Body::empty())
            .unwrap()
    }

    #[test]
    fn test_caller_context_identifier() {
        let ctx = CallerContext {
            peer_address: Some("192.168.1.100".to_string()),
            forwarded_for: vec!["10.0.0.5".to_string(), "192.168.1.100".to_string()],
            principal: Some(Principal {
                id: "user123".to_string(),
                is_admin: false,
            }),
        };
        assert_eq!(ctx.identifier().as_deref(), Some("10.0.0.5:user123"));
        assert!(!ctx.is_admin());

        assert_eq!(CallerContext::default().identifier(), None);
    }

    #[tokio::test]
    async fn test_layer_admits_then_rejects() {
        let gate = test_gate("2/minute", true, false).await;
        let app = app(&gate);

        for expected_remaining in ["2", "1"] {
            let response = app.clone().oneshot(request_from("10.1.1.1:5000")).await.unwrap();
            assert_eq!(response.status(), StatusCode::OK);
            assert_eq!(response.headers()[HEADER_LIMIT], "2");
            assert_eq!(response.headers()[HEADER_REMAINING], expected_remaining);
            assert!(response.headers().contains_key(HEADER_RESET));
        }

        let response = app.clone().oneshot(request_from("10.1.1.1:5001")).await.unwrap();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(response.headers()[header::RETRY_AFTER], "60");
        assert_eq!(response.headers()[HEADER_REMAINING], "0");

        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let body: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(body["error_code"], "rate_limit_exceeded");
        assert_eq!(body["limit"], 2);
        assert_eq!(body["window"], 60);
        assert_eq!(body["retry_after"], 60);

        // A different caller has its own quota.
        let response = app.oneshot(request_from("10.2.2.2:5000")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_no_caller_context_skips_limit() {
        let gate = test_gate("1/minute", true, false).await;
        let app = app(&gate);

        for _ in 0..3 {
            let request = axum::http::Request::builder()
                .uri("/protected")
                .body(Body::empty())
                .unwrap();
            let response = app.clone().oneshot(request).await.unwrap();
            assert_eq!(response.status(), StatusCode::OK);
            assert!(!response.headers().contains_key(HEADER_LIMIT));
        }
    }

    #[tokio::test]
    async fn test_forwarded_for_only_when_trusted() {
        let untrusted = test_gate("1/minute", true, false).await;
        let request = axum::http::Request::builder()
            .uri("/protected")
            .header(HEADER_FORWARDED_FOR, "10.0.0.5, 192.168.1.100")
            .extension(ConnectInfo("192.168.1.100:4000".parse::<SocketAddr>().unwrap()))
            .body(Body::empty())
            .unwrap();
        assert_eq!(
            untrusted.caller_context(&request).identifier().as_deref(),
            Some("192.168.1.100")
        );

        let trusted = test_gate("1/minute", true, true).await;
        assert_eq!(
            trusted.caller_context(&request).identifier().as_deref(),
            Some("10.0.0.5")
        );
    }

    #[tokio::test]
    async fn test_admin_principal_bypasses() {
        let gate = test_gate("1/minute", true, false).await;
        let app = app(&gate);

        for _ in 0..3 {
            let mut request = request_from("10.1.1.1:5000");
            request.extensions_mut().insert(Principal {
                id: "root".to_string(),
                is_admin: true,
            });
            let response = app.clone().oneshot(request).await.unwrap();
            assert_eq!(response.status(), StatusCode::OK);
            assert!(!response.headers().contains_key(HEADER_LIMIT));
        }
    }

    #[tokio::test]
    async fn test_manual_check() {
        let gate = test_gate("1/minute", true, false).await;
        let caller = CallerContext {
            peer_address: Some("10.9.9.9".to_string()),
            ..CallerContext::default()
        };

        let decision = gate.check(&caller, "api").await.unwrap().unwrap();
        assert_eq!(decision.limit, 1);

        let rejection = gate.check(&caller, "api").await.unwrap_err();
        assert!(matches!(rejection, Rejection::LimitExceeded(d) if d.retry_after_seconds > 0));

        // Unlisted categories are admitted without metadata.
        let decision = gate.check(&caller, "healthz").await.unwrap().unwrap();
        assert!(!decision.is_limited());
    }

    #[test]
    fn test_unavailable_rejection_is_503() {
        let response = Rejection::Unavailable("down".to_string()).into_response();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }
}
