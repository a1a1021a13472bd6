// src/gatekeeper/middleware.rs
//! axum adapter for [`Gatekeeper`].
//!
//! ```ignore
//! let app = Router::new()
//!     .route("/api/items", get(list_items))
//!     .layer(axum::middleware::from_fn_with_state(gatekeeper, rate_limit));
//! ```

use axum::extract::{ConnectInfo, Request, State};
use axum::http::{header, HeaderMap, HeaderValue, StatusCode};
use axum::middleware::{self as axum_middleware, Next};
use axum::response::{IntoResponse, Response};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use super::{Decision, Gatekeeper, RateLimitHeaders};
use crate::rules::RequestInfo;

/// Error code carried in every 429 body
pub const RATE_LIMIT_EXCEEDED: &str = "RATE_LIMIT_EXCEEDED";

/// Authenticated caller, inserted as a request extension by upstream auth
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CallerIdentity {
    pub user_id: Option<String>,
    pub tenant_id: Option<String>,
}

/// JSON body of a 429 response
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RejectionBody {
    pub success: bool,
    pub error: RejectionError,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RejectionError {
    pub code: String,
    pub message: String,
    pub retry_after: u64,
}

impl RejectionBody {
    pub fn new(message: impl Into<String>, retry_after: u64) -> Self {
        Self {
            success: false,
            error: RejectionError {
                code: RATE_LIMIT_EXCEEDED.to_string(),
                message: message.into(),
                retry_after,
            },
        }
    }
}

/// Middleware function for `axum::middleware::from_fn_with_state`
pub async fn rate_limit(
    State(gatekeeper): State<Arc<Gatekeeper>>,
    request: Request,
    next: Next,
) -> Response {
    let info = request_info(&request, gatekeeper.trusts_proxy());

    match gatekeeper.evaluate(&info).await {
        Decision::Allow { headers } => {
            let mut response = next.run(request).await;
            if let Some(headers) = headers {
                headers.apply(response.headers_mut());
            }
            response
        }
        Decision::Reject {
            headers,
            message,
            retry_after,
        } => rejection_response(headers.as_ref(), message, retry_after),
    }
}

/// Wraps every route of `router` with the gatekeeper
pub fn protect<S>(router: Router<S>, gatekeeper: Arc<Gatekeeper>) -> Router<S>
where
    S: Clone + Send + Sync + 'static,
{
    router.layer(axum_middleware::from_fn_with_state(gatekeeper, rate_limit))
}

/// Builds the 429 response for a rejected request
pub fn rejection_response(
    headers: Option<&RateLimitHeaders>,
    message: String,
    retry_after: u64,
) -> Response {
    let mut response = (
        StatusCode::TOO_MANY_REQUESTS,
        Json(RejectionBody::new(message, retry_after)),
    )
        .into_response();

    if let Some(headers) = headers {
        headers.apply(response.headers_mut());
    }
    response
        .headers_mut()
        .insert(header::RETRY_AFTER, HeaderValue::from(retry_after));

    response
}

/// Extracts method, path, client IP and identity from an axum request.
///
/// Forwarding headers are read only when `trust_proxy` is set; otherwise the
/// IP is the socket peer from [`ConnectInfo`].
pub fn request_info(request: &Request, trust_proxy: bool) -> RequestInfo {
    let mut info = RequestInfo::new(request.method().as_str(), request.uri().path());

    let connect_info = request.extensions().get::<ConnectInfo<SocketAddr>>();
    let forwarded = if trust_proxy {
        forwarded_ip(request.headers())
    } else {
        None
    };
    if let Some(ip) = forwarded.or_else(|| connect_info.map(|ConnectInfo(addr)| addr.ip())) {
        info = info.with_ip(ip);
    }

    if let Some(identity) = request.extensions().get::<CallerIdentity>() {
        info.user_id = identity.user_id.clone();
        info.tenant_id = identity.tenant_id.clone();
    }

    info
}

/// First `X-Forwarded-For` entry, then `X-Real-IP`
fn forwarded_ip(headers: &HeaderMap) -> Option<IpAddr> {
    let header_ip = |name: &str, first_only: bool| {
        let value = headers.get(name)?.to_str().ok()?;
        let candidate = if first_only {
            value.split(',').next()?
        } else {
            value
        };
        candidate.trim().parse::<IpAddr>().ok()
    };

    header_ip("x-forwarded-for", true).or_else(|| header_ip("x-real-ip", false))
}
