//! HTTP middleware: CORS, correlation ids and access logging.

use std::time::Instant;

use axum::{
    extract::Request,
    http::{HeaderValue, Method, header},
    middleware::Next,
    response::Response,
};
use http::{HeaderName, header::InvalidHeaderValue};
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use uuid::Uuid;

pub const CORRELATION_ID_HEADER: HeaderName = HeaderName::from_static("x-correlation-id");

/// Correlation id of the current request, available as a request extension.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CorrelationId(pub String);

/// Reuses the caller's `X-Correlation-ID` or generates one, and echoes it on
/// the response.
pub async fn correlation_id(mut req: Request, next: Next) -> Response {
    let id = req
        .headers()
        .get(&CORRELATION_ID_HEADER)
        .and_then(|value| value.to_str().ok())
        .filter(|value| !value.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| Uuid::now_v7().to_string());

    req.extensions_mut().insert(CorrelationId(id.clone()));

    let mut response = next.run(req).await;
    if let Ok(value) = HeaderValue::from_str(&id) {
        response.headers_mut().insert(CORRELATION_ID_HEADER, value);
    }
    response
}

pub async fn access_log(req: Request, next: Next) -> Response {
    let start = Instant::now();
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let correlation_id = req
        .extensions()
        .get::<CorrelationId>()
        .map(|id| id.0.clone())
        .unwrap_or_else(|| "-".to_string());

    let response = next.run(req).await;

    log::info!(
        "[{}] {} {} {} {:?}",
        correlation_id,
        method,
        path,
        response.status().as_u16(),
        start.elapsed()
    );
    response
}

/// CORS for the configured origin; `*` allows any origin.
pub fn cors_layer(origin: &str) -> Result<CorsLayer, InvalidHeaderValue> {
    let allow_origin = match origin {
        "*" => AllowOrigin::from(Any),
        origin => AllowOrigin::exact(HeaderValue::from_str(origin)?),
    };

    Ok(CorsLayer::new()
        .allow_origin(allow_origin)
        .allow_methods([Method::GET, Method::OPTIONS])
        .allow_headers([header::CONTENT_TYPE, CORRELATION_ID_HEADER])
        .expose_headers([CORRELATION_ID_HEADER]))
}
