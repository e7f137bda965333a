use std::time::Instant;

use axum::{
    extract::{Query, Request},
    middleware::Next,
    response::Response,
};
use tracing::{info, warn};
use tracing_subscriber::{fmt, EnvFilter};

use crate::transport::negotiator::{session_header, SideChannelQuery, SESSION_HEADER};

pub fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    fmt()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .init();
}

/// Session named by the request, from the header or the side-channel query.
fn request_session(request: &Request) -> Option<String> {
    session_header(request.headers()).or_else(|| {
        Query::<SideChannelQuery>::try_from_uri(request.uri())
            .ok()
            .and_then(|Query(query)| query.session().map(str::to_string))
    })
}

pub async fn request_logging_middleware(request: Request, next: Next) -> Response {
    let method = request.method().clone();
    let path = request.uri().path().to_string();
    let session = request_session(&request);
    let started_at = Instant::now();

    let response = next.run(request).await;
    let status = response.status();
    let elapsed_ms = started_at.elapsed().as_millis();
    // Streaming sessions are issued on the response of their first request.
    let session = session.or_else(|| {
        response
            .headers()
            .get(SESSION_HEADER)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string)
    });

    info!(
        method = %method,
        path = %path,
        status = status.as_u16(),
        duration_ms = elapsed_ms,
        session_id = session.as_deref().unwrap_or("-"),
        "request summary"
    );

    if status.as_u16() == 401 {
        warn!(method = %method, path = %path, "authentication failure");
    }

    response
}
