//! Axum HTTP handlers for the web server

use axum::{
    body::Bytes,
    extract::{Query, State},
    http::{HeaderMap, Method, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;

use crate::mcp::server::SUPPORTED_PROTOCOL_VERSIONS;
use crate::transport::{
    event_stream::{self, MESSAGES_PATH},
    negotiator::{
        accepts_event_stream, classify_endpoint, classify_side_channel, session_header, Route,
        SideChannelQuery,
    },
    protocol_error,
    sessions::{SessionCounts, TransportKind},
    streaming,
};
use crate::AppState;

pub const MCP_PATH: &str = "/mcp";

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub uptime_seconds: u64,
    pub sessions: SessionCounts,
}

#[derive(Debug, Serialize)]
pub struct DiscoveryResponse {
    pub name: &'static str,
    pub version: &'static str,
    pub mcp_endpoint: &'static str,
    pub messages_endpoint: &'static str,
    pub transports: [&'static str; 2],
    pub protocol_versions: &'static [&'static str],
}

pub async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        uptime_seconds: state.started_at.elapsed().as_secs(),
        sessions: state.sessions.counts(),
    })
}

pub async fn discovery() -> Json<DiscoveryResponse> {
    Json(DiscoveryResponse {
        name: env!("CARGO_PKG_NAME"),
        version: env!("CARGO_PKG_VERSION"),
        mcp_endpoint: MCP_PATH,
        messages_endpoint: MESSAGES_PATH,
        transports: [
            TransportKind::Streaming.as_str(),
            TransportKind::EventStream.as_str(),
        ],
        protocol_versions: &SUPPORTED_PROTOCOL_VERSIONS,
    })
}

/// `GET` and `POST` on the shared endpoint.
pub async fn mcp_endpoint(
    State(state): State<AppState>,
    method: Method,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let route = classify_endpoint(&method, &headers);
    serve_route(&state, route, accepts_event_stream(&headers), body).await
}

pub async fn mcp_delete(State(state): State<AppState>, headers: HeaderMap) -> Response {
    streaming::terminate(&state, session_header(&headers).as_deref())
}

pub async fn messages(
    State(state): State<AppState>,
    Query(query): Query<SideChannelQuery>,
    body: Bytes,
) -> Response {
    serve_route(&state, classify_side_channel(&query), false, body).await
}

async fn serve_route(state: &AppState, route: Route, accepts_stream: bool, body: Bytes) -> Response {
    match route {
        Route::OpenEventStream => match event_stream::open(state) {
            Ok(stream) => stream.into_response(),
            Err(err) => protocol_error(None, err),
        },
        Route::Capabilities => discovery().await.into_response(),
        Route::Streaming { session_id } => {
            streaming::handle(state, session_id, accepts_stream, body).await
        }
        Route::SideChannel { session_id } => {
            match event_stream::deliver(state, session_id.as_deref(), &body).await {
                Ok(()) => (StatusCode::ACCEPTED, "Accepted").into_response(),
                Err(err) => protocol_error(None, err),
            }
        }
    }
}
