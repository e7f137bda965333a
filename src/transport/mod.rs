//! Transport families carrying JSON-RPC envelopes
//!
//! `streaming` answers on the POST response itself, `event_stream` pushes
//! answers down a long-lived SSE channel fed by a side-channel POST. Both
//! hand decoded payloads to [`dispatch`].

pub mod event_stream;
pub mod negotiator;
pub mod sessions;
pub mod streaming;

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use futures::future::join_all;
use serde_json::Value;

use crate::mcp::{context::RequestContext, rpc::app_error_to_json_rpc, server::handle_json_rpc_value};
use crate::{errors::AppError, AppState};

/// Buffered envelopes per push channel before senders wait.
pub const CHANNEL_CAPACITY: usize = 64;

/// Runs a single envelope or a batch. Batch members run concurrently so a
/// `notifications/cancelled` can reach a sibling request; answers keep the
/// batch order. Returns `None` when nothing needs answering.
pub async fn dispatch(state: &AppState, ctx: &RequestContext, payload: Value) -> Option<Value> {
    match payload {
        Value::Array(batch) if batch.is_empty() => Some(app_error_to_json_rpc(
            None,
            AppError::InvalidRequest {
                message: "batch must not be empty",
            },
        )),
        Value::Array(batch) => {
            let responses: Vec<Value> = join_all(
                batch
                    .into_iter()
                    .map(|item| handle_json_rpc_value(state, ctx, item)),
            )
            .await
            .into_iter()
            .flatten()
            .collect();
            (!responses.is_empty()).then_some(Value::Array(responses))
        }
        single => handle_json_rpc_value(state, ctx, single).await,
    }
}

/// A JSON-RPC error envelope carried with the HTTP status of the error.
pub fn protocol_error(id: Option<Value>, err: AppError) -> Response {
    (err.status(), Json(app_error_to_json_rpc(id, err))).into_response()
}

/// Malformed JSON on the streaming endpoint is still answered in-band.
pub fn parse_error() -> Response {
    (StatusCode::OK, Json(app_error_to_json_rpc(None, AppError::Parse))).into_response()
}
