//! Streaming transport
//!
//! Every exchange is one POST. Answers come back inline as JSON, or as a
//! short-lived SSE stream when the client accepts one and asked for
//! progress, in which case notifications precede the final answer.

use std::convert::Infallible;

use async_stream::stream;
use axum::{
    body::Bytes,
    http::{HeaderValue, StatusCode},
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    Json,
};
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::debug;

use crate::mcp::context::{wants_progress, Notifier, RequestContext};
use crate::transport::{
    dispatch, parse_error, protocol_error,
    negotiator::SESSION_HEADER,
    sessions::{EvictReason, SessionChannel, SessionHandle, TransportKind},
    CHANNEL_CAPACITY,
};
use crate::{errors::AppError, AppState};

pub async fn handle(
    state: &AppState,
    session_id: Option<String>,
    accepts_stream: bool,
    body: Bytes,
) -> Response {
    let payload: Value = match serde_json::from_slice(&body) {
        Ok(value) => value,
        Err(_) => return parse_error(),
    };

    let session = match resolve_session(state, session_id.as_deref()) {
        Ok(session) => session,
        Err(err) => return protocol_error(payload.get("id").cloned(), err),
    };

    let mut response = if accepts_stream && requests_progress(&payload) {
        respond_with_stream(state, &session, payload).into_response()
    } else {
        respond_inline(state, &session, payload).await
    };

    if let Ok(value) = HeaderValue::from_str(&session.id) {
        response.headers_mut().insert(SESSION_HEADER, value);
    }
    response
}

/// Ends a streaming session on `DELETE /mcp`.
pub fn terminate(state: &AppState, session_id: Option<&str>) -> Response {
    let Some(session_id) = session_id else {
        return protocol_error(None, AppError::invalid_session(None));
    };

    if state
        .sessions
        .evict(TransportKind::Streaming, session_id, EvictReason::Terminated)
    {
        StatusCode::NO_CONTENT.into_response()
    } else {
        protocol_error(None, AppError::invalid_session(Some(session_id)))
    }
}

/// Continues the session named by the header, or opens one when the
/// client has none yet.
fn resolve_session(state: &AppState, session_id: Option<&str>) -> Result<SessionHandle, AppError> {
    let session_id = match session_id {
        Some(id) => id.to_string(),
        None => state
            .sessions
            .register(TransportKind::Streaming, SessionChannel::Inline)
            .map_err(|_| AppError::ShuttingDown)?,
    };

    state
        .sessions
        .lookup(TransportKind::Streaming, &session_id)
        .map_err(|err| err.into_app_error(&session_id))
}

fn requests_progress(payload: &Value) -> bool {
    match payload {
        Value::Array(batch) => batch.iter().any(wants_progress),
        single => wants_progress(single),
    }
}

async fn respond_inline(state: &AppState, session: &SessionHandle, payload: Value) -> Response {
    let ctx = RequestContext {
        transport: TransportKind::Streaming,
        session_id: session.id.clone(),
        cancel: session.cancel.child_token(),
        notifier: None,
    };

    match dispatch(state, &ctx, payload).await {
        Some(response) => (StatusCode::OK, Json(response)).into_response(),
        None => StatusCode::ACCEPTED.into_response(),
    }
}

fn respond_with_stream(
    state: &AppState,
    session: &SessionHandle,
    payload: Value,
) -> Sse<impl futures::Stream<Item = Result<Event, Infallible>>> {
    let (sender, mut receiver) = mpsc::channel::<Value>(CHANNEL_CAPACITY);
    let ctx = RequestContext {
        transport: TransportKind::Streaming,
        session_id: session.id.clone(),
        cancel: session.cancel.child_token(),
        notifier: Some(Notifier::new(sender.clone())),
    };
    // Dropping the response stream, e.g. on client disconnect, cancels the
    // work behind it.
    let abandon = ctx.cancel.clone().drop_guard();
    let keepalive = state.keepalive;

    let state = state.clone();
    tokio::spawn(async move {
        if let Some(response) = dispatch(&state, &ctx, payload).await {
            if sender.send(response).await.is_err() {
                debug!(session_id = %ctx.session_id, "response stream closed early");
            }
        }
    });

    let events = stream! {
        let _abandon = abandon;
        while let Some(message) = receiver.recv().await {
            yield Ok(Event::default().event("message").data(message.to_string()));
        }
    };

    Sse::new(events).keep_alive(KeepAlive::new().interval(keepalive))
}
