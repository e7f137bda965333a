//! Event-stream transport
//!
//! A client keeps `GET /mcp` open as an SSE stream and posts envelopes to
//! the side channel. The first event names the side-channel URL; every
//! answer then travels back down the stream as a `message` event.

use std::convert::Infallible;

use async_stream::stream;
use axum::{
    body::Bytes,
    response::sse::{Event, KeepAlive, Sse},
};
use futures::Stream;
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::debug;

use crate::mcp::context::{Notifier, RequestContext};
use crate::transport::{
    dispatch,
    sessions::{EvictReason, SessionChannel, SessionRegistry, TransportKind},
    CHANNEL_CAPACITY,
};
use crate::{errors::AppError, AppState};

pub const MESSAGES_PATH: &str = "/messages";

/// Evicts the session once the client goes away and the stream is dropped.
struct DisconnectGuard {
    registry: SessionRegistry,
    session_id: String,
}

impl Drop for DisconnectGuard {
    fn drop(&mut self) {
        self.registry.evict(
            TransportKind::EventStream,
            &self.session_id,
            EvictReason::Disconnected,
        );
    }
}

pub fn endpoint_url(session_id: &str) -> String {
    format!("{MESSAGES_PATH}?session={session_id}")
}

pub fn open(
    state: &AppState,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, AppError> {
    let (sender, mut receiver) = mpsc::channel::<Value>(CHANNEL_CAPACITY);
    let session_id = state
        .sessions
        .register(TransportKind::EventStream, SessionChannel::Push(sender))
        .map_err(|_| AppError::ShuttingDown)?;
    let guard = DisconnectGuard {
        registry: state.sessions.clone(),
        session_id: session_id.clone(),
    };
    let session = state
        .sessions
        .lookup(TransportKind::EventStream, &session_id)
        .map_err(|err| err.into_app_error(&session_id))?;

    let endpoint = endpoint_url(&session_id);
    let closed = session.cancel;
    let events = stream! {
        let _guard = guard;
        yield Ok(Event::default().event("endpoint").data(endpoint));

        loop {
            // Queued envelopes, such as a shutdown notice, go out before the
            // stream observes its session closing.
            let next = tokio::select! {
                biased;
                message = receiver.recv() => message,
                _ = closed.cancelled() => None,
            };
            let Some(message) = next else {
                break;
            };
            yield Ok(Event::default().event("message").data(message.to_string()));
        }
    };

    Ok(Sse::new(events).keep_alive(
        KeepAlive::new()
            .interval(state.keepalive)
            .text("keep-alive"),
    ))
}

/// Accepts one side-channel POST. Work continues in the background; its
/// answer is pushed down the session's stream.
pub async fn deliver(
    state: &AppState,
    session_id: Option<&str>,
    body: &Bytes,
) -> Result<(), AppError> {
    let session_id = session_id.ok_or_else(|| AppError::invalid_session(None))?;
    let session = state
        .sessions
        .lookup(TransportKind::EventStream, session_id)
        .map_err(|err| err.into_app_error(session_id))?;
    let SessionChannel::Push(sender) = &session.channel else {
        return Err(AppError::invalid_session(Some(session_id)));
    };

    let payload: Value = serde_json::from_slice(body).map_err(|_| AppError::Parse)?;
    let ctx = RequestContext {
        transport: TransportKind::EventStream,
        session_id: session.id.clone(),
        cancel: session.cancel.child_token(),
        notifier: Some(Notifier::new(sender.clone())),
    };

    let state = state.clone();
    tokio::spawn(async move {
        let Some(response) = dispatch(&state, &ctx, payload).await else {
            return;
        };
        if session.push(response).await.is_err() {
            debug!(session_id = %session.id, "stream closed before response was delivered");
        }
    });

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoint_event_points_at_side_channel() {
        assert_eq!(endpoint_url("abc"), "/messages?session=abc");
    }
}
