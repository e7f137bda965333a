//! Session registry
//!
//! Owns every session of both transport families. Registration, lookup and
//! eviction are serialized through one lock; transports only hold
//! `SessionHandle` clones and never mutate session state themselves.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tokio::{sync::mpsc, task::JoinHandle, time::Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::errors::AppError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportKind {
    Streaming,
    EventStream,
}

impl TransportKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Streaming => "streaming",
            Self::EventStream => "event_stream",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Open,
    Draining,
    Closed,
}

#[derive(Debug, Clone)]
pub enum SessionChannel {
    /// Server to client pipe of an event-stream session.
    Push(mpsc::Sender<Value>),
    /// Streaming sessions answer on the response of each POST.
    Inline,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvictReason {
    Disconnected,
    Terminated,
    IdleTimeout,
    Shutdown,
}

impl EvictReason {
    fn as_str(self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Terminated => "terminated",
            Self::IdleTimeout => "idle_timeout",
            Self::Shutdown => "shutdown",
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SessionError {
    #[error("unknown session")]
    Unknown,
    #[error("session is not open")]
    NotOpen,
    #[error("session channel closed")]
    ChannelClosed,
    #[error("server is shutting down")]
    ShuttingDown,
}

impl SessionError {
    pub fn into_app_error(self, session_id: &str) -> AppError {
        match self {
            Self::ShuttingDown => AppError::ShuttingDown,
            _ => AppError::invalid_session(Some(session_id)),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SessionCounts {
    pub streaming: usize,
    pub event_stream: usize,
}

#[derive(Debug, Clone)]
pub struct SessionHandle {
    pub id: String,
    pub kind: TransportKind,
    pub channel: SessionChannel,
    pub created_at: DateTime<Utc>,
    pub cancel: CancellationToken,
}

impl SessionHandle {
    /// Pushes an envelope down an event-stream session's pipe.
    pub async fn push(&self, message: Value) -> Result<(), SessionError> {
        match &self.channel {
            SessionChannel::Push(sender) => sender
                .send(message)
                .await
                .map_err(|_| SessionError::ChannelClosed),
            SessionChannel::Inline => Err(SessionError::ChannelClosed),
        }
    }
}

struct SessionEntry {
    kind: TransportKind,
    created_at: DateTime<Utc>,
    last_activity: Instant,
    state: SessionState,
    channel: SessionChannel,
    cancel: CancellationToken,
    pending: HashMap<String, (u64, CancellationToken)>,
}

impl SessionEntry {
    fn handle(&self, id: &str) -> SessionHandle {
        SessionHandle {
            id: id.to_string(),
            kind: self.kind,
            channel: self.channel.clone(),
            created_at: self.created_at,
            cancel: self.cancel.clone(),
        }
    }

    fn drain(&mut self) -> usize {
        self.state = SessionState::Draining;
        self.cancel.cancel();
        let dropped = self.pending.len();
        self.pending.clear();
        dropped
    }
}

#[derive(Default)]
struct RegistryState {
    sessions: HashMap<(TransportKind, String), SessionEntry>,
    shutting_down: bool,
    next_pending_seq: u64,
}

#[derive(Clone, Default)]
pub struct SessionRegistry {
    inner: Arc<Mutex<RegistryState>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, RegistryState> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn register(
        &self,
        kind: TransportKind,
        channel: SessionChannel,
    ) -> Result<String, SessionError> {
        let mut state = self.state();
        if state.shutting_down {
            return Err(SessionError::ShuttingDown);
        }

        let id = loop {
            let candidate = Uuid::new_v4().simple().to_string();
            if !state.sessions.contains_key(&(kind, candidate.clone())) {
                break candidate;
            }
        };

        state.sessions.insert(
            (kind, id.clone()),
            SessionEntry {
                kind,
                created_at: Utc::now(),
                last_activity: Instant::now(),
                state: SessionState::Open,
                channel,
                cancel: CancellationToken::new(),
                pending: HashMap::new(),
            },
        );

        info!(session_id = %id, transport = kind.as_str(), "session registered");
        Ok(id)
    }

    /// Resolves an open session and refreshes its activity timestamp.
    pub fn lookup(&self, kind: TransportKind, id: &str) -> Result<SessionHandle, SessionError> {
        let mut state = self.state();
        let entry = state
            .sessions
            .get_mut(&(kind, id.to_string()))
            .ok_or(SessionError::Unknown)?;
        if entry.state != SessionState::Open {
            return Err(SessionError::NotOpen);
        }
        entry.last_activity = Instant::now();
        Ok(entry.handle(id))
    }

    pub fn state_of(&self, kind: TransportKind, id: &str) -> SessionState {
        self.state()
            .sessions
            .get(&(kind, id.to_string()))
            .map_or(SessionState::Closed, |entry| entry.state)
    }

    pub fn evict(&self, kind: TransportKind, id: &str, reason: EvictReason) -> bool {
        let removed = self.state().sessions.remove(&(kind, id.to_string()));
        match removed {
            Some(mut entry) => {
                let dropped = entry.drain();
                info!(
                    session_id = %id,
                    transport = kind.as_str(),
                    reason = reason.as_str(),
                    pending_dropped = dropped,
                    "session evicted"
                );
                true
            }
            None => false,
        }
    }

    /// Evicts sessions without in-flight requests that have been idle
    /// longer than `max_idle`.
    pub fn evict_idle(&self, max_idle: Duration) -> usize {
        let now = Instant::now();
        let expired: Vec<(TransportKind, String)> = self
            .state()
            .sessions
            .iter()
            .filter(|(_, entry)| {
                entry.pending.is_empty()
                    && now.saturating_duration_since(entry.last_activity) > max_idle
            })
            .map(|(key, _)| key.clone())
            .collect();

        expired
            .into_iter()
            .filter(|(kind, id)| self.evict(*kind, id, EvictReason::IdleTimeout))
            .count()
    }

    /// Tracks an inbound request until its response has been produced.
    pub fn begin_request(
        &self,
        kind: TransportKind,
        id: &str,
        request_id: &Value,
    ) -> Result<PendingRequest, SessionError> {
        let mut state = self.state();
        state.next_pending_seq += 1;
        let seq = state.next_pending_seq;

        let entry = state
            .sessions
            .get_mut(&(kind, id.to_string()))
            .ok_or(SessionError::Unknown)?;
        if entry.state != SessionState::Open {
            return Err(SessionError::NotOpen);
        }

        let key = request_key(request_id);
        let cancel = entry.cancel.child_token();
        entry.pending.insert(key.clone(), (seq, cancel.clone()));
        entry.last_activity = Instant::now();

        Ok(PendingRequest {
            registry: self.clone(),
            kind,
            session_id: id.to_string(),
            key,
            seq,
            cancel,
        })
    }

    /// Cancels one in-flight request of a session.
    pub fn cancel_pending(&self, kind: TransportKind, id: &str, request_id: &Value) -> bool {
        let state = self.state();
        let Some(entry) = state.sessions.get(&(kind, id.to_string())) else {
            return false;
        };
        match entry.pending.get(&request_key(request_id)) {
            Some((_, cancel)) => {
                cancel.cancel();
                debug!(session_id = %id, request_id = %request_id, "pending request cancelled");
                true
            }
            None => false,
        }
    }

    fn resolve(&self, kind: TransportKind, id: &str, key: &str, seq: u64) {
        let mut state = self.state();
        if let Some(entry) = state.sessions.get_mut(&(kind, id.to_string())) {
            if entry.pending.get(key).is_some_and(|(owner, _)| *owner == seq) {
                entry.pending.remove(key);
            }
            entry.last_activity = Instant::now();
        }
    }

    pub fn counts(&self) -> SessionCounts {
        let state = self.state();
        state
            .sessions
            .values()
            .fold(SessionCounts::default(), |mut counts, entry| {
                match entry.kind {
                    TransportKind::Streaming => counts.streaming += 1,
                    TransportKind::EventStream => counts.event_stream += 1,
                }
                counts
            })
    }

    /// Stops accepting sessions, marks every session draining, cancels its
    /// in-flight requests and best-effort sends `notice` to push channels.
    pub fn drain_all(&self, notice: &Value) -> usize {
        let mut state = self.state();
        state.shutting_down = true;

        let mut drained = 0;
        for ((_, id), entry) in state.sessions.iter_mut() {
            if entry.state != SessionState::Open {
                continue;
            }
            let dropped = entry.drain();
            if let SessionChannel::Push(sender) = &entry.channel {
                if sender.try_send(notice.clone()).is_err() {
                    debug!(session_id = %id, "shutdown notice not delivered");
                }
            }
            if dropped > 0 {
                warn!(session_id = %id, pending_dropped = dropped, "dropping in-flight requests");
            }
            drained += 1;
        }
        drained
    }

    /// Removes every session; dropping their channels ends open streams.
    pub fn close_all(&self) -> usize {
        let closed: Vec<_> = self.state().sessions.drain().collect();
        let count = closed.len();
        for ((kind, id), mut entry) in closed {
            entry.drain();
            info!(
                session_id = %id,
                transport = kind.as_str(),
                reason = EvictReason::Shutdown.as_str(),
                "session evicted"
            );
        }
        count
    }

    pub fn shutdown(&self, notice: &Value) {
        let drained = self.drain_all(notice);
        self.close_all();
        info!(sessions = drained, "session registry shut down");
    }
}

/// An inbound request awaiting its response. Dropping it marks the request
/// resolved.
pub struct PendingRequest {
    registry: SessionRegistry,
    kind: TransportKind,
    session_id: String,
    key: String,
    seq: u64,
    cancel: CancellationToken,
}

impl PendingRequest {
    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }
}

impl Drop for PendingRequest {
    fn drop(&mut self) {
        self.registry
            .resolve(self.kind, &self.session_id, &self.key, self.seq);
    }
}

pub fn request_key(request_id: &Value) -> String {
    request_id.to_string()
}

pub fn spawn_idle_sweeper(
    registry: SessionRegistry,
    interval: Duration,
    max_idle: Duration,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    let evicted = registry.evict_idle(max_idle);
                    if evicted > 0 {
                        info!(evicted, "idle sessions swept");
                    }
                }
            }
        }
    })
}
