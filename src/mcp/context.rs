//! Per-request execution context handed from a transport to the dispatcher.

use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::mcp::rpc::json_rpc_notification;
use crate::transport::sessions::TransportKind;

/// Sink for server-initiated notifications on the originating transport.
#[derive(Debug, Clone)]
pub struct Notifier {
    sender: mpsc::Sender<Value>,
}

impl Notifier {
    pub fn new(sender: mpsc::Sender<Value>) -> Self {
        Self { sender }
    }

    /// Waits for room on the transport channel. Gives up once `cancel`
    /// fires or the transport has gone away.
    pub async fn notify(&self, method: &str, params: Value, cancel: &CancellationToken) -> bool {
        let message = json_rpc_notification(method, params);
        let delivered = tokio::select! {
            biased;
            _ = cancel.cancelled() => false,
            sent = self.sender.send(message) => sent.is_ok(),
        };
        if !delivered {
            debug!(method, "notification dropped");
        }
        delivered
    }
}

#[derive(Debug, Clone)]
pub struct RequestContext {
    pub transport: TransportKind,
    pub session_id: String,
    pub cancel: CancellationToken,
    pub notifier: Option<Notifier>,
}

/// Progress reporting for a request that supplied `_meta.progressToken`.
#[derive(Debug, Clone)]
pub struct Progress {
    notifier: Notifier,
    token: Value,
}

impl Progress {
    pub fn from_params(notifier: Option<&Notifier>, params: Option<&Value>) -> Option<Self> {
        let token = params?.pointer("/_meta/progressToken")?;
        if !(token.is_string() || token.is_i64()) {
            return None;
        }
        Some(Self {
            notifier: notifier?.clone(),
            token: token.clone(),
        })
    }

    pub async fn report(&self, progress: usize, message: String, cancel: &CancellationToken) {
        self.notifier
            .notify(
                "notifications/progress",
                json!({
                    "progressToken": self.token,
                    "progress": progress,
                    "message": message,
                }),
                cancel,
            )
            .await;
    }
}

/// True when a request envelope asks for progress notifications.
pub fn wants_progress(message: &Value) -> bool {
    message.pointer("/params/_meta/progressToken").is_some()
}
