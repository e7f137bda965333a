//! The central Model Context Protocol engine
//!
//! Decodes JSON-RPC envelopes arriving on either transport, tracks each
//! request as pending on its session until answered, negotiates the protocol
//! version and routes tool calls to the domain handlers.

use rust_mcp_sdk::schema::{
    CallToolRequest, Implementation, InitializeRequest, InitializeResult, JsonrpcMessage,
    JsonrpcRequest, ListToolsRequest, ListToolsResult, PingRequest, ServerCapabilities,
    ServerCapabilitiesTools,
};
use serde_json::{json, Value};
use tracing::{debug, info};

use crate::domain::tools::{build_tools_list, handle_tools_call, ToolContext};
use crate::mcp::context::{Progress, RequestContext};
use crate::mcp::rpc::{
    app_error_to_json_rpc, is_json_rpc_error, json_rpc_result, request_id_to_value,
};
use crate::{errors::AppError, AppState};

/// Newest first.
pub const SUPPORTED_PROTOCOL_VERSIONS: [&str; 3] = ["2025-06-18", "2025-03-26", "2024-11-05"];
pub const LATEST_PROTOCOL_VERSION: &str = SUPPORTED_PROTOCOL_VERSIONS[0];

pub async fn handle_json_rpc_value(
    state: &AppState,
    ctx: &RequestContext,
    payload: Value,
) -> Option<Value> {
    if !payload.is_object() {
        return Some(invalid_request(None));
    }

    let request_id = payload.get("id").cloned();
    let parsed: JsonrpcMessage = match serde_json::from_value(payload) {
        Ok(message) => message,
        Err(_) => return Some(invalid_request(request_id)),
    };

    match parsed {
        JsonrpcMessage::Request(request) => {
            if let Err(error_response) = validate_request_shape(&request) {
                return Some(error_response);
            }

            let request_id = request_id_to_value(request.id);
            if request.method.trim().is_empty() {
                return Some(invalid_request(Some(request_id)));
            }

            let pending =
                match state
                    .sessions
                    .begin_request(ctx.transport, &ctx.session_id, &request_id)
                {
                    Ok(pending) => pending,
                    Err(err) => {
                        return Some(app_error_to_json_rpc(
                            Some(request_id),
                            err.into_app_error(&ctx.session_id),
                        ))
                    }
                };

            let request_cancel = ctx.cancel.child_token();
            let request_ctx = RequestContext {
                cancel: request_cancel.clone(),
                ..ctx.clone()
            };

            tokio::select! {
                _ = pending.cancel_token().cancelled() => {
                    request_cancel.cancel();
                    debug!(
                        session_id = %ctx.session_id,
                        request_id = %request_id,
                        "request cancelled before completion"
                    );
                    None
                }
                response = handle_json_rpc_request(
                    state,
                    &request_ctx,
                    Some(request_id.clone()),
                    request.method,
                    request.params.map(Value::Object),
                ) => Some(response),
            }
        }
        JsonrpcMessage::Notification(notification) => {
            if notification.method.trim().is_empty() {
                return None;
            }

            handle_notification(
                state,
                ctx,
                &notification.method,
                notification.params.map(Value::Object),
            );
            None
        }
        JsonrpcMessage::ResultResponse(_) | JsonrpcMessage::ErrorResponse(_) => {
            Some(invalid_request(request_id))
        }
    }
}

fn invalid_request(id: Option<Value>) -> Value {
    app_error_to_json_rpc(
        id,
        AppError::InvalidRequest {
            message: "expected a JSON-RPC 2.0 request or notification",
        },
    )
}

pub fn validate_request_shape(request: &JsonrpcRequest) -> Result<(), Value> {
    let payload = serde_json::to_value(request).expect("jsonrpc request serialization");
    let request_id = Some(request_id_to_value(request.id.clone()));

    let valid = match request.method.as_str() {
        "tools/call" => serde_json::from_value::<CallToolRequest>(payload).is_ok(),
        "tools/list" => serde_json::from_value::<ListToolsRequest>(payload).is_ok(),
        "ping" => serde_json::from_value::<PingRequest>(payload).is_ok(),
        "initialize" => serde_json::from_value::<InitializeRequest>(payload).is_ok(),
        _ => true,
    };

    if valid {
        Ok(())
    } else {
        Err(app_error_to_json_rpc(
            request_id,
            AppError::bad_request("invalid_params", "params do not match the method schema"),
        ))
    }
}

fn handle_notification(state: &AppState, ctx: &RequestContext, method: &str, params: Option<Value>) {
    match method {
        "notifications/cancelled" => {
            let Some(request_id) = params.as_ref().and_then(|params| params.get("requestId"))
            else {
                return;
            };
            let cancelled =
                state
                    .sessions
                    .cancel_pending(ctx.transport, &ctx.session_id, request_id);
            info!(
                session_id = %ctx.session_id,
                request_id = %request_id,
                cancelled,
                "client cancelled request"
            );
        }
        "notifications/initialized" => {
            debug!(session_id = %ctx.session_id, "client initialized");
        }
        other => {
            debug!(session_id = %ctx.session_id, method = other, "notification ignored");
        }
    }
}

pub async fn handle_json_rpc_request(
    state: &AppState,
    ctx: &RequestContext,
    id: Option<Value>,
    method: String,
    params: Option<Value>,
) -> Value {
    let audit_params = redact_audit_params(params.as_ref());

    let response = match method.as_str() {
        "initialize" => {
            let protocol_version = match negotiate_protocol_version(params.as_ref()) {
                Ok(version) => version,
                Err(err) => return app_error_to_json_rpc(id, err),
            };

            let initialize_result = InitializeResult {
                server_info: Implementation {
                    name: env!("CARGO_PKG_NAME").to_string(),
                    version: env!("CARGO_PKG_VERSION").to_string(),
                    title: None,
                    description: None,
                    icons: vec![],
                    website_url: None,
                },
                capabilities: ServerCapabilities {
                    tools: Some(ServerCapabilitiesTools {
                        list_changed: Some(false),
                    }),
                    resources: None,
                    prompts: None,
                    ..Default::default()
                },
                protocol_version: protocol_version.to_string(),
                instructions: Some(
                    "List tools return complete collections; check `complete` before \
                     treating a result as exhaustive."
                        .to_string(),
                ),
                meta: None,
            };

            json_rpc_result(
                id,
                serde_json::to_value(initialize_result).expect("initialize result serialization"),
            )
        }
        "ping" => json_rpc_result(id, json!({})),
        "tools/list" => json_rpc_result(
            id,
            serde_json::to_value(ListToolsResult {
                meta: None,
                next_cursor: None,
                tools: build_tools_list(),
            })
            .expect("tools list result serialization"),
        ),
        "tools/call" => {
            let tool_ctx = ToolContext {
                cancel: &ctx.cancel,
                progress: Progress::from_params(ctx.notifier.as_ref(), params.as_ref()),
            };
            handle_tools_call(state, &tool_ctx, id, params).await
        }
        _ => app_error_to_json_rpc(
            id,
            AppError::MethodNotFound {
                method: method.clone(),
            },
        ),
    };

    info!(
        method = %method,
        params = %audit_params,
        transport = ctx.transport.as_str(),
        session_id = %ctx.session_id,
        outcome = if is_json_rpc_error(&response) { "failure" } else { "success" },
        "mcp action audited"
    );

    response
}

/// Picks the protocol version for `initialize`: the client's offer when
/// supported, otherwise the newest version this server speaks.
pub fn negotiate_protocol_version(params: Option<&Value>) -> Result<&'static str, AppError> {
    let offered_version = params
        .and_then(Value::as_object)
        .and_then(|object| object.get("protocolVersion"))
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|version| !version.is_empty())
        .ok_or_else(|| {
            AppError::bad_request(
                "invalid_protocol_version",
                "initialize params.protocolVersion is required",
            )
        })?;

    Ok(SUPPORTED_PROTOCOL_VERSIONS
        .iter()
        .find(|version| **version == offered_version)
        .copied()
        .unwrap_or(LATEST_PROTOCOL_VERSION))
}

pub fn redact_audit_params(params: Option<&Value>) -> Value {
    params.map(redact_audit_value).unwrap_or(Value::Null)
}

pub fn redact_audit_value(value: &Value) -> Value {
    match value {
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(key, item)| {
                    if is_sensitive_key(key) {
                        (key.clone(), Value::String("[REDACTED]".to_string()))
                    } else {
                        (key.clone(), redact_audit_value(item))
                    }
                })
                .collect(),
        ),
        Value::Array(items) => Value::Array(items.iter().map(redact_audit_value).collect()),
        _ => value.clone(),
    }
}

pub fn is_sensitive_key(key: &str) -> bool {
    let normalized = key.trim().to_ascii_lowercase();
    matches!(
        normalized.as_str(),
        "authorization" | "bearer" | "credentials" | "credential" | "api_key" | "apikey"
    ) || normalized.contains("token")
        || normalized.contains("secret")
        || normalized.contains("password")
        || normalized.contains("credential")
}
