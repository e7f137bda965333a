//! Upstream REST API access
//!
//! Everything that talks to the email-marketing API lives here: the HTTP
//! client, the rate governor every call passes through, the response-shape
//! adapter for list endpoints and the paginated aggregator built on top.

pub mod client;
pub mod governor;
pub mod pagination;
pub mod shape;

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use governor::RateGovernor;
use pagination::{Page, PageRequest};
use shape::ResponseShape;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum UpstreamError {
    #[error("upstream rejected the request ({status}): {message}")]
    InvalidInput { status: u16, message: String },
    #[error("upstream denied access ({status}): {message}")]
    Forbidden { status: u16, message: String },
    #[error("upstream resource not found: {message}")]
    NotFound { message: String },
    #[error("upstream rate limit exceeded")]
    RateLimited { retry_after: Option<Duration> },
    #[error("rate budget exhausted; window resets in {resets_in:?}")]
    BudgetExhausted { resets_in: Duration },
    #[error("upstream unavailable: {message}")]
    Unavailable { status: Option<u16>, message: String },
    #[error("unexpected upstream response: {0}")]
    Decode(String),
    #[error("request cancelled")]
    Cancelled,
}

impl UpstreamError {
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Unavailable { .. })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpMethod {
    Get,
    Post,
}

#[derive(Debug, Clone, PartialEq)]
pub struct UpstreamRequest {
    pub method: HttpMethod,
    pub path: String,
    pub query: Vec<(String, String)>,
    pub body: Option<Value>,
}

impl UpstreamRequest {
    pub fn get(path: impl Into<String>) -> Self {
        Self {
            method: HttpMethod::Get,
            path: path.into(),
            query: Vec::new(),
            body: None,
        }
    }

    pub fn post(path: impl Into<String>, body: Value) -> Self {
        Self {
            method: HttpMethod::Post,
            path: path.into(),
            query: Vec::new(),
            body: Some(body),
        }
    }

    pub fn with_query(mut self, key: &str, value: impl Into<String>) -> Self {
        self.query.push((key.to_string(), value.into()));
        self
    }
}

/// Rate budget as reported by a single upstream response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateSnapshot {
    pub remaining: u32,
    pub resets_in: Duration,
}

#[derive(Debug, Clone, PartialEq)]
pub struct UpstreamReply {
    pub body: Value,
    pub rate: Option<RateSnapshot>,
}

#[async_trait]
pub trait UpstreamApi: Send + Sync {
    async fn send(&self, request: &UpstreamRequest) -> Result<UpstreamReply, UpstreamError>;
}

/// Where a list endpoint expects its cursor and page size.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CursorPlacement {
    Query,
    Body,
}

/// A cursor-paged list endpoint: the base request plus how to page it.
#[derive(Debug, Clone)]
pub struct ListEndpoint {
    pub request: UpstreamRequest,
    pub placement: CursorPlacement,
    pub cursor_field: &'static str,
    pub limit_field: &'static str,
    pub shape: ResponseShape,
}

impl ListEndpoint {
    pub fn new(request: UpstreamRequest, placement: CursorPlacement) -> Self {
        Self {
            request,
            placement,
            cursor_field: "starting_after",
            limit_field: "limit",
            shape: ResponseShape::Auto,
        }
    }

    pub fn page_request(&self, page: &PageRequest) -> UpstreamRequest {
        let mut request = self.request.clone();
        match self.placement {
            CursorPlacement::Query => {
                request
                    .query
                    .push((self.limit_field.to_string(), page.limit.to_string()));
                if let Some(cursor) = &page.cursor {
                    request
                        .query
                        .push((self.cursor_field.to_string(), cursor.clone()));
                }
            }
            CursorPlacement::Body => {
                let mut body = match request.body.take() {
                    Some(Value::Object(map)) => map,
                    _ => serde_json::Map::new(),
                };
                body.insert(self.limit_field.to_string(), Value::from(page.limit));
                if let Some(cursor) = &page.cursor {
                    body.insert(self.cursor_field.to_string(), Value::from(cursor.clone()));
                }
                request.body = Some(Value::Object(body));
            }
        }
        request
    }
}

/// Upstream access shared by all tool handlers: every call is routed
/// through the rate governor.
#[derive(Clone)]
pub struct GovernedClient {
    api: Arc<dyn UpstreamApi>,
    governor: Arc<RateGovernor>,
}

impl GovernedClient {
    pub fn new(api: Arc<dyn UpstreamApi>, governor: Arc<RateGovernor>) -> Self {
        Self { api, governor }
    }

    pub async fn call(
        &self,
        request: &UpstreamRequest,
        cancel: &CancellationToken,
    ) -> Result<Value, UpstreamError> {
        let reply = self
            .governor
            .execute(cancel, || self.api.send(request))
            .await?;
        Ok(reply.body)
    }

    /// Fetch one page of `endpoint`, normalized to items + next cursor.
    pub async fn fetch_page(
        &self,
        endpoint: &ListEndpoint,
        page: PageRequest,
        cancel: &CancellationToken,
    ) -> Result<Page, UpstreamError> {
        let request = endpoint.page_request(&page);
        let body = self.call(&request, cancel).await?;
        endpoint.shape.normalize(&body)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn query_placement_appends_limit_and_cursor() {
        let endpoint = ListEndpoint::new(
            UpstreamRequest::get("/campaigns").with_query("search", "spring"),
            CursorPlacement::Query,
        );

        let request = endpoint.page_request(&PageRequest {
            cursor: Some("c1".to_string()),
            limit: 100,
        });

        assert_eq!(
            request.query,
            vec![
                ("search".to_string(), "spring".to_string()),
                ("limit".to_string(), "100".to_string()),
                ("starting_after".to_string(), "c1".to_string()),
            ]
        );
    }

    #[test]
    fn body_placement_merges_into_filters() {
        let endpoint = ListEndpoint::new(
            UpstreamRequest::post("/leads/list", json!({ "campaign": "abc" })),
            CursorPlacement::Body,
        );

        let first = endpoint.page_request(&PageRequest {
            cursor: None,
            limit: 50,
        });
        assert_eq!(first.body, Some(json!({ "campaign": "abc", "limit": 50 })));

        let next = endpoint.page_request(&PageRequest {
            cursor: Some("lead-9".to_string()),
            limit: 50,
        });
        assert_eq!(
            next.body,
            Some(json!({ "campaign": "abc", "limit": 50, "starting_after": "lead-9" }))
        );
    }
}
