use std::{sync::Arc, time::Duration};

use axum::{
    middleware,
    routing::{get, post},
    Router,
};

pub mod auth;
pub mod config;
pub mod domain;
pub mod errors;
pub mod http;
pub mod logging;
pub mod mcp;
pub mod transport;
pub mod upstream;

use config::Config;
use transport::sessions::SessionRegistry;
use upstream::{
    governor::{GovernorPolicy, RateGovernor},
    pagination::Paginator,
    GovernedClient, UpstreamApi,
};

#[derive(Clone)]
pub struct AppState {
    pub api_token: Option<Arc<str>>,
    pub sessions: SessionRegistry,
    pub upstream: GovernedClient,
    pub paginator: Paginator,
    pub keepalive: Duration,
    pub started_at: std::time::Instant,
}

impl AppState {
    pub fn new(api_token: Option<String>, upstream: GovernedClient) -> Self {
        Self {
            api_token: api_token.map(Arc::<str>::from),
            sessions: SessionRegistry::new(),
            upstream,
            paginator: Paginator::default(),
            keepalive: Duration::from_secs(15),
            started_at: std::time::Instant::now(),
        }
    }

    pub fn from_config(config: &Config, api: Arc<dyn UpstreamApi>) -> Self {
        let governor = RateGovernor::new(GovernorPolicy {
            reserve_threshold: config.rate_reserve_threshold,
            max_wait: config.rate_max_wait,
            ..GovernorPolicy::default()
        });

        Self {
            paginator: Paginator::new(config.pagination_max_pages, config.pagination_page_size),
            keepalive: config.sse_keepalive,
            ..Self::new(
                config.api_token.clone(),
                GovernedClient::new(api, Arc::new(governor)),
            )
        }
    }
}

pub fn build_app(state: AppState) -> Router {
    let protected = Router::new()
        .route(
            http::handlers::MCP_PATH,
            get(http::handlers::mcp_endpoint)
                .post(http::handlers::mcp_endpoint)
                .delete(http::handlers::mcp_delete),
        )
        .route(
            transport::event_stream::MESSAGES_PATH,
            post(http::handlers::messages),
        )
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            auth::require_bearer_token,
        ));

    Router::new()
        .route("/health", get(http::handlers::health))
        .route("/.well-known/mcp", get(http::handlers::discovery))
        .merge(protected)
        .layer(middleware::from_fn(logging::request_logging_middleware))
        .with_state(state)
}
