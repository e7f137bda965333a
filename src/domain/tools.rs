//! Interactive tools exposed via Model Context Protocol
//!
//! Each list tool binds a page-fetch closure to its upstream endpoint and
//! cursor field and hands it to the paginated aggregator; `get_campaign` is
//! a single governed call.

use chrono::{SecondsFormat, Utc};
use rust_mcp_sdk::{
    macros,
    schema::{CallToolRequestParams, CallToolResult, ContentBlock, TextContent, Tool},
};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tokio_util::sync::CancellationToken;

use crate::domain::utils::{
    normalize_filter, normalize_optional_id, normalize_resource_id, paginator_for,
};
use crate::mcp::{
    context::Progress,
    rpc::{app_error_to_json_rpc, json_rpc_result},
};
use crate::upstream::{
    pagination::{Aggregation, Paginator},
    CursorPlacement, ListEndpoint, UpstreamRequest,
};
use crate::{errors::AppError, AppState};

pub struct ToolContext<'a> {
    pub cancel: &'a CancellationToken,
    pub progress: Option<Progress>,
}

#[macros::mcp_tool(
    name = "list_accounts",
    description = "List every sending account, following upstream pagination to the end"
)]
#[derive(Debug, Deserialize, Serialize, macros::JsonSchema)]
pub struct ListAccountsTool {
    pub search: Option<String>,
    pub status: Option<String>,
    pub page_size: Option<u32>,
    pub max_pages: Option<u32>,
}

#[macros::mcp_tool(
    name = "list_campaigns",
    description = "List every campaign, following upstream pagination to the end"
)]
#[derive(Debug, Deserialize, Serialize, macros::JsonSchema)]
pub struct ListCampaignsTool {
    pub search: Option<String>,
    pub status: Option<String>,
    pub page_size: Option<u32>,
    pub max_pages: Option<u32>,
}

#[macros::mcp_tool(
    name = "list_emails",
    description = "List emails, optionally for one campaign, following pagination to the end"
)]
#[derive(Debug, Deserialize, Serialize, macros::JsonSchema)]
pub struct ListEmailsTool {
    pub campaign_id: Option<String>,
    pub search: Option<String>,
    pub email_type: Option<String>,
    pub page_size: Option<u32>,
    pub max_pages: Option<u32>,
}

#[macros::mcp_tool(
    name = "list_leads",
    description = "List leads of a campaign or lead list, following pagination to the end"
)]
#[derive(Debug, Deserialize, Serialize, macros::JsonSchema)]
pub struct ListLeadsTool {
    pub campaign_id: Option<String>,
    pub list_id: Option<String>,
    pub search: Option<String>,
    pub page_size: Option<u32>,
    pub max_pages: Option<u32>,
}

#[macros::mcp_tool(name = "get_campaign", description = "Fetch a single campaign by id")]
#[derive(Debug, Deserialize, Serialize, macros::JsonSchema)]
pub struct GetCampaignTool {
    pub campaign_id: String,
}

pub fn build_tools_list() -> Vec<Tool> {
    vec![
        ListAccountsTool::tool(),
        ListCampaignsTool::tool(),
        ListEmailsTool::tool(),
        ListLeadsTool::tool(),
        GetCampaignTool::tool(),
    ]
}

pub async fn handle_tools_call(
    state: &AppState,
    ctx: &ToolContext<'_>,
    id: Option<Value>,
    params: Option<Value>,
) -> Value {
    let Some(raw_params) = params else {
        return app_error_to_json_rpc(
            id,
            AppError::bad_request("invalid_params", "tools/call requires params"),
        );
    };

    let tool_call: CallToolRequestParams = match serde_json::from_value(raw_params) {
        Ok(value) => value,
        Err(_) => {
            return app_error_to_json_rpc(
                id,
                AppError::bad_request("invalid_params", "tools/call params are malformed"),
            )
        }
    };

    let arguments = json!(tool_call.arguments.unwrap_or_default());
    match call_tool(state, ctx, &tool_call.name, arguments).await {
        Ok(result) => json_rpc_result(
            id,
            serde_json::to_value(result).expect("tool result serialization"),
        ),
        Err(err) => app_error_to_json_rpc(id, err),
    }
}

async fn call_tool(
    state: &AppState,
    ctx: &ToolContext<'_>,
    name: &str,
    arguments: Value,
) -> Result<CallToolResult, AppError> {
    match name {
        "list_accounts" => list_accounts(state, ctx, parse_arguments(arguments)?).await,
        "list_campaigns" => list_campaigns(state, ctx, parse_arguments(arguments)?).await,
        "list_emails" => list_emails(state, ctx, parse_arguments(arguments)?).await,
        "list_leads" => list_leads(state, ctx, parse_arguments(arguments)?).await,
        "get_campaign" => get_campaign(state, ctx, parse_arguments(arguments)?).await,
        other => Err(AppError::NotFound {
            code: "tool_not_found",
            message: format!("unknown tool: {other}"),
        }),
    }
}

fn parse_arguments<T: DeserializeOwned>(arguments: Value) -> Result<T, AppError> {
    serde_json::from_value(arguments)
        .map_err(|err| AppError::bad_request("invalid_arguments", err.to_string()))
}

async fn list_accounts(
    state: &AppState,
    ctx: &ToolContext<'_>,
    args: ListAccountsTool,
) -> Result<CallToolResult, AppError> {
    let paginator = paginator_for(state.paginator, args.page_size, args.max_pages)?;
    let mut request = UpstreamRequest::get("/accounts");
    if let Some(search) = normalize_filter(args.search) {
        request = request.with_query("search", search);
    }
    if let Some(status) = normalize_filter(args.status) {
        request = request.with_query("status", status);
    }

    let endpoint = ListEndpoint::new(request, CursorPlacement::Query);
    aggregate(state, ctx, paginator, &endpoint, "accounts").await
}

async fn list_campaigns(
    state: &AppState,
    ctx: &ToolContext<'_>,
    args: ListCampaignsTool,
) -> Result<CallToolResult, AppError> {
    let paginator = paginator_for(state.paginator, args.page_size, args.max_pages)?;
    let mut request = UpstreamRequest::get("/campaigns");
    if let Some(search) = normalize_filter(args.search) {
        request = request.with_query("search", search);
    }
    if let Some(status) = normalize_filter(args.status) {
        request = request.with_query("status", status);
    }

    let endpoint = ListEndpoint::new(request, CursorPlacement::Query);
    aggregate(state, ctx, paginator, &endpoint, "campaigns").await
}

async fn list_emails(
    state: &AppState,
    ctx: &ToolContext<'_>,
    args: ListEmailsTool,
) -> Result<CallToolResult, AppError> {
    let paginator = paginator_for(state.paginator, args.page_size, args.max_pages)?;
    let mut request = UpstreamRequest::get("/emails");
    if let Some(campaign_id) = normalize_optional_id("campaign_id", args.campaign_id)? {
        request = request.with_query("campaign_id", campaign_id);
    }
    if let Some(search) = normalize_filter(args.search) {
        request = request.with_query("search", search);
    }
    if let Some(email_type) = normalize_filter(args.email_type) {
        request = request.with_query("email_type", email_type);
    }

    let endpoint = ListEndpoint::new(request, CursorPlacement::Query);
    aggregate(state, ctx, paginator, &endpoint, "emails").await
}

async fn list_leads(
    state: &AppState,
    ctx: &ToolContext<'_>,
    args: ListLeadsTool,
) -> Result<CallToolResult, AppError> {
    let paginator = paginator_for(state.paginator, args.page_size, args.max_pages)?;
    let mut filters = Map::new();
    if let Some(campaign_id) = normalize_optional_id("campaign_id", args.campaign_id)? {
        filters.insert("campaign".to_string(), json!(campaign_id));
    }
    if let Some(list_id) = normalize_optional_id("list_id", args.list_id)? {
        filters.insert("list_id".to_string(), json!(list_id));
    }
    if let Some(search) = normalize_filter(args.search) {
        filters.insert("search".to_string(), json!(search));
    }

    let endpoint = ListEndpoint::new(
        UpstreamRequest::post("/leads/list", Value::Object(filters)),
        CursorPlacement::Body,
    );
    aggregate(state, ctx, paginator, &endpoint, "leads").await
}

async fn get_campaign(
    state: &AppState,
    ctx: &ToolContext<'_>,
    args: GetCampaignTool,
) -> Result<CallToolResult, AppError> {
    let campaign_id = normalize_resource_id("campaign_id", &args.campaign_id)?;
    let campaign = state
        .upstream
        .call(
            &UpstreamRequest::get(format!("/campaigns/{campaign_id}")),
            ctx.cancel,
        )
        .await?;

    Ok(tool_result(
        format!("Fetched campaign {campaign_id}"),
        Map::from_iter([
            ("campaign".to_string(), campaign),
            ("generated_at_utc".to_string(), json!(generated_at_utc())),
        ]),
    ))
}

async fn aggregate(
    state: &AppState,
    ctx: &ToolContext<'_>,
    paginator: Paginator,
    endpoint: &ListEndpoint,
    label: &'static str,
) -> Result<CallToolResult, AppError> {
    let upstream = &state.upstream;
    let aggregation = paginator
        .collect(
            ctx.cancel,
            |page| upstream.fetch_page(endpoint, page, ctx.cancel),
            |progress| async move {
                if let Some(reporter) = &ctx.progress {
                    reporter
                        .report(
                            progress.items,
                            format!("fetched {} {label} across {} pages", progress.items, progress.pages),
                            ctx.cancel,
                        )
                        .await;
                }
            },
        )
        .await?;

    Ok(aggregation_result(aggregation, label))
}

fn aggregation_result(aggregation: Aggregation, label: &str) -> CallToolResult {
    let count = aggregation.items.len();
    let pages = aggregation.pages;
    let complete = aggregation.is_complete();
    let truncated_reason = aggregation.truncated_reason();

    let summary = match truncated_reason {
        None => format!("Returned all {count} {label} ({pages} pages)"),
        Some(reason) => {
            format!("Returned {count} {label} from {pages} pages; truncated: {reason}")
        }
    };

    let mut structured = Map::from_iter([
        ("items".to_string(), Value::Array(aggregation.items)),
        ("count".to_string(), json!(count)),
        ("pages".to_string(), json!(pages)),
        ("complete".to_string(), json!(complete)),
        ("generated_at_utc".to_string(), json!(generated_at_utc())),
    ]);
    if let Some(reason) = truncated_reason {
        structured.insert("truncated_reason".to_string(), json!(reason));
    }

    tool_result(summary, structured)
}

fn tool_result(summary: String, structured: Map<String, Value>) -> CallToolResult {
    CallToolResult {
        content: vec![ContentBlock::from(TextContent::new(summary, None, None))],
        is_error: None,
        meta: None,
        structured_content: Some(structured),
    }
}

fn generated_at_utc() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}
