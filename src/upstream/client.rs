//! reqwest-backed upstream client

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use reqwest::header::HeaderMap;
use serde_json::Value;
use tracing::debug;

use super::{HttpMethod, RateSnapshot, UpstreamApi, UpstreamError, UpstreamReply, UpstreamRequest};

pub const RATE_REMAINING_HEADER: &str = "x-ratelimit-remaining";
pub const RATE_RESET_HEADER: &str = "x-ratelimit-reset";
pub const RETRY_AFTER_HEADER: &str = "retry-after";

/// Window assumed when upstream reports a remaining count without a reset.
const DEFAULT_RATE_WINDOW: Duration = Duration::from_secs(60);
/// Reset values above this are unix timestamps rather than deltas.
const EPOCH_THRESHOLD_SECS: f64 = 1_000_000_000.0;
/// Longest delay taken from a rate or retry header.
const MAX_HEADER_DELAY: Duration = Duration::from_secs(24 * 60 * 60);
const MAX_ERROR_MESSAGE_LEN: usize = 300;

#[derive(Debug, Clone)]
pub struct HttpUpstream {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
}

impl HttpUpstream {
    pub fn new(base_url: &str, api_key: &str, timeout: Duration) -> Result<Self, UpstreamError> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .pool_max_idle_per_host(10)
            .build()
            .map_err(|err| UpstreamError::Unavailable {
                status: None,
                message: format!("failed to build http client: {err}"),
            })?;

        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
        })
    }
}

#[async_trait]
impl UpstreamApi for HttpUpstream {
    async fn send(&self, request: &UpstreamRequest) -> Result<UpstreamReply, UpstreamError> {
        let url = format!("{}{}", self.base_url, request.path);
        let mut builder = match request.method {
            HttpMethod::Get => self.http.get(&url),
            HttpMethod::Post => self.http.post(&url),
        };
        builder = builder.bearer_auth(&self.api_key);
        if !request.query.is_empty() {
            builder = builder.query(&request.query);
        }
        if let Some(body) = &request.body {
            builder = builder.json(body);
        }

        let response = builder
            .send()
            .await
            .map_err(|err| UpstreamError::Unavailable {
                status: None,
                message: format!("request to {} failed: {err}", request.path),
            })?;

        let status = response.status().as_u16();
        let rate = parse_rate_headers(response.headers(), unix_now_secs());
        let retry_after = parse_retry_after(response.headers());
        let text = response
            .text()
            .await
            .map_err(|err| UpstreamError::Unavailable {
                status: Some(status),
                message: format!("failed to read response body: {err}"),
            })?;

        debug!(
            path = %request.path,
            status,
            remaining = rate.map(|snapshot| snapshot.remaining),
            "upstream call finished"
        );

        if (200..300).contains(&status) {
            let body = if text.trim().is_empty() {
                Value::Null
            } else {
                serde_json::from_str(&text)
                    .map_err(|err| UpstreamError::Decode(format!("invalid json body: {err}")))?
            };
            return Ok(UpstreamReply { body, rate });
        }

        Err(status_to_error(status, &text, retry_after))
    }
}

pub fn status_to_error(status: u16, body: &str, retry_after: Option<Duration>) -> UpstreamError {
    let message = extract_error_message(body);
    match status {
        401 | 403 => UpstreamError::Forbidden { status, message },
        404 => UpstreamError::NotFound { message },
        429 => UpstreamError::RateLimited { retry_after },
        400..=499 => UpstreamError::InvalidInput { status, message },
        _ => UpstreamError::Unavailable {
            status: Some(status),
            message,
        },
    }
}

fn extract_error_message(body: &str) -> String {
    let from_json = serde_json::from_str::<Value>(body).ok().and_then(|value| {
        value
            .get("message")
            .and_then(Value::as_str)
            .or_else(|| value.get("error").and_then(Value::as_str))
            .or_else(|| value.pointer("/error/message").and_then(Value::as_str))
            .map(str::to_string)
    });

    match from_json {
        Some(message) => message,
        None if body.trim().is_empty() => "no error message".to_string(),
        None => body.trim().chars().take(MAX_ERROR_MESSAGE_LEN).collect(),
    }
}

pub fn parse_rate_headers(headers: &HeaderMap, now_unix_secs: u64) -> Option<RateSnapshot> {
    let remaining = header_f64(headers, RATE_REMAINING_HEADER)?;
    let resets_in = match header_f64(headers, RATE_RESET_HEADER) {
        Some(value) if value > EPOCH_THRESHOLD_SECS => header_delay(value - now_unix_secs as f64),
        Some(value) => header_delay(value),
        None => DEFAULT_RATE_WINDOW,
    };

    Some(RateSnapshot {
        remaining: remaining.max(0.0).floor() as u32,
        resets_in,
    })
}

pub fn parse_retry_after(headers: &HeaderMap) -> Option<Duration> {
    header_f64(headers, RETRY_AFTER_HEADER)
        .filter(|secs| *secs >= 0.0)
        .map(header_delay)
}

fn header_delay(secs: f64) -> Duration {
    Duration::try_from_secs_f64(secs.max(0.0))
        .map_or(MAX_HEADER_DELAY, |delay| delay.min(MAX_HEADER_DELAY))
}

fn header_f64(headers: &HeaderMap, name: &str) -> Option<f64> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.trim().parse::<f64>().ok())
        .filter(|value| value.is_finite())
}

fn unix_now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

#[cfg(test)]
mod tests {
    use reqwest::header::HeaderValue;
    use serde_json::json;
    use wiremock::matchers::{body_json, header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::*;

    fn client(server: &MockServer) -> HttpUpstream {
        HttpUpstream::new(&server.uri(), "key-123", Duration::from_secs(5)).expect("client")
    }

    #[tokio::test]
    async fn get_sends_bearer_and_query_and_reads_rate_headers() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/campaigns"))
            .and(query_param("limit", "100"))
            .and(header("authorization", "Bearer key-123"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header(RATE_REMAINING_HEADER, "17")
                    .insert_header(RATE_RESET_HEADER, "42")
                    .set_body_json(json!({ "items": [], "next_starting_after": null })),
            )
            .expect(1)
            .mount(&server)
            .await;

        let reply = client(&server)
            .send(&UpstreamRequest::get("/campaigns").with_query("limit", "100"))
            .await
            .expect("successful call");

        assert_eq!(reply.body["items"], json!([]));
        assert_eq!(
            reply.rate,
            Some(RateSnapshot {
                remaining: 17,
                resets_in: Duration::from_secs(42),
            })
        );
    }

    #[tokio::test]
    async fn post_sends_json_body() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/leads/list"))
            .and(body_json(json!({ "limit": 10 })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "items": [1] })))
            .expect(1)
            .mount(&server)
            .await;

        let reply = client(&server)
            .send(&UpstreamRequest::post("/leads/list", json!({ "limit": 10 })))
            .await
            .expect("successful call");

        assert_eq!(reply.body["items"], json!([1]));
        assert_eq!(reply.rate, None);
    }

    #[tokio::test]
    async fn too_many_requests_carries_retry_after() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/accounts"))
            .respond_with(ResponseTemplate::new(429).insert_header(RETRY_AFTER_HEADER, "7"))
            .mount(&server)
            .await;

        let err = client(&server)
            .send(&UpstreamRequest::get("/accounts"))
            .await
            .expect_err("rate limited");

        assert_eq!(
            err,
            UpstreamError::RateLimited {
                retry_after: Some(Duration::from_secs(7)),
            }
        );
    }

    #[tokio::test]
    async fn client_errors_surface_upstream_message() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/emails"))
            .respond_with(
                ResponseTemplate::new(400)
                    .set_body_json(json!({ "message": "querystring/limit must be <= 100" })),
            )
            .mount(&server)
            .await;

        let err = client(&server)
            .send(&UpstreamRequest::get("/emails"))
            .await
            .expect_err("bad request");

        assert_eq!(
            err,
            UpstreamError::InvalidInput {
                status: 400,
                message: "querystring/limit must be <= 100".to_string(),
            }
        );
    }

    #[tokio::test]
    async fn server_errors_are_transient() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/accounts"))
            .respond_with(ResponseTemplate::new(503).set_body_string("maintenance"))
            .mount(&server)
            .await;

        let err = client(&server)
            .send(&UpstreamRequest::get("/accounts"))
            .await
            .expect_err("unavailable");

        assert!(err.is_transient());
    }

    #[test]
    fn epoch_reset_is_converted_to_delta() {
        let mut headers = HeaderMap::new();
        headers.insert(RATE_REMAINING_HEADER, HeaderValue::from_static("0"));
        headers.insert(RATE_RESET_HEADER, HeaderValue::from_static("1700000030"));

        let snapshot = parse_rate_headers(&headers, 1_700_000_000).expect("snapshot");
        assert_eq!(snapshot.remaining, 0);
        assert_eq!(snapshot.resets_in, Duration::from_secs(30));
    }

    #[test]
    fn missing_reset_defaults_to_one_minute() {
        let mut headers = HeaderMap::new();
        headers.insert(RATE_REMAINING_HEADER, HeaderValue::from_static("5"));

        let snapshot = parse_rate_headers(&headers, 0).expect("snapshot");
        assert_eq!(snapshot.resets_in, DEFAULT_RATE_WINDOW);
    }

    #[test]
    fn oversized_header_delays_are_capped() {
        let mut headers = HeaderMap::new();
        headers.insert(RATE_REMAINING_HEADER, HeaderValue::from_static("0"));
        headers.insert(RATE_RESET_HEADER, HeaderValue::from_static("1e19"));
        headers.insert(RETRY_AFTER_HEADER, HeaderValue::from_static("1e20"));

        let snapshot = parse_rate_headers(&headers, 1_700_000_000).expect("snapshot");
        assert_eq!(snapshot.resets_in, MAX_HEADER_DELAY);
        assert_eq!(parse_retry_after(&headers), Some(MAX_HEADER_DELAY));
    }

    #[test]
    fn past_epoch_reset_is_immediate() {
        let mut headers = HeaderMap::new();
        headers.insert(RATE_REMAINING_HEADER, HeaderValue::from_static("3"));
        headers.insert(RATE_RESET_HEADER, HeaderValue::from_static("1699999990"));

        let snapshot = parse_rate_headers(&headers, 1_700_000_000).expect("snapshot");
        assert_eq!(snapshot.resets_in, Duration::ZERO);
    }

    #[test]
    fn nested_error_message_is_extracted() {
        let err = status_to_error(403, r#"{"error":{"message":"scope missing"}}"#, None);
        assert_eq!(
            err,
            UpstreamError::Forbidden {
                status: 403,
                message: "scope missing".to_string(),
            }
        );
    }
}
