//! Protocol negotiation
//!
//! Both client populations talk to the same endpoint, so the transport
//! family is decided from the request itself: the `Accept` header picks the
//! event stream, everything else posted is the streaming transport, and the
//! side channel is routed by its session query parameter alone.

use axum::http::{header, HeaderMap, Method};
use serde::Deserialize;

pub const SESSION_HEADER: &str = "mcp-session-id";
pub const EVENT_STREAM_MIME: &str = "text/event-stream";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route {
    /// Open a long-lived event-stream channel.
    OpenEventStream,
    /// Serve the static capability document.
    Capabilities,
    /// Request/response exchange on the streaming transport.
    Streaming { session_id: Option<String> },
    /// Client to server delivery for an open event stream.
    SideChannel { session_id: Option<String> },
}

/// Query string of the side-channel endpoint. Legacy clients send
/// `sessionId`, newer ones `session`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SideChannelQuery {
    pub session: Option<String>,
    #[serde(rename = "sessionId")]
    pub session_id: Option<String>,
}

impl SideChannelQuery {
    /// First non-blank of `session` and `sessionId`.
    pub fn session(&self) -> Option<&str> {
        fn present(value: &Option<String>) -> Option<&str> {
            value.as_deref().map(str::trim).filter(|value| !value.is_empty())
        }

        present(&self.session).or_else(|| present(&self.session_id))
    }
}

pub fn classify_endpoint(method: &Method, headers: &HeaderMap) -> Route {
    if method == Method::GET {
        if accepts_event_stream(headers) {
            Route::OpenEventStream
        } else {
            Route::Capabilities
        }
    } else {
        Route::Streaming {
            session_id: session_header(headers),
        }
    }
}

pub fn classify_side_channel(query: &SideChannelQuery) -> Route {
    Route::SideChannel {
        session_id: query.session().map(str::to_string),
    }
}

pub fn session_header(headers: &HeaderMap) -> Option<String> {
    headers
        .get(SESSION_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
}

/// True when any `Accept` entry names the event-stream media type with a
/// non-zero quality.
pub fn accepts_event_stream(headers: &HeaderMap) -> bool {
    headers
        .get_all(header::ACCEPT)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .any(|entry| {
            let mut parts = entry.split(';').map(str::trim);
            let media_type = parts.next().unwrap_or_default();
            let rejected = parts.any(|param| {
                param
                    .strip_prefix("q=")
                    .and_then(|q| q.trim().parse::<f32>().ok())
                    .is_some_and(|q| q <= 0.0)
            });
            media_type.eq_ignore_ascii_case(EVENT_STREAM_MIME) && !rejected
        })
}

#[cfg(test)]
mod tests {
    use axum::http::HeaderValue;

    use super::*;

    fn headers(pairs: &[(&'static str, &'static str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (name, value) in pairs {
            map.append(*name, HeaderValue::from_static(value));
        }
        map
    }

    #[test]
    fn get_with_event_stream_accept_opens_channel() {
        let route = classify_endpoint(&Method::GET, &headers(&[("accept", "text/event-stream")]));
        assert_eq!(route, Route::OpenEventStream);
    }

    #[test]
    fn bare_get_returns_capabilities() {
        assert_eq!(
            classify_endpoint(&Method::GET, &HeaderMap::new()),
            Route::Capabilities
        );
        assert_eq!(
            classify_endpoint(&Method::GET, &headers(&[("accept", "application/json")])),
            Route::Capabilities
        );
    }

    #[test]
    fn post_is_streaming_and_carries_session_header() {
        let route = classify_endpoint(
            &Method::POST,
            &headers(&[
                ("accept", "application/json, text/event-stream"),
                ("mcp-session-id", "abc123"),
            ]),
        );
        assert_eq!(
            route,
            Route::Streaming {
                session_id: Some("abc123".to_string()),
            }
        );
    }

    #[test]
    fn accept_parsing_handles_params_and_case() {
        assert!(accepts_event_stream(&headers(&[(
            "accept",
            "application/json;q=0.9, Text/Event-Stream;q=0.5"
        )])));
        assert!(!accepts_event_stream(&headers(&[(
            "accept",
            "text/event-stream;q=0"
        )])));
        assert!(!accepts_event_stream(&headers(&[("accept", "*/*")])));
    }

    #[test]
    fn side_channel_accepts_both_parameter_names() {
        let modern = SideChannelQuery {
            session: Some("s1".to_string()),
            session_id: None,
        };
        let legacy = SideChannelQuery {
            session: None,
            session_id: Some("s2".to_string()),
        };

        assert_eq!(
            classify_side_channel(&modern),
            Route::SideChannel {
                session_id: Some("s1".to_string()),
            }
        );
        assert_eq!(legacy.session(), Some("s2"));
        assert_eq!(SideChannelQuery::default().session(), None);
        assert_eq!(
            SideChannelQuery {
                session: Some("  ".to_string()),
                session_id: None,
            }
            .session(),
            None
        );
    }

    #[test]
    fn blank_session_falls_back_to_legacy_name() {
        let query = SideChannelQuery {
            session: Some(String::new()),
            session_id: Some("s2".to_string()),
        };

        assert_eq!(query.session(), Some("s2"));
        assert_eq!(
            classify_side_channel(&query),
            Route::SideChannel {
                session_id: Some("s2".to_string()),
            }
        );
    }
}
