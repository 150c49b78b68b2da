//! Upstream provider adapter
//!
//! The orchestrator forwards through this seam; the shipped adapter
//! talks to an Anthropic-compatible backend over reqwest. An error
//! return means "this attempt failed, rotate to the next account";
//! non-retryable client responses pass through as responses.

use async_trait::async_trait;
use axum::http::{HeaderMap, StatusCode};
use bytes::Bytes;
use futures::stream::BoxStream;
use futures::StreamExt;
use reqwest::{header, Client};
use tokio::time::Duration;

use crate::error::ProxyError;
use crate::proxy::orchestrator::RequestMetadata;
use crate::proxy::pool::Account;
use crate::proxy::usage::TokenUsage;

const DEFAULT_BASE_URL: &str = "https://api.anthropic.com";
const ANTHROPIC_VERSION: &str = "2023-06-01";

/// Paths the backend provider accepts.
const ACCEPTED_PATHS: [&str; 2] = ["/v1/messages", "/v1/messages/count_tokens"];

/// Response handed back by a forward attempt.
pub struct ForwardedResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: ResponseBody,
    /// Token usage when it could be read off a buffered JSON response.
    pub usage: Option<TokenUsage>,
}

pub enum ResponseBody {
    Buffered(Bytes),
    Streaming(BoxStream<'static, Result<Bytes, std::io::Error>>),
}

impl ForwardedResponse {
    pub fn buffered(status: StatusCode, body: Bytes) -> Self {
        Self {
            status,
            headers: HeaderMap::new(),
            body: ResponseBody::Buffered(body),
            usage: None,
        }
    }
}

// Manual impl: the streaming body variant is opaque.
impl std::fmt::Debug for ForwardedResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let body = match &self.body {
            ResponseBody::Buffered(bytes) => format!("buffered({} bytes)", bytes.len()),
            ResponseBody::Streaming(_) => "streaming".to_string(),
        };
        f.debug_struct("ForwardedResponse")
            .field("status", &self.status)
            .field("body", &body)
            .field("usage", &self.usage)
            .finish_non_exhaustive()
    }
}

#[async_trait]
pub trait ProviderAdapter: Send + Sync {
    fn provider_name(&self) -> &str;

    /// Whether the backend accepts this request path at all.
    fn accepts_path(&self, path: &str) -> bool;

    /// One forward attempt. `account` is `None` for the unauthenticated
    /// fallback path. The body buffer is replayable; a fresh request
    /// stream is built per attempt.
    async fn forward(
        &self,
        account: Option<&Account>,
        metadata: &RequestMetadata,
        body: Bytes,
    ) -> Result<ForwardedResponse, ProxyError>;
}

pub struct AnthropicUpstream {
    client: Client,
    base_url: String,
}

impl AnthropicUpstream {
    pub fn new(base_url: Option<String>, proxy_url: Option<String>, request_timeout: u64) -> Self {
        let mut builder = Client::builder()
            .connect_timeout(Duration::from_secs(20))
            .pool_max_idle_per_host(16)
            .pool_idle_timeout(Duration::from_secs(90))
            .tcp_keepalive(Duration::from_secs(60))
            .timeout(Duration::from_secs(request_timeout))
            .user_agent("switchboard/0.1");

        if let Some(proxy) = proxy_url {
            if !proxy.is_empty() {
                if let Ok(p) = reqwest::Proxy::all(&proxy) {
                    builder = builder.proxy(p);
                    tracing::info!("Using outbound proxy: {}", proxy);
                }
            }
        }

        let client = builder.build().expect("Failed to create HTTP client");
        Self {
            client,
            base_url: base_url.unwrap_or_else(|| DEFAULT_BASE_URL.to_string()),
        }
    }

    /// Statuses worth rotating to the next account for.
    fn should_rotate(status: reqwest::StatusCode) -> bool {
        status == reqwest::StatusCode::UNAUTHORIZED
            || status == reqwest::StatusCode::FORBIDDEN
            || status == reqwest::StatusCode::TOO_MANY_REQUESTS
            || status == reqwest::StatusCode::REQUEST_TIMEOUT
            || status.is_server_error()
    }
}

#[async_trait]
impl ProviderAdapter for AnthropicUpstream {
    fn provider_name(&self) -> &str {
        "anthropic"
    }

    fn accepts_path(&self, path: &str) -> bool {
        ACCEPTED_PATHS.contains(&path)
    }

    async fn forward(
        &self,
        account: Option<&Account>,
        metadata: &RequestMetadata,
        body: Bytes,
    ) -> Result<ForwardedResponse, ProxyError> {
        let url = format!("{}{}", self.base_url, metadata.path);
        let method = metadata
            .method
            .parse::<reqwest::Method>()
            .unwrap_or(reqwest::Method::POST);

        let mut request = self
            .client
            .request(method, &url)
            .header(header::CONTENT_TYPE, "application/json")
            .header("anthropic-version", ANTHROPIC_VERSION)
            .body(body);
        if let Some(account) = account {
            request = request.header("x-api-key", &account.api_key);
        }

        let response = request
            .send()
            .await
            .map_err(|e| ProxyError::Forward(format!("request to {} failed: {}", url, e)))?;

        let status = response.status();
        if account.is_some() && Self::should_rotate(status) {
            let text = response.text().await.unwrap_or_default();
            let snippet: String = text.chars().take(200).collect();
            return Err(ProxyError::Forward(format!(
                "upstream returned {}: {}",
                status, snippet
            )));
        }

        let headers = response.headers().clone();
        let is_event_stream = headers
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.starts_with("text/event-stream"))
            .unwrap_or(false);

        if is_event_stream {
            let stream = response
                .bytes_stream()
                .map(|chunk| chunk.map_err(std::io::Error::other))
                .boxed();
            Ok(ForwardedResponse {
                status,
                headers,
                body: ResponseBody::Streaming(stream),
                usage: None,
            })
        } else {
            let bytes = response
                .bytes()
                .await
                .map_err(|e| ProxyError::Forward(format!("failed to read body: {}", e)))?;
            let usage = extract_usage(&bytes);
            Ok(ForwardedResponse {
                status,
                headers,
                body: ResponseBody::Buffered(bytes),
                usage,
            })
        }
    }
}

/// Read the `usage` object off a buffered JSON response, when present.
fn extract_usage(bytes: &Bytes) -> Option<TokenUsage> {
    let value: serde_json::Value = serde_json::from_slice(bytes).ok()?;
    let usage = value.get("usage")?;
    Some(TokenUsage {
        input_tokens: usage.get("input_tokens").and_then(|v| v.as_u64()).unwrap_or(0),
        output_tokens: usage.get("output_tokens").and_then(|v| v.as_u64()).unwrap_or(0),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_only_provider_paths() {
        let upstream = AnthropicUpstream::new(None, None, 600);
        assert!(upstream.accepts_path("/v1/messages"));
        assert!(upstream.accepts_path("/v1/messages/count_tokens"));
        assert!(!upstream.accepts_path("/v1/chat/completions"));
        assert!(!upstream.accepts_path("/admin"));
    }

    #[test]
    fn rotation_statuses() {
        use reqwest::StatusCode;
        assert!(AnthropicUpstream::should_rotate(StatusCode::UNAUTHORIZED));
        assert!(AnthropicUpstream::should_rotate(StatusCode::TOO_MANY_REQUESTS));
        assert!(AnthropicUpstream::should_rotate(StatusCode::BAD_GATEWAY));
        assert!(!AnthropicUpstream::should_rotate(StatusCode::BAD_REQUEST));
        assert!(!AnthropicUpstream::should_rotate(StatusCode::OK));
    }

    #[test]
    fn forwarded_response_debug_summarizes_the_body() {
        let response = ForwardedResponse::buffered(StatusCode::OK, Bytes::from_static(b"{}"));
        let rendered = format!("{:?}", response);
        assert!(rendered.contains("200"));
        assert!(rendered.contains("buffered(2 bytes)"));
    }

    #[test]
    fn usage_extraction_from_buffered_response() {
        let bytes = Bytes::from(r#"{"id":"m1","usage":{"input_tokens":7,"output_tokens":11}}"#);
        assert_eq!(
            extract_usage(&bytes),
            Some(TokenUsage {
                input_tokens: 7,
                output_tokens: 11
            })
        );
        assert!(extract_usage(&Bytes::from("not json")).is_none());
        assert!(extract_usage(&Bytes::from("{}")).is_none());
    }
}
