//! Proxy error taxonomy

use thiserror::Error;

/// Errors raised along the request path.
///
/// Interceptor stages map `Parse` and `Configuration` to "pass through
/// unmodified"; only `Validation` and `ServiceUnavailable` ever reach the
/// caller of the orchestrator.
#[derive(Debug, Error)]
pub enum ProxyError {
    /// Bad request path or malformed client input, rejected before any
    /// side effect.
    #[error("invalid request: {0}")]
    Validation(String),

    /// Malformed request body JSON.
    #[error("failed to parse request body: {0}")]
    Parse(#[from] serde_json::Error),

    /// Missing or unusable interceptor configuration.
    #[error("interceptor misconfigured: {0}")]
    Configuration(String),

    /// A single forward attempt failed. Swallowed by the orchestrator,
    /// which moves on to the next account.
    #[error("forward attempt failed: {0}")]
    Forward(String),

    /// No forward attempt produced a response, authenticated or not.
    #[error("service unavailable: provider {provider} produced no response ({attempted} account(s) attempted)")]
    ServiceUnavailable { attempted: usize, provider: String },

    /// A deferred key-value write failed. Logged, never surfaced.
    #[error("background write failed: {0}")]
    BackgroundWrite(String),
}
