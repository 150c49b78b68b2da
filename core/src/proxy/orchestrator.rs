//! Proxy orchestrator
//!
//! One pass per inbound request: validate the path, run the two
//! interception stages in fixed order, ask the selection strategy for an
//! ordered account list, then attempt forwards sequentially until one
//! answers. Per-attempt failures are swallowed; only total exhaustion
//! surfaces to the caller.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use rand::Rng;
use std::sync::Arc;
use std::time::Instant;

use crate::directory::AgentDirectory;
use crate::error::ProxyError;
use crate::proxy::deferred::BackgroundWriter;
use crate::proxy::intercept::{AgentInterceptor, AgentOutcome, SystemPromptInterceptor};
use crate::proxy::pool::{Account, SelectionStrategy};
use crate::proxy::upstream::{ForwardedResponse, ProviderAdapter};
use crate::proxy::usage::{UsageChannel, UsagePayload};
use crate::store::{ConfigStore, SYSTEM_PROMPT_CONFIG_ID};

/// Per-request tracking metadata handed to the selection strategy and
/// the provider adapter.
#[derive(Debug, Clone)]
pub struct RequestMetadata {
    pub method: String,
    pub path: String,
    pub timestamp: DateTime<Utc>,
    pub agent_id: Option<String>,
    pub trace_id: String,
}

pub struct Orchestrator {
    store: Arc<dyn ConfigStore>,
    adapter: Arc<dyn ProviderAdapter>,
    strategy: Arc<dyn SelectionStrategy>,
    usage: Arc<UsageChannel>,
    system_prompt: SystemPromptInterceptor,
    agent: AgentInterceptor,
}

impl Orchestrator {
    /// Build the pipeline. Must be called within a tokio runtime (the
    /// background KV writer is spawned here).
    pub fn new(
        store: Arc<dyn ConfigStore>,
        directory: Arc<dyn AgentDirectory>,
        adapter: Arc<dyn ProviderAdapter>,
        strategy: Arc<dyn SelectionStrategy>,
        usage: Arc<UsageChannel>,
    ) -> Self {
        let writer = BackgroundWriter::spawn(store.clone());
        let system_prompt = SystemPromptInterceptor::new(writer);
        let agent = AgentInterceptor::new(directory, SystemPromptInterceptor::without_recorder());
        Self {
            store,
            adapter,
            strategy,
            usage,
            system_prompt,
            agent,
        }
    }

    /// Single entry point: a buffered inbound request in, a forwarded
    /// response (or `Validation`/`ServiceUnavailable`) out.
    pub async fn handle(
        &self,
        method: &str,
        path: &str,
        body: Bytes,
    ) -> Result<ForwardedResponse, ProxyError> {
        if !self.adapter.accepts_path(path) {
            return Err(ProxyError::Validation(format!(
                "provider {} does not accept path {}",
                self.adapter.provider_name(),
                path
            )));
        }

        let trace_id = trace_id();
        let config = self.store.interceptor_config(SYSTEM_PROMPT_CONFIG_ID);

        // Stage 1: system-prompt rewrite on the raw buffer.
        let prompt_pass = self.system_prompt.intercept(Some(&body), config.as_ref());
        let stage1_modified = prompt_pass.is_some();
        let current = prompt_pass.unwrap_or(body);

        // Stage 2: agent detection; threads the prompt pass through the
        // same decoded object, so ordering is fixed by construction.
        let outcome = self.agent.intercept(Some(&current), config.as_ref());
        let prompt_modified = stage1_modified || outcome.prompt_modified;
        if prompt_modified {
            tracing::debug!("[{}] System prompt rewritten", trace_id);
        }
        if outcome.tools_removed {
            tracing::debug!("[{}] Tool definitions stripped", trace_id);
        }

        let metadata = RequestMetadata {
            method: method.to_string(),
            path: path.to_string(),
            timestamp: Utc::now(),
            agent_id: outcome.agent_used.clone(),
            trace_id: trace_id.clone(),
        };
        let final_body = outcome.body.clone().unwrap_or(current);

        let accounts = self.strategy.select(&metadata).await;
        if accounts.is_empty() {
            tracing::info!("[{}] No accounts available, forwarding unauthenticated", trace_id);
            let started = Instant::now();
            // Per-attempt detail stays in the logs; the caller only ever
            // sees the terminal unavailability.
            return match self.adapter.forward(None, &metadata, final_body).await {
                Ok(response) => {
                    self.dispatch_usage(None, &metadata, &outcome, &response, started);
                    Ok(response)
                }
                Err(e) => {
                    tracing::warn!("[{}] Unauthenticated forward failed: {}", trace_id, e);
                    Err(ProxyError::ServiceUnavailable {
                        attempted: 0,
                        provider: self.adapter.provider_name().to_string(),
                    })
                }
            };
        }

        for (attempt, account) in accounts.iter().enumerate() {
            let started = Instant::now();
            match self
                .adapter
                .forward(Some(account), &metadata, final_body.clone())
                .await
            {
                Ok(response) => {
                    tracing::info!(
                        "[{}] Forwarded via {} (attempt {}/{})",
                        trace_id,
                        account.email,
                        attempt + 1,
                        accounts.len()
                    );
                    self.dispatch_usage(Some(account), &metadata, &outcome, &response, started);
                    return Ok(response);
                }
                Err(e) => {
                    tracing::warn!(
                        "[{}] Account {} attempt {}/{} failed: {}",
                        trace_id,
                        account.email,
                        attempt + 1,
                        accounts.len(),
                        e
                    );
                }
            }
        }

        Err(ProxyError::ServiceUnavailable {
            attempted: accounts.len(),
            provider: self.adapter.provider_name().to_string(),
        })
    }

    /// Fire-and-forget usage dispatch; the payload is owned by the
    /// channel from here on.
    fn dispatch_usage(
        &self,
        account: Option<&Account>,
        metadata: &RequestMetadata,
        outcome: &AgentOutcome,
        response: &ForwardedResponse,
        started: Instant,
    ) {
        let payload = UsagePayload {
            id: UsagePayload::new_id(),
            account_id: account.map(|a| a.id.clone()),
            email: account.map(|a| a.email.clone()),
            model: outcome
                .applied_model
                .clone()
                .or_else(|| outcome.original_model.clone()),
            agent_id: metadata.agent_id.clone(),
            usage: response.usage.unwrap_or_default(),
            latency_ms: started.elapsed().as_millis() as u64,
            timestamp: metadata.timestamp,
        };
        self.usage.dispatch(payload);
    }
}

/// Short random trace id for request-scoped log lines.
fn trace_id() -> String {
    rand::rng()
        .sample_iter(&rand::distr::Alphanumeric)
        .take(6)
        .map(char::from)
        .collect::<String>()
        .to_lowercase()
}
