//! Agent interceptor
//!
//! Detects which registered agent authored a request by matching the
//! combined system text against stored signatures, applies that agent's
//! preferred model, and registers newly discovered agent workspaces
//! referenced in the prompt. Failures degrade to "proxy unchanged".

use bytes::Bytes;
use std::path::Path;
use std::sync::Arc;

use crate::directory::{Agent, AgentDirectory, AGENTS_SUBDIR};
use crate::error::ProxyError;
use crate::proxy::body::{RequestBody, SystemField};
use crate::proxy::intercept::classify;
use crate::proxy::intercept::system_prompt::SystemPromptInterceptor;
use crate::store::InterceptorConfig;

/// Markers identifying injected repository-context user messages that may
/// carry agent-directory hints.
const REPO_CONTEXT_MARKERS: (&str, &str) = ("Contents of", "CLAUDE.md");

/// Result of the agent stage.
#[derive(Debug, Default)]
pub struct AgentOutcome {
    /// Re-encoded body when either stage changed it, `None` for unchanged.
    pub body: Option<Bytes>,
    pub agent_used: Option<String>,
    pub original_model: Option<String>,
    pub applied_model: Option<String>,
    pub prompt_modified: bool,
    pub tools_removed: bool,
}

pub struct AgentInterceptor {
    directory: Arc<dyn AgentDirectory>,
    system_prompt: SystemPromptInterceptor,
}

impl AgentInterceptor {
    pub fn new(directory: Arc<dyn AgentDirectory>, system_prompt: SystemPromptInterceptor) -> Self {
        Self {
            directory,
            system_prompt,
        }
    }

    /// Stage contract: never fails. On any internal error the original
    /// buffer passes through with null metadata.
    pub fn intercept(
        &self,
        body: Option<&Bytes>,
        config: Option<&InterceptorConfig>,
    ) -> AgentOutcome {
        let Some(bytes) = body else {
            return AgentOutcome::default();
        };
        match self.try_intercept(bytes, config) {
            Ok(outcome) => outcome,
            Err(e) => {
                tracing::warn!("Agent stage failed, passing body through unchanged: {}", e);
                AgentOutcome::default()
            }
        }
    }

    fn try_intercept(
        &self,
        bytes: &Bytes,
        config: Option<&InterceptorConfig>,
    ) -> Result<AgentOutcome, ProxyError> {
        let mut decoded = RequestBody::decode(bytes)?;
        let original_model = decoded.model.clone();

        let combined = combined_system_text(&decoded);

        let matched: Option<Agent> = match &combined {
            Some(text) => {
                self.discover_workspaces(text);
                let agents = self.directory.list_agents();
                classify::find_matching_agent(text, &agents).cloned()
            }
            None => None,
        };

        // The prompt pass always runs on the same in-memory object, so
        // the model-rewrite decision below sees its edits applied.
        let prompt = match self.system_prompt.apply(&mut decoded, config) {
            Ok(outcome) => outcome,
            Err(e) => {
                tracing::warn!("Prompt pass inside agent stage skipped: {}", e);
                Default::default()
            }
        };
        let mut changed = prompt.changed();

        let (agent_used, applied_model) = match matched {
            None => (None, original_model.clone()),
            Some(agent) => {
                let preferred = self
                    .directory
                    .model_preference(&agent.id)
                    .map(|p| p.model)
                    .or_else(|| agent.model.clone());
                match preferred {
                    Some(model) if original_model.as_deref() != Some(model.as_str()) => {
                        tracing::info!(
                            "Agent {} detected, model {} -> {}",
                            agent.id,
                            original_model.as_deref().unwrap_or("(none)"),
                            model
                        );
                        decoded.model = Some(model.clone());
                        changed = true;
                        (Some(agent.id), Some(model))
                    }
                    Some(model) => (Some(agent.id), Some(model)),
                    None => (Some(agent.id), original_model.clone()),
                }
            }
        };

        let body = if changed { Some(decoded.encode()?) } else { None };
        Ok(AgentOutcome {
            body,
            agent_used,
            original_model,
            applied_model,
            prompt_modified: prompt.prompt_modified,
            tools_removed: prompt.tools_removed,
        })
    }

    /// Best-effort workspace auto-registration. Non-existent paths are
    /// skipped silently; the main result never depends on this.
    fn discover_workspaces(&self, text: &str) {
        for agents_dir in classify::scan_agent_directories(text) {
            let suffix = format!("/{}", AGENTS_SUBDIR);
            let Some(root) = agents_dir.strip_suffix(&suffix) else {
                continue;
            };
            if root.is_empty() {
                continue;
            }
            let root = match std::fs::canonicalize(Path::new(root)) {
                Ok(root) => root,
                Err(e) => {
                    tracing::debug!("Skipping absent workspace {}: {}", root, e);
                    continue;
                }
            };
            if let Err(e) = self.directory.register_workspace(&root) {
                tracing::debug!("Workspace registration failed for {:?}: {}", root, e);
            }
        }
    }
}

/// Concatenate the texts an agent signature could live in: the root
/// `system` field, `system`-role messages, and `user`-role messages
/// carrying injected repository context.
fn combined_system_text(body: &RequestBody) -> Option<String> {
    let mut parts: Vec<String> = Vec::new();

    if let Some(system) = &body.system {
        let text = match system {
            SystemField::Text(text) => text.clone(),
            SystemField::Blocks(_) => system.joined_text(),
        };
        if !text.is_empty() {
            parts.push(text);
        }
    }

    if let Some(messages) = &body.messages {
        for message in messages {
            match message.role.as_str() {
                "system" => {
                    let text = message.content.joined_text();
                    if !text.is_empty() {
                        parts.push(text);
                    }
                }
                "user" => {
                    let text = message.content.joined_text();
                    if text.contains(REPO_CONTEXT_MARKERS.0) && text.contains(REPO_CONTEXT_MARKERS.1)
                    {
                        parts.push(text);
                    }
                }
                _ => {}
            }
        }
    }

    if parts.is_empty() {
        None
    } else {
        Some(parts.join("\n\n"))
    }
}
