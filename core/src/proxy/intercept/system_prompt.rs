//! System-prompt interceptor
//!
//! Rewrites the instructional block of a main-session system prompt per
//! the stored template, preserving the dynamic `<env>` and git-status
//! sub-blocks via placeholder substitution, and optionally strips or
//! adjusts tool definitions. Any failure degrades to "unchanged" - this
//! stage never aborts a request.

use bytes::Bytes;

use crate::error::ProxyError;
use crate::proxy::body::{RequestBody, SystemField};
use crate::proxy::deferred::BackgroundWriter;
use crate::proxy::intercept::classify;
use crate::store::{
    InterceptorConfig, LAST_SEEN_SYSTEM_PROMPT_KEY, LAST_SEEN_TOOLS_KEY,
};

/// Placeholder replaced with the extracted `<env>` blocks.
pub const ENV_BLOCK_PLACEHOLDER: &str = "{{env_block}}";

/// Placeholder replaced with the extracted git status tail.
pub const GIT_STATUS_PLACEHOLDER: &str = "{{git_status_block}}";

/// What a prompt pass did to the in-memory body.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PromptOutcome {
    pub prompt_modified: bool,
    pub tools_removed: bool,
    /// Individual tool definitions were disabled or re-described via
    /// overrides (body changed without full removal).
    pub tools_adjusted: bool,
}

impl PromptOutcome {
    pub fn changed(&self) -> bool {
        self.prompt_modified || self.tools_removed || self.tools_adjusted
    }
}

pub struct SystemPromptInterceptor {
    writer: Option<BackgroundWriter>,
}

impl SystemPromptInterceptor {
    pub fn new(writer: BackgroundWriter) -> Self {
        Self {
            writer: Some(writer),
        }
    }

    /// Interceptor without the last-seen recording side channel.
    pub fn without_recorder() -> Self {
        Self { writer: None }
    }

    /// Byte-level stage contract: `Some(bytes)` when the body was
    /// rewritten, `None` to signal "unchanged". Never fails.
    pub fn intercept(
        &self,
        body: Option<&Bytes>,
        config: Option<&InterceptorConfig>,
    ) -> Option<Bytes> {
        let bytes = body?;
        if !config.map(|c| c.is_enabled).unwrap_or(false) {
            return None;
        }

        let mut decoded = match RequestBody::decode(bytes) {
            Ok(decoded) => decoded,
            Err(e) => {
                tracing::warn!("System prompt stage could not parse body, passing through: {}", e);
                return None;
            }
        };

        match self.apply(&mut decoded, config) {
            Ok(outcome) if outcome.changed() => match decoded.encode() {
                Ok(encoded) => Some(encoded),
                Err(e) => {
                    tracing::warn!("Failed to re-encode rewritten body, passing through: {}", e);
                    None
                }
            },
            Ok(_) => None,
            Err(e) => {
                tracing::warn!("System prompt stage skipped: {}", e);
                None
            }
        }
    }

    /// Run the rewrite against an already-decoded body, so the agent
    /// stage can thread the same in-memory object through.
    pub fn apply(
        &self,
        body: &mut RequestBody,
        config: Option<&InterceptorConfig>,
    ) -> Result<PromptOutcome, ProxyError> {
        let config = match config {
            Some(c) if c.is_enabled => c,
            _ => return Ok(PromptOutcome::default()),
        };

        // Only multi-block "main agent" sessions are eligible.
        let Some(SystemField::Blocks(blocks)) = &body.system else {
            return Ok(PromptOutcome::default());
        };
        let Some(first) = blocks.first() else {
            return Ok(PromptOutcome::default());
        };
        if !classify::classify_session(&first.text).eligible() {
            return Ok(PromptOutcome::default());
        }
        let Some(original_prompt) = blocks.get(1).map(|b| b.text.clone()) else {
            tracing::debug!("Main session without an instruction block, skipping rewrite");
            return Ok(PromptOutcome::default());
        };

        let template = config.config.replacement_prompt.as_str();
        if template.trim().is_empty() {
            return Err(ProxyError::Configuration(
                "replacement prompt is empty".to_string(),
            ));
        }

        // Re-extracting from an already-rewritten prompt would feed the
        // template its own output, so a recognized render is left alone.
        if is_rendered_template(template, &original_prompt) {
            tracing::debug!("Instruction block already carries the rendered template");
            let mut outcome = PromptOutcome::default();
            self.apply_tool_config(body, config, &mut outcome);
            return Ok(outcome);
        }

        self.record_last_seen(&original_prompt, body);

        let env_block = classify::extract_env_blocks(&original_prompt);
        if env_block.is_empty() {
            tracing::debug!("No <env> block found in original prompt");
        }
        let git_status = classify::extract_git_status(&original_prompt);

        if !template.contains(ENV_BLOCK_PLACEHOLDER) && !template.contains(GIT_STATUS_PLACEHOLDER) {
            tracing::warn!("Replacement template carries no placeholders, dynamic context is dropped");
        }

        let rewritten = template
            .replace(ENV_BLOCK_PLACEHOLDER, &env_block)
            .replace(GIT_STATUS_PLACEHOLDER, &git_status);

        let mut outcome = PromptOutcome::default();
        if let Some(SystemField::Blocks(blocks)) = &mut body.system {
            if blocks[1].text != rewritten {
                blocks[1].text = rewritten;
                outcome.prompt_modified = true;
            }
        }

        self.apply_tool_config(body, config, &mut outcome);
        Ok(outcome)
    }

    /// Strip the tools array entirely, or apply per-tool overrides.
    fn apply_tool_config(
        &self,
        body: &mut RequestBody,
        config: &InterceptorConfig,
        outcome: &mut PromptOutcome,
    ) {
        if !config.config.tools_enabled {
            if body.tools.take().is_some() {
                outcome.tools_removed = true;
            }
            return;
        }

        let overrides = &config.config.tool_overrides;
        if overrides.is_empty() {
            return;
        }
        let Some(tools) = &mut body.tools else {
            return;
        };

        let before = tools.len();
        tools.retain(|tool| {
            overrides
                .get(&tool.name)
                .map(|o| o.is_enabled)
                .unwrap_or(true)
        });
        if tools.len() != before {
            outcome.tools_adjusted = true;
        }

        for tool in tools.iter_mut() {
            if let Some(description) = overrides
                .get(&tool.name)
                .and_then(|o| o.description.as_ref())
            {
                if tool.description.as_ref() != Some(description) {
                    tool.description = Some(description.clone());
                    outcome.tools_adjusted = true;
                }
            }
        }
    }

    /// Schedule last-seen recordings through the background writer.
    /// Never touches the store on the request path.
    fn record_last_seen(&self, original_prompt: &str, body: &RequestBody) {
        let Some(writer) = &self.writer else {
            return;
        };
        writer.record(LAST_SEEN_SYSTEM_PROMPT_KEY, original_prompt.to_string());
        if let Some(tools) = &body.tools {
            match serde_json::to_string(tools) {
                Ok(serialized) => writer.record(LAST_SEEN_TOOLS_KEY, serialized),
                Err(e) => tracing::debug!("Could not serialize tools for recording: {}", e),
            }
        }
    }
}

/// Whether `text` is a substitution product of `template`: the
/// template's literal segments appear in order, with arbitrary spans
/// where the placeholders sit. A false negative only costs a redundant
/// rewrite; a match means the prompt already went through this template.
fn is_rendered_template(template: &str, text: &str) -> bool {
    let mut segments: Vec<&str> = Vec::new();
    let mut rest = template;
    loop {
        let env = rest.find(ENV_BLOCK_PLACEHOLDER);
        let git = rest.find(GIT_STATUS_PLACEHOLDER);
        let (idx, len) = match (env, git) {
            (Some(e), Some(g)) if e < g => (e, ENV_BLOCK_PLACEHOLDER.len()),
            (Some(e), None) => (e, ENV_BLOCK_PLACEHOLDER.len()),
            (_, Some(g)) => (g, GIT_STATUS_PLACEHOLDER.len()),
            (None, None) => break,
        };
        segments.push(&rest[..idx]);
        rest = &rest[idx + len..];
    }
    if segments.is_empty() {
        return text == template;
    }
    segments.push(rest);

    let Some(mut remaining) = text.strip_prefix(segments[0]) else {
        return false;
    };
    for segment in &segments[1..segments.len() - 1] {
        if segment.is_empty() {
            continue;
        }
        match remaining.find(segment) {
            Some(i) => remaining = &remaining[i + segment.len()..],
            None => return false,
        }
    }
    remaining.ends_with(segments[segments.len() - 1])
}
