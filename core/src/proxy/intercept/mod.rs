//! Request interception pipeline
//! Stages run strictly system-prompt first, then agent detection.

pub mod agent;
pub mod classify;
pub mod system_prompt;

pub use agent::{AgentInterceptor, AgentOutcome};
pub use system_prompt::{PromptOutcome, SystemPromptInterceptor};
