//! Proxy module - interception pipeline, failover orchestrator, usage channel

pub mod body;
pub mod deferred;
pub mod intercept;
pub mod orchestrator;
pub mod pool;
pub mod server;
pub mod upstream;
pub mod usage;

pub use orchestrator::{Orchestrator, RequestMetadata};
pub use pool::{Account, AccountPool, SelectionStrategy};
pub use server::ProxyServer;
pub use upstream::{AnthropicUpstream, ForwardedResponse, ProviderAdapter};
pub use usage::{UsageChannel, UsageEvent, UsagePayload};
