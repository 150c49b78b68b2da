use std::path::PathBuf;
use std::sync::Arc;

use switchboard_core::config::{expand_path, load_config};
use switchboard_core::directory::{AgentDirectory, WorkspaceDirectory};
use switchboard_core::proxy::{
    AccountPool, AnthropicUpstream, Orchestrator, ProxyServer, UsageChannel,
};
use switchboard_core::store::JsonFileStore;

pub async fn run(config_path: Option<PathBuf>, port_override: Option<u16>) -> anyhow::Result<()> {
    // Load configuration
    let mut config = load_config(config_path)?;

    // Apply port override if provided
    if let Some(port) = port_override {
        config.server.port = port;
    }

    let data_dir = expand_path(&config.data.directory);
    let accounts_dir = expand_path(&config.accounts.directory);

    tracing::info!("Starting Switchboard...");
    tracing::info!("  Port: {}", config.server.port);
    tracing::info!("  Host: {}", config.server.host);
    tracing::info!("  Data directory: {:?}", data_dir);
    tracing::info!("  Accounts directory: {:?}", accounts_dir);

    let store = Arc::new(JsonFileStore::open(data_dir.join("store.json"))?);

    // Register configured workspaces; more are discovered at runtime
    // from request prompt text.
    let directory = Arc::new(WorkspaceDirectory::new());
    for workspace in &config.agents.workspaces {
        let workspace = expand_path(workspace);
        if let Err(e) = directory.register_workspace(&workspace) {
            tracing::warn!("Could not register workspace {:?}: {}", workspace, e);
        }
    }
    let agent_count = directory.list_agents().len();
    if agent_count > 0 {
        tracing::info!("Loaded {} agent(s)", agent_count);
    }

    // Load accounts
    let pool = Arc::new(AccountPool::new(accounts_dir));
    match pool.load_accounts() {
        Ok(0) | Err(_) => {
            tracing::warn!("No accounts found. Requests will be forwarded unauthenticated.");
        }
        Ok(count) => {
            tracing::info!("Loaded {} account(s)", count);
        }
    }

    let upstream = Arc::new(AnthropicUpstream::new(
        Some(config.upstream.base_url.clone()),
        config.upstream.proxy_url.clone(),
        config.upstream.request_timeout,
    ));

    let usage = Arc::new(UsageChannel::new(store.clone()));
    let orchestrator = Arc::new(Orchestrator::new(
        store,
        directory,
        upstream,
        pool,
        usage.clone(),
    ));

    let server = ProxyServer::new(
        config.server.bind_address().to_string(),
        config.server.port,
        orchestrator,
        usage,
    );

    tracing::info!(
        "Proxy server starting on http://{}:{}",
        config.server.host,
        config.server.port
    );
    tracing::info!("Press Ctrl+C to stop");

    // Run server (blocks until shutdown)
    server.run().await?;

    Ok(())
}
