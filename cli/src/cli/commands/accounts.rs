use std::path::PathBuf;

use switchboard_core::config::{expand_path, load_config};
use switchboard_core::proxy::AccountPool;

use crate::cli::AccountCommands;

pub async fn run(config_path: Option<PathBuf>, command: AccountCommands) -> anyhow::Result<()> {
    match command {
        AccountCommands::List => {
            list(config_path)?;
        }
    }
    Ok(())
}

fn list(config_path: Option<PathBuf>) -> anyhow::Result<()> {
    let config = load_config(config_path)?;
    let accounts_dir = expand_path(&config.accounts.directory);

    let pool = AccountPool::new(accounts_dir.clone());
    let count = match pool.load_accounts() {
        Ok(count) => count,
        Err(_) => 0,
    };

    if count == 0 {
        println!("No accounts found.");
        println!("Accounts directory: {:?}", accounts_dir);
        return Ok(());
    }

    println!("{:<38} {:<40} {:<10}", "ID", "EMAIL", "TIER");
    println!("{}", "-".repeat(88));

    for account in pool.accounts() {
        let tier = account.subscription_tier.as_deref().unwrap_or("-");
        println!("{:<38} {:<40} {:<10}", account.id, account.email, tier);
    }

    Ok(())
}
