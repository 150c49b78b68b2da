//! Account pool and selection strategy
//!
//! The orchestrator never picks account order itself; it consumes the
//! ordered list a `SelectionStrategy` returns. The shipped pool loads
//! credentialed accounts from a JSON directory and orders them by
//! subscription tier, rotating the starting point round-robin.

use async_trait::async_trait;
use dashmap::DashMap;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::proxy::orchestrator::RequestMetadata;

#[derive(Debug, Clone)]
pub struct Account {
    pub id: String,
    pub email: String,
    pub api_key: String,
    pub subscription_tier: Option<String>,
}

/// External account-selection strategy. Returns candidates in the order
/// they should be attempted; an empty list means "forward
/// unauthenticated".
#[async_trait]
pub trait SelectionStrategy: Send + Sync {
    async fn select(&self, metadata: &RequestMetadata) -> Vec<Account>;
}

#[derive(Debug, Deserialize)]
struct AccountFile {
    id: String,
    email: String,
    api_key: String,
    #[serde(default)]
    disabled: bool,
    #[serde(default)]
    proxy_disabled: bool,
    #[serde(default)]
    quota: Option<QuotaFile>,
}

#[derive(Debug, Deserialize)]
struct QuotaFile {
    #[serde(default)]
    subscription_tier: Option<String>,
}

pub struct AccountPool {
    accounts: DashMap<String, Account>,
    cursor: AtomicUsize,
    accounts_dir: PathBuf,
}

impl AccountPool {
    pub fn new(accounts_dir: PathBuf) -> Self {
        Self {
            accounts: DashMap::new(),
            cursor: AtomicUsize::new(0),
            accounts_dir,
        }
    }

    /// Load accounts from the directory, replacing the current pool.
    pub fn load_accounts(&self) -> anyhow::Result<usize> {
        if !self.accounts_dir.exists() {
            anyhow::bail!("Accounts directory not found: {:?}", self.accounts_dir);
        }

        self.accounts.clear();
        self.cursor.store(0, Ordering::SeqCst);

        let mut count = 0;
        for entry in std::fs::read_dir(&self.accounts_dir)? {
            let entry = entry?;
            let path = entry.path();
            if path.extension().and_then(|s| s.to_str()) != Some("json") {
                continue;
            }

            match Self::load_single_account(&path) {
                Ok(Some(account)) => {
                    self.accounts.insert(account.id.clone(), account);
                    count += 1;
                }
                Ok(None) => {}
                Err(e) => {
                    tracing::debug!("Failed to load account {:?}: {}", path, e);
                }
            }
        }

        Ok(count)
    }

    fn load_single_account(path: &Path) -> anyhow::Result<Option<Account>> {
        let content = std::fs::read_to_string(path)?;
        let file: AccountFile = serde_json::from_str(&content)?;

        if file.disabled || file.proxy_disabled {
            return Ok(None);
        }

        Ok(Some(Account {
            id: file.id,
            email: file.email,
            api_key: file.api_key,
            subscription_tier: file.quota.and_then(|q| q.subscription_tier),
        }))
    }

    pub fn len(&self) -> usize {
        self.accounts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.accounts.is_empty()
    }

    /// All accounts sorted by email, for listings.
    pub fn accounts(&self) -> Vec<Account> {
        let mut accounts: Vec<Account> =
            self.accounts.iter().map(|e| e.value().clone()).collect();
        accounts.sort_by(|a, b| a.email.cmp(&b.email));
        accounts
    }

    /// Tier-sorted snapshot, rotated so consecutive requests start from
    /// different accounts within a tier.
    fn ordered(&self) -> Vec<Account> {
        let mut snapshot: Vec<Account> =
            self.accounts.iter().map(|e| e.value().clone()).collect();
        let total = snapshot.len();
        if total == 0 {
            return snapshot;
        }

        snapshot.sort_by(|a, b| {
            tier_priority(&a.subscription_tier)
                .cmp(&tier_priority(&b.subscription_tier))
                .then_with(|| a.email.cmp(&b.email))
        });

        let start = self.cursor.fetch_add(1, Ordering::SeqCst) % total;
        snapshot.rotate_left(start);
        snapshot.sort_by_key(|a| tier_priority(&a.subscription_tier));
        snapshot
    }
}

fn tier_priority(tier: &Option<String>) -> u8 {
    match tier.as_deref() {
        Some("ULTRA") => 0,
        Some("PRO") => 1,
        Some("FREE") => 2,
        _ => 3,
    }
}

#[async_trait]
impl SelectionStrategy for AccountPool {
    async fn select(&self, _metadata: &RequestMetadata) -> Vec<Account> {
        self.ordered()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_account(dir: &Path, id: &str, tier: Option<&str>, disabled: bool) {
        let mut account = serde_json::json!({
            "id": id,
            "email": format!("{}@example.com", id),
            "api_key": format!("sk-{}", id),
            "disabled": disabled,
        });
        if let Some(tier) = tier {
            account["quota"] = serde_json::json!({"subscription_tier": tier});
        }
        std::fs::write(
            dir.join(format!("{}.json", id)),
            serde_json::to_string_pretty(&account).unwrap(),
        )
        .unwrap();
    }

    #[test]
    fn loads_accounts_and_skips_disabled() {
        let dir = tempfile::tempdir().unwrap();
        write_account(dir.path(), "a", Some("PRO"), false);
        write_account(dir.path(), "b", None, false);
        write_account(dir.path(), "c", Some("ULTRA"), true);
        std::fs::write(dir.path().join("notes.txt"), "ignored").unwrap();

        let pool = AccountPool::new(dir.path().to_path_buf());
        assert_eq!(pool.load_accounts().unwrap(), 2);
        assert_eq!(pool.len(), 2);
    }

    #[test]
    fn orders_by_tier_priority() {
        let dir = tempfile::tempdir().unwrap();
        write_account(dir.path(), "free", Some("FREE"), false);
        write_account(dir.path(), "ultra", Some("ULTRA"), false);
        write_account(dir.path(), "pro", Some("PRO"), false);

        let pool = AccountPool::new(dir.path().to_path_buf());
        pool.load_accounts().unwrap();

        let ordered = pool.ordered();
        let tiers: Vec<Option<String>> =
            ordered.iter().map(|a| a.subscription_tier.clone()).collect();
        assert_eq!(
            tiers,
            vec![
                Some("ULTRA".to_string()),
                Some("PRO".to_string()),
                Some("FREE".to_string())
            ]
        );
    }

    #[test]
    fn missing_directory_is_an_error() {
        let pool = AccountPool::new(PathBuf::from("/definitely/not/here"));
        assert!(pool.load_accounts().is_err());
    }

    #[test]
    fn malformed_account_file_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        write_account(dir.path(), "good", None, false);
        std::fs::write(dir.path().join("bad.json"), "{broken").unwrap();

        let pool = AccountPool::new(dir.path().to_path_buf());
        assert_eq!(pool.load_accounts().unwrap(), 1);
    }
}
