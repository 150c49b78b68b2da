//! Agent directory - registered workspaces and the agents they define

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, RwLock};

use crate::error::ProxyError;

/// Relative location of agent definition files inside a workspace.
pub const AGENTS_SUBDIR: &str = ".claude/agents";

/// A registered agent. Immutable once registered; looked up, never
/// mutated, by the interceptors.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Agent {
    pub id: String,
    pub name: String,
    /// Stored prompt fragment used to recognize requests issued by this
    /// agent (substring match against the combined system text).
    pub system_prompt: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
}

/// Optional per-account model override for an agent.
#[derive(Debug, Clone, PartialEq)]
pub struct ModelPreference {
    pub model: String,
}

/// External agent directory consumed by the agent interceptor.
pub trait AgentDirectory: Send + Sync {
    /// Agents in a stable iteration order; first signature match wins.
    fn list_agents(&self) -> Vec<Agent>;

    /// Register a filesystem workspace as an agent source. Repeat
    /// registrations of the same root are cheap no-ops.
    fn register_workspace(&self, root: &Path) -> Result<(), ProxyError>;

    /// Explicit model override for an agent, beating its own default.
    fn model_preference(&self, agent_id: &str) -> Option<ModelPreference>;
}

/// Directory backed by `<workspace>/.claude/agents/*.md` definition files.
///
/// Agent files carry an optional YAML-ish frontmatter (`name:`, `model:`)
/// between `---` fences; the body text is the agent's signature prompt.
/// The agent id is the file stem.
pub struct WorkspaceDirectory {
    roots: Mutex<Vec<PathBuf>>,
    agents: RwLock<Vec<Agent>>,
    preferences: DashMap<String, String>,
}

impl WorkspaceDirectory {
    pub fn new() -> Self {
        Self {
            roots: Mutex::new(Vec::new()),
            agents: RwLock::new(Vec::new()),
            preferences: DashMap::new(),
        }
    }

    pub fn set_model_preference(&self, agent_id: &str, model: &str) {
        self.preferences
            .insert(agent_id.to_string(), model.to_string());
    }

    pub fn workspace_count(&self) -> usize {
        self.roots.lock().expect("directory mutex poisoned").len()
    }

    fn scan_workspace(root: &Path) -> Vec<Agent> {
        let agents_dir = root.join(AGENTS_SUBDIR);
        let entries = match std::fs::read_dir(&agents_dir) {
            Ok(entries) => entries,
            Err(e) => {
                tracing::debug!("No agents directory at {:?}: {}", agents_dir, e);
                return Vec::new();
            }
        };

        let mut paths: Vec<PathBuf> = entries
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| p.extension().and_then(|s| s.to_str()) == Some("md"))
            .collect();
        paths.sort();

        let mut agents = Vec::new();
        for path in paths {
            let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            match std::fs::read_to_string(&path) {
                Ok(content) => {
                    if let Some(agent) = parse_agent_file(stem, &content) {
                        agents.push(agent);
                    }
                }
                Err(e) => {
                    tracing::debug!("Failed to read agent file {:?}: {}", path, e);
                }
            }
        }
        agents
    }
}

impl Default for WorkspaceDirectory {
    fn default() -> Self {
        Self::new()
    }
}

impl AgentDirectory for WorkspaceDirectory {
    fn list_agents(&self) -> Vec<Agent> {
        self.agents
            .read()
            .expect("directory lock poisoned")
            .clone()
    }

    fn register_workspace(&self, root: &Path) -> Result<(), ProxyError> {
        {
            let mut roots = self.roots.lock().expect("directory mutex poisoned");
            if roots.iter().any(|r| r == root) {
                return Ok(());
            }
            roots.push(root.to_path_buf());
        }

        let discovered = Self::scan_workspace(root);
        let mut agents = self.agents.write().expect("directory lock poisoned");
        let mut added = 0usize;
        for agent in discovered {
            if agents.iter().any(|a| a.id == agent.id) {
                continue;
            }
            agents.push(agent);
            added += 1;
        }
        tracing::info!("Registered workspace {:?} ({} agent(s))", root, added);
        Ok(())
    }

    fn model_preference(&self, agent_id: &str) -> Option<ModelPreference> {
        self.preferences.get(agent_id).map(|e| ModelPreference {
            model: e.value().clone(),
        })
    }
}

/// Parse a single agent definition file. Returns None when the body
/// is empty (an agent without a signature can never match).
fn parse_agent_file(id: &str, content: &str) -> Option<Agent> {
    let mut name = id.to_string();
    let mut model = None;
    let mut body = content;

    if let Some(rest) = content.strip_prefix("---") {
        if let Some(end) = rest.find("\n---") {
            let frontmatter = &rest[..end];
            body = rest[end + 4..].trim_start_matches('\n');
            for line in frontmatter.lines() {
                let Some((key, value)) = line.split_once(':') else {
                    continue;
                };
                let value = value.trim().trim_matches('"');
                match key.trim() {
                    "name" => name = value.to_string(),
                    "model" => {
                        if !value.is_empty() {
                            model = Some(value.to_string());
                        }
                    }
                    _ => {}
                }
            }
        }
    }

    let system_prompt = body.trim().to_string();
    if system_prompt.is_empty() {
        tracing::debug!("Agent file {} has no signature body, skipping", id);
        return None;
    }

    Some(Agent {
        id: id.to_string(),
        name,
        system_prompt,
        model,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const AGENT_FILE: &str = "---\nname: Reviewer\nmodel: fast-v2\n---\nYou are a meticulous code reviewer.\n";

    #[test]
    fn parses_frontmatter_and_body() {
        let agent = parse_agent_file("reviewer", AGENT_FILE).unwrap();
        assert_eq!(agent.id, "reviewer");
        assert_eq!(agent.name, "Reviewer");
        assert_eq!(agent.model.as_deref(), Some("fast-v2"));
        assert_eq!(agent.system_prompt, "You are a meticulous code reviewer.");
    }

    #[test]
    fn plain_file_without_frontmatter() {
        let agent = parse_agent_file("helper", "Just a signature.").unwrap();
        assert_eq!(agent.name, "helper");
        assert!(agent.model.is_none());
        assert_eq!(agent.system_prompt, "Just a signature.");
    }

    #[test]
    fn empty_body_is_skipped() {
        assert!(parse_agent_file("empty", "---\nname: x\n---\n\n").is_none());
        assert!(parse_agent_file("blank", "").is_none());
    }

    #[test]
    fn registers_workspace_and_lists_agents() {
        let dir = tempfile::tempdir().unwrap();
        let agents_dir = dir.path().join(AGENTS_SUBDIR);
        std::fs::create_dir_all(&agents_dir).unwrap();
        std::fs::write(agents_dir.join("reviewer.md"), AGENT_FILE).unwrap();
        std::fs::write(agents_dir.join("scribe.md"), "Writes docs.").unwrap();

        let directory = WorkspaceDirectory::new();
        directory.register_workspace(dir.path()).unwrap();

        let agents = directory.list_agents();
        assert_eq!(agents.len(), 2);
        // Filename order within one workspace.
        assert_eq!(agents[0].id, "reviewer");
        assert_eq!(agents[1].id, "scribe");

        // Re-registering is a no-op.
        directory.register_workspace(dir.path()).unwrap();
        assert_eq!(directory.list_agents().len(), 2);
        assert_eq!(directory.workspace_count(), 1);
    }

    #[test]
    fn model_preference_lookup() {
        let directory = WorkspaceDirectory::new();
        assert!(directory.model_preference("reviewer").is_none());
        directory.set_model_preference("reviewer", "fast-v2");
        assert_eq!(
            directory.model_preference("reviewer").unwrap().model,
            "fast-v2"
        );
    }
}
