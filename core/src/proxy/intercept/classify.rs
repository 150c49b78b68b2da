//! Text-pattern session classification and agent matching
//!
//! The heuristics here are stringly-typed by nature; they are kept as
//! small pure functions so the matching rules can be tested and swapped
//! independently of the pipeline plumbing.

use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::BTreeSet;

use crate::directory::Agent;

/// First system block of a main session opens with this persona line.
pub const MAIN_SESSION_MARKER: &str = "You are Claude Code, Anthropic's official CLI for Claude.";

/// Delegated sub-agent sessions carry this signature instead.
pub const SUB_AGENT_MARKER: &str = "You are an agent for Claude Code";

/// Marker introducing the git status tail of the original prompt.
pub const GIT_STATUS_MARKER: &str = "gitStatus:";

static ENV_BLOCK_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)<env>.*?</env>").expect("env block regex"));

static AGENTS_DIR_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"/[^\s"'`\[\]{}()<>]*/\.claude/agents"#).expect("agents dir regex")
});

static CLAUDE_MD_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"Contents of ([^\n]+?)/CLAUDE\.md").expect("claude md regex"));

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionKind {
    pub is_main: bool,
    pub is_sub: bool,
}

impl SessionKind {
    /// Only plain main-agent sessions are eligible for prompt rewriting.
    pub fn eligible(&self) -> bool {
        self.is_main && !self.is_sub
    }
}

/// Classify a session from the text of its first system block.
pub fn classify_session(text: &str) -> SessionKind {
    SessionKind {
        is_main: text.contains(MAIN_SESSION_MARKER),
        is_sub: text.contains(SUB_AGENT_MARKER),
    }
}

/// Extract every `<env>...</env>` sub-block, newline-joined.
/// Empty when no block is present.
pub fn extract_env_blocks(text: &str) -> String {
    ENV_BLOCK_RE
        .find_iter(text)
        .map(|m| m.as_str())
        .collect::<Vec<_>>()
        .join("\n")
}

/// Extract the git status tail: everything from the first `gitStatus:`
/// marker to the end of the prompt. Empty when the marker is absent.
pub fn extract_git_status(text: &str) -> String {
    match text.find(GIT_STATUS_MARKER) {
        Some(idx) => text[idx..].to_string(),
        None => String::new(),
    }
}

/// First agent whose stored signature text (trimmed) is contained in the
/// combined system text. Directory iteration order decides overlaps.
pub fn find_matching_agent<'a>(text: &str, agents: &'a [Agent]) -> Option<&'a Agent> {
    agents.iter().find(|agent| {
        let signature = agent.system_prompt.trim();
        !signature.is_empty() && text.contains(signature)
    })
}

/// Scan prompt text for agent-directory hints.
///
/// Two patterns: absolute paths ending in `/.claude/agents`, and
/// `Contents of <path>/CLAUDE.md` lines (escaped slashes normalized),
/// from which the agents directory is derived. Deduplicated, in sorted
/// order.
pub fn scan_agent_directories(text: &str) -> Vec<String> {
    let mut dirs = BTreeSet::new();

    for m in AGENTS_DIR_RE.find_iter(text) {
        dirs.insert(m.as_str().replace("\\/", "/"));
    }

    for cap in CLAUDE_MD_RE.captures_iter(text) {
        let workspace = cap[1].replace("\\/", "/");
        dirs.insert(format!("{}/.claude/agents", workspace));
    }

    dirs.into_iter().collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn agent(id: &str, signature: &str) -> Agent {
        Agent {
            id: id.to_string(),
            name: id.to_string(),
            system_prompt: signature.to_string(),
            model: None,
        }
    }

    #[test]
    fn main_session_is_eligible() {
        let kind = classify_session(MAIN_SESSION_MARKER);
        assert!(kind.is_main);
        assert!(!kind.is_sub);
        assert!(kind.eligible());
    }

    #[test]
    fn sub_agent_session_is_not_eligible() {
        let text = format!("{} {}", MAIN_SESSION_MARKER, SUB_AGENT_MARKER);
        assert!(!classify_session(&text).eligible());
        assert!(!classify_session("Unrelated persona text").eligible());
    }

    #[test]
    fn env_blocks_are_joined_with_newlines() {
        let text = "before <env>A</env> mid <env>B\nmulti</env> after";
        assert_eq!(extract_env_blocks(text), "<env>A</env>\n<env>B\nmulti</env>");
        assert_eq!(extract_env_blocks("no blocks here"), "");
    }

    #[test]
    fn git_status_runs_to_end_of_string() {
        let text = "prelude\ngitStatus: clean\nmore lines";
        assert_eq!(extract_git_status(text), "gitStatus: clean\nmore lines");
        assert_eq!(extract_git_status("no marker"), "");
    }

    #[test]
    fn first_directory_match_wins() {
        let agents = vec![agent("a", "shared prefix"), agent("b", "shared")];
        let found = find_matching_agent("text with shared prefix inside", &agents);
        assert_eq!(found.map(|a| a.id.as_str()), Some("a"));
    }

    #[test]
    fn empty_signatures_never_match() {
        let agents = vec![agent("empty", "  "), agent("real", "needle")];
        let found = find_matching_agent("haystack with needle", &agents);
        assert_eq!(found.map(|a| a.id.as_str()), Some("real"));
        assert!(find_matching_agent("nothing relevant", &agents).is_none());
    }

    #[test]
    fn scans_agents_dir_paths() {
        let text = r#"See "/home/dev/project/.claude/agents" and [/srv/other/.claude/agents]"#;
        assert_eq!(
            scan_agent_directories(text),
            vec![
                "/home/dev/project/.claude/agents".to_string(),
                "/srv/other/.claude/agents".to_string(),
            ]
        );
    }

    #[test]
    fn derives_agents_dir_from_claude_md_lines() {
        let text = "Contents of /home/dev/project/CLAUDE.md (project instructions)\n";
        assert_eq!(
            scan_agent_directories(text),
            vec!["/home/dev/project/.claude/agents".to_string()]
        );
    }

    #[test]
    fn normalizes_escaped_slashes_and_dedupes() {
        let text = "Contents of \\/home\\/dev\\/p/CLAUDE.md\nsee /home/dev/p/.claude/agents too";
        assert_eq!(
            scan_agent_directories(text),
            vec!["/home/dev/p/.claude/agents".to_string()]
        );
    }
}
