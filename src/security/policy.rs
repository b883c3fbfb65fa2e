//! Regex-based permission decisions over canonical action strings.
//!
//! Every tool invocation is reduced to an action string of the form
//! `tool:<tool>:<detail>` and matched against an ordered profile:
//! first matching `allow` pattern wins, then first matching `ask` pattern,
//! and anything unmatched is denied.  Matching is always full-string —
//! a pattern `tool:view:.*` cannot accidentally match a longer action by
//! substring.

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::ErrorKind;

// ─── Public types ──────────────────────────────────────────────────────────

/// Outcome of a permission check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    /// The action may proceed immediately.
    Allow,
    /// The action requires explicit user approval before proceeding.
    Ask,
    /// The action is prohibited.
    Deny,
}

impl Decision {
    /// Lowercase name used in audit rows.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Allow => "allow",
            Self::Ask => "ask",
            Self::Deny => "deny",
        }
    }
}

/// Error constructing a profile.
#[derive(Debug, thiserror::Error)]
pub enum PolicyError {
    #[error("invalid permission pattern '{pattern}': {source}")]
    InvalidPattern {
        pattern: String,
        source: regex::Error,
    },

    #[error("unknown permission preset '{0}'")]
    UnknownPreset(String),
}

impl PolicyError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidPattern { .. } => ErrorKind::InvalidPermissionPattern,
            Self::UnknownPreset(_) => ErrorKind::UnknownPreset,
        }
    }
}

// ─── Wire form ─────────────────────────────────────────────────────────────

/// A profile as it appears in configuration and the store: either a preset
/// name or an inline pattern set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ProfileSpec {
    /// One of `"open"`, `"standard"`, `"locked"`.
    Preset(String),
    /// Explicit pattern lists.  Patterns are anchored at compile time.
    Inline {
        #[serde(default)]
        allow: Vec<String>,
        #[serde(default)]
        ask: Vec<String>,
    },
}

impl Default for ProfileSpec {
    fn default() -> Self {
        Self::Preset("standard".to_owned())
    }
}

impl ProfileSpec {
    /// Compile into a matchable [`PermissionProfile`].
    pub fn compile(&self) -> Result<PermissionProfile, PolicyError> {
        match self {
            Self::Preset(name) => PermissionProfile::preset(name),
            Self::Inline { allow, ask } => PermissionProfile::new(allow, ask),
        }
    }

    /// Short human-readable label for status and audit output.
    pub fn label(&self) -> String {
        match self {
            Self::Preset(name) => name.clone(),
            Self::Inline { allow, ask } => {
                format!("inline({} allow, {} ask)", allow.len(), ask.len())
            }
        }
    }
}

// ─── PermissionProfile ─────────────────────────────────────────────────────

/// One compiled pattern with its source text retained for diagnostics and
/// the projection probe.
#[derive(Debug, Clone)]
struct Pattern {
    raw: String,
    regex: Regex,
}

/// Compiled permission profile.  Pure and stateless: `decide` performs no
/// I/O and has no side effects; audit logging is the caller's concern.
#[derive(Debug, Clone)]
pub struct PermissionProfile {
    allow: Vec<Pattern>,
    ask: Vec<Pattern>,
}

impl PermissionProfile {
    /// Compile a profile from raw pattern lists.  Every pattern is wrapped in
    /// `^(?:…)$` so matching is full-string.  The first invalid pattern fails
    /// the whole construction.
    pub fn new<S: AsRef<str>>(allow: &[S], ask: &[S]) -> Result<Self, PolicyError> {
        Ok(Self {
            allow: compile_all(allow)?,
            ask: compile_all(ask)?,
        })
    }

    /// Look up a built-in preset by name.
    pub fn preset(name: &str) -> Result<Self, PolicyError> {
        match name {
            "open" => Self::new(&["tool:.*"], &[]),
            "standard" => {
                // Plain git operations are fine; publishing ones prompt.
                let git_allow = format!("tool:git:{}", not_prefixed_by(&["push", "merge_request"]));
                Self::new(
                    &[
                        "tool:(create_file|str_replace|view):.*".to_owned(),
                        git_allow,
                        "tool:agent_comm:.*".to_owned(),
                    ],
                    &[
                        "tool:bash:.*".to_owned(),
                        "tool:git:(push|merge_request).*".to_owned(),
                        "tool:self_edit:.*".to_owned(),
                    ],
                )
            }
            "locked" => Self::new(&["tool:view:.*"], &[]),
            other => Err(PolicyError::UnknownPreset(other.to_owned())),
        }
    }

    /// Decide what to do with `action`.  Allow patterns take priority over
    /// ask patterns; an action matching neither list is denied.
    pub fn decide(&self, action: &str) -> Decision {
        if self.allow.iter().any(|p| p.regex.is_match(action)) {
            Decision::Allow
        } else if self.ask.iter().any(|p| p.regex.is_match(action)) {
            Decision::Ask
        } else {
            Decision::Deny
        }
    }

    /// Returns true if some action beginning with `prefix` could be allowed
    /// or asked under this profile.  Used to omit tools whose every possible
    /// action would be denied from the schema projection; the per-call
    /// `decide` remains authoritative.
    pub fn prefix_may_pass(&self, prefix: &str) -> bool {
        self.allow
            .iter()
            .chain(self.ask.iter())
            .any(|p| pattern_may_cover(p, prefix))
    }
}

/// Build the canonical action string for a tool invocation.
pub fn format_action(tool: &str, detail: &str) -> String {
    format!("tool:{tool}:{detail}")
}

// ─── Helpers ────────────────────────────────────────────────────────────────

fn compile_all<S: AsRef<str>>(patterns: &[S]) -> Result<Vec<Pattern>, PolicyError> {
    patterns
        .iter()
        .map(|p| {
            let raw = p.as_ref().to_owned();
            let regex = Regex::new(&format!("^(?:{raw})$")).map_err(|source| {
                PolicyError::InvalidPattern {
                    pattern: raw.clone(),
                    source,
                }
            })?;
            Ok(Pattern { raw, regex })
        })
        .collect()
}

/// Could `pattern` match some action starting with `prefix`?
///
/// Regex containment is undecidable in general, so this probes with cheap
/// samples and falls back to comparing the pattern's literal prefix (the
/// characters before its first metacharacter).  Errs on the side of keeping
/// the tool visible.
fn pattern_may_cover(pattern: &Pattern, prefix: &str) -> bool {
    if pattern.regex.is_match(prefix) || pattern.regex.is_match(&format!("{prefix}x")) {
        return true;
    }
    let literal: String = pattern
        .raw
        .chars()
        .take_while(|c| !"\\^$.|?*+()[]{".contains(*c))
        .collect();
    literal.starts_with(prefix) || prefix.starts_with(&literal)
}

/// Generate a plain-regex expression matching exactly the strings that do
/// not start with any of `alts`.
///
/// The `regex` crate has no look-around, so `(?!push|merge_request).*`
/// cannot be written directly.  This builds the complement from a trie of
/// the alternatives: at each node the string may end, leave the trie via a
/// character with no edge, or descend into a child that is not itself the
/// end of an alternative.
fn not_prefixed_by(alts: &[&str]) -> String {
    #[derive(Default)]
    struct Node {
        children: std::collections::BTreeMap<char, Node>,
        terminal: bool,
    }

    let mut root = Node::default();
    for alt in alts {
        let mut node = &mut root;
        for ch in alt.chars() {
            node = node.children.entry(ch).or_default();
        }
        node.terminal = true;
    }

    fn class_escape(ch: char) -> String {
        match ch {
            ']' | '\\' | '^' | '-' => format!("\\{ch}"),
            _ => ch.to_string(),
        }
    }

    fn render(node: &Node) -> String {
        let edge_chars: String = node.children.keys().map(|c| class_escape(*c)).collect();
        let mut branches = vec![format!("[^{edge_chars}].*")];
        for (ch, child) in &node.children {
            if !child.terminal {
                branches.push(format!("{}{}", regex::escape(&ch.to_string()), render(child)));
            }
        }
        format!("(?:{})?", branches.join("|"))
    }

    render(&root)
}
