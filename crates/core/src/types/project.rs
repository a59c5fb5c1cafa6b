//! Project metadata supplied by the external registry

use crate::errors::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Project ids become the first field of queue file names, so they are held
/// to file-name-safe characters: ASCII alphanumerics, `-`, `_` and `.`, not
/// starting with `.`.
pub fn validate_project_id(id: &str) -> Result<()> {
    let reason = if id.is_empty() {
        "project id cannot be empty"
    } else if id.len() > 128 {
        "project id exceeds 128 characters"
    } else if id.starts_with('.') {
        "project id cannot start with '.'"
    } else if !id
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
    {
        "project id must contain only ASCII alphanumerics, '-', '_' and '.'"
    } else {
        return Ok(());
    };
    Err(Error::security(id, reason))
}

/// A project the bridge can route tasks to. Read-only to the core.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProjectRecord {
    /// Registry key; filled in from the map key when loading `projects.json`
    #[serde(default)]
    pub id: String,
    /// Bracketed token such as `[tech]`
    pub shortcut: String,
    #[serde(default)]
    pub name: String,
    pub path: String,
    /// Project notes file; defaults to `CLAUDE.md` / `README.md` under `path`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub claude_md: Option<String>,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub tech_stack: Vec<String>,
    #[serde(default)]
    pub integration_points: Vec<String>,
    #[serde(default)]
    pub dependencies: Vec<String>,
    #[serde(default)]
    pub related_projects: Vec<String>,
    #[serde(default = "default_active")]
    pub active: bool,
}

fn default_active() -> bool {
    true
}

fn expand_home(raw: &str) -> PathBuf {
    if let Some(rest) = raw.strip_prefix("~/") {
        if let Some(home) = std::env::var_os("HOME") {
            return PathBuf::from(home).join(rest);
        }
    }
    PathBuf::from(raw)
}

impl ProjectRecord {
    pub fn new(id: impl Into<String>, path: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            shortcut: format!("[{id}]"),
            name: id.clone(),
            id,
            path: path.into(),
            claude_md: None,
            description: String::new(),
            tech_stack: Vec::new(),
            integration_points: Vec::new(),
            dependencies: Vec::new(),
            related_projects: Vec::new(),
            active: true,
        }
    }

    /// Shortcut without its brackets
    pub fn shortcut_name(&self) -> &str {
        self.shortcut
            .strip_prefix('[')
            .and_then(|s| s.strip_suffix(']'))
            .unwrap_or(&self.shortcut)
    }

    /// Filesystem path with a leading `~` expanded from `HOME`
    pub fn resolved_path(&self) -> PathBuf {
        expand_home(&self.path)
    }

    /// Explicit notes file, if configured, with `~` expanded
    pub fn resolved_notes_path(&self) -> Option<PathBuf> {
        self.claude_md.as_deref().map(expand_home)
    }

    /// A shortcut must look like `[x]` with at least one inner character
    pub fn has_valid_shortcut(&self) -> bool {
        self.shortcut.len() >= 3 && self.shortcut.starts_with('[') && self.shortcut.ends_with(']')
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_project_id_rules() {
        assert!(validate_project_id("tech").is_ok());
        assert!(validate_project_id("web_app.v2-x").is_ok());
        assert!(validate_project_id("..").is_err());
        assert!(validate_project_id("../up").is_err());
        assert!(validate_project_id("a\\b").is_err());
        assert!(validate_project_id("has space").is_err());
        assert!(validate_project_id(&"x".repeat(129)).is_err());
    }

    #[test]
    fn test_shortcut_helpers() {
        let record = ProjectRecord::new("tech", "/srv/tech");
        assert_eq!(record.shortcut, "[tech]");
        assert_eq!(record.shortcut_name(), "tech");
        assert!(record.has_valid_shortcut());

        let mut bad = record.clone();
        bad.shortcut = "[]".to_string();
        assert!(!bad.has_valid_shortcut());
    }

    #[test]
    fn test_absolute_path_is_untouched() {
        let record = ProjectRecord::new("tech", "/srv/tech");
        assert_eq!(record.resolved_path(), PathBuf::from("/srv/tech"));
    }
}
