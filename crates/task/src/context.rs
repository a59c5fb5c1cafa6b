//! Project context handed to executors, memoized in the cache

use chrono::{DateTime, Utc};
use filebridge_cache::CacheManager;
use filebridge_config::ProjectRegistry;
use filebridge_core::constants::PROJECT_CONTEXT_NAMESPACE;
use filebridge_core::{Error, ProjectRecord, Result};
use filebridge_utils::detect_shortcuts;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;

/// Top-level directory entries listed in a context
const MAX_ENTRIES: usize = 50;

const NOTES_CANDIDATES: &[&str] = &["CLAUDE.md", "README.md"];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProjectContext {
    pub project: ProjectRecord,
    pub related: Vec<ProjectRecord>,
    /// Project notes, cut to the registry's `max_context_size` characters
    pub notes: Option<String>,
    pub notes_truncated: bool,
    /// Sorted names of visible top-level files and directories
    pub entries: Vec<String>,
    pub loaded_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct ProjectContextLoader {
    registry: Arc<RwLock<ProjectRegistry>>,
    cache: CacheManager,
}

impl ProjectContextLoader {
    pub fn new(registry: Arc<RwLock<ProjectRegistry>>, cache: CacheManager) -> Self {
        Self { registry, cache }
    }

    pub fn registry(&self) -> &Arc<RwLock<ProjectRegistry>> {
        &self.registry
    }

    /// Context for `project_id`, from the cache when fresh
    pub async fn load(&self, project_id: &str) -> Result<ProjectContext> {
        let (project, related, settings) = {
            let registry = self.registry.read().await;
            let project = registry.get(project_id).cloned().ok_or_else(|| {
                Error::configuration(format!("unknown project '{project_id}'"))
            })?;
            let related: Vec<ProjectRecord> =
                registry.related(project_id).into_iter().cloned().collect();
            (project, related, registry.global_settings().clone())
        };

        let ttl = Duration::from_secs(settings.cache_duration);
        let max_chars = settings.max_context_size;
        self.cache
            .get_or_compute(PROJECT_CONTEXT_NAMESPACE, project_id, ttl, || {
                build_context(project, related, max_chars)
            })
            .await
    }

    /// Drop the memoized context, e.g. after the registry is reloaded
    pub async fn invalidate(&self, project_id: &str) -> Result<bool> {
        self.cache.delete(PROJECT_CONTEXT_NAMESPACE, project_id).await
    }

    /// Registry projects whose shortcuts appear in `text`, in order
    pub async fn detect_projects(&self, text: &str) -> Vec<ProjectRecord> {
        let registry = self.registry.read().await;
        detect_shortcuts(text)
            .iter()
            .filter_map(|shortcut| registry.by_shortcut(shortcut).cloned())
            .collect()
    }
}

async fn build_context(
    project: ProjectRecord,
    related: Vec<ProjectRecord>,
    max_chars: usize,
) -> Result<ProjectContext> {
    let root = project.resolved_path();
    let (notes, notes_truncated) = match read_notes(&project, &root).await {
        Some(text) => {
            let truncated = text.chars().count() > max_chars;
            let text = if truncated {
                text.chars().take(max_chars).collect()
            } else {
                text
            };
            (Some(text), truncated)
        }
        None => (None, false),
    };
    let entries = list_entries(&root).await;

    tracing::debug!(
        project = %project.id,
        notes = notes.is_some(),
        entries = entries.len(),
        "project context built"
    );

    Ok(ProjectContext {
        project,
        related,
        notes,
        notes_truncated,
        entries,
        loaded_at: Utc::now(),
    })
}

async fn read_notes(project: &ProjectRecord, root: &Path) -> Option<String> {
    let candidates: Vec<PathBuf> = match project.resolved_notes_path() {
        Some(explicit) => vec![explicit],
        None => NOTES_CANDIDATES.iter().map(|name| root.join(name)).collect(),
    };
    for path in candidates {
        match tokio::fs::read_to_string(&path).await {
            Ok(text) => return Some(text),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "cannot read project notes");
            }
        }
    }
    None
}

async fn list_entries(root: &Path) -> Vec<String> {
    let mut dir = match tokio::fs::read_dir(root).await {
        Ok(dir) => dir,
        Err(e) => {
            tracing::warn!(path = %root.display(), error = %e, "cannot list project directory");
            return Vec::new();
        }
    };
    let mut names = Vec::new();
    while let Ok(Some(entry)) = dir.next_entry().await {
        if let Some(name) = entry.file_name().to_str() {
            if !name.starts_with('.') {
                names.push(name.to_string());
            }
        }
    }
    names.sort();
    names.truncate(MAX_ENTRIES);
    names
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    async fn setup(notes: &str, max_context_size: usize) -> (TempDir, ProjectContextLoader) {
        let temp = TempDir::new().unwrap();
        let project_dir = temp.path().join("tech");
        std::fs::create_dir_all(project_dir.join("src")).unwrap();
        std::fs::write(project_dir.join("README.md"), notes).unwrap();
        std::fs::write(project_dir.join(".env"), "SECRET=1").unwrap();

        let registry_path = temp.path().join("projects.json");
        let document = json!({
            "version": "1.0.0",
            "projects": {
                "tech": {
                    "shortcut": "[tech]",
                    "path": project_dir.to_string_lossy(),
                    "related_projects": ["techzip"]
                },
                "techzip": {
                    "shortcut": "[techzip]",
                    "path": temp.path().join("techzip").to_string_lossy(),
                    "dependencies": ["tech"]
                }
            },
            "global_settings": { "max_context_size": max_context_size, "cache_duration": 60 }
        });
        std::fs::write(&registry_path, document.to_string()).unwrap();

        let mut registry = ProjectRegistry::new(&registry_path);
        registry.load().await.unwrap();
        let cache = CacheManager::new(temp.path().join("cache"), Duration::from_secs(60));
        let loader = ProjectContextLoader::new(Arc::new(RwLock::new(registry)), cache);
        (temp, loader)
    }

    #[tokio::test]
    async fn test_context_contents() {
        let (_temp, loader) = setup("# Tech\nAll about tech.", 5_000).await;
        let context = loader.load("tech").await.unwrap();
        assert_eq!(context.project.id, "tech");
        assert_eq!(context.related.len(), 1);
        assert_eq!(context.related[0].id, "techzip");
        assert_eq!(context.notes.as_deref(), Some("# Tech\nAll about tech."));
        assert!(!context.notes_truncated);
        assert_eq!(context.entries, vec!["README.md", "src"]);
    }

    #[tokio::test]
    async fn test_notes_truncated_to_limit() {
        let (_temp, loader) = setup(&"x".repeat(100), 10).await;
        let context = loader.load("tech").await.unwrap();
        assert_eq!(context.notes.as_deref(), Some("xxxxxxxxxx"));
        assert!(context.notes_truncated);
    }

    #[tokio::test]
    async fn test_context_is_memoized_until_invalidated() {
        let (temp, loader) = setup("first", 5_000).await;
        let first = loader.load("tech").await.unwrap();

        std::fs::write(temp.path().join("tech").join("README.md"), "second").unwrap();
        let cached = loader.load("tech").await.unwrap();
        assert_eq!(cached, first);

        assert!(loader.invalidate("tech").await.unwrap());
        let fresh = loader.load("tech").await.unwrap();
        assert_eq!(fresh.notes.as_deref(), Some("second"));
    }

    #[tokio::test]
    async fn test_unknown_project_and_detection() {
        let (_temp, loader) = setup("n", 5_000).await;
        assert!(loader.load("nope").await.is_err());

        let found = loader.detect_projects("sync [techzip] with [tech] and [other]").await;
        let ids: Vec<&str> = found.iter().map(|p| p.id.as_str()).collect();
        assert_eq!(ids, vec!["techzip", "tech"]);
    }
}
