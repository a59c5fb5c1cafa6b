//! Project registry backed by `config/projects.json`
//!
//! The registry is an ordinary value: construct it with the path of the
//! registry file, call [`ProjectRegistry::load`] once and
//! [`ProjectRegistry::reload`] whenever the file is known to have changed.
//! Share it as `Arc<RwLock<ProjectRegistry>>`.

use chrono::{DateTime, Utc};
use filebridge_core::{
    constants::{CONFIG_DIR, PROJECTS_CONFIG_FILENAME},
    validate_project_id, Error, ProjectRecord, Result,
};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Settings that apply to every project
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GlobalSettings {
    pub auto_load_context: bool,
    /// Upper bound, in characters, for project notes embedded in a context
    pub max_context_size: usize,
    /// Seconds a memoized project context stays valid
    pub cache_duration: u64,
    pub default_analysis_depth: String,
}

impl Default for GlobalSettings {
    fn default() -> Self {
        Self {
            auto_load_context: true,
            max_context_size: 5_000,
            cache_duration: 3_600,
            default_analysis_depth: "detailed".to_string(),
        }
    }
}

impl GlobalSettings {
    fn validate(&self) -> Result<()> {
        if self.max_context_size == 0 || self.max_context_size > 50_000 {
            return Err(Error::configuration(
                "max_context_size must be between 1 and 50000",
            ));
        }
        Ok(())
    }
}

/// Serialized form of the registry file
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistryDocument {
    #[serde(default = "default_version")]
    pub version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_updated: Option<DateTime<Utc>>,
    #[serde(default)]
    pub projects: IndexMap<String, serde_json::Value>,
    #[serde(default)]
    pub global_settings: GlobalSettings,
}

fn default_version() -> String {
    "1.0.0".to_string()
}

impl Default for RegistryDocument {
    /// The two stock projects shipped with a fresh bridge
    fn default() -> Self {
        let mut tech = ProjectRecord::new("tech", "~/projects/tech");
        tech.name = "Main tech project".to_string();
        tech.description = "Primary technology project".to_string();
        tech.related_projects = vec!["techzip".to_string()];

        let mut techzip = ProjectRecord::new("techzip", "~/projects/techzip");
        techzip.name = "ZIP processing library".to_string();
        techzip.description = "Library dedicated to ZIP file handling".to_string();
        techzip.dependencies = vec!["tech".to_string()];
        techzip.related_projects = vec!["tech".to_string()];

        let projects = [tech, techzip]
            .into_iter()
            .filter_map(|p| Some((p.id.clone(), serde_json::to_value(&p).ok()?)))
            .collect();

        Self {
            version: default_version(),
            last_updated: Some(Utc::now()),
            projects,
            global_settings: GlobalSettings::default(),
        }
    }
}

/// Explicitly constructed project registry
#[derive(Debug)]
pub struct ProjectRegistry {
    path: PathBuf,
    version: String,
    projects: IndexMap<String, ProjectRecord>,
    global_settings: GlobalSettings,
    last_loaded: Option<DateTime<Utc>>,
}

impl ProjectRegistry {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            version: default_version(),
            projects: IndexMap::new(),
            global_settings: GlobalSettings::default(),
            last_loaded: None,
        }
    }

    /// Registry at the conventional location under a bridge root
    pub fn for_root(root: &Path) -> Self {
        Self::new(root.join(CONFIG_DIR).join(PROJECTS_CONFIG_FILENAME))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_loaded(&self) -> bool {
        self.last_loaded.is_some()
    }

    pub fn last_loaded(&self) -> Option<DateTime<Utc>> {
        self.last_loaded
    }

    /// Load once; later calls are no-ops until [`Self::reload`]
    pub async fn load(&mut self) -> Result<()> {
        if self.is_loaded() {
            return Ok(());
        }
        self.reload().await
    }

    /// Re-read the registry file.
    ///
    /// A missing file yields the stock registry. Malformed JSON is a
    /// configuration error and leaves the previous contents in place.
    pub async fn reload(&mut self) -> Result<()> {
        let document = match tokio::fs::read_to_string(&self.path).await {
            Ok(raw) => serde_json::from_str::<RegistryDocument>(&raw).map_err(|e| {
                Error::configuration(format!(
                    "invalid JSON in project registry '{}': {e}",
                    self.path.display()
                ))
            })?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!(
                    path = %self.path.display(),
                    "project registry not found, using default projects"
                );
                RegistryDocument::default()
            }
            Err(e) => return Err(Error::file_system(&self.path, "read project registry", e)),
        };

        self.apply(document)?;
        self.last_loaded = Some(Utc::now());
        tracing::info!(
            path = %self.path.display(),
            projects = self.projects.len(),
            "project registry loaded"
        );
        Ok(())
    }

    fn apply(&mut self, document: RegistryDocument) -> Result<()> {
        document.global_settings.validate()?;

        let mut projects = IndexMap::new();
        for (id, raw) in document.projects {
            match serde_json::from_value::<ProjectRecord>(raw) {
                Ok(mut record) => {
                    record.id = id.clone();
                    if let Err(reason) = check_record(&record) {
                        tracing::warn!(project = %id, %reason, "skipping invalid project entry");
                        continue;
                    }
                    if record.name.trim().is_empty() {
                        record.name = id.clone();
                    }
                    projects.insert(id, record);
                }
                Err(e) => {
                    tracing::warn!(project = %id, error = %e, "skipping invalid project entry");
                }
            }
        }

        self.version = document.version;
        self.global_settings = document.global_settings;
        self.projects = projects;
        Ok(())
    }

    /// Write the current registry back to disk atomically
    pub async fn save(&self) -> Result<()> {
        let document = self.to_document();
        let raw = serde_json::to_string_pretty(&document)?;
        filebridge_utils::write_atomic_async(&self.path, raw.as_bytes()).await
    }

    pub fn to_document(&self) -> RegistryDocument {
        RegistryDocument {
            version: self.version.clone(),
            last_updated: Some(Utc::now()),
            projects: self
                .projects
                .iter()
                .filter_map(|(id, p)| {
                    let mut value = serde_json::to_value(p).ok()?;
                    // The map key is the id
                    if let Some(object) = value.as_object_mut() {
                        object.remove("id");
                    }
                    Some((id.clone(), value))
                })
                .collect(),
            global_settings: self.global_settings.clone(),
        }
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn global_settings(&self) -> &GlobalSettings {
        &self.global_settings
    }

    pub fn get(&self, project_id: &str) -> Option<&ProjectRecord> {
        self.projects.get(project_id)
    }

    pub fn contains(&self, project_id: &str) -> bool {
        self.projects.contains_key(project_id)
    }

    /// Look up by bracketed shortcut; the brackets are optional
    pub fn by_shortcut(&self, shortcut: &str) -> Option<&ProjectRecord> {
        let wanted = if shortcut.starts_with('[') {
            shortcut.to_string()
        } else {
            format!("[{shortcut}]")
        };
        self.projects.values().find(|p| p.shortcut == wanted)
    }

    /// Projects in registry order
    pub fn list(&self, active_only: bool) -> Vec<&ProjectRecord> {
        self.projects
            .values()
            .filter(|p| !active_only || p.active)
            .collect()
    }

    /// Related projects, direct dependencies and projects depending on
    /// `project_id`, each listed once
    pub fn related(&self, project_id: &str) -> Vec<&ProjectRecord> {
        let Some(project) = self.projects.get(project_id) else {
            return Vec::new();
        };

        let dependents = self
            .projects
            .values()
            .filter(|other| other.id != project_id && other.dependencies.iter().any(|d| d == project_id))
            .map(|other| other.id.as_str());

        let mut seen = std::collections::HashSet::new();
        project
            .related_projects
            .iter()
            .map(String::as_str)
            .chain(project.dependencies.iter().map(String::as_str))
            .chain(dependents)
            .filter(|id| *id != project_id && seen.insert(id.to_string()))
            .filter_map(|id| self.projects.get(id))
            .collect()
    }

    /// Non-fatal problems: references to unknown projects and duplicate
    /// shortcuts
    pub fn validate(&self) -> Vec<String> {
        let mut warnings = Vec::new();
        let mut shortcuts: IndexMap<&str, &str> = IndexMap::new();

        for project in self.projects.values() {
            for dep in &project.dependencies {
                if !self.projects.contains_key(dep) {
                    warnings.push(format!(
                        "project '{}' depends on unknown project '{dep}'",
                        project.id
                    ));
                }
            }
            for rel in &project.related_projects {
                if !self.projects.contains_key(rel) {
                    warnings.push(format!(
                        "project '{}' references unknown related project '{rel}'",
                        project.id
                    ));
                }
            }
            if let Some(previous) = shortcuts.insert(&project.shortcut, &project.id) {
                warnings.push(format!(
                    "shortcut '{}' is used by both '{previous}' and '{}'",
                    project.shortcut, project.id
                ));
            }
        }

        warnings
    }
}

fn check_record(record: &ProjectRecord) -> std::result::Result<(), String> {
    validate_project_id(&record.id).map_err(|e| e.to_string())?;
    if !record.has_valid_shortcut() {
        return Err(format!("shortcut '{}' must look like [name]", record.shortcut));
    }
    if record.path.trim().is_empty() {
        return Err("path cannot be empty".to_string());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const REGISTRY: &str = r#"{
      "version": "1.0.0",
      "projects": {
        "tech": {
          "shortcut": "[tech]", "name": "Tech", "path": "/srv/tech",
          "description": "main", "related_projects": ["techzip"], "active": true
        },
        "techzip": {
          "shortcut": "[techzip]", "name": "Zip", "path": "/srv/techzip",
          "description": "zip", "dependencies": ["tech", "ghost"]
        },
        "broken": { "shortcut": "broken", "path": "/srv/broken" },
        "../escape": { "shortcut": "[escape]", "path": "/srv/escape" },
        "dormant": { "shortcut": "[dormant]", "path": "/srv/dormant", "active": false }
      },
      "global_settings": { "max_context_size": 1000 }
    }"#;

    async fn loaded() -> (TempDir, ProjectRegistry) {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("projects.json");
        std::fs::write(&path, REGISTRY).unwrap();
        let mut registry = ProjectRegistry::new(path);
        registry.load().await.unwrap();
        (dir, registry)
    }

    #[tokio::test]
    async fn test_invalid_entries_are_skipped() {
        let (_dir, registry) = loaded().await;
        assert!(registry.get("broken").is_none());
        assert!(registry.get("../escape").is_none());
        assert_eq!(registry.list(false).len(), 3);
        assert_eq!(registry.list(true).len(), 2);
        assert_eq!(registry.global_settings().max_context_size, 1000);
        assert_eq!(registry.global_settings().cache_duration, 3600);
    }

    #[tokio::test]
    async fn test_lookup_by_shortcut() {
        let (_dir, registry) = loaded().await;
        assert_eq!(registry.by_shortcut("[techzip]").unwrap().id, "techzip");
        assert_eq!(registry.by_shortcut("tech").unwrap().id, "tech");
        assert!(registry.by_shortcut("[nope]").is_none());
    }

    #[tokio::test]
    async fn test_related_is_deduplicated() {
        let (_dir, registry) = loaded().await;
        let related: Vec<_> = registry.related("tech").iter().map(|p| p.id.clone()).collect();
        assert_eq!(related, vec!["techzip"]);

        let related: Vec<_> = registry.related("techzip").iter().map(|p| p.id.clone()).collect();
        assert_eq!(related, vec!["tech"]);
    }

    #[tokio::test]
    async fn test_validation_warnings() {
        let (_dir, registry) = loaded().await;
        let warnings = registry.validate();
        assert_eq!(warnings.len(), 1);
        assert!(warnings[0].contains("ghost"));
    }

    #[tokio::test]
    async fn test_missing_file_yields_stock_projects() {
        let dir = TempDir::new().unwrap();
        let mut registry = ProjectRegistry::for_root(dir.path());
        registry.load().await.unwrap();
        assert!(registry.get("tech").is_some());
        assert!(registry.get("techzip").is_some());
    }

    #[tokio::test]
    async fn test_reload_picks_up_changes_and_keeps_state_on_error() {
        let (dir, mut registry) = loaded().await;
        let path = dir.path().join("projects.json");

        std::fs::write(&path, r#"{"projects":{"solo":{"shortcut":"[solo]","path":"/x"}}}"#).unwrap();
        registry.load().await.unwrap();
        assert!(registry.get("tech").is_some(), "load is a no-op once loaded");

        registry.reload().await.unwrap();
        assert!(registry.get("tech").is_none());
        assert!(registry.get("solo").is_some());

        std::fs::write(&path, "not json").unwrap();
        assert!(registry.reload().await.is_err());
        assert!(registry.get("solo").is_some());
    }

    #[tokio::test]
    async fn test_save_round_trip() {
        let (dir, registry) = loaded().await;
        let copy_path = dir.path().join("copy.json");
        let mut copy = ProjectRegistry::new(&copy_path);
        copy.projects = registry.projects.clone();
        copy.save().await.unwrap();

        let mut reread = ProjectRegistry::new(&copy_path);
        reread.load().await.unwrap();
        assert_eq!(reread.list(false).len(), 3);
        assert_eq!(reread.get("tech").unwrap().path, "/srv/tech");
    }
}
