//! Configuration loader for filebridge
//!
//! Resolves the bridge root and reads `config/bridge_config.json`, falling
//! back to defaults when the file is missing.

use crate::settings::BridgeConfig;
use filebridge_core::{
    constants::{BRIDGE_CONFIG_FILENAME, CONFIG_DIR, DEFAULT_BRIDGE_ROOT, FILEBRIDGE_ROOT_VAR},
    Error, Result,
};
use std::path::{Path, PathBuf};

/// A loaded configuration together with where it came from
#[derive(Debug, Clone)]
pub struct LoadedConfig {
    pub root: PathBuf,
    pub config: BridgeConfig,
    /// False when defaults were used because the file does not exist
    pub from_file: bool,
}

impl LoadedConfig {
    pub fn config_path(&self) -> PathBuf {
        config_path(&self.root)
    }
}

/// Location of the bridge configuration file under `root`
pub fn config_path(root: &Path) -> PathBuf {
    root.join(CONFIG_DIR).join(BRIDGE_CONFIG_FILENAME)
}

/// Configuration loader that handles startup configuration
#[derive(Debug, Default)]
pub struct ConfigLoader {
    /// Explicit bridge root; wins over the environment
    root: Option<PathBuf>,
}

impl ConfigLoader {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the bridge root directory
    pub fn root(mut self, root: impl Into<PathBuf>) -> Self {
        self.root = Some(root.into());
        self
    }

    /// Explicit root, else `FILEBRIDGE_ROOT`, else `./bridge_data`
    pub fn resolve_root(&self) -> Result<PathBuf> {
        if let Some(root) = &self.root {
            return Ok(root.clone());
        }
        if let Some(env_root) = std::env::var_os(FILEBRIDGE_ROOT_VAR) {
            if !env_root.is_empty() {
                return Ok(PathBuf::from(env_root));
            }
        }
        let cwd = std::env::current_dir()
            .map_err(|e| Error::configuration(format!("failed to determine working directory: {e}")))?;
        Ok(cwd.join(DEFAULT_BRIDGE_ROOT))
    }

    /// Load the configuration
    pub async fn load(self) -> Result<LoadedConfig> {
        let root = self.resolve_root()?;
        let path = config_path(&root);

        match tokio::fs::read_to_string(&path).await {
            Ok(raw) => {
                let config = BridgeConfig::from_json(&raw).map_err(|e| {
                    Error::configuration(format!("{}: {e}", path.display()))
                })?;
                tracing::debug!(path = %path.display(), "loaded bridge configuration");
                Ok(LoadedConfig {
                    root,
                    config,
                    from_file: true,
                })
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::warn!(
                    path = %path.display(),
                    "bridge configuration not found, using defaults"
                );
                Ok(LoadedConfig {
                    root,
                    config: BridgeConfig::default(),
                    from_file: false,
                })
            }
            Err(e) => Err(Error::file_system(path, "read bridge configuration", e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_missing_file_uses_defaults() {
        let dir = TempDir::new().unwrap();
        let loaded = ConfigLoader::new().root(dir.path()).load().await.unwrap();
        assert!(!loaded.from_file);
        assert_eq!(loaded.config.settings.max_task_retention_days, 30);
    }

    #[tokio::test]
    async fn test_reads_file() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir_all(dir.path().join("config")).unwrap();
        std::fs::write(
            config_path(dir.path()),
            r#"{"version":"1.0.0","settings":{"worker_count":2}}"#,
        )
        .unwrap();

        let loaded = ConfigLoader::new().root(dir.path()).load().await.unwrap();
        assert!(loaded.from_file);
        assert_eq!(loaded.config.settings.worker_count, 2);
    }

    #[tokio::test]
    async fn test_malformed_file_is_error() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir_all(dir.path().join("config")).unwrap();
        std::fs::write(config_path(dir.path()), "{{{").unwrap();

        let err = ConfigLoader::new().root(dir.path()).load().await.unwrap_err();
        assert_eq!(err.kind(), filebridge_core::ErrorKind::Configuration);
    }

    #[test]
    #[serial]
    fn test_root_resolution_order() {
        let dir = TempDir::new().unwrap();
        std::env::set_var(FILEBRIDGE_ROOT_VAR, dir.path());

        let from_env = ConfigLoader::new().resolve_root().unwrap();
        assert_eq!(from_env, dir.path());

        let explicit = ConfigLoader::new().root("/explicit").resolve_root().unwrap();
        assert_eq!(explicit, PathBuf::from("/explicit"));

        std::env::remove_var(FILEBRIDGE_ROOT_VAR);
        let fallback = ConfigLoader::new().resolve_root().unwrap();
        assert!(fallback.ends_with(DEFAULT_BRIDGE_ROOT));
    }
}
