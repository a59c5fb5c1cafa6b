//! Pre-execution checks on the files a task wants to touch

use filebridge_core::{Error, Result};
use std::collections::HashSet;
use std::path::{Component, Path, PathBuf};

/// Validates task target paths against a project directory.
///
/// A target is accepted only when it resolves inside the project root, has
/// one of the allowed extensions, and (if it already exists) is no larger
/// than `max_file_size` bytes.
#[derive(Debug, Clone)]
pub struct PathGuard {
    max_file_size: u64,
    allowed_extensions: HashSet<String>,
}

impl PathGuard {
    /// An empty extension list allows every extension
    pub fn new<I, S>(max_file_size: u64, allowed_extensions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            max_file_size,
            allowed_extensions: allowed_extensions
                .into_iter()
                .map(|e| e.as_ref().trim_start_matches('.').to_ascii_lowercase())
                .collect(),
        }
    }

    pub fn max_file_size(&self) -> u64 {
        self.max_file_size
    }

    /// Resolve `target` against `project_root` and run every check.
    ///
    /// Returns the resolved absolute path on success.
    pub fn check(&self, project_root: &Path, target: &str) -> Result<PathBuf> {
        if target.contains('\0') {
            return Err(Error::security(target, "path contains a null byte"));
        }

        let resolved = Self::resolve_within(project_root, Path::new(target))?;
        self.check_extension(&resolved)?;

        if let Ok(metadata) = std::fs::metadata(&resolved) {
            if metadata.is_file() && metadata.len() > self.max_file_size {
                return Err(Error::security(
                    &resolved,
                    format!(
                        "file is {} bytes, limit is {} bytes",
                        metadata.len(),
                        self.max_file_size
                    ),
                ));
            }
        }

        Ok(resolved)
    }

    /// Check every target, stopping at the first violation
    pub fn check_all<'a, I>(&self, project_root: &Path, targets: I) -> Result<Vec<PathBuf>>
    where
        I: IntoIterator<Item = &'a String>,
    {
        targets
            .into_iter()
            .map(|t| self.check(project_root, t))
            .collect()
    }

    fn check_extension(&self, path: &Path) -> Result<()> {
        if self.allowed_extensions.is_empty() {
            return Ok(());
        }
        let ext = path
            .extension()
            .map(|e| e.to_string_lossy().to_ascii_lowercase());
        match ext {
            Some(ext) if self.allowed_extensions.contains(&ext) => Ok(()),
            Some(ext) => Err(Error::security(
                path,
                format!("file type '.{ext}' is not allowed"),
            )),
            None => Err(Error::security(path, "files without an extension are not allowed")),
        }
    }

    /// Lexically resolve `target` under `root`. Symlinks are followed for the
    /// root only, so a target that does not exist yet can still be checked.
    fn resolve_within(root: &Path, target: &Path) -> Result<PathBuf> {
        let root = root.canonicalize().unwrap_or_else(|_| root.to_path_buf());
        let mut resolved = root.clone();
        let mut depth = 0usize;

        for component in target.components() {
            match component {
                Component::Prefix(_) | Component::RootDir => {
                    return Err(Error::security(
                        target,
                        "absolute paths are not allowed as task targets",
                    ));
                }
                Component::CurDir => {}
                Component::ParentDir => {
                    if depth == 0 {
                        return Err(Error::security(
                            target,
                            "path traversal outside of the project directory",
                        ));
                    }
                    resolved.pop();
                    depth -= 1;
                }
                Component::Normal(c) => {
                    resolved.push(c);
                    depth += 1;
                }
            }
        }

        if let Ok(canonical) = resolved.canonicalize() {
            if !canonical.starts_with(&root) {
                return Err(Error::security(
                    target,
                    "path resolves outside of the project directory",
                ));
            }
        }

        Ok(resolved)
    }
}
