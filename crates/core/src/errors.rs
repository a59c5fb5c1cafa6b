use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

/// Result type alias for filebridge operations
pub type Result<T> = std::result::Result<T, Error>;

/// Coarse classification every [`Error`] maps onto.
///
/// Callers match on the kind to decide between local recovery
/// (`Configuration`, `TaskParse`), capture into a task result (`Execution`)
/// and surfacing to the operator (`FileAccess`, `Security`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Configuration,
    FileAccess,
    TaskParse,
    Execution,
    Security,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::Configuration => "configuration",
            ErrorKind::FileAccess => "file_access",
            ErrorKind::TaskParse => "task_parse",
            ErrorKind::Execution => "execution",
            ErrorKind::Security => "security",
        };
        f.write_str(name)
    }
}

/// Core error type for filebridge operations
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Missing or malformed configuration / registry data
    #[error("configuration error: {message}")]
    Configuration { message: String },

    /// File system operations
    #[error("file system {operation} operation failed for '{path}': {source}")]
    FileSystem {
        path: PathBuf,
        operation: String,
        #[source]
        source: std::io::Error,
    },

    /// Permission denied errors
    #[error("permission denied for {operation} on '{path}'")]
    PermissionDenied { path: PathBuf, operation: String },

    /// Malformed task or result file
    #[error("failed to parse '{path}': {message}")]
    TaskParse { path: PathBuf, message: String },

    /// Structurally invalid task definition (bad id, dependency cycle)
    #[error("invalid task '{task_id}': {message}")]
    InvalidTask { task_id: String, message: String },

    /// Task execution failed
    #[error("task '{task_id}' failed: {message}")]
    Execution { task_id: String, message: String },

    /// Path traversal, disallowed file type or oversized file
    #[error("security violation for '{path}': {message}")]
    Security { path: PathBuf, message: String },

    /// JSON serialization/deserialization errors
    #[error("JSON error: {message}")]
    Json {
        message: String,
        #[source]
        source: serde_json::Error,
    },

    /// Operation timeout errors
    #[error("operation '{operation}' timed out after {duration:?}")]
    Timeout {
        operation: String,
        duration: Duration,
    },
}

// Conversion implementations
impl From<std::io::Error> for Error {
    fn from(error: std::io::Error) -> Self {
        Error::FileSystem {
            path: PathBuf::new(),
            operation: "unknown".to_string(),
            source: error,
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(error: serde_json::Error) -> Self {
        Error::Json {
            message: error.to_string(),
            source: error,
        }
    }
}

impl Error {
    /// Classify this error
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Configuration { .. } | Error::Json { .. } => ErrorKind::Configuration,
            Error::FileSystem { .. } | Error::PermissionDenied { .. } => ErrorKind::FileAccess,
            Error::TaskParse { .. } | Error::InvalidTask { .. } => ErrorKind::TaskParse,
            Error::Execution { .. } | Error::Timeout { .. } => ErrorKind::Execution,
            Error::Security { .. } => ErrorKind::Security,
        }
    }

    /// True when the underlying I/O error is `NotFound`
    ///
    /// Queue moves use this to tell "another worker already took the file"
    /// apart from genuine failures.
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            Error::FileSystem { source, .. } if source.kind() == std::io::ErrorKind::NotFound
        )
    }

    /// Create a configuration error
    #[must_use]
    pub fn configuration(message: impl Into<String>) -> Self {
        Error::Configuration {
            message: message.into(),
        }
    }

    /// Create a file system error with context.
    ///
    /// `PermissionDenied` I/O failures are promoted to
    /// [`Error::PermissionDenied`] so they are never mistaken for transient
    /// faults.
    #[must_use]
    pub fn file_system(
        path: impl Into<PathBuf>,
        operation: impl Into<String>,
        source: std::io::Error,
    ) -> Self {
        if source.kind() == std::io::ErrorKind::PermissionDenied {
            return Error::PermissionDenied {
                path: path.into(),
                operation: operation.into(),
            };
        }
        Error::FileSystem {
            path: path.into(),
            operation: operation.into(),
            source,
        }
    }

    /// Create a task parse error
    #[must_use]
    pub fn task_parse(path: impl Into<PathBuf>, message: impl Into<String>) -> Self {
        Error::TaskParse {
            path: path.into(),
            message: message.into(),
        }
    }

    /// Create an invalid task error
    #[must_use]
    pub fn invalid_task(task_id: impl Into<String>, message: impl Into<String>) -> Self {
        Error::InvalidTask {
            task_id: task_id.into(),
            message: message.into(),
        }
    }

    /// Create an execution error
    #[must_use]
    pub fn execution(task_id: impl Into<String>, message: impl Into<String>) -> Self {
        Error::Execution {
            task_id: task_id.into(),
            message: message.into(),
        }
    }

    /// Create a security validation error
    #[must_use]
    pub fn security(path: impl Into<PathBuf>, message: impl Into<String>) -> Self {
        Error::Security {
            path: path.into(),
            message: message.into(),
        }
    }

    /// Create a timeout error
    #[must_use]
    pub fn timeout(operation: impl Into<String>, duration: Duration) -> Self {
        Error::Timeout {
            operation: operation.into(),
            duration,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;

    #[test]
    fn test_error_kinds() {
        assert_eq!(
            Error::configuration("bad").kind(),
            ErrorKind::Configuration
        );
        assert_eq!(
            Error::task_parse("a.md", "missing Task section").kind(),
            ErrorKind::TaskParse
        );
        assert_eq!(
            Error::security("../etc/passwd", "outside project").kind(),
            ErrorKind::Security
        );
        assert_eq!(
            Error::timeout("execute", Duration::from_secs(1)).kind(),
            ErrorKind::Execution
        );
    }

    #[test]
    fn test_permission_denied_is_promoted() {
        let err = Error::file_system(
            "/root/x",
            "write",
            io::Error::new(io::ErrorKind::PermissionDenied, "denied"),
        );
        assert!(matches!(err, Error::PermissionDenied { .. }));
        assert_eq!(err.kind(), ErrorKind::FileAccess);
    }

    #[test]
    fn test_not_found_detection() {
        let err = Error::file_system(
            "/tmp/missing",
            "rename",
            io::Error::new(io::ErrorKind::NotFound, "gone"),
        );
        assert!(err.is_not_found());
        assert!(!Error::configuration("x").is_not_found());
    }
}
