//! Constants shared across the filebridge workspace

// Directory layout, relative to the bridge root
pub const CONFIG_DIR: &str = "config";
pub const TASKS_PENDING_DIR: &str = "tasks/pending";
pub const TASKS_PROCESSING_DIR: &str = "tasks/processing";
pub const TASKS_COMPLETED_DIR: &str = "tasks/completed";
pub const TASKS_ERROR_DIR: &str = "tasks/error";
pub const TASKS_QUARANTINE_DIR: &str = "tasks/quarantine";
pub const RESULTS_SUCCESS_DIR: &str = "results/success";
pub const RESULTS_ERROR_DIR: &str = "results/error";
pub const CACHE_DIR: &str = "cache";
pub const LOGS_DIR: &str = "logs";

/// Every directory `initialize_structure` guarantees, in creation order
pub const REQUIRED_DIRS: &[&str] = &[
    CONFIG_DIR,
    TASKS_PENDING_DIR,
    TASKS_PROCESSING_DIR,
    TASKS_COMPLETED_DIR,
    TASKS_ERROR_DIR,
    TASKS_QUARANTINE_DIR,
    RESULTS_SUCCESS_DIR,
    RESULTS_ERROR_DIR,
    CACHE_DIR,
    LOGS_DIR,
];

// Configuration files
pub const BRIDGE_CONFIG_FILENAME: &str = "bridge_config.json";
pub const PROJECTS_CONFIG_FILENAME: &str = "projects.json";
pub const RECOVERY_LOG_FILENAME: &str = "recovery.log";

// Protocol markers
pub const TASK_HEADER: &str = "## BRIDGE_TASK:";
pub const LEGACY_TASK_HEADER: &str = "## CLAUDE_TASK:";
pub const RESULT_HEADER: &str = "## BRIDGE_RESULT:";
pub const SECTION_PREFIX: &str = "### ";
pub const RECORD_TERMINATOR: &str = "---";

// File naming
pub const TASK_FILE_EXTENSION: &str = "md";
pub const TASK_SIDECAR_SUFFIX: &str = ".meta.json";
pub const RESULT_FILE_SUFFIX: &str = "_result.md";
pub const RESULT_SIDECAR_SUFFIX: &str = "_result.meta.json";
pub const FILENAME_TIMESTAMP_FORMAT: &str = "%Y%m%dT%H%M%S";

// Well-known task metadata keys
pub const META_TASK_ID: &str = "task_id";
pub const META_CREATED_AT: &str = "created_at";
pub const META_CREATOR: &str = "creator";
pub const META_ESTIMATED_EFFORT: &str = "estimated_effort";

// Environment variable names
pub const FILEBRIDGE_ROOT_VAR: &str = "FILEBRIDGE_ROOT";
pub const DEFAULT_BRIDGE_ROOT: &str = "bridge_data";

// Cache namespaces
pub const PROJECT_CONTEXT_NAMESPACE: &str = "project_context";
