use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

// Re-export tracing macros for convenience
pub use tracing::{debug, error, info, instrument, span, trace, warn, Level, Span};

/// Initialize the tracing system.
///
/// `RUST_LOG` wins when set; otherwise `default_level` (the configured
/// `log_level`) is used, falling back to `info` if it does not parse.
/// Output goes to stderr so task files and results on stdout stay clean.
pub fn init(default_level: &str) -> Result<(), Box<dyn std::error::Error + Send + Sync + 'static>> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_level.to_ascii_lowercase()))
        .or_else(|_| EnvFilter::try_new("info"))?;

    let fmt_layer = fmt::layer()
        .with_writer(std::io::stderr)
        .with_ansi(is_tty())
        .compact()
        .with_target(false)
        .with_thread_ids(false)
        .with_level(true);

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt_layer)
        .try_init()?;

    Ok(())
}

fn is_tty() -> bool {
    std::io::IsTerminal::is_terminal(&std::io::stderr())
}

/// Span covering one task from claim to terminal move
pub fn task_span(task_id: &str, project: &str) -> Span {
    span!(Level::INFO, "task", task_id = %task_id, project = %project)
}

pub fn task_queued(task_id: &str, project: &str, priority: &str) {
    info!(
        task_id = %task_id,
        project = %project,
        priority = %priority,
        "task_queued"
    );
}

pub fn task_started(task_id: &str, project: &str) {
    info!(task_id = %task_id, project = %project, "task_started");
}

/// Emit a structured event for task completion
pub fn task_completed(task_id: &str, duration_ms: u64, success: bool) {
    if success {
        info!(
            task_id = %task_id,
            duration_ms = %duration_ms,
            "task_completed"
        );
    } else {
        error!(
            task_id = %task_id,
            duration_ms = %duration_ms,
            "task_failed"
        );
    }
}

/// Emit a structured event for cache operations
pub fn cache_event(namespace: &str, key: &str, hit: bool) {
    if hit {
        debug!(namespace = %namespace, key = %key, "cache_hit");
    } else {
        debug!(namespace = %namespace, key = %key, "cache_miss");
    }
}

/// Emit a structured event for one recovery attempt
pub fn recovery_action(action: &str, target: &str, success: bool) {
    if success {
        info!(action = %action, target = %target, "recovery_applied");
    } else {
        warn!(action = %action, target = %target, "recovery_failed");
    }
}
