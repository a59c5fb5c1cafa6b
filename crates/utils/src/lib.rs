//! Shared utilities for filebridge
//!
//! Atomic file writes, tracing setup and structured events, the path guard
//! applied before a task touches any file, and project shortcut detection.

pub mod atomic_file;
pub mod security;
pub mod shortcuts;
pub mod tracing;

pub use atomic_file::*;
pub use security::PathGuard;
pub use shortcuts::{detect_shortcuts, strip_shortcuts};
