//! Core domain types, errors, and constants for filebridge.
//!
//! Everything that crosses a crate boundary lives here: the tagged [`Error`]
//! enum with its [`ErrorKind`] classification, the [`Task`] and
//! [`TaskResult`] records exchanged through the bridge directory, and the
//! read-only [`ProjectRecord`] supplied by the project registry.

pub mod constants;
pub mod errors;
pub mod types;

pub use self::{
    constants::*,
    errors::{Error, ErrorKind, Result},
    types::*,
};
