//! Toxic collection errors.

use thiserror::Error;

/// Errors returned when editing a toxic collection.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ToxicError {
    /// A toxic with this name is already attached.
    #[error("toxic already exists: {0}")]
    AlreadyExists(String),

    /// No toxic with this name is attached.
    #[error("toxic not found: {0}")]
    NotFound(String),
}
