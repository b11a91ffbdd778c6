//! Error types for Persona Core
//!
//! This module defines all error types used throughout the profile store and the sync engine.
//! We use `thiserror` for ergonomic error definitions with automatic Display/Error implementations.

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for Persona operations
pub type Result<T> = std::result::Result<T, PersonaError>;

/// Main error type for Persona operations
#[derive(Error, Debug)]
pub enum PersonaError {
    /// Profile store errors
    #[error("Profile error: {0}")]
    Profile(#[from] ProfileError),

    /// Sync engine errors
    #[error("Sync error: {0}")]
    Sync(#[from] SyncError),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Serialization errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic error with context
    #[error("{context}: {source}")]
    WithContext {
        context: String,
        source: Box<PersonaError>,
    },
}

/// Errors raised synchronously by the profile store
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProfileError {
    #[error("Profile not found: {0}")]
    NotFound(String),

    #[error("Invalid profile field `{field}`: {reason}")]
    InvalidField { field: String, reason: String },

    #[error("Profile set invariant violated: {0}")]
    InvariantViolation(String),
}

/// Errors raised by the sync engine
#[derive(Error, Debug)]
pub enum SyncError {
    /// The document has a recognized shape but fails schema checks
    #[error("Invalid sync document: {}: {reason}", location(.index, .field))]
    Validation {
        /// Position of the offending profile; `None` for document-level fields
        index: Option<usize>,
        field: String,
        reason: String,
    },

    /// The document matches none of the recognized shapes
    #[error("Unrecognized sync document format: {0}")]
    Format(String),

    #[error("I/O failure on {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("{operation} timed out after {millis}ms")]
    Timeout { operation: String, millis: u64 },

    #[error("Failed to encode sync document: {0}")]
    Encode(#[source] serde_json::Error),

    #[error("Another sync operation is in flight")]
    Busy,

    #[error("Sync engine has stopped")]
    EngineStopped,

    #[error("No failed operation to retry")]
    NothingToRetry,

    /// The profile store refused or failed to persist synced profiles
    #[error("Profile store rejected the update: {0}")]
    Store(#[source] Box<PersonaError>),
}

impl SyncError {
    /// Wrap an I/O error with the path it happened on
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Validation failure on one profile
    pub fn invalid_profile(
        index: usize,
        field: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        Self::Validation {
            index: Some(index),
            field: field.into(),
            reason: reason.into(),
        }
    }

    pub fn store(source: PersonaError) -> Self {
        Self::Store(Box::new(source))
    }

    /// Document-level validation failure not tied to one profile
    pub fn invalid_document(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Validation {
            index: None,
            field: field.into(),
            reason: reason.into(),
        }
    }
}

fn location(index: &Option<usize>, field: &str) -> String {
    match index {
        Some(index) => format!("profile[{}].{}", index, field),
        None => field.to_string(),
    }
}

impl PersonaError {
    /// Add context to an error
    pub fn context(self, context: impl Into<String>) -> Self {
        Self::WithContext {
            context: context.into(),
            source: Box::new(self),
        }
    }

    /// True when the root cause is a missing profile
    pub fn is_not_found(&self) -> bool {
        match self {
            Self::Profile(ProfileError::NotFound(_)) => true,
            Self::WithContext { source, .. } => source.is_not_found(),
            _ => false,
        }
    }
}

/// Extension trait for adding context to Results
pub trait ResultExt<T> {
    /// Add context to a Result
    fn context(self, context: impl Into<String>) -> Result<T>;

    /// Add lazy context to a Result
    fn with_context<F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> String;
}

impl<T, E> ResultExt<T> for std::result::Result<T, E>
where
    E: Into<PersonaError>,
{
    fn context(self, context: impl Into<String>) -> Result<T> {
        self.map_err(|e| e.into().context(context))
    }

    fn with_context<F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> String,
    {
        self.map_err(|e| e.into().context(f()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_context() {
        let err = PersonaError::from(ProfileError::NotFound("ghost".into()));
        let err = err.context("Failed to activate profile");

        assert!(err.to_string().contains("Failed to activate profile"));
        assert!(err.to_string().contains("ghost"));
        assert!(err.is_not_found());
    }

    #[test]
    fn test_result_ext() {
        let result: std::result::Result<(), SyncError> = Err(SyncError::Format("number".into()));
        let result = result.context("Import failed");

        assert!(result.is_err());
        let message = result.unwrap_err().to_string();
        assert!(message.contains("Import failed"));
        assert!(message.contains("Unrecognized sync document format"));
    }

    #[test]
    fn test_validation_message_names_field() {
        let err = SyncError::invalid_profile(2, "tone", "missing");
        assert_eq!(
            err.to_string(),
            "Invalid sync document: profile[2].tone: missing"
        );

        let err = SyncError::invalid_document("activeProfileId", "must be a string or null");
        assert_eq!(
            err.to_string(),
            "Invalid sync document: activeProfileId: must be a string or null"
        );
    }
}
