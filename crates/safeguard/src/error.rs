//! Error types for safeguard.
//!
//! This module defines all error types used throughout the safeguard crate.
//! Collaborator failures (location, notification) are modelled here too, but
//! the session coordinator turns most of them into advisories rather than
//! propagating them to the caller.

use std::path::PathBuf;
use thiserror::Error;

use crate::contact::ContactId;
use crate::session::SessionStatus;

/// The main error type for safeguard operations.
#[derive(Error, Debug)]
pub enum Error {
    // === Storage Errors ===
    /// Failed to open or create the database.
    #[error("failed to open database at {path}: {source}")]
    DatabaseOpen {
        /// Path to the database file.
        path: PathBuf,
        /// The underlying error.
        #[source]
        source: rusqlite::Error,
    },

    /// A database query failed.
    #[error("database query failed: {0}")]
    DatabaseQuery(#[from] rusqlite::Error),

    /// Failed to run database migrations.
    #[error("database migration failed: {message}")]
    DatabaseMigration {
        /// Description of what went wrong.
        message: String,
    },

    // === Configuration Errors ===
    /// Failed to load configuration.
    #[error("failed to load configuration: {0}")]
    ConfigLoad(Box<figment::Error>),

    /// Configuration validation failed.
    #[error("invalid configuration: {message}")]
    ConfigValidation {
        /// Description of the validation failure.
        message: String,
    },

    // === Contact Errors ===
    /// No contact with the given id exists.
    #[error("contact {0} not found")]
    ContactNotFound(ContactId),

    /// A contact failed validation.
    #[error("invalid contact: {message}")]
    ContactValidation {
        /// Description of the validation failure.
        message: String,
    },

    // === Session Errors ===
    /// The operation is not valid in the session's current state.
    #[error("cannot {operation} while session is {status}")]
    InvalidStateTransition {
        /// The rejected operation.
        operation: &'static str,
        /// The status the session was in.
        status: SessionStatus,
    },

    // === Location Errors ===
    /// The user refused location access.
    #[error("location permission denied")]
    PermissionDenied,

    /// No location service is available on this host.
    #[error("location tracker unavailable: {reason}")]
    TrackerUnavailable {
        /// Why the tracker cannot be used.
        reason: String,
    },

    // === Notification Errors ===
    /// A single contact could not be notified.
    #[error("failed to notify contact {contact_id}: {reason}")]
    NotificationFailed {
        /// The contact that was not reached.
        contact_id: ContactId,
        /// Description of what went wrong.
        reason: String,
    },

    /// The messaging backend request failed.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    // === I/O Errors ===
    /// File system operation failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Failed to create a required directory.
    #[error("failed to create directory {path}: {source}")]
    DirectoryCreate {
        /// Path that couldn't be created.
        path: PathBuf,
        /// The underlying error.
        #[source]
        source: std::io::Error,
    },

    // === Serialization Errors ===
    /// JSON serialization/deserialization failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    // === Generic Errors ===
    /// An operation timed out.
    #[error("operation timed out: {operation}")]
    Timeout {
        /// Description of the operation that timed out.
        operation: String,
    },

    /// An internal error occurred (bug).
    #[error("internal error: {0}")]
    Internal(String),
}

/// A specialized Result type for safeguard operations.
pub type Result<T> = std::result::Result<T, Error>;

impl From<figment::Error> for Error {
    fn from(err: figment::Error) -> Self {
        Self::ConfigLoad(Box::new(err))
    }
}

impl Error {
    /// Create a new internal error.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }

    /// Create a tracker-unavailable error.
    #[must_use]
    pub fn tracker_unavailable(reason: impl Into<String>) -> Self {
        Self::TrackerUnavailable {
            reason: reason.into(),
        }
    }

    /// Create a per-contact notification failure.
    #[must_use]
    pub fn notification_failed(contact_id: ContactId, reason: impl Into<String>) -> Self {
        Self::NotificationFailed {
            contact_id,
            reason: reason.into(),
        }
    }

    /// Create a contact validation error.
    #[must_use]
    pub fn contact_validation(message: impl Into<String>) -> Self {
        Self::ContactValidation {
            message: message.into(),
        }
    }

    /// Create a timeout error for the named operation.
    #[must_use]
    pub fn timeout(operation: impl Into<String>) -> Self {
        Self::Timeout {
            operation: operation.into(),
        }
    }

    /// Create an invalid state transition error.
    #[must_use]
    pub fn invalid_transition(operation: &'static str, status: SessionStatus) -> Self {
        Self::InvalidStateTransition { operation, status }
    }

    /// Check if this error is a location permission refusal.
    #[must_use]
    pub fn is_permission_denied(&self) -> bool {
        matches!(self, Self::PermissionDenied)
    }

    /// Check if this error is a rejected state transition.
    #[must_use]
    pub fn is_invalid_transition(&self) -> bool {
        matches!(self, Self::InvalidStateTransition { .. })
    }
}
