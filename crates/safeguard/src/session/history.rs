//! Record of finished sessions.

use std::fmt;
use std::sync::{Mutex, PoisonError};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{EmergencySession, SessionId};
use crate::contact::ContactId;
use crate::error::{Error, Result};
use crate::location::LocationSample;

/// How a session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Resolution {
    /// The user confirmed they are safe.
    UserConfirmedSafe,
    /// The process shut down with the session still active.
    Shutdown,
}

impl Resolution {
    /// Stable string stored in the database.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::UserConfirmedSafe => "user_confirmed_safe",
            Self::Shutdown => "shutdown",
        }
    }

    /// Parse a stored resolution.
    ///
    /// # Errors
    ///
    /// Returns an error for an unknown value.
    pub fn parse(value: &str) -> Result<Self> {
        match value {
            "user_confirmed_safe" => Ok(Self::UserConfirmedSafe),
            "shutdown" => Ok(Self::Shutdown),
            other => Err(Error::internal(format!("unknown resolution '{other}'"))),
        }
    }
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One finished session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionRecord {
    /// Session identifier.
    pub id: SessionId,
    /// When the session became active.
    pub activated_at: DateTime<Utc>,
    /// When the session was resolved.
    pub resolved_at: DateTime<Utc>,
    /// How it ended.
    pub resolution: Resolution,
    /// Whether the siren was used.
    pub siren_used: bool,
    /// Contacts that received the alert.
    pub notified_contact_ids: Vec<ContactId>,
    /// Contacts that acknowledged it.
    pub acknowledged_contact_ids: Vec<ContactId>,
    /// Last known position, if location recording is enabled.
    pub last_location: Option<LocationSample>,
}

impl SessionRecord {
    /// Summarize an ended session. Returns `None` if it never activated.
    #[must_use]
    pub fn from_session(
        session: &EmergencySession,
        resolved_at: DateTime<Utc>,
        resolution: Resolution,
        keep_location: bool,
    ) -> Option<Self> {
        Some(Self {
            id: session.id?,
            activated_at: session.activated_at?,
            resolved_at,
            resolution,
            siren_used: session.siren_used,
            notified_contact_ids: session
                .notified_contact_ids
                .union(&session.revoked_contact_ids)
                .copied()
                .collect(),
            acknowledged_contact_ids: session.acknowledged_contact_ids.iter().copied().collect(),
            last_location: if keep_location {
                session.current_location
            } else {
                None
            },
        })
    }

    /// How long the session lasted.
    #[must_use]
    pub fn duration(&self) -> chrono::Duration {
        self.resolved_at - self.activated_at
    }
}

/// Storage for finished sessions.
pub trait SessionRepository: Send + Sync + fmt::Debug {
    /// Append a finished session.
    ///
    /// # Errors
    ///
    /// Returns an error if the record could not be written.
    fn save(&self, record: &SessionRecord) -> Result<()>;

    /// Most recent sessions first, at most `limit`.
    ///
    /// # Errors
    ///
    /// Returns an error if the records could not be read.
    fn load_recent(&self, limit: usize) -> Result<Vec<SessionRecord>>;
}

/// Session history kept in memory.
#[derive(Debug, Default)]
pub struct InMemorySessionRepository {
    records: Mutex<Vec<SessionRecord>>,
}

impl InMemorySessionRepository {
    /// Create an empty repository.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl SessionRepository for InMemorySessionRepository {
    fn save(&self, record: &SessionRecord) -> Result<()> {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(record.clone());
        Ok(())
    }

    fn load_recent(&self, limit: usize) -> Result<Vec<SessionRecord>> {
        let records = self.records.lock().unwrap_or_else(PoisonError::into_inner);
        let mut recent: Vec<_> = records.clone();
        recent.sort_by(|a, b| b.activated_at.cmp(&a.activated_at).then(b.id.cmp(&a.id)));
        recent.truncate(limit);
        Ok(recent)
    }
}
