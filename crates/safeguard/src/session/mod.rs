//! Emergency session lifecycle.
//!
//! [`SessionMachine`] holds the pure state transitions and is driven with
//! explicit timestamps. [`EmergencyService`] wraps it with the tracker, the
//! dispatcher and the contact directory, serializing every mutation through
//! one lock.

pub mod countdown;
pub mod history;
pub mod machine;
pub mod service;

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::contact::ContactId;
use crate::error::Error;
use crate::location::LocationSample;

pub use countdown::run_countdown;
pub use history::{InMemorySessionRepository, Resolution, SessionRecord, SessionRepository};
pub use machine::{Activation, SessionMachine};
pub use service::{EmergencyService, DEFAULT_SENDER_NAME};

/// Length of the auto-cancel countdown shown after activation.
pub const DEFAULT_AUTO_CANCEL_WINDOW: Duration = Duration::from_secs(30);

/// Period of the countdown producer.
pub const DEFAULT_COUNTDOWN_TICK: Duration = Duration::from_secs(1);

/// Identifier of one activation-to-resolution lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(pub i64);

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Where the session is in its lifecycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    /// No emergency in progress.
    #[default]
    Idle,
    /// SOS raised; tracking and notification running.
    Active,
    /// Teardown in progress; new triggers are ignored.
    Resolving,
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::Active => write!(f, "active"),
            Self::Resolving => write!(f, "resolving"),
        }
    }
}

/// Why the session has no location fix, shown as a persistent banner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LocationAdvisory {
    /// The user refused location access.
    PermissionDenied,
    /// The host has no usable location service.
    TrackerUnavailable,
    /// The platform did not answer the permission request in time.
    TimedOut,
}

impl LocationAdvisory {
    /// Classify a tracker start failure.
    #[must_use]
    pub fn from_error(error: &Error) -> Self {
        match error {
            Error::PermissionDenied => Self::PermissionDenied,
            Error::Timeout { .. } => Self::TimedOut,
            _ => Self::TrackerUnavailable,
        }
    }
}

impl fmt::Display for LocationAdvisory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::PermissionDenied => write!(f, "location permission denied"),
            Self::TrackerUnavailable => write!(f, "location unavailable"),
            Self::TimedOut => write!(f, "location request timed out"),
        }
    }
}

/// The live emergency session. Exactly one exists per user.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EmergencySession {
    /// Identifier of the current activation (`None` while idle).
    pub id: Option<SessionId>,
    /// Lifecycle status.
    pub status: SessionStatus,
    /// When the session became active.
    pub activated_at: Option<DateTime<Utc>>,
    /// End of the auto-cancel countdown.
    pub auto_cancel_deadline: Option<DateTime<Utc>>,
    /// Whether the siren is sounding.
    pub siren_enabled: bool,
    /// Whether the siren was on at any point of the session.
    pub siren_used: bool,
    /// Trusted contacts that received the alert.
    pub notified_contact_ids: BTreeSet<ContactId>,
    /// Trusted contacts that could not be reached, with the last reason.
    pub failed_contact_ids: BTreeMap<ContactId, String>,
    /// Notified contacts that acknowledged the alert.
    pub acknowledged_contact_ids: BTreeSet<ContactId>,
    /// Contacts alerted in this session that were later untrusted or deleted.
    pub revoked_contact_ids: BTreeSet<ContactId>,
    /// Latest position fix.
    pub current_location: Option<LocationSample>,
    /// Why there is no position fix, if known.
    pub location_advisory: Option<LocationAdvisory>,
    /// Whether the countdown has run out (advisory only).
    pub countdown_expired: bool,
}

/// Progress of the auto-cancel countdown.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Countdown {
    /// When the countdown ends.
    pub deadline: DateTime<Utc>,
    /// Milliseconds left, zero once expired.
    pub remaining_ms: u64,
    /// Whether the deadline has passed.
    pub expired: bool,
}

impl Countdown {
    /// Countdown state at `now` for the given deadline.
    #[must_use]
    pub fn at(deadline: DateTime<Utc>, now: DateTime<Utc>) -> Self {
        let remaining_ms = (deadline - now)
            .num_milliseconds()
            .max(0)
            .try_into()
            .unwrap_or(0);
        Self {
            deadline,
            remaining_ms,
            expired: now >= deadline,
        }
    }

    /// Whole seconds left, rounded up, for display.
    #[must_use]
    pub fn remaining_secs(&self) -> u64 {
        self.remaining_ms.div_ceil(1000)
    }
}

/// Read-only view handed to the presentation layer.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionSnapshot {
    /// Identifier of the current activation.
    pub session_id: Option<SessionId>,
    /// Lifecycle status.
    pub status: SessionStatus,
    /// When the session became active.
    pub activated_at: Option<DateTime<Utc>>,
    /// Whether the siren is sounding.
    pub siren_enabled: bool,
    /// Auto-cancel countdown, while active.
    pub countdown: Option<Countdown>,
    /// Contacts that received the alert.
    pub notified_contact_ids: Vec<ContactId>,
    /// Contacts that could not be reached.
    pub failed_contact_ids: Vec<ContactId>,
    /// Contacts that acknowledged the alert.
    pub acknowledged_contact_ids: Vec<ContactId>,
    /// Latest position fix.
    pub current_location: Option<LocationSample>,
    /// Why there is no position fix.
    pub location_advisory: Option<LocationAdvisory>,
}

impl SessionSnapshot {
    /// Whether an emergency is in progress.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.status == SessionStatus::Active
    }
}
