//! Trusted-contact notification.
//!
//! The [`NotificationDispatcher`] fans an [`AlertMessage`] out to contacts
//! through a [`NotificationTransport`]. Each contact is attempted on its own,
//! and a contact is never notified twice for the same session.

pub mod dispatcher;
pub mod transport;

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::contact::EmergencyContact;
use crate::error::Result;
use crate::location::LocationSample;
use crate::session::SessionId;

pub use dispatcher::{DispatchOutcome, NotificationDispatcher};
pub use transport::{transport_from_config, HttpTransport, LogTransport};

/// Upper bound on a single per-contact dispatch.
pub const DEFAULT_DISPATCH_TIMEOUT: Duration = Duration::from_secs(3);

/// The alert sent to trusted contacts when an emergency starts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertMessage {
    /// Session the alert belongs to.
    pub session_id: SessionId,
    /// Who is asking for help.
    pub sender_name: String,
    /// Last known position when the alert was built.
    pub location: Option<LocationSample>,
    /// When the alert was built.
    pub created_at: DateTime<Utc>,
}

impl AlertMessage {
    /// Build an alert for a session.
    #[must_use]
    pub fn new(
        session_id: SessionId,
        sender_name: impl Into<String>,
        location: Option<LocationSample>,
    ) -> Self {
        Self {
            session_id,
            sender_name: sender_name.into(),
            location,
            created_at: Utc::now(),
        }
    }

    /// Render the text sent to `contact`.
    #[must_use]
    pub fn text_for(&self, contact: &EmergencyContact) -> String {
        let location = match &self.location {
            Some(sample) => format!("Last known location: {}", sample.maps_url()),
            None => "Location not available yet.".to_string(),
        };
        format!(
            "{}, this is an SOS alert. {} needs help. {}",
            contact.name, self.sender_name, location
        )
    }
}

/// Delivery channel for alerts (SMS gateway, push service, messaging backend).
#[async_trait::async_trait]
pub trait NotificationTransport: Send + Sync + fmt::Debug {
    /// Name of this transport (for logging).
    fn name(&self) -> &'static str;

    /// Deliver `message` to one contact.
    ///
    /// # Errors
    ///
    /// Returns an error if this contact could not be reached.
    async fn send(&self, contact: &EmergencyContact, message: &AlertMessage) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::contact::{ContactId, NewContact};

    #[test]
    fn test_text_with_location() {
        let contact = EmergencyContact::from_draft(ContactId(1), &NewContact::new("Ana", "1"));
        let message = AlertMessage::new(
            SessionId(9),
            "Bo",
            Some(LocationSample::now(1.0, 2.0)),
        );

        let text = message.text_for(&contact);
        assert!(text.starts_with("Ana,"));
        assert!(text.contains("Bo needs help"));
        assert!(text.contains("maps.google.com/?q=1.000000,2.000000"));
    }

    #[test]
    fn test_text_without_location() {
        let contact = EmergencyContact::from_draft(ContactId(1), &NewContact::new("Ana", "1"));
        let message = AlertMessage::new(SessionId(9), "Bo", None);

        assert!(message
            .text_for(&contact)
            .contains("Location not available yet."));
    }
}
