//! Emergency contact types.
//!
//! A contact is someone the user may reach in an emergency. Only contacts
//! flagged as trusted are eligible for SOS notifications, and at most one
//! contact holds the primary designation at a time.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Stable identifier of an emergency contact (assigned by the repository).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContactId(pub i64);

impl fmt::Display for ContactId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A stored emergency contact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmergencyContact {
    /// Unique identifier.
    pub id: ContactId,

    /// Display name (never empty).
    pub name: String,

    /// Phone number as entered; not validated for format here.
    pub phone_number: String,

    /// Free-text relationship tag ("sister", "neighbour", ...).
    pub relationship: String,

    /// Whether the contact is eligible for SOS notifications.
    pub is_trusted: bool,

    /// Whether this is the first point of contact.
    pub is_primary: bool,

    /// When the contact was created.
    pub created_at: DateTime<Utc>,

    /// When the contact was last modified.
    pub updated_at: DateTime<Utc>,
}

impl EmergencyContact {
    /// Build a contact from a validated draft and an assigned id.
    ///
    /// The primary flag is not taken from the draft; the directory assigns it.
    #[must_use]
    pub fn from_draft(id: ContactId, draft: &NewContact) -> Self {
        let now = Utc::now();
        Self {
            id,
            name: draft.name.trim().to_string(),
            phone_number: draft.phone_number.trim().to_string(),
            relationship: draft.relationship.trim().to_string(),
            is_trusted: draft.is_trusted,
            is_primary: false,
            created_at: now,
            updated_at: now,
        }
    }

    /// Apply a partial update, validating the result.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ContactValidation`] if the update would leave the
    /// contact without a name.
    pub fn apply(&mut self, update: &ContactUpdate) -> Result<()> {
        if let Some(name) = &update.name {
            validate_name(name)?;
            self.name = name.trim().to_string();
        }
        if let Some(phone) = &update.phone_number {
            self.phone_number = phone.trim().to_string();
        }
        if let Some(relationship) = &update.relationship {
            self.relationship = relationship.trim().to_string();
        }
        if let Some(trusted) = update.is_trusted {
            self.is_trusted = trusted;
        }
        self.updated_at = Utc::now();
        Ok(())
    }
}

/// A contact that has not been stored yet.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewContact {
    /// Display name.
    pub name: String,
    /// Phone number.
    pub phone_number: String,
    /// Relationship tag.
    #[serde(default)]
    pub relationship: String,
    /// Eligible for SOS notifications.
    #[serde(default)]
    pub is_trusted: bool,
}

impl NewContact {
    /// Create a draft with the given name and number.
    #[must_use]
    pub fn new(name: impl Into<String>, phone_number: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            phone_number: phone_number.into(),
            relationship: String::new(),
            is_trusted: false,
        }
    }

    /// Set the relationship tag.
    #[must_use]
    pub fn relationship(mut self, relationship: impl Into<String>) -> Self {
        self.relationship = relationship.into();
        self
    }

    /// Mark the contact as trusted.
    #[must_use]
    pub fn trusted(mut self, trusted: bool) -> Self {
        self.is_trusted = trusted;
        self
    }

    /// Validate the draft.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ContactValidation`] if the name is blank.
    pub fn validate(&self) -> Result<()> {
        validate_name(&self.name)
    }
}

/// A partial edit of an existing contact. `None` fields are left unchanged.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContactUpdate {
    /// New display name.
    pub name: Option<String>,
    /// New phone number.
    pub phone_number: Option<String>,
    /// New relationship tag.
    pub relationship: Option<String>,
    /// New trusted flag.
    pub is_trusted: Option<bool>,
}

fn validate_name(name: &str) -> Result<()> {
    if name.trim().is_empty() {
        return Err(Error::contact_validation("name must not be empty"));
    }
    Ok(())
}
