//! CLI command definitions.
//!
//! This module defines the structure of all CLI subcommands.

use std::path::PathBuf;

use clap::{Args, Subcommand};

use crate::contact::{ContactId, ContactUpdate, NewContact};

/// Contact management commands.
#[derive(Debug, Subcommand)]
pub enum ContactsCommand {
    /// List emergency contacts
    List {
        /// Output as JSON
        #[arg(short, long)]
        json: bool,
    },

    /// Add an emergency contact
    Add(AddContactArgs),

    /// Edit an emergency contact
    Update(UpdateContactArgs),

    /// Remove an emergency contact
    Remove {
        /// Contact id
        id: i64,
    },

    /// Make a contact the primary contact
    Primary {
        /// Contact id
        id: i64,
    },
}

/// Arguments for `contacts add`.
#[derive(Debug, Args)]
pub struct AddContactArgs {
    /// Display name
    pub name: String,

    /// Phone number
    pub phone: String,

    /// Relationship tag (e.g. "sister")
    #[arg(short, long, default_value = "")]
    pub relationship: String,

    /// Notify this contact in an emergency
    #[arg(short, long)]
    pub trusted: bool,

    /// Make this the primary contact
    #[arg(short, long)]
    pub primary: bool,
}

impl AddContactArgs {
    /// The contact draft described by these arguments.
    #[must_use]
    pub fn draft(&self) -> NewContact {
        NewContact::new(&self.name, &self.phone)
            .relationship(&self.relationship)
            .trusted(self.trusted)
    }
}

/// Arguments for `contacts update`.
#[derive(Debug, Args)]
pub struct UpdateContactArgs {
    /// Contact id
    pub id: i64,

    /// New display name
    #[arg(long)]
    pub name: Option<String>,

    /// New phone number
    #[arg(long)]
    pub phone: Option<String>,

    /// New relationship tag
    #[arg(long)]
    pub relationship: Option<String>,

    /// Set whether the contact is notified in an emergency
    #[arg(long)]
    pub trusted: Option<bool>,
}

impl UpdateContactArgs {
    /// The contact being edited.
    #[must_use]
    pub fn contact_id(&self) -> ContactId {
        ContactId(self.id)
    }

    /// The edit described by these arguments.
    #[must_use]
    pub fn update(&self) -> ContactUpdate {
        ContactUpdate {
            name: self.name.clone(),
            phone_number: self.phone.clone(),
            relationship: self.relationship.clone(),
            is_trusted: self.trusted,
        }
    }
}

/// Arguments for `sos`.
#[derive(Debug, Args)]
pub struct SosCommand {
    /// Resolve automatically after this many seconds (default: wait for Ctrl-C)
    #[arg(long = "for", value_name = "SECS")]
    pub duration_secs: Option<u64>,

    /// Turn the siren on right after activation
    #[arg(long)]
    pub siren: bool,

    /// Print snapshots as JSON lines
    #[arg(short, long)]
    pub json: bool,
}

/// Arguments for `history`.
#[derive(Debug, Args)]
pub struct HistoryCommand {
    /// Maximum number of sessions
    #[arg(short, long, default_value = "10")]
    pub limit: usize,

    /// Output as JSON
    #[arg(short, long)]
    pub json: bool,
}

/// Configuration commands.
#[derive(Debug, Subcommand)]
pub enum ConfigCommand {
    /// Show current configuration
    Show {
        /// Output as JSON
        #[arg(short, long)]
        json: bool,
    },

    /// Show the configuration file path
    Path,

    /// Validate configuration
    Validate {
        /// Path to configuration file to validate
        #[arg(short, long)]
        file: Option<PathBuf>,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_add_args_draft() {
        let args = AddContactArgs {
            name: "Ana".to_string(),
            phone: "+34 600".to_string(),
            relationship: "sister".to_string(),
            trusted: true,
            primary: false,
        };
        let draft = args.draft();
        assert_eq!(draft.name, "Ana");
        assert_eq!(draft.relationship, "sister");
        assert!(draft.is_trusted);
    }

    #[test]
    fn test_update_args_only_set_fields() {
        let args = UpdateContactArgs {
            id: 3,
            name: None,
            phone: Some("2".to_string()),
            relationship: None,
            trusted: Some(false),
        };
        assert_eq!(args.contact_id(), ContactId(3));
        assert_eq!(
            args.update(),
            ContactUpdate {
                phone_number: Some("2".to_string()),
                is_trusted: Some(false),
                ..ContactUpdate::default()
            }
        );
    }

    #[test]
    fn test_config_command_debug() {
        let cmd = ConfigCommand::Show { json: false };
        assert!(format!("{cmd:?}").contains("Show"));
    }
}
