//! `safeguard` - Emergency activation core for a personal-safety app
//!
//! This library coordinates an SOS session: it tracks the device location,
//! alerts trusted emergency contacts and runs the auto-cancel countdown until
//! the user confirms they are safe.

#![warn(missing_docs)]
#![warn(missing_debug_implementations)]
#![deny(unsafe_code)]

pub mod cli;
pub mod config;
pub mod contact;
pub mod context;
pub mod directory;
pub mod error;
pub mod location;
pub mod logging;
pub mod notify;
pub mod session;
pub mod storage;

pub use config::Config;
pub use contact::{ContactId, ContactUpdate, EmergencyContact, NewContact};
pub use context::SafetyContext;
pub use directory::{ContactDirectory, ContactRepository, InMemoryContactRepository};
pub use error::{Error, Result};
pub use location::{LocationProvider, LocationSample, LocationTracker, PermissionStatus};
pub use logging::init_logging;
pub use notify::{AlertMessage, NotificationDispatcher, NotificationTransport};
pub use session::{
    EmergencyService, EmergencySession, LocationAdvisory, SessionId, SessionSnapshot,
    SessionStatus,
};
pub use storage::{Storage, StorageStats};
