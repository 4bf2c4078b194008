//! Storage layer for safeguard.
//!
//! This module provides `SQLite`-based persistent storage for emergency
//! contacts and the history of finished sessions.

pub mod migrations;
pub mod schema;

use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};
use tracing::{debug, info};

use crate::contact::{ContactId, EmergencyContact, NewContact};
use crate::directory::ContactRepository;
use crate::error::{Error, Result};
use crate::location::LocationSample;
use crate::session::{Resolution, SessionId, SessionRecord, SessionRepository};

/// Statistics about the storage database.
#[derive(Debug, Clone)]
pub struct StorageStats {
    /// Number of stored contacts.
    pub contacts: i64,
    /// Number of trusted contacts.
    pub trusted_contacts: i64,
    /// Number of recorded sessions.
    pub sessions: i64,
    /// Database file size in bytes (0 for in-memory).
    pub db_size_bytes: u64,
}

/// Device storage for contacts and session history.
///
/// Implements [`ContactRepository`] and [`SessionRepository`] on one
/// `SQLite` connection.
#[derive(Debug)]
pub struct Storage {
    /// Path to the database file.
    path: PathBuf,
    /// Database connection.
    conn: Mutex<Connection>,
}

impl Storage {
    /// Open or create a storage database at the given path.
    ///
    /// Creates the parent directories and database file if they don't exist.
    /// Initializes the schema if this is a new database.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be opened or schema initialization fails.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent).map_err(|source| Error::DirectoryCreate {
                    path: parent.to_path_buf(),
                    source,
                })?;
            }
        }

        debug!("Opening database at {}", path.display());
        let conn = Connection::open(&path).map_err(|source| Error::DatabaseOpen {
            path: path.clone(),
            source,
        })?;

        // WAL keeps readers from blocking the writer
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;

        migrations::initialize_schema(&conn)?;

        info!("Database opened successfully at {}", path.display());
        Ok(Self {
            path,
            conn: Mutex::new(conn),
        })
    }

    /// Create an in-memory storage instance for testing.
    ///
    /// # Errors
    ///
    /// Returns an error if the in-memory database cannot be created.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(|source| Error::DatabaseOpen {
            path: PathBuf::from(":memory:"),
            source,
        })?;

        migrations::initialize_schema(&conn)?;

        Ok(Self {
            path: PathBuf::from(":memory:"),
            conn: Mutex::new(conn),
        })
    }

    /// Get the path to the database file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| Error::internal("database connection lock poisoned"))
    }

    /// Get database statistics.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    pub fn stats(&self) -> Result<StorageStats> {
        let conn = self.conn()?;
        let contacts: i64 = conn.query_row("SELECT COUNT(*) FROM contacts", [], |row| row.get(0))?;
        let trusted_contacts: i64 = conn.query_row(
            "SELECT COUNT(*) FROM contacts WHERE is_trusted = 1",
            [],
            |row| row.get(0),
        )?;
        let sessions: i64 = conn.query_row("SELECT COUNT(*) FROM sessions", [], |row| row.get(0))?;

        let db_size_bytes = if self.path.to_string_lossy() == ":memory:" {
            0
        } else {
            std::fs::metadata(&self.path).map(|m| m.len()).unwrap_or(0)
        };

        Ok(StorageStats {
            contacts,
            trusted_contacts,
            sessions,
            db_size_bytes,
        })
    }

    /// Convert a database row to an `EmergencyContact`.
    fn row_to_contact(row: &rusqlite::Row) -> rusqlite::Result<EmergencyContact> {
        Ok(EmergencyContact {
            id: ContactId(row.get(0)?),
            name: row.get(1)?,
            phone_number: row.get(2)?,
            relationship: row.get(3)?,
            is_trusted: row.get(4)?,
            is_primary: row.get(5)?,
            created_at: parse_timestamp(&row.get::<_, String>(6)?),
            updated_at: parse_timestamp(&row.get::<_, String>(7)?),
        })
    }

    fn update_contact(conn: &Connection, contact: &EmergencyContact) -> Result<()> {
        let affected = conn.execute(
            r"
            UPDATE contacts
            SET name = ?2, phone_number = ?3, relationship = ?4,
                is_trusted = ?5, is_primary = ?6, updated_at = ?7
            WHERE id = ?1
            ",
            params![
                contact.id.0,
                contact.name,
                contact.phone_number,
                contact.relationship,
                contact.is_trusted,
                contact.is_primary,
                contact.updated_at.to_rfc3339(),
            ],
        )?;
        if affected == 0 {
            return Err(Error::ContactNotFound(contact.id));
        }
        Ok(())
    }
}

impl ContactRepository for Storage {
    fn load_all(&self) -> Result<Vec<EmergencyContact>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            r"
            SELECT id, name, phone_number, relationship, is_trusted, is_primary,
                   created_at, updated_at
            FROM contacts ORDER BY id
            ",
        )?;
        let contacts = stmt
            .query_map([], Self::row_to_contact)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(contacts)
    }

    fn insert(&self, draft: &NewContact) -> Result<EmergencyContact> {
        let conn = self.conn()?;
        let mut contact = EmergencyContact::from_draft(ContactId(0), draft);
        conn.execute(
            r"
            INSERT INTO contacts
                (name, phone_number, relationship, is_trusted, is_primary, created_at, updated_at)
            VALUES (?1, ?2, ?3, ?4, 0, ?5, ?6)
            ",
            params![
                contact.name,
                contact.phone_number,
                contact.relationship,
                contact.is_trusted,
                contact.created_at.to_rfc3339(),
                contact.updated_at.to_rfc3339(),
            ],
        )?;
        contact.id = ContactId(conn.last_insert_rowid());
        debug!("Inserted contact with id {}", contact.id);
        Ok(contact)
    }

    fn save(&self, contact: &EmergencyContact) -> Result<()> {
        let conn = self.conn()?;
        Self::update_contact(&conn, contact)
    }

    fn save_many(&self, contacts: &[EmergencyContact]) -> Result<()> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        for contact in contacts {
            Self::update_contact(&tx, contact)?;
        }
        tx.commit()?;
        Ok(())
    }

    fn remove(&self, id: ContactId) -> Result<bool> {
        let affected = self
            .conn()?
            .execute("DELETE FROM contacts WHERE id = ?1", [id.0])?;
        Ok(affected > 0)
    }
}

impl SessionRepository for Storage {
    fn save(&self, record: &SessionRecord) -> Result<()> {
        let notified = serde_json::to_string(&record.notified_contact_ids)?;
        let acknowledged = serde_json::to_string(&record.acknowledged_contact_ids)?;
        let location = record.last_location.as_ref();

        self.conn()?.execute(
            r"
            INSERT OR REPLACE INTO sessions
                (id, activated_at, resolved_at, resolution, siren_used,
                 notified_contact_ids, acknowledged_contact_ids,
                 latitude, longitude, location_captured_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
            ",
            params![
                record.id.0,
                record.activated_at.to_rfc3339(),
                record.resolved_at.to_rfc3339(),
                record.resolution.as_str(),
                record.siren_used,
                notified,
                acknowledged,
                location.map(|l| l.latitude),
                location.map(|l| l.longitude),
                location.map(|l| l.captured_at.to_rfc3339()),
            ],
        )?;
        debug!("Recorded session {}", record.id);
        Ok(())
    }

    fn load_recent(&self, limit: usize) -> Result<Vec<SessionRecord>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            r"
            SELECT id, activated_at, resolved_at, resolution, siren_used,
                   notified_contact_ids, acknowledged_contact_ids,
                   latitude, longitude, location_captured_at
            FROM sessions ORDER BY activated_at DESC, id DESC LIMIT ?1
            ",
        )?;

        let limit_i64 = i64::try_from(limit).unwrap_or(i64::MAX);
        let rows = stmt
            .query_map([limit_i64], |row| {
                Ok(SessionRow {
                    id: row.get(0)?,
                    activated_at: row.get(1)?,
                    resolved_at: row.get(2)?,
                    resolution: row.get(3)?,
                    siren_used: row.get(4)?,
                    notified: row.get(5)?,
                    acknowledged: row.get(6)?,
                    latitude: row.get(7)?,
                    longitude: row.get(8)?,
                    location_captured_at: row.get(9)?,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        rows.into_iter().map(SessionRow::into_record).collect()
    }
}

/// Raw `sessions` row before JSON and enum decoding.
struct SessionRow {
    id: i64,
    activated_at: String,
    resolved_at: String,
    resolution: String,
    siren_used: bool,
    notified: String,
    acknowledged: String,
    latitude: Option<f64>,
    longitude: Option<f64>,
    location_captured_at: Option<String>,
}

impl SessionRow {
    fn into_record(self) -> Result<SessionRecord> {
        let last_location = match (self.latitude, self.longitude) {
            (Some(latitude), Some(longitude)) => Some(LocationSample::new(
                latitude,
                longitude,
                self.location_captured_at
                    .as_deref()
                    .map_or_else(Utc::now, parse_timestamp),
            )),
            _ => None,
        };
        Ok(SessionRecord {
            id: SessionId(self.id),
            activated_at: parse_timestamp(&self.activated_at),
            resolved_at: parse_timestamp(&self.resolved_at),
            resolution: Resolution::parse(&self.resolution)?,
            siren_used: self.siren_used,
            notified_contact_ids: serde_json::from_str(&self.notified)?,
            acknowledged_contact_ids: serde_json::from_str(&self.acknowledged)?,
            last_location,
        })
    }
}

fn parse_timestamp(value: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(value).map_or_else(|_| Utc::now(), |dt| dt.with_timezone(&Utc))
}
