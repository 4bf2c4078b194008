//! `SQLite` schema definitions for safeguard.
//!
//! This module contains the SQL statements for creating and managing
//! the database schema.

/// SQL statement to create the contacts table.
pub const CREATE_CONTACTS_TABLE: &str = r"
CREATE TABLE IF NOT EXISTS contacts (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL,
    phone_number TEXT NOT NULL,
    relationship TEXT NOT NULL DEFAULT '',
    is_trusted INTEGER NOT NULL DEFAULT 0,
    is_primary INTEGER NOT NULL DEFAULT 0,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
)
";

/// At most one row may hold the primary designation.
pub const CREATE_PRIMARY_INDEX: &str = r"
CREATE UNIQUE INDEX IF NOT EXISTS idx_contacts_single_primary
ON contacts(is_primary) WHERE is_primary = 1
";

/// SQL statement to create the finished-sessions table.
pub const CREATE_SESSIONS_TABLE: &str = r"
CREATE TABLE IF NOT EXISTS sessions (
    id INTEGER PRIMARY KEY,
    activated_at TEXT NOT NULL,
    resolved_at TEXT NOT NULL,
    resolution TEXT NOT NULL,
    siren_used INTEGER NOT NULL DEFAULT 0,
    notified_contact_ids TEXT NOT NULL DEFAULT '[]',
    acknowledged_contact_ids TEXT NOT NULL DEFAULT '[]',
    latitude REAL,
    longitude REAL,
    location_captured_at TEXT
)
";

/// SQL statement to create an index on activation time for history queries.
pub const CREATE_SESSIONS_ACTIVATED_INDEX: &str = r"
CREATE INDEX IF NOT EXISTS idx_sessions_activated ON sessions(activated_at DESC)
";

/// SQL statement to create the metadata table for storing key-value pairs.
pub const CREATE_METADATA_TABLE: &str = r"
CREATE TABLE IF NOT EXISTS metadata (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL
)
";

/// All schema creation statements in order.
pub const SCHEMA_STATEMENTS: &[&str] = &[
    CREATE_CONTACTS_TABLE,
    CREATE_PRIMARY_INDEX,
    CREATE_SESSIONS_TABLE,
    CREATE_SESSIONS_ACTIVATED_INDEX,
    CREATE_METADATA_TABLE,
];
