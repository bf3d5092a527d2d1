// src/settings.rs

//! Durable key-value settings store for Airlift
//!
//! This module handles all SQLite operations for the crate's small durable
//! records:
//! - Database initialization and schema migration
//! - String get/set/remove by key
//! - JSON-typed accessors used by the install state machine and the
//!   telemetry reporter
//!
//! Each record is written inside an implicit SQLite transaction, which gives
//! the crash-atomicity the durable-state model requires.

use crate::error::Result;
use rusqlite::{Connection, OptionalExtension};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::path::Path;
use tracing::{debug, info, warn};

/// Current schema version
pub const SCHEMA_VERSION: i32 = 1;

/// Handle to the settings database.
pub struct Settings {
    conn: Connection,
}

impl Settings {
    /// Open (creating and migrating if necessary) the settings database at
    /// the specified path. Idempotent: opening an existing database is safe.
    pub fn open(db_path: &Path) -> Result<Self> {
        debug!("Opening settings database at: {}", db_path.display());

        // Create parent directories if they don't exist
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(db_path)?;

        // Set pragmas for better performance and reliability
        conn.execute_batch(
            "
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;
            PRAGMA foreign_keys = ON;
            PRAGMA busy_timeout = 5000;
            ",
        )?;

        migrate(&conn)?;

        Ok(Self { conn })
    }

    /// Open an in-memory settings database; used by tests.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        migrate(&conn)?;
        Ok(Self { conn })
    }

    /// Read a string value, `None` if the key is absent.
    pub fn get(&self, key: &str) -> Result<Option<String>> {
        let value = self
            .conn
            .query_row("SELECT value FROM settings WHERE key = ?1", [key], |row| {
                row.get(0)
            })
            .optional()?;

        Ok(value)
    }

    /// Write a string value, replacing any existing one.
    pub fn set(&self, key: &str, value: &str) -> Result<()> {
        self.conn.execute(
            "INSERT INTO settings (key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET
                 value = excluded.value,
                 updated_at = CURRENT_TIMESTAMP",
            [key, value],
        )?;

        Ok(())
    }

    /// Delete a key; removing an absent key is not an error.
    pub fn remove(&self, key: &str) -> Result<()> {
        self.conn
            .execute("DELETE FROM settings WHERE key = ?1", [key])?;

        Ok(())
    }

    /// Read and deserialize a JSON value stored under `key`.
    ///
    /// A present-but-unparsable value is treated as absent after a warning;
    /// these records are advisory state, and a corrupt one must degrade to
    /// "no record," never to a hard failure.
    pub fn get_json<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        match self.get(key)? {
            Some(raw) => match serde_json::from_str(&raw) {
                Ok(value) => Ok(Some(value)),
                Err(e) => {
                    warn!("Discarding malformed settings record {}: {}", key, e);
                    Ok(None)
                }
            },
            None => Ok(None),
        }
    }

    /// Serialize `value` to JSON and store it under `key`.
    pub fn set_json<T: Serialize>(&self, key: &str, value: &T) -> Result<()> {
        let raw = serde_json::to_string(value).map_err(|e| crate::error::Error::MalformedData {
            path: key.to_string(),
            reason: e.to_string(),
        })?;
        self.set(key, &raw)
    }
}

/// Get the current schema version from the database
fn get_schema_version(conn: &Connection) -> Result<i32> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            applied_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
        )",
        [],
    )?;

    let version = conn
        .query_row(
            "SELECT version FROM schema_version ORDER BY version DESC LIMIT 1",
            [],
            |row| row.get(0),
        )
        .unwrap_or(0);

    Ok(version)
}

/// Apply all pending migrations to bring the database up to date
fn migrate(conn: &Connection) -> Result<()> {
    let current_version = get_schema_version(conn)?;

    if current_version >= SCHEMA_VERSION {
        debug!("Settings schema is up to date");
        return Ok(());
    }

    for version in (current_version + 1)..=SCHEMA_VERSION {
        info!("Applying settings migration to version {}", version);
        apply_migration(conn, version)?;
        conn.execute(
            "INSERT INTO schema_version (version) VALUES (?1)",
            [version],
        )?;
    }

    Ok(())
}

fn apply_migration(conn: &Connection, version: i32) -> Result<()> {
    match version {
        1 => migrate_v1(conn),
        _ => panic!("Unknown settings migration version: {}", version),
    }
}

/// Initial schema - Version 1
///
/// One table of string keys to string values. The key space is partitioned
/// by owner: the install state machine writes `pending_update` and
/// `failed_updates`, the telemetry reporter writes `last_deployment_report`
/// and `retry_deployment_report`.
fn migrate_v1(conn: &Connection) -> Result<()> {
    debug!("Creating settings schema version 1");

    conn.execute_batch(
        "
        CREATE TABLE settings (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL,
            updated_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
        );
        ",
    )?;

    Ok(())
}
