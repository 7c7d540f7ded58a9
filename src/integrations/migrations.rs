/// Database migration management
///
/// This module creates and updates the SQLite schema of the integration
/// catalog. The schema version is tracked in its own table.

use rusqlite::Connection;

use crate::integrations::RepositoryError;

/// Current database schema version
///
/// Increment this when you add new migrations
pub const CURRENT_VERSION: i32 = 1;

/// Initialize the database schema
///
/// This creates all required tables and indexes if they don't exist and
/// records the schema version.
pub fn initialize_database(conn: &Connection) -> Result<(), RepositoryError> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY
        )",
        [],
    )?;

    let current_version = get_current_version(conn)?;
    if current_version > CURRENT_VERSION {
        return Err(RepositoryError::Migration(format!(
            "database schema version {} is newer than supported version {}",
            current_version, CURRENT_VERSION
        )));
    }

    if current_version < CURRENT_VERSION {
        run_migrations(conn, current_version)?;
        set_version(conn, CURRENT_VERSION)?;
    }

    Ok(())
}

/// Get the current database schema version, 0 for a fresh database
pub fn get_current_version(conn: &Connection) -> Result<i32, RepositoryError> {
    let version = conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM schema_version",
        [],
        |row| row.get::<_, i32>(0),
    )?;

    Ok(version)
}

fn set_version(conn: &Connection, version: i32) -> Result<(), RepositoryError> {
    conn.execute("DELETE FROM schema_version", [])?;
    conn.execute("INSERT INTO schema_version (version) VALUES (?1)", [version])?;
    Ok(())
}

fn run_migrations(conn: &Connection, from_version: i32) -> Result<(), RepositoryError> {
    if from_version < 1 {
        migration_v1(conn)?;
    }

    Ok(())
}

/// Migration to version 1: the integrations table
fn migration_v1(conn: &Connection) -> Result<(), RepositoryError> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS integrations (
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL UNIQUE,
            version TEXT NOT NULL,
            manifest TEXT NOT NULL,
            env TEXT NOT NULL DEFAULT '{}',
            installed_at TEXT NOT NULL
        )",
        [],
    )?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_integrations_installed_at
         ON integrations (installed_at)",
        [],
    )?;

    tracing::info!("Applied migration v1: created integrations table");
    Ok(())
}
