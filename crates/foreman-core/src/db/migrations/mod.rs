//! Schema versioning for the graph database, keyed on `PRAGMA user_version`.
//!
//! A fresh file is at version 0. Each entry in `MIGRATIONS` runs in its own
//! transaction and bumps both `user_version` and `store_meta.schema_version`.
//! A file written by a newer build is refused rather than downgraded.

use super::schema;
use rusqlite::{Connection, types::Type};

/// Latest schema version understood by this build.
pub const LATEST_SCHEMA_VERSION: u32 = 1;

const MIGRATIONS: &[(u32, &str)] = &[(1, schema::MIGRATION_V1_SQL)];

/// The database was created by a build with a newer schema.
#[derive(Debug, thiserror::Error)]
#[error("graph database is at schema version {found}, this build supports up to {supported}")]
pub struct NewerSchema {
    pub found: u32,
    pub supported: u32,
}

fn conversion_error(error: impl std::error::Error + Send + Sync + 'static) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(0, Type::Integer, Box::new(error))
}

/// Read `PRAGMA user_version` as a `u32`.
///
/// # Errors
///
/// Returns an error if querying SQLite fails or the value is negative.
pub fn current_schema_version(conn: &Connection) -> rusqlite::Result<u32> {
    let version: i64 = conn.pragma_query_value(None, "user_version", |row| row.get(0))?;
    u32::try_from(version).map_err(conversion_error)
}

/// Bring the graph schema up to [`LATEST_SCHEMA_VERSION`] and return the
/// resulting version.
///
/// # Errors
///
/// Returns an error if a migration fails (earlier ones stay applied) or the
/// file carries a [`NewerSchema`].
pub fn migrate(conn: &mut Connection) -> rusqlite::Result<u32> {
    let mut current = current_schema_version(conn)?;
    if current > LATEST_SCHEMA_VERSION {
        return Err(conversion_error(NewerSchema {
            found: current,
            supported: LATEST_SCHEMA_VERSION,
        }));
    }

    for &(version, sql) in MIGRATIONS {
        if version <= current {
            continue;
        }
        let tx = conn.transaction()?;
        tx.execute_batch(sql)?;
        tx.pragma_update(None, "user_version", i64::from(version))?;
        tx.execute(
            "UPDATE store_meta SET schema_version = ?1 WHERE id = 1",
            [i64::from(version)],
        )?;
        tx.commit()?;
        current = version;
    }

    Ok(current)
}
