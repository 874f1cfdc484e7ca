//! SQLite schema versions.
//!
//! `MIGRATIONS[n]` takes the schema from version `n` to `n + 1`. Applied
//! versions are recorded in `schema_migrations`; a database written by a
//! newer build is refused rather than guessed at.

use rusqlite::{params, Connection};

use crate::error::{Result, StoreError};

/// Schema steps, oldest first.
const MIGRATIONS: &[&str] = &[
    // v1: headers, session counts, transactions and signature checkpoints
    r#"
    CREATE TABLE covalues (
        id TEXT PRIMARY KEY,              -- hash of the header
        header TEXT NOT NULL,             -- header as JSON
        stored_at INTEGER NOT NULL
    );

    CREATE TABLE sessions (
        covalue_id TEXT NOT NULL REFERENCES covalues(id),
        session_id TEXT NOT NULL,
        tx_count INTEGER NOT NULL DEFAULT 0,
        PRIMARY KEY (covalue_id, session_id)
    );

    -- contiguous per session from index 0
    CREATE TABLE transactions (
        covalue_id TEXT NOT NULL,
        session_id TEXT NOT NULL,
        idx INTEGER NOT NULL,
        tx TEXT NOT NULL,                 -- transaction as JSON
        PRIMARY KEY (covalue_id, session_id, idx)
    );

    -- signature over the running hash after the transaction at idx
    CREATE TABLE signature_after (
        covalue_id TEXT NOT NULL,
        session_id TEXT NOT NULL,
        idx INTEGER NOT NULL,
        signature TEXT NOT NULL,
        PRIMARY KEY (covalue_id, session_id, idx)
    );

    CREATE INDEX idx_sessions_covalue ON sessions(covalue_id);
    "#,
];

/// Schema version this build writes.
pub const CURRENT_VERSION: u32 = MIGRATIONS.len() as u32;

/// Bring the schema up to [`CURRENT_VERSION`]. Safe to call on every open.
pub fn migrate(conn: &mut Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_migrations (
            version INTEGER PRIMARY KEY,
            applied_at INTEGER NOT NULL
        )",
    )?;

    let applied: u32 = conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM schema_migrations",
        [],
        |row| row.get(0),
    )?;
    if applied > CURRENT_VERSION {
        return Err(StoreError::Migration(format!(
            "schema version {} is newer than supported version {}",
            applied, CURRENT_VERSION
        )));
    }

    let tx = conn.transaction()?;
    for (step, sql) in MIGRATIONS.iter().enumerate().skip(applied as usize) {
        tx.execute_batch(sql)?;
        tx.execute(
            "INSERT INTO schema_migrations (version, applied_at) VALUES (?1, ?2)",
            params![step as u32 + 1, crate::now_millis()],
        )?;
        tracing::debug!(version = step + 1, "applied schema migration");
    }
    tx.commit()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_migration_creates_tables() {
        let mut conn = Connection::open_in_memory().unwrap();
        migrate(&mut conn).unwrap();

        let tables: Vec<String> = conn
            .prepare("SELECT name FROM sqlite_master WHERE type='table' ORDER BY name")
            .unwrap()
            .query_map([], |row| row.get(0))
            .unwrap()
            .collect::<std::result::Result<Vec<_>, _>>()
            .unwrap();

        for table in ["covalues", "sessions", "transactions", "signature_after", "schema_migrations"] {
            assert!(tables.contains(&table.to_string()), "missing {}", table);
        }
    }

    #[test]
    fn test_migration_idempotent() {
        let mut conn = Connection::open_in_memory().unwrap();
        migrate(&mut conn).unwrap();
        migrate(&mut conn).unwrap();
        migrate(&mut conn).unwrap();

        let version: u32 = conn
            .query_row("SELECT MAX(version) FROM schema_migrations", [], |row| {
                row.get(0)
            })
            .unwrap();
        assert_eq!(version, CURRENT_VERSION);
    }

    #[test]
    fn test_newer_schema_refused() {
        let mut conn = Connection::open_in_memory().unwrap();
        migrate(&mut conn).unwrap();
        conn.execute(
            "INSERT INTO schema_migrations (version, applied_at) VALUES (?1, 0)",
            [CURRENT_VERSION + 1],
        )
        .unwrap();
        assert!(matches!(migrate(&mut conn), Err(StoreError::Migration(_))));
    }
}
