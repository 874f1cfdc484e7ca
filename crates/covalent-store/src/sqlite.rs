//! SQLite implementation of the Store trait.
//!
//! This is the primary storage backend. It uses rusqlite with bundled
//! SQLite, wrapped in async via tokio::spawn_blocking.

use std::path::Path;
use std::str::FromStr;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use rusqlite::{params, Connection, OptionalExtension};

use covalent_core::{
    CoId, CoValueHeader, CoreError, KnownState, SessionId, SessionNewContent, Signature,
    Transaction,
};

use crate::error::{Result, StoreError};
use crate::migration;
use crate::traits::{new_suffix, AppendResult, Store, StoredBatch};

/// SQLite-based store implementation.
///
/// Thread-safe via internal Mutex. All operations use spawn_blocking
/// to avoid blocking the async runtime.
pub struct SqliteStore {
    /// The SQLite connection, protected by a mutex.
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    /// Open a SQLite database at the given path.
    ///
    /// Creates the file and runs migrations if it doesn't exist.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let mut conn = Connection::open(path)?;
        migration::migrate(&mut conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Open an in-memory SQLite database.
    ///
    /// Useful for testing.
    pub fn open_memory() -> Result<Self> {
        let mut conn = Connection::open_in_memory()?;
        migration::migrate(&mut conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Run `f` against the connection on the blocking pool.
    async fn blocking<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let mut conn = lock(&conn)?;
            f(&mut conn)
        })
        .await
        .map_err(|e| StoreError::Task(format!("spawn_blocking failed: {}", e)))?
    }
}

fn lock(conn: &Mutex<Connection>) -> Result<MutexGuard<'_, Connection>> {
    conn.lock().map_err(|e| {
        StoreError::Database(rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_LOCKED),
            Some(format!("mutex poisoned: {}", e)),
        ))
    })
}

fn parse<T: FromStr<Err = CoreError>>(s: &str) -> Result<T> {
    s.parse()
        .map_err(|e: CoreError| StoreError::InvalidData(e.to_string()))
}

fn load_header(conn: &Connection, id: &str) -> Result<Option<CoValueHeader>> {
    let json: Option<String> = conn
        .query_row(
            "SELECT header FROM covalues WHERE id = ?1",
            params![id],
            |row| row.get(0),
        )
        .optional()?;
    json.map(|j| serde_json::from_str(&j).map_err(StoreError::from))
        .transpose()
}

fn session_count(conn: &Connection, id: &str, session: &str) -> Result<u32> {
    let count: Option<u32> = conn
        .query_row(
            "SELECT tx_count FROM sessions WHERE covalue_id = ?1 AND session_id = ?2",
            params![id, session],
            |row| row.get(0),
        )
        .optional()?;
    Ok(count.unwrap_or(0))
}

#[async_trait]
impl Store for SqliteStore {
    // ─────────────────────────────────────────────────────────────────────────
    // CoValue Operations
    // ─────────────────────────────────────────────────────────────────────────

    async fn put_header(&self, id: &CoId, header: &CoValueHeader) -> Result<bool> {
        let id = id.to_string();
        let header = header.clone();

        self.blocking(move |conn| {
            if let Some(existing) = load_header(conn, &id)? {
                if existing != header {
                    return Err(StoreError::Conflict(id));
                }
                return Ok(false);
            }
            conn.execute(
                "INSERT INTO covalues (id, header, stored_at) VALUES (?1, ?2, ?3)",
                params![id, serde_json::to_string(&header)?, crate::now_millis()],
            )?;
            Ok(true)
        })
        .await
    }

    async fn get_header(&self, id: &CoId) -> Result<Option<CoValueHeader>> {
        let id = id.to_string();
        self.blocking(move |conn| load_header(conn, &id)).await
    }

    async fn list_covalues(&self) -> Result<Vec<CoId>> {
        self.blocking(|conn| {
            let mut stmt = conn.prepare("SELECT id FROM covalues ORDER BY id")?;
            let rows = stmt
                .query_map([], |row| row.get::<_, String>(0))?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            let mut ids = rows
                .iter()
                .map(|s| parse::<CoId>(s))
                .collect::<Result<Vec<_>>>()?;
            ids.sort();
            Ok(ids)
        })
        .await
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Session Operations
    // ─────────────────────────────────────────────────────────────────────────

    async fn known_state(&self, id: &CoId) -> Result<KnownState> {
        let co_id = *id;
        let id = id.to_string();

        self.blocking(move |conn| {
            let mut known = KnownState::empty(co_id);
            let exists: Option<i64> = conn
                .query_row("SELECT 1 FROM covalues WHERE id = ?1", params![id], |row| {
                    row.get(0)
                })
                .optional()?;
            if exists.is_none() {
                return Ok(known);
            }
            known.header = true;

            let mut stmt =
                conn.prepare("SELECT session_id, tx_count FROM sessions WHERE covalue_id = ?1")?;
            let rows = stmt
                .query_map(params![id], |row| {
                    Ok((row.get::<_, String>(0)?, row.get::<_, u32>(1)?))
                })?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            for (session, count) in rows {
                known.sessions.insert(parse(&session)?, count);
            }
            Ok(known)
        })
        .await
    }

    async fn append_batch(
        &self,
        id: &CoId,
        session: &SessionId,
        content: &SessionNewContent,
    ) -> Result<AppendResult> {
        let id = id.to_string();
        let session = session.to_string();
        let content = content.clone();

        self.blocking(move |conn| {
            let tx = conn.transaction()?;

            let exists: Option<i64> = tx
                .query_row("SELECT 1 FROM covalues WHERE id = ?1", params![id], |row| {
                    row.get(0)
                })
                .optional()?;
            if exists.is_none() {
                return Err(StoreError::NotFound(id));
            }

            let stored = session_count(&tx, &id, &session)?;
            let suffix = match new_suffix(stored, &content) {
                Ok(suffix) => suffix,
                Err(result) => return Ok(result),
            };

            {
                let mut insert = tx.prepare(
                    "INSERT INTO transactions (covalue_id, session_id, idx, tx)
                     VALUES (?1, ?2, ?3, ?4)",
                )?;
                for (offset, transaction) in suffix.iter().enumerate() {
                    insert.execute(params![
                        id,
                        session,
                        stored + offset as u32,
                        serde_json::to_string(transaction)?,
                    ])?;
                }
            }

            let added = suffix.len() as u32;
            let new_count = stored + added;
            tx.execute(
                "INSERT INTO signature_after (covalue_id, session_id, idx, signature)
                 VALUES (?1, ?2, ?3, ?4)",
                params![id, session, new_count - 1, content.last_signature.to_string()],
            )?;
            tx.execute(
                "INSERT INTO sessions (covalue_id, session_id, tx_count) VALUES (?1, ?2, ?3)
                 ON CONFLICT(covalue_id, session_id) DO UPDATE SET tx_count = excluded.tx_count",
                params![id, session, new_count],
            )?;

            tx.commit()?;
            Ok(AppendResult::Appended { added })
        })
        .await
    }

    async fn load_batches(&self, id: &CoId) -> Result<Vec<StoredBatch>> {
        let id = id.to_string();

        self.blocking(move |conn| {
            let sessions: Vec<String> = conn
                .prepare("SELECT session_id FROM sessions WHERE covalue_id = ?1")?
                .query_map(params![id], |row| row.get(0))?
                .collect::<std::result::Result<Vec<_>, _>>()?;

            let mut batches = Vec::new();
            for session_str in sessions {
                let session: SessionId = parse(&session_str)?;

                let transactions = conn
                    .prepare(
                        "SELECT tx FROM transactions
                         WHERE covalue_id = ?1 AND session_id = ?2 ORDER BY idx",
                    )?
                    .query_map(params![id, session_str], |row| row.get::<_, String>(0))?
                    .collect::<std::result::Result<Vec<_>, _>>()?
                    .iter()
                    .map(|json| serde_json::from_str::<Transaction>(json).map_err(StoreError::from))
                    .collect::<Result<Vec<_>>>()?;

                let checkpoints = conn
                    .prepare(
                        "SELECT idx, signature FROM signature_after
                         WHERE covalue_id = ?1 AND session_id = ?2 ORDER BY idx",
                    )?
                    .query_map(params![id, session_str], |row| {
                        Ok((row.get::<_, u32>(0)?, row.get::<_, String>(1)?))
                    })?
                    .collect::<std::result::Result<Vec<_>, _>>()?;

                let mut after = 0u32;
                for (last, signature) in checkpoints {
                    let end = last as usize + 1;
                    if end > transactions.len() || (after as usize) > end {
                        return Err(StoreError::InvalidData(format!(
                            "checkpoint {} beyond session {} length {}",
                            last,
                            session_str,
                            transactions.len()
                        )));
                    }
                    batches.push(StoredBatch {
                        session,
                        after,
                        transactions: transactions[after as usize..end].to_vec(),
                        signature: parse::<Signature>(&signature)?,
                    });
                    after = last + 1;
                }
            }

            batches.sort_by(|a, b| (a.session, a.after).cmp(&(b.session, b.after)));
            Ok(batches)
        })
        .await
    }
}
