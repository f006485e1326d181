//! Storage layer
//!
//! Wraps the embedded SQLite database. Owns the schema, provides
//! transactional upsert of sessions and atomic replacement of their
//! messages, and runs the read queries backing the HTTP API.
//!
//! ## Concurrency discipline
//!
//! One write connection behind a mutex serializes every mutation. Reads
//! never take that mutex: they borrow read-only connections from a small
//! pool and rely on WAL snapshot isolation, so readers and the writer do not
//! block each other. In-memory databases (tests) have no pool and fall back
//! to the write connection.

pub mod schema;

mod read;

pub use read::{decode_cursor, encode_cursor};

use crate::error::{Error, Result};
use crate::types::{FileFingerprint, Message, Session};
use rusqlite::{params, Connection, OpenFlags};
use std::ops::Deref;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Deadline attached to every read operation.
///
/// Checked before the query runs and periodically while rows stream; an
/// exceeded deadline surfaces as [`Error::DeadlineExceeded`].
#[derive(Debug, Clone, Copy, Default)]
pub struct Deadline(Option<Instant>);

impl Deadline {
    /// No deadline.
    pub fn none() -> Self {
        Self(None)
    }

    /// Expires after `d` from now.
    pub fn after(d: Duration) -> Self {
        Self(Some(Instant::now() + d))
    }

    /// Error if the deadline has passed.
    pub fn check(&self) -> Result<()> {
        match self.0 {
            Some(at) if Instant::now() >= at => Err(Error::DeadlineExceeded),
            _ => Ok(()),
        }
    }
}

/// Database handle: one serialized writer, pooled readers.
pub struct Store {
    write: Mutex<Connection>,
    readers: Option<ReadPool>,
    has_fts: bool,
    /// Fault injection point: fail message replacement after inserting this
    /// many rows, mid-transaction.
    #[cfg(test)]
    fail_replace_after: std::sync::atomic::AtomicUsize,
}

impl Store {
    /// Open or create a database at the given path.
    pub fn open(path: &Path) -> Result<Self> {
        // Ensure parent directory exists
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(path)?;

        // WAL gives snapshot reads that do not block the writer
        conn.execute_batch(
            "
            PRAGMA foreign_keys = ON;
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;
            PRAGMA cache_size = -64000;  -- 64MB cache
            ",
        )?;

        let has_fts = schema::fts_available(&conn);
        if !has_fts {
            tracing::warn!("SQLite built without FTS5, search will be unavailable");
        }

        schema::run_migrations(&conn)?;
        if has_fts {
            schema::ensure_fts(&conn)?;
        }

        Ok(Self {
            write: Mutex::new(conn),
            readers: Some(ReadPool::new(path.to_path_buf())),
            has_fts,
            #[cfg(test)]
            fail_replace_after: std::sync::atomic::AtomicUsize::new(usize::MAX),
        })
    }

    /// Open an in-memory database (for testing). Reads share the single
    /// connection.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute("PRAGMA foreign_keys = ON", [])?;

        let has_fts = schema::fts_available(&conn);
        schema::run_migrations(&conn)?;
        if has_fts {
            schema::ensure_fts(&conn)?;
        }

        Ok(Self {
            write: Mutex::new(conn),
            readers: None,
            has_fts,
            #[cfg(test)]
            fail_replace_after: std::sync::atomic::AtomicUsize::new(usize::MAX),
        })
    }

    /// Whether the embedded engine was built with full-text support.
    pub fn has_fts(&self) -> bool {
        self.has_fts
    }

    /// Borrow a connection for a read query.
    fn read_conn(&self) -> Result<ReadGuard<'_>> {
        match &self.readers {
            Some(pool) => Ok(ReadGuard::Pooled {
                conn: Some(pool.acquire()?),
                pool,
            }),
            None => Ok(ReadGuard::Exclusive(self.write.lock().unwrap())),
        }
    }

    // ============================================
    // Mutations (serialized behind the write mutex)
    // ============================================

    /// Insert-or-update a session by id in a single statement.
    pub fn upsert_session(&self, session: &Session) -> Result<()> {
        let conn = self.write.lock().unwrap();
        conn.execute(
            r#"
            INSERT INTO sessions (
                id, project, machine, agent, started_at, ended_at, first_message,
                message_count, user_message_count, parent_session_id, relationship,
                file_path, file_size, file_mtime_ns, file_hash
            )
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)
            ON CONFLICT(id) DO UPDATE SET
                project = excluded.project,
                machine = excluded.machine,
                agent = excluded.agent,
                started_at = excluded.started_at,
                ended_at = excluded.ended_at,
                first_message = excluded.first_message,
                message_count = excluded.message_count,
                user_message_count = excluded.user_message_count,
                parent_session_id = excluded.parent_session_id,
                relationship = excluded.relationship,
                file_path = excluded.file_path,
                file_size = excluded.file_size,
                file_mtime_ns = excluded.file_mtime_ns,
                file_hash = excluded.file_hash
            "#,
            params![
                session.id,
                session.project,
                session.machine,
                session.agent.as_str(),
                session.started_at.map(|t| t.to_rfc3339()),
                session.ended_at.map(|t| t.to_rfc3339()),
                session.first_message,
                session.message_count,
                session.user_message_count,
                session.parent_session_id,
                session.relationship.as_str(),
                session.file.path,
                session.file.size,
                session.file.mtime_ns,
                session.file.hash,
            ],
        )?;
        Ok(())
    }

    /// Atomically replace all messages (and tool calls and full-text rows)
    /// of a session. On any error the previous contents remain intact.
    pub fn replace_session_messages(&self, id: &str, messages: &[Message]) -> Result<()> {
        // Invariant: ordinals are exactly 0..len, in order
        for (i, msg) in messages.iter().enumerate() {
            if msg.ordinal != i as i64 {
                return Err(Error::Corrupt {
                    path: id.to_string(),
                    message: format!("ordinal {} at position {}", msg.ordinal, i),
                });
            }
        }

        let mut conn = self.write.lock().unwrap();
        let tx = conn.transaction()?;

        tx.execute("DELETE FROM messages WHERE session_id = ?1", [id])?;
        tx.execute("DELETE FROM tool_calls WHERE session_id = ?1", [id])?;
        if self.has_fts {
            tx.execute("DELETE FROM messages_fts WHERE session_id = ?1", [id])?;
        }

        {
            let mut insert_msg = tx.prepare(
                r#"
                INSERT INTO messages (
                    session_id, ordinal, role, content, timestamp,
                    has_thinking, has_tool_use, content_length
                )
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                "#,
            )?;
            let mut insert_tool = tx.prepare(
                r#"
                INSERT INTO tool_calls (session_id, ordinal, tool_index, tool_name, category, arguments)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                "#,
            )?;
            let mut insert_fts = if self.has_fts {
                Some(tx.prepare(
                    "INSERT INTO messages_fts (content, session_id, ordinal) VALUES (?1, ?2, ?3)",
                )?)
            } else {
                None
            };

            for (i, msg) in messages.iter().enumerate() {
                #[cfg(test)]
                {
                    if i >= self
                        .fail_replace_after
                        .load(std::sync::atomic::Ordering::Relaxed)
                    {
                        return Err(Error::Corrupt {
                            path: id.to_string(),
                            message: "injected fault".to_string(),
                        });
                    }
                }
                #[cfg(not(test))]
                let _ = i;

                insert_msg.execute(params![
                    msg.session_id,
                    msg.ordinal,
                    msg.role.as_str(),
                    msg.content,
                    msg.timestamp.map(|t| t.to_rfc3339()),
                    msg.has_thinking as i64,
                    msg.has_tool_use as i64,
                    msg.content_length,
                ])?;

                for (idx, call) in msg.tool_calls.iter().enumerate() {
                    insert_tool.execute(params![
                        msg.session_id,
                        msg.ordinal,
                        idx as i64,
                        call.tool_name,
                        call.category.as_str(),
                        call.arguments,
                    ])?;
                }

                if let Some(fts) = insert_fts.as_mut() {
                    fts.execute(params![msg.content, msg.session_id, msg.ordinal])?;
                }
            }
        }

        tx.commit()?;
        Ok(())
    }

    /// Delete a session and everything hanging off it.
    pub fn delete_session(&self, id: &str) -> Result<()> {
        let mut conn = self.write.lock().unwrap();
        let tx = conn.transaction()?;
        tx.execute("DELETE FROM messages WHERE session_id = ?1", [id])?;
        tx.execute("DELETE FROM tool_calls WHERE session_id = ?1", [id])?;
        if self.has_fts {
            tx.execute("DELETE FROM messages_fts WHERE session_id = ?1", [id])?;
        }
        tx.execute("DELETE FROM sessions WHERE id = ?1", [id])?;
        tx.commit()?;
        Ok(())
    }

    /// Stored fingerprint for a source file path, if any session references
    /// it. Used by the sync engine to skip unchanged files.
    pub fn get_fingerprint(&self, path: &str) -> Result<Option<FileFingerprint>> {
        let guard = self.read_conn()?;
        let mut stmt = guard.prepare(
            "SELECT file_path, file_size, file_mtime_ns, file_hash
             FROM sessions WHERE file_path = ?1 LIMIT 1",
        )?;
        let fp = stmt
            .query_row([path], |row| {
                Ok(FileFingerprint {
                    path: row.get(0)?,
                    size: row.get(1)?,
                    mtime_ns: row.get(2)?,
                    hash: row.get(3)?,
                })
            })
            .map(Some)
            .or_else(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                other => Err(other),
            })?;
        Ok(fp)
    }

    /// All stored (session id, source file path) pairs.
    pub fn list_session_files(&self) -> Result<Vec<(String, String)>> {
        let guard = self.read_conn()?;
        let mut stmt = guard.prepare("SELECT id, file_path FROM sessions ORDER BY id")?;
        let rows = stmt
            .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }
}

// ============================================
// Read connection pool
// ============================================

struct ReadPool {
    path: PathBuf,
    conns: Mutex<Vec<Connection>>,
}

impl ReadPool {
    fn new(path: PathBuf) -> Self {
        Self {
            path,
            conns: Mutex::new(Vec::new()),
        }
    }

    fn acquire(&self) -> Result<Connection> {
        if let Some(conn) = self.conns.lock().unwrap().pop() {
            return Ok(conn);
        }
        let conn = Connection::open_with_flags(
            &self.path,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;
        conn.busy_timeout(Duration::from_secs(5))?;
        Ok(conn)
    }

    fn release(&self, conn: Connection) {
        let mut conns = self.conns.lock().unwrap();
        // Bound the pool; beyond that, dropping the connection closes it
        if conns.len() < 8 {
            conns.push(conn);
        }
    }
}

/// A borrowed read connection: pooled for on-disk databases, the write
/// connection itself for in-memory ones.
enum ReadGuard<'a> {
    Pooled {
        conn: Option<Connection>,
        pool: &'a ReadPool,
    },
    Exclusive(std::sync::MutexGuard<'a, Connection>),
}

impl Deref for ReadGuard<'_> {
    type Target = Connection;

    fn deref(&self) -> &Connection {
        match self {
            ReadGuard::Pooled { conn, .. } => conn.as_ref().expect("connection taken"),
            ReadGuard::Exclusive(guard) => guard,
        }
    }
}

impl Drop for ReadGuard<'_> {
    fn drop(&mut self) {
        if let ReadGuard::Pooled { conn, pool } = self {
            if let Some(conn) = conn.take() {
                pool.release(conn);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{AgentKind, RelationshipType, Role, ToolCall, ToolCategory};
    use chrono::Utc;

    fn fingerprint(path: &str) -> FileFingerprint {
        FileFingerprint {
            path: path.to_string(),
            size: 10,
            mtime_ns: 1,
            hash: "h".to_string(),
        }
    }

    fn session(id: &str) -> Session {
        Session {
            id: id.to_string(),
            project: "proj".to_string(),
            machine: "local".to_string(),
            agent: AgentKind::Pi,
            started_at: Some(Utc::now()),
            ended_at: Some(Utc::now()),
            first_message: Some("hello".to_string()),
            message_count: 2,
            user_message_count: 1,
            parent_session_id: None,
            relationship: RelationshipType::Root,
            file: fingerprint(&format!("/tmp/{}.jsonl", id)),
        }
    }

    fn message(session_id: &str, ordinal: i64, role: Role, content: &str) -> Message {
        Message {
            session_id: session_id.to_string(),
            ordinal,
            role,
            content: content.to_string(),
            timestamp: Some(Utc::now()),
            has_thinking: false,
            has_tool_use: false,
            content_length: content.chars().count() as i64,
            tool_calls: Vec::new(),
        }
    }

    #[test]
    fn test_upsert_session_twice() {
        let store = Store::open_in_memory().unwrap();
        let mut s = session("s1");
        store.upsert_session(&s).unwrap();
        s.project = "other".to_string();
        store.upsert_session(&s).unwrap();

        let loaded = store.get_session("s1", Deadline::none()).unwrap().unwrap();
        assert_eq!(loaded.project, "other");
    }

    #[test]
    fn test_replace_round_trip() {
        let store = Store::open_in_memory().unwrap();
        store.upsert_session(&session("s1")).unwrap();

        let mut with_tool = message("s1", 1, Role::Assistant, "[Bash cmd=ls]");
        with_tool.has_tool_use = true;
        with_tool.tool_calls.push(ToolCall {
            tool_name: "bash".to_string(),
            category: ToolCategory::Bash,
            arguments: "{\"cmd\":\"ls\"}".to_string(),
        });
        let msgs = vec![message("s1", 0, Role::User, "run ls"), with_tool];

        store.replace_session_messages("s1", &msgs).unwrap();
        let loaded = store
            .get_messages("s1", 0, 100, crate::types::SortDirection::Asc, Deadline::none())
            .unwrap();
        assert_eq!(loaded, msgs);
    }

    #[test]
    fn test_replace_rejects_sparse_ordinals() {
        let store = Store::open_in_memory().unwrap();
        store.upsert_session(&session("s1")).unwrap();
        let msgs = vec![
            message("s1", 0, Role::User, "a"),
            message("s1", 2, Role::Assistant, "b"),
        ];
        let err = store.replace_session_messages("s1", &msgs).unwrap_err();
        assert!(matches!(err, Error::Corrupt { .. }));
    }

    #[test]
    fn test_replace_failure_preserves_previous_state() {
        let store = Store::open_in_memory().unwrap();
        store.upsert_session(&session("s1")).unwrap();
        let original = vec![
            message("s1", 0, Role::User, "first"),
            message("s1", 1, Role::Assistant, "second"),
        ];
        store.replace_session_messages("s1", &original).unwrap();

        // Fail after the first insert, mid-transaction: the delete and the
        // partial insert must both roll back
        store
            .fail_replace_after
            .store(1, std::sync::atomic::Ordering::Relaxed);
        let attempted = vec![
            message("s1", 0, Role::User, "x"),
            message("s1", 1, Role::User, "y"),
            message("s1", 2, Role::User, "z"),
        ];
        assert!(store.replace_session_messages("s1", &attempted).is_err());
        store
            .fail_replace_after
            .store(usize::MAX, std::sync::atomic::Ordering::Relaxed);

        let loaded = store
            .get_messages("s1", 0, 100, crate::types::SortDirection::Asc, Deadline::none())
            .unwrap();
        assert_eq!(loaded, original);
    }

    #[test]
    fn test_delete_session_removes_everything() {
        let store = Store::open_in_memory().unwrap();
        store.upsert_session(&session("s1")).unwrap();
        store
            .replace_session_messages("s1", &[message("s1", 0, Role::User, "hi")])
            .unwrap();

        store.delete_session("s1").unwrap();
        assert!(store.get_session("s1", Deadline::none()).unwrap().is_none());
        assert!(store
            .get_messages("s1", 0, 10, crate::types::SortDirection::Asc, Deadline::none())
            .unwrap()
            .is_empty());
    }

    #[test]
    fn test_fingerprint_lookup() {
        let store = Store::open_in_memory().unwrap();
        let s = session("s1");
        store.upsert_session(&s).unwrap();
        let fp = store.get_fingerprint(&s.file.path).unwrap().unwrap();
        assert_eq!(fp, s.file);
        assert!(store.get_fingerprint("/other").unwrap().is_none());
    }

    #[test]
    fn test_deadline_expired() {
        let store = Store::open_in_memory().unwrap();
        let deadline = Deadline::after(Duration::from_secs(0));
        std::thread::sleep(Duration::from_millis(2));
        let err = store.get_session("s1", deadline).unwrap_err();
        assert!(matches!(err, Error::DeadlineExceeded));
    }
}
