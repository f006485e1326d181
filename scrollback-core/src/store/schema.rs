//! Database schema and migrations
//!
//! Uses SQLite with embedded migrations managed via PRAGMA user_version.
//! The full-text shadow table is created outside the migration chain because
//! its existence depends on whether the linked SQLite was compiled with FTS5;
//! every other table is unconditional.

use rusqlite::Connection;

/// Current schema version
pub const SCHEMA_VERSION: i32 = 1;

/// SQL migrations, indexed by version number
const MIGRATIONS: &[&str] = &[
    // Version 1: initial schema
    r#"
    CREATE TABLE IF NOT EXISTS sessions (
        id                 TEXT PRIMARY KEY,
        project            TEXT NOT NULL,
        machine            TEXT NOT NULL,
        agent              TEXT NOT NULL,
        started_at         TEXT,                -- RFC3339
        ended_at           TEXT,                -- RFC3339
        first_message      TEXT,
        message_count      INTEGER NOT NULL DEFAULT 0,
        user_message_count INTEGER NOT NULL DEFAULT 0,
        parent_session_id  TEXT,                -- by id, not a foreign key; may dangle
        relationship       TEXT NOT NULL DEFAULT 'root',

        -- Source file fingerprint at last successful parse
        file_path          TEXT NOT NULL,
        file_size          INTEGER NOT NULL,
        file_mtime_ns      INTEGER NOT NULL,
        file_hash          TEXT NOT NULL
    );

    CREATE INDEX IF NOT EXISTS idx_sessions_agent ON sessions(agent);
    CREATE INDEX IF NOT EXISTS idx_sessions_project ON sessions(project);
    CREATE INDEX IF NOT EXISTS idx_sessions_machine ON sessions(machine);
    CREATE INDEX IF NOT EXISTS idx_sessions_started ON sessions(started_at DESC);
    CREATE INDEX IF NOT EXISTS idx_sessions_file_path ON sessions(file_path);

    CREATE TABLE IF NOT EXISTS messages (
        session_id     TEXT NOT NULL REFERENCES sessions(id) ON DELETE CASCADE,
        ordinal        INTEGER NOT NULL,
        role           TEXT NOT NULL,
        content        TEXT NOT NULL,
        timestamp      TEXT,                    -- RFC3339
        has_thinking   INTEGER NOT NULL DEFAULT 0,
        has_tool_use   INTEGER NOT NULL DEFAULT 0,
        content_length INTEGER NOT NULL DEFAULT 0,

        PRIMARY KEY (session_id, ordinal)
    );

    CREATE INDEX IF NOT EXISTS idx_messages_ts ON messages(timestamp);

    CREATE TABLE IF NOT EXISTS tool_calls (
        session_id TEXT NOT NULL,
        ordinal    INTEGER NOT NULL,
        tool_index INTEGER NOT NULL,
        tool_name  TEXT NOT NULL,
        category   TEXT NOT NULL,
        arguments  TEXT NOT NULL,

        PRIMARY KEY (session_id, ordinal, tool_index)
    );
    "#,
];

/// Run all pending migrations
pub fn run_migrations(conn: &Connection) -> crate::error::Result<()> {
    let current_version: i32 = conn
        .query_row("PRAGMA user_version", [], |r| r.get(0))
        .unwrap_or(0);

    tracing::info!(
        current_version,
        target_version = SCHEMA_VERSION,
        "Checking database migrations"
    );

    for (i, migration) in MIGRATIONS.iter().enumerate() {
        let version = (i + 1) as i32;
        if version > current_version {
            tracing::info!(version, "Running migration");
            conn.execute_batch(migration)?;
            conn.execute(&format!("PRAGMA user_version = {}", version), [])?;
        }
    }

    if current_version < SCHEMA_VERSION {
        tracing::info!(
            from = current_version,
            to = SCHEMA_VERSION,
            "Migrations complete"
        );
    }

    Ok(())
}

/// Get the current schema version from the database
pub fn get_schema_version(conn: &Connection) -> crate::error::Result<i32> {
    let version: i32 = conn.query_row("PRAGMA user_version", [], |r| r.get(0))?;
    Ok(version)
}

/// Probe whether the linked SQLite supports FTS5 virtual tables.
pub fn fts_available(conn: &Connection) -> bool {
    conn.execute_batch(
        "CREATE VIRTUAL TABLE temp.scrollback_fts_probe USING fts5(x);
         DROP TABLE temp.scrollback_fts_probe;",
    )
    .is_ok()
}

/// Create the full-text shadow of `messages.content`. Only called when
/// [`fts_available`] reported support.
pub fn ensure_fts(conn: &Connection) -> crate::error::Result<()> {
    conn.execute_batch(
        "CREATE VIRTUAL TABLE IF NOT EXISTS messages_fts USING fts5(
            content,
            session_id UNINDEXED,
            ordinal UNINDEXED,
            tokenize='unicode61'
        );",
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_migrations_idempotent() {
        let conn = Connection::open_in_memory().unwrap();

        // Run migrations twice - should be idempotent
        run_migrations(&conn).unwrap();
        run_migrations(&conn).unwrap();

        let version = get_schema_version(&conn).unwrap();
        assert_eq!(version, SCHEMA_VERSION);
    }

    #[test]
    fn test_tables_created() {
        let conn = Connection::open_in_memory().unwrap();
        run_migrations(&conn).unwrap();

        let tables = ["sessions", "messages", "tool_calls"];
        for table in tables {
            let exists: i32 = conn
                .query_row(
                    "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name=?",
                    [table],
                    |r| r.get(0),
                )
                .unwrap();
            assert_eq!(exists, 1, "Table {} should exist", table);
        }
    }

    #[test]
    fn test_fts_probe_and_shadow() {
        let conn = Connection::open_in_memory().unwrap();
        run_migrations(&conn).unwrap();

        // The bundled engine is compiled with FTS5
        assert!(fts_available(&conn));
        ensure_fts(&conn).unwrap();
        ensure_fts(&conn).unwrap();

        let exists: i32 = conn
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name='messages_fts'",
                [],
                |r| r.get(0),
            )
            .unwrap();
        assert_eq!(exists, 1);
    }
}
