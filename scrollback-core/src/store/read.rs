//! Read queries backing the HTTP API
//!
//! Reads never touch the write mutex. Listings paginate with keyset cursors
//! (opaque base64 of `(sort-key, id)`) so results stay stable while the sync
//! engine inserts new sessions between pages.

use super::{Deadline, Store};
use crate::error::{Error, Result};
use crate::types::{
    ActivityDay, AgentKind, Message, MinimapEntry, NamedCount, RelationshipType, Role, SearchHit,
    SearchPage, Session, SessionFilter, SessionPage, SortDirection, StoreStats, ToolCall,
    ToolCategory,
};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, Utc};
use rusqlite::Row;
use std::collections::{BTreeMap, HashMap};
use std::str::FromStr;

/// Hard caps per endpoint.
const MAX_LIST_LIMIT: usize = 500;
const MAX_MESSAGES_LIMIT: usize = 1000;
const MAX_SEARCH_LIMIT: usize = 500;

/// Deadline re-check spacing while streaming rows.
const DEADLINE_STRIDE: usize = 256;

/// Field separator inside a cursor before encoding.
const CURSOR_SEP: char = '\u{1f}';

/// Encode a keyset cursor.
pub fn encode_cursor(sort_key: &str, id: &str) -> String {
    URL_SAFE_NO_PAD.encode(format!("{}{}{}", sort_key, CURSOR_SEP, id))
}

/// Decode and validate a keyset cursor.
pub fn decode_cursor(cursor: &str) -> Result<(String, String)> {
    let bytes = URL_SAFE_NO_PAD
        .decode(cursor)
        .map_err(|_| Error::InvalidInput("malformed cursor".to_string()))?;
    let text = String::from_utf8(bytes)
        .map_err(|_| Error::InvalidInput("malformed cursor".to_string()))?;
    let (key, id) = text
        .split_once(CURSOR_SEP)
        .ok_or_else(|| Error::InvalidInput("malformed cursor".to_string()))?;
    Ok((key.to_string(), id.to_string()))
}

impl Store {
    /// Fetch a single session by id; `None` when absent.
    pub fn get_session(&self, id: &str, deadline: Deadline) -> Result<Option<Session>> {
        deadline.check()?;
        let guard = self.read_conn()?;
        let mut stmt = guard.prepare("SELECT * FROM sessions WHERE id = ?1")?;
        let session = stmt
            .query_row([id], row_to_session)
            .map(Some)
            .or_else(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                other => Err(other),
            })?;
        Ok(session)
    }

    /// Messages of a session starting at `from` (an ordinal), walking in
    /// `dir`, at most `limit` rows.
    pub fn get_messages(
        &self,
        id: &str,
        from: i64,
        limit: usize,
        dir: SortDirection,
        deadline: Deadline,
    ) -> Result<Vec<Message>> {
        deadline.check()?;
        let limit = limit.min(MAX_MESSAGES_LIMIT);
        let guard = self.read_conn()?;

        let sql = match dir {
            SortDirection::Asc => {
                "SELECT session_id, ordinal, role, content, timestamp, has_thinking,
                        has_tool_use, content_length
                 FROM messages WHERE session_id = ?1 AND ordinal >= ?2
                 ORDER BY ordinal ASC LIMIT ?3"
            }
            SortDirection::Desc => {
                "SELECT session_id, ordinal, role, content, timestamp, has_thinking,
                        has_tool_use, content_length
                 FROM messages WHERE session_id = ?1 AND ordinal <= ?2
                 ORDER BY ordinal DESC LIMIT ?3"
            }
        };

        let mut stmt = guard.prepare(sql)?;
        let mut messages = Vec::new();
        let mut rows = stmt.query(rusqlite::params![id, from, limit as i64])?;
        while let Some(row) = rows.next()? {
            if messages.len() % DEADLINE_STRIDE == 0 {
                deadline.check()?;
            }
            messages.push(row_to_message(row)?);
        }

        if !messages.is_empty() {
            attach_tool_calls(&guard, id, &mut messages)?;
        }
        Ok(messages)
    }

    /// Downsampled message list for the UI scroll map: at most `max` evenly
    /// spaced ordinals starting at `from`.
    pub fn get_minimap(
        &self,
        id: &str,
        from: i64,
        max: usize,
        deadline: Deadline,
    ) -> Result<Vec<MinimapEntry>> {
        deadline.check()?;
        if max == 0 {
            return Err(Error::InvalidInput("minimap max must be positive".into()));
        }
        let guard = self.read_conn()?;

        let count: i64 = guard.query_row(
            "SELECT COUNT(*) FROM messages WHERE session_id = ?1 AND ordinal >= ?2",
            rusqlite::params![id, from],
            |r| r.get(0),
        )?;
        if count == 0 {
            return Ok(Vec::new());
        }
        let step = ((count + max as i64 - 1) / max as i64).max(1);

        deadline.check()?;
        let mut stmt = guard.prepare(
            "SELECT ordinal, role, timestamp FROM messages
             WHERE session_id = ?1 AND ordinal >= ?2 AND (ordinal - ?2) % ?3 = 0
             ORDER BY ordinal ASC",
        )?;
        let entries = stmt
            .query_map(rusqlite::params![id, from, step], |row| {
                let role: String = row.get(1)?;
                let ts: Option<String> = row.get(2)?;
                Ok(MinimapEntry {
                    ordinal: row.get(0)?,
                    role: Role::from_str(&role).map_err(invalid_text)?,
                    timestamp: parse_dt(ts),
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(entries)
    }

    /// Keyset-paginated session listing, newest first.
    pub fn list_sessions(
        &self,
        filter: &SessionFilter,
        cursor: Option<&str>,
        limit: usize,
        deadline: Deadline,
    ) -> Result<SessionPage> {
        deadline.check()?;
        let limit = limit.clamp(1, MAX_LIST_LIMIT);

        let mut clauses: Vec<String> = Vec::new();
        let mut args: Vec<String> = Vec::new();
        push_filter_clauses(filter, "", &mut clauses, &mut args);

        if let Some(cursor) = cursor {
            let (key, id) = decode_cursor(cursor)?;
            let k = args.len() + 1;
            clauses.push(format!(
                "(COALESCE(started_at,'') < ?{k} OR (COALESCE(started_at,'') = ?{k} AND id < ?{m}))",
                k = k,
                m = k + 1
            ));
            args.push(key);
            args.push(id);
        }

        let mut sql = String::from("SELECT * FROM sessions");
        if !clauses.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&clauses.join(" AND "));
        }
        sql.push_str(&format!(
            " ORDER BY COALESCE(started_at,'') DESC, id DESC LIMIT {}",
            limit + 1
        ));

        let guard = self.read_conn()?;
        let mut stmt = guard.prepare(&sql)?;
        let mut sessions = Vec::new();
        let mut rows = stmt.query(rusqlite::params_from_iter(args.iter()))?;
        while let Some(row) = rows.next()? {
            if sessions.len() % DEADLINE_STRIDE == 0 {
                deadline.check()?;
            }
            sessions.push(row_to_session(row)?);
        }

        let next_cursor = if sessions.len() > limit {
            sessions.truncate(limit);
            sessions.last().map(|s| {
                encode_cursor(
                    &s.started_at.map(|t| t.to_rfc3339()).unwrap_or_default(),
                    &s.id,
                )
            })
        } else {
            None
        };

        Ok(SessionPage {
            sessions,
            next_cursor,
        })
    }

    /// Full-text search over message content.
    ///
    /// Requires FTS support in the embedded engine; otherwise returns
    /// [`Error::Unsupported`], which the API maps to 501.
    pub fn search(
        &self,
        query: &str,
        filter: &SessionFilter,
        cursor: Option<&str>,
        limit: usize,
        deadline: Deadline,
    ) -> Result<SearchPage> {
        deadline.check()?;
        if !self.has_fts() {
            return Err(Error::Unsupported("full-text search not compiled in"));
        }
        let tokens: Vec<&str> = query.split_whitespace().collect();
        if tokens.is_empty() {
            return Err(Error::InvalidInput("empty search query".to_string()));
        }
        // Quote each token so user input cannot hit FTS query syntax
        let match_expr = tokens
            .iter()
            .map(|t| format!("\"{}\"", t.replace('"', "\"\"")))
            .collect::<Vec<_>>()
            .join(" ");
        let limit = limit.clamp(1, MAX_SEARCH_LIMIT);

        let mut clauses = vec!["messages_fts MATCH ?1".to_string()];
        let mut args: Vec<String> = vec![match_expr];

        let joins_sessions =
            filter.agent.is_some() || filter.project.is_some() || filter.machine.is_some();
        push_filter_clauses(filter, "s.", &mut clauses, &mut args);

        if let Some(cursor) = cursor {
            let (key, id) = decode_cursor(cursor)?;
            // Rank is not stable under insertion; paginate by position
            let k = args.len() + 1;
            clauses.push(format!(
                "(m.session_id > ?{k} OR (m.session_id = ?{k} AND m.ordinal > CAST(?{m} AS INTEGER)))",
                k = k,
                m = k + 1
            ));
            args.push(key);
            args.push(id);
        }

        let mut sql = String::from(
            "SELECT m.session_id, m.ordinal, m.role, m.timestamp,
                    snippet(messages_fts, 0, '[', ']', '…', 12)
             FROM messages_fts
             JOIN messages m ON m.session_id = messages_fts.session_id
                            AND m.ordinal = CAST(messages_fts.ordinal AS INTEGER)",
        );
        if joins_sessions {
            sql.push_str(" JOIN sessions s ON s.id = m.session_id");
        }
        sql.push_str(" WHERE ");
        sql.push_str(&clauses.join(" AND "));
        sql.push_str(&format!(
            " ORDER BY m.session_id ASC, m.ordinal ASC LIMIT {}",
            limit + 1
        ));

        let guard = self.read_conn()?;
        let mut stmt = guard.prepare(&sql)?;
        let mut hits = Vec::new();
        let mut rows = stmt.query(rusqlite::params_from_iter(args.iter()))?;
        while let Some(row) = rows.next()? {
            if hits.len() % DEADLINE_STRIDE == 0 {
                deadline.check()?;
            }
            let role: String = row.get(2)?;
            let ts: Option<String> = row.get(3)?;
            hits.push(SearchHit {
                session_id: row.get(0)?,
                ordinal: row.get(1)?,
                role: Role::from_str(&role).map_err(invalid_text)?,
                timestamp: parse_dt(ts),
                snippet: row.get(4)?,
            });
        }

        let next_cursor = if hits.len() > limit {
            hits.truncate(limit);
            hits.last()
                .map(|h| encode_cursor(&h.session_id, &h.ordinal.to_string()))
        } else {
            None
        };

        Ok(SearchPage { hits, next_cursor })
    }

    /// Store-wide aggregate counts.
    pub fn get_stats(&self, deadline: Deadline) -> Result<StoreStats> {
        deadline.check()?;
        let guard = self.read_conn()?;
        let sessions: i64 = guard.query_row("SELECT COUNT(*) FROM sessions", [], |r| r.get(0))?;
        let messages: i64 = guard.query_row("SELECT COUNT(*) FROM messages", [], |r| r.get(0))?;
        let projects: i64 = guard.query_row(
            "SELECT COUNT(DISTINCT project) FROM sessions",
            [],
            |r| r.get(0),
        )?;
        let machines: i64 = guard.query_row(
            "SELECT COUNT(DISTINCT machine) FROM sessions",
            [],
            |r| r.get(0),
        )?;
        Ok(StoreStats {
            sessions,
            messages,
            projects,
            machines,
        })
    }

    /// Distinct projects with session counts, busiest first.
    pub fn get_projects(&self, deadline: Deadline) -> Result<Vec<NamedCount>> {
        self.named_counts("project", deadline)
    }

    /// Distinct machines with session counts.
    pub fn get_machines(&self, deadline: Deadline) -> Result<Vec<NamedCount>> {
        self.named_counts("machine", deadline)
    }

    /// Distinct agents with session counts.
    pub fn get_agents(&self, deadline: Deadline) -> Result<Vec<NamedCount>> {
        self.named_counts("agent", deadline)
    }

    fn named_counts(&self, column: &str, deadline: Deadline) -> Result<Vec<NamedCount>> {
        deadline.check()?;
        let guard = self.read_conn()?;
        let sql = format!(
            "SELECT {col}, COUNT(*) AS n FROM sessions GROUP BY {col} ORDER BY n DESC, {col} ASC",
            col = column
        );
        let mut stmt = guard.prepare(&sql)?;
        let rows = stmt
            .query_map([], |row| {
                Ok(NamedCount {
                    name: row.get(0)?,
                    sessions: row.get(1)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    /// Sessions and messages per day over the trailing `days` days with any
    /// activity, newest day first.
    pub fn get_activity(&self, days: usize, deadline: Deadline) -> Result<Vec<ActivityDay>> {
        deadline.check()?;
        let guard = self.read_conn()?;
        let mut by_day: BTreeMap<String, (i64, i64)> = BTreeMap::new();

        let mut stmt = guard.prepare(
            "SELECT substr(started_at, 1, 10) AS day, COUNT(*) FROM sessions
             WHERE started_at IS NOT NULL GROUP BY day",
        )?;
        let mut rows = stmt.query([])?;
        while let Some(row) = rows.next()? {
            let day: String = row.get(0)?;
            let count: i64 = row.get(1)?;
            by_day.entry(day).or_default().0 = count;
        }

        deadline.check()?;
        let mut stmt = guard.prepare(
            "SELECT substr(timestamp, 1, 10) AS day, COUNT(*) FROM messages
             WHERE timestamp IS NOT NULL GROUP BY day",
        )?;
        let mut rows = stmt.query([])?;
        while let Some(row) = rows.next()? {
            let day: String = row.get(0)?;
            let count: i64 = row.get(1)?;
            by_day.entry(day).or_default().1 = count;
        }

        Ok(by_day
            .into_iter()
            .rev()
            .take(days)
            .map(|(day, (sessions, messages))| ActivityDay {
                day,
                sessions,
                messages,
            })
            .collect())
    }
}

// ============================================
// Row mapping
// ============================================

fn push_filter_clauses(
    filter: &SessionFilter,
    prefix: &str,
    clauses: &mut Vec<String>,
    args: &mut Vec<String>,
) {
    if let Some(agent) = filter.agent {
        clauses.push(format!("{}agent = ?{}", prefix, args.len() + 1));
        args.push(agent.as_str().to_string());
    }
    if let Some(project) = &filter.project {
        clauses.push(format!("{}project = ?{}", prefix, args.len() + 1));
        args.push(project.clone());
    }
    if let Some(machine) = &filter.machine {
        clauses.push(format!("{}machine = ?{}", prefix, args.len() + 1));
        args.push(machine.clone());
    }
}

fn invalid_text(message: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        0,
        rusqlite::types::Type::Text,
        Box::new(std::io::Error::new(std::io::ErrorKind::InvalidData, message)),
    )
}

fn parse_dt(value: Option<String>) -> Option<DateTime<Utc>> {
    value.and_then(|s| {
        DateTime::parse_from_rfc3339(&s)
            .map(|dt| dt.with_timezone(&Utc))
            .ok()
    })
}

fn row_to_session(row: &Row) -> rusqlite::Result<Session> {
    let agent: String = row.get("agent")?;
    let relationship: String = row.get("relationship")?;
    let started: Option<String> = row.get("started_at")?;
    let ended: Option<String> = row.get("ended_at")?;

    Ok(Session {
        id: row.get("id")?,
        project: row.get("project")?,
        machine: row.get("machine")?,
        agent: AgentKind::from_str(&agent).map_err(invalid_text)?,
        started_at: parse_dt(started),
        ended_at: parse_dt(ended),
        first_message: row.get("first_message")?,
        message_count: row.get("message_count")?,
        user_message_count: row.get("user_message_count")?,
        parent_session_id: row.get("parent_session_id")?,
        relationship: RelationshipType::from_str(&relationship).map_err(invalid_text)?,
        file: crate::types::FileFingerprint {
            path: row.get("file_path")?,
            size: row.get("file_size")?,
            mtime_ns: row.get("file_mtime_ns")?,
            hash: row.get("file_hash")?,
        },
    })
}

fn row_to_message(row: &Row) -> rusqlite::Result<Message> {
    let role: String = row.get(2)?;
    let ts: Option<String> = row.get(4)?;
    Ok(Message {
        session_id: row.get(0)?,
        ordinal: row.get(1)?,
        role: Role::from_str(&role).map_err(invalid_text)?,
        content: row.get(3)?,
        timestamp: parse_dt(ts),
        has_thinking: row.get::<_, i64>(5)? != 0,
        has_tool_use: row.get::<_, i64>(6)? != 0,
        content_length: row.get(7)?,
        tool_calls: Vec::new(),
    })
}

fn attach_tool_calls(
    conn: &rusqlite::Connection,
    session_id: &str,
    messages: &mut [Message],
) -> rusqlite::Result<()> {
    let mut stmt = conn.prepare(
        "SELECT ordinal, tool_name, category, arguments FROM tool_calls
         WHERE session_id = ?1 ORDER BY ordinal, tool_index",
    )?;
    let mut by_ordinal: HashMap<i64, Vec<ToolCall>> = HashMap::new();
    let mut rows = stmt.query([session_id])?;
    while let Some(row) = rows.next()? {
        let ordinal: i64 = row.get(0)?;
        let category: String = row.get(2)?;
        by_ordinal.entry(ordinal).or_default().push(ToolCall {
            tool_name: row.get(1)?,
            category: ToolCategory::from_db(&category),
            arguments: row.get(3)?,
        });
    }
    for msg in messages.iter_mut() {
        if let Some(calls) = by_ordinal.remove(&msg.ordinal) {
            msg.tool_calls = calls;
        }
    }
    Ok(())
}
