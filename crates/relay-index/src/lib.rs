//! Derived SQLite index over the Maildir store.
//!
//! The index exists to answer queries (by subject, by endpoint, backpressure
//! counts, rate-limiter window counts) without walking the filesystem on
//! every call. It is never the sole record of an envelope — it can be
//! dropped and `rebuild`-ed from Maildir at any time, and every write to it
//! happens only after the corresponding Maildir write has already landed.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use relay_maildir::MaildirStore;
use relay_types::{IndexedMessageRow, MessageId, MessageStatus, RelayError};
use rusqlite::{params, Connection, OptionalExtension};

/// Optional filters for `query_messages`. `None` fields are unconstrained.
#[derive(Debug, Clone, Default)]
pub struct QueryFilters {
    pub subject: Option<String>,
    pub endpoint_hash: Option<String>,
    pub status: Option<MessageStatus>,
}

/// A page of `query_messages` results. `next_cursor` is set only when there
/// is a next page.
#[derive(Debug, Clone)]
pub struct QueryPage {
    pub messages: Vec<IndexedMessageRow>,
    pub next_cursor: Option<MessageId>,
}

/// Aggregate counts used by operator tooling and the backpressure signal.
#[derive(Debug, Clone, Default)]
pub struct IndexMetrics {
    pub total_messages: u64,
    pub by_status: BTreeMap<String, u64>,
    /// (subject, count), sorted by volume descending.
    pub by_subject: Vec<(String, u64)>,
}

/// Derived index over the Maildir store, opened in WAL mode so readers
/// never block behind a writer.
pub struct SqliteIndex {
    conn: Mutex<Connection>,
}

impl SqliteIndex {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, RelayError> {
        let conn = Connection::open(path).map_err(db_err)?;
        Self::from_connection(conn)
    }

    pub fn open_in_memory() -> Result<Self, RelayError> {
        let conn = Connection::open_in_memory().map_err(db_err)?;
        Self::from_connection(conn)
    }

    fn from_connection(conn: Connection) -> Result<Self, RelayError> {
        conn.pragma_update(None, "journal_mode", "WAL")
            .map_err(db_err)?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS messages (
                id TEXT PRIMARY KEY,
                subject TEXT NOT NULL,
                endpoint_hash TEXT NOT NULL,
                status TEXT NOT NULL,
                created_at TEXT NOT NULL,
                expires_at TEXT,
                sender TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_messages_subject ON messages(subject);
            CREATE INDEX IF NOT EXISTS idx_messages_endpoint_hash ON messages(endpoint_hash);
            CREATE INDEX IF NOT EXISTS idx_messages_status_endpoint ON messages(status, endpoint_hash);",
        )
        .map_err(db_err)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Upsert on `id`; re-indexing the same file is safe.
    pub fn insert_message(&self, row: &IndexedMessageRow) -> Result<(), RelayError> {
        let conn = self.conn.lock().expect("index mutex poisoned");
        conn.execute(
            "INSERT INTO messages (id, subject, endpoint_hash, status, created_at, expires_at, sender)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
             ON CONFLICT(id) DO UPDATE SET
                subject = excluded.subject,
                endpoint_hash = excluded.endpoint_hash,
                status = excluded.status,
                created_at = excluded.created_at,
                expires_at = excluded.expires_at,
                sender = excluded.sender",
            params![
                row.id.to_string(),
                row.subject,
                row.endpoint_hash,
                row.status.to_string(),
                row.created_at.to_rfc3339(),
                row.expires_at.map(|t| t.to_rfc3339()),
                row.sender,
            ],
        )
        .map_err(db_err)?;
        Ok(())
    }

    /// Returns whether a row actually changed status.
    pub fn update_status(&self, id: MessageId, new_status: MessageStatus) -> Result<bool, RelayError> {
        let conn = self.conn.lock().expect("index mutex poisoned");
        let changed = conn
            .execute(
                "UPDATE messages SET status = ?1 WHERE id = ?2 AND status != ?1",
                params![new_status.to_string(), id.to_string()],
            )
            .map_err(db_err)?;
        Ok(changed > 0)
    }

    pub fn get_by_subject(&self, subject: &str) -> Result<Vec<IndexedMessageRow>, RelayError> {
        let conn = self.conn.lock().expect("index mutex poisoned");
        query_rows(
            &conn,
            "SELECT id, subject, endpoint_hash, status, created_at, expires_at, sender
             FROM messages WHERE subject = ?1 ORDER BY created_at DESC",
            params![subject],
        )
    }

    pub fn get_by_endpoint(&self, endpoint_hash: &str) -> Result<Vec<IndexedMessageRow>, RelayError> {
        let conn = self.conn.lock().expect("index mutex poisoned");
        query_rows(
            &conn,
            "SELECT id, subject, endpoint_hash, status, created_at, expires_at, sender
             FROM messages WHERE endpoint_hash = ?1 ORDER BY created_at DESC",
            params![endpoint_hash],
        )
    }

    /// Used by backpressure: count of `status = 'pending'` rows for an
    /// endpoint (the caller writes to `new/` then inserts with `pending`,
    /// so this tracks mailbox depth without a directory walk).
    pub fn count_new_by_endpoint(&self, endpoint_hash: &str) -> Result<u64, RelayError> {
        let conn = self.conn.lock().expect("index mutex poisoned");
        let count: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM messages WHERE endpoint_hash = ?1 AND status = 'pending'",
                params![endpoint_hash],
                |r| r.get(0),
            )
            .map_err(db_err)?;
        Ok(count as u64)
    }

    /// Used by the rate limiter when it's configured to count via the index
    /// rather than keep its own in-memory log.
    pub fn count_sender_in_window(
        &self,
        sender: &str,
        window_start: DateTime<Utc>,
    ) -> Result<u64, RelayError> {
        let conn = self.conn.lock().expect("index mutex poisoned");
        let count: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM messages WHERE sender = ?1 AND created_at >= ?2",
                params![sender, window_start.to_rfc3339()],
                |r| r.get(0),
            )
            .map_err(db_err)?;
        Ok(count as u64)
    }

    /// Cursor is the smallest `id` already returned; results ordered by `id`
    /// descending. `next_cursor` is set only when another page exists.
    pub fn query_messages(
        &self,
        filters: &QueryFilters,
        cursor: Option<MessageId>,
        limit: usize,
    ) -> Result<QueryPage, RelayError> {
        let conn = self.conn.lock().expect("index mutex poisoned");

        let mut sql = String::from(
            "SELECT id, subject, endpoint_hash, status, created_at, expires_at, sender FROM messages WHERE 1=1",
        );
        let mut bound: Vec<String> = Vec::new();

        if let Some(subject) = &filters.subject {
            sql.push_str(" AND subject = ?");
            bound.push(subject.clone());
        }
        if let Some(hash) = &filters.endpoint_hash {
            sql.push_str(" AND endpoint_hash = ?");
            bound.push(hash.clone());
        }
        if let Some(status) = &filters.status {
            sql.push_str(" AND status = ?");
            bound.push(status.to_string());
        }
        if let Some(cursor) = cursor {
            sql.push_str(" AND id < ?");
            bound.push(cursor.to_string());
        }
        sql.push_str(" ORDER BY id DESC LIMIT ?");

        let fetch_limit = limit as i64 + 1;
        let mut stmt = conn.prepare(&sql).map_err(db_err)?;
        let param_refs: Vec<&dyn rusqlite::ToSql> = bound
            .iter()
            .map(|s| s as &dyn rusqlite::ToSql)
            .chain(std::iter::once(&fetch_limit as &dyn rusqlite::ToSql))
            .collect();

        let mut rows = stmt
            .query_map(param_refs.as_slice(), row_to_message)
            .map_err(db_err)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(db_err)?;

        let next_cursor = if rows.len() > limit {
            rows.truncate(limit);
            rows.last().map(|r| r.id)
        } else {
            None
        };

        Ok(QueryPage {
            messages: rows,
            next_cursor,
        })
    }

    /// Removes a single row by id. Used by DLQ purge; a no-op if the row
    /// was never indexed.
    pub fn delete_row(&self, id: MessageId) -> Result<(), RelayError> {
        let conn = self.conn.lock().expect("index mutex poisoned");
        conn.execute("DELETE FROM messages WHERE id = ?1", params![id.to_string()])
            .map_err(db_err)?;
        Ok(())
    }

    /// Removes rows with a non-null `expires_at` before `now`. Returns the
    /// count removed.
    pub fn delete_expired(&self, now: DateTime<Utc>) -> Result<u64, RelayError> {
        let conn = self.conn.lock().expect("index mutex poisoned");
        let count = conn
            .execute(
                "DELETE FROM messages WHERE expires_at IS NOT NULL AND expires_at < ?1",
                params![now.to_rfc3339()],
            )
            .map_err(db_err)?;
        Ok(count as u64)
    }

    pub fn get_metrics(&self) -> Result<IndexMetrics, RelayError> {
        let conn = self.conn.lock().expect("index mutex poisoned");

        let total: i64 = conn
            .query_row("SELECT COUNT(*) FROM messages", [], |r| r.get(0))
            .map_err(db_err)?;

        let mut by_status = BTreeMap::new();
        let mut stmt = conn
            .prepare("SELECT status, COUNT(*) FROM messages GROUP BY status")
            .map_err(db_err)?;
        let rows = stmt
            .query_map([], |r| Ok((r.get::<_, String>(0)?, r.get::<_, i64>(1)?)))
            .map_err(db_err)?;
        for row in rows {
            let (status, count) = row.map_err(db_err)?;
            by_status.insert(status, count as u64);
        }

        let mut by_subject = Vec::new();
        let mut stmt = conn
            .prepare("SELECT subject, COUNT(*) c FROM messages GROUP BY subject ORDER BY c DESC")
            .map_err(db_err)?;
        let rows = stmt
            .query_map([], |r| Ok((r.get::<_, String>(0)?, r.get::<_, i64>(1)?)))
            .map_err(db_err)?;
        for row in rows {
            let (subject, count) = row.map_err(db_err)?;
            by_subject.push((subject, count as u64));
        }

        Ok(IndexMetrics {
            total_messages: total as u64,
            by_status,
            by_subject,
        })
    }

    /// Drops all rows, walks every endpoint's `new/` -> pending, `cur/` ->
    /// delivered, `failed/` -> failed, and re-inserts. `hash_to_subject`
    /// resolves each endpoint hash to the subject recorded in its rows
    /// (the envelope's own `subject` field is the source of truth per row,
    /// but the hash alone doesn't tell us which directories to walk without
    /// this map).
    pub fn rebuild(
        &self,
        maildir: &MaildirStore,
        hash_to_subject: &BTreeMap<String, String>,
    ) -> Result<(), RelayError> {
        {
            let conn = self.conn.lock().expect("index mutex poisoned");
            conn.execute("DELETE FROM messages", []).map_err(db_err)?;
        }

        for hash in hash_to_subject.keys() {
            for (subdir, status) in [
                ("new", MessageStatus::Pending),
                ("cur", MessageStatus::Delivered),
                ("failed", MessageStatus::Failed),
            ] {
                let ids = match subdir {
                    "new" => maildir.list_new(hash)?,
                    "cur" => maildir.list_current(hash)?,
                    _ => maildir.list_failed(hash)?,
                };
                for id in ids {
                    if let Some(envelope) = maildir.read_envelope(hash, subdir, id)? {
                        self.insert_message(&IndexedMessageRow {
                            id,
                            subject: envelope.subject,
                            endpoint_hash: hash.clone(),
                            status,
                            created_at: envelope.created_at,
                            expires_at: None,
                            sender: Some(envelope.from),
                        })?;
                    }
                }
            }
        }
        Ok(())
    }
}

fn query_rows(
    conn: &Connection,
    sql: &str,
    params: impl rusqlite::Params,
) -> Result<Vec<IndexedMessageRow>, RelayError> {
    let mut stmt = conn.prepare(sql).map_err(db_err)?;
    let rows = stmt
        .query_map(params, row_to_message)
        .map_err(db_err)?
        .collect::<Result<Vec<_>, _>>()
        .map_err(db_err)?;
    Ok(rows)
}

fn row_to_message(row: &rusqlite::Row<'_>) -> rusqlite::Result<IndexedMessageRow> {
    let id: String = row.get(0)?;
    let status: String = row.get(3)?;
    let created_at: String = row.get(4)?;
    let expires_at: Option<String> = row.get(5)?;

    Ok(IndexedMessageRow {
        id: id.parse().unwrap_or_default(),
        subject: row.get(1)?,
        endpoint_hash: row.get(2)?,
        status: parse_status(&status),
        created_at: parse_timestamp(&created_at),
        expires_at: expires_at.as_deref().map(parse_timestamp),
        sender: row.get(6)?,
    })
}

fn parse_status(s: &str) -> MessageStatus {
    match s {
        "delivered" => MessageStatus::Delivered,
        "failed" => MessageStatus::Failed,
        _ => MessageStatus::Pending,
    }
}

fn parse_timestamp(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|t| t.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

fn db_err(e: rusqlite::Error) -> RelayError {
    RelayError::Database(e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use relay_types::MessageId as Id;
    use std::collections::BTreeMap;

    fn row(subject: &str, hash: &str, status: MessageStatus) -> IndexedMessageRow {
        IndexedMessageRow {
            id: Id::new(),
            subject: subject.to_string(),
            endpoint_hash: hash.to_string(),
            status,
            created_at: Utc::now(),
            expires_at: None,
            sender: Some("sys".to_string()),
        }
    }

    #[test]
    fn insert_is_idempotent() {
        let index = SqliteIndex::open_in_memory().unwrap();
        let r = row("relay.agent.alice", "h1", MessageStatus::Pending);
        index.insert_message(&r).unwrap();
        index.insert_message(&r).unwrap();
        assert_eq!(index.get_metrics().unwrap().total_messages, 1);
    }

    #[test]
    fn update_status_reports_change() {
        let index = SqliteIndex::open_in_memory().unwrap();
        let r = row("relay.agent.alice", "h1", MessageStatus::Pending);
        index.insert_message(&r).unwrap();
        assert!(index.update_status(r.id, MessageStatus::Delivered).unwrap());
        assert!(!index.update_status(r.id, MessageStatus::Delivered).unwrap());
    }

    #[test]
    fn count_new_by_endpoint_only_counts_pending() {
        let index = SqliteIndex::open_in_memory().unwrap();
        index
            .insert_message(&row("relay.agent.alice", "h1", MessageStatus::Pending))
            .unwrap();
        index
            .insert_message(&row("relay.agent.alice", "h1", MessageStatus::Delivered))
            .unwrap();
        assert_eq!(index.count_new_by_endpoint("h1").unwrap(), 1);
    }

    #[test]
    fn query_messages_paginates_by_id_descending() {
        let index = SqliteIndex::open_in_memory().unwrap();
        let mut ids = Vec::new();
        for _ in 0..5 {
            let r = row("relay.agent.alice", "h1", MessageStatus::Pending);
            ids.push(r.id);
            index.insert_message(&r).unwrap();
        }
        ids.sort();
        ids.reverse();

        let page1 = index
            .query_messages(&QueryFilters::default(), None, 2)
            .unwrap();
        assert_eq!(page1.messages.len(), 2);
        assert_eq!(page1.messages[0].id, ids[0]);
        assert_eq!(page1.messages[1].id, ids[1]);
        assert!(page1.next_cursor.is_some());

        let page2 = index
            .query_messages(&QueryFilters::default(), page1.next_cursor, 2)
            .unwrap();
        assert_eq!(page2.messages[0].id, ids[2]);

        let page3 = index
            .query_messages(&QueryFilters::default(), page2.next_cursor, 2)
            .unwrap();
        assert_eq!(page3.messages.len(), 1);
        assert!(page3.next_cursor.is_none());
    }

    #[test]
    fn delete_expired_removes_only_expired_rows() {
        let index = SqliteIndex::open_in_memory().unwrap();
        let mut expired = row("relay.agent.alice", "h1", MessageStatus::Pending);
        expired.expires_at = Some(Utc::now() - chrono::Duration::seconds(10));
        let mut live = row("relay.agent.alice", "h1", MessageStatus::Pending);
        live.expires_at = Some(Utc::now() + chrono::Duration::seconds(1000));
        index.insert_message(&expired).unwrap();
        index.insert_message(&live).unwrap();

        let removed = index.delete_expired(Utc::now()).unwrap();
        assert_eq!(removed, 1);
        assert_eq!(index.get_metrics().unwrap().total_messages, 1);
    }

    #[test]
    fn rebuild_matches_directory_contents() {
        let dir = tempfile::tempdir().unwrap();
        let maildir = MaildirStore::new(dir.path());
        maildir.ensure_endpoint_dirs("h1").unwrap();

        let env = relay_types::Envelope {
            id: Id::new(),
            subject: "relay.agent.alice".to_string(),
            from: "sys".to_string(),
            reply_to: None,
            created_at: Utc::now(),
            budget: relay_types::Budget::new(9_999_999_999_999),
            payload: serde_json::json!({}),
            extra: BTreeMap::new(),
        };
        maildir.write("h1", &env).unwrap();

        let index = SqliteIndex::open_in_memory().unwrap();
        let mut map = BTreeMap::new();
        map.insert("h1".to_string(), "relay.agent.alice".to_string());
        index.rebuild(&maildir, &map).unwrap();

        assert_eq!(index.get_metrics().unwrap().total_messages, 1);
        assert_eq!(index.count_new_by_endpoint("h1").unwrap(), 1);
    }
}
