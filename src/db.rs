use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use rusqlite::{params, Connection, OptionalExtension};

use crate::error::QueueError;
use crate::model::{Attachment, AttachmentState};

pub fn now_ms() -> i64 {
    use std::time::{SystemTime, UNIX_EPOCH};

    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis()
        .try_into()
        .unwrap_or(i64::MAX)
}

fn is_safe_sqlite_ident(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|ch| ch.is_ascii_alphanumeric() || ch == '_')
}

fn check_table_name(table: &str) -> Result<(), QueueError> {
    if is_safe_sqlite_ident(table) {
        Ok(())
    } else {
        Err(QueueError::Database(format!(
            "unsafe attachments table name: {table}"
        )))
    }
}

/// DDL for the attachment state table, for hosts that assemble their own
/// schema. Local-only: nothing here is meant to leave the device.
pub fn table_schema_sql(table: &str) -> Result<String, QueueError> {
    check_table_name(table)?;
    Ok(format!(
        r#"
CREATE TABLE IF NOT EXISTS "{table}" (
  id TEXT PRIMARY KEY,
  filename TEXT NOT NULL,
  media_type TEXT,
  state TEXT NOT NULL,
  timestamp INTEGER NOT NULL,
  size INTEGER,
  has_synced INTEGER NOT NULL DEFAULT 0,
  meta_data TEXT,
  local_uri TEXT
);
CREATE INDEX IF NOT EXISTS "idx_{table}_state_timestamp"
  ON "{table}"(state, timestamp);
"#
    ))
}

pub fn ensure_schema(conn: &Connection, table: &str) -> Result<(), QueueError> {
    conn.execute_batch(&table_schema_sql(table)?)?;
    Ok(())
}

/// Open a SQLite database the way the queue expects it: WAL journaling and
/// a busy timeout so the control plane and host writers can share it.
pub fn open(path: &Path) -> Result<Connection, QueueError> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)
                .map_err(|e| QueueError::Database(format!("create database dir: {e}")))?;
        }
    }
    let conn = Connection::open(path)?;
    conn.busy_timeout(Duration::from_millis(5_000))?;
    conn.pragma_update(None, "journal_mode", "WAL")?;
    Ok(conn)
}

type RawRow = (
    String,
    String,
    Option<String>,
    String,
    i64,
    Option<i64>,
    i64,
    Option<String>,
    Option<String>,
);

fn attachment_from_parts(parts: RawRow) -> Result<Attachment, QueueError> {
    let (id, filename, media_type, state, timestamp, size, has_synced, meta_data, local_uri) =
        parts;
    let state = AttachmentState::parse(&state)
        .ok_or_else(|| QueueError::Database(format!("unknown attachment state: {state}")))?;
    Ok(Attachment {
        id,
        filename,
        media_type,
        state,
        timestamp,
        size,
        has_synced: has_synced != 0,
        meta_data,
        local_uri,
    })
}

fn map_raw(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawRow> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
        row.get(6)?,
        row.get(7)?,
        row.get(8)?,
    ))
}

const SELECT_COLUMNS: &str =
    "id, filename, media_type, state, timestamp, size, has_synced, meta_data, local_uri";

pub fn get_row(conn: &Connection, table: &str, id: &str) -> Result<Option<Attachment>, QueueError> {
    let raw = conn
        .query_row(
            &format!(r#"SELECT {SELECT_COLUMNS} FROM "{table}" WHERE id = ?1"#),
            params![id],
            map_raw,
        )
        .optional()?;
    raw.map(attachment_from_parts).transpose()
}

pub fn all_rows(conn: &Connection, table: &str) -> Result<Vec<Attachment>, QueueError> {
    let mut stmt = conn.prepare(&format!(
        r#"SELECT {SELECT_COLUMNS} FROM "{table}" ORDER BY timestamp ASC, id ASC"#
    ))?;
    let mut rows = stmt.query([])?;
    let mut out = Vec::new();
    while let Some(row) = rows.next()? {
        out.push(attachment_from_parts(map_raw(row)?)?);
    }
    Ok(out)
}

pub fn rows_by_state(
    conn: &Connection,
    table: &str,
    state: AttachmentState,
) -> Result<Vec<Attachment>, QueueError> {
    let mut stmt = conn.prepare(&format!(
        r#"SELECT {SELECT_COLUMNS}
           FROM "{table}"
           WHERE state = ?1
           ORDER BY timestamp ASC, id ASC"#
    ))?;
    let mut rows = stmt.query(params![state.as_str()])?;
    let mut out = Vec::new();
    while let Some(row) = rows.next()? {
        out.push(attachment_from_parts(map_raw(row)?)?);
    }
    Ok(out)
}

/// Upsert one row, stamping `timestamp = now`. `has_synced` is sticky: once
/// a stored row has it set, no upsert clears it.
pub fn upsert_row(
    conn: &Connection,
    table: &str,
    attachment: &Attachment,
    now: i64,
) -> Result<Attachment, QueueError> {
    conn.execute(
        &format!(
            r#"
INSERT INTO "{table}"
  (id, filename, media_type, state, timestamp, size, has_synced, meta_data, local_uri)
VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
ON CONFLICT(id) DO UPDATE SET
  filename = excluded.filename,
  media_type = excluded.media_type,
  state = excluded.state,
  timestamp = excluded.timestamp,
  size = excluded.size,
  has_synced = CASE
    WHEN "{table}".has_synced = 1 OR excluded.has_synced = 1 THEN 1
    ELSE 0
  END,
  meta_data = excluded.meta_data,
  local_uri = excluded.local_uri
"#
        ),
        params![
            attachment.id,
            attachment.filename,
            attachment.media_type,
            attachment.state.as_str(),
            now,
            attachment.size,
            if attachment.has_synced { 1i64 } else { 0 },
            attachment.meta_data,
            attachment.local_uri,
        ],
    )?;

    get_row(conn, table, &attachment.id)?
        .ok_or_else(|| QueueError::Database("upserted row vanished".to_string()))
}

pub fn set_row_state(
    conn: &Connection,
    table: &str,
    id: &str,
    state: AttachmentState,
    now: i64,
) -> Result<bool, QueueError> {
    let updated = conn.execute(
        &format!(r#"UPDATE "{table}" SET state = ?2, timestamp = ?3 WHERE id = ?1"#),
        params![id, state.as_str(), now],
    )?;
    Ok(updated > 0)
}

pub fn delete_row(conn: &Connection, table: &str, id: &str) -> Result<bool, QueueError> {
    let deleted = conn.execute(
        &format!(r#"DELETE FROM "{table}" WHERE id = ?1"#),
        params![id],
    )?;
    Ok(deleted > 0)
}

/// Terminal write applied by the worker after an operation completes.
#[derive(Clone, Debug)]
pub enum Completion {
    SetState {
        state: AttachmentState,
        size: Option<i64>,
        mark_synced: bool,
        clear_local_uri: bool,
    },
    DeleteRow,
}

/// Transactional CRUD over the attachment state table. The only component
/// that mutates it.
#[derive(Clone)]
pub struct AttachmentRepository {
    conn: Arc<Mutex<Connection>>,
    table: String,
}

impl AttachmentRepository {
    pub fn new(conn: Arc<Mutex<Connection>>, table_name: &str) -> Result<Self, QueueError> {
        check_table_name(table_name)?;
        let repo = Self {
            conn,
            table: table_name.to_string(),
        };
        {
            let guard = repo.lock()?;
            ensure_schema(&guard, table_name)?;
        }
        Ok(repo)
    }

    pub fn table_name(&self) -> &str {
        &self.table
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>, QueueError> {
        self.conn
            .lock()
            .map_err(|_| QueueError::Database("poisoned connection lock".to_string()))
    }

    /// Run `f` inside a single `BEGIN IMMEDIATE` transaction. A failing
    /// closure rolls back; nothing partial becomes visible.
    pub fn with_tx<T>(
        &self,
        f: impl FnOnce(&Connection) -> Result<T, QueueError>,
    ) -> Result<T, QueueError> {
        let conn = self.lock()?;
        conn.execute_batch("BEGIN IMMEDIATE;")?;
        match f(&conn) {
            Ok(value) => {
                conn.execute_batch("COMMIT;")?;
                Ok(value)
            }
            Err(e) => {
                let _ = conn.execute_batch("ROLLBACK;");
                Err(e)
            }
        }
    }

    pub fn get(&self, id: &str) -> Result<Option<Attachment>, QueueError> {
        let conn = self.lock()?;
        get_row(&conn, &self.table, id)
    }

    pub fn get_all(&self) -> Result<Vec<Attachment>, QueueError> {
        let conn = self.lock()?;
        all_rows(&conn, &self.table)
    }

    pub fn get_by_state(&self, state: AttachmentState) -> Result<Vec<Attachment>, QueueError> {
        let conn = self.lock()?;
        rows_by_state(&conn, &self.table, state)
    }

    pub fn save(&self, attachment: &Attachment) -> Result<Attachment, QueueError> {
        self.save_with(attachment, |_, _| Ok(()))
    }

    /// Upsert inside one transaction; `link` runs on the same connection
    /// before commit so the host can atomically wire foreign keys. If it
    /// fails, no state change is visible.
    pub fn save_with<F>(&self, attachment: &Attachment, link: F) -> Result<Attachment, QueueError>
    where
        F: FnOnce(&Connection, &Attachment) -> anyhow::Result<()>,
    {
        self.with_tx(|conn| {
            let stored = upsert_row(conn, &self.table, attachment, now_ms())?;
            link(conn, &stored).map_err(QueueError::Callback)?;
            Ok(stored)
        })
    }

    pub fn delete(&self, id: &str) -> Result<bool, QueueError> {
        let conn = self.lock()?;
        delete_row(&conn, &self.table, id)
    }

    pub fn clear_all(&self) -> Result<(), QueueError> {
        let conn = self.lock()?;
        conn.execute(&format!(r#"DELETE FROM "{}""#, self.table), [])?;
        Ok(())
    }

    pub fn archived_count(&self) -> Result<i64, QueueError> {
        let conn = self.lock()?;
        let count: i64 = conn.query_row(
            &format!(r#"SELECT COUNT(*) FROM "{}" WHERE state = ?1"#, self.table),
            params![AttachmentState::Archived.as_str()],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    /// Delete the oldest archived rows beyond `limit` in one transaction and
    /// return them so the caller can unlink their files.
    pub fn evict_oldest_archived(&self, limit: i64) -> Result<Vec<Attachment>, QueueError> {
        let limit = limit.max(0);
        self.with_tx(|conn| {
            let count: i64 = conn.query_row(
                &format!(r#"SELECT COUNT(*) FROM "{}" WHERE state = ?1"#, self.table),
                params![AttachmentState::Archived.as_str()],
                |row| row.get(0),
            )?;
            let excess = count - limit;
            if excess <= 0 {
                return Ok(Vec::new());
            }

            let mut stmt = conn.prepare(&format!(
                r#"SELECT {SELECT_COLUMNS}
                   FROM "{}"
                   WHERE state = ?1
                   ORDER BY timestamp ASC, id ASC
                   LIMIT ?2"#,
                self.table
            ))?;
            let mut rows = stmt.query(params![AttachmentState::Archived.as_str(), excess])?;
            let mut evicted = Vec::new();
            while let Some(row) = rows.next()? {
                evicted.push(attachment_from_parts(map_raw(row)?)?);
            }
            drop(rows);
            drop(stmt);

            for att in &evicted {
                delete_row(conn, &self.table, &att.id)?;
            }
            Ok(evicted)
        })
    }

    /// Optimistic terminal write: re-reads the row and applies `completion`
    /// only if `(state, timestamp)` still match the snapshot the caller
    /// worked from. Returns whether the write was applied.
    pub fn complete_if_unchanged(
        &self,
        snapshot: &Attachment,
        completion: Completion,
    ) -> Result<bool, QueueError> {
        self.with_tx(|conn| {
            let current: Option<(String, i64)> = conn
                .query_row(
                    &format!(
                        r#"SELECT state, timestamp FROM "{}" WHERE id = ?1"#,
                        self.table
                    ),
                    params![snapshot.id],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )
                .optional()?;

            let Some((state, timestamp)) = current else {
                return Ok(false);
            };
            if state != snapshot.state.as_str() || timestamp != snapshot.timestamp {
                return Ok(false);
            }

            match completion {
                Completion::SetState {
                    state,
                    size,
                    mark_synced,
                    clear_local_uri,
                } => {
                    conn.execute(
                        &format!(
                            r#"
UPDATE "{}"
SET state = ?2,
    timestamp = ?3,
    size = CASE WHEN ?4 IS NULL THEN size ELSE ?4 END,
    has_synced = CASE WHEN ?5 = 1 THEN 1 ELSE has_synced END,
    local_uri = CASE WHEN ?6 = 1 THEN NULL ELSE local_uri END
WHERE id = ?1
"#,
                            self.table
                        ),
                        params![
                            snapshot.id,
                            state.as_str(),
                            now_ms(),
                            size,
                            if mark_synced { 1i64 } else { 0 },
                            if clear_local_uri { 1i64 } else { 0 },
                        ],
                    )?;
                }
                Completion::DeleteRow => {
                    delete_row(conn, &self.table, &snapshot.id)?;
                }
            }
            Ok(true)
        })
    }
}
