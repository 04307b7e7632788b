//! SQLite-backed operation store — survives restarts.
//!
//! Each row keeps the full JSON record plus the columns the engine filters
//! and orders on. The one-active-operation-per-target rule is a partial
//! unique index, so it holds across processes sharing the file.

use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use rally_core::error::{RallyError, Result};
use rally_core::types::{MessageStatus, Operation, ScheduledMessage};
use rusqlite::{Connection, ErrorCode, OptionalExtension, params};

use crate::store::{
    Commit, DeleteOutcome, MessageMutator, OperationMutator, OperationStore, sort_messages,
};

/// SQLite-backed persistence store for operations, history and messages.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

fn db_err(context: &'static str) -> impl FnOnce(rusqlite::Error) -> RallyError {
    move |e| RallyError::Persistence(format!("{context}: {e}"))
}

fn is_constraint(e: &rusqlite::Error) -> bool {
    matches!(e, rusqlite::Error::SqliteFailure(err, _) if err.code == ErrorCode::ConstraintViolation)
}

fn decode<T: serde::de::DeserializeOwned>(kind: &str, record: &str) -> Result<T> {
    serde_json::from_str(record)
        .map_err(|e| RallyError::Persistence(format!("Corrupt {kind} record: {e}")))
}

impl SqliteStore {
    /// Open or create the store database.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path).map_err(db_err("DB open"))?;
        conn.execute_batch("PRAGMA journal_mode = WAL; PRAGMA busy_timeout = 5000;")
            .map_err(db_err("DB pragmas"))?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.migrate()?;
        tracing::debug!("🗄️ Operation store opened at {}", path.display());
        Ok(store)
    }

    /// Private in-memory database, mainly for tests.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(db_err("DB open"))?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.migrate()?;
        Ok(store)
    }

    /// Run migrations to create tables.
    fn migrate(&self) -> Result<()> {
        self.lock()?
            .execute_batch(
                "
            -- Live operations (active only in practice; terminal ones move to history)
            CREATE TABLE IF NOT EXISTS operations (
                id TEXT PRIMARY KEY,
                target_id TEXT NOT NULL,
                status TEXT NOT NULL,           -- 'active', 'completed', 'cancelled'
                phase INTEGER NOT NULL,
                start_ms INTEGER NOT NULL,
                record TEXT NOT NULL            -- JSON Operation
            );
            CREATE UNIQUE INDEX IF NOT EXISTS idx_operations_active_target
                ON operations(target_id) WHERE status = 'active';

            -- Append-only archive of finished operations
            CREATE TABLE IF NOT EXISTS history (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                id TEXT NOT NULL,
                target_id TEXT NOT NULL,
                status TEXT NOT NULL,
                ended_ms INTEGER,
                record TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_history_target ON history(target_id);

            -- Planned deliveries
            CREATE TABLE IF NOT EXISTS scheduled_messages (
                id TEXT PRIMARY KEY,
                operation_id TEXT NOT NULL,
                status TEXT NOT NULL,           -- 'pending', 'ready'
                scheduled_ms INTEGER NOT NULL,
                record TEXT NOT NULL            -- JSON ScheduledMessage
            );
            CREATE INDEX IF NOT EXISTS idx_messages_status_due
                ON scheduled_messages(status, scheduled_ms);
            CREATE INDEX IF NOT EXISTS idx_messages_operation
                ON scheduled_messages(operation_id);
         ",
            )
            .map_err(db_err("Migration"))
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| RallyError::Persistence("sqlite store lock poisoned".into()))
    }
}

fn insert_operation(conn: &Connection, op: &Operation) -> Result<()> {
    conn.execute(
        "INSERT INTO operations (id, target_id, status, phase, start_ms, record)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            op.id,
            op.target_id,
            op.status.as_str(),
            op.phase,
            op.start_time.timestamp_millis(),
            serde_json::to_string(op)?,
        ],
    )
    .map_err(|e| conflict_or(e, op, "Insert operation"))?;
    Ok(())
}

fn save_operation(conn: &Connection, op: &Operation) -> Result<()> {
    conn.execute(
        "UPDATE operations SET target_id = ?2, status = ?3, phase = ?4, start_ms = ?5, record = ?6
         WHERE id = ?1",
        params![
            op.id,
            op.target_id,
            op.status.as_str(),
            op.phase,
            op.start_time.timestamp_millis(),
            serde_json::to_string(op)?,
        ],
    )
    .map_err(|e| conflict_or(e, op, "Save operation"))?;
    Ok(())
}

// Plain INSERT/UPDATE only: OR REPLACE would silently evict the other
// active row from the partial unique index.
fn conflict_or(e: rusqlite::Error, op: &Operation, context: &str) -> RallyError {
    if is_constraint(&e) {
        RallyError::Conflict(format!(
            "target {} already has an active operation",
            op.target_id
        ))
    } else {
        RallyError::Persistence(format!("{context}: {e}"))
    }
}

fn write_message(conn: &Connection, msg: &ScheduledMessage) -> Result<()> {
    conn.execute(
        "INSERT OR REPLACE INTO scheduled_messages (id, operation_id, status, scheduled_ms, record)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![
            msg.id,
            msg.operation_id,
            msg.status.as_str(),
            msg.scheduled_at.timestamp_millis(),
            serde_json::to_string(msg)?,
        ],
    )
    .map_err(db_err("Save message"))?;
    Ok(())
}

fn read_operation(conn: &Connection, id: &str) -> Result<Option<Operation>> {
    let record: Option<String> = conn
        .query_row("SELECT record FROM operations WHERE id = ?1", [id], |r| r.get(0))
        .optional()
        .map_err(db_err("Load operation"))?;
    record.map(|r| decode("operation", &r)).transpose()
}

fn read_message(conn: &Connection, id: &str) -> Result<Option<ScheduledMessage>> {
    let record: Option<String> = conn
        .query_row(
            "SELECT record FROM scheduled_messages WHERE id = ?1",
            [id],
            |r| r.get(0),
        )
        .optional()
        .map_err(db_err("Load message"))?;
    record.map(|r| decode("message", &r)).transpose()
}

/// Run a record query and decode every row, skipping corrupt ones.
fn query_records<T: serde::de::DeserializeOwned>(
    conn: &Connection,
    kind: &str,
    sql: &str,
    args: &[&dyn rusqlite::ToSql],
) -> Result<Vec<T>> {
    let mut stmt = conn.prepare(sql).map_err(db_err("Prepare query"))?;
    let rows = stmt
        .query_map(args, |r| r.get::<_, String>(0))
        .map_err(db_err("Run query"))?;
    let mut out = Vec::new();
    for row in rows {
        let record = row.map_err(db_err("Read row"))?;
        match decode::<T>(kind, &record) {
            Ok(v) => out.push(v),
            Err(e) => tracing::warn!("⚠️ Skipping {kind} row: {e}"),
        }
    }
    Ok(out)
}

impl OperationStore for SqliteStore {
    fn create_operation(&self, op: &Operation, messages: &[ScheduledMessage]) -> Result<()> {
        let mut conn = self.lock()?;
        let tx = conn.transaction().map_err(db_err("Begin create"))?;
        let exists: bool = tx
            .query_row("SELECT 1 FROM operations WHERE id = ?1", [&op.id], |_| Ok(true))
            .optional()
            .map_err(db_err("Check operation"))?
            .unwrap_or(false);
        if exists {
            return Err(RallyError::Conflict(format!("operation {} already exists", op.id)));
        }
        insert_operation(&tx, op)?;
        for msg in messages {
            write_message(&tx, msg)?;
        }
        tx.commit().map_err(db_err("Commit create"))
    }

    fn get_operation(&self, id: &str) -> Result<Option<Operation>> {
        read_operation(&*self.lock()?, id)
    }

    fn list_active(&self) -> Result<Vec<Operation>> {
        query_records(
            &*self.lock()?,
            "operation",
            "SELECT record FROM operations WHERE status = 'active' ORDER BY start_ms, id",
            &[],
        )
    }

    fn list_active_by_target(&self, target_id: &str) -> Result<Vec<Operation>> {
        query_records(
            &*self.lock()?,
            "operation",
            "SELECT record FROM operations WHERE status = 'active' AND target_id = ?1
             ORDER BY start_ms, id",
            &[&target_id],
        )
    }

    fn update_operation(&self, id: &str, mutator: &mut OperationMutator<'_>) -> Result<Operation> {
        let mut conn = self.lock()?;
        let tx = conn.transaction().map_err(db_err("Begin update"))?;
        let current = read_operation(&tx, id)?
            .ok_or_else(|| RallyError::NotFound(format!("operation {id}")))?;
        let mut next = current.clone();
        match mutator(&mut next)? {
            Commit::Skip => Ok(current),
            Commit::Save { messages } => {
                save_operation(&tx, &next)?;
                for msg in &messages {
                    write_message(&tx, msg)?;
                }
                tx.commit().map_err(db_err("Commit update"))?;
                Ok(next)
            }
        }
    }

    fn archive_operation(&self, op: &Operation) -> Result<usize> {
        if op.is_active() {
            return Err(RallyError::InvalidState(format!(
                "operation {} must be completed or cancelled before archiving",
                op.id
            )));
        }
        let mut conn = self.lock()?;
        let tx = conn.transaction().map_err(db_err("Begin archive"))?;
        let current = read_operation(&tx, &op.id)?
            .ok_or_else(|| RallyError::NotFound(format!("operation {}", op.id)))?;
        if !current.is_active() {
            return Err(RallyError::InvalidState(format!(
                "operation {} is already {}",
                op.id, current.status
            )));
        }
        tx.execute("DELETE FROM operations WHERE id = ?1", [&op.id])
            .map_err(db_err("Archive operation"))?;
        tx.execute(
            "INSERT INTO history (id, target_id, status, ended_ms, record)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                op.id,
                op.target_id,
                op.status.as_str(),
                op.end_time.map(|t| t.timestamp_millis()),
                serde_json::to_string(op)?,
            ],
        )
        .map_err(db_err("Append history"))?;
        let purged = tx
            .execute(
                "DELETE FROM scheduled_messages WHERE operation_id = ?1",
                [&op.id],
            )
            .map_err(db_err("Purge messages"))?;
        tx.commit().map_err(db_err("Commit archive"))?;
        Ok(purged)
    }

    fn remove_operation(&self, id: &str) -> Result<bool> {
        let n = self
            .lock()?
            .execute("DELETE FROM operations WHERE id = ?1", [id])
            .map_err(db_err("Delete operation"))?;
        Ok(n > 0)
    }

    fn get_history(&self, id: &str) -> Result<Option<Operation>> {
        let conn = self.lock()?;
        let record: Option<String> = conn
            .query_row(
                "SELECT record FROM history WHERE id = ?1 ORDER BY seq DESC LIMIT 1",
                [id],
                |r| r.get(0),
            )
            .optional()
            .map_err(db_err("Load history"))?;
        record.map(|r| decode("history", &r)).transpose()
    }

    fn list_history_by_target(&self, target_id: &str) -> Result<Vec<Operation>> {
        query_records(
            &*self.lock()?,
            "history",
            "SELECT record FROM history WHERE target_id = ?1 ORDER BY seq",
            &[&target_id],
        )
    }

    fn insert_messages(&self, messages: &[ScheduledMessage]) -> Result<()> {
        let mut conn = self.lock()?;
        let tx = conn.transaction().map_err(db_err("Begin insert"))?;
        for msg in messages {
            write_message(&tx, msg)?;
        }
        tx.commit().map_err(db_err("Commit insert"))
    }

    fn get_message(&self, id: &str) -> Result<Option<ScheduledMessage>> {
        read_message(&*self.lock()?, id)
    }

    fn update_message(
        &self,
        id: &str,
        mutator: &mut MessageMutator<'_>,
    ) -> Result<Option<ScheduledMessage>> {
        let mut conn = self.lock()?;
        let tx = conn.transaction().map_err(db_err("Begin message update"))?;
        let Some(current) = read_message(&tx, id)? else {
            return Ok(None);
        };
        let mut next = current.clone();
        if !mutator(&mut next)? {
            return Ok(Some(current));
        }
        write_message(&tx, &next)?;
        tx.commit().map_err(db_err("Commit message update"))?;
        Ok(Some(next))
    }

    fn delete_message(&self, id: &str) -> Result<bool> {
        let n = self
            .lock()?
            .execute("DELETE FROM scheduled_messages WHERE id = ?1", [id])
            .map_err(db_err("Delete message"))?;
        Ok(n > 0)
    }

    fn delete_message_in_status(&self, id: &str, status: MessageStatus) -> Result<DeleteOutcome> {
        let mut conn = self.lock()?;
        let tx = conn.transaction().map_err(db_err("Begin guarded delete"))?;
        let Some(current) = read_message(&tx, id)? else {
            return Ok(DeleteOutcome::Missing);
        };
        if current.status != status {
            return Ok(DeleteOutcome::WrongStatus(current.status));
        }
        tx.execute("DELETE FROM scheduled_messages WHERE id = ?1", [id])
            .map_err(db_err("Delete message"))?;
        tx.commit().map_err(db_err("Commit guarded delete"))?;
        Ok(DeleteOutcome::Deleted)
    }

    fn list_messages_by_status(&self, status: MessageStatus) -> Result<Vec<ScheduledMessage>> {
        let mut messages: Vec<ScheduledMessage> = query_records(
            &*self.lock()?,
            "message",
            "SELECT record FROM scheduled_messages WHERE status = ?1 ORDER BY scheduled_ms, id",
            &[&status.as_str()],
        )?;
        // millisecond column ties are re-ordered on the full timestamp
        sort_messages(&mut messages);
        Ok(messages)
    }

    fn list_messages_for_operation(&self, operation_id: &str) -> Result<Vec<ScheduledMessage>> {
        let mut messages: Vec<ScheduledMessage> = query_records(
            &*self.lock()?,
            "message",
            "SELECT record FROM scheduled_messages WHERE operation_id = ?1 ORDER BY scheduled_ms, id",
            &[&operation_id],
        )?;
        sort_messages(&mut messages);
        Ok(messages)
    }
}
