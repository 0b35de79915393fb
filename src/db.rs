use chrono::{DateTime, SecondsFormat, SubsecRound, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, Row, TransactionBehavior};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{info, warn};

use crate::config::Config;
use crate::error::LedgerResult;
use crate::grouping::COW_GROUP_CAPACITY;
use crate::store::SqliteStore;

// ============================================================================
// DATABASE HANDLE
// ============================================================================

/// Shared handle to the ledger database.
///
/// Built once at process start and passed to every component. Cloning is
/// cheap; all clones share one connection behind a mutex.
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    /// Open (or create) the database file named by the config
    pub fn open(config: &Config) -> LedgerResult<Self> {
        let conn = Connection::open(&config.database_path)?;
        conn.busy_timeout(config.busy_timeout())?;
        setup_database(&conn)?;

        info!(path = %config.database_path.display(), "database ready");
        Ok(Self::from_connection(conn))
    }

    /// Fresh private database, used by tests and dry runs
    pub fn open_in_memory() -> LedgerResult<Self> {
        let conn = Connection::open_in_memory()?;
        setup_database(&conn)?;
        Ok(Self::from_connection(conn))
    }

    pub fn from_connection(conn: Connection) -> Self {
        Database {
            conn: Arc::new(Mutex::new(conn)),
        }
    }

    /// Run `work` inside one write transaction.
    ///
    /// The transaction begins IMMEDIATE, so the write lock is held from the
    /// first read onward. `Ok` commits; `Err` rolls back. A panic inside
    /// `work` drops the transaction, which also rolls back.
    pub fn transaction<T, F>(&self, work: F) -> LedgerResult<T>
    where
        F: FnOnce(&SqliteStore<'_>) -> LedgerResult<T>,
    {
        let mut conn = self.lock();
        run_in_transaction(&mut conn, work)
    }

    /// Read-only access outside an explicit transaction
    pub fn read<T, F>(&self, f: F) -> LedgerResult<T>
    where
        F: FnOnce(&Connection) -> LedgerResult<T>,
    {
        let conn = self.lock();
        f(&conn)
    }

    fn lock(&self) -> MutexGuard<'_, Connection> {
        // A poisoned lock means a unit of work panicked; its transaction was
        // already rolled back on drop, so the connection itself is usable.
        self.conn.lock().unwrap_or_else(|poisoned| {
            warn!("recovering database lock after a panicked transaction");
            poisoned.into_inner()
        })
    }
}

/// Scoped transaction over a bare connection (commit on Ok, rollback otherwise)
pub fn run_in_transaction<T, F>(conn: &mut Connection, work: F) -> LedgerResult<T>
where
    F: FnOnce(&SqliteStore<'_>) -> LedgerResult<T>,
{
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

    match work(&SqliteStore::new(&tx)) {
        Ok(value) => {
            tx.commit()?;
            Ok(value)
        }
        Err(err) => {
            if let Err(rollback_err) = tx.rollback() {
                warn!(error = %rollback_err, "rollback failed");
            }
            Err(err)
        }
    }
}

// ============================================================================
// SCHEMA
// ============================================================================

pub fn setup_database(conn: &Connection) -> LedgerResult<()> {
    // WAL for crash recovery (in-memory databases report "memory" instead)
    let _mode: String =
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
    conn.pragma_update(None, "foreign_keys", "ON")?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS donors (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            first_name TEXT NOT NULL,
            last_name TEXT NOT NULL,
            whatsapp_number TEXT NOT NULL,
            created_at TEXT NOT NULL
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS donations (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            donor_id INTEGER NOT NULL REFERENCES donors(id) ON DELETE CASCADE,
            price REAL NOT NULL,
            kind TEXT NOT NULL CHECK (kind IN ('sheep', 'cow')),
            status TEXT NOT NULL DEFAULT 'pending'
                CHECK (status IN ('pending', 'sending', 'done')),
            created_at TEXT NOT NULL,
            completed_at TEXT
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS cow_groups (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            created_at TEXT NOT NULL
        )",
        [],
    )?;

    // One share per donation: donation_id is the key
    conn.execute(
        "CREATE TABLE IF NOT EXISTS cow_shares (
            donation_id INTEGER PRIMARY KEY REFERENCES donations(id) ON DELETE CASCADE,
            cow_group_id INTEGER NOT NULL REFERENCES cow_groups(id),
            created_at TEXT NOT NULL
        )",
        [],
    )?;

    conn.execute(
        &format!(
            "CREATE TRIGGER IF NOT EXISTS cow_shares_capacity
             BEFORE INSERT ON cow_shares
             WHEN (SELECT COUNT(*) FROM cow_shares WHERE cow_group_id = NEW.cow_group_id) >= {}
             BEGIN
                SELECT RAISE(ABORT, 'cow group is full');
             END",
            COW_GROUP_CAPACITY
        ),
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS agents (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            agent_name TEXT NOT NULL,
            created_at TEXT NOT NULL
        )",
        [],
    )?;

    // One active assignment per donation: donation_id is the key
    conn.execute(
        "CREATE TABLE IF NOT EXISTS agent_donations (
            donation_id INTEGER PRIMARY KEY REFERENCES donations(id) ON DELETE CASCADE,
            agent_id INTEGER NOT NULL REFERENCES agents(id) ON DELETE CASCADE,
            assigned_at TEXT NOT NULL
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS events (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            event_id TEXT UNIQUE NOT NULL,
            timestamp TEXT NOT NULL,
            event_type TEXT NOT NULL,
            entity_type TEXT NOT NULL,
            entity_id TEXT NOT NULL,
            data TEXT NOT NULL
        )",
        [],
    )?;

    // ==========================================================================
    // Indexes
    // ==========================================================================
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_donations_kind_status ON donations(kind, status, created_at)",
        [],
    )?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_donations_donor ON donations(donor_id)",
        [],
    )?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_cow_shares_group ON cow_shares(cow_group_id)",
        [],
    )?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_agent_donations_agent ON agent_donations(agent_id)",
        [],
    )?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_events_entity ON events(entity_type, entity_id)",
        [],
    )?;

    Ok(())
}

// ============================================================================
// TIMESTAMPS
// ============================================================================

/// Fixed-width RFC 3339 so that text order is chronological order
pub fn format_timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Current time at the precision the store keeps
pub fn now() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(6)
}

pub fn now_timestamp() -> String {
    format_timestamp(now())
}

pub(crate) fn timestamp_column(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let raw: String = row.get(idx)?;
    parse_timestamp(idx, &raw)
}

pub(crate) fn optional_timestamp_column(
    row: &Row<'_>,
    idx: usize,
) -> rusqlite::Result<Option<DateTime<Utc>>> {
    let raw: Option<String> = row.get(idx)?;
    raw.map(|s| parse_timestamp(idx, &s)).transpose()
}

fn parse_timestamp(idx: usize, raw: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

// ============================================================================
// AUDIT TRAIL
// ============================================================================

/// Audit record written alongside every state change
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Event {
    pub event_id: String,
    pub timestamp: DateTime<Utc>,
    pub event_type: String,
    pub entity_type: String,
    pub entity_id: String,
    pub data: serde_json::Value,
}

impl Event {
    pub fn new(event_type: &str, entity_type: &str, entity_id: impl ToString, data: serde_json::Value) -> Self {
        Self {
            event_id: uuid::Uuid::new_v4().to_string(),
            timestamp: now(),
            event_type: event_type.to_string(),
            entity_type: entity_type.to_string(),
            entity_id: entity_id.to_string(),
            data,
        }
    }
}

pub fn insert_event(conn: &Connection, event: &Event) -> LedgerResult<()> {
    let data_json = serde_json::to_string(&event.data)?;

    conn.execute(
        "INSERT INTO events (event_id, timestamp, event_type, entity_type, entity_id, data)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            event.event_id,
            format_timestamp(event.timestamp),
            event.event_type,
            event.entity_type,
            event.entity_id,
            data_json,
        ],
    )?;

    Ok(())
}

/// Events for one entity, newest first
pub fn get_events_for_entity(
    conn: &Connection,
    entity_type: &str,
    entity_id: &str,
) -> LedgerResult<Vec<Event>> {
    let mut stmt = conn.prepare(
        "SELECT event_id, timestamp, event_type, entity_type, entity_id, data
         FROM events
         WHERE entity_type = ?1 AND entity_id = ?2
         ORDER BY timestamp DESC, id DESC",
    )?;

    let events = stmt
        .query_map(params![entity_type, entity_id], |row| {
            let data_json: String = row.get(5)?;

            Ok(Event {
                event_id: row.get(0)?,
                timestamp: timestamp_column(row, 1)?,
                event_type: row.get(2)?,
                entity_type: row.get(3)?,
                entity_id: row.get(4)?,
                data: serde_json::from_str(&data_json).map_err(|e| {
                    rusqlite::Error::FromSqlConversionFailure(5, Type::Text, Box::new(e))
                })?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;

    Ok(events)
}
