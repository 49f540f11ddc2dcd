use crate::campaign::BonusCampaign;
use crate::catalog::SaleItem;
use crate::error::CommitError;
use chrono::{DateTime, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};

/// One ledger transaction. Identity never changes; `stars` is only rewritten
/// by an edit or by reconciliation, and every rewrite bumps `version`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerEntry {
    /// Stable identity (UUID)
    pub id: String,

    /// Store-assigned, strictly increasing; breaks timestamp ties
    pub seq: i64,

    pub staff_id: String,
    pub category: String,
    pub service: String,

    /// Source amount for bracket-mapped categories
    #[serde(default)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub amount: Option<f64>,

    pub occurred_at: DateTime<Utc>,
    pub stars: i64,
    pub version: i64,

    #[serde(default)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub import_key: Option<String>,

    pub created_at: DateTime<Utc>,
}

impl LedgerEntry {
    /// How this entry's service should be re-resolved against the catalog.
    pub fn sale_item(&self) -> SaleItem {
        match self.amount {
            Some(amount) => SaleItem::Amount(amount),
            None => SaleItem::Service(self.service.clone()),
        }
    }

    /// Ordering used by every stacking sequence.
    pub fn order_key(&self) -> (DateTime<Utc>, i64) {
        (self.occurred_at, self.seq)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StaffRecord {
    pub id: String,
    pub name: String,
    /// Cached sum of this staff member's ledger stars
    pub stars: i64,
}

/// Event for audit trail ("Every change is an event")
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Event {
    pub event_id: String,
    pub timestamp: DateTime<Utc>,
    pub event_type: String,
    pub entity_type: String,
    pub entity_id: String,
    pub data: serde_json::Value,
    pub actor: String,
}

impl Event {
    pub fn new(
        event_type: &str,
        entity_type: &str,
        entity_id: &str,
        data: serde_json::Value,
        actor: &str,
    ) -> Self {
        Self {
            event_id: uuid::Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            event_type: event_type.to_string(),
            entity_type: entity_type.to_string(),
            entity_id: entity_id.to_string(),
            data,
            actor: actor.to_string(),
        }
    }
}

pub fn setup_database(conn: &Connection) -> rusqlite::Result<()> {
    // Enable WAL mode for crash recovery
    conn.pragma_update(None, "journal_mode", "WAL")?;
    conn.pragma_update(None, "foreign_keys", "ON")?;

    // ==========================================================================
    // Staff (owns the cached star aggregate)
    // ==========================================================================
    conn.execute(
        "CREATE TABLE IF NOT EXISTS staff (
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            stars INTEGER NOT NULL DEFAULT 0 CHECK (stars >= 0),
            created_at TEXT NOT NULL
        )",
        [],
    )?;

    // ==========================================================================
    // Transactions (the ledger; seq is the tie-breaker for equal timestamps)
    // ==========================================================================
    conn.execute(
        "CREATE TABLE IF NOT EXISTS transactions (
            seq INTEGER PRIMARY KEY AUTOINCREMENT,
            tx_uuid TEXT UNIQUE NOT NULL,
            staff_id TEXT NOT NULL REFERENCES staff(id),
            category TEXT NOT NULL,
            service TEXT NOT NULL,
            amount REAL,
            occurred_at TEXT NOT NULL,
            occurred_at_ms INTEGER NOT NULL,
            stars INTEGER NOT NULL CHECK (stars >= 0),
            version INTEGER NOT NULL DEFAULT 1,
            import_key TEXT UNIQUE,
            created_at TEXT NOT NULL
        )",
        [],
    )?;

    // ==========================================================================
    // Pending sale requests awaiting approval
    // ==========================================================================
    conn.execute(
        "CREATE TABLE IF NOT EXISTS pending_requests (
            request_uuid TEXT PRIMARY KEY,
            staff_id TEXT NOT NULL REFERENCES staff(id),
            category TEXT NOT NULL,
            service TEXT,
            amount REAL,
            occurred_at TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT 'pending',
            transaction_id TEXT,
            submitted_at TEXT NOT NULL,
            decided_at TEXT
        )",
        [],
    )?;

    // ==========================================================================
    // The one bonus campaign (single-row table)
    // ==========================================================================
    conn.execute(
        "CREATE TABLE IF NOT EXISTS bonus_campaign (
            slot INTEGER PRIMARY KEY CHECK (slot = 1),
            data TEXT NOT NULL,
            updated_at TEXT NOT NULL
        )",
        [],
    )?;

    // ==========================================================================
    // Events Table (audit trail)
    // ==========================================================================
    conn.execute(
        "CREATE TABLE IF NOT EXISTS events (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            event_id TEXT UNIQUE NOT NULL,
            timestamp TEXT NOT NULL,
            event_type TEXT NOT NULL,
            entity_type TEXT NOT NULL,
            entity_id TEXT NOT NULL,
            data TEXT NOT NULL,
            actor TEXT NOT NULL,
            created_at DATETIME DEFAULT CURRENT_TIMESTAMP
        )",
        [],
    )?;

    // ==========================================================================
    // Indexes
    // ==========================================================================
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_stacking_key
         ON transactions(staff_id, category, service, occurred_at_ms, seq)",
        [],
    )?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_pending_status ON pending_requests(status)",
        [],
    )?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_events_entity ON events(entity_type, entity_id)",
        [],
    )?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_events_timestamp ON events(timestamp)",
        [],
    )?;

    Ok(())
}

// ============================================================================
// Row mapping
// ============================================================================

pub const ENTRY_COLUMNS: &str = "tx_uuid, seq, staff_id, category, service, amount,
     occurred_at, stars, version, import_key, created_at";

fn parse_timestamp(idx: usize, value: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

pub fn map_entry_row(row: &Row<'_>) -> rusqlite::Result<LedgerEntry> {
    let occurred_at: String = row.get(6)?;
    let created_at: String = row.get(10)?;

    Ok(LedgerEntry {
        id: row.get(0)?,
        seq: row.get(1)?,
        staff_id: row.get(2)?,
        category: row.get(3)?,
        service: row.get(4)?,
        amount: row.get(5)?,
        occurred_at: parse_timestamp(6, &occurred_at)?,
        stars: row.get(7)?,
        version: row.get(8)?,
        import_key: row.get(9)?,
        created_at: parse_timestamp(10, &created_at)?,
    })
}

pub fn map_staff_row(row: &Row<'_>) -> rusqlite::Result<StaffRecord> {
    Ok(StaffRecord {
        id: row.get(0)?,
        name: row.get(1)?,
        stars: row.get(2)?,
    })
}

/// Insert a new ledger row and return its assigned seq.
pub fn insert_entry(conn: &Connection, entry: &LedgerEntry) -> rusqlite::Result<i64> {
    conn.execute(
        "INSERT INTO transactions (
            tx_uuid, staff_id, category, service, amount,
            occurred_at, occurred_at_ms, stars, version, import_key, created_at
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
        params![
            entry.id,
            entry.staff_id,
            entry.category,
            entry.service,
            entry.amount,
            entry.occurred_at.to_rfc3339(),
            entry.occurred_at.timestamp_millis(),
            entry.stars,
            entry.version,
            entry.import_key,
            entry.created_at.to_rfc3339(),
        ],
    )?;
    Ok(conn.last_insert_rowid())
}

pub fn get_entry(conn: &Connection, tx_uuid: &str) -> rusqlite::Result<Option<LedgerEntry>> {
    let sql = format!("SELECT {} FROM transactions WHERE tx_uuid = ?1", ENTRY_COLUMNS);
    conn.query_row(&sql, [tx_uuid], map_entry_row).optional()
}

/// All of one staff member's entries in sequence order.
pub fn get_entries_for_staff(conn: &Connection, staff_id: &str) -> rusqlite::Result<Vec<LedgerEntry>> {
    let sql = format!(
        "SELECT {} FROM transactions WHERE staff_id = ?1 ORDER BY occurred_at_ms, seq",
        ENTRY_COLUMNS
    );
    let mut stmt = conn.prepare(&sql)?;
    let entries = stmt
        .query_map([staff_id], map_entry_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(entries)
}

/// Number of same-key entries ordered before (`occurred_at_ms`, `seq`).
/// Pass `i64::MAX` as seq for a row that has not been inserted yet.
pub fn count_prior_in_sequence(
    conn: &Connection,
    staff_id: &str,
    category: &str,
    service: &str,
    occurred_at_ms: i64,
    seq: i64,
) -> rusqlite::Result<u64> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM transactions
         WHERE staff_id = ?1 AND category = ?2 AND service = ?3
           AND (occurred_at_ms < ?4 OR (occurred_at_ms = ?4 AND seq < ?5))",
        params![staff_id, category, service, occurred_at_ms, seq],
        |row| row.get(0),
    )?;
    Ok(count as u64)
}

pub fn get_staff(conn: &Connection, staff_id: &str) -> rusqlite::Result<Option<StaffRecord>> {
    conn.query_row(
        "SELECT id, name, stars FROM staff WHERE id = ?1",
        [staff_id],
        map_staff_row,
    )
    .optional()
}

pub fn get_all_staff(conn: &Connection) -> rusqlite::Result<Vec<StaffRecord>> {
    let mut stmt = conn.prepare("SELECT id, name, stars FROM staff ORDER BY id")?;
    let staff = stmt
        .query_map([], map_staff_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(staff)
}

pub fn set_staff_stars(conn: &Connection, staff_id: &str, stars: i64) -> rusqlite::Result<()> {
    conn.execute(
        "UPDATE staff SET stars = ?1 WHERE id = ?2",
        params![stars, staff_id],
    )?;
    Ok(())
}

pub fn sum_staff_ledger(conn: &Connection, staff_id: &str) -> rusqlite::Result<i64> {
    conn.query_row(
        "SELECT COALESCE(SUM(stars), 0) FROM transactions WHERE staff_id = ?1",
        [staff_id],
        |row| row.get(0),
    )
}

pub fn count_transactions(conn: &Connection) -> rusqlite::Result<i64> {
    conn.query_row("SELECT COUNT(*) FROM transactions", [], |row| row.get(0))
}

pub fn import_key_exists(conn: &Connection, import_key: &str) -> rusqlite::Result<bool> {
    let found: Option<i64> = conn
        .query_row(
            "SELECT seq FROM transactions WHERE import_key = ?1",
            [import_key],
            |row| row.get(0),
        )
        .optional()?;
    Ok(found.is_some())
}

// ============================================================================
// Campaign storage
// ============================================================================

pub fn load_campaign(conn: &Connection) -> Result<Option<BonusCampaign>, CommitError> {
    let data: Option<String> = conn
        .query_row("SELECT data FROM bonus_campaign WHERE slot = 1", [], |row| row.get(0))
        .optional()?;

    match data {
        Some(json) => Ok(Some(serde_json::from_str(&json)?)),
        None => Ok(None),
    }
}

pub fn save_campaign(conn: &Connection, campaign: &BonusCampaign) -> Result<(), CommitError> {
    let json = serde_json::to_string(campaign)?;
    conn.execute(
        "INSERT INTO bonus_campaign (slot, data, updated_at) VALUES (1, ?1, ?2)
         ON CONFLICT(slot) DO UPDATE SET data = excluded.data, updated_at = excluded.updated_at",
        params![json, Utc::now().to_rfc3339()],
    )?;
    Ok(())
}

pub fn delete_campaign(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute("DELETE FROM bonus_campaign WHERE slot = 1", [])?;
    Ok(())
}

// ============================================================================
// Audit trail
// ============================================================================

/// Insert event into audit trail
pub fn insert_event(conn: &Connection, event: &Event) -> Result<(), CommitError> {
    let data_json = serde_json::to_string(&event.data)?;

    conn.execute(
        "INSERT INTO events (
            event_id, timestamp, event_type, entity_type, entity_id, data, actor
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            event.event_id,
            event.timestamp.to_rfc3339(),
            event.event_type,
            event.entity_type,
            event.entity_id,
            data_json,
            event.actor,
        ],
    )?;

    Ok(())
}

/// Get events for a specific entity, oldest first
pub fn get_events_for_entity(
    conn: &Connection,
    entity_type: &str,
    entity_id: &str,
) -> rusqlite::Result<Vec<Event>> {
    let mut stmt = conn.prepare(
        "SELECT event_id, timestamp, event_type, entity_type, entity_id, data, actor
         FROM events
         WHERE entity_type = ?1 AND entity_id = ?2
         ORDER BY id ASC",
    )?;

    let events = stmt
        .query_map(params![entity_type, entity_id], |row| {
            let timestamp_str: String = row.get(1)?;
            let data_json: String = row.get(5)?;

            Ok(Event {
                event_id: row.get(0)?,
                timestamp: parse_timestamp(1, &timestamp_str)?,
                event_type: row.get(2)?,
                entity_type: row.get(3)?,
                entity_id: row.get(4)?,
                data: serde_json::from_str(&data_json).map_err(|e| {
                    rusqlite::Error::FromSqlConversionFailure(5, Type::Text, Box::new(e))
                })?,
                actor: row.get(6)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;

    Ok(events)
}
