// 📚 Ledger & Staff Aggregate
//
// Every mutation is one IMMEDIATE SQLite transaction: the ledger row, the
// staff aggregate and the audit event land together or not at all. Stacking
// positions are counted inside that same transaction, so a write always sees
// every sale committed before it.

use crate::accrual::{accrue, Accrual, AccrualContext};
use crate::campaign::BonusCampaign;
use crate::catalog::SaleItem;
use crate::db::{self, Event, LedgerEntry, StaffRecord};
use crate::error::{CommitError, ConsistencyWarning, EngineError, ValidationError};
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

// ============================================================================
// INPUTS & OUTCOMES
// ============================================================================

/// A sale as submitted by a collaborator (`recordSale`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewSale {
    pub staff_id: String,
    pub category: String,
    pub item: SaleItem,
    pub occurred_at: DateTime<Utc>,
    /// Set by importers so re-importing a file is a no-op
    #[serde(default)]
    pub import_key: Option<String>,
}

impl NewSale {
    pub fn new(staff_id: &str, category: &str, item: SaleItem, occurred_at: DateTime<Utc>) -> Self {
        NewSale {
            staff_id: staff_id.to_string(),
            category: category.to_string(),
            item,
            occurred_at,
            import_key: None,
        }
    }

    pub fn service(staff_id: &str, category: &str, service: &str, occurred_at: DateTime<Utc>) -> Self {
        Self::new(staff_id, category, SaleItem::Service(service.to_string()), occurred_at)
    }

    pub fn amount(staff_id: &str, category: &str, amount: f64, occurred_at: DateTime<Utc>) -> Self {
        Self::new(staff_id, category, SaleItem::Amount(amount), occurred_at)
    }
}

/// Accepts RFC 3339, `YYYY-MM-DD HH:MM:SS` (UTC) or a bare date (midnight UTC).
pub fn parse_timestamp(value: &str) -> Result<DateTime<Utc>, ValidationError> {
    let value = value.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(value) {
        return Ok(dt.with_timezone(&Utc));
    }
    if let Ok(naive) = NaiveDateTime::parse_from_str(value, "%Y-%m-%d %H:%M:%S") {
        return Ok(naive.and_utc());
    }
    if let Ok(date) = NaiveDate::parse_from_str(value, "%Y-%m-%d") {
        if let Some(naive) = date.and_hms_opt(0, 0, 0) {
            return Ok(naive.and_utc());
        }
    }
    Err(ValidationError::MalformedTimestamp(value.to_string()))
}

#[derive(Debug, Clone)]
pub struct RecordOutcome {
    pub entry: LedgerEntry,
    pub accrual: Accrual,
    /// Staff aggregate after the write
    pub aggregate: i64,
}

#[derive(Debug, Clone)]
pub struct EditOutcome {
    pub before: LedgerEntry,
    pub after: LedgerEntry,
    pub delta: i64,
    pub aggregate: i64,
    pub warnings: Vec<ConsistencyWarning>,
}

#[derive(Debug, Clone)]
pub struct DeleteOutcome {
    pub removed: LedgerEntry,
    pub aggregate_before: i64,
    pub aggregate_after: i64,
    pub warning: Option<ConsistencyWarning>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AggregateDrift {
    pub staff_id: String,
    pub name: String,
    pub cached: i64,
    pub ledger_sum: i64,
}

impl AggregateDrift {
    pub fn drift(&self) -> i64 {
        self.cached - self.ledger_sum
    }
}

/// A reconciliation correction ready to be committed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StagedCorrection {
    pub transaction_id: String,
    pub expected_version: i64,
    pub old_stars: i64,
    pub new_stars: i64,
    /// New service label when the entry was re-bracketed
    pub new_service: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CorrectionCommit {
    pub applied: usize,
    pub aggregate_before: i64,
    pub aggregate_after: i64,
    pub warnings: Vec<ConsistencyWarning>,
}

// ============================================================================
// PENDING REQUESTS
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RequestStatus {
    Pending,
    Approved,
    Rejected,
}

impl RequestStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RequestStatus::Pending => "pending",
            RequestStatus::Approved => "approved",
            RequestStatus::Rejected => "rejected",
        }
    }

    fn parse(value: &str) -> Self {
        match value {
            "approved" => RequestStatus::Approved,
            "rejected" => RequestStatus::Rejected,
            _ => RequestStatus::Pending,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingRequest {
    pub id: String,
    pub sale: NewSale,
    pub status: RequestStatus,
    pub transaction_id: Option<String>,
    pub submitted_at: DateTime<Utc>,
    pub decided_at: Option<DateTime<Utc>>,
}

const REQUEST_COLUMNS: &str = "request_uuid, staff_id, category, service, amount, occurred_at,
     status, transaction_id, submitted_at, decided_at";

fn map_request_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<PendingRequest> {
    let service: Option<String> = row.get(3)?;
    let amount: Option<f64> = row.get(4)?;
    let item = match (amount, service) {
        (Some(amount), _) => SaleItem::Amount(amount),
        (None, service) => SaleItem::Service(service.unwrap_or_default()),
    };
    let text_time = |idx: usize, value: String| {
        DateTime::parse_from_rfc3339(&value)
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(|e| {
                rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
            })
    };
    let decided_at: Option<String> = row.get(9)?;

    Ok(PendingRequest {
        id: row.get(0)?,
        sale: NewSale {
            staff_id: row.get(1)?,
            category: row.get(2)?,
            item,
            occurred_at: text_time(5, row.get(5)?)?,
            import_key: None,
        },
        status: RequestStatus::parse(&row.get::<_, String>(6)?),
        transaction_id: row.get(7)?,
        submitted_at: text_time(8, row.get(8)?)?,
        decided_at: decided_at.map(|v| text_time(9, v)).transpose()?,
    })
}

// ============================================================================
// LEDGER
// ============================================================================

pub struct Ledger {
    conn: Connection,
}

impl Ledger {
    pub fn open<P: AsRef<Path>>(path: P, busy_timeout: Duration) -> Result<Self, EngineError> {
        let conn = Connection::open(path)?;
        conn.busy_timeout(busy_timeout)?;
        Self::from_connection(conn)
    }

    pub fn open_in_memory() -> Result<Self, EngineError> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self, EngineError> {
        db::setup_database(&conn)?;
        Ok(Ledger { conn })
    }

    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    // ------------------------------------------------------------------------
    // Staff
    // ------------------------------------------------------------------------

    pub fn add_staff(&mut self, id: &str, name: &str) -> Result<StaffRecord, EngineError> {
        let tx = self.conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        if db::get_staff(&tx, id)?.is_some() {
            return Err(ValidationError::DuplicateStaff(id.to_string()).into());
        }
        tx.execute(
            "INSERT INTO staff (id, name, stars, created_at) VALUES (?1, ?2, 0, ?3)",
            params![id, name, Utc::now().to_rfc3339()],
        )?;
        db::insert_event(
            &tx,
            &Event::new("staff_added", "staff", id, serde_json::json!({ "name": name }), "ledger"),
        )?;
        tx.commit().map_err(CommitError::from)?;

        Ok(StaffRecord {
            id: id.to_string(),
            name: name.to_string(),
            stars: 0,
        })
    }

    pub fn staff(&self, id: &str) -> Result<StaffRecord, EngineError> {
        db::get_staff(&self.conn, id)?
            .ok_or_else(|| ValidationError::UnknownStaff(id.to_string()).into())
    }

    pub fn list_staff(&self) -> Result<Vec<StaffRecord>, EngineError> {
        Ok(db::get_all_staff(&self.conn)?)
    }

    pub fn staff_stars(&self, id: &str) -> Result<i64, EngineError> {
        Ok(self.staff(id)?.stars)
    }

    // ------------------------------------------------------------------------
    // Reads
    // ------------------------------------------------------------------------

    pub fn entry(&self, id: &str) -> Result<LedgerEntry, EngineError> {
        db::get_entry(&self.conn, id)?.ok_or_else(|| EngineError::TransactionNotFound(id.to_string()))
    }

    pub fn entries_for_staff(&self, staff_id: &str) -> Result<Vec<LedgerEntry>, EngineError> {
        Ok(db::get_entries_for_staff(&self.conn, staff_id)?)
    }

    pub fn transaction_count(&self) -> Result<i64, EngineError> {
        Ok(db::count_transactions(&self.conn)?)
    }

    pub fn import_key_exists(&self, import_key: &str) -> Result<bool, EngineError> {
        Ok(db::import_key_exists(&self.conn, import_key)?)
    }

    pub fn events_for_entity(&self, entity_type: &str, entity_id: &str) -> Result<Vec<Event>, EngineError> {
        Ok(db::get_events_for_entity(&self.conn, entity_type, entity_id)?)
    }

    /// Staff whose cached total no longer matches the sum of their ledger.
    pub fn aggregate_drift(&self) -> Result<Vec<AggregateDrift>, EngineError> {
        let mut stmt = self.conn.prepare(
            "SELECT s.id, s.name, s.stars, COALESCE(SUM(t.stars), 0) AS ledger_sum
             FROM staff s
             LEFT JOIN transactions t ON t.staff_id = s.id
             GROUP BY s.id, s.name, s.stars
             HAVING s.stars != COALESCE(SUM(t.stars), 0)
             ORDER BY s.id",
        )?;

        let drift = stmt
            .query_map([], |row| {
                Ok(AggregateDrift {
                    staff_id: row.get(0)?,
                    name: row.get(1)?,
                    cached: row.get(2)?,
                    ledger_sum: row.get(3)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(drift)
    }

    // ------------------------------------------------------------------------
    // Write path
    // ------------------------------------------------------------------------

    pub fn record_sale(&mut self, ctx: AccrualContext<'_>, sale: &NewSale) -> Result<RecordOutcome, EngineError> {
        let tx = self.conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let outcome = write_sale(&tx, ctx, sale, "record_sale")?;
        tx.commit().map_err(CommitError::from)?;

        tracing::info!(
            staff = %sale.staff_id,
            category = %sale.category,
            service = %outcome.entry.service,
            position = outcome.accrual.position,
            stars = outcome.entry.stars,
            "sale recorded"
        );
        Ok(outcome)
    }

    /// Re-key a transaction. Stars are recomputed from its position among the
    /// chronologically earlier entries of the new key; later entries of either
    /// sequence are left as they are until the next reconciliation.
    pub fn edit_transaction(
        &mut self,
        ctx: AccrualContext<'_>,
        id: &str,
        category: &str,
        item: &SaleItem,
    ) -> Result<EditOutcome, EngineError> {
        let tx = self.conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let before = db::get_entry(&tx, id)?.ok_or_else(|| EngineError::TransactionNotFound(id.to_string()))?;
        let staff = db::get_staff(&tx, &before.staff_id)?
            .ok_or_else(|| ValidationError::UnknownStaff(before.staff_id.clone()))?;
        let service = ctx.catalog.resolve_sale(category, item)?;

        let prior = db::count_prior_in_sequence(
            &tx,
            &before.staff_id,
            category,
            &service.service,
            before.occurred_at.timestamp_millis(),
            before.seq,
        )?;
        let accrual = accrue(&service, before.occurred_at, prior + 1, ctx.campaigns);
        let delta = accrual.stars - before.stars;

        let amount = match item {
            SaleItem::Amount(amount) => Some(*amount),
            SaleItem::Service(_) => None,
        };
        tx.execute(
            "UPDATE transactions
             SET category = ?1, service = ?2, amount = ?3, stars = ?4, version = version + 1
             WHERE tx_uuid = ?5",
            params![category, service.service, amount, accrual.stars, id],
        )?;

        let mut warnings = accrual.warnings.clone();
        let (aggregate, clamped) = apply_aggregate_delta(&tx, &staff, delta)?;
        warnings.extend(clamped);

        db::insert_event(
            &tx,
            &Event::new(
                "transaction_edited",
                "transaction",
                id,
                serde_json::json!({
                    "from": { "category": before.category, "service": before.service, "stars": before.stars },
                    "to": { "category": category, "service": service.service, "stars": accrual.stars },
                    "delta": delta,
                }),
                "edit_transaction",
            ),
        )?;

        let after = db::get_entry(&tx, id)?.ok_or_else(|| EngineError::TransactionNotFound(id.to_string()))?;
        tx.commit().map_err(CommitError::from)?;

        for warning in &warnings {
            tracing::warn!(transaction = %id, "{}", warning.describe());
        }
        tracing::info!(transaction = %id, delta, "transaction edited");

        Ok(EditOutcome {
            before,
            after,
            delta,
            aggregate,
            warnings,
        })
    }

    /// Remove a transaction and subtract its stars, never taking the aggregate
    /// below zero. Later entries of the same stack are not re-released.
    pub fn delete_transaction(&mut self, id: &str) -> Result<DeleteOutcome, EngineError> {
        let tx = self.conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let removed = db::get_entry(&tx, id)?.ok_or_else(|| EngineError::TransactionNotFound(id.to_string()))?;
        let staff = db::get_staff(&tx, &removed.staff_id)?
            .ok_or_else(|| ValidationError::UnknownStaff(removed.staff_id.clone()))?;

        tx.execute("DELETE FROM transactions WHERE tx_uuid = ?1", [id])?;
        let (aggregate_after, warning) = apply_aggregate_delta(&tx, &staff, -removed.stars)?;

        db::insert_event(
            &tx,
            &Event::new(
                "transaction_deleted",
                "transaction",
                id,
                serde_json::json!({
                    "staff_id": removed.staff_id,
                    "service": removed.service,
                    "stars": removed.stars,
                }),
                "delete_transaction",
            ),
        )?;
        tx.commit().map_err(CommitError::from)?;

        if let Some(warning) = &warning {
            tracing::warn!(transaction = %id, "{}", warning.describe());
        }
        tracing::info!(transaction = %id, stars = removed.stars, "transaction deleted");

        Ok(DeleteOutcome {
            removed,
            aggregate_before: staff.stars,
            aggregate_after,
            warning,
        })
    }

    /// Commit a staff member's reconciliation batch. Each correction is
    /// version-checked; one mismatch rolls the whole batch back.
    pub fn apply_corrections(
        &mut self,
        staff_id: &str,
        corrections: &[StagedCorrection],
        repair_aggregate: bool,
    ) -> Result<CorrectionCommit, EngineError> {
        let tx = self.conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let staff = db::get_staff(&tx, staff_id)?
            .ok_or_else(|| ValidationError::UnknownStaff(staff_id.to_string()))?;

        let mut delta = 0;
        for correction in corrections {
            let updated = tx.execute(
                "UPDATE transactions SET stars = ?1, service = COALESCE(?5, service), version = version + 1
                 WHERE tx_uuid = ?2 AND version = ?3 AND staff_id = ?4",
                params![
                    correction.new_stars,
                    correction.transaction_id,
                    correction.expected_version,
                    staff_id,
                    correction.new_service
                ],
            )?;
            if updated != 1 {
                return Err(CommitError::Conflict {
                    transaction_id: correction.transaction_id.clone(),
                    expected_version: correction.expected_version,
                }
                .into());
            }
            delta += correction.new_stars - correction.old_stars;

            db::insert_event(
                &tx,
                &Event::new(
                    "stars_reconciled",
                    "transaction",
                    &correction.transaction_id,
                    serde_json::json!({
                        "old_stars": correction.old_stars,
                        "new_stars": correction.new_stars,
                        "new_service": correction.new_service,
                    }),
                    "reconciliation",
                ),
            )?;
        }

        let mut warnings = Vec::new();
        let aggregate_after = if repair_aggregate {
            let ledger_sum = db::sum_staff_ledger(&tx, staff_id)?;
            db::set_staff_stars(&tx, staff_id, ledger_sum)?;
            ledger_sum
        } else {
            let (after, clamped) = apply_aggregate_delta(&tx, &staff, delta)?;
            warnings.extend(clamped);
            after
        };

        if aggregate_after != staff.stars {
            db::insert_event(
                &tx,
                &Event::new(
                    "aggregate_reconciled",
                    "staff",
                    staff_id,
                    serde_json::json!({
                        "before": staff.stars,
                        "after": aggregate_after,
                        "ledger_delta": delta,
                        "repaired": repair_aggregate,
                    }),
                    "reconciliation",
                ),
            )?;
        }
        tx.commit().map_err(CommitError::from)?;

        Ok(CorrectionCommit {
            applied: corrections.len(),
            aggregate_before: staff.stars,
            aggregate_after,
            warnings,
        })
    }

    // ------------------------------------------------------------------------
    // Pending requests
    // ------------------------------------------------------------------------

    /// Queue a sale for approval. It is validated now so an approval can only
    /// fail on changed configuration.
    pub fn submit_request(&mut self, ctx: AccrualContext<'_>, sale: &NewSale) -> Result<PendingRequest, EngineError> {
        self.staff(&sale.staff_id)?;
        ctx.catalog.resolve_sale(&sale.category, &sale.item)?;

        let request = PendingRequest {
            id: uuid::Uuid::new_v4().to_string(),
            sale: sale.clone(),
            status: RequestStatus::Pending,
            transaction_id: None,
            submitted_at: Utc::now(),
            decided_at: None,
        };
        let (service, amount) = match &sale.item {
            SaleItem::Service(service) => (Some(service.clone()), None),
            SaleItem::Amount(amount) => (None, Some(*amount)),
        };

        let tx = self.conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        tx.execute(
            "INSERT INTO pending_requests (
                request_uuid, staff_id, category, service, amount, occurred_at, status, submitted_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, 'pending', ?7)",
            params![
                request.id,
                sale.staff_id,
                sale.category,
                service,
                amount,
                sale.occurred_at.to_rfc3339(),
                request.submitted_at.to_rfc3339(),
            ],
        )?;
        db::insert_event(
            &tx,
            &Event::new(
                "request_submitted",
                "request",
                &request.id,
                serde_json::to_value(sale).map_err(CommitError::from)?,
                "submit_request",
            ),
        )?;
        tx.commit().map_err(CommitError::from)?;

        Ok(request)
    }

    pub fn request(&self, id: &str) -> Result<PendingRequest, EngineError> {
        load_request(&self.conn, id)
    }

    pub fn pending_requests(&self) -> Result<Vec<PendingRequest>, EngineError> {
        let sql = format!(
            "SELECT {} FROM pending_requests WHERE status = 'pending' ORDER BY submitted_at, request_uuid",
            REQUEST_COLUMNS
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let requests = stmt
            .query_map([], map_request_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(requests)
    }

    /// Approve a request: the sale goes through the normal write path and the
    /// request is closed in the same store transaction.
    pub fn approve_request(&mut self, ctx: AccrualContext<'_>, id: &str) -> Result<RecordOutcome, EngineError> {
        let tx = self.conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let request = load_request(&tx, id)?;
        ensure_pending(&request)?;

        let outcome = write_sale(&tx, ctx, &request.sale, "approve_request")?;
        tx.execute(
            "UPDATE pending_requests SET status = 'approved', transaction_id = ?1, decided_at = ?2
             WHERE request_uuid = ?3",
            params![outcome.entry.id, Utc::now().to_rfc3339(), id],
        )?;
        db::insert_event(
            &tx,
            &Event::new(
                "request_approved",
                "request",
                id,
                serde_json::json!({ "transaction_id": outcome.entry.id }),
                "approve_request",
            ),
        )?;
        tx.commit().map_err(CommitError::from)?;

        tracing::info!(request = %id, transaction = %outcome.entry.id, "request approved");
        Ok(outcome)
    }

    pub fn reject_request(&mut self, id: &str) -> Result<PendingRequest, EngineError> {
        let tx = self.conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let request = load_request(&tx, id)?;
        ensure_pending(&request)?;

        tx.execute(
            "UPDATE pending_requests SET status = 'rejected', decided_at = ?1 WHERE request_uuid = ?2",
            params![Utc::now().to_rfc3339(), id],
        )?;
        db::insert_event(
            &tx,
            &Event::new("request_rejected", "request", id, serde_json::json!({}), "reject_request"),
        )?;
        let rejected = load_request(&tx, id)?;
        tx.commit().map_err(CommitError::from)?;

        Ok(rejected)
    }

    // ------------------------------------------------------------------------
    // Campaign storage
    // ------------------------------------------------------------------------

    pub fn load_campaign(&self) -> Result<Option<BonusCampaign>, EngineError> {
        Ok(db::load_campaign(&self.conn)?)
    }

    pub fn save_campaign(&mut self, campaign: &BonusCampaign) -> Result<(), EngineError> {
        let tx = self.conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        db::save_campaign(&tx, campaign)?;
        db::insert_event(
            &tx,
            &Event::new(
                "campaign_saved",
                "campaign",
                &campaign.id,
                serde_json::to_value(campaign).map_err(CommitError::from)?,
                "campaign_registry",
            ),
        )?;
        tx.commit().map_err(CommitError::from)?;
        Ok(())
    }

    pub fn clear_campaign(&mut self) -> Result<(), EngineError> {
        let tx = self.conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        db::delete_campaign(&tx)?;
        db::insert_event(
            &tx,
            &Event::new("campaign_cleared", "campaign", "active", serde_json::json!({}), "campaign_registry"),
        )?;
        tx.commit().map_err(CommitError::from)?;
        Ok(())
    }
}

// ============================================================================
// Helpers (run inside an open store transaction)
// ============================================================================

fn write_sale(
    conn: &Connection,
    ctx: AccrualContext<'_>,
    sale: &NewSale,
    actor: &str,
) -> Result<RecordOutcome, EngineError> {
    let staff = db::get_staff(conn, &sale.staff_id)?
        .ok_or_else(|| ValidationError::UnknownStaff(sale.staff_id.clone()))?;
    let service = ctx.catalog.resolve_sale(&sale.category, &sale.item)?;
    let amount = match sale.item {
        SaleItem::Amount(amount) => Some(amount),
        SaleItem::Service(_) => None,
    };

    let prior = db::count_prior_in_sequence(
        conn,
        &sale.staff_id,
        &sale.category,
        &service.service,
        sale.occurred_at.timestamp_millis(),
        i64::MAX,
    )?;
    let accrual = accrue(&service, sale.occurred_at, prior + 1, ctx.campaigns);

    let mut entry = LedgerEntry {
        id: uuid::Uuid::new_v4().to_string(),
        seq: 0,
        staff_id: sale.staff_id.clone(),
        category: sale.category.clone(),
        service: service.service.clone(),
        amount,
        occurred_at: sale.occurred_at,
        stars: accrual.stars,
        version: 1,
        import_key: sale.import_key.clone(),
        created_at: Utc::now(),
    };
    entry.seq = db::insert_entry(conn, &entry)?;

    let aggregate = staff.stars + entry.stars;
    db::set_staff_stars(conn, &staff.id, aggregate)?;

    db::insert_event(
        conn,
        &Event::new(
            "transaction_recorded",
            "transaction",
            &entry.id,
            serde_json::json!({
                "staff_id": entry.staff_id,
                "category": entry.category,
                "service": entry.service,
                "position": accrual.position,
                "multiplier": accrual.multiplier.to_string(),
                "stars": entry.stars,
            }),
            actor,
        ),
    )?;

    for warning in &accrual.warnings {
        tracing::warn!(transaction = %entry.id, "{}", warning.describe());
    }

    Ok(RecordOutcome {
        entry,
        accrual,
        aggregate,
    })
}

/// Add a signed delta to the staff aggregate, clamping at zero.
fn apply_aggregate_delta(
    conn: &Connection,
    staff: &StaffRecord,
    delta: i64,
) -> Result<(i64, Option<ConsistencyWarning>), EngineError> {
    let target = staff.stars + delta;
    let (after, warning) = if target < 0 {
        (
            0,
            Some(ConsistencyWarning::AggregateClamped {
                staff_id: staff.id.clone(),
                before: staff.stars,
                delta,
            }),
        )
    } else {
        (target, None)
    };
    if delta != 0 {
        db::set_staff_stars(conn, &staff.id, after)?;
    }
    Ok((after, warning))
}

fn load_request(conn: &Connection, id: &str) -> Result<PendingRequest, EngineError> {
    let sql = format!("SELECT {} FROM pending_requests WHERE request_uuid = ?1", REQUEST_COLUMNS);
    conn.query_row(&sql, [id], map_request_row)
        .optional()?
        .ok_or_else(|| EngineError::RequestNotFound(id.to_string()))
}

fn ensure_pending(request: &PendingRequest) -> Result<(), ValidationError> {
    if request.status == RequestStatus::Pending {
        Ok(())
    } else {
        Err(ValidationError::RequestNotPending {
            id: request.id.clone(),
            status: request.status.as_str().to_string(),
        })
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::campaign::{CampaignRegistry, CategoryFilter, Multiplier};
    use crate::catalog::ServiceCatalog;
    use crate::error::ConfigurationError;
    use chrono::TimeZone;

    fn setup() -> (Ledger, ServiceCatalog, CampaignRegistry) {
        let mut ledger = Ledger::open_in_memory().unwrap();
        ledger.add_staff("A", "Anna").unwrap();
        ledger.add_staff("B", "Bjørn").unwrap();
        (ledger, ServiceCatalog::with_defaults(), CampaignRegistry::new())
    }

    fn at(day: u32, hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 3, day, hour, 0, 0).unwrap()
    }

    #[test]
    fn test_stacking_sale_sequence() {
        let (mut ledger, catalog, campaigns) = setup();
        let ctx = AccrualContext::new(&catalog, &campaigns);

        let stars: Vec<i64> = (1..=4)
            .map(|day| {
                ledger
                    .record_sale(ctx, &NewSale::service("A", "Telefoni", "Teletime15 x3", at(day, 10)))
                    .unwrap()
                    .entry
                    .stars
            })
            .collect();

        assert_eq!(stars, vec![0, 0, 1, 0]);
        assert_eq!(ledger.staff_stars("A").unwrap(), 1);
        assert_eq!(ledger.staff_stars("B").unwrap(), 0);
    }

    #[test]
    fn test_stacks_are_per_staff() {
        let (mut ledger, catalog, campaigns) = setup();
        let ctx = AccrualContext::new(&catalog, &campaigns);

        for staff in ["A", "B", "A", "B", "A"] {
            ledger
                .record_sale(ctx, &NewSale::service(staff, "Telefoni", "Teletime15 x3", at(1, 9)))
                .unwrap();
        }
        assert_eq!(ledger.staff_stars("A").unwrap(), 1);
        assert_eq!(ledger.staff_stars("B").unwrap(), 0);
    }

    #[test]
    fn test_recurring_bracket_only_first() {
        let (mut ledger, catalog, campaigns) = setup();
        let ctx = AccrualContext::new(&catalog, &campaigns);

        let first = ledger
            .record_sale(ctx, &NewSale::amount("A", "Forsikring", 150.0, at(1, 9)))
            .unwrap();
        let second = ledger
            .record_sale(ctx, &NewSale::amount("A", "Forsikring", 200.0, at(2, 9)))
            .unwrap();

        assert_eq!(first.entry.service, "Gjentakende - 100-299kr");
        assert_eq!(first.entry.stars, 2);
        assert_eq!(second.entry.stars, 0);
        assert_eq!(second.entry.amount, Some(200.0));
        assert_eq!(ledger.staff_stars("A").unwrap(), 2);
    }

    #[test]
    fn test_rejections_leave_no_trace() {
        let (mut ledger, catalog, campaigns) = setup();
        let ctx = AccrualContext::new(&catalog, &campaigns);

        let unknown = ledger.record_sale(ctx, &NewSale::service("A", "Telefoni", "Fax", at(1, 9)));
        assert!(matches!(
            unknown,
            Err(EngineError::Configuration(ConfigurationError::UnknownService { .. }))
        ));

        let negative = ledger.record_sale(ctx, &NewSale::amount("A", "Forsikring", -10.0, at(1, 9)));
        assert!(matches!(
            negative,
            Err(EngineError::Validation(ValidationError::NegativeAmount(_)))
        ));

        let nobody = ledger.record_sale(ctx, &NewSale::service("Z", "Service", "Datarens", at(1, 9)));
        assert!(matches!(
            nobody,
            Err(EngineError::Validation(ValidationError::UnknownStaff(_)))
        ));

        assert_eq!(ledger.transaction_count().unwrap(), 0);
        assert_eq!(ledger.staff_stars("A").unwrap(), 0);
    }

    #[test]
    fn test_bracket_category_needs_amount_or_label() {
        let (mut ledger, catalog, campaigns) = setup();
        let ctx = AccrualContext::new(&catalog, &campaigns);

        let bare = ledger.record_sale(ctx, &NewSale::service("A", "Forsikring", "Gjentakende", at(1, 9)));
        assert!(matches!(
            bare,
            Err(EngineError::Configuration(ConfigurationError::UnknownService { .. }))
        ));
        assert!(ledger
            .submit_request(ctx, &NewSale::service("A", "Forsikring", "Gjentakende", at(1, 9)))
            .is_err());
        assert_eq!(ledger.transaction_count().unwrap(), 0);
        assert_eq!(ledger.staff_stars("A").unwrap(), 0);

        // The bare name cannot open a second recurring key next to the bracket label
        let labelled = ledger
            .record_sale(ctx, &NewSale::service("A", "Forsikring", "Gjentakende - 100-299kr", at(1, 10)))
            .unwrap();
        let by_amount = ledger
            .record_sale(ctx, &NewSale::amount("A", "Forsikring", 120.0, at(2, 10)))
            .unwrap();
        assert_eq!(labelled.entry.stars, 2);
        assert_eq!(by_amount.entry.stars, 0);
        assert_eq!(ledger.staff_stars("A").unwrap(), 2);
    }

    #[test]
    fn test_campaign_applies_at_write_time() {
        let (mut ledger, catalog, _) = setup();
        let campaign = crate::campaign::BonusCampaign::new(
            CategoryFilter::Category("Service".to_string()),
            Multiplier::whole(2),
        )
        .with_window(Some(at(5, 0).date_naive()), Some(at(6, 0).date_naive()));
        let campaigns = CampaignRegistry::with_campaign(campaign).unwrap();
        let ctx = AccrualContext::new(&catalog, &campaigns);

        let before = ledger.record_sale(ctx, &NewSale::service("A", "Service", "Oppsett", at(4, 23))).unwrap();
        let first_day = ledger.record_sale(ctx, &NewSale::service("A", "Service", "Oppsett", at(5, 0))).unwrap();
        let last_day = ledger.record_sale(ctx, &NewSale::service("A", "Service", "Oppsett", at(6, 23))).unwrap();

        assert_eq!(before.entry.stars, 2);
        assert_eq!(first_day.entry.stars, 4);
        assert_eq!(last_day.entry.stars, 4);
        assert_eq!(ledger.staff_stars("A").unwrap(), 10);
    }

    #[test]
    fn test_delete_subtracts_and_clamps() {
        let (mut ledger, catalog, campaigns) = setup();
        let ctx = AccrualContext::new(&catalog, &campaigns);

        let sale = ledger
            .record_sale(ctx, &NewSale::service("A", "Service", "Oppsett", at(1, 9)))
            .unwrap();
        ledger
            .record_sale(ctx, &NewSale::service("A", "Service", "Datarens", at(1, 10)))
            .unwrap();
        assert_eq!(ledger.staff_stars("A").unwrap(), 3);

        let outcome = ledger.delete_transaction(&sale.entry.id).unwrap();
        assert_eq!(outcome.aggregate_before, 3);
        assert_eq!(outcome.aggregate_after, 1);
        assert!(outcome.warning.is_none());

        // Simulate drift: aggregate lower than the ledger believes
        db::set_staff_stars(ledger.connection(), "A", 0).unwrap();
        let remaining = ledger.entries_for_staff("A").unwrap();
        let outcome = ledger.delete_transaction(&remaining[0].id).unwrap();
        assert_eq!(outcome.aggregate_after, 0);
        assert!(matches!(
            outcome.warning,
            Some(ConsistencyWarning::AggregateClamped { before: 0, delta: -1, .. })
        ));

        assert!(matches!(
            ledger.delete_transaction(&remaining[0].id),
            Err(EngineError::TransactionNotFound(_))
        ));
    }

    #[test]
    fn test_delete_does_not_re_release() {
        let (mut ledger, catalog, campaigns) = setup();
        let ctx = AccrualContext::new(&catalog, &campaigns);

        let ids: Vec<String> = (1..=4)
            .map(|day| {
                ledger
                    .record_sale(ctx, &NewSale::service("A", "Telefoni", "Teletime15 x3", at(day, 9)))
                    .unwrap()
                    .entry
                    .id
            })
            .collect();

        ledger.delete_transaction(&ids[0]).unwrap();
        let stars: Vec<i64> = ledger.entries_for_staff("A").unwrap().iter().map(|e| e.stars).collect();
        assert_eq!(stars, vec![0, 1, 0]);
        assert_eq!(ledger.staff_stars("A").unwrap(), 1);
    }

    #[test]
    fn test_edit_moves_to_new_key() {
        let (mut ledger, catalog, campaigns) = setup();
        let ctx = AccrualContext::new(&catalog, &campaigns);

        for day in 1..=2 {
            ledger
                .record_sale(ctx, &NewSale::service("A", "Telefoni", "Teletime15 x3", at(day, 9)))
                .unwrap();
        }
        let third = ledger
            .record_sale(ctx, &NewSale::service("A", "Telefoni", "Teletime15 x3", at(3, 9)))
            .unwrap();
        assert_eq!(third.entry.stars, 1);

        let edit = ledger
            .edit_transaction(ctx, &third.entry.id, "Service", &SaleItem::Service("Oppsett".to_string()))
            .unwrap();
        assert_eq!(edit.delta, 1);
        assert_eq!(edit.after.stars, 2);
        assert_eq!(edit.after.version, 2);
        assert_eq!(edit.after.service, "Oppsett");
        assert_eq!(ledger.staff_stars("A").unwrap(), 2);
    }

    #[test]
    fn test_edit_counts_only_earlier_entries_of_new_key() {
        let (mut ledger, catalog, campaigns) = setup();
        let ctx = AccrualContext::new(&catalog, &campaigns);

        ledger
            .record_sale(ctx, &NewSale::service("A", "Telefoni", "Teletime15 x3", at(1, 9)))
            .unwrap();
        ledger
            .record_sale(ctx, &NewSale::service("A", "Telefoni", "Teletime15 x3", at(2, 9)))
            .unwrap();
        // Later in time than both stack entries
        let moved = ledger
            .record_sale(ctx, &NewSale::service("A", "Service", "Datarens", at(5, 9)))
            .unwrap();

        let edit = ledger
            .edit_transaction(
                ctx,
                &moved.entry.id,
                "Telefoni",
                &SaleItem::Service("Teletime15 x3".to_string()),
            )
            .unwrap();
        assert_eq!(edit.after.stars, 1);
        assert_eq!(edit.delta, 0);
        assert_eq!(ledger.staff_stars("A").unwrap(), 1);
    }

    #[test]
    fn test_aggregate_drift_detection() {
        let (mut ledger, catalog, campaigns) = setup();
        let ctx = AccrualContext::new(&catalog, &campaigns);
        ledger
            .record_sale(ctx, &NewSale::service("A", "Service", "Oppsett", at(1, 9)))
            .unwrap();
        assert!(ledger.aggregate_drift().unwrap().is_empty());

        db::set_staff_stars(ledger.connection(), "B", 7).unwrap();
        let drift = ledger.aggregate_drift().unwrap();
        assert_eq!(drift.len(), 1);
        assert_eq!(drift[0].staff_id, "B");
        assert_eq!(drift[0].drift(), 7);
    }

    #[test]
    fn test_pending_request_lifecycle() {
        let (mut ledger, catalog, campaigns) = setup();
        let ctx = AccrualContext::new(&catalog, &campaigns);

        let request = ledger
            .submit_request(ctx, &NewSale::amount("A", "Forsikring", 320.0, at(2, 12)))
            .unwrap();
        let rejected = ledger
            .submit_request(ctx, &NewSale::service("A", "Service", "Datarens", at(2, 13)))
            .unwrap();
        assert_eq!(ledger.pending_requests().unwrap().len(), 2);

        let outcome = ledger.approve_request(ctx, &request.id).unwrap();
        assert_eq!(outcome.entry.service, "Gjentakende - 300-499kr");
        assert_eq!(outcome.entry.stars, 3);
        assert_eq!(ledger.staff_stars("A").unwrap(), 3);

        let closed = ledger.reject_request(&rejected.id).unwrap();
        assert_eq!(closed.status, RequestStatus::Rejected);
        assert!(closed.decided_at.is_some());
        assert!(ledger.pending_requests().unwrap().is_empty());

        let approved = ledger.request(&request.id).unwrap();
        assert_eq!(approved.status, RequestStatus::Approved);
        assert_eq!(approved.transaction_id, Some(outcome.entry.id.clone()));

        assert!(matches!(
            ledger.approve_request(ctx, &request.id),
            Err(EngineError::Validation(ValidationError::RequestNotPending { .. }))
        ));
        assert_eq!(ledger.staff_stars("A").unwrap(), 3);
    }

    #[test]
    fn test_submit_request_validates_up_front() {
        let (mut ledger, catalog, campaigns) = setup();
        let ctx = AccrualContext::new(&catalog, &campaigns);
        assert!(ledger
            .submit_request(ctx, &NewSale::service("A", "Telefoni", "Fax", at(1, 9)))
            .is_err());
        assert!(ledger.pending_requests().unwrap().is_empty());
    }

    #[test]
    fn test_apply_corrections_detects_conflict() {
        let (mut ledger, catalog, campaigns) = setup();
        let ctx = AccrualContext::new(&catalog, &campaigns);
        let sale = ledger
            .record_sale(ctx, &NewSale::service("A", "Service", "Datarens", at(1, 9)))
            .unwrap();

        let stale = StagedCorrection {
            transaction_id: sale.entry.id.clone(),
            expected_version: 7,
            old_stars: 1,
            new_stars: 5,
            new_service: None,
        };
        let result = ledger.apply_corrections("A", &[stale], false);
        assert!(matches!(result, Err(EngineError::Commit(CommitError::Conflict { .. }))));
        assert_eq!(ledger.entry(&sale.entry.id).unwrap().stars, 1);
        assert_eq!(ledger.staff_stars("A").unwrap(), 1);
    }

    #[test]
    fn test_audit_events_written() {
        let (mut ledger, catalog, campaigns) = setup();
        let ctx = AccrualContext::new(&catalog, &campaigns);
        let sale = ledger
            .record_sale(ctx, &NewSale::service("A", "Service", "Datarens", at(1, 9)))
            .unwrap();
        ledger.delete_transaction(&sale.entry.id).unwrap();

        let events = ledger.events_for_entity("transaction", &sale.entry.id).unwrap();
        let kinds: Vec<&str> = events.iter().map(|e| e.event_type.as_str()).collect();
        assert_eq!(kinds, vec!["transaction_recorded", "transaction_deleted"]);
    }

    #[test]
    fn test_parse_timestamp_forms() {
        assert_eq!(parse_timestamp("2025-03-01T10:00:00+01:00").unwrap(), at(1, 9));
        assert_eq!(parse_timestamp("2025-03-01 09:00:00").unwrap(), at(1, 9));
        assert_eq!(parse_timestamp("2025-03-01").unwrap(), at(1, 0));
        assert!(matches!(
            parse_timestamp("01/03/2025"),
            Err(ValidationError::MalformedTimestamp(_))
        ));
    }
}
