// ⚖️ Reconciliation Engine - replay the ledger under current rules
//
// For every staff member in scope:
//   1. load live transactions in (timestamp, seq) order
//   2. group them by (category, service) as the current catalog resolves them;
//      bracket entries are re-bracketed from their stored amount
//   3. recompute each group's credited stars with the current catalog and
//      campaign (each transaction's own date picks the multiplier)
//   4. stage a correction wherever the stored value differs
//   5. commit the staff member's corrections and aggregate delta atomically
//
// Running it twice with no rule change in between yields zero corrections.

use crate::accrual::{replay_sequence, AccrualContext};
use crate::catalog::ResolvedService;
use crate::db::{LedgerEntry, StaffRecord};
use crate::error::{ConsistencyWarning, EngineError};
use crate::ledger::{Ledger, StagedCorrection};
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;

// ============================================================================
// SCOPE & OPTIONS
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReconcileScope {
    Staff(String),
    All,
}

impl fmt::Display for ReconcileScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReconcileScope::Staff(id) => write!(f, "staff {}", id),
            ReconcileScope::All => write!(f, "all staff"),
        }
    }
}

/// Which service kinds are replayed, and what happens to the result.
/// The default touches stacking services only and commits.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconcileOptions {
    pub include_recurring: bool,
    pub include_non_stacking: bool,
    /// Compute and report corrections without committing them
    pub dry_run: bool,
    /// Reset each touched aggregate to its ledger sum instead of adding the delta
    pub repair_aggregate: bool,
}

impl ReconcileOptions {
    pub fn all_services() -> Self {
        ReconcileOptions {
            include_recurring: true,
            include_non_stacking: true,
            ..Default::default()
        }
    }

    pub fn dry_run(mut self) -> Self {
        self.dry_run = true;
        self
    }

    pub fn repairing(mut self) -> Self {
        self.repair_aggregate = true;
        self
    }
}

// ============================================================================
// RECONCILIATION REPORT
// ============================================================================

/// One audit line: (transaction, staff, service, old, new, delta).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Correction {
    pub transaction_id: String,
    pub staff_id: String,
    pub staff_name: String,
    pub category: String,
    pub service: String,
    pub occurred_at: DateTime<Utc>,
    pub old_stars: i64,
    pub new_stars: i64,
    pub delta: i64,
    pub committed: bool,
    /// Stored service label before a re-bracketing moved the entry
    #[serde(default)]
    pub previous_service: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SkippedEntry {
    pub transaction_id: String,
    pub staff_id: String,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StaffFailure {
    pub staff_id: String,
    pub error: String,
    pub retryable: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconciliationReport {
    pub scope: ReconcileScope,
    pub options: ReconcileOptions,
    /// Corrections actually committed
    pub updated_count: usize,
    /// Ledger delta per staff id (staged deltas on a dry run)
    pub per_staff_delta: BTreeMap<String, i64>,
    pub details: Vec<Correction>,
    pub warnings: Vec<ConsistencyWarning>,
    pub skipped: Vec<SkippedEntry>,
    pub failures: Vec<StaffFailure>,
    /// Set when a non-retryable store error stopped the run early
    pub halted: bool,
    pub reconciled_at: DateTime<Utc>,
}

impl ReconciliationReport {
    fn new(scope: ReconcileScope, options: ReconcileOptions) -> Self {
        ReconciliationReport {
            scope,
            options,
            updated_count: 0,
            per_staff_delta: BTreeMap::new(),
            details: Vec::new(),
            warnings: Vec::new(),
            skipped: Vec::new(),
            failures: Vec::new(),
            halted: false,
            reconciled_at: Utc::now(),
        }
    }

    /// Nothing to correct, nothing skipped, nothing failed.
    pub fn is_clean(&self) -> bool {
        self.details.is_empty() && self.skipped.is_empty() && self.failures.is_empty()
    }

    pub fn total_delta(&self) -> i64 {
        self.per_staff_delta.values().sum()
    }

    pub fn summary(&self) -> String {
        let mode = if self.options.dry_run { " (dry run)" } else { "" };
        format!(
            "Reconciliation for {}{}: {} corrections staged, {} committed, net delta {:+}, {} skipped, {} failed{}",
            self.scope,
            mode,
            self.details.len(),
            self.updated_count,
            self.total_delta(),
            self.skipped.len(),
            self.failures.len(),
            if self.halted { ", halted" } else { "" }
        )
    }

    /// Human-readable audit list, one line per correction.
    pub fn audit_lines(&self) -> Vec<String> {
        self.details
            .iter()
            .map(|c| {
                let moved = c
                    .previous_service
                    .as_ref()
                    .map(|old| format!(" [was {}]", old))
                    .unwrap_or_default();
                format!(
                    "{}  {:<12} {:<28} {} -> {} ({:+}){}{}",
                    c.transaction_id,
                    c.staff_name,
                    c.service,
                    c.old_stars,
                    c.new_stars,
                    c.delta,
                    moved,
                    if c.committed { "" } else { " [not committed]" }
                )
            })
            .collect()
    }

    pub fn write_csv<W: std::io::Write>(&self, writer: W) -> std::result::Result<(), csv::Error> {
        let mut wtr = csv::Writer::from_writer(writer);
        for correction in &self.details {
            wtr.serialize(correction)?;
        }
        wtr.flush()?;
        Ok(())
    }

    pub fn export_csv<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        let file = std::fs::File::create(path)
            .with_context(|| format!("Failed to create report file: {}", path.display()))?;
        self.write_csv(file)
            .with_context(|| format!("Failed to write report: {}", path.display()))?;
        Ok(())
    }
}

// ============================================================================
// STAFF PLAN (pure replay, no store access)
// ============================================================================

#[derive(Debug, Clone, Default, PartialEq)]
pub struct StaffPlan {
    pub corrections: Vec<Correction>,
    pub staged: Vec<StagedCorrection>,
    pub skipped: Vec<SkippedEntry>,
    pub warnings: Vec<ConsistencyWarning>,
    pub ledger_delta: i64,
}

// ============================================================================
// RECONCILIATION ENGINE
// ============================================================================

#[derive(Debug, Clone, Default)]
pub struct ReconciliationEngine {
    pub options: ReconcileOptions,
}

impl ReconciliationEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_options(options: ReconcileOptions) -> Self {
        ReconciliationEngine { options }
    }

    /// Replay one staff member's ledger. Each entry is resolved against the
    /// current catalog (bracket entries by their stored amount), regrouped under
    /// the key it resolves to, and replayed in (timestamp, seq) order.
    pub fn plan_staff(&self, staff: &StaffRecord, entries: &[LedgerEntry], ctx: AccrualContext<'_>) -> StaffPlan {
        let mut plan = StaffPlan::default();

        let mut groups: BTreeMap<(String, String), (ResolvedService, Vec<&LedgerEntry>)> = BTreeMap::new();
        for entry in entries {
            let service = match ctx.catalog.resolve_sale(&entry.category, &entry.sale_item()) {
                Ok(service) => service,
                Err(err) => {
                    plan.skipped.push(SkippedEntry {
                        transaction_id: entry.id.clone(),
                        staff_id: staff.id.clone(),
                        reason: err.to_string(),
                    });
                    continue;
                }
            };
            groups
                .entry((service.category.clone(), service.service.clone()))
                .or_insert_with(|| (service, Vec::new()))
                .1
                .push(entry);
        }

        for (service, mut group) in groups.into_values() {
            group.sort_by_key(|e| e.order_key());

            let selected = if service.is_stacking() {
                true
            } else if service.is_recurring() {
                self.options.include_recurring
            } else {
                self.options.include_non_stacking
            };
            if !selected {
                continue;
            }

            let replayed = replay_sequence(&service, group.iter().map(|e| e.occurred_at), ctx.campaigns);
            for (entry, accrual) in group.into_iter().zip(replayed) {
                for warning in accrual.warnings {
                    if !plan.warnings.contains(&warning) {
                        plan.warnings.push(warning);
                    }
                }
                // A moved bracket boundary relabels the entry under its new tier
                let relabel = (entry.service != service.service).then(|| service.service.clone());
                if accrual.stars == entry.stars && relabel.is_none() {
                    continue;
                }

                let delta = accrual.stars - entry.stars;
                plan.ledger_delta += delta;
                plan.staged.push(StagedCorrection {
                    transaction_id: entry.id.clone(),
                    expected_version: entry.version,
                    old_stars: entry.stars,
                    new_stars: accrual.stars,
                    new_service: relabel.clone(),
                });
                plan.corrections.push(Correction {
                    transaction_id: entry.id.clone(),
                    staff_id: staff.id.clone(),
                    staff_name: staff.name.clone(),
                    category: entry.category.clone(),
                    service: service.service.clone(),
                    occurred_at: entry.occurred_at,
                    old_stars: entry.stars,
                    new_stars: accrual.stars,
                    delta,
                    committed: false,
                    previous_service: relabel.map(|_| entry.service.clone()),
                });
            }
        }

        plan
    }

    /// Reconcile the scope. Each staff member is its own atomic batch: a
    /// retryable conflict rolls back that batch and the run moves on, any other
    /// store failure halts the run. Both are reported, never thrown.
    pub fn reconcile(
        &self,
        ledger: &mut Ledger,
        ctx: AccrualContext<'_>,
        scope: &ReconcileScope,
    ) -> std::result::Result<ReconciliationReport, EngineError> {
        let staff_list = match scope {
            ReconcileScope::Staff(id) => vec![ledger.staff(id)?],
            ReconcileScope::All => ledger.list_staff()?,
        };
        let mut report = ReconciliationReport::new(scope.clone(), self.options);

        tracing::info!(scope = %scope, staff = staff_list.len(), "reconciliation started");

        for staff in &staff_list {
            let entries = ledger.entries_for_staff(&staff.id)?;
            let mut plan = self.plan_staff(staff, &entries, ctx);

            report.skipped.append(&mut plan.skipped);
            for warning in plan.warnings.drain(..) {
                if !report.warnings.contains(&warning) {
                    report.warnings.push(warning);
                }
            }

            let ledger_sum: i64 = entries.iter().map(|e| e.stars).sum();
            let drifted = staff.stars != ledger_sum;
            if plan.staged.is_empty() && !(self.options.repair_aggregate && drifted) {
                continue;
            }

            if self.options.dry_run {
                if !plan.staged.is_empty() {
                    report.per_staff_delta.insert(staff.id.clone(), plan.ledger_delta);
                }
                report.details.append(&mut plan.corrections);
                continue;
            }

            match ledger.apply_corrections(&staff.id, &plan.staged, self.options.repair_aggregate) {
                Ok(commit) => {
                    for correction in plan.corrections.iter_mut() {
                        correction.committed = true;
                    }
                    report.updated_count += commit.applied;
                    if commit.applied > 0 {
                        report.per_staff_delta.insert(staff.id.clone(), plan.ledger_delta);
                    }
                    for warning in commit.warnings {
                        tracing::warn!(staff = %staff.id, "{}", warning.describe());
                        report.warnings.push(warning);
                    }
                    tracing::info!(
                        staff = %staff.id,
                        corrections = commit.applied,
                        aggregate_before = commit.aggregate_before,
                        aggregate_after = commit.aggregate_after,
                        "staff reconciled"
                    );
                    report.details.append(&mut plan.corrections);
                }
                Err(err) => {
                    let retryable = err.is_retryable();
                    tracing::warn!(staff = %staff.id, retryable, error = %err, "reconciliation batch rolled back");
                    report.failures.push(StaffFailure {
                        staff_id: staff.id.clone(),
                        error: err.to_string(),
                        retryable,
                    });
                    report.details.append(&mut plan.corrections);
                    if !retryable {
                        report.halted = true;
                        break;
                    }
                }
            }
        }

        tracing::info!("{}", report.summary());
        Ok(report)
    }
}

// ============================================================================
// TESTS
// ============================================================================
