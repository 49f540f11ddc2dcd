// ⭐ Star Engine - the collaborator-facing surface
//
// Owns the ledger plus the current catalog and campaign snapshot. Every write
// accrues against that snapshot; campaign changes are persisted before the
// in-memory registry is swapped.

use crate::accrual::{compute_stars, Accrual, AccrualContext};
use crate::campaign::{BonusCampaign, CampaignRegistry};
use crate::catalog::{SaleItem, ServiceCatalog};
use crate::config::EngineConfig;
use crate::error::EngineError;
use crate::import::{import_sales, ImportSummary, SalesFile};
use crate::ledger::{
    AggregateDrift, DeleteOutcome, EditOutcome, Ledger, NewSale, PendingRequest, RecordOutcome,
};
use crate::reconciliation::{ReconcileOptions, ReconcileScope, ReconciliationEngine, ReconciliationReport};
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};

pub struct StarEngine {
    ledger: Ledger,
    catalog: ServiceCatalog,
    campaigns: CampaignRegistry,
    reconcile_on_edit: bool,
}

/// An edit plus the follow-up reconciliation, when one was configured.
#[derive(Debug, Clone)]
pub struct EditResult {
    pub edit: EditOutcome,
    pub reconciliation: Option<ReconciliationReport>,
}

impl StarEngine {
    /// Open the configured store and catalog, and restore the saved campaign.
    pub fn open(config: &EngineConfig) -> Result<Self> {
        let ledger = Ledger::open(&config.store.db_path, config.store.busy_timeout)
            .with_context(|| format!("Failed to open ledger: {}", config.store.db_path.display()))?;

        let catalog = match &config.catalog_path {
            Some(path) => ServiceCatalog::from_file(path)?,
            None => ServiceCatalog::with_defaults(),
        };

        let mut engine = Self::new(ledger, catalog)?;
        engine.reconcile_on_edit = config.reconcile_on_edit;
        Ok(engine)
    }

    pub fn new(ledger: Ledger, catalog: ServiceCatalog) -> Result<Self> {
        let campaigns = match ledger.load_campaign()? {
            Some(campaign) => CampaignRegistry::with_campaign(campaign).context("Stored campaign is invalid")?,
            None => CampaignRegistry::new(),
        };

        tracing::debug!(entries = catalog.len(), campaign = campaigns.stored().is_some(), "engine ready");

        Ok(StarEngine {
            ledger,
            catalog,
            campaigns,
            reconcile_on_edit: false,
        })
    }

    pub fn with_reconcile_on_edit(mut self, enabled: bool) -> Self {
        self.reconcile_on_edit = enabled;
        self
    }

    /// Split borrow: the ledger to write to and the rules to accrue with.
    fn parts(&mut self) -> (&mut Ledger, AccrualContext<'_>) {
        (&mut self.ledger, AccrualContext::new(&self.catalog, &self.campaigns))
    }

    pub fn ledger(&self) -> &Ledger {
        &self.ledger
    }

    pub fn ledger_mut(&mut self) -> &mut Ledger {
        &mut self.ledger
    }

    pub fn catalog(&self) -> &ServiceCatalog {
        &self.catalog
    }

    /// Swap in a new catalog. Stored stars are untouched until a reconcile.
    pub fn set_catalog(&mut self, catalog: ServiceCatalog) {
        self.catalog = catalog;
    }

    pub fn campaign(&self) -> Option<&BonusCampaign> {
        self.campaigns.stored()
    }

    pub fn set_campaign(&mut self, campaign: BonusCampaign) -> Result<(), EngineError> {
        campaign.validate()?;
        self.ledger.save_campaign(&campaign)?;
        tracing::info!(campaign = %campaign.id, multiplier = %campaign.multiplier, "campaign set");
        self.campaigns.set(campaign)?;
        Ok(())
    }

    pub fn clear_campaign(&mut self) -> Result<(), EngineError> {
        self.ledger.clear_campaign()?;
        self.campaigns.clear();
        tracing::info!("campaign cleared");
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Accrual
    // ------------------------------------------------------------------------

    /// Pure accrual for a sale at a known position; touches no state.
    pub fn compute_stars(
        &self,
        category: &str,
        item: &SaleItem,
        occurred_at: DateTime<Utc>,
        position: u64,
    ) -> Result<Accrual, EngineError> {
        compute_stars(category, item, occurred_at, position, &self.catalog, &self.campaigns)
    }

    pub fn record_sale(&mut self, sale: &NewSale) -> Result<RecordOutcome, EngineError> {
        let (ledger, ctx) = self.parts();
        ledger.record_sale(ctx, sale)
    }

    pub fn edit_transaction(&mut self, id: &str, category: &str, item: &SaleItem) -> Result<EditResult, EngineError> {
        let reconcile_on_edit = self.reconcile_on_edit;
        let (ledger, ctx) = self.parts();
        let edit = ledger.edit_transaction(ctx, id, category, item)?;

        let reconciliation = if reconcile_on_edit {
            let scope = ReconcileScope::Staff(edit.after.staff_id.clone());
            Some(ReconciliationEngine::new().reconcile(ledger, ctx, &scope)?)
        } else {
            None
        };

        Ok(EditResult { edit, reconciliation })
    }

    pub fn delete_transaction(&mut self, id: &str) -> Result<DeleteOutcome, EngineError> {
        self.ledger.delete_transaction(id)
    }

    // ------------------------------------------------------------------------
    // Pending requests
    // ------------------------------------------------------------------------

    pub fn submit_request(&mut self, sale: &NewSale) -> Result<PendingRequest, EngineError> {
        let (ledger, ctx) = self.parts();
        ledger.submit_request(ctx, sale)
    }

    pub fn pending_requests(&self) -> Result<Vec<PendingRequest>, EngineError> {
        self.ledger.pending_requests()
    }

    pub fn approve_request(&mut self, id: &str) -> Result<RecordOutcome, EngineError> {
        let (ledger, ctx) = self.parts();
        ledger.approve_request(ctx, id)
    }

    pub fn reject_request(&mut self, id: &str) -> Result<PendingRequest, EngineError> {
        self.ledger.reject_request(id)
    }

    // ------------------------------------------------------------------------
    // Bulk & maintenance
    // ------------------------------------------------------------------------

    pub fn import(&mut self, sales: &SalesFile) -> Result<ImportSummary, EngineError> {
        let (ledger, ctx) = self.parts();
        import_sales(ledger, ctx, sales)
    }

    pub fn reconcile(
        &mut self,
        scope: &ReconcileScope,
        options: ReconcileOptions,
    ) -> Result<ReconciliationReport, EngineError> {
        let (ledger, ctx) = self.parts();
        ReconciliationEngine::with_options(options).reconcile(ledger, ctx, scope)
    }

    pub fn aggregate_drift(&self) -> Result<Vec<AggregateDrift>, EngineError> {
        self.ledger.aggregate_drift()
    }

    /// Read-only snapshot for callers that want to plan without writing.
    pub fn accrual_context(&self) -> AccrualContext<'_> {
        AccrualContext::new(&self.catalog, &self.campaigns)
    }
}
