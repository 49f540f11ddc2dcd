// Star Ledger - Core Library
// Staff reward accrual, ledger bookkeeping and reconciliation

pub mod error;
pub mod config;
pub mod telemetry;
pub mod campaign;       // Bonus campaigns & exact multipliers
pub mod catalog;        // Service catalog & amount brackets
pub mod accrual;        // Accrual function (stacking, recurring)
pub mod db;             // SQLite schema & row access
pub mod ledger;         // Atomic write paths & staff aggregate
pub mod reconciliation; // Ledger replay under current rules
pub mod import;         // CSV sales import
pub mod engine;         // Collaborator-facing facade

// Re-export commonly used types
pub use error::{CommitError, ConfigurationError, ConsistencyWarning, EngineError, ValidationError};
pub use config::{EngineConfig, StoreConfig, TelemetryConfig};
pub use campaign::{BonusCampaign, CampaignRegistry, CategoryFilter, Multiplier};
pub use catalog::{AmountBracket, CatalogEntry, ResolvedService, SaleItem, ServiceCatalog};
pub use accrual::{compute_stars, Accrual, AccrualContext, AccrualRule};
pub use db::{setup_database, Event, LedgerEntry, StaffRecord};
pub use ledger::{
    parse_timestamp, AggregateDrift, DeleteOutcome, EditOutcome, Ledger, NewSale,
    PendingRequest, RecordOutcome, RequestStatus,
};
pub use reconciliation::{
    Correction, ReconcileOptions, ReconcileScope, ReconciliationEngine, ReconciliationReport,
};
pub use import::{import_sales, load_sales_csv, ImportSummary, SalesFile};
pub use engine::{EditResult, StarEngine};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
