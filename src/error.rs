// 🚨 Error taxonomy for the accrual engine
//
// Configuration and validation errors reject a single write.
// Commit errors mean the whole atomic unit was not applied.
// Consistency warnings are not errors: the operation proceeds with a
// correction (floor or clamp) and the warning travels back to the caller.

use serde::{Deserialize, Serialize};

// ============================================================================
// ENGINE ERROR
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("configuration error: {0}")]
    Configuration(#[from] ConfigurationError),

    #[error("validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("commit failed: {0}")]
    Commit(#[from] CommitError),

    #[error("transaction not found: {0}")]
    TransactionNotFound(String),

    #[error("pending request not found: {0}")]
    RequestNotFound(String),
}

impl EngineError {
    /// Only commit failures are worth retrying as a whole unit.
    pub fn is_retryable(&self) -> bool {
        match self {
            EngineError::Commit(err) => err.is_retryable(),
            _ => false,
        }
    }
}

impl From<rusqlite::Error> for EngineError {
    fn from(value: rusqlite::Error) -> Self {
        EngineError::Commit(CommitError::Store(value))
    }
}

// ============================================================================
// CONFIGURATION ERRORS (catalog / campaign data)
// ============================================================================

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ConfigurationError {
    #[error("service '{service}' not found in category '{category}'")]
    UnknownService { category: String, service: String },

    #[error("category '{category}' has no amount brackets")]
    NotBracketMapped { category: String },

    #[error("no bracket in category '{category}' matches amount {amount}")]
    NoMatchingBracket { category: String, amount: f64 },

    #[error("invalid catalog entry {category}/{service}: {reason}")]
    InvalidEntry {
        category: String,
        service: String,
        reason: String,
    },

    #[error("invalid campaign: {0}")]
    InvalidCampaign(String),
}

// ============================================================================
// VALIDATION ERRORS (caller input)
// ============================================================================

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ValidationError {
    #[error("amount must not be negative (got {0})")]
    NegativeAmount(f64),

    #[error("amount must be a finite number")]
    NonFiniteAmount,

    #[error("malformed timestamp '{0}'")]
    MalformedTimestamp(String),

    #[error("unknown staff member '{0}'")]
    UnknownStaff(String),

    #[error("staff member '{0}' already exists")]
    DuplicateStaff(String),

    #[error("a sale needs either a service or an amount")]
    MissingServiceOrAmount,

    #[error("request {id} is already {status}")]
    RequestNotPending { id: String, status: String },
}

// ============================================================================
// COMMIT ERRORS (store)
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum CommitError {
    #[error("store error: {0}")]
    Store(#[from] rusqlite::Error),

    #[error("transaction {transaction_id} changed concurrently (expected version {expected_version})")]
    Conflict {
        transaction_id: String,
        expected_version: i64,
    },

    #[error("failed to encode record: {0}")]
    Encoding(#[from] serde_json::Error),
}

impl CommitError {
    pub fn is_retryable(&self) -> bool {
        match self {
            CommitError::Conflict { .. } => true,
            CommitError::Store(rusqlite::Error::SqliteFailure(err, _)) => matches!(
                err.code,
                rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked
            ),
            _ => false,
        }
    }
}

// ============================================================================
// CONSISTENCY WARNINGS
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConsistencyWarning {
    /// Campaign multiplier resolved to zero or below; 1 was used instead.
    NonPositiveMultiplier {
        campaign_id: String,
        numerator: i64,
        denominator: i64,
    },

    /// Campaign multiplier between 0 and 1 would shrink awards; 1 was used instead.
    FractionalMultiplier {
        campaign_id: String,
        numerator: i64,
        denominator: i64,
    },

    /// Staff aggregate would have gone negative; it was clamped to zero.
    AggregateClamped {
        staff_id: String,
        before: i64,
        delta: i64,
    },
}

impl ConsistencyWarning {
    pub fn describe(&self) -> String {
        match self {
            ConsistencyWarning::NonPositiveMultiplier {
                campaign_id,
                numerator,
                denominator,
            } => format!(
                "campaign {} has non-positive multiplier {}/{}; using 1",
                campaign_id, numerator, denominator
            ),
            ConsistencyWarning::FractionalMultiplier {
                campaign_id,
                numerator,
                denominator,
            } => format!(
                "campaign {} has multiplier {}/{} below 1; using 1",
                campaign_id, numerator, denominator
            ),
            ConsistencyWarning::AggregateClamped {
                staff_id,
                before,
                delta,
            } => format!(
                "aggregate for {} clamped to 0 (was {}, delta {})",
                staff_id, before, delta
            ),
        }
    }
}
