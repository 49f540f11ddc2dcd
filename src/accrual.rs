// ⭐ Accrual Function - how many stars one transaction earns
//
// Non-stacking:  floor(base * m)
// Stacking (k):  A(n) = floor(n * m / k) * base, credited(n) = A(n) - A(n-1)
// Recurring:     floor(base * m) for the first occurrence, 0 afterwards
//
// Positions are 1-based within the (staff, category, service) sequence ordered
// by (timestamp, seq). With a constant multiplier the credited values of
// positions 1..n always sum to A(n), however the sequence was built.

use crate::campaign::{CampaignRegistry, Multiplier};
use crate::catalog::{ResolvedService, SaleItem, ServiceCatalog};
use crate::error::{ConsistencyWarning, EngineError};
use chrono::{DateTime, Utc};

// ============================================================================
// ACCRUAL RULE
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccrualRule {
    Single { base_stars: i64 },
    Stacked { base_stars: i64, stack_size: u32 },
    RecurringOnce { base_stars: i64 },
}

impl AccrualRule {
    pub fn for_service(service: &ResolvedService) -> Self {
        if service.is_recurring() {
            AccrualRule::RecurringOnce {
                base_stars: service.base_stars,
            }
        } else if service.is_stacking() {
            AccrualRule::Stacked {
                base_stars: service.base_stars,
                stack_size: service.stack_size,
            }
        } else {
            AccrualRule::Single {
                base_stars: service.base_stars,
            }
        }
    }

    /// Stars credited to the transaction at `position` (1-based).
    pub fn credited_stars(&self, position: u64, multiplier: Multiplier) -> i64 {
        match *self {
            AccrualRule::Single { base_stars } => multiplier.scale_floor(base_stars),
            AccrualRule::Stacked {
                base_stars,
                stack_size,
            } => {
                let current = cumulative_award(position, multiplier, stack_size, base_stars);
                let previous =
                    cumulative_award(position.saturating_sub(1), multiplier, stack_size, base_stars);
                current - previous
            }
            AccrualRule::RecurringOnce { base_stars } => {
                if position == 1 {
                    multiplier.scale_floor(base_stars)
                } else {
                    0
                }
            }
        }
    }
}

/// A(n) = floor(n * m / k) * base, with A(0) = 0.
pub fn cumulative_award(position: u64, multiplier: Multiplier, stack_size: u32, base_stars: i64) -> i64 {
    if position == 0 || stack_size == 0 {
        return 0;
    }
    let units = (position as i64 * multiplier.numerator())
        .div_euclid(multiplier.denominator() * stack_size as i64);
    units * base_stars
}

// ============================================================================
// ACCRUAL
// ============================================================================

/// Catalog and campaign snapshot every write path accrues against.
#[derive(Debug, Clone, Copy)]
pub struct AccrualContext<'a> {
    pub catalog: &'a ServiceCatalog,
    pub campaigns: &'a CampaignRegistry,
}

impl<'a> AccrualContext<'a> {
    pub fn new(catalog: &'a ServiceCatalog, campaigns: &'a CampaignRegistry) -> Self {
        AccrualContext { catalog, campaigns }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Accrual {
    pub stars: i64,
    pub position: u64,
    pub multiplier: Multiplier,
    pub warnings: Vec<ConsistencyWarning>,
}

/// Accrue an already-resolved service at a known position.
pub fn accrue(
    service: &ResolvedService,
    occurred_at: DateTime<Utc>,
    position: u64,
    campaigns: &CampaignRegistry,
) -> Accrual {
    let resolved = campaigns.resolve(&service.category, occurred_at.date_naive());
    let stars = AccrualRule::for_service(service).credited_stars(position, resolved.multiplier);

    Accrual {
        stars,
        position,
        multiplier: resolved.multiplier,
        warnings: resolved.warning.into_iter().collect(),
    }
}

/// Stars for one sale given its catalog and campaign snapshot.
/// Unknown services and invalid amounts are rejected before any math runs.
pub fn compute_stars(
    category: &str,
    item: &SaleItem,
    occurred_at: DateTime<Utc>,
    position: u64,
    catalog: &ServiceCatalog,
    campaigns: &CampaignRegistry,
) -> Result<Accrual, EngineError> {
    let service = catalog.resolve_sale(category, item)?;
    Ok(accrue(&service, occurred_at, position, campaigns))
}

/// Replay a full same-key sequence. `timestamps` must already be in
/// (timestamp, seq) order; element i receives position i + 1.
pub fn replay_sequence<I>(service: &ResolvedService, timestamps: I, campaigns: &CampaignRegistry) -> Vec<Accrual>
where
    I: IntoIterator<Item = DateTime<Utc>>,
{
    timestamps
        .into_iter()
        .enumerate()
        .map(|(i, occurred_at)| accrue(service, occurred_at, i as u64 + 1, campaigns))
        .collect()
}

// ============================================================================
// TESTS
// ============================================================================
