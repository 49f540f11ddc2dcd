// 🎉 Bonus Campaign Registry - time-bounded multipliers
//
// At most one campaign is considered at a time. A transaction is "under bonus"
// when the campaign is enabled, the transaction's calendar date falls inside
// [start_date, end_date] (both inclusive, either may be open) and its category
// matches the campaign filter.

use crate::error::{ConfigurationError, ConsistencyWarning};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::fmt;

// ============================================================================
// MULTIPLIER
// ============================================================================

/// Exact rational multiplier. Stored as configured, so a value below 1 can
/// exist in data; `resolve` turns it into a usable one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "MultiplierRepr", into = "MultiplierRepr")]
pub struct Multiplier {
    numerator: i64,
    denominator: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
enum MultiplierRepr {
    Whole(i64),
    Ratio { numerator: i64, denominator: i64 },
}

impl Multiplier {
    pub const ONE: Multiplier = Multiplier {
        numerator: 1,
        denominator: 1,
    };

    pub fn whole(value: i64) -> Self {
        Multiplier {
            numerator: value,
            denominator: 1,
        }
    }

    /// Returns None for a zero denominator. Sign is normalised onto the numerator.
    pub fn ratio(numerator: i64, denominator: i64) -> Option<Self> {
        if denominator == 0 {
            return None;
        }
        let (numerator, denominator) = if denominator < 0 {
            (-numerator, -denominator)
        } else {
            (numerator, denominator)
        };
        Some(Multiplier {
            numerator,
            denominator,
        })
    }

    pub fn numerator(&self) -> i64 {
        self.numerator
    }

    pub fn denominator(&self) -> i64 {
        self.denominator
    }

    pub fn is_positive(&self) -> bool {
        self.numerator > 0
    }

    /// A campaign may only add stars; anything under x1 is not usable as is.
    pub fn is_below_one(&self) -> bool {
        self.numerator < self.denominator
    }

    /// floor(value * self) for non-negative values.
    pub fn scale_floor(&self, value: i64) -> i64 {
        (value * self.numerator).div_euclid(self.denominator)
    }
}

impl Default for Multiplier {
    fn default() -> Self {
        Multiplier::ONE
    }
}

impl fmt::Display for Multiplier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.denominator == 1 {
            write!(f, "x{}", self.numerator)
        } else {
            write!(f, "x{}/{}", self.numerator, self.denominator)
        }
    }
}

impl TryFrom<MultiplierRepr> for Multiplier {
    type Error = String;

    fn try_from(value: MultiplierRepr) -> Result<Self, Self::Error> {
        match value {
            MultiplierRepr::Whole(n) => Ok(Multiplier::whole(n)),
            MultiplierRepr::Ratio {
                numerator,
                denominator,
            } => Multiplier::ratio(numerator, denominator)
                .ok_or_else(|| "multiplier denominator must not be zero".to_string()),
        }
    }
}

impl From<Multiplier> for MultiplierRepr {
    fn from(value: Multiplier) -> Self {
        if value.denominator == 1 {
            MultiplierRepr::Whole(value.numerator)
        } else {
            MultiplierRepr::Ratio {
                numerator: value.numerator,
                denominator: value.denominator,
            }
        }
    }
}

/// Multiplier after flooring to 1, plus the warning when flooring happened.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedMultiplier {
    pub multiplier: Multiplier,
    pub warning: Option<ConsistencyWarning>,
}

impl ResolvedMultiplier {
    fn neutral() -> Self {
        ResolvedMultiplier {
            multiplier: Multiplier::ONE,
            warning: None,
        }
    }
}

// ============================================================================
// CATEGORY FILTER
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum CategoryFilter {
    All,
    Category(String),
}

impl CategoryFilter {
    pub fn matches(&self, category: &str) -> bool {
        match self {
            CategoryFilter::All => true,
            CategoryFilter::Category(name) => name == category,
        }
    }
}

impl From<String> for CategoryFilter {
    fn from(value: String) -> Self {
        if value.trim().eq_ignore_ascii_case("all") {
            CategoryFilter::All
        } else {
            CategoryFilter::Category(value)
        }
    }
}

impl From<CategoryFilter> for String {
    fn from(value: CategoryFilter) -> Self {
        match value {
            CategoryFilter::All => "all".to_string(),
            CategoryFilter::Category(name) => name,
        }
    }
}

// ============================================================================
// BONUS CAMPAIGN
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BonusCampaign {
    #[serde(default = "default_campaign_id")]
    pub id: String,

    #[serde(default)]
    pub name: String,

    pub category_filter: CategoryFilter,

    pub multiplier: Multiplier,

    /// First bonus day, inclusive (None = open start)
    #[serde(default)]
    pub start_date: Option<NaiveDate>,

    /// Last bonus day, inclusive (None = open end)
    #[serde(default)]
    pub end_date: Option<NaiveDate>,

    pub enabled: bool,
}

fn default_campaign_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

impl BonusCampaign {
    pub fn new(category_filter: CategoryFilter, multiplier: Multiplier) -> Self {
        BonusCampaign {
            id: default_campaign_id(),
            name: String::new(),
            category_filter,
            multiplier,
            start_date: None,
            end_date: None,
            enabled: true,
        }
    }

    pub fn with_window(mut self, start: Option<NaiveDate>, end: Option<NaiveDate>) -> Self {
        self.start_date = start;
        self.end_date = end;
        self
    }

    pub fn validate(&self) -> Result<(), ConfigurationError> {
        if let (Some(start), Some(end)) = (self.start_date, self.end_date) {
            if start > end {
                return Err(ConfigurationError::InvalidCampaign(format!(
                    "start date {} is after end date {}",
                    start, end
                )));
            }
        }
        Ok(())
    }

    pub fn covers_date(&self, date: NaiveDate) -> bool {
        if let Some(start) = self.start_date {
            if date < start {
                return false;
            }
        }
        if let Some(end) = self.end_date {
            if date > end {
                return false;
            }
        }
        true
    }

    pub fn is_active_on(&self, date: NaiveDate) -> bool {
        self.enabled && self.covers_date(date)
    }

    pub fn applies_to(&self, category: &str, date: NaiveDate) -> bool {
        self.is_active_on(date) && self.category_filter.matches(category)
    }
}

// ============================================================================
// CAMPAIGN REGISTRY
// ============================================================================

#[derive(Debug, Clone, Default)]
pub struct CampaignRegistry {
    campaign: Option<BonusCampaign>,
}

impl CampaignRegistry {
    pub fn new() -> Self {
        CampaignRegistry { campaign: None }
    }

    pub fn with_campaign(campaign: BonusCampaign) -> Result<Self, ConfigurationError> {
        let mut registry = CampaignRegistry::new();
        registry.set(campaign)?;
        Ok(registry)
    }

    /// Replace the stored campaign (there is only ever one).
    pub fn set(&mut self, campaign: BonusCampaign) -> Result<(), ConfigurationError> {
        campaign.validate()?;
        self.campaign = Some(campaign);
        Ok(())
    }

    pub fn clear(&mut self) {
        self.campaign = None;
    }

    pub fn stored(&self) -> Option<&BonusCampaign> {
        self.campaign.as_ref()
    }

    pub fn active_campaign_on(&self, date: NaiveDate) -> Option<&BonusCampaign> {
        self.campaign.as_ref().filter(|c| c.is_active_on(date))
    }

    /// Multiplier for a category on a date. Values below 1 are floored to 1
    /// and reported.
    pub fn resolve(&self, category: &str, date: NaiveDate) -> ResolvedMultiplier {
        let campaign = match self.active_campaign_on(date) {
            Some(c) if c.category_filter.matches(category) => c,
            _ => return ResolvedMultiplier::neutral(),
        };

        let multiplier = campaign.multiplier;
        if !multiplier.is_below_one() {
            return ResolvedMultiplier {
                multiplier,
                warning: None,
            };
        }

        tracing::warn!(
            campaign = %campaign.id,
            multiplier = %multiplier,
            "campaign multiplier below 1, falling back to 1"
        );
        let campaign_id = campaign.id.clone();
        let (numerator, denominator) = (multiplier.numerator(), multiplier.denominator());
        let warning = if multiplier.is_positive() {
            ConsistencyWarning::FractionalMultiplier {
                campaign_id,
                numerator,
                denominator,
            }
        } else {
            ConsistencyWarning::NonPositiveMultiplier {
                campaign_id,
                numerator,
                denominator,
            }
        };
        ResolvedMultiplier {
            multiplier: Multiplier::ONE,
            warning: Some(warning),
        }
    }

    pub fn multiplier_for(&self, category: &str, date: NaiveDate) -> Multiplier {
        self.resolve(category, date).multiplier
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn day(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn march_campaign() -> BonusCampaign {
        BonusCampaign::new(
            CategoryFilter::Category("Telefoni".to_string()),
            Multiplier::whole(3),
        )
        .with_window(Some(day(2025, 3, 1)), Some(day(2025, 3, 31)))
    }

    #[test]
    fn test_campaign_window_is_inclusive() {
        let registry = CampaignRegistry::with_campaign(march_campaign()).unwrap();

        assert_eq!(registry.multiplier_for("Telefoni", day(2025, 2, 28)), Multiplier::ONE);
        assert_eq!(registry.multiplier_for("Telefoni", day(2025, 3, 1)), Multiplier::whole(3));
        assert_eq!(registry.multiplier_for("Telefoni", day(2025, 3, 31)), Multiplier::whole(3));
        assert_eq!(registry.multiplier_for("Telefoni", day(2025, 4, 1)), Multiplier::ONE);
    }

    #[test]
    fn test_category_filter() {
        let registry = CampaignRegistry::with_campaign(march_campaign()).unwrap();
        assert_eq!(registry.multiplier_for("Forsikring", day(2025, 3, 10)), Multiplier::ONE);

        let all = BonusCampaign::new(CategoryFilter::All, Multiplier::whole(2));
        let registry = CampaignRegistry::with_campaign(all).unwrap();
        assert_eq!(registry.multiplier_for("Forsikring", day(2030, 1, 1)), Multiplier::whole(2));
    }

    #[test]
    fn test_disabled_campaign_is_not_active() {
        let mut campaign = march_campaign();
        campaign.enabled = false;
        let registry = CampaignRegistry::with_campaign(campaign).unwrap();

        assert!(registry.active_campaign_on(day(2025, 3, 10)).is_none());
        assert_eq!(registry.multiplier_for("Telefoni", day(2025, 3, 10)), Multiplier::ONE);
    }

    #[test]
    fn test_non_positive_multiplier_floors_to_one() {
        let campaign = BonusCampaign::new(CategoryFilter::All, Multiplier::whole(0));
        let registry = CampaignRegistry::with_campaign(campaign).unwrap();

        let resolved = registry.resolve("Telefoni", day(2025, 5, 5));
        assert_eq!(resolved.multiplier, Multiplier::ONE);
        assert!(matches!(
            resolved.warning,
            Some(ConsistencyWarning::NonPositiveMultiplier { numerator: 0, .. })
        ));
    }

    #[test]
    fn test_fractional_multiplier_floors_to_one() {
        let half = Multiplier::ratio(1, 2).unwrap();
        let campaign = BonusCampaign::new(CategoryFilter::All, half);
        let registry = CampaignRegistry::with_campaign(campaign).unwrap();

        let resolved = registry.resolve("Service", day(2025, 5, 5));
        assert_eq!(resolved.multiplier, Multiplier::ONE);
        assert!(matches!(
            resolved.warning,
            Some(ConsistencyWarning::FractionalMultiplier { numerator: 1, denominator: 2, .. })
        ));

        // x1 itself and anything above pass through untouched
        for kept in [Multiplier::ONE, Multiplier::ratio(3, 2).unwrap()] {
            let registry = CampaignRegistry::with_campaign(BonusCampaign::new(CategoryFilter::All, kept)).unwrap();
            let resolved = registry.resolve("Service", day(2025, 5, 5));
            assert_eq!(resolved.multiplier, kept);
            assert!(resolved.warning.is_none());
        }
    }

    #[test]
    fn test_inverted_window_rejected() {
        let campaign = march_campaign().with_window(Some(day(2025, 4, 1)), Some(day(2025, 3, 1)));
        assert!(matches!(
            CampaignRegistry::with_campaign(campaign),
            Err(ConfigurationError::InvalidCampaign(_))
        ));
    }

    #[test]
    fn test_multiplier_json_forms() {
        let whole: Multiplier = serde_json::from_str("3").unwrap();
        assert_eq!(whole, Multiplier::whole(3));

        let ratio: Multiplier = serde_json::from_str(r#"{"numerator": 3, "denominator": 2}"#).unwrap();
        assert_eq!(ratio.scale_floor(3), 4);

        assert!(serde_json::from_str::<Multiplier>(r#"{"numerator": 1, "denominator": 0}"#).is_err());
    }

    #[test]
    fn test_campaign_json() {
        let json = r#"{
            "category_filter": "ALL",
            "multiplier": 2,
            "start_date": "2025-06-01",
            "enabled": true
        }"#;
        let campaign: BonusCampaign = serde_json::from_str(json).unwrap();
        assert_eq!(campaign.category_filter, CategoryFilter::All);
        assert!(campaign.end_date.is_none());
        assert!(campaign.applies_to("Anything", day(2026, 1, 1)));
        assert!(!campaign.applies_to("Anything", day(2025, 5, 31)));
    }
}
