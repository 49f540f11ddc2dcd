// 📒 Service Catalog - reward rules as data
// One entry per (category, service): base stars, stack size, recurring flag and
// an optional amount-bracket table for insurance-type products.

use crate::error::{ConfigurationError, EngineError, ValidationError};
use anyhow::{Context as AnyhowContext, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

// ============================================================================
// CATALOG ENTRY
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CatalogEntry {
    pub category: String,

    pub service: String,

    /// Stars for one completed unit (ignored when a bracket supplies the value)
    pub base_stars: i64,

    /// Number of identical transactions needed before any stars release
    #[serde(default = "default_stack_size")]
    pub stack_size: u32,

    /// Bracket-mapped only: stars are granted once per staff/service pair
    #[serde(default)]
    pub recurring: bool,

    #[serde(default)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub amount_brackets: Option<Vec<AmountBracket>>,
}

fn default_stack_size() -> u32 {
    1
}

/// Whole-krone range, both ends inclusive. `max = None` means open-ended.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AmountBracket {
    pub label: String,
    pub min: u64,
    #[serde(default)]
    pub max: Option<u64>,
    pub stars: i64,
}

impl AmountBracket {
    pub fn contains(&self, whole_amount: u64) -> bool {
        whole_amount >= self.min && self.max.map_or(true, |max| whole_amount <= max)
    }
}

impl CatalogEntry {
    pub fn new(category: &str, service: &str, base_stars: i64) -> Self {
        CatalogEntry {
            category: category.to_string(),
            service: service.to_string(),
            base_stars,
            stack_size: 1,
            recurring: false,
            amount_brackets: None,
        }
    }

    pub fn stacked(mut self, stack_size: u32) -> Self {
        self.stack_size = stack_size;
        self
    }

    pub fn with_brackets(mut self, recurring: bool, brackets: Vec<AmountBracket>) -> Self {
        self.recurring = recurring;
        self.amount_brackets = Some(brackets);
        self
    }

    pub fn is_bracket_mapped(&self) -> bool {
        self.amount_brackets.is_some()
    }

    /// Service name recorded on transactions derived from a bracket.
    pub fn bracket_service_label(&self, bracket: &AmountBracket) -> String {
        format!("{} - {}", self.service, bracket.label)
    }

    fn invalid(&self, reason: impl Into<String>) -> ConfigurationError {
        ConfigurationError::InvalidEntry {
            category: self.category.clone(),
            service: self.service.clone(),
            reason: reason.into(),
        }
    }

    fn validate(&self) -> Result<(), ConfigurationError> {
        if self.base_stars <= 0 {
            return Err(self.invalid("base_stars must be positive"));
        }
        if self.stack_size == 0 {
            return Err(self.invalid("stack_size must be positive"));
        }

        let Some(brackets) = &self.amount_brackets else {
            return Ok(());
        };
        if brackets.is_empty() {
            return Err(self.invalid("bracket table is empty"));
        }

        for (i, bracket) in brackets.iter().enumerate() {
            if bracket.stars < 0 {
                return Err(self.invalid(format!("bracket '{}' has negative stars", bracket.label)));
            }
            if let Some(max) = bracket.max {
                if max < bracket.min {
                    return Err(self.invalid(format!("bracket '{}' has max below min", bracket.label)));
                }
            }
            if i == 0 {
                continue;
            }
            let previous = &brackets[i - 1];
            match previous.max {
                None => {
                    return Err(self.invalid(format!(
                        "open-ended bracket '{}' must be last",
                        previous.label
                    )))
                }
                Some(prev_max) if bracket.min != prev_max + 1 => {
                    return Err(self.invalid(format!(
                        "brackets '{}' and '{}' are not contiguous",
                        previous.label, bracket.label
                    )))
                }
                Some(_) => {}
            }
        }

        Ok(())
    }
}

// ============================================================================
// RESOLUTION RESULTS
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
pub struct BracketMatch {
    pub service_label: String,
    pub base_stars: i64,
}

/// Everything the accrual function needs to know about one sale's service.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedService {
    pub category: String,
    pub service: String,
    pub base_stars: i64,
    pub stack_size: u32,
    pub recurring: bool,
    pub bracket_mapped: bool,
}

impl ResolvedService {
    pub fn is_stacking(&self) -> bool {
        self.stack_size > 1
    }

    /// Recurring only means something for bracket-mapped entries.
    pub fn is_recurring(&self) -> bool {
        self.bracket_mapped && self.recurring
    }
}

/// What the caller sold: a catalog service name or a monetary amount.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SaleItem {
    Service(String),
    Amount(f64),
}

pub fn validate_amount(amount: f64) -> Result<u64, ValidationError> {
    if !amount.is_finite() {
        return Err(ValidationError::NonFiniteAmount);
    }
    if amount < 0.0 {
        return Err(ValidationError::NegativeAmount(amount));
    }
    // Brackets are whole kroner; the fractional part never moves a sale up a tier.
    Ok(amount.trunc() as u64)
}

// ============================================================================
// SERVICE CATALOG
// ============================================================================

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct CatalogDocument {
    entries: Vec<CatalogEntry>,
}

#[derive(Debug, Clone, Default)]
pub struct ServiceCatalog {
    entries: BTreeMap<(String, String), CatalogEntry>,
    /// category -> service of its bracket-mapped entry
    bracket_tables: BTreeMap<String, String>,
}

impl ServiceCatalog {
    pub fn new() -> Self {
        ServiceCatalog::default()
    }

    /// Load catalog from a JSON document `{ "entries": [...] }`
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(path.as_ref())
            .with_context(|| format!("Failed to read catalog file: {:?}", path.as_ref()))?;

        let document: CatalogDocument =
            serde_json::from_str(&content).context("Failed to parse catalog JSON")?;

        let catalog = ServiceCatalog::from_entries(document.entries)
            .context("Catalog failed validation")?;
        Ok(catalog)
    }

    pub fn from_entries(entries: Vec<CatalogEntry>) -> Result<Self, ConfigurationError> {
        let mut catalog = ServiceCatalog::new();
        for entry in entries {
            catalog.insert(entry)?;
        }
        Ok(catalog)
    }

    fn insert(&mut self, entry: CatalogEntry) -> Result<(), ConfigurationError> {
        entry.validate()?;

        let key = (entry.category.clone(), entry.service.clone());
        if self.entries.contains_key(&key) {
            return Err(entry.invalid("duplicate catalog entry"));
        }
        if entry.is_bracket_mapped() {
            if let Some(existing) = self.bracket_tables.get(&entry.category) {
                return Err(entry.invalid(format!(
                    "category already has a bracket table on '{}'",
                    existing
                )));
            }
            self.bracket_tables
                .insert(entry.category.clone(), entry.service.clone());
        }

        self.entries.insert(key, entry);
        Ok(())
    }

    /// Built-in catalog used when no catalog file is configured
    pub fn with_defaults() -> Self {
        let brackets = |stars: [i64; 4]| {
            vec![
                AmountBracket { label: "1-99kr".to_string(), min: 1, max: Some(99), stars: stars[0] },
                AmountBracket { label: "100-299kr".to_string(), min: 100, max: Some(299), stars: stars[1] },
                AmountBracket { label: "300-499kr".to_string(), min: 300, max: Some(499), stars: stars[2] },
                AmountBracket { label: "500kr+".to_string(), min: 500, max: None, stars: stars[3] },
            ]
        };

        let entries = vec![
            CatalogEntry::new("Telefoni", "Teletime15 x3", 1).stacked(3),
            CatalogEntry::new("Telefoni", "Nytt abonnement", 2),
            CatalogEntry::new("Telefoni", "Mobiltelefon", 1),
            CatalogEntry::new("Tilbehør", "Deksel x5", 1).stacked(5),
            CatalogEntry::new("Tilbehør", "Skjermbeskytter", 1),
            CatalogEntry::new("Service", "Datarens", 1),
            CatalogEntry::new("Service", "Oppsett", 2),
            CatalogEntry::new("Forsikring", "Gjentakende", 1)
                .with_brackets(true, brackets([1, 2, 3, 4])),
            CatalogEntry::new("Engangsforsikring", "Engangs", 1)
                .with_brackets(false, brackets([1, 1, 2, 3])),
        ];

        // The built-in table is fixed; it always validates.
        let mut catalog = ServiceCatalog::new();
        for entry in entries {
            if let Err(err) = catalog.insert(entry) {
                tracing::error!(error = %err, "built-in catalog entry rejected");
            }
        }
        catalog
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> impl Iterator<Item = &CatalogEntry> {
        self.entries.values()
    }

    /// Exact lookup by (category, service).
    pub fn resolve_catalog_entry(
        &self,
        category: &str,
        service: &str,
    ) -> Result<&CatalogEntry, ConfigurationError> {
        self.entries
            .get(&(category.to_string(), service.to_string()))
            .ok_or_else(|| ConfigurationError::UnknownService {
                category: category.to_string(),
                service: service.to_string(),
            })
    }

    /// Select the unique bracket matching `amount` in the category's bracket table.
    pub fn bracket_for(&self, category: &str, amount: f64) -> Result<BracketMatch, EngineError> {
        let whole = validate_amount(amount)?;
        let entry = self.bracket_entry(category)?;
        let brackets = entry.amount_brackets.as_deref().unwrap_or_default();

        brackets
            .iter()
            .find(|b| b.contains(whole))
            .map(|b| BracketMatch {
                service_label: entry.bracket_service_label(b),
                base_stars: b.stars,
            })
            .ok_or_else(|| {
                ConfigurationError::NoMatchingBracket {
                    category: category.to_string(),
                    amount,
                }
                .into()
            })
    }

    fn bracket_entry(&self, category: &str) -> Result<&CatalogEntry, ConfigurationError> {
        let service = self
            .bracket_tables
            .get(category)
            .ok_or_else(|| ConfigurationError::NotBracketMapped {
                category: category.to_string(),
            })?;
        self.resolve_catalog_entry(category, service)
    }

    /// Resolve what a sale earns per unit. Every write path goes through here.
    pub fn resolve_sale(&self, category: &str, item: &SaleItem) -> Result<ResolvedService, EngineError> {
        match item {
            SaleItem::Amount(amount) => {
                let matched = self.bracket_for(category, *amount)?;
                let entry = self.bracket_entry(category)?;
                Ok(ResolvedService {
                    category: category.to_string(),
                    service: matched.service_label,
                    base_stars: matched.base_stars,
                    stack_size: entry.stack_size,
                    recurring: entry.recurring,
                    bracket_mapped: true,
                })
            }
            SaleItem::Service(service) => Ok(self.resolve_service_name(category, service)?),
        }
    }

    /// Resolve a stored service name, including bracket-derived labels such as
    /// "Gjentakende - 100-299kr". A bracket-mapped entry's own name is not a
    /// service; only its bracket labels are.
    pub fn resolve_service_name(
        &self,
        category: &str,
        service: &str,
    ) -> Result<ResolvedService, ConfigurationError> {
        let unknown = || ConfigurationError::UnknownService {
            category: category.to_string(),
            service: service.to_string(),
        };

        if let Ok(entry) = self.resolve_catalog_entry(category, service) {
            if entry.is_bracket_mapped() {
                return Err(unknown());
            }
            return Ok(ResolvedService {
                category: entry.category.clone(),
                service: entry.service.clone(),
                base_stars: entry.base_stars,
                stack_size: entry.stack_size,
                recurring: entry.recurring,
                bracket_mapped: false,
            });
        }

        let entry = self.bracket_entry(category).map_err(|_| unknown())?;
        let bracket = entry
            .amount_brackets
            .iter()
            .flatten()
            .find(|b| entry.bracket_service_label(b) == service)
            .ok_or_else(unknown)?;

        Ok(ResolvedService {
            category: entry.category.clone(),
            service: service.to_string(),
            base_stars: bracket.stars,
            stack_size: entry.stack_size,
            recurring: entry.recurring,
            bracket_mapped: true,
        })
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bracket_boundaries() {
        let catalog = ServiceCatalog::with_defaults();

        let at_100 = catalog.bracket_for("Forsikring", 100.0).unwrap();
        assert_eq!(at_100.service_label, "Gjentakende - 100-299kr");

        let at_299 = catalog.bracket_for("Forsikring", 299.0).unwrap();
        assert_eq!(at_299.service_label, "Gjentakende - 100-299kr");

        let at_300 = catalog.bracket_for("Forsikring", 300.0).unwrap();
        assert_eq!(at_300.service_label, "Gjentakende - 300-499kr");
        assert_eq!(at_300.base_stars, 3);

        let at_99 = catalog.bracket_for("Forsikring", 99.0).unwrap();
        assert_eq!(at_99.service_label, "Gjentakende - 1-99kr");

        let huge = catalog.bracket_for("Forsikring", 25_000.0).unwrap();
        assert_eq!(huge.service_label, "Gjentakende - 500kr+");
    }

    #[test]
    fn test_fractional_amount_stays_in_lower_bracket() {
        let catalog = ServiceCatalog::with_defaults();
        let matched = catalog.bracket_for("Forsikring", 299.9).unwrap();
        assert_eq!(matched.service_label, "Gjentakende - 100-299kr");
    }

    #[test]
    fn test_bracket_rejections() {
        let catalog = ServiceCatalog::with_defaults();

        assert!(matches!(
            catalog.bracket_for("Forsikring", -1.0),
            Err(EngineError::Validation(ValidationError::NegativeAmount(_)))
        ));
        assert!(matches!(
            catalog.bracket_for("Forsikring", f64::NAN),
            Err(EngineError::Validation(ValidationError::NonFiniteAmount))
        ));
        assert!(matches!(
            catalog.bracket_for("Forsikring", 0.0),
            Err(EngineError::Configuration(ConfigurationError::NoMatchingBracket { .. }))
        ));
        assert!(matches!(
            catalog.bracket_for("Telefoni", 150.0),
            Err(EngineError::Configuration(ConfigurationError::NotBracketMapped { .. }))
        ));
    }

    #[test]
    fn test_resolve_unknown_service() {
        let catalog = ServiceCatalog::with_defaults();
        let err = catalog.resolve_catalog_entry("Telefoni", "Fax").unwrap_err();
        assert_eq!(
            err,
            ConfigurationError::UnknownService {
                category: "Telefoni".to_string(),
                service: "Fax".to_string(),
            }
        );
    }

    #[test]
    fn test_resolve_bracket_label_by_name() {
        let catalog = ServiceCatalog::with_defaults();
        let resolved = catalog
            .resolve_service_name("Forsikring", "Gjentakende - 100-299kr")
            .unwrap();
        assert_eq!(resolved.base_stars, 2);
        assert!(resolved.is_recurring());

        let by_amount = catalog
            .resolve_sale("Forsikring", &SaleItem::Amount(150.0))
            .unwrap();
        assert_eq!(by_amount, resolved);
    }

    #[test]
    fn test_bracket_entry_name_is_not_a_service() {
        let catalog = ServiceCatalog::with_defaults();

        assert_eq!(
            catalog.resolve_service_name("Forsikring", "Gjentakende").unwrap_err(),
            ConfigurationError::UnknownService {
                category: "Forsikring".to_string(),
                service: "Gjentakende".to_string(),
            }
        );
        assert!(matches!(
            catalog.resolve_sale("Forsikring", &SaleItem::Service("Gjentakende".to_string())),
            Err(EngineError::Configuration(ConfigurationError::UnknownService { .. }))
        ));

        let labelled = catalog
            .resolve_sale("Forsikring", &SaleItem::Service("Gjentakende - 100-299kr".to_string()))
            .unwrap();
        assert_eq!(labelled.base_stars, 2);
        assert!(labelled.bracket_mapped);
    }

    #[test]
    fn test_recurring_ignored_without_brackets() {
        let mut entry = CatalogEntry::new("Service", "Datarens", 1);
        entry.recurring = true;
        let catalog = ServiceCatalog::from_entries(vec![entry]).unwrap();
        let resolved = catalog.resolve_service_name("Service", "Datarens").unwrap();
        assert!(!resolved.is_recurring());
    }

    #[test]
    fn test_overlapping_brackets_rejected() {
        let entry = CatalogEntry::new("Forsikring", "Gjentakende", 1).with_brackets(
            true,
            vec![
                AmountBracket { label: "a".to_string(), min: 1, max: Some(100), stars: 1 },
                AmountBracket { label: "b".to_string(), min: 100, max: Some(200), stars: 2 },
            ],
        );
        assert!(matches!(
            ServiceCatalog::from_entries(vec![entry]),
            Err(ConfigurationError::InvalidEntry { .. })
        ));
    }

    #[test]
    fn test_gapped_brackets_rejected() {
        let entry = CatalogEntry::new("Forsikring", "Gjentakende", 1).with_brackets(
            true,
            vec![
                AmountBracket { label: "a".to_string(), min: 1, max: Some(99), stars: 1 },
                AmountBracket { label: "b".to_string(), min: 150, max: None, stars: 2 },
            ],
        );
        assert!(ServiceCatalog::from_entries(vec![entry]).is_err());
    }

    #[test]
    fn test_invalid_entries_rejected() {
        let zero_stars = CatalogEntry::new("Telefoni", "Gratis", 0);
        assert!(ServiceCatalog::from_entries(vec![zero_stars]).is_err());

        let zero_stack = CatalogEntry::new("Telefoni", "Tom", 1).stacked(0);
        assert!(ServiceCatalog::from_entries(vec![zero_stack]).is_err());

        let duplicate = vec![
            CatalogEntry::new("Telefoni", "Mobiltelefon", 1),
            CatalogEntry::new("Telefoni", "Mobiltelefon", 2),
        ];
        assert!(ServiceCatalog::from_entries(duplicate).is_err());
    }

    #[test]
    fn test_catalog_json_document() {
        let json = r#"{
            "entries": [
                { "category": "Telefoni", "service": "Teletime15 x3", "base_stars": 1, "stack_size": 3 },
                { "category": "Forsikring", "service": "Gjentakende", "base_stars": 1, "recurring": true,
                  "amount_brackets": [
                    { "label": "1-99kr", "min": 1, "max": 99, "stars": 1 },
                    { "label": "100kr+", "min": 100, "stars": 2 }
                  ] }
            ]
        }"#;
        let document: CatalogDocument = serde_json::from_str(json).unwrap();
        let catalog = ServiceCatalog::from_entries(document.entries).unwrap();

        assert_eq!(catalog.len(), 2);
        let teletime = catalog.resolve_catalog_entry("Telefoni", "Teletime15 x3").unwrap();
        assert_eq!(teletime.stack_size, 3);
        assert!(!teletime.recurring);
        assert_eq!(
            catalog.bracket_for("Forsikring", 1000.0).unwrap().service_label,
            "Gjentakende - 100kr+"
        );
    }

    #[test]
    fn test_shipped_catalog_matches_defaults() {
        let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("config/catalog.json");
        let shipped = ServiceCatalog::from_file(path).unwrap();
        let defaults = ServiceCatalog::with_defaults();

        assert_eq!(shipped.len(), defaults.len());
        for entry in defaults.entries() {
            assert_eq!(
                shipped.resolve_catalog_entry(&entry.category, &entry.service).unwrap(),
                entry
            );
        }
    }
}
