// 📥 Sales Import - CSV → ledger
//
// Expected header: Staff,Category,Service,Amount,Timestamp
// A row carries either a Service or an Amount (bracket-mapped categories).
// Rows are written in timestamp order so stored stars match a replay, and each
// row gets an import key so re-importing the same file is a no-op.

use crate::accrual::AccrualContext;
use crate::catalog::SaleItem;
use crate::error::{EngineError, ValidationError};
use crate::ledger::{parse_timestamp, Ledger, NewSale};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::Path;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SaleRow {
    #[serde(rename = "Staff")]
    pub staff: String,

    #[serde(rename = "Category")]
    pub category: String,

    #[serde(rename = "Service", default)]
    pub service: Option<String>,

    #[serde(rename = "Amount", default)]
    pub amount: Option<f64>,

    #[serde(rename = "Timestamp")]
    pub timestamp: String,
}

/// A parsed row plus where it came from.
#[derive(Debug, Clone, PartialEq)]
pub struct ImportRow {
    pub source_file: String,
    pub line: u64,
    pub row: SaleRow,
}

impl ImportRow {
    /// Deduplication key, not identity: the ledger still assigns a UUID.
    pub fn import_key(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(format!(
            "{}|{}|{}|{}|{}|{}|{}",
            self.source_file,
            self.line,
            self.row.staff,
            self.row.category,
            self.row.service.as_deref().unwrap_or(""),
            self.row.amount.map(|a| a.to_string()).unwrap_or_default(),
            self.row.timestamp
        ));
        format!("{:x}", hasher.finalize())
    }

    pub fn to_sale(&self) -> Result<NewSale, ValidationError> {
        let item = match (&self.row.amount, &self.row.service) {
            (Some(amount), _) => SaleItem::Amount(*amount),
            (None, Some(service)) if !service.trim().is_empty() => SaleItem::Service(service.trim().to_string()),
            _ => return Err(ValidationError::MissingServiceOrAmount),
        };
        let occurred_at = parse_timestamp(&self.row.timestamp)?;

        let mut sale = NewSale::new(self.row.staff.trim(), self.row.category.trim(), item, occurred_at);
        sale.import_key = Some(self.import_key());
        Ok(sale)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RejectedRow {
    pub line: u64,
    pub reason: String,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SalesFile {
    pub rows: Vec<ImportRow>,
    /// Rows the CSV layer could not even deserialize
    pub rejected: Vec<RejectedRow>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ImportSummary {
    pub inserted: usize,
    pub duplicates: usize,
    pub stars_awarded: i64,
    pub rejected: Vec<RejectedRow>,
}

pub fn load_sales_csv(csv_path: &Path) -> Result<SalesFile> {
    let file = std::fs::File::open(csv_path)
        .with_context(|| format!("Failed to open CSV file: {}", csv_path.display()))?;
    let source_file = csv_path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| csv_path.display().to_string());
    read_sales(file, &source_file)
}

pub fn read_sales<R: std::io::Read>(reader: R, source_file: &str) -> Result<SalesFile> {
    let mut rdr = csv::ReaderBuilder::new().trim(csv::Trim::All).from_reader(reader);
    let headers = rdr.headers().context("Failed to read CSV header")?.clone();

    let mut sales = SalesFile::default();
    for result in rdr.records() {
        let record = result.context("Failed to read CSV record")?;
        let line = record.position().map(|p| p.line()).unwrap_or_default();

        let parsed: std::result::Result<SaleRow, csv::Error> = record.deserialize(Some(&headers));
        match parsed {
            Ok(row) => sales.rows.push(ImportRow {
                source_file: source_file.to_string(),
                line,
                row,
            }),
            Err(err) => sales.rejected.push(RejectedRow {
                line,
                reason: err.to_string(),
            }),
        }
    }

    Ok(sales)
}

/// Record every importable row. Bad rows are reported and skipped; a store
/// failure aborts the import (rows already written stay written).
pub fn import_sales(
    ledger: &mut Ledger,
    ctx: AccrualContext<'_>,
    sales: &SalesFile,
) -> std::result::Result<ImportSummary, EngineError> {
    let mut summary = ImportSummary {
        rejected: sales.rejected.clone(),
        ..Default::default()
    };

    let mut prepared = Vec::with_capacity(sales.rows.len());
    for row in &sales.rows {
        match row.to_sale() {
            Ok(sale) => prepared.push((row.line, sale)),
            Err(err) => summary.rejected.push(RejectedRow {
                line: row.line,
                reason: err.to_string(),
            }),
        }
    }
    prepared.sort_by_key(|(line, sale)| (sale.occurred_at, *line));

    for (line, sale) in prepared {
        if let Some(key) = &sale.import_key {
            if ledger.import_key_exists(key)? {
                summary.duplicates += 1;
                continue;
            }
        }

        match ledger.record_sale(ctx, &sale) {
            Ok(outcome) => {
                summary.inserted += 1;
                summary.stars_awarded += outcome.entry.stars;
            }
            Err(err @ (EngineError::Configuration(_) | EngineError::Validation(_))) => {
                summary.rejected.push(RejectedRow {
                    line,
                    reason: err.to_string(),
                });
            }
            Err(err) => return Err(err),
        }
    }
    summary.rejected.sort_by_key(|r| r.line);

    tracing::info!(
        inserted = summary.inserted,
        duplicates = summary.duplicates,
        rejected = summary.rejected.len(),
        "sales imported"
    );
    Ok(summary)
}
