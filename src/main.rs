use anyhow::{anyhow, bail, Context, Result};
use chrono::Utc;
use std::env;
use std::path::Path;

use star_ledger::{
    load_sales_csv, parse_timestamp, telemetry, BonusCampaign, CategoryFilter, EngineConfig,
    Multiplier, NewSale, ReconcileOptions, ReconcileScope, SaleItem, StarEngine,
};

const USAGE: &str = "\
Usage: star-ledger <command>

  staff                                     List staff and their stars
  staff add <id> <name>                     Register a staff member
  record <staff> <category> <service> [ts]  Record a catalog sale
  record-amount <staff> <category> <kr> [ts] Record a bracket-mapped sale
  import <csv>                              Import sales (Staff,Category,Service,Amount,Timestamp)
  requests                                  List pending requests
  approve <request> | reject <request>      Decide a pending request
  campaign show | clear                     Inspect or remove the bonus campaign
  campaign set <m> [category|all] [start] [end]
  reconcile [staff] [--all-services] [--dry-run] [--repair] [--report <csv>]
  drift                                     Staff whose cached total disagrees with the ledger";

fn main() -> Result<()> {
    let config = EngineConfig::load()?;
    telemetry::init(&config.telemetry)?;

    let args: Vec<String> = env::args().skip(1).collect();
    let Some(command) = args.first() else {
        println!("{}", USAGE);
        return Ok(());
    };

    let mut engine = StarEngine::open(&config)?;
    let rest = &args[1..];

    match command.as_str() {
        "staff" => run_staff(&mut engine, rest),
        "record" | "record-amount" => run_record(&mut engine, command == "record-amount", rest),
        "import" => run_import(&mut engine, rest),
        "requests" => run_requests(&engine),
        "approve" => run_approve(&mut engine, rest),
        "reject" => run_reject(&mut engine, rest),
        "campaign" => run_campaign(&mut engine, rest),
        "reconcile" => run_reconcile(&mut engine, rest),
        "drift" => run_drift(&engine),
        other => {
            eprintln!("❌ Unknown command: {}\n", other);
            eprintln!("{}", USAGE);
            std::process::exit(2);
        }
    }
}

fn arg<'a>(rest: &'a [String], idx: usize, name: &str) -> Result<&'a str> {
    rest.get(idx)
        .map(String::as_str)
        .ok_or_else(|| anyhow!("missing <{}>\n\n{}", name, USAGE))
}

fn run_staff(engine: &mut StarEngine, rest: &[String]) -> Result<()> {
    if rest.first().map(String::as_str) == Some("add") {
        let id = arg(rest, 1, "id")?;
        let name = rest[2..].join(" ");
        if name.is_empty() {
            bail!("missing <name>");
        }
        engine.ledger_mut().add_staff(id, &name)?;
        println!("✓ Added {} ({})", name, id);
        return Ok(());
    }

    println!("👥 Staff");
    println!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
    for staff in engine.ledger().list_staff()? {
        println!("{:<10} {:<24} ⭐ {}", staff.id, staff.name, staff.stars);
    }
    Ok(())
}

fn run_record(engine: &mut StarEngine, by_amount: bool, rest: &[String]) -> Result<()> {
    let staff = arg(rest, 0, "staff")?;
    let category = arg(rest, 1, "category")?;
    let value = arg(rest, 2, if by_amount { "kr" } else { "service" })?;
    let occurred_at = match rest.get(3) {
        Some(ts) => parse_timestamp(ts)?,
        None => Utc::now(),
    };

    let item = if by_amount {
        let amount: f64 = value.parse().with_context(|| format!("'{}' is not an amount", value))?;
        SaleItem::Amount(amount)
    } else {
        SaleItem::Service(value.to_string())
    };

    let outcome = engine.record_sale(&NewSale::new(staff, category, item, occurred_at))?;
    for warning in &outcome.accrual.warnings {
        println!("⚠️  {}", warning.describe());
    }
    println!(
        "✓ {} · {} · position {} · {} · ⭐ {} (total {})",
        outcome.entry.staff_id,
        outcome.entry.service,
        outcome.accrual.position,
        outcome.accrual.multiplier,
        outcome.entry.stars,
        outcome.aggregate
    );
    Ok(())
}

fn run_import(engine: &mut StarEngine, rest: &[String]) -> Result<()> {
    let csv_path = Path::new(arg(rest, 0, "csv")?);

    println!("🗄️  Sales Import - CSV → SQLite");
    println!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");

    println!("\n📂 Loading CSV...");
    let sales = load_sales_csv(csv_path)?;
    println!("✓ Loaded {} rows from {}", sales.rows.len(), csv_path.display());

    println!("\n💾 Recording sales...");
    let summary = engine.import(&sales)?;

    println!("\n━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
    println!("✅ Inserted: {}", summary.inserted);
    println!("✓ Duplicates skipped: {}", summary.duplicates);
    println!("⭐ Stars awarded: {}", summary.stars_awarded);
    if !summary.rejected.is_empty() {
        println!("❌ Rejected: {}", summary.rejected.len());
        for row in &summary.rejected {
            println!("   line {}: {}", row.line, row.reason);
        }
    }
    Ok(())
}

fn run_requests(engine: &StarEngine) -> Result<()> {
    let pending = engine.pending_requests()?;
    println!("📨 {} pending request(s)", pending.len());
    for request in pending {
        let item = match &request.sale.item {
            SaleItem::Service(service) => service.clone(),
            SaleItem::Amount(amount) => format!("{} kr", amount),
        };
        println!(
            "{}  {} · {} · {} · {}",
            request.id,
            request.sale.staff_id,
            request.sale.category,
            item,
            request.sale.occurred_at.to_rfc3339()
        );
    }
    Ok(())
}

fn run_approve(engine: &mut StarEngine, rest: &[String]) -> Result<()> {
    let id = arg(rest, 0, "request")?;
    let outcome = engine.approve_request(id)?;
    println!(
        "✅ Approved → transaction {} · ⭐ {} (total {})",
        outcome.entry.id, outcome.entry.stars, outcome.aggregate
    );
    Ok(())
}

fn run_reject(engine: &mut StarEngine, rest: &[String]) -> Result<()> {
    let id = arg(rest, 0, "request")?;
    engine.reject_request(id)?;
    println!("✓ Rejected {}", id);
    Ok(())
}

fn parse_multiplier(value: &str) -> Result<Multiplier> {
    let parsed = match value.split_once('/') {
        Some((num, den)) => Multiplier::ratio(num.trim().parse()?, den.trim().parse()?),
        None => Some(Multiplier::whole(value.trim().parse()?)),
    };
    parsed.ok_or_else(|| anyhow!("invalid multiplier '{}'", value))
}

fn run_campaign(engine: &mut StarEngine, rest: &[String]) -> Result<()> {
    match rest.first().map(String::as_str) {
        Some("set") => {
            let multiplier = parse_multiplier(arg(rest, 1, "m")?)?;
            let filter = CategoryFilter::from(rest.get(2).cloned().unwrap_or_else(|| "all".to_string()));
            let start = rest.get(3).map(|d| parse_timestamp(d).map(|t| t.date_naive())).transpose()?;
            let end = rest.get(4).map(|d| parse_timestamp(d).map(|t| t.date_naive())).transpose()?;

            let campaign = BonusCampaign::new(filter, multiplier).with_window(start, end);
            engine.set_campaign(campaign)?;
            println!("🎯 Campaign set. Run `reconcile` to apply it to past sales.");
        }
        Some("clear") => {
            engine.clear_campaign()?;
            println!("✓ Campaign cleared");
        }
        _ => match engine.campaign() {
            Some(campaign) => println!("{}", serde_json::to_string_pretty(campaign)?),
            None => println!("No campaign configured"),
        },
    }
    Ok(())
}

fn run_reconcile(engine: &mut StarEngine, rest: &[String]) -> Result<()> {
    let mut options = ReconcileOptions::default();
    let mut scope = ReconcileScope::All;
    let mut report_path = None;

    let mut iter = rest.iter();
    while let Some(flag) = iter.next() {
        match flag.as_str() {
            "--all-services" => {
                options.include_recurring = true;
                options.include_non_stacking = true;
            }
            "--dry-run" => options.dry_run = true,
            "--repair" => options.repair_aggregate = true,
            "--report" => {
                report_path = Some(iter.next().ok_or_else(|| anyhow!("--report needs a path"))?.clone());
            }
            staff if !staff.starts_with("--") => scope = ReconcileScope::Staff(staff.to_string()),
            other => bail!("unknown flag {}\n\n{}", other, USAGE),
        }
    }

    println!("⚖️  Reconciliation - {}", scope);
    println!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");

    let report = engine.reconcile(&scope, options)?;
    for line in report.audit_lines() {
        println!("{}", line);
    }
    for skipped in &report.skipped {
        println!("⚠️  skipped {}: {}", skipped.transaction_id, skipped.reason);
    }
    for warning in &report.warnings {
        println!("⚠️  {}", warning.describe());
    }
    for failure in &report.failures {
        println!(
            "❌ {}: {}{}",
            failure.staff_id,
            failure.error,
            if failure.retryable { " (retry)" } else { "" }
        );
    }

    if let Some(path) = report_path {
        report.export_csv(&path)?;
        println!("📄 Report written to {}", path);
    }

    println!("\n{}", report.summary());
    if report.halted {
        bail!("reconciliation halted on a store error");
    }
    Ok(())
}

fn run_drift(engine: &StarEngine) -> Result<()> {
    let drift = engine.aggregate_drift()?;
    if drift.is_empty() {
        println!("✅ Every staff total matches its ledger");
        return Ok(());
    }

    println!("🔍 {} staff with drift", drift.len());
    for d in drift {
        println!(
            "{:<10} {:<24} cached {:>5}  ledger {:>5}  drift {:+}",
            d.staff_id,
            d.name,
            d.cached,
            d.ledger_sum,
            d.drift()
        );
    }
    println!("   Run: star-ledger reconcile --repair");
    Ok(())
}
