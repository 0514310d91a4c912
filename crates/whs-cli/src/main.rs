use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use whs_core::AnnualAggregate;
use whs_store::{PgStore, Store};
use whs_sync::{
    build_registry, maybe_build_scheduler, run_job_by_name, ChannelRegistry, JobContext,
    JobOutcome, JobRegistry, SyncConfig,
};
use whs_web::AppState;

#[derive(Debug, Parser)]
#[command(name = "whs-cli")]
#[command(about = "Warehouse sync command-line interface")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run one sync job to completion and print the run summary.
    Sync { job: String },
    /// Apply pending database migrations.
    Migrate,
    /// Serve the HTTP trigger surface, plus the in-process scheduler when
    /// WHS_SCHEDULER_ENABLED is set.
    Serve,
    /// Export a year-over-year revenue comparison per channel as CSV.
    ExportAnnualComparison {
        #[arg(long)]
        year: i32,
        #[arg(long)]
        out: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let cli = Cli::parse();
    let config = SyncConfig::from_env();

    match cli.command {
        Commands::Sync { job } => {
            let (ctx, registry) = wire(&config).await?;
            match run_job_by_name(&registry, &ctx, &job).await? {
                None => bail!(
                    "unknown job {job:?}; registered jobs: {}",
                    registry.names().join(", ")
                ),
                Some(JobOutcome::Skipped) => {
                    println!("skipped: a run for {job} is already in progress");
                }
                Some(JobOutcome::Completed {
                    run_id,
                    status,
                    records_synced,
                    error,
                    ..
                }) => {
                    println!("run {run_id} finished: status={status} records_synced={records_synced}");
                    if let Some(error) = error {
                        println!("error: {error}");
                    }
                }
            }
        }
        Commands::Migrate => {
            let store = PgStore::connect(&config.database_url).await?;
            store.run_migrations().await?;
            println!("migrations applied");
        }
        Commands::Serve => {
            let (ctx, registry) = wire(&config).await?;
            if let Some(scheduler) = maybe_build_scheduler(&config).await? {
                scheduler.start().await.context("starting scheduler")?;
            }
            let state = AppState::new(ctx, Arc::new(registry), config.shared_secret.clone());
            whs_web::serve_from_env(state).await?;
        }
        Commands::ExportAnnualComparison { year, out } => {
            let store = PgStore::connect(&config.database_url).await?;
            let current = store.annual_year(year).await?;
            let prior = store.annual_year(year - 1).await?;
            export_annual_comparison(year, &current, &prior, &out)?;
            println!("wrote {}", out.display());
        }
    }

    Ok(())
}

async fn wire(config: &SyncConfig) -> Result<(JobContext, JobRegistry)> {
    let store = PgStore::connect(&config.database_url).await?;
    store.run_migrations().await?;
    let channels = ChannelRegistry::load(&config.channels_path)?;
    let registry = build_registry(config, &channels)?;
    let mut ctx = JobContext::new(Arc::new(store));
    ctx.lookback_days = config.lookback_days;
    ctx.invocation_budget = config.invocation_budget;
    Ok((ctx, registry))
}

#[derive(Debug, Default, Clone, Copy)]
struct ChannelTotals {
    orders: i64,
    revenue_cents: i64,
}

fn totals_by_channel(rows: &[AnnualAggregate]) -> BTreeMap<String, ChannelTotals> {
    let mut totals: BTreeMap<String, ChannelTotals> = BTreeMap::new();
    for row in rows {
        let entry = totals.entry(row.channel.clone()).or_default();
        entry.orders += row.orders;
        entry.revenue_cents += row.revenue_cents;
    }
    totals
}

/// One row per channel plus a grand total, prior year next to current year.
/// The change column stays in cents; spreadsheets can format it.
fn export_annual_comparison(
    year: i32,
    current: &[AnnualAggregate],
    prior: &[AnnualAggregate],
    out: &PathBuf,
) -> Result<()> {
    let current_totals = totals_by_channel(current);
    let prior_totals = totals_by_channel(prior);

    let mut writer = csv::Writer::from_path(out)
        .with_context(|| format!("creating {}", out.display()))?;
    writer.write_record(vec![
        "channel".to_string(),
        format!("{}_orders", year - 1),
        format!("{year}_orders"),
        format!("{}_revenue_cents", year - 1),
        format!("{year}_revenue_cents"),
        "revenue_change_cents".to_string(),
        "revenue_change_pct".to_string(),
    ])?;

    let mut channels: Vec<&String> = current_totals.keys().collect();
    for channel in prior_totals.keys() {
        if !current_totals.contains_key(channel) {
            channels.push(channel);
        }
    }
    channels.sort();

    let mut grand_prior = ChannelTotals::default();
    let mut grand_current = ChannelTotals::default();
    for channel in channels {
        let prior = prior_totals.get(channel).copied().unwrap_or_default();
        let current = current_totals.get(channel).copied().unwrap_or_default();
        grand_prior.orders += prior.orders;
        grand_prior.revenue_cents += prior.revenue_cents;
        grand_current.orders += current.orders;
        grand_current.revenue_cents += current.revenue_cents;
        writer.write_record(comparison_row(channel, prior, current))?;
    }
    writer.write_record(comparison_row("TOTAL", grand_prior, grand_current))?;
    writer.flush()?;
    Ok(())
}

fn comparison_row(channel: &str, prior: ChannelTotals, current: ChannelTotals) -> Vec<String> {
    let change = current.revenue_cents - prior.revenue_cents;
    let pct = if prior.revenue_cents > 0 {
        format!("{:.1}%", change as f64 / prior.revenue_cents as f64 * 100.0)
    } else {
        "N/A".to_string()
    };
    vec![
        channel.to_string(),
        prior.orders.to_string(),
        current.orders.to_string(),
        prior.revenue_cents.to_string(),
        current.revenue_cents.to_string(),
        change.to_string(),
        pct,
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn annual(channel: &str, date: (i32, u32, u32), orders: i64, revenue: i64) -> AnnualAggregate {
        AnnualAggregate::for_date(
            channel,
            NaiveDate::from_ymd_opt(date.0, date.1, date.2).unwrap(),
            orders,
            revenue,
        )
        .unwrap()
    }

    #[test]
    fn comparison_rows_cover_both_years_and_the_grand_total() {
        let prior = vec![
            annual("shopify_main", (2025, 3, 1), 10, 100_000),
            annual("shopify_main", (2025, 3, 2), 5, 50_000),
            annual("netsuite_wholesale", (2025, 3, 1), 2, 200_000),
        ];
        let current = vec![
            annual("shopify_main", (2026, 3, 1), 20, 300_000),
            annual("shopify_b2b", (2026, 3, 1), 1, 10_000),
        ];

        let dir = std::env::temp_dir().join("whs-cli-export-test");
        std::fs::create_dir_all(&dir).unwrap();
        let out = dir.join("comparison.csv");
        export_annual_comparison(2026, &current, &prior, &out).unwrap();

        let text = std::fs::read_to_string(&out).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines[0], "channel,2025_orders,2026_orders,2025_revenue_cents,2026_revenue_cents,revenue_change_cents,revenue_change_pct");
        // Channels sorted, including ones present in only one year.
        assert!(lines[1].starts_with("netsuite_wholesale,2,0,200000,0,-200000"));
        assert!(lines[2].starts_with("shopify_b2b,0,1,0,10000,10000,N/A"));
        assert!(lines[3].starts_with("shopify_main,15,20,150000,300000,150000,100.0%"));
        assert!(lines[4].starts_with("TOTAL,17,21,350000,310000,-40000"));
    }
}
