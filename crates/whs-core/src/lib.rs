//! Domain model and calendar math for the warehouse sync service.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

pub const CRATE_NAME: &str = "whs-core";

/// Default chunk size for batched upserts.
pub const UPSERT_CHUNK_SIZE: usize = 500;

/// Reconciliation thresholds: a day is only corrected when the delta clears
/// one of these, so rounding noise never causes churn.
pub const DEFAULT_REVENUE_THRESHOLD_CENTS: i64 = 10_000;
pub const DEFAULT_ORDER_THRESHOLD: i64 = 5;

/// Recovered revenue above this triggers an operator alert.
pub const ALERT_RECOVERED_REVENUE_CENTS: i64 = 1_000_000;

/// Status of a sync invocation as recorded in the run ledger. `Running` is
/// the transient state between ledger insert and finalize; the terminal
/// states are `Success`, `Partial`, and `Failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Success,
    Partial,
    Failed,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Running => "running",
            RunStatus::Success => "success",
            RunStatus::Partial => "partial",
            RunStatus::Failed => "failed",
        }
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for RunStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "running" => Ok(RunStatus::Running),
            "success" => Ok(RunStatus::Success),
            "partial" => Ok(RunStatus::Partial),
            "failed" => Ok(RunStatus::Failed),
            other => Err(format!("unknown run status {other:?}")),
        }
    }
}

/// One row in the run ledger. Created when a job starts, finalized exactly
/// once when it ends, never mutated afterward.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncRun {
    pub id: Uuid,
    pub job: String,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub status: RunStatus,
    pub records_expected: Option<i64>,
    pub records_synced: i64,
    pub error: Option<String>,
    /// Free-form per-job details: counters, resume cursors, sub-job results.
    pub details: serde_json::Value,
}

/// Mutual-exclusion row for one job name. At most one unexpired lock per job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncLock {
    pub job: String,
    pub holder: Uuid,
    pub acquired_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl SyncLock {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

/// One row per (channel, date): near-real-time rollup, overwritten by the
/// reconciler when the vendor's authoritative numbers disagree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DailyAggregate {
    pub channel: String,
    pub date: NaiveDate,
    pub orders: i64,
    pub revenue_cents: i64,
    pub updated_at: DateTime<Utc>,
}

/// One row per (channel, year, day-of-year). The `date` field must always
/// equal the calendar date implied by (year, day_of_year); construct through
/// [`AnnualAggregate::for_date`] so the pair cannot drift apart.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnnualAggregate {
    pub channel: String,
    pub year: i32,
    pub day_of_year: u32,
    pub date: NaiveDate,
    pub quarter: u8,
    pub orders: i64,
    pub revenue_cents: i64,
}

impl AnnualAggregate {
    /// Derive (year, day_of_year, quarter) from the date's explicit
    /// components. This is the only supported constructor.
    pub fn for_date(
        channel: impl Into<String>,
        date: NaiveDate,
        orders: i64,
        revenue_cents: i64,
    ) -> Result<Self, CalendarError> {
        let (year, month, day) = ymd(date);
        Ok(Self {
            channel: channel.into(),
            year,
            day_of_year: day_of_year(year, month, day)?,
            date,
            quarter: quarter_of(month),
            orders,
            revenue_cents,
        })
    }

    pub fn avg_order_value_cents(&self) -> i64 {
        if self.orders == 0 {
            0
        } else {
            self.revenue_cents / self.orders
        }
    }
}

/// One row per (channel, order, SKU) sold.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LineItemRecord {
    pub channel: String,
    pub order_id: String,
    pub sku: String,
    pub quantity: i64,
    pub unit_price_cents: i64,
    pub sold_at: DateTime<Utc>,
}

impl LineItemRecord {
    /// Natural conflict key for the idempotent upsert.
    pub fn natural_key(&self) -> (String, String, String) {
        (self.channel.clone(), self.order_id.clone(), self.sku.clone())
    }
}

/// One row per (channel, order, SKU, fulfillment date).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FulfillmentRecord {
    pub channel: String,
    pub order_id: String,
    pub sku: String,
    pub quantity: i64,
    pub fulfilled_at: DateTime<Utc>,
}

impl FulfillmentRecord {
    pub fn natural_key(&self) -> (String, String, String, NaiveDate) {
        (
            self.channel.clone(),
            self.order_id.clone(),
            self.sku.clone(),
            self.fulfilled_at.date_naive(),
        )
    }
}

/// Two-sided gate deciding whether a reconciled day is discrepant enough to
/// overwrite. Both deltas sub-threshold means leave the stored row alone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThresholdPolicy {
    pub revenue_cents: i64,
    pub orders: i64,
}

impl Default for ThresholdPolicy {
    fn default() -> Self {
        Self {
            revenue_cents: DEFAULT_REVENUE_THRESHOLD_CENTS,
            orders: DEFAULT_ORDER_THRESHOLD,
        }
    }
}

impl ThresholdPolicy {
    pub fn is_discrepant(&self, order_delta: i64, revenue_delta_cents: i64) -> bool {
        order_delta.abs() > self.orders || revenue_delta_cents.abs() > self.revenue_cents
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CalendarError {
    #[error("invalid calendar date {year:04}-{month:02}-{day:02}")]
    InvalidDate { year: i32, month: u32, day: u32 },
    #[error("day-of-year {day_of_year} out of range for year {year}")]
    InvalidDayOfYear { year: i32, day_of_year: u32 },
    #[error("unparseable date string {0:?}, expected YYYY-MM-DD")]
    Unparseable(String),
}

const MONTH_LENGTHS: [u32; 12] = [31, 28, 31, 30, 31, 30, 31, 31, 30, 31, 30, 31];

pub fn is_leap_year(year: i32) -> bool {
    (year % 4 == 0 && year % 100 != 0) || year % 400 == 0
}

pub fn days_in_month(year: i32, month: u32) -> u32 {
    if month == 2 && is_leap_year(year) {
        29
    } else {
        MONTH_LENGTHS[(month - 1) as usize]
    }
}

pub fn days_in_year(year: i32) -> u32 {
    if is_leap_year(year) {
        366
    } else {
        365
    }
}

/// 1-based ordinal of (year, month, day) within its year, computed purely
/// from the explicit components. Never goes through a timezone-bearing date
/// value, so a DST transition cannot shift the result by a day.
pub fn day_of_year(year: i32, month: u32, day: u32) -> Result<u32, CalendarError> {
    if !(1..=12).contains(&month) || day == 0 || day > days_in_month(year, month) {
        return Err(CalendarError::InvalidDate { year, month, day });
    }
    let preceding: u32 = (1..month).map(|m| days_in_month(year, m)).sum();
    Ok(preceding + day)
}

/// Inverse of [`day_of_year`].
pub fn date_from_day_of_year(year: i32, day_of_year: u32) -> Result<NaiveDate, CalendarError> {
    if day_of_year == 0 || day_of_year > days_in_year(year) {
        return Err(CalendarError::InvalidDayOfYear { year, day_of_year });
    }
    let mut remaining = day_of_year;
    for month in 1..=12u32 {
        let len = days_in_month(year, month);
        if remaining <= len {
            return NaiveDate::from_ymd_opt(year, month, remaining).ok_or(
                CalendarError::InvalidDate {
                    year,
                    month,
                    day: remaining,
                },
            );
        }
        remaining -= len;
    }
    Err(CalendarError::InvalidDayOfYear { year, day_of_year })
}

pub fn quarter_of(month: u32) -> u8 {
    ((month - 1) / 3 + 1) as u8
}

/// Parse a `YYYY-MM-DD` business date into explicit components and validate
/// them. Vendor analytics APIs return dates as strings; parsing here keeps
/// day-of-year math independent of any local-timezone interpretation.
pub fn parse_ymd(s: &str) -> Result<NaiveDate, CalendarError> {
    let mut parts = s.splitn(3, '-');
    let (Some(y), Some(m), Some(d)) = (parts.next(), parts.next(), parts.next()) else {
        return Err(CalendarError::Unparseable(s.to_string()));
    };
    let (Ok(year), Ok(month), Ok(day)) = (y.parse::<i32>(), m.parse::<u32>(), d.parse::<u32>())
    else {
        return Err(CalendarError::Unparseable(s.to_string()));
    };
    day_of_year(year, month, day)?;
    NaiveDate::from_ymd_opt(year, month, day)
        .ok_or(CalendarError::InvalidDate { year, month, day })
}

fn ymd(date: NaiveDate) -> (i32, u32, u32) {
    use chrono::Datelike;
    (date.year(), date.month(), date.day())
}
