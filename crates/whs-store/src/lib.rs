//! Run ledger, run lock, and idempotent upsert storage for the sync jobs.
//!
//! Every write goes through a natural-key `ON CONFLICT` upsert, so re-running
//! a sync over an overlapping window is safe. The same conflict-key semantics
//! are implemented twice: [`PgStore`] against Postgres and [`MemStore`] as an
//! in-process double for tests and local development.

use std::collections::HashMap;
use std::future::Future;
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{NaiveDate, Utc};
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Row};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::warn;
use uuid::Uuid;
use whs_core::{
    AnnualAggregate, DailyAggregate, FulfillmentRecord, LineItemRecord, RunStatus, SyncLock,
    SyncRun, UPSERT_CHUNK_SIZE,
};

pub const CRATE_NAME: &str = "whs-store";

/// Default lock TTL; comfortably above the 300 s invocation budget so a lock
/// is only ever stolen from a run that crashed without releasing.
pub const DEFAULT_LOCK_TTL: Duration = Duration::from_secs(600);

#[derive(Debug, Error)]
pub enum StoreError {
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
    #[error(transparent)]
    Calendar(#[from] whs_core::CalendarError),
    #[error("storage invariant violated: {0}")]
    Invariant(String),
}

/// Persistence seam for the sync subsystem. The web UI reads through this as
/// well but never mutates sync-owned rows directly.
#[async_trait]
pub trait Store: Send + Sync {
    // Run ledger.
    async fn begin_run(&self, job: &str) -> Result<SyncRun, StoreError>;
    async fn finalize_run(
        &self,
        id: Uuid,
        status: RunStatus,
        records_expected: Option<i64>,
        records_synced: i64,
        error: Option<String>,
        details: serde_json::Value,
    ) -> Result<(), StoreError>;
    async fn recent_runs(&self, limit: i64) -> Result<Vec<SyncRun>, StoreError>;
    async fn latest_run(&self, job: &str) -> Result<Option<SyncRun>, StoreError>;

    // Run lock. `acquire_lock` is skip-on-contention: `None` means another
    // unexpired holder exists and the caller must not run.
    async fn acquire_lock(&self, job: &str, ttl: Duration) -> Result<Option<SyncLock>, StoreError>;
    async fn release_lock(&self, job: &str, holder: Uuid) -> Result<(), StoreError>;

    // Aggregates.
    async fn upsert_daily(&self, rows: &[DailyAggregate]) -> Result<(), StoreError>;
    async fn upsert_annual(&self, rows: &[AnnualAggregate]) -> Result<(), StoreError>;
    async fn daily_window(
        &self,
        channel: &str,
        from: NaiveDate,
        to: NaiveDate,
    ) -> Result<Vec<DailyAggregate>, StoreError>;
    async fn annual_year(&self, year: i32) -> Result<Vec<AnnualAggregate>, StoreError>;

    // Per-order records.
    async fn upsert_line_items(&self, rows: &[LineItemRecord]) -> Result<(), StoreError>;
    async fn upsert_fulfillments(&self, rows: &[FulfillmentRecord]) -> Result<(), StoreError>;
    async fn line_item_total_quantity(&self, channel: &str, sku: &str)
        -> Result<i64, StoreError>;
}

/// Outcome of a chunked write pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChunkReport {
    pub written: usize,
    pub failed_chunks: usize,
}

impl ChunkReport {
    pub fn fully_written(&self) -> bool {
        self.failed_chunks == 0
    }
}

/// Write `rows` in fixed-size chunks. A failing chunk is logged and counted
/// but the remaining chunks still run; the caller downgrades the run to
/// `partial` instead of failing it outright.
pub async fn write_in_chunks<T, F, Fut>(rows: &[T], chunk_size: usize, mut write: F) -> ChunkReport
where
    F: FnMut(&[T]) -> Fut,
    Fut: Future<Output = Result<(), StoreError>>,
{
    let chunk_size = chunk_size.max(1);
    let mut report = ChunkReport::default();
    for (index, chunk) in rows.chunks(chunk_size).enumerate() {
        match write(chunk).await {
            Ok(()) => report.written += chunk.len(),
            Err(err) => {
                warn!(chunk = index, rows = chunk.len(), %err, "chunk write failed, continuing");
                report.failed_chunks += 1;
            }
        }
    }
    report
}

pub fn default_chunk_size() -> usize {
    UPSERT_CHUNK_SIZE
}

// ---------------------------------------------------------------------------
// Postgres implementation
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }

    pub async fn run_migrations(&self) -> Result<(), StoreError> {
        sqlx::migrate!("../../migrations")
            .run(&self.pool)
            .await
            .map_err(|e| StoreError::Invariant(format!("migration failed: {e}")))?;
        Ok(())
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    fn run_from_row(row: &sqlx::postgres::PgRow) -> Result<SyncRun, StoreError> {
        let status: String = row.try_get("status")?;
        Ok(SyncRun {
            id: row.try_get("id")?,
            job: row.try_get("job")?,
            started_at: row.try_get("started_at")?,
            completed_at: row.try_get("completed_at")?,
            status: RunStatus::from_str(&status).map_err(StoreError::Invariant)?,
            records_expected: row.try_get("records_expected")?,
            records_synced: row.try_get("records_synced")?,
            error: row.try_get("error")?,
            details: row.try_get("details")?,
        })
    }
}

#[async_trait]
impl Store for PgStore {
    async fn begin_run(&self, job: &str) -> Result<SyncRun, StoreError> {
        let row = sqlx::query(
            r#"
            INSERT INTO sync_runs (id, job, started_at, status, records_synced, details)
            VALUES ($1, $2, NOW(), 'running', 0, '{}'::jsonb)
            RETURNING id, job, started_at, completed_at, status,
                      records_expected, records_synced, error, details
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(job)
        .fetch_one(&self.pool)
        .await?;
        Self::run_from_row(&row)
    }

    async fn finalize_run(
        &self,
        id: Uuid,
        status: RunStatus,
        records_expected: Option<i64>,
        records_synced: i64,
        error: Option<String>,
        details: serde_json::Value,
    ) -> Result<(), StoreError> {
        // Finalize exactly once; a second call on a terminal row is a bug.
        let result = sqlx::query(
            r#"
            UPDATE sync_runs
               SET completed_at = NOW(),
                   status = $2,
                   records_expected = $3,
                   records_synced = $4,
                   error = $5,
                   details = $6
             WHERE id = $1
               AND status = 'running'
            "#,
        )
        .bind(id)
        .bind(status.as_str())
        .bind(records_expected)
        .bind(records_synced)
        .bind(error)
        .bind(details)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::Invariant(format!(
                "run {id} already finalized or unknown"
            )));
        }
        Ok(())
    }

    async fn recent_runs(&self, limit: i64) -> Result<Vec<SyncRun>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT id, job, started_at, completed_at, status,
                   records_expected, records_synced, error, details
              FROM sync_runs
             ORDER BY started_at DESC
             LIMIT $1
            "#,
        )
        .bind(limit.clamp(1, 500))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(Self::run_from_row).collect()
    }

    async fn latest_run(&self, job: &str) -> Result<Option<SyncRun>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT id, job, started_at, completed_at, status,
                   records_expected, records_synced, error, details
              FROM sync_runs
             WHERE job = $1
             ORDER BY started_at DESC
             LIMIT 1
            "#,
        )
        .bind(job)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(Self::run_from_row).transpose()
    }

    async fn acquire_lock(&self, job: &str, ttl: Duration) -> Result<Option<SyncLock>, StoreError> {
        // Insert, or steal only when the existing lock has expired. The WHERE
        // on the conflict update makes contention return zero rows.
        let row = sqlx::query(
            r#"
            INSERT INTO sync_locks (job, holder, acquired_at, expires_at)
            VALUES ($1, $2, NOW(), NOW() + make_interval(secs => $3))
            ON CONFLICT (job) DO UPDATE
               SET holder = EXCLUDED.holder,
                   acquired_at = EXCLUDED.acquired_at,
                   expires_at = EXCLUDED.expires_at
             WHERE sync_locks.expires_at <= NOW()
            RETURNING job, holder, acquired_at, expires_at
            "#,
        )
        .bind(job)
        .bind(Uuid::new_v4())
        .bind(ttl.as_secs_f64())
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|row| {
            Ok::<_, StoreError>(SyncLock {
                job: row.try_get("job")?,
                holder: row.try_get("holder")?,
                acquired_at: row.try_get("acquired_at")?,
                expires_at: row.try_get("expires_at")?,
            })
        })
        .transpose()?)
    }

    async fn release_lock(&self, job: &str, holder: Uuid) -> Result<(), StoreError> {
        // Keyed by holder so a run never frees a lock stolen from it.
        sqlx::query("DELETE FROM sync_locks WHERE job = $1 AND holder = $2")
            .bind(job)
            .bind(holder)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn upsert_daily(&self, rows: &[DailyAggregate]) -> Result<(), StoreError> {
        for row in rows {
            sqlx::query(
                r#"
                INSERT INTO daily_stats (channel, date, orders, revenue_cents, updated_at)
                VALUES ($1, $2, $3, $4, $5)
                ON CONFLICT (channel, date) DO UPDATE
                   SET orders = EXCLUDED.orders,
                       revenue_cents = EXCLUDED.revenue_cents,
                       updated_at = EXCLUDED.updated_at
                "#,
            )
            .bind(&row.channel)
            .bind(row.date)
            .bind(row.orders)
            .bind(row.revenue_cents)
            .bind(row.updated_at)
            .execute(&self.pool)
            .await?;
        }
        Ok(())
    }

    async fn upsert_annual(&self, rows: &[AnnualAggregate]) -> Result<(), StoreError> {
        for row in rows {
            sqlx::query(
                r#"
                INSERT INTO annual_sales_tracking
                    (channel, year, day_of_year, date, quarter, orders, revenue_cents)
                VALUES ($1, $2, $3, $4, $5, $6, $7)
                ON CONFLICT (channel, year, day_of_year) DO UPDATE
                   SET date = EXCLUDED.date,
                       quarter = EXCLUDED.quarter,
                       orders = EXCLUDED.orders,
                       revenue_cents = EXCLUDED.revenue_cents
                "#,
            )
            .bind(&row.channel)
            .bind(row.year)
            .bind(row.day_of_year as i32)
            .bind(row.date)
            .bind(row.quarter as i16)
            .bind(row.orders)
            .bind(row.revenue_cents)
            .execute(&self.pool)
            .await?;
        }
        Ok(())
    }

    async fn daily_window(
        &self,
        channel: &str,
        from: NaiveDate,
        to: NaiveDate,
    ) -> Result<Vec<DailyAggregate>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT channel, date, orders, revenue_cents, updated_at
              FROM daily_stats
             WHERE channel = $1 AND date >= $2 AND date <= $3
             ORDER BY date
            "#,
        )
        .bind(channel)
        .bind(from)
        .bind(to)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|row| {
                Ok(DailyAggregate {
                    channel: row.try_get("channel")?,
                    date: row.try_get("date")?,
                    orders: row.try_get("orders")?,
                    revenue_cents: row.try_get("revenue_cents")?,
                    updated_at: row.try_get("updated_at")?,
                })
            })
            .collect()
    }

    async fn annual_year(&self, year: i32) -> Result<Vec<AnnualAggregate>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT channel, year, day_of_year, date, quarter, orders, revenue_cents
              FROM annual_sales_tracking
             WHERE year = $1
             ORDER BY channel, day_of_year
            "#,
        )
        .bind(year)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|row| {
                Ok(AnnualAggregate {
                    channel: row.try_get("channel")?,
                    year: row.try_get("year")?,
                    day_of_year: row.try_get::<i32, _>("day_of_year")? as u32,
                    date: row.try_get("date")?,
                    quarter: row.try_get::<i16, _>("quarter")? as u8,
                    orders: row.try_get("orders")?,
                    revenue_cents: row.try_get("revenue_cents")?,
                })
            })
            .collect()
    }

    async fn upsert_line_items(&self, rows: &[LineItemRecord]) -> Result<(), StoreError> {
        for row in rows {
            sqlx::query(
                r#"
                INSERT INTO line_items
                    (channel, order_id, sku, quantity, unit_price_cents, sold_at)
                VALUES ($1, $2, $3, $4, $5, $6)
                ON CONFLICT (channel, order_id, sku) DO UPDATE
                   SET quantity = EXCLUDED.quantity,
                       unit_price_cents = EXCLUDED.unit_price_cents,
                       sold_at = EXCLUDED.sold_at
                "#,
            )
            .bind(&row.channel)
            .bind(&row.order_id)
            .bind(&row.sku)
            .bind(row.quantity)
            .bind(row.unit_price_cents)
            .bind(row.sold_at)
            .execute(&self.pool)
            .await?;
        }
        Ok(())
    }

    async fn upsert_fulfillments(&self, rows: &[FulfillmentRecord]) -> Result<(), StoreError> {
        for row in rows {
            sqlx::query(
                r#"
                INSERT INTO fulfillments
                    (channel, order_id, sku, quantity, fulfilled_at, fulfilled_on)
                VALUES ($1, $2, $3, $4, $5, $6)
                ON CONFLICT (channel, order_id, sku, fulfilled_on) DO UPDATE
                   SET quantity = EXCLUDED.quantity,
                       fulfilled_at = EXCLUDED.fulfilled_at
                "#,
            )
            .bind(&row.channel)
            .bind(&row.order_id)
            .bind(&row.sku)
            .bind(row.quantity)
            .bind(row.fulfilled_at)
            // UTC date, matching FulfillmentRecord::natural_key.
            .bind(row.fulfilled_at.date_naive())
            .execute(&self.pool)
            .await?;
        }
        Ok(())
    }

    async fn line_item_total_quantity(
        &self,
        channel: &str,
        sku: &str,
    ) -> Result<i64, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT COALESCE(SUM(quantity), 0)::bigint AS total
              FROM line_items
             WHERE channel = $1 AND sku = $2
            "#,
        )
        .bind(channel)
        .bind(sku)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.try_get("total")?)
    }
}

// ---------------------------------------------------------------------------
// In-memory implementation
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct MemInner {
    runs: Vec<SyncRun>,
    locks: HashMap<String, SyncLock>,
    daily: HashMap<(String, NaiveDate), DailyAggregate>,
    annual: HashMap<(String, i32, u32), AnnualAggregate>,
    line_items: HashMap<(String, String, String), LineItemRecord>,
    fulfillments: HashMap<(String, String, String, NaiveDate), FulfillmentRecord>,
}

/// In-process store with the same conflict-key semantics as [`PgStore`].
#[derive(Debug, Default)]
pub struct MemStore {
    inner: Mutex<MemInner>,
}

impl MemStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn daily_row(&self, channel: &str, date: NaiveDate) -> Option<DailyAggregate> {
        let inner = self.inner.lock().await;
        inner.daily.get(&(channel.to_string(), date)).cloned()
    }

    pub async fn annual_row(
        &self,
        channel: &str,
        year: i32,
        day_of_year: u32,
    ) -> Option<AnnualAggregate> {
        let inner = self.inner.lock().await;
        inner
            .annual
            .get(&(channel.to_string(), year, day_of_year))
            .cloned()
    }

    pub async fn line_item_count(&self) -> usize {
        self.inner.lock().await.line_items.len()
    }
}

#[async_trait]
impl Store for MemStore {
    async fn begin_run(&self, job: &str) -> Result<SyncRun, StoreError> {
        let run = SyncRun {
            id: Uuid::new_v4(),
            job: job.to_string(),
            started_at: Utc::now(),
            completed_at: None,
            status: RunStatus::Running,
            records_expected: None,
            records_synced: 0,
            error: None,
            details: serde_json::json!({}),
        };
        self.inner.lock().await.runs.push(run.clone());
        Ok(run)
    }

    async fn finalize_run(
        &self,
        id: Uuid,
        status: RunStatus,
        records_expected: Option<i64>,
        records_synced: i64,
        error: Option<String>,
        details: serde_json::Value,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        let run = inner
            .runs
            .iter_mut()
            .find(|r| r.id == id && r.status == RunStatus::Running)
            .ok_or_else(|| StoreError::Invariant(format!("run {id} already finalized or unknown")))?;
        run.completed_at = Some(Utc::now());
        run.status = status;
        run.records_expected = records_expected;
        run.records_synced = records_synced;
        run.error = error;
        run.details = details;
        Ok(())
    }

    async fn recent_runs(&self, limit: i64) -> Result<Vec<SyncRun>, StoreError> {
        let inner = self.inner.lock().await;
        let mut runs = inner.runs.clone();
        runs.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        runs.truncate(limit.clamp(1, 500) as usize);
        Ok(runs)
    }

    async fn latest_run(&self, job: &str) -> Result<Option<SyncRun>, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner
            .runs
            .iter()
            .filter(|r| r.job == job)
            .max_by_key(|r| r.started_at)
            .cloned())
    }

    async fn acquire_lock(&self, job: &str, ttl: Duration) -> Result<Option<SyncLock>, StoreError> {
        let now = Utc::now();
        let mut inner = self.inner.lock().await;
        if let Some(existing) = inner.locks.get(job) {
            if !existing.is_expired(now) {
                return Ok(None);
            }
        }
        let lock = SyncLock {
            job: job.to_string(),
            holder: Uuid::new_v4(),
            acquired_at: now,
            expires_at: now + chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::zero()),
        };
        inner.locks.insert(job.to_string(), lock.clone());
        Ok(Some(lock))
    }

    async fn release_lock(&self, job: &str, holder: Uuid) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        if inner.locks.get(job).is_some_and(|l| l.holder == holder) {
            inner.locks.remove(job);
        }
        Ok(())
    }

    async fn upsert_daily(&self, rows: &[DailyAggregate]) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        for row in rows {
            inner
                .daily
                .insert((row.channel.clone(), row.date), row.clone());
        }
        Ok(())
    }

    async fn upsert_annual(&self, rows: &[AnnualAggregate]) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        for row in rows {
            // Mirror of the (channel, year, date) unique constraint: the same
            // calendar date must never live under two day-of-year keys.
            let clash = inner.annual.values().any(|existing| {
                existing.channel == row.channel
                    && existing.date == row.date
                    && existing.day_of_year != row.day_of_year
            });
            if clash {
                return Err(StoreError::Invariant(format!(
                    "date {} already tracked under a different day-of-year key",
                    row.date
                )));
            }
            inner.annual.insert(
                (row.channel.clone(), row.year, row.day_of_year),
                row.clone(),
            );
        }
        Ok(())
    }

    async fn daily_window(
        &self,
        channel: &str,
        from: NaiveDate,
        to: NaiveDate,
    ) -> Result<Vec<DailyAggregate>, StoreError> {
        let inner = self.inner.lock().await;
        let mut rows: Vec<_> = inner
            .daily
            .values()
            .filter(|r| r.channel == channel && r.date >= from && r.date <= to)
            .cloned()
            .collect();
        rows.sort_by_key(|r| r.date);
        Ok(rows)
    }

    async fn annual_year(&self, year: i32) -> Result<Vec<AnnualAggregate>, StoreError> {
        let inner = self.inner.lock().await;
        let mut rows: Vec<_> = inner
            .annual
            .values()
            .filter(|r| r.year == year)
            .cloned()
            .collect();
        rows.sort_by(|a, b| (&a.channel, a.day_of_year).cmp(&(&b.channel, b.day_of_year)));
        Ok(rows)
    }

    async fn upsert_line_items(&self, rows: &[LineItemRecord]) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        for row in rows {
            inner.line_items.insert(row.natural_key(), row.clone());
        }
        Ok(())
    }

    async fn upsert_fulfillments(&self, rows: &[FulfillmentRecord]) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        for row in rows {
            inner.fulfillments.insert(row.natural_key(), row.clone());
        }
        Ok(())
    }

    async fn line_item_total_quantity(
        &self,
        channel: &str,
        sku: &str,
    ) -> Result<i64, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner
            .line_items
            .values()
            .filter(|r| r.channel == channel && r.sku == sku)
            .map(|r| r.quantity)
            .sum())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::sync::Arc;

    fn line_item(order: &str, sku: &str, quantity: i64) -> LineItemRecord {
        LineItemRecord {
            channel: "shopify_main".into(),
            order_id: order.into(),
            sku: sku.into(),
            quantity,
            unit_price_cents: 14_500,
            sold_at: Utc.with_ymd_and_hms(2026, 3, 14, 15, 9, 0).single().unwrap(),
        }
    }

    #[tokio::test]
    async fn re_upserting_the_same_records_does_not_double_count() {
        let store = MemStore::new();
        let rows = vec![
            line_item("1001", "ABC", 3),
            line_item("1002", "ABC", 5),
            line_item("1003", "ABC", 2),
        ];
        store.upsert_line_items(&rows).await.unwrap();
        store.upsert_line_items(&rows).await.unwrap();

        assert_eq!(store.line_item_count().await, 3);
        assert_eq!(
            store
                .line_item_total_quantity("shopify_main", "ABC")
                .await
                .unwrap(),
            10
        );
    }

    #[tokio::test]
    async fn concurrent_acquires_yield_exactly_one_lock() {
        let store = Arc::new(MemStore::new());
        let a = {
            let store = store.clone();
            tokio::spawn(async move { store.acquire_lock("orders", DEFAULT_LOCK_TTL).await })
        };
        let b = {
            let store = store.clone();
            tokio::spawn(async move { store.acquire_lock("orders", DEFAULT_LOCK_TTL).await })
        };
        let a = a.await.unwrap().unwrap();
        let b = b.await.unwrap().unwrap();
        assert_eq!(a.is_some() as u8 + b.is_some() as u8, 1);

        let winner = a.or(b).unwrap();
        store.release_lock("orders", winner.holder).await.unwrap();
        assert!(store
            .acquire_lock("orders", DEFAULT_LOCK_TTL)
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn expired_lock_is_stealable() {
        let store = MemStore::new();
        let first = store
            .acquire_lock("orders", Duration::ZERO)
            .await
            .unwrap()
            .unwrap();
        let second = store
            .acquire_lock("orders", DEFAULT_LOCK_TTL)
            .await
            .unwrap()
            .expect("expired lock should be stealable");
        assert_ne!(first.holder, second.holder);
    }

    #[tokio::test]
    async fn release_is_keyed_by_holder() {
        let store = MemStore::new();
        let lock = store
            .acquire_lock("orders", DEFAULT_LOCK_TTL)
            .await
            .unwrap()
            .unwrap();
        // A stale holder token must not free someone else's lock.
        store.release_lock("orders", Uuid::new_v4()).await.unwrap();
        assert!(store
            .acquire_lock("orders", DEFAULT_LOCK_TTL)
            .await
            .unwrap()
            .is_none());
        store.release_lock("orders", lock.holder).await.unwrap();
    }

    #[tokio::test]
    async fn different_job_names_lock_independently() {
        let store = MemStore::new();
        assert!(store
            .acquire_lock("orders", DEFAULT_LOCK_TTL)
            .await
            .unwrap()
            .is_some());
        assert!(store
            .acquire_lock("reconcile", DEFAULT_LOCK_TTL)
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn chunked_writes_survive_a_failing_chunk() {
        let rows: Vec<i64> = (0..10).collect();
        let report = write_in_chunks(&rows, 3, |chunk| {
            let fails = chunk.contains(&4);
            async move {
                if fails {
                    Err(StoreError::Invariant("boom".into()))
                } else {
                    Ok(())
                }
            }
        })
        .await;
        // chunks: [0,1,2] [3,4,5] [6,7,8] [9]; the second one fails.
        assert_eq!(report.failed_chunks, 1);
        assert_eq!(report.written, 7);
        assert!(!report.fully_written());
    }

    #[tokio::test]
    async fn finalize_run_is_single_shot() {
        let store = MemStore::new();
        let run = store.begin_run("orders").await.unwrap();
        store
            .finalize_run(run.id, RunStatus::Success, Some(5), 5, None, serde_json::json!({}))
            .await
            .unwrap();
        let again = store
            .finalize_run(run.id, RunStatus::Failed, None, 0, None, serde_json::json!({}))
            .await;
        assert!(again.is_err());
        let latest = store.latest_run("orders").await.unwrap().unwrap();
        assert_eq!(latest.status, RunStatus::Success);
    }

    #[tokio::test]
    async fn annual_upsert_rejects_duplicate_date_under_different_key() {
        let store = MemStore::new();
        let date = NaiveDate::from_ymd_opt(2024, 3, 10).unwrap();
        let good = AnnualAggregate::for_date("shopify_main", date, 10, 1000).unwrap();
        store.upsert_annual(&[good.clone()]).await.unwrap();

        // Same calendar date arriving under an off-by-one day-of-year key,
        // the shape a timezone-shifted date computation would produce.
        let mut off_by_one = good;
        off_by_one.day_of_year += 1;
        let err = store.upsert_annual(&[off_by_one]).await;
        assert!(matches!(err, Err(StoreError::Invariant(_))));
    }
}
