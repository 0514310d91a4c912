//! Vendor API clients: rate-limit-aware HTTP, cursor pagination, and the
//! transformers that map vendor records into the internal row shapes.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use base64::Engine;
use chrono::{DateTime, NaiveDate, Utc};
use hmac::{Hmac, Mac};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use thiserror::Error;
use tracing::{info_span, warn, Instrument};
use whs_core::{DailyAggregate, FulfillmentRecord, LineItemRecord};

pub const CRATE_NAME: &str = "whs-vendors";

/// Fixed pause between pages; respects vendor rate limits empirically.
pub const DEFAULT_INTER_PAGE_DELAY: Duration = Duration::from_millis(300);
pub const DEFAULT_PAGE_SIZE: usize = 250;

#[derive(Debug, Error)]
pub enum VendorError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("rate limited after {attempts} attempts for {url}")]
    RateLimited { attempts: usize, url: String },
    #[error("unexpected vendor payload: {0}")]
    Decode(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

/// Only 429 is retried; any other non-success status aborts the run and
/// propagates to the caller.
pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: String,
    pub backoff: BackoffPolicy,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(60),
            user_agent: "whs-sync/0.1".to_string(),
            backoff: BackoffPolicy::default(),
        }
    }
}

/// Thin reqwest wrapper with an explicit bounded retry loop. A persistently
/// rate-limited vendor exhausts `max_retries` and escalates instead of
/// recursing forever.
#[derive(Debug, Clone)]
pub struct HttpClient {
    client: reqwest::Client,
    backoff: BackoffPolicy,
}

impl HttpClient {
    pub fn new(config: HttpClientConfig) -> Result<Self, VendorError> {
        let client = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout)
            .user_agent(config.user_agent)
            .build()?;
        Ok(Self {
            client,
            backoff: config.backoff,
        })
    }

    pub fn inner(&self) -> &reqwest::Client {
        &self.client
    }

    pub async fn send_with_retry(
        &self,
        request: reqwest::RequestBuilder,
    ) -> Result<reqwest::Response, VendorError> {
        let mut attempts = 0usize;
        loop {
            let attempt = request
                .try_clone()
                .ok_or_else(|| VendorError::Decode("request body is not cloneable".into()))?;
            attempts += 1;
            match attempt.send().await {
                Ok(resp) => {
                    let status = resp.status();
                    if status.is_success() {
                        return Ok(resp);
                    }
                    let url = resp.url().to_string();
                    if classify_status(status) == RetryDisposition::Retryable {
                        if attempts > self.backoff.max_retries {
                            return Err(VendorError::RateLimited { attempts, url });
                        }
                        let delay = self.backoff.delay_for_attempt(attempts - 1);
                        warn!(%url, attempts, delay_ms = delay.as_millis() as u64, "429, backing off");
                        tokio::time::sleep(delay).await;
                        continue;
                    }
                    return Err(VendorError::HttpStatus {
                        status: status.as_u16(),
                        url,
                    });
                }
                Err(err) => {
                    if classify_reqwest_error(&err) == RetryDisposition::Retryable
                        && attempts <= self.backoff.max_retries
                    {
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempts - 1)).await;
                        continue;
                    }
                    return Err(VendorError::Request(err));
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Cursors and pagination
// ---------------------------------------------------------------------------

/// Position in a vendor listing. `Opaque` carries a `page_info`-style token,
/// `Offset` a numeric high-water mark. Serializes into the run ledger's
/// `details` blob as the resume checkpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum Cursor {
    Start,
    Opaque(String),
    Offset(u64),
}

impl Default for Cursor {
    fn default() -> Self {
        Cursor::Start
    }
}

#[derive(Debug, Clone)]
pub struct Page<T> {
    pub records: Vec<T>,
    pub next: Option<Cursor>,
}

/// Elapsed-time guard for the host's hard wall-clock budget. Jobs stop
/// gracefully before the host kills them, persisting a resume cursor.
#[derive(Debug, Clone, Copy)]
pub struct RunBudget {
    deadline: Instant,
}

impl RunBudget {
    pub fn new(budget: Duration) -> Self {
        Self {
            deadline: Instant::now() + budget,
        }
    }

    pub fn exhausted(&self) -> bool {
        Instant::now() >= self.deadline
    }
}

/// A vendor-normalized order. Cancelled/test orders survive to this point so
/// the transformer owns the filtering rules in one place.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VendorOrder {
    pub order_id: String,
    pub created_at: DateTime<Utc>,
    pub cancelled: bool,
    pub test: bool,
    pub total_cents: i64,
    pub line_items: Vec<VendorLineItem>,
    pub fulfillments: Vec<VendorFulfillment>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VendorLineItem {
    pub sku: Option<String>,
    pub quantity: i64,
    pub unit_price_cents: i64,
    /// False for gift cards, shipping protection, and other non-product rows.
    pub product: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VendorFulfillment {
    pub sku: String,
    pub quantity: i64,
    pub fulfilled_at: DateTime<Utc>,
}

/// Authoritative per-day aggregate from a vendor analytics API.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VendorDaily {
    pub date: NaiveDate,
    pub orders: i64,
    pub revenue_cents: i64,
}

#[async_trait]
pub trait VendorOrders: Send + Sync {
    fn channel(&self) -> &str;
    async fn fetch_page(
        &self,
        cursor: &Cursor,
        page_size: usize,
    ) -> Result<Page<VendorOrder>, VendorError>;
}

#[async_trait]
pub trait VendorAnalytics: Send + Sync {
    fn channel(&self) -> &str;
    async fn daily_sales(
        &self,
        from: NaiveDate,
        to: NaiveDate,
    ) -> Result<Vec<VendorDaily>, VendorError>;
}

#[derive(Debug, Clone, Copy)]
pub struct PaginatorConfig {
    pub page_size: usize,
    pub inter_page_delay: Duration,
}

impl Default for PaginatorConfig {
    fn default() -> Self {
        Self {
            page_size: DEFAULT_PAGE_SIZE,
            inter_page_delay: DEFAULT_INTER_PAGE_DELAY,
        }
    }
}

/// How a page walk ended.
#[derive(Debug)]
pub enum WalkEnd {
    /// All pages consumed.
    Complete,
    /// Stopped early with a resume cursor; records so far are kept.
    BudgetExhausted,
    /// Vendor error after zero or more good pages; records so far are kept
    /// and the caller decides whether to persist them.
    Failed(VendorError),
}

#[derive(Debug)]
pub struct FetchOutcome {
    pub records: Vec<VendorOrder>,
    pub resume_cursor: Option<Cursor>,
    pub pages_fetched: usize,
    pub end: WalkEnd,
}

impl FetchOutcome {
    pub fn completed(&self) -> bool {
        matches!(self.end, WalkEnd::Complete)
    }
}

/// Walk every page from `resume`, pausing between pages and stopping early
/// when the budget runs out. The vendor signals the end of the listing by
/// returning no next cursor; record counts are not compared against the page
/// size here because some vendors page by raw line rows, not grouped orders.
pub async fn fetch_all_orders(
    vendor: &dyn VendorOrders,
    config: PaginatorConfig,
    budget: Option<&RunBudget>,
    resume: Cursor,
) -> FetchOutcome {
    let mut records = Vec::new();
    let mut cursor = resume;
    let mut pages_fetched = 0usize;

    loop {
        let span = info_span!("vendor_fetch_page", channel = vendor.channel(), page = pages_fetched);
        let page = match vendor
            .fetch_page(&cursor, config.page_size)
            .instrument(span)
            .await
        {
            Ok(page) => page,
            Err(err) => {
                return FetchOutcome {
                    records,
                    resume_cursor: Some(cursor),
                    pages_fetched,
                    end: WalkEnd::Failed(err),
                }
            }
        };

        pages_fetched += 1;
        records.extend(page.records);

        let Some(next) = page.next else {
            return FetchOutcome {
                records,
                resume_cursor: None,
                pages_fetched,
                end: WalkEnd::Complete,
            };
        };

        if budget.is_some_and(RunBudget::exhausted) {
            return FetchOutcome {
                records,
                resume_cursor: Some(next),
                pages_fetched,
                end: WalkEnd::BudgetExhausted,
            };
        }

        cursor = next;
        if !config.inter_page_delay.is_zero() {
            tokio::time::sleep(config.inter_page_delay).await;
        }
    }
}

// ---------------------------------------------------------------------------
// Transformers
// ---------------------------------------------------------------------------

fn sellable(order: &VendorOrder) -> bool {
    !order.cancelled && !order.test
}

/// Map orders to line-item rows, dropping cancelled/test orders and rows
/// without a real product SKU.
pub fn orders_to_line_items(channel: &str, orders: &[VendorOrder]) -> Vec<LineItemRecord> {
    orders
        .iter()
        .filter(|o| sellable(o))
        .flat_map(|order| {
            order.line_items.iter().filter_map(move |li| {
                let sku = li.sku.as_deref()?.trim();
                if sku.is_empty() || !li.product {
                    return None;
                }
                Some(LineItemRecord {
                    channel: channel.to_string(),
                    order_id: order.order_id.clone(),
                    sku: sku.to_string(),
                    quantity: li.quantity,
                    unit_price_cents: li.unit_price_cents,
                    sold_at: order.created_at,
                })
            })
        })
        .collect()
}

pub fn orders_to_fulfillments(channel: &str, orders: &[VendorOrder]) -> Vec<FulfillmentRecord> {
    orders
        .iter()
        .filter(|o| sellable(o))
        .flat_map(|order| {
            order.fulfillments.iter().map(move |f| FulfillmentRecord {
                channel: channel.to_string(),
                order_id: order.order_id.clone(),
                sku: f.sku.clone(),
                quantity: f.quantity,
                fulfilled_at: f.fulfilled_at,
            })
        })
        .collect()
}

/// Roll orders up into per-day totals for the near-real-time daily stats.
pub fn orders_to_daily(channel: &str, orders: &[VendorOrder]) -> Vec<DailyAggregate> {
    use std::collections::BTreeMap;
    let mut days: BTreeMap<NaiveDate, (i64, i64)> = BTreeMap::new();
    for order in orders.iter().filter(|o| sellable(o)) {
        let entry = days.entry(order.created_at.date_naive()).or_default();
        entry.0 += 1;
        entry.1 += order.total_cents;
    }
    let updated_at = Utc::now();
    days.into_iter()
        .map(|(date, (orders, revenue_cents))| DailyAggregate {
            channel: channel.to_string(),
            date,
            orders,
            revenue_cents,
            updated_at,
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Shopify
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct ShopifyConfig {
    pub channel: String,
    pub shop_domain: String,
    pub access_token: String,
    pub api_version: String,
}

pub struct ShopifyClient {
    http: HttpClient,
    config: ShopifyConfig,
}

#[derive(Debug, Deserialize)]
struct ShopifyOrdersEnvelope {
    orders: Vec<ShopifyOrder>,
}

#[derive(Debug, Deserialize)]
struct ShopifyOrder {
    id: u64,
    created_at: DateTime<Utc>,
    cancelled_at: Option<DateTime<Utc>>,
    #[serde(default)]
    test: bool,
    total_price: String,
    #[serde(default)]
    line_items: Vec<ShopifyLineItem>,
    #[serde(default)]
    fulfillments: Vec<ShopifyFulfillment>,
}

#[derive(Debug, Deserialize)]
struct ShopifyLineItem {
    sku: Option<String>,
    quantity: i64,
    price: String,
    #[serde(default)]
    gift_card: bool,
    #[serde(default)]
    requires_shipping: bool,
}

#[derive(Debug, Deserialize)]
struct ShopifyFulfillment {
    created_at: DateTime<Utc>,
    #[serde(default)]
    line_items: Vec<ShopifyLineItem>,
}

/// Parse a decimal money string ("1234.50") into cents without going through
/// floating point.
pub fn parse_money_cents(s: &str) -> Result<i64, VendorError> {
    let s = s.trim();
    let (sign, s) = match s.strip_prefix('-') {
        Some(rest) => (-1i64, rest),
        None => (1i64, s),
    };
    let (whole, frac) = match s.split_once('.') {
        Some((w, f)) => (w, f),
        None => (s, ""),
    };
    let whole: i64 = whole
        .parse()
        .map_err(|_| VendorError::Decode(format!("bad money value {s:?}")))?;
    if !frac.bytes().all(|b| b.is_ascii_digit()) {
        return Err(VendorError::Decode(format!("bad money value {s:?}")));
    }
    let frac_cents: i64 = match frac.len() {
        0 => 0,
        1 => {
            10 * frac
                .parse::<i64>()
                .map_err(|_| VendorError::Decode(format!("bad money value {s:?}")))?
        }
        _ => frac[..2]
            .parse()
            .map_err(|_| VendorError::Decode(format!("bad money value {s:?}")))?,
    };
    Ok(sign * (whole * 100 + frac_cents))
}

impl ShopifyOrder {
    fn into_vendor(self) -> Result<VendorOrder, VendorError> {
        Ok(VendorOrder {
            order_id: self.id.to_string(),
            created_at: self.created_at,
            cancelled: self.cancelled_at.is_some(),
            test: self.test,
            total_cents: parse_money_cents(&self.total_price)?,
            line_items: self
                .line_items
                .into_iter()
                .map(|li| {
                    Ok(VendorLineItem {
                        product: !li.gift_card && li.requires_shipping,
                        unit_price_cents: parse_money_cents(&li.price)?,
                        quantity: li.quantity,
                        sku: li.sku,
                    })
                })
                .collect::<Result<_, VendorError>>()?,
            fulfillments: self
                .fulfillments
                .into_iter()
                .flat_map(|f| {
                    let at = f.created_at;
                    f.line_items.into_iter().filter_map(move |li| {
                        let sku = li.sku?;
                        Some(VendorFulfillment {
                            sku,
                            quantity: li.quantity,
                            fulfilled_at: at,
                        })
                    })
                })
                .collect(),
        })
    }
}

/// Pull the `page_info` token for rel="next" out of a Shopify `Link` header.
pub fn next_page_info(link_header: &str) -> Option<String> {
    for part in link_header.split(',') {
        let part = part.trim();
        if !part.contains("rel=\"next\"") {
            continue;
        }
        let url = part.strip_prefix('<')?.split('>').next()?;
        for kv in url.split('?').nth(1)?.split('&') {
            if let Some(value) = kv.strip_prefix("page_info=") {
                return Some(value.to_string());
            }
        }
    }
    None
}

impl ShopifyClient {
    pub fn new(http: HttpClient, config: ShopifyConfig) -> Self {
        Self { http, config }
    }

    fn orders_url(&self) -> String {
        format!(
            "https://{}/admin/api/{}/orders.json",
            self.config.shop_domain, self.config.api_version
        )
    }

    fn graphql_url(&self) -> String {
        format!(
            "https://{}/admin/api/{}/graphql.json",
            self.config.shop_domain, self.config.api_version
        )
    }
}

#[async_trait]
impl VendorOrders for ShopifyClient {
    fn channel(&self) -> &str {
        &self.config.channel
    }

    async fn fetch_page(
        &self,
        cursor: &Cursor,
        page_size: usize,
    ) -> Result<Page<VendorOrder>, VendorError> {
        let mut query: Vec<(String, String)> = vec![("limit".into(), page_size.to_string())];
        match cursor {
            Cursor::Start => query.push(("status".into(), "any".into())),
            // page_info requests reject extra filters; the token carries them.
            Cursor::Opaque(token) => query.push(("page_info".into(), token.clone())),
            Cursor::Offset(_) => {
                return Err(VendorError::Decode(
                    "shopify pagination uses page_info tokens, not offsets".into(),
                ))
            }
        }

        let request = self
            .http
            .inner()
            .get(self.orders_url())
            .header("X-Shopify-Access-Token", &self.config.access_token)
            .query(&query);
        let resp = self.http.send_with_retry(request).await?;

        let next = resp
            .headers()
            .get(reqwest::header::LINK)
            .and_then(|v| v.to_str().ok())
            .and_then(next_page_info)
            .map(Cursor::Opaque);

        let envelope: ShopifyOrdersEnvelope = resp.json().await?;
        let records = envelope
            .orders
            .into_iter()
            .map(ShopifyOrder::into_vendor)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Page { records, next })
    }
}

#[async_trait]
impl VendorAnalytics for ShopifyClient {
    fn channel(&self) -> &str {
        &self.config.channel
    }

    /// ShopifyQL daily sales: the authoritative aggregate the reconciler
    /// trusts over locally accumulated numbers.
    async fn daily_sales(
        &self,
        from: NaiveDate,
        to: NaiveDate,
    ) -> Result<Vec<VendorDaily>, VendorError> {
        let shopifyql = format!(
            "FROM sales SHOW orders, total_sales GROUP BY day SINCE {from} UNTIL {to} ORDER BY day"
        );
        let body = serde_json::json!({
            "query": "query($q: String!) { shopifyqlQuery(query: $q) { tableData { rowData } } }",
            "variables": { "q": shopifyql },
        });

        let request = self
            .http
            .inner()
            .post(self.graphql_url())
            .header("X-Shopify-Access-Token", &self.config.access_token)
            .json(&body);
        let resp = self.http.send_with_retry(request).await?;
        let value: serde_json::Value = resp.json().await?;

        let rows = value
            .pointer("/data/shopifyqlQuery/tableData/rowData")
            .and_then(|v| v.as_array())
            .ok_or_else(|| VendorError::Decode("shopifyql response missing rowData".into()))?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let cells = row
                .as_array()
                .ok_or_else(|| VendorError::Decode("shopifyql row is not an array".into()))?;
            let [day, orders, total_sales] = cells.as_slice() else {
                return Err(VendorError::Decode(format!(
                    "shopifyql row has {} cells, expected 3",
                    cells.len()
                )));
            };
            let day = day
                .as_str()
                .ok_or_else(|| VendorError::Decode("shopifyql day cell is not a string".into()))?;
            // The day arrives as a plain YYYY-MM-DD string; parsing explicit
            // components keeps day-of-year math timezone-free downstream.
            let date = whs_core::parse_ymd(day)
                .map_err(|e| VendorError::Decode(format!("shopifyql day {day:?}: {e}")))?;
            let orders = orders
                .as_i64()
                .or_else(|| orders.as_str().and_then(|s| s.parse().ok()))
                .ok_or_else(|| VendorError::Decode("shopifyql orders cell unreadable".into()))?;
            let revenue_cents = match total_sales {
                serde_json::Value::String(s) => parse_money_cents(s)?,
                serde_json::Value::Number(n) => (n.as_f64().unwrap_or(0.0) * 100.0).round() as i64,
                _ => return Err(VendorError::Decode("shopifyql sales cell unreadable".into())),
            };
            out.push(VendorDaily {
                date,
                orders,
                revenue_cents,
            });
        }
        Ok(out)
    }
}

// ---------------------------------------------------------------------------
// NetSuite (SuiteQL)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct NetSuiteConfig {
    pub channel: String,
    pub account_id: String,
    pub consumer_key: String,
    pub consumer_secret: String,
    pub token_id: String,
    pub token_secret: String,
}

pub struct NetSuiteClient {
    http: HttpClient,
    config: NetSuiteConfig,
}

#[derive(Debug, Deserialize)]
struct SuiteQlEnvelope {
    #[serde(default)]
    items: Vec<serde_json::Value>,
}

fn percent_encode(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for byte in input.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'.' | b'_' | b'~' => {
                out.push(byte as char)
            }
            other => out.push_str(&format!("%{other:02X}")),
        }
    }
    out
}

impl NetSuiteClient {
    pub fn new(http: HttpClient, config: NetSuiteConfig) -> Self {
        Self { http, config }
    }

    fn suiteql_url(&self) -> String {
        format!(
            "https://{}.suitetalk.api.netsuite.com/services/rest/query/v1/suiteql",
            self.config.account_id
        )
    }

    /// OAuth 1.0a HMAC-SHA256 Authorization header. Timestamp and nonce are
    /// parameters so signing is deterministic under test.
    pub fn oauth_header(&self, method: &str, url: &str, timestamp: i64, nonce: &str) -> String {
        let mut params = vec![
            ("oauth_consumer_key", self.config.consumer_key.as_str()),
            ("oauth_token", self.config.token_id.as_str()),
            ("oauth_signature_method", "HMAC-SHA256"),
            ("oauth_version", "1.0"),
        ];
        let ts = timestamp.to_string();
        params.push(("oauth_timestamp", &ts));
        params.push(("oauth_nonce", nonce));
        params.sort();

        let param_string = params
            .iter()
            .map(|(k, v)| format!("{}={}", k, percent_encode(v)))
            .collect::<Vec<_>>()
            .join("&");
        let base_url = url.split('?').next().unwrap_or(url);
        let base_string = format!(
            "{}&{}&{}",
            method,
            percent_encode(base_url),
            percent_encode(&param_string)
        );
        let signing_key = format!(
            "{}&{}",
            percent_encode(&self.config.consumer_secret),
            percent_encode(&self.config.token_secret)
        );

        let mut mac = Hmac::<Sha256>::new_from_slice(signing_key.as_bytes())
            .unwrap_or_else(|_| unreachable!("hmac accepts any key length"));
        mac.update(base_string.as_bytes());
        let signature = base64::engine::general_purpose::STANDARD.encode(mac.finalize().into_bytes());

        let mut header = format!("OAuth realm=\"{}\"", self.config.account_id);
        for (k, v) in params {
            header.push_str(&format!(", {}=\"{}\"", k, percent_encode(v)));
        }
        header.push_str(&format!(", oauth_signature=\"{}\"", percent_encode(&signature)));
        header
    }

    async fn suiteql(&self, query: &str) -> Result<SuiteQlEnvelope, VendorError> {
        let url = self.suiteql_url();
        let nonce = uuid::Uuid::new_v4().simple().to_string();
        let auth = self.oauth_header("POST", &url, Utc::now().timestamp(), &nonce);
        let request = self
            .http
            .inner()
            .post(&url)
            .header("Authorization", auth)
            .header("Prefer", "transient")
            .json(&serde_json::json!({ "q": query }));
        let resp = self.http.send_with_retry(request).await?;
        Ok(resp.json().await?)
    }
}

fn json_str(v: &serde_json::Value, key: &str) -> Option<String> {
    v.get(key).and_then(|v| v.as_str()).map(str::to_string)
}

fn json_i64(v: &serde_json::Value, key: &str) -> Option<i64> {
    let cell = v.get(key)?;
    cell.as_i64().or_else(|| cell.as_str()?.parse().ok())
}

fn json_money_cents(v: &serde_json::Value, key: &str) -> Option<i64> {
    let cell = v.get(key)?;
    match cell {
        serde_json::Value::String(s) => parse_money_cents(s).ok(),
        serde_json::Value::Number(n) => Some((n.as_f64()? * 100.0).round() as i64),
        _ => None,
    }
}

#[async_trait]
impl VendorOrders for NetSuiteClient {
    fn channel(&self) -> &str {
        &self.config.channel
    }

    /// SuiteQL has no opaque cursor; the offset itself is the high-water mark.
    async fn fetch_page(
        &self,
        cursor: &Cursor,
        page_size: usize,
    ) -> Result<Page<VendorOrder>, VendorError> {
        let offset = match cursor {
            Cursor::Start => 0,
            Cursor::Offset(n) => *n,
            Cursor::Opaque(_) => {
                return Err(VendorError::Decode(
                    "netsuite pagination uses numeric offsets, not tokens".into(),
                ))
            }
        };

        let query = format!(
            "SELECT t.id AS transaction_id, t.tranid, t.trandate, t.foreigntotal, t.status, \
                    tl.id AS line_id, BUILTIN.DF(tl.item) AS sku, tl.quantity, tl.rate, tl.itemtype \
               FROM transactionline tl \
               JOIN transaction t ON tl.transaction = t.id \
              WHERE t.type IN ('CashSale', 'CustInvc') \
                AND tl.mainline = 'F' \
                AND tl.item IS NOT NULL \
              ORDER BY t.trandate DESC, t.id DESC, tl.linesequencenumber \
             OFFSET {offset} ROWS FETCH NEXT {page_size} ROWS ONLY"
        );
        let envelope = self.suiteql(&query).await?;

        let mut orders: Vec<VendorOrder> = Vec::new();
        for item in &envelope.items {
            let transaction_id = json_str(item, "transaction_id")
                .or_else(|| json_i64(item, "transaction_id").map(|n| n.to_string()))
                .ok_or_else(|| VendorError::Decode("suiteql row missing transaction_id".into()))?;
            let trandate = json_str(item, "trandate")
                .ok_or_else(|| VendorError::Decode("suiteql row missing trandate".into()))?;
            let date = whs_core::parse_ymd(&trandate)
                .map_err(|e| VendorError::Decode(format!("suiteql trandate {trandate:?}: {e}")))?;
            let created_at = date
                .and_hms_opt(0, 0, 0)
                .map(|dt| dt.and_utc())
                .ok_or_else(|| VendorError::Decode("suiteql trandate out of range".into()))?;

            let line = VendorLineItem {
                sku: json_str(item, "sku"),
                quantity: json_i64(item, "quantity").unwrap_or(0),
                unit_price_cents: json_money_cents(item, "rate").unwrap_or(0),
                product: json_str(item, "itemtype")
                    .map(|t| t == "InvtPart" || t == "Assembly")
                    .unwrap_or(false),
            };

            match orders.iter_mut().find(|o| o.order_id == transaction_id) {
                Some(order) => order.line_items.push(line),
                None => orders.push(VendorOrder {
                    order_id: transaction_id,
                    created_at,
                    cancelled: json_str(item, "status").is_some_and(|s| s == "Voided"),
                    test: false,
                    total_cents: json_money_cents(item, "foreigntotal").unwrap_or(0),
                    line_items: vec![line],
                    fulfillments: Vec::new(),
                }),
            }
        }

        let fetched = envelope.items.len();
        let next = if fetched < page_size {
            None
        } else {
            Some(Cursor::Offset(offset + fetched as u64))
        };
        Ok(Page {
            records: orders,
            next,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn order(id: &str, day: u32, total_cents: i64, items: &[(&str, i64)]) -> VendorOrder {
        VendorOrder {
            order_id: id.to_string(),
            created_at: Utc.with_ymd_and_hms(2026, 3, day, 9, 0, 0).single().unwrap(),
            cancelled: false,
            test: false,
            total_cents,
            line_items: items
                .iter()
                .map(|(sku, qty)| VendorLineItem {
                    sku: Some(sku.to_string()),
                    quantity: *qty,
                    unit_price_cents: 1000,
                    product: true,
                })
                .collect(),
            fulfillments: Vec::new(),
        }
    }

    /// Scripted vendor: fixed pages, counts requests.
    struct FakeVendor {
        pages: Vec<Vec<VendorOrder>>,
        page_size: usize,
        requests: AtomicUsize,
    }

    #[async_trait]
    impl VendorOrders for FakeVendor {
        fn channel(&self) -> &str {
            "shopify_main"
        }

        async fn fetch_page(
            &self,
            cursor: &Cursor,
            _page_size: usize,
        ) -> Result<Page<VendorOrder>, VendorError> {
            self.requests.fetch_add(1, Ordering::SeqCst);
            let index = match cursor {
                Cursor::Start => 0,
                Cursor::Offset(n) => (*n as usize) / self.page_size,
                Cursor::Opaque(token) => token.parse().unwrap(),
            };
            let records = self.pages.get(index).cloned().unwrap_or_default();
            let next = if index + 1 < self.pages.len() {
                Some(Cursor::Opaque((index + 1).to_string()))
            } else {
                None
            };
            Ok(Page { records, next })
        }
    }

    fn three_pages() -> FakeVendor {
        // page size 2, last page partial; SKU ABC quantities 3,5,2,4,1.
        FakeVendor {
            pages: vec![
                vec![order("1", 1, 100, &[("ABC", 3)]), order("2", 1, 100, &[("ABC", 5)])],
                vec![order("3", 2, 100, &[("ABC", 2)]), order("4", 2, 100, &[("ABC", 4)])],
                vec![order("5", 3, 100, &[("ABC", 1)])],
            ],
            page_size: 2,
            requests: AtomicUsize::new(0),
        }
    }

    fn fast() -> PaginatorConfig {
        PaginatorConfig {
            page_size: 2,
            inter_page_delay: Duration::ZERO,
        }
    }

    #[tokio::test]
    async fn paginator_concatenates_all_pages_with_exactly_n_requests() {
        let vendor = three_pages();
        let outcome = fetch_all_orders(&vendor, fast(), None, Cursor::Start).await;
        assert!(outcome.completed());
        assert_eq!(outcome.pages_fetched, 3);
        assert_eq!(vendor.requests.load(Ordering::SeqCst), 3);
        assert_eq!(
            outcome.records.iter().map(|o| o.order_id.as_str()).collect::<Vec<_>>(),
            ["1", "2", "3", "4", "5"]
        );
        assert!(outcome.resume_cursor.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn paginator_pauses_between_pages() {
        let vendor = three_pages();
        let config = PaginatorConfig {
            page_size: 2,
            inter_page_delay: Duration::from_millis(300),
        };
        let started = tokio::time::Instant::now();
        let outcome = fetch_all_orders(&vendor, config, None, Cursor::Start).await;
        assert!(outcome.completed());
        assert_eq!(outcome.pages_fetched, 3);
        // One pause after each page with a successor, none after the last.
        assert_eq!(started.elapsed(), Duration::from_millis(600));
    }

    #[tokio::test]
    async fn exhausted_budget_keeps_fetched_pages_and_a_resume_cursor() {
        let vendor = three_pages();
        let budget = RunBudget::new(Duration::ZERO);
        let first = fetch_all_orders(&vendor, fast(), Some(&budget), Cursor::Start).await;
        assert!(matches!(first.end, WalkEnd::BudgetExhausted));
        assert_eq!(first.records.len(), 2);
        let resume = first.resume_cursor.clone().expect("resume cursor");

        let rest = fetch_all_orders(&vendor, fast(), None, resume).await;
        assert!(rest.completed());

        let mut union: Vec<_> = first
            .records
            .iter()
            .chain(rest.records.iter())
            .map(|o| o.order_id.clone())
            .collect();
        union.sort();
        let uninterrupted = fetch_all_orders(&vendor, fast(), None, Cursor::Start).await;
        let mut full: Vec<_> = uninterrupted.records.iter().map(|o| o.order_id.clone()).collect();
        full.sort();
        assert_eq!(union, full);
    }

    #[tokio::test]
    async fn failed_page_keeps_earlier_records() {
        struct FailsOnSecond {
            requests: AtomicUsize,
        }

        #[async_trait]
        impl VendorOrders for FailsOnSecond {
            fn channel(&self) -> &str {
                "shopify_main"
            }
            async fn fetch_page(
                &self,
                _cursor: &Cursor,
                _page_size: usize,
            ) -> Result<Page<VendorOrder>, VendorError> {
                if self.requests.fetch_add(1, Ordering::SeqCst) == 0 {
                    Ok(Page {
                        records: vec![order("1", 1, 100, &[("ABC", 3)]), order("2", 1, 100, &[("ABC", 5)])],
                        next: Some(Cursor::Opaque("1".into())),
                    })
                } else {
                    Err(VendorError::HttpStatus {
                        status: 500,
                        url: "https://example.test".into(),
                    })
                }
            }
        }

        let vendor = FailsOnSecond {
            requests: AtomicUsize::new(0),
        };
        let outcome = fetch_all_orders(&vendor, fast(), None, Cursor::Start).await;
        assert!(matches!(outcome.end, WalkEnd::Failed(_)));
        assert_eq!(outcome.records.len(), 2);
        assert_eq!(outcome.resume_cursor, Some(Cursor::Opaque("1".into())));
    }

    async fn throttling_server() -> (std::net::SocketAddr, std::sync::Arc<AtomicUsize>) {
        use std::sync::Arc;

        let hits = Arc::new(AtomicUsize::new(0));
        let handler_hits = hits.clone();
        let app = axum::Router::new()
            .route(
                "/orders",
                axum::routing::get(move || {
                    let hits = handler_hits.clone();
                    async move {
                        // First request is throttled, every later one succeeds.
                        if hits.fetch_add(1, Ordering::SeqCst) == 0 {
                            (StatusCode::TOO_MANY_REQUESTS, "throttled")
                        } else {
                            (StatusCode::OK, "ok")
                        }
                    }
                }),
            )
            .route(
                "/throttled",
                axum::routing::get(|| async { (StatusCode::TOO_MANY_REQUESTS, "throttled") }),
            );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });
        (addr, hits)
    }

    fn impatient_client() -> HttpClient {
        HttpClient::new(HttpClientConfig {
            backoff: BackoffPolicy {
                max_retries: 2,
                base_delay: Duration::from_millis(1),
                max_delay: Duration::from_millis(1),
            },
            ..HttpClientConfig::default()
        })
        .unwrap()
    }

    #[tokio::test]
    async fn rate_limited_request_retries_then_succeeds() {
        let (addr, hits) = throttling_server().await;
        let client = impatient_client();

        let resp = client
            .send_with_retry(client.inner().get(format!("http://{addr}/orders")))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn persistent_rate_limiting_exhausts_the_retry_budget() {
        let (addr, _hits) = throttling_server().await;
        let client = impatient_client();

        let err = client
            .send_with_retry(client.inner().get(format!("http://{addr}/throttled")))
            .await
            .unwrap_err();
        // max_retries=2 allows three attempts in total.
        match err {
            VendorError::RateLimited { attempts, .. } => assert_eq!(attempts, 3),
            other => panic!("expected RateLimited, got {other:?}"),
        }
    }

    #[test]
    fn transformer_drops_cancelled_test_and_non_product_rows() {
        let mut cancelled = order("9", 1, 100, &[("ABC", 1)]);
        cancelled.cancelled = true;
        let mut test_order = order("10", 1, 100, &[("ABC", 1)]);
        test_order.test = true;
        let mut mixed = order("11", 1, 100, &[("ABC", 2)]);
        mixed.line_items.push(VendorLineItem {
            sku: Some("GIFTCARD".into()),
            quantity: 1,
            unit_price_cents: 5000,
            product: false,
        });
        mixed.line_items.push(VendorLineItem {
            sku: None,
            quantity: 1,
            unit_price_cents: 0,
            product: true,
        });

        let rows = orders_to_line_items("shopify_main", &[cancelled, test_order, mixed]);
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].order_id, "11");
        assert_eq!(rows[0].sku, "ABC");
    }

    #[test]
    fn daily_rollup_groups_by_calendar_date() {
        let orders = vec![
            order("1", 1, 1_000, &[]),
            order("2", 1, 2_000, &[]),
            order("3", 2, 5_000, &[]),
        ];
        let days = orders_to_daily("shopify_main", &orders);
        assert_eq!(days.len(), 2);
        assert_eq!(days[0].orders, 2);
        assert_eq!(days[0].revenue_cents, 3_000);
        assert_eq!(days[1].orders, 1);
        assert_eq!(days[1].revenue_cents, 5_000);
    }

    #[test]
    fn money_parsing_is_exact() {
        assert_eq!(parse_money_cents("1234.50").unwrap(), 123_450);
        assert_eq!(parse_money_cents("0.05").unwrap(), 5);
        assert_eq!(parse_money_cents("12").unwrap(), 1_200);
        assert_eq!(parse_money_cents("3.5").unwrap(), 350);
        assert_eq!(parse_money_cents("-10.99").unwrap(), -1_099);
        assert!(parse_money_cents("12,50").is_err());
    }

    #[test]
    fn money_parsing_rejects_non_ascii_fractions() {
        // Must come back as a decode error, not a char-boundary panic.
        assert!(parse_money_cents("1.\u{20ac}9").is_err());
        assert!(parse_money_cents("1.٥٠").is_err());
        assert!(parse_money_cents("2.5x").is_err());
    }

    #[test]
    fn link_header_next_token() {
        let link = "<https://shop.myshopify.com/admin/api/2024-07/orders.json?limit=250&page_info=abc123>; rel=\"next\", <https://shop.myshopify.com/...>; rel=\"previous\"";
        assert_eq!(next_page_info(link).as_deref(), Some("abc123"));
        assert_eq!(next_page_info("<https://x>; rel=\"previous\""), None);
    }

    #[test]
    fn cursor_checkpoint_round_trips_through_json() {
        for cursor in [
            Cursor::Start,
            Cursor::Opaque("tok".into()),
            Cursor::Offset(1000),
        ] {
            let json = serde_json::to_value(&cursor).unwrap();
            assert_eq!(serde_json::from_value::<Cursor>(json).unwrap(), cursor);
        }
    }

    #[test]
    fn oauth_header_shape() {
        let client = NetSuiteClient::new(
            HttpClient::new(HttpClientConfig::default()).unwrap(),
            NetSuiteConfig {
                channel: "netsuite".into(),
                account_id: "1234567".into(),
                consumer_key: "ck".into(),
                consumer_secret: "cs".into(),
                token_id: "tid".into(),
                token_secret: "ts".into(),
            },
        );
        let header = client.oauth_header(
            "POST",
            "https://1234567.suitetalk.api.netsuite.com/services/rest/query/v1/suiteql",
            1_700_000_000,
            "abcdef",
        );
        assert!(header.starts_with("OAuth realm=\"1234567\""));
        assert!(header.contains("oauth_consumer_key=\"ck\""));
        assert!(header.contains("oauth_signature_method=\"HMAC-SHA256\""));
        assert!(header.contains("oauth_timestamp=\"1700000000\""));
        assert!(header.contains("oauth_signature=\""));

        // Same inputs, same signature.
        let again = client.oauth_header(
            "POST",
            "https://1234567.suitetalk.api.netsuite.com/services/rest/query/v1/suiteql",
            1_700_000_000,
            "abcdef",
        );
        assert_eq!(header, again);
    }

    #[test]
    fn backoff_is_exponential_and_capped() {
        let policy = BackoffPolicy {
            max_retries: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
        };
        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(350));
        assert_eq!(policy.delay_for_attempt(6), Duration::from_millis(350));
    }
}
