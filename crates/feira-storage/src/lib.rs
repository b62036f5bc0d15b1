//! Price-quote persistence, raw-artifact storage and HTTP fetch utilities.
//!
//! The [`PriceStore`] trait is the single seam between the sync engine and
//! the database; `PgPriceStore` is the production implementation and
//! `MemoryPriceStore` mirrors its semantics for tests.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use feira_core::{source_rank, NewPriceQuote, PriceQuote};
use reqwest::StatusCode;
use sha2::{Digest, Sha256};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use uuid::Uuid;

pub const CRATE_NAME: &str = "feira-storage";

// ---------------------------------------------------------------------------
// Price store
// ---------------------------------------------------------------------------

#[async_trait]
pub trait PriceStore: Send + Sync {
    /// Batch insert; rows conflicting on (product_name, date,
    /// algorithm_version) are skipped. Returns the number actually written.
    async fn insert_skip_duplicates(&self, rows: &[NewPriceQuote]) -> anyhow::Result<u64>;

    /// Insert-or-update keyed on (product_name, date, algorithm_version).
    /// The update path refreshes the price/unit fields and leaves the
    /// original created_at in place.
    async fn upsert(&self, row: &NewPriceQuote) -> anyhow::Result<()>;

    /// Case-insensitive exact-name lookup, newest first.
    async fn find_by_name(&self, name: &str) -> anyhow::Result<Option<PriceQuote>>;

    /// All quotes for a calendar date, ordered by product name.
    async fn list_by_date(&self, date: NaiveDate) -> anyhow::Result<Vec<PriceQuote>>;

    /// Most recent quotes for a name, ordered date desc then created_at
    /// desc, capped at `limit`.
    async fn recent_by_name(&self, name: &str, limit: i64) -> anyhow::Result<Vec<PriceQuote>>;

    /// For every product name: the top-ranked quote of its most recent date
    /// (source rank desc, then created_at desc), ordered by name.
    async fn latest_all(&self) -> anyhow::Result<Vec<PriceQuote>>;
}

#[derive(Debug, Clone)]
pub struct PgPriceStore {
    pool: PgPool,
}

impl PgPriceStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str) -> anyhow::Result<Self> {
        let pool = PgPool::connect(database_url)
            .await
            .context("connecting to postgres")?;
        Ok(Self { pool })
    }

    pub async fn run_migrations(&self) -> anyhow::Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .context("running price_quotes migrations")?;
        Ok(())
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

fn row_to_quote(row: &PgRow) -> anyhow::Result<PriceQuote> {
    Ok(PriceQuote {
        id: row.try_get("id")?,
        product_name: row.try_get("product_name")?,
        product_unit: row.try_get("product_unit")?,
        unit_kind: row.try_get("unit_kind")?,
        unit_kg: row.try_get("unit_kg")?,
        pack_count: row.try_get("pack_count")?,
        price_per_kg: row.try_get("price_per_kg")?,
        market_price: row.try_get("market_price")?,
        suggested_price: row.try_get("suggested_price")?,
        date: row.try_get("date")?,
        algorithm_version: row.try_get("algorithm_version")?,
        created_at: row.try_get("created_at")?,
    })
}

const SELECT_COLUMNS: &str = "id, product_name, product_unit, unit_kind, unit_kg, pack_count, \
     price_per_kg, market_price, suggested_price, date, algorithm_version, created_at";

#[async_trait]
impl PriceStore for PgPriceStore {
    async fn insert_skip_duplicates(&self, rows: &[NewPriceQuote]) -> anyhow::Result<u64> {
        let mut written = 0u64;
        for row in rows {
            let result = sqlx::query(
                r#"
                INSERT INTO price_quotes
                    (product_name, product_unit, unit_kind, unit_kg, pack_count,
                     price_per_kg, market_price, suggested_price, date, algorithm_version)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
                ON CONFLICT (product_name, date, algorithm_version) DO NOTHING
                "#,
            )
            .bind(&row.product_name)
            .bind(&row.product_unit)
            .bind(&row.unit_kind)
            .bind(row.unit_kg)
            .bind(row.pack_count)
            .bind(row.price_per_kg)
            .bind(row.market_price)
            .bind(row.suggested_price)
            .bind(row.date)
            .bind(&row.algorithm_version)
            .execute(&self.pool)
            .await
            .with_context(|| format!("inserting quote for {}", row.product_name))?;
            written += result.rows_affected();
        }
        Ok(written)
    }

    async fn upsert(&self, row: &NewPriceQuote) -> anyhow::Result<()> {
        sqlx::query(
            r#"
            INSERT INTO price_quotes
                (product_name, product_unit, unit_kind, unit_kg, pack_count,
                 price_per_kg, market_price, suggested_price, date, algorithm_version)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            ON CONFLICT (product_name, date, algorithm_version) DO UPDATE SET
                product_unit = EXCLUDED.product_unit,
                unit_kind = EXCLUDED.unit_kind,
                unit_kg = EXCLUDED.unit_kg,
                pack_count = EXCLUDED.pack_count,
                price_per_kg = EXCLUDED.price_per_kg,
                market_price = EXCLUDED.market_price,
                suggested_price = EXCLUDED.suggested_price
            "#,
        )
        .bind(&row.product_name)
        .bind(&row.product_unit)
        .bind(&row.unit_kind)
        .bind(row.unit_kg)
        .bind(row.pack_count)
        .bind(row.price_per_kg)
        .bind(row.market_price)
        .bind(row.suggested_price)
        .bind(row.date)
        .bind(&row.algorithm_version)
        .execute(&self.pool)
        .await
        .with_context(|| format!("upserting quote for {}", row.product_name))?;
        Ok(())
    }

    async fn find_by_name(&self, name: &str) -> anyhow::Result<Option<PriceQuote>> {
        let row = sqlx::query(&format!(
            r#"
            SELECT {SELECT_COLUMNS}
              FROM price_quotes
             WHERE lower(product_name) = lower($1)
             ORDER BY date DESC, created_at DESC
             LIMIT 1
            "#
        ))
        .bind(name)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(row_to_quote).transpose()
    }

    async fn list_by_date(&self, date: NaiveDate) -> anyhow::Result<Vec<PriceQuote>> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {SELECT_COLUMNS}
              FROM price_quotes
             WHERE date = $1
             ORDER BY product_name ASC
            "#
        ))
        .bind(date)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_quote).collect()
    }

    async fn recent_by_name(&self, name: &str, limit: i64) -> anyhow::Result<Vec<PriceQuote>> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {SELECT_COLUMNS}
              FROM price_quotes
             WHERE lower(product_name) = lower($1)
             ORDER BY date DESC, created_at DESC
             LIMIT $2
            "#
        ))
        .bind(name)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_quote).collect()
    }

    async fn latest_all(&self) -> anyhow::Result<Vec<PriceQuote>> {
        // Single windowed query: partition by name, keep the top-ranked row
        // of each name's most recent date.
        let rows = sqlx::query(
            r#"
            WITH latest_date AS (
                SELECT product_name, MAX(date) AS max_date
                  FROM price_quotes
                 GROUP BY product_name
            ),
            ranked AS (
                SELECT pq.*,
                       ROW_NUMBER() OVER (
                           PARTITION BY pq.product_name
                           ORDER BY
                               CASE
                                   WHEN lower(pq.algorithm_version) LIKE 'ama%' THEN 2
                                   WHEN lower(pq.algorithm_version) LIKE 'agrolink%' THEN 1
                                   ELSE 0
                               END DESC,
                               pq.created_at DESC
                       ) AS rn
                  FROM price_quotes pq
                  JOIN latest_date ld
                    ON pq.product_name = ld.product_name AND pq.date = ld.max_date
            )
            SELECT id, product_name, product_unit, unit_kind, unit_kg, pack_count,
                   price_per_kg, market_price, suggested_price, date,
                   algorithm_version, created_at
              FROM ranked
             WHERE rn = 1
             ORDER BY product_name ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_quote).collect()
    }
}

/// In-memory replica of the store semantics, used by engine and handler
/// tests that must not depend on a running database.
#[derive(Debug, Default)]
pub struct MemoryPriceStore {
    rows: Mutex<Vec<PriceQuote>>,
}

impl MemoryPriceStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn all(&self) -> Vec<PriceQuote> {
        self.rows.lock().await.clone()
    }

    /// Seeds a fully-formed row, bypassing conflict handling.
    pub async fn seed(&self, quote: PriceQuote) {
        self.rows.lock().await.push(quote);
    }

    fn materialize(row: &NewPriceQuote) -> PriceQuote {
        PriceQuote {
            id: Uuid::new_v4(),
            product_name: row.product_name.clone(),
            product_unit: row.product_unit.clone(),
            unit_kind: row.unit_kind.clone(),
            unit_kg: row.unit_kg,
            pack_count: row.pack_count,
            price_per_kg: row.price_per_kg,
            market_price: row.market_price,
            suggested_price: row.suggested_price,
            date: row.date,
            algorithm_version: row.algorithm_version.clone(),
            created_at: Utc::now(),
        }
    }

    fn conflicts(a: &PriceQuote, b: &NewPriceQuote) -> bool {
        a.product_name == b.product_name
            && a.date == b.date
            && a.algorithm_version == b.algorithm_version
    }
}

#[async_trait]
impl PriceStore for MemoryPriceStore {
    async fn insert_skip_duplicates(&self, rows: &[NewPriceQuote]) -> anyhow::Result<u64> {
        let mut stored = self.rows.lock().await;
        let mut written = 0u64;
        for row in rows {
            if stored.iter().any(|existing| Self::conflicts(existing, row)) {
                continue;
            }
            stored.push(Self::materialize(row));
            written += 1;
        }
        Ok(written)
    }

    async fn upsert(&self, row: &NewPriceQuote) -> anyhow::Result<()> {
        let mut stored = self.rows.lock().await;
        if let Some(existing) = stored.iter_mut().find(|e| Self::conflicts(e, row)) {
            existing.product_unit = row.product_unit.clone();
            existing.unit_kind = row.unit_kind.clone();
            existing.unit_kg = row.unit_kg;
            existing.pack_count = row.pack_count;
            existing.price_per_kg = row.price_per_kg;
            existing.market_price = row.market_price;
            existing.suggested_price = row.suggested_price;
        } else {
            stored.push(Self::materialize(row));
        }
        Ok(())
    }

    async fn find_by_name(&self, name: &str) -> anyhow::Result<Option<PriceQuote>> {
        let stored = self.rows.lock().await;
        let mut matches: Vec<_> = stored
            .iter()
            .filter(|q| q.product_name.eq_ignore_ascii_case(name))
            .cloned()
            .collect();
        matches.sort_by(|a, b| b.date.cmp(&a.date).then(b.created_at.cmp(&a.created_at)));
        Ok(matches.into_iter().next())
    }

    async fn list_by_date(&self, date: NaiveDate) -> anyhow::Result<Vec<PriceQuote>> {
        let stored = self.rows.lock().await;
        let mut matches: Vec<_> = stored.iter().filter(|q| q.date == date).cloned().collect();
        matches.sort_by(|a, b| a.product_name.cmp(&b.product_name));
        Ok(matches)
    }

    async fn recent_by_name(&self, name: &str, limit: i64) -> anyhow::Result<Vec<PriceQuote>> {
        let stored = self.rows.lock().await;
        let mut matches: Vec<_> = stored
            .iter()
            .filter(|q| q.product_name.eq_ignore_ascii_case(name))
            .cloned()
            .collect();
        matches.sort_by(|a, b| b.date.cmp(&a.date).then(b.created_at.cmp(&a.created_at)));
        matches.truncate(limit.max(0) as usize);
        Ok(matches)
    }

    async fn latest_all(&self) -> anyhow::Result<Vec<PriceQuote>> {
        let stored = self.rows.lock().await;
        let mut max_dates: HashMap<String, NaiveDate> = HashMap::new();
        for q in stored.iter() {
            max_dates
                .entry(q.product_name.clone())
                .and_modify(|d| *d = (*d).max(q.date))
                .or_insert(q.date);
        }

        let mut best: HashMap<String, PriceQuote> = HashMap::new();
        for q in stored.iter() {
            if max_dates.get(&q.product_name) != Some(&q.date) {
                continue;
            }
            match best.get(&q.product_name) {
                Some(current)
                    if (source_rank(&current.algorithm_version), current.created_at)
                        >= (source_rank(&q.algorithm_version), q.created_at) => {}
                _ => {
                    best.insert(q.product_name.clone(), q.clone());
                }
            }
        }

        let mut out: Vec<_> = best.into_values().collect();
        out.sort_by(|a, b| a.product_name.cmp(&b.product_name));
        Ok(out)
    }
}

// ---------------------------------------------------------------------------
// Raw artifact storage (fetched PDFs, OCR crops)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct StoredArtifact {
    pub content_hash: String,
    pub relative_path: PathBuf,
    pub absolute_path: PathBuf,
    pub byte_size: usize,
    pub deduplicated: bool,
}

/// Immutable, hash-addressed byte store. Collectors drop the raw bulletin
/// PDF and the per-row OCR crops here so failed parses can be replayed.
#[derive(Debug, Clone)]
pub struct ArtifactStore {
    root: PathBuf,
}

impl ArtifactStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn sha256_hex(bytes: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        hex::encode(hasher.finalize())
    }

    fn relative_path(
        fetched_at: DateTime<Utc>,
        source: &str,
        content_hash: &str,
        extension: &str,
    ) -> PathBuf {
        let stamp = fetched_at.format("%Y%m%d").to_string();
        let ext = extension.trim_start_matches('.').trim();
        let ext = if ext.is_empty() { "bin" } else { ext };
        PathBuf::from(stamp)
            .join(source)
            .join(format!("{content_hash}.{ext}"))
    }

    /// Stores bytes under a hash-addressed path with an atomic temp-file
    /// rename; a pre-existing path means the same content was stored before.
    pub async fn store_bytes(
        &self,
        fetched_at: DateTime<Utc>,
        source: &str,
        extension: &str,
        bytes: &[u8],
    ) -> anyhow::Result<StoredArtifact> {
        let content_hash = Self::sha256_hex(bytes);
        let relative_path = Self::relative_path(fetched_at, source, &content_hash, extension);
        let absolute_path = self.root.join(&relative_path);

        if let Some(parent) = absolute_path.parent() {
            fs::create_dir_all(parent)
                .await
                .with_context(|| format!("creating artifact directory {}", parent.display()))?;
        }

        if fs::try_exists(&absolute_path)
            .await
            .with_context(|| format!("checking artifact path {}", absolute_path.display()))?
        {
            return Ok(StoredArtifact {
                content_hash,
                relative_path,
                absolute_path,
                byte_size: bytes.len(),
                deduplicated: true,
            });
        }

        let temp_path = absolute_path
            .parent()
            .map(|p| p.join(format!(".{}.tmp", Uuid::new_v4())))
            .context("artifact path has no parent")?;

        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await
            .with_context(|| format!("opening temp artifact file {}", temp_path.display()))?;
        file.write_all(bytes)
            .await
            .with_context(|| format!("writing temp artifact file {}", temp_path.display()))?;
        file.flush().await?;
        drop(file);

        match fs::rename(&temp_path, &absolute_path).await {
            Ok(()) => Ok(StoredArtifact {
                content_hash,
                relative_path,
                absolute_path,
                byte_size: bytes.len(),
                deduplicated: false,
            }),
            Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {
                let _ = fs::remove_file(&temp_path).await;
                Ok(StoredArtifact {
                    content_hash,
                    relative_path,
                    absolute_path,
                    byte_size: bytes.len(),
                    deduplicated: true,
                })
            }
            Err(err) => {
                let _ = fs::remove_file(&temp_path).await;
                Err(err).with_context(|| {
                    format!("renaming temp artifact into {}", absolute_path.display())
                })
            }
        }
    }
}

// ---------------------------------------------------------------------------
// HTTP fetch utilities
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() {
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
            max_retries: 3,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
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
    pub user_agent: Option<String>,
    pub backoff: BackoffPolicy,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
            backoff: BackoffPolicy::default(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub body: Vec<u8>,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed after retries: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
}

#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
    backoff: BackoffPolicy,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);
        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }
        let client = builder.build().context("building reqwest client")?;
        Ok(Self {
            client,
            backoff: config.backoff,
        })
    }

    /// GET with capped exponential backoff for retryable failures.
    pub async fn fetch_bytes(&self, url: &str) -> Result<FetchedResponse, FetchError> {
        let mut last_request_error: Option<reqwest::Error> = None;

        for attempt in 0..=self.backoff.max_retries {
            match self.client.get(url).send().await {
                Ok(resp) => {
                    let status = resp.status();
                    let final_url = resp.url().to_string();

                    if status.is_success() {
                        let body = resp.bytes().await?.to_vec();
                        return Ok(FetchedResponse {
                            status,
                            final_url,
                            body,
                        });
                    }

                    if classify_status(status) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        tracing::debug!(%status, url, attempt, "retrying fetch");
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        continue;
                    }
                    return Err(FetchError::HttpStatus {
                        status: status.as_u16(),
                        url: final_url,
                    });
                }
                Err(err) => {
                    if classify_reqwest_error(&err) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        last_request_error = Some(err);
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        continue;
                    }
                    return Err(FetchError::Request(err));
                }
            }
        }

        Err(match last_request_error {
            Some(err) => FetchError::Request(err),
            None => FetchError::HttpStatus {
                status: 0,
                url: url.to_string(),
            },
        })
    }

    /// Lightweight existence probe. 404s and transport errors are an
    /// expected part of candidate-URL scanning, so this never errors.
    pub async fn head_ok(&self, url: &str) -> bool {
        match self.client.head(url).send().await {
            Ok(resp) => resp.status().is_success(),
            Err(_) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use feira_core::{ALGORITHM_AGROLINK, ALGORITHM_AMA};
    use tempfile::tempdir;

    fn quote(name: &str, date: (i32, u32, u32), alg: &str, price: f64) -> NewPriceQuote {
        NewPriceQuote {
            product_name: name.to_string(),
            product_unit: None,
            unit_kind: Some("Kg".to_string()),
            unit_kg: Some(1.0),
            pack_count: None,
            price_per_kg: Some(price),
            market_price: price,
            suggested_price: price,
            date: NaiveDate::from_ymd_opt(date.0, date.1, date.2).unwrap(),
            algorithm_version: alg.to_string(),
        }
    }

    #[tokio::test]
    async fn memory_store_skips_duplicates() {
        let store = MemoryPriceStore::new();
        let rows = vec![quote("TOMATE", (2025, 11, 17), ALGORITHM_AGROLINK, 10.5)];

        assert_eq!(store.insert_skip_duplicates(&rows).await.unwrap(), 1);
        assert_eq!(store.insert_skip_duplicates(&rows).await.unwrap(), 0);
        assert_eq!(store.all().await.len(), 1);
    }

    #[tokio::test]
    async fn memory_store_upsert_replaces_price_in_place() {
        let store = MemoryPriceStore::new();
        store
            .upsert(&quote("TOMATE", (2025, 11, 17), ALGORITHM_AGROLINK, 10.5))
            .await
            .unwrap();
        store
            .upsert(&quote("TOMATE", (2025, 11, 17), ALGORITHM_AGROLINK, 12.0))
            .await
            .unwrap();

        let rows = store.all().await;
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].market_price, 12.0);
    }

    #[tokio::test]
    async fn memory_store_latest_all_prefers_bulletin_source() {
        let store = MemoryPriceStore::new();
        store
            .insert_skip_duplicates(&[
                quote("TOMATE", (2025, 11, 17), ALGORITHM_AGROLINK, 11.0),
                quote("TOMATE", (2025, 11, 17), ALGORITHM_AMA, 10.0),
                quote("CEBOLA", (2025, 11, 16), ALGORITHM_AGROLINK, 5.0),
            ])
            .await
            .unwrap();

        let latest = store.latest_all().await.unwrap();
        assert_eq!(latest.len(), 2);
        assert_eq!(latest[0].product_name, "CEBOLA");
        assert_eq!(latest[1].product_name, "TOMATE");
        assert_eq!(latest[1].algorithm_version, ALGORITHM_AMA);
    }

    #[tokio::test]
    async fn memory_store_latest_all_ignores_stale_dates() {
        let store = MemoryPriceStore::new();
        store
            .insert_skip_duplicates(&[
                quote("TOMATE", (2025, 11, 16), ALGORITHM_AMA, 9.0),
                quote("TOMATE", (2025, 11, 17), ALGORITHM_AGROLINK, 11.0),
            ])
            .await
            .unwrap();

        let latest = store.latest_all().await.unwrap();
        assert_eq!(latest.len(), 1);
        // Newest date wins even when an older bulletin row exists.
        assert_eq!(latest[0].algorithm_version, ALGORITHM_AGROLINK);
        assert_eq!(latest[0].market_price, 11.0);
    }

    #[test]
    fn artifact_hashing_is_stable() {
        let hash = ArtifactStore::sha256_hex(b"hello world");
        assert_eq!(
            hash,
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
    }

    #[tokio::test]
    async fn artifact_store_deduplicates_by_hash_path() {
        let dir = tempdir().expect("tempdir");
        let store = ArtifactStore::new(dir.path());
        let fetched_at = DateTime::parse_from_rfc3339("2025-11-17T12:00:00Z")
            .expect("ts")
            .with_timezone(&Utc);

        let first = store
            .store_bytes(fetched_at, "ama", "pdf", b"%PDF-1.4 same")
            .await
            .expect("first store");
        let second = store
            .store_bytes(fetched_at, "ama", "pdf", b"%PDF-1.4 same")
            .await
            .expect("second store");

        assert!(!first.deduplicated);
        assert!(second.deduplicated);
        assert_eq!(first.relative_path, second.relative_path);
        assert!(first.absolute_path.exists());
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
        assert_eq!(policy.delay_for_attempt(5), Duration::from_millis(350));
    }
}
