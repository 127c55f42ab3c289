//! Content-addressed result cache.
//!
//! Extraction results are keyed by `(content hash, schema key, model id)` and
//! stored in a single SQLite table with TTL expiry and oldest-first eviction
//! past `max_entries`. Cache failures never propagate: a broken cache
//! degrades to a miss (`get`) or a no-op (`set`) plus a log entry, and the
//! pipeline keeps going.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, params};
use sha1::Sha1;
use sha2::{Digest as _, Sha256};

use crate::{
    async_utils::JoinWorker,
    config::{HashAlgorithm, ResultCacheConfig},
    prelude::*,
};

const SCHEMA: &str = r"
CREATE TABLE IF NOT EXISTS result_cache (
    cache_key TEXT PRIMARY KEY,
    content_hash TEXT NOT NULL,
    schema_key TEXT NOT NULL,
    model_id TEXT NOT NULL,
    structured_data TEXT NOT NULL,
    created_at TEXT NOT NULL,
    expires_at TEXT NOT NULL,
    hit_count INTEGER DEFAULT 0,
    content_size INTEGER,
    processing_time REAL
);

CREATE INDEX IF NOT EXISTS idx_cache_expires ON result_cache(expires_at);
CREATE INDEX IF NOT EXISTS idx_cache_content_hash ON result_cache(content_hash);
";

/// TTL used when `ttl_hours` is zero: effectively indefinite.
const INDEFINITE_TTL_HOURS: f64 = 24.0 * 365.0 * 10.0;

/// Session counters, reported in the `complete` event and operator stats.
#[derive(Debug, Default, Clone, Serialize)]
pub struct CacheMetrics {
    pub hits: u64,
    pub misses: u64,
    pub sets: u64,
    pub errors: u64,
}

/// Hash-based result cache with automatic expiration.
pub struct ResultCache {
    config: ResultCacheConfig,
    db_path: PathBuf,
    metrics: Mutex<CacheMetrics>,
}

impl ResultCache {
    pub fn new(config: ResultCacheConfig, db_path: PathBuf) -> Self {
        if !config.enabled {
            info!("result cache is disabled");
        } else {
            info!(
                ttl_hours = config.ttl_hours,
                max_entries = config.max_entries,
                db = %db_path.display(),
                "result cache initialized"
            );
        }
        Self {
            config,
            db_path,
            metrics: Mutex::new(CacheMetrics::default()),
        }
    }

    pub fn enabled(&self) -> bool {
        self.config.enabled
    }

    /// Ensure the table exists and start the background sweeper. The caller
    /// owns the returned worker.
    pub async fn start(self: &Arc<Self>) -> Result<JoinWorker> {
        if !self.config.enabled {
            return Ok(JoinWorker::noop());
        }
        self.with_connection(|conn| {
            conn.execute_batch(SCHEMA)?;
            Ok(())
        })
        .await?;

        let cache = Arc::clone(self);
        let interval = Duration::from_secs_f64(
            (self.config.cleanup_interval_hours * 3600.0).max(1.0),
        );
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // The first tick fires immediately; skip it.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                match cache.cleanup_expired().await {
                    Ok(0) => {}
                    Ok(removed) => info!(removed, "cleaned up expired cache entries"),
                    Err(err) => error!(%err, "cache sweeper failed"),
                }
            }
        });
        Ok(JoinWorker::from_handle(handle))
    }

    /// Look up a cached result. Returns `None` on miss, expiry, disabled
    /// cache, or any error.
    pub async fn get(
        &self,
        content: &str,
        schema_key: &str,
        model_id: &str,
    ) -> Option<Value> {
        if !self.config.enabled {
            return None;
        }
        let cache_key = self.cache_key(content, schema_key, model_id);
        let result = self
            .with_connection(move |conn| {
                let row: Option<(String, String, i64)> = conn
                    .query_row(
                        "SELECT structured_data, expires_at, hit_count
                         FROM result_cache WHERE cache_key = ?1",
                        params![cache_key],
                        |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
                    )
                    .optional()?;
                let (data, expires_at, hit_count) = match row {
                    Some(row) => row,
                    None => return Ok(None),
                };

                // Drop expired rows lazily.
                let expired = DateTime::parse_from_rfc3339(&expires_at)
                    .map(|expires| Utc::now() >= expires)
                    .unwrap_or(true);
                if expired {
                    conn.execute(
                        "DELETE FROM result_cache WHERE cache_key = ?1",
                        params![cache_key],
                    )?;
                    return Ok(None);
                }

                conn.execute(
                    "UPDATE result_cache SET hit_count = ?1 WHERE cache_key = ?2",
                    params![hit_count + 1, cache_key],
                )?;
                Ok(Some(data))
            })
            .await;

        match result {
            Ok(Some(data)) => match serde_json::from_str(&data) {
                Ok(value) => {
                    self.bump(|m| m.hits += 1);
                    Some(value)
                }
                Err(err) => {
                    error!(%err, "cache entry held unparseable JSON");
                    self.bump(|m| m.errors += 1);
                    None
                }
            },
            Ok(None) => {
                self.bump(|m| m.misses += 1);
                None
            }
            Err(err) => {
                error!(%err, "cache get error");
                self.bump(|m| m.errors += 1);
                None
            }
        }
    }

    /// Store a result. Returns `true` when the entry was written.
    pub async fn set(
        &self,
        content: &str,
        schema_key: &str,
        model_id: &str,
        structured: &Value,
        processing_time: f64,
    ) -> bool {
        if !self.config.enabled {
            return false;
        }
        let data = structured.to_string();
        if self.config.max_entry_size_bytes > 0
            && data.len() > self.config.max_entry_size_bytes
        {
            warn!(
                size = data.len(),
                limit = self.config.max_entry_size_bytes,
                "cache entry too large, skipping cache"
            );
            return false;
        }

        let cache_key = self.cache_key(content, schema_key, model_id);
        let content_hash = compute_hash(content, self.config.hash_algorithm);
        let content_size = content.len() as i64;
        let schema_key = schema_key.to_string();
        let model_id = model_id.to_string();
        let now = Utc::now();
        let ttl_hours = if self.config.ttl_hours > 0.0 {
            self.config.ttl_hours
        } else {
            INDEFINITE_TTL_HOURS
        };
        let expires_at = now + chrono::Duration::seconds((ttl_hours * 3600.0) as i64);
        let max_entries = self.config.max_entries;

        let result = self
            .with_connection(move |conn| {
                conn.execute(
                    "INSERT OR REPLACE INTO result_cache
                     (cache_key, content_hash, schema_key, model_id, structured_data,
                      created_at, expires_at, hit_count, content_size, processing_time)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 0, ?8, ?9)",
                    params![
                        cache_key,
                        content_hash,
                        schema_key,
                        model_id,
                        data,
                        now.to_rfc3339(),
                        expires_at.to_rfc3339(),
                        content_size,
                        processing_time,
                    ],
                )?;

                // Evict oldest rows past the entry ceiling.
                let count: i64 = conn.query_row(
                    "SELECT COUNT(*) FROM result_cache",
                    [],
                    |row| row.get(0),
                )?;
                let excess = count - max_entries as i64;
                if excess > 0 {
                    conn.execute(
                        "DELETE FROM result_cache WHERE cache_key IN (
                             SELECT cache_key FROM result_cache
                             ORDER BY created_at ASC LIMIT ?1
                         )",
                        params![excess],
                    )?;
                    info!(removed = excess, "evicted oldest cache entries");
                }
                Ok(())
            })
            .await;

        match result {
            Ok(()) => {
                self.bump(|m| m.sets += 1);
                true
            }
            Err(err) => {
                error!(%err, "cache set error");
                self.bump(|m| m.errors += 1);
                false
            }
        }
    }

    /// Remove expired entries. Returns how many were deleted.
    pub async fn cleanup_expired(&self) -> Result<usize> {
        if !self.config.enabled {
            return Ok(0);
        }
        let now = Utc::now().to_rfc3339();
        self.with_connection(move |conn| {
            let removed = conn.execute(
                "DELETE FROM result_cache WHERE expires_at < ?1",
                params![now],
            )?;
            Ok(removed)
        })
        .await
    }

    /// Session counters.
    pub fn metrics(&self) -> CacheMetrics {
        self.metrics.lock().expect("cache metrics lock poisoned").clone()
    }

    /// Database-level statistics, for operational queries.
    pub async fn stats(&self) -> Result<Value> {
        if !self.config.enabled {
            return Ok(json!({ "enabled": false }));
        }
        let now = Utc::now().to_rfc3339();
        let (total, expired, total_hits) = self
            .with_connection(move |conn| {
                let total: i64 =
                    conn.query_row("SELECT COUNT(*) FROM result_cache", [], |row| {
                        row.get(0)
                    })?;
                let expired: i64 = conn.query_row(
                    "SELECT COUNT(*) FROM result_cache WHERE expires_at < ?1",
                    params![now],
                    |row| row.get(0),
                )?;
                let total_hits: i64 = conn.query_row(
                    "SELECT COALESCE(SUM(hit_count), 0) FROM result_cache",
                    [],
                    |row| row.get(0),
                )?;
                Ok((total, expired, total_hits))
            })
            .await?;
        Ok(json!({
            "enabled": true,
            "total_entries": total,
            "expired_entries": expired,
            "active_entries": total - expired,
            "total_database_hits": total_hits,
            "session_metrics": self.metrics(),
        }))
    }

    fn bump(&self, update: impl FnOnce(&mut CacheMetrics)) {
        let mut metrics = self.metrics.lock().expect("cache metrics lock poisoned");
        update(&mut metrics);
    }

    /// Compose the cache key from the content hash and model configuration,
    /// so identical content analyzed with a different schema or model never
    /// collides.
    fn cache_key(&self, content: &str, schema_key: &str, model_id: &str) -> String {
        let content_hash = compute_hash(content, self.config.hash_algorithm);
        let key_data = format!("{content_hash}:{schema_key}:{model_id}");
        hex_digest(Sha256::digest(key_data.as_bytes()).as_slice())
    }

    /// Run a closure against a fresh connection on the blocking pool.
    async fn with_connection<T, F>(&self, work: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> Result<T> + Send + 'static,
    {
        let path = self.db_path.clone();
        tokio::task::spawn_blocking(move || {
            let conn = open_connection(&path)?;
            work(&conn)
        })
        .await
        .context("cache task failed")?
    }
}

/// Open the cache database with the pragmas we run everywhere: WAL for
/// concurrent readers, NORMAL sync as the WAL-appropriate balance.
fn open_connection(path: &Path) -> Result<Connection> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {parent:?}"))?;
    }
    let conn = Connection::open(path)
        .with_context(|| format!("failed to open cache db at {path:?}"))?;
    conn.busy_timeout(Duration::from_secs(30))?;
    let _: String = conn.query_row("PRAGMA journal_mode=WAL", [], |row| row.get(0))?;
    conn.execute_batch("PRAGMA synchronous=NORMAL; PRAGMA temp_store=MEMORY;")?;
    // The table may not exist yet if `start` hasn't run (tests, one-shot
    // tools); creating it here keeps every entry point safe.
    conn.execute_batch(SCHEMA)?;
    Ok(conn)
}

/// Content hash with the configured algorithm.
pub fn compute_hash(content: &str, algorithm: HashAlgorithm) -> String {
    match algorithm {
        HashAlgorithm::Sha256 => hex_digest(Sha256::digest(content.as_bytes()).as_slice()),
        HashAlgorithm::Sha1 => hex_digest(Sha1::digest(content.as_bytes()).as_slice()),
        HashAlgorithm::Md5 => format!("{:x}", md5::compute(content.as_bytes())),
    }
}

fn hex_digest(bytes: &[u8]) -> String {
    use std::fmt::Write as _;
    let mut out = String::with_capacity(bytes.len() * 2);
    for byte in bytes {
        let _ = write!(out, "{byte:02x}");
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cache_at(dir: &Path, config: ResultCacheConfig) -> Arc<ResultCache> {
        Arc::new(ResultCache::new(config, dir.join("cache.db")))
    }

    fn default_config() -> ResultCacheConfig {
        ResultCacheConfig::default()
    }

    #[test]
    fn hashes_differ_by_algorithm() {
        let sha256 = compute_hash("content", HashAlgorithm::Sha256);
        let sha1 = compute_hash("content", HashAlgorithm::Sha1);
        let md5 = compute_hash("content", HashAlgorithm::Md5);
        assert_eq!(sha256.len(), 64);
        assert_eq!(sha1.len(), 40);
        assert_eq!(md5.len(), 32);
    }

    #[tokio::test]
    async fn set_then_get_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let cache = cache_at(dir.path(), default_config());
        let value = json!({"vendor": "Acme", "amount": 100.0});

        assert!(cache.get("content", "invoice", "gpt-4o").await.is_none());
        assert!(cache.set("content", "invoice", "gpt-4o", &value, 1.5).await);
        assert_eq!(cache.get("content", "invoice", "gpt-4o").await, Some(value));

        let metrics = cache.metrics();
        assert_eq!(metrics.hits, 1);
        assert_eq!(metrics.misses, 1);
        assert_eq!(metrics.sets, 1);
    }

    #[tokio::test]
    async fn keys_are_fingerprint_scoped() {
        let dir = tempfile::tempdir().unwrap();
        let cache = cache_at(dir.path(), default_config());
        let value = json!({"a": 1});
        cache.set("content", "invoice", "gpt-4o", &value, 0.0).await;

        assert!(cache.get("content", "invoices", "gpt-4o").await.is_none());
        assert!(cache.get("content", "invoice", "gpt-4o-mini").await.is_none());
        assert!(cache.get("other content", "invoice", "gpt-4o").await.is_none());
        assert!(cache.get("content", "invoice", "gpt-4o").await.is_some());
    }

    /// Rewrite every entry's expiry to the past.
    fn force_expire_all(dir: &Path) {
        let conn = Connection::open(dir.join("cache.db")).unwrap();
        let past = (Utc::now() - chrono::Duration::hours(1)).to_rfc3339();
        conn.execute("UPDATE result_cache SET expires_at = ?1", params![past])
            .unwrap();
    }

    #[tokio::test]
    async fn expired_entries_miss_and_are_dropped() {
        let dir = tempfile::tempdir().unwrap();
        let cache = cache_at(dir.path(), default_config());
        cache.set("content", "invoice", "m", &json!({}), 0.0).await;
        force_expire_all(dir.path());
        assert!(cache.get("content", "invoice", "m").await.is_none());
        // The lazy drop removed the row entirely.
        let stats = cache.stats().await.unwrap();
        assert_eq!(stats["total_entries"], 0);
    }

    #[tokio::test]
    async fn ttl_zero_means_effectively_indefinite() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = default_config();
        config.ttl_hours = 0.0;
        let cache = cache_at(dir.path(), config);
        cache.set("content", "invoice", "m", &json!({"x": 1}), 0.0).await;
        assert!(cache.get("content", "invoice", "m").await.is_some());
    }

    #[tokio::test]
    async fn oversized_entries_are_not_cached() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = default_config();
        config.max_entry_size_bytes = 16;
        let cache = cache_at(dir.path(), config);
        let big = json!({"blob": "x".repeat(64)});
        assert!(!cache.set("content", "invoice", "m", &big, 0.0).await);
        assert!(cache.get("content", "invoice", "m").await.is_none());
    }

    #[tokio::test]
    async fn eviction_keeps_newest_entries() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = default_config();
        config.max_entries = 3;
        let cache = cache_at(dir.path(), config);
        for i in 0..5 {
            cache
                .set(&format!("content {i}"), "invoice", "m", &json!({"i": i}), 0.0)
                .await;
            // Created-at ordering is second-resolution safe; space writes out.
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
        let stats = cache.stats().await.unwrap();
        assert_eq!(stats["total_entries"], 3);
        // The most recent entry survived.
        assert!(cache.get("content 4", "invoice", "m").await.is_some());
    }

    #[tokio::test]
    async fn disabled_cache_is_a_no_op() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = default_config();
        config.enabled = false;
        let cache = cache_at(dir.path(), config);
        assert!(!cache.set("c", "s", "m", &json!({}), 0.0).await);
        assert!(cache.get("c", "s", "m").await.is_none());
    }

    #[tokio::test]
    async fn cleanup_expired_removes_only_expired_rows() {
        let dir = tempfile::tempdir().unwrap();
        let cache = cache_at(dir.path(), default_config());
        cache.set("stale", "s", "m", &json!({}), 0.0).await;
        force_expire_all(dir.path());
        cache.set("fresh", "s", "m", &json!({}), 0.0).await;

        assert_eq!(cache.cleanup_expired().await.unwrap(), 1);
        assert!(cache.get("fresh", "s", "m").await.is_some());
        assert!(cache.get("stale", "s", "m").await.is_none());
    }
}
