//! Response caching, HTTP fetch utilities and the snapshot store for ghpulse.

use std::collections::{BTreeSet, HashMap};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use chrono::{DateTime, Utc};
use ghpulse_core::{HealthSnapshot, RepoIdentity, Week};
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, AUTHORIZATION, RETRY_AFTER};
use reqwest::StatusCode;
use sha2::{Digest, Sha256};
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteConnection, SqliteJournalMode, SqlitePool, SqlitePoolOptions,
    SqliteRow, SqliteSynchronous,
};
use sqlx::Row;
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, OnceCell, Semaphore};
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "ghpulse-storage";

type Slot<V, E> = Arc<OnceCell<Result<V, E>>>;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub fetches: usize,
    pub hits: usize,
}

/// Singleflight response cache keyed by request signature.
///
/// The first caller for a signature runs the fetch; concurrent callers for the same
/// signature wait on it and receive a clone of the same result. Results, including
/// failures, are kept for the lifetime of the cache and never re-fetched.
#[derive(Debug)]
pub struct ResponseCache<V, E> {
    slots: Mutex<HashMap<String, Slot<V, E>>>,
    fetches: AtomicUsize,
    hits: AtomicUsize,
}

impl<V, E> Default for ResponseCache<V, E> {
    fn default() -> Self {
        Self {
            slots: Mutex::new(HashMap::new()),
            fetches: AtomicUsize::new(0),
            hits: AtomicUsize::new(0),
        }
    }
}

impl<V, E> ResponseCache<V, E>
where
    V: Clone,
    E: Clone,
{
    pub fn new() -> Self {
        Self::default()
    }

    async fn slot(&self, signature: &str) -> Slot<V, E> {
        let mut slots = self.slots.lock().await;
        slots
            .entry(signature.to_string())
            .or_insert_with(|| Arc::new(OnceCell::new()))
            .clone()
    }

    pub async fn get_or_fetch<F, Fut>(&self, signature: &str, fetch: F) -> Result<V, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V, E>>,
    {
        let slot = self.slot(signature).await;
        let mut executed = false;
        let result = slot
            .get_or_init(|| {
                executed = true;
                self.fetches.fetch_add(1, Ordering::SeqCst);
                fetch()
            })
            .await
            .clone();
        if !executed {
            self.hits.fetch_add(1, Ordering::SeqCst);
        }
        result
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            fetches: self.fetches.load(Ordering::SeqCst),
            hits: self.hits.load(Ordering::SeqCst),
        }
    }
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// On-disk response cache: one file per signature, replaced atomically.
#[derive(Debug, Clone)]
pub struct DiskCache {
    root: PathBuf,
    max_age: Duration,
}

impl DiskCache {
    pub fn new(root: impl Into<PathBuf>, max_age: Duration) -> Self {
        Self {
            root: root.into(),
            max_age,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn entry_path(&self, signature: &str) -> PathBuf {
        let hash = sha256_hex(signature.as_bytes());
        self.root.join(&hash[..2]).join(format!("{hash}.json"))
    }

    async fn ensure_dir(&self, dir: &Path) -> anyhow::Result<()> {
        fs::create_dir_all(dir)
            .await
            .with_context(|| format!("creating cache directory {}", dir.display()))?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            for path in [self.root.as_path(), dir] {
                fs::set_permissions(path, std::fs::Permissions::from_mode(0o700))
                    .await
                    .with_context(|| format!("restricting permissions on {}", path.display()))?;
            }
        }
        Ok(())
    }

    /// Cached bytes for `signature` if present and younger than the configured max age.
    pub async fn load(&self, signature: &str) -> anyhow::Result<Option<Vec<u8>>> {
        let path = self.entry_path(signature);
        let metadata = match fs::metadata(&path).await {
            Ok(metadata) => metadata,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => {
                return Err(err).with_context(|| format!("reading metadata {}", path.display()))
            }
        };
        let age = metadata
            .modified()
            .ok()
            .and_then(|modified| modified.elapsed().ok())
            .unwrap_or(Duration::MAX);
        if age > self.max_age {
            debug!(path = %path.display(), "disk cache entry expired");
            return Ok(None);
        }
        let bytes = fs::read(&path)
            .await
            .with_context(|| format!("reading cache entry {}", path.display()))?;
        Ok(Some(bytes))
    }

    /// Write via a temp file in the same directory, then rename over the entry.
    pub async fn store(&self, signature: &str, bytes: &[u8]) -> anyhow::Result<PathBuf> {
        let path = self.entry_path(signature);
        let parent = path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| self.root.clone());
        self.ensure_dir(&parent).await?;

        let temp_path = parent.join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));
        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await
            .with_context(|| format!("opening temp cache file {}", temp_path.display()))?;
        file.write_all(bytes)
            .await
            .with_context(|| format!("writing temp cache file {}", temp_path.display()))?;
        file.sync_all()
            .await
            .with_context(|| format!("syncing temp cache file {}", temp_path.display()))?;
        drop(file);

        if let Err(err) = fs::rename(&temp_path, &path).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(err).with_context(|| {
                format!(
                    "atomically renaming temp cache file {} -> {}",
                    temp_path.display(),
                    path.display()
                )
            });
        }
        Ok(path)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() {
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

/// Quota exhaustion is signalled by 429, or by 403 with no remaining requests. A 403
/// carrying `retry-after` is the secondary (abuse) limit and counts too.
pub fn is_rate_limited(status: StatusCode, headers: &HeaderMap) -> bool {
    if status == StatusCode::TOO_MANY_REQUESTS {
        return true;
    }
    if status != StatusCode::FORBIDDEN {
        return false;
    }
    let exhausted = headers
        .get("x-ratelimit-remaining")
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.trim() == "0");
    exhausted || headers.contains_key(RETRY_AFTER)
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
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub token: Option<String>,
    pub global_concurrency: usize,
    pub per_scope_concurrency: usize,
    pub backoff: BackoffPolicy,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
            token: None,
            global_concurrency: 16,
            per_scope_concurrency: 4,
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
    #[error("rate limit exhausted for {url}")]
    RateLimited { url: String },
    #[error("fetcher is shutting down")]
    Shutdown,
}

/// HTTP GET client with global and per-scope concurrency limits and retry on transient failures.
#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    global_limit: Arc<Semaphore>,
    per_scope_limit: usize,
    per_scope: Mutex<HashMap<String, Arc<Semaphore>>>,
    backoff: BackoffPolicy,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut headers = HeaderMap::new();
        headers.insert(ACCEPT, HeaderValue::from_static("application/vnd.github+json"));
        headers.insert("x-github-api-version", HeaderValue::from_static("2022-11-28"));
        if let Some(token) = &config.token {
            let mut value = HeaderValue::from_str(&format!("Bearer {token}"))
                .context("building authorization header")?;
            value.set_sensitive(true);
            headers.insert(AUTHORIZATION, value);
        }

        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout)
            .default_headers(headers);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;

        Ok(Self {
            client,
            global_limit: Arc::new(Semaphore::new(config.global_concurrency.max(1))),
            per_scope_limit: config.per_scope_concurrency.max(1),
            per_scope: Mutex::new(HashMap::new()),
            backoff: config.backoff,
        })
    }

    async fn per_scope_semaphore(&self, scope: &str) -> Arc<Semaphore> {
        let mut map = self.per_scope.lock().await;
        map.entry(scope.to_string())
            .or_insert_with(|| Arc::new(Semaphore::new(self.per_scope_limit)))
            .clone()
    }

    /// GET `url`, limiting concurrency globally and per `scope` (typically a repository).
    pub async fn get(&self, scope: &str, url: &str) -> Result<FetchedResponse, FetchError> {
        let _global = self
            .global_limit
            .acquire()
            .await
            .map_err(|_| FetchError::Shutdown)?;
        let per_scope = self.per_scope_semaphore(scope).await;
        let _scope = per_scope.acquire().await.map_err(|_| FetchError::Shutdown)?;

        self.get_with_retries(url)
            .instrument(info_span!("http_fetch", scope, url))
            .await
    }

    async fn get_with_retries(&self, url: &str) -> Result<FetchedResponse, FetchError> {
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

                    if is_rate_limited(status, resp.headers()) {
                        warn!(%status, url = %final_url, "upstream rate limit reached");
                        return Err(FetchError::RateLimited { url: final_url });
                    }

                    if classify_status(status) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
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

        Err(last_request_error
            .map(FetchError::Request)
            .unwrap_or(FetchError::Shutdown))
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration failed: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
    #[error("store io error at {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("snapshot week {start}..{end} is not a Monday-to-Sunday UTC week")]
    InvalidWeek {
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredRepo {
    pub id: i64,
    pub identity: RepoIdentity,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RepoChange {
    Inserted,
    Renamed { previous_full_name: String },
    Unchanged,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedRepo {
    pub id: i64,
    pub change: RepoChange,
}

/// Embedded SQLite store for repository identities and weekly health snapshots.
///
/// Writes are expected to come from a single writer; reads may come from anywhere.
#[derive(Debug, Clone)]
pub struct SnapshotStore {
    pool: SqlitePool,
}

const SNAPSHOT_COLUMNS: &str = "r.external_id, s.week_start, s.week_end, s.open_issues, s.open_prs, \
     s.new_issues, s.new_prs, s.days_since_release, s.last_release_tag, \
     s.avg_issue_response_hours, s.issue_response_sample, s.avg_pr_response_hours, \
     s.pr_response_sample, s.avg_pr_cycle_hours, s.merged_pr_count, s.collected_at";

impl SnapshotStore {
    /// Open (creating if needed) the database file, restricting its directory to the owner.
    pub async fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            let existed = parent.exists();
            std::fs::create_dir_all(parent).map_err(|source| StoreError::Io {
                path: parent.to_path_buf(),
                source,
            })?;
            // Only tighten directories we created ourselves.
            #[cfg(unix)]
            if !existed {
                use std::os::unix::fs::PermissionsExt;
                std::fs::set_permissions(parent, std::fs::Permissions::from_mode(0o700)).map_err(
                    |source| StoreError::Io {
                        path: parent.to_path_buf(),
                        source,
                    },
                )?;
            }
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Full)
            .foreign_keys(true)
            .busy_timeout(Duration::from_secs(5));
        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            if let Err(err) = std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))
            {
                warn!(path = %path.display(), %err, "could not restrict database file permissions");
            }
        }

        let store = Self { pool };
        store.migrate().await?;
        info!(path = %path.display(), "snapshot store ready");
        Ok(store)
    }

    /// Private in-memory database; a single pooled connection keeps it alive.
    pub async fn open_in_memory() -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?.foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;
        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }

    pub async fn schema_version(&self) -> Result<i64, StoreError> {
        let value: String =
            sqlx::query_scalar("SELECT value FROM schema_meta WHERE key = 'schema_version'")
                .fetch_one(&self.pool)
                .await?;
        Ok(value.parse().unwrap_or(0))
    }

    pub async fn find_repo(&self, external_id: i64) -> Result<Option<StoredRepo>, StoreError> {
        let row = sqlx::query(
            "SELECT id, external_id, node_id, org, name, full_name FROM repos WHERE external_id = ?",
        )
        .bind(external_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|row| stored_repo_from_row(&row)).transpose()?)
    }

    pub async fn find_repo_by_name(&self, full_name: &str) -> Result<Option<StoredRepo>, StoreError> {
        let row = sqlx::query(
            "SELECT id, external_id, node_id, org, name, full_name FROM repos \
             WHERE full_name = ? COLLATE NOCASE",
        )
        .bind(full_name)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|row| stored_repo_from_row(&row)).transpose()?)
    }

    /// Resolve the repo identity and replace the (repo, week) snapshot in one transaction.
    pub async fn apply_snapshot(
        &self,
        identity: &RepoIdentity,
        snapshot: &HealthSnapshot,
    ) -> Result<ResolvedRepo, StoreError> {
        validate_week(snapshot)?;
        let mut tx = self.pool.begin().await?;
        let resolved = resolve_repo_in(&mut tx, identity, Utc::now()).await?;
        upsert_snapshot_in(&mut tx, resolved.id, snapshot).await?;
        tx.commit().await?;
        Ok(resolved)
    }

    /// Week starts that already have a snapshot for the repo.
    pub async fn cached_weeks(&self, external_id: i64) -> Result<BTreeSet<DateTime<Utc>>, StoreError> {
        let rows = sqlx::query(
            "SELECT s.week_start FROM health_snapshots s JOIN repos r ON r.id = s.repo_id \
             WHERE r.external_id = ?",
        )
        .bind(external_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|row| row.try_get::<DateTime<Utc>, _>("week_start"))
            .collect::<Result<BTreeSet<_>, _>>()
            .map_err(StoreError::from)
    }

    pub async fn get_snapshot(
        &self,
        external_id: i64,
        week: Week,
    ) -> Result<Option<HealthSnapshot>, StoreError> {
        let sql = format!(
            "SELECT {SNAPSHOT_COLUMNS} FROM health_snapshots s JOIN repos r ON r.id = s.repo_id \
             WHERE r.external_id = ? AND s.week_start = ?"
        );
        let row = sqlx::query(&sql)
            .bind(external_id)
            .bind(week.start())
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|row| snapshot_from_row(&row)).transpose()?)
    }

    /// Stored snapshots for a repo, newest week first.
    pub async fn history(&self, external_id: i64, limit: i64) -> Result<Vec<HealthSnapshot>, StoreError> {
        let sql = format!(
            "SELECT {SNAPSHOT_COLUMNS} FROM health_snapshots s JOIN repos r ON r.id = s.repo_id \
             WHERE r.external_id = ? ORDER BY s.week_start DESC LIMIT ?"
        );
        let rows = sqlx::query(&sql)
            .bind(external_id)
            .bind(limit)
            .fetch_all(&self.pool)
            .await?;
        rows.iter()
            .map(snapshot_from_row)
            .collect::<Result<Vec<_>, _>>()
            .map_err(StoreError::from)
    }

    pub async fn repo_count(&self) -> Result<i64, StoreError> {
        Ok(sqlx::query_scalar("SELECT COUNT(*) FROM repos")
            .fetch_one(&self.pool)
            .await?)
    }

    pub async fn snapshot_count(&self) -> Result<i64, StoreError> {
        Ok(sqlx::query_scalar("SELECT COUNT(*) FROM health_snapshots")
            .fetch_one(&self.pool)
            .await?)
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

fn validate_week(snapshot: &HealthSnapshot) -> Result<(), StoreError> {
    match Week::from_start(snapshot.week_start) {
        Some(week) if week.end() == snapshot.week_end => Ok(()),
        _ => Err(StoreError::InvalidWeek {
            start: snapshot.week_start,
            end: snapshot.week_end,
        }),
    }
}

async fn resolve_repo_in(
    conn: &mut SqliteConnection,
    identity: &RepoIdentity,
    now: DateTime<Utc>,
) -> Result<ResolvedRepo, StoreError> {
    let existing = sqlx::query("SELECT id, full_name FROM repos WHERE external_id = ?")
        .bind(identity.external_id)
        .fetch_optional(&mut *conn)
        .await?;

    let Some(row) = existing else {
        let id: i64 = sqlx::query_scalar(
            "INSERT INTO repos (external_id, node_id, org, name, full_name, first_seen_at, updated_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?) RETURNING id",
        )
        .bind(identity.external_id)
        .bind(&identity.node_id)
        .bind(&identity.org)
        .bind(&identity.name)
        .bind(&identity.full_name)
        .bind(now)
        .bind(now)
        .fetch_one(&mut *conn)
        .await?;
        debug!(repo = %identity.full_name, id, "registered repository");
        return Ok(ResolvedRepo {
            id,
            change: RepoChange::Inserted,
        });
    };

    let id: i64 = row.try_get("id")?;
    let stored_name: String = row.try_get("full_name")?;
    if stored_name == identity.full_name {
        return Ok(ResolvedRepo {
            id,
            change: RepoChange::Unchanged,
        });
    }

    sqlx::query("UPDATE repos SET org = ?, name = ?, full_name = ?, updated_at = ? WHERE id = ?")
        .bind(&identity.org)
        .bind(&identity.name)
        .bind(&identity.full_name)
        .bind(now)
        .bind(id)
        .execute(&mut *conn)
        .await?;
    info!(from = %stored_name, to = %identity.full_name, "repository renamed");
    Ok(ResolvedRepo {
        id,
        change: RepoChange::Renamed {
            previous_full_name: stored_name,
        },
    })
}

async fn upsert_snapshot_in(
    conn: &mut SqliteConnection,
    repo_id: i64,
    snapshot: &HealthSnapshot,
) -> Result<(), StoreError> {
    sqlx::query(
        "INSERT INTO health_snapshots (
            repo_id, week_start, week_end, open_issues, open_prs, new_issues, new_prs,
            days_since_release, last_release_tag, avg_issue_response_hours, issue_response_sample,
            avg_pr_response_hours, pr_response_sample, avg_pr_cycle_hours, merged_pr_count, collected_at
        ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT (repo_id, week_start) DO UPDATE SET
            week_end = excluded.week_end,
            open_issues = excluded.open_issues,
            open_prs = excluded.open_prs,
            new_issues = excluded.new_issues,
            new_prs = excluded.new_prs,
            days_since_release = excluded.days_since_release,
            last_release_tag = excluded.last_release_tag,
            avg_issue_response_hours = excluded.avg_issue_response_hours,
            issue_response_sample = excluded.issue_response_sample,
            avg_pr_response_hours = excluded.avg_pr_response_hours,
            pr_response_sample = excluded.pr_response_sample,
            avg_pr_cycle_hours = excluded.avg_pr_cycle_hours,
            merged_pr_count = excluded.merged_pr_count,
            collected_at = excluded.collected_at",
    )
    .bind(repo_id)
    .bind(snapshot.week_start)
    .bind(snapshot.week_end)
    .bind(snapshot.open_issues)
    .bind(snapshot.open_prs)
    .bind(snapshot.new_issues)
    .bind(snapshot.new_prs)
    .bind(snapshot.days_since_release)
    .bind(&snapshot.last_release_tag)
    .bind(snapshot.avg_issue_response_hours)
    .bind(snapshot.issue_response_sample)
    .bind(snapshot.avg_pr_response_hours)
    .bind(snapshot.pr_response_sample)
    .bind(snapshot.avg_pr_cycle_hours)
    .bind(snapshot.merged_pr_count)
    .bind(snapshot.collected_at)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

fn stored_repo_from_row(row: &SqliteRow) -> Result<StoredRepo, sqlx::Error> {
    Ok(StoredRepo {
        id: row.try_get("id")?,
        identity: RepoIdentity {
            external_id: row.try_get("external_id")?,
            node_id: row.try_get("node_id")?,
            org: row.try_get("org")?,
            name: row.try_get("name")?,
            full_name: row.try_get("full_name")?,
        },
    })
}

fn snapshot_from_row(row: &SqliteRow) -> Result<HealthSnapshot, sqlx::Error> {
    Ok(HealthSnapshot {
        repo_external_id: row.try_get("external_id")?,
        week_start: row.try_get("week_start")?,
        week_end: row.try_get("week_end")?,
        open_issues: row.try_get("open_issues")?,
        open_prs: row.try_get("open_prs")?,
        new_issues: row.try_get("new_issues")?,
        new_prs: row.try_get("new_prs")?,
        days_since_release: row.try_get("days_since_release")?,
        last_release_tag: row.try_get("last_release_tag")?,
        avg_issue_response_hours: row.try_get("avg_issue_response_hours")?,
        issue_response_sample: row.try_get("issue_response_sample")?,
        avg_pr_response_hours: row.try_get("avg_pr_response_hours")?,
        pr_response_sample: row.try_get("pr_response_sample")?,
        avg_pr_cycle_hours: row.try_get("avg_pr_cycle_hours")?,
        merged_pr_count: row.try_get("merged_pr_count")?,
        collected_at: row.try_get("collected_at")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use tempfile::tempdir;

    fn ts(y: i32, m: u32, d: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, 0, 0, 0).single().unwrap()
    }

    fn identity(full_name: &str) -> RepoIdentity {
        let (org, name) = full_name.split_once('/').unwrap();
        RepoIdentity {
            external_id: 4242,
            node_id: "R_kgDOwidget".into(),
            org: org.into(),
            name: name.into(),
            full_name: full_name.into(),
        }
    }

    fn snapshot(week: Week) -> HealthSnapshot {
        HealthSnapshot {
            repo_external_id: 4242,
            week_start: week.start(),
            week_end: week.end(),
            open_issues: 12,
            open_prs: 3,
            new_issues: 4,
            new_prs: 2,
            days_since_release: None,
            last_release_tag: None,
            avg_issue_response_hours: Some(5.5),
            issue_response_sample: 4,
            avg_pr_response_hours: None,
            pr_response_sample: 0,
            avg_pr_cycle_hours: Some(26.0),
            merged_pr_count: 1,
            collected_at: ts(2026, 10, 19),
        }
    }

    #[tokio::test]
    async fn concurrent_requests_share_one_fetch() {
        let cache: Arc<ResponseCache<u32, String>> = Arc::new(ResponseCache::new());
        let calls = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..16 {
            let cache = cache.clone();
            let calls = calls.clone();
            handles.push(tokio::spawn(async move {
                cache
                    .get_or_fetch("repos/acme/widgets", || async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(20)).await;
                        Ok(7)
                    })
                    .await
            }));
        }
        for handle in handles {
            assert_eq!(handle.await.unwrap(), Ok(7));
        }

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(cache.stats(), CacheStats { fetches: 1, hits: 15 });
    }

    #[tokio::test]
    async fn failures_are_cached_and_not_retried() {
        let cache: ResponseCache<u32, String> = ResponseCache::new();
        let first = cache
            .get_or_fetch("search/q", || async { Err("boom".to_string()) })
            .await;
        let second = cache.get_or_fetch("search/q", || async { Ok(1) }).await;
        assert_eq!(first, Err("boom".to_string()));
        assert_eq!(second, Err("boom".to_string()));
        assert_eq!(cache.stats().fetches, 1);
    }

    #[tokio::test]
    async fn concurrent_waiters_all_see_the_same_failure() {
        let cache: Arc<ResponseCache<u32, String>> = Arc::new(ResponseCache::new());
        let calls = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let cache = cache.clone();
            let calls = calls.clone();
            handles.push(tokio::spawn(async move {
                cache
                    .get_or_fetch("repos/acme/widgets/releases", || async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(20)).await;
                        Err("secondary rate limit".to_string())
                    })
                    .await
            }));
        }
        for handle in handles {
            assert_eq!(handle.await.unwrap(), Err("secondary rate limit".to_string()));
        }

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(cache.stats(), CacheStats { fetches: 1, hits: 7 });
    }

    #[tokio::test]
    async fn distinct_signatures_fetch_independently() {
        let cache: ResponseCache<String, String> = ResponseCache::new();
        let a = cache.get_or_fetch("a", || async { Ok("A".to_string()) }).await;
        let b = cache.get_or_fetch("b", || async { Ok("B".to_string()) }).await;
        assert_eq!(a.unwrap(), "A");
        assert_eq!(b.unwrap(), "B");
        assert_eq!(cache.stats(), CacheStats { fetches: 2, hits: 0 });
    }

    #[test]
    fn hashing_is_stable() {
        assert_eq!(
            sha256_hex(b"hello world"),
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
    }

    #[tokio::test]
    async fn disk_cache_replaces_entries_atomically() {
        let dir = tempdir().expect("tempdir");
        let cache = DiskCache::new(dir.path().join("responses"), Duration::from_secs(60));

        assert!(cache.load("GET /repos/acme/widgets").await.unwrap().is_none());
        let path = cache.store("GET /repos/acme/widgets", b"{\"id\":1}").await.unwrap();
        cache.store("GET /repos/acme/widgets", b"{\"id\":2}").await.unwrap();

        assert_eq!(
            cache.load("GET /repos/acme/widgets").await.unwrap().as_deref(),
            Some(&b"{\"id\":2}"[..])
        );
        let leftovers = std::fs::read_dir(path.parent().unwrap())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .count();
        assert_eq!(leftovers, 0);

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(cache.root()).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o700);
        }
    }

    #[tokio::test]
    async fn expired_disk_entries_are_ignored() {
        let dir = tempdir().expect("tempdir");
        let cache = DiskCache::new(dir.path(), Duration::ZERO);
        cache.store("sig", b"payload").await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(cache.load("sig").await.unwrap().is_none());
    }

    #[test]
    fn backoff_logic_is_exponential_and_capped() {
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

    #[test]
    fn rate_limit_detection_reads_remaining_header() {
        let mut headers = HeaderMap::new();
        assert!(is_rate_limited(StatusCode::TOO_MANY_REQUESTS, &headers));
        assert!(!is_rate_limited(StatusCode::FORBIDDEN, &headers));
        headers.insert("x-ratelimit-remaining", HeaderValue::from_static("0"));
        assert!(is_rate_limited(StatusCode::FORBIDDEN, &headers));
        assert!(!is_rate_limited(StatusCode::NOT_FOUND, &headers));
    }

    #[tokio::test]
    async fn snapshot_round_trip_preserves_nulls() {
        let store = SnapshotStore::open_in_memory().await.unwrap();
        let week = Week::containing(ts(2026, 10, 5));
        let snap = snapshot(week);

        store.apply_snapshot(&identity("acme/widgets"), &snap).await.unwrap();
        let loaded = store.get_snapshot(4242, week).await.unwrap().unwrap();

        assert_eq!(loaded, snap);
        assert_eq!(loaded.days_since_release, None);
        assert_eq!(loaded.avg_pr_response_hours, None);
        assert_eq!(store.schema_version().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn upsert_replaces_row_for_same_week() {
        let store = SnapshotStore::open_in_memory().await.unwrap();
        let week = Week::containing(ts(2026, 10, 5));
        let mut snap = snapshot(week);
        store.apply_snapshot(&identity("acme/widgets"), &snap).await.unwrap();

        snap.open_issues = 99;
        snap.avg_issue_response_hours = None;
        snap.last_release_tag = Some("v1.2.0".into());
        store.apply_snapshot(&identity("acme/widgets"), &snap).await.unwrap();

        assert_eq!(store.snapshot_count().await.unwrap(), 1);
        let loaded = store.get_snapshot(4242, week).await.unwrap().unwrap();
        assert_eq!(loaded, snap);
    }

    #[tokio::test]
    async fn rename_keeps_identity_and_history() {
        let store = SnapshotStore::open_in_memory().await.unwrap();
        let old_week = Week::containing(ts(2026, 9, 21));
        let new_week = Week::containing(ts(2026, 10, 5));

        let first = store
            .apply_snapshot(&identity("acme/widget"), &snapshot(old_week))
            .await
            .unwrap();
        assert_eq!(first.change, RepoChange::Inserted);

        let second = store
            .apply_snapshot(&identity("acme/widgets"), &snapshot(new_week))
            .await
            .unwrap();
        assert_eq!(second.id, first.id);
        assert_eq!(
            second.change,
            RepoChange::Renamed {
                previous_full_name: "acme/widget".into()
            }
        );

        assert_eq!(store.repo_count().await.unwrap(), 1);
        let repo = store.find_repo_by_name("acme/widgets").await.unwrap().unwrap();
        assert_eq!(repo.identity.external_id, 4242);
        assert!(store.find_repo_by_name("acme/widget").await.unwrap().is_none());
        let weeks = store.cached_weeks(4242).await.unwrap();
        assert!(weeks.contains(&old_week.start()));
        assert!(weeks.contains(&new_week.start()));
        assert_eq!(store.history(4242, 10).await.unwrap().len(), 2);
    }

    #[test]
    fn secondary_rate_limit_is_detected_from_retry_after() {
        let mut headers = HeaderMap::new();
        headers.insert("x-ratelimit-remaining", HeaderValue::from_static("4812"));
        assert!(!is_rate_limited(StatusCode::FORBIDDEN, &headers));
        headers.insert(RETRY_AFTER, HeaderValue::from_static("60"));
        assert!(is_rate_limited(StatusCode::FORBIDDEN, &headers));
        assert!(!is_rate_limited(StatusCode::UNAUTHORIZED, &headers));
    }

    #[tokio::test]
    async fn rejects_snapshots_that_split_a_week() {
        let store = SnapshotStore::open_in_memory().await.unwrap();
        let mut snap = snapshot(Week::containing(ts(2026, 10, 5)));
        snap.week_start = ts(2026, 10, 6);
        let err = store
            .apply_snapshot(&identity("acme/widgets"), &snap)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::InvalidWeek { .. }));
        assert_eq!(store.snapshot_count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn file_backed_store_restricts_directory() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("state").join("pulse.sqlite3");
        let store = SnapshotStore::open(&path).await.unwrap();
        store
            .apply_snapshot(&identity("acme/widgets"), &snapshot(Week::containing(ts(2026, 10, 5))))
            .await
            .unwrap();
        assert!(store.find_repo(4242).await.unwrap().is_some());
        store.close().await;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(path.parent().unwrap()).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o700);
        }
    }
}
