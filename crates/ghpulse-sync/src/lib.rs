//! Weekly repository health collection: planning, a bounded worker pool and a single snapshot writer.

use std::collections::BTreeSet;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use ghpulse_activity::{first_response_at, BotFilter};
use ghpulse_adapters::{
    CachedUpstream, FixtureUpstream, GitHubRestUpstream, SearchQuery, StateFilter, Upstream,
    UpstreamCache, UpstreamError,
};
use ghpulse_core::{HealthSnapshot, ItemKind, ItemRef, Release, RepoIdentity, Week};
use ghpulse_storage::{
    DiskCache, HttpClientConfig, HttpFetcher, SnapshotStore, StoreError,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{mpsc, Mutex, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "ghpulse-sync";

/// Searches issued per health unit, independent of the sample size.
pub const SEARCHES_PER_UNIT: usize = 5;

#[derive(Debug, Clone)]
pub struct PulseConfig {
    pub db_path: PathBuf,
    pub cache_dir: PathBuf,
    /// Zero disables the on-disk response cache.
    pub cache_ttl: Duration,
    pub token: Option<String>,
    pub api_url: String,
    pub workers: usize,
    pub sample_size: usize,
    pub http_timeout_secs: u64,
    pub user_agent: String,
    pub bot_rules_path: Option<PathBuf>,
}

fn env_parse<T: FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.trim().parse().ok())
}

impl PulseConfig {
    pub fn from_env() -> Self {
        let data_dir = dirs::data_local_dir().unwrap_or_else(|| PathBuf::from("."));
        let cache_root = dirs::cache_dir().unwrap_or_else(|| PathBuf::from("."));
        Self {
            db_path: std::env::var("GHPULSE_DB_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|_| data_dir.join("ghpulse").join("pulse.sqlite3")),
            cache_dir: std::env::var("GHPULSE_CACHE_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| cache_root.join("ghpulse").join("responses")),
            cache_ttl: Duration::from_secs(env_parse("GHPULSE_CACHE_TTL_SECS").unwrap_or(86_400)),
            token: std::env::var("GITHUB_TOKEN").ok().filter(|t| !t.trim().is_empty()),
            api_url: std::env::var("GHPULSE_API_URL")
                .unwrap_or_else(|_| "https://api.github.com".to_string()),
            workers: env_parse("GHPULSE_WORKERS").unwrap_or(4).max(1),
            sample_size: env_parse("GHPULSE_SAMPLE_SIZE").unwrap_or(20).max(1),
            http_timeout_secs: env_parse("GHPULSE_HTTP_TIMEOUT_SECS").unwrap_or(20),
            user_agent: std::env::var("GHPULSE_USER_AGENT")
                .unwrap_or_else(|_| format!("ghpulse/{}", env!("CARGO_PKG_VERSION"))),
            bot_rules_path: std::env::var("GHPULSE_BOT_RULES")
                .map(PathBuf::from)
                .ok()
                .or_else(|| {
                    let default = PathBuf::from("rules/bots.yaml");
                    default.exists().then_some(default)
                }),
        }
    }

    pub fn http_config(&self) -> HttpClientConfig {
        HttpClientConfig {
            timeout: Duration::from_secs(self.http_timeout_secs),
            user_agent: Some(self.user_agent.clone()),
            token: self.token.clone(),
            per_scope_concurrency: self.workers,
            ..Default::default()
        }
    }

    /// Upstream for this run, wrapped in a fresh per-run cache. A fixture bundle replaces the network.
    /// With `refresh`, stored disk responses are not reused, only overwritten.
    pub fn build_upstream(&self, fixture: Option<&Path>, refresh: bool) -> Result<CachedUpstream> {
        let inner: Arc<dyn Upstream> = match fixture {
            Some(path) => {
                info!(path = %path.display(), "serving upstream from fixture bundle");
                Arc::new(FixtureUpstream::from_path(path)?)
            }
            None => {
                let http = HttpFetcher::new(self.http_config())?;
                let disk = (!self.cache_ttl.is_zero())
                    .then(|| DiskCache::new(self.cache_dir.clone(), self.cache_ttl));
                let rest = GitHubRestUpstream::new(http, self.api_url.clone(), disk);
                Arc::new(if refresh { rest.bypass_disk_reads() } else { rest })
            }
        };
        Ok(CachedUpstream::new(inner, Arc::new(UpstreamCache::new())))
    }

    pub async fn open_store(&self) -> Result<SnapshotStore> {
        SnapshotStore::open(&self.db_path)
            .await
            .with_context(|| format!("opening snapshot store {}", self.db_path.display()))
    }

    /// Built-in bot list, merged with the rules file (if any) and extra ignored logins.
    pub fn bot_filter(&self, ignored: &[String]) -> Result<BotFilter> {
        let mut filter = BotFilter::builtin();
        if let Some(path) = &self.bot_rules_path {
            let rules = load_bot_rules(path)?;
            filter = filter.with_suffixes(rules.suffixes).with_logins(rules.logins);
        }
        Ok(filter.with_logins(ignored))
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct BotRulesFile {
    pub version: u32,
    #[serde(default)]
    pub suffixes: Vec<String>,
    #[serde(default)]
    pub logins: Vec<String>,
}

pub fn load_bot_rules(path: &Path) -> Result<BotRulesFile> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("reading {}", path.display()))?;
    serde_yaml::from_str(&raw).with_context(|| format!("parsing {}", path.display()))
}

/// Metrics the health report can be restricted to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthMetric {
    OpenIssues,
    OpenPrs,
    NewIssues,
    NewPrs,
    Release,
    IssueResponse,
    PrResponse,
    PrCycle,
}

impl HealthMetric {
    pub const ALL: [HealthMetric; 8] = [
        Self::OpenIssues,
        Self::OpenPrs,
        Self::NewIssues,
        Self::NewPrs,
        Self::Release,
        Self::IssueResponse,
        Self::PrResponse,
        Self::PrCycle,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::OpenIssues => "open_issues",
            Self::OpenPrs => "open_prs",
            Self::NewIssues => "new_issues",
            Self::NewPrs => "new_prs",
            Self::Release => "release",
            Self::IssueResponse => "issue_response",
            Self::PrResponse => "pr_response",
            Self::PrCycle => "pr_cycle",
        }
    }

    pub fn header(&self) -> &'static str {
        match self {
            Self::OpenIssues => "Open issues",
            Self::OpenPrs => "Open PRs",
            Self::NewIssues => "New issues",
            Self::NewPrs => "New PRs",
            Self::Release => "Days since release",
            Self::IssueResponse => "Issue response (h)",
            Self::PrResponse => "PR response (h)",
            Self::PrCycle => "PR cycle (h)",
        }
    }

    /// Table cell for this metric; undefined values render as `-`.
    pub fn cell(&self, snapshot: &HealthSnapshot) -> String {
        fn hours(value: Option<f64>, sample: i64) -> String {
            match value {
                Some(v) => format!("{v:.1} (n={sample})"),
                None => "-".to_string(),
            }
        }
        match self {
            Self::OpenIssues => snapshot.open_issues.to_string(),
            Self::OpenPrs => snapshot.open_prs.to_string(),
            Self::NewIssues => snapshot.new_issues.to_string(),
            Self::NewPrs => snapshot.new_prs.to_string(),
            Self::Release => match (snapshot.days_since_release, &snapshot.last_release_tag) {
                (Some(days), Some(tag)) => format!("{days} ({tag})"),
                (Some(days), None) => days.to_string(),
                _ => "-".to_string(),
            },
            Self::IssueResponse => {
                hours(snapshot.avg_issue_response_hours, snapshot.issue_response_sample)
            }
            Self::PrResponse => hours(snapshot.avg_pr_response_hours, snapshot.pr_response_sample),
            Self::PrCycle => hours(snapshot.avg_pr_cycle_hours, snapshot.merged_pr_count),
        }
    }
}

impl fmt::Display for HealthMetric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for HealthMetric {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().to_ascii_lowercase().replace('-', "_");
        Self::ALL
            .into_iter()
            .find(|m| m.as_str() == wanted)
            .ok_or_else(|| {
                let known = Self::ALL.map(|m| m.as_str()).join(", ");
                format!("unknown metric `{s}` (expected one of: {known})")
            })
    }
}

#[derive(Debug, Error)]
pub enum CollectError {
    #[error("upstream rate limit exhausted: {0}")]
    RateLimited(String),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("upstream failure: {0}")]
    Upstream(UpstreamError),
    #[error("run {} aborted: {cause}", .summary.run_id)]
    Aborted {
        cause: Box<CollectError>,
        summary: Box<HealthRunSummary>,
    },
}

impl CollectError {
    /// Partial summary of an aborted run.
    pub fn summary(&self) -> Option<&HealthRunSummary> {
        match self {
            Self::Aborted { summary, .. } => Some(summary.as_ref()),
            _ => None,
        }
    }

    pub fn root_cause(&self) -> &CollectError {
        match self {
            Self::Aborted { cause, .. } => cause.root_cause(),
            other => other,
        }
    }
}

impl From<UpstreamError> for CollectError {
    fn from(err: UpstreamError) -> Self {
        match err {
            UpstreamError::RateLimited(message) => Self::RateLimited(message),
            other => Self::Upstream(other),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FailedUnit {
    pub repo: String,
    pub week: Week,
    pub kind: String,
    pub message: String,
}

impl FailedUnit {
    fn new(repo: &str, week: Week, err: &UpstreamError) -> Self {
        Self {
            repo: repo.to_string(),
            week,
            kind: err.kind().to_string(),
            message: err.to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthRunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub planned: usize,
    pub skipped_cached: usize,
    pub succeeded: usize,
    pub failed: Vec<FailedUnit>,
    /// Units never started because the run aborted.
    pub abandoned: usize,
    pub aborted: Option<String>,
    pub upstream_fetches: usize,
    pub upstream_cache_hits: usize,
}

/// One (repo, week) unit of work. The identity is resolved before dispatch.
#[derive(Debug, Clone, PartialEq)]
pub struct HealthTask {
    pub repo: String,
    pub identity: RepoIdentity,
    pub week: Week,
}

#[derive(Debug, Clone, Default)]
pub struct HealthPlan {
    pub tasks: Vec<HealthTask>,
    pub skipped: Vec<(String, Week)>,
    pub failed: Vec<FailedUnit>,
}

/// Upstream calls one pending unit implies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct UnitCallEstimate {
    pub searches: usize,
    /// Sampled issues and PRs; merged PRs add one detail fetch each on top.
    pub max_sample_details: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DryRunUnit {
    pub repo: String,
    pub week: Week,
    pub cached: bool,
    pub calls: Option<UnitCallEstimate>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct DryRunPlan {
    pub units: Vec<DryRunUnit>,
    /// Repos needing an identity lookup and a release listing.
    pub repo_lookups: usize,
}

impl DryRunPlan {
    pub fn pending(&self) -> usize {
        self.units.iter().filter(|u| !u.cached).count()
    }

    pub fn max_upstream_calls(&self) -> usize {
        self.repo_lookups * 2
            + self
                .units
                .iter()
                .filter_map(|u| u.calls)
                .map(|c| c.searches + c.max_sample_details)
                .sum::<usize>()
    }
}

#[derive(Debug, Clone, Copy)]
pub struct CollectOptions {
    pub workers: usize,
    pub sample_size: usize,
    pub refresh: bool,
}

impl Default for CollectOptions {
    fn default() -> Self {
        Self {
            workers: 4,
            sample_size: 20,
            refresh: false,
        }
    }
}

enum TaskOutcome {
    Collected(HealthTask, HealthSnapshot),
    Failed(HealthTask, UpstreamError),
    Abandoned,
}

/// Fans (repo, week) units out over a worker pool; one consumer applies every snapshot.
pub struct HealthCollector {
    upstream: Arc<dyn Upstream>,
    cache: Option<Arc<UpstreamCache>>,
    store: SnapshotStore,
    bots: Arc<BotFilter>,
    options: CollectOptions,
}

impl HealthCollector {
    pub fn new(
        upstream: Arc<dyn Upstream>,
        store: SnapshotStore,
        bots: BotFilter,
        options: CollectOptions,
    ) -> Self {
        Self {
            upstream,
            cache: None,
            store,
            bots: Arc::new(bots),
            options,
        }
    }

    /// Route through a cached upstream and report its hit counts in the summary.
    pub fn with_cached_upstream(
        upstream: CachedUpstream,
        store: SnapshotStore,
        bots: BotFilter,
        options: CollectOptions,
    ) -> Self {
        let cache = upstream.cache().clone();
        Self {
            cache: Some(cache),
            ..Self::new(Arc::new(upstream), store, bots, options)
        }
    }

    pub fn store(&self) -> &SnapshotStore {
        &self.store
    }

    /// Pending units for every requested repo and week. Repos whose weeks are all
    /// stored already cost no upstream call at all.
    pub async fn plan(&self, repos: &[String], weeks: &[Week]) -> Result<HealthPlan, CollectError> {
        let is_pending = |cached: &BTreeSet<DateTime<Utc>>, week: &Week| {
            self.options.refresh || !cached.contains(&week.start())
        };
        let mut plan = HealthPlan::default();

        let mut lookups = Vec::new();
        for repo in repos {
            let stored = self.store.find_repo_by_name(repo).await?;
            let cached = match &stored {
                Some(stored) => self.store.cached_weeks(stored.identity.external_id).await?,
                None => BTreeSet::new(),
            };
            if !weeks.iter().any(|w| is_pending(&cached, w)) {
                debug!(repo = %repo, "every requested week already stored");
                plan.skipped.extend(weeks.iter().map(|w| (repo.clone(), *w)));
                continue;
            }
            lookups.push((repo.clone(), stored.is_some(), cached));
        }

        let names = lookups.iter().map(|(repo, ..)| repo.clone()).collect::<Vec<_>>();
        let identities = self.lookup_identities(names).await;

        for ((repo, known, mut cached), looked_up) in lookups.into_iter().zip(identities) {
            let identity = match looked_up {
                Ok(identity) => identity,
                Err(err) if err.is_fatal() => return Err(err.into()),
                Err(err) => {
                    warn!(repo = %repo, kind = err.kind(), error = %err, "repository lookup failed");
                    plan.failed
                        .extend(weeks.iter().map(|w| FailedUnit::new(&repo, *w, &err)));
                    continue;
                }
            };
            if !known {
                // Possibly stored under a previous name.
                cached = self.store.cached_weeks(identity.external_id).await?;
            }

            for week in weeks {
                if is_pending(&cached, week) {
                    plan.tasks.push(HealthTask {
                        repo: repo.clone(),
                        identity: identity.clone(),
                        week: *week,
                    });
                } else {
                    plan.skipped.push((repo.clone(), *week));
                }
            }
        }
        Ok(plan)
    }

    /// Resolve identities on spawned tasks, at most `workers` at a time. Results keep the
    /// order of `repos`; a fatal failure cancels the lookups still outstanding.
    async fn lookup_identities(&self, repos: Vec<String>) -> Vec<Result<RepoIdentity, UpstreamError>> {
        let limit = Arc::new(Semaphore::new(self.options.workers.max(1)));
        let mut pending = JoinSet::new();
        for (index, repo) in repos.iter().cloned().enumerate() {
            let upstream = self.upstream.clone();
            let limit = limit.clone();
            pending.spawn(
                async move {
                    let _permit = limit.acquire_owned().await;
                    (index, upstream.repo_identity(&repo).await)
                }
                .instrument(info_span!("repo_lookup", index)),
            );
        }

        let mut results: Vec<Option<Result<RepoIdentity, UpstreamError>>> = vec![None; repos.len()];
        while let Some(joined) = pending.join_next().await {
            match joined {
                Ok((index, looked_up)) => {
                    if looked_up.as_ref().is_err_and(UpstreamError::is_fatal) {
                        pending.abort_all();
                    }
                    results[index] = Some(looked_up);
                }
                Err(err) if err.is_cancelled() => {}
                Err(err) => warn!(error = %err, "repository lookup task panicked"),
            }
        }

        results
            .into_iter()
            .zip(repos)
            .map(|(looked_up, repo)| {
                looked_up.unwrap_or_else(|| {
                    Err(UpstreamError::Transport(format!("lookup for {repo} did not complete")))
                })
            })
            .collect()
    }

    /// Plan from the store alone; never calls the upstream.
    pub async fn dry_run(&self, repos: &[String], weeks: &[Week]) -> Result<DryRunPlan, CollectError> {
        let estimate = UnitCallEstimate {
            searches: SEARCHES_PER_UNIT,
            max_sample_details: self.options.sample_size * 2,
        };
        let mut plan = DryRunPlan::default();
        for repo in repos {
            let cached = match self.store.find_repo_by_name(repo).await? {
                Some(stored) => self.store.cached_weeks(stored.identity.external_id).await?,
                None => Default::default(),
            };
            let mut any_pending = false;
            for week in weeks {
                let is_cached = !self.options.refresh && cached.contains(&week.start());
                any_pending |= !is_cached;
                plan.units.push(DryRunUnit {
                    repo: repo.clone(),
                    week: *week,
                    cached: is_cached,
                    calls: (!is_cached).then_some(estimate),
                });
            }
            plan.repo_lookups += usize::from(any_pending);
        }
        Ok(plan)
    }

    /// Collect every pending unit. Per-unit failures land in the summary; a rate limit,
    /// rejected credentials or a store failure abort the run.
    pub async fn run(
        &self,
        repos: &[String],
        weeks: &[Week],
        now: DateTime<Utc>,
    ) -> Result<HealthRunSummary, CollectError> {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        let plan = self.plan(repos, weeks).await?;
        info!(
            %run_id,
            pending = plan.tasks.len(),
            skipped = plan.skipped.len(),
            failed = plan.failed.len(),
            "health plan ready"
        );

        let mut summary = HealthRunSummary {
            run_id,
            started_at,
            finished_at: started_at,
            planned: plan.tasks.len() + plan.failed.len(),
            skipped_cached: plan.skipped.len(),
            succeeded: 0,
            failed: plan.failed,
            abandoned: 0,
            aborted: None,
            upstream_fetches: 0,
            upstream_cache_hits: 0,
        };
        let workers = self.options.workers.max(1);
        let abort = Arc::new(AtomicBool::new(false));

        let (task_tx, task_rx) = mpsc::channel::<HealthTask>(workers * 2);
        let (result_tx, mut result_rx) = mpsc::channel::<TaskOutcome>(workers * 2);
        let task_rx = Arc::new(Mutex::new(task_rx));

        let tasks = plan.tasks;
        let dispatcher = {
            let abort = abort.clone();
            tokio::spawn(async move {
                let total = tasks.len();
                let mut sent = 0usize;
                for task in tasks {
                    if abort.load(Ordering::SeqCst) || task_tx.send(task).await.is_err() {
                        break;
                    }
                    sent += 1;
                }
                total - sent
            })
        };

        let mut pool = JoinSet::new();
        for worker_id in 0..workers {
            let task_rx = task_rx.clone();
            let result_tx = result_tx.clone();
            let abort = abort.clone();
            let upstream = self.upstream.clone();
            let bots = self.bots.clone();
            let sample_size = self.options.sample_size;
            pool.spawn(async move {
                loop {
                    let next = { task_rx.lock().await.recv().await };
                    let Some(task) = next else { break };
                    let outcome = if abort.load(Ordering::SeqCst) {
                        TaskOutcome::Abandoned
                    } else {
                        let span = info_span!("health_task", worker_id, repo = %task.repo, week = %task.week);
                        let collected = collect_unit(upstream.as_ref(), &bots, sample_size, &task, now)
                            .instrument(span)
                            .await;
                        match collected {
                            Ok(snapshot) => TaskOutcome::Collected(task, snapshot),
                            Err(err) => {
                                if err.is_fatal() {
                                    abort.store(true, Ordering::SeqCst);
                                }
                                TaskOutcome::Failed(task, err)
                            }
                        }
                    };
                    if result_tx.send(outcome).await.is_err() {
                        break;
                    }
                }
            });
        }
        drop(result_tx);

        let mut fatal: Option<CollectError> = None;
        let mut store_failed = false;
        while let Some(outcome) = result_rx.recv().await {
            match outcome {
                TaskOutcome::Collected(task, snapshot) => {
                    if store_failed {
                        summary.abandoned += 1;
                        continue;
                    }
                    match self.store.apply_snapshot(&task.identity, &snapshot).await {
                        Ok(resolved) => {
                            debug!(repo = %task.repo, week = %task.week, change = ?resolved.change, "snapshot stored");
                            summary.succeeded += 1;
                        }
                        Err(err) => {
                            warn!(repo = %task.repo, week = %task.week, error = %err, "snapshot write failed; aborting run");
                            abort.store(true, Ordering::SeqCst);
                            store_failed = true;
                            if fatal.is_none() {
                                fatal = Some(CollectError::Store(err));
                            }
                            summary.abandoned += 1;
                        }
                    }
                }
                TaskOutcome::Failed(task, err) => {
                    warn!(repo = %task.repo, week = %task.week, kind = err.kind(), error = %err, "health unit failed");
                    if err.is_fatal() && fatal.is_none() {
                        fatal = Some(err.clone().into());
                    }
                    summary.failed.push(FailedUnit::new(&task.repo, task.week, &err));
                }
                TaskOutcome::Abandoned => summary.abandoned += 1,
            }
        }

        while let Some(joined) = pool.join_next().await {
            if let Err(err) = joined {
                warn!(error = %err, "health worker panicked");
            }
        }
        match dispatcher.await {
            Ok(unsent) => summary.abandoned += unsent,
            Err(err) => warn!(error = %err, "health dispatcher panicked"),
        }

        if let Some(cache) = &self.cache {
            let stats = cache.stats();
            summary.upstream_fetches = stats.fetches;
            summary.upstream_cache_hits = stats.hits;
        }
        summary.finished_at = Utc::now();

        info!(
            %run_id,
            planned = summary.planned,
            skipped_cached = summary.skipped_cached,
            succeeded = summary.succeeded,
            failed = summary.failed.len(),
            abandoned = summary.abandoned,
            "health run finished"
        );

        match fatal {
            Some(cause) => {
                summary.aborted = Some(cause.to_string());
                Err(CollectError::Aborted {
                    cause: Box::new(cause),
                    summary: Box::new(summary),
                })
            }
            None => Ok(summary),
        }
    }
}

fn hours_between(from: DateTime<Utc>, to: DateTime<Utc>) -> f64 {
    (to - from).num_seconds() as f64 / 3600.0
}

fn mean(values: &[f64]) -> Option<f64> {
    (!values.is_empty()).then(|| values.iter().sum::<f64>() / values.len() as f64)
}

/// Newest non-draft release published on or before `at`.
pub fn latest_release_before<'a>(releases: &'a [Release], at: DateTime<Utc>) -> Option<(&'a Release, DateTime<Utc>)> {
    releases
        .iter()
        .filter(|r| !r.draft)
        .filter_map(|r| r.published_at.filter(|p| *p <= at).map(|p| (r, p)))
        .max_by(|a, b| a.1.cmp(&b.1).then_with(|| a.0.tag.cmp(&b.0.tag)))
}

/// Average first-response hours over a sample; items with no qualifying response are skipped.
async fn response_hours(
    upstream: &dyn Upstream,
    bots: &BotFilter,
    sample: &[ItemRef],
) -> Result<(Option<f64>, i64), UpstreamError> {
    let mut values = Vec::new();
    for item in sample {
        let detail = upstream.fetch_detail(item).await?;
        if let Some(at) = first_response_at(&detail, bots) {
            values.push(hours_between(detail.item.created_at, at));
        }
    }
    Ok((mean(&values), values.len() as i64))
}

/// Compute one week's health snapshot for one repository.
pub async fn collect_unit(
    upstream: &dyn Upstream,
    bots: &BotFilter,
    sample_size: usize,
    task: &HealthTask,
    now: DateTime<Utc>,
) -> Result<HealthSnapshot, UpstreamError> {
    let repo = task.repo.as_str();
    let week = task.week;
    let window = week.window();
    let sample_limit = u32::try_from(sample_size).unwrap_or(u32::MAX);

    let open_issues = upstream
        .search(
            &SearchQuery::repo(repo)
                .kind(ItemKind::Issue)
                .state(StateFilter::Open)
                .created_on_or_before(week.end())
                .limit(1),
        )
        .await?;
    let open_prs = upstream
        .search(
            &SearchQuery::repo(repo)
                .kind(ItemKind::PullRequest)
                .state(StateFilter::Open)
                .created_on_or_before(week.end())
                .limit(1),
        )
        .await?;
    let new_issues = upstream
        .search(
            &SearchQuery::repo(repo)
                .kind(ItemKind::Issue)
                .created_in(window)
                .limit(sample_limit),
        )
        .await?;
    let new_prs = upstream
        .search(
            &SearchQuery::repo(repo)
                .kind(ItemKind::PullRequest)
                .created_in(window)
                .limit(sample_limit),
        )
        .await?;
    let merged = upstream
        .search(
            &SearchQuery::repo(repo)
                .kind(ItemKind::PullRequest)
                .state(StateFilter::Merged)
                .merged_in(window),
        )
        .await?;

    let releases = upstream.list_releases(repo).await?;
    let latest = latest_release_before(&releases, week.end());

    let (avg_issue_response_hours, issue_response_sample) =
        response_hours(upstream, bots, &sample_of(&new_issues.items, sample_size)).await?;
    let (avg_pr_response_hours, pr_response_sample) =
        response_hours(upstream, bots, &sample_of(&new_prs.items, sample_size)).await?;

    let mut cycles = Vec::new();
    for item in &merged.items {
        let detail = upstream.fetch_detail(item).await?;
        // Closed-without-merge PRs never count.
        match detail.merged_at {
            Some(merged_at) if window.contains(merged_at) => {
                cycles.push(hours_between(detail.item.created_at, merged_at));
            }
            _ => debug!(url = %item.url, "skipping PR not merged inside the week"),
        }
    }

    Ok(HealthSnapshot {
        repo_external_id: task.identity.external_id,
        week_start: week.start(),
        week_end: week.end(),
        open_issues: open_issues.total_count as i64,
        open_prs: open_prs.total_count as i64,
        new_issues: new_issues.total_count as i64,
        new_prs: new_prs.total_count as i64,
        days_since_release: latest.map(|(_, at)| (week.end() - at).num_days()),
        last_release_tag: latest.map(|(release, _)| release.tag.clone()),
        avg_issue_response_hours,
        issue_response_sample,
        avg_pr_response_hours,
        pr_response_sample,
        avg_pr_cycle_hours: mean(&cycles),
        merged_pr_count: cycles.len() as i64,
        collected_at: now,
    })
}

/// The `size` most recently created items, newest first.
fn sample_of(items: &[ItemRef], size: usize) -> Vec<ItemRef> {
    let mut sorted = items.to_vec();
    sorted.sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| a.url.cmp(&b.url)));
    sorted.truncate(size);
    sorted
}
