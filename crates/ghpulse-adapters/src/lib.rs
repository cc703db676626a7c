//! Upstream collaborator contract, GitHub REST and fixture-backed implementations, and the cached wrapper.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use ghpulse_core::{
    Comment, DateWindow, ItemDetail, ItemKind, ItemRef, ItemState, RepoIdentity, Release, Review,
};
use ghpulse_storage::{CacheStats, DiskCache, FetchError, HttpFetcher, ResponseCache};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

pub const CRATE_NAME: &str = "ghpulse-adapters";

/// Largest page the search endpoint serves; results past it are truncated.
pub const MAX_PAGE_SIZE: u32 = 100;

/// Upstream failures. Clone so a cached failure can be handed to every waiting caller.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum UpstreamError {
    #[error("transport error: {0}")]
    Transport(String),
    #[error("upstream rejected credentials: {0}")]
    Unauthorized(String),
    #[error("rate limit exhausted: {0}")]
    RateLimited(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("malformed upstream payload: {0}")]
    Parse(String),
}

impl UpstreamError {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Transport(_) => "transport",
            Self::Unauthorized(_) => "auth",
            Self::RateLimited(_) => "rate_limit",
            Self::NotFound(_) => "not_found",
            Self::Parse(_) => "parse",
        }
    }

    /// Errors that must stop the whole run rather than a single unit.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::RateLimited(_) | Self::Unauthorized(_))
    }
}

impl From<FetchError> for UpstreamError {
    fn from(err: FetchError) -> Self {
        match err {
            FetchError::RateLimited { url } => Self::RateLimited(url),
            FetchError::HttpStatus { status: 404, url } => Self::NotFound(url),
            FetchError::HttpStatus { status: 401, url } => Self::Unauthorized(url),
            other => Self::Transport(other.to_string()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StateFilter {
    Open,
    Closed,
    Merged,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SearchScope {
    Any,
    Org(String),
    Repo(String),
}

/// Typed search request; rendered to the upstream query syntax for the REST client and
/// evaluated directly by the fixture upstream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchQuery {
    pub scope: SearchScope,
    pub kind: Option<ItemKind>,
    pub state: Option<StateFilter>,
    pub involves: Option<String>,
    pub created: Option<DateWindow>,
    pub created_before: Option<DateTime<Utc>>,
    pub merged: Option<DateWindow>,
    pub updated_since: Option<DateTime<Utc>>,
    pub limit: u32,
}

impl SearchQuery {
    pub fn new(scope: SearchScope) -> Self {
        Self {
            scope,
            kind: None,
            state: None,
            involves: None,
            created: None,
            created_before: None,
            merged: None,
            updated_since: None,
            limit: MAX_PAGE_SIZE,
        }
    }

    pub fn repo(repo: &str) -> Self {
        Self::new(SearchScope::Repo(repo.to_string()))
    }

    /// Everything `user` is involved in that was updated since the start of `window`.
    ///
    /// Only the lower bound is sent: `updated:` tracks the item's latest update, so an
    /// item touched after `window.until` still has to be returned and gated locally.
    pub fn involving(user: &str, window: DateWindow, scope: SearchScope) -> Self {
        Self {
            involves: Some(user.to_string()),
            updated_since: Some(window.since),
            ..Self::new(scope)
        }
    }

    pub fn kind(mut self, kind: ItemKind) -> Self {
        self.kind = Some(kind);
        self
    }

    pub fn state(mut self, state: StateFilter) -> Self {
        self.state = Some(state);
        self
    }

    pub fn created_in(mut self, window: DateWindow) -> Self {
        self.created = Some(window);
        self
    }

    pub fn created_on_or_before(mut self, at: DateTime<Utc>) -> Self {
        self.created_before = Some(at);
        self
    }

    pub fn merged_in(mut self, window: DateWindow) -> Self {
        self.merged = Some(window);
        self
    }

    pub fn limit(mut self, limit: u32) -> Self {
        self.limit = limit.clamp(1, MAX_PAGE_SIZE);
        self
    }

    /// Upstream query string, e.g. `repo:acme/widgets is:issue is:open created:<=2026-10-18T23:59:59Z`.
    pub fn to_query_string(&self) -> String {
        let mut terms = Vec::new();
        match &self.scope {
            SearchScope::Any => {}
            SearchScope::Org(org) => terms.push(format!("org:{org}")),
            SearchScope::Repo(repo) => terms.push(format!("repo:{repo}")),
        }
        match self.kind {
            Some(ItemKind::Issue) => terms.push("is:issue".to_string()),
            Some(ItemKind::PullRequest) => terms.push("is:pr".to_string()),
            None => {}
        }
        match self.state {
            Some(StateFilter::Open) => terms.push("is:open".to_string()),
            Some(StateFilter::Closed) => terms.push("is:closed".to_string()),
            Some(StateFilter::Merged) => terms.push("is:merged".to_string()),
            None => {}
        }
        if let Some(user) = &self.involves {
            terms.push(format!("involves:{user}"));
        }
        if let Some(window) = &self.created {
            terms.push(format!("created:{}", range(window)));
        }
        if let Some(at) = &self.created_before {
            terms.push(format!("created:<={}", stamp(*at)));
        }
        if let Some(window) = &self.merged {
            terms.push(format!("merged:{}", range(window)));
        }
        if let Some(at) = &self.updated_since {
            terms.push(format!("updated:>={}", stamp(*at)));
        }
        terms.join(" ")
    }

    /// Cache signature: the rendered query plus the page size.
    pub fn signature(&self) -> String {
        format!("search:{}#{}", self.to_query_string(), self.limit)
    }

    fn scope_key(&self) -> &str {
        match &self.scope {
            SearchScope::Any => "*",
            SearchScope::Org(org) => org,
            SearchScope::Repo(repo) => repo,
        }
    }
}

fn stamp(at: DateTime<Utc>) -> String {
    at.format("%Y-%m-%dT%H:%M:%SZ").to_string()
}

fn range(window: &DateWindow) -> String {
    format!("{}..{}", stamp(window.since), stamp(window.until))
}

/// One page of search results, newest-created first.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchPage {
    pub total_count: u64,
    pub items: Vec<ItemRef>,
    pub truncated: bool,
}

#[async_trait]
pub trait Upstream: Send + Sync {
    async fn search(&self, query: &SearchQuery) -> Result<SearchPage, UpstreamError>;

    async fn fetch_detail(&self, item: &ItemRef) -> Result<ItemDetail, UpstreamError>;

    async fn list_releases(&self, repo: &str) -> Result<Vec<Release>, UpstreamError>;

    async fn repo_identity(&self, repo: &str) -> Result<RepoIdentity, UpstreamError>;
}

/// Per-run response caches, one per upstream operation.
#[derive(Debug, Default)]
pub struct UpstreamCache {
    search: ResponseCache<SearchPage, UpstreamError>,
    detail: ResponseCache<ItemDetail, UpstreamError>,
    releases: ResponseCache<Vec<Release>, UpstreamError>,
    identity: ResponseCache<RepoIdentity, UpstreamError>,
}

impl UpstreamCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stats(&self) -> CacheStats {
        [
            self.search.stats(),
            self.detail.stats(),
            self.releases.stats(),
            self.identity.stats(),
        ]
        .into_iter()
        .fold(CacheStats::default(), |acc, s| CacheStats {
            fetches: acc.fetches + s.fetches,
            hits: acc.hits + s.hits,
        })
    }
}

/// Routes every upstream call through the run's [`UpstreamCache`].
#[derive(Clone)]
pub struct CachedUpstream {
    inner: Arc<dyn Upstream>,
    cache: Arc<UpstreamCache>,
}

impl CachedUpstream {
    pub fn new(inner: Arc<dyn Upstream>, cache: Arc<UpstreamCache>) -> Self {
        Self { inner, cache }
    }

    pub fn cache(&self) -> &Arc<UpstreamCache> {
        &self.cache
    }
}

#[async_trait]
impl Upstream for CachedUpstream {
    async fn search(&self, query: &SearchQuery) -> Result<SearchPage, UpstreamError> {
        self.cache
            .search
            .get_or_fetch(&query.signature(), || self.inner.search(query))
            .await
    }

    async fn fetch_detail(&self, item: &ItemRef) -> Result<ItemDetail, UpstreamError> {
        self.cache
            .detail
            .get_or_fetch(&format!("detail:{}", item.url), || self.inner.fetch_detail(item))
            .await
    }

    async fn list_releases(&self, repo: &str) -> Result<Vec<Release>, UpstreamError> {
        self.cache
            .releases
            .get_or_fetch(&format!("releases:{}", repo.to_ascii_lowercase()), || {
                self.inner.list_releases(repo)
            })
            .await
    }

    async fn repo_identity(&self, repo: &str) -> Result<RepoIdentity, UpstreamError> {
        self.cache
            .identity
            .get_or_fetch(&format!("repo:{}", repo.to_ascii_lowercase()), || {
                self.inner.repo_identity(repo)
            })
            .await
    }
}

#[derive(Debug, Deserialize)]
struct GhUser {
    login: String,
}

#[derive(Debug, Deserialize)]
struct GhPullMarker {
    #[serde(default)]
    merged_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
struct GhIssue {
    html_url: String,
    number: u64,
    title: String,
    state: String,
    user: Option<GhUser>,
    created_at: DateTime<Utc>,
    #[serde(default)]
    updated_at: Option<DateTime<Utc>>,
    #[serde(default)]
    closed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pull_request: Option<GhPullMarker>,
    #[serde(default)]
    assignees: Vec<GhUser>,
    #[serde(default)]
    body: Option<String>,
    repository_url: String,
}

#[derive(Debug, Deserialize)]
struct GhSearchResponse {
    total_count: u64,
    #[serde(default)]
    incomplete_results: bool,
    items: Vec<GhIssue>,
}

#[derive(Debug, Deserialize)]
struct GhComment {
    user: Option<GhUser>,
    created_at: DateTime<Utc>,
    #[serde(default)]
    body: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GhReview {
    user: Option<GhUser>,
    #[serde(default)]
    submitted_at: Option<DateTime<Utc>>,
    #[serde(default)]
    state: String,
}

#[derive(Debug, Deserialize)]
struct GhPull {
    #[serde(default)]
    merged_at: Option<DateTime<Utc>>,
    #[serde(default)]
    requested_reviewers: Vec<GhUser>,
}

#[derive(Debug, Deserialize)]
struct GhRelease {
    tag_name: String,
    #[serde(default)]
    published_at: Option<DateTime<Utc>>,
    #[serde(default)]
    draft: bool,
    #[serde(default)]
    prerelease: bool,
}

#[derive(Debug, Deserialize)]
struct GhRepo {
    id: i64,
    node_id: String,
    name: String,
    full_name: String,
    owner: GhUser,
}

fn decode<T: DeserializeOwned>(bytes: &[u8], what: &str) -> Result<T, UpstreamError> {
    serde_json::from_slice(bytes).map_err(|e| UpstreamError::Parse(format!("{what}: {e}")))
}

fn repo_from_api_url(repository_url: &str) -> String {
    repository_url
        .split_once("/repos/")
        .map(|(_, rest)| rest.trim_end_matches('/').to_string())
        .unwrap_or_else(|| repository_url.to_string())
}

impl From<GhIssue> for ItemRef {
    fn from(issue: GhIssue) -> Self {
        let merged = issue
            .pull_request
            .as_ref()
            .and_then(|pr| pr.merged_at)
            .is_some();
        Self {
            url: issue.html_url,
            repo: repo_from_api_url(&issue.repository_url),
            number: issue.number,
            title: issue.title,
            state: if merged {
                ItemState::Merged
            } else {
                ItemState::parse(&issue.state)
            },
            author: issue.user.map(|u| u.login),
            created_at: issue.created_at,
            updated_at: issue.updated_at,
            closed_at: issue.closed_at,
            is_pull_request: issue.pull_request.is_some(),
            assignees: issue.assignees.into_iter().map(|u| u.login).collect(),
            requested_reviewers: Vec::new(),
            body: issue.body,
        }
    }
}

pub fn parse_search_response(bytes: &[u8], limit: u32) -> Result<SearchPage, UpstreamError> {
    let response: GhSearchResponse = decode(bytes, "search response")?;
    let items = response
        .items
        .into_iter()
        .take(limit as usize)
        .map(ItemRef::from)
        .collect::<Vec<_>>();
    let truncated = response.incomplete_results || response.total_count > items.len() as u64;
    Ok(SearchPage {
        total_count: response.total_count,
        items,
        truncated,
    })
}

pub fn parse_comments(bytes: &[u8]) -> Result<Vec<Comment>, UpstreamError> {
    let comments: Vec<GhComment> = decode(bytes, "comments")?;
    Ok(comments
        .into_iter()
        .map(|c| Comment {
            author: c.user.map(|u| u.login),
            created_at: c.created_at,
            body: c.body,
        })
        .collect())
}

pub fn parse_reviews(bytes: &[u8]) -> Result<Vec<Review>, UpstreamError> {
    let reviews: Vec<GhReview> = decode(bytes, "reviews")?;
    Ok(reviews
        .into_iter()
        .map(|r| Review {
            author: r.user.map(|u| u.login),
            submitted_at: r.submitted_at,
            state: r.state,
        })
        .collect())
}

pub fn parse_releases(bytes: &[u8]) -> Result<Vec<Release>, UpstreamError> {
    let releases: Vec<GhRelease> = decode(bytes, "releases")?;
    Ok(releases
        .into_iter()
        .map(|r| Release {
            tag: r.tag_name,
            published_at: r.published_at,
            draft: r.draft,
            prerelease: r.prerelease,
        })
        .collect())
}

pub fn parse_repo(bytes: &[u8]) -> Result<RepoIdentity, UpstreamError> {
    let repo: GhRepo = decode(bytes, "repository")?;
    Ok(RepoIdentity {
        external_id: repo.id,
        node_id: repo.node_id,
        org: repo.owner.login,
        name: repo.name,
        full_name: repo.full_name,
    })
}

/// GitHub REST API client. Raw responses optionally persist in a [`DiskCache`].
pub struct GitHubRestUpstream {
    http: HttpFetcher,
    api_url: String,
    disk: Option<DiskCache>,
    read_disk: bool,
}

impl GitHubRestUpstream {
    pub fn new(http: HttpFetcher, api_url: impl Into<String>, disk: Option<DiskCache>) -> Self {
        Self {
            http,
            api_url: api_url.into().trim_end_matches('/').to_string(),
            disk,
            read_disk: true,
        }
    }

    /// Always go to the network; fresh responses still overwrite the disk entries.
    pub fn bypass_disk_reads(mut self) -> Self {
        self.read_disk = false;
        self
    }

    async fn get_bytes(&self, scope: &str, url: &str) -> Result<Vec<u8>, UpstreamError> {
        if let Some(disk) = self.disk.as_ref().filter(|_| self.read_disk) {
            match disk.load(url).await {
                Ok(Some(bytes)) => {
                    debug!(url, "disk cache hit");
                    return Ok(bytes);
                }
                Ok(None) => {}
                Err(err) => warn!(url, error = %err, "disk cache read failed"),
            }
        }

        let response = self.http.get(scope, url).await?;

        if let Some(disk) = &self.disk {
            if let Err(err) = disk.store(url, &response.body).await {
                warn!(url, error = %err, "disk cache write failed");
            }
        }
        Ok(response.body)
    }

    fn repo_url(&self, repo: &str, path: &str) -> String {
        format!("{}/repos/{repo}{path}", self.api_url)
    }
}

#[async_trait]
impl Upstream for GitHubRestUpstream {
    async fn search(&self, query: &SearchQuery) -> Result<SearchPage, UpstreamError> {
        let per_page = query.limit.to_string();
        let url = reqwest::Url::parse_with_params(
            &format!("{}/search/issues", self.api_url),
            &[
                ("q", query.to_query_string().as_str()),
                ("sort", "created"),
                ("order", "desc"),
                ("per_page", per_page.as_str()),
            ],
        )
        .map_err(|e| UpstreamError::Transport(format!("building search url: {e}")))?;
        let bytes = self.get_bytes(query.scope_key(), url.as_str()).await?;
        let page = parse_search_response(&bytes, query.limit)?;
        if page.truncated {
            warn!(
                query = %query.to_query_string(),
                total = page.total_count,
                returned = page.items.len(),
                "search results truncated to one page"
            );
        }
        Ok(page)
    }

    async fn fetch_detail(&self, item: &ItemRef) -> Result<ItemDetail, UpstreamError> {
        let repo = item.repo.as_str();
        let number = item.number;

        let issue_bytes = self
            .get_bytes(repo, &self.repo_url(repo, &format!("/issues/{number}")))
            .await?;
        let mut fresh: ItemRef = decode::<GhIssue>(&issue_bytes, "issue")?.into();

        let comment_bytes = self
            .get_bytes(
                repo,
                &self.repo_url(repo, &format!("/issues/{number}/comments?per_page=100")),
            )
            .await?;
        let comments = parse_comments(&comment_bytes)?;

        let mut merged_at = None;
        let mut reviews = Vec::new();
        if fresh.resolve_kind() == ItemKind::PullRequest {
            let pull_bytes = self
                .get_bytes(repo, &self.repo_url(repo, &format!("/pulls/{number}")))
                .await?;
            let pull: GhPull = decode(&pull_bytes, "pull request")?;
            merged_at = pull.merged_at;
            if merged_at.is_some() {
                fresh.state = ItemState::Merged;
            }
            fresh.requested_reviewers = pull.requested_reviewers.into_iter().map(|u| u.login).collect();

            let review_bytes = self
                .get_bytes(
                    repo,
                    &self.repo_url(repo, &format!("/pulls/{number}/reviews?per_page=100")),
                )
                .await?;
            reviews = parse_reviews(&review_bytes)?;
        }

        Ok(ItemDetail {
            item: fresh,
            merged_at,
            comments,
            reviews,
        })
    }

    async fn list_releases(&self, repo: &str) -> Result<Vec<Release>, UpstreamError> {
        let bytes = self
            .get_bytes(repo, &self.repo_url(repo, "/releases?per_page=100"))
            .await?;
        parse_releases(&bytes)
    }

    async fn repo_identity(&self, repo: &str) -> Result<RepoIdentity, UpstreamError> {
        let bytes = self.get_bytes(repo, &self.repo_url(repo, "")).await?;
        parse_repo(&bytes)
    }
}

/// Offline data set served by [`FixtureUpstream`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FixtureBundle {
    #[serde(default)]
    pub repos: Vec<RepoIdentity>,
    #[serde(default)]
    pub items: Vec<ItemDetail>,
    #[serde(default)]
    pub releases: BTreeMap<String, Vec<Release>>,
}

pub fn load_fixture_bundle(path: impl AsRef<Path>) -> Result<FixtureBundle> {
    let path = path.as_ref();
    let data = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&data).with_context(|| format!("parsing {}", path.display()))
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FixtureCalls {
    pub search: usize,
    pub detail: usize,
    pub releases: usize,
    pub identity: usize,
}

impl FixtureCalls {
    pub fn total(&self) -> usize {
        self.search + self.detail + self.releases + self.identity
    }
}

/// Upstream answered from a [`FixtureBundle`], counting every call it serves.
#[derive(Debug, Default)]
pub struct FixtureUpstream {
    bundle: FixtureBundle,
    latency: Duration,
    failures: BTreeMap<String, UpstreamError>,
    search_calls: AtomicUsize,
    detail_calls: AtomicUsize,
    release_calls: AtomicUsize,
    identity_calls: AtomicUsize,
}

impl FixtureUpstream {
    pub fn new(bundle: FixtureBundle) -> Self {
        Self {
            bundle,
            ..Self::default()
        }
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        Ok(Self::new(load_fixture_bundle(path)?))
    }

    /// Delay every call, so concurrent callers overlap.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Fail every call that touches `repo`.
    pub fn with_failure(mut self, repo: &str, error: UpstreamError) -> Self {
        self.failures.insert(repo.to_ascii_lowercase(), error);
        self
    }

    pub fn calls(&self) -> FixtureCalls {
        FixtureCalls {
            search: self.search_calls.load(Ordering::SeqCst),
            detail: self.detail_calls.load(Ordering::SeqCst),
            releases: self.release_calls.load(Ordering::SeqCst),
            identity: self.identity_calls.load(Ordering::SeqCst),
        }
    }

    async fn enter(&self, counter: &AtomicUsize, repo: Option<&str>) -> Result<(), UpstreamError> {
        counter.fetch_add(1, Ordering::SeqCst);
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        match repo.and_then(|r| self.failures.get(&r.to_ascii_lowercase())) {
            Some(err) => Err(err.clone()),
            None => Ok(()),
        }
    }

    fn matches(&self, detail: &ItemDetail, query: &SearchQuery) -> bool {
        let item = &detail.item;
        let in_scope = match &query.scope {
            SearchScope::Any => true,
            SearchScope::Org(org) => item
                .repo
                .split_once('/')
                .map(|(owner, _)| owner.eq_ignore_ascii_case(org))
                .unwrap_or(false),
            SearchScope::Repo(repo) => item.repo.eq_ignore_ascii_case(repo),
        };
        let kind_ok = query.kind.map_or(true, |k| item.resolve_kind() == k);
        let state_ok = match query.state {
            None => true,
            Some(StateFilter::Open) => item.state == ItemState::Open,
            Some(StateFilter::Closed) => item.state != ItemState::Open,
            Some(StateFilter::Merged) => detail.merged_at.is_some() || item.state == ItemState::Merged,
        };
        let created_ok = query.created.map_or(true, |w| w.contains(item.created_at))
            && query.created_before.map_or(true, |at| item.created_at <= at);
        let merged_ok = query
            .merged
            .map_or(true, |w| detail.merged_at.map_or(false, |at| w.contains(at)));
        let updated_ok = query
            .updated_since
            .map_or(true, |since| last_activity(detail) >= since);
        let involved_ok = query
            .involves
            .as_deref()
            .map_or(true, |user| is_involved(detail, user));
        in_scope && kind_ok && state_ok && created_ok && merged_ok && updated_ok && involved_ok
    }
}

fn last_activity(detail: &ItemDetail) -> DateTime<Utc> {
    let item = &detail.item;
    detail
        .comments
        .iter()
        .map(|c| c.created_at)
        .chain(detail.reviews.iter().filter_map(|r| r.submitted_at))
        .chain(item.updated_at)
        .chain(item.closed_at)
        .chain(detail.merged_at)
        .fold(item.created_at, |latest, at| latest.max(at))
}

fn is_involved(detail: &ItemDetail, user: &str) -> bool {
    let same = |login: &str| login.eq_ignore_ascii_case(user);
    let item = &detail.item;
    item.author.as_deref().is_some_and(same)
        || item.assignees.iter().any(|a| same(a.as_str()))
        || item.requested_reviewers.iter().any(|r| same(r.as_str()))
        || detail.comments.iter().any(|c| c.author.as_deref().is_some_and(same))
        || detail.reviews.iter().any(|r| r.author.as_deref().is_some_and(same))
        || item
            .body
            .as_deref()
            .is_some_and(|body| body.to_ascii_lowercase().contains(&format!("@{}", user.to_ascii_lowercase())))
}

#[async_trait]
impl Upstream for FixtureUpstream {
    async fn search(&self, query: &SearchQuery) -> Result<SearchPage, UpstreamError> {
        let repo = match &query.scope {
            SearchScope::Repo(repo) => Some(repo.as_str()),
            _ => None,
        };
        self.enter(&self.search_calls, repo).await?;

        let mut hits = self
            .bundle
            .items
            .iter()
            .filter(|detail| self.matches(detail, query))
            .map(|detail| detail.item.clone())
            .collect::<Vec<_>>();
        hits.sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| a.url.cmp(&b.url)));
        let total_count = hits.len() as u64;
        hits.truncate(query.limit as usize);
        Ok(SearchPage {
            total_count,
            truncated: total_count > hits.len() as u64,
            items: hits,
        })
    }

    async fn fetch_detail(&self, item: &ItemRef) -> Result<ItemDetail, UpstreamError> {
        self.enter(&self.detail_calls, Some(&item.repo)).await?;
        self.bundle
            .items
            .iter()
            .find(|detail| detail.item.url == item.url)
            .cloned()
            .ok_or_else(|| UpstreamError::NotFound(item.url.clone()))
    }

    async fn list_releases(&self, repo: &str) -> Result<Vec<Release>, UpstreamError> {
        self.enter(&self.release_calls, Some(repo)).await?;
        Ok(self
            .bundle
            .releases
            .iter()
            .find(|(name, _)| name.eq_ignore_ascii_case(repo))
            .map(|(_, releases)| releases.clone())
            .unwrap_or_default())
    }

    async fn repo_identity(&self, repo: &str) -> Result<RepoIdentity, UpstreamError> {
        self.enter(&self.identity_calls, Some(repo)).await?;
        self.bundle
            .repos
            .iter()
            .find(|r| r.full_name.eq_ignore_ascii_case(repo))
            .cloned()
            .ok_or_else(|| UpstreamError::NotFound(repo.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use ghpulse_storage::{BackoffPolicy, HttpClientConfig};

    fn ts(y: i32, m: u32, d: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, 12, 0, 0).single().unwrap()
    }

    fn detail(number: u64, created: DateTime<Utc>, pr: bool, merged_at: Option<DateTime<Utc>>) -> ItemDetail {
        let kind = if pr { "pull" } else { "issues" };
        ItemDetail {
            item: ItemRef {
                url: format!("https://github.com/acme/widgets/{kind}/{number}"),
                repo: "acme/widgets".into(),
                number,
                title: format!("item {number}"),
                state: if merged_at.is_some() { ItemState::Merged } else { ItemState::Open },
                author: Some("alice".into()),
                created_at: created,
                updated_at: None,
                closed_at: None,
                is_pull_request: pr,
                assignees: vec![],
                requested_reviewers: vec![],
                body: None,
            },
            merged_at,
            comments: vec![],
            reviews: vec![],
        }
    }

    #[test]
    fn renders_search_qualifiers() {
        let window = DateWindow::new(ts(2026, 10, 12), ts(2026, 10, 18));
        let query = SearchQuery::repo("acme/widgets")
            .kind(ItemKind::PullRequest)
            .state(StateFilter::Merged)
            .merged_in(window)
            .limit(500);
        assert_eq!(
            query.to_query_string(),
            "repo:acme/widgets is:pr is:merged merged:2026-10-12T12:00:00Z..2026-10-18T12:00:00Z"
        );
        assert_eq!(query.limit, MAX_PAGE_SIZE);
        assert!(query.signature().ends_with("#100"));
    }

    #[test]
    fn parses_search_payload_and_flags_truncation() {
        let body = br#"{
            "total_count": 250,
            "incomplete_results": false,
            "items": [{
                "html_url": "https://github.com/acme/widgets/pull/7",
                "number": 7,
                "title": "Add gear",
                "state": "closed",
                "user": {"login": "alice"},
                "created_at": "2026-10-13T09:00:00Z",
                "pull_request": {"merged_at": "2026-10-14T09:00:00Z"},
                "assignees": [{"login": "bob"}],
                "repository_url": "https://api.github.com/repos/acme/widgets"
            }]
        }"#;
        let page = parse_search_response(body, 100).unwrap();
        assert!(page.truncated);
        let item = &page.items[0];
        assert_eq!(item.repo, "acme/widgets");
        assert_eq!(item.state, ItemState::Merged);
        assert!(item.is_pull_request);
        assert_eq!(item.assignees, vec!["bob".to_string()]);
    }

    #[test]
    fn malformed_payload_is_a_parse_error() {
        let err = parse_releases(b"{\"nope\": true}").unwrap_err();
        assert_eq!(err.kind(), "parse");
        assert!(!err.is_fatal());
    }

    #[test]
    fn fetch_errors_map_onto_upstream_taxonomy() {
        let limited: UpstreamError = FetchError::RateLimited { url: "u".into() }.into();
        assert!(limited.is_fatal());
        let missing: UpstreamError = FetchError::HttpStatus { status: 404, url: "u".into() }.into();
        assert_eq!(missing, UpstreamError::NotFound("u".into()));
        let denied: UpstreamError = FetchError::HttpStatus { status: 401, url: "u".into() }.into();
        assert!(denied.is_fatal());
        let broken: UpstreamError = FetchError::HttpStatus { status: 502, url: "u".into() }.into();
        assert_eq!(broken.kind(), "transport");
    }

    #[test]
    fn involvement_search_sends_only_the_lower_update_bound() {
        let window = DateWindow::new(ts(2026, 10, 1), ts(2026, 10, 7));
        let query = SearchQuery::involving("alice", window, SearchScope::Org("acme".into()));
        assert_eq!(
            query.to_query_string(),
            "org:acme involves:alice updated:>=2026-10-01T12:00:00Z"
        );
    }

    #[tokio::test]
    async fn fixture_involvement_search_keeps_items_updated_later() {
        let mut touched = detail(4, ts(2026, 10, 2), false, None);
        touched.item.updated_at = Some(ts(2026, 10, 20));
        let stale = detail(5, ts(2026, 9, 1), false, None);
        let upstream = FixtureUpstream::new(FixtureBundle {
            items: vec![touched, stale],
            ..FixtureBundle::default()
        });
        let window = DateWindow::new(ts(2026, 10, 1), ts(2026, 10, 7));
        let page = upstream
            .search(&SearchQuery::involving("alice", window, SearchScope::Any))
            .await
            .unwrap();
        assert_eq!(page.items.iter().map(|i| i.number).collect::<Vec<_>>(), vec![4]);
    }

    fn offline_fetcher() -> HttpFetcher {
        HttpFetcher::new(HttpClientConfig {
            timeout: Duration::from_secs(2),
            backoff: BackoffPolicy {
                max_retries: 0,
                ..BackoffPolicy::default()
            },
            ..HttpClientConfig::default()
        })
        .unwrap()
    }

    #[tokio::test]
    async fn bypassing_disk_reads_goes_back_to_the_network() {
        let dir = tempfile::tempdir().unwrap();
        let api = "http://127.0.0.1:9";
        let disk = DiskCache::new(dir.path(), Duration::from_secs(3600));
        disk.store(
            &format!("{api}/repos/acme/widgets/releases?per_page=100"),
            br#"[{"tag_name":"v0.1-stale"}]"#,
        )
        .await
        .unwrap();

        let reusing = GitHubRestUpstream::new(
            offline_fetcher(),
            api,
            Some(DiskCache::new(dir.path(), Duration::from_secs(3600))),
        );
        let cached = reusing.list_releases("acme/widgets").await.unwrap();
        assert_eq!(cached[0].tag, "v0.1-stale");

        let refreshing = GitHubRestUpstream::new(offline_fetcher(), api, Some(disk)).bypass_disk_reads();
        let err = refreshing.list_releases("acme/widgets").await.unwrap_err();
        assert_eq!(err.kind(), "transport");
    }

    #[tokio::test]
    async fn fixture_search_orders_by_creation_and_caps() {
        let bundle = FixtureBundle {
            items: vec![
                detail(1, ts(2026, 10, 12), false, None),
                detail(2, ts(2026, 10, 14), false, None),
                detail(3, ts(2026, 10, 13), true, Some(ts(2026, 10, 15))),
            ],
            ..FixtureBundle::default()
        };
        let upstream = FixtureUpstream::new(bundle);
        let window = DateWindow::new(ts(2026, 10, 12), ts(2026, 10, 18));

        let issues = upstream
            .search(&SearchQuery::repo("acme/widgets").kind(ItemKind::Issue).created_in(window).limit(1))
            .await
            .unwrap();
        assert_eq!(issues.total_count, 2);
        assert!(issues.truncated);
        assert_eq!(issues.items[0].number, 2);

        let merged = upstream
            .search(&SearchQuery::repo("acme/widgets").kind(ItemKind::PullRequest).merged_in(window))
            .await
            .unwrap();
        assert_eq!(merged.items.len(), 1);
        assert_eq!(upstream.calls().search, 2);
    }

    #[tokio::test]
    async fn cached_upstream_deduplicates_concurrent_detail_fetches() {
        let bundle = FixtureBundle {
            items: vec![detail(9, ts(2026, 10, 12), true, None)],
            ..FixtureBundle::default()
        };
        let fixture = Arc::new(FixtureUpstream::new(bundle).with_latency(Duration::from_millis(20)));
        let cached = Arc::new(CachedUpstream::new(fixture.clone(), Arc::new(UpstreamCache::new())));
        let item = detail(9, ts(2026, 10, 12), true, None).item;

        let mut handles = Vec::new();
        for _ in 0..8 {
            let cached = cached.clone();
            let item = item.clone();
            handles.push(tokio::spawn(async move { cached.fetch_detail(&item).await }));
        }
        for handle in handles {
            assert_eq!(handle.await.unwrap().unwrap().item.number, 9);
        }
        assert_eq!(fixture.calls().detail, 1);
        assert_eq!(cached.cache().stats().fetches, 1);
    }

    #[tokio::test]
    async fn cached_failures_are_shared_not_retried() {
        let fixture = Arc::new(
            FixtureUpstream::new(FixtureBundle::default())
                .with_failure("acme/widgets", UpstreamError::Transport("connection reset".into())),
        );
        let cached = CachedUpstream::new(fixture.clone(), Arc::new(UpstreamCache::new()));

        let first = cached.list_releases("acme/widgets").await.unwrap_err();
        let second = cached.list_releases("ACME/widgets").await.unwrap_err();
        assert_eq!(first, second);
        assert_eq!(fixture.calls().releases, 1);
    }
}
