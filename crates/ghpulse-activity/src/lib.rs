//! Interaction classification and per-user aggregation of issue/PR activity.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use ghpulse_adapters::{SearchQuery, SearchScope, Upstream, UpstreamError};
use ghpulse_core::{
    DateWindow, InteractionKind, InteractionRecord, Item, ItemDetail, ItemRef, UserStats,
};
use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

pub const CRATE_NAME: &str = "ghpulse-activity";

const BUILTIN_BOT_SUFFIXES: &[&str] = &["[bot]", "-bot", "_bot"];
const BUILTIN_BOT_LOGINS: &[&str] = &[
    "dependabot",
    "renovate",
    "github-actions",
    "codecov",
    "netlify",
    "vercel",
    "mergify",
    "stale",
    "sonarcloud",
    "allcontributors",
];

/// Decides whether an account is automation. Matching is case-insensitive.
#[derive(Debug, Clone, Default)]
pub struct BotFilter {
    suffixes: Vec<String>,
    logins: BTreeSet<String>,
}

impl BotFilter {
    pub fn new<S, L>(suffixes: S, logins: L) -> Self
    where
        S: IntoIterator,
        S::Item: AsRef<str>,
        L: IntoIterator,
        L::Item: AsRef<str>,
    {
        Self {
            suffixes: suffixes
                .into_iter()
                .map(|s| s.as_ref().to_ascii_lowercase())
                .collect(),
            logins: logins
                .into_iter()
                .map(|l| l.as_ref().to_ascii_lowercase())
                .collect(),
        }
    }

    pub fn builtin() -> Self {
        Self::new(BUILTIN_BOT_SUFFIXES.iter(), BUILTIN_BOT_LOGINS.iter())
    }

    /// Extra logins to treat as bots (known bots or a user-supplied ignore list).
    pub fn with_logins<L>(mut self, logins: L) -> Self
    where
        L: IntoIterator,
        L::Item: AsRef<str>,
    {
        self.logins
            .extend(logins.into_iter().map(|l| l.as_ref().to_ascii_lowercase()));
        self
    }

    pub fn with_suffixes<S>(mut self, suffixes: S) -> Self
    where
        S: IntoIterator,
        S::Item: AsRef<str>,
    {
        for suffix in suffixes {
            let suffix = suffix.as_ref().to_ascii_lowercase();
            if !self.suffixes.contains(&suffix) {
                self.suffixes.push(suffix);
            }
        }
        self
    }

    pub fn is_bot(&self, login: &str) -> bool {
        let login = login.to_ascii_lowercase();
        self.logins.contains(&login) || self.suffixes.iter().any(|s| login.ends_with(s.as_str()))
    }
}

fn same_login(a: &str, b: &str) -> bool {
    a.eq_ignore_ascii_case(b)
}

/// `@login` mentions in free text, lowercased. Email addresses are not mentions.
pub fn mentioned_logins(text: &str) -> BTreeSet<String> {
    let mut found = BTreeSet::new();
    let chars = text.char_indices().collect::<Vec<_>>();
    for (pos, &(idx, ch)) in chars.iter().enumerate() {
        if ch != '@' {
            continue;
        }
        let preceded_by_word = pos > 0 && {
            let prev = chars[pos - 1].1;
            prev.is_ascii_alphanumeric() || prev == '_' || prev == '.'
        };
        if preceded_by_word {
            continue;
        }
        let login = text[idx + 1..]
            .chars()
            .take_while(|c| c.is_ascii_alphanumeric() || *c == '-')
            .collect::<String>();
        let login = login.trim_end_matches('-');
        if !login.is_empty() {
            found.insert(login.to_ascii_lowercase());
        }
    }
    found
}

/// Interactions visible on the item itself: author (active) plus assignee, review request and mention.
pub fn basic_interactions(item: &ItemRef, user: &str) -> Vec<InteractionRecord> {
    let mut records = Vec::new();
    if item.author.as_deref().is_some_and(|a| same_login(a, user)) {
        records.push(InteractionRecord::active(
            &item.url,
            user,
            InteractionKind::Author,
            item.created_at,
        ));
    }
    if item.assignees.iter().any(|a| same_login(a, user)) {
        records.push(InteractionRecord::passive(&item.url, user, InteractionKind::Assignee));
    }
    if item.requested_reviewers.iter().any(|r| same_login(r, user)) {
        records.push(InteractionRecord::passive(
            &item.url,
            user,
            InteractionKind::ReviewRequested,
        ));
    }
    if item
        .body
        .as_deref()
        .is_some_and(|body| mentioned_logins(body).contains(&user.to_ascii_lowercase()))
    {
        records.push(InteractionRecord::passive(&item.url, user, InteractionKind::Mentioned));
    }
    records
}

/// Interactions that need the fetched comments and reviews. All of them are active.
pub fn enriched_interactions(detail: &ItemDetail, user: &str) -> Vec<InteractionRecord> {
    let url = &detail.item.url;
    let comments = detail
        .comments
        .iter()
        .filter(|c| c.author.as_deref().is_some_and(|a| same_login(a, user)))
        .map(|c| InteractionRecord::active(url, user, InteractionKind::Commenter, c.created_at));
    let reviews = detail
        .reviews
        .iter()
        .filter(|r| r.author.as_deref().is_some_and(|a| same_login(a, user)))
        .filter_map(|r| {
            r.submitted_at
                .map(|at| InteractionRecord::active(url, user, InteractionKind::Reviewer, at))
        });
    comments.chain(reviews).collect()
}

/// Merge basic and enriched records for one user, dropping timestamps outside
/// `[item creation, now]` and exact duplicates.
pub fn merge_interactions(
    item: &ItemRef,
    basic: Vec<InteractionRecord>,
    enriched: Vec<InteractionRecord>,
    now: DateTime<Utc>,
) -> Vec<InteractionRecord> {
    let mut seen = BTreeSet::new();
    let mut merged = Vec::new();
    for record in basic.into_iter().chain(enriched) {
        if let Some(at) = record.at {
            if at < item.created_at || at > now {
                debug!(url = %item.url, kind = %record.kind, %at, "dropping out-of-range interaction");
                continue;
            }
        }
        if seen.insert((record.kind, record.at)) {
            merged.push(record);
        }
    }
    merged.sort_by(|a, b| a.kind.cmp(&b.kind).then(a.at.cmp(&b.at)));
    merged
}

/// Every user's records for one item. Users with no interaction are absent.
pub fn classify(
    detail: &ItemDetail,
    users: &[String],
    now: DateTime<Utc>,
) -> BTreeMap<String, Vec<InteractionRecord>> {
    users
        .iter()
        .filter_map(|user| {
            let records = merge_interactions(
                &detail.item,
                basic_interactions(&detail.item, user),
                enriched_interactions(detail, user),
                now,
            );
            (!records.is_empty()).then(|| (user.clone(), records))
        })
        .collect()
}

/// True when at least one active record falls inside the window.
pub fn passes_gate(records: &[InteractionRecord], window: &DateWindow) -> bool {
    records
        .iter()
        .any(|r| r.kind.is_active() && r.at.is_some_and(|at| window.contains(at)))
}

/// Latest timestamp across all active records, however they were obtained.
pub fn latest_interaction(records: &[InteractionRecord]) -> Option<DateTime<Utc>> {
    records
        .iter()
        .filter(|r| r.kind.is_active())
        .filter_map(|r| r.at)
        .max()
}

/// Earliest response after creation from someone other than the author and not a bot.
/// Comments and reviews are treated alike.
pub fn first_response_at(detail: &ItemDetail, bots: &BotFilter) -> Option<DateTime<Utc>> {
    let item = &detail.item;
    let qualifies = |author: Option<&str>| match author {
        Some(login) => {
            !item.author.as_deref().is_some_and(|a| same_login(a, login)) && !bots.is_bot(login)
        }
        None => false,
    };
    let comments = detail
        .comments
        .iter()
        .filter(|c| qualifies(c.author.as_deref()))
        .map(|c| c.created_at);
    let reviews = detail
        .reviews
        .iter()
        .filter(|r| qualifies(r.author.as_deref()))
        .filter_map(|r| r.submitted_at);
    comments
        .chain(reviews)
        .filter(|at| *at > item.created_at)
        .min()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActivityRequest {
    pub users: Vec<String>,
    pub window: DateWindow,
    pub scope: SearchScope,
    pub show_filtered: bool,
    pub concurrency: usize,
}

impl ActivityRequest {
    pub fn planned_searches(&self) -> Vec<SearchQuery> {
        self.users
            .iter()
            .map(|user| SearchQuery::involving(user, self.window, self.scope.clone()))
            .collect()
    }
}

/// One item as seen by one user.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserItem {
    pub item: Item,
    pub user: String,
    pub records: Vec<InteractionRecord>,
    pub latest_interaction: Option<DateTime<Utc>>,
    /// Included only because filtering was overridden.
    pub filtered: bool,
}

impl UserItem {
    pub fn kinds(&self) -> Vec<InteractionKind> {
        self.records
            .iter()
            .map(|r| r.kind)
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }
}

/// Table-ready row: one item with interaction labels from every user shown.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ItemRow {
    pub item: Item,
    pub labels: Vec<String>,
    pub latest_interaction: Option<DateTime<Utc>>,
    pub filtered: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActivityFailure {
    pub target: String,
    pub kind: String,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Grouping {
    ByRepo(BTreeMap<String, Vec<ItemRow>>),
    ByUserThenRepo(BTreeMap<String, BTreeMap<String, Vec<ItemRow>>>),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActivityReport {
    pub users: Vec<String>,
    pub window: DateWindow,
    pub entries: Vec<UserItem>,
    pub stats: BTreeMap<String, UserStats>,
    pub failures: Vec<ActivityFailure>,
    pub unique_items: usize,
}

impl ActivityReport {
    pub fn is_multi_user(&self) -> bool {
        self.users.len() > 1
    }

    /// Interaction labels for an entry, suffixed with the login when several users are shown.
    pub fn labels(&self, entry: &UserItem) -> Vec<String> {
        entry
            .kinds()
            .into_iter()
            .map(|kind| {
                if self.is_multi_user() {
                    format!("{kind}:{}", entry.user)
                } else {
                    kind.to_string()
                }
            })
            .collect()
    }

    fn rows<'a>(&self, entries: impl Iterator<Item = &'a UserItem>) -> Vec<ItemRow> {
        let mut by_url: BTreeMap<&str, ItemRow> = BTreeMap::new();
        for entry in entries {
            let labels = self.labels(entry);
            let row = by_url.entry(entry.item.url.as_str()).or_insert_with(|| ItemRow {
                item: entry.item.clone(),
                labels: Vec::new(),
                latest_interaction: None,
                filtered: true,
            });
            for label in labels {
                if !row.labels.contains(&label) {
                    row.labels.push(label);
                }
            }
            row.latest_interaction = row.latest_interaction.max(entry.latest_interaction);
            row.filtered &= entry.filtered;
        }
        let mut rows = by_url.into_values().collect::<Vec<_>>();
        rows.sort_by(|a, b| {
            b.latest_interaction
                .cmp(&a.latest_interaction)
                .then_with(|| a.item.url.cmp(&b.item.url))
        });
        rows
    }

    /// One row per item per repository, merging every user's labels.
    pub fn rows_by_repo(&self) -> BTreeMap<String, Vec<ItemRow>> {
        let repos = self
            .entries
            .iter()
            .map(|e| e.item.repo.clone())
            .collect::<BTreeSet<_>>();
        repos
            .into_iter()
            .map(|repo| {
                let rows = self.rows(self.entries.iter().filter(|e| e.item.repo == repo));
                (repo, rows)
            })
            .collect()
    }

    pub fn rows_by_user(&self) -> BTreeMap<String, BTreeMap<String, Vec<ItemRow>>> {
        self.users
            .iter()
            .map(|user| {
                let mine = self.entries.iter().filter(|e| &e.user == user).collect::<Vec<_>>();
                let repos = mine.iter().map(|e| e.item.repo.clone()).collect::<BTreeSet<_>>();
                let grouped = repos
                    .into_iter()
                    .map(|repo| {
                        let rows = self.rows(mine.iter().copied().filter(|e| e.item.repo == repo));
                        (repo, rows)
                    })
                    .collect();
                (user.clone(), grouped)
            })
            .collect()
    }

    /// Single-user runs group by repository; multi-user runs by user, then repository.
    pub fn grouped(&self) -> Grouping {
        if self.is_multi_user() {
            Grouping::ByUserThenRepo(self.rows_by_user())
        } else {
            Grouping::ByRepo(self.rows_by_repo())
        }
    }
}

/// Searches per user, fetches each distinct item once and classifies it for every user.
pub struct ItemAggregator {
    upstream: Arc<dyn Upstream>,
    bot_authors: Option<BotFilter>,
}

impl ItemAggregator {
    pub fn new(upstream: Arc<dyn Upstream>) -> Self {
        Self {
            upstream,
            bot_authors: None,
        }
    }

    /// Drop items opened by bots before any detail is fetched.
    pub fn skip_bot_authored(mut self, bots: BotFilter) -> Self {
        self.bot_authors = Some(bots);
        self
    }

    /// Only rate-limit and credential failures abort; other failures are reported per target.
    pub async fn collect(
        &self,
        request: &ActivityRequest,
        now: DateTime<Utc>,
    ) -> Result<ActivityReport, UpstreamError> {
        let mut failures = Vec::new();
        let mut unique: BTreeMap<String, ItemRef> = BTreeMap::new();

        for query in request.planned_searches() {
            match self.upstream.search(&query).await {
                Ok(page) => {
                    debug!(query = %query.to_query_string(), hits = page.items.len(), "search complete");
                    for item in page.items {
                        unique.entry(item.url.clone()).or_insert(item);
                    }
                }
                Err(err) if err.is_fatal() => return Err(err),
                Err(err) => {
                    warn!(query = %query.to_query_string(), error = %err, "search failed");
                    failures.push(failure(query.to_query_string(), &err));
                }
            }
        }

        if let Some(bots) = &self.bot_authors {
            let before = unique.len();
            unique.retain(|_, item| !item.author.as_deref().is_some_and(|a| bots.is_bot(a)));
            debug!(skipped = before - unique.len(), "dropped bot-authored items");
        }

        let details = self.enrich(unique.values().cloned().collect(), request.concurrency).await;

        let mut entries = Vec::new();
        let mut stats: BTreeMap<String, UserStats> = request
            .users
            .iter()
            .map(|u| (u.clone(), UserStats::default()))
            .collect();

        for (item_ref, fetched) in details {
            let detail = match fetched {
                Ok(detail) => detail,
                Err(err) if err.is_fatal() => return Err(err),
                Err(err) => {
                    warn!(url = %item_ref.url, error = %err, "detail fetch failed; using search metadata only");
                    failures.push(failure(item_ref.url.clone(), &err));
                    ItemDetail {
                        item: item_ref.clone(),
                        merged_at: None,
                        comments: Vec::new(),
                        reviews: Vec::new(),
                    }
                }
            };
            let item = detail.item.to_item();

            for (user, records) in classify(&detail, &request.users, now) {
                let passes = passes_gate(&records, &request.window);
                if !passes && !request.show_filtered {
                    continue;
                }
                if passes {
                    let kinds = records.iter().map(|r| r.kind).collect::<Vec<_>>();
                    stats.entry(user.clone()).or_default().add_item(item.kind, &kinds);
                }
                entries.push(UserItem {
                    item: item.clone(),
                    latest_interaction: latest_interaction(&records),
                    user,
                    records,
                    filtered: !passes,
                });
            }
        }

        info!(
            users = request.users.len(),
            unique_items = unique.len(),
            entries = entries.len(),
            failures = failures.len(),
            "activity aggregation complete"
        );

        Ok(ActivityReport {
            users: request.users.clone(),
            window: request.window,
            entries,
            stats,
            failures,
            unique_items: unique.len(),
        })
    }

    async fn enrich(
        &self,
        items: Vec<ItemRef>,
        concurrency: usize,
    ) -> Vec<(ItemRef, Result<ItemDetail, UpstreamError>)> {
        let limit = Arc::new(Semaphore::new(concurrency.max(1)));
        let mut tasks = JoinSet::new();
        for item in items {
            let upstream = self.upstream.clone();
            let limit = limit.clone();
            tasks.spawn(async move {
                let result = match limit.acquire_owned().await {
                    Ok(_permit) => upstream.fetch_detail(&item).await,
                    Err(_) => Err(UpstreamError::Transport("worker pool closed".to_string())),
                };
                (item, result)
            });
        }

        let mut out = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(pair) => out.push(pair),
                Err(err) => warn!(error = %err, "detail task panicked"),
            }
        }
        out.sort_by(|a, b| a.0.url.cmp(&b.0.url));
        out
    }
}

fn failure(target: String, err: &UpstreamError) -> ActivityFailure {
    ActivityFailure {
        target,
        kind: err.kind().to_string(),
        message: err.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use ghpulse_adapters::{CachedUpstream, FixtureBundle, FixtureUpstream, UpstreamCache};
    use ghpulse_core::{Comment, ItemState, Review};

    fn ts(d: u32, h: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 10, d, h, 0, 0).single().unwrap()
    }

    fn now() -> DateTime<Utc> {
        ts(19, 12)
    }

    fn window() -> DateWindow {
        DateWindow::new(ts(5, 0), now())
    }

    fn item(number: u64, pr: bool, author: &str, created: DateTime<Utc>) -> ItemRef {
        let path = if pr { "pull" } else { "issues" };
        ItemRef {
            url: format!("https://github.com/acme/widgets/{path}/{number}"),
            repo: "acme/widgets".into(),
            number,
            title: format!("item {number}"),
            state: ItemState::Open,
            author: Some(author.into()),
            created_at: created,
            updated_at: None,
            closed_at: None,
            is_pull_request: pr,
            assignees: vec![],
            requested_reviewers: vec![],
            body: None,
        }
    }

    fn bare(item: ItemRef) -> ItemDetail {
        ItemDetail {
            item,
            merged_at: None,
            comments: vec![],
            reviews: vec![],
        }
    }

    fn request(users: &[&str], show_filtered: bool) -> ActivityRequest {
        ActivityRequest {
            users: users.iter().map(|u| u.to_string()).collect(),
            window: window(),
            scope: SearchScope::Any,
            show_filtered,
            concurrency: 4,
        }
    }

    #[test]
    fn mentions_ignore_email_addresses() {
        let found = mentioned_logins("ping @Alice and @bob-smith, mail carol@example.com (@dave-)");
        assert_eq!(
            found.into_iter().collect::<Vec<_>>(),
            vec!["alice".to_string(), "bob-smith".to_string(), "dave".to_string()]
        );
    }

    #[test]
    fn bot_filter_matches_suffix_list_and_ignores() {
        let bots = BotFilter::builtin().with_logins(["ci-helper"]);
        assert!(bots.is_bot("dependabot[bot]"));
        assert!(bots.is_bot("Renovate"));
        assert!(bots.is_bot("deploy-bot"));
        assert!(bots.is_bot("CI-Helper"));
        assert!(!bots.is_bot("abbot"));
        assert!(!bots.is_bot("alice"));
    }

    #[test]
    fn passive_only_items_never_pass_the_gate() {
        let passive_kinds = [
            InteractionKind::Assignee,
            InteractionKind::Mentioned,
            InteractionKind::ReviewRequested,
        ];
        // every non-empty combination of passive kinds
        for mask in 1u8..8 {
            let records = passive_kinds
                .iter()
                .enumerate()
                .filter(|(i, _)| mask & (1 << i) != 0)
                .map(|(_, k)| InteractionRecord::passive("u", "alice", *k))
                .collect::<Vec<_>>();
            assert!(!passes_gate(&records, &window()), "mask {mask}");
        }
        let active = vec![InteractionRecord::active("u", "alice", InteractionKind::Commenter, ts(10, 0))];
        assert!(passes_gate(&active, &window()));
        let stale = vec![InteractionRecord::active("u", "alice", InteractionKind::Author, ts(1, 0))];
        assert!(!passes_gate(&stale, &window()));
    }

    #[test]
    fn classification_keeps_users_apart() {
        let mut pr = item(7, true, "alice", ts(8, 9));
        pr.requested_reviewers = vec!["carol".into()];
        let detail = ItemDetail {
            item: pr,
            merged_at: None,
            comments: vec![Comment { author: Some("bob".into()), created_at: ts(9, 10), body: None }],
            reviews: vec![Review {
                author: Some("Bob".into()),
                submitted_at: Some(ts(10, 10)),
                state: "APPROVED".into(),
            }],
        };
        let users = vec!["alice".to_string(), "bob".to_string(), "carol".to_string(), "dave".to_string()];
        let classified = classify(&detail, &users, now());

        let kinds = |u: &str| classified[u].iter().map(|r| r.kind).collect::<Vec<_>>();
        assert_eq!(kinds("alice"), vec![InteractionKind::Author]);
        assert_eq!(kinds("bob"), vec![InteractionKind::Commenter, InteractionKind::Reviewer]);
        assert_eq!(kinds("carol"), vec![InteractionKind::ReviewRequested]);
        assert!(!classified.contains_key("dave"));
        assert!(classified["bob"].iter().all(|r| r.user == "bob"));
        assert_eq!(latest_interaction(&classified["bob"]), Some(ts(10, 10)));
    }

    #[test]
    fn timestamps_outside_item_lifetime_are_dropped() {
        let issue = item(3, false, "alice", ts(8, 0));
        let enriched = vec![
            InteractionRecord::active(&issue.url, "alice", InteractionKind::Commenter, ts(7, 0)),
            InteractionRecord::active(&issue.url, "alice", InteractionKind::Commenter, ts(20, 0)),
            InteractionRecord::active(&issue.url, "alice", InteractionKind::Commenter, ts(9, 0)),
        ];
        let merged = merge_interactions(&issue, basic_interactions(&issue, "alice"), enriched, now());
        let stamps = merged.iter().map(|r| r.at).collect::<Vec<_>>();
        assert_eq!(stamps, vec![Some(ts(8, 0)), Some(ts(9, 0))]);
    }

    #[test]
    fn first_response_skips_author_bots_and_early_events() {
        let issue = item(5, false, "alice", ts(8, 0));
        let detail = ItemDetail {
            item: issue,
            merged_at: None,
            comments: vec![
                Comment { author: Some("ALICE".into()), created_at: ts(8, 1), body: None },
                Comment { author: Some("github-actions[bot]".into()), created_at: ts(8, 2), body: None },
                Comment { author: Some("bob".into()), created_at: ts(9, 5), body: None },
            ],
            reviews: vec![Review { author: Some("carol".into()), submitted_at: Some(ts(8, 7)), state: "COMMENTED".into() }],
        };
        assert_eq!(first_response_at(&detail, &BotFilter::builtin()), Some(ts(8, 7)));

        let ignoring_carol = BotFilter::builtin().with_logins(["carol"]);
        assert_eq!(first_response_at(&detail, &ignoring_carol), Some(ts(9, 5)));

        assert_eq!(first_response_at(&bare(item(6, false, "alice", ts(8, 0))), &BotFilter::builtin()), None);
    }

    fn scenario_bundle() -> FixtureBundle {
        let authored = item(1, false, "alice", ts(10, 9));
        let mut mentioned = item(2, false, "zed", ts(11, 9));
        mentioned.body = Some("cc @alice for visibility".into());
        let pr = item(7, true, "zed", ts(12, 9));
        FixtureBundle {
            items: vec![
                bare(authored),
                bare(mentioned),
                ItemDetail {
                    item: pr,
                    merged_at: None,
                    comments: vec![],
                    reviews: vec![
                        Review { author: Some("alice".into()), submitted_at: Some(ts(13, 9)), state: "APPROVED".into() },
                        Review { author: Some("bob".into()), submitted_at: Some(ts(14, 9)), state: "COMMENTED".into() },
                    ],
                },
            ],
            ..FixtureBundle::default()
        }
    }

    #[tokio::test]
    async fn passive_mention_is_excluded_unless_show_filtered() {
        let upstream: Arc<dyn Upstream> = Arc::new(FixtureUpstream::new(scenario_bundle()));
        let aggregator = ItemAggregator::new(upstream);

        let report = aggregator.collect(&request(&["alice"], false), now()).await.unwrap();
        let numbers = report.entries.iter().map(|e| e.item.number).collect::<BTreeSet<_>>();
        assert!(numbers.contains(&1));
        assert!(!numbers.contains(&2));

        let report = aggregator.collect(&request(&["alice"], true), now()).await.unwrap();
        let shown = report
            .entries
            .iter()
            .map(|e| (e.item.number, e.filtered))
            .collect::<BTreeMap<_, _>>();
        assert_eq!(shown.get(&1), Some(&false));
        assert_eq!(shown.get(&2), Some(&true));
        assert_eq!(report.stats["alice"].issues_authored, 1);
        assert_eq!(report.stats["alice"].prs_reviewed, 1);
        assert_eq!(report.stats["alice"].total, 2);
    }

    #[tokio::test]
    async fn shared_pull_request_is_fetched_once_and_tagged_per_user() {
        let fixture = Arc::new(FixtureUpstream::new(scenario_bundle()));
        let cached: Arc<dyn Upstream> =
            Arc::new(CachedUpstream::new(fixture.clone(), Arc::new(UpstreamCache::new())));
        let aggregator = ItemAggregator::new(cached);

        let report = aggregator.collect(&request(&["alice", "bob"], false), now()).await.unwrap();

        let pr_url = "https://github.com/acme/widgets/pull/7";
        assert_eq!(fixture.calls().detail, report.unique_items);
        assert_eq!(report.entries.iter().filter(|e| e.item.url == pr_url).count(), 2);

        let rows = report.rows_by_repo();
        let pr_row = rows["acme/widgets"].iter().find(|r| r.item.url == pr_url).unwrap();
        assert_eq!(pr_row.labels, vec!["reviewer:alice".to_string(), "reviewer:bob".to_string()]);
        assert_eq!(pr_row.latest_interaction, Some(ts(14, 9)));

        match report.grouped() {
            Grouping::ByUserThenRepo(by_user) => {
                assert_eq!(by_user["bob"]["acme/widgets"].len(), 1);
                assert!(by_user["alice"]["acme/widgets"].len() >= 2);
            }
            Grouping::ByRepo(_) => panic!("multi-user report must group by user"),
        }
    }

    #[tokio::test]
    async fn single_user_labels_have_no_suffix() {
        let upstream: Arc<dyn Upstream> = Arc::new(FixtureUpstream::new(scenario_bundle()));
        let report = ItemAggregator::new(upstream)
            .collect(&request(&["bob"], false), now())
            .await
            .unwrap();
        match report.grouped() {
            Grouping::ByRepo(by_repo) => {
                assert_eq!(by_repo["acme/widgets"][0].labels, vec!["reviewer".to_string()]);
            }
            Grouping::ByUserThenRepo(_) => panic!("single-user report must group by repo"),
        }
    }

    #[tokio::test]
    async fn bot_authored_items_are_skipped_before_enrichment() {
        let mut bundle = scenario_bundle();
        let mut bump = item(9, true, "renovate[bot]", ts(12, 0));
        bump.requested_reviewers = vec!["alice".into()];
        bundle.items.push(ItemDetail {
            item: bump,
            merged_at: None,
            comments: vec![Comment { author: Some("alice".into()), created_at: ts(12, 5), body: None }],
            reviews: vec![],
        });
        let fixture = Arc::new(FixtureUpstream::new(bundle));
        let report = ItemAggregator::new(fixture.clone())
            .skip_bot_authored(BotFilter::builtin())
            .collect(&request(&["alice"], false), now())
            .await
            .unwrap();
        assert!(report.entries.iter().all(|e| e.item.number != 9));
        assert_eq!(fixture.calls().detail, report.unique_items);
        assert_eq!(report.unique_items, 3);
    }

    #[tokio::test]
    async fn past_window_keeps_items_touched_after_it_closed() {
        let mut issue = item(4, false, "zed", ts(6, 0));
        issue.updated_at = Some(ts(15, 0));
        let bundle = FixtureBundle {
            items: vec![ItemDetail {
                item: issue,
                merged_at: None,
                comments: vec![
                    Comment { author: Some("alice".into()), created_at: ts(8, 0), body: None },
                    Comment { author: Some("zed".into()), created_at: ts(15, 0), body: None },
                ],
                reviews: vec![],
            }],
            ..FixtureBundle::default()
        };
        let mut past = request(&["alice"], false);
        past.window = DateWindow::new(ts(5, 0), ts(10, 23));

        let planned = past.planned_searches();
        assert_eq!(
            planned[0].to_query_string(),
            "involves:alice updated:>=2026-10-05T00:00:00Z"
        );

        let upstream: Arc<dyn Upstream> = Arc::new(FixtureUpstream::new(bundle));
        let report = ItemAggregator::new(upstream).collect(&past, now()).await.unwrap();
        assert_eq!(report.entries.len(), 1);
        assert_eq!(report.entries[0].latest_interaction, Some(ts(8, 0)));
    }

    #[tokio::test]
    async fn rate_limit_aborts_aggregation() {
        let fixture = FixtureUpstream::new(scenario_bundle())
            .with_failure("acme/widgets", UpstreamError::RateLimited("search".into()));
        let upstream: Arc<dyn Upstream> = Arc::new(fixture);
        let err = ItemAggregator::new(upstream)
            .collect(&request(&["alice"], false), now())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "rate_limit");
    }
}
