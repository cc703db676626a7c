//! Core domain model for ghpulse: items, interactions, repository identity and weekly health snapshots.

use std::fmt;

use chrono::{DateTime, Datelike, Duration, NaiveTime, Timelike, Utc};
use serde::{Deserialize, Serialize};

pub const CRATE_NAME: &str = "ghpulse-core";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemKind {
    Issue,
    PullRequest,
}

impl ItemKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Issue => "issue",
            Self::PullRequest => "pull_request",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemState {
    Open,
    Closed,
    Merged,
}

impl ItemState {
    /// Upstream views spell state differently ("OPEN", "closed", "MERGED"); unknown values read as closed.
    pub fn parse(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "open" => Self::Open,
            "merged" => Self::Merged,
            _ => Self::Closed,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Open => "open",
            Self::Closed => "closed",
            Self::Merged => "merged",
        }
    }
}

/// Item as surfaced by a search, before its kind has been resolved.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ItemRef {
    pub url: String,
    pub repo: String,
    pub number: u64,
    pub title: String,
    pub state: ItemState,
    pub author: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub closed_at: Option<DateTime<Utc>>,
    /// Explicit pull-request marker; absent in some upstream views.
    #[serde(default)]
    pub is_pull_request: bool,
    #[serde(default)]
    pub assignees: Vec<String>,
    #[serde(default)]
    pub requested_reviewers: Vec<String>,
    #[serde(default)]
    pub body: Option<String>,
}

impl ItemRef {
    /// Pull request if flagged explicitly, merged, or its URL path says so, checked in that order.
    /// Upstream views disagree on these fields, so any one of them is enough.
    pub fn resolve_kind(&self) -> ItemKind {
        if self.is_pull_request
            || self.state == ItemState::Merged
            || self.url.contains("/pull/")
            || self.url.contains("/pulls/")
        {
            ItemKind::PullRequest
        } else {
            ItemKind::Issue
        }
    }

    pub fn to_item(&self) -> Item {
        Item {
            url: self.url.clone(),
            kind: self.resolve_kind(),
            state: self.state,
            repo: self.repo.clone(),
            number: self.number,
            author: self.author.clone(),
            created_at: self.created_at,
            title: self.title.clone(),
        }
    }
}

/// Resolved item identity. The kind is fixed once resolved for the run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Item {
    pub url: String,
    pub kind: ItemKind,
    pub state: ItemState,
    pub repo: String,
    pub number: u64,
    pub author: Option<String>,
    pub created_at: DateTime<Utc>,
    pub title: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Comment {
    pub author: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub body: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Review {
    pub author: Option<String>,
    pub submitted_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub state: String,
}

/// Everything the detail fetch returns for one item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ItemDetail {
    pub item: ItemRef,
    #[serde(default)]
    pub merged_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub comments: Vec<Comment>,
    #[serde(default)]
    pub reviews: Vec<Review>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InteractionKind {
    Author,
    Commenter,
    Reviewer,
    ReviewRequested,
    Assignee,
    Mentioned,
}

impl InteractionKind {
    /// Active interactions carry a timestamp and take part in date-range filtering.
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Author | Self::Commenter | Self::Reviewer)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Author => "author",
            Self::Commenter => "commenter",
            Self::Reviewer => "reviewer",
            Self::ReviewRequested => "review_requested",
            Self::Assignee => "assignee",
            Self::Mentioned => "mentioned",
        }
    }
}

impl fmt::Display for InteractionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct InteractionRecord {
    pub item_url: String,
    pub user: String,
    pub kind: InteractionKind,
    pub at: Option<DateTime<Utc>>,
}

impl InteractionRecord {
    pub fn active(item_url: &str, user: &str, kind: InteractionKind, at: DateTime<Utc>) -> Self {
        Self {
            item_url: item_url.to_string(),
            user: user.to_string(),
            kind,
            at: Some(at),
        }
    }

    pub fn passive(item_url: &str, user: &str, kind: InteractionKind) -> Self {
        Self {
            item_url: item_url.to_string(),
            user: user.to_string(),
            kind,
            at: None,
        }
    }
}

/// Per-user counters, rebuilt from interaction records on every run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserStats {
    pub prs_authored: u32,
    pub prs_reviewed: u32,
    pub prs_commented: u32,
    pub issues_authored: u32,
    pub issues_commented: u32,
    pub total: u32,
}

impl UserStats {
    /// Count one included item with the user's interaction kinds on it.
    pub fn add_item(&mut self, kind: ItemKind, interactions: &[InteractionKind]) {
        let has = |k: InteractionKind| interactions.contains(&k);
        match kind {
            ItemKind::PullRequest => {
                self.prs_authored += u32::from(has(InteractionKind::Author));
                self.prs_reviewed += u32::from(has(InteractionKind::Reviewer));
                self.prs_commented += u32::from(has(InteractionKind::Commenter));
            }
            ItemKind::Issue => {
                self.issues_authored += u32::from(has(InteractionKind::Author));
                self.issues_commented += u32::from(has(InteractionKind::Commenter));
            }
        }
        self.total += 1;
    }
}

/// Repository identity. `external_id` never changes; `full_name` follows renames.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepoIdentity {
    pub external_id: i64,
    pub node_id: String,
    pub org: String,
    pub name: String,
    pub full_name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Release {
    pub tag: String,
    pub published_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub draft: bool,
    #[serde(default)]
    pub prerelease: bool,
}

/// Calendar week, Monday 00:00:00 UTC through Sunday 23:59:59 UTC.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Week {
    start: DateTime<Utc>,
}

impl Week {
    pub fn containing(at: DateTime<Utc>) -> Self {
        let date = at.date_naive();
        let monday = date - Duration::days(i64::from(date.weekday().num_days_from_monday()));
        Self {
            start: monday.and_time(NaiveTime::MIN).and_utc(),
        }
    }

    /// Accepts only a Monday at midnight.
    pub fn from_start(start: DateTime<Utc>) -> Option<Self> {
        let week = Self::containing(start);
        (week.start == start && start.nanosecond() == 0).then_some(week)
    }

    /// The last `count` fully completed weeks before the week containing `now`, newest first.
    /// Stops early rather than step past the earliest representable date.
    pub fn recent_completed(count: usize, now: DateTime<Utc>) -> Vec<Self> {
        let current = Self::containing(now);
        (1..=i64::try_from(count).unwrap_or(i64::MAX))
            .map_while(|back| {
                let start = current.start.checked_sub_signed(Duration::try_weeks(back)?)?;
                Some(Self { start })
            })
            .collect()
    }

    pub fn start(&self) -> DateTime<Utc> {
        self.start
    }

    pub fn end(&self) -> DateTime<Utc> {
        self.start + Duration::days(7) - Duration::seconds(1)
    }

    pub fn contains(&self, at: DateTime<Utc>) -> bool {
        at >= self.start && at <= self.end()
    }

    pub fn label(&self) -> String {
        self.start.format("%G-W%V").to_string()
    }

    pub fn window(&self) -> DateWindow {
        DateWindow {
            since: self.start,
            until: self.end(),
        }
    }
}

impl fmt::Display for Week {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.start.format("%Y-%m-%d"))
    }
}

/// Inclusive time window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DateWindow {
    pub since: DateTime<Utc>,
    pub until: DateTime<Utc>,
}

impl DateWindow {
    pub fn new(since: DateTime<Utc>, until: DateTime<Utc>) -> Self {
        Self { since, until }
    }

    /// The `days` days ending at `now`; `None` when the start is not representable.
    pub fn last_days(days: i64, now: DateTime<Utc>) -> Option<Self> {
        let since = now.checked_sub_signed(Duration::try_days(days)?)?;
        Some(Self { since, until: now })
    }

    pub fn contains(&self, at: DateTime<Utc>) -> bool {
        at >= self.since && at <= self.until
    }

    /// Search qualifier range, e.g. `2026-10-12..2026-10-18`.
    pub fn qualifier_range(&self) -> String {
        format!(
            "{}..{}",
            self.since.format("%Y-%m-%d"),
            self.until.format("%Y-%m-%d")
        )
    }
}

/// One persisted weekly health record. Averages are `None` when no item contributed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthSnapshot {
    pub repo_external_id: i64,
    pub week_start: DateTime<Utc>,
    pub week_end: DateTime<Utc>,
    pub open_issues: i64,
    pub open_prs: i64,
    pub new_issues: i64,
    pub new_prs: i64,
    pub days_since_release: Option<i64>,
    pub last_release_tag: Option<String>,
    pub avg_issue_response_hours: Option<f64>,
    pub issue_response_sample: i64,
    pub avg_pr_response_hours: Option<f64>,
    pub pr_response_sample: i64,
    pub avg_pr_cycle_hours: Option<f64>,
    pub merged_pr_count: i64,
    pub collected_at: DateTime<Utc>,
}

impl HealthSnapshot {
    pub fn week(&self) -> Option<Week> {
        Week::from_start(self.week_start)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn ts(y: i32, m: u32, d: u32, h: u32, mi: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, h, mi, s).single().unwrap()
    }

    #[test]
    fn week_boundaries_are_monday_to_sunday_utc() {
        // 2026-10-15 is a Thursday.
        let week = Week::containing(ts(2026, 10, 15, 17, 30, 0));
        assert_eq!(week.start(), ts(2026, 10, 12, 0, 0, 0));
        assert_eq!(week.end(), ts(2026, 10, 18, 23, 59, 59));
        assert!(week.contains(ts(2026, 10, 18, 23, 59, 59)));
        assert!(!week.contains(ts(2026, 10, 19, 0, 0, 0)));
        assert_eq!(Week::containing(week.end()), week);
    }

    #[test]
    fn recent_completed_weeks_skip_the_current_week() {
        let weeks = Week::recent_completed(3, ts(2026, 10, 19, 9, 0, 0));
        let starts = weeks.iter().map(|w| w.start()).collect::<Vec<_>>();
        assert_eq!(
            starts,
            vec![
                ts(2026, 10, 12, 0, 0, 0),
                ts(2026, 10, 5, 0, 0, 0),
                ts(2026, 9, 28, 0, 0, 0)
            ]
        );
    }

    #[test]
    fn oversized_ranges_stop_at_the_calendar_edge() {
        let near_start = DateTime::<Utc>::MIN_UTC + Duration::days(8);
        assert!(Week::recent_completed(10, near_start).len() <= 1);

        let now = ts(2026, 10, 19, 9, 0, 0);
        assert_eq!(DateWindow::last_days(i64::MAX, now), None);
        let week = DateWindow::last_days(7, now).unwrap();
        assert_eq!(week.since, ts(2026, 10, 12, 9, 0, 0));
        assert_eq!(week.until, now);
    }

    #[test]
    fn from_start_rejects_non_monday_midnight() {
        assert!(Week::from_start(ts(2026, 10, 12, 0, 0, 0)).is_some());
        assert!(Week::from_start(ts(2026, 10, 13, 0, 0, 0)).is_none());
        assert!(Week::from_start(ts(2026, 10, 12, 0, 0, 1)).is_none());
    }

    #[test]
    fn only_author_commenter_reviewer_are_active() {
        let active = [
            InteractionKind::Author,
            InteractionKind::Commenter,
            InteractionKind::Reviewer,
        ];
        let passive = [
            InteractionKind::ReviewRequested,
            InteractionKind::Assignee,
            InteractionKind::Mentioned,
        ];
        assert!(active.iter().all(|k| k.is_active()));
        assert!(passive.iter().all(|k| !k.is_active()));
    }

    #[test]
    fn user_stats_count_items_by_kind() {
        let mut stats = UserStats::default();
        stats.add_item(
            ItemKind::PullRequest,
            &[InteractionKind::Reviewer, InteractionKind::Commenter],
        );
        stats.add_item(ItemKind::Issue, &[InteractionKind::Author]);
        assert_eq!(stats.prs_reviewed, 1);
        assert_eq!(stats.prs_commented, 1);
        assert_eq!(stats.prs_authored, 0);
        assert_eq!(stats.issues_authored, 1);
        assert_eq!(stats.total, 2);
    }

    #[test]
    fn kind_resolution_accepts_any_pull_request_signal() {
        let base = ItemRef {
            url: "https://github.com/acme/widgets/issues/4".into(),
            repo: "acme/widgets".into(),
            number: 4,
            title: "Crash on start".into(),
            state: ItemState::Open,
            author: Some("alice".into()),
            created_at: ts(2026, 10, 13, 8, 0, 0),
            updated_at: None,
            closed_at: None,
            is_pull_request: false,
            assignees: vec![],
            requested_reviewers: vec![],
            body: None,
        };
        assert_eq!(base.resolve_kind(), ItemKind::Issue);

        let flagged = ItemRef { is_pull_request: true, ..base.clone() };
        assert_eq!(flagged.resolve_kind(), ItemKind::PullRequest);

        let merged = ItemRef { state: ItemState::Merged, ..base.clone() };
        assert_eq!(merged.resolve_kind(), ItemKind::PullRequest);

        let by_url = ItemRef {
            url: "https://github.com/acme/widgets/pull/4".into(),
            ..base.clone()
        };
        assert_eq!(by_url.to_item().kind, ItemKind::PullRequest);
    }

    #[test]
    fn state_parsing_is_case_insensitive() {
        assert_eq!(ItemState::parse("OPEN"), ItemState::Open);
        assert_eq!(ItemState::parse("Merged"), ItemState::Merged);
        assert_eq!(ItemState::parse("closed"), ItemState::Closed);
    }
}
