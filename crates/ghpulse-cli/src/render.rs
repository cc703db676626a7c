use chrono::{DateTime, Utc};
use ghpulse_activity::{ActivityReport, Grouping, ItemRow};
use ghpulse_adapters::SearchQuery;
use ghpulse_core::{HealthSnapshot, ItemKind};
use ghpulse_sync::{DryRunPlan, HealthMetric, HealthRunSummary};

fn cell(text: &str) -> String {
    text.replace('|', "\\|").replace('\n', " ")
}

fn stamp(at: Option<DateTime<Utc>>) -> String {
    at.map(|at| at.format("%Y-%m-%d %H:%M").to_string())
        .unwrap_or_else(|| "-".to_string())
}

fn item_table(lines: &mut Vec<String>, rows: &[ItemRow]) {
    lines.push("| Item | Kind | State | Title | Interactions | Latest |".to_string());
    lines.push("|---|---|---|---|---|---|".to_string());
    for row in rows {
        let kind = match row.item.kind {
            ItemKind::Issue => "issue",
            ItemKind::PullRequest => "PR",
        };
        let mut labels = row.labels.join(", ");
        if row.filtered {
            labels.push_str(" (filtered)");
        }
        lines.push(format!(
            "| [#{}]({}) | {kind} | {} | {} | {} | {} |",
            row.item.number,
            row.item.url,
            row.item.state.as_str(),
            cell(&row.item.title),
            labels,
            stamp(row.latest_interaction),
        ));
    }
    lines.push(String::new());
}

pub fn activity_markdown(report: &ActivityReport) -> String {
    let mut lines = vec![
        format!("# Activity for {}", report.users.join(", ")),
        String::new(),
        format!(
            "Window: {} .. {} ({} unique items)",
            report.window.since.format("%Y-%m-%d"),
            report.window.until.format("%Y-%m-%d"),
            report.unique_items
        ),
        String::new(),
    ];

    match report.grouped() {
        Grouping::ByRepo(by_repo) => {
            for (repo, rows) in by_repo {
                lines.push(format!("## {repo}"));
                lines.push(String::new());
                item_table(&mut lines, &rows);
            }
        }
        Grouping::ByUserThenRepo(by_user) => {
            for (user, repos) in by_user {
                lines.push(format!("## {user}"));
                lines.push(String::new());
                for (repo, rows) in repos {
                    lines.push(format!("### {repo}"));
                    lines.push(String::new());
                    item_table(&mut lines, &rows);
                }
            }
        }
    }

    lines.push("## Totals".to_string());
    lines.push(String::new());
    lines.push(
        "| User | PRs authored | PRs reviewed | PRs commented | Issues authored | Issues commented | Total |"
            .to_string(),
    );
    lines.push("|---|---|---|---|---|---|---|".to_string());
    for (user, stats) in &report.stats {
        lines.push(format!(
            "| {user} | {} | {} | {} | {} | {} | {} |",
            stats.prs_authored,
            stats.prs_reviewed,
            stats.prs_commented,
            stats.issues_authored,
            stats.issues_commented,
            stats.total
        ));
    }

    if !report.failures.is_empty() {
        lines.push(String::new());
        lines.push("## Failures".to_string());
        lines.push(String::new());
        for failure in &report.failures {
            lines.push(format!("- `{}` ({}): {}", failure.target, failure.kind, failure.message));
        }
    }

    lines.join("\n")
}

pub fn activity_plan(queries: &[SearchQuery]) -> String {
    let mut lines = vec![format!("Planned searches: {}", queries.len())];
    lines.extend(queries.iter().map(|q| format!("- `{}` (limit {})", q.to_query_string(), q.limit)));
    lines.push("Each distinct item found adds one detail fetch.".to_string());
    lines.join("\n")
}

pub fn health_table(repo: &str, snapshots: &[HealthSnapshot], metrics: &[HealthMetric]) -> String {
    let mut lines = vec![format!("## {repo}"), String::new()];
    if snapshots.is_empty() {
        lines.push("No snapshots stored.".to_string());
        return lines.join("\n");
    }
    let headers = metrics.iter().map(|m| m.header()).collect::<Vec<_>>();
    lines.push(format!("| Week | {} |", headers.join(" | ")));
    lines.push(format!("|---|{}", "---|".repeat(metrics.len())));
    for snapshot in snapshots {
        let week = snapshot
            .week()
            .map(|w| w.label())
            .unwrap_or_else(|| snapshot.week_start.format("%Y-%m-%d").to_string());
        let cells = metrics.iter().map(|m| m.cell(snapshot)).collect::<Vec<_>>();
        lines.push(format!("| {week} | {} |", cells.join(" | ")));
    }
    lines.join("\n")
}

pub fn run_summary(summary: &HealthRunSummary) -> String {
    let mut lines = vec![
        format!("Run `{}`", summary.run_id),
        format!(
            "- planned: {}, skipped (stored): {}, succeeded: {}, failed: {}, abandoned: {}",
            summary.planned,
            summary.skipped_cached,
            summary.succeeded,
            summary.failed.len(),
            summary.abandoned
        ),
        format!(
            "- upstream fetches: {}, cache hits: {}",
            summary.upstream_fetches, summary.upstream_cache_hits
        ),
    ];
    for failed in &summary.failed {
        lines.push(format!(
            "- failed {} week {}: {} ({})",
            failed.repo,
            failed.week.label(),
            failed.kind,
            failed.message
        ));
    }
    if let Some(reason) = &summary.aborted {
        lines.push(format!("- aborted: {reason}"));
    }
    lines.join("\n")
}

pub fn dry_run(plan: &DryRunPlan) -> String {
    let mut lines = vec![
        "| Repo | Week | Status | Searches | Sample fetches (max) |".to_string(),
        "|---|---|---|---|---|".to_string(),
    ];
    for unit in &plan.units {
        let (status, searches, details) = match unit.calls {
            Some(calls) => (
                "pending",
                calls.searches.to_string(),
                calls.max_sample_details.to_string(),
            ),
            None => ("stored", "0".to_string(), "0".to_string()),
        };
        lines.push(format!(
            "| {} | {} | {status} | {searches} | {details} |",
            unit.repo,
            unit.week.label()
        ));
    }
    lines.push(String::new());
    lines.push(format!(
        "{} pending units, at most {} upstream calls plus one detail fetch per merged PR.",
        plan.pending(),
        plan.max_upstream_calls()
    ));
    lines.join("\n")
}
