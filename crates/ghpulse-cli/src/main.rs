mod render;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use clap::{Args, Parser, Subcommand};
use ghpulse_activity::{ActivityRequest, ItemAggregator};
use ghpulse_adapters::SearchScope;
use ghpulse_core::{DateWindow, Week};
use ghpulse_sync::{CollectError, CollectOptions, HealthCollector, HealthMetric, PulseConfig};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

const MAX_DAYS: i64 = 3_650;
const MAX_WEEKS: u64 = 520;

#[derive(Debug, Parser)]
#[command(name = "ghpulse")]
#[command(about = "GitHub activity reports and weekly repository health snapshots")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Issues and PRs the given users interacted with.
    Activity(ActivityArgs),
    /// Collect and show weekly health snapshots.
    Health(HealthArgs),
    /// Show stored snapshots for one repository.
    History {
        repo: String,
        #[arg(long, default_value_t = 12)]
        limit: i64,
        #[arg(long = "metric")]
        metrics: Vec<HealthMetric>,
    },
    Migrate,
}

#[derive(Debug, Args)]
struct ActivityArgs {
    #[arg(long = "user", required = true)]
    users: Vec<String>,
    #[arg(long, conflicts_with = "repo")]
    org: Option<String>,
    #[arg(long)]
    repo: Option<String>,
    /// First day of the window (YYYY-MM-DD).
    #[arg(long)]
    since: Option<NaiveDate>,
    /// Last day of the window, inclusive (YYYY-MM-DD).
    #[arg(long, conflicts_with = "days")]
    until: Option<NaiveDate>,
    #[arg(long, value_parser = clap::value_parser!(i64).range(1..=MAX_DAYS))]
    days: Option<i64>,
    #[arg(long)]
    show_filtered: bool,
    /// Hide items opened by these accounts, on top of the known bots.
    #[arg(long = "ignore-bot")]
    ignore_bots: Vec<String>,
    #[arg(long)]
    workers: Option<usize>,
    #[arg(long)]
    dry_run: bool,
    /// Serve upstream data from a JSON fixture bundle instead of the network.
    #[arg(long)]
    fixture: Option<PathBuf>,
}

#[derive(Debug, Args)]
struct HealthArgs {
    #[arg(long = "repo", required = true)]
    repos: Vec<String>,
    #[arg(long, default_value_t = 4, value_parser = clap::value_parser!(u64).range(1..=MAX_WEEKS))]
    weeks: u64,
    #[arg(long = "metric")]
    metrics: Vec<HealthMetric>,
    /// Re-collect weeks that are already stored.
    #[arg(long)]
    refresh: bool,
    #[arg(long)]
    workers: Option<usize>,
    /// Logins whose responses never count toward response times.
    #[arg(long = "ignore-bot")]
    ignore_bots: Vec<String>,
    #[arg(long)]
    dry_run: bool,
    #[arg(long)]
    fixture: Option<PathBuf>,
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn end_of_day(date: NaiveDate) -> Result<DateTime<Utc>> {
    date.and_hms_opt(23, 59, 59)
        .map(|at| at.and_utc())
        .with_context(|| format!("no end of day for {date}"))
}

fn activity_window(args: &ActivityArgs, now: DateTime<Utc>) -> Result<DateWindow> {
    let until = args.until.map(end_of_day).transpose()?.unwrap_or(now);
    let window = match (args.since, args.days) {
        (Some(date), _) => DateWindow::new(date.and_time(NaiveTime::MIN).and_utc(), until),
        (None, days) => DateWindow::last_days(days.unwrap_or(7), until)
            .context("--days reaches before the earliest supported date")?,
    };
    if window.since > window.until {
        bail!("--since must not be after the end of the window");
    }
    Ok(window)
}

fn selected_metrics(metrics: Vec<HealthMetric>) -> Vec<HealthMetric> {
    if metrics.is_empty() {
        HealthMetric::ALL.to_vec()
    } else {
        metrics
    }
}

async fn run_activity(config: PulseConfig, args: ActivityArgs) -> Result<()> {
    let now = Utc::now();
    let scope = match (&args.org, &args.repo) {
        (_, Some(repo)) => SearchScope::Repo(repo.clone()),
        (Some(org), None) => SearchScope::Org(org.clone()),
        (None, None) => SearchScope::Any,
    };
    let request = ActivityRequest {
        users: args.users.clone(),
        window: activity_window(&args, now)?,
        scope,
        show_filtered: args.show_filtered,
        concurrency: args.workers.unwrap_or(config.workers),
    };

    if args.dry_run {
        println!("{}", render::activity_plan(&request.planned_searches()));
        return Ok(());
    }

    let upstream = config.build_upstream(args.fixture.as_deref(), false)?;
    let cache = upstream.cache().clone();
    let bots = config.bot_filter(&args.ignore_bots)?;
    let report = ItemAggregator::new(Arc::new(upstream))
        .skip_bot_authored(bots)
        .collect(&request, now)
        .await
        .context("collecting activity")?;

    let stats = cache.stats();
    info!(fetches = stats.fetches, cache_hits = stats.hits, "activity run finished");
    println!("{}", render::activity_markdown(&report));
    Ok(())
}

async fn run_health(config: PulseConfig, args: HealthArgs) -> Result<()> {
    let now = Utc::now();
    let weeks = Week::recent_completed(args.weeks as usize, now);
    let store = config.open_store().await?;
    let upstream = config.build_upstream(args.fixture.as_deref(), args.refresh)?;
    let bots = config.bot_filter(&args.ignore_bots)?;
    let options = CollectOptions {
        workers: args.workers.unwrap_or(config.workers).max(1),
        sample_size: config.sample_size,
        refresh: args.refresh,
    };
    let collector = HealthCollector::with_cached_upstream(upstream, store.clone(), bots, options);

    if args.dry_run {
        let plan = collector.dry_run(&args.repos, &weeks).await?;
        println!("{}", render::dry_run(&plan));
        return Ok(());
    }

    let outcome = collector.run(&args.repos, &weeks, now).await;
    let summary = match &outcome {
        Ok(summary) => Some(summary),
        Err(err) => err.summary(),
    };
    if let Some(summary) = summary {
        println!("{}\n", render::run_summary(summary));
    }

    let metrics = selected_metrics(args.metrics);
    for repo in &args.repos {
        match store.find_repo_by_name(repo).await? {
            Some(stored) => {
                let snapshots = store
                    .history(stored.identity.external_id, weeks.len() as i64)
                    .await?;
                println!("{}\n", render::health_table(repo, &snapshots, &metrics));
            }
            None => warn!(repo = %repo, "no snapshots stored"),
        }
    }
    store.close().await;

    outcome.map(|_| ()).map_err(|err| {
        let context = if matches!(err.root_cause(), CollectError::RateLimited(_)) {
            "upstream rate limit reached"
        } else {
            "health collection aborted"
        };
        anyhow::Error::new(err).context(context)
    })
}

async fn run_history(config: PulseConfig, repo: String, limit: i64, metrics: Vec<HealthMetric>) -> Result<()> {
    let store = config.open_store().await?;
    let stored = store
        .find_repo_by_name(&repo)
        .await?
        .with_context(|| format!("no stored snapshots for {repo}"))?;
    let snapshots = store
        .history(stored.identity.external_id, limit.max(1))
        .await?;
    println!("{}", render::health_table(&repo, &snapshots, &selected_metrics(metrics)));
    store.close().await;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let config = PulseConfig::from_env();

    match cli.command {
        Commands::Activity(args) => run_activity(config, args).await?,
        Commands::Health(args) => run_health(config, args).await?,
        Commands::History {
            repo,
            limit,
            metrics,
        } => run_history(config, repo, limit, metrics).await?,
        Commands::Migrate => {
            let store = config.open_store().await?;
            let version = store.schema_version().await?;
            println!(
                "store ready: path={} schema_version={version}",
                config.db_path.display()
            );
            store.close().await;
        }
    }

    Ok(())
}
