use clap::Parser;
use std::time::Duration;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use valuegap_core::batch::{BatchOptions, BatchReport, Orchestrator};
use valuegap_core::scrape::naver::NaverClient;
use valuegap_core::storage::JsonSnapshotStore;
use valuegap_core::universe::UniverseCache;

const DEFAULT_INTERVAL_SECS: u64 = 4 * 3600;

#[derive(Debug, Parser)]
#[command(name = "valuegap_worker")]
struct Args {
    /// Run one batch iteration and exit instead of looping forever.
    #[arg(long)]
    once: bool,

    /// Resolve the universe and exit without fetching any metrics.
    #[arg(long)]
    dry_run: bool,

    /// Refresh the universe cache even if it is still fresh.
    #[arg(long)]
    refresh_universe: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let settings = valuegap_core::config::Settings::from_env()?;
    let _sentry_guard = init_sentry(&settings);

    tracing_subscriber::registry()
        .with(EnvFilter::from_default_env())
        .with(tracing_subscriber::fmt::layer())
        .with(sentry_tracing::layer())
        .init();

    let args = Args::parse();

    let universe = UniverseCache::from_settings(&settings)?;
    let source = NaverClient::from_settings(&settings)?;
    let store = JsonSnapshotStore::new(settings.snapshot_path());
    let orchestrator = Orchestrator::new(store, source, BatchOptions::from_env())?;

    if args.dry_run {
        let entries = universe.get(args.refresh_universe).await;
        tracing::info!(
            universe_len = entries.len(),
            dry_run = true,
            "universe resolved (dry-run)"
        );
        return Ok(());
    }

    let interval = batch_interval();
    let mut force_refresh = args.refresh_universe;

    // The loop is the process: a failed iteration is reported and the next
    // one waits its turn, it never takes the worker down.
    loop {
        match run_iteration(&universe, &orchestrator, force_refresh).await {
            Ok(report) => {
                tracing::info!(
                    valued = report.valued,
                    skipped = report.skipped,
                    failures = report.failed.len(),
                    "batch iteration finished"
                );
            }
            Err(err) => {
                sentry_anyhow::capture_anyhow(&err);
                tracing::error!(error = %err, "batch iteration failed");
            }
        }
        force_refresh = false;

        if args.once {
            return Ok(());
        }

        tracing::info!(sleep_secs = interval.as_secs(), "sleeping until next batch run");
        tokio::time::sleep(interval).await;
    }
}

async fn run_iteration(
    universe: &UniverseCache,
    orchestrator: &Orchestrator<JsonSnapshotStore, NaverClient>,
    force_refresh: bool,
) -> anyhow::Result<BatchReport> {
    let entries = universe.get(force_refresh).await;
    orchestrator.run(&entries).await
}

fn batch_interval() -> Duration {
    let secs = std::env::var("WORKER_INTERVAL_SECS")
        .ok()
        .and_then(|s| s.parse::<u64>().ok())
        .unwrap_or(DEFAULT_INTERVAL_SECS);
    Duration::from_secs(secs)
}

fn init_sentry(settings: &valuegap_core::config::Settings) -> Option<sentry::ClientInitGuard> {
    let dsn = settings.sentry_dsn.as_deref()?;
    Some(sentry::init((
        dsn,
        sentry::ClientOptions {
            release: sentry::release_name!(),
            ..Default::default()
        },
    )))
}
