use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    routing::get,
    Json, Router,
};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use valuegap_core::domain::valuation::{
    intrinsic_value, safety_margin, MetricRecord, TickerValuation, TreasuryInfo,
};
use valuegap_core::scrape::naver::NaverClient;
use valuegap_core::scrape::MetricSource;
use valuegap_core::storage::{JsonSnapshotStore, SnapshotStore};
use valuegap_core::universe::{self, UniverseCache, UniverseEntry};

const DEFAULT_LIST_LIMIT: usize = 30;

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

    let state = AppState {
        store: JsonSnapshotStore::new(settings.snapshot_path()),
        universe: Arc::new(UniverseCache::from_settings(&settings)?),
        source: Arc::new(NaverClient::from_settings(&settings)?),
    };

    let app = Router::new()
        .route("/healthz", get(healthz))
        .route("/valuations", get(list_valuations))
        .route("/valuations/:code", get(get_valuation))
        .route("/search", get(search_listings))
        .route("/calculate/:code", get(calculate))
        .with_state(state)
        .layer(TraceLayer::new_for_http());

    let port: u16 = std::env::var("PORT")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(3000);
    let addr = std::net::SocketAddr::from(([0, 0, 0, 0], port));

    tracing::info!(%addr, "api listening");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}

async fn healthz() -> &'static str {
    "ok"
}

#[derive(Clone)]
struct AppState {
    store: JsonSnapshotStore,
    universe: Arc<UniverseCache>,
    source: Arc<NaverClient>,
}

#[derive(Debug, Deserialize)]
struct ListParams {
    limit: Option<usize>,
}

/// Top of the snapshot, already sorted by safety margin. An absent or
/// unreadable snapshot is an empty list, not an error: stale or missing
/// data always beats a 500 on the read side.
async fn list_valuations(
    State(state): State<AppState>,
    Query(params): Query<ListParams>,
) -> Json<Vec<TickerValuation>> {
    let mut entries = state.store.load();
    entries.truncate(params.limit.unwrap_or(DEFAULT_LIST_LIMIT));
    Json(entries)
}

async fn get_valuation(
    State(state): State<AppState>,
    Path(code): Path<String>,
) -> Result<Json<TickerValuation>, StatusCode> {
    state
        .store
        .load()
        .into_iter()
        .find(|e| e.code == code)
        .map(Json)
        .ok_or(StatusCode::NOT_FOUND)
}

#[derive(Debug, Deserialize)]
struct SearchParams {
    name: String,
}

async fn search_listings(
    State(state): State<AppState>,
    Query(params): Query<SearchParams>,
) -> Result<Json<Vec<UniverseEntry>>, StatusCode> {
    let needle = params.name.trim().to_lowercase();
    if needle.is_empty() {
        return Err(StatusCode::BAD_REQUEST);
    }

    let matches = state
        .universe
        .get(false)
        .await
        .into_iter()
        .filter(|e| e.name.to_lowercase().contains(&needle))
        .collect();
    Ok(Json(matches))
}

#[derive(Debug, Serialize)]
struct CalculateResponse {
    code: String,
    name: Option<String>,
    current_price: Option<Decimal>,
    intrinsic_value: Option<Decimal>,
    safety_margin: Option<Decimal>,
    treasury: TreasuryInfo,
    dividend_yield: Option<Decimal>,
    metrics: MetricRecord,
}

/// On-demand valuation of a single ticker, bypassing the snapshot.
async fn calculate(
    State(state): State<AppState>,
    Path(code): Path<String>,
) -> Result<Json<CalculateResponse>, StatusCode> {
    if !universe::is_listing_code(&code) {
        return Err(StatusCode::BAD_REQUEST);
    }

    let page = state.source.fetch_metrics(&code).await.map_err(|err| {
        sentry_anyhow::capture_anyhow(&err);
        tracing::warn!(ticker = %code, error = %err, "on-demand fetch failed");
        StatusCode::BAD_GATEWAY
    })?;
    let treasury = state.source.fetch_treasury(&code).await;

    let intrinsic = intrinsic_value(&page.metrics, &treasury);
    let margin = safety_margin(intrinsic, page.current_price);

    Ok(Json(CalculateResponse {
        code,
        name: page.name,
        current_price: page.current_price,
        intrinsic_value: intrinsic,
        safety_margin: margin,
        treasury,
        dividend_yield: page.dividend_yield,
        metrics: page.metrics,
    }))
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
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
