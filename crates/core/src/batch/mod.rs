use crate::domain::valuation::{intrinsic_value, safety_margin, TickerValuation};
use crate::scrape::MetricSource;
use crate::storage::SnapshotStore;
use crate::time::kr_market;
use crate::universe::UniverseEntry;
use anyhow::{Context, Result};
use chrono::FixedOffset;
use std::collections::HashMap;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct BatchOptions {
    /// Minimum elapsed time before a ticker is re-valued. Interactive
    /// deployments run with 1 hour, the periodic scheduler with up to 4;
    /// it is the same threshold either way.
    pub freshness: chrono::Duration,

    /// Persist the re-sorted snapshot after this many valued tickers, so a
    /// crash loses at most one checkpoint window of work.
    pub checkpoint_every: usize,

    /// Politeness delay between consecutive ticker fetches.
    pub req_delay: Duration,

    /// How many entries `BatchReport::top` carries back to direct callers.
    pub top_n: usize,

    /// Emit a progress log line every N processed tickers (0 disables).
    pub progress_every: usize,
}

impl Default for BatchOptions {
    fn default() -> Self {
        Self {
            freshness: chrono::Duration::hours(1),
            checkpoint_every: 10,
            req_delay: Duration::from_millis(300),
            top_n: 30,
            progress_every: 100,
        }
    }
}

impl BatchOptions {
    pub fn from_env() -> Self {
        let mut out = Self::default();

        if let Ok(s) = std::env::var("BATCH_FRESHNESS_HOURS") {
            if let Ok(n) = s.parse::<i64>() {
                out.freshness = chrono::Duration::hours(n);
            }
        }
        if let Ok(s) = std::env::var("BATCH_CHECKPOINT_EVERY") {
            if let Ok(n) = s.parse::<usize>() {
                out.checkpoint_every = n.max(1);
            }
        }
        if let Ok(s) = std::env::var("BATCH_REQ_DELAY_MS") {
            if let Ok(n) = s.parse::<u64>() {
                out.req_delay = Duration::from_millis(n);
            }
        }
        if let Ok(s) = std::env::var("BATCH_TOP_N") {
            if let Ok(n) = s.parse::<usize>() {
                out.top_n = n;
            }
        }
        if let Ok(s) = std::env::var("BATCH_PROGRESS_EVERY") {
            if let Ok(n) = s.parse::<usize>() {
                out.progress_every = n;
            }
        }

        out
    }
}

/// Typed per-run outcome totals, collected instead of scattering
/// catch-and-continue logging through the loop.
#[derive(Debug, Default)]
pub struct BatchReport {
    pub valued: usize,
    pub skipped: usize,
    pub failed: Vec<(String, String)>,
    pub top: Vec<TickerValuation>,
}

impl BatchReport {
    pub fn processed(&self) -> usize {
        self.valued + self.failed.len()
    }
}

/// Walks the universe in listing order, re-values stale tickers through the
/// metric source, and persists the snapshot incrementally. A single
/// ticker's failure never aborts the run; its previous record (if any) is
/// left untouched.
pub struct Orchestrator<S, M> {
    store: S,
    source: M,
    opts: BatchOptions,
    tz: FixedOffset,
}

impl<S: SnapshotStore, M: MetricSource> Orchestrator<S, M> {
    pub fn new(store: S, source: M, opts: BatchOptions) -> Result<Self> {
        let tz = kr_market::kst()?;
        Ok(Self {
            store,
            source,
            opts,
            tz,
        })
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub async fn run(&self, universe: &[UniverseEntry]) -> Result<BatchReport> {
        let mut report = BatchReport::default();

        if universe.is_empty() {
            tracing::info!(source = self.source.source_name(), "empty universe; nothing to do");
            return Ok(report);
        }

        let mut entries = self.store.load();
        let mut index: HashMap<String, usize> = entries
            .iter()
            .enumerate()
            .map(|(i, e)| (e.code.clone(), i))
            .collect();

        let total = universe.len();
        let mut since_checkpoint = 0usize;
        let mut fetched_any = false;

        for listing in universe {
            let now = chrono::Utc::now().with_timezone(&self.tz);
            if let Some(&i) = index.get(&listing.code) {
                if now.signed_duration_since(entries[i].last_updated) < self.opts.freshness {
                    report.skipped += 1;
                    continue;
                }
            }

            if fetched_any {
                tokio::time::sleep(self.opts.req_delay).await;
            }
            fetched_any = true;

            match self.value_one(listing).await {
                Ok(valuation) => {
                    upsert(&mut entries, &mut index, valuation);
                    report.valued += 1;
                    since_checkpoint += 1;

                    if since_checkpoint >= self.opts.checkpoint_every {
                        sort_by_safety_margin(&mut entries);
                        rebuild_index(&entries, &mut index);
                        if let Err(err) = self.store.save_atomic(&entries) {
                            tracing::warn!(
                                error = %err,
                                "checkpoint write failed; previous snapshot kept"
                            );
                        }
                        since_checkpoint = 0;
                    }
                }
                Err(err) => {
                    if report.failed.len() < 10 {
                        tracing::warn!(
                            ticker = %listing.code,
                            name = %listing.name,
                            error = %err,
                            "valuation failed; skipping ticker"
                        );
                    }
                    report.failed.push((listing.code.clone(), format!("{err:#}")));
                }
            }

            let n = report.processed();
            if self.opts.progress_every != 0 && n % self.opts.progress_every == 0 {
                tracing::info!(
                    processed = n,
                    total,
                    valued = report.valued,
                    skipped = report.skipped,
                    failures = report.failed.len(),
                    "batch progress"
                );
            }
        }

        sort_by_safety_margin(&mut entries);
        self.store
            .save_atomic(&entries)
            .context("final snapshot write failed")?;

        report.top = entries.iter().take(self.opts.top_n).cloned().collect();

        tracing::info!(
            total,
            valued = report.valued,
            skipped = report.skipped,
            failures = report.failed.len(),
            snapshot_len = entries.len(),
            "batch run complete"
        );

        Ok(report)
    }

    async fn value_one(&self, listing: &UniverseEntry) -> Result<TickerValuation> {
        let page = self.source.fetch_metrics(&listing.code).await?;
        let treasury = self.source.fetch_treasury(&listing.code).await;

        let Some(intrinsic) = intrinsic_value(&page.metrics, &treasury) else {
            anyhow::bail!("metric history incomplete; cannot value");
        };
        let margin = safety_margin(Some(intrinsic), page.current_price);

        Ok(TickerValuation {
            code: listing.code.clone(),
            name: page.name.unwrap_or_else(|| listing.name.clone()),
            current_price: page.current_price,
            intrinsic_value: Some(intrinsic),
            safety_margin: margin,
            treasury_ratio: treasury.ratio,
            dividend_yield: page.dividend_yield,
            last_updated: chrono::Utc::now().with_timezone(&self.tz),
        })
    }
}

fn upsert(
    entries: &mut Vec<TickerValuation>,
    index: &mut HashMap<String, usize>,
    valuation: TickerValuation,
) {
    match index.get(&valuation.code) {
        Some(&i) => entries[i] = valuation,
        None => {
            index.insert(valuation.code.clone(), entries.len());
            entries.push(valuation);
        }
    }
}

fn rebuild_index(entries: &[TickerValuation], index: &mut HashMap<String, usize>) {
    index.clear();
    for (i, e) in entries.iter().enumerate() {
        index.insert(e.code.clone(), i);
    }
}

/// Descending safety margin, entries without a margin last. The sort is
/// stable so repeated re-sorts keep unvalued entries in their original
/// relative order (and an unchanged snapshot re-serializes byte-for-byte).
pub fn sort_by_safety_margin(entries: &mut [TickerValuation]) {
    entries.sort_by(|a, b| match (a.safety_margin, b.safety_margin) {
        (Some(x), Some(y)) => y.cmp(&x),
        (Some(_), None) => std::cmp::Ordering::Less,
        (None, Some(_)) => std::cmp::Ordering::Greater,
        (None, None) => std::cmp::Ordering::Equal,
    });
}
