use crate::config::Settings;
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use encoding_rs::EUC_KR;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

const KOSPI_MASTER_ZIP: &str =
    "https://new.real.download.dws.co.kr/common/master/kospi_code.mst.zip";
const KOSDAQ_MASTER_ZIP: &str =
    "https://new.real.download.dws.co.kr/common/master/kosdaq_code.mst.zip";
const KONEX_MASTER_ZIP: &str =
    "https://new.real.download.dws.co.kr/common/master/konex_code.mst.zip";

const DEFAULT_MAX_AGE_HOURS: i64 = 24;

/// One listed instrument. The universe is refreshed wholesale, never merged.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UniverseEntry {
    pub code: String,
    pub name: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KrxMarket {
    Kospi,
    Kosdaq,
    Konex,
}

impl KrxMarket {
    fn master_url(&self) -> &'static str {
        match self {
            KrxMarket::Kospi => KOSPI_MASTER_ZIP,
            KrxMarket::Kosdaq => KOSDAQ_MASTER_ZIP,
            KrxMarket::Konex => KONEX_MASTER_ZIP,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct CacheFile {
    refreshed_at: DateTime<Utc>,
    entries: Vec<UniverseEntry>,
}

/// Ticker->name table for the full exchange, cached on disk and refreshed
/// at most once per `max_age`. Listing-provider failure is tolerated: the
/// stale cache (or an empty universe) is returned instead, and downstream
/// treats an empty universe as "nothing to do".
#[derive(Debug)]
pub struct UniverseCache {
    http: reqwest::Client,
    path: PathBuf,
    max_age: chrono::Duration,
    urls: Vec<String>,
}

impl UniverseCache {
    pub fn from_settings(settings: &Settings) -> Result<Self> {
        let markets = parse_markets(std::env::var("KRX_MARKETS").ok());
        let max_age_hours = std::env::var("UNIVERSE_MAX_AGE_HOURS")
            .ok()
            .and_then(|s| s.parse::<i64>().ok())
            .unwrap_or(DEFAULT_MAX_AGE_HOURS);

        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .context("failed to build universe http client")?;

        Ok(Self {
            http,
            path: settings.universe_cache_path(),
            max_age: chrono::Duration::hours(max_age_hours),
            urls: markets.iter().map(|m| m.master_url().to_string()).collect(),
        })
    }

    pub fn new(
        http: reqwest::Client,
        path: impl Into<PathBuf>,
        max_age: chrono::Duration,
        markets: &[KrxMarket],
    ) -> Self {
        Self {
            http,
            path: path.into(),
            max_age,
            urls: markets.iter().map(|m| m.master_url().to_string()).collect(),
        }
    }

    /// Override the master-file locations (mirrors, tests).
    pub fn with_urls(mut self, urls: Vec<String>) -> Self {
        self.urls = urls;
        self
    }

    /// Current universe. A fresh cache file is used as-is; otherwise the
    /// full listing is re-downloaded and the cache atomically replaced.
    pub async fn get(&self, force_refresh: bool) -> Vec<UniverseEntry> {
        let cached = load_cache(&self.path);

        if !force_refresh {
            if let Some(cache) = &cached {
                if is_fresh(cache, Utc::now(), self.max_age) {
                    return cache.entries.clone();
                }
            }
        }

        match self.fetch_listing().await {
            Ok(entries) => {
                let cache = CacheFile {
                    refreshed_at: Utc::now(),
                    entries,
                };
                if let Err(err) = write_cache(&self.path, &cache) {
                    tracing::warn!(
                        path = %self.path.display(),
                        error = %err,
                        "failed to persist universe cache"
                    );
                }
                cache.entries
            }
            Err(err) => {
                let stale = cached.map(|c| c.entries).unwrap_or_default();
                tracing::warn!(
                    error = %err,
                    stale_entries = stale.len(),
                    "universe refresh failed; continuing with stale cache"
                );
                stale
            }
        }
    }

    async fn fetch_listing(&self) -> Result<Vec<UniverseEntry>> {
        let mut out = Vec::new();
        for url in &self.urls {
            let res = self
                .http
                .get(url)
                .send()
                .await
                .context("master zip download failed")?;
            let status = res.status();
            let bytes = res.bytes().await.context("read master zip bytes failed")?;
            if !status.is_success() {
                anyhow::bail!("master zip HTTP {status} from {url}");
            }

            let buf = bytes.to_vec();
            let records = tokio::task::spawn_blocking(move || unzip_master(&buf))
                .await
                .context("join unzip task failed")??;
            out.extend(records);
        }
        Ok(out)
    }
}

pub fn is_listing_code(s: &str) -> bool {
    s.len() == 6 && s.bytes().all(|b| b.is_ascii_digit())
}

fn parse_markets(v: Option<String>) -> Vec<KrxMarket> {
    let Some(v) = v else {
        return vec![KrxMarket::Kospi, KrxMarket::Kosdaq];
    };
    let mut out = Vec::new();
    for part in v.split(',') {
        match part.trim().to_ascii_uppercase().as_str() {
            "KOSPI" => out.push(KrxMarket::Kospi),
            "KOSDAQ" => out.push(KrxMarket::Kosdaq),
            "KONEX" => out.push(KrxMarket::Konex),
            _ => {}
        }
    }
    if out.is_empty() {
        out.push(KrxMarket::Kospi);
        out.push(KrxMarket::Kosdaq);
    }
    out
}

fn is_fresh(cache: &CacheFile, now: DateTime<Utc>, max_age: chrono::Duration) -> bool {
    now.signed_duration_since(cache.refreshed_at) < max_age
}

fn load_cache(path: &Path) -> Option<CacheFile> {
    let bytes = std::fs::read(path).ok()?;
    match serde_json::from_slice(&bytes) {
        Ok(cache) => Some(cache),
        Err(err) => {
            tracing::warn!(path = %path.display(), error = %err, "universe cache unreadable; ignoring");
            None
        }
    }
}

// Write-then-rename so a concurrent reader never sees a partial file.
fn write_cache(path: &Path, cache: &CacheFile) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("create cache dir {}", parent.display()))?;
    }
    let tmp = path.with_extension("json.tmp");
    let bytes = serde_json::to_vec_pretty(cache).context("serialize universe cache")?;
    std::fs::write(&tmp, bytes).with_context(|| format!("write {}", tmp.display()))?;
    std::fs::rename(&tmp, path).with_context(|| format!("rename over {}", path.display()))?;
    Ok(())
}

fn unzip_master(zip_bytes: &[u8]) -> Result<Vec<UniverseEntry>> {
    use std::io::{Cursor, Read};

    let mut zip = zip::ZipArchive::new(Cursor::new(zip_bytes)).context("open zip archive failed")?;
    anyhow::ensure!(zip.len() >= 1, "zip has no entries");

    // Pick the .mst entry; some archives carry metadata files alongside.
    let mut mst_idx = 0;
    for i in 0..zip.len() {
        let name = zip.by_index(i).context("open zip entry failed")?.name().to_string();
        if name.to_ascii_lowercase().ends_with(".mst") {
            mst_idx = i;
            break;
        }
    }

    let mut file = zip.by_index(mst_idx).context("open zip entry failed")?;
    let mut buf = Vec::new();
    file.read_to_end(&mut buf).context("read zip entry failed")?;

    Ok(parse_master_records(&buf))
}

/// Master-file lines are fixed-width EUC-KR records: a 6-digit code, a
/// 12-byte ISIN, the instrument name, then an `ST...` market-class marker.
fn parse_master_records(buf: &[u8]) -> Vec<UniverseEntry> {
    buf.split(|b| *b == b'\n')
        .filter_map(|line| {
            let line = line.strip_suffix(b"\r").unwrap_or(line);
            parse_master_line(line)
        })
        .collect()
}

fn parse_master_line(line: &[u8]) -> Option<UniverseEntry> {
    if line.len() < 6 {
        return None;
    }

    let code = std::str::from_utf8(&line[0..6]).ok()?;
    if !is_listing_code(code) {
        return None;
    }

    let mut i = 6;
    while i < line.len() && line[i].is_ascii_whitespace() {
        i += 1;
    }

    // The ISIN is a fixed 12 bytes and may butt directly against the name.
    let name_start = if line.len() >= i + 12 {
        i + 12
    } else {
        while i < line.len() && !line[i].is_ascii_whitespace() {
            i += 1;
        }
        i
    };
    if name_start >= line.len() {
        return None;
    }

    let after_name = &line[name_start..];
    let name_end = market_marker_pos(after_name).unwrap_or(after_name.len());
    let name = decode_euc_kr(&after_name[..name_end]);
    if name.is_empty() {
        return None;
    }

    Some(UniverseEntry {
        code: code.to_string(),
        name,
    })
}

fn market_marker_pos(bytes: &[u8]) -> Option<usize> {
    (0..bytes.len().saturating_sub(1)).find(|&i| {
        bytes[i] == b'S'
            && bytes[i + 1] == b'T'
            && (i == 0 || bytes[i - 1].is_ascii_whitespace())
    })
}

fn decode_euc_kr(bytes: &[u8]) -> String {
    let trimmed: Vec<u8> = bytes
        .iter()
        .copied()
        .skip_while(|b| b.is_ascii_whitespace() || *b == 0)
        .collect();
    let end = trimmed
        .iter()
        .rposition(|b| !b.is_ascii_whitespace() && *b != 0)
        .map(|p| p + 1)
        .unwrap_or(0);

    let (cow, _, _) = EUC_KR.decode(&trimmed[..end]);
    cow.trim().to_string()
}
