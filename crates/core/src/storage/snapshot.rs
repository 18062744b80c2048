use crate::domain::valuation::TickerValuation;
use anyhow::{Context, Result};
use std::path::{Path, PathBuf};

/// Storage seam for the valuation snapshot. The batch loop talks to this
/// trait only, so the file-as-database can be swapped for an embedded store
/// without touching the orchestrator.
pub trait SnapshotStore: Send + Sync {
    /// Missing or corrupt data is a cold start, not an error.
    fn load(&self) -> Vec<TickerValuation>;

    /// Persist the complete snapshot. A concurrent reader must never
    /// observe a truncated or syntactically invalid file.
    fn save_atomic(&self, entries: &[TickerValuation]) -> Result<()>;
}

/// The on-disk artifact of record: one JSON array of valuations, fully
/// rewritten (temp + rename) on every save.
#[derive(Debug, Clone)]
pub struct JsonSnapshotStore {
    path: PathBuf,
}

impl JsonSnapshotStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl SnapshotStore for JsonSnapshotStore {
    fn load(&self) -> Vec<TickerValuation> {
        let bytes = match std::fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(_) => return Vec::new(),
        };

        match serde_json::from_slice(&bytes) {
            Ok(entries) => entries,
            Err(err) => {
                tracing::warn!(
                    path = %self.path.display(),
                    error = %err,
                    "snapshot file unreadable; starting cold"
                );
                Vec::new()
            }
        }
    }

    fn save_atomic(&self, entries: &[TickerValuation]) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("create snapshot dir {}", parent.display()))?;
        }

        let bytes = serde_json::to_vec_pretty(entries).context("serialize snapshot")?;

        // Temp file in the same directory so the rename cannot cross a
        // filesystem boundary.
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, &bytes).with_context(|| format!("write {}", tmp.display()))?;
        std::fs::rename(&tmp, &self.path)
            .with_context(|| format!("rename over {}", self.path.display()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::time::kr_market::kst_now;
    use rust_decimal_macros::dec;

    fn valuation(code: &str) -> TickerValuation {
        TickerValuation {
            code: code.to_string(),
            name: format!("Stock {code}"),
            current_price: Some(dec!(100)),
            intrinsic_value: Some(dec!(150)),
            safety_margin: Some(dec!(50)),
            treasury_ratio: dec!(0),
            dividend_yield: None,
            last_updated: kst_now().unwrap(),
        }
    }

    #[test]
    fn round_trips_a_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonSnapshotStore::new(dir.path().join("valuations.json"));

        let entries = vec![valuation("005930"), valuation("000660")];
        store.save_atomic(&entries).unwrap();

        let loaded = store.load();
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded[0].code, "005930");
        assert_eq!(loaded[0].safety_margin, Some(dec!(50)));
    }

    #[test]
    fn missing_file_is_a_cold_start() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonSnapshotStore::new(dir.path().join("nope.json"));
        assert!(store.load().is_empty());
    }

    #[test]
    fn corrupt_file_is_a_cold_start() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("valuations.json");
        std::fs::write(&path, b"[{\"code\": \"0059").unwrap();

        let store = JsonSnapshotStore::new(&path);
        assert!(store.load().is_empty());
    }

    #[test]
    fn save_replaces_rather_than_appends() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonSnapshotStore::new(dir.path().join("valuations.json"));

        store
            .save_atomic(&[valuation("005930"), valuation("000660")])
            .unwrap();
        store.save_atomic(&[valuation("035720")]).unwrap();

        let loaded = store.load();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].code, "035720");

        // No stray temp file left behind.
        assert!(!dir.path().join("valuations.json.tmp").exists());
    }
}
