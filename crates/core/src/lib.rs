pub mod batch;
pub mod domain;
pub mod scrape;
pub mod storage;
pub mod time;
pub mod universe;

pub mod config {
    use std::path::PathBuf;

    #[derive(Debug, Clone)]
    pub struct Settings {
        pub data_dir: Option<String>,
        pub sentry_dsn: Option<String>,
        pub naver_base_url: Option<String>,
        pub wisereport_base_url: Option<String>,
    }

    impl Settings {
        pub fn from_env() -> anyhow::Result<Self> {
            Ok(Self {
                data_dir: std::env::var("DATA_DIR").ok(),
                sentry_dsn: std::env::var("SENTRY_DSN").ok(),
                naver_base_url: std::env::var("NAVER_BASE_URL").ok(),
                wisereport_base_url: std::env::var("WISEREPORT_BASE_URL").ok(),
            })
        }

        pub fn storage_root(&self) -> PathBuf {
            PathBuf::from(self.data_dir.as_deref().unwrap_or("data"))
        }

        pub fn snapshot_path(&self) -> PathBuf {
            self.storage_root().join("valuations.json")
        }

        pub fn universe_cache_path(&self) -> PathBuf {
            self.storage_root().join("krx_universe.json")
        }
    }
}
