use crate::domain::valuation::{MetricRecord, TreasuryInfo};
use rust_decimal::Decimal;

pub mod naver;

/// One ticker's raw page data, before valuation.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StockPage {
    pub name: Option<String>,
    pub current_price: Option<Decimal>,
    pub dividend_yield: Option<Decimal>,
    pub metrics: MetricRecord,
}

#[async_trait::async_trait]
pub trait MetricSource: Send + Sync {
    fn source_name(&self) -> &'static str;

    /// Fetch the per-share metric history for one ticker. A non-success
    /// response on the primary page fails the whole ticker; individual
    /// fields inside a successful page degrade to `None` instead.
    async fn fetch_metrics(&self, code: &str) -> anyhow::Result<StockPage>;

    /// Treasury-stock lookup. Failure degrades to "no treasury stock"
    /// rather than failing the ticker.
    async fn fetch_treasury(&self, code: &str) -> TreasuryInfo;
}
