use crate::config::Settings;
use crate::domain::valuation::{MetricRecord, TreasuryInfo};
use crate::scrape::{MetricSource, StockPage};
use anyhow::{Context, Result};
use reqwest::StatusCode;
use rust_decimal::Decimal;
use scraper::{Html, Selector};
use std::time::Duration;

const DEFAULT_FINANCE_BASE_URL: &str = "https://finance.naver.com";
const DEFAULT_WISEREPORT_BASE_URL: &str = "https://navercomp.wisereport.co.kr";

const DEFAULT_REQ_DELAY_MS: u64 = 300;
const DEFAULT_RETRIES: u32 = 3;

// The summary table carries one metric per row at a fixed position; the
// three value cells are the three fiscal periods, oldest first.
const EPS_ROW: usize = 10;
const BPS_ROW: usize = 12;
const PBR_ROW: usize = 13;

/// Scraping client for the Naver finance portal. The portal is an
/// unreliable external contract: every field is extracted best-effort, and
/// only a non-success status on the primary page fails a ticker outright.
#[derive(Debug)]
pub struct NaverClient {
    http: reqwest::Client,
    finance_base_url: String,
    wisereport_base_url: String,
    req_delay: Duration,
    retries: u32,
}

impl NaverClient {
    pub fn from_settings(settings: &Settings) -> Result<Self> {
        let finance_base_url = settings
            .naver_base_url
            .clone()
            .unwrap_or_else(|| DEFAULT_FINANCE_BASE_URL.to_string());
        let wisereport_base_url = settings
            .wisereport_base_url
            .clone()
            .unwrap_or_else(|| DEFAULT_WISEREPORT_BASE_URL.to_string());

        let req_delay_ms = std::env::var("NAVER_REQ_DELAY_MS")
            .ok()
            .and_then(|s| s.parse::<u64>().ok())
            .unwrap_or(DEFAULT_REQ_DELAY_MS);
        let retries = std::env::var("NAVER_RETRIES")
            .ok()
            .and_then(|s| s.parse::<u32>().ok())
            .unwrap_or(DEFAULT_RETRIES);

        // The portal rejects clients without a browser-looking user agent.
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .user_agent("Mozilla/5.0")
            .build()
            .context("failed to build naver http client")?;

        Ok(Self {
            http,
            finance_base_url,
            wisereport_base_url,
            req_delay: Duration::from_millis(req_delay_ms),
            retries,
        })
    }

    async fn fetch_main_page(&self, code: &str) -> Result<String> {
        let url = format!(
            "{}/item/main.naver?code={code}",
            self.finance_base_url.trim_end_matches('/')
        );

        let mut attempt: u32 = 0;
        loop {
            attempt += 1;

            let res = match self.http.get(&url).send().await {
                Ok(res) => res,
                Err(err) => {
                    if attempt >= self.retries {
                        return Err(err).context("naver main page request failed");
                    }
                    let backoff = Duration::from_secs(1 << (attempt - 1));
                    tracing::warn!(
                        attempt,
                        ?backoff,
                        ticker = %code,
                        error = %err,
                        "naver main page request failed; retrying"
                    );
                    tokio::time::sleep(backoff).await;
                    continue;
                }
            };

            let status = res.status();
            if !status.is_success() {
                let retryable = status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error();
                if retryable && attempt < self.retries {
                    let backoff = Duration::from_secs(1 << (attempt - 1));
                    tracing::warn!(
                        attempt,
                        ?backoff,
                        ticker = %code,
                        http_status = %status,
                        "naver main page HTTP error; retrying"
                    );
                    tokio::time::sleep(backoff).await;
                    continue;
                }
                anyhow::bail!("naver main page HTTP {status} for ticker {code}");
            }

            return res.text().await.context("failed to read naver main page");
        }
    }

    async fn try_fetch_treasury(&self, code: &str) -> Result<Option<TreasuryInfo>> {
        let url = format!(
            "{}/v2/company/c1010001.aspx?cmp_cd={code}",
            self.wisereport_base_url.trim_end_matches('/')
        );

        let res = self
            .http
            .get(&url)
            .header("Referer", DEFAULT_FINANCE_BASE_URL)
            .send()
            .await
            .context("wisereport request failed")?;

        let status = res.status();
        if !status.is_success() {
            anyhow::bail!("wisereport HTTP {status} for ticker {code}");
        }

        let body = res
            .text()
            .await
            .context("failed to read wisereport response")?;
        Ok(parse_treasury_tables(&body))
    }
}

#[async_trait::async_trait]
impl MetricSource for NaverClient {
    fn source_name(&self) -> &'static str {
        "naver_finance"
    }

    async fn fetch_metrics(&self, code: &str) -> Result<StockPage> {
        let body = self.fetch_main_page(code).await?;
        Ok(parse_main_page(&body))
    }

    async fn fetch_treasury(&self, code: &str) -> TreasuryInfo {
        // Politeness delay between the two page hits for the same ticker.
        tokio::time::sleep(self.req_delay).await;

        match self.try_fetch_treasury(code).await {
            Ok(Some(info)) => info,
            Ok(None) => TreasuryInfo::default(),
            Err(err) => {
                tracing::debug!(ticker = %code, error = %err, "treasury lookup failed; assuming none");
                TreasuryInfo::default()
            }
        }
    }
}

/// Extract name, price, dividend yield and the 3x3 metric table from the
/// ticker main page. Every field is independently fallible.
fn parse_main_page(body: &str) -> StockPage {
    let doc = Html::parse_document(body);

    let name = select_text(&doc, "div.wrap_company h2 a").filter(|s| !s.is_empty());

    // First cell of the daily quote table.
    let current_price = select_text(
        &doc,
        "#content > div:nth-of-type(6) > table > tbody > tr:nth-of-type(1) > td:nth-of-type(1)",
    )
    .as_deref()
    .and_then(parse_decimal_cell);

    let dividend_yield = select_text(&doc, "em#_dvr")
        .as_deref()
        .and_then(parse_decimal_cell);

    let mut metrics = MetricRecord::default();
    for (period, slot) in metrics.periods.iter_mut().enumerate() {
        slot.eps = metric_cell(&doc, EPS_ROW, period + 1);
        slot.bps = metric_cell(&doc, BPS_ROW, period + 1);
        slot.pbr = metric_cell(&doc, PBR_ROW, period + 1);
    }

    StockPage {
        name,
        current_price,
        dividend_yield,
        metrics,
    }
}

fn metric_cell(doc: &Html, row: usize, col: usize) -> Option<Decimal> {
    let selector = format!(
        "#content > div:nth-of-type(5) > div:nth-of-type(1) > table > tbody > \
         tr:nth-of-type({row}) > td:nth-of-type({col})"
    );
    select_text(doc, &selector)
        .as_deref()
        .and_then(parse_decimal_cell)
}

fn select_text(doc: &Html, selector: &str) -> Option<String> {
    let sel = Selector::parse(selector).ok()?;
    doc.select(&sel)
        .next()
        .map(|el| el.text().collect::<String>().trim().to_string())
}

/// Find the treasury-stock row by label rather than position: the ownership
/// table moves around, but the row label does not.
fn parse_treasury_tables(body: &str) -> Option<TreasuryInfo> {
    let doc = Html::parse_document(body);
    let row_sel = Selector::parse("tr").ok()?;
    let cell_sel = Selector::parse("th, td").ok()?;

    for row in doc.select(&row_sel) {
        let cells: Vec<String> = row
            .select(&cell_sel)
            .map(|c| c.text().collect::<String>().trim().to_string())
            .collect();

        let Some(label) = cells.first() else { continue };
        if !label.contains("자사주") {
            continue;
        }

        let shares = cells.get(1).and_then(|s| parse_decimal_cell(s))?;
        let ratio = cells.get(2).and_then(|s| parse_decimal_cell(s))?;
        return Some(TreasuryInfo { shares, ratio });
    }

    None
}

/// Numeric cell parsing: strip thousands separators and percent signs, and
/// normalize the portal's non-ASCII minus (U+2212) to `-`. Values with a
/// decimal point and plain integers both land in `Decimal`; anything else
/// is `None`.
fn parse_decimal_cell(text: &str) -> Option<Decimal> {
    let cleaned = text
        .trim()
        .replace(',', "")
        .replace('%', "")
        .replace('−', "-");
    if cleaned.is_empty() || cleaned == "-" {
        return None;
    }
    cleaned.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn metric_row(values: [&str; 3]) -> String {
        format!(
            "<tr><td>{}</td><td>{}</td><td>{}</td></tr>",
            values[0], values[1], values[2]
        )
    }

    fn main_page_fixture(price: &str, eps: [&str; 3], bps: [&str; 3], pbr: [&str; 3]) -> String {
        let filler_row = "<tr><td></td><td></td><td></td></tr>";
        let mut summary_rows = String::new();
        for row in 1..=13 {
            summary_rows.push_str(&match row {
                10 => metric_row(eps),
                12 => metric_row(bps),
                13 => metric_row(pbr),
                _ => filler_row.to_string(),
            });
        }

        format!(
            r#"<html><body>
            <div id="middle"><div class="wrap_company"><h2><a>샘플전자</a></h2></div></div>
            <div id="content">
              <div></div><div></div><div></div><div></div>
              <div><div><table><tbody>{summary_rows}</tbody></table></div></div>
              <div><table><tbody><tr><td>{price}</td><td>foo</td></tr></tbody></table></div>
              <em id="_dvr">2.45</em>
            </div>
            </body></html>"#
        )
    }

    #[test]
    fn parses_all_fixed_position_fields() {
        let html = main_page_fixture(
            "71,900",
            ["1,000", "1,200", "1,500"],
            ["18,000", "19,000", "20,000"],
            ["1.1", "1.2", "1.3"],
        );
        let page = parse_main_page(&html);

        assert_eq!(page.name.as_deref(), Some("샘플전자"));
        assert_eq!(page.current_price, Some(dec!(71900)));
        assert_eq!(page.dividend_yield, Some(dec!(2.45)));

        assert_eq!(page.metrics.periods[0].eps, Some(dec!(1000)));
        assert_eq!(page.metrics.periods[1].eps, Some(dec!(1200)));
        assert_eq!(page.metrics.periods[2].eps, Some(dec!(1500)));
        assert_eq!(page.metrics.periods[2].bps, Some(dec!(20000)));
        assert_eq!(page.metrics.periods[0].pbr, Some(dec!(1.1)));
    }

    #[test]
    fn normalizes_unicode_minus_in_price() {
        let html = main_page_fixture(
            "\u{2212}1,234",
            ["1", "2", "3"],
            ["1", "2", "3"],
            ["1", "1", "1"],
        );
        let page = parse_main_page(&html);
        assert_eq!(page.current_price, Some(dec!(-1234)));
    }

    #[test]
    fn unparseable_cells_degrade_to_none_individually() {
        let html = main_page_fixture(
            "71,900",
            ["N/A", "1,200", "1,500"],
            ["18,000", "", "20,000"],
            ["1.1", "1.2", "1.3"],
        );
        let page = parse_main_page(&html);

        assert_eq!(page.metrics.periods[0].eps, None);
        assert_eq!(page.metrics.periods[1].eps, Some(dec!(1200)));
        assert_eq!(page.metrics.periods[1].bps, None);
        assert_eq!(page.metrics.periods[2].bps, Some(dec!(20000)));
    }

    #[test]
    fn missing_summary_table_yields_empty_metrics() {
        let page = parse_main_page("<html><body><div id=\"content\"></div></body></html>");
        assert_eq!(page.name, None);
        assert_eq!(page.current_price, None);
        assert_eq!(page.metrics, MetricRecord::default());
    }

    #[test]
    fn treasury_row_is_found_by_label() {
        let html = r#"<html><body>
            <table><tbody>
              <tr><th>최대주주</th><td>10,000,000</td><td>45.10</td></tr>
              <tr><th>자사주</th><td>1,234,567</td><td>5.67%</td></tr>
            </tbody></table>
            </body></html>"#;

        let info = parse_treasury_tables(html).unwrap();
        assert_eq!(info.shares, dec!(1234567));
        assert_eq!(info.ratio, dec!(5.67));
    }

    #[test]
    fn treasury_without_label_row_is_none() {
        let html = r#"<table><tr><td>최대주주</td><td>1</td><td>2</td></tr></table>"#;
        assert_eq!(parse_treasury_tables(html), None);
    }

    #[test]
    fn treasury_with_unparseable_cells_is_none() {
        let html = r#"<table><tr><td>자사주</td><td>n/a</td><td>n/a</td></tr></table>"#;
        assert_eq!(parse_treasury_tables(html), None);
    }

    #[test]
    fn decimal_cell_parsing_rules() {
        assert_eq!(parse_decimal_cell("1,234"), Some(dec!(1234)));
        assert_eq!(parse_decimal_cell("5.67%"), Some(dec!(5.67)));
        assert_eq!(parse_decimal_cell(" 12.5 "), Some(dec!(12.5)));
        assert_eq!(parse_decimal_cell("\u{2212}0.5"), Some(dec!(-0.5)));
        assert_eq!(parse_decimal_cell(""), None);
        assert_eq!(parse_decimal_cell("-"), None);
        assert_eq!(parse_decimal_cell("N/A"), None);
    }

    #[tokio::test]
    #[ignore] // hits the live portal
    async fn fetches_samsung_live() {
        let settings = crate::config::Settings::from_env().unwrap();
        let client = NaverClient::from_settings(&settings).unwrap();

        let page = client.fetch_metrics("005930").await.unwrap();
        assert!(page.name.is_some());
        assert!(page.current_price.is_some());
    }
}
