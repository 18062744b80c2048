use chrono::{DateTime, FixedOffset};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// One fiscal period's per-share metrics as extracted from the finance
/// portal. Any field may be missing when the source table cell is absent or
/// unparseable; a missing value must propagate as "cannot value", never as
/// zero.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct PeriodMetrics {
    pub pbr: Option<Decimal>,
    pub eps: Option<Decimal>,
    pub bps: Option<Decimal>,
}

/// Exactly three fiscal periods, ordered oldest to newest.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct MetricRecord {
    pub periods: [PeriodMetrics; 3],
}

/// Treasury-stock holdings. Zero is the valid "no treasury stock" state,
/// not an error; `ratio` is a percentage of outstanding shares.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct TreasuryInfo {
    pub shares: Decimal,
    pub ratio: Decimal,
}

/// One ticker's valuation as persisted in the result snapshot. Identity key
/// is `code`; records are overwritten whole on re-valuation and never
/// deleted (delisted codes linger).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TickerValuation {
    pub code: String,
    pub name: String,
    pub current_price: Option<Decimal>,
    pub intrinsic_value: Option<Decimal>,
    pub safety_margin: Option<Decimal>,
    pub treasury_ratio: Decimal,
    pub dividend_yield: Option<Decimal>,
    pub last_updated: DateTime<FixedOffset>,
}

/// Intrinsic value per share:
///
///   weighted_eps = (eps[newest]*3 + eps[middle]*2 + eps[oldest]*1) / 6
///   base         = (weighted_eps*10 + bps[newest]) / 2
///   value        = base * 100 / (100 - treasury.ratio)   when ratio > 0
///
/// All three EPS and all three BPS values must be present; a partial row
/// means the source table was broken, so the answer is `None` rather than a
/// number computed from garbage. `ratio >= 100` is a data error (the float
/// adjustment would divide by zero or go negative) and also yields `None`.
pub fn intrinsic_value(metrics: &MetricRecord, treasury: &TreasuryInfo) -> Option<Decimal> {
    let [oldest, middle, newest] = metrics.periods;

    let weighted_eps = (newest.eps? * Decimal::from(3)
        + middle.eps? * Decimal::from(2)
        + oldest.eps?)
        / Decimal::from(6);

    // Only the newest BPS enters the formula, but the older two must have
    // been extracted as well.
    oldest.bps?;
    middle.bps?;
    let base = (weighted_eps * Decimal::from(10) + newest.bps?) / Decimal::from(2);

    if treasury.ratio >= Decimal::ONE_HUNDRED {
        return None;
    }
    if treasury.ratio > Decimal::ZERO {
        return Some(base * (Decimal::ONE_HUNDRED / (Decimal::ONE_HUNDRED - treasury.ratio)));
    }
    Some(base)
}

/// Percentage gap between intrinsic value and market price. `None` when
/// either operand is missing or the price is zero.
pub fn safety_margin(intrinsic: Option<Decimal>, price: Option<Decimal>) -> Option<Decimal> {
    let intrinsic = intrinsic?;
    let price = price?;
    if price.is_zero() {
        return None;
    }
    Some((intrinsic - price) / price * Decimal::ONE_HUNDRED)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn full_record(eps: [Decimal; 3], bps: [Decimal; 3]) -> MetricRecord {
        let mut periods = [PeriodMetrics::default(); 3];
        for i in 0..3 {
            periods[i].eps = Some(eps[i]);
            periods[i].bps = Some(bps[i]);
        }
        MetricRecord { periods }
    }

    fn assert_close(actual: Decimal, expected: Decimal) {
        assert!(
            (actual - expected).abs() < dec!(0.000001),
            "expected ~{expected}, got {actual}"
        );
    }

    #[test]
    fn weights_eps_by_recency_and_averages_with_book_value() {
        let metrics = full_record(
            [dec!(10), dec!(12), dec!(15)],
            [dec!(180), dec!(190), dec!(200)],
        );

        // weighted_eps = (15*3 + 12*2 + 10)/6 = 79/6
        // value = (790/6 + 200)/2 = 165.8333...
        let v = intrinsic_value(&metrics, &TreasuryInfo::default()).unwrap();
        assert_close(v, dec!(165.833333333333));
    }

    #[test]
    fn treasury_ratio_scales_up_by_outstanding_float() {
        let metrics = full_record(
            [dec!(10), dec!(12), dec!(15)],
            [dec!(180), dec!(190), dec!(200)],
        );
        let treasury = TreasuryInfo {
            shares: dec!(1000),
            ratio: dec!(20),
        };

        // base * 100/80
        let v = intrinsic_value(&metrics, &treasury).unwrap();
        assert_close(v, dec!(207.291666666666));
    }

    #[test]
    fn zero_treasury_ratio_leaves_value_unadjusted() {
        let metrics = full_record([dec!(5), dec!(5), dec!(5)], [dec!(100), dec!(100), dec!(100)]);
        let unadjusted = intrinsic_value(&metrics, &TreasuryInfo::default()).unwrap();
        let zero_ratio = intrinsic_value(
            &metrics,
            &TreasuryInfo {
                shares: dec!(999),
                ratio: Decimal::ZERO,
            },
        )
        .unwrap();
        assert_eq!(unadjusted, zero_ratio);
    }

    #[test]
    fn any_missing_eps_or_bps_yields_none() {
        let base = full_record(
            [dec!(10), dec!(12), dec!(15)],
            [dec!(180), dec!(190), dec!(200)],
        );

        for i in 0..3 {
            let mut m = base;
            m.periods[i].eps = None;
            assert_eq!(intrinsic_value(&m, &TreasuryInfo::default()), None);

            let mut m = base;
            m.periods[i].bps = None;
            assert_eq!(intrinsic_value(&m, &TreasuryInfo::default()), None);
        }
    }

    #[test]
    fn missing_pbr_does_not_block_valuation() {
        let mut metrics = full_record(
            [dec!(10), dec!(12), dec!(15)],
            [dec!(180), dec!(190), dec!(200)],
        );
        for p in &mut metrics.periods {
            p.pbr = None;
        }
        assert!(intrinsic_value(&metrics, &TreasuryInfo::default()).is_some());
    }

    #[test]
    fn ratio_at_or_above_100_is_a_data_error() {
        let metrics = full_record(
            [dec!(10), dec!(12), dec!(15)],
            [dec!(180), dec!(190), dec!(200)],
        );
        for ratio in [dec!(100), dec!(150)] {
            let treasury = TreasuryInfo {
                shares: dec!(1),
                ratio,
            };
            assert_eq!(intrinsic_value(&metrics, &treasury), None);
        }
    }

    #[test]
    fn safety_margin_requires_both_operands_and_nonzero_price() {
        assert_eq!(safety_margin(None, Some(dec!(100))), None);
        assert_eq!(safety_margin(Some(dec!(150)), None), None);
        assert_eq!(safety_margin(Some(dec!(150)), Some(Decimal::ZERO)), None);

        let m = safety_margin(Some(dec!(150)), Some(dec!(100))).unwrap();
        assert_eq!(m, dec!(50));

        let m = safety_margin(Some(dec!(80)), Some(dec!(100))).unwrap();
        assert_eq!(m, dec!(-20));
    }
}
