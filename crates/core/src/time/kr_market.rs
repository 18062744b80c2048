use anyhow::Context;
use chrono::{DateTime, FixedOffset, Utc};

const KST_OFFSET_SECS: i32 = 9 * 3600;

pub fn kst() -> anyhow::Result<FixedOffset> {
    FixedOffset::east_opt(KST_OFFSET_SECS).context("invalid KST offset")
}

/// Snapshot timestamps are stamped in KST, the market's own zone, so the
/// freshness window reads the same regardless of where the worker runs.
pub fn kst_now() -> anyhow::Result<DateTime<FixedOffset>> {
    Ok(Utc::now().with_timezone(&kst()?))
}
