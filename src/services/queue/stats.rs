use std::collections::BTreeMap;

use chrono::{Duration as ChronoDuration, Utc};
use color_eyre::eyre::{Result, WrapErr};
use sea_orm::{ColumnTrait, EntityTrait, QueryFilter};
use serde::Serialize;

use super::QueueManager;
use crate::entities;
use crate::models::Platform;

/// Download results for one day and platform.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DailyStats {
    pub day: String,
    pub platform: Platform,
    pub succeeded: u64,
    pub failed: u64,
    pub bytes: u64,
    pub average_duration_ms: u64,
}

#[derive(Default)]
struct Accumulator {
    succeeded: u64,
    failed: u64,
    bytes: u64,
    total_duration_ms: u64,
}

impl QueueManager {
    /// Per-day, per-platform statistics for the last `days` days, newest first.
    pub async fn statistics(&self, days: u32) -> Result<Vec<DailyStats>> {
        let since = (Utc::now() - ChronoDuration::days(days.saturating_sub(1) as i64))
            .format("%Y-%m-%d")
            .to_string();

        let records = entities::download_record::Entity::find()
            .filter(entities::download_record::Column::Day.gte(since))
            .all(&self.inner.db.conn)
            .await
            .wrap_err("Failed to fetch download records")?;

        let mut grouped: BTreeMap<(String, Platform), Accumulator> = BTreeMap::new();
        for record in records {
            let acc = grouped.entry((record.day, record.platform)).or_default();
            if record.succeeded {
                acc.succeeded += 1;
                acc.bytes += record.bytes.max(0) as u64;
                acc.total_duration_ms += record.duration_ms.max(0) as u64;
            } else {
                acc.failed += 1;
            }
        }

        let mut stats: Vec<DailyStats> = grouped
            .into_iter()
            .map(|((day, platform), acc)| DailyStats {
                day,
                platform,
                succeeded: acc.succeeded,
                failed: acc.failed,
                bytes: acc.bytes,
                average_duration_ms: acc
                    .total_duration_ms
                    .checked_div(acc.succeeded)
                    .unwrap_or(0),
            })
            .collect();
        stats.sort_by(|a, b| b.day.cmp(&a.day).then(a.platform.cmp(&b.platform)));
        Ok(stats)
    }
}
