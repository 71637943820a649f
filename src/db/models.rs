/// Row types for aggregate queries over the record tables.
use serde::Serialize;

#[derive(Debug, Default, Clone, Serialize, sqlx::FromRow)]
pub struct PartitionStatsRow {
    pub records: i64,
    pub unique_addresses: i64,
    pub events: i64,
    pub total_value: Option<f64>,
    pub last_recorded_at: Option<i64>,
}

/// Row counts before and after a dedup pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DedupStats {
    pub before: u64,
    pub after: u64,
}

impl DedupStats {
    pub fn removed(&self) -> u64 {
        self.before - self.after
    }
}
