//! In-memory histograms of scheduled task run times.
//! The scheduler records one sample per execution, the API reads percentiles.

use std::collections::BTreeMap;
use std::sync::Mutex;
use std::time::Duration;

use hdrhistogram::Histogram;
use serde::Serialize;

use crate::error::{AppError, Result};

/// 1 ms to 24 h.
const MAX_TRACKABLE_MS: u64 = 86_400_000;
const SIGFIG: u8 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Percentiles {
    pub samples: u64,
    pub p50_ms: u64,
    pub p95_ms: u64,
    pub p99_ms: u64,
    pub max_ms: u64,
}

/// Values stored in milliseconds, one histogram per task name.
pub struct TaskDurations {
    template: Histogram<u64>,
    inner: Mutex<BTreeMap<String, Histogram<u64>>>,
}

impl TaskDurations {
    pub fn new() -> Result<Self> {
        let template = Histogram::new_with_bounds(1, MAX_TRACKABLE_MS, SIGFIG)
            .map_err(|e| AppError::Configuration(format!("histogram bounds: {e}")))?;
        Ok(Self { template, inner: Mutex::new(BTreeMap::new()) })
    }

    pub fn record(&self, task: &str, d: Duration) {
        let ms = (d.as_millis().min(u128::from(MAX_TRACKABLE_MS)) as u64).max(1);
        if let Ok(mut map) = self.inner.lock() {
            let h = map
                .entry(task.to_string())
                .or_insert_with(|| Histogram::new_from(&self.template));
            let _ = h.record(ms);
        }
    }

    /// `None` if the task has no samples.
    #[cfg(test)]
    pub fn percentiles(&self, task: &str) -> Option<Percentiles> {
        let map = self.inner.lock().ok()?;
        map.get(task).and_then(summarize)
    }

    pub fn all(&self) -> BTreeMap<String, Percentiles> {
        let Ok(map) = self.inner.lock() else {
            return BTreeMap::new();
        };
        map.iter()
            .filter_map(|(name, h)| summarize(h).map(|p| (name.clone(), p)))
            .collect()
    }
}

fn summarize(h: &Histogram<u64>) -> Option<Percentiles> {
    if h.len() == 0 {
        return None;
    }
    Some(Percentiles {
        samples: h.len(),
        p50_ms: h.value_at_quantile(0.5),
        p95_ms: h.value_at_quantile(0.95),
        p99_ms: h.value_at_quantile(0.99),
        max_ms: h.max(),
    })
}
