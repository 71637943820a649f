use tracing::debug;

use crate::chain::ChainSource;
use crate::error::{AppError, Result};
use crate::scanner::TransactionScanner;
use crate::types::{MarketEvent, ScanWindow, WindowUnit};

/// Turns a market event into the time window that precedes it.
#[derive(Debug, Clone, Copy)]
pub struct EventWindowResolver {
    genesis_time: i64,
}

impl EventWindowResolver {
    pub fn new(genesis_time: i64) -> Self {
        Self { genesis_time }
    }

    /// Reads the genesis time through the scanner, so a node that is still
    /// warming up is retried rather than failing startup.
    pub async fn from_scanner(scanner: &TransactionScanner) -> Result<Self> {
        let genesis = scanner.header(0).await?;
        Ok(Self::new(genesis.time))
    }

    /// `[event - lookback, event]`, both ends inclusive.
    pub fn resolve(&self, event: &MarketEvent, lookback_secs: i64) -> Result<ScanWindow> {
        if lookback_secs <= 0 {
            return Err(AppError::InvalidEvent(format!(
                "look-back must be positive, got {lookback_secs}s"
            )));
        }
        if event.timestamp < self.genesis_time {
            return Err(AppError::InvalidEvent(format!(
                "event at {} precedes the genesis block",
                event.event_time()
            )));
        }
        let start = event.timestamp.checked_sub(lookback_secs).ok_or_else(|| {
            AppError::InvalidEvent(format!("look-back {lookback_secs}s underflows"))
        })?;
        Ok(ScanWindow { start, end: event.timestamp, unit: WindowUnit::Time })
    }
}

/// Last block whose header time is at or before `target`, or `None` when
/// `target` precedes genesis. Block times are only roughly monotonic, so the
/// caller filters blocks by their own time afterwards.
pub async fn height_at_or_before(
    source: &dyn ChainSource,
    tip: u64,
    target: i64,
) -> Result<Option<u64>> {
    let mut lo: u64 = 0;
    let mut hi: u64 = tip + 1;
    // invariant: every height < lo has time <= target, every height >= hi has time > target
    while lo < hi {
        let mid = lo + (hi - lo) / 2;
        let header = source.block_header(mid).await?;
        if header.time <= target {
            lo = mid + 1;
        } else {
            hi = mid;
        }
    }
    debug!(target, found = lo, "height search");
    Ok(lo.checked_sub(1))
}

/// Inclusive height range covering a window.
pub async fn height_range(source: &dyn ChainSource, window: &ScanWindow) -> Result<Option<(u64, u64)>> {
    match window.unit {
        WindowUnit::Height => {
            if window.start < 0 || window.end < window.start {
                return Ok(None);
            }
            Ok(Some((window.start as u64, window.end as u64)))
        }
        WindowUnit::Time => {
            let tip = source.block_count().await?;
            let Some(end) = height_at_or_before(source, tip, window.end).await? else {
                return Err(AppError::InvalidEvent(format!(
                    "window {window} ends before the genesis block"
                )));
            };
            let start = height_at_or_before(source, tip, window.start).await?.unwrap_or(0);
            Ok(Some((start, end)))
        }
    }
}
