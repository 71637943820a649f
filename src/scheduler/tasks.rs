use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tracing::{debug, info};

use super::spec::TaskKind;
use crate::correlator::EventCorrelator;
use crate::db::{CursorStore, RecordStore};
use crate::error::Result;
use crate::types::{Partition, ValueBand};

#[async_trait]
pub trait ScheduledTask: Send + Sync {
    fn kind(&self) -> TaskKind;

    /// True for tasks that process the blocks announced by a block check.
    /// The cursor only moves once such a task succeeds.
    fn consumes_new_blocks(&self) -> bool {
        false
    }

    /// `Ok(result)` feeds dependents' `if=` gate; `Err` marks the run failed.
    async fn run(&self) -> Result<bool>;
}

/// Heights announced by the last block check and not yet committed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PendingBlocks {
    pub from: u64,
    pub to: u64,
}

/// Cursor plus the uncommitted "new blocks" signal.
pub struct BlockSignal {
    cursor: Arc<dyn CursorStore>,
    pending: Mutex<Option<PendingBlocks>>,
    last_tip: AtomicU64,
}

impl BlockSignal {
    pub fn new(cursor: Arc<dyn CursorStore>) -> Arc<Self> {
        Arc::new(Self { cursor, pending: Mutex::new(None), last_tip: AtomicU64::new(0) })
    }

    pub async fn cursor(&self) -> Result<Option<u64>> {
        self.cursor.load().await
    }

    /// Chain height seen by the last block check (0 before the first one).
    pub fn last_tip(&self) -> u64 {
        self.last_tip.load(Ordering::Relaxed)
    }

    pub fn pending(&self) -> Option<PendingBlocks> {
        self.pending.lock().ok().and_then(|p| *p)
    }

    fn announce(&self, pending: Option<PendingBlocks>) {
        if let Ok(mut slot) = self.pending.lock() {
            *slot = pending;
        }
    }

    /// Moves the cursor to the announced height. `None` when nothing was pending.
    pub async fn commit(&self) -> Result<Option<u64>> {
        let Some(pending) = self.pending() else {
            return Ok(None);
        };
        self.cursor.save(pending.to).await?;
        // Only clear what was committed; a newer announcement stays.
        if let Ok(mut slot) = self.pending.lock() {
            if *slot == Some(pending) {
                *slot = None;
            }
        }
        info!(height = pending.to, "cursor advanced");
        Ok(Some(pending.to))
    }
}

// ---------------------------------------------------------------------------
// check_blocks
// ---------------------------------------------------------------------------

/// `true` iff the chain grew past the cursor. On first start the cursor is
/// set to the current tip and the result is `false`.
pub struct CheckBlocks {
    correlator: Arc<EventCorrelator>,
    signal: Arc<BlockSignal>,
}

impl CheckBlocks {
    pub fn new(correlator: Arc<EventCorrelator>, signal: Arc<BlockSignal>) -> Self {
        Self { correlator, signal }
    }
}

#[async_trait]
impl ScheduledTask for CheckBlocks {
    fn kind(&self) -> TaskKind {
        TaskKind::CheckBlocks
    }

    async fn run(&self) -> Result<bool> {
        let tip = self.correlator.scanner().tip().await?;
        self.signal.last_tip.store(tip, Ordering::Relaxed);
        let Some(cursor) = self.signal.cursor().await? else {
            self.signal.cursor.save(tip).await?;
            info!(tip, "no cursor yet, starting from the current tip");
            self.signal.announce(None);
            return Ok(false);
        };

        if tip > cursor {
            info!(cursor, tip, new_blocks = tip - cursor, "new blocks");
            self.signal.announce(Some(PendingBlocks { from: cursor + 1, to: tip }));
            Ok(true)
        } else {
            debug!(cursor, tip, "no new blocks");
            self.signal.announce(None);
            Ok(false)
        }
    }
}

// ---------------------------------------------------------------------------
// monitor_addresses
// ---------------------------------------------------------------------------

/// Scans the announced blocks, stores the records and reports labelled
/// (watched) addresses that moved.
pub struct MonitorAddresses {
    correlator: Arc<EventCorrelator>,
    store: RecordStore,
    signal: Arc<BlockSignal>,
    band: ValueBand,
}

impl MonitorAddresses {
    pub fn new(
        correlator: Arc<EventCorrelator>,
        store: RecordStore,
        signal: Arc<BlockSignal>,
        band: ValueBand,
    ) -> Self {
        Self { correlator, store, signal, band }
    }
}

#[async_trait]
impl ScheduledTask for MonitorAddresses {
    fn kind(&self) -> TaskKind {
        TaskKind::MonitorAddresses
    }

    fn consumes_new_blocks(&self) -> bool {
        true
    }

    async fn run(&self) -> Result<bool> {
        let Some(PendingBlocks { from, to }) = self.signal.pending() else {
            debug!("no announced blocks to scan");
            return Ok(false);
        };

        let records = self.correlator.run_range(from, to, self.band).await?;
        for partition in Partition::all() {
            let rows = records.partition(partition);
            self.store.insert(partition, rows).await?;
            for r in rows.iter().filter(|r| !r.label.is_empty()) {
                info!(
                    address = %r.address,
                    label = %r.label,
                    txid = %r.txid,
                    btc_in = r.btc_in,
                    btc_out = r.btc_out,
                    "watched address moved"
                );
            }
        }
        info!(from, to, regular = records.regular.len(), coinbase = records.coinbase.len(), "blocks monitored");
        Ok(true)
    }
}
