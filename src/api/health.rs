//! Shared health state for the /health endpoint.
//! Updated by the scheduler after every tick.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

/// Shared health metrics. Written by the scheduler, read by the API.
#[derive(Default)]
pub struct HealthState {
    /// False after a tick in which any task failed.
    pub last_tick_ok: AtomicBool,
    /// Unix seconds of the last completed tick (0 = none).
    pub last_tick_at: AtomicU64,
    pub ticks: AtomicU64,
    /// Last chain height seen by a block check (0 = unknown).
    pub chain_tip: AtomicU64,
    /// Last committed cursor height (0 = none).
    pub cursor_height: AtomicU64,
}

impl HealthState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_tick(&self, at_secs: u64, ok: bool) {
        self.last_tick_at.store(at_secs, Ordering::Relaxed);
        self.last_tick_ok.store(ok, Ordering::Relaxed);
        self.ticks.fetch_add(1, Ordering::Relaxed);
    }

    pub fn set_chain_tip(&self, height: u64) {
        self.chain_tip.store(height, Ordering::Relaxed);
    }

    pub fn set_cursor_height(&self, height: u64) {
        self.cursor_height.store(height, Ordering::Relaxed);
    }

    pub fn last_tick_ok(&self) -> bool {
        self.last_tick_ok.load(Ordering::Relaxed)
    }

    pub fn last_tick_at(&self) -> u64 {
        self.last_tick_at.load(Ordering::Relaxed)
    }

    pub fn ticks(&self) -> u64 {
        self.ticks.load(Ordering::Relaxed)
    }

    pub fn chain_tip(&self) -> u64 {
        self.chain_tip.load(Ordering::Relaxed)
    }

    pub fn cursor_height(&self) -> u64 {
        self.cursor_height.load(Ordering::Relaxed)
    }
}
