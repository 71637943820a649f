use std::collections::BTreeMap;

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Market events and scan windows
// ---------------------------------------------------------------------------

/// An externally supplied price move that anchors a scan window.
#[derive(Debug, Clone, PartialEq)]
pub struct MarketEvent {
    /// Unix seconds, UTC.
    pub timestamp: i64,
    pub percent_change: f64,
    pub name: Option<String>,
}

impl MarketEvent {
    #[cfg(test)]
    pub fn new(timestamp: i64, percent_change: f64) -> Self {
        Self { timestamp, percent_change, name: None }
    }

    /// `event_time` stamped on every record produced from this event's window.
    pub fn event_time(&self) -> String {
        format_unix_secs(self.timestamp)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WindowUnit {
    Time,
    Height,
}

/// Inclusive range of chain activity to scan.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScanWindow {
    pub start: i64,
    pub end: i64,
    pub unit: WindowUnit,
}

impl ScanWindow {
    pub fn heights(start: u64, end: u64) -> Self {
        Self { start: start as i64, end: end as i64, unit: WindowUnit::Height }
    }

    pub fn contains_time(&self, t: i64) -> bool {
        self.unit == WindowUnit::Time && t >= self.start && t <= self.end
    }
}

impl std::fmt::Display for ScanWindow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.unit {
            WindowUnit::Time => write!(
                f,
                "{} .. {}",
                format_unix_secs(self.start),
                format_unix_secs(self.end)
            ),
            WindowUnit::Height => write!(f, "#{} .. #{}", self.start, self.end),
        }
    }
}

/// Closed value range a transaction's total moved value must fall in.
/// `max = None` is "at least `min`".
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ValueBand {
    pub min: f64,
    pub max: Option<f64>,
}

impl ValueBand {
    #[cfg(test)]
    pub fn at_least(min: f64) -> Self {
        Self { min, max: None }
    }

    #[cfg(test)]
    pub fn between(min: f64, max: f64) -> Self {
        Self { min, max: Some(max) }
    }

    pub fn contains(&self, value: f64) -> bool {
        value >= self.min && self.max.map_or(true, |max| value <= max)
    }
}

impl std::fmt::Display for ValueBand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.max {
            Some(max) => write!(f, "[{}, {}]", self.min, max),
            None => write!(f, "[{}, ∞)", self.min),
        }
    }
}

/// One (threshold, lookback) configuration crossed with the event list.
#[derive(Debug, Clone, PartialEq)]
pub struct FilterConfig {
    pub name: String,
    pub band: ValueBand,
    /// Seconds before the event the window opens.
    pub lookback_secs: i64,
}

// ---------------------------------------------------------------------------
// Scanned transactions
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    /// Value received by the address (a transaction output).
    In,
    /// Value spent by the address (a transaction input).
    Out,
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Direction::In => write!(f, "in"),
            Direction::Out => write!(f, "out"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ValueTuple {
    pub address: String,
    pub value: f64,
    pub direction: Direction,
    /// Output `n` for `In`, input position for `Out`.
    pub index: u32,
}

/// A qualifying transaction as seen by the scanner. Transient.
#[derive(Debug, Clone, PartialEq)]
pub struct TransactionObservation {
    pub txid: String,
    /// Unix seconds (block time).
    pub tx_time: i64,
    pub block_height: u64,
    pub is_coinbase: bool,
    /// Sum of all output values; what the value band is applied to.
    pub total_value: f64,
    /// Inputs minus outputs. `None` for coinbase or when a prevout could not be resolved.
    pub fee: Option<f64>,
    /// Output count per script type, addressed or not.
    pub output_types: BTreeMap<String, u64>,
    pub tuples: Vec<ValueTuple>,
}

impl TransactionObservation {
    /// Value received by addresses. Unaddressed outputs are not attributable and
    /// stay out of window totals.
    pub fn addressed_value(&self) -> f64 {
        self.tuples
            .iter()
            .filter(|t| t.direction == Direction::In)
            .map(|t| t.value)
            .sum()
    }
}

// ---------------------------------------------------------------------------
// Address records
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Partition {
    Regular,
    Coinbase,
}

impl Partition {
    pub fn for_observation(obs: &TransactionObservation) -> Self {
        if obs.is_coinbase {
            Partition::Coinbase
        } else {
            Partition::Regular
        }
    }

    pub fn table(&self) -> &'static str {
        match self {
            Partition::Regular => "addresses",
            Partition::Coinbase => "coinbase_addresses",
        }
    }

    pub fn all() -> [Partition; 2] {
        [Partition::Regular, Partition::Coinbase]
    }
}

impl std::fmt::Display for Partition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Partition::Regular => write!(f, "regular"),
            Partition::Coinbase => write!(f, "coinbase"),
        }
    }
}

/// Which window a record was produced in. Cursor-scoped runs have an empty
/// `event_time` and zero `price_change`.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct WindowScope {
    pub event_time: String,
    pub price_change: f64,
}

impl WindowScope {
    pub fn for_event(event: &MarketEvent) -> Self {
        Self {
            event_time: event.event_time(),
            price_change: event.percent_change,
        }
    }
}

/// Persisted unit. Field order is the export column order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct AddressRecord {
    pub address: String,
    pub value: f64,
    pub percentage_of_total: f64,
    pub txid: String,
    pub tx_time: String,
    pub event_time: String,
    pub price_change: f64,
    pub occurrence_count: i64,
    pub btc_in: f64,
    pub btc_out: f64,
    pub label: String,
}

/// `(address, txid, tx_time, event_time)`: records sharing it are one observation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RecordKey {
    pub address: String,
    pub txid: String,
    pub tx_time: String,
    pub event_time: String,
}

impl AddressRecord {
    pub fn key(&self) -> RecordKey {
        RecordKey {
            address: self.address.clone(),
            txid: self.txid.clone(),
            tx_time: self.tx_time.clone(),
            event_time: self.event_time.clone(),
        }
    }
}

// ---------------------------------------------------------------------------
// Run reporting
// ---------------------------------------------------------------------------

/// Per event × filter statistics, appended to the events summary file.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct EventSummary {
    pub filter_name: String,
    pub event_time: String,
    pub event_change: f64,
    pub window_start: String,
    pub window_end: String,
    pub min_transfer: f64,
    pub max_transfer: Option<f64>,
    pub total_tx_value: f64,
    pub qualifying_txs: u64,
    pub coinbase_txs: u64,
    pub unique_addresses: u64,
    pub min_tx_value: Option<f64>,
    pub max_tx_value: Option<f64>,
    pub avg_tx_value: Option<f64>,
    pub total_fees: f64,
    pub min_fee: Option<f64>,
    pub max_fee: Option<f64>,
    pub avg_fee: Option<f64>,
    /// `total_fees` over the value of the transactions that carried a known fee.
    pub fee_tx_ratio: Option<f64>,
    /// Non-coinbase transactions whose fee could not be computed.
    pub rejected_transactions: u64,
    pub total_outputs: u64,
    #[serde(serialize_with = "joined_pairs")]
    pub output_types: BTreeMap<String, u64>,
    /// Percent of `total_outputs` per script type.
    #[serde(serialize_with = "joined_pairs")]
    pub output_type_shares: BTreeMap<String, f64>,
    pub duration_ms: u64,
}

/// Flattens a map into one CSV cell: `nulldata=1;pubkey=2`.
fn joined_pairs<V, S>(map: &BTreeMap<String, V>, serializer: S) -> Result<S::Ok, S::Error>
where
    V: std::fmt::Display,
    S: serde::Serializer,
{
    let cell = map
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join(";");
    serializer.serialize_str(&cell)
}

/// Outcome of a correlator run or a scheduler tick: counts plus the last error per failing key.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RunSummary {
    pub succeeded: usize,
    pub failed: usize,
    pub failures: BTreeMap<String, String>,
}

impl RunSummary {
    pub fn record_success(&mut self) {
        self.succeeded += 1;
    }

    pub fn record_failure(&mut self, key: impl Into<String>, error: impl std::fmt::Display) {
        self.failed += 1;
        self.failures.insert(key.into(), error.to_string());
    }

    pub fn is_partial(&self) -> bool {
        self.failed > 0
    }
}

// ---------------------------------------------------------------------------
// Time helpers
// ---------------------------------------------------------------------------

/// `1724790180` → `2024-08-27T20:23:00Z`.
pub fn format_unix_secs(secs: i64) -> String {
    DateTime::<Utc>::from_timestamp(secs, 0)
        .map(|dt| dt.format("%Y-%m-%dT%H:%M:%SZ").to_string())
        .unwrap_or_default()
}

/// Parse an event timestamp (`2024-08-27 20:23:00`, `2024/08/27 20:23:00`,
/// or RFC 3339) as UTC Unix seconds.
pub fn parse_event_time(s: &str) -> Option<i64> {
    let s = s.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.timestamp());
    }
    ["%Y-%m-%d %H:%M:%S", "%Y/%m/%d %H:%M:%S", "%Y-%m-%dT%H:%M:%S"]
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(s, fmt).ok())
        .map(|naive| naive.and_utc().timestamp())
}
