use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Instant;

use futures_util::stream::{self, StreamExt, TryStreamExt};
use tracing::{info, warn};

use crate::aggregator::{AddressAggregator, AddressBook};
use crate::error::Result;
use crate::scanner::TransactionScanner;
use crate::types::{
    format_unix_secs, AddressRecord, EventSummary, FilterConfig, MarketEvent, Partition,
    RunSummary, ScanWindow, TransactionObservation, ValueBand, WindowScope,
};
use crate::window::EventWindowResolver;

/// Records from one or more windows, split by partition.
#[derive(Debug, Default, Clone)]
pub struct RecordSet {
    pub regular: Vec<AddressRecord>,
    pub coinbase: Vec<AddressRecord>,
}

impl RecordSet {
    pub fn partition(&self, partition: Partition) -> &[AddressRecord] {
        match partition {
            Partition::Regular => &self.regular,
            Partition::Coinbase => &self.coinbase,
        }
    }

    pub fn len(&self) -> usize {
        self.regular.len() + self.coinbase.len()
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn extend(&mut self, other: RecordSet) {
        self.regular.extend(other.regular);
        self.coinbase.extend(other.coinbase);
    }
}

#[derive(Debug, Default)]
pub struct CorrelationReport {
    pub records: RecordSet,
    pub summaries: Vec<EventSummary>,
    pub run: RunSummary,
}

/// Addressed value per partition, each qualifying txid counted once.
#[derive(Debug, Default, Clone, Copy, PartialEq)]
struct WindowTotals {
    regular: f64,
    coinbase: f64,
}

impl WindowTotals {
    fn of(observations: &[TransactionObservation]) -> Self {
        let mut seen = HashSet::new();
        let mut totals = Self::default();
        for obs in observations {
            if !seen.insert(obs.txid.as_str()) {
                continue;
            }
            if obs.is_coinbase {
                totals.coinbase += obs.addressed_value();
            } else {
                totals.regular += obs.addressed_value();
            }
        }
        totals
    }

    fn for_partition(&self, partition: Partition) -> f64 {
        match partition {
            Partition::Regular => self.regular,
            Partition::Coinbase => self.coinbase,
        }
    }
}

/// Resolves, scans and aggregates every event × filter pair.
pub struct EventCorrelator {
    scanner: TransactionScanner,
    resolver: EventWindowResolver,
    labels: Arc<AddressBook>,
    max_concurrent_scans: usize,
}

impl EventCorrelator {
    pub fn new(
        scanner: TransactionScanner,
        resolver: EventWindowResolver,
        labels: Arc<AddressBook>,
        max_concurrent_scans: usize,
    ) -> Self {
        Self {
            scanner,
            resolver,
            labels,
            max_concurrent_scans: max_concurrent_scans.max(1),
        }
    }

    pub fn scanner(&self) -> &TransactionScanner {
        &self.scanner
    }

    /// A failing pair is recorded in the run summary; the other pairs still run.
    pub async fn run(&self, events: &[MarketEvent], filters: &[FilterConfig]) -> CorrelationReport {
        let pairs: Vec<(&FilterConfig, &MarketEvent)> = filters
            .iter()
            .flat_map(|f| events.iter().map(move |e| (f, e)))
            .collect();
        info!(events = events.len(), filters = filters.len(), pairs = pairs.len(), "correlation run starting");

        let mut outcomes: Vec<_> = stream::iter(pairs.into_iter().enumerate())
            .map(|(i, (filter, event))| async move {
                let key = pair_key(filter, event);
                (i, key, self.run_pair(event, filter).await)
            })
            .buffer_unordered(self.max_concurrent_scans)
            .collect()
            .await;
        outcomes.sort_by_key(|(i, _, _)| *i);

        let mut report = CorrelationReport::default();
        for (_, key, outcome) in outcomes {
            match outcome {
                Ok((records, summary)) => {
                    info!(
                        pair = %key,
                        regular = records.regular.len(),
                        coinbase = records.coinbase.len(),
                        total_tx_value = summary.total_tx_value,
                        duration_ms = summary.duration_ms,
                        "pair complete"
                    );
                    report.records.extend(records);
                    report.summaries.push(summary);
                    report.run.record_success();
                }
                Err(e) => {
                    warn!(pair = %key, error = %e, "pair failed, skipped");
                    report.run.record_failure(key, e);
                }
            }
        }
        info!(
            succeeded = report.run.succeeded,
            failed = report.run.failed,
            records = report.records.len(),
            "correlation run complete"
        );
        report
    }

    async fn run_pair(&self, event: &MarketEvent, filter: &FilterConfig) -> Result<(RecordSet, EventSummary)> {
        let started = Instant::now();
        let mut window = self.resolver.resolve(event, filter.lookback_secs)?;
        let observations = match self.collect(window, filter.band).await {
            Err(e) if e.is_reorg() => {
                warn!(pair = %pair_key(filter, event), error = %e, "chain moved under window, rescanning once");
                window = self.resolver.resolve(event, filter.lookback_secs)?;
                self.collect(window, filter.band).await?
            }
            other => other?,
        };

        let mut aggregator = AddressAggregator::new(WindowScope::for_event(event), Arc::clone(&self.labels));
        let records = aggregate(&mut aggregator, &observations);

        let summary = summarize(event, filter, &window, &observations, aggregator.unique_addresses(), started);
        Ok((records, summary))
    }

    /// Cursor-scoped scan over `from..=to` with no event attached.
    pub async fn run_range(&self, from: u64, to: u64, band: ValueBand) -> Result<RecordSet> {
        let window = ScanWindow::heights(from, to);
        let observations = self.collect(window, band).await?;
        let mut aggregator = AddressAggregator::new(WindowScope::default(), Arc::clone(&self.labels));
        Ok(aggregate(&mut aggregator, &observations))
    }

    async fn collect(&self, window: ScanWindow, band: ValueBand) -> Result<Vec<TransactionObservation>> {
        self.scanner.scan(window, band).try_collect().await
    }
}

/// Second pass: totals are fixed before any record is built, so percentages
/// do not depend on ingestion order.
fn aggregate(aggregator: &mut AddressAggregator, observations: &[TransactionObservation]) -> RecordSet {
    let totals = WindowTotals::of(observations);
    for obs in observations {
        let total = totals.for_partition(Partition::for_observation(obs));
        aggregator.ingest(obs, total);
    }
    RecordSet {
        regular: aggregator.records(Partition::Regular),
        coinbase: aggregator.records(Partition::Coinbase),
    }
}

fn summarize(
    event: &MarketEvent,
    filter: &FilterConfig,
    window: &ScanWindow,
    observations: &[TransactionObservation],
    unique_addresses: usize,
    started: Instant,
) -> EventSummary {
    let mut seen = HashSet::new();
    let distinct: Vec<&TransactionObservation> = observations
        .iter()
        .filter(|o| seen.insert(o.txid.as_str()))
        .collect();
    let values: Vec<f64> = distinct.iter().map(|o| o.total_value).collect();
    let total: f64 = values.iter().sum();
    let coinbase_txs = distinct.iter().filter(|o| o.is_coinbase).count();

    let mut fees = Vec::new();
    let mut fee_bearing_value = 0.0;
    let mut rejected = 0u64;
    let mut output_types: BTreeMap<String, u64> = BTreeMap::new();
    for obs in &distinct {
        for (kind, n) in &obs.output_types {
            *output_types.entry(kind.clone()).or_default() += n;
        }
        if obs.is_coinbase {
            continue;
        }
        match obs.fee {
            Some(fee) => {
                fees.push(fee);
                fee_bearing_value += obs.total_value;
            }
            None => rejected += 1,
        }
    }
    let total_fees: f64 = fees.iter().sum();
    let total_outputs: u64 = output_types.values().sum();
    let output_type_shares = output_types
        .iter()
        .map(|(kind, n)| (kind.clone(), *n as f64 * 100.0 / total_outputs as f64))
        .collect();

    EventSummary {
        filter_name: filter.name.clone(),
        event_time: event.event_time(),
        event_change: event.percent_change,
        window_start: format_unix_secs(window.start),
        window_end: format_unix_secs(window.end),
        min_transfer: filter.band.min,
        max_transfer: filter.band.max,
        total_tx_value: total,
        qualifying_txs: values.len() as u64,
        coinbase_txs: coinbase_txs as u64,
        unique_addresses: unique_addresses as u64,
        min_tx_value: values.iter().copied().reduce(f64::min),
        max_tx_value: values.iter().copied().reduce(f64::max),
        avg_tx_value: (!values.is_empty()).then(|| total / values.len() as f64),
        total_fees,
        min_fee: fees.iter().copied().reduce(f64::min),
        max_fee: fees.iter().copied().reduce(f64::max),
        avg_fee: (!fees.is_empty()).then(|| total_fees / fees.len() as f64),
        fee_tx_ratio: (fee_bearing_value > 0.0).then(|| total_fees / fee_bearing_value),
        rejected_transactions: rejected,
        total_outputs,
        output_types,
        output_type_shares,
        duration_ms: started.elapsed().as_millis() as u64,
    }
}

fn pair_key(filter: &FilterConfig, event: &MarketEvent) -> String {
    format!("{}@{}", filter.name, event.event_time())
}
