use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::Arc;

use tracing::info;

use crate::error::Result;
use crate::types::{
    format_unix_secs, AddressRecord, Direction, Partition, RecordKey, TransactionObservation,
    WindowScope,
};

// ---------------------------------------------------------------------------
// Address labels
// ---------------------------------------------------------------------------

/// Known addresses (exchanges, pools, watched wallets) and their labels.
#[derive(Debug, Default, Clone)]
pub struct AddressBook {
    labels: HashMap<String, String>,
}

impl AddressBook {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reads `address,label` rows; a leading `address,...` header row is skipped.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let mut reader = csv::ReaderBuilder::new()
            .has_headers(false)
            .flexible(true)
            .trim(csv::Trim::All)
            .comment(Some(b'#'))
            .from_path(path.as_ref())?;

        let mut labels = HashMap::new();
        for row in reader.records() {
            let row = row?;
            let (Some(address), Some(label)) = (row.get(0), row.get(1)) else {
                continue;
            };
            if address.is_empty() || address.eq_ignore_ascii_case("address") {
                continue;
            }
            labels.insert(address.to_string(), label.to_string());
        }
        info!(path = %path.as_ref().display(), count = labels.len(), "address labels loaded");
        Ok(Self { labels })
    }

    #[cfg(test)]
    pub fn insert(&mut self, address: impl Into<String>, label: impl Into<String>) {
        self.labels.insert(address.into(), label.into());
    }

    pub fn label(&self, address: &str) -> Option<&str> {
        self.labels.get(address).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.labels.len()
    }
}

// ---------------------------------------------------------------------------
// Aggregation
// ---------------------------------------------------------------------------

type IdentityKey = (String, String, String);

struct Entry {
    record: AddressRecord,
    /// `(direction, index) -> value`; re-inserting the same tuple overwrites.
    tuples: BTreeMap<(Direction, u32), f64>,
}

impl Entry {
    fn resum(&mut self, partition: Partition, window_total: f64) {
        let (mut btc_in, mut btc_out) = (0.0, 0.0);
        for (&(direction, _), &value) in &self.tuples {
            match direction {
                Direction::In => btc_in += value,
                Direction::Out => btc_out += value,
            }
        }
        if partition == Partition::Coinbase {
            btc_out = 0.0;
        }
        self.record.btc_in = btc_in;
        self.record.btc_out = btc_out;
        self.record.value = btc_in;
        self.record.percentage_of_total = if window_total > 0.0 { btc_in / window_total } else { 0.0 };
    }
}

/// Per-window running state for both partitions, keyed by `(address, txid, tx_time)`.
pub struct AddressAggregator {
    scope: WindowScope,
    labels: Arc<AddressBook>,
    regular: BTreeMap<IdentityKey, Entry>,
    coinbase: BTreeMap<IdentityKey, Entry>,
}

impl AddressAggregator {
    pub fn new(scope: WindowScope, labels: Arc<AddressBook>) -> Self {
        Self {
            scope,
            labels,
            regular: BTreeMap::new(),
            coinbase: BTreeMap::new(),
        }
    }

    /// Merges one observation and returns the records it created or touched.
    /// Re-ingesting an identical observation only bumps `occurrence_count`.
    pub fn ingest(&mut self, obs: &TransactionObservation, window_total: f64) -> Vec<AddressRecord> {
        let partition = Partition::for_observation(obs);
        let tx_time = format_unix_secs(obs.tx_time);

        let mut by_address: BTreeMap<&str, Vec<(Direction, u32, f64)>> = BTreeMap::new();
        for t in &obs.tuples {
            if partition == Partition::Coinbase && t.direction == Direction::Out {
                continue;
            }
            by_address
                .entry(t.address.as_str())
                .or_default()
                .push((t.direction, t.index, t.value));
        }

        let scope = &self.scope;
        let labels = &self.labels;
        let entries = match partition {
            Partition::Regular => &mut self.regular,
            Partition::Coinbase => &mut self.coinbase,
        };

        let mut touched = Vec::with_capacity(by_address.len());
        for (address, tuples) in by_address {
            let key = (address.to_string(), obs.txid.clone(), tx_time.clone());
            let entry = entries
                .entry(key)
                .and_modify(|e| e.record.occurrence_count += 1)
                .or_insert_with(|| Entry {
                    record: AddressRecord {
                        address: address.to_string(),
                        value: 0.0,
                        percentage_of_total: 0.0,
                        txid: obs.txid.clone(),
                        tx_time: tx_time.clone(),
                        event_time: scope.event_time.clone(),
                        price_change: scope.price_change,
                        occurrence_count: 1,
                        btc_in: 0.0,
                        btc_out: 0.0,
                        label: labels.label(address).unwrap_or_default().to_string(),
                    },
                    tuples: BTreeMap::new(),
                });
            for (direction, index, value) in tuples {
                entry.tuples.insert((direction, index), value);
            }
            entry.resum(partition, window_total);
            touched.push(entry.record.clone());
        }
        touched
    }

    pub fn records(&self, partition: Partition) -> Vec<AddressRecord> {
        let entries = match partition {
            Partition::Regular => &self.regular,
            Partition::Coinbase => &self.coinbase,
        };
        entries.values().map(|e| e.record.clone()).collect()
    }

    pub fn unique_addresses(&self) -> usize {
        let mut seen: Vec<&str> = self
            .regular
            .keys()
            .chain(self.coinbase.keys())
            .map(|(address, _, _)| address.as_str())
            .collect();
        seen.sort_unstable();
        seen.dedup();
        seen.len()
    }
}

/// Collapses records sharing `(address, txid, tx_time, event_time)` into one.
/// The merged `occurrence_count` is the sum over the collapsed rows, so it
/// counts every scan that found the record; the other fields come from the
/// last row seen. Output is ordered by key and holds no duplicates, so
/// running it again changes nothing.
pub fn dedup(records: Vec<AddressRecord>) -> Vec<AddressRecord> {
    let mut kept: BTreeMap<RecordKey, AddressRecord> = BTreeMap::new();
    for mut record in records {
        let key = record.key();
        record.occurrence_count += kept.get(&key).map_or(0, |r| r.occurrence_count);
        kept.insert(key, record);
    }
    kept.into_values().collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ValueTuple;

    fn tuple(address: &str, value: f64, direction: Direction, index: u32) -> ValueTuple {
        ValueTuple { address: address.to_string(), value, direction, index }
    }

    fn obs(txid: &str, is_coinbase: bool, tuples: Vec<ValueTuple>) -> TransactionObservation {
        let total_value = tuples
            .iter()
            .filter(|t| t.direction == Direction::In)
            .map(|t| t.value)
            .sum();
        TransactionObservation {
            txid: txid.to_string(),
            tx_time: 1_724_790_000,
            block_height: 858_000,
            is_coinbase,
            total_value,
            fee: None,
            output_types: BTreeMap::new(),
            tuples,
        }
    }

    fn aggregator() -> AddressAggregator {
        let scope = WindowScope { event_time: "2024-08-27T20:23:00Z".into(), price_change: -3.7 };
        AddressAggregator::new(scope, Arc::new(AddressBook::new()))
    }

    #[test]
    fn reingesting_is_idempotent_except_for_count() {
        let mut agg = aggregator();
        let o = obs(
            "t1",
            false,
            vec![
                tuple("alice", 10.0, Direction::In, 0),
                tuple("alice", 4.0, Direction::Out, 0),
                tuple("bob", 5.0, Direction::In, 1),
            ],
        );
        let first = agg.ingest(&o, 15.0);
        let second = agg.ingest(&o, 15.0);

        assert_eq!(first.len(), 2);
        for (a, b) in first.iter().zip(&second) {
            assert_eq!(a.value, b.value);
            assert_eq!(a.btc_in, b.btc_in);
            assert_eq!(a.btc_out, b.btc_out);
            assert_eq!(b.occurrence_count, a.occurrence_count + 1);
        }
        let alice = &second[0];
        assert_eq!(alice.address, "alice");
        assert!((alice.btc_in - 10.0).abs() < 1e-9);
        assert!((alice.btc_out - 4.0).abs() < 1e-9);
        assert!((alice.btc_in - alice.btc_out - 6.0).abs() < 1e-9);
    }

    #[test]
    fn regular_percentages_sum_to_one() {
        let mut agg = aggregator();
        let txs = [
            obs("t1", false, vec![tuple("a", 700.0, Direction::In, 0), tuple("b", 500.0, Direction::In, 1)]),
            obs("t2", false, vec![tuple("c", 1_800.0, Direction::In, 0), tuple("z", 2_000.0, Direction::Out, 0)]),
        ];
        let total: f64 = txs.iter().map(|o| o.total_value).sum();
        for o in &txs {
            agg.ingest(o, total);
        }
        let sum: f64 = agg.records(Partition::Regular).iter().map(|r| r.percentage_of_total).sum();
        assert!((sum - 1.0).abs() < 1e-9, "sum={sum}");
    }

    #[test]
    fn zero_window_total_gives_zero_percentage() {
        let mut agg = aggregator();
        let records = agg.ingest(&obs("t1", false, vec![tuple("a", 1.0, Direction::In, 0)]), 0.0);
        assert_eq!(records[0].percentage_of_total, 0.0);
    }

    #[test]
    fn coinbase_goes_to_its_own_partition_without_spends() {
        let mut agg = aggregator();
        agg.ingest(
            &obs("cb", true, vec![tuple("miner", 3.125, Direction::In, 0), tuple("miner", 1.0, Direction::Out, 0)]),
            3.125,
        );
        assert!(agg.records(Partition::Regular).is_empty());
        let cb = agg.records(Partition::Coinbase);
        assert_eq!(cb.len(), 1);
        assert_eq!(cb[0].btc_out, 0.0);
        assert!((cb[0].percentage_of_total - 1.0).abs() < 1e-9);
    }

    #[test]
    fn labels_and_scope_are_stamped() {
        let mut book = AddressBook::new();
        book.insert("a", "Binance cold wallet");
        let scope = WindowScope { event_time: "E".into(), price_change: 2.5 };
        let mut agg = AddressAggregator::new(scope, Arc::new(book));
        let r = agg.ingest(&obs("t", false, vec![tuple("a", 1.0, Direction::In, 0)]), 1.0);
        assert_eq!(r[0].label, "Binance cold wallet");
        assert_eq!(r[0].event_time, "E");
        assert_eq!(r[0].price_change, 2.5);
        assert_eq!(agg.unique_addresses(), 1);
    }

    #[test]
    fn dedup_sums_counts_across_scans_and_is_idempotent() {
        let o = obs("t1", false, vec![tuple("a", 1.0, Direction::In, 0)]);
        let first_scan = aggregator().ingest(&o, 1.0).remove(0);
        let mut rescan = aggregator();
        rescan.ingest(&o, 1.0);
        let second_scan = rescan.ingest(&o, 1.0).remove(0);
        assert_eq!(second_scan.occurrence_count, 2);
        let mut other_event = first_scan.clone();
        other_event.event_time = "2024-09-01T00:00:00Z".into();

        let merged = dedup(vec![first_scan, other_event.clone(), second_scan]);
        assert_eq!(merged.len(), 2);
        assert!(merged.contains(&other_event));
        let same_window = merged.iter().find(|r| r.event_time != other_event.event_time).unwrap();
        assert_eq!(same_window.occurrence_count, 3);
        assert_eq!(dedup(merged.clone()), merged);
    }

    #[test]
    fn address_book_reads_csv() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        std::io::Write::write_all(
            &mut file,
            b"address,label\n# exchanges\nbc1qexchange, Exchange hot wallet\n\nbc1qpool,Pool\n",
        )
        .unwrap();
        let book = AddressBook::load(file.path()).unwrap();
        assert_eq!(book.len(), 2);
        assert_eq!(book.label("bc1qexchange"), Some("Exchange hot wallet"));
    }
}
