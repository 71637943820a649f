use std::fs::OpenOptions;
use std::path::{Path, PathBuf};

use serde::Serialize;
use tracing::info;

use crate::db::models::DedupStats;
use crate::db::RecordStore;
use crate::error::Result;
use crate::types::{AddressRecord, EventSummary, Partition};

pub const EVENTS_SUMMARY_FILE: &str = "events.csv";

#[derive(Debug, Clone, Serialize)]
pub struct ExportSummary {
    pub regular: usize,
    pub coinbase: usize,
    pub regular_dedup: DedupStats,
    pub coinbase_dedup: DedupStats,
}

/// Writes the persisted records out as flat CSV files.
pub struct ReportExporter {
    output_dir: PathBuf,
}

impl ReportExporter {
    pub fn new(output_dir: impl Into<PathBuf>) -> Self {
        Self { output_dir: output_dir.into() }
    }

    pub fn file_for(&self, partition: Partition) -> PathBuf {
        self.output_dir.join(format!("{}.csv", partition.table()))
    }

    /// Dedup both tables, then export from one consistent snapshot.
    pub async fn export(&self, store: &RecordStore) -> Result<ExportSummary> {
        let regular_dedup = store.deduplicate(Partition::Regular).await?;
        let coinbase_dedup = store.deduplicate(Partition::Coinbase).await?;
        let (regular, coinbase) = store.snapshot().await?;

        std::fs::create_dir_all(&self.output_dir)?;
        write_records(&self.file_for(Partition::Regular), &regular)?;
        write_records(&self.file_for(Partition::Coinbase), &coinbase)?;
        info!(
            dir = %self.output_dir.display(),
            regular = regular.len(),
            coinbase = coinbase.len(),
            "records exported"
        );

        Ok(ExportSummary {
            regular: regular.len(),
            coinbase: coinbase.len(),
            regular_dedup,
            coinbase_dedup,
        })
    }

    /// Appends to `events.csv`, writing the header only when the file is new.
    pub fn append_summaries(&self, summaries: &[EventSummary]) -> Result<PathBuf> {
        std::fs::create_dir_all(&self.output_dir)?;
        let path = self.output_dir.join(EVENTS_SUMMARY_FILE);
        let fresh = std::fs::metadata(&path).map(|m| m.len() == 0).unwrap_or(true);
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        let mut writer = csv::WriterBuilder::new().has_headers(fresh).from_writer(file);
        for summary in summaries {
            writer.serialize(summary)?;
        }
        writer.flush()?;
        Ok(path)
    }
}

/// One row per record, columns in `AddressRecord` field order.
pub fn write_records(path: &Path, records: &[AddressRecord]) -> Result<()> {
    let mut writer = csv::Writer::from_path(path)?;
    if records.is_empty() {
        writer.write_record(RECORD_HEADER)?;
    }
    for record in records {
        writer.serialize(record)?;
    }
    writer.flush()?;
    Ok(())
}

const RECORD_HEADER: [&str; 11] = [
    "address",
    "value",
    "percentage_of_total",
    "txid",
    "tx_time",
    "event_time",
    "price_change",
    "occurrence_count",
    "btc_in",
    "btc_out",
    "label",
];

#[cfg(test)]
mod tests {
    use super::*;

    fn record(address: &str, occurrence_count: i64) -> AddressRecord {
        AddressRecord {
            address: address.to_string(),
            value: 1_200.0,
            percentage_of_total: 1.0,
            txid: "t1".into(),
            tx_time: "2024-08-27T20:00:00Z".into(),
            event_time: "2024-08-27T20:23:00Z".into(),
            price_change: -3.7,
            occurrence_count,
            btc_in: 1_200.0,
            btc_out: 0.0,
            label: "whale".into(),
        }
    }

    #[tokio::test]
    async fn export_dedups_and_mirrors_record_columns() {
        let dir = tempfile::tempdir().unwrap();
        let store = RecordStore::in_memory().await.unwrap();
        store
            .insert(Partition::Regular, &[record("a", 1), record("a", 2)])
            .await
            .unwrap();

        let exporter = ReportExporter::new(dir.path());
        let summary = exporter.export(&store).await.unwrap();
        assert_eq!(summary.regular, 1);
        assert_eq!(summary.regular_dedup.removed(), 1);
        assert_eq!(summary.coinbase, 0);

        let text = std::fs::read_to_string(exporter.file_for(Partition::Regular)).unwrap();
        let mut lines = text.lines();
        assert_eq!(lines.next().unwrap(), RECORD_HEADER.join(","));
        assert_eq!(
            lines.next().unwrap(),
            "a,1200.0,1.0,t1,2024-08-27T20:00:00Z,2024-08-27T20:23:00Z,-3.7,2,1200.0,0.0,whale"
        );
        assert!(lines.next().is_none());

        let coinbase = std::fs::read_to_string(exporter.file_for(Partition::Coinbase)).unwrap();
        assert_eq!(coinbase.trim_end(), RECORD_HEADER.join(","));
    }

    #[test]
    fn summaries_append_with_a_single_header() {
        let dir = tempfile::tempdir().unwrap();
        let exporter = ReportExporter::new(dir.path());
        let summary = EventSummary { filter_name: "whales".into(), ..Default::default() };

        exporter.append_summaries(&[summary.clone()]).unwrap();
        let path = exporter.append_summaries(&[summary]).unwrap();

        let text = std::fs::read_to_string(path).unwrap();
        assert_eq!(text.lines().count(), 3);
        assert!(text.starts_with("filter_name,"));
    }

    #[test]
    fn output_type_counts_fit_in_one_cell() {
        let dir = tempfile::tempdir().unwrap();
        let exporter = ReportExporter::new(dir.path());
        let summary = EventSummary {
            filter_name: "whales".into(),
            total_outputs: 3,
            output_types: [("nulldata".to_string(), 1), ("pubkey".to_string(), 2)].into(),
            ..Default::default()
        };

        let path = exporter.append_summaries(&[summary]).unwrap();

        let text = std::fs::read_to_string(path).unwrap();
        let mut lines = text.lines();
        let header: Vec<&str> = lines.next().unwrap().split(',').collect();
        let row: Vec<&str> = lines.next().unwrap().split(',').collect();
        assert_eq!(header.len(), row.len());
        let col = header.iter().position(|h| *h == "output_types").unwrap();
        assert_eq!(row[col], "nulldata=1;pubkey=2");
    }
}
