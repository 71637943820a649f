use std::str::FromStr;
use std::time::{SystemTime, UNIX_EPOCH};

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{Sqlite, SqlitePool, Transaction};
use tracing::{debug, info};

use super::models::{DedupStats, PartitionStatsRow};
use crate::aggregator::dedup;
use crate::error::Result;
use crate::types::{AddressRecord, Partition};

const RECORD_COLUMNS: &str = "address, value, percentage_of_total, txid, tx_time, event_time, \
     price_change, occurrence_count, btc_in, btc_out, label";

/// SQLite-backed AddressRecord store, one table per partition.
#[derive(Clone)]
pub struct RecordStore {
    pool: SqlitePool,
}

impl RecordStore {
    pub async fn open(path: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(&format!("sqlite:{path}"))?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal);
        let pool = SqlitePoolOptions::new().connect_with(options).await?;
        sqlx::migrate!("./migrations").run(&pool).await?;
        info!("Database ready at {path}");
        Ok(Self { pool })
    }

    /// Private in-memory database. A single connection keeps every query on it.
    #[cfg(test)]
    pub async fn in_memory() -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await?;
        sqlx::migrate!("./migrations").run(&pool).await?;
        Ok(Self { pool })
    }

    /// Appends records in one transaction.
    pub async fn insert(&self, partition: Partition, records: &[AddressRecord]) -> Result<u64> {
        if records.is_empty() {
            return Ok(0);
        }
        let mut tx = self.pool.begin().await?;
        let inserted = insert_rows(&mut tx, partition, records, now_secs()).await?;
        tx.commit().await?;
        debug!(%partition, inserted, "records appended");
        Ok(inserted)
    }

    /// Collapses rows sharing a record key inside one transaction, summing
    /// their occurrence counts. Rewrites only when something merged.
    pub async fn deduplicate(&self, partition: Partition) -> Result<DedupStats> {
        let mut tx = self.pool.begin().await?;
        let rows = select_all(&mut tx, partition).await?;
        let before = rows.len() as u64;
        let kept = dedup(rows);
        let after = kept.len() as u64;

        if after < before {
            sqlx::query(&format!("DELETE FROM {}", partition.table()))
                .execute(&mut *tx)
                .await?;
            insert_rows(&mut tx, partition, &kept, now_secs()).await?;
        }
        tx.commit().await?;

        let stats = DedupStats { before, after };
        info!(%partition, before, after, removed = stats.removed(), "dedup pass complete");
        Ok(stats)
    }

    /// Both partitions read inside a single transaction.
    pub async fn snapshot(&self) -> Result<(Vec<AddressRecord>, Vec<AddressRecord>)> {
        let mut tx = self.pool.begin().await?;
        let regular = select_all(&mut tx, Partition::Regular).await?;
        let coinbase = select_all(&mut tx, Partition::Coinbase).await?;
        tx.commit().await?;
        Ok((regular, coinbase))
    }

    pub async fn recent(
        &self,
        partition: Partition,
        limit: i64,
        min_percentage: f64,
    ) -> Result<Vec<AddressRecord>> {
        let sql = format!(
            "SELECT {RECORD_COLUMNS} FROM {} WHERE percentage_of_total >= ? \
             ORDER BY recorded_at DESC, id DESC LIMIT ?",
            partition.table()
        );
        let rows = sqlx::query_as::<_, AddressRecord>(&sql)
            .bind(min_percentage)
            .bind(limit)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows)
    }

    pub async fn stats(&self, partition: Partition) -> Result<PartitionStatsRow> {
        let sql = format!(
            "SELECT COUNT(*) AS records, COUNT(DISTINCT address) AS unique_addresses, \
             COUNT(DISTINCT event_time) AS events, SUM(value) AS total_value, \
             MAX(recorded_at) AS last_recorded_at FROM {}",
            partition.table()
        );
        let row = sqlx::query_as::<_, PartitionStatsRow>(&sql)
            .fetch_one(&self.pool)
            .await?;
        Ok(row)
    }
}

async fn select_all(tx: &mut Transaction<'_, Sqlite>, partition: Partition) -> Result<Vec<AddressRecord>> {
    let sql = format!("SELECT {RECORD_COLUMNS} FROM {} ORDER BY id", partition.table());
    let rows = sqlx::query_as::<_, AddressRecord>(&sql)
        .fetch_all(&mut **tx)
        .await?;
    Ok(rows)
}

async fn insert_rows(
    tx: &mut Transaction<'_, Sqlite>,
    partition: Partition,
    records: &[AddressRecord],
    recorded_at: i64,
) -> Result<u64> {
    let sql = format!(
        "INSERT INTO {} ({RECORD_COLUMNS}, recorded_at) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        partition.table()
    );
    let mut inserted = 0;
    for r in records {
        inserted += sqlx::query(&sql)
            .bind(&r.address)
            .bind(r.value)
            .bind(r.percentage_of_total)
            .bind(&r.txid)
            .bind(&r.tx_time)
            .bind(&r.event_time)
            .bind(r.price_change)
            .bind(r.occurrence_count)
            .bind(r.btc_in)
            .bind(r.btc_out)
            .bind(&r.label)
            .bind(recorded_at)
            .execute(&mut **tx)
            .await?
            .rows_affected();
    }
    Ok(inserted)
}

fn now_secs() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(address: &str, event_time: &str, occurrence_count: i64) -> AddressRecord {
        AddressRecord {
            address: address.to_string(),
            value: 1_200.0,
            percentage_of_total: 1.0,
            txid: "t1".to_string(),
            tx_time: "2024-08-27T20:00:00Z".to_string(),
            event_time: event_time.to_string(),
            price_change: -3.7,
            occurrence_count,
            btc_in: 1_200.0,
            btc_out: 0.0,
            label: String::new(),
        }
    }

    #[tokio::test]
    async fn insert_and_snapshot_keep_partitions_apart() {
        let store = RecordStore::in_memory().await.unwrap();
        store.insert(Partition::Regular, &[record("a", "E1", 1)]).await.unwrap();
        store.insert(Partition::Coinbase, &[record("miner", "E1", 1)]).await.unwrap();

        let (regular, coinbase) = store.snapshot().await.unwrap();
        assert_eq!(regular, vec![record("a", "E1", 1)]);
        assert_eq!(coinbase, vec![record("miner", "E1", 1)]);
    }

    #[tokio::test]
    async fn dedup_pass_sums_counts_and_respects_event_time() {
        let store = RecordStore::in_memory().await.unwrap();
        store
            .insert(
                Partition::Regular,
                &[record("a", "E1", 1), record("a", "E1", 3), record("a", "E1", 2), record("a", "E2", 1)],
            )
            .await
            .unwrap();

        let first = store.deduplicate(Partition::Regular).await.unwrap();
        assert_eq!(first, DedupStats { before: 4, after: 2 });
        let (after_once, _) = store.snapshot().await.unwrap();

        let second = store.deduplicate(Partition::Regular).await.unwrap();
        assert_eq!(second, DedupStats { before: 2, after: 2 });
        let (after_twice, _) = store.snapshot().await.unwrap();

        assert_eq!(after_once, after_twice);
        let e1 = after_once.iter().find(|r| r.event_time == "E1").unwrap();
        assert_eq!(e1.occurrence_count, 6);
        assert!(after_once.iter().any(|r| r.event_time == "E2"));
    }

    #[tokio::test]
    async fn recent_filters_by_percentage() {
        let store = RecordStore::in_memory().await.unwrap();
        let mut small = record("b", "E1", 1);
        small.percentage_of_total = 0.01;
        store.insert(Partition::Regular, &[record("a", "E1", 1), small]).await.unwrap();

        let rows = store.recent(Partition::Regular, 10, 0.5).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].address, "a");

        let stats = store.stats(Partition::Regular).await.unwrap();
        assert_eq!(stats.records, 2);
        assert_eq!(stats.unique_addresses, 2);
        assert_eq!(stats.events, 1);
    }
}
