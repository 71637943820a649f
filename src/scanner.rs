use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::stream::{self, Stream, TryStreamExt};
use tracing::{debug, warn};

use crate::chain::{Block, BlockHeader, ChainSource, RawTransaction, TxInput, TxOutput};
use crate::config::{RETRY_BASE_MS, RETRY_MAX_ATTEMPTS, RETRY_MAX_MS};
use crate::error::{AppError, Result};
use crate::types::{Direction, ScanWindow, TransactionObservation, ValueBand, ValueTuple, WindowUnit};
use crate::window;

/// Exponential backoff for chain source calls.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_ms: u64,
    pub max_ms: u64,
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (1-based): base, 2×base, 4×base, ... capped.
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 1u64.checked_shl(attempt.saturating_sub(1)).unwrap_or(u64::MAX);
        Duration::from_millis(self.base_ms.saturating_mul(factor).min(self.max_ms))
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: RETRY_MAX_ATTEMPTS,
            base_ms: RETRY_BASE_MS,
            max_ms: RETRY_MAX_MS,
        }
    }
}

pub async fn with_retry<T, F, Fut>(policy: &RetryPolicy, op: &str, mut f: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempts = 0u32;
    loop {
        attempts += 1;
        match f().await {
            Ok(v) => return Ok(v),
            Err(e) if !e.is_transient() => return Err(e),
            Err(e) if attempts >= policy.max_attempts => {
                warn!(op, attempts, error = %e, "chain source still failing, giving up");
                return Err(AppError::SourceUnavailable { attempts, reason: e.to_string() });
            }
            Err(e) => {
                let delay = policy.delay(attempts);
                debug!(op, attempt = attempts, delay_ms = delay.as_millis() as u64, error = %e, "retrying");
                tokio::time::sleep(delay).await;
            }
        }
    }
}

/// Chain source whose every call goes through `with_retry`.
struct Retrying<'a> {
    inner: &'a dyn ChainSource,
    policy: RetryPolicy,
}

#[async_trait]
impl ChainSource for Retrying<'_> {
    async fn block_count(&self) -> Result<u64> {
        with_retry(&self.policy, "block_count", || self.inner.block_count()).await
    }

    async fn block_header(&self, height: u64) -> Result<BlockHeader> {
        with_retry(&self.policy, "block_header", || self.inner.block_header(height)).await
    }

    async fn block(&self, height: u64) -> Result<Block> {
        with_retry(&self.policy, "block", || self.inner.block(height)).await
    }

    async fn transaction(&self, txid: &str) -> Result<RawTransaction> {
        with_retry(&self.policy, "transaction", || self.inner.transaction(txid)).await
    }
}

enum Cursor {
    Start,
    At { next: u64, end: u64, parent: Option<String> },
}

/// Walks a window block by block and yields the transactions whose total
/// output value falls in the band.
#[derive(Clone)]
pub struct TransactionScanner {
    source: Arc<dyn ChainSource>,
    retry: RetryPolicy,
}

impl TransactionScanner {
    pub fn new(source: Arc<dyn ChainSource>, retry: RetryPolicy) -> Self {
        Self { source, retry }
    }

    fn retrying(&self) -> Retrying<'_> {
        Retrying { inner: self.source.as_ref(), policy: self.retry }
    }

    pub async fn tip(&self) -> Result<u64> {
        self.retrying().block_count().await
    }

    pub async fn header(&self, height: u64) -> Result<BlockHeader> {
        self.retrying().block_header(height).await
    }

    /// Lazy and restartable: nothing is fetched until polled, and calling
    /// `scan` again with the same arguments re-derives the same sequence.
    /// A broken parent link between consecutive blocks ends the stream with
    /// `ReorgDetected`.
    pub fn scan(
        &self,
        window: ScanWindow,
        band: ValueBand,
    ) -> impl Stream<Item = Result<TransactionObservation>> + Send + '_ {
        stream::try_unfold(Cursor::Start, move |cursor| async move {
            let (height, end, parent) = match cursor {
                Cursor::Start => {
                    match window::height_range(&self.retrying(), &window).await? {
                        Some((start, end)) => {
                            debug!(%window, start, end, "scan range");
                            (start, end, None)
                        }
                        None => return Ok(None),
                    }
                }
                Cursor::At { next, end, parent } => (next, end, parent),
            };
            if height > end {
                return Ok(None);
            }

            let block = self.retrying().block(height).await?;
            if let Some(expected) = parent {
                if block.header.previous_hash.as_deref() != Some(expected.as_str()) {
                    return Err(AppError::ReorgDetected {
                        height,
                        expected,
                        actual: block.header.previous_hash.clone().unwrap_or_default(),
                    });
                }
            }

            let observations = if window.unit == WindowUnit::Time
                && !window.contains_time(block.header.time)
            {
                Vec::new()
            } else {
                self.observe_block(&block, band).await?
            };

            let next = Cursor::At { next: height + 1, end, parent: Some(block.header.hash) };
            Ok::<_, AppError>(Some((stream::iter(observations.into_iter().map(Ok::<_, AppError>)), next)))
        })
        .try_flatten()
    }

    async fn observe_block(&self, block: &Block, band: ValueBand) -> Result<Vec<TransactionObservation>> {
        let mut out = Vec::new();
        for tx in &block.txs {
            let total_value = tx.total_output_value();
            if !band.contains(total_value) {
                continue;
            }
            let is_coinbase = tx.is_coinbase();

            let mut tuples: Vec<ValueTuple> = tx
                .outputs
                .iter()
                .filter_map(|o| {
                    o.address.as_ref().map(|address| ValueTuple {
                        address: address.clone(),
                        value: o.value,
                        direction: Direction::In,
                        index: o.n,
                    })
                })
                .collect();

            let mut output_types: BTreeMap<String, u64> = BTreeMap::new();
            for o in &tx.outputs {
                *output_types.entry(o.script_type.clone()).or_default() += 1;
            }

            // Coinbase inputs spend nothing.
            let mut fee = None;
            if !is_coinbase {
                let mut spent_total = Some(0.0);
                for (i, vin) in tx.inputs.iter().enumerate() {
                    let spent = match &vin.prevout {
                        Some(prevout) => Some(prevout.clone()),
                        None => self.lookup_prevout(vin).await?,
                    };
                    spent_total = spent_total.zip(spent.as_ref()).map(|(sum, o)| sum + o.value);
                    if let Some(TxOutput { value, address: Some(address), .. }) = spent {
                        tuples.push(ValueTuple {
                            address,
                            value,
                            direction: Direction::Out,
                            index: i as u32,
                        });
                    }
                }
                fee = spent_total.map(|spent| spent - total_value);
            }

            out.push(TransactionObservation {
                txid: tx.txid.clone(),
                tx_time: block.header.time,
                block_height: block.header.height,
                is_coinbase,
                total_value,
                fee,
                output_types,
                tuples,
            });
        }
        Ok(out)
    }

    async fn lookup_prevout(&self, vin: &TxInput) -> Result<Option<TxOutput>> {
        let (Some(txid), Some(vout)) = (&vin.prev_txid, vin.prev_vout) else {
            return Ok(None);
        };
        match self.retrying().transaction(txid).await {
            Ok(prev) => Ok(prev.outputs.into_iter().find(|o| o.n == vout)),
            // Pruned or unindexed node: the spent output is simply unknown.
            Err(AppError::Rpc { code, message }) => {
                warn!(txid = %txid, vout, code, %message, "spent output unavailable, input skipped");
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }
}
