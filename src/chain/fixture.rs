//! In-memory chain used by unit tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;

use super::{Block, BlockHeader, ChainSource, RawTransaction, TxInput, TxOutput};
use crate::error::{AppError, Result};

#[derive(Default)]
pub struct FixtureChain {
    blocks: Mutex<Vec<Block>>,
    /// Transactions only reachable by txid (spent outputs of fixture txs).
    loose: Mutex<HashMap<String, RawTransaction>>,
    /// The next N calls fail with a transient error.
    transient_failures: AtomicU32,
    /// Serve `block(h)` once with a broken parent link.
    reorg_once_at: Mutex<Option<u64>>,
    pub block_calls: AtomicU32,
}

impl FixtureChain {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a block at the next height.
    pub fn push_block(&self, time: i64, txs: Vec<RawTransaction>) -> u64 {
        let mut blocks = self.blocks.lock().unwrap();
        let height = blocks.len() as u64;
        let previous_hash = blocks.last().map(|b| b.header.hash.clone());
        blocks.push(Block {
            header: BlockHeader {
                height,
                hash: format!("{height:08x}-{time}"),
                previous_hash,
                time,
            },
            txs,
        });
        height
    }

    /// `count` empty blocks spaced `spacing` seconds apart after the current tip.
    pub fn extend(&self, count: u64, spacing: i64) {
        for _ in 0..count {
            let next_time = {
                let blocks = self.blocks.lock().unwrap();
                blocks.last().map_or(0, |b| b.header.time + spacing)
            };
            self.push_block(next_time, vec![]);
        }
    }

    pub fn add_loose_tx(&self, tx: RawTransaction) {
        self.loose.lock().unwrap().insert(tx.txid.clone(), tx);
    }

    pub fn fail_next(&self, n: u32) {
        self.transient_failures.store(n, Ordering::SeqCst);
    }

    pub fn reorg_once_at(&self, height: u64) {
        *self.reorg_once_at.lock().unwrap() = Some(height);
    }

    fn maybe_fail(&self) -> Result<()> {
        let remaining = self.transient_failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.transient_failures.store(remaining - 1, Ordering::SeqCst);
            return Err(AppError::Io(std::io::Error::new(
                std::io::ErrorKind::ConnectionReset,
                "fixture: connection reset",
            )));
        }
        Ok(())
    }

    fn get(&self, height: u64) -> Result<Block> {
        self.blocks
            .lock()
            .unwrap()
            .get(height as usize)
            .cloned()
            .ok_or_else(|| AppError::Rpc {
                code: -8,
                message: format!("Block height {height} out of range"),
            })
    }
}

#[async_trait]
impl ChainSource for FixtureChain {
    async fn block_count(&self) -> Result<u64> {
        self.maybe_fail()?;
        Ok((self.blocks.lock().unwrap().len() as u64).saturating_sub(1))
    }

    async fn block_header(&self, height: u64) -> Result<BlockHeader> {
        self.maybe_fail()?;
        Ok(self.get(height)?.header)
    }

    async fn block(&self, height: u64) -> Result<Block> {
        self.maybe_fail()?;
        self.block_calls.fetch_add(1, Ordering::SeqCst);
        let mut block = self.get(height)?;
        let mut reorg = self.reorg_once_at.lock().unwrap();
        if *reorg == Some(height) {
            *reorg = None;
            block.header.previous_hash = Some("orphaned-parent".to_string());
        }
        Ok(block)
    }

    async fn transaction(&self, txid: &str) -> Result<RawTransaction> {
        self.maybe_fail()?;
        if let Some(tx) = self.loose.lock().unwrap().get(txid) {
            return Ok(tx.clone());
        }
        self.blocks
            .lock()
            .unwrap()
            .iter()
            .flat_map(|b| b.txs.iter())
            .find(|tx| tx.txid == txid)
            .cloned()
            .ok_or_else(|| AppError::Rpc {
                code: -5,
                message: format!("No such transaction {txid}"),
            })
    }
}

// ---------------------------------------------------------------------------
// Transaction builders
// ---------------------------------------------------------------------------

/// Segwit output when addressed, `OP_RETURN` otherwise.
pub fn output(n: u32, value: f64, address: Option<&str>) -> TxOutput {
    let script_type = if address.is_some() { "witness_v0_keyhash" } else { "nulldata" };
    typed_output(n, value, address, script_type)
}

pub fn typed_output(n: u32, value: f64, address: Option<&str>, script_type: &str) -> TxOutput {
    TxOutput {
        n,
        value,
        address: address.map(str::to_string),
        script_type: script_type.to_string(),
    }
}

/// Input with its spent output inline.
pub fn spend(prev_txid: &str, prev_vout: u32, value: f64, address: Option<&str>) -> TxInput {
    TxInput {
        coinbase: false,
        prev_txid: Some(prev_txid.to_string()),
        prev_vout: Some(prev_vout),
        prevout: Some(output(prev_vout, value, address)),
    }
}

/// Input without `prevout`; the scanner must look the spent output up.
pub fn spend_by_ref(prev_txid: &str, prev_vout: u32) -> TxInput {
    TxInput {
        coinbase: false,
        prev_txid: Some(prev_txid.to_string()),
        prev_vout: Some(prev_vout),
        prevout: None,
    }
}

pub fn tx(txid: &str, inputs: Vec<TxInput>, outputs: Vec<TxOutput>) -> RawTransaction {
    RawTransaction { txid: txid.to_string(), inputs, outputs }
}

pub fn coinbase_tx(txid: &str, miner: &str, reward: f64) -> RawTransaction {
    RawTransaction {
        txid: txid.to_string(),
        inputs: vec![TxInput { coinbase: true, prev_txid: None, prev_vout: None, prevout: None }],
        outputs: vec![output(0, reward, Some(miner))],
    }
}
