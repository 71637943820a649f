//! Read-only view of the chain the scanner and scheduler work against.
//!
//! `ChainSource` is the whole capability surface the core needs: current
//! height, headers by height, full blocks by height and a transaction lookup
//! for resolving spent outputs. `rpc::BitcoinRpc` implements it over Bitcoin
//! Core JSON-RPC.

pub mod rpc;

#[cfg(test)]
pub mod fixture;

use async_trait::async_trait;

use crate::error::Result;

#[derive(Debug, Clone, PartialEq)]
pub struct BlockHeader {
    pub height: u64,
    pub hash: String,
    /// `None` only for the genesis block.
    pub previous_hash: Option<String>,
    /// Unix seconds.
    pub time: i64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Block {
    pub header: BlockHeader,
    pub txs: Vec<RawTransaction>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TxOutput {
    pub n: u32,
    pub value: f64,
    /// Absent for non-standard scripts such as `OP_RETURN`.
    pub address: Option<String>,
    /// Node's `scriptPubKey.type`, e.g. `witness_v0_keyhash`, `pubkey`, `nulldata`.
    pub script_type: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TxInput {
    pub coinbase: bool,
    pub prev_txid: Option<String>,
    pub prev_vout: Option<u32>,
    /// Spent output when the source includes it inline.
    pub prevout: Option<TxOutput>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RawTransaction {
    pub txid: String,
    pub inputs: Vec<TxInput>,
    pub outputs: Vec<TxOutput>,
}

impl RawTransaction {
    /// Block reward: the first input carries no real previous output.
    pub fn is_coinbase(&self) -> bool {
        self.inputs.first().map_or(false, |vin| vin.coinbase)
    }

    pub fn total_output_value(&self) -> f64 {
        self.outputs.iter().map(|o| o.value).sum()
    }
}

#[async_trait]
pub trait ChainSource: Send + Sync {
    /// Height of the current chain tip.
    async fn block_count(&self) -> Result<u64>;

    async fn block_header(&self, height: u64) -> Result<BlockHeader>;

    /// Block at `height` with full transaction detail.
    async fn block(&self, height: u64) -> Result<Block>;

    async fn transaction(&self, txid: &str) -> Result<RawTransaction>;
}
