use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::debug;

use super::{Block, BlockHeader, ChainSource, RawTransaction, TxInput, TxOutput};
use crate::config::Config;
use crate::error::{AppError, Result};

/// `getblock` verbosity that includes `prevout` on every non-coinbase input.
const VERBOSITY_WITH_PREVOUT: u8 = 3;

/// Bitcoin Core JSON-RPC client.
pub struct BitcoinRpc {
    client: reqwest::Client,
    url: String,
    user: Option<String>,
    password: Option<String>,
    next_id: AtomicU64,
}

impl BitcoinRpc {
    pub fn new(cfg: &Config) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(cfg.rpc_timeout_secs))
            .build()?;
        Ok(Self {
            client,
            url: cfg.rpc_url.clone(),
            user: cfg.rpc_user.clone(),
            password: cfg.rpc_password.clone(),
            next_id: AtomicU64::new(1),
        })
    }

    async fn call<T: DeserializeOwned>(&self, method: &str, params: Value) -> Result<T> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let body = json!({
            "jsonrpc": "1.0",
            "id": id,
            "method": method,
            "params": params,
        });

        let mut req = self.client.post(&self.url).json(&body);
        if let Some(user) = &self.user {
            req = req.basic_auth(user, self.password.as_deref());
        }

        let resp = req.send().await?;
        let status = resp.status();
        if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
            return Err(AppError::Configuration(format!(
                "RPC authentication rejected ({status}); check RPC_USER / RPC_PASSWORD"
            )));
        }

        // Core answers RPC-level failures with a 500 and a JSON error body.
        let text = resp.text().await?;
        debug!(method, id, status = status.as_u16(), bytes = text.len(), "rpc response");
        let envelope: RpcEnvelope<T> = serde_json::from_str(&text)?;
        match (envelope.result, envelope.error) {
            (_, Some(err)) => Err(AppError::Rpc { code: err.code, message: err.message }),
            (Some(result), None) => Ok(result),
            (None, None) => Err(AppError::Rpc {
                code: 0,
                message: format!("{method} returned neither result nor error"),
            }),
        }
    }

    async fn block_hash(&self, height: u64) -> Result<String> {
        self.call("getblockhash", json!([height])).await
    }
}

#[async_trait]
impl ChainSource for BitcoinRpc {
    async fn block_count(&self) -> Result<u64> {
        self.call("getblockcount", json!([])).await
    }

    async fn block_header(&self, height: u64) -> Result<BlockHeader> {
        let hash = self.block_hash(height).await?;
        let raw: RawHeader = self.call("getblockheader", json!([hash, true])).await?;
        Ok(raw.into_header())
    }

    async fn block(&self, height: u64) -> Result<Block> {
        let hash = self.block_hash(height).await?;
        let raw: RawBlock = self
            .call("getblock", json!([hash, VERBOSITY_WITH_PREVOUT]))
            .await?;
        Ok(raw.into_block())
    }

    async fn transaction(&self, txid: &str) -> Result<RawTransaction> {
        let raw: RawTx = self.call("getrawtransaction", json!([txid, true])).await?;
        Ok(raw.into_tx())
    }
}

// ---------------------------------------------------------------------------
// Wire shapes
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct RpcEnvelope<T> {
    result: Option<T>,
    error: Option<RpcErrorBody>,
}

#[derive(Debug, Deserialize)]
struct RpcErrorBody {
    code: i64,
    message: String,
}

#[derive(Debug, Deserialize)]
struct RawHeader {
    hash: String,
    height: u64,
    time: i64,
    #[serde(rename = "previousblockhash")]
    previous_hash: Option<String>,
}

impl RawHeader {
    fn into_header(self) -> BlockHeader {
        BlockHeader {
            height: self.height,
            hash: self.hash,
            previous_hash: self.previous_hash,
            time: self.time,
        }
    }
}

#[derive(Debug, Deserialize)]
struct RawBlock {
    #[serde(flatten)]
    header: RawHeader,
    #[serde(default)]
    tx: Vec<RawTx>,
}

impl RawBlock {
    fn into_block(self) -> Block {
        Block {
            header: self.header.into_header(),
            txs: self.tx.into_iter().map(RawTx::into_tx).collect(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct RawTx {
    txid: String,
    #[serde(default)]
    vin: Vec<RawVin>,
    #[serde(default)]
    vout: Vec<RawVout>,
}

impl RawTx {
    fn into_tx(self) -> RawTransaction {
        RawTransaction {
            txid: self.txid,
            inputs: self
                .vin
                .into_iter()
                .map(|vin| TxInput {
                    coinbase: vin.coinbase.is_some(),
                    prev_txid: vin.txid,
                    prev_vout: vin.vout,
                    prevout: vin.prevout.map(|p| {
                        let (address, script_type) = p.script_pub_key.into_parts();
                        TxOutput { n: vin.vout.unwrap_or_default(), value: p.value, address, script_type }
                    }),
                })
                .collect(),
            outputs: self
                .vout
                .into_iter()
                .map(|o| {
                    let (address, script_type) = o.script_pub_key.into_parts();
                    TxOutput { n: o.n, value: o.value, address, script_type }
                })
                .collect(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct RawVin {
    coinbase: Option<String>,
    txid: Option<String>,
    vout: Option<u32>,
    prevout: Option<RawPrevout>,
}

#[derive(Debug, Deserialize)]
struct RawPrevout {
    value: f64,
    #[serde(rename = "scriptPubKey", default)]
    script_pub_key: RawScriptPubKey,
}

#[derive(Debug, Deserialize)]
struct RawVout {
    value: f64,
    n: u32,
    #[serde(rename = "scriptPubKey", default)]
    script_pub_key: RawScriptPubKey,
}

#[derive(Debug, Default, Deserialize)]
struct RawScriptPubKey {
    address: Option<String>,
    /// Pre-22.0 nodes report a list instead of `address`.
    addresses: Option<Vec<String>>,
    #[serde(rename = "type")]
    kind: Option<String>,
}

impl RawScriptPubKey {
    /// Address (if any) and script type (`unknown` when the node omits it).
    fn into_parts(self) -> (Option<String>, String) {
        let address = self
            .address
            .or_else(|| self.addresses.and_then(|a| a.into_iter().next()));
        (address, self.kind.unwrap_or_else(|| "unknown".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verbosity_three_block_maps_prevouts_and_coinbase() {
        let raw = r#"{
            "hash": "00ab", "height": 860000, "time": 1724790000,
            "previousblockhash": "00aa",
            "tx": [
                {"txid": "cb", "vin": [{"coinbase": "03abcd", "sequence": 4294967295}],
                 "vout": [{"value": 3.125, "n": 0, "scriptPubKey": {"address": "bc1qminer"}}]},
                {"txid": "t1",
                 "vin": [{"txid": "p0", "vout": 1,
                          "prevout": {"value": 1300.0, "scriptPubKey": {"address": "bc1qsender"}}}],
                 "vout": [{"value": 1200.0, "n": 0, "scriptPubKey": {"address": "bc1qwhale"}},
                          {"value": 0.0, "n": 1, "scriptPubKey": {"type": "nulldata"}}]}
            ]
        }"#;
        let block = serde_json::from_str::<RawBlock>(raw).unwrap().into_block();

        assert_eq!(block.header.previous_hash.as_deref(), Some("00aa"));
        assert!(block.txs[0].is_coinbase());
        assert!(!block.txs[1].is_coinbase());

        let spent = block.txs[1].inputs[0].prevout.as_ref().unwrap();
        assert_eq!(spent.address.as_deref(), Some("bc1qsender"));
        assert_eq!(spent.n, 1);
        assert_eq!(block.txs[1].outputs[1].address, None);
        assert_eq!(block.txs[1].outputs[1].script_type, "nulldata");
        assert_eq!(block.txs[1].outputs[0].script_type, "unknown");
        assert!((block.txs[1].total_output_value() - 1200.0).abs() < 1e-9);
    }

    #[test]
    fn legacy_address_list_is_accepted() {
        let raw = r#"{"txid": "t", "vin": [], "vout": [
            {"value": 1.0, "n": 0, "scriptPubKey": {"addresses": ["1Legacy"]}}]}"#;
        let tx = serde_json::from_str::<RawTx>(raw).unwrap().into_tx();
        assert_eq!(tx.outputs[0].address.as_deref(), Some("1Legacy"));
    }

    #[test]
    fn error_envelope_carries_code() {
        let raw = r#"{"result": null, "error": {"code": -28, "message": "Loading block index..."}, "id": 1}"#;
        let env: RpcEnvelope<u64> = serde_json::from_str(raw).unwrap();
        let err = env.error.unwrap();
        assert_eq!(err.code, -28);
    }
}
