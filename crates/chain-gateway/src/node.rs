//! Node clients: the seam between the gateway and a chain's full node.
//!
//! `BitcoinRpc` speaks bitcoind-style JSON-RPC, `SkycoinRest` the skycoin
//! REST API. `InMemory` is a self-contained chain simulation used by tests
//! and offline development; it honors spends, so a double spend of the same
//! outpoint fails exactly like it would against a real node.

use crate::tx::RawTransaction;
use crate::GatewayError;
use common_types::{CoinType, OutpointId, OutputRecord, TxOutput, TxRecord, Utxo};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

pub enum NodeClient {
    BitcoinRpc(BitcoinRpc),
    SkycoinRest(SkycoinRest),
    InMemory(InMemoryNode),
}

impl NodeClient {
    pub async fn utxos(&self, addrs: &[String]) -> Result<Vec<Utxo>, GatewayError> {
        match self {
            NodeClient::BitcoinRpc(rpc) => rpc.utxos(addrs).await,
            NodeClient::SkycoinRest(rest) => rest.utxos(addrs).await,
            NodeClient::InMemory(node) => Ok(node.utxos(addrs)),
        }
    }

    pub async fn transaction(&self, txid: &str) -> Result<TxRecord, GatewayError> {
        match self {
            NodeClient::BitcoinRpc(rpc) => rpc.transaction(txid).await,
            NodeClient::SkycoinRest(rest) => rest.transaction(txid).await,
            NodeClient::InMemory(node) => node.transaction(txid),
        }
    }

    pub async fn output(&self, id: &str) -> Result<OutputRecord, GatewayError> {
        match self {
            // Outputs are only addressable relative to a transaction here.
            NodeClient::BitcoinRpc(_) => Err(GatewayError::Unsupported(CoinType::Bitcoin)),
            NodeClient::SkycoinRest(rest) => rest.output(id).await,
            NodeClient::InMemory(node) => node.output(id),
        }
    }

    pub async fn broadcast(&self, raw: &str) -> Result<String, GatewayError> {
        match self {
            NodeClient::BitcoinRpc(rpc) => rpc.broadcast(raw).await,
            NodeClient::SkycoinRest(rest) => rest.broadcast(raw).await,
            NodeClient::InMemory(node) => node.broadcast(raw),
        }
    }
}

// --- bitcoind JSON-RPC ---

pub struct BitcoinRpc {
    http: reqwest::Client,
    url: String,
}

impl BitcoinRpc {
    pub fn new(node_addr: &str) -> Self {
        BitcoinRpc {
            http: reqwest::Client::new(),
            url: format!("http://{}/", node_addr),
        }
    }

    async fn call(&self, method: &str, params: Value) -> Result<Value, GatewayError> {
        let body = json!({
            "jsonrpc": "1.0",
            "id": "exchange",
            "method": method,
            "params": params,
        });
        let resp = self
            .http
            .post(&self.url)
            .json(&body)
            .send()
            .await
            .map_err(|e| GatewayError::NodeUnreachable(e.to_string()))?;
        let reply: Value = resp
            .json()
            .await
            .map_err(|e| GatewayError::NodeUnreachable(e.to_string()))?;
        if !reply["error"].is_null() {
            return Err(GatewayError::NodeUnreachable(reply["error"].to_string()));
        }
        Ok(reply["result"].clone())
    }

    async fn utxos(&self, addrs: &[String]) -> Result<Vec<Utxo>, GatewayError> {
        let result = self
            .call("listunspent", json!([1, 9_999_999, addrs]))
            .await?;
        let entries = result
            .as_array()
            .ok_or_else(|| GatewayError::NodeUnreachable("listunspent: not an array".into()))?;

        let mut utxos = Vec::with_capacity(entries.len());
        for entry in entries {
            let txid = entry["txid"]
                .as_str()
                .ok_or_else(|| GatewayError::NodeUnreachable("listunspent: no txid".into()))?;
            let vout = entry["vout"]
                .as_u64()
                .ok_or_else(|| GatewayError::NodeUnreachable("listunspent: no vout".into()))?;
            let address = entry["address"].as_str().unwrap_or_default();
            let btc = entry["amount"].as_f64().unwrap_or(0.0);
            utxos.push(Utxo::Bitcoin {
                txid: txid.to_string(),
                vout: vout as u32,
                address: address.to_string(),
                amount: (btc * 1e8).round() as u64,
            });
        }
        Ok(utxos)
    }

    async fn transaction(&self, txid: &str) -> Result<TxRecord, GatewayError> {
        let result = self.call("getrawtransaction", json!([txid, true])).await?;
        let mut outputs = Vec::new();
        if let Some(vouts) = result["vout"].as_array() {
            for vout in vouts {
                let address = vout["scriptPubKey"]["address"]
                    .as_str()
                    .unwrap_or_default()
                    .to_string();
                let btc = vout["value"].as_f64().unwrap_or(0.0);
                outputs.push(TxOutput {
                    address,
                    amount: (btc * 1e8).round() as u64,
                });
            }
        }
        Ok(TxRecord {
            txid: txid.to_string(),
            confirmations: result["confirmations"].as_u64().unwrap_or(0),
            outputs,
        })
    }

    async fn broadcast(&self, raw: &str) -> Result<String, GatewayError> {
        let result = self.call("sendrawtransaction", json!([raw])).await?;
        result
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| GatewayError::NodeUnreachable("sendrawtransaction: no txid".into()))
    }
}

// --- skycoin REST ---

pub struct SkycoinRest {
    http: reqwest::Client,
    base: String,
}

impl SkycoinRest {
    pub fn new(node_addr: &str) -> Self {
        SkycoinRest {
            http: reqwest::Client::new(),
            base: format!("http://{}", node_addr),
        }
    }

    async fn get(&self, path: &str) -> Result<Value, GatewayError> {
        self.http
            .get(format!("{}{}", self.base, path))
            .send()
            .await
            .map_err(|e| GatewayError::NodeUnreachable(e.to_string()))?
            .json()
            .await
            .map_err(|e| GatewayError::NodeUnreachable(e.to_string()))
    }

    async fn utxos(&self, addrs: &[String]) -> Result<Vec<Utxo>, GatewayError> {
        let reply = self
            .get(&format!("/api/v1/outputs?addrs={}", addrs.join(",")))
            .await?;
        let entries = reply["head_outputs"]
            .as_array()
            .ok_or_else(|| GatewayError::NodeUnreachable("outputs: no head_outputs".into()))?;

        let mut utxos = Vec::with_capacity(entries.len());
        for entry in entries {
            let uxid = entry["hash"]
                .as_str()
                .ok_or_else(|| GatewayError::NodeUnreachable("outputs: no hash".into()))?;
            let address = entry["address"].as_str().unwrap_or_default();
            let coins = entry["coins"]
                .as_str()
                .and_then(|c| c.parse::<f64>().ok())
                .unwrap_or(0.0);
            utxos.push(Utxo::Skycoin {
                uxid: uxid.to_string(),
                address: address.to_string(),
                amount: (coins * 1e6).round() as u64,
                hours: entry["hours"].as_u64().unwrap_or(0),
            });
        }
        Ok(utxos)
    }

    async fn transaction(&self, txid: &str) -> Result<TxRecord, GatewayError> {
        let reply = self.get(&format!("/api/v1/transaction?txid={}", txid)).await?;
        let confirmed = reply["status"]["confirmed"].as_bool().unwrap_or(false);
        let mut outputs = Vec::new();
        if let Some(outs) = reply["txn"]["outputs"].as_array() {
            for out in outs {
                let coins = out["coins"]
                    .as_str()
                    .and_then(|c| c.parse::<f64>().ok())
                    .unwrap_or(0.0);
                outputs.push(TxOutput {
                    address: out["dst"].as_str().unwrap_or_default().to_string(),
                    amount: (coins * 1e6).round() as u64,
                });
            }
        }
        Ok(TxRecord {
            txid: txid.to_string(),
            confirmations: if confirmed { 1 } else { 0 },
            outputs,
        })
    }

    async fn output(&self, uxid: &str) -> Result<OutputRecord, GatewayError> {
        let reply = self.get(&format!("/api/v1/uxout?uxid={}", uxid)).await?;
        Ok(OutputRecord {
            id: uxid.to_string(),
            address: reply["owner_address"].as_str().unwrap_or_default().to_string(),
            amount: reply["coins"].as_u64().unwrap_or(0),
        })
    }

    async fn broadcast(&self, raw: &str) -> Result<String, GatewayError> {
        let reply = self
            .http
            .post(format!("{}/api/v1/injectTransaction", self.base))
            .json(&json!({ "rawtx": raw }))
            .send()
            .await
            .map_err(|e| GatewayError::NodeUnreachable(e.to_string()))?
            .json::<Value>()
            .await
            .map_err(|e| GatewayError::NodeUnreachable(e.to_string()))?;
        reply
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| GatewayError::NodeUnreachable("injectTransaction: no txid".into()))
    }
}

// --- in-memory chain simulation ---

#[derive(Default)]
struct NodeState {
    utxos: HashMap<OutpointId, Utxo>,
    txs: HashMap<String, TxRecord>,
}

/// A chain backend holding its UTXO set in memory. Broadcast consumes the
/// spent outpoints and materializes the new outputs, so refresh loops and
/// double-spend behavior can be exercised without a node.
#[derive(Clone, Default)]
pub struct InMemoryNode {
    chain: Option<CoinType>,
    state: Arc<Mutex<NodeState>>,
}

impl InMemoryNode {
    pub fn new(chain: CoinType) -> Self {
        InMemoryNode {
            chain: Some(chain),
            state: Arc::new(Mutex::new(NodeState::default())),
        }
    }

    pub fn add_utxo(&self, utxo: Utxo) {
        let mut state = self.state.lock().expect("node state poisoned");
        state.utxos.insert(utxo.outpoint(), utxo);
    }

    pub fn remove_utxo(&self, outpoint: &OutpointId) {
        let mut state = self.state.lock().expect("node state poisoned");
        state.utxos.remove(outpoint);
    }

    pub fn utxo_count(&self) -> usize {
        self.state.lock().expect("node state poisoned").utxos.len()
    }

    fn utxos(&self, addrs: &[String]) -> Vec<Utxo> {
        let state = self.state.lock().expect("node state poisoned");
        state
            .utxos
            .values()
            .filter(|u| addrs.iter().any(|a| a == u.address()))
            .cloned()
            .collect()
    }

    fn transaction(&self, txid: &str) -> Result<TxRecord, GatewayError> {
        let state = self.state.lock().expect("node state poisoned");
        state
            .txs
            .get(txid)
            .cloned()
            .ok_or_else(|| GatewayError::InvalidInput(format!("unknown transaction {}", txid)))
    }

    fn output(&self, id: &str) -> Result<OutputRecord, GatewayError> {
        let state = self.state.lock().expect("node state poisoned");
        state
            .utxos
            .get(&OutpointId(id.to_string()))
            .map(|u| OutputRecord {
                id: id.to_string(),
                address: u.address().to_string(),
                amount: u.amount(),
            })
            .ok_or_else(|| GatewayError::InvalidInput(format!("unknown output {}", id)))
    }

    fn broadcast(&self, raw: &str) -> Result<String, GatewayError> {
        let tx = RawTransaction::decode(raw)?;
        if self.chain.is_some_and(|chain| chain != tx.chain) {
            return Err(GatewayError::InvalidInput(format!(
                "transaction for {} sent to a {} node",
                tx.chain.as_str(),
                self.chain.map(|c| c.as_str()).unwrap_or("unset")
            )));
        }
        let txid = tx.txid();
        let mut state = self.state.lock().expect("node state poisoned");

        // Refuse the whole transaction if any input is already gone.
        for input in &tx.inputs {
            if !state.utxos.contains_key(&OutpointId(input.clone())) {
                return Err(GatewayError::InvalidInput(format!(
                    "input {} is spent or unknown",
                    input
                )));
            }
        }
        for input in &tx.inputs {
            state.utxos.remove(&OutpointId(input.clone()));
        }

        for (index, output) in tx.outputs.iter().enumerate() {
            let utxo = match tx.chain {
                CoinType::Bitcoin => Utxo::Bitcoin {
                    txid: txid.clone(),
                    vout: index as u32,
                    address: output.address.clone(),
                    amount: output.amount,
                },
                CoinType::Skycoin => Utxo::Skycoin {
                    uxid: format!("{}:{}", txid, index),
                    address: output.address.clone(),
                    amount: output.amount,
                    hours: 0,
                },
            };
            state.utxos.insert(utxo.outpoint(), utxo);
        }

        state.txs.insert(
            txid.clone(),
            TxRecord {
                txid: txid.clone(),
                confirmations: 1,
                outputs: tx.outputs.clone(),
            },
        );
        Ok(txid)
    }
}
