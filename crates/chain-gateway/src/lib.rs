//! Per-chain gateway: the one capability surface the rest of the server
//! talks to a chain through.
//!
//! Chain-specific node RPC, fee semantics, and address encodings stay behind
//! this crate. The supported chain set is fixed at compile time, so dispatch
//! is a tagged variant rather than a trait object.

use common_types::{Amount, CoinType, OutputRecord, TxOutput, TxRecord, Utxo};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::info;

pub mod address;
pub mod base58;
pub mod node;
pub mod tx;

use node::NodeClient;
use tx::RawTransaction;

#[derive(Error, Debug)]
pub enum GatewayError {
    #[error("operation not supported for {0}")]
    Unsupported(CoinType),
    #[error("node unreachable: {0}")]
    NodeUnreachable(String),
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("insufficient on-chain funds")]
    InsufficientFunds,
}

/// Resolves the hot-wallet private key for one of our own addresses during
/// transaction signing.
pub type KeyLookup<'a> = &'a (dyn Fn(&str) -> Option<String> + Send + Sync);

pub struct BitcoinGateway {
    node: NodeClient,
}

pub struct SkycoinGateway {
    node: NodeClient,
}

pub enum ChainGateway {
    Bitcoin(BitcoinGateway),
    Skycoin(SkycoinGateway),
}

impl ChainGateway {
    pub fn bitcoin(node: NodeClient) -> Self {
        ChainGateway::Bitcoin(BitcoinGateway { node })
    }

    pub fn skycoin(node: NodeClient) -> Self {
        ChainGateway::Skycoin(SkycoinGateway { node })
    }

    pub fn coin_type(&self) -> CoinType {
        match self {
            ChainGateway::Bitcoin(_) => CoinType::Bitcoin,
            ChainGateway::Skycoin(_) => CoinType::Skycoin,
        }
    }

    pub fn symbol(&self) -> &'static str {
        self.coin_type().as_str()
    }

    fn node(&self) -> &NodeClient {
        match self {
            ChainGateway::Bitcoin(gw) => &gw.node,
            ChainGateway::Skycoin(gw) => &gw.node,
        }
    }

    /// Pure structural validation; no node roundtrip.
    pub fn validate_address(&self, addr: &str) -> Result<(), GatewayError> {
        let ok = match self {
            ChainGateway::Bitcoin(_) => address::validate_bitcoin(addr),
            ChainGateway::Skycoin(_) => address::validate_skycoin(addr),
        };
        if ok {
            Ok(())
        } else {
            Err(GatewayError::InvalidInput(format!(
                "invalid {} address: {}",
                self.symbol(),
                addr
            )))
        }
    }

    /// Derive the canonical address for a pubkey on this chain.
    pub fn address_for_pubkey(&self, pubkey: &[u8]) -> String {
        match self {
            ChainGateway::Bitcoin(_) => address::bitcoin_address(pubkey),
            ChainGateway::Skycoin(_) => address::skycoin_address(pubkey),
        }
    }

    /// Sum of confirmed balances over the address set.
    pub async fn get_balance(&self, addrs: &[String]) -> Result<Amount, GatewayError> {
        let utxos = self.node().utxos(addrs).await?;
        Ok(utxos.iter().map(Utxo::amount).sum())
    }

    pub async fn get_transaction(&self, txid: &str) -> Result<TxRecord, GatewayError> {
        self.node().transaction(txid).await
    }

    /// Standalone output lookup; bitcoin outputs are only meaningful relative
    /// to a transaction, so the bitcoin arm reports `Unsupported`.
    pub async fn get_output(&self, id: &str) -> Result<OutputRecord, GatewayError> {
        match self {
            ChainGateway::Bitcoin(_) => Err(GatewayError::Unsupported(CoinType::Bitcoin)),
            ChainGateway::Skycoin(gw) => gw.node.output(id).await,
        }
    }

    pub async fn get_utxos(&self, addrs: &[String]) -> Result<Vec<Utxo>, GatewayError> {
        self.node().utxos(addrs).await
    }

    /// Construct, sign, and broadcast a spend of `utxos`.
    ///
    /// `fee` is a sat/byte rate and only meaningful for bitcoin; skycoin
    /// transactions carry no fee. Change returns to `change_addr`.
    pub async fn send(
        &self,
        to_addr: &str,
        amount: Amount,
        fee: Option<u64>,
        utxos: &[Utxo],
        change_addr: &str,
        keys: KeyLookup<'_>,
    ) -> Result<String, GatewayError> {
        self.validate_address(to_addr)?;
        if amount == 0 {
            return Err(GatewayError::InvalidInput("zero-amount send".to_string()));
        }
        for utxo in utxos {
            if utxo.chain() != self.coin_type() {
                return Err(GatewayError::InvalidInput(format!(
                    "{} UTXO offered to the {} gateway",
                    utxo.chain(),
                    self.symbol()
                )));
            }
        }

        let total: Amount = utxos.iter().map(Utxo::amount).sum();
        let fee_total = match self {
            ChainGateway::Bitcoin(_) => {
                let rate = fee.ok_or_else(|| {
                    GatewayError::InvalidInput("bitcoin sends require a fee rate".to_string())
                })?;
                rate * estimate_tx_bytes(utxos.len(), 2)
            }
            ChainGateway::Skycoin(_) => {
                if fee.is_some() {
                    return Err(GatewayError::InvalidInput(
                        "skycoin sends carry no fee".to_string(),
                    ));
                }
                0
            }
        };

        let spend = amount
            .checked_add(fee_total)
            .ok_or_else(|| GatewayError::InvalidInput("amount overflow".to_string()))?;
        if total < spend {
            return Err(GatewayError::InsufficientFunds);
        }

        let mut outputs = vec![TxOutput {
            address: to_addr.to_string(),
            amount,
        }];
        let change = total - spend;
        if change > 0 {
            outputs.push(TxOutput {
                address: change_addr.to_string(),
                amount: change,
            });
        }

        let mut raw = RawTransaction {
            chain: self.coin_type(),
            inputs: utxos.iter().map(|u| u.outpoint().0).collect(),
            outputs,
            signatures: Vec::new(),
        };
        let payload = raw.signing_payload();
        for utxo in utxos {
            let seckey = keys(utxo.address()).ok_or_else(|| {
                GatewayError::InvalidInput(format!("no key for address {}", utxo.address()))
            })?;
            raw.signatures.push(sign_input(&seckey, &payload));
        }

        let txid = self.node().broadcast(&raw.encode()?).await?;
        info!(chain = %self.symbol(), txid = %txid, amount, fee = fee_total, "broadcast transaction");
        Ok(txid)
    }
}

/// Conservative size estimate for fee purposes: P2PKH-shaped inputs and
/// outputs plus a fixed envelope.
fn estimate_tx_bytes(inputs: usize, outputs: usize) -> u64 {
    inputs as u64 * 180 + outputs as u64 * 34 + 10
}

fn sign_input(seckey_hex: &str, payload: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(seckey_hex.as_bytes());
    hasher.update(payload);
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use node::InMemoryNode;

    fn funded_bitcoin_gateway(amounts: &[Amount]) -> (ChainGateway, InMemoryNode, String) {
        let node = InMemoryNode::new(CoinType::Bitcoin);
        let addr = address::bitcoin_address(b"hot-wallet-key");
        for (i, amount) in amounts.iter().enumerate() {
            node.add_utxo(Utxo::Bitcoin {
                txid: format!("seed{}", i),
                vout: 0,
                address: addr.clone(),
                amount: *amount,
            });
        }
        let gateway = ChainGateway::bitcoin(NodeClient::InMemory(node.clone()));
        (gateway, node, addr)
    }

    #[test]
    fn fee_estimate_grows_with_inputs() {
        assert!(estimate_tx_bytes(2, 2) > estimate_tx_bytes(1, 2));
        assert_eq!(estimate_tx_bytes(1, 2), 180 + 68 + 10);
    }

    #[tokio::test]
    async fn balance_sums_utxos() {
        let (gateway, _node, addr) = funded_bitcoin_gateway(&[10_000, 2_500]);
        let balance = gateway.get_balance(&[addr]).await.unwrap();
        assert_eq!(balance, 12_500);
    }

    #[tokio::test]
    async fn get_output_unsupported_on_bitcoin() {
        let (gateway, _node, _addr) = funded_bitcoin_gateway(&[1]);
        assert!(matches!(
            gateway.get_output("whatever").await,
            Err(GatewayError::Unsupported(CoinType::Bitcoin))
        ));
    }

    #[tokio::test]
    async fn send_spends_and_returns_change() {
        let (gateway, node, addr) = funded_bitcoin_gateway(&[100_000]);
        let dest = address::bitcoin_address(b"recipient");
        let keys = |a: &str| (a == addr).then(|| "seckey-hex".to_string());

        let txid = gateway
            .send(&dest, 40_000, Some(10), &node_utxos(&node, &addr).await, &addr, &keys)
            .await
            .unwrap();

        let record = gateway.get_transaction(&txid).await.unwrap();
        assert_eq!(record.outputs[0].amount, 40_000);
        assert_eq!(record.outputs[0].address, dest);
        // change = total - amount - rate * size(1 input, 2 outputs)
        assert_eq!(record.outputs[1].amount, 100_000 - 40_000 - 10 * 258);
        assert_eq!(record.outputs[1].address, addr);
    }

    #[tokio::test]
    async fn send_rejects_insufficient_funds() {
        let (gateway, node, addr) = funded_bitcoin_gateway(&[1_000]);
        let dest = address::bitcoin_address(b"recipient");
        let keys = |a: &str| (a == addr).then(|| "seckey-hex".to_string());

        let err = gateway
            .send(&dest, 900, Some(10), &node_utxos(&node, &addr).await, &addr, &keys)
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::InsufficientFunds));
    }

    #[tokio::test]
    async fn send_rejects_invalid_destination() {
        let (gateway, node, addr) = funded_bitcoin_gateway(&[1_000]);
        let keys = |_: &str| Some("seckey-hex".to_string());
        let err = gateway
            .send("garbage", 10, Some(1), &node_utxos(&node, &addr).await, &addr, &keys)
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::InvalidInput(_)));
    }

    #[tokio::test]
    async fn skycoin_send_rejects_fee() {
        let node = InMemoryNode::new(CoinType::Skycoin);
        let addr = address::skycoin_address(b"hot");
        node.add_utxo(Utxo::Skycoin {
            uxid: "u1".to_string(),
            address: addr.clone(),
            amount: 500,
            hours: 0,
        });
        let gateway = ChainGateway::skycoin(NodeClient::InMemory(node.clone()));
        let dest = address::skycoin_address(b"dest");
        let keys = |_: &str| Some("k".to_string());
        let utxos = node_utxos(&node, &addr).await;

        assert!(matches!(
            gateway.send(&dest, 100, Some(5), &utxos, &addr, &keys).await,
            Err(GatewayError::InvalidInput(_))
        ));
        // Without a fee the same spend succeeds.
        gateway.send(&dest, 100, None, &utxos, &addr, &keys).await.unwrap();
    }

    async fn node_utxos(node: &InMemoryNode, addr: &str) -> Vec<Utxo> {
        NodeClient::InMemory(node.clone())
            .utxos(&[addr.to_string()])
            .await
            .unwrap()
    }
}
