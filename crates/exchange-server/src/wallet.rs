//! Omnibus hot wallets, one per chain.
//!
//! A wallet persists at `<data_dir>/wallet/<chain>.wlt` as `{seed, index,
//! entries}` and hands out deterministically derived addresses under its own
//! lock. The derivation here is a stand-in (`sha256(seed ‖ chain ‖ index)`
//! feeding an ed25519 keypair); production seed handling and BIP-32/39
//! derivation live with the external wallet tooling.

use chain_gateway::ChainGateway;
use common_types::{snapshot, CoinType};
use ed25519_dalek::SigningKey;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::info;

#[derive(Error, Debug)]
pub enum WalletError {
    #[error("wallet {0} exists with a different seed")]
    SeedMismatch(String),
    #[error("snapshot error: {0}")]
    Snapshot(#[from] snapshot::SnapshotError),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AddressEntry {
    pub address: String,
    pub pubkey: String,
    pub seckey: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct WalletFile {
    seed: String,
    index: u64,
    entries: Vec<AddressEntry>,
}

pub struct HotWallet {
    chain: CoinType,
    path: PathBuf,
    state: Mutex<WalletFile>,
}

impl HotWallet {
    pub async fn load(data_dir: &Path, chain: CoinType, seed: &str) -> Result<Self, WalletError> {
        let path = data_dir
            .join("wallet")
            .join(format!("{}.wlt", chain.as_str()));
        let state = match snapshot::load_json::<WalletFile>(&path).await? {
            Some(file) => {
                if file.seed != seed {
                    return Err(WalletError::SeedMismatch(chain.as_str().to_string()));
                }
                file
            }
            None => WalletFile {
                seed: seed.to_string(),
                index: 0,
                entries: Vec::new(),
            },
        };
        Ok(HotWallet {
            chain,
            path,
            state: Mutex::new(state),
        })
    }

    /// Derive the next address, persist the wallet, and return the entry.
    pub async fn new_address(&self, gateway: &ChainGateway) -> Result<AddressEntry, WalletError> {
        let mut state = self.state.lock().await;
        let index = state.index;
        state.index += 1;

        let mut hasher = Sha256::new();
        hasher.update(state.seed.as_bytes());
        hasher.update(self.chain.as_str().as_bytes());
        hasher.update(index.to_be_bytes());
        let seckey_bytes: [u8; 32] = hasher.finalize().into();

        let signing = SigningKey::from_bytes(&seckey_bytes);
        let pubkey_bytes = signing.verifying_key().to_bytes();
        let entry = AddressEntry {
            address: gateway.address_for_pubkey(&pubkey_bytes),
            pubkey: hex::encode(pubkey_bytes),
            seckey: hex::encode(seckey_bytes),
        };
        state.entries.push(entry.clone());

        snapshot::save_json(&self.path, &*state).await?;
        info!(chain = %self.chain, index, address = %entry.address, "derived wallet address");
        Ok(entry)
    }

    /// Make sure the wallet holds at least one address (used as the change
    /// address for sends).
    pub async fn ensure_address(&self, gateway: &ChainGateway) -> Result<AddressEntry, WalletError> {
        {
            let state = self.state.lock().await;
            if let Some(first) = state.entries.first() {
                return Ok(first.clone());
            }
        }
        self.new_address(gateway).await
    }

    pub async fn addresses(&self) -> Vec<String> {
        let state = self.state.lock().await;
        state.entries.iter().map(|e| e.address.clone()).collect()
    }

    /// address -> seckey snapshot for transaction signing.
    pub async fn key_map(&self) -> HashMap<String, String> {
        let state = self.state.lock().await;
        state
            .entries
            .iter()
            .map(|e| (e.address.clone(), e.seckey.clone()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chain_gateway::node::{InMemoryNode, NodeClient};

    fn gateway() -> ChainGateway {
        ChainGateway::bitcoin(NodeClient::InMemory(InMemoryNode::new(CoinType::Bitcoin)))
    }

    #[tokio::test]
    async fn addresses_are_deterministic_per_seed() {
        let dir = tempfile::tempdir().unwrap();
        let gw = gateway();

        let w1 = HotWallet::load(dir.path(), CoinType::Bitcoin, "seed-a").await.unwrap();
        let first = w1.new_address(&gw).await.unwrap();
        drop(w1);

        let dir2 = tempfile::tempdir().unwrap();
        let w2 = HotWallet::load(dir2.path(), CoinType::Bitcoin, "seed-a").await.unwrap();
        assert_eq!(w2.new_address(&gw).await.unwrap().address, first.address);

        let dir3 = tempfile::tempdir().unwrap();
        let w3 = HotWallet::load(dir3.path(), CoinType::Bitcoin, "seed-b").await.unwrap();
        assert_ne!(w3.new_address(&gw).await.unwrap().address, first.address);
    }

    #[tokio::test]
    async fn wallet_persists_derivation_index() {
        let dir = tempfile::tempdir().unwrap();
        let gw = gateway();

        let wallet = HotWallet::load(dir.path(), CoinType::Bitcoin, "seed").await.unwrap();
        let a = wallet.new_address(&gw).await.unwrap();
        let b = wallet.new_address(&gw).await.unwrap();
        assert_ne!(a.address, b.address);
        drop(wallet);

        let reloaded = HotWallet::load(dir.path(), CoinType::Bitcoin, "seed").await.unwrap();
        assert_eq!(reloaded.addresses().await, vec![a.address.clone(), b.address.clone()]);
        let c = reloaded.new_address(&gw).await.unwrap();
        assert_ne!(c.address, a.address);
        assert_ne!(c.address, b.address);
    }

    #[tokio::test]
    async fn seed_mismatch_is_refused() {
        let dir = tempfile::tempdir().unwrap();
        let gw = gateway();
        let wallet = HotWallet::load(dir.path(), CoinType::Bitcoin, "seed").await.unwrap();
        wallet.new_address(&gw).await.unwrap();
        drop(wallet);

        assert!(matches!(
            HotWallet::load(dir.path(), CoinType::Bitcoin, "other").await,
            Err(WalletError::SeedMismatch(_))
        ));
    }

    #[tokio::test]
    async fn derived_addresses_validate_on_their_chain() {
        let dir = tempfile::tempdir().unwrap();
        let gw = gateway();
        let wallet = HotWallet::load(dir.path(), CoinType::Bitcoin, "seed").await.unwrap();
        let entry = wallet.new_address(&gw).await.unwrap();
        gw.validate_address(&entry.address).unwrap();
        assert_eq!(wallet.key_map().await[&entry.address], entry.seckey);
    }
}
