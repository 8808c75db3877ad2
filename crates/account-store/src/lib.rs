//! Persisted account store.
//!
//! One reader-writer lock over the whole account map; every balance mutation
//! takes the write lock, so mutations are linearizable. The `balance >= 0`
//! invariant is enforced inside [`AccountStore::decrease`]. State persists as
//! a single JSON snapshot at `<data_dir>/account/accounts.json`, written
//! atomically after each successful mutation by the settlement path.

use common_types::{account_fingerprint, snapshot, Account, AccountId, Amount};
use ed25519_dalek::VerifyingKey;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::info;

#[derive(Error, Debug)]
pub enum AccountError {
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("unknown account: {0}")]
    UnknownAccount(AccountId),
    #[error("insufficient balance: account {account} holds {available} {asset}, needs {required}")]
    InsufficientBalance {
        account: AccountId,
        asset: String,
        available: Amount,
        required: Amount,
    },
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("snapshot error: {0}")]
    Snapshot(#[from] snapshot::SnapshotError),
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct StoreSnapshot {
    accounts: Vec<Account>,
}

pub struct AccountStore {
    path: PathBuf,
    inner: RwLock<HashMap<AccountId, Account>>,
}

impl AccountStore {
    /// Load the store from `<data_dir>/account/accounts.json`, starting empty
    /// when no snapshot exists. A corrupt snapshot is an error; the caller
    /// treats it as fatal rather than silently starting over.
    pub async fn load(data_dir: &Path) -> Result<Self, AccountError> {
        let path = data_dir.join("account").join("accounts.json");
        let accounts = match snapshot::load_json::<StoreSnapshot>(&path).await? {
            Some(snap) => snap
                .accounts
                .into_iter()
                .map(|a| (a.id.clone(), a))
                .collect(),
            None => HashMap::new(),
        };
        Ok(AccountStore {
            path,
            inner: RwLock::new(accounts),
        })
    }

    /// Register an account for an ed25519 pubkey (hex). The account id is the
    /// pubkey fingerprint; registering the same key twice is a conflict.
    pub async fn create(&self, pubkey_hex: &str) -> Result<AccountId, AccountError> {
        let bytes = hex::decode(pubkey_hex)
            .map_err(|_| AccountError::InvalidInput("pubkey is not hex".to_string()))?;
        let bytes: [u8; 32] = bytes
            .try_into()
            .map_err(|_| AccountError::InvalidInput("pubkey must be 32 bytes".to_string()))?;
        VerifyingKey::from_bytes(&bytes)
            .map_err(|_| AccountError::InvalidInput("pubkey is not a valid key".to_string()))?;

        let id = account_fingerprint(&bytes);
        {
            let mut map = self.inner.write().await;
            if map.contains_key(&id) {
                return Err(AccountError::Conflict(format!(
                    "account {} already registered",
                    id
                )));
            }
            map.insert(id.clone(), Account::new(id.clone(), pubkey_hex.to_lowercase()));
        }
        self.save_all().await?;
        info!(account = %id, "created account");
        Ok(id)
    }

    pub async fn get(&self, id: &AccountId) -> Result<Account, AccountError> {
        let map = self.inner.read().await;
        map.get(id)
            .cloned()
            .ok_or_else(|| AccountError::UnknownAccount(id.clone()))
    }

    pub async fn balance(&self, id: &AccountId, asset: &str) -> Result<Amount, AccountError> {
        let map = self.inner.read().await;
        map.get(id)
            .map(|a| a.balance(asset))
            .ok_or_else(|| AccountError::UnknownAccount(id.clone()))
    }

    pub async fn increase(
        &self,
        id: &AccountId,
        asset: &str,
        amount: Amount,
    ) -> Result<(), AccountError> {
        let mut map = self.inner.write().await;
        let account = map
            .get_mut(id)
            .ok_or_else(|| AccountError::UnknownAccount(id.clone()))?;
        let balance = account.balances.entry(asset.to_string()).or_insert(0);
        *balance = balance
            .checked_add(amount)
            .ok_or_else(|| AccountError::InvalidInput("balance overflow".to_string()))?;
        Ok(())
    }

    pub async fn decrease(
        &self,
        id: &AccountId,
        asset: &str,
        amount: Amount,
    ) -> Result<(), AccountError> {
        let mut map = self.inner.write().await;
        let account = map
            .get_mut(id)
            .ok_or_else(|| AccountError::UnknownAccount(id.clone()))?;
        let balance = account.balances.entry(asset.to_string()).or_insert(0);
        if *balance < amount {
            return Err(AccountError::InsufficientBalance {
                account: id.clone(),
                asset: asset.to_string(),
                available: *balance,
                required: amount,
            });
        }
        *balance -= amount;
        Ok(())
    }

    /// Bind a deposit address to an account. An address belongs to at most
    /// one account and the binding is immutable; re-binding the same address
    /// to the same account is a no-op.
    pub async fn bind_deposit_address(
        &self,
        id: &AccountId,
        asset: &str,
        addr: &str,
    ) -> Result<(), AccountError> {
        let mut map = self.inner.write().await;
        for account in map.values() {
            for (bound_asset, addrs) in &account.addresses {
                if addrs.iter().any(|a| a == addr) {
                    if account.id == *id && bound_asset == asset {
                        return Ok(());
                    }
                    return Err(AccountError::Conflict(format!(
                        "address {} already bound",
                        addr
                    )));
                }
            }
        }
        let account = map
            .get_mut(id)
            .ok_or_else(|| AccountError::UnknownAccount(id.clone()))?;
        account
            .addresses
            .entry(asset.to_string())
            .or_default()
            .push(addr.to_string());
        Ok(())
    }

    pub async fn deposit_addresses(
        &self,
        id: &AccountId,
        asset: &str,
    ) -> Result<Vec<String>, AccountError> {
        let map = self.inner.read().await;
        let account = map
            .get(id)
            .ok_or_else(|| AccountError::UnknownAccount(id.clone()))?;
        Ok(account.addresses.get(asset).cloned().unwrap_or_default())
    }

    /// Persist the whole store atomically. The snapshot is taken under the
    /// read lock; the file write happens after the lock is dropped.
    pub async fn save_all(&self) -> Result<(), AccountError> {
        let snap = {
            let map = self.inner.read().await;
            let mut accounts: Vec<Account> = map.values().cloned().collect();
            accounts.sort_by(|a, b| a.id.cmp(&b.id));
            StoreSnapshot { accounts }
        };
        snapshot::save_json(&self.path, &snap).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ed25519_dalek::SigningKey;

    fn pubkey_hex(seed: u8) -> String {
        let signing = SigningKey::from_bytes(&[seed; 32]);
        hex::encode(signing.verifying_key().to_bytes())
    }

    async fn store() -> (tempfile::TempDir, AccountStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = AccountStore::load(dir.path()).await.unwrap();
        (dir, store)
    }

    #[tokio::test]
    async fn create_and_get() {
        let (_dir, store) = store().await;
        let id = store.create(&pubkey_hex(1)).await.unwrap();
        let account = store.get(&id).await.unwrap();
        assert_eq!(account.id, id);
        assert_eq!(account.balance("bitcoin"), 0);
    }

    #[tokio::test]
    async fn duplicate_registration_conflicts() {
        let (_dir, store) = store().await;
        store.create(&pubkey_hex(1)).await.unwrap();
        assert!(matches!(
            store.create(&pubkey_hex(1)).await,
            Err(AccountError::Conflict(_))
        ));
    }

    #[tokio::test]
    async fn bad_pubkeys_rejected() {
        let (_dir, store) = store().await;
        assert!(matches!(
            store.create("zz").await,
            Err(AccountError::InvalidInput(_))
        ));
        assert!(matches!(
            store.create("ab").await,
            Err(AccountError::InvalidInput(_))
        ));
    }

    #[tokio::test]
    async fn balances_never_go_negative() {
        let (_dir, store) = store().await;
        let id = store.create(&pubkey_hex(1)).await.unwrap();
        store.increase(&id, "bitcoin", 100).await.unwrap();
        store.decrease(&id, "bitcoin", 40).await.unwrap();
        assert_eq!(store.balance(&id, "bitcoin").await.unwrap(), 60);

        let err = store.decrease(&id, "bitcoin", 61).await.unwrap_err();
        assert!(matches!(err, AccountError::InsufficientBalance { .. }));
        // Balance untouched by the failed decrease.
        assert_eq!(store.balance(&id, "bitcoin").await.unwrap(), 60);
    }

    #[tokio::test]
    async fn address_binding_is_exclusive_and_immutable() {
        let (_dir, store) = store().await;
        let a = store.create(&pubkey_hex(1)).await.unwrap();
        let b = store.create(&pubkey_hex(2)).await.unwrap();

        store.bind_deposit_address(&a, "bitcoin", "addr1").await.unwrap();
        // Same binding again: no-op.
        store.bind_deposit_address(&a, "bitcoin", "addr1").await.unwrap();
        assert_eq!(
            store.deposit_addresses(&a, "bitcoin").await.unwrap(),
            vec!["addr1"]
        );

        assert!(matches!(
            store.bind_deposit_address(&b, "bitcoin", "addr1").await,
            Err(AccountError::Conflict(_))
        ));
        assert!(matches!(
            store.bind_deposit_address(&a, "skycoin", "addr1").await,
            Err(AccountError::Conflict(_))
        ));
    }

    #[tokio::test]
    async fn save_then_load_is_observationally_equal() {
        let dir = tempfile::tempdir().unwrap();
        let store = AccountStore::load(dir.path()).await.unwrap();
        let id = store.create(&pubkey_hex(3)).await.unwrap();
        store.increase(&id, "bitcoin", 1000).await.unwrap();
        store.increase(&id, "skycoin", 5).await.unwrap();
        store.bind_deposit_address(&id, "bitcoin", "addrX").await.unwrap();
        store.save_all().await.unwrap();

        let reloaded = AccountStore::load(dir.path()).await.unwrap();
        assert_eq!(
            reloaded.get(&id).await.unwrap(),
            store.get(&id).await.unwrap()
        );
        assert_eq!(reloaded.balance(&id, "bitcoin").await.unwrap(), 1000);
    }

    #[tokio::test]
    async fn persisted_increase_survives_restart_once() {
        let dir = tempfile::tempdir().unwrap();
        let store = AccountStore::load(dir.path()).await.unwrap();
        let id = store.create(&pubkey_hex(4)).await.unwrap();
        store.increase(&id, "skycoin", 500).await.unwrap();
        store.save_all().await.unwrap();
        drop(store);

        // The increase is applied exactly once across the restart.
        let reloaded = AccountStore::load(dir.path()).await.unwrap();
        assert_eq!(reloaded.balance(&id, "skycoin").await.unwrap(), 500);
    }

    #[tokio::test]
    async fn corrupt_snapshot_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("account");
        tokio::fs::create_dir_all(&path).await.unwrap();
        tokio::fs::write(path.join("accounts.json"), b"{ broken")
            .await
            .unwrap();
        assert!(AccountStore::load(dir.path()).await.is_err());
    }
}
