use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::time::{SystemTime, UNIX_EPOCH};

pub mod snapshot;

// --- Financial Primitives ---
// All money amounts are integers in the smallest indivisible unit of their
// asset (satoshi, droplet). Prices are SUB units per one MAIN unit.
pub type Amount = u64;
pub type Price = u64;

// --- Identifiers ---
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, PartialOrd, Ord)]
pub struct OrderId(pub u64);

impl fmt::Display for OrderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Stable account identifier: hex SHA-256 fingerprint of the owner pubkey.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, PartialOrd, Ord)]
pub struct AccountId(pub String);

impl fmt::Display for AccountId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Fingerprint raw pubkey bytes into an [`AccountId`].
pub fn account_fingerprint(pubkey: &[u8]) -> AccountId {
    let mut hasher = Sha256::new();
    hasher.update(pubkey);
    AccountId(hex::encode(hasher.finalize()))
}

// --- Chains ---

/// The fixed set of supported chains. Chain-specific behavior dispatches over
/// this tag rather than a trait object; the shapes of the two UTXO models
/// differ too much for a common record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum CoinType {
    Bitcoin,
    Skycoin,
}

impl CoinType {
    pub fn as_str(&self) -> &'static str {
        match self {
            CoinType::Bitcoin => "bitcoin",
            CoinType::Skycoin => "skycoin",
        }
    }
}

impl fmt::Display for CoinType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown coin type: {0}")]
pub struct UnknownCoin(pub String);

impl FromStr for CoinType {
    type Err = UnknownCoin;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "bitcoin" => Ok(CoinType::Bitcoin),
            "skycoin" => Ok(CoinType::Skycoin),
            other => Err(UnknownCoin(other.to_string())),
        }
    }
}

// --- Trading pairs ---

/// A trading pair "MAIN/SUB": orders express a quantity of MAIN priced in SUB.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, PartialOrd, Ord)]
pub struct TradePair {
    pub main: String,
    pub sub: String,
}

impl TradePair {
    pub fn new(main: &str, sub: &str) -> Self {
        TradePair {
            main: main.to_string(),
            sub: sub.to_string(),
        }
    }

    /// Filesystem-safe name used for the per-pair order book snapshot.
    pub fn file_stem(&self) -> String {
        format!("{}_{}", self.main, self.sub)
    }
}

impl fmt::Display for TradePair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.main, self.sub)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("malformed trading pair: {0}")]
pub struct BadPair(pub String);

impl FromStr for TradePair {
    type Err = BadPair;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once('/') {
            Some((main, sub)) if !main.is_empty() && !sub.is_empty() && !sub.contains('/') => {
                Ok(TradePair::new(main, sub))
            }
            _ => Err(BadPair(s.to_string())),
        }
    }
}

// --- Orders ---

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Bid,
    Ask,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderStatus {
    Open,
    Matched,
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Order {
    pub id: OrderId,
    pub account: AccountId,
    pub side: Side,
    pub price: Price,
    pub amount: Amount,
    /// Quantity still open; `amount` keeps the original size across fills.
    pub amount_remaining: Amount,
    pub created_at: u64,
    pub status: OrderStatus,
}

// --- Matching output ---

/// One order's executions within a single match cycle: total executed MAIN
/// quantity and its maker-priced SUB value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FillReport {
    pub order: Order,
    pub executed: Amount,
    pub value: Amount,
}

/// Events a book delivers down its pair channel for settlement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum BookEvent {
    Filled(FillReport),
    Cancelled(Order),
}

// --- UTXOs ---

/// Canonical name of one unspent output.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, PartialOrd, Ord)]
pub struct OutpointId(pub String);

impl fmt::Display for OutpointId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Union of the two chains' unspent-output records. Bitcoin outputs are named
/// by (txid, vout); skycoin outputs carry their own uxid and coin hours.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "chain", rename_all = "lowercase")]
pub enum Utxo {
    Bitcoin {
        txid: String,
        vout: u32,
        address: String,
        amount: Amount,
    },
    Skycoin {
        uxid: String,
        address: String,
        amount: Amount,
        hours: u64,
    },
}

impl Utxo {
    pub fn outpoint(&self) -> OutpointId {
        match self {
            Utxo::Bitcoin { txid, vout, .. } => OutpointId(format!("{}:{}", txid, vout)),
            Utxo::Skycoin { uxid, .. } => OutpointId(uxid.clone()),
        }
    }

    pub fn amount(&self) -> Amount {
        match self {
            Utxo::Bitcoin { amount, .. } | Utxo::Skycoin { amount, .. } => *amount,
        }
    }

    pub fn address(&self) -> &str {
        match self {
            Utxo::Bitcoin { address, .. } | Utxo::Skycoin { address, .. } => address,
        }
    }

    pub fn chain(&self) -> CoinType {
        match self {
            Utxo::Bitcoin { .. } => CoinType::Bitcoin,
            Utxo::Skycoin { .. } => CoinType::Skycoin,
        }
    }
}

// --- Chain records ---

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxOutput {
    pub address: String,
    pub amount: Amount,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxRecord {
    pub txid: String,
    pub confirmations: u64,
    pub outputs: Vec<TxOutput>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputRecord {
    pub id: String,
    pub address: String,
    pub amount: Amount,
}

// --- Accounts ---

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    pub id: AccountId,
    pub pubkey: String,
    /// asset symbol -> balance in smallest units. Never negative by
    /// construction (u64 plus checked mutation in the store).
    pub balances: BTreeMap<String, Amount>,
    /// asset symbol -> deposit addresses assigned to this account.
    pub addresses: BTreeMap<String, Vec<String>>,
}

impl Account {
    pub fn new(id: AccountId, pubkey: String) -> Self {
        Account {
            id,
            pubkey,
            balances: BTreeMap::new(),
            addresses: BTreeMap::new(),
        }
    }

    pub fn balance(&self, asset: &str) -> Amount {
        self.balances.get(asset).copied().unwrap_or(0)
    }
}

/// Seconds since the Unix epoch.
pub fn unix_time() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}
