//! The exchange root: one explicitly-constructed value owning every
//! subsystem, wired the way the external router consumes it.
//!
//! Construction loads persisted state (accounts, books, wallets), rebuilds
//! the escrow ledger from the open books, and prepares the per-pair
//! settlement channels. [`Exchange::run`] spawns the long-lived tasks: one
//! UTXO refresh loop per chain, the match ticker, and one settlement task
//! per pair, all observing the same shutdown signal.

use account_store::{AccountError, AccountStore};
use chain_gateway::node::{BitcoinRpc, NodeClient, SkycoinRest};
use chain_gateway::{ChainGateway, GatewayError};
use common_types::{
    AccountId, Amount, BadPair, BookEvent, CoinType, Order, OrderId, Price, Side, TradePair,
    UnknownCoin, Utxo,
};
use configuration::Settings;
use dashmap::DashMap;
use order_manager::{OrderManager, OrderManagerError, PAIR_CHANNEL_CAPACITY};
use settlement_plane::{
    escrow_requirement, run_pair_settlement, EscrowLedger, SettlementError,
};
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::info;
use utxo_pool::{PoolError, Reservation, UtxoPool};

pub mod wallet;
use wallet::{HotWallet, WalletError};

/// How long a withdrawal waits for pool replenishment before failing.
const WITHDRAW_FUND_WAIT: Duration = Duration::from_secs(5);
/// Transaction-size headroom reserved for fees on top of the withdrawal
/// amount (bitcoin only), in bytes.
const FEE_HEADROOM_BYTES: u64 = 1_000;

#[derive(Error, Debug)]
pub enum ExchangeError {
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("unsupported asset: {0}")]
    UnsupportedAsset(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error(transparent)]
    Account(#[from] AccountError),
    #[error(transparent)]
    Gateway(#[from] GatewayError),
    #[error(transparent)]
    Pool(#[from] PoolError),
    #[error(transparent)]
    Orders(#[from] OrderManagerError),
    #[error(transparent)]
    Settlement(#[from] SettlementError),
    #[error(transparent)]
    Wallet(#[from] WalletError),
}

impl From<BadPair> for ExchangeError {
    fn from(e: BadPair) -> Self {
        ExchangeError::InvalidInput(e.to_string())
    }
}

impl From<UnknownCoin> for ExchangeError {
    fn from(e: UnknownCoin) -> Self {
        ExchangeError::UnsupportedAsset(e.0)
    }
}

struct ChainService {
    gateway: Arc<ChainGateway>,
    pool: Arc<UtxoPool>,
    wallet: Arc<HotWallet>,
}

/// Join handles for every long-lived task [`Exchange::run`] spawns.
pub struct ServerHandles {
    pub pool_tasks: Vec<JoinHandle<()>>,
    pub ticker_task: JoinHandle<()>,
    pub settlement_tasks: Vec<JoinHandle<Result<(), SettlementError>>>,
}

pub struct Exchange {
    cfg: Settings,
    accounts: Arc<AccountStore>,
    escrow: Arc<EscrowLedger>,
    orders: Arc<OrderManager>,
    chains: HashMap<CoinType, ChainService>,
    admins: HashSet<String>,
    withdraw_locks: DashMap<AccountId, Arc<Mutex<()>>>,
    pending_settlements: std::sync::Mutex<Vec<(TradePair, mpsc::Receiver<BookEvent>)>>,
}

impl Exchange {
    /// Build from settings; node clients come from `node_addresses`.
    pub async fn from_settings(cfg: Settings) -> Result<Self, ExchangeError> {
        let mut gateways = Vec::new();
        for (name, addr) in &cfg.node_addresses {
            let chain: CoinType = name.parse()?;
            let gateway = match chain {
                CoinType::Bitcoin => {
                    ChainGateway::bitcoin(NodeClient::BitcoinRpc(BitcoinRpc::new(addr)))
                }
                CoinType::Skycoin => {
                    ChainGateway::skycoin(NodeClient::SkycoinRest(SkycoinRest::new(addr)))
                }
            };
            gateways.push(gateway);
        }
        Self::with_gateways(cfg, gateways).await
    }

    /// Build with explicit gateways; tests wire in-memory node backends here.
    pub async fn with_gateways(
        cfg: Settings,
        gateways: Vec<ChainGateway>,
    ) -> Result<Self, ExchangeError> {
        let data_dir = PathBuf::from(&cfg.data_dir);
        let accounts = Arc::new(AccountStore::load(&data_dir).await?);

        let mut chains = HashMap::new();
        for gateway in gateways {
            let chain = gateway.coin_type();
            if chains.contains_key(&chain) {
                return Err(ExchangeError::Conflict(format!(
                    "{} coin already registered",
                    chain
                )));
            }
            let gateway = Arc::new(gateway);
            let hot_wallet = Arc::new(HotWallet::load(&data_dir, chain, &cfg.seed).await?);
            hot_wallet.ensure_address(&gateway).await?;
            let pool = Arc::new(UtxoPool::new(
                gateway.clone(),
                cfg.pool.utxo_pool_size,
                Duration::from_secs(cfg.pool.reservation_ttl_secs),
                hot_wallet.addresses().await,
            ));
            chains.insert(
                chain,
                ChainService {
                    gateway,
                    pool,
                    wallet: hot_wallet,
                },
            );
        }

        // One book per traded pair; the canonical bitcoin/skycoin book exists
        // from first boot.
        let pairs = vec![TradePair::new("bitcoin", "skycoin")];
        let mut orders = OrderManager::load(&data_dir, &pairs).await?;
        let escrow = Arc::new(EscrowLedger::new());
        let mut receivers = Vec::new();
        for pair in &pairs {
            let (tx, rx) = mpsc::channel(PAIR_CHANNEL_CAPACITY);
            orders.register_channel(pair, tx)?;
            receivers.push((pair.clone(), rx));
        }
        let orders = Arc::new(orders);

        // The ledger mirrors the open books across restarts.
        for pair in &pairs {
            for order in orders.open_orders(pair).await? {
                let (asset, amount) = escrow_requirement(&order, pair).ok_or_else(|| {
                    ExchangeError::InvalidInput(format!("order {} value overflows", order.id))
                })?;
                escrow.lock(order.id, order.account.clone(), &asset, amount)?;
            }
        }

        Ok(Exchange {
            admins: cfg.admin_keys().into_iter().collect(),
            cfg,
            accounts,
            escrow,
            orders,
            chains,
            withdraw_locks: DashMap::new(),
            pending_settlements: std::sync::Mutex::new(receivers),
        })
    }

    fn chain(&self, chain: CoinType) -> Result<&ChainService, ExchangeError> {
        self.chains
            .get(&chain)
            .ok_or_else(|| ExchangeError::UnsupportedAsset(chain.to_string()))
    }

    // --- accounts ---

    pub async fn create_account(&self, pubkey_hex: &str) -> Result<AccountId, ExchangeError> {
        Ok(self.accounts.create(pubkey_hex).await?)
    }

    pub async fn get_balance(
        &self,
        account: &AccountId,
        asset: &str,
    ) -> Result<Amount, ExchangeError> {
        let chain: CoinType = asset.parse()?;
        self.chain(chain)?;
        Ok(self.accounts.balance(account, asset).await?)
    }

    /// Derive a fresh deposit address for the account, bind it, and start
    /// watching it for incoming funds.
    pub async fn get_deposit_address(
        &self,
        account: &AccountId,
        chain: CoinType,
    ) -> Result<String, ExchangeError> {
        self.accounts.get(account).await?;
        let addr = self.new_address(chain).await?;
        self.accounts
            .bind_deposit_address(account, chain.as_str(), &addr)
            .await?;
        self.accounts.save_all().await?;
        Ok(addr)
    }

    pub fn is_admin(&self, pubkey: &str) -> bool {
        self.admins.contains(pubkey)
    }

    // --- chain registry ---

    pub fn supported_coins(&self) -> Vec<String> {
        let mut coins: Vec<String> = self.chains.keys().map(|c| c.to_string()).collect();
        coins.sort();
        coins
    }

    pub fn get_coin(&self, name: &str) -> Result<Arc<ChainGateway>, ExchangeError> {
        let chain: CoinType = name.parse()?;
        Ok(self.chain(chain)?.gateway.clone())
    }

    pub fn get_btc_fee(&self) -> u64 {
        self.cfg.btc_fee
    }

    pub fn server_secret(&self) -> &str {
        &self.cfg.seckey
    }

    // --- hot wallet and utxo plumbing ---

    /// Derive a new hot-wallet address on `chain` and watch it.
    pub async fn new_address(&self, chain: CoinType) -> Result<String, ExchangeError> {
        let service = self.chain(chain)?;
        let entry = service.wallet.new_address(&service.gateway).await?;
        service
            .pool
            .watch_addresses(std::slice::from_ref(&entry.address))
            .await;
        Ok(entry.address)
    }

    pub async fn watch_address(&self, chain: CoinType, addr: &str) -> Result<(), ExchangeError> {
        let service = self.chain(chain)?;
        service.gateway.validate_address(addr)?;
        service
            .pool
            .watch_addresses(std::slice::from_ref(&addr.to_string()))
            .await;
        Ok(())
    }

    pub async fn choose_utxos(
        &self,
        chain: CoinType,
        amount: Amount,
        wait: Duration,
    ) -> Result<Reservation, ExchangeError> {
        Ok(self.chain(chain)?.pool.choose_utxos(amount, wait).await?)
    }

    pub async fn put_utxos(&self, chain: CoinType, utxos: &[Utxo]) -> Result<(), ExchangeError> {
        self.chain(chain)?.pool.put_utxos(utxos).await;
        Ok(())
    }

    // --- orders ---

    /// Admit an order with escrow taken at admission: bids lock their limit
    /// value in SUB, asks lock the quantity in MAIN. The decrease is the
    /// admission check; settlement cannot go negative afterwards.
    pub async fn add_order(
        &self,
        account: &AccountId,
        pair: &str,
        side: Side,
        price: Price,
        amount: Amount,
    ) -> Result<OrderId, ExchangeError> {
        let pair: TradePair = pair.parse()?;
        self.accounts.get(account).await?;
        if price == 0 || amount == 0 {
            return Err(ExchangeError::InvalidInput(
                "price and amount must be positive".to_string(),
            ));
        }
        let (asset, need) = match side {
            Side::Bid => (
                pair.sub.clone(),
                price.checked_mul(amount).ok_or_else(|| {
                    ExchangeError::InvalidInput("order value overflows".to_string())
                })?,
            ),
            Side::Ask => (pair.main.clone(), amount),
        };

        self.accounts.decrease(account, &asset, need).await?;
        let mut lock_result = Ok(());
        let admitted = self
            .orders
            .add_order(&pair, account.clone(), side, price, amount, |order| {
                lock_result = self.escrow.lock(order.id, account.clone(), &asset, need);
            })
            .await;

        match admitted {
            Ok(order) => {
                lock_result?;
                self.accounts.save_all().await?;
                info!(account = %account, pair = %pair, order_id = %order.id, side = ?side, price, amount, "order accepted");
                Ok(order.id)
            }
            Err(e) => {
                // Undo the escrow decrease; the order never entered the book.
                self.accounts.increase(account, &asset, need).await?;
                Err(e.into())
            }
        }
    }

    /// Cancel an open order. The refund of the remaining escrow flows through
    /// the pair's settlement channel, behind any pending fills.
    pub async fn cancel_order(
        &self,
        account: &AccountId,
        order_id: OrderId,
    ) -> Result<(), ExchangeError> {
        self.orders.cancel_order(account, order_id).await?;
        Ok(())
    }

    pub async fn get_orders(
        &self,
        pair: &str,
        side: Side,
        start: u64,
        end: u64,
    ) -> Result<Vec<Order>, ExchangeError> {
        let pair: TradePair = pair.parse()?;
        Ok(self.orders.get_orders(&pair, side, start, end).await?)
    }

    // --- withdrawals ---

    /// Withdraw to an external address: reserve pool funding, broadcast, then
    /// deduct and persist the balance. Reserved UTXOs return to the pool on
    /// any failure after reservation.
    pub async fn withdraw(
        &self,
        account: &AccountId,
        chain: CoinType,
        to_addr: &str,
        amount: Amount,
        fee: Option<u64>,
    ) -> Result<String, ExchangeError> {
        if amount == 0 {
            return Err(ExchangeError::InvalidInput(
                "zero-amount withdrawal".to_string(),
            ));
        }
        let service = self.chain(chain)?;
        service.gateway.validate_address(to_addr)?;

        // One withdrawal at a time per account, so the balance check and the
        // later deduction agree.
        let lock = self
            .withdraw_locks
            .entry(account.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let _guard = lock.lock().await;

        let asset = chain.as_str();
        let balance = self.accounts.balance(account, asset).await?;
        if balance < amount {
            return Err(AccountError::InsufficientBalance {
                account: account.clone(),
                asset: asset.to_string(),
                available: balance,
                required: amount,
            }
            .into());
        }

        let fee = match chain {
            CoinType::Bitcoin => Some(fee.unwrap_or(self.cfg.btc_fee)),
            CoinType::Skycoin => {
                if fee.is_some() {
                    return Err(ExchangeError::InvalidInput(
                        "skycoin withdrawals carry no fee".to_string(),
                    ));
                }
                None
            }
        };
        let reserve_target = match fee {
            Some(rate) => rate
                .checked_mul(FEE_HEADROOM_BYTES)
                .and_then(|headroom| amount.checked_add(headroom))
                .ok_or_else(|| ExchangeError::InvalidInput("fee overflows".to_string()))?,
            None => amount,
        };

        let reservation = service
            .pool
            .choose_utxos(reserve_target, WITHDRAW_FUND_WAIT)
            .await?;

        let keys = service.wallet.key_map().await;
        let lookup = |addr: &str| keys.get(addr).cloned();
        let change_addr = service.wallet.ensure_address(&service.gateway).await?.address;

        match service
            .gateway
            .send(to_addr, amount, fee, &reservation.utxos, &change_addr, &lookup)
            .await
        {
            Ok(txid) => {
                service.pool.consume(&reservation.utxos).await;
                self.accounts.decrease(account, asset, amount).await?;
                self.accounts.save_all().await?;
                info!(account = %account, chain = %chain, txid = %txid, amount, "withdrawal broadcast");
                Ok(txid)
            }
            Err(e) => {
                service.pool.put_utxos(&reservation.utxos).await;
                Err(e.into())
            }
        }
    }

    // --- task wiring ---

    /// Spawn every long-lived task against the shared shutdown signal.
    pub fn run(self: &Arc<Self>, shutdown: watch::Receiver<bool>) -> ServerHandles {
        info!(
            addr = %self.cfg.server_addr,
            port = self.cfg.server_port,
            "exchange server started"
        );

        let refresh = Duration::from_secs(self.cfg.pool.refresh_interval_secs);
        let pool_tasks = self
            .chains
            .values()
            .map(|service| tokio::spawn(service.pool.clone().run(refresh, shutdown.clone())))
            .collect();

        let tick = Duration::from_secs(self.cfg.matching.tick_interval_secs);
        let ticker_task = tokio::spawn(self.orders.clone().run(tick, shutdown.clone()));

        let receivers = {
            let mut pending = self
                .pending_settlements
                .lock()
                .expect("settlement receivers poisoned");
            std::mem::take(&mut *pending)
        };
        let settlement_tasks = receivers
            .into_iter()
            .map(|(pair, rx)| {
                tokio::spawn(run_pair_settlement(
                    pair,
                    rx,
                    self.accounts.clone(),
                    self.escrow.clone(),
                    shutdown.clone(),
                ))
            })
            .collect();

        ServerHandles {
            pool_tasks,
            ticker_task,
            settlement_tasks,
        }
    }

    // --- introspection (used by the router and tests) ---

    pub fn accounts(&self) -> Arc<AccountStore> {
        self.accounts.clone()
    }

    pub fn escrow(&self) -> Arc<EscrowLedger> {
        self.escrow.clone()
    }

    pub fn utxo_pool(&self, chain: CoinType) -> Result<Arc<UtxoPool>, ExchangeError> {
        Ok(self.chain(chain)?.pool.clone())
    }
}
