//! Order manager: owns every pair's book and drives the match ticker.
//!
//! On each tick every book runs one match cycle under its own lock; the
//! resulting events go down that pair's bounded channel to settlement. A full
//! channel back-pressures the ticker instead of dropping: the match already
//! happened in memory, so dropping would corrupt bookkeeping.
//!
//! Books persist to `<data_dir>/orderbook/<pair>.json` after any tick that
//! changed them, and the write happens before fill delivery, so a restart
//! never re-matches orders whose fills may already be settled.

use common_types::{
    snapshot, unix_time, AccountId, Amount, BookEvent, Order, OrderId, Price, Side, TradePair,
};
use matching_engine::{BookError, OrderBook};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, watch, Mutex};
use tracing::{debug, error, info};

/// Capacity of each pair's settlement channel.
pub const PAIR_CHANNEL_CAPACITY: usize = 100;

#[derive(Error, Debug)]
pub enum OrderManagerError {
    #[error("unsupported pair: {0}")]
    UnsupportedPair(TradePair),
    #[error(transparent)]
    Book(#[from] BookError),
    #[error("order {0} not found")]
    NotFound(OrderId),
    #[error("order {0} belongs to another account")]
    NotOwner(OrderId),
    #[error("settlement channel for {0} is closed or missing")]
    ChannelClosed(TradePair),
    #[error("snapshot error: {0}")]
    Snapshot(#[from] snapshot::SnapshotError),
}

struct PairSlot {
    book: Mutex<OrderBook>,
    sender: Option<mpsc::Sender<BookEvent>>,
}

pub struct OrderManager {
    dir: PathBuf,
    pairs: HashMap<TradePair, PairSlot>,
}

impl OrderManager {
    /// Load books for `pairs` from `<data_dir>/orderbook/`, creating empty
    /// ones where no snapshot exists. Corrupt snapshots are fatal.
    pub async fn load(data_dir: &Path, pairs: &[TradePair]) -> Result<Self, OrderManagerError> {
        let dir = data_dir.join("orderbook");
        let mut map = HashMap::new();
        for pair in pairs {
            let path = dir.join(format!("{}.json", pair.file_stem()));
            let book = match snapshot::load_json::<OrderBook>(&path).await? {
                Some(book) => book,
                None => OrderBook::new(pair.clone()),
            };
            map.insert(
                pair.clone(),
                PairSlot {
                    book: Mutex::new(book),
                    sender: None,
                },
            );
        }
        Ok(OrderManager { dir, pairs: map })
    }

    /// Wire a pair's output channel. Must happen before the ticker starts.
    pub fn register_channel(
        &mut self,
        pair: &TradePair,
        sender: mpsc::Sender<BookEvent>,
    ) -> Result<(), OrderManagerError> {
        let slot = self
            .pairs
            .get_mut(pair)
            .ok_or_else(|| OrderManagerError::UnsupportedPair(pair.clone()))?;
        slot.sender = Some(sender);
        Ok(())
    }

    pub fn pairs(&self) -> Vec<TradePair> {
        self.pairs.keys().cloned().collect()
    }

    fn slot(&self, pair: &TradePair) -> Result<&PairSlot, OrderManagerError> {
        self.pairs
            .get(pair)
            .ok_or_else(|| OrderManagerError::UnsupportedPair(pair.clone()))
    }

    /// Admit an order. `on_admit` runs under the book lock once the id is
    /// assigned, before any match cycle can see the order; the caller uses it
    /// to record the escrow taken at admission.
    pub async fn add_order(
        &self,
        pair: &TradePair,
        account: AccountId,
        side: Side,
        price: Price,
        amount: Amount,
        on_admit: impl FnOnce(&Order),
    ) -> Result<Order, OrderManagerError> {
        let slot = self.slot(pair)?;
        let mut book = slot.book.lock().await;
        let order = book.add(account, side, price, amount, unix_time())?;
        on_admit(&order);
        debug!(pair = %pair, order_id = %order.id, side = ?side, price, amount, "order admitted");
        Ok(order)
    }

    /// Cancel an open order owned by `account`. The book change persists
    /// before the `Cancelled` event enters the pair channel, where it
    /// serializes behind any pending fills of the same order.
    pub async fn cancel_order(
        &self,
        account: &AccountId,
        order_id: OrderId,
    ) -> Result<Order, OrderManagerError> {
        for (pair, slot) in &self.pairs {
            let mut book = slot.book.lock().await;
            match book.find(order_id) {
                None => continue,
                Some(order) if order.account != *account => {
                    return Err(OrderManagerError::NotOwner(order_id));
                }
                Some(_) => {}
            }

            let order = book.cancel(order_id)?;
            book.take_dirty();
            let bytes = serde_json::to_vec_pretty(&*book)
                .map_err(snapshot::SnapshotError::Json)?;
            drop(book);

            snapshot::write_atomic(&self.book_path(pair), &bytes).await?;
            let sender = slot
                .sender
                .as_ref()
                .ok_or_else(|| OrderManagerError::ChannelClosed(pair.clone()))?;
            sender
                .send(BookEvent::Cancelled(order.clone()))
                .await
                .map_err(|_| OrderManagerError::ChannelClosed(pair.clone()))?;
            info!(pair = %pair, order_id = %order_id, "order cancelled");
            return Ok(order);
        }
        Err(OrderManagerError::NotFound(order_id))
    }

    pub async fn get_orders(
        &self,
        pair: &TradePair,
        side: Side,
        start: u64,
        end: u64,
    ) -> Result<Vec<Order>, OrderManagerError> {
        let slot = self.slot(pair)?;
        let book = slot.book.lock().await;
        Ok(book.list(side, start, end))
    }

    /// All open orders of a pair, for escrow reconstruction at startup.
    pub async fn open_orders(&self, pair: &TradePair) -> Result<Vec<Order>, OrderManagerError> {
        let slot = self.slot(pair)?;
        let book = slot.book.lock().await;
        Ok(book.open_orders().cloned().collect())
    }

    /// One match cycle across all books: match under the lock, persist the
    /// changed book, then deliver fills (blocking when the channel is full).
    pub async fn tick_all(&self) -> Result<(), OrderManagerError> {
        for (pair, slot) in &self.pairs {
            let (fills, bytes) = {
                let mut book = slot.book.lock().await;
                let fills = book.match_once();
                let bytes = if book.take_dirty() {
                    Some(
                        serde_json::to_vec_pretty(&*book)
                            .map_err(snapshot::SnapshotError::Json)?,
                    )
                } else {
                    None
                };
                (fills, bytes)
            };

            if let Some(bytes) = bytes {
                snapshot::write_atomic(&self.book_path(pair), &bytes).await?;
            }

            if fills.is_empty() {
                continue;
            }
            let sender = slot
                .sender
                .as_ref()
                .ok_or_else(|| OrderManagerError::ChannelClosed(pair.clone()))?;
            for fill in fills {
                debug!(pair = %pair, order_id = %fill.order.id, executed = fill.executed, "fill");
                sender
                    .send(BookEvent::Filled(fill))
                    .await
                    .map_err(|_| OrderManagerError::ChannelClosed(pair.clone()))?;
            }
        }
        Ok(())
    }

    /// The match ticker. Runs until shutdown; a failed tick (closed channel,
    /// failed persistence) stops the loop so supervision can restart cleanly.
    pub async fn run(
        self: Arc<Self>,
        interval: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.tick_all().await {
                        error!(error = %e, "match tick failed; stopping ticker");
                        return;
                    }
                }
                _ = shutdown.changed() => {
                    info!("order manager stopped");
                    return;
                }
            }
        }
    }

    fn book_path(&self, pair: &TradePair) -> PathBuf {
        self.dir.join(format!("{}.json", pair.file_stem()))
    }
}
