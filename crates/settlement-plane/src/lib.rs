//! Settlement: turns matched orders into balance mutations.
//!
//! One task per pair consumes that pair's event channel, so balance effects
//! within a pair are strictly serialized. Admission escrows funds out of the
//! balance (bids lock `price x amount` of SUB, asks lock `amount` of MAIN)
//! into the [`EscrowLedger`]; settlement credits the counter asset, burns the
//! escrow covering the executed portion, and refunds bid surplus when the
//! maker priced below the bid's limit. The store persists after every
//! mutation.
//!
//! Any accounting failure here means admission let something through it must
//! not have; that is fatal and the task surfaces it instead of skipping.

use account_store::{AccountError, AccountStore};
use common_types::{Amount, AccountId, BookEvent, FillReport, Order, OrderId, Side, TradePair};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info};

#[derive(Error, Debug)]
pub enum SettlementError {
    #[error("accounting invariant violated: {0}")]
    Fatal(String),
    #[error("account store error: {0}")]
    Store(#[from] AccountError),
}

struct EscrowEntry {
    account: AccountId,
    asset: String,
    remaining: Amount,
}

/// Funds taken out of balances at order admission, keyed by order id.
/// Entries shrink as fills settle and disappear when an order completes or
/// is cancelled.
#[derive(Default)]
pub struct EscrowLedger {
    inner: Mutex<HashMap<OrderId, EscrowEntry>>,
}

/// What admitting `order` must escrow, computed from the unfilled remainder:
/// bids lock their limit value in SUB, asks lock the quantity in MAIN.
/// `None` when the value overflows.
pub fn escrow_requirement(order: &Order, pair: &TradePair) -> Option<(String, Amount)> {
    match order.side {
        Side::Bid => Some((
            pair.sub.clone(),
            order.price.checked_mul(order.amount_remaining)?,
        )),
        Side::Ask => Some((pair.main.clone(), order.amount_remaining)),
    }
}

impl EscrowLedger {
    pub fn new() -> Self {
        EscrowLedger::default()
    }

    pub fn lock(
        &self,
        order_id: OrderId,
        account: AccountId,
        asset: &str,
        amount: Amount,
    ) -> Result<(), SettlementError> {
        let mut inner = self.inner.lock().expect("escrow ledger poisoned");
        if inner.contains_key(&order_id) {
            return Err(SettlementError::Fatal(format!(
                "order {} escrowed twice",
                order_id
            )));
        }
        inner.insert(
            order_id,
            EscrowEntry {
                account,
                asset: asset.to_string(),
                remaining: amount,
            },
        );
        Ok(())
    }

    /// Burn `amount` of an order's escrow; the entry goes away at zero.
    pub fn release(&self, order_id: OrderId, amount: Amount) -> Result<(), SettlementError> {
        let mut inner = self.inner.lock().expect("escrow ledger poisoned");
        let entry = inner.get_mut(&order_id).ok_or_else(|| {
            SettlementError::Fatal(format!("no escrow for settled order {}", order_id))
        })?;
        if entry.remaining < amount {
            return Err(SettlementError::Fatal(format!(
                "escrow underflow for order {}: {} held, {} released",
                order_id, entry.remaining, amount
            )));
        }
        entry.remaining -= amount;
        if entry.remaining == 0 {
            inner.remove(&order_id);
        }
        Ok(())
    }

    /// Drop an order's entry and return what was still held, for refunds.
    pub fn withdraw_remainder(
        &self,
        order_id: OrderId,
    ) -> Result<(AccountId, String, Amount), SettlementError> {
        let mut inner = self.inner.lock().expect("escrow ledger poisoned");
        let entry = inner.remove(&order_id).ok_or_else(|| {
            SettlementError::Fatal(format!("no escrow for cancelled order {}", order_id))
        })?;
        Ok((entry.account, entry.asset, entry.remaining))
    }

    /// Total escrow held for one account and asset.
    pub fn held(&self, account: &AccountId, asset: &str) -> Amount {
        let inner = self.inner.lock().expect("escrow ledger poisoned");
        inner
            .values()
            .filter(|e| e.account == *account && e.asset == asset)
            .map(|e| e.remaining)
            .sum()
    }

    /// Total escrow held in an asset across all accounts.
    pub fn total_held(&self, asset: &str) -> Amount {
        let inner = self.inner.lock().expect("escrow ledger poisoned");
        inner
            .values()
            .filter(|e| e.asset == asset)
            .map(|e| e.remaining)
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().expect("escrow ledger poisoned").is_empty()
    }
}

/// Per-pair settlement task. Consumes events until shutdown, then drains the
/// channel with a bounded wait and flushes the store before returning. A
/// returned error is an accounting invariant violation; the caller aborts.
pub async fn run_pair_settlement(
    pair: TradePair,
    mut events: mpsc::Receiver<BookEvent>,
    accounts: Arc<AccountStore>,
    escrow: Arc<EscrowLedger>,
    mut shutdown: watch::Receiver<bool>,
) -> Result<(), SettlementError> {
    info!(pair = %pair, "settlement task started");
    loop {
        tokio::select! {
            maybe = events.recv() => match maybe {
                Some(event) => settle_event(&pair, event, &accounts, &escrow).await?,
                None => {
                    info!(pair = %pair, "event channel closed");
                    return Ok(());
                }
            },
            _ = shutdown.changed() => break,
        }
    }

    // Drain whatever matching produced before the shutdown reached it.
    loop {
        match tokio::time::timeout(Duration::from_millis(200), events.recv()).await {
            Ok(Some(event)) => settle_event(&pair, event, &accounts, &escrow).await?,
            Ok(None) | Err(_) => break,
        }
    }
    accounts.save_all().await?;
    info!(pair = %pair, "settlement task stopped");
    Ok(())
}

async fn settle_event(
    pair: &TradePair,
    event: BookEvent,
    accounts: &AccountStore,
    escrow: &EscrowLedger,
) -> Result<(), SettlementError> {
    match event {
        BookEvent::Filled(fill) => settle_fill(pair, &fill, accounts, escrow).await?,
        BookEvent::Cancelled(order) => {
            let (account, asset, remainder) = escrow.withdraw_remainder(order.id)?;
            if remainder > 0 {
                accounts
                    .increase(&account, &asset, remainder)
                    .await
                    .map_err(fatal)?;
            }
            debug!(pair = %pair, order_id = %order.id, refunded = remainder, "cancel refunded");
        }
    }
    accounts.save_all().await?;
    Ok(())
}

async fn settle_fill(
    pair: &TradePair,
    fill: &FillReport,
    accounts: &AccountStore,
    escrow: &EscrowLedger,
) -> Result<(), SettlementError> {
    let order = &fill.order;
    match order.side {
        Side::Bid => {
            // Buyer receives MAIN; the SUB was escrowed at admission at the
            // bid's limit price, so burn that much and refund any maker
            // price improvement.
            accounts
                .increase(&order.account, &pair.main, fill.executed)
                .await
                .map_err(fatal)?;
            let locked_for_fill = order.price * fill.executed;
            escrow.release(order.id, locked_for_fill)?;
            let surplus = locked_for_fill - fill.value;
            if surplus > 0 {
                accounts
                    .increase(&order.account, &pair.sub, surplus)
                    .await
                    .map_err(fatal)?;
            }
        }
        Side::Ask => {
            // Seller receives the maker-priced SUB value; the executed MAIN
            // leaves the seller's escrow (its decrease happened at admission).
            accounts
                .increase(&order.account, &pair.sub, fill.value)
                .await
                .map_err(fatal)?;
            escrow.release(order.id, fill.executed)?;
        }
    }
    debug!(
        pair = %pair,
        order_id = %order.id,
        side = ?order.side,
        executed = fill.executed,
        value = fill.value,
        "fill settled"
    );
    Ok(())
}

fn fatal(e: AccountError) -> SettlementError {
    SettlementError::Fatal(e.to_string())
}
