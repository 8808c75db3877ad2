//! Matching engine library.
//!
//! This crate implements price-time priority matching for limit orders in a
//! per-pair [`OrderBook`]. It is intentionally minimal and free of networking
//! or persistence concerns; the order manager drives [`OrderBook::match_once`]
//! on its tick and ships the resulting [`FillReport`]s to settlement.
//!
//! Key properties
//! - Deterministic: given the same book, `match_once` produces the same fills
//! - Price-time priority: best price first; FIFO within each price level
//! - Batch semantics: one report per order that traded in the cycle, carrying
//!   the executed quantity and its maker-priced value
//!
use common_types::{AccountId, Amount, FillReport, Order, OrderId, OrderStatus, Price, Side, TradePair};
use serde::{Deserialize, Serialize};
use std::cmp::Reverse;
use std::collections::{BTreeMap, HashMap, VecDeque};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum BookError {
    #[error("invalid order: {0}")]
    InvalidOrder(String),
    #[error("order {0} not found")]
    NotFound(OrderId),
}

pub type PriceLevel = VecDeque<Order>;

/// One pair's book: bids keyed best-first via `Reverse`, asks ascending.
/// Order ids are assigned append-only and monotonically within the book.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderBook {
    pub pair: TradePair,
    bids: BTreeMap<Reverse<Price>, PriceLevel>,
    asks: BTreeMap<Price, PriceLevel>,
    next_order_id: u64,
    #[serde(skip)]
    dirty: bool,
}

impl OrderBook {
    pub fn new(pair: TradePair) -> Self {
        OrderBook {
            pair,
            bids: BTreeMap::new(),
            asks: BTreeMap::new(),
            next_order_id: 1,
            dirty: false,
        }
    }

    /// Admit an order and assign its id. Balance escrow has already happened
    /// upstream; the book only checks shape.
    pub fn add(
        &mut self,
        account: AccountId,
        side: Side,
        price: Price,
        amount: Amount,
        created_at: u64,
    ) -> Result<Order, BookError> {
        if price == 0 || amount == 0 {
            return Err(BookError::InvalidOrder(
                "price and amount must be positive".to_string(),
            ));
        }
        if price.checked_mul(amount).is_none() {
            return Err(BookError::InvalidOrder("order value overflows".to_string()));
        }

        let order = Order {
            id: OrderId(self.next_order_id),
            account,
            side,
            price,
            amount,
            amount_remaining: amount,
            created_at,
            status: OrderStatus::Open,
        };
        self.next_order_id += 1;

        match side {
            Side::Bid => self.bids.entry(Reverse(price)).or_default().push_back(order.clone()),
            Side::Ask => self.asks.entry(price).or_default().push_back(order.clone()),
        }
        self.dirty = true;
        Ok(order)
    }

    /// Remove an open order. The returned order carries `Cancelled` status and
    /// the unfilled remainder, which the caller refunds from escrow.
    pub fn cancel(&mut self, id: OrderId) -> Result<Order, BookError> {
        fn take<K: Ord + Copy>(
            levels: &mut BTreeMap<K, PriceLevel>,
            id: OrderId,
        ) -> Option<Order> {
            let mut hit = None;
            for (key, level) in levels.iter_mut() {
                if let Some(pos) = level.iter().position(|o| o.id == id) {
                    if let Some(order) = level.remove(pos) {
                        hit = Some((*key, order));
                    }
                    break;
                }
            }
            let (key, order) = hit?;
            if levels.get(&key).is_some_and(VecDeque::is_empty) {
                levels.remove(&key);
            }
            Some(order)
        }

        let order = take(&mut self.bids, id).or_else(|| take(&mut self.asks, id));
        let mut order = order.ok_or(BookError::NotFound(id))?;
        order.status = OrderStatus::Cancelled;
        self.dirty = true;
        Ok(order)
    }

    /// Open orders of one side created within `[start, end]`, best price first.
    pub fn list(&self, side: Side, start: u64, end: u64) -> Vec<Order> {
        let in_range = |o: &&Order| o.created_at >= start && o.created_at <= end;
        match side {
            Side::Bid => self
                .bids
                .values()
                .flatten()
                .filter(in_range)
                .cloned()
                .collect(),
            Side::Ask => self
                .asks
                .values()
                .flatten()
                .filter(in_range)
                .cloned()
                .collect(),
        }
    }

    pub fn best_bid(&self) -> Option<Price> {
        self.bids.keys().next().map(|r| r.0)
    }

    pub fn best_ask(&self) -> Option<Price> {
        self.asks.keys().next().copied()
    }

    pub fn open_orders(&self) -> impl Iterator<Item = &Order> {
        self.bids.values().flatten().chain(self.asks.values().flatten())
    }

    pub fn find(&self, id: OrderId) -> Option<&Order> {
        self.open_orders().find(|o| o.id == id)
    }

    /// True once since the last call if the book changed (admissions, cancels,
    /// executions). The order manager persists on dirty ticks.
    pub fn take_dirty(&mut self) -> bool {
        std::mem::take(&mut self.dirty)
    }

    /// Run one match cycle to completion.
    ///
    /// While the book is crossed, the oldest orders at the best prices trade
    /// at the earlier order's price. Fully filled orders leave the book with
    /// `Matched` status. Returns one report per order that traded, in the
    /// order each first traded.
    pub fn match_once(&mut self) -> Vec<FillReport> {
        let mut sequence: Vec<OrderId> = Vec::new();
        let mut fills: HashMap<OrderId, FillReport> = HashMap::new();

        loop {
            let Some(bid_price) = self.best_bid() else { break };
            let Some(ask_price) = self.best_ask() else { break };
            if bid_price < ask_price {
                break;
            }

            let mut bid_entry = self.bids.first_entry().unwrap();
            let mut ask_entry = self.asks.first_entry().unwrap();
            let (bid_done, ask_done);
            {
                let bid = bid_entry.get_mut().front_mut().unwrap();
                let ask = ask_entry.get_mut().front_mut().unwrap();

                // The maker (earlier admitted order) prices the execution.
                let exec_price = if (bid.created_at, bid.id) <= (ask.created_at, ask.id) {
                    bid.price
                } else {
                    ask.price
                };
                let quantity = bid.amount_remaining.min(ask.amount_remaining);
                let value = exec_price * quantity;

                bid.amount_remaining -= quantity;
                ask.amount_remaining -= quantity;
                if bid.amount_remaining == 0 {
                    bid.status = OrderStatus::Matched;
                }
                if ask.amount_remaining == 0 {
                    ask.status = OrderStatus::Matched;
                }

                record(&mut fills, &mut sequence, bid, quantity, value);
                record(&mut fills, &mut sequence, ask, quantity, value);
                bid_done = bid.amount_remaining == 0;
                ask_done = ask.amount_remaining == 0;
            }

            if bid_done {
                bid_entry.get_mut().pop_front();
            }
            if bid_entry.get_mut().is_empty() {
                bid_entry.remove();
            }
            if ask_done {
                ask_entry.get_mut().pop_front();
            }
            if ask_entry.get_mut().is_empty() {
                ask_entry.remove();
            }
            self.dirty = true;
        }

        sequence
            .into_iter()
            .map(|id| fills.remove(&id).unwrap())
            .collect()
    }
}

fn record(
    fills: &mut HashMap<OrderId, FillReport>,
    sequence: &mut Vec<OrderId>,
    order: &Order,
    quantity: Amount,
    value: Amount,
) {
    match fills.get_mut(&order.id) {
        Some(report) => {
            report.order = order.clone();
            report.executed += quantity;
            report.value += value;
        }
        None => {
            sequence.push(order.id);
            fills.insert(
                order.id,
                FillReport {
                    order: order.clone(),
                    executed: quantity,
                    value,
                },
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn book() -> OrderBook {
        OrderBook::new(TradePair::new("bitcoin", "skycoin"))
    }

    fn acct(tag: &str) -> AccountId {
        AccountId(tag.to_string())
    }

    #[test]
    fn ids_are_monotonic() {
        let mut book = book();
        let a = book.add(acct("a"), Side::Bid, 5, 10, 0).unwrap();
        let b = book.add(acct("a"), Side::Ask, 9, 10, 0).unwrap();
        assert!(b.id > a.id);
    }

    #[test]
    fn rejects_degenerate_orders() {
        let mut book = book();
        assert!(book.add(acct("a"), Side::Bid, 0, 10, 0).is_err());
        assert!(book.add(acct("a"), Side::Bid, 10, 0, 0).is_err());
        assert!(book.add(acct("a"), Side::Bid, u64::MAX, 2, 0).is_err());
    }

    #[test]
    fn no_cross_no_match() {
        let mut book = book();
        book.add(acct("a"), Side::Bid, 9, 100, 0).unwrap();
        book.add(acct("b"), Side::Ask, 10, 100, 1).unwrap();

        assert!(book.match_once().is_empty());
        assert_eq!(book.best_bid(), Some(9));
        assert_eq!(book.best_ask(), Some(10));
    }

    #[test]
    fn full_match_at_equal_price() {
        let mut book = book();
        let ask = book.add(acct("a"), Side::Ask, 5, 100, 0).unwrap();
        let bid = book.add(acct("b"), Side::Bid, 5, 100, 1).unwrap();

        let fills = book.match_once();
        assert_eq!(fills.len(), 2);
        // Reports appear in the order the orders first traded.
        assert_eq!(fills[0].order.id, bid.id);
        assert_eq!(fills[1].order.id, ask.id);
        for fill in &fills {
            assert_eq!(fill.executed, 100);
            assert_eq!(fill.value, 500);
            assert_eq!(fill.order.status, OrderStatus::Matched);
        }
        assert_eq!(book.best_bid(), None);
        assert_eq!(book.best_ask(), None);
    }

    #[test]
    fn partial_fill_leaves_remainder_open() {
        let mut book = book();
        let ask = book.add(acct("a"), Side::Ask, 10, 200, 0).unwrap();
        let bid = book.add(acct("b"), Side::Bid, 10, 150, 1).unwrap();

        let fills = book.match_once();
        assert_eq!(fills.len(), 2);

        let bid_fill = fills.iter().find(|f| f.order.id == bid.id).unwrap();
        assert_eq!(bid_fill.executed, 150);
        assert_eq!(bid_fill.order.status, OrderStatus::Matched);

        let ask_fill = fills.iter().find(|f| f.order.id == ask.id).unwrap();
        assert_eq!(ask_fill.executed, 150);
        assert_eq!(ask_fill.order.status, OrderStatus::Open);
        assert_eq!(ask_fill.order.amount_remaining, 50);

        // The remainder stays on the book for future ticks.
        let open: Vec<Order> = book.list(Side::Ask, 0, u64::MAX);
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].amount_remaining, 50);
        assert_eq!(open[0].amount, 200);
    }

    #[test]
    fn one_report_per_order_across_multiple_executions() {
        let mut book = book();
        let ask1 = book.add(acct("a"), Side::Ask, 5, 60, 0).unwrap();
        let ask2 = book.add(acct("a"), Side::Ask, 5, 40, 1).unwrap();
        let bid = book.add(acct("b"), Side::Bid, 5, 100, 2).unwrap();

        let fills = book.match_once();
        // One bid report after its final fill, plus one per ask.
        assert_eq!(fills.len(), 3);
        let bid_fill = fills.iter().find(|f| f.order.id == bid.id).unwrap();
        assert_eq!(bid_fill.executed, 100);
        assert_eq!(bid_fill.value, 500);
        assert_eq!(bid_fill.order.status, OrderStatus::Matched);
        assert_eq!(
            fills.iter().filter(|f| f.order.id != bid.id).count(),
            2,
            "asks {:?} {:?}",
            ask1.id,
            ask2.id
        );
    }

    #[test]
    fn maker_price_wins() {
        let mut book = book();
        // Ask admitted first at 5; later bid crosses at 7.
        book.add(acct("a"), Side::Ask, 5, 10, 0).unwrap();
        book.add(acct("b"), Side::Bid, 7, 10, 1).unwrap();

        let fills = book.match_once();
        for fill in &fills {
            assert_eq!(fill.value, 50, "executions price at the maker's 5");
        }
    }

    #[test]
    fn time_priority_within_level() {
        let mut book = book();
        let first = book.add(acct("a"), Side::Ask, 5, 10, 0).unwrap();
        let second = book.add(acct("b"), Side::Ask, 5, 10, 1).unwrap();
        book.add(acct("c"), Side::Bid, 5, 10, 2).unwrap();

        let fills = book.match_once();
        let asks: Vec<OrderId> = fills
            .iter()
            .filter(|f| f.order.side == Side::Ask)
            .map(|f| f.order.id)
            .collect();
        assert_eq!(asks, vec![first.id]);
        assert!(book.find(second.id).is_some());
    }

    #[test]
    fn book_never_crossed_between_cycles() {
        let mut book = book();
        book.add(acct("a"), Side::Ask, 5, 10, 0).unwrap();
        book.add(acct("b"), Side::Bid, 8, 30, 1).unwrap();
        book.add(acct("a"), Side::Ask, 6, 10, 2).unwrap();
        book.match_once();

        if let (Some(bid), Some(ask)) = (book.best_bid(), book.best_ask()) {
            assert!(bid < ask);
        }
    }

    #[test]
    fn cancel_returns_remainder() {
        let mut book = book();
        let order = book.add(acct("a"), Side::Bid, 5, 100, 0).unwrap();
        let cancelled = book.cancel(order.id).unwrap();
        assert_eq!(cancelled.status, OrderStatus::Cancelled);
        assert_eq!(cancelled.amount_remaining, 100);
        assert!(book.match_once().is_empty());
        assert!(matches!(book.cancel(order.id), Err(BookError::NotFound(_))));
    }

    #[test]
    fn list_filters_by_created_range() {
        let mut book = book();
        book.add(acct("a"), Side::Bid, 5, 10, 100).unwrap();
        book.add(acct("a"), Side::Bid, 6, 10, 200).unwrap();
        book.add(acct("a"), Side::Bid, 7, 10, 300).unwrap();

        let listed = book.list(Side::Bid, 150, 250);
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].created_at, 200);
    }

    #[test]
    fn dirty_flag_tracks_changes() {
        let mut book = book();
        assert!(!book.take_dirty());
        book.add(acct("a"), Side::Bid, 5, 10, 0).unwrap();
        assert!(book.take_dirty());
        assert!(!book.take_dirty());
    }
}
