use crate::keypair::Address;
use crate::model::{OrderId, OrderKind, Price, Timestamp, TokenAmount, TokenPair};
use crate::wire::{CommitmentProof, OrderMessage, ProvenOrder};
use anyhow::{Context, Result};
use std::collections::{BTreeMap, HashMap};

/// A proven order of a remote maker, visible for matching.
///
/// The broadcast message works with absolute (ask, bid) amounts so the
/// market's token permutation is not fixed on the wire; the entry stores the
/// side and price relative to our market because prices are what the book
/// orders by.
#[derive(Debug, Clone)]
pub struct OrderBookEntry {
    pub message: OrderMessage,
    pub kind: OrderKind,
    pub base_amount: TokenAmount,
    pub quote_amount: TokenAmount,
    pub price: Price,
    pub initiator: Address,
    pub proof: CommitmentProof,
}

impl OrderBookEntry {
    /// Builds a book entry from a proven order, recovering the maker from
    /// the outer signature.
    pub fn from_proven_order(proven: &ProvenOrder, market: &TokenPair) -> Result<Self> {
        let initiator = proven.sender().context("Proven order is not signed")?;
        let message = proven.payload.order.clone();

        let kind = market.kind_of(message.ask_token, message.bid_token)?;
        let (base_amount, quote_amount) = match kind {
            OrderKind::Buy => (message.ask_amount, message.bid_amount),
            OrderKind::Sell => (message.bid_amount, message.ask_amount),
        };
        let price = Price::from_amounts(base_amount, quote_amount)?;

        Ok(Self {
            message,
            kind,
            base_amount,
            quote_amount,
            price,
            initiator,
            proof: proven.payload.proof.clone(),
        })
    }

    pub fn order_id(&self) -> OrderId {
        self.message.order_id
    }

    pub fn timeout_date(&self) -> Timestamp {
        self.message.timeout
    }

    pub fn timed_out(&self) -> bool {
        self.message.timed_out(Timestamp::now())
    }
}

/// One side of the book: entries ordered by (price, order id) plus an index
/// by order id for constant-time lookup.
#[derive(Debug, Default)]
pub struct OrderView {
    entries: BTreeMap<(Price, OrderId), OrderBookEntry>,
    prices_by_id: HashMap<OrderId, Price>,
}

impl OrderView {
    pub fn add(&mut self, entry: OrderBookEntry) -> OrderId {
        let order_id = entry.order_id();
        let price = entry.price;

        self.entries.insert((price, order_id), entry);
        self.prices_by_id.insert(order_id, price);

        order_id
    }

    pub fn remove(&mut self, order_id: OrderId) -> Option<OrderBookEntry> {
        let price = self.prices_by_id.remove(&order_id)?;

        self.entries.remove(&(price, order_id))
    }

    pub fn get(&self, order_id: OrderId) -> Option<&OrderBookEntry> {
        let price = self.prices_by_id.get(&order_id)?;

        self.entries.get(&(*price, order_id))
    }

    pub fn contains(&self, order_id: OrderId) -> bool {
        self.prices_by_id.contains_key(&order_id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Entries in ascending (price, order id) order.
    pub fn iter(&self) -> impl Iterator<Item = &OrderBookEntry> {
        self.entries.values()
    }
}

/// The double-sided book of proven remote orders.
#[derive(Debug, Default)]
pub struct OrderBook {
    buys: OrderView,
    sells: OrderView,
}

impl OrderBook {
    pub fn insert(&mut self, entry: OrderBookEntry) -> OrderId {
        match entry.kind {
            OrderKind::Buy => self.buys.add(entry),
            OrderKind::Sell => self.sells.add(entry),
        }
    }

    pub fn view(&self, kind: OrderKind) -> &OrderView {
        match kind {
            OrderKind::Buy => &self.buys,
            OrderKind::Sell => &self.sells,
        }
    }

    pub fn get(&self, order_id: OrderId) -> Option<&OrderBookEntry> {
        self.buys.get(order_id).or_else(|| self.sells.get(order_id))
    }

    pub fn contains(&self, order_id: OrderId) -> bool {
        self.buys.contains(order_id) || self.sells.contains(order_id)
    }

    pub fn remove(&mut self, order_id: OrderId) -> Option<OrderBookEntry> {
        self.buys
            .remove(order_id)
            .or_else(|| self.sells.remove(order_id))
    }

    /// All entries, buys before sells, each side in price order.
    pub fn iter(&self) -> impl Iterator<Item = &OrderBookEntry> {
        self.buys.iter().chain(self.sells.iter())
    }
}
