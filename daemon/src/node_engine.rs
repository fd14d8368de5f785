use crate::cs_client;
use crate::keypair::{Address, Keypair};
use crate::matching::{ensure_takeable, match_limit};
use crate::model::order::{LimitOrder, OrderEvent, Trade, TradeEvent};
use crate::model::{OrderId, OrderKind, Price, Role, Timestamp, TokenAmount, TokenPair, TradeId};
use crate::order_book::{OrderBook, OrderBookEntry};
use crate::state_change::{NewTrade, StateChange};
use crate::timeouts::TimeoutScheduler;
use crate::trader::{Trader, TransferReceipt};
use crate::transport::Outbound;
use crate::wire::{
    CancellationProof, CommitmentMsg, CommitmentProof, Message, OrderMessage, ProvenCommitmentMsg,
    ProvenOrderMsg, Signed,
};
use crate::OFFER_THRESHOLD_TIME;
use anyhow::{bail, Context, Result};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};

/// A user-facing view of one order, published on the orders feed.
#[derive(Debug, Clone)]
pub struct OrderSnapshot {
    pub order_id: OrderId,
    pub kind: OrderKind,
    pub amount: TokenAmount,
    pub amount_traded: TokenAmount,
    pub price: Price,
    pub state: crate::model::order::OrderState,
    pub parent: Option<OrderId>,
}

/// A swap the service announced as fully confirmed; the public trade log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletedSwap {
    pub order_id: OrderId,
    pub timestamp: Timestamp,
}

/// One remote order visible in the local book.
#[derive(Debug, Clone)]
pub struct BookEntrySnapshot {
    pub order_id: OrderId,
    pub kind: OrderKind,
    pub base_amount: TokenAmount,
    pub price: Price,
}

/// The order/trade lifecycle engine of a trading node.
///
/// One task owns every order, the book and all timers; state changes are
/// applied strictly in arrival order, so the state machines never race.
pub struct Engine {
    keypair: Keypair,
    market: TokenPair,
    service_address: Address,
    commitment_amount: TokenAmount,
    default_lifetime: Duration,

    orders: HashMap<OrderId, LimitOrder>,
    /// Book entries we are currently taking, keyed by the maker's order id.
    taken_entries: HashMap<OrderId, OrderBookEntry>,
    /// Our signed commitments, kept for the taker's proven commitment.
    commitments: HashMap<OrderId, crate::wire::Commitment>,
    /// The order messages we published, as published.
    published: HashMap<OrderId, OrderMessage>,
    /// Flows whose counterparty transfer we are waiting for.
    expected_inbound: HashMap<OrderId, Address>,
    /// Transfers that arrived before the trade they belong to existed.
    pending_receipts: HashMap<OrderId, TransferReceipt>,
    book: OrderBook,
    timeouts: TimeoutScheduler<StateChange>,
    history: Vec<CompletedSwap>,

    service: mpsc::Sender<cs_client::Command>,
    outbound: mpsc::Sender<Outbound>,
    trader: Arc<dyn Trader>,
    self_sender: mpsc::Sender<StateChange>,
    orders_feed: watch::Sender<Vec<OrderSnapshot>>,
    history_feed: watch::Sender<Vec<CompletedSwap>>,
    book_feed: watch::Sender<Vec<BookEntrySnapshot>>,
}

impl Engine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        keypair: Keypair,
        market: TokenPair,
        service_address: Address,
        commitment_amount: TokenAmount,
        default_lifetime: Duration,
        service: mpsc::Sender<cs_client::Command>,
        outbound: mpsc::Sender<Outbound>,
        trader: Arc<dyn Trader>,
        self_sender: mpsc::Sender<StateChange>,
        orders_feed: watch::Sender<Vec<OrderSnapshot>>,
        history_feed: watch::Sender<Vec<CompletedSwap>>,
        book_feed: watch::Sender<Vec<BookEntrySnapshot>>,
    ) -> Self {
        Self {
            keypair,
            market,
            service_address,
            commitment_amount,
            default_lifetime,
            orders: HashMap::new(),
            taken_entries: HashMap::new(),
            commitments: HashMap::new(),
            published: HashMap::new(),
            expected_inbound: HashMap::new(),
            pending_receipts: HashMap::new(),
            book: OrderBook::default(),
            timeouts: TimeoutScheduler::new(self_sender.clone()),
            history: Vec::new(),
            service,
            outbound,
            trader,
            self_sender,
            orders_feed,
            history_feed,
            book_feed,
        }
    }

    pub async fn run(mut self, mut state_changes: mpsc::Receiver<StateChange>) {
        while let Some(state_change) = state_changes.recv().await {
            if let Err(e) = self.apply(state_change).await {
                tracing::warn!("State change not applied: {e:#}");
            }

            self.publish_feeds();
        }
    }

    async fn apply(&mut self, state_change: StateChange) -> Result<()> {
        match state_change {
            StateChange::NewLimitOrder {
                kind,
                amount,
                price,
                lifetime,
            } => self.handle_new_limit_order(kind, amount, price, lifetime).await,
            StateChange::CancelLimitOrder { order_id } => {
                self.handle_cancel_limit_order(order_id).await
            }
            StateChange::OfferPublished(entry) => self.handle_offer_published(entry).await,
            StateChange::CommitmentProof(proof) => self.handle_commitment_proof(proof).await,
            StateChange::CancellationProof(proof) => self.handle_cancellation_proof(proof),
            StateChange::NewTrade(new_trade) => self.handle_new_trade(new_trade).await,
            StateChange::OrderTimeout {
                order_id,
                timeout_date,
            } => self.handle_order_timeout(order_id, timeout_date).await,
            StateChange::TransferReceived(receipt) => self.handle_transfer_received(receipt).await,
            StateChange::PaymentFailed { order_id } => self.handle_payment_failed(order_id).await,
            StateChange::OfferTaken { order_id } => self.handle_offer_taken(order_id),
            StateChange::SwapCompleted {
                order_id,
                timestamp,
            } => self.handle_swap_completed(order_id, timestamp),
        }
    }

    async fn handle_new_limit_order(
        &mut self,
        kind: OrderKind,
        amount: TokenAmount,
        price: Price,
        lifetime: Option<Duration>,
    ) -> Result<()> {
        let order_id = OrderId::random();
        let lifetime = lifetime.unwrap_or(self.default_lifetime);
        let timeout_date = Timestamp::in_the_future(lifetime);

        tracing::info!(%order_id, %kind, amount, %price, "New limit order");

        let mut order = LimitOrder::new(
            order_id, kind, amount, price, timeout_date, Role::Maker, None,
        );

        let (taken, mut amount_left) = match_limit(&self.book, kind, price, amount);

        for entry in taken {
            let maker_id = entry.order_id();

            if let Err(e) = ensure_takeable(&entry) {
                tracing::warn!("Skipping stale entry: {e}");
                self.book.remove(maker_id);
                amount_left += entry.base_amount;
                continue;
            }

            if let Err(e) = self.timeouts.arm(
                maker_id,
                entry.timeout_date(),
                Duration::ZERO,
                StateChange::OrderTimeout {
                    order_id: maker_id,
                    timeout_date: entry.timeout_date(),
                },
            ) {
                tracing::warn!("Entry can no longer be taken: {e}");
                self.book.remove(maker_id);
                amount_left += entry.base_amount;
                continue;
            }

            self.book.remove(maker_id);

            let mut take = LimitOrder::new(
                maker_id,
                kind,
                entry.base_amount,
                entry.price,
                entry.timeout_date(),
                Role::Taker,
                Some(order_id),
            );
            let events = take.initiate().expect("fresh order accepts initiate");

            tracing::debug!(take_id = %maker_id, parent = %order_id, "Taking entry");

            self.taken_entries.insert(maker_id, entry);
            self.orders.insert(maker_id, take);
            self.dispatch_order_events(maker_id, events).await;
        }

        if amount_left > 0 {
            let events = order.initiate().expect("fresh order accepts initiate");

            self.timeouts
                .arm(
                    order_id,
                    timeout_date,
                    Duration::ZERO,
                    StateChange::OrderTimeout {
                        order_id,
                        timeout_date,
                    },
                )
                .expect("no previous timer for a fresh order id");

            self.orders.insert(order_id, order);
            self.dispatch_order_events(order_id, events).await;
        } else {
            // Fully matched: the order only aggregates its take flows.
            self.orders.insert(order_id, order);
        }

        Ok(())
    }

    async fn handle_cancel_limit_order(&mut self, order_id: OrderId) -> Result<()> {
        let children: Vec<OrderId> = self
            .orders
            .values()
            .filter(|order| order.parent == Some(order_id))
            .map(|order| order.order_id)
            .collect();

        for id in std::iter::once(order_id).chain(children) {
            let Some(order) = self.orders.get_mut(&id) else {
                continue;
            };
            if !order.is_open() {
                continue;
            }

            match order.timeout() {
                Ok(events) => self.dispatch_order_events(id, events).await,
                Err(e) => tracing::debug!("Cancellation skipped: {e}"),
            }
        }

        Ok(())
    }

    async fn handle_offer_published(&mut self, entry: OrderBookEntry) -> Result<()> {
        let order_id = entry.order_id();

        if let Some(order) = self.orders.get_mut(&order_id) {
            // Our own broadcast coming back around.
            let events = order.received_offer()?;
            self.dispatch_order_events(order_id, events).await;

            return Ok(());
        }

        self.timeouts.arm(
            order_id,
            entry.timeout_date(),
            OFFER_THRESHOLD_TIME,
            StateChange::OrderTimeout {
                order_id,
                timeout_date: entry.timeout_date(),
            },
        )?;

        tracing::debug!(%order_id, "Inserting remote order into the book");
        self.book.insert(entry);

        Ok(())
    }

    async fn handle_commitment_proof(&mut self, proof: CommitmentProof) -> Result<()> {
        let order_id = proof.payload.offer_id;
        let order = self
            .orders
            .get_mut(&order_id)
            .with_context(|| format!("Commitment proof for unknown order {order_id}"))?;

        let secret_hash = proof.payload.secret_hash;
        let events = order.receive_commitment_proof(proof.clone())?;
        self.dispatch_order_events(order_id, events).await;

        tracing::info!(%order_id, "Commitment proved");

        let taken = self
            .taken_entries
            .get(&order_id)
            .map(|entry| (entry.initiator, entry.base_amount));

        if let Some((maker, amount)) = taken {
            // Take flow: the match already names the counterparty. Hand the
            // proven commitment to the maker and start the swap.
            let commitment = self
                .commitments
                .get(&order_id)
                .context("Proof for a commitment we never made")?
                .clone();
            let proven = Signed::new(ProvenCommitmentMsg { commitment, proof }, &self.keypair);

            self.outbound
                .send(Outbound::To(maker, Message::ProvenCommitment(proven)))
                .await
                .ok();

            let order = self.orders.get_mut(&order_id).expect("checked above");
            let events = order.received_offer()?;
            self.dispatch_order_events(order_id, events).await;

            self.start_trade(NewTrade {
                trade_id: TradeId::random(),
                maker_order_id: order_id,
                taker_order_id: order_id,
                amount: Some(amount),
                secret_hash: Some(secret_hash),
                counterparty: maker,
            })
            .await?;
        } else {
            // Maker flow: publish the proven order for the remainder.
            let order = self.orders.get(&order_id).expect("checked above");
            let amount = self.maker_remaining(order_id);
            let message = self.order_message(order, amount)?;

            self.published.insert(order_id, message.clone());

            let proven = Signed::new(
                ProvenOrderMsg {
                    order: message,
                    proof,
                },
                &self.keypair,
            );

            self.outbound
                .send(Outbound::Broadcast(Message::ProvenOrder(proven)))
                .await
                .ok();
        }

        Ok(())
    }

    fn handle_cancellation_proof(&mut self, proof: CancellationProof) -> Result<()> {
        let order_id = proof.payload.offer_id;
        let order = self
            .orders
            .get_mut(&order_id)
            .with_context(|| format!("Cancellation proof for unknown order {order_id}"))?;

        order.receive_cancellation_proof(proof)?;
        self.timeouts.cancel(order_id);

        tracing::info!(%order_id, "Order canceled");

        Ok(())
    }

    async fn handle_new_trade(&mut self, new_trade: NewTrade) -> Result<()> {
        // Both ids point at the same commitment flow on this side of the
        // pairing; whichever of them is ours is the order the trade runs on.
        let own_order_id = if self.orders.contains_key(&new_trade.maker_order_id) {
            new_trade.maker_order_id
        } else {
            new_trade.taker_order_id
        };

        if !self.orders.contains_key(&own_order_id) {
            bail!("Trade for unknown order {own_order_id}");
        }

        self.start_trade(NewTrade {
            maker_order_id: own_order_id,
            taker_order_id: own_order_id,
            ..new_trade
        })
        .await
    }

    /// Registers the trade on its order and kicks off the swap leg we owe.
    async fn start_trade(&mut self, new_trade: NewTrade) -> Result<()> {
        let order_id = new_trade.maker_order_id;
        let counterparty = new_trade.counterparty;

        // The advertised remainder, in case the counterparty takes "all".
        let maker_portion = self.maker_remaining(order_id);

        let order = self
            .orders
            .get_mut(&order_id)
            .with_context(|| format!("Trade for unknown order {order_id}"))?;

        let amount = new_trade.amount.unwrap_or(maker_portion);
        if amount == 0 {
            bail!("Order {order_id} has nothing left to trade");
        }

        let secret_hash = new_trade.secret_hash.or_else(|| {
            order
                .commitment_proof
                .as_ref()
                .map(|proof| proof.payload.secret_hash)
        });

        let mut trade = Trade::new(
            new_trade.trade_id,
            order_id,
            order_id,
            amount,
            secret_hash,
        );
        let events = trade.initiate().expect("fresh trade accepts initiate");

        tracing::info!(%order_id, trade_id = %trade.trade_id, amount, "Starting swap");

        order.add_trade(trade);

        self.dispatch_trade_events(order_id, counterparty, amount, events)
            .await;

        if let Some(receipt) = self.pending_receipts.remove(&order_id) {
            self.self_sender
                .send(StateChange::TransferReceived(receipt))
                .await
                .ok();
        }

        Ok(())
    }

    async fn handle_order_timeout(
        &mut self,
        order_id: OrderId,
        timeout_date: Timestamp,
    ) -> Result<()> {
        self.timeouts.cancel(order_id);

        if let Some(order) = self.orders.get_mut(&order_id) {
            if !order.is_open() {
                return Ok(());
            }

            tracing::info!(%order_id, %timeout_date, "Order timed out");

            if let Some(trade) = order.open_trade_mut() {
                if let Err(e) = trade.timeout() {
                    tracing::debug!("Trade timeout skipped: {e}");
                }
            }

            let events = order.timeout()?;
            self.dispatch_order_events(order_id, events).await;
        } else if self.book.contains(order_id) {
            tracing::debug!(%order_id, "Evicting stale book entry");
            self.book.remove(order_id);
        }

        Ok(())
    }

    async fn handle_transfer_received(&mut self, receipt: TransferReceipt) -> Result<()> {
        if receipt.identifier > u32::MAX as u64 {
            bail!("Receipt identifier {} is not an order id", receipt.identifier);
        }
        let order_id = OrderId::new(receipt.identifier as u32);

        if receipt.initiator == self.service_address {
            tracing::info!(%order_id, amount = receipt.amount, "Commitment refund received");
            return Ok(());
        }

        let order = self
            .orders
            .get_mut(&order_id)
            .with_context(|| format!("Receipt for unknown order {order_id}"))?;

        let Some(trade) = order.open_trade_mut() else {
            // The counterparty's transfer can overtake the message that
            // creates the trade; keep it until the trade exists.
            tracing::debug!(%order_id, "Transfer before its trade, deferring");
            self.pending_receipts.insert(order_id, receipt);
            return Ok(());
        };

        if self.expected_inbound.remove(&order_id).is_none() {
            tracing::warn!(%order_id, "Unexpected inbound transfer");
        }

        tracing::info!(%order_id, amount = receipt.amount, "Inbound swap transfer");

        let events = trade.received_inbound()?;
        trade.complete().expect("inbound trade completes");

        for event in events {
            match event {
                TradeEvent::NotifyExecuted => {
                    self.service
                        .send(cs_client::Command::NotifyExecuted { order_id })
                        .await
                        .ok();
                }
                TradeEvent::InitSwap | TradeEvent::ExpectInbound => {}
            }
        }

        let order = self.orders.get_mut(&order_id).expect("checked above");
        if let Err(e) = order.received_inbound() {
            // Take flows that matched locally were still completed above;
            // aggregation below settles the parent.
            tracing::debug!("Order completion skipped: {e}");
        }

        self.settle_finished_flows(order_id);

        Ok(())
    }

    async fn handle_payment_failed(&mut self, order_id: OrderId) -> Result<()> {
        let order = self
            .orders
            .get_mut(&order_id)
            .with_context(|| format!("Payment failure for unknown order {order_id}"))?;

        if let Some(trade) = order.open_trade_mut() {
            trade.payment_failed()?;

            let amount = trade.amount;
            let counterparty = self
                .expected_inbound
                .get(&order_id)
                .copied()
                .context("No counterparty for failed transfer")?;

            tracing::warn!(%order_id, "Swap transfer failed, retrying");
            self.dispatch_trade_events(
                order_id,
                counterparty,
                amount,
                vec![TradeEvent::InitSwap],
            )
            .await;

            return Ok(());
        }

        tracing::warn!(%order_id, "Fee deposit failed, committing again");
        let events = order.payment_failed()?;
        self.dispatch_order_events(order_id, events).await;

        Ok(())
    }

    fn handle_offer_taken(&mut self, order_id: OrderId) -> Result<()> {
        if self.orders.contains_key(&order_id) {
            // Our own order: the proven commitment of the taker drives it.
            return Ok(());
        }

        if self.book.remove(order_id).is_some() {
            tracing::debug!(%order_id, "Order taken, removed from book");
            self.timeouts.cancel(order_id);
        }

        Ok(())
    }

    fn handle_swap_completed(&mut self, order_id: OrderId, timestamp: Timestamp) -> Result<()> {
        self.history.push(CompletedSwap {
            order_id,
            timestamp,
        });

        Ok(())
    }

    async fn dispatch_order_events(&mut self, order_id: OrderId, events: Vec<OrderEvent>) {
        for event in events {
            match event {
                OrderEvent::Commit => {
                    match self.make_commitment(order_id) {
                        Ok(commitment) => {
                            self.service
                                .send(cs_client::Command::Commit(commitment))
                                .await
                                .ok();
                        }
                        Err(e) => tracing::error!(%order_id, "Cannot commit: {e:#}"),
                    };
                }
                OrderEvent::AwaitTaker => {
                    tracing::debug!(%order_id, "Order is live, awaiting counterparty");
                }
                OrderEvent::RequestCancellation => {
                    self.service
                        .send(cs_client::Command::RequestCancellation { order_id })
                        .await
                        .ok();
                }
            }
        }
    }

    async fn dispatch_trade_events(
        &mut self,
        order_id: OrderId,
        counterparty: Address,
        trade_amount: TokenAmount,
        events: Vec<TradeEvent>,
    ) {
        for event in events {
            match event {
                TradeEvent::InitSwap => {
                    let order = &self.orders[&order_id];
                    let token = self.market.outbound_token(order.role, order.kind);
                    let amount = if token == self.market.base_token() {
                        trade_amount
                    } else {
                        match order.price.quote_amount(trade_amount) {
                            Ok(amount) => amount,
                            Err(e) => {
                                tracing::error!(%order_id, "Cannot price the transfer: {e}");
                                continue;
                            }
                        }
                    };

                    let trader = self.trader.clone();
                    let feedback = self.self_sender.clone();
                    let identifier = order_id.to_u32() as u64;

                    tokio::spawn(async move {
                        if let Err(e) =
                            trader.transfer(token, counterparty, amount, identifier).await
                        {
                            tracing::warn!(%order_id, "Swap transfer failed: {e:#}");
                            feedback
                                .send(StateChange::PaymentFailed { order_id })
                                .await
                                .ok();
                        }
                    });
                }
                TradeEvent::ExpectInbound => {
                    self.expected_inbound.insert(order_id, counterparty);
                }
                TradeEvent::NotifyExecuted => {
                    self.service
                        .send(cs_client::Command::NotifyExecuted { order_id })
                        .await
                        .ok();
                }
            }
        }
    }

    /// Builds and signs the commitment for an order, remembering it for the
    /// proven commitment later.
    fn make_commitment(&mut self, order_id: OrderId) -> Result<crate::wire::Commitment> {
        let order = self
            .orders
            .get(&order_id)
            .context("Commitment for unknown order")?;

        let (order_hash, timeout) = match self.taken_entries.get(&order_id) {
            Some(entry) => (entry.message.hash(), entry.timeout_date()),
            None => {
                let amount = self.maker_remaining(order_id);
                let message = self.order_message(order, amount)?;

                (message.hash(), order.timeout_date)
            }
        };

        let commitment = Signed::new(
            CommitmentMsg {
                order_id,
                order_hash,
                timeout,
                amount: self.commitment_amount,
            },
            &self.keypair,
        );

        self.commitments.insert(order_id, commitment.clone());

        Ok(commitment)
    }

    /// The portion of a maker order not spoken for by live take flows or
    /// trades; what the order advertises on the market.
    fn maker_remaining(&self, order_id: OrderId) -> TokenAmount {
        let Some(order) = self.orders.get(&order_id) else {
            return 0;
        };

        let reserved_by_children: TokenAmount = self
            .orders
            .values()
            .filter(|child| child.parent == Some(order_id) && !child.is_canceled())
            .map(|child| child.amount)
            .sum();

        order.remaining().saturating_sub(reserved_by_children)
    }

    /// The absolute (ask, bid) representation of an order on this market.
    fn order_message(&self, order: &LimitOrder, amount: TokenAmount) -> Result<OrderMessage> {
        let quote_amount = order.price.quote_amount(amount)?;

        let (ask_token, ask_amount, bid_token, bid_amount) = match order.kind {
            OrderKind::Buy => (
                self.market.base_token(),
                amount,
                self.market.quote_token(),
                quote_amount,
            ),
            OrderKind::Sell => (
                self.market.quote_token(),
                quote_amount,
                self.market.base_token(),
                amount,
            ),
        };

        Ok(OrderMessage {
            ask_token,
            ask_amount,
            bid_token,
            bid_amount,
            order_id: order.order_id,
            timeout: order.timeout_date,
        })
    }

    /// Folds completed take flows into their parent order and drops the
    /// bookkeeping of finished flows.
    fn settle_finished_flows(&mut self, order_id: OrderId) {
        let Some(order) = self.orders.get(&order_id) else {
            return;
        };

        if order.is_open() {
            return;
        }

        self.timeouts.cancel(order_id);
        self.expected_inbound.remove(&order_id);
        self.commitments.remove(&order_id);

        if let Some(parent_id) = order.parent {
            let Some(order) = self.orders.remove(&order_id) else {
                return;
            };
            self.taken_entries.remove(&order_id);

            if let Some(parent) = self.orders.get_mut(&parent_id) {
                for trade in order.trades().filter(|trade| trade.is_completed()) {
                    parent.absorb_child_trade(trade.clone());
                }

                if !parent.is_open() {
                    tracing::info!(order_id = %parent_id, "Order filled");
                    self.timeouts.cancel(parent_id);
                }
            }
        } else if order.is_completed() {
            tracing::info!(%order_id, "Order filled");
        }
    }

    fn publish_feeds(&self) {
        let snapshots = self
            .orders
            .values()
            .map(|order| OrderSnapshot {
                order_id: order.order_id,
                kind: order.kind,
                amount: order.amount,
                amount_traded: order.amount_traded(),
                price: order.price,
                state: order.state(),
                parent: order.parent,
            })
            .collect();

        self.orders_feed.send(snapshots).ok();
        self.history_feed.send(self.history.clone()).ok();

        let book = self
            .book
            .iter()
            .map(|entry| BookEntrySnapshot {
                order_id: entry.order_id(),
                kind: entry.kind,
                base_amount: entry.base_amount,
                price: entry.price,
            })
            .collect();
        self.book_feed.send(book).ok();
    }
}
