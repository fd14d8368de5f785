use crate::model::{OrderId, OrderKind, Price, Role, Timestamp, TokenAmount, TradeId};
use crate::wire::{CancellationProof, CommitmentProof};
use std::collections::HashMap;
use std::fmt;

/// A trigger arrived in a state that has no transition for it. Callers log
/// and drop, they never panic.
#[derive(thiserror::Error, Debug)]
#[error("Trigger {trigger} is not allowed in state {state}")]
pub struct IllegalTransition {
    pub trigger: &'static str,
    pub state: String,
}

/// Actions requested by an order transition, performed by the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderEvent {
    /// Deposit fee tokens with the commitment service and send a commitment.
    Commit,
    /// The order is live on the market; watch for a counterparty.
    AwaitTaker,
    /// Ask the commitment service to cancel the commitment.
    RequestCancellation,
}

/// Actions requested by a trade transition, performed by the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TradeEvent {
    /// Start the outbound channel transfer to the counterparty.
    InitSwap,
    /// Register the inbound transfer we expect from the counterparty.
    ExpectInbound,
    /// Report the executed swap to the commitment service.
    NotifyExecuted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenOrder {
    Created,
    Unproved,
    Proved,
    Published,
    CancellationRequested,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderState {
    Open(OpenOrder),
    Completed,
    Canceled,
}

impl fmt::Display for OrderState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OrderState::Open(OpenOrder::Created) => write!(f, "open.created"),
            OrderState::Open(OpenOrder::Unproved) => write!(f, "open.unproved"),
            OrderState::Open(OpenOrder::Proved) => write!(f, "open.proved"),
            OrderState::Open(OpenOrder::Published) => write!(f, "open.published"),
            OrderState::Open(OpenOrder::CancellationRequested) => {
                write!(f, "open.cancellation_requested")
            }
            OrderState::Completed => write!(f, "completed"),
            OrderState::Canceled => write!(f, "canceled"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenTrade {
    Created,
    Pending,
    ReceivedInbound,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TradeState {
    Open(OpenTrade),
    Completed,
    Timeout,
}

impl fmt::Display for TradeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TradeState::Open(OpenTrade::Created) => write!(f, "open.created"),
            TradeState::Open(OpenTrade::Pending) => write!(f, "open.pending"),
            TradeState::Open(OpenTrade::ReceivedInbound) => write!(f, "open.received_inbound"),
            TradeState::Completed => write!(f, "completed"),
            TradeState::Timeout => write!(f, "timeout"),
        }
    }
}

/// One asset exchange between a maker order and a taker order, carrying the
/// hash lock the channel transfers are conditioned on.
#[derive(Debug, Clone)]
pub struct Trade {
    pub trade_id: TradeId,
    pub maker_order_id: OrderId,
    pub taker_order_id: OrderId,
    pub amount: TokenAmount,
    pub secret_hash: Option<[u8; 32]>,
    state: TradeState,
}

impl Trade {
    pub fn new(
        trade_id: TradeId,
        maker_order_id: OrderId,
        taker_order_id: OrderId,
        amount: TokenAmount,
        secret_hash: Option<[u8; 32]>,
    ) -> Self {
        Self {
            trade_id,
            maker_order_id,
            taker_order_id,
            amount,
            secret_hash,
            state: TradeState::Open(OpenTrade::Created),
        }
    }

    pub fn state(&self) -> TradeState {
        self.state
    }

    pub fn is_open(&self) -> bool {
        matches!(self.state, TradeState::Open(_))
    }

    pub fn is_completed(&self) -> bool {
        self.state == TradeState::Completed
    }

    pub fn initiate(&mut self) -> Result<Vec<TradeEvent>, IllegalTransition> {
        match self.state {
            TradeState::Open(OpenTrade::Created) => {
                self.state = TradeState::Open(OpenTrade::Pending);
                Ok(vec![TradeEvent::InitSwap, TradeEvent::ExpectInbound])
            }
            state => Err(illegal("initiate", state)),
        }
    }

    pub fn payment_failed(&mut self) -> Result<Vec<TradeEvent>, IllegalTransition> {
        match self.state {
            TradeState::Open(OpenTrade::Pending) => Ok(vec![]),
            state => Err(illegal("payment_failed", state)),
        }
    }

    /// The counterparty's transfer arrived. An inbound observed before the
    /// deadline wins over a late timeout because delivery is serialized.
    pub fn received_inbound(&mut self) -> Result<Vec<TradeEvent>, IllegalTransition> {
        match self.state {
            TradeState::Open(OpenTrade::Pending) => {
                self.state = TradeState::Open(OpenTrade::ReceivedInbound);
                Ok(vec![TradeEvent::NotifyExecuted])
            }
            state => Err(illegal("received_inbound", state)),
        }
    }

    /// Terminal step after the executed swap has been reported.
    pub fn complete(&mut self) -> Result<Vec<TradeEvent>, IllegalTransition> {
        match self.state {
            TradeState::Open(OpenTrade::ReceivedInbound) => {
                self.state = TradeState::Completed;
                Ok(vec![])
            }
            state => Err(illegal("complete", state)),
        }
    }

    pub fn timeout(&mut self) -> Result<Vec<TradeEvent>, IllegalTransition> {
        match self.state {
            TradeState::Open(_) => {
                self.state = TradeState::Timeout;
                Ok(vec![])
            }
            state => Err(illegal("timeout", state)),
        }
    }
}

fn illegal(trigger: &'static str, state: impl fmt::Display) -> IllegalTransition {
    IllegalTransition {
        trigger,
        state: state.to_string(),
    }
}

/// A limit order owned by this node, together with the trades filling it.
///
/// Take flows spawned by the matching engine run under the maker's order id
/// and point back at the user's order through `parent`.
#[derive(Debug, Clone)]
pub struct LimitOrder {
    pub order_id: OrderId,
    pub kind: OrderKind,
    pub amount: TokenAmount,
    pub price: Price,
    pub timeout_date: Timestamp,
    pub role: Role,
    pub parent: Option<OrderId>,
    pub commitment_proof: Option<CommitmentProof>,
    pub cancellation_proof: Option<CancellationProof>,
    state: OrderState,
    trades: HashMap<TradeId, Trade>,
}

impl LimitOrder {
    pub fn new(
        order_id: OrderId,
        kind: OrderKind,
        amount: TokenAmount,
        price: Price,
        timeout_date: Timestamp,
        role: Role,
        parent: Option<OrderId>,
    ) -> Self {
        Self {
            order_id,
            kind,
            amount,
            price,
            timeout_date,
            role,
            parent,
            commitment_proof: None,
            cancellation_proof: None,
            state: OrderState::Open(OpenOrder::Created),
            trades: HashMap::new(),
        }
    }

    pub fn state(&self) -> OrderState {
        self.state
    }

    pub fn is_open(&self) -> bool {
        matches!(self.state, OrderState::Open(_))
    }

    pub fn is_completed(&self) -> bool {
        self.state == OrderState::Completed
    }

    pub fn is_canceled(&self) -> bool {
        self.state == OrderState::Canceled
    }

    pub fn trades(&self) -> impl Iterator<Item = &Trade> {
        self.trades.values()
    }

    pub fn trade_mut(&mut self, trade_id: &TradeId) -> Option<&mut Trade> {
        self.trades.get_mut(trade_id)
    }

    pub fn open_trade_mut(&mut self) -> Option<&mut Trade> {
        self.trades.values_mut().find(|trade| trade.is_open())
    }

    pub fn add_trade(&mut self, trade: Trade) {
        self.trades.insert(trade.trade_id, trade);
    }

    pub fn amount_traded(&self) -> TokenAmount {
        self.trades
            .values()
            .filter(|trade| trade.is_completed())
            .map(|trade| trade.amount)
            .sum()
    }

    /// Amount not yet claimed by any live or completed trade.
    pub fn remaining(&self) -> TokenAmount {
        let reserved: TokenAmount = self
            .trades
            .values()
            .filter(|trade| trade.state() != TradeState::Timeout)
            .map(|trade| trade.amount)
            .sum();

        self.amount.saturating_sub(reserved)
    }

    pub fn is_filled(&self) -> bool {
        self.amount_traded() == self.amount
    }

    pub fn initiate(&mut self) -> Result<Vec<OrderEvent>, IllegalTransition> {
        match self.state {
            OrderState::Open(OpenOrder::Created) => {
                self.state = OrderState::Open(OpenOrder::Unproved);
                Ok(vec![OrderEvent::Commit])
            }
            state => Err(illegal("initiate", state)),
        }
    }

    pub fn receive_commitment_proof(
        &mut self,
        proof: CommitmentProof,
    ) -> Result<Vec<OrderEvent>, IllegalTransition> {
        match self.state {
            OrderState::Open(OpenOrder::Unproved) => {
                self.commitment_proof = Some(proof);
                self.state = OrderState::Open(OpenOrder::Proved);
                Ok(vec![])
            }
            state => Err(illegal("receive_commitment_proof", state)),
        }
    }

    /// The fee deposit did not go through; stay unproved and commit again.
    pub fn payment_failed(&mut self) -> Result<Vec<OrderEvent>, IllegalTransition> {
        match self.state {
            OrderState::Open(OpenOrder::Unproved) => Ok(vec![OrderEvent::Commit]),
            state => Err(illegal("payment_failed", state)),
        }
    }

    /// The proven order is visible on the market, either because our own
    /// broadcast came back or because the match already names a counterparty.
    pub fn received_offer(&mut self) -> Result<Vec<OrderEvent>, IllegalTransition> {
        match self.state {
            OrderState::Open(OpenOrder::Proved) => {
                self.state = OrderState::Open(OpenOrder::Published);
                Ok(vec![OrderEvent::AwaitTaker])
            }
            state => Err(illegal("received_offer", state)),
        }
    }

    pub fn timeout(&mut self) -> Result<Vec<OrderEvent>, IllegalTransition> {
        match self.state {
            OrderState::Open(_) => {
                self.state = OrderState::Open(OpenOrder::CancellationRequested);
                Ok(vec![OrderEvent::RequestCancellation])
            }
            state => Err(illegal("timeout", state)),
        }
    }

    pub fn receive_cancellation_proof(
        &mut self,
        proof: CancellationProof,
    ) -> Result<Vec<OrderEvent>, IllegalTransition> {
        match self.state {
            OrderState::Open(_) => {
                self.cancellation_proof = Some(proof);
                self.state = OrderState::Canceled;
                Ok(vec![])
            }
            state => Err(illegal("receive_cancellation_proof", state)),
        }
    }

    /// A trade filled part of the order; completes the order once the filled
    /// amounts add up.
    pub fn received_inbound(&mut self) -> Result<Vec<OrderEvent>, IllegalTransition> {
        match self.state {
            OrderState::Open(OpenOrder::Published) => {
                if self.is_filled() {
                    self.state = OrderState::Completed;
                }
                Ok(vec![])
            }
            state => Err(illegal("received_inbound", state)),
        }
    }

    /// Folds the completed trade of a finished take flow into this (parent)
    /// order. Unlike `received_inbound` this also applies to orders that were
    /// never published because they matched in full locally.
    pub fn absorb_child_trade(&mut self, trade: Trade) {
        self.trades.insert(trade.trade_id, trade);

        if self.is_open() && self.is_filled() {
            self.state = OrderState::Completed;
        }
    }
}
