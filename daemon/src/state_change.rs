use crate::keypair::Address;
use crate::model::{OrderId, OrderKind, Price, Timestamp, TokenAmount, TradeId};
use crate::order_book::OrderBookEntry;
use crate::trader::TransferReceipt;
use crate::wire::{CancellationProof, CommitmentProof};
use std::time::Duration;

/// The facts the node engine reacts to. All of them are applied by a single
/// task so order and trade machines never see concurrent triggers.
#[derive(Debug)]
pub enum StateChange {
    /// A locally submitted limit order.
    NewLimitOrder {
        kind: OrderKind,
        amount: TokenAmount,
        price: Price,
        lifetime: Option<Duration>,
    },
    /// A local request to cancel one of our orders.
    CancelLimitOrder { order_id: OrderId },
    /// A proven order appeared on the broadcast (possibly our own echo).
    OfferPublished(OrderBookEntry),
    /// The commitment service acknowledged one of our commitments.
    CommitmentProof(CommitmentProof),
    /// The commitment service confirmed a cancellation.
    CancellationProof(CancellationProof),
    /// A pairing materialized; start the asset swap.
    NewTrade(NewTrade),
    /// A deadline we armed has elapsed.
    OrderTimeout {
        order_id: OrderId,
        timeout_date: Timestamp,
    },
    /// The channel client observed an inbound transfer.
    TransferReceived(TransferReceipt),
    /// A fee deposit or channel transfer did not go through.
    PaymentFailed { order_id: OrderId },
    /// The service announced that an order found its taker.
    OfferTaken { order_id: OrderId },
    /// The service announced a fully confirmed swap.
    SwapCompleted {
        order_id: OrderId,
        timestamp: Timestamp,
    },
}

#[derive(Debug)]
pub struct NewTrade {
    pub trade_id: TradeId,
    pub maker_order_id: OrderId,
    pub taker_order_id: OrderId,
    /// `None` means "whatever is left of the order"; the engine resolves it.
    pub amount: Option<TokenAmount>,
    /// `None` lets the engine fall back to the order's own proof.
    pub secret_hash: Option<[u8; 32]>,
    pub counterparty: Address,
}
