use crate::keypair::{Address, Keypair};
use crate::model::{FeeRate, OrderId, Timestamp, TradeId};
use crate::timeouts::TimeoutScheduler;
use crate::trader::TransferReceipt;
use crate::transport::Outbound;
use crate::wire::{
    CancellationProofMsg, Commitment, CommitmentProofMsg, Message, OfferTakenMsg,
    ServiceAdvertisementMsg, Signed, SwapCompletedMsg,
};
use refund::Refund;
use std::collections::HashMap;
use std::time::Duration;
use swap::{Swap, SwapAction};
use tokio::sync::mpsc;

pub mod refund;
pub mod swap;

/// Work for the commitment-service coordinator.
#[derive(Debug)]
pub enum Command {
    /// A message that arrived on the service's topic.
    Message(Message),
    /// A fee-token deposit observed by the channel client.
    Receipt(TransferReceipt),
    /// The deadline of a swap elapsed.
    SwapTimeout(OrderId),
}

/// The swap coordinator: routes commitments, deposits, confirmations and
/// cancellations into per-order swap machines and executes their actions.
///
/// A single task owns the swap table and the trade arena, so machines never
/// see concurrent triggers.
pub struct Service {
    keypair: Keypair,
    fee_rate: FeeRate,
    commitment_token: Address,
    swaps: HashMap<OrderId, Swap>,
    trades: HashMap<TradeId, swap::Trade>,
    /// Deposits that arrived before the commitment they back.
    pending_receipts: HashMap<OrderId, TransferReceipt>,
    timeouts: TimeoutScheduler<Command>,
    outbound: mpsc::Sender<Outbound>,
    refunds: mpsc::Sender<Refund>,
}

impl Service {
    pub fn new(
        keypair: Keypair,
        fee_rate: FeeRate,
        commitment_token: Address,
        outbound: mpsc::Sender<Outbound>,
        refunds: mpsc::Sender<Refund>,
        self_sender: mpsc::Sender<Command>,
    ) -> Self {
        Self {
            keypair,
            fee_rate,
            commitment_token,
            swaps: HashMap::new(),
            trades: HashMap::new(),
            pending_receipts: HashMap::new(),
            timeouts: TimeoutScheduler::new(self_sender),
            outbound,
            refunds,
        }
    }

    pub async fn run(mut self, mut commands: mpsc::Receiver<Command>) {
        self.advertise().await;

        while let Some(command) = commands.recv().await {
            self.apply(command).await;
        }
    }

    async fn apply(&mut self, command: Command) {
        match command {
            Command::Message(Message::Commitment(commitment)) => {
                self.handle_commitment(commitment).await;
            }
            Command::Message(Message::SwapExecution(execution)) => {
                let Ok(sender) = execution.sender() else {
                    tracing::warn!("Dropping unsigned swap execution");
                    return;
                };
                let order_id = execution.payload.offer_id;

                let Some(swap) = self.swaps.get_mut(&order_id) else {
                    tracing::warn!(%order_id, "Execution for unknown swap");
                    return;
                };
                let actions = swap.handle_execution(sender);
                self.perform(order_id, actions).await;
            }
            Command::Message(Message::Cancellation(cancellation)) => {
                let Ok(sender) = cancellation.sender() else {
                    tracing::warn!("Dropping unsigned cancellation");
                    return;
                };
                let order_id = cancellation.payload.offer_id;

                let Some(swap) = self.swaps.get_mut(&order_id) else {
                    tracing::warn!(%order_id, "Cancellation for unknown swap");
                    return;
                };
                let actions = swap.handle_cancellation(sender);
                self.perform(order_id, actions).await;
            }
            Command::Message(other) => {
                tracing::debug!(message = %other, "Ignoring message not meant for the service");
            }
            Command::Receipt(receipt) => {
                if receipt.identifier > u32::MAX as u64 {
                    tracing::warn!(
                        identifier = receipt.identifier,
                        "Receipt identifier is not an order id"
                    );
                    return;
                }
                let order_id = OrderId::new(receipt.identifier as u32);

                let Some(swap) = self.swaps.get_mut(&order_id) else {
                    // A deposit can overtake the commitment it backs; keep
                    // it until the commitment shows up.
                    tracing::debug!(%order_id, "Deposit before its commitment, deferring");
                    self.pending_receipts.insert(order_id, receipt);
                    return;
                };
                let sender = receipt.initiator;
                let actions = swap.handle_receipt(receipt, sender);
                self.perform(order_id, actions).await;
            }
            Command::SwapTimeout(order_id) => {
                let Some(swap) = self.swaps.get_mut(&order_id) else {
                    return;
                };

                let actions = swap.handle_timeout();
                self.perform(order_id, actions).await;
            }
        }
    }

    async fn handle_commitment(&mut self, commitment: Commitment) {
        let Ok(sender) = commitment.sender() else {
            tracing::warn!("Dropping unsigned commitment");
            return;
        };
        let order_id = commitment.payload.order_id;

        if let Some(swap) = self.swaps.get_mut(&order_id) {
            // Same id again: this is the taker side of the existing swap.
            let actions = swap.handle_taker_commitment(commitment, sender);
            self.perform(order_id, actions).await;
        } else {
            let swap = Swap::new(commitment, sender);

            if let Err(e) = self.timeouts.arm(
                order_id,
                swap.timeout_date(),
                Duration::ZERO,
                Command::SwapTimeout(order_id),
            ) {
                tracing::warn!(%order_id, "Not opening swap: {e}");
                return;
            }

            tracing::info!(%order_id, maker = %swap.maker_address(), "Opened swap");
            self.swaps.insert(order_id, swap);
        }

        if let Some(receipt) = self.pending_receipts.remove(&order_id) {
            if let Some(swap) = self.swaps.get_mut(&order_id) {
                let sender = receipt.initiator;
                let actions = swap.handle_receipt(receipt, sender);
                self.perform(order_id, actions).await;
            }
        }
    }

    async fn perform(&mut self, order_id: OrderId, actions: Vec<SwapAction>) {
        for action in actions {
            match action {
                SwapAction::IssueProof {
                    to,
                    commitment_sig,
                    secret,
                    secret_hash,
                } => {
                    let proof = Signed::new(
                        CommitmentProofMsg {
                            commitment_sig,
                            secret,
                            secret_hash,
                            offer_id: order_id,
                        },
                        &self.keypair,
                    );

                    if let Some(swap) = self.swaps.get_mut(&order_id) {
                        if swap.maker_address() == to {
                            swap.set_maker_proof(proof.clone());
                        }
                    }

                    tracing::info!(%order_id, %to, "Issuing commitment proof");
                    self.outbound
                        .send(Outbound::To(to, Message::CommitmentProof(proof)))
                        .await
                        .ok();
                }
                SwapAction::IssueCancellationProof { to, original } => {
                    let proof = Signed::new(
                        CancellationProofMsg {
                            offer_id: order_id,
                            cancellation_proof: original,
                        },
                        &self.keypair,
                    );

                    tracing::info!(%order_id, %to, "Issuing cancellation proof");
                    self.outbound
                        .send(Outbound::To(to, Message::CancellationProof(proof)))
                        .await
                        .ok();
                }
                SwapAction::RegisterTrade(trade) => {
                    let taken = Signed::new(OfferTakenMsg { offer_id: order_id }, &self.keypair);

                    self.trades.insert(trade.trade_id, trade);
                    self.outbound
                        .send(Outbound::Broadcast(Message::OfferTaken(taken)))
                        .await
                        .ok();
                }
                SwapAction::AnnounceCompleted { timestamp } => {
                    let traded: crate::model::TokenAmount = self
                        .swaps
                        .get(&order_id)
                        .into_iter()
                        .flat_map(|swap| swap.trades())
                        .filter_map(|trade_id| self.trades.get(trade_id))
                        .map(|trade| trade.amount)
                        .sum();

                    tracing::info!(%order_id, traded, "Swap completed");

                    let completed = Signed::new(
                        SwapCompletedMsg {
                            offer_id: order_id,
                            timestamp,
                        },
                        &self.keypair,
                    );

                    self.outbound
                        .send(Outbound::Broadcast(Message::SwapCompleted(completed)))
                        .await
                        .ok();
                }
                SwapAction::Refund { receipt, claim_fee } => {
                    self.refunds
                        .send(Refund::new(receipt, 1, claim_fee))
                        .await
                        .ok();
                }
                SwapAction::Cleanup => self.cleanup(order_id),
            }
        }
    }

    fn cleanup(&mut self, order_id: OrderId) {
        self.timeouts.cancel(order_id);

        if let Some(swap) = self.swaps.remove(&order_id) {
            for trade_id in swap.trades() {
                self.trades.remove(trade_id);
            }

            tracing::info!(%order_id, state = %swap.state(), "Swap closed");
        }
    }

    async fn advertise(&self) {
        let advertisement = Signed::new(
            ServiceAdvertisementMsg {
                address: self.keypair.address(),
                commitment_token: self.commitment_token,
                fee_rate: self.fee_rate.to_raw(),
            },
            &self.keypair,
        );

        self.outbound
            .send(Outbound::Broadcast(Message::ServiceAdvertisement(
                advertisement,
            )))
            .await
            .ok();

        tracing::info!(
            address = %self.keypair.address(),
            timestamp = %Timestamp::now(),
            "Commitment service is up"
        );
    }
}
