use crate::keypair::{Address, Keypair};
use crate::model::{OrderId, Timestamp};
use crate::state_change::StateChange;
use crate::trader::Trader;
use crate::transport::Outbound;
use crate::wire::{CancellationMsg, Commitment, Message, Signed, SwapExecutionMsg};
use std::sync::Arc;
use tokio::sync::mpsc;

/// Work for the commitment-service client.
#[derive(Debug)]
pub enum Command {
    /// Send a signed commitment to the service and back it with the fee
    /// deposit.
    Commit(Commitment),
    /// Tell the service that the swap behind the order went through.
    NotifyExecuted { order_id: OrderId },
    /// Ask the service to cancel the commitment behind the order.
    RequestCancellation { order_id: OrderId },
}

/// Client side of the commitment service: it escorts every commitment with
/// the fee-token deposit and speaks the service's message set.
pub struct Actor {
    keypair: Keypair,
    service_address: Address,
    commitment_token: Address,
    trader: Arc<dyn Trader>,
    outbound: mpsc::Sender<Outbound>,
    engine: mpsc::Sender<StateChange>,
}

impl Actor {
    pub fn new(
        keypair: Keypair,
        service_address: Address,
        commitment_token: Address,
        trader: Arc<dyn Trader>,
        outbound: mpsc::Sender<Outbound>,
        engine: mpsc::Sender<StateChange>,
    ) -> Self {
        Self {
            keypair,
            service_address,
            commitment_token,
            trader,
            outbound,
            engine,
        }
    }

    pub async fn run(self, mut commands: mpsc::Receiver<Command>) {
        while let Some(command) = commands.recv().await {
            match command {
                Command::Commit(commitment) => self.commit(commitment).await,
                Command::NotifyExecuted { order_id } => self.notify_executed(order_id).await,
                Command::RequestCancellation { order_id } => {
                    self.request_cancellation(order_id).await
                }
            }
        }
    }

    async fn commit(&self, commitment: Commitment) {
        let order_id = commitment.payload.order_id;
        let amount = commitment.payload.amount;

        let _ = self
            .outbound
            .send(Outbound::To(
                self.service_address,
                Message::Commitment(commitment),
            ))
            .await;

        let deposited = self
            .trader
            .transfer(
                self.commitment_token,
                self.service_address,
                amount,
                order_id.to_u32() as u64,
            )
            .await;

        match deposited {
            Ok(()) => {
                tracing::debug!(%order_id, amount, "Deposited commitment fee");
            }
            Err(e) => {
                tracing::warn!(%order_id, "Fee deposit failed: {e:#}");
                let _ = self.engine.send(StateChange::PaymentFailed { order_id }).await;
            }
        }
    }

    async fn notify_executed(&self, order_id: OrderId) {
        let execution = Signed::new(
            SwapExecutionMsg {
                offer_id: order_id,
                timestamp: Timestamp::now(),
            },
            &self.keypair,
        );

        let _ = self
            .outbound
            .send(Outbound::To(
                self.service_address,
                Message::SwapExecution(execution),
            ))
            .await;
    }

    async fn request_cancellation(&self, order_id: OrderId) {
        let cancellation = Signed::new(CancellationMsg { offer_id: order_id }, &self.keypair);

        let _ = self
            .outbound
            .send(Outbound::To(
                self.service_address,
                Message::Cancellation(cancellation),
            ))
            .await;
    }
}
