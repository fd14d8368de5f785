use crate::keypair::Address;
use crate::model::FeeRate;
use crate::trader::{Trader, TransferReceipt};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

const RETRY_BASE_DELAY: Duration = Duration::from_millis(250);
const RETRY_MAX_DELAY: Duration = Duration::from_secs(30);

/// A deposit waiting to be released back to its owner.
#[derive(Debug, Clone)]
pub struct Refund {
    pub receipt: TransferReceipt,
    pub priority: u8,
    pub claim_fee: bool,
    attempts: u32,
}

impl Refund {
    pub fn new(receipt: TransferReceipt, priority: u8, claim_fee: bool) -> Self {
        Self {
            receipt,
            priority,
            claim_fee,
            attempts: 0,
        }
    }

    fn backoff(&self) -> Duration {
        let factor = 2u32.saturating_pow(self.attempts.min(16));

        RETRY_BASE_DELAY.saturating_mul(factor).min(RETRY_MAX_DELAY)
    }
}

/// Releases deposits via the channel network, minus fee where the service
/// earned one. Failed transfers go back to the tail of the queue after an
/// exponential, capped delay; a refund is never given up on.
pub struct RefundWorker {
    trader: Arc<dyn Trader>,
    commitment_token: Address,
    fee_rate: FeeRate,
    requeue: mpsc::Sender<Refund>,
}

impl RefundWorker {
    pub fn new(
        trader: Arc<dyn Trader>,
        commitment_token: Address,
        fee_rate: FeeRate,
        requeue: mpsc::Sender<Refund>,
    ) -> Self {
        Self {
            trader,
            commitment_token,
            fee_rate,
            requeue,
        }
    }

    pub async fn run(self, mut queue: mpsc::Receiver<Refund>) {
        while let Some(refund) = queue.recv().await {
            self.process(refund).await;
        }
    }

    async fn process(&self, mut refund: Refund) {
        let amount = if refund.claim_fee {
            self.fee_rate.apply(refund.receipt.amount)
        } else {
            refund.receipt.amount
        };

        let result = self
            .trader
            .transfer(
                self.commitment_token,
                refund.receipt.initiator,
                amount,
                refund.receipt.identifier,
            )
            .await;

        match result {
            Ok(()) => {
                tracing::info!(
                    to = %refund.receipt.initiator,
                    amount,
                    identifier = refund.receipt.identifier,
                    "Refund settled"
                );
            }
            Err(e) => {
                refund.attempts += 1;
                let delay = refund.backoff();

                tracing::warn!(
                    to = %refund.receipt.initiator,
                    attempts = refund.attempts,
                    ?delay,
                    "Refund failed, requeueing: {e:#}"
                );

                // Requeue after the delay without stalling the queue.
                let requeue = self.requeue.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    let _ = requeue.send(refund).await;
                });
            }
        }
    }
}
