use crate::keypair::Address;
use crate::model::{OrderId, Secret, Timestamp, TokenAmount, TradeId};
use crate::trader::TransferReceipt;
use crate::wire::{Commitment, CommitmentProof};
use std::fmt;

/// The record binding both sides of a pairing at a specific amount, sharing
/// the hash-lock secret. Lives in the service's trade arena; swaps refer to
/// it by id only.
#[derive(Debug, Clone)]
pub struct Trade {
    pub trade_id: TradeId,
    pub maker_order_id: OrderId,
    pub taker_order_id: OrderId,
    pub amount: TokenAmount,
    pub secret: Secret,
    pub secret_hash: [u8; 32],
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SwapState {
    Initiated,
    ReceivedMakerSuccess,
    ReceivedTakerSuccess,
    Completed,
    Timeout,
}

impl fmt::Display for SwapState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SwapState::Initiated => "initiated",
            SwapState::ReceivedMakerSuccess => "received_maker_success",
            SwapState::ReceivedTakerSuccess => "received_taker_success",
            SwapState::Completed => "completed",
            SwapState::Timeout => "timeout",
        };

        f.write_str(name)
    }
}

/// Side effects requested by a swap transition; the service task performs
/// them (signing, sending, queueing refunds) outside the state machine.
#[derive(Debug)]
pub enum SwapAction {
    /// Sign and send a commitment proof to a committer.
    IssueProof {
        to: Address,
        commitment_sig: crate::keypair::Signature,
        secret: Secret,
        secret_hash: [u8; 32],
    },
    /// Confirm a cancellation to the maker, wrapping its original proof.
    IssueCancellationProof {
        to: Address,
        original: CommitmentProof,
    },
    /// A pairing happened; register the trade and tell the market.
    RegisterTrade(Trade),
    /// Both sides confirmed; tell the market.
    AnnounceCompleted { timestamp: Timestamp },
    /// Release a deposit back to its owner.
    Refund {
        receipt: TransferReceipt,
        claim_fee: bool,
    },
    /// The swap reached a terminal state; drop it and its trades.
    Cleanup,
}

#[derive(Debug)]
struct Party {
    address: Address,
    commitment: Commitment,
    receipt: Option<TransferReceipt>,
    executed: bool,
}

impl Party {
    fn new(address: Address, commitment: Commitment) -> Self {
        Self {
            address,
            commitment,
            receipt: None,
            executed: false,
        }
    }
}

/// One escrowed swap at the commitment service, keyed by the maker's order
/// id. The first commitment for an id opens it as the maker side, the
/// second one joins as the taker.
#[derive(Debug)]
pub struct Swap {
    order_id: OrderId,
    amount: TokenAmount,
    timeout_date: Timestamp,
    maker: Party,
    taker: Option<Party>,
    /// One secret per swap: issued with the first proof, shared by the
    /// trade and the second proof so both sides hold the same hash lock.
    secret: Option<Secret>,
    maker_proof: Option<CommitmentProof>,
    trades: Vec<TradeId>,
    traded_amount: TokenAmount,
    /// Executions that arrived before the sender's deposit receipt.
    deferred_executions: Vec<Address>,
    canceled: bool,
    state: SwapState,
}

impl Swap {
    /// Opens a swap from the first commitment seen for an order id.
    pub fn new(commitment: Commitment, sender: Address) -> Self {
        let payload = &commitment.payload;

        Self {
            order_id: payload.order_id,
            amount: payload.amount,
            timeout_date: payload.timeout,
            maker: Party::new(sender, commitment),
            taker: None,
            secret: None,
            maker_proof: None,
            trades: Vec::new(),
            traded_amount: 0,
            deferred_executions: Vec::new(),
            canceled: false,
            state: SwapState::Initiated,
        }
    }

    pub fn order_id(&self) -> OrderId {
        self.order_id
    }

    pub fn state(&self) -> SwapState {
        self.state
    }

    pub fn timeout_date(&self) -> Timestamp {
        self.timeout_date
    }

    pub fn trades(&self) -> &[TradeId] {
        &self.trades
    }

    pub fn maker_address(&self) -> Address {
        self.maker.address
    }

    pub fn taker_address(&self) -> Option<Address> {
        self.taker.as_ref().map(|party| party.address)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self.state, SwapState::Completed | SwapState::Timeout)
    }

    pub fn amount_left(&self) -> TokenAmount {
        self.amount.saturating_sub(self.traded_amount)
    }

    pub fn is_matchable(&self) -> bool {
        self.amount_left() > 0 && !self.canceled && !self.is_terminal()
    }

    /// Remembers the signed proof sent to the maker; a later cancellation
    /// echoes it back.
    pub fn set_maker_proof(&mut self, proof: CommitmentProof) {
        self.maker_proof = Some(proof);
    }

    fn secret(&mut self) -> Secret {
        *self.secret.get_or_insert_with(Secret::random)
    }

    /// A second commitment for this order id: the taker side. Matching
    /// happens right here; the proof waits for the taker's deposit.
    pub fn handle_taker_commitment(
        &mut self,
        commitment: Commitment,
        sender: Address,
    ) -> Vec<SwapAction> {
        if self.taker.is_some() {
            tracing::warn!(order_id = %self.order_id, "Swap already has a taker, dropping commitment");
            return vec![];
        }
        if !self.is_matchable() {
            tracing::debug!(order_id = %self.order_id, "Swap is not matchable");
            return vec![];
        }

        self.taker = Some(Party::new(sender, commitment));

        let secret = self.secret();
        let trade = Trade {
            trade_id: TradeId::random(),
            maker_order_id: self.order_id,
            taker_order_id: self.order_id,
            amount: self.amount_left(),
            secret,
            secret_hash: secret.hash(),
        };

        self.trades.push(trade.trade_id);
        self.traded_amount += trade.amount;

        tracing::info!(
            order_id = %self.order_id,
            trade_id = %trade.trade_id,
            amount = trade.amount,
            "Matched taker"
        );

        vec![SwapAction::RegisterTrade(trade)]
    }

    /// A fee-token deposit arrived. Issues the proof once the deposit
    /// covers the commitment, then replays any deferred execution.
    pub fn handle_receipt(&mut self, receipt: TransferReceipt, sender: Address) -> Vec<SwapAction> {
        if self.is_terminal() {
            tracing::debug!(order_id = %self.order_id, "Receipt for terminated swap");
            return vec![];
        }

        let party = if sender == self.maker.address {
            &mut self.maker
        } else if let Some(taker) = self.taker.as_mut().filter(|t| t.address == sender) {
            taker
        } else {
            tracing::warn!(order_id = %self.order_id, %sender, "Receipt from an unknown party");
            return vec![];
        };

        if party.receipt.is_some() {
            tracing::debug!(order_id = %self.order_id, "Duplicate receipt");
            return vec![];
        }
        if receipt.amount < party.commitment.payload.amount {
            tracing::warn!(
                order_id = %self.order_id,
                got = receipt.amount,
                want = party.commitment.payload.amount,
                "Deposit does not cover the commitment"
            );
            return vec![];
        }

        let commitment_sig = party.commitment.signature;
        party.receipt = Some(receipt);

        let secret = self.secret();
        let mut actions = vec![SwapAction::IssueProof {
            to: sender,
            commitment_sig,
            secret,
            secret_hash: secret.hash(),
        }];

        if let Some(position) = self
            .deferred_executions
            .iter()
            .position(|address| *address == sender)
        {
            self.deferred_executions.remove(position);
            actions.extend(self.handle_execution(sender));
        }

        actions
    }

    /// A party reports its swap leg as executed. Rejected while the
    /// sender's deposit receipt is missing, per the ordering contract.
    pub fn handle_execution(&mut self, sender: Address) -> Vec<SwapAction> {
        if self.is_terminal() {
            return vec![];
        }

        let is_maker = sender == self.maker.address;
        let party = if is_maker {
            &mut self.maker
        } else if let Some(taker) = self.taker.as_mut().filter(|t| t.address == sender) {
            taker
        } else {
            tracing::warn!(order_id = %self.order_id, %sender, "Execution from an unknown party");
            return vec![];
        };

        if party.receipt.is_none() {
            tracing::debug!(
                order_id = %self.order_id,
                "Execution before deposit receipt, deferring"
            );
            self.deferred_executions.push(sender);
            return vec![];
        }

        party.executed = true;

        let next = match (self.state, is_maker) {
            (SwapState::Initiated, true) => SwapState::ReceivedMakerSuccess,
            (SwapState::Initiated, false) => SwapState::ReceivedTakerSuccess,
            (SwapState::ReceivedMakerSuccess, false) => SwapState::Completed,
            (SwapState::ReceivedTakerSuccess, true) => SwapState::Completed,
            (state, _) => {
                tracing::warn!(order_id = %self.order_id, %state, "Redundant execution");
                return vec![];
            }
        };

        tracing::info!(order_id = %self.order_id, from = %self.state, to = %next, "Swap advanced");
        self.state = next;

        if next != SwapState::Completed {
            return vec![];
        }

        let mut actions = Vec::new();
        for party in [Some(&self.maker), self.taker.as_ref()].into_iter().flatten() {
            if let Some(receipt) = &party.receipt {
                actions.push(SwapAction::Refund {
                    receipt: receipt.clone(),
                    claim_fee: true,
                });
            }
        }
        actions.push(SwapAction::AnnounceCompleted {
            timestamp: Timestamp::now(),
        });
        actions.push(SwapAction::Cleanup);

        actions
    }

    /// Drives the swap to its timeout state: deposits of parties that never
    /// confirmed are returned without fee; a party that confirmed while its
    /// counterpart did not forfeits its deposit. The unmatched maker also
    /// gets the cancellation proof, whether the timeout came from its own
    /// request or from the swap deadline.
    pub fn handle_timeout(&mut self) -> Vec<SwapAction> {
        if self.is_terminal() {
            return vec![];
        }

        tracing::info!(order_id = %self.order_id, from = %self.state, "Swap timed out");
        self.state = SwapState::Timeout;

        let mut actions = Vec::new();
        for party in [Some(&self.maker), self.taker.as_ref()].into_iter().flatten() {
            let Some(receipt) = &party.receipt else {
                continue;
            };

            if party.executed {
                tracing::info!(
                    order_id = %self.order_id,
                    party = %party.address,
                    "Withholding deposit of the confirmed side"
                );
                continue;
            }

            actions.push(SwapAction::Refund {
                receipt: receipt.clone(),
                claim_fee: false,
            });
        }

        if !self.maker.executed && self.trades.is_empty() {
            if let Some(original) = self.maker_proof.clone() {
                actions.push(SwapAction::IssueCancellationProof {
                    to: self.maker.address,
                    original,
                });
            }
        }

        actions.push(SwapAction::Cleanup);

        actions
    }

    /// A maker backs out before a match: same terminal path as a timeout.
    pub fn handle_cancellation(&mut self, sender: Address) -> Vec<SwapAction> {
        if sender != self.maker.address {
            tracing::warn!(order_id = %self.order_id, %sender, "Cancellation not from the maker");
            return vec![];
        }
        if !self.trades.is_empty() {
            tracing::warn!(order_id = %self.order_id, "Cancellation after a match, ignoring");
            return vec![];
        }
        if self.is_terminal() {
            return vec![];
        }

        self.canceled = true;

        self.handle_timeout()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keypair::Keypair;
    use crate::wire::{CommitmentMsg, Signed};
    use std::time::Duration;

    fn commitment(keypair: &Keypair, order_id: u32, amount: TokenAmount) -> Commitment {
        Signed::new(
            CommitmentMsg {
                order_id: OrderId::new(order_id),
                order_hash: [7u8; 32],
                timeout: Timestamp::in_the_future(Duration::from_secs(60)),
                amount,
            },
            keypair,
        )
    }

    fn receipt(from: &Keypair, amount: TokenAmount) -> TransferReceipt {
        TransferReceipt {
            initiator: from.address(),
            amount,
            identifier: 7,
        }
    }

    fn parties() -> (Keypair, Keypair) {
        (
            Keypair::from_seed("maker").unwrap(),
            Keypair::from_seed("taker").unwrap(),
        )
    }

    fn proven_swap(maker: &Keypair) -> (Swap, Secret) {
        let mut swap = Swap::new(commitment(maker, 7, 100), maker.address());
        let actions = swap.handle_receipt(receipt(maker, 100), maker.address());

        let secret = match &actions[..] {
            [SwapAction::IssueProof { secret, .. }] => *secret,
            other => panic!("expected a proof, got {other:?}"),
        };

        (swap, secret)
    }

    #[test]
    fn proof_waits_for_a_covering_deposit() {
        let (maker, _) = parties();
        let mut swap = Swap::new(commitment(&maker, 7, 100), maker.address());

        assert!(swap
            .handle_receipt(receipt(&maker, 99), maker.address())
            .is_empty());

        let actions = swap.handle_receipt(receipt(&maker, 100), maker.address());
        assert!(matches!(&actions[..], [SwapAction::IssueProof { to, .. }] if *to == maker.address()));
    }

    #[test]
    fn taker_and_maker_share_the_secret() {
        let (maker, taker) = parties();
        let (mut swap, maker_secret) = proven_swap(&maker);

        let actions = swap.handle_taker_commitment(commitment(&taker, 7, 100), taker.address());
        let trade_secret = match &actions[..] {
            [SwapAction::RegisterTrade(trade)] => trade.secret,
            other => panic!("expected a trade, got {other:?}"),
        };
        assert_eq!(trade_secret, maker_secret);

        let actions = swap.handle_receipt(receipt(&taker, 100), taker.address());
        match &actions[..] {
            [SwapAction::IssueProof { to, secret, .. }] => {
                assert_eq!(*to, taker.address());
                assert_eq!(*secret, maker_secret);
            }
            other => panic!("expected a proof, got {other:?}"),
        }
    }

    #[test]
    fn a_third_commitment_is_dropped() {
        let (maker, taker) = parties();
        let intruder = Keypair::from_seed("intruder").unwrap();
        let (mut swap, _) = proven_swap(&maker);

        swap.handle_taker_commitment(commitment(&taker, 7, 100), taker.address());

        assert!(swap
            .handle_taker_commitment(commitment(&intruder, 7, 100), intruder.address())
            .is_empty());
    }

    #[test]
    fn both_executions_complete_the_swap_with_fee_refunds() {
        let (maker, taker) = parties();
        let (mut swap, _) = proven_swap(&maker);
        swap.handle_taker_commitment(commitment(&taker, 7, 100), taker.address());
        swap.handle_receipt(receipt(&taker, 100), taker.address());

        assert!(swap.handle_execution(maker.address()).is_empty());
        assert_eq!(swap.state(), SwapState::ReceivedMakerSuccess);

        let actions = swap.handle_execution(taker.address());
        assert_eq!(swap.state(), SwapState::Completed);

        let refunds: Vec<_> = actions
            .iter()
            .filter_map(|action| match action {
                SwapAction::Refund { receipt, claim_fee } => Some((receipt.initiator, *claim_fee)),
                _ => None,
            })
            .collect();
        assert_eq!(
            refunds,
            vec![(maker.address(), true), (taker.address(), true)]
        );
        assert!(actions
            .iter()
            .any(|action| matches!(action, SwapAction::AnnounceCompleted { .. })));
        assert!(actions.iter().any(|action| matches!(action, SwapAction::Cleanup)));
    }

    #[test]
    fn execution_before_receipt_is_deferred() {
        let (maker, taker) = parties();
        let (mut swap, _) = proven_swap(&maker);
        swap.handle_taker_commitment(commitment(&taker, 7, 100), taker.address());

        // The taker reports success before its deposit is seen.
        assert!(swap.handle_execution(taker.address()).is_empty());
        assert_eq!(swap.state(), SwapState::Initiated);

        let actions = swap.handle_receipt(receipt(&taker, 100), taker.address());
        assert_eq!(swap.state(), SwapState::ReceivedTakerSuccess);
        assert!(matches!(&actions[0], SwapAction::IssueProof { .. }));
    }

    #[test]
    fn timeout_refunds_the_silent_side_without_fee_and_punishes_the_confirmed_one() {
        let (maker, taker) = parties();
        let (mut swap, _) = proven_swap(&maker);
        swap.handle_taker_commitment(commitment(&taker, 7, 100), taker.address());
        swap.handle_receipt(receipt(&taker, 100), taker.address());
        swap.handle_execution(maker.address());

        let actions = swap.handle_timeout();
        assert_eq!(swap.state(), SwapState::Timeout);

        let refunds: Vec<_> = actions
            .iter()
            .filter_map(|action| match action {
                SwapAction::Refund { receipt, claim_fee } => Some((receipt.initiator, *claim_fee)),
                _ => None,
            })
            .collect();
        // The maker confirmed but the taker never did: the maker's deposit
        // is withheld, the taker is made whole without fee.
        assert_eq!(refunds, vec![(taker.address(), false)]);
    }

    #[test]
    fn timeout_without_any_execution_refunds_every_deposit() {
        let (maker, _) = parties();
        let (mut swap, _) = proven_swap(&maker);

        let actions = swap.handle_timeout();

        let refunds: Vec<_> = actions
            .iter()
            .filter_map(|action| match action {
                SwapAction::Refund { receipt, claim_fee } => Some((receipt.initiator, *claim_fee)),
                _ => None,
            })
            .collect();
        assert_eq!(refunds, vec![(maker.address(), false)]);
    }

    #[test]
    fn cancellation_before_match_returns_the_proof() {
        let (maker, _) = parties();
        let (mut swap, _) = proven_swap(&maker);
        let proof = crate::wire::test_support::dummy_commitment_proof();
        swap.set_maker_proof(proof.clone());

        let actions = swap.handle_cancellation(maker.address());

        assert_eq!(swap.state(), SwapState::Timeout);
        assert!(actions.iter().any(|action| matches!(
            action,
            SwapAction::Refund { claim_fee: false, .. }
        )));
        assert!(actions.iter().any(|action| matches!(
            action,
            SwapAction::IssueCancellationProof { original, .. } if *original == proof
        )));
    }

    #[test]
    fn cancellation_after_match_is_ignored() {
        let (maker, taker) = parties();
        let (mut swap, _) = proven_swap(&maker);
        swap.handle_taker_commitment(commitment(&taker, 7, 100), taker.address());

        assert!(swap.handle_cancellation(maker.address()).is_empty());
        assert_eq!(swap.state(), SwapState::Initiated);
    }

    #[test]
    fn matched_swap_has_nothing_left() {
        let (maker, taker) = parties();
        let (mut swap, _) = proven_swap(&maker);

        assert_eq!(swap.amount_left(), 100);
        swap.handle_taker_commitment(commitment(&taker, 7, 100), taker.address());
        assert_eq!(swap.amount_left(), 0);
        assert!(!swap.is_matchable());
    }
}
