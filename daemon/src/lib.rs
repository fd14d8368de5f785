use crate::keypair::{Address, Keypair};
use crate::model::{FeeRate, OrderId, OrderKind, Price, TokenAmount, TokenPair};
use crate::node_engine::{BookEntrySnapshot, CompletedSwap, Engine, OrderSnapshot};
use crate::state_change::StateChange;
use crate::tasks::Tasks;
use crate::trader::Trader;
use crate::transport::{MessageBroker, BROADCAST_TOPIC};
use crate::wire::Envelope;
use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};

pub mod commitment_service;
pub mod cs_client;
pub mod keypair;
pub mod logger;
pub mod matching;
pub mod model;
pub mod node_engine;
pub mod order_book;
pub mod state_change;
pub mod tasks;
pub mod timeouts;
pub mod trader;
pub mod transport;
pub mod wire;

/// Margin subtracted from remote order deadlines to absorb clock skew.
pub const OFFER_THRESHOLD_TIME: Duration = Duration::from_secs(10);

/// Lifetime of an order when the caller does not pick one.
pub const DEFAULT_ORDER_LIFETIME: Duration = Duration::from_secs(60);

/// Fee-token units deposited per commitment.
pub const DEFAULT_COMMITMENT_AMOUNT: TokenAmount = 1;

/// A running trading node: engine, commitment-service client, transport
/// pumps and the channel-client receipt pump, all tied to one task set.
pub struct NodeSystem {
    address: Address,
    engine: mpsc::Sender<StateChange>,
    pub orders_feed: watch::Receiver<Vec<OrderSnapshot>>,
    pub history_feed: watch::Receiver<Vec<CompletedSwap>>,
    pub book_feed: watch::Receiver<Vec<BookEntrySnapshot>>,
    _tasks: Tasks,
}

impl NodeSystem {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        keypair: Keypair,
        market: TokenPair,
        service_address: Address,
        commitment_token: Address,
        commitment_amount: TokenAmount,
        offer_lifetime: Duration,
        broker: Arc<dyn MessageBroker>,
        trader: Arc<dyn Trader>,
    ) -> Self {
        let address = keypair.address();

        let (engine_tx, engine_rx) = mpsc::channel(256);
        let (service_tx, service_rx) = mpsc::channel(64);
        let (outbound_tx, outbound_rx) = mpsc::channel(256);
        let (orders_feed_tx, orders_feed) = watch::channel(Vec::new());
        let (history_feed_tx, history_feed) = watch::channel(Vec::new());
        let (book_feed_tx, book_feed) = watch::channel(Vec::new());

        let own_topic = broker.listen_on(&address.topic());
        let broadcast_topic = broker.listen_on(BROADCAST_TOPIC);
        let mut receipts = trader.subscribe_receipts();

        let engine = Engine::new(
            keypair.clone(),
            market,
            service_address,
            commitment_amount,
            offer_lifetime,
            service_tx,
            outbound_tx.clone(),
            trader.clone(),
            engine_tx.clone(),
            orders_feed_tx,
            history_feed_tx,
            book_feed_tx,
        );

        let service_client = cs_client::Actor::new(
            keypair,
            service_address,
            commitment_token,
            trader,
            outbound_tx,
            engine_tx.clone(),
        );

        let mut tasks = Tasks::default();
        tasks.add(engine.run(engine_rx));
        tasks.add(service_client.run(service_rx));
        tasks.add(transport::run_sender(broker, outbound_rx));
        tasks.add(transport::run_node_listener(
            own_topic,
            broadcast_topic,
            market,
            address,
            service_address,
            engine_tx.clone(),
        ));
        tasks.add({
            let engine = engine_tx.clone();

            async move {
                while let Some(receipt) = receipts.recv().await {
                    if engine
                        .send(StateChange::TransferReceived(receipt))
                        .await
                        .is_err()
                    {
                        break;
                    }
                }
            }
        });

        Self {
            address,
            engine: engine_tx,
            orders_feed,
            history_feed,
            book_feed,
            _tasks: tasks,
        }
    }

    pub fn address(&self) -> Address {
        self.address
    }

    /// Submits a limit order; matching and publication happen inside the
    /// engine, visible through the orders feed.
    pub async fn submit_limit_order(
        &self,
        kind: OrderKind,
        amount: TokenAmount,
        price: Price,
        lifetime: Option<Duration>,
    ) -> Result<()> {
        self.engine
            .send(StateChange::NewLimitOrder {
                kind,
                amount,
                price,
                lifetime,
            })
            .await
            .context("Node engine is gone")
    }

    pub async fn cancel_order(&self, order_id: OrderId) -> Result<()> {
        self.engine
            .send(StateChange::CancelLimitOrder { order_id })
            .await
            .context("Node engine is gone")
    }
}

/// A running commitment service: coordinator, refund worker and pumps.
pub struct CommitmentServiceSystem {
    address: Address,
    _tasks: Tasks,
}

impl CommitmentServiceSystem {
    pub fn new(
        keypair: Keypair,
        fee_rate: FeeRate,
        commitment_token: Address,
        broker: Arc<dyn MessageBroker>,
        trader: Arc<dyn Trader>,
    ) -> Self {
        let address = keypair.address();

        let (command_tx, command_rx) = mpsc::channel(256);
        let (outbound_tx, outbound_rx) = mpsc::channel(256);
        let (refund_tx, refund_rx) = mpsc::channel(64);

        let mut own_topic = broker.listen_on(&address.topic());
        let mut receipts = trader.subscribe_receipts();

        let service = commitment_service::Service::new(
            keypair,
            fee_rate,
            commitment_token,
            outbound_tx,
            refund_tx.clone(),
            command_tx.clone(),
        );
        let refund_worker = commitment_service::refund::RefundWorker::new(
            trader,
            commitment_token,
            fee_rate,
            refund_tx,
        );

        let mut tasks = Tasks::default();
        tasks.add(service.run(command_rx));
        tasks.add(refund_worker.run(refund_rx));
        tasks.add(transport::run_sender(broker, outbound_rx));
        tasks.add({
            let commands = command_tx.clone();

            async move {
                while let Some(line) = own_topic.recv().await {
                    match Envelope::open(&line) {
                        Ok(message) => {
                            if commands
                                .send(commitment_service::Command::Message(message))
                                .await
                                .is_err()
                            {
                                break;
                            }
                        }
                        Err(e) => tracing::warn!("Dropping malformed message: {e:#}"),
                    }
                }
            }
        });
        tasks.add(async move {
            while let Some(receipt) = receipts.recv().await {
                if command_tx
                    .send(commitment_service::Command::Receipt(receipt))
                    .await
                    .is_err()
                {
                    break;
                }
            }
        });

        Self {
            address,
            _tasks: tasks,
        }
    }

    pub fn address(&self) -> Address {
        self.address
    }
}
