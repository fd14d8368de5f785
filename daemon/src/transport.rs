use crate::keypair::Address;
use crate::model::{TokenPair, TradeId};
use crate::order_book::OrderBookEntry;
use crate::state_change::{NewTrade, StateChange};
use crate::wire::{Envelope, Message};
use anyhow::{Context, Result};
use async_trait::async_trait;
use futures::{SinkExt, TryStreamExt};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_util::codec::{FramedRead, FramedWrite, LinesCodec};

/// The topic everyone listens on next to their own address topic.
pub const BROADCAST_TOPIC: &str = "broadcast";

/// Contract of the publish/subscribe bus. Topics are address strings plus
/// the broadcast topic; payloads are sealed envelopes.
#[async_trait]
pub trait MessageBroker: Send + Sync {
    async fn send(&self, topic: &str, data: String) -> Result<()>;

    async fn broadcast(&self, data: String) -> Result<()>;

    /// Subscribes to a topic. Messages arrive in broker-publish order.
    fn listen_on(&self, topic: &str) -> mpsc::Receiver<String>;
}

type Subscriptions = Arc<Mutex<HashMap<String, Vec<mpsc::Sender<String>>>>>;

fn dispatch(subscriptions: &Subscriptions, topic: &str, data: &str) {
    let listeners = {
        let mut subscriptions = subscriptions.lock().unwrap();

        let Some(listeners) = subscriptions.get_mut(topic) else {
            return;
        };
        listeners.retain(|listener| !listener.is_closed());

        listeners.clone()
    };

    for listener in listeners {
        // A full queue drops the message; the bus gives no delivery
        // guarantee beyond per-topic ordering.
        let _ = listener.try_send(data.to_owned());
    }
}

/// A process-local bus for tests and single-process setups.
#[derive(Clone, Default)]
pub struct InProcessBroker {
    subscriptions: Subscriptions,
}

impl InProcessBroker {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl MessageBroker for InProcessBroker {
    async fn send(&self, topic: &str, data: String) -> Result<()> {
        dispatch(&self.subscriptions, topic, &data);

        Ok(())
    }

    async fn broadcast(&self, data: String) -> Result<()> {
        self.send(BROADCAST_TOPIC, data).await
    }

    fn listen_on(&self, topic: &str) -> mpsc::Receiver<String> {
        let (sender, receiver) = mpsc::channel(256);

        self.subscriptions
            .lock()
            .unwrap()
            .entry(topic.to_owned())
            .or_default()
            .push(sender);

        receiver
    }
}

#[derive(Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
enum BrokerFrame {
    Subscribe { topic: String },
    Publish { topic: String, payload: String },
}

/// Thin client for a line-delimited JSON broker over TCP. The broker itself
/// is an external collaborator; this only speaks its frame format.
pub struct TcpBroker {
    outgoing: mpsc::Sender<String>,
    subscriptions: Subscriptions,
}

impl TcpBroker {
    /// Connects and spawns the read/write pumps onto the runtime.
    pub async fn connect(address: SocketAddr) -> Result<Self> {
        let stream = TcpStream::connect(&address)
            .await
            .with_context(|| format!("Failed to connect to broker at {address}"))?;
        let (read, write) = stream.into_split();

        let mut reader = FramedRead::new(read, LinesCodec::new());
        let mut writer = FramedWrite::new(write, LinesCodec::new());

        let (outgoing, mut outgoing_rx) = mpsc::channel::<String>(256);
        let subscriptions: Subscriptions = Arc::default();

        tokio::spawn(async move {
            while let Some(line) = outgoing_rx.recv().await {
                if let Err(e) = writer.send(line).await {
                    tracing::error!("Failed to write to broker: {e:#}");
                    return;
                }
            }
        });

        tokio::spawn({
            let subscriptions = subscriptions.clone();

            async move {
                loop {
                    match reader.try_next().await {
                        Ok(Some(line)) => match serde_json::from_str::<BrokerFrame>(&line) {
                            Ok(BrokerFrame::Publish { topic, payload }) => {
                                dispatch(&subscriptions, &topic, &payload);
                            }
                            Ok(BrokerFrame::Subscribe { .. }) => {
                                tracing::warn!("Ignoring subscribe frame from broker");
                            }
                            Err(e) => {
                                tracing::warn!("Dropping malformed broker frame: {e:#}");
                            }
                        },
                        Ok(None) => {
                            tracing::info!("Broker closed the connection");
                            return;
                        }
                        Err(e) => {
                            tracing::error!("Failed to read from broker: {e:#}");
                            return;
                        }
                    }
                }
            }
        });

        Ok(Self {
            outgoing,
            subscriptions,
        })
    }

    fn frame(&self, frame: &BrokerFrame) -> Result<()> {
        let line = serde_json::to_string(frame)?;

        self.outgoing
            .try_send(line)
            .context("Broker write queue is full")
    }
}

#[async_trait]
impl MessageBroker for TcpBroker {
    async fn send(&self, topic: &str, data: String) -> Result<()> {
        self.frame(&BrokerFrame::Publish {
            topic: topic.to_owned(),
            payload: data,
        })
    }

    async fn broadcast(&self, data: String) -> Result<()> {
        self.send(BROADCAST_TOPIC, data).await
    }

    fn listen_on(&self, topic: &str) -> mpsc::Receiver<String> {
        let (sender, receiver) = mpsc::channel(256);

        self.subscriptions
            .lock()
            .unwrap()
            .entry(topic.to_owned())
            .or_default()
            .push(sender);

        if let Err(e) = self.frame(&BrokerFrame::Subscribe {
            topic: topic.to_owned(),
        }) {
            tracing::error!("Failed to subscribe to {topic}: {e:#}");
        }

        receiver
    }
}

/// An already-signed message on its way out.
#[derive(Debug)]
pub enum Outbound {
    To(Address, Message),
    Broadcast(Message),
}

/// Drains the outbound queue into the broker.
pub async fn run_sender(broker: Arc<dyn MessageBroker>, mut outbound: mpsc::Receiver<Outbound>) {
    while let Some(item) = outbound.recv().await {
        let result = match &item {
            Outbound::To(target, message) => {
                tracing::debug!(%target, %message, "Sending");
                broker.send(&target.topic(), Envelope::seal(message)).await
            }
            Outbound::Broadcast(message) => {
                tracing::debug!(%message, "Broadcasting");
                broker.broadcast(Envelope::seal(message)).await
            }
        };

        if let Err(e) = result {
            tracing::error!("Failed to publish message: {e:#}");
        }
    }
}

/// Turns the node's two inbound topic streams into state changes.
///
/// Everything malformed, unverifiable or addressed at another role is
/// absorbed here with a log line; only facts reach the engine.
pub async fn run_node_listener(
    mut own_topic: mpsc::Receiver<String>,
    mut broadcast_topic: mpsc::Receiver<String>,
    market: TokenPair,
    own_address: Address,
    service_address: Address,
    engine: mpsc::Sender<StateChange>,
) {
    loop {
        let line = tokio::select! {
            Some(line) = own_topic.recv() => line,
            Some(line) = broadcast_topic.recv() => line,
            else => break,
        };

        let message = match Envelope::open(&line) {
            Ok(message) => message,
            Err(e) => {
                tracing::warn!("Dropping malformed message: {e:#}");
                continue;
            }
        };

        let Some(state_change) =
            node_state_change(message, &market, own_address, service_address)
        else {
            continue;
        };

        if engine.send(state_change).await.is_err() {
            break;
        }
    }
}

fn node_state_change(
    message: Message,
    market: &TokenPair,
    own_address: Address,
    service_address: Address,
) -> Option<StateChange> {
    match message {
        Message::ProvenOrder(proven) => {
            if let Err(e) = proven.payload.proof.verify(service_address) {
                tracing::warn!("Dropping proven order with a bad proof: {e:#}");
                return None;
            }

            match OrderBookEntry::from_proven_order(&proven, market) {
                Ok(entry) => Some(StateChange::OfferPublished(entry)),
                Err(e) => {
                    tracing::warn!("Dropping unusable proven order: {e:#}");
                    None
                }
            }
        }
        Message::ProvenCommitment(proven) => {
            let payload = &proven.payload;

            if let Err(e) = payload.proof.verify(service_address) {
                tracing::warn!("Dropping proven commitment with a bad proof: {e:#}");
                return None;
            }
            let taker = match payload.commitment.sender() {
                Ok(taker) => taker,
                Err(e) => {
                    tracing::warn!("Dropping unsigned taker commitment: {e:#}");
                    return None;
                }
            };
            if taker == own_address {
                return None;
            }

            let order_id = payload.commitment.payload.order_id;

            Some(StateChange::NewTrade(NewTrade {
                trade_id: TradeId::random(),
                maker_order_id: order_id,
                taker_order_id: order_id,
                amount: None,
                secret_hash: None,
                counterparty: taker,
            }))
        }
        Message::CommitmentProof(proof) => {
            if let Err(e) = proof.verify(service_address) {
                tracing::warn!("Dropping commitment proof with a bad signature: {e:#}");
                return None;
            }

            Some(StateChange::CommitmentProof(proof))
        }
        Message::CancellationProof(proof) => {
            if let Err(e) = proof.verify(service_address) {
                tracing::warn!("Dropping cancellation proof with a bad signature: {e:#}");
                return None;
            }

            Some(StateChange::CancellationProof(proof))
        }
        Message::OfferTaken(taken) => {
            if taken.verify(service_address).is_err() {
                tracing::warn!("Dropping offer-taken not signed by the service");
                return None;
            }

            Some(StateChange::OfferTaken {
                order_id: taken.payload.offer_id,
            })
        }
        Message::SwapCompleted(completed) => {
            if completed.verify(service_address).is_err() {
                tracing::warn!("Dropping swap-completed not signed by the service");
                return None;
            }

            Some(StateChange::SwapCompleted {
                order_id: completed.payload.offer_id,
                timestamp: completed.payload.timestamp,
            })
        }
        Message::ServiceAdvertisement(advertisement) => {
            match advertisement.sender() {
                Ok(sender) => tracing::info!(
                    service = %sender,
                    fee_rate = advertisement.payload.fee_rate,
                    "Commitment service is advertising"
                ),
                Err(e) => tracing::warn!("Dropping unsigned service advertisement: {e:#}"),
            }

            None
        }
        // Commitments, executions and cancellations are addressed at the
        // commitment service, not at nodes.
        Message::Order(_)
        | Message::Commitment(_)
        | Message::SwapExecution(_)
        | Message::Cancellation(_) => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn in_process_broker_routes_by_topic() {
        let broker = InProcessBroker::new();
        let mut on_a = broker.listen_on("a");
        let mut on_broadcast = broker.listen_on(BROADCAST_TOPIC);

        broker.send("a", "direct".to_owned()).await.unwrap();
        broker.broadcast("to everyone".to_owned()).await.unwrap();

        assert_eq!(on_a.recv().await.unwrap(), "direct");
        assert_eq!(on_broadcast.recv().await.unwrap(), "to everyone");
        assert!(on_a.try_recv().is_err());
    }

    #[tokio::test]
    async fn every_subscriber_of_a_topic_sees_the_message() {
        let broker = InProcessBroker::new();
        let mut first = broker.listen_on("t");
        let mut second = broker.listen_on("t");

        broker.send("t", "hello".to_owned()).await.unwrap();

        assert_eq!(first.recv().await.unwrap(), "hello");
        assert_eq!(second.recv().await.unwrap(), "hello");
    }
}
