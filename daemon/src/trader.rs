use crate::keypair::Address;
use crate::model::TokenAmount;
use anyhow::{bail, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

/// An inbound channel transfer observed by the payment-channel client. The
/// identifier ties the transfer to an order or trade.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferReceipt {
    pub initiator: Address,
    pub amount: TokenAmount,
    pub identifier: u64,
}

/// Contract of the payment-channel client: fire-and-confirm transfers plus
/// a stream of inbound receipts. The network client lives outside the core;
/// tests and single-process demos use [`InMemoryTraderHub`].
#[async_trait]
pub trait Trader: Send + Sync {
    /// Transfers `amount` of `token` to `target`, tagged with `identifier`.
    /// Resolves once the channel network confirmed or rejected the transfer.
    async fn transfer(
        &self,
        token: Address,
        target: Address,
        amount: TokenAmount,
        identifier: u64,
    ) -> Result<()>;

    /// The stream of inbound transfers addressed to this client's owner.
    /// Subscribing again replaces the previous stream.
    fn subscribe_receipts(&self) -> mpsc::Receiver<TransferReceipt>;
}

#[derive(Default)]
struct HubInner {
    listeners: HashMap<Address, mpsc::Sender<TransferReceipt>>,
    fail_next: u32,
}

/// A process-local channel network: transfers between registered clients
/// settle instantly and surface as receipts on the target's stream.
#[derive(Clone, Default)]
pub struct InMemoryTraderHub {
    inner: Arc<Mutex<HubInner>>,
}

impl InMemoryTraderHub {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn client(&self, owner: Address) -> InMemoryTrader {
        InMemoryTrader {
            owner,
            inner: self.inner.clone(),
        }
    }

    /// Makes the next `count` transfers fail, for exercising retry paths.
    pub fn fail_next_transfers(&self, count: u32) {
        self.inner.lock().unwrap().fail_next = count;
    }
}

#[derive(Clone)]
pub struct InMemoryTrader {
    owner: Address,
    inner: Arc<Mutex<HubInner>>,
}

#[async_trait]
impl Trader for InMemoryTrader {
    async fn transfer(
        &self,
        _token: Address,
        target: Address,
        amount: TokenAmount,
        identifier: u64,
    ) -> Result<()> {
        let listener = {
            let mut inner = self.inner.lock().unwrap();

            if inner.fail_next > 0 {
                inner.fail_next -= 1;
                bail!("Transfer to {target} rejected");
            }

            inner.listeners.get(&target).cloned()
        };

        if let Some(listener) = listener {
            let receipt = TransferReceipt {
                initiator: self.owner,
                amount,
                identifier,
            };

            // A dropped receiver just means the target went away.
            let _ = listener.send(receipt).await;
        }

        tracing::debug!(%target, amount, identifier, "Transfer settled");

        Ok(())
    }

    fn subscribe_receipts(&self) -> mpsc::Receiver<TransferReceipt> {
        let (sender, receiver) = mpsc::channel(64);

        self.inner.lock().unwrap().listeners.insert(self.owner, sender);

        receiver
    }
}

/// Thin client for a line-delimited JSON channel-network gateway over TCP.
/// The gateway itself lives outside the core; this speaks its frame format:
/// outgoing transfer orders, incoming receipts.
pub struct TcpTrader {
    outgoing: mpsc::Sender<String>,
    listener: Arc<Mutex<Option<mpsc::Sender<TransferReceipt>>>>,
}

#[derive(serde::Serialize)]
struct TransferFrame {
    op: &'static str,
    token: Address,
    target: Address,
    amount: TokenAmount,
    identifier: u64,
}

#[derive(serde::Deserialize)]
struct ReceiptFrame {
    initiator: Address,
    amount: TokenAmount,
    identifier: u64,
}

impl TcpTrader {
    pub async fn connect(address: std::net::SocketAddr) -> Result<Self> {
        use anyhow::Context;
        use futures::{SinkExt, TryStreamExt};
        use tokio_util::codec::{FramedRead, FramedWrite, LinesCodec};

        let stream = tokio::net::TcpStream::connect(&address)
            .await
            .with_context(|| format!("Failed to connect to trader at {address}"))?;
        let (read, write) = stream.into_split();

        let mut reader = FramedRead::new(read, LinesCodec::new());
        let mut writer = FramedWrite::new(write, LinesCodec::new());

        let (outgoing, mut outgoing_rx) = mpsc::channel::<String>(256);
        let listener: Arc<Mutex<Option<mpsc::Sender<TransferReceipt>>>> = Arc::default();

        tokio::spawn(async move {
            while let Some(line) = outgoing_rx.recv().await {
                if let Err(e) = writer.send(line).await {
                    tracing::error!("Failed to write to trader: {e:#}");
                    return;
                }
            }
        });

        tokio::spawn({
            let listener = listener.clone();

            async move {
                loop {
                    match reader.try_next().await {
                        Ok(Some(line)) => match serde_json::from_str::<ReceiptFrame>(&line) {
                            Ok(frame) => {
                                let receipt = TransferReceipt {
                                    initiator: frame.initiator,
                                    amount: frame.amount,
                                    identifier: frame.identifier,
                                };

                                let sender = listener.lock().unwrap().clone();
                                if let Some(sender) = sender {
                                    let _ = sender.try_send(receipt);
                                }
                            }
                            Err(e) => tracing::warn!("Dropping malformed trader frame: {e:#}"),
                        },
                        Ok(None) => {
                            tracing::info!("Trader closed the connection");
                            return;
                        }
                        Err(e) => {
                            tracing::error!("Failed to read from trader: {e:#}");
                            return;
                        }
                    }
                }
            }
        });

        Ok(Self { outgoing, listener })
    }
}

#[async_trait]
impl Trader for TcpTrader {
    async fn transfer(
        &self,
        token: Address,
        target: Address,
        amount: TokenAmount,
        identifier: u64,
    ) -> Result<()> {
        use anyhow::Context;

        let line = serde_json::to_string(&TransferFrame {
            op: "transfer",
            token,
            target,
            amount,
            identifier,
        })?;

        self.outgoing
            .try_send(line)
            .context("Trader write queue is full")
    }

    fn subscribe_receipts(&self) -> mpsc::Receiver<TransferReceipt> {
        let (sender, receiver) = mpsc::channel(64);

        *self.listener.lock().unwrap() = Some(sender);

        receiver
    }
}
