use paydex::keypair::{Address, Keypair};
use paydex::model::order::{OpenOrder, OrderState};
use paydex::model::{FeeRate, OrderId, OrderKind, Price, Timestamp, TokenPair};
use paydex::node_engine::OrderSnapshot;
use paydex::trader::{InMemoryTraderHub, Trader};
use paydex::transport::{InProcessBroker, MessageBroker};
use paydex::wire::{CommitmentMsg, Envelope, Message, Signed, SwapExecutionMsg};
use paydex::{CommitmentServiceSystem, NodeSystem};
use rust_decimal_macros::dec;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};

const TIMEOUT: Duration = Duration::from_secs(5);
const COMMITMENT_AMOUNT: u128 = 10_000;

fn base_token() -> Address {
    Address::from_bytes([0xba; 20])
}

fn quote_token() -> Address {
    Address::from_bytes([0xcc; 20])
}

fn fee_token() -> Address {
    Address::from_bytes([0xfe; 20])
}

fn market() -> TokenPair {
    TokenPair::new(base_token(), 3, quote_token(), 18).unwrap()
}

fn price(value: rust_decimal::Decimal) -> Price {
    Price::new(value).unwrap()
}

struct TestNet {
    broker: Arc<InProcessBroker>,
    hub: InMemoryTraderHub,
    service_address: Address,
    _service: CommitmentServiceSystem,
}

impl TestNet {
    fn start() -> Self {
        let broker = Arc::new(InProcessBroker::new());
        let hub = InMemoryTraderHub::new();
        let service_keypair = Keypair::from_seed("commitment service").unwrap();
        let service_address = service_keypair.address();

        let service = CommitmentServiceSystem::new(
            service_keypair,
            FeeRate::from_ratio(dec!(0.01)).unwrap(),
            fee_token(),
            broker.clone(),
            Arc::new(hub.client(service_address)),
        );

        Self {
            broker,
            hub,
            service_address,
            _service: service,
        }
    }

    fn node(&self, seed: &str) -> NodeSystem {
        let keypair = Keypair::from_seed(seed).unwrap();
        let address = keypair.address();

        NodeSystem::new(
            keypair,
            market(),
            self.service_address,
            fee_token(),
            COMMITMENT_AMOUNT,
            Duration::from_secs(60),
            self.broker.clone(),
            Arc::new(self.hub.client(address)),
        )
    }
}

async fn await_watch<T: Clone>(
    receiver: &mut watch::Receiver<Vec<T>>,
    what: &str,
    pred: impl Fn(&[T]) -> bool,
) -> Vec<T> {
    let result = tokio::time::timeout(TIMEOUT, async {
        loop {
            {
                let value = receiver.borrow();
                if pred(&value) {
                    return value.clone();
                }
            }

            receiver
                .changed()
                .await
                .unwrap_or_else(|_| panic!("feed closed while waiting for {what}"));
        }
    })
    .await;

    result.unwrap_or_else(|_| panic!("timed out waiting for {what}"))
}

async fn await_message<R>(
    receiver: &mut mpsc::Receiver<String>,
    what: &str,
    pred: impl Fn(Message) -> Option<R>,
) -> R {
    let result = tokio::time::timeout(TIMEOUT, async {
        loop {
            let line = receiver.recv().await.expect("topic closed");

            if let Ok(message) = Envelope::open(&line) {
                if let Some(result) = pred(message) {
                    return result;
                }
            }
        }
    })
    .await;

    result.unwrap_or_else(|_| panic!("timed out waiting for {what}"))
}

fn completed(snapshot: &OrderSnapshot) -> bool {
    snapshot.state == OrderState::Completed
}

#[tokio::test(flavor = "multi_thread")]
async fn happy_path_swap_completes_on_both_sides() {
    let net = TestNet::start();
    let maker = net.node("alice");
    let taker = net.node("bob");
    let mut taker_book = taker.book_feed.clone();
    let mut maker_orders = maker.orders_feed.clone();
    let mut taker_orders = taker.orders_feed.clone();
    let mut maker_history = maker.history_feed.clone();

    maker
        .submit_limit_order(OrderKind::Sell, 6000, price(dec!(0.01)), None)
        .await
        .unwrap();

    await_watch(&mut taker_book, "the sell to reach the taker's book", |book| {
        book.iter().any(|entry| entry.base_amount == 6000)
    })
    .await;

    taker
        .submit_limit_order(OrderKind::Buy, 6000, price(dec!(0.01)), None)
        .await
        .unwrap();

    await_watch(&mut maker_orders, "the maker order to complete", |orders| {
        orders.iter().any(completed)
    })
    .await;
    await_watch(&mut taker_orders, "the taker order to complete", |orders| {
        orders
            .iter()
            .any(|order| order.parent.is_none() && completed(order))
    })
    .await;

    // The service broadcasts the completed swap into every trade history.
    await_watch(&mut maker_history, "the swap to hit the history", |history| {
        !history.is_empty()
    })
    .await;
}

#[tokio::test(flavor = "multi_thread")]
async fn unanswered_order_cancels_after_its_lifetime() {
    let net = TestNet::start();
    let maker = net.node("alice");
    let mut orders = maker.orders_feed.clone();

    maker
        .submit_limit_order(
            OrderKind::Sell,
            6000,
            price(dec!(0.01)),
            Some(Duration::from_millis(800)),
        )
        .await
        .unwrap();

    // It gets proved and published first (the watch may already show a
    // later state if the deadline beat us to it)...
    await_watch(&mut orders, "the order to be published", |orders| {
        orders.iter().any(|order| {
            !matches!(
                order.state,
                OrderState::Open(OpenOrder::Created) | OrderState::Open(OpenOrder::Unproved)
            )
        })
    })
    .await;

    // ...then nobody takes it and the cancellation round-trip empties it out.
    await_watch(&mut orders, "the order to cancel", |orders| {
        orders.iter().any(|order| order.state == OrderState::Canceled)
    })
    .await;
}

#[tokio::test(flavor = "multi_thread")]
async fn partial_fill_takes_the_large_entries_and_republishes_the_rest() {
    let net = TestNet::start();
    let first_maker = net.node("alice");
    let second_maker = net.node("bob");
    let taker = net.node("carol");
    let mut taker_book = taker.book_feed.clone();
    let mut taker_orders = taker.orders_feed.clone();
    let mut first_maker_book = first_maker.book_feed.clone();

    first_maker
        .submit_limit_order(OrderKind::Sell, 6000, price(dec!(0.01)), None)
        .await
        .unwrap();
    second_maker
        .submit_limit_order(OrderKind::Sell, 5000, price(dec!(0.01)), None)
        .await
        .unwrap();

    await_watch(&mut taker_book, "both sells to reach the taker", |book| {
        book.len() == 2
    })
    .await;

    taker
        .submit_limit_order(OrderKind::Buy, 12_000, price(dec!(0.01)), None)
        .await
        .unwrap();

    // 6000 and 5000 fill, 1000 is left on the order.
    let orders = await_watch(&mut taker_orders, "both takes to fill", |orders| {
        orders
            .iter()
            .any(|order| order.parent.is_none() && order.amount_traded == 11_000)
    })
    .await;

    let parent = orders
        .iter()
        .find(|order| order.parent.is_none())
        .expect("parent order exists");
    assert!(matches!(parent.state, OrderState::Open(_)));

    // The remainder goes back out as a proven buy order of 1000.
    await_watch(
        &mut first_maker_book,
        "the remainder to be republished",
        |book| {
            book.iter()
                .any(|entry| entry.kind == OrderKind::Buy && entry.base_amount == 1000)
        },
    )
    .await;
}

/// Driver for service-level scenarios: a party that speaks the wire format
/// directly, with its own deposit stream.
struct Party {
    keypair: Keypair,
    broker: Arc<InProcessBroker>,
    hub: InMemoryTraderHub,
    service_address: Address,
    topic: mpsc::Receiver<String>,
    receipts: mpsc::Receiver<paydex::trader::TransferReceipt>,
}

impl Party {
    fn new(net: &TestNet, seed: &str) -> Self {
        let keypair = Keypair::from_seed(seed).unwrap();
        let topic = net.broker.listen_on(&keypair.address().topic());
        let receipts = net.hub.client(keypair.address()).subscribe_receipts();

        Self {
            keypair,
            broker: net.broker.clone(),
            hub: net.hub.clone(),
            service_address: net.service_address,
            topic,
            receipts,
        }
    }

    fn address(&self) -> Address {
        self.keypair.address()
    }

    fn commitment(&self, order_id: OrderId) -> Signed<CommitmentMsg> {
        Signed::new(
            CommitmentMsg {
                order_id,
                order_hash: [7u8; 32],
                timeout: Timestamp::in_the_future(Duration::from_secs(60)),
                amount: COMMITMENT_AMOUNT,
            },
            &self.keypair,
        )
    }

    async fn send(&self, message: Message) {
        self.broker
            .send(&self.service_address.topic(), Envelope::seal(&message))
            .await
            .unwrap();
    }

    async fn commit(&self, order_id: OrderId) {
        self.send(Message::Commitment(self.commitment(order_id))).await;
    }

    async fn deposit(&self, order_id: OrderId) {
        self.hub
            .client(self.address())
            .transfer(
                fee_token(),
                self.service_address,
                COMMITMENT_AMOUNT,
                order_id.to_u32() as u64,
            )
            .await
            .unwrap();
    }

    async fn report_executed(&self, order_id: OrderId) {
        self.send(Message::SwapExecution(Signed::new(
            SwapExecutionMsg {
                offer_id: order_id,
                timestamp: Timestamp::now(),
            },
            &self.keypair,
        )))
        .await;
    }

    async fn await_proof(&mut self, order_id: OrderId) {
        await_message(&mut self.topic, "a commitment proof", |message| match message {
            Message::CommitmentProof(proof) if proof.payload.offer_id == order_id => Some(()),
            _ => None,
        })
        .await;
    }

    async fn await_refund(&mut self, expected_amount: u128) {
        let receipt = tokio::time::timeout(TIMEOUT, self.receipts.recv())
            .await
            .expect("timed out waiting for a refund")
            .unwrap();

        assert_eq!(receipt.initiator, self.service_address);
        assert_eq!(receipt.amount, expected_amount);
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn service_refunds_both_sides_minus_fee_after_both_confirm() {
    let net = TestNet::start();
    let mut broadcast = net.broker.listen_on("broadcast");
    let mut maker = Party::new(&net, "maker");
    let mut taker = Party::new(&net, "taker");
    let order_id = OrderId::new(7);

    maker.commit(order_id).await;
    maker.deposit(order_id).await;
    maker.await_proof(order_id).await;

    taker.commit(order_id).await;

    await_message(&mut broadcast, "the offer-taken broadcast", |message| {
        match message {
            Message::OfferTaken(taken) if taken.payload.offer_id == order_id => Some(()),
            _ => None,
        }
    })
    .await;

    taker.deposit(order_id).await;
    taker.await_proof(order_id).await;

    maker.report_executed(order_id).await;
    taker.report_executed(order_id).await;

    await_message(&mut broadcast, "the swap-completed broadcast", |message| {
        match message {
            Message::SwapCompleted(completed) if completed.payload.offer_id == order_id => Some(()),
            _ => None,
        }
    })
    .await;

    // 1% of 10_000 stays with the service.
    maker.await_refund(9_900).await;
    taker.await_refund(9_900).await;
}

#[tokio::test(flavor = "multi_thread")]
async fn taker_that_never_deposits_leads_to_a_feeless_maker_refund() {
    let net = TestNet::start();
    let mut broadcast = net.broker.listen_on("broadcast");
    let mut maker = Party::new(&net, "maker");
    let taker = Party::new(&net, "taker");
    let order_id = OrderId::new(8);

    // A short swap deadline so the timeout path runs quickly.
    let commitment = Signed::new(
        CommitmentMsg {
            order_id,
            order_hash: [7u8; 32],
            timeout: Timestamp::in_the_future(Duration::from_millis(800)),
            amount: COMMITMENT_AMOUNT,
        },
        &maker.keypair,
    );
    maker.send(Message::Commitment(commitment)).await;
    maker.deposit(order_id).await;
    maker.await_proof(order_id).await;

    taker.commit(order_id).await;

    // The taker never deposits; the swap times out and the maker is made
    // whole without fee.
    maker.await_refund(COMMITMENT_AMOUNT).await;

    // No completion was ever announced.
    tokio::time::sleep(Duration::from_millis(300)).await;
    while let Ok(line) = broadcast.try_recv() {
        if let Ok(Message::SwapCompleted(_)) = Envelope::open(&line) {
            panic!("swap must not complete");
        }
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn cancellation_before_a_match_returns_deposit_and_proof() {
    let net = TestNet::start();
    let mut maker = Party::new(&net, "maker");
    let order_id = OrderId::new(9);

    maker.commit(order_id).await;
    maker.deposit(order_id).await;
    maker.await_proof(order_id).await;

    maker
        .send(Message::Cancellation(Signed::new(
            paydex::wire::CancellationMsg { offer_id: order_id },
            &maker.keypair,
        )))
        .await;

    maker.await_refund(COMMITMENT_AMOUNT).await;
    await_message(&mut maker.topic, "the cancellation proof", |message| {
        match message {
            Message::CancellationProof(proof) if proof.payload.offer_id == order_id => Some(()),
            _ => None,
        }
    })
    .await;
}

#[tokio::test(flavor = "multi_thread")]
async fn execution_reported_before_the_deposit_is_parked() {
    let net = TestNet::start();
    let mut maker = Party::new(&net, "maker");
    let order_id = OrderId::new(10);

    maker.commit(order_id).await;
    // Claim success before any deposit was seen.
    maker.report_executed(order_id).await;

    // No proof may exist yet.
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(maker.topic.try_recv().is_err());

    // Once the deposit lands, the proof comes and the parked execution is
    // applied (observable: a later taker flow would complete the swap).
    maker.deposit(order_id).await;
    maker.await_proof(order_id).await;
}
