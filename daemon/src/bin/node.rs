use anyhow::{Context, Result};
use clap::Parser;
use paydex::keypair::{Address, Keypair};
use paydex::model::{TokenAmount, TokenPair};
use paydex::trader::TcpTrader;
use paydex::transport::TcpBroker;
use paydex::{logger, NodeSystem, DEFAULT_COMMITMENT_AMOUNT, DEFAULT_ORDER_LIFETIME};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::filter::LevelFilter;

#[derive(Parser)]
struct Opts {
    /// Seed string for the node's secp256k1 identity.
    #[clap(long)]
    privkey_seed: String,

    /// Address of the message broker.
    #[clap(long, default_value = "127.0.0.1:5000")]
    broker: SocketAddr,

    /// Address of the payment-channel gateway.
    #[clap(long, default_value = "127.0.0.1:5001")]
    trader: SocketAddr,

    /// Account address of the commitment service.
    #[clap(long)]
    cs_address: Address,

    /// Token contract of the market's base token.
    #[clap(long)]
    base_token: Address,

    #[clap(long, default_value = "3")]
    base_decimals: u8,

    /// Token contract of the market's quote token.
    #[clap(long)]
    quote_token: Address,

    #[clap(long, default_value = "18")]
    quote_decimals: u8,

    /// Token contract the commitment deposits are paid in.
    #[clap(long)]
    commitment_token: Address,

    /// Fee-token units deposited per commitment.
    #[clap(long, default_value_t = DEFAULT_COMMITMENT_AMOUNT)]
    commitment_amount: TokenAmount,

    /// Seconds until an order times out.
    #[clap(long, default_value_t = DEFAULT_ORDER_LIFETIME.as_secs())]
    offer_lifetime: u64,

    /// Emit logs as JSON.
    #[clap(short, long)]
    json: bool,

    /// One of Error, Warn, Info, Debug, Trace.
    #[clap(short, long, default_value = "debug")]
    log_level: LevelFilter,
}

#[tokio::main]
async fn main() -> Result<()> {
    let opts = Opts::parse();

    logger::init(opts.log_level, opts.json).context("initialize logger")?;

    let keypair = Keypair::from_seed(&opts.privkey_seed)?;
    let market = TokenPair::new(
        opts.base_token,
        opts.base_decimals,
        opts.quote_token,
        opts.quote_decimals,
    )?;

    tracing::info!(address = %keypair.address(), "Starting trading node");

    let broker = Arc::new(TcpBroker::connect(opts.broker).await?);
    let trader = Arc::new(TcpTrader::connect(opts.trader).await?);

    let node = NodeSystem::new(
        keypair,
        market,
        opts.cs_address,
        opts.commitment_token,
        opts.commitment_amount,
        Duration::from_secs(opts.offer_lifetime),
        broker,
        trader,
    );

    tracing::info!(address = %node.address(), "Node is up");

    // The node runs until interrupted; orders come in over the local API of
    // the embedding process (or a driver wired on top of `NodeSystem`).
    tokio::signal::ctrl_c().await?;

    tracing::info!("Shutting down");

    Ok(())
}
