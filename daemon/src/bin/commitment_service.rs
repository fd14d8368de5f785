use anyhow::{Context, Result};
use clap::Parser;
use paydex::keypair::{Address, Keypair};
use paydex::model::FeeRate;
use paydex::trader::TcpTrader;
use paydex::transport::TcpBroker;
use paydex::{logger, CommitmentServiceSystem};
use std::net::SocketAddr;
use std::sync::Arc;
use tracing_subscriber::filter::LevelFilter;

#[derive(Parser)]
struct Opts {
    /// Seed string for the service's secp256k1 identity.
    #[clap(long)]
    privkey_seed: String,

    /// Address of the message broker.
    #[clap(long, default_value = "127.0.0.1:5000")]
    broker: SocketAddr,

    /// Address of the payment-channel gateway.
    #[clap(long, default_value = "127.0.0.1:5001")]
    trader: SocketAddr,

    /// Token contract the commitment deposits are paid in.
    #[clap(long)]
    commitment_token: Address,

    /// Fraction of each deposit kept on successful swaps, e.g. 0.01.
    #[clap(long, default_value = "0.01")]
    fee_rate: FeeRate,

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

    let broker = Arc::new(TcpBroker::connect(opts.broker).await?);
    let trader = Arc::new(TcpTrader::connect(opts.trader).await?);

    let service = CommitmentServiceSystem::new(
        keypair,
        opts.fee_rate,
        opts.commitment_token,
        broker,
        trader,
    );

    tracing::info!(address = %service.address(), "Commitment service is up");

    tokio::signal::ctrl_c().await?;

    tracing::info!("Shutting down");

    Ok(())
}
