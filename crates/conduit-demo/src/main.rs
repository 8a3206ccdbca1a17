//! Demo binary: the adder service over the JSON codec.
//!
//! Configuration is loaded from `config.ron` and can be overridden via CLI flags.
//! Run with `cargo run -p conduit-demo` for an in-process server and client.
//! Run with `cargo run -p conduit-demo -- --mode server --port 9000` to serve
//! until Ctrl-C, and `--mode client --port 9000` to dial it.

mod adder;

use std::sync::Arc;

use adder::{AdderMsg, AdderService, run_rounds};
use anyhow::Context;
use clap::{Parser, ValueEnum};
use conduit_codec::{JsonCodec, JsonProtocol};
use conduit_config::{CliArgs, Config};
use conduit_net::{IdGenerator, Session, connect, connect_timeout, listen};
use tokio::net::{TcpListener, TcpStream};
use tracing::info;

type AdderCodec = JsonCodec<TcpStream, AdderMsg>;
type AdderServer = conduit_net::Server<TcpListener, JsonProtocol<AdderMsg>, Arc<AdderService<AdderCodec>>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Mode {
    /// Server and client in one process.
    Toy,
    /// Serve until interrupted.
    Server,
    /// Connect to a running server.
    Client,
}

#[derive(Parser, Debug)]
#[command(name = "conduit-demo", about = "Adder service over conduit sessions")]
struct DemoArgs {
    #[command(flatten)]
    common: CliArgs,

    /// What to run.
    #[arg(long, value_enum, default_value_t = Mode::Toy)]
    mode: Mode,

    /// Number of add requests the client sends.
    #[arg(long, default_value_t = 10)]
    rounds: i64,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = DemoArgs::parse();

    let config_dir = args.common.config_dir();
    let mut config = Config::load_or_create(&config_dir).unwrap_or_else(|e| {
        eprintln!("Failed to load config: {e}, using defaults");
        Config::default()
    });
    config.apply_cli_overrides(&args.common);
    config.validate()?;

    conduit_log::init_logging(Some(&config_dir.join("logs")), &config.log)?;

    let ids = Arc::new(IdGenerator::new());
    match args.mode {
        Mode::Toy => run_toy(&config, &ids, args.rounds).await,
        Mode::Server => run_server(&config, &ids).await,
        Mode::Client => run_client(&config, &ids, args.rounds).await,
    }
}

async fn start_server(config: &Config, ids: &Arc<IdGenerator>) -> anyhow::Result<(Arc<AdderServer>, Arc<AdderService<AdderCodec>>)> {
    let service = Arc::new(AdderService::new());
    let server = listen(
        &config.server.network,
        &config.server.bind_address(),
        JsonProtocol::<AdderMsg>::new(),
        config.server.send_queue_capacity,
        Arc::clone(&service),
    )
    .await
    .with_context(|| format!("listen on {}", config.server.bind_address()))?
    .with_backoff(config.accept.backoff())
    .with_id_generator(Arc::clone(ids));

    let server = Arc::new(server);
    let serving = Arc::clone(&server);
    tokio::spawn(async move {
        if let Err(err) = serving.serve().await {
            tracing::error!(error = %err, "accept loop failed");
        }
    });
    Ok((server, service))
}

async fn dial(config: &Config, address: &str, ids: &IdGenerator) -> anyhow::Result<Arc<Session<AdderCodec>>> {
    let protocol = JsonProtocol::<AdderMsg>::new();
    let network = &config.server.network;
    let capacity = config.client.send_queue_capacity;

    let session = match config.client.connect_timeout() {
        Some(timeout) => connect_timeout(network, address, timeout, &protocol, capacity, ids).await,
        None => connect(network, address, &protocol, capacity, ids).await,
    }
    .with_context(|| format!("connect to {address}"))?;
    Ok(session)
}

async fn run_toy(config: &Config, ids: &Arc<IdGenerator>, rounds: i64) -> anyhow::Result<()> {
    let mut config = config.clone();
    config.server.port = 0;

    let (server, service) = start_server(&config, ids).await?;
    let address = server.local_addr()?.to_string();
    info!(%address, "toy server up");

    let client = dial(&config, &address, ids).await?;
    let sums = run_rounds(&client, rounds).await?;
    info!(?sums, "client finished");

    service.announce("toy run complete").await;
    let _ = client.close().await;
    server.stop().await;
    Ok(())
}

async fn run_server(config: &Config, ids: &Arc<IdGenerator>) -> anyhow::Result<()> {
    let (server, service) = start_server(config, ids).await?;
    info!(address = %server.local_addr()?, "serving, Ctrl-C to stop");

    tokio::signal::ctrl_c().await.context("wait for Ctrl-C")?;
    service.announce("server shutting down").await;
    server.stop().await;
    Ok(())
}

async fn run_client(config: &Config, ids: &Arc<IdGenerator>, rounds: i64) -> anyhow::Result<()> {
    let client = dial(config, &config.server.bind_address(), ids).await?;
    let sums = run_rounds(&client, rounds).await?;
    info!(?sums, "client finished");
    let _ = client.close().await;
    Ok(())
}
