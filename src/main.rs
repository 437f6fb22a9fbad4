//! canwire binary: option parsing, worker wiring and signal-driven
//! shutdown.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, ValueEnum};
use tokio::net::UdpSocket;
use tracing_subscriber::EnvFilter;

use canwire::config::{
    load_timeout_table, DebugOptions, TransportMode, TunnelConfig, DEFAULT_LINK_MTU,
    DEFAULT_TIMEOUT_US,
};
use canwire::error::{CanwireError, Result};
use canwire::transport::{
    CanSocket, SctpClientTransport, SctpServerTransport, TcpClientTransport, TcpServerTransport,
};
use canwire::worker::{can, stream, udp, CanShared, StreamShared, UdpShared, WorkerHandle};

#[derive(Debug, Clone, Copy, ValueEnum)]
enum TransportArg {
    Udp,
    TcpClient,
    TcpServer,
    SctpClient,
    SctpServer,
}

impl From<TransportArg> for TransportMode {
    fn from(arg: TransportArg) -> Self {
        match arg {
            TransportArg::Udp => TransportMode::Udp,
            TransportArg::TcpClient => TransportMode::TcpClient,
            TransportArg::TcpServer => TransportMode::TcpServer,
            TransportArg::SctpClient => TransportMode::SctpClient,
            TransportArg::SctpServer => TransportMode::SctpServer,
        }
    }
}

#[derive(Parser, Debug)]
#[command(
    name = "canwire",
    version,
    about = "SocketCAN over IP tunnel (UDP, TCP, SCTP)"
)]
struct Cli {
    /// CAN interface to bridge.
    #[arg(short = 'I', long, default_value = "can0")]
    interface: String,

    /// Local bind address and port.
    #[arg(short = 'L', long, default_value = "0.0.0.0:20000")]
    local: SocketAddr,

    /// Remote address and port. Required for client transports and for
    /// UDP unless --bind-to-first is set.
    #[arg(short = 'R', long)]
    remote: Option<SocketAddr>,

    /// Wire carrier.
    #[arg(short = 'S', long, value_enum, default_value_t = TransportArg::Udp)]
    transport: TransportArg,

    /// Default buffer flush timeout in microseconds.
    #[arg(short = 't', long, default_value_t = DEFAULT_TIMEOUT_US)]
    timeout: u64,

    /// CSV file with per-identifier flush deadlines (id,timeout_us).
    #[arg(short = 'T', long)]
    timeout_table: Option<PathBuf>,

    /// Sort each outbound packet by CAN identifier.
    #[arg(short = 's', long)]
    sort: bool,

    /// Accept traffic from any address, not just the configured remote.
    #[arg(short = 'p', long)]
    no_peer_check: bool,

    /// UDP: adopt the first sender as the remote peer.
    #[arg(long)]
    bind_to_first: bool,

    /// Seconds of inactivity after which a first-sender binding is
    /// cleared.
    #[arg(long, default_value_t = 60)]
    first_sender_window: u64,

    /// Link MTU the packet payload size is derived from.
    #[arg(short = 'm', long, default_value_t = DEFAULT_LINK_MTU)]
    mtu: usize,

    /// Frame pool cap per direction; 0 grows without bound.
    #[arg(long, default_value_t = 0)]
    pool_cap: usize,

    /// Comma-separated debug channels: can, net, buffer, timer.
    #[arg(short = 'd', long, default_value = "")]
    debug: String,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    if let Err(e) = run().await {
        tracing::error!("{e}");
        std::process::exit(1);
    }
}

async fn run() -> Result<()> {
    let cli = Cli::parse();

    let debug = DebugOptions::parse(&cli.debug)?;
    let timeout_table = match &cli.timeout_table {
        Some(path) => load_timeout_table(path)?,
        None => Default::default(),
    };

    let config = TunnelConfig {
        interface: cli.interface.clone(),
        local: cli.local,
        remote: cli.remote,
        mode: cli.transport.into(),
        default_timeout: Duration::from_micros(cli.timeout),
        timeout_table,
        sort: cli.sort,
        check_peer: !cli.no_peer_check,
        bind_to_first: cli.bind_to_first,
        first_sender_window: Duration::from_secs(cli.first_sender_window),
        link_mtu: cli.mtu,
        pool_cap: cli.pool_cap,
        debug,
    };
    config.validate()?;

    let can_socket = CanSocket::open(&config.interface)?;
    let can_shared = Arc::new(CanShared::new(&config));

    let net_handle = start_net_worker(&config, can_shared.clone()).await?;
    let can_handle = can::start(can_shared, can_socket);

    wait_for_shutdown().await?;

    net_handle.stop();
    can_handle.stop();
    net_handle.join().await;
    can_handle.join().await;
    Ok(())
}

/// Build the network worker for the selected transport and wire it to the
/// CAN worker.
async fn start_net_worker(config: &TunnelConfig, can_shared: Arc<CanShared>) -> Result<WorkerHandle> {
    let expected_peer = if config.check_peer {
        config.remote.map(|addr| addr.ip())
    } else {
        None
    };

    match config.mode {
        TransportMode::Udp => {
            let socket = UdpSocket::bind(config.local).await?;
            let net_shared = Arc::new(UdpShared::new(config));
            can_shared.set_peer(net_shared.clone());
            net_shared.set_peer(can_shared);
            Ok(udp::start(net_shared, socket))
        }
        TransportMode::TcpClient => {
            let remote = required_remote(config)?;
            let net_shared = Arc::new(StreamShared::new(config));
            can_shared.set_peer(net_shared.clone());
            net_shared.set_peer(can_shared);
            Ok(stream::start(net_shared, TcpClientTransport::new(remote)))
        }
        TransportMode::TcpServer => {
            let transport = TcpServerTransport::bind(config.local, expected_peer).await?;
            let net_shared = Arc::new(StreamShared::new(config));
            can_shared.set_peer(net_shared.clone());
            net_shared.set_peer(can_shared);
            Ok(stream::start(net_shared, transport))
        }
        TransportMode::SctpClient => {
            let remote = required_remote(config)?;
            let net_shared = Arc::new(StreamShared::new(config));
            can_shared.set_peer(net_shared.clone());
            net_shared.set_peer(can_shared);
            Ok(stream::start(net_shared, SctpClientTransport::new(remote)))
        }
        TransportMode::SctpServer => {
            let transport = SctpServerTransport::bind(config.local, expected_peer)?;
            let net_shared = Arc::new(StreamShared::new(config));
            can_shared.set_peer(net_shared.clone());
            net_shared.set_peer(can_shared);
            Ok(stream::start(net_shared, transport))
        }
    }
}

fn required_remote(config: &TunnelConfig) -> Result<SocketAddr> {
    config
        .remote
        .ok_or_else(|| CanwireError::Config("remote address required".into()))
}

async fn wait_for_shutdown() -> Result<()> {
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
    tokio::select! {
        _ = tokio::signal::ctrl_c() => tracing::info!("received SIGINT, exiting"),
        _ = sigterm.recv() => tracing::info!("received SIGTERM, exiting"),
    }
    Ok(())
}
