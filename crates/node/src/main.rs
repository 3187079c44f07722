//! TSS Node
//!
//! Participates in threshold ECDSA keygen and keysign sessions. Each node
//! exposes the TSS API on one port and ping/metrics on another; session
//! traffic between nodes runs over a separate P2P port.

use std::net::SocketAddr;
use std::sync::Arc;

use clap::Parser;
use protocols::{KeyShareStore, PreParamsProvider, ReferenceEngineFactory, TcpTransport};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use tss_node::config::Args;
use tss_node::identity::NodeIdentity;
use tss_node::server::{self, NodeComponents, TssServer};

fn init_tracing(json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true);

    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing(args.log_json);

    info!("========================================");
    info!("  TSS Node Starting");
    info!("========================================");

    let identity = match NodeIdentity::from_base64(&args.private_key) {
        Ok(identity) => identity,
        Err(e) => {
            error!("Invalid --private-key: {}", e);
            anyhow::bail!("invalid private key: {}", e);
        }
    };
    let party = identity.party().clone();

    let config = args.tss_config();
    if let Err(e) = config.validate() {
        error!("Invalid timing configuration: {}", e);
        anyhow::bail!(e);
    }
    debug!("Session configuration: {:?}", config);

    info!("Node configuration:");
    info!("  - Party: {}", party);
    info!("  - Home: {:?}", args.home);
    info!("  - TSS port: {}", args.tss_port);
    info!("  - Info port: {}", args.info_port);
    info!("  - P2P port: {} (advertised as {})", args.p2p_port, args.advertised_endpoint());
    info!("  - Static peers: {}", args.peers.len());

    let shutdown = CancellationToken::new();

    let p2p_addr = SocketAddr::from(([0, 0, 0, 0], args.p2p_port));
    let (transport, inbound, _receiver) =
        TcpTransport::bind(p2p_addr, Some(args.advertised_endpoint()), shutdown.clone()).await?;

    let engines = Arc::new(ReferenceEngineFactory);
    let pre_params = Arc::new(PreParamsProvider::new(
        party.clone(),
        Some(args.pre_params_path()),
        engines.clone(),
        config.pre_param_timeout,
    ));
    let _warm_up = pre_params.spawn_warm_up();
    let shares = Arc::new(KeyShareStore::new(&args.home));

    let server = TssServer::start(
        NodeComponents {
            party: party.clone(),
            config,
            transport: Arc::new(transport),
            inbound,
            engines,
            pre_params,
            shares,
        },
        shutdown.clone(),
    );

    for (peer, endpoint) in &args.peers {
        if let Err(e) = server.add_peer(peer.clone(), endpoint.clone()).await {
            warn!("Ignoring peer {}: {}", peer.short(), e);
        }
    }
    server.announce().await;

    let tss_listener = tokio::net::TcpListener::bind(("0.0.0.0", args.tss_port)).await?;
    let info_listener = tokio::net::TcpListener::bind(("0.0.0.0", args.info_port)).await?;

    info!("Endpoints:");
    info!("  POST   /keygen              - Run or join a keygen (TSS port)");
    info!("  POST   /keysign             - Run or join a keysign (TSS port)");
    info!("  GET    /ping                - Liveness (info port)");
    info!("  GET    /status              - Node status (info port)");
    info!("  GET    /metrics             - Protocol metrics (info port)");
    info!("  GET    /peers               - Known peers (info port)");
    info!("  GET    /sessions            - Live and recent sessions (info port)");
    info!("  DELETE /sessions/{{id}}       - Cancel a session (info port)");

    info!("========================================");
    info!("  TSS Node Ready");
    info!("========================================");

    let tss = tokio::spawn(server::serve(
        tss_listener,
        server.tss_routes(),
        shutdown.clone(),
    ));
    let info_api = tokio::spawn(server::serve(
        info_listener,
        server.info_routes(),
        shutdown.clone(),
    ));

    tokio::signal::ctrl_c().await?;
    info!("Shutdown requested");

    server.stop().await;
    shutdown.cancel();
    for (name, handle) in [("tss", tss), ("info", info_api)] {
        match handle.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!("{} server failed: {}", name, e),
            Err(e) => error!("{} server task panicked: {}", name, e),
        }
    }

    info!("TSS Node stopped");
    Ok(())
}
