use std::path::PathBuf;

use anyhow::Result;
use cachet::{Config, Service};
use clap::Parser;
use tracing::info;

#[derive(Parser)]
#[command(name = "cachet")]
#[command(about = "Replicated in-memory key-value cache", long_about = None)]
struct Args {
    /// Address the gossip layer binds.
    #[arg(long, env = "CACHET_ADDR", default_value = "127.0.0.1:9000")]
    addr: String,

    /// Port shared by replication, gRPC and HTTP connections.
    #[arg(long, env = "CACHET_RPC_PORT", default_value = "9200")]
    rpc_port: u16,

    /// Whether this node should bootstrap the cluster.
    #[arg(long, env = "CACHET_BOOTSTRAP")]
    bootstrap: bool,

    /// Gossip addresses of existing members to contact at startup.
    #[arg(long = "join", env = "CACHET_JOIN", value_delimiter = ',')]
    join: Vec<String>,

    /// Where to store raft snapshots.
    #[arg(long, env = "CACHET_DATA_DIR", default_value = "./data")]
    data_dir: PathBuf,

    /// Identifier on the cluster; defaults to the hostname.
    #[arg(long, env = "CACHET_ID")]
    id: Option<String>,

    /// Enable the HTTP server for client communication.
    #[arg(long, env = "CACHET_HTTP")]
    http: bool,

    /// Enable the gRPC server for client communication.
    #[arg(long, env = "CACHET_GRPC")]
    grpc: bool,

    /// Serve reads through the replicated log instead of the local cache.
    #[arg(long, env = "CACHET_STRONG_CONSISTENCY")]
    strong_consistency: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    let args = Args::parse();
    let node_name = args.id.clone().unwrap_or_else(|| {
        std::env::var("HOSTNAME").unwrap_or_else(|_| "cachet".to_string())
    });

    info!("starting cachet v{} as {}", cachet::VERSION, node_name);

    let config = Config {
        data_dir: args.data_dir,
        bind_addr: args.addr,
        rpc_port: args.rpc_port,
        node_name,
        bootstrap: args.bootstrap,
        start_join_addrs: args.join,
        enable_http: args.http,
        enable_rpc: args.grpc,
        strong_consistency: args.strong_consistency,
    };

    let service = Service::new(config).await?;

    shutdown_signal().await;
    info!("received shutdown signal");
    service.close().await?;

    Ok(())
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        let mut term = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("install SIGTERM handler");
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = term.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
