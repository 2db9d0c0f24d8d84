use std::io::Write;

use anyhow::{bail, Result};
use cachet::Client;
use clap::Parser;
use tokio::io::AsyncReadExt;

#[derive(Parser)]
#[command(name = "cachetctl")]
#[command(about = "Client for a cachet cluster", long_about = None)]
struct Args {
    /// RPC address of any node in the cluster.
    #[arg(long, default_value = "localhost:9200")]
    addr: String,

    /// Print the cluster's servers and exit.
    #[arg(long)]
    get_servers: bool,

    /// Key to operate on.
    #[arg(long)]
    key: Option<String>,

    /// Read the key instead of writing it. Writes take the value from stdin.
    #[arg(long)]
    get: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let client = Client::connect(&args.addr).await?;

    if args.get_servers {
        for server in client.get_servers().await? {
            println!(
                "{}\t{}\tleader={}\t{}",
                server.id, server.rpc_addr, server.is_leader, server.vote_status
            );
        }
        return Ok(());
    }

    let Some(key) = args.key else {
        bail!("--key is required");
    };

    if args.get {
        let value = client.get(&key).await?;
        std::io::stdout().write_all(&value)?;
    } else {
        let mut value = Vec::new();
        tokio::io::stdin().read_to_end(&mut value).await?;
        client.set(&key, value).await?;
        eprintln!("set {key}");
    }

    Ok(())
}
