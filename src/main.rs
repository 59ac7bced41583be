//! The session server binary.

use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use ensemble::session::{routable_ip, Server, ServerConfig};

/// Relay server for collaborative live-coding sessions.
#[derive(Debug, Parser)]
#[command(name = "ensemble", version, about)]
struct Args {
    /// Address to listen on.
    #[arg(long, default_value = "0.0.0.0")]
    bind: IpAddr,

    /// Port to listen on.
    #[arg(short, long, default_value_t = 57890)]
    port: u16,

    /// Shared secret peers must present to join.
    #[arg(long, default_value = "")]
    password: String,

    /// Seconds a join barrier may stay open before unresponsive peers
    /// are evicted.
    #[arg(long, default_value_t = 30)]
    barrier_timeout: u64,

    /// Append a timestamped transcript of inbound packets to this file.
    #[arg(long)]
    log_file: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = ServerConfig {
        bind: SocketAddr::new(args.bind, args.port),
        password: args.password,
        barrier_timeout: Duration::from_secs(args.barrier_timeout),
        log_file: args.log_file,
    };
    let server = Server::bind(config).await?;
    let addr = server.local_addr()?;
    info!(%addr, "listening");
    println!("Session running. Tell your peers to join {}:{}", routable_ip(), addr.port());

    server.run().await?;
    return Ok(());
}
