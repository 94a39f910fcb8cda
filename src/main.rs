use anyhow::Result;
use clap::Parser;
use dotward::{Forwarder, ForwarderConfig};
use std::net::SocketAddr;
use tracing::{info, Level};

/// Caching DNS forwarder that upgrades plain DNS to DNS over TLS
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Address to serve DNS on, bound on both UDP and TCP
    #[arg(short, long, default_value = "0.0.0.0:53")]
    listen: SocketAddr,

    /// Upstream server, repeatable; `host:port` or `servername:port@ip[:port]`
    #[arg(short, long = "upstream")]
    upstreams: Vec<String>,

    /// Cache capacity: 0 for the default (65536), negative to disable
    #[arg(long, default_value_t = 0)]
    cache_size: i64,

    /// Serve JSON debug stats over HTTP on this address
    #[arg(long)]
    debug_listen: Option<SocketAddr>,

    /// Increase log verbosity (-v debug, -vv trace)
    #[arg(short, action = clap::ArgAction::Count)]
    verbose: u8,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let level = match args.verbose {
        0 => Level::INFO,
        1 => Level::DEBUG,
        _ => Level::TRACE,
    };
    let subscriber = tracing_subscriber::fmt().with_max_level(level).finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let config = ForwarderConfig::from_cli(
        args.listen,
        &args.upstreams,
        args.cache_size,
        args.debug_listen,
    )?;
    let forwarder = Forwarder::new(config)?;
    let shutdown = forwarder.shutdown_handle();

    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupt received, shutting down");
            let _ = shutdown.send(());
        }
    });

    forwarder.run().await?;
    Ok(())
}
