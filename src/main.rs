use std::net::IpAddr;
use std::time::Duration;

use clap::Parser;
use clap_derive::Parser;
use simp::daemon::config::DaemonConfig;
use simp::daemon::Daemon;
use tracing::Level;

/// SIMP daemon: relays a chat between a local client and one peer daemon
#[derive(Parser)]
struct Args {
    /// IPv4 address to bind both the daemon and the client socket to
    ip: IpAddr,

    #[clap(long, default_value_t = DaemonConfig::DEFAULT_DAEMON_PORT)]
    daemon_port: u16,

    #[clap(long, default_value_t = DaemonConfig::DEFAULT_CLIENT_PORT)]
    client_port: u16,

    /// seconds to wait for a chat message's ACK before re-sending it
    #[clap(long, default_value_t = 5)]
    ack_timeout_secs: u64,

    #[clap(short, long, default_value_t = false)]
    verbose: bool,

    #[clap(long, default_value_t = false)]
    very_verbose: bool,
}

#[tokio::main]
pub async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let level = match (args.verbose, args.very_verbose) {
        (_, true) => Level::TRACE,
        (true, _) => Level::DEBUG,
        (false, false) => Level::INFO,
    };

    tracing_subscriber::fmt()
        .with_max_level(level)
        .try_init()
        .ok();

    let mut config = DaemonConfig::new(args.ip);
    config.daemon_port = args.daemon_port;
    config.client_port = args.client_port;
    config.ack_timeout = Duration::from_secs(args.ack_timeout_secs);

    let daemon = Daemon::bind(config).await?;
    daemon.run().await
}
