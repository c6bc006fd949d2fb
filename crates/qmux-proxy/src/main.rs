//! QMUX proxy daemon.
//!
//! # Usage
//!
//! ```bash
//! # Serve the default abstract socket, root-only
//! qmux-proxy
//!
//! # Allow one extra uid and exit after 30 idle seconds
//! qmux-proxy --allowed-uid 1000 --empty-timeout 30
//! ```

use std::time::Duration;

use clap::Parser;
use qmux_proxy::{ProxyConfig, Server};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// QMUX multiplexing proxy
#[derive(Parser, Debug)]
#[command(name = "qmux-proxy")]
#[command(about = "Share one QMI control channel between processes")]
#[command(version)]
struct Args {
    /// Abstract socket name to listen on
    #[arg(long, default_value = qmux_proxy::DEFAULT_SOCKET_NAME)]
    socket_name: String,

    /// Additional uid allowed to connect (root and the proxy's own uid
    /// are always allowed)
    #[arg(long)]
    allowed_uid: Option<u32>,

    /// Exit after this many seconds with no connected clients
    #[arg(long)]
    empty_timeout: Option<u64>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level));

    tracing_subscriber::registry().with(fmt::layer()).with(filter).init();

    tracing::info!("qmux proxy starting");

    let config = ProxyConfig {
        socket_name: args.socket_name,
        allowed_uid: args.allowed_uid,
        empty_timeout: args.empty_timeout.map(Duration::from_secs),
    };

    let server = match Server::bind(config) {
        Ok(server) => server,
        Err(e) => {
            tracing::error!("startup failed: {e}");
            std::process::exit(e.exit_code());
        },
    };

    if let Err(e) = server.run().await {
        tracing::error!("proxy failed: {e}");
        std::process::exit(e.exit_code());
    }
}
