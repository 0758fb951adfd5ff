use std::sync::Arc;

use clap::Parser;
use tracing::Level;
use tracing_subscriber::fmt::time::ChronoLocal;

use lanbank::config::ServerConfig;
use lanbank::server::Server;

/// Bank server: binds one UDP port and serves discovery and transfer
/// requests indefinitely.
#[derive(Parser)]
struct Args {
    /// UDP port used for both discovery and transactions (1-65535)
    port: u16,

    #[clap(short, long, default_value_t = false)]
    verbose: bool,

    #[clap(long, default_value_t = false)]
    very_verbose: bool,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let level = match (args.verbose, args.very_verbose) {
        (_, true) => Level::TRACE,
        (true, _) => Level::DEBUG,
        (false, false) => Level::INFO,
    };
    tracing_subscriber::fmt()
        .with_timer(ChronoLocal::new("%Y-%m-%d %H:%M:%S".to_owned()))
        .with_max_level(level)
        .try_init()
        .ok();

    let config = ServerConfig::new(args.port);
    config.validate()?;

    let server = Arc::new(Server::new(config)?);
    server.run()
}
