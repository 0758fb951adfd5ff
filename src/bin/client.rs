use std::net::Ipv4Addr;

use clap::Parser;
use tracing::Level;
use tracing_subscriber::fmt::time::ChronoLocal;

use lanbank::client::Client;
use lanbank::config::ClientConfig;

/// Bank client: discovers the server, then reads `<destination-ip> <value>`
/// lines from stdin and issues transfers under stop-and-wait.
#[derive(Parser)]
struct Args {
    /// the server's UDP port (1-65535)
    server_port: u16,

    /// discover by direct unicast to this IPv4 address instead of broadcast
    server_ip: Option<Ipv4Addr>,

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

    let config = ClientConfig::new(args.server_port, args.server_ip);
    config.validate()?;

    Client::new(config)?.run()
}
