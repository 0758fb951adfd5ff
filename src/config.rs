use std::net::Ipv4Addr;
use std::time::Duration;

use anyhow::bail;

/// Balance assigned to every newly registered client, fixed at server start.
pub const DEFAULT_INITIAL_BALANCE: u32 = 100;

/// Time the client sender waits for an ACK before retransmitting. The
///  discovery retry cadence is the same interval - no backoff.
pub const DEFAULT_ACK_TIMEOUT: Duration = Duration::from_millis(200);

#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// the single UDP port used for both discovery and transactions
    pub port: u16,
    pub initial_balance: u32,
}

impl ServerConfig {
    pub fn new(port: u16) -> ServerConfig {
        ServerConfig {
            port,
            initial_balance: DEFAULT_INITIAL_BALANCE,
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.port == 0 {
            bail!("port must be in range 1-65535");
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub server_port: u16,
    /// direct discovery against this address; broadcast discovery when unset
    pub server_ip: Option<Ipv4Addr>,
    pub ack_timeout: Duration,
}

impl ClientConfig {
    pub fn new(server_port: u16, server_ip: Option<Ipv4Addr>) -> ClientConfig {
        ClientConfig {
            server_port,
            server_ip,
            ack_timeout: DEFAULT_ACK_TIMEOUT,
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.server_port == 0 {
            bail!("server port must be in range 1-65535");
        }
        Ok(())
    }
}
