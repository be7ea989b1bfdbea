use std::{net::IpAddr, time::Duration};

use clap::Parser;

use crate::config::{DEFAULT_PORT, ServerConfig};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Interface the relay listens on.
    #[arg(long, default_value = "0.0.0.0")]
    pub bind_address: IpAddr,

    /// TCP port the relay listens on. Use 0 for an ephemeral port.
    #[arg(long, default_value_t = DEFAULT_PORT)]
    pub bind_port: u16,

    /// Refuse new clients once this many are connected.
    #[arg(long)]
    pub max_connections: Option<usize>,

    /// Milliseconds allowed for delivering one line to one client.
    #[arg(long, default_value_t = 5000)]
    pub write_timeout_ms: u64,
}

impl Cli {
    pub fn into_config(self) -> ServerConfig {
        ServerConfig {
            bind_address: self.bind_address,
            bind_port: self.bind_port,
            max_connections: self.max_connections,
            write_timeout: Duration::from_millis(self.write_timeout_ms),
        }
    }
}
