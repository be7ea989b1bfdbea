use std::{
    net::{IpAddr, Ipv4Addr, SocketAddr},
    time::Duration,
};

pub const DEFAULT_PORT: u16 = 8888;
pub const DEFAULT_WRITE_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    pub bind_address: IpAddr,
    /// Use 0 for an ephemeral port.
    pub bind_port: u16,
    /// Connections beyond this many are turned away. `None` admits everyone.
    pub max_connections: Option<usize>,
    /// Upper bound on a single line delivery to one client.
    pub write_timeout: Duration,
}

impl ServerConfig {
    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind_address, self.bind_port)
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            bind_port: DEFAULT_PORT,
            max_connections: None,
            write_timeout: DEFAULT_WRITE_TIMEOUT,
        }
    }
}
