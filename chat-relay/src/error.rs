use std::{io, net::SocketAddr};

use thiserror::Error;

/// Failures that end the relay as a whole.
///
/// Problems confined to one connection never surface here; they are logged
/// and resolved by removing that connection.
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("failed to bind {addr}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },
    #[error("listener failed while accepting connections")]
    Accept(#[source] io::Error),
}
