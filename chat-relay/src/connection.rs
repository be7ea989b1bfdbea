use std::{
    fmt, io,
    net::SocketAddr,
    sync::{
        OnceLock,
        atomic::{AtomicU8, AtomicU64, Ordering},
    },
    time::Duration,
};

use tokio::{io::AsyncWrite, select, sync::Mutex, time::timeout};
use tokio_util::sync::CancellationToken;

use crate::protocol::write_line;

/// Write end of a connection's transport.
pub type LineWriter = Box<dyn AsyncWrite + Send + Unpin>;

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique connection identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ConnectionId(u64);

impl ConnectionId {
    pub fn next() -> Self {
        Self(NEXT_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnectionState {
    /// Stream open, display name not read yet.
    Connected,
    /// Display name read and join notice sent.
    Active,
    /// Exit requested or stream ended; departure in progress.
    Closing,
    /// Removed from the registry, transport released.
    Closed,
}

impl ConnectionState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => ConnectionState::Connected,
            1 => ConnectionState::Active,
            2 => ConnectionState::Closing,
            _ => ConnectionState::Closed,
        }
    }
}

/// One client's session as seen by the rest of the relay.
///
/// The read end is owned by the handling task; the write end lives here,
/// behind a lock, so every broadcast targeting this client is written
/// line by line in the order the lock was acquired.
pub struct Connection {
    id: ConnectionId,
    peer: Option<SocketAddr>,
    display_name: OnceLock<String>,
    state: AtomicU8,
    writer: Mutex<Option<LineWriter>>,
    closed: CancellationToken,
}

impl Connection {
    /// `closed` is usually a child of the coordinator's stop token so a
    /// coordinator-wide stop reaches every connection.
    pub fn new(writer: LineWriter, peer: Option<SocketAddr>, closed: CancellationToken) -> Self {
        Self {
            id: ConnectionId::next(),
            peer,
            display_name: OnceLock::new(),
            state: AtomicU8::new(ConnectionState::Connected as u8),
            writer: Mutex::new(Some(writer)),
            closed,
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn peer(&self) -> Option<SocketAddr> {
        self.peer
    }

    pub fn display_name(&self) -> Option<&str> {
        self.display_name.get().map(String::as_str)
    }

    /// Records the handshake name. Only the first call has any effect.
    pub fn set_display_name(&self, name: String) -> bool {
        self.display_name.set(name).is_ok()
    }

    pub fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Moves the state forward. Transitions never go backwards.
    pub(crate) fn advance(&self, next: ConnectionState) {
        self.state.fetch_max(next as u8, Ordering::AcqRel);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Resolves once the connection has been closed.
    pub async fn closed(&self) {
        self.closed.cancelled().await
    }

    /// Closes the connection: wakes any pending read or write on it and
    /// drops the write end, which shuts the transport's write side down.
    pub fn close(&self) {
        self.closed.cancel();
        self.advance(ConnectionState::Closed);
        // A writer held by an in-flight send is dropped by that send once it
        // observes the cancellation.
        if let Ok(mut slot) = self.writer.try_lock() {
            slot.take();
        }
    }

    /// Writes one line and flushes it, giving up after `limit`.
    pub async fn send_line(&self, line: &str, limit: Duration) -> io::Result<()> {
        let mut slot = self.writer.lock().await;
        if self.is_closed() {
            slot.take();
            return Err(closed_error());
        }
        let Some(writer) = slot.as_mut() else {
            return Err(closed_error());
        };

        let outcome = select! {
            biased;
            _ = self.closed.cancelled() => None,
            written = timeout(limit, write_line(writer, line)) => Some(written),
        };

        match outcome {
            Some(Ok(result)) => result,
            Some(Err(_elapsed)) => Err(io::Error::new(
                io::ErrorKind::TimedOut,
                "timed out writing to connection",
            )),
            None => {
                slot.take();
                Err(closed_error())
            }
        }
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("peer", &self.peer)
            .field("display_name", &self.display_name())
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

fn closed_error() -> io::Error {
    io::Error::new(io::ErrorKind::BrokenPipe, "connection closed")
}
