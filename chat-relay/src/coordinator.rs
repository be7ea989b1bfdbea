use std::{future::Future, io, net::SocketAddr, sync::Arc, time::Duration};

use futures_util::future::join_all;
use tokio::{
    io::{AsyncBufRead, AsyncWrite, AsyncWriteExt, BufReader},
    net::{TcpListener, TcpStream},
    select,
    time::timeout,
};
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tracing::{debug, error, info, warn};

use crate::{
    config::ServerConfig,
    connection::{Connection, ConnectionId, ConnectionState},
    error::RelayError,
    protocol::{Notice, SERVER_FULL, is_exit_command, read_line, write_line},
    registry::Registry,
};

/// Accepts clients on a bound listener and relays their lines to each other.
pub struct Coordinator {
    listener: TcpListener,
    handle: CoordinatorHandle,
}

impl Coordinator {
    /// Binds the configured endpoint. Failing to bind is fatal for the relay.
    pub async fn bind(config: ServerConfig) -> Result<Self, RelayError> {
        let addr = config.socket_addr();
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| RelayError::Bind { addr, source })?;
        Ok(Self::new(listener, config))
    }

    pub fn new(listener: TcpListener, config: ServerConfig) -> Self {
        Self {
            listener,
            handle: CoordinatorHandle::new(config),
        }
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Handle for stopping the relay and inspecting its members while
    /// [`Coordinator::start`] runs.
    pub fn handle(&self) -> CoordinatorHandle {
        self.handle.clone()
    }

    /// Runs the accept loop until [`CoordinatorHandle::stop`] is called or
    /// the listener fails.
    pub async fn start(self) -> Result<(), RelayError> {
        self.run_until(std::future::pending()).await
    }

    /// Like [`Coordinator::start`], additionally stopping once `shutdown` resolves.
    ///
    /// Every exit path closes the remaining connections and waits for their
    /// handling tasks before returning.
    pub async fn run_until<F>(self, shutdown: F) -> Result<(), RelayError>
    where
        F: Future<Output = ()> + Send,
    {
        let Coordinator { listener, handle } = self;
        tokio::pin!(shutdown);

        let result = loop {
            select! {
                biased;
                _ = handle.state.stop.cancelled() => break Ok(()),
                _ = &mut shutdown => {
                    handle.stop();
                    break Ok(());
                }
                accept_result = listener.accept() => {
                    if let Err(err) = handle_accept_result(accept_result, &handle) {
                        break Err(err);
                    }
                }
            }
        };

        drop(listener);
        handle.shutdown();
        handle.state.tasks.close();
        handle.state.tasks.wait().await;
        info!("relay stopped");

        result
    }

    pub async fn run_until_ctrl_c(self) -> Result<(), RelayError> {
        self.run_until(async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                warn!(error = ?err, "failed to install ctrl-c handler");
                std::future::pending::<()>().await;
            }
        })
        .await
    }
}

fn handle_accept_result(
    result: io::Result<(TcpStream, SocketAddr)>,
    handle: &CoordinatorHandle,
) -> Result<(), RelayError> {
    match result {
        Ok((stream, peer)) => {
            handle.admit(stream, peer);
            Ok(())
        }
        Err(err) if is_transient_accept_error(&err) => {
            warn!(error = ?err, "failed to accept connection");
            Ok(())
        }
        Err(err) => {
            error!(error = ?err, "listener failed");
            Err(RelayError::Accept(err))
        }
    }
}

/// Errors that concern only the connection being accepted, not the listener.
fn is_transient_accept_error(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionRefused
            | io::ErrorKind::Interrupted
            | io::ErrorKind::WouldBlock
            | io::ErrorKind::TimedOut
    )
}

/// Cheap, cloneable access to a running relay.
#[derive(Clone)]
pub struct CoordinatorHandle {
    state: Arc<CoordinatorState>,
}

struct CoordinatorState {
    config: ServerConfig,
    registry: Registry,
    stop: CancellationToken,
    tasks: TaskTracker,
}

/// Outcome of one fan-out.
#[derive(Debug, Default)]
pub struct BroadcastReport {
    pub delivered: usize,
    pub failures: Vec<DeliveryFailure>,
}

impl BroadcastReport {
    pub fn is_complete(&self) -> bool {
        self.failures.is_empty()
    }
}

#[derive(Debug)]
pub struct DeliveryFailure {
    pub connection: ConnectionId,
    pub error: io::Error,
}

impl CoordinatorHandle {
    fn new(config: ServerConfig) -> Self {
        Self {
            state: Arc::new(CoordinatorState {
                config,
                registry: Registry::new(),
                stop: CancellationToken::new(),
                tasks: TaskTracker::new(),
            }),
        }
    }

    pub fn registry(&self) -> &Registry {
        &self.state.registry
    }

    /// Requests a cooperative stop of the accept loop and every handling task.
    pub fn stop(&self) {
        if !self.state.stop.is_cancelled() {
            info!("relay stop requested");
        }
        self.state.stop.cancel();
    }

    pub fn is_stopped(&self) -> bool {
        self.state.stop.is_cancelled()
    }

    /// Closes every registered connection and stops accepting. Safe to call repeatedly.
    pub fn shutdown(&self) {
        self.state.stop.cancel();
        let closed = self.state.registry.drain();
        if !closed.is_empty() {
            info!(connections = closed.len(), "closed remaining connections");
        }
    }

    /// Writes `message` to every member except `excluding`.
    pub async fn broadcast(&self, message: &str, excluding: ConnectionId) -> BroadcastReport {
        self.state.broadcast(message, excluding).await
    }

    /// Registers a transport pair and spawns the task that serves it.
    pub fn attach<R, W>(&self, reader: R, writer: W, peer: Option<SocketAddr>) -> Arc<Connection>
    where
        R: AsyncBufRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let connection = Arc::new(Connection::new(
            Box::new(writer),
            peer,
            self.state.stop.child_token(),
        ));
        self.state.registry.insert(Arc::clone(&connection));

        let state = Arc::clone(&self.state);
        let task_connection = Arc::clone(&connection);
        self.state
            .tasks
            .spawn(serve_connection(state, task_connection, reader));

        connection
    }

    fn admit(&self, stream: TcpStream, peer: SocketAddr) {
        if self.at_capacity() {
            warn!(peer = %peer, "connection limit reached, turning client away");
            self.state
                .tasks
                .spawn(turn_away(stream, peer, self.state.config.write_timeout));
            return;
        }

        if let Err(err) = stream.set_nodelay(true) {
            debug!(peer = %peer, error = ?err, "failed to set TCP_NODELAY");
        }
        let (reader, writer) = stream.into_split();
        let connection = self.attach(BufReader::new(reader), writer, Some(peer));
        debug!(peer = %peer, connection = %connection.id(), "accepted connection");
    }

    fn at_capacity(&self) -> bool {
        match self.state.config.max_connections {
            Some(limit) => self.state.registry.len() >= limit,
            None => false,
        }
    }
}

impl CoordinatorState {
    async fn broadcast(&self, message: &str, excluding: ConnectionId) -> BroadcastReport {
        let targets: Vec<_> = self
            .registry
            .snapshot()
            .into_iter()
            .filter(|connection| connection.id() != excluding && !connection.is_closed())
            .collect();

        let limit = self.config.write_timeout;
        let outcomes = join_all(targets.iter().map(|connection| async move {
            (connection, connection.send_line(message, limit).await)
        }))
        .await;

        let mut report = BroadcastReport::default();
        for (connection, outcome) in outcomes {
            match outcome {
                Ok(()) => report.delivered += 1,
                Err(error) => {
                    warn!(
                        connection = %connection.id(),
                        peer = ?connection.peer(),
                        error = ?error,
                        "failed to deliver message"
                    );
                    // A partially written line leaves the stream unusable.
                    connection.close();
                    report.failures.push(DeliveryFailure {
                        connection: connection.id(),
                        error,
                    });
                }
            }
        }
        report
    }
}

async fn turn_away(mut stream: TcpStream, peer: SocketAddr, limit: Duration) {
    let refused = timeout(limit, async {
        write_line(&mut stream, SERVER_FULL).await?;
        stream.shutdown().await
    })
    .await;

    match refused {
        Ok(Ok(())) => {}
        Ok(Err(err)) => debug!(peer = %peer, error = ?err, "failed to notify refused client"),
        Err(_) => debug!(peer = %peer, "timed out notifying refused client"),
    }
}

/// Removes the connection from the registry when dropped, so cleanup runs
/// exactly once however the handling task ends.
struct Registration {
    state: Arc<CoordinatorState>,
    id: ConnectionId,
}

impl Drop for Registration {
    fn drop(&mut self) {
        self.state.registry.remove(self.id);
    }
}

#[derive(Debug)]
enum Departure {
    /// Stream ended before a display name arrived.
    BeforeHandshake,
    Exit,
    PeerClosed,
    ReadFailed(io::Error),
    /// Closed by the relay after a delivery to it failed; the client is gone.
    Evicted,
    /// Closed by stop or shutdown.
    Cancelled,
}

impl Departure {
    fn announces(&self) -> bool {
        matches!(
            self,
            Departure::Exit
                | Departure::PeerClosed
                | Departure::ReadFailed(_)
                | Departure::Evicted
        )
    }
}

enum Inbound {
    Line(String),
    PeerClosed,
    Cancelled,
}

async fn serve_connection<R>(
    state: Arc<CoordinatorState>,
    connection: Arc<Connection>,
    mut reader: R,
) where
    R: AsyncBufRead + Unpin,
{
    let _registration = Registration {
        state: Arc::clone(&state),
        id: connection.id(),
    };

    match run_session(&state, &connection, &mut reader).await {
        Departure::ReadFailed(err) => warn!(
            connection = %connection.id(),
            peer = ?connection.peer(),
            error = ?err,
            "connection closed with error"
        ),
        departure => debug!(
            connection = %connection.id(),
            peer = ?connection.peer(),
            ?departure,
            "connection finished"
        ),
    }
}

async fn run_session<R>(
    state: &CoordinatorState,
    connection: &Connection,
    reader: &mut R,
) -> Departure
where
    R: AsyncBufRead + Unpin,
{
    let name = match next_line(connection, reader).await {
        Ok(Inbound::Line(name)) => name,
        Ok(Inbound::PeerClosed | Inbound::Cancelled) => return Departure::BeforeHandshake,
        Err(err) => return Departure::ReadFailed(err),
    };
    connection.set_display_name(name.clone());

    let joined = Notice::Joined { name: &name }.to_string();
    info!(connection = %connection.id(), "{joined}");
    state.broadcast(&joined, connection.id()).await;
    connection.advance(ConnectionState::Active);

    let departure = loop {
        match next_line(connection, reader).await {
            Ok(Inbound::Line(line)) if is_exit_command(&line) => break Departure::Exit,
            Ok(Inbound::Line(text)) => {
                let message = Notice::Chat {
                    name: &name,
                    text: &text,
                }
                .to_string();
                info!(connection = %connection.id(), "{message}");
                state.broadcast(&message, connection.id()).await;
            }
            Ok(Inbound::PeerClosed) => break Departure::PeerClosed,
            Ok(Inbound::Cancelled) if state.stop.is_cancelled() => break Departure::Cancelled,
            Ok(Inbound::Cancelled) => break Departure::Evicted,
            Err(err) => break Departure::ReadFailed(err),
        }
    };
    connection.advance(ConnectionState::Closing);

    if departure.announces() {
        let left = Notice::Left { name: &name }.to_string();
        info!(connection = %connection.id(), "{left}");
        state.broadcast(&left, connection.id()).await;
    }

    departure
}

/// Reads the next line unless the connection is closed first.
async fn next_line<R>(connection: &Connection, reader: &mut R) -> io::Result<Inbound>
where
    R: AsyncBufRead + Unpin,
{
    select! {
        biased;
        _ = connection.closed() => Ok(Inbound::Cancelled),
        line = read_line(reader) => Ok(line?.map_or(Inbound::PeerClosed, Inbound::Line)),
    }
}
