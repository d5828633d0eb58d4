// mock_source_server: A mock glucose data source for testing bindings.
//
// Accepts TCP connections on 127.0.0.1:<port>, speaks newline-delimited
// `SourceMessage` JSON, records callback registrations, answers `get_latest`
// and lets tests push records or drop every client on demand.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bg_protocol::{BgRecord, SourceMessage};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;

#[derive(Debug, Clone)]
enum Outbound {
    Message(SourceMessage),
    Close,
}

#[derive(Debug, Default)]
struct ServerState {
    registrations: Vec<String>,
    unregistrations: Vec<String>,
    latest: Option<BgRecord>,
    latest_requests: usize,
    connections: usize,
}

/// A mock data source for integration testing.
///
/// Binds to port 0 (random) and exposes the actual bound port. Each test
/// can spin up its own isolated server instance.
///
/// # Protocol behavior
///
/// - `register_callback` / `unregister_callback` are recorded by client id.
/// - `get_latest` is answered with a `bg_data` line carrying the record set
///   via [`MockSourceServer::set_latest`]; nothing is sent when unset.
/// - [`MockSourceServer::push`] writes a message to every connected client.
/// - [`MockSourceServer::disconnect_all`] closes every client socket.
pub struct MockSourceServer {
    addr: SocketAddr,
    state: Arc<Mutex<ServerState>>,
    outbound: broadcast::Sender<Outbound>,
    /// Handle to the background accept loop; dropped when the server is dropped.
    _task: tokio::task::JoinHandle<()>,
}

impl MockSourceServer {
    /// Start the mock source, binding to a random available port.
    pub async fn start() -> std::io::Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let state = Arc::new(Mutex::new(ServerState::default()));
        let (outbound, _) = broadcast::channel(64);

        let task = tokio::spawn(Self::accept_loop(
            listener,
            Arc::clone(&state),
            outbound.clone(),
        ));

        Ok(Self {
            addr,
            state,
            outbound,
            _task: task,
        })
    }

    /// Return the address the server is listening on.
    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    /// Record served in response to `get_latest`.
    pub fn set_latest(&self, record: BgRecord) {
        self.with_state(|s| s.latest = Some(record));
    }

    /// Send a message to every connected client. Returns how many received it.
    pub fn push(&self, message: SourceMessage) -> usize {
        self.outbound.send(Outbound::Message(message)).unwrap_or(0)
    }

    /// Close every client connection; clients observe EOF.
    pub fn disconnect_all(&self) {
        let _ = self.outbound.send(Outbound::Close);
    }

    pub fn registrations(&self) -> Vec<String> {
        self.with_state(|s| s.registrations.clone())
    }

    pub fn unregistrations(&self) -> Vec<String> {
        self.with_state(|s| s.unregistrations.clone())
    }

    pub fn latest_requests(&self) -> usize {
        self.with_state(|s| s.latest_requests)
    }

    /// Number of connections accepted since start.
    pub fn connections(&self) -> usize {
        self.with_state(|s| s.connections)
    }

    /// Poll until at least `count` registrations were seen or `timeout` passes.
    pub async fn wait_for_registrations(&self, count: usize, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if self.registrations().len() >= count {
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    fn with_state<T>(&self, f: impl FnOnce(&mut ServerState) -> T) -> T {
        let mut guard = self
            .state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        f(&mut guard)
    }

    // -- internal --

    async fn accept_loop(
        listener: TcpListener,
        state: Arc<Mutex<ServerState>>,
        outbound: broadcast::Sender<Outbound>,
    ) {
        while let Ok((stream, _peer)) = listener.accept().await {
            if let Ok(mut s) = state.lock() {
                s.connections += 1;
            }
            let state = Arc::clone(&state);
            let rx = outbound.subscribe();
            tokio::spawn(async move {
                // Client drops are expected in tests; swallow errors.
                let _ = Self::handle_connection(stream, state, rx).await;
            });
        }
    }

    async fn handle_connection(
        stream: TcpStream,
        state: Arc<Mutex<ServerState>>,
        mut outbound: broadcast::Receiver<Outbound>,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let (read, mut write) = stream.into_split();
        let mut lines = BufReader::new(read).lines();

        loop {
            tokio::select! {
                line = lines.next_line() => {
                    let Some(line) = line? else { return Ok(()) };
                    if line.trim().is_empty() {
                        continue;
                    }
                    let reply = match SourceMessage::from_line(&line)? {
                        SourceMessage::RegisterCallback(reg) => {
                            if let Ok(mut s) = state.lock() {
                                s.registrations.push(reg.client_id);
                            }
                            None
                        }
                        SourceMessage::UnregisterCallback(reg) => {
                            if let Ok(mut s) = state.lock() {
                                s.unregistrations.push(reg.client_id);
                            }
                            None
                        }
                        SourceMessage::GetLatest => state.lock().ok().and_then(|mut s| {
                            s.latest_requests += 1;
                            s.latest.clone().map(SourceMessage::BgData)
                        }),
                        // Sources never receive data kinds; ignore them.
                        SourceMessage::BgData(_) | SourceMessage::Heartbeat(_) => None,
                    };
                    if let Some(reply) = reply {
                        write.write_all(reply.to_line()?.as_bytes()).await?;
                    }
                }
                msg = outbound.recv() => match msg {
                    Ok(Outbound::Message(m)) => write.write_all(m.to_line()?.as_bytes()).await?,
                    Ok(Outbound::Close) | Err(broadcast::error::RecvError::Closed) => {
                        write.shutdown().await?;
                        return Ok(());
                    }
                    Err(broadcast::error::RecvError::Lagged(_)) => {}
                }
            }
        }
    }
}
