//! SOCKS5 listener and connection lifecycle.
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────┐
//! │                            Server                             │
//! │  ┌──────────────────┐        ┌─────────────────────────────┐  │
//! │  │   Accept Loop    │───────▶│      Connection Table       │  │
//! │  │ (0.0.0.0:<port>) │ insert │  id → Session (RwLock map)  │  │
//! │  └────────┬─────────┘        └──────────────▲──────────────┘  │
//! │           │ spawn                           │ remove on Closed│
//! │           ▼                                 │                 │
//! │  ┌──────────────────────────────────────────┴──────────────┐  │
//! │  │              Connection Handler (per task)              │  │
//! │  │  greeting → request → dial → relay ⇄ → closed           │  │
//! │  └────────────────────────────┬────────────────────────────┘  │
//! │                               ▼                               │
//! │                 EventSink (owner: CLI, FFI, ...)              │
//! └───────────────────────────────────────────────────────────────┘
//! ```
//!
//! Stopping cancels the accept loop and every handler, then waits for all of
//! them to emit their final `Closed` snapshot before reporting the stop.

pub mod config;
mod events;
mod handler;
mod metrics;
mod session;
mod stats;

pub use config::{ServerConfig, ServerConfigFile, DEFAULT_PORT};
pub use events::{CallbackSink, ErrorReport, EventSink, ServerEvent};
pub use metrics::{MetricsSnapshot, ServerMetrics};
pub use session::{ConnectionTable, Session};
pub use stats::{ConnectionId, ConnectionState, ConnectionStats, Destination};

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::Instrument;

use crate::error::{Error, Result};

use handler::ConnectionHandler;

/// State shared by the accept loop and every connection handler.
pub(crate) struct Inner {
    config: ServerConfig,
    sink: Arc<dyn EventSink>,
    metrics: ServerMetrics,
    table: ConnectionTable,
    span: tracing::Span,
    running: Mutex<Option<Running>>,
    generation: AtomicU64,
}

/// Resources that exist only while the listener is up.
struct Running {
    generation: u64,
    local_addr: SocketAddr,
    cancel: CancellationToken,
    tracker: TaskTracker,
    accept: JoinHandle<()>,
}

impl Inner {
    fn emit_state(&self, running: bool) {
        self.sink.send_event(ServerEvent::StateChanged { running });
    }

    fn emit_error(&self, err: &Error) {
        self.sink.send_event(ServerEvent::Error(ErrorReport::from(err)));
    }

    /// Wait for every handler to close and drop whatever is left.
    async fn drain(&self, cancel: &CancellationToken, tracker: &TaskTracker) {
        cancel.cancel();
        self.table.cancel_all();
        tracker.close();
        tracker.wait().await;

        let left = self.table.clear();
        if left > 0 {
            tracing::warn!("{} connections left in table after drain", left);
        }
    }
}

/// Main server instance.
pub struct Server {
    inner: Arc<Inner>,
}

impl Server {
    /// Create a new server with the given configuration.
    pub fn new(config: ServerConfig, sink: Arc<dyn EventSink>) -> Self {
        let span = tracing::info_span!("socks5", port = config.listen_port);
        Self::with_span(config, sink, span)
    }

    /// Create a server whose log records are nested under `span`.
    pub fn with_span(config: ServerConfig, sink: Arc<dyn EventSink>, span: tracing::Span) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                sink,
                metrics: ServerMetrics::new(),
                table: ConnectionTable::new(),
                span,
                running: Mutex::new(None),
                generation: AtomicU64::new(0),
            }),
        }
    }

    /// Bind the listener and start accepting.
    ///
    /// Calling this while running is a no-op returning the bound address.
    pub async fn start(&self) -> Result<SocketAddr> {
        let mut running = self.inner.running.lock().await;
        if let Some(running) = running.as_ref() {
            return Ok(running.local_addr);
        }

        let listener = match self.bind().await {
            Ok(listener) => listener,
            Err(e) => {
                self.inner.span.in_scope(|| tracing::error!("failed to start: {}", e));
                self.inner.emit_error(&e);
                return Err(e);
            }
        };
        let local_addr = listener.local_addr()?;

        self.launch(&mut running, Listener::Tcp(listener), local_addr);
        Ok(local_addr)
    }

    /// Spawn the accept loop over `listener` and record it as running.
    fn launch(&self, running: &mut Option<Running>, listener: Listener, local_addr: SocketAddr) {
        let generation = self.inner.generation.fetch_add(1, Ordering::Relaxed) + 1;
        let cancel = CancellationToken::new();
        let tracker = TaskTracker::new();
        let accept = tokio::spawn(
            accept_loop(
                Arc::clone(&self.inner),
                listener,
                cancel.clone(),
                tracker.clone(),
                generation,
            )
            .instrument(self.inner.span.clone()),
        );

        *running = Some(Running {
            generation,
            local_addr,
            cancel,
            tracker,
            accept,
        });

        self.inner
            .span
            .in_scope(|| tracing::info!("SOCKS5 proxy listening on {}", local_addr));
        self.inner.emit_state(true);
    }

    async fn bind(&self) -> Result<TcpListener> {
        let addr = self.inner.config.bind_addr()?;
        TcpListener::bind(addr)
            .await
            .map_err(|source| Error::Bind { addr, source })
    }

    /// Stop accepting and tear down every connection.
    ///
    /// Returns once all handlers have emitted their final snapshot. Calling
    /// this while stopped is a no-op.
    pub async fn stop(&self) {
        // Released before awaiting so a failing accept loop can still lock it
        let Some(running) = self.inner.running.lock().await.take() else {
            return;
        };

        running.cancel.cancel();
        if let Err(e) = running.accept.await {
            self.inner
                .span
                .in_scope(|| tracing::warn!("accept loop panicked: {}", e));
        }
        self.inner.drain(&running.cancel, &running.tracker).await;

        self.inner
            .span
            .in_scope(|| tracing::info!("SOCKS5 proxy on {} stopped", running.local_addr));
        self.inner.emit_state(false);
    }

    /// Whether the listener is up.
    pub async fn is_running(&self) -> bool {
        self.inner.running.lock().await.is_some()
    }

    /// Bound address while running.
    pub async fn local_addr(&self) -> Option<SocketAddr> {
        self.inner.running.lock().await.as_ref().map(|r| r.local_addr)
    }

    /// Snapshots of all live connections.
    pub fn connections(&self) -> Vec<ConnectionStats> {
        self.inner.table.all_stats()
    }

    /// Get live connection count.
    pub fn connection_count(&self) -> usize {
        self.inner.table.count()
    }

    /// Get server metrics.
    pub fn metrics(&self) -> &ServerMetrics {
        &self.inner.metrics
    }

    /// Get the configuration.
    pub fn config(&self) -> &ServerConfig {
        &self.inner.config
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        // Handler tokens are children of this one
        if let Ok(running) = self.inner.running.try_lock() {
            if let Some(running) = running.as_ref() {
                running.cancel.cancel();
            }
        }
    }
}

/// Where accepted client sockets come from.
enum Listener {
    Tcp(TcpListener),
    /// Accept results fed by a test
    #[cfg(test)]
    Scripted(tokio::sync::mpsc::UnboundedReceiver<std::io::Result<(TcpStream, SocketAddr)>>),
}

impl Listener {
    async fn accept(&mut self) -> std::io::Result<(TcpStream, SocketAddr)> {
        match self {
            Listener::Tcp(listener) => listener.accept().await,
            #[cfg(test)]
            Listener::Scripted(results) => match results.recv().await {
                Some(result) => result,
                None => std::future::pending().await,
            },
        }
    }
}

async fn accept_loop(
    inner: Arc<Inner>,
    mut listener: Listener,
    cancel: CancellationToken,
    tracker: TaskTracker,
    generation: u64,
) {
    let failure = loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break None,
            result = listener.accept() => match result {
                Ok((stream, peer_addr)) => {
                    if let Err(e) = stream.set_nodelay(true) {
                        tracing::trace!("set_nodelay for {} failed: {}", peer_addr, e);
                    }

                    let session = inner.table.register(peer_addr, cancel.child_token());
                    let span = tracing::debug_span!(
                        parent: &inner.span,
                        "conn",
                        id = session.id(),
                        peer = %peer_addr,
                    );
                    tracing::debug!("SOCKS5 connection {} from {}", session.id(), peer_addr);

                    let handler = ConnectionHandler::new(session, Arc::clone(&inner));
                    tracker.spawn(handler.run(stream).instrument(span));
                }
                Err(e) => break Some(e),
            },
        }
    };
    drop(listener);

    let Some(e) = failure else {
        return;
    };

    let err = Error::Network(e);
    tracing::error!("accept failed, stopping: {}", err);
    inner.emit_error(&err);

    // A concurrent stop() may already own the teardown
    let running = {
        let mut guard = inner.running.lock().await;
        match guard.as_ref() {
            Some(r) if r.generation == generation => guard.take(),
            _ => None,
        }
    };

    if let Some(running) = running {
        inner.drain(&running.cancel, &running.tracker).await;
        inner.emit_state(false);
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;
    use tokio::sync::mpsc;

    use super::*;
    use crate::proxy::socks5::{Address, ConnectRequest};

    const WAIT: Duration = Duration::from_secs(5);

    fn local_config() -> ServerConfig {
        let mut config = ServerConfig::new(0);
        config.listen_addr = "127.0.0.1".parse().unwrap();
        config
    }

    fn server_with_events(config: ServerConfig) -> (Server, mpsc::UnboundedReceiver<ServerEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Server::new(config, Arc::new(tx)), rx)
    }

    async fn next_event(rx: &mut mpsc::UnboundedReceiver<ServerEvent>) -> ServerEvent {
        tokio::time::timeout(WAIT, rx.recv())
            .await
            .expect("timed out waiting for event")
            .expect("event channel closed")
    }

    /// Skip connection updates until the final snapshot of `id`.
    async fn closed_snapshot(
        rx: &mut mpsc::UnboundedReceiver<ServerEvent>,
        id: ConnectionId,
    ) -> (ConnectionStats, Vec<ConnectionState>) {
        let mut seen = Vec::new();
        loop {
            if let ServerEvent::ConnectionUpdated(stats) = next_event(rx).await {
                if stats.id != id {
                    continue;
                }
                seen.push(stats.state);
                if stats.is_closed() {
                    return (stats, seen);
                }
            }
        }
    }

    async fn first_connection_id(rx: &mut mpsc::UnboundedReceiver<ServerEvent>) -> ConnectionId {
        loop {
            if let ServerEvent::ConnectionUpdated(stats) = next_event(rx).await {
                return stats.id;
            }
        }
    }

    async fn handshake(proxy: SocketAddr, target: SocketAddr) -> (TcpStream, [u8; 10]) {
        let request = ConnectRequest::connect(Address::from(target), target.port());
        handshake_request(proxy, request).await
    }

    async fn handshake_request(proxy: SocketAddr, request: ConnectRequest) -> (TcpStream, [u8; 10]) {
        let mut client = TcpStream::connect(proxy).await.unwrap();
        client.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
        let mut choice = [0u8; 2];
        client.read_exact(&mut choice).await.unwrap();
        assert_eq!(choice, [0x05, 0x00]);

        client.write_all(&request.encode().unwrap()).await.unwrap();
        let mut reply = [0u8; 10];
        client.read_exact(&mut reply).await.unwrap();
        (client, reply)
    }

    async fn echo_target() -> SocketAddr {
        echo_target_on("127.0.0.1:0").await.unwrap()
    }

    async fn echo_target_on(bind: &str) -> std::io::Result<SocketAddr> {
        let listener = TcpListener::bind(bind).await?;
        let addr = listener.local_addr()?;
        tokio::spawn(async move {
            while let Ok((mut stream, _)) = listener.accept().await {
                tokio::spawn(async move {
                    let (mut r, mut w) = stream.split();
                    let _ = tokio::io::copy(&mut r, &mut w).await;
                });
            }
        });
        Ok(addr)
    }

    /// Echo `payload` through the proxy and return the final snapshot.
    async fn relay_echo(
        server: &Server,
        rx: &mut mpsc::UnboundedReceiver<ServerEvent>,
        request: ConnectRequest,
        payload: &[u8],
    ) -> ConnectionStats {
        let proxy = server.local_addr().await.unwrap();
        let (mut client, reply) = handshake_request(proxy, request).await;
        assert_eq!(reply, [0x05, 0x00, 0x00, 0x01, 0, 0, 0, 0, 0, 0]);

        client.write_all(payload).await.unwrap();
        let mut echo = vec![0u8; payload.len()];
        client.read_exact(&mut echo).await.unwrap();
        assert_eq!(echo, payload);
        drop(client);

        let id = first_connection_id(rx).await;
        closed_snapshot(rx, id).await.0
    }

    impl Server {
        /// Start with accept results supplied through the returned sender.
        async fn start_scripted(
            &self,
        ) -> mpsc::UnboundedSender<std::io::Result<(TcpStream, SocketAddr)>> {
            let (tx, rx) = mpsc::unbounded_channel();
            let mut running = self.inner.running.lock().await;
            self.launch(&mut running, Listener::Scripted(rx), "127.0.0.1:1080".parse().unwrap());
            tx
        }
    }

    /// A connected loopback pair: (client side, server side, client address).
    async fn socket_pair() -> (TcpStream, TcpStream, SocketAddr) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let client = TcpStream::connect(listener.local_addr().unwrap()).await.unwrap();
        let (server_side, peer) = listener.accept().await.unwrap();
        (client, server_side, peer)
    }

    #[tokio::test]
    async fn test_start_stop_idempotent() {
        let (server, mut rx) = server_with_events(local_config());

        let addr = server.start().await.unwrap();
        assert_eq!(server.start().await.unwrap(), addr);
        assert!(server.is_running().await);

        server.stop().await;
        server.stop().await;
        assert!(!server.is_running().await);

        assert_eq!(rx.try_recv().unwrap(), ServerEvent::StateChanged { running: true });
        assert_eq!(rx.try_recv().unwrap(), ServerEvent::StateChanged { running: false });
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_restart_after_stop() {
        let (server, _rx) = server_with_events(local_config());
        server.start().await.unwrap();
        server.stop().await;
        server.start().await.unwrap();
        assert!(server.is_running().await);
        server.stop().await;
    }

    #[tokio::test]
    async fn test_invalid_port() {
        let mut config = local_config();
        config.listen_port = 70000;
        let (server, mut rx) = server_with_events(config);

        assert!(matches!(server.start().await, Err(Error::InvalidPort(70000))));
        assert!(!server.is_running().await);
        match rx.try_recv().unwrap() {
            ServerEvent::Error(report) => {
                assert_eq!(report.category, crate::error::ErrorCategory::Configuration)
            }
            other => panic!("unexpected event {:?}", other),
        }
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_port_in_use() {
        let taken = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let mut config = local_config();
        config.listen_port = taken.local_addr().unwrap().port() as u32;
        let (server, mut rx) = server_with_events(config);

        assert!(matches!(server.start().await, Err(Error::Bind { .. })));
        assert!(matches!(rx.try_recv().unwrap(), ServerEvent::Error(_)));
        assert!(!server.is_running().await);
    }

    #[tokio::test]
    async fn test_end_to_end_ipv4_relay() {
        let target = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let target_addr = target.local_addr().unwrap();
        let target_task = tokio::spawn(async move {
            let (mut stream, _) = target.accept().await.unwrap();
            let mut buf = [0u8; 4];
            stream.read_exact(&mut buf).await.unwrap();
            assert_eq!(&buf, b"ping");
            stream.write_all(b"pong!").await.unwrap();
            let mut rest = Vec::new();
            stream.read_to_end(&mut rest).await.unwrap();
            rest
        });

        let (server, mut rx) = server_with_events(local_config());
        let proxy = server.start().await.unwrap();

        let (mut client, reply) = handshake(proxy, target_addr).await;
        assert_eq!(reply, [0x05, 0x00, 0x00, 0x01, 0, 0, 0, 0, 0, 0]);

        client.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 5];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"pong!");
        drop(client);

        assert!(target_task.await.unwrap().is_empty());

        let id = first_connection_id(&mut rx).await;
        let (last, states) = closed_snapshot(&mut rx, id).await;
        assert_eq!(last.bytes_in, 4);
        assert_eq!(last.bytes_out, 5);
        assert_eq!(
            last.destination,
            Some(Destination {
                host: "127.0.0.1".into(),
                port: target_addr.port()
            })
        );
        assert!(states.contains(&ConnectionState::Relaying));
        assert!(states.windows(2).all(|w| w[0] <= w[1]));

        assert_eq!(server.connection_count(), 0);
        assert_eq!(server.metrics().relayed_connections(), 1);
        server.stop().await;
    }

    #[tokio::test]
    async fn test_pipelined_payload_reaches_target() {
        let target = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let target_addr = target.local_addr().unwrap();
        let target_task = tokio::spawn(async move {
            let (mut stream, _) = target.accept().await.unwrap();
            let mut buf = [0u8; 5];
            stream.read_exact(&mut buf).await.unwrap();
            buf
        });

        let (server, _rx) = server_with_events(local_config());
        let proxy = server.start().await.unwrap();

        // Greeting, request and payload in a single write
        let mut client = TcpStream::connect(proxy).await.unwrap();
        let mut burst = vec![0x05, 0x01, 0x00];
        burst.extend_from_slice(
            &ConnectRequest::connect(Address::from(target_addr), target_addr.port())
                .encode()
                .unwrap(),
        );
        burst.extend_from_slice(b"early");
        client.write_all(&burst).await.unwrap();

        let mut replies = [0u8; 12];
        client.read_exact(&mut replies).await.unwrap();
        assert_eq!(&replies[..2], &[0x05, 0x00]);
        assert_eq!(replies[3], 0x00);

        assert_eq!(&target_task.await.unwrap(), b"early");
        server.stop().await;
    }

    #[tokio::test]
    async fn test_connection_refused() {
        let closed = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let target_addr = closed.local_addr().unwrap();
        drop(closed);

        let (server, mut rx) = server_with_events(local_config());
        let proxy = server.start().await.unwrap();

        let (mut client, reply) = handshake(proxy, target_addr).await;
        assert_eq!(reply[..2], [0x05, 0x05]);
        let mut rest = Vec::new();
        client.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());

        let id = first_connection_id(&mut rx).await;
        let (_, states) = closed_snapshot(&mut rx, id).await;
        assert!(!states.contains(&ConnectionState::Relaying));
        assert_eq!(server.metrics().snapshot().dial_failures, 1);
        server.stop().await;
    }

    #[tokio::test]
    async fn test_no_acceptable_method() {
        let (server, mut rx) = server_with_events(local_config());
        let proxy = server.start().await.unwrap();

        let mut client = TcpStream::connect(proxy).await.unwrap();
        client.write_all(&[0x05, 0x01, 0x02]).await.unwrap();
        let mut response = Vec::new();
        client.read_to_end(&mut response).await.unwrap();
        assert_eq!(response, vec![0x05, 0xFF]);

        let id = first_connection_id(&mut rx).await;
        let (_, states) = closed_snapshot(&mut rx, id).await;
        assert_eq!(states, vec![ConnectionState::Closed]);
        server.stop().await;
    }

    #[tokio::test]
    async fn test_bad_version_closes_silently() {
        let (server, _rx) = server_with_events(local_config());
        let proxy = server.start().await.unwrap();

        let mut client = TcpStream::connect(proxy).await.unwrap();
        client.write_all(&[0x04, 0x01, 0x00]).await.unwrap();
        let mut response = Vec::new();
        client.read_to_end(&mut response).await.unwrap();
        assert!(response.is_empty());
        server.stop().await;
    }

    #[tokio::test]
    async fn test_bind_command_rejected() {
        let (server, _rx) = server_with_events(local_config());
        let proxy = server.start().await.unwrap();

        let mut client = TcpStream::connect(proxy).await.unwrap();
        client.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
        let mut choice = [0u8; 2];
        client.read_exact(&mut choice).await.unwrap();
        client
            .write_all(&[0x05, 0x02, 0x00, 0x01, 127, 0, 0, 1, 0x1f, 0x90])
            .await
            .unwrap();

        let mut reply = Vec::new();
        client.read_to_end(&mut reply).await.unwrap();
        assert_eq!(reply, vec![0x05, 0x07, 0x00, 0x01, 0, 0, 0, 0, 0, 0]);
        assert_eq!(server.metrics().snapshot().rejected_commands, 1);
        server.stop().await;
    }

    #[tokio::test]
    async fn test_unknown_address_type_reply() {
        let (server, _rx) = server_with_events(local_config());
        let proxy = server.start().await.unwrap();

        let mut client = TcpStream::connect(proxy).await.unwrap();
        client.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
        let mut choice = [0u8; 2];
        client.read_exact(&mut choice).await.unwrap();
        client.write_all(&[0x05, 0x01, 0x00, 0x09]).await.unwrap();

        let mut reply = Vec::new();
        client.read_to_end(&mut reply).await.unwrap();
        assert_eq!(reply[..2], [0x05, 0x08]);
        server.stop().await;
    }

    #[tokio::test]
    async fn test_truncated_request_then_hangup() {
        let (server, mut rx) = server_with_events(local_config());
        let proxy = server.start().await.unwrap();

        let mut client = TcpStream::connect(proxy).await.unwrap();
        client.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
        let mut choice = [0u8; 2];
        client.read_exact(&mut choice).await.unwrap();
        client.write_all(&[0x05, 0x01, 0x00, 0x01, 10, 0]).await.unwrap();
        client.shutdown().await.unwrap();

        let mut reply = Vec::new();
        client.read_to_end(&mut reply).await.unwrap();
        assert_eq!(reply[..2], [0x05, 0x01]);

        let id = first_connection_id(&mut rx).await;
        let (last, _) = closed_snapshot(&mut rx, id).await;
        assert!(last.destination.is_none());
        server.stop().await;
    }

    #[tokio::test]
    async fn test_stop_closes_relaying_connections() {
        let target_addr = echo_target().await;
        let (server, mut rx) = server_with_events(local_config());
        let proxy = server.start().await.unwrap();

        let mut clients = Vec::new();
        for _ in 0..3 {
            let (mut client, reply) = handshake(proxy, target_addr).await;
            assert_eq!(reply[1], 0x00);
            client.write_all(b"hi").await.unwrap();
            let mut echo = [0u8; 2];
            client.read_exact(&mut echo).await.unwrap();
            clients.push(client);
        }
        assert_eq!(server.connection_count(), 3);

        tokio::time::timeout(WAIT, server.stop()).await.unwrap();
        assert_eq!(server.connection_count(), 0);

        let mut closed = Vec::new();
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        let stop_at = events
            .iter()
            .position(|e| *e == ServerEvent::StateChanged { running: false })
            .expect("stop event");
        assert_eq!(stop_at, events.len() - 1);

        for event in &events[..stop_at] {
            if let ServerEvent::ConnectionUpdated(stats) = event {
                if stats.is_closed() {
                    assert_eq!(stats.bytes_in, 2);
                    assert_eq!(stats.bytes_out, 2);
                    closed.push(stats.id);
                }
            }
        }
        closed.sort_unstable();
        closed.dedup();
        assert_eq!(closed.len(), 3);

        for mut client in clients {
            let mut rest = Vec::new();
            let n = tokio::time::timeout(WAIT, client.read_to_end(&mut rest)).await.unwrap();
            assert!(n.map(|n| n == 0).unwrap_or(true));
        }
    }

    #[tokio::test]
    async fn test_accept_failure_stops_server() {
        let (server, mut rx) = server_with_events(local_config());
        let accepts = server.start_scripted().await;
        assert_eq!(next_event(&mut rx).await, ServerEvent::StateChanged { running: true });

        // One live connection, still waiting for its greeting
        let (_client, server_side, peer) = socket_pair().await;
        accepts.send(Ok((server_side, peer))).unwrap();
        let id = first_connection_id(&mut rx).await;

        accepts
            .send(Err(std::io::Error::other("accept exploded")))
            .unwrap();

        match next_event(&mut rx).await {
            ServerEvent::Error(report) => {
                assert_eq!(report.category, crate::error::ErrorCategory::Io);
                assert!(report.message.contains("accept exploded"));
            }
            other => panic!("unexpected event {:?}", other),
        }
        match next_event(&mut rx).await {
            ServerEvent::ConnectionUpdated(stats) => {
                assert_eq!(stats.id, id);
                assert!(stats.is_closed());
            }
            other => panic!("unexpected event {:?}", other),
        }
        assert_eq!(next_event(&mut rx).await, ServerEvent::StateChanged { running: false });

        assert!(!server.is_running().await);
        assert_eq!(server.connection_count(), 0);

        // Teardown already happened; stop has nothing left to report
        server.stop().await;
        assert!(rx.try_recv().is_err());

        // A fresh start is not confused by the failed generation
        server.start().await.unwrap();
        assert_eq!(next_event(&mut rx).await, ServerEvent::StateChanged { running: true });
        server.stop().await;
        assert_eq!(next_event(&mut rx).await, ServerEvent::StateChanged { running: false });
    }

    #[tokio::test]
    async fn test_stop_with_client_not_reading() {
        let target = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let target_addr = target.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut stream, _) = target.accept().await.unwrap();
            let chunk = vec![0x5Au8; 64 * 1024];
            while stream.write_all(&chunk).await.is_ok() {}
        });

        let (server, mut rx) = server_with_events(local_config());
        let proxy = server.start().await.unwrap();

        let (_client, reply) = handshake(proxy, target_addr).await;
        assert_eq!(reply[1], 0x00);

        // Socket buffers fill up and the relay blocks writing to the client
        tokio::time::sleep(Duration::from_millis(200)).await;

        tokio::time::timeout(WAIT, server.stop())
            .await
            .expect("stop must not wait on a client that stopped reading");

        let id = first_connection_id(&mut rx).await;
        let (last, _) = closed_snapshot(&mut rx, id).await;
        assert!(last.bytes_out > 0);
        assert_eq!(server.connection_count(), 0);
    }

    #[tokio::test]
    async fn test_connect_by_domain_name() {
        let target_addr = echo_target().await;
        let (server, mut rx) = server_with_events(local_config());
        server.start().await.unwrap();

        let request = ConnectRequest::connect(Address::Domain("localhost".into()), target_addr.port());
        let last = relay_echo(&server, &mut rx, request, b"by name").await;

        assert_eq!(
            last.destination,
            Some(Destination {
                host: "localhost".into(),
                port: target_addr.port()
            })
        );
        assert_eq!(last.bytes_in, 7);
        assert_eq!(last.bytes_out, 7);
        server.stop().await;
    }

    #[tokio::test]
    async fn test_connect_ipv6_literal() {
        // Hosts without an IPv6 loopback cannot run this
        let Ok(target_addr) = echo_target_on("[::1]:0").await else {
            return;
        };
        let (server, mut rx) = server_with_events(local_config());
        server.start().await.unwrap();

        let request = ConnectRequest::connect(Address::from(target_addr), target_addr.port());
        let last = relay_echo(&server, &mut rx, request, b"v6").await;

        let destination = last.destination.unwrap();
        assert_eq!(destination.host, "0:0:0:0:0:0:0:1");
        assert_eq!(destination.to_string(), format!("[0:0:0:0:0:0:0:1]:{}", target_addr.port()));
        server.stop().await;
    }

    #[tokio::test]
    async fn test_udp_associate_rejected() {
        let (server, mut rx) = server_with_events(local_config());
        let proxy = server.start().await.unwrap();

        let mut client = TcpStream::connect(proxy).await.unwrap();
        client.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
        let mut choice = [0u8; 2];
        client.read_exact(&mut choice).await.unwrap();
        client
            .write_all(&[0x05, 0x03, 0x00, 0x01, 0, 0, 0, 0, 0, 0])
            .await
            .unwrap();

        let mut reply = Vec::new();
        client.read_to_end(&mut reply).await.unwrap();
        assert_eq!(reply, vec![0x05, 0x07, 0x00, 0x01, 0, 0, 0, 0, 0, 0]);

        let id = first_connection_id(&mut rx).await;
        let (_, states) = closed_snapshot(&mut rx, id).await;
        assert!(!states.contains(&ConnectionState::Connecting));
        assert_eq!(server.metrics().snapshot().rejected_commands, 1);
        server.stop().await;
    }
}
