//! Per-connection SOCKS5 handler.
//!
//! One task per accepted socket drives the session through
//! `AwaitingGreeting → AwaitingRequest → Connecting → Relaying → Closed`.
//! Any failure or cancellation jumps straight to `Closed`; the final
//! snapshot is emitted exactly once from [`ConnectionHandler::run`].

use std::sync::Arc;

use bytes::{Buf, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;

use crate::error::{Error, Result};
use crate::proxy::relay::{self, PumpEnd, RelayOutcome};
use crate::proxy::socks5::{
    Address, Command, ConnectReply, ConnectRequest, MethodResponse, MethodSelection, Reply,
};

use super::session::Session;
use super::stats::{ConnectionState, Destination};
use super::{Inner, ServerEvent};

/// Drives one client connection from greeting to teardown.
pub(crate) struct ConnectionHandler {
    session: Arc<Session>,
    inner: Arc<Inner>,
}

impl ConnectionHandler {
    pub(crate) fn new(session: Arc<Session>, inner: Arc<Inner>) -> Self {
        Self { session, inner }
    }

    /// Run the connection to completion, then tear it down.
    pub(crate) async fn run<S>(self, client: S)
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        self.inner.metrics.increment_connections();
        self.emit();

        match self.drive(client).await {
            Ok(()) => tracing::debug!("connection finished"),
            Err(Error::Cancelled) => tracing::debug!("connection cancelled"),
            Err(e) => tracing::debug!("connection closed: {}", e),
        }

        self.finish();
    }

    async fn drive<S>(&self, mut client: S) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let mut buf = BytesMut::with_capacity(512);

        // === Greeting ===
        let greeting = match self.read_message(&mut client, &mut buf, MethodSelection::decode).await {
            Ok(greeting) => greeting,
            Err(e) => {
                if !matches!(e, Error::Cancelled) {
                    self.inner.metrics.increment_handshake_errors();
                }
                return Err(e);
            }
        };

        let choice = MethodResponse::for_greeting(&greeting);
        self.send(&mut client, &choice.encode()).await?;
        if !choice.is_accepted() {
            self.inner.metrics.increment_handshake_errors();
            return Err(Error::NoAcceptableMethod);
        }
        self.transition(ConnectionState::AwaitingRequest);

        // === Request ===
        let request = match self.read_message(&mut client, &mut buf, ConnectRequest::decode).await {
            Ok(request) => request,
            Err(e) => {
                if let Some(reply) = e.reply_code() {
                    self.inner.metrics.increment_handshake_errors();
                    // Best effort, the connection closes either way
                    let _ = self.reply(&mut client, reply).await;
                }
                return Err(e);
            }
        };

        self.session
            .set_destination(Destination::new(&request.address, request.port));
        self.emit();

        if request.command != Command::Connect {
            self.inner.metrics.increment_rejected_commands();
            self.reply(&mut client, Reply::CommandNotSupported).await?;
            return Err(Error::UnsupportedCommand(request.command as u8));
        }

        // === Dial ===
        self.transition(ConnectionState::Connecting);
        let target = match self.dial(&request.address, request.port).await {
            Ok(target) => target,
            Err(Error::Cancelled) => return Err(Error::Cancelled),
            Err(e) => {
                self.inner.metrics.increment_dial_failures();
                let reply = e.reply_code().unwrap_or(Reply::GeneralFailure);
                let _ = self.reply(&mut client, reply).await;
                return Err(e);
            }
        };

        // Real bound address is not surfaced
        self.reply(&mut client, Reply::Succeeded).await?;
        self.transition(ConnectionState::Relaying);
        self.inner.metrics.increment_relayed();

        self.relay(client, target, buf).await
    }

    /// Accumulate client bytes until `decode` yields a complete message.
    ///
    /// Bytes past the message stay in `buf` for the next phase.
    async fn read_message<S, T>(
        &self,
        client: &mut S,
        buf: &mut BytesMut,
        decode: fn(&[u8]) -> Result<(T, usize)>,
    ) -> Result<T>
    where
        S: AsyncRead + Unpin,
    {
        loop {
            let incomplete = match decode(&buf[..]) {
                Ok((message, used)) => {
                    buf.advance(used);
                    return Ok(message);
                }
                Err(e) if e.is_truncated() => e,
                Err(e) => return Err(e),
            };

            let n = tokio::select! {
                biased;
                _ = self.session.cancellation().cancelled() => return Err(Error::Cancelled),
                result = client.read_buf(buf) => result?,
            };

            if n == 0 {
                return Err(incomplete);
            }
        }
    }

    async fn send<S>(&self, client: &mut S, data: &[u8]) -> Result<()>
    where
        S: AsyncWrite + Unpin,
    {
        tokio::select! {
            biased;
            _ = self.session.cancellation().cancelled() => Err(Error::Cancelled),
            result = client.write_all(data) => Ok(result?),
        }
    }

    async fn reply<S>(&self, client: &mut S, reply: Reply) -> Result<()>
    where
        S: AsyncWrite + Unpin,
    {
        let encoded = ConnectReply::unspecified(reply).encode()?;
        self.send(client, &encoded).await
    }

    /// Open the target leg, honoring cancellation and the optional timeout.
    async fn dial(&self, address: &Address, port: u16) -> Result<TcpStream> {
        let target = Destination::new(address, port).to_string();
        tracing::debug!("connecting to {}", target);

        let connect = async {
            let attempt = connect_target(address, port);
            let result = match self.inner.config.connect_timeout {
                Some(limit) => match tokio::time::timeout(limit, attempt).await {
                    Ok(result) => result,
                    Err(_) => Err(std::io::ErrorKind::TimedOut.into()),
                },
                None => attempt.await,
            };
            result.map_err(|source| Error::Dial {
                target: target.clone(),
                source,
            })
        };

        let stream = tokio::select! {
            biased;
            _ = self.session.cancellation().cancelled() => return Err(Error::Cancelled),
            result = connect => result?,
        };

        if let Err(e) = stream.set_nodelay(true) {
            tracing::trace!("set_nodelay on target leg failed: {}", e);
        }
        Ok(stream)
    }

    async fn relay<S>(&self, client: S, mut target: TcpStream, pending: BytesMut) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        // Client may pipeline payload right behind the request
        if !pending.is_empty() {
            self.send(&mut target, &pending).await?;
            self.count_in(pending.len());
        }

        let outcome = relay::relay_bidirectional(
            client,
            target,
            self.inner.config.relay_buffer_size,
            self.session.cancellation(),
            |n| self.count_in(n),
            |n| self.count_out(n),
        )
        .await;

        let RelayOutcome {
            upstream,
            downstream,
        } = outcome;
        match (upstream, downstream) {
            (Err(e), _) | (_, Err(e)) => Err(Error::Network(e)),
            (Ok(PumpEnd::Cancelled), Ok(PumpEnd::Cancelled)) => Err(Error::Cancelled),
            _ => Ok(()),
        }
    }

    fn count_in(&self, n: usize) {
        self.session.add_bytes_in(n as u64);
        self.inner.metrics.add_bytes_in(n as u64);
        self.emit();
    }

    fn count_out(&self, n: usize) {
        self.session.add_bytes_out(n as u64);
        self.inner.metrics.add_bytes_out(n as u64);
        self.emit();
    }

    fn transition(&self, next: ConnectionState) {
        if self.session.advance(next) {
            tracing::trace!("state -> {}", next);
            self.emit();
        }
    }

    fn emit(&self) {
        self.inner
            .sink
            .send_event(ServerEvent::ConnectionUpdated(self.session.stats()));
    }

    /// Enter `Closed`: deregister and report final totals, once.
    fn finish(&self) {
        if !self.session.close() {
            return;
        }
        self.inner.table.remove(self.session.id());
        self.inner.metrics.decrement_connections();
        self.emit();
    }
}

/// Connect to an IP directly, or resolve a domain and try each address.
async fn connect_target(address: &Address, port: u16) -> std::io::Result<TcpStream> {
    match address {
        Address::Ipv4(ip) => TcpStream::connect((*ip, port)).await,
        Address::Ipv6(ip) => TcpStream::connect((*ip, port)).await,
        Address::Domain(name) => TcpStream::connect((name.as_str(), port)).await,
    }
}
