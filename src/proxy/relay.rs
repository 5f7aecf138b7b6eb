//! Bidirectional byte relay between the client leg and the target leg.
//!
//! Two pumps run concurrently on the calling task. The first one to finish
//! (EOF, I/O error or cancellation) cancels its sibling. A cancelled pump
//! abandons a pending read or write, so a peer that stops reading cannot
//! hold the relay open.

use std::io;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;

/// Default per-direction copy buffer size.
pub const DEFAULT_BUFFER_SIZE: usize = 16 * 1024;

/// Why a pump stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PumpEnd {
    /// Reader reached end of stream.
    Eof,
    /// Cancellation was observed before the next read.
    Cancelled,
}

/// Final result of both relay directions.
#[derive(Debug)]
pub struct RelayOutcome {
    /// Client → target direction.
    pub upstream: io::Result<PumpEnd>,
    /// Target → client direction.
    pub downstream: io::Result<PumpEnd>,
}

impl RelayOutcome {
    /// First I/O error of either direction.
    pub fn error(&self) -> Option<&io::Error> {
        self.upstream
            .as_ref()
            .err()
            .or_else(|| self.downstream.as_ref().err())
    }
}

/// Copy from `reader` to `writer` until EOF, error or cancellation.
///
/// `on_transfer` runs after every completed write with the chunk size. A
/// chunk whose write is interrupted by cancellation is not reported.
pub async fn pump<R, W, F>(
    reader: &mut R,
    writer: &mut W,
    buffer_size: usize,
    cancel: &CancellationToken,
    mut on_transfer: F,
) -> io::Result<PumpEnd>
where
    R: AsyncRead + Unpin + ?Sized,
    W: AsyncWrite + Unpin + ?Sized,
    F: FnMut(usize),
{
    let mut buf = vec![0u8; buffer_size.max(1)];

    loop {
        let n = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Ok(PumpEnd::Cancelled),
            result = reader.read(&mut buf) => result?,
        };

        if n == 0 {
            return Ok(PumpEnd::Eof);
        }

        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Ok(PumpEnd::Cancelled),
            result = writer.write_all(&buf[..n]) => result?,
        }
        on_transfer(n);
    }
}

/// Relay `client` and `target` in both directions until either side ends.
///
/// Both streams are dropped, and therefore closed, when this returns.
pub async fn relay_bidirectional<C, T, Up, Down>(
    client: C,
    target: T,
    buffer_size: usize,
    cancel: &CancellationToken,
    on_upstream: Up,
    on_downstream: Down,
) -> RelayOutcome
where
    C: AsyncRead + AsyncWrite,
    T: AsyncRead + AsyncWrite,
    Up: FnMut(usize),
    Down: FnMut(usize),
{
    let (mut client_reader, mut client_writer) = tokio::io::split(client);
    let (mut target_reader, mut target_writer) = tokio::io::split(target);

    // Either direction ending stops the other one
    let stop = cancel.child_token();

    let upstream = async {
        let result = pump(
            &mut client_reader,
            &mut target_writer,
            buffer_size,
            &stop,
            on_upstream,
        )
        .await;
        stop.cancel();
        result
    };

    let downstream = async {
        let result = pump(
            &mut target_reader,
            &mut client_writer,
            buffer_size,
            &stop,
            on_downstream,
        )
        .await;
        stop.cancel();
        result
    };

    let (upstream, downstream) = tokio::join!(upstream, downstream);
    RelayOutcome {
        upstream,
        downstream,
    }
}
