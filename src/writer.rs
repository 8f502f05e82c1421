//! The low-level timed block writer and its destinations.
//!
//! `write_block` places an exact-length byte block on the destination,
//! retrying transient conditions under a deadline budget.  Everything
//! above it (the assembler, the pipelines) funnels through here, so the
//! retry and timeout contract lives in exactly one place.

use std::time::Duration;

use tokio::{
    io::{AsyncWrite, AsyncWriteExt},
    time::{Instant, sleep, timeout},
};

use crate::error::TransportError;

/// Upper bound on write attempts for one block.  Exceeding it surfaces
/// as [`TransportError::WriteIncomplete`] rather than a generic I/O
/// error.
const MAX_WRITE_ATTEMPTS: u32 = 100;

/// Pause before retrying a would-block or not-yet-connected target.
const CONGESTION_PAUSE: Duration = Duration::from_millis(50);

/// Where transmitted bytes go.
///
/// A stream destination is any async byte sink: a socket, a pipe, or a
/// TLS session's write half.  The `encrypted` flag records the latter,
/// which disables the bulk-copy fast path.  A sink destination captures
/// output in memory for callers that assemble a message into a buffer.
pub enum Destination {
    /// An async stream (socket, pipe, or TLS write half).
    Stream {
        io: Box<dyn AsyncWrite + Send + Unpin>,
        encrypted: bool,
    },
    /// A growable in-memory byte sink.
    Sink(Vec<u8>),
}

impl std::fmt::Debug for Destination {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Stream { encrypted, .. } => f
                .debug_struct("Stream")
                .field("encrypted", encrypted)
                .finish_non_exhaustive(),
            Self::Sink(data) => f.debug_tuple("Sink").field(&data.len()).finish(),
        }
    }
}

impl Destination {
    /// A plaintext stream destination.
    pub fn stream(io: impl AsyncWrite + Send + Unpin + 'static) -> Self {
        Self::Stream {
            io: Box::new(io),
            encrypted: false,
        }
    }

    /// A TLS stream destination.
    pub fn encrypted_stream(io: impl AsyncWrite + Send + Unpin + 'static) -> Self {
        Self::Stream {
            io: Box::new(io),
            encrypted: true,
        }
    }

    /// A fresh in-memory sink.
    #[must_use]
    pub const fn sink() -> Self {
        Self::Sink(Vec::new())
    }

    /// Whether this is a TLS stream.
    #[must_use]
    pub const fn is_encrypted(&self) -> bool {
        matches!(self, Self::Stream { encrypted: true, .. })
    }

    /// Whether this is a stream (rather than an in-memory sink).
    #[must_use]
    pub const fn is_stream(&self) -> bool {
        matches!(self, Self::Stream { .. })
    }

    /// Recover the captured bytes from a sink destination.
    #[must_use]
    pub fn into_sink(self) -> Option<Vec<u8>> {
        match self {
            Self::Sink(data) => Some(data),
            Self::Stream { .. } => None,
        }
    }

    /// Write all of `block`, retrying transient conditions, under an
    /// optional overall deadline.  `counter` advances by exactly the
    /// bytes written, even when the write ultimately fails.
    ///
    /// # Errors
    /// - [`TransportError::Timeout`] when the deadline fires first
    /// - [`TransportError::WriteIncomplete`] when the attempt budget is
    ///   exhausted
    /// - [`TransportError::Io`] for any non-transient failure, preserved
    pub async fn write_block(
        &mut self,
        block: &[u8],
        deadline: Option<Duration>,
        counter: &mut u64,
    ) -> Result<(), TransportError> {
        match self {
            Self::Sink(data) => {
                data.extend_from_slice(block);
                *counter += block.len() as u64;
                Ok(())
            }
            Self::Stream { io, .. } => {
                write_block_timed(io.as_mut(), block, deadline, counter).await
            }
        }
    }

    /// Flush any bytes the underlying stream is holding.
    ///
    /// # Errors
    /// Propagates the stream's flush failure.
    pub async fn flush(&mut self) -> Result<(), TransportError> {
        if let Self::Stream { io, .. } = self {
            io.flush().await?;
        }
        Ok(())
    }

    /// Flush and close the destination's write side.  Used to signal
    /// end-of-input on a pipe.
    ///
    /// # Errors
    /// Propagates the stream's shutdown failure.
    pub async fn shutdown(&mut self) -> Result<(), TransportError> {
        if let Self::Stream { io, .. } = self {
            io.shutdown().await?;
        }
        Ok(())
    }
}

async fn write_block_timed(
    io: &mut (dyn AsyncWrite + Send + Unpin),
    block: &[u8],
    deadline: Option<Duration>,
    counter: &mut u64,
) -> Result<(), TransportError> {
    let expires = deadline.map(|limit| Instant::now() + limit);
    let mut offset = 0;
    let mut attempts = 0;
    let mut retried_unconnected = false;

    while offset < block.len() {
        attempts += 1;
        if attempts > MAX_WRITE_ATTEMPTS {
            return Err(TransportError::WriteIncomplete {
                written: offset,
                expected: block.len(),
                attempts: MAX_WRITE_ATTEMPTS,
            });
        }

        let result = match expires {
            Some(at) => {
                let remaining = at.saturating_duration_since(Instant::now());
                if remaining.is_zero() {
                    return Err(TransportError::Timeout(deadline.unwrap_or_default()));
                }
                match timeout(remaining, io.write(&block[offset..])).await {
                    // The deadline fired mid-write: a timeout, whatever
                    // the underlying call would have returned.
                    Err(_) => return Err(TransportError::Timeout(deadline.unwrap_or_default())),
                    Ok(result) => result,
                }
            }
            None => io.write(&block[offset..]).await,
        };

        match result {
            Ok(0) => {
                return Err(TransportError::Io(std::io::Error::new(
                    std::io::ErrorKind::WriteZero,
                    "destination accepted no bytes",
                )));
            }
            Ok(written) => {
                offset += written;
                *counter += written as u64;
            }
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {
                // Retry with no bytes consumed.
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                tracing::trace!(offset, attempts, "destination congested, pausing");
                sleep(CONGESTION_PAUSE).await;
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotConnected && !retried_unconnected => {
                // A not-yet-connected socket gets exactly one more try.
                retried_unconnected = true;
                sleep(CONGESTION_PAUSE).await;
            }
            Err(e) => return Err(TransportError::Io(e)),
        }
    }

    Ok(())
}
