//! Buffered line-chunk assembly with start-of-line escaping and
//! chunk-protocol framing.
//!
//! Arbitrary byte runs go in; line-delimited, escaped, size-framed
//! output comes out through the timed block writer.  A marker match may
//! span two calls: the matched-so-far count is carried in the buffer
//! state and resolved (confirmed or refuted) by the next call, so
//! output is identical however the input is split.

use async_trait::async_trait;

use crate::{context::TransportContext, error::TransportError, writer::Destination};

/// Default output buffer capacity.
pub const DEFAULT_BUFFER_SIZE: usize = 32 * 1024;

/// Smallest usable buffer: room for one escape sequence plus a line
/// ending on either side of the flush threshold.
const MIN_BUFFER_SIZE: usize = 64;

/// A start-of-line marker and its substitution.
///
/// Wherever `check` appears at the start of a line (including the start
/// of the stream), `escape` is emitted in its place.  The classic SMTP
/// case substitutes `.` with `..`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Escape {
    /// The marker looked for at line starts.
    pub check: String,
    /// What is emitted in its place.
    pub escape: String,
}

impl Escape {
    /// Classic SMTP dot-stuffing.
    #[must_use]
    pub fn smtp_dot() -> Self {
        Self {
            check: ".".into(),
            escape: "..".into(),
        }
    }
}

/// Flags accompanying a chunk announcement.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChunkFlags {
    /// This is the final chunk of the message.
    pub last: bool,
    /// Reap responses to previously pipelined protocol commands before
    /// (or instead of) announcing data.  May arrive with a zero size as
    /// a standalone request.
    pub reap: bool,
}

/// Chunk-protocol framing callback.
///
/// Invoked before each flush while chunk framing is active, and once to
/// announce the final chunk.  Any error aborts the whole write.
#[async_trait]
pub trait ChunkSink: Send {
    /// Announce `size` bytes about to be written to `target`.
    async fn chunk(
        &mut self,
        target: &mut Destination,
        size: u64,
        flags: ChunkFlags,
    ) -> Result<(), TransportError>;
}

/// Fixed-capacity output buffer plus the assembler's cross-call state.
///
/// Invariant: at the start of every byte, the cursor leaves headroom
/// for one escape sequence plus a line ending; the flush check below
/// restores it before it can be violated.
#[derive(Debug)]
pub struct OutputBuffer {
    data: Box<[u8]>,
    len: usize,
    /// Bytes of the marker provisionally matched at a line start and
    /// withheld from output.
    matched: usize,
    /// A carriage return seen in wire-format input and withheld until
    /// the next byte decides whether it belongs to a collapsed CRLF.
    pending_cr: bool,
    at_line_start: bool,
}

impl OutputBuffer {
    /// A buffer with the default capacity.
    #[must_use]
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_BUFFER_SIZE)
    }

    /// A buffer with the given capacity (clamped to a usable minimum).
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            data: vec![0; capacity.max(MIN_BUFFER_SIZE)].into_boxed_slice(),
            len: 0,
            matched: 0,
            pending_cr: false,
            at_line_start: true,
        }
    }

    /// Empty the buffer and clear all carried state.  The start of the
    /// stream counts as the start of a line.
    pub const fn reset(&mut self) {
        self.len = 0;
        self.matched = 0;
        self.pending_cr = false;
        self.at_line_start = true;
    }

    /// Bytes currently buffered.
    #[must_use]
    pub const fn len(&self) -> usize {
        self.len
    }

    /// Whether the buffer holds no bytes.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Total capacity.
    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.data.len()
    }

    fn extend(&mut self, bytes: &[u8]) {
        self.data[self.len..self.len + bytes.len()].copy_from_slice(bytes);
        self.len += bytes.len();
    }
}

impl Default for OutputBuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl TransportContext {
    /// Headroom kept free so one escape sequence plus a line ending
    /// always fits without flushing mid-emission.
    fn headroom(&self) -> usize {
        self.marker.as_ref().map_or(0, |m| m.escape.len()) + 2
    }

    /// Append `bytes` (one emission unit) to the buffer, flushing first
    /// when the headroom threshold is crossed.
    async fn put(&mut self, bytes: &[u8]) -> Result<(), TransportError> {
        let capacity = self.buffer.capacity();
        if self.buffer.len() > capacity - self.headroom()
            || self.buffer.len() + bytes.len() > capacity
        {
            self.flush_buffer().await?;
        }
        self.buffer.extend(bytes);
        Ok(())
    }

    /// Feed a byte run through the assembler.
    ///
    /// `wireformat` marks input that already carries CRLF line endings
    /// (spool files stored in wire form); such input is passed through
    /// when CRLF is wanted and has its CRs collapsed when it is not.
    /// Native input has bare `\n` converted to `\r\n` when CRLF is
    /// wanted.
    ///
    /// # Errors
    /// Propagates flush failures and chunk-callback rejections.
    pub async fn write_chunk(
        &mut self,
        chunk: &[u8],
        wireformat: bool,
    ) -> Result<(), TransportError> {
        let marker = self.marker.clone();
        let use_crlf = self.options.use_crlf;

        for &ch in chunk {
            // Resolve a marker match carried from earlier input.
            if self.buffer.matched > 0 {
                let Some(esc) = &marker else {
                    self.buffer.matched = 0;
                    continue;
                };
                let matched = self.buffer.matched;
                let check = esc.check.as_bytes();
                if ch == check[matched] {
                    if matched + 1 == check.len() {
                        self.buffer.matched = 0;
                        let escape = esc.escape.clone();
                        self.put(escape.as_bytes()).await?;
                    } else {
                        self.buffer.matched = matched + 1;
                    }
                    continue;
                }
                // Refuted: release the provisionally withheld bytes,
                // then treat the current byte as ordinary mid-line data.
                self.buffer.matched = 0;
                let withheld = check[..matched].to_vec();
                self.put(&withheld).await?;
            }

            // Resolve a withheld carriage return.
            if self.buffer.pending_cr {
                self.buffer.pending_cr = false;
                if ch == b'\n' {
                    self.put(b"\n").await?;
                    self.buffer.at_line_start = true;
                    continue;
                }
                self.put(b"\r").await?;
                self.buffer.at_line_start = false;
            }

            // Start-of-line marker substitution.
            if self.buffer.at_line_start
                && let Some(esc) = &marker
                && !esc.check.is_empty()
                && ch == esc.check.as_bytes()[0]
            {
                self.buffer.at_line_start = false;
                if esc.check.len() == 1 {
                    let escape = esc.escape.clone();
                    self.put(escape.as_bytes()).await?;
                } else {
                    self.buffer.matched = 1;
                }
                continue;
            }

            if ch == b'\n' {
                if use_crlf && !wireformat {
                    self.put(b"\r\n").await?;
                } else {
                    self.put(b"\n").await?;
                }
                self.buffer.at_line_start = true;
                continue;
            }

            if ch == b'\r' && wireformat && !use_crlf {
                self.buffer.pending_cr = true;
                continue;
            }

            self.put(&[ch]).await?;
            self.buffer.at_line_start = false;
        }

        Ok(())
    }

    /// Announce a chunk to the framing callback, when one is attached.
    pub(crate) async fn announce_chunk(
        &mut self,
        size: u64,
        flags: ChunkFlags,
    ) -> Result<(), TransportError> {
        let Self {
            target, chunker, ..
        } = self;
        if let Some(sink) = chunker.as_mut() {
            sink.chunk(target, size, flags).await?;
        }
        Ok(())
    }

    /// Drain the buffer through the timed block writer.  While chunk
    /// framing is active, the flush is announced first as a non-final
    /// chunk with a reap of pending responses.
    pub(crate) async fn flush_buffer(&mut self) -> Result<(), TransportError> {
        if self.buffer.is_empty() {
            return Ok(());
        }
        if self.chunking {
            let size = self.buffer.len() as u64;
            self.announce_chunk(
                size,
                ChunkFlags {
                    last: false,
                    reap: true,
                },
            )
            .await?;
        }
        let Self {
            target,
            buffer,
            timeout,
            bytes_written,
            ..
        } = self;
        target
            .write_block(&buffer.data[..buffer.len], *timeout, bytes_written)
            .await?;
        self.buffer.len = 0;
        Ok(())
    }

    /// Flush buffered bytes and the underlying stream.
    ///
    /// # Errors
    /// Propagates flush failures and chunk-callback rejections.
    pub async fn flush(&mut self) -> Result<(), TransportError> {
        self.flush_buffer().await?;
        self.target.flush().await
    }
}
