//! Per-delivery transport context.

use std::time::Duration;

use crate::{
    address::RecipientChain,
    assembler::{ChunkSink, Escape, OutputBuffer},
    options::WriteOptions,
    writer::Destination,
};

/// Ephemeral state for one delivery attempt.
///
/// Owned exclusively by the call that created it; a fresh context (or an
/// explicit [`reset`](Self::reset)) precedes every independent write
/// sequence.  The output buffer and its partial-match state live here
/// rather than in process-wide statics, so two contexts never share
/// assembler state.
pub struct TransportContext {
    /// Where the message bytes go.
    pub target: Destination,
    /// Output policy for this delivery.
    pub options: WriteOptions,
    /// Deadline budget for each block write.
    pub timeout: Option<Duration>,
    /// Optional cap on transmitted body bytes.
    pub size_limit: Option<u64>,
    /// Start-of-line marker substitution, when the protocol needs it.
    pub marker: Option<Escape>,
    /// Chunk-framing callback, used only when `options.chunked` is set.
    pub chunker: Option<Box<dyn ChunkSink>>,
    /// The address chain being delivered.
    pub chain: RecipientChain,
    /// Indices into `chain` of the addresses this attempt covers.
    pub delivered: Vec<usize>,
    /// Envelope sender for the synthesized `Return-path:` header.
    pub return_path: Option<String>,
    /// Running count of bytes actually written to the target.
    pub bytes_written: u64,
    pub(crate) buffer: OutputBuffer,
    pub(crate) chunking: bool,
}

impl std::fmt::Debug for TransportContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportContext")
            .field("target", &self.target)
            .field("options", &self.options)
            .field("timeout", &self.timeout)
            .field("size_limit", &self.size_limit)
            .field("marker", &self.marker)
            .field("bytes_written", &self.bytes_written)
            .field("chunking", &self.chunking)
            .finish_non_exhaustive()
    }
}

impl TransportContext {
    /// A context writing to `target` under `options`.
    #[must_use]
    pub fn new(target: Destination, options: WriteOptions) -> Self {
        Self {
            target,
            options,
            timeout: None,
            size_limit: None,
            marker: None,
            chunker: None,
            chain: RecipientChain::default(),
            delivered: Vec::new(),
            return_path: None,
            bytes_written: 0,
            buffer: OutputBuffer::new(),
            chunking: options.chunked,
        }
    }

    /// Set the per-block write deadline.
    #[must_use]
    pub const fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Cap the number of transmitted body bytes.
    #[must_use]
    pub const fn with_size_limit(mut self, limit: u64) -> Self {
        self.size_limit = Some(limit);
        self
    }

    /// Configure start-of-line marker substitution.
    #[must_use]
    pub fn with_marker(mut self, marker: Escape) -> Self {
        self.marker = Some(marker);
        self
    }

    /// Attach the chunk-framing callback.
    #[must_use]
    pub fn with_chunker(mut self, chunker: Box<dyn ChunkSink>) -> Self {
        self.chunker = Some(chunker);
        self
    }

    /// Attach the recipient chain and the delivered subset.
    #[must_use]
    pub fn with_recipients(mut self, chain: RecipientChain, delivered: Vec<usize>) -> Self {
        self.chain = chain;
        self.delivered = delivered;
        self
    }

    /// Set the envelope sender used for `Return-path:`.
    #[must_use]
    pub fn with_return_path(mut self, return_path: impl Into<String>) -> Self {
        self.return_path = Some(return_path.into());
        self
    }

    /// Use a buffer of `capacity` bytes instead of the default.
    #[must_use]
    pub fn with_buffer_capacity(mut self, capacity: usize) -> Self {
        self.buffer = OutputBuffer::with_capacity(capacity);
        self
    }

    /// Prepare the context for an independent write sequence: empties
    /// the buffer, clears partial-match state, and re-arms chunk
    /// framing from the options.
    pub fn reset(&mut self) {
        self.buffer.reset();
        self.chunking = self.options.chunked;
    }

    /// Stop framing output as protocol chunks for the rest of the call.
    pub(crate) const fn disable_chunking(&mut self) {
        self.chunking = false;
    }
}
