//! The transport's view of a spooled message.

use std::{io, path::Path};

use tokio::fs::File;

use crate::types::MessageId;

/// One stored header line (or continuation block) of the message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    /// Raw header text including the trailing newline.
    pub text: String,
    /// Set when the header was superseded or removed during routing;
    /// such headers are never transmitted.
    pub removed: bool,
}

impl Header {
    /// A live header, newline-terminated.
    #[must_use]
    pub fn new(text: impl Into<String>) -> Self {
        let mut text = text.into();
        if !text.ends_with('\n') {
            text.push('\n');
        }
        Self {
            text,
            removed: false,
        }
    }

    /// The header name, without the colon.
    #[must_use]
    pub fn name(&self) -> &str {
        self.text
            .split_once(':')
            .map_or(self.text.trim_end(), |(name, _)| name.trim())
    }
}

/// A spooled message ready for transmission: the parsed header list
/// plus a data file positioned at a known body offset.
#[derive(Debug)]
pub struct MessageSource {
    /// Identifier of the queued message.
    pub id: MessageId,
    /// Ordered header list from the spool.
    pub headers: Vec<Header>,
    /// The spool data file, when a body is present.
    pub body: Option<File>,
    /// Offset of the first body byte in the data file.
    pub body_offset: u64,
    /// Number of body bytes after the offset.
    pub body_size: u64,
    /// Body line count from the spool metadata; used to approximate the
    /// size of LF-to-CRLF expansion without rescanning the file.
    pub body_line_count: u64,
    /// Whether the body is already in wire form (CRLF line endings, no
    /// start-of-line escaping required at rest).
    pub wire_format: bool,
}

impl MessageSource {
    /// A message with headers only; useful for deliveries with the body
    /// suppressed and for tests.
    #[must_use]
    pub fn headers_only(id: MessageId, headers: Vec<Header>) -> Self {
        Self {
            id,
            headers,
            body: None,
            body_offset: 0,
            body_size: 0,
            body_line_count: 0,
            wire_format: false,
        }
    }

    /// Open a message whose body lives in `path` starting at
    /// `body_offset`.  The body size is taken from file metadata.
    ///
    /// # Errors
    /// When the data file cannot be opened or inspected.
    pub async fn open(
        id: MessageId,
        headers: Vec<Header>,
        path: &Path,
        body_offset: u64,
        body_line_count: u64,
        wire_format: bool,
    ) -> io::Result<Self> {
        let body = File::open(path).await?;
        let len = body.metadata().await?.len();
        Ok(Self {
            id,
            headers,
            body: Some(body),
            body_offset,
            body_size: len.saturating_sub(body_offset),
            body_line_count,
            wire_format,
        })
    }
}
