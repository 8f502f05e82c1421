//! Header selection, rewriting, and synthesis.
//!
//! Builds the header block for one delivery: synthesized headers first
//! (return path, collapsed envelope recipients, delivery date), then the
//! stored headers filtered through removal lists and the rewrite hook,
//! then per-recipient and transport-level additions, then the blank
//! separator line.

use crate::{
    context::TransportContext,
    error::TransportError,
    message::{Header, MessageSource},
    options::{Expansion, TransportOptions},
};

/// Cap on the accumulated header block.  Overflow truncates with a
/// visible marker rather than aborting the transmission.
const HEADER_BUFFER_LIMIT: usize = 64 * 1024;

/// Marker appended when the header block had to be truncated.
const TRUNCATED_MARKER: &str = "*** truncated ***\n";

/// Bounded header accumulator.
struct HeaderSink {
    buf: Vec<u8>,
    truncated: bool,
}

impl HeaderSink {
    const fn new() -> Self {
        Self {
            buf: Vec::new(),
            truncated: false,
        }
    }

    /// Append header text, forcing a trailing newline.  Once the limit
    /// is hit the block is truncated, marked, and further text dropped.
    fn push(&mut self, text: &str) {
        if self.truncated {
            return;
        }
        if self.buf.len() + text.len() > HEADER_BUFFER_LIMIT {
            self.truncated = true;
            tracing::warn!(
                limit = HEADER_BUFFER_LIMIT,
                "header block exceeds buffer limit, truncating"
            );
            if self.buf.last() != Some(&b'\n') {
                self.buf.push(b'\n');
            }
            self.buf.extend_from_slice(TRUNCATED_MARKER.as_bytes());
            return;
        }
        self.buf.extend_from_slice(text.as_bytes());
        if !text.ends_with('\n') {
            self.buf.push(b'\n');
        }
    }

    /// Close the block with the header/body separator.  Always emitted,
    /// truncation notwithstanding.
    fn finish(mut self) -> Vec<u8> {
        self.buf.push(b'\n');
        self.buf
    }
}

/// Whether `pattern` selects the header named `name`.  A trailing `*`
/// matches any name beginning with the prefix; comparison ignores case.
fn pattern_matches(name: &str, pattern: &str) -> bool {
    let name = name.to_ascii_lowercase();
    pattern.strip_suffix('*').map_or_else(
        || name == pattern.to_ascii_lowercase(),
        |prefix| name.starts_with(&prefix.to_ascii_lowercase()),
    )
}

/// Whether any removal pattern (transport-wide or attached to one of
/// the delivered addresses) selects `header`.
///
/// Patterns pass through the expansion hook first; a forced expansion
/// failure skips the pattern, a genuine one aborts the header pass.
fn is_removed(
    header: &Header,
    ctx: &TransportContext,
    options: &TransportOptions,
) -> Result<bool, TransportError> {
    let name = header.name();
    let per_address = ctx
        .delivered
        .iter()
        .filter_map(|&index| ctx.chain.get(index))
        .flat_map(|recipient| recipient.remove_headers.iter());
    for pattern in options.remove_headers.iter().chain(per_address) {
        match options.expand(pattern) {
            Ok(Expansion::Text(expanded)) => {
                if !expanded.is_empty() && pattern_matches(name, &expanded) {
                    return Ok(true);
                }
            }
            Ok(Expansion::Forced) => {}
            Err(reason) => {
                return Err(TransportError::HeaderChange(format!(
                    "expansion of removal pattern {pattern:?} failed: {reason}"
                )));
            }
        }
    }
    Ok(false)
}

/// Build the complete header block for this delivery.
///
/// # Errors
/// [`TransportError::HeaderChange`] when a removal-pattern or
/// add-headers expansion genuinely fails.
pub(crate) fn assemble_headers(
    ctx: &TransportContext,
    source: &MessageSource,
    options: &TransportOptions,
) -> Result<Vec<u8>, TransportError> {
    let mut sink = HeaderSink::new();

    if ctx.options.add_return_path {
        let sender = ctx.return_path.as_deref().unwrap_or_default();
        sink.push(&format!("Return-path: <{sender}>\n"));
    }

    if ctx.options.add_envelope_to {
        let addresses = ctx.chain.envelope_addresses(&ctx.delivered);
        if !addresses.is_empty() {
            // One header; continuation items are comma/newline joined
            // with the first item unprefixed.
            sink.push(&format!("Envelope-to: {}\n", addresses.join(",\n ")));
        }
    }

    if ctx.options.add_delivery_date {
        sink.push(&format!(
            "Delivery-date: {}\n",
            chrono::Local::now().to_rfc2822()
        ));
    }

    for header in &source.headers {
        if header.removed || is_removed(header, ctx, options)? {
            continue;
        }
        // A no-op rewrite falls back to the unmodified header.
        let rewritten = options
            .rewrite
            .as_ref()
            .and_then(|rewrite| rewrite(&header.text));
        match rewritten {
            Some(text) => sink.push(&text),
            None => sink.push(&header.text),
        }
    }

    // Address-attached headers, in original order.
    for &index in &ctx.delivered {
        if let Some(recipient) = ctx.chain.get(index) {
            for extra in &recipient.extra_headers {
                sink.push(extra);
            }
        }
    }

    // Transport-level additions: expanded, one newline-separated item
    // at a time, each forced to end in a newline.
    for item in &options.add_headers {
        match options.expand(item) {
            Ok(Expansion::Text(expanded)) => {
                for line in expanded.split('\n').filter(|line| !line.is_empty()) {
                    sink.push(line);
                }
            }
            Ok(Expansion::Forced) => {}
            Err(reason) => {
                return Err(TransportError::HeaderChange(format!(
                    "expansion of added header {item:?} failed: {reason}"
                )));
            }
        }
    }

    Ok(sink.finish())
}
