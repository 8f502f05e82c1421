//! Output-policy options and transport configuration.

use std::{fmt, sync::Arc, time::Duration};

use serde::Deserialize;

/// Per-write output policy.
///
/// One instance accompanies each delivery attempt; the transport driver
/// sets the combination its protocol hop needs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct WriteOptions {
    /// Convert bare `\n` to `\r\n` on the wire.
    pub use_crlf: bool,
    /// Synthesize a `Return-path:` header from the envelope sender.
    pub add_return_path: bool,
    /// Synthesize `Envelope-to:` from the recipient chain, collapsing
    /// duplicates to their original envelope addresses.
    pub add_envelope_to: bool,
    /// Synthesize a `Delivery-date:` header.
    pub add_delivery_date: bool,
    /// Suppress the stored headers entirely.
    pub suppress_headers: bool,
    /// Suppress the body entirely.
    pub suppress_body: bool,
    /// Frame output as size-prefixed protocol chunks (BDAT style).
    pub chunked: bool,
    /// More message data follows this write: even the closing chunk is
    /// announced as non-final.
    pub more_data: bool,
    /// Append the classic end-of-data terminator line.
    pub end_dot: bool,
}

/// Outcome of a string expansion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Expansion {
    /// The expanded text.
    Text(String),
    /// The expansion failed in the expected, configured way; the item
    /// is skipped rather than treated as an error.
    Forced,
}

/// Expansion hook applied to removal patterns and added headers.
///
/// An `Err` is a genuine failure and aborts the header pass; `Forced`
/// skips the item.  Shared via `Arc` so the filter writer task can use
/// the same hooks as the calling context.
pub type Expander = Arc<dyn Fn(&str) -> Result<Expansion, String> + Send + Sync>;

/// Rewrite hook applied to each transmitted header.  `None` means the
/// rewrite was a no-op and the original text is used unchanged.
pub type Rewriter = Arc<dyn Fn(&str) -> Option<String> + Send + Sync>;

/// External filter program configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct FilterConfig {
    /// Program and arguments.
    pub command: Vec<String>,
    /// Per-read deadline while copying the filter's output.
    #[serde(default = "FilterConfig::default_timeout_secs")]
    pub timeout_secs: u64,
}

impl FilterConfig {
    const fn default_timeout_secs() -> u64 {
        300
    }

    /// The per-read deadline as a [`Duration`].
    #[must_use]
    pub const fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// Transport-level configuration consumed by the write pipeline.
#[derive(Clone, Default, Deserialize)]
#[serde(default)]
pub struct TransportOptions {
    /// Header removal patterns; a trailing `*` matches any header whose
    /// name starts with the prefix.  Each pattern is expanded first.
    pub remove_headers: Vec<String>,
    /// Header text to append after the stored headers.  Each item is
    /// expanded, split on newlines, and every line is forced to end in
    /// a newline.
    pub add_headers: Vec<String>,
    /// External filter program, when configured.
    pub filter: Option<FilterConfig>,
    /// Upper bound on messages sent over one connection; `None` defers
    /// to the caller-supplied limit.
    pub max_connection_reuse: Option<u32>,
    /// Expansion hook for removal patterns and added headers.
    #[serde(skip)]
    pub expand: Option<Expander>,
    /// Header rewrite hook.
    #[serde(skip)]
    pub rewrite: Option<Rewriter>,
}

impl fmt::Debug for TransportOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransportOptions")
            .field("remove_headers", &self.remove_headers)
            .field("add_headers", &self.add_headers)
            .field("filter", &self.filter)
            .field("max_connection_reuse", &self.max_connection_reuse)
            .field("expand", &self.expand.as_ref().map(|_| "<hook>"))
            .field("rewrite", &self.rewrite.as_ref().map(|_| "<hook>"))
            .finish()
    }
}

impl TransportOptions {
    /// Run the configured expansion hook over `text`.
    ///
    /// Without a hook, expansion is the identity.
    ///
    /// # Errors
    /// Propagates a genuine (non-forced) expansion failure.
    pub fn expand(&self, text: &str) -> Result<Expansion, String> {
        self.expand
            .as_ref()
            .map_or_else(|| Ok(Expansion::Text(text.to_string())), |hook| hook(text))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expansion_defaults_to_identity() {
        let options = TransportOptions::default();
        assert_eq!(
            options.expand("X-Header"),
            Ok(Expansion::Text("X-Header".to_string()))
        );
    }

    #[test]
    fn write_options_deserialize_with_defaults() {
        let options: WriteOptions =
            toml::from_str("use_crlf = true\nend_dot = true\n").expect("valid options");
        assert!(options.use_crlf);
        assert!(options.end_dot);
        assert!(!options.chunked);
        assert!(!options.suppress_body);
    }

    #[test]
    fn transport_options_deserialize_filter_command() {
        let options: TransportOptions = toml::from_str(
            "remove_headers = [\"X-Internal-*\"]\n\
             [filter]\n\
             command = [\"/usr/bin/cat\"]\n",
        )
        .expect("valid options");
        let filter = options.filter.expect("filter configured");
        assert_eq!(filter.command, vec!["/usr/bin/cat".to_string()]);
        assert_eq!(filter.timeout(), Duration::from_secs(300));
        assert_eq!(options.remove_headers, vec!["X-Internal-*".to_string()]);
    }
}
