//! Outbound message transmission core
//!
//! This crate provides the pieces a mail transport needs to put a
//! spooled message on the wire:
//! - Deadline-bounded block writing with transient-error retry
//! - Line-oriented output assembly: dot-stuffing, CRLF conversion,
//!   and chunked (BDAT-style) framing through a caller callback
//! - Header block assembly with removal, rewriting, and synthetic
//!   `Return-path` / `Envelope-to` / `Delivery-date` headers
//! - Delivery through an external filter program
//! - A host-keyed waiting store for connection reuse

pub mod address;
pub mod assembler;
pub mod context;
pub mod error;
mod filter;
mod headers;
pub mod message;
pub mod options;
pub mod pipeline;
pub mod types;
pub mod waiting;
pub mod writer;

// Re-export the delivery surface
pub use address::{DeliveryOutcome, Recipient, RecipientChain};
pub use assembler::{ChunkFlags, ChunkSink, Escape, OutputBuffer};
pub use context::TransportContext;
// Re-export error types
pub use error::{FilterError, StoreError, TransportError};
pub use message::{Header, MessageSource};
pub use options::{Expander, Expansion, FilterConfig, Rewriter, TransportOptions, WriteOptions};
pub use pipeline::write_message;
pub use types::{MESSAGE_ID_WIDTH, MessageId};
// Re-export the connection-reuse store
pub use waiting::{
    FileRecordStore, MemoryRecordStore, RecordStore, WaitingRecord, WaitingStore,
};
pub use writer::Destination;
