//! On-disk layout of a host's waiting record.
//!
//! A record is `count: u16 LE`, `sequence: u16 LE`, then `count`
//! fixed-width message ids packed back to back with no delimiter.
//! The primary record for a host lives under the key `<host>`;
//! overflowed blocks live under `<host>:<generation>`, where the
//! continuation's own `sequence` field holds its generation.

use crate::types::{MESSAGE_ID_WIDTH, MessageId};

/// Most ids one record may carry before it overflows into a
/// continuation. A stored count beyond this is treated as corruption
/// on the lookup path.
pub const MAX_IDS_PER_RECORD: usize = 50;

/// Byte length of the `count` + `sequence` header.
const HEADER_LEN: usize = 4;

/// One host's set of waiting message ids, plus the next continuation
/// generation to allocate.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WaitingRecord {
    /// Next continuation generation; continuations exist for every
    /// generation below this.
    pub sequence: u16,
    /// The waiting message ids, oldest first.
    pub ids: Vec<MessageId>,
}

/// A record that failed to decode. Carries the parsed `sequence` when
/// the header itself was readable, so the caller can purge the whole
/// continuation chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordCorruption {
    /// The corrupt record's continuation counter, when recoverable.
    pub sequence: Option<u16>,
}

impl WaitingRecord {
    /// An empty record with no continuations.
    #[must_use]
    pub const fn empty() -> Self {
        Self {
            sequence: 0,
            ids: Vec::new(),
        }
    }

    /// Whether the record has reached its per-record id capacity.
    #[must_use]
    pub fn is_full(&self) -> bool {
        self.ids.len() >= MAX_IDS_PER_RECORD
    }

    /// Serialize to the fixed wire layout.
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let count = u16::try_from(self.ids.len()).unwrap_or(u16::MAX);
        let mut bytes = Vec::with_capacity(HEADER_LEN + self.ids.len() * MESSAGE_ID_WIDTH);
        bytes.extend_from_slice(&count.to_le_bytes());
        bytes.extend_from_slice(&self.sequence.to_le_bytes());
        for id in &self.ids {
            bytes.extend_from_slice(id.to_string().as_bytes());
        }
        bytes
    }

    /// Parse the fixed wire layout.
    ///
    /// # Errors
    /// A short header, a length that disagrees with `count`, or any
    /// id that is not a well-formed fixed-width identifier.
    pub fn decode(bytes: &[u8]) -> Result<Self, RecordCorruption> {
        if bytes.len() < HEADER_LEN {
            return Err(RecordCorruption { sequence: None });
        }

        let count = usize::from(u16::from_le_bytes([bytes[0], bytes[1]]));
        let sequence = u16::from_le_bytes([bytes[2], bytes[3]]);
        let corrupt = RecordCorruption {
            sequence: Some(sequence),
        };

        let body = &bytes[HEADER_LEN..];
        if body.len() != count * MESSAGE_ID_WIDTH {
            return Err(corrupt);
        }

        let mut ids = Vec::with_capacity(count);
        for packed in body.chunks_exact(MESSAGE_ID_WIDTH) {
            let Some(id) = MessageId::from_record_bytes(packed) else {
                return Err(corrupt);
            };
            ids.push(id);
        }

        Ok(Self { sequence, ids })
    }
}
