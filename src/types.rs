//! Message identifiers shared between the spool and the waiting store.

use std::{fmt, path::Path, str::FromStr};

/// Width of a message id in the waiting store's packed record layout.
///
/// This is the length of a ULID string, and matches the spool-file
/// naming convention (`<id>.eml`).
pub const MESSAGE_ID_WIDTH: usize = 26;

/// Identifier of a queued message.
///
/// A 26-character ULID string.  Ids are lexicographically sortable by
/// creation time and collision-resistant, and the fixed width lets the
/// waiting store pack them with no delimiters.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MessageId {
    id: ulid::Ulid,
}

impl MessageId {
    /// Generate a new unique message id.
    #[must_use]
    pub fn generate() -> Self {
        Self {
            id: ulid::Ulid::new(),
        }
    }

    /// Parse an id from the fixed-width form used in waiting-store
    /// records.  Returns `None` when the bytes do not have the expected
    /// shape; callers treat that as record corruption.
    #[must_use]
    pub fn from_record_bytes(bytes: &[u8]) -> Option<Self> {
        if bytes.len() != MESSAGE_ID_WIDTH {
            return None;
        }
        let text = std::str::from_utf8(bytes).ok()?;
        let id = ulid::Ulid::from_string(text).ok()?;
        Some(Self { id })
    }

    /// The name of this message's spool data file.
    #[must_use]
    pub fn data_file_name(&self) -> String {
        format!("{}.eml", self.id)
    }

    /// Whether this message's spool data file exists under `spool_dir`.
    #[must_use]
    pub fn spool_data_exists(&self, spool_dir: &Path) -> bool {
        spool_dir.join(self.data_file_name()).is_file()
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.id)
    }
}

impl FromStr for MessageId {
    type Err = ulid::DecodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self {
            id: ulid::Ulid::from_string(s)?,
        })
    }
}

impl serde::Serialize for MessageId {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.id.to_string())
    }
}

impl<'de> serde::Deserialize<'de> for MessageId {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}
