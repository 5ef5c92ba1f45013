//! Message correlation identifiers.

use std::fmt;
use std::str::FromStr;

use uuid::Uuid;

/// Correlation id carried on every frame of a request (spec.md §3).
///
/// Equality is within-variant only: `Uuid(Uuid::nil())` is never equal to
/// `Uint(0)` even though both "look like zero".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageId {
    /// A 16-byte UUID, as generated by request initiators.
    Uuid(Uuid),
    /// A 64-bit unsigned integer, used by e.g. the handshake's default id.
    Uint(u64),
}

impl MessageId {
    /// Generate a fresh random (v4) UUID id.
    #[must_use]
    pub fn new_uuid() -> Self {
        Self::Uuid(Uuid::new_v4())
    }

    /// The canonical string form used as a routing map key
    /// (`message_id_str` in spec.md §3).
    #[must_use]
    pub fn as_key(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Uuid(u) => write!(f, "{u}"),
            Self::Uint(n) => write!(f, "{n}"),
        }
    }
}

/// Error returned when a string is neither a UUID nor a decimal integer.
#[derive(Debug, Clone, thiserror::Error)]
#[error("invalid message id: {0:?}")]
pub struct ParseMessageIdError(String);

impl FromStr for MessageId {
    type Err = ParseMessageIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Ok(uuid) = Uuid::parse_str(s) {
            return Ok(Self::Uuid(uuid));
        }
        if let Ok(n) = s.parse::<u64>() {
            return Ok(Self::Uint(n));
        }
        Err(ParseMessageIdError(s.to_string()))
    }
}
