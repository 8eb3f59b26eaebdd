//! Domain identifiers.
//!
//! These are **pure data** — no I/O, no framework dependencies.

use std::fmt;

use uuid::Uuid;

/// Opaque room identifier, assigned by the embedding application.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RoomId(String);

impl RoomId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RoomId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Opaque user identifier, unique within a room.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct UserId(String);

impl UserId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Per-connection generation token.
///
/// A fresh 128-bit value is generated for every peer session. Feedback and
/// retransmission requests carry the generation they were aimed at, so
/// anything still referring to a replaced connection can be rejected.
/// A closed peer's generation is stamped with [`ConnectionId::CLOSED`].
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConnectionId(String);

impl ConnectionId {
    /// Tombstone generation of a closed peer. Never matches a live one.
    pub const CLOSED: &'static str = "CLOSED";

    /// Generate a fresh connection generation (canonical UUID v4 string).
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// The tombstone generation.
    pub fn closed() -> Self {
        Self(Self::CLOSED.to_owned())
    }

    pub fn is_closed(&self) -> bool {
        self.0 == Self::CLOSED
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
