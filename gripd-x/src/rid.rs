//! Request identifiers.
//!
//! A ZHTTP sequence is addressed by a `(sender, id)` pair. The sender is the
//! instance identity of the originator; the id is unique within that sender.
//! Both sides of a request refer to the sequence by the same pair.

use std::fmt;

use bytes::Bytes;

/// Identifies one ZHTTP request/response sequence.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct Rid {
    /// Instance identity of the originator.
    pub sender: Bytes,

    /// Unique id within the sender.
    pub id: Bytes,
}

impl Rid {
    pub fn new(sender: impl Into<Bytes>, id: impl Into<Bytes>) -> Self {
        Self {
            sender: sender.into(),
            id: id.into(),
        }
    }
}

impl fmt::Display for Rid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}",
            String::from_utf8_lossy(&self.sender),
            String::from_utf8_lossy(&self.id)
        )
    }
}
