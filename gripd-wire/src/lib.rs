//! Wire formats for gripd.
//!
//! Everything that crosses the bus is a typed nested value in a
//! self-describing framing (see [`tnetstring`]), prefixed with a one-byte
//! format tag. Packet readers ignore unknown map keys so old peers keep
//! working as fields are added.

pub mod accept;
pub mod stats;
pub mod tnetstring;
pub mod wscontrol;
pub mod zhttp;

pub use tnetstring::TnValue;

use thiserror::Error;

#[derive(Debug, Error, PartialEq)]
pub enum WireError {
    #[error("truncated input")]
    Truncated,

    #[error("malformed encoding: {0}")]
    Malformed(&'static str),

    #[error("missing field '{0}'")]
    FieldMissing(&'static str),

    #[error("field '{0}' has wrong type")]
    FieldType(&'static str),

    #[error("field '{0}' has invalid value")]
    FieldValue(&'static str),
}

pub type Result<T> = std::result::Result<T, WireError>;
