//! Error types for chain decoding and inbound identity validation.

use thiserror::Error;

use crate::remote::BusError;

/// Errors produced while decoding a wire-encoded chain or credential.
///
/// A malformed payload is fatal to the decode call; it is never silently
/// ignored and never partially decoded.
#[derive(Debug, Error)]
pub enum ChainCodecError {
    #[error("unrecognized context tag {}", hex::encode(.0))]
    UnknownTag([u8; 4]),

    #[error("unrecognized wire version: {0:#04x}")]
    UnknownVersion(u8),

    #[error("payload truncated at offset {0}")]
    Truncated(usize),

    #[error("malformed {0} field")]
    MalformedField(&'static str),

    #[error("trailing bytes after payload")]
    TrailingBytes,
}

/// Errors produced while validating an inbound identity against the bus.
#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("login {login_id} rejected by the bus")]
    Invalid { login_id: String },

    #[error("bus error: {0}")]
    Bus(#[from] BusError),
}
