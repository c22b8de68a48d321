//! ## Error Module
//!
//! Defines [`TpError`], the error type used across the Template Provider:
//! socket I/O, the Noise session, message (de)serialization, key handling
//! and template assembly all funnel into it.

use std::fmt;

/// Errors that can occur while running the Template Provider.
#[derive(Debug)]
pub enum TpError {
    /// I/O-related error.
    Io(std::io::Error),
    /// Error from the Noise session engine.
    Noise(tp_noise::Error),
    /// Error while encoding or decoding an sv2 message.
    Message(tp_messages::Error),
    /// A configured key was not valid hex.
    KeyEncoding(hex::FromHexError),
    /// A configured key was not a valid secp256k1 key.
    Key(secp256k1::Error),
    /// The chain source failed to assemble a template.
    ChainSource(String),
    /// Configuration file could not be parsed.
    Config(String),
    /// A solved or assembled block was structurally incomplete.
    BadBlock(String),
}

pub type TpResult<T> = Result<T, TpError>;

impl fmt::Display for TpError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        use TpError::*;
        match self {
            Io(e) => write!(f, "I/O error: `{:?}`", e),
            Noise(e) => write!(f, "Noise session error: `{}`", e),
            Message(e) => write!(f, "Sv2 message error: `{}`", e),
            KeyEncoding(e) => write!(f, "Key encoding error: `{:?}`", e),
            Key(e) => write!(f, "Key error: `{:?}`", e),
            ChainSource(e) => write!(f, "Chain source error: {}", e),
            Config(e) => write!(f, "Configuration error: {}", e),
            BadBlock(e) => write!(f, "Bad block: {}", e),
        }
    }
}

impl std::error::Error for TpError {}

impl From<std::io::Error> for TpError {
    fn from(e: std::io::Error) -> Self {
        TpError::Io(e)
    }
}

impl From<tp_noise::Error> for TpError {
    fn from(e: tp_noise::Error) -> Self {
        TpError::Noise(e)
    }
}

impl From<tp_messages::Error> for TpError {
    fn from(e: tp_messages::Error) -> Self {
        TpError::Message(e)
    }
}

impl From<hex::FromHexError> for TpError {
    fn from(e: hex::FromHexError) -> Self {
        TpError::KeyEncoding(e)
    }
}

impl From<secp256k1::Error> for TpError {
    fn from(e: secp256k1::Error) -> Self {
        TpError::Key(e)
    }
}
