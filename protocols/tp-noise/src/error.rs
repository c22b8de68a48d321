use core::fmt;

use crate::SIGNATURE_NOISE_MESSAGE_SIZE;

/// Errors produced by the Noise session engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// AEAD encryption or decryption failed (bad MAC or oversized buffer).
    AeadFailure,
    /// The nonce counter would wrap; the cipher state must not be reused.
    NonceOverflow,
    /// A handshake or transport buffer had an unexpected length.
    InvalidMessageLength,
    /// The responder's certificate is expired or not signed by the expected
    /// authority key. Carries the decrypted certificate bytes.
    InvalidCertificate([u8; SIGNATURE_NOISE_MESSAGE_SIZE]),
    /// A handshake step was driven in the wrong order or direction.
    HandshakeOutOfOrder,
    /// A handshake operation was attempted on a session already in
    /// transport mode.
    HandshakeComplete,
    /// A transport operation was attempted before the handshake finished.
    HandshakeNotComplete,
    /// The requested handshake step is not valid for an initiator.
    InvalidStepForInitiator,
    /// The requested handshake step is not valid for a responder.
    InvalidStepForResponder,
}

pub type Result<T> = core::result::Result<T, Error>;

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        use Error::*;
        match self {
            AeadFailure => write!(f, "AEAD encryption/decryption failure"),
            NonceOverflow => write!(f, "Nonce counter would wrap"),
            InvalidMessageLength => write!(f, "Unexpected handshake or transport message length"),
            InvalidCertificate(_) => write!(f, "Invalid certificate"),
            HandshakeOutOfOrder => write!(f, "Handshake step driven out of order"),
            HandshakeComplete => write!(f, "Handshake already complete"),
            HandshakeNotComplete => write!(f, "Handshake not yet complete"),
            InvalidStepForInitiator => write!(f, "Invalid handshake step for initiator"),
            InvalidStepForResponder => write!(f, "Invalid handshake step for responder"),
        }
    }
}

impl std::error::Error for Error {}

impl From<chacha20poly1305::aead::Error> for Error {
    fn from(_: chacha20poly1305::aead::Error) -> Self {
        Error::AeadFailure
    }
}
