//! # Noise session engine for the Stratum v2 Template Provider
//!
//! `tp_noise` secures the connection between a Template Provider (the
//! responder) and a mining client (the initiator) with the Noise protocol,
//! using the `Noise_NX_EllSwiftXonly_ChaChaPoly_SHA256` handshake pattern.
//!
//! - Diffie-Hellman on [`secp256k1`], with public keys exchanged in their
//!   64-byte ElligatorSwift encoding so that handshake bytes are
//!   indistinguishable from random.
//! - `ChaCha20-Poly1305` AEAD for both handshake payloads and transport
//!   messages, chunked at 65535-byte boundaries.
//! - A Schnorr-signed certificate delivered during the handshake, which
//!   binds the responder's static key to an authority key known to the
//!   initiator.
//!
//! The entry point is [`NoiseSession`]: construct one side with
//! [`NoiseSession::new_initiator`] and the other with
//! [`NoiseSession::new_responder`], feed handshake bytes through
//! [`NoiseSession::process_maybe_handshake`], and once the session reaches
//! [`SessionState::Transport`] use [`NoiseSession::encrypt_message`] and
//! [`NoiseSession::decrypt_message`] for framed transport data.

mod certificate;
mod cipher_state;
mod error;
mod handshake;
mod session;
mod symmetric_state;

pub use certificate::SignatureNoiseMessage;
pub use cipher_state::{encrypted_message_size, CipherState};
pub use error::{Error, Result};
pub use handshake::{generate_key, HandshakeState};
pub use session::{NoiseSession, SessionState};
pub use symmetric_state::{SymmetricState, PROTOCOL_NAME};

/// All Noise messages are less than or equal to 65535 bytes in length.
pub const NOISE_MAX_CHUNK_SIZE: usize = 65535;

/// Size of the Poly1305 authentication tag appended to every AEAD ciphertext.
pub const AEAD_MAC_SIZE: usize = 16;

/// Size of a ChaCha20-Poly1305 key, and of the chaining key and hash output.
pub const KEY_SIZE: usize = 32;

/// Size of an ElligatorSwift-encoded secp256k1 public key.
pub const ELLSWIFT_ENCODING_SIZE: usize = 64;

/// An ElligatorSwift-encoded public key wrapped by `EncryptAndHash`.
pub const ENCRYPTED_ELLSWIFT_ENCODING_SIZE: usize = ELLSWIFT_ENCODING_SIZE + AEAD_MAC_SIZE;

/// Serialized certificate: version, valid_from, valid_to and a Schnorr
/// signature. The static key is signed for but not serialized.
pub const SIGNATURE_NOISE_MESSAGE_SIZE: usize = 2 + 4 + 4 + 64;

/// A serialized certificate wrapped by `EncryptAndHash`.
pub const ENCRYPTED_SIGNATURE_NOISE_MESSAGE_SIZE: usize =
    SIGNATURE_NOISE_MESSAGE_SIZE + AEAD_MAC_SIZE;

/// Size of the responder's handshake reply: plaintext ephemeral key,
/// encrypted static key and encrypted certificate (64 + 80 + 90 bytes).
pub const INITIATOR_EXPECTED_HANDSHAKE_MESSAGE_SIZE: usize = ELLSWIFT_ENCODING_SIZE
    + ENCRYPTED_ELLSWIFT_ENCODING_SIZE
    + ENCRYPTED_SIGNATURE_NOISE_MESSAGE_SIZE;

/// Size of the initiator's first handshake message: one plaintext
/// ElligatorSwift-encoded ephemeral key.
pub const RESPONDER_EXPECTED_HANDSHAKE_MESSAGE_SIZE: usize = ELLSWIFT_ENCODING_SIZE;

// The parity used for generated key pairs, so that the x-only form of a
// generated public key always reconstructs to the same curve point.
const PARITY: secp256k1::Parity = secp256k1::Parity::Even;
