use secp256k1::{SecretKey, XOnlyPublicKey};

use crate::{
    certificate::SignatureNoiseMessage,
    cipher_state::{encrypted_message_size, CipherState},
    error::{Error, Result},
    handshake::HandshakeState,
    KEY_SIZE,
};

/// Externally visible progress of a [`NoiseSession`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Waiting for the first handshake message (`-> e`).
    HandshakeStep1,
    /// Waiting for the second handshake message
    /// (`<- e, ee, s, es, SIGNATURE_NOISE_MESSAGE`).
    HandshakeStep2,
    /// Handshake finished; transport ciphers installed.
    Transport,
}

// Handshake material is replaced in place by the transport ciphers, so
// ephemeral keys and the symmetric state are dropped as soon as the
// handshake finishes.
enum SessionInner {
    Handshake(Box<HandshakeState>),
    Transport {
        encryptor: CipherState,
        decryptor: CipherState,
        hash: [u8; KEY_SIZE],
    },
}

/// A Noise session, from handshake to framed transport.
///
/// Each call to [`NoiseSession::process_maybe_handshake`] advances the
/// handshake by exactly one step, in the direction given by `send`. Each
/// party performs exactly one read and one write: the initiator writes at
/// step 1 and reads at step 2, the responder mirrored. After the second
/// step the session is in [`SessionState::Transport`] and only
/// [`NoiseSession::encrypt_message`] / [`NoiseSession::decrypt_message`]
/// may be used.
pub struct NoiseSession {
    initiator: bool,
    state: SessionState,
    inner: SessionInner,
}

impl NoiseSession {
    /// Creates the initiator (client) side. The responder's certificate
    /// will be verified against `authority_pubkey`.
    pub fn new_initiator(static_key: SecretKey, authority_pubkey: XOnlyPublicKey) -> Self {
        Self {
            initiator: true,
            state: SessionState::HandshakeStep1,
            inner: SessionInner::Handshake(Box::new(HandshakeState::initiator(
                static_key,
                authority_pubkey,
            ))),
        }
    }

    /// Creates the responder (server) side, which presents `certificate`
    /// during the handshake.
    pub fn new_responder(static_key: SecretKey, certificate: SignatureNoiseMessage) -> Self {
        Self {
            initiator: false,
            state: SessionState::HandshakeStep1,
            inner: SessionInner::Handshake(Box::new(HandshakeState::responder(
                static_key,
                certificate,
            ))),
        }
    }

    pub fn session_state(&self) -> SessionState {
        self.state
    }

    pub fn handshake_complete(&self) -> bool {
        self.state == SessionState::Transport
    }

    /// The channel-binding hash, available once the handshake finished.
    pub fn hash_output(&self) -> Option<[u8; KEY_SIZE]> {
        match &self.inner {
            SessionInner::Transport { hash, .. } => Some(*hash),
            SessionInner::Handshake(_) => None,
        }
    }

    /// Advances the handshake by one step. With `send` the local side
    /// writes its next handshake message into `buf` (which must be sized
    /// for that message); without it, `buf` holds the peer's message.
    pub fn process_maybe_handshake(&mut self, buf: &mut [u8], send: bool) -> Result<()> {
        let handshake = match &mut self.inner {
            SessionInner::Handshake(h) => h,
            SessionInner::Transport { .. } => return Err(Error::HandshakeComplete),
        };
        match (self.state, send, self.initiator) {
            (SessionState::HandshakeStep1, true, true) => {
                handshake.write_msg_ephemeral_pk(buf)?;
                self.state = SessionState::HandshakeStep2;
                Ok(())
            }
            (SessionState::HandshakeStep1, false, false) => {
                handshake.read_msg_ephemeral_pk(buf)?;
                self.state = SessionState::HandshakeStep2;
                Ok(())
            }
            (SessionState::HandshakeStep2, true, false) => {
                handshake.write_msg_es(buf)?;
                self.enter_transport()
            }
            (SessionState::HandshakeStep2, false, true) => {
                handshake.read_msg_es(buf, unix_now())?;
                self.enter_transport()
            }
            (_, _, true) => Err(Error::InvalidStepForInitiator),
            (_, _, false) => Err(Error::InvalidStepForResponder),
        }
    }

    // Swaps the handshake state for the transport ciphers. c1 is the
    // initiator-to-responder direction, c2 the reverse.
    fn enter_transport(&mut self) -> Result<()> {
        let placeholder = SessionInner::Transport {
            encryptor: CipherState::new(),
            decryptor: CipherState::new(),
            hash: [0; KEY_SIZE],
        };
        match core::mem::replace(&mut self.inner, placeholder) {
            SessionInner::Handshake(handshake) => {
                let (hash, c1, c2) = handshake.finalize();
                let (encryptor, decryptor) = if self.initiator { (c1, c2) } else { (c2, c1) };
                self.inner = SessionInner::Transport {
                    encryptor,
                    decryptor,
                    hash,
                };
                self.state = SessionState::Transport;
                Ok(())
            }
            SessionInner::Transport { .. } => Err(Error::HandshakeOutOfOrder),
        }
    }

    /// Encrypts `plaintext` into `out` as a chunked transport message.
    pub fn encrypt_message(&mut self, plaintext: &[u8], out: &mut Vec<u8>) -> Result<()> {
        match &mut self.inner {
            SessionInner::Transport { encryptor, .. } => encryptor.encrypt_message(plaintext, out),
            SessionInner::Handshake(_) => Err(Error::HandshakeNotComplete),
        }
    }

    /// Decrypts a chunked transport message in place.
    pub fn decrypt_message(&mut self, message: &mut Vec<u8>) -> Result<()> {
        match &mut self.inner {
            SessionInner::Transport { decryptor, .. } => decryptor.decrypt_message(message),
            SessionInner::Handshake(_) => Err(Error::HandshakeNotComplete),
        }
    }

    /// Expected wire size of a chunked transport message for `plain_len`
    /// plaintext bytes. Both peers must agree on this to stay in sync.
    pub fn encrypted_message_size(plain_len: usize) -> usize {
        encrypted_message_size(plain_len)
    }
}

impl core::fmt::Debug for NoiseSession {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("NoiseSession")
            .field("initiator", &self.initiator)
            .field("state", &self.state)
            .finish()
    }
}

fn unix_now() -> u32 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs() as u32)
        .unwrap_or(0)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{
        handshake::generate_key, INITIATOR_EXPECTED_HANDSHAKE_MESSAGE_SIZE,
        RESPONDER_EXPECTED_HANDSHAKE_MESSAGE_SIZE,
    };
    use secp256k1::rand;

    fn session_pair() -> (NoiseSession, NoiseSession) {
        let authority = generate_key();
        let static_key = generate_key();
        let certificate = SignatureNoiseMessage::sign(
            0,
            0,
            u32::MAX,
            &static_key.x_only_public_key().0,
            &authority,
            &mut rand::thread_rng(),
        );
        let responder = NoiseSession::new_responder(static_key.secret_key(), certificate);
        let initiator = NoiseSession::new_initiator(
            generate_key().secret_key(),
            authority.x_only_public_key().0,
        );
        (initiator, responder)
    }

    fn complete_handshake(initiator: &mut NoiseSession, responder: &mut NoiseSession) {
        let mut msg_e = [0u8; RESPONDER_EXPECTED_HANDSHAKE_MESSAGE_SIZE];
        initiator.process_maybe_handshake(&mut msg_e, true).unwrap();
        responder
            .process_maybe_handshake(&mut msg_e, false)
            .unwrap();

        let mut msg_es = [0u8; INITIATOR_EXPECTED_HANDSHAKE_MESSAGE_SIZE];
        responder.process_maybe_handshake(&mut msg_es, true).unwrap();
        initiator
            .process_maybe_handshake(&mut msg_es, false)
            .unwrap();
    }

    #[test]
    fn session_reaches_transport_with_equal_hash() {
        let (mut initiator, mut responder) = session_pair();
        assert_eq!(initiator.session_state(), SessionState::HandshakeStep1);
        assert_eq!(responder.session_state(), SessionState::HandshakeStep1);

        complete_handshake(&mut initiator, &mut responder);

        assert!(initiator.handshake_complete());
        assert!(responder.handshake_complete());
        assert_eq!(initiator.hash_output(), responder.hash_output());
        assert!(initiator.hash_output().is_some());
    }

    #[test]
    fn transport_round_trip_both_directions() {
        let (mut initiator, mut responder) = session_pair();
        complete_handshake(&mut initiator, &mut responder);

        let mut wire = Vec::new();
        initiator.encrypt_message(b"coinbase", &mut wire).unwrap();
        assert_eq!(wire.len(), NoiseSession::encrypted_message_size(8));
        responder.decrypt_message(&mut wire).unwrap();
        assert_eq!(wire, b"coinbase");

        let mut wire = Vec::new();
        responder.encrypt_message(b"template", &mut wire).unwrap();
        initiator.decrypt_message(&mut wire).unwrap();
        assert_eq!(wire, b"template");
    }

    #[test]
    fn transport_ops_rejected_during_handshake() {
        let (mut initiator, _) = session_pair();
        let mut out = Vec::new();
        assert_eq!(
            initiator.encrypt_message(b"early", &mut out),
            Err(Error::HandshakeNotComplete)
        );
        let mut buf = vec![0u8; 22];
        assert_eq!(
            initiator.decrypt_message(&mut buf),
            Err(Error::HandshakeNotComplete)
        );
    }

    #[test]
    fn handshake_ops_rejected_in_transport() {
        let (mut initiator, mut responder) = session_pair();
        complete_handshake(&mut initiator, &mut responder);
        let mut buf = [0u8; RESPONDER_EXPECTED_HANDSHAKE_MESSAGE_SIZE];
        assert_eq!(
            initiator.process_maybe_handshake(&mut buf, true),
            Err(Error::HandshakeComplete)
        );
    }

    #[test]
    fn wrong_direction_is_rejected() {
        let (mut initiator, mut responder) = session_pair();
        let mut buf = [0u8; RESPONDER_EXPECTED_HANDSHAKE_MESSAGE_SIZE];
        // The initiator writes first; reading is not a valid first step.
        assert_eq!(
            initiator.process_maybe_handshake(&mut buf, false),
            Err(Error::InvalidStepForInitiator)
        );
        // The responder reads first; writing is not a valid first step.
        assert_eq!(
            responder.process_maybe_handshake(&mut buf, true),
            Err(Error::InvalidStepForResponder)
        );
    }
}
