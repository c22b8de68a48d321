use secp256k1::{
    ellswift::{ElligatorSwift, ElligatorSwiftParty},
    rand, Keypair, PublicKey, Secp256k1, SecretKey, XOnlyPublicKey,
};

use crate::{
    certificate::SignatureNoiseMessage,
    cipher_state::CipherState,
    error::{Error, Result},
    symmetric_state::SymmetricState,
    ELLSWIFT_ENCODING_SIZE, ENCRYPTED_ELLSWIFT_ENCODING_SIZE,
    ENCRYPTED_SIGNATURE_NOISE_MESSAGE_SIZE, INITIATOR_EXPECTED_HANDSHAKE_MESSAGE_SIZE, KEY_SIZE,
    SIGNATURE_NOISE_MESSAGE_SIZE,
};

/// Generates a fresh keypair whose x-only public key has even parity, so
/// the x-only form reconstructs to the generated point.
pub fn generate_key() -> Keypair {
    let secp = Secp256k1::new();
    loop {
        let (secret_key, _) = secp.generate_keypair(&mut rand::thread_rng());
        let kp = Keypair::from_secret_key(&secp, &secret_key);
        if kp.x_only_public_key().1 == crate::PARITY {
            return kp;
        }
    }
}

/// Noise_NX handshake state: `-> e` then
/// `<- e, ee, s, es, SIGNATURE_NOISE_MESSAGE`.
///
/// Owns the local static and ephemeral keys together with the
/// [`SymmetricState`]; dropped as a whole once the session switches to
/// transport mode. The initiator carries the authority public key used to
/// verify the responder's certificate, the responder carries the
/// certificate itself.
pub struct HandshakeState {
    symmetric: SymmetricState,
    s: Keypair,
    s_ellswift: ElligatorSwift,
    e: Option<(Keypair, ElligatorSwift)>,
    re: Option<ElligatorSwift>,
    certificate: Option<SignatureNoiseMessage>,
    authority_pubkey: Option<XOnlyPublicKey>,
}

impl HandshakeState {
    /// Initiator side: verifies the responder's certificate against
    /// `authority_pubkey`.
    pub fn initiator(static_key: SecretKey, authority_pubkey: XOnlyPublicKey) -> Self {
        Self::new(static_key, None, Some(authority_pubkey))
    }

    /// Responder side: delivers `certificate` during step 2.
    pub fn responder(static_key: SecretKey, certificate: SignatureNoiseMessage) -> Self {
        Self::new(static_key, Some(certificate), None)
    }

    fn new(
        static_key: SecretKey,
        certificate: Option<SignatureNoiseMessage>,
        authority_pubkey: Option<XOnlyPublicKey>,
    ) -> Self {
        let secp = Secp256k1::new();
        let s = Keypair::from_secret_key(&secp, &static_key);
        let s_ellswift = ElligatorSwift::from_pubkey(s.public_key());
        Self {
            symmetric: SymmetricState::new(),
            s,
            s_ellswift,
            e: None,
            re: None,
            certificate,
            authority_pubkey,
        }
    }

    /// Initiator step 1: write the plaintext ElligatorSwift encoding of a
    /// fresh ephemeral key (64 bytes) and mix it into the hash.
    pub fn write_msg_ephemeral_pk(&mut self, msg: &mut [u8]) -> Result<()> {
        if msg.len() < ELLSWIFT_ENCODING_SIZE {
            return Err(Error::InvalidMessageLength);
        }
        let e = generate_key();
        let e_ellswift = ElligatorSwift::from_pubkey(e.public_key());
        let encoding = e_ellswift.to_array();
        msg[..ELLSWIFT_ENCODING_SIZE].copy_from_slice(&encoding);
        self.symmetric.mix_hash(&encoding);
        // EncryptAndHash() on the empty remainder; no key yet, so this only
        // absorbs empty data into the hash.
        self.symmetric.encrypt_and_hash(&mut Vec::new())?;
        self.e = Some((e, e_ellswift));
        Ok(())
    }

    /// Responder step 1: read the initiator's ephemeral key.
    pub fn read_msg_ephemeral_pk(&mut self, msg: &[u8]) -> Result<()> {
        if msg.len() < ELLSWIFT_ENCODING_SIZE {
            return Err(Error::InvalidMessageLength);
        }
        let mut encoding = [0u8; ELLSWIFT_ENCODING_SIZE];
        encoding.copy_from_slice(&msg[..ELLSWIFT_ENCODING_SIZE]);
        self.symmetric.mix_hash(&encoding);
        self.symmetric.decrypt_and_hash(&mut Vec::new())?;
        self.re = Some(ElligatorSwift::from_array(encoding));
        Ok(())
    }

    /// Responder step 2: write `e, ee, s, es` and the encrypted
    /// certificate — exactly 234 bytes.
    pub fn write_msg_es(&mut self, msg: &mut [u8]) -> Result<()> {
        if msg.len() < INITIATOR_EXPECTED_HANDSHAKE_MESSAGE_SIZE {
            return Err(Error::InvalidMessageLength);
        }
        let re = self.re.ok_or(Error::HandshakeOutOfOrder)?;
        let certificate = self
            .certificate
            .as_ref()
            .ok_or(Error::HandshakeOutOfOrder)?;

        // e
        let e = generate_key();
        let e_ellswift = ElligatorSwift::from_pubkey(e.public_key());
        let encoding = e_ellswift.to_array();
        msg[..ELLSWIFT_ENCODING_SIZE].copy_from_slice(&encoding);
        self.symmetric.mix_hash(&encoding);

        // ee
        let ecdh_ephemeral =
            ElligatorSwift::shared_secret(re, e_ellswift, e.secret_key(), ElligatorSwiftParty::B, None)
                .to_secret_bytes();
        self.symmetric.mix_key(&ecdh_ephemeral);

        // s, encrypted and authenticated against the running hash
        let mut encrypted_static = self.s_ellswift.to_array().to_vec();
        self.symmetric.encrypt_and_hash(&mut encrypted_static)?;
        if encrypted_static.len() != ENCRYPTED_ELLSWIFT_ENCODING_SIZE {
            return Err(Error::InvalidMessageLength);
        }
        msg[ELLSWIFT_ENCODING_SIZE..ELLSWIFT_ENCODING_SIZE + ENCRYPTED_ELLSWIFT_ENCODING_SIZE]
            .copy_from_slice(&encrypted_static);

        // es
        let ecdh_static = ElligatorSwift::shared_secret(
            re,
            self.s_ellswift,
            self.s.secret_key(),
            ElligatorSwiftParty::B,
            None,
        )
        .to_secret_bytes();
        self.symmetric.mix_key(&ecdh_static);

        // certificate
        let mut encrypted_certificate = certificate.serialize().to_vec();
        self.symmetric.encrypt_and_hash(&mut encrypted_certificate)?;
        if encrypted_certificate.len() != ENCRYPTED_SIGNATURE_NOISE_MESSAGE_SIZE {
            return Err(Error::InvalidMessageLength);
        }
        msg[ELLSWIFT_ENCODING_SIZE + ENCRYPTED_ELLSWIFT_ENCODING_SIZE
            ..INITIATOR_EXPECTED_HANDSHAKE_MESSAGE_SIZE]
            .copy_from_slice(&encrypted_certificate);

        self.e = Some((e, e_ellswift));
        Ok(())
    }

    /// Initiator step 2: read the responder's ephemeral and static keys,
    /// derive the shared secrets and verify the certificate at time `now`.
    pub fn read_msg_es(&mut self, msg: &[u8], now: u32) -> Result<()> {
        if msg.len() < INITIATOR_EXPECTED_HANDSHAKE_MESSAGE_SIZE {
            return Err(Error::InvalidMessageLength);
        }
        let (e, e_ellswift) = self.e.ok_or(Error::HandshakeOutOfOrder)?;
        let authority_pubkey = self.authority_pubkey.ok_or(Error::HandshakeOutOfOrder)?;

        // e
        let mut encoding = [0u8; ELLSWIFT_ENCODING_SIZE];
        encoding.copy_from_slice(&msg[..ELLSWIFT_ENCODING_SIZE]);
        self.symmetric.mix_hash(&encoding);
        let re = ElligatorSwift::from_array(encoding);
        self.re = Some(re);

        // ee
        let ecdh_ephemeral =
            ElligatorSwift::shared_secret(e_ellswift, re, e.secret_key(), ElligatorSwiftParty::A, None)
                .to_secret_bytes();
        self.symmetric.mix_key(&ecdh_ephemeral);

        // s
        let mut to_decrypt = msg
            [ELLSWIFT_ENCODING_SIZE..ELLSWIFT_ENCODING_SIZE + ENCRYPTED_ELLSWIFT_ENCODING_SIZE]
            .to_vec();
        self.symmetric.decrypt_and_hash(&mut to_decrypt)?;
        if to_decrypt.len() != ELLSWIFT_ENCODING_SIZE {
            return Err(Error::InvalidMessageLength);
        }
        let mut rs_encoding = [0u8; ELLSWIFT_ENCODING_SIZE];
        rs_encoding.copy_from_slice(&to_decrypt);
        let rs_ellswift = ElligatorSwift::from_array(rs_encoding);

        // es
        let ecdh_static = ElligatorSwift::shared_secret(
            e_ellswift,
            rs_ellswift,
            e.secret_key(),
            ElligatorSwiftParty::A,
            None,
        )
        .to_secret_bytes();
        self.symmetric.mix_key(&ecdh_static);

        // certificate
        let mut to_decrypt = msg[ELLSWIFT_ENCODING_SIZE + ENCRYPTED_ELLSWIFT_ENCODING_SIZE
            ..INITIATOR_EXPECTED_HANDSHAKE_MESSAGE_SIZE]
            .to_vec();
        self.symmetric.decrypt_and_hash(&mut to_decrypt)?;
        if to_decrypt.len() != SIGNATURE_NOISE_MESSAGE_SIZE {
            return Err(Error::InvalidMessageLength);
        }
        let mut plaintext = [0u8; SIGNATURE_NOISE_MESSAGE_SIZE];
        plaintext.copy_from_slice(&to_decrypt);
        let certificate = SignatureNoiseMessage::from(plaintext);

        let rs_xonly = PublicKey::from_ellswift(rs_ellswift).x_only_public_key().0;
        if !certificate.verify(&rs_xonly, &authority_pubkey, now) {
            return Err(Error::InvalidCertificate(plaintext));
        }
        Ok(())
    }

    /// Consumes the handshake, returning the channel-binding hash and the
    /// two derived transport cipher states `(c1, c2)`. The initiator sends
    /// with `c1` and receives with `c2`; the responder is mirrored.
    pub fn finalize(self) -> ([u8; KEY_SIZE], CipherState, CipherState) {
        let hash = self.symmetric.hash_output();
        let (c1, c2) = self.symmetric.split();
        (hash, c1, c2)
    }
}

impl Drop for HandshakeState {
    fn drop(&mut self) {
        self.s.non_secure_erase();
        if let Some((e, _)) = self.e.as_mut() {
            e.non_secure_erase();
        }
    }
}

impl core::fmt::Debug for HandshakeState {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("HandshakeState").finish()
    }
}
