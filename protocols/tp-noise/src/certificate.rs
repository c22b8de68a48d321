use secp256k1::{
    hashes::{sha256::Hash as Sha256Hash, Hash},
    rand,
    schnorr::Signature,
    Keypair, Message, Secp256k1, XOnlyPublicKey,
};

use crate::SIGNATURE_NOISE_MESSAGE_SIZE;

/// Certificate for the responder's static key, delivered encrypted during
/// the handshake and verified by the initiator against a known authority
/// key.
///
/// The signed hash commits to the static key
/// (`SHA256(version || valid_from || valid_to || static_key)`) but the
/// serialized form omits it: the initiator learns the static key from the
/// handshake itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignatureNoiseMessage {
    /// Version of the certificate format.
    pub version: u16,
    /// Start of the validity period, unix seconds.
    pub valid_from: u32,
    /// End of the validity period, unix seconds.
    pub valid_to: u32,
    /// Schnorr signature by the authority key.
    pub signature: [u8; 64],
}

impl SignatureNoiseMessage {
    /// Creates a certificate for `static_key`, signed with the authority
    /// keypair.
    pub fn sign<R: rand::Rng + rand::CryptoRng>(
        version: u16,
        valid_from: u32,
        valid_to: u32,
        static_key: &XOnlyPublicKey,
        authority: &Keypair,
        rng: &mut R,
    ) -> Self {
        let secp = Secp256k1::signing_only();
        let m = Message::from_digest(Self::signed_hash(version, valid_from, valid_to, static_key));
        let sig = secp.sign_schnorr_with_rng(&m, authority, rng);
        let mut signature = [0u8; 64];
        signature.copy_from_slice(sig.as_ref());
        Self {
            version,
            valid_from,
            valid_to,
            signature,
        }
    }

    /// Checks the validity window against `now` and verifies the signature
    /// over `static_key` with the authority public key.
    pub fn verify(
        &self,
        static_key: &XOnlyPublicKey,
        authority_pk: &XOnlyPublicKey,
        now: u32,
    ) -> bool {
        if self.valid_from > now || self.valid_to < now {
            return false;
        }
        let secp = Secp256k1::verification_only();
        let m = Message::from_digest(Self::signed_hash(
            self.version,
            self.valid_from,
            self.valid_to,
            static_key,
        ));
        let sig = match Signature::from_slice(&self.signature) {
            Ok(s) => s,
            Err(_) => return false,
        };
        secp.verify_schnorr(&sig, &m, authority_pk).is_ok()
    }

    // m = SHA256(version || valid_from || valid_to || static_key), all
    // integers little-endian.
    fn signed_hash(
        version: u16,
        valid_from: u32,
        valid_to: u32,
        static_key: &XOnlyPublicKey,
    ) -> [u8; 32] {
        let mut data = Vec::with_capacity(10 + 32);
        data.extend_from_slice(&version.to_le_bytes());
        data.extend_from_slice(&valid_from.to_le_bytes());
        data.extend_from_slice(&valid_to.to_le_bytes());
        data.extend_from_slice(&static_key.serialize());
        Sha256Hash::hash(&data).to_byte_array()
    }

    /// 74-byte wire form: `version || valid_from || valid_to || signature`.
    pub fn serialize(&self) -> [u8; SIGNATURE_NOISE_MESSAGE_SIZE] {
        let mut out = [0u8; SIGNATURE_NOISE_MESSAGE_SIZE];
        out[0..2].copy_from_slice(&self.version.to_le_bytes());
        out[2..6].copy_from_slice(&self.valid_from.to_le_bytes());
        out[6..10].copy_from_slice(&self.valid_to.to_le_bytes());
        out[10..74].copy_from_slice(&self.signature);
        out
    }
}

impl From<[u8; SIGNATURE_NOISE_MESSAGE_SIZE]> for SignatureNoiseMessage {
    fn from(value: [u8; SIGNATURE_NOISE_MESSAGE_SIZE]) -> Self {
        let version = u16::from_le_bytes([value[0], value[1]]);
        let valid_from = u32::from_le_bytes([value[2], value[3], value[4], value[5]]);
        let valid_to = u32::from_le_bytes([value[6], value[7], value[8], value[9]]);
        let mut signature = [0u8; 64];
        signature.copy_from_slice(&value[10..74]);
        Self {
            version,
            valid_from,
            valid_to,
            signature,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::handshake::generate_key;

    #[test]
    fn serialize_round_trip() {
        let authority = generate_key();
        let static_key = generate_key().x_only_public_key().0;
        let cert = SignatureNoiseMessage::sign(
            0,
            100,
            200,
            &static_key,
            &authority,
            &mut rand::thread_rng(),
        );
        let decoded = SignatureNoiseMessage::from(cert.serialize());
        assert_eq!(decoded, cert);
    }

    #[test]
    fn verifies_within_validity_window() {
        let authority = generate_key();
        let static_key = generate_key().x_only_public_key().0;
        let cert = SignatureNoiseMessage::sign(
            0,
            100,
            200,
            &static_key,
            &authority,
            &mut rand::thread_rng(),
        );
        let authority_pk = authority.x_only_public_key().0;
        assert!(cert.verify(&static_key, &authority_pk, 150));
        assert!(!cert.verify(&static_key, &authority_pk, 99));
        assert!(!cert.verify(&static_key, &authority_pk, 201));
    }

    #[test]
    fn rejects_wrong_authority() {
        let authority = generate_key();
        let other = generate_key();
        let static_key = generate_key().x_only_public_key().0;
        let cert = SignatureNoiseMessage::sign(
            0,
            0,
            u32::MAX,
            &static_key,
            &authority,
            &mut rand::thread_rng(),
        );
        assert!(!cert.verify(&static_key, &other.x_only_public_key().0, 1000));
    }

    #[test]
    fn rejects_wrong_static_key() {
        let authority = generate_key();
        let static_key = generate_key().x_only_public_key().0;
        let other_static = generate_key().x_only_public_key().0;
        let cert = SignatureNoiseMessage::sign(
            0,
            0,
            u32::MAX,
            &static_key,
            &authority,
            &mut rand::thread_rng(),
        );
        assert!(!cert.verify(&other_static, &authority.x_only_public_key().0, 1000));
    }
}
