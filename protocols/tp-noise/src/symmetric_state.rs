use secp256k1::hashes::{sha256::Hash as Sha256Hash, Hash};

use crate::{
    cipher_state::CipherState,
    error::Result,
    KEY_SIZE,
};

/// Name of the handshake pattern and cipher suite, as hashed into the
/// initial chaining key.
pub const PROTOCOL_NAME: &str = "Noise_NX_EllSwiftXonly_ChaChaPoly_SHA256";

// SHA-256 of the ASCII protocol name: the initial chaining key.
pub(crate) const PROTOCOL_NAME_HASH: [u8; 32] = [
    27, 97, 156, 90, 248, 120, 254, 68, 34, 119, 45, 129, 209, 41, 152, 82, 26, 137, 97, 115, 62,
    44, 177, 60, 145, 24, 250, 214, 68, 188, 1, 128,
];

// SHA-256 of the hash above: the initial handshake hash.
pub(crate) const PROTOCOL_NAME_DOUBLE_HASH: [u8; 32] = [
    60, 102, 112, 143, 69, 248, 185, 34, 53, 193, 3, 46, 250, 104, 70, 171, 139, 103, 55, 191,
    199, 9, 77, 179, 99, 170, 7, 240, 219, 36, 226, 71,
];

/// Chaining key, handshake hash and the single handshake cipher.
///
/// Encapsulates all the symmetric crypto of the handshake: every byte
/// written to or read from the wire is mixed into the handshake hash `h`,
/// and every Diffie-Hellman output is mixed into the chaining key `ck`,
/// from which the handshake and transport keys are derived.
pub struct SymmetricState {
    ck: [u8; KEY_SIZE],
    h: [u8; KEY_SIZE],
    cipher: CipherState,
}

impl SymmetricState {
    pub fn new() -> Self {
        Self {
            ck: PROTOCOL_NAME_HASH,
            h: PROTOCOL_NAME_DOUBLE_HASH,
            cipher: CipherState::new(),
        }
    }

    /// `h = SHA256(h || data)`.
    pub fn mix_hash(&mut self, data: &[u8]) {
        let mut to_hash = Vec::with_capacity(KEY_SIZE + data.len());
        to_hash.extend_from_slice(&self.h);
        to_hash.extend_from_slice(data);
        self.h = Sha256Hash::hash(&to_hash).to_byte_array();
    }

    /// HMAC-SHA256 built from the two-step ipad/opad construction.
    pub fn hmac_hash(key: &[u8; KEY_SIZE], data: &[u8]) -> [u8; KEY_SIZE] {
        let mut ipad = [0x36u8; 64];
        let mut opad = [0x5cu8; 64];
        for i in 0..KEY_SIZE {
            ipad[i] = key[i] ^ 0x36;
            opad[i] = key[i] ^ 0x5c;
        }

        let mut to_hash = Vec::with_capacity(64 + data.len());
        to_hash.extend_from_slice(&ipad);
        to_hash.extend_from_slice(data);
        let temp = Sha256Hash::hash(&to_hash).to_byte_array();

        to_hash.clear();
        to_hash.extend_from_slice(&opad);
        to_hash.extend_from_slice(&temp);

        Sha256Hash::hash(&to_hash).to_byte_array()
    }

    /// HKDF producing two 32-byte outputs from the chaining key and input
    /// key material.
    pub fn hkdf_2(
        chaining_key: &[u8; KEY_SIZE],
        input_key_material: &[u8],
    ) -> ([u8; KEY_SIZE], [u8; KEY_SIZE]) {
        let temp_key = Self::hmac_hash(chaining_key, input_key_material);
        let out_1 = Self::hmac_hash(&temp_key, &[0x1]);
        let out_2 = Self::hmac_hash(&temp_key, &[&out_1[..], &[0x2][..]].concat());
        (out_1, out_2)
    }

    /// Mixes `input_key_material` into the chaining key and installs the
    /// derived key into the handshake cipher, resetting its nonce.
    pub fn mix_key(&mut self, input_key_material: &[u8]) {
        let (ck, temp_k) = Self::hkdf_2(&self.ck, input_key_material);
        self.ck = ck;
        self.cipher.initialize_key(temp_k);
    }

    /// Encrypts `data` in place with the current hash as associated data,
    /// then mixes the resulting ciphertext into the hash. With no key
    /// installed yet this reduces to `mix_hash(data)`.
    pub fn encrypt_and_hash(&mut self, data: &mut Vec<u8>) -> Result<()> {
        if self.cipher.has_key() {
            let h = self.h;
            self.cipher.encrypt_with_ad(&h, data)?;
        }
        self.mix_hash(data);
        Ok(())
    }

    /// Decrypts `data` in place with the current hash as associated data;
    /// the hash absorbs the ciphertext, not the plaintext.
    pub fn decrypt_and_hash(&mut self, data: &mut Vec<u8>) -> Result<()> {
        let encrypted = data.clone();
        if self.cipher.has_key() {
            let h = self.h;
            self.cipher.decrypt_with_ad(&h, data)?;
        }
        self.mix_hash(&encrypted);
        Ok(())
    }

    /// Derives the two transport cipher states from the chaining key.
    pub fn split(&self) -> (CipherState, CipherState) {
        let (k1, k2) = Self::hkdf_2(&self.ck, &[]);
        (CipherState::from_key(k1), CipherState::from_key(k2))
    }

    /// The running handshake hash; after the handshake this is the channel
    /// binding value, identical on both sides.
    pub fn hash_output(&self) -> [u8; KEY_SIZE] {
        self.h
    }

    #[cfg(test)]
    pub(crate) fn chaining_key(&self) -> [u8; KEY_SIZE] {
        self.ck
    }
}

impl Default for SymmetricState {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for SymmetricState {
    fn drop(&mut self) {
        for b in self.ck.iter_mut() {
            unsafe { core::ptr::write_volatile(b, 0) };
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn protocol_name_constants_match_computed_hashes() {
        let name_hash = Sha256Hash::hash(PROTOCOL_NAME.as_bytes()).to_byte_array();
        assert_eq!(name_hash, PROTOCOL_NAME_HASH);
        let double_hash = Sha256Hash::hash(&name_hash).to_byte_array();
        assert_eq!(double_hash, PROTOCOL_NAME_DOUBLE_HASH);
    }

    #[test]
    fn hmac_hash_with_zeros() {
        let k = [0u8; 32];
        let data = [0u8; 90];
        let value = SymmetricState::hmac_hash(&k, &data);

        let mut to_hash = vec![0x36u8; 64];
        to_hash.extend_from_slice(&data);
        let temp = Sha256Hash::hash(&to_hash).to_byte_array();
        let mut to_hash = vec![0x5cu8; 64];
        to_hash.extend_from_slice(&temp);
        let expected = Sha256Hash::hash(&to_hash).to_byte_array();

        assert_eq!(value, expected);
    }

    #[test]
    fn hkdf_2_structure() {
        let chaining_key = [0u8; 32];
        let input_key_material = [0u8; 32];
        let temp_k = SymmetricState::hmac_hash(&chaining_key, &input_key_material);
        let expected_1 = SymmetricState::hmac_hash(&temp_k, &[0x1]);
        let mut temp_2 = expected_1.to_vec();
        temp_2.push(0x2);
        let expected_2 = SymmetricState::hmac_hash(&temp_k, &temp_2);

        let (out_1, out_2) = SymmetricState::hkdf_2(&chaining_key, &input_key_material);
        assert_eq!(out_1, expected_1);
        assert_eq!(out_2, expected_2);
    }

    #[test]
    fn mix_key_updates_chaining_key() {
        let mut state = SymmetricState::new();
        let ikm = [5u8; 32];
        let (expected_ck, _) = SymmetricState::hkdf_2(&PROTOCOL_NAME_HASH, &ikm);
        state.mix_key(&ikm);
        assert_eq!(state.chaining_key(), expected_ck);
    }

    #[test]
    fn identical_sequences_are_deterministic() {
        let mut a = SymmetricState::new();
        let mut b = SymmetricState::new();
        for round in 0u8..4 {
            a.mix_hash(&[round; 16]);
            b.mix_hash(&[round; 16]);
            a.mix_key(&[round; 32]);
            b.mix_key(&[round; 32]);
        }
        assert_eq!(a.hash_output(), b.hash_output());
        assert_eq!(a.chaining_key(), b.chaining_key());
    }

    #[test]
    fn encrypt_and_hash_round_trip() {
        let mut a = SymmetricState::new();
        let mut b = SymmetricState::new();
        a.mix_key(&[1; 32]);
        b.mix_key(&[1; 32]);

        let data = vec![1, 7, 92, 3, 4, 5];
        let mut buf = data.clone();
        a.encrypt_and_hash(&mut buf).unwrap();
        assert!(buf != data);
        b.decrypt_and_hash(&mut buf).unwrap();

        assert_eq!(buf, data);
        assert_eq!(a.hash_output(), b.hash_output());
    }
}
