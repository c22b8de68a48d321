use chacha20poly1305::{AeadInPlace, ChaCha20Poly1305, KeyInit};

use crate::{
    error::{Error, Result},
    AEAD_MAC_SIZE, KEY_SIZE, NOISE_MAX_CHUNK_SIZE,
};

/// Expected size of a chunked AEAD message: one 16-byte tag per started
/// 65535-byte chunk. An empty plaintext produces an empty message.
pub fn encrypted_message_size(plain_len: usize) -> usize {
    if plain_len == 0 {
        0
    } else {
        plain_len + AEAD_MAC_SIZE * plain_len.div_ceil(NOISE_MAX_CHUNK_SIZE)
    }
}

/// AEAD key and nonce pair.
///
/// During the handshake each party has a single `CipherState` (inside its
/// [`crate::SymmetricState`]); in transport mode each party has two, one for
/// sending and one for receiving. The key is constant once installed, only
/// the nonce mutates: it advances by one on every encrypt or decrypt
/// invocation, including decrypts that fail authentication. A nonce that
/// would wrap is a fatal error.
pub struct CipherState {
    k: Option<[u8; KEY_SIZE]>,
    n: u64,
    cipher: Option<ChaCha20Poly1305>,
}

impl CipherState {
    /// An empty cipher state. Encrypt and decrypt are the identity until a
    /// key is installed.
    pub fn new() -> Self {
        Self {
            k: None,
            n: 0,
            cipher: None,
        }
    }

    /// A cipher state with `key` installed and the nonce at zero.
    pub fn from_key(key: [u8; KEY_SIZE]) -> Self {
        Self {
            k: Some(key),
            n: 0,
            cipher: Some(ChaCha20Poly1305::new(&key.into())),
        }
    }

    /// Installs `key` and resets the nonce to zero.
    pub(crate) fn initialize_key(&mut self, key: [u8; KEY_SIZE]) {
        self.n = 0;
        self.k = Some(key);
        self.cipher = Some(ChaCha20Poly1305::new(&key.into()));
    }

    pub(crate) fn has_key(&self) -> bool {
        self.k.is_some()
    }

    /// Current nonce counter.
    pub fn nonce(&self) -> u64 {
        self.n
    }

    // 96-bit nonce: four zero bytes followed by the counter in little-endian.
    fn nonce_to_bytes(&self) -> [u8; 12] {
        let mut res = [0u8; 12];
        res[4..].copy_from_slice(&self.n.to_le_bytes());
        res
    }

    /// Encrypts `data` in place with associated data `ad`, appending the
    /// 16-byte tag. Without an installed key this is the identity (used for
    /// the pre-key handshake steps).
    pub fn encrypt_with_ad(&mut self, ad: &[u8], data: &mut Vec<u8>) -> Result<()> {
        if self.cipher.is_none() {
            return Ok(());
        }
        if self.n == u64::MAX {
            return Err(Error::NonceOverflow);
        }
        let nonce = self.nonce_to_bytes();
        let outcome = match self.cipher.as_mut() {
            Some(c) => c
                .encrypt_in_place((&nonce).into(), ad, data)
                .map_err(Error::from),
            None => Ok(()),
        };
        self.n += 1;
        outcome
    }

    /// Decrypts `data` in place with associated data `ad`, verifying and
    /// stripping the tag. The nonce advances even when authentication
    /// fails: each invocation consumes one nonce.
    pub fn decrypt_with_ad(&mut self, ad: &[u8], data: &mut Vec<u8>) -> Result<()> {
        if self.cipher.is_none() {
            return Ok(());
        }
        if self.n == u64::MAX {
            return Err(Error::NonceOverflow);
        }
        let nonce = self.nonce_to_bytes();
        let outcome = match self.cipher.as_mut() {
            Some(c) => c
                .decrypt_in_place((&nonce).into(), ad, data)
                .map_err(Error::from),
            None => Ok(()),
        };
        self.n += 1;
        outcome
    }

    /// Encrypts `plaintext` into `out` as a sequence of chunks of up to
    /// [`NOISE_MAX_CHUNK_SIZE`] bytes, each followed by its tag. Chunks use
    /// empty associated data.
    pub fn encrypt_message(&mut self, plaintext: &[u8], out: &mut Vec<u8>) -> Result<()> {
        out.reserve(encrypted_message_size(plaintext.len()));
        for chunk in plaintext.chunks(NOISE_MAX_CHUNK_SIZE) {
            let mut buf = Vec::with_capacity(chunk.len() + AEAD_MAC_SIZE);
            buf.extend_from_slice(chunk);
            self.encrypt_with_ad(&[], &mut buf)?;
            out.extend_from_slice(&buf);
        }
        Ok(())
    }

    /// Decrypts a chunked message in place, verifying and stripping the
    /// per-chunk tags. On success `message` holds the plaintext.
    pub fn decrypt_message(&mut self, message: &mut Vec<u8>) -> Result<()> {
        if message.is_empty() {
            return Ok(());
        }
        let mut out = Vec::with_capacity(message.len());
        let mut offset = 0;
        while offset < message.len() {
            let end = usize::min(
                offset + NOISE_MAX_CHUNK_SIZE + AEAD_MAC_SIZE,
                message.len(),
            );
            if end - offset < AEAD_MAC_SIZE {
                return Err(Error::InvalidMessageLength);
            }
            let mut buf = message[offset..end].to_vec();
            self.decrypt_with_ad(&[], &mut buf)?;
            out.extend_from_slice(&buf);
            offset = end;
        }
        *message = out;
        Ok(())
    }
}

impl Default for CipherState {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for CipherState {
    fn drop(&mut self) {
        if let Some(k) = self.k.as_mut() {
            for b in k {
                unsafe { core::ptr::write_volatile(b, 0) };
            }
            self.k = None;
        }
    }
}

impl core::fmt::Debug for CipherState {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("CipherState").field("n", &self.n).finish()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use quickcheck::TestResult;

    #[test]
    fn round_trip_with_ad() {
        let mut sender = CipherState::from_key([9; 32]);
        let mut receiver = CipherState::from_key([9; 32]);

        let ad = [1, 2, 3];
        let data = vec![1, 7, 92, 3, 4, 5];

        let mut encrypted = data.clone();
        sender.encrypt_with_ad(&ad, &mut encrypted).unwrap();
        assert!(encrypted != data);
        receiver.decrypt_with_ad(&ad, &mut encrypted).unwrap();

        assert_eq!(encrypted, data);
        assert_eq!(sender.nonce(), receiver.nonce());
    }

    #[test]
    fn tampered_ciphertext_fails_and_consumes_nonce() {
        let mut sender = CipherState::from_key([7; 32]);
        let mut receiver = CipherState::from_key([7; 32]);

        let mut encrypted = vec![42u8; 20];
        sender.encrypt_with_ad(&[], &mut encrypted).unwrap();
        encrypted[0] ^= 0x01;

        assert_eq!(
            receiver.decrypt_with_ad(&[], &mut encrypted),
            Err(Error::AeadFailure)
        );
        assert_eq!(sender.nonce(), 1);
        assert_eq!(receiver.nonce(), 1);
    }

    #[test]
    fn tampered_ad_fails() {
        let mut sender = CipherState::from_key([7; 32]);
        let mut receiver = CipherState::from_key([7; 32]);

        let mut encrypted = vec![42u8; 20];
        sender.encrypt_with_ad(&[0xaa], &mut encrypted).unwrap();
        assert_eq!(
            receiver.decrypt_with_ad(&[0xab], &mut encrypted),
            Err(Error::AeadFailure)
        );
        assert_eq!(receiver.nonce(), 1);
    }

    #[test]
    fn message_size_law() {
        assert_eq!(encrypted_message_size(0), 0);
        assert_eq!(encrypted_message_size(1), 17);
        assert_eq!(encrypted_message_size(6), 22);
        assert_eq!(encrypted_message_size(65535), 65535 + 16);
        assert_eq!(encrypted_message_size(65536), 65536 + 32);
        assert_eq!(encrypted_message_size(3 * 65535), 3 * 65535 + 48);
    }

    #[test]
    fn empty_message_is_empty() {
        let mut sender = CipherState::from_key([1; 32]);
        let mut out = Vec::new();
        sender.encrypt_message(&[], &mut out).unwrap();
        assert!(out.is_empty());
        assert_eq!(sender.nonce(), 0);
    }

    #[test]
    fn chunked_round_trip_across_boundary() {
        let mut sender = CipherState::from_key([3; 32]);
        let mut receiver = CipherState::from_key([3; 32]);

        let plaintext: Vec<u8> = (0..70_000u32).map(|i| (i % 251) as u8).collect();
        let mut wire = Vec::new();
        sender.encrypt_message(&plaintext, &mut wire).unwrap();
        assert_eq!(wire.len(), encrypted_message_size(plaintext.len()));
        // Two chunks, two nonces.
        assert_eq!(sender.nonce(), 2);

        receiver.decrypt_message(&mut wire).unwrap();
        assert_eq!(wire, plaintext);
        assert_eq!(receiver.nonce(), 2);
    }

    #[quickcheck_macros::quickcheck]
    fn prop_round_trip(key: Vec<u8>, data: Vec<u8>) -> TestResult {
        if key.len() < 32 {
            return TestResult::discard();
        }
        let mut k = [0u8; 32];
        k.copy_from_slice(&key[..32]);

        let mut sender = CipherState::from_key(k);
        let mut receiver = CipherState::from_key(k);

        let mut wire = Vec::new();
        sender.encrypt_message(&data, &mut wire).unwrap();
        assert_eq!(wire.len(), encrypted_message_size(data.len()));
        receiver.decrypt_message(&mut wire).unwrap();
        TestResult::from_bool(wire == data && sender.nonce() == receiver.nonce())
    }
}
