use std::fmt;

use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm, Nonce,
};
use hkdf::Hkdf;
use rand::{rngs::OsRng, RngCore};
use sha2::Sha256;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::{Error, Result};

pub const SECRET_LEN: usize = 32;
pub const FRAME_NONCE_LEN: usize = 12;
pub const TAG_LEN: usize = 16;
/// Bytes a sealed frame adds to its plaintext.
pub const SEAL_OVERHEAD: usize = FRAME_NONCE_LEN + TAG_LEN;
pub const KEX_NONCE_LEN: usize = 32;

const HKDF_INFO: &[u8] = b"vssh session secret";

/// Per-session symmetric key. Never persisted; wiped on drop.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct SessionSecret {
    key: [u8; SECRET_LEN],
}

impl SessionSecret {
    /// HKDF-SHA256 over the Diffie-Hellman output, salted with both nonces.
    pub fn derive(
        shared: &[u8],
        initiator_nonce: &[u8; KEX_NONCE_LEN],
        responder_nonce: &[u8; KEX_NONCE_LEN],
    ) -> Result<Self> {
        let mut salt = [0; KEX_NONCE_LEN * 2];
        salt[..KEX_NONCE_LEN].copy_from_slice(initiator_nonce);
        salt[KEX_NONCE_LEN..].copy_from_slice(responder_nonce);

        let hk = Hkdf::<Sha256>::new(Some(&salt), shared);
        let mut key = [0; SECRET_LEN];
        hk.expand(HKDF_INFO, &mut key)
            .map_err(|e| Error::AuthenticationFailure(format!("hkdf: {}", e)))?;
        salt.zeroize();
        Ok(SessionSecret { key })
    }

    #[must_use]
    pub fn from_bytes(key: [u8; SECRET_LEN]) -> Self {
        SessionSecret { key }
    }

    #[must_use]
    pub fn as_bytes(&self) -> &[u8; SECRET_LEN] {
        &self.key
    }

    fn cipher(&self) -> Result<Aes256Gcm> {
        Aes256Gcm::new_from_slice(&self.key)
            .map_err(|e| Error::AuthenticationFailure(format!("cipher: {}", e)))
    }

    /// `nonce || ciphertext || tag` with a fresh random nonce.
    pub fn seal(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
        let mut nonce = [0; FRAME_NONCE_LEN];
        OsRng.fill_bytes(&mut nonce);
        let ciphertext = self
            .cipher()?
            .encrypt(Nonce::from_slice(&nonce), plaintext)
            .map_err(|e| Error::AuthenticationFailure(format!("seal: {}", e)))?;

        let mut frame = Vec::with_capacity(SEAL_OVERHEAD + plaintext.len());
        frame.extend_from_slice(&nonce);
        frame.extend_from_slice(&ciphertext);
        Ok(frame)
    }

    pub fn open(&self, frame: &[u8]) -> Result<Vec<u8>> {
        if frame.len() < SEAL_OVERHEAD {
            return Err(Error::AuthenticationFailure("frame too short".into()));
        }
        let (nonce, ciphertext) = frame.split_at(FRAME_NONCE_LEN);
        self.cipher()?
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_e| Error::AuthenticationFailure("frame does not authenticate".into()))
    }
}

impl fmt::Debug for SessionSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SessionSecret(..)")
    }
}

impl PartialEq for SessionSecret {
    fn eq(&self, other: &Self) -> bool {
        self.key == other.key
    }
}

impl Eq for SessionSecret {}
