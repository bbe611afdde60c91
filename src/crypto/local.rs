//! Default symmetric/exchange crypto: XChaCha20-Poly1305 with a prepended
//! 24-byte random nonce, X25519 for the invitation exchange, HKDF-SHA256 for
//! conversation-id salt derivation.

use chacha20poly1305::{
    aead::{Aead, KeyInit, OsRng},
    XChaCha20Poly1305, XNonce,
};
use hkdf::Hkdf;
use rand::RngCore;
use sha2::Sha256;
use uuid::Uuid;
use x25519_dalek::{PublicKey, StaticSecret};

use crate::crypto::{
    BubblesCrypto, ContactLocalKey, ContactSharedKey, ExchangeKeyPair, ExchangeSecretKey,
};
use crate::error::ProtocolError;

const KEY_LEN: usize = 32;
const NONCE_LEN: usize = 24;

/// Stateless [`BubblesCrypto`] implementation.
#[derive(Debug, Default, Clone, Copy)]
pub struct LocalCrypto;

impl LocalCrypto {
    pub fn new() -> Self {
        Self
    }

    /// Generate a fresh 32-byte contact local key.
    pub fn generate_local_key() -> ContactLocalKey {
        let mut bytes = vec![0u8; KEY_LEN];
        OsRng.fill_bytes(&mut bytes);
        ContactLocalKey::new(bytes)
    }
}

fn seal(key: &[u8], plain: &[u8], on_err: ProtocolError) -> Result<Vec<u8>, ProtocolError> {
    if key.len() != KEY_LEN {
        return Err(on_err);
    }
    let cipher = XChaCha20Poly1305::new_from_slice(key).map_err(|_| on_err.clone())?;

    let mut nonce_bytes = [0u8; NONCE_LEN];
    OsRng.fill_bytes(&mut nonce_bytes);
    let nonce = XNonce::from_slice(&nonce_bytes);

    let ciphertext = cipher.encrypt(nonce, plain).map_err(|_| on_err)?;

    let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
    out.extend_from_slice(&nonce_bytes);
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

fn open(key: &[u8], data: &[u8], on_err: ProtocolError) -> Result<Vec<u8>, ProtocolError> {
    if key.len() != KEY_LEN || data.len() < NONCE_LEN {
        return Err(on_err);
    }
    let cipher = XChaCha20Poly1305::new_from_slice(key).map_err(|_| on_err.clone())?;
    let nonce = XNonce::from_slice(&data[..NONCE_LEN]);
    cipher.decrypt(nonce, &data[NONCE_LEN..]).map_err(|_| on_err)
}

impl BubblesCrypto for LocalCrypto {
    fn local_encrypt(&self, key: &ContactLocalKey, plain: &[u8]) -> Result<Vec<u8>, ProtocolError> {
        seal(key.as_bytes(), plain, ProtocolError::LocalEncryptionFailed)
    }

    fn local_decrypt(&self, key: &ContactLocalKey, data: &[u8]) -> Result<Vec<u8>, ProtocolError> {
        open(key.as_bytes(), data, ProtocolError::LocalDecryptionFailed)
    }

    fn shared_encrypt(
        &self,
        key: &ContactSharedKey,
        plain: &[u8],
    ) -> Result<Vec<u8>, ProtocolError> {
        seal(key.as_bytes(), plain, ProtocolError::LocalEncryptionFailed)
    }

    fn shared_decrypt(
        &self,
        key: &ContactSharedKey,
        data: &[u8],
    ) -> Result<Vec<u8>, ProtocolError> {
        open(key.as_bytes(), data, ProtocolError::LocalDecryptionFailed)
    }

    fn generate_exchange_keypair(&self) -> ExchangeKeyPair {
        let secret = StaticSecret::random_from_rng(OsRng);
        let public = PublicKey::from(&secret);
        ExchangeKeyPair {
            public: public.as_bytes().to_vec(),
            secret: ExchangeSecretKey::new(secret.to_bytes().to_vec()),
        }
    }

    fn diffie_hellman(
        &self,
        their_public: &[u8],
        our_secret: &ExchangeSecretKey,
    ) -> Result<ContactSharedKey, ProtocolError> {
        let public: [u8; 32] = their_public
            .try_into()
            .map_err(|_| ProtocolError::LocalDecryptionFailed)?;
        let secret: [u8; 32] = our_secret
            .as_bytes()
            .try_into()
            .map_err(|_| ProtocolError::LocalDecryptionFailed)?;

        let shared = StaticSecret::from(secret).diffie_hellman(&PublicKey::from(public));

        // Run the raw DH output through HKDF before using it as an AEAD key.
        let hk = Hkdf::<Sha256>::new(None, shared.as_bytes());
        let mut okm = vec![0u8; KEY_LEN];
        hk.expand(b"bubbles-contact-shared-key-v1", &mut okm)
            .map_err(|_| ProtocolError::LocalEncryptionFailed)?;
        Ok(ContactSharedKey::new(okm))
    }

    fn derive_conversation_key(&self, conversation_id: &Uuid, len: usize) -> Vec<u8> {
        let hk = Hkdf::<Sha256>::new(None, conversation_id.as_bytes());
        let mut okm = vec![0u8; len];
        // Expand cannot fail for output sizes the protocol uses (<= 8160 bytes).
        hk.expand(b"bubbles-conversation-salt-v1", &mut okm)
            .unwrap_or_default();
        okm
    }
}
