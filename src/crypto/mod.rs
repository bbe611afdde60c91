//! Crypto capability boundary.
//!
//! The core never inspects ratchet internals: the double-ratchet engine is an
//! injected capability behind [`RatchetEngine`], and the symmetric
//! local/shared encryption behind [`BubblesCrypto`]. This keeps the protocol
//! independently testable with a fake engine.
//!
//! [`local::LocalCrypto`] is the default [`BubblesCrypto`] implementation
//! (XChaCha20-Poly1305 + X25519 + HKDF-SHA256).

pub mod local;

use serde::{Deserialize, Serialize};
use uuid::Uuid;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::{ProtocolError, RatchetError};
use crate::protocol::envelope::MessageHeader;

/// Per-contact symmetric key protecting data at rest (order records,
/// reset dates). Never leaves the device.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct ContactLocalKey(Vec<u8>);

impl ContactLocalKey {
    pub fn new(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

/// Shared symmetric key established by the invitation handshake. Protects
/// `Normal` and `ResetInvitation` wire payloads (not the ratchet body).
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct ContactSharedKey(Vec<u8>);

impl ContactSharedKey {
    pub fn new(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

/// Ephemeral DH keypair carried through the invitation exchange
/// (the invitation's `localPublicKey` / its stored counterpart).
#[derive(Clone)]
pub struct ExchangeKeyPair {
    pub public: Vec<u8>,
    pub secret: ExchangeSecretKey,
}

#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct ExchangeSecretKey(Vec<u8>);

impl ExchangeSecretKey {
    pub fn new(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

/// Opaque ratchet session state. The core persists it byte-for-byte after
/// every successful encrypt/decrypt and never interprets it.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RatchetState(pub Vec<u8>);

/// Output of a ratchet encryption step.
pub struct RatchetSealed {
    pub header: MessageHeader,
    pub body: Vec<u8>,
    pub new_state: RatchetState,
}

/// Output of a ratchet decryption step.
pub struct RatchetOpened {
    pub plaintext: Vec<u8>,
    pub new_state: RatchetState,
}

/// Double-ratchet capability.
///
/// Implementations own key derivation entirely; the engine only threads the
/// opaque state through and persists it. Persistence of `new_state` is the
/// atomicity boundary: if the store write fails after a successful call here,
/// the whole operation is reported failed.
pub trait RatchetEngine {
    /// Start a conversation as the inviter. Returns the ratchet public key to
    /// embed in the invitation and the initial session state (no sending
    /// chain yet — sending before the handshake reply fails with
    /// [`RatchetError::ConversationNotSetup`]).
    fn create_invitation_keys(
        &self,
        conversation_salt: &[u8],
    ) -> Result<(Vec<u8>, RatchetState), RatchetError>;

    /// Start a conversation from a received invitation (or reset invitation)
    /// carrying the peer's ratchet public key.
    fn accept_invitation(
        &self,
        their_ratchet_public: &[u8],
        conversation_salt: &[u8],
    ) -> Result<RatchetState, RatchetError>;

    /// Derive the next message key and seal `plaintext` for sending.
    fn encrypt_for_ratchet(
        &self,
        state: &RatchetState,
        plaintext: &[u8],
    ) -> Result<RatchetSealed, RatchetError>;

    /// Recover the message key referenced by `header` and open `body`.
    ///
    /// Failure contract: [`RatchetError::MessageKeyNotFound`] for a replayed
    /// (already consumed) message, [`RatchetError::RequiredChainKeyMissing`]
    /// for a header referencing a chain this side never initialized.
    fn decrypt_from_ratchet(
        &self,
        state: &RatchetState,
        header: &MessageHeader,
        body: &[u8],
    ) -> Result<RatchetOpened, RatchetError>;
}

/// Symmetric and exchange crypto used around the ratchet.
pub trait BubblesCrypto {
    /// Encrypt data at rest with the per-contact local key.
    fn local_encrypt(&self, key: &ContactLocalKey, plain: &[u8]) -> Result<Vec<u8>, ProtocolError>;

    /// Decrypt data at rest with the per-contact local key.
    fn local_decrypt(&self, key: &ContactLocalKey, data: &[u8]) -> Result<Vec<u8>, ProtocolError>;

    /// Encrypt a wire payload with the handshake-established shared key.
    fn shared_encrypt(
        &self,
        key: &ContactSharedKey,
        plain: &[u8],
    ) -> Result<Vec<u8>, ProtocolError>;

    /// Decrypt a wire payload with the handshake-established shared key.
    fn shared_decrypt(&self, key: &ContactSharedKey, data: &[u8])
        -> Result<Vec<u8>, ProtocolError>;

    /// Fresh DH keypair for the invitation exchange.
    fn generate_exchange_keypair(&self) -> ExchangeKeyPair;

    /// Agree on the contact shared key from the peer's exchange public key.
    fn diffie_hellman(
        &self,
        their_public: &[u8],
        our_secret: &ExchangeSecretKey,
    ) -> Result<ContactSharedKey, ProtocolError>;

    /// Deterministically derive `len` salt bytes from a conversation id.
    /// Both parties derive the same salt for the same conversation.
    fn derive_conversation_key(&self, conversation_id: &Uuid, len: usize) -> Vec<u8>;
}
