use chacha20poly1305::{
    aead::{Aead, KeyInit},
    ChaCha20Poly1305, Nonce, XChaCha20Poly1305, XNonce,
};
use ed25519_dalek::VerifyingKey;
use rand::RngCore;
use x25519_dalek::{EphemeralSecret, PublicKey as X25519PublicKey, StaticSecret};

use crate::constants::{
    KDF_CONTEXT_SEALED_BOX, NONCE_SIZE, PUBKEY_SIZE, SESSION_KEY_SIZE, X25519_KEY_SIZE, XNONCE_SIZE,
};
use crate::error::CryptoError;
use crate::types::SessionSlot;

pub type SessionKey = [u8; SESSION_KEY_SIZE];

pub fn secure_random_bytes(len: usize) -> Result<Vec<u8>, CryptoError> {
    let mut out = vec![0u8; len];
    rand::rngs::OsRng
        .try_fill_bytes(&mut out)
        .map_err(|_| CryptoError::RandomUnavailable)?;
    Ok(out)
}

pub fn generate_session_key() -> Result<SessionKey, CryptoError> {
    let mut key = [0u8; SESSION_KEY_SIZE];
    rand::rngs::OsRng
        .try_fill_bytes(&mut key)
        .map_err(|_| CryptoError::RandomUnavailable)?;
    Ok(key)
}

pub fn session_key_from_slice(bytes: &[u8]) -> Result<SessionKey, CryptoError> {
    bytes.try_into().map_err(|_| CryptoError::InvalidKeyLength)
}

// Slot A: ChaCha20-Poly1305, 12-byte nonce. Slot B: XChaCha20-Poly1305, 24-byte nonce.
// Returns nonce || ciphertext.
pub fn encrypt(slot: SessionSlot, key: &SessionKey, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
    match slot {
        SessionSlot::A => {
            let cipher = ChaCha20Poly1305::new(key.into());
            let nonce_bytes = secure_random_bytes(NONCE_SIZE)?;
            let ciphertext = cipher
                .encrypt(Nonce::from_slice(&nonce_bytes), plaintext)
                .map_err(|_| CryptoError::EncryptionFailed)?;
            Ok([nonce_bytes, ciphertext].concat())
        }
        SessionSlot::B => {
            let cipher = XChaCha20Poly1305::new(key.into());
            let nonce_bytes = secure_random_bytes(XNONCE_SIZE)?;
            let ciphertext = cipher
                .encrypt(XNonce::from_slice(&nonce_bytes), plaintext)
                .map_err(|_| CryptoError::EncryptionFailed)?;
            Ok([nonce_bytes, ciphertext].concat())
        }
    }
}

pub fn decrypt(slot: SessionSlot, key: &SessionKey, data: &[u8]) -> Result<Vec<u8>, CryptoError> {
    match slot {
        SessionSlot::A => {
            if data.len() < NONCE_SIZE {
                return Err(CryptoError::DecryptionFailed);
            }
            let (nonce_bytes, ciphertext) = data.split_at(NONCE_SIZE);
            ChaCha20Poly1305::new(key.into())
                .decrypt(Nonce::from_slice(nonce_bytes), ciphertext)
                .map_err(|_| CryptoError::DecryptionFailed)
        }
        SessionSlot::B => {
            if data.len() < XNONCE_SIZE {
                return Err(CryptoError::DecryptionFailed);
            }
            let (nonce_bytes, ciphertext) = data.split_at(XNONCE_SIZE);
            XChaCha20Poly1305::new(key.into())
                .decrypt(XNonce::from_slice(nonce_bytes), ciphertext)
                .map_err(|_| CryptoError::DecryptionFailed)
        }
    }
}

/// The X25519 public key matching an Ed25519 public key.
pub fn x25519_public_key(ed25519_public_key: &[u8]) -> Result<X25519PublicKey, CryptoError> {
    let bytes: &[u8; PUBKEY_SIZE] = ed25519_public_key
        .try_into()
        .map_err(|_| CryptoError::InvalidKeyLength)?;
    let verifying_key = VerifyingKey::from_bytes(bytes).map_err(|_| CryptoError::InvalidPublicKey)?;
    Ok(X25519PublicKey::from(verifying_key.to_montgomery().to_bytes()))
}

fn sealed_box_key(
    shared: &[u8; 32],
    ephemeral: &X25519PublicKey,
    recipient: &X25519PublicKey,
) -> SessionKey {
    let mut material = Vec::with_capacity(3 * X25519_KEY_SIZE);
    material.extend_from_slice(shared);
    material.extend_from_slice(ephemeral.as_bytes());
    material.extend_from_slice(recipient.as_bytes());
    blake3::derive_key(KDF_CONTEXT_SEALED_BOX, &material)
}

/// Encrypt `plaintext` so only the holder of `recipient_public_key`
/// (Ed25519) can read it. Anonymous: a fresh ephemeral X25519 key per call.
///
/// Returns ephemeral public key || nonce || ciphertext.
pub fn seal(recipient_public_key: &[u8], plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let recipient = x25519_public_key(recipient_public_key)?;
    let ephemeral = EphemeralSecret::random_from_rng(rand::rngs::OsRng);
    let ephemeral_public = X25519PublicKey::from(&ephemeral);

    let shared = ephemeral.diffie_hellman(&recipient);
    if !shared.was_contributory() {
        return Err(CryptoError::InvalidPublicKey);
    }

    let key = sealed_box_key(shared.as_bytes(), &ephemeral_public, &recipient);
    let ciphertext = encrypt(SessionSlot::B, &key, plaintext)?;
    Ok([ephemeral_public.as_bytes().as_slice(), ciphertext.as_slice()].concat())
}

/// Open a [`seal`]ed payload with the recipient's X25519 secret.
pub fn open_sealed(secret: &StaticSecret, data: &[u8]) -> Result<Vec<u8>, CryptoError> {
    if data.len() < X25519_KEY_SIZE {
        return Err(CryptoError::DecryptionFailed);
    }
    let (ephemeral, ciphertext) = data.split_at(X25519_KEY_SIZE);
    let ephemeral: [u8; X25519_KEY_SIZE] = ephemeral
        .try_into()
        .map_err(|_| CryptoError::DecryptionFailed)?;
    let ephemeral_public = X25519PublicKey::from(ephemeral);

    let shared = secret.diffie_hellman(&ephemeral_public);
    if !shared.was_contributory() {
        return Err(CryptoError::DecryptionFailed);
    }

    let key = sealed_box_key(shared.as_bytes(), &ephemeral_public, &X25519PublicKey::from(secret));
    decrypt(SessionSlot::B, &key, ciphertext)
}
