use std::path::Path;

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use x25519_dalek::StaticSecret;

use crate::constants::{ADDRESS_VERSION, KDF_CONTEXT_ADDRESS, PUBKEY_SIZE};
use crate::crypto;
use crate::error::{CryptoError, IdentityError};
use crate::types::Address;

/// The local node's Ed25519 identity. The wallet address is derived from the
/// public key; the core only ever reads it.
#[derive(Clone)]
pub struct Identity {
    signing_key: SigningKey,
}

/// Serializable format for storing/exporting identity
#[derive(Serialize, Deserialize)]
pub struct IdentityExport {
    pub secret_key: [u8; 32],
    pub public_key: [u8; 32],
}

impl Identity {
    /// Generate a new random identity
    pub fn generate() -> Self {
        let signing_key = SigningKey::generate(&mut OsRng);
        Self { signing_key }
    }

    /// Restore identity from secret key bytes
    pub fn from_secret_bytes(secret: &[u8; 32]) -> Self {
        let signing_key = SigningKey::from_bytes(secret);
        Self { signing_key }
    }

    pub fn from_export(export: &IdentityExport) -> Self {
        Self::from_secret_bytes(&export.secret_key)
    }

    pub fn to_export(&self) -> IdentityExport {
        IdentityExport {
            secret_key: *self.signing_key.as_bytes(),
            public_key: self.signing_key.verifying_key().to_bytes(),
        }
    }

    /// Load the identity stored at `path`, or create and store a new one.
    pub fn load_or_generate(path: &Path) -> Result<Self, IdentityError> {
        if path.exists() {
            let json =
                std::fs::read_to_string(path).map_err(|e| IdentityError::KeyFile(e.to_string()))?;
            let export: IdentityExport =
                serde_json::from_str(&json).map_err(|e| IdentityError::KeyFile(e.to_string()))?;
            let identity = Self::from_export(&export);
            if identity.public_key_bytes() != export.public_key {
                return Err(IdentityError::InvalidKeyBytes);
            }
            return Ok(identity);
        }

        let identity = Self::generate();
        let json = serde_json::to_string(&identity.to_export())
            .map_err(|e| IdentityError::KeyFile(e.to_string()))?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| IdentityError::KeyFile(e.to_string()))?;
        }
        std::fs::write(path, json).map_err(|e| IdentityError::KeyFile(e.to_string()))?;
        tracing::info!(address = %identity.address(), "generated new identity");
        Ok(identity)
    }

    /// Primary wallet address of this node
    pub fn address(&self) -> Address {
        derive_address(&self.public_key_bytes())
    }

    pub fn public_key_bytes(&self) -> [u8; 32] {
        self.signing_key.verifying_key().to_bytes()
    }

    pub fn sign(&self, message: &[u8]) -> Signature {
        self.signing_key.sign(message)
    }

    pub fn verifying_key(&self) -> VerifyingKey {
        self.signing_key.verifying_key()
    }

    /// Open a payload sealed to this identity's public key.
    pub fn open_sealed(&self, data: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let secret = StaticSecret::from(self.signing_key.to_scalar_bytes());
        crypto::open_sealed(&secret, data)
    }
}

/// Derive the wallet address that belongs to a public key.
pub fn derive_address(public_key: &[u8]) -> Address {
    let digest = blake3::derive_key(KDF_CONTEXT_ADDRESS, public_key);
    let mut bytes = Vec::with_capacity(1 + digest.len());
    bytes.push(ADDRESS_VERSION);
    bytes.extend_from_slice(&digest);
    Address(bytes)
}

/// Verify a detached signature against raw public key bytes.
pub fn verify_signature(
    public_key: &[u8],
    message: &[u8],
    signature: &[u8],
) -> Result<(), IdentityError> {
    let key_bytes: &[u8; PUBKEY_SIZE] = public_key
        .try_into()
        .map_err(|_| IdentityError::InvalidKeyBytes)?;
    let verifying_key =
        VerifyingKey::from_bytes(key_bytes).map_err(|_| IdentityError::InvalidKeyBytes)?;
    let signature =
        Signature::from_slice(signature).map_err(|_| IdentityError::InvalidSignature)?;
    verifying_key
        .verify(message, &signature)
        .map_err(|_| IdentityError::InvalidSignature)
}
