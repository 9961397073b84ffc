/// Application name
pub const APP_NAME: &str = "Parley";

/// Symmetric session key size in bytes
pub const SESSION_KEY_SIZE: usize = 32;

/// Ed25519 public key size in bytes
pub const PUBKEY_SIZE: usize = 32;

/// X25519 public key size in bytes
pub const X25519_KEY_SIZE: usize = 32;

/// XChaCha20-Poly1305 nonce size in bytes
pub const XNONCE_SIZE: usize = 24;

/// ChaCha20-Poly1305 (IETF) nonce size in bytes
pub const NONCE_SIZE: usize = 12;

/// Version byte prefixed to derived addresses
pub const ADDRESS_VERSION: u8 = 0x01;

/// Handshake sequence tags carried in single-byte envelope ids.
/// Tag 1 is the only message that travels with the sender's public key.
pub const HANDSHAKE_SEQ_REQUEST: u8 = 1;
pub const HANDSHAKE_SEQ_KEYS: u8 = 2;

/// Relay fetch cooldown in seconds
pub const FETCH_COOLDOWN_SECS: u64 = 60;

/// Relay literal responses
pub const RELAY_OK: &str = "OK";
pub const RELAY_EMPTY: &str = "FALSE";

/// Key derivation contexts (BLAKE3)
pub const KDF_CONTEXT_ADDRESS: &str = "parley-address-v1";
pub const KDF_CONTEXT_SEALED_BOX: &str = "parley-sealed-box-v1";
