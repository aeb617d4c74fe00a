//! Authentication key derivation.
//!
//! The device authenticates hosts against a 32-byte key stored in one of its
//! key slots. Hosts usually hold the key as a password and derive the bytes
//! with PBKDF2, matching what the device setup tooling stored.

use std::fmt;

use pbkdf2::pbkdf2_hmac;
use sha2::Sha256;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// AES-128 key length; also the size of each authentication key half
pub const KEY_LENGTH: usize = 16;

/// Full authentication key length
pub const AUTH_KEY_LENGTH: usize = 2 * KEY_LENGTH;

const PBKDF2_SALT: &[u8] = b"Yubico";
const PBKDF2_ITERATIONS: u32 = 10_000;

/// The static authentication key: ENC half followed by MAC half.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct AuthKey([u8; AUTH_KEY_LENGTH]);

impl AuthKey {
    /// Derive the key from a password with PBKDF2-HMAC-SHA256
    /// (salt `"Yubico"`, 10 000 iterations).
    pub fn derive(password: &str) -> Self {
        let mut key = [0u8; AUTH_KEY_LENGTH];
        pbkdf2_hmac::<Sha256>(password.as_bytes(), PBKDF2_SALT, PBKDF2_ITERATIONS, &mut key);
        Self(key)
    }

    /// Use raw key material directly (e.g. when no password exists).
    pub fn from_bytes(key: [u8; AUTH_KEY_LENGTH]) -> Self {
        Self(key)
    }

    /// The static encryption key half.
    pub fn enc_key(&self) -> &[u8; KEY_LENGTH] {
        self.0[..KEY_LENGTH].try_into().expect("half of a 32-byte key")
    }

    /// The static MAC key half.
    pub fn mac_key(&self) -> &[u8; KEY_LENGTH] {
        self.0[KEY_LENGTH..].try_into().expect("half of a 32-byte key")
    }
}

impl fmt::Debug for AuthKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Never leak key material through debug output
        write!(f, "AuthKey([REDACTED, {AUTH_KEY_LENGTH} bytes])")
    }
}

/// Session keys derived during the authentication ceremony.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct KeyChain {
    pub(crate) enc: [u8; KEY_LENGTH],
    pub(crate) mac: [u8; KEY_LENGTH],
    pub(crate) rmac: [u8; KEY_LENGTH],
}

impl fmt::Debug for KeyChain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "KeyChain([REDACTED])")
    }
}
