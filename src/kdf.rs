//! Password-based key derivation (PBKDF2-HMAC-SHA256)

use crate::error::{ErrorCategory, ErrorKind, Result, SecureMediaError};
use crate::header::SALT_LEN;
use hmac::{Hmac, Mac};
use pbkdf2::pbkdf2_hmac;
use sha2::Sha256;
use std::fmt;
use zeroize::Zeroizing;

pub(crate) type HmacSha256 = Hmac<Sha256>;

/// Length of derived key in bytes (AES-256)
pub const KEY_LEN: usize = 32;

/// Default PBKDF2 iteration count. Raising it makes every password guess
/// against a stolen container proportionally more expensive; containers must
/// be decrypted with the count they were encrypted with.
pub const PBKDF2_ITERATIONS: u32 = 100_000;

/// Lowest iteration count `derive_key` accepts
pub const MIN_PBKDF2_ITERATIONS: u32 = 100_000;

/// Domain separation label for the version 2 MAC subkey
const MAC_KEY_LABEL: &[u8] = b"secure-media v2 mac key";

/// A 256-bit key derived from a password.
///
/// The bytes are wiped on drop and never shown by `Debug`.
pub struct DerivedKey(Zeroizing<[u8; KEY_LEN]>);

impl DerivedKey {
    #[cfg(test)]
    pub(crate) fn from_bytes(bytes: [u8; KEY_LEN]) -> Self {
        DerivedKey(Zeroizing::new(bytes))
    }

    pub fn expose_secret(&self) -> &[u8; KEY_LEN] {
        &self.0
    }

    /// Subkey used to authenticate version 2 containers, so the cipher key
    /// is never used directly as a MAC key.
    pub(crate) fn mac_key(&self) -> Result<DerivedKey> {
        let mut mac = HmacSha256::new_from_slice(self.expose_secret()).map_err(|_| {
            SecureMediaError::with_kind(
                ErrorCategory::Internal,
                ErrorKind::InternalInvariant,
                "failed to initialize HMAC",
            )
        })?;
        mac.update(MAC_KEY_LABEL);
        let mut key = Zeroizing::new([0u8; KEY_LEN]);
        key.copy_from_slice(&mac.finalize().into_bytes());
        Ok(DerivedKey(key))
    }
}

impl fmt::Debug for DerivedKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("DerivedKey([REDACTED])")
    }
}

/// Derive a 32-byte key from a password and salt using PBKDF2-HMAC-SHA256.
///
/// Deterministic: the same inputs always produce the same key. A wrong
/// password is not detected here; it just yields a different key.
pub fn derive_key(password: &[u8], salt: &[u8], iterations: u32) -> Result<DerivedKey> {
    if password.is_empty() {
        return Err(SecureMediaError::invalid_input("password must not be empty"));
    }
    if salt.len() != SALT_LEN {
        return Err(SecureMediaError::invalid_input(format!(
            "salt must be {} bytes, got {}",
            SALT_LEN,
            salt.len()
        )));
    }
    if iterations < MIN_PBKDF2_ITERATIONS {
        return Err(SecureMediaError::invalid_input(format!(
            "PBKDF2 iterations must be at least {}, got {}",
            MIN_PBKDF2_ITERATIONS, iterations
        )));
    }

    let mut key = Zeroizing::new([0u8; KEY_LEN]);
    pbkdf2_hmac::<Sha256>(password, salt, iterations, key.as_mut_slice());
    Ok(DerivedKey(key))
}
