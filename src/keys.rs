//! Key derivation and ownership.
//!
//! This module owns three responsibilities:
//! 1. Deriving key-encryption keys (KEKs) from passphrases with Argon2id.
//! 2. Deriving per-resource content keys from the UEK with HKDF-SHA256.
//! 3. Holding key material in fixed-length types that are non-cloneable,
//!    redacted in `Debug`, and zeroised on drop.
//!
//! ## Key hierarchy
//!
//! ```text
//! passphrase --Argon2id(salt)--> KEK --wraps--> UEK
//! UEK --HKDF(info = "{kind}:{resource_id}:v{version}")--> resource key
//! DEK (per shared resource) --wrapped per device--> KeyGrant
//! ```
//!
//! The UEK never changes across rotations; only its wrapping does. A
//! resource key is reproducible for any version, which is what lets an
//! interrupted rotation resume.

use std::fmt;

use argon2::{Algorithm, Argon2, Params, Version};
use ring::hkdf;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::config::KdfParams;
use crate::crypto::{self, SealedBox, KEY_LEN};
use crate::error::CryptoError;
use crate::model::ResourceKind;

macro_rules! secret_key_type {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Zeroize, ZeroizeOnDrop)]
        pub struct $name {
            bytes: [u8; KEY_LEN],
        }

        impl $name {
            pub(crate) fn as_bytes(&self) -> &[u8; KEY_LEN] {
                &self.bytes
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(concat!(stringify!($name), "(<redacted>)"))
            }
        }
    };
}

secret_key_type!(
    /// A key-encryption key derived from a passphrase. Used only to wrap and
    /// unwrap the UEK.
    Kek
);

secret_key_type!(
    /// The User Encryption Key. The single secret from which every owned
    /// resource's content key is derived.
    Uek
);

secret_key_type!(
    /// A per-resource data-encryption key, shared with collaborators through
    /// device key grants.
    Dek
);

secret_key_type!(
    /// A content key for one resource at one encryption version.
    ResourceKey
);

impl Uek {
    /// Generate a fresh random UEK.
    pub fn generate() -> Result<Self, CryptoError> {
        Ok(Self {
            bytes: crypto::generate_random_key()?,
        })
    }

    /// Borrow the raw key bytes. Client-side use only; the server never
    /// needs to see them outside this crate.
    pub fn expose_bytes(&self) -> &[u8; KEY_LEN] {
        &self.bytes
    }
}

impl Dek {
    /// Generate a fresh random DEK.
    pub fn generate() -> Result<Self, CryptoError> {
        Ok(Self {
            bytes: crypto::generate_random_key()?,
        })
    }

    /// Construct a DEK from raw bytes held by the document layer.
    pub fn from_bytes(bytes: [u8; KEY_LEN]) -> Self {
        Self { bytes }
    }

    /// Borrow the raw key bytes. Client-side use only.
    pub fn expose_bytes(&self) -> &[u8; KEY_LEN] {
        &self.bytes
    }

    pub(crate) fn from_slice(bytes: &[u8]) -> Result<Self, CryptoError> {
        let bytes: [u8; KEY_LEN] = bytes.try_into().map_err(|_| CryptoError::InvalidKey)?;
        Ok(Self { bytes })
    }
}

impl Uek {
    fn from_slice(bytes: &[u8]) -> Result<Self, CryptoError> {
        let bytes: [u8; KEY_LEN] = bytes.try_into().map_err(|_| CryptoError::InvalidKey)?;
        Ok(Self { bytes })
    }
}

// ---------------------------------------------------------------------------
// Passphrase derivation
// ---------------------------------------------------------------------------

/// Derive a KEK from a passphrase and salt with Argon2id.
///
/// Deterministic for a fixed `(passphrase, salt, params)`. Deliberately
/// expensive; callers should not hold locks shared with request handling
/// while this runs.
pub fn derive_kek(passphrase: &str, salt: &[u8], params: &KdfParams) -> Result<Kek, CryptoError> {
    if passphrase.is_empty() {
        return Err(CryptoError::WeakInput);
    }

    let params = Params::new(
        params.memory_kib,
        params.iterations,
        params.parallelism,
        Some(KEY_LEN),
    )
    .map_err(|_| CryptoError::Primitive("invalid argon2 parameters"))?;
    let argon2 = Argon2::new(Algorithm::Argon2id, Version::V0x13, params);

    let mut kek = Kek {
        bytes: [0u8; KEY_LEN],
    };
    argon2
        .hash_password_into(passphrase.as_bytes(), salt, &mut kek.bytes)
        .map_err(|_| CryptoError::Primitive("argon2 derivation failed"))?;

    Ok(kek)
}

/// Wrap the UEK under a KEK.
pub fn wrap_uek(kek: &Kek, uek: &Uek) -> Result<SealedBox, CryptoError> {
    crypto::seal(kek.as_bytes(), uek.as_bytes())
}

/// Unwrap the UEK. Fails with [`CryptoError::Authentication`] for a wrong
/// KEK and for a corrupted envelope alike.
pub fn unwrap_uek(kek: &Kek, sealed: &SealedBox) -> Result<Uek, CryptoError> {
    let plaintext = crypto::open(kek.as_bytes(), sealed)?;
    Uek::from_slice(&plaintext)
}

// ---------------------------------------------------------------------------
// Resource key derivation
// ---------------------------------------------------------------------------

/// Derive the content key for one resource at one encryption version.
///
/// The `info` string is constructed as:
/// ```text
/// {kind}:{resource_id}:v{version}
/// ```
pub(crate) fn derive_resource_key(
    uek: &Uek,
    kind: ResourceKind,
    resource_id: &str,
    version: u64,
) -> Result<ResourceKey, CryptoError> {
    let info = format!("{}:{}:v{}", kind.tag(), resource_id, version);

    // Empty salt: HKDF treats it as a zero-filled salt of hash length.
    let salt = hkdf::Salt::new(hkdf::HKDF_SHA256, &[]);
    let prk = salt.extract(uek.as_bytes());

    let info_slices = [info.as_bytes()];
    let okm = prk
        .expand(&info_slices, hkdf::HKDF_SHA256)
        .map_err(|_| CryptoError::Primitive("hkdf expand failed"))?;

    let mut key = ResourceKey {
        bytes: [0u8; KEY_LEN],
    };
    okm.fill(&mut key.bytes)
        .map_err(|_| CryptoError::Primitive("hkdf fill failed"))?;

    Ok(key)
}
