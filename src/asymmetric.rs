//! Device-key wrapping of DEKs.
//!
//! Wrapped keys are algorithm-tagged so grants written under an older
//! scheme stay readable after the write scheme changes:
//!
//! - **RSA-OAEP (SHA-256)**, modulus ≥ 2048 bits. The scheme new grants
//!   are written with.
//! - **X25519 ECDH**: ephemeral-static agreement, HKDF-SHA256 to a 256-bit
//!   key, then AES-256-GCM. Legacy; readable, and producible for clients
//!   that still hold X25519 device keys, but never written into a grant.
//!
//! Private-key operations run on the device. The server side of this crate
//! only ever calls [`wrap_asymmetric`].

use rand::rngs::OsRng;
use ring::hkdf;
use rsa::pkcs8::DecodePublicKey;
use rsa::traits::PublicKeyParts;
use rsa::{Oaep, RsaPrivateKey, RsaPublicKey};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use x25519_dalek::{EphemeralSecret, PublicKey as X25519PublicKey, StaticSecret};
use zeroize::Zeroizing;

use crate::crypto::{self, SealedBox, KEY_LEN, NONCE_LEN, TAG_LEN};
use crate::error::CryptoError;
use crate::keys::Dek;

/// Smallest accepted RSA modulus, in bytes (2048 bits).
const MIN_RSA_MODULUS_BYTES: usize = 256;

/// Length of an X25519 public key.
pub const X25519_KEY_LEN: usize = 32;

/// HKDF info for the legacy ECDH scheme.
const ECDH_WRAP_INFO: &[u8] = b"uekvault:ecdh-wrap:v1";

/// Asymmetric algorithm of a device key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum KeyAlgorithm {
    RsaOaepSha256,
    X25519,
}

impl KeyAlgorithm {
    pub fn name(&self) -> &'static str {
        match self {
            Self::RsaOaepSha256 => "RSA-OAEP-SHA256",
            Self::X25519 => "X25519-ECDH",
        }
    }
}

/// A device public key as presented by a client: which device it claims to
/// belong to, and the key itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DevicePublicKey {
    pub device_id: String,
    pub algorithm: KeyAlgorithm,
    /// SPKI DER for RSA, raw 32 bytes for X25519.
    pub key: Vec<u8>,
}

impl DevicePublicKey {
    /// Check that the key parses for its declared algorithm.
    pub fn validate(&self) -> Result<(), CryptoError> {
        match self.algorithm {
            KeyAlgorithm::RsaOaepSha256 => parse_rsa_public_key(&self.key).map(|_| ()),
            KeyAlgorithm::X25519 => parse_x25519_public_key(&self.key).map(|_| ()),
        }
    }
}

/// A device private key. Lives on the device only.
pub enum DevicePrivateKey {
    Rsa(RsaPrivateKey),
    X25519(StaticSecret),
}

/// A key wrapped for one device, tagged with the scheme that wrapped it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "scheme")]
pub enum WrappedKey {
    RsaOaep {
        ciphertext: Vec<u8>,
    },
    Ecdh {
        ephemeral_public_key: [u8; X25519_KEY_LEN],
        ciphertext: Vec<u8>,
        nonce: [u8; NONCE_LEN],
        auth_tag: [u8; TAG_LEN],
    },
}

impl WrappedKey {
    pub fn algorithm(&self) -> KeyAlgorithm {
        match self {
            Self::RsaOaep { .. } => KeyAlgorithm::RsaOaepSha256,
            Self::Ecdh { .. } => KeyAlgorithm::X25519,
        }
    }
}

fn parse_rsa_public_key(der: &[u8]) -> Result<RsaPublicKey, CryptoError> {
    let key = RsaPublicKey::from_public_key_der(der).map_err(|_| CryptoError::InvalidKey)?;
    if key.size() < MIN_RSA_MODULUS_BYTES {
        return Err(CryptoError::InvalidKey);
    }
    Ok(key)
}

fn parse_x25519_public_key(raw: &[u8]) -> Result<X25519PublicKey, CryptoError> {
    let bytes: [u8; X25519_KEY_LEN] = raw.try_into().map_err(|_| CryptoError::InvalidKey)?;
    Ok(X25519PublicKey::from(bytes))
}

/// Stretch an X25519 shared secret into an AES-256-GCM key.
fn ecdh_wrapping_key(shared: &[u8; 32]) -> Result<Zeroizing<[u8; KEY_LEN]>, CryptoError> {
    let salt = hkdf::Salt::new(hkdf::HKDF_SHA256, &[]);
    let prk = salt.extract(shared);
    let info = [ECDH_WRAP_INFO];
    let okm = prk
        .expand(&info, hkdf::HKDF_SHA256)
        .map_err(|_| CryptoError::Primitive("hkdf expand failed"))?;

    let mut key = Zeroizing::new([0u8; KEY_LEN]);
    okm.fill(&mut key[..])
        .map_err(|_| CryptoError::Primitive("hkdf fill failed"))?;
    Ok(key)
}

/// Wrap a DEK for a device public key.
pub fn wrap_asymmetric(device_key: &DevicePublicKey, dek: &Dek) -> Result<WrappedKey, CryptoError> {
    match device_key.algorithm {
        KeyAlgorithm::RsaOaepSha256 => {
            let public_key = parse_rsa_public_key(&device_key.key)?;
            let ciphertext = public_key
                .encrypt(&mut OsRng, Oaep::new::<Sha256>(), dek.as_bytes())
                .map_err(|_| CryptoError::Primitive("rsa-oaep encryption failed"))?;
            Ok(WrappedKey::RsaOaep { ciphertext })
        }
        KeyAlgorithm::X25519 => {
            let recipient = parse_x25519_public_key(&device_key.key)?;
            let ephemeral = EphemeralSecret::random_from_rng(OsRng);
            let ephemeral_public = X25519PublicKey::from(&ephemeral);
            let shared = ephemeral.diffie_hellman(&recipient);

            let key = ecdh_wrapping_key(shared.as_bytes())?;
            let SealedBox {
                ciphertext,
                nonce,
                auth_tag,
            } = crypto::seal(&key, dek.as_bytes())?;

            Ok(WrappedKey::Ecdh {
                ephemeral_public_key: ephemeral_public.to_bytes(),
                ciphertext,
                nonce,
                auth_tag,
            })
        }
    }
}

/// Unwrap a DEK with a device private key. Runs on the device.
///
/// A scheme/key mismatch, a wrong key and a tampered wrap all fail with
/// [`CryptoError::Authentication`].
pub fn unwrap_asymmetric(private_key: &DevicePrivateKey, wrapped: &WrappedKey) -> Result<Dek, CryptoError> {
    match (private_key, wrapped) {
        (DevicePrivateKey::Rsa(key), WrappedKey::RsaOaep { ciphertext }) => {
            let plaintext = Zeroizing::new(
                key.decrypt(Oaep::new::<Sha256>(), ciphertext)
                    .map_err(|_| CryptoError::Authentication)?,
            );
            Dek::from_slice(&plaintext)
        }
        (
            DevicePrivateKey::X25519(secret),
            WrappedKey::Ecdh {
                ephemeral_public_key,
                ciphertext,
                nonce,
                auth_tag,
            },
        ) => {
            let shared = secret.diffie_hellman(&X25519PublicKey::from(*ephemeral_public_key));
            let key = ecdh_wrapping_key(shared.as_bytes())?;
            let sealed = SealedBox {
                ciphertext: ciphertext.clone(),
                nonce: *nonce,
                auth_tag: *auth_tag,
            };
            let plaintext = crypto::open(&key, &sealed)?;
            Dek::from_slice(&plaintext)
        }
        _ => Err(CryptoError::Authentication),
    }
}
