//! Low-level symmetric operations.
//!
//! This module and `keys` are the only places that touch `ring` directly.
//! Everything else seals and opens through the functions here.
//!
//! Primitive choices:
//! - **Cipher**: AES-256-GCM (authenticated encryption)
//! - **Nonce**: 96-bit (12 bytes), generated fresh per operation via `SystemRandom`
//! - **Tag**: 128-bit (16 bytes), stored separately from the ciphertext
//! - **Key size**: 256 bits (32 bytes)

use ring::aead::{self, LessSafeKey, Nonce, UnboundKey, AES_256_GCM};
use ring::rand::{SecureRandom, SystemRandom};
use serde::{Deserialize, Serialize};
use zeroize::Zeroizing;

use crate::error::CryptoError;

/// The AEAD algorithm used throughout uekvault.
const ALGORITHM: &aead::Algorithm = &AES_256_GCM;

/// Size of the nonce in bytes (96 bits).
pub const NONCE_LEN: usize = 12;

/// Size of the authentication tag in bytes (128 bits).
pub const TAG_LEN: usize = 16;

/// Size of every symmetric key in bytes (256 bits).
pub const KEY_LEN: usize = 32;

/// Size of a passphrase salt in bytes.
pub const SALT_LEN: usize = 16;

/// Output of one AEAD seal: ciphertext, the nonce it was sealed under, and
/// the detached authentication tag. These are the three columns stored for
/// every envelope and resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SealedBox {
    pub ciphertext: Vec<u8>,
    pub nonce: [u8; NONCE_LEN],
    pub auth_tag: [u8; TAG_LEN],
}

/// Fill `buf` from the system CSPRNG.
pub(crate) fn fill_random(buf: &mut [u8]) -> Result<(), CryptoError> {
    SystemRandom::new()
        .fill(buf)
        .map_err(|_| CryptoError::Primitive("randomness source failed"))
}

/// Generate a fresh random 256-bit key.
pub(crate) fn generate_random_key() -> Result<[u8; KEY_LEN], CryptoError> {
    let mut key = [0u8; KEY_LEN];
    fill_random(&mut key)?;
    Ok(key)
}

/// Generate a fresh random passphrase salt.
pub(crate) fn generate_salt() -> Result<[u8; SALT_LEN], CryptoError> {
    let mut salt = [0u8; SALT_LEN];
    fill_random(&mut salt)?;
    Ok(salt)
}

fn bind_key(key_bytes: &[u8; KEY_LEN]) -> Result<LessSafeKey, CryptoError> {
    let unbound = UnboundKey::new(ALGORITHM, key_bytes).map_err(|_| CryptoError::InvalidKey)?;
    Ok(LessSafeKey::new(unbound))
}

/// Encrypt `plaintext` under `key_bytes` with a fresh random nonce.
pub(crate) fn seal(key_bytes: &[u8; KEY_LEN], plaintext: &[u8]) -> Result<SealedBox, CryptoError> {
    let key = bind_key(key_bytes)?;

    let mut nonce = [0u8; NONCE_LEN];
    fill_random(&mut nonce)?;

    // Plaintext until sealed, so an error path must not free it unwiped.
    let mut in_out = Zeroizing::new(plaintext.to_vec());
    let tag = key
        .seal_in_place_separate_tag(
            Nonce::assume_unique_for_key(nonce),
            aead::Aad::empty(),
            in_out.as_mut_slice(),
        )
        .map_err(|_| CryptoError::Primitive("seal failed"))?;

    let auth_tag: [u8; TAG_LEN] = tag
        .as_ref()
        .try_into()
        .map_err(|_| CryptoError::Primitive("unexpected tag length"))?;

    Ok(SealedBox {
        ciphertext: std::mem::take(&mut *in_out),
        nonce,
        auth_tag,
    })
}

/// Decrypt a [`SealedBox`] under `key_bytes`.
///
/// A wrong key, a flipped ciphertext bit and a corrupted tag are all
/// reported as [`CryptoError::Authentication`]. No partial plaintext is
/// ever returned.
pub(crate) fn open(
    key_bytes: &[u8; KEY_LEN],
    sealed: &SealedBox,
) -> Result<Zeroizing<Vec<u8>>, CryptoError> {
    let key = bind_key(key_bytes)?;

    // Decrypts in place: the plaintext never leaves this buffer, which is
    // wiped on drop.
    let mut payload = Zeroizing::new(Vec::with_capacity(sealed.ciphertext.len() + TAG_LEN));
    payload.extend_from_slice(&sealed.ciphertext);
    payload.extend_from_slice(&sealed.auth_tag);

    let plaintext_len = key
        .open_in_place(
            Nonce::assume_unique_for_key(sealed.nonce),
            aead::Aad::empty(),
            payload.as_mut_slice(),
        )
        .map_err(|_| CryptoError::Authentication)?
        .len();

    payload.truncate(plaintext_len);
    Ok(payload)
}
