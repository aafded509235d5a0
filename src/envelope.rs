//! UEK envelopes: provisioning, sealing and opening.

use crate::config::KdfParams;
use crate::crypto;
use crate::error::{CryptoError, UekvaultError};
use crate::keys::{self, Uek};
use crate::model::{UekEnvelope, User};
use crate::store::KeyRecordStore;

/// Seal `uek` under a passphrase with a fresh salt and nonce.
pub fn seal_envelope(
    uek: &Uek,
    passphrase: &str,
    kdf: &KdfParams,
    version: u64,
) -> Result<UekEnvelope, CryptoError> {
    let salt = crypto::generate_salt()?;
    let kek = keys::derive_kek(passphrase, &salt, kdf)?;
    let sealed = keys::wrap_uek(&kek, uek)?;
    Ok(UekEnvelope::new(sealed, salt, version, *kdf))
}

/// Unlock the UEK from an envelope with its passphrase.
///
/// A wrong passphrase and a corrupted envelope both fail with
/// [`CryptoError::Authentication`].
pub fn open_envelope(envelope: &UekEnvelope, passphrase: &str) -> Result<Uek, CryptoError> {
    let kek = keys::derive_kek(passphrase, &envelope.salt, &envelope.kdf)?;
    keys::unwrap_uek(&kek, &envelope.sealed())
}

/// Provision a user with a fresh UEK at envelope version 0.
///
/// Creates the user record if it does not exist yet (registration), or adds
/// the envelope to an existing record (first E2EE opt-in). Returns the new
/// UEK so the caller can seal the user's first content without another
/// passphrase derivation.
pub fn provision_user<K: KeyRecordStore>(
    store: &K,
    user_id: &str,
    email: &str,
    passphrase: &str,
    kdf: &KdfParams,
) -> Result<Uek, UekvaultError> {
    kdf.validate()?;

    match store.load_user(user_id)? {
        Some(user) if user.uek_envelope.is_some() => {
            return Err(UekvaultError::AlreadyProvisioned(user_id.to_string()));
        }
        Some(_) => {}
        None => store.create_user(&User {
            id: user_id.to_string(),
            email: email.to_string(),
            password_verifier: String::new(),
            uek_envelope: None,
        })?,
    }

    let uek = Uek::generate()?;
    let envelope = seal_envelope(&uek, passphrase, kdf, 0)?;
    store.compare_and_swap_envelope(user_id, None, &envelope)?;

    tracing::info!(user_id, "provisioned user encryption key");
    Ok(uek)
}
