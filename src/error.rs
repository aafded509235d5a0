//! Error types for uekvault.
//!
//! Every variant is a distinct failure mode of the key-management core.
//! Messages name identifiers (user, device, resource) and never key bytes,
//! passphrases, or plaintext. A wrong passphrase and a corrupted envelope
//! produce the same error so neither can serve as a guessing oracle.

use thiserror::Error;

/// Failures of the cryptographic primitives.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CryptoError {
    /// A passphrase was empty.
    #[error("passphrase must not be empty")]
    WeakInput,

    /// An authentication tag did not verify. Wrong key, tampered ciphertext
    /// and corrupted storage all land here.
    #[error("authentication failed")]
    Authentication,

    /// Key material was malformed (bad length, unparseable encoding, or an
    /// RSA modulus below 2048 bits).
    #[error("invalid key material")]
    InvalidKey,

    /// The scheme can be read by this crate but not written.
    #[error("unsupported key algorithm: {0}")]
    UnsupportedAlgorithm(String),

    /// The underlying primitive failed. Should not occur under correct usage.
    #[error("cryptographic primitive failed: {0}")]
    Primitive(&'static str),
}

/// Failures reported by a [`KeyRecordStore`](crate::store::KeyRecordStore)
/// or [`EncryptedContentStore`](crate::store::EncryptedContentStore).
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// The addressed record does not exist.
    #[error("record not found: {0}")]
    NotFound(String),

    /// The record already exists.
    #[error("record already exists: {0}")]
    AlreadyExists(String),

    /// An optimistic version check rejected the write. The caller must
    /// re-read before retrying.
    #[error("write conflict on {0}")]
    Conflict(String),

    /// The backend failed for a reason opaque to the core.
    #[error("storage backend error: {0}")]
    Backend(String),
}

/// The caller-facing error type for all uekvault operations.
#[derive(Debug, Error)]
pub enum UekvaultError {
    /// No user record exists for the id.
    #[error("user not found: {0}")]
    UserNotFound(String),

    /// The user has never been provisioned with a UEK.
    #[error("user has no key material: {0}")]
    NoKeyMaterial(String),

    /// The old passphrase did not unwrap the UEK.
    #[error("invalid credentials")]
    InvalidCredentials,

    /// Another rotation for the same user holds the lock.
    #[error("rotation already in progress for user {0}")]
    RotationInProgress(String),

    /// No device key on file matches the presented device public key.
    #[error("unknown device key {device_id} for user {user_id}")]
    UnknownDeviceKey {
        /// Claimed owner of the device.
        user_id: String,
        /// Claimed device id.
        device_id: String,
    },

    /// The user already holds a UEK envelope.
    #[error("user already provisioned: {0}")]
    AlreadyProvisioned(String),

    /// The rotation was cancelled between resource items.
    #[error("rotation cancelled after {resources_written} resource writes")]
    Cancelled {
        /// Resource updates committed before cancellation was observed.
        resources_written: usize,
    },

    /// The envelope changed underneath the rotation.
    #[error("envelope for user {0} changed during rotation")]
    EnvelopeConflict(String),

    /// Configuration rejected by validation.
    #[error("invalid configuration: {0}")]
    Config(String),

    #[error(transparent)]
    Crypto(#[from] CryptoError),

    #[error(transparent)]
    Store(#[from] StoreError),
}
