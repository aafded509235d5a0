//! Persisted entities.
//!
//! These are the records the two store contracts read and write. Each is
//! owned by the user named in it; nothing here is shared-mutable.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::asymmetric::{KeyAlgorithm, WrappedKey};
use crate::config::KdfParams;
use crate::crypto::{SealedBox, NONCE_LEN, SALT_LEN, TAG_LEN};

/// Opaque user identifier.
pub type UserId = String;

/// Opaque device identifier, unique per user.
pub type DeviceId = String;

/// Opaque resource identifier, unique per [`ResourceKind`].
pub type ResourceId = String;

/// A user and their encryption envelope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: UserId,
    pub email: String,
    /// Login verifier. Opaque to this crate.
    pub password_verifier: String,
    /// Absent until the user is provisioned with a UEK.
    pub uek_envelope: Option<UekEnvelope>,
}

/// The wrapped UEK and everything needed to unwrap it.
///
/// `version` strictly increases on every rotation that rewraps the UEK and
/// is never reused.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UekEnvelope {
    pub wrapped_uek: Vec<u8>,
    pub salt: [u8; SALT_LEN],
    pub nonce: [u8; NONCE_LEN],
    pub auth_tag: [u8; TAG_LEN],
    pub version: u64,
    /// Parameters the KEK was derived with.
    pub kdf: KdfParams,
}

impl UekEnvelope {
    pub(crate) fn new(sealed: SealedBox, salt: [u8; SALT_LEN], version: u64, kdf: KdfParams) -> Self {
        Self {
            wrapped_uek: sealed.ciphertext,
            salt,
            nonce: sealed.nonce,
            auth_tag: sealed.auth_tag,
            version,
            kdf,
        }
    }

    pub(crate) fn sealed(&self) -> SealedBox {
        SealedBox {
            ciphertext: self.wrapped_uek.clone(),
            nonce: self.nonce,
            auth_tag: self.auth_tag,
        }
    }
}

/// A device's public key. One per `(user_id, device_id)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceKey {
    pub user_id: UserId,
    pub device_id: DeviceId,
    pub algorithm: KeyAlgorithm,
    /// SPKI DER for RSA, raw 32 bytes for X25519.
    pub public_key: Vec<u8>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// The two families of owned content. Both share the
/// [`EncryptedResource`] shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum ResourceKind {
    Document,
    Asset,
}

impl ResourceKind {
    /// The tag mixed into resource key derivation and error messages.
    pub fn tag(&self) -> &'static str {
        match self {
            Self::Document => "document",
            Self::Asset => "asset",
        }
    }
}

/// A document or asset belonging to exactly one user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptedResource {
    pub id: ResourceId,
    pub kind: ResourceKind,
    pub owner_user_id: UserId,
    /// `None` when the resource has no content yet.
    pub content: Option<SealedBox>,
    /// Envelope version whose key schedule protects `content`. Never above
    /// the owner's envelope version once a rotation commits.
    pub encryption_version: u64,
    /// Incremented by the store on every write. Part of the
    /// compare-and-swap token alongside `encryption_version`.
    pub revision: u64,
    pub updated_at: DateTime<Utc>,
}

/// The compare-and-swap token for a resource write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResourceStamp {
    pub encryption_version: u64,
    pub revision: u64,
}

impl EncryptedResource {
    pub fn stamp(&self) -> ResourceStamp {
        ResourceStamp {
            encryption_version: self.encryption_version,
            revision: self.revision,
        }
    }
}

/// Authorizes one user's device to decrypt one shared resource's DEK.
/// Unique per `(resource_id, grantee_user_id)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyGrant {
    pub resource_id: ResourceId,
    pub grantee_user_id: UserId,
    /// Device whose public key wrapped the DEK.
    pub grantee_device_id: DeviceId,
    pub wrapped_dek: WrappedKey,
    pub granted_by: UserId,
    pub granted_at: DateTime<Utc>,
}
