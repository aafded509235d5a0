//! # uekvault
//!
//! End-to-end-encryption key management for a sync server.
//!
//! Each user owns a random User Encryption Key (UEK). The server stores it
//! only wrapped under a key derived from the user's passphrase (the
//! envelope). Every document and asset the user owns is sealed under a key
//! derived from the UEK, the resource's identity and an encryption version.
//! Sharing wraps a resource's data key for a recipient device's public key.
//!
//! Changing the passphrase is the hard part: [`KeyRotationEngine`] rewraps
//! the UEK and moves every owned resource to the new version, per resource
//! and resumably, with a dry-run preview.
//!
//! ## Public API
//!
//! The surface is the re-exports below plus the [`store`] contracts.
//! Symmetric primitives and raw key derivation are `pub(crate)`; callers
//! handle keys only through the opaque types in [`keys`].

pub mod asymmetric;
pub mod audit;
pub mod config;
pub mod content;
pub(crate) mod crypto;
pub mod envelope;
pub mod error;
pub mod grants;
pub mod keys;
pub mod lock;
pub mod model;
pub mod rotation;
pub mod store;

pub use asymmetric::{unwrap_asymmetric, DevicePrivateKey, DevicePublicKey, KeyAlgorithm, WrappedKey};
pub use audit::{AuditEvent, AuditLog, AuditRecord, AuditSink, FileAuditSink};
pub use config::{EngineConfig, KdfParams};
pub use content::{open_resource, seal_resource};
pub use crypto::SealedBox;
pub use envelope::{open_envelope, provision_user};
pub use error::{CryptoError, StoreError, UekvaultError};
pub use grants::DeviceKeyGrantManager;
pub use keys::{Dek, Uek};
pub use lock::RotationLocks;
pub use model::{DeviceKey, EncryptedResource, KeyGrant, ResourceKind, UekEnvelope, User};
pub use rotation::{CancellationToken, KeyRotationEngine, RotationResult, RotationState};
pub use store::{EncryptedContentStore, KeyRecordStore, MemoryStore};
