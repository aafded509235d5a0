//! Persistence contracts.
//!
//! The core never issues queries of its own. It reads and writes the
//! records of [`crate::model`] through these two traits, which a relational
//! store (or anything else) implements. Both are synchronous; callers that
//! live on an async runtime should run the core on a blocking thread.
//!
//! Writes that race with other writers are guarded optimistically: envelope
//! writes name the version they expect to replace, resource writes name the
//! [`ResourceStamp`] they read. A mismatch is reported as
//! [`StoreError::Conflict`] and nothing is written.

mod faulty;
mod memory;

pub use faulty::FaultInjectingStore;
pub use memory::{MemorySnapshot, MemoryStore};

use crate::crypto::SealedBox;
use crate::error::StoreError;
use crate::model::{
    DeviceKey, EncryptedResource, KeyGrant, ResourceId, ResourceKind, ResourceStamp, UekEnvelope,
    User,
};

/// A request for one page of resources, ordered by id.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PageRequest {
    /// Return resources whose id sorts strictly after this one.
    pub after: Option<ResourceId>,
    pub limit: usize,
}

impl PageRequest {
    pub fn first(limit: usize) -> Self {
        Self { after: None, limit }
    }
}

/// One page of results. `next` is `Some` when more may follow.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub next: Option<PageRequest>,
}

/// Users, their UEK envelopes, device public keys and key grants.
pub trait KeyRecordStore: Send + Sync {
    /// Insert a new user. Fails with `AlreadyExists` if the id is taken.
    fn create_user(&self, user: &User) -> Result<(), StoreError>;

    /// Load a user. `None` if no such user exists.
    fn load_user(&self, user_id: &str) -> Result<Option<User>, StoreError>;

    /// Replace the user's envelope.
    ///
    /// # Invariants
    ///
    /// - Pre: the stored envelope version equals `expected_version`
    ///   (`None` meaning no envelope is stored). Otherwise `Conflict`.
    /// - Post: the stored envelope is `envelope`.
    fn compare_and_swap_envelope(
        &self,
        user_id: &str,
        expected_version: Option<u64>,
        envelope: &UekEnvelope,
    ) -> Result<(), StoreError>;

    /// Insert or replace the key for `(user_id, device_id)`.
    fn upsert_device_key(&self, key: &DeviceKey) -> Result<(), StoreError>;

    fn load_device_key(&self, user_id: &str, device_id: &str) -> Result<Option<DeviceKey>, StoreError>;

    /// Insert or replace the grant for `(resource_id, grantee_user_id)`.
    fn upsert_grant(&self, grant: &KeyGrant) -> Result<(), StoreError>;

    /// Delete a grant. Returns whether one existed.
    fn delete_grant(&self, resource_id: &str, grantee_user_id: &str) -> Result<bool, StoreError>;

    /// All grants on a resource, in no particular order.
    fn list_grants(&self, resource_id: &str) -> Result<Vec<KeyGrant>, StoreError>;
}

/// Encryption fields of documents and assets.
pub trait EncryptedContentStore: Send + Sync {
    /// Insert a new resource. The store assigns `revision`.
    fn insert_resource(&self, resource: &EncryptedResource) -> Result<(), StoreError>;

    fn load_resource(&self, kind: ResourceKind, resource_id: &str) -> Result<Option<EncryptedResource>, StoreError>;

    /// Page through the resources of one kind owned by `owner_user_id`.
    fn list_resources(
        &self,
        owner_user_id: &str,
        kind: ResourceKind,
        page: &PageRequest,
    ) -> Result<Page<EncryptedResource>, StoreError>;

    /// Replace a resource's encryption fields.
    ///
    /// # Invariants
    ///
    /// - Pre: the stored stamp equals `expected`. Otherwise `Conflict`.
    /// - Post: content and version are replaced, `revision` is incremented
    ///   and `updated_at` is refreshed.
    fn compare_and_swap_resource(
        &self,
        kind: ResourceKind,
        resource_id: &str,
        expected: ResourceStamp,
        content: Option<SealedBox>,
        encryption_version: u64,
    ) -> Result<(), StoreError>;
}
