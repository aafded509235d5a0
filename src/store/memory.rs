use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::Utc;

use super::{EncryptedContentStore, KeyRecordStore, Page, PageRequest};
use crate::crypto::SealedBox;
use crate::error::StoreError;
use crate::model::{
    DeviceId, DeviceKey, EncryptedResource, KeyGrant, ResourceId, ResourceKind, ResourceStamp,
    UekEnvelope, User, UserId,
};

/// In-memory implementation of both store contracts.
///
/// All state sits behind one `Arc<Mutex<_>>`, so clones share the same
/// records and every operation is atomic with respect to the others.
/// Ordered maps keep pagination deterministic.
#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Mutex<MemorySnapshot>>,
}

/// A copy of every record held by a [`MemoryStore`]. Comparable, so tests
/// can assert that an operation left storage untouched.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MemorySnapshot {
    pub users: BTreeMap<UserId, User>,
    pub device_keys: BTreeMap<(UserId, DeviceId), DeviceKey>,
    /// Keyed by `(resource_id, grantee_user_id)`.
    pub grants: BTreeMap<(ResourceId, UserId), KeyGrant>,
    pub resources: BTreeMap<(ResourceKind, ResourceId), EncryptedResource>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy of the current state.
    pub fn snapshot(&self) -> MemorySnapshot {
        self.lock().clone()
    }

    /// Number of stored resources of every kind and owner.
    pub fn resource_count(&self) -> usize {
        self.lock().resources.len()
    }

    // The guarded maps hold no cross-statement invariants, so a poisoned
    // lock is still safe to reuse.
    fn lock(&self) -> MutexGuard<'_, MemorySnapshot> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl KeyRecordStore for MemoryStore {
    fn create_user(&self, user: &User) -> Result<(), StoreError> {
        let mut inner = self.lock();
        if inner.users.contains_key(&user.id) {
            return Err(StoreError::AlreadyExists(format!("user {}", user.id)));
        }
        inner.users.insert(user.id.clone(), user.clone());
        Ok(())
    }

    fn load_user(&self, user_id: &str) -> Result<Option<User>, StoreError> {
        Ok(self.lock().users.get(user_id).cloned())
    }

    fn compare_and_swap_envelope(
        &self,
        user_id: &str,
        expected_version: Option<u64>,
        envelope: &UekEnvelope,
    ) -> Result<(), StoreError> {
        let mut inner = self.lock();
        let user = inner
            .users
            .get_mut(user_id)
            .ok_or_else(|| StoreError::NotFound(format!("user {user_id}")))?;

        let current = user.uek_envelope.as_ref().map(|e| e.version);
        if current != expected_version {
            return Err(StoreError::Conflict(format!("envelope of user {user_id}")));
        }

        user.uek_envelope = Some(envelope.clone());
        Ok(())
    }

    fn upsert_device_key(&self, key: &DeviceKey) -> Result<(), StoreError> {
        self.lock()
            .device_keys
            .insert((key.user_id.clone(), key.device_id.clone()), key.clone());
        Ok(())
    }

    fn load_device_key(&self, user_id: &str, device_id: &str) -> Result<Option<DeviceKey>, StoreError> {
        Ok(self
            .lock()
            .device_keys
            .get(&(user_id.to_string(), device_id.to_string()))
            .cloned())
    }

    fn upsert_grant(&self, grant: &KeyGrant) -> Result<(), StoreError> {
        self.lock().grants.insert(
            (grant.resource_id.clone(), grant.grantee_user_id.clone()),
            grant.clone(),
        );
        Ok(())
    }

    fn delete_grant(&self, resource_id: &str, grantee_user_id: &str) -> Result<bool, StoreError> {
        Ok(self
            .lock()
            .grants
            .remove(&(resource_id.to_string(), grantee_user_id.to_string()))
            .is_some())
    }

    fn list_grants(&self, resource_id: &str) -> Result<Vec<KeyGrant>, StoreError> {
        Ok(self
            .lock()
            .grants
            .values()
            .filter(|g| g.resource_id == resource_id)
            .cloned()
            .collect())
    }
}

impl EncryptedContentStore for MemoryStore {
    fn insert_resource(&self, resource: &EncryptedResource) -> Result<(), StoreError> {
        let mut inner = self.lock();
        let key = (resource.kind, resource.id.clone());
        if inner.resources.contains_key(&key) {
            return Err(StoreError::AlreadyExists(format!(
                "{} {}",
                resource.kind.tag(),
                resource.id
            )));
        }
        let mut stored = resource.clone();
        stored.revision = 0;
        inner.resources.insert(key, stored);
        Ok(())
    }

    fn load_resource(&self, kind: ResourceKind, resource_id: &str) -> Result<Option<EncryptedResource>, StoreError> {
        Ok(self
            .lock()
            .resources
            .get(&(kind, resource_id.to_string()))
            .cloned())
    }

    fn list_resources(
        &self,
        owner_user_id: &str,
        kind: ResourceKind,
        page: &PageRequest,
    ) -> Result<Page<EncryptedResource>, StoreError> {
        let inner = self.lock();
        let limit = page.limit.max(1);

        let mut items: Vec<EncryptedResource> = inner
            .resources
            .range((kind, String::new())..)
            .take_while(|((k, _), _)| *k == kind)
            .filter(|((_, id), _)| page.after.as_ref().map_or(true, |after| id > after))
            .filter(|(_, r)| r.owner_user_id == owner_user_id)
            .map(|(_, r)| r.clone())
            .take(limit + 1)
            .collect();

        let next = if items.len() > limit {
            items.truncate(limit);
            items.last().map(|last| PageRequest {
                after: Some(last.id.clone()),
                limit: page.limit,
            })
        } else {
            None
        };

        Ok(Page { items, next })
    }

    fn compare_and_swap_resource(
        &self,
        kind: ResourceKind,
        resource_id: &str,
        expected: ResourceStamp,
        content: Option<SealedBox>,
        encryption_version: u64,
    ) -> Result<(), StoreError> {
        let mut inner = self.lock();
        let resource = inner
            .resources
            .get_mut(&(kind, resource_id.to_string()))
            .ok_or_else(|| StoreError::NotFound(format!("{} {resource_id}", kind.tag())))?;

        if resource.stamp() != expected {
            return Err(StoreError::Conflict(format!("{} {resource_id}", kind.tag())));
        }

        resource.content = content;
        resource.encryption_version = encryption_version;
        resource.revision += 1;
        resource.updated_at = Utc::now();
        Ok(())
    }
}
