//! Fault-injecting store wrapper.
//!
//! Delegates to an underlying store but fails or races chosen writes, so
//! the partial-failure paths of rotation can be driven deterministically.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use super::{EncryptedContentStore, KeyRecordStore, Page, PageRequest};
use crate::crypto::SealedBox;
use crate::error::StoreError;
use crate::model::{
    DeviceKey, EncryptedResource, KeyGrant, ResourceId, ResourceKind, ResourceStamp, UekEnvelope,
    User,
};

#[derive(Default)]
struct Faults {
    /// Resource writes that always fail with a backend error.
    failing: HashSet<(ResourceKind, ResourceId)>,
    /// Resources whose next write loses a race against a simulated owner
    /// write.
    racing: HashSet<(ResourceKind, ResourceId)>,
}

/// Store wrapper that injects write failures.
///
/// Clone shares the fault configuration and the underlying store.
#[derive(Clone)]
pub struct FaultInjectingStore<S> {
    inner: S,
    faults: Arc<Mutex<Faults>>,
    fail_envelope_writes: Arc<AtomicBool>,
    resource_write_attempts: Arc<AtomicUsize>,
}

impl<S> FaultInjectingStore<S> {
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            faults: Arc::new(Mutex::new(Faults::default())),
            fail_envelope_writes: Arc::new(AtomicBool::new(false)),
            resource_write_attempts: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Underlying store (for checking state after faults).
    pub fn inner(&self) -> &S {
        &self.inner
    }

    /// Every write to this resource fails with [`StoreError::Backend`].
    pub fn fail_resource_writes(&self, kind: ResourceKind, resource_id: &str) {
        self.faults().failing.insert((kind, resource_id.to_string()));
    }

    /// The next write to this resource is preceded by a simulated owner
    /// write, so it is rejected with [`StoreError::Conflict`].
    pub fn race_next_resource_write(&self, kind: ResourceKind, resource_id: &str) {
        self.faults().racing.insert((kind, resource_id.to_string()));
    }

    /// Envelope writes fail with [`StoreError::Backend`] while set.
    pub fn fail_envelope_writes(&self, fail: bool) {
        self.fail_envelope_writes.store(fail, Ordering::SeqCst);
    }

    /// Total resource compare-and-swap calls seen, failed ones included.
    pub fn resource_write_attempts(&self) -> usize {
        self.resource_write_attempts.load(Ordering::SeqCst)
    }

    fn faults(&self) -> MutexGuard<'_, Faults> {
        self.faults.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<S: KeyRecordStore> KeyRecordStore for FaultInjectingStore<S> {
    fn create_user(&self, user: &User) -> Result<(), StoreError> {
        self.inner.create_user(user)
    }

    fn load_user(&self, user_id: &str) -> Result<Option<User>, StoreError> {
        self.inner.load_user(user_id)
    }

    fn compare_and_swap_envelope(
        &self,
        user_id: &str,
        expected_version: Option<u64>,
        envelope: &UekEnvelope,
    ) -> Result<(), StoreError> {
        if self.fail_envelope_writes.load(Ordering::SeqCst) {
            return Err(StoreError::Backend("injected envelope write failure".into()));
        }
        self.inner.compare_and_swap_envelope(user_id, expected_version, envelope)
    }

    fn upsert_device_key(&self, key: &DeviceKey) -> Result<(), StoreError> {
        self.inner.upsert_device_key(key)
    }

    fn load_device_key(&self, user_id: &str, device_id: &str) -> Result<Option<DeviceKey>, StoreError> {
        self.inner.load_device_key(user_id, device_id)
    }

    fn upsert_grant(&self, grant: &KeyGrant) -> Result<(), StoreError> {
        self.inner.upsert_grant(grant)
    }

    fn delete_grant(&self, resource_id: &str, grantee_user_id: &str) -> Result<bool, StoreError> {
        self.inner.delete_grant(resource_id, grantee_user_id)
    }

    fn list_grants(&self, resource_id: &str) -> Result<Vec<KeyGrant>, StoreError> {
        self.inner.list_grants(resource_id)
    }
}

impl<S: EncryptedContentStore> EncryptedContentStore for FaultInjectingStore<S> {
    fn insert_resource(&self, resource: &EncryptedResource) -> Result<(), StoreError> {
        self.inner.insert_resource(resource)
    }

    fn load_resource(&self, kind: ResourceKind, resource_id: &str) -> Result<Option<EncryptedResource>, StoreError> {
        self.inner.load_resource(kind, resource_id)
    }

    fn list_resources(
        &self,
        owner_user_id: &str,
        kind: ResourceKind,
        page: &PageRequest,
    ) -> Result<Page<EncryptedResource>, StoreError> {
        self.inner.list_resources(owner_user_id, kind, page)
    }

    fn compare_and_swap_resource(
        &self,
        kind: ResourceKind,
        resource_id: &str,
        expected: ResourceStamp,
        content: Option<SealedBox>,
        encryption_version: u64,
    ) -> Result<(), StoreError> {
        self.resource_write_attempts.fetch_add(1, Ordering::SeqCst);

        let key = (kind, resource_id.to_string());
        let (fail, race) = {
            let mut faults = self.faults();
            (faults.failing.contains(&key), faults.racing.remove(&key))
        };

        if fail {
            return Err(StoreError::Backend(format!(
                "injected write failure on {} {resource_id}",
                kind.tag()
            )));
        }

        if race {
            // The owner rewrites the same content, which bumps the revision.
            if let Some(current) = self.inner.load_resource(kind, resource_id)? {
                self.inner.compare_and_swap_resource(
                    kind,
                    resource_id,
                    current.stamp(),
                    current.content.clone(),
                    current.encryption_version,
                )?;
            }
        }

        self.inner
            .compare_and_swap_resource(kind, resource_id, expected, content, encryption_version)
    }
}
