//! Locking, racing writers and cancellation.

mod common;

use std::thread;

use common::*;
use uekvault::store::{FaultInjectingStore, Page, PageRequest};
use uekvault::{
    CancellationToken, EncryptedContentStore, EncryptedResource, EngineConfig, KeyRotationEngine,
    MemoryStore, ResourceKind, RotationLocks, SealedBox, StoreError, UekvaultError,
};
use uekvault::model::ResourceStamp;

#[test]
fn test_concurrent_rotation_for_same_user_rejected() {
    let store = MemoryStore::new();
    seed_user(&store, "alice", 1, 0);
    let locks = RotationLocks::new();
    let engine = engine(&store).with_locks(locks.clone());
    let before = store.snapshot();

    let in_flight = locks.try_acquire("alice").unwrap();
    let result = engine.rotate("alice", OLD, NEW, false);

    assert!(matches!(result, Err(UekvaultError::RotationInProgress(_))));
    assert_eq!(store.snapshot(), before);

    drop(in_flight);
    assert!(engine.rotate("alice", OLD, NEW, false).unwrap().success);
}

#[test]
fn test_different_users_rotate_in_parallel() {
    let store = MemoryStore::new();
    let users = ["alice", "bob", "carol"];
    let ueks: Vec<_> = users
        .iter()
        .enumerate()
        .map(|(i, user)| {
            let uek = seed_user(&store, user, 0, 0);
            for j in 0..4 {
                insert(&store, &uek, user, ResourceKind::Document, &format!("{user}-{i}-{j}"));
            }
            uek
        })
        .collect();
    let engine = engine(&store);

    thread::scope(|scope| {
        for user in users {
            let engine = &engine;
            scope.spawn(move || {
                let result = engine.rotate(user, OLD, NEW, false).unwrap();
                assert_eq!(result.documents_processed, 4);
            });
        }
    });

    for (user, uek) in users.iter().zip(&ueks) {
        assert_eq!(envelope_version(&store, user), 1);
        assert_all_readable(&store, uek, user);
    }
}

#[test]
fn test_racing_owner_write_is_retried_not_clobbered() {
    let store = MemoryStore::new();
    let uek = seed_user(&store, "alice", 3, 0);
    let faulty = FaultInjectingStore::new(store.clone());
    faulty.race_next_resource_write(ResourceKind::Document, &doc_id(1));

    let result = KeyRotationEngine::new(store.clone(), faulty.clone(), EngineConfig::default())
        .unwrap()
        .rotate("alice", OLD, NEW, false)
        .unwrap();

    assert!(result.success);
    assert_eq!(result.documents_processed, 3);
    // One retried write on top of one per document.
    assert_eq!(faulty.resource_write_attempts(), 4);

    let raced = store.load_resource(ResourceKind::Document, &doc_id(1)).unwrap().unwrap();
    assert_eq!(raced.encryption_version, 1);
    // The simulated owner write, then the rotation write.
    assert_eq!(raced.revision, 2);
    assert_all_readable(&store, &uek, "alice");
}

#[test]
fn test_persistent_conflicts_exhaust_retries() {
    let store = MemoryStore::new();
    seed_user(&store, "alice", 1, 0);

    /// Content store whose writes always lose a race.
    struct AlwaysConflicting(MemoryStore);

    impl EncryptedContentStore for AlwaysConflicting {
        fn insert_resource(&self, resource: &EncryptedResource) -> Result<(), StoreError> {
            self.0.insert_resource(resource)
        }
        fn load_resource(&self, kind: ResourceKind, id: &str) -> Result<Option<EncryptedResource>, StoreError> {
            self.0.load_resource(kind, id)
        }
        fn list_resources(&self, owner: &str, kind: ResourceKind, page: &PageRequest) -> Result<Page<EncryptedResource>, StoreError> {
            self.0.list_resources(owner, kind, page)
        }
        fn compare_and_swap_resource(
            &self,
            kind: ResourceKind,
            id: &str,
            _: ResourceStamp,
            _: Option<SealedBox>,
            _: u64,
        ) -> Result<(), StoreError> {
            Err(StoreError::Conflict(format!("{} {id}", kind.tag())))
        }
    }

    let config = EngineConfig {
        max_cas_retries: 2,
        ..EngineConfig::default()
    };
    let result = KeyRotationEngine::new(store.clone(), AlwaysConflicting(store.clone()), config)
        .unwrap()
        .rotate("alice", OLD, NEW, false)
        .unwrap();

    assert_eq!(result.documents_failed, 1);
    assert!(result.errors[0].starts_with("document doc-000:"));
}

/// Content store in which one resource is deleted by its owner after the
/// rotation has listed it.
struct DeletedAfterListing {
    inner: MemoryStore,
    deleted: String,
}

impl EncryptedContentStore for DeletedAfterListing {
    fn insert_resource(&self, resource: &EncryptedResource) -> Result<(), StoreError> {
        self.inner.insert_resource(resource)
    }

    fn load_resource(&self, kind: ResourceKind, id: &str) -> Result<Option<EncryptedResource>, StoreError> {
        if id == self.deleted {
            return Ok(None);
        }
        self.inner.load_resource(kind, id)
    }

    fn list_resources(&self, owner: &str, kind: ResourceKind, page: &PageRequest) -> Result<Page<EncryptedResource>, StoreError> {
        self.inner.list_resources(owner, kind, page)
    }

    fn compare_and_swap_resource(
        &self,
        kind: ResourceKind,
        id: &str,
        expected: ResourceStamp,
        content: Option<SealedBox>,
        version: u64,
    ) -> Result<(), StoreError> {
        if id == self.deleted {
            return Err(StoreError::NotFound(format!("{} {id}", kind.tag())));
        }
        self.inner
            .compare_and_swap_resource(kind, id, expected, content, version)
    }
}

#[test]
fn test_resource_deleted_mid_rotation_is_skipped() {
    let store = MemoryStore::new();
    let uek = seed_user(&store, "alice", 3, 0);
    let content = DeletedAfterListing {
        inner: store.clone(),
        deleted: doc_id(1),
    };

    let result = KeyRotationEngine::new(store.clone(), content, EngineConfig::default())
        .unwrap()
        .rotate("alice", OLD, NEW, false)
        .unwrap();

    assert!(result.success);
    assert_eq!(
        (result.documents_processed, result.documents_skipped, result.documents_failed),
        (2, 1, 0)
    );
    assert!(result.errors.is_empty());
    assert_eq!(envelope_version(&store, "alice"), 1);
    for i in [0, 2] {
        let migrated = store.load_resource(ResourceKind::Document, &doc_id(i)).unwrap().unwrap();
        assert_eq!(migrated.encryption_version, 1);
    }
    assert_all_readable(&store, &uek, "alice");
}

/// Content store that fires a cancellation token after a number of
/// successful resource writes.
struct CancelAfterWrites {
    inner: MemoryStore,
    token: CancellationToken,
    remaining: std::sync::atomic::AtomicUsize,
}

impl EncryptedContentStore for CancelAfterWrites {
    fn insert_resource(&self, resource: &EncryptedResource) -> Result<(), StoreError> {
        self.inner.insert_resource(resource)
    }

    fn load_resource(&self, kind: ResourceKind, id: &str) -> Result<Option<EncryptedResource>, StoreError> {
        self.inner.load_resource(kind, id)
    }

    fn list_resources(&self, owner: &str, kind: ResourceKind, page: &PageRequest) -> Result<Page<EncryptedResource>, StoreError> {
        self.inner.list_resources(owner, kind, page)
    }

    fn compare_and_swap_resource(
        &self,
        kind: ResourceKind,
        id: &str,
        expected: ResourceStamp,
        content: Option<SealedBox>,
        version: u64,
    ) -> Result<(), StoreError> {
        self.inner
            .compare_and_swap_resource(kind, id, expected, content, version)?;
        let left = self.remaining.fetch_sub(1, std::sync::atomic::Ordering::SeqCst);
        if left == 1 {
            self.token.cancel();
        }
        Ok(())
    }
}

#[test]
fn test_cancel_during_persistence_keeps_written_resources() {
    let store = MemoryStore::new();
    let uek = seed_user(&store, "alice", 5, 0);
    let token = CancellationToken::new();
    let content = CancelAfterWrites {
        inner: store.clone(),
        token: token.clone(),
        remaining: 2.into(),
    };

    let result = KeyRotationEngine::new(store.clone(), content, EngineConfig::default())
        .unwrap()
        .rotate_with_cancel("alice", OLD, NEW, false, &token);

    assert!(matches!(
        result,
        Err(UekvaultError::Cancelled { resources_written: 2 })
    ));
    assert_eq!(envelope_version(&store, "alice"), 0);
    let migrated = store
        .snapshot()
        .resources
        .values()
        .filter(|r| r.encryption_version == 1)
        .count();
    assert_eq!(migrated, 2);
    assert_all_readable(&store, &uek, "alice");

    // A later run with the same passphrases finishes the job.
    let resumed = engine(&store).rotate("alice", OLD, NEW, false).unwrap();
    assert!(resumed.success);
    assert_eq!((resumed.documents_processed, resumed.documents_skipped), (3, 2));
    assert_eq!(envelope_version(&store, "alice"), 1);
    assert_all_readable(&store, &uek, "alice");
}

#[test]
fn test_cancelled_before_persistence_writes_nothing() {
    let store = MemoryStore::new();
    seed_user(&store, "alice", 4, 4);
    let before = store.snapshot();
    let token = CancellationToken::new();
    token.cancel();

    let result = engine(&store).rotate_with_cancel("alice", OLD, NEW, false, &token);

    assert!(matches!(
        result,
        Err(UekvaultError::Cancelled { resources_written: 0 })
    ));
    assert_eq!(store.snapshot(), before);
}
