//! Shared fixtures for the integration tests.

#![allow(dead_code)]

use chrono::Utc;
use uekvault::{
    provision_user, seal_resource, EncryptedContentStore, EncryptedResource, EngineConfig,
    KdfParams, KeyRecordStore, KeyRotationEngine, MemoryStore, ResourceKind, Uek,
};

pub const OLD: &str = "correct horse battery staple";
pub const NEW: &str = "tr0ub4dor&3";

pub fn body(kind: ResourceKind, id: &str) -> Vec<u8> {
    format!("{} body of {id}", kind.tag()).into_bytes()
}

pub fn doc_id(i: usize) -> String {
    format!("doc-{i:03}")
}

pub fn asset_id(i: usize) -> String {
    format!("asset-{i:03}")
}

/// Provision `user_id` under [`OLD`] and give them `documents` documents
/// and `assets` assets sealed at version 0.
pub fn seed_user(store: &MemoryStore, user_id: &str, documents: usize, assets: usize) -> Uek {
    let uek = provision_user(store, user_id, &format!("{user_id}@example.com"), OLD, &KdfParams::default())
        .unwrap();
    for i in 0..documents {
        insert(store, &uek, user_id, ResourceKind::Document, &doc_id(i));
    }
    for i in 0..assets {
        insert(store, &uek, user_id, ResourceKind::Asset, &asset_id(i));
    }
    uek
}

pub fn insert(store: &MemoryStore, uek: &Uek, owner: &str, kind: ResourceKind, id: &str) {
    let content = seal_resource(uek, kind, id, 0, &body(kind, id)).unwrap();
    store
        .insert_resource(&EncryptedResource {
            id: id.to_string(),
            kind,
            owner_user_id: owner.to_string(),
            content: Some(content),
            encryption_version: 0,
            revision: 0,
            updated_at: Utc::now(),
        })
        .unwrap();
}

/// Flip one bit of a resource's stored authentication tag.
pub fn corrupt_tag(store: &MemoryStore, kind: ResourceKind, id: &str) {
    let resource = store.load_resource(kind, id).unwrap().unwrap();
    let mut content = resource.content.clone().unwrap();
    content.auth_tag[0] ^= 0x01;
    store
        .compare_and_swap_resource(kind, id, resource.stamp(), Some(content), resource.encryption_version)
        .unwrap();
}

pub fn envelope_version(store: &MemoryStore, user_id: &str) -> u64 {
    store
        .load_user(user_id)
        .unwrap()
        .unwrap()
        .uek_envelope
        .unwrap()
        .version
}

/// An engine with small pages so pagination is exercised.
pub fn engine(store: &MemoryStore) -> KeyRotationEngine<MemoryStore, MemoryStore> {
    let config = EngineConfig {
        page_size: 3,
        ..EngineConfig::default()
    };
    KeyRotationEngine::new(store.clone(), store.clone(), config).unwrap()
}

/// Check that every resource of `user_id` opens at its recorded version
/// and holds its original body.
pub fn assert_all_readable(store: &MemoryStore, uek: &Uek, user_id: &str) {
    for (_, resource) in store.snapshot().resources {
        if resource.owner_user_id != user_id {
            continue;
        }
        let sealed = resource.content.as_ref().unwrap();
        let opened = uekvault::open_resource(
            uek,
            resource.kind,
            &resource.id,
            resource.encryption_version,
            sealed,
        )
        .unwrap_or_else(|e| panic!("{} {} unreadable: {e}", resource.kind.tag(), resource.id));
        assert_eq!(&opened[..], &body(resource.kind, &resource.id)[..]);
    }
}
