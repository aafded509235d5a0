//! Walk through provisioning, sharing and a passphrase rotation.
//!
//! Run with: `RUST_LOG=uekvault=debug cargo run --example rotation_demo`

use chrono::Utc;
use rand::rngs::OsRng;
use rsa::pkcs8::EncodePublicKey;
use rsa::RsaPrivateKey;
use tracing_subscriber::EnvFilter;
use uekvault::{
    open_resource, provision_user, seal_resource, unwrap_asymmetric, Dek, DeviceKeyGrantManager,
    DevicePrivateKey, DevicePublicKey, EncryptedContentStore, EncryptedResource, EngineConfig,
    KeyAlgorithm, KeyRotationEngine, MemoryStore, ResourceKind,
};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let store = MemoryStore::new();
    let config = EngineConfig::from_json(r#"{ "workers": 2, "page_size": 16 }"#)?;

    // Alice signs up and writes a few notes.
    let uek = provision_user(&store, "alice", "alice@example.com", "first passphrase", &config.kdf)?;
    for (kind, id, body) in [
        (ResourceKind::Document, "groceries", &b"eggs, flour"[..]),
        (ResourceKind::Document, "diary", &b"dear diary"[..]),
        (ResourceKind::Asset, "cat.png", &b"\x89PNG..."[..]),
    ] {
        store.insert_resource(&EncryptedResource {
            id: id.into(),
            kind,
            owner_user_id: "alice".into(),
            content: Some(seal_resource(&uek, kind, id, 0, body)?),
            encryption_version: 0,
            revision: 0,
            updated_at: Utc::now(),
        })?;
    }

    // She shares the grocery list's key with Bob's phone.
    let bob_phone = RsaPrivateKey::new(&mut OsRng, 2048)?;
    let bob_phone_public = DevicePublicKey {
        device_id: "bob-phone".into(),
        algorithm: KeyAlgorithm::RsaOaepSha256,
        key: bob_phone.to_public_key().to_public_key_der()?.as_bytes().to_vec(),
    };
    let grants = DeviceKeyGrantManager::new(store.clone());
    grants.register_device_key("bob", &bob_phone_public)?;
    let dek = Dek::generate()?;
    let grant = grants.grant_access("groceries", &dek, "bob", &bob_phone_public, "alice")?;
    let recovered = unwrap_asymmetric(&DevicePrivateKey::Rsa(bob_phone), &grant.wrapped_dek)?;
    println!(
        "bob's phone recovered the shared key: {}",
        recovered.expose_bytes() == dek.expose_bytes()
    );

    // Alice changes her passphrase. Preview first, then commit.
    let engine = KeyRotationEngine::new(store.clone(), store.clone(), config)?;
    let preview = engine.rotate("alice", "first passphrase", "second passphrase", true)?;
    println!("preview: {}", serde_json::to_string_pretty(&preview)?);
    let committed = engine.rotate("alice", "first passphrase", "second passphrase", false)?;
    println!("committed: {}", serde_json::to_string_pretty(&committed)?);

    let diary = store
        .load_resource(ResourceKind::Document, "diary")?
        .ok_or("diary missing")?;
    let content = diary.content.as_ref().ok_or("diary empty")?;
    let body = open_resource(&uek, diary.kind, &diary.id, diary.encryption_version, content)?;
    println!(
        "diary at version {}: {}",
        diary.encryption_version,
        String::from_utf8_lossy(&body)
    );

    Ok(())
}
