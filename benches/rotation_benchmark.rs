//! Rotation throughput by account size.
//!
//! Each iteration rotates a fresh copy of a seeded store, so every run
//! migrates the same number of resources. Two Argon2id derivations (unwrap
//! and rewrap) dominate small accounts; AES-GCM re-encryption dominates
//! large ones.
//!
//! Run with: `cargo bench --bench rotation_benchmark`

use chrono::Utc;
use criterion::{black_box, criterion_group, criterion_main, BatchSize, BenchmarkId, Criterion, Throughput};
use uekvault::{
    provision_user, seal_resource, EncryptedContentStore, EncryptedResource, EngineConfig,
    KdfParams, KeyRecordStore, KeyRotationEngine, MemoryStore, ResourceKind,
};

const OLD: &str = "bench-old-passphrase";
const NEW: &str = "bench-new-passphrase";

fn seeded_store(resources: usize, payload: usize) -> MemoryStore {
    let store = MemoryStore::new();
    let uek = provision_user(&store, "bench", "bench@example.com", OLD, &KdfParams::default()).unwrap();
    let body = vec![0u8; payload];
    for i in 0..resources {
        let id = format!("doc-{i:05}");
        store
            .insert_resource(&EncryptedResource {
                content: Some(seal_resource(&uek, ResourceKind::Document, &id, 0, &body).unwrap()),
                id,
                kind: ResourceKind::Document,
                owner_user_id: "bench".into(),
                encryption_version: 0,
                revision: 0,
                updated_at: Utc::now(),
            })
            .unwrap();
    }
    store
}

/// A store holding a deep copy of `store`'s records.
fn fork(store: &MemoryStore) -> MemoryStore {
    let copy = MemoryStore::new();
    let snapshot = store.snapshot();
    for user in snapshot.users.values() {
        copy.create_user(user).unwrap();
    }
    for resource in snapshot.resources.values() {
        copy.insert_resource(resource).unwrap();
    }
    copy
}

fn benchmark_rotation(c: &mut Criterion) {
    let mut group = c.benchmark_group("rotation");
    group.sample_size(10);

    for resources in [0usize, 100, 1_000] {
        let seeded = seeded_store(resources, 1024);
        group.throughput(Throughput::Elements(resources as u64));
        group.bench_with_input(BenchmarkId::from_parameter(resources), &seeded, |b, seeded| {
            b.iter_batched(
                || fork(seeded),
                |store| {
                    let engine = KeyRotationEngine::new(store.clone(), store, EngineConfig::default()).unwrap();
                    black_box(engine.rotate("bench", OLD, NEW, false).unwrap())
                },
                BatchSize::PerIteration,
            );
        });
    }

    group.finish();
}

fn benchmark_workers(c: &mut Criterion) {
    let mut group = c.benchmark_group("rotation_workers");
    group.sample_size(10);
    let seeded = seeded_store(1_000, 4096);

    for workers in [1usize, 2, 4, 8] {
        let config = EngineConfig {
            workers,
            ..EngineConfig::default()
        };
        group.bench_with_input(BenchmarkId::from_parameter(workers), &config, |b, config| {
            b.iter_batched(
                || fork(&seeded),
                |store| {
                    let engine = KeyRotationEngine::new(store.clone(), store, config.clone()).unwrap();
                    black_box(engine.rotate("bench", OLD, NEW, true).unwrap())
                },
                BatchSize::PerIteration,
            );
        });
    }

    group.finish();
}

criterion_group!(benches, benchmark_rotation, benchmark_workers);
criterion_main!(benches);
