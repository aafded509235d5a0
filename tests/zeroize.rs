//! Decrypted key material must not survive in freed heap memory.
//!
//! A counting allocator scans every block as it is freed for a 32-byte
//! secret while the scan is armed. This file holds a single test so no
//! other test's allocations race the scan.

use std::alloc::{GlobalAlloc, Layout, System};
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicUsize, Ordering};

use uekvault::keys::{derive_kek, unwrap_uek, wrap_uek};
use uekvault::{open_resource, seal_resource, KdfParams, ResourceKind, Uek};

const SECRET_LEN: usize = 32;

static ARMED: AtomicBool = AtomicBool::new(false);
static SECRET: [AtomicU8; SECRET_LEN] = [const { AtomicU8::new(0) }; SECRET_LEN];
static LEAKS: AtomicUsize = AtomicUsize::new(0);

struct ScanningAllocator;

unsafe impl GlobalAlloc for ScanningAllocator {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        System.alloc(layout)
    }

    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        if ARMED.load(Ordering::SeqCst) && layout.size() >= SECRET_LEN {
            let block = std::slice::from_raw_parts(ptr, layout.size());
            let found = block.windows(SECRET_LEN).any(|window| {
                window
                    .iter()
                    .zip(SECRET.iter())
                    .all(|(byte, secret)| *byte == secret.load(Ordering::SeqCst))
            });
            if found {
                LEAKS.fetch_add(1, Ordering::SeqCst);
            }
        }
        System.dealloc(ptr, layout)
    }
}

#[global_allocator]
static ALLOCATOR: ScanningAllocator = ScanningAllocator;

fn watch_for(secret: &[u8; SECRET_LEN]) {
    for (slot, byte) in SECRET.iter().zip(secret) {
        slot.store(*byte, Ordering::SeqCst);
    }
    LEAKS.store(0, Ordering::SeqCst);
    ARMED.store(true, Ordering::SeqCst);
}

fn leaked_blocks() -> usize {
    ARMED.store(false, Ordering::SeqCst);
    LEAKS.load(Ordering::SeqCst)
}

#[test]
fn test_decrypted_secrets_are_wiped_before_free() {
    let kek = derive_kek("correct horse battery", &[3u8; 16], &KdfParams::default()).unwrap();
    let uek = Uek::generate().unwrap();
    let sealed = wrap_uek(&kek, &uek).unwrap();

    watch_for(uek.expose_bytes());
    let unwrapped = unwrap_uek(&kek, &sealed).unwrap();
    let leaks = leaked_blocks();
    assert_eq!(unwrapped.expose_bytes(), uek.expose_bytes());
    assert_eq!(leaks, 0, "unwrapped UEK bytes found in a freed heap block");

    let body = *b"a note that must not outlive use";
    let content = seal_resource(&uek, ResourceKind::Document, "doc-001", 0, &body).unwrap();

    watch_for(&body);
    let opened = open_resource(&uek, ResourceKind::Document, "doc-001", 0, &content).unwrap();
    assert_eq!(&opened[..], &body[..]);
    drop(opened);
    assert_eq!(leaked_blocks(), 0, "decrypted content found in a freed heap block");
}
