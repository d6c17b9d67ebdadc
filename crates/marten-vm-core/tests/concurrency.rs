//! Concurrency tests for the closure registry.
//!
//! These exercise the registry the way the runtime does: many threads
//! resolving closures while the loader upserts and the unload subsystem
//! runs the purge handshake against the same entries.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Barrier;

use marten_vm_code::{AtomTable, CodeAddress, CodeRegion};
use marten_vm_core::{ClosureId, ClosureRegistry, Digest};

const DIGEST: Digest = [0x5a; 16];

fn test_id(atoms: &AtomTable, module: &str, hash: u64, index: u32) -> ClosureId {
    ClosureId {
        module: atoms.intern(module),
        hash,
        index,
    }
}

#[test]
fn concurrent_first_claims_converge_to_the_thread_count() {
    const THREADS: usize = 8;

    let atoms = AtomTable::new();
    let registry = Arc::new(ClosureRegistry::new());
    let id = test_id(&atoms, "fresh", 0xfeed, 0);
    let barrier = Arc::new(Barrier::new(THREADS));

    let handles: Vec<_> = (0..THREADS)
        .map(|_| {
            let registry = Arc::clone(&registry);
            let barrier = Arc::clone(&barrier);
            std::thread::spawn(move || {
                barrier.wait();
                registry.upsert(id, 0, DIGEST, 1)
            })
        })
        .collect();

    let entries: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();

    // All claimants got the same entry, and no increment was lost or doubled.
    assert!(entries.windows(2).all(|w| Arc::ptr_eq(&w[0], &w[1])));
    assert_eq!(entries[0].ref_count(), THREADS as i64);

    for entry in &entries {
        registry.release(entry);
    }
    assert_eq!(registry.count(), 0);
}

#[test]
fn lookup_release_storm_preserves_the_reference_count() {
    const THREADS: usize = 4;
    const ITERS: usize = 2_000;

    let atoms = AtomTable::new();
    let registry = Arc::new(ClosureRegistry::new());
    let id = test_id(&atoms, "storm", 0x1234, 7);
    let held = registry.upsert(id, 0, DIGEST, 2);

    let handles: Vec<_> = (0..THREADS)
        .map(|_| {
            let registry = Arc::clone(&registry);
            std::thread::spawn(move || {
                for _ in 0..ITERS {
                    let entry = registry.lookup(&id).expect("entry must stay present");
                    registry.release(&entry);
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    assert_eq!(held.ref_count(), 1);
    assert_eq!(registry.count(), 1);
}

#[test]
fn readers_racing_a_purge_observe_only_whole_addresses() {
    const READERS: usize = 4;
    const PURGE_CYCLES: usize = 500;

    let atoms = AtomTable::new();
    let registry = Arc::new(ClosureRegistry::new());
    let id = test_id(&atoms, "hot_swap", 0xbeef, 0);
    let old_addr = CodeAddress::new(0x4000_0010);
    let region = CodeRegion::new(0x4000_0000, 0x1000);

    let entry = registry.upsert(id, 0, DIGEST, 3);
    entry.bind(old_addr);

    let stop = Arc::new(AtomicBool::new(false));
    let readers: Vec<_> = (0..READERS)
        .map(|_| {
            let registry = Arc::clone(&registry);
            let stop = Arc::clone(&stop);
            std::thread::spawn(move || {
                while !stop.load(Ordering::Acquire) {
                    let entry = registry.lookup(&id).expect("never erased in this test");
                    let addr = entry.address();
                    assert!(
                        addr == old_addr || addr == CodeAddress::UNLOADED,
                        "torn or stale address observed: {addr}"
                    );
                    if let Some(saved) = entry.pending_purge_address() {
                        assert_eq!(saved, old_addr);
                    }
                    registry.release(&entry);
                }
            })
        })
        .collect();

    for _ in 0..PURGE_CYCLES {
        let batch = registry.begin_purge(&region);
        assert_eq!(batch.len(), 1);
        registry.abort_purge(&batch);
        registry.finalize_abort(batch);
    }
    stop.store(true, Ordering::Release);
    for reader in readers {
        reader.join().unwrap();
    }

    assert_eq!(entry.address(), old_addr);
    assert!(entry.pending_purge_address().is_none());
    assert_eq!(entry.ref_count(), 1);
}

#[test]
fn purge_complete_races_cleanly_with_releasing_readers() {
    const THREADS: usize = 4;

    let atoms = AtomTable::new();
    let registry = Arc::new(ClosureRegistry::new());
    let id = test_id(&atoms, "doomed", 0x77, 2);
    let region = CodeRegion::new(0x9000, 0x100);

    let entry = registry.upsert(id, 0, DIGEST, 0);
    entry.bind(CodeAddress::new(0x9010));

    // Each holder thread gets its own reference to drop.
    let holders: Vec<_> = (0..THREADS).map(|_| registry.lookup(&id).unwrap()).collect();
    let barrier = Arc::new(Barrier::new(THREADS + 1));

    let handles: Vec<_> = holders
        .into_iter()
        .map(|held| {
            let registry = Arc::clone(&registry);
            let barrier = Arc::clone(&barrier);
            std::thread::spawn(move || {
                barrier.wait();
                registry.release(&held);
            })
        })
        .collect();

    barrier.wait();
    // The upsert reference stands for "the code exists"; complete_purge
    // drops it, racing the holder releases above.
    let batch = registry.begin_purge(&region);
    registry.complete_purge(batch);

    for handle in handles {
        handle.join().unwrap();
    }

    assert_eq!(registry.count(), 0);
    assert!(registry.lookup(&id).is_none());
}
