//! Retained metadata: double frees stay detectable after a bucket or
//! large record dies.

use guarded_heap::{Check, Config, GuardedHeap};

fn hardened() -> Config {
    Config {
        safety: true,
        never_unmap: true,
        retain_metadata: true,
        ..Config::default()
    }
}

#[test]
fn double_free_of_a_retired_bucket_slot_is_recoverable() {
    // Install a subscriber so the report path (including trace
    // symbolization) actually renders.
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();

    let heap = GuardedHeap::new(hardened());
    let ptr = heap.allocate(64, 3, 0).expect("out of memory");
    unsafe {
        heap.free(ptr, 64, 3, 0);
        // The bucket drained and was retired; only its retained metadata
        // still knows this page. Without that metadata this call would
        // halt as an unknown free, so returning here proves the header
        // migrated to the empty-buckets map.
        heap.free(ptr, 64, 3, 0);
    }

    // The structures survive the report: ordinary allocation still works.
    let after = heap.allocate(64, 3, 0).expect("out of memory");
    unsafe { heap.free(after, 64, 3, 0) };
    assert_eq!(heap.deinit(), Check::Ok);
}

#[test]
#[should_panic(expected = "free of an unknown allocation")]
fn without_retention_a_retired_slot_free_halts() {
    let heap = GuardedHeap::new(Config {
        safety: true,
        never_unmap: true,
        retain_metadata: false,
        ..Config::default()
    });
    let ptr = heap.allocate(64, 3, 0).expect("out of memory");
    unsafe {
        heap.free(ptr, 64, 3, 0);
        heap.free(ptr, 64, 3, 0);
    }
}

#[test]
#[should_panic(expected = "free of an unknown allocation")]
fn flush_drops_the_double_free_evidence() {
    let heap = GuardedHeap::new(hardened());
    let ptr = heap.allocate(64, 3, 0).expect("out of memory");
    unsafe { heap.free(ptr, 64, 3, 0) };
    heap.flush_retained_metadata();
    unsafe { heap.free(ptr, 64, 3, 0) };
}

#[test]
fn double_free_of_a_large_allocation_is_recoverable() {
    let page_size = sys_pages::page_size();
    let heap = GuardedHeap::new(hardened());
    let ptr = heap.allocate(page_size * 3, 0, 0).expect("out of memory");
    unsafe {
        heap.free(ptr, page_size * 3, 0, 0);
        heap.free(ptr, page_size * 3, 0, 0);
    }
    let after = heap.allocate(page_size * 2, 0, 0).expect("out of memory");
    unsafe { heap.free(after, page_size * 2, 0, 0) };
    assert_eq!(heap.deinit(), Check::Ok);
}

#[test]
#[should_panic(expected = "resize of a freed allocation")]
fn resize_after_free_halts() {
    let heap = GuardedHeap::new(hardened());
    let page_size = sys_pages::page_size();
    let ptr = heap.allocate(page_size * 3, 0, 0).expect("out of memory");
    unsafe {
        heap.free(ptr, page_size * 3, 0, 0);
        let _ = heap.resize(ptr, page_size * 3, 0, page_size, 0);
    }
}

#[test]
fn retention_without_flush_still_deinits_clean() {
    let heap = GuardedHeap::new(hardened());
    for _ in 0..8 {
        let ptr = heap.allocate(256, 0, 0).expect("out of memory");
        unsafe { heap.free(ptr, 256, 0, 0) };
    }
    assert_eq!(heap.deinit(), Check::Ok);
}
