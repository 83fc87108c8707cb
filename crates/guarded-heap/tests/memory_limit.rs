//! Byte-cap accounting: requested bytes, not rounded sizes.

use guarded_heap::{Check, Config, GuardedHeap};

fn capped_heap(limit: usize) -> GuardedHeap {
    let heap = GuardedHeap::new(Config {
        enable_memory_limit: true,
        ..Config::default()
    });
    heap.set_requested_memory_limit(limit);
    heap
}

#[test]
fn cap_counts_requested_lengths() {
    let heap = capped_heap(1010);

    let a = heap.allocate(4, 2, 0).expect("out of memory");
    assert_eq!(heap.total_requested_bytes(), 4);

    let b = heap.allocate(1000, 0, 0).expect("out of memory");
    assert_eq!(heap.total_requested_bytes(), 1004);

    // 1004 + 8 exceeds the cap; the counter must not move.
    assert!(heap.allocate(8, 3, 0).is_none());
    assert_eq!(heap.total_requested_bytes(), 1004);

    unsafe { heap.free(a, 4, 2, 0) };
    assert_eq!(heap.total_requested_bytes(), 1000);

    unsafe { heap.free(b, 1000, 0, 0) };
    assert_eq!(heap.total_requested_bytes(), 0);

    // Exactly the cap is allowed.
    let c = heap.allocate(1010, 0, 0).expect("out of memory");
    assert_eq!(heap.total_requested_bytes(), 1010);

    unsafe { heap.free(c, 1010, 0, 0) };
    assert_eq!(heap.deinit(), Check::Ok);
}

#[test]
fn cap_refuses_large_requests_before_the_backing_call() {
    let heap = capped_heap(100);
    let page_size = sys_pages::page_size();
    assert!(heap.allocate(page_size * 2, 0, 0).is_none());
    assert_eq!(heap.total_requested_bytes(), 0);
    assert_eq!(heap.deinit(), Check::Ok);
}

#[test]
fn resize_moves_the_counter_by_the_requested_delta() {
    let heap = capped_heap(100);
    let ptr = heap.allocate(64, 0, 0).expect("out of memory");
    assert_eq!(heap.total_requested_bytes(), 64);

    unsafe {
        assert!(heap.resize(ptr, 64, 0, 32, 0));
        assert_eq!(heap.total_requested_bytes(), 32);

        assert!(heap.resize(ptr, 32, 0, 64, 0));
        assert_eq!(heap.total_requested_bytes(), 64);
    }

    // 64 + 50 would pass the cap.
    assert!(heap.allocate(50, 0, 0).is_none());
    assert_eq!(heap.total_requested_bytes(), 64);

    unsafe { heap.free(ptr, 64, 0, 0) };
    assert_eq!(heap.total_requested_bytes(), 0);
    assert_eq!(heap.deinit(), Check::Ok);
}

#[test]
fn overflowing_request_is_refused_cleanly() {
    let heap = capped_heap(usize::MAX);
    let keeper = heap.allocate(8, 0, 0).expect("out of memory");
    assert!(heap.allocate(usize::MAX, 0, 0).is_none());
    assert_eq!(heap.total_requested_bytes(), 8);
    unsafe { heap.free(keeper, 8, 0, 0) };
    assert_eq!(heap.deinit(), Check::Ok);
}
