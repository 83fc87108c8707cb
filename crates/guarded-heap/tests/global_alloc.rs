//! The `GlobalAlloc` surface over an explicitly instantiated heap.

use std::alloc::{GlobalAlloc, Layout};

use guarded_heap::{Check, Config, GuardedHeap};

#[test]
fn alloc_realloc_dealloc() {
    let heap = GuardedHeap::new(Config::default());
    let layout = Layout::from_size_align(100, 8).expect("bad layout");

    unsafe {
        let ptr = heap.alloc(layout);
        assert!(!ptr.is_null());
        for i in 0..100 {
            #[allow(clippy::cast_possible_truncation)]
            ptr.add(i).write(i as u8);
        }

        // 200 bytes do not fit the 128-byte class: the bytes move. The
        // old slot is never reissued, so the address must change.
        let grown = heap.realloc(ptr, layout, 200);
        assert!(!grown.is_null());
        assert_ne!(grown, ptr);
        for i in 0..100 {
            #[allow(clippy::cast_possible_truncation)]
            let expected = i as u8;
            assert_eq!(grown.add(i).read(), expected);
        }

        heap.dealloc(grown, Layout::from_size_align(200, 8).expect("bad layout"));
    }
    assert_eq!(heap.deinit(), Check::Ok);
}

#[test]
fn realloc_shrinks_in_place() {
    let heap = GuardedHeap::new(Config::default());
    let layout = Layout::from_size_align(128, 8).expect("bad layout");

    unsafe {
        let ptr = heap.alloc(layout);
        assert!(!ptr.is_null());
        ptr.write(0x77);

        let shrunk = heap.realloc(ptr, layout, 100);
        assert_eq!(shrunk, ptr);
        assert_eq!(shrunk.read(), 0x77);

        heap.dealloc(shrunk, Layout::from_size_align(100, 8).expect("bad layout"));
    }
    assert_eq!(heap.deinit(), Check::Ok);
}

#[test]
fn alloc_zeroed_is_zeroed() {
    let heap = GuardedHeap::new(Config::default());
    let layout = Layout::from_size_align(64, 8).expect("bad layout");

    unsafe {
        let ptr = heap.alloc_zeroed(layout);
        assert!(!ptr.is_null());
        assert!(std::slice::from_raw_parts(ptr, 64).iter().all(|&b| b == 0));
        heap.dealloc(ptr, layout);
    }
    assert_eq!(heap.deinit(), Check::Ok);
}

#[test]
fn typed_array_through_the_heap() {
    let heap: &'static GuardedHeap = Box::leak(Box::new(GuardedHeap::new(Config::default())));

    let layout = Layout::array::<u64>(32).expect("bad layout");
    unsafe {
        let ptr = heap.alloc(layout).cast::<u64>();
        assert!(!ptr.is_null());
        for i in 0..32 {
            ptr.add(i).write(i as u64);
        }
        assert_eq!(ptr.add(31).read(), 31);
        heap.dealloc(ptr.cast(), layout);
    }
    assert!(!heap.detect_leaks());
}
