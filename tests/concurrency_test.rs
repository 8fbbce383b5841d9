//! Several threads hammering one locked heap and one shared range list.

use std::alloc::{alloc, dealloc, Layout};
use std::thread;

use slab_range_allocator::{LockedSlabHeap, RegionMapper, SharedRangeList};

const PAGE_SIZE: usize = 0x1000;
const HEAP_SIZE: usize = 8 * 1024 * 1024;
const THREADS: usize = 4;

#[test]
fn test_locked_heap_from_many_threads() {
    let layout = Layout::from_size_align(HEAP_SIZE, PAGE_SIZE).unwrap();
    let base = unsafe { alloc(layout) } as usize;
    assert_ne!(base, 0);

    let heap = LockedSlabHeap::<_, PAGE_SIZE>::new(unsafe {
        RegionMapper::<PAGE_SIZE>::new(base, HEAP_SIZE)
    });
    heap.initialise();

    thread::scope(|s| {
        for t in 0..THREADS {
            let heap = &heap;
            s.spawn(move || {
                for round in 0..200 {
                    let size = 1 + (t * 37 + round * 13) % 900;
                    let p = heap.allocate(size).unwrap();
                    let tag = (t as u8) ^ (round as u8);
                    unsafe { p.as_ptr().write_bytes(tag, size) };
                    let bytes = unsafe { std::slice::from_raw_parts(p.as_ptr(), size) };
                    assert!(bytes.iter().all(|&b| b == tag));
                    heap.free(p);
                }
            });
        }
    });

    heap.check().unwrap();
    heap.recovery();
    assert_eq!(heap.heap_page_count(), 0);

    unsafe { dealloc(base as *mut u8, layout) };
}

#[test]
fn test_shared_range_list_from_many_threads() {
    let ports = SharedRangeList::<u32>::new();
    ports.free(0, 4096).unwrap();

    let taken: Vec<Vec<u32>> = thread::scope(|s| {
        let handles: Vec<_> = (0..THREADS)
            .map(|_| {
                let ports = &ports;
                s.spawn(move || (0..64).map(|_| ports.allocate(4).unwrap()).collect())
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });

    let mut all: Vec<u32> = taken.into_iter().flatten().collect();
    all.sort_unstable();
    for pair in all.windows(2) {
        assert!(pair[0] + 4 <= pair[1]);
    }
    assert_eq!(ports.total_free(), 4096 - 4 * 64 * THREADS as u32);

    for start in all {
        ports.free(start, 4).unwrap();
    }
    assert_eq!(ports.len(), 1);
    assert_eq!(ports.total_free(), 4096);
}
