//! Whole-heap invariants exercised through the public API: byte
//! conservation, chunk-walk consistency, alignment guarantees, and
//! return to a fully coalesced steady state.

use std::alloc::Layout;

use mm::{HEADER_SIZE, Heap, MIN_CHUNK};

fn with_test_heap<F>(size: usize, f: F)
where
    F: FnOnce(&Heap),
{
    unsafe {
        let layout = Layout::from_size_align(size, MIN_CHUNK).unwrap();
        let base = std::alloc::alloc(layout);
        base.write_bytes(0x11, size);
        let heap = Heap::new();
        heap.initialize(base, size).unwrap();
        f(&heap);
        std::alloc::dealloc(base, layout);
    }
}

/// Small deterministic generator so failures reproduce.
struct Lcg(u64);

impl Lcg {
    fn next(&mut self) -> u64 {
        self.0 = self.0.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
        self.0 >> 33
    }
}

#[track_caller]
fn assert_conserved(heap: &Heap) {
    let stats = heap.stats();
    assert_eq!(stats.in_use + stats.free, stats.arena);
}

#[test]
fn chunk_walk_matches_stats() {
    with_test_heap(16 * 1024, |heap| unsafe {
        let a = heap.malloc(100).unwrap();
        let b = heap.malloc(500).unwrap();
        heap.free(a);

        let mut in_use = 0;
        let mut free = 0;
        let mut chunks = 0;
        heap.for_each_chunk(|chunk| {
            if chunk.allocated {
                in_use += chunk.size;
            } else {
                free += chunk.size;
            }
            chunks += 1;
        });
        let stats = heap.stats();
        assert_eq!(in_use, stats.in_use);
        assert_eq!(free, stats.free);
        assert!(chunks >= 2);

        heap.free(b);
    });
}

#[test]
fn payload_addresses_are_granularity_aligned() {
    with_test_heap(16 * 1024, |heap| unsafe {
        let mut live = Vec::new();
        for size in [1, 7, 31, 100, 1000] {
            let mem = heap.malloc(size).unwrap();
            assert!(mem.as_ptr().addr().is_multiple_of(MIN_CHUNK));
            live.push(mem);
        }
        for mem in live {
            heap.free(mem);
        }
    });
}

#[test]
fn chunk_sizes_cover_their_requests() {
    with_test_heap(16 * 1024, |heap| unsafe {
        for size in [1, 50, 333, 4096] {
            let mem = heap.malloc(size).unwrap();
            let mut found = false;
            heap.for_each_chunk(|chunk| {
                if chunk.allocated {
                    assert!(chunk.size >= size + HEADER_SIZE);
                    found = true;
                }
            });
            assert!(found);
            heap.free(mem);
        }
    });
}

#[test]
fn randomized_workload_returns_to_steady_state() {
    with_test_heap(256 * 1024, |heap| unsafe {
        let arena = heap.stats().arena;
        let mut rng = Lcg(0x5eed);
        let mut live: Vec<(core::ptr::NonNull<u8>, usize, u8)> = Vec::new();

        for round in 0..2000u64 {
            match rng.next() % 10 {
                // mostly allocate
                0..=5 => {
                    let size = (rng.next() % 2000 + 1) as usize;
                    if let Ok(mem) = heap.malloc(size) {
                        let fill = (round & 0x7f) as u8;
                        mem.as_ptr().write_bytes(fill, size);
                        live.push((mem, size, fill));
                    }
                }
                6 | 7 if !live.is_empty() => {
                    let victim = (rng.next() as usize) % live.len();
                    let (mem, size, fill) = live.swap_remove(victim);
                    for offset in 0..size {
                        assert_eq!(mem.as_ptr().add(offset).read(), fill);
                    }
                    heap.free(mem);
                }
                8 if !live.is_empty() => {
                    let victim = (rng.next() as usize) % live.len();
                    let (mem, size, fill) = live[victim];
                    let new_size = (rng.next() % 2000 + 1) as usize;
                    if let Ok(moved) = heap.realloc(mem.as_ptr(), new_size) {
                        let surviving = size.min(new_size);
                        for offset in 0..surviving {
                            assert_eq!(moved.as_ptr().add(offset).read(), fill);
                        }
                        moved.as_ptr().write_bytes(fill, new_size);
                        live[victim] = (moved, new_size, fill);
                    }
                }
                9 => {
                    let alignment = 1 << (rng.next() % 6 + 6);
                    let size = (rng.next() % 500 + 1) as usize;
                    if let Ok(mem) = heap.memalign(alignment, size) {
                        assert!(mem.as_ptr().addr().is_multiple_of(alignment));
                        let fill = (round & 0x7f) as u8;
                        mem.as_ptr().write_bytes(fill, size);
                        live.push((mem, size, fill));
                    }
                }
                _ => {}
            }
            if round % 64 == 0 {
                assert_conserved(heap);
            }
        }

        for (mem, size, fill) in live {
            for offset in 0..size {
                assert_eq!(mem.as_ptr().add(offset).read(), fill);
            }
            heap.free(mem);
        }

        let stats = heap.stats();
        assert_eq!(stats.in_use, 0);
        assert_eq!(stats.free, arena);
        assert_eq!(stats.free_chunks, 1);
        assert_eq!(stats.largest_free, arena);
    });
}

#[test]
fn multi_region_heap_conserves_per_region() {
    unsafe {
        let layout = Layout::from_size_align(8192, MIN_CHUNK).unwrap();
        let first = std::alloc::alloc(layout);
        let second = std::alloc::alloc(layout);
        first.write_bytes(0x11, 8192);
        second.write_bytes(0x11, 8192);

        let heap = Heap::new();
        heap.initialize(first, 8192).unwrap();
        heap.add_region(second, 8192).unwrap();
        let arena = heap.stats().arena;

        let mut live = Vec::new();
        for size in [100, 700, 300, 1500, 64] {
            live.push(heap.malloc(size).unwrap());
            assert_conserved(&heap);
        }
        for mem in live {
            heap.free(mem);
        }

        let stats = heap.stats();
        assert_eq!(stats.free, arena);
        assert_eq!(stats.free_chunks, 2);

        std::alloc::dealloc(first, layout);
        std::alloc::dealloc(second, layout);
    }
}
