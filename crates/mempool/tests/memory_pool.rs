use std::ptr::{self, NonNull};

use mempool::memory_pool::MemoryPool;

unsafe fn fill(ptr: NonNull<u8>, len: usize, byte: u8) {
    unsafe { ptr.as_ptr().write_bytes(byte, len) }
}

unsafe fn check(ptr: NonNull<u8>, len: usize, byte: u8) {
    unsafe {
        for i in 0..len {
            assert_eq!(ptr.as_ptr().add(i).read(), byte, "byte {i} diverged");
        }
    }
}

#[test]
fn split_then_coalesce_step_by_step() {
    let mut pool = MemoryPool::new();

    let a = pool.allocate(64).unwrap();
    let b = pool.allocate(64).unwrap();
    let c = pool.allocate(64).unwrap();
    assert_eq!(pool.chunk_count(), 1);
    assert_eq!(pool.free_block_count(), 1); // remainder of the chunk
    let tail_bytes = pool.free_bytes();

    // Releasing the middle block leaves one free region between A and C.
    unsafe { pool.deallocate(b.as_ptr()) };
    assert_eq!(pool.free_block_count(), 2);
    assert!(pool.free_bytes() - tail_bytes >= 64);
    pool.assert_invariants();

    // Releasing A coalesces with B's old range: still two regions, the new
    // one at least twice the request.
    unsafe { pool.deallocate(a.as_ptr()) };
    assert_eq!(pool.free_block_count(), 2);
    assert!(pool.free_bytes() - tail_bytes >= 128);
    pool.assert_invariants();

    // Releasing C merges everything: the whole chunk payload is one region.
    unsafe { pool.deallocate(c.as_ptr()) };
    assert_eq!(pool.free_block_count(), 1);
    pool.assert_invariants();
}

#[test]
fn grow_in_place_after_successor_is_freed() {
    let mut pool = MemoryPool::new();

    let a = pool.allocate(100).unwrap();
    let b = pool.allocate(100).unwrap();
    unsafe {
        fill(a, 100, 0xA5);
        pool.deallocate(b.as_ptr());

        let grown = pool.reallocate(a.as_ptr(), 150).unwrap();
        assert_eq!(grown, a);
        check(grown, 100, 0xA5);

        fill(grown, 150, 0x5A);
        check(grown, 150, 0x5A);
    }
    pool.assert_invariants();
}

#[test]
fn relocation_preserves_prefix_and_recycles_old_region() {
    let mut pool = MemoryPool::new();

    let a = pool.allocate(100).unwrap();
    let b = pool.allocate(100).unwrap();
    unsafe {
        fill(a, 100, 0xC3);
        fill(b, 100, 0x3C);

        let moved = pool.reallocate(a.as_ptr(), 300).unwrap();
        assert_ne!(moved, a);
        check(moved, 100, 0xC3);
        check(b, 100, 0x3C);
        pool.assert_invariants();

        // The old region is free again and serves the next request.
        let reuse = pool.allocate(100).unwrap();
        assert_eq!(reuse, a);
    }
}

#[test]
fn off_by_one_pointer_mutates_nothing() {
    let mut pool = MemoryPool::new();

    let a = pool.allocate(64).unwrap();
    unsafe { fill(a, 64, 0x77) };
    let free_blocks = pool.free_block_count();
    let free_bytes = pool.free_bytes();

    unsafe { pool.deallocate(a.as_ptr().add(1)) };

    assert_eq!(pool.free_block_count(), free_blocks);
    assert_eq!(pool.free_bytes(), free_bytes);
    unsafe { check(a, 64, 0x77) };
    pool.assert_invariants();
}

#[test]
fn size_zero_semantics() {
    let mut pool = MemoryPool::new();

    assert!(pool.allocate(0).is_none());
    unsafe { pool.deallocate(ptr::null_mut()) };

    // Reallocating null is an allocation.
    let ptr = unsafe { pool.reallocate(ptr::null_mut(), 64) }.unwrap();
    unsafe {
        fill(ptr, 64, 0x99);
        check(ptr, 64, 0x99);
    }

    // Reallocating to zero frees the block.
    let free_bytes = pool.free_bytes();
    assert!(unsafe { pool.reallocate(ptr.as_ptr(), 0) }.is_none());
    assert!(pool.free_bytes() > free_bytes);
    pool.assert_invariants();
}

#[test]
fn interleaved_blocks_hold_their_bytes() {
    let mut pool = MemoryPool::new();

    let mut live: Vec<(NonNull<u8>, usize, u8)> = Vec::new();
    for i in 0_usize..120 {
        let len = 17 + (i * 13) % 240;
        let byte = (i % 251) as u8;
        let ptr = pool.allocate(len).unwrap();
        unsafe { fill(ptr, len, byte) };
        live.push((ptr, len, byte));

        if i % 4 == 2 {
            let (victim, ..) = live.swap_remove(live.len() / 3);
            unsafe { pool.deallocate(victim.as_ptr()) };
        }
        if i % 10 == 7 {
            let slot = live.len() / 2;
            let (ptr, len, byte) = live[slot];
            let new_len = len * 2;
            let moved = unsafe { pool.reallocate(ptr.as_ptr(), new_len) }.unwrap();
            unsafe {
                check(moved, len, byte);
                fill(moved, new_len, byte);
            }
            live[slot] = (moved, new_len, byte);
        }
    }
    pool.assert_invariants();

    for &(ptr, len, byte) in &live {
        unsafe { check(ptr, len, byte) };
    }
    for (ptr, ..) in live {
        unsafe { pool.deallocate(ptr.as_ptr()) };
    }
    pool.assert_invariants();

    // Balanced history: the free list covers every chunk's payload.
    assert_eq!(pool.free_block_count(), pool.chunk_count());
}
