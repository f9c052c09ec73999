//! Fixed-size object pool implementation.
//!
//! This module provides a pool allocator for uniformly sized blocks. Storage
//! is obtained from the system allocator in chunks of [`BLOCKS_PER_CHUNK`]
//! blocks at a time, and released blocks are recycled through an intrusive
//! free list before any new chunk is acquired.
//!
//! # Algorithm
//!
//! - **Allocation**: pops the head of the free list in O(1). When the free
//!   list is empty, a new chunk is acquired, its first block is handed out
//!   and the remaining blocks are threaded into the free list.
//! - **Deallocation**: validates the block's marker word, then pushes the
//!   block back onto the free list in O(1).
//! - **Teardown**: dropping the pool releases every chunk. Blocks never move
//!   and chunks are never returned to the system before the pool is dropped.
//!
//! # Memory Layout
//!
//! Each block co-locates one machine word with the payload. The word is a
//! tagged union: while the block sits on the free list it links to the next
//! free block, and while the block is allocated it holds the payload address
//! so that misdirected deallocations can be recognized.
//!
//! ```text
//! Chunk:
//! ┌─────────┬─────────┬──────┬─────────┬──────────────┐
//! │ block 0 │ block 1 │  ..  │ block N │ next: *Chunk │
//! └─────────┴─────────┴──────┴─────────┴──────────────┘
//! Block:
//! ┌───────────────────────┬─────────────────────────┐
//! │ payload (size_of::<T>)│ tag: next free / marker │
//! └───────────────────────┴─────────────────────────┘
//! ```

use core::{alloc::Layout, marker::PhantomData, mem::MaybeUninit, ptr, ptr::NonNull};

use snafu::{OptionExt as _, Snafu, ensure};

/// Number of blocks carved out of every chunk.
pub const BLOCKS_PER_CHUNK: usize = 128;

/// Errors reported by [`FixedPool`] operations.
#[derive(Debug, Snafu)]
pub enum FixedPoolError {
    /// The system allocator could not provide a new chunk.
    #[snafu(display("failed to acquire a {size}-byte chunk from the system allocator"))]
    ChunkAlloc {
        /// Size of the chunk that could not be acquired.
        size: usize,
        #[snafu(implicit)]
        location: snafu::Location,
    },
    /// The pointer passed to [`FixedPool::deallocate`] does not carry the
    /// marker this pool writes on allocation.
    #[snafu(display("pointer {address:#x} was not allocated by this pool"))]
    ForeignPointer {
        /// Address of the rejected pointer.
        address: usize,
        #[snafu(implicit)]
        location: snafu::Location,
    },
}

/// One block of pool storage.
///
/// The payload lives at offset zero, so a block pointer and its payload
/// pointer are interchangeable. The trailing `tag` word is the next free
/// block while this block is free, and the payload address (the marker)
/// while it is allocated.
#[repr(C)]
struct Block<T> {
    payload: MaybeUninit<T>,
    tag: *mut u8,
}

#[repr(C)]
struct Chunk<T> {
    blocks: [Block<T>; BLOCKS_PER_CHUNK],
    next: *mut Chunk<T>,
}

/// A chunk-backed pool of fixed-size blocks.
///
/// `FixedPool<T>` serves single-object requests of exactly
/// `size_of::<T>()` bytes, aligned for `T`. The pool hands out raw storage:
/// constructing and dropping `T` values inside the returned blocks is the
/// caller's responsibility.
///
/// Moving the pool transfers ownership of all chunks and outstanding blocks;
/// the pool cannot be cloned. Dropping it releases every chunk, invalidating
/// all pointers it ever returned.
///
/// # Examples
///
/// ```
/// use mempool::fixed_pool::FixedPool;
///
/// let mut pool = FixedPool::<u64>::new();
/// let ptr = pool.allocate().unwrap();
/// unsafe {
///     ptr.as_ptr().write(42);
///     assert_eq!(ptr.as_ptr().read(), 42);
///     pool.deallocate(ptr).unwrap();
/// }
/// ```
///
/// # Thread Safety
///
/// The pool is `Send` (for `T: Send`) but not `Sync`. Distinct pools are
/// independent and may live on distinct threads; operations on one pool must
/// be serialized by the caller.
pub struct FixedPool<T> {
    chunk_head: *mut Chunk<T>,
    free_head: *mut Block<T>,
    _owns: PhantomData<T>,
}

unsafe impl<T: Send> Send for FixedPool<T> {}

impl<T> Default for FixedPool<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> FixedPool<T> {
    /// Creates an empty pool.
    ///
    /// No memory is acquired until the first [`allocate`](Self::allocate).
    #[must_use]
    pub const fn new() -> Self {
        Self {
            chunk_head: ptr::null_mut(),
            free_head: ptr::null_mut(),
            _owns: PhantomData,
        }
    }

    /// Allocates storage for one `T`.
    ///
    /// Pops the free list if it is non-empty; otherwise acquires a fresh
    /// chunk from the system allocator. The returned pointer is aligned for
    /// `T` and stays valid until it is deallocated or the pool is dropped.
    ///
    /// # Errors
    ///
    /// Returns [`FixedPoolError::ChunkAlloc`] when the free list is empty and
    /// the system allocator reports out of memory.
    pub fn allocate(&mut self) -> Result<NonNull<T>, FixedPoolError> {
        if let Some(block) = NonNull::new(self.free_head) {
            unsafe {
                self.free_head = (*block.as_ptr()).tag.cast::<Block<T>>();
                (*block.as_ptr()).tag = block.as_ptr().cast::<u8>();
            }
            return Ok(block.cast::<T>());
        }
        self.grow()
    }

    /// Returns one block to the pool.
    ///
    /// The marker word written on allocation is checked first: a pointer
    /// whose marker does not reference its own payload yields
    /// [`FixedPoolError::ForeignPointer`] and the pool is left untouched.
    /// Because the marker is overwritten when a block joins the free list,
    /// this also flags most double frees.
    ///
    /// After this call the payload bytes revert to pool ownership; reading
    /// them is undefined.
    ///
    /// # Safety
    ///
    /// `ptr` must point into a chunk owned by this pool, i.e. it must have
    /// been returned by [`allocate`](Self::allocate) on this instance. The
    /// marker check downgrades stale and misdirected pointers within pool
    /// storage to a recoverable error, but it cannot make reads through
    /// unrelated pointers sound.
    pub unsafe fn deallocate(&mut self, ptr: NonNull<T>) -> Result<(), FixedPoolError> {
        let block = ptr.cast::<Block<T>>().as_ptr();
        unsafe {
            ensure!(
                (*block).tag == block.cast::<u8>(),
                ForeignPointerSnafu {
                    address: block.addr(),
                }
            );
            (*block).tag = self.free_head.cast::<u8>();
        }
        self.free_head = block;
        Ok(())
    }

    /// Number of chunks currently backing the pool.
    #[must_use]
    pub fn chunk_count(&self) -> usize {
        let mut count = 0;
        let mut chunk = self.chunk_head;
        while !chunk.is_null() {
            count += 1;
            chunk = unsafe { (*chunk).next };
        }
        count
    }

    /// Number of blocks currently sitting on the free list.
    ///
    /// Equals `chunk_count() * BLOCKS_PER_CHUNK` minus the number of live
    /// allocations.
    #[must_use]
    pub fn free_block_count(&self) -> usize {
        let mut count = 0;
        let mut block = self.free_head;
        while !block.is_null() {
            count += 1;
            block = unsafe { (*block).tag.cast::<Block<T>>() };
        }
        count
    }

    /// Acquires a new chunk, hands out its first block and threads the rest
    /// into the free list.
    fn grow(&mut self) -> Result<NonNull<T>, FixedPoolError> {
        let layout = Layout::new::<Chunk<T>>();
        let chunk = NonNull::new(unsafe { alloc::alloc::alloc(layout) })
            .context(ChunkAllocSnafu {
                size: layout.size(),
            })?
            .cast::<Chunk<T>>();

        unsafe {
            let chunk = chunk.as_ptr();
            (&raw mut (*chunk).next).write(self.chunk_head);

            let blocks: *mut Block<T> = (&raw mut (*chunk).blocks).cast();
            for i in 1..BLOCKS_PER_CHUNK - 1 {
                (&raw mut (*blocks.add(i)).tag).write(blocks.add(i + 1).cast::<u8>());
            }
            (&raw mut (*blocks.add(BLOCKS_PER_CHUNK - 1)).tag).write(ptr::null_mut());

            // Block 0 is born allocated.
            (&raw mut (*blocks).tag).write(blocks.cast::<u8>());

            self.chunk_head = chunk;
            self.free_head = blocks.add(1);

            log::trace!(
                "fixed pool acquired chunk: blocks={BLOCKS_PER_CHUNK} bytes={}",
                layout.size()
            );

            Ok(NonNull::new_unchecked(blocks.cast::<T>()))
        }
    }
}

impl<T> Drop for FixedPool<T> {
    fn drop(&mut self) {
        let layout = Layout::new::<Chunk<T>>();
        let mut chunk = self.chunk_head;
        while !chunk.is_null() {
            unsafe {
                let next = (*chunk).next;
                alloc::alloc::dealloc(chunk.cast::<u8>(), layout);
                chunk = next;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    type Buf16 = [u8; 16];

    fn with_pool<T, F>(test_fn: F)
    where
        F: FnOnce(&mut FixedPool<T>),
    {
        let mut pool = FixedPool::<T>::new();
        test_fn(&mut pool);
    }

    #[test]
    fn test_basic_roundtrip() {
        with_pool::<Buf16, _>(|pool| unsafe {
            let ptr = pool.allocate().unwrap();
            ptr.as_ptr().write([0x33; 16]);
            assert_eq!(ptr.as_ptr().read(), [0x33; 16]);
            pool.deallocate(ptr).unwrap();
        });
    }

    #[test]
    fn test_first_allocation_creates_one_chunk() {
        with_pool::<Buf16, _>(|pool| {
            assert_eq!(pool.chunk_count(), 0);
            let _ptr = pool.allocate().unwrap();
            assert_eq!(pool.chunk_count(), 1);
            assert_eq!(pool.free_block_count(), BLOCKS_PER_CHUNK - 1);
        });
    }

    #[test]
    fn test_chunk_growth_threshold() {
        with_pool::<Buf16, _>(|pool| {
            for _ in 0..BLOCKS_PER_CHUNK {
                pool.allocate().unwrap();
            }
            assert_eq!(pool.chunk_count(), 1);
            assert_eq!(pool.free_block_count(), 0);

            pool.allocate().unwrap();
            assert_eq!(pool.chunk_count(), 2);
            assert_eq!(pool.free_block_count(), BLOCKS_PER_CHUNK - 1);
        });
    }

    #[test]
    fn test_blocks_do_not_overlap() {
        with_pool::<Buf16, _>(|pool| unsafe {
            let ptrs: Vec<_> = (0..130).map(|_| pool.allocate().unwrap()).collect();

            for (i, ptr) in ptrs.iter().enumerate() {
                ptr.as_ptr().write([i as u8; 16]);
            }
            for (i, ptr) in ptrs.iter().enumerate() {
                assert_eq!(ptr.as_ptr().read(), [i as u8; 16]);
            }
        });
    }

    #[test]
    fn test_lifo_recycling_without_growth() {
        with_pool::<Buf16, _>(|pool| unsafe {
            let ptrs: Vec<_> = (0..130).map(|_| pool.allocate().unwrap()).collect();
            assert_eq!(pool.chunk_count(), 2);

            for ptr in ptrs.into_iter().rev() {
                pool.deallocate(ptr).unwrap();
            }
            assert_eq!(pool.free_block_count(), 2 * BLOCKS_PER_CHUNK);

            for _ in 0..130 {
                pool.allocate().unwrap();
            }
            assert_eq!(pool.chunk_count(), 2);
        });
    }

    #[test]
    fn test_free_list_length_invariant() {
        with_pool::<Buf16, _>(|pool| unsafe {
            let mut live = Vec::new();
            for _ in 0..200 {
                live.push(pool.allocate().unwrap());
            }
            for _ in 0..77 {
                let ptr = live.pop().unwrap();
                pool.deallocate(ptr).unwrap();
            }
            assert_eq!(
                pool.free_block_count(),
                pool.chunk_count() * BLOCKS_PER_CHUNK - live.len()
            );
        });
    }

    #[test]
    fn test_foreign_pointer_is_reported() {
        with_pool::<Buf16, _>(|pool| unsafe {
            let ptr = pool.allocate().unwrap();
            let free_before = pool.free_block_count();

            // Off-by-one into the payload: the marker word does not match.
            let inside = NonNull::new_unchecked(ptr.as_ptr().cast::<u8>().add(1).cast::<Buf16>());
            assert!(matches!(
                pool.deallocate(inside),
                Err(FixedPoolError::ForeignPointer { .. })
            ));
            assert_eq!(pool.free_block_count(), free_before);

            pool.deallocate(ptr).unwrap();
        });
    }

    #[test]
    fn test_double_free_is_reported() {
        with_pool::<Buf16, _>(|pool| unsafe {
            let ptr = pool.allocate().unwrap();
            pool.deallocate(ptr).unwrap();
            assert!(matches!(
                pool.deallocate(ptr),
                Err(FixedPoolError::ForeignPointer { .. })
            ));
        });
    }

    #[test]
    fn test_recycled_block_is_reusable() {
        with_pool::<u64, _>(|pool| unsafe {
            let first = pool.allocate().unwrap();
            pool.deallocate(first).unwrap();
            let second = pool.allocate().unwrap();
            assert_eq!(first, second);
            second.as_ptr().write(7);
            pool.deallocate(second).unwrap();
        });
    }

    #[test]
    fn test_alignment_of_payloads() {
        #[repr(align(64))]
        struct Aligned([u8; 64]);

        with_pool::<Aligned, _>(|pool| {
            for _ in 0..10 {
                let ptr = pool.allocate().unwrap();
                assert_eq!(ptr.as_ptr().addr() % 64, 0);
            }
        });
    }

    #[test]
    fn test_small_payload_rounds_up_to_word() {
        // A one-byte payload still needs the word slot next to it.
        assert!(size_of::<Block<u8>>() >= size_of::<u8>() + size_of::<*mut u8>());

        with_pool::<u8, _>(|pool| unsafe {
            let a = pool.allocate().unwrap();
            let b = pool.allocate().unwrap();
            a.as_ptr().write(0xAA);
            b.as_ptr().write(0xBB);
            assert_eq!(a.as_ptr().read(), 0xAA);
            assert_eq!(b.as_ptr().read(), 0xBB);
            pool.deallocate(b).unwrap();
            pool.deallocate(a).unwrap();
        });
    }

    #[test]
    fn test_move_transfers_ownership() {
        let mut pool = FixedPool::<u64>::new();
        let ptr = pool.allocate().unwrap();
        unsafe { ptr.as_ptr().write(13) };

        let mut moved = pool;
        unsafe {
            assert_eq!(ptr.as_ptr().read(), 13);
            moved.deallocate(ptr).unwrap();
        }
        assert_eq!(moved.chunk_count(), 1);
    }
}
