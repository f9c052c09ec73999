//! Variable-size memory pool implementation.
//!
//! This module provides a general-purpose allocator that serves arbitrary
//! byte-size requests from chunk-backed storage. Chunks are acquired from the
//! system allocator on demand, partitioned into blocks with in-band metadata,
//! and released only when the pool is dropped.
//!
//! # Algorithm
//!
//! Free blocks are tracked by an **intrusive doubly-linked list** threaded
//! through the free blocks themselves, searched **first-fit**:
//!
//! - **Allocation**: walks the free list for the first block large enough.
//!   A block with enough excess is split into an allocated head and a free
//!   tail; a smaller excess is absorbed into the allocation. When no block
//!   fits, a new chunk is acquired and partitioned into one allocated block
//!   and one free tail.
//! - **Deallocation**: validates that the pointer carries this pool's marker,
//!   then merges the block with its free neighbors on both sides before
//!   reinserting it. Coalescing is eager: no two adjacent free blocks exist
//!   after any operation.
//! - **Reallocation**: grows in place through a free successor, then through
//!   a free predecessor (moving the payload down), and only then falls back
//!   to allocate-copy-free. The fallback allocates before it frees, so a
//!   failed reallocation leaves the original block intact and the copy never
//!   reads from recycled bytes.
//!
//! Every block header packs its size and status bits into one machine word;
//! free blocks carry a trailing footer so the predecessor of any block whose
//! `PREV_FREE` bit is set can be found in O(1).
//!
//! # Chunk sizing
//!
//! A chunk is at least 4096 bytes; oversized requests round the chunk up to
//! the next power of two that fits the chunk header, the request and one
//! minimal free block.
//!
//! # Failure and misuse
//!
//! - Out of memory surfaces as `None`; the pool stays usable.
//! - `allocate(0)` returns `None`; it is not an error.
//! - Foreign pointers (unaligned, outside every chunk, or without a matching
//!   marker) are ignored by [`deallocate`](MemoryPool::deallocate) and make
//!   [`reallocate`](MemoryPool::reallocate) return `None` without freeing
//!   anything. The marker is a correctness aid, not a security boundary.
//!
//! # Alignment
//!
//! Returned payload pointers are aligned to one machine word.
//!
//! # Thread Safety
//!
//! A pool requires external serialization; the process-wide instance behind
//! [`MemoryPool::instance`] is wrapped in a [`spin::Mutex`] for that reason.
//! Distinct pools are independent and may live on distinct threads.

use core::{alloc::Layout, ptr, ptr::NonNull};

use spin::Mutex;

use self::block::{BlockFlags, BlockRef, MIN_BLOCK_SIZE, PAYLOAD_OFFSET, WORD};

mod block;

/// Smallest chunk acquired from the system allocator.
pub const DEFAULT_CHUNK_SIZE: usize = 4096;

const CHUNK_HEADER_SIZE: usize = size_of::<ChunkHeader>();

/// Prefix of every chunk: the chunk list link and the chunk's total size,
/// which is needed to rebuild the layout when the chunk is released.
#[repr(C)]
struct ChunkHeader {
    next: *mut ChunkHeader,
    size: usize,
}

/// A chunk-backed pool for variable-size allocations.
///
/// The pool hands out raw byte storage; initializing and dropping values
/// inside the returned blocks is the caller's responsibility. Dropping the
/// pool releases every chunk, invalidating all pointers it ever returned.
///
/// Most callers can share the process-wide pool behind
/// [`instance`](Self::instance); embedders that want full control over the
/// lifetime can own one through [`new`](Self::new).
///
/// # Examples
///
/// ```
/// use mempool::memory_pool::MemoryPool;
///
/// let mut pool = MemoryPool::new();
/// let ptr = pool.allocate(64).unwrap();
/// unsafe {
///     ptr.as_ptr().write_bytes(0xAB, 64);
///     pool.deallocate(ptr.as_ptr());
/// }
/// ```
pub struct MemoryPool {
    chunk_head: *mut ChunkHeader,
    free_head: Option<BlockRef>,
}

unsafe impl Send for MemoryPool {}

static SHARED: Mutex<MemoryPool> = Mutex::new(MemoryPool::new());

impl Default for MemoryPool {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryPool {
    /// Creates an empty pool. No memory is acquired until the first
    /// allocation.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            chunk_head: ptr::null_mut(),
            free_head: None,
        }
    }

    /// Returns the process-wide shared pool.
    ///
    /// The pool is never torn down; its chunks are reclaimed by the
    /// operating system at process exit.
    #[must_use]
    pub fn instance() -> &'static Mutex<MemoryPool> {
        &SHARED
    }

    /// Allocates `size` bytes and returns a word-aligned pointer to them.
    ///
    /// Returns `None` when `size` is zero and when the system allocator
    /// cannot provide a new chunk; the pool remains usable after a failure.
    pub fn allocate(&mut self, size: usize) -> Option<NonNull<u8>> {
        if size == 0 {
            return None;
        }
        let needed = block_size_for(size)?;
        unsafe {
            if let Some(block) = self.find_first_fit(needed) {
                self.unlink(block);
                block.remove_flags(BlockFlags::FREE);
                self.finish_block(block, needed);
                Some(block.payload())
            } else {
                self.grow(needed)
            }
        }
    }

    /// Releases a block previously returned by this pool.
    ///
    /// Null pointers are a no-op. Foreign pointers — unaligned, outside
    /// every chunk, or not carrying the marker written on allocation — are
    /// ignored without mutating any pool state. The released block is merged
    /// with free neighbors on both sides before rejoining the free list.
    ///
    /// # Safety
    ///
    /// If `ptr` is a live pointer obtained from this pool, the caller must
    /// not use it afterwards: the storage reverts to pool ownership and will
    /// be recycled. Pointer values outside this pool's chunks are rejected by
    /// address comparison alone and never dereferenced; an in-chunk candidate
    /// has only its adjacent marker word examined.
    pub unsafe fn deallocate(&mut self, ptr: *mut u8) {
        if ptr.is_null() {
            return;
        }
        let Some(block) = self.lookup(ptr) else {
            log::debug!("memory pool ignored foreign pointer {:#x}", ptr.addr());
            return;
        };
        unsafe { self.release(block) }
    }

    /// Resizes a block previously returned by this pool.
    ///
    /// - `ptr` null: behaves as [`allocate`](Self::allocate).
    /// - `size` zero: frees the block and returns `None`.
    /// - Foreign `ptr`: returns `None` and frees nothing.
    ///
    /// Growth happens in place when a free neighbor can absorb the request:
    /// through the successor first (the pointer is unchanged), then through
    /// the predecessor (the payload moves down to the new start). Otherwise
    /// the block is relocated and the payload copied; in that case `None`
    /// means the new allocation failed and the original block is untouched.
    /// The first `min(old, size)` payload bytes are preserved in all cases.
    ///
    /// # Safety
    ///
    /// Same contract as [`deallocate`](Self::deallocate): a live pointer
    /// passed here must not be used again unless it is returned back
    /// unchanged.
    pub unsafe fn reallocate(&mut self, ptr: *mut u8, size: usize) -> Option<NonNull<u8>> {
        if ptr.is_null() {
            return self.allocate(size);
        }
        let Some(block) = self.lookup(ptr) else {
            log::debug!("memory pool refused to resize foreign pointer {:#x}", ptr.addr());
            return None;
        };
        if size == 0 {
            unsafe { self.release(block) };
            return None;
        }
        let needed = block_size_for(size)?;

        unsafe {
            let current = block.size();
            let old_payload = current - PAYLOAD_OFFSET;

            if current >= needed {
                self.finish_block(block, needed);
                return Some(block.payload());
            }

            // Grow forward into a free successor; the payload stays put.
            if let Some(next) = block.next_in_chunk() {
                if next.is_free() && current + next.size() >= needed {
                    self.unlink(next);
                    let mut flags = block.flags() - BlockFlags::LAST;
                    if next.is_last() {
                        flags |= BlockFlags::LAST;
                    }
                    block.store(current + next.size(), flags);
                    self.finish_block(block, needed);
                    return Some(block.payload());
                }
            }

            // Grow backward into a free predecessor; the payload moves down
            // to the merged block's start before any split can touch it.
            if block.prev_is_free() {
                let prev = block.prev_in_chunk();
                let merged = prev.size() + current;
                if merged >= needed {
                    self.unlink(prev);
                    let mut flags = BlockFlags::empty();
                    if block.is_last() {
                        flags |= BlockFlags::LAST;
                    }
                    prev.store(merged, flags);
                    ptr::copy(ptr, prev.payload().as_ptr(), old_payload);
                    self.finish_block(prev, needed);
                    return Some(prev.payload());
                }
            }

            // Relocate. Allocating before freeing keeps the source bytes
            // intact for the copy and leaves the original block allocated
            // when the new allocation fails.
            let new_ptr = self.allocate(size)?;
            ptr::copy_nonoverlapping(ptr, new_ptr.as_ptr(), old_payload.min(size));
            self.release(block);
            Some(new_ptr)
        }
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

    /// Number of blocks on the free list.
    #[must_use]
    pub fn free_block_count(&self) -> usize {
        let mut count = 0;
        let mut cur = self.free_head;
        while let Some(block) = cur {
            count += 1;
            cur = unsafe { block.free_next() };
        }
        count
    }

    /// Total bytes tracked by the free list, including per-block metadata.
    #[must_use]
    pub fn free_bytes(&self) -> usize {
        let mut bytes = 0;
        let mut cur = self.free_head;
        while let Some(block) = cur {
            unsafe {
                bytes += block.size();
                cur = block.free_next();
            }
        }
        bytes
    }

    /// Verifies the pool's in-band metadata and panics on any inconsistency.
    ///
    /// Walks every chunk checking that block sizes partition the payload
    /// without gaps, that no two adjacent free blocks exist, that every
    /// `PREV_FREE` bit mirrors its predecessor and every footer points back
    /// at its header, and that the free list covers exactly the free blocks.
    /// Intended for tests and debugging.
    pub fn assert_invariants(&self) {
        unsafe {
            let mut free_in_chunks = 0;
            let mut chunk = self.chunk_head;
            while !chunk.is_null() {
                let chunk_size = (*chunk).size;
                let end = chunk.cast::<u8>().add(chunk_size);
                let mut block =
                    BlockRef::from_header(chunk.cast::<u8>().add(CHUNK_HEADER_SIZE).cast::<usize>());
                let mut prev_free = false;
                loop {
                    let size = block.size();
                    assert!(size >= MIN_BLOCK_SIZE, "block below minimum size");
                    assert!(size % WORD == 0, "block size not word-granular");
                    assert_eq!(
                        block.prev_is_free(),
                        prev_free,
                        "PREV_FREE bit does not mirror the predecessor"
                    );
                    if block.is_free() {
                        assert!(!prev_free, "adjacent free blocks not coalesced");
                        let footer = block
                            .header_ptr()
                            .byte_add(size - WORD)
                            .cast::<*mut usize>()
                            .read();
                        assert_eq!(footer, block.header_ptr(), "footer does not point at header");
                        free_in_chunks += 1;
                    }
                    prev_free = block.is_free();

                    let block_end = block.header_ptr().cast::<u8>().add(size);
                    if block.is_last() {
                        assert_eq!(block_end, end, "LAST block does not end the chunk");
                        break;
                    }
                    assert!(block_end < end, "block overruns its chunk");
                    block = BlockRef::from_header(block_end.cast::<usize>());
                }
                chunk = (*chunk).next;
            }

            let mut listed = 0;
            let mut prev: Option<BlockRef> = None;
            let mut cur = self.free_head;
            while let Some(block) = cur {
                assert!(block.is_free(), "free list entry without FREE bit");
                assert_eq!(block.free_prev(), prev, "free list back-link broken");
                listed += 1;
                prev = cur;
                cur = block.free_next();
            }
            assert_eq!(listed, free_in_chunks, "free list does not cover free blocks");
        }
    }

    /// First free block whose size can hold `needed` bytes.
    unsafe fn find_first_fit(&self, needed: usize) -> Option<BlockRef> {
        let mut cur = self.free_head;
        while let Some(block) = cur {
            unsafe {
                if block.size() >= needed {
                    return Some(block);
                }
                cur = block.free_next();
            }
        }
        None
    }

    /// Validates that `ptr` is word-aligned, inside one of this pool's
    /// chunks and carries the allocation marker. Pointers that fail any
    /// check are never dereferenced.
    fn lookup(&self, ptr: *mut u8) -> Option<BlockRef> {
        if ptr.addr() % WORD != 0 {
            return None;
        }
        let mut chunk = self.chunk_head;
        while !chunk.is_null() {
            unsafe {
                let start = chunk.addr() + CHUNK_HEADER_SIZE + PAYLOAD_OFFSET;
                let end = chunk.addr() + (*chunk).size;
                if (start..end).contains(&ptr.addr()) {
                    let block = BlockRef::from_payload(ptr);
                    return block.marker_matches(ptr.addr()).then_some(block);
                }
                chunk = (*chunk).next;
            }
        }
        None
    }

    unsafe fn unlink(&mut self, block: BlockRef) {
        unsafe {
            let prev = block.free_prev();
            let next = block.free_next();
            match prev {
                Some(prev) => prev.set_free_next(next),
                None => self.free_head = next,
            }
            if let Some(next) = next {
                next.set_free_prev(prev);
            }
        }
    }

    unsafe fn link_front(&mut self, block: BlockRef) {
        unsafe {
            block.set_free_prev(None);
            block.set_free_next(self.free_head);
            if let Some(head) = self.free_head {
                head.set_free_prev(Some(block));
            }
            self.free_head = Some(block);
        }
    }

    /// Trims an allocated block down to `needed` bytes, releasing a tail
    /// block when the excess can stand on its own and absorbing it
    /// otherwise, then stamps the marker. Neighbor bits are updated in both
    /// cases.
    unsafe fn finish_block(&mut self, block: BlockRef, needed: usize) {
        unsafe {
            let excess = block.size() - needed;
            if excess >= MIN_BLOCK_SIZE {
                let was_last = block.is_last();
                block.store(needed, block.flags() - BlockFlags::LAST);
                let tail = BlockRef::from_header(block.header_ptr().byte_add(needed));
                tail.store(
                    excess,
                    if was_last {
                        BlockFlags::LAST
                    } else {
                        BlockFlags::empty()
                    },
                );
                self.release(tail);
            } else if let Some(next) = block.next_in_chunk() {
                next.remove_flags(BlockFlags::PREV_FREE);
            }
            block.write_marker();
        }
    }

    /// Returns a block to the free list, eagerly merging it with a free
    /// successor and a free predecessor.
    unsafe fn release(&mut self, block: BlockRef) {
        unsafe {
            block.clear_marker();
            let mut start = block;
            let mut size = block.size();
            let mut last = block.is_last();

            if let Some(next) = block.next_in_chunk() {
                if next.is_free() {
                    self.unlink(next);
                    size += next.size();
                    last = next.is_last();
                }
            }
            if block.prev_is_free() {
                let prev = block.prev_in_chunk();
                self.unlink(prev);
                size += prev.size();
                start = prev;
            }

            let mut flags = BlockFlags::FREE;
            if last {
                flags |= BlockFlags::LAST;
            }
            start.store(size, flags);
            start.write_footer();
            if let Some(next) = start.next_in_chunk() {
                next.insert_flags(BlockFlags::PREV_FREE);
            }
            self.link_front(start);
        }
    }

    /// Acquires a fresh chunk sized for `needed`, partitions it into one
    /// allocated block and one free tail, and returns the allocated payload.
    unsafe fn grow(&mut self, needed: usize) -> Option<NonNull<u8>> {
        let wanted = CHUNK_HEADER_SIZE
            .checked_add(needed)?
            .checked_add(MIN_BLOCK_SIZE)?;
        let chunk_size = wanted.checked_next_power_of_two()?.max(DEFAULT_CHUNK_SIZE);
        let layout = Layout::from_size_align(chunk_size, align_of::<ChunkHeader>()).ok()?;

        let chunk = NonNull::new(unsafe { alloc::alloc::alloc(layout) })?.cast::<ChunkHeader>();
        unsafe {
            (&raw mut (*chunk.as_ptr()).next).write(self.chunk_head);
            (&raw mut (*chunk.as_ptr()).size).write(chunk_size);
            self.chunk_head = chunk.as_ptr();

            let first = BlockRef::from_header(
                chunk.as_ptr().cast::<u8>().add(CHUNK_HEADER_SIZE).cast::<usize>(),
            );
            first.store(needed, BlockFlags::empty());
            first.write_marker();

            // The sizing above guarantees the remainder can stand alone.
            let tail = BlockRef::from_header(first.header_ptr().byte_add(needed));
            tail.store(
                chunk_size - CHUNK_HEADER_SIZE - needed,
                BlockFlags::FREE | BlockFlags::LAST,
            );
            tail.write_footer();
            self.link_front(tail);

            log::trace!("memory pool acquired chunk: bytes={chunk_size}");
            Some(first.payload())
        }
    }
}

impl Drop for MemoryPool {
    fn drop(&mut self) {
        let mut chunk = self.chunk_head;
        while !chunk.is_null() {
            unsafe {
                let next = (*chunk).next;
                let layout = Layout::from_size_align_unchecked((*chunk).size, align_of::<ChunkHeader>());
                alloc::alloc::dealloc(chunk.cast::<u8>(), layout);
                chunk = next;
            }
        }
    }
}

/// Block size that serves a `size`-byte request: payload offset plus the
/// request, word-rounded, and never below the minimum block.
fn block_size_for(size: usize) -> Option<usize> {
    let needed = PAYLOAD_OFFSET
        .checked_add(size)?
        .checked_next_multiple_of(WORD)?;
    Some(needed.max(MIN_BLOCK_SIZE))
}
