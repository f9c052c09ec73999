//! Chunk-backed memory pools for user-defined objects and raw byte requests.
//!
//! This crate provides two independent, self-contained allocation facilities.
//! Both obtain contiguous chunks from the system allocator, recycle released
//! storage through free lists, and hold on to every chunk until the pool is
//! dropped. The crate is `no_std` compatible.
//!
//! # Available Pools
//!
//! ## [`FixedPool<T>`](fixed_pool::FixedPool)
//!
//! A pool for uniformly sized blocks of `size_of::<T>()` bytes. Best suited
//! for:
//!
//! - High-churn allocation of one object type (nodes, records, handles)
//! - Predictable O(1) allocate and deallocate
//! - Embedding inside another data structure that owns its storage
//!
//! ## [`MemoryPool`](memory_pool::MemoryPool)
//!
//! A variable-size heap serving arbitrary byte requests, with block
//! splitting on allocation, eager coalescing of free neighbors on release,
//! and in-place growth during reallocation when a neighbor allows it. A
//! process-wide instance is available through
//! [`MemoryPool::instance`](memory_pool::MemoryPool::instance).
//!
//! # Usage Examples
//!
//! ## Pooling one object type
//!
//! ```rust
//! use mempool::fixed_pool::FixedPool;
//!
//! let mut pool = FixedPool::<[u8; 24]>::new();
//!
//! let ptr = pool.allocate()?;
//! unsafe {
//!     ptr.as_ptr().write([0; 24]);
//!     // ... use the storage ...
//!     pool.deallocate(ptr)?;
//! }
//! # Ok::<(), mempool::fixed_pool::FixedPoolError>(())
//! ```
//!
//! ## Variable-size requests
//!
//! ```rust
//! use mempool::memory_pool::MemoryPool;
//!
//! let mut pool = MemoryPool::new();
//!
//! let ptr = pool.allocate(100).unwrap();
//! unsafe {
//!     ptr.as_ptr().write_bytes(0, 100);
//!     let grown = pool.reallocate(ptr.as_ptr(), 240).unwrap();
//!     pool.deallocate(grown.as_ptr());
//! }
//! ```
//!
//! # Design Considerations
//!
//! ## Memory Safety
//!
//! The pools hand out raw storage and keep their bookkeeping in-band, next
//! to the payload bytes. All pointer arithmetic is confined to this crate;
//! the caller-facing contract is narrow: construct and drop your objects
//! yourself, and never touch storage after releasing it. Deallocation
//! validates a marker word written on allocation, so misdirected pointers
//! are reported ([`FixedPool`](fixed_pool::FixedPool)) or ignored
//! ([`MemoryPool`](memory_pool::MemoryPool)) instead of corrupting the pool.
//! The marker is a correctness aid, not a security boundary.
//!
//! ## Thread Safety
//!
//! The pools are `Send` but not `Sync`: operations on one pool must be
//! serialized by the caller. Distinct pools are fully independent. The
//! shared [`MemoryPool::instance`](memory_pool::MemoryPool::instance) is
//! wrapped in a [`spin::Mutex`].
//!
//! ## Performance Characteristics
//!
//! | Pool | Allocation | Deallocation | Metadata overhead |
//! |------|------------|--------------|-------------------|
//! | `FixedPool<T>` | O(1)* | O(1) | one word per block |
//! | `MemoryPool` | O(n) first-fit | O(chunks) validation + O(1) merge | two words per allocated block |
//!
//! *Amortized; an empty free list acquires one chunk of 128 blocks.
//!
//! ## Integration with the Global Allocator
//!
//! The variable-size pool can back a `GlobalAlloc` implementation:
//!
//! ```rust,ignore
//! use core::alloc::{GlobalAlloc, Layout};
//! use mempool::memory_pool::MemoryPool;
//!
//! struct PoolAllocator;
//!
//! unsafe impl GlobalAlloc for PoolAllocator {
//!     unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
//!         MemoryPool::instance()
//!             .lock()
//!             .allocate(layout.size())
//!             .map_or(core::ptr::null_mut(), |ptr| ptr.as_ptr())
//!     }
//!
//!     unsafe fn dealloc(&self, ptr: *mut u8, _layout: Layout) {
//!         unsafe { MemoryPool::instance().lock().deallocate(ptr) }
//!     }
//! }
//! ```
//!
//! Note the word-sized alignment guarantee: layouts demanding more are not
//! served by this crate.

#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod fixed_pool;
pub mod memory_pool;
