//! Block-level primitives for the variable-size pool.
//!
//! Every block starts with one machine word packing the block size and three
//! status bits. Allocated blocks follow the header with a marker word holding
//! the payload address; free blocks reuse the same words for the free-list
//! links and carry a trailing footer that points back at the header.
//!
//! ```text
//! Allocated:
//! ┌────────┬────────┬──────────────────────────────┐
//! │ header │ marker │ payload…                     │
//! └────────┴────────┴──────────────────────────────┘
//! Free:
//! ┌────────┬────────┬────────┬────────────┬────────┐
//! │ header │ prev   │ next   │ …          │ footer │
//! └────────┴────────┴────────┴────────────┴────────┘
//! ```
//!
//! All offsets and sizes are multiples of [`WORD`]; the size field lives
//! above the flag bits, shifted by `SIZE_SHIFT`.

use core::ptr::NonNull;

use bitflags::bitflags;

/// One machine word, the granularity of all block metadata.
pub(super) const WORD: usize = size_of::<usize>();
/// Offset from a block header to its payload: header plus marker.
pub(super) const PAYLOAD_OFFSET: usize = 2 * WORD;
/// Smallest block: header, two free-list links, footer.
pub(super) const MIN_BLOCK_SIZE: usize = 4 * WORD;

const SIZE_SHIFT: usize = 3;

bitflags! {
    /// Status bits stored in the low bits of a block header.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub(super) struct BlockFlags: usize {
        /// The block is on the free list.
        const FREE = 1 << 0;
        /// The immediately preceding block within the chunk is free.
        const PREV_FREE = 1 << 1;
        /// The block's end coincides with the chunk payload's end.
        const LAST = 1 << 2;
    }
}

const _: () = assert!(BlockFlags::all().bits() >> SIZE_SHIFT == 0);
const _: () = assert!(MIN_BLOCK_SIZE >= PAYLOAD_OFFSET + WORD);

/// A raw reference to a block, addressed by its header word.
///
/// `BlockRef` is a thin wrapper over the header pointer. Every accessor is
/// unsafe because it dereferences in-band metadata: callers must uphold the
/// block layout described in the module documentation and keep the reference
/// within storage owned by the pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) struct BlockRef(NonNull<usize>);

impl BlockRef {
    /// Wraps a pointer to a header word.
    ///
    /// # Safety
    ///
    /// `header` must be non-null, word-aligned and point into pool-owned
    /// chunk storage.
    pub(super) unsafe fn from_header(header: *mut usize) -> Self {
        debug_assert!(!header.is_null());
        debug_assert!(header.addr() % WORD == 0);
        Self(unsafe { NonNull::new_unchecked(header) })
    }

    /// Recovers the block reference from a payload pointer.
    ///
    /// # Safety
    ///
    /// `payload` must be word-aligned and at least [`PAYLOAD_OFFSET`] bytes
    /// into pool-owned chunk storage. The result only refers to a real block
    /// when `payload` came from [`BlockRef::payload`]; validating that is the
    /// caller's job (the marker exists for it).
    pub(super) unsafe fn from_payload(payload: *mut u8) -> Self {
        unsafe { Self::from_header(payload.sub(PAYLOAD_OFFSET).cast::<usize>()) }
    }

    pub(super) fn header_ptr(self) -> *mut usize {
        self.0.as_ptr()
    }

    /// Word slot `index` words past the header; must stay within the block.
    unsafe fn word(self, index: usize) -> *mut usize {
        unsafe { self.0.as_ptr().add(index) }
    }

    pub(super) unsafe fn size(self) -> usize {
        unsafe { self.word(0).read() >> SIZE_SHIFT }
    }

    pub(super) unsafe fn flags(self) -> BlockFlags {
        BlockFlags::from_bits_truncate(unsafe { self.word(0).read() })
    }

    /// Rewrites the whole header word.
    pub(super) unsafe fn store(self, size: usize, flags: BlockFlags) {
        debug_assert!(size >= MIN_BLOCK_SIZE);
        debug_assert!(size % WORD == 0);
        debug_assert!(size >> (usize::BITS as usize - SIZE_SHIFT) == 0);
        unsafe { self.word(0).write(size << SIZE_SHIFT | flags.bits()) }
    }

    pub(super) unsafe fn insert_flags(self, flags: BlockFlags) {
        unsafe { self.store(self.size(), self.flags() | flags) }
    }

    pub(super) unsafe fn remove_flags(self, flags: BlockFlags) {
        unsafe { self.store(self.size(), self.flags() - flags) }
    }

    pub(super) unsafe fn is_free(self) -> bool {
        unsafe { self.flags() }.contains(BlockFlags::FREE)
    }

    pub(super) unsafe fn prev_is_free(self) -> bool {
        unsafe { self.flags() }.contains(BlockFlags::PREV_FREE)
    }

    pub(super) unsafe fn is_last(self) -> bool {
        unsafe { self.flags() }.contains(BlockFlags::LAST)
    }

    /// Payload address of an allocated block.
    pub(super) unsafe fn payload(self) -> NonNull<u8> {
        unsafe { NonNull::new_unchecked(self.0.as_ptr().cast::<u8>().add(PAYLOAD_OFFSET)) }
    }

    /// Writes the marker word: the payload address, recorded while the block
    /// is allocated so that deallocation can recognize its own pointers. The
    /// marker is only ever compared, never dereferenced.
    pub(super) unsafe fn write_marker(self) {
        unsafe { self.word(1).write(self.payload().as_ptr().addr()) }
    }

    pub(super) unsafe fn marker_matches(self, payload_addr: usize) -> bool {
        unsafe { self.word(1).read() == payload_addr }
    }

    /// Scrubs the marker word so a stale pointer into this block no longer
    /// validates. Catches most double frees.
    pub(super) unsafe fn clear_marker(self) {
        unsafe { self.word(1).write(0) }
    }

    /// Header of the following block within the same chunk, or `None` when
    /// this block is the chunk's last. Block sizes partition the chunk
    /// payload contiguously, so header + size lands on the next header.
    pub(super) unsafe fn next_in_chunk(self) -> Option<Self> {
        unsafe {
            if self.is_last() {
                return None;
            }
            let next = self.0.as_ptr().cast::<u8>().add(self.size()).cast::<usize>();
            Some(Self::from_header(next))
        }
    }

    /// Header of the preceding block, located through its footer.
    ///
    /// # Safety
    ///
    /// Only valid while this block's `PREV_FREE` bit is set: an allocated
    /// predecessor has no footer, so the word below the header would be
    /// payload bytes.
    pub(super) unsafe fn prev_in_chunk(self) -> Self {
        debug_assert!(unsafe { self.prev_is_free() });
        unsafe {
            let footer = self.0.as_ptr().sub(1).cast::<*mut usize>();
            Self::from_header(footer.read())
        }
    }

    /// Writes the footer back-pointer of a free block.
    pub(super) unsafe fn write_footer(self) {
        unsafe {
            let words = self.size() / WORD;
            self.word(words - 1).cast::<*mut usize>().write(self.0.as_ptr());
        }
    }

    /// Free-list predecessor link (slot shared with the marker).
    pub(super) unsafe fn free_prev(self) -> Option<Self> {
        unsafe {
            let link = self.word(1).cast::<*mut usize>().read();
            (!link.is_null()).then(|| Self::from_header(link))
        }
    }

    pub(super) unsafe fn free_next(self) -> Option<Self> {
        unsafe {
            let link = self.word(2).cast::<*mut usize>().read();
            (!link.is_null()).then(|| Self::from_header(link))
        }
    }

    pub(super) unsafe fn set_free_prev(self, prev: Option<Self>) {
        unsafe {
            self.word(1)
                .cast::<*mut usize>()
                .write(prev.map_or(core::ptr::null_mut(), Self::header_ptr));
        }
    }

    pub(super) unsafe fn set_free_next(self, next: Option<Self>) {
        unsafe {
            self.word(2)
                .cast::<*mut usize>()
                .write(next.map_or(core::ptr::null_mut(), Self::header_ptr));
        }
    }
}
