//! A bump allocator over chunks acquired from a `PageAllocator`.
//!
//! `Arena` hands out word-aligned storage and never frees individual
//! objects; all backing chunks are released together when the arena
//! is dropped.
#[cfg(any(
    all(test, feature = "check_contracts_in_tests"),
    feature = "check_contracts"
))]
use contracts::*;
#[cfg(not(any(
    all(test, feature = "check_contracts_in_tests"),
    feature = "check_contracts"
)))]
use disabled_contracts::*;

use std::ptr::NonNull;

use crate::align8;
use crate::page::{default_page_allocator, PageAllocator};

/// Default chunk size: 4 pages.
pub const DEFAULT_CHUNK_CAPACITY: usize = 4 * 4096;

#[repr(C)]
struct ChunkHeader {
    next: Option<NonNull<ChunkHeader>>,
    /// The number of bytes actually reserved and committed for this
    /// chunk, needed to release it correctly; may exceed the logical
    /// chunk capacity for dedicated large-allocation chunks, and is
    /// always rounded up to the page allocator's page size.
    mapped_size: usize,
}

const CHUNK_HEADER: usize = align8(std::mem::size_of::<ChunkHeader>());

fn round_up_to_page(size: usize, page_size: usize) -> usize {
    (size + page_size - 1) & !(page_size - 1)
}

/// A bump (arena) allocator.  See the module documentation.
#[derive(Debug)]
pub struct Arena {
    allocator: &'static dyn PageAllocator,
    chunk_capacity: usize,
    current_chunk: Option<NonNull<ChunkHeader>>,
    current_size: usize,
}

impl Default for Arena {
    fn default() -> Self {
        Arena::new(default_page_allocator(), DEFAULT_CHUNK_CAPACITY)
    }
}

impl Drop for Arena {
    fn drop(&mut self) {
        let mut cursor = self.current_chunk;

        while let Some(chunk) = cursor {
            let header = unsafe { chunk.as_ptr().read() };

            let _ = self.allocator.release(chunk.cast(), header.mapped_size);
            cursor = header.next;
        }
    }
}

impl Arena {
    /// Creates a new arena backed by `allocator`, acquiring chunks of
    /// (at least) `chunk_capacity` bytes at a time.
    #[requires(chunk_capacity >= CHUNK_HEADER, "a chunk must fit its own header")]
    pub fn new(allocator: &'static dyn PageAllocator, chunk_capacity: usize) -> Self {
        Arena {
            allocator,
            chunk_capacity: align8(chunk_capacity),
            current_chunk: None,
            current_size: 0,
        }
    }

    fn acquire_chunk(&self, logical_size: usize) -> Option<NonNull<ChunkHeader>> {
        let page_size = self.allocator.page_size();
        let mapped_size = round_up_to_page(logical_size, page_size);

        let base = self.allocator.reserve(mapped_size).ok()?;
        if self.allocator.commit(base, mapped_size).is_err() {
            let _ = self.allocator.release(base, mapped_size);
            return None;
        }

        let header: NonNull<ChunkHeader> = base.cast();
        unsafe {
            header.as_ptr().write(ChunkHeader {
                next: None,
                mapped_size,
            });
        }

        Some(header)
    }

    fn bump(&mut self, sz: usize) -> NonNull<u8> {
        let base = self.current_chunk.expect("bump requires a current chunk");
        let ptr = unsafe { (base.as_ptr() as *mut u8).add(self.current_size) };

        self.current_size += sz;
        NonNull::new(ptr).expect("arena storage is never null")
    }

    /// The small path: grab a fresh `chunk_capacity`-sized chunk, make
    /// it the new head of the chunk list and the new current chunk.
    fn alloc_small(&mut self, sz: usize) -> Option<NonNull<u8>> {
        let chunk = self.acquire_chunk(self.chunk_capacity)?;

        unsafe {
            (*chunk.as_ptr()).next = self.current_chunk;
        }

        self.current_chunk = Some(chunk);
        self.current_size = CHUNK_HEADER + sz;

        let ptr = unsafe { (chunk.as_ptr() as *mut u8).add(CHUNK_HEADER) };
        Some(NonNull::new(ptr).expect("arena storage is never null"))
    }

    /// The large path: splice a dedicated chunk in right after the
    /// current chunk, so the current chunk keeps serving small
    /// allocations.
    fn alloc_large(&mut self, sz: usize) -> Option<NonNull<u8>> {
        if self.current_chunk.is_none() {
            let head = self.acquire_chunk(self.chunk_capacity)?;
            self.current_chunk = Some(head);
            self.current_size = CHUNK_HEADER;
        }

        let dedicated = self.acquire_chunk(sz + CHUNK_HEADER)?;
        let head = self.current_chunk.expect("just ensured a current chunk");

        unsafe {
            (*dedicated.as_ptr()).next = (*head.as_ptr()).next;
            (*head.as_ptr()).next = Some(dedicated);
        }

        let ptr = unsafe { (dedicated.as_ptr() as *mut u8).add(CHUNK_HEADER) };
        Some(NonNull::new(ptr).expect("arena storage is never null"))
    }

    /// Returns `align8(size)` bytes of uninitialized, word-aligned
    /// storage, or `None` if `size` is zero or no chunk could be
    /// acquired.
    #[ensures(ret.is_none() || ret.unwrap().as_ptr() as usize % 8 == 0,
              "every allocation is word-aligned")]
    pub fn alloc(&mut self, size: usize) -> Option<NonNull<u8>> {
        if size == 0 {
            return None;
        }

        let sz = align8(size);

        if let Some(_chunk) = self.current_chunk {
            if self.current_size + sz <= self.chunk_capacity {
                return Some(self.bump(sz));
            }
        }

        if sz < (self.chunk_capacity >> 3) {
            self.alloc_small(sz)
        } else {
            self.alloc_large(sz)
        }
    }

    /// Grows a previous allocation from `old_len` to `new_len` bytes,
    /// preserving its first `old_len` bytes.  A `None` `ptr` behaves
    /// like `alloc(new_len)`.  `new_len <= old_len` is a no-op that
    /// returns `ptr` unchanged.
    pub fn grow(
        &mut self,
        ptr: Option<NonNull<u8>>,
        old_len: usize,
        new_len: usize,
    ) -> Option<NonNull<u8>> {
        let ptr = match ptr {
            None => return self.alloc(new_len),
            Some(p) => p,
        };

        if new_len == 0 {
            return None;
        }

        if new_len <= old_len {
            return Some(ptr);
        }

        let old_sz = align8(old_len);
        let new_sz = align8(new_len);
        let extra = new_sz - old_sz;

        if let Some(chunk) = self.current_chunk {
            let chunk_end = unsafe { (chunk.as_ptr() as *const u8).add(self.current_size) };
            let alloc_end = unsafe { (ptr.as_ptr() as *const u8).add(old_sz) };

            if alloc_end == chunk_end && self.current_size + extra <= self.chunk_capacity {
                self.current_size += extra;
                return Some(ptr);
            }
        }

        let fresh = self.alloc(new_len)?;
        unsafe {
            std::ptr::copy_nonoverlapping(ptr.as_ptr(), fresh.as_ptr(), old_len);
        }
        Some(fresh)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn small_arena() -> Arena {
        Arena::new(default_page_allocator(), 64)
    }

    #[test]
    fn s1_arena_chunks() {
        let mut a = small_arena();

        let p1 = a.alloc(16).unwrap();
        let p2 = a.alloc(16).unwrap();
        let p3 = a.alloc(16).unwrap();

        unsafe {
            assert_eq!(p2.as_ptr(), p1.as_ptr().add(16));
            assert_eq!(p3.as_ptr(), p2.as_ptr().add(16));
        }

        // The next allocation should have overflowed the chunk and
        // landed somewhere else entirely.
        let p4 = a.alloc(16).unwrap();
        unsafe {
            assert_ne!(p4.as_ptr(), p3.as_ptr().add(16));
        }
    }

    #[test]
    fn s2_arena_large_allocation() {
        let mut a = small_arena();

        let head_first = a.alloc(8).unwrap();
        let big = a.alloc(200).unwrap();

        unsafe {
            assert_ne!(big.as_ptr(), head_first.as_ptr().add(8));
        }

        // The head chunk must still have room for further small
        // allocations contiguous with the first one.
        let head_second = a.alloc(8).unwrap();
        unsafe {
            assert_eq!(head_second.as_ptr(), head_first.as_ptr().add(8));
        }
    }

    #[test]
    fn zero_sized_allocation_is_none() {
        let mut a = small_arena();
        assert!(a.alloc(0).is_none());
    }

    #[test]
    fn grow_preserves_prefix() {
        let mut a = small_arena();
        let p = a.alloc(8).unwrap();
        unsafe {
            *p.as_ptr() = 0xab;
        }

        let grown = a.grow(Some(p), 8, 24).unwrap();
        unsafe {
            assert_eq!(*grown.as_ptr(), 0xab);
        }
    }

    #[test]
    fn grow_extends_in_place_for_last_allocation() {
        let mut a = small_arena();
        let p = a.alloc(8).unwrap();
        let grown = a.grow(Some(p), 8, 16).unwrap();

        assert_eq!(grown.as_ptr(), p.as_ptr());
    }

    #[test]
    fn grow_with_none_behaves_like_alloc() {
        let mut a = small_arena();
        assert!(a.grow(None, 0, 16).is_some());
    }

    #[test]
    fn grow_shrinking_is_a_no_op() {
        let mut a = small_arena();
        let p = a.alloc(32).unwrap();
        let same = a.grow(Some(p), 32, 8).unwrap();

        assert_eq!(same.as_ptr(), p.as_ptr());
    }

    proptest::proptest! {
        #[test]
        fn every_allocation_is_word_aligned(sizes in proptest::collection::vec(1usize..=500, 0..64)) {
            let mut a = Arena::new(default_page_allocator(), DEFAULT_CHUNK_CAPACITY);

            for size in sizes {
                if let Some(p) = a.alloc(size) {
                    proptest::prop_assert_eq!(p.as_ptr() as usize % 8, 0);
                }
            }
        }
    }
}
