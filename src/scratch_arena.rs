//! An `Arena` variant that first drains a caller-supplied buffer
//! before falling back to ordinary chunked allocation.
//!
//! On 64-bit systems, user-space addresses only use the low 48 bits;
//! the high 16 bits of a pointer are always zero.  While the scratch
//! buffer is active, we stash its size in those high bits of
//! `current_chunk`, so "are we still in scratch mode" is a single
//! mask-and-compare.  Once abandoned, `current_chunk` holds a plain
//! chunk pointer (whose high bits are zero anyway) and behaves
//! exactly like `Arena`.
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

const ADDRESS_MASK: usize = 0x0000_ffff_ffff_ffff;
const TAG_SHIFT: u32 = 48;

fn pack(addr: usize, tag: u16) -> usize {
    (addr & ADDRESS_MASK) | ((tag as usize) << TAG_SHIFT)
}

fn tag_of(packed: usize) -> u16 {
    (packed >> TAG_SHIFT) as u16
}

fn addr_of(packed: usize) -> usize {
    packed & ADDRESS_MASK
}

#[repr(C)]
struct ChunkHeader {
    /// Address of the next chunk, or 0.
    next: usize,
    mapped_size: usize,
}

const CHUNK_HEADER: usize = align8(std::mem::size_of::<ChunkHeader>());

fn round_up_to_page(size: usize, page_size: usize) -> usize {
    (size + page_size - 1) & !(page_size - 1)
}

/// An arena that serves allocations out of a caller-owned buffer
/// first, and falls back to acquiring chunks from a `PageAllocator`
/// once that buffer is exhausted.
#[derive(Debug)]
pub struct ScratchArena {
    allocator: &'static dyn PageAllocator,
    chunk_capacity: usize,
    /// Tagged pointer: see the module documentation.
    current_chunk: usize,
    current_size: usize,
}

impl Drop for ScratchArena {
    fn drop(&mut self) {
        // While still in scratch mode (or with no chunk at all) there
        // is nothing owned to release: the scratch buffer belongs to
        // the caller.
        if self.in_scratch_mode() || self.current_chunk == 0 {
            return;
        }

        let mut cursor = self.current_chunk;
        while cursor != 0 {
            let header = unsafe { (cursor as *const ChunkHeader).read() };
            let base = NonNull::new(cursor as *mut u8).expect("chunk pointer is never null");

            let _ = self.allocator.release(base, header.mapped_size);
            cursor = header.next;
        }
    }
}

impl ScratchArena {
    /// Creates a scratch arena that first serves allocations out of
    /// `scratch`, then falls back to chunks of `chunk_capacity` bytes
    /// acquired from `allocator`.
    ///
    /// `scratch.len()` must fit in 16 bits, since it is stashed in
    /// the high bits of a tagged pointer.
    #[requires(scratch.len() <= u16::MAX as usize)]
    pub fn new(
        scratch: &mut [u8],
        allocator: &'static dyn PageAllocator,
        chunk_capacity: usize,
    ) -> Self {
        let current_chunk = if scratch.is_empty() {
            0
        } else {
            pack(scratch.as_mut_ptr() as usize, scratch.len() as u16)
        };

        ScratchArena {
            allocator,
            chunk_capacity: align8(chunk_capacity),
            current_chunk,
            current_size: 0,
        }
    }

    fn in_scratch_mode(&self) -> bool {
        tag_of(self.current_chunk) != 0
    }

    fn abandon_scratch(&mut self) {
        self.current_chunk = 0;
        self.current_size = 0;
    }

    fn acquire_chunk(&self, logical_size: usize) -> Option<usize> {
        let page_size = self.allocator.page_size();
        let mapped_size = round_up_to_page(logical_size, page_size);

        let base = self.allocator.reserve(mapped_size).ok()?;
        if self.allocator.commit(base, mapped_size).is_err() {
            let _ = self.allocator.release(base, mapped_size);
            return None;
        }

        let addr = base.as_ptr() as usize;
        unsafe {
            (addr as *mut ChunkHeader).write(ChunkHeader {
                next: 0,
                mapped_size,
            });
        }

        Some(addr)
    }

    fn bump(&mut self, sz: usize) -> NonNull<u8> {
        let base = addr_of(self.current_chunk);
        let ptr = (base + self.current_size) as *mut u8;

        self.current_size += sz;
        NonNull::new(ptr).expect("arena storage is never null")
    }

    fn alloc_small(&mut self, sz: usize) -> Option<NonNull<u8>> {
        let chunk = self.acquire_chunk(self.chunk_capacity)?;
        let previous_head = if self.in_scratch_mode() || self.current_chunk == 0 {
            0
        } else {
            self.current_chunk
        };

        unsafe {
            (*(chunk as *mut ChunkHeader)).next = previous_head;
        }

        self.current_chunk = chunk;
        self.current_size = CHUNK_HEADER + sz;

        let ptr = (chunk + CHUNK_HEADER) as *mut u8;
        Some(NonNull::new(ptr).expect("arena storage is never null"))
    }

    fn alloc_large(&mut self, sz: usize) -> Option<NonNull<u8>> {
        if self.in_scratch_mode() || self.current_chunk == 0 {
            let head = self.acquire_chunk(self.chunk_capacity)?;
            self.current_chunk = head;
            self.current_size = CHUNK_HEADER;
        }

        let dedicated = self.acquire_chunk(sz + CHUNK_HEADER)?;
        let head = self.current_chunk;

        unsafe {
            let head_next = (*(head as *const ChunkHeader)).next;
            (*(dedicated as *mut ChunkHeader)).next = head_next;
            (*(head as *mut ChunkHeader)).next = dedicated;
        }

        let ptr = (dedicated + CHUNK_HEADER) as *mut u8;
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

        if self.in_scratch_mode() {
            let capacity = tag_of(self.current_chunk) as usize;
            if self.current_size + sz <= capacity {
                return Some(self.bump(sz));
            }
            self.abandon_scratch();
        } else if self.current_chunk != 0 && self.current_size + sz <= self.chunk_capacity {
            return Some(self.bump(sz));
        }

        if sz < (self.chunk_capacity >> 3) {
            self.alloc_small(sz)
        } else {
            self.alloc_large(sz)
        }
    }

    /// Grows a previous allocation; see `Arena::grow` for the exact
    /// contract.
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

        let capacity = if self.in_scratch_mode() {
            tag_of(self.current_chunk) as usize
        } else {
            self.chunk_capacity
        };

        if self.current_chunk != 0 {
            let base = addr_of(self.current_chunk);
            let chunk_end = (base + self.current_size) as *const u8;
            let alloc_end = unsafe { (ptr.as_ptr() as *const u8).add(old_sz) };

            if alloc_end == chunk_end && self.current_size + extra <= capacity {
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

    #[test]
    fn s3_scratch_buffer_then_abandon() {
        let mut buf = [0u8; 128];
        let buf_addr = buf.as_ptr() as usize;
        let mut a = ScratchArena::new(&mut buf, default_page_allocator(), 64);

        let p1 = a.alloc(64).unwrap();
        assert_eq!(p1.as_ptr() as usize, buf_addr);

        let p2 = a.alloc(64).unwrap();
        assert_eq!(p2.as_ptr() as usize, buf_addr + 64);

        // This allocation cannot fit in the remaining scratch space
        // and must abandon it.
        let p3 = a.alloc(64).unwrap();
        assert!(p3.as_ptr() as usize != buf_addr + 128);
        assert!((p3.as_ptr() as usize) < buf_addr || (p3.as_ptr() as usize) >= buf_addr + 128);
    }

    #[test]
    fn empty_scratch_buffer_behaves_like_arena() {
        let mut buf: [u8; 0] = [];
        let mut a = ScratchArena::new(&mut buf, default_page_allocator(), 64);

        assert!(!a.in_scratch_mode());
        assert!(a.alloc(16).is_some());
    }

    #[test]
    fn grow_inside_scratch_buffer_extends_in_place() {
        let mut buf = [0u8; 128];
        let mut a = ScratchArena::new(&mut buf, default_page_allocator(), 64);

        let p = a.alloc(16).unwrap();
        let grown = a.grow(Some(p), 16, 32).unwrap();

        assert_eq!(grown.as_ptr(), p.as_ptr());
    }

    proptest::proptest! {
        #[test]
        fn abandonment_is_permanent(sizes in proptest::collection::vec(1usize..=40, 0..40)) {
            let mut buf = [0u8; 64];
            let buf_addr = buf.as_ptr() as usize;
            let mut a = ScratchArena::new(&mut buf, default_page_allocator(), 256);
            let mut abandoned = false;

            for size in sizes {
                if let Some(p) = a.alloc(size) {
                    let addr = p.as_ptr() as usize;
                    let in_scratch = addr >= buf_addr && addr < buf_addr + buf.len();
                    if abandoned {
                        proptest::prop_assert!(!in_scratch);
                    }
                    if !in_scratch {
                        abandoned = true;
                    }
                }
            }
        }
    }
}
