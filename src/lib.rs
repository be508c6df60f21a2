//! Low-level memory-management and associative-container primitives
//! for a single-threaded runtime core: a bump arena (with a scratch-
//! buffer variant), a buddy allocator, an incrementally-rehashing
//! chained hash map, and a binary heap.
//!
//! None of these types are thread-safe; callers are responsible for
//! serializing access.

pub mod arena;
pub mod buddy;
pub mod hashmap;
pub mod heap;
pub mod page;
pub mod scratch_arena;

#[cfg(any(
    all(test, feature = "check_contracts_in_tests"),
    feature = "check_contracts"
))]
mod debug_range_map;

pub use arena::Arena;
pub use buddy::BuddySystem;
pub use hashmap::HashMap;
pub use heap::BinaryHeap;
pub use page::{FileBackedPageAllocator, OsPageAllocator, PageAllocator};
pub use scratch_arena::ScratchArena;

/// Rounds `x` up to the next multiple of 8 (word alignment).
pub(crate) const fn align8(x: usize) -> usize {
    (x + 7) & !7
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn align8_rounds_up() {
        assert_eq!(align8(0), 0);
        assert_eq!(align8(1), 8);
        assert_eq!(align8(8), 8);
        assert_eq!(align8(9), 16);
    }
}
