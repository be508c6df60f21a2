//! A classical buddy allocator over a single region reserved from a
//! `PageAllocator`.
//!
//! Each managed block carries an 8-byte header packed into a single
//! `u64`: a pair of page-offset links for its free list (`next`/
//! `prev`), its `order` (block size is `2^order` pages), `free`/
//! `first`/`last`/`left` flags, and three 4-bit magic fields used to
//! detect corruption on free.
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

use crate::page::PageAllocator;

/// No block header stores an order higher than this; a block of this
/// order spans 1024 pages.
const MAX_ORDER: usize = 10;

/// Sentinel page-offset meaning "no such link".  `next`/`prev` are 20
/// bits wide, so a region can hold at most `2^20` pages; this
/// sentinel is simply the highest representable offset, which no
/// real block ever has (it would overflow `MAX_ORDER`'s span).
const NONE_OFFSET: u32 = (1 << 20) - 1;

const NEXT_SHIFT: u32 = 0;
const MAGIC1_SHIFT: u32 = 20;
const ORDER_SHIFT: u32 = 24;
const PREV_SHIFT: u32 = 32;
const MAGIC2_SHIFT: u32 = 52;
const FREE_SHIFT: u32 = 56;
const FIRST_SHIFT: u32 = 57;
const LAST_SHIFT: u32 = 58;
const LEFT_SHIFT: u32 = 59;
const MAGIC3_SHIFT: u32 = 60;

const LINK_MASK: u64 = (1 << 20) - 1;
const MAGIC_MASK: u64 = 0xF;
const ORDER_MASK: u64 = 0xFF;

const MAGIC1: u64 = 0xA;
const MAGIC2: u64 = 0x5;
const MAGIC3: u64 = 0xC;

/// The packed per-block header.
#[repr(transparent)]
#[derive(Clone, Copy)]
struct BuddyBlock(u64);

static_assertions::assert_eq_size!(BuddyBlock, u64);
static_assertions::const_assert_eq!(std::mem::size_of::<BuddyBlock>(), 8);

impl BuddyBlock {
    fn field(&self, shift: u32, mask: u64) -> u64 {
        (self.0 >> shift) & mask
    }

    fn set_field(&mut self, shift: u32, mask: u64, value: u64) {
        self.0 = (self.0 & !(mask << shift)) | ((value & mask) << shift);
    }

    fn next(&self) -> u32 {
        self.field(NEXT_SHIFT, LINK_MASK) as u32
    }

    fn set_next(&mut self, v: u32) {
        self.set_field(NEXT_SHIFT, LINK_MASK, v as u64);
    }

    fn prev(&self) -> u32 {
        self.field(PREV_SHIFT, LINK_MASK) as u32
    }

    fn set_prev(&mut self, v: u32) {
        self.set_field(PREV_SHIFT, LINK_MASK, v as u64);
    }

    fn order(&self) -> u8 {
        self.field(ORDER_SHIFT, ORDER_MASK) as u8
    }

    fn set_order(&mut self, v: u8) {
        self.set_field(ORDER_SHIFT, ORDER_MASK, v as u64);
    }

    fn free(&self) -> bool {
        self.field(FREE_SHIFT, 1) != 0
    }

    fn set_free(&mut self, v: bool) {
        self.set_field(FREE_SHIFT, 1, v as u64);
    }

    fn first(&self) -> bool {
        self.field(FIRST_SHIFT, 1) != 0
    }

    fn set_first(&mut self, v: bool) {
        self.set_field(FIRST_SHIFT, 1, v as u64);
    }

    fn last(&self) -> bool {
        self.field(LAST_SHIFT, 1) != 0
    }

    fn set_last(&mut self, v: bool) {
        self.set_field(LAST_SHIFT, 1, v as u64);
    }

    fn left(&self) -> bool {
        self.field(LEFT_SHIFT, 1) != 0
    }

    fn set_left(&mut self, v: bool) {
        self.set_field(LEFT_SHIFT, 1, v as u64);
    }

    fn has_valid_magic(&self) -> bool {
        self.field(MAGIC1_SHIFT, MAGIC_MASK) == MAGIC1
            && self.field(MAGIC2_SHIFT, MAGIC_MASK) == MAGIC2
            && self.field(MAGIC3_SHIFT, MAGIC_MASK) == MAGIC3
    }

    fn new(order: u8, left: bool) -> Self {
        let mut b = BuddyBlock(0);
        b.set_field(MAGIC1_SHIFT, MAGIC_MASK, MAGIC1);
        b.set_field(MAGIC2_SHIFT, MAGIC_MASK, MAGIC2);
        b.set_field(MAGIC3_SHIFT, MAGIC_MASK, MAGIC3);
        b.set_order(order);
        b.set_free(true);
        b.set_left(left);
        b.set_next(NONE_OFFSET);
        b.set_prev(NONE_OFFSET);
        b.set_first(true);
        b.set_last(true);
        b
    }
}

const BLOCK_HEADER: usize = std::mem::size_of::<BuddyBlock>();

fn ilog2_floor(mut x: usize) -> usize {
    let mut r = 0;
    while x > 1 {
        x >>= 1;
        r += 1;
    }
    r
}

/// A buddy allocator over a single contiguous region.
#[derive(Debug)]
pub struct BuddySystem {
    allocator: &'static dyn PageAllocator,
    region_base: NonNull<u8>,
    region_size: usize,
    page_size: usize,
    maxpages: usize,
    maxorder: usize,
    /// Free-list head, by order: the page offset of the first block.
    bank: Vec<Option<u32>>,
}

impl Drop for BuddySystem {
    fn drop(&mut self) {
        let _ = self.allocator.release(self.region_base, self.region_size);
    }
}

impl BuddySystem {
    /// Creates a buddy allocator managing `maxpages` pages acquired
    /// from `allocator`.  Returns `None` if the region could not be
    /// acquired.
    #[requires(maxpages > 0)]
    pub fn new(allocator: &'static dyn PageAllocator, maxpages: usize) -> Option<Self> {
        let page_size = allocator.page_size();
        let region_size = maxpages * page_size;

        let base = allocator.reserve(region_size).ok()?;
        if allocator.commit(base, region_size).is_err() {
            let _ = allocator.release(base, region_size);
            return None;
        }

        let maxorder = ilog2_floor(maxpages).min(MAX_ORDER);

        let mut system = BuddySystem {
            allocator,
            region_base: base,
            region_size,
            page_size,
            maxpages,
            maxorder,
            bank: vec![None; maxorder + 1],
        };

        system.populate_free_lists();
        Some(system)
    }

    fn populate_free_lists(&mut self) {
        let mut remaining = self.maxpages;
        let mut cursor: u32 = 0;
        let mut order = self.maxorder;

        loop {
            while remaining >= (1usize << order) {
                self.emplace_free(order as u8, cursor);
                cursor += 1u32 << order;
                remaining -= 1usize << order;
            }

            if order == 0 {
                break;
            }
            order -= 1;
        }
    }

    fn block_ptr(&self, offset_pages: u32) -> *mut BuddyBlock {
        unsafe {
            self.region_base
                .as_ptr()
                .add(offset_pages as usize * self.page_size) as *mut BuddyBlock
        }
    }

    fn read_block(&self, offset_pages: u32) -> BuddyBlock {
        unsafe { self.block_ptr(offset_pages).read() }
    }

    fn write_block(&self, offset_pages: u32, block: BuddyBlock) {
        unsafe { self.block_ptr(offset_pages).write(block) }
    }

    /// Prepends a fresh free block at `offset` to the order-`order`
    /// free list.
    fn emplace_free(&mut self, order: u8, offset: u32) {
        let left = (offset >> order) & 1 == 0;
        let mut block = BuddyBlock::new(order, left);

        match self.bank[order as usize] {
            None => {}
            Some(old_head) => {
                block.set_last(false);
                block.set_next(old_head);

                let mut old = self.read_block(old_head);
                old.set_first(false);
                old.set_prev(offset);
                self.write_block(old_head, old);
            }
        }

        self.write_block(offset, block);
        self.bank[order as usize] = Some(offset);
    }

    /// Unlinks the block at `offset` (known to be at the head of
    /// `order`'s list, or anywhere in it) from its free list.
    fn erase(&mut self, order: usize, offset: u32) {
        let block = self.read_block(offset);
        let is_first = block.first();
        let is_last = block.last();

        if is_first && is_last {
            self.bank[order] = None;
            return;
        }

        if is_first {
            let next = block.next();
            self.bank[order] = Some(next);

            let mut next_block = self.read_block(next);
            next_block.set_first(true);
            next_block.set_prev(NONE_OFFSET);
            self.write_block(next, next_block);
            return;
        }

        if is_last {
            let prev = block.prev();
            let mut prev_block = self.read_block(prev);
            prev_block.set_last(true);
            prev_block.set_next(NONE_OFFSET);
            self.write_block(prev, prev_block);
            return;
        }

        let prev = block.prev();
        let next = block.next();

        let mut prev_block = self.read_block(prev);
        prev_block.set_next(next);
        self.write_block(prev, prev_block);

        let mut next_block = self.read_block(next);
        next_block.set_prev(prev);
        self.write_block(next, next_block);
    }

    fn pop(&mut self, order: usize) -> Option<u32> {
        let head = self.bank[order]?;
        self.erase(order, head);
        Some(head)
    }

    /// Allocates `size` bytes (plus the 8-byte header) and returns a
    /// pointer just past the header, or `None` if no block is large
    /// enough.
    pub fn alloc(&mut self, size: usize) -> Option<NonNull<u8>> {
        let needed = size + BLOCK_HEADER;
        let block_bytes = |order: usize| (1usize << order) * self.page_size;

        let mut minorder = 0usize;
        while minorder <= self.maxorder && block_bytes(minorder) < needed {
            minorder += 1;
        }
        if minorder > self.maxorder {
            return None;
        }

        let mut order = minorder;
        while order <= self.maxorder && self.bank[order].is_none() {
            order += 1;
        }
        if order > self.maxorder {
            return None;
        }

        let offset = self.pop(order).expect("order has a free block");
        self.shrink(offset, order, minorder);

        let mut block = self.read_block(offset);
        block.set_order(minorder as u8);
        block.set_free(false);
        // The block's order just shrank, so `left` (which is defined
        // relative to a block's *own* order) must be recomputed at
        // the new order rather than left over from the wider block
        // this one was split out of.
        block.set_left((offset >> minorder) & 1 == 0);
        self.write_block(offset, block);

        let addr = unsafe {
            self.region_base
                .as_ptr()
                .add(offset as usize * self.page_size)
                .add(BLOCK_HEADER)
        };
        NonNull::new(addr)
    }

    /// Repeatedly splits the block at `offset` (currently at `order`)
    /// down to `target_order`, freeing the upper half at each step.
    fn shrink(&mut self, offset: u32, mut order: usize, target_order: usize) {
        while order > target_order {
            order -= 1;
            let buddy_offset = offset + (1u32 << order);
            self.emplace_free(order as u8, buddy_offset);
        }
    }

    /// Frees a pointer previously returned by `alloc`, coalescing
    /// with its buddy as far up the order ladder as possible.
    pub fn free(&mut self, ptr: NonNull<u8>) {
        let block_addr = unsafe { ptr.as_ptr().sub(BLOCK_HEADER) } as usize;
        let region_addr = self.region_base.as_ptr() as usize;
        let mut offset = ((block_addr - region_addr) / self.page_size) as u32;

        let header = self.read_block(offset);
        assert!(header.has_valid_magic(), "corrupted buddy block header");
        assert!(!header.free(), "double free detected");

        let mut order = header.order() as usize;

        while order < self.maxorder {
            // Recomputed fresh rather than read from the header's
            // `left` bit: `order` advances within this loop as blocks
            // coalesce, and `left` is only meaningful relative to a
            // block's current order.
            let is_left = (offset >> order) & 1 == 0;
            let buddy_offset = if is_left {
                offset + (1u32 << order)
            } else {
                offset - (1u32 << order)
            };

            if buddy_offset as usize + (1usize << order) > self.maxpages {
                break;
            }

            let buddy = self.read_block(buddy_offset);
            if !buddy.free() || buddy.order() as usize != order {
                break;
            }

            self.erase(order, buddy_offset);
            if !is_left {
                offset = buddy_offset;
            }
            order += 1;
        }

        self.emplace_free(order as u8, offset);
    }

    /// `true` if every page in the region is accounted for by a
    /// single maximal free block (only possible when `maxpages` is a
    /// power of two).
    #[cfg(test)]
    fn is_fully_merged(&self) -> bool {
        self.bank[self.maxorder].is_some() && self.bank[..self.maxorder].iter().all(Option::is_none)
    }

    /// Sum, across all free lists, of the pages each free block
    /// spans.
    #[cfg(test)]
    fn free_pages(&self) -> usize {
        let mut total = 0usize;
        for (order, head) in self.bank.iter().enumerate() {
            let mut cursor = *head;
            while let Some(offset) = cursor {
                total += 1usize << order;
                let block = self.read_block(offset);
                cursor = if block.last() { None } else { Some(block.next()) };
            }
        }
        total
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::page::default_page_allocator;

    #[test]
    fn s4_alloc_free_round_trip() {
        let mut b = BuddySystem::new(default_page_allocator(), 8).unwrap();
        let before = b.free_pages();

        let p = b.alloc(1).unwrap();
        b.free(p);

        assert_eq!(b.free_pages(), before);
        assert!(b.is_fully_merged());
    }

    #[test]
    fn s5_coalesce_in_order() {
        let mut b = BuddySystem::new(default_page_allocator(), 4).unwrap();
        let page_size = b.page_size;

        let a = b.alloc(page_size - BLOCK_HEADER).unwrap();
        let c = b.alloc(page_size - BLOCK_HEADER).unwrap();
        let d = b.alloc(page_size - BLOCK_HEADER).unwrap();
        let e = b.alloc(page_size - BLOCK_HEADER).unwrap();

        assert_eq!(b.free_pages(), 0);

        b.free(a);
        b.free(c);
        b.free(d);
        b.free(e);

        assert_eq!(b.free_pages(), 4);
        assert!(b.is_fully_merged());
    }

    #[test]
    fn s5_coalesce_reverse_order() {
        let mut b = BuddySystem::new(default_page_allocator(), 4).unwrap();
        let page_size = b.page_size;

        let ptrs: Vec<_> = (0..4)
            .map(|_| b.alloc(page_size - BLOCK_HEADER).unwrap())
            .collect();

        for p in ptrs.into_iter().rev() {
            b.free(p);
        }

        assert!(b.is_fully_merged());
    }

    #[test]
    fn left_flag_matches_offset_parity_at_the_blocks_own_order_after_split() {
        let mut b = BuddySystem::new(default_page_allocator(), 4).unwrap();
        let page_size = b.page_size;

        let ptrs: Vec<_> = (0..4)
            .map(|_| b.alloc(page_size - BLOCK_HEADER).unwrap())
            .collect();

        for (i, p) in ptrs.iter().enumerate() {
            let offset = unsafe {
                (p.as_ptr().sub(BLOCK_HEADER) as usize - b.region_base.as_ptr() as usize)
                    / b.page_size
            } as u32;
            let block = b.read_block(offset);
            assert_eq!(block.left(), (offset >> block.order()) & 1 == 0, "block {i}");
        }

        for p in ptrs {
            b.free(p);
        }
    }

    #[test]
    fn alloc_too_large_fails() {
        let mut b = BuddySystem::new(default_page_allocator(), 2).unwrap();
        assert!(b.alloc(100 * b.page_size).is_none());
    }

    #[test]
    #[should_panic(expected = "double free")]
    fn double_free_panics() {
        let mut b = BuddySystem::new(default_page_allocator(), 2).unwrap();
        let p = b.alloc(1).unwrap();
        b.free(p);
        b.free(p);
    }

    proptest::proptest! {
        #[test]
        fn conservation_holds_across_random_alloc_free(
            ops in proptest::collection::vec(proptest::bool::ANY, 0..200)
        ) {
            let mut b = BuddySystem::new(default_page_allocator(), 16).unwrap();
            let mut live: Vec<NonNull<u8>> = Vec::new();

            for do_alloc in ops {
                if do_alloc || live.is_empty() {
                    if let Some(p) = b.alloc(8) {
                        live.push(p);
                    }
                } else {
                    let idx = live.len() - 1;
                    let p = live.remove(idx);
                    b.free(p);
                }
            }

            for p in live {
                b.free(p);
            }

            proptest::prop_assert!(b.is_fully_merged());
        }
    }
}
