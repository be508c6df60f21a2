//! A chained hash map that rehashes incrementally: instead of
//! stopping the world to migrate every bucket when the load factor
//! gets too high, each mutation or lookup migrates a small, bounded
//! number of buckets from the old table into a new one.
use std::cell::Cell;
use std::collections::hash_map::RandomState;
use std::hash::{BuildHasher, Hash, Hasher};
use std::rc::Rc;

const INITIAL_ORDER: u32 = 2;

/// Non-empty buckets migrated per rehash step.
const REHASH_BUCKETS_PER_STEP: usize = 1;

/// Empty buckets we're willing to skip over before giving up on a
/// step, so a long run of empty buckets can't make one operation do
/// unbounded work.
const REHASH_EMPTY_BUCKET_CAP: usize = REHASH_BUCKETS_PER_STEP << 5;

struct Entry<K, V> {
    key: K,
    value: V,
    next: Option<Box<Entry<K, V>>>,
}

struct Table<K, V> {
    /// Empty (`capacity() == 0`) when the table is not in use, which
    /// is the steady state for `tables[1]` outside of a rehash.
    buckets: Vec<Option<Box<Entry<K, V>>>>,
    used: usize,
    order: u32,
}

impl<K, V> Table<K, V> {
    fn with_order(order: u32) -> Self {
        let capacity = 1usize << order;
        Table {
            buckets: (0..capacity).map(|_| None).collect(),
            used: 0,
            order,
        }
    }

    fn empty() -> Self {
        Table {
            buckets: Vec::new(),
            used: 0,
            order: 0,
        }
    }

    fn capacity(&self) -> usize {
        self.buckets.len()
    }

    fn mask(&self) -> usize {
        self.capacity() - 1
    }
}

/// An incrementally-rehashing chained hash map.
///
/// Not thread-safe: every operation assumes exclusive access.
pub struct HashMap<K, V, S = RandomState> {
    tables: [Table<K, V>; 2],
    /// The next bucket of `tables[0]` due to be migrated, or `None`
    /// when no rehash is in progress.
    rehashid: Option<usize>,
    /// Live iterators; rehashing is paused while this is nonzero, so
    /// that an iterator always walks a single, stable physical
    /// layout.
    nriters: Cell<usize>,
    hash_builder: S,
}

impl<K: Eq + Hash, V> Default for HashMap<K, V, RandomState> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: Eq + Hash, V> HashMap<K, V, RandomState> {
    pub fn new() -> Self {
        Self::with_hasher(RandomState::new())
    }
}

impl<K: Eq + Hash, V, F: Fn(&[u8]) -> u64> HashMap<K, V, FnBuildHasher<F>> {
    /// Creates a map parameterised by a byte-level hash functor —
    /// `Fn(&[u8]) -> u64` — taking the place of `with_hasher`'s
    /// `BuildHasher`. This is the shape described for this map: the
    /// functor sees the key's bytes (via `Hash`'s usual byte-at-a-time
    /// feed into `Hasher::write`) and reduces them to a 64-bit hash
    /// directly, the same way `BinaryHeap` is parameterised by a
    /// caller-supplied `<` predicate instead of a trait bound.
    pub fn with_hash_fn(f: F) -> Self {
        Self::with_hasher(FnBuildHasher { f: Rc::new(f) })
    }
}

/// A `Hasher` that buffers every byte written to it and reduces the
/// buffer through a single `Fn(&[u8]) -> u64` functor on `finish`.
struct FnHasher<F> {
    buf: Vec<u8>,
    f: Rc<F>,
}

impl<F: Fn(&[u8]) -> u64> Hasher for FnHasher<F> {
    fn write(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    fn finish(&self) -> u64 {
        (self.f)(&self.buf)
    }
}

/// `BuildHasher` adapter around a plain `Fn(&[u8]) -> u64` functor.
#[derive(Clone)]
pub struct FnBuildHasher<F> {
    f: Rc<F>,
}

impl<F: Fn(&[u8]) -> u64> BuildHasher for FnBuildHasher<F> {
    type Hasher = FnHasher<F>;

    fn build_hasher(&self) -> FnHasher<F> {
        FnHasher {
            buf: Vec::new(),
            f: self.f.clone(),
        }
    }
}

impl<K: Eq + Hash, V, S: BuildHasher> HashMap<K, V, S> {
    pub fn with_hasher(hash_builder: S) -> Self {
        HashMap {
            tables: [Table::with_order(INITIAL_ORDER), Table::empty()],
            rehashid: None,
            nriters: Cell::new(0),
            hash_builder,
        }
    }

    fn hash_of(&self, key: &K) -> u64 {
        let mut hasher = self.hash_builder.build_hasher();
        key.hash(&mut hasher);
        hasher.finish()
    }

    fn is_rehashing(&self) -> bool {
        self.rehashid.is_some()
    }

    /// Total number of entries across both tables.
    pub fn len(&self) -> usize {
        self.tables[0].used + self.tables[1].used
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Total bucket count across both tables.  (A superseded draft of
    /// this map double-counted `tables[0]` here; both tables'
    /// capacities are counted exactly once.)
    pub fn nrbuckets(&self) -> usize {
        self.tables[0].capacity() + self.tables[1].capacity()
    }

    fn needs_rehash(&self) -> bool {
        !self.is_rehashing() && self.tables[0].used >= self.tables[0].capacity()
    }

    /// Called at the start of every public operation: starts a
    /// rehash if the load factor demands it, and advances any rehash
    /// already in progress by one bounded step.
    fn rehash_on_every_operation(&mut self) {
        if self.nriters.get() > 0 {
            return;
        }

        if self.needs_rehash() {
            self.tables[1] = Table::with_order(self.tables[0].order + 1);
            self.rehashid = Some(0);
        }

        if self.is_rehashing() {
            self.rehash_step();
        }
    }

    fn rehash_step(&mut self) {
        let mut id = self.rehashid.expect("rehash_step requires an active rehash");
        let mut migrated = 0usize;
        let mut empty_visited = 0usize;

        while migrated < REHASH_BUCKETS_PER_STEP
            && empty_visited < REHASH_EMPTY_BUCKET_CAP
            && id < self.tables[0].capacity()
        {
            if let Some(mut chain) = self.tables[0].buckets[id].take() {
                loop {
                    let rest = chain.next.take();
                    let new_index = (self.hash_of(&chain.key) as usize) & self.tables[1].mask();

                    chain.next = self.tables[1].buckets[new_index].take();
                    self.tables[0].used -= 1;
                    self.tables[1].buckets[new_index] = Some(chain);
                    self.tables[1].used += 1;

                    match rest {
                        Some(next) => chain = next,
                        None => break,
                    }
                }
                migrated += 1;
            } else {
                empty_visited += 1;
            }

            id += 1;
        }

        self.rehashid = Some(id);

        if self.tables[0].used == 0 {
            self.tables[0] = std::mem::replace(&mut self.tables[1], Table::empty());
            self.rehashid = None;
        }
    }

    fn find_chain<'a>(table: &'a Table<K, V>, hash: u64, key: &K) -> Option<&'a Box<Entry<K, V>>> {
        if table.capacity() == 0 {
            return None;
        }

        let index = (hash as usize) & table.mask();
        let mut cursor = &table.buckets[index];

        while let Some(entry) = cursor {
            if &entry.key == key {
                return Some(entry);
            }
            cursor = &entry.next;
        }

        None
    }

    fn find_chain_mut<'a>(
        table: &'a mut Table<K, V>,
        hash: u64,
        key: &K,
    ) -> Option<&'a mut Box<Entry<K, V>>> {
        if table.capacity() == 0 {
            return None;
        }

        let index = (hash as usize) & table.mask();
        let mut cursor = &mut table.buckets[index];

        while let Some(entry) = cursor {
            if &entry.key == key {
                return cursor.as_mut();
            }
            cursor = &mut entry.next;
        }

        None
    }

    pub fn get(&mut self, key: &K) -> Option<&V> {
        self.rehash_on_every_operation();

        let hash = self.hash_of(key);
        if let Some(entry) = Self::find_chain(&self.tables[0], hash, key) {
            return Some(&entry.value);
        }
        if self.is_rehashing() {
            if let Some(entry) = Self::find_chain(&self.tables[1], hash, key) {
                return Some(&entry.value);
            }
        }
        None
    }

    pub fn get_mut(&mut self, key: &K) -> Option<&mut V> {
        self.rehash_on_every_operation();

        let hash = self.hash_of(key);
        let rehashing = self.is_rehashing();

        if let Some(entry) = Self::find_chain_mut(&mut self.tables[0], hash, key) {
            return Some(&mut entry.value);
        }
        if rehashing {
            if let Some(entry) = Self::find_chain_mut(&mut self.tables[1], hash, key) {
                return Some(&mut entry.value);
            }
        }
        None
    }

    pub fn contains_key(&mut self, key: &K) -> bool {
        self.get(key).is_some()
    }

    /// Inserts `key`/`value`, returning the previous value if `key`
    /// was already present.
    pub fn insert(&mut self, key: K, value: V) -> Option<V> {
        self.rehash_on_every_operation();

        let hash = self.hash_of(&key);
        let rehashing = self.is_rehashing();

        if let Some(entry) = Self::find_chain_mut(&mut self.tables[0], hash, &key) {
            return Some(std::mem::replace(&mut entry.value, value));
        }
        if rehashing {
            if let Some(entry) = Self::find_chain_mut(&mut self.tables[1], hash, &key) {
                return Some(std::mem::replace(&mut entry.value, value));
            }
        }

        let table_index = if rehashing { 1 } else { 0 };
        let table = &mut self.tables[table_index];
        let index = (hash as usize) & table.mask();

        let node = Box::new(Entry {
            key,
            value,
            next: table.buckets[index].take(),
        });
        table.buckets[index] = Some(node);
        table.used += 1;

        None
    }

    /// Returns a mutable reference to `key`'s value, inserting
    /// `V::default()` first if it was absent.  This is the analogue
    /// of the index operator described for this map: a previously
    /// absent key is installed with a default-initialized value.
    pub fn get_or_insert_default(&mut self, key: K) -> &mut V
    where
        V: Default,
        K: Clone,
    {
        if !self.contains_key(&key) {
            self.insert(key.clone(), V::default());
        }
        self.get_mut(&key).expect("just inserted")
    }

    /// Removes `key`, returning its value if it was present.
    pub fn remove(&mut self, key: &K) -> Option<V> {
        self.rehash_on_every_operation();

        let hash = self.hash_of(key);
        let rehashing = self.is_rehashing();

        if let Some(value) = Self::remove_from(&mut self.tables[0], hash, key) {
            return Some(value);
        }
        if rehashing {
            if let Some(value) = Self::remove_from(&mut self.tables[1], hash, key) {
                return Some(value);
            }
        }
        None
    }

    fn remove_from(table: &mut Table<K, V>, hash: u64, key: &K) -> Option<V> {
        if table.capacity() == 0 {
            return None;
        }

        let index = (hash as usize) & table.mask();
        let mut slot = &mut table.buckets[index];

        while let Some(entry) = slot {
            if &entry.key == key {
                let mut removed = slot.take().expect("slot just matched Some");
                *slot = removed.next.take();
                table.used -= 1;
                return Some(removed.value);
            }
            slot = &mut slot.as_mut().expect("loop guard").next;
        }

        None
    }

    /// Iterates every live entry.  While the returned iterator is
    /// alive, rehashing is paused, so the set of entries visited is
    /// exactly the set present when iteration began.
    pub fn iter(&self) -> Iter<'_, K, V, S> {
        self.nriters.set(self.nriters.get() + 1);
        Iter {
            map: self,
            table_index: 0,
            bucket_index: 0,
            cursor: None,
            started: false,
        }
    }
}

/// A live-iterator guard over a `HashMap`.  Dropping it resumes
/// incremental rehashing.
pub struct Iter<'a, K, V, S> {
    map: &'a HashMap<K, V, S>,
    table_index: usize,
    bucket_index: usize,
    cursor: Option<&'a Entry<K, V>>,
    started: bool,
}

impl<'a, K, V, S> Drop for Iter<'a, K, V, S> {
    fn drop(&mut self) {
        self.map.nriters.set(self.map.nriters.get() - 1);
    }
}

impl<'a, K, V, S> Iter<'a, K, V, S> {
    fn bucket_head(&self) -> Option<&'a Entry<K, V>> {
        let table = &self.map.tables[self.table_index];
        if self.bucket_index >= table.capacity() {
            return None;
        }
        table.buckets[self.bucket_index].as_deref()
    }
}

impl<'a, K, V, S> Iterator for Iter<'a, K, V, S> {
    type Item = (&'a K, &'a V);

    fn next(&mut self) -> Option<Self::Item> {
        if !self.started {
            self.started = true;
            self.cursor = self.bucket_head();
        } else if let Some(entry) = self.cursor {
            self.cursor = entry.next.as_deref();
        }

        while self.cursor.is_none() {
            let table = &self.map.tables[self.table_index];
            if self.bucket_index + 1 < table.capacity() {
                self.bucket_index += 1;
                self.cursor = self.bucket_head();
            } else if self.table_index == 0 && self.map.is_rehashing() {
                self.table_index = 1;
                self.bucket_index = 0;
                self.cursor = self.bucket_head();
            } else {
                return None;
            }
        }

        self.cursor.map(|entry| (&entry.key, &entry.value))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn insert_get_remove() {
        let mut m: HashMap<i32, &str> = HashMap::new();

        assert_eq!(m.insert(1, "one"), None);
        assert_eq!(m.get(&1), Some(&"one"));
        assert_eq!(m.insert(1, "uno"), Some("one"));
        assert_eq!(m.get(&1), Some(&"uno"));
        assert_eq!(m.remove(&1), Some("uno"));
        assert_eq!(m.get(&1), None);
    }

    #[test]
    fn s6_rehash_migrates_everything() {
        let mut m: HashMap<i32, i32> = HashMap::new();

        for i in 0..64 {
            m.insert(i, i * i);
        }

        assert_eq!(m.len(), 64);

        // Drive any tail of the rehash to completion with no-op
        // lookups, matching how `rehash_on_every_operation` is meant
        // to be driven.
        for _ in 0..256 {
            m.get(&0);
        }

        assert!(!m.is_rehashing());

        let mut seen: Vec<i32> = m.iter().map(|(k, _)| *k).collect();
        seen.sort_unstable();
        assert_eq!(seen, (0..64).collect::<Vec<_>>());
    }

    #[test]
    fn with_hash_fn_accepts_a_byte_level_functor() {
        // A deliberately bad hash functor (everything collides into
        // bucket 0) still has to produce correct results, just via
        // longer chains.
        let mut m: HashMap<i32, &str, _> = HashMap::with_hash_fn(|_bytes: &[u8]| 0u64);

        assert_eq!(m.insert(1, "one"), None);
        assert_eq!(m.insert(2, "two"), None);
        assert_eq!(m.get(&1), Some(&"one"));
        assert_eq!(m.get(&2), Some(&"two"));
        assert_eq!(m.remove(&1), Some("one"));
        assert_eq!(m.get(&1), None);
    }

    #[test]
    fn nrbuckets_does_not_double_count() {
        let m: HashMap<i32, i32> = HashMap::new();
        assert_eq!(m.nrbuckets(), m.tables[0].capacity());
    }

    #[test]
    fn get_or_insert_default_installs_default() {
        let mut m: HashMap<&str, i32> = HashMap::new();
        *m.get_or_insert_default("x") += 1;
        *m.get_or_insert_default("x") += 1;

        assert_eq!(m.get(&"x"), Some(&2));
    }

    #[test]
    fn iterator_pauses_rehash() {
        let mut m: HashMap<i32, i32> = HashMap::new();
        for i in 0..8 {
            m.insert(i, i);
        }

        // Force a rehash to be in progress.
        m.tables[1] = Table::with_order(m.tables[0].order + 1);
        m.rehashid = Some(0);

        let was_rehashing = m.is_rehashing();
        let count = {
            let iter = m.iter();
            // rehash_on_every_operation is never called while this
            // borrow is outstanding, so nriters alone must block it.
            iter.count()
        };

        assert_eq!(count, 8);
        assert_eq!(was_rehashing, m.is_rehashing());
    }

    proptest::proptest! {
        #[test]
        fn keys_stay_unique(ops in proptest::collection::vec((0i32..50, proptest::bool::ANY), 0..300)) {
            let mut m: HashMap<i32, i32> = HashMap::new();
            let mut model = std::collections::HashMap::new();

            for (key, insert) in ops {
                if insert {
                    let old = m.insert(key, key);
                    proptest::prop_assert_eq!(old, model.insert(key, key));
                } else {
                    let old = m.remove(&key);
                    proptest::prop_assert_eq!(old, model.remove(&key));
                }
            }

            proptest::prop_assert_eq!(m.len(), model.len());
            for (k, v) in model.iter() {
                proptest::prop_assert_eq!(m.get(k), Some(v));
            }
        }
    }
}
