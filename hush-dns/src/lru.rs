//! Bounded LRU slot store
//!
//! A dense slot array ordered by an index-linked doubly linked list. Slots
//! are addressed by stable indices so an external key map can point straight
//! at them; freed slots go on a free list and are reused before the array
//! grows. When the store is full, `add` recycles the least recently used
//! slot in place and hands back its previous value.

/// Sentinel for "no slot"
const NIL: usize = usize::MAX;

#[derive(Debug, Clone, Copy)]
struct Links {
    prev: usize,
    next: usize,
}

impl Links {
    fn detached() -> Self {
        Links {
            prev: NIL,
            next: NIL,
        }
    }
}

#[derive(Debug)]
struct Slot<V> {
    /// `None` marks a free slot
    value: Option<V>,
    links: Links,
}

/// Bounded store with LRU ordering and stable slot indices
#[derive(Debug)]
pub struct LruStore<V> {
    slots: Vec<Slot<V>>,
    /// Most recently used live slot
    head: usize,
    /// Least recently used live slot
    tail: usize,
    /// Head of the free list, chained through `links.next`
    free: usize,
    capacity: usize,
    len: usize,
}

impl<V> LruStore<V> {
    /// Create a store holding at most `capacity` values
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "LRU store capacity must be positive");
        LruStore {
            slots: Vec::with_capacity(capacity),
            head: NIL,
            tail: NIL,
            free: NIL,
            capacity,
            len: 0,
        }
    }

    /// Number of live values
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether the store holds no live values
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Maximum number of live values
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Insert a value at the head of the LRU order.
    ///
    /// Returns the slot index the value landed in and, when the store was at
    /// capacity, the evicted value of the recycled tail slot.
    pub fn add(&mut self, value: V) -> (usize, Option<V>) {
        if self.len == self.capacity {
            // Recycle the least recently used slot in place.
            let idx = self.tail;
            self.unlink(idx);
            let old = self.slots[idx].value.replace(value);
            self.push_head(idx);
            return (idx, old);
        }

        let idx = if self.free != NIL {
            let idx = self.free;
            self.free = self.slots[idx].links.next;
            self.slots[idx].value = Some(value);
            self.slots[idx].links = Links::detached();
            idx
        } else {
            self.slots.push(Slot {
                value: Some(value),
                links: Links::detached(),
            });
            self.slots.len() - 1
        };
        self.len += 1;
        self.push_head(idx);
        (idx, None)
    }

    /// Read the value in a slot without disturbing the LRU order.
    ///
    /// Out-of-range indices and free slots are a miss.
    pub fn get(&self, idx: usize) -> Option<&V> {
        self.slots.get(idx).and_then(|slot| slot.value.as_ref())
    }

    /// Remove the value in a slot, pushing the slot onto the free list
    pub fn delete(&mut self, idx: usize) -> Option<V> {
        if idx >= self.slots.len() || self.slots[idx].value.is_none() {
            return None;
        }
        self.unlink(idx);
        let value = self.slots[idx].value.take();
        self.push_free(idx);
        self.len -= 1;
        value
    }

    /// Remove every value matching the predicate, preserving the order of
    /// the survivors. Returns the removed values in slot-index order.
    pub fn purge<F>(&mut self, mut should_delete: F) -> Vec<V>
    where
        F: FnMut(&V) -> bool,
    {
        let mut purged = Vec::new();
        for idx in 0..self.slots.len() {
            let matched = match self.slots[idx].value.as_ref() {
                Some(value) => should_delete(value),
                None => false,
            };
            if matched {
                self.unlink(idx);
                purged.push(self.slots[idx].value.take().expect("slot was live"));
                self.push_free(idx);
            }
        }
        self.len -= purged.len();
        purged
    }

    /// Drop every value. Returns how many were live.
    pub fn flush(&mut self) -> usize {
        let flushed = self.len;
        self.slots.clear();
        self.head = NIL;
        self.tail = NIL;
        self.free = NIL;
        self.len = 0;
        flushed
    }

    /// Rewrite slot indices so live slots occupy `[0, len)` in LRU order,
    /// most recent first. `visit` is invoked once per live slot with its new
    /// index so external key maps can be rebuilt.
    pub fn compact_and_sort<F>(&mut self, mut visit: F)
    where
        F: FnMut(usize, &V),
    {
        let mut ordered = Vec::with_capacity(self.len);
        let mut cursor = self.head;
        while cursor != NIL {
            ordered.push(self.slots[cursor].value.take().expect("linked slot is live"));
            cursor = self.slots[cursor].links.next;
        }

        self.slots.clear();
        self.head = NIL;
        self.tail = NIL;
        self.free = NIL;
        let count = ordered.len();
        for (idx, value) in ordered.into_iter().enumerate() {
            visit(idx, &value);
            self.slots.push(Slot {
                value: Some(value),
                links: Links {
                    prev: if idx == 0 { NIL } else { idx - 1 },
                    next: if idx + 1 == count { NIL } else { idx + 1 },
                },
            });
        }
        if count > 0 {
            self.head = 0;
            self.tail = count - 1;
        }
        self.len = count;
    }

    fn unlink(&mut self, idx: usize) {
        let Links { prev, next } = self.slots[idx].links;
        if prev != NIL {
            self.slots[prev].links.next = next;
        } else {
            self.head = next;
        }
        if next != NIL {
            self.slots[next].links.prev = prev;
        } else {
            self.tail = prev;
        }
        self.slots[idx].links = Links::detached();
    }

    fn push_head(&mut self, idx: usize) {
        self.slots[idx].links = Links {
            prev: NIL,
            next: self.head,
        };
        if self.head != NIL {
            self.slots[self.head].links.prev = idx;
        } else {
            self.tail = idx;
        }
        self.head = idx;
    }

    fn push_free(&mut self, idx: usize) {
        self.slots[idx].links = Links {
            prev: NIL,
            next: self.free,
        };
        self.free = idx;
    }

    #[cfg(test)]
    fn order(&self) -> Vec<usize> {
        let mut indices = Vec::new();
        let mut cursor = self.head;
        while cursor != NIL {
            indices.push(cursor);
            cursor = self.slots[cursor].links.next;
        }
        indices
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_add_and_get() {
        let mut store = LruStore::new(4);
        let (idx, evicted) = store.add("a");
        assert!(evicted.is_none());
        assert_eq!(store.get(idx), Some(&"a"));
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_get_invalid_index_is_miss() {
        let store: LruStore<u32> = LruStore::new(2);
        assert!(store.get(0).is_none());
        assert!(store.get(usize::MAX).is_none());
    }

    #[test]
    fn test_add_evicts_lru_at_capacity() {
        let mut store = LruStore::new(2);
        let (a_idx, _) = store.add("a");
        store.add("b");

        // "a" is the least recently used; its slot must be recycled.
        let (idx, evicted) = store.add("c");
        assert_eq!(idx, a_idx);
        assert_eq!(evicted, Some("a"));
        assert_eq!(store.get(idx), Some(&"c"));
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn test_delete_and_slot_reuse() {
        let mut store = LruStore::new(3);
        let (a_idx, _) = store.add("a");
        store.add("b");

        assert_eq!(store.delete(a_idx), Some("a"));
        assert_eq!(store.len(), 1);
        assert!(store.get(a_idx).is_none());
        assert!(store.delete(a_idx).is_none());

        // The freed slot is reused before the array grows.
        let (idx, evicted) = store.add("c");
        assert_eq!(idx, a_idx);
        assert!(evicted.is_none());
    }

    #[test]
    fn test_lru_order_most_recent_first() {
        let mut store = LruStore::new(4);
        let (a, _) = store.add("a");
        let (b, _) = store.add("b");
        let (c, _) = store.add("c");
        assert_eq!(store.order(), vec![c, b, a]);
    }

    #[test]
    fn test_purge_preserves_survivor_order() {
        let mut store = LruStore::new(8);
        let (a, _) = store.add(1);
        store.add(2);
        let (c, _) = store.add(3);
        store.add(4);

        let purged = store.purge(|v| v % 2 == 0);
        assert_eq!(purged, vec![2, 4]);
        assert_eq!(store.len(), 2);
        assert_eq!(store.order(), vec![c, a]);
    }

    #[test]
    fn test_flush() {
        let mut store = LruStore::new(4);
        store.add("a");
        store.add("b");
        assert_eq!(store.flush(), 2);
        assert!(store.is_empty());
        let (idx, evicted) = store.add("c");
        assert_eq!(idx, 0);
        assert!(evicted.is_none());
    }

    #[test]
    fn test_compact_and_sort_renumbers_in_lru_order() {
        let mut store = LruStore::new(8);
        let (a, _) = store.add("a");
        store.add("b");
        store.add("c");
        store.add("d");
        store.delete(a);
        store.purge(|v| *v == "c");

        let mut visited = Vec::new();
        store.compact_and_sort(|idx, value| visited.push((idx, value.to_string())));

        // Live slots are renumbered [0, len) most recent first: d then b.
        assert_eq!(visited, vec![(0, "d".to_string()), (1, "b".to_string())]);
        assert_eq!(store.order(), vec![0, 1]);
        assert_eq!(store.get(0), Some(&"d"));
        assert_eq!(store.get(1), Some(&"b"));
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn test_compact_then_add_reuses_prefix() {
        let mut store = LruStore::new(4);
        let (a, _) = store.add("a");
        store.add("b");
        store.delete(a);
        store.compact_and_sort(|_, _| {});

        let (idx, evicted) = store.add("c");
        assert_eq!(idx, 1);
        assert!(evicted.is_none());
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn test_eviction_cycles_through_all_slots() {
        let mut store = LruStore::new(3);
        for i in 0..3 {
            store.add(i);
        }
        // Each further add recycles the current tail.
        for i in 3..9 {
            let (_, evicted) = store.add(i);
            assert_eq!(evicted, Some(i - 3));
        }
        assert_eq!(store.len(), 3);
    }
}
