//! An arena-backed LRU list with O(1) lookup, promotion and removal.
//!
//! Entries live in a `Vec` arena and are threaded onto one of several intrusive doubly-linked
//! lists, one per class. The memory tier uses one class per [`Priority`](crate::types::Priority),
//! the disk tier uses a single class. Within a class, the head is the most recently used entry
//! and the tail the least recently used one.

use std::collections::HashMap;
use std::hash::Hash;

#[derive(Debug)]
struct Node<K, V> {
    entry: Option<(K, V)>,
    class: usize,
    prev: Option<usize>,
    next: Option<usize>,
}

#[derive(Debug, Clone, Copy, Default)]
struct Links {
    head: Option<usize>,
    tail: Option<usize>,
    len: usize,
}

#[derive(Debug)]
pub struct LruList<K, V> {
    nodes: Vec<Node<K, V>>,
    free: Vec<usize>,
    index: HashMap<K, usize>,
    lists: Vec<Links>,
}

impl<K: Hash + Eq + Clone, V> LruList<K, V> {
    /// Creates an empty list with `classes` independent recency lists.
    pub fn new(classes: usize) -> Self {
        Self {
            nodes: Vec::new(),
            free: Vec::new(),
            index: HashMap::new(),
            lists: vec![Links::default(); classes.max(1)],
        }
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    /// The number of entries in the given class.
    pub fn class_len(&self, class: usize) -> usize {
        self.lists.get(class).map_or(0, |l| l.len)
    }

    pub fn contains(&self, key: &K) -> bool {
        self.index.contains_key(key)
    }

    /// Returns the class an entry is linked into.
    pub fn class_of(&self, key: &K) -> Option<usize> {
        let idx = *self.index.get(key)?;
        Some(self.nodes[idx].class)
    }

    /// Looks up an entry without changing its recency.
    pub fn peek(&self, key: &K) -> Option<&V> {
        let idx = *self.index.get(key)?;
        self.nodes[idx].entry.as_ref().map(|(_, v)| v)
    }

    /// Looks up an entry and marks it as most recently used within its class.
    pub fn get(&mut self, key: &K) -> Option<&mut V> {
        let idx = *self.index.get(key)?;
        self.unlink(idx);
        self.push_front(idx);
        self.nodes[idx].entry.as_mut().map(|(_, v)| v)
    }

    /// Inserts an entry as the most recently used one of `class`.
    ///
    /// Returns the previous value if the key was already present.
    pub fn insert(&mut self, key: K, value: V, class: usize) -> Option<V> {
        let class = class.min(self.lists.len() - 1);
        let previous = self.remove(&key);

        let node = Node {
            entry: Some((key.clone(), value)),
            class,
            prev: None,
            next: None,
        };
        let idx = match self.free.pop() {
            Some(idx) => {
                self.nodes[idx] = node;
                idx
            }
            None => {
                self.nodes.push(node);
                self.nodes.len() - 1
            }
        };
        self.index.insert(key, idx);
        self.push_front(idx);

        previous
    }

    /// Moves an entry to another class, as its most recently used entry.
    pub fn set_class(&mut self, key: &K, class: usize) -> bool {
        let Some(&idx) = self.index.get(key) else {
            return false;
        };
        self.unlink(idx);
        self.nodes[idx].class = class.min(self.lists.len() - 1);
        self.push_front(idx);
        true
    }

    pub fn remove(&mut self, key: &K) -> Option<V> {
        let idx = self.index.remove(key)?;
        self.release(idx).map(|(_, v)| v)
    }

    /// The least recently used key of the given class.
    pub fn peek_lru(&self, class: usize) -> Option<&K> {
        let idx = self.lists.get(class)?.tail?;
        self.nodes[idx].entry.as_ref().map(|(k, _)| k)
    }

    /// Removes and returns the least recently used entry of the given class.
    pub fn pop_lru(&mut self, class: usize) -> Option<(K, V)> {
        let idx = self.lists.get(class)?.tail?;
        let entry = self.release(idx)?;
        self.index.remove(&entry.0);
        Some(entry)
    }

    /// Iterates over the entries of a class, from least to most recently used.
    pub fn iter_lru(&self, class: usize) -> impl Iterator<Item = (&K, &V)> + '_ {
        let mut cursor = self.lists.get(class).and_then(|l| l.tail);
        std::iter::from_fn(move || {
            let node = &self.nodes[cursor?];
            cursor = node.prev;
            node.entry.as_ref().map(|(k, v)| (k, v))
        })
    }

    pub fn clear(&mut self) {
        self.nodes.clear();
        self.free.clear();
        self.index.clear();
        for links in &mut self.lists {
            *links = Links::default();
        }
    }

    fn release(&mut self, idx: usize) -> Option<(K, V)> {
        self.unlink(idx);
        self.free.push(idx);
        self.nodes[idx].entry.take()
    }

    fn unlink(&mut self, idx: usize) {
        let Node {
            prev, next, class, ..
        } = self.nodes[idx];

        match prev {
            Some(prev) => self.nodes[prev].next = next,
            None => self.lists[class].head = next,
        }
        match next {
            Some(next) => self.nodes[next].prev = prev,
            None => self.lists[class].tail = prev,
        }
        self.lists[class].len -= 1;

        let node = &mut self.nodes[idx];
        node.prev = None;
        node.next = None;
    }

    fn push_front(&mut self, idx: usize) {
        let class = self.nodes[idx].class;
        let old_head = self.lists[class].head;

        {
            let node = &mut self.nodes[idx];
            node.prev = None;
            node.next = old_head;
        }
        match old_head {
            Some(head) => self.nodes[head].prev = Some(idx),
            None => self.lists[class].tail = Some(idx),
        }

        let links = &mut self.lists[class];
        links.head = Some(idx);
        links.len += 1;
    }
}
