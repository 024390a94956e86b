use crate::topics::NodeAddress;
use std::{
    collections::{hash_map::DefaultHasher, BTreeMap},
    hash::{Hash, Hasher},
};

/// Ring positions ordered by hash value.
///
/// Iteration always starts at a key's hash and walks clockwise, wrapping around at the end.
#[derive(Clone)]
pub struct ConsistentHashMap<T> {
    nodes: BTreeMap<u64, T>,
}

impl<T> ConsistentHashMap<T>
where
    T: Hash,
{
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn insert(&mut self, node: T) {
        self.nodes.insert(hash(&node), node);
    }

    pub fn remove(&mut self, node: &T) {
        self.nodes.remove(&hash(node));
    }

    /// Returns an iterator over the map's entries, starting at the hash of the given key.
    pub fn entries_starting_at<K: Hash + ?Sized>(&self, key: &K) -> impl Iterator<Item = &T> {
        let hash = hash(key);
        self.nodes
            .range(hash..)
            .chain(self.nodes.range(..hash))
            .map(|(_k, v)| v)
    }
}

impl<T> Default for ConsistentHashMap<T> {
    fn default() -> Self {
        Self {
            nodes: Default::default(),
        }
    }
}

fn hash<T: Hash + ?Sized>(data: &T) -> u64 {
    let mut hasher = DefaultHasher::new();
    data.hash(&mut hasher);
    hasher.finish()
}

#[derive(Clone, PartialEq, Eq, Hash)]
pub struct VirtualNode {
    node: NodeAddress,
    virtual_id: u32,
}

impl VirtualNode {
    pub fn new(node: NodeAddress, virtual_id: u32) -> Self {
        Self { node, virtual_id }
    }

    /// Gets the node that this virtual node belongs to.
    pub fn node(&self) -> &NodeAddress {
        &self.node
    }
}

#[derive(Clone, PartialEq, Eq, Hash)]
pub struct VirtualThread {
    thread_id: u32,
    virtual_id: u32,
}

impl VirtualThread {
    pub fn new(thread_id: u32, virtual_id: u32) -> Self {
        Self {
            thread_id,
            virtual_id,
        }
    }

    /// Get the virtual thread's thread id.
    pub fn thread_id(&self) -> u32 {
        self.thread_id
    }
}
