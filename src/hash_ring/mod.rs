//! Hash ring types that define which node is responsible for a key.
//!
//! There is one [`GlobalHashRing`] (nodes) and one [`LocalHashRing`] (threads within a node)
//! per storage tier. The monitoring node keeps all of them in one [`HashRings`] value, which is
//! shared through [`SharedHashRings`] so that membership changes replace the whole set of rings
//! at once.

use self::consistent_hash_map::{ConsistentHashMap, VirtualNode, VirtualThread};
use crate::{
    messages::Tier,
    metadata::MetadataKey,
    topics::{KvsThread, NodeAddress},
    ClientKey, Key, ALL_TIERS,
};
use arc_swap::ArcSwap;
use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
};

mod consistent_hash_map;

/// Defines the maximum number of servers that should be returned from `responsible_servers`
/// for a metadata key.
const METADATA_REPLICATION_FACTOR: usize = 1;

/// Sets the number of virtual entries that should be created per node/thread in hash rings.
///
/// The virtual nodes/threads are spread uniformly across the hash ring using consistent
/// hashing. This way keys are uniformly distributed across nodes/nodes even if the keys are
/// not uniformly distributed.
const VIRTUAL_ENTRY_NUM: u32 = 3000;

/// Determines which nodes are responsible for each key.
///
/// Uses a consistent hash map and virtual nodes to spread keys uniformly across nodes.
#[derive(Default, Clone)]
pub struct GlobalHashRing {
    consistent_hash_map: ConsistentHashMap<VirtualNode>,
    unique_nodes: HashSet<NodeAddress>,
    node_join_count: HashMap<NodeAddress, u32>,
}

impl GlobalHashRing {
    /// Inserts the given node into the ring.
    ///
    /// Returns `true` if the node was not present in the ring before, or if the `join_count`
    /// of the previous entry is lower than the new `join_count`.
    pub fn insert_node(&mut self, node: NodeAddress, join_count: u32) -> bool {
        if self.unique_nodes.contains(&node) {
            // if we already have the server, only return true if it's rejoining
            let entry = self.node_join_count.entry(node).or_default();
            if *entry < join_count {
                *entry = join_count;
                true
            } else {
                false
            }
        } else {
            // otherwise, insert it into the hash ring for the first time
            self.unique_nodes.insert(node.clone());
            self.node_join_count.insert(node.clone(), join_count);

            for virtual_num in 0..VIRTUAL_ENTRY_NUM {
                self.consistent_hash_map
                    .insert(VirtualNode::new(node.clone(), virtual_num));
            }

            true
        }
    }

    /// Removes the given node from the ring (including all corresponding virtual nodes).
    pub fn remove_node(&mut self, node: &NodeAddress) {
        for virtual_num in 0..VIRTUAL_ENTRY_NUM {
            self.consistent_hash_map
                .remove(&VirtualNode::new(node.clone(), virtual_num));
        }

        self.unique_nodes.remove(node);
        self.node_join_count.remove(node);
    }

    /// Returns the full set of nodes that are stored in this ring.
    pub fn unique_nodes(&self) -> &HashSet<NodeAddress> {
        &self.unique_nodes
    }

    /// Returns the stored nodes in a stable order.
    pub fn sorted_nodes(&self) -> Vec<NodeAddress> {
        let mut nodes: Vec<_> = self.unique_nodes.iter().cloned().collect();
        nodes.sort();
        nodes
    }

    /// Returns the total number of _virtual_ nodes in the ring.
    ///
    /// Each node is represented by several virtual nodes in the ring to ensure that keys
    /// are uniformly spread across nodes. For this reason, the length returned from this
    /// function will be significantly larger than the size of the set returned by
    /// [`Self::unique_nodes`].
    pub fn len(&self) -> usize {
        self.consistent_hash_map.len()
    }

    /// Returns true if the ring is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns the nodes responsible for the given key, in clockwise ring order.
    ///
    /// The result contains every node at most once. If the ring holds fewer than
    /// `global_rep` nodes, all of them are returned.
    pub fn responsible_nodes(&self, key: &Key, global_rep: usize) -> Vec<&NodeAddress> {
        let mut responsible = Vec::new();
        if global_rep == 0 {
            return responsible;
        }

        let mut seen = HashSet::new();
        for virtual_node in self.consistent_hash_map.entries_starting_at(key) {
            if seen.insert(virtual_node.node()) {
                responsible.push(virtual_node.node());
                if responsible.len() >= global_rep {
                    break;
                }
            }
        }

        responsible
    }
}

/// Determines which worker threads within a node are responsible for each key.
///
/// Uses a consistent hash map and virtual nodes to spread keys uniformly across threads.
#[derive(Default, Clone)]
pub struct LocalHashRing {
    consistent_hash_map: ConsistentHashMap<VirtualThread>,
}

impl LocalHashRing {
    /// Inserts the given thread ID to the ring.
    pub fn insert_thread(&mut self, thread_id: u32) {
        for virtual_num in 0..VIRTUAL_ENTRY_NUM {
            self.consistent_hash_map
                .insert(VirtualThread::new(thread_id, virtual_num));
        }
    }

    /// Returns the thread IDs responsible for the given key, in clockwise ring order.
    pub fn responsible_threads(&self, key: &Key, local_rep: usize) -> Vec<u32> {
        let mut thread_ids = Vec::new();
        if local_rep == 0 {
            return thread_ids;
        }

        for thread in self.consistent_hash_map.entries_starting_at(key) {
            if !thread_ids.contains(&thread.thread_id()) {
                thread_ids.push(thread.thread_id());
                if thread_ids.len() >= local_rep {
                    break;
                }
            }
        }
        thread_ids
    }
}

/// The global and local rings of all storage tiers.
#[derive(Default, Clone)]
pub struct HashRings {
    global: HashMap<Tier, GlobalHashRing>,
    local: HashMap<Tier, LocalHashRing>,
}

impl HashRings {
    /// Creates empty global rings and local rings with the given number of threads per tier.
    pub fn new(thread_counts: impl IntoIterator<Item = (Tier, u32)>) -> Self {
        let mut rings = Self::default();
        for (tier, threads) in thread_counts {
            rings.global.insert(tier, GlobalHashRing::default());
            let local = rings.local.entry(tier).or_default();
            for thread_id in 0..threads {
                local.insert_thread(thread_id);
            }
        }
        rings
    }

    /// Returns the global ring of the given tier, if it exists.
    pub fn global(&self, tier: Tier) -> Option<&GlobalHashRing> {
        self.global.get(&tier)
    }

    /// Returns the global ring of the given tier, creating an empty ring if necessary.
    pub fn global_mut(&mut self, tier: Tier) -> &mut GlobalHashRing {
        self.global.entry(tier).or_default()
    }

    /// Returns the local ring of the given tier, if it exists.
    pub fn local(&self, tier: Tier) -> Option<&LocalHashRing> {
        self.local.get(&tier)
    }

    /// Returns the number of distinct nodes in the given tier.
    pub fn node_count(&self, tier: Tier) -> usize {
        self.global(tier)
            .map(|ring| ring.unique_nodes().len())
            .unwrap_or_default()
    }

    /// Returns up to `replica_count` distinct owners of `key` in the given tier.
    pub fn route(&self, key: &Key, tier: Tier, replica_count: usize) -> Vec<NodeAddress> {
        self.global(tier)
            .map(|ring| {
                ring.responsible_nodes(key, replica_count)
                    .into_iter()
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Returns the [`KvsThread`]s that are responsible for the given key.
    ///
    /// Reads the responsible nodes from the tier's global ring using the `global_replication`
    /// factor and the responsible thread IDs from the tier's local ring using the
    /// `local_replication` factor. Returns the
    /// [cartesian product](https://en.wikipedia.org/wiki/Cartesian_product) of these two sets,
    /// i.e. all combinations of node and thread id.
    pub fn responsible_threads(
        &self,
        key: &Key,
        tier: Tier,
        global_replication: usize,
        local_replication: usize,
    ) -> Vec<KvsThread> {
        let nodes = self.route(key, tier, global_replication);
        let thread_ids = self
            .local(tier)
            .map(|ring| ring.responsible_threads(key, local_replication))
            .unwrap_or_default();

        let mut result = Vec::new();
        for node in nodes {
            for &thread_id in &thread_ids {
                result.push(KvsThread::new(node.clone(), thread_id));
            }
        }
        result
    }

    /// Returns the responsible threads for the given metadata key.
    ///
    /// Metadata is always stored in the memory tier.
    pub fn metadata_threads(&self, key: &MetadataKey, local_replication: usize) -> Vec<KvsThread> {
        self.responsible_threads(
            &key.clone().into(),
            Tier::Memory,
            METADATA_REPLICATION_FACTOR,
            local_replication,
        )
    }

    /// Returns the nodes of all storage tiers that store `key` under the given replication.
    pub fn key_owners(&self, key: &ClientKey, replication: &KeyReplication) -> Vec<NodeAddress> {
        let key: Key = key.into();
        let mut owners = Vec::new();
        for &tier in ALL_TIERS {
            for node in self.route(&key, tier, replication.global(tier)) {
                if !owners.contains(&node) {
                    owners.push(node);
                }
            }
        }
        owners
    }
}

/// Publishes [`HashRings`] snapshots.
///
/// Readers [`load`][Self::load] an immutable snapshot; membership changes build a modified copy
/// and swap it in as a whole, so a routing decision never sees a half-applied change. The
/// monitoring node is the only writer.
#[derive(Clone, Default)]
pub struct SharedHashRings {
    current: Arc<ArcSwap<HashRings>>,
}

impl SharedHashRings {
    /// Publishes the given rings as the initial snapshot.
    pub fn new(rings: HashRings) -> Self {
        Self {
            current: Arc::new(ArcSwap::from_pointee(rings)),
        }
    }

    /// Returns the current snapshot.
    pub fn load(&self) -> Arc<HashRings> {
        self.current.load_full()
    }

    /// Applies `f` to a copy of the current rings and publishes the result.
    pub fn update<R>(&self, f: impl FnOnce(&mut HashRings) -> R) -> R {
        let mut next = HashRings::clone(&self.current.load());
        let result = f(&mut next);
        self.current.store(Arc::new(next));
        result
    }
}

/// Keeps track of the global and local replication factors for each tier.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct KeyReplication {
    /// Replication factor for the [`GlobalHashRing`], i.e. the number of nodes that each
    /// key should be stored on.
    pub global_replication: HashMap<Tier, usize>,
    /// Replication factor for the [`LocalHashRing`], i.e. the number of threads per node
    /// that each key should be stored on.
    pub local_replication: HashMap<Tier, usize>,
}

impl KeyReplication {
    /// Utility constructor function for creating a key replication with memory and
    /// disk replication factors.
    pub fn create_new(
        global_memory: usize,
        global_disk: usize,
        local_memory: usize,
        local_disk: usize,
    ) -> Self {
        Self {
            global_replication: [(Tier::Memory, global_memory), (Tier::Disk, global_disk)]
                .iter()
                .copied()
                .collect(),
            local_replication: [(Tier::Memory, local_memory), (Tier::Disk, local_disk)]
                .iter()
                .copied()
                .collect(),
        }
    }

    /// The number of nodes of the given tier that store the key.
    pub fn global(&self, tier: Tier) -> usize {
        self.global_replication
            .get(&tier)
            .copied()
            .unwrap_or_default()
    }

    /// The number of threads per node of the given tier that store the key.
    pub fn local(&self, tier: Tier) -> usize {
        self.local_replication
            .get(&tier)
            .copied()
            .unwrap_or_default()
    }
}

/// Convert the given [`Tier`] to an uppercase string, e.g. `MEMORY`.
pub fn tier_name(tier: Tier) -> &'static str {
    match tier {
        Tier::Memory => "MEMORY",
        Tier::Disk => "DISK",
        Tier::Routing => "ROUTING",
    }
}
