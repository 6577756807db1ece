// Copyright 2026 coevict Project Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Capabilities the eviction coordinator consumes from the surrounding cache runtime.
//!
//! The coordinator never owns cache storage, membership, transport or timers. It reaches them through the traits in
//! this module, bundled together in an [`EvictionContext`].

use std::{
    fmt::Debug,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Instant,
};

use coevict_common::code::{Key, NodeId, PartitionId, TopologyVersion, Version};
use hashbrown::HashSet;
use serde::{Deserialize, Serialize};

use crate::{
    error::{SendError, StorageError},
    message::Message,
    policy::EvictionPolicy,
};

/// A read-only snapshot of a cache entry, as seen by the coordinator, the policy and the filters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryView<K> {
    /// Entry key.
    pub key: K,
    /// Current entry version.
    pub version: Version,
    /// Partition the entry belongs to.
    pub partition: PartitionId,
    /// Internal (system) entries are never evicted.
    pub internal: bool,
    /// Whether the entry is locked by any transaction.
    pub locked: bool,
    /// Whether the local copy is a backup copy.
    pub backup: bool,
    /// Whether the entry has already been marked obsolete.
    pub obsolete: bool,
    /// Remote nodes holding a near-cache copy of the entry.
    pub readers: Vec<NodeId>,
}

impl<K> EntryView<K> {
    /// Create a plain primary entry view with no readers.
    pub fn new(key: K, version: Version, partition: PartitionId) -> Self {
        Self {
            key,
            version,
            partition,
            internal: false,
            locked: false,
            backup: false,
            obsolete: false,
            readers: vec![],
        }
    }
}

/// The storage tier an eviction applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Tier {
    /// The main (primary or backup) copy.
    Main,
    /// The near-cache reader copy.
    Near,
}

/// Predicate checked by the storage atomically with the eviction.
pub type EvictGuard<'a, K> = &'a (dyn Fn(&EntryView<K>) -> bool + Send + Sync);

/// Context threaded through storage eviction.
///
/// It carries the nodes that already take part in the current request chain, so the storage never asks one of them
/// to load resources from a node that is itself waiting for the chain to finish.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestContext {
    requester: NodeId,
    visited: HashSet<NodeId>,
}

impl RequestContext {
    /// Context of an eviction initiated by the local node.
    pub fn local(node: NodeId) -> Self {
        let mut visited = HashSet::new();
        visited.insert(node);
        Self { requester: node, visited }
    }

    /// Context of an eviction requested by `from` and served by `local`.
    pub fn remote(from: NodeId, local: NodeId) -> Self {
        let mut visited = HashSet::new();
        visited.insert(from);
        visited.insert(local);
        Self {
            requester: from,
            visited,
        }
    }

    /// The node that requested the eviction.
    pub fn requester(&self) -> NodeId {
        self.requester
    }

    /// Returns `true` if `node` already takes part in the request chain.
    pub fn is_visited(&self, node: NodeId) -> bool {
        self.visited.contains(&node)
    }

    /// Nodes taking part in the request chain.
    pub fn visited(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.visited.iter().copied()
    }
}

/// Local cache storage, reduced to what the coordinator needs.
pub trait Storage<K: Key>: Send + Sync + 'static {
    /// Current number of entries held by the local node.
    fn key_count(&self) -> usize;

    /// Partition of `key`.
    fn partition(&self, key: &K) -> PartitionId;

    /// Snapshot of the entry, `None` if absent.
    fn peek(&self, key: &K) -> Option<EntryView<K>>;

    /// Evict the entry from the given tier and mark it obsolete with `obsolete`.
    ///
    /// The `guard` must be checked atomically with the removal.
    ///
    /// Returns `Ok(true)` if the entry is evicted or already absent, `Ok(false)` if it is locked or the guard refuses.
    fn evict(
        &self,
        key: &K,
        tier: Tier,
        obsolete: Version,
        guard: Option<EvictGuard<'_, K>>,
        ctx: &RequestContext,
    ) -> std::result::Result<bool, StorageError>;

    /// Forget that `node` reads the entry, unless the reader has observed a message newer than `message_id`.
    fn remove_reader(&self, key: &K, node: NodeId, message_id: u64);

    /// Entries of a local partition.
    fn entries(&self, partition: PartitionId) -> Vec<EntryView<K>>;
}

/// Cluster membership and partition ownership.
pub trait Topology: Send + Sync + 'static {
    /// The local node.
    fn local_node(&self) -> NodeId;

    /// Returns `true` if `node` is still a member of the cluster.
    fn is_alive(&self, node: NodeId) -> bool;

    /// Current topology version.
    fn version(&self) -> TopologyVersion;

    /// Acquire the shared topology lock that keeps ownership stable.
    fn read_lock(&self);

    /// Release the shared topology lock.
    ///
    /// Must be paired with a preceding [`Topology::read_lock`] on the same thread.
    fn read_unlock(&self);

    /// Owners of `partition` at topology `version`, the primary first.
    fn owners(&self, partition: PartitionId, version: TopologyVersion) -> Vec<NodeId>;

    /// Returns `true` if `node` is the primary owner of `partition`.
    fn is_primary(&self, node: NodeId, partition: PartitionId) -> bool {
        self.owners(partition, self.version()).first() == Some(&node)
    }

    /// Partitions the local node is primary for.
    fn local_partitions(&self) -> Vec<PartitionId>;
}

/// RAII guard of the shared topology lock.
pub(crate) struct TopologyReadGuard<'a> {
    topology: &'a dyn Topology,
}

impl<'a> TopologyReadGuard<'a> {
    pub(crate) fn new(topology: &'a dyn Topology) -> Self {
        topology.read_lock();
        Self { topology }
    }
}

impl Drop for TopologyReadGuard<'_> {
    fn drop(&mut self) {
        self.topology.read_unlock();
    }
}

/// Point-to-point messaging between cluster nodes.
pub trait Transport<K: Key>: Send + Sync + 'static {
    /// Send a message to `node`.
    ///
    /// A departed destination must be reported as [`SendError::Unreachable`].
    fn send(&self, node: NodeId, message: Message<K>) -> std::result::Result<(), SendError>;
}

/// Monotonic version generator.
pub trait VersionSource: Send + Sync + 'static {
    /// Produce the next version.
    fn next_version(&self) -> Version;
}

/// A process-local [`VersionSource`] backed by an atomic counter.
#[derive(Debug, Default)]
pub struct AtomicVersions {
    next: AtomicU64,
}

impl AtomicVersions {
    /// Create a generator whose first version is `start + 1`.
    pub fn new(start: u64) -> Self {
        Self {
            next: AtomicU64::new(start),
        }
    }
}

impl VersionSource for AtomicVersions {
    fn next_version(&self) -> Version {
        Version(self.next.fetch_add(1, Ordering::Relaxed) + 1)
    }
}

/// Handle of one scheduled timeout, unique within the [`TimeoutService`] that issued it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TimeoutToken(pub u64);

/// Timer scheduling.
pub trait TimeoutService: Send + Sync + 'static {
    /// Schedule `on_timeout` at `deadline` for the round `id`.
    ///
    /// A service may be shared by several coordinators, so `id` is not unique: every registration gets its own
    /// token. The callback must never run inside `add_timeout` itself.
    fn add_timeout(&self, id: u64, deadline: Instant, on_timeout: Box<dyn FnOnce() + Send>) -> TimeoutToken;

    /// Cancel the timeout registered under `token`, if still pending.
    fn remove_timeout(&self, token: TimeoutToken);
}

/// Partition rebalancing bookkeeping.
pub trait Preloader<K: Key>: Send + Sync + 'static {
    /// Returns `true` if rebalancing is enabled for the cache.
    fn is_preload_enabled(&self) -> bool;

    /// Reserve a local partition, `false` if it does not belong to the local node.
    fn reserve_partition(&self, partition: PartitionId) -> bool;

    /// Release a reserved partition.
    fn release_partition(&self, partition: PartitionId);

    /// Lock a reserved partition.
    fn lock_partition(&self, partition: PartitionId);

    /// Unlock a locked partition.
    fn unlock_partition(&self, partition: PartitionId);

    /// Returns `true` if the partition is currently being rebalanced to the local node.
    fn is_moving(&self, partition: PartitionId) -> bool;

    /// Take the global rebalancing ticket of a fully replicated cache.
    fn lock_global(&self) -> bool;

    /// Return the global rebalancing ticket.
    fn unlock_global(&self);

    /// Record an eviction that happened while the partition was being rebalanced.
    fn on_entry_evicted(&self, partition: PartitionId, key: &K, version: Version);
}

/// A [`Preloader`] for caches without rebalancing.
#[derive(Debug, Default, Clone, Copy)]
pub struct DisabledPreloader;

impl<K: Key> Preloader<K> for DisabledPreloader {
    fn is_preload_enabled(&self) -> bool {
        false
    }

    fn reserve_partition(&self, _: PartitionId) -> bool {
        false
    }

    fn release_partition(&self, _: PartitionId) {}

    fn lock_partition(&self, _: PartitionId) {}

    fn unlock_partition(&self, _: PartitionId) {}

    fn is_moving(&self, _: PartitionId) -> bool {
        false
    }

    fn lock_global(&self) -> bool {
        false
    }

    fn unlock_global(&self) {}

    fn on_entry_evicted(&self, _: PartitionId, _: &K, _: Version) {}
}

/// Every collaborator the coordinator needs.
pub struct EvictionContext<K: Key> {
    pub(crate) storage: Arc<dyn Storage<K>>,
    pub(crate) topology: Arc<dyn Topology>,
    pub(crate) transport: Arc<dyn Transport<K>>,
    pub(crate) timer: Arc<dyn TimeoutService>,
    pub(crate) policy: Arc<dyn EvictionPolicy<K>>,
    pub(crate) versions: Arc<dyn VersionSource>,
    pub(crate) preloader: Arc<dyn Preloader<K>>,
}

impl<K: Key> Debug for EvictionContext<K> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EvictionContext").finish_non_exhaustive()
    }
}

impl<K: Key> EvictionContext<K> {
    /// Bundle the required collaborators.
    ///
    /// Versions default to [`AtomicVersions`] and rebalancing defaults to [`DisabledPreloader`].
    pub fn new(
        storage: Arc<dyn Storage<K>>,
        topology: Arc<dyn Topology>,
        transport: Arc<dyn Transport<K>>,
        timer: Arc<dyn TimeoutService>,
        policy: Arc<dyn EvictionPolicy<K>>,
    ) -> Self {
        Self {
            storage,
            topology,
            transport,
            timer,
            policy,
            versions: Arc::new(AtomicVersions::default()),
            preloader: Arc::new(DisabledPreloader),
        }
    }

    /// Use the given version generator.
    pub fn with_versions(mut self, versions: Arc<dyn VersionSource>) -> Self {
        self.versions = versions;
        self
    }

    /// Use the given rebalancing bookkeeping.
    pub fn with_preloader(mut self, preloader: Arc<dyn Preloader<K>>) -> Self {
        self.preloader = preloader;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_atomic_versions() {
        let versions = AtomicVersions::new(10);
        assert_eq!(versions.next_version(), Version(11));
        assert_eq!(versions.next_version(), Version(12));
    }

    #[test]
    fn test_request_context() {
        let ctx = RequestContext::remote(NodeId(1), NodeId(2));
        assert_eq!(ctx.requester(), NodeId(1));
        assert!(ctx.is_visited(NodeId(1)));
        assert!(ctx.is_visited(NodeId(2)));
        assert!(!ctx.is_visited(NodeId(3)));

        let ctx = RequestContext::local(NodeId(7));
        assert_eq!(ctx.visited().collect::<Vec<_>>(), vec![NodeId(7)]);
    }
}
